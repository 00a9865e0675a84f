//! EBNF parsing through the public API: canonical rendering, builder
//! equivalence and error reporting.

use pie_grammar::grammar::builder::GrammarBuilder;
use pie_grammar::{ErrorKind, Grammar};

use crate::common::accepts;

fn render(input: &str) -> String {
    Grammar::from_ebnf(input, "root").unwrap().to_string()
}

#[test]
fn test_rendering_reparses_to_same_language() {
    let cases: [(&str, &[&str], &[&str]); 4] = [
        (r#"root ::= "a" | "b" "c""#, &["a", "bc"], &["b", "ac"]),
        ("root ::= [a-z]* digit+\ndigit ::= [0-9]", &["ab12", "7"], &["ab", "1a"]),
        (r#"root ::= "x"{2,3} ("y" | "z")?"#, &["xx", "xxxz"], &["x", "xxxxy"]),
        ("root ::= item (\",\" item)*\nitem ::= [^,\\n]+", &["a,b", "ab"], &["a,", ",b"]),
    ];
    for (source, good, bad) in cases {
        let rendered = render(source);
        assert_eq!(render(&rendered), rendered);
        let reparsed = Grammar::from_ebnf(&rendered, "root").unwrap();
        for input in good {
            assert!(accepts(&reparsed, input), "{} should accept {:?}", rendered, input);
        }
        for input in bad {
            assert!(!accepts(&reparsed, input), "{} should reject {:?}", rendered, input);
        }
    }
}

#[test]
fn test_rendering_is_a_fixed_point() {
    let source = "root ::= [^\\]a-z] \"\\x00\\n\" x{2,5}\nx ::= \"\u{e9}\" | [\\u4e00-\\u9fff]*";
    let once = render(source);
    assert_eq!(once, "root ::= ([^\\]a-z] \"\\x00\\n\" x{2,5})\nx ::= (\"\u{e9}\" | [\\u4e00-\\u9fff]*)");
    let twice = render(&once);
    assert_eq!(twice, once);
    assert_eq!(render(&twice), once);
}

#[test]
fn test_builder_matches_parser() {
    let mut b = GrammarBuilder::new();
    let root = b.add_rule("root");
    let hello = b.add_byte_string(b"hello");
    let world = b.add_byte_string(b"world");
    let seq_a = b.add_sequence(vec![hello]);
    let seq_b = b.add_sequence(vec![world]);
    let body = b.add_choices(vec![seq_a, seq_b]);
    b.set_rule_body(root, body);
    let built = b.build("root").unwrap();

    assert_eq!(built.to_string(), render(r#"root ::= "hello" | "world""#));
}

#[test]
fn test_builder_missing_root() {
    let mut b = GrammarBuilder::new();
    let rule = b.add_rule("start");
    let body = b.add_empty_string();
    b.set_rule_body(rule, body);
    assert_eq!(b.build("root").unwrap_err().kind(), ErrorKind::Runtime);
}

#[test]
fn test_custom_root_name() {
    let g = Grammar::from_ebnf("main ::= \"a\" other\nother ::= \"b\"", "main").unwrap();
    assert_eq!(g.root().name, "main");
    assert_eq!(g.num_rules(), 2);
    assert!(g.find_rule("other").is_some());
}

#[test]
fn test_parse_errors_carry_position() {
    let cases = [
        ("root ::= \"a\" |", "line 1"),
        ("root ::= \"a\"\nnext ::= (\"b\"", "line 2"),
        ("root ::= [a-", "line 1"),
    ];
    for (source, position) in cases {
        let e = Grammar::from_ebnf(source, "root").unwrap_err();
        assert_eq!(e.kind(), ErrorKind::Parse, "{}", source);
        let message = e.to_string();
        assert!(message.starts_with("EBNF"), "{}", message);
        assert!(message.contains(position), "{}", message);
    }
}

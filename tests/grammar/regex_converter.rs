//! Regex to EBNF conversion through the public API.

use pie_grammar::regex::{regex_to_ebnf, regex_to_grammar};
use pie_grammar::{ErrorKind, Grammar};

#[test]
fn test_output_is_a_root_rule() {
    let ebnf = regex_to_ebnf("[a-z]+@[a-z]+\\.com").unwrap();
    assert!(ebnf.starts_with("root ::= "));
    assert!(ebnf.ends_with('\n'));
    assert_eq!(ebnf.lines().count(), 1);
    let g = Grammar::from_ebnf(&ebnf, "root").unwrap();
    assert_eq!(g.root().name, "root");
}

#[test]
fn test_bounded_quantifier_is_kept() {
    assert_eq!(regex_to_ebnf("a{2,4}").unwrap(), "root ::= \"a\"{2,4}\n");
}

#[test]
fn test_errors_report_position() {
    let e = regex_to_grammar("ab(?=c)").unwrap_err();
    assert_eq!(e.kind(), ErrorKind::Parse);
    assert!(e.to_string().starts_with("regex error at position"), "{}", e);

    let e = Grammar::from_regex("[a-").unwrap_err();
    assert_eq!(e.kind(), ErrorKind::Parse);
}

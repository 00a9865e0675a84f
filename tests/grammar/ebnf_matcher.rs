//! Acceptance of strings by EBNF grammars.

use pie_grammar::Grammar;

use crate::common::{accepts, ebnf_accepts};

#[test]
fn test_literal_sequence() {
    let g = r#"root ::= "hello" " " "world""#;
    assert!(ebnf_accepts(g, "hello world"));
    assert!(!ebnf_accepts(g, "hello"));
    assert!(!ebnf_accepts(g, "hello world!"));
}

#[test]
fn test_bounded_repetition() {
    let g = r#"root ::= "a"{2,4}"#;
    assert!(!ebnf_accepts(g, ""));
    assert!(!ebnf_accepts(g, "a"));
    assert!(ebnf_accepts(g, "aa"));
    assert!(ebnf_accepts(g, "aaa"));
    assert!(ebnf_accepts(g, "aaaa"));
    assert!(!ebnf_accepts(g, "aaaaa"));
}

#[test]
fn test_star_plus_question() {
    assert!(ebnf_accepts(r#"root ::= "a"* "b""#, "b"));
    assert!(ebnf_accepts(r#"root ::= "a"* "b""#, "aaab"));
    assert!(!ebnf_accepts(r#"root ::= "a"+ "b""#, "b"));
    assert!(ebnf_accepts(r#"root ::= "a"+ "b""#, "ab"));
    assert!(ebnf_accepts(r#"root ::= "a"? "b""#, "ab"));
    assert!(!ebnf_accepts(r#"root ::= "a"? "b""#, "aab"));
}

#[test]
fn test_balanced_parentheses() {
    let g = r#"root ::= "(" root ")" | """#;
    assert!(ebnf_accepts(g, ""));
    assert!(ebnf_accepts(g, "()"));
    assert!(ebnf_accepts(g, "((()))"));
    assert!(!ebnf_accepts(g, "(()"));
    assert!(!ebnf_accepts(g, ")("));
}

#[test]
fn test_expression_grammar() {
    let g = "root ::= expr\nexpr ::= term (\"+\" term)*\nterm ::= [0-9]+ | \"(\" expr \")\"";
    assert!(ebnf_accepts(g, "1+23+4"));
    assert!(ebnf_accepts(g, "(1+2)+3"));
    assert!(!ebnf_accepts(g, "1+"));
    assert!(!ebnf_accepts(g, "+1"));
    assert!(!ebnf_accepts(g, "(1+2"));
}

#[test]
fn test_left_recursion() {
    let g = r#"root ::= root "a" | "b""#;
    assert!(ebnf_accepts(g, "b"));
    assert!(ebnf_accepts(g, "baaa"));
    assert!(!ebnf_accepts(g, "ab"));
}

#[test]
fn test_empty_matching_cycle() {
    let g = "root ::= a\na ::= b | \"x\"\nb ::= a | \"\"";
    assert!(ebnf_accepts(g, ""));
    assert!(ebnf_accepts(g, "x"));
    assert!(!ebnf_accepts(g, "xx"));
}

#[test]
fn test_negated_class_star() {
    let g = r#"root ::= "\"" [^"]* "\"""#;
    assert!(ebnf_accepts(g, "\"\""));
    assert!(ebnf_accepts(g, "\"hello, wörld\""));
    assert!(!ebnf_accepts(g, "\"a\"b\""));
}

#[test]
fn test_unicode_classes() {
    let g = "root ::= [α-ω]+ [一-龥]";
    assert!(ebnf_accepts(g, "αβγ中"));
    assert!(!ebnf_accepts(g, "abc中"));
    assert!(!ebnf_accepts(g, "αβγ"));
}

#[test]
fn test_lookahead_does_not_restrict() {
    let g = "root ::= a \"b\"\na ::= \"a\" (= \"b\")";
    assert!(ebnf_accepts(g, "ab"));
    assert!(!ebnf_accepts(g, "a"));
}

#[test]
fn test_union_and_concat() {
    let a = Grammar::from_ebnf(r#"root ::= "a""#, "root").unwrap();
    let b = Grammar::from_ebnf(r#"root ::= "b""#, "root").unwrap();

    let union = Grammar::union(&[a.clone(), b.clone()]).unwrap();
    assert!(accepts(&union, "a"));
    assert!(accepts(&union, "b"));
    assert!(!accepts(&union, "ab"));

    let concat = Grammar::concat(&[a, b]).unwrap();
    assert!(accepts(&concat, "ab"));
    assert!(!accepts(&concat, "a"));
    assert!(!accepts(&concat, "ba"));
}

#[test]
fn test_optimized_grammar_accepts_same_strings() {
    let g = Grammar::from_ebnf(
        "root ::= greeting name\ngreeting ::= \"hi \" | \"hello \"\nname ::= [A-Z] [a-z]*\nunused ::= \"x\"",
        "root",
    )
    .unwrap();
    let optimized = g.optimize();
    assert!(optimized.num_rules() < g.num_rules());
    for input in ["hi Bob", "hello Alice"] {
        assert!(accepts(&g, input));
        assert!(accepts(&optimized, input));
    }
    assert!(!accepts(&optimized, "hey Bob"));
}

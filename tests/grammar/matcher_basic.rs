//! Matcher operations: token acceptance, bitmask, rollback, jump-forward,
//! reset, termination.

use std::sync::Arc;

use pie_grammar::bitmask::{allocate_token_bitmask, get_bit, get_bitmask_shape};
use pie_grammar::{
    ErrorKind, Grammar, GrammarCompiler, GrammarMatcher, MatcherOptions, TokenizerInfo, TokenizerInfoOptions,
    VocabType,
};

use crate::common::{allowed_tokens, compile, make_ebnf_matcher};

#[test]
fn test_ab_scenario() {
    let mut m = make_ebnf_matcher(r#"root ::= "a" "b""#, &["a", "b", "c", "</s>"]);
    assert!(!m.accept_token(2));
    assert!(m.accept_token(0));
    assert!(m.accept_token(1));
    assert!(m.can_terminate());
    assert!(m.accept_token(3));
    assert!(m.is_terminated());
}

#[test]
fn test_terminate_without_stop_token() {
    let grammar = Grammar::from_ebnf(r#"root ::= "a" "b""#, "root").unwrap();
    let compiled = compile(&grammar, &["a", "b", "c"]);
    let mut m = GrammarMatcher::new(
        compiled,
        MatcherOptions {
            terminate_without_stop_token: true,
            ..Default::default()
        },
    );
    assert!(m.accept_token(0));
    assert!(!m.is_terminated());
    assert!(m.accept_token(1));
    assert!(m.is_terminated());
    assert!(!m.accept_token(0));
}

#[test]
fn test_out_of_range_token_is_rejected() {
    let mut m = make_ebnf_matcher(r#"root ::= "a""#, &["a", "b"]);
    assert!(!m.accept_token(2));
    assert!(!m.accept_token(u32::MAX));
    assert!(m.accept_token(0));
}

#[test]
fn test_override_stop_tokens() {
    let grammar = Grammar::from_ebnf(r#"root ::= "a""#, "root").unwrap();
    let compiled = compile(&grammar, &["a", "b", "</s>"]);
    let mut m = GrammarMatcher::new(
        compiled,
        MatcherOptions {
            override_stop_tokens: Some(vec![1]),
            ..Default::default()
        },
    );
    assert_eq!(m.stop_token_ids(), &[1]);
    assert!(m.accept_token(0));
    assert_eq!(allowed_tokens(&mut m), vec![1]);
    assert!(m.accept_token(1));
    assert!(m.is_terminated());
}

#[test]
fn test_special_tokens_never_allowed() {
    let encoded: Vec<String> = ["a", "", "<pad>"].iter().map(|s| s.to_string()).collect();
    let info = Arc::new(
        TokenizerInfo::with_options(
            &encoded,
            TokenizerInfoOptions {
                vocab_type: VocabType::Raw,
                vocab_size: Some(5),
                ..Default::default()
            },
        )
        .unwrap(),
    );
    let compiler = GrammarCompiler::new(info, Default::default()).unwrap();
    let compiled = compiler
        .compile_grammar(&Grammar::from_ebnf(r#"root ::= [a-z<>]*"#, "root").unwrap())
        .unwrap();
    let mut m = GrammarMatcher::new(compiled, Default::default());
    assert_eq!(allowed_tokens(&mut m), vec![0, 2]);
    assert!(!m.accept_token(1));
    assert!(!m.accept_token(3));
    assert!(!m.accept_token(4));
}

#[test]
fn test_bitmask_rows_in_batch() {
    let vocab = ["a", "b", "ab", "</s>"];
    let mut m = make_ebnf_matcher(r#"root ::= "ab""#, &vocab);
    let (rows, words) = get_bitmask_shape(3, vocab.len());
    assert_eq!((rows, words), (3, 1));

    let mut bitmask = allocate_token_bitmask(3, vocab.len());
    bitmask[0] = 0xffff_ffff;
    assert!(m.fill_next_token_bitmask(&mut bitmask, 1));
    // Other rows are untouched
    assert_eq!(bitmask[0], 0xffff_ffff);
    assert!(get_bit(&bitmask[words..], 0));
    assert!(!get_bit(&bitmask[words..], 1));
    assert!(get_bit(&bitmask[words..], 2));
    assert!(!get_bit(&bitmask[words..], 3));
}

#[test]
fn test_bitmask_matches_accept() {
    let vocab = ["{", "}", "\"", "a", "ab", "\"a", "a\"", ":", ",", " ", "1", "12", "</s>", "\":"];
    let grammar = Grammar::builtin_json_grammar().unwrap();
    let compiled = compile(&grammar, &vocab);
    let mut m = GrammarMatcher::new(compiled, Default::default());

    // Walk a few steps, checking every token against the bitmask at each one
    for step in [0u32, 5, 13, 10] {
        let allowed = allowed_tokens(&mut m);
        for id in 0..vocab.len() as u32 {
            let accepted = m.accept_token(id);
            if accepted {
                m.rollback(1).unwrap();
            }
            assert_eq!(allowed.contains(&id), accepted, "token {:?} before {:?}", vocab[id as usize], vocab[step as usize]);
        }
        assert!(m.accept_token(step), "{:?}", vocab[step as usize]);
    }
    assert!(m.accept_token(1));
    assert!(m.can_terminate());
}

#[test]
fn test_rollback_restores_state() {
    let vocab = ["a", "b", "c", "ab", "</s>"];
    let mut m = make_ebnf_matcher(r#"root ::= ("a" | "b")* "c""#, &vocab);
    let initial = allowed_tokens(&mut m);

    for token in [0, 3, 1] {
        assert!(m.accept_token(token));
    }
    m.rollback(3).unwrap();
    assert_eq!(allowed_tokens(&mut m), initial);

    assert!(m.accept_token(3));
    assert!(m.accept_token(2));
    assert!(m.accept_token(4));
    m.rollback(2).unwrap();
    assert!(!m.is_terminated());
    assert!(!m.can_terminate());
    assert_eq!(m.rollback(5).unwrap_err().kind(), ErrorKind::Runtime);
}

#[test]
fn test_rollback_window() {
    let grammar = Grammar::from_ebnf(r#"root ::= "a"*"#, "root").unwrap();
    let compiled = compile(&grammar, &["a"]);
    let mut m = GrammarMatcher::new(
        compiled,
        MatcherOptions {
            max_rollback_tokens: Some(2),
            ..Default::default()
        },
    );
    for _ in 0..5 {
        assert!(m.accept_token(0));
    }
    assert!(m.rollback(3).is_err());
    m.rollback(2).unwrap();
}

#[test]
fn test_reset_matches_fresh_matcher() {
    let vocab = ["a", "b", "c", "</s>"];
    let ebnf = r#"root ::= "a" "b"* "c""#;
    let mut fresh = make_ebnf_matcher(ebnf, &vocab);
    let mut m = make_ebnf_matcher(ebnf, &vocab);

    assert!(m.accept_token(0));
    assert!(m.accept_token(1));
    m.rollback(1).unwrap();
    assert!(m.accept_token(2));
    assert!(m.accept_token(3));
    m.reset();

    assert!(!m.is_terminated());
    assert_eq!(allowed_tokens(&mut m), allowed_tokens(&mut fresh));
}

#[test]
fn test_jump_forward() {
    let mut m = make_ebnf_matcher(r#"root ::= "{\"name\": " [a-z]+ "}""#, &["{", "x"]);
    assert_eq!(m.find_jump_forward_string(), "{\"name\": ");
    // The matcher state is unchanged
    assert!(m.accept_string("{\"name\": "));
    assert_eq!(m.find_jump_forward_string(), "");
    assert!(m.accept_string("abc"));
    // Could be another letter or the closing brace
    assert_eq!(m.find_jump_forward_string(), "");
}

#[test]
fn test_jump_forward_stops_where_grammar_can_end() {
    let mut m = make_ebnf_matcher(r#"root ::= "ab" ("cd")?"#, &["a"]);
    assert_eq!(m.find_jump_forward_string(), "ab");
    assert!(m.accept_string("ab"));
    assert_eq!(m.find_jump_forward_string(), "");
}

#[test]
fn test_accept_string_is_atomic() {
    let mut m = make_ebnf_matcher(r#"root ::= "abc""#, &["a"]);
    assert!(!m.accept_string("abx"));
    assert!(m.accept_string("ab"));
    assert!(m.accept_string("c"));
    assert!(m.can_terminate());
    m.rollback(1).unwrap();
    assert!(!m.can_terminate());
}

#[test]
fn test_byte_fallback_tokens() {
    let encoded: Vec<String> = ["<0xC3>", "<0xA9>", "▁caf", "é", "</s>"].iter().map(|s| s.to_string()).collect();
    let info = Arc::new(TokenizerInfo::new(&encoded, VocabType::ByteFallback).unwrap());
    let compiler = GrammarCompiler::new(info, Default::default()).unwrap();
    let compiled = compiler
        .compile_grammar(&Grammar::from_ebnf(r#"root ::= " café""#, "root").unwrap())
        .unwrap();
    let mut m = GrammarMatcher::new(compiled, Default::default());
    assert_eq!(allowed_tokens(&mut m), vec![2]);
    assert!(m.accept_token(2));
    assert_eq!(allowed_tokens(&mut m), vec![0, 3]);
    assert!(m.accept_token(0));
    assert_eq!(allowed_tokens(&mut m), vec![1]);
    assert!(m.accept_token(1));
    assert!(m.accept_token(4));
}

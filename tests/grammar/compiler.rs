//! Grammar compiler: sources, caching, concurrency.

use std::sync::Arc;
use std::thread;

use pie_grammar::{CompilerOptions, Grammar, GrammarCompiler, GrammarMatcher, JsonSchemaOptions};

use crate::common::{allowed_tokens, init_tracing, raw_tokenizer};

const VOCAB: &[&str] = &["a", "b", "ab", "1", "12", "\"", "{", "}", "true", "</s>"];

fn compiler(options: CompilerOptions) -> GrammarCompiler {
    init_tracing();
    GrammarCompiler::new(raw_tokenizer(VOCAB), options).unwrap()
}

#[test]
fn test_compile_sources() {
    let c = compiler(CompilerOptions::default());

    let mut m = GrammarMatcher::new(c.compile_regex("(ab)+").unwrap(), Default::default());
    assert_eq!(allowed_tokens(&mut m), vec![0, 2]);

    let compiled = c
        .compile_json_schema(r#"{"type":"boolean"}"#, &JsonSchemaOptions::compact())
        .unwrap();
    let mut m = GrammarMatcher::new(compiled, Default::default());
    assert_eq!(allowed_tokens(&mut m), vec![8]);

    let compiled = c
        .compile_structural_tag(r#"{"type":"const_string","value":"ab"}"#)
        .unwrap();
    let mut m = GrammarMatcher::new(compiled, Default::default());
    assert_eq!(allowed_tokens(&mut m), vec![0, 2]);
    assert!(m.accept_token(2));
    assert_eq!(allowed_tokens(&mut m), vec![9]);

    let mut m = GrammarMatcher::new(c.compile_builtin_json_grammar().unwrap(), Default::default());
    assert!(m.accept_token(6));
    assert!(m.accept_token(7));
    assert!(m.can_terminate());
}

#[test]
fn test_equal_grammars_share_cache_entry() {
    let c = compiler(CompilerOptions::default());
    let from_ebnf = Grammar::from_ebnf(r#"root ::= "a" | "b""#, "root").unwrap();
    let reparsed = Grammar::from_ebnf(r#"root ::= "a" | "b"   # same rule"#, "root").unwrap();
    let first = c.compile_grammar(&from_ebnf).unwrap();
    let second = c.compile_grammar(&reparsed).unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    let other = Grammar::from_ebnf(r#"start ::= "a" | "b""#, "start").unwrap();
    let third = c.compile_grammar(&other).unwrap();
    assert!(!Arc::ptr_eq(&first, &third));
    assert_eq!(c.cache_size(), first.memory_size() + third.memory_size());
}

#[test]
fn test_rendered_grammar_hits_cache() {
    let c = compiler(CompilerOptions::default());
    let g = Grammar::from_ebnf("root ::= (\"a\" (\"b\" \"c\")) | \"d\"", "root").unwrap();
    let reparsed = Grammar::from_ebnf(&g.to_string(), "root").unwrap();
    let first = c.compile_grammar(&g).unwrap();
    assert!(Arc::ptr_eq(&first, &c.compile_grammar(&reparsed).unwrap()));
}

#[test]
fn test_concurrent_compiles_agree() {
    let c = Arc::new(compiler(CompilerOptions {
        max_threads: 2,
        ..Default::default()
    }));
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let c = c.clone();
            thread::spawn(move || {
                let grammar = Grammar::from_ebnf(r#"root ::= ("a" | "b")+ "1""#, "root").unwrap();
                c.compile_grammar(&grammar).unwrap().serialize_json().unwrap()
            })
        })
        .collect();
    let outputs: Vec<String> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(outputs.windows(2).all(|w| w[0] == w[1]));

    let grammar = Grammar::from_ebnf(r#"root ::= ("a" | "b")+ "1""#, "root").unwrap();
    let cached = c.compile_grammar(&grammar).unwrap();
    assert_eq!(c.cache_size(), cached.memory_size());
}

#[test]
fn test_invalid_sources_are_errors() {
    let c = compiler(CompilerOptions::default());
    assert!(c.compile_regex("(a").is_err());
    assert!(c.compile_json_schema("{", &JsonSchemaOptions::default()).is_err());
    assert!(c.compile_structural_tag(r#"{"type":"or","elements":[]}"#).is_err());
    assert_eq!(c.cache_size(), 0);
}

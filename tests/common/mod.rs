//! Shared helpers for the integration tests.
#![allow(dead_code)]

use std::sync::{Arc, Once};

use pie_grammar::bitmask::{allocate_token_bitmask, get_bit};
use pie_grammar::{CompiledGrammar, Grammar, GrammarCompiler, GrammarMatcher, MatcherOptions, TokenizerInfo, VocabType};

static TRACING: Once = Once::new();

/// Install a `tracing` subscriber honoring `RUST_LOG`, once per process.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn raw_tokenizer(vocab: &[&str]) -> Arc<TokenizerInfo> {
    let encoded: Vec<String> = vocab.iter().map(|s| s.to_string()).collect();
    Arc::new(TokenizerInfo::new(&encoded, VocabType::Raw).unwrap())
}

pub fn compile(grammar: &Grammar, vocab: &[&str]) -> Arc<CompiledGrammar> {
    init_tracing();
    let compiler = GrammarCompiler::new(raw_tokenizer(vocab), Default::default()).unwrap();
    compiler.compile_grammar(grammar).unwrap()
}

pub fn make_matcher(grammar: &Grammar, vocab: &[&str]) -> GrammarMatcher {
    GrammarMatcher::new(compile(grammar, vocab), MatcherOptions::default())
}

pub fn make_ebnf_matcher(ebnf: &str, vocab: &[&str]) -> GrammarMatcher {
    make_matcher(&Grammar::from_ebnf(ebnf, "root").unwrap(), vocab)
}

/// Whether `grammar` accepts exactly `input`.
pub fn accepts(grammar: &Grammar, input: &str) -> bool {
    let mut m = make_matcher(grammar, &["dummy"]);
    if input.is_empty() {
        return m.can_terminate();
    }
    m.accept_string(input) && m.can_terminate()
}

pub fn ebnf_accepts(ebnf: &str, input: &str) -> bool {
    accepts(&Grammar::from_ebnf(ebnf, "root").unwrap(), input)
}

/// Token ids allowed by the matcher's next bitmask.
pub fn allowed_tokens(m: &mut GrammarMatcher) -> Vec<u32> {
    let vocab_size = m.compiled_grammar().tokenizer_info().vocab_size();
    let mut bitmask = allocate_token_bitmask(1, vocab_size);
    m.fill_next_token_bitmask(&mut bitmask, 0);
    (0..vocab_size as u32).filter(|&i| get_bit(&bitmask, i as usize)).collect()
}

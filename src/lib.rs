//! Pie Grammar - grammar-guided token generation
//!
//! Compiles formal languages (EBNF, regular expressions, JSON Schema,
//! structural tags) against a tokenizer vocabulary and, at every decoding
//! step, computes which tokens keep the output inside the language.
//!
//! ```
//! use std::sync::Arc;
//! use pie_grammar::{Grammar, GrammarCompiler, GrammarMatcher, TokenizerInfo, VocabType};
//!
//! let vocab: Vec<String> = ["a", "b", "ab", "</s>"].iter().map(|s| s.to_string()).collect();
//! let tokenizer = Arc::new(TokenizerInfo::new(&vocab, VocabType::Raw).unwrap());
//! let compiler = GrammarCompiler::new(tokenizer, Default::default()).unwrap();
//!
//! let grammar = Grammar::from_ebnf(r#"root ::= "a" "b""#, "root").unwrap();
//! let compiled = compiler.compile_grammar(&grammar).unwrap();
//! let mut matcher = GrammarMatcher::new(compiled, Default::default());
//!
//! let mut bitmask = pie_grammar::bitmask::allocate_token_bitmask(1, 4);
//! matcher.fill_next_token_bitmask(&mut bitmask, 0);
//! assert!(pie_grammar::bitmask::get_bit(&bitmask, 0));
//! assert!(matcher.accept_token(2));
//! assert!(matcher.accept_token(3));
//! assert!(matcher.is_terminated());
//! ```

// Grammar model and converters
pub mod grammar;
pub mod json_schema;
pub mod regex;
pub mod structural_tag;

// Compilation and matching
pub mod bitmask;
pub mod compiled_grammar;
pub mod compiler;
pub mod matcher;
pub mod tokenizer;

pub mod config;
pub mod error;

mod fsm;

pub use compiled_grammar::CompiledGrammar;
pub use compiler::{CompilerOptions, GrammarCompiler};
pub use error::{Error, ErrorKind, Result};
pub use grammar::builder::GrammarBuilder;
pub use grammar::Grammar;
pub use json_schema::JsonSchemaOptions;
pub use matcher::{GrammarMatcher, MatcherOptions};
pub use tokenizer::{TokenizerInfo, TokenizerInfoOptions, VocabType};

//! Versioned JSON serialization of grammars, tokenizers and compiled grammars.

use std::sync::Arc;

use anyhow::Result;
use pie_grammar::config::serialization_version;
use pie_grammar::{CompiledGrammar, ErrorKind, Grammar, GrammarMatcher, JsonSchemaOptions, TokenizerInfo, VocabType};

use crate::common::{allowed_tokens, compile, raw_tokenizer};

const VOCAB: &[&str] = &["{", "}", "\"", "a", "b", "\"a\"", ":", ",", "1", " ", "</s>"];

fn schema_grammar() -> Grammar {
    let schema = r#"{"type":"object","properties":{"a":{"type":"integer"}},"required":["a"]}"#;
    Grammar::from_json_schema(schema, &JsonSchemaOptions::compact()).unwrap()
}

#[test]
fn test_grammar_round_trip() -> Result<()> {
    let grammar = Grammar::from_ebnf("root ::= item+ (= \"x\")\nitem ::= [a-z] | \"\\\"\" [^\"]* \"\\\"\"", "root")?;
    let json = grammar.serialize_json()?;
    let value: serde_json::Value = serde_json::from_str(&json)?;
    assert_eq!(value["version"], serialization_version());

    let restored = Grammar::deserialize_json(&json)?;
    assert_eq!(restored.to_string(), grammar.to_string());
    assert_eq!(restored.serialize_json()?, json);
    Ok(())
}

#[test]
fn test_grammar_deserialize_errors() -> Result<()> {
    let json = Grammar::from_ebnf(r#"root ::= "a""#, "root")?.serialize_json()?;
    let mut value: serde_json::Value = serde_json::from_str(&json)?;

    assert_eq!(Grammar::deserialize_json("not json").unwrap_err().kind(), ErrorKind::InvalidJson);

    value["version"] = serde_json::json!("other/v0");
    assert_eq!(
        Grammar::deserialize_json(&value.to_string()).unwrap_err().kind(),
        ErrorKind::DeserializeVersion
    );

    value["version"] = serde_json::json!(serialization_version());
    value["root_rule"] = serde_json::json!(42);
    assert_eq!(
        Grammar::deserialize_json(&value.to_string()).unwrap_err().kind(),
        ErrorKind::DeserializeFormat
    );
    Ok(())
}

#[test]
fn test_tokenizer_round_trip() -> Result<()> {
    let encoded: Vec<String> = ["Ġhello", "world", "<|endoftext|>"].iter().map(|s| s.to_string()).collect();
    let info = TokenizerInfo::new(&encoded, VocabType::ByteLevel)?;
    let json = info.serialize_json()?;
    let restored = TokenizerInfo::deserialize_json(&json)?;
    assert_eq!(restored, info);
    assert_eq!(restored.decode_token(0), Some(&b" hello"[..]));
    assert_eq!(restored.stop_token_ids(), &[2]);
    Ok(())
}

#[test]
fn test_compile_is_deterministic() -> Result<()> {
    let grammar = schema_grammar();
    let first = compile(&grammar, VOCAB).serialize_json()?;
    let second = compile(&grammar, VOCAB).serialize_json()?;
    assert_eq!(first, second);
    Ok(())
}

#[test]
fn test_compiled_grammar_round_trip() -> Result<()> {
    let grammar = schema_grammar();
    let compiled = compile(&grammar, VOCAB);
    let json = compiled.serialize_json()?;

    let tokenizer = compiled.tokenizer_info().clone();
    let restored = Arc::new(CompiledGrammar::deserialize_json(&json, tokenizer)?);
    assert_eq!(restored.serialize_json()?, json);
    assert_eq!(restored.grammar().to_string(), compiled.grammar().to_string());

    let mut original = GrammarMatcher::new(compiled, Default::default());
    let mut loaded = GrammarMatcher::new(restored, Default::default());
    for token in [0u32, 5, 6, 8, 1] {
        assert_eq!(allowed_tokens(&mut original), allowed_tokens(&mut loaded));
        assert!(original.accept_token(token));
        assert!(loaded.accept_token(token));
    }
    assert!(loaded.can_terminate());
    Ok(())
}

#[test]
fn test_compiled_grammar_needs_matching_tokenizer() -> Result<()> {
    let json = compile(&schema_grammar(), VOCAB).serialize_json()?;
    let other = raw_tokenizer(&["{", "}"]);
    let e = CompiledGrammar::deserialize_json(&json, other).unwrap_err();
    assert_eq!(e.kind(), ErrorKind::DeserializeFormat);
    Ok(())
}

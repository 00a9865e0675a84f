//! Structural tags: tagged regions, triggers, separators.

use pie_grammar::{ErrorKind, Grammar, GrammarCompiler, GrammarMatcher};

use crate::common::{accepts, raw_tokenizer};

fn tag_accepts(json: &str, input: &str) -> bool {
    accepts(&Grammar::from_structural_tag(json).unwrap(), input)
}

const THINK: &str = r#"{"type":"tag","begin":"<think>","content":{"type":"any_text"},"end":"</think>"}"#;

const WEATHER_TAG: &str = r#"{
    "begin": "<function=get_weather>",
    "content": {
        "type": "json_schema",
        "json_schema": {"type": "object", "properties": {"city": {"type": "string"}}, "required": ["city"]}
    },
    "end": "</function>"
}"#;

fn triggered(at_least_one: bool, stop_after_first: bool) -> String {
    format!(
        r#"{{"type": "structural_tag", "format": {{
            "type": "triggered_tags",
            "triggers": ["<function="],
            "tags": [{}],
            "at_least_one": {},
            "stop_after_first": {}
        }}}}"#,
        WEATHER_TAG, at_least_one, stop_after_first
    )
}

#[test]
fn test_think_tag() {
    assert!(tag_accepts(THINK, "<think>anything</think>"));
    assert!(tag_accepts(THINK, "<think></think>"));
    assert!(tag_accepts(THINK, "<think>a </thin </think>"));
    assert!(tag_accepts(THINK, "<think>x<</think>"));
    assert!(!tag_accepts(THINK, "<think>unfinished"));
    assert!(!tag_accepts(THINK, "<think>a</think>b"));
    assert!(!tag_accepts(THINK, "anything</think>"));
}

#[test]
fn test_think_tag_matched_as_one_token() {
    let tokenizer = raw_tokenizer(&["<think>anything</think>", "<think>", "</think>", "</s>"]);
    let compiler = GrammarCompiler::new(tokenizer, Default::default()).unwrap();
    let compiled = compiler.compile_structural_tag(THINK).unwrap();
    let mut m = GrammarMatcher::new(compiled, Default::default());
    assert!(m.accept_token(0));
    assert!(m.accept_token(3));
    assert!(m.is_terminated());
}

#[test]
fn test_triggered_tags() {
    let json = triggered(false, false);
    let call = r#"<function=get_weather>{"city": "Paris"}</function>"#;
    assert!(tag_accepts(&json, "no tools needed"));
    assert!(tag_accepts(&json, ""));
    assert!(tag_accepts(&json, &format!("Checking. {} Done, 3 < 4.", call)));
    assert!(tag_accepts(&json, &format!("{}{}", call, call)));
    assert!(!tag_accepts(&json, r#"<function=get_time>{}</function>"#));
    assert!(!tag_accepts(&json, r#"<function=get_weather>{"town": "Rome"}</function>"#));
}

#[test]
fn test_triggered_tags_at_least_one() {
    let json = triggered(true, false);
    let call = r#"<function=get_weather>{"city":"Oslo"}</function>"#;
    assert!(!tag_accepts(&json, "no tools needed"));
    assert!(tag_accepts(&json, &format!("ok {} bye", call)));
}

#[test]
fn test_triggered_tags_stop_after_first() {
    let json = triggered(false, true);
    let call = r#"<function=get_weather>{"city":"Oslo"}</function>"#;
    assert!(tag_accepts(&json, &format!("ok {}", call)));
    assert!(!tag_accepts(&json, &format!("ok {} bye", call)));
    assert!(tag_accepts(&json, "just text"));
}

#[test]
fn test_tags_with_separator() {
    let json = r#"{
        "type": "tags_with_separator",
        "tags": [
            {"type": "tag", "begin": "<a>", "content": {"type": "const_string", "value": "1"}, "end": "</a>"},
            {"begin": "<b>", "content": {"type": "regex", "pattern": "[0-9]+"}, "end": "</b>"}
        ],
        "separator": ","
    }"#;
    assert!(tag_accepts(json, ""));
    assert!(tag_accepts(json, "<a>1</a>"));
    assert!(tag_accepts(json, "<a>1</a>,<b>42</b>,<a>1</a>"));
    assert!(!tag_accepts(json, "<a>1</a><b>4</b>"));
    assert!(!tag_accepts(json, "<a>2</a>"));
}

#[test]
fn test_sequence_and_or() {
    let json = r#"{
        "type": "sequence",
        "elements": [
            {"type": "const_string", "value": "answer: "},
            {"type": "or", "elements": [
                {"type": "const_string", "value": "yes"},
                {"type": "json_schema", "json_schema": {"type": "integer"}}
            ]}
        ]
    }"#;
    assert!(tag_accepts(json, "answer: yes"));
    assert!(tag_accepts(json, "answer: 42"));
    assert!(!tag_accepts(json, "answer: no"));
}

#[test]
fn test_errors() {
    let kind = |json: &str| Grammar::from_structural_tag(json).unwrap_err().kind();
    assert_eq!(kind(r#"{"type": "sequence", "elements": []}"#), ErrorKind::InvalidStructuralTag);
    assert_eq!(kind(r#"{"type": "tag", "begin": "<a>"}"#), ErrorKind::InvalidStructuralTag);
    assert_eq!(kind(r#"{"type": "regex", "pattern": "(?=x)"}"#), ErrorKind::Parse);
    assert_eq!(kind("[1, 2"), ErrorKind::InvalidJson);
}

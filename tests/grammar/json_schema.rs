//! JSON Schema to grammar conversion and acceptance.

use pie_grammar::json_schema::{json_schema_to_ebnf, json_schema_to_grammar};
use pie_grammar::{ErrorKind, Grammar, JsonSchemaOptions};

use crate::common::accepts;

fn schema_accepts(schema: &str, options: &JsonSchemaOptions, input: &str) -> bool {
    accepts(&json_schema_to_grammar(schema, options).unwrap(), input)
}

#[test]
fn test_string_schema_layouts() {
    let schema = r#"{"type":"string"}"#;
    let compact = JsonSchemaOptions::compact();
    let default = JsonSchemaOptions::default();
    assert_ne!(
        json_schema_to_ebnf(schema, &compact).unwrap(),
        json_schema_to_ebnf(schema, &default).unwrap()
    );
    for options in [&compact, &default] {
        assert!(schema_accepts(schema, options, r#""hello""#));
        assert!(!schema_accepts(schema, options, "123"));
        assert!(!schema_accepts(schema, options, "true"));
        assert!(!schema_accepts(schema, options, "null"));
    }
}

#[test]
fn test_object_with_required_properties() {
    let schema = r#"{
        "type": "object",
        "properties": {"name": {"type": "string"}, "age": {"type": "integer"}},
        "required": ["name", "age"]
    }"#;
    let compact = JsonSchemaOptions::compact();
    assert!(schema_accepts(schema, &compact, r#"{"name":"Ann","age":31}"#));
    assert!(!schema_accepts(schema, &compact, r#"{"name":"Ann"}"#));
    assert!(!schema_accepts(schema, &compact, r#"{"name":1,"age":31}"#));
    assert!(!schema_accepts(schema, &compact, r#"{"name":"Ann","age":31,"x":1}"#));

    let default = JsonSchemaOptions::default();
    assert!(schema_accepts(schema, &default, "{\"name\": \"Ann\",\n  \"age\": 31}"));
}

#[test]
fn test_integer_bounds() {
    let schema = r#"{"type":"integer","minimum":1,"maximum":12}"#;
    let options = JsonSchemaOptions::compact();
    assert!(schema_accepts(schema, &options, "1"));
    assert!(schema_accepts(schema, &options, "12"));
    assert!(!schema_accepts(schema, &options, "0"));
    assert!(!schema_accepts(schema, &options, "13"));
    assert!(!schema_accepts(schema, &options, "1.5"));
}

#[test]
fn test_array_item_counts() {
    let schema = r#"{"type":"array","items":{"type":"boolean"},"minItems":1,"maxItems":2}"#;
    let options = JsonSchemaOptions::compact();
    assert!(!schema_accepts(schema, &options, "[]"));
    assert!(schema_accepts(schema, &options, "[true]"));
    assert!(schema_accepts(schema, &options, "[true,false]"));
    assert!(!schema_accepts(schema, &options, "[true,false,true]"));
    assert!(!schema_accepts(schema, &options, "[1]"));
}

#[test]
fn test_enum_and_pattern() {
    let options = JsonSchemaOptions::compact();
    let schema = r#"{"enum":["red", 3, null]}"#;
    assert!(schema_accepts(schema, &options, r#""red""#));
    assert!(schema_accepts(schema, &options, "3"));
    assert!(schema_accepts(schema, &options, "null"));
    assert!(!schema_accepts(schema, &options, r#""blue""#));

    let schema = r#"{"type":"string","pattern":"^[a-z]{2,3}$"}"#;
    assert!(schema_accepts(schema, &options, r#""abc""#));
    assert!(!schema_accepts(schema, &options, r#""abcd""#));
    assert!(!schema_accepts(schema, &options, r#""AB""#));
}

#[test]
fn test_any_of_and_ref() {
    let schema = r##"{
        "$defs": {"point": {"type": "object", "properties": {"x": {"type": "number"}}, "required": ["x"]}},
        "anyOf": [{"$ref": "#/$defs/point"}, {"type": "null"}]
    }"##;
    let options = JsonSchemaOptions::compact();
    assert!(schema_accepts(schema, &options, r#"{"x":1.5}"#));
    assert!(schema_accepts(schema, &options, "null"));
    assert!(!schema_accepts(schema, &options, "{}"));
}

#[test]
fn test_empty_any_of_is_an_error() {
    let options = JsonSchemaOptions::default();
    let e = json_schema_to_grammar(r#"{"anyOf": []}"#, &options).unwrap_err();
    assert_eq!(e.kind(), ErrorKind::InvalidJsonSchema);
    let e = json_schema_to_grammar("{\"type\": ", &options).unwrap_err();
    assert_eq!(e.kind(), ErrorKind::InvalidJson);
}

#[test]
fn test_builtin_json_grammar() {
    let g = Grammar::builtin_json_grammar().unwrap();
    for input in ["true", "null", "-3.25e4", r#""hi\n""#, "[1, [2, {}]]", r#"{"a": {"b": [null]}}"#] {
        assert!(accepts(&g, input), "{}", input);
    }
    for input in ["tru", "01", "[1,]", r#"{"a"}"#, "'x'"] {
        assert!(!accepts(&g, input), "{}", input);
    }
}

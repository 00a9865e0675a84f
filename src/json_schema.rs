//! JSON Schema to grammar converter.
//!
//! Converts a JSON Schema into an EBNF grammar string, then parses it
//! into a `Grammar`. The generated grammar accepts JSON text that satisfies
//! the schema, laid out according to [`JsonSchemaOptions`].
//!
//! # Supported features
//! - Types: string, integer, number, boolean, null, array, object, and
//!   arrays of types
//! - Constraints: enum, const, minLength/maxLength, minimum/maximum,
//!   exclusiveMinimum/exclusiveMaximum, pattern, format
//! - Arrays: items, prefixItems, minItems/maxItems
//! - Objects: properties, required, additionalProperties,
//!   minProperties/maxProperties
//! - Composition: $ref (`#`, `#/$defs/...`, `#/definitions/...`), anyOf,
//!   oneOf, single-schema allOf, boolean schemas
//! - Formatting: indent, separators, any_whitespace, max_whitespace_cnt

use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::{Map, Value};

use crate::config::DepthGuard;
use crate::error::{bail, err, Error, Result};
use crate::grammar::ebnf::quote_literal;
use crate::grammar::Grammar;
use crate::regex::regex_to_ebnf;

/// Options for JSON schema to grammar conversion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JsonSchemaOptions {
    /// Allow arbitrary whitespace around structural characters.
    pub any_whitespace: bool,
    /// Indent width for pretty layout. `None` = single line.
    pub indent: Option<usize>,
    /// Custom separators: (item_separator, key_value_separator).
    pub separators: Option<(String, String)>,
    /// Disallow properties and items the schema does not declare.
    pub strict_mode: bool,
    /// Cap on consecutive whitespace characters when `any_whitespace` is set.
    pub max_whitespace_cnt: Option<usize>,
    /// Log the generated EBNF at debug level.
    pub print_converted_ebnf: bool,
}

impl Default for JsonSchemaOptions {
    fn default() -> Self {
        Self {
            any_whitespace: true,
            indent: None,
            separators: None,
            strict_mode: true,
            max_whitespace_cnt: None,
            print_converted_ebnf: false,
        }
    }
}

impl JsonSchemaOptions {
    /// No whitespace at all, separators `,` and `:`.
    pub fn compact() -> Self {
        Self {
            any_whitespace: false,
            separators: Some((",".to_string(), ":".to_string())),
            ..Self::default()
        }
    }
}

/// Convert a JSON Schema string to a Grammar.
pub fn json_schema_to_grammar(schema: &str, options: &JsonSchemaOptions) -> Result<Grammar> {
    let value = parse_json(schema)?;
    schema_value_to_grammar(&value, options)
}

/// Convert a JSON Schema string to an EBNF grammar string with root rule `root`.
pub fn json_schema_to_ebnf(schema: &str, options: &JsonSchemaOptions) -> Result<String> {
    let value = parse_json(schema)?;
    SchemaConverter::new(&value, options).convert()
}

pub(crate) fn schema_value_to_grammar(schema: &Value, options: &JsonSchemaOptions) -> Result<Grammar> {
    let ebnf = SchemaConverter::new(schema, options).convert()?;
    if options.print_converted_ebnf {
        tracing::debug!(ebnf = %ebnf, "converted JSON schema to EBNF");
    }
    Grammar::from_ebnf(&ebnf, "root").map_err(|e| err!(InvalidJsonSchema, "generated grammar does not parse: {}", e))
}

fn parse_json(text: &str) -> Result<Value> {
    serde_json::from_str(text).map_err(|e| Error::InvalidJson(e.to_string()))
}

impl Grammar {
    /// Build a grammar accepting JSON text valid under `schema`.
    pub fn from_json_schema(schema: &str, options: &JsonSchemaOptions) -> Result<Grammar> {
        json_schema_to_grammar(schema, options)
    }

    /// A grammar accepting any JSON value.
    pub fn builtin_json_grammar() -> Result<Grammar> {
        Grammar::from_ebnf(BUILTIN_JSON_EBNF, "root")
    }
}

const BUILTIN_JSON_EBNF: &str = r#"
root ::= value
value ::= object | array | string | number | "true" | "false" | "null"
object ::= "{" ws (member ("," ws member)*)? "}"
member ::= string ws ":" ws value ws
array ::= "[" ws (value ws ("," ws value ws)*)? "]"
string ::= "\"" char* "\""
char ::= [^"\\\u0000-\u001f] | "\\" escape
escape ::= ["\\/bfnrt] | "u" [0-9a-fA-F]{4}
number ::= "-"? ("0" | [1-9] [0-9]*) ("." [0-9]+)? ([eE] [+-]? [0-9]+)?
ws ::= [ \t\n\r]*
"#;

const QUOTE: &str = r#""\"""#;

/// Names of the rules shared by every generated grammar.
const WS: &str = "ws";
const JSON_CHAR: &str = "json_char";
const JSON_STRING: &str = "json_string";
const JSON_NUMBER: &str = "json_number";
const ANY_VALUE: &str = "any_value";
const ANY_OBJECT: &str = "any_object";
const ANY_ARRAY: &str = "any_array";
const ANY_MEMBER: &str = "any_member";
const RESERVED: &[&str] = &["root", WS, JSON_CHAR, JSON_STRING, JSON_NUMBER, ANY_VALUE, ANY_OBJECT, ANY_ARRAY, ANY_MEMBER];

/// Separator fragments for one layout style, as EBNF expressions.
#[derive(Debug, Clone)]
struct Layout {
    any_whitespace: bool,
    indent: Option<usize>,
    item_sep: String,
    kv_sep: String,
}

impl Layout {
    fn new(options: &JsonSchemaOptions) -> Self {
        let (item, kv) = match &options.separators {
            Some((item, kv)) => (item.clone(), kv.clone()),
            None if options.any_whitespace || options.indent.is_some() => (",".to_string(), ": ".to_string()),
            None => (", ".to_string(), ": ".to_string()),
        };
        let (item, kv) = if options.any_whitespace {
            (item.trim().to_string(), kv.trim().to_string())
        } else {
            (item, kv)
        };
        Self {
            any_whitespace: options.any_whitespace,
            indent: options.indent,
            item_sep: item,
            kv_sep: kv,
        }
    }

    /// The same separators without line breaks, for untyped nested values.
    fn flat(&self) -> Layout {
        Layout {
            indent: None,
            ..self.clone()
        }
    }

    fn newline(&self, level: usize) -> Option<String> {
        self.indent.map(|n| quote_literal(&format!("\n{}", " ".repeat(n * level))))
    }

    /// Between the opening bracket and the first element.
    fn open(&self, level: usize) -> String {
        if self.any_whitespace {
            WS.to_string()
        } else {
            self.newline(level + 1).unwrap_or_default()
        }
    }

    /// Between the last element and the closing bracket.
    fn close(&self, level: usize) -> String {
        if self.any_whitespace {
            WS.to_string()
        } else {
            self.newline(level).unwrap_or_default()
        }
    }

    fn item_sep(&self, level: usize) -> String {
        if self.any_whitespace {
            return seq(&[WS, &quote_literal(&self.item_sep), WS]);
        }
        match self.indent {
            Some(n) => quote_literal(&format!("{}\n{}", self.item_sep, " ".repeat(n * (level + 1)))),
            None => quote_literal(&self.item_sep),
        }
    }

    fn kv_sep(&self) -> String {
        if self.any_whitespace {
            seq(&[WS, &quote_literal(&self.kv_sep), WS])
        } else {
            quote_literal(&self.kv_sep)
        }
    }

    fn empty(&self, open: &str, close: &str) -> String {
        if self.any_whitespace {
            seq(&[&quote_literal(open), WS, &quote_literal(close)])
        } else {
            quote_literal(&format!("{}{}", open, close))
        }
    }

    /// Whether nesting depth changes the generated text.
    fn level_key(&self, level: usize) -> usize {
        if self.indent.is_some() && !self.any_whitespace {
            level
        } else {
            0
        }
    }
}

/// Join non-empty EBNF fragments into a sequence.
fn seq(parts: &[&str]) -> String {
    let parts: Vec<&str> = parts.iter().copied().filter(|p| !p.is_empty()).collect();
    if parts.is_empty() {
        "\"\"".to_string()
    } else {
        parts.join(" ")
    }
}

fn choices(alts: &[String]) -> String {
    if alts.len() == 1 {
        alts[0].clone()
    } else {
        format!("({})", alts.join(" | "))
    }
}

/// Build an EBNF repetition suffix for a given min/max count. Empty when
/// the element must not appear at all.
fn repetition_suffix(min: usize, max: Option<usize>) -> String {
    match (min, max) {
        (0, None) => "*".to_string(),
        (0, Some(0)) => String::new(),
        (1, None) => "+".to_string(),
        (0, Some(1)) => "?".to_string(),
        (min, None) => format!("{{{},}}", min),
        (min, Some(max)) if min == max => format!("{{{}}}", min),
        (min, Some(max)) => format!("{{{},{}}}", min, max),
    }
}

fn sanitize_rule_name(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.is_empty() || out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

fn json_literal(value: &Value) -> String {
    quote_literal(&value.to_string())
}

fn get_count(obj: &Map<String, Value>, key: &str) -> Result<Option<usize>> {
    match obj.get(key) {
        None => Ok(None),
        Some(v) => v
            .as_u64()
            .map(|n| Some(n as usize))
            .ok_or_else(|| err!(InvalidJsonSchema, "\"{}\" must be a non-negative integer, got {}", key, v)),
    }
}

/// A numeric bound: value and whether it is exclusive.
type Bound = Option<(f64, bool)>;

fn numeric_bounds(obj: &Map<String, Value>) -> Result<(Bound, Bound)> {
    let number = |key: &str| -> Result<Option<f64>> {
        match obj.get(key) {
            None | Some(Value::Bool(_)) if key.starts_with("exclusive") => Ok(None),
            None => Ok(None),
            Some(Value::Number(n)) => Ok(n.as_f64()),
            Some(v) => bail!(InvalidJsonSchema, "\"{}\" must be a number, got {}", key, v),
        }
    };
    // Draft 4 spells exclusivity as a boolean next to minimum/maximum.
    let flag = |key: &str| obj.get(key) == Some(&Value::Bool(true));

    let tighter = |a: Bound, b: Bound, lower: bool| match (a, b) {
        (Some(x), Some(y)) => {
            let x_wins = if lower { x.0 > y.0 } else { x.0 < y.0 };
            Some(if x_wins || (x.0 == y.0 && x.1) { x } else { y })
        }
        (x, y) => x.or(y),
    };

    let lo = tighter(
        number("minimum")?.map(|v| (v, flag("exclusiveMinimum"))),
        number("exclusiveMinimum")?.map(|v| (v, true)),
        true,
    );
    let hi = tighter(
        number("maximum")?.map(|v| (v, flag("exclusiveMaximum"))),
        number("exclusiveMaximum")?.map(|v| (v, true)),
        false,
    );
    Ok((lo, hi))
}

fn integer_lower(bound: Bound) -> Option<i64> {
    bound.map(|(v, excl)| if excl { v.floor() as i64 + 1 } else { v.ceil() as i64 })
}

fn integer_upper(bound: Bound) -> Option<i64> {
    bound.map(|(v, excl)| if excl { v.ceil() as i64 - 1 } else { v.floor() as i64 })
}

/// Map a JSON Schema format name to a regex pattern. Unknown formats map
/// to `None` and are treated as plain strings.
fn format_to_regex(format: &str) -> Option<&'static str> {
    const DATE: &str = r"\d{4}-(0[1-9]|1[0-2])-(0[1-9]|[12]\d|3[01])";
    const TIME: &str = r"([01]\d|2[0-3]):[0-5]\d:([0-5]\d|60)(\.\d+)?(Z|[+-]([01]\d|2[0-3]):[0-5]\d)";
    Some(match format {
        "date" => DATE,
        "time" => TIME,
        "date-time" => concat!(
            r"\d{4}-(0[1-9]|1[0-2])-(0[1-9]|[12]\d|3[01])",
            "T",
            r"([01]\d|2[0-3]):[0-5]\d:([0-5]\d|60)(\.\d+)?(Z|[+-]([01]\d|2[0-3]):[0-5]\d)"
        ),
        "email" => {
            r"[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9]([a-zA-Z0-9-]*[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9-]*[a-zA-Z0-9])?)*"
        }
        "uuid" => r"[0-9a-fA-F]{8}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{4}-[0-9a-fA-F]{12}",
        "ipv4" => r"((25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)\.){3}(25[0-5]|2[0-4]\d|1\d\d|[1-9]?\d)",
        "hostname" => r"[a-zA-Z0-9]([a-zA-Z0-9-]*[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9-]*[a-zA-Z0-9])?)*",
        _ => return None,
    })
}

// ---------------------------------------------------------------------------
// Integer ranges as regexes
// ---------------------------------------------------------------------------

/// A regex matching the decimal integers in `[lo, hi]` (open where `None`).
/// Callers guarantee `lo <= hi`.
fn integer_range_regex(lo: Option<i64>, hi: Option<i64>) -> String {
    match (lo, hi) {
        (None, None) => "-?(0|[1-9][0-9]*)".to_string(),
        (Some(lo), None) if lo >= 0 => at_least(lo as u128),
        (Some(lo), None) => format!("(-{}|{})", uint_range(1, lo.unsigned_abs() as u128), at_least(0)),
        (None, Some(hi)) if hi < 0 => format!("-{}", at_least(hi.unsigned_abs() as u128)),
        (None, Some(hi)) => format!("(-{}|{})", at_least(1), uint_range(0, hi as u128)),
        (Some(lo), Some(hi)) if lo >= 0 => uint_range(lo as u128, hi as u128),
        (Some(lo), Some(hi)) if hi < 0 => {
            format!("-{}", uint_range(hi.unsigned_abs() as u128, lo.unsigned_abs() as u128))
        }
        (Some(lo), Some(hi)) => format!("(-{}|{})", uint_range(1, lo.unsigned_abs() as u128), uint_range(0, hi as u128)),
    }
}

fn alternation(mut parts: Vec<String>) -> String {
    if parts.len() == 1 {
        parts.swap_remove(0)
    } else {
        format!("({})", parts.join("|"))
    }
}

fn at_least(lo: u128) -> String {
    match lo {
        0 => "(0|[1-9][0-9]*)".to_string(),
        1 => "([1-9][0-9]*)".to_string(),
        _ => {
            let width = lo.to_string().len();
            let ceiling = "9".repeat(width);
            alternation(vec![
                same_width(lo.to_string().as_bytes(), ceiling.as_bytes()),
                format!("[1-9][0-9]{{{},}}", width),
            ])
        }
    }
}

fn uint_range(lo: u128, hi: u128) -> String {
    let (ls, hs) = (lo.to_string(), hi.to_string());
    if ls.len() == hs.len() {
        return alternation(vec![same_width(ls.as_bytes(), hs.as_bytes())]);
    }
    let mut parts = vec![same_width(ls.as_bytes(), "9".repeat(ls.len()).as_bytes())];
    for width in ls.len() + 1..hs.len() {
        parts.push(format!("[1-9]{}", any_digits(width - 1)));
    }
    let floor = format!("1{}", "0".repeat(hs.len() - 1));
    parts.push(same_width(floor.as_bytes(), hs.as_bytes()));
    alternation(parts)
}

/// Digit strings of equal width, `lo <= hi`. Leading zeros are literal.
fn same_width(lo: &[u8], hi: &[u8]) -> String {
    let (Some(&l), Some(&h)) = (lo.first(), hi.first()) else {
        return String::new();
    };
    let rest = lo.len() - 1;
    if l == h {
        return format!("{}{}", l as char, same_width(&lo[1..], &hi[1..]));
    }
    let lo_full = lo[1..].iter().all(|&d| d == b'0');
    let hi_full = hi[1..].iter().all(|&d| d == b'9');

    let mut parts = Vec::with_capacity(3);
    let mid_lo = if lo_full {
        l
    } else {
        parts.push(format!("{}{}", l as char, same_width(&lo[1..], &vec![b'9'; rest])));
        l + 1
    };
    let mid_hi = if hi_full { h } else { h - 1 };
    if mid_lo <= mid_hi {
        parts.push(format!("{}{}", digit_class(mid_lo, mid_hi), any_digits(rest)));
    }
    if !hi_full {
        parts.push(format!("{}{}", h as char, same_width(&vec![b'0'; rest], &hi[1..])));
    }
    alternation(parts)
}

fn digit_class(lo: u8, hi: u8) -> String {
    if lo == hi {
        (lo as char).to_string()
    } else {
        format!("[{}-{}]", lo as char, hi as char)
    }
}

fn any_digits(n: usize) -> String {
    match n {
        0 => String::new(),
        1 => "[0-9]".to_string(),
        n => format!("[0-9]{{{}}}", n),
    }
}

// ---------------------------------------------------------------------------
// Internal converter
// ---------------------------------------------------------------------------

struct SchemaConverter<'a> {
    root_schema: &'a Value,
    layout: Layout,
    strict_mode: bool,
    max_whitespace_cnt: Option<usize>,
    rules: Vec<(String, String)>,
    taken: FxHashSet<String>,
    shared: FxHashSet<&'static str>,
    /// (schema text, layout level) -> rule name, for objects and arrays.
    cache: FxHashMap<(String, usize), String>,
    /// `$ref` path -> rule name.
    refs: FxHashMap<String, String>,
    depth: DepthGuard,
}

impl<'a> SchemaConverter<'a> {
    fn new(root_schema: &'a Value, options: &JsonSchemaOptions) -> Self {
        Self {
            root_schema,
            layout: Layout::new(options),
            strict_mode: options.strict_mode,
            max_whitespace_cnt: options.max_whitespace_cnt,
            rules: Vec::new(),
            taken: RESERVED.iter().map(|s| s.to_string()).collect(),
            shared: FxHashSet::default(),
            cache: FxHashMap::default(),
            refs: FxHashMap::default(),
            depth: DepthGuard::new(),
        }
    }

    fn convert(mut self) -> Result<String> {
        let root_schema = self.root_schema;
        let root_expr = self.visit(root_schema, "root", 0)?;
        if self.layout.any_whitespace {
            self.shared_rule(WS);
        }
        let mut out = format!("root ::= {}\n", root_expr);
        for (name, body) in &self.rules {
            out.push_str(&format!("{} ::= {}\n", name, body));
        }
        Ok(out)
    }

    fn fresh_name(&mut self, hint: &str) -> String {
        let base = sanitize_rule_name(hint);
        let mut name = base.clone();
        let mut counter = 0;
        while self.taken.contains(&name) {
            counter += 1;
            name = format!("{}_{}", base, counter);
        }
        self.taken.insert(name.clone());
        name
    }

    fn add_rule(&mut self, name: String, body: String) {
        self.rules.push((name, body));
    }

    /// Emit one of the fixed helper rules on first use and return its name.
    fn shared_rule(&mut self, name: &'static str) -> String {
        if self.shared.insert(name) {
            let flat = self.layout.flat();
            let body = match name {
                WS => match self.max_whitespace_cnt {
                    Some(n) => format!("[ \\n\\t\\r]{{0,{}}}", n),
                    None => "[ \\n\\t\\r]*".to_string(),
                },
                JSON_CHAR => r#"[^"\\\u0000-\u001f] | "\\" (["\\/bfnrt] | "u" [0-9a-fA-F]{4})"#.to_string(),
                JSON_STRING => format!("{} {}* {}", QUOTE, self.shared_rule(JSON_CHAR), QUOTE),
                JSON_NUMBER => r#""-"? ("0" | [1-9] [0-9]*) ("." [0-9]+)? ([eE] [+-]? [0-9]+)?"#.to_string(),
                ANY_VALUE => {
                    let parts = [
                        self.shared_rule(ANY_OBJECT),
                        self.shared_rule(ANY_ARRAY),
                        self.shared_rule(JSON_STRING),
                        self.shared_rule(JSON_NUMBER),
                    ];
                    format!("{} | \"true\" | \"false\" | \"null\"", parts.join(" | "))
                }
                ANY_MEMBER => {
                    let key = self.shared_rule(JSON_STRING);
                    let value = self.shared_rule(ANY_VALUE);
                    seq(&[&key, &flat.kv_sep(), &value])
                }
                ANY_OBJECT => {
                    let member = self.shared_rule(ANY_MEMBER);
                    let rest = format!("({} {})*", flat.item_sep(0), member);
                    let nonempty = seq(&["\"{\"", &flat.open(0), &member, &rest, &flat.close(0), "\"}\""]);
                    format!("{} | {}", nonempty, flat.empty("{", "}"))
                }
                ANY_ARRAY => {
                    let value = self.shared_rule(ANY_VALUE);
                    let rest = format!("({} {})*", flat.item_sep(0), value);
                    let nonempty = seq(&["\"[\"", &flat.open(0), &value, &rest, &flat.close(0), "\"]\""]);
                    format!("{} | {}", nonempty, flat.empty("[", "]"))
                }
                _ => unreachable!("unknown shared rule {}", name),
            };
            self.add_rule(name.to_string(), body);
        }
        name.to_string()
    }

    fn visit(&mut self, schema: &'a Value, hint: &str, level: usize) -> Result<String> {
        if !self.depth.enter() {
            bail!(InvalidJsonSchema, "schema nesting exceeds the maximum depth {}", self.depth.max());
        }
        let result = self.visit_schema(schema, hint, level);
        self.depth.exit();
        result
    }

    fn visit_schema(&mut self, schema: &'a Value, hint: &str, level: usize) -> Result<String> {
        let obj = match schema {
            Value::Bool(true) => return Ok(self.shared_rule(ANY_VALUE)),
            Value::Bool(false) => bail!(InvalidJsonSchema, "schema `false` matches no value"),
            Value::Object(obj) => obj,
            other => bail!(InvalidJsonSchema, "schema must be an object or a boolean, got {}", other),
        };

        if let Some(reference) = obj.get("$ref") {
            return self.visit_ref(reference, level);
        }
        if let Some(value) = obj.get("const") {
            return Ok(json_literal(value));
        }
        if let Some(values) = obj.get("enum") {
            return self.visit_enum(values);
        }
        if let Some(alts) = obj.get("anyOf").or_else(|| obj.get("oneOf")) {
            return self.visit_any_of(alts, hint, level);
        }
        if let Some(all_of) = obj.get("allOf") {
            return match all_of.as_array().map(Vec::as_slice) {
                Some([single]) => self.visit(single, hint, level),
                Some(_) => bail!(InvalidJsonSchema, "allOf is only supported with exactly one schema"),
                None => bail!(InvalidJsonSchema, "allOf must be an array"),
            };
        }

        match obj.get("type") {
            Some(Value::String(t)) => self.visit_typed(schema, obj, t, hint, level),
            Some(Value::Array(types)) => {
                if types.is_empty() {
                    bail!(InvalidJsonSchema, "type array must not be empty");
                }
                let mut alts = Vec::with_capacity(types.len());
                for t in types {
                    let Some(t) = t.as_str() else {
                        bail!(InvalidJsonSchema, "type entries must be strings, got {}", t);
                    };
                    alts.push(self.visit_typed(schema, obj, t, hint, level)?);
                }
                Ok(choices(&alts))
            }
            Some(other) => bail!(InvalidJsonSchema, "type must be a string or an array, got {}", other),
            None => {
                let has = |keys: &[&str]| keys.iter().any(|k| obj.contains_key(*k));
                let inferred = if has(&["properties", "required", "additionalProperties", "minProperties", "maxProperties"]) {
                    "object"
                } else if has(&["items", "prefixItems", "minItems", "maxItems"]) {
                    "array"
                } else if has(&["pattern", "format", "minLength", "maxLength"]) {
                    "string"
                } else if has(&["minimum", "maximum", "exclusiveMinimum", "exclusiveMaximum"]) {
                    "number"
                } else {
                    return Ok(self.shared_rule(ANY_VALUE));
                };
                self.visit_typed(schema, obj, inferred, hint, level)
            }
        }
    }

    fn visit_ref(&mut self, reference: &Value, level: usize) -> Result<String> {
        let Some(path) = reference.as_str() else {
            bail!(InvalidJsonSchema, "$ref must be a string, got {}", reference);
        };
        if let Some(name) = self.refs.get(path) {
            return Ok(name.clone());
        }
        let root_schema = self.root_schema;
        let target = match path {
            "#" => Some(root_schema),
            p if p.starts_with("#/") => root_schema.pointer(&p[1..]),
            _ => bail!(InvalidJsonSchema, "unsupported $ref {:?}: only local references are supported", path),
        };
        let Some(target) = target else {
            bail!(InvalidJsonSchema, "$ref {:?} does not resolve", path);
        };

        let last = path.rsplit('/').next().filter(|s| !s.is_empty() && *s != "#").unwrap_or("root_ref");
        let name = self.fresh_name(last);
        // Registered before visiting so recursive references terminate.
        self.refs.insert(path.to_string(), name.clone());
        let body = self.visit(target, &name, level)?;
        self.add_rule(name.clone(), body);
        Ok(name)
    }

    fn visit_enum(&mut self, values: &Value) -> Result<String> {
        match values.as_array() {
            Some(values) if !values.is_empty() => Ok(choices(&values.iter().map(json_literal).collect::<Vec<_>>())),
            Some(_) => bail!(InvalidJsonSchema, "enum must not be empty"),
            None => bail!(InvalidJsonSchema, "enum must be an array"),
        }
    }

    fn visit_any_of(&mut self, alts: &'a Value, hint: &str, level: usize) -> Result<String> {
        let alts = match alts.as_array() {
            Some(alts) if !alts.is_empty() => alts,
            Some(_) => bail!(InvalidJsonSchema, "anyOf/oneOf must not be empty"),
            None => bail!(InvalidJsonSchema, "anyOf/oneOf must be an array"),
        };
        let mut exprs = Vec::with_capacity(alts.len());
        for (i, alt) in alts.iter().enumerate() {
            exprs.push(self.visit(alt, &format!("{}_case_{}", hint, i), level)?);
        }
        Ok(choices(&exprs))
    }

    fn visit_typed(
        &mut self,
        schema: &Value,
        obj: &'a Map<String, Value>,
        type_name: &str,
        hint: &str,
        level: usize,
    ) -> Result<String> {
        match type_name {
            "string" => self.visit_string(obj, hint),
            "integer" => self.visit_integer(obj),
            "number" => self.visit_number(obj),
            "boolean" => Ok("(\"true\" | \"false\")".to_string()),
            "null" => Ok("\"null\"".to_string()),
            "array" | "object" => {
                let key = (format!("{}:{}", type_name, schema), self.layout.level_key(level));
                if let Some(name) = self.cache.get(&key) {
                    return Ok(name.clone());
                }
                let body = if type_name == "array" {
                    self.visit_array(obj, hint, level)?
                } else {
                    self.visit_object(obj, hint, level)?
                };
                let name = self.fresh_name(hint);
                self.add_rule(name.clone(), body);
                self.cache.insert(key, name.clone());
                Ok(name)
            }
            other => bail!(InvalidJsonSchema, "unknown type {:?}", other),
        }
    }

    fn visit_string(&mut self, obj: &Map<String, Value>, hint: &str) -> Result<String> {
        if let Some(format) = obj.get("format").and_then(Value::as_str) {
            match format_to_regex(format) {
                Some(pattern) => return self.string_from_regex(pattern, hint),
                None => tracing::debug!(format, "unknown string format; accepting any string"),
            }
        }
        if let Some(pattern) = obj.get("pattern") {
            let Some(pattern) = pattern.as_str() else {
                bail!(InvalidJsonSchema, "pattern must be a string, got {}", pattern);
            };
            return self.string_from_regex(pattern, hint);
        }

        let min = get_count(obj, "minLength")?.unwrap_or(0);
        let max = get_count(obj, "maxLength")?;
        if max.is_some_and(|max| max < min) {
            bail!(InvalidJsonSchema, "minLength {} is greater than maxLength {}", min, max.unwrap_or(0));
        }
        if (min, max) == (0, None) {
            return Ok(self.shared_rule(JSON_STRING));
        }
        if max == Some(0) {
            return Ok(quote_literal("\"\""));
        }
        let ch = self.shared_rule(JSON_CHAR);
        Ok(format!("{} {}{} {}", QUOTE, ch, repetition_suffix(min, max), QUOTE))
    }

    fn string_from_regex(&mut self, pattern: &str, hint: &str) -> Result<String> {
        let body = self.regex_body(pattern)?;
        let name = self.fresh_name(&format!("{}_pattern", hint));
        self.add_rule(name.clone(), body);
        Ok(format!("{} {} {}", QUOTE, name, QUOTE))
    }

    fn regex_body(&self, pattern: &str) -> Result<String> {
        let ebnf = regex_to_ebnf(pattern).map_err(|e| err!(InvalidJsonSchema, "invalid pattern {:?}: {}", pattern, e))?;
        Ok(ebnf.trim_start_matches("root ::= ").trim_end().to_string())
    }

    fn visit_integer(&mut self, obj: &Map<String, Value>) -> Result<String> {
        let (lo, hi) = numeric_bounds(obj)?;
        let (lo, hi) = (integer_lower(lo), integer_upper(hi));
        if let (Some(lo), Some(hi)) = (lo, hi) {
            if lo > hi {
                bail!(InvalidJsonSchema, "no integer lies between the minimum and maximum");
            }
        }
        Ok(format!("({})", self.regex_body(&integer_range_regex(lo, hi))?))
    }

    /// Bounded numbers: integers in range, plus fractions whose integer part
    /// keeps every possible fraction in range.
    fn visit_number(&mut self, obj: &Map<String, Value>) -> Result<String> {
        let (lo, hi) = numeric_bounds(obj)?;
        if lo.is_none() && hi.is_none() {
            return Ok(self.shared_rule(JSON_NUMBER));
        }

        let mut alts = Vec::new();
        let range = |lo: Option<i64>, hi: Option<i64>| match (lo, hi) {
            (Some(l), Some(h)) if l > h => None,
            _ => Some(integer_range_regex(lo, hi)),
        };
        if let Some(re) = range(integer_lower(lo), integer_upper(hi)) {
            alts.push(re);
        }
        // n.fff with n >= 0 lies in (n, n + 1).
        let n_lo = lo.map_or(0, |(v, _)| (v.ceil() as i64).max(0));
        let n_hi = hi.map(|(v, _)| v.floor() as i64 - 1);
        if let Some(re) = range(Some(n_lo), n_hi) {
            alts.push(format!("{}\\.[0-9]+", re));
        }
        // -m.fff lies in (-(m + 1), -m).
        let m_lo = hi.map_or(0, |(v, _)| ((-v).ceil() as i64).max(0));
        let m_hi = lo.map(|(v, _)| (-v).floor() as i64 - 1);
        if let Some(re) = range(Some(m_lo), m_hi) {
            alts.push(format!("-{}\\.[0-9]+", re));
        }

        if alts.is_empty() {
            bail!(InvalidJsonSchema, "no number lies between the minimum and maximum");
        }
        Ok(format!("({})", self.regex_body(&alts.join("|"))?))
    }

    fn visit_array(&mut self, obj: &'a Map<String, Value>, hint: &str, level: usize) -> Result<String> {
        let mut prefix: Vec<&'a Value> = match obj.get("prefixItems") {
            None => Vec::new(),
            Some(Value::Array(items)) => items.iter().collect(),
            Some(other) => bail!(InvalidJsonSchema, "prefixItems must be an array, got {}", other),
        };
        let mut items = obj.get("items");
        // Older drafts spell tuples as an `items` array plus `additionalItems`.
        if let Some(Value::Array(tuple)) = items {
            if !prefix.is_empty() {
                bail!(InvalidJsonSchema, "items cannot be an array when prefixItems is present");
            }
            prefix = tuple.iter().collect();
            items = obj.get("additionalItems");
        }

        let min = get_count(obj, "minItems")?.unwrap_or(0);
        let max = get_count(obj, "maxItems")?;
        if max.is_some_and(|max| max < min) {
            bail!(InvalidJsonSchema, "minItems {} is greater than maxItems {}", min, max.unwrap_or(0));
        }

        let mut prefix_exprs = Vec::with_capacity(prefix.len());
        for (i, item) in prefix.iter().copied().enumerate() {
            prefix_exprs.push(self.visit(item, &format!("{}_item_{}", hint, i), level + 1)?);
        }
        let extra = match items {
            Some(Value::Bool(false)) => None,
            Some(schema) => Some(self.visit(schema, &format!("{}_item", hint), level + 1)?),
            None if self.strict_mode => None,
            None => Some(self.shared_rule(ANY_VALUE)),
        };

        let k = prefix_exprs.len();
        let cap = match (&extra, max) {
            (None, max) => Some(max.map_or(k, |m| m.min(k))),
            (Some(_), max) => max,
        };
        if cap.is_some_and(|c| c < min) {
            bail!(InvalidJsonSchema, "minItems {} cannot be satisfied by the declared items", min);
        }
        let empty = self.layout.empty("[", "]");
        if cap == Some(0) {
            return Ok(empty);
        }

        let first = match prefix_exprs.first().or(extra.as_ref()) {
            Some(first) => first.clone(),
            None => return Ok(empty),
        };
        let shape = ArrayShape {
            prefix: &prefix_exprs,
            extra: extra.as_deref(),
            sep: self.layout.item_sep(level),
            min,
            cap,
        };
        let nonempty = seq(&[
            "\"[\"",
            &self.layout.open(level),
            &first,
            &shape.tail(1),
            &self.layout.close(level),
            "\"]\"",
        ]);
        Ok(if min == 0 { format!("({} | {})", nonempty, empty) } else { nonempty })
    }

    fn visit_object(&mut self, obj: &'a Map<String, Value>, hint: &str, level: usize) -> Result<String> {
        let properties: Vec<(&'a String, &'a Value)> = match obj.get("properties") {
            None => Vec::new(),
            Some(Value::Object(props)) => props.iter().collect(),
            Some(other) => bail!(InvalidJsonSchema, "properties must be an object, got {}", other),
        };
        let required: Vec<&str> = match obj.get("required") {
            None => Vec::new(),
            Some(Value::Array(names)) => names
                .iter()
                .map(|n| n.as_str().ok_or_else(|| err!(InvalidJsonSchema, "required entries must be strings, got {}", n)))
                .collect::<Result<_>>()?,
            Some(other) => bail!(InvalidJsonSchema, "required must be an array, got {}", other),
        };
        let min = get_count(obj, "minProperties")?.unwrap_or(0);
        let max = get_count(obj, "maxProperties")?;
        if let Some(max) = max {
            if min > max {
                bail!(InvalidJsonSchema, "minProperties {} is greater than maxProperties {}", min, max);
            }
            if required.len() > max {
                bail!(InvalidJsonSchema, "{} required properties exceed maxProperties {}", required.len(), max);
            }
        }

        let additional = match obj.get("additionalProperties") {
            Some(Value::Bool(false)) => None,
            Some(Value::Bool(true)) => Some(self.shared_rule(ANY_VALUE)),
            Some(schema @ Value::Object(_)) => Some(self.visit(schema, &format!("{}_additional", hint), level + 1)?),
            Some(other) => bail!(InvalidJsonSchema, "additionalProperties must be a boolean or a schema, got {}", other),
            None if self.strict_mode => None,
            None => Some(self.shared_rule(ANY_VALUE)),
        };

        let kv = self.layout.kv_sep();
        let mut pairs: Vec<(String, bool)> = Vec::new();
        for &(key, schema) in &properties {
            let value = self.visit(schema, &format!("{}_{}", hint, key), level + 1)?;
            let pair = seq(&[&json_literal(&Value::String(key.clone())), &kv, &value]);
            pairs.push((pair, required.contains(&key.as_str())));
        }
        for name in required.iter().filter(|n| !properties.iter().any(|(k, _)| k.as_str() == **n)) {
            let value = self.shared_rule(ANY_VALUE);
            pairs.push((seq(&[&json_literal(&Value::String(name.to_string())), &kv, &value]), true));
        }
        let additional_pair = additional.map(|value| {
            let key = self.shared_rule(JSON_STRING);
            seq(&[&key, &kv, &value])
        });

        let layout = self.layout.clone();
        let empty = layout.empty("{", "}");
        let sep = layout.item_sep(level);
        let wrap = |content: &str, nullable: bool| {
            let nonempty = seq(&["\"{\"", &layout.open(level), content, &layout.close(level), "\"}\""]);
            if nullable {
                format!("({} | {})", nonempty, empty)
            } else {
                nonempty
            }
        };

        if pairs.is_empty() {
            let Some(pair) = additional_pair else {
                if min > 0 {
                    bail!(InvalidJsonSchema, "minProperties {} cannot be satisfied without properties", min);
                }
                return Ok(empty);
            };
            if max == Some(0) {
                return Ok(empty);
            }
            let rest_suffix = repetition_suffix(min.saturating_sub(1), max.map(|m| m - 1));
            let rest = if rest_suffix.is_empty() { String::new() } else { format!("({} {}){}", sep, pair, rest_suffix) };
            return Ok(wrap(&seq(&[&pair, &rest]), min == 0));
        }

        if min > 0 || max.is_some() {
            tracing::warn!(hint, "minProperties/maxProperties are only enforced on objects without declared properties");
        }

        // tails[i]: what may follow once some property before index i has
        // been written. Every element carries its leading separator.
        let n = pairs.len();
        let has_optional = pairs.iter().any(|(_, req)| !req);
        let mut tails = vec![String::new(); n + 1];
        if let Some(pair) = &additional_pair {
            tails[n] = format!("({} {})*", sep, pair);
        }
        for i in (1..n).rev() {
            let (pair, req) = &pairs[i];
            let piece = if *req { seq(&[&sep, pair]) } else { format!("({})?", seq(&[&sep, pair])) };
            let body = seq(&[&piece, &tails[i + 1]]);
            tails[i] = if has_optional {
                let name = self.fresh_name(&format!("{}_tail", hint));
                self.add_rule(name.clone(), body);
                name
            } else {
                body
            };
        }

        // firsts: content starting at index i when nothing was written yet.
        let mut first: Option<String> = additional_pair.as_ref().map(|pair| seq(&[pair, &tails[n]]));
        for i in (0..n).rev() {
            let (pair, req) = &pairs[i];
            let own = seq(&[pair, &tails[i + 1]]);
            first = Some(match first {
                Some(later) if !req => format!("({} | {})", own, later),
                _ => own,
            });
        }
        let nullable = pairs.iter().all(|(_, req)| !req);
        match first {
            Some(content) => Ok(wrap(&content, nullable)),
            None => Ok(empty),
        }
    }
}

/// Items of an array layout: positional prefix items, then repetitions of
/// the extra item schema, between `min` and `cap` items in total.
struct ArrayShape<'s> {
    prefix: &'s [String],
    extra: Option<&'s str>,
    sep: String,
    min: usize,
    cap: Option<usize>,
}

impl ArrayShape<'_> {
    /// Items from position `i` on, given that `i` items precede them.
    fn tail(&self, i: usize) -> String {
        if self.cap == Some(i) {
            return String::new();
        }
        if i >= self.prefix.len() {
            let Some(extra) = self.extra else {
                return String::new();
            };
            let suffix = repetition_suffix(self.min.saturating_sub(i), self.cap.map(|c| c - i));
            return if suffix.is_empty() { String::new() } else { format!("({} {}){}", self.sep, extra, suffix) };
        }
        let piece = seq(&[&self.sep, &self.prefix[i], &self.tail(i + 1)]);
        if i < self.min {
            piece
        } else {
            format!("({})?", piece)
        }
    }
}

//! Structural tag to grammar converter.
//!
//! A structural tag describes output made of free text and tagged regions,
//! e.g. tool calls `<function=name>{json}</function>` embedded in prose.
//! The input is either `{"type": "structural_tag", "format": {...}}` or a
//! bare format object. Formats:
//!
//! - `const_string {value}`: the literal text
//! - `json_schema {json_schema}`: JSON valid under the schema
//! - `regex {pattern}`: text matched by the pattern
//! - `any_text`: any text; inside a `tag`, any text up to the tag's `end`
//! - `sequence {elements}` / `or {elements}`
//! - `tag {begin, content, end}`
//! - `triggered_tags {triggers, tags, at_least_one, stop_after_first}`: free
//!   text in which each occurrence of a trigger starts one of the tags
//! - `tags_with_separator {tags, separator, at_least_one, stop_after_first}`

use rustc_hash::FxHashMap;
use serde::Deserialize;
use serde_json::Value;

use crate::config::DepthGuard;
use crate::error::{bail, err, Error, Result};
use crate::grammar::builder::GrammarBuilder;
use crate::grammar::{ExprId, Grammar, RuleId};
use crate::json_schema::{schema_value_to_grammar, JsonSchemaOptions};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Format {
    ConstString {
        value: String,
    },
    JsonSchema {
        json_schema: Value,
    },
    Regex {
        pattern: String,
    },
    AnyText,
    Sequence {
        elements: Vec<Format>,
    },
    Or {
        elements: Vec<Format>,
    },
    Tag(TagFormat),
    TriggeredTags {
        triggers: Vec<String>,
        tags: Vec<TagFormat>,
        #[serde(default)]
        at_least_one: bool,
        #[serde(default)]
        stop_after_first: bool,
    },
    TagsWithSeparator {
        tags: Vec<TagFormat>,
        separator: String,
        #[serde(default)]
        at_least_one: bool,
        #[serde(default)]
        stop_after_first: bool,
    },
}

/// A tagged region. Inside tag lists the `"type": "tag"` field is optional.
#[derive(Debug, Clone, Deserialize)]
struct TagFormat {
    begin: String,
    content: Box<Format>,
    end: String,
}

/// Convert a structural tag JSON document to a Grammar.
pub fn structural_tag_to_grammar(json: &str) -> Result<Grammar> {
    let value: Value = serde_json::from_str(json).map_err(|e| Error::InvalidJson(e.to_string()))?;
    let format_value = match value.get("type").and_then(Value::as_str) {
        Some("structural_tag") => value
            .get("format")
            .ok_or_else(|| err!(InvalidStructuralTag, "structural tag has no \"format\" field"))?
            .clone(),
        _ => value,
    };
    let format: Format = serde_json::from_value(format_value)
        .map_err(|e| err!(InvalidStructuralTag, "invalid structural tag format: {}", e))?;

    let mut lowering = Lowering::new();
    let root = lowering.builder.add_rule("root");
    let body = lowering.lower(&format)?;
    lowering.builder.set_rule_body(root, body);
    let grammar = lowering.builder.build_with_root(root)?;
    tracing::debug!(rules = grammar.num_rules(), "converted structural tag to grammar");
    Ok(grammar)
}

impl Grammar {
    /// Build a grammar from a structural tag JSON document.
    pub fn from_structural_tag(json: &str) -> Result<Grammar> {
        structural_tag_to_grammar(json)
    }
}

struct Lowering {
    builder: GrammarBuilder,
    depth: DepthGuard,
}

impl Lowering {
    fn new() -> Self {
        Self {
            builder: GrammarBuilder::new(),
            depth: DepthGuard::new(),
        }
    }

    fn lower(&mut self, format: &Format) -> Result<ExprId> {
        if !self.depth.enter() {
            bail!(
                InvalidStructuralTag,
                "structural tag nesting exceeds the maximum depth of {}",
                self.depth.max()
            );
        }
        let result = self.lower_inner(format);
        self.depth.exit();
        result
    }

    fn lower_inner(&mut self, format: &Format) -> Result<ExprId> {
        match format {
            Format::ConstString { value } => Ok(self.builder.add_byte_string(value.as_bytes())),
            Format::JsonSchema { json_schema } => {
                let grammar = schema_value_to_grammar(json_schema, &JsonSchemaOptions::default())?;
                Ok(self.import(&grammar))
            }
            Format::Regex { pattern } => {
                let grammar = Grammar::from_regex(pattern)?;
                Ok(self.import(&grammar))
            }
            Format::AnyText => Ok(self.builder.add_character_class_star(true, Vec::new())),
            Format::Sequence { elements } => {
                if elements.is_empty() {
                    bail!(InvalidStructuralTag, "\"sequence\" needs at least one element");
                }
                let items = elements.iter().map(|e| self.lower(e)).collect::<Result<Vec<_>>>()?;
                Ok(self.builder.add_sequence(items))
            }
            Format::Or { elements } => {
                if elements.is_empty() {
                    bail!(InvalidStructuralTag, "\"or\" needs at least one element");
                }
                let items = elements.iter().map(|e| self.lower(e)).collect::<Result<Vec<_>>>()?;
                Ok(self.builder.add_choices(items))
            }
            Format::Tag(tag) => self.lower_tag(&tag.begin, &tag.content, &tag.end),
            Format::TriggeredTags {
                triggers,
                tags,
                at_least_one,
                stop_after_first,
            } => self.lower_triggered_tags(triggers, tags, *at_least_one, *stop_after_first),
            Format::TagsWithSeparator {
                tags,
                separator,
                at_least_one,
                stop_after_first,
            } => self.lower_tags_with_separator(tags, separator, *at_least_one, *stop_after_first),
        }
    }

    fn import(&mut self, grammar: &Grammar) -> ExprId {
        let rule = self.builder.import_grammar(grammar);
        self.builder.add_rule_ref(rule)
    }

    fn lower_tag(&mut self, begin: &str, content: &Format, end: &str) -> Result<ExprId> {
        let begin = self.builder.add_byte_string(begin.as_bytes());
        if matches!(content, Format::AnyText) && !end.is_empty() {
            let end_chars: Vec<char> = end.chars().collect();
            let until_end = self.add_scan_rules("tag_text", &[end_chars], &[None], false);
            let until_end = self.builder.add_rule_ref(until_end);
            return Ok(self.builder.add_sequence(vec![begin, until_end]));
        }
        let content = self.lower(content)?;
        let end = self.builder.add_byte_string(end.as_bytes());
        Ok(self.builder.add_sequence(vec![begin, content, end]))
    }

    fn lower_triggered_tags(
        &mut self,
        triggers: &[String],
        tags: &[TagFormat],
        at_least_one: bool,
        stop_after_first: bool,
    ) -> Result<ExprId> {
        if triggers.is_empty() {
            bail!(InvalidStructuralTag, "\"triggered_tags\" needs at least one trigger");
        }
        if tags.is_empty() {
            bail!(InvalidStructuralTag, "\"triggered_tags\" needs at least one tag");
        }
        if triggers.iter().any(String::is_empty) {
            bail!(InvalidStructuralTag, "triggers must not be empty strings");
        }

        // Each tag belongs to the first trigger its begin starts with
        let mut tags_by_trigger: Vec<Vec<&TagFormat>> = vec![Vec::new(); triggers.len()];
        for tag in tags {
            let Some(i) = triggers.iter().position(|t| tag.begin.starts_with(t.as_str())) else {
                bail!(
                    InvalidStructuralTag,
                    "tag begin \"{}\" does not start with any trigger",
                    tag.begin
                );
            };
            tags_by_trigger[i].push(tag);
        }
        if let Some(i) = tags_by_trigger.iter().position(Vec::is_empty) {
            bail!(InvalidStructuralTag, "trigger \"{}\" has no tags", triggers[i]);
        }

        // Rule per trigger: the rest of one of its tags after the trigger text
        let mut tag_rules = Vec::with_capacity(triggers.len());
        for (trigger, group) in triggers.iter().zip(&tags_by_trigger) {
            let rule = self.builder.add_rule_with_unique_name("triggered_tag");
            let mut alternatives = Vec::with_capacity(group.len());
            for tag in group {
                alternatives.push(self.lower_tag(&tag.begin[trigger.len()..], &tag.content, &tag.end)?);
            }
            let body = self.builder.add_choices(alternatives);
            self.builder.set_rule_body(rule, body);
            tag_rules.push(rule);
        }

        let patterns: Vec<Vec<char>> = triggers.iter().map(|t| t.chars().collect()).collect();
        if stop_after_first {
            let continuations: Vec<Option<RuleId>> = tag_rules.into_iter().map(Some).collect();
            let start = self.add_scan_rules("free_text", &patterns, &continuations, !at_least_one);
            return Ok(self.builder.add_rule_ref(start));
        }

        // After a tag, free text starts over; `text_loop` forwards to it
        let text_loop = self.builder.add_rule_with_unique_name("text_loop");
        let mut continuations = Vec::with_capacity(tag_rules.len());
        for tag_rule in tag_rules {
            let rule = self.builder.add_rule_with_unique_name("tag_then_text");
            let tag_ref = self.builder.add_rule_ref(tag_rule);
            let loop_ref = self.builder.add_rule_ref(text_loop);
            let body = self.builder.add_sequence(vec![tag_ref, loop_ref]);
            self.builder.set_rule_body(rule, body);
            continuations.push(Some(rule));
        }
        let after = self.add_scan_rules("free_text", &patterns, &continuations, true);
        let after_ref = self.builder.add_rule_ref(after);
        self.builder.set_rule_body(text_loop, after_ref);

        let start = if at_least_one {
            self.add_scan_rules("free_text", &patterns, &continuations, false)
        } else {
            after
        };
        Ok(self.builder.add_rule_ref(start))
    }

    fn lower_tags_with_separator(
        &mut self,
        tags: &[TagFormat],
        separator: &str,
        at_least_one: bool,
        stop_after_first: bool,
    ) -> Result<ExprId> {
        if tags.is_empty() {
            bail!(InvalidStructuralTag, "\"tags_with_separator\" needs at least one tag");
        }
        let any_tag = self.builder.add_rule_with_unique_name("any_tag");
        let mut alternatives = Vec::with_capacity(tags.len());
        for tag in tags {
            alternatives.push(self.lower_tag(&tag.begin, &tag.content, &tag.end)?);
        }
        let body = self.builder.add_choices(alternatives);
        self.builder.set_rule_body(any_tag, body);

        let list = if stop_after_first {
            self.builder.add_rule_ref(any_tag)
        } else {
            let rest = self.builder.add_rule_with_unique_name("separated_tag");
            let sep = self.builder.add_byte_string(separator.as_bytes());
            let tag_ref = self.builder.add_rule_ref(any_tag);
            let body = self.builder.add_sequence(vec![sep, tag_ref]);
            self.builder.set_rule_body(rest, body);

            let first = self.builder.add_rule_ref(any_tag);
            let more = self.builder.add_repeat(rest, 0, None);
            self.builder.add_sequence(vec![first, more])
        };
        if at_least_one {
            Ok(list)
        } else {
            let empty = self.builder.add_empty_string();
            Ok(self.builder.add_choices(vec![list, empty]))
        }
    }

    /// Add rules scanning text until the first occurrence of any pattern.
    ///
    /// One rule per state of an Aho-Corasick automaton over the patterns.
    /// When pattern `i` completes, the text continues with
    /// `continuations[i]` (or ends, for `None`). With `can_end`, the text may
    /// also end before any pattern occurs. Returns the start rule.
    fn add_scan_rules(
        &mut self,
        base: &str,
        patterns: &[Vec<char>],
        continuations: &[Option<RuleId>],
        can_end: bool,
    ) -> RuleId {
        let automaton = ScanAutomaton::new(patterns);

        // Match states end the scan, so they get no rule
        let mut state_rules: Vec<Option<RuleId>> = vec![None; automaton.num_states()];
        for (state, rule) in state_rules.iter_mut().enumerate() {
            if automaton.output[state].is_none() {
                *rule = Some(self.builder.add_rule_with_unique_name(base));
            }
        }
        // Patterns are non-empty, so the start state never matches
        let start = match state_rules[0] {
            Some(rule) => rule,
            None => self.builder.add_rule_with_unique_name(base),
        };

        let mut buf = [0u8; 4];
        for (state, rule) in state_rules.iter().enumerate() {
            let Some(rule) = *rule else { continue };
            let mut alternatives = Vec::new();
            if can_end {
                alternatives.push(self.builder.add_empty_string());
            }

            let mut leaving = Vec::new();
            for &c in &automaton.alphabet {
                let target = automaton.next(state, c);
                if target == 0 {
                    continue;
                }
                leaving.push((c as u32, c as u32));
                let lit = self.builder.add_byte_string(c.encode_utf8(&mut buf).as_bytes());
                let then = match automaton.output[target] {
                    Some(i) => continuations[i].map(|r| self.builder.add_rule_ref(r)),
                    None => state_rules[target].map(|r| self.builder.add_rule_ref(r)),
                };
                alternatives.push(match then {
                    Some(then) => self.builder.add_sequence(vec![lit, then]),
                    None => lit,
                });
            }

            let body = if state == 0 {
                // Characters that keep the automaton in the start state
                let stay = self.builder.add_character_class_star(true, leaving);
                let choices = self.builder.add_choices(alternatives);
                self.builder.add_sequence(vec![stay, choices])
            } else {
                let other = self.builder.add_character_class(true, leaving);
                let restart = self.builder.add_rule_ref(start);
                alternatives.push(self.builder.add_sequence(vec![other, restart]));
                self.builder.add_choices(alternatives)
            };
            self.builder.set_rule_body(rule, body);
        }
        start
    }
}

/// Aho-Corasick automaton over characters.
struct ScanAutomaton {
    children: Vec<FxHashMap<char, usize>>,
    fail: Vec<usize>,
    /// First pattern recognized on reaching each state, own or via the
    /// failure chain.
    output: Vec<Option<usize>>,
    /// Every character occurring in a pattern, sorted.
    alphabet: Vec<char>,
}

impl ScanAutomaton {
    fn new(patterns: &[Vec<char>]) -> Self {
        let mut children: Vec<FxHashMap<char, usize>> = vec![FxHashMap::default()];
        let mut output: Vec<Option<usize>> = vec![None];
        let mut alphabet: Vec<char> = Vec::new();

        for (i, pattern) in patterns.iter().enumerate() {
            let mut state = 0;
            for &c in pattern {
                alphabet.push(c);
                state = match children[state].get(&c) {
                    Some(&next) => next,
                    None => {
                        let next = children.len();
                        children.push(FxHashMap::default());
                        output.push(None);
                        children[state].insert(c, next);
                        next
                    }
                };
            }
            if output[state].is_none() {
                output[state] = Some(i);
            }
        }
        alphabet.sort_unstable();
        alphabet.dedup();

        // Breadth-first failure links
        let mut fail = vec![0usize; children.len()];
        let mut queue: std::collections::VecDeque<usize> = children[0].values().copied().collect();
        while let Some(state) = queue.pop_front() {
            let mut edges: Vec<(char, usize)> = children[state].iter().map(|(&c, &n)| (c, n)).collect();
            edges.sort_unstable();
            for (c, next) in edges {
                let mut f = fail[state];
                let link = loop {
                    if let Some(&t) = children[f].get(&c) {
                        break t;
                    }
                    if f == 0 {
                        break 0;
                    }
                    f = fail[f];
                };
                fail[next] = link;
                if output[next].is_none() {
                    output[next] = output[link];
                }
                queue.push_back(next);
            }
        }

        Self {
            children,
            fail,
            output,
            alphabet,
        }
    }

    fn num_states(&self) -> usize {
        self.children.len()
    }

    fn next(&self, mut state: usize, c: char) -> usize {
        loop {
            if let Some(&t) = self.children[state].get(&c) {
                return t;
            }
            if state == 0 {
                return 0;
            }
            state = self.fail[state];
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn kind_of(json: &str) -> ErrorKind {
        structural_tag_to_grammar(json).unwrap_err().kind()
    }

    #[test]
    fn test_const_string_wrapper_and_bare() {
        let wrapped = r#"{"type": "structural_tag", "format": {"type": "const_string", "value": "hi"}}"#;
        let bare = r#"{"type": "const_string", "value": "hi"}"#;
        let a = structural_tag_to_grammar(wrapped).unwrap();
        let b = structural_tag_to_grammar(bare).unwrap();
        assert_eq!(a.to_string(), b.to_string());
        assert_eq!(a.root().name, "root");
    }

    #[test]
    fn test_error_kinds() {
        assert_eq!(kind_of("{not json"), ErrorKind::InvalidJson);
        assert_eq!(kind_of(r#"{"type": "structural_tag"}"#), ErrorKind::InvalidStructuralTag);
        assert_eq!(kind_of(r#"{"type": "mystery"}"#), ErrorKind::InvalidStructuralTag);
        assert_eq!(kind_of(r#"{"type": "const_string"}"#), ErrorKind::InvalidStructuralTag);
        assert_eq!(kind_of(r#"{"type": "sequence", "elements": []}"#), ErrorKind::InvalidStructuralTag);
        assert_eq!(kind_of(r#"{"type": "or", "elements": []}"#), ErrorKind::InvalidStructuralTag);
        assert_eq!(
            kind_of(r#"{"type": "json_schema", "json_schema": {"type": "frobnicate"}}"#),
            ErrorKind::InvalidJsonSchema
        );
    }

    #[test]
    fn test_tag_without_matching_trigger() {
        let json = r#"{
            "type": "triggered_tags",
            "triggers": ["<call>"],
            "tags": [{"begin": "<tool>", "content": {"type": "any_text"}, "end": "</tool>"}]
        }"#;
        assert_eq!(kind_of(json), ErrorKind::InvalidStructuralTag);
    }

    #[test]
    fn test_scan_automaton_failure_links() {
        let automaton = ScanAutomaton::new(&["abab".chars().collect(), "bc".chars().collect()]);
        assert_eq!(automaton.alphabet, vec!['a', 'b', 'c']);
        // "ab" then 'c' falls back to "b" and completes "bc"
        let s = automaton.next(0, 'a');
        let s = automaton.next(s, 'b');
        let s = automaton.next(s, 'c');
        assert_eq!(automaton.output[s], Some(1));
        // "aba" + 'a' restarts from "a"
        let s = automaton.next(automaton.next(automaton.next(0, 'a'), 'b'), 'a');
        assert_eq!(automaton.next(s, 'a'), automaton.next(0, 'a'));
        assert_eq!(automaton.next(0, 'x'), 0);
    }
}

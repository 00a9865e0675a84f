//! Grammar model.
//!
//! A [`Grammar`] is a list of named rules whose bodies are expression trees
//! stored in a flat arena. Grammars are built with [`builder::GrammarBuilder`]
//! or parsed from EBNF ([`Grammar::from_ebnf`]) and never change afterwards;
//! [`Grammar::union`] and [`Grammar::concat`] return new grammars.

pub mod builder;
pub(crate) mod compose;
pub mod ebnf;
pub(crate) mod normalize;
pub(crate) mod optimizer;
pub(crate) mod serialize;

use std::fmt;

use serde::{Deserialize, Serialize};

/// Position of a rule in [`Grammar::rules`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(pub u32);

/// Handle to a node in the expression arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExprId(pub u32);

/// A named production.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    pub body: ExprId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lookahead: Option<Lookahead>,
}

/// Text that must follow a rule for the rule to complete. `is_exact`
/// lookaheads must match in full.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lookahead {
    pub expr: ExprId,
    pub is_exact: bool,
}

/// Expression node. Children are referenced by [`ExprId`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Expr {
    EmptyString,

    /// Literal bytes, normally UTF-8.
    ByteString(Vec<u8>),

    /// One codepoint from `ranges` (or outside them when `negated`).
    CharacterClass {
        negated: bool,
        /// Inclusive `(lo, hi)` codepoint pairs.
        ranges: Vec<(u32, u32)>,
    },

    /// Zero or more codepoints of the class.
    CharacterClassStar {
        negated: bool,
        ranges: Vec<(u32, u32)>,
    },

    RuleRef(RuleId),

    Sequence(Vec<ExprId>),

    Choices(Vec<ExprId>),

    /// `rule{min,max}`; no `max` repeats without bound.
    Repeat {
        rule: RuleId,
        min: u32,
        max: Option<u32>,
    },
}

/// Context-free grammar over bytes, frozen once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Grammar {
    pub(crate) rules: Vec<Rule>,
    pub(crate) exprs: Vec<Expr>,
    pub(crate) root_rule: RuleId,
}

impl Grammar {
    pub fn root_rule(&self) -> RuleId {
        self.root_rule
    }

    pub fn get_rule(&self, id: RuleId) -> &Rule {
        &self.rules[id.0 as usize]
    }

    pub fn get_expr(&self, id: ExprId) -> &Expr {
        &self.exprs[id.0 as usize]
    }

    pub fn num_rules(&self) -> usize {
        self.rules.len()
    }

    pub fn num_exprs(&self) -> usize {
        self.exprs.len()
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn root(&self) -> &Rule {
        &self.rules[self.root_rule.0 as usize]
    }

    pub fn find_rule(&self, name: &str) -> Option<RuleId> {
        let index = self.rules.iter().position(|rule| rule.name == name)?;
        Some(RuleId(index as u32))
    }

    /// Key identifying structurally-equal grammars: the canonical rendering
    /// plus the root rule name.
    pub(crate) fn cache_key(&self) -> String {
        format!("{}\n#root={}", self, self.root().name)
    }
}

impl fmt::Display for Grammar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sep = "";
        for rule in &self.rules {
            write!(f, "{}{} ::= ", sep, rule.name)?;
            self.fmt_expr(f, rule.body)?;
            if let Some(lookahead) = &rule.lookahead {
                f.write_str(" (= ")?;
                self.fmt_expr(f, lookahead.expr)?;
                f.write_str(")")?;
            }
            sep = "\n";
        }
        Ok(())
    }
}

impl Grammar {
    fn fmt_expr(&self, f: &mut fmt::Formatter<'_>, id: ExprId) -> fmt::Result {
        match self.get_expr(id) {
            Expr::EmptyString => write!(f, "\"\""),
            Expr::ByteString(bytes) => {
                write!(f, "\"")?;
                fmt_string_bytes(f, bytes)?;
                write!(f, "\"")
            }
            Expr::CharacterClass { negated, ranges } => {
                Self::fmt_char_class(f, *negated, ranges)
            }
            Expr::CharacterClassStar { negated, ranges } => {
                Self::fmt_char_class(f, *negated, ranges)?;
                write!(f, "*")
            }
            Expr::RuleRef(rule) => {
                write!(f, "{}", self.rules[rule.0 as usize].name)
            }
            Expr::Sequence(items) => self.fmt_list(f, items, " "),
            Expr::Choices(items) => self.fmt_list(f, items, " | "),
            Expr::Repeat { rule, min, max } => {
                write!(f, "{}{{{}", self.rules[rule.0 as usize].name, min)?;
                match max {
                    Some(max) if max == min => f.write_str("}"),
                    Some(max) => write!(f, ",{}}}", max),
                    None => f.write_str(",}"),
                }
            }
        }
    }

    /// Single-element lists print as their element, so parsing the output
    /// and printing again is stable.
    fn fmt_list(&self, f: &mut fmt::Formatter<'_>, items: &[ExprId], sep: &str) -> fmt::Result {
        if let [only] = items {
            return self.fmt_expr(f, *only);
        }
        write!(f, "(")?;
        for (i, &eid) in items.iter().enumerate() {
            if i > 0 {
                write!(f, "{}", sep)?;
            }
            self.fmt_expr(f, eid)?;
        }
        write!(f, ")")
    }

    fn fmt_char_class(f: &mut fmt::Formatter<'_>, negated: bool, ranges: &[(u32, u32)]) -> fmt::Result {
        write!(f, "[")?;
        if negated {
            write!(f, "^")?;
        }
        for &(lo, hi) in ranges {
            write_class_codepoint(f, lo)?;
            if lo != hi {
                write!(f, "-")?;
                write_class_codepoint(f, hi)?;
            }
        }
        write!(f, "]")
    }
}

fn write_class_codepoint(f: &mut fmt::Formatter<'_>, cp: u32) -> fmt::Result {
    match cp {
        0x5c => write!(f, "\\\\"),
        0x5d => write!(f, "\\]"),
        0x5b => write!(f, "\\["),
        0x5e => write!(f, "\\^"),
        0x2d => write!(f, "\\-"),
        0x09 => write!(f, "\\t"),
        0x0a => write!(f, "\\n"),
        0x0d => write!(f, "\\r"),
        0x20..=0x7e => write!(f, "{}", cp as u8 as char),
        0..=0xffff => write!(f, "\\u{:04x}", cp),
        _ => write!(f, "\\U{:08x}", cp),
    }
}

/// Render literal bytes for an EBNF string. Valid non-ASCII UTF-8 is printed
/// as-is; control characters and stray bytes are escaped.
fn fmt_string_bytes(f: &mut fmt::Formatter<'_>, bytes: &[u8]) -> fmt::Result {
    for chunk in bytes.utf8_chunks() {
        for c in chunk.valid().chars() {
            match c {
                '\\' => write!(f, "\\\\")?,
                '"' => write!(f, "\\\"")?,
                '\n' => write!(f, "\\n")?,
                '\r' => write!(f, "\\r")?,
                '\t' => write!(f, "\\t")?,
                c if (c as u32) < 0x20 || c as u32 == 0x7f => write!(f, "\\x{:02x}", c as u32)?,
                c => write!(f, "{}", c)?,
            }
        }
        for &b in chunk.invalid() {
            write!(f, "\\x{:02x}", b)?;
        }
    }
    Ok(())
}

//! Versioned JSON serialization.
//!
//! Every artifact is written as a JSON object carrying a `"version"` field next
//! to its payload fields. Reading distinguishes three failures: text that is
//! not JSON, a missing or different version, and a payload of the wrong shape.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::{max_recursion_depth, SERIALIZATION_VERSION};
use crate::error::{bail, err, Error, Result};

use super::{Expr, ExprId, Grammar, Rule, RuleId};

#[derive(Serialize)]
struct Envelope<'a, T: Serialize> {
    version: &'a str,
    #[serde(flatten)]
    payload: &'a T,
}

/// Serialize `payload` with the current format version.
pub(crate) fn write_versioned<T: Serialize>(payload: &T) -> Result<String> {
    serde_json::to_string(&Envelope {
        version: SERIALIZATION_VERSION,
        payload,
    })
    .map_err(|e| err!(Runtime, "serialization failed: {}", e))
}

/// Parse `json`, check its version and decode the payload.
pub(crate) fn read_versioned<T: DeserializeOwned>(json: &str) -> Result<T> {
    let value: serde_json::Value = serde_json::from_str(json).map_err(|e| Error::InvalidJson(e.to_string()))?;
    let serde_json::Value::Object(mut fields) = value else {
        bail!(DeserializeFormat, "expected a JSON object");
    };
    match fields.remove("version") {
        Some(serde_json::Value::String(v)) if v == SERIALIZATION_VERSION => {}
        found => {
            return Err(Error::DeserializeVersion {
                expected: SERIALIZATION_VERSION.to_string(),
                found: match found {
                    Some(serde_json::Value::String(v)) => v,
                    Some(other) => other.to_string(),
                    None => "<missing>".to_string(),
                },
            })
        }
    }
    serde_json::from_value(serde_json::Value::Object(fields)).map_err(|e| err!(DeserializeFormat, "{}", e))
}

#[derive(Serialize, Deserialize)]
pub(crate) struct GrammarRepr {
    root_rule: RuleId,
    rules: Vec<Rule>,
    exprs: Vec<Expr>,
}

impl GrammarRepr {
    pub(crate) fn from_grammar(grammar: &Grammar) -> Self {
        Self {
            root_rule: grammar.root_rule,
            rules: grammar.rules.clone(),
            exprs: grammar.exprs.clone(),
        }
    }

    pub(crate) fn into_grammar(self) -> Result<Grammar> {
        let grammar = Grammar {
            rules: self.rules,
            exprs: self.exprs,
            root_rule: self.root_rule,
        };
        validate(&grammar)?;
        Ok(grammar)
    }
}

impl Grammar {
    /// Serialize to versioned JSON.
    pub fn serialize_json(&self) -> Result<String> {
        write_versioned(&GrammarRepr::from_grammar(self))
    }

    /// Deserialize a grammar written by [`Grammar::serialize_json`].
    pub fn deserialize_json(json: &str) -> Result<Grammar> {
        read_versioned::<GrammarRepr>(json)?.into_grammar()
    }
}

/// Check the invariants the rest of the crate relies on: ids in range,
/// well-formed ranges and bounds, and an acyclic expression graph no deeper
/// than the recursion limit.
fn validate(grammar: &Grammar) -> Result<()> {
    let num_rules = grammar.rules.len();
    let num_exprs = grammar.exprs.len();
    let rule_ok = |r: RuleId| (r.0 as usize) < num_rules;
    let expr_ok = |e: ExprId| (e.0 as usize) < num_exprs;

    if !rule_ok(grammar.root_rule) {
        bail!(DeserializeFormat, "root rule {} out of range", grammar.root_rule.0);
    }
    for rule in &grammar.rules {
        if !expr_ok(rule.body) || rule.lookahead.as_ref().is_some_and(|la| !expr_ok(la.expr)) {
            bail!(DeserializeFormat, "rule \"{}\" refers to a missing expression", rule.name);
        }
    }
    for (i, expr) in grammar.exprs.iter().enumerate() {
        let ok = match expr {
            Expr::EmptyString | Expr::ByteString(_) => true,
            Expr::CharacterClass { ranges, .. } | Expr::CharacterClassStar { ranges, .. } => {
                ranges.iter().all(|&(lo, hi)| lo <= hi && hi <= 0x10FFFF)
            }
            Expr::RuleRef(r) => rule_ok(*r),
            Expr::Repeat { rule, min, max } => rule_ok(*rule) && max.map_or(true, |m| *min <= m),
            Expr::Sequence(items) | Expr::Choices(items) => items.iter().all(|e| expr_ok(*e)),
        };
        if !ok {
            bail!(DeserializeFormat, "expression {} is malformed", i);
        }
    }

    check_expr_depths(grammar)
}

fn check_expr_depths(grammar: &Grammar) -> Result<()> {
    const UNVISITED: u32 = 0;
    const IN_PROGRESS: u32 = u32::MAX;
    let max_depth = max_recursion_depth().min(u32::MAX as usize - 1) as u32;
    // depth[i]: UNVISITED, IN_PROGRESS, or 1 + height of expression i.
    let mut depth = vec![UNVISITED; grammar.exprs.len()];

    for start in 0..grammar.exprs.len() {
        if depth[start] != UNVISITED {
            continue;
        }
        let mut stack: Vec<(usize, usize)> = vec![(start, 0)];
        depth[start] = IN_PROGRESS;
        while let Some(top) = stack.last_mut() {
            let node = top.0;
            let children: &[ExprId] = match &grammar.exprs[node] {
                Expr::Sequence(items) | Expr::Choices(items) => items,
                _ => &[],
            };
            if let Some(child) = children.get(top.1) {
                top.1 += 1;
                let c = child.0 as usize;
                match depth[c] {
                    IN_PROGRESS => bail!(DeserializeFormat, "expression {} is part of a cycle", c),
                    UNVISITED => {
                        depth[c] = IN_PROGRESS;
                        stack.push((c, 0));
                    }
                    _ => {}
                }
                continue;
            }
            let height = 1 + children.iter().map(|c| depth[c.0 as usize]).max().unwrap_or(0);
            if height > max_depth {
                bail!(DeserializeFormat, "expression nesting exceeds the maximum depth {}", max_depth);
            }
            depth[node] = height;
            stack.pop();
        }
    }
    Ok(())
}

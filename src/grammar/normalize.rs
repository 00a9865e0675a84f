//! Grammar normalization ahead of automaton construction.
//!
//! Produces an equivalent grammar in which:
//! - nested `Sequence`s and nested `Choices` are flattened into their parent
//! - `EmptyString` elements of a `Sequence` are dropped
//! - single-element `Sequence`s and `Choices` are replaced by their element
//! - empty byte strings become `EmptyString`
//!
//! Rule ids are preserved, so references and the root stay valid.

use crate::error::Result;

use super::builder::GrammarBuilder;
use super::{Expr, ExprId, Grammar, RuleId};

pub(crate) fn normalize_grammar(grammar: &Grammar) -> Result<Grammar> {
    let mut builder = GrammarBuilder::new();
    for rule in grammar.rules() {
        builder.add_rule(&rule.name);
    }

    for (i, rule) in grammar.rules().iter().enumerate() {
        let id = RuleId(i as u32);
        let body = normalize_expr(grammar, &mut builder, rule.body);
        builder.set_rule_body(id, body);
        if let Some(ref la) = rule.lookahead {
            let la_expr = normalize_expr(grammar, &mut builder, la.expr);
            builder.set_rule_lookahead(id, la_expr, la.is_exact);
        }
    }

    builder.build_with_root(grammar.root_rule())
}

fn normalize_expr(grammar: &Grammar, builder: &mut GrammarBuilder, expr_id: ExprId) -> ExprId {
    match grammar.get_expr(expr_id) {
        Expr::ByteString(bytes) if bytes.is_empty() => builder.add_empty_string(),
        Expr::Sequence(items) => {
            let mut flat = Vec::with_capacity(items.len());
            for &item in items {
                let n = normalize_expr(grammar, builder, item);
                match &builder.exprs[n.0 as usize] {
                    Expr::EmptyString => {}
                    Expr::Sequence(inner) => flat.extend_from_slice(inner),
                    _ => flat.push(n),
                }
            }
            match flat.len() {
                0 => builder.add_empty_string(),
                1 => flat[0],
                _ => builder.add_sequence(flat),
            }
        }
        Expr::Choices(items) => {
            let mut flat = Vec::with_capacity(items.len());
            for &item in items {
                let n = normalize_expr(grammar, builder, item);
                match &builder.exprs[n.0 as usize] {
                    Expr::Choices(inner) => flat.extend_from_slice(inner),
                    _ => flat.push(n),
                }
            }
            if flat.len() == 1 {
                flat[0]
            } else {
                builder.add_choices(flat)
            }
        }
        other => builder.add_expr(other.clone()),
    }
}

//! Grammar composition: union and concatenation.

use crate::error::{bail, Result};

use super::builder::GrammarBuilder;
use super::{ExprId, Grammar};

enum Composition {
    Union,
    Concat,
}

fn compose(grammars: &[Grammar], how: Composition) -> Result<Grammar> {
    let op = match how {
        Composition::Union => "union",
        Composition::Concat => "concat",
    };
    if grammars.is_empty() {
        bail!(Runtime, "{} requires at least one grammar", op);
    }

    let mut builder = GrammarBuilder::new();
    let root = builder.add_rule("root");
    let refs: Vec<ExprId> = grammars
        .iter()
        .map(|g| {
            let imported = builder.import_grammar(g);
            builder.add_rule_ref(imported)
        })
        .collect();

    let body = match how {
        Composition::Union => builder.add_choices(refs),
        Composition::Concat => builder.add_sequence(refs),
    };
    builder.set_rule_body(root, body);
    let grammar = builder.build_with_root(root)?;
    tracing::debug!(inputs = grammars.len(), rules = grammar.num_rules(), "composed grammar via {}", op);
    Ok(grammar)
}

impl Grammar {
    /// A grammar matching any one of `grammars`.
    ///
    /// Rules of the inputs keep their names unless two inputs use the same
    /// name, in which case later copies get a numeric suffix.
    pub fn union(grammars: &[Grammar]) -> Result<Grammar> {
        compose(grammars, Composition::Union)
    }

    /// A grammar matching the inputs one after another, in order.
    pub fn concat(grammars: &[Grammar]) -> Result<Grammar> {
        compose(grammars, Composition::Concat)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_union_renames_clashing_rules() {
        let a = Grammar::from_ebnf("root ::= \"a\"", "root").unwrap();
        let b = Grammar::from_ebnf("root ::= \"b\"", "root").unwrap();
        let u = Grammar::union(&[a, b]).unwrap();
        assert_eq!(
            u.to_string(),
            "root ::= (root_1 | root_2)\nroot_1 ::= \"a\"\nroot_2 ::= \"b\""
        );
    }

    #[test]
    fn test_concat_orders_inputs() {
        let a = Grammar::from_ebnf("root ::= \"a\"", "root").unwrap();
        let b = Grammar::from_ebnf("start ::= \"b\"", "start").unwrap();
        let c = Grammar::concat(&[a, b]).unwrap();
        assert_eq!(c.to_string(), "root ::= (root_1 start)\nroot_1 ::= \"a\"\nstart ::= \"b\"");
    }

    #[test]
    fn test_empty_input_is_an_error() {
        assert_eq!(Grammar::union(&[]).unwrap_err().kind(), ErrorKind::Runtime);
        assert_eq!(Grammar::concat(&[]).unwrap_err().kind(), ErrorKind::Runtime);
    }
}

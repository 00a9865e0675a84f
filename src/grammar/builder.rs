use crate::error::{bail, Result};

use super::{Expr, ExprId, Grammar, Lookahead, Rule, RuleId};

/// Body placeholder for rules whose body has not been set yet.
const UNSET_BODY: ExprId = ExprId(u32::MAX);

/// Assembles rules and expressions into a [`Grammar`].
///
/// ```
/// use pie_grammar::GrammarBuilder;
///
/// let mut builder = GrammarBuilder::new();
/// let answer = builder.add_rule("answer");
/// let yes = builder.add_byte_string(b"yes");
/// let no = builder.add_byte_string(b"no");
/// let either = builder.add_choices(vec![yes, no]);
/// builder.set_rule_body(answer, either);
/// let grammar = builder.build("answer").unwrap();
/// assert_eq!(grammar.to_string(), r#"answer ::= ("yes" | "no")"#);
/// ```
#[derive(Debug, Default)]
pub struct GrammarBuilder {
    pub(crate) rules: Vec<Rule>,
    pub(crate) exprs: Vec<Expr>,
}

impl GrammarBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a new rule with no body yet. The body must be set later with
    /// `set_rule_body`.
    pub fn add_rule(&mut self, name: &str) -> RuleId {
        self.rules.push(Rule {
            name: name.to_string(),
            body: UNSET_BODY,
            lookahead: None,
        });
        RuleId(self.rules.len() as u32 - 1)
    }

    /// Add a rule whose name is derived from `base` and unused so far:
    /// `base` itself if free, else `base_1`, `base_2`, ...
    pub fn add_rule_with_unique_name(&mut self, base: &str) -> RuleId {
        let name = self.unique_rule_name(base);
        self.add_rule(&name)
    }

    pub(crate) fn unique_rule_name(&self, base: &str) -> String {
        if self.find_rule(base).is_none() {
            return base.to_string();
        }
        let mut n = 1usize;
        loop {
            let candidate = format!("{}_{}", base, n);
            if self.find_rule(&candidate).is_none() {
                return candidate;
            }
            n += 1;
        }
    }

    pub fn set_rule_body(&mut self, rule: RuleId, body: ExprId) {
        self.rules[rule.0 as usize].body = body;
    }

    pub fn set_rule_lookahead(&mut self, rule: RuleId, expr: ExprId, is_exact: bool) {
        self.rules[rule.0 as usize].lookahead = Some(Lookahead { expr, is_exact });
    }

    pub fn add_expr(&mut self, expr: Expr) -> ExprId {
        self.exprs.push(expr);
        ExprId(self.exprs.len() as u32 - 1)
    }

    pub fn add_empty_string(&mut self) -> ExprId {
        self.add_expr(Expr::EmptyString)
    }

    pub fn add_byte_string(&mut self, bytes: &[u8]) -> ExprId {
        self.add_expr(Expr::ByteString(bytes.to_vec()))
    }

    pub fn add_character_class(&mut self, negated: bool, ranges: Vec<(u32, u32)>) -> ExprId {
        self.add_expr(Expr::CharacterClass { negated, ranges })
    }

    pub fn add_character_class_star(&mut self, negated: bool, ranges: Vec<(u32, u32)>) -> ExprId {
        self.add_expr(Expr::CharacterClassStar { negated, ranges })
    }

    pub fn add_rule_ref(&mut self, rule: RuleId) -> ExprId {
        self.add_expr(Expr::RuleRef(rule))
    }

    pub fn add_sequence(&mut self, exprs: Vec<ExprId>) -> ExprId {
        self.add_expr(Expr::Sequence(exprs))
    }

    pub fn add_choices(&mut self, exprs: Vec<ExprId>) -> ExprId {
        self.add_expr(Expr::Choices(exprs))
    }

    pub fn add_repeat(&mut self, rule: RuleId, min: u32, max: Option<u32>) -> ExprId {
        self.add_expr(Expr::Repeat { rule, min, max })
    }

    pub fn find_rule(&self, name: &str) -> Option<RuleId> {
        let index = self.rules.iter().position(|rule| rule.name == name)?;
        Some(RuleId(index as u32))
    }

    pub fn num_rules(&self) -> usize {
        self.rules.len()
    }

    /// Copy every rule and expression of `grammar` into this builder, renaming
    /// rules that clash with names already present. Returns the id of the
    /// copied root rule.
    pub(crate) fn import_grammar(&mut self, grammar: &Grammar) -> RuleId {
        let rule_offset = self.rules.len() as u32;
        let expr_offset = self.exprs.len() as u32;
        let shift_rule = |r: RuleId| RuleId(r.0 + rule_offset);
        let shift_expr = |e: ExprId| ExprId(e.0 + expr_offset);

        // Names are reserved up front so that renamed copies cannot clash with
        // rules imported later in the same call.
        for rule in grammar.rules() {
            let name = self.unique_rule_name(&rule.name);
            self.rules.push(Rule {
                name,
                body: shift_expr(rule.body),
                lookahead: rule.lookahead.as_ref().map(|la| Lookahead {
                    expr: shift_expr(la.expr),
                    is_exact: la.is_exact,
                }),
            });
        }

        for expr in &grammar.exprs {
            let shifted = match expr {
                Expr::RuleRef(r) => Expr::RuleRef(shift_rule(*r)),
                Expr::Repeat { rule, min, max } => Expr::Repeat {
                    rule: shift_rule(*rule),
                    min: *min,
                    max: *max,
                },
                Expr::Sequence(items) => Expr::Sequence(items.iter().map(|e| shift_expr(*e)).collect()),
                Expr::Choices(items) => Expr::Choices(items.iter().map(|e| shift_expr(*e)).collect()),
                other => other.clone(),
            };
            self.exprs.push(shifted);
        }

        shift_rule(grammar.root_rule)
    }

    /// Finish the grammar with `root_rule_name` as its start rule. Every
    /// rule must have a body by now.
    pub fn build(self, root_rule_name: &str) -> Result<Grammar> {
        let Some(root_rule) = self.find_rule(root_rule_name) else {
            bail!(Runtime, "root rule \"{}\" not found", root_rule_name);
        };
        self.build_with_root(root_rule)
    }

    pub(crate) fn build_with_root(self, root_rule: RuleId) -> Result<Grammar> {
        for rule in &self.rules {
            if rule.body == UNSET_BODY {
                bail!(Runtime, "rule \"{}\" has no body", rule.name);
            }
        }

        Ok(Grammar {
            rules: self.rules,
            exprs: self.exprs,
            root_rule,
        })
    }
}

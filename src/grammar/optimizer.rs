use std::collections::VecDeque;

use rustc_hash::FxHashSet;

use super::{Expr, ExprId, Grammar, Rule, RuleId};

impl Grammar {
    /// Remove unreachable rules, inline rules referenced exactly once, then
    /// remove the rules that inlining left unreachable.
    pub fn optimize(&self) -> Grammar {
        self.eliminate_dead_rules()
            .inline_single_use_rules()
            .eliminate_dead_rules()
    }

    /// Drop rules the root can never reach, renumbering the survivors.
    pub fn eliminate_dead_rules(&self) -> Grammar {
        let live = self.find_reachable_rules();
        if live.len() == self.rules.len() {
            return self.clone();
        }

        let mut survivors = 0u32;
        let remap: Vec<Option<RuleId>> = (0..self.rules.len() as u32)
            .map(|i| {
                live.contains(&RuleId(i)).then(|| {
                    survivors += 1;
                    RuleId(survivors - 1)
                })
            })
            .collect();
        // Unreachable expressions may still name dropped rules; they are
        // pointed at the root so every id in the arena stays in range.
        let root = RuleId(0);
        let map = |r: &RuleId| remap[r.0 as usize].unwrap_or(root);

        let exprs = self
            .exprs
            .iter()
            .map(|expr| match expr {
                Expr::RuleRef(r) => Expr::RuleRef(map(r)),
                Expr::Repeat { rule, min, max } => Expr::Repeat {
                    rule: map(rule),
                    min: *min,
                    max: *max,
                },
                other => other.clone(),
            })
            .collect();

        let rules: Vec<Rule> = self
            .rules
            .iter()
            .enumerate()
            .filter_map(|(i, rule)| remap[i].map(|_| rule.clone()))
            .collect();

        Grammar {
            rules,
            exprs,
            root_rule: map(&self.root_rule),
        }
    }

    /// Inline rules that are referenced exactly once via `RuleRef` (not via
    /// `Repeat`, and not from a lookahead). Rules carrying a lookahead are
    /// never inlined.
    /// Inlined rules stay behind unreferenced.
    pub fn inline_single_use_rules(&self) -> Grammar {
        let mut uses = vec![0u32; self.rules.len()];
        let mut pinned: FxHashSet<u32> = FxHashSet::default();
        pinned.insert(self.root_rule.0);

        for expr in &self.exprs {
            match expr {
                Expr::RuleRef(r) => uses[r.0 as usize] += 1,
                Expr::Repeat { rule, .. } => {
                    pinned.insert(rule.0);
                }
                _ => {}
            }
        }
        for rule in &self.rules {
            if let Some(lookahead) = &rule.lookahead {
                let mut in_lookahead = FxHashSet::default();
                self.collect_refs_in(lookahead.expr, &mut in_lookahead);
                pinned.extend(in_lookahead.into_iter().map(|r| r.0));
            }
        }

        let to_inline: FxHashSet<u32> = (0..self.rules.len() as u32)
            .filter(|&i| {
                uses[i as usize] == 1
                    && !pinned.contains(&i)
                    && self.rules[i as usize].lookahead.is_none()
                    && !self.refers_to_itself(RuleId(i))
            })
            .collect();
        if to_inline.is_empty() {
            return self.clone();
        }

        let mut exprs = self.exprs.clone();
        for (idx, expr) in self.exprs.iter().enumerate() {
            if let Expr::RuleRef(r) = expr {
                if to_inline.contains(&r.0) {
                    let body = self.rules[r.0 as usize].body;
                    exprs[idx] = exprs[body.0 as usize].clone();
                }
            }
        }

        Grammar { exprs, ..self.clone() }
    }

    fn refers_to_itself(&self, rule: RuleId) -> bool {
        let mut refs = FxHashSet::default();
        self.collect_refs_in(self.rules[rule.0 as usize].body, &mut refs);
        refs.contains(&rule)
    }

    fn collect_refs_in(&self, expr_id: ExprId, out: &mut FxHashSet<RuleId>) {
        match &self.exprs[expr_id.0 as usize] {
            Expr::RuleRef(r) | Expr::Repeat { rule: r, .. } => {
                out.insert(*r);
            }
            Expr::Sequence(items) | Expr::Choices(items) => {
                for &e in items {
                    self.collect_refs_in(e, out);
                }
            }
            _ => {}
        }
    }

    fn find_reachable_rules(&self) -> FxHashSet<RuleId> {
        let mut seen = FxHashSet::from_iter([self.root_rule]);
        let mut frontier = VecDeque::from([self.root_rule]);
        while let Some(current) = frontier.pop_front() {
            let rule = &self.rules[current.0 as usize];
            let mut refs = FxHashSet::default();
            self.collect_refs_in(rule.body, &mut refs);
            if let Some(lookahead) = &rule.lookahead {
                self.collect_refs_in(lookahead.expr, &mut refs);
            }
            frontier.extend(refs.into_iter().filter(|r| seen.insert(*r)));
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use crate::grammar::builder::GrammarBuilder;
    use crate::grammar::{Expr, Grammar};

    #[test]
    fn test_unreachable_rules_are_dropped() {
        let g = Grammar::from_ebnf("unused ::= \"x\"\nroot ::= \"hello\"\nalso_unused ::= unused", "root").unwrap();
        let pruned = g.eliminate_dead_rules();
        assert_eq!(pruned.root_rule().0, 0);
        assert_eq!(pruned.to_string(), "root ::= \"hello\"");
    }

    #[test]
    fn test_single_use_rule_is_inlined() {
        let mut builder = GrammarBuilder::new();
        let root = builder.add_rule("root");
        let greeting = builder.add_rule("greeting");
        let text = builder.add_byte_string(b"hi");
        builder.set_rule_body(greeting, text);
        let call = builder.add_rule_ref(greeting);
        builder.set_rule_body(root, call);

        let flat = builder.build("root").unwrap().optimize();
        assert_eq!(flat.rules().len(), 1);
        assert_eq!(flat.get_expr(flat.root().body), &Expr::ByteString(b"hi".to_vec()));
    }

    #[test]
    fn test_repeat_and_multi_use_rules_are_kept() {
        let g = Grammar::from_ebnf("root ::= digit digit+\ndigit ::= [0-9]", "root").unwrap();
        let optimized = g.optimize();
        assert!(optimized.find_rule("digit").is_some());
    }

    #[test]
    fn test_recursive_rule_is_not_inlined() {
        let g = Grammar::from_ebnf("root ::= list\nlist ::= \"a\" list | \"b\"", "root").unwrap();
        let optimized = g.optimize();
        assert!(optimized.find_rule("list").is_some());
    }

    #[test]
    fn test_lookahead_rule_is_not_inlined() {
        let g = Grammar::from_ebnf("root ::= a \"c\"\na ::= \"b\" (= \"c\")", "root").unwrap();
        let optimized = g.optimize();
        assert!(optimized.find_rule("a").is_some());
    }
}

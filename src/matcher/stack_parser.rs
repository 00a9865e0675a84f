//! Earley-style recognizer over per-rule DFAs.
//!
//! An item is a DFA position inside one rule plus the level at which that
//! rule was entered. Byte steps stay inside a rule's DFA; prediction and
//! completion only happen where a rule-ref edge starts or a rule accepts.
//!
//! Every consumed byte commits one level: the scanable items reached after
//! that byte, the return entries registered while predicting at that level,
//! and whether the root rule can end there. Rolling back is truncation.

use std::fmt::Write as _;
use std::hash::Hash;
use std::sync::Arc;

use rustc_hash::FxHashSet;

use crate::compiled_grammar::CompiledGrammar;
use crate::fsm::{FsmEdge, StateId};
use crate::grammar::RuleId;

pub(super) const ROOT_LEVEL: u32 = u32::MAX;

/// `return_level` is [`ROOT_LEVEL`] for items of the root rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub(super) struct StackState {
    pub(super) rule_id: u32,
    pub(super) dfa_state: u32,
    pub(super) return_level: u32,
}

/// Membership set that scans a vector until it grows past
/// [`LINEAR_SCAN_LIMIT`], then switches to hashing.

const LINEAR_SCAN_LIMIT: usize = 12;

pub(super) struct SeenSet<T: Eq + Hash + Copy> {
    vec: Vec<T>,
    hashed: Option<FxHashSet<T>>,
}

impl<T: Eq + Hash + Copy> Default for SeenSet<T> {
    fn default() -> Self {
        Self {
            vec: Vec::new(),
            hashed: None,
        }
    }
}

impl<T: Eq + Hash + Copy> SeenSet<T> {
    pub(super) fn clear(&mut self) {
        self.vec.clear();
        self.hashed = None;
    }

    /// Returns false when `item` was already present.
    pub(super) fn insert(&mut self, item: T) -> bool {
        let fresh = match &mut self.hashed {
            Some(hashed) => hashed.insert(item),
            None => !self.vec.contains(&item),
        };
        if fresh {
            self.vec.push(item);
            if self.hashed.is_none() && self.vec.len() >= LINEAR_SCAN_LIMIT {
                self.hashed = Some(self.vec.iter().copied().collect());
            }
        }
        fresh
    }
}

/// Scratch buffers reused across advances.
#[derive(Default)]
struct Scratch {
    queue: Vec<StackState>,
    visited: SeenSet<StackState>,
    scanable: Vec<StackState>,
    returns: Vec<(u32, StackState)>,
}

impl Scratch {
    fn clear(&mut self) {
        self.queue.clear();
        self.visited.clear();
        self.scanable.clear();
        self.returns.clear();
    }
}

pub(super) struct StackParser {
    compiled: Arc<CompiledGrammar>,
    /// Items that can consume a byte, all levels concatenated.
    items: Vec<StackState>,
    item_starts: Vec<usize>,
    /// `(rule, parent item after the rule)` pairs awaiting completion.
    waiting: Vec<(u32, StackState)>,
    waiting_starts: Vec<usize>,
    /// Per level: the root rule may end here.
    root_done: Vec<bool>,
    scratch: Scratch,
}

impl StackParser {
    pub(super) fn new(compiled: Arc<CompiledGrammar>) -> Self {
        let mut parser = Self {
            compiled,
            items: Vec::new(),
            item_starts: Vec::new(),
            waiting: Vec::new(),
            waiting_starts: Vec::new(),
            root_done: Vec::new(),
            scratch: Scratch::default(),
        };
        parser.reset();
        parser
    }

    /// Drop all levels and expand the root rule again.
    pub(super) fn reset(&mut self) {
        self.items.clear();
        self.item_starts.clear();
        self.waiting.clear();
        self.waiting_starts.clear();
        self.root_done.clear();

        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.clear();
        let root = self.compiled.grammar.root_rule();
        self.expand_rule(root, ROOT_LEVEL, &mut scratch);
        let completed = self.process_queue(&mut scratch);
        self.commit_level(&mut scratch, completed);
        self.scratch = scratch;
    }

    /// Consume one byte. When no item can take it, nothing is committed and
    /// false is returned.
    pub(super) fn advance(&mut self, byte: u8) -> bool {
        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.clear();

        // Scan
        for &state in self.current_states() {
            let dfa = &self.compiled.rule_dfas[state.rule_id as usize];
            if let Some(next) = dfa.fsm.next_state(StateId(state.dfa_state), byte) {
                let next = StackState {
                    dfa_state: next.0,
                    ..state
                };
                if scratch.visited.insert(next) {
                    scratch.queue.push(next);
                }
            }
        }

        let survived = !scratch.queue.is_empty();
        if survived {
            let completed = self.process_queue(&mut scratch);
            self.commit_level(&mut scratch, completed);
        }
        self.scratch = scratch;
        survived
    }

    /// All-or-nothing version of [`advance`](Self::advance).
    pub(super) fn advance_bytes(&mut self, bytes: &[u8]) -> bool {
        let start = self.num_levels();
        for &byte in bytes {
            if !self.advance(byte) {
                self.pop_levels(self.num_levels() - start);
                return false;
            }
        }
        true
    }

    /// Undo the last `n` bytes; level 0 always stays.
    pub(super) fn pop_levels(&mut self, n: usize) {
        let keep = self.num_levels().saturating_sub(n).max(1);
        if keep >= self.num_levels() {
            return;
        }
        self.items.truncate(self.item_starts[keep]);
        self.item_starts.truncate(keep);
        self.waiting.truncate(self.waiting_starts[keep]);
        self.waiting_starts.truncate(keep);
        self.root_done.truncate(keep);
    }

    pub(super) fn num_levels(&self) -> usize {
        self.item_starts.len()
    }

    pub(super) fn can_terminate(&self) -> bool {
        self.root_done.last().copied().unwrap_or(false)
    }

    pub(super) fn current_states(&self) -> &[StackState] {
        match self.item_starts.last() {
            Some(&start) => &self.items[start..],
            None => &[],
        }
    }

    /// Bytes some current item can consume next, as a 256-bit set.
    pub(super) fn next_bytes(&self) -> [bool; 256] {
        let mut bytes = [false; 256];
        for state in self.current_states() {
            let dfa = &self.compiled.rule_dfas[state.rule_id as usize];
            for edge in dfa.fsm.edges(StateId(state.dfa_state)) {
                if let FsmEdge::CharRange { min, max, .. } = edge {
                    bytes[*min as usize..=*max as usize].fill(true);
                }
            }
        }
        bytes
    }

    /// Human-readable dump of the current items.
    pub(super) fn describe(&self) -> String {
        let grammar = &self.compiled.grammar;
        let mut text = String::new();
        let _ = writeln!(
            text,
            "level {} ({} items, can_terminate={})",
            self.num_levels() - 1,
            self.current_states().len(),
            self.can_terminate()
        );
        for state in self.current_states() {
            let name = &grammar.get_rule(RuleId(state.rule_id)).name;
            let origin = match state.return_level {
                ROOT_LEVEL => "root".to_string(),
                level => level.to_string(),
            };
            let _ = writeln!(text, "  {} @ state {} (from {})", name, state.dfa_state, origin);
        }
        text
    }

    fn commit_level(&mut self, scratch: &mut Scratch, completed: bool) {
        self.item_starts.push(self.items.len());
        self.items.extend_from_slice(&scratch.scanable);
        self.waiting_starts.push(self.waiting.len());
        self.waiting.extend_from_slice(&scratch.returns);
        self.root_done.push(completed);
    }

    /// Predict and complete until the queue drains; true when the root rule
    /// finished at this level. Predicting a nullable rule also advances its
    /// parent right away, which covers completions that happen before the
    /// parent's return entry exists.
    fn process_queue(&self, scratch: &mut Scratch) -> bool {
        let current_level = self.num_levels() as u32;
        let mut completed = false;

        let mut idx = 0;
        while idx < scratch.queue.len() {
            let state = scratch.queue[idx];
            idx += 1;

            let action = self.compiled.action(state.rule_id, state.dfa_state);

            // Predict
            for &(rule_id, target) in &action.rule_refs {
                let parent_after = StackState {
                    dfa_state: target,
                    ..state
                };
                scratch.returns.push((rule_id, parent_after));
                self.expand_rule(RuleId(rule_id), current_level, scratch);
                if self.compiled.nullable[rule_id as usize] && scratch.visited.insert(parent_after) {
                    scratch.queue.push(parent_after);
                }
            }

            // Complete
            if action.flags.is_accepting() {
                completed |= self.complete(&state, current_level, scratch);
            }

            if action.flags.has_char_edges() {
                scratch.scanable.push(state);
            }
        }
        completed
    }

    /// A rule finished: advance the parents waiting for it. Returns true when
    /// the finished rule is the root.
    fn complete(&self, state: &StackState, current_level: u32, scratch: &mut Scratch) -> bool {
        if state.return_level == ROOT_LEVEL {
            return true;
        }

        if state.return_level == current_level {
            // Returns of the level being built
            let mut i = 0;
            while i < scratch.returns.len() {
                let (expected_rule, parent_after) = scratch.returns[i];
                i += 1;
                if expected_rule == state.rule_id && scratch.visited.insert(parent_after) {
                    scratch.queue.push(parent_after);
                }
            }
            return false;
        }

        let level = state.return_level as usize;
        let end = match self.waiting_starts.get(level + 1) {
            Some(&end) => end,
            None => self.waiting.len(),
        };
        for &(expected_rule, parent_after) in &self.waiting[self.waiting_starts[level]..end] {
            if expected_rule == state.rule_id && scratch.visited.insert(parent_after) {
                scratch.queue.push(parent_after);
            }
        }
        false
    }

    fn expand_rule(&self, rule_id: RuleId, return_level: u32, scratch: &mut Scratch) {
        let state = StackState {
            rule_id: rule_id.0,
            dfa_state: self.compiled.rule_dfas[rule_id.0 as usize].start.0,
            return_level,
        };
        if scratch.visited.insert(state) {
            scratch.queue.push(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grammar::Grammar;
    use crate::tokenizer::{TokenizerInfo, VocabType};

    fn parser(ebnf: &str) -> StackParser {
        let grammar = Grammar::from_ebnf(ebnf, "root").unwrap();
        let tok = Arc::new(TokenizerInfo::new(&["a".to_string()], VocabType::Raw).unwrap());
        StackParser::new(Arc::new(CompiledGrammar::compile(&grammar, tok).unwrap()))
    }

    #[test]
    fn test_seen_set_switches_to_hashing() {
        let mut seen = SeenSet::default();
        assert!((0..LINEAR_SCAN_LIMIT as u32).all(|i| seen.insert(i)));
        assert!(seen.hashed.is_some());
        assert!(!seen.insert(3));
        seen.clear();
        assert!(seen.hashed.is_none());
        assert!(seen.insert(3));
    }

    #[test]
    fn test_nested_rules() {
        let mut p = parser("root ::= \"(\" inner \")\"\ninner ::= [0-9]+ | root");
        assert!(p.advance_bytes(b"((1"));
        assert!(!p.can_terminate());
        assert!(p.advance_bytes(b"))"));
        assert!(p.can_terminate());
        assert!(!p.advance(b')'));
    }

    #[test]
    fn test_failed_advance_bytes_is_atomic() {
        let mut p = parser("root ::= \"abc\"");
        assert!(p.advance(b'a'));
        let before = p.num_levels();
        assert!(!p.advance_bytes(b"bx"));
        assert_eq!(p.num_levels(), before);
        assert!(p.advance_bytes(b"bc"));
        assert!(p.can_terminate());
    }

    #[test]
    fn test_nullable_child_advances_parent() {
        let mut p = parser("root ::= opt opt \"x\"\nopt ::= \"\" | \"(\" root \")\"");
        assert!(p.advance(b'x'));
        assert!(p.can_terminate());

        p.reset();
        assert!(p.advance_bytes(b"(x)(x)x"));
        assert!(p.can_terminate());
    }

    #[test]
    fn test_pop_levels_restores_items() {
        let mut p = parser("root ::= [a-z]* \"!\"");
        let initial = p.current_states().to_vec();
        assert!(p.advance_bytes(b"abc"));
        p.pop_levels(3);
        assert_eq!(p.current_states(), initial.as_slice());
        p.pop_levels(10);
        assert_eq!(p.num_levels(), 1);
    }

    #[test]
    fn test_next_bytes() {
        let p = parser("root ::= \"a\" | \"b\" | other\nother ::= \"c\" \"d\" | \"c\" other");
        let next = p.next_bytes();
        let allowed: Vec<u8> = (0..=255u8).filter(|&b| next[b as usize]).collect();
        assert_eq!(allowed, b"abc".to_vec());
    }
}

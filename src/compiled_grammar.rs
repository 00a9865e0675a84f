//! A grammar lowered to per-rule DFAs and bound to one vocabulary.
//!
//! For every DFA state the tokens are split ahead of time into those that
//! certainly match, those that certainly fail, and the remainder whose
//! outcome depends on the rules above the current one. Only the remainder
//! is checked while decoding.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::bitmask::{bitmask_size, set_bit};
use crate::error::{bail, Result};
use crate::fsm::{build_rule_dfas, Automaton, DfaTable, FsmEdge, StateId};
use crate::grammar::normalize::normalize_grammar;
use crate::grammar::serialize::{read_versioned, write_versioned, GrammarRepr};
use crate::grammar::Grammar;
use crate::tokenizer::TokenizerInfo;

/// Upper bound on distinct parser configurations kept in the runtime bitmask cache.
const BITMASK_CACHE_CAPACITY: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct StateFlags(pub(crate) u8);

impl StateFlags {
    pub(crate) const CHAR_EDGES: u8 = 1;
    pub(crate) const ACCEPTING: u8 = 2;

    #[inline(always)]
    pub(crate) fn has_char_edges(self) -> bool {
        self.0 & Self::CHAR_EDGES != 0
    }
    #[inline(always)]
    pub(crate) fn is_accepting(self) -> bool {
        self.0 & Self::ACCEPTING != 0
    }
}

/// What the parser does on reaching one (rule, DFA state).
#[derive(Debug, Clone)]
pub(crate) struct StateAction {
    pub(crate) flags: StateFlags,
    /// `(called rule, state to resume at in the caller)`.
    pub(crate) rule_refs: Vec<(u32, u32)>,
}

/// Tokens accepted outright from a DFA state, stored as a sorted id list
/// when sparse and as a bitmask when dense.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum AcceptedTokens {
    Sparse(Vec<u32>),
    Dense(Vec<u32>),
}

/// Pre-computed token mask for a specific (rule_id, dfa_state) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct AdaptiveTokenMask {
    /// Tokens consumed entirely inside this rule's DFA: accepted whenever
    /// the state is live.
    accepted: AcceptedTokens,
    /// Positions in the tokenizer's sorted vocabulary (ascending) whose
    /// acceptance depends on the surrounding parse and must be checked at
    /// runtime.
    pub(crate) uncertain: Vec<u32>,
}

impl AdaptiveTokenMask {
    fn empty() -> Self {
        Self {
            accepted: AcceptedTokens::Sparse(Vec::new()),
            uncertain: Vec::new(),
        }
    }

    /// `accepted_ids` must be sorted ascending.
    fn new(accepted_ids: Vec<u32>, uncertain: Vec<u32>, vocab_size: usize) -> Self {
        let words = bitmask_size(vocab_size);
        let accepted = if accepted_ids.len() <= words {
            AcceptedTokens::Sparse(accepted_ids)
        } else {
            let mut bits = vec![0u32; words];
            for id in accepted_ids {
                set_bit(&mut bits, id as usize);
            }
            AcceptedTokens::Dense(bits)
        };
        Self { accepted, uncertain }
    }

    /// OR the accepted tokens into `dst`.
    pub(crate) fn or_accepted_into(&self, dst: &mut [u32]) {
        match &self.accepted {
            AcceptedTokens::Sparse(ids) => {
                for &id in ids {
                    set_bit(dst, id as usize);
                }
            }
            AcceptedTokens::Dense(bits) => {
                for (d, s) in dst.iter_mut().zip(bits) {
                    *d |= s;
                }
            }
        }
    }

    fn accepted_ids(&self) -> Vec<u32> {
        match &self.accepted {
            AcceptedTokens::Sparse(ids) => ids.clone(),
            AcceptedTokens::Dense(bits) => bits
                .iter()
                .enumerate()
                .flat_map(|(w, &word)| (0..32).filter(move |b| word >> b & 1 == 1).map(move |b| (w * 32 + b) as u32))
                .collect(),
        }
    }

    fn memory_size(&self) -> usize {
        let accepted = match &self.accepted {
            AcceptedTokens::Sparse(v) | AcceptedTokens::Dense(v) => v.len(),
        };
        (accepted + self.uncertain.len()) * 4 + std::mem::size_of::<Self>()
    }
}

enum TokenClass {
    Accepted,
    Rejected,
    Uncertain,
}

/// Grammar plus precomputed token masks for one tokenizer. Produced by
/// [`GrammarCompiler`](crate::GrammarCompiler) and shared by matchers
/// through an `Arc`.
pub struct CompiledGrammar {
    /// The grammar as given. Rule ids match the normalized form the DFAs
    /// were built from.
    pub(crate) grammar: Grammar,
    tokenizer_info: Arc<TokenizerInfo>,
    pub(crate) rule_dfas: Vec<Automaton<DfaTable>>,
    /// Actions of all rules back to back; rule `r` starts at `state_action_offsets[r]`.
    state_actions: Vec<StateAction>,
    state_action_offsets: Vec<u32>,
    /// `nullable[rule]`: the rule can match the empty string.
    pub(crate) nullable: Vec<bool>,
    /// Distinct token masks. Entry 0 is the empty mask.
    masks: Vec<AdaptiveTokenMask>,
    /// Mask of every (rule, state), aligned with `state_actions`.
    mask_index: Vec<u32>,
    /// Resolved bitmasks of parser configurations that needed no runtime
    /// token checks, keyed by their sorted (rule, state) pairs.
    bitmask_cache: RwLock<FxHashMap<Vec<(u32, u32)>, Vec<u32>>>,
}

#[derive(Serialize, Deserialize)]
struct CompiledGrammarRepr {
    grammar: GrammarRepr,
    tokenizer_fingerprint: String,
    masks: Vec<MaskRepr>,
    mask_index: Vec<u32>,
}

#[derive(Serialize, Deserialize)]
struct MaskRepr {
    accepted: Vec<u32>,
    uncertain: Vec<u32>,
}

impl CompiledGrammar {
    /// Normalize, build rule DFAs, then classify the vocabulary against every
    /// DFA state. Classification runs on the current rayon pool.
    pub(crate) fn compile(grammar: &Grammar, tokenizer_info: Arc<TokenizerInfo>) -> Result<Self> {
        let start = Instant::now();
        let rule_dfas = build_rule_dfas(&normalize_grammar(grammar)?);
        let (masks, mask_index) = precompute_token_masks(&rule_dfas, &tokenizer_info);
        let compiled = Self::assemble(grammar.clone(), tokenizer_info, rule_dfas, masks, mask_index);
        tracing::debug!(
            rules = compiled.grammar.num_rules(),
            states = compiled.state_actions.len(),
            distinct_masks = compiled.masks.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "compiled grammar"
        );
        Ok(compiled)
    }

    fn assemble(
        grammar: Grammar,
        tokenizer_info: Arc<TokenizerInfo>,
        rule_dfas: Vec<Automaton<DfaTable>>,
        masks: Vec<AdaptiveTokenMask>,
        mask_index: Vec<u32>,
    ) -> Self {
        let (state_actions, state_action_offsets) = compute_state_actions(&rule_dfas);
        let nullable = compute_nullable(&rule_dfas);
        Self {
            grammar,
            tokenizer_info,
            rule_dfas,
            state_actions,
            state_action_offsets,
            nullable,
            masks,
            mask_index,
            bitmask_cache: RwLock::new(FxHashMap::default()),
        }
    }

    /// The grammar this was compiled from.
    pub fn grammar(&self) -> &Grammar {
        &self.grammar
    }

    pub fn tokenizer_info(&self) -> &Arc<TokenizerInfo> {
        &self.tokenizer_info
    }

    /// Approximate heap footprint in bytes.
    pub fn memory_size(&self) -> usize {
        let dfas: usize = self.rule_dfas.iter().map(|d| d.fsm.memory_size() + d.ends.len()).sum();
        let actions: usize = self
            .state_actions
            .iter()
            .map(|a| std::mem::size_of::<StateAction>() + a.rule_refs.len() * 8)
            .sum();
        let masks: usize = self.masks.iter().map(AdaptiveTokenMask::memory_size).sum();
        let grammar = self.grammar.num_exprs() * 32 + self.grammar.num_rules() * 48;
        let cache: usize = self
            .bitmask_cache
            .read()
            .iter()
            .map(|(k, v)| k.len() * 8 + v.len() * 4)
            .sum();
        dfas + actions + masks + grammar + self.mask_index.len() * 4 + self.nullable.len() + cache
    }

    #[inline(always)]
    pub(crate) fn action(&self, rule_id: u32, dfa_state: u32) -> &StateAction {
        &self.state_actions[self.state_action_offsets[rule_id as usize] as usize + dfa_state as usize]
    }

    #[inline(always)]
    pub(crate) fn token_mask(&self, rule_id: u32, dfa_state: u32) -> &AdaptiveTokenMask {
        let flat = self.state_action_offsets[rule_id as usize] as usize + dfa_state as usize;
        &self.masks[self.mask_index[flat] as usize]
    }

    /// Copy a cached bitmask into `bitmask`. Returns true on cache hit.
    pub(crate) fn get_cached_bitmask(&self, key: &[(u32, u32)], bitmask: &mut [u32]) -> bool {
        match self.bitmask_cache.read().get(key) {
            Some(cached) => {
                bitmask.clone_from_slice(cached);
                true
            }
            None => false,
        }
    }

    pub(crate) fn cache_bitmask(&self, key: Vec<(u32, u32)>, bitmask: &[u32]) {
        let mut cache = self.bitmask_cache.write();
        if cache.len() < BITMASK_CACHE_CAPACITY {
            cache.entry(key).or_insert_with(|| bitmask.to_vec());
        }
    }

    /// Serialize to versioned JSON. The tokenizer is not embedded, only a
    /// fingerprint that must match at load time.
    pub fn serialize_json(&self) -> Result<String> {
        write_versioned(&CompiledGrammarRepr {
            grammar: GrammarRepr::from_grammar(&self.grammar),
            tokenizer_fingerprint: self.tokenizer_info.fingerprint(),
            masks: self
                .masks
                .iter()
                .map(|m| MaskRepr {
                    accepted: m.accepted_ids(),
                    uncertain: m.uncertain.clone(),
                })
                .collect(),
            mask_index: self.mask_index.clone(),
        })
    }

    /// Deserialize a compiled grammar written by [`CompiledGrammar::serialize_json`].
    ///
    /// DFAs are rebuilt from the stored grammar; token masks are reused.
    pub fn deserialize_json(json: &str, tokenizer_info: Arc<TokenizerInfo>) -> Result<Self> {
        let repr: CompiledGrammarRepr = read_versioned(json)?;
        let expected = tokenizer_info.fingerprint();
        if repr.tokenizer_fingerprint != expected {
            bail!(
                DeserializeFormat,
                "compiled grammar was built for tokenizer {}, got {}",
                repr.tokenizer_fingerprint,
                expected
            );
        }

        let grammar = repr.grammar.into_grammar()?;
        let rule_dfas = build_rule_dfas(&normalize_grammar(&grammar)?);
        let num_states: usize = rule_dfas.iter().map(|d| d.fsm.num_states()).sum();
        if repr.mask_index.len() != num_states {
            bail!(
                DeserializeFormat,
                "expected {} state masks, found {}",
                num_states,
                repr.mask_index.len()
            );
        }
        if repr.masks.is_empty() || repr.mask_index.iter().any(|&i| i as usize >= repr.masks.len()) {
            bail!(DeserializeFormat, "token mask index out of range");
        }

        let vocab_size = tokenizer_info.vocab_size();
        let sorted_len = tokenizer_info.sorted_vocab().len();
        let mut masks = Vec::with_capacity(repr.masks.len());
        for m in repr.masks {
            if m.accepted.iter().any(|&id| id as usize >= vocab_size)
                || m.uncertain.iter().any(|&pos| pos as usize >= sorted_len)
            {
                bail!(DeserializeFormat, "token mask refers to a token outside the vocabulary");
            }
            let mut accepted = m.accepted;
            accepted.sort_unstable();
            masks.push(AdaptiveTokenMask::new(accepted, m.uncertain, vocab_size));
        }

        Ok(Self::assemble(grammar, tokenizer_info, rule_dfas, masks, repr.mask_index))
    }
}

impl fmt::Debug for CompiledGrammar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledGrammar")
            .field("root", &self.grammar.root().name)
            .field("rules", &self.grammar.num_rules())
            .field("states", &self.state_actions.len())
            .field("distinct_masks", &self.masks.len())
            .field("vocab_size", &self.tokenizer_info.vocab_size())
            .finish()
    }
}

/// Actions of every rule's states, concatenated, with each rule's offset.
fn compute_state_actions(rule_dfas: &[Automaton<DfaTable>]) -> (Vec<StateAction>, Vec<u32>) {
    let mut flat: Vec<StateAction> = Vec::new();
    let mut starts: Vec<u32> = Vec::new();
    for dfa in rule_dfas {
        starts.push(flat.len() as u32);
        for state in (0..dfa.fsm.num_states() as u32).map(StateId) {
            let mut flags = 0u8;
            let mut rule_refs = Vec::new();
            for edge in dfa.fsm.edges(state) {
                match edge {
                    FsmEdge::CharRange { .. } => flags |= StateFlags::CHAR_EDGES,
                    FsmEdge::RuleRef { rule, target } => rule_refs.push((rule.0, target.0)),
                    FsmEdge::Epsilon(_) => {}
                }
            }
            if dfa.is_end(state) {
                flags |= StateFlags::ACCEPTING;
            }
            flat.push(StateAction {
                flags: StateFlags(flags),
                rule_refs,
            });
        }
    }
    (flat, starts)
}

/// A rule is nullable when an accepting state is reachable from its start
/// through rule-ref edges of nullable rules only.
fn compute_nullable(rule_dfas: &[Automaton<DfaTable>]) -> Vec<bool> {
    let mut nullable = vec![false; rule_dfas.len()];
    loop {
        let mut changed = false;
        for (r, dfa) in rule_dfas.iter().enumerate() {
            if !nullable[r] && reaches_end_without_input(dfa, &nullable) {
                nullable[r] = true;
                changed = true;
            }
        }
        if !changed {
            return nullable;
        }
    }
}

fn reaches_end_without_input(dfa: &Automaton<DfaTable>, nullable: &[bool]) -> bool {
    let mut seen = vec![false; dfa.fsm.num_states()];
    let mut stack = vec![dfa.start];
    seen[dfa.start.0 as usize] = true;
    while let Some(state) = stack.pop() {
        if dfa.is_end(state) {
            return true;
        }
        for edge in dfa.fsm.edges(state) {
            if let FsmEdge::RuleRef { rule, target } = edge {
                if nullable[rule.0 as usize] && !seen[target.0 as usize] {
                    seen[target.0 as usize] = true;
                    stack.push(*target);
                }
            }
        }
    }
    false
}

/// A token that stays inside this rule's DFA for all its bytes is accepted.
/// One that falls off is uncertain if it passed, after its first byte, a
/// state where control could leave the rule (accepting, or a rule-ref), and
/// rejected otherwise. Exits at `from` itself belong to the other closure
/// items, which have masks of their own.
fn classify_token(dfa: &Automaton<DfaTable>, boundary: &[bool], from: StateId, bytes: &[u8]) -> TokenClass {
    let mut at = from;
    let mut left_possible = false;
    for &byte in bytes {
        let Some(next) = dfa.fsm.next_state(at, byte) else {
            return if left_possible { TokenClass::Uncertain } else { TokenClass::Rejected };
        };
        at = next;
        left_possible = left_possible || boundary[at.0 as usize];
    }
    TokenClass::Accepted
}

/// Walk the byte-sorted vocabulary once; a rejected token takes its whole
/// prefix subtree with it.
fn compute_state_mask(
    dfa: &Automaton<DfaTable>,
    boundary: &[bool],
    state: StateId,
    tokenizer_info: &TokenizerInfo,
) -> AdaptiveTokenMask {
    let vocab = tokenizer_info.sorted_vocab();
    let subtree_end = tokenizer_info.trie_subtree_end();
    let (mut accepted, mut uncertain) = (Vec::new(), Vec::new());
    let mut pos = 0;
    while let Some((token_id, bytes)) = vocab.get(pos) {
        pos = match classify_token(dfa, boundary, state, bytes) {
            TokenClass::Accepted => {
                accepted.push(*token_id);
                pos + 1
            }
            TokenClass::Uncertain => {
                uncertain.push(pos as u32);
                pos + 1
            }
            TokenClass::Rejected => subtree_end[pos].max(pos + 1),
        };
    }

    accepted.sort_unstable();
    AdaptiveTokenMask::new(accepted, uncertain, tokenizer_info.vocab_size())
}

/// Masks for every (rule, state), deduplicated. Rules with identical DFAs
/// share one computation, which matters for converter output where the
/// same string and number rules recur. Returns the distinct masks and,
/// per flat state, the index of its mask.
fn precompute_token_masks(
    rule_dfas: &[Automaton<DfaTable>],
    tokenizer_info: &TokenizerInfo,
) -> (Vec<AdaptiveTokenMask>, Vec<u32>) {
    // Unique DFAs, in first-seen order
    let mut unique: Vec<&Automaton<DfaTable>> = Vec::new();
    let mut unique_of_rule = Vec::with_capacity(rule_dfas.len());
    {
        let mut seen: FxHashMap<&Automaton<DfaTable>, usize> = FxHashMap::default();
        for dfa in rule_dfas {
            let idx = *seen.entry(dfa).or_insert_with(|| {
                unique.push(dfa);
                unique.len() - 1
            });
            unique_of_rule.push(idx);
        }
    }

    let boundaries: Vec<Vec<bool>> = unique
        .iter()
        .map(|dfa| {
            (0..dfa.fsm.num_states())
                .map(|s| {
                    let state = StateId(s as u32);
                    dfa.is_end(state)
                        || dfa
                            .fsm
                            .edges(state)
                            .iter()
                            .any(|e| matches!(e, FsmEdge::RuleRef { .. }))
                })
                .collect()
        })
        .collect();

    // Only states with char edges are ever scanned at runtime
    let work: Vec<(usize, u32)> = unique
        .iter()
        .enumerate()
        .flat_map(|(u, dfa)| {
            (0..dfa.fsm.num_states() as u32)
                .filter(move |&s| {
                    dfa.fsm
                        .edges(StateId(s))
                        .iter()
                        .any(|e| matches!(e, FsmEdge::CharRange { .. }))
                })
                .map(move |s| (u, s))
        })
        .collect();

    let computed: Vec<AdaptiveTokenMask> = work
        .par_iter()
        .map(|&(u, s)| compute_state_mask(unique[u], &boundaries[u], StateId(s), tokenizer_info))
        .collect();
    tracing::trace!(
        unique_dfas = unique.len(),
        scanned_states = work.len(),
        "pre-computed token masks"
    );

    let mut masks = vec![AdaptiveTokenMask::empty()];
    let mut mask_ids: FxHashMap<AdaptiveTokenMask, u32> = FxHashMap::default();
    mask_ids.insert(AdaptiveTokenMask::empty(), 0);
    let mut mask_of_work: FxHashMap<(usize, u32), u32> = FxHashMap::default();
    for (&key, mask) in work.iter().zip(computed) {
        let id = match mask_ids.get(&mask) {
            Some(&id) => id,
            None => {
                let id = masks.len() as u32;
                masks.push(mask.clone());
                mask_ids.insert(mask, id);
                id
            }
        };
        mask_of_work.insert(key, id);
    }

    let mut mask_index = Vec::new();
    for (rule, dfa) in rule_dfas.iter().enumerate() {
        let u = unique_of_rule[rule];
        for s in 0..dfa.fsm.num_states() as u32 {
            mask_index.push(mask_of_work.get(&(u, s)).copied().unwrap_or(0));
        }
    }

    (masks, mask_index)
}

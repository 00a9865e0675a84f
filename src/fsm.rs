//! Byte-level automata for grammar rules.
//!
//! Each rule body is lowered to an [`NfaGraph`], determinized, then frozen
//! into a [`DfaTable`] with a dense byte table. Rule references survive as
//! labelled edges; the stack parser expands them at match time.

use std::collections::{BTreeSet, VecDeque};

use rustc_hash::{FxHashMap, FxHashSet};

use crate::grammar::{Expr, ExprId, Grammar, RuleId};

/// Rules whose inlined body would exceed this many edges keep a rule boundary.
const INLINE_BUDGET: u64 = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId(pub u32);

impl StateId {
    #[inline]
    fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FsmEdge {
    /// Consume one byte in `min..=max`.
    CharRange { min: u8, max: u8, target: StateId },
    Epsilon(StateId),
    /// Match a whole sub-rule, then continue at `target`.
    RuleRef { rule: RuleId, target: StateId },
}

impl FsmEdge {
    fn is_byte_edge(&self) -> bool {
        matches!(self, FsmEdge::CharRange { .. })
    }
}

/// Growable automaton used while lowering rule bodies.
#[derive(Debug, Clone, Default)]
pub struct NfaGraph {
    adjacency: Vec<Vec<FsmEdge>>,
}

impl NfaGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_state(&mut self) -> StateId {
        self.adjacency.push(Vec::new());
        StateId(self.adjacency.len() as u32 - 1)
    }

    pub fn num_states(&self) -> usize {
        self.adjacency.len()
    }

    pub fn add_edge(&mut self, from: StateId, edge: FsmEdge) {
        self.adjacency[from.index()].push(edge);
    }

    pub fn add_char_edge(&mut self, from: StateId, min: u8, max: u8, target: StateId) {
        self.add_edge(from, FsmEdge::CharRange { min, max, target });
    }

    pub fn add_epsilon(&mut self, from: StateId, target: StateId) {
        self.add_edge(from, FsmEdge::Epsilon(target));
    }

    pub fn add_rule_ref(&mut self, from: StateId, rule: RuleId, target: StateId) {
        self.add_edge(from, FsmEdge::RuleRef { rule, target });
    }

    pub fn edges(&self, state: StateId) -> &[FsmEdge] {
        &self.adjacency[state.index()]
    }

    /// States reachable from `seeds` through epsilon edges only, seeds included.
    pub fn epsilon_closure(&self, seeds: &BTreeSet<StateId>) -> BTreeSet<StateId> {
        let mut reached = seeds.clone();
        let mut stack: Vec<StateId> = seeds.iter().copied().collect();
        while let Some(state) = stack.pop() {
            let targets = self.edges(state).iter().filter_map(|edge| match edge {
                FsmEdge::Epsilon(t) => Some(*t),
                _ => None,
            });
            for t in targets {
                if reached.insert(t) {
                    stack.push(t);
                }
            }
        }
        reached
    }

    /// Freeze into a [`DfaTable`]. Byte edges are ordered by their low byte
    /// and placed ahead of rule-ref edges.
    pub fn to_compact(&self) -> DfaTable {
        let n = self.num_states();
        let mut flat: Vec<FsmEdge> = Vec::new();
        let mut offsets: Vec<u32> = Vec::with_capacity(n + 1);
        let mut byte_table = vec![NO_TRANSITION; n * 256];

        for (s, outgoing) in self.adjacency.iter().enumerate() {
            offsets.push(flat.len() as u32);
            let (mut bytes, rest): (Vec<FsmEdge>, Vec<FsmEdge>) =
                outgoing.iter().cloned().partition(FsmEdge::is_byte_edge);
            bytes.sort_by_key(|e| match e {
                FsmEdge::CharRange { min, .. } => *min,
                _ => 0,
            });
            let row = &mut byte_table[s * 256..(s + 1) * 256];
            for edge in &bytes {
                if let FsmEdge::CharRange { min, max, target } = edge {
                    row[*min as usize..=*max as usize].fill(target.0);
                }
            }
            flat.extend(bytes);
            flat.extend(rest);
        }
        offsets.push(flat.len() as u32);

        DfaTable {
            edges: flat,
            state_offsets: offsets,
            byte_table,
        }
    }
}

/// Marks a missing entry in the dense byte table.
pub const NO_TRANSITION: u32 = u32::MAX;

/// Frozen automaton: a flat edge array sliced per state, plus a dense
/// `state * 256 + byte` lookup table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DfaTable {
    edges: Vec<FsmEdge>,
    state_offsets: Vec<u32>,
    byte_table: Vec<u32>,
}

impl DfaTable {
    pub fn num_states(&self) -> usize {
        self.state_offsets.len().saturating_sub(1)
    }

    pub fn edges(&self, state: StateId) -> &[FsmEdge] {
        let i = state.index();
        let (lo, hi) = (self.state_offsets[i] as usize, self.state_offsets[i + 1] as usize);
        &self.edges[lo..hi]
    }

    #[inline(always)]
    pub fn next_state(&self, from: StateId, byte: u8) -> Option<StateId> {
        match self.byte_table[from.index() * 256 + byte as usize] {
            NO_TRANSITION => None,
            t => Some(StateId(t)),
        }
    }

    pub fn memory_size(&self) -> usize {
        use std::mem::size_of;
        self.edges.len() * size_of::<FsmEdge>() + (self.state_offsets.len() + self.byte_table.len()) * size_of::<u32>()
    }
}

/// A graph plus its start state and accepting-state flags.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Automaton<F> {
    pub fsm: F,
    pub start: StateId,
    pub ends: Vec<bool>,
    pub is_dfa: bool,
}

impl<F> Automaton<F> {
    pub fn is_end(&self, state: StateId) -> bool {
        matches!(self.ends.get(state.index()), Some(true))
    }
}

impl Automaton<NfaGraph> {
    #[cfg(test)]
    pub fn accepts(&self, input: &[u8]) -> bool {
        let mut live = self.fsm.epsilon_closure(&BTreeSet::from([self.start]));
        for &byte in input {
            let stepped: BTreeSet<StateId> = live
                .iter()
                .flat_map(|s| self.fsm.edges(*s))
                .filter_map(|edge| match edge {
                    FsmEdge::CharRange { min, max, target } if (*min..=*max).contains(&byte) => Some(*target),
                    _ => None,
                })
                .collect();
            if stepped.is_empty() {
                return false;
            }
            live = self.fsm.epsilon_closure(&stepped);
        }
        live.iter().any(|s| self.is_end(*s))
    }

    /// Subset construction. Rule-ref edges are grouped per rule so every
    /// resulting state has at most one edge per byte and per rule.
    pub fn to_dfa(&self) -> Automaton<NfaGraph> {
        let mut subsets = SubsetTable::new(self);
        let start = subsets.intern(self.fsm.epsilon_closure(&BTreeSet::from([self.start])));

        while let Some((dfa_state, nfa_states)) = subsets.pending.pop_front() {
            for (min, max, targets) in self.collect_intervals(&nfa_states) {
                let next = subsets.intern(self.fsm.epsilon_closure(&targets));
                subsets.graph.add_char_edge(dfa_state, min, max, next);
            }

            let mut by_rule: Vec<(RuleId, BTreeSet<StateId>)> = Vec::new();
            for &nfa_state in &nfa_states {
                for edge in self.fsm.edges(nfa_state) {
                    if let FsmEdge::RuleRef { rule, target } = edge {
                        match by_rule.iter_mut().find(|(r, _)| r == rule) {
                            Some((_, targets)) => {
                                targets.insert(*target);
                            }
                            None => by_rule.push((*rule, BTreeSet::from([*target]))),
                        }
                    }
                }
            }
            for (rule, targets) in by_rule {
                let next = subsets.intern(self.fsm.epsilon_closure(&targets));
                subsets.graph.add_rule_ref(dfa_state, rule, next);
            }
        }

        Automaton {
            fsm: subsets.graph,
            start,
            ends: subsets.ends,
            is_dfa: true,
        }
    }

    /// Split the byte edges leaving `nfa_states` into disjoint intervals,
    /// each labelled with every target reachable on it.
    fn collect_intervals(&self, nfa_states: &BTreeSet<StateId>) -> Vec<(u8, u8, BTreeSet<StateId>)> {
        let spans: Vec<(u16, u16, StateId)> = nfa_states
            .iter()
            .flat_map(|s| self.fsm.edges(*s))
            .filter_map(|edge| match edge {
                FsmEdge::CharRange { min, max, target } => Some((*min as u16, *max as u16, *target)),
                _ => None,
            })
            .collect();

        // Every span start and every position just past a span end opens a new piece
        let cuts: BTreeSet<u16> = spans.iter().flat_map(|&(lo, hi, _)| [lo, hi + 1]).collect();
        let cuts: Vec<u16> = cuts.into_iter().collect();

        let mut pieces: Vec<(u8, u8, BTreeSet<StateId>)> = Vec::new();
        for pair in cuts.windows(2) {
            let (lo, hi) = (pair[0], pair[1] - 1);
            let covering: BTreeSet<StateId> = spans
                .iter()
                .filter(|&&(a, b, _)| a <= lo && hi <= b)
                .map(|&(_, _, t)| t)
                .collect();
            if covering.is_empty() {
                continue;
            }
            match pieces.last_mut() {
                Some(prev) if prev.2 == covering && u16::from(prev.1) + 1 == lo => prev.1 = hi as u8,
                _ => pieces.push((lo as u8, hi as u8, covering)),
            }
        }
        pieces
    }

    pub fn to_compact(&self) -> Automaton<DfaTable> {
        Automaton {
            fsm: self.fsm.to_compact(),
            start: self.start,
            ends: self.ends.clone(),
            is_dfa: self.is_dfa,
        }
    }
}

/// Interns NFA state sets as DFA states during subset construction.
struct SubsetTable<'a> {
    nfa: &'a Automaton<NfaGraph>,
    graph: NfaGraph,
    ends: Vec<bool>,
    ids: FxHashMap<BTreeSet<StateId>, StateId>,
    pending: VecDeque<(StateId, BTreeSet<StateId>)>,
}

impl<'a> SubsetTable<'a> {
    fn new(nfa: &'a Automaton<NfaGraph>) -> Self {
        Self {
            nfa,
            graph: NfaGraph::new(),
            ends: Vec::new(),
            ids: FxHashMap::default(),
            pending: VecDeque::new(),
        }
    }

    fn intern(&mut self, set: BTreeSet<StateId>) -> StateId {
        if let Some(&id) = self.ids.get(&set) {
            return id;
        }
        let id = self.graph.add_state();
        self.ends.push(set.iter().any(|s| self.nfa.is_end(*s)));
        self.ids.insert(set.clone(), id);
        self.pending.push_back((id, set));
        id
    }
}

impl Automaton<DfaTable> {
    #[cfg(test)]
    pub fn accepts(&self, input: &[u8]) -> bool {
        debug_assert!(self.is_dfa);
        input
            .iter()
            .try_fold(self.start, |state, &b| self.fsm.next_state(state, b))
            .is_some_and(|state| self.is_end(state))
    }
}

// Character classes as UTF-8 byte paths

/// Codepoint ranges a character class actually matches, negation resolved.
fn effective_ranges(negated: bool, ranges: &[(u32, u32)]) -> Vec<(u32, u32)> {
    if negated {
        complement_codepoint_ranges(ranges)
    } else {
        ranges.to_vec()
    }
}

/// Scalar values outside `ranges`. Surrogates never appear in the result.
fn complement_codepoint_ranges(ranges: &[(u32, u32)]) -> Vec<(u32, u32)> {
    let mut covered = ranges.to_vec();
    covered.sort_unstable();

    let mut gaps = Vec::new();
    let mut next_free = 0u32;
    for (lo, hi) in covered {
        if lo > next_free {
            gaps.push((next_free, lo - 1));
        }
        next_free = next_free.max(hi.saturating_add(1));
    }
    if next_free <= 0x10FFFF {
        gaps.push((next_free, 0x10FFFF));
    }

    // Cut the surrogate block out of every gap
    gaps.into_iter()
        .flat_map(|(lo, hi)| [(lo, hi.min(0xD7FF)), (lo.max(0xE000), hi)])
        .filter(|(lo, hi)| lo <= hi)
        .collect()
}

/// Paths from `start` to `end` spelling every codepoint in `lo..=hi` as UTF-8.
fn add_codepoint_range_nfa(fsm: &mut NfaGraph, lo: u32, hi: u32, start: StateId, end: StateId) {
    // Multi-byte UTF-8 bands, split around the surrogate gap
    const UTF8_BANDS: [(u32, u32); 4] = [(0x80, 0x7FF), (0x800, 0xD7FF), (0xE000, 0xFFFF), (0x10000, 0x10FFFF)];

    if lo <= 0x7F {
        fsm.add_char_edge(start, lo as u8, hi.min(0x7F) as u8, end);
    }
    for (band_lo, band_hi) in UTF8_BANDS {
        let (l, h) = (lo.max(band_lo), hi.min(band_hi));
        if l <= h {
            add_utf8_nfa_range(fsm, l, h, start, end);
        }
    }
}

fn encode_codepoint_utf8(cp: u32) -> Vec<u8> {
    let c = char::from_u32(cp).unwrap_or(char::REPLACEMENT_CHARACTER);
    let mut buf = [0u8; 4];
    c.encode_utf8(&mut buf).as_bytes().to_vec()
}

/// `lo` and `hi` must encode to the same number of bytes.
fn add_utf8_nfa_range(fsm: &mut NfaGraph, lo: u32, hi: u32, start: StateId, end: StateId) {
    let lo_bytes = encode_codepoint_utf8(lo);
    let hi_bytes = encode_codepoint_utf8(hi);
    debug_assert_eq!(lo_bytes.len(), hi_bytes.len());
    add_utf8_byte_range(fsm, &lo_bytes, &hi_bytes, 0, start, end);
}

/// Byte sequences between `lo` and `hi` (same length), from position `at` on.
fn add_utf8_byte_range(fsm: &mut NfaGraph, lo: &[u8], hi: &[u8], at: usize, start: StateId, end: StateId) {
    let (first, last) = (lo[at], hi[at]);
    if at + 1 == lo.len() {
        fsm.add_char_edge(start, first, last, end);
        return;
    }
    if first == last {
        let mid = fsm.add_state();
        fsm.add_char_edge(start, first, first, mid);
        add_utf8_byte_range(fsm, lo, hi, at + 1, mid, end);
        return;
    }

    // Low edge: `first` then lo's tail up to all-0xBF
    let mut lo_ceiling = lo.to_vec();
    lo_ceiling[at + 1..].fill(0xBF);
    let mid = fsm.add_state();
    fsm.add_char_edge(start, first, first, mid);
    add_utf8_byte_range(fsm, lo, &lo_ceiling, at + 1, mid, end);

    // Interior lead bytes take any continuation
    if last - first > 1 {
        let mut floor = lo.to_vec();
        let mut ceiling = hi.to_vec();
        floor[at + 1..].fill(0x80);
        ceiling[at + 1..].fill(0xBF);
        let mid = fsm.add_state();
        fsm.add_char_edge(start, first + 1, last - 1, mid);
        add_utf8_byte_range(fsm, &floor, &ceiling, at + 1, mid, end);
    }

    // High edge: `last` then all-0x80 up to hi's tail
    let mut hi_floor = hi.to_vec();
    hi_floor[at + 1..].fill(0x80);
    let mid = fsm.add_state();
    fsm.add_char_edge(start, last, last, mid);
    add_utf8_byte_range(fsm, &hi_floor, hi, at + 1, mid, end);
}

// Rule inlining

/// Approximate number of NFA edges an expression expands to when every
/// referenced rule in `costs` is inlined. `None` = not inlineable.
fn inline_cost(grammar: &Grammar, expr_id: ExprId, costs: &FxHashMap<RuleId, u64>) -> Option<u64> {
    match grammar.get_expr(expr_id) {
        Expr::EmptyString => Some(1),
        Expr::ByteString(bytes) => Some(bytes.len().max(1) as u64),
        Expr::CharacterClass { ranges, .. } | Expr::CharacterClassStar { ranges, .. } => {
            Some(4 * ranges.len().max(1) as u64 + 2)
        }
        Expr::RuleRef(rid) => costs.get(rid).copied(),
        Expr::Repeat { rule, min, max } => {
            let copies = u64::from(max.unwrap_or(*min)) + 1;
            costs.get(rule).map(|c| c.saturating_mul(copies))
        }
        Expr::Sequence(es) | Expr::Choices(es) => es
            .iter()
            .try_fold(0u64, |acc, e| inline_cost(grammar, *e, costs).map(|c| acc.saturating_add(c))),
    }
}

/// Rules whose bodies get spliced into their callers' automata: bodies that
/// only reach other inlineable rules and stay under [`INLINE_BUDGET`].
/// Recursive rules never qualify; neither do rules carrying a lookahead.
fn find_inlineable_rules(grammar: &Grammar) -> FxHashSet<RuleId> {
    let mut costs: FxHashMap<RuleId, u64> = FxHashMap::default();
    loop {
        let mut changed = false;
        for (i, rule) in grammar.rules().iter().enumerate() {
            let rid = RuleId(i as u32);
            if costs.contains_key(&rid) || rule.lookahead.is_some() {
                continue;
            }
            if let Some(cost) = inline_cost(grammar, rule.body, &costs) {
                if cost <= INLINE_BUDGET {
                    costs.insert(rid, cost);
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }
    costs.into_keys().collect()
}

/// Lower `expr_id` between `start` and `end`. Siblings may share `start`,
/// so every loop hangs off a fresh state.
fn build_expr_nfa_inlining(
    grammar: &Grammar,
    fsm: &mut NfaGraph,
    expr_id: ExprId,
    start: StateId,
    end: StateId,
    inlineable: &FxHashSet<RuleId>,
) {
    match grammar.get_expr(expr_id) {
        Expr::EmptyString => fsm.add_epsilon(start, end),

        Expr::ByteString(bytes) => {
            if bytes.is_empty() {
                fsm.add_epsilon(start, end);
                return;
            }
            let mut prev = start;
            for (i, &byte) in bytes.iter().enumerate() {
                let next = if i + 1 == bytes.len() { end } else { fsm.add_state() };
                fsm.add_char_edge(prev, byte, byte, next);
                prev = next;
            }
        }

        Expr::CharacterClass { negated, ranges } => {
            for (lo, hi) in effective_ranges(*negated, ranges) {
                add_codepoint_range_nfa(fsm, lo, hi, start, end);
            }
        }

        Expr::CharacterClassStar { negated, ranges } => {
            let lp = fsm.add_state();
            fsm.add_epsilon(start, lp);
            fsm.add_epsilon(lp, end);
            for (lo, hi) in effective_ranges(*negated, ranges) {
                add_codepoint_range_nfa(fsm, lo, hi, lp, lp);
            }
        }

        Expr::RuleRef(rule_id) => {
            if inlineable.contains(rule_id) {
                let body = grammar.get_rule(*rule_id).body;
                build_expr_nfa_inlining(grammar, fsm, body, start, end, inlineable);
            } else {
                fsm.add_rule_ref(start, *rule_id, end);
            }
        }

        Expr::Sequence(exprs) => {
            if exprs.is_empty() {
                fsm.add_epsilon(start, end);
                return;
            }
            let mut prev = start;
            for (i, &eid) in exprs.iter().enumerate() {
                let next = if i + 1 == exprs.len() { end } else { fsm.add_state() };
                build_expr_nfa_inlining(grammar, fsm, eid, prev, next, inlineable);
                prev = next;
            }
        }

        Expr::Choices(exprs) => {
            for &eid in exprs {
                build_expr_nfa_inlining(grammar, fsm, eid, start, end, inlineable);
            }
        }

        Expr::Repeat { rule, min, max } => {
            build_repeat(grammar, fsm, *rule, *min, *max, start, end, inlineable);
        }
    }
}

/// Build `rule{min,max}`: the body is wired in directly when the rule is
/// inlineable, otherwise through rule-ref edges.
#[allow(clippy::too_many_arguments)]
fn build_repeat(
    grammar: &Grammar,
    fsm: &mut NfaGraph,
    rule: RuleId,
    min: u32,
    max: Option<u32>,
    start: StateId,
    end: StateId,
    inlineable: &FxHashSet<RuleId>,
) {
    let one = |fsm: &mut NfaGraph, from: StateId, to: StateId| {
        if inlineable.contains(&rule) {
            build_expr_nfa_inlining(grammar, fsm, grammar.get_rule(rule).body, from, to, inlineable);
        } else {
            fsm.add_rule_ref(from, rule, to);
        }
    };

    // Mandatory repetitions
    let mut prev = start;
    for _ in 0..min {
        let next = fsm.add_state();
        one(fsm, prev, next);
        prev = next;
    }

    match max {
        Some(max) => {
            // Optional repetitions, each one able to exit early
            fsm.add_epsilon(prev, end);
            for _ in min..max {
                let next = fsm.add_state();
                one(fsm, prev, next);
                fsm.add_epsilon(next, end);
                prev = next;
            }
        }
        None => {
            let lp = fsm.add_state();
            fsm.add_epsilon(prev, lp);
            fsm.add_epsilon(lp, end);
            let back = fsm.add_state();
            one(fsm, lp, back);
            fsm.add_epsilon(back, lp);
        }
    }
}

/// One NFA per rule, indexed by rule id.
pub fn build_rule_fsms(grammar: &Grammar) -> Vec<Automaton<NfaGraph>> {
    let inlineable = find_inlineable_rules(grammar);

    grammar
        .rules()
        .iter()
        .map(|rule| {
            let mut fsm = NfaGraph::new();
            let start = fsm.add_state();
            let end = fsm.add_state();
            build_expr_nfa_inlining(grammar, &mut fsm, rule.body, start, end, &inlineable);

            let mut ends = vec![false; fsm.num_states()];
            ends[end.0 as usize] = true;
            Automaton {
                fsm,
                start,
                ends,
                is_dfa: false,
            }
        })
        .collect()
}

pub fn build_rule_dfas(grammar: &Grammar) -> Vec<Automaton<DfaTable>> {
    build_rule_fsms(grammar)
        .iter()
        .map(|nfa| nfa.to_dfa().to_compact())
        .collect()
}

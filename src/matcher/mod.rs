//! Per-sequence decoding state.
//!
//! A [`GrammarMatcher`] feeds accepted tokens into the stack parser one byte
//! at a time and answers, before each step, which tokens may come next. It
//! keeps enough history to undo recent tokens for speculative decoding.

mod stack_parser;

use std::collections::VecDeque;
use std::sync::Arc;

use crate::bitmask::{bitmask_row_mut, clear_bit, is_bitmask_all_ones, set_bit};
use crate::compiled_grammar::CompiledGrammar;
use crate::error::{bail, Result};
use crate::tokenizer::TokenizerInfo;

use stack_parser::StackParser;

/// Longest forced string `find_jump_forward_string` will produce.
const MAX_JUMP_FORWARD_BYTES: usize = 4096;

/// Matcher construction options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatcherOptions {
    /// Stop tokens to use instead of the tokenizer's.
    pub override_stop_tokens: Option<Vec<u32>>,
    /// Terminate as soon as the grammar can end, without waiting for a stop token.
    pub terminate_without_stop_token: bool,
    /// How many tokens `rollback` can undo. `None` = unlimited.
    pub max_rollback_tokens: Option<usize>,
}

/// One accepted token (or string) in the rollback history.
#[derive(Debug, Clone, Copy)]
struct HistoryEntry {
    num_bytes: usize,
    terminated_before: bool,
}

pub struct GrammarMatcher {
    parser: StackParser,
    compiled: Arc<CompiledGrammar>,
    tokenizer_info: Arc<TokenizerInfo>,
    stop_token_ids: Vec<u32>,
    history: VecDeque<HistoryEntry>,
    /// Whether a stop token has been accepted (or the grammar ended, with
    /// `terminate_without_stop_token`).
    terminated: bool,
    terminate_without_stop_token: bool,
    max_rollback_tokens: Option<usize>,
    /// Bytes pushed onto the parser during a trie walk.
    walk_prefix: Vec<u8>,
}

impl GrammarMatcher {
    /// Create a matcher over a compiled grammar.
    pub fn new(compiled: Arc<CompiledGrammar>, options: MatcherOptions) -> Self {
        let tokenizer_info = compiled.tokenizer_info().clone();
        let stop_token_ids = options
            .override_stop_tokens
            .unwrap_or_else(|| tokenizer_info.stop_token_ids().to_vec());
        Self {
            parser: StackParser::new(compiled.clone()),
            compiled,
            tokenizer_info,
            stop_token_ids,
            history: VecDeque::new(),
            terminated: false,
            terminate_without_stop_token: options.terminate_without_stop_token,
            max_rollback_tokens: options.max_rollback_tokens,
            walk_prefix: Vec::new(),
        }
    }

    /// Feed one token. Returns false, leaving the state untouched, when the
    /// grammar cannot take it.
    pub fn accept_token(&mut self, token_id: u32) -> bool {
        if self.terminated {
            tracing::trace!(token_id, "matcher already terminated");
            return false;
        }
        let vocab_size = self.tokenizer_info.vocab_size();
        if token_id as usize >= vocab_size {
            tracing::warn!(token_id, vocab_size, "token id outside the vocabulary");
            return false;
        }

        if self.stop_token_ids.contains(&token_id) {
            if !self.parser.can_terminate() {
                return false;
            }
            self.push_token_history(0);
            self.terminated = true;
            return true;
        }

        if self.tokenizer_info.special_token_ids().binary_search(&token_id).is_ok() {
            return false;
        }

        let Some(bytes) = self.tokenizer_info.decode_token(token_id) else {
            return false;
        };
        if !self.parser.advance_bytes(bytes) {
            tracing::trace!(token_id, "token rejected by grammar");
            return false;
        }
        self.push_token_history(bytes.len());
        self.maybe_terminate();
        true
    }

    /// Accept a string. Returns true if the entire string was valid; it
    /// counts as one token for rollback.
    pub fn accept_string(&mut self, s: &str) -> bool {
        if self.terminated {
            return false;
        }
        if !self.parser.advance_bytes(s.as_bytes()) {
            return false;
        }
        self.push_token_history(s.len());
        self.maybe_terminate();
        true
    }

    fn maybe_terminate(&mut self) {
        if self.terminate_without_stop_token && self.parser.can_terminate() {
            self.terminated = true;
        }
    }

    fn push_token_history(&mut self, num_bytes: usize) {
        self.history.push_back(HistoryEntry {
            num_bytes,
            terminated_before: self.terminated,
        });
        if let Some(max) = self.max_rollback_tokens {
            let excess = self.history.len().saturating_sub(max);
            self.history.drain(..excess);
        }
    }

    /// Fill row `index` of a batch bitmask with the valid next tokens.
    ///
    /// Returns true if any token in `[0, vocab_size)` is disallowed. Out of
    /// range rows are logged and left alone.
    ///
    /// Strategy:
    /// 1. Check the compiled grammar's runtime bitmask cache.
    /// 2. OR the pre-computed accepted masks of every live (rule_id, dfa_state).
    /// 3. Batch trie walk over the union of their uncertain tokens.
    pub fn fill_next_token_bitmask(&mut self, bitmask: &mut [u32], index: usize) -> bool {
        let vocab_size = self.tokenizer_info.vocab_size();
        let row = match bitmask_row_mut(bitmask, index, vocab_size) {
            Ok(row) => row,
            Err(e) => {
                tracing::warn!(index, error = %e, "cannot fill bitmask row");
                return false;
            }
        };

        if self.terminated {
            if self.terminate_without_stop_token || self.stop_token_ids.is_empty() {
                return false;
            }
            row.fill(0);
            for &id in &self.stop_token_ids {
                if (id as usize) < vocab_size {
                    set_bit(row, id as usize);
                }
            }
            return true;
        }

        row.fill(0);
        let mut key: Vec<(u32, u32)> = self
            .parser
            .current_states()
            .iter()
            .map(|s| (s.rule_id, s.dfa_state))
            .collect();
        key.sort_unstable();
        key.dedup();

        if !self.compiled.get_cached_bitmask(&key, row) {
            let mut candidates: Vec<u32> = Vec::new();
            for &(rule_id, dfa_state) in &key {
                let mask = self.compiled.token_mask(rule_id, dfa_state);
                mask.or_accepted_into(row);
                candidates.extend_from_slice(&mask.uncertain);
            }
            if candidates.is_empty() {
                self.compiled.cache_bitmask(key, row);
            } else {
                candidates.sort_unstable();
                candidates.dedup();
                self.check_uncertain_tokens(&candidates, row);
            }
        }

        let can_terminate = self.parser.can_terminate();
        for &id in &self.stop_token_ids {
            if (id as usize) < vocab_size {
                if can_terminate {
                    set_bit(row, id as usize);
                } else {
                    clear_bit(row, id as usize);
                }
            }
        }

        !is_bitmask_all_ones(row, vocab_size)
    }

    /// Batch trie walk: check candidate tokens (positions in the sorted
    /// vocabulary, ascending) against the parser, sharing work between
    /// tokens with a common prefix. Probed levels are popped afterwards.
    fn check_uncertain_tokens(&mut self, candidates: &[u32], row: &mut [u32]) {
        let sorted = self.tokenizer_info.sorted_vocab();
        let prefix = &mut self.walk_prefix;
        prefix.clear();
        // (candidate position, length) of a byte prefix known to be rejected
        let mut dead: Option<(usize, usize)> = None;

        for &pos in candidates {
            let (token_id, ref bytes) = sorted[pos as usize];
            if let Some((dead_pos, dead_len)) = dead {
                if bytes.starts_with(&sorted[dead_pos].1[..dead_len]) {
                    continue;
                }
            }

            let common = longest_common_prefix(prefix, bytes);
            self.parser.pop_levels(prefix.len() - common);
            prefix.truncate(common);

            let mut ok = true;
            for &byte in &bytes[common..] {
                if !self.parser.advance(byte) {
                    dead = Some((pos as usize, prefix.len() + 1));
                    ok = false;
                    break;
                }
                prefix.push(byte);
            }
            if ok {
                set_bit(row, token_id as usize);
            }
        }

        self.parser.pop_levels(prefix.len());
        prefix.clear();
    }

    /// Undo the last `num_tokens` accepted tokens or strings.
    pub fn rollback(&mut self, num_tokens: usize) -> Result<()> {
        if num_tokens > self.history.len() {
            bail!(
                Runtime,
                "cannot roll back {} tokens, only {} in history",
                num_tokens,
                self.history.len()
            );
        }
        for _ in 0..num_tokens {
            if let Some(entry) = self.history.pop_back() {
                self.parser.pop_levels(entry.num_bytes);
                self.terminated = entry.terminated_before;
            }
        }
        Ok(())
    }

    /// Find the longest string every live parse must produce next.
    ///
    /// Stops where the grammar may end, and trims to whole UTF-8 characters.
    /// The matcher state is unchanged.
    pub fn find_jump_forward_string(&mut self) -> String {
        if self.terminated {
            return String::new();
        }

        let mut forced = Vec::new();
        while forced.len() < MAX_JUMP_FORWARD_BYTES && !self.parser.can_terminate() {
            let next = self.parser.next_bytes();
            let mut allowed = (0..=255u8).filter(|&b| next[b as usize]);
            let (Some(byte), None) = (allowed.next(), allowed.next()) else {
                break;
            };
            if !self.parser.advance(byte) {
                break;
            }
            forced.push(byte);
        }
        self.parser.pop_levels(forced.len());

        if let Err(e) = std::str::from_utf8(&forced) {
            forced.truncate(e.valid_up_to());
        }
        String::from_utf8(forced).unwrap_or_default()
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// The root rule could end right here.
    pub fn can_terminate(&self) -> bool {
        self.parser.can_terminate()
    }

    pub fn stop_token_ids(&self) -> &[u32] {
        &self.stop_token_ids
    }

    pub fn compiled_grammar(&self) -> &Arc<CompiledGrammar> {
        &self.compiled
    }

    /// Human-readable dump of the parser's current items.
    pub fn debug_print(&self) -> String {
        self.parser.describe()
    }

    /// Back to the state right after construction.
    pub fn reset(&mut self) {
        self.parser.reset();
        self.history.clear();
        self.terminated = false;
    }
}

fn longest_common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).position(|(x, y)| x != y).unwrap_or(a.len().min(b.len()))
}

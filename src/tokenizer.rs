//! Vocabulary view used by the compiler and matcher.
//!
//! [`TokenizerInfo`] decodes every token to the bytes it emits, classifies
//! stop and special tokens, and keeps the matchable tokens in byte order
//! together with the extent of each token's prefix subtree, so mask
//! computation can reject a whole family of tokens at once.

use std::hash::{Hash, Hasher};

use rustc_hash::{FxHashSet, FxHasher};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{bail, err, Error, Result};
use crate::grammar::serialize::{read_versioned, write_versioned};

/// How token strings map to output bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VocabType {
    /// The token text is the output.
    Raw,
    /// SentencePiece spelling: `<0x0A>` is a single byte and `\u{2581}`
    /// stands for a space.
    ByteFallback,
    /// GPT-2 style byte-to-character table.
    ByteLevel,
}

/// Well-known spellings of end-of-sequence tokens, used when the caller
/// does not say which tokens stop generation.
const STOP_TOKEN_SPELLINGS: &[&str] = &[
    "</s>",
    "<|endoftext|>",
    "<|eot_id|>",
    "<|end_of_text|>",
    "<|im_end|>",
    "<end_of_turn>",
    "<|end|>",
    "<eos>",
    "<|eos|>",
    "<|eom_id|>",
    "<｜end▁of▁sentence｜>",
    "<|return|>",
    "<|call|>",
];

/// Construction options for [`TokenizerInfo`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizerInfoOptions {
    pub vocab_type: VocabType,
    /// Total vocabulary size. Ids past the encoded vocabulary are padding
    /// and are treated as special tokens. `None` = the encoded length.
    pub vocab_size: Option<usize>,
    /// Explicit stop tokens. `None` = detect from well-known spellings.
    pub stop_token_ids: Option<Vec<u32>>,
    /// Whether the tokenizer prepends a space to the first token. Recorded
    /// as metadata; decoding is not affected.
    pub add_prefix_space: bool,
}

impl Default for TokenizerInfoOptions {
    fn default() -> Self {
        Self {
            vocab_type: VocabType::Raw,
            vocab_size: None,
            stop_token_ids: None,
            add_prefix_space: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenizerInfo {
    encoded_vocab: Vec<String>,
    /// Output bytes per token id.
    decoded_vocab: Vec<Vec<u8>>,
    /// Matchable tokens sorted by decoded bytes, ties broken by token id.
    sorted_vocab: Vec<(u32, Vec<u8>)>,
    /// Model vocabulary size; ids past `decoded_vocab` are padding.
    vocab_size: usize,
    vocab_type: VocabType,
    add_prefix_space: bool,
    stop_token_ids: Vec<u32>,
    /// Token ids that never match grammar content: empty decodings, padding
    /// ids and stop tokens.
    special_token_ids: Vec<u32>,
    /// `trie_subtree_end[i]`: first position after `i` in `sorted_vocab`
    /// whose bytes do not extend `sorted_vocab[i]`.
    trie_subtree_end: Vec<usize>,
}

/// Serializable metadata: everything except the vocabulary itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Metadata {
    vocab_type: VocabType,
    vocab_size: usize,
    add_prefix_space: bool,
    stop_token_ids: Vec<u32>,
}

#[derive(Serialize, Deserialize)]
struct TokenizerRepr {
    encoded_vocab: Vec<String>,
    #[serde(flatten)]
    metadata: Metadata,
}

impl TokenizerInfo {
    /// Create a `TokenizerInfo` with default options for the given vocab type.
    pub fn new(encoded_vocab: &[String], vocab_type: VocabType) -> Result<Self> {
        Self::with_options(
            encoded_vocab,
            TokenizerInfoOptions {
                vocab_type,
                ..Default::default()
            },
        )
    }

    /// Create a `TokenizerInfo` from an encoded vocabulary.
    ///
    /// Fails when `vocab_size` is smaller than the encoded vocabulary or a
    /// stop token id is outside the vocabulary.
    pub fn with_options(encoded_vocab: &[String], options: TokenizerInfoOptions) -> Result<Self> {
        let vocab_size = options.vocab_size.unwrap_or(encoded_vocab.len());
        if vocab_size < encoded_vocab.len() {
            bail!(
                Runtime,
                "vocab_size ({}) must be >= encoded vocabulary length ({})",
                vocab_size,
                encoded_vocab.len()
            );
        }

        let decoded_vocab: Vec<Vec<u8>> = encoded_vocab
            .iter()
            .map(|tok| decode_token(tok, options.vocab_type))
            .collect();

        let stop_token_ids = match options.stop_token_ids {
            Some(ids) => {
                if let Some(bad) = ids.iter().find(|&&id| id as usize >= vocab_size) {
                    bail!(Runtime, "stop token id {} is outside the vocabulary of size {}", bad, vocab_size);
                }
                ids
            }
            None => detect_stop_tokens(encoded_vocab),
        };
        if stop_token_ids.is_empty() {
            tracing::debug!(vocab_size, "no stop tokens detected");
        }

        let stop_set: FxHashSet<u32> = stop_token_ids.iter().copied().collect();
        let mut sorted_vocab = Vec::new();
        let mut special_token_ids = Vec::new();
        for (id, decoded) in decoded_vocab.iter().enumerate() {
            let id = id as u32;
            if decoded.is_empty() || stop_set.contains(&id) {
                special_token_ids.push(id);
            } else {
                sorted_vocab.push((id, decoded.clone()));
            }
        }
        special_token_ids.extend(encoded_vocab.len() as u32..vocab_size as u32);

        sorted_vocab.sort_by(|a, b| a.1.cmp(&b.1).then(a.0.cmp(&b.0)));
        let trie_subtree_end = build_trie_subtree_ranges(&sorted_vocab);

        Ok(Self {
            encoded_vocab: encoded_vocab.to_vec(),
            decoded_vocab,
            sorted_vocab,
            vocab_size,
            vocab_type: options.vocab_type,
            add_prefix_space: options.add_prefix_space,
            stop_token_ids,
            special_token_ids,
            trie_subtree_end,
        })
    }

    /// Rebuild a `TokenizerInfo` from a vocabulary and metadata produced by
    /// [`TokenizerInfo::dump_metadata`] or [`TokenizerInfo::detect_metadata_from_hf`].
    pub fn from_vocab_and_metadata(encoded_vocab: &[String], metadata: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(metadata).map_err(|e| Error::InvalidJson(e.to_string()))?;
        let metadata: Metadata =
            serde_json::from_value(value).map_err(|e| err!(DeserializeFormat, "invalid tokenizer metadata: {}", e))?;
        Self::with_options(encoded_vocab, metadata.into_options())
    }

    /// Inspect a HuggingFace `tokenizer.json` and produce a metadata string
    /// for [`TokenizerInfo::from_vocab_and_metadata`].
    pub fn detect_metadata_from_hf(backend_json: &str) -> Result<String> {
        let root: Value = serde_json::from_str(backend_json).map_err(|e| Error::InvalidJson(e.to_string()))?;
        let metadata = detect_hf_metadata(&root);
        tracing::debug!(
            vocab_type = ?metadata.vocab_type,
            vocab_size = metadata.vocab_size,
            add_prefix_space = metadata.add_prefix_space,
            "detected tokenizer metadata"
        );
        serde_json::to_string(&metadata).map_err(|e| err!(Runtime, "metadata serialization failed: {}", e))
    }

    /// Metadata as JSON: vocab type, vocab size, prefix-space flag, stop tokens.
    pub fn dump_metadata(&self) -> String {
        serde_json::to_string(&self.metadata()).unwrap_or_default()
    }

    /// Serialize to versioned JSON.
    pub fn serialize_json(&self) -> Result<String> {
        write_versioned(&TokenizerRepr {
            encoded_vocab: self.encoded_vocab.clone(),
            metadata: self.metadata(),
        })
    }

    /// Deserialize a tokenizer written by [`TokenizerInfo::serialize_json`].
    pub fn deserialize_json(json: &str) -> Result<Self> {
        let repr: TokenizerRepr = read_versioned(json)?;
        Self::with_options(&repr.encoded_vocab, repr.metadata.into_options())
            .map_err(|e| err!(DeserializeFormat, "{}", e))
    }

    fn metadata(&self) -> Metadata {
        Metadata {
            vocab_type: self.vocab_type,
            vocab_size: self.vocab_size,
            add_prefix_space: self.add_prefix_space,
            stop_token_ids: self.stop_token_ids.clone(),
        }
    }

    /// Identity of the decoded vocabulary, used to pair compiled grammars
    /// with the tokenizer they were compiled against.
    pub(crate) fn fingerprint(&self) -> String {
        let mut hasher = FxHasher::default();
        self.decoded_vocab.hash(&mut hasher);
        self.stop_token_ids.hash(&mut hasher);
        format!("{}:{:016x}", self.vocab_size, hasher.finish())
    }

    pub fn vocab_type(&self) -> VocabType {
        self.vocab_type
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn add_prefix_space(&self) -> bool {
        self.add_prefix_space
    }

    pub fn decoded_vocab(&self) -> &[Vec<u8>] {
        &self.decoded_vocab
    }

    pub fn sorted_vocab(&self) -> &[(u32, Vec<u8>)] {
        &self.sorted_vocab
    }

    pub fn stop_token_ids(&self) -> &[u32] {
        &self.stop_token_ids
    }

    pub fn special_token_ids(&self) -> &[u32] {
        &self.special_token_ids
    }

    pub fn trie_subtree_end(&self) -> &[usize] {
        &self.trie_subtree_end
    }

    /// Get the decoded bytes for a token ID. Padding ids decode to `None`.
    pub fn decode_token(&self, token_id: u32) -> Option<&[u8]> {
        self.decoded_vocab.get(token_id as usize).map(|s| s.as_slice())
    }
}

impl Metadata {
    fn into_options(self) -> TokenizerInfoOptions {
        TokenizerInfoOptions {
            vocab_type: self.vocab_type,
            vocab_size: Some(self.vocab_size),
            stop_token_ids: Some(self.stop_token_ids),
            add_prefix_space: self.add_prefix_space,
        }
    }
}

fn detect_stop_tokens(encoded_vocab: &[String]) -> Vec<u32> {
    encoded_vocab
        .iter()
        .enumerate()
        .filter(|(_, tok)| STOP_TOKEN_SPELLINGS.contains(&tok.as_str()))
        .map(|(id, _)| id as u32)
        .collect()
}

/// Collect the decoder steps of a HuggingFace tokenizer, flattening `Sequence`.
fn decoder_steps(decoder: &Value) -> Vec<&Value> {
    match decoder.get("type").and_then(Value::as_str) {
        Some("Sequence") => decoder
            .get("decoders")
            .and_then(Value::as_array)
            .map(|steps| steps.iter().flat_map(decoder_steps).collect())
            .unwrap_or_default(),
        Some(_) => vec![decoder],
        None => Vec::new(),
    }
}

fn detect_hf_metadata(root: &Value) -> Metadata {
    let steps = root.get("decoder").map(decoder_steps).unwrap_or_default();
    let step_type = |s: &&Value| s.get("type").and_then(Value::as_str).map(str::to_owned);
    let has_step = |name: &str| steps.iter().filter_map(step_type).any(|t| t == name);

    let vocab_type = if has_step("ByteLevel") {
        VocabType::ByteLevel
    } else if has_step("ByteFallback") || has_step("Metaspace") {
        VocabType::ByteFallback
    } else {
        VocabType::Raw
    };

    // SentencePiece-style decoders strip the space they prepended.
    let strips_leading_space = steps.iter().any(|s| {
        s.get("type").and_then(Value::as_str) == Some("Strip")
            && s.get("content").and_then(Value::as_str) == Some(" ")
            && s.get("start").and_then(Value::as_u64).unwrap_or(0) > 0
    });
    let prepend_scheme = root
        .get("pre_tokenizer")
        .and_then(|p| p.get("prepend_scheme"))
        .and_then(Value::as_str)
        .is_some_and(|s| s != "never");
    let add_prefix_space = strips_leading_space
        || prepend_scheme
        || root
            .get("pre_tokenizer")
            .and_then(|p| p.get("add_prefix_space"))
            .and_then(Value::as_bool)
            .unwrap_or(false);

    let vocab_len = root
        .get("model")
        .and_then(|m| m.get("vocab"))
        .map(|v| match v {
            Value::Object(map) => map.values().filter_map(Value::as_u64).map(|id| id as usize + 1).max().unwrap_or(0),
            Value::Array(list) => list.len(),
            _ => 0,
        })
        .unwrap_or(0);
    let added = root.get("added_tokens").and_then(Value::as_array);
    let added_len = added
        .map(|tokens| {
            tokens
                .iter()
                .filter_map(|t| t.get("id").and_then(Value::as_u64))
                .map(|id| id as usize + 1)
                .max()
                .unwrap_or(0)
        })
        .unwrap_or(0);

    let mut stop_token_ids: Vec<u32> = added
        .map(|tokens| {
            tokens
                .iter()
                .filter(|t| {
                    t.get("content")
                        .and_then(Value::as_str)
                        .is_some_and(|c| STOP_TOKEN_SPELLINGS.contains(&c))
                })
                .filter_map(|t| t.get("id").and_then(Value::as_u64))
                .map(|id| id as u32)
                .collect()
        })
        .unwrap_or_default();
    stop_token_ids.sort_unstable();
    stop_token_ids.dedup();

    Metadata {
        vocab_type,
        vocab_size: vocab_len.max(added_len),
        add_prefix_space,
        stop_token_ids,
    }
}

fn decode_token(encoded: &str, vocab_type: VocabType) -> Vec<u8> {
    match vocab_type {
        VocabType::Raw => encoded.as_bytes().to_vec(),
        VocabType::ByteFallback => decode_byte_fallback(encoded),
        VocabType::ByteLevel => decode_byte_level(encoded),
    }
}

fn decode_byte_fallback(encoded: &str) -> Vec<u8> {
    if encoded.len() == 6 && encoded.starts_with("<0x") && encoded.ends_with('>') {
        if let Ok(byte) = u8::from_str_radix(&encoded[3..5], 16) {
            return vec![byte];
        }
    }
    encoded.replace('\u{2581}', " ").into_bytes()
}

/// Characters outside the byte table pass through as UTF-8.
fn decode_byte_level(encoded: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(encoded.len());
    let mut utf8 = [0u8; 4];
    for c in encoded.chars() {
        match byte_level_char_to_byte(c as u32) {
            Some(b) => out.push(b),
            None => out.extend_from_slice(c.encode_utf8(&mut utf8).as_bytes()),
        }
    }
    out
}

/// Bytes that GPT-2's `bytes_to_unicode()` maps to themselves.
fn is_printable_byte(b: u32) -> bool {
    (0x21..=0x7E).contains(&b) || (0xA1..=0xAC).contains(&b) || (0xAE..=0xFF).contains(&b)
}

/// Reverse of the byte-level table: printable bytes stand for themselves and
/// the rest were shifted, in order, to codepoints from 256 upward.
fn byte_level_char_to_byte(cp: u32) -> Option<u8> {
    if is_printable_byte(cp) {
        return Some(cp as u8);
    }
    let offset = cp.checked_sub(0x100)?;
    (0u32..=255).filter(|&b| !is_printable_byte(b)).nth(offset as usize).map(|b| b as u8)
}

/// Subtree extents over a byte-sorted vocabulary: entries that extend
/// `sorted_vocab[i]` occupy `i + 1..ends[i]`.
fn build_trie_subtree_ranges(sorted_vocab: &[(u32, Vec<u8>)]) -> Vec<usize> {
    let mut ends = vec![sorted_vocab.len(); sorted_vocab.len()];
    let mut open: Vec<(usize, &[u8])> = Vec::new();
    for (pos, (_, bytes)) in sorted_vocab.iter().enumerate() {
        while let Some(&(ancestor, prefix)) = open.last() {
            if bytes.starts_with(prefix) {
                break;
            }
            ends[ancestor] = pos;
            open.pop();
        }
        open.push((pos, bytes));
    }
    ends
}

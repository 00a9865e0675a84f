//! Packed token bitmasks.
//!
//! A bitmask is a slice of `u32` words where bit `i % 32` of word `i / 32`
//! indicates whether token `i` is allowed (1) or rejected (0). Bits are
//! little-endian within a word. A batch of bitmasks is one contiguous buffer
//! with one row of [`bitmask_size`] words per sequence.

use crate::error::{bail, Result};

/// Words per bitmask row.
pub fn bitmask_size(vocab_size: usize) -> usize {
    vocab_size.div_ceil(32)
}

/// Shape of a batched bitmask: `(batch_size, words_per_row)`.
pub fn get_bitmask_shape(batch_size: usize, vocab_size: usize) -> (usize, usize) {
    (batch_size, bitmask_size(vocab_size))
}

/// Allocate a batched bitmask with every bit set.
pub fn allocate_token_bitmask(batch_size: usize, vocab_size: usize) -> Vec<u32> {
    vec![u32::MAX; batch_size * bitmask_size(vocab_size)]
}

/// Borrow row `index` of a batched bitmask.
pub fn bitmask_row_mut(bitmask: &mut [u32], index: usize, vocab_size: usize) -> Result<&mut [u32]> {
    let words = bitmask_size(vocab_size);
    let start = index * words;
    if start + words > bitmask.len() {
        bail!(
            Runtime,
            "bitmask row {} out of range: buffer has {} words, rows are {} words",
            index,
            bitmask.len(),
            words
        );
    }
    Ok(&mut bitmask[start..start + words])
}

/// Allow `token`.
#[inline]
pub fn set_bit(bitmask: &mut [u32], token: usize) {
    let (word, bit) = (token >> 5, token & 31);
    bitmask[word] |= 1u32 << bit;
}

/// Reject `token`.
#[inline]
pub fn clear_bit(bitmask: &mut [u32], token: usize) {
    let (word, bit) = (token >> 5, token & 31);
    bitmask[word] &= !(1u32 << bit);
}

#[inline]
pub fn get_bit(bitmask: &[u32], token: usize) -> bool {
    bitmask[token >> 5] & (1u32 << (token & 31)) != 0
}

/// Reset the bitmask to all-ones for `vocab_size` tokens. Padding bits past
/// `vocab_size` are zeroed.
pub fn reset_bitmask(bitmask: &mut [u32], vocab_size: usize) {
    let whole = (vocab_size / 32).min(bitmask.len());
    bitmask[..whole].fill(u32::MAX);
    let rest = &mut bitmask[whole..];
    let partial_bits = vocab_size % 32;
    let zero_from = if partial_bits != 0 && !rest.is_empty() {
        rest[0] = low_bits(partial_bits);
        1
    } else {
        0
    };
    rest[zero_from..].fill(0);
}

#[inline]
fn low_bits(n: usize) -> u32 {
    (1u32 << n) - 1
}

/// Reject every token.
pub fn clear_bitmask(bitmask: &mut [u32]) {
    bitmask.fill(0);
}

/// OR `src` into `dst` word by word.
#[inline]
pub fn union_into(dst: &mut [u32], src: &[u32]) {
    for (d, s) in dst.iter_mut().zip(src) {
        *d |= *s;
    }
}

/// Mask rejected tokens' logits to negative infinity. Logits beyond the
/// bitmask's coverage keep their value.
pub fn apply_token_bitmask_inplace(logits: &mut [f32], bitmask: &[u32]) {
    let covered = logits.len().min(bitmask.len() * 32);
    logits[..covered]
        .iter_mut()
        .enumerate()
        .filter(|(token, _)| !get_bit(bitmask, *token))
        .for_each(|(_, logit)| *logit = f32::NEG_INFINITY);
}

/// True when every one of the first `vocab_size` tokens is allowed.
pub fn is_bitmask_all_ones(bitmask: &[u32], vocab_size: usize) -> bool {
    let whole = vocab_size / 32;
    if !bitmask[..whole].iter().all(|&w| w == u32::MAX) {
        return false;
    }
    match vocab_size % 32 {
        0 => true,
        bits => bitmask[whole] & low_bits(bits) == low_bits(bits),
    }
}

/// Count the allowed tokens among the first `vocab_size` bits.
pub fn count_allowed(bitmask: &[u32], vocab_size: usize) -> usize {
    (0..vocab_size).filter(|&i| get_bit(bitmask, i)).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_words_per_row() {
        let sizes: Vec<usize> = [0, 1, 32, 33, 64, 65].iter().map(|&v| bitmask_size(v)).collect();
        assert_eq!(sizes, vec![0, 1, 1, 2, 2, 3]);
    }

    #[test]
    fn test_word_boundaries() {
        let mut words = [0u32; 2];
        for token in [0, 31, 32] {
            set_bit(&mut words, token);
        }
        assert_eq!(words, [0x8000_0001, 1]);
        assert!(!get_bit(&words, 1));

        clear_bit(&mut words, 0);
        assert_eq!(words, [0x8000_0000, 1]);
    }

    #[test]
    fn test_little_endian_bit_order() {
        let mut bm = vec![0u32; 1];
        set_bit(&mut bm, 3);
        assert_eq!(bm[0], 0b1000);
        assert_eq!(bm[0].to_le_bytes()[0], 0b1000);
    }

    #[test]
    fn test_reset_bitmask() {
        let mut words = vec![7u32; 3];
        reset_bitmask(&mut words, 50);
        assert_eq!(words, vec![u32::MAX, (1 << 18) - 1, 0]);
    }

    #[test]
    fn test_batch_rows() {
        let vocab_size = 40;
        let mut bm = allocate_token_bitmask(3, vocab_size);
        assert_eq!(bm.len(), 6);
        assert_eq!(get_bitmask_shape(3, vocab_size), (3, 2));

        let row = bitmask_row_mut(&mut bm, 1, vocab_size).unwrap();
        clear_bitmask(row);
        assert_eq!(&bm[0..2], &[u32::MAX, u32::MAX]);
        assert_eq!(&bm[2..4], &[0, 0]);
        assert_eq!(&bm[4..6], &[u32::MAX, u32::MAX]);

        assert!(bitmask_row_mut(&mut bm, 3, vocab_size).is_err());
    }

    #[test]
    fn test_masking_logits() {
        let mut logits = [0.5f32, 1.5, 2.5, 3.5];
        apply_token_bitmask_inplace(&mut logits, &[0b0101]);
        assert_eq!(logits, [0.5, f32::NEG_INFINITY, 2.5, f32::NEG_INFINITY]);
    }

    #[test]
    fn test_is_bitmask_all_ones_and_count() {
        let mut words = allocate_token_bitmask(1, 50);
        assert!(is_bitmask_all_ones(&words, 50));
        assert_eq!(count_allowed(&words, 50), 50);

        clear_bit(&mut words, 49);
        assert!(!is_bitmask_all_ones(&words, 50));
        assert!(is_bitmask_all_ones(&words, 49));
        assert_eq!(count_allowed(&words, 50), 49);
    }
}

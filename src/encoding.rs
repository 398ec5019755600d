//! Items, hashed items, and their algebraic form
//!
//! An [`Item`] is an opaque 128-bit value obtained by hashing an arbitrary
//! byte string; a [`HashedItem`] is an item after the OPRF. Both sides of the
//! protocol work on the *algebraized* form: the first `item_bit_count` bits
//! of the value, read most-significant-bit first, chopped into
//! `felts_per_item` chunks of `item_bit_count_per_felt` bits each.
//!
//! Labels use the same bit-chunking, extended to arbitrary length: an
//! encrypted label is split into `⌈bits / item_bit_count⌉` *parts*, each part
//! occupying the same `felts_per_item` bins as the item it belongs to. The
//! inverse direction ([`dealgebraize_label`]) reassembles the byte string so
//! the receiver can truncate and decrypt.
//!
//! Bit order is fixed once, here: bit `k` of a byte string is bit `7 - (k % 8)`
//! of byte `k / 8`. Changing this breaks every stored database.

#![allow(missing_docs)]

use serde::{Deserialize, Serialize};

use crate::params::PsiParams;
use crate::{Felt, PsiError, Result, ITEM_BYTE_COUNT};

/// Domain-separation context for hashing raw inputs into items.
const ITEM_HASH_CONTEXT: &str = "tinypsi item v1";

// ============================================================================
// Item / HashedItem
// ============================================================================

/// An opaque 128-bit item, produced by hashing an arbitrary byte string.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Item([u8; ITEM_BYTE_COUNT]);

impl Item {
    /// Hash an arbitrary byte string down to a 128-bit item.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut hasher = blake3::Hasher::new_derive_key(ITEM_HASH_CONTEXT);
        hasher.update(bytes);
        let digest = hasher.finalize();
        let mut value = [0u8; ITEM_BYTE_COUNT];
        value.copy_from_slice(&digest.as_bytes()[..ITEM_BYTE_COUNT]);
        Self(value)
    }

    /// The raw 128-bit value.
    #[inline]
    pub fn value(&self) -> &[u8; ITEM_BYTE_COUNT] {
        &self.0
    }
}

impl From<&str> for Item {
    fn from(s: &str) -> Self {
        Item::from_bytes(s.as_bytes())
    }
}

impl std::fmt::Debug for Item {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Item({})", hex::encode(self.0))
    }
}

/// An [`Item`] that has passed through the OPRF. Same width, different trust
/// domain: only hashed items ever reach the cuckoo table or a bin.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HashedItem([u8; ITEM_BYTE_COUNT]);

impl HashedItem {
    /// Wrap an exact 16-byte OPRF output.
    pub fn new(value: [u8; ITEM_BYTE_COUNT]) -> Self {
        Self(value)
    }

    /// Parse from a slice; anything but 16 bytes is an input error.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let value: [u8; ITEM_BYTE_COUNT] = bytes
            .try_into()
            .map_err(|_| PsiError::InvalidInput(format!("hashed item must be 16 bytes, got {}", bytes.len())))?;
        Ok(Self(value))
    }

    /// The raw 128-bit value.
    #[inline]
    pub fn value(&self) -> &[u8; ITEM_BYTE_COUNT] {
        &self.0
    }
}

impl std::fmt::Debug for HashedItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HashedItem({})", hex::encode(self.0))
    }
}

// ============================================================================
// Bit chunking
// ============================================================================

/// Read `len ≤ 63` bits starting at `start` from a byte string, MSB-first.
/// Bits past the end of `bytes` read as zero.
pub(crate) fn read_bits(bytes: &[u8], start: usize, len: usize) -> u64 {
    debug_assert!(len <= 63);
    let mut out = 0u64;
    for k in 0..len {
        let bit_idx = start + k;
        let byte = bytes.get(bit_idx / 8).copied().unwrap_or(0);
        let bit = (byte >> (7 - (bit_idx % 8))) & 1;
        out = (out << 1) | u64::from(bit);
    }
    out
}

/// Write the low `len` bits of `value` at bit offset `start`, MSB-first.
/// The output buffer must already be large enough.
pub(crate) fn write_bits(bytes: &mut [u8], start: usize, len: usize, value: u64) {
    debug_assert!(len <= 63);
    for k in 0..len {
        let bit = ((value >> (len - 1 - k)) & 1) as u8;
        let bit_idx = start + k;
        if bit_idx / 8 >= bytes.len() {
            debug_assert_eq!(bit, 0, "non-zero bit past end of output buffer");
            continue;
        }
        let shift = 7 - (bit_idx % 8);
        bytes[bit_idx / 8] = (bytes[bit_idx / 8] & !(1 << shift)) | (bit << shift);
    }
}

// ============================================================================
// Algebraization
// ============================================================================

/// Break a hashed item into its `felts_per_item` field elements.
pub fn algebraize_item(item: &HashedItem, params: &PsiParams) -> Vec<Felt> {
    let fpi = params.item_params().felts_per_item as usize;
    let b = params.item_bit_count_per_felt();
    (0..fpi).map(|i| read_bits(item.value(), i * b, b)).collect()
}

/// Break the raw bytes of a cuckoo-table slot into field elements. Empty
/// slots (all-zero bytes) algebraize to all-zero felts; the translation table
/// makes sure such slots never produce a reported match.
pub fn algebraize_slot(slot: &[u8; ITEM_BYTE_COUNT], params: &PsiParams) -> Vec<Felt> {
    let fpi = params.item_params().felts_per_item as usize;
    let b = params.item_bit_count_per_felt();
    (0..fpi).map(|i| read_bits(slot, i * b, b)).collect()
}

/// Reassemble a hashed item from its field elements. Bits beyond
/// `item_bit_count` come back as zero, so this is the inverse of
/// [`algebraize_item`] only up to the truncation both sides share.
pub fn dealgebraize_item(felts: &[Felt], params: &PsiParams) -> HashedItem {
    let b = params.item_bit_count_per_felt();
    let mut bytes = [0u8; ITEM_BYTE_COUNT];
    for (i, &f) in felts.iter().enumerate() {
        write_bits(&mut bytes, i * b, b, f);
    }
    HashedItem::new(bytes)
}

/// Split an encrypted label into parts of `felts_per_item` felts each.
///
/// Part `p` covers stream bits `[p·item_bit_count, (p+1)·item_bit_count)`;
/// the tail is zero-padded. The part count is
/// `⌈label.len()·8 / item_bit_count⌉`.
pub fn algebraize_label(label: &[u8], params: &PsiParams) -> Vec<Vec<Felt>> {
    let fpi = params.item_params().felts_per_item as usize;
    let b = params.item_bit_count_per_felt();
    let ibc = params.item_bit_count();
    let parts = (label.len() * 8).div_ceil(ibc);
    (0..parts)
        .map(|p| (0..fpi).map(|i| read_bits(label, p * ibc + i * b, b)).collect())
        .collect()
}

/// Inverse of [`algebraize_label`]: concatenate the parts' bits back into a
/// byte string of `⌈parts·item_bit_count / 8⌉` bytes. The caller truncates to
/// the effective label length.
pub fn dealgebraize_label(parts: &[Vec<Felt>], params: &PsiParams) -> Vec<u8> {
    let b = params.item_bit_count_per_felt();
    let ibc = params.item_bit_count();
    let total_bits = parts.len() * ibc;
    let mut out = vec![0u8; total_bits.div_ceil(8)];
    for (p, part) in parts.iter().enumerate() {
        for (i, &f) in part.iter().enumerate() {
            write_bits(&mut out, p * ibc + i * b, b, f);
        }
    }
    out
}

/// Number of label parts (interpolation polynomial sets, result ciphertexts)
/// needed for an encrypted label of `byte_count` bytes.
#[inline]
pub fn label_part_count(byte_count: usize, params: &PsiParams) -> usize {
    (byte_count * 8).div_ceil(params.item_bit_count())
}

// ============================================================================
// Tests
// ============================================================================

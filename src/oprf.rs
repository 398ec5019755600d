//! Elliptic-curve OPRF over Ristretto
//!
//! The sender holds a long-lived uniform scalar `k`. For an item `I` the PRF
//! value is `k · H(I)` where `H` is hash-to-group; 32 bytes are derived from
//! the result with a fixed KDF — the first 16 become the [`HashedItem`], the
//! next 16 the per-item [`LabelKey`].
//!
//! The receiver never shows its items: it blinds each point with a fresh
//! scalar `r`, ships `r · H(I)`, and unblinds the response with `r⁻¹`. Both
//! directions are fixed-width: one compressed point (32 bytes) per item,
//! concatenated; batch size is bounded only by message size.
//!
//! Scalar multiplication on the sender is constant-time (dalek); an invalid
//! point encoding anywhere in a request aborts the whole request with
//! [`PsiError::InvalidProtocol`].

#![allow(missing_docs)]

use curve25519_dalek::ristretto::{CompressedRistretto, RistrettoPoint};
use curve25519_dalek::scalar::Scalar;
use rand::{CryptoRng, RngCore};
use rayon::prelude::*;
use sha2::Sha512;

use crate::encoding::{HashedItem, Item};
use crate::labels::LabelKey;
use crate::{PsiError, Result, ITEM_BYTE_COUNT, LABEL_KEY_BYTE_COUNT, OPRF_QUERY_SIZE};

/// Domain-separation context for the point → (item hash, label key) KDF.
const OPRF_KDF_CONTEXT: &str = "tinypsi oprf kdf v1";

/// Byte length of a serialized OPRF key.
pub const OPRF_KEY_SIZE: usize = 32;

// ============================================================================
// Key
// ============================================================================

/// The sender's OPRF key: a uniform nonzero Ristretto scalar.
#[derive(Clone, PartialEq, Eq)]
pub struct OprfKey(Scalar);

impl OprfKey {
    /// Sample a fresh key.
    pub fn random<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        loop {
            let s = Scalar::random(rng);
            if s != Scalar::ZERO {
                return Self(s);
            }
        }
    }

    /// Canonical 32-byte encoding.
    pub fn to_bytes(&self) -> [u8; OPRF_KEY_SIZE] {
        self.0.to_bytes()
    }

    /// Parse a canonical encoding; rejects non-canonical or zero scalars.
    pub fn from_bytes(bytes: &[u8; OPRF_KEY_SIZE]) -> Result<Self> {
        let s: Option<Scalar> = Scalar::from_canonical_bytes(*bytes).into();
        match s {
            Some(s) if s != Scalar::ZERO => Ok(Self(s)),
            _ => Err(PsiError::InvalidInput("not a canonical nonzero OPRF key".into())),
        }
    }

    #[inline]
    fn scalar(&self) -> &Scalar {
        &self.0
    }
}

impl std::fmt::Debug for OprfKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.write_str("OprfKey(..)")
    }
}

// ============================================================================
// Shared helpers
// ============================================================================

/// Hash an item onto the group.
fn hash_to_point(item: &Item) -> RistrettoPoint {
    RistrettoPoint::hash_from_bytes::<Sha512>(item.value())
}

/// Derive the hashed item and label key from a PRF output point.
fn kdf(point: &RistrettoPoint) -> (HashedItem, LabelKey) {
    let mut hasher = blake3::Hasher::new_derive_key(OPRF_KDF_CONTEXT);
    hasher.update(point.compress().as_bytes());
    let digest = hasher.finalize();
    let bytes = digest.as_bytes();

    let mut item = [0u8; ITEM_BYTE_COUNT];
    item.copy_from_slice(&bytes[..ITEM_BYTE_COUNT]);
    let mut key = [0u8; LABEL_KEY_BYTE_COUNT];
    key.copy_from_slice(&bytes[ITEM_BYTE_COUNT..ITEM_BYTE_COUNT + LABEL_KEY_BYTE_COUNT]);
    (HashedItem::new(item), LabelKey::new(key))
}

fn decode_point(bytes: &[u8]) -> Result<RistrettoPoint> {
    let compressed: [u8; 32] = bytes
        .try_into()
        .map_err(|_| PsiError::InvalidProtocol("truncated OPRF point".into()))?;
    CompressedRistretto(compressed)
        .decompress()
        .ok_or_else(|| PsiError::InvalidProtocol("invalid OPRF point encoding".into()))
}

// ============================================================================
// Sender side
// ============================================================================

/// Evaluate the PRF directly on an item (sender side, for database builds).
pub fn hash_item(item: &Item, key: &OprfKey) -> (HashedItem, LabelKey) {
    kdf(&(hash_to_point(item) * key.scalar()))
}

/// Answer a blinded OPRF request: multiply every query point by the key.
///
/// The request must be a concatenation of compressed points; the response has
/// the same shape and length. Any undecodable point aborts the request.
pub fn process_queries(queries: &[u8], key: &OprfKey) -> Result<Vec<u8>> {
    if queries.len() % OPRF_QUERY_SIZE != 0 {
        return Err(PsiError::InvalidProtocol(format!(
            "OPRF request length {} is not a multiple of {OPRF_QUERY_SIZE}",
            queries.len()
        )));
    }

    let responses: Result<Vec<[u8; 32]>> = queries
        .par_chunks_exact(OPRF_QUERY_SIZE)
        .map(|chunk| {
            let point = decode_point(chunk)?;
            Ok((point * key.scalar()).compress().to_bytes())
        })
        .collect();

    Ok(responses?.concat())
}

// ============================================================================
// Receiver side
// ============================================================================

/// Per-query blinding state: the inverted blinds needed to unblind the
/// sender's response, plus the serialized query itself.
pub struct OprfReceiver {
    inv_blinds: Vec<Scalar>,
    queries: Vec<u8>,
}

impl OprfReceiver {
    /// Blind every item with a fresh scalar.
    pub fn new<R: RngCore + CryptoRng>(items: &[Item], rng: &mut R) -> Self {
        let mut inv_blinds = Vec::with_capacity(items.len());
        let mut queries = Vec::with_capacity(items.len() * OPRF_QUERY_SIZE);
        for item in items {
            let r = loop {
                let r = Scalar::random(rng);
                if r != Scalar::ZERO {
                    break r;
                }
            };
            inv_blinds.push(r.invert());
            queries.extend_from_slice((hash_to_point(item) * r).compress().as_bytes());
        }
        Self { inv_blinds, queries }
    }

    /// Number of blinded items.
    #[inline]
    pub fn item_count(&self) -> usize {
        self.inv_blinds.len()
    }

    /// The serialized request body.
    #[inline]
    pub fn query_data(&self) -> &[u8] {
        &self.queries
    }

    /// Unblind the sender's response and derive the per-item outputs.
    pub fn process_responses(&self, responses: &[u8]) -> Result<(Vec<HashedItem>, Vec<LabelKey>)> {
        if responses.len() != self.item_count() * OPRF_QUERY_SIZE {
            return Err(PsiError::InvalidProtocol(format!(
                "OPRF response length {} does not match {} blinded items",
                responses.len(),
                self.item_count()
            )));
        }

        let mut items = Vec::with_capacity(self.item_count());
        let mut keys = Vec::with_capacity(self.item_count());
        for (chunk, inv) in responses.chunks_exact(OPRF_QUERY_SIZE).zip(&self.inv_blinds) {
            let point = decode_point(chunk)?;
            let (item, key) = kdf(&(point * inv));
            items.push(item);
            keys.push(key);
        }
        Ok((items, keys))
    }
}

// ============================================================================
// Tests
// ============================================================================

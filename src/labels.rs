//! Label encryption
//!
//! Labels are encrypted under the per-item [`LabelKey`] the OPRF hands out,
//! so a receiver can only read the label of an item it actually holds. The
//! scheme is a one-time pad derived from a keyed XOF: pad/truncate the label
//! to `label_byte_count`, sample a fresh nonce, XOR with
//! `XOF(key, nonce)`, and ship `nonce ‖ ciphertext`. A label equal to all
//! zeros is as safe as any other, since the pad depends only on per-item key
//! material.
//!
//! Decryption is deterministic from the nonce and key; the nonce is capped at
//! [`MAX_NONCE_BYTE_COUNT`] bytes. With few label rewrites per item a short
//! random nonce is enough.

use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

use crate::{PsiError, Result, LABEL_KEY_BYTE_COUNT, MAX_NONCE_BYTE_COUNT};

/// Domain-separation context for the label pad XOF.
const LABEL_PAD_CONTEXT: &str = "tinypsi label pad v1";

/// A 128-bit symmetric key bound to one hashed item.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelKey([u8; LABEL_KEY_BYTE_COUNT]);

impl LabelKey {
    /// Wrap raw key bytes (normally produced by the OPRF KDF).
    pub fn new(bytes: [u8; LABEL_KEY_BYTE_COUNT]) -> Self {
        Self(bytes)
    }

    /// The raw key bytes.
    #[inline]
    pub fn value(&self) -> &[u8; LABEL_KEY_BYTE_COUNT] {
        &self.0
    }
}

impl std::fmt::Debug for LabelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.write_str("LabelKey(..)")
    }
}

/// Derive `len` pad bytes from the key and a fixed-width nonce block.
fn pad_bytes(key: &LabelKey, nonce: &[u8], len: usize) -> Vec<u8> {
    let mut block = [0u8; MAX_NONCE_BYTE_COUNT];
    block[..nonce.len()].copy_from_slice(nonce);

    let mut hasher = blake3::Hasher::new_derive_key(LABEL_PAD_CONTEXT);
    hasher.update(key.value());
    hasher.update(&block);
    let mut pad = vec![0u8; len];
    hasher.finalize_xof().fill(&mut pad);
    pad
}

/// Encrypt a label: `nonce ‖ (label XOR pad)`.
///
/// The label is padded with zeros (or truncated) to `label_byte_count`
/// before encryption, so ciphertexts for one database are all the same size.
pub fn encrypt_label<R: RngCore + CryptoRng>(
    label: &[u8],
    key: &LabelKey,
    label_byte_count: usize,
    nonce_byte_count: usize,
    rng: &mut R,
) -> Result<Vec<u8>> {
    if nonce_byte_count > MAX_NONCE_BYTE_COUNT {
        return Err(PsiError::InvalidInput(format!(
            "nonce can be at most {MAX_NONCE_BYTE_COUNT} bytes, got {nonce_byte_count}"
        )));
    }

    let mut nonce = vec![0u8; nonce_byte_count];
    rng.fill_bytes(&mut nonce);

    let mut padded = label.to_vec();
    padded.resize(label_byte_count, 0);

    let pad = pad_bytes(key, &nonce, label_byte_count);
    for (b, p) in padded.iter_mut().zip(&pad) {
        *b ^= p;
    }

    let mut out = nonce;
    out.extend_from_slice(&padded);
    Ok(out)
}

/// Invert [`encrypt_label`]; returns the padded `label_byte_count`-byte label.
pub fn decrypt_label(
    encrypted: &[u8],
    key: &LabelKey,
    nonce_byte_count: usize,
) -> Result<Vec<u8>> {
    if nonce_byte_count > MAX_NONCE_BYTE_COUNT {
        return Err(PsiError::InvalidInput(format!(
            "nonce can be at most {MAX_NONCE_BYTE_COUNT} bytes, got {nonce_byte_count}"
        )));
    }
    if encrypted.len() < nonce_byte_count {
        return Err(PsiError::InvalidInput(
            "encrypted label shorter than its nonce".into(),
        ));
    }

    let (nonce, body) = encrypted.split_at(nonce_byte_count);
    let pad = pad_bytes(key, nonce, body.len());
    Ok(body.iter().zip(&pad).map(|(b, p)| b ^ p).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn key(tag: u8) -> LabelKey {
        LabelKey::new([tag; LABEL_KEY_BYTE_COUNT])
    }

    #[test]
    fn roundtrip_with_padding_and_truncation() {
        let mut rng = StdRng::seed_from_u64(1);
        let k = key(3);

        // Short label is zero-padded to the database width.
        let enc = encrypt_label(b"abc", &k, 8, 4, &mut rng).unwrap();
        assert_eq!(enc.len(), 12);
        assert_eq!(decrypt_label(&enc, &k, 4).unwrap(), b"abc\0\0\0\0\0");

        // Long label is truncated.
        let enc = encrypt_label(b"0123456789", &k, 4, 4, &mut rng).unwrap();
        assert_eq!(decrypt_label(&enc, &k, 4).unwrap(), b"0123");
    }

    #[test]
    fn zero_label_is_not_the_zero_ciphertext() {
        let mut rng = StdRng::seed_from_u64(2);
        let enc = encrypt_label(&[0u8; 6], &key(5), 6, 4, &mut rng).unwrap();
        assert!(enc[4..].iter().any(|&b| b != 0));
    }

    #[test]
    fn wrong_key_garbles() {
        let mut rng = StdRng::seed_from_u64(3);
        let enc = encrypt_label(b"secret", &key(1), 6, 4, &mut rng).unwrap();
        assert_ne!(decrypt_label(&enc, &key(2), 4).unwrap(), b"secret");
    }

    #[test]
    fn nonce_limit_is_enforced() {
        let mut rng = StdRng::seed_from_u64(4);
        assert!(encrypt_label(b"x", &key(1), 4, 17, &mut rng).is_err());
        assert!(decrypt_label(&[0u8; 20], &key(1), 17).is_err());
    }

    #[test]
    fn nonce_free_decryption_is_deterministic() {
        let mut rng = StdRng::seed_from_u64(5);
        let enc = encrypt_label(b"fixed", &key(9), 5, 4, &mut rng).unwrap();
        let once = decrypt_label(&enc, &key(9), 4).unwrap();
        let twice = decrypt_label(&enc, &key(9), 4).unwrap();
        assert_eq!(once, twice);
    }
}

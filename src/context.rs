//! CryptoContext: the crate's single gateway to the FHE backend
//!
//! A [`CryptoContext`] carries the shared BFV parameter handle plus the
//! optional key material of its owner: the receiver holds a secret key and
//! the matching relinearization key; the sender holds only the
//! relinearization key extracted from a query. Cloning is cheap (everything
//! is behind `Arc`) and a context is read-safe across threads after
//! construction.
//!
//! All backend calls funnel through here so the rest of the crate speaks in
//! protocol terms (encode, encrypt, multiply-and-relinearize, switch down,
//! compress) rather than in backend types.

#![allow(missing_docs)]

use std::sync::Arc;

use fhe::bfv::{
    BfvParameters, BfvParametersBuilder, Ciphertext, Encoding, Plaintext, RelinearizationKey,
    SecretKey,
};
use fhe_traits::{
    DeserializeParametrized, FheDecoder, FheDecrypter, FheEncoder, FheEncrypter,
    Serialize as FheSerialize,
};
use rand::{CryptoRng, RngCore};

use crate::params::PsiParams;
use crate::{Felt, PsiError, Result};

/// Bridges a `rand` 0.8 `RngCore + CryptoRng` into the `rand_core` 0.9 traits
/// required by the `fhe` backend, without pulling a second RNG stack through
/// the rest of the crate.
struct RngAdapter<'a, R: ?Sized>(&'a mut R);

impl<'a, R: RngCore + ?Sized> rand_core::RngCore for RngAdapter<'a, R> {
    #[inline]
    fn next_u32(&mut self) -> u32 {
        self.0.next_u32()
    }

    #[inline]
    fn next_u64(&mut self) -> u64 {
        self.0.next_u64()
    }

    #[inline]
    fn fill_bytes(&mut self, dst: &mut [u8]) {
        self.0.fill_bytes(dst)
    }
}

impl<'a, R: RngCore + CryptoRng + ?Sized> rand_core::CryptoRng for RngAdapter<'a, R> {}

/// Shared BFV handles; see the module docs for the ownership story.
#[derive(Clone)]
pub struct CryptoContext {
    params: Arc<BfvParameters>,
    plain_modulus: Felt,
    secret_key: Option<Arc<SecretKey>>,
    relin_key: Option<Arc<RelinearizationKey>>,
}

impl CryptoContext {
    /// Build the BFV context for a validated parameter set. No keys yet.
    pub fn new(psi_params: &PsiParams) -> Result<Self> {
        let enc = psi_params.enc_params();
        let params = BfvParametersBuilder::new()
            .set_degree(enc.poly_modulus_degree as usize)
            .set_plaintext_modulus(enc.plain_modulus)
            .set_moduli_sizes(&enc.coeff_modulus_bits)
            .build_arc()?;
        Ok(Self {
            params,
            plain_modulus: enc.plain_modulus,
            secret_key: None,
            relin_key: None,
        })
    }

    #[inline]
    pub fn bfv_params(&self) -> &Arc<BfvParameters> {
        &self.params
    }

    /// The plaintext modulus `t`.
    #[inline]
    pub fn plain_modulus(&self) -> Felt {
        self.plain_modulus
    }

    /// Index of the last (smallest) ciphertext level.
    #[inline]
    pub fn last_level(&self) -> usize {
        self.params.moduli().len() - 1
    }

    // ------------------------------ Key setup ------------------------------

    /// Create a fresh secret key and matching relinearization key (receiver).
    pub fn generate_keys<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> Result<()> {
        let sk = SecretKey::random(&self.params, &mut RngAdapter(rng));
        let rk = RelinearizationKey::new(&sk, &mut RngAdapter(rng))?;
        self.secret_key = Some(Arc::new(sk));
        self.relin_key = Some(Arc::new(rk));
        Ok(())
    }

    /// Whether decryption is available.
    #[inline]
    pub fn can_decrypt(&self) -> bool {
        self.secret_key.is_some()
    }

    /// Serialized relinearization key, if any.
    pub fn relin_key_bytes(&self) -> Option<Vec<u8>> {
        self.relin_key.as_ref().map(|rk| rk.to_bytes())
    }

    /// Install a relinearization key received over the wire (sender).
    pub fn set_relin_key_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        let rk = RelinearizationKey::from_bytes(bytes, &self.params)
            .map_err(|e| PsiError::InvalidCiphertext(format!("relin keys: {e}")))?;
        self.relin_key = Some(Arc::new(rk));
        Ok(())
    }

    // --------------------------- Encode / decode ---------------------------

    /// SIMD-encode a full slot vector at the top level.
    pub fn encode_simd(&self, values: &[Felt]) -> Result<Plaintext> {
        Ok(Plaintext::try_encode(values, Encoding::simd(), &self.params)?)
    }

    /// Decode a decrypted plaintext at the given level.
    pub fn decode_simd(&self, pt: &Plaintext, level: usize) -> Result<Vec<Felt>> {
        Ok(Vec::<u64>::try_decode(pt, Encoding::simd_at_level(level))?)
    }

    // -------------------------- Encrypt / decrypt --------------------------

    /// Symmetric encryption under the receiver's secret key.
    pub fn encrypt_symmetric<R: RngCore + CryptoRng>(
        &self,
        pt: &Plaintext,
        rng: &mut R,
    ) -> Result<Ciphertext> {
        let sk = self
            .secret_key
            .as_ref()
            .ok_or_else(|| PsiError::StateViolation("no secret key in this context".into()))?;
        Ok(sk.try_encrypt(pt, &mut RngAdapter(rng))?)
    }

    pub fn decrypt(&self, ct: &Ciphertext) -> Result<Plaintext> {
        let sk = self
            .secret_key
            .as_ref()
            .ok_or_else(|| PsiError::StateViolation("no secret key in this context".into()))?;
        Ok(sk.try_decrypt(ct)?)
    }

    // ------------------------- Homomorphic helpers -------------------------

    /// Ciphertext–plaintext product.
    pub fn mul_plain(&self, ct: &Ciphertext, pt: &Plaintext) -> Ciphertext {
        ct * pt
    }

    /// Ciphertext–plaintext sum (the constant-coefficient path of polynomial
    /// evaluation).
    pub fn add_plain(&self, ct: &Ciphertext, pt: &Plaintext) -> Ciphertext {
        ct + pt
    }

    /// Ciphertext–ciphertext product followed by relinearization.
    pub fn mul_relin(&self, a: &Ciphertext, b: &Ciphertext) -> Result<Ciphertext> {
        let rk = self
            .relin_key
            .as_ref()
            .ok_or_else(|| PsiError::StateViolation("no relinearization key".into()))?;
        let mut prod = a * b;
        rk.relinearizes(&mut prod)?;
        Ok(prod)
    }

    /// Switch a finished result down to the last level to shrink it.
    pub fn mod_switch_to_last(&self, ct: &mut Ciphertext) -> Result<()> {
        if self.params.moduli().len() > 1 {
            ct.switch_to_level(ct.max_switchable_level())?;
        }
        Ok(())
    }

    // ----------------------------- Wire formats ----------------------------

    pub fn serialize_ct(&self, ct: &Ciphertext) -> Vec<u8> {
        ct.to_bytes()
    }

    pub fn deserialize_ct(&self, bytes: &[u8]) -> Result<Ciphertext> {
        Ciphertext::from_bytes(bytes, &self.params)
            .map_err(|e| PsiError::InvalidCiphertext(format!("ciphertext: {e}")))
    }
}

impl std::fmt::Debug for CryptoContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoContext")
            .field("degree", &self.params.degree())
            .field("plain_modulus", &self.plain_modulus)
            .field("has_secret_key", &self.secret_key.is_some())
            .field("has_relin_key", &self.relin_key.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::testing::tiny;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let params = tiny();
        let mut ctx = CryptoContext::new(&params).unwrap();
        let mut rng = StdRng::seed_from_u64(11);
        ctx.generate_keys(&mut rng).unwrap();

        let n = params.bins_per_bundle();
        let values: Vec<u64> = (0..n as u64).map(|i| i % params.enc_params().plain_modulus).collect();
        let pt = ctx.encode_simd(&values).unwrap();
        let mut ct = ctx.encrypt_symmetric(&pt, &mut rng).unwrap();
        ctx.mod_switch_to_last(&mut ct).unwrap();

        let decoded = ctx.decode_simd(&ctx.decrypt(&ct).unwrap(), ctx.last_level()).unwrap();
        assert_eq!(decoded, values);
    }

    #[test]
    fn plain_product_and_sum_track_the_field() {
        let params = tiny();
        let t = params.enc_params().plain_modulus;
        let mut ctx = CryptoContext::new(&params).unwrap();
        let mut rng = StdRng::seed_from_u64(12);
        ctx.generate_keys(&mut rng).unwrap();

        let n = params.bins_per_bundle();
        let xs: Vec<u64> = (0..n as u64).map(|i| (i * 7 + 3) % t).collect();
        let ys: Vec<u64> = (0..n as u64).map(|i| (i * 31 + 11) % t).collect();
        let zs: Vec<u64> = (0..n as u64).map(|i| (i * 5 + 1) % t).collect();

        let ct = ctx.encrypt_symmetric(&ctx.encode_simd(&xs).unwrap(), &mut rng).unwrap();
        let prod = ctx.mul_plain(&ct, &ctx.encode_simd(&ys).unwrap());
        let mut sum = ctx.add_plain(&prod, &ctx.encode_simd(&zs).unwrap());
        ctx.mod_switch_to_last(&mut sum).unwrap();

        let got = ctx.decode_simd(&ctx.decrypt(&sum).unwrap(), ctx.last_level()).unwrap();
        let want: Vec<u64> = (0..n)
            .map(|i| (crate::algebra::mul_mod(xs[i], ys[i], t) + zs[i]) % t)
            .collect();
        assert_eq!(got, want);
    }

    #[test]
    fn ciphertext_product_relinearizes() {
        let params = tiny();
        let t = params.enc_params().plain_modulus;
        let mut ctx = CryptoContext::new(&params).unwrap();
        let mut rng = StdRng::seed_from_u64(13);
        ctx.generate_keys(&mut rng).unwrap();

        let n = params.bins_per_bundle();
        let xs: Vec<u64> = (0..n as u64).map(|i| (i + 2) % t).collect();
        let ct = ctx.encrypt_symmetric(&ctx.encode_simd(&xs).unwrap(), &mut rng).unwrap();

        let mut sq = ctx.mul_relin(&ct, &ct).unwrap();
        ctx.mod_switch_to_last(&mut sq).unwrap();
        let got = ctx.decode_simd(&ctx.decrypt(&sq).unwrap(), ctx.last_level()).unwrap();
        let want: Vec<u64> = xs.iter().map(|&x| crate::algebra::mul_mod(x, x, t)).collect();
        assert_eq!(got, want);
    }

    #[test]
    fn relin_key_roundtrips_over_bytes() {
        let params = tiny();
        let mut receiver_ctx = CryptoContext::new(&params).unwrap();
        let mut rng = StdRng::seed_from_u64(14);
        receiver_ctx.generate_keys(&mut rng).unwrap();

        let mut sender_ctx = CryptoContext::new(&params).unwrap();
        sender_ctx
            .set_relin_key_bytes(&receiver_ctx.relin_key_bytes().unwrap())
            .unwrap();
        assert!(!sender_ctx.can_decrypt());

        // Garbage is rejected.
        assert!(sender_ctx.set_relin_key_bytes(&[1, 2, 3]).is_err());
    }
}

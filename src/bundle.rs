//! BinBundle: one row of the sender's algebraic database
//!
//! A bundle owns `bins_per_bundle` bins (one per SIMD slot). Each bin maps a
//! felt — one chunk of a hashed item — to that entry's *label row*: the felts
//! of the encrypted label that live in this bin, one per label part. An
//! unlabeled database stores empty rows.
//!
//! The bundle caches two things per bin, regenerated lazily after mutation:
//!
//! - the **matching polynomial** `∏ (x − k)` over the bin's keys, zero
//!   exactly on stored items;
//! - one **interpolation polynomial** per label part, passing through
//!   `(key, label felt)` for every entry (labeled databases only).
//!
//! The cache's usable form is the [`BatchedPlaintextPolyn`]: for each degree
//! `d`, one SIMD plaintext packing the degree-`d` coefficient of every bin's
//! polynomial into that bin's slot. Evaluating against a query then costs one
//! ciphertext–plaintext product per degree, with the constant coefficient
//! added at the end — or, with Paterson–Stockmeyer, one
//! ciphertext–ciphertext product per "giant step" block.

#![allow(missing_docs)]

use std::collections::BTreeMap;

use fhe::bfv::{Ciphertext, Plaintext};
use serde::{Deserialize, Serialize};

use crate::algebra::{newton_interpolate, polyn_with_roots, FeltPolyn};
use crate::context::CryptoContext;
use crate::{Felt, PsiError, Result};

/// One bin entry handed to the multi-operations: the item's felt for this bin
/// plus the label row stored alongside it (empty when unlabeled).
pub type BinEntry = (Felt, Vec<Felt>);

/// All ciphertext powers for one bundle index; index = power, `None` where
/// the DAG does not produce that power.
pub type CiphertextPowers = Vec<Option<Ciphertext>>;

// ============================================================================
// Batched plaintext polynomial
// ============================================================================

/// Per-degree SIMD plaintexts of a whole bundle's polynomials.
///
/// Always carries at least two entries (degrees 0 and 1, zero-padded if
/// necessary) so every evaluation has a ciphertext term to anchor on.
pub struct BatchedPlaintextPolyn {
    coeffs: Vec<Plaintext>,
}

impl BatchedPlaintextPolyn {
    /// Batch one polynomial per bin into per-degree plaintexts.
    pub fn new(polyns: &[FeltPolyn], ctx: &CryptoContext) -> Result<Self> {
        let max_len = polyns.iter().map(Vec::len).max().unwrap_or(0).max(2);
        let mut coeffs = Vec::with_capacity(max_len);
        for deg in 0..max_len {
            let slots: Vec<Felt> =
                polyns.iter().map(|p| p.get(deg).copied().unwrap_or(0)).collect();
            coeffs.push(ctx.encode_simd(&slots)?);
        }
        Ok(Self { coeffs })
    }

    /// Number of stored coefficient plaintexts (degree + 1, after padding).
    #[inline]
    pub fn len(&self) -> usize {
        self.coeffs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.coeffs.is_empty()
    }

    fn power<'a>(powers: &'a [Option<Ciphertext>], d: usize) -> Result<&'a Ciphertext> {
        powers.get(d).and_then(Option::as_ref).ok_or_else(|| {
            PsiError::InvalidInput(format!("ciphertext power {d} is not available"))
        })
    }

    fn accumulate(acc: &mut Option<Ciphertext>, term: Ciphertext) {
        *acc = Some(match acc.take() {
            None => term,
            Some(a) => &a + &term,
        });
    }

    /// Straight evaluation: `Σ_{d≥1} powers[d]·P_d + P_0`, switched down to
    /// the last level.
    pub fn eval(&self, powers: &[Option<Ciphertext>], ctx: &CryptoContext) -> Result<Ciphertext> {
        let mut acc: Option<Ciphertext> = None;
        for (d, pt) in self.coeffs.iter().enumerate().skip(1) {
            Self::accumulate(&mut acc, ctx.mul_plain(Self::power(powers, d)?, pt));
        }
        let acc = acc.expect("batched polynomial always has a degree-1 term");

        let mut result = ctx.add_plain(&acc, &self.coeffs[0]);
        ctx.mod_switch_to_last(&mut result)?;
        Ok(result)
    }

    /// Paterson–Stockmeyer evaluation with low-degree bound `ps_low_degree`.
    ///
    /// Splits the polynomial into blocks of `ps_low_degree + 1` coefficients:
    /// `f(x) = Σ_i x^{(l+1)·i} · f_i(x)` with `deg f_i ≤ l`. Inner
    /// polynomials cost only plaintext products against the low powers; each
    /// nonzero block beyond the first costs a single ciphertext product with
    /// the matching giant-step power. Must be driven by the same
    /// `ps_low_degree` the receiver's parameter set prescribes.
    pub fn eval_patstock(
        &self,
        powers: &[Option<Ciphertext>],
        ps_low_degree: usize,
        ctx: &CryptoContext,
    ) -> Result<Ciphertext> {
        debug_assert!(ps_low_degree > 0);
        let degree = self.coeffs.len() - 1;
        let high = ps_low_degree + 1;
        let high_blocks = degree / high;

        let mut acc: Option<Ciphertext> = None;

        // Blocks i = 1..: inner polynomial combined with the giant step
        // x^{i·(l+1)}.
        for i in 1..=high_blocks {
            let base = i * high;
            let jmax = ps_low_degree.min(degree - base);

            let mut inner: Option<Ciphertext> = None;
            for j in 1..=jmax {
                Self::accumulate(
                    &mut inner,
                    ctx.mul_plain(Self::power(powers, j)?, &self.coeffs[base + j]),
                );
            }

            let giant = Self::power(powers, base)?;
            let term = match inner {
                Some(inner) => {
                    let inner = ctx.add_plain(&inner, &self.coeffs[base]);
                    ctx.mul_relin(giant, &inner)?
                }
                // The block is a bare constant: multiply it straight into the
                // giant-step power, no ciphertext product needed.
                None => ctx.mul_plain(giant, &self.coeffs[base]),
            };
            Self::accumulate(&mut acc, term);
        }

        // Block 0 evaluates directly against the low powers.
        for j in 1..=ps_low_degree.min(degree) {
            Self::accumulate(&mut acc, ctx.mul_plain(Self::power(powers, j)?, &self.coeffs[j]));
        }
        let acc = acc.expect("batched polynomial always has a degree-1 term");

        let mut result = ctx.add_plain(&acc, &self.coeffs[0]);
        ctx.mod_switch_to_last(&mut result)?;
        Ok(result)
    }
}

// ============================================================================
// BinBundle
// ============================================================================

/// Cached polynomial forms of a bundle; valid only while the bundle is
/// unmodified (see [`BinBundle::regen_cache`]).
#[derive(Default)]
pub struct BinBundleCache {
    /// Per-bin matching polynomials.
    pub matching_polyns: Vec<FeltPolyn>,
    /// Per-part, per-bin interpolation polynomials (labeled only).
    pub interp_polyns: Vec<Vec<FeltPolyn>>,
    /// Batched form of `matching_polyns`.
    pub batched_matching: Option<BatchedPlaintextPolyn>,
    /// Batched form of each part of `interp_polyns`.
    pub batched_interp: Vec<BatchedPlaintextPolyn>,
}

/// Serialized form of a bundle: entries only, sorted by bin and key. Caches
/// are regenerated on load.
#[derive(Serialize, Deserialize)]
pub struct SavedBinBundle {
    /// `(bin index, key, label row)` triples for every entry.
    pub entries: Vec<(u32, Felt, Vec<Felt>)>,
    /// Whether the cache was valid at save time.
    pub cache_valid: bool,
}

/// One row of the sender's database. See the module docs.
pub struct BinBundle {
    bins: Vec<BTreeMap<Felt, Vec<Felt>>>,
    label_size: usize,
    max_bin_size: usize,
    cache: BinBundleCache,
    cache_valid: bool,
    ctx: CryptoContext,
}

impl BinBundle {
    /// An empty bundle of `bins_per_bundle` bins.
    pub fn new(
        ctx: CryptoContext,
        bins_per_bundle: usize,
        label_size: usize,
        max_bin_size: usize,
    ) -> Self {
        Self {
            bins: vec![BTreeMap::new(); bins_per_bundle],
            label_size,
            max_bin_size,
            cache: BinBundleCache::default(),
            cache_valid: false,
            ctx,
        }
    }

    /// Number of label parts carried per entry (0 = unlabeled).
    #[inline]
    pub fn label_size(&self) -> usize {
        self.label_size
    }

    #[inline]
    fn range_ok(&self, len: usize, start_bin_idx: usize) -> bool {
        start_bin_idx < self.bins.len() && len <= self.bins.len() - start_bin_idx
    }

    /// Attempt to place `entries[i]` into `bins[start_bin_idx + i]` for all
    /// `i`. Fails — returning `None` and changing nothing — if any key is
    /// already present in its target bin or any bin would exceed capacity.
    /// On success returns the new largest bin size in the touched range;
    /// a dry run reports the same without mutating.
    pub fn try_multi_insert(
        &mut self,
        entries: &[BinEntry],
        start_bin_idx: usize,
        dry_run: bool,
    ) -> Option<usize> {
        if !self.range_ok(entries.len(), start_bin_idx) {
            return None;
        }
        for (i, (key, label_row)) in entries.iter().enumerate() {
            debug_assert_eq!(label_row.len(), self.label_size);
            let bin = &self.bins[start_bin_idx + i];
            if bin.contains_key(key) || bin.len() + 1 > self.max_bin_size {
                return None;
            }
        }

        let mut max_bin_size = 0;
        for (i, (key, label_row)) in entries.iter().enumerate() {
            let bin = &mut self.bins[start_bin_idx + i];
            max_bin_size = max_bin_size.max(bin.len() + 1);
            if !dry_run {
                bin.insert(*key, label_row.clone());
                self.cache_valid = false;
            }
        }
        Some(max_bin_size)
    }

    /// Overwrite label rows for a contiguous run of already-present keys.
    /// Returns `false` — and changes nothing — unless every key is present.
    pub fn try_multi_overwrite(&mut self, entries: &[BinEntry], start_bin_idx: usize) -> bool {
        if !self.range_ok(entries.len(), start_bin_idx) {
            return false;
        }
        for (i, (key, _)) in entries.iter().enumerate() {
            if !self.bins[start_bin_idx + i].contains_key(key) {
                return false;
            }
        }

        for (i, (key, label_row)) in entries.iter().enumerate() {
            self.bins[start_bin_idx + i].insert(*key, label_row.clone());
            self.cache_valid = false;
        }
        true
    }

    /// Atomically remove a contiguous run of keys: either all are present
    /// and removed, or nothing changes.
    pub fn try_multi_remove(&mut self, keys: &[Felt], start_bin_idx: usize) -> bool {
        if !self.range_ok(keys.len(), start_bin_idx) {
            return false;
        }
        for (i, key) in keys.iter().enumerate() {
            if !self.bins[start_bin_idx + i].contains_key(key) {
                return false;
            }
        }

        for (i, key) in keys.iter().enumerate() {
            self.bins[start_bin_idx + i].remove(key);
            self.cache_valid = false;
        }
        true
    }

    /// Fetch the label rows of a contiguous run of keys, or `None` if any key
    /// is missing from its bin.
    pub fn try_get_multi_label(
        &self,
        keys: &[Felt],
        start_bin_idx: usize,
    ) -> Option<Vec<Vec<Felt>>> {
        if !self.range_ok(keys.len(), start_bin_idx) {
            return None;
        }
        let mut labels = Vec::with_capacity(keys.len());
        for (i, key) in keys.iter().enumerate() {
            labels.push(self.bins[start_bin_idx + i].get(key)?.clone());
        }
        Some(labels)
    }

    /// Whether no bin holds an entry.
    pub fn is_empty(&self) -> bool {
        self.bins.iter().all(BTreeMap::is_empty)
    }

    /// Total entries across all bins.
    pub fn entry_count(&self) -> usize {
        self.bins.iter().map(BTreeMap::len).sum()
    }

    /// Whether the cache reflects the current bin contents.
    #[inline]
    pub fn cache_valid(&self) -> bool {
        self.cache_valid
    }

    /// The cache, or a state violation if it is stale.
    pub fn cache(&self) -> Result<&BinBundleCache> {
        if !self.cache_valid {
            return Err(PsiError::StateViolation("bin bundle cache is stale".into()));
        }
        Ok(&self.cache)
    }

    /// Recompute the polynomials and their batched plaintexts. Does nothing
    /// when the cache is already valid.
    pub fn regen_cache(&mut self) -> Result<()> {
        if self.cache_valid {
            return Ok(());
        }
        let t = self.ctx.plain_modulus();

        let matching_polyns: Vec<FeltPolyn> = self
            .bins
            .iter()
            .map(|bin| {
                let roots: Vec<Felt> = bin.keys().copied().collect();
                polyn_with_roots(&roots, t)
            })
            .collect();

        let mut interp_polyns = Vec::with_capacity(self.label_size);
        for part in 0..self.label_size {
            let part_polyns: Vec<FeltPolyn> = self
                .bins
                .iter()
                .map(|bin| {
                    let points: Vec<Felt> = bin.keys().copied().collect();
                    let values: Vec<Felt> = bin.values().map(|row| row[part]).collect();
                    newton_interpolate(&points, &values, t)
                })
                .collect();
            interp_polyns.push(part_polyns);
        }

        let batched_matching = BatchedPlaintextPolyn::new(&matching_polyns, &self.ctx)?;
        let batched_interp = interp_polyns
            .iter()
            .map(|p| BatchedPlaintextPolyn::new(p, &self.ctx))
            .collect::<Result<Vec<_>>>()?;

        self.cache = BinBundleCache {
            matching_polyns,
            interp_polyns,
            batched_matching: Some(batched_matching),
            batched_interp,
        };
        self.cache_valid = true;
        Ok(())
    }

    // ----------------------------- Persistence -----------------------------

    /// Flatten to the serialized form (entries only; see [`SavedBinBundle`]).
    pub fn to_saved(&self) -> SavedBinBundle {
        let mut entries = Vec::with_capacity(self.entry_count());
        for (bin_idx, bin) in self.bins.iter().enumerate() {
            for (key, row) in bin {
                entries.push((bin_idx as u32, *key, row.clone()));
            }
        }
        SavedBinBundle { entries, cache_valid: self.cache_valid }
    }

    /// Rebuild from the serialized form, regenerating the cache if it was
    /// valid at save time.
    pub fn from_saved(
        saved: SavedBinBundle,
        ctx: CryptoContext,
        bins_per_bundle: usize,
        label_size: usize,
        max_bin_size: usize,
    ) -> Result<Self> {
        let mut bundle = Self::new(ctx, bins_per_bundle, label_size, max_bin_size);
        for (bin_idx, key, row) in saved.entries {
            let bin = bundle
                .bins
                .get_mut(bin_idx as usize)
                .ok_or_else(|| PsiError::InvalidInput(format!("bin index {bin_idx} out of range")))?;
            if row.len() != label_size || bin.len() >= max_bin_size || bin.insert(key, row).is_some()
            {
                return Err(PsiError::InvalidInput("corrupt serialized bin bundle".into()));
            }
        }
        if saved.cache_valid {
            bundle.regen_cache()?;
        }
        Ok(bundle)
    }

    /// Snapshot of all entries, for equality checks and diagnostics.
    pub fn entries(&self) -> Vec<(u32, Felt, Vec<Felt>)> {
        self.to_saved().entries
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algebra::{eval_polyn, mul_mod, pow_mod};
    use crate::params::testing::tiny;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn ctx() -> CryptoContext {
        CryptoContext::new(&tiny()).unwrap()
    }

    fn unlabeled(entries: &[Felt]) -> Vec<BinEntry> {
        entries.iter().map(|&k| (k, Vec::new())).collect()
    }

    #[test]
    fn insert_dry_run_does_not_mutate() {
        let mut b = BinBundle::new(ctx(), 16, 0, 4);
        assert_eq!(b.try_multi_insert(&unlabeled(&[1, 2, 3]), 0, true), Some(1));
        assert!(b.is_empty());
        assert_eq!(b.try_multi_insert(&unlabeled(&[1, 2, 3]), 0, false), Some(1));
        assert_eq!(b.entry_count(), 3);
    }

    #[test]
    fn insert_rejects_duplicates_and_overflow() {
        let mut b = BinBundle::new(ctx(), 16, 0, 2);
        assert!(b.try_multi_insert(&unlabeled(&[7]), 3, false).is_some());
        // Duplicate key in the target bin.
        assert_eq!(b.try_multi_insert(&unlabeled(&[7]), 3, false), None);
        // Fill the bin to capacity, then overflow.
        assert!(b.try_multi_insert(&unlabeled(&[8]), 3, false).is_some());
        assert_eq!(b.try_multi_insert(&unlabeled(&[9]), 3, false), None);
        // Out-of-range start.
        assert_eq!(b.try_multi_insert(&unlabeled(&[1, 2]), 15, false), None);
        assert_eq!(b.entry_count(), 2);
    }

    #[test]
    fn overwrite_requires_full_presence() {
        let mut b = BinBundle::new(ctx(), 8, 1, 4);
        let original: Vec<BinEntry> = vec![(5, vec![10]), (6, vec![20])];
        assert!(b.try_multi_insert(&original, 2, false).is_some());

        // One key missing: nothing changes.
        assert!(!b.try_multi_overwrite(&[(5, vec![11]), (99, vec![21])], 2));
        assert_eq!(b.try_get_multi_label(&[5, 6], 2).unwrap(), vec![vec![10], vec![20]]);

        assert!(b.try_multi_overwrite(&[(5, vec![11]), (6, vec![21])], 2));
        assert_eq!(b.try_get_multi_label(&[5, 6], 2).unwrap(), vec![vec![11], vec![21]]);
    }

    #[test]
    fn remove_is_atomic() {
        let mut b = BinBundle::new(ctx(), 8, 0, 4);
        assert!(b.try_multi_insert(&unlabeled(&[1, 2]), 0, false).is_some());

        assert!(!b.try_multi_remove(&[1, 99], 0));
        assert_eq!(b.entry_count(), 2);

        assert!(b.try_multi_remove(&[1, 2], 0));
        assert!(b.is_empty());
    }

    #[test]
    fn cache_regen_is_idempotent_and_guarded() {
        let mut b = BinBundle::new(ctx(), 8, 1, 4);
        assert!(b.cache().is_err(), "fresh bundle cache must be stale");

        b.try_multi_insert(&[(3, vec![7]), (4, vec![9])], 0, false);
        b.regen_cache().unwrap();
        let first: Vec<FeltPolyn> = b.cache().unwrap().matching_polyns.clone();
        let first_interp: Vec<Vec<FeltPolyn>> = b.cache().unwrap().interp_polyns.clone();

        b.regen_cache().unwrap();
        assert_eq!(b.cache().unwrap().matching_polyns, first);
        assert_eq!(b.cache().unwrap().interp_polyns, first_interp);

        // Matching polynomial of bin 0 vanishes on the key and the interp
        // polynomial reproduces the label felt.
        let t = 65537;
        assert_eq!(eval_polyn(&first[0], 3, t), 0);
        assert_eq!(eval_polyn(&first_interp[0][0], 3, t), 7);

        // Mutation invalidates.
        b.try_multi_insert(&[(5, vec![1])], 6, false);
        assert!(b.cache().is_err());
    }

    #[test]
    fn saved_roundtrip_preserves_entries_and_cache_state() {
        let mut b = BinBundle::new(ctx(), 8, 1, 4);
        b.try_multi_insert(&[(3, vec![7]), (4, vec![9])], 1, false);
        b.regen_cache().unwrap();

        let bytes = bincode::serialize(&b.to_saved()).unwrap();
        let saved: SavedBinBundle = bincode::deserialize(&bytes).unwrap();
        let back = BinBundle::from_saved(saved, ctx(), 8, 1, 4).unwrap();

        assert_eq!(back.entries(), b.entries());
        assert!(back.cache_valid());
        assert_eq!(
            back.cache().unwrap().matching_polyns,
            b.cache().unwrap().matching_polyns
        );
    }

    /// Encrypt the receiver-side felt vector raised to every power up to
    /// `max_deg` (plaintext exponentiation stands in for the PowersDag here).
    fn all_powers(
        query: &[Felt],
        max_deg: usize,
        ctx: &CryptoContext,
        rng: &mut StdRng,
    ) -> CiphertextPowers {
        let t = ctx.plain_modulus();
        let mut powers: CiphertextPowers = vec![None; max_deg + 1];
        for (p, slot) in powers.iter_mut().enumerate().skip(1) {
            let raised: Vec<Felt> = query.iter().map(|&x| pow_mod(x, p as u64, t)).collect();
            let pt = ctx.encode_simd(&raised).unwrap();
            *slot = Some(ctx.encrypt_symmetric(&pt, rng).unwrap());
        }
        powers
    }

    #[test]
    fn encrypted_evaluation_finds_roots() {
        let params = tiny();
        let mut ctx = CryptoContext::new(&params).unwrap();
        let mut rng = StdRng::seed_from_u64(21);
        ctx.generate_keys(&mut rng).unwrap();
        let n = params.bins_per_bundle();
        let t = params.enc_params().plain_modulus;

        let mut b = BinBundle::new(ctx.clone(), n, 0, 4);
        // Bins 0..4 hold {10}, {11}, {12}, {13}; bin 7 holds {10, 20}.
        b.try_multi_insert(&unlabeled(&[10, 11, 12, 13]), 0, false);
        b.try_multi_insert(&unlabeled(&[10]), 7, false);
        b.try_multi_insert(&unlabeled(&[20]), 7, false);
        b.regen_cache().unwrap();

        // The query hits bins 0..4 with the stored values, bin 7 with a miss.
        let mut query = vec![1u64; n];
        query[0] = 10;
        query[1] = 11;
        query[2] = 12;
        query[3] = 13;
        query[7] = 21;

        let cache = b.cache().unwrap();
        let max_deg = cache.batched_matching.as_ref().unwrap().len() - 1;
        let powers = all_powers(&query, max_deg, &ctx, &mut rng);

        let result = cache.batched_matching.as_ref().unwrap().eval(&powers, &ctx).unwrap();
        let felts = ctx.decode_simd(&ctx.decrypt(&result).unwrap(), ctx.last_level()).unwrap();

        for slot in 0..4 {
            assert_eq!(felts[slot], 0, "stored item must evaluate to zero");
        }
        assert_ne!(felts[7], 0, "miss must evaluate nonzero");
        // An untouched bin has matching polynomial 1.
        assert_eq!(felts[100], 1);

        // Sanity against the plaintext polynomials.
        let plain = &cache.matching_polyns[7];
        assert_eq!(felts[7], eval_polyn(plain, 21, t));
    }

    #[test]
    fn paterson_stockmeyer_matches_straight_evaluation() {
        let params = tiny();
        let mut ctx = CryptoContext::new(&params).unwrap();
        let mut rng = StdRng::seed_from_u64(22);
        ctx.generate_keys(&mut rng).unwrap();
        let n = params.bins_per_bundle();
        let t = params.enc_params().plain_modulus;

        let mut b = BinBundle::new(ctx.clone(), n, 1, 8);
        // A bin with several entries so the polynomial degree exercises more
        // than one Paterson-Stockmeyer block.
        for key in [100u64, 200, 300, 400, 500] {
            b.try_multi_insert(&[(key, vec![mul_mod(key, 3, t)])], 0, false);
        }
        b.try_multi_insert(&[(9, vec![1])], 5, false);
        b.regen_cache().unwrap();

        let mut query = vec![2u64; n];
        query[0] = 300; // hit
        query[5] = 10; // miss

        let cache = b.cache().unwrap();
        let matching = cache.batched_matching.as_ref().unwrap();
        let interp = &cache.batched_interp[0];
        let max_deg = matching.len().max(interp.len()) - 1;
        let powers = all_powers(&query, max_deg, &ctx, &mut rng);

        for polyn in [matching, interp] {
            let plain_result = polyn.eval(&powers, &ctx).unwrap();
            let ps_result = polyn.eval_patstock(&powers, 2, &ctx).unwrap();
            let plain_felts =
                ctx.decode_simd(&ctx.decrypt(&plain_result).unwrap(), ctx.last_level()).unwrap();
            let ps_felts =
                ctx.decode_simd(&ctx.decrypt(&ps_result).unwrap(), ctx.last_level()).unwrap();
            assert_eq!(plain_felts, ps_felts);
        }

        // And the interpolation value at the hit recovers the label felt.
        let ps_result = interp.eval_patstock(&powers, 2, &ctx).unwrap();
        let felts = ctx.decode_simd(&ctx.decrypt(&ps_result).unwrap(), ctx.last_level()).unwrap();
        assert_eq!(felts[0], mul_mod(300, 3, t));
    }
}

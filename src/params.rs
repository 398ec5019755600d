//! PSI parameters: the numbers that bind the whole protocol together
//!
//! A [`PsiParams`] is an immutable bundle of four groups — item, table, query,
//! and encryption parameters — that validates itself on construction and
//! exposes the derived quantities everything downstream relies on. Sender and
//! receiver must agree on the full bundle; the sender ships it verbatim in
//! response to a parameter request.
//!
//! ## Validated invariants
//!
//! - `80 ≤ felts_per_item · ⌊log2 t⌋ ≤ 128` — items survive algebraization
//!   without collisions, and still fit a 128-bit hashed item;
//! - `felts_per_item` divides `poly_modulus_degree`, and
//!   `felts_per_item · max_items_per_bin ≤ poly_modulus_degree`;
//! - `table_size` is a positive multiple of `items_per_bundle`;
//! - `query_powers` contains 1, no 0, and nothing above `max_items_per_bin`;
//! - `ps_low_degree ≤ max_items_per_bin` (0 disables Paterson–Stockmeyer);
//! - `poly_modulus_degree` is a power of two, and the plain modulus is a
//!   prime with `t ≡ 1 (mod 2·poly_modulus_degree)` (SIMD batching).
//!
//! Serialization is self-describing: the JSON form ignores unknown keys
//! (forward compatibility) and fails on missing ones; the binary form is a
//! format-version prefix followed by a bincode body. Both round-trip through
//! [`PsiParams::new`], so a deserialized parameter set is always validated.

#![allow(missing_docs)]

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::algebra::is_prime;
use crate::{PsiError, Result};

/// Version tag for the binary parameter encoding.
const PARAMS_FORMAT_VERSION: u32 = 1;

/// Item parameters: how a 128-bit hashed item decomposes into felts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemParams {
    /// Number of field elements a single item splits into.
    pub felts_per_item: u32,
}

/// Cuckoo table parameters.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableParams {
    /// Total number of item slots in the cuckoo table.
    pub table_size: u32,
    /// Capacity of a single sender-side bin.
    pub max_items_per_bin: u32,
    /// Number of cuckoo location functions.
    pub hash_func_count: u32,
}

/// Query parameters: which ciphertext powers the receiver sends.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryParams {
    /// Paterson–Stockmeyer low-degree bound; 0 disables the optimization.
    pub ps_low_degree: u32,
    /// The source powers the receiver encrypts (always contains 1).
    pub query_powers: BTreeSet<u32>,
}

/// BFV encryption parameters handed to the FHE backend.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncParams {
    /// Ring dimension N (power of two). Also the number of SIMD slots.
    pub poly_modulus_degree: u64,
    /// Plaintext modulus t (prime, `t ≡ 1 mod 2N`).
    pub plain_modulus: u64,
    /// Bit sizes of the ciphertext coefficient modulus primes.
    pub coeff_modulus_bits: Vec<usize>,
}

/// The full, validated parameter bundle.
///
/// Construction goes through [`PsiParams::new`]; the fields are private so a
/// `PsiParams` in hand always satisfies the invariants listed in the module
/// docs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PsiParams {
    item_params: ItemParams,
    table_params: TableParams,
    query_params: QueryParams,
    enc_params: EncParams,
}

/// Mirror struct for deserialization; promoted via `PsiParams::new` so that
/// parsed parameters are validated exactly like constructed ones.
#[derive(Deserialize)]
struct PsiParamsRepr {
    item_params: ItemParams,
    table_params: TableParams,
    query_params: QueryParams,
    enc_params: EncParams,
}

impl PsiParams {
    /// Validate the four parameter groups and assemble a `PsiParams`.
    pub fn new(
        item_params: ItemParams,
        table_params: TableParams,
        query_params: QueryParams,
        enc_params: EncParams,
    ) -> Result<Self> {
        let bad = |msg: String| Err(PsiError::InvalidParams(msg));

        let n = enc_params.poly_modulus_degree;
        if n < 2 || !n.is_power_of_two() {
            return bad(format!("poly_modulus_degree must be a power of two >= 2, got {n}"));
        }
        let t = enc_params.plain_modulus;
        if !is_prime(t) {
            return bad(format!("plain_modulus {t} is not prime"));
        }
        if t % (2 * n) != 1 {
            return bad(format!(
                "plain_modulus {t} does not support batching for degree {n} (t % 2N != 1)"
            ));
        }
        if enc_params.coeff_modulus_bits.is_empty() {
            return bad("coeff_modulus_bits must not be empty".into());
        }
        if enc_params.coeff_modulus_bits.iter().any(|&b| b == 0 || b > 62) {
            return bad("coeff_modulus_bits entries must be in 1..=62".into());
        }

        let fpi = u64::from(item_params.felts_per_item);
        if fpi == 0 || n % fpi != 0 {
            return bad(format!("felts_per_item {fpi} must be positive and divide N = {n}"));
        }
        let bits_per_felt = 63 - t.leading_zeros() as usize; // floor(log2 t)
        let item_bit_count = item_params.felts_per_item as usize * bits_per_felt;
        if !(80..=128).contains(&item_bit_count) {
            return bad(format!(
                "felts_per_item * floor(log2 t) = {item_bit_count} must be in 80..=128"
            ));
        }

        if table_params.max_items_per_bin == 0 {
            return bad("max_items_per_bin must be positive".into());
        }
        if fpi * u64::from(table_params.max_items_per_bin) > n {
            return bad(format!(
                "felts_per_item * max_items_per_bin exceeds poly_modulus_degree {n}"
            ));
        }
        if table_params.hash_func_count == 0 {
            return bad("hash_func_count must be positive".into());
        }
        let items_per_bundle = n / fpi;
        let table_size = u64::from(table_params.table_size);
        if table_size == 0 || table_size % items_per_bundle != 0 {
            return bad(format!(
                "table_size {table_size} must be a positive multiple of items_per_bundle \
                 {items_per_bundle}"
            ));
        }

        if query_params.query_powers.contains(&0) {
            return bad("query_powers must not contain 0".into());
        }
        if !query_params.query_powers.contains(&1) {
            return bad("query_powers must contain 1".into());
        }
        if let Some(&max_power) = query_params.query_powers.iter().next_back() {
            if max_power > table_params.max_items_per_bin {
                return bad(format!(
                    "query power {max_power} exceeds max_items_per_bin {}",
                    table_params.max_items_per_bin
                ));
            }
        }
        if query_params.ps_low_degree > table_params.max_items_per_bin {
            return bad(format!(
                "ps_low_degree {} exceeds max_items_per_bin {}",
                query_params.ps_low_degree, table_params.max_items_per_bin
            ));
        }

        Ok(Self { item_params, table_params, query_params, enc_params })
    }

    // ------------------------------ Accessors ------------------------------

    pub fn item_params(&self) -> &ItemParams {
        &self.item_params
    }
    pub fn table_params(&self) -> &TableParams {
        &self.table_params
    }
    pub fn query_params(&self) -> &QueryParams {
        &self.query_params
    }
    pub fn enc_params(&self) -> &EncParams {
        &self.enc_params
    }

    // -------------------------- Derived quantities -------------------------

    /// Bits of an item carried by one felt: `⌊log2 t⌋`.
    #[inline]
    pub fn item_bit_count_per_felt(&self) -> usize {
        63 - self.enc_params.plain_modulus.leading_zeros() as usize
    }

    /// Total bits of an item that survive algebraization.
    #[inline]
    pub fn item_bit_count(&self) -> usize {
        self.item_params.felts_per_item as usize * self.item_bit_count_per_felt()
    }

    /// Number of bins per bundle; equals the SIMD slot count N.
    #[inline]
    pub fn bins_per_bundle(&self) -> usize {
        self.enc_params.poly_modulus_degree as usize
    }

    /// Number of item slots a single bundle covers.
    #[inline]
    pub fn items_per_bundle(&self) -> usize {
        self.bins_per_bundle() / self.item_params.felts_per_item as usize
    }

    /// Number of bundle indices the cuckoo table splits into.
    #[inline]
    pub fn bundle_idx_count(&self) -> usize {
        self.table_params.table_size as usize / self.items_per_bundle()
    }

    // ----------------------------- Serialization ---------------------------

    /// Human-facing JSON encoding. Unknown keys are ignored on parse; missing
    /// required keys fail with [`PsiError::InvalidParams`].
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).expect("PsiParams is always JSON-serializable")
    }

    /// Parse and validate a JSON parameter set.
    pub fn from_json(json: &str) -> Result<Self> {
        let repr: PsiParamsRepr = serde_json::from_str(json)
            .map_err(|e| PsiError::InvalidParams(format!("params JSON: {e}")))?;
        Self::new(repr.item_params, repr.table_params, repr.query_params, repr.enc_params)
    }

    /// Compact binary encoding: format version followed by a bincode body.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = PARAMS_FORMAT_VERSION.to_le_bytes().to_vec();
        out.extend(bincode::serialize(self).expect("PsiParams is always serializable"));
        out
    }

    /// Parse and validate the binary encoding.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(PsiError::InvalidParams("params blob too short".into()));
        }
        let version = u32::from_le_bytes(bytes[..4].try_into().expect("length checked"));
        if version != PARAMS_FORMAT_VERSION {
            return Err(PsiError::InvalidParams(format!(
                "unsupported params format version {version}"
            )));
        }
        let repr: PsiParamsRepr = bincode::deserialize(&bytes[4..])
            .map_err(|e| PsiError::InvalidParams(format!("params body: {e}")))?;
        Self::new(repr.item_params, repr.table_params, repr.query_params, repr.enc_params)
    }
}

// ============================================================================
// Test fixtures (shared across the crate's test modules)
// ============================================================================


// ============================================================================
// Tests
// ============================================================================

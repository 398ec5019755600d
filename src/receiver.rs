//! Receiver: query construction and result processing
//!
//! The receiver owns the only secret key in the protocol. A query is built in
//! four steps: cuckoo-hash the (OPRF-processed) items into the shared table
//! shape; algebraize each bundle-index slice of the table; raise the felt
//! vectors to every source power mod `t`; SIMD-encode and symmetrically
//! encrypt. The [`IndexTranslationTable`] produced alongside maps cuckoo
//! slots back to input positions — without it the decrypted result rows are
//! meaningless, and slots that never held an input are ignored no matter
//! what they decrypt to.
//!
//! Result parts arrive in arbitrary order and are processed independently:
//! decrypt, decode, scan for item slots whose `felts_per_item` felts are all
//! zero, translate to input indices, and (for labeled databases) reassemble
//! and decrypt the label. A positive match showing up twice for one input
//! index means the translation table or the peer is corrupt, and processing
//! fails loudly.

#![allow(missing_docs)]

use std::collections::{BTreeMap, HashMap};

use rand::{CryptoRng, RngCore};
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::algebra::pow_mod;
use crate::channel::Channel;
use crate::context::CryptoContext;
use crate::cuckoo::{CuckooTable, InsertOutcome, TABLE_INSERT_ATTEMPTS};
use crate::encoding::{algebraize_slot, dealgebraize_label, HashedItem, Item};
use crate::labels::{decrypt_label, LabelKey};
use crate::messages::{OprfRequest, QueryRequest, Request, Response, ResultPart};
use crate::oprf::OprfReceiver;
use crate::params::PsiParams;
use crate::powers::{target_powers, PowersDag};
use crate::thread_pool::{self, ThreadPoolMgr};
use crate::{Felt, PsiError, Result};

/// Per-query map from cuckoo table index to input item index.
pub struct IndexTranslationTable {
    table_idx_to_item_idx: HashMap<usize, usize>,
    item_count: usize,
}

impl IndexTranslationTable {
    /// Input index occupying a table slot, if any.
    pub fn find_item_idx(&self, table_idx: usize) -> Option<usize> {
        self.table_idx_to_item_idx.get(&table_idx).copied()
    }

    /// Number of items in the query this table belongs to.
    #[inline]
    pub fn item_count(&self) -> usize {
        self.item_count
    }
}

/// Per-item query outcome.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MatchRecord {
    /// Whether the item is in the sender's set.
    pub found: bool,
    /// Decrypted label, when the database is labeled and the item matched.
    pub label: Option<Vec<u8>>,
}

/// The receiver half of the protocol. Holds the secret key; see module docs.
pub struct Receiver {
    params: PsiParams,
    ctx: CryptoContext,
    _pool: ThreadPoolMgr,
}

impl Receiver {
    /// Set up a receiver for the given (sender-provided) parameters and
    /// generate fresh keys.
    pub fn new<R: RngCore + CryptoRng>(params: PsiParams, rng: &mut R) -> Result<Self> {
        // Fail fast if the parameters cannot produce a usable powers DAG;
        // the sender will configure the identical DAG from the same inputs.
        let mut pd = PowersDag::new();
        pd.configure(
            &params.query_params().query_powers,
            &target_powers(
                params.query_params().ps_low_degree,
                params.table_params().max_items_per_bin,
            ),
        )?;
        debug!(depth = pd.depth(), "receiver powers DAG configured");

        let mut ctx = CryptoContext::new(&params)?;
        ctx.generate_keys(rng)?;
        Ok(Self { params, ctx, _pool: ThreadPoolMgr::new() })
    }

    #[inline]
    pub fn params(&self) -> &PsiParams {
        &self.params
    }

    #[inline]
    pub fn crypto_context(&self) -> &CryptoContext {
        &self.ctx
    }

    /// Rotate the secret and relinearization keys.
    pub fn reset_keys<R: RngCore + CryptoRng>(&mut self, rng: &mut R) -> Result<()> {
        self.ctx.generate_keys(rng)
    }

    // --------------------------- Query construction ------------------------

    /// Build the encrypted query and its translation table.
    pub fn create_query<R: RngCore + CryptoRng>(
        &self,
        items: &[HashedItem],
        rng: &mut R,
    ) -> Result<(QueryRequest, IndexTranslationTable)> {
        info!(items = items.len(), "creating encrypted query");
        let table = self.params.table_params();

        let mut cuckoo =
            CuckooTable::new(table.table_size, table.hash_func_count, TABLE_INSERT_ATTEMPTS);
        for (item_idx, item) in items.iter().enumerate() {
            match cuckoo.insert(*item) {
                InsertOutcome::Placed => {}
                InsertOutcome::Repeated => {
                    info!(item_idx, "skipping repeated insertion of query item");
                }
                InsertOutcome::Exhausted => {
                    let fill_rate = cuckoo.fill_rate();
                    warn!(item_idx, fill_rate, "cuckoo hashing failed");
                    return Err(PsiError::CuckooFull { item_idx, fill_rate });
                }
            }
        }
        debug!(fill_rate = cuckoo.fill_rate(), "cuckoo table filled");

        let mut table_idx_to_item_idx = HashMap::with_capacity(items.len());
        for (item_idx, item) in items.iter().enumerate() {
            if let Some(table_idx) = cuckoo.query(item) {
                table_idx_to_item_idx.insert(table_idx, item_idx);
            }
        }
        let itt = IndexTranslationTable { table_idx_to_item_idx, item_count: items.len() };

        let t = self.params.enc_params().plain_modulus;
        let items_per_bundle = self.params.items_per_bundle();
        let query_powers = &self.params.query_params().query_powers;
        let relin_keys = self
            .ctx
            .relin_key_bytes()
            .ok_or_else(|| PsiError::StateViolation("receiver has no keys".into()))?;

        let mut data: BTreeMap<u32, Vec<Vec<u8>>> =
            query_powers.iter().map(|&p| (p, Vec::new())).collect();
        for bundle_idx in 0..self.params.bundle_idx_count() {
            let mut alg_items: Vec<Felt> = Vec::with_capacity(self.params.bins_per_bundle());
            let base = bundle_idx * items_per_bundle;
            for slot in base..base + items_per_bundle {
                alg_items.extend(algebraize_slot(&cuckoo.slot_bytes(slot), &self.params));
            }

            for &power in query_powers {
                let raised: Vec<Felt> =
                    alg_items.iter().map(|&x| pow_mod(x, u64::from(power), t)).collect();
                let pt = self.ctx.encode_simd(&raised)?;
                let ct = self.ctx.encrypt_symmetric(&pt, rng)?;
                data.get_mut(&power).expect("power preseeded").push(self.ctx.serialize_ct(&ct));
            }
        }

        let request = QueryRequest {
            compr_mode: 0,
            relin_keys,
            data: data.into_iter().collect(),
        };
        info!("finished creating encrypted query");
        Ok((request, itt))
    }

    // ---------------------------- Result handling --------------------------

    /// Decrypt and interpret one result part.
    pub fn process_result_part(
        &self,
        label_keys: &[LabelKey],
        itt: &IndexTranslationTable,
        part: &ResultPart,
    ) -> Result<Vec<MatchRecord>> {
        let fpi = self.params.item_params().felts_per_item as usize;
        let items_per_bundle = self.params.items_per_bundle();
        if (part.bundle_idx as usize) >= self.params.bundle_idx_count() {
            return Err(PsiError::InvalidProtocol(format!(
                "result part for bundle index {} is out of range",
                part.bundle_idx
            )));
        }
        let bundle_start = part.bundle_idx as usize * items_per_bundle;

        let psi_ct = self.ctx.deserialize_ct(&part.psi_result)?;
        let felts = self.ctx.decode_simd(&self.ctx.decrypt(&psi_ct)?, self.ctx.last_level())?;

        // Decide how much label data we can actually honor.
        let mut label_byte_count = part.label_byte_count as usize;
        let mut nonce_byte_count = part.nonce_byte_count as usize;
        if label_byte_count > 0 && part.label_result.is_empty() {
            warn!("result part promises labels but carries none; ignoring label data");
            label_byte_count = 0;
        }
        if label_byte_count > 0 && label_keys.len() != itt.item_count() {
            warn!(
                keys = label_keys.len(),
                items = itt.item_count(),
                "label key count mismatch; ignoring label data"
            );
            label_byte_count = 0;
        }
        if label_byte_count > 0 {
            let received_bytes = part.label_result.len() * self.params.item_bit_count() / 8;
            if received_bytes < nonce_byte_count {
                warn!("not even the label nonce was received; ignoring label data");
                label_byte_count = 0;
            } else if received_bytes < nonce_byte_count + label_byte_count {
                warn!(
                    received = received_bytes - nonce_byte_count,
                    expected = label_byte_count,
                    "short label data"
                );
                label_byte_count = received_bytes - nonce_byte_count;
            }
        }
        if label_byte_count == 0 {
            nonce_byte_count = 0;
        }

        let label_felts: Vec<Vec<Felt>> = if label_byte_count > 0 {
            part.label_result
                .iter()
                .map(|bytes| {
                    let ct = self.ctx.deserialize_ct(bytes)?;
                    self.ctx.decode_simd(&self.ctx.decrypt(&ct)?, self.ctx.last_level())
                })
                .collect::<Result<Vec<_>>>()?
        } else {
            Vec::new()
        };

        let mut mrs = vec![MatchRecord::default(); itt.item_count()];
        for slot in 0..items_per_bundle {
            let row = &felts[slot * fpi..(slot + 1) * fpi];
            if row.iter().any(|&f| f != 0) {
                continue;
            }

            // All-zero felts: a match, if this slot belongs to a query item.
            let table_idx = bundle_start + slot;
            let Some(item_idx) = itt.find_item_idx(table_idx) else {
                continue;
            };
            if mrs[item_idx].found {
                return Err(PsiError::InvalidProtocol(
                    "duplicate positive match inside one result part".into(),
                ));
            }

            let mut mr = MatchRecord { found: true, label: None };
            if label_byte_count > 0 {
                let parts: Vec<Vec<Felt>> = label_felts
                    .iter()
                    .map(|lf| lf[slot * fpi..(slot + 1) * fpi].to_vec())
                    .collect();
                let mut encrypted = dealgebraize_label(&parts, &self.params);
                encrypted.truncate(nonce_byte_count + label_byte_count);
                mr.label =
                    Some(decrypt_label(&encrypted, &label_keys[item_idx], nonce_byte_count)?);
            }
            debug!(item_idx, table_idx, "match found");
            mrs[item_idx] = mr;
        }
        Ok(mrs)
    }

    /// Process a batch of result parts and merge their records. Parts are
    /// independent, so the per-part work runs on the shared pool.
    pub fn process_result(
        &self,
        label_keys: &[LabelKey],
        itt: &IndexTranslationTable,
        parts: &[ResultPart],
    ) -> Result<Vec<MatchRecord>> {
        let partials: Vec<Vec<MatchRecord>> = thread_pool::pool().install(|| {
            parts
                .par_iter()
                .map(|part| self.process_result_part(label_keys, itt, part))
                .collect::<Result<Vec<_>>>()
        })?;

        let mut mrs = vec![MatchRecord::default(); itt.item_count()];
        for partial in partials {
            for (idx, mr) in partial.into_iter().enumerate() {
                if !mr.found {
                    continue;
                }
                if mrs[idx].found {
                    return Err(PsiError::InvalidProtocol(format!(
                        "items[{idx}] matched in two different result parts"
                    )));
                }
                mrs[idx] = mr;
            }
        }
        info!(matches = mrs.iter().filter(|m| m.found).count(), "query processed");
        Ok(mrs)
    }

    // --------------------------- Blocking protocol --------------------------

    /// Fetch the sender's parameters (used before constructing a Receiver).
    pub fn request_params<C: Channel>(chl: &mut C) -> Result<PsiParams> {
        chl.send_request(&Request::Params)?;
        match chl.receive_response()? {
            Response::Params(r) => PsiParams::from_bytes(&r.params),
            _ => Err(PsiError::InvalidProtocol("expected a parameter response".into())),
        }
    }

    /// Run the OPRF round for raw items.
    pub fn request_oprf<C: Channel, R: RngCore + CryptoRng>(
        &self,
        items: &[Item],
        chl: &mut C,
        rng: &mut R,
    ) -> Result<(Vec<HashedItem>, Vec<LabelKey>)> {
        let oprf_receiver = OprfReceiver::new(items, rng);
        chl.send_request(&Request::Oprf(OprfRequest {
            data: oprf_receiver.query_data().to_vec(),
        }))?;
        match chl.receive_response()? {
            Response::Oprf(r) => oprf_receiver.process_responses(&r.data),
            _ => Err(PsiError::InvalidProtocol("expected an OPRF response".into())),
        }
    }

    /// Run the query round for OPRF-processed items.
    pub fn request_query<C: Channel, R: RngCore + CryptoRng>(
        &self,
        items: &[HashedItem],
        label_keys: &[LabelKey],
        chl: &mut C,
        rng: &mut R,
    ) -> Result<Vec<MatchRecord>> {
        let (request, itt) = self.create_query(items, rng)?;
        chl.send_request(&Request::Query(request))?;

        let package_count = match chl.receive_response()? {
            Response::Query(r) => r.package_count,
            _ => return Err(PsiError::InvalidProtocol("expected a query response".into())),
        };

        let mut parts = Vec::with_capacity(package_count as usize);
        for _ in 0..package_count {
            parts.push(chl.receive_result_part()?);
        }
        self.process_result(label_keys, &itt, &parts)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::testing::{tiny, two_bundles};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn hashed(tag: u64) -> HashedItem {
        HashedItem::new(*Item::from_bytes(&tag.to_le_bytes()).value())
    }

    #[test]
    fn query_has_one_ciphertext_per_power_and_bundle() {
        let mut rng = StdRng::seed_from_u64(41);
        let receiver = Receiver::new(two_bundles(), &mut rng).unwrap();
        let items: Vec<HashedItem> = (0..20).map(hashed).collect();

        let (request, itt) = receiver.create_query(&items, &mut rng).unwrap();
        assert_eq!(itt.item_count(), 20);
        assert_eq!(request.data.len(), 3); // query powers {1, 2, 4}
        for (_, cts) in &request.data {
            assert_eq!(cts.len(), 2); // bundle_idx_count
        }
        assert!(!request.relin_keys.is_empty());

        // Every item is translated back to its input position.
        let translated: Vec<usize> = (0..receiver.params().table_params().table_size as usize)
            .filter_map(|slot| itt.find_item_idx(slot))
            .collect();
        assert_eq!(translated.len(), 20);
    }

    #[test]
    fn query_ciphertexts_decrypt_to_slot_powers() {
        let mut rng = StdRng::seed_from_u64(42);
        let receiver = Receiver::new(tiny(), &mut rng).unwrap();
        let items: Vec<HashedItem> = (0..5).map(hashed).collect();
        let (request, itt) = receiver.create_query(&items, &mut rng).unwrap();

        let ctx = receiver.crypto_context();
        let t = receiver.params().enc_params().plain_modulus;
        let fpi = receiver.params().item_params().felts_per_item as usize;

        // Power-1 ciphertext decodes to the algebraized cuckoo table, with
        // every placed item's felts at its translated slot.
        let (_, cts) = request.data.iter().find(|(p, _)| *p == 1).unwrap();
        let mut ct = ctx.deserialize_ct(&cts[0]).unwrap();
        ctx.mod_switch_to_last(&mut ct).unwrap();
        let felts = ctx.decode_simd(&ctx.decrypt(&ct).unwrap(), ctx.last_level()).unwrap();

        for (item_idx, item) in items.iter().enumerate() {
            let slot = (0..felts.len() / fpi)
                .find(|&s| itt.find_item_idx(s) == Some(item_idx))
                .expect("item placed in first bundle");
            let expected = crate::encoding::algebraize_item(item, receiver.params());
            assert_eq!(&felts[slot * fpi..(slot + 1) * fpi], expected.as_slice());
        }

        // Power-2 ciphertext is the elementwise square.
        let (_, cts2) = request.data.iter().find(|(p, _)| *p == 2).unwrap();
        let mut ct2 = ctx.deserialize_ct(&cts2[0]).unwrap();
        ctx.mod_switch_to_last(&mut ct2).unwrap();
        let squared = ctx.decode_simd(&ctx.decrypt(&ct2).unwrap(), ctx.last_level()).unwrap();
        for (a, b) in felts.iter().zip(&squared) {
            assert_eq!(*b, crate::algebra::mul_mod(*a, *a, t));
        }
    }

    #[test]
    fn repeated_items_are_skipped_not_fatal() {
        let mut rng = StdRng::seed_from_u64(43);
        let receiver = Receiver::new(tiny(), &mut rng).unwrap();
        let items = vec![hashed(1), hashed(1), hashed(2)];
        let (_, itt) = receiver.create_query(&items, &mut rng).unwrap();
        // Both copies translate to one slot; the later index wins the table.
        assert_eq!(itt.item_count(), 3);
    }

    #[test]
    fn overfull_query_fails_with_cuckoo_full() {
        let mut rng = StdRng::seed_from_u64(44);
        let receiver = Receiver::new(tiny(), &mut rng).unwrap();
        // Table size is 512; 600 distinct items cannot fit.
        let items: Vec<HashedItem> = (0..600).map(hashed).collect();
        assert!(matches!(
            receiver.create_query(&items, &mut rng),
            Err(PsiError::CuckooFull { .. })
        ));
    }
}

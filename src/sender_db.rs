//! SenderDb: the sender's whole queryable state
//!
//! The database is a vector of bundle sets, one per bundle index. An inserted
//! item is OPRF-hashed with the long-lived key, its label (if any) encrypted
//! under the per-item label key, and the algebraized entry placed at *every*
//! cuckoo location the item can land in — the receiver may end up using any
//! of them. Within one bundle index the first bundle that accepts an entry
//! wins; a fresh bundle is appended when all refuse.
//!
//! Readers and writers share a reader-writer lock: a query evaluates against
//! a consistent snapshot under the read lock, while inserts, overwrites and
//! removals hold the write lock and regenerate the affected caches before
//! releasing it. Work on distinct bundle indices is spread across the shared
//! worker pool.
//!
//! [`SenderDb::strip`] discards the item set and the OPRF key. A stripped
//! database still answers queries from its caches but refuses mutation and
//! OPRF service.

#![allow(missing_docs)]

use std::collections::HashSet;
use std::io::{Read, Write};

use parking_lot::{RwLock, RwLockReadGuard};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::bundle::{BinBundle, BinEntry, SavedBinBundle};
use crate::context::CryptoContext;
use crate::cuckoo::all_locations;
use crate::encoding::{
    algebraize_item, algebraize_label, dealgebraize_label, label_part_count, HashedItem, Item,
};
use crate::labels::{decrypt_label, encrypt_label};
use crate::oprf::{self, OprfKey, OPRF_KEY_SIZE};
use crate::params::PsiParams;
use crate::{thread_pool, Felt, PsiError, Result, MAX_NONCE_BYTE_COUNT};

const SENDER_DB_MAGIC: u32 = 0x7073_6462;
const SENDER_DB_VERSION: u32 = 1;

// ============================================================================
// State
// ============================================================================

pub(crate) struct DbState {
    pub(crate) oprf_key: Option<OprfKey>,
    pub(crate) items: HashSet<HashedItem>,
    pub(crate) bundles: Vec<Vec<BinBundle>>,
    pub(crate) stripped: bool,
}

/// The sender's database. See the module docs.
pub struct SenderDb {
    params: PsiParams,
    ctx: CryptoContext,
    label_byte_count: usize,
    nonce_byte_count: usize,
    compressed: bool,
    state: RwLock<DbState>,
}

/// One unit of insertion/overwrite work routed to a bundle index.
struct InsertWork {
    bin_idx: usize,
    entries: Vec<BinEntry>,
    overwrite: bool,
}

struct RemoveWork {
    bin_idx: usize,
    keys: Vec<Felt>,
}

impl SenderDb {
    /// Create an empty database. `label_byte_count == 0` selects the
    /// unlabeled mode; a missing OPRF key is sampled fresh.
    pub fn new(
        params: PsiParams,
        label_byte_count: usize,
        nonce_byte_count: usize,
        compressed: bool,
        oprf_key: Option<OprfKey>,
    ) -> Result<Self> {
        if label_byte_count > 0 && nonce_byte_count > MAX_NONCE_BYTE_COUNT {
            return Err(PsiError::InvalidInput(format!(
                "nonce_byte_count {nonce_byte_count} exceeds {MAX_NONCE_BYTE_COUNT}"
            )));
        }
        let nonce_byte_count = if label_byte_count > 0 { nonce_byte_count } else { 0 };

        let ctx = CryptoContext::new(&params)?;
        let bundle_idx_count = params.bundle_idx_count();
        let oprf_key = oprf_key.unwrap_or_else(|| OprfKey::random(&mut rand::rngs::OsRng));

        info!(
            bundle_idx_count,
            label_byte_count, nonce_byte_count, "created sender database"
        );

        Ok(Self {
            params,
            ctx,
            label_byte_count,
            nonce_byte_count,
            compressed,
            state: RwLock::new(DbState {
                oprf_key: Some(oprf_key),
                items: HashSet::new(),
                bundles: (0..bundle_idx_count).map(|_| Vec::new()).collect(),
                stripped: false,
            }),
        })
    }

    // ------------------------------ Accessors ------------------------------

    #[inline]
    pub fn params(&self) -> &PsiParams {
        &self.params
    }

    #[inline]
    pub fn crypto_context(&self) -> &CryptoContext {
        &self.ctx
    }

    #[inline]
    pub fn is_labeled(&self) -> bool {
        self.label_byte_count > 0
    }

    #[inline]
    pub fn label_byte_count(&self) -> usize {
        self.label_byte_count
    }

    #[inline]
    pub fn nonce_byte_count(&self) -> usize {
        self.nonce_byte_count
    }

    #[inline]
    pub fn is_compressed(&self) -> bool {
        self.compressed
    }

    pub fn is_stripped(&self) -> bool {
        self.state.read().stripped
    }

    /// Felts of encrypted label stored per bin entry.
    fn label_size(&self) -> usize {
        if self.is_labeled() {
            label_part_count(self.nonce_byte_count + self.label_byte_count, &self.params)
        } else {
            0
        }
    }

    pub fn item_count(&self) -> usize {
        self.state.read().items.len()
    }

    /// Copy of the inserted item set (empty once stripped).
    pub fn hashed_items(&self) -> HashSet<HashedItem> {
        self.state.read().items.clone()
    }

    pub fn bin_bundle_count(&self) -> usize {
        self.state.read().bundles.iter().map(Vec::len).sum()
    }

    /// Diagnostic only: how full the bundles are relative to their capacity.
    pub fn packing_rate(&self) -> f64 {
        let state = self.state.read();
        let bundle_count: usize = state.bundles.iter().map(Vec::len).sum();
        let capacity = bundle_count
            * self.params.items_per_bundle()
            * self.params.table_params().max_items_per_bin as usize;
        if capacity == 0 {
            return 0.0;
        }
        let insertions = state.items.len() * self.params.table_params().hash_func_count as usize;
        insertions as f64 / capacity as f64
    }

    /// The OPRF key, needed to answer OPRF requests.
    pub fn oprf_key(&self) -> Result<OprfKey> {
        self.state
            .read()
            .oprf_key
            .clone()
            .ok_or_else(|| PsiError::StateViolation("stripped database has no OPRF key".into()))
    }

    pub(crate) fn read_state(&self) -> RwLockReadGuard<'_, DbState> {
        self.state.read()
    }

    // ------------------------------- Insertion -----------------------------

    /// Insert items into an unlabeled database; repeats are ignored.
    pub fn insert_or_assign(&self, items: &[Item]) -> Result<()> {
        if self.is_labeled() {
            return Err(PsiError::InvalidInput(
                "labeled database requires insert_or_assign_labeled".into(),
            ));
        }

        let mut state = self.state.write();
        let key = Self::writable_key(&state)?;

        let pool = thread_pool::pool();
        let hashed: Vec<HashedItem> = pool.install(|| {
            items.par_iter().map(|item| oprf::hash_item(item, &key).0).collect()
        });

        // Repeats (within the input or against the database) are dropped.
        let mut seen: HashSet<HashedItem> = HashSet::with_capacity(hashed.len());
        let mut fresh: Vec<HashedItem> = Vec::with_capacity(hashed.len());
        for h in hashed {
            if !state.items.contains(&h) && seen.insert(h) {
                fresh.push(h);
            }
        }
        debug!(new = fresh.len(), total = items.len(), "unlabeled insert");

        let work: Vec<(HashedItem, Vec<BinEntry>)> = fresh
            .iter()
            .map(|h| (*h, self.alg_entries(h, None)))
            .collect();
        self.dispatch_insert(&mut state, &work, false)?;
        state.items.extend(fresh);
        Ok(())
    }

    /// Insert item-label pairs; labels of already-present items are
    /// overwritten in place.
    pub fn insert_or_assign_labeled(&self, pairs: &[(Item, Vec<u8>)]) -> Result<()> {
        if !self.is_labeled() {
            return Err(PsiError::InvalidInput(
                "unlabeled database cannot store labels".into(),
            ));
        }

        let mut state = self.state.write();
        let key = Self::writable_key(&state)?;
        let (label_byte_count, nonce_byte_count) = (self.label_byte_count, self.nonce_byte_count);

        let pool = thread_pool::pool();
        let hashed: Vec<(HashedItem, Vec<u8>)> = pool.install(|| {
            pairs
                .par_iter()
                .map(|(item, label)| -> Result<(HashedItem, Vec<u8>)> {
                    let (h, label_key) = oprf::hash_item(item, &key);
                    let encrypted = encrypt_label(
                        label,
                        &label_key,
                        label_byte_count,
                        nonce_byte_count,
                        &mut rand::thread_rng(),
                    )?;
                    Ok((h, encrypted))
                })
                .collect::<Result<Vec<_>>>()
        })?;

        let mut new_items: HashSet<HashedItem> = HashSet::new();
        let mut new_work: Vec<(HashedItem, Vec<BinEntry>)> = Vec::new();
        let mut overwrite_work: Vec<(HashedItem, Vec<BinEntry>)> = Vec::new();
        for (h, encrypted) in &hashed {
            let entries = self.alg_entries(h, Some(encrypted));
            if state.items.contains(h) || !new_items.insert(*h) {
                overwrite_work.push((*h, entries));
            } else {
                new_work.push((*h, entries));
            }
        }
        debug!(
            new = new_work.len(),
            overwritten = overwrite_work.len(),
            "labeled insert"
        );

        self.dispatch_insert(&mut state, &new_work, false)?;
        self.dispatch_insert(&mut state, &overwrite_work, true)?;
        state.items.extend(new_items);
        Ok(())
    }

    /// Remove previously inserted items. Fails without changing anything if
    /// any item is not present.
    pub fn remove(&self, items: &[Item]) -> Result<()> {
        let mut state = self.state.write();
        let key = Self::writable_key(&state)?;

        let pool = thread_pool::pool();
        let hashed: Vec<HashedItem> = pool.install(|| {
            items.par_iter().map(|item| oprf::hash_item(item, &key).0).collect()
        });
        for h in &hashed {
            if !state.items.contains(h) {
                return Err(PsiError::InvalidInput(format!("{h:?} is not in the database")));
            }
        }

        // Group per bundle index, then work the indices in parallel.
        let mut groups: Vec<Vec<RemoveWork>> =
            (0..self.params.bundle_idx_count()).map(|_| Vec::new()).collect();
        for h in &hashed {
            let keys = algebraize_item(h, &self.params);
            for (bundle_idx, bin_idx) in self.locations_of(h) {
                groups[bundle_idx].push(RemoveWork { bin_idx, keys: keys.clone() });
            }
        }

        pool.install(|| {
            state
                .bundles
                .par_iter_mut()
                .zip(groups.par_iter())
                .map(|(bundle_set, work)| -> Result<()> {
                    if work.is_empty() {
                        return Ok(());
                    }
                    for w in work {
                        let removed = bundle_set
                            .iter_mut()
                            .any(|b| b.try_multi_remove(&w.keys, w.bin_idx));
                        if !removed {
                            return Err(PsiError::StateViolation(
                                "item is in the set but absent from every bin bundle".into(),
                            ));
                        }
                    }
                    bundle_set.retain(|b| !b.is_empty());
                    for b in bundle_set.iter_mut() {
                        b.regen_cache()?;
                    }
                    Ok(())
                })
                .collect::<Result<()>>()
        })?;

        for h in &hashed {
            state.items.remove(h);
        }
        info!(removed = hashed.len(), "removed items");
        Ok(())
    }

    /// Look up and decrypt the label of an item.
    pub fn get_label(&self, item: &Item) -> Result<Vec<u8>> {
        if !self.is_labeled() {
            return Err(PsiError::InvalidInput("database is unlabeled".into()));
        }
        let state = self.state.read();
        let key = state.oprf_key.clone().ok_or_else(|| {
            PsiError::StateViolation("stripped database cannot look up labels".into())
        })?;

        let (hashed, label_key) = oprf::hash_item(item, &key);
        if !state.items.contains(&hashed) {
            return Err(PsiError::InvalidInput("item is not in the database".into()));
        }

        let keys = algebraize_item(&hashed, &self.params);
        for (bundle_idx, bin_idx) in self.locations_of(&hashed) {
            for bundle in &state.bundles[bundle_idx] {
                if let Some(rows) = bundle.try_get_multi_label(&keys, bin_idx) {
                    // rows is per-bin; transpose to per-part felts.
                    let parts: Vec<Vec<Felt>> = (0..bundle.label_size())
                        .map(|p| rows.iter().map(|row| row[p]).collect())
                        .collect();
                    let mut encrypted = dealgebraize_label(&parts, &self.params);
                    encrypted.truncate(self.nonce_byte_count + self.label_byte_count);
                    return decrypt_label(&encrypted, &label_key, self.nonce_byte_count);
                }
            }
        }
        Err(PsiError::StateViolation(
            "item is in the set but its label is absent from every bin bundle".into(),
        ))
    }

    /// Regenerate caches one last time, then discard the item set and OPRF
    /// key. The database keeps answering queries but refuses mutation.
    pub fn strip(&self) -> Result<()> {
        let mut state = self.state.write();
        if state.stripped {
            return Ok(());
        }
        for bundle_set in &mut state.bundles {
            for b in bundle_set.iter_mut() {
                b.regen_cache()?;
            }
        }
        state.items.clear();
        state.oprf_key = None;
        state.stripped = true;
        info!("stripped sender database");
        Ok(())
    }

    // ----------------------------- Internals -------------------------------

    fn writable_key(state: &DbState) -> Result<OprfKey> {
        if state.stripped {
            return Err(PsiError::StateViolation("database is stripped".into()));
        }
        state
            .oprf_key
            .clone()
            .ok_or_else(|| PsiError::StateViolation("database has no OPRF key".into()))
    }

    /// `(bundle_idx, bin_idx)` of every cuckoo location of an item.
    fn locations_of(&self, item: &HashedItem) -> Vec<(usize, usize)> {
        let table = self.params.table_params();
        let fpi = self.params.item_params().felts_per_item as usize;
        let bins_per_bundle = self.params.bins_per_bundle();
        all_locations(item, table.hash_func_count, table.table_size)
            .into_iter()
            .map(|loc| {
                let cuckoo_idx = loc * fpi;
                (cuckoo_idx / bins_per_bundle, cuckoo_idx % bins_per_bundle)
            })
            .collect()
    }

    /// Algebraize one item (and its encrypted label) into per-bin entries.
    fn alg_entries(&self, item: &HashedItem, encrypted_label: Option<&[u8]>) -> Vec<BinEntry> {
        let felts = algebraize_item(item, &self.params);
        match encrypted_label {
            None => felts.into_iter().map(|f| (f, Vec::new())).collect(),
            Some(bytes) => {
                let parts = algebraize_label(bytes, &self.params);
                felts
                    .iter()
                    .enumerate()
                    .map(|(j, &f)| (f, parts.iter().map(|part| part[j]).collect()))
                    .collect()
            }
        }
    }

    /// Route entries to their bundle indices and run one parallel pass.
    fn dispatch_insert(
        &self,
        state: &mut DbState,
        work: &[(HashedItem, Vec<BinEntry>)],
        overwrite: bool,
    ) -> Result<()> {
        if work.is_empty() {
            return Ok(());
        }

        let mut groups: Vec<Vec<InsertWork>> =
            (0..self.params.bundle_idx_count()).map(|_| Vec::new()).collect();
        for (h, entries) in work {
            for (bundle_idx, bin_idx) in self.locations_of(h) {
                groups[bundle_idx].push(InsertWork {
                    bin_idx,
                    entries: entries.clone(),
                    overwrite,
                });
            }
        }

        let ctx = &self.ctx;
        let bins_per_bundle = self.params.bins_per_bundle();
        let label_size = self.label_size();
        let max_bin_size = self.params.table_params().max_items_per_bin as usize;

        thread_pool::pool().install(|| {
            state
                .bundles
                .par_iter_mut()
                .zip(groups.par_iter())
                .map(|(bundle_set, work)| -> Result<()> {
                    if work.is_empty() {
                        return Ok(());
                    }
                    for w in work {
                        if w.overwrite {
                            let written = bundle_set
                                .iter_mut()
                                .any(|b| b.try_multi_overwrite(&w.entries, w.bin_idx));
                            if !written {
                                return Err(PsiError::StateViolation(
                                    "tried to overwrite an item that is not stored".into(),
                                ));
                            }
                        } else {
                            let written = bundle_set
                                .iter_mut()
                                .any(|b| b.try_multi_insert(&w.entries, w.bin_idx, false).is_some());
                            if !written {
                                let mut fresh = BinBundle::new(
                                    ctx.clone(),
                                    bins_per_bundle,
                                    label_size,
                                    max_bin_size,
                                );
                                if fresh.try_multi_insert(&w.entries, w.bin_idx, false).is_none() {
                                    return Err(PsiError::InvalidInput(
                                        "entry does not fit an empty bin bundle".into(),
                                    ));
                                }
                                bundle_set.push(fresh);
                            }
                        }
                    }
                    for b in bundle_set.iter_mut() {
                        b.regen_cache()?;
                    }
                    Ok(())
                })
                .collect::<Result<()>>()
        })
    }

    // ----------------------------- Persistence -----------------------------

    /// Write the database as a single stream: header, parameters, OPRF key
    /// and item set (unless stripped), then the bundles.
    pub fn save<W: Write>(&self, writer: &mut W) -> Result<()> {
        let state = self.state.read();

        let header = SavedHeader {
            magic: SENDER_DB_MAGIC,
            version: SENDER_DB_VERSION,
            labeled: self.is_labeled(),
            stripped: state.stripped,
            compressed: self.compressed,
            label_byte_count: self.label_byte_count as u32,
            nonce_byte_count: self.nonce_byte_count as u32,
        };
        bincode::serialize_into(&mut *writer, &header)?;
        bincode::serialize_into(&mut *writer, &self.params.to_bytes())?;

        if !state.stripped {
            let key = state
                .oprf_key
                .as_ref()
                .ok_or_else(|| PsiError::StateViolation("unstripped database lost its key".into()))?;
            bincode::serialize_into(&mut *writer, &key.to_bytes().to_vec())?;

            let mut items: Vec<[u8; 16]> = state.items.iter().map(|h| *h.value()).collect();
            items.sort_unstable();
            bincode::serialize_into(&mut *writer, &items)?;
        }

        let saved_bundles: Vec<Vec<SavedBinBundle>> = state
            .bundles
            .iter()
            .map(|set| set.iter().map(BinBundle::to_saved).collect())
            .collect();
        bincode::serialize_into(&mut *writer, &saved_bundles)?;
        Ok(())
    }

    /// Inverse of [`SenderDb::save`]. Caches marked valid at save time are
    /// regenerated, so a loaded database answers queries immediately.
    pub fn load<R: Read>(reader: &mut R) -> Result<Self> {
        let header: SavedHeader = bincode::deserialize_from(&mut *reader)?;
        if header.magic != SENDER_DB_MAGIC {
            return Err(PsiError::InvalidProtocol("not a sender database stream".into()));
        }
        if header.version != SENDER_DB_VERSION {
            return Err(PsiError::InvalidProtocol(format!(
                "unsupported sender database version {}",
                header.version
            )));
        }

        if header.labeled != (header.label_byte_count > 0) {
            return Err(PsiError::InvalidProtocol(
                "label flag contradicts the label byte count".into(),
            ));
        }

        let params_bytes: Vec<u8> = bincode::deserialize_from(&mut *reader)?;
        let params = PsiParams::from_bytes(&params_bytes)?;

        let (oprf_key, items) = if header.stripped {
            (None, HashSet::new())
        } else {
            let key_bytes: Vec<u8> = bincode::deserialize_from(&mut *reader)?;
            let key_bytes: [u8; OPRF_KEY_SIZE] = key_bytes
                .try_into()
                .map_err(|_| PsiError::InvalidProtocol("bad OPRF key length".into()))?;
            let key = OprfKey::from_bytes(&key_bytes)?;

            let raw_items: Vec<[u8; 16]> = bincode::deserialize_from(&mut *reader)?;
            (Some(key), raw_items.into_iter().map(HashedItem::new).collect())
        };

        let db = Self::new(
            params,
            header.label_byte_count as usize,
            header.nonce_byte_count as usize,
            header.compressed,
            oprf_key.clone(),
        )?;

        let saved_bundles: Vec<Vec<SavedBinBundle>> = bincode::deserialize_from(&mut *reader)?;
        if saved_bundles.len() != db.params.bundle_idx_count() {
            return Err(PsiError::InvalidProtocol(
                "bundle index count does not match the parameters".into(),
            ));
        }
        let label_size = db.label_size();
        let bins_per_bundle = db.params.bins_per_bundle();
        let max_bin_size = db.params.table_params().max_items_per_bin as usize;

        let bundles: Vec<Vec<BinBundle>> = saved_bundles
            .into_iter()
            .map(|set| {
                set.into_iter()
                    .map(|saved| {
                        BinBundle::from_saved(
                            saved,
                            db.ctx.clone(),
                            bins_per_bundle,
                            label_size,
                            max_bin_size,
                        )
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;

        {
            let mut state = db.state.write();
            state.bundles = bundles;
            state.items = items;
            state.oprf_key = oprf_key;
            state.stripped = header.stripped;
        }
        Ok(db)
    }
}

#[derive(Serialize, Deserialize)]
struct SavedHeader {
    magic: u32,
    version: u32,
    labeled: bool,
    stripped: bool,
    compressed: bool,
    label_byte_count: u32,
    nonce_byte_count: u32,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::testing::{tiny, two_bundles};

    fn item(tag: u64) -> Item {
        Item::from_bytes(&tag.to_le_bytes())
    }

    fn bundle_snapshot(db: &SenderDb) -> Vec<Vec<Vec<(u32, Felt, Vec<Felt>)>>> {
        let state = db.read_state();
        state
            .bundles
            .iter()
            .map(|set| set.iter().map(|b| b.entries()).collect())
            .collect()
    }

    #[test]
    fn unlabeled_insert_dedupes_and_counts() {
        let db = SenderDb::new(tiny(), 0, 0, false, None).unwrap();
        db.insert_or_assign(&[item(1), item(2), item(1)]).unwrap();
        db.insert_or_assign(&[item(2), item(3)]).unwrap();
        assert_eq!(db.item_count(), 3);
        assert!(db.bin_bundle_count() >= 1);
        assert!(db.packing_rate() > 0.0 && db.packing_rate() <= 1.0);
    }

    #[test]
    fn labeled_roundtrip_and_overwrite() {
        let db = SenderDb::new(tiny(), 5, 4, false, None).unwrap();
        db.insert_or_assign_labeled(&[
            (item(10), b"alpha".to_vec()),
            (item(11), b"beta".to_vec()),
        ])
        .unwrap();

        assert_eq!(db.get_label(&item(10)).unwrap(), b"alpha");
        // Short labels come back zero-padded to the database width.
        assert_eq!(db.get_label(&item(11)).unwrap(), b"beta\0");

        db.insert_or_assign_labeled(&[(item(10), b"gamma".to_vec())]).unwrap();
        assert_eq!(db.item_count(), 2, "overwrite must not create a new item");
        assert_eq!(db.get_label(&item(10)).unwrap(), b"gamma");
    }

    #[test]
    fn label_longer_than_item_spans_parts() {
        // 20-byte labels + 4-byte nonce = 192 bits = 2 parts at 128-bit items.
        let db = SenderDb::new(tiny(), 20, 4, false, None).unwrap();
        let label = b"a twenty byte label!".to_vec();
        assert_eq!(label.len(), 20);
        db.insert_or_assign_labeled(&[(item(77), label.clone())]).unwrap();
        assert_eq!(db.get_label(&item(77)).unwrap(), label);
    }

    #[test]
    fn mixed_mode_calls_are_rejected() {
        let unlabeled = SenderDb::new(tiny(), 0, 0, false, None).unwrap();
        assert!(matches!(
            unlabeled.insert_or_assign_labeled(&[(item(1), vec![1])]),
            Err(PsiError::InvalidInput(_))
        ));

        let labeled = SenderDb::new(tiny(), 4, 4, false, None).unwrap();
        assert!(matches!(
            labeled.insert_or_assign(&[item(1)]),
            Err(PsiError::InvalidInput(_))
        ));
    }

    #[test]
    fn insert_then_remove_restores_everything() {
        let db = SenderDb::new(two_bundles(), 0, 0, false, None).unwrap();
        let base: Vec<Item> = (0..50).map(item).collect();
        db.insert_or_assign(&base).unwrap();

        let items_before = db.hashed_items();
        let bundles_before = bundle_snapshot(&db);
        let count_before = db.bin_bundle_count();

        db.insert_or_assign(&[item(999)]).unwrap();
        db.remove(&[item(999)]).unwrap();

        assert_eq!(db.hashed_items(), items_before);
        assert_eq!(bundle_snapshot(&db), bundles_before);
        assert!(db.bin_bundle_count() <= count_before);
    }

    #[test]
    fn remove_of_absent_item_fails_atomically() {
        let db = SenderDb::new(tiny(), 0, 0, false, None).unwrap();
        db.insert_or_assign(&[item(1)]).unwrap();
        let before = bundle_snapshot(&db);

        assert!(matches!(
            db.remove(&[item(1), item(2)]),
            Err(PsiError::InvalidInput(_))
        ));
        assert_eq!(db.item_count(), 1);
        assert_eq!(bundle_snapshot(&db), before);
    }

    #[test]
    fn strip_blocks_mutation_and_key_access() {
        let db = SenderDb::new(tiny(), 5, 4, false, None).unwrap();
        db.insert_or_assign_labeled(&[(item(5), b"five!".to_vec())]).unwrap();
        db.strip().unwrap();

        assert!(db.is_stripped());
        assert_eq!(db.item_count(), 0);
        assert!(matches!(db.oprf_key(), Err(PsiError::StateViolation(_))));
        assert!(matches!(
            db.insert_or_assign_labeled(&[(item(6), b"nope".to_vec())]),
            Err(PsiError::StateViolation(_))
        ));
        assert!(matches!(db.remove(&[item(5)]), Err(PsiError::StateViolation(_))));
        assert!(matches!(db.get_label(&item(5)), Err(PsiError::StateViolation(_))));
        // The bundles survive for query answering.
        assert!(db.bin_bundle_count() >= 1);
    }

    #[test]
    fn save_load_roundtrips() {
        let db = SenderDb::new(two_bundles(), 5, 4, false, None).unwrap();
        db.insert_or_assign_labeled(
            &(0..40).map(|i| (item(i), format!("L{i:03}").into_bytes())).collect::<Vec<_>>(),
        )
        .unwrap();

        let mut blob = Vec::new();
        db.save(&mut blob).unwrap();
        let loaded = SenderDb::load(&mut blob.as_slice()).unwrap();

        assert_eq!(loaded.params(), db.params());
        assert_eq!(loaded.hashed_items(), db.hashed_items());
        assert_eq!(bundle_snapshot(&loaded), bundle_snapshot(&db));
        assert_eq!(loaded.label_byte_count(), 5);
        assert_eq!(loaded.nonce_byte_count(), 4);
        assert_eq!(
            loaded.oprf_key().unwrap().to_bytes(),
            db.oprf_key().unwrap().to_bytes()
        );
        // Labels are still reachable through the loaded database.
        assert_eq!(loaded.get_label(&item(7)).unwrap(), b"L007\0");
    }

    #[test]
    fn stripped_save_load_roundtrips() {
        let db = SenderDb::new(tiny(), 0, 0, false, None).unwrap();
        db.insert_or_assign(&(0..10).map(item).collect::<Vec<_>>()).unwrap();
        db.strip().unwrap();

        let mut blob = Vec::new();
        db.save(&mut blob).unwrap();
        let loaded = SenderDb::load(&mut blob.as_slice()).unwrap();

        assert!(loaded.is_stripped());
        assert_eq!(loaded.item_count(), 0);
        assert_eq!(bundle_snapshot(&loaded), bundle_snapshot(&db));
    }

    #[test]
    fn garbage_streams_are_rejected() {
        assert!(SenderDb::load(&mut &b"not a database"[..]).is_err());
    }
}

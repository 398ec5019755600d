//! Cuckoo hashing shared by both parties
//!
//! The receiver places its hashed items into a table of `table_size` slots
//! using `hash_func_count` location functions; the sender inserts every item
//! at *all* of its candidate locations, so any placement the receiver ends up
//! with lines up with a sender bin. Both sides therefore derive the location
//! functions from the same fixed all-zero seed — the functions are part of
//! the shared parameters in everything but name.
//!
//! Insertion uses a bounded random-walk eviction. The walk is driven by a
//! deterministic generator so a given input set always produces the same
//! table. Outcomes distinguish a *repeated* insert (the item is already
//! placed; callers log and skip) from genuine *exhaustion* (the attempt
//! budget ran out; callers abort the query).

#![allow(missing_docs)]

use crate::encoding::HashedItem;
use crate::ITEM_BYTE_COUNT;

/// Domain-separation context for the location functions.
const LOC_FUNC_CONTEXT: &str = "tinypsi cuckoo loc v1";

/// The fixed table seed. Both parties must use the same one, and the
/// parameter-sharing story is simplest with a constant.
const TABLE_SEED: [u8; 16] = [0u8; 16];

/// Default bound on eviction steps per insertion.
pub const TABLE_INSERT_ATTEMPTS: usize = 500;

/// Compute the location of `item` under location function `func_idx`.
pub fn location(item: &HashedItem, func_idx: u32, table_size: u32) -> usize {
    let mut hasher = blake3::Hasher::new_derive_key(LOC_FUNC_CONTEXT);
    hasher.update(&TABLE_SEED);
    hasher.update(&func_idx.to_le_bytes());
    hasher.update(item.value());
    let digest = hasher.finalize();
    let word = u64::from_le_bytes(digest.as_bytes()[..8].try_into().expect("8 bytes"));
    (word % u64::from(table_size)) as usize
}

/// All candidate locations of an item, deduplicated, in function order.
pub fn all_locations(
    item: &HashedItem,
    hash_func_count: u32,
    table_size: u32,
) -> Vec<usize> {
    let mut locs = Vec::with_capacity(hash_func_count as usize);
    for f in 0..hash_func_count {
        let loc = location(item, f, table_size);
        if !locs.contains(&loc) {
            locs.push(loc);
        }
    }
    locs
}

/// Outcome of a single insertion.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    /// The item is now in the table.
    Placed,
    /// The item was already in the table; nothing changed.
    Repeated,
    /// The eviction budget ran out; the table is unchanged except for a
    /// reshuffle of previously placed items.
    Exhausted,
}

/// A cuckoo table of 128-bit items.
pub struct CuckooTable {
    slots: Vec<Option<HashedItem>>,
    table_size: u32,
    hash_func_count: u32,
    max_attempts: usize,
    filled: usize,
    // Deterministic random-walk state (xorshift).
    walk: u64,
}

impl CuckooTable {
    /// Create an empty table.
    pub fn new(table_size: u32, hash_func_count: u32, max_attempts: usize) -> Self {
        Self {
            slots: vec![None; table_size as usize],
            table_size,
            hash_func_count,
            max_attempts,
            filled: 0,
            walk: 0x9e37_79b9_7f4a_7c15,
        }
    }

    #[inline]
    fn next_walk(&mut self) -> u64 {
        let mut x = self.walk;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.walk = x;
        x
    }

    /// Insert one item, evicting along a bounded random walk if necessary.
    pub fn insert(&mut self, item: HashedItem) -> InsertOutcome {
        if self.query(&item).is_some() {
            return InsertOutcome::Repeated;
        }

        let mut current = item;
        for _ in 0..self.max_attempts {
            // Take any free candidate slot first.
            for f in 0..self.hash_func_count {
                let loc = location(&current, f, self.table_size);
                if self.slots[loc].is_none() {
                    self.slots[loc] = Some(current);
                    self.filled += 1;
                    return InsertOutcome::Placed;
                }
            }

            // All candidates occupied: evict one and keep walking.
            let f = (self.next_walk() % u64::from(self.hash_func_count)) as u32;
            let loc = location(&current, f, self.table_size);
            let evicted = self.slots[loc].replace(current).expect("slot was occupied");
            current = evicted;
        }

        InsertOutcome::Exhausted
    }

    /// Location of an item, if placed.
    pub fn query(&self, item: &HashedItem) -> Option<usize> {
        (0..self.hash_func_count)
            .map(|f| location(item, f, self.table_size))
            .find(|&loc| self.slots[loc].as_ref() == Some(item))
    }

    /// Raw bytes of a slot; empty slots read as all zeros, which algebraize
    /// to all-zero felts.
    pub fn slot_bytes(&self, idx: usize) -> [u8; ITEM_BYTE_COUNT] {
        match &self.slots[idx] {
            Some(item) => *item.value(),
            None => [0u8; ITEM_BYTE_COUNT],
        }
    }

    #[inline]
    pub fn table_size(&self) -> u32 {
        self.table_size
    }

    /// Fraction of occupied slots.
    pub fn fill_rate(&self) -> f64 {
        self.filled as f64 / f64::from(self.table_size)
    }
}

// ============================================================================
// Tests
// ============================================================================

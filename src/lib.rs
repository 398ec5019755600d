//! Crate root: public surface, core aliases, and protocol-wide invariants
//!
//! This module is the **single canonical entry-point** for downstream users of
//! the library. It centralizes the field-element alias, the shared error
//! taxonomy, and re-exports the submodules that implement the two-party
//! asymmetric PSI protocol: a receiver learns, for each of its query items,
//! whether the item belongs to the sender's (much larger) set — optionally
//! retrieving an associated label — while neither party learns anything else.
//!
//! ## Invariants (protocol-wide)
//!
//! - **Field.** All algebra happens in `Z_t` where `t` is the BFV plaintext
//!   modulus: a prime with `t ≡ 1 (mod 2·poly_modulus_degree)` so that SIMD
//!   batching is available. A [`Felt`] is always reduced, i.e. `< t`.
//!
//! - **Items.** Every item is a 128-bit opaque value ([`Item`]), and every
//!   item stored by the sender or queried by the receiver has passed through
//!   the OPRF ([`HashedItem`]). Raw inputs never reach the algebraic layer.
//!
//! - **Shared parameters.** Sender and receiver must hold byte-identical
//!   [`PsiParams`]; both derive the same cuckoo location functions, the same
//!   [`PowersDag`] and the same plaintext encodings from them. Parameter
//!   validation happens once, in [`PsiParams::new`], and everything downstream
//!   may assume those invariants hold.
//!
//! - **Failure mode.** Violations surface as a precise [`PsiError`] (never a
//!   panic on a fallible path); worker threads translate failures into a
//!   single error response and the serving loop keeps running.
//!
//! We **forbid unsafe** throughout the crate.

#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms)]

/// PSI parameter groups, validation, and (de)serialization.
pub mod params;
/// Shared BFV handles and thin helpers over the FHE backend.
pub mod context;
/// Felt arithmetic mod `t`, polynomial construction and interpolation.
pub mod algebra;
/// Item/label encoding: 128-bit items, bit-chunked algebraization.
pub mod encoding;
/// Elliptic-curve OPRF: key, blind evaluation, item hashing.
pub mod oprf;
/// Label encryption keyed per item.
pub mod labels;
/// Cuckoo hash table shared by receiver placement and sender dispatch.
pub mod cuckoo;
/// PowersDag: how source ciphertext powers combine into all target powers.
pub mod powers;
/// BinBundle: one row of the sender's algebraic database, plus its cache.
pub mod bundle;
/// SenderDb: bundles indexed by bundle index; insert/overwrite/remove/strip.
pub mod sender_db;
/// Sender-side query validation and execution.
pub mod sender;
/// Receiver-side query construction and result processing.
pub mod receiver;
/// Wire messages: versioned request/response/result-part encodings.
pub mod messages;
/// Channel abstraction and a stream-backed implementation.
pub mod channel;
/// Process-wide, reference-counted worker pool.
pub mod thread_pool;
/// Request serving loop for the sender.
pub mod dispatcher;

// ============================================================================
// Canonical aliases and root-level re-exports (centralization)
// ============================================================================

/// An element of the plaintext finite field `Z_t` (always reduced mod `t`).
pub type Felt = u64;

/// Byte length of an [`Item`] and of a [`HashedItem`] (128 bits).
pub const ITEM_BYTE_COUNT: usize = 16;

/// Byte length of a compressed OPRF query point (one per item).
pub const OPRF_QUERY_SIZE: usize = 32;

/// Byte length of a compressed OPRF response point (one per item).
pub const OPRF_RESPONSE_SIZE: usize = 32;

/// Byte length of a per-item label encryption key.
pub const LABEL_KEY_BYTE_COUNT: usize = 16;

/// Largest admissible nonce length for label encryption.
pub const MAX_NONCE_BYTE_COUNT: usize = 16;

pub use crate::channel::{Channel, StreamChannel};
pub use crate::context::CryptoContext;
pub use crate::encoding::{HashedItem, Item};
pub use crate::labels::{decrypt_label, encrypt_label, LabelKey};
pub use crate::oprf::{OprfKey, OprfReceiver};
pub use crate::params::{EncParams, ItemParams, PsiParams, QueryParams, TableParams};
pub use crate::powers::PowersDag;
pub use crate::receiver::{IndexTranslationTable, MatchRecord, Receiver};
pub use crate::sender::Query;
pub use crate::sender_db::SenderDb;
pub use crate::thread_pool::ThreadPoolMgr;

// ============================================================================
// Shared error taxonomy
// ============================================================================

/// Error categories shared across the crate.
///
/// The variants deliberately mirror the protocol's failure taxonomy rather
/// than the module structure: callers match on *what went wrong*, not on
/// *where it happened*. Worker threads convert any of these into a single
/// error response.
#[derive(Debug, thiserror::Error)]
pub enum PsiError {
    /// PSI parameters violate an invariant, or a serialized parameter set
    /// failed to parse.
    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    /// Caller-supplied data violates a precondition (wrong size, duplicate
    /// key, unknown item, ...).
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A received ciphertext or key is not valid for the active BFV context.
    #[error("invalid ciphertext: {0}")]
    InvalidCiphertext(String),

    /// Point decoding failed, a serialization version did not match, or a
    /// message of an unexpected type arrived.
    #[error("protocol violation: {0}")]
    InvalidProtocol(String),

    /// The receiver-side cuckoo table could not place an item within the
    /// insertion-attempt budget.
    #[error("cuckoo hashing failed to place items[{item_idx}] (fill rate {fill_rate:.3})")]
    CuckooFull {
        /// Index of the input item that could not be placed.
        item_idx: usize,
        /// Table fill rate at the time of failure.
        fill_rate: f64,
    },

    /// Channel or stream I/O failure.
    #[error("i/o failure")]
    Io(#[from] std::io::Error),

    /// An operation that requires mutable or keyed state was attempted on a
    /// stripped database, or a stale cache was read.
    #[error("state violation: {0}")]
    StateViolation(String),

    /// Error bubbled up from the FHE backend.
    #[error("fhe backend: {0}")]
    Fhe(#[from] fhe::Error),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, PsiError>;

impl From<bincode::Error> for PsiError {
    fn from(e: bincode::Error) -> Self {
        PsiError::InvalidProtocol(format!("malformed message body: {e}"))
    }
}

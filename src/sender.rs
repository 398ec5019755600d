//! Sender-side query handling
//!
//! A [`Query`] is the transient, validated form of a received
//! `QueryRequest`: relinearization keys installed into a context clone,
//! every ciphertext checked against the active BFV parameters, the power set
//! checked against `query_powers`, and the [`PowersDag`] configured from the
//! same inputs the receiver used. Anything wrong refuses the query as a whole
//! before any evaluation starts.
//!
//! [`run_query`] answers a valid query: one worker per bundle index raises
//! the received ciphertexts to all target powers (one multiply-and-
//! relinearize per non-source DAG node, layer by layer), evaluates every
//! bundle's matching — and, when labeled, interpolation — polynomials, and
//! pushes finished [`ResultPart`]s into a bounded queue. The dispatcher
//! thread owns the channel and drains the queue, so parts hit the wire as
//! they are produced, in whatever order the workers finish. The database
//! read lock is held for the whole evaluation: queries see a consistent
//! snapshot.

use std::sync::mpsc;
use std::sync::Arc;

use fhe::bfv::Ciphertext;
use rayon::prelude::*;
use tracing::{debug, info};

use crate::bundle::{BatchedPlaintextPolyn, BinBundle, CiphertextPowers};
use crate::channel::Channel;
use crate::context::CryptoContext;
use crate::messages::{
    OprfRequest, OprfResponse, ParamsResponse, QueryRequest, QueryResponse, Response, ResultPart,
};
use crate::oprf;
use crate::powers::{target_powers, PowersDag};
use crate::sender_db::SenderDb;
use crate::{thread_pool, PsiError, Result};

/// Capacity of the result-part queue between workers and the dispatcher.
const RESULT_QUEUE_DEPTH: usize = 16;

// ============================================================================
// Query
// ============================================================================

/// A validated query, bound to a database snapshot for its lifetime.
pub struct Query {
    db: Arc<SenderDb>,
    ctx: CryptoContext,
    data: Vec<(u32, Vec<Ciphertext>)>,
    pd: PowersDag,
    max_power: u32,
    compr_mode: u8,
}

impl Query {
    /// Unpack and validate a `QueryRequest` against a database. Any
    /// malformed component refuses the whole query.
    pub fn new(request: QueryRequest, db: Arc<SenderDb>) -> Result<Self> {
        let params = db.params();
        let query_powers = &params.query_params().query_powers;
        let bundle_idx_count = params.bundle_idx_count();

        let mut ctx = db.crypto_context().clone();
        ctx.set_relin_key_bytes(&request.relin_keys)?;

        if request.data.len() != query_powers.len() {
            return Err(PsiError::InvalidProtocol(format!(
                "query carries {} powers, parameters require {}",
                request.data.len(),
                query_powers.len()
            )));
        }

        let mut seen = std::collections::BTreeSet::new();
        let mut data = Vec::with_capacity(request.data.len());
        for (power, serialized) in request.data {
            if !query_powers.contains(&power) || !seen.insert(power) {
                return Err(PsiError::InvalidProtocol(format!(
                    "query power {power} does not match a source power"
                )));
            }
            if serialized.len() != bundle_idx_count {
                return Err(PsiError::InvalidProtocol(format!(
                    "power {power} carries {} ciphertexts, expected {bundle_idx_count}",
                    serialized.len()
                )));
            }
            let cts = serialized
                .iter()
                .map(|bytes| ctx.deserialize_ct(bytes))
                .collect::<Result<Vec<_>>>()?;
            data.push((power, cts));
        }

        let targets = target_powers(
            params.query_params().ps_low_degree,
            params.table_params().max_items_per_bin,
        );
        let mut pd = PowersDag::new();
        pd.configure(query_powers, &targets)?;
        let max_power = pd
            .topological_nodes()
            .iter()
            .map(|n| n.power)
            .max()
            .expect("configured DAG is nonempty");
        debug!(depth = pd.depth(), max_power, "configured powers DAG for query");

        Ok(Self { db, ctx, data, pd, max_power, compr_mode: request.compr_mode })
    }

    /// The negotiated ciphertext compression mode (carried through verbatim).
    #[inline]
    pub fn compr_mode(&self) -> u8 {
        self.compr_mode
    }
}

// ============================================================================
// Request runners
// ============================================================================

/// Answer a parameter request.
pub fn run_params<C: Channel>(db: &SenderDb, chl: &mut C) -> Result<()> {
    info!("serving parameter request");
    chl.send_response(&Response::Params(ParamsResponse { params: db.params().to_bytes() }))
}

/// Answer an OPRF request with the database's key.
pub fn run_oprf<C: Channel>(db: &SenderDb, request: &OprfRequest, chl: &mut C) -> Result<()> {
    info!(bytes = request.data.len(), "serving OPRF request");
    let key = db.oprf_key()?;
    let data = oprf::process_queries(&request.data, &key)?;
    chl.send_response(&Response::Oprf(OprfResponse { data }))
}

/// Answer a validated query: `QueryResponse` first, then one `ResultPart`
/// per bin bundle, streamed as workers finish.
pub fn run_query<C: Channel>(query: &Query, chl: &mut C) -> Result<()> {
    let db = query.db.as_ref();
    let state = db.read_state();

    let package_count: usize = state.bundles.iter().map(Vec::len).sum();
    info!(package_count, "serving query");
    chl.send_response(&Response::Query(QueryResponse { package_count: package_count as u32 }))?;

    let label_byte_count = db.label_byte_count() as u32;
    let nonce_byte_count = db.nonce_byte_count() as u32;
    let ps_low_degree = db.params().query_params().ps_low_degree as usize;

    let (tx, rx) = mpsc::sync_channel::<Result<ResultPart>>(RESULT_QUEUE_DEPTH);
    let pool = thread_pool::pool();
    let bundles = &state.bundles;

    std::thread::scope(|scope| {
        scope.spawn(move || {
            pool.install(|| {
                bundles.par_iter().enumerate().for_each_with(tx, |tx, (bundle_idx, set)| {
                    if !set.is_empty() {
                        process_bundle_index(
                            query,
                            bundle_idx as u32,
                            set,
                            ps_low_degree,
                            label_byte_count,
                            nonce_byte_count,
                            tx,
                        );
                    }
                });
            });
        });

        // This thread owns the channel: drain the queue, remember the first
        // failure of either kind, and keep draining so the workers finish.
        let mut eval_failure: Option<PsiError> = None;
        let mut send_failure: Option<PsiError> = None;
        for part in rx.iter() {
            match part {
                Ok(part) => {
                    if send_failure.is_none() {
                        if let Err(e) = chl.send_result_part(&part) {
                            send_failure = Some(e);
                        }
                    }
                }
                Err(e) => {
                    if eval_failure.is_none() {
                        eval_failure = Some(e);
                    }
                }
            }
        }
        match (eval_failure, send_failure) {
            (Some(e), _) | (None, Some(e)) => Err(e),
            (None, None) => Ok(()),
        }
    })
}

// ============================================================================
// Workers
// ============================================================================

fn process_bundle_index(
    query: &Query,
    bundle_idx: u32,
    bundle_set: &[BinBundle],
    ps_low_degree: usize,
    label_byte_count: u32,
    nonce_byte_count: u32,
    tx: &mpsc::SyncSender<Result<ResultPart>>,
) {
    let outcome = (|| -> Result<()> {
        let powers = compute_powers(query, bundle_idx as usize)?;
        for bundle in bundle_set {
            let cache = bundle.cache()?;
            let matching = cache
                .batched_matching
                .as_ref()
                .ok_or_else(|| PsiError::StateViolation("bundle cache has no polynomials".into()))?;

            let psi_ct = evaluate(matching, &powers, ps_low_degree, &query.ctx)?;
            let label_result = cache
                .batched_interp
                .iter()
                .map(|polyn| {
                    evaluate(polyn, &powers, ps_low_degree, &query.ctx)
                        .map(|ct| query.ctx.serialize_ct(&ct))
                })
                .collect::<Result<Vec<_>>>()?;

            let part = ResultPart {
                bundle_idx,
                label_byte_count,
                nonce_byte_count,
                psi_result: query.ctx.serialize_ct(&psi_ct),
                label_result,
            };
            if tx.send(Ok(part)).is_err() {
                // Dispatcher is gone; nothing useful left to do.
                return Ok(());
            }
        }
        Ok(())
    })();

    if let Err(e) = outcome {
        tracing::error!(bundle_idx, error = %e, "query worker failed");
        let _ = tx.send(Err(e));
    }
}

fn evaluate(
    polyn: &BatchedPlaintextPolyn,
    powers: &CiphertextPowers,
    ps_low_degree: usize,
    ctx: &CryptoContext,
) -> Result<Ciphertext> {
    if ps_low_degree > 0 {
        polyn.eval_patstock(powers, ps_low_degree, ctx)
    } else {
        polyn.eval(powers, ctx)
    }
}

/// Raise the received ciphertexts to every DAG power for one bundle index.
/// Nodes of equal depth are independent and run in parallel.
fn compute_powers(query: &Query, bundle_idx: usize) -> Result<CiphertextPowers> {
    let ctx = &query.ctx;
    let mut powers: CiphertextPowers = vec![None; query.max_power as usize + 1];
    for (power, cts) in &query.data {
        powers[*power as usize] = Some(cts[bundle_idx].clone());
    }

    let mut nodes = query.pd.topological_nodes();
    nodes.retain(|n| n.parents.is_some());
    for layer in nodes.chunk_by(|a, b| a.depth == b.depth) {
        let computed = layer
            .par_iter()
            .map(|node| -> Result<(u32, Ciphertext)> {
                let (a, b) = node.parents.expect("sources were filtered out");
                let pa = powers[a as usize]
                    .as_ref()
                    .ok_or_else(|| PsiError::InvalidInput(format!("missing parent power {a}")))?;
                let pb = powers[b as usize]
                    .as_ref()
                    .ok_or_else(|| PsiError::InvalidInput(format!("missing parent power {b}")))?;
                Ok((node.power, ctx.mul_relin(pa, pb)?))
            })
            .collect::<Result<Vec<_>>>()?;
        for (power, ct) in computed {
            powers[power as usize] = Some(ct);
        }
    }
    Ok(powers)
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

    fn db() -> Arc<SenderDb> {
        Arc::new(SenderDb::new(tiny(), 0, 0, false, None).unwrap())
    }

    fn valid_request(db: &SenderDb) -> QueryRequest {
        let mut rng = StdRng::seed_from_u64(31);
        let mut ctx = db.crypto_context().clone();
        ctx.generate_keys(&mut rng).unwrap();

        let n = db.params().bins_per_bundle();
        let pt = ctx.encode_simd(&vec![1u64; n]).unwrap();
        let data = db
            .params()
            .query_params()
            .query_powers
            .iter()
            .map(|&p| {
                let ct = ctx.encrypt_symmetric(&pt, &mut rng).unwrap();
                (p, vec![ctx.serialize_ct(&ct)])
            })
            .collect();
        QueryRequest { compr_mode: 0, relin_keys: ctx.relin_key_bytes().unwrap(), data }
    }

    #[test]
    fn well_formed_query_validates() {
        let db = db();
        let request = valid_request(&db);
        let query = Query::new(request, db).unwrap();
        assert_eq!(query.compr_mode(), 0);
        assert!(query.pd.is_configured());
    }

    #[test]
    fn missing_power_is_refused() {
        let db = db();
        let mut request = valid_request(&db);
        request.data.pop();
        assert!(matches!(Query::new(request, db), Err(PsiError::InvalidProtocol(_))));
    }

    #[test]
    fn unknown_power_is_refused() {
        let db = db();
        let mut request = valid_request(&db);
        request.data[0].0 = 3; // not a source power of the tiny parameters
        assert!(matches!(Query::new(request, db), Err(PsiError::InvalidProtocol(_))));
    }

    #[test]
    fn wrong_bundle_count_is_refused() {
        let db = db();
        let mut request = valid_request(&db);
        let extra = request.data[0].1[0].clone();
        request.data[0].1.push(extra);
        assert!(matches!(Query::new(request, db), Err(PsiError::InvalidProtocol(_))));
    }

    #[test]
    fn garbage_ciphertext_is_refused() {
        let db = db();
        let mut request = valid_request(&db);
        request.data[0].1[0] = vec![0xab; 32];
        assert!(matches!(Query::new(request, db), Err(PsiError::InvalidCiphertext(_))));
    }

    #[test]
    fn garbage_relin_keys_are_refused() {
        let db = db();
        let mut request = valid_request(&db);
        request.relin_keys = vec![1, 2, 3];
        assert!(matches!(Query::new(request, db), Err(PsiError::InvalidCiphertext(_))));
    }
}

//! Sender serving loop
//!
//! [`serve`] pumps requests off a channel until the peer hangs up or the
//! stop flag is raised (the flag is consulted between messages; a query in
//! flight is a unit of work). Per-request failures never kill the loop:
//!
//! - a failed parameter or OPRF request is answered with a single error
//!   response (an empty OPRF body) and logged;
//! - a query that fails validation is answered with
//!   `QueryResponse { package_count: 0 }`;
//! - a query that fails mid-evaluation is logged; the receiver sees fewer
//!   result parts than announced and treats the query as failed.
//!
//! Socket management (ZeroMQ or otherwise) lives outside the core; anything
//! that implements [`Channel`] can be served.

use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{error, info, warn};

use crate::channel::Channel;
use crate::messages::{OprfResponse, QueryResponse, Request, Response};
use crate::sender::{run_oprf, run_params, run_query, Query};
use crate::sender_db::SenderDb;
use crate::thread_pool::ThreadPoolMgr;
use crate::{PsiError, Result};

/// Serve requests until the stop flag is set or the peer disconnects.
pub fn serve<C: Channel>(db: Arc<SenderDb>, chl: &mut C, stop: &AtomicBool) -> Result<()> {
    let _pool = ThreadPoolMgr::new();
    info!("sender dispatcher running");

    while !stop.load(Ordering::Relaxed) {
        let request = match chl.receive_request() {
            Ok(request) => request,
            Err(PsiError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => {
                info!("peer disconnected; dispatcher exiting");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        match request {
            Request::Params => run_params(&db, chl)?,
            Request::Oprf(oprf_request) => {
                if let Err(e) = run_oprf(&db, &oprf_request, chl) {
                    warn!(error = %e, "OPRF request refused");
                    chl.send_response(&Response::Oprf(OprfResponse { data: Vec::new() }))?;
                }
            }
            Request::Query(query_request) => match Query::new(query_request, db.clone()) {
                Ok(query) => {
                    if let Err(e) = run_query(&query, chl) {
                        // The query response is already on the wire; the
                        // receiver notices the missing parts.
                        error!(error = %e, "query failed mid-evaluation");
                    }
                }
                Err(e) => {
                    warn!(error = %e, "query refused");
                    chl.send_response(&Response::Query(QueryResponse { package_count: 0 }))?;
                }
            },
        }
    }

    info!("sender dispatcher stopped");
    Ok(())
}

// ============================================================================
// End-to-end protocol tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::StreamChannel;
    use crate::encoding::Item;
    use crate::params::testing::{tiny, tiny_ps, two_bundles};
    use crate::receiver::{MatchRecord, Receiver};
    use crate::PsiParams;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::io::{BufReader, BufWriter};
    use std::os::unix::net::UnixStream;
    use std::thread;

    fn item(tag: &str) -> Item {
        Item::from_bytes(tag.as_bytes())
    }

    fn init_logging() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    /// Run the full three-round protocol against `db` and return the match
    /// records for `items`.
    fn protocol_run(db: Arc<SenderDb>, items: &[Item], seed: u64) -> Vec<MatchRecord> {
        init_logging();
        let (sender_sock, receiver_sock) = UnixStream::pair().unwrap();
        let stop = Arc::new(AtomicBool::new(false));

        let server = {
            let db = Arc::clone(&db);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut chl = StreamChannel::new(
                    BufReader::new(sender_sock.try_clone().unwrap()),
                    BufWriter::new(sender_sock),
                );
                serve(db, &mut chl, &stop)
            })
        };

        let mut chl = StreamChannel::new(
            BufReader::new(receiver_sock.try_clone().unwrap()),
            BufWriter::new(receiver_sock),
        );
        let mut rng = StdRng::seed_from_u64(seed);

        let params = Receiver::request_params(&mut chl).unwrap();
        assert_eq!(&params, db.params());
        let receiver = Receiver::new(params, &mut rng).unwrap();

        let (hashed, label_keys) = receiver.request_oprf(items, &mut chl, &mut rng).unwrap();
        let records = receiver.request_query(&hashed, &label_keys, &mut chl, &mut rng).unwrap();
        assert!(chl.bytes_sent() > 0 && chl.bytes_received() > 0);

        drop(chl);
        server.join().unwrap().unwrap();
        records
    }

    #[test]
    fn empty_sender_nonempty_receiver() {
        let db = Arc::new(SenderDb::new(tiny(), 0, 0, false, None).unwrap());
        let records = protocol_run(db, &[item("1"), item("2"), item("3")], 101);
        assert!(records.iter().all(|r| !r.found));
    }

    #[test]
    fn single_match_unlabeled() {
        let db = Arc::new(SenderDb::new(tiny(), 0, 0, false, None).unwrap());
        db.insert_or_assign(&[item("A"), item("B"), item("C")]).unwrap();

        let records = protocol_run(db, &[item("B"), item("D")], 102);
        assert!(records[0].found);
        assert!(records[0].label.is_none());
        assert!(!records[1].found);
    }

    #[test]
    fn labeled_single_match_recovers_label() {
        let db = Arc::new(SenderDb::new(tiny(), 5, 4, false, None).unwrap());
        db.insert_or_assign_labeled(&[
            (item("A"), b"alpha".to_vec()),
            (item("B"), b"beta".to_vec()),
        ])
        .unwrap();

        let records = protocol_run(db, &[item("A"), item("C")], 103);
        assert!(records[0].found);
        assert_eq!(records[0].label.as_deref(), Some(&b"alpha"[..]));
        assert!(!records[1].found);
        assert!(records[1].label.is_none());
    }

    #[test]
    fn overwrite_returns_new_label() {
        let db = Arc::new(SenderDb::new(tiny(), 3, 4, false, None).unwrap());
        db.insert_or_assign_labeled(&[(item("A"), b"old".to_vec())]).unwrap();
        db.insert_or_assign_labeled(&[(item("A"), b"new".to_vec())]).unwrap();
        assert_eq!(db.item_count(), 1);

        let records = protocol_run(db, &[item("A")], 104);
        assert!(records[0].found);
        assert_eq!(records[0].label.as_deref(), Some(&b"new"[..]));
    }

    #[test]
    fn removed_item_stops_matching() {
        let db = Arc::new(SenderDb::new(two_bundles(), 0, 0, false, None).unwrap());
        let items: Vec<Item> = (0..100).map(|i| item(&format!("item-{i}"))).collect();
        db.insert_or_assign(&items).unwrap();
        db.remove(&[items[37].clone()]).unwrap();

        let records = protocol_run(db, &items, 105);
        let found = records.iter().filter(|r| r.found).count();
        assert_eq!(found, 99);
        assert!(!records[37].found);
    }

    #[test]
    fn stripped_database_still_answers() {
        // Run the OPRF round while the key exists, then strip and run only
        // the query round: the caches must still answer, labels included.
        let db = Arc::new(SenderDb::new(tiny(), 5, 4, false, None).unwrap());
        db.insert_or_assign_labeled(&[(item("K"), b"kappa".to_vec())]).unwrap();

        let (sender_sock, receiver_sock) = UnixStream::pair().unwrap();
        let stop = Arc::new(AtomicBool::new(false));
        let mut rng = StdRng::seed_from_u64(106);

        let mut chl = StreamChannel::new(
            BufReader::new(receiver_sock.try_clone().unwrap()),
            BufWriter::new(receiver_sock),
        );
        let receiver = Receiver::new(db.params().clone(), &mut rng).unwrap();

        // OPRF round first, against the un-stripped database.
        let server = {
            let db = Arc::clone(&db);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut chl = StreamChannel::new(
                    BufReader::new(sender_sock.try_clone().unwrap()),
                    BufWriter::new(sender_sock),
                );
                serve(db, &mut chl, &stop)
            })
        };
        let (hashed, label_keys) = receiver
            .request_oprf(&[item("K"), item("X")], &mut chl, &mut rng)
            .unwrap();

        db.strip().unwrap();
        assert!(matches!(
            db.insert_or_assign_labeled(&[(item("L"), b"no".to_vec())]),
            Err(PsiError::StateViolation(_))
        ));
        let records = receiver.request_query(&hashed, &label_keys, &mut chl, &mut rng).unwrap();
        assert!(records[0].found);
        assert_eq!(records[0].label.as_deref(), Some(&b"kappa"[..]));
        assert!(!records[1].found);

        drop(chl);
        server.join().unwrap().unwrap();
    }

    #[test]
    fn paterson_stockmeyer_and_plain_evaluation_agree() {
        let sender_items: Vec<Item> = (0..60).map(|i| item(&format!("s{i}"))).collect();
        let query_items: Vec<Item> =
            (0..30).map(|i| item(&format!("{}{i}", if i % 3 == 0 { "s" } else { "q" }))).collect();

        let run = |params: PsiParams, seed: u64| {
            let db = Arc::new(SenderDb::new(params, 4, 4, false, None).unwrap());
            let pairs: Vec<(Item, Vec<u8>)> = sender_items
                .iter()
                .enumerate()
                .map(|(i, it)| (it.clone(), format!("{i:04}").into_bytes()))
                .collect();
            db.insert_or_assign_labeled(&pairs).unwrap();
            protocol_run(db, &query_items, seed)
        };

        let plain = run(tiny(), 107);
        let ps = run(tiny_ps(), 107);
        assert_eq!(plain, ps, "evaluation strategy must not change results");
        assert!(plain.iter().any(|r| r.found));
        assert!(plain.iter().any(|r| !r.found));
    }
}

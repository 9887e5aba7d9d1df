use std::sync::{Arc, Barrier};
use std::time::Duration;

use crate::contracts::Contract;
use crate::ledger::{Ledger, LedgerError, LocalLedger, TransientMap, TxContext};
use crate::storage::{MemoryBlobStore, MemoryState, WorldState};
use crate::tests::args;

/// Increments a counter; both racers read before either writes
struct Counter {
    barrier: Arc<Barrier>,
}

impl Counter {
    fn new(racers: usize) -> Arc<Self> {
        Arc::new(Self {
            barrier: Arc::new(Barrier::new(racers)),
        })
    }
}

impl Contract for Counter {
    fn name(&self) -> &'static str {
        "counter"
    }

    fn invoke(&self, ctx: &mut TxContext<'_>, tx: &str, args: &[String]) -> Result<Vec<u8>, LedgerError> {
        let key = args.first().map(String::as_str).unwrap_or("n");
        let current: u64 = ctx.get_json(key)?.unwrap_or(0);
        match tx {
            "Incr" => {
                self.barrier.wait();
                ctx.put_json(key, &(current + 1))?;
                ctx.set_event("Bumped", (current + 1).to_string().into_bytes());
                Ok((current + 1).to_string().into_bytes())
            }
            "Fail" => {
                ctx.put_json(key, &999u64)?;
                Err(LedgerError::BadArgument {
                    name: "tx".into(),
                    reason: "always fails".into(),
                })
            }
            "Read" => Ok(current.to_string().into_bytes()),
            other => Err(LedgerError::UnknownTransaction {
                contract: "counter".into(),
                tx: other.into(),
            }),
        }
    }
}

fn ledger(racers: usize) -> LocalLedger {
    LocalLedger::in_memory().with_contract(Counter::new(racers))
}

fn read(ledger: &LocalLedger) -> String {
    String::from_utf8(ledger.evaluate("me", "counter", "Read", &args(&["n"])).unwrap()).unwrap()
}

#[test]
fn commits_and_reads_back() {
    let ledger = ledger(1);
    for expected in 1..=3u64 {
        let out = ledger
            .submit("me", "counter", "Incr", &args(&["n"]), TransientMap::new())
            .unwrap();
        assert_eq!(out, expected.to_string().into_bytes());
    }
    assert_eq!(read(&ledger), "3");
    assert_eq!(ledger.height(), 3);
}

#[test]
fn evaluate_never_commits() {
    let ledger = ledger(1);
    ledger.evaluate("me", "counter", "Incr", &args(&["n"])).unwrap();
    assert_eq!(read(&ledger), "0");
    assert_eq!(ledger.height(), 0);
}

#[tokio::test]
async fn failed_execution_leaves_no_trace() {
    let ledger = ledger(1);
    let mut events = ledger.subscribe("counter");

    assert!(ledger
        .submit("me", "counter", "Fail", &args(&["n"]), TransientMap::new())
        .is_err());
    assert_eq!(read(&ledger), "0");
    assert_eq!(ledger.height(), 0);

    let nothing = tokio::time::timeout(Duration::from_millis(50), events.next()).await;
    assert!(nothing.is_err());
}

#[test]
fn unknown_contract_and_transaction() {
    let ledger = ledger(1);
    assert_eq!(
        ledger
            .submit("me", "nope", "Incr", &[], TransientMap::new())
            .unwrap_err(),
        LedgerError::UnknownContract("nope".into())
    );
    assert!(matches!(
        ledger.evaluate("me", "counter", "Explode", &[]),
        Err(LedgerError::UnknownTransaction { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn racing_writers_conflict_instead_of_losing_updates() {
    let ledger = Arc::new(ledger(2));
    let mut events = ledger.subscribe("counter");

    let results: Vec<_> = std::thread::scope(|s| {
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let ledger = ledger.clone();
                s.spawn(move || ledger.submit("me", "counter", "Incr", &args(&["n"]), TransientMap::new()))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let won = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(won, 1);
    let lost = results.iter().find_map(|r| r.as_ref().err()).unwrap();
    assert!(lost.is_transient());
    assert!(matches!(lost, LedgerError::Conflict { read: 0, current: 1, .. }));
    assert_eq!(read(&ledger), "1");

    let mut valid = 0;
    let mut invalid = 0;
    for _ in 0..2 {
        let event = tokio::time::timeout(Duration::from_secs(5), events.next())
            .await
            .unwrap()
            .unwrap();
        if event.valid {
            assert_eq!(event.name(), Some("Bumped"));
            valid += 1;
        } else {
            assert_eq!(event.name(), None);
            invalid += 1;
        }
    }
    assert_eq!((valid, invalid), (1, 1));
}

#[tokio::test]
async fn subscribers_only_see_their_contract() {
    let ledger = ledger(1);
    let mut queries = ledger.subscribe("query");
    let mut counters = ledger.subscribe("counter");

    ledger
        .submit("me", "counter", "Incr", &args(&["n"]), TransientMap::new())
        .unwrap();

    let event = counters.next().await.unwrap();
    assert_eq!(event.contract, "counter");
    assert_eq!(event.tx_name, "Incr");
    assert_eq!(event.payload, b"1");
    assert_eq!(event.block, 1);

    let nothing = tokio::time::timeout(Duration::from_millis(50), queries.next()).await;
    assert!(nothing.is_err());
}

#[test]
fn context_reads_its_own_writes() {
    let state = MemoryState::new();
    state
        .apply(4, &[("c/seen".to_string(), Some(b"old".to_vec()))])
        .unwrap();
    let blobs = MemoryBlobStore::new();
    let transient = TransientMap::from([("secret".to_string(), b"x".to_vec())]);
    let mut ctx = TxContext::new("c", "tx-0", "alice", 42, &state, &blobs, &transient);

    assert_eq!(ctx.get("seen").unwrap(), Some(b"old".to_vec()));
    ctx.put("fresh", b"new".to_vec());
    assert_eq!(ctx.get("fresh").unwrap(), Some(b"new".to_vec()));
    ctx.delete("seen");
    assert!(!ctx.exists("seen").unwrap());

    assert_eq!(ctx.transient("secret").unwrap(), b"x");
    assert_eq!(
        ctx.transient("other").unwrap_err(),
        LedgerError::MissingTransient("other".into())
    );
    assert_eq!((ctx.identity(), ctx.timestamp(), ctx.tx_id()), ("alice", 42, "tx-0"));

    let rw = ctx.into_rw_set();
    // buffered keys never reach the read set
    assert_eq!(rw.reads.len(), 1);
    assert_eq!(rw.reads.get("c/seen"), Some(&4));
    assert_eq!(
        rw.writes,
        vec![
            ("c/fresh".to_string(), Some(b"new".to_vec())),
            ("c/seen".to_string(), None),
        ]
    );
}

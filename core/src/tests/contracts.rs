use std::sync::Arc;
use std::time::Duration;

use num_bigint::BigUint;
use rand::seq::SliceRandom;
use tally_crypto::{CryptoError, LatticeKeyPair, LatticeParams, PublicKey};
use tally_protocol::{
    AggregateResult, AggregationState, AskerKeys, MaskingGenerator, MaskingParams, ProtocolError,
    QueryRecord, QueryState, condense,
};

use crate::contracts::{AGGREGATION, AggregationEntry, QUERY, events, transient as field, tx};
use crate::ledger::{CommitEvent, EventStream, Ledger, LedgerError, LocalLedger, TransientMap};
use crate::storage::{MemoryBlobStore, MemoryState};
use crate::submitter::{RetryPolicy, TransactionSubmitter};
use crate::tests::{args, asker_keys, transient};

fn asker_fields(keys: &AskerKeys) -> Vec<(&'static str, Vec<u8>)> {
    let (homomorphic, lattice) = keys.public().tagged();
    vec![
        (field::PAILLIER, serde_json::to_vec(&homomorphic).unwrap()),
        (field::POST_QUANTUM, serde_json::to_vec(&lattice).unwrap()),
    ]
}

fn register_fields(keys: &AskerKeys, operator: &LatticeKeyPair) -> TransientMap {
    let key = PublicKey::PostQuantumLattice(operator.public_key().clone());
    let mut fields = asker_fields(keys);
    fields.push((field::OPERATOR, serde_json::to_vec(&key).unwrap()));
    transient(&fields)
}

fn register(
    ledger: &LocalLedger,
    keys: &AskerKeys,
    identity: &str,
    operator: &LatticeKeyPair,
    id: &str,
) -> Result<usize, LedgerError> {
    let out = ledger.submit(
        identity,
        AGGREGATION,
        tx::START,
        &args(&[id, "3", "2"]),
        register_fields(keys, operator),
    )?;
    Ok(String::from_utf8(out).unwrap().parse().unwrap())
}

fn entry(ledger: &LocalLedger, id: &str) -> Result<AggregationEntry, LedgerError> {
    let bytes = ledger.evaluate("anyone", AGGREGATION, tx::RETRIEVE, &args(&[id]))?;
    Ok(serde_json::from_slice(&bytes).unwrap())
}

fn add(ledger: &LocalLedger, id: &str, secret: u64) -> Result<Vec<u8>, LedgerError> {
    let record = entry(ledger, id)?.load(ledger.blobs().as_ref())?;
    let operators = record.operator_keys();
    let generator = MaskingGenerator::new(
        &record.asker().homomorphic,
        &operators,
        MaskingParams::default(),
    )
    .unwrap();
    let contribution = generator.generate(&BigUint::from(secret)).unwrap();
    ledger.submit(
        "participant",
        AGGREGATION,
        tx::ADD,
        &args(&[id]),
        transient(&[(field::CONTRIBUTION, serde_json::to_vec(&contribution).unwrap())]),
    )
}

async fn next_named(stream: &mut EventStream) -> CommitEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap();
        if event.name().is_some() {
            return event;
        }
    }
}

fn operators(n: usize) -> Vec<LatticeKeyPair> {
    (0..n)
        .map(|_| LatticeKeyPair::generate(LatticeParams::MlKem768))
        .collect()
}

#[tokio::test]
async fn aggregation_lifecycle() {
    let ledger = LocalLedger::in_memory();
    let mut stream = ledger.subscribe(AGGREGATION);
    let keys = asker_keys();
    let ops = operators(4);

    for (i, op) in ops.iter().take(3).enumerate() {
        assert_eq!(register(&ledger, &keys, &format!("op{i}"), op, "agg").unwrap(), i);
    }
    let started = next_named(&mut stream).await;
    assert_eq!(started.name(), Some(events::START_AGGREGATING));
    let started: AggregationEntry = serde_json::from_slice(&started.payload).unwrap();
    assert_eq!(started.state, AggregationState::Aggregating);

    let full = register(&ledger, &keys, "op3", &ops[3], "agg").unwrap_err();
    assert_eq!(
        full.protocol(),
        Some(&ProtocolError::CommitteeFull { committee_size: 3 })
    );

    assert_eq!(add(&ledger, "agg", 10).unwrap(), b"1");
    assert_eq!(add(&ledger, "agg", 20).unwrap(), b"2");
    let closed = next_named(&mut stream).await;
    assert_eq!(closed.name(), Some(events::AGGREGATION_CLOSED));

    // exactly once: the counter never moves past expected
    let late = add(&ledger, "agg", 30).unwrap_err();
    assert!(late.protocol().unwrap().is_state_violation());

    let stored = entry(&ledger, "agg").unwrap();
    assert_eq!(stored.state, AggregationState::Closed);
    assert_eq!(stored.participants, 2);
    let record = stored.load(ledger.blobs().as_ref()).unwrap();
    assert_eq!(record.masks().len(), 2);
    assert_eq!(record.operator_index("op1"), Some(1));

    // asker recovers 30 from the stored record
    let shares: Vec<_> = ops
        .iter()
        .take(3)
        .enumerate()
        .map(|(i, kp)| condense(kp, i, record.masks(), &keys.public().lattice).unwrap())
        .collect();
    let sum = tally_protocol::unmask(&keys, record.blinded_sum().unwrap(), &shares).unwrap();
    assert_eq!(sum, BigUint::from(30u32));
}

#[tokio::test]
async fn aggregation_close_is_idempotent() {
    let ledger = LocalLedger::in_memory();
    let keys = asker_keys();
    let ops = operators(1);
    register(&ledger, &keys, "op0", &ops[0], "agg").unwrap();

    let mut stream = ledger.subscribe(AGGREGATION);
    let first = ledger
        .submit("op0", AGGREGATION, tx::CLOSE, &args(&["agg"]), TransientMap::new())
        .unwrap();
    let height = ledger.height();
    let second = ledger
        .submit("op0", AGGREGATION, tx::CLOSE, &args(&["agg"]), TransientMap::new())
        .unwrap();
    assert_eq!(first, second);
    assert_eq!(ledger.height(), height);

    // aborted during selection: one event, no further registrations
    assert_eq!(next_named(&mut stream).await.name(), Some(events::AGGREGATION_CLOSED));
    let nothing = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
    assert!(nothing.is_err());
    assert!(register(&ledger, &keys, "op1", &LatticeKeyPair::generate(LatticeParams::MlKem768), "agg")
        .unwrap_err()
        .protocol()
        .unwrap()
        .is_state_violation());
}

#[test]
fn aggregation_remove_and_exists() {
    let ledger = LocalLedger::in_memory();
    let keys = asker_keys();
    let ops = operators(1);

    let exists = |id: &str| ledger.evaluate("x", AGGREGATION, tx::EXISTS, &args(&[id])).unwrap();
    assert_eq!(exists("agg"), b"false");
    register(&ledger, &keys, "op0", &ops[0], "agg").unwrap();
    assert_eq!(exists("agg"), b"true");

    ledger
        .submit("op0", AGGREGATION, tx::REMOVE, &args(&["agg"]), TransientMap::new())
        .unwrap();
    assert_eq!(exists("agg"), b"false");
    assert_eq!(entry(&ledger, "agg").unwrap_err(), LedgerError::NotFound("agg".into()));
    assert_eq!(
        ledger
            .submit("op0", AGGREGATION, tx::REMOVE, &args(&["agg"]), TransientMap::new())
            .unwrap_err(),
        LedgerError::NotFound("agg".into())
    );
}

#[test]
fn aggregation_blobs_grow_by_one_row_per_add_and_are_released() {
    let blobs = Arc::new(MemoryBlobStore::new());
    let ledger = LocalLedger::new(Arc::new(MemoryState::new()), blobs.clone(), 16).unwrap();
    let keys = asker_keys();

    for (i, op) in operators(3).iter().enumerate() {
        register(&ledger, &keys, &format!("op{i}"), op, "agg").unwrap();
        // asker keys plus the current operator list; superseded lists are dropped
        assert_eq!(blobs.len(), 2);
    }

    add(&ledger, "agg", 10).unwrap();
    assert_eq!(blobs.len(), 3);
    add(&ledger, "agg", 20).unwrap();
    assert_eq!(blobs.len(), 4);

    let stored = entry(&ledger, "agg").unwrap();
    assert_eq!(stored.rows.len(), 2);
    assert_eq!(stored.blobs().len(), 4);
    assert_eq!(stored.load(blobs.as_ref()).unwrap().masks().len(), 2);

    ledger
        .submit("op0", AGGREGATION, tx::REMOVE, &args(&["agg"]), TransientMap::new())
        .unwrap();
    assert!(blobs.is_empty());
}

#[test]
fn scaled_blinded_sum_is_rejected_without_change() {
    let ledger = LocalLedger::in_memory();
    let keys = asker_keys();
    for (i, op) in operators(3).iter().enumerate() {
        register(&ledger, &keys, &format!("op{i}"), op, "agg").unwrap();
    }
    add(&ledger, "agg", 10).unwrap();
    let before = entry(&ledger, "agg").unwrap();
    let height = ledger.height();

    let record = before.load(ledger.blobs().as_ref()).unwrap();
    let operator_keys = record.operator_keys();
    let generator =
        MaskingGenerator::new(&record.asker().homomorphic, &operator_keys, MaskingParams::default())
            .unwrap();
    let honest = generator.generate(&BigUint::from(20u32)).unwrap();

    for exponent in [i32::MIN, -1, 1, i32::MAX] {
        let mut forged = serde_json::to_value(&honest).unwrap();
        forged["blinded_sum"]["exponent"] = exponent.into();
        let err = ledger
            .submit(
                "mallory",
                AGGREGATION,
                tx::ADD,
                &args(&["agg"]),
                transient(&[(field::CONTRIBUTION, serde_json::to_vec(&forged).unwrap())]),
            )
            .unwrap_err();
        assert!(matches!(
            err.protocol(),
            Some(ProtocolError::Crypto(CryptoError::InvalidExponent { .. }))
        ));
    }
    assert_eq!(ledger.height(), height);
    assert_eq!(entry(&ledger, "agg").unwrap(), before);

    // the honest contribution still lands and closes the aggregation
    assert_eq!(add(&ledger, "agg", 20).unwrap(), b"2");
}

#[test]
fn aggregation_start_needs_transient_keys() {
    let ledger = LocalLedger::in_memory();
    let err = ledger
        .submit("op0", AGGREGATION, tx::START, &args(&["agg", "3", "2"]), TransientMap::new())
        .unwrap_err();
    assert_eq!(err, LedgerError::MissingTransient(field::OPERATOR.into()));

    let keys = asker_keys();
    let op = LatticeKeyPair::generate(LatticeParams::MlKem768);
    let bad = ledger
        .submit(
            "op0",
            AGGREGATION,
            tx::START,
            &args(&["agg", "three", "2"]),
            register_fields(&keys, &op),
        )
        .unwrap_err();
    assert!(matches!(bad, LedgerError::BadArgument { .. }));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_registration_fills_every_slot_once() {
    let keys = Arc::new(asker_keys());
    let policy = RetryPolicy {
        max_retries: 10,
        backoff_base: Duration::from_millis(1),
        jitter_step: Duration::from_millis(1),
        jitter_steps: 5,
    };

    for round in 0..3 {
        let ledger = Arc::new(LocalLedger::in_memory());
        let id = format!("agg-{round}");
        let mut names: Vec<String> = (0..5).map(|i| format!("op{i}")).collect();
        names.shuffle(&mut rand::thread_rng());

        let mut tasks = Vec::new();
        for name in names {
            let submitter = TransactionSubmitter::new(ledger.clone(), name.clone(), policy);
            let keys = keys.clone();
            let id = id.clone();
            tasks.push(tokio::spawn(async move {
                let op = LatticeKeyPair::generate(LatticeParams::MlKem768);
                let fields = register_fields(&keys, &op);
                let out = submitter
                    .submit(AGGREGATION, tx::START, &args(&[id.as_str(), "5", "1"]), fields)
                    .await
                    .unwrap();
                (name, String::from_utf8(out).unwrap().parse::<usize>().unwrap())
            }));
        }

        let mut seats = Vec::new();
        for task in tasks {
            seats.push(task.await.unwrap());
        }
        let mut indices: Vec<usize> = seats.iter().map(|(_, i)| *i).collect();
        indices.sort();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);

        let record = entry(&ledger, &id).unwrap().load(ledger.blobs().as_ref()).unwrap();
        assert_eq!(record.state(), AggregationState::Aggregating);
        for (name, index) in seats {
            assert_eq!(record.operator_index(&name), Some(index));
        }
    }
}

fn start_query(ledger: &LocalLedger, keys: &AskerKeys, id: &str) -> Result<QueryRecord, LedgerError> {
    let out = ledger.submit(
        "asker",
        QUERY,
        tx::START,
        &args(&[id, "2", "1", "30", "false"]),
        transient(&asker_fields(keys)),
    )?;
    Ok(serde_json::from_slice(&out).unwrap())
}

fn unmask_fields(keys: &AskerKeys, index: usize, result: &AggregateResult) -> TransientMap {
    let contribution = tally_protocol::UnmaskContribution {
        index,
        ciphertext: keys
            .public()
            .lattice
            .encrypt_integer(&BigUint::from(index as u32))
            .unwrap(),
    };
    transient(&[
        (field::CONTRIBUTION, serde_json::to_vec(&contribution).unwrap()),
        (field::RESULT, serde_json::to_vec(result).unwrap()),
    ])
}

#[tokio::test]
async fn query_lifecycle() {
    let ledger = LocalLedger::in_memory();
    let mut stream = ledger.subscribe(QUERY);
    let keys = asker_keys();

    let record = start_query(&ledger, &keys, "asker-0").unwrap();
    assert_eq!(record.state(), QueryState::Waiting);
    assert_eq!(record.creator(), "asker");
    assert_eq!(next_named(&mut stream).await.name(), Some(events::START_QUERY));
    assert_eq!(
        start_query(&ledger, &keys, "asker-0").unwrap_err(),
        LedgerError::AlreadyExists("asker-0".into())
    );

    let retrieve = |who: &str| ledger.submit(who, QUERY, tx::RETRIEVE, &args(&["asker-0"]), TransientMap::new());
    assert_eq!(
        retrieve("asker").unwrap_err().protocol(),
        Some(&ProtocolError::NotReady("asker-0".into()))
    );

    let result = AggregateResult {
        blinded_sum: keys.homomorphic().public_key().encrypt(&BigUint::from(7u32)).unwrap(),
        participants: 1,
    };
    let post = |index: usize| {
        ledger.submit(
            &format!("op{index}"),
            QUERY,
            tx::ADD,
            &args(&["asker-0"]),
            unmask_fields(&keys, index, &result),
        )
    };
    assert_eq!(post(1).unwrap(), b"1");

    // duplicate index: rejected, nothing committed
    let height = ledger.height();
    let dup = post(1).unwrap_err();
    assert_eq!(dup.protocol(), Some(&ProtocolError::DuplicateContribution(1)));
    assert_eq!(ledger.height(), height);

    assert_eq!(post(0).unwrap(), b"2");
    let done = next_named(&mut stream).await;
    assert_eq!(done.name(), Some(events::DONE_QUERY));
    let done: QueryRecord = serde_json::from_slice(&done.payload).unwrap();
    assert_eq!(done.state(), QueryState::Done);
    assert_eq!(done.contribution_count(), 2);

    let closed: QueryRecord = serde_json::from_slice(&retrieve("anyone").unwrap()).unwrap();
    assert_eq!(closed.state(), QueryState::Closed);
    let again: QueryRecord = serde_json::from_slice(&retrieve("anyone").unwrap()).unwrap();
    assert_eq!(again, closed);
}

#[tokio::test]
async fn query_close_and_remove_are_creator_only() {
    let ledger = LocalLedger::in_memory();
    let mut stream = ledger.subscribe(QUERY);
    let keys = asker_keys();
    start_query(&ledger, &keys, "asker-0").unwrap();
    next_named(&mut stream).await;

    let submit = |who: &str, name: &str| {
        ledger.submit(who, QUERY, name, &args(&["asker-0"]), TransientMap::new())
    };
    assert!(matches!(
        submit("mallory", tx::CLOSE).unwrap_err().protocol(),
        Some(ProtocolError::Unauthorized { .. })
    ));
    assert!(matches!(
        submit("mallory", tx::REMOVE).unwrap_err().protocol(),
        Some(ProtocolError::Unauthorized { .. })
    ));

    let once = submit("asker", tx::CLOSE).unwrap();
    let height = ledger.height();
    let twice = submit("asker", tx::CLOSE).unwrap();
    assert_eq!(once, twice);
    assert_eq!(ledger.height(), height);
    let closed: QueryRecord = serde_json::from_slice(&twice).unwrap();
    assert_eq!(closed.state(), QueryState::Closed);

    submit("asker", tx::REMOVE).unwrap();
    let removed = next_named(&mut stream).await;
    assert_eq!(removed.name(), Some(events::REMOVE_QUERY));
    assert_eq!(
        ledger.evaluate("x", QUERY, tx::EXISTS, &args(&["asker-0"])).unwrap(),
        b"false"
    );
}

//! End-to-end ledger flows: sync and deferred emission, restart continuity,
//! and configuration loaded from disk.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use cra_ledger::trace::{canonical, event_types};
use cra_ledger::{
    compute_event_hash, genesis, FileStorage, InMemoryStorage, Ledger, LedgerConfig,
    OverflowPolicy, RawEvent, StorageBackend, TraceMode,
};
use serde_json::json;

fn temp_dir(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("cra-ledger-{}-{}", name, uuid::Uuid::new_v4()))
}

fn immediate() -> LedgerConfig {
    LedgerConfig::new(TraceMode::Immediate, OverflowPolicy::Reject, Vec::<String>::new())
}

/// sess-1 emits E1, E2, E3 on the sync path
#[test]
fn test_sync_path_chain_links() {
    let ledger = Ledger::new(Arc::new(InMemoryStorage::new()), immediate()).expect("ledger");

    let committed: Vec<_> = ["session.started", "action.executed", "session.ended"]
        .iter()
        .enumerate()
        .map(|(i, event_type)| {
            ledger
                .emit(RawEvent::new("sess-1", *event_type, json!({"step": i})))
                .expect("emit")
                .committed()
                .cloned()
                .expect("immediate mode commits inline")
        })
        .collect();
    let (e1, e2, e3) = (&committed[0], &committed[1], &committed[2]);

    let verification = ledger.verify("sess-1").expect("verify");
    assert!(verification.valid);
    assert_eq!(verification.event_count, 3);

    assert_eq!(e1.previous_event_hash, genesis("sess-1").unwrap());
    assert_eq!(e3.previous_event_hash, e2.event_hash);
    assert_eq!(
        e2.event_hash,
        compute_event_hash(&e2.content(), &e1.event_hash).unwrap()
    );

    // Hash input is the canonical content bytes followed by the previous hash
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(canonical::to_vec(&e2.content()).unwrap());
    hasher.update(e1.event_hash.as_bytes());
    assert_eq!(e2.event_hash, hex::encode(hasher.finalize()));
}

#[test]
fn test_many_sync_events_verify() {
    let storage = Arc::new(InMemoryStorage::new());
    let ledger = Ledger::new(storage.clone(), immediate()).expect("ledger");

    for i in 0..250 {
        let payload = json!({"i": i, "ratio": i as f64 / 7.0});
        ledger
            .emit(RawEvent::new("bulk", event_types::ACTION_EXECUTED, payload))
            .expect("emit");
    }

    assert_eq!(storage.event_count("bulk").unwrap(), 250);
    assert!(ledger.verify("bulk").unwrap().valid);
    assert!(ledger.verify_range("bulk", 100, 199).unwrap().valid);
}

#[test]
fn test_deferred_sessions_keep_emission_order() {
    let config = LedgerConfig::new(
        TraceMode::Deferred,
        OverflowPolicy::Block { timeout_ms: 2_000 },
        ["session.ended", "action.destructive.*"],
    )
    .with_queue_size(64);
    let ledger =
        Arc::new(Ledger::started(Arc::new(InMemoryStorage::new()), config).expect("ledger"));

    let producers: Vec<_> = (0..4)
        .map(|p| {
            let ledger = Arc::clone(&ledger);
            std::thread::spawn(move || {
                let session = format!("agent-{}", p);
                for n in 0..50 {
                    let event_type = if n == 25 {
                        "action.destructive.drop_table"
                    } else {
                        "action.executed"
                    };
                    ledger
                        .emit(RawEvent::new(session.as_str(), event_type, json!({"n": n})))
                        .expect("emit");
                }
                ledger
                    .emit(RawEvent::new(session.as_str(), "session.ended", json!({"n": 50})))
                    .expect("end");
                session
            })
        })
        .collect();

    for producer in producers {
        let session = producer.join().expect("producer thread");
        let events = ledger.read_ready(&session, Duration::from_secs(5)).expect("ready");
        let order: Vec<_> = events.iter().map(|e| e.payload["n"].as_u64().unwrap()).collect();
        assert_eq!(order, (0..=50).collect::<Vec<_>>());
        assert!(ledger.verify(&session).unwrap().valid);
    }

    let stats = ledger.stats();
    assert_eq!(stats.queue.rejected, 0);
    assert_eq!(stats.sync_commits, 8);
    ledger.shutdown().expect("shutdown");
}

#[test]
fn test_restart_continues_chain() {
    let dir = temp_dir("restart");

    let first_run_head = {
        let ledger = Ledger::new(Arc::new(FileStorage::new(&dir).unwrap()), immediate()).unwrap();
        for i in 0..3 {
            ledger
                .emit(RawEvent::new("long-lived", "action.executed", json!({"run": 1, "i": i})))
                .unwrap();
        }
        ledger.head("long-lived").unwrap()
    };
    assert_eq!(first_run_head.next_sequence, 3);

    let storage = Arc::new(FileStorage::new(&dir).unwrap());
    let ledger = Ledger::new(storage.clone(), immediate()).unwrap();
    let resumed = ledger
        .emit(RawEvent::new("long-lived", "action.executed", json!({"run": 2})))
        .unwrap();
    let resumed = resumed.committed().unwrap();

    assert_eq!(resumed.sequence_number, 3);
    assert_eq!(resumed.previous_event_hash, first_run_head.head_hash);
    assert_eq!(storage.event_count("long-lived").unwrap(), 4);
    assert!(ledger.verify("long-lived").unwrap().valid);

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_deferred_shutdown_flushes_to_file() {
    let dir = temp_dir("shutdown");
    let storage = Arc::new(FileStorage::new(&dir).unwrap());

    let config =
        LedgerConfig::new(TraceMode::Deferred, OverflowPolicy::Reject, Vec::<String>::new());
    let ledger = Ledger::started(storage.clone(), config).unwrap();
    for i in 0..10 {
        assert!(!ledger
            .emit(RawEvent::new("s", "action.executed", json!({"i": i})))
            .unwrap()
            .is_committed());
    }
    ledger.shutdown().unwrap();

    assert_eq!(storage.event_count("s").unwrap(), 10);
    assert!(ledger.verify("s").unwrap().valid);
    assert!(ledger.is_ready("s"));

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_dropped_ledger_keeps_queued_events() {
    let dir = temp_dir("drop");
    let deferred = || {
        LedgerConfig::new(TraceMode::Deferred, OverflowPolicy::Reject, Vec::<String>::new())
    };

    // Never started: the queue is drained on the dropping thread
    let ledger = Ledger::new(Arc::new(FileStorage::new(&dir).unwrap()), deferred()).unwrap();
    for i in 0..3 {
        assert!(!ledger
            .emit(RawEvent::new("s", "action.executed", json!({"i": i})))
            .unwrap()
            .is_committed());
    }
    drop(ledger);

    // Started: dropping joins the worker's final drain
    let ledger = Ledger::started(Arc::new(FileStorage::new(&dir).unwrap()), deferred()).unwrap();
    for i in 3..6 {
        ledger
            .emit(RawEvent::new("s", "action.executed", json!({"i": i})))
            .unwrap();
    }
    drop(ledger);

    let storage = FileStorage::new(&dir).unwrap();
    let events = storage.read_all("s").unwrap();
    let order: Vec<_> = events.iter().map(|e| e.payload["i"].as_u64().unwrap()).collect();
    assert_eq!(order, vec![0, 1, 2, 3, 4, 5]);

    let ledger = Ledger::new(Arc::new(storage), deferred()).unwrap();
    assert!(ledger.verify("s").unwrap().valid);

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn test_config_file_drives_routing() {
    let dir = temp_dir("config");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("ledger.toml");
    std::fs::write(
        &path,
        r#"
mode = "deferred"
sync_event_types = ["policy.violated"]

[overflow_policy]
policy = "sync_fallback"

[session_modes]
"audited-session" = "immediate"

[processor]
batch_size = 10
flush_interval_ms = 50
"#,
    )
    .unwrap();

    let config = LedgerConfig::load(&path).expect("config");
    assert_eq!(config.processor.batch_size, 10);

    let ledger = Ledger::new(Arc::new(InMemoryStorage::new()), config).unwrap();
    assert!(!ledger.emit(RawEvent::new("s", "action.executed", json!({}))).unwrap().is_committed());
    assert!(ledger.emit(RawEvent::new("s", "policy.violated", json!({}))).unwrap().is_committed());
    assert!(ledger
        .emit(RawEvent::new("audited-session", "action.executed", json!({})))
        .unwrap()
        .is_committed());

    let events = ledger.read_ready("s", Duration::from_secs(1)).unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].event_type, "action.executed");
    assert_eq!(events[1].event_type, "policy.violated");

    std::fs::remove_dir_all(&dir).ok();
}

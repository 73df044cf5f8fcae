// tests/repository_properties.rs
//! Storage invariants checked against both repository implementations

use agent_orchestrator::model::{
    EventKind, IdempotencyRecord, NewEvent, Run, RunId, RunMode, RunStatus, RunnerKind,
    Transition,
};
use agent_orchestrator::storage::{MemoryStore, Repositories, SqliteStore};
use agent_orchestrator::OrchestratorError;
use chrono::{Duration as ChronoDuration, Utc};
use proptest::prelude::*;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

fn block_on<F: std::future::Future>(future: F) -> F::Output {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(future)
}

fn stores() -> Vec<(&'static str, Repositories)> {
    vec![
        ("memory", Repositories::from_store(Arc::new(MemoryStore::new()))),
        (
            "sqlite",
            Repositories::from_store(Arc::new(SqliteStore::open_in_memory().unwrap())),
        ),
    ]
}

fn queued_run(id: &str) -> Run {
    Run::queued(
        RunId::new(id),
        "P1".into(),
        "T1".into(),
        RunnerKind::Stub,
        RunMode::Batch,
        Utc::now(),
    )
}

fn status() -> impl Strategy<Value = RunStatus> {
    prop::sample::select(RunStatus::ALL.to_vec())
}

fn kind() -> impl Strategy<Value = EventKind> {
    prop::sample::select(EventKind::ALL.to_vec())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    /// Only allowed edges apply, terminal states absorb, pid is gone at the end
    #[test]
    fn status_changes_follow_the_state_machine(
        steps in prop::collection::vec((status(), status()), 1..24)
    ) {
        for (name, repos) in stores() {
            let outcome: Result<(), TestCaseError> = block_on(async {
                let id = RunId::new("R1");
                repos.runs.create_run(queued_run("R1")).await.unwrap();
                repos.runs.set_pid(&id, Some(4242)).await.unwrap();

                let mut current = RunStatus::Queued;
                let mut at = Utc::now();
                for (expected, next) in &steps {
                    at += ChronoDuration::milliseconds(1);
                    let applied = repos
                        .runs
                        .compare_and_swap_status(&id, *expected, *next, &Transition::at(at).with_reason("step"))
                        .await
                        .unwrap();
                    let allowed = current == *expected && expected.can_transition_to(*next);
                    prop_assert_eq!(applied, allowed, "{}: {:?} -> {:?} from {:?}", name, expected, next, current);
                    if applied {
                        current = *next;
                    }

                    let stored = repos.runs.get_run(&id).await.unwrap().unwrap();
                    prop_assert_eq!(stored.status, current, "{}", name);
                    if current.is_terminal() {
                        prop_assert_eq!(stored.pid, None, "{}", name);
                        prop_assert!(stored.ended_at.is_some(), "{}", name);
                        prop_assert_eq!(stored.outcome_reason.as_deref(), Some("step"));
                        prop_assert!(!repos.runs.set_pid(&id, Some(1)).await.unwrap());
                    }
                }
                Ok(())
            });
            outcome?;
        }
    }

    /// Sequence numbers are gap-free and nothing follows a terminal event
    #[test]
    fn event_logs_are_gap_free_and_sealed(kinds in prop::collection::vec(kind(), 1..32)) {
        for (name, repos) in stores() {
            let outcome: Result<(), TestCaseError> = block_on(async {
                let id = RunId::new("R1");
                let mut sealed = false;
                let mut expected_seq = 0u64;
                for kind in &kinds {
                    let result = repos
                        .events
                        .append_event(&id, NewEvent {
                            kind: *kind,
                            payload: json!({ "kind": kind.as_str() }),
                            timestamp: Utc::now(),
                        })
                        .await;
                    if sealed {
                        prop_assert!(matches!(result, Err(OrchestratorError::EventLogSealed(_))), "{}", name);
                        continue;
                    }
                    let event = result.unwrap();
                    expected_seq += 1;
                    prop_assert_eq!(event.seq, expected_seq, "{}", name);
                    sealed = kind.is_terminal();
                }

                let stored = repos.events.read_events(&id, 0).await.unwrap();
                let seqs: Vec<u64> = stored.iter().map(|e| e.seq).collect();
                prop_assert_eq!(seqs, (1..=expected_seq).collect::<Vec<_>>(), "{}", name);
                prop_assert!(stored.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
                prop_assert!(stored.iter().filter(|e| e.kind.is_terminal()).count() <= 1);
                prop_assert_eq!(repos.events.last_seq(&id).await.unwrap(), expected_seq);

                let tail = repos.events.read_events(&id, expected_seq / 2).await.unwrap();
                prop_assert_eq!(tail.len() as u64, expected_seq - expected_seq / 2);
                Ok(())
            });
            outcome?;
        }
    }

    /// The first record for a key wins; later ones see it
    #[test]
    fn idempotency_keys_map_to_one_run(
        writes in prop::collection::vec(("[a-c]", "[a-z]{4}"), 1..20)
    ) {
        for (name, repos) in stores() {
            let outcome: Result<(), TestCaseError> = block_on(async {
                let mut first: HashMap<String, String> = HashMap::new();
                for (i, (key, fingerprint)) in writes.iter().enumerate() {
                    let record = IdempotencyRecord {
                        key: key.clone(),
                        fingerprint: fingerprint.clone(),
                        run_id: RunId::new(format!("R{}", i)),
                        created_at: Utc::now(),
                    };
                    let existing = repos.idempotency.put_if_absent(record).await.unwrap();
                    match first.get(key) {
                        Some(winner) => {
                            let existing = existing.unwrap();
                            prop_assert_eq!(existing.run_id.as_str(), winner.as_str(), "{}", name);
                        }
                        None => {
                            prop_assert!(existing.is_none(), "{}", name);
                            first.insert(key.clone(), format!("R{}", i));
                        }
                    }
                }
                for (key, winner) in &first {
                    let stored = repos.idempotency.get_idempotency(key).await.unwrap().unwrap();
                    prop_assert_eq!(stored.run_id.as_str(), winner.as_str(), "{}", name);
                }
                Ok(())
            });
            outcome?;
        }
    }
}

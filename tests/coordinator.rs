#![forbid(unsafe_code)]
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use shift_bot::{
    ChangeKind, Coordinator, CycleReport, CyclePhase, CycleStatus, DeliveryChannel,
    DeliveryError, DeliveryReceipt, MemoryStorage, Message, Participant, ParticipantId, Registry,
    RetryPolicy, Role, Settings, Shift, ShiftId, Snapshot, Storage, StorageError, TriggerOutcome,
    WritePrecondition,
};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

fn at(day: u32, h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 10, day, h, 0, 0).unwrap()
}

fn roster() -> Snapshot {
    let mut snap = Snapshot::default();
    for (id, day) in [("S1", 2), ("S2", 3)] {
        snap.shifts.push(
            Shift::new(id.into(), at(day, 9), at(day, 9) + Duration::hours(8), Role::new("lead"), 1)
                .unwrap()
                .with_id(ShiftId::new(id)),
        );
    }
    snap.shifts.push(
        Shift::new("renfort".into(), at(4, 9), at(4, 17), Role::new("lead"), 3)
            .unwrap()
            .with_id(ShiftId::new("S3")),
    );
    for id in ["alice", "bob"] {
        snap.participants.push(
            Participant::new(id, id.to_uppercase())
                .with_id(ParticipantId::new(id))
                .with_role(Role::new("lead")),
        );
    }
    snap
}

fn fast_settings() -> Settings {
    let fast = RetryPolicy {
        max_attempts: 2,
        base_delay_ms: 1,
        max_delay_ms: 2,
    };
    Settings {
        load_retry: fast,
        save_retry: fast,
        send_retry: fast,
        load_timeout_ms: 1_000,
        save_timeout_ms: 1_000,
        send_timeout_ms: 1_000,
        ..Settings::default()
    }
}

/// Enregistre les messages ; échoue sur les `fail_first` premiers envois.
#[derive(Default)]
struct Recorder {
    sent: Mutex<Vec<Message>>,
    calls: AtomicU32,
    fail_first: u32,
}

impl Recorder {
    fn failing(fail_first: u32) -> Self {
        Self {
            fail_first,
            ..Self::default()
        }
    }

    fn sent(&self) -> Vec<Message> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeliveryChannel for Recorder {
    async fn send(&self, message: &Message) -> Result<DeliveryReceipt, DeliveryError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.fail_first {
            return Err(DeliveryError::Transport(format!("flaky call {call}")));
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(DeliveryReceipt::new("recorder"))
    }
}

struct BrokenSave {
    inner: MemoryStorage,
    saves: AtomicU32,
}

#[async_trait]
impl Storage for BrokenSave {
    async fn load(&self) -> Result<Snapshot, StorageError> {
        self.inner.load().await
    }

    async fn save(&self, _snapshot: &Snapshot, _precondition: WritePrecondition) -> Result<(), StorageError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        Err(StorageError::Unavailable("disk full".into()))
    }
}

/// Annule le jeton au chargement ou juste après la sauvegarde.
struct CancelsDuring {
    inner: MemoryStorage,
    token: CancellationToken,
    on_save: bool,
}

#[async_trait]
impl Storage for CancelsDuring {
    async fn load(&self) -> Result<Snapshot, StorageError> {
        if !self.on_save {
            self.token.cancel();
        }
        self.inner.load().await
    }

    async fn save(&self, snapshot: &Snapshot, precondition: WritePrecondition) -> Result<(), StorageError> {
        self.inner.save(snapshot, precondition).await?;
        if self.on_save {
            self.token.cancel();
        }
        Ok(())
    }
}

/// Le premier chargement attend le feu vert.
struct Gated {
    inner: MemoryStorage,
    gate: Notify,
    held: AtomicBool,
}

#[async_trait]
impl Storage for Gated {
    async fn load(&self) -> Result<Snapshot, StorageError> {
        if !self.held.swap(true, Ordering::SeqCst) {
            self.gate.notified().await;
        }
        self.inner.load().await
    }

    async fn save(&self, snapshot: &Snapshot, precondition: WritePrecondition) -> Result<(), StorageError> {
        self.inner.save(snapshot, precondition).await
    }
}

/// Un opérateur enregistre `carol` juste après le premier chargement du cycle.
struct OperatorRace {
    inner: MemoryStorage,
    raced: AtomicBool,
}

#[async_trait]
impl Storage for OperatorRace {
    async fn load(&self) -> Result<Snapshot, StorageError> {
        let loaded = self.inner.load().await?;
        if !self.raced.swap(true, Ordering::SeqCst) {
            let mut registry = Registry::from_snapshot(loaded.clone()).unwrap();
            registry
                .add_participant(
                    Participant::new("carol", "CAROL")
                        .with_id(ParticipantId::new("carol"))
                        .with_role(Role::new("lead")),
                )
                .unwrap();
            self.inner
                .save(&registry.into_snapshot(), WritePrecondition::MatchesRevision(loaded.revision))
                .await?;
        }
        Ok(loaded)
    }

    async fn save(&self, snapshot: &Snapshot, precondition: WritePrecondition) -> Result<(), StorageError> {
        self.inner.save(snapshot, precondition).await
    }
}

/// Écrit pour de bon puis ne rend jamais la main : l'appelant voit un délai dépassé.
struct CommitsThenStalls {
    inner: MemoryStorage,
}

#[async_trait]
impl Storage for CommitsThenStalls {
    async fn load(&self) -> Result<Snapshot, StorageError> {
        self.inner.load().await
    }

    async fn save(&self, snapshot: &Snapshot, precondition: WritePrecondition) -> Result<(), StorageError> {
        self.inner.save(snapshot, precondition).await?;
        tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        Ok(())
    }
}

#[tokio::test]
async fn second_cycle_produces_no_events() {
    let storage = Arc::new(MemoryStorage::new(roster()));
    let channel = Arc::new(Recorder::default());
    let coordinator = Coordinator::new(storage.clone(), channel.clone(), &fast_settings());

    let first = coordinator.run_cycle(at(1, 0)).await;
    assert!(first.is_completed());
    assert_eq!(first.revision, 1);
    assert_eq!(first.proposed.len(), 4);
    assert_eq!(first.unfilled.len(), 1);
    assert_eq!(first.unfilled[0].shift, ShiftId::new("S3"));
    assert_eq!(first.unfilled[0].missing, 1);
    assert_eq!(first.delivered, first.events.len());
    assert_eq!(channel.sent().len(), first.events.len());

    let second = coordinator.run_cycle(at(1, 0)).await;
    assert!(second.is_completed());
    assert!(second.events.is_empty());
    assert_eq!(second.revision, 1);
    assert_eq!(second.unfilled.len(), 1);
    assert_eq!(channel.sent().len(), first.events.len());
    assert_eq!(storage.current().revision, 1);
    assert_eq!(coordinator.phase(), CyclePhase::Idle);
}

#[tokio::test]
async fn failing_save_aborts_before_notifying() {
    let before = roster();
    let storage = Arc::new(BrokenSave {
        inner: MemoryStorage::new(before.clone()),
        saves: AtomicU32::new(0),
    });
    let channel = Arc::new(Recorder::default());
    let coordinator = Coordinator::new(storage.clone(), channel.clone(), &fast_settings());

    let report = coordinator.run_cycle(at(1, 0)).await;
    match &report.status {
        CycleStatus::Failed { phase, error } => {
            assert_eq!(*phase, CyclePhase::Persisting);
            assert!(error.contains("disk full"), "{error}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(storage.saves.load(Ordering::SeqCst), 2);
    assert!(channel.sent().is_empty());
    assert!(report.events.is_empty());
    assert_eq!(storage.inner.current(), before);
    assert_eq!(coordinator.phase(), CyclePhase::Failed);
}

#[tokio::test]
async fn cancelled_before_start_touches_nothing() {
    let storage = Arc::new(MemoryStorage::new(roster()));
    let channel = Arc::new(Recorder::default());
    let coordinator = Coordinator::new(storage.clone(), channel.clone(), &fast_settings());
    coordinator.shutdown_token().cancel();

    let report = coordinator.run_cycle(at(1, 0)).await;
    assert_eq!(
        report.status,
        CycleStatus::Cancelled {
            before: CyclePhase::Loading
        }
    );
    assert_eq!(storage.current(), roster());
    assert!(channel.sent().is_empty());
}

#[tokio::test]
async fn cancellation_during_loading_stops_before_planning() {
    let token = CancellationToken::new();
    let storage = Arc::new(CancelsDuring {
        inner: MemoryStorage::new(roster()),
        token: token.clone(),
        on_save: false,
    });
    let channel = Arc::new(Recorder::default());
    let coordinator = Coordinator::new(storage.clone(), channel.clone(), &fast_settings());

    let report = coordinator.run_cycle_with_cancel(at(1, 0), &token).await;
    assert_eq!(
        report.status,
        CycleStatus::Cancelled {
            before: CyclePhase::Planning
        }
    );
    assert_eq!(storage.inner.current().revision, 0);
    assert!(channel.sent().is_empty());
}

#[tokio::test]
async fn cancellation_after_save_still_notifies() {
    let token = CancellationToken::new();
    let storage = Arc::new(CancelsDuring {
        inner: MemoryStorage::new(roster()),
        token: token.clone(),
        on_save: true,
    });
    let channel = Arc::new(Recorder::default());
    let coordinator = Coordinator::new(storage.clone(), channel.clone(), &fast_settings());

    let report = coordinator.run_cycle_with_cancel(at(1, 0), &token).await;
    assert!(token.is_cancelled());
    assert!(report.is_completed());
    assert!(!report.events.is_empty());
    assert_eq!(channel.sent().len(), report.events.len());
    assert_eq!(storage.inner.current().revision, 1);
}

#[tokio::test]
async fn undelivered_messages_are_reported_not_fatal() {
    let storage = Arc::new(MemoryStorage::new(roster()));
    let channel = Arc::new(Recorder::failing(u32::MAX));
    let coordinator = Coordinator::new(storage.clone(), channel.clone(), &fast_settings());

    let report = coordinator.run_cycle(at(1, 0)).await;
    assert!(report.is_completed());
    assert_eq!(report.delivered, 0);
    assert_eq!(report.undelivered.len(), report.events.len());
    assert!(report.undelivered.iter().all(|r| r.attempts == 2));
    assert_eq!(storage.current().revision, 1);
    let kinds: Vec<&ChangeKind> = report.undelivered.iter().map(|r| &r.event.kind).collect();
    assert!(kinds.contains(&&ChangeKind::Unfilled { missing: 1 }));
}

#[tokio::test]
async fn transient_send_failures_are_retried() {
    let storage = Arc::new(MemoryStorage::new(roster()));
    let channel = Arc::new(Recorder::failing(1));
    let coordinator = Coordinator::new(storage, channel.clone(), &fast_settings());

    let report = coordinator.run_cycle(at(1, 0)).await;
    assert!(report.undelivered.is_empty());
    assert_eq!(report.delivered, report.events.len());
    assert_eq!(channel.sent().len(), report.events.len());
    assert_eq!(report.events.len(), 5);
}

#[tokio::test]
async fn triggers_during_a_cycle_coalesce_into_one() {
    let storage = Arc::new(Gated {
        inner: MemoryStorage::new(roster()),
        gate: Notify::new(),
        held: AtomicBool::new(false),
    });
    let channel = Arc::new(Recorder::default());
    let coordinator = Arc::new(Coordinator::new(storage.clone(), channel, &fast_settings()));
    let mut phases = coordinator.subscribe();

    let first = tokio::spawn({
        let coordinator = coordinator.clone();
        async move { coordinator.trigger(at(1, 0)).await }
    });
    phases
        .wait_for(|p| *p == CyclePhase::Loading)
        .await
        .unwrap();

    assert!(matches!(coordinator.trigger(at(1, 1)).await, TriggerOutcome::Coalesced));
    assert!(matches!(coordinator.trigger(at(1, 2)).await, TriggerOutcome::Coalesced));

    storage.gate.notify_one();
    let TriggerOutcome::Ran(reports) = first.await.unwrap() else {
        panic!("the first trigger should have run the cycles");
    };
    let as_of: Vec<DateTime<Utc>> = reports.iter().map(|r| r.as_of).collect();
    assert_eq!(as_of, vec![at(1, 0), at(1, 2)]);
    assert!(reports.iter().all(|r| r.is_completed()));
    assert!(reports[1].events.is_empty());
}

#[tokio::test]
async fn concurrent_operator_write_is_kept_and_replanned() {
    let storage = Arc::new(OperatorRace {
        inner: MemoryStorage::new(roster()),
        raced: AtomicBool::new(false),
    });
    let channel = Arc::new(Recorder::default());
    let coordinator = Coordinator::new(storage.clone(), channel.clone(), &fast_settings());

    let report = coordinator.run_cycle(at(1, 0)).await;
    assert!(report.is_completed(), "{:?}", report.status);
    assert_eq!(report.replans, 1);

    let stored = storage.inner.current();
    assert_eq!(stored.revision, 2);
    assert!(stored.find_participant_by_handle("carol").is_some());
    // carol comble le renfort : plus aucun créneau incomplet
    assert!(report.unfilled.is_empty());
    assert_eq!(report.proposed.len(), 5);
    // seuls les événements du plan persisté partent
    assert_eq!(channel.sent().len(), report.events.len());
    assert!(report
        .events
        .iter()
        .all(|e| !matches!(e.kind, ChangeKind::Unfilled { .. })));
}

#[tokio::test]
async fn save_that_lands_after_timeout_still_notifies() {
    let storage = Arc::new(CommitsThenStalls {
        inner: MemoryStorage::new(roster()),
    });
    let channel = Arc::new(Recorder::default());
    let settings = Settings {
        save_timeout_ms: 50,
        ..fast_settings()
    };
    let coordinator = Coordinator::new(storage.clone(), channel.clone(), &settings);

    let report = coordinator.run_cycle(at(1, 0)).await;
    assert!(report.is_completed(), "{:?}", report.status);
    assert_eq!(storage.inner.current().revision, 1);
    assert_eq!(report.events.len(), 5);
    assert_eq!(channel.sent().len(), report.events.len());
}

#[tokio::test]
async fn shutdown_interrupts_a_running_serve_cycle() {
    let storage = Arc::new(Gated {
        inner: MemoryStorage::new(roster()),
        gate: Notify::new(),
        held: AtomicBool::new(false),
    });
    let channel = Arc::new(Recorder::default());
    let coordinator = Arc::new(Coordinator::new(storage.clone(), channel.clone(), &fast_settings()));
    let mut phases = coordinator.subscribe();
    let reports: Arc<Mutex<Vec<CycleReport>>> = Arc::default();

    let serving = tokio::spawn({
        let coordinator = coordinator.clone();
        let reports = reports.clone();
        async move {
            coordinator
                .serve(std::time::Duration::from_secs(3600), |r| {
                    reports.lock().unwrap().push(r.clone())
                })
                .await
        }
    });
    phases
        .wait_for(|p| *p == CyclePhase::Loading)
        .await
        .unwrap();

    coordinator.shutdown_token().cancel();
    storage.gate.notify_one();
    tokio::time::timeout(std::time::Duration::from_secs(5), serving)
        .await
        .expect("serve should stop once shut down")
        .unwrap();

    let reports = reports.lock().unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(
        reports[0].status,
        CycleStatus::Cancelled {
            before: CyclePhase::Planning
        }
    );
    assert_eq!(storage.inner.current(), roster());
    assert!(channel.sent().is_empty());
}

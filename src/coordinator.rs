//! Coordinateur de cycle : chargement → planification → persistance →
//! notification.
//!
//! Un seul cycle à la fois (verrou exclusif). Un déclenchement qui arrive
//! pendant un cycle est mis en attente ; les attentes successives fusionnent
//! en une seule (le dernier `as_of` l'emporte). L'annulation n'est observée
//! qu'aux frontières d'étapes, et jamais après une persistance réussie.
//!
//! La sauvegarde n'aboutit que si le snapshot persisté porte encore la
//! révision chargée ; sinon le cycle recharge et replanifie (borné).

use crate::channel::DeliveryChannel;
use crate::config::Settings;
use crate::dispatch::{DispatchResult, Dispatcher};
use crate::event::{ChangeEvent, ChangeKind};
use crate::model::{Assignment, AssignmentStatus, ShiftId, Snapshot};
use crate::retry::{retry, retry_if, AttemptError, RetryPolicy};
use crate::scheduler;
use crate::storage::{Storage, StorageError, WritePrecondition};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Replanifications tolérées quand un autre écrivain passe entre le
/// chargement et la sauvegarde.
const MAX_REPLANS: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CyclePhase {
    Idle,
    Loading,
    Planning,
    Persisting,
    Notifying,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CycleStatus {
    Completed,
    /// Annulé avant la persistance ; `before` est l'étape qui n'a pas démarré.
    Cancelled { before: CyclePhase },
    Failed { phase: CyclePhase, error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnfilledShift {
    pub shift: ShiftId,
    pub missing: u32,
}

/// Bilan d'un cycle : jamais un simple booléen.
#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub as_of: DateTime<Utc>,
    pub status: CycleStatus,
    /// Révision du snapshot durable à la fin du cycle.
    pub revision: u64,
    pub events: Vec<ChangeEvent>,
    /// Affectations proposées pendant ce cycle.
    pub proposed: Vec<Assignment>,
    /// Affectations confirmées sur les créneaux à venir.
    pub confirmed: Vec<Assignment>,
    /// Créneaux à venir encore incomplets.
    pub unfilled: Vec<UnfilledShift>,
    pub delivered: usize,
    pub undelivered: Vec<DispatchResult>,
    /// Rechargements dus à une écriture concurrente.
    pub replans: u32,
}

impl CycleReport {
    fn new(as_of: DateTime<Utc>) -> Self {
        Self {
            as_of,
            status: CycleStatus::Completed,
            revision: 0,
            events: Vec::new(),
            proposed: Vec::new(),
            confirmed: Vec::new(),
            unfilled: Vec::new(),
            delivered: 0,
            undelivered: Vec::new(),
            replans: 0,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == CycleStatus::Completed
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.status, CycleStatus::Failed { .. })
    }

    fn summarize(&mut self, saved: &Snapshot, events: Vec<ChangeEvent>) {
        self.revision = saved.revision;
        self.proposed = events
            .iter()
            .filter(|e| e.kind == ChangeKind::Created)
            .filter_map(|e| {
                let participant = e.participant.as_ref()?;
                saved.find_assignment(&e.shift, participant).cloned()
            })
            .collect();
        self.confirmed = saved
            .assignments
            .iter()
            .filter(|a| a.status == AssignmentStatus::Confirmed)
            .filter(|a| {
                saved
                    .find_shift(&a.shift)
                    .is_some_and(|s| s.start >= self.as_of)
            })
            .cloned()
            .collect();
        self.unfilled = saved
            .unfilled
            .iter()
            .map(|(shift, missing)| UnfilledShift {
                shift: shift.clone(),
                missing: *missing,
            })
            .collect();
        self.events = events;
    }
}

#[derive(Debug)]
pub enum TriggerOutcome {
    /// Cycles exécutés par cet appel (le sien et ceux fusionnés entre-temps).
    Ran(Vec<CycleReport>),
    /// Un cycle était en cours : la demande est en attente.
    Coalesced,
}

#[derive(Debug, Clone, Copy)]
struct StepPolicy {
    retry: RetryPolicy,
    timeout: Duration,
}

pub struct Coordinator {
    storage: Arc<dyn Storage>,
    dispatcher: Dispatcher,
    load: StepPolicy,
    save: StepPolicy,
    cycle_lock: tokio::sync::Mutex<()>,
    pending: Mutex<Option<DateTime<Utc>>>,
    phase: watch::Sender<CyclePhase>,
    shutdown: CancellationToken,
}

impl Coordinator {
    pub fn new(storage: Arc<dyn Storage>, channel: Arc<dyn DeliveryChannel>, settings: &Settings) -> Self {
        let dispatcher = Dispatcher::new(channel, settings.send_retry, settings.send_timeout());
        Self::with_dispatcher(storage, dispatcher, settings)
    }

    pub fn with_dispatcher(storage: Arc<dyn Storage>, dispatcher: Dispatcher, settings: &Settings) -> Self {
        let (phase, _) = watch::channel(CyclePhase::Idle);
        Self {
            storage,
            dispatcher,
            load: StepPolicy {
                retry: settings.load_retry,
                timeout: settings.load_timeout(),
            },
            save: StepPolicy {
                retry: settings.save_retry,
                timeout: settings.save_timeout(),
            },
            cycle_lock: tokio::sync::Mutex::new(()),
            pending: Mutex::new(None),
            phase,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn phase(&self) -> CyclePhase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<CyclePhase> {
        self.phase.subscribe()
    }

    /// Jeton d'arrêt : l'annuler interrompt le cycle en cours (aux
    /// frontières d'étapes) et les suivants.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Exécute un cycle (attend la fin du cycle en cours le cas échéant).
    pub async fn run_cycle(&self, as_of: DateTime<Utc>) -> CycleReport {
        let report = {
            let _guard = self.cycle_lock.lock().await;
            self.run_locked(as_of, None).await
        };
        for drained in self.drain_pending().await {
            log_drained(&drained);
        }
        report
    }

    /// Comme [`Coordinator::run_cycle`] avec un jeton d'annulation propre au cycle.
    pub async fn run_cycle_with_cancel(&self, as_of: DateTime<Utc>, cancel: &CancellationToken) -> CycleReport {
        let report = {
            let _guard = self.cycle_lock.lock().await;
            self.run_locked(as_of, Some(cancel)).await
        };
        for drained in self.drain_pending().await {
            log_drained(&drained);
        }
        report
    }

    /// Déclenchement fusionnable : si un cycle tourne déjà, la demande est
    /// mise en attente (une seule place) et sera exécutée par le détenteur
    /// du verrou.
    pub async fn trigger(&self, as_of: DateTime<Utc>) -> TriggerOutcome {
        {
            let mut pending = self.pending.lock().unwrap_or_else(|p| p.into_inner());
            if pending.is_some() {
                tracing::debug!(%as_of, "coalescing with pending trigger");
            }
            *pending = Some(as_of);
        }
        let reports = self.drain_pending().await;
        if reports.is_empty() {
            TriggerOutcome::Coalesced
        } else {
            TriggerOutcome::Ran(reports)
        }
    }

    /// Cycles périodiques jusqu'à l'annulation du jeton d'arrêt ; chaque
    /// bilan passe par `on_report`. Un arrêt demandé pendant un cycle est
    /// observé à la frontière d'étape suivante.
    pub async fn serve<F>(&self, cadence: Duration, mut on_report: F)
    where
        F: FnMut(&CycleReport),
    {
        let mut ticker = tokio::time::interval(cadence);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let TriggerOutcome::Ran(reports) = self.trigger(Utc::now()).await {
                        reports.iter().for_each(&mut on_report);
                    }
                }
            }
        }
        tracing::info!("serve loop stopped");
    }

    fn take_pending(&self) -> Option<DateTime<Utc>> {
        self.pending.lock().unwrap_or_else(|p| p.into_inner()).take()
    }

    fn has_pending(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .is_some()
    }

    async fn drain_pending(&self) -> Vec<CycleReport> {
        let mut reports = Vec::new();
        loop {
            let Ok(guard) = self.cycle_lock.try_lock() else {
                break;
            };
            while let Some(as_of) = self.take_pending() {
                reports.push(self.run_locked(as_of, None).await);
            }
            drop(guard);
            // une demande arrivée entre le dernier `take` et la libération
            if !self.has_pending() {
                break;
            }
        }
        reports
    }

    fn enter(&self, phase: CyclePhase) {
        tracing::debug!(?phase, "cycle phase");
        self.phase.send_replace(phase);
    }

    fn cancel_requested(&self, cancel: Option<&CancellationToken>) -> bool {
        self.shutdown.is_cancelled() || cancel.is_some_and(CancellationToken::is_cancelled)
    }

    async fn run_locked(&self, as_of: DateTime<Utc>, cancel: Option<&CancellationToken>) -> CycleReport {
        let mut report = CycleReport::new(as_of);
        tracing::info!(%as_of, "cycle start");
        let storage = &self.storage;

        let (planned, events) = loop {
            if self.cancel_requested(cancel) {
                return self.cancelled(report, CyclePhase::Loading);
            }
            self.enter(CyclePhase::Loading);
            let snapshot = match retry(&self.load.retry, self.load.timeout, "load", || storage.load()).await {
                Ok(loaded) => loaded.value,
                Err(exhausted) => return self.failed(report, CyclePhase::Loading, exhausted.to_string()),
            };
            report.revision = snapshot.revision;

            if self.cancel_requested(cancel) {
                return self.cancelled(report, CyclePhase::Planning);
            }
            self.enter(CyclePhase::Planning);
            let (planned, events) = scheduler::plan(&snapshot, as_of);

            if self.cancel_requested(cancel) {
                return self.cancelled(report, CyclePhase::Persisting);
            }
            self.enter(CyclePhase::Persisting);
            if planned.revision == snapshot.revision {
                tracing::debug!(revision = snapshot.revision, "nothing to persist");
                break (planned, events);
            }
            let precondition = WritePrecondition::MatchesRevision(snapshot.revision);
            let saved = retry_if(
                &self.save.retry,
                self.save.timeout,
                "save",
                || storage.save(&planned, precondition),
                |err: &StorageError| !matches!(err, StorageError::Conflict { .. }),
            )
            .await;
            let Err(exhausted) = saved else {
                break (planned, events);
            };
            // issue incertaine (délai dépassé) : l'état relu tranche
            if self.is_persisted(&planned).await {
                tracing::warn!(revision = planned.revision, error = %exhausted, "save confirmed on reload");
                break (planned, events);
            }
            let conflict = matches!(exhausted.last, AttemptError::Failed(StorageError::Conflict { .. }));
            if conflict && report.replans < MAX_REPLANS {
                report.replans += 1;
                tracing::info!(replans = report.replans, error = %exhausted, "snapshot moved during cycle, re-planning");
                continue;
            }
            return self.failed(report, CyclePhase::Persisting, exhausted.to_string());
        };

        // persisté : la notification a lieu même si une annulation arrive
        self.enter(CyclePhase::Notifying);
        let results = self.dispatcher.dispatch(&planned, &events).await;
        report.summarize(&planned, events);
        for result in results {
            if result.is_delivered() {
                report.delivered += 1;
            } else {
                report.undelivered.push(result);
            }
        }

        self.enter(CyclePhase::Idle);
        tracing::info!(
            revision = report.revision,
            events = report.events.len(),
            unfilled = report.unfilled.len(),
            undelivered = report.undelivered.len(),
            "cycle complete"
        );
        report
    }

    async fn is_persisted(&self, planned: &Snapshot) -> bool {
        match tokio::time::timeout(self.load.timeout, self.storage.load()).await {
            Ok(Ok(current)) => current == *planned,
            _ => false,
        }
    }

    fn cancelled(&self, mut report: CycleReport, before: CyclePhase) -> CycleReport {
        tracing::info!(?before, "cycle cancelled");
        self.enter(CyclePhase::Idle);
        report.status = CycleStatus::Cancelled { before };
        report
    }

    fn failed(&self, mut report: CycleReport, phase: CyclePhase, error: String) -> CycleReport {
        tracing::error!(?phase, %error, "cycle failed");
        self.enter(CyclePhase::Failed);
        report.status = CycleStatus::Failed { phase, error };
        report
    }
}

fn log_drained(report: &CycleReport) {
    tracing::info!(
        as_of = %report.as_of,
        status = ?report.status,
        revision = report.revision,
        events = report.events.len(),
        undelivered = report.undelivered.len(),
        "coalesced cycle ran"
    );
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("phase", &self.phase())
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

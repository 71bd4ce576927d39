#![forbid(unsafe_code)]
//! Shift-bot : cœur de planification de créneaux.
//!
//! - Registre versionné (créneaux, participants, affectations) et invariants.
//! - Planification pure et déterministe, équilibrage de charge.
//! - Notifications via un canal externe, avec relances bornées.
//! - Cycle coordonné : chargement, planification, persistance, notification.
//! - Tout en UTC ; parsing RFC3339 ; affichage local en dehors de la lib.

pub mod channel;
pub mod config;
pub mod coordinator;
pub mod dispatch;
pub mod event;
pub mod io;
pub mod model;
pub mod notification;
pub mod registry;
pub mod retry;
pub mod scheduler;
pub mod storage;

pub use channel::{DeliveryChannel, DeliveryError, DeliveryReceipt, OutboxChannel, StdoutChannel};
pub use config::{ConfigError, Settings};
pub use coordinator::{Coordinator, CyclePhase, CycleReport, CycleStatus, TriggerOutcome, UnfilledShift};
pub use dispatch::{DeliveryOutcome, DispatchResult, Dispatcher};
pub use event::{CancelReason, ChangeEvent, ChangeKind};
pub use model::{
    Assignment, AssignmentStatus, Participant, ParticipantId, Role, Shift, ShiftId, Snapshot,
    TimeWindow,
};
pub use notification::{prepare_reminder, Message, MessageRenderer, Recipient, Reminder, TextRenderer};
pub use registry::{InvariantViolation, Registry};
pub use retry::RetryPolicy;
pub use scheduler::{detect_conflicts, plan, Conflict, ConflictKind};
pub use storage::{JsonStorage, MemoryStorage, SnapshotLock, Storage, StorageError, WritePrecondition};

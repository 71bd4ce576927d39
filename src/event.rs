use crate::model::{ParticipantId, ShiftId};
use serde::{Deserialize, Serialize};

/// Motif d'annulation d'une affectation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// Annulée par un opérateur (ou refus du participant).
    Manual,
    /// Remplacée par une autre personne via `swap`.
    Swapped,
    /// Le participant s'est déclaré indisponible sur le créneau.
    Unavailable,
    /// Le participant n'a plus le rôle requis.
    RoleMismatch,
    /// Le participant est déjà pris sur un créneau qui chevauche.
    DoubleBooked,
    /// Le créneau a plus d'affectations que l'effectif requis.
    OverStaffed,
}

impl CancelReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CancelReason::Manual => "manual",
            CancelReason::Swapped => "swapped",
            CancelReason::Unavailable => "unavailable",
            CancelReason::RoleMismatch => "role_mismatch",
            CancelReason::DoubleBooked => "double_booked",
            CancelReason::OverStaffed => "over_staffed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Confirmed,
    Cancelled { reason: CancelReason },
    /// Le créneau reste incomplet ; `missing` personnes manquent.
    Unfilled { missing: u32 },
}

/// Transition d'affectation produite par un cycle ou une mutation du registre.
///
/// Consommée uniquement par le dispatcher, jamais persistée seule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub shift: ShiftId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant: Option<ParticipantId>,
    pub kind: ChangeKind,
    /// Commentaire du responsable qui a pris la décision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl ChangeEvent {
    pub fn created(shift: ShiftId, participant: ParticipantId) -> Self {
        Self {
            shift,
            participant: Some(participant),
            kind: ChangeKind::Created,
            note: None,
        }
    }

    pub fn confirmed(shift: ShiftId, participant: ParticipantId) -> Self {
        Self {
            shift,
            participant: Some(participant),
            kind: ChangeKind::Confirmed,
            note: None,
        }
    }

    pub fn cancelled(shift: ShiftId, participant: ParticipantId, reason: CancelReason) -> Self {
        Self {
            shift,
            participant: Some(participant),
            kind: ChangeKind::Cancelled { reason },
            note: None,
        }
    }

    pub fn unfilled(shift: ShiftId, missing: u32) -> Self {
        Self {
            shift,
            participant: None,
            kind: ChangeKind::Unfilled { missing },
            note: None,
        }
    }

    pub fn with_note(mut self, note: Option<String>) -> Self {
        self.note = note;
        self
    }

    pub fn label(&self) -> &'static str {
        match self.kind {
            ChangeKind::Created => "created",
            ChangeKind::Confirmed => "confirmed",
            ChangeKind::Cancelled { .. } => "cancelled",
            ChangeKind::Unfilled { .. } => "unfilled",
        }
    }
}

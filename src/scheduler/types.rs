use crate::event::CancelReason;
use crate::model::{ParticipantId, ShiftId};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Deux affectations actives qui se chevauchent pour la même personne.
    DoubleBooking,
    /// Affectation pendant une indisponibilité déclarée.
    Unavailable,
    /// Le participant n'a pas le rôle du créneau.
    RoleMismatch,
    /// Plus d'affectations actives que l'effectif requis.
    OverStaffed,
}

impl ConflictKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ConflictKind::DoubleBooking => "double_booking",
            ConflictKind::Unavailable => "unavailable",
            ConflictKind::RoleMismatch => "role_mismatch",
            ConflictKind::OverStaffed => "over_staffed",
        }
    }

    pub(super) fn cancel_reason(self) -> CancelReason {
        match self {
            ConflictKind::DoubleBooking => CancelReason::DoubleBooked,
            ConflictKind::Unavailable => CancelReason::Unavailable,
            ConflictKind::RoleMismatch => CancelReason::RoleMismatch,
            ConflictKind::OverStaffed => CancelReason::OverStaffed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conflict {
    pub kind: ConflictKind,
    pub shift: ShiftId,
    pub participant: ParticipantId,
    /// Créneau en concurrence (double réservation uniquement).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub other_shift: Option<ShiftId>,
}

//! Registre des créneaux : seul point de mutation du [`Snapshot`].
//!
//! Chaque mutation vérifie les invariants avant d'écrire quoi que ce soit ;
//! une mutation refusée laisse le snapshot intact.

use crate::event::{CancelReason, ChangeEvent};
use crate::model::{
    Assignment, AssignmentStatus, Participant, ParticipantId, Shift, ShiftId, Snapshot, TimeWindow,
};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvariantViolation {
    #[error("invalid time range: end must be after start")]
    InvalidTimeRange,
    #[error("shift {0} must require at least one person")]
    ZeroHeadcount(ShiftId),
    #[error("duplicate shift: {0}")]
    DuplicateShift(ShiftId),
    #[error("duplicate participant: {0}")]
    DuplicateParticipant(String),
    #[error("unknown shift: {0}")]
    UnknownShift(ShiftId),
    #[error("unknown participant: {0}")]
    UnknownParticipant(ParticipantId),
    #[error("participant {0} has overlapping unavailable windows")]
    OverlappingUnavailability(ParticipantId),
    #[error("participant {participant} lacks role {role} required by shift {shift}")]
    RoleMismatch {
        shift: ShiftId,
        participant: ParticipantId,
        role: String,
    },
    #[error("participant {participant} is unavailable during shift {shift}")]
    Unavailable {
        shift: ShiftId,
        participant: ParticipantId,
    },
    #[error("participant {participant} is already booked on {other}, overlapping shift {shift}")]
    DoubleBooking {
        shift: ShiftId,
        other: ShiftId,
        participant: ParticipantId,
    },
    #[error("shift {0} is already fully staffed")]
    ShiftFull(ShiftId),
    #[error("participant {participant} is already assigned to shift {shift}")]
    AlreadyAssigned {
        shift: ShiftId,
        participant: ParticipantId,
    },
    #[error("no active assignment of {participant} on shift {shift}")]
    NotAssigned {
        shift: ShiftId,
        participant: ParticipantId,
    },
    #[error("inconsistent snapshot: {0}")]
    Inconsistent(String),
}

/// Vérifie qu'un participant peut tenir un créneau : rôle, disponibilité,
/// absence de chevauchement avec ses affectations actives.
pub(crate) fn check_eligibility(
    snapshot: &Snapshot,
    shift: &Shift,
    participant: &Participant,
) -> Result<(), InvariantViolation> {
    if !participant.has_role(&shift.role) {
        return Err(InvariantViolation::RoleMismatch {
            shift: shift.id.clone(),
            participant: participant.id.clone(),
            role: shift.role.as_str().to_string(),
        });
    }
    let window = shift.window();
    if participant.is_unavailable_during(&window) {
        return Err(InvariantViolation::Unavailable {
            shift: shift.id.clone(),
            participant: participant.id.clone(),
        });
    }
    for a in snapshot.active_for_participant(&participant.id) {
        if a.shift == shift.id {
            return Err(InvariantViolation::AlreadyAssigned {
                shift: shift.id.clone(),
                participant: participant.id.clone(),
            });
        }
        let Some(other) = snapshot.find_shift(&a.shift) else {
            continue;
        };
        if other.window().overlaps(&window) {
            return Err(InvariantViolation::DoubleBooking {
                shift: shift.id.clone(),
                other: other.id.clone(),
                participant: participant.id.clone(),
            });
        }
    }
    Ok(())
}

/// Registry : encapsule un Snapshot et garantit ses invariants
#[derive(Debug, Default, Clone)]
pub struct Registry {
    snapshot: Snapshot,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reprend un snapshot existant après contrôle structurel.
    pub fn from_snapshot(snapshot: Snapshot) -> Result<Self, InvariantViolation> {
        snapshot.validate().map_err(InvariantViolation::Inconsistent)?;
        Ok(Self { snapshot })
    }

    pub fn snapshot(&self) -> &Snapshot {
        &self.snapshot
    }

    pub fn into_snapshot(self) -> Snapshot {
        self.snapshot
    }

    fn bump(&mut self) {
        self.snapshot.revision += 1;
    }

    pub fn add_shift(&mut self, shift: Shift) -> Result<ShiftId, InvariantViolation> {
        if shift.end <= shift.start {
            return Err(InvariantViolation::InvalidTimeRange);
        }
        if shift.headcount == 0 {
            return Err(InvariantViolation::ZeroHeadcount(shift.id));
        }
        if self.snapshot.find_shift(&shift.id).is_some() {
            return Err(InvariantViolation::DuplicateShift(shift.id));
        }
        let id = shift.id.clone();
        self.snapshot.shifts.push(shift);
        self.bump();
        Ok(id)
    }

    pub fn add_participant(
        &mut self,
        mut participant: Participant,
    ) -> Result<ParticipantId, InvariantViolation> {
        if self.snapshot.find_participant(&participant.id).is_some() {
            return Err(InvariantViolation::DuplicateParticipant(
                participant.id.as_str().to_string(),
            ));
        }
        if self
            .snapshot
            .find_participant_by_handle(&participant.handle)
            .is_some()
        {
            return Err(InvariantViolation::DuplicateParticipant(participant.handle));
        }
        if participant.unavailable.iter().any(|w| !w.is_valid()) {
            return Err(InvariantViolation::InvalidTimeRange);
        }
        participant.unavailable.sort();
        if participant
            .unavailable
            .windows(2)
            .any(|pair| pair[0].overlaps(&pair[1]))
        {
            return Err(InvariantViolation::OverlappingUnavailability(participant.id));
        }
        let id = participant.id.clone();
        self.snapshot.participants.push(participant);
        self.bump();
        Ok(id)
    }

    /// Ajoute une indisponibilité. Refusée si elle chevauche une autre
    /// indisponibilité ou une affectation active (annuler d'abord).
    pub fn declare_unavailable(
        &mut self,
        participant: &ParticipantId,
        window: TimeWindow,
    ) -> Result<(), InvariantViolation> {
        if !window.is_valid() {
            return Err(InvariantViolation::InvalidTimeRange);
        }
        let person = self
            .snapshot
            .find_participant(participant)
            .ok_or_else(|| InvariantViolation::UnknownParticipant(participant.clone()))?;
        if person.unavailable.iter().any(|w| w.overlaps(&window)) {
            return Err(InvariantViolation::OverlappingUnavailability(participant.clone()));
        }
        for a in self.snapshot.active_for_participant(participant) {
            if let Some(shift) = self.snapshot.find_shift(&a.shift) {
                if shift.window().overlaps(&window) {
                    return Err(InvariantViolation::Unavailable {
                        shift: shift.id.clone(),
                        participant: participant.clone(),
                    });
                }
            }
        }

        if let Some(person) = self.snapshot.find_participant_mut(participant) {
            person.unavailable.push(window);
            person.unavailable.sort();
        }
        self.bump();
        Ok(())
    }

    /// Affectation manuelle (statut `proposed`).
    pub fn assign(
        &mut self,
        shift_id: &ShiftId,
        participant_id: &ParticipantId,
    ) -> Result<ChangeEvent, InvariantViolation> {
        let shift = self
            .snapshot
            .find_shift(shift_id)
            .ok_or_else(|| InvariantViolation::UnknownShift(shift_id.clone()))?;
        let participant = self
            .snapshot
            .find_participant(participant_id)
            .ok_or_else(|| InvariantViolation::UnknownParticipant(participant_id.clone()))?;

        let active = self.snapshot.active_for_shift(shift_id).count();
        if self
            .snapshot
            .find_assignment(shift_id, participant_id)
            .is_some_and(Assignment::is_active)
        {
            return Err(InvariantViolation::AlreadyAssigned {
                shift: shift_id.clone(),
                participant: participant_id.clone(),
            });
        }
        if active >= shift.headcount as usize {
            return Err(InvariantViolation::ShiftFull(shift_id.clone()));
        }
        check_eligibility(&self.snapshot, shift, participant)?;

        self.activate(shift_id, participant_id);
        self.bump();
        Ok(ChangeEvent::created(shift_id.clone(), participant_id.clone()))
    }

    /// `proposed` → `confirmed`. Retourne `None` si déjà confirmée.
    pub fn confirm(
        &mut self,
        shift_id: &ShiftId,
        participant_id: &ParticipantId,
    ) -> Result<Option<ChangeEvent>, InvariantViolation> {
        self.confirm_with_note(shift_id, participant_id, None)
    }

    /// Comme [`Registry::confirm`], avec le commentaire du responsable
    /// (conservé sur l'affectation et repris dans l'événement).
    pub fn confirm_with_note(
        &mut self,
        shift_id: &ShiftId,
        participant_id: &ParticipantId,
        note: Option<&str>,
    ) -> Result<Option<ChangeEvent>, InvariantViolation> {
        let pos = self.active_position(shift_id, participant_id)?;
        let assignment = &mut self.snapshot.assignments[pos];
        if assignment.status == AssignmentStatus::Confirmed {
            return Ok(None);
        }
        let note = clean_note(note);
        assignment.status = AssignmentStatus::Confirmed;
        assignment.note = note.clone();
        self.bump();
        Ok(Some(
            ChangeEvent::confirmed(shift_id.clone(), participant_id.clone()).with_note(note),
        ))
    }

    pub fn cancel(
        &mut self,
        shift_id: &ShiftId,
        participant_id: &ParticipantId,
    ) -> Result<ChangeEvent, InvariantViolation> {
        self.cancel_with_note(shift_id, participant_id, None)
    }

    pub fn cancel_with_note(
        &mut self,
        shift_id: &ShiftId,
        participant_id: &ParticipantId,
        note: Option<&str>,
    ) -> Result<ChangeEvent, InvariantViolation> {
        let pos = self.active_position(shift_id, participant_id)?;
        let note = clean_note(note);
        let assignment = &mut self.snapshot.assignments[pos];
        assignment.status = AssignmentStatus::Cancelled;
        assignment.note = note.clone();
        self.bump();
        Ok(ChangeEvent::cancelled(
            shift_id.clone(),
            participant_id.clone(),
            CancelReason::Manual,
        )
        .with_note(note))
    }

    /// Transfère l'affectation de `from` vers `to` sur un créneau.
    /// Tout ou rien : si `to` ne respecte pas les invariants, rien ne change.
    pub fn swap(
        &mut self,
        shift_id: &ShiftId,
        from: &ParticipantId,
        to: &ParticipantId,
    ) -> Result<Vec<ChangeEvent>, InvariantViolation> {
        let pos = self.active_position(shift_id, from)?;
        if from == to {
            return Err(InvariantViolation::AlreadyAssigned {
                shift: shift_id.clone(),
                participant: to.clone(),
            });
        }
        let shift = self
            .snapshot
            .find_shift(shift_id)
            .ok_or_else(|| InvariantViolation::UnknownShift(shift_id.clone()))?;
        let target = self
            .snapshot
            .find_participant(to)
            .ok_or_else(|| InvariantViolation::UnknownParticipant(to.clone()))?;
        check_eligibility(&self.snapshot, shift, target)?;

        self.snapshot.assignments[pos].status = AssignmentStatus::Cancelled;
        self.activate(shift_id, to);
        self.bump();
        Ok(vec![
            ChangeEvent::cancelled(shift_id.clone(), from.clone(), CancelReason::Swapped),
            ChangeEvent::created(shift_id.clone(), to.clone()),
        ])
    }

    fn active_position(
        &self,
        shift_id: &ShiftId,
        participant_id: &ParticipantId,
    ) -> Result<usize, InvariantViolation> {
        self.snapshot
            .assignments
            .iter()
            .position(|a| &a.shift == shift_id && &a.participant == participant_id && a.is_active())
            .ok_or_else(|| InvariantViolation::NotAssigned {
                shift: shift_id.clone(),
                participant: participant_id.clone(),
            })
    }

    /// Réactive une ligne annulée ou en crée une nouvelle (une ligne par couple).
    fn activate(&mut self, shift_id: &ShiftId, participant_id: &ParticipantId) {
        match self
            .snapshot
            .assignments
            .iter_mut()
            .find(|a| &a.shift == shift_id && &a.participant == participant_id)
        {
            Some(existing) => {
                existing.status = AssignmentStatus::Proposed;
                existing.note = None;
            }
            None => self
                .snapshot
                .assignments
                .push(Assignment::proposed(shift_id.clone(), participant_id.clone())),
        }
    }
}

fn clean_note(note: Option<&str>) -> Option<String> {
    note.map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_owned)
}

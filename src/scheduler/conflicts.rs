use super::{Conflict, ConflictKind};
use crate::model::{Assignment, AssignmentStatus, Shift, ShiftId, Snapshot, TimeWindow};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Ordre de priorité : confirmées d'abord, puis créneau le plus tôt,
/// puis identifiants.
fn priority<'a>(a: &'a Assignment, shift: &'a Shift) -> (bool, DateTime<Utc>, &'a ShiftId, &'a str) {
    (
        a.status != AssignmentStatus::Confirmed,
        shift.start,
        &shift.id,
        a.participant.as_str(),
    )
}

fn shift_index(snapshot: &Snapshot) -> BTreeMap<&ShiftId, &Shift> {
    snapshot.shifts.iter().map(|s| (&s.id, s)).collect()
}

pub(super) fn detect_conflicts(snapshot: &Snapshot) -> Vec<Conflict> {
    let shifts = shift_index(snapshot);
    let mut out = Vec::new();

    for person in snapshot.participants.iter() {
        let mut booked: Vec<&Shift> = snapshot
            .active_for_participant(&person.id)
            .filter_map(|a| shifts.get(&a.shift).copied())
            .collect();
        booked.sort_by(|a, b| (a.start, &a.id).cmp(&(b.start, &b.id)));

        for (idx, a) in booked.iter().enumerate() {
            if !person.has_role(&a.role) {
                out.push(Conflict {
                    kind: ConflictKind::RoleMismatch,
                    shift: a.id.clone(),
                    participant: person.id.clone(),
                    other_shift: None,
                });
            }
            if person.is_unavailable_during(&a.window()) {
                out.push(Conflict {
                    kind: ConflictKind::Unavailable,
                    shift: a.id.clone(),
                    participant: person.id.clone(),
                    other_shift: None,
                });
            }
            for b in booked.iter().skip(idx + 1) {
                if a.window().overlaps(&b.window()) {
                    out.push(Conflict {
                        kind: ConflictKind::DoubleBooking,
                        shift: a.id.clone(),
                        participant: person.id.clone(),
                        other_shift: Some(b.id.clone()),
                    });
                }
            }
        }
    }

    for shift in &snapshot.shifts {
        let mut active: Vec<&Assignment> = snapshot.active_for_shift(&shift.id).collect();
        if active.len() <= shift.headcount as usize {
            continue;
        }
        active.sort_by(|a, b| priority(a, shift).cmp(&priority(b, shift)));
        for extra in active.iter().skip(shift.headcount as usize) {
            out.push(Conflict {
                kind: ConflictKind::OverStaffed,
                shift: shift.id.clone(),
                participant: extra.participant.clone(),
                other_shift: None,
            });
        }
    }

    out
}

/// Sélectionne les affectations actives à venir qui violent un invariant.
///
/// Passe gloutonne dans l'ordre de priorité ; les affectations dont le
/// créneau a commencé avant `as_of` sont conservées telles quelles.
/// Retourne les index (dans `snapshot.assignments`) à annuler.
pub(super) fn resolve(snapshot: &Snapshot, as_of: DateTime<Utc>) -> Vec<(usize, ConflictKind)> {
    let shifts = shift_index(snapshot);
    let mut kept: Vec<(&str, TimeWindow)> = Vec::new();
    let mut staffed: BTreeMap<&ShiftId, u32> = BTreeMap::new();
    let mut upcoming: Vec<(usize, &Assignment, &Shift)> = Vec::new();

    for (idx, a) in snapshot.assignments.iter().enumerate() {
        if !a.is_active() {
            continue;
        }
        let Some(shift) = shifts.get(&a.shift).copied() else {
            continue;
        };
        if shift.start < as_of {
            kept.push((a.participant.as_str(), shift.window()));
            *staffed.entry(&shift.id).or_default() += 1;
        } else {
            upcoming.push((idx, a, shift));
        }
    }
    upcoming.sort_by(|(_, a, sa), (_, b, sb)| priority(a, sa).cmp(&priority(b, sb)));

    let mut rejected = Vec::new();
    for (idx, a, shift) in upcoming {
        let Some(person) = snapshot.find_participant(&a.participant) else {
            continue;
        };
        let window = shift.window();
        let kind = if !person.has_role(&shift.role) {
            Some(ConflictKind::RoleMismatch)
        } else if person.is_unavailable_during(&window) {
            Some(ConflictKind::Unavailable)
        } else if kept
            .iter()
            .any(|(who, w)| *who == a.participant.as_str() && w.overlaps(&window))
        {
            Some(ConflictKind::DoubleBooking)
        } else if staffed.get(&shift.id).copied().unwrap_or(0) >= shift.headcount {
            Some(ConflictKind::OverStaffed)
        } else {
            None
        };

        match kind {
            Some(kind) => rejected.push((idx, kind)),
            None => {
                kept.push((a.participant.as_str(), window));
                *staffed.entry(&shift.id).or_default() += 1;
            }
        }
    }
    rejected
}

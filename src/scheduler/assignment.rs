use crate::event::ChangeEvent;
use crate::model::{Assignment, ParticipantId, Shift, ShiftId, Snapshot};
use crate::registry::check_eligibility;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};

/// Complète les créneaux ouverts dans l'ordre chronologique
/// (départage par identifiant de créneau).
pub(super) fn fill_open_shifts(
    snapshot: &mut Snapshot,
    as_of: DateTime<Utc>,
    events: &mut Vec<ChangeEvent>,
) {
    let mut load: BTreeMap<ParticipantId, usize> = snapshot
        .participants
        .iter()
        .map(|p| (p.id.clone(), 0))
        .collect();
    for a in snapshot.assignments.iter().filter(|a| a.is_active()) {
        if let Some(count) = load.get_mut(&a.participant) {
            *count += 1;
        }
    }

    let mut open: Vec<Shift> = snapshot
        .shifts
        .iter()
        .filter(|s| s.start >= as_of)
        .cloned()
        .collect();
    open.sort_by(|a, b| (a.start, &a.id).cmp(&(b.start, &b.id)));

    let upcoming: BTreeSet<ShiftId> = open.iter().map(|s| s.id.clone()).collect();
    snapshot.unfilled.retain(|id, _| upcoming.contains(id));

    for shift in &open {
        let staffed = snapshot.active_for_shift(&shift.id).count() as u32;
        let mut missing = shift.headcount.saturating_sub(staffed);

        while missing > 0 {
            let Some(chosen) = pick_candidate(snapshot, shift, &load) else {
                break;
            };
            snapshot
                .assignments
                .push(Assignment::proposed(shift.id.clone(), chosen.clone()));
            *load.entry(chosen.clone()).or_default() += 1;
            events.push(ChangeEvent::created(shift.id.clone(), chosen));
            missing -= 1;
        }

        if missing == 0 {
            snapshot.unfilled.remove(&shift.id);
        } else if snapshot.unfilled.get(&shift.id) != Some(&missing) {
            snapshot.unfilled.insert(shift.id.clone(), missing);
            events.push(ChangeEvent::unfilled(shift.id.clone(), missing));
        }
    }
}

/// Candidat le moins chargé parmi les éligibles ; départage par identifiant.
///
/// Un couple (créneau, participant) déjà présent, même annulé, est exclu :
/// une personne retirée d'un créneau n'y est pas reproposée automatiquement.
fn pick_candidate(
    snapshot: &Snapshot,
    shift: &Shift,
    load: &BTreeMap<ParticipantId, usize>,
) -> Option<ParticipantId> {
    let load_of = |id: &ParticipantId| load.get(id).copied().unwrap_or(0);
    snapshot
        .participants
        .iter()
        .filter(|p| snapshot.find_assignment(&shift.id, &p.id).is_none())
        .filter(|p| check_eligibility(snapshot, shift, p).is_ok())
        .min_by(|a, b| (load_of(&a.id), &a.id).cmp(&(load_of(&b.id), &b.id)))
        .map(|p| p.id.clone())
}

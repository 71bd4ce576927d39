//! Moteur de planification : fonction pure `plan(snapshot, as_of)`.
//!
//! 1. Résolution des conflits sur les créneaux à venir (annulations).
//! 2. Remplissage des créneaux ouverts, du plus tôt au plus tard, en
//!    choisissant la personne éligible la moins chargée.
//! 3. Signalement des créneaux restés incomplets.
//!
//! Aucun accès à l'horloge ni conteneur non ordonné : deux appels avec les
//! mêmes entrées donnent exactement la même sortie.

mod assignment;
mod conflicts;
mod types;

pub use types::{Conflict, ConflictKind};

use crate::event::ChangeEvent;
use crate::model::{AssignmentStatus, Snapshot};
use chrono::{DateTime, Utc};

/// Calcule le snapshot suivant et la liste des changements.
///
/// La révision n'est incrémentée que si le snapshot a changé.
pub fn plan(snapshot: &Snapshot, as_of: DateTime<Utc>) -> (Snapshot, Vec<ChangeEvent>) {
    let mut next = snapshot.clone();
    let mut events = Vec::new();

    for (idx, kind) in conflicts::resolve(snapshot, as_of) {
        let assignment = &mut next.assignments[idx];
        assignment.status = AssignmentStatus::Cancelled;
        events.push(ChangeEvent::cancelled(
            assignment.shift.clone(),
            assignment.participant.clone(),
            kind.cancel_reason(),
        ));
    }

    assignment::fill_open_shifts(&mut next, as_of, &mut events);

    if next != *snapshot {
        next.revision = snapshot.revision + 1;
    }
    (next, events)
}

/// Liste les conflits des affectations actives (passées comprises).
pub fn detect_conflicts(snapshot: &Snapshot) -> Vec<Conflict> {
    conflicts::detect_conflicts(snapshot)
}

#![forbid(unsafe_code)]
use chrono::{DateTime, Duration, TimeZone, Utc};
use shift_bot::{
    detect_conflicts, plan, Assignment, AssignmentStatus, CancelReason, ChangeEvent, ChangeKind,
    ConflictKind, Participant, ParticipantId, Role, Shift, ShiftId, Snapshot, TimeWindow,
};
use std::collections::BTreeMap;

fn at(day: u32, h: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 10, day, h, 0, 0).unwrap()
}

fn shift(id: &str, start: DateTime<Utc>, hours: i64, role: &str, headcount: u32) -> Shift {
    Shift::new(id.into(), start, start + Duration::hours(hours), Role::new(role), headcount)
        .unwrap()
        .with_id(ShiftId::new(id))
}

fn person(id: &str, roles: &[&str]) -> Participant {
    roles.iter().fold(
        Participant::new(id, id.to_uppercase()).with_id(ParticipantId::new(id)),
        |p, r| p.with_role(Role::new(r)),
    )
}

fn assignment(shift: &str, who: &str, status: AssignmentStatus) -> Assignment {
    Assignment {
        shift: ShiftId::new(shift),
        participant: ParticipantId::new(who),
        status,
        note: None,
    }
}

/// Semaine chargée : créneaux qui se chevauchent, rôles mixtes, absences.
fn busy_week() -> Snapshot {
    let mut snap = Snapshot::default();
    for day in 1..=5 {
        snap.shifts.push(shift(&format!("d{day}-am"), at(day, 8), 8, "lead", 1));
        snap.shifts.push(shift(&format!("d{day}-mid"), at(day, 12), 6, "caisse", 2));
        snap.shifts.push(shift(&format!("d{day}-pm"), at(day, 16), 6, "lead", 1));
    }
    snap.participants.push(person("ana", &["lead", "caisse"]));
    snap.participants.push(person("ben", &["lead"]));
    snap.participants.push(person("chloe", &["caisse"]));
    let mut dan = person("dan", &["lead", "caisse"]);
    dan.unavailable.push(TimeWindow::new(at(2, 0), at(4, 0)).unwrap());
    snap.participants.push(dan);
    let mut eve = person("eve", &["caisse"]);
    eve.unavailable.push(TimeWindow::new(at(1, 10), at(1, 14)).unwrap());
    snap.participants.push(eve);
    snap
}

#[test]
fn plan_never_breaks_booking_invariants() {
    let snap = busy_week();
    let (next, events) = plan(&snap, at(1, 0));
    assert!(!events.is_empty());
    assert!(detect_conflicts(&next).is_empty(), "{:?}", detect_conflicts(&next));
    next.validate().unwrap();

    for p in &next.participants {
        let windows: Vec<TimeWindow> = next
            .active_for_participant(&p.id)
            .map(|a| next.find_shift(&a.shift).unwrap().window())
            .collect();
        for (i, w) in windows.iter().enumerate() {
            assert!(!p.is_unavailable_during(w), "{} booked while away", p.id);
            assert!(windows.iter().skip(i + 1).all(|o| !o.overlaps(w)));
        }
    }
}

#[test]
fn plan_is_deterministic() {
    let snap = busy_week();
    let first = plan(&snap, at(1, 0));
    let second = plan(&snap, at(1, 0));
    assert_eq!(
        serde_json::to_string(&first).unwrap(),
        serde_json::to_string(&second).unwrap()
    );
}

#[test]
fn replanning_an_unchanged_snapshot_is_a_no_op() {
    let snap = busy_week();
    let (next, _) = plan(&snap, at(1, 0));
    let (again, events) = plan(&next, at(1, 0));
    assert!(events.is_empty(), "{events:?}");
    assert_eq!(again, next);
    assert_eq!(again.revision, next.revision);
}

#[test]
fn nobody_gets_a_second_shift_while_someone_idle_qualifies() {
    let mut snap = Snapshot::default();
    for (i, day) in (1..=4).enumerate() {
        snap.shifts.push(shift(&format!("s{i}"), at(day, 9), 8, "lead", 1));
    }
    for id in ["p1", "p2", "p3", "p4"] {
        snap.participants.push(person(id, &["lead"]));
    }

    let (next, _) = plan(&snap, at(1, 0));
    let mut load: BTreeMap<&ParticipantId, usize> = BTreeMap::new();
    for a in next.assignments.iter().filter(|a| a.is_active()) {
        *load.entry(&a.participant).or_default() += 1;
    }
    assert_eq!(load.len(), 4);
    assert!(load.values().all(|n| *n == 1));
}

#[test]
fn existing_load_is_taken_into_account() {
    let mut snap = Snapshot::default();
    snap.shifts.push(shift("old", at(1, 9), 8, "lead", 1));
    snap.shifts.push(shift("new", at(2, 9), 8, "lead", 1));
    snap.participants.push(person("p1", &["lead"]));
    snap.participants.push(person("p2", &["lead"]));
    snap.assignments
        .push(assignment("old", "p1", AssignmentStatus::Confirmed));

    let (_, events) = plan(&snap, at(1, 0));
    assert_eq!(
        events,
        vec![ChangeEvent::created(ShiftId::new("new"), ParticipantId::new("p2"))]
    );
}

#[test]
fn started_shifts_are_left_alone() {
    let mut snap = Snapshot::default();
    snap.shifts.push(shift("past", at(1, 9), 8, "lead", 1));
    snap.participants.push(person("p1", &["lead"]));

    let (next, events) = plan(&snap, at(1, 10));
    assert!(events.is_empty());
    assert_eq!(next, snap);
}

#[test]
fn unfilled_is_reported_again_only_when_shortfall_changes() {
    let mut snap = Snapshot::default();
    snap.shifts.push(shift("S1", at(1, 9), 8, "lead", 3));
    snap.participants.push(person("p1", &["lead"]));

    let (next, events) = plan(&snap, at(1, 0));
    assert_eq!(events.last(), Some(&ChangeEvent::unfilled(ShiftId::new("S1"), 2)));

    let (same, events) = plan(&next, at(1, 0));
    assert!(events.is_empty());

    let mut grown = same.clone();
    grown.participants.push(person("p2", &["lead"]));
    let (_, events) = plan(&grown, at(1, 0));
    assert_eq!(
        events,
        vec![
            ChangeEvent::created(ShiftId::new("S1"), ParticipantId::new("p2")),
            ChangeEvent::unfilled(ShiftId::new("S1"), 1),
        ]
    );
}

#[test]
fn conflicting_upcoming_assignments_are_cancelled_and_refilled() {
    let mut snap = Snapshot::default();
    snap.shifts.push(shift("A", at(2, 9), 8, "lead", 1));
    snap.shifts.push(shift("B", at(2, 12), 8, "lead", 1));
    snap.participants.push(person("ana", &["lead"]));
    snap.participants.push(person("ben", &["lead"]));
    snap.assignments
        .push(assignment("A", "ana", AssignmentStatus::Proposed));
    snap.assignments
        .push(assignment("B", "ana", AssignmentStatus::Confirmed));

    let kinds: Vec<ConflictKind> = detect_conflicts(&snap).iter().map(|c| c.kind).collect();
    assert_eq!(kinds, vec![ConflictKind::DoubleBooking]);

    let (next, events) = plan(&snap, at(1, 0));
    // la confirmée l'emporte sur la proposée
    assert_eq!(
        events,
        vec![
            ChangeEvent::cancelled(
                ShiftId::new("A"),
                ParticipantId::new("ana"),
                CancelReason::DoubleBooked
            ),
            ChangeEvent::created(ShiftId::new("A"), ParticipantId::new("ben")),
        ]
    );
    assert!(detect_conflicts(&next).is_empty());
    assert_eq!(
        next.find_assignment(&ShiftId::new("B"), &ParticipantId::new("ana"))
            .unwrap()
            .status,
        AssignmentStatus::Confirmed
    );
}

#[test]
fn lost_role_and_overstaffing_are_resolved() {
    let mut snap = Snapshot::default();
    snap.shifts.push(shift("S1", at(2, 9), 8, "lead", 1));
    snap.participants.push(person("ana", &["lead"]));
    snap.participants.push(person("ben", &["lead"]));
    snap.participants.push(person("cid", &["caisse"]));
    snap.assignments
        .push(assignment("S1", "ben", AssignmentStatus::Proposed));
    snap.assignments
        .push(assignment("S1", "ana", AssignmentStatus::Proposed));
    snap.assignments
        .push(assignment("S1", "cid", AssignmentStatus::Confirmed));

    let (next, events) = plan(&snap, at(1, 0));
    let cancelled: Vec<(&str, CancelReason)> = events
        .iter()
        .filter_map(|e| match &e.kind {
            ChangeKind::Cancelled { reason } => {
                Some((e.participant.as_ref().unwrap().as_str(), *reason))
            }
            _ => None,
        })
        .collect();
    assert_eq!(
        cancelled,
        vec![("cid", CancelReason::RoleMismatch), ("ben", CancelReason::OverStaffed)]
    );
    assert_eq!(next.active_for_shift(&ShiftId::new("S1")).count(), 1);
    assert!(detect_conflicts(&next).is_empty());
}

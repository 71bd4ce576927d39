use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Identifiant fort pour Participant
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ParticipantId(String);

impl ParticipantId {
    pub fn new<S: AsRef<str>>(s: S) -> Self {
        Self(s.as_ref().to_owned())
    }
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifiant fort pour Shift
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ShiftId(String);

impl ShiftId {
    pub fn new<S: AsRef<str>>(s: S) -> Self {
        Self(s.as_ref().to_owned())
    }
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShiftId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Rôle requis par un créneau (ex. "lead", "caisse").
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(String);

impl Role {
    pub fn new<S: AsRef<str>>(s: S) -> Self {
        Self(s.as_ref().trim().to_owned())
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Intervalle UTC semi-ouvert `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid time window: end must be strictly after start")]
pub struct InvalidWindow;

impl TimeWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, InvalidWindow> {
        if end <= start {
            return Err(InvalidWindow);
        }
        Ok(Self { start, end })
    }

    pub fn is_valid(&self) -> bool {
        self.start < self.end
    }

    pub fn overlaps(&self, other: &TimeWindow) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// Personne pouvant être affectée à des créneaux.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: ParticipantId,
    pub handle: String,
    pub display_name: String,
    #[serde(default)]
    pub roles: BTreeSet<Role>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unavailable: Vec<TimeWindow>,
}

impl Participant {
    pub fn new<H: Into<String>, D: Into<String>>(handle: H, display_name: D) -> Self {
        Self {
            id: ParticipantId::random(),
            handle: handle.into(),
            display_name: display_name.into(),
            roles: BTreeSet::new(),
            unavailable: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: ParticipantId) -> Self {
        self.id = id;
        self
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.roles.insert(role);
        self
    }

    pub fn has_role(&self, role: &Role) -> bool {
        self.roles.contains(role)
    }

    /// Vrai si une des indisponibilités chevauche la fenêtre.
    pub fn is_unavailable_during(&self, window: &TimeWindow) -> bool {
        self.unavailable.iter().any(|w| w.overlaps(window))
    }
}

/// Créneau à pourvoir (UTC).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shift {
    pub id: ShiftId,
    pub name: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub role: Role,
    pub headcount: u32,
}

impl Shift {
    /// Crée un shift en validant que `end > start` et `headcount >= 1`.
    pub fn new(
        name: String,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        role: Role,
        headcount: u32,
    ) -> Result<Self, String> {
        if end <= start {
            return Err("end must be strictly after start".to_string());
        }
        if headcount == 0 {
            return Err("headcount must be at least 1".to_string());
        }
        Ok(Self {
            id: ShiftId::random(),
            name,
            start,
            end,
            role,
            headcount,
        })
    }

    pub fn with_id(mut self, id: ShiftId) -> Self {
        self.id = id;
        self
    }

    pub fn window(&self) -> TimeWindow {
        TimeWindow {
            start: self.start,
            end: self.end,
        }
    }

    /// Durée en minutes.
    pub fn duration_minutes(&self) -> i64 {
        (self.end - self.start).num_minutes()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Proposed,
    Confirmed,
    Cancelled,
}

impl AssignmentStatus {
    /// Une affectation active occupe le participant (proposée ou confirmée).
    pub fn is_active(self) -> bool {
        !matches!(self, AssignmentStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AssignmentStatus::Proposed => "proposed",
            AssignmentStatus::Confirmed => "confirmed",
            AssignmentStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Assignment {
    pub shift: ShiftId,
    pub participant: ParticipantId,
    pub status: AssignmentStatus,
    /// Commentaire laissé lors de la confirmation ou de l'annulation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl Assignment {
    pub fn proposed(shift: ShiftId, participant: ParticipantId) -> Self {
        Self {
            shift,
            participant,
            status: AssignmentStatus::Proposed,
            note: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status.is_active()
    }
}

/// État complet et versionné : créneaux, participants, affectations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Snapshot {
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub shifts: Vec<Shift>,
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub assignments: Vec<Assignment>,
    /// Déficit déjà signalé par créneau non pourvu.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub unfilled: BTreeMap<ShiftId, u32>,
}

impl Snapshot {
    pub fn find_participant_by_handle<'a>(&'a self, handle: &str) -> Option<&'a Participant> {
        self.participants.iter().find(|p| p.handle == handle)
    }
    pub fn find_participant(&self, id: &ParticipantId) -> Option<&Participant> {
        self.participants.iter().find(|p| &p.id == id)
    }
    pub fn find_participant_mut(&mut self, id: &ParticipantId) -> Option<&mut Participant> {
        self.participants.iter_mut().find(|p| &p.id == id)
    }
    pub fn find_shift(&self, id: &ShiftId) -> Option<&Shift> {
        self.shifts.iter().find(|s| &s.id == id)
    }
    pub fn find_assignment(&self, shift: &ShiftId, participant: &ParticipantId) -> Option<&Assignment> {
        self.assignments
            .iter()
            .find(|a| &a.shift == shift && &a.participant == participant)
    }

    /// Affectations actives d'un créneau.
    pub fn active_for_shift<'a>(&'a self, shift: &'a ShiftId) -> impl Iterator<Item = &'a Assignment> + 'a {
        self.assignments
            .iter()
            .filter(move |a| a.is_active() && &a.shift == shift)
    }

    /// Affectations actives d'un participant.
    pub fn active_for_participant<'a>(
        &'a self,
        participant: &'a ParticipantId,
    ) -> impl Iterator<Item = &'a Assignment> + 'a {
        self.assignments
            .iter()
            .filter(move |a| a.is_active() && &a.participant == participant)
    }

    /// Affectations proposées en attente de décision, par début de créneau.
    /// `participant` restreint la liste à une personne.
    pub fn pending(&self, participant: Option<&ParticipantId>) -> Vec<(&Shift, &Assignment)> {
        let mut rows: Vec<(&Shift, &Assignment)> = self
            .assignments
            .iter()
            .filter(|a| a.status == AssignmentStatus::Proposed)
            .filter(|a| participant.map_or(true, |p| &a.participant == p))
            .filter_map(|a| Some((self.find_shift(&a.shift)?, a)))
            .collect();
        rows.sort_by(|(sa, aa), (sb, ab)| {
            (sa.start, &sa.id, &aa.participant).cmp(&(sb.start, &sb.id, &ab.participant))
        });
        rows
    }

    /// Affectations d'une personne (tous statuts) sur les créneaux qui
    /// commencent à partir de `since`, dans l'ordre chronologique.
    pub fn recent(&self, participant: &ParticipantId, since: DateTime<Utc>) -> Vec<(&Shift, &Assignment)> {
        let mut rows: Vec<(&Shift, &Assignment)> = self
            .assignments
            .iter()
            .filter(|a| &a.participant == participant)
            .filter_map(|a| Some((self.find_shift(&a.shift)?, a)))
            .filter(|(s, _)| s.start >= since)
            .collect();
        rows.sort_by(|(sa, _), (sb, _)| (sa.start, &sa.id).cmp(&(sb.start, &sb.id)));
        rows
    }

    /// Contrôle structurel : identifiants uniques, fenêtres valides,
    /// références résolues, une seule ligne par couple (créneau, participant).
    pub fn validate(&self) -> Result<(), String> {
        let mut shift_ids = BTreeSet::new();
        for shift in &self.shifts {
            if !shift_ids.insert(&shift.id) {
                return Err(format!("duplicate shift id {}", shift.id));
            }
            if shift.end <= shift.start {
                return Err(format!("shift {} ends before it starts", shift.id));
            }
            if shift.headcount == 0 {
                return Err(format!("shift {} has a zero headcount", shift.id));
            }
        }

        let mut participant_ids = BTreeSet::new();
        let mut handles = BTreeSet::new();
        for participant in &self.participants {
            if !participant_ids.insert(&participant.id) {
                return Err(format!("duplicate participant id {}", participant.id));
            }
            if !handles.insert(participant.handle.as_str()) {
                return Err(format!("duplicate participant handle {}", participant.handle));
            }
            for (idx, w) in participant.unavailable.iter().enumerate() {
                if !w.is_valid() {
                    return Err(format!("participant {} has an invalid window", participant.id));
                }
                if participant.unavailable.iter().skip(idx + 1).any(|o| o.overlaps(w)) {
                    return Err(format!(
                        "participant {} has overlapping unavailable windows",
                        participant.id
                    ));
                }
            }
        }

        let mut pairs = BTreeSet::new();
        for a in &self.assignments {
            if !shift_ids.contains(&a.shift) {
                return Err(format!("assignment references unknown shift {}", a.shift));
            }
            if !participant_ids.contains(&a.participant) {
                return Err(format!(
                    "assignment references unknown participant {}",
                    a.participant
                ));
            }
            if !pairs.insert((&a.shift, &a.participant)) {
                return Err(format!(
                    "duplicate assignment for shift {} and participant {}",
                    a.shift, a.participant
                ));
            }
        }
        Ok(())
    }
}

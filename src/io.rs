use crate::model::{Participant, ParticipantId, Role, Shift, ShiftId, Snapshot, TimeWindow};
use anyhow::{bail, Context};
use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use csv::{ReaderBuilder, StringRecord, WriterBuilder};
use std::fs;
use std::path::Path;

fn field<'a>(rec: &'a StringRecord, idx: usize) -> Option<&'a str> {
    rec.get(idx).map(str::trim).filter(|s| !s.is_empty())
}

/// Import de participants depuis CSV :
/// header `handle,display_name,roles[,unavailable][,id]`.
///
/// `roles` est une liste séparée par `|`, `unavailable` une liste de
/// périodes séparées par `;` (`début/fin` ou `début..fin`, ou une date seule).
pub fn import_participants_csv<P: AsRef<Path>>(path: P) -> anyhow::Result<Vec<Participant>> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;
    let mut out = Vec::new();
    for rec in rdr.records() {
        let rec = rec?;
        let handle = field(&rec, 0).context("missing handle")?;
        let display = field(&rec, 1).context("missing display_name")?;
        let mut participant = Participant::new(handle, display);
        if let Some(roles) = field(&rec, 2) {
            participant.roles = roles
                .split('|')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(Role::new)
                .collect();
        }
        if let Some(ranges) = field(&rec, 3) {
            participant.unavailable = parse_windows(ranges)
                .with_context(|| format!("invalid unavailable value for handle {handle}"))?;
        }
        if let Some(id) = field(&rec, 4) {
            participant.id = ParticipantId::new(id);
        }
        out.push(participant);
    }
    Ok(out)
}

/// Liste de périodes séparées par `;`.
pub fn parse_windows(raw: &str) -> anyhow::Result<Vec<TimeWindow>> {
    raw.split(';')
        .filter(|chunk| !chunk.trim().is_empty())
        .map(|chunk| parse_window(chunk.trim()))
        .collect()
}

/// `début/fin`, `début..fin` ou une date seule (journée entière). Une fin
/// donnée en date seule inclut la journée.
pub fn parse_window(chunk: &str) -> anyhow::Result<TimeWindow> {
    if let Some((start_raw, end_raw)) = chunk.split_once('/').or_else(|| chunk.split_once("..")) {
        let (start, _) = parse_point(start_raw.trim())?;
        let (mut end, end_was_date) = parse_point(end_raw.trim())?;
        if end_was_date {
            end += Duration::days(1);
        }
        Ok(TimeWindow::new(start, end)?)
    } else {
        let (start, _) = parse_point(chunk)?;
        Ok(TimeWindow::new(start, start + Duration::days(1))?)
    }
}

const DATE_FORMATS: [&str; 4] = ["%Y-%m-%d", "%d.%m.%Y", "%d-%m-%Y", "%Y.%m.%d"];
const DATETIME_FORMATS: [&str; 2] = ["%d.%m.%Y %H:%M", "%Y-%m-%d %H:%M"];

/// Instant UTC : RFC3339, `JJ.MM.AAAA HH:MM`, ou date seule (minuit).
/// Le booléen indique une date sans heure.
pub fn parse_point(raw: &str) -> anyhow::Result<(DateTime<Utc>, bool)> {
    if let Ok(dt) = raw.parse::<DateTime<Utc>>() {
        return Ok((dt, false));
    }
    for fmt in DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Ok((Utc.from_utc_datetime(&naive), false));
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(raw, fmt) {
            let midnight = date
                .and_hms_opt(0, 0, 0)
                .context("invalid midnight conversion")?;
            return Ok((Utc.from_utc_datetime(&midnight), true));
        }
    }
    bail!("invalid date/datetime: {raw}")
}

/// Import de shifts : header `name,start,end,role[,headcount][,id]`.
pub fn import_shifts_csv<P: AsRef<Path>>(path: P) -> anyhow::Result<Vec<Shift>> {
    let mut rdr = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)?;
    let mut out = Vec::new();
    for rec in rdr.records() {
        let rec = rec?;
        let name = field(&rec, 0).context("missing name")?.to_string();
        let (start, _) = parse_point(field(&rec, 1).context("missing start")?).context("start")?;
        let (end, _) = parse_point(field(&rec, 2).context("missing end")?).context("end")?;
        let role = Role::new(field(&rec, 3).context("missing role")?);
        let headcount = match field(&rec, 4) {
            Some(raw) => raw
                .parse::<u32>()
                .with_context(|| format!("invalid headcount for shift {name}"))?,
            None => 1,
        };
        let mut shift =
            Shift::new(name, start, end, role, headcount).map_err(anyhow::Error::msg)?;
        if let Some(id) = field(&rec, 5) {
            shift.id = ShiftId::new(id);
        }
        out.push(shift);
    }
    Ok(out)
}

/// Export JSON du snapshot (jolie mise en forme)
pub fn export_snapshot_json<P: AsRef<Path>>(path: P, snapshot: &Snapshot) -> anyhow::Result<()> {
    let s = serde_json::to_string_pretty(snapshot)?;
    fs::write(path, s)?;
    Ok(())
}

/// Affectations d'un créneau au format `handle:statut|handle:statut`.
pub fn describe_assignments(snapshot: &Snapshot, shift: &ShiftId) -> String {
    snapshot
        .assignments
        .iter()
        .filter(|a| &a.shift == shift)
        .map(|a| {
            let handle = snapshot
                .find_participant(&a.participant)
                .map(|p| p.handle.as_str())
                .unwrap_or(a.participant.as_str());
            format!("{handle}:{}", a.status.as_str())
        })
        .collect::<Vec<_>>()
        .join("|")
}

/// Export CSV des shifts : header `id,name,start,end,role,headcount,assignments`
pub fn export_shifts_csv<P: AsRef<Path>>(path: P, snapshot: &Snapshot) -> anyhow::Result<()> {
    let mut w = WriterBuilder::new().has_headers(true).from_path(path)?;
    w.write_record(["id", "name", "start", "end", "role", "headcount", "assignments"])?;
    for s in &snapshot.shifts {
        let start = s.start.to_rfc3339();
        let end = s.end.to_rfc3339();
        let headcount = s.headcount.to_string();
        let assignments = describe_assignments(snapshot, &s.id);
        w.write_record([
            s.id.as_str(),
            s.name.as_str(),
            start.as_str(),
            end.as_str(),
            s.role.as_str(),
            headcount.as_str(),
            assignments.as_str(),
        ])?;
    }
    w.flush()?;
    Ok(())
}

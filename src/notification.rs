use crate::event::{ChangeEvent, ChangeKind};
use crate::model::{Participant, ParticipantId, Shift, Snapshot};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Destinataire d'un message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Recipient {
    Participant { id: ParticipantId, handle: String },
    /// Canal des responsables (créneaux non pourvus).
    Operators,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub recipient: Recipient,
    pub subject: String,
    pub body: String,
}

/// Permet de customiser le rendu des messages (texte, chat, mail...).
pub trait MessageRenderer: Send + Sync {
    fn render(&self, event: &ChangeEvent, snapshot: &Snapshot) -> Message;
    fn render_reminder(&self, person: &Participant, shift: &Shift, notice_at: DateTime<Utc>) -> Message;
}

/// Gabarit texte simple.
#[derive(Debug, Default, Clone, Copy)]
pub struct TextRenderer;

fn recipient_for(event: &ChangeEvent, snapshot: &Snapshot) -> (Recipient, String) {
    match &event.participant {
        Some(id) => match snapshot.find_participant(id) {
            Some(p) => (
                Recipient::Participant {
                    id: p.id.clone(),
                    handle: p.handle.clone(),
                },
                p.display_name.clone(),
            ),
            None => (
                Recipient::Participant {
                    id: id.clone(),
                    handle: id.as_str().to_string(),
                },
                id.as_str().to_string(),
            ),
        },
        None => (Recipient::Operators, "l'équipe".to_string()),
    }
}

fn describe_shift(event: &ChangeEvent, snapshot: &Snapshot) -> String {
    match snapshot.find_shift(&event.shift) {
        Some(s) => format!(
            "\"{name}\" ({role}) du {start} au {end}",
            name = s.name,
            role = s.role,
            start = s.start.to_rfc3339(),
            end = s.end.to_rfc3339()
        ),
        None => format!("#{}", event.shift),
    }
}

impl MessageRenderer for TextRenderer {
    fn render(&self, event: &ChangeEvent, snapshot: &Snapshot) -> Message {
        let (recipient, name) = recipient_for(event, snapshot);
        let shift = describe_shift(event, snapshot);
        let (subject, mut body) = match &event.kind {
            ChangeKind::Created => (
                format!("Nouvelle affectation : {}", event.shift),
                format!(
                    "Bonjour {name},\n\nTu es proposé·e pour le créneau {shift}.\nMerci de confirmer ta présence.\n"
                ),
            ),
            ChangeKind::Confirmed => (
                format!("Affectation confirmée : {}", event.shift),
                format!("Bonjour {name},\n\nTa présence sur le créneau {shift} est confirmée.\n"),
            ),
            ChangeKind::Cancelled { reason } => (
                format!("Affectation annulée : {}", event.shift),
                format!(
                    "Bonjour {name},\n\nTon affectation au créneau {shift} est annulée (motif : {}).\n",
                    reason.as_str()
                ),
            ),
            ChangeKind::Unfilled { missing } => (
                format!("Créneau incomplet : {}", event.shift),
                format!(
                    "Bonjour {name},\n\nLe créneau {shift} manque encore de {missing} personne(s).\nAucun participant éligible n'est disponible.\n"
                ),
            ),
        };
        if let Some(note) = &event.note {
            body.push_str(&format!("\nCommentaire : {note}\n"));
        }
        Message {
            recipient,
            subject,
            body,
        }
    }

    fn render_reminder(&self, person: &Participant, shift: &Shift, notice_at: DateTime<Utc>) -> Message {
        Message {
            recipient: Recipient::Participant {
                id: person.id.clone(),
                handle: person.handle.clone(),
            },
            subject: format!("Rappel : {}", shift.name),
            body: format!(
                "Bonjour {name},\n\nTu es attendu·e sur le créneau \"{shift}\" ({role}) du {start} au {end}.\nCe message est généré le {notice}.\n",
                name = person.display_name,
                shift = shift.name,
                role = shift.role,
                start = shift.start.to_rfc3339(),
                end = shift.end.to_rfc3339(),
                notice = notice_at.to_rfc3339()
            ),
        }
    }
}

/// Représente un rappel généré pour une personne.
#[derive(Debug, Clone)]
pub struct Reminder {
    pub participant_handle: String,
    pub shift_id: String,
    pub notice_at: DateTime<Utc>,
    pub message: Message,
}

/// Prépare un rappel pour la prochaine affectation active d'une personne.
pub fn prepare_reminder(
    snapshot: &Snapshot,
    handle: &str,
    lead: Duration,
    now: DateTime<Utc>,
    renderer: &dyn MessageRenderer,
) -> Result<Reminder> {
    if lead < Duration::zero() {
        bail!("reminder lead time cannot be negative");
    }

    let person = snapshot
        .find_participant_by_handle(handle)
        .with_context(|| format!("unknown participant handle: {handle}"))?;

    let shift = snapshot
        .active_for_participant(&person.id)
        .filter_map(|a| snapshot.find_shift(&a.shift))
        .filter(|shift| shift.start >= now)
        .min_by(|a, b| (a.start, &a.id).cmp(&(b.start, &b.id)))
        .with_context(|| format!("no upcoming shift found for handle {handle}"))?;

    let notice_at = shift.start - lead;
    let message = renderer.render_reminder(person, shift, notice_at);
    Ok(Reminder {
        participant_handle: person.handle.clone(),
        shift_id: shift.id.as_str().to_string(),
        notice_at,
        message,
    })
}

//! Canaux de livraison : une seule capacité, `send(message)`.
//!
//! Le protocole réel (chat, mail, SMS) reste hors de la bibliothèque ; on
//! fournit une sortie standard et une boîte d'envoi JSON lines.

use crate::notification::Message;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeliveryReceipt {
    pub channel: &'static str,
    pub reference: String,
    pub delivered_at: DateTime<Utc>,
}

impl DeliveryReceipt {
    pub fn new(channel: &'static str) -> Self {
        Self {
            channel,
            reference: Uuid::new_v4().to_string(),
            delivered_at: Utc::now(),
        }
    }
}

#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("message rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait DeliveryChannel: Send + Sync {
    async fn send(&self, message: &Message) -> Result<DeliveryReceipt, DeliveryError>;
}

/// Écriture bloquante déportée hors des threads du runtime.
async fn blocking<F>(write: F) -> Result<(), DeliveryError>
where
    F: FnOnce() -> std::io::Result<()> + Send + 'static,
{
    tokio::task::spawn_blocking(write)
        .await
        .map_err(|err| DeliveryError::Transport(err.to_string()))?
        .map_err(DeliveryError::from)
}

/// Affiche les messages sur la sortie standard.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutChannel;

#[async_trait]
impl DeliveryChannel for StdoutChannel {
    async fn send(&self, message: &Message) -> Result<DeliveryReceipt, DeliveryError> {
        let text = format!("== {}\n{}\n", message.subject, message.body);
        blocking(move || {
            let mut out = std::io::stdout().lock();
            out.write_all(text.as_bytes())?;
            out.flush()
        })
        .await?;
        Ok(DeliveryReceipt::new("stdout"))
    }
}

#[derive(Serialize)]
struct OutboxLine<'a> {
    reference: &'a str,
    queued_at: DateTime<Utc>,
    #[serde(flatten)]
    message: &'a Message,
}

/// Ajoute chaque message en JSON lines dans un fichier relu par une passerelle.
#[derive(Debug)]
pub struct OutboxChannel {
    path: PathBuf,
    // sérialise les ajouts, y compris ceux d'un envoi abandonné
    lock: Arc<Mutex<()>>,
}

impl OutboxChannel {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock: Arc::new(Mutex::new(())),
        }
    }
}

#[async_trait]
impl DeliveryChannel for OutboxChannel {
    async fn send(&self, message: &Message) -> Result<DeliveryReceipt, DeliveryError> {
        let receipt = DeliveryReceipt::new("outbox");
        let line = serde_json::to_string(&OutboxLine {
            reference: &receipt.reference,
            queued_at: receipt.delivered_at,
            message,
        })
        .map_err(|err| DeliveryError::Rejected(err.to_string()))?;

        let guard = self.lock.clone().lock_owned().await;
        let path = self.path.clone();
        blocking(move || {
            let _guard = guard;
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            writeln!(file, "{line}")?;
            file.sync_data()
        })
        .await?;
        Ok(receipt)
    }
}

use crate::channel::{DeliveryChannel, DeliveryReceipt};
use crate::event::ChangeEvent;
use crate::model::Snapshot;
use crate::notification::{Message, MessageRenderer, TextRenderer};
use crate::retry::{retry, RetryPolicy};
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Delivered { receipt: DeliveryReceipt },
    Undelivered { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchResult {
    pub event: ChangeEvent,
    pub attempts: u32,
    pub outcome: DeliveryOutcome,
}

impl DispatchResult {
    pub fn is_delivered(&self) -> bool {
        matches!(self.outcome, DeliveryOutcome::Delivered { .. })
    }
}

/// Traduit les changements en messages et les envoie sur le canal.
///
/// Les envois partent en parallèle ; chaque échec est relancé selon la
/// politique puis signalé `undelivered` sans bloquer les autres.
#[derive(Clone)]
pub struct Dispatcher {
    channel: Arc<dyn DeliveryChannel>,
    renderer: Arc<dyn MessageRenderer>,
    retry: RetryPolicy,
    send_timeout: Duration,
}

impl Dispatcher {
    pub fn new(channel: Arc<dyn DeliveryChannel>, retry: RetryPolicy, send_timeout: Duration) -> Self {
        Self {
            channel,
            renderer: Arc::new(TextRenderer),
            retry,
            send_timeout,
        }
    }

    pub fn with_renderer(mut self, renderer: Arc<dyn MessageRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    pub fn renderer(&self) -> &dyn MessageRenderer {
        self.renderer.as_ref()
    }

    /// Un résultat par événement, dans l'ordre des événements.
    pub async fn dispatch(&self, snapshot: &Snapshot, events: &[ChangeEvent]) -> Vec<DispatchResult> {
        let sends = events.iter().map(|event| {
            let message = self.renderer.render(event, snapshot);
            async move {
                let (attempts, outcome) = match self.deliver(&message).await {
                    Ok((receipt, attempts)) => (attempts, DeliveryOutcome::Delivered { receipt }),
                    Err((error, attempts)) => {
                        tracing::warn!(
                            shift = %event.shift,
                            kind = event.label(),
                            attempts,
                            %error,
                            "notification undelivered"
                        );
                        (attempts, DeliveryOutcome::Undelivered { error })
                    }
                };
                DispatchResult {
                    event: event.clone(),
                    attempts,
                    outcome,
                }
            }
        });
        join_all(sends).await
    }

    /// Envoie un message isolé (rappels), avec la même politique de relance.
    pub async fn deliver(&self, message: &Message) -> Result<(DeliveryReceipt, u32), (String, u32)> {
        retry(&self.retry, self.send_timeout, "send", || self.channel.send(message))
            .await
            .map(|ok| (ok.value, ok.attempts))
            .map_err(|exhausted| (exhausted.last.to_string(), exhausted.attempts))
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("retry", &self.retry)
            .field("send_timeout", &self.send_timeout)
            .finish_non_exhaustive()
    }
}

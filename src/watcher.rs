//! Long-lived trigger subscriptions.
//!
//! One loop per trigger kind keeps a watch open, reopens it whenever the
//! stream ends, and hands decoded triggers to a [`TriggerHandler`]. Handlers
//! run inline, so runs of the same kind never overlap.
use crate::{
    apis::trigger_types::{TriggerEvent, TriggerKind},
    store::{EventKind, EventSource, StoreEvent},
    Result,
};
use async_trait::async_trait;
use futures::StreamExt;
#[cfg(test)]
use mockall::automock;
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[cfg_attr(test, automock)]
#[async_trait]
pub trait TriggerHandler: Send + Sync {
    async fn handle(&self, event: TriggerEvent) -> Result<()>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionState {
    Disconnected,
    Connecting,
    Active,
    Broken,
}

/// Which raw events start work for a trigger kind
pub fn dispatches(kind: TriggerKind, event: EventKind) -> bool {
    match kind {
        TriggerKind::Backup => matches!(event, EventKind::Added | EventKind::Modified),
        TriggerKind::Restore => matches!(event, EventKind::Added),
    }
}

pub struct SubscriptionManager {
    source: Arc<dyn EventSource>,
    handler: Arc<dyn TriggerHandler>,
    resubscribe_delay: Duration,
    states: Mutex<HashMap<TriggerKind, SubscriptionState>>,
}

impl SubscriptionManager {
    pub fn new(
        source: Arc<dyn EventSource>,
        handler: Arc<dyn TriggerHandler>,
        resubscribe_delay: Duration,
    ) -> Self {
        Self {
            source,
            handler,
            resubscribe_delay,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn state(&self, kind: TriggerKind) -> SubscriptionState {
        self.states
            .lock()
            .get(&kind)
            .copied()
            .unwrap_or(SubscriptionState::Disconnected)
    }

    fn set_state(&self, kind: TriggerKind, state: SubscriptionState) {
        debug!("{} subscription is {:?}", kind, state);
        self.states.lock().insert(kind, state);
    }

    /// Run both subscriptions until `cancel` fires.
    ///
    /// Cancellation is observed between events: a handler that is already
    /// running is allowed to finish.
    pub async fn run(&self, cancel: CancellationToken) {
        tokio::join!(
            self.run_subscription(TriggerKind::Backup, cancel.clone()),
            self.run_subscription(TriggerKind::Restore, cancel),
        );
    }

    async fn run_subscription(&self, kind: TriggerKind, cancel: CancellationToken) {
        info!("Starting {} trigger subscription", kind);
        loop {
            self.set_state(kind, SubscriptionState::Connecting);
            let opened = tokio::select! {
                _ = cancel.cancelled() => break,
                opened = self.source.subscribe(kind) => opened,
            };
            let mut stream = match opened {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("Failed to open {} subscription: {}", kind, e);
                    if self.pause(&cancel).await {
                        continue;
                    }
                    break;
                }
            };

            self.set_state(kind, SubscriptionState::Active);
            loop {
                let next = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => None,
                    next = stream.next() => Some(next),
                };
                match next {
                    // cancelled
                    None => {
                        drop(stream);
                        self.set_state(kind, SubscriptionState::Disconnected);
                        info!("Stopped {} trigger subscription", kind);
                        return;
                    }
                    Some(None) => break,
                    Some(Some(event)) => self.dispatch(kind, event).await,
                }
            }

            warn!("{} subscription stream closed, resubscribing", kind);
            self.set_state(kind, SubscriptionState::Broken);
            drop(stream);
            self.set_state(kind, SubscriptionState::Disconnected);
            if !self.pause(&cancel).await {
                break;
            }
        }
        self.set_state(kind, SubscriptionState::Disconnected);
        info!("Stopped {} trigger subscription", kind);
    }

    /// Wait before reconnecting; false when cancelled meanwhile
    async fn pause(&self, cancel: &CancellationToken) -> bool {
        tokio::select! {
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(self.resubscribe_delay) => true,
        }
    }

    async fn dispatch(&self, kind: TriggerKind, event: StoreEvent) {
        if !dispatches(kind, event.kind) {
            debug!("Ignoring {:?} event on {} subscription", event.kind, kind);
            return;
        }
        let trigger = match TriggerEvent::decode(kind, event.object) {
            Ok(trigger) => trigger,
            Err(e) => {
                warn!("Discarding undecodable {} event: {}", kind, e);
                return;
            }
        };
        if let Err(e) = self.handler.handle(trigger.clone()).await {
            error!(
                "Handling {} {}/{} failed: {}",
                kind, trigger.namespace, trigger.name, e
            );
        }
    }
}

//! Event types and the bounded in-process pub/sub bus.
//!
//! A dispatcher task (`tokio::spawn`'d loop guarded by its own state) feeds a
//! `RwLock`-guarded list of handlers, the same background-task-plus-guarded-
//! registry shape used elsewhere in this workspace.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::CoreError;

const DEFAULT_CAPACITY: usize = 100;
const PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);
const HANDLER_TIMEOUT: Duration = Duration::from_secs(30);
const STOP_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    ImagePushed,
    ImageDeleted,
    ConfigReload,
    ManualReload,
    ContainerStart,
    ContainerStop,
    ContainerHealthCheck,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    ImagePushed {
        name: String,
        reference: String,
        annotations: Option<HashMap<String, String>>,
    },
    ImageDeleted {
        name: String,
        reference: String,
    },
    ConfigReload,
    ManualReload,
    ContainerStart {
        route: String,
    },
    ContainerStop {
        route: String,
    },
    ContainerHealthCheck {
        route: String,
        healthy: bool,
    },
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::ImagePushed { .. } => EventType::ImagePushed,
            Self::ImageDeleted { .. } => EventType::ImageDeleted,
            Self::ConfigReload => EventType::ConfigReload,
            Self::ManualReload => EventType::ManualReload,
            Self::ContainerStart { .. } => EventType::ContainerStart,
            Self::ContainerStop { .. } => EventType::ContainerStop,
            Self::ContainerHealthCheck { .. } => EventType::ContainerHealthCheck,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: chrono::Utc::now(),
            payload,
        }
    }

    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }
}

#[async_trait]
pub trait Handler: Send + Sync {
    fn can_handle(&self, event_type: EventType) -> bool;
    async fn handle(&self, event: &Event) -> Result<(), CoreError>;
    /// Used only for log lines; handlers are otherwise anonymous to the bus.
    fn name(&self) -> &str;
}

struct Inner {
    sender: Mutex<Option<mpsc::Sender<Event>>>,
    dispatcher: Mutex<Option<tokio::task::JoinHandle<()>>>,
    handlers: RwLock<Vec<Arc<dyn Handler>>>,
    dropped: AtomicU64,
}

/// Process-local, topic-less publish/subscribe bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
    capacity: usize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                sender: Mutex::new(None),
                dispatcher: Mutex::new(None),
                handlers: RwLock::new(Vec::new()),
                dropped: AtomicU64::new(0),
            }),
            capacity,
        }
    }

    pub fn subscribe(&self, handler: Arc<dyn Handler>) {
        debug!(handler = handler.name(), "subscribed handler");
        self.inner.handlers.write().push(handler);
    }

    pub fn unsubscribe(&self, name: &str) {
        self.inner.handlers.write().retain(|h| h.name() != name);
    }

    pub fn dropped_count(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }

    /// Start the dispatcher task. Idempotent: calling `start` twice is a no-op.
    pub async fn start(&self) {
        let mut sender_guard = self.inner.sender.lock().await;
        if sender_guard.is_some() {
            return;
        }

        let (tx, mut rx) = mpsc::channel::<Event>(self.capacity);
        let inner = self.inner.clone();

        let dispatcher = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                dispatch(&inner.handlers, event).await;
            }
            debug!("event bus dispatcher drained and exiting");
        });

        *sender_guard = Some(tx);
        *self.inner.dispatcher.lock().await = Some(dispatcher);
        debug!(capacity = self.capacity, "event bus started");
    }

    pub async fn publish(&self, payload: EventPayload) -> Result<(), CoreError> {
        let event = Event::new(payload);
        let event_type = event.event_type();

        let sender = {
            let guard = self.inner.sender.lock().await;
            guard.clone().ok_or(CoreError::BusStopped)?
        };

        match timeout(PUBLISH_TIMEOUT, sender.send(event)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(CoreError::BusStopped),
            Err(_) => {
                self.inner.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("gordon_event_bus_dropped_total").increment(1);
                warn!(?event_type, "event dropped: publish buffer full");
                Err(CoreError::BufferFull)
            }
        }
    }

    /// Cancel the dispatcher and wait up to 5s for in-flight handlers.
    pub async fn stop(&self) -> Result<(), CoreError> {
        let sender = self.inner.sender.lock().await.take();
        drop(sender); // closes the channel, letting the dispatcher drain and exit

        let dispatcher = self.inner.dispatcher.lock().await.take();
        if let Some(handle) = dispatcher {
            match tokio::time::timeout(STOP_DRAIN_TIMEOUT, handle).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(err)) => {
                    error!(?err, "event bus dispatcher task panicked");
                    Ok(())
                }
                Err(_) => Err(CoreError::StopTimeout),
            }
        } else {
            Ok(())
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

async fn dispatch(handlers: &RwLock<Vec<Arc<dyn Handler>>>, event: Event) {
    let snapshot: Vec<Arc<dyn Handler>> = handlers
        .read()
        .iter()
        .filter(|h| h.can_handle(event.event_type()))
        .cloned()
        .collect();

    for handler in snapshot {
        let event = event.clone();
        tokio::spawn(async move {
            match timeout(HANDLER_TIMEOUT, handler.handle(&event)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    error!(handler = handler.name(), ?err, event_id = %event.id, "handler error");
                }
                Err(_) => {
                    error!(handler = handler.name(), event_id = %event.id, "handler timed out");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingHandler {
        count: Arc<AtomicUsize>,
        interested_in: EventType,
    }

    #[async_trait]
    impl Handler for CountingHandler {
        fn can_handle(&self, event_type: EventType) -> bool {
            event_type == self.interested_in
        }

        async fn handle(&self, _event: &Event) -> Result<(), CoreError> {
            self.count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn name(&self) -> &str {
            "counting-handler"
        }
    }

    #[tokio::test]
    async fn publish_dispatches_to_matching_handlers_only() {
        let bus = EventBus::new();
        bus.start().await;

        let matches = Arc::new(AtomicUsize::new(0));
        let ignores = Arc::new(AtomicUsize::new(0));

        bus.subscribe(Arc::new(CountingHandler {
            count: matches.clone(),
            interested_in: EventType::ImagePushed,
        }));
        bus.subscribe(Arc::new(CountingHandler {
            count: ignores.clone(),
            interested_in: EventType::ConfigReload,
        }));

        bus.publish(EventPayload::ImagePushed {
            name: "app".to_string(),
            reference: "latest".to_string(),
            annotations: None,
        })
        .await
        .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(matches.load(Ordering::SeqCst), 1);
        assert_eq!(ignores.load(Ordering::SeqCst), 0);

        bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn publish_without_start_returns_bus_stopped() {
        let bus = EventBus::new();
        let err = bus.publish(EventPayload::ManualReload).await.unwrap_err();
        assert!(matches!(err, CoreError::BusStopped));
    }

    #[tokio::test]
    async fn saturation_drops_excess_events_without_deadlock() {
        let bus = EventBus::with_capacity(2);
        bus.start().await;

        struct SlowHandler;
        #[async_trait]
        impl Handler for SlowHandler {
            fn can_handle(&self, _event_type: EventType) -> bool {
                true
            }
            async fn handle(&self, _event: &Event) -> Result<(), CoreError> {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(())
            }
            fn name(&self) -> &str {
                "slow-handler"
            }
        }
        bus.subscribe(Arc::new(SlowHandler));

        let mut dropped = 0;
        for _ in 0..20 {
            if bus.publish(EventPayload::ManualReload).await.is_err() {
                dropped += 1;
            }
        }

        // With a slow dispatcher draining a small buffer, some sends succeed and
        // some may time out; the call must never hang regardless.
        assert!(dropped <= 20);
        bus.stop().await.unwrap();
    }
}

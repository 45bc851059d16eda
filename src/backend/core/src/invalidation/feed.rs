//! Change-feed subscriptions.
//!
//! A [`ChangeFeed`] delivers [`ChangeEvent`]s for one resource to a callback
//! until the returned handle is unsubscribed. [`BroadcastChangeFeed`] is the
//! in-process implementation used by the server binary and the tests.

use super::rule::{ChangeEvent, ChangeFilter};
use crate::error::Result;
use crate::telemetry::names;
use async_trait::async_trait;
use metrics::counter;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Default buffer of undelivered events per subscriber.
pub const DEFAULT_FEED_CAPACITY: usize = 1024;

/// Callback invoked for every delivered event.
pub type EventCallback = Arc<dyn Fn(ChangeEvent) + Send + Sync>;

/// What to subscribe to.
#[derive(Clone)]
pub struct SubscriptionRequest {
    pub resource: String,

    /// Feed-specific filter expression
    pub filter: Option<String>,

    pub on_event: EventCallback,
}

impl std::fmt::Debug for SubscriptionRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionRequest")
            .field("resource", &self.resource)
            .field("filter", &self.filter)
            .finish_non_exhaustive()
    }
}

/// A live subscription; events stop once it is unsubscribed.
pub trait SubscriptionHandle: Send + Sync {
    fn resource(&self) -> &str;

    fn unsubscribe(&self);
}

/// Source of change events.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, request: SubscriptionRequest) -> Result<Box<dyn SubscriptionHandle>>;

    fn name(&self) -> &'static str;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Broadcast Feed
// ═══════════════════════════════════════════════════════════════════════════════

/// In-process change feed over a tokio broadcast channel.
///
/// Filters of the form `field=eq.value` are matched against the top-level
/// payload field; any other filter string is ignored.
#[derive(Clone)]
pub struct BroadcastChangeFeed {
    sender: broadcast::Sender<ChangeEvent>,
}

impl BroadcastChangeFeed {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish an event, returning how many subscriptions received it.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        counter!(names::CHANGE_EVENTS, "resource" => event.resource.clone()).increment(1);
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for BroadcastChangeFeed {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}

#[async_trait]
impl ChangeFeed for BroadcastChangeFeed {
    async fn subscribe(&self, request: SubscriptionRequest) -> Result<Box<dyn SubscriptionHandle>> {
        let filter = match request.filter.as_deref() {
            Some(raw) => {
                let parsed = ChangeFilter::parse(raw);
                if parsed.is_none() {
                    debug!(filter = %raw, "Unrecognised feed filter, delivering all events");
                }
                parsed
            }
            None => None,
        };

        let mut receiver = self.sender.subscribe();
        let resource = request.resource.clone();
        let on_event = request.on_event;

        let task = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        if event.resource != resource {
                            continue;
                        }
                        if filter.as_ref().is_some_and(|f| !f.matches(&event)) {
                            continue;
                        }
                        on_event(event);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(resource = %resource, skipped = skipped, "Change feed subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        debug!(resource = %request.resource, "Broadcast subscription created");
        Ok(Box::new(BroadcastSubscription {
            resource: request.resource,
            task,
        }))
    }

    fn name(&self) -> &'static str {
        "broadcast"
    }
}

struct BroadcastSubscription {
    resource: String,
    task: JoinHandle<()>,
}

impl SubscriptionHandle for BroadcastSubscription {
    fn resource(&self) -> &str {
        &self.resource
    }

    fn unsubscribe(&self) {
        self.task.abort();
    }
}

impl Drop for BroadcastSubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invalidation::rule::ChangeKind;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;

    fn collector() -> (EventCallback, Arc<Mutex<Vec<ChangeEvent>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback: EventCallback = Arc::new(move |event| sink.lock().push(event));
        (callback, seen)
    }

    #[tokio::test]
    async fn test_delivers_only_subscribed_resource() {
        let feed = BroadcastChangeFeed::default();
        let (on_event, seen) = collector();
        let handle = feed
            .subscribe(SubscriptionRequest {
                resource: "listings".to_string(),
                filter: None,
                on_event,
            })
            .await
            .unwrap();
        assert_eq!(handle.resource(), "listings");

        feed.publish(ChangeEvent::new("listings", ChangeKind::Update));
        feed.publish(ChangeEvent::new("forum_posts", ChangeKind::Insert));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let seen = seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].resource, "listings");
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let feed = BroadcastChangeFeed::default();
        let (on_event, seen) = collector();
        let handle = feed
            .subscribe(SubscriptionRequest {
                resource: "listings".to_string(),
                filter: None,
                on_event,
            })
            .await
            .unwrap();

        handle.unsubscribe();
        tokio::time::sleep(Duration::from_millis(20)).await;
        feed.publish(ChangeEvent::new("listings", ChangeKind::Update));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(seen.lock().is_empty());
        assert_eq!(feed.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_payload_filter() {
        let feed = BroadcastChangeFeed::default();
        let (on_event, seen) = collector();
        let _handle = feed
            .subscribe(SubscriptionRequest {
                resource: "listings".to_string(),
                filter: Some("status=eq.active".to_string()),
                on_event,
            })
            .await
            .unwrap();

        let update = ChangeEvent::new("listings", ChangeKind::Update);
        feed.publish(update.clone().with_payload(json!({"status": "active"})));
        feed.publish(update.with_payload(json!({"status": "sold"})));
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(seen.lock().len(), 1);
    }
}

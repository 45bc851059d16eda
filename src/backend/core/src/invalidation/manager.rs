//! Rule-driven cache invalidation.
//!
//! The manager keeps a registry of [`InvalidationRule`]s, holds one change-feed
//! subscription per watched resource, and turns bursts of change events into a
//! single purge per resource once the feed has been quiet for the debounce
//! window.
//!
//! Debounce state (timers and pending rule sets) is owned by one actor task;
//! everything else talks to it over a channel. A resource under sustained
//! change traffic keeps resetting its timer, so its purge can be postponed
//! for as long as the traffic lasts.

use super::feed::{ChangeFeed, EventCallback, SubscriptionHandle, SubscriptionRequest};
use super::rule::{ChangeEvent, InvalidationAction, InvalidationRule};
use crate::cache::MultiLayerCache;
use crate::error::{BazaarError, Result};
use crate::telemetry::names;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use metrics::counter;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::time::delay_queue::{DelayQueue, Key as TimerKey};
use tracing::{debug, info, warn};

/// Default quiet period before a resource's pending rules run.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(1000);

/// Default number of invalidation records kept.
pub const DEFAULT_LOG_CAPACITY: usize = 1000;

// ═══════════════════════════════════════════════════════════════════════════════
// Configuration
// ═══════════════════════════════════════════════════════════════════════════════

/// Runtime configuration for [`InvalidationManager`].
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidationConfig {
    /// Trailing-edge debounce window per resource
    pub debounce: Duration,

    /// Bound on the recent-invalidations log
    pub log_capacity: usize,
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self {
            debounce: DEFAULT_DEBOUNCE,
            log_capacity: DEFAULT_LOG_CAPACITY,
        }
    }
}

impl InvalidationConfig {
    pub fn builder() -> InvalidationConfigBuilder {
        InvalidationConfigBuilder::default()
    }
}

/// Builder for [`InvalidationConfig`].
#[derive(Debug, Default)]
pub struct InvalidationConfigBuilder {
    config: InvalidationConfig,
}

impl InvalidationConfigBuilder {
    pub fn debounce(mut self, debounce: Duration) -> Self {
        self.config.debounce = debounce;
        self
    }

    pub fn log_capacity(mut self, capacity: usize) -> Self {
        self.config.log_capacity = capacity;
        self
    }

    pub fn build(self) -> InvalidationConfig {
        self.config
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Observer and Log
// ═══════════════════════════════════════════════════════════════════════════════

/// Receives the outcome of every rule execution.
///
/// `purged` is the number of distinct keys the rule removed from the cache.
pub trait InvalidationObserver: Send + Sync {
    fn record(&self, rule_id: &str, purged: u64);
}

/// Observer that discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl InvalidationObserver for NoopObserver {
    fn record(&self, _rule_id: &str, _purged: u64) {}
}

/// What triggered an invalidation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InvalidationTrigger {
    /// A rule fired after its resource's debounce window
    Debounced { resource: String, rule_id: String },

    /// A rule run by hand
    Rule { rule_id: String },

    Tag { tag: String },

    Pattern { pattern: String },
}

/// Log entry for one invalidation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvalidationRecord {
    pub trigger: InvalidationTrigger,

    /// Distinct keys removed
    pub purged: u64,

    pub timestamp: DateTime<Utc>,

    pub duration_ms: u64,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Debouncer
// ═══════════════════════════════════════════════════════════════════════════════

enum DebounceCommand {
    Change {
        event: ChangeEvent,
        rules: Vec<InvalidationRule>,
    },
    Stop,
}

struct Debouncer {
    commands: mpsc::UnboundedSender<DebounceCommand>,
    task: JoinHandle<()>,
}

/// Rules waiting on one resource, keyed by rule id, with the latest event that matched.
type PendingBatch = BTreeMap<String, (InvalidationRule, ChangeEvent)>;

async fn run_debouncer(
    manager: Weak<ManagerInner>,
    debounce: Duration,
    mut commands: mpsc::UnboundedReceiver<DebounceCommand>,
) {
    let mut timers: DelayQueue<String> = DelayQueue::new();
    let mut timer_keys: HashMap<String, TimerKey> = HashMap::new();
    let mut pending: HashMap<String, PendingBatch> = HashMap::new();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(DebounceCommand::Change { event, rules }) => {
                    let resource = event.resource.clone();
                    let batch = pending.entry(resource.clone()).or_default();
                    for rule in rules {
                        batch.insert(rule.id().to_string(), (rule, event.clone()));
                    }

                    match timer_keys.get(&resource) {
                        Some(key) => timers.reset(key, debounce),
                        None => {
                            let key = timers.insert(resource.clone(), debounce);
                            timer_keys.insert(resource, key);
                        }
                    }
                }
                Some(DebounceCommand::Stop) | None => break,
            },
            Some(expired) = timers.next(), if !timers.is_empty() => {
                let resource = expired.into_inner();
                timer_keys.remove(&resource);

                let Some(batch) = pending.remove(&resource) else {
                    continue;
                };
                let Some(inner) = manager.upgrade() else {
                    break;
                };
                let manager = InvalidationManager { inner };
                tokio::spawn(async move {
                    manager.execute_invalidations(&resource, batch).await;
                });
            }
        }
    }

    if !pending.is_empty() {
        debug!(resources = pending.len(), "Dropping pending invalidations on stop");
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Invalidation Manager
// ═══════════════════════════════════════════════════════════════════════════════

/// A resource's feed subscription and the filter it was opened with.
struct ActiveSubscription {
    filter: Option<String>,
    handle: Box<dyn SubscriptionHandle>,
}

type Subscriptions = HashMap<String, ActiveSubscription>;

struct ManagerInner {
    cache: MultiLayerCache,
    feed: Arc<dyn ChangeFeed>,
    observer: Arc<dyn InvalidationObserver>,
    config: InvalidationConfig,
    rules: DashMap<String, InvalidationRule>,
    subscriptions: tokio::sync::Mutex<HashMap<String, ActiveSubscription>>,
    running: AtomicBool,
    debouncer: parking_lot::Mutex<Option<Debouncer>>,
    log: parking_lot::Mutex<VecDeque<InvalidationRecord>>,
}

/// Purges cache entries in response to upstream data changes.
///
/// Cloning is cheap; clones share the rule registry and subscriptions. The
/// manager borrows the cache: dropping or stopping it leaves the cache and
/// any fetches in flight untouched.
#[derive(Clone)]
pub struct InvalidationManager {
    inner: Arc<ManagerInner>,
}

impl InvalidationManager {
    pub fn new(cache: MultiLayerCache, feed: Arc<dyn ChangeFeed>, config: InvalidationConfig) -> Self {
        Self::with_observer(cache, feed, config, Arc::new(NoopObserver))
    }

    pub fn with_observer(
        cache: MultiLayerCache,
        feed: Arc<dyn ChangeFeed>,
        config: InvalidationConfig,
        observer: Arc<dyn InvalidationObserver>,
    ) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                cache,
                feed,
                observer,
                config,
                rules: DashMap::new(),
                subscriptions: tokio::sync::Mutex::new(HashMap::new()),
                running: AtomicBool::new(false),
                debouncer: parking_lot::Mutex::new(None),
                log: parking_lot::Mutex::new(VecDeque::new()),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Rule Registry
    // ─────────────────────────────────────────────────────────────────────────

    /// Register a rule, replacing any rule with the same id.
    ///
    /// While running, the rule's resource is subscribed, or re-subscribed
    /// when the rule changes the filter its resource can be opened with.
    pub async fn add_rule(&self, rule: InvalidationRule) {
        let resource = rule.resource().to_string();
        let rule_id = rule.id().to_string();

        let mut subscriptions = self.inner.subscriptions.lock().await;
        let replaced = self.inner.rules.insert(rule_id.clone(), rule);
        info!(rule_id = %rule_id, resource = %resource, "Invalidation rule registered");

        if let Some(old) = replaced {
            if old.resource() != resource {
                self.sync_subscription(&mut subscriptions, old.resource()).await;
            }
        }
        self.sync_subscription(&mut subscriptions, &resource).await;
    }

    /// Unregister a rule, dropping its resource subscription if no other rule needs it.
    pub async fn remove_rule(&self, rule_id: &str) -> Option<InvalidationRule> {
        let mut subscriptions = self.inner.subscriptions.lock().await;
        let (_, rule) = self.inner.rules.remove(rule_id)?;
        self.sync_subscription(&mut subscriptions, rule.resource()).await;

        info!(rule_id = %rule_id, resource = %rule.resource(), "Invalidation rule removed");
        Some(rule)
    }

    /// Registered rules ordered by id.
    pub fn get_rules(&self) -> Vec<InvalidationRule> {
        let mut rules: Vec<InvalidationRule> =
            self.inner.rules.iter().map(|entry| entry.value().clone()).collect();
        rules.sort_by(|a, b| a.id().cmp(b.id()));
        rules
    }

    /// Resources with a live change-feed subscription.
    pub async fn subscribed_resources(&self) -> Vec<String> {
        let mut resources: Vec<String> = self.inner.subscriptions.lock().await.keys().cloned().collect();
        resources.sort();
        resources
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Subscribe to every resource referenced by a rule and begin debouncing.
    pub async fn start(&self) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return;
        }

        {
            let (commands, receiver) = mpsc::unbounded_channel();
            let task = tokio::spawn(run_debouncer(
                Arc::downgrade(&self.inner),
                self.inner.config.debounce,
                receiver,
            ));
            *self.inner.debouncer.lock() = Some(Debouncer { commands, task });
        }

        let mut subscriptions = self.inner.subscriptions.lock().await;
        let resources: BTreeSet<String> = self
            .inner
            .rules
            .iter()
            .map(|rule| rule.resource().to_string())
            .collect();
        for resource in resources {
            self.sync_subscription(&mut subscriptions, &resource).await;
        }

        info!(
            resources = subscriptions.len(),
            debounce_ms = self.inner.config.debounce.as_millis() as u64,
            feed = self.inner.feed.name(),
            "Invalidation manager started"
        );
    }

    /// Release every subscription and drop all pending debounce state.
    ///
    /// Purges that already started, and cache fetches, run to completion.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let mut subscriptions = self.inner.subscriptions.lock().await;
        for (resource, subscription) in subscriptions.drain() {
            subscription.handle.unsubscribe();
            debug!(resource = %resource, "Change feed subscription released");
        }
        drop(subscriptions);

        let debouncer = self.inner.debouncer.lock().take();
        if let Some(debouncer) = debouncer {
            let _ = debouncer.commands.send(DebounceCommand::Stop);
            if let Err(e) = debouncer.task.await {
                warn!(error = %e, "Debouncer did not stop cleanly");
            }
        }

        info!("Invalidation manager stopped");
    }

    /// Filter the feed may apply for `resource`: the one every rule on it shares, if any.
    ///
    /// `None` when no rule watches the resource.
    fn subscription_filter(&self, resource: &str) -> Option<Option<String>> {
        let mut filters = self
            .inner
            .rules
            .iter()
            .filter(|rule| rule.resource() == resource)
            .map(|rule| rule.filter().map(str::to_string));

        let first = filters.next()?;
        if filters.all(|filter| filter == first) {
            Some(first)
        } else {
            Some(None)
        }
    }

    /// Bring the subscription for `resource` in line with the registered rules.
    ///
    /// Opens it, re-opens it under a new filter, or releases it when no rule
    /// needs it. Nothing is opened while the manager is stopped.
    async fn sync_subscription(&self, subscriptions: &mut Subscriptions, resource: &str) {
        let wanted = match self.subscription_filter(resource) {
            Some(filter) if self.is_running() => filter,
            _ => {
                if let Some(subscription) = subscriptions.remove(resource) {
                    subscription.handle.unsubscribe();
                    info!(resource = %resource, "Unsubscribed from change feed");
                }
                return;
            }
        };

        if subscriptions
            .get(resource)
            .is_some_and(|current| current.filter == wanted)
        {
            return;
        }

        let weak = Arc::downgrade(&self.inner);
        let on_event: EventCallback = Arc::new(move |event| {
            if let Some(inner) = weak.upgrade() {
                InvalidationManager { inner }.handle_change(event);
            }
        });

        let request = SubscriptionRequest {
            resource: resource.to_string(),
            filter: wanted.clone(),
            on_event,
        };
        match self.inner.feed.subscribe(request).await {
            Ok(handle) => {
                info!(resource = %resource, filter = ?wanted, "Subscribed to change feed");
                let previous = subscriptions.insert(
                    resource.to_string(),
                    ActiveSubscription {
                        filter: wanted,
                        handle,
                    },
                );
                if let Some(previous) = previous {
                    previous.handle.unsubscribe();
                }
            }
            Err(e) => {
                e.log();
                warn!(
                    resource = %resource,
                    "Change feed subscription failed; resource is not invalidated automatically"
                );
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Change Handling
    // ─────────────────────────────────────────────────────────────────────────

    /// Queue the rules matching `event` behind the resource's debounce timer.
    ///
    /// Called by change-feed subscriptions; feeds that push events directly
    /// may call it too. Ignored while the manager is stopped.
    pub fn handle_change(&self, event: ChangeEvent) {
        if !self.is_running() {
            return;
        }

        let rules: Vec<InvalidationRule> = self
            .inner
            .rules
            .iter()
            .filter(|rule| rule.matches(&event))
            .map(|rule| rule.value().clone())
            .collect();
        if rules.is_empty() {
            debug!(resource = %event.resource, kind = %event.kind, "No rule matches change");
            return;
        }

        debug!(
            resource = %event.resource,
            kind = %event.kind,
            rules = rules.len(),
            "Change queued for invalidation"
        );
        let debouncer = self.inner.debouncer.lock();
        if let Some(debouncer) = debouncer.as_ref() {
            let _ = debouncer.commands.send(DebounceCommand::Change { event, rules });
        }
    }

    async fn execute_invalidations(&self, resource: &str, batch: PendingBatch) {
        let started = Instant::now();
        let rule_count = batch.len();
        let mut total = 0;

        for (rule_id, (rule, event)) in batch {
            let rule_started = Instant::now();
            let purged = self.apply_rule(&rule, Some(&event)).await;
            total += purged;

            self.inner.observer.record(&rule_id, purged);
            self.log_invalidation(
                InvalidationTrigger::Debounced {
                    resource: resource.to_string(),
                    rule_id,
                },
                purged,
                rule_started.elapsed(),
            );
        }

        info!(
            resource = %resource,
            rules = rule_count,
            purged = total,
            duration_ms = started.elapsed().as_millis() as u64,
            "Executed debounced invalidations"
        );
    }

    /// Run custom actions, then tag and pattern purges.
    async fn apply_rule(&self, rule: &InvalidationRule, event: Option<&ChangeEvent>) -> u64 {
        for action in rule.actions() {
            if let InvalidationAction::Custom(custom) = action {
                if let Err(e) = custom(event) {
                    counter!(names::INVALIDATIONS, "strategy" => "custom", "outcome" => "error").increment(1);
                    warn!(rule_id = %rule.id(), error = %e, "Custom invalidation action failed");
                }
            }
        }

        let mut purged = 0;
        for action in rule.actions() {
            purged += match action {
                InvalidationAction::TagPurge(tag) => self.purge_tag(tag).await,
                InvalidationAction::PatternPurge(pattern) => self.purge_pattern(pattern).await,
                InvalidationAction::Custom(_) => 0,
            };
        }
        purged
    }

    async fn purge_tag(&self, tag: &str) -> u64 {
        let count = self.inner.cache.delete_by_tag(tag).await;
        counter!(names::INVALIDATIONS, "strategy" => "tag").increment(count);
        debug!("Invalidated {} entries with tag: {}", count, tag);
        count
    }

    async fn purge_pattern(&self, pattern: &Regex) -> u64 {
        let count = self.inner.cache.delete_by_pattern(pattern).await;
        counter!(names::INVALIDATIONS, "strategy" => "pattern").increment(count);
        debug!("Invalidated {} entries matching pattern: {}", count, pattern);
        count
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Manual Invalidation
    // ─────────────────────────────────────────────────────────────────────────

    /// Run a registered rule now, bypassing the debounce window.
    pub async fn invalidate_rule(&self, rule_id: &str) -> Result<u64> {
        let rule = self
            .inner
            .rules
            .get(rule_id)
            .map(|rule| rule.value().clone())
            .ok_or_else(|| BazaarError::rule_not_found(rule_id))?;

        let started = Instant::now();
        let purged = self.apply_rule(&rule, None).await;
        self.inner.observer.record(rule.id(), purged);
        self.log_invalidation(
            InvalidationTrigger::Rule {
                rule_id: rule_id.to_string(),
            },
            purged,
            started.elapsed(),
        );
        Ok(purged)
    }

    pub async fn invalidate_by_tag(&self, tag: &str) -> u64 {
        let started = Instant::now();
        let purged = self.purge_tag(tag).await;
        self.log_invalidation(
            InvalidationTrigger::Tag {
                tag: tag.to_string(),
            },
            purged,
            started.elapsed(),
        );
        purged
    }

    pub async fn invalidate_by_pattern(&self, pattern: &Regex) -> u64 {
        let started = Instant::now();
        let purged = self.purge_pattern(pattern).await;
        self.log_invalidation(
            InvalidationTrigger::Pattern {
                pattern: pattern.as_str().to_string(),
            },
            purged,
            started.elapsed(),
        );
        purged
    }

    /// Most recent invalidations, newest first.
    pub fn recent_invalidations(&self, limit: usize) -> Vec<InvalidationRecord> {
        self.inner.log.lock().iter().rev().take(limit).cloned().collect()
    }

    fn log_invalidation(&self, trigger: InvalidationTrigger, purged: u64, duration: Duration) {
        let record = InvalidationRecord {
            trigger,
            purged,
            timestamp: Utc::now(),
            duration_ms: duration.as_millis() as u64,
        };

        let mut log = self.inner.log.lock();
        log.push_back(record);
        while log.len() > self.inner.config.log_capacity {
            log.pop_front();
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

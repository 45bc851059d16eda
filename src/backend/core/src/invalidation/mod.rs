//! Change-driven cache invalidation.
//!
//! Rules map upstream changes (insert, update, delete on a resource) to cache
//! purges. The [`InvalidationManager`] subscribes to a [`ChangeFeed`] for every
//! resource a rule mentions, coalesces bursts per resource, and then runs the
//! matching rules against a [`MultiLayerCache`](crate::cache::MultiLayerCache).

pub mod feed;
pub mod manager;
pub mod rule;

pub use feed::{
    BroadcastChangeFeed, ChangeFeed, EventCallback, SubscriptionHandle, SubscriptionRequest,
    DEFAULT_FEED_CAPACITY,
};
pub use manager::{
    InvalidationConfig, InvalidationConfigBuilder, InvalidationManager, InvalidationObserver,
    InvalidationRecord, InvalidationTrigger, NoopObserver, DEFAULT_DEBOUNCE, DEFAULT_LOG_CAPACITY,
};
pub use rule::{
    glob_to_regex, ChangeEvent, ChangeFilter, ChangeKind, CustomAction, InvalidationAction,
    InvalidationRule,
};

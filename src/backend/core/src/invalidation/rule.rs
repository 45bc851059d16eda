//! Change events and invalidation rules.

use crate::error::{BazaarError, ErrorCode, Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

// ═══════════════════════════════════════════════════════════════════════════════
// Change Events
// ═══════════════════════════════════════════════════════════════════════════════

/// Kind of upstream data change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub const ALL: [ChangeKind; 3] = [ChangeKind::Insert, ChangeKind::Update, ChangeKind::Delete];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Insert => "insert",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A change notification delivered by a change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Watched resource (table or collection name)
    pub resource: String,

    pub kind: ChangeKind,

    /// Opaque row data; only custom actions and feed filters look at it
    #[serde(default)]
    pub payload: serde_json::Value,

    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(resource: impl Into<String>, kind: ChangeKind) -> Self {
        Self {
            resource: resource.into(),
            kind,
            payload: serde_json::Value::Null,
            received_at: Utc::now(),
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Filters
// ═══════════════════════════════════════════════════════════════════════════════

/// `field=eq.value` equality on a top-level payload field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeFilter {
    field: String,
    value: String,
}

impl ChangeFilter {
    /// Parse a filter expression; `None` when the expression is not `field=eq.value`.
    pub fn parse(raw: &str) -> Option<Self> {
        let (field, rest) = raw.split_once('=')?;
        let value = rest.strip_prefix("eq.")?;
        let field = field.trim();
        if field.is_empty() {
            return None;
        }
        Some(Self {
            field: field.to_string(),
            value: value.to_string(),
        })
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn matches(&self, event: &ChangeEvent) -> bool {
        match event.payload.get(&self.field) {
            Some(serde_json::Value::String(s)) => *s == self.value,
            Some(other) => other.to_string() == self.value,
            None => false,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Actions
// ═══════════════════════════════════════════════════════════════════════════════

/// Side effect run when a rule fires; `None` for manually triggered rules.
pub type CustomAction = Arc<dyn Fn(Option<&ChangeEvent>) -> Result<()> + Send + Sync>;

/// What a rule does when it fires.
#[derive(Clone)]
pub enum InvalidationAction {
    /// Purge every entry carrying the tag
    TagPurge(String),

    /// Purge every entry whose key matches
    PatternPurge(Regex),

    /// Run a caller-supplied closure
    Custom(CustomAction),
}

impl InvalidationAction {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::TagPurge(_) => "tag",
            Self::PatternPurge(_) => "pattern",
            Self::Custom(_) => "custom",
        }
    }
}

impl fmt::Debug for InvalidationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TagPurge(tag) => f.debug_tuple("TagPurge").field(tag).finish(),
            Self::PatternPurge(pattern) => f.debug_tuple("PatternPurge").field(&pattern.as_str()).finish(),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Rules
// ═══════════════════════════════════════════════════════════════════════════════

/// Maps changes on a resource to cache purges.
///
/// ```rust,ignore
/// let rule = InvalidationRule::new("listing-updates", "listings")
///     .on(ChangeKind::Update)
///     .on(ChangeKind::Delete)
///     .purge_tag("listings")
///     .purge_pattern(Regex::new("^listings:")?);
/// ```
#[derive(Debug, Clone)]
pub struct InvalidationRule {
    id: String,
    resource: String,
    events: BTreeSet<ChangeKind>,
    filter: Option<String>,
    payload_filter: Option<ChangeFilter>,
    actions: Vec<InvalidationAction>,
}

impl InvalidationRule {
    /// Create a rule that matches no change kinds until [`on`](Self::on) is called.
    pub fn new(id: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            resource: resource.into(),
            events: BTreeSet::new(),
            filter: None,
            payload_filter: None,
            actions: Vec::new(),
        }
    }

    /// Fire on this kind of change.
    pub fn on(mut self, kind: ChangeKind) -> Self {
        self.events.insert(kind);
        self
    }

    /// Fire on inserts, updates and deletes.
    pub fn on_any(mut self) -> Self {
        self.events.extend(ChangeKind::ALL);
        self
    }

    /// Narrow the rule to events passing `filter`.
    ///
    /// The expression is also offered to the change feed. A `field=eq.value`
    /// filter is checked again by [`matches`](Self::matches); any other
    /// expression is left to the feed.
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        let filter = filter.into();
        self.payload_filter = ChangeFilter::parse(&filter);
        self.filter = Some(filter);
        self
    }

    pub fn purge_tag(mut self, tag: impl Into<String>) -> Self {
        self.actions.push(InvalidationAction::TagPurge(tag.into()));
        self
    }

    pub fn purge_pattern(mut self, pattern: Regex) -> Self {
        self.actions.push(InvalidationAction::PatternPurge(pattern));
        self
    }

    pub fn custom<F>(mut self, action: F) -> Self
    where
        F: Fn(Option<&ChangeEvent>) -> Result<()> + Send + Sync + 'static,
    {
        self.actions.push(InvalidationAction::Custom(Arc::new(action)));
        self
    }

    pub fn with_action(mut self, action: InvalidationAction) -> Self {
        self.actions.push(action);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn events(&self) -> &BTreeSet<ChangeKind> {
        &self.events
    }

    pub fn filter(&self) -> Option<&str> {
        self.filter.as_deref()
    }

    pub fn actions(&self) -> &[InvalidationAction] {
        &self.actions
    }

    /// Tags purged by this rule.
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.actions.iter().filter_map(|action| match action {
            InvalidationAction::TagPurge(tag) => Some(tag.as_str()),
            _ => None,
        })
    }

    /// Key patterns purged by this rule.
    pub fn patterns(&self) -> impl Iterator<Item = &Regex> {
        self.actions.iter().filter_map(|action| match action {
            InvalidationAction::PatternPurge(pattern) => Some(pattern),
            _ => None,
        })
    }

    /// Whether `event` should trigger this rule.
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        self.resource == event.resource
            && self.events.contains(&event.kind)
            && self.payload_filter.as_ref().map_or(true, |f| f.matches(event))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Glob Patterns
// ═══════════════════════════════════════════════════════════════════════════════

/// Compile a key glob (`*` any run, `?` one char) into an anchored regex.
pub fn glob_to_regex(glob: &str) -> Result<Regex> {
    let mut regex = String::with_capacity(glob.len() * 2);
    regex.push('^');

    for c in glob.chars() {
        match c {
            '*' => regex.push_str(".*"),
            '?' => regex.push('.'),
            '.' | '+' | '(' | ')' | '[' | ']' | '{' | '}' | '^' | '$' | '|' | '\\' => {
                regex.push('\\');
                regex.push(c);
            }
            _ => regex.push(c),
        }
    }

    regex.push('$');
    Regex::new(&regex).map_err(|e| {
        BazaarError::with_internal(ErrorCode::InvalidPattern, "Invalid key glob", e.to_string())
    })
}

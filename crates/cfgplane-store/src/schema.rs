//! Row definitions for the cfgplane tables
//!
//! Tables:
//! - id_generators: per-resource id counters
//! - resource_locks: per-tenant counting / uniqueness slots
//! - events: transactional outbox plus the cursor reminder row
//! - strategies: targeting rules with their publish state
//! - current_published_strategies: latest-wins publish projection
//! - published_strategy_histories: append-only publish log
//! - audits: operator audit trail

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fixed id of the event row that stores the consumer cursor.
pub const CURSOR_REMINDER_ID: u32 = 1;

/// Error returned when a stored enum label is not recognised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownLabel {
    pub kind: &'static str,
    pub label: String,
}

impl fmt::Display for UnknownLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} label: {}", self.kind, self.label)
    }
}

impl std::error::Error for UnknownLabel {}

// ---------------------------------------------------------------------------
// id_generators
// ---------------------------------------------------------------------------

/// Resource kinds that draw ids from the shared counter table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdKind {
    Applications,
    ConfigItems,
    Releases,
    StrategySets,
    Strategies,
    CurrentPublishedStrategies,
    PublishedStrategyHistories,
    ResourceLocks,
    Events,
    Audits,
}

impl IdKind {
    pub const ALL: [IdKind; 10] = [
        IdKind::Applications,
        IdKind::ConfigItems,
        IdKind::Releases,
        IdKind::StrategySets,
        IdKind::Strategies,
        IdKind::CurrentPublishedStrategies,
        IdKind::PublishedStrategyHistories,
        IdKind::ResourceLocks,
        IdKind::Events,
        IdKind::Audits,
    ];

    /// The counter row name, which is also the owning table's name.
    pub fn as_str(&self) -> &'static str {
        match self {
            IdKind::Applications => "applications",
            IdKind::ConfigItems => "config_items",
            IdKind::Releases => "releases",
            IdKind::StrategySets => "strategy_sets",
            IdKind::Strategies => "strategies",
            IdKind::CurrentPublishedStrategies => "current_published_strategies",
            IdKind::PublishedStrategyHistories => "published_strategy_histories",
            IdKind::ResourceLocks => "resource_locks",
            IdKind::Events => "events",
            IdKind::Audits => "audits",
        }
    }

    /// Value a freshly seeded counter starts from.
    ///
    /// The events counter starts at the cursor reminder id so that allocation
    /// never hands out the sentinel.
    pub fn seed_floor(&self) -> u32 {
        match self {
            IdKind::Events => CURSOR_REMINDER_ID,
            _ => 0,
        }
    }
}

impl fmt::Display for IdKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IdKind {
    type Err = UnknownLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        IdKind::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| UnknownLabel {
                kind: "id kind",
                label: s.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// resource_locks
// ---------------------------------------------------------------------------

/// Composite unique key of a lock slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockKey {
    pub biz_id: u32,
    pub res_type: String,
    pub res_key: String,
}

impl LockKey {
    pub fn new(biz_id: u32, res_type: impl Into<String>, res_key: impl Into<String>) -> Self {
        Self {
            biz_id,
            res_type: res_type.into(),
            res_key: res_key.into(),
        }
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.biz_id, self.res_type, self.res_key)
    }
}

/// A persisted lock slot. `res_count` is at least 1 while the row exists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLockRow {
    pub id: u32,
    pub key: LockKey,
    pub res_count: u32,
}

// ---------------------------------------------------------------------------
// events
// ---------------------------------------------------------------------------

/// What an event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventResource {
    Publish,
    Strategy,
    Application,
    ConfigItem,
    /// Only used by the sentinel row.
    CursorReminder,
}

impl EventResource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventResource::Publish => "publish",
            EventResource::Strategy => "strategy",
            EventResource::Application => "application",
            EventResource::ConfigItem => "config_item",
            EventResource::CursorReminder => "cursor_reminder",
        }
    }
}

impl FromStr for EventResource {
    type Err = UnknownLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "publish" => Ok(EventResource::Publish),
            "strategy" => Ok(EventResource::Strategy),
            "application" => Ok(EventResource::Application),
            "config_item" => Ok(EventResource::ConfigItem),
            "cursor_reminder" => Ok(EventResource::CursorReminder),
            other => Err(UnknownLabel {
                kind: "event resource",
                label: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpType {
    Insert,
    Update,
    Delete,
}

impl OpType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OpType::Insert => "insert",
            OpType::Update => "update",
            OpType::Delete => "delete",
        }
    }
}

impl FromStr for OpType {
    type Err = UnknownLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert" => Ok(OpType::Insert),
            "update" => Ok(OpType::Update),
            "delete" => Ok(OpType::Delete),
            other => Err(UnknownLabel {
                kind: "op type",
                label: other.to_string(),
            }),
        }
    }
}

/// Outcome of the transaction that fired an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinalStatus {
    Unknown,
    Success,
    Failed,
}

impl FinalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FinalStatus::Unknown => "unknown",
            FinalStatus::Success => "success",
            FinalStatus::Failed => "failed",
        }
    }
}

impl FromStr for FinalStatus {
    type Err = UnknownLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(FinalStatus::Unknown),
            "success" => Ok(FinalStatus::Success),
            "failed" => Ok(FinalStatus::Failed),
            other => Err(UnknownLabel {
                kind: "final status",
                label: other.to_string(),
            }),
        }
    }
}

/// A row of the `events` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRow {
    pub id: u32,
    pub biz_id: u32,
    pub app_id: u32,
    pub resource: EventResource,
    pub resource_id: u32,
    pub resource_uid: String,
    pub op_type: OpType,
    pub final_status: FinalStatus,
    pub creator: String,
    pub created_at: DateTime<Utc>,
}

impl EventRow {
    /// Build the sentinel row recording `cursor` as the last consumed id.
    pub fn cursor_reminder(cursor: u32, at: DateTime<Utc>) -> Self {
        Self {
            id: CURSOR_REMINDER_ID,
            biz_id: 0,
            app_id: 0,
            resource: EventResource::CursorReminder,
            resource_id: cursor,
            resource_uid: String::new(),
            op_type: OpType::Update,
            final_status: FinalStatus::Success,
            creator: "system".to_string(),
            created_at: at,
        }
    }
}

/// Row selection for event listings. The cursor reminder is always excluded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventFilter {
    /// Only ids strictly greater than this.
    pub after: Option<u32>,
    /// Only ids less than or equal to this.
    pub through: Option<u32>,
    pub biz_id: Option<u32>,
}

impl EventFilter {
    pub fn admits(&self, row: &EventRow) -> bool {
        row.id != CURSOR_REMINDER_ID
            && self.after.map_or(true, |a| row.id > a)
            && self.through.map_or(true, |t| row.id <= t)
            && self.biz_id.map_or(true, |b| row.biz_id == b)
    }
}

// ---------------------------------------------------------------------------
// strategies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PubState {
    None,
    Publishing,
    Published,
}

impl PubState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PubState::None => "none",
            PubState::Publishing => "publishing",
            PubState::Published => "published",
        }
    }
}

impl FromStr for PubState {
    type Err = UnknownLabel;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(PubState::None),
            "publishing" => Ok(PubState::Publishing),
            "published" => Ok(PubState::Published),
            other => Err(UnknownLabel {
                kind: "pub state",
                label: other.to_string(),
            }),
        }
    }
}

/// Predicate on the current `pub_state` for a guarded transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PubStateGuard {
    Is(PubState),
    IsNot(PubState),
}

impl PubStateGuard {
    pub fn admits(&self, state: PubState) -> bool {
        match self {
            PubStateGuard::Is(s) => state == *s,
            PubStateGuard::IsNot(s) => state != *s,
        }
    }
}

/// The publishable part of a strategy; snapshotted on every publish.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategySpec {
    pub name: String,
    pub release_id: u32,
    pub as_default: bool,
    pub namespace: String,
    pub scope: serde_json::Value,
    pub memo: String,
}

/// Address of a strategy inside a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StrategyRef {
    pub biz_id: u32,
    pub app_id: u32,
    pub id: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyRow {
    pub id: u32,
    pub biz_id: u32,
    pub app_id: u32,
    pub strategy_set_id: u32,
    pub spec: StrategySpec,
    pub pub_state: PubState,
    pub creator: String,
    pub reviser: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StrategyRow {
    pub fn reference(&self) -> StrategyRef {
        StrategyRef {
            biz_id: self.biz_id,
            app_id: self.app_id,
            id: self.id,
        }
    }
}

/// Latest-wins projection of a published strategy, unique per strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentPublishedStrategyRow {
    pub id: u32,
    pub biz_id: u32,
    pub app_id: u32,
    pub strategy_id: u32,
    pub spec: StrategySpec,
    pub revision: u32,
    pub creator: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One publish action, never updated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishedStrategyHistoryRow {
    pub id: u32,
    pub biz_id: u32,
    pub app_id: u32,
    pub strategy_id: u32,
    pub spec: StrategySpec,
    pub revision: u32,
    pub creator: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// audits
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRow {
    pub id: u32,
    pub biz_id: u32,
    pub app_id: u32,
    pub res_type: String,
    pub res_id: u32,
    pub action: String,
    pub operator: String,
    pub rid: String,
    pub detail: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// pagination
// ---------------------------------------------------------------------------

/// Offset pagination shared by every listing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub start: u32,
    pub limit: u32,
}

impl Page {
    pub const MAX_LIMIT: u32 = 1000;

    pub fn new(start: u32, limit: u32) -> Self {
        Self { start, limit }
    }

    pub fn is_valid(&self) -> bool {
        self.limit > 0 && self.limit <= Self::MAX_LIMIT
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            start: 0,
            limit: 100,
        }
    }
}

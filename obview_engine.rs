//! # ObView Engine - View-Model Core of the OceanBase Console
//!
//! The stateful part of the management console: everything between "the user
//! changed a filter or an edit row" and "the renderer receives a tree, a table
//! or a set of chart series". Rendering, routing and the REST contract live
//! outside; this crate consumes a metrics-query capability and a
//! parameter-set capability and hands back owned view models.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              OBVIEW ENGINE                                   │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  FILTER NORMALIZER → REQUEST DEDUPLICATOR → VIEW PROJECTOR → RECONCILER     │
//! │         ↑                     │                   │               │         │
//! │    filter chips          MetricsSource      tree / series    select options │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Canonical label sets**: filter chips and display dimensions reduced to
//!   one canonical grouping
//! - **Deduplicated refresh**: one fingerprint slot per chart, viewport gated,
//!   stale responses dropped by epoch
//! - **Effective-scope trees**: cluster → zone → server projection of
//!   parameter edits with per-leaf change flags
//! - **Selection reconciliation**: the all-tenants / specific-tenant exclusivity
//!   state machine and range-change resets

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================

#![allow(dead_code)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Debug, Display, Formatter};
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ----------------------------------------------------------------------------
// Async Runtime - Tokio
// ----------------------------------------------------------------------------
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{interval_at, Instant as TokioInstant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

// ----------------------------------------------------------------------------
// Concurrency Primitives
// ----------------------------------------------------------------------------
use arc_swap::ArcSwap;
use dashmap::DashMap;
use once_cell::sync::Lazy;
use parking_lot::RwLock;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// String & Memory Optimization
// ----------------------------------------------------------------------------
use compact_str::CompactString;
use smallvec::{smallvec, SmallVec};

// ----------------------------------------------------------------------------
// Hashing
// ----------------------------------------------------------------------------
use ahash::{AHashMap, AHashSet};
use xxhash_rust::xxh3::xxh3_128;

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{fmt as tracing_fmt, layer::SubscriberExt, EnvFilter};

// ----------------------------------------------------------------------------
// Time
// ----------------------------------------------------------------------------
use chrono::{TimeZone, Utc};

// ----------------------------------------------------------------------------
// Networking
// ----------------------------------------------------------------------------
use reqwest::Client as HttpClient;

// ----------------------------------------------------------------------------
// Async Traits
// ----------------------------------------------------------------------------
use async_trait::async_trait;

// ----------------------------------------------------------------------------
// Regex & Pattern Matching
// ----------------------------------------------------------------------------
use regex::Regex;

// ----------------------------------------------------------------------------
// UUID & Identifiers
// ----------------------------------------------------------------------------
use uuid::Uuid;

// ----------------------------------------------------------------------------
// Configuration
// ----------------------------------------------------------------------------
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};

// ----------------------------------------------------------------------------
// CLI
// ----------------------------------------------------------------------------
use clap::{Parser, Subcommand, ValueEnum};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Engine version - follows semantic versioning
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const ENGINE_NAME: &str = "obview-engine";
pub const ENGINE_FULL_NAME: &str = "ObView Console Engine";

// ----------------------------------------------------------------------------
// Scope Selection
// ----------------------------------------------------------------------------

/// Synthetic target meaning "every tenant of the cluster"
pub const ALL_TENANTS: &str = "all_tenants";

/// Display label of the synthetic all-tenants option
pub const ALL_TENANTS_LABEL: &str = "All tenants";

/// Maximum edit rows in one drawer session
pub const MAX_EDIT_ROWS: usize = 32;

// ----------------------------------------------------------------------------
// Monitoring & Refresh
// ----------------------------------------------------------------------------

/// Default live-refresh interval (seconds)
pub const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 15;

/// Minimum allowed live-refresh interval (seconds)
pub const MIN_REFRESH_INTERVAL_SECS: u64 = 1;

/// Default trailing window of a realtime chart (seconds)
pub const DEFAULT_QUERY_RANGE_SECS: u64 = 30 * 60;

/// Maximum metrics one chart may request at once
pub const MAX_METRICS_PER_QUERY: usize = 64;

/// Buffered UI events per chart driver
pub const DRIVER_EVENT_CHANNEL_SIZE: usize = 64;

/// Projections slower than this are logged at warn level (milliseconds)
pub const SLOW_PROJECTION_THRESHOLD_MS: u64 = 50;

// ----------------------------------------------------------------------------
// Labels
// ----------------------------------------------------------------------------

/// Maximum label value length
pub const MAX_LABEL_VALUE_LENGTH: usize = 512;

/// Placeholder used when a series lacks one of the grouping labels
pub const MISSING_LABEL_VALUE: &str = "-";

// ----------------------------------------------------------------------------
// Management API
// ----------------------------------------------------------------------------

/// Default management API base URL
pub const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:8180";

/// Default metrics query endpoint
pub const DEFAULT_METRICS_QUERY_PATH: &str = "/api/v1/monitor/metrics/query";

/// Default parameter set-scope endpoint
pub const DEFAULT_PARAMETERS_PATH: &str = "/api/v1/ob/cluster/parameters";

/// Default timeout for HTTP requests (seconds)
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

// ============================================================================
// SECTION 3: CORE TYPE SYSTEM
// ============================================================================
// Labels, grouping keys, query bundles and the series the metrics capability
// returns. Everything here is plain owned data that serializes cleanly.
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Label Keys - The Fixed Vocabulary
// ----------------------------------------------------------------------------

/// The label keys the monitoring API understands.
///
/// The declaration order is the canonical order used for fingerprints and
/// sorted output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelKey {
    SvrIp,
    SvrPort,
    Obzone,
    TenantName,
    TenantId,
    ObClusterName,
    ObClusterId,
}

impl LabelKey {
    /// Every key of the vocabulary, in canonical order
    pub const ALL: [LabelKey; 7] = [
        LabelKey::SvrIp,
        LabelKey::SvrPort,
        LabelKey::Obzone,
        LabelKey::TenantName,
        LabelKey::TenantId,
        LabelKey::ObClusterName,
        LabelKey::ObClusterId,
    ];

    /// Wire name of the key
    pub const fn as_str(&self) -> &'static str {
        match self {
            LabelKey::SvrIp => "svr_ip",
            LabelKey::SvrPort => "svr_port",
            LabelKey::Obzone => "obzone",
            LabelKey::TenantName => "tenant_name",
            LabelKey::TenantId => "tenant_id",
            LabelKey::ObClusterName => "ob_cluster_name",
            LabelKey::ObClusterId => "ob_cluster_id",
        }
    }
}

impl Display for LabelKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LabelKey {
    type Err = LabelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LabelKey::ALL
            .iter()
            .copied()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| LabelError::UnknownKey { key: s.to_string() })
    }
}

// ----------------------------------------------------------------------------
// 3.2 Labels & Label Sets
// ----------------------------------------------------------------------------

/// A single label (key-value pair).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Label {
    pub key: LabelKey,
    pub value: CompactString,
}

impl Label {
    /// Create a new label
    #[inline]
    pub fn new<V>(key: LabelKey, value: V) -> Self
    where
        V: Into<CompactString>,
    {
        Self {
            key,
            value: value.into(),
        }
    }
}

impl Display for Label {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

impl FromStr for Label {
    type Err = LabelError;

    /// Parse `key=value`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (key, value) = s
            .split_once('=')
            .ok_or_else(|| LabelError::Malformed { input: s.to_string() })?;
        let key: LabelKey = key.trim().parse()?;
        let value = value.trim();
        if value.len() > MAX_LABEL_VALUE_LENGTH {
            return Err(LabelError::ValueTooLong {
                key,
                len: value.len(),
            });
        }
        Ok(Label::new(key, value))
    }
}

/// An unordered set of labels with unique keys.
///
/// Insertion order is kept for display; equality and fingerprints
/// go through [`LabelSet::canonical`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(try_from = "Vec<Label>", into = "Vec<Label>")]
pub struct LabelSet(SmallVec<[Label; 8]>);

impl LabelSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the value of `key`, returning the previous value
    pub fn insert<V>(&mut self, key: LabelKey, value: V) -> Option<CompactString>
    where
        V: Into<CompactString>,
    {
        let value = value.into();
        match self.0.iter_mut().find(|l| l.key == key) {
            Some(label) => Some(std::mem::replace(&mut label.value, value)),
            None => {
                self.0.push(Label { key, value });
                None
            }
        }
    }

    /// Builder form of [`LabelSet::insert`]
    pub fn with<V>(mut self, key: LabelKey, value: V) -> Self
    where
        V: Into<CompactString>,
    {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: LabelKey) -> Option<&str> {
        self.0
            .iter()
            .find(|l| l.key == key)
            .map(|l| l.value.as_str())
    }

    pub fn contains_key(&self, key: LabelKey) -> bool {
        self.0.iter().any(|l| l.key == key)
    }

    pub fn remove(&mut self, key: LabelKey) -> Option<Label> {
        let pos = self.0.iter().position(|l| l.key == key)?;
        Some(self.0.remove(pos))
    }

    pub fn keys(&self) -> impl Iterator<Item = LabelKey> + '_ {
        self.0.iter().map(|l| l.key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Label> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Labels sorted by key: the order-insensitive view of the set
    pub fn canonical(&self) -> Vec<(LabelKey, &str)> {
        let mut pairs: Vec<(LabelKey, &str)> =
            self.0.iter().map(|l| (l.key, l.value.as_str())).collect();
        pairs.sort_by_key(|(k, _)| *k);
        pairs
    }

    /// Keep only the labels whose key is part of `keys`
    pub fn project(&self, keys: &GroupKeys) -> LabelSet {
        LabelSet(
            self.0
                .iter()
                .filter(|l| keys.contains(l.key))
                .cloned()
                .collect(),
        )
    }

    /// Build from a loosely typed map, skipping keys outside the vocabulary.
    pub fn from_lenient_map<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut set = LabelSet::new();
        for (key, value) in pairs {
            match key.parse::<LabelKey>() {
                Ok(key) => {
                    set.insert(key, value);
                }
                Err(_) => trace!(target: "obview::labels", key, "Skipping unknown label"),
            }
        }
        set
    }
}

impl PartialEq for LabelSet {
    fn eq(&self, other: &Self) -> bool {
        self.canonical() == other.canonical()
    }
}

impl Eq for LabelSet {}

impl Display for LabelSet {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, label) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", label)?;
        }
        f.write_str("}")
    }
}

impl TryFrom<Vec<Label>> for LabelSet {
    type Error = LabelError;

    fn try_from(labels: Vec<Label>) -> Result<Self, Self::Error> {
        let mut set = LabelSet::new();
        for label in labels {
            if set.contains_key(label.key) {
                return Err(LabelError::DuplicateKey { key: label.key });
            }
            set.0.push(label);
        }
        Ok(set)
    }
}

impl From<LabelSet> for Vec<Label> {
    fn from(set: LabelSet) -> Self {
        set.0.into_vec()
    }
}

impl FromIterator<Label> for LabelSet {
    /// Later labels replace earlier ones with the same key.
    fn from_iter<T: IntoIterator<Item = Label>>(iter: T) -> Self {
        let mut set = LabelSet::new();
        for label in iter {
            set.insert(label.key, label.value);
        }
        set
    }
}

// ----------------------------------------------------------------------------
// 3.3 Grouping Keys
// ----------------------------------------------------------------------------

/// The keys a query groups its series by. Never contains a key twice; an
/// empty set means "ungrouped / all".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<LabelKey>", into = "Vec<LabelKey>")]
pub struct GroupKeys(SmallVec<[LabelKey; 4]>);

impl GroupKeys {
    /// The empty grouping
    pub fn ungrouped() -> Self {
        Self::default()
    }

    /// Push `key` unless it is already present. Returns whether it was added.
    pub fn push_unique(&mut self, key: LabelKey) -> bool {
        if self.contains(key) {
            false
        } else {
            self.0.push(key);
            true
        }
    }

    pub fn contains(&self, key: LabelKey) -> bool {
        self.0.contains(&key)
    }

    pub fn iter(&self) -> impl Iterator<Item = LabelKey> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_ungrouped(&self) -> bool {
        self.0.is_empty()
    }

    /// Keys in canonical order
    pub fn sorted(&self) -> SmallVec<[LabelKey; 4]> {
        let mut keys = self.0.clone();
        keys.sort();
        keys
    }
}

impl From<Vec<LabelKey>> for GroupKeys {
    fn from(keys: Vec<LabelKey>) -> Self {
        keys.into_iter().collect()
    }
}

impl From<GroupKeys> for Vec<LabelKey> {
    fn from(keys: GroupKeys) -> Self {
        keys.0.into_vec()
    }
}

impl FromIterator<LabelKey> for GroupKeys {
    fn from_iter<T: IntoIterator<Item = LabelKey>>(iter: T) -> Self {
        let mut keys = GroupKeys::ungrouped();
        for key in iter {
            keys.push_unique(key);
        }
        keys
    }
}

impl Display for GroupKeys {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.is_ungrouped() {
            return f.write_str("(ungrouped)");
        }
        let names: Vec<&str> = self.0.iter().map(|k| k.as_str()).collect();
        f.write_str(&names.join(","))
    }
}

// ----------------------------------------------------------------------------
// 3.4 Monitor Dimensions & Tabs
// ----------------------------------------------------------------------------

/// How a monitoring chart splits its series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    /// One series per resource unit (server × tenant)
    Unit,
    /// One series per observer process
    SvrIp,
    /// One series per zone
    Zone,
    /// One series per tenant
    Tenant,
}

impl Dimension {
    /// The data category that must be non-empty for this dimension to group
    pub const fn category(&self) -> DataCategory {
        match self {
            Dimension::Unit => DataCategory::Units,
            Dimension::SvrIp => DataCategory::Servers,
            Dimension::Zone => DataCategory::Zones,
            Dimension::Tenant => DataCategory::Tenants,
        }
    }
}

/// Categories of resources a dimension can split by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataCategory {
    Units,
    Servers,
    Zones,
    Tenants,
}

/// How many resources of each category the current cluster has.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategoryCounts {
    #[serde(default)]
    pub units: usize,
    #[serde(default)]
    pub servers: usize,
    #[serde(default)]
    pub zones: usize,
    #[serde(default)]
    pub tenants: usize,
}

impl CategoryCounts {
    /// Counts derived from a topology and its tenant list.
    /// Every server hosts one unit per tenant.
    pub fn from_topology(topology: &ClusterTopology, tenants: usize) -> Self {
        Self::from_totals(topology.server_count(), topology.zones.len(), tenants)
    }

    /// Counts from raw totals; the unit count saturates.
    pub fn from_totals(servers: usize, zones: usize, tenants: usize) -> Self {
        Self {
            units: servers.saturating_mul(tenants),
            servers,
            zones,
            tenants,
        }
    }

    pub fn count(&self, category: DataCategory) -> usize {
        match category {
            DataCategory::Units => self.units,
            DataCategory::Servers => self.servers,
            DataCategory::Zones => self.zones,
            DataCategory::Tenants => self.tenants,
        }
    }
}

/// Monitoring tab a chart is rendered under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum MonitorTab {
    /// Database-level metrics, reported per observer process
    #[default]
    Database,
    /// Host metrics, reported per machine without a port breakdown
    HostPerformance,
}

impl MonitorTab {
    pub const fn is_host_performance(&self) -> bool {
        matches!(self, MonitorTab::HostPerformance)
    }
}

// ----------------------------------------------------------------------------
// 3.5 Filter Chips
// ----------------------------------------------------------------------------

/// One active filter picked by the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FilterChip {
    Zone {
        name: CompactString,
    },
    Server {
        ip: CompactString,
        #[serde(default)]
        port: Option<u16>,
    },
    Tenant {
        name: CompactString,
        #[serde(default)]
        id: Option<u64>,
    },
}

/// Identity of the cluster a console page is scoped to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterContext {
    pub name: CompactString,
    #[serde(default)]
    pub id: Option<u64>,
}

// ----------------------------------------------------------------------------
// 3.6 Query Bundles
// ----------------------------------------------------------------------------

/// Time range of a query, in seconds since the Unix epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryRange {
    pub start: i64,
    pub end: i64,
    /// Resolution in seconds, server default when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<u32>,
}

impl QueryRange {
    pub fn new(start: i64, end: i64) -> Self {
        Self {
            start,
            end,
            step: None,
        }
    }

    /// The `window_secs` seconds ending at `anchor`
    pub fn trailing(anchor: i64, window_secs: u64) -> Self {
        let window = i64::try_from(window_secs).unwrap_or(i64::MAX);
        Self::new(anchor.saturating_sub(window), anchor)
    }

    pub fn with_step(mut self, step: u32) -> Self {
        self.step = Some(step);
        self
    }

    pub fn duration_secs(&self) -> i64 {
        self.end - self.start
    }

    pub fn is_valid(&self) -> bool {
        self.start <= self.end
    }
}

impl Display for QueryRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let fmt_ts = |ts: i64| {
            Utc.timestamp_opt(ts, 0)
                .single()
                .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
                .unwrap_or_else(|| ts.to_string())
        };
        write!(f, "[{} .. {}]", fmt_ts(self.start), fmt_ts(self.end))
    }
}

/// Whether a chart follows the clock or shows a fixed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum QueryMode {
    /// Trailing window, refreshed on an interval
    #[default]
    Realtime,
    /// Fixed historical window
    History,
}

/// Everything a metrics query is made of.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricQuery {
    pub labels: LabelSet,
    pub group_labels: GroupKeys,
    pub range: QueryRange,
    pub metrics: Vec<CompactString>,
    #[serde(default)]
    pub mode: QueryMode,
    /// Set when the chart refreshes live. Stable for the chart's lifetime.
    #[serde(default)]
    pub refresh: bool,
    /// Auxiliary free-form filter passed through to the API
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

impl MetricQuery {
    pub fn new<I, M>(metrics: I, range: QueryRange) -> Self
    where
        I: IntoIterator<Item = M>,
        M: Into<CompactString>,
    {
        Self {
            labels: LabelSet::new(),
            group_labels: GroupKeys::ungrouped(),
            range,
            metrics: metrics.into_iter().map(Into::into).collect(),
            mode: QueryMode::default(),
            refresh: false,
            filter: None,
        }
    }

    pub fn with_labels(mut self, labels: LabelSet) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_group_labels(mut self, keys: GroupKeys) -> Self {
        self.group_labels = keys;
        self
    }

    pub fn with_mode(mut self, mode: QueryMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_refresh(mut self, refresh: bool) -> Self {
        self.refresh = refresh;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Reject bundles the API cannot answer
    pub fn validate(&self) -> Result<(), QueryError> {
        if self.metrics.is_empty() {
            return Err(QueryError::InvalidQuery {
                message: "at least one metric is required".into(),
            });
        }
        if self.metrics.len() > MAX_METRICS_PER_QUERY {
            return Err(QueryError::InvalidQuery {
                message: format!("at most {} metrics per query", MAX_METRICS_PER_QUERY),
            });
        }
        if !self.range.is_valid() {
            return Err(QueryError::InvalidQuery {
                message: format!("range start {} is after end {}", self.range.start, self.range.end),
            });
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------------
// 3.7 Metric Series - What the Metrics Capability Returns
// ----------------------------------------------------------------------------

/// A single sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    /// Seconds since the Unix epoch
    pub ts: i64,
    pub value: f64,
}

impl MetricPoint {
    pub const fn new(ts: i64, value: f64) -> Self {
        Self { ts, value }
    }
}

/// One time series of one metric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSeries {
    pub metric: CompactString,
    pub labels: LabelSet,
    pub points: Vec<MetricPoint>,
}

impl MetricSeries {
    pub fn new(metric: impl Into<CompactString>, labels: LabelSet) -> Self {
        Self {
            metric: metric.into(),
            labels,
            points: Vec::new(),
        }
    }

    pub fn with_point(mut self, ts: i64, value: f64) -> Self {
        self.points.push(MetricPoint::new(ts, value));
        self
    }

    /// Most recent sample
    pub fn latest(&self) -> Option<MetricPoint> {
        self.points.iter().copied().max_by_key(|p| p.ts)
    }
}

// ============================================================================
// SECTION 4: ERROR HANDLING FRAMEWORK
// ============================================================================
// Errors per subsystem, all convertible into the root error. Nothing here is
// fatal to a console session: queries are retried by the next trigger,
// validation blocks one submission, selection errors refuse one pick.
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Core Errors
// ----------------------------------------------------------------------------

/// The main error type for the engine.
#[derive(Error, Debug)]
pub enum ObViewError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationErrors),

    #[error("Selection error: {0}")]
    Reconcile(#[from] ReconcileError),

    #[error("Topology error: {0}")]
    Topology(#[from] TopologyError),

    #[error("Label error: {0}")]
    Label(#[from] LabelError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ObViewError {
    /// Check if the user can recover by retrying or editing
    pub fn is_recoverable(&self) -> bool {
        match self {
            ObViewError::Config(_) => false,
            ObViewError::Internal(_) => false,
            _ => true,
        }
    }

    /// Get the error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            ObViewError::Config(_) => "config",
            ObViewError::Query(_) => "query",
            ObViewError::Validation(_) => "validation",
            ObViewError::Reconcile(_) => "selection",
            ObViewError::Topology(_) => "topology",
            ObViewError::Label(_) => "label",
            ObViewError::Io(_) => "io",
            ObViewError::Json(_) => "json",
            ObViewError::Internal(_) => "internal",
        }
    }

    /// Get suggested recovery action
    pub fn recovery_hint(&self) -> RecoveryHint {
        match self {
            ObViewError::Config(_) => RecoveryHint::FixConfiguration,
            ObViewError::Query(_) => RecoveryHint::RetryOnNextTrigger,
            ObViewError::Validation(_) | ObViewError::Label(_) => RecoveryHint::FixInput,
            ObViewError::Reconcile(_) => RecoveryHint::PickAnotherOption,
            ObViewError::Topology(_) => RecoveryHint::ReopenDrawer,
            _ => RecoveryHint::None,
        }
    }
}

/// Hints for how a console user recovers from an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryHint {
    /// No recovery possible
    None,
    /// The next refresh tick or prop change retries
    RetryOnNextTrigger,
    /// Correct the highlighted fields
    FixInput,
    /// The option is disabled in the selector
    PickAnotherOption,
    /// Reload the topology by reopening the drawer
    ReopenDrawer,
    /// Fix configuration and restart
    FixConfiguration,
}

// ----------------------------------------------------------------------------
// 4.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 4.3 Label Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LabelError {
    #[error("unknown label key '{key}'")]
    UnknownKey { key: String },

    #[error("label key '{key}' appears more than once")]
    DuplicateKey { key: LabelKey },

    #[error("value of '{key}' is {len} bytes long")]
    ValueTooLong { key: LabelKey, len: usize },

    #[error("expected key=value, got '{input}'")]
    Malformed { input: String },
}

// ----------------------------------------------------------------------------
// 4.4 Query Errors
// ----------------------------------------------------------------------------

/// Failures of the metrics and parameter capabilities. Cloneable so a
/// failure can be both recorded and handed to the session.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("request to '{endpoint}' failed: {message}")]
    Transport { endpoint: String, message: String },

    #[error("API returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to decode response: {message}")]
    Decode { message: String },

    #[error("invalid query: {message}")]
    InvalidQuery { message: String },

    #[error("request timed out after {secs}s")]
    Timeout { secs: u64 },
}

impl QueryError {
    pub(crate) fn from_reqwest(endpoint: &str, err: reqwest::Error, timeout_secs: u64) -> Self {
        if err.is_timeout() {
            QueryError::Timeout { secs: timeout_secs }
        } else if err.is_decode() {
            QueryError::Decode {
                message: err.to_string(),
            }
        } else {
            QueryError::Transport {
                endpoint: endpoint.to_string(),
                message: err.to_string(),
            }
        }
    }
}

// ----------------------------------------------------------------------------
// 4.5 Validation Errors - Inline, Per Field
// ----------------------------------------------------------------------------

/// Form field an error is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldName {
    Value,
    Range,
    Targets,
    Rows,
}

impl Display for FieldName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldName::Value => "value",
            FieldName::Range => "range",
            FieldName::Targets => "targets",
            FieldName::Rows => "rows",
        };
        f.write_str(name)
    }
}

/// One inline error message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    /// Edit row, absent for session-wide errors
    pub row: Option<usize>,
    pub field: FieldName,
    pub message: String,
}

impl Display for FieldError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.row {
            Some(row) => write!(f, "row {} {}: {}", row + 1, self.field, self.message),
            None => write!(f, "{}: {}", self.field, self.message),
        }
    }
}

/// Every field error of one submission attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationErrors {
    pub errors: Vec<FieldError>,
}

impl ValidationErrors {
    pub fn push(&mut self, row: Option<usize>, field: FieldName, message: impl Into<String>) {
        self.errors.push(FieldError {
            row,
            field,
            message: message.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Errors attached to one row
    pub fn for_row(&self, row: usize) -> impl Iterator<Item = &FieldError> {
        self.errors.iter().filter(move |e| e.row == Some(row))
    }

    pub fn into_result(self) -> Result<(), ValidationErrors> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl Display for ValidationErrors {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let messages: Vec<String> = self.errors.iter().map(ToString::to_string).collect();
        write!(f, "{} field error(s): {}", self.errors.len(), messages.join("; "))
    }
}

impl std::error::Error for ValidationErrors {}

// ----------------------------------------------------------------------------
// 4.6 Selection Errors
// ----------------------------------------------------------------------------

/// A pick the selector would have disabled, or an out-of-range row.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("row {row} does not exist ({rows} rows)")]
    RowOutOfRange { row: usize, rows: usize },

    #[error("option '{value}' is not selectable in row {row}")]
    OptionDisabled { row: usize, value: String },

    #[error("'{value}' is not a valid target for row {row}")]
    UnknownTarget { row: usize, value: String },

    #[error("range '{range}' does not apply to this session")]
    RangeNotApplicable { range: EffectiveRange },

    #[error("a session holds at most {max} rows")]
    TooManyRows { max: usize },
}

// ----------------------------------------------------------------------------
// 4.7 Topology Errors
// ----------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TopologyError {
    #[error("zone '{zone}' is listed twice")]
    DuplicateZone { zone: String },

    #[error("server '{address}' is listed twice")]
    DuplicateServer { address: String },

    #[error("tenant '{tenant}' is listed twice")]
    DuplicateTenant { tenant: String },

    #[error("'{target}' is not an ip or ip:port server target")]
    InvalidServerTarget { target: String },
}

// ----------------------------------------------------------------------------
// 4.8 Result Type Aliases
// ----------------------------------------------------------------------------

/// Standard result type for engine operations
pub type ObViewResult<T> = Result<T, ObViewError>;

/// Result type for capability calls
pub type QueryResult<T> = Result<T, QueryError>;

// ----------------------------------------------------------------------------
// 4.9 Error Context Extension
// ----------------------------------------------------------------------------

/// Extension trait to add context to errors
pub trait ErrorContext<T> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> Result<T, ObViewError>;

    /// Add context with a closure (lazy evaluation)
    fn with_context<F, C>(self, f: F) -> Result<T, ObViewError>
    where
        F: FnOnce() -> C,
        C: Into<String>;
}

impl<T, E> ErrorContext<T> for Result<T, E>
where
    E: Into<ObViewError>,
{
    fn context(self, context: impl Into<String>) -> Result<T, ObViewError> {
        self.map_err(|e| {
            let err: ObViewError = e.into();
            ObViewError::Internal(format!("{}: {}", context.into(), err))
        })
    }

    fn with_context<F, C>(self, f: F) -> Result<T, ObViewError>
    where
        F: FnOnce() -> C,
        C: Into<String>,
    {
        self.map_err(|e| {
            let err: ObViewError = e.into();
            ObViewError::Internal(format!("{}: {}", f().into(), err))
        })
    }
}

// ----------------------------------------------------------------------------
// 4.10 Error Statistics Tracking
// ----------------------------------------------------------------------------

/// Error counters shared by the chart drivers of one page
#[derive(Debug, Default)]
pub struct ErrorStats {
    by_category: DashMap<&'static str, AtomicU64>,
    recoverable_count: AtomicU64,
    non_recoverable_count: AtomicU64,
}

impl ErrorStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error
    pub fn record(&self, error: &ObViewError) {
        self.by_category
            .entry(error.category())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, AtomicOrdering::Relaxed);

        if error.is_recoverable() {
            self.recoverable_count.fetch_add(1, AtomicOrdering::Relaxed);
        } else {
            self.non_recoverable_count.fetch_add(1, AtomicOrdering::Relaxed);
        }
    }

    pub fn total_errors(&self) -> u64 {
        self.recoverable_count.load(AtomicOrdering::Relaxed)
            + self.non_recoverable_count.load(AtomicOrdering::Relaxed)
    }

    pub fn count_by_category(&self, category: &str) -> u64 {
        self.by_category
            .get(category)
            .map(|v| v.load(AtomicOrdering::Relaxed))
            .unwrap_or(0)
    }

    pub fn reset(&self) {
        self.by_category.clear();
        self.recoverable_count.store(0, AtomicOrdering::Relaxed);
        self.non_recoverable_count.store(0, AtomicOrdering::Relaxed);
    }
}

// ============================================================================
// SECTION 5: CONFIGURATION SYSTEM
// ============================================================================
// TOML file + OBVIEW_ environment overrides, validated on load, hot-swappable
// through the ConfigManager.
// ============================================================================

// ----------------------------------------------------------------------------
// 5.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration of the console engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsoleConfig {
    /// Management API endpoints
    #[serde(default)]
    pub api: ApiConfig,

    /// Monitoring dashboard behavior
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// Parameter catalog used to validate edits
    #[serde(default)]
    pub parameters: ParametersConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ConsoleConfig {
    /// Load configuration from file with environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("OBVIEW_").split("__"));

        let config: Self = figment.extract().map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load from a TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.api.base_url.starts_with("http://") && !self.api.base_url.starts_with("https://") {
            return Err(ConfigError::invalid_value(
                "api.base_url",
                "must start with http:// or https://",
            ));
        }

        if self.api.timeout_secs == 0 {
            return Err(ConfigError::invalid_value("api.timeout_secs", "must be positive"));
        }

        if self.monitor.refresh_interval_secs < MIN_REFRESH_INTERVAL_SECS {
            return Err(ConfigError::invalid_value(
                "monitor.refresh_interval_secs",
                format!("must be at least {}s", MIN_REFRESH_INTERVAL_SECS),
            ));
        }

        if self.monitor.default_range_secs == 0 {
            return Err(ConfigError::invalid_value(
                "monitor.default_range_secs",
                "must be positive",
            ));
        }

        let mut seen = AHashSet::new();
        for descriptor in &self.parameters.catalog {
            if !seen.insert(descriptor.name.as_str()) {
                return Err(ConfigError::invalid_value(
                    "parameters.catalog",
                    format!("parameter '{}' is declared twice", descriptor.name),
                ));
            }
            if let ParamType::Int { min, max } = &descriptor.value_type {
                if min > max {
                    return Err(ConfigError::invalid_value(
                        "parameters.catalog",
                        format!("parameter '{}' has min > max", descriptor.name),
                    ));
                }
            }
        }

        Ok(())
    }

    /// Render the default configuration as TOML
    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }

    /// Look up a parameter descriptor; unknown parameters are free-form strings
    pub fn parameter(&self, name: &str) -> ParameterDescriptor {
        self.parameters
            .catalog
            .iter()
            .find(|d| d.name == name)
            .cloned()
            .unwrap_or_else(|| ParameterDescriptor::free_form(name))
    }
}

// ----------------------------------------------------------------------------
// 5.2 API Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_metrics_path")]
    pub metrics_query_path: String,

    #[serde(default = "default_parameters_path")]
    pub parameters_path: String,

    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            metrics_query_path: default_metrics_path(),
            parameters_path: default_parameters_path(),
            timeout_secs: default_http_timeout(),
        }
    }
}

impl ApiConfig {
    pub fn metrics_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.metrics_query_path)
    }

    pub fn parameters_url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), self.parameters_path)
    }
}

fn default_base_url() -> String {
    DEFAULT_API_BASE_URL.into()
}

fn default_metrics_path() -> String {
    DEFAULT_METRICS_QUERY_PATH.into()
}

fn default_parameters_path() -> String {
    DEFAULT_PARAMETERS_PATH.into()
}

fn default_http_timeout() -> u64 {
    DEFAULT_HTTP_TIMEOUT_SECS
}

// ----------------------------------------------------------------------------
// 5.3 Monitor Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Live refresh on by default
    #[serde(default = "default_true")]
    pub live_refresh: bool,

    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,

    /// Trailing window of realtime charts
    #[serde(default = "default_range_secs")]
    pub default_range_secs: u64,

    /// Grouping used when no dimension is selected
    #[serde(default = "default_group_keys")]
    pub default_group_keys: Vec<LabelKey>,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            live_refresh: true,
            refresh_interval_secs: default_refresh_interval(),
            default_range_secs: default_range_secs(),
            default_group_keys: default_group_keys(),
        }
    }
}

impl MonitorConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs)
    }

    pub fn default_grouping(&self) -> GroupKeys {
        self.default_group_keys.iter().copied().collect()
    }
}

fn default_true() -> bool {
    true
}

fn default_refresh_interval() -> u64 {
    DEFAULT_REFRESH_INTERVAL_SECS
}

fn default_range_secs() -> u64 {
    DEFAULT_QUERY_RANGE_SECS
}

fn default_group_keys() -> Vec<LabelKey> {
    vec![LabelKey::ObClusterName]
}

// ----------------------------------------------------------------------------
// 5.4 Parameter Catalog Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParametersConfig {
    #[serde(default)]
    pub catalog: Vec<ParameterDescriptor>,
}

// ----------------------------------------------------------------------------
// 5.5 Logging Configuration
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    #[serde(default = "default_true")]
    pub colors: bool,

    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "compact".into()
}

// ----------------------------------------------------------------------------
// 5.6 Configuration Hot-Reload
// ----------------------------------------------------------------------------

/// Holds the live configuration and notifies listeners on reload
pub struct ConfigManager {
    config: ArcSwap<ConsoleConfig>,
    config_path: Option<PathBuf>,
    callbacks: RwLock<Vec<Box<dyn Fn(&ConsoleConfig) + Send + Sync>>>,
}

impl ConfigManager {
    pub fn new(config: ConsoleConfig) -> Self {
        Self {
            config: ArcSwap::from_pointee(config),
            config_path: None,
            callbacks: RwLock::new(Vec::new()),
        }
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = ConsoleConfig::load(&path)?;
        let mut manager = Self::new(config);
        manager.config_path = Some(path.as_ref().to_path_buf());
        Ok(manager)
    }

    /// Get current configuration
    pub fn get(&self) -> Arc<ConsoleConfig> {
        self.config.load_full()
    }

    /// Swap in a new configuration after validating it
    pub fn update(&self, config: ConsoleConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.config.store(Arc::new(config.clone()));

        let callbacks = self.callbacks.read();
        for callback in callbacks.iter() {
            callback(&config);
        }

        Ok(())
    }

    /// Reload from file
    pub fn reload(&self) -> Result<(), ConfigError> {
        if let Some(path) = &self.config_path {
            let config = ConsoleConfig::load(path)?;
            self.update(config)?;
            info!(target: "obview::config", path = %path.display(), "Configuration reloaded");
        }
        Ok(())
    }

    /// Register a reload callback
    pub fn on_reload<F>(&self, callback: F)
    where
        F: Fn(&ConsoleConfig) + Send + Sync + 'static,
    {
        self.callbacks.write().push(Box::new(callback));
    }
}

impl Debug for ConfigManager {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigManager")
            .field("config", &*self.config.load())
            .field("config_path", &self.config_path)
            .finish()
    }
}

// ============================================================================
// SECTION 6: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================

// ----------------------------------------------------------------------------
// 6.1 Logger Initialization
// ----------------------------------------------------------------------------

/// Initialize the logging system based on configuration
pub fn init_logging(config: &LoggingConfig) -> ObViewResult<()> {
    let level_filter = match config.level.to_lowercase().as_str() {
        "trace" => tracing::level_filters::LevelFilter::TRACE,
        "debug" => tracing::level_filters::LevelFilter::DEBUG,
        "warn" | "warning" => tracing::level_filters::LevelFilter::WARN,
        "error" => tracing::level_filters::LevelFilter::ERROR,
        _ => tracing::level_filters::LevelFilter::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    let installed = match config.format.as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
        "pretty" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .pretty()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
        _ => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_fmt::layer()
                    .compact()
                    .with_ansi(config.colors)
                    .with_target(true),
            );
            tracing::subscriber::set_global_default(subscriber)
        }
    };
    installed.map_err(|e| ObViewError::Internal(format!("Failed to set logger: {}", e)))?;

    debug!(
        target: "obview::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ----------------------------------------------------------------------------
// 6.2 Performance Timer
// ----------------------------------------------------------------------------

/// Measures one operation and warns when it exceeds its threshold
#[derive(Debug)]
pub struct PerfTimer {
    name: &'static str,
    start: Instant,
    threshold_ms: u64,
}

impl PerfTimer {
    pub fn new(name: &'static str) -> Self {
        Self::with_threshold(name, SLOW_PROJECTION_THRESHOLD_MS)
    }

    pub fn with_threshold(name: &'static str, threshold_ms: u64) -> Self {
        Self {
            name,
            start: Instant::now(),
            threshold_ms,
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }

    /// Stop the timer and log if above threshold
    pub fn stop(self) -> u64 {
        let elapsed = self.elapsed_ms();
        if elapsed > self.threshold_ms {
            warn!(
                target: "obview::perf",
                operation = self.name,
                elapsed_ms = elapsed,
                threshold_ms = self.threshold_ms,
                "Operation exceeded threshold"
            );
        } else {
            trace!(
                target: "obview::perf",
                operation = self.name,
                elapsed_ms = elapsed,
                "Operation completed"
            );
        }
        elapsed
    }
}

// ============================================================================
// SECTION 7: FILTER NORMALIZER
// ============================================================================
// Reduces filter chips to the query LabelSet and a (tab, dimension, chips)
// triple to the GroupKeys a chart asks the API to group by.
// ============================================================================

// ----------------------------------------------------------------------------
// 7.1 Query Labels
// ----------------------------------------------------------------------------

/// Canonical query labels for a set of filter chips.
///
/// Chips are applied in order; a later chip carrying the same key replaces
/// the earlier value. The cluster context, when present, pins the cluster.
pub fn normalize_filters(
    chips: &[FilterChip],
    cluster: Option<&ClusterContext>,
) -> Result<LabelSet, LabelError> {
    let mut labels = LabelSet::new();

    if let Some(cluster) = cluster {
        labels.insert(LabelKey::ObClusterName, cluster.name.clone());
        if let Some(id) = cluster.id {
            labels.insert(LabelKey::ObClusterId, id.to_string());
        }
    }

    for chip in chips {
        match chip {
            FilterChip::Zone { name } => {
                check_value(LabelKey::Obzone, name)?;
                labels.insert(LabelKey::Obzone, name.clone());
            }
            FilterChip::Server { ip, port } => {
                check_value(LabelKey::SvrIp, ip)?;
                labels.insert(LabelKey::SvrIp, ip.clone());
                match port {
                    Some(port) => {
                        labels.insert(LabelKey::SvrPort, port.to_string());
                    }
                    // a server chip without a port must not keep a stale one
                    None => {
                        labels.remove(LabelKey::SvrPort);
                    }
                }
            }
            FilterChip::Tenant { name, id } => {
                check_value(LabelKey::TenantName, name)?;
                labels.insert(LabelKey::TenantName, name.clone());
                match id {
                    Some(id) => {
                        labels.insert(LabelKey::TenantId, id.to_string());
                    }
                    None => {
                        labels.remove(LabelKey::TenantId);
                    }
                }
            }
        }
    }

    trace!(target: "obview::filters", labels = %labels, "Filters normalized");
    Ok(labels)
}

fn check_value(key: LabelKey, value: &str) -> Result<(), LabelError> {
    if value.len() > MAX_LABEL_VALUE_LENGTH {
        return Err(LabelError::ValueTooLong {
            key,
            len: value.len(),
        });
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// 7.2 Grouping Keys
// ----------------------------------------------------------------------------

/// Inputs of a grouping decision.
#[derive(Debug, Clone, Copy)]
pub struct GroupingRequest<'a> {
    pub tab: MonitorTab,
    pub dimension: Option<Dimension>,
    /// Active query labels, as produced by [`normalize_filters`]
    pub filters: &'a LabelSet,
    /// Grouping used when no dimension is active
    pub defaults: &'a GroupKeys,
    pub available: CategoryCounts,
}

/// Keys a chart groups its series by.
///
/// An empty result means "ungrouped": the selected dimension has no data to
/// split by.
pub fn normalize_grouping(request: &GroupingRequest<'_>) -> GroupKeys {
    let host = request.tab.is_host_performance();

    let mut keys = match request.dimension {
        None => request.defaults.clone(),
        Some(dimension) => {
            if request.available.count(dimension.category()) == 0 {
                debug!(
                    target: "obview::filters",
                    dimension = ?dimension,
                    "Dimension has no data, leaving chart ungrouped"
                );
                return GroupKeys::ungrouped();
            }
            dimension_keys(dimension, host)
        }
    };

    if request.filters.contains_key(LabelKey::SvrIp) {
        keys.push_unique(LabelKey::SvrIp);
    }
    if !host && request.filters.contains_key(LabelKey::SvrPort) {
        keys.push_unique(LabelKey::SvrPort);
    }

    keys
}

fn dimension_keys(dimension: Dimension, host: bool) -> GroupKeys {
    match dimension {
        Dimension::Unit => [LabelKey::SvrIp, LabelKey::SvrPort, LabelKey::TenantName]
            .into_iter()
            .collect(),
        Dimension::SvrIp if host => GroupKeys(smallvec![LabelKey::SvrIp]),
        Dimension::SvrIp => GroupKeys(smallvec![LabelKey::SvrIp, LabelKey::SvrPort]),
        Dimension::Zone => GroupKeys(smallvec![LabelKey::Obzone]),
        Dimension::Tenant => GroupKeys(smallvec![LabelKey::TenantName]),
    }
}

// ============================================================================
// SECTION 8: REQUEST DEDUPLICATOR
// ============================================================================
// One ChartSession per rendered chart. It owns the fingerprint of the last
// issued query, the viewport counter and a request epoch; nothing else in
// the engine touches them.
// ============================================================================

// ----------------------------------------------------------------------------
// 8.1 Query Fingerprint
// ----------------------------------------------------------------------------

/// Digest of a query bundle. Label and group-key order do not matter;
/// metric order does, since it drives series order in the chart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricQueryFingerprint(u128);

#[derive(Serialize)]
struct CanonicalQuery<'a> {
    labels: Vec<(LabelKey, &'a str)>,
    group_labels: SmallVec<[LabelKey; 4]>,
    start: i64,
    end: i64,
    step: Option<u32>,
    metrics: &'a [CompactString],
    mode: QueryMode,
    refresh: bool,
    filter: Option<&'a str>,
}

impl MetricQueryFingerprint {
    pub fn of(query: &MetricQuery) -> Self {
        let canonical = CanonicalQuery {
            labels: query.labels.canonical(),
            group_labels: query.group_labels.sorted(),
            start: query.range.start,
            end: query.range.end,
            step: query.range.step,
            metrics: &query.metrics,
            mode: query.mode,
            refresh: query.refresh,
            filter: query.filter.as_deref(),
        };
        // plain structs and sequences only, serialization cannot fail
        let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
        Self(xxh3_128(&bytes))
    }

    pub const fn as_u128(&self) -> u128 {
        self.0
    }
}

impl Display for MetricQueryFingerprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

// ----------------------------------------------------------------------------
// 8.2 Viewport Visibility Counter
// ----------------------------------------------------------------------------

/// Counts how often a chart entered the visible area.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ViewportCounter {
    entries: u64,
    visible: bool,
}

impl ViewportCounter {
    /// Mark visible. Returns true on an actual entry.
    pub fn enter(&mut self) -> bool {
        if self.visible {
            return false;
        }
        self.visible = true;
        self.entries += 1;
        true
    }

    pub fn leave(&mut self) {
        self.visible = false;
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn entries(&self) -> u64 {
        self.entries
    }

    pub fn has_entered(&self) -> bool {
        self.entries > 0
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

// ----------------------------------------------------------------------------
// 8.3 Session Types
// ----------------------------------------------------------------------------

/// What the chart currently displays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChartState {
    #[default]
    Idle,
    Loading,
    Ready,
    /// No data, or the last fetch failed
    Empty,
}

/// Why an evaluation happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    PropsChanged,
    EnteredViewport,
    RefreshTick,
    IdentitySwitched,
}

/// Why a candidate did not go out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuppressReason {
    /// The chart has never been scrolled into view
    NeverVisible,
    /// The chart is currently out of view
    Hidden,
    /// Same fingerprint as the last issued query
    Duplicate,
}

/// A query that must be sent. The epoch ties the response back to the
/// session state that asked for it.
#[derive(Debug, Clone)]
pub struct FetchTicket {
    pub epoch: u64,
    pub fingerprint: MetricQueryFingerprint,
    pub query: MetricQuery,
}

#[derive(Debug, Clone)]
pub enum Decision {
    Issue(FetchTicket),
    Suppressed(SuppressReason),
}

impl Decision {
    pub fn is_issue(&self) -> bool {
        matches!(self, Decision::Issue(_))
    }
}

/// Result of handing a response back to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    Applied,
    Failed,
    /// A newer query was issued meanwhile; the response was dropped
    Stale,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub issued: u64,
    pub suppressed: u64,
    pub applied: u64,
    pub failed: u64,
    pub stale: u64,
}

// ----------------------------------------------------------------------------
// 8.4 Chart Session
// ----------------------------------------------------------------------------

/// Per-chart query slot.
#[derive(Debug)]
pub struct ChartSession {
    id: Uuid,
    identity: CompactString,
    last_fingerprint: Option<MetricQueryFingerprint>,
    viewport: ViewportCounter,
    epoch: u64,
    state: ChartState,
    series: Vec<MetricSeries>,
    last_error: Option<QueryError>,
    stats: SessionStats,
}

impl ChartSession {
    /// `identity` names what the slot shows, e.g. the metric group key.
    pub fn new(identity: impl Into<CompactString>) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity: identity.into(),
            last_fingerprint: None,
            viewport: ViewportCounter::default(),
            epoch: 0,
            state: ChartState::Idle,
            series: Vec::new(),
            last_error: None,
            stats: SessionStats::default(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn state(&self) -> ChartState {
        self.state
    }

    pub fn series(&self) -> &[MetricSeries] {
        &self.series
    }

    pub fn last_error(&self) -> Option<&QueryError> {
        self.last_error.as_ref()
    }

    pub fn last_fingerprint(&self) -> Option<MetricQueryFingerprint> {
        self.last_fingerprint
    }

    pub fn viewport(&self) -> ViewportCounter {
        self.viewport
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Report viewport visibility. Returns true when the chart just entered
    /// the viewport, in which case the caller evaluates once.
    pub fn set_visible(&mut self, visible: bool) -> bool {
        if visible {
            let entered = self.viewport.enter();
            if entered {
                trace!(
                    target: "obview::dedup",
                    chart = %self.identity,
                    entries = self.viewport.entries(),
                    "Chart entered viewport"
                );
            }
            entered
        } else {
            self.viewport.leave();
            false
        }
    }

    /// Decide whether `candidate` goes out.
    ///
    /// The fingerprint is stored before the fetch resolves, so a second
    /// identical evaluation in the same batch is suppressed.
    pub fn evaluate(&mut self, candidate: &MetricQuery, trigger: Trigger) -> Decision {
        let reason = if !self.viewport.has_entered() {
            Some(SuppressReason::NeverVisible)
        } else if !self.viewport.is_visible() {
            Some(SuppressReason::Hidden)
        } else {
            None
        };

        let fingerprint = MetricQueryFingerprint::of(candidate);
        let reason = reason.or_else(|| {
            (self.last_fingerprint == Some(fingerprint)).then_some(SuppressReason::Duplicate)
        });

        if let Some(reason) = reason {
            self.stats.suppressed += 1;
            trace!(
                target: "obview::dedup",
                chart = %self.identity,
                trigger = ?trigger,
                reason = ?reason,
                "Query suppressed"
            );
            return Decision::Suppressed(reason);
        }

        self.last_fingerprint = Some(fingerprint);
        self.epoch += 1;
        self.state = ChartState::Loading;
        self.stats.issued += 1;

        debug!(
            target: "obview::dedup",
            chart = %self.identity,
            trigger = ?trigger,
            epoch = self.epoch,
            fingerprint = %fingerprint,
            "Query issued"
        );

        Decision::Issue(FetchTicket {
            epoch: self.epoch,
            fingerprint,
            query: candidate.clone(),
        })
    }

    /// Hand a response back. Only the most recently issued ticket applies.
    ///
    /// A failure empties the chart and forgets the fingerprint so the same
    /// query goes out again on the next trigger.
    pub fn complete(
        &mut self,
        ticket: &FetchTicket,
        result: QueryResult<Vec<MetricSeries>>,
    ) -> CompletionOutcome {
        if ticket.epoch != self.epoch {
            self.stats.stale += 1;
            debug!(
                target: "obview::dedup",
                chart = %self.identity,
                ticket_epoch = ticket.epoch,
                current_epoch = self.epoch,
                "Dropping stale response"
            );
            return CompletionOutcome::Stale;
        }

        match result {
            Ok(series) => {
                self.state = if series.is_empty() {
                    ChartState::Empty
                } else {
                    ChartState::Ready
                };
                self.series = series;
                self.last_error = None;
                self.stats.applied += 1;
                CompletionOutcome::Applied
            }
            Err(err) => {
                warn!(
                    target: "obview::dedup",
                    chart = %self.identity,
                    error = %err,
                    "Query failed, showing empty state"
                );
                self.series.clear();
                self.state = ChartState::Empty;
                self.last_fingerprint = None;
                self.last_error = Some(err);
                self.stats.failed += 1;
                CompletionOutcome::Failed
            }
        }
    }

    /// Point the slot at something else (e.g. another metric group under
    /// the same tab). Fingerprint and viewport counter start over; in-flight
    /// responses become stale. Returns true when the chart is on screen and
    /// should evaluate right away.
    pub fn switch_identity(&mut self, identity: impl Into<CompactString>) -> bool {
        let identity = identity.into();
        if identity == self.identity {
            return false;
        }
        info!(
            target: "obview::dedup",
            from = %self.identity,
            to = %identity,
            "Chart identity switched"
        );
        self.identity = identity;
        self.reset()
    }

    /// Forget everything learned about the current slot. A chart that is on
    /// screen counts as a fresh viewport entry.
    pub fn reset(&mut self) -> bool {
        let was_visible = self.viewport.is_visible();
        self.last_fingerprint = None;
        self.viewport.reset();
        self.epoch += 1;
        self.series.clear();
        self.last_error = None;
        self.state = ChartState::Idle;
        if was_visible {
            self.viewport.enter()
        } else {
            false
        }
    }
}

// ============================================================================
// SECTION 9: VIEW PROJECTOR
// ============================================================================
// Flat server records and edit rows in, freshly built view models out.
// Nothing is patched in place: every projection builds a new owned tree.
// ============================================================================

// ----------------------------------------------------------------------------
// 9.1 Parameter Values & Topology
// ----------------------------------------------------------------------------

/// A parameter value as the database reports it ("10", "true", "2G", "30s").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamValue(CompactString);

impl ParamValue {
    pub fn new(value: impl Into<CompactString>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl Display for ParamValue {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ParamValue {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for ParamValue {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

/// Identity of one observer process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerKey {
    pub ip: CompactString,
    pub port: u16,
}

impl ServerKey {
    pub fn new(ip: impl Into<CompactString>, port: u16) -> Self {
        Self { ip: ip.into(), port }
    }
}

impl Display for ServerKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.ip, self.port)
    }
}

/// A server target as typed or picked: `ip` or `ip:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerTarget {
    pub ip: CompactString,
    pub port: Option<u16>,
}

impl ServerTarget {
    pub fn matches(&self, key: &ServerKey) -> bool {
        self.ip == key.ip && self.port.map_or(true, |port| port == key.port)
    }
}

impl FromStr for ServerTarget {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || TopologyError::InvalidServerTarget {
            target: s.to_string(),
        };
        if s.is_empty() {
            return Err(invalid());
        }
        match s.rsplit_once(':') {
            Some((ip, port)) if !ip.is_empty() && !ip.contains(':') => {
                let port = port.parse::<u16>().map_err(|_| invalid())?;
                Ok(Self {
                    ip: ip.into(),
                    port: Some(port),
                })
            }
            Some(_) => Err(invalid()),
            None => Ok(Self {
                ip: s.into(),
                port: None,
            }),
        }
    }
}

/// One server leaf of the cluster topology with its current value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerValue {
    pub ip: CompactString,
    pub port: u16,
    pub original: ParamValue,
}

impl ServerValue {
    pub fn key(&self) -> ServerKey {
        ServerKey::new(self.ip.clone(), self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneTopology {
    pub name: CompactString,
    #[serde(default)]
    pub servers: Vec<ServerValue>,
}

/// Cluster → zone → server, with each server's current parameter value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterTopology {
    pub name: CompactString,
    #[serde(default)]
    pub zones: Vec<ZoneTopology>,
}

impl ClusterTopology {
    pub fn new(name: impl Into<CompactString>) -> Self {
        Self {
            name: name.into(),
            zones: Vec::new(),
        }
    }

    /// Builder used by tests and the CLI
    pub fn with_zone<I>(mut self, zone: impl Into<CompactString>, servers: I) -> Self
    where
        I: IntoIterator<Item = ServerValue>,
    {
        self.zones.push(ZoneTopology {
            name: zone.into(),
            servers: servers.into_iter().collect(),
        });
        self
    }

    /// Reject duplicated zones or servers
    pub fn validate(&self) -> Result<(), TopologyError> {
        let mut zones = AHashSet::new();
        let mut servers = AHashSet::new();
        for zone in &self.zones {
            if !zones.insert(zone.name.as_str()) {
                return Err(TopologyError::DuplicateZone {
                    zone: zone.name.to_string(),
                });
            }
            for server in &zone.servers {
                if !servers.insert(server.key()) {
                    return Err(TopologyError::DuplicateServer {
                        address: server.key().to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    /// Every (zone, server) pair in topology order
    pub fn servers(&self) -> impl Iterator<Item = (&ZoneTopology, &ServerValue)> {
        self.zones
            .iter()
            .flat_map(|zone| zone.servers.iter().map(move |server| (zone, server)))
    }

    pub fn server_count(&self) -> usize {
        self.zones.iter().map(|z| z.servers.len()).sum()
    }

    pub fn zone(&self, name: &str) -> Option<&ZoneTopology> {
        self.zones.iter().find(|z| z.name == name)
    }

    /// Servers an assignment reaches. Targets that no longer exist in the
    /// topology reach nothing.
    pub fn resolve_targets(&self, assignment: &ScopeAssignment) -> Vec<ServerKey> {
        match assignment.range {
            EffectiveRange::Cluster => self.servers().map(|(_, s)| s.key()).collect(),
            EffectiveRange::Zone => assignment
                .targets
                .iter()
                .filter_map(|target| {
                    let zone = self.zone(target);
                    if zone.is_none() {
                        debug!(target: "obview::projector", zone = %target, "Unknown zone target");
                    }
                    zone
                })
                .flat_map(|zone| zone.servers.iter().map(ServerValue::key))
                .collect(),
            EffectiveRange::Server => {
                let targets: Vec<ServerTarget> = assignment
                    .targets
                    .iter()
                    .filter_map(|t| match t.parse::<ServerTarget>() {
                        Ok(target) => Some(target),
                        Err(err) => {
                            debug!(target: "obview::projector", error = %err, "Skipping server target");
                            None
                        }
                    })
                    .collect();
                self.servers()
                    .map(|(_, s)| s.key())
                    .filter(|key| targets.iter().any(|t| t.matches(key)))
                    .collect()
            }
            EffectiveRange::Tenant | EffectiveRange::AllTenants => Vec::new(),
        }
    }

    /// Candidate targets of a range: zone names, or server `ip:port` grouped
    /// by zone.
    pub fn candidates(&self, range: EffectiveRange) -> Vec<(Option<CompactString>, Vec<CompactString>)> {
        match range {
            EffectiveRange::Zone => vec![(None, self.zones.iter().map(|z| z.name.clone()).collect())],
            EffectiveRange::Server => self
                .zones
                .iter()
                .map(|zone| {
                    let servers = zone
                        .servers
                        .iter()
                        .map(|s| CompactString::from(s.key().to_string()))
                        .collect();
                    (Some(zone.name.clone()), servers)
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Whether `target` still names something for `range`
    pub fn is_valid_target(&self, range: EffectiveRange, target: &str) -> bool {
        match range {
            EffectiveRange::Zone => self.zone(target).is_some(),
            EffectiveRange::Server => match target.parse::<ServerTarget>() {
                Ok(t) => self.servers().any(|(_, s)| t.matches(&s.key())),
                Err(_) => false,
            },
            _ => false,
        }
    }
}

/// A tenant with its current value of a tenant-scoped parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantValue {
    pub name: CompactString,
    pub id: u64,
    pub original: ParamValue,
}

impl TenantValue {
    pub fn new(name: impl Into<CompactString>, id: u64, original: impl Into<ParamValue>) -> Self {
        Self {
            name: name.into(),
            id,
            original: original.into(),
        }
    }
}

pub fn validate_tenants(tenants: &[TenantValue]) -> Result<(), TopologyError> {
    let mut seen = AHashSet::new();
    for tenant in tenants {
        if !seen.insert(tenant.name.as_str()) {
            return Err(TopologyError::DuplicateTenant {
                tenant: tenant.name.to_string(),
            });
        }
    }
    Ok(())
}

// ----------------------------------------------------------------------------
// 9.2 Scope Assignments
// ----------------------------------------------------------------------------

/// Where a new parameter value takes effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum EffectiveRange {
    #[default]
    Cluster,
    Zone,
    Server,
    Tenant,
    AllTenants,
}

impl EffectiveRange {
    pub const fn is_cluster_scoped(&self) -> bool {
        matches!(self, EffectiveRange::Cluster | EffectiveRange::Zone | EffectiveRange::Server)
    }

    pub const fn is_tenant_scoped(&self) -> bool {
        matches!(self, EffectiveRange::Tenant | EffectiveRange::AllTenants)
    }
}

impl Display for EffectiveRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            EffectiveRange::Cluster => "cluster",
            EffectiveRange::Zone => "zone",
            EffectiveRange::Server => "server",
            EffectiveRange::Tenant => "tenant",
            EffectiveRange::AllTenants => "all_tenants",
        };
        f.write_str(name)
    }
}

/// One edit row: a value, where it applies, and to what.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeAssignment {
    pub value: ParamValue,
    pub range: EffectiveRange,
    #[serde(default)]
    pub targets: Vec<CompactString>,
}

impl ScopeAssignment {
    pub fn cluster(value: impl Into<ParamValue>) -> Self {
        Self {
            value: value.into(),
            range: EffectiveRange::Cluster,
            targets: Vec::new(),
        }
    }

    pub fn new<I, T>(range: EffectiveRange, targets: I, value: impl Into<ParamValue>) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<CompactString>,
    {
        Self {
            value: value.into(),
            range,
            targets: targets.into_iter().map(Into::into).collect(),
        }
    }

    /// Cluster-wide rows carry no targets, every other range needs some.
    pub fn targets_are_consistent(&self) -> bool {
        match self.range {
            EffectiveRange::Cluster => self.targets.is_empty(),
            _ => !self.targets.is_empty(),
        }
    }

    /// Whether this row covers every tenant
    pub fn targets_all_tenants(&self) -> bool {
        self.range == EffectiveRange::AllTenants
            || (self.range == EffectiveRange::Tenant
                && self.targets.iter().any(|t| t.as_str() == ALL_TENANTS))
    }
}

// ----------------------------------------------------------------------------
// 9.3 Resolution Policy
// ----------------------------------------------------------------------------

/// Final value per server.
pub type ResourceValueMap = BTreeMap<ServerKey, ParamValue>;

/// Decides in which order overlapping assignments apply; the last applied
/// assignment wins for each resource.
pub trait ResolutionPolicy: Debug {
    /// Indices into `assignments`, in application order
    fn order(&self, assignments: &[ScopeAssignment]) -> Vec<usize>;
}

/// Later rows override earlier rows.
#[derive(Debug, Clone, Copy, Default)]
pub struct ArrayOrder;

impl ResolutionPolicy for ArrayOrder {
    fn order(&self, assignments: &[ScopeAssignment]) -> Vec<usize> {
        (0..assignments.len()).collect()
    }
}

/// Final per-server values of a list of assignments. Servers no assignment
/// reaches are absent from the map.
pub fn resolve(
    topology: &ClusterTopology,
    assignments: &[ScopeAssignment],
    policy: &dyn ResolutionPolicy,
) -> ResourceValueMap {
    let mut values = ResourceValueMap::new();
    for index in policy.order(assignments) {
        let Some(assignment) = assignments.get(index) else {
            continue;
        };
        for key in topology.resolve_targets(assignment) {
            values.insert(key, assignment.value.clone());
        }
    }
    values
}

// ----------------------------------------------------------------------------
// 9.4 Effective-Scope Tree
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeLevel {
    Cluster,
    Zone,
    Server,
}

/// One node of the projected tree. Only server leaves carry values; an inner
/// node is `changed` when any leaf below it is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    /// Stable key for the tree widget
    pub key: String,
    pub title: CompactString,
    pub level: NodeLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<ParamValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original: Option<ParamValue>,
    pub changed: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    fn leaf(server: &ServerValue, value: ParamValue) -> Self {
        let key = server.key();
        let changed = value != server.original;
        Self {
            key: format!("server:{}", key),
            title: CompactString::from(key.to_string()),
            level: NodeLevel::Server,
            value: Some(value),
            original: Some(server.original.clone()),
            changed,
            children: Vec::new(),
        }
    }

    fn inner(key: String, title: CompactString, level: NodeLevel, children: Vec<TreeNode>) -> Self {
        let changed = children.iter().any(|c| c.changed);
        Self {
            key,
            title,
            level,
            value: None,
            original: None,
            changed,
            children,
        }
    }

    /// Depth-first leaves
    pub fn leaves(&self) -> Vec<&TreeNode> {
        if self.children.is_empty() {
            return if self.level == NodeLevel::Server {
                vec![self]
            } else {
                Vec::new()
            };
        }
        self.children.iter().flat_map(|c| c.leaves()).collect()
    }
}

/// cluster → zone → server, rebuilt from scratch on every projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterTree {
    pub root: TreeNode,
}

impl ParameterTree {
    /// Project with array-order precedence.
    pub fn project(topology: &ClusterTopology, assignments: &[ScopeAssignment]) -> Self {
        Self::project_with(topology, assignments, &ArrayOrder)
    }

    pub fn project_with(
        topology: &ClusterTopology,
        assignments: &[ScopeAssignment],
        policy: &dyn ResolutionPolicy,
    ) -> Self {
        let timer = PerfTimer::new("project_tree");
        let values = resolve(topology, assignments, policy);

        let zones = topology
            .zones
            .iter()
            .map(|zone| {
                let leaves = zone
                    .servers
                    .iter()
                    .map(|server| {
                        let value = values
                            .get(&server.key())
                            .cloned()
                            .unwrap_or_else(|| server.original.clone());
                        TreeNode::leaf(server, value)
                    })
                    .collect();
                TreeNode::inner(
                    format!("zone:{}", zone.name),
                    zone.name.clone(),
                    NodeLevel::Zone,
                    leaves,
                )
            })
            .collect();

        let root = TreeNode::inner(
            format!("cluster:{}", topology.name),
            topology.name.clone(),
            NodeLevel::Cluster,
            zones,
        );
        timer.stop();

        Self { root }
    }

    pub fn leaves(&self) -> Vec<&TreeNode> {
        self.root.leaves()
    }

    /// Leaf of one server
    pub fn leaf(&self, ip: &str, port: u16) -> Option<&TreeNode> {
        let title = ServerKey::new(ip, port).to_string();
        self.leaves().into_iter().find(|leaf| leaf.title == title)
    }

    pub fn changed_count(&self) -> usize {
        self.leaves().iter().filter(|l| l.changed).count()
    }
}

// ----------------------------------------------------------------------------
// 9.5 Overlap Detection
// ----------------------------------------------------------------------------

/// Which rows claim a server IP some other row also claims. A warning only;
/// submission stays allowed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlapReport {
    pub rows: Vec<bool>,
}

impl OverlapReport {
    pub fn has_overlap(&self) -> bool {
        self.rows.iter().any(|o| *o)
    }

    pub fn overlapping_rows(&self) -> Vec<usize> {
        self.rows
            .iter()
            .enumerate()
            .filter_map(|(i, o)| o.then_some(i))
            .collect()
    }
}

/// Per-row overlap flags, compared by server IP.
pub fn detect_overlaps(topology: &ClusterTopology, assignments: &[ScopeAssignment]) -> OverlapReport {
    let claimed: Vec<AHashSet<CompactString>> = assignments
        .iter()
        .map(|a| topology.resolve_targets(a).into_iter().map(|k| k.ip).collect())
        .collect();

    let mut claims: AHashMap<&str, usize> = AHashMap::new();
    for ips in &claimed {
        for ip in ips {
            *claims.entry(ip.as_str()).or_insert(0) += 1;
        }
    }

    let rows = claimed
        .iter()
        .map(|ips| ips.iter().any(|ip| claims.get(ip.as_str()).copied().unwrap_or(0) > 1))
        .collect();

    let report = OverlapReport { rows };
    if report.has_overlap() {
        debug!(
            target: "obview::projector",
            rows = ?report.overlapping_rows(),
            "Assignments overlap"
        );
    }
    report
}

// ----------------------------------------------------------------------------
// 9.6 Tenant Value Merge
// ----------------------------------------------------------------------------

/// One row of the tenant-scoped result list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantValueRow {
    pub tenant_name: CompactString,
    pub value: ParamValue,
    /// Absent when an assignment names a tenant the topology does not know
    pub tenant_id: Option<u64>,
    pub is_new_value: bool,
}

/// Merge tenant assignments over the tenants' original values.
///
/// Assignment-derived rows come first, in order of first appearance, carrying
/// the value of the last assignment that reached them. Tenants no assignment
/// reaches follow with their original value.
pub fn merge_tenant_values(
    tenants: &[TenantValue],
    assignments: &[ScopeAssignment],
) -> Vec<TenantValueRow> {
    merge_tenant_values_with(tenants, assignments, &ArrayOrder)
}

pub fn merge_tenant_values_with(
    tenants: &[TenantValue],
    assignments: &[ScopeAssignment],
    policy: &dyn ResolutionPolicy,
) -> Vec<TenantValueRow> {
    let mut order: Vec<CompactString> = Vec::new();
    let mut assigned: AHashMap<CompactString, ParamValue> = AHashMap::new();

    for index in policy.order(assignments) {
        let Some(assignment) = assignments.get(index) else {
            continue;
        };
        if !assignment.range.is_tenant_scoped() {
            continue;
        }
        let names: Vec<CompactString> = if assignment.targets_all_tenants() {
            tenants.iter().map(|t| t.name.clone()).collect()
        } else {
            assignment.targets.clone()
        };
        for name in names {
            if assigned.insert(name.clone(), assignment.value.clone()).is_none() {
                order.push(name);
            }
        }
    }

    let by_name: AHashMap<&str, &TenantValue> =
        tenants.iter().map(|t| (t.name.as_str(), t)).collect();

    let mut rows: Vec<TenantValueRow> = order
        .into_iter()
        .filter_map(|name| {
            let value = assigned.get(&name)?.clone();
            let tenant = by_name.get(name.as_str());
            let is_new_value = tenant.map_or(true, |t| t.original != value);
            Some(TenantValueRow {
                tenant_id: tenant.map(|t| t.id),
                tenant_name: name,
                value,
                is_new_value,
            })
        })
        .collect();

    rows.extend(
        tenants
            .iter()
            .filter(|t| !assigned.contains_key(&t.name))
            .map(|t| TenantValueRow {
                tenant_name: t.name.clone(),
                value: t.original.clone(),
                tenant_id: Some(t.id),
                is_new_value: false,
            }),
    );

    rows
}

// ----------------------------------------------------------------------------
// 9.7 Chart Series Projection
// ----------------------------------------------------------------------------

/// One line of a chart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartSeries {
    pub name: String,
    pub metric: CompactString,
    /// The grouping labels this line stands for
    pub group: LabelSet,
    pub points: Vec<MetricPoint>,
}

/// What the charting collaborator draws.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChartViewModel {
    pub grouped_by: GroupKeys,
    pub series: Vec<ChartSeries>,
}

impl ChartViewModel {
    pub fn is_empty(&self) -> bool {
        self.series.iter().all(|s| s.points.is_empty())
    }
}

/// Group label values joined with ':', e.g. `10.0.0.1:2882`.
fn group_name(labels: &LabelSet, grouping: &GroupKeys) -> String {
    grouping
        .iter()
        .map(|key| labels.get(key).unwrap_or(MISSING_LABEL_VALUE))
        .collect::<Vec<_>>()
        .join(":")
}

/// Regroup raw series into chart lines, one per (metric, group). Points of
/// series landing on the same line are merged and sorted by time.
pub fn project_series(series: &[MetricSeries], grouping: &GroupKeys) -> ChartViewModel {
    let metrics: BTreeSet<&str> = series.iter().map(|s| s.metric.as_str()).collect();
    let multi_metric = metrics.len() > 1;

    let mut lines: BTreeMap<(String, CompactString), ChartSeries> = BTreeMap::new();
    for raw in series {
        let name = if grouping.is_ungrouped() {
            raw.metric.to_string()
        } else {
            let group = group_name(&raw.labels, grouping);
            if multi_metric {
                format!("{} ({})", raw.metric, group)
            } else {
                group
            }
        };
        let line = lines
            .entry((name.clone(), raw.metric.clone()))
            .or_insert_with(|| ChartSeries {
                name,
                metric: raw.metric.clone(),
                group: raw.labels.project(grouping),
                points: Vec::new(),
            });
        line.points.extend(raw.points.iter().copied());
    }

    let series = lines
        .into_values()
        .map(|mut line| {
            line.points.sort_by_key(|p| p.ts);
            line
        })
        .collect();

    ChartViewModel {
        grouped_by: grouping.clone(),
        series,
    }
}

// ----------------------------------------------------------------------------
// 9.8 Table Projection
// ----------------------------------------------------------------------------

/// One row of the grid view: latest value of every metric for one group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableRow {
    pub key: String,
    pub labels: LabelSet,
    pub values: BTreeMap<CompactString, f64>,
}

pub fn project_table(series: &[MetricSeries], grouping: &GroupKeys) -> Vec<TableRow> {
    let mut rows: BTreeMap<String, TableRow> = BTreeMap::new();
    let mut latest_ts: AHashMap<(String, CompactString), i64> = AHashMap::new();

    for raw in series {
        let Some(point) = raw.latest() else {
            continue;
        };
        let key = group_name(&raw.labels, grouping);
        let row = rows.entry(key.clone()).or_insert_with(|| TableRow {
            key: key.clone(),
            labels: raw.labels.project(grouping),
            values: BTreeMap::new(),
        });
        let seen = latest_ts.entry((key, raw.metric.clone())).or_insert(i64::MIN);
        if point.ts >= *seen {
            *seen = point.ts;
            row.values.insert(raw.metric.clone(), point.value);
        }
    }

    rows.into_values().collect()
}

// ============================================================================
// SECTION 10: PARAMETER CATALOG & VALUE VALIDATION
// ============================================================================

// ----------------------------------------------------------------------------
// 10.1 Parameter Descriptors
// ----------------------------------------------------------------------------

/// Whether a parameter is set on observers or on tenants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterScopeKind {
    #[default]
    Cluster,
    Tenant,
}

/// Accepted shape of a parameter value.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParamType {
    Int { min: i64, max: i64 },
    Bool,
    /// Size literal such as `512M` or `2G`
    Capacity,
    /// Duration literal such as `30s` or `1h`
    Duration,
    Enum { values: Vec<String> },
    #[default]
    String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterDescriptor {
    pub name: String,
    #[serde(default)]
    pub value_type: ParamType,
    #[serde(default)]
    pub scope: ParameterScopeKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

static CAPACITY_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\d+(\.\d+)?\s*[KMGTP]?B?$").expect("capacity pattern is valid"));

static DURATION_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^\d+\s*(us|ms|s|m|h|d)?$").expect("duration pattern is valid"));

impl ParameterDescriptor {
    /// A cluster parameter accepting any non-blank string
    pub fn free_form(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value_type: ParamType::String,
            scope: ParameterScopeKind::Cluster,
            description: None,
        }
    }

    pub fn with_type(mut self, value_type: ParamType) -> Self {
        self.value_type = value_type;
        self
    }

    pub fn with_scope(mut self, scope: ParameterScopeKind) -> Self {
        self.scope = scope;
        self
    }

    /// Check a value against the declared type. The message is shown inline.
    pub fn validate_value(&self, value: &ParamValue) -> Result<(), String> {
        let raw = value.as_str().trim();
        if raw.is_empty() {
            return Err("a value is required".into());
        }
        match &self.value_type {
            ParamType::Int { min, max } => {
                let parsed: i64 = raw
                    .parse()
                    .map_err(|_| format!("'{}' is not an integer", raw))?;
                if parsed < *min || parsed > *max {
                    return Err(format!("must be between {} and {}", min, max));
                }
                Ok(())
            }
            ParamType::Bool => match raw.to_ascii_lowercase().as_str() {
                "true" | "false" => Ok(()),
                _ => Err("must be true or false".into()),
            },
            ParamType::Capacity if CAPACITY_RE.is_match(raw) => Ok(()),
            ParamType::Capacity => Err(format!("'{}' is not a capacity such as 512M or 2G", raw)),
            ParamType::Duration if DURATION_RE.is_match(raw) => Ok(()),
            ParamType::Duration => Err(format!("'{}' is not a duration such as 30s or 1h", raw)),
            ParamType::Enum { values } if values.iter().any(|v| v == raw) => Ok(()),
            ParamType::Enum { values } => Err(format!("must be one of {}", values.join(", "))),
            ParamType::String => Ok(()),
        }
    }
}

// ----------------------------------------------------------------------------
// 10.2 Submission Requests
// ----------------------------------------------------------------------------

/// Scope field of a set-parameter request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParameterScope {
    Cluster,
    Zone,
    Server,
    Tenant,
}

/// One entry of the array handed to the parameter capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterSetRequest {
    pub name: String,
    pub value: ParamValue,
    pub scope: ParameterScope,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zones: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub servers: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenants: Option<Vec<String>>,
}

impl ParameterSetRequest {
    fn new(name: &str, value: ParamValue, scope: ParameterScope) -> Self {
        Self {
            name: name.to_string(),
            value,
            scope,
            zones: None,
            servers: None,
            tenants: None,
        }
    }
}

fn to_strings(targets: &[CompactString]) -> Vec<String> {
    targets.iter().map(|t| t.to_string()).collect()
}

// ============================================================================
// SECTION 11: SELECTION / SCOPE RECONCILER
// ============================================================================
// Edit sessions of the parameter drawer. A session owns its rows and the
// topology they were picked against, recomputes the selectable options after
// every change and refuses picks the selector would have disabled.
// ============================================================================

// ----------------------------------------------------------------------------
// 11.1 Select Options
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectOption {
    pub value: CompactString,
    pub label: String,
    pub disabled: bool,
}

impl SelectOption {
    fn enabled(value: impl Into<CompactString>, label: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            label: label.into(),
            disabled: false,
        }
    }
}

/// Options under an optional heading (servers are grouped by zone).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionGroup {
    pub label: Option<CompactString>,
    pub options: Vec<SelectOption>,
}

fn dedup_targets<I, T>(targets: I) -> Vec<CompactString>
where
    I: IntoIterator<Item = T>,
    T: Into<CompactString>,
{
    let mut seen = AHashSet::new();
    targets
        .into_iter()
        .map(Into::into)
        .filter(|t: &CompactString| seen.insert(t.clone()))
        .collect()
}

// ----------------------------------------------------------------------------
// 11.2 Cluster-Scoped Sessions
// ----------------------------------------------------------------------------

/// One edit row of a cluster parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterEditRow {
    pub value: ParamValue,
    pub range: EffectiveRange,
    #[serde(default)]
    pub targets: Vec<CompactString>,
    /// Effect of this row alone, cached while the row is complete
    #[serde(skip)]
    overrides: Option<ResourceValueMap>,
}

impl ClusterEditRow {
    fn new() -> Self {
        Self {
            value: ParamValue::default(),
            range: EffectiveRange::Cluster,
            targets: Vec::new(),
            overrides: None,
        }
    }

    fn as_assignment(&self) -> ScopeAssignment {
        ScopeAssignment {
            value: self.value.clone(),
            range: self.range,
            targets: self.targets.clone(),
        }
    }

    fn is_complete(&self) -> bool {
        !self.value.is_blank() && self.as_assignment().targets_are_consistent()
    }
}

/// Edit session of a cluster parameter against a cluster → zone → server
/// topology.
#[derive(Debug, Clone)]
pub struct ClusterScopeSession {
    parameter: ParameterDescriptor,
    topology: ClusterTopology,
    rows: Vec<ClusterEditRow>,
}

impl ClusterScopeSession {
    pub fn new(parameter: ParameterDescriptor, topology: ClusterTopology) -> Result<Self, TopologyError> {
        topology.validate()?;
        Ok(Self {
            parameter,
            topology,
            rows: Vec::new(),
        })
    }

    /// Rebuild a session from previously entered assignments. Each row goes
    /// through the same checks as an interactive edit.
    pub fn from_assignments(
        parameter: ParameterDescriptor,
        topology: ClusterTopology,
        assignments: &[ScopeAssignment],
    ) -> ObViewResult<Self> {
        let mut session = Self::new(parameter, topology)?;
        for assignment in assignments {
            let row = session.add_row()?;
            session.set_range(row, assignment.range)?;
            session.set_targets(row, assignment.targets.iter().cloned())?;
            session.set_value(row, assignment.value.clone())?;
        }
        Ok(session)
    }

    pub fn parameter(&self) -> &ParameterDescriptor {
        &self.parameter
    }

    pub fn topology(&self) -> &ClusterTopology {
        &self.topology
    }

    pub fn rows(&self) -> &[ClusterEditRow] {
        &self.rows
    }

    fn row_mut(&mut self, row: usize) -> Result<&mut ClusterEditRow, ReconcileError> {
        let rows = self.rows.len();
        self.rows
            .get_mut(row)
            .ok_or(ReconcileError::RowOutOfRange { row, rows })
    }

    fn check_row(&self, row: usize) -> Result<&ClusterEditRow, ReconcileError> {
        self.rows.get(row).ok_or(ReconcileError::RowOutOfRange {
            row,
            rows: self.rows.len(),
        })
    }

    /// Append an empty cluster-wide row
    pub fn add_row(&mut self) -> Result<usize, ReconcileError> {
        if self.rows.len() >= MAX_EDIT_ROWS {
            return Err(ReconcileError::TooManyRows { max: MAX_EDIT_ROWS });
        }
        self.rows.push(ClusterEditRow::new());
        Ok(self.rows.len() - 1)
    }

    pub fn remove_row(&mut self, row: usize) -> Result<ClusterEditRow, ReconcileError> {
        self.check_row(row)?;
        Ok(self.rows.remove(row))
    }

    pub fn set_value(&mut self, row: usize, value: impl Into<ParamValue>) -> Result<(), ReconcileError> {
        self.row_mut(row)?.value = value.into();
        self.refresh_overrides(row);
        Ok(())
    }

    /// Change the effective range. The row's targets and cached overrides are
    /// dropped so the user picks targets again under the new range.
    pub fn set_range(&mut self, row: usize, range: EffectiveRange) -> Result<(), ReconcileError> {
        if !range.is_cluster_scoped() {
            return Err(ReconcileError::RangeNotApplicable { range });
        }
        let edit = self.row_mut(row)?;
        if edit.range != range {
            debug!(
                target: "obview::reconciler",
                row,
                from = %edit.range,
                to = %range,
                "Range changed, clearing targets"
            );
        }
        edit.range = range;
        edit.targets.clear();
        edit.overrides = None;
        Ok(())
    }

    /// Replace the row's targets. Every target must name a zone (zone range)
    /// or a server `ip` / `ip:port` (server range) of the topology.
    pub fn set_targets<I, T>(&mut self, row: usize, targets: I) -> Result<(), ReconcileError>
    where
        I: IntoIterator<Item = T>,
        T: Into<CompactString>,
    {
        let range = self.check_row(row)?.range;
        let targets = dedup_targets(targets);

        if range == EffectiveRange::Cluster {
            if let Some(first) = targets.first() {
                return Err(ReconcileError::OptionDisabled {
                    row,
                    value: first.to_string(),
                });
            }
        }
        if let Some(unknown) = targets
            .iter()
            .find(|t| !self.topology.is_valid_target(range, t))
        {
            return Err(ReconcileError::UnknownTarget {
                row,
                value: unknown.to_string(),
            });
        }

        self.row_mut(row)?.targets = targets;
        self.refresh_overrides(row);
        Ok(())
    }

    /// Select every candidate of the row's range, replacing any partial pick.
    pub fn select_all(&mut self, row: usize) -> Result<&[CompactString], ReconcileError> {
        let range = self.check_row(row)?.range;
        let all: Vec<CompactString> = self
            .topology
            .candidates(range)
            .into_iter()
            .flat_map(|(_, values)| values)
            .collect();
        self.row_mut(row)?.targets = all;
        self.refresh_overrides(row);
        Ok(&self.rows[row].targets)
    }

    /// Selectable targets of a row. Cluster sessions never disable options;
    /// overlaps are reported as a warning instead.
    pub fn options_for(&self, row: usize) -> Result<Vec<OptionGroup>, ReconcileError> {
        let range = self.check_row(row)?.range;
        Ok(self
            .topology
            .candidates(range)
            .into_iter()
            .map(|(label, values)| OptionGroup {
                label,
                options: values
                    .into_iter()
                    .map(|v| {
                        let label = v.to_string();
                        SelectOption::enabled(v, label)
                    })
                    .collect(),
            })
            .collect())
    }

    /// Effect of one row alone, while the row is complete
    pub fn row_overrides(&self, row: usize) -> Option<&ResourceValueMap> {
        self.rows.get(row).and_then(|r| r.overrides.as_ref())
    }

    fn refresh_overrides(&mut self, row: usize) {
        let overrides = match self.rows.get(row) {
            Some(edit) if edit.is_complete() => Some(resolve(
                &self.topology,
                std::slice::from_ref(&edit.as_assignment()),
                &ArrayOrder,
            )),
            _ => None,
        };
        if let Some(edit) = self.rows.get_mut(row) {
            edit.overrides = overrides;
        }
    }

    /// Complete rows as assignments, in row order
    pub fn assignments(&self) -> Vec<ScopeAssignment> {
        self.rows
            .iter()
            .filter(|r| r.is_complete())
            .map(ClusterEditRow::as_assignment)
            .collect()
    }

    /// The effective-scope tree of the current edits
    pub fn project(&self) -> ParameterTree {
        ParameterTree::project(&self.topology, &self.assignments())
    }

    /// Overlap flags aligned with the session's rows
    pub fn overlaps(&self) -> OverlapReport {
        let rows: Vec<ScopeAssignment> = self.rows.iter().map(ClusterEditRow::as_assignment).collect();
        detect_overlaps(&self.topology, &rows)
    }

    /// Swap in a freshly fetched topology and drop targets that no longer
    /// exist. Returns how many targets were dropped.
    pub fn replace_topology(&mut self, topology: ClusterTopology) -> Result<usize, TopologyError> {
        topology.validate()?;
        self.topology = topology;

        let mut dropped = 0;
        for row in 0..self.rows.len() {
            let edit = &mut self.rows[row];
            let before = edit.targets.len();
            let range = edit.range;
            let topology = &self.topology;
            edit.targets.retain(|t| topology.is_valid_target(range, t));
            dropped += before - edit.targets.len();
            self.refresh_overrides(row);
        }

        if dropped > 0 {
            info!(
                target: "obview::reconciler",
                dropped,
                "Topology changed, stale targets cleared"
            );
        }
        Ok(dropped)
    }

    /// Inline errors blocking submission
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::default();
        if self.rows.is_empty() {
            errors.push(None, FieldName::Rows, "add at least one row");
        }
        for (i, row) in self.rows.iter().enumerate() {
            if let Err(message) = self.parameter.validate_value(&row.value) {
                errors.push(Some(i), FieldName::Value, message);
            }
            if !row.range.is_cluster_scoped() {
                errors.push(Some(i), FieldName::Range, format!("'{}' is not a cluster range", row.range));
            } else if !row.as_assignment().targets_are_consistent() {
                errors.push(Some(i), FieldName::Targets, "select at least one target");
            }
        }
        errors.into_result()
    }

    /// Requests for the parameter capability, one per row
    pub fn to_requests(&self) -> Result<Vec<ParameterSetRequest>, ValidationErrors> {
        self.validate()?;
        Ok(self
            .rows
            .iter()
            .map(|row| {
                let name = self.parameter.name.as_str();
                let value = row.value.clone();
                match row.range {
                    EffectiveRange::Zone => ParameterSetRequest {
                        zones: Some(to_strings(&row.targets)),
                        ..ParameterSetRequest::new(name, value, ParameterScope::Zone)
                    },
                    EffectiveRange::Server => ParameterSetRequest {
                        servers: Some(to_strings(&row.targets)),
                        ..ParameterSetRequest::new(name, value, ParameterScope::Server)
                    },
                    _ => ParameterSetRequest::new(name, value, ParameterScope::Cluster),
                }
            })
            .collect())
    }
}

// ----------------------------------------------------------------------------
// 11.3 All-Tenants Toggle
// ----------------------------------------------------------------------------

/// Session-wide state of the "all tenants" choice.
///
/// ```text
/// allowed --[pick all]--------> selected --[clear every row]--> allowed
/// allowed --[pick tenant(s)]--> disabled --[clear every row]--> allowed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllTenantsToggle {
    /// No row has targets
    #[default]
    Allowed,
    /// A row targets all tenants; specific tenants are unselectable
    Selected,
    /// Specific tenants are picked; all-tenants is unselectable
    Disabled,
}

impl AllTenantsToggle {
    /// State implied by the target lists of every row
    pub fn derive<'a, I>(target_lists: I) -> Self
    where
        I: IntoIterator<Item = &'a [CompactString]>,
    {
        let mut state = AllTenantsToggle::Allowed;
        for targets in target_lists {
            if targets.is_empty() {
                continue;
            }
            if targets.iter().all(|t| t.as_str() == ALL_TENANTS) {
                if state == AllTenantsToggle::Allowed {
                    state = AllTenantsToggle::Selected;
                }
            } else {
                return AllTenantsToggle::Disabled;
            }
        }
        state
    }

    pub fn can_transition(self, next: AllTenantsToggle) -> bool {
        use AllTenantsToggle::*;
        matches!(
            (self, next),
            (Allowed, Selected) | (Allowed, Disabled) | (Selected, Allowed) | (Disabled, Allowed)
        ) || self == next
    }
}

impl Display for AllTenantsToggle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let name = match self {
            AllTenantsToggle::Allowed => "allowed",
            AllTenantsToggle::Selected => "selected",
            AllTenantsToggle::Disabled => "disabled",
        };
        f.write_str(name)
    }
}

// ----------------------------------------------------------------------------
// 11.4 Tenant-Scoped Sessions
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantEditRow {
    pub value: ParamValue,
    #[serde(default)]
    pub targets: Vec<CompactString>,
}

impl TenantEditRow {
    fn as_assignment(&self) -> ScopeAssignment {
        ScopeAssignment {
            value: self.value.clone(),
            range: EffectiveRange::Tenant,
            targets: self.targets.clone(),
        }
    }

    fn targets_all(&self) -> bool {
        !self.targets.is_empty() && self.targets.iter().all(|t| t.as_str() == ALL_TENANTS)
    }
}

/// Edit session of a tenant parameter. A tenant gets a new value from at
/// most one row, and "all tenants" never coexists with specific tenants.
#[derive(Debug, Clone)]
pub struct TenantScopeSession {
    parameter: ParameterDescriptor,
    tenants: Vec<TenantValue>,
    rows: Vec<TenantEditRow>,
    toggle: AllTenantsToggle,
}

impl TenantScopeSession {
    pub fn new(parameter: ParameterDescriptor, tenants: Vec<TenantValue>) -> Result<Self, TopologyError> {
        validate_tenants(&tenants)?;
        Ok(Self {
            parameter,
            tenants,
            rows: Vec::new(),
            toggle: AllTenantsToggle::Allowed,
        })
    }

    /// Rebuild a session from previously entered assignments, enforcing the
    /// same exclusivity as interactive picks.
    pub fn from_assignments(
        parameter: ParameterDescriptor,
        tenants: Vec<TenantValue>,
        assignments: &[ScopeAssignment],
    ) -> ObViewResult<Self> {
        let mut session = Self::new(parameter, tenants)?;
        for assignment in assignments {
            if !assignment.range.is_tenant_scoped() {
                return Err(ReconcileError::RangeNotApplicable {
                    range: assignment.range,
                }
                .into());
            }
            let row = session.add_row()?;
            let targets: Vec<CompactString> = if assignment.range == EffectiveRange::AllTenants {
                vec![CompactString::from(ALL_TENANTS)]
            } else {
                assignment.targets.clone()
            };
            session.set_targets(row, targets)?;
            session.set_value(row, assignment.value.clone())?;
        }
        Ok(session)
    }

    pub fn parameter(&self) -> &ParameterDescriptor {
        &self.parameter
    }

    pub fn tenants(&self) -> &[TenantValue] {
        &self.tenants
    }

    pub fn rows(&self) -> &[TenantEditRow] {
        &self.rows
    }

    pub fn toggle(&self) -> AllTenantsToggle {
        self.toggle
    }

    fn check_row(&self, row: usize) -> Result<&TenantEditRow, ReconcileError> {
        self.rows.get(row).ok_or(ReconcileError::RowOutOfRange {
            row,
            rows: self.rows.len(),
        })
    }

    pub fn add_row(&mut self) -> Result<usize, ReconcileError> {
        if self.rows.len() >= MAX_EDIT_ROWS {
            return Err(ReconcileError::TooManyRows { max: MAX_EDIT_ROWS });
        }
        self.rows.push(TenantEditRow {
            value: ParamValue::default(),
            targets: Vec::new(),
        });
        Ok(self.rows.len() - 1)
    }

    pub fn remove_row(&mut self, row: usize) -> Result<TenantEditRow, ReconcileError> {
        self.check_row(row)?;
        let removed = self.rows.remove(row);
        self.recompute_toggle();
        Ok(removed)
    }

    pub fn set_value(&mut self, row: usize, value: impl Into<ParamValue>) -> Result<(), ReconcileError> {
        self.check_row(row)?;
        self.rows[row].value = value.into();
        Ok(())
    }

    /// Options of one row under the current toggle state.
    ///
    /// The all-tenants option is disabled while specific tenants are picked
    /// anywhere, or while another row holds it. A tenant is disabled while
    /// some row targets all tenants, or while another row holds it.
    pub fn options_for(&self, row: usize) -> Result<Vec<SelectOption>, ReconcileError> {
        let current = self.check_row(row)?;
        let holds_all = current.targets_all();

        let taken_elsewhere: AHashSet<&str> = self
            .rows
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != row)
            .flat_map(|(_, r)| r.targets.iter().map(|t| t.as_str()))
            .collect();

        let all_disabled = match self.toggle {
            AllTenantsToggle::Allowed => false,
            AllTenantsToggle::Selected => !holds_all,
            AllTenantsToggle::Disabled => true,
        };

        let mut options = Vec::with_capacity(self.tenants.len() + 1);
        options.push(SelectOption {
            value: CompactString::from(ALL_TENANTS),
            label: ALL_TENANTS_LABEL.to_string(),
            disabled: all_disabled,
        });
        for tenant in &self.tenants {
            options.push(SelectOption {
                value: tenant.name.clone(),
                label: tenant.name.to_string(),
                disabled: self.toggle == AllTenantsToggle::Selected
                    || taken_elsewhere.contains(tenant.name.as_str()),
            });
        }
        Ok(options)
    }

    /// Replace a row's targets, refusing any option the selector disables.
    pub fn set_targets<I, T>(&mut self, row: usize, targets: I) -> Result<(), ReconcileError>
    where
        I: IntoIterator<Item = T>,
        T: Into<CompactString>,
    {
        let options = self.options_for(row)?;
        let targets = dedup_targets(targets);

        for target in &targets {
            match options.iter().find(|o| o.value == *target) {
                None => {
                    return Err(ReconcileError::UnknownTarget {
                        row,
                        value: target.to_string(),
                    })
                }
                Some(option) if option.disabled => {
                    return Err(ReconcileError::OptionDisabled {
                        row,
                        value: target.to_string(),
                    })
                }
                Some(_) => {}
            }
        }

        if targets.len() > 1 && targets.iter().any(|t| t.as_str() == ALL_TENANTS) {
            let specific = targets
                .iter()
                .find(|t| t.as_str() != ALL_TENANTS)
                .map(|t| t.to_string())
                .unwrap_or_default();
            return Err(ReconcileError::OptionDisabled { row, value: specific });
        }

        self.rows[row].targets = targets;
        self.recompute_toggle();
        Ok(())
    }

    fn recompute_toggle(&mut self) {
        let next = AllTenantsToggle::derive(self.rows.iter().map(|r| r.targets.as_slice()));
        if next == self.toggle {
            return;
        }
        if self.toggle.can_transition(next) {
            debug!(
                target: "obview::reconciler",
                from = %self.toggle,
                to = %next,
                "All-tenants toggle changed"
            );
        } else {
            warn!(
                target: "obview::reconciler",
                from = %self.toggle,
                to = %next,
                "Unexpected all-tenants transition"
            );
        }
        self.toggle = next;
    }

    /// Rows with a value and targets, as assignments
    pub fn assignments(&self) -> Vec<ScopeAssignment> {
        self.rows
            .iter()
            .filter(|r| !r.value.is_blank() && !r.targets.is_empty())
            .map(TenantEditRow::as_assignment)
            .collect()
    }

    /// Resulting value of every tenant
    pub fn merged(&self) -> Vec<TenantValueRow> {
        merge_tenant_values(&self.tenants, &self.assignments())
    }

    /// Swap in a freshly fetched tenant list, dropping picks of tenants that
    /// disappeared. Returns how many targets were dropped.
    pub fn replace_tenants(&mut self, tenants: Vec<TenantValue>) -> Result<usize, TopologyError> {
        validate_tenants(&tenants)?;
        self.tenants = tenants;
        let known: AHashSet<CompactString> = self.tenants.iter().map(|t| t.name.clone()).collect();

        let mut dropped = 0;
        for row in &mut self.rows {
            let before = row.targets.len();
            row.targets.retain(|t| t.as_str() == ALL_TENANTS || known.contains(t));
            dropped += before - row.targets.len();
        }
        self.recompute_toggle();
        Ok(dropped)
    }

    pub fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::default();
        if self.rows.is_empty() {
            errors.push(None, FieldName::Rows, "add at least one row");
        }
        for (i, row) in self.rows.iter().enumerate() {
            if let Err(message) = self.parameter.validate_value(&row.value) {
                errors.push(Some(i), FieldName::Value, message);
            }
            if row.targets.is_empty() {
                errors.push(Some(i), FieldName::Targets, "select at least one tenant");
            }
        }
        errors.into_result()
    }

    /// Requests for the parameter capability; all-tenants expands to every
    /// known tenant.
    pub fn to_requests(&self) -> Result<Vec<ParameterSetRequest>, ValidationErrors> {
        self.validate()?;
        Ok(self
            .rows
            .iter()
            .map(|row| {
                let tenants = if row.targets_all() {
                    self.tenants.iter().map(|t| t.name.to_string()).collect()
                } else {
                    to_strings(&row.targets)
                };
                ParameterSetRequest {
                    tenants: Some(tenants),
                    ..ParameterSetRequest::new(&self.parameter.name, row.value.clone(), ParameterScope::Tenant)
                }
            })
            .collect())
    }
}

// ============================================================================
// SECTION 12: MANAGEMENT API CLIENTS
// ============================================================================
// The two capabilities the engine consumes: a metrics query endpoint and a
// parameter set-scope endpoint. Both are traits so drivers and tests run
// without HTTP.
// ============================================================================

// ----------------------------------------------------------------------------
// 12.1 Capability Traits
// ----------------------------------------------------------------------------

/// Answers metric queries.
#[async_trait]
pub trait MetricsSource: Send + Sync + Debug {
    fn name(&self) -> &str;

    async fn query(&self, query: &MetricQuery) -> QueryResult<Vec<MetricSeries>>;
}

/// Accepts parameter changes.
#[async_trait]
pub trait ParameterSink: Send + Sync + Debug {
    async fn submit(&self, requests: &[ParameterSetRequest]) -> QueryResult<()>;
}

// ----------------------------------------------------------------------------
// 12.2 Wire Types
// ----------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WireEnvelope<T> {
    #[serde(default)]
    data: Option<T>,
    #[serde(default)]
    successful: Option<bool>,
    #[serde(default)]
    message: Option<String>,
}

impl<T> WireEnvelope<T> {
    fn into_data(self) -> QueryResult<Option<T>> {
        if self.successful == Some(false) {
            return Err(QueryError::Decode {
                message: self.message.unwrap_or_else(|| "request was not successful".into()),
            });
        }
        Ok(self.data)
    }
}

/// A series as the API reports it. Labels outside the known vocabulary are
/// dropped on the way in.
#[derive(Debug, Deserialize)]
struct WireSeries {
    metric: CompactString,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    values: Vec<(i64, Option<f64>)>,
}

impl WireSeries {
    fn into_series(self) -> MetricSeries {
        let labels = LabelSet::from_lenient_map(
            self.labels.iter().map(|(k, v)| (k.as_str(), v.as_str())),
        );
        MetricSeries {
            metric: self.metric,
            labels,
            // gaps come back as null and are not plotted
            points: self
                .values
                .into_iter()
                .filter_map(|(ts, value)| value.map(|value| MetricPoint { ts, value }))
                .collect(),
        }
    }
}

async fn check_status(endpoint: &str, response: reqwest::Response) -> QueryResult<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    warn!(
        target: "obview::client",
        endpoint,
        status = status.as_u16(),
        "API request rejected"
    );
    Err(QueryError::Status {
        status: status.as_u16(),
        body,
    })
}

fn build_client(api: &ApiConfig) -> QueryResult<HttpClient> {
    HttpClient::builder()
        .timeout(Duration::from_secs(api.timeout_secs))
        .pool_max_idle_per_host(4)
        .build()
        .map_err(|e| QueryError::from_reqwest(&api.base_url, e, api.timeout_secs))
}

// ----------------------------------------------------------------------------
// 12.3 HTTP Metrics Source
// ----------------------------------------------------------------------------

/// POSTs the query bundle as JSON to the metrics endpoint.
#[derive(Debug, Clone)]
pub struct HttpMetricsSource {
    client: HttpClient,
    url: String,
    timeout_secs: u64,
}

impl HttpMetricsSource {
    pub fn new(api: &ApiConfig) -> QueryResult<Self> {
        Ok(Self {
            client: build_client(api)?,
            url: api.metrics_url(),
            timeout_secs: api.timeout_secs,
        })
    }
}

#[async_trait]
impl MetricsSource for HttpMetricsSource {
    fn name(&self) -> &str {
        "http"
    }

    async fn query(&self, query: &MetricQuery) -> QueryResult<Vec<MetricSeries>> {
        query.validate()?;

        let started = Instant::now();
        let response = self
            .client
            .post(&self.url)
            .json(query)
            .send()
            .await
            .map_err(|e| QueryError::from_reqwest(&self.url, e, self.timeout_secs))?;
        let response = check_status(&self.url, response).await?;

        let envelope: WireEnvelope<Vec<WireSeries>> = response
            .json()
            .await
            .map_err(|e| QueryError::from_reqwest(&self.url, e, self.timeout_secs))?;
        let series: Vec<MetricSeries> = envelope
            .into_data()?
            .unwrap_or_default()
            .into_iter()
            .map(WireSeries::into_series)
            .collect();

        debug!(
            target: "obview::client",
            metrics = query.metrics.len(),
            series = series.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Metrics fetched"
        );
        Ok(series)
    }
}

// ----------------------------------------------------------------------------
// 12.4 HTTP Parameter Sink
// ----------------------------------------------------------------------------

/// POSTs the request array to the parameter endpoint.
#[derive(Debug, Clone)]
pub struct HttpParameterSink {
    client: HttpClient,
    url: String,
    timeout_secs: u64,
}

impl HttpParameterSink {
    pub fn new(api: &ApiConfig) -> QueryResult<Self> {
        Ok(Self {
            client: build_client(api)?,
            url: api.parameters_url(),
            timeout_secs: api.timeout_secs,
        })
    }
}

#[async_trait]
impl ParameterSink for HttpParameterSink {
    async fn submit(&self, requests: &[ParameterSetRequest]) -> QueryResult<()> {
        if requests.is_empty() {
            return Err(QueryError::InvalidQuery {
                message: "nothing to submit".into(),
            });
        }

        let response = self
            .client
            .post(&self.url)
            .json(requests)
            .send()
            .await
            .map_err(|e| QueryError::from_reqwest(&self.url, e, self.timeout_secs))?;
        let response = check_status(&self.url, response).await?;

        // older API versions answer with an empty body
        let body = response
            .text()
            .await
            .map_err(|e| QueryError::from_reqwest(&self.url, e, self.timeout_secs))?;
        if !body.trim().is_empty() {
            let envelope: WireEnvelope<serde_json::Value> =
                serde_json::from_str(&body).map_err(|e| QueryError::Decode {
                    message: e.to_string(),
                })?;
            envelope.into_data()?;
        }

        info!(
            target: "obview::client",
            parameter = %requests[0].name,
            requests = requests.len(),
            "Parameter change submitted"
        );
        Ok(())
    }
}

// ============================================================================
// SECTION 13: CHART DRIVER
// ============================================================================
// One task per chart. UI events, refresh ticks and fetch completions are
// all handled by the same select loop, so the ChartSession is never shared
// and never locked. Fetches run on a JoinSet; their results come back
// through the loop and pass the epoch check before touching the chart.
// ============================================================================

// ----------------------------------------------------------------------------
// 13.1 Chart Surfaces
// ----------------------------------------------------------------------------

/// The charting collaborator. An instance lives from `mount` to `destroy`.
pub trait ChartSurface: Send {
    type Instance: Send;

    fn mount(&mut self, view: &ChartViewModel) -> Self::Instance;

    fn destroy(&mut self, instance: Self::Instance);
}

/// Holds at most one mounted chart instance. The previous instance is
/// destroyed before a new one is mounted, and on drop.
pub struct ChartSlot<S: ChartSurface> {
    surface: S,
    current: Option<S::Instance>,
    renders: u64,
}

impl<S: ChartSurface> ChartSlot<S> {
    pub fn new(surface: S) -> Self {
        Self {
            surface,
            current: None,
            renders: 0,
        }
    }

    pub fn render(&mut self, view: &ChartViewModel) {
        if let Some(previous) = self.current.take() {
            self.surface.destroy(previous);
        }
        self.current = Some(self.surface.mount(view));
        self.renders += 1;
    }

    pub fn clear(&mut self) {
        if let Some(previous) = self.current.take() {
            self.surface.destroy(previous);
        }
    }

    pub fn is_mounted(&self) -> bool {
        self.current.is_some()
    }

    pub fn renders(&self) -> u64 {
        self.renders
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }
}

impl<S: ChartSurface> Drop for ChartSlot<S> {
    fn drop(&mut self) {
        self.clear();
    }
}

impl<S: ChartSurface> Debug for ChartSlot<S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChartSlot")
            .field("mounted", &self.current.is_some())
            .field("renders", &self.renders)
            .finish()
    }
}

/// Prints every render as a table. Used by the `watch` command.
#[derive(Debug, Default)]
pub struct StdoutSurface {
    sequence: u64,
}

impl ChartSurface for StdoutSurface {
    type Instance = u64;

    fn mount(&mut self, view: &ChartViewModel) -> u64 {
        self.sequence += 1;
        println!("--- render #{} (grouped by {}) ---", self.sequence, view.grouped_by);
        if view.is_empty() {
            println!("  (no data)");
        }
        for line in &view.series {
            match line.points.last() {
                Some(point) => println!("  {:<48} {:>14.3}  @ {}", line.name, point.value, point.ts),
                None => println!("  {:<48} {:>14}", line.name, "-"),
            }
        }
        self.sequence
    }

    fn destroy(&mut self, instance: u64) {
        trace!(target: "obview::driver", instance, "Chart instance destroyed");
    }
}

// ----------------------------------------------------------------------------
// 13.2 Chart Props
// ----------------------------------------------------------------------------

/// Time range as the page specifies it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RangeSpec {
    Fixed { range: QueryRange },
    /// Window ending at the last refresh anchor
    Trailing { secs: u64 },
}

/// Everything the page hands a chart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChartProps {
    pub labels: LabelSet,
    pub group_keys: GroupKeys,
    pub range: RangeSpec,
    pub metrics: Vec<CompactString>,
    #[serde(default)]
    pub mode: QueryMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

impl ChartProps {
    pub fn new<I, M>(metrics: I, range: RangeSpec) -> Self
    where
        I: IntoIterator<Item = M>,
        M: Into<CompactString>,
    {
        Self {
            labels: LabelSet::new(),
            group_keys: GroupKeys::ungrouped(),
            range,
            metrics: metrics.into_iter().map(Into::into).collect(),
            mode: QueryMode::Realtime,
            filter: None,
        }
    }

    pub fn with_labels(mut self, labels: LabelSet) -> Self {
        self.labels = labels;
        self
    }

    pub fn with_group_keys(mut self, keys: GroupKeys) -> Self {
        self.group_keys = keys;
        self
    }

    /// The query bundle for a given range anchor
    pub fn to_query(&self, anchor: i64, refresh: bool) -> MetricQuery {
        let range = match self.range {
            RangeSpec::Fixed { range } => range,
            RangeSpec::Trailing { secs } => QueryRange::trailing(anchor, secs),
        };
        let mut query = MetricQuery::new(self.metrics.iter().cloned(), range)
            .with_labels(self.labels.clone())
            .with_group_labels(self.group_keys.clone())
            .with_mode(self.mode)
            .with_refresh(refresh);
        query.filter = self.filter.clone();
        query
    }
}

// ----------------------------------------------------------------------------
// 13.3 Driver Channel
// ----------------------------------------------------------------------------

/// Something that happened on the page.
#[derive(Debug, Clone)]
pub enum ChartEvent {
    Props(ChartProps),
    Visibility(bool),
    SwitchIdentity {
        identity: CompactString,
        props: ChartProps,
    },
}

/// Page side of a chart driver.
#[derive(Debug, Clone)]
pub struct ChartHandle {
    tx: mpsc::Sender<ChartEvent>,
    cancel: CancellationToken,
}

/// Driver side of the channel.
#[derive(Debug)]
pub struct ChartEvents {
    rx: mpsc::Receiver<ChartEvent>,
    cancel: CancellationToken,
}

/// Create the event channel between a page and one chart driver.
pub fn chart_channel() -> (ChartHandle, ChartEvents) {
    let (tx, rx) = mpsc::channel(DRIVER_EVENT_CHANNEL_SIZE);
    let cancel = CancellationToken::new();
    (
        ChartHandle {
            tx,
            cancel: cancel.clone(),
        },
        ChartEvents { rx, cancel },
    )
}

impl ChartHandle {
    pub async fn send(&self, event: ChartEvent) -> ObViewResult<()> {
        self.tx
            .send(event)
            .await
            .map_err(|_| ObViewError::Internal("chart driver stopped".into()))
    }

    pub async fn set_visible(&self, visible: bool) -> ObViewResult<()> {
        self.send(ChartEvent::Visibility(visible)).await
    }

    pub async fn set_props(&self, props: ChartProps) -> ObViewResult<()> {
        self.send(ChartEvent::Props(props)).await
    }

    pub async fn switch_identity(
        &self,
        identity: impl Into<CompactString>,
        props: ChartProps,
    ) -> ObViewResult<()> {
        self.send(ChartEvent::SwitchIdentity {
            identity: identity.into(),
            props,
        })
        .await
    }

    /// Stop the driver and abort its in-flight fetches
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

// ----------------------------------------------------------------------------
// 13.4 Chart Driver
// ----------------------------------------------------------------------------

/// Seconds since the epoch, as the driver sees them.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

fn system_clock() -> Clock {
    Arc::new(|| Utc::now().timestamp())
}

type FetchOutput = (FetchTicket, QueryResult<Vec<MetricSeries>>);

/// Summary returned when a driver stops.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverReport {
    pub chart: Uuid,
    pub identity: CompactString,
    pub stats: SessionStats,
    pub state: ChartState,
    pub renders: u64,
    pub last_error: Option<QueryError>,
}

/// Owns one ChartSession and everything it drives.
pub struct ChartDriver<S: ChartSurface> {
    session: ChartSession,
    props: ChartProps,
    source: Arc<dyn MetricsSource>,
    slot: ChartSlot<S>,
    events: ChartEvents,
    refresh: Option<Duration>,
    clock: Clock,
    anchor: i64,
    errors: Arc<ErrorStats>,
}

impl<S: ChartSurface> ChartDriver<S> {
    pub fn new(
        identity: impl Into<CompactString>,
        props: ChartProps,
        source: Arc<dyn MetricsSource>,
        surface: S,
        events: ChartEvents,
    ) -> Self {
        let clock = system_clock();
        let anchor = clock();
        Self {
            session: ChartSession::new(identity),
            props,
            source,
            slot: ChartSlot::new(surface),
            events,
            refresh: None,
            clock,
            anchor,
            errors: Arc::new(ErrorStats::new()),
        }
    }

    /// Enable live refresh
    pub fn with_refresh(mut self, interval: Duration) -> Self {
        self.refresh = Some(interval);
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.anchor = clock();
        self.clock = clock;
        self
    }

    /// Share error counters with other drivers of the page
    pub fn with_error_stats(mut self, errors: Arc<ErrorStats>) -> Self {
        self.errors = errors;
        self
    }

    /// Run until shutdown or until every handle is dropped.
    ///
    /// On shutdown in-flight fetches are aborted; when the handles are
    /// dropped they are awaited and applied first.
    pub async fn run(mut self) -> DriverReport {
        let live = self.refresh.is_some();
        let period = self
            .refresh
            .unwrap_or_else(|| Duration::from_secs(DEFAULT_REFRESH_INTERVAL_SECS));
        let mut ticker = interval_at(TokioInstant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut in_flight: JoinSet<FetchOutput> = JoinSet::new();
        let cancel = self.events.cancel.clone();
        let mut cancelled = false;

        info!(
            target: "obview::driver",
            chart = %self.session.identity(),
            live,
            "Chart driver started"
        );

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    cancelled = true;
                    break;
                }

                event = self.events.rx.recv() => match event {
                    Some(event) => self.on_event(event, &mut in_flight),
                    None => break,
                },

                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    self.on_fetch_done(joined);
                }

                _ = ticker.tick(), if live => {
                    self.anchor = (self.clock)();
                    self.evaluate(Trigger::RefreshTick, &mut in_flight);
                }
            }
        }

        if cancelled {
            in_flight.abort_all();
        }
        while let Some(joined) = in_flight.join_next().await {
            self.on_fetch_done(joined);
        }

        let report = DriverReport {
            chart: self.session.id(),
            identity: CompactString::from(self.session.identity()),
            stats: self.session.stats(),
            state: self.session.state(),
            renders: self.slot.renders(),
            last_error: self.session.last_error().cloned(),
        };
        info!(
            target: "obview::driver",
            chart = %report.identity,
            issued = report.stats.issued,
            suppressed = report.stats.suppressed,
            "Chart driver stopped"
        );
        report
    }

    fn on_event(&mut self, event: ChartEvent, in_flight: &mut JoinSet<FetchOutput>) {
        match event {
            ChartEvent::Props(props) => {
                self.props = props;
                self.evaluate(Trigger::PropsChanged, in_flight);
            }
            ChartEvent::Visibility(visible) => {
                if self.session.set_visible(visible) {
                    self.evaluate(Trigger::EnteredViewport, in_flight);
                }
            }
            ChartEvent::SwitchIdentity { identity, props } => {
                self.props = props;
                if identity == self.session.identity() {
                    self.evaluate(Trigger::PropsChanged, in_flight);
                    return;
                }
                self.slot.clear();
                if self.session.switch_identity(identity) {
                    self.evaluate(Trigger::IdentitySwitched, in_flight);
                }
            }
        }
    }

    fn evaluate(&mut self, trigger: Trigger, in_flight: &mut JoinSet<FetchOutput>) {
        let query = self.props.to_query(self.anchor, self.refresh.is_some());
        if let Err(err) = query.validate() {
            warn!(
                target: "obview::driver",
                chart = %self.session.identity(),
                error = %err,
                "Chart props do not form a valid query"
            );
            self.errors.record(&ObViewError::Query(err));
            return;
        }

        if let Decision::Issue(ticket) = self.session.evaluate(&query, trigger) {
            let source = Arc::clone(&self.source);
            in_flight.spawn(async move {
                let result = source.query(&ticket.query).await;
                (ticket, result)
            });
        }
    }

    fn on_fetch_done(&mut self, joined: Result<FetchOutput, JoinError>) {
        let (ticket, result) = match joined {
            Ok(output) => output,
            Err(err) if err.is_cancelled() => return,
            Err(err) => {
                error!(
                    target: "obview::driver",
                    chart = %self.session.identity(),
                    error = %err,
                    "Fetch task panicked"
                );
                self.errors
                    .record(&ObViewError::Internal(format!("fetch task failed: {}", err)));
                return;
            }
        };

        if let Err(err) = &result {
            self.errors.record(&ObViewError::Query(err.clone()));
        }

        match self.session.complete(&ticket, result) {
            CompletionOutcome::Applied => {
                let view = project_series(self.session.series(), &self.props.group_keys);
                self.slot.render(&view);
            }
            CompletionOutcome::Failed => {
                self.slot.render(&ChartViewModel {
                    grouped_by: self.props.group_keys.clone(),
                    series: Vec::new(),
                });
            }
            CompletionOutcome::Stale => {}
        }
    }
}

impl<S: ChartSurface> Debug for ChartDriver<S> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChartDriver")
            .field("session", &self.session)
            .field("source", &self.source.name())
            .field("slot", &self.slot)
            .field("refresh", &self.refresh)
            .field("anchor", &self.anchor)
            .finish()
    }
}

// ============================================================================
// SECTION 14: CLI & COMMAND LINE INTERFACE
// ============================================================================
// Offline tools over the engine (projection, grouping, validation) plus a
// live `watch` against the metrics API and `submit` against the parameter
// API.
// ============================================================================

// ----------------------------------------------------------------------------
// 14.1 CLI Argument Parser
// ----------------------------------------------------------------------------

/// ObView console engine CLI
#[derive(Parser, Debug)]
#[command(
    name = "obview",
    version,
    about = "View-model engine of the OceanBase management console",
    long_about = "Projects parameter edits onto the cluster topology, normalizes \
                  monitoring filters and drives deduplicated metric charts against \
                  the management API."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "obview.toml", env = "OBVIEW_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "OBVIEW_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug mode
    #[arg(short, long, env = "OBVIEW_DEBUG")]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version and build info
    Version,

    /// Project a parameter edit session (JSON file) onto its topology
    Project {
        /// Edit session file
        input: PathBuf,

        /// Print the projection as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the grouping keys a chart would use
    Group {
        #[arg(long, value_enum, default_value = "database")]
        tab: MonitorTab,

        #[arg(long, value_enum)]
        dimension: Option<Dimension>,

        /// Active filter labels, key=value
        #[arg(short = 'f', long = "filter")]
        filters: Vec<Label>,

        #[arg(long, default_value_t = 1)]
        servers: usize,

        #[arg(long, default_value_t = 1)]
        zones: usize,

        #[arg(long, default_value_t = 1)]
        tenants: usize,
    },

    /// Render a live chart from the metrics API
    Watch {
        /// Metric names, in series order
        #[arg(short, long = "metric", required = true)]
        metrics: Vec<String>,

        /// Query labels, key=value
        #[arg(short = 'L', long = "label")]
        labels: Vec<Label>,

        /// Grouping keys
        #[arg(short, long = "group-by")]
        group_by: Vec<LabelKey>,

        /// Trailing window, e.g. 30m
        #[arg(short, long, value_parser = humantime::parse_duration)]
        range: Option<Duration>,

        /// Fetch once and exit
        #[arg(long)]
        once: bool,
    },

    /// Validate a parameter edit session and send it
    Submit {
        /// Edit session file
        input: PathBuf,

        /// Print the requests instead of sending them
        #[arg(long)]
        dry_run: bool,
    },
}

// ----------------------------------------------------------------------------
// 14.2 Edit Session Files
// ----------------------------------------------------------------------------

/// A saved drawer session, as read by `project` and `submit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum EditSessionFile {
    Cluster {
        parameter: String,
        topology: ClusterTopology,
        #[serde(default)]
        assignments: Vec<ScopeAssignment>,
    },
    Tenant {
        parameter: String,
        tenants: Vec<TenantValue>,
        #[serde(default)]
        assignments: Vec<ScopeAssignment>,
    },
}

/// A session rebuilt from a file.
#[derive(Debug)]
pub enum LoadedSession {
    Cluster(ClusterScopeSession),
    Tenant(TenantScopeSession),
}

impl EditSessionFile {
    pub fn read(path: &Path) -> ObViewResult<Self> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Replay the file's rows through a session, resolving the parameter
    /// against the configured catalog.
    pub fn into_session(self, config: &ConsoleConfig) -> ObViewResult<LoadedSession> {
        match self {
            EditSessionFile::Cluster {
                parameter,
                topology,
                assignments,
            } => {
                let descriptor = config.parameter(&parameter);
                if descriptor.scope != ParameterScopeKind::Cluster {
                    warn!(target: "obview::cli", parameter = %parameter, "Parameter is tenant scoped");
                }
                ClusterScopeSession::from_assignments(descriptor, topology, &assignments)
                    .map(LoadedSession::Cluster)
            }
            EditSessionFile::Tenant {
                parameter,
                tenants,
                assignments,
            } => {
                let descriptor = config
                    .parameter(&parameter)
                    .with_scope(ParameterScopeKind::Tenant);
                TenantScopeSession::from_assignments(descriptor, tenants, &assignments)
                    .map(LoadedSession::Tenant)
            }
        }
    }
}

impl LoadedSession {
    pub fn validate(&self) -> Result<(), ValidationErrors> {
        match self {
            LoadedSession::Cluster(session) => session.validate(),
            LoadedSession::Tenant(session) => session.validate(),
        }
    }

    pub fn to_requests(&self) -> Result<Vec<ParameterSetRequest>, ValidationErrors> {
        match self {
            LoadedSession::Cluster(session) => session.to_requests(),
            LoadedSession::Tenant(session) => session.to_requests(),
        }
    }
}

// ----------------------------------------------------------------------------
// 14.3 CLI Handler Functions
// ----------------------------------------------------------------------------

fn handle_validate(config_path: &Path, verbose: bool) -> ObViewResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    match ConsoleConfig::load(config_path) {
        Ok(config) => {
            println!("Configuration is valid");
            if verbose {
                println!("{}", "=".repeat(60));
                match toml::to_string_pretty(&config) {
                    Ok(s) => println!("{}", s),
                    Err(e) => println!("Failed to serialize: {}", e),
                }
            }
            println!("  API:              {}", config.api.base_url);
            println!(
                "  Live refresh:     {} (every {}s)",
                config.monitor.live_refresh, config.monitor.refresh_interval_secs
            );
            println!("  Default grouping: {}", config.monitor.default_grouping());
            println!("  Catalog entries:  {}", config.parameters.catalog.len());
            Ok(())
        }
        Err(e) => {
            println!("Configuration validation failed: {}", e);
            Err(ObViewError::Config(e))
        }
    }
}

fn handle_generate_config(output: Option<&Path>) -> ObViewResult<()> {
    let config_str = ConsoleConfig::generate_default_config();
    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("Default configuration written to: {}", path.display());
        }
        None => println!("{}", config_str),
    }
    Ok(())
}

fn handle_version() {
    println!("{} v{}", ENGINE_FULL_NAME, ENGINE_VERSION);
    println!("  Target: {} / {}", std::env::consts::ARCH, std::env::consts::OS);
}

fn print_tree(node: &TreeNode, depth: usize) {
    let marker = if node.changed { "*" } else { " " };
    match (&node.value, &node.original) {
        (Some(value), Some(original)) if node.changed => println!(
            "{}{} {} = {} (was {})",
            "  ".repeat(depth),
            marker,
            node.title,
            value,
            original
        ),
        (Some(value), _) => println!("{}{} {} = {}", "  ".repeat(depth), marker, node.title, value),
        _ => println!("{}{} {}", "  ".repeat(depth), marker, node.title),
    }
    for child in &node.children {
        print_tree(child, depth + 1);
    }
}

fn print_validation(errors: &ValidationErrors) {
    for error in &errors.errors {
        println!("  ! {}", error);
    }
}

fn handle_project(config: &ConsoleConfig, input: &Path, json: bool) -> ObViewResult<()> {
    let session = EditSessionFile::read(input)?.into_session(config)?;

    match &session {
        LoadedSession::Cluster(session) => {
            let tree = session.project();
            let overlaps = session.overlaps();
            if json {
                println!("{}", serde_json::to_string_pretty(&tree)?);
            } else {
                print_tree(&tree.root, 0);
                println!("{} server(s) changed", tree.changed_count());
                for row in overlaps.overlapping_rows() {
                    println!("  ~ row {} overlaps another row", row + 1);
                }
            }
        }
        LoadedSession::Tenant(session) => {
            let rows = session.merged();
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                for row in &rows {
                    let marker = if row.is_new_value { "*" } else { " " };
                    println!("{} {:<32} {}", marker, row.tenant_name, row.value);
                }
                println!("all-tenants toggle: {}", session.toggle());
            }
        }
    }

    if let Err(errors) = session.validate() {
        print_validation(&errors);
    }
    Ok(())
}

fn handle_group(
    config: &ConsoleConfig,
    tab: MonitorTab,
    dimension: Option<Dimension>,
    filters: Vec<Label>,
    available: CategoryCounts,
) -> ObViewResult<()> {
    let labels: LabelSet = filters.into_iter().collect();
    let defaults = config.monitor.default_grouping();
    let keys = normalize_grouping(&GroupingRequest {
        tab,
        dimension,
        filters: &labels,
        defaults: &defaults,
        available,
    });
    if keys.is_ungrouped() {
        println!("(ungrouped)");
    } else {
        println!("{}", keys);
    }
    Ok(())
}

struct WatchArgs {
    metrics: Vec<String>,
    labels: Vec<Label>,
    group_by: Vec<LabelKey>,
    range: Option<Duration>,
    once: bool,
}

async fn handle_watch(config: &ConsoleConfig, args: WatchArgs) -> ObViewResult<()> {
    let source: Arc<dyn MetricsSource> = Arc::new(HttpMetricsSource::new(&config.api)?);
    let window = args
        .range
        .map(|d| d.as_secs())
        .unwrap_or(config.monitor.default_range_secs);

    let group_keys = if args.group_by.is_empty() {
        config.monitor.default_grouping()
    } else {
        args.group_by.into_iter().collect()
    };
    let props = ChartProps::new(args.metrics, RangeSpec::Trailing { secs: window })
        .with_labels(args.labels.into_iter().collect())
        .with_group_keys(group_keys);

    let (handle, events) = chart_channel();
    let mut driver = ChartDriver::new("watch", props, source, StdoutSurface::default(), events);
    if !args.once && config.monitor.live_refresh {
        driver = driver.with_refresh(config.monitor.refresh_interval());
    }
    let task = tokio::spawn(driver.run());

    handle.set_visible(true).await?;
    if args.once {
        drop(handle);
    } else {
        tokio::signal::ctrl_c().await?;
        handle.shutdown();
    }

    let report = task
        .await
        .map_err(|e| ObViewError::Internal(format!("chart driver failed: {}", e)))?;
    if let Some(err) = report.last_error {
        return Err(err.into());
    }
    Ok(())
}

async fn handle_submit(config: &ConsoleConfig, input: &Path, dry_run: bool) -> ObViewResult<()> {
    let session = EditSessionFile::read(input)?.into_session(config)?;
    let requests = match session.to_requests() {
        Ok(requests) => requests,
        Err(errors) => {
            println!("Submission blocked:");
            print_validation(&errors);
            return Err(errors.into());
        }
    };

    if let LoadedSession::Cluster(cluster) = &session {
        for row in cluster.overlaps().overlapping_rows() {
            warn!(target: "obview::cli", row = row + 1, "Row overlaps another row; the later row wins");
        }
    }

    if dry_run {
        println!("{}", serde_json::to_string_pretty(&requests)?);
        return Ok(());
    }

    let sink = HttpParameterSink::new(&config.api)?;
    sink.submit(&requests).await?;
    println!("Submitted {} request(s)", requests.len());
    Ok(())
}

// ============================================================================
// SECTION 15: MAIN ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Version => {
            handle_version();
            return Ok(());
        }
        Commands::GenerateConfig { output } => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Commands::Validate { verbose } => {
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        _ => {}
    }

    let config = if cli.config.exists() {
        AnyhowContext::with_context(ConsoleConfig::load(&cli.config), || {
            format!("Failed to load config from {}", cli.config.display())
        })?
    } else {
        ConsoleConfig::default()
    };

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }
    init_logging(&logging_config)?;

    if !cli.config.exists() {
        warn!(
            target: "obview::cli",
            "Config file not found at {}, using defaults",
            cli.config.display()
        );
    }

    match cli.command {
        Commands::Project { input, json } => handle_project(&config, &input, json)?,
        Commands::Group {
            tab,
            dimension,
            filters,
            servers,
            zones,
            tenants,
        } => {
            let available = CategoryCounts::from_totals(servers, zones, tenants);
            handle_group(&config, tab, dimension, filters, available)?
        }
        Commands::Watch {
            metrics,
            labels,
            group_by,
            range,
            once,
        } => {
            handle_watch(
                &config,
                WatchArgs {
                    metrics,
                    labels,
                    group_by,
                    range,
                    once,
                },
            )
            .await?
        }
        Commands::Submit { input, dry_run } => handle_submit(&config, &input, dry_run).await?,
        Commands::Version | Commands::GenerateConfig { .. } | Commands::Validate { .. } => {}
    }

    Ok(())
}

// ============================================================================
// SECTION 16: TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    fn labels(pairs: &[(LabelKey, &str)]) -> LabelSet {
        pairs.iter().map(|(k, v)| Label::new(*k, *v)).collect()
    }

    #[test]
    fn test_label_key_parsing() {
        assert_eq!("tenant_name".parse::<LabelKey>(), Ok(LabelKey::TenantName));
        assert_eq!(
            "host".parse::<LabelKey>(),
            Err(LabelError::UnknownKey { key: "host".into() })
        );
    }

    #[test]
    fn test_label_parsing() {
        let label: Label = "svr_ip = 10.0.0.1".parse().unwrap();
        assert_eq!(label, Label::new(LabelKey::SvrIp, "10.0.0.1"));

        assert!(matches!("svr_ip".parse::<Label>(), Err(LabelError::Malformed { .. })));
    }

    #[test]
    fn test_label_set_insert_replaces() {
        let mut set = LabelSet::new();
        assert_eq!(set.insert(LabelKey::SvrIp, "10.0.0.1"), None);
        let previous = set.insert(LabelKey::SvrIp, "10.0.0.2");

        assert_eq!(previous.as_deref(), Some("10.0.0.1"));
        assert_eq!(set.len(), 1);
        assert_eq!(set.get(LabelKey::SvrIp), Some("10.0.0.2"));
    }

    #[test]
    fn test_label_set_equality_ignores_order() {
        let a = labels(&[(LabelKey::SvrIp, "10.0.0.1"), (LabelKey::Obzone, "zone1")]);
        let b = labels(&[(LabelKey::Obzone, "zone1"), (LabelKey::SvrIp, "10.0.0.1")]);
        assert_eq!(a, b);
        assert_ne!(a, labels(&[(LabelKey::SvrIp, "10.0.0.1")]));
    }

    #[test]
    fn test_label_set_rejects_duplicate_keys() {
        let raw = r#"[{"key":"svr_ip","value":"a"},{"key":"svr_ip","value":"b"}]"#;
        assert!(serde_json::from_str::<LabelSet>(raw).is_err());

        let ok = r#"[{"key":"svr_ip","value":"a"},{"key":"obzone","value":"z1"}]"#;
        let set: LabelSet = serde_json::from_str(ok).unwrap();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_lenient_labels_skip_unknown_keys() {
        let set = LabelSet::from_lenient_map([("svr_ip", "10.0.0.1"), ("host", "web-01")]);
        assert_eq!(set.len(), 1);
        assert!(set.contains_key(LabelKey::SvrIp));
    }

    #[test]
    fn test_group_keys_never_hold_duplicates() {
        let keys: GroupKeys = [LabelKey::SvrIp, LabelKey::SvrPort, LabelKey::SvrIp]
            .into_iter()
            .collect();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys.to_string(), "svr_ip,svr_port");
        assert_eq!(GroupKeys::ungrouped().to_string(), "(ungrouped)");
    }

    #[test]
    fn test_query_validation() {
        let empty = MetricQuery::new(Vec::<&str>::new(), QueryRange::new(0, 100));
        assert!(matches!(empty.validate(), Err(QueryError::InvalidQuery { .. })));

        let reversed = MetricQuery::new(["cpu"], QueryRange::new(200, 100));
        assert!(reversed.validate().is_err());

        assert!(MetricQuery::new(["cpu"], QueryRange::new(0, 100)).validate().is_ok());
    }

    #[test]
    fn test_trailing_range() {
        let range = QueryRange::trailing(1_000, 300);
        assert_eq!(range.start, 700);
        assert_eq!(range.end, 1_000);
        assert_eq!(range.duration_secs(), 300);
    }

    // ------------------------------------------------------------------------
    // Errors
    // ------------------------------------------------------------------------

    #[test]
    fn test_error_categories_and_hints() {
        let query: ObViewError = QueryError::Timeout { secs: 5 }.into();
        assert_eq!(query.category(), "query");
        assert!(query.is_recoverable());
        assert_eq!(query.recovery_hint(), RecoveryHint::RetryOnNextTrigger);

        let config: ObViewError = ConfigError::invalid_value("api.base_url", "bad").into();
        assert!(!config.is_recoverable());
        assert_eq!(config.recovery_hint(), RecoveryHint::FixConfiguration);

        let pick: ObViewError = ReconcileError::OptionDisabled {
            row: 0,
            value: "t1".into(),
        }
        .into();
        assert_eq!(pick.category(), "selection");
        assert_eq!(pick.recovery_hint(), RecoveryHint::PickAnotherOption);
    }

    #[test]
    fn test_error_stats() {
        let stats = ErrorStats::new();
        stats.record(&QueryError::Timeout { secs: 1 }.into());
        stats.record(&QueryError::Decode { message: "x".into() }.into());
        stats.record(&ObViewError::Internal("boom".into()));

        assert_eq!(stats.total_errors(), 3);
        assert_eq!(stats.count_by_category("query"), 2);
        assert_eq!(stats.count_by_category("internal"), 1);

        stats.reset();
        assert_eq!(stats.total_errors(), 0);
    }

    #[test]
    fn test_error_context_wraps_message() {
        let result: Result<(), TopologyError> = Err(TopologyError::DuplicateZone {
            zone: "zone1".into(),
        });
        let err = ErrorContext::context(result, "loading topology").unwrap_err();
        assert!(err.to_string().contains("loading topology"));
        assert!(err.to_string().contains("zone1"));
    }

    #[test]
    fn test_validation_errors_per_row() {
        let mut errors = ValidationErrors::default();
        errors.push(Some(0), FieldName::Value, "required");
        errors.push(Some(1), FieldName::Targets, "select at least one target");
        errors.push(None, FieldName::Rows, "add at least one row");

        assert_eq!(errors.for_row(1).count(), 1);
        assert_eq!(errors.errors[0].to_string(), "row 1 value: required");
        assert!(errors.clone().into_result().is_err());
        assert!(ValidationErrors::default().into_result().is_ok());
    }

    // ------------------------------------------------------------------------
    // Configuration
    // ------------------------------------------------------------------------

    const SAMPLE_CONFIG: &str = r#"
[api]
base_url = "https://console.example:8080/"
timeout_secs = 10

[monitor]
refresh_interval_secs = 5
default_group_keys = ["svr_ip", "svr_port"]

[[parameters.catalog]]
name = "memory_limit"
value_type = { type = "capacity" }

[[parameters.catalog]]
name = "cpu_quota_concurrency"
scope = "tenant"
value_type = { type = "int", min = 1, max = 20 }

[logging]
level = "debug"
format = "json"
"#;

    #[test]
    fn test_config_defaults() {
        let config = ConsoleConfig::default();
        assert!(config.monitor.live_refresh);
        assert_eq!(config.monitor.refresh_interval_secs, DEFAULT_REFRESH_INTERVAL_SECS);
        assert_eq!(config.monitor.default_grouping().to_string(), "ob_cluster_name");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_toml() {
        let config = ConsoleConfig::from_toml(SAMPLE_CONFIG).unwrap();

        assert_eq!(
            config.api.metrics_url(),
            "https://console.example:8080/api/v1/monitor/metrics/query"
        );
        assert_eq!(config.monitor.refresh_interval(), Duration::from_secs(5));
        assert_eq!(config.monitor.default_grouping().len(), 2);
        assert_eq!(config.logging.format, "json");

        let quota = config.parameter("cpu_quota_concurrency");
        assert_eq!(quota.scope, ParameterScopeKind::Tenant);
        assert_eq!(quota.value_type, ParamType::Int { min: 1, max: 20 });

        let unknown = config.parameter("undeclared");
        assert_eq!(unknown.value_type, ParamType::String);
    }

    #[rstest]
    #[case("[api]\nbase_url = \"ftp://host\"", "api.base_url")]
    #[case("[api]\ntimeout_secs = 0", "api.timeout_secs")]
    #[case("[monitor]\nrefresh_interval_secs = 0", "monitor.refresh_interval_secs")]
    #[case(
        "[[parameters.catalog]]\nname = \"a\"\n[[parameters.catalog]]\nname = \"a\"",
        "parameters.catalog"
    )]
    #[case(
        "[[parameters.catalog]]\nname = \"a\"\nvalue_type = { type = \"int\", min = 5, max = 1 }",
        "parameters.catalog"
    )]
    fn test_config_rejects_invalid_values(#[case] raw: &str, #[case] field: &str) {
        match ConsoleConfig::from_toml(raw) {
            Err(ConfigError::InvalidValue { field: got, .. }) => assert_eq!(got, field),
            other => panic!("expected invalid value for {}, got {:?}", field, other),
        }
    }

    #[test]
    fn test_config_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("obview.toml");
        fs::write(&path, SAMPLE_CONFIG).unwrap();

        let config = ConsoleConfig::load(&path).unwrap();
        assert_eq!(config.api.timeout_secs, 10);
        assert_eq!(config.parameters.catalog.len(), 2);

        let missing = ConsoleConfig::load(dir.path().join("absent.toml"));
        assert!(matches!(missing, Err(ConfigError::FileNotFound { .. })));
    }

    #[test]
    fn test_generated_config_loads_back() {
        let generated = ConsoleConfig::generate_default_config();
        let config = ConsoleConfig::from_toml(&generated).unwrap();
        assert_eq!(config.api.base_url, DEFAULT_API_BASE_URL);
    }

    #[test]
    fn test_config_manager_update_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("obview.toml");
        fs::write(&path, "[monitor]\nrefresh_interval_secs = 30\n").unwrap();

        let manager = ConfigManager::from_file(&path).unwrap();
        let reloads = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&reloads);
        manager.on_reload(move |_| {
            counter.fetch_add(1, AtomicOrdering::SeqCst);
        });
        assert_eq!(manager.get().monitor.refresh_interval_secs, 30);

        let mut invalid = ConsoleConfig::default();
        invalid.api.timeout_secs = 0;
        assert!(manager.update(invalid).is_err());
        assert_eq!(reloads.load(AtomicOrdering::SeqCst), 0);

        fs::write(&path, "[monitor]\nrefresh_interval_secs = 60\n").unwrap();
        manager.reload().unwrap();
        assert_eq!(manager.get().monitor.refresh_interval_secs, 60);
        assert_eq!(reloads.load(AtomicOrdering::SeqCst), 1);
    }

    // ------------------------------------------------------------------------
    // Parameter values
    // ------------------------------------------------------------------------

    #[rstest]
    #[case(ParamType::Int { min: 1, max: 10 }, "5", true)]
    #[case(ParamType::Int { min: 1, max: 10 }, "11", false)]
    #[case(ParamType::Int { min: 1, max: 10 }, "five", false)]
    #[case(ParamType::Bool, "TRUE", true)]
    #[case(ParamType::Bool, "yes", false)]
    #[case(ParamType::Capacity, "512M", true)]
    #[case(ParamType::Capacity, "2GB", true)]
    #[case(ParamType::Capacity, "1.5g", true)]
    #[case(ParamType::Capacity, "lots", false)]
    #[case(ParamType::Duration, "30s", true)]
    #[case(ParamType::Duration, "100ms", true)]
    #[case(ParamType::Duration, "10", true)]
    #[case(ParamType::Duration, "ten minutes", false)]
    #[case(ParamType::Enum { values: vec!["LRU".into(), "FIFO".into()] }, "LRU", true)]
    #[case(ParamType::Enum { values: vec!["LRU".into(), "FIFO".into()] }, "lru", false)]
    #[case(ParamType::String, "anything", true)]
    #[case(ParamType::String, "   ", false)]
    fn test_parameter_value_validation(
        #[case] value_type: ParamType,
        #[case] raw: &str,
        #[case] valid: bool,
    ) {
        let descriptor = ParameterDescriptor::free_form("p").with_type(value_type);
        assert_eq!(descriptor.validate_value(&ParamValue::from(raw)).is_ok(), valid);
    }

    // ------------------------------------------------------------------------
    // Filter normalizer
    // ------------------------------------------------------------------------

    #[test]
    fn test_normalize_filters_merges_chips_and_cluster() {
        let cluster = ClusterContext {
            name: "obcluster".into(),
            id: Some(7),
        };
        let chips = vec![
            FilterChip::Zone { name: "zone1".into() },
            FilterChip::Server {
                ip: "10.0.0.1".into(),
                port: Some(2882),
            },
            FilterChip::Tenant {
                name: "sys".into(),
                id: None,
            },
        ];

        let set = normalize_filters(&chips, Some(&cluster)).unwrap();
        assert_eq!(
            set,
            labels(&[
                (LabelKey::ObClusterName, "obcluster"),
                (LabelKey::ObClusterId, "7"),
                (LabelKey::Obzone, "zone1"),
                (LabelKey::SvrIp, "10.0.0.1"),
                (LabelKey::SvrPort, "2882"),
                (LabelKey::TenantName, "sys"),
            ])
        );
    }

    #[test]
    fn test_normalize_filters_later_chip_wins() {
        let chips = vec![
            FilterChip::Server {
                ip: "10.0.0.1".into(),
                port: Some(2882),
            },
            FilterChip::Server {
                ip: "10.0.0.2".into(),
                port: None,
            },
        ];
        let set = normalize_filters(&chips, None).unwrap();
        assert_eq!(set.get(LabelKey::SvrIp), Some("10.0.0.2"));
        assert!(!set.contains_key(LabelKey::SvrPort));
    }

    #[test]
    fn test_normalize_filters_rejects_oversized_values() {
        let chips = vec![FilterChip::Zone {
            name: "z".repeat(MAX_LABEL_VALUE_LENGTH + 1).into(),
        }];
        assert!(matches!(
            normalize_filters(&chips, None),
            Err(LabelError::ValueTooLong { key: LabelKey::Obzone, .. })
        ));
    }

    fn everything_available() -> CategoryCounts {
        CategoryCounts {
            units: 6,
            servers: 3,
            zones: 2,
            tenants: 2,
        }
    }

    #[rstest]
    #[case(MonitorTab::Database, Some(Dimension::Unit), &[], &[LabelKey::SvrIp, LabelKey::SvrPort, LabelKey::TenantName])]
    #[case(MonitorTab::HostPerformance, Some(Dimension::SvrIp), &[], &[LabelKey::SvrIp])]
    #[case(MonitorTab::Database, Some(Dimension::SvrIp), &[], &[LabelKey::SvrIp, LabelKey::SvrPort])]
    #[case(MonitorTab::Database, Some(Dimension::Zone), &[(LabelKey::SvrIp, "10.0.0.1")], &[LabelKey::Obzone, LabelKey::SvrIp])]
    #[case(
        MonitorTab::Database,
        Some(Dimension::Tenant),
        &[(LabelKey::SvrIp, "10.0.0.1"), (LabelKey::SvrPort, "2882")],
        &[LabelKey::TenantName, LabelKey::SvrIp, LabelKey::SvrPort]
    )]
    #[case(
        MonitorTab::HostPerformance,
        Some(Dimension::Zone),
        &[(LabelKey::SvrIp, "10.0.0.1"), (LabelKey::SvrPort, "2882")],
        &[LabelKey::Obzone, LabelKey::SvrIp]
    )]
    #[case(MonitorTab::Database, None, &[], &[LabelKey::ObClusterName])]
    #[case(MonitorTab::Database, None, &[(LabelKey::SvrIp, "10.0.0.1")], &[LabelKey::ObClusterName, LabelKey::SvrIp])]
    fn test_normalize_grouping(
        #[case] tab: MonitorTab,
        #[case] dimension: Option<Dimension>,
        #[case] filters: &[(LabelKey, &str)],
        #[case] expected: &[LabelKey],
    ) {
        let filters = labels(filters);
        let defaults = GroupKeys::from(vec![LabelKey::ObClusterName]);
        let keys = normalize_grouping(&GroupingRequest {
            tab,
            dimension,
            filters: &filters,
            defaults: &defaults,
            available: everything_available(),
        });
        assert_eq!(keys.iter().collect::<Vec<_>>(), expected.to_vec());
    }

    #[test]
    fn test_empty_category_leaves_chart_ungrouped() {
        let filters = labels(&[(LabelKey::SvrIp, "10.0.0.1")]);
        let defaults = GroupKeys::ungrouped();
        let keys = normalize_grouping(&GroupingRequest {
            tab: MonitorTab::Database,
            dimension: Some(Dimension::Tenant),
            filters: &filters,
            defaults: &defaults,
            available: CategoryCounts {
                tenants: 0,
                ..everything_available()
            },
        });
        assert!(keys.is_ungrouped());
    }

    #[test]
    fn test_category_counts_from_topology() {
        let topology = ClusterTopology::new("obcluster")
            .with_zone(
                "zone1",
                [ServerValue {
                    ip: "10.0.0.1".into(),
                    port: 2882,
                    original: "1".into(),
                }],
            )
            .with_zone("zone2", []);
        let counts = CategoryCounts::from_topology(&topology, 3);
        assert_eq!(counts.servers, 1);
        assert_eq!(counts.zones, 2);
        assert_eq!(counts.units, 3);
    }

    #[test]
    fn test_category_counts_saturate_unit_total() {
        let counts = CategoryCounts::from_totals(usize::MAX, 1, 2);
        assert_eq!(counts.units, usize::MAX);
        assert_eq!(CategoryCounts::from_totals(4, 2, 0).units, 0);
    }
}

// ============================================================================
// SECTION 17: DEDUPLICATOR & DRIVER TESTS
// ============================================================================

#[cfg(test)]
mod dedup_tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicI64;

    fn cpu_query(end: i64) -> MetricQuery {
        MetricQuery::new(["cpu"], QueryRange::new(0, end))
            .with_labels(LabelSet::new().with(LabelKey::SvrIp, "10.0.0.1"))
    }

    fn visible_session() -> ChartSession {
        let mut session = ChartSession::new("cpu-chart");
        assert!(session.set_visible(true));
        session
    }

    fn issue(session: &mut ChartSession, query: &MetricQuery) -> FetchTicket {
        match session.evaluate(query, Trigger::PropsChanged) {
            Decision::Issue(ticket) => ticket,
            Decision::Suppressed(reason) => panic!("expected a fetch, suppressed: {:?}", reason),
        }
    }

    fn one_series() -> Vec<MetricSeries> {
        vec![MetricSeries::new("cpu", LabelSet::new().with(LabelKey::SvrIp, "10.0.0.1")).with_point(100, 0.5)]
    }

    // ------------------------------------------------------------------------
    // Fingerprints
    // ------------------------------------------------------------------------

    #[test]
    fn test_fingerprint_ignores_label_and_group_order() {
        let a = MetricQuery::new(["cpu"], QueryRange::new(0, 100))
            .with_labels(
                LabelSet::new()
                    .with(LabelKey::SvrIp, "10.0.0.1")
                    .with(LabelKey::Obzone, "zone1"),
            )
            .with_group_labels(vec![LabelKey::SvrIp, LabelKey::Obzone].into());
        let b = MetricQuery::new(["cpu"], QueryRange::new(0, 100))
            .with_labels(
                LabelSet::new()
                    .with(LabelKey::Obzone, "zone1")
                    .with(LabelKey::SvrIp, "10.0.0.1"),
            )
            .with_group_labels(vec![LabelKey::Obzone, LabelKey::SvrIp].into());

        assert_eq!(MetricQueryFingerprint::of(&a), MetricQueryFingerprint::of(&b));
    }

    #[test]
    fn test_fingerprint_changes_with_every_field() {
        let base = cpu_query(100);
        let fp = MetricQueryFingerprint::of(&base);

        let variants = vec![
            base.clone().with_labels(LabelSet::new().with(LabelKey::SvrIp, "10.0.0.2")),
            base.clone().with_group_labels(vec![LabelKey::SvrIp].into()),
            cpu_query(200),
            MetricQuery {
                metrics: vec!["cpu".into(), "memory".into()],
                ..base.clone()
            },
            base.clone().with_mode(QueryMode::History),
            base.clone().with_refresh(true),
            base.clone().with_filter("tenant_name!=sys"),
        ];
        for variant in &variants {
            assert_ne!(MetricQueryFingerprint::of(variant), fp, "{:?}", variant);
        }

        let reordered = MetricQuery {
            metrics: vec!["memory".into(), "cpu".into()],
            ..base.clone()
        };
        assert_ne!(
            MetricQueryFingerprint::of(&reordered),
            MetricQueryFingerprint::of(&variants[3])
        );
        assert_eq!(fp.to_string().len(), 32);
    }

    // ------------------------------------------------------------------------
    // Chart sessions
    // ------------------------------------------------------------------------

    #[test]
    fn test_nothing_issued_before_first_viewport_entry() {
        let mut session = ChartSession::new("cpu-chart");
        let decision = session.evaluate(&cpu_query(100), Trigger::PropsChanged);
        assert!(matches!(decision, Decision::Suppressed(SuppressReason::NeverVisible)));

        assert!(session.set_visible(true));
        assert!(!session.set_visible(true), "already visible");
        assert!(session.evaluate(&cpu_query(100), Trigger::EnteredViewport).is_issue());
        assert_eq!(session.viewport().entries(), 1);
    }

    #[test]
    fn test_identical_renders_issue_one_fetch() {
        let mut session = visible_session();

        let ticket = issue(&mut session, &cpu_query(100));
        // stored before the response arrives
        let second = session.evaluate(&cpu_query(100), Trigger::PropsChanged);
        assert!(matches!(second, Decision::Suppressed(SuppressReason::Duplicate)));

        assert_eq!(session.complete(&ticket, Ok(one_series())), CompletionOutcome::Applied);
        assert_eq!(session.state(), ChartState::Ready);

        assert!(session.evaluate(&cpu_query(200), Trigger::PropsChanged).is_issue());
        assert_eq!(session.stats().issued, 2);
        assert_eq!(session.stats().suppressed, 1);
    }

    #[test]
    fn test_hidden_chart_skips_ticks_and_fetches_once_on_entry() {
        let mut session = visible_session();
        let ticket = issue(&mut session, &cpu_query(100));
        session.complete(&ticket, Ok(one_series()));

        session.set_visible(false);
        for end in [115, 130, 145] {
            let decision = session.evaluate(&cpu_query(end).with_refresh(true), Trigger::RefreshTick);
            assert!(matches!(decision, Decision::Suppressed(SuppressReason::Hidden)));
        }

        assert!(session.set_visible(true));
        assert!(session.evaluate(&cpu_query(145), Trigger::EnteredViewport).is_issue());
        assert!(!session.evaluate(&cpu_query(145), Trigger::PropsChanged).is_issue());
        assert_eq!(session.viewport().entries(), 2);
    }

    #[test]
    fn test_failure_empties_chart_without_poisoning_fingerprint() {
        let mut session = visible_session();
        let ticket = issue(&mut session, &cpu_query(100));
        session.complete(&ticket, Ok(one_series()));

        let ticket = issue(&mut session, &cpu_query(200));
        let outcome = session.complete(
            &ticket,
            Err(QueryError::Status {
                status: 500,
                body: "internal".into(),
            }),
        );

        assert_eq!(outcome, CompletionOutcome::Failed);
        assert!(session.series().is_empty());
        assert_eq!(session.state(), ChartState::Empty);
        assert_eq!(session.last_fingerprint(), None);
        assert!(matches!(session.last_error(), Some(QueryError::Status { status: 500, .. })));

        // no automatic retry, but the next trigger goes out
        assert!(session.evaluate(&cpu_query(200), Trigger::RefreshTick).is_issue());
    }

    #[test]
    fn test_stale_response_is_discarded() {
        let mut session = visible_session();
        let slow = issue(&mut session, &cpu_query(100));
        let fast = issue(&mut session, &cpu_query(200));

        assert_eq!(session.complete(&fast, Ok(one_series())), CompletionOutcome::Applied);
        assert_eq!(session.complete(&slow, Ok(Vec::new())), CompletionOutcome::Stale);

        assert_eq!(session.series().len(), 1);
        assert_eq!(session.state(), ChartState::Ready);
        assert_eq!(session.stats().stale, 1);
    }

    #[test]
    fn test_empty_result_shows_empty_state() {
        let mut session = visible_session();
        let ticket = issue(&mut session, &cpu_query(100));
        assert_eq!(session.complete(&ticket, Ok(Vec::new())), CompletionOutcome::Applied);
        assert_eq!(session.state(), ChartState::Empty);
    }

    #[test]
    fn test_identity_switch_resets_slot() {
        let mut session = visible_session();
        let old = issue(&mut session, &cpu_query(100));

        assert!(!session.switch_identity("cpu-chart"), "same identity is a no-op");
        assert!(session.last_fingerprint().is_some());

        assert!(session.switch_identity("memory-chart"));
        assert_eq!(session.identity(), "memory-chart");
        assert_eq!(session.last_fingerprint(), None);
        assert_eq!(session.viewport().entries(), 1);

        assert!(session.evaluate(&cpu_query(100), Trigger::IdentitySwitched).is_issue());
        assert_eq!(session.complete(&old, Ok(one_series())), CompletionOutcome::Stale);
    }

    #[test]
    fn test_identity_switch_while_hidden_waits_for_entry() {
        let mut session = ChartSession::new("cpu-chart");
        assert!(!session.switch_identity("memory-chart"));
        let decision = session.evaluate(&cpu_query(100), Trigger::IdentitySwitched);
        assert!(matches!(decision, Decision::Suppressed(SuppressReason::NeverVisible)));
    }

    // ------------------------------------------------------------------------
    // Chart slots & drivers
    // ------------------------------------------------------------------------

    #[derive(Debug, Default)]
    struct FakeSource {
        calls: AtomicU64,
        fail: bool,
        delay: Option<Duration>,
        seen: parking_lot::Mutex<Vec<MetricQuery>>,
    }

    #[async_trait]
    impl MetricsSource for FakeSource {
        fn name(&self) -> &str {
            "fake"
        }

        async fn query(&self, query: &MetricQuery) -> QueryResult<Vec<MetricSeries>> {
            self.calls.fetch_add(1, AtomicOrdering::SeqCst);
            self.seen.lock().push(query.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(QueryError::Status {
                    status: 503,
                    body: "unavailable".into(),
                });
            }
            Ok(query
                .metrics
                .iter()
                .map(|metric| {
                    MetricSeries::new(metric.clone(), LabelSet::new().with(LabelKey::SvrIp, "10.0.0.1"))
                        .with_point(query.range.end, 1.0)
                })
                .collect())
        }
    }

    impl FakeSource {
        fn calls(&self) -> u64 {
            self.calls.load(AtomicOrdering::SeqCst)
        }
    }

    #[derive(Debug, Clone, Default)]
    struct RecordingSurface {
        log: Arc<parking_lot::Mutex<Vec<String>>>,
        next: u64,
    }

    impl ChartSurface for RecordingSurface {
        type Instance = u64;

        fn mount(&mut self, view: &ChartViewModel) -> u64 {
            self.next += 1;
            self.log
                .lock()
                .push(format!("mount {} ({} series)", self.next, view.series.len()));
            self.next
        }

        fn destroy(&mut self, instance: u64) {
            self.log.lock().push(format!("destroy {}", instance));
        }
    }

    fn props(end: i64) -> ChartProps {
        ChartProps::new(
            ["cpu"],
            RangeSpec::Fixed {
                range: QueryRange::new(0, end),
            },
        )
        .with_labels(LabelSet::new().with(LabelKey::SvrIp, "10.0.0.1"))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    #[test]
    fn test_chart_slot_destroys_before_mounting() {
        let surface = RecordingSurface::default();
        let log = Arc::clone(&surface.log);
        {
            let mut slot = ChartSlot::new(surface);
            slot.render(&ChartViewModel::default());
            slot.render(&ChartViewModel::default());
            assert!(slot.is_mounted());
            assert_eq!(slot.renders(), 2);
        }
        assert_eq!(
            *log.lock(),
            vec!["mount 1 (0 series)", "destroy 1", "mount 2 (0 series)", "destroy 2"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_fetches_once_per_distinct_props() {
        let source = Arc::new(FakeSource::default());
        let surface = RecordingSurface::default();
        let log = Arc::clone(&surface.log);
        let (handle, events) = chart_channel();
        let driver = ChartDriver::new("cpu-chart", props(100), source.clone(), surface, events);
        let task = tokio::spawn(driver.run());

        handle.set_props(props(100)).await.unwrap();
        settle().await;
        assert_eq!(source.calls(), 0, "not visible yet");

        handle.set_visible(true).await.unwrap();
        settle().await;
        handle.set_props(props(100)).await.unwrap();
        settle().await;
        assert_eq!(source.calls(), 1);

        handle.set_props(props(200)).await.unwrap();
        drop(handle);
        let report = task.await.unwrap();

        assert_eq!(source.calls(), 2);
        assert_eq!(source.seen.lock()[1].range.end, 200);
        assert_eq!(report.stats.issued, 2);
        assert_eq!(report.renders, 2);
        assert_eq!(report.state, ChartState::Ready);
        assert_eq!(log.lock().last().map(String::as_str), Some("destroy 2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_hidden_chart_consumes_no_ticks() {
        let source = Arc::new(FakeSource::default());
        let now = Arc::new(AtomicI64::new(1_700_000_000));
        let clock: Clock = {
            let now = Arc::clone(&now);
            Arc::new(move || now.load(AtomicOrdering::SeqCst))
        };
        let trailing = ChartProps::new(["cpu"], RangeSpec::Trailing { secs: 600 });

        let (handle, events) = chart_channel();
        let driver = ChartDriver::new("cpu-chart", trailing, source.clone(), RecordingSurface::default(), events)
            .with_refresh(Duration::from_secs(15))
            .with_clock(clock);
        let task = tokio::spawn(driver.run());

        handle.set_visible(true).await.unwrap();
        settle().await;
        assert_eq!(source.calls(), 1);

        handle.set_visible(false).await.unwrap();
        settle().await;
        now.fetch_add(30, AtomicOrdering::SeqCst);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(source.calls(), 1, "ticks while hidden must not fetch");

        handle.set_visible(true).await.unwrap();
        settle().await;
        assert_eq!(source.calls(), 2);
        assert_eq!(source.seen.lock()[1].range.end, 1_700_000_030);

        drop(handle);
        let report = task.await.unwrap();
        assert_eq!(report.stats.issued, 2);
        assert_eq!(report.stats.suppressed, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_live_refresh_follows_clock() {
        let source = Arc::new(FakeSource::default());
        let now = Arc::new(AtomicI64::new(1_000));
        let clock: Clock = {
            let now = Arc::clone(&now);
            Arc::new(move || now.fetch_add(15, AtomicOrdering::SeqCst))
        };
        let trailing = ChartProps::new(["cpu"], RangeSpec::Trailing { secs: 600 });

        let (handle, events) = chart_channel();
        let driver = ChartDriver::new("cpu-chart", trailing, source.clone(), RecordingSurface::default(), events)
            .with_refresh(Duration::from_secs(15))
            .with_clock(clock);
        let task = tokio::spawn(driver.run());

        handle.set_visible(true).await.unwrap();
        tokio::time::sleep(Duration::from_secs(46)).await;
        drop(handle);
        let report = task.await.unwrap();

        // entry plus three ticks
        assert_eq!(source.calls(), 4);
        assert!(source.seen.lock().iter().all(|q| q.refresh));
        assert_eq!(report.renders, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_live_refresh_keeps_fixed_range_deduplicated() {
        let source = Arc::new(FakeSource::default());
        let clock: Clock = Arc::new(|| 1_000);

        let (handle, events) = chart_channel();
        let driver = ChartDriver::new("cpu-chart", props(100), source.clone(), RecordingSurface::default(), events)
            .with_refresh(Duration::from_secs(15))
            .with_clock(clock);
        let task = tokio::spawn(driver.run());

        handle.set_visible(true).await.unwrap();
        settle().await;
        assert_eq!(source.calls(), 1);

        tokio::time::sleep(Duration::from_secs(46)).await;
        assert_eq!(source.calls(), 1, "ticks over an unchanged query must not fetch");

        handle.set_props(props(100)).await.unwrap();
        settle().await;
        assert_eq!(source.calls(), 1, "identical props after a tick must not fetch");

        drop(handle);
        let report = task.await.unwrap();
        assert_eq!(report.stats.issued, 1);
        assert!(source.seen.lock()[0].refresh);
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_failure_renders_empty_and_retries_on_next_trigger() {
        let source = Arc::new(FakeSource {
            fail: true,
            ..FakeSource::default()
        });
        let errors = Arc::new(ErrorStats::new());
        let (handle, events) = chart_channel();
        let driver = ChartDriver::new("cpu-chart", props(100), source.clone(), RecordingSurface::default(), events)
            .with_error_stats(Arc::clone(&errors));
        let task = tokio::spawn(driver.run());

        handle.set_visible(true).await.unwrap();
        settle().await;
        handle.set_props(props(100)).await.unwrap();
        drop(handle);
        let report = task.await.unwrap();

        assert_eq!(source.calls(), 2);
        assert_eq!(report.stats.failed, 2);
        assert_eq!(report.state, ChartState::Empty);
        assert!(matches!(report.last_error, Some(QueryError::Status { status: 503, .. })));
        assert_eq!(errors.count_by_category("query"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_drops_responses_from_previous_identity() {
        let source = Arc::new(FakeSource {
            delay: Some(Duration::from_secs(5)),
            ..FakeSource::default()
        });
        let (handle, events) = chart_channel();
        let driver = ChartDriver::new("cpu-chart", props(100), source.clone(), RecordingSurface::default(), events);
        let task = tokio::spawn(driver.run());

        handle.set_visible(true).await.unwrap();
        settle().await;
        handle.switch_identity("memory-chart", props(100)).await.unwrap();
        drop(handle);
        let report = task.await.unwrap();

        assert_eq!(source.calls(), 2);
        assert_eq!(report.identity, "memory-chart");
        assert_eq!(report.stats.stale, 1);
        assert_eq!(report.stats.applied, 1);
        assert_eq!(report.renders, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_driver_shutdown_aborts_in_flight_fetches() {
        let source = Arc::new(FakeSource {
            delay: Some(Duration::from_secs(60)),
            ..FakeSource::default()
        });
        let (handle, events) = chart_channel();
        let driver = ChartDriver::new("cpu-chart", props(100), source.clone(), RecordingSurface::default(), events);
        let task = tokio::spawn(driver.run());

        handle.set_visible(true).await.unwrap();
        settle().await;
        handle.shutdown();
        let report = task.await.unwrap();

        assert_eq!(report.stats.issued, 1);
        assert_eq!(report.stats.applied, 0);
        assert_eq!(report.state, ChartState::Loading);
        assert!(handle.set_visible(false).await.is_err());
    }

    #[tokio::test]
    async fn test_parameter_sink_refuses_empty_submission() {
        let sink = HttpParameterSink::new(&ApiConfig::default()).unwrap();
        assert!(matches!(
            sink.submit(&[]).await,
            Err(QueryError::InvalidQuery { .. })
        ));
    }

    #[test]
    fn test_wire_series_drop_unknown_labels_and_gaps() {
        let raw = r#"{
            "data": [
                {
                    "metric": "cpu",
                    "labels": {"svr_ip": "10.0.0.1", "host": "web-01"},
                    "values": [[100, 0.5], [115, null], [130, 0.7]]
                }
            ]
        }"#;
        let envelope: WireEnvelope<Vec<WireSeries>> = serde_json::from_str(raw).unwrap();
        let series: Vec<MetricSeries> = envelope
            .into_data()
            .unwrap()
            .unwrap()
            .into_iter()
            .map(WireSeries::into_series)
            .collect();

        assert_eq!(series.len(), 1);
        assert_eq!(series[0].labels.len(), 1);
        assert_eq!(series[0].points.len(), 2);
        assert_eq!(series[0].latest(), Some(MetricPoint::new(130, 0.7)));

        let failed: WireEnvelope<Vec<WireSeries>> =
            serde_json::from_str(r#"{"successful": false, "message": "no such metric"}"#).unwrap();
        assert!(matches!(failed.into_data(), Err(QueryError::Decode { .. })));
    }
}

// ============================================================================
// SECTION 18: PROJECTOR & RECONCILER TESTS
// ============================================================================

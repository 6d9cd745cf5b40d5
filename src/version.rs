//! Version identifiers and per-version state

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::checksum::ContentHash;
use crate::error::{Result, TimescapeError};

/// Prefix of every literal TSV token
pub const TSV_PREFIX: &str = "tsv:";

fn tsv_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^tsv:(\d{1,19})-([a-z0-9](?:[a-z0-9-]*[a-z0-9])?)-(\d{1,9})$")
            .expect("TSV pattern is a valid regex")
    })
}

/// Timescape version identifier.
///
/// Encodes `(creation millis, handler slug, sequence)`. The string form is
/// `tsv:<millis>-<slug>-<seq>` with the millis padded to 13 digits and the
/// sequence to 4, so that identifiers of one handler sort lexically in
/// timeline order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tsv {
    timestamp: i64,
    slug: String,
    sequence: u32,
}

impl Tsv {
    /// Mint an identifier. `slug` is normalized with [`slugify`].
    pub fn new(timestamp: i64, slug: &str, sequence: u32) -> Self {
        Self {
            timestamp,
            slug: slugify(slug),
            sequence,
        }
    }

    /// Parse the `tsv:` string form
    pub fn parse(token: &str) -> Result<Self> {
        let caps = tsv_pattern()
            .captures(token)
            .ok_or_else(|| TimescapeError::invalid_format(token, "expected tsv:<millis>-<slug>-<seq>"))?;

        let timestamp = caps[1]
            .parse::<i64>()
            .map_err(|e| TimescapeError::invalid_format(token, format!("bad millis: {}", e)))?;
        let sequence = caps[3]
            .parse::<u32>()
            .map_err(|e| TimescapeError::invalid_format(token, format!("bad sequence: {}", e)))?;

        Ok(Self {
            timestamp,
            slug: caps[2].to_string(),
            sequence,
        })
    }

    /// Creation time in unix milliseconds
    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp
    }

    pub fn slug(&self) -> &str {
        &self.slug
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Timeline position key: `(timestamp, sequence)`
    pub fn order_key(&self) -> (i64, u32) {
        (self.timestamp, self.sequence)
    }
}

impl fmt::Display for Tsv {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{:013}-{}-{:04}",
            TSV_PREFIX, self.timestamp, self.slug, self.sequence
        )
    }
}

impl FromStr for Tsv {
    type Err = TimescapeError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl PartialOrd for Tsv {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Tsv {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.slug.cmp(&other.slug))
            .then_with(|| self.sequence.cmp(&other.sequence))
    }
}

impl Serialize for Tsv {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Tsv {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Tsv::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Normalize a handler path into the slug embedded in its TSVs.
///
/// `/users/{id}/orders` becomes `users-id-orders`; the root path becomes `root`.
pub fn slugify(handler_path: &str) -> String {
    let mut slug = String::with_capacity(handler_path.len());
    let mut pending_dash = false;
    for c in handler_path.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    if slug.is_empty() {
        slug.push_str("root");
    }
    slug
}

/// Lifecycle classification of a version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionStatus {
    Hot,
    Warm,
    Cold,
    Deactivated,
}

impl VersionStatus {
    fn to_u8(self) -> u8 {
        match self {
            VersionStatus::Hot => 0,
            VersionStatus::Warm => 1,
            VersionStatus::Cold => 2,
            VersionStatus::Deactivated => 3,
        }
    }

    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => VersionStatus::Hot,
            1 => VersionStatus::Warm,
            2 => VersionStatus::Cold,
            _ => VersionStatus::Deactivated,
        }
    }

    pub fn is_active(self) -> bool {
        self != VersionStatus::Deactivated
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VersionStatus::Hot => "hot",
            VersionStatus::Warm => "warm",
            VersionStatus::Cold => "cold",
            VersionStatus::Deactivated => "deactivated",
        }
    }
}

impl fmt::Display for VersionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of a handler timeline.
///
/// The identity fields never change after registration. Access counters and
/// the lifecycle status are atomics so the serving path and the lifecycle
/// sweep can update them through a shared timeline snapshot.
#[derive(Debug)]
pub struct VersionEntry {
    tsv: Tsv,
    content_hash: ContentHash,
    db_schema_version: Option<String>,
    request_count: AtomicU64,
    last_accessed_at: AtomicI64,
    status: AtomicU8,
}

impl VersionEntry {
    pub(crate) fn new(tsv: Tsv, content_hash: ContentHash, db_schema_version: Option<String>) -> Self {
        let created = tsv.timestamp_millis();
        Self {
            tsv,
            content_hash,
            db_schema_version,
            request_count: AtomicU64::new(0),
            last_accessed_at: AtomicI64::new(created),
            status: AtomicU8::new(VersionStatus::Warm.to_u8()),
        }
    }

    pub(crate) fn from_info(info: &VersionInfo) -> Self {
        Self {
            tsv: info.tsv.clone(),
            content_hash: info.content_hash.clone(),
            db_schema_version: info.db_schema_version.clone(),
            request_count: AtomicU64::new(info.request_count),
            last_accessed_at: AtomicI64::new(info.last_accessed_at),
            status: AtomicU8::new(info.status.to_u8()),
        }
    }

    pub fn tsv(&self) -> &Tsv {
        &self.tsv
    }

    pub fn timestamp(&self) -> i64 {
        self.tsv.timestamp_millis()
    }

    pub fn content_hash(&self) -> &ContentHash {
        &self.content_hash
    }

    pub fn db_schema_version(&self) -> Option<&str> {
        self.db_schema_version.as_deref()
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn last_accessed_at(&self) -> i64 {
        self.last_accessed_at.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> VersionStatus {
        VersionStatus::from_u8(self.status.load(Ordering::Acquire))
    }

    pub fn is_active(&self) -> bool {
        self.status().is_active()
    }

    /// Count one served request
    pub(crate) fn record_access(&self, now_millis: i64) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.last_accessed_at.fetch_max(now_millis, Ordering::Relaxed);
    }

    /// Restart the idle clock without counting a request
    pub(crate) fn touch(&self, now_millis: i64) {
        self.last_accessed_at.fetch_max(now_millis, Ordering::Relaxed);
    }

    pub(crate) fn set_status(&self, status: VersionStatus) {
        self.status.store(status.to_u8(), Ordering::Release);
    }

    /// Point-in-time copy including the given tags
    pub fn info(&self, tags: BTreeSet<String>) -> VersionInfo {
        VersionInfo {
            tsv: self.tsv.clone(),
            timestamp: self.timestamp(),
            content_hash: self.content_hash.clone(),
            status: self.status(),
            request_count: self.request_count(),
            last_accessed_at: self.last_accessed_at(),
            tags,
            db_schema_version: self.db_schema_version.clone(),
        }
    }
}

/// Serializable view of a version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub tsv: Tsv,
    pub timestamp: i64,
    pub content_hash: ContentHash,
    pub status: VersionStatus,
    pub request_count: u64,
    pub last_accessed_at: i64,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_schema_version: Option<String>,
}

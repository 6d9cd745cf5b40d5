//! Version resolution
//!
//! Maps a client's version token to a concrete [`Tsv`]. A token is classified
//! as one of:
//!
//! - a `tsv:` literal, used as-is
//! - an ISO-8601 timestamp (anything containing `T`), resolved to the version
//!   active at that instant
//! - otherwise a tag label
//!
//! A missing or empty token resolves to the handler's latest version. The
//! query-parameter token wins over the header token.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, NaiveDateTime};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::cache::LruCache;
use crate::error::{Result, TimescapeError};
use crate::registry::VersionRegistry;
use crate::version::{Tsv, TSV_PREFIX};

/// Request header carrying the client version when no query parameter is given
pub const VERSION_HEADER: &str = "X-API-Version";
/// Query parameter carrying the client version
pub const VERSION_QUERY_PARAM: &str = "version";

/// A classified version token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionToken {
    Tag(String),
    /// Unix milliseconds
    Timestamp(i64),
    Literal(Tsv),
    Latest,
}

impl VersionToken {
    /// Classify a raw token. `None` and blank tokens mean "latest".
    pub fn classify(raw: Option<&str>) -> Result<Self> {
        let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
            return Ok(VersionToken::Latest);
        };
        if raw.starts_with(TSV_PREFIX) {
            return Tsv::parse(raw).map(VersionToken::Literal);
        }
        if raw.contains('T') {
            return parse_timestamp(raw).map(VersionToken::Timestamp);
        }
        Ok(VersionToken::Tag(raw.to_string()))
    }
}

/// Parse an ISO-8601 instant to unix milliseconds. Inputs without an offset
/// are read as UTC.
pub fn parse_timestamp(raw: &str) -> Result<i64> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.timestamp_millis());
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(naive.and_utc().timestamp_millis());
        }
    }
    Err(TimescapeError::invalid_format(raw, "not an ISO-8601 timestamp"))
}

/// How a resolution was reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionSource {
    Tag,
    Timestamp,
    Literal,
    Latest,
}

impl fmt::Display for ResolutionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResolutionSource::Tag => "tag",
            ResolutionSource::Timestamp => "timestamp",
            ResolutionSource::Literal => "literal",
            ResolutionSource::Latest => "latest",
        };
        f.write_str(name)
    }
}

/// The version a client token resolved to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub version: Tsv,
    pub source: ResolutionSource,
}

type CacheKey = (String, String);

/// Resolves client tokens against the registry with a bounded cache.
///
/// Cached entries remember the handler generation they were computed at and
/// are ignored once the handler has changed since.
pub struct VersionResolver {
    registry: Arc<VersionRegistry>,
    cache: Mutex<LruCache<CacheKey, (Resolution, u64)>>,
}

impl VersionResolver {
    pub fn new(registry: Arc<VersionRegistry>, cache_capacity: usize) -> Self {
        Self {
            registry,
            cache: Mutex::new(LruCache::new(cache_capacity)),
        }
    }

    /// Resolve the client version for one request to `handler_path`
    pub fn resolve(
        &self,
        handler_path: &str,
        query_token: Option<&str>,
        header_token: Option<&str>,
    ) -> Result<Resolution> {
        let token = query_token
            .filter(|t| !t.trim().is_empty())
            .or(header_token.filter(|t| !t.trim().is_empty()));
        let key = (handler_path.to_string(), token.unwrap_or_default().to_string());

        // Read the generation before resolving so a concurrent change leaves
        // the entry stale rather than wrongly fresh.
        let generation = self.registry.generation(handler_path);
        if let Some((resolution, cached_at)) = self.cache.lock().get(&key) {
            if cached_at == generation {
                return Ok(resolution);
            }
        }

        let resolution = self.resolve_uncached(handler_path, token)?;
        self.cache.lock().insert(key, (resolution.clone(), generation));
        Ok(resolution)
    }

    fn resolve_uncached(&self, handler_path: &str, token: Option<&str>) -> Result<Resolution> {
        let resolution = match VersionToken::classify(token)? {
            VersionToken::Literal(version) => Resolution {
                version,
                source: ResolutionSource::Literal,
            },
            VersionToken::Timestamp(millis) => Resolution {
                version: self.registry.get_version_at(handler_path, millis)?,
                source: ResolutionSource::Timestamp,
            },
            VersionToken::Tag(label) => Resolution {
                version: self
                    .registry
                    .get_version_by_tag(handler_path, &label)
                    .ok_or_else(|| TimescapeError::not_found(handler_path, format!("unknown tag '{}'", label)))?,
                source: ResolutionSource::Tag,
            },
            VersionToken::Latest => Resolution {
                version: self.registry.latest_version(handler_path)?,
                source: ResolutionSource::Latest,
            },
        };
        tracing::debug!(
            "Resolved {:?} for {} to {} via {}",
            token.unwrap_or_default(),
            handler_path,
            resolution.version,
            resolution.source
        );
        Ok(resolution)
    }

    /// Drop every cached resolution for a handler
    pub fn invalidate(&self, handler_path: &str) {
        self.cache.lock().retain(|(path, _), _| path != handler_path);
    }

    /// `(hits, misses)` of the resolution cache
    pub fn cache_stats(&self) -> (u64, u64) {
        self.cache.lock().stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::ContentHash;
    use crate::clock::ManualClock;

    const T1: i64 = 1_704_067_200_000; // 2024-01-01T00:00:00Z
    const T2: i64 = 1_709_251_200_000; // 2024-03-01T00:00:00Z
    const T3: i64 = 1_717_200_000_000; // 2024-06-01T00:00:00Z

    fn setup() -> (Arc<VersionRegistry>, Vec<Tsv>) {
        let clock = Arc::new(ManualClock::new(T1));
        let registry = Arc::new(VersionRegistry::new(clock.clone()));
        let mut versions = Vec::new();
        for (i, at) in [T1, T2, T3].into_iter().enumerate() {
            clock.set(at);
            versions.push(
                registry
                    .register_version("/users", ContentHash::of_str(&i.to_string()), None)
                    .unwrap(),
            );
        }
        (registry, versions)
    }

    #[test]
    fn test_classify() {
        assert_eq!(VersionToken::classify(None).unwrap(), VersionToken::Latest);
        assert_eq!(VersionToken::classify(Some("  ")).unwrap(), VersionToken::Latest);
        assert_eq!(
            VersionToken::classify(Some("v1.0")).unwrap(),
            VersionToken::Tag("v1.0".to_string())
        );
        assert_eq!(
            VersionToken::classify(Some("2024-01-01T00:00:00Z")).unwrap(),
            VersionToken::Timestamp(T1)
        );
        assert_eq!(
            VersionToken::classify(Some("2024-01-01T00:00:00")).unwrap(),
            VersionToken::Timestamp(T1)
        );
        assert!(matches!(
            VersionToken::classify(Some("tsv:0000001704067200000-users-0000")).unwrap(),
            VersionToken::Literal(_)
        ));
    }

    #[test]
    fn test_classify_rejects_malformed() {
        for bad in ["2024-13-45T99:00:00Z", "tsv:abc", "Tomorrow"] {
            let err = VersionToken::classify(Some(bad)).unwrap_err();
            assert!(matches!(err, TimescapeError::InvalidVersionFormat { .. }), "{}", bad);
        }
    }

    #[test]
    fn test_timestamp_resolution() {
        let (registry, v) = setup();
        let resolver = VersionResolver::new(registry, 16);
        let r = resolver.resolve("/users", Some("2024-02-15T00:00:00Z"), None).unwrap();
        assert_eq!(r.version, v[0]);
        assert_eq!(r.source, ResolutionSource::Timestamp);
        let r = resolver.resolve("/users", Some("2024-04-01T00:00:00Z"), None).unwrap();
        assert_eq!(r.version, v[1]);
        let r = resolver.resolve("/users", Some("2030-01-01T00:00:00Z"), None).unwrap();
        assert_eq!(r.version, v[2]);
    }

    #[test]
    fn test_query_wins_over_header() {
        let (registry, v) = setup();
        registry.tag_version(&v[0], "v1.0", "test").unwrap();
        registry.tag_version(&v[1], "v2.0", "test").unwrap();
        let resolver = VersionResolver::new(registry, 16);

        let r = resolver.resolve("/users", Some("v1.0"), Some("v2.0")).unwrap();
        assert_eq!(r.version, v[0]);
        let r = resolver.resolve("/users", None, Some("v2.0")).unwrap();
        assert_eq!(r.version, v[1]);
        let r = resolver.resolve("/users", Some(""), Some("v2.0")).unwrap();
        assert_eq!(r.version, v[1]);
        let r = resolver.resolve("/users", None, None).unwrap();
        assert_eq!((r.version, r.source), (v[2].clone(), ResolutionSource::Latest));
    }

    #[test]
    fn test_unknown_tag() {
        let (registry, _) = setup();
        let resolver = VersionResolver::new(registry, 16);
        let err = resolver.resolve("/users", Some("v9"), None).unwrap_err();
        assert!(matches!(err, TimescapeError::VersionNotFound { .. }));
        assert!(err.is_client_error());
    }

    #[test]
    fn test_cache_invalidated_by_registry_changes() {
        let (registry, v) = setup();
        registry.tag_version(&v[0], "stable", "test").unwrap();
        let resolver = VersionResolver::new(registry.clone(), 16);

        assert_eq!(resolver.resolve("/users", Some("stable"), None).unwrap().version, v[0]);
        assert_eq!(resolver.resolve("/users", Some("stable"), None).unwrap().version, v[0]);
        assert_eq!(resolver.cache_stats().0, 1);

        registry.untag_version("stable");
        registry.tag_version(&v[1], "stable", "test").unwrap();
        assert_eq!(resolver.resolve("/users", Some("stable"), None).unwrap().version, v[1]);
    }

    #[test]
    fn test_literal_passes_through() {
        let (registry, v) = setup();
        let resolver = VersionResolver::new(registry, 16);
        let r = resolver.resolve("/users", Some(&v[1].to_string()), None).unwrap();
        assert_eq!((r.version, r.source), (v[1].clone(), ResolutionSource::Literal));
    }
}

//! Version Registry
//!
//! Holds one timeline per handler path plus the global tag table. Reads clone
//! an `Arc` of the current timeline and never wait on writers of other
//! handlers; writes to one handler are serialized by that handler's write
//! lock. Each handler also carries a generation counter that is bumped on
//! every mutation so resolution caches can detect staleness.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::checksum::ContentHash;
use crate::clock::Clock;
use crate::error::{Result, TimescapeError};
use crate::persistence::RegistrySnapshot;
use crate::tag::{validate_label, TagTable, VersionTag};
use crate::timeline::VersionTimeline;
use crate::version::{slugify, Tsv, VersionEntry, VersionInfo, VersionStatus};

struct HandlerState {
    path: String,
    slug: String,
    timeline: RwLock<Arc<VersionTimeline>>,
    write: Mutex<()>,
    live: RwLock<Option<Tsv>>,
    generation: AtomicU64,
}

impl HandlerState {
    fn new(path: &str, slug: String) -> Self {
        Self {
            path: path.to_string(),
            slug,
            timeline: RwLock::new(Arc::new(VersionTimeline::new())),
            write: Mutex::new(()),
            live: RwLock::new(None),
            generation: AtomicU64::new(0),
        }
    }

    fn snapshot(&self) -> Arc<VersionTimeline> {
        self.timeline.read().clone()
    }

    fn bump(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }
}

/// The authoritative registry of handler versions and tags
pub struct VersionRegistry {
    clock: Arc<dyn Clock>,
    handlers: RwLock<HashMap<String, Arc<HandlerState>>>,
    /// Which handler minted each version
    owners: RwLock<HashMap<Tsv, String>>,
    tags: RwLock<TagTable>,
}

impl VersionRegistry {
    /// Create an empty registry
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            handlers: RwLock::new(HashMap::new()),
            owners: RwLock::new(HashMap::new()),
            tags: RwLock::new(TagTable::default()),
        }
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn handler(&self, handler_path: &str) -> Option<Arc<HandlerState>> {
        self.handlers.read().get(handler_path).cloned()
    }

    fn handler_or_create(&self, handler_path: &str) -> Result<Arc<HandlerState>> {
        if let Some(state) = self.handler(handler_path) {
            return Ok(state);
        }
        let mut handlers = self.handlers.write();
        if let Some(state) = handlers.get(handler_path) {
            return Ok(state.clone());
        }
        let slug = unique_slug(&handlers, handler_path)?;
        let state = Arc::new(HandlerState::new(handler_path, slug));
        handlers.insert(handler_path.to_string(), state.clone());
        Ok(state)
    }

    /// All known handler paths, sorted
    pub fn handlers(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.handlers.read().keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Current timeline of a handler
    pub fn timeline(&self, handler_path: &str) -> Option<Arc<VersionTimeline>> {
        self.handler(handler_path).map(|h| h.snapshot())
    }

    /// Mutation counter of a handler, used to invalidate cached resolutions
    pub fn generation(&self, handler_path: &str) -> u64 {
        self.handler(handler_path)
            .map(|h| h.generation.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    /// Register a new version of a handler and return its identifier.
    ///
    /// Fails with `DuplicateContent` when the handler's most recent version
    /// already has `content_hash`.
    pub fn register_version(
        &self,
        handler_path: &str,
        content_hash: ContentHash,
        db_schema_version: Option<String>,
    ) -> Result<Tsv> {
        let state = self.handler_or_create(handler_path)?;
        let _guard = state.write.lock();
        let current = state.snapshot();

        let now = self.clock.now_millis();
        let (timestamp, sequence) = match current.last() {
            Some(last) => {
                if *last.content_hash() == content_hash {
                    return Err(TimescapeError::DuplicateContent {
                        handler_path: handler_path.to_string(),
                        content_hash: content_hash.to_string(),
                        tsv: last.tsv().clone(),
                    });
                }
                // A clock running behind the last entry must not break ordering.
                (now.max(last.timestamp()), last.tsv().sequence() + 1)
            }
            None => (now, 0),
        };

        let tsv = Tsv::new(timestamp, &state.slug, sequence);
        let entry = Arc::new(VersionEntry::new(tsv.clone(), content_hash, db_schema_version));
        let next = current.appended(entry);

        {
            let mut owners = self.owners.write();
            if let Some(other) = owners.get(&tsv) {
                return Err(TimescapeError::SlugCollision {
                    handler_path: handler_path.to_string(),
                    slug: state.slug.clone(),
                    other: other.clone(),
                });
            }
            owners.insert(tsv.clone(), state.path.clone());
        }
        *state.timeline.write() = Arc::new(next);
        state.bump();

        tracing::info!("Registered version {} for {}", tsv, handler_path);
        Ok(tsv)
    }

    /// The active version in effect at `timestamp` (unix millis).
    ///
    /// Queries before the first version resolve to the earliest active one.
    pub fn get_version_at(&self, handler_path: &str, timestamp: i64) -> Result<Tsv> {
        let timeline = self
            .timeline(handler_path)
            .ok_or_else(|| TimescapeError::not_found(handler_path, "handler has no versions"))?;
        timeline
            .at(timestamp)
            .map(|e| e.tsv().clone())
            .ok_or_else(|| TimescapeError::not_found(handler_path, "handler has no active versions"))
    }

    /// Most recent active version of a handler
    pub fn latest_version(&self, handler_path: &str) -> Result<Tsv> {
        let timeline = self
            .timeline(handler_path)
            .ok_or_else(|| TimescapeError::not_found(handler_path, "handler has no versions"))?;
        timeline
            .latest_active()
            .map(|e| e.tsv().clone())
            .ok_or_else(|| TimescapeError::not_found(handler_path, "handler has no active versions"))
    }

    /// Version a tag points to, if the tag exists and belongs to this handler
    pub fn get_version_by_tag(&self, handler_path: &str, label: &str) -> Option<Tsv> {
        let tsv = self.tags.read().get(label)?.tsv.clone();
        let timeline = self.timeline(handler_path)?;
        timeline.get(&tsv).map(|e| e.tsv().clone())
    }

    /// Point `label` at `tsv`.
    ///
    /// Re-tagging the same version is a no-op; a label that already points
    /// elsewhere fails with `DuplicateTag`.
    pub fn tag_version(&self, tsv: &Tsv, label: &str, created_by: &str) -> Result<()> {
        validate_label(label)?;
        let (handler_path, _) = self.locate(tsv)?;

        let created = self.tags.write().insert(VersionTag {
            label: label.to_string(),
            tsv: tsv.clone(),
            created_at: self.clock.now(),
            created_by: created_by.to_string(),
        })?;

        if created {
            if let Some(state) = self.handler(&handler_path) {
                state.bump();
            }
            tracing::info!("Tagged {} as '{}' (by {})", tsv, label, created_by);
        }
        Ok(())
    }

    /// Remove a tag. Returns whether a tag was removed.
    pub fn untag_version(&self, label: &str) -> bool {
        let Some(tag) = self.tags.write().remove(label) else {
            return false;
        };
        if let Some(state) = self.handler_of(&tag.tsv).and_then(|path| self.handler(&path)) {
            state.bump();
        }
        tracing::info!("Removed tag '{}' from {}", label, tag.tsv);
        true
    }

    pub fn tag(&self, label: &str) -> Option<VersionTag> {
        self.tags.read().get(label).cloned()
    }

    pub fn get_tags_for_version(&self, tsv: &Tsv) -> Vec<String> {
        self.tags.read().labels_for(tsv).into_iter().collect()
    }

    pub fn get_all_tags(&self) -> Vec<VersionTag> {
        self.tags.read().all()
    }

    /// Handler path that owns `tsv`
    pub fn handler_of(&self, tsv: &Tsv) -> Option<String> {
        self.owners.read().get(tsv).cloned()
    }

    /// Find a version anywhere in the registry
    pub fn locate(&self, tsv: &Tsv) -> Result<(String, Arc<VersionEntry>)> {
        let handler_path = self
            .handler_of(tsv)
            .ok_or_else(|| TimescapeError::not_found(tsv.slug(), format!("unknown version {}", tsv)))?;
        let entry = self
            .timeline(&handler_path)
            .and_then(|t| t.get(tsv).cloned())
            .ok_or_else(|| TimescapeError::not_found(&handler_path, format!("unknown version {}", tsv)))?;
        Ok((handler_path, entry))
    }

    /// Whether `to` directly follows `from` on the same handler's timeline
    pub fn are_adjacent(&self, from: &Tsv, to: &Tsv) -> bool {
        let Some(handler_path) = self.handler_of(from) else {
            return false;
        };
        self.timeline(&handler_path)
            .map(|t| t.are_adjacent(from, to))
            .unwrap_or(false)
    }

    /// Point-in-time view of one version
    pub fn info(&self, tsv: &Tsv) -> Result<VersionInfo> {
        let (_, entry) = self.locate(tsv)?;
        Ok(entry.info(self.tags.read().labels_for(tsv)))
    }

    /// Point-in-time view of a handler's whole timeline, oldest first
    pub fn list(&self, handler_path: &str) -> Vec<VersionInfo> {
        let Some(timeline) = self.timeline(handler_path) else {
            return Vec::new();
        };
        let tags = self.tags.read();
        timeline
            .entries()
            .iter()
            .map(|e| e.info(tags.labels_for(e.tsv())))
            .collect()
    }

    /// Count one served request against `tsv`
    pub fn record_access(&self, tsv: &Tsv) -> Result<()> {
        let (_, entry) = self.locate(tsv)?;
        entry.record_access(self.clock.now_millis());
        Ok(())
    }

    /// Change the lifecycle status of a version and return the previous one
    pub(crate) fn set_status(&self, tsv: &Tsv, status: VersionStatus) -> Result<VersionStatus> {
        let (handler_path, entry) = self.locate(tsv)?;
        let state = self
            .handler(&handler_path)
            .ok_or_else(|| TimescapeError::not_found(&handler_path, "handler disappeared"))?;
        let _guard = state.write.lock();

        let previous = entry.status();
        if previous != status {
            entry.set_status(status);
            // Activation changes what resolution can return.
            if previous.is_active() != status.is_active() {
                state.bump();
            }
            tracing::debug!("Version {} status {} -> {}", tsv, previous, status);
        }
        Ok(previous)
    }

    /// Bind a handler's live code to `tsv`
    pub fn bind_live(&self, handler_path: &str, tsv: &Tsv) -> Result<()> {
        let state = self
            .handler(handler_path)
            .ok_or_else(|| TimescapeError::not_found(handler_path, "handler has no versions"))?;
        let _guard = state.write.lock();
        if state.snapshot().get(tsv).is_none() {
            return Err(TimescapeError::not_found(
                handler_path,
                format!("{} is not a version of this handler", tsv),
            ));
        }
        *state.live.write() = Some(tsv.clone());
        state.bump();
        tracing::info!("Bound {} to live version {}", handler_path, tsv);
        Ok(())
    }

    /// The version live code runs as: the bound version while it is active,
    /// otherwise the latest active version.
    pub fn live_version(&self, handler_path: &str) -> Result<Tsv> {
        let state = self
            .handler(handler_path)
            .ok_or_else(|| TimescapeError::not_found(handler_path, "handler has no versions"))?;
        let bound = state.live.read().clone();
        if let Some(tsv) = bound {
            if state.snapshot().get(&tsv).is_some_and(|e| e.is_active()) {
                return Ok(tsv);
            }
        }
        self.latest_version(handler_path)
    }

    /// Whether `tsv` is the explicitly bound live version of its handler
    pub fn is_bound_live(&self, tsv: &Tsv) -> bool {
        self.handler_of(tsv)
            .and_then(|path| self.handler(&path))
            .is_some_and(|state| state.live.read().as_ref() == Some(tsv))
    }

    /// Point-in-time copy of the whole registry.
    ///
    /// Each handler is copied under its own read, so the snapshot never holds
    /// more than one lock at a time.
    pub fn snapshot(&self) -> RegistrySnapshot {
        let states: Vec<Arc<HandlerState>> = self.handlers.read().values().cloned().collect();
        let tags = self.tags.read().clone();

        let mut timelines = BTreeMap::new();
        let mut live = BTreeMap::new();
        for state in states {
            let timeline = state.snapshot();
            let infos = timeline
                .entries()
                .iter()
                .map(|e| e.info(tags.labels_for(e.tsv())))
                .collect();
            timelines.insert(state.path.clone(), infos);
            if let Some(tsv) = state.live.read().clone() {
                live.insert(state.path.clone(), tsv);
            }
        }

        RegistrySnapshot {
            timelines,
            tags: tags.all().into_iter().map(|t| (t.label.clone(), t)).collect(),
            live,
        }
    }

    /// Rebuild a registry from a snapshot
    pub fn restore(snapshot: RegistrySnapshot, clock: Arc<dyn Clock>) -> Result<Self> {
        let registry = Self::new(clock);
        {
            let mut handlers = registry.handlers.write();
            let mut owners = registry.owners.write();
            let mut slugs: HashMap<String, String> = HashMap::new();
            for (path, infos) in snapshot.timelines {
                let entries = infos.iter().map(|i| Arc::new(VersionEntry::from_info(i))).collect();
                let timeline = VersionTimeline::from_entries(entries);
                // Keep minting under the slug the handler already used.
                let Some(slug) = timeline.entries().first().map(|e| e.tsv().slug().to_string()) else {
                    continue;
                };
                if let Some(other) = slugs.insert(slug.clone(), path.clone()) {
                    return Err(TimescapeError::SlugCollision {
                        handler_path: path,
                        slug,
                        other,
                    });
                }
                let state = HandlerState::new(&path, slug);
                for entry in timeline.entries() {
                    if let Some(other) = owners.insert(entry.tsv().clone(), path.clone()) {
                        return Err(TimescapeError::Snapshot(format!(
                            "version {} appears under both {} and {}",
                            entry.tsv(),
                            other,
                            path
                        )));
                    }
                }
                *state.timeline.write() = Arc::new(timeline);
                *state.live.write() = snapshot.live.get(&path).cloned();
                handlers.insert(path, Arc::new(state));
            }
        }
        {
            let owners = registry.owners.read();
            let mut tags = registry.tags.write();
            for (label, tag) in snapshot.tags {
                if label != tag.label {
                    return Err(TimescapeError::Snapshot(format!(
                        "tag key '{}' does not match label '{}'",
                        label, tag.label
                    )));
                }
                if !owners.contains_key(&tag.tsv) {
                    return Err(TimescapeError::Snapshot(format!(
                        "tag '{}' points to unknown version {}",
                        label, tag.tsv
                    )));
                }
                tags.insert(tag)?;
            }
        }
        Ok(registry)
    }

    /// Serialize the full registry state to JSON
    pub fn serialize(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.snapshot())?)
    }

    /// Rebuild a registry from [`serialize`](Self::serialize) output
    pub fn deserialize(blob: &str, clock: Arc<dyn Clock>) -> Result<Self> {
        let snapshot: RegistrySnapshot = serde_json::from_str(blob)?;
        Self::restore(snapshot, clock)
    }
}

/// Slug for a new handler. A path whose plain slug is taken by another
/// handler gets a suffix derived from the path's hash.
fn unique_slug(handlers: &HashMap<String, Arc<HandlerState>>, handler_path: &str) -> Result<String> {
    let taken = |slug: &str| handlers.values().find(|h| h.slug == slug).map(|h| h.path.clone());

    let plain = slugify(handler_path);
    let Some(first) = taken(&plain) else {
        return Ok(plain);
    };
    let hash = ContentHash::of_str(handler_path);
    let suffixed = format!("{}-{}", plain, &hash.as_str()[..8]);
    match taken(&suffixed) {
        None => {
            tracing::warn!(
                "Slug '{}' of {} is used by {}; minting as '{}'",
                plain,
                handler_path,
                first,
                suffixed
            );
            Ok(suffixed)
        }
        Some(other) => Err(TimescapeError::SlugCollision {
            handler_path: handler_path.to_string(),
            slug: suffixed,
            other,
        }),
    }
}

impl std::fmt::Debug for VersionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionRegistry")
            .field("handlers", &self.handlers.read().len())
            .field("tags", &self.tags.read().len())
            .finish()
    }
}

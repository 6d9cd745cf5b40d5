//! Human-readable version tags
//!
//! Tags live in one flat namespace shared by all handlers. The table keeps a
//! forward map (label to tag) and a reverse index (version to labels) in step.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TimescapeError};
use crate::version::{Tsv, TSV_PREFIX};

/// A label pointing at exactly one version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionTag {
    pub label: String,
    pub tsv: Tsv,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
}

impl VersionTag {
    /// The label as a semantic version, for labels like `v1.2.0`
    pub fn semver(&self) -> Option<Version> {
        let raw = self.label.strip_prefix('v').unwrap_or(&self.label);
        Version::parse(raw).ok()
    }
}

/// Check that a label can be resolved back as a tag.
///
/// Tokens containing `T` are read as timestamps and `tsv:` tokens as literal
/// identifiers, so such labels could never be looked up.
pub fn validate_label(label: &str) -> Result<()> {
    if label.is_empty() {
        return Err(TimescapeError::invalid_format(label, "tag label is empty"));
    }
    if label.chars().any(char::is_whitespace) {
        return Err(TimescapeError::invalid_format(label, "tag label contains whitespace"));
    }
    if label.contains('T') {
        return Err(TimescapeError::invalid_format(
            label,
            "tag label contains 'T' and would be read as a timestamp",
        ));
    }
    if label.starts_with(TSV_PREFIX) {
        return Err(TimescapeError::invalid_format(label, "tag label uses the tsv: prefix"));
    }
    Ok(())
}

#[derive(Debug, Default, Clone)]
pub(crate) struct TagTable {
    by_label: HashMap<String, VersionTag>,
    by_version: HashMap<Tsv, BTreeSet<String>>,
}

impl TagTable {
    pub(crate) fn get(&self, label: &str) -> Option<&VersionTag> {
        self.by_label.get(label)
    }

    /// Insert a tag. Returns `false` when the same label already points at
    /// the same version.
    pub(crate) fn insert(&mut self, tag: VersionTag) -> Result<bool> {
        if let Some(existing) = self.by_label.get(&tag.label) {
            if existing.tsv == tag.tsv {
                return Ok(false);
            }
            return Err(TimescapeError::DuplicateTag {
                label: tag.label,
                existing: existing.tsv.clone(),
            });
        }
        self.by_version
            .entry(tag.tsv.clone())
            .or_default()
            .insert(tag.label.clone());
        self.by_label.insert(tag.label.clone(), tag);
        Ok(true)
    }

    pub(crate) fn remove(&mut self, label: &str) -> Option<VersionTag> {
        let tag = self.by_label.remove(label)?;
        if let Some(labels) = self.by_version.get_mut(&tag.tsv) {
            labels.remove(label);
            if labels.is_empty() {
                self.by_version.remove(&tag.tsv);
            }
        }
        Some(tag)
    }

    pub(crate) fn labels_for(&self, tsv: &Tsv) -> BTreeSet<String> {
        self.by_version.get(tsv).cloned().unwrap_or_default()
    }

    /// All tags: semantic labels in version order first, then the rest by label
    pub(crate) fn all(&self) -> Vec<VersionTag> {
        let mut tags: Vec<VersionTag> = self.by_label.values().cloned().collect();
        tags.sort_by(|a, b| match (a.semver(), b.semver()) {
            (Some(va), Some(vb)) => va.cmp(&vb).then_with(|| a.label.cmp(&b.label)),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.label.cmp(&b.label),
        });
        tags
    }

    pub(crate) fn len(&self) -> usize {
        self.by_label.len()
    }
}

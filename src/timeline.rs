//! Per-handler version timelines
//!
//! A timeline is append-only and is never edited in place: appending builds a
//! new timeline that the registry swaps in, so a reader holding an
//! `Arc<VersionTimeline>` always sees a complete, consistent sequence.

use std::sync::Arc;

use crate::version::{Tsv, VersionEntry};

/// Versions of one handler, strictly ordered by `(timestamp, sequence)`
#[derive(Debug, Default, Clone)]
pub struct VersionTimeline {
    entries: Vec<Arc<VersionEntry>>,
}

impl VersionTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_entries(mut entries: Vec<Arc<VersionEntry>>) -> Self {
        entries.sort_by_key(|e| e.tsv().order_key());
        entries.dedup_by(|a, b| a.tsv().order_key() == b.tsv().order_key());
        Self { entries }
    }

    /// All entries, deactivated ones included, oldest first
    pub fn entries(&self) -> &[Arc<VersionEntry>] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Most recently registered entry regardless of status
    pub fn last(&self) -> Option<&Arc<VersionEntry>> {
        self.entries.last()
    }

    pub fn latest_active(&self) -> Option<&Arc<VersionEntry>> {
        self.entries.iter().rev().find(|e| e.is_active())
    }

    /// The oldest version still in service; the answer for queries that
    /// predate the whole timeline.
    pub fn earliest_active(&self) -> Option<&Arc<VersionEntry>> {
        self.entries.iter().find(|e| e.is_active())
    }

    /// Index of `tsv` in this timeline
    pub fn position(&self, tsv: &Tsv) -> Option<usize> {
        let idx = self
            .entries
            .binary_search_by_key(&tsv.order_key(), |e| e.tsv().order_key())
            .ok()?;
        (self.entries[idx].tsv() == tsv).then_some(idx)
    }

    pub fn get(&self, tsv: &Tsv) -> Option<&Arc<VersionEntry>> {
        self.position(tsv).map(|idx| &self.entries[idx])
    }

    /// The active version in effect at `timestamp`.
    ///
    /// Binary search finds the last entry created at or before `timestamp`;
    /// deactivated entries are stepped over towards the past. Queries that
    /// predate every active entry resolve to the earliest active one.
    pub fn at(&self, timestamp: i64) -> Option<&Arc<VersionEntry>> {
        let end = self.entries.partition_point(|e| e.timestamp() <= timestamp);
        self.entries[..end]
            .iter()
            .rev()
            .find(|e| e.is_active())
            .or_else(|| self.earliest_active())
    }

    /// Whether `to` directly follows `from`
    pub fn are_adjacent(&self, from: &Tsv, to: &Tsv) -> bool {
        match (self.position(from), self.position(to)) {
            (Some(a), Some(b)) => b == a + 1,
            _ => false,
        }
    }

    /// Entries between two versions inclusive, oldest first, regardless of
    /// the order the two versions are given in.
    pub fn span(&self, a: &Tsv, b: &Tsv) -> Option<&[Arc<VersionEntry>]> {
        let (pa, pb) = (self.position(a)?, self.position(b)?);
        let (lo, hi) = if pa <= pb { (pa, pb) } else { (pb, pa) };
        Some(&self.entries[lo..=hi])
    }

    /// A new timeline with `entry` appended.
    ///
    /// The caller guarantees `entry` sorts after every existing entry.
    pub(crate) fn appended(&self, entry: Arc<VersionEntry>) -> Self {
        debug_assert!(self
            .entries
            .last()
            .map_or(true, |last| last.tsv().order_key() < entry.tsv().order_key()));
        let mut entries = Vec::with_capacity(self.entries.len() + 1);
        entries.extend(self.entries.iter().cloned());
        entries.push(entry);
        Self { entries }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::ContentHash;
    use crate::version::VersionStatus;

    fn timeline(stamps: &[i64]) -> VersionTimeline {
        let mut t = VersionTimeline::new();
        for (seq, ts) in stamps.iter().enumerate() {
            let entry = VersionEntry::new(
                Tsv::new(*ts, "/users", seq as u32),
                ContentHash::of_str(&ts.to_string()),
                None,
            );
            t = t.appended(Arc::new(entry));
        }
        t
    }

    #[test]
    fn test_at_picks_greatest_not_after() {
        let t = timeline(&[1_000, 2_000, 3_000]);
        assert_eq!(t.at(1_500).unwrap().timestamp(), 1_000);
        assert_eq!(t.at(2_000).unwrap().timestamp(), 2_000);
        assert_eq!(t.at(9_999).unwrap().timestamp(), 3_000);
        assert_eq!(t.at(10).unwrap().timestamp(), 1_000);
    }

    #[test]
    fn test_at_skips_deactivated() {
        let t = timeline(&[1_000, 2_000, 3_000]);
        t.entries()[1].set_status(VersionStatus::Deactivated);
        assert_eq!(t.at(2_500).unwrap().timestamp(), 1_000);

        t.entries()[0].set_status(VersionStatus::Deactivated);
        assert_eq!(t.at(2_500).unwrap().timestamp(), 3_000);

        t.entries()[2].set_status(VersionStatus::Deactivated);
        assert!(t.at(2_500).is_none());
    }

    #[test]
    fn test_adjacency_and_span() {
        let t = timeline(&[1_000, 2_000, 3_000]);
        let ids: Vec<Tsv> = t.entries().iter().map(|e| e.tsv().clone()).collect();
        assert!(t.are_adjacent(&ids[0], &ids[1]));
        assert!(!t.are_adjacent(&ids[1], &ids[0]));
        assert!(!t.are_adjacent(&ids[0], &ids[2]));
        assert_eq!(t.span(&ids[2], &ids[0]).unwrap().len(), 3);
    }

    #[test]
    fn test_appended_leaves_original_untouched() {
        let t = timeline(&[1_000]);
        let longer = t.appended(Arc::new(VersionEntry::new(
            Tsv::new(2_000, "/users", 1),
            ContentHash::of_str("b"),
            None,
        )));
        assert_eq!(t.len(), 1);
        assert_eq!(longer.len(), 2);
    }
}

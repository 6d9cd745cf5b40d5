//! Schema Diff Engine
//!
//! Compares two schema snapshots field by field, recursing into nested objects
//! and array items, and classifies every discrepancy as breaking or
//! non-breaking. The comparison is a pure function of its inputs, so results
//! are cached by the pair of content hashes.
//!
//! Renames are detected heuristically: a field removed and a field of the same
//! type added in the same object are reported as a rename. This can pair
//! unrelated fields that happen to share a type; it is an approximation, not
//! a rename detector. Renames declared with `x-renamed-from` are exact and
//! non-breaking.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use similar::TextDiff;

use crate::cache::LruCache;
use crate::checksum::ContentHash;
use crate::schema::{self, SchemaSnapshot, METADATA_KEYS};

/// Kind of schema change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// A field was added
    FieldAdded,
    /// A field was removed
    FieldRemoved,
    /// A field's type changed
    TypeChanged,
    /// A field was renamed (declared or inferred)
    FieldRenamed,
    /// A field moved between required and optional
    OptionalityChanged,
    /// Enum variant added
    EnumVariantAdded,
    /// Enum variant removed
    EnumVariantRemoved,
    /// Fields appear in a different order
    FieldsReordered,
    /// Documentation or annotations changed
    MetadataChanged,
}

/// One detected change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaChange {
    pub kind: ChangeKind,
    /// Dotted path of the field (e.g. "address.city", "items[].sku")
    pub path: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub breaking: bool,
    pub description: String,
}

impl SchemaChange {
    fn new(kind: ChangeKind, path: &str, breaking: bool, description: String) -> Self {
        Self {
            kind,
            path: path.to_string(),
            old_value: None,
            new_value: None,
            breaking,
            description,
        }
    }

    fn values(mut self, old: Option<String>, new: Option<String>) -> Self {
        self.old_value = old;
        self.new_value = new;
        self
    }
}

/// Classified difference between two schemas
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDiff {
    pub breaking_changes: Vec<SchemaChange>,
    pub non_breaking_changes: Vec<SchemaChange>,
    pub requires_transformer: bool,
}

impl SchemaDiff {
    fn from_changes(mut changes: Vec<SchemaChange>) -> Self {
        changes.sort_by(|a, b| a.path.cmp(&b.path).then(a.kind.cmp(&b.kind)));
        let (breaking_changes, non_breaking_changes): (Vec<_>, Vec<_>) =
            changes.into_iter().partition(|c| c.breaking);
        Self {
            requires_transformer: !breaking_changes.is_empty(),
            breaking_changes,
            non_breaking_changes,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.breaking_changes.is_empty() && self.non_breaking_changes.is_empty()
    }

    /// All changes, breaking ones first
    pub fn changes(&self) -> impl Iterator<Item = &SchemaChange> {
        self.breaking_changes.iter().chain(self.non_breaking_changes.iter())
    }

    pub fn summary(&self) -> String {
        if self.is_empty() {
            "No changes detected".to_string()
        } else if self.requires_transformer {
            format!(
                "{} breaking, {} compatible changes; transformer required",
                self.breaking_changes.len(),
                self.non_breaking_changes.len()
            )
        } else {
            format!("{} compatible changes", self.non_breaking_changes.len())
        }
    }
}

/// Compare two schemas
pub fn diff(old: &Value, new: &Value) -> SchemaDiff {
    let mut changes = Vec::new();
    diff_node(old, new, "", &mut changes);
    SchemaDiff::from_changes(changes)
}

fn child_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", parent, name)
    }
}

fn display_path(path: &str) -> &str {
    if path.is_empty() {
        "$"
    } else {
        path
    }
}

/// Compare two schema nodes at `path`
fn diff_node(old: &Value, new: &Value, path: &str, changes: &mut Vec<SchemaChange>) {
    let (old_type, new_type) = (schema::type_of(old), schema::type_of(new));
    if old_type != new_type {
        changes.push(
            SchemaChange::new(
                ChangeKind::TypeChanged,
                display_path(path),
                true,
                format!("Type of '{}' changed", display_path(path)),
            )
            .values(old_type, new_type),
        );
        // Nothing below a type change is comparable.
        return;
    }

    diff_metadata(old, new, path, changes);
    diff_enum(old, new, path, changes);

    // A side without `properties` declares no fields.
    let empty = Map::new();
    match (schema::properties(old), schema::properties(new)) {
        (None, None) => {}
        (old_props, new_props) => diff_properties(
            old,
            new,
            old_props.unwrap_or(&empty),
            new_props.unwrap_or(&empty),
            path,
            changes,
        ),
    }

    if let (Some(old_items), Some(new_items)) = (old.get("items"), new.get("items")) {
        diff_node(old_items, new_items, &format!("{}[]", path), changes);
    }
}

fn diff_metadata(old: &Value, new: &Value, path: &str, changes: &mut Vec<SchemaChange>) {
    for key in METADATA_KEYS {
        let (o, n) = (old.get(*key), new.get(*key));
        if o != n {
            changes.push(
                SchemaChange::new(
                    ChangeKind::MetadataChanged,
                    display_path(path),
                    false,
                    format!("'{}' of '{}' changed", key, display_path(path)),
                )
                .values(o.map(Value::to_string), n.map(Value::to_string)),
            );
        }
    }
}

fn diff_enum(old: &Value, new: &Value, path: &str, changes: &mut Vec<SchemaChange>) {
    let (Some(old_enum), Some(new_enum)) = (
        old.get("enum").and_then(Value::as_array),
        new.get("enum").and_then(Value::as_array),
    ) else {
        return;
    };

    for removed in old_enum.iter().filter(|v| !new_enum.contains(v)) {
        changes.push(
            SchemaChange::new(
                ChangeKind::EnumVariantRemoved,
                display_path(path),
                true,
                format!("Enum variant {} was removed", removed),
            )
            .values(Some(removed.to_string()), None),
        );
    }
    for added in new_enum.iter().filter(|v| !old_enum.contains(v)) {
        changes.push(
            SchemaChange::new(
                ChangeKind::EnumVariantAdded,
                display_path(path),
                false,
                format!("Enum variant {} was added", added),
            )
            .values(None, Some(added.to_string())),
        );
    }
}

fn diff_properties(
    old: &Value,
    new: &Value,
    old_props: &Map<String, Value>,
    new_props: &Map<String, Value>,
    path: &str,
    changes: &mut Vec<SchemaChange>,
) {
    let mut removed: Vec<&str> = old_props
        .keys()
        .filter(|k| !new_props.contains_key(*k))
        .map(String::as_str)
        .collect();
    let mut added: Vec<&str> = new_props
        .keys()
        .filter(|k| !old_props.contains_key(*k))
        .map(String::as_str)
        .collect();

    // Declared renames first, they are exact.
    let mut declared = Vec::new();
    for name in &added {
        if let Some(from) = schema::renamed_from(&new_props[*name]) {
            if removed.contains(&from) {
                declared.push((from, *name));
            }
        }
    }
    for (from, to) in declared {
        let old_field = &old_props[from];
        let new_field = &new_props[to];
        let compatible = schema::type_of(old_field) == schema::type_of(new_field);
        changes.push(
            SchemaChange::new(
                ChangeKind::FieldRenamed,
                &child_path(path, to),
                !compatible,
                format!("Field '{}' declared as rename of '{}'", to, from),
            )
            .values(Some(from.to_string()), Some(to.to_string())),
        );
        removed.retain(|n| *n != from);
        added.retain(|n| *n != to);
    }

    // Inferred renames: pair each removed field with the first added field of
    // the same type.
    let mut inferred = Vec::new();
    let mut taken: HashSet<&str> = HashSet::new();
    for from in &removed {
        let old_type = schema::type_of(&old_props[*from]);
        if let Some(to) = added
            .iter()
            .find(|to| !taken.contains(**to) && schema::type_of(&new_props[**to]) == old_type)
        {
            taken.insert(*to);
            inferred.push((*from, *to));
        }
    }
    for (from, to) in inferred {
        changes.push(
            SchemaChange::new(
                ChangeKind::FieldRenamed,
                &child_path(path, to),
                true,
                format!("Field '{}' appears to be renamed to '{}'", from, to),
            )
            .values(Some(from.to_string()), Some(to.to_string())),
        );
        removed.retain(|n| *n != from);
        added.retain(|n| *n != to);
    }

    for name in removed {
        let field = &old_props[name];
        let field_path = child_path(path, name);
        let harmless = !schema::is_required(old, name) && schema::is_unused(field);
        changes.push(
            SchemaChange::new(
                ChangeKind::FieldRemoved,
                &field_path,
                !harmless,
                if harmless {
                    format!("Unused optional field '{}' was removed", field_path)
                } else {
                    format!("Field '{}' was removed", field_path)
                },
            )
            .values(Some(field.to_string()), None),
        );
    }

    for name in added {
        let field = &new_props[name];
        let field_path = child_path(path, name);
        let required = schema::is_required(new, name);
        changes.push(
            SchemaChange::new(
                ChangeKind::FieldAdded,
                &field_path,
                required,
                if required {
                    format!("Required field '{}' was added", field_path)
                } else {
                    format!("Optional field '{}' was added", field_path)
                },
            )
            .values(None, Some(field.to_string())),
        );
    }

    let common: Vec<&str> = old_props
        .keys()
        .filter(|k| new_props.contains_key(*k))
        .map(String::as_str)
        .collect();

    for name in &common {
        let field_path = child_path(path, name);
        let (was_required, is_required) = (schema::is_required(old, name), schema::is_required(new, name));
        if was_required != is_required {
            changes.push(
                SchemaChange::new(
                    ChangeKind::OptionalityChanged,
                    &field_path,
                    is_required,
                    if is_required {
                        format!("Field '{}' became required", field_path)
                    } else {
                        format!("Field '{}' became optional", field_path)
                    },
                )
                .values(
                    Some(required_label(was_required).to_string()),
                    Some(required_label(is_required).to_string()),
                ),
            );
        }
        diff_node(&old_props[*name], &new_props[*name], &field_path, changes);
    }

    let new_order: Vec<&str> = new_props
        .keys()
        .filter(|k| old_props.contains_key(*k))
        .map(String::as_str)
        .collect();
    if common != new_order {
        changes.push(
            SchemaChange::new(
                ChangeKind::FieldsReordered,
                display_path(path),
                false,
                format!("Fields of '{}' were reordered", display_path(path)),
            )
            .values(Some(common.join(",")), Some(new_order.join(","))),
        );
    }
}

fn required_label(required: bool) -> &'static str {
    if required {
        "required"
    } else {
        "optional"
    }
}

/// Line diff of two schemas' pretty-printed JSON, for human review
pub fn render_text_diff(old: &Value, new: &Value) -> String {
    let old_text = serde_json::to_string_pretty(old).unwrap_or_default();
    let new_text = serde_json::to_string_pretty(new).unwrap_or_default();
    TextDiff::from_lines(&old_text, &new_text)
        .unified_diff()
        .header("old", "new")
        .to_string()
}

/// Diff engine with a cache keyed by `(old hash, new hash)`
pub struct SchemaDiffer {
    cache: Mutex<LruCache<(ContentHash, ContentHash), Arc<SchemaDiff>>>,
}

impl SchemaDiffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Diff two snapshots, reusing a cached result for identical content
    pub fn diff(&self, old: &SchemaSnapshot, new: &SchemaSnapshot) -> Arc<SchemaDiff> {
        let key = (old.hash(), new.hash());
        if let Some(hit) = self.cache.lock().get(&key) {
            return hit;
        }
        let result = Arc::new(diff(&old.content, &new.content));
        tracing::debug!(
            "Diffed {} {} -> {}: {}",
            new.name,
            key.0.short(),
            key.1.short(),
            result.summary()
        );
        self.cache.lock().insert(key, result.clone());
        result
    }

    /// `(hits, misses)` of the cache
    pub fn cache_stats(&self) -> (u64, u64) {
        self.cache.lock().stats()
    }
}

impl Default for SchemaDiffer {
    fn default() -> Self {
        Self::new(256)
    }
}

//! Draft-diff tracking for update mutators.
//!
//! A mutator edits a [`Draft`], a mutable shadow copy of a baseline record.
//! Once the mutator returns, the shadow is compared with the baseline field
//! by field and only the top-level fields that differ are reported. The
//! baseline itself is never touched.
//!
//! Granularity is the top-level field: editing `tags[0]` reports the whole
//! `tags` field. Removing a field reports it as `null`, since merges apply
//! changes by overwriting fields.

use crate::Record;
use serde_json::Value;
use std::ops::{Deref, DerefMut};

/// Writable view over a baseline record.
///
/// Dereferences to the shadow [`Record`], so the full `serde_json::Map` API
/// is available. Reads observe earlier writes made through the same draft.
#[derive(Debug, Clone)]
pub struct Draft<'a> {
    baseline: &'a Record,
    shadow: Record,
}

impl<'a> Draft<'a> {
    /// Seed a draft from `baseline`.
    pub fn new(baseline: &'a Record) -> Self {
        Self {
            baseline,
            shadow: baseline.clone(),
        }
    }

    /// Set a top-level field.
    pub fn set(&mut self, field: impl Into<String>, value: impl Into<Value>) {
        self.shadow.insert(field.into(), value.into());
    }

    /// The record this draft was seeded from.
    pub fn baseline(&self) -> &Record {
        self.baseline
    }

    /// Top-level fields that differ from the baseline.
    pub fn changes(&self) -> Record {
        let mut changes = Record::new();
        for (field, value) in &self.shadow {
            if self.baseline.get(field) != Some(value) {
                changes.insert(field.clone(), value.clone());
            }
        }
        for field in self.baseline.keys() {
            if !self.shadow.contains_key(field) {
                changes.insert(field.clone(), Value::Null);
            }
        }
        changes
    }

    /// Whether any field differs from the baseline.
    pub fn is_modified(&self) -> bool {
        !self.changes().is_empty()
    }
}

impl Deref for Draft<'_> {
    type Target = Record;

    fn deref(&self) -> &Record {
        &self.shadow
    }
}

impl DerefMut for Draft<'_> {
    fn deref_mut(&mut self) -> &mut Record {
        &mut self.shadow
    }
}

/// Run `mutator` against a draft of `baseline` and return the changed fields.
pub fn track_single<F>(baseline: &Record, mutator: F) -> Record
where
    F: FnOnce(&mut Draft<'_>),
{
    let mut draft = Draft::new(baseline);
    mutator(&mut draft);
    draft.changes()
}

/// Run one `mutator` over drafts of every baseline, in order.
///
/// Returns one entry per baseline; `None` where the mutator left the draft
/// unchanged.
pub fn track_many<F>(baselines: &[Record], mutator: F) -> Vec<Option<Record>>
where
    F: FnOnce(&mut [Draft<'_>]),
{
    let mut drafts: Vec<Draft<'_>> = baselines.iter().map(Draft::new).collect();
    mutator(&mut drafts);
    drafts
        .iter()
        .map(|draft| {
            let changes = draft.changes();
            (!changes.is_empty()).then_some(changes)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    #[test]
    fn reports_only_changed_fields() {
        let baseline = record(json!({"text": "Buy milk", "completed": false}));
        let changes = track_single(&baseline, |d| d.set("completed", true));

        assert_eq!(Value::Object(changes), json!({"completed": true}));
        assert_eq!(baseline["completed"], json!(false));
    }

    #[test]
    fn unchanged_mutator_yields_empty_diff() {
        let baseline = record(json!({"text": "Buy milk"}));
        assert!(track_single(&baseline, |_| {}).is_empty());

        // writing the same value is not a change
        assert!(track_single(&baseline, |d| d.set("text", "Buy milk")).is_empty());
    }

    #[test]
    fn reads_observe_prior_writes() {
        let baseline = record(json!({"count": 1}));
        let changes = track_single(&baseline, |d| {
            d.set("count", 2);
            let current = d["count"].as_i64().unwrap_or_default();
            d.set("count", current + 10);
        });

        assert_eq!(Value::Object(changes), json!({"count": 12}));
    }

    #[test]
    fn nested_edit_replaces_top_level_field() {
        let baseline = record(json!({"tags": ["a", "b"], "meta": {"x": 1, "y": 2}}));
        let changes = track_single(&baseline, |d| {
            if let Some(Value::Object(meta)) = d.get_mut("meta") {
                meta.insert("x".into(), json!(5));
            }
        });

        assert_eq!(
            Value::Object(changes),
            json!({"meta": {"x": 5, "y": 2}})
        );
    }

    #[test]
    fn removed_field_reported_as_null() {
        let baseline = record(json!({"text": "a", "note": "b"}));
        let changes = track_single(&baseline, |d| {
            d.remove("note");
        });

        assert_eq!(Value::Object(changes), json!({"note": null}));
    }

    #[test]
    fn draft_exposes_baseline() {
        let baseline = record(json!({"text": "a"}));
        let mut draft = Draft::new(&baseline);
        draft.set("text", "b");

        assert_eq!(draft.baseline()["text"], json!("a"));
        assert_eq!(draft["text"], json!("b"));
        assert!(draft.is_modified());
    }

    #[test]
    fn track_many_keeps_order_and_skips_untouched() {
        let baselines = vec![
            record(json!({"completed": false})),
            record(json!({"completed": true})),
            record(json!({"completed": false})),
        ];

        let diffs = track_many(&baselines, |drafts| {
            for draft in drafts.iter_mut() {
                draft.set("completed", true);
            }
        });

        assert_eq!(diffs.len(), 3);
        assert_eq!(diffs[0], Some(record(json!({"completed": true}))));
        assert_eq!(diffs[1], None);
        assert_eq!(diffs[2], Some(record(json!({"completed": true}))));
    }
}

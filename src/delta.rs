use std::collections::BTreeSet;

use serde_json::{Map, Value};
use tracing::warn;

use crate::config::RunConfig;
use crate::model::{ChangeKind, ChangeSet, FieldChange, Fields, Snapshot, Tier};
use crate::significance::{PathPattern, RuleError, RuleSet};

#[derive(Debug, Clone, Default)]
pub struct DeltaCalculator {
    rules: RuleSet,
    order_insensitive: Vec<PathPattern>,
    container_markers: bool,
}

impl DeltaCalculator {
    pub fn new(rules: RuleSet) -> Self {
        Self {
            rules,
            ..Default::default()
        }
    }

    pub fn from_config(run: &RunConfig) -> Result<Self, RuleError> {
        let rules = RuleSet::compile(&run.significance_rules)?;
        let order_insensitive = run
            .order_insensitive_fields
            .iter()
            .map(|p| PathPattern::compile(p))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            rules,
            order_insensitive,
            container_markers: run.emit_container_markers,
        })
    }

    /// Compare lists at matching paths as multisets.
    pub fn with_order_insensitive(mut self, patterns: Vec<PathPattern>) -> Self {
        self.order_insensitive = patterns;
        self
    }

    /// Emit an `UnchangedContainer` record ahead of changes nested in an object.
    pub fn with_container_markers(mut self, on: bool) -> Self {
        self.container_markers = on;
        self
    }

    pub fn diff(&self, previous: Option<&Snapshot>, new: &Snapshot) -> ChangeSet {
        if let Some(prev) = previous {
            if prev.entity_id != new.entity_id {
                warn!(
                    previous = %prev.entity_id,
                    new = %new.entity_id,
                    "diffing snapshots of different entities"
                );
            }
        }

        let empty = Map::new();
        let before = previous.map_or(&empty, |p| &p.fields);
        let mut changes = Vec::new();
        self.walk("", before, &new.fields, &mut changes);
        self.rules.apply(new.kind, &mut changes);

        ChangeSet {
            entity_id: new.entity_id.clone(),
            kind: new.kind,
            run_id: new.run_id.clone(),
            previous_collected_at: previous.map(|p| p.collected_at),
            collected_at: new.collected_at,
            baseline: previous.is_none(),
            changes,
        }
    }

    fn walk(&self, prefix: &str, before: &Fields, after: &Fields, out: &mut Vec<FieldChange>) {
        let keys: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
        for key in keys {
            let path = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{prefix}.{key}")
            };
            match (before.get(key), after.get(key)) {
                (None, Some(new)) => out.push(change(path, None, Some(new), ChangeKind::Added)),
                (Some(old), None) => out.push(change(path, Some(old), None, ChangeKind::Removed)),
                (Some(Value::Object(old)), Some(Value::Object(new))) => {
                    let mut nested = Vec::new();
                    self.walk(&path, old, new, &mut nested);
                    if self.container_markers && !nested.is_empty() {
                        out.push(change(path, None, None, ChangeKind::UnchangedContainer));
                    }
                    out.extend(nested);
                }
                (Some(old), Some(new)) => {
                    if !self.values_equal(&path, old, new) {
                        out.push(change(path, Some(old), Some(new), ChangeKind::Modified));
                    }
                }
                (None, None) => {}
            }
        }
    }

    fn values_equal(&self, path: &str, a: &Value, b: &Value) -> bool {
        match (a, b) {
            (Value::Number(x), Value::Number(y)) => numbers_equal(x, y),
            (Value::Array(xs), Value::Array(ys)) => {
                if xs.len() != ys.len() {
                    return false;
                }
                if self.order_insensitive.iter().any(|p| p.matches(path)) {
                    multiset_equal(xs, ys)
                } else {
                    xs.iter().zip(ys).all(|(x, y)| self.values_equal(path, x, y))
                }
            }
            (Value::Object(xs), Value::Object(ys)) => {
                xs.len() == ys.len()
                    && xs
                        .iter()
                        .all(|(k, x)| ys.get(k).is_some_and(|y| self.values_equal(path, x, y)))
            }
            _ => a == b,
        }
    }
}

fn change(path: String, previous: Option<&Value>, new: Option<&Value>, kind: ChangeKind) -> FieldChange {
    FieldChange {
        path,
        previous: previous.cloned(),
        new: new.cloned(),
        kind,
        tier: Tier::Minor,
    }
}

/// Exact numeric equality; integers compare as integers, anything involving a
/// float compares the f64 values without epsilon.
fn numbers_equal(x: &serde_json::Number, y: &serde_json::Number) -> bool {
    if let (Some(a), Some(b)) = (x.as_i64(), y.as_i64()) {
        return a == b;
    }
    if let (Some(a), Some(b)) = (x.as_u64(), y.as_u64()) {
        return a == b;
    }
    match (x.as_f64(), y.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

fn multiset_equal(xs: &[Value], ys: &[Value]) -> bool {
    let canonical = |items: &[Value]| {
        let mut keys: Vec<String> = items.iter().map(Value::to_string).collect();
        keys.sort_unstable();
        keys
    };
    canonical(xs) == canonical(ys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntityKind;
    use crate::significance::{SignificanceRule, ValuePredicate};
    use chrono::{Duration, Utc};
    use serde_json::json;

    fn snap(fields: Value) -> Snapshot {
        let Value::Object(fields) = fields else {
            panic!("fields must be an object")
        };
        Snapshot {
            entity_id: "UC1".into(),
            kind: EntityKind::Channel,
            parent_id: None,
            run_id: "run-1".into(),
            fields,
            collected_at: Utc::now(),
        }
    }

    #[test]
    fn identical_snapshots_produce_no_changes() {
        let a = snap(json!({
            "snippet": {"title": "x", "tags": ["a", "b"]},
            "statistics": {"viewCount": 10},
            "flag": true
        }));
        let cs = DeltaCalculator::default().diff(Some(&a), &a);
        assert!(cs.is_empty());
        assert!(!cs.baseline);
    }

    #[test]
    fn single_top_level_difference_yields_one_change() {
        let a = snap(json!({"a": 1, "b": "x", "c": [1, 2]}));
        let mut b = a.clone();
        b.fields.insert("b".into(), json!("y"));
        let cs = DeltaCalculator::default().diff(Some(&a), &b);
        assert_eq!(cs.changes.len(), 1);
        assert_eq!(cs.changes[0].path, "b");
        assert_eq!(cs.changes[0].kind, ChangeKind::Modified);
    }

    #[test]
    fn added_removed_modified_nested() {
        let a = snap(json!({"snippet": {"title": "old", "gone": 1}, "x": 1}));
        let b = snap(json!({"snippet": {"title": "new", "fresh": 2}, "x": 1}));
        let cs = DeltaCalculator::default().diff(Some(&a), &b);
        let summary: Vec<(&str, ChangeKind)> =
            cs.changes.iter().map(|c| (c.path.as_str(), c.kind)).collect();
        assert_eq!(
            summary,
            vec![
                ("snippet.fresh", ChangeKind::Added),
                ("snippet.gone", ChangeKind::Removed),
                ("snippet.title", ChangeKind::Modified),
            ]
        );
        assert_eq!(cs.changes[1].previous, Some(json!(1)));
        assert_eq!(cs.changes[1].new, None);
    }

    #[test]
    fn baseline_reports_every_field_added() {
        let b = snap(json!({"views": 100, "snippet": {"title": "t"}}));
        let cs = DeltaCalculator::default().diff(None, &b);
        assert!(cs.baseline);
        assert_eq!(cs.previous_collected_at, None);
        assert_eq!(cs.changes.len(), 2);
        assert!(cs.changes.iter().all(|c| c.kind == ChangeKind::Added));
    }

    #[test]
    fn numbers_compare_exactly() {
        let a = snap(json!({"n": 100, "f": 0.1}));
        let b = snap(json!({"n": 100.0, "f": 0.1000001}));
        let cs = DeltaCalculator::default().diff(Some(&a), &b);
        assert_eq!(cs.changes.len(), 1);
        assert_eq!(cs.changes[0].path, "f");
    }

    #[test]
    fn list_order_matters_unless_configured() {
        let a = snap(json!({"snippet": {"tags": ["a", "b", "b"]}}));
        let b = snap(json!({"snippet": {"tags": ["b", "a", "b"]}}));
        let sensitive = DeltaCalculator::default().diff(Some(&a), &b);
        assert_eq!(sensitive.changes.len(), 1);
        assert_eq!(sensitive.changes[0].new, Some(json!(["b", "a", "b"])));

        let calc = DeltaCalculator::default()
            .with_order_insensitive(vec![PathPattern::compile("snippet.tags").unwrap()]);
        assert!(calc.diff(Some(&a), &b).is_empty());

        let c = snap(json!({"snippet": {"tags": ["a", "a", "b"]}}));
        let changed = calc.diff(Some(&a), &c);
        assert_eq!(changed.changes.len(), 1);
        assert_eq!(changed.changes[0].new, Some(json!(["a", "a", "b"])));
    }

    #[test]
    fn object_replaced_by_scalar_is_modified() {
        let a = snap(json!({"thumb": {"url": "u"}}));
        let b = snap(json!({"thumb": null}));
        let cs = DeltaCalculator::default().diff(Some(&a), &b);
        assert_eq!(cs.changes.len(), 1);
        assert_eq!(cs.changes[0].kind, ChangeKind::Modified);
        assert_eq!(cs.changes[0].path, "thumb");
    }

    #[test]
    fn container_markers_precede_nested_changes() {
        let a = snap(json!({"snippet": {"title": "a", "same": 1}}));
        let b = snap(json!({"snippet": {"title": "b", "same": 1}}));
        let calc = DeltaCalculator::default().with_container_markers(true);
        let cs = calc.diff(Some(&a), &b);
        assert_eq!(cs.changes.len(), 2);
        assert_eq!(cs.changes[0].kind, ChangeKind::UnchangedContainer);
        assert_eq!(cs.changes[0].path, "snippet");
        assert_eq!(cs.changes[1].path, "snippet.title");

        assert!(calc.diff(Some(&a), &a).is_empty());
    }

    #[test]
    fn tiers_come_from_rules() {
        let rules = RuleSet::compile(&[SignificanceRule {
            path: "views".into(),
            entity: Some(EntityKind::Channel),
            kinds: vec![ChangeKind::Modified],
            when: Some(ValuePredicate::PercentChangeOver(30.0)),
            tier: Tier::Significant,
        }])
        .unwrap();
        let mut a = snap(json!({"views": 100}));
        a.collected_at = Utc::now() - Duration::hours(1);
        let b = snap(json!({"views": 140}));
        let cs = DeltaCalculator::new(rules).diff(Some(&a), &b);
        assert_eq!(cs.changes.len(), 1);
        assert_eq!(cs.changes[0].previous, Some(json!(100)));
        assert_eq!(cs.changes[0].new, Some(json!(140)));
        assert_eq!(cs.changes[0].tier, Tier::Significant);
        assert_eq!(cs.previous_collected_at, Some(a.collected_at));
    }
}

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};

/// Edit action of a single diff line
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum DiffAction {
    /// The field appeared
    Add,
    /// The field changed value
    Change,
    /// The field disappeared
    Remove,
}

/// One structured edit: action, path, old value, new value
#[derive(Clone, Debug)]
pub(crate) struct DiffLine {
    /// What happened to the field
    pub(crate) action: DiffAction,
    /// Path components down to the field
    pub(crate) path: Vec<String>,
    /// Value before the edit, absent for additions
    pub(crate) old: Option<Value>,
    /// Value after the edit, absent for removals
    pub(crate) new: Option<Value>,
}

impl DiffLine {
    /// Decode the old value
    pub(crate) fn old_as<T: DeserializeOwned>(&self) -> Option<T> {
        self.old
            .clone()
            .and_then(|value| serde_json::from_value(value).ok())
    }

    /// Decode the new value
    pub(crate) fn new_as<T: DeserializeOwned>(&self) -> Option<T> {
        self.new
            .clone()
            .and_then(|value| serde_json::from_value(value).ok())
    }
}

/// Ordered list of structured edits between two revisions of one object
#[derive(Clone, Debug, Default)]
pub(crate) struct Diff {
    /// Diff lines in traversal order
    lines: Vec<DiffLine>,
}

impl Diff {
    /// Structured diff between two revisions of the same object
    pub(crate) fn between<K: Serialize>(old: &K, new: &K) -> Self {
        let old = serde_json::to_value(old).unwrap_or(Value::Null);
        let new = serde_json::to_value(new).unwrap_or(Value::Null);
        let mut lines = Vec::new();
        Self::walk(
            &mut lines,
            &mut Vec::new(),
            &Self::comparable(&old),
            &Self::comparable(&new),
        );
        Self { lines }
    }

    /// First line matching one of `actions` at exactly `path`
    pub(crate) fn find(&self, actions: &[DiffAction], path: &[&str]) -> Option<&DiffLine> {
        self.lines
            .iter()
            .find(|line| actions.contains(&line.action) && line.path == path)
    }

    /// Whether the two revisions are equal on all user-meaningful fields
    pub(crate) fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Reduce an object to the fields whose edits are user-meaningful. The
    /// controller's own status and finalizer writes must not re-trigger
    /// handlers.
    fn comparable(object: &Value) -> Value {
        let mut out = Map::new();
        if let Some(labels) = object.pointer("/metadata/labels") {
            let _ = out.insert(
                "metadata".to_owned(),
                serde_json::json!({ "labels": labels }),
            );
        }
        if let Some(spec) = object.get("spec") {
            let _ = out.insert("spec".to_owned(), spec.clone());
        }
        Value::Object(out)
    }

    /// Recurse over maps; arrays and scalars compare atomically so that a
    /// membership edit surfaces as one change line carrying both whole lists
    fn walk(lines: &mut Vec<DiffLine>, path: &mut Vec<String>, old: &Value, new: &Value) {
        match (old, new) {
            (Value::Object(old_map), Value::Object(new_map)) => {
                for (key, old_value) in old_map {
                    path.push(key.clone());
                    match new_map.get(key) {
                        Some(new_value) => Self::walk(lines, path, old_value, new_value),
                        None => lines.push(DiffLine {
                            action: DiffAction::Remove,
                            path: path.clone(),
                            old: Some(old_value.clone()),
                            new: None,
                        }),
                    }
                    let _ = path.pop();
                }
                for (key, new_value) in new_map {
                    if !old_map.contains_key(key) {
                        path.push(key.clone());
                        lines.push(DiffLine {
                            action: DiffAction::Add,
                            path: path.clone(),
                            old: None,
                            new: Some(new_value.clone()),
                        });
                        let _ = path.pop();
                    }
                }
            }
            _ if old != new => lines.push(DiffLine {
                action: DiffAction::Change,
                path: path.clone(),
                old: Some(old.clone()),
                new: Some(new.clone()),
            }),
            _ => {}
        }
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::{Diff, DiffAction};

    #[test]
    fn test_change_on_scalar() {
        let old = json!({"spec": {"artifact": "a.tar.gz", "image": "m:1"}});
        let new = json!({"spec": {"artifact": "b.tar.gz", "image": "m:1"}});
        let diff = Diff::between(&old, &new);
        let line = diff
            .find(&[DiffAction::Change], &["spec", "artifact"])
            .unwrap();
        assert_eq!(line.old, Some(json!("a.tar.gz")));
        assert_eq!(line.new, Some(json!("b.tar.gz")));
        assert!(diff.find(&[DiffAction::Change], &["spec", "image"]).is_none());
    }

    #[test]
    fn test_add_and_remove() {
        let old = json!({"spec": {"command": ["serve"]}});
        let new = json!({"spec": {"args": ["--fast"]}});
        let diff = Diff::between(&old, &new);
        assert!(diff.find(&[DiffAction::Remove], &["spec", "command"]).is_some());
        assert!(diff.find(&[DiffAction::Add], &["spec", "args"]).is_some());
        // an add also matches a lookup over several actions
        assert!(diff
            .find(&[DiffAction::Add, DiffAction::Change], &["spec", "args"])
            .is_some());
    }

    #[test]
    fn test_lists_compare_atomically() {
        let old = json!({"spec": {"models": [{"model": "a", "weight": 100}]}});
        let new = json!({"spec": {"models": [{"model": "b", "weight": 100}]}});
        let diff = Diff::between(&old, &new);
        let line = diff.find(&[DiffAction::Change], &["spec", "models"]).unwrap();
        assert_eq!(line.old, Some(json!([{"model": "a", "weight": 100}])));
        assert_eq!(line.new, Some(json!([{"model": "b", "weight": 100}])));
    }

    #[test]
    fn test_volatile_fields_are_stripped() {
        let old = json!({
            "metadata": {"name": "m", "resourceVersion": "1", "finalizers": []},
            "spec": {"image": "m:1"},
            "status": {"state": "creating"}
        });
        let new = json!({
            "metadata": {"name": "m", "resourceVersion": "2", "finalizers": ["t"]},
            "spec": {"image": "m:1"},
            "status": {"state": "available"}
        });
        assert!(Diff::between(&old, &new).is_empty());
    }

    #[test]
    fn test_label_edits_are_visible() {
        let old = json!({"metadata": {"labels": {"model": "a"}}, "spec": {}});
        let new = json!({"metadata": {"labels": {"model": "b"}}, "spec": {}});
        let diff = Diff::between(&old, &new);
        assert!(diff
            .find(&[DiffAction::Change], &["metadata", "labels", "model"])
            .is_some());
    }
}

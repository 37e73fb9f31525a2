// Dotted-path mutation of the user_state tree
//
// State updates address nested keys as "survey.answers.q1". Assignment
// replaces the value at the path outright; there is no recursive merging.
// Intermediate containers are created as needed, and a non-object in the
// middle of a path is replaced by an object.

use serde_json::{Map, Value};

/// Reject paths that would escape the state tree or smuggle operators into
/// the storage layer: `$` anywhere, or a leading / trailing dot.
pub fn validate_path(path: &str) -> Result<(), String> {
    if path.is_empty() {
        return Err("state path must not be empty".to_string());
    }
    if path.contains('$') {
        return Err(format!("state path '{path}' must not contain '$'"));
    }
    if path.starts_with('.') || path.ends_with('.') {
        return Err(format!(
            "state path '{path}' must not start or end with '.'"
        ));
    }
    Ok(())
}

/// Set `state[path] = value`, creating intermediate objects along the way.
pub fn set_path(state: &mut Map<String, Value>, path: &str, value: Value) {
    let mut segments = path.split('.').peekable();
    let mut current = state;

    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            current.insert(segment.to_string(), value);
            return;
        }

        let slot = current
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        current = slot.as_object_mut().expect("slot was just made an object");
    }
}

/// Read the value at a dotted path, if present.
pub fn get_path<'a>(state: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut segments = path.split('.');
    let first = segments.next()?;
    let mut current = state.get(first)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn sets_top_level_and_nested_keys() {
        let mut state = Map::new();
        set_path(&mut state, "score", json!(10));
        set_path(&mut state, "survey.q1", json!("yes"));
        set_path(&mut state, "survey.q2", json!(false));

        assert_eq!(state["score"], json!(10));
        assert_eq!(state["survey"], json!({ "q1": "yes", "q2": false }));
    }

    #[test]
    fn assignment_replaces_without_merging() {
        let mut state = Map::new();
        set_path(&mut state, "survey", json!({ "q1": "yes" }));
        set_path(&mut state, "survey", json!({ "q2": "no" }));
        assert_eq!(state["survey"], json!({ "q2": "no" }));
    }

    #[test]
    fn scalar_in_the_middle_of_a_path_becomes_an_object() {
        let mut state = Map::new();
        set_path(&mut state, "a", json!(1));
        set_path(&mut state, "a.b", json!(2));
        assert_eq!(state["a"], json!({ "b": 2 }));
    }

    #[test]
    fn rejects_reserved_characters() {
        assert!(validate_path("$set").is_err());
        assert!(validate_path("a.$b").is_err());
        assert!(validate_path(".leading").is_err());
        assert!(validate_path("trailing.").is_err());
        assert!(validate_path("").is_err());
        assert!(validate_path("plain.path").is_ok());
    }

    #[test]
    fn reads_back_nested_values() {
        let mut state = Map::new();
        set_path(&mut state, "a.b.c", json!(3));
        assert_eq!(get_path(&state, "a.b.c"), Some(&json!(3)));
        assert_eq!(get_path(&state, "a.b.missing"), None);
        assert_eq!(get_path(&state, "a.b.c.too_deep"), None);
    }
}

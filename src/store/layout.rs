//! Key layout of the job tree inside the coordination store.
//!
//! ```text
//! meta/task/<definition-path>/:taskdef     task definition
//! task/<instance-path>/:task               task instance
//! status/run/<instance-path>/:task/<field> run-state record fields
//! config/run                               global var overrides
//! ```
//!
//! Segments starting with `:` are tags: they mark records, never children.

/// Directory holding task instances.
pub const TASK_DIR: &str = "task";
/// Directory holding task definitions.
pub const TASKDEF_DIR: &str = "meta/task";
/// Directory holding run-state records.
pub const TASKSTATE_DIR: &str = "status/run";
/// Tag of a task instance record.
pub const TASK: &str = ":task";
/// Tag of a task definition record.
pub const TASKDEF: &str = ":taskdef";
/// Tag of a run-state record.
pub const TASKSTATE: &str = ":task";
/// Key of the global run configuration.
pub const RUN_CONFIG: &str = "config/run";

/// Normalizes a slash-separated path: drops empty segments and outer slashes.
pub fn normalize(path: &str) -> String {
    path.split('/')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Joins two path fragments with exactly one separator.
pub fn join(base: &str, rest: &str) -> String {
    match (base.is_empty(), rest.is_empty()) {
        (true, _) => normalize(rest),
        (_, true) => normalize(base),
        _ => normalize(&format!("{base}/{rest}")),
    }
}

/// True if the segment is a tag (`:task`, `:taskdef`, ...).
pub fn is_tag(segment: &str) -> bool {
    segment.starts_with(':')
}

/// Splits a path into its parent and last segment.
pub fn split_last(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(i) => (&path[..i], &path[i + 1..]),
        None => ("", path),
    }
}

/// `task/<path>`
pub fn task_dir(path: &str) -> String {
    join(TASK_DIR, path)
}

/// `task/<path>/:task`
pub fn task_key(path: &str) -> String {
    format!("{}/{TASK}", task_dir(path))
}

/// `meta/task/<def>/:taskdef`
pub fn taskdef_key(def: &str) -> String {
    format!("{}/{TASKDEF}", join(TASKDEF_DIR, def))
}

/// `status/run/<path>/:task`
pub fn state_dir(path: &str) -> String {
    format!("{}/{TASKSTATE}", join(TASKSTATE_DIR, path))
}

/// `status/run/<path>/:task/<field>`
pub fn state_key(path: &str, field: &str) -> String {
    format!("{}/{field}", state_dir(path))
}

/// Strips `task/` and `/:task` from an instance key, returning the instance path.
pub fn instance_path(key: &str) -> Option<&str> {
    key.strip_prefix(TASK_DIR)?
        .strip_prefix('/')?
        .strip_suffix(TASK)?
        .strip_suffix('/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_follow_the_tree_layout() {
        assert_eq!(task_key("home/heat"), "task/home/heat/:task");
        assert_eq!(taskdef_key("test/sleep"), "meta/task/test/sleep/:taskdef");
        assert_eq!(
            state_key("home/heat", "running"),
            "status/run/home/heat/:task/running"
        );
    }

    #[test]
    fn normalize_collapses_slashes() {
        assert_eq!(normalize("/a//b/"), "a/b");
        assert_eq!(join("a/", "/b"), "a/b");
        assert_eq!(join("", "b"), "b");
    }

    #[test]
    fn instance_path_round_trips() {
        assert_eq!(instance_path(&task_key("x/y")), Some("x/y"));
        assert_eq!(instance_path("task/x/y/data"), None);
    }

    #[test]
    fn split_last_handles_top_level() {
        assert_eq!(split_last("a/b/c"), ("a/b", "c"));
        assert_eq!(split_last("c"), ("", "c"));
    }
}

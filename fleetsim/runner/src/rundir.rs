//! Per-run output directory: `{base}/{timestamp}/` holding `logs/`, the
//! scenario copy, and the final reports. Nanosecond timestamps keep
//! back-to-back runs from colliding.

use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    io::{self, Write as _},
    path::{Path, PathBuf},
    sync::Mutex,
    time::SystemTime,
};

use fleetsim_configs::Scenario;

const LOGS_DIR: &str = "logs";
const SCENARIO_FILE: &str = "scenario.yaml";

/// Handle over one run's output tree. Log files stay open for appending
/// and are synced and closed in aggregate by [`RunDirectory::finalize`].
pub struct RunDirectory {
    root: PathBuf,
    logs: PathBuf,
    open_logs: Mutex<HashMap<String, File>>,
}

impl RunDirectory {
    /// Creates `{base}/{rfc3339-nanos}/logs/` and drops a copy of the
    /// scenario next to it.
    pub fn create(base: &Path, scenario: &Scenario, started: SystemTime) -> io::Result<Self> {
        let stamp = humantime::format_rfc3339_nanos(started)
            .to_string()
            .replace(':', "-");
        let root = base.join(stamp);
        let logs = root.join(LOGS_DIR);
        fs::create_dir_all(&logs)?;

        let rendered = scenario.to_yaml().map_err(io::Error::other)?;
        fs::write(root.join(SCENARIO_FILE), rendered)?;

        Ok(Self {
            root,
            logs,
            open_logs: Mutex::new(HashMap::new()),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn report_path(&self, file_name: &str) -> PathBuf {
        self.root.join(file_name)
    }

    /// Appends one line to the node's log file, opening it on first use.
    pub fn append_log(&self, node_id: &str, line: &str) -> io::Result<()> {
        let mut open_logs = self.open_logs.lock().expect("log handles poisoned");
        if !open_logs.contains_key(node_id) {
            let path = self.logs.join(format!("{}.log", sanitize_node_id(node_id)));
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            open_logs.insert(node_id.to_owned(), file);
        }
        let file = open_logs
            .get_mut(node_id)
            .expect("log handle inserted above");
        writeln!(file, "{line}")
    }

    /// Syncs and closes every open log handle, joining the errors so one
    /// bad handle does not hide the rest.
    pub fn finalize(&self) -> io::Result<()> {
        let mut open_logs = self.open_logs.lock().expect("log handles poisoned");
        let mut errors = Vec::new();
        for (node_id, file) in open_logs.drain() {
            if let Err(error) = file.sync_all() {
                errors.push(format!("{node_id}: {error}"));
            }
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(io::Error::other(errors.join("; ")))
        }
    }
}

/// Node ids become file names; path-walking characters are flattened.
fn sanitize_node_id(id: &str) -> String {
    id.replace("..", "_").replace(['/', '\\'], "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_scenario() -> Scenario {
        Scenario::from_yaml_str("name: t\nfleet:\n  - id: n1\n    gpu_count: 8\n")
            .expect("valid scenario")
    }

    #[test]
    fn creates_layout_and_scenario_copy() {
        let base = tempfile::tempdir().expect("tempdir");
        let dir = RunDirectory::create(base.path(), &minimal_scenario(), SystemTime::now())
            .expect("creates");
        assert!(dir.root().join(SCENARIO_FILE).is_file());
        assert!(dir.root().join(LOGS_DIR).is_dir());
    }

    #[test]
    fn consecutive_runs_get_distinct_directories() {
        let base = tempfile::tempdir().expect("tempdir");
        let scenario = minimal_scenario();
        let first = RunDirectory::create(base.path(), &scenario, SystemTime::now()).expect("one");
        let second = RunDirectory::create(base.path(), &scenario, SystemTime::now()).expect("two");
        assert_ne!(first.root(), second.root());
    }

    #[test]
    fn node_logs_append_and_finalize() {
        let base = tempfile::tempdir().expect("tempdir");
        let dir = RunDirectory::create(base.path(), &minimal_scenario(), SystemTime::now())
            .expect("creates");
        dir.append_log("gcp-us-central1-h100-0001", "started").expect("writes");
        dir.append_log("gcp-us-central1-h100-0001", "xid 79").expect("writes");
        dir.finalize().expect("finalizes");

        let contents = fs::read_to_string(
            dir.root().join(LOGS_DIR).join("gcp-us-central1-h100-0001.log"),
        )
        .expect("reads");
        assert_eq!(contents, "started\nxid 79\n");
    }

    #[test]
    fn hostile_node_ids_cannot_escape_the_tree() {
        assert_eq!(sanitize_node_id("../../etc/passwd"), "____etc_passwd");
        assert_eq!(sanitize_node_id("a/b\\c"), "a_b_c");
        assert_eq!(sanitize_node_id("plain-id"), "plain-id");
    }
}

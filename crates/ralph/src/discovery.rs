//! Discovery (§4.2): walks a tasks root, parses `---`-delimited YAML frontmatter out
//! of each `IMPLEMENTATION_PLAN.md` and `[0-9][0-9]-*.md` file, and returns the
//! validated unit list plus dependency graph.
//!
//! The frontmatter splitter itself follows the line-scanning style used elsewhere in
//! the corpus for Markdown-with-frontmatter (first line must be a bare `---`, second
//! `---` ends the block); unlike that flat `HashMap<String,String>` version, the
//! block here is handed to `serde_yaml` so `depends_on: [a, b]`-style typed fields
//! deserialize directly into the plan/task structs.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use ralph_types::{BaselineCheck, Task, TaskStatus, Unit, UnitRuntimeState};
use serde::Deserialize;

use crate::error::OrchestratorError;
use crate::graph::DependencyGraph;

/// Split a file's contents into its parsed frontmatter block and the remaining body.
/// Returns `None` if the file does not open with a `---` delimiter.
fn split_frontmatter(raw: &str) -> Option<(&str, &str)> {
    let rest = raw.strip_prefix("---")?;
    let rest = rest.strip_prefix('\n').unwrap_or(rest);
    let end = rest.find("\n---")?;
    let frontmatter = &rest[..end];
    let after = &rest[end + 4..];
    let body = after.strip_prefix('\n').unwrap_or(after);
    Some((frontmatter, body))
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct PlanFrontmatter {
    unit: Option<String>,
    depends_on: Vec<String>,
    baseline_checks: Vec<BaselineCheck>,
    orch_status: Option<String>,
    orch_branch: Option<String>,
    orch_worktree: Option<String>,
    orch_pr_number: Option<u64>,
    orch_started_at: Option<String>,
    orch_completed_at: Option<String>,
    #[serde(flatten)]
    extra: BTreeMap<String, serde_yaml::Value>,
}

impl Default for PlanFrontmatter {
    fn default() -> Self {
        Self {
            unit: None,
            depends_on: Vec::new(),
            baseline_checks: Vec::new(),
            orch_status: None,
            orch_branch: None,
            orch_worktree: None,
            orch_pr_number: None,
            orch_started_at: None,
            orch_completed_at: None,
            extra: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct TaskFrontmatter {
    task: Option<u32>,
    status: Option<String>,
    backpressure: Option<String>,
    depends_on: Vec<u32>,
}

/// One aggregated validation failure, tagged with the file it came from so a single
/// bad unit does not hide the rest (§4.2's "a single bad unit does not hide others").
#[derive(Debug)]
pub struct DiscoveryViolation {
    pub path: PathBuf,
    pub message: String,
}

impl std::fmt::Display for DiscoveryViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path.display(), self.message)
    }
}

#[derive(Debug)]
pub struct DiscoveryResult {
    pub units: Vec<Unit>,
    pub graph: DependencyGraph,
}

/// Enumerate immediate subdirectories of `root`, skip those lacking a plan file or
/// any matching task files, parse each unit, aggregate every validation failure
/// across all units into a single `OrchestratorError::Discovery`, and build the
/// dependency graph over the survivors.
pub fn discover(root: &Path) -> Result<DiscoveryResult, OrchestratorError> {
    let mut violations: Vec<DiscoveryViolation> = Vec::new();
    let mut units: Vec<Unit> = Vec::new();

    let mut entries: Vec<PathBuf> = fs::read_dir(root)
        .map_err(|e| OrchestratorError::Discovery(format!("cannot read tasks root {}: {e}", root.display())))?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    entries.sort();

    for dir in entries {
        let plan_path = dir.join("IMPLEMENTATION_PLAN.md");
        if !plan_path.exists() {
            continue;
        }
        let mut task_files: Vec<PathBuf> = fs::read_dir(&dir)
            .into_iter()
            .flatten()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| is_task_file(p))
            .collect();
        task_files.sort();
        if task_files.is_empty() {
            violations.push(DiscoveryViolation {
                path: plan_path,
                message: "unit has no task files (NN-*.md); a unit with zero tasks is a discovery error".to_string(),
            });
            continue;
        }

        match parse_unit(&dir, &plan_path, &task_files) {
            Ok(unit) => units.push(unit),
            Err(mut errs) => violations.append(&mut errs),
        }
    }

    // Cross-unit validation: depends_on references to units that were never discovered.
    let known: HashSet<&str> = units.iter().map(|u| u.id.as_str()).collect();
    for unit in &units {
        for dep in &unit.depends_on {
            if !known.contains(dep.as_str()) {
                violations.push(DiscoveryViolation {
                    path: root.join(&unit.id).join("IMPLEMENTATION_PLAN.md"),
                    message: format!("unit '{}' depends on unknown unit '{dep}'", unit.id),
                });
            }
        }
    }

    if !violations.is_empty() {
        let joined = violations.iter().map(|v| v.to_string()).collect::<Vec<_>>().join("\n");
        return Err(OrchestratorError::Discovery(joined));
    }

    units.sort_by(|a, b| a.id.cmp(&b.id));
    let pairs: Vec<(String, Vec<String>)> = units.iter().map(|u| (u.id.clone(), u.depends_on.clone())).collect();
    let graph = DependencyGraph::build(&pairs)?;

    Ok(DiscoveryResult { units, graph })
}

fn is_task_file(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let bytes = name.as_bytes();
    bytes.len() >= 3
        && bytes[0].is_ascii_digit()
        && bytes[1].is_ascii_digit()
        && bytes[2] == b'-'
        && name.ends_with(".md")
}

fn parse_unit(dir: &Path, plan_path: &Path, task_files: &[PathBuf]) -> Result<Unit, Vec<DiscoveryViolation>> {
    let mut violations = Vec::new();
    let unit_id = dir
        .file_name()
        .and_then(|n| n.to_str())
        .map(|s| s.to_string())
        .unwrap_or_else(|| plan_path.display().to_string());

    let plan_raw = match fs::read_to_string(plan_path) {
        Ok(raw) => raw,
        Err(e) => {
            return Err(vec![DiscoveryViolation { path: plan_path.to_path_buf(), message: format!("cannot read plan: {e}") }]);
        }
    };
    let plan_fm: PlanFrontmatter = match split_frontmatter(&plan_raw) {
        Some((fm, _body)) => match serde_yaml::from_str(fm) {
            Ok(v) => v,
            Err(e) => {
                return Err(vec![DiscoveryViolation { path: plan_path.to_path_buf(), message: format!("invalid plan frontmatter: {e}") }]);
            }
        },
        None => {
            return Err(vec![DiscoveryViolation { path: plan_path.to_path_buf(), message: "missing --- frontmatter block".to_string() }]);
        }
    };

    let mut tasks = Vec::with_capacity(task_files.len());
    for (position, path) in task_files.iter().enumerate() {
        let expected_index = (position + 1) as u32;
        match parse_task(path, expected_index) {
            Ok(task) => tasks.push(task),
            Err(v) => violations.push(v),
        }
    }

    let task_indices: HashSet<u32> = tasks.iter().map(|t| t.index).collect();
    for task in &tasks {
        for dep in &task.depends_on {
            if !task_indices.contains(dep) {
                violations.push(DiscoveryViolation {
                    path: dir.clone().join(format!("{:02}-*.md", task.index)),
                    message: format!("task {} depends on unknown task index {dep}", task.index),
                });
            }
        }
        if task.backpressure.trim().is_empty() {
            violations.push(DiscoveryViolation {
                path: dir.clone().join(format!("{:02}-*.md", task.index)),
                message: format!("task {} has an empty backpressure command", task.index),
            });
        }
    }

    if !violations.is_empty() {
        return Err(violations);
    }

    let unit_name = plan_fm.unit.unwrap_or(unit_id);
    Ok(Unit {
        id: unit_name,
        tasks,
        depends_on: plan_fm.depends_on,
        baseline_checks: plan_fm.baseline_checks,
        plan_extra: plan_fm.extra,
        state: UnitRuntimeState {
            status: orch_status_from_str(plan_fm.orch_status.as_deref()),
            worktree_path: plan_fm.orch_worktree.map(PathBuf::from),
            branch: plan_fm.orch_branch,
            pr_number: plan_fm.orch_pr_number,
            started_at: plan_fm.orch_started_at.and_then(|s| s.parse().ok()),
            completed_at: plan_fm.orch_completed_at.and_then(|s| s.parse().ok()),
            error: None,
        },
    })
}

fn orch_status_from_str(raw: Option<&str>) -> ralph_types::UnitStatus {
    use ralph_types::UnitStatus::*;
    match raw {
        Some("ready") => Ready,
        Some("in-progress") => InProgress,
        Some("complete") => Complete,
        Some("failed") => Failed,
        Some("blocked") => Blocked,
        _ => Pending,
    }
}

/// Parse one task file. `expected_index` is the file's sort position (1-indexed);
/// a mismatch against the frontmatter's `task:` key fails with `InvalidTaskNumbering`
/// per §4.2 point 3.
fn parse_task(path: &Path, expected_index: u32) -> Result<Task, DiscoveryViolation> {
    let raw = fs::read_to_string(path).map_err(|e| DiscoveryViolation { path: path.to_path_buf(), message: format!("cannot read task file: {e}") })?;
    let (fm_block, body) = split_frontmatter(&raw)
        .ok_or_else(|| DiscoveryViolation { path: path.to_path_buf(), message: "missing --- frontmatter block".to_string() })?;
    let fm: TaskFrontmatter = serde_yaml::from_str(fm_block)
        .map_err(|e| DiscoveryViolation { path: path.to_path_buf(), message: format!("invalid task frontmatter: {e}") })?;

    let index = fm.task.unwrap_or(expected_index);
    if index != expected_index {
        return Err(DiscoveryViolation {
            path: path.to_path_buf(),
            message: format!("InvalidTaskNumbering: file sort position {expected_index} does not match frontmatter task index {index}"),
        });
    }

    let backpressure = fm.backpressure.unwrap_or_default();
    let status = match fm.status.as_deref() {
        Some("complete") => TaskStatus::Complete,
        Some("failed") => TaskStatus::Failed,
        _ => TaskStatus::Pending,
    };
    let title = extract_h1(body).unwrap_or_else(|| format!("task {index}"));

    Ok(Task {
        index,
        title,
        content: body.to_string(),
        status,
        backpressure,
        depends_on: fm.depends_on,
    })
}

fn extract_h1(body: &str) -> Option<String> {
    body.lines().find_map(|line| line.strip_prefix("# ").map(|t| t.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_plan(dir: &Path, depends_on: &str) {
        fs::write(
            dir.join("IMPLEMENTATION_PLAN.md"),
            format!("---\nunit: {}\ndepends_on: {depends_on}\n---\n# Plan\n", dir.file_name().unwrap().to_str().unwrap()),
        )
        .unwrap();
    }

    fn write_task(dir: &Path, filename: &str, index: u32, backpressure: &str, depends_on: &str) {
        fs::write(
            dir.join(filename),
            format!("---\ntask: {index}\nstatus: pending\nbackpressure: {backpressure}\ndepends_on: {depends_on}\n---\n# Do the thing\nBody.\n"),
        )
        .unwrap();
    }

    #[test]
    fn discovers_a_single_well_formed_unit() {
        let root = tempdir().unwrap();
        let unit_dir = root.path().join("01-setup");
        fs::create_dir_all(&unit_dir).unwrap();
        write_plan(&unit_dir, "[]");
        write_task(&unit_dir, "01-create-file.md", 1, "test -f out.txt", "[]");

        let result = discover(root.path()).unwrap();
        assert_eq!(result.units.len(), 1);
        assert_eq!(result.units[0].tasks.len(), 1);
        assert_eq!(result.units[0].tasks[0].title, "Do the thing");
    }

    #[test]
    fn skips_directories_without_a_plan_file() {
        let root = tempdir().unwrap();
        fs::create_dir_all(root.path().join("not-a-unit")).unwrap();
        let result = discover(root.path()).unwrap();
        assert!(result.units.is_empty());
    }

    #[test]
    fn unknown_unit_dependency_is_aggregated_not_fail_fast() {
        let root = tempdir().unwrap();
        let unit_dir = root.path().join("02-feature");
        fs::create_dir_all(&unit_dir).unwrap();
        write_plan(&unit_dir, "[99-missing]");
        write_task(&unit_dir, "01-do.md", 1, "true", "[]");

        let err = discover(root.path()).unwrap_err();
        match err {
            OrchestratorError::Discovery(msg) => assert!(msg.contains("unknown unit")),
            other => panic!("unexpected error variant: {other:?}"),
        }
    }

    #[test]
    fn mismatched_task_numbering_fails_discovery() {
        let root = tempdir().unwrap();
        let unit_dir = root.path().join("03-broken");
        fs::create_dir_all(&unit_dir).unwrap();
        write_plan(&unit_dir, "[]");
        // Frontmatter claims task 5 but this is the first (sort position 1) file.
        write_task(&unit_dir, "01-do.md", 5, "true", "[]");

        let err = discover(root.path()).unwrap_err();
        match err {
            OrchestratorError::Discovery(msg) => assert!(msg.contains("InvalidTaskNumbering")),
            other => panic!("unexpected error variant: {other:?}"),
        }
    }

    #[test]
    fn empty_backpressure_command_is_rejected() {
        let root = tempdir().unwrap();
        let unit_dir = root.path().join("04-empty-bp");
        fs::create_dir_all(&unit_dir).unwrap();
        write_plan(&unit_dir, "[]");
        write_task(&unit_dir, "01-do.md", 1, "", "[]");

        let err = discover(root.path()).unwrap_err();
        match err {
            OrchestratorError::Discovery(msg) => assert!(msg.contains("empty backpressure")),
            other => panic!("unexpected error variant: {other:?}"),
        }
    }

    #[test]
    fn aggregates_violations_across_multiple_units() {
        let root = tempdir().unwrap();
        for (name, dep) in [("05-a", "[missing-1]"), ("06-b", "[missing-2]")] {
            let unit_dir = root.path().join(name);
            fs::create_dir_all(&unit_dir).unwrap();
            write_plan(&unit_dir, dep);
            write_task(&unit_dir, "01-do.md", 1, "true", "[]");
        }
        let err = discover(root.path()).unwrap_err();
        match err {
            OrchestratorError::Discovery(msg) => {
                assert!(msg.contains("missing-1"));
                assert!(msg.contains("missing-2"));
            }
            other => panic!("unexpected error variant: {other:?}"),
        }
    }

    #[test]
    fn split_frontmatter_rejects_missing_delimiter() {
        assert!(split_frontmatter("# no frontmatter here").is_none());
    }

    #[test]
    fn split_frontmatter_extracts_block_and_body() {
        let (fm, body) = split_frontmatter("---\nunit: a\n---\n# Title\nBody\n").unwrap();
        assert_eq!(fm, "unit: a");
        assert_eq!(body, "# Title\nBody\n");
    }
}

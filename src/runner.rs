//! Run orchestrator: expand a selection into leaves, hand each framework its
//! share, and always close the run out afterwards.

use std::any::Any;
use std::collections::{BTreeMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};

use crate::data::{test_name_to_path, test_path_to_name, FinishedRun, StartedRun, TestData, TestItem, TestList, TestPath};
use crate::framework::{RunContext, TestFramework};
use crate::Result;

/// framework id -> executable -> run ids
pub type GroupedTests = BTreeMap<String, BTreeMap<String, Vec<String>>>;

#[derive(Debug, Default)]
pub struct RunPlan {
    /// Every leaf the run touches.
    pub paths: Vec<TestPath>,
    pub groups: GroupedTests,
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub tests: usize,
    /// One line per framework that failed or panicked.
    pub errors: Vec<String>,
    /// Frameworks referenced by the tree but not configured.
    pub skipped_frameworks: Vec<String>,
    pub stopped: bool,
    pub duration: Duration,
}

/// Expand `selection` (full names, groups allowed, `""` for everything) into
/// leaves. Names missing from `list` are skipped with a warning.
pub fn plan_run(list: &TestList, selection: &[String]) -> RunPlan {
    fn collect(item: &TestItem, path: &mut TestPath, seen: &mut HashSet<TestPath>, plan: &mut RunPlan) {
        match &item.children {
            Some(children) => {
                for child in children.values() {
                    path.push(child.name.clone());
                    collect(child, path, seen, plan);
                    path.pop();
                }
            }
            None => {
                if !seen.insert(path.clone()) {
                    return;
                }
                let Some(location) = &item.location else {
                    tracing::warn!("{} has no location, not running it", test_path_to_name(path));
                    return;
                };
                plan.groups
                    .entry(item.framework_id.clone())
                    .or_default()
                    .entry(location.executable.clone())
                    .or_default()
                    .push(item.run_id.clone());
                plan.paths.push(path.clone());
            }
        }
    }

    let mut plan = RunPlan::default();
    let mut seen = HashSet::new();
    for name in selection {
        let mut path = test_name_to_path(name);
        let Some(item) = list.find(&path) else {
            tracing::warn!("{} not found in test list", name);
            continue;
        };
        collect(item, &mut path, &mut seen, &mut plan);
    }
    plan
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run `selection` to completion or until stopped.
///
/// Fails only if the run cannot start (another run active, tree changed under
/// the selection). Once started, framework failures are logged and collected
/// into the summary, and the run is always marked finished.
pub fn run_tests(data: &TestData, frameworks: &[Box<dyn TestFramework>], selection: &[String]) -> Result<RunSummary> {
    let tests = data.get_test_list();
    let plan = plan_run(&tests, selection);
    let mut summary = RunSummary { tests: plan.paths.len(), ..Default::default() };
    if plan.paths.is_empty() {
        tracing::warn!("Nothing to run");
        return Ok(summary);
    }
    tracing::info!("Collected {} tests", plan.paths.len());

    data.notify_run_started(&StartedRun { tests: plan.paths.clone() })?;
    let stop = data.stop_signal();
    let start = Instant::now();

    let ctx = RunContext { events: data, tests: &tests, stop: &stop };
    for (framework_id, grouped) in &plan.groups {
        if stop.is_stopped() {
            break;
        }
        let Some(framework) = frameworks.iter().find(|f| f.id() == framework_id) else {
            tracing::warn!("{} not found in frameworks", framework_id);
            summary.skipped_frameworks.push(framework_id.clone());
            continue;
        };

        tracing::debug!("Running {} executables for {}", grouped.len(), framework_id);
        match panic::catch_unwind(AssertUnwindSafe(|| framework.run(grouped, ctx))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                tracing::error!("Error when running {} tests: {}", framework_id, e);
                summary.errors.push(format!("{}: {}", framework_id, e));
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!("Running {} tests panicked: {}", framework_id, message);
                summary.errors.push(format!("{}: panicked: {}", framework_id, message));
            }
        }
    }

    summary.stopped = stop.is_stopped();
    if let Err(e) = data.notify_run_finished(&FinishedRun { tests: plan.paths }) {
        tracing::error!("Failed to close the test run: {}", e);
        summary.errors.push(e.to_string());
    }
    summary.duration = start.elapsed();
    tracing::info!("Test run duration: {:?}", summary.duration);
    Ok(summary)
}

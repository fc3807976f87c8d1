use chrono::{DateTime, Utc};
use serde::Serialize;

use super::item::TestItem;
use super::status::{RunStatus, TestStatus};

/// Per-status leaf counts over a whole tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TestStats {
    pub total: usize,
    pub not_run: usize,
    pub stopped: usize,
    pub skipped: usize,
    pub passed: usize,
    pub failed: usize,
    pub crashed: usize,
    pub not_running: usize,
    pub queued: usize,
    pub running: usize,
    /// Most recent start time over all leaves.
    pub last_run: Option<DateTime<Utc>>,
}

impl TestStats {
    pub fn count(&self, status: TestStatus) -> usize {
        match status {
            TestStatus::NotRun => self.not_run,
            TestStatus::Stopped => self.stopped,
            TestStatus::Skipped => self.skipped,
            TestStatus::Passed => self.passed,
            TestStatus::Failed => self.failed,
            TestStatus::Crashed => self.crashed,
        }
    }

    pub fn count_run(&self, status: RunStatus) -> usize {
        match status {
            RunStatus::NotRunning => self.not_running,
            RunStatus::Queued => self.queued,
            RunStatus::Running => self.running,
        }
    }

    fn add_leaf(&mut self, item: &TestItem) {
        self.total += 1;
        *match item.last_status {
            TestStatus::NotRun => &mut self.not_run,
            TestStatus::Stopped => &mut self.stopped,
            TestStatus::Skipped => &mut self.skipped,
            TestStatus::Passed => &mut self.passed,
            TestStatus::Failed => &mut self.failed,
            TestStatus::Crashed => &mut self.crashed,
        } += 1;
        *match item.run_status {
            RunStatus::NotRunning => &mut self.not_running,
            RunStatus::Queued => &mut self.queued,
            RunStatus::Running => &mut self.running,
        } += 1;
        if item.last_run.is_some() {
            self.last_run = self.last_run.max(item.last_run);
        }
    }
}

/// Walk the tree once and count every leaf.
pub fn get_test_stats(item: &TestItem) -> TestStats {
    fn walk(stats: &mut TestStats, item: &TestItem) {
        match &item.children {
            Some(children) => children.values().for_each(|c| walk(stats, c)),
            None => stats.add_leaf(item),
        }
    }

    let mut stats = TestStats::default();
    walk(&mut stats, item);
    stats
}

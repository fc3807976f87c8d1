use serde::{Deserialize, Serialize};

/// Outcome of the last run of a test, ordered by severity.
///
/// Variant order is the merge priority: a crash outranks a failure, which outranks
/// a pass, and so on down to `NotRun`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    NotRun,
    Stopped,
    Skipped,
    Passed,
    Failed,
    Crashed,
}

impl TestStatus {
    pub const ALL: [TestStatus; 6] = [
        TestStatus::NotRun,
        TestStatus::Stopped,
        TestStatus::Skipped,
        TestStatus::Passed,
        TestStatus::Failed,
        TestStatus::Crashed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TestStatus::NotRun => "not_run",
            TestStatus::Stopped => "stopped",
            TestStatus::Skipped => "skipped",
            TestStatus::Passed => "passed",
            TestStatus::Failed => "failed",
            TestStatus::Crashed => "crashed",
        }
    }

    /// The more severe of the two statuses.
    pub fn merge(self, other: TestStatus) -> TestStatus {
        self.max(other)
    }
}

impl std::fmt::Display for TestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a test is part of the run currently in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    NotRunning,
    Queued,
    Running,
}

impl RunStatus {
    pub const ALL: [RunStatus; 3] = [RunStatus::NotRunning, RunStatus::Queued, RunStatus::Running];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::NotRunning => "not_running",
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
        }
    }

    pub fn merge(self, other: RunStatus) -> RunStatus {
        self.max(other)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Merge two possibly-absent statuses. An absent status ranks below every value.
pub fn merge_status(a: Option<TestStatus>, b: Option<TestStatus>) -> Option<TestStatus> {
    a.max(b)
}

/// Merge two possibly-absent run statuses. An absent status ranks below every value.
pub fn merge_run_status(a: Option<RunStatus>, b: Option<RunStatus>) -> Option<RunStatus> {
    a.max(b)
}

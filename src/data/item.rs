use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use super::status::{RunStatus, TestStatus};

pub const TEST_SEPARATOR: &str = "/";
pub const ROOT_NAME: &str = "root";

/// Ordered segments from the tree root to a node.
pub type TestPath = Vec<String>;

/// Split a full name into its path. The empty name is the root.
pub fn test_name_to_path(name: &str) -> TestPath {
    if name.is_empty() {
        return Vec::new();
    }
    name.split(TEST_SEPARATOR).map(str::to_string).collect()
}

pub fn test_path_to_name(path: &[String]) -> String {
    path.join(TEST_SEPARATOR)
}

/// Full names of every strict ancestor of `path`, excluding the root.
pub fn parents_in_path(path: &[String]) -> Vec<String> {
    (1..path.len()).map(|i| test_path_to_name(&path[..i])).collect()
}

/// Where a test is defined, and which executable produced it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestLocation {
    pub executable: String,
    pub file: String,
    pub line: u32,
}

/// One test as reported by a framework's discovery pass.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredTest {
    pub full_name: TestPath,
    pub framework_id: String,
    /// Identifier used to request execution of this test.
    pub run_id: String,
    /// Identifier the framework emits while streaming results.
    pub report_id: String,
    pub location: TestLocation,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StartedTest {
    pub path: TestPath,
    pub start_time: DateTime<Utc>,
}

impl StartedTest {
    pub fn new(path: TestPath) -> Self {
        Self { path, start_time: Utc::now() }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FinishedTest {
    pub path: TestPath,
    pub status: TestStatus,
    pub message: String,
}

impl FinishedTest {
    pub fn new(path: TestPath, status: TestStatus) -> Self {
        Self { path, status, message: String::new() }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TestOutput {
    pub path: TestPath,
    pub text: String,
}

/// Paths submitted to one run invocation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StartedRun {
    pub tests: Vec<TestPath>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FinishedRun {
    pub tests: Vec<TestPath>,
}

/// A node of the test tree. `children == None` marks a leaf (an actual test).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestItem {
    pub name: String,
    pub full_name: String,
    #[serde(default)]
    pub framework_id: String,
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub report_id: String,
    #[serde(default)]
    pub location: Option<TestLocation>,
    pub last_status: TestStatus,
    pub run_status: RunStatus,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default, with = "children_serde", skip_serializing_if = "Option::is_none")]
    pub children: Option<IndexMap<String, TestItem>>,
}

impl TestItem {
    /// An empty group node.
    pub fn group(name: impl Into<String>, full_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            full_name: full_name.into(),
            framework_id: String::new(),
            run_id: String::new(),
            report_id: String::new(),
            location: None,
            last_status: TestStatus::NotRun,
            run_status: RunStatus::NotRunning,
            last_run: None,
            children: Some(IndexMap::new()),
        }
    }

    pub fn from_discovered(test: &DiscoveredTest) -> Self {
        Self {
            name: test.full_name.last().cloned().unwrap_or_default(),
            full_name: test_path_to_name(&test.full_name),
            framework_id: test.framework_id.clone(),
            run_id: test.run_id.clone(),
            report_id: test.report_id.clone(),
            location: Some(test.location.clone()),
            last_status: TestStatus::NotRun,
            run_status: RunStatus::NotRunning,
            last_run: None,
            children: None,
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.children.is_none()
    }

    /// Id used to correlate streamed results; stores written before report ids
    /// existed fall back to the run id.
    pub fn effective_report_id(&self) -> &str {
        if self.report_id.is_empty() {
            &self.run_id
        } else {
            &self.report_id
        }
    }

    /// Copy identity fields from a fresh discovery, keeping run history.
    pub fn update_from_discovered(&mut self, test: &DiscoveredTest) {
        self.framework_id = test.framework_id.clone();
        self.run_id = test.run_id.clone();
        self.report_id = test.report_id.clone();
        self.location = Some(test.location.clone());
    }

    pub fn notify_run_queued(&mut self) {
        self.run_status = RunStatus::Queued;
    }

    /// Final bookkeeping for a test the run never reported completion for.
    pub fn notify_run_stopped(&mut self) {
        match self.run_status {
            RunStatus::Running => self.last_status = TestStatus::Crashed,
            RunStatus::Queued => self.last_status = TestStatus::Stopped,
            RunStatus::NotRunning => {}
        }
        self.run_status = RunStatus::NotRunning;
    }

    pub fn update_from_started(&mut self, test: &StartedTest) {
        self.last_run = Some(test.start_time);
        self.run_status = RunStatus::Running;
    }

    pub fn update_from_finished(&mut self, test: &FinishedTest) {
        self.last_status = test.status;
        self.run_status = RunStatus::NotRunning;
    }

    /// Apply `f` to this item if it is a leaf, otherwise to every leaf below it.
    pub fn visit_leaves_mut<F: FnMut(&mut TestItem)>(&mut self, f: &mut F) {
        match self.children.as_mut() {
            None => f(self),
            Some(children) => {
                for child in children.values_mut() {
                    child.visit_leaves_mut(f);
                }
            }
        }
    }

    /// Recompute every group of this subtree, bottom-up.
    pub fn recompute_subtree(&mut self) {
        if let Some(children) = self.children.as_mut() {
            for child in children.values_mut() {
                child.recompute_subtree();
            }
        }
        self.recompute_status();
    }

    /// Recompute a group's aggregate status from its direct children.
    pub fn recompute_status(&mut self) {
        let Some(children) = &self.children else { return };

        self.last_status = children
            .values()
            .map(|c| c.last_status)
            .fold(TestStatus::NotRun, TestStatus::merge);
        self.run_status = children
            .values()
            .map(|c| c.run_status)
            .fold(RunStatus::NotRunning, RunStatus::merge);
    }
}

/// Persisted process-wide state, stored next to the tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TestMetaData {
    pub last_discovery: Option<DateTime<Utc>>,
    pub running: bool,
}

/// Children are persisted as an ordered array rather than a name-keyed object.
mod children_serde {
    use indexmap::IndexMap;
    use serde::{Deserialize, Deserializer, Serializer};

    use super::TestItem;

    pub fn serialize<S: Serializer>(
        children: &Option<IndexMap<String, TestItem>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match children {
            Some(map) => serializer.collect_seq(map.values()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<IndexMap<String, TestItem>>, D::Error> {
        let items: Option<Vec<TestItem>> = Option::deserialize(deserializer)?;
        Ok(items.map(|items| items.into_iter().map(|c| (c.name.clone(), c)).collect()))
    }
}

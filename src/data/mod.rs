//! The test registry: tree model, run-id index, statistics and the persistent store.

pub mod item;
pub mod list;
pub mod stats;
pub mod status;
pub mod store;

pub use item::{
    parents_in_path, test_name_to_path, test_path_to_name, DiscoveredTest, FinishedRun, FinishedTest, StartedRun,
    StartedTest, TestItem, TestLocation, TestMetaData, TestOutput, TestPath, ROOT_NAME, TEST_SEPARATOR,
};
pub use list::{RunIdIndex, TestList};
pub use stats::{get_test_stats, TestStats};
pub use status::{merge_run_status, merge_status, RunStatus, TestStatus};
pub use store::{RefreshListener, StopSignal, TestData, TestEvents, MIN_REFRESH_INTERVAL};

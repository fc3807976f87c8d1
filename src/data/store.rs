use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};

use super::item::{
    parents_in_path, test_name_to_path, test_path_to_name, DiscoveredTest, FinishedRun, FinishedTest,
    StartedRun, StartedTest, TestItem, TestMetaData, TestOutput, TestPath,
};
use super::list::TestList;
use super::stats::{get_test_stats, TestStats};
use crate::{Error, Result};

pub const TEST_DATA_MAIN_FILE: &str = "main.json";
pub const TEST_DATA_TESTS_FILE: &str = "tests.json";

/// Minimum delay between two refresh notifications.
pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_millis(100);

/// Cooperative cancellation flag shared by the store and framework runs.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Receives "these paths changed" notifications after commits.
pub trait RefreshListener: Send + Sync {
    fn refresh(&self, location: &Path, hints: &[String]);
}

/// Sink for per-test progress reported by a framework run.
pub trait TestEvents {
    fn notify_test_started(&self, test: StartedTest) -> Result<()>;
    fn notify_test_output(&self, output: TestOutput) -> Result<()>;
    fn notify_test_finished(&self, test: FinishedTest) -> Result<()>;
}

/// Which files a commit rewrites.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Persist {
    Nothing,
    Tests,
    Both,
}

struct DataState {
    tests: TestList,
    meta: TestMetaData,
    stats: Option<TestStats>,
    outputs: HashMap<String, String>,
}

#[derive(Default)]
struct RefreshState {
    last_refresh: Option<Instant>,
    hints: BTreeSet<String>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Persistent registry of discovered tests and their last results.
///
/// Every mutation takes the state lock, applies the change, writes the affected
/// files, releases the lock and only then notifies listeners.
pub struct TestData {
    location: PathBuf,
    state: Mutex<DataState>,
    refresh: Mutex<RefreshState>,
    listener: Option<Box<dyn RefreshListener>>,
    stop: StopSignal,
}

impl TestData {
    /// Open the store rooted at `location`, creating it if needed.
    ///
    /// Unreadable files are logged and replaced with an empty store. A store
    /// left marked as running by an interrupted process is closed out the same
    /// way a stopped run would be.
    pub fn open(location: impl Into<PathBuf>) -> Result<Self> {
        let location = location.into();
        std::fs::create_dir_all(&location)?;

        let (meta, tests, fresh) = match Self::load(&location) {
            Some((meta, tests)) => (meta, tests, false),
            None => (TestMetaData::default(), TestList::new(), true),
        };

        let data = Self {
            location,
            state: Mutex::new(DataState { tests, meta, stats: None, outputs: HashMap::new() }),
            refresh: Mutex::new(RefreshState::default()),
            listener: None,
            stop: StopSignal::new(),
        };

        if fresh {
            data.commit(Persist::Both, |_| Ok(Vec::new()))?;
        } else if data.is_running_tests() {
            tracing::warn!("Test data at {:?} was left in a running state; closing out the interrupted run", data.location);
            data.commit(Persist::Both, |state| {
                state.tests.for_each_leaf_mut(TestItem::notify_run_stopped);
                state.tests.recompute_all();
                state.meta.running = false;
                Ok(Vec::new())
            })?;
        }

        Ok(data)
    }

    pub fn with_listener(mut self, listener: impl RefreshListener + 'static) -> Self {
        self.listener = Some(Box::new(listener));
        self
    }

    fn load(location: &Path) -> Option<(TestMetaData, TestList)> {
        let main_path = location.join(TEST_DATA_MAIN_FILE);
        let tests_path = location.join(TEST_DATA_TESTS_FILE);
        if !main_path.exists() || !tests_path.exists() {
            return None;
        }

        let read = || -> Result<(TestMetaData, TestList)> {
            let meta: TestMetaData = serde_json::from_str(&std::fs::read_to_string(&main_path)?)?;
            let root: TestItem = serde_json::from_str(&std::fs::read_to_string(&tests_path)?)?;
            Ok((meta, TestList::from_root(root)))
        };

        match read() {
            Ok(loaded) => Some(loaded),
            Err(e) => {
                tracing::warn!("Failed to load test data from {:?}, re-initialising: {}", location, e);
                None
            }
        }
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    /// Discard the stored tree and metadata.
    pub fn reset(&self) -> Result<()> {
        tracing::info!("Resetting test data at {:?}", self.location);
        self.commit(Persist::Both, |state| {
            state.tests = TestList::new();
            state.meta = TestMetaData::default();
            state.outputs.clear();
            Ok(Vec::new())
        })
    }

    /// Snapshot of the current tree.
    pub fn get_test_list(&self) -> TestList {
        lock(&self.state).tests.clone()
    }

    pub fn get_test_metadata(&self) -> TestMetaData {
        lock(&self.state).meta.clone()
    }

    pub fn get_last_discovery(&self) -> Option<DateTime<Utc>> {
        lock(&self.state).meta.last_discovery
    }

    pub fn is_running_tests(&self) -> bool {
        lock(&self.state).meta.running
    }

    /// Whole-tree statistics. With `cached`, reuse the value computed since the
    /// last tree mutation.
    pub fn get_global_test_stats(&self, cached: bool) -> TestStats {
        let mut state = lock(&self.state);
        if !cached || state.stats.is_none() {
            state.stats = Some(get_test_stats(state.tests.root()));
        }
        state.stats.clone().unwrap_or_default()
    }

    /// Accumulated output of a test during this session.
    pub fn get_test_output(&self, full_name: &str) -> Option<String> {
        lock(&self.state).outputs.get(full_name).cloned()
    }

    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Ask the running framework processes to stop. No-op when idle.
    pub fn stop_tests(&self) {
        if self.is_running_tests() {
            tracing::info!("Stopping tests");
            self.stop.stop();
        }
    }

    /// Take the hints accumulated since the last notification.
    pub fn poll_refresh(&self) -> Vec<String> {
        let mut refresh = lock(&self.refresh);
        refresh.last_refresh = Some(Instant::now());
        std::mem::take(&mut refresh.hints).into_iter().collect()
    }

    /// Replace the tree with `tests`, carrying run history over for every leaf
    /// that already existed at the same path.
    pub fn notify_discovered_tests(&self, tests: Vec<DiscoveredTest>, discovery_time: DateTime<Utc>) -> Result<()> {
        tracing::info!("Discovered {} tests", tests.len());
        self.commit(Persist::Both, |state| {
            if state.meta.running {
                return Err(Error::RunInProgress);
            }

            let mut new_tests = TestList::new();
            for test in &tests {
                if test.full_name.is_empty() {
                    tracing::warn!("Ignoring discovered test with an empty name (run id '{}')", test.run_id);
                    continue;
                }

                let item = match state.tests.find(&test.full_name) {
                    Some(old) if old.is_leaf() => {
                        let mut item = old.clone();
                        item.update_from_discovered(test);
                        item
                    }
                    _ => TestItem::from_discovered(test),
                };

                if let Err(e) = new_tests.insert_or_update(&test.full_name, item) {
                    tracing::warn!("Skipping discovered test: {}", e);
                    continue;
                }
                new_tests.recompute_ancestors(&test.full_name);
            }

            state
                .outputs
                .retain(|name, _| new_tests.find(&test_name_to_path(name)).is_some_and(TestItem::is_leaf));
            state.tests = new_tests;
            state.meta.last_discovery = Some(discovery_time);
            Ok(Vec::new())
        })
    }

    /// Mark the submitted paths as queued and the store as running.
    ///
    /// Rejected without any change if a run is already active or a path is
    /// absent from the tree. Clears the stop signal left by a previous run.
    pub fn notify_run_started(&self, run: &StartedRun) -> Result<()> {
        tracing::info!("Test run started ({} selections)", run.tests.len());
        self.commit(Persist::Both, |state| {
            if state.meta.running {
                return Err(Error::RunInProgress);
            }
            if let Some(missing) = run.tests.iter().find(|p| state.tests.find(p).is_none()) {
                return Err(Error::UnknownTest(test_path_to_name(missing)));
            }

            // Cleared under the lock so a stop requested once the run is visible is kept.
            self.stop.reset();
            state.meta.running = true;
            let mut hints = Vec::new();
            for path in &run.tests {
                apply_to_path(&mut state.tests, path, TestItem::notify_run_queued, &mut hints);
            }
            Ok(hints)
        })
    }

    /// Close out a run: leaves still running become crashed, leaves still
    /// queued become stopped, and the store is no longer running.
    ///
    /// Always clears the running flag. Paths that have disappeared from the
    /// tree are skipped and reported after the commit.
    pub fn notify_run_finished(&self, run: &FinishedRun) -> Result<()> {
        tracing::info!("Test run finished");
        let mut missing = None;
        self.commit(Persist::Both, |state| {
            let mut hints = Vec::new();
            for path in &run.tests {
                if state.tests.find(path).is_none() {
                    tracing::warn!("Finished run references unknown test {}", test_path_to_name(path));
                    missing.get_or_insert_with(|| test_path_to_name(path));
                    continue;
                }
                apply_to_path(&mut state.tests, path, TestItem::notify_run_stopped, &mut hints);
            }
            state.meta.running = false;
            Ok(hints)
        })?;

        match missing {
            Some(name) => Err(Error::UnknownTest(name)),
            None => Ok(()),
        }
    }

    /// Apply `update` under the state lock, persist, then notify listeners with
    /// the hints it returns. If the update or the save fails, the tree and
    /// metadata are rolled back to what they were before the call.
    fn commit<F>(&self, persist: Persist, update: F) -> Result<()>
    where
        F: FnOnce(&mut DataState) -> Result<Vec<String>>,
    {
        let hints = {
            let mut state = lock(&self.state);
            let snapshot = (persist != Persist::Nothing).then(|| (state.tests.clone(), state.meta.clone()));
            let result = update(&mut *state).and_then(|hints| {
                if persist != Persist::Nothing {
                    state.stats = None;
                }
                self.save(&state, persist)?;
                Ok(hints)
            });
            match result {
                Ok(hints) => hints,
                Err(e) => {
                    if let Some((tests, meta)) = snapshot {
                        tracing::warn!("Rolling back test data at {:?}: {}", self.location, e);
                        state.tests = tests;
                        state.meta = meta;
                        state.stats = None;
                    }
                    return Err(e);
                }
            }
        };
        self.refresh_views(hints);
        Ok(())
    }

    fn save(&self, state: &DataState, persist: Persist) -> Result<()> {
        if persist == Persist::Nothing {
            return Ok(());
        }
        std::fs::create_dir_all(&self.location)?;
        if persist == Persist::Both {
            let json = serde_json::to_string_pretty(&state.meta)?;
            std::fs::write(self.location.join(TEST_DATA_MAIN_FILE), json)?;
        }
        let json = serde_json::to_string_pretty(state.tests.root())?;
        std::fs::write(self.location.join(TEST_DATA_TESTS_FILE), json)?;
        Ok(())
    }

    /// Accumulate hints and notify the listener at most once per
    /// [`MIN_REFRESH_INTERVAL`]. Without a listener, hints wait for
    /// [`TestData::poll_refresh`].
    fn refresh_views(&self, hints: Vec<String>) {
        let pending = {
            let mut refresh = lock(&self.refresh);
            refresh.hints.extend(hints);
            if self.listener.is_none() {
                return;
            }
            let due = refresh.last_refresh.map_or(true, |t| t.elapsed() >= MIN_REFRESH_INTERVAL);
            if !due {
                return;
            }
            refresh.last_refresh = Some(Instant::now());
            std::mem::take(&mut refresh.hints)
        };

        if let Some(listener) = &self.listener {
            let hints: Vec<String> = pending.into_iter().collect();
            tracing::debug!("Refreshing views of {:?} ({} hints)", self.location, hints.len());
            listener.refresh(&self.location, &hints);
        }
    }

    fn leaf_event<F>(&self, path: &TestPath, persist: Persist, update: F) -> Result<()>
    where
        F: FnOnce(&mut DataState, &str) -> Result<()>,
    {
        self.commit(persist, |state| {
            let name = test_path_to_name(path);
            if state.tests.find(path).is_none() {
                return Err(Error::UnknownTest(name));
            }
            update(state, &name)?;
            let mut hints = vec![name];
            if persist != Persist::Nothing {
                state.tests.recompute_ancestors(path);
                hints.extend(parents_in_path(path));
            }
            Ok(hints)
        })
    }
}

/// Apply `update` to every leaf at or below `path`, then recompute the groups
/// it touched.
fn apply_to_path(tests: &mut TestList, path: &[String], update: fn(&mut TestItem), hints: &mut Vec<String>) {
    if let Some(item) = tests.find_mut(path) {
        item.visit_leaves_mut(&mut |leaf| update(leaf));
        item.recompute_subtree();
    }
    tests.recompute_ancestors(path);
    hints.push(test_path_to_name(path));
    hints.extend(parents_in_path(path));
}

impl TestEvents for TestData {
    fn notify_test_started(&self, test: StartedTest) -> Result<()> {
        tracing::debug!("Test started: {}", test_path_to_name(&test.path));
        self.leaf_event(&test.path, Persist::Tests, |state, name| {
            if let Some(item) = state.tests.find_mut(&test.path) {
                item.update_from_started(&test);
            }
            state.outputs.insert(name.to_string(), String::new());
            Ok(())
        })
    }

    fn notify_test_output(&self, output: TestOutput) -> Result<()> {
        self.leaf_event(&output.path, Persist::Nothing, |state, name| {
            state.outputs.entry(name.to_string()).or_default().push_str(&output.text);
            Ok(())
        })
    }

    fn notify_test_finished(&self, test: FinishedTest) -> Result<()> {
        tracing::debug!("Test finished: {} ({})", test_path_to_name(&test.path), test.status);
        self.leaf_event(&test.path, Persist::Tests, |state, name| {
            if let Some(item) = state.tests.find_mut(&test.path) {
                item.update_from_finished(&test);
            }
            if !test.message.is_empty() {
                let output = state.outputs.entry(name.to_string()).or_default();
                output.push_str(&test.message);
                if !test.message.ends_with('\n') {
                    output.push('\n');
                }
            }
            Ok(())
        })
    }
}

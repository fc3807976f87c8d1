//! Discovery pipeline: ask every configured framework for its tests and
//! replace the stored tree with the result.

use chrono::Utc;
use rayon::prelude::*;

use crate::data::{test_path_to_name, DiscoveredTest, TestData};
use crate::framework::TestFramework;
use crate::{Error, Result};

/// Order by increasing depth, then by full name.
pub fn sort_tests(tests: &mut [DiscoveredTest]) {
    tests.sort_by_cached_key(|t| (t.full_name.len(), test_path_to_name(&t.full_name)));
}

/// Run discovery for every framework and commit the merged result.
///
/// Every framework is attempted. If any of them fails the stored tree is left
/// untouched and one [`Error::Discovery`] carries the details of all failures.
/// Returns the number of tests discovered.
pub fn discover_tests(data: &TestData, frameworks: &[Box<dyn TestFramework>], sort: bool) -> Result<usize> {
    if frameworks.is_empty() {
        return Err(Error::NoFrameworkConfigured);
    }
    if data.is_running_tests() {
        return Err(Error::RunInProgress);
    }

    let start = Utc::now();
    let results: Vec<(&str, Result<Vec<DiscoveredTest>>)> =
        frameworks.par_iter().map(|framework| (framework.id(), framework.discover())).collect();

    let mut tests = Vec::new();
    let mut details = Vec::new();
    for (id, result) in results {
        match result {
            Ok(found) => {
                tracing::debug!("[{}] discovered {} tests", id, found.len());
                tests.extend(found);
            }
            Err(Error::Discovery { message, details: nested }) => {
                tracing::error!("[{}] {}", id, message);
                if nested.is_empty() {
                    details.push(format!("[{}] {}", id, message));
                }
                details.extend(nested.into_iter().map(|d| format!("[{}] {}", id, d)));
            }
            Err(e) => {
                tracing::error!("[{}] discovery failed: {}", id, e);
                details.push(format!("[{}] {}", id, e));
            }
        }
    }

    if !details.is_empty() {
        for detail in &details {
            tracing::error!("{}", detail);
        }
        return Err(Error::discovery(details));
    }

    if sort {
        sort_tests(&mut tests);
    }

    let count = tests.len();
    data.notify_discovered_tests(tests, start)?;
    tracing::info!("Discovery complete: {} tests in {} ms", count, (Utc::now() - start).num_milliseconds());
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{StartedRun, TestLocation, TestPath};
    use crate::framework::RunContext;
    use std::collections::BTreeMap;

    struct Fixed {
        id: &'static str,
        result: fn() -> Result<Vec<DiscoveredTest>>,
    }

    impl TestFramework for Fixed {
        fn id(&self) -> &str {
            self.id
        }

        fn discover(&self) -> Result<Vec<DiscoveredTest>> {
            (self.result)()
        }

        fn run(&self, _grouped: &BTreeMap<String, Vec<String>>, _ctx: RunContext<'_>) -> Result<()> {
            Ok(())
        }
    }

    fn test(name: &str) -> DiscoveredTest {
        let full_name: TestPath = name.split('/').map(str::to_string).collect();
        DiscoveredTest {
            run_id: full_name.last().cloned().unwrap(),
            report_id: full_name.last().cloned().unwrap(),
            full_name,
            framework_id: "fixed".to_string(),
            location: TestLocation { executable: "E".to_string(), file: "t.cpp".to_string(), line: 1 },
        }
    }

    fn good() -> Result<Vec<DiscoveredTest>> {
        Ok(vec![test("suite/deep/x"), test("suite/a"), test("b")])
    }

    fn broken() -> Result<Vec<DiscoveredTest>> {
        Err(Error::discovery(vec!["build/t: exited with code 1".to_string()]))
    }

    #[test]
    fn test_sort_by_depth_then_name() {
        let mut tests = vec![test("suite/deep/x"), test("suite/b"), test("z"), test("suite/a")];
        sort_tests(&mut tests);
        let names: Vec<String> = tests.iter().map(|t| test_path_to_name(&t.full_name)).collect();
        assert_eq!(names, vec!["z", "suite/a", "suite/b", "suite/deep/x"]);
    }

    #[test]
    fn test_discovery_commits_tree() {
        let dir = tempfile::tempdir().unwrap();
        let data = TestData::open(dir.path()).unwrap();
        let frameworks: Vec<Box<dyn TestFramework>> = vec![Box::new(Fixed { id: "fixed", result: good })];

        assert_eq!(discover_tests(&data, &frameworks, true).unwrap(), 3);
        assert_eq!(data.get_test_list().list_all_leaves(), vec!["b", "suite/a", "suite/deep/x"]);
        assert!(data.get_last_discovery().is_some());
    }

    #[test]
    fn test_failures_are_aggregated_and_tree_kept() {
        let dir = tempfile::tempdir().unwrap();
        let data = TestData::open(dir.path()).unwrap();
        let frameworks: Vec<Box<dyn TestFramework>> = vec![
            Box::new(Fixed { id: "one", result: broken }),
            Box::new(Fixed { id: "two", result: good }),
            Box::new(Fixed { id: "three", result: broken }),
        ];

        let err = discover_tests(&data, &frameworks, false).unwrap_err();
        assert_eq!(err.details(), ["[one] build/t: exited with code 1", "[three] build/t: exited with code 1"]);
        assert!(data.get_test_list().is_empty());
        assert!(data.get_last_discovery().is_none());
    }

    #[test]
    fn test_refused_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let data = TestData::open(dir.path()).unwrap();
        let frameworks: Vec<Box<dyn TestFramework>> = vec![Box::new(Fixed { id: "fixed", result: good })];
        discover_tests(&data, &frameworks, false).unwrap();
        data.notify_run_started(&StartedRun { tests: vec![vec!["b".to_string()]] }).unwrap();

        assert!(matches!(discover_tests(&data, &frameworks, false), Err(Error::RunInProgress)));
        assert!(matches!(discover_tests(&data, &[], false), Err(Error::NoFrameworkConfigured)));
    }
}

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use chrono::Utc;
use testexplorer::data::{test_name_to_path, DiscoveredTest, TestData, TestItem, TestLocation, TestStatus};
use testexplorer::framework::{RunContext, TestFramework};
use testexplorer::parser::EventEmitter;
use testexplorer::Result;

pub const EXECUTABLE: &str = "E";

/// What a [`ScriptedFramework`] does when asked to run one id.
#[derive(Debug, Clone)]
pub enum Step {
    Pass,
    Fail(&'static str),
    /// Start the test, then raise the stop signal without finishing it.
    StartThenStop,
    Panic,
}

/// A framework whose tests and outcomes are fixed up front.
pub struct ScriptedFramework {
    pub id: String,
    pub tests: Vec<DiscoveredTest>,
    pub script: HashMap<String, Step>,
}

impl ScriptedFramework {
    pub fn new(id: &str, names: &[&str]) -> Self {
        Self {
            id: id.to_string(),
            tests: names.iter().map(|n| discovered(id, n)).collect(),
            script: HashMap::new(),
        }
    }

    pub fn with(mut self, run_id: &str, step: Step) -> Self {
        self.script.insert(run_id.to_string(), step);
        self
    }
}

impl TestFramework for ScriptedFramework {
    fn id(&self) -> &str {
        &self.id
    }

    fn discover(&self) -> Result<Vec<DiscoveredTest>> {
        Ok(self.tests.clone())
    }

    fn run(&self, grouped: &BTreeMap<String, Vec<String>>, ctx: RunContext<'_>) -> Result<()> {
        for (executable, ids) in grouped {
            let emitter = EventEmitter::new(ctx, &self.id, executable);
            for id in ids {
                if ctx.stop.is_stopped() {
                    return Ok(());
                }
                let Some(path) = emitter.lookup(id) else { continue };
                let step = self.script.get(id).cloned().unwrap_or(Step::Pass);
                if matches!(step, Step::Panic) {
                    panic!("scripted panic in {}", id);
                }
                emitter.started(&path);
                emitter.output(&path, &format!("running {}\n", id));
                match step {
                    Step::Pass => emitter.finished(&path, TestStatus::Passed, String::new()),
                    Step::Fail(message) => emitter.finished(&path, TestStatus::Failed, message.to_string()),
                    Step::StartThenStop => ctx.stop.stop(),
                    Step::Panic => unreachable!(),
                }
            }
        }
        Ok(())
    }
}

/// A test of `EXECUTABLE` whose run id is its last path segment.
pub fn discovered(framework_id: &str, name: &str) -> DiscoveredTest {
    let full_name = test_name_to_path(name);
    let id = full_name.last().cloned().unwrap_or_default();
    DiscoveredTest {
        full_name,
        framework_id: framework_id.to_string(),
        run_id: id.clone(),
        report_id: id,
        location: TestLocation { executable: EXECUTABLE.to_string(), file: "t.cpp".to_string(), line: 1 },
    }
}

pub fn open(dir: &Path) -> TestData {
    TestData::open(dir.join("data")).unwrap()
}

pub fn discover(data: &TestData, tests: Vec<DiscoveredTest>) {
    data.notify_discovered_tests(tests, Utc::now()).unwrap();
}

pub fn item(data: &TestData, name: &str) -> TestItem {
    data.get_test_list()
        .find(&test_name_to_path(name))
        .cloned()
        .unwrap_or_else(|| panic!("{} not in tree", name))
}

pub fn boxed(framework: ScriptedFramework) -> Vec<Box<dyn TestFramework>> {
    vec![Box::new(framework)]
}

/// Write an executable shell script.
#[cfg(unix)]
pub fn write_script(path: &Path, body: &str) {
    use std::os::unix::fs::PermissionsExt;

    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, body).unwrap();
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
}

/// A GoogleTest stand-in: lists `Suite.a`, `Suite.b` and `Suite.c`; when run,
/// `a` passes, `b` fails and `c` is skipped.
pub const FAKE_GTEST: &str = r#"#!/bin/sh
output=""
filter=""
list=0
for arg in "$@"; do
  case "$arg" in
    --gtest_list_tests) list=1 ;;
    --gtest_output=json:*) output="${arg#--gtest_output=json:}" ;;
    --gtest_filter=*) filter="${arg#--gtest_filter=}" ;;
  esac
done

if [ "$list" = 1 ]; then
  cat > "$output" <<'JSON'
{"tests": 3, "name": "AllTests", "testsuites": [
  {"name": "Suite", "tests": 3, "testsuite": [
    {"name": "a", "file": "src/t.cc", "line": 3},
    {"name": "b", "file": "src/t.cc", "line": 7},
    {"name": "c", "file": "src/t.cc", "line": 11}
  ]}
]}
JSON
  exit 0
fi

echo "[==========] Running tests."
for id in $(echo "$filter" | tr ':' ' '); do
  echo "[ RUN      ] $id"
  case "$id" in
    Suite.a) echo "[       OK ] $id (0 ms)" ;;
    Suite.b) echo "t.cc:8: Failure" >&2; echo "[  FAILED  ] $id (1 ms)" ;;
    Suite.c) echo "[  SKIPPED ] $id (0 ms)" ;;
  esac
done
echo "[==========] Done."
exit 1
"#;

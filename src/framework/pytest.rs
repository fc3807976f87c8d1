use std::collections::BTreeMap;
use std::ffi::OsString;

use serde::Deserialize;
use tempfile::TempDir;

use super::common::{discovery_error, FrameworkBase};
use super::{RunContext, TestFramework};
use crate::data::{DiscoveredTest, TestLocation};
use crate::parser::{EventEmitter, PytestParser};
use crate::process::{run_to_string, TestCommand};
use crate::{Error, Result};

const PLUGIN_SOURCE: &str = include_str!("pytest_plugin.py");
const PLUGIN_MODULE: &str = "testexplorer_pytest_plugin";

pub const DISCOVERY_HEADER: &str = "TEST_EXPLORER_DISCOVERY: ";

/// Exit code 5 means no tests were collected.
const PYTEST_SUCCESS_CODES: &[i32] = &[0, 5];

pub struct PytestFramework {
    base: FrameworkBase,
}

#[derive(Debug, Deserialize)]
struct DiscoveryReport {
    #[serde(default)]
    tests: Vec<CollectedTest>,
    #[serde(default)]
    errors: Vec<CollectionError>,
}

#[derive(Debug, Deserialize)]
struct CollectedTest {
    /// Node id relative to the working directory: `tests/test_x.py::Class::test`.
    name: String,
    file: String,
    line: u32,
}

#[derive(Debug, Deserialize)]
struct CollectionError {
    message: String,
}

/// The bundled plugin, written out for the lifetime of one pytest invocation.
struct Plugin {
    dir: TempDir,
}

impl Plugin {
    fn install() -> Result<Self> {
        let dir = tempfile::tempdir()?;
        std::fs::write(dir.path().join(format!("{}.py", PLUGIN_MODULE)), PLUGIN_SOURCE)?;
        Ok(Self { dir })
    }

    /// Add the plugin to `PYTEST_PLUGINS` and its directory to `PYTHONPATH`,
    /// keeping whatever the configuration or the environment already set.
    fn apply(&self, mut command: TestCommand) -> Result<TestCommand> {
        let plugins = command.env.get("PYTEST_PLUGINS").cloned().or_else(|| std::env::var("PYTEST_PLUGINS").ok());
        let plugins = match plugins.filter(|p| !p.is_empty()) {
            Some(existing) => format!("{},{}", existing, PLUGIN_MODULE),
            None => PLUGIN_MODULE.to_string(),
        };

        let python_path: OsString = command
            .env
            .get("PYTHONPATH")
            .map(OsString::from)
            .or_else(|| std::env::var_os("PYTHONPATH"))
            .unwrap_or_default();
        let mut paths: Vec<_> = std::env::split_paths(&python_path).filter(|p| !p.as_os_str().is_empty()).collect();
        paths.push(self.dir.path().to_path_buf());
        let python_path = std::env::join_paths(paths)
            .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e)))?;

        command.env.insert("PYTEST_PLUGINS".to_string(), plugins);
        command.env.insert("PYTHONPATH".to_string(), python_path.to_string_lossy().into_owned());
        Ok(command)
    }
}

impl PytestFramework {
    pub fn new(base: FrameworkBase) -> Self {
        Self { base }
    }

    fn pytest_command<I, S>(&self, args: I) -> TestCommand
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let pytest = ["-m".to_string(), "pytest".to_string()];
        self.base
            .command(self.base.config.python.clone(), pytest.into_iter().chain(args.into_iter().map(Into::into)))
    }

    fn parse_discovery(&self, stdout: &str) -> Result<Vec<DiscoveredTest>> {
        let json = stdout
            .lines()
            .find_map(|line| line.split_once(DISCOVERY_HEADER).map(|(_, json)| json))
            .ok_or_else(|| discovery_error("could not find test discovery data; pytest plugin compatibility issue?"))?;
        let report: DiscoveryReport =
            serde_json::from_str(json).map_err(|e| discovery_error(format!("invalid discovery data: {}", e)))?;

        if !report.errors.is_empty() {
            return Err(Error::discovery(report.errors.into_iter().map(|e| e.message).collect()));
        }
        Ok(report.tests.into_iter().map(|test| self.discovered(test)).collect())
    }

    fn discovered(&self, test: CollectedTest) -> DiscoveredTest {
        // The collecting file can differ from the defining one when tests are imported.
        let mut parts = test.name.split("::");
        let discovery_file = self.base.relative_file(parts.next().unwrap_or_default());
        let rest: Vec<String> = parts.map(str::to_string).collect();

        DiscoveredTest {
            full_name: self.base.make_path(&discovery_file, rest),
            framework_id: self.base.id().to_string(),
            run_id: test.name.clone(),
            report_id: test.name,
            location: TestLocation {
                executable: discovery_file,
                file: self.base.relative_file(&test.file),
                line: test.line,
            },
        }
    }
}

impl TestFramework for PytestFramework {
    fn id(&self) -> &str {
        self.base.id()
    }

    fn discover(&self) -> Result<Vec<DiscoveredTest>> {
        let plugin = Plugin::install()?;
        let command = plugin.apply(self.pytest_command(["--collect-only", "-q"]))?;
        let output = run_to_string(&command, PYTEST_SUCCESS_CODES)?;
        let tests = self.parse_discovery(&output.stdout)?;
        tracing::debug!("[{}] collected {} tests in {}", self.id(), tests.len(), self.base.working_directory().display());
        Ok(tests)
    }

    fn run(&self, grouped: &BTreeMap<String, Vec<String>>, ctx: RunContext<'_>) -> Result<()> {
        let plugin = Plugin::install()?;
        self.base.run_each(grouped, ctx, |executable, ids| {
            let command = plugin.apply(self.pytest_command(ids.iter().cloned()))?;
            let mut parser = PytestParser::new(EventEmitter::new(ctx, self.id(), executable));
            self.base.stream(&command, ctx, &mut parser)
        })
    }
}

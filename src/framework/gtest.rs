use std::collections::BTreeMap;

use serde::Deserialize;

use super::common::{discovery_error, FrameworkBase};
use super::{OutputFormat, RunContext, TestFramework};
use crate::data::{DiscoveredTest, TestLocation, TEST_SEPARATOR};
use crate::parser::{EventEmitter, GTestParser, OutputParser, TeamcityParser};
use crate::process::run_to_string;
use crate::Result;

const LIST_OUTPUT_FILE: &str = "output.json";

pub struct GTestFramework {
    base: FrameworkBase,
}

#[derive(Deserialize)]
struct GTestListing {
    #[serde(default)]
    testsuites: Vec<GTestSuite>,
}

#[derive(Deserialize)]
struct GTestSuite {
    name: String,
    #[serde(default)]
    testsuite: Vec<GTestCase>,
}

#[derive(Deserialize)]
struct GTestCase {
    name: String,
    #[serde(default)]
    file: String,
    #[serde(default)]
    line: u32,
    #[serde(default)]
    type_param: Option<String>,
    #[serde(default)]
    value_param: Option<String>,
}

/// `Prefix/Suite/0` with type `int` reads as `Prefix/Suite<int>`.
fn pretty_suite(suite: &str, type_param: Option<&str>) -> String {
    match type_param {
        Some(param) => {
            let head = suite.rsplit_once('/').map_or(suite, |(head, _)| head);
            format!("{}<{}>", head, param)
        }
        None => suite.to_string(),
    }
}

/// `Name/0` with value `42` reads as `Name[42]`.
fn pretty_name(name: &str, value_param: Option<&str>) -> String {
    match value_param {
        Some(param) => {
            let head = name.rsplit_once('/').map_or(name, |(head, _)| head);
            format!("{}[{}]", head, param)
        }
        None => name.to_string(),
    }
}

impl GTestFramework {
    pub fn new(base: FrameworkBase) -> Self {
        Self { base }
    }

    fn discover_executable(&self, executable: &str) -> Result<Vec<DiscoveredTest>> {
        let temp_dir = tempfile::tempdir()?;
        let output_file = temp_dir.path().join(LIST_OUTPUT_FILE);
        let command = self.base.executable_command(
            executable,
            ["--gtest_list_tests".to_string(), format!("--gtest_output=json:{}", output_file.display())],
        );
        run_to_string(&command, &[0])?;

        let content = std::fs::read_to_string(&output_file)
            .map_err(|e| discovery_error(format!("no test list written to {}: {}", output_file.display(), e)))?;
        self.parse_discovery(&content, executable)
    }

    fn parse_discovery(&self, json: &str, executable: &str) -> Result<Vec<DiscoveredTest>> {
        let listing: GTestListing =
            serde_json::from_str(json).map_err(|e| discovery_error(format!("invalid test list: {}", e)))?;

        let mut tests = Vec::new();
        for suite in listing.testsuites {
            for test in suite.testsuite {
                let suite_name = pretty_suite(&suite.name, test.type_param.as_deref());
                let rest = suite_name
                    .split(TEST_SEPARATOR)
                    .map(str::to_string)
                    .chain(std::iter::once(pretty_name(&test.name, test.value_param.as_deref())));
                let run_id = format!("{}.{}", suite.name, test.name);

                tests.push(DiscoveredTest {
                    full_name: self.base.make_path(executable, rest),
                    framework_id: self.base.id().to_string(),
                    report_id: run_id.clone(),
                    run_id,
                    location: TestLocation {
                        executable: executable.to_string(),
                        file: self.base.relative_file(&test.file),
                        line: test.line,
                    },
                });
            }
        }
        Ok(tests)
    }
}

impl TestFramework for GTestFramework {
    fn id(&self) -> &str {
        self.base.id()
    }

    fn discover(&self) -> Result<Vec<DiscoveredTest>> {
        self.base.discover_each(|executable| self.discover_executable(executable))
    }

    fn run(&self, grouped: &BTreeMap<String, Vec<String>>, ctx: RunContext<'_>) -> Result<()> {
        self.base.run_each(grouped, ctx, |executable, ids| {
            let command = self.base.executable_command(executable, [format!("--gtest_filter={}", ids.join(":"))]);
            let emitter = EventEmitter::new(ctx, self.id(), executable);
            let mut parser: Box<dyn OutputParser + '_> = match self.base.config.parser {
                OutputFormat::Default => Box::new(GTestParser::new(emitter)),
                OutputFormat::Teamcity => Box::new(TeamcityParser::new(emitter)),
            };
            self.base.stream(&command, ctx, parser.as_mut())
        })
    }
}

use std::collections::BTreeMap;

use quick_xml::events::Event;
use quick_xml::Reader;

use super::common::{discovery_error, FrameworkBase};
use super::{OutputFormat, RunContext, TestFramework};
use crate::data::{DiscoveredTest, TestLocation};
use crate::parser::structured::CATCH2;
use crate::parser::{EventEmitter, OutputParser, StructuredParser, TeamcityParser};
use crate::process::run_to_string;
use crate::Result;

pub struct Catch2Framework {
    base: FrameworkBase,
}

/// One `<TestCase>` of `--list-tests --reporter xml`.
#[derive(Debug, Default)]
struct ListedTest {
    name: String,
    class_name: String,
    file: String,
    line: String,
}

/// Escape a test name for use in a Catch2 test spec.
pub fn escape_test_name(name: &str) -> String {
    let mut escaped = String::with_capacity(name.len());
    for c in name.chars() {
        if matches!(c, '\\' | ',' | '[' | ']' | '*' | '"') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

impl Catch2Framework {
    pub fn new(base: FrameworkBase) -> Self {
        Self { base }
    }

    fn discover_executable(&self, executable: &str) -> Result<Vec<DiscoveredTest>> {
        let command = self.base.executable_command(executable, ["--list-tests", "--reporter", "xml"]);
        let output = run_to_string(&command, &[0])?;
        self.parse_discovery(&output.stdout, executable)
    }

    fn parse_discovery(&self, xml: &str, executable: &str) -> Result<Vec<DiscoveredTest>> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut tests = Vec::new();
        let mut current: Option<ListedTest> = None;
        let mut field: Option<String> = None;

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    let tag = String::from_utf8_lossy(e.name().as_ref()).into_owned();
                    if tag == "TestCase" {
                        current = Some(ListedTest::default());
                    }
                    field = Some(tag);
                }
                Ok(Event::Text(e)) => {
                    let (Some(test), Some(field)) = (current.as_mut(), field.as_deref()) else { continue };
                    let text = e
                        .unescape()
                        .map_err(|e| discovery_error(format!("invalid test list: {}", e)))?
                        .into_owned();
                    match field {
                        "Name" => test.name = text,
                        "ClassName" => test.class_name = text,
                        "File" => test.file = text,
                        "Line" => test.line = text,
                        _ => {}
                    }
                }
                Ok(Event::End(e)) => {
                    if e.name().as_ref() == b"TestCase" {
                        if let Some(test) = current.take() {
                            tests.push(self.discovered(test, executable)?);
                        }
                    }
                    field = None;
                }
                Ok(Event::Eof) => break,
                Err(e) => {
                    return Err(discovery_error(format!(
                        "invalid test list at position {}: {}",
                        reader.error_position(),
                        e
                    )))
                }
                _ => {}
            }
        }

        Ok(tests)
    }

    fn discovered(&self, test: ListedTest, executable: &str) -> Result<DiscoveredTest> {
        if test.name.is_empty() {
            return Err(discovery_error("test case without a name"));
        }
        let line = test
            .line
            .parse()
            .map_err(|_| discovery_error(format!("test case '{}' has invalid line '{}'", test.name, test.line)))?;

        let rest = (!test.class_name.is_empty())
            .then(|| test.class_name.clone())
            .into_iter()
            .chain(std::iter::once(test.name.clone()));

        Ok(DiscoveredTest {
            full_name: self.base.make_path(executable, rest),
            framework_id: self.base.id().to_string(),
            run_id: test.name.clone(),
            report_id: test.name,
            location: TestLocation {
                executable: executable.to_string(),
                file: self.base.relative_file(&test.file),
                line,
            },
        })
    }
}

impl TestFramework for Catch2Framework {
    fn id(&self) -> &str {
        self.base.id()
    }

    fn discover(&self) -> Result<Vec<DiscoveredTest>> {
        self.base.discover_each(|executable| self.discover_executable(executable))
    }

    fn run(&self, grouped: &BTreeMap<String, Vec<String>>, ctx: RunContext<'_>) -> Result<()> {
        self.base.run_each(grouped, ctx, |executable, ids| {
            let reporter = match self.base.config.parser {
                OutputFormat::Default => "xml",
                OutputFormat::Teamcity => "teamcity",
            };
            let filter = ids.iter().map(|id| escape_test_name(id)).collect::<Vec<_>>().join(",");
            let command = self.base.executable_command(executable, ["--reporter".to_string(), reporter.to_string(), filter]);

            let emitter = EventEmitter::new(ctx, self.id(), executable);
            let mut parser: Box<dyn OutputParser + '_> = match self.base.config.parser {
                OutputFormat::Default => Box::new(StructuredParser::new(&CATCH2, emitter, ids)),
                OutputFormat::Teamcity => Box::new(TeamcityParser::new(emitter)),
            };
            self.base.stream(&command, ctx, parser.as_mut())
        })
    }
}

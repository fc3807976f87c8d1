use std::collections::BTreeMap;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use super::common::{discovery_error, FrameworkBase};
use super::{RunContext, TestFramework};
use crate::data::{DiscoveredTest, TestLocation};
use crate::parser::structured::DOCTEST;
use crate::parser::{EventEmitter, StructuredParser};
use crate::process::run_to_string;
use crate::Result;

pub struct DoctestFramework {
    base: FrameworkBase,
}

/// Extract an attribute value from an XML element.
fn get_attr(e: &BytesStart, name: &str) -> String {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == name.as_bytes())
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
        .unwrap_or_default()
}

/// Doctest filters are comma separated and support `\,`.
fn escape_filter(name: &str) -> String {
    name.replace('\\', "\\\\").replace(',', "\\,")
}

impl DoctestFramework {
    pub fn new(base: FrameworkBase) -> Self {
        Self { base }
    }

    fn discover_executable(&self, executable: &str) -> Result<Vec<DiscoveredTest>> {
        let command = self.base.executable_command(executable, ["--reporters=xml", "--list-test-cases"]);
        let output = run_to_string(&command, &[0])?;
        self.parse_discovery(&output.stdout, executable)
    }

    fn parse_discovery(&self, xml: &str, executable: &str) -> Result<Vec<DiscoveredTest>> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut tests = Vec::new();
        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) | Ok(Event::Empty(e)) if e.name().as_ref() == b"TestCase" => {
                    tests.push(self.discovered(&e, executable)?);
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

    fn discovered(&self, e: &BytesStart, executable: &str) -> Result<DiscoveredTest> {
        let name = get_attr(e, "name");
        if name.is_empty() {
            return Err(discovery_error("test case without a name"));
        }
        let line = get_attr(e, "line");
        let line = line
            .parse()
            .map_err(|_| discovery_error(format!("test case '{}' has invalid line '{}'", name, line)))?;
        let suite = get_attr(e, "testsuite");

        let rest = (!suite.is_empty()).then_some(suite).into_iter().chain(std::iter::once(name.clone()));
        Ok(DiscoveredTest {
            full_name: self.base.make_path(executable, rest),
            framework_id: self.base.id().to_string(),
            run_id: name.clone(),
            report_id: name,
            location: TestLocation {
                executable: executable.to_string(),
                file: self.base.relative_file(&get_attr(e, "filename")),
                line,
            },
        })
    }
}

impl TestFramework for DoctestFramework {
    fn id(&self) -> &str {
        self.base.id()
    }

    fn discover(&self) -> Result<Vec<DiscoveredTest>> {
        self.base.discover_each(|executable| self.discover_executable(executable))
    }

    fn run(&self, grouped: &BTreeMap<String, Vec<String>>, ctx: RunContext<'_>) -> Result<()> {
        self.base.run_each(grouped, ctx, |executable, ids| {
            let filter = ids.iter().map(|id| escape_filter(id)).collect::<Vec<_>>().join(",");
            let command =
                self.base.executable_command(executable, ["--reporters=xml".to_string(), format!("--test-case={}", filter)]);
            let mut parser = StructuredParser::new(&DOCTEST, EventEmitter::new(ctx, self.id(), executable), ids);
            self.base.stream(&command, ctx, &mut parser)
        })
    }
}

//! Status lines printed by the bundled pytest plugin.

use serde::Deserialize;

use super::{EventEmitter, LineBuffer, OutputParser};
use crate::data::{merge_status, TestPath, TestStatus};
use crate::process::OutputSource;

pub const STATUS_HEADER: &str = "TEST_EXPLORER_STATUS: ";

#[derive(Debug, Deserialize)]
struct StatusLine {
    #[serde(default)]
    test: Option<String>,
    status: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    output: Option<String>,
}

struct Running {
    path: TestPath,
    status: Option<TestStatus>,
    message: String,
}

pub struct PytestParser<'a> {
    emitter: EventEmitter<'a>,
    lines: LineBuffer,
    current: Option<Running>,
}

impl<'a> PytestParser<'a> {
    pub fn new(emitter: EventEmitter<'a>) -> Self {
        Self { emitter, lines: LineBuffer::default(), current: None }
    }

    fn line(&mut self, line: &str) {
        tracing::debug!("[pytest] {}", line.trim_end());
        let Some(json) = line.trim_end().strip_prefix(STATUS_HEADER) else {
            if let Some(current) = &self.current {
                if !line.trim().is_empty() {
                    self.emitter.output(&current.path, line);
                }
            }
            return;
        };

        let status: StatusLine = match serde_json::from_str(json) {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!("[pytest] unreadable status line {:?}: {}", json, e);
                return;
            }
        };

        match status.status.as_str() {
            "started" => {
                let Some(id) = status.test.as_deref() else { return };
                self.current = self.emitter.lookup(id).map(|path| {
                    self.emitter.started(&path);
                    Running { path, status: None, message: String::new() }
                });
            }
            "finished" => {
                if let Some(current) = self.current.take() {
                    let status = current.status.unwrap_or(TestStatus::Failed);
                    self.emitter.finished(&current.path, status, current.message);
                }
            }
            outcome => {
                let Some(current) = self.current.as_mut() else { return };
                let outcome = match outcome {
                    "passed" => TestStatus::Passed,
                    "skipped" => TestStatus::Skipped,
                    "failed" => TestStatus::Failed,
                    other => {
                        tracing::warn!("[pytest] unknown outcome '{}'", other);
                        return;
                    }
                };
                current.status = merge_status(current.status, Some(outcome));
                if let Some(output) = status.output.filter(|o| !o.is_empty()) {
                    self.emitter.output(&current.path, &output);
                }
                if let Some(message) = status.message.filter(|m| !m.is_empty()) {
                    if !current.message.is_empty() {
                        current.message.push('\n');
                    }
                    current.message.push_str(&message);
                }
            }
        }
    }
}

impl OutputParser for PytestParser<'_> {
    fn feed(&mut self, source: OutputSource, chunk: &str) {
        match source {
            OutputSource::Stdout => {
                for line in self.lines.push(chunk) {
                    self.line(&line);
                }
            }
            OutputSource::Stderr => {
                if let Some(current) = &self.current {
                    self.emitter.output(&current.path, chunk);
                }
            }
        }
    }

    fn finish(&mut self) {
        if let Some(rest) = self.lines.flush() {
            self.line(&rest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::StopSignal;
    use crate::parser::testing::{context, output_of, tree, Recorded, Recorder};

    const A: &str = "tests/test_math.py::test_add";
    const B: &str = "tests/test_math.py::TestDiv::test_zero";

    fn run(stdout: &str) -> Vec<Recorded> {
        let recorder = Recorder::default();
        let list = tree(
            "pytest",
            "tests/test_math.py",
            &[("tests/test_math.py/test_add", A), ("tests/test_math.py/TestDiv/test_zero", B)],
        );
        let stop = StopSignal::new();
        let mut parser =
            PytestParser::new(EventEmitter::new(context(&recorder, &list, &stop), "pytest", "tests/test_math.py"));
        parser.feed(OutputSource::Stdout, stdout);
        parser.finish();
        recorder.take()
    }

    fn status(test: Option<&str>, status: &str, message: Option<&str>) -> String {
        let mut value = serde_json::json!({ "status": status });
        if let Some(test) = test {
            value["test"] = test.into();
        }
        if let Some(message) = message {
            value["message"] = message.into();
        }
        format!("\n{}{}\n", STATUS_HEADER, value)
    }

    #[test]
    fn test_outcomes_merge_by_severity() {
        let out = [
            status(Some(A), "started", None),
            status(None, "passed", None),
            status(None, "failed", Some("teardown exploded")),
            status(Some(A), "finished", None),
            status(Some(B), "started", None),
            "some stray print\n".to_string(),
            status(None, "skipped", Some("Skipped: not on linux")),
            status(Some(B), "finished", None),
        ]
        .concat();
        let events = run(&out);

        assert!(events.contains(&Recorded::Finished(
            "tests/test_math.py/test_add".to_string(),
            TestStatus::Failed,
            "teardown exploded".to_string()
        )));
        assert!(events.contains(&Recorded::Finished(
            "tests/test_math.py/TestDiv/test_zero".to_string(),
            TestStatus::Skipped,
            "Skipped: not on linux".to_string()
        )));
        assert_eq!(output_of(&events, "tests/test_math.py/TestDiv/test_zero"), "some stray print\n");
    }

    #[test]
    fn test_finished_without_outcome_is_failure() {
        let out = [status(Some(A), "started", None), status(Some(A), "finished", None)].concat();
        let events = run(&out);
        assert_eq!(
            events.last(),
            Some(&Recorded::Finished("tests/test_math.py/test_add".to_string(), TestStatus::Failed, String::new()))
        );
    }

    #[test]
    fn test_unknown_node_is_ignored() {
        let out = [
            status(Some("other.py::test_x"), "started", None),
            status(None, "passed", None),
            status(Some("other.py::test_x"), "finished", None),
        ]
        .concat();
        assert!(run(&out).is_empty());
    }
}

//! Streaming result parsers.
//!
//! A parser is fed the output of one running test executable chunk by chunk
//! and turns it into started/output/finished notifications for the tests it
//! can resolve through the run-id index. Nothing here waits for the process
//! to exit before reporting.

pub mod gtest;
pub mod pytest;
pub mod structured;
pub mod teamcity;
pub mod xml;

use crate::data::{FinishedTest, StartedTest, TestOutput, TestPath, TestStatus};
use crate::framework::RunContext;
use crate::process::OutputSource;

pub use gtest::GTestParser;
pub use pytest::PytestParser;
pub use structured::{StructuredParser, XmlDialect};
pub use teamcity::TeamcityParser;

pub trait OutputParser {
    /// Consume the next piece of output. Chunks need not be line-aligned.
    fn feed(&mut self, source: OutputSource, chunk: &str);

    /// Called once after the process exited.
    fn finish(&mut self) {}
}

/// Reports lifecycle events for one executable of one framework.
///
/// Registry failures are logged and swallowed: a bad event must not abort the
/// rest of the stream.
pub struct EventEmitter<'a> {
    ctx: RunContext<'a>,
    framework_id: String,
    executable: String,
}

impl<'a> EventEmitter<'a> {
    pub fn new(ctx: RunContext<'a>, framework_id: &str, executable: &str) -> Self {
        Self {
            ctx,
            framework_id: framework_id.to_string(),
            executable: executable.to_string(),
        }
    }

    /// Resolve a streamed id to its tree path.
    pub fn lookup(&self, report_id: &str) -> Option<TestPath> {
        let path = self
            .ctx
            .tests
            .find_by_report_id(&self.framework_id, &self.executable, report_id)
            .cloned();
        if path.is_none() {
            tracing::debug!("[{}] no test registered for '{}' in {}", self.framework_id, report_id, self.executable);
        }
        path
    }

    pub fn started(&self, path: &TestPath) {
        tracing::info!("started {}", path.join("/"));
        if let Err(e) = self.ctx.events.notify_test_started(StartedTest::new(path.clone())) {
            tracing::warn!("Failed to record start of {}: {}", path.join("/"), e);
        }
    }

    pub fn output(&self, path: &TestPath, text: &str) {
        if text.is_empty() {
            return;
        }
        let output = TestOutput { path: path.clone(), text: text.to_string() };
        if let Err(e) = self.ctx.events.notify_test_output(output) {
            tracing::warn!("Failed to record output of {}: {}", path.join("/"), e);
        }
    }

    pub fn finished(&self, path: &TestPath, status: TestStatus, message: String) {
        tracing::info!("finished {} ({})", path.join("/"), status);
        let finished = FinishedTest::new(path.clone(), status).with_message(message);
        if let Err(e) = self.ctx.events.notify_test_finished(finished) {
            tracing::warn!("Failed to record result of {}: {}", path.join("/"), e);
        }
    }
}

/// Splits a chunked stream into complete lines, newline included.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: String,
}

impl LineBuffer {
    pub fn push(&mut self, chunk: &str) -> Vec<String> {
        self.pending.push_str(chunk);
        let Some(last) = self.pending.rfind('\n') else {
            return Vec::new();
        };
        let rest = self.pending.split_off(last + 1);
        let complete = std::mem::replace(&mut self.pending, rest);
        complete.split_inclusive('\n').map(str::to_string).collect()
    }

    /// Whatever is left after the last newline.
    pub fn flush(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut self.pending))
        }
    }
}

/// `text` centered in a 64-column rule of `=`.
pub fn make_header(text: &str) -> String {
    const WIDTH: usize = 64;
    let remaining = WIDTH.saturating_sub(text.chars().count() + 2);
    let left = remaining / 2;
    format!("{} {} {}", "=".repeat(left), text, "=".repeat(remaining - left))
}

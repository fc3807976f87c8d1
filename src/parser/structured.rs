//! State machine for XML reporters (Catch2 `--reporter xml`, doctest `--reporters=xml`).
//!
//! Tags listed as controlled carry structured data (expression operands,
//! exception messages) and are rendered into result blocks. Text inside any
//! other tag is user output and is forwarded to the current test when that
//! tag closes or a child tag opens.

use std::collections::HashSet;

use super::xml::{XmlElement, XmlToken, XmlTokenizer};
use super::{make_header, EventEmitter, OutputParser};
use crate::data::{TestPath, TestStatus};
use crate::process::OutputSource;

/// Tag and attribute names of one reporter flavour.
#[derive(Debug)]
pub struct XmlDialect {
    pub name: &'static str,
    pub test_case: &'static str,
    pub section: &'static str,
    pub controlled: &'static [&'static str],
    /// Attribute on the test case marking it as skipped without running.
    pub skipped_attr: Option<&'static str>,
    pub result: &'static str,
    pub result_success_attr: &'static str,
    /// Attribute on the result element counting skips.
    pub result_skips_attr: Option<&'static str>,
    pub fatal: Option<&'static str>,
    pub failure: Option<&'static str>,
    pub skip: Option<&'static str>,
    /// Attribute on `Exception` flagging a crash.
    pub crash_attr: Option<&'static str>,
}

pub const CATCH2: XmlDialect = XmlDialect {
    name: "catch2",
    test_case: "TestCase",
    section: "Section",
    controlled: &["Original", "Expanded", "Exception", "FatalErrorCondition", "Info", "Failure", "Skip"],
    skipped_attr: None,
    result: "OverallResult",
    result_success_attr: "success",
    result_skips_attr: Some("skips"),
    fatal: Some("FatalErrorCondition"),
    failure: Some("Failure"),
    skip: Some("Skip"),
    crash_attr: None,
};

pub const DOCTEST: XmlDialect = XmlDialect {
    name: "doctest",
    test_case: "TestCase",
    section: "SubCase",
    controlled: &["Original", "Expanded", "Exception", "Info"],
    skipped_attr: Some("skipped"),
    result: "OverallResultsAsserts",
    result_success_attr: "test_case_success",
    result_skips_attr: None,
    fatal: None,
    failure: None,
    skip: None,
    crash_attr: Some("crash"),
};

const EXPRESSION: &str = "Expression";
const ORIGINAL: &str = "Original";
const EXPANDED: &str = "Expanded";
const INFO: &str = "Info";
const EXCEPTION: &str = "Exception";

#[derive(Debug, Default)]
struct CurrentTest {
    path: TestPath,
    success: Option<bool>,
    skipped: bool,
    crashed: bool,
}

impl CurrentTest {
    fn status(&self) -> TestStatus {
        if self.crashed {
            TestStatus::Crashed
        } else if self.skipped {
            TestStatus::Skipped
        } else {
            match self.success {
                Some(true) => TestStatus::Passed,
                Some(false) | None => TestStatus::Failed,
            }
        }
    }
}

#[derive(Debug, Default)]
struct Expression {
    kind: String,
    success: bool,
    location: Option<String>,
    original: String,
    expanded: String,
}

/// An `Exception`/`Failure`/`Skip`/fatal element being read.
#[derive(Debug)]
struct Message {
    header: &'static str,
    location: Option<String>,
}

pub struct StructuredParser<'a> {
    dialect: &'static XmlDialect,
    emitter: EventEmitter<'a>,
    requested: HashSet<String>,
    tokenizer: XmlTokenizer,
    stack: Vec<String>,
    text: String,
    /// Stack depth of an ignored test case; everything inside is dropped.
    ignore_depth: Option<usize>,
    current: Option<CurrentTest>,
    sections: Vec<String>,
    infos: Vec<String>,
    expression: Option<Expression>,
    message: Option<Message>,
}

impl<'a> StructuredParser<'a> {
    pub fn new(dialect: &'static XmlDialect, emitter: EventEmitter<'a>, requested: &[String]) -> Self {
        Self {
            dialect,
            emitter,
            requested: requested.iter().cloned().collect(),
            tokenizer: XmlTokenizer::new(),
            stack: Vec::new(),
            text: String::new(),
            ignore_depth: None,
            current: None,
            sections: Vec::new(),
            infos: Vec::new(),
            expression: None,
            message: None,
        }
    }

    fn drain(&mut self) {
        while let Some(token) = self.tokenizer.next_token() {
            match token {
                XmlToken::Start(element) => self.start(&element),
                XmlToken::Empty(element) => {
                    self.start(&element);
                    self.end(&element.name);
                }
                XmlToken::End(name) => self.end(&name),
                XmlToken::Text(text) => {
                    if self.ignore_depth.is_none() {
                        self.text.push_str(&text);
                    }
                }
            }
        }
    }

    fn is_controlled(&self, tag: &str) -> bool {
        self.dialect.controlled.contains(&tag)
    }

    fn start(&mut self, element: &XmlElement) {
        if self.ignore_depth.is_some() {
            self.stack.push(element.name.clone());
            return;
        }

        if self.stack.last().is_some_and(|parent| !self.is_controlled(parent)) {
            self.flush_text();
        }
        self.text.clear();
        self.stack.push(element.name.clone());

        let name = element.name.as_str();
        if name == self.dialect.test_case {
            self.start_test_case(element);
        } else if self.current.is_none() {
            // Run-level elements outside any test case.
        } else if name == self.dialect.section {
            self.sections.push(element.attr("name").unwrap_or_default().to_string());
        } else if name == EXPRESSION {
            self.expression = Some(Expression {
                kind: element.attr("type").unwrap_or_default().to_string(),
                success: element.attr("success") != Some("false"),
                location: location(element),
                ..Default::default()
            });
        } else if name == self.dialect.result {
            self.read_result(element);
        } else if let Some(header) = self.message_header(element) {
            self.message = Some(Message { header, location: location(element) });
        }
    }

    fn start_test_case(&mut self, element: &XmlElement) {
        let id = element.attr("name").unwrap_or_default();
        let path = if self.requested.contains(id) { self.emitter.lookup(id) } else { None };
        let Some(path) = path else {
            tracing::debug!("[{}] ignoring test case '{}' not requested in this run", self.dialect.name, id);
            self.ignore_depth = Some(self.stack.len());
            return;
        };

        let skipped = self
            .dialect
            .skipped_attr
            .and_then(|attr| element.attr(attr))
            .is_some_and(|v| v == "true");
        self.emitter.started(&path);
        if skipped {
            self.emitter.finished(&path, TestStatus::Skipped, String::new());
            self.ignore_depth = Some(self.stack.len());
            return;
        }

        self.sections.clear();
        self.infos.clear();
        self.current = Some(CurrentTest { path, ..Default::default() });
    }

    fn read_result(&mut self, element: &XmlElement) {
        let Some(current) = self.current.as_mut() else { return };
        if let Some(success) = element.attr(self.dialect.result_success_attr) {
            current.success = Some(success == "true");
        }
        let skips = self
            .dialect
            .result_skips_attr
            .and_then(|attr| element.attr(attr))
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0);
        if skips > 0 {
            current.skipped = true;
        }
    }

    fn message_header(&mut self, element: &XmlElement) -> Option<&'static str> {
        let name = element.name.as_str();
        let current = self.current.as_mut()?;
        if name == EXCEPTION {
            let crashed = self
                .dialect
                .crash_attr
                .and_then(|attr| element.attr(attr))
                .is_some_and(|v| v == "true");
            if crashed {
                current.crashed = true;
                return Some("CRASH");
            }
            return Some("EXCEPTION");
        }
        if Some(name) == self.dialect.fatal {
            current.crashed = true;
            return Some("CRASH");
        }
        if Some(name) == self.dialect.failure {
            return Some("FAIL");
        }
        if Some(name) == self.dialect.skip {
            current.skipped = true;
            return Some("SKIP");
        }
        None
    }

    fn end(&mut self, name: &str) {
        if let Some(depth) = self.ignore_depth {
            if self.stack.len() == depth {
                self.ignore_depth = None;
            }
            self.stack.pop();
            self.text.clear();
            return;
        }

        let text = if self.is_controlled(name) {
            std::mem::take(&mut self.text).trim().to_string()
        } else {
            self.flush_text();
            String::new()
        };
        self.stack.pop();

        if name == self.dialect.test_case {
            self.finish_test_case();
            return;
        }
        if self.current.is_none() {
            return;
        }

        if name == self.dialect.section {
            self.sections.pop();
        } else if name == ORIGINAL {
            if let Some(expression) = self.expression.as_mut() {
                expression.original = text;
            }
        } else if name == EXPANDED {
            if let Some(expression) = self.expression.as_mut() {
                expression.expanded = text;
            }
        } else if name == INFO {
            if !text.is_empty() {
                self.infos.push(text);
            }
        } else if name == EXPRESSION {
            if let Some(expression) = self.expression.take() {
                self.render_expression(expression);
            }
        } else if self.message.is_some() && self.is_controlled(name) {
            if let Some(message) = self.message.take() {
                let block = self.render_block(message.header, message.location.as_deref(), &[text]);
                self.emit_block(block);
            }
        }
    }

    fn finish_test_case(&mut self) {
        let Some(current) = self.current.take() else { return };
        self.emitter.finished(&current.path, current.status(), String::new());
        self.sections.clear();
        self.infos.clear();
        self.expression = None;
        self.message = None;
    }

    /// Forward buffered text of a non-controlled tag as output.
    fn flush_text(&mut self) {
        let text = std::mem::take(&mut self.text);
        let Some(current) = &self.current else { return };
        if text.trim().is_empty() {
            return;
        }

        // Drop the newline after the opening tag and the indentation before the closing one.
        let text = text.strip_prefix('\n').unwrap_or(&text);
        let text = text.trim_end_matches([' ', '\t']);
        let mut output = text.to_string();
        if !output.ends_with('\n') {
            output.push('\n');
        }
        self.emitter.output(&current.path, &output);
    }

    fn render_expression(&mut self, expression: Expression) {
        let header = if expression.success { "PASS" } else { "FAIL" };
        let mut lines = Vec::new();
        if !expression.original.is_empty() {
            lines.push(format!("expected: {}( {} )", expression.kind, expression.original));
        }
        if !expression.expanded.is_empty() {
            lines.push(format!("actual:   {}", expression.expanded));
        }
        let block = self.render_block(header, expression.location.as_deref(), &lines);
        self.emit_block(block);
    }

    fn render_block(&self, header: &str, location: Option<&str>, body: &[String]) -> String {
        let mut block = make_header(header);
        block.push('\n');
        if let Some(location) = location {
            block.push_str(location);
            block.push('\n');
        }
        for section in &self.sections {
            block.push_str(&format!("section: {}\n", section));
        }
        for info in &self.infos {
            block.push_str(&format!("info: {}\n", info));
        }
        for line in body.iter().filter(|l| !l.is_empty()) {
            block.push_str(line);
            block.push('\n');
        }
        block
    }

    fn emit_block(&mut self, block: String) {
        if let Some(current) = &self.current {
            self.emitter.output(&current.path, &block);
        }
        self.infos.clear();
    }
}

fn location(element: &XmlElement) -> Option<String> {
    let file = element.attr("filename")?;
    match element.attr("line") {
        Some(line) => Some(format!("{}:{}", file, line)),
        None => Some(file.to_string()),
    }
}

impl OutputParser for StructuredParser<'_> {
    fn feed(&mut self, source: OutputSource, chunk: &str) {
        match source {
            OutputSource::Stdout => {
                tracing::debug!("[{}] {}", self.dialect.name, chunk.trim_end());
                self.tokenizer.push(chunk);
                self.drain();
            }
            OutputSource::Stderr => {
                if let Some(current) = &self.current {
                    self.emitter.output(&current.path, chunk);
                }
            }
        }
    }

    fn finish(&mut self) {
        self.tokenizer.finish();
        self.drain();
        if let Some(current) = &self.current {
            tracing::warn!(
                "[{}] output ended while {} was still running",
                self.dialect.name,
                current.path.join("/")
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::StopSignal;
    use crate::parser::testing::{context, output_of, tree, Recorded, Recorder};

    fn run(dialect: &'static XmlDialect, tests: &[(&str, &str)], requested: &[&str], chunks: &[&str]) -> Vec<Recorded> {
        let recorder = Recorder::default();
        let list = tree(dialect.name, "build/t", tests);
        let stop = StopSignal::new();
        let ctx = context(&recorder, &list, &stop);
        let requested: Vec<String> = requested.iter().map(|s| s.to_string()).collect();
        let mut parser = StructuredParser::new(dialect, EventEmitter::new(ctx, dialect.name, "build/t"), &requested);
        for chunk in chunks {
            parser.feed(OutputSource::Stdout, chunk);
        }
        parser.finish();
        recorder.take()
    }

    const CATCH2_RUN: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<Catch2TestRun name="t" rng-seed="1" catch2-version="3.5.0">
  <TestCase name="Addition" tags="[math]" filename="/src/t.cpp" line="5">
    <Section name="positive" filename="/src/t.cpp" line="7">
      <Info>
        x := 2
      </Info>
      <Expression success="false" type="REQUIRE" filename="/src/t.cpp" line="9">
        <Original>
          x + 1 == 4
        </Original>
        <Expanded>
          3 == 4
        </Expanded>
      </Expression>
      <OverallResults successes="0" failures="1" expectedFailures="0" skipped="false"/>
    </Section>
    <OverallResult success="false" skips="0">
      <StdOut>
hello from test
      </StdOut>
    </OverallResult>
  </TestCase>
  <TestCase name="Other" filename="/src/t.cpp" line="20">
    <OverallResult success="true" skips="0"/>
  </TestCase>
  <TestCase name="Crashy" filename="/src/t.cpp" line="30">
    <FatalErrorCondition filename="/src/t.cpp" line="31">
      SIGSEGV - Segmentation violation signal
    </FatalErrorCondition>
    <OverallResult success="false"/>
  </TestCase>
  <OverallResults successes="1" failures="2" expectedFailures="0" skips="0"/>
</Catch2TestRun>
"#;

    #[test]
    fn test_catch2_failure_block_and_output() {
        let events = run(
            &CATCH2,
            &[("t/Addition", "Addition"), ("t/Other", "Other"), ("t/Crashy", "Crashy")],
            &["Addition", "Crashy"],
            &[CATCH2_RUN],
        );

        assert_eq!(events.first(), Some(&Recorded::Started("t/Addition".to_string())));
        assert!(events.contains(&Recorded::Finished("t/Addition".to_string(), TestStatus::Failed, String::new())));
        assert!(events.contains(&Recorded::Finished("t/Crashy".to_string(), TestStatus::Crashed, String::new())));
        assert!(!events.iter().any(|e| matches!(e, Recorded::Started(n) if n == "t/Other")));

        let output = output_of(&events, "t/Addition");
        let expected_block = format!(
            "{}\n/src/t.cpp:9\nsection: positive\ninfo: x := 2\nexpected: REQUIRE( x + 1 == 4 )\nactual:   3 == 4\n",
            make_header("FAIL")
        );
        assert!(output.contains(&expected_block), "got:\n{output}");
        assert!(output.contains("hello from test\n"));
        assert!(!output.contains("<Original>"));

        let crash = output_of(&events, "t/Crashy");
        assert!(crash.starts_with(&make_header("CRASH")));
        assert!(crash.contains("SIGSEGV - Segmentation violation signal\n"));
    }

    #[test]
    fn test_chunking_does_not_change_events() {
        let tests = [("t/Addition", "Addition"), ("t/Other", "Other"), ("t/Crashy", "Crashy")];
        let requested = ["Addition", "Other", "Crashy"];
        let whole = run(&CATCH2, &tests, &requested, &[CATCH2_RUN]);

        let bytes: Vec<String> = CATCH2_RUN.chars().map(String::from).collect();
        let bytes: Vec<&str> = bytes.iter().map(String::as_str).collect();
        let split = run(&CATCH2, &tests, &requested, &bytes);

        let statuses = |events: &[Recorded]| -> Vec<Recorded> {
            events.iter().filter(|e| !matches!(e, Recorded::Output(..))).cloned().collect()
        };
        assert_eq!(statuses(&whole), statuses(&split));
        for name in ["t/Addition", "t/Crashy"] {
            assert_eq!(output_of(&whole, name), output_of(&split, name));
        }
    }

    #[test]
    fn test_unrequested_test_case_is_ignored() {
        let doc = r#"<Catch2TestRun>
  <TestCase name="x" filename="/src/t.cpp" line="1">
    <Expression success="false" type="CHECK" filename="/src/t.cpp" line="2">
      <Original>a</Original>
      <Expanded>b</Expanded>
    </Expression>
    <OverallResult success="false"/>
  </TestCase>
</Catch2TestRun>"#;
        let events = run(&CATCH2, &[("t/x", "x"), ("t/y", "y")], &["y"], &[doc]);
        assert!(events.is_empty(), "unexpected events: {events:?}");
    }

    #[test]
    fn test_catch2_skip() {
        let doc = r#"<Catch2TestRun>
  <TestCase name="later" filename="/src/t.cpp" line="1">
    <Skip filename="/src/t.cpp" line="2">
      not ready
    </Skip>
    <OverallResult success="true" skips="1"/>
  </TestCase>
</Catch2TestRun>"#;
        let events = run(&CATCH2, &[("t/later", "later")], &["later"], &[doc]);
        assert!(events.contains(&Recorded::Finished("t/later".to_string(), TestStatus::Skipped, String::new())));
        assert!(output_of(&events, "t/later").contains("not ready"));
    }

    #[test]
    fn test_missing_result_is_failure() {
        let doc = r#"<Catch2TestRun><TestCase name="a" filename="f" line="1"></TestCase></Catch2TestRun>"#;
        let events = run(&CATCH2, &[("t/a", "a")], &["a"], &[doc]);
        assert_eq!(events.last(), Some(&Recorded::Finished("t/a".to_string(), TestStatus::Failed, String::new())));
    }

    #[test]
    fn test_truncated_stream_leaves_test_open() {
        let doc = r#"<Catch2TestRun><TestCase name="a" filename="f" line="1"><Expression success="true" type="CHECK" filename="f" line="2"><Original>"#;
        let events = run(&CATCH2, &[("t/a", "a")], &["a"], &[doc]);
        assert_eq!(events, vec![Recorded::Started("t/a".to_string())]);
    }

    const DOCTEST_RUN: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<doctest binary="build/t">
  <Options order_by="file" rand_seed="0" first="0" last="4294967295" abort_after="0" subcase_filter_levels="2147483647" case_sensitive="false" no_throw="false" no_skip="false"/>
  <TestSuite name="math">
    <TestCase name="adds" filename="t.cpp" line="4">
      <SubCase name="small" filename="t.cpp" line="5">
        <Expression success="false" type="CHECK" filename="t.cpp" line="6">
          <Original>
            add(1, 1) == 3
          </Original>
          <Expanded>
            2 == 3
          </Expanded>
        </Expression>
      </SubCase>
      <OverallResultsAsserts successes="0" failures="1" test_case_success="false"/>
    </TestCase>
    <TestCase name="throws" filename="t.cpp" line="10">
      <Exception crash="false">
        bad thing
      </Exception>
      <OverallResultsAsserts successes="0" failures="0" test_case_success="false"/>
    </TestCase>
  </TestSuite>
  <TestCase name="filtered" filename="t.cpp" line="20" skipped="true"/>
  <TestCase name="wanted_skip" filename="t.cpp" line="25" skipped="true"/>
  <TestCase name="fine" filename="t.cpp" line="30">
    <OverallResultsAsserts successes="2" failures="0" test_case_success="true"/>
  </TestCase>
  <OverallResultsAsserts successes="2" failures="1"/>
  <OverallResultsTestCases unskipped="3" skipped="2"/>
</doctest>
"#;

    #[test]
    fn test_doctest_run() {
        let tests = [
            ("math/adds", "adds"),
            ("math/throws", "throws"),
            ("filtered", "filtered"),
            ("wanted_skip", "wanted_skip"),
            ("fine", "fine"),
        ];
        let events = run(&DOCTEST, &tests, &["adds", "throws", "wanted_skip", "fine"], &[DOCTEST_RUN]);

        let finished: Vec<(String, TestStatus)> = events
            .iter()
            .filter_map(|e| match e {
                Recorded::Finished(name, status, _) => Some((name.clone(), *status)),
                _ => None,
            })
            .collect();
        assert_eq!(
            finished,
            vec![
                ("math/adds".to_string(), TestStatus::Failed),
                ("math/throws".to_string(), TestStatus::Failed),
                ("wanted_skip".to_string(), TestStatus::Skipped),
                ("fine".to_string(), TestStatus::Passed),
            ]
        );
        assert!(!events.iter().any(|e| matches!(e, Recorded::Started(n) if n == "filtered")));

        let adds = output_of(&events, "math/adds");
        assert!(adds.contains("section: small\n"));
        assert!(adds.contains("expected: CHECK( add(1, 1) == 3 )\n"));
        let throws = output_of(&events, "math/throws");
        assert!(throws.starts_with(&make_header("EXCEPTION")));
        assert!(throws.contains("bad thing\n"));
    }

    #[test]
    fn test_doctest_crash() {
        let doc = r#"<doctest><TestCase name="boom" filename="t.cpp" line="1"><Exception crash="true">SIGSEGV</Exception></TestCase></doctest>"#;
        let events = run(&DOCTEST, &[("boom", "boom")], &["boom"], &[doc]);
        assert_eq!(events.last(), Some(&Recorded::Finished("boom".to_string(), TestStatus::Crashed, String::new())));
    }
}

//! TeamCity service messages (`##teamcity[testStarted name='...']`).

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;

use super::{EventEmitter, LineBuffer, OutputParser};
use crate::data::{TestPath, TestStatus};
use crate::process::OutputSource;

static MESSAGE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*##teamcity\[(\w+)((?:\s+[\w.]+='(?:[^'|]|\|.)*')*)\s*\]\s*$").unwrap());

static ATTR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"([\w.]+)='((?:[^'|]|\|.)*)'").unwrap());

/// Undo TeamCity's `|` escaping.
pub fn unescape(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c != '|' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('x') => out.push('\u{0085}'),
            Some('l') => out.push('\u{2028}'),
            Some('p') => out.push('\u{2029}'),
            Some('0') => {
                let code: String = chars.by_ref().take(5).collect();
                let decoded = code
                    .strip_prefix('x')
                    .and_then(|hex| u32::from_str_radix(hex, 16).ok())
                    .and_then(char::from_u32);
                match decoded {
                    Some(decoded) => out.push(decoded),
                    None => {
                        out.push_str("|0");
                        out.push_str(&code);
                    }
                }
            }
            Some(other) => out.push(other),
            None => out.push('|'),
        }
    }
    out
}

struct Running {
    path: TestPath,
    status: TestStatus,
    message: String,
}

pub struct TeamcityParser<'a> {
    emitter: EventEmitter<'a>,
    lines: LineBuffer,
    running: HashMap<String, Running>,
    /// Most recently started test, receiving plain output lines.
    last: Option<String>,
}

impl<'a> TeamcityParser<'a> {
    pub fn new(emitter: EventEmitter<'a>) -> Self {
        Self { emitter, lines: LineBuffer::default(), running: HashMap::new(), last: None }
    }

    fn line(&mut self, line: &str) {
        tracing::debug!("[teamcity] {}", line.trim_end());
        let Some(captures) = MESSAGE_RE.captures(line.trim_end()) else {
            if let Some(test) = self.last.as_ref().and_then(|name| self.running.get(name)) {
                self.emitter.output(&test.path, line);
            }
            return;
        };

        let kind = captures.get(1).map_or("", |m| m.as_str());
        let attrs: HashMap<&str, String> = captures
            .get(2)
            .map(|m| {
                ATTR_RE
                    .captures_iter(m.as_str())
                    .filter_map(|c| Some((c.get(1)?.as_str(), unescape(c.get(2)?.as_str()))))
                    .collect()
            })
            .unwrap_or_default();
        let Some(name) = attrs.get("name").cloned() else { return };

        match kind {
            "testStarted" => self.start(&name),
            "testFailed" => {
                if let Some(test) = self.running.get_mut(&name) {
                    test.status = test.status.merge(TestStatus::Failed);
                    let message = attrs.get("message").map(String::as_str).unwrap_or_default();
                    let details = attrs.get("details").map(String::as_str).unwrap_or_default();
                    test.message = [message, details]
                        .into_iter()
                        .filter(|s| !s.is_empty())
                        .collect::<Vec<_>>()
                        .join("\n");
                }
            }
            "testIgnored" => {
                // Catch2 reports ignored tests between their own start and finish.
                let started = self.running.contains_key(&name);
                if !started {
                    self.start(&name);
                }
                if let Some(test) = self.running.get_mut(&name) {
                    test.status = TestStatus::Skipped;
                    test.message = attrs.get("message").cloned().unwrap_or_default();
                }
                if !started {
                    self.finish_test(&name);
                }
            }
            "testStdOut" | "testStdErr" => {
                if let (Some(test), Some(out)) = (self.running.get(&name), attrs.get("out")) {
                    let mut out = out.clone();
                    if !out.ends_with('\n') {
                        out.push('\n');
                    }
                    self.emitter.output(&test.path, &out);
                }
            }
            "testFinished" => self.finish_test(&name),
            _ => {}
        }
    }

    fn start(&mut self, name: &str) {
        let Some(path) = self.emitter.lookup(name) else { return };
        self.emitter.started(&path);
        self.running
            .insert(name.to_string(), Running { path, status: TestStatus::Passed, message: String::new() });
        self.last = Some(name.to_string());
    }

    fn finish_test(&mut self, name: &str) {
        let Some(test) = self.running.remove(name) else { return };
        self.emitter.finished(&test.path, test.status, test.message);
        if self.last.as_deref() == Some(name) {
            self.last = None;
        }
    }
}

impl OutputParser for TeamcityParser<'_> {
    fn feed(&mut self, source: OutputSource, chunk: &str) {
        match source {
            OutputSource::Stdout => {
                for line in self.lines.push(chunk) {
                    self.line(&line);
                }
            }
            OutputSource::Stderr => {
                if let Some(test) = self.last.as_ref().and_then(|name| self.running.get(name)) {
                    self.emitter.output(&test.path, chunk);
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

    fn run(stdout: &str) -> Vec<Recorded> {
        let recorder = Recorder::default();
        let list = tree("catch2", "build/t", &[("t/a b", "a b"), ("t/c", "c"), ("t/d", "d")]);
        let stop = StopSignal::new();
        let mut parser = TeamcityParser::new(EventEmitter::new(context(&recorder, &list, &stop), "catch2", "build/t"));
        parser.feed(OutputSource::Stdout, stdout);
        parser.finish();
        recorder.take()
    }

    #[test]
    fn test_unescape() {
        assert_eq!(unescape("it|'s |[ok|] |||n"), "it's [ok] |\n");
        assert_eq!(unescape("a|nb|rc"), "a\nb\rc");
        assert_eq!(unescape("|0x0041|0x00e9"), "A\u{e9}");
        assert_eq!(unescape("|0zz"), "|0zz");
    }

    #[test]
    fn test_service_messages() {
        let out = "##teamcity[testSuiteStarted name='t']\n\
                   ##teamcity[testStarted name='a b']\n\
                   ##teamcity[testStdOut name='a b' out='hello|n']\n\
                   ##teamcity[testFailed name='a b' message='t.cpp:3' details='REQUIRE( x == |'y|' )']\n\
                   ##teamcity[testFinished name='a b' duration='1']\n\
                   ##teamcity[testStarted name='c']\n\
                   plain line\n\
                   ##teamcity[testFinished name='c']\n\
                   ##teamcity[testIgnored name='d' message='skipped']\n\
                   ##teamcity[testStarted name='zzz']\n\
                   ##teamcity[testFinished name='zzz']\n";
        let events = run(out);

        assert!(events.contains(&Recorded::Finished(
            "t/a b".to_string(),
            TestStatus::Failed,
            "t.cpp:3\nREQUIRE( x == 'y' )".to_string()
        )));
        assert!(events.contains(&Recorded::Finished("t/c".to_string(), TestStatus::Passed, String::new())));
        assert!(events.contains(&Recorded::Finished("t/d".to_string(), TestStatus::Skipped, "skipped".to_string())));
        assert_eq!(output_of(&events, "t/a b"), "hello\n");
        assert_eq!(output_of(&events, "t/c"), "plain line\n");
        assert!(!events.iter().any(|e| matches!(e, Recorded::Started(n) if n.contains("zzz"))));
    }
}

//! GoogleTest console output: `[ RUN      ]` / `[       OK ]` / `[  FAILED  ]` /
//! `[  SKIPPED ]` line markers delimit each test.

use super::{EventEmitter, LineBuffer, OutputParser};
use crate::data::{TestPath, TestStatus};
use crate::process::OutputSource;

const RUN: &str = "[ RUN      ] ";
const OK: &str = "[       OK ] ";
const FAILED: &str = "[  FAILED  ] ";
const SKIPPED: &str = "[  SKIPPED ] ";

pub struct GTestParser<'a> {
    emitter: EventEmitter<'a>,
    stdout: LineBuffer,
    stderr: LineBuffer,
    /// Id and path of the test whose `[ RUN ]` marker was seen last.
    current: Option<(String, TestPath)>,
}

/// Test id following a marker: everything up to the first space.
fn marker_id<'l>(line: &'l str, marker: &str) -> Option<&'l str> {
    let rest = line.strip_prefix(marker)?.trim();
    rest.split(' ').next()
}

impl<'a> GTestParser<'a> {
    pub fn new(emitter: EventEmitter<'a>) -> Self {
        Self {
            emitter,
            stdout: LineBuffer::default(),
            stderr: LineBuffer::default(),
            current: None,
        }
    }

    fn line(&mut self, line: &str) {
        tracing::debug!("[gtest] {}", line.trim_end());

        if let Some(id) = marker_id(line, RUN) {
            if let Some((_, previous)) = self.current.take() {
                tracing::warn!("[gtest] {} started before {} finished", id, previous.join("/"));
                self.emitter.finished(&previous, TestStatus::Crashed, String::new());
            }
            self.current = self.emitter.lookup(id).map(|path| (id.to_string(), path));
            if let Some((_, path)) = &self.current {
                self.emitter.started(path);
            }
        }

        let Some((current_id, path)) = self.current.clone() else { return };
        self.emitter.output(&path, line);

        let status = [(OK, TestStatus::Passed), (FAILED, TestStatus::Failed), (SKIPPED, TestStatus::Skipped)]
            .into_iter()
            .find_map(|(marker, status)| Some((marker_id(line, marker)?, status)));
        match status {
            Some((id, status)) if id == current_id => {
                self.emitter.finished(&path, status, String::new());
                self.current = None;
            }
            Some((id, _)) => tracing::debug!("[gtest] ignoring result for {} while {} is running", id, current_id),
            None => {}
        }
    }
}

impl OutputParser for GTestParser<'_> {
    fn feed(&mut self, source: OutputSource, chunk: &str) {
        let lines = match source {
            OutputSource::Stdout => self.stdout.push(chunk),
            OutputSource::Stderr => self.stderr.push(chunk),
        };
        for line in lines {
            self.line(&line);
        }
    }

    fn finish(&mut self) {
        let rest: Vec<String> = [self.stdout.flush(), self.stderr.flush()].into_iter().flatten().collect();
        for line in rest {
            self.line(&line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::StopSignal;
    use crate::parser::testing::{context, output_of, tree, Recorded, Recorder};

    const TESTS: &[(&str, &str)] = &[("Suite/a", "Suite.a"), ("Suite/b", "Suite.b"), ("Suite/c", "Suite.c")];

    fn run(chunks: &[(OutputSource, &str)]) -> Vec<Recorded> {
        let recorder = Recorder::default();
        let list = tree("gtest", "build/t", TESTS);
        let stop = StopSignal::new();
        let mut parser = GTestParser::new(EventEmitter::new(context(&recorder, &list, &stop), "gtest", "build/t"));
        for (source, chunk) in chunks {
            parser.feed(*source, chunk);
        }
        parser.finish();
        recorder.take()
    }

    fn finished(name: &str, status: TestStatus) -> Recorded {
        Recorded::Finished(name.to_string(), status, String::new())
    }

    #[test]
    fn test_lifecycle_markers() {
        let out = "[==========] Running 3 tests from 1 test suite.\n\
                   [ RUN      ] Suite.a\n\
                   [       OK ] Suite.a (0 ms)\n\
                   [ RUN      ] Suite.b\n\
                   t.cpp:12: Failure\n\
                   Expected equality\n\
                   [  FAILED  ] Suite.b (1 ms)\n\
                   [ RUN      ] Suite.c\n\
                   [  SKIPPED ] Suite.c (0 ms)\n\
                   [  FAILED  ] Suite.b (1 ms)\n";
        let events = run(&[(OutputSource::Stdout, out)]);

        let lifecycle: Vec<Recorded> = events.iter().filter(|e| !matches!(e, Recorded::Output(..))).cloned().collect();
        assert_eq!(
            lifecycle,
            vec![
                Recorded::Started("Suite/a".to_string()),
                finished("Suite/a", TestStatus::Passed),
                Recorded::Started("Suite/b".to_string()),
                finished("Suite/b", TestStatus::Failed),
                Recorded::Started("Suite/c".to_string()),
                finished("Suite/c", TestStatus::Skipped),
            ]
        );
        assert_eq!(
            output_of(&events, "Suite/b"),
            "[ RUN      ] Suite.b\nt.cpp:12: Failure\nExpected equality\n[  FAILED  ] Suite.b (1 ms)\n"
        );
    }

    #[test]
    fn test_new_run_while_current_means_crash() {
        let events = run(&[(OutputSource::Stdout, "[ RUN      ] Suite.a\n[ RUN      ] Suite.b\n[       OK ] Suite.b\n")]);
        let lifecycle: Vec<Recorded> = events.into_iter().filter(|e| !matches!(e, Recorded::Output(..))).collect();
        assert_eq!(
            lifecycle,
            vec![
                Recorded::Started("Suite/a".to_string()),
                finished("Suite/a", TestStatus::Crashed),
                Recorded::Started("Suite/b".to_string()),
                finished("Suite/b", TestStatus::Passed),
            ]
        );
    }

    #[test]
    fn test_result_marker_for_another_test_does_not_finish_current() {
        let out = "[ RUN      ] Suite.a\n\
                   [  FAILED  ] Suite.b (1 ms)\n\
                   [       OK ] Suite.a (0 ms)\n";
        let events = run(&[(OutputSource::Stdout, out)]);
        let lifecycle: Vec<Recorded> = events.iter().filter(|e| !matches!(e, Recorded::Output(..))).cloned().collect();
        assert_eq!(
            lifecycle,
            vec![Recorded::Started("Suite/a".to_string()), finished("Suite/a", TestStatus::Passed)]
        );
        assert!(output_of(&events, "Suite/a").contains("[  FAILED  ] Suite.b (1 ms)\n"));
    }

    #[test]
    fn test_split_chunks_and_stderr() {
        let events = run(&[
            (OutputSource::Stdout, "[ RUN   "),
            (OutputSource::Stdout, "   ] Suite.a\n"),
            (OutputSource::Stderr, "warning: slow\n"),
            (OutputSource::Stdout, "[       OK ] Sui"),
            (OutputSource::Stdout, "te.a (3 ms)\n"),
        ]);
        assert_eq!(events.last(), Some(&finished("Suite/a", TestStatus::Passed)));
        assert!(output_of(&events, "Suite/a").contains("warning: slow\n"));
    }

    #[test]
    fn test_unknown_ids_are_dropped() {
        let events = run(&[(OutputSource::Stdout, "[ RUN      ] Other.x\nnoise\n[       OK ] Other.x\n")]);
        assert!(events.is_empty());
    }

    #[test]
    fn test_stream_ending_mid_test_leaves_it_open() {
        let events = run(&[(OutputSource::Stdout, "[ RUN      ] Suite.a\nsegfault")]);
        assert_eq!(
            events,
            vec![
                Recorded::Started("Suite/a".to_string()),
                Recorded::Output("Suite/a".to_string(), "[ RUN      ] Suite.a\n".to_string()),
                Recorded::Output("Suite/a".to_string(), "segfault".to_string()),
            ]
        );
    }
}

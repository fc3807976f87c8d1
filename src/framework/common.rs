//! Behaviour shared by every adapter: paths, executable lookup, test naming.

use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};

use globset::GlobBuilder;
use rayon::prelude::*;
use walkdir::WalkDir;

use super::{FrameworkConfig, PathPrefixStyle, RunContext};
use crate::data::{TestPath, TEST_SEPARATOR};
use crate::parser::OutputParser;
use crate::process::{run_streamed, TestCommand};
use crate::{Error, Result};

const GLOB_CHARS: &[char] = &['*', '?', '[', '{'];

#[derive(Debug, Clone)]
pub struct FrameworkBase {
    pub config: FrameworkConfig,
    pub project_root: PathBuf,
}

impl FrameworkBase {
    pub fn new(config: FrameworkConfig, project_root: &Path) -> Self {
        Self { config, project_root: project_root.to_path_buf() }
    }

    pub fn id(&self) -> &str {
        self.config.id()
    }

    /// The configured `cwd`, resolved against the project root. Defaults to the root.
    pub fn working_directory(&self) -> PathBuf {
        match &self.config.cwd {
            Some(cwd) => self.project_root.join(cwd),
            None => self.project_root.clone(),
        }
    }

    pub fn executable_path(&self, executable: &str) -> PathBuf {
        self.project_root.join(executable)
    }

    /// Command for `executable` with `args`, followed by the configured extra arguments.
    pub fn command<I, S>(&self, program: impl Into<String>, args: I) -> TestCommand
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut command = TestCommand::new(program).args(args).args(self.config.args.iter().cloned());
        command.cwd = Some(self.working_directory());
        command.env = self.config.env.clone();
        command
    }

    pub fn executable_command<I, S>(&self, executable: &str, args: I) -> TestCommand
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let program = self.executable_path(executable).to_string_lossy().into_owned();
        self.command(program, args)
    }

    /// Executables matching the configured pattern, as written relative to the
    /// project root (or absolute, for an absolute pattern). A pattern without
    /// glob characters names a single executable.
    pub fn executables(&self) -> Result<Vec<String>> {
        let pattern = self.config.executable_pattern.as_str();
        if !pattern.contains(GLOB_CHARS) {
            return Ok(vec![pattern.to_string()]);
        }

        let matcher = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|e| Error::InvalidPattern { pattern: pattern.to_string(), reason: e.to_string() })?
            .compile_matcher();

        // Walk from the deepest directory the pattern names literally.
        let literal: PathBuf = Path::new(pattern)
            .components()
            .take_while(|c| !c.as_os_str().to_string_lossy().contains(GLOB_CHARS))
            .collect();
        let walk_root = self.project_root.join(&literal);
        let absolute = Path::new(pattern).is_absolute();
        let depth = Path::new(pattern).components().count() - literal.components().count();
        let hidden_allowed = pattern.split(['/', '\\']).any(|s| s.starts_with('.') && s != "." && s != "..");

        let mut walker = WalkDir::new(&walk_root).min_depth(1).follow_links(true);
        if !pattern.contains("**") {
            walker = walker.max_depth(depth);
        }

        let mut executables = Vec::new();
        let entries = walker.into_iter().filter_entry(|e| {
            hidden_allowed || e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.')
        });
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::debug!("Skipping unreadable path while matching '{}': {}", pattern, e);
                    continue;
                }
            };
            if !entry.file_type().is_file() || !is_executable(entry.path()) {
                continue;
            }

            let candidate = if absolute {
                entry.path().to_path_buf()
            } else {
                match pathdiff::diff_paths(entry.path(), &self.project_root) {
                    Some(relative) => relative,
                    None => continue,
                }
            };
            let candidate = to_slash(&candidate);
            if matcher.is_match(&candidate) {
                executables.push(candidate);
            }
        }

        executables.sort();
        if executables.is_empty() {
            tracing::warn!(
                "[{}] no executable found with pattern \"{}\" (project root: {:?})",
                self.id(),
                pattern,
                self.project_root
            );
        }
        Ok(executables)
    }

    /// `file` relative to the project root. Relative inputs are taken relative
    /// to the working directory.
    pub fn relative_file(&self, file: &str) -> String {
        if file.is_empty() {
            return String::new();
        }
        let absolute = self.working_directory().join(file);
        match pathdiff::diff_paths(normalize(&absolute), normalize(&self.project_root)) {
            Some(relative) => to_slash(&relative),
            None => file.to_string(),
        }
    }

    /// `custom_prefix` + executable prefix + `rest`.
    pub fn make_path<I>(&self, executable: &str, rest: I) -> TestPath
    where
        I: IntoIterator<Item = String>,
    {
        let mut path: TestPath = self
            .config
            .custom_prefix
            .iter()
            .flat_map(|prefix| prefix.split(TEST_SEPARATOR))
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        let executable = normalize(Path::new(executable));
        match self.config.path_prefix_style {
            PathPrefixStyle::Full => path.extend(executable.components().filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                Component::ParentDir => Some("..".to_string()),
                _ => None,
            })),
            PathPrefixStyle::Basename => {
                if let Some(name) = executable.file_name() {
                    path.push(name.to_string_lossy().into_owned());
                }
            }
            PathPrefixStyle::None => {}
        }

        path.extend(rest);
        path
    }

    /// Run `discover_one` for every matching executable in parallel. Failures
    /// are collected, one detail line per executable, and reported together.
    pub fn discover_each<T, F>(&self, discover_one: F) -> Result<Vec<T>>
    where
        T: Send,
        F: Fn(&str) -> Result<Vec<T>> + Sync + Send,
    {
        let executables = self.executables()?;
        let results: Vec<(String, Result<Vec<T>>)> = executables
            .par_iter()
            .map(|executable| (executable.clone(), discover_one(executable.as_str())))
            .collect();

        let mut found = Vec::new();
        let mut details = Vec::new();
        for (executable, result) in results {
            match result {
                Ok(tests) => found.extend(tests),
                Err(Error::Discovery { details: nested, message }) if !nested.is_empty() || !message.is_empty() => {
                    if nested.is_empty() {
                        details.push(format!("{}: {}", executable, message));
                    } else {
                        details.extend(nested.into_iter().map(|d| format!("{}: {}", executable, d)));
                    }
                }
                Err(e) => details.push(format!("{}: {}", executable, e)),
            }
        }

        if !details.is_empty() {
            return Err(Error::discovery(details));
        }
        Ok(found)
    }

    /// Call `run_one` for each executable and its run ids, in order. Once the
    /// run is stopped the remaining executables are not launched.
    pub fn run_each<F>(&self, grouped: &BTreeMap<String, Vec<String>>, ctx: RunContext<'_>, mut run_one: F) -> Result<()>
    where
        F: FnMut(&str, &[String]) -> Result<()>,
    {
        for (executable, ids) in grouped {
            if ctx.stop.is_stopped() {
                tracing::info!("[{}] run stopped, skipping {}", self.id(), executable);
                break;
            }
            tracing::debug!("[{}] starting tests from {}: \"{}\"", self.id(), executable, ids.join("\" \""));
            run_one(executable, ids)?;
        }
        Ok(())
    }

    /// Stream `command`'s output through `parser` until the process exits or
    /// the run is stopped. A non-zero exit is not an error: failing tests
    /// already reported through the parser.
    pub fn stream(&self, command: &TestCommand, ctx: RunContext<'_>, parser: &mut dyn OutputParser) -> Result<()> {
        let code = run_streamed(command, ctx.stop, |source, chunk| parser.feed(source, chunk))?;
        parser.finish();
        tracing::debug!("[{}] {} exited with {:?}", self.id(), command.display(), code);
        Ok(())
    }
}

/// A discovery failure for one executable, without detail lines.
pub fn discovery_error(message: impl Into<String>) -> Error {
    Error::Discovery { message: message.into(), details: Vec::new() }
}

/// Lexically resolve `.` and `..` components.
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other),
        }
    }
    out
}

fn to_slash(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata().map(|m| m.permissions().mode() & 0o111 != 0).unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    true
}

pub mod catch2;
pub mod common;
pub mod doctest;
pub mod gtest;
pub mod pytest;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::Deserialize;

use crate::data::{DiscoveredTest, StopSignal, TestEvents, TestList};
use crate::{Error, Result};

pub use catch2::Catch2Framework;
pub use common::FrameworkBase;
pub use doctest::DoctestFramework;
pub use gtest::GTestFramework;
pub use pytest::PytestFramework;

/// What a framework run reports to, and the tree it resolves ids against.
#[derive(Clone, Copy)]
pub struct RunContext<'a> {
    pub events: &'a dyn TestEvents,
    /// Snapshot of the tree taken when the run started.
    pub tests: &'a TestList,
    pub stop: &'a StopSignal,
}

pub trait TestFramework: Send + Sync {
    /// Stable identifier, the outer key of the run-id index.
    fn id(&self) -> &str;

    /// Enumerate tests without running them. Every executable is attempted;
    /// failures are collected into one [`Error::Discovery`].
    fn discover(&self) -> Result<Vec<DiscoveredTest>>;

    /// Run `grouped` (executable -> run ids) and report progress through `ctx`.
    /// Returns an error only when a process could not be launched.
    fn run(&self, grouped: &BTreeMap<String, Vec<String>>, ctx: RunContext<'_>) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum FrameworkType {
    #[serde(rename = "catch2")]
    Catch2,
    #[serde(rename = "doctest-cpp", alias = "doctest")]
    Doctest,
    #[serde(rename = "gtest")]
    GTest,
    #[serde(rename = "pytest")]
    Pytest,
}

impl FrameworkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FrameworkType::Catch2 => "catch2",
            FrameworkType::Doctest => "doctest-cpp",
            FrameworkType::GTest => "gtest",
            FrameworkType::Pytest => "pytest",
        }
    }
}

/// How an executable's path becomes part of its tests' names.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathPrefixStyle {
    #[default]
    Full,
    Basename,
    None,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// The framework's native reporter.
    #[default]
    Default,
    Teamcity,
}

fn default_pattern() -> String {
    "*".to_string()
}

fn default_python() -> String {
    "python".to_string()
}

/// One `frameworks` entry of the settings file.
#[derive(Debug, Clone, Deserialize)]
pub struct FrameworkConfig {
    #[serde(rename = "type")]
    pub kind: FrameworkType,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default = "default_pattern")]
    pub executable_pattern: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub path_prefix_style: PathPrefixStyle,
    #[serde(default)]
    pub custom_prefix: Option<String>,
    #[serde(default)]
    pub parser: OutputFormat,
    #[serde(default = "default_python")]
    pub python: String,
}

impl FrameworkConfig {
    pub fn id(&self) -> &str {
        self.id.as_deref().unwrap_or(self.kind.as_str())
    }
}

/// Build one framework per settings entry.
pub fn from_settings(frameworks: &[serde_json::Value], project_root: &Path) -> Result<Vec<Box<dyn TestFramework>>> {
    if frameworks.is_empty() {
        return Err(Error::NoFrameworkConfigured);
    }

    let mut built: Vec<Box<dyn TestFramework>> = Vec::with_capacity(frameworks.len());
    for (i, value) in frameworks.iter().enumerate() {
        let config: FrameworkConfig = serde_json::from_value(value.clone())
            .map_err(|e| Error::InvalidFrameworkConfig(format!("frameworks[{}]: {}", i, e)))?;
        if built.iter().any(|f| f.id() == config.id()) {
            tracing::warn!("Framework id '{}' is configured more than once", config.id());
        }
        built.push(from_config(config, project_root));
    }
    Ok(built)
}

pub fn from_config(config: FrameworkConfig, project_root: &Path) -> Box<dyn TestFramework> {
    let kind = config.kind;
    let base = FrameworkBase::new(config, project_root);
    match kind {
        FrameworkType::Catch2 => Box::new(Catch2Framework::new(base)),
        FrameworkType::Doctest => Box::new(DoctestFramework::new(base)),
        FrameworkType::GTest => Box::new(GTestFramework::new(base)),
        FrameworkType::Pytest => Box::new(PytestFramework::new(base)),
    }
}

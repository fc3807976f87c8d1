use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const SETTINGS_DIR: &str = ".testexplorer";
pub const SETTINGS_FILE: &str = "settings.json";
const DATA_DIR: &str = "data";

pub const MIN_REFRESH_INTERVAL_MS: u64 = 20;
pub const MAX_REFRESH_INTERVAL_MS: u64 = 5_000;

/// All configurable settings with their defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Raw framework blocks, resolved by `framework::from_settings`.
    pub frameworks: Vec<serde_json::Value>,
    pub sort_tests: bool,
    pub refresh_interval_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            frameworks: Vec::new(),
            sort_tests: false,
            refresh_interval_ms: 100,
        }
    }
}

/// Raw JSON representation; every field is optional so files can override partially.
#[derive(Debug, Deserialize, Default)]
struct SettingsFile {
    frameworks: Option<Vec<serde_json::Value>>,
    #[serde(rename = "discovery.sortTests")]
    sort_tests: Option<bool>,
    #[serde(rename = "view.refreshIntervalMs")]
    refresh_interval_ms: Option<u64>,
}

/// Where a project's registry is persisted.
pub fn data_dir(project_root: &Path) -> PathBuf {
    project_root.join(SETTINGS_DIR).join(DATA_DIR)
}

/// Resolve settings: defaults → user global → project-local.
pub fn resolve(project_root: Option<&Path>) -> Settings {
    let global_path = dirs::home_dir().map(|h| h.join(SETTINGS_DIR).join(SETTINGS_FILE));
    let project_path = project_root.map(|r| r.join(SETTINGS_DIR).join(SETTINGS_FILE));
    resolve_with_paths(global_path.as_deref(), project_path.as_deref())
}

/// Testable resolver that accepts explicit file paths (no home dir dependency).
fn resolve_with_paths(global_path: Option<&Path>, project_path: Option<&Path>) -> Settings {
    let mut settings = Settings::default();

    if let Some(path) = global_path {
        apply_file(&mut settings, path);
    }
    if let Some(path) = project_path {
        apply_file(&mut settings, path);
    }

    settings
}

fn apply_file(settings: &mut Settings, path: &Path) {
    let Ok(content) = std::fs::read_to_string(path) else { return };
    let file = match serde_json::from_str::<SettingsFile>(&content) {
        Ok(file) => file,
        Err(e) => {
            tracing::warn!("Invalid settings file, ignoring: {} ({})", path.display(), e);
            return;
        }
    };
    tracing::debug!("Applying settings from {}", path.display());

    if let Some(frameworks) = file.frameworks {
        settings.frameworks = frameworks;
    }
    if let Some(sort) = file.sort_tests {
        settings.sort_tests = sort;
    }
    if let Some(v) = file.refresh_interval_ms {
        if (MIN_REFRESH_INTERVAL_MS..=MAX_REFRESH_INTERVAL_MS).contains(&v) {
            settings.refresh_interval_ms = v;
        } else {
            tracing::warn!(
                "view.refreshIntervalMs ({}) out of range ({}..{}), using default",
                v,
                MIN_REFRESH_INTERVAL_MS,
                MAX_REFRESH_INTERVAL_MS
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults_when_no_files_exist() {
        let settings = resolve_with_paths(None, None);
        assert!(settings.frameworks.is_empty());
        assert!(!settings.sort_tests);
        assert_eq!(settings.refresh_interval_ms, 100);
    }

    #[test]
    fn test_project_frameworks_replace_global() {
        let dir = tempdir().unwrap();
        let global = dir.path().join("global.json");
        let project = dir.path().join("project.json");
        std::fs::write(
            &global,
            r#"{"frameworks": [{"type": "gtest"}, {"type": "catch2"}], "discovery.sortTests": true}"#,
        )
        .unwrap();
        std::fs::write(&project, r#"{"frameworks": [{"type": "pytest", "id": "py"}]}"#).unwrap();

        let settings = resolve_with_paths(Some(&global), Some(&project));
        assert_eq!(settings.frameworks.len(), 1); // replaced, not merged
        assert_eq!(settings.frameworks[0]["id"], "py");
        assert!(settings.sort_tests); // global applies (project didn't set)
    }

    #[test]
    fn test_invalid_json_ignored() {
        let dir = tempdir().unwrap();
        let bad_file = dir.path().join("bad.json");
        std::fs::write(&bad_file, "not json {{{").unwrap();

        let settings = resolve_with_paths(Some(&bad_file), None);
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_missing_file_ignored() {
        let settings = resolve_with_paths(Some(Path::new("/nonexistent/settings.json")), None);
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_out_of_range_refresh_uses_default() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("settings.json");
        std::fs::write(&file, r#"{"view.refreshIntervalMs": 5}"#).unwrap();
        assert_eq!(resolve_with_paths(Some(&file), None).refresh_interval_ms, 100);

        std::fs::write(&file, r#"{"view.refreshIntervalMs": 60000}"#).unwrap();
        assert_eq!(resolve_with_paths(Some(&file), None).refresh_interval_ms, 100);

        std::fs::write(&file, r#"{"view.refreshIntervalMs": 250, "unknown.key": 1}"#).unwrap();
        assert_eq!(resolve_with_paths(Some(&file), None).refresh_interval_ms, 250);
    }

    #[test]
    fn test_data_dir() {
        assert_eq!(data_dir(Path::new("/p")), PathBuf::from("/p/.testexplorer/data"));
    }
}

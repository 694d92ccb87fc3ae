use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::PreloadError;
use crate::trigger::Trigger;

/// Main configuration structure. Every field has a default so a missing or
/// partial file still yields a usable configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct PreloadConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub load_method: LoadMethodConfig,
    #[serde(default)]
    pub observer: ObserverConfig,
    /// Host executables allowed to preload plugins. Matching is
    /// case-insensitive; passthrough is unaffected by this list.
    #[serde(default)]
    pub processes: Vec<ProcessRule>,
    #[serde(default)]
    pub plugins: PluginsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct GeneralConfig {
    /// Path of the genuine library this shim stands in for, relative to the
    /// shim's own directory unless absolute. When unset there is nothing to
    /// forward to and the handler runs degraded, with plugin loading
    /// disabled.
    pub original_library: Option<PathBuf>,

    /// Blocking wait before plugin loading begins, on the notification
    /// thread that fired the trigger.
    #[serde(default)]
    pub load_delay_ms: u64,

    /// Blocking wait before the import hook is installed.
    #[serde(default)]
    pub hook_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObserverConfig {
    /// Install the process-wide fault observer around the pipeline run.
    #[serde(default = "default_true")]
    pub install: bool,

    /// Keep the observer registered for the rest of the process lifetime
    /// instead of removing it after loading finishes.
    #[serde(default)]
    pub keep: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessRule {
    pub name: String,
    #[serde(default)]
    pub allow: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadMethodConfig {
    /// One of `OnProcessAttach`, `OnThreadAttach`, `ImportAddressHook`.
    #[serde(default = "default_load_method")]
    pub name: String,

    /// `OnThreadAttach`: which thread-attach notification fires the load.
    #[serde(default = "default_thread_number")]
    pub thread_number: usize,

    /// `ImportAddressHook`: module whose import is intercepted.
    #[serde(default = "default_hook_library")]
    pub library_name: String,

    /// `ImportAddressHook`: export name to intercept.
    #[serde(default = "default_hook_function")]
    pub function_name: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryKind {
    /// A library qualifies when a sibling marker file exists.
    MarkerFile,
    /// A library qualifies when passive inspection finds the well-known
    /// export.
    ExportProbe,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginsConfig {
    /// Directory scanned for candidates, relative to the shim's own
    /// location unless absolute.
    #[serde(default = "default_plugins_directory")]
    pub directory: PathBuf,

    #[serde(default = "default_discovery")]
    pub discovery: DiscoveryKind,

    /// Marker file suffix for [`DiscoveryKind::MarkerFile`]; the candidate
    /// library shares the marker's stem.
    #[serde(default = "default_marker_suffix")]
    pub marker_suffix: String,

    /// Name of the optional no-argument initialization export.
    #[serde(default = "default_initializer")]
    pub initializer: String,
}

fn default_true() -> bool {
    true
}

fn default_load_method() -> String {
    "ImportAddressHook".to_string()
}

fn default_thread_number() -> usize {
    2
}

// An import every process touches early, so the default hook fires before
// the host's own startup gets far.
fn default_hook_library() -> String {
    "kernel32.dll".to_string()
}

fn default_hook_function() -> String {
    "GetSystemTimeAsFileTime".to_string()
}

fn default_plugins_directory() -> PathBuf {
    PathBuf::from("plugins")
}

fn default_discovery() -> DiscoveryKind {
    DiscoveryKind::MarkerFile
}

fn default_marker_suffix() -> String {
    "_preload.txt".to_string()
}

fn default_initializer() -> String {
    "Initialize".to_string()
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            install: true,
            keep: false,
        }
    }
}

impl Default for LoadMethodConfig {
    fn default() -> Self {
        Self {
            name: default_load_method(),
            thread_number: default_thread_number(),
            library_name: default_hook_library(),
            function_name: default_hook_function(),
        }
    }
}

impl Default for PluginsConfig {
    fn default() -> Self {
        Self {
            directory: default_plugins_directory(),
            discovery: default_discovery(),
            marker_suffix: default_marker_suffix(),
            initializer: default_initializer(),
        }
    }
}

impl PreloadConfig {
    /// Load configuration from `path`, restoring the default file when it is
    /// missing or unparseable. The shim must come up with a working
    /// configuration either way; a broken file only costs customization.
    pub fn load_or_restore<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        let error = match fs::read_to_string(path) {
            Ok(contents) => match serde_yaml::from_str(&contents) {
                Ok(config) => {
                    info!(path = %path.display(), "configuration loaded");
                    return config;
                }
                Err(error) => error.to_string(),
            },
            Err(error) => error.to_string(),
        };

        warn!(path = %path.display(), %error, "couldn't load configuration, restoring defaults");
        let config = Self::default();
        if let Err(error) = config.save_to_file(path) {
            warn!(%error, "couldn't save default configuration to disk");
        }
        config
    }

    /// Load configuration from a specific file.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;

        let config: PreloadConfig =
            serde_yaml::from_str(&contents).context("Failed to parse config file")?;

        Ok(config)
    }

    /// Save configuration to file.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = serde_yaml::to_string(self).context("Failed to serialize config")?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        fs::write(path.as_ref(), contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Resolve the configured load method into a [`Trigger`].
    pub fn trigger(&self) -> Result<Trigger, PreloadError> {
        let method = &self.load_method;
        match method.name.as_str() {
            "OnProcessAttach" => Ok(Trigger::ProcessAttach),
            "OnThreadAttach" => Ok(Trigger::ThreadAttach {
                ordinal: method.thread_number,
            }),
            "ImportAddressHook" => {
                if method.library_name.is_empty() || method.function_name.is_empty() {
                    return Err(PreloadError::TriggerMisconfigured(
                        "ImportAddressHook requires both library_name and function_name"
                            .to_string(),
                    ));
                }
                Ok(Trigger::ImportHook {
                    module: method.library_name.clone(),
                    export: method.function_name.clone(),
                })
            }
            other => Err(PreloadError::TriggerMisconfigured(format!(
                "unknown load method '{other}'"
            ))),
        }
    }

    pub fn load_delay(&self) -> Duration {
        Duration::from_millis(self.general.load_delay_ms)
    }

    pub fn hook_delay(&self) -> Duration {
        Duration::from_millis(self.general.hook_delay_ms)
    }

    /// Case-insensitive allow-list check against the host executable name.
    pub fn is_process_allowed(&self, executable_name: &str) -> bool {
        self.processes
            .iter()
            .any(|rule| rule.allow && rule.name.eq_ignore_ascii_case(executable_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_usable() {
        let config = PreloadConfig::default();
        assert!(config.observer.install);
        assert!(!config.observer.keep);
        assert_eq!(config.plugins.initializer, "Initialize");
        assert_eq!(config.plugins.marker_suffix, "_preload.txt");
        assert_eq!(config.load_method.thread_number, 2);
    }

    #[test]
    fn trigger_resolution() {
        let mut config = PreloadConfig::default();

        config.load_method.name = "OnProcessAttach".to_string();
        assert_eq!(config.trigger().unwrap(), Trigger::ProcessAttach);

        config.load_method.name = "OnThreadAttach".to_string();
        config.load_method.thread_number = 5;
        assert_eq!(
            config.trigger().unwrap(),
            Trigger::ThreadAttach { ordinal: 5 }
        );

        config.load_method.name = "ImportAddressHook".to_string();
        config.load_method.library_name = "kernel32.dll".to_string();
        config.load_method.function_name = "GetCommandLineA".to_string();
        assert!(matches!(
            config.trigger().unwrap(),
            Trigger::ImportHook { .. }
        ));
    }

    #[test]
    fn misconfigured_triggers_are_rejected() {
        let mut config = PreloadConfig::default();

        config.load_method.name = "OnBlueMoon".to_string();
        assert!(matches!(
            config.trigger(),
            Err(PreloadError::TriggerMisconfigured(_))
        ));

        // ImportAddressHook without a target is misconfigured too.
        config.load_method = LoadMethodConfig::default();
        config.load_method.library_name.clear();
        assert!(matches!(
            config.trigger(),
            Err(PreloadError::TriggerMisconfigured(_))
        ));
    }

    #[test]
    fn allow_list_is_case_insensitive() {
        let mut config = PreloadConfig::default();
        config.processes.push(ProcessRule {
            name: "game.exe".to_string(),
            allow: true,
        });
        config.processes.push(ProcessRule {
            name: "editor.exe".to_string(),
            allow: false,
        });

        assert!(config.is_process_allowed("GAME.EXE"));
        assert!(config.is_process_allowed("game.exe"));
        assert!(!config.is_process_allowed("other.exe"));
        // A rule with allow = false never matches.
        assert!(!config.is_process_allowed("editor.exe"));
    }

    #[test]
    fn config_deserialization() {
        let yaml = r#"
general:
  load_delay_ms: 250
load_method:
  name: OnThreadAttach
  thread_number: 3
processes:
  - name: game.exe
    allow: true
plugins:
  discovery: export_probe
  initializer: Preload
"#;
        let config: PreloadConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.general.load_delay_ms, 250);
        assert_eq!(
            config.trigger().unwrap(),
            Trigger::ThreadAttach { ordinal: 3 }
        );
        assert_eq!(config.plugins.discovery, DiscoveryKind::ExportProbe);
        assert_eq!(config.plugins.initializer, "Preload");
        assert!(config.observer.install);
    }

    #[test]
    fn missing_file_restores_defaults_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shimloader.yaml");

        let config = PreloadConfig::load_or_restore(&path);
        assert!(config.observer.install);
        assert!(path.exists(), "default configuration was not written back");

        let reloaded = PreloadConfig::load_from_file(&path).unwrap();
        assert_eq!(reloaded.plugins.initializer, config.plugins.initializer);
    }

    #[test]
    fn unparseable_file_restores_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shimloader.yaml");
        fs::write(&path, "general: [this is not\n  a mapping").unwrap();

        let config = PreloadConfig::load_or_restore(&path);
        assert_eq!(config.plugins.marker_suffix, "_preload.txt");
    }
}

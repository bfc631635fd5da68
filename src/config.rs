//! Runtime settings for the coordination core (spec §6): two scalar
//! durations, refreshable without restarting the service.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

const DEFAULT_SLOW_TASK_LOGGING_THRESHOLD_SECS: u64 = 30;
const DEFAULT_RECONNECT_INTERVAL_SECS: u64 = 10;

/// Mirrors the `[cluster.service]` TOML table / `RING_CLUSTER_CLUSTER_
/// SERVICE_*` env namespace that spec §6's dotted key names
/// (`cluster.service.slow_task_logging_threshold`,
/// `cluster.service.reconnect_interval`) describe, following
/// `kimberlite-config::KimberliteConfig`'s nested-section layout rather
/// than encoding the dots directly into a field name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub cluster: ClusterSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterSection {
    pub service: ClusterServiceSection,
}

/// The two refreshable configuration keys named in spec §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterServiceSection {
    /// `cluster.service.slow_task_logging_threshold` — logs a WARN when any
    /// update task exceeds this wall-clock bound.
    pub slow_task_logging_threshold_secs: u64,

    /// `cluster.service.reconnect_interval` — the Reconnect Loop's period.
    pub reconnect_interval_secs: u64,
}

impl Default for ClusterServiceSection {
    fn default() -> Self {
        Self {
            slow_task_logging_threshold_secs: DEFAULT_SLOW_TASK_LOGGING_THRESHOLD_SECS,
            reconnect_interval_secs: DEFAULT_RECONNECT_INTERVAL_SECS,
        }
    }
}

impl Settings {
    pub fn slow_task_logging_threshold(&self) -> Duration {
        Duration::from_secs(self.cluster.service.slow_task_logging_threshold_secs)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_secs(self.cluster.service.reconnect_interval_secs)
    }
}

/// Loads [`Settings`] from built-in defaults, an optional TOML file, and
/// `RING_CLUSTER_*` environment overrides, following the layering style of
/// the sibling settings-loader crate this core is normally embedded next
/// to.
pub struct SettingsLoader {
    config_file: Option<PathBuf>,
    env_prefix: String,
}

impl SettingsLoader {
    pub fn new() -> Self {
        Self {
            config_file: None,
            env_prefix: "RING_CLUSTER".to_string(),
        }
    }

    pub fn with_config_file(mut self, path: impl AsRef<Path>) -> Self {
        self.config_file = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn load(self) -> Result<Settings, config::ConfigError> {
        let mut builder = config::Config::builder().add_source(config::Config::try_from(&Settings::default())?);

        if let Some(path) = &self.config_file {
            builder = builder.add_source(
                config::File::from(path.as_path())
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix)
                .separator("_")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}

impl Default for SettingsLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// A settings value that can be hot-swapped at runtime. Reload takes effect
/// only for the next task dispatched by the Update Executor (spec §4.7):
/// callers read a fresh `Arc<Settings>` once per task, not once per field
/// access.
#[derive(Clone)]
pub struct RefreshableSettings {
    current: Arc<RwLock<Arc<Settings>>>,
}

impl RefreshableSettings {
    pub fn new(initial: Settings) -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(initial))),
        }
    }

    pub fn current(&self) -> Arc<Settings> {
        self.current.read().expect("settings lock poisoned").clone()
    }

    /// Re-reads `cluster.service.slow_task_logging_threshold` (and the
    /// other refreshable keys) from `updated`.
    pub fn reload(&self, updated: Settings) {
        *self.current.write().expect("settings lock poisoned") = Arc::new(updated);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let settings = Settings::default();
        assert_eq!(settings.slow_task_logging_threshold(), Duration::from_secs(30));
        assert_eq!(settings.reconnect_interval(), Duration::from_secs(10));
    }

    #[test]
    fn loader_falls_back_to_defaults_without_a_file() {
        let settings = SettingsLoader::new().load().unwrap();
        assert_eq!(settings.cluster.service.slow_task_logging_threshold_secs, 30);
    }

    #[test]
    fn reload_replaces_current_settings() {
        let refreshable = RefreshableSettings::new(Settings::default());
        let mut updated = Settings::default();
        updated.cluster.service.slow_task_logging_threshold_secs = 5;
        refreshable.reload(updated);

        assert_eq!(refreshable.current().cluster.service.slow_task_logging_threshold_secs, 5);
    }

    #[test]
    fn loader_applies_toml_file_overrides_via_nested_table() {
        let path = std::env::temp_dir().join(format!("ring-cluster-config-test-{}.toml", std::process::id()));
        std::fs::write(&path, "[cluster.service]\nslow_task_logging_threshold_secs = 7\n").unwrap();

        let settings = SettingsLoader::new().with_config_file(&path).load().unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(settings.cluster.service.slow_task_logging_threshold_secs, 7);
        assert_eq!(settings.cluster.service.reconnect_interval_secs, 10);
    }
}

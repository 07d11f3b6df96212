//! Process settings: which task backend to run and how to reach it.
//!
//! Resolution order is defaults, then an optional TOML file, then
//! environment variables. The backend is chosen once from these settings,
//! when [`TaskSystem`](crate::tasks::TaskSystem) is built.
//!
//! ```toml
//! backend = "remote"
//! project = "my-project"
//! application_id = "e~my-project"
//!
//! [emulator]
//! persistence = false
//! poll_interval_ms = 25
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read settings file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid settings file {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid value {value:?} for environment variable {var}")]
    InvalidEnv { var: &'static str, value: String },
}

/// Which implementation receives deferred tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process emulator; no network.
    #[default]
    Emulator,
    /// The hosted queue service.
    Remote,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EmulatorSettings {
    /// Snapshot pending tasks on shutdown and reload them on startup.
    pub persistence: bool,
    /// Snapshot file, relative to the working directory unless absolute.
    pub snapshot_path: PathBuf,
    pub poll_interval_ms: u64,
}

impl Default for EmulatorSettings {
    fn default() -> Self {
        Self {
            persistence: true,
            snapshot_path: PathBuf::from("hibernate-emulator-task-queue.json"),
            poll_interval_ms: 10,
        }
    }
}

impl EmulatorSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub backend: BackendKind,
    /// Cloud project hosting the queues (`GOOGLE_CLOUD_PROJECT`).
    pub project: Option<String>,
    /// Region-prefixed application id, e.g. `e~my-app` (`GAE_APPLICATION`).
    pub application_id: String,
    /// Deployed version used as the default routing target (`GAE_VERSION`).
    pub version: Option<String>,
    /// Explicit queue location; derived from `application_id` when unset.
    pub location: Option<String>,
    pub bind_addr: String,
    /// Path of the deferred-task delivery endpoint.
    pub handler_url: String,
    pub log_format: LogFormat,
    pub emulator: EmulatorSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            project: None,
            application_id: "e~example".to_owned(),
            version: None,
            location: None,
            bind_addr: "127.0.0.1:8080".to_owned(),
            handler_url: "/_tasks/deferred".to_owned(),
            log_format: LogFormat::default(),
            emulator: EmulatorSettings::default(),
        }
    }
}

impl Settings {
    /// Loads settings from `path` (if given) and the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let settings = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        settings.with_env(|var| std::env::var(var).ok())
    }

    /// Parses a TOML settings file; absent keys keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_owned(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    /// Applies environment overrides read through `lookup`.
    pub fn with_env(
        mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        if let Some(project) = lookup("GOOGLE_CLOUD_PROJECT") {
            self.project = Some(project);
        }
        if let Some(app_id) = lookup("GAE_APPLICATION") {
            self.application_id = app_id;
        }
        if let Some(version) = lookup("GAE_VERSION") {
            self.version = Some(version);
        }
        if let Some(value) = lookup("RTASK_BACKEND") {
            self.backend = match value.as_str() {
                "emulator" => BackendKind::Emulator,
                "remote" => BackendKind::Remote,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        var: "RTASK_BACKEND",
                        value,
                    });
                }
            };
        }
        if let Some(value) = lookup("RTASK_EMULATOR_PERSISTENCE") {
            self.emulator.persistence = match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => {
                    return Err(ConfigError::InvalidEnv {
                        var: "RTASK_EMULATOR_PERSISTENCE",
                        value,
                    });
                }
            };
        }
        Ok(self)
    }

    /// The queue location: the explicit setting, else the region encoded in
    /// the application id prefix.
    pub fn location(&self) -> Option<&str> {
        self.location
            .as_deref()
            .or_else(|| location_for_application_id(&self.application_id))
    }
}

/// Maps the region prefix of an application id (`e~my-app` → `e`) to the
/// queue location it runs in.
pub fn location_for_application_id(application_id: &str) -> Option<&'static str> {
    let (prefix, _) = application_id.split_once('~')?;
    let location = match prefix {
        "b" => "asia-northeast1",
        "d" => "us-east4",
        "e" => "europe-west1",
        "f" => "australia-southeast",
        "g" => "europe-west2",
        "h" => "europe-west3",
        "i" => "southamerica-east1",
        "j" => "asia-south1",
        "k" => "northamerica-northeast1",
        "m" => "us-west2",
        "n" => "asia-east2",
        "o" => "europe-west6",
        "p" => "us-east1",
        "s" => "us-central1",
        "u" => "asia-northeast2",
        "v" => "asia-northeast3",
        "zas" => "asia-southeast1",
        "zde" => "asia-east1",
        "zet" => "asia-southeast2",
        "zlm" => "europe-central2",
        "zuw" => "us-west1",
        "zwm" => "us-west3",
        "zwn" => "us-west4",
        _ => return None,
    };
    Some(location)
}

use std::{
    fs,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::Context as _;
use serde::Deserialize;

pub const MODE_ENV: &str = "MONGO_RECORD_REPLAY";
pub const PATH_ENV: &str = "MONGO_RECORD_REPLAY_PATH";
pub const DEFAULT_RECORDING_PATH: &str = "mongoose_record_replay";

/// Optional TOML file. Every section may be omitted.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub recording: Option<RecordingSection>,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Default, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct RecordingSection {
    pub mode: Option<String>,
    pub path: Option<PathBuf>,
}

#[derive(Debug, Default, Deserialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

impl Config {
    pub fn from_path(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let toml =
            fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
        Self::from_toml_str(&toml)
    }

    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        toml.parse()
    }

    /// The file at `path`, or an empty config when no file is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::from_path(path),
            None => Ok(Self::default()),
        }
    }

    /// Resolves mode and path from explicit values, then the process environment, then this
    /// file.
    pub fn recording_config(
        &self,
        path: Option<&Path>,
        mode: Option<&str>,
    ) -> Result<RecordingConfig, ModeError> {
        RecordingConfig::resolve_with(
            path,
            mode,
            |key| std::env::var(key).ok(),
            self.recording.as_ref(),
        )
    }
}

impl FromStr for Config {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        toml::from_str(s).context("parse config TOML")
    }
}

/// How models are instrumented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Calls go to the real client untouched.
    Live,
    Record,
    Replay,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Live => "LIVE",
            Self::Record => "RECORD",
            Self::Replay => "REPLAY",
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parses a mode given explicitly. Only `RECORD` and `REPLAY` are accepted; live mode is what
/// you get by not asking for either.
impl FromStr for Mode {
    type Err = ModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RECORD" => Ok(Self::Record),
            "REPLAY" => Ok(Self::Replay),
            other => Err(ModeError {
                value: other.to_owned(),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeError {
    value: String,
}

impl ModeError {
    pub fn value(&self) -> &str {
        &self.value
    }
}

impl std::fmt::Display for ModeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "record/replay mode should be one of \"REPLAY\", \"RECORD\", was `{}`",
            self.value
        )
    }
}

impl std::error::Error for ModeError {}

/// Where recordings live and what to do with them. Built once and handed to
/// [`crate::client::instrument`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordingConfig {
    pub mode: Mode,
    pub path: PathBuf,
}

impl RecordingConfig {
    pub fn new(mode: Mode, path: impl Into<PathBuf>) -> Self {
        Self {
            mode,
            path: path.into(),
        }
    }

    /// Explicit values first, then `MONGO_RECORD_REPLAY` / `MONGO_RECORD_REPLAY_PATH`.
    pub fn resolve(path: Option<&Path>, mode: Option<&str>) -> Result<Self, ModeError> {
        Self::resolve_with(path, mode, |key| std::env::var(key).ok(), None)
    }

    /// An explicit or file-configured mode must be valid. An unrecognized environment value is
    /// logged and treated as unset.
    pub fn resolve_with(
        path: Option<&Path>,
        mode: Option<&str>,
        env: impl Fn(&str) -> Option<String>,
        file: Option<&RecordingSection>,
    ) -> Result<Self, ModeError> {
        let env_mode = env(MODE_ENV)
            .filter(|value| !value.is_empty())
            .and_then(|value| match value.parse::<Mode>() {
                Ok(mode) => Some(mode),
                Err(err) => {
                    tracing::warn!("ignoring {MODE_ENV}: {err}");
                    None
                }
            });

        let mode = match mode {
            Some(explicit) => explicit.parse::<Mode>()?,
            None => match (env_mode, file.and_then(|file| file.mode.as_deref())) {
                (Some(mode), _) => mode,
                (None, Some(configured)) => configured.parse::<Mode>()?,
                (None, None) => Mode::Live,
            },
        };

        let path = path
            .map(Path::to_path_buf)
            .or_else(|| {
                env(PATH_ENV)
                    .filter(|value| !value.is_empty())
                    .map(PathBuf::from)
            })
            .or_else(|| file.and_then(|file| file.path.clone()))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_RECORDING_PATH));

        Ok(Self { mode, path })
    }
}

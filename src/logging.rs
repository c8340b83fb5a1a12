use anyhow::anyhow;
use tracing_subscriber::filter::LevelFilter;

use crate::config::{Config, LogFormat};

const DEFAULT_LEVEL: LevelFilter = LevelFilter::INFO;
const DEFAULT_FORMAT: LogFormat = LogFormat::Json;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LogSettings {
    level: LevelFilter,
    format: LogFormat,
}

impl LogSettings {
    fn resolve(config: &Config, level_override: Option<&str>) -> anyhow::Result<Self> {
        let logging = config.logging.as_ref();
        let level = match level_override.or_else(|| logging.and_then(|l| l.level.as_deref())) {
            Some(raw) => parse_level(raw)?,
            None => DEFAULT_LEVEL,
        };
        let format = logging
            .and_then(|logging| logging.format)
            .unwrap_or(DEFAULT_FORMAT);
        Ok(Self { level, format })
    }
}

/// Installs the global subscriber. Everything goes to stderr; stdout is reserved for command
/// output.
pub fn init(config: &Config, level_override: Option<&str>) -> anyhow::Result<()> {
    let settings = LogSettings::resolve(config, level_override)?;
    let builder = tracing_subscriber::fmt()
        .with_max_level(settings.level)
        .with_target(true)
        .with_writer(std::io::stderr);

    let installed = match settings.format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Pretty => builder.pretty().try_init(),
    };
    installed.map_err(|err| anyhow!("install log subscriber: {err}"))
}

fn parse_level(raw: &str) -> anyhow::Result<LevelFilter> {
    raw.trim()
        .to_ascii_lowercase()
        .parse::<LevelFilter>()
        .map_err(|_| {
            anyhow!("unknown log level `{raw}` (use trace, debug, info, warn, error or off)")
        })
}

#[cfg(test)]
mod tests {
    use std::{
        io::Write,
        sync::{Arc, Mutex, PoisonError},
    };

    use serde_json::{Value, json};
    use tracing_subscriber::filter::LevelFilter;

    use super::LogSettings;
    use crate::{
        canonical::QueryValue,
        config::{Config, LogFormat},
        digest::Operation,
        storage::RecordingStore,
    };

    fn warn_pretty() -> Config {
        Config::from_toml_str(
            r#"
[logging]
level = "WARN"
format = "pretty"
"#,
        )
        .expect("config should parse")
    }

    #[test]
    fn defaults_to_info_json() {
        assert_eq!(
            LogSettings::resolve(&Config::default(), None).unwrap(),
            LogSettings {
                level: LevelFilter::INFO,
                format: LogFormat::Json,
            }
        );
    }

    #[test]
    fn cli_level_beats_config_level() {
        let from_file = LogSettings::resolve(&warn_pretty(), None).unwrap();
        assert_eq!(from_file.level, LevelFilter::WARN);
        assert_eq!(from_file.format, LogFormat::Pretty);

        let overridden = LogSettings::resolve(&warn_pretty(), Some(" debug ")).unwrap();
        assert_eq!(overridden.level, LevelFilter::DEBUG);
        assert_eq!(overridden.format, LogFormat::Pretty);
    }

    #[test]
    fn unknown_level_is_rejected() {
        let err = LogSettings::resolve(&Config::default(), Some("chatty")).unwrap_err();
        assert!(
            err.to_string().contains("unknown log level `chatty`"),
            "unexpected error: {err}"
        );
    }

    /// Collects everything the subscriber writes.
    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Captured {
        fn lines(&self) -> Vec<Value> {
            let bytes = self.0.lock().unwrap_or_else(PoisonError::into_inner);
            String::from_utf8_lossy(&bytes)
                .lines()
                .map(|line| serde_json::from_str(line).expect("log line should be JSON"))
                .collect()
        }
    }

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn missing_recording_is_logged_with_context() {
        let captured = Captured::default();
        let sink = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(LevelFilter::ERROR)
            .json()
            .with_writer(move || sink.clone())
            .finish();
        let temp_dir = tempfile::tempdir().unwrap();
        let store = RecordingStore::new(temp_dir.path());

        tracing::subscriber::with_default(subscriber, || {
            store
                .retrieve_blocking(
                    Operation::Find,
                    "users",
                    &QueryValue::from(json!({ "name": "ada" })),
                )
                .unwrap_err();
        });

        let lines = captured.lines();
        assert_eq!(lines.len(), 1, "logs: {lines:?}");
        let fields = &lines[0]["fields"];
        assert_eq!(lines[0]["level"], json!("ERROR"));
        assert_eq!(fields["collection"], json!("users"));
        assert_eq!(fields["operation"], json!("find"));
        let path = fields["path"].as_str().expect("path field");
        assert!(path.ends_with(".json"), "path: {path}");
        let query = fields["query"].as_str().expect("query field");
        assert!(query.contains("\"ada\""), "query: {query}");
    }
}

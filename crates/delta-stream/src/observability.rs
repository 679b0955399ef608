use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

static INSTALLED: OnceCell<()> = OnceCell::new();

/// Filter used when neither `DELTA_STREAM_LOG_LEVEL` nor `RUST_LOG` parses:
/// session lifecycle from this crate, only warnings from HTTP internals.
pub const DEFAULT_LOG_FILTER: &str = "warn,delta_stream=info";

const DEFAULT_JSON_LOG_FILE: &str = "delta-stream.sessions.jsonl";

/// Where and how much the engine logs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogSettings {
    /// When false, [`init_logging`] installs nothing.
    pub enabled: bool,
    /// `EnvFilter` directive.
    pub filter: String,
    /// JSON-lines log file; `None` logs compactly to stdout.
    pub json_path: Option<PathBuf>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            filter: DEFAULT_LOG_FILTER.to_string(),
            json_path: None,
        }
    }
}

impl LogSettings {
    /// Reads settings from the process environment.
    ///
    /// - `DELTA_STREAM_OBSERVABILITY_ENABLED`: `false`/`0`/`off`/`no` disables logging.
    /// - `DELTA_STREAM_LOG_LEVEL`, then `RUST_LOG`: filter directive.
    /// - `DELTA_STREAM_JSON_LOG_PATH`: write JSON lines to this file.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let read = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let enabled = read("DELTA_STREAM_OBSERVABILITY_ENABLED")
            .is_none_or(|value| !is_off_switch(&value));
        let filter = ["DELTA_STREAM_LOG_LEVEL", "RUST_LOG"]
            .into_iter()
            .filter_map(|key| read(key))
            .map(|value| value.trim().to_string())
            .find(|directive| EnvFilter::try_new(directive).is_ok())
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());
        let json_path = read("DELTA_STREAM_JSON_LOG_PATH").map(|raw| resolve_log_file(raw.trim()));

        Self {
            enabled,
            filter,
            json_path,
        }
    }
}

fn is_off_switch(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "0" | "false" | "no" | "off" | "disabled"
    )
}

/// A path naming a directory (trailing separator) gets the default file name.
fn resolve_log_file(raw: &str) -> PathBuf {
    if raw.ends_with(['/', '\\']) {
        Path::new(raw).join(DEFAULT_JSON_LOG_FILE)
    } else {
        PathBuf::from(raw)
    }
}

/// Installs the global subscriber described by `settings`.
///
/// Only the first call in a process has an effect, and it is a no-op when a
/// subscriber is already installed by the host application.
pub fn init_logging(settings: LogSettings) {
    INSTALLED.get_or_init(|| {
        if !settings.enabled {
            return;
        }
        let filter = EnvFilter::try_new(&settings.filter)
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
        let registry = tracing_subscriber::registry().with(filter);

        let Some(path) = settings.json_path else {
            let _ = registry
                .with(tracing_subscriber::fmt::layer().compact().with_writer(std::io::stdout))
                .try_init();
            return;
        };
        let dir = path
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let file = path
            .file_name()
            .map_or_else(|| DEFAULT_JSON_LOG_FILE.into(), |name| name.to_os_string());
        let _ = std::fs::create_dir_all(&dir);
        // session_id lives on the `stream_session` span, so keep the span list
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_writer(tracing_appender::rolling::never(dir, file));
        let _ = registry.with(layer).try_init();
    });
}

/// [`init_logging`] with [`LogSettings::from_env`].
pub fn init_observability() {
    init_logging(LogSettings::from_env());
}

use std::path::{Path, PathBuf};

use once_cell::sync::OnceCell;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

use crate::config::parse_bool;

/// Relay events at `info`, HTTP stack chatter only from `warn` up.
const DEFAULT_FILTER: &str = "warn,agent_relay=info";
const DEFAULT_LOG_FILE: &str = "agent-relay.logs.jsonl";

static INIT: OnceCell<()> = OnceCell::new();

/// Logging settings read from the environment.
#[derive(Clone, Debug, PartialEq, Eq)]
struct LogSettings {
    enabled: bool,
    filter: String,
    json_path: Option<PathBuf>,
}

impl LogSettings {
    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let enabled = get("AGENT_RELAY_OBSERVABILITY")
            .and_then(|value| parse_bool(&value))
            .unwrap_or(true);
        let filter = ["AGENT_RELAY_LOG_LEVEL", "RUST_LOG"]
            .into_iter()
            .filter_map(&get)
            .find(|directives| EnvFilter::try_new(directives).is_ok())
            .unwrap_or_else(|| DEFAULT_FILTER.to_string());
        let json_path = get("AGENT_RELAY_JSON_LOG_PATH")
            .filter(|path| !path.trim().is_empty())
            .map(PathBuf::from);
        Self {
            enabled,
            filter,
            json_path,
        }
    }
}

/// Splits a log file path into the directory and file name the appender
/// expects.
fn log_file_parts(path: &Path) -> (PathBuf, String) {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(DEFAULT_LOG_FILE)
        .to_string();
    (dir, file_name)
}

/// Initialize logging once per process.
///
/// Environment variables:
/// - `AGENT_RELAY_OBSERVABILITY`: enable/disable flag (default enabled).
/// - `AGENT_RELAY_LOG_LEVEL`, then `RUST_LOG`: filter directives. Invalid
///   directives fall back to `warn,agent_relay=info`.
/// - `AGENT_RELAY_JSON_LOG_PATH`: write JSONL with span context to this file
///   instead of the compact stderr format. Stdout stays free for reply text.
pub fn init_observability() {
    INIT.get_or_init(|| {
        let settings = LogSettings::from_lookup(|key| std::env::var(key).ok());
        if !settings.enabled {
            return;
        }
        let filter = EnvFilter::new(&settings.filter);

        match settings.json_path {
            Some(path) => {
                let (dir, file_name) = log_file_parts(&path);
                let _ = std::fs::create_dir_all(&dir);
                let json_layer = tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_target(false)
                    .with_writer(tracing_appender::rolling::never(dir, file_name));
                let _ = tracing_subscriber::registry()
                    .with(filter)
                    .with(json_layer)
                    .try_init();
            }
            None => {
                let console_layer = tracing_subscriber::fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_writer(std::io::stderr);
                let _ = tracing_subscriber::registry()
                    .with(filter)
                    .with(console_layer)
                    .try_init();
            }
        }
    });
}

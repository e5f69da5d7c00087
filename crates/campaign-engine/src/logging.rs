//! Log subscriber and per-instance spans
//!
//! Every long-running task of a server is spawned inside a
//! [`component_span`], so each line it emits carries the `instance_id` of the
//! process and the component that produced it. Several instances share one
//! slot table, and these fields are how their logs are told apart.

use std::str::FromStr;

use tracing::{Level, Span};
use tracing_subscriber::filter::Directive;
use tracing_subscriber::{fmt, EnvFilter};

use crate::error::{CampaignError, Result};

/// Targets that are chatty at info and below
const QUIET_TARGETS: &[&str] = &["sqlx=warn", "hyper=warn", "tokio_tungstenite=warn", "tungstenite=warn", "reqwest=warn"];

/// Output encoding of log lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    /// One JSON object per line, including the fields of the enclosing spans
    Json,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: Level,
    pub format: LogFormat,
    /// Per-target directives applied over `level`, before `RUST_LOG`
    pub directives: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: Level::INFO,
            format: LogFormat::Pretty,
            directives: QUIET_TARGETS.iter().map(|d| d.to_string()).collect(),
        }
    }
}

impl LoggingConfig {
    pub fn new(level: Level) -> Self {
        LoggingConfig {
            level,
            ..Default::default()
        }
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    /// Build the filter: base level, then configured directives, then `env`.
    fn filter(&self, env: Option<&str>) -> Result<EnvFilter> {
        let mut filter = EnvFilter::default().add_directive(self.level.into());
        let env_directives = env.into_iter().flat_map(|s| s.split(',')).map(str::trim);
        for raw in self.directives.iter().map(String::as_str).chain(env_directives) {
            if raw.is_empty() {
                continue;
            }
            let directive = Directive::from_str(raw)
                .map_err(|e| CampaignError::configuration(format!("Invalid log directive '{}': {}", raw, e)))?;
            filter = filter.add_directive(directive);
        }
        Ok(filter)
    }
}

/// Install the global subscriber
pub fn setup_logging(config: LoggingConfig) -> Result<()> {
    let env = std::env::var(EnvFilter::DEFAULT_ENV).ok();
    let filter = config.filter(env.as_deref())?;

    let builder = fmt::Subscriber::builder().with_env_filter(filter).with_target(true);
    let installed = match config.format {
        LogFormat::Pretty => builder.try_init(),
        LogFormat::Json => builder.json().with_current_span(true).with_span_list(false).try_init(),
    };
    installed.map_err(|e| CampaignError::configuration(format!("Failed to install subscriber: {}", e)))
}

/// Span that tags everything a background task logs with its owner
pub fn component_span(instance_id: &str, component: &'static str) -> Span {
    tracing::info_span!("campaign_engine", instance_id = %instance_id, component)
}

pub fn parse_log_level(level: &str) -> Result<Level> {
    Level::from_str(level).map_err(|_| CampaignError::configuration(format!("Invalid log level: {}", level)))
}

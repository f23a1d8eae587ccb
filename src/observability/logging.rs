//! # Structured Logging
//!
//! Initialises the global `tracing` subscriber. The filter comes from
//! `RUST_LOG` when set, otherwise a sane default that keeps the control
//! plane at info and the gRPC stack quiet.

use std::str::FromStr;

use tracing_subscriber::EnvFilter;

use crate::errors::{IsolineError, Result};

const DEFAULT_FILTER: &str = "isoline=info,tonic=warn,kube=warn";

/// Output format for process logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = IsolineError;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(IsolineError::config(format!("unknown log format '{}'", other))),
        }
    }
}

/// Install the global subscriber. Call once, before any task spawns.
pub fn init_logging(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    match format {
        LogFormat::Text => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
        LogFormat::Json => {
            tracing_subscriber::fmt().with_env_filter(filter).json().init();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_parsing() {
        assert_eq!("text".parse::<LogFormat>().unwrap(), LogFormat::Text);
        assert_eq!("json".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("yaml".parse::<LogFormat>().is_err());
    }
}

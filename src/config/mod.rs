//! Runtime configuration
//!
//! All configuration comes from the environment:
//! - `RESOURCE_TREE_HANDLER_API_PORT`: HTTP port for the served endpoints
//! - `URL_SSE`: endpoint of the upstream event bus (required)
//! - `DEBUG_LEVEL`: one of `debug`, `info`, `error` (default `info`)

use anyhow::{Context, Result};

pub const DEFAULT_API_PORT: u16 = 8085;

/// Logging verbosity selected via `DEBUG_LEVEL`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DebugLevel {
    Debug,
    #[default]
    Info,
    Error,
}

impl DebugLevel {
    fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "debug" => Self::Debug,
            "error" => Self::Error,
            _ => Self::Info,
        }
    }

    /// Directive for the tracing `EnvFilter`.
    pub fn as_filter(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Error => "error",
        }
    }

    pub fn is_debug(self) -> bool {
        matches!(self, Self::Debug)
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub api_port: u16,
    pub sse_url: String,
    pub debug_level: DebugLevel,
}

impl Config {
    /// Parse configuration from the environment. The SSE endpoint is
    /// required; a missing or unparsable port falls back to the default.
    pub fn from_env() -> Result<Self> {
        let sse_url = std::env::var("URL_SSE").unwrap_or_default();
        if sse_url.is_empty() {
            anyhow::bail!("URL_SSE cannot be empty");
        }
        url::Url::parse(&sse_url).with_context(|| format!("invalid URL_SSE '{}'", sse_url))?;

        let api_port = std::env::var("RESOURCE_TREE_HANDLER_API_PORT")
            .ok()
            .and_then(|raw| raw.parse::<u16>().ok())
            .unwrap_or(DEFAULT_API_PORT);

        let debug_level = DebugLevel::parse(
            &std::env::var("DEBUG_LEVEL").unwrap_or_default(),
        );

        Ok(Self {
            api_port,
            sse_url,
            debug_level,
        })
    }
}

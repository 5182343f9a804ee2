use meshtrace_consumer::ConsumerConfig;
use meshtrace_export::OtlpProtocol;
use serde::Serialize;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Tempo serves its HTTP query API on this port; the OTLP gRPC listener is
/// what the telemetry endpoint points at.
const BACKEND_HTTP_PORT: u16 = 3200;
const OTLP_GRPC_PORT: u16 = 4317;

/// Fatal configuration problems, surfaced at `start()`. Unsupported
/// protocol strings are rejected earlier, when `OtlpProtocol` is parsed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("exporter type {0} requires a telemetry endpoint")]
    MissingEndpoint(ExporterKind),
}

/// Which sink(s) the pipeline feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExporterKind {
    Console,
    Json,
    Otlp,
    Telemetry,
    Multi,
}

impl ExporterKind {
    /// OTLP-bound kinds run stream-through; everything else correlates.
    pub fn is_stream_through(&self) -> bool {
        matches!(self, ExporterKind::Otlp | ExporterKind::Telemetry)
    }
}

impl fmt::Display for ExporterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExporterKind::Console => "console",
            ExporterKind::Json => "json",
            ExporterKind::Otlp => "otlp",
            ExporterKind::Telemetry => "telemetry",
            ExporterKind::Multi => "multi",
        };
        f.write_str(name)
    }
}

impl FromStr for ExporterKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "console" => Ok(Self::Console),
            "json" => Ok(Self::Json),
            "otlp" => Ok(Self::Otlp),
            "telemetry" => Ok(Self::Telemetry),
            "multi" | "all" => Ok(Self::Multi),
            other => Err(format!("unknown exporter type: {other}")),
        }
    }
}

/// Full pipeline configuration. Environment variables are read at
/// construction only; nothing re-reads them at runtime.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub enabled: bool,
    pub consumer: ConsumerConfig,
    pub trace_timeout: Duration,
    pub grace_window: Duration,
    pub max_stored_traces: usize,
    pub exporter_type: ExporterKind,
    pub pretty_console_output: bool,
    pub json_output_directory: PathBuf,
    pub enable_stats: bool,
    pub telemetry_endpoint: Option<String>,
    pub telemetry_protocol: OtlpProtocol,
    pub backend_read_url: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            consumer: ConsumerConfig::default(),
            trace_timeout: Duration::from_secs(300),
            grace_window: Duration::from_secs(5),
            max_stored_traces: 1000,
            exporter_type: ExporterKind::Console,
            pretty_console_output: true,
            json_output_directory: PathBuf::from("./traces"),
            enable_stats: true,
            telemetry_endpoint: None,
            telemetry_protocol: OtlpProtocol::Grpc,
            backend_read_url: None,
        }
    }
}

impl PipelineConfig {
    /// Load from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let mut consumer = ConsumerConfig::from_env();
        consumer.enabled = env_parse("MCP_MESH_TRACE_ENABLED", false);

        Self {
            enabled: consumer.enabled,
            consumer,
            trace_timeout: Duration::from_secs(env_parse(
                "MCP_MESH_TRACE_TIMEOUT_SECS",
                defaults.trace_timeout.as_secs(),
            )),
            grace_window: Duration::from_secs(env_parse(
                "MCP_MESH_TRACE_GRACE_SECS",
                defaults.grace_window.as_secs(),
            )),
            max_stored_traces: env_parse("MCP_MESH_MAX_STORED_TRACES", defaults.max_stored_traces),
            exporter_type: std::env::var("MCP_MESH_TRACE_EXPORTER")
                .ok()
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(defaults.exporter_type),
            pretty_console_output: env_parse("MCP_MESH_PRETTY_CONSOLE", defaults.pretty_console_output),
            json_output_directory: std::env::var("MCP_MESH_JSON_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.json_output_directory),
            enable_stats: env_parse("MCP_MESH_TRACE_STATS", defaults.enable_stats),
            telemetry_endpoint: std::env::var("MCP_MESH_TELEMETRY_ENDPOINT")
                .ok()
                .filter(|e| !e.is_empty()),
            telemetry_protocol: std::env::var("MCP_MESH_TELEMETRY_PROTOCOL")
                .ok()
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(defaults.telemetry_protocol),
            backend_read_url: std::env::var("MCP_MESH_BACKEND_READ_URL")
                .ok()
                .filter(|u| !u.is_empty()),
        }
    }

    /// Where to query completed traces: an explicit override wins, otherwise
    /// the telemetry endpoint with the backend's HTTP API port substituted
    /// for the OTLP gRPC port.
    pub fn resolve_backend_read_url(&self) -> Option<String> {
        if let Some(explicit) = &self.backend_read_url {
            return Some(explicit.trim_end_matches('/').to_string());
        }
        let endpoint = self.telemetry_endpoint.as_deref()?;
        let mut url = Url::parse(endpoint).ok()?;
        if url.port() == Some(OTLP_GRPC_PORT) || url.port().is_none() {
            url.set_port(Some(BACKEND_HTTP_PORT)).ok()?;
        }
        if url.scheme() != "http" && url.scheme() != "https" {
            url.set_scheme("http").ok()?;
        }
        Some(url.to_string().trim_end_matches('/').to_string())
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exporter_kind_parsing() {
        assert_eq!("console".parse::<ExporterKind>().unwrap(), ExporterKind::Console);
        assert_eq!("json".parse::<ExporterKind>().unwrap(), ExporterKind::Json);
        assert_eq!("otlp".parse::<ExporterKind>().unwrap(), ExporterKind::Otlp);
        assert_eq!("telemetry".parse::<ExporterKind>().unwrap(), ExporterKind::Telemetry);
        assert_eq!("multi".parse::<ExporterKind>().unwrap(), ExporterKind::Multi);
        assert_eq!("all".parse::<ExporterKind>().unwrap(), ExporterKind::Multi);
        assert!("csv".parse::<ExporterKind>().is_err());
    }

    #[test]
    fn stream_through_split() {
        assert!(ExporterKind::Otlp.is_stream_through());
        assert!(ExporterKind::Telemetry.is_stream_through());
        assert!(!ExporterKind::Console.is_stream_through());
        assert!(!ExporterKind::Multi.is_stream_through());
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = PipelineConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.trace_timeout, Duration::from_secs(300));
        assert_eq!(config.grace_window, Duration::from_secs(5));
        assert_eq!(config.max_stored_traces, 1000);
        assert_eq!(config.exporter_type, ExporterKind::Console);
        assert!(config.enable_stats);
    }

    #[test]
    fn backend_url_prefers_explicit_override() {
        let config = PipelineConfig {
            backend_read_url: Some("http://tempo-query:3200/".to_string()),
            telemetry_endpoint: Some("http://tempo:4317".to_string()),
            ..PipelineConfig::default()
        };
        assert_eq!(
            config.resolve_backend_read_url().as_deref(),
            Some("http://tempo-query:3200")
        );
    }

    #[test]
    fn backend_url_derives_from_telemetry_endpoint() {
        let config = PipelineConfig {
            telemetry_endpoint: Some("http://tempo:4317".to_string()),
            ..PipelineConfig::default()
        };
        assert_eq!(
            config.resolve_backend_read_url().as_deref(),
            Some("http://tempo:3200")
        );
    }

    #[test]
    fn backend_url_absent_without_endpoints() {
        assert_eq!(PipelineConfig::default().resolve_backend_read_url(), None);
    }

    #[test]
    fn non_default_port_is_left_alone() {
        let config = PipelineConfig {
            telemetry_endpoint: Some("http://tempo:9999".to_string()),
            ..PipelineConfig::default()
        };
        assert_eq!(
            config.resolve_backend_read_url().as_deref(),
            Some("http://tempo:9999")
        );
    }
}

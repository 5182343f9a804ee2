use std::time::Duration;

/// Default stream the polyglot SDKs publish trace events to.
pub const DEFAULT_STREAM: &str = "mesh:trace";

/// Default consumer group shared by registry replicas.
pub const DEFAULT_GROUP: &str = "mcp-mesh-registry-processors";

/// Configuration for the trace stream consumer.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Master switch; a disabled consumer is inert.
    pub enabled: bool,
    /// Connection string for the event bus.
    pub event_bus_url: String,
    pub stream_name: String,
    pub consumer_group: String,
    /// Auto-generated from hostname + pid when left empty.
    pub consumer_name: String,
    /// Maximum entries per group read.
    pub batch_size: usize,
    /// Blocking-read deadline for group reads.
    pub block_timeout: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            event_bus_url: "redis://localhost:6379".to_string(),
            stream_name: DEFAULT_STREAM.to_string(),
            consumer_group: DEFAULT_GROUP.to_string(),
            consumer_name: default_consumer_name(),
            batch_size: 100,
            block_timeout: Duration::from_secs(5),
        }
    }
}

impl ConsumerConfig {
    /// Load from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: env_parse("MCP_MESH_TRACE_ENABLED", defaults.enabled),
            event_bus_url: std::env::var("REDIS_URL").unwrap_or(defaults.event_bus_url),
            stream_name: std::env::var("MCP_MESH_TRACE_STREAM").unwrap_or(defaults.stream_name),
            consumer_group: std::env::var("MCP_MESH_CONSUMER_GROUP")
                .unwrap_or(defaults.consumer_group),
            consumer_name: std::env::var("MCP_MESH_CONSUMER_NAME")
                .ok()
                .filter(|n| !n.is_empty())
                .unwrap_or(defaults.consumer_name),
            batch_size: env_parse("MCP_MESH_TRACE_BATCH_SIZE", defaults.batch_size),
            block_timeout: Duration::from_secs(env_parse(
                "MCP_MESH_TRACE_BLOCK_TIMEOUT_SECS",
                defaults.block_timeout.as_secs(),
            )),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

fn default_consumer_name() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "registry".to_string());
    format!("{}-{}", host, std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_wire_contract() {
        let config = ConsumerConfig::default();
        assert_eq!(config.stream_name, "mesh:trace");
        assert_eq!(config.consumer_group, "mcp-mesh-registry-processors");
        assert_eq!(config.batch_size, 100);
        assert_eq!(config.block_timeout, Duration::from_secs(5));
        assert!(config.enabled);
    }

    #[test]
    fn consumer_name_is_auto_generated() {
        let config = ConsumerConfig::default();
        assert!(!config.consumer_name.is_empty());
        assert!(config
            .consumer_name
            .ends_with(&std::process::id().to_string()));
    }
}

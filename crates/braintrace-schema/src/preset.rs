use crate::config::{parse_config_str, BootstrapConfig, ConfigError};

/// Config used when no `--config` file is given: the embedded graph engine
/// and the local inference server, in that order.
pub const DEFAULT_CONFIG: &str = r#"config_version = 1
shutdown_grace_secs = 10
probe_interval_ms = 500

[[dependency]]
name = "graph-engine"
attach_only = true
criticality = "fatal"
readiness_timeout_secs = 60
endpoint_env = "NEO4J_ADDR"
readiness = { tcp = "127.0.0.1:7687" }

[dependency.spawn]
program = "neo4j/bin/neo4j"
args = ["console"]
fallbacks = ["neo4j/bin/neo4j.sh"]

[[dependency]]
name = "inference-server"
attach_only = true
criticality = "fatal"
readiness_timeout_secs = 120
reuse_running = true
endpoint_env = "OLLAMA_API_URL"
readiness = { http = "http://localhost:11434", path = "/api/tags" }

[dependency.spawn]
program = "ollama"
args = ["serve"]
search_paths = ["ollama"]
"#;

pub fn default_config() -> Result<BootstrapConfig, ConfigError> {
    parse_config_str(DEFAULT_CONFIG)
}

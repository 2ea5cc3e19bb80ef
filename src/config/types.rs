use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::config::loader::get_data_dir;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub server: ServerConfig,
    pub engine: EngineConfig,
    pub supervisor: SupervisorConfig,
    pub logs: LogsConfig,
    pub directory: DirectoryConfig,
    pub preview: PreviewConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to bind the HTTP server to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Bearer token required on every route and on the log socket (None = open)
    pub auth_token: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 3001,
            auth_token: None,
        }
    }
}

/// A `host:container` port pair published on every tenant pod.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub host: u16,
    pub container: u16,
}

/// Container engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Engine CLI binary (podman-compatible)
    pub binary: String,
    /// Image used for sandbox containers
    pub base_image: String,
    /// Prefix of pod names that belong to tenants
    pub pod_prefix: String,
    /// Ports published when a tenant pod is created
    pub port_mappings: Vec<PortMapping>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: "podman".to_string(),
            base_image: "localhost/node:20-slim-with-git".to_string(),
            pod_prefix: "tenant-".to_string(),
            port_mappings: vec![
                PortMapping {
                    host: 8081,
                    container: 3000,
                },
                PortMapping {
                    host: 8080,
                    container: 8080,
                },
                PortMapping {
                    host: 5000,
                    container: 5000,
                },
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Working directory used when a start request omits one
    pub default_workdir: String,
    /// Command used when a start request omits one
    pub default_command: String,
    /// Dependency install step run before the command
    pub install_command: String,
    /// Seconds between SIGTERM and SIGKILL when terminating a process
    pub grace_period_secs: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            default_workdir: "/sandbox/repo".to_string(),
            default_command: "npm run dev".to_string(),
            install_command: "npm install --legacy-peer-deps".to_string(),
            grace_period_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogsConfig {
    /// Directory holding one log file per managed process
    pub dir: PathBuf,
    pub retention: RetentionConfig,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            dir: get_data_dir().join("logs"),
            retention: RetentionConfig::default(),
        }
    }
}

/// Eviction policy for finished processes and their log files.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Finished processes kept, newest first
    pub max_finished: usize,
    /// Finished processes older than this are evicted
    pub max_age_secs: u64,
    /// How often the sweeper runs (0 disables it)
    pub sweep_interval_secs: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_finished: 200,
            max_age_secs: 7 * 24 * 3600,
            sweep_interval_secs: 300,
        }
    }
}

/// Parse-compatible directory service used to mirror tenant and sandbox records.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    pub enabled: bool,
    pub server_url: String,
    pub app_id: String,
    pub master_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            server_url: "http://localhost:1337/parse".to_string(),
            app_id: "myAppId".to_string(),
            master_key: None,
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    /// Container ports that are published on every pod and may be previewed
    pub ports: Vec<u16>,
    /// Host name used in access URLs
    pub host: String,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            ports: vec![3000, 8080, 5000],
            host: "localhost".to_string(),
        }
    }
}

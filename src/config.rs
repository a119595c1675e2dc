//! Configuration management for the memory sync service

use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub device: DeviceConfig,
    pub remote: RemoteConfig,
    pub sync: SyncConfig,
    pub database: DatabaseConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Identity of this replica
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    pub platform: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteConfig {
    pub provider: RemoteProvider,
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: Option<String>,
    /// Key prefix under which memory collections live
    pub prefix: String,
    /// Upper bound for a single remote call
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RemoteProvider {
    Minio,
    R2,
    S3,
    B2,
    /// Process-local store, useful offline and in tests
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Hours acknowledged outbox rows are kept before a push purges them
    pub outbox_retention_hours: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 3000,
            },
            device: DeviceConfig {
                id: default_device_id(),
                platform: env::consts::OS.to_string(),
            },
            remote: RemoteConfig {
                provider: RemoteProvider::Memory,
                endpoint: "http://localhost:9000".to_string(),
                bucket: "memory".to_string(),
                access_key: "admin".to_string(),
                secret_key: "password123".to_string(),
                region: Some("us-east-1".to_string()),
                prefix: "memory".to_string(),
                timeout_secs: 10,
            },
            sync: SyncConfig {
                outbox_retention_hours: 24,
            },
            database: DatabaseConfig {
                url: "sqlite:./memory.db".to_string(),
            },
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, env::VarError> {
        let provider = RemoteProvider::parse(
            &env::var("REMOTE_PROVIDER").unwrap_or_else(|_| "minio".to_string()),
        );

        // Credentials are only mandatory when talking to a real bucket
        let required = |name: &str, fallback: &str| -> Result<String, env::VarError> {
            match provider {
                RemoteProvider::Memory => Ok(env::var(name).unwrap_or_else(|_| fallback.to_string())),
                _ => env::var(name),
            }
        };

        Ok(Config {
            server: ServerConfig {
                host: env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env::var("SERVER_PORT")
                    .unwrap_or_else(|_| "3000".to_string())
                    .parse()
                    .unwrap_or(3000),
            },
            device: DeviceConfig {
                id: env::var("DEVICE_ID").unwrap_or_else(|_| default_device_id()),
                platform: env::var("DEVICE_PLATFORM")
                    .unwrap_or_else(|_| env::consts::OS.to_string()),
            },
            remote: RemoteConfig {
                provider,
                endpoint: required("S3_ENDPOINT", "http://localhost:9000")?,
                bucket: required("S3_BUCKET", "memory")?,
                access_key: required("S3_ACCESS_KEY", "admin")?,
                secret_key: required("S3_SECRET_KEY", "password123")?,
                region: env::var("S3_REGION").ok(),
                prefix: env::var("S3_PREFIX").unwrap_or_else(|_| "memory".to_string()),
                timeout_secs: env::var("REMOTE_TIMEOUT_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(10),
            },
            sync: SyncConfig {
                outbox_retention_hours: env::var("OUTBOX_RETENTION_HOURS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .filter(|h: &i64| *h >= 0)
                    .unwrap_or(24),
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite:./memory.db".to_string()),
            },
        })
    }
}

impl RemoteProvider {
    fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "r2" => RemoteProvider::R2,
            "s3" => RemoteProvider::S3,
            "b2" => RemoteProvider::B2,
            "memory" => RemoteProvider::Memory,
            _ => RemoteProvider::Minio,
        }
    }
}

fn default_device_id() -> String {
    env::var("HOSTNAME").unwrap_or_else(|_| "local-device".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_parsing() {
        assert_eq!(RemoteProvider::parse("memory"), RemoteProvider::Memory);
        assert_eq!(RemoteProvider::parse("R2"), RemoteProvider::R2);
        assert_eq!(RemoteProvider::parse("unknown"), RemoteProvider::Minio);
    }

    #[test]
    fn test_default_uses_memory_remote() {
        let config = Config::default();
        assert_eq!(config.remote.provider, RemoteProvider::Memory);
        assert_eq!(config.remote.timeout_secs, 10);
        assert_eq!(config.sync.outbox_retention_hours, 24);
    }
}

use std::{env, fs, net::SocketAddr, path::PathBuf};

use anyhow::Result;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub api_key: String,
    pub api_key_is_fallback: bool,
    pub database_path: PathBuf,
    pub queue_capacity: usize,
    pub retention_seconds: u64,
    pub file_store_url: String,
    pub file_store_api_key: Option<String>,
    pub http_timeout_seconds: u64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let bind_raw =
            env::var("PUBLISH_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let bind_normalized = bind_raw
            .trim()
            .trim_matches('"')
            .trim_matches('\'')
            .to_string();
        let bind_addr = bind_normalized
            .parse::<SocketAddr>()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], 8080)));

        let (api_key, api_key_is_fallback) = resolve_api_key();

        let database_path = PathBuf::from(
            env::var("PUBLISH_DB_PATH").unwrap_or_else(|_| "/data/publish/publish.db".to_string()),
        );

        let queue_capacity = parse_var("PUBLISH_QUEUE_CAPACITY").unwrap_or(128);

        let retention_seconds = parse_var("PUBLISH_PLAN_RETENTION_SECONDS").unwrap_or(7 * 24 * 60 * 60);

        let file_store_url = env::var("PUBLISH_FILE_STORE_URL")
            .map(|v| v.trim().trim_end_matches('/').to_string())
            .unwrap_or_else(|_| "http://127.0.0.1:3100".to_string());

        let file_store_api_key = env::var("PUBLISH_FILE_STORE_API_KEY")
            .ok()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());

        let http_timeout_seconds = parse_var("PUBLISH_HTTP_TIMEOUT_SECONDS").unwrap_or(30);

        Ok(Self {
            bind_addr,
            api_key,
            api_key_is_fallback,
            database_path,
            queue_capacity,
            retention_seconds,
            file_store_url,
            file_store_api_key,
            http_timeout_seconds,
        })
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn resolve_api_key() -> (String, bool) {
    if let Ok(value) = env::var("PUBLISH_API_KEY") {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            return (trimmed.to_string(), false);
        }
    }

    if let Ok(key_file) = env::var("PUBLISH_API_KEY_FILE") {
        match fs::read_to_string(&key_file) {
            Ok(raw) => {
                let trimmed = raw.trim();
                if !trimmed.is_empty() {
                    return (trimmed.to_string(), false);
                }
                eprintln!(
                    "[workbook-publish-api] PUBLISH_API_KEY_FILE is empty: {}. Falling back to generated key.",
                    key_file
                );
            }
            Err(err) => {
                eprintln!(
                    "[workbook-publish-api] Failed reading PUBLISH_API_KEY_FILE at {}: {}. Falling back to generated key.",
                    key_file, err
                );
            }
        }
    } else {
        eprintln!("[workbook-publish-api] PUBLISH_API_KEY not set. Falling back to generated key.");
    }

    let generated = format!("fallback-{}", Uuid::new_v4());
    (generated, true)
}

use crate::geocode::GeocoderConfig;
use crate::images::StorageStrategy;
use std::{env, path::PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnv {
    Development,
    Production,
}

impl AppEnv {
    pub fn from_env() -> Self {
        match env::var("APP_ENV").as_deref().map(str::trim) {
            Ok("production") => AppEnv::Production,
            _ => AppEnv::Development,
        }
    }

    pub fn is_production(self) -> bool {
        self == AppEnv::Production
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub env: AppEnv,
    pub port: u16,
    pub public_dir: PathBuf,
    pub redis_url: Option<String>,
    pub redis_prefix: String,
    pub geocoder: GeocoderConfig,
    pub storage: StorageStrategy,
    pub admin_secret: Option<String>,
    pub seed_owner: Option<String>,
    pub metrics_key: Option<String>,
    pub request_max_bytes: usize,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let public_dir = PathBuf::from(non_empty("PUBLIC_DIR").unwrap_or_else(|| "public".into()));
        Self {
            env: AppEnv::from_env(),
            port: non_empty("PORT")
                .and_then(|value| value.parse().ok())
                .unwrap_or(8080),
            storage: StorageStrategy::from_env(public_dir.clone()),
            public_dir,
            redis_url: non_empty("REDIS_URL"),
            redis_prefix: non_empty("REDIS_PREFIX").unwrap_or_else(|| "wanderlust".into()),
            geocoder: GeocoderConfig::from_env(),
            admin_secret: non_empty("ADMIN_SECRET"),
            seed_owner: non_empty("SEED_OWNER"),
            metrics_key: non_empty("METRICS_KEY"),
            request_max_bytes: non_empty("REQUEST_MAX_BYTES")
                .and_then(|v| v.parse::<usize>().ok())
                .filter(|v| *v > 0)
                .unwrap_or(10 * 1024 * 1024),
        }
    }

    /// Local disk, memory store, no geocoding credential.
    #[cfg(test)]
    pub fn local(public_dir: PathBuf) -> Self {
        Self {
            env: AppEnv::Development,
            port: 0,
            storage: StorageStrategy::LocalDisk {
                public_dir: public_dir.clone(),
            },
            public_dir,
            redis_url: None,
            redis_prefix: "wanderlust-test".into(),
            geocoder: GeocoderConfig {
                base_url: "http://127.0.0.1:9".into(),
                api_key: None,
                timeout: std::time::Duration::from_secs(1),
            },
            admin_secret: None,
            seed_owner: None,
            metrics_key: None,
            request_max_bytes: 1024 * 1024,
        }
    }
}

fn non_empty(name: &str) -> Option<String> {
    env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

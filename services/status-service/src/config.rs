use routeflow_common::{env_opt, env_or};
use std::time::Duration;

use crate::stream::StreamSettings;

const DEFAULT_API_BASE: &str = "https://api.nextbillion.io";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres { database_url: String },
    Memory,
}

#[derive(Clone, Debug)]
pub struct StatusServiceConfig {
    pub port: u16,
    pub store: StoreBackend,
    pub api_base: String,
    pub api_key: Option<String>,
    pub fallback_timeout: Duration,
    pub stream: StreamSettings,
}

impl StatusServiceConfig {
    pub fn from_env() -> Self {
        let database_url = env_opt("DATABASE_URL");
        let store = match (env_opt("STATUS_STORE").as_deref(), database_url) {
            (Some("memory"), _) | (_, None) => StoreBackend::Memory,
            (_, Some(database_url)) => StoreBackend::Postgres { database_url },
        };

        // Keep the fallback call shorter than one tick.
        let tick = Duration::from_millis(env_or("STREAM_TICK_MS", 1000u64).max(1));
        let fallback_timeout = Duration::from_millis(env_or("FALLBACK_TIMEOUT_MS", 900u64))
            .min(tick)
            .max(Duration::from_millis(1));

        Self {
            port: env_or("PORT", 8080u16),
            store,
            api_base: env_opt("NEXTBILLION_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            api_key: env_opt("NEXTBILLION_API_KEY"),
            fallback_timeout,
            stream: StreamSettings {
                tick,
                max_ticks: env_or("STREAM_MAX_TICKS", 600u32).max(1),
                fallback_every: env_or("STREAM_FALLBACK_EVERY", 3u32).max(1),
            },
        }
    }
}

use config::{Config, Environment};
use serde::Deserialize;

#[derive(Deserialize, Debug, Default)]
pub struct EnvConfig {
    pub docker_host: Option<String>,
    pub startup_timeout_secs: Option<u64>,
    pub poll_interval_ms: Option<u64>,
}

impl EnvConfig {
    pub fn new() -> Self {
        let config = Config::builder()
            .add_source(
                Environment::default()
                    .prefix("CONTAINER_FIXTURE")
                    .separator("__")
                    .try_parsing(true)
                    .ignore_empty(true),
            )
            .build()
            .unwrap();
        config.try_deserialize().unwrap()
    }
}

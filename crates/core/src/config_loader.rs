use crate::config::AppConfig;
use anyhow::Result;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};

pub struct ConfigLoader;

impl ConfigLoader {
    /// Loads application configuration by merging TOML and environment variables.
    ///
    /// Nested keys map through `PERPBOT_` with `__` separators
    /// (`PERPBOT_SERVER__PORT=3001`). Three flat variables are also honored
    /// for container deployments: `EXCHANGE_BASE_URL`, `API_PORT`,
    /// `CORS_ORIGIN`.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration files cannot be read or parsed.
    pub fn load() -> Result<AppConfig> {
        let mut config: AppConfig = Figment::new()
            .merge(Toml::file("config/Config.toml"))
            .merge(Env::prefixed("PERPBOT_").split("__"))
            .extract()?;

        if let Ok(url) = std::env::var("EXCHANGE_BASE_URL") {
            config.exchange.base_url = url;
        }
        if let Ok(port) = std::env::var("API_PORT") {
            config.server.port = port.parse()?;
        }
        if let Ok(origin) = std::env::var("CORS_ORIGIN") {
            config.cors.allowed_origin = Some(origin);
        }

        Ok(config)
    }
}

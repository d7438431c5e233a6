//! API server configuration

use numera_shared::{env_or, env_parse_or, required_env, ConfigError};

const DEFAULT_ALLOWED_ORIGINS: &str = "http://localhost:3000,http://127.0.0.1:3000";

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub bind_address: String,
    /// HS256 secret shared with the identity provider
    pub jwt_secret: String,
    /// Bearer token the external scheduler presents to the monitor endpoint
    pub cron_secret: String,
    pub allowed_origins: Vec<String>,
    pub run_migrations: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut missing = Vec::new();
        let mut required = |key: &str| match required_env(key) {
            Ok(value) => value,
            Err(_) => {
                missing.push(key.to_string());
                String::new()
            }
        };

        let database_url = required("DATABASE_URL");
        let jwt_secret = required("AUTH_JWT_SECRET");
        let cron_secret = required("CRON_SECRET_TOKEN");

        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }

        Ok(Self {
            database_url,
            database_max_connections: env_parse_or("DATABASE_MAX_CONNECTIONS", 10u32)?,
            bind_address: env_or("BIND_ADDRESS", "0.0.0.0:8080"),
            jwt_secret,
            cron_secret,
            allowed_origins: parse_origins(&env_or("ALLOWED_ORIGINS", DEFAULT_ALLOWED_ORIGINS)),
            run_migrations: numera_shared::env_flag("RUN_MIGRATIONS", true)?,
        })
    }
}

fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_origins_skips_blanks() {
        assert_eq!(
            parse_origins(" https://numera.app , ,http://localhost:3000,"),
            vec!["https://numera.app", "http://localhost:3000"]
        );
    }

    #[test]
    fn test_default_origins() {
        assert_eq!(parse_origins(DEFAULT_ALLOWED_ORIGINS).len(), 2);
    }
}

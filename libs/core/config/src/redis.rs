use crate::{ConfigError, FromEnv, env_parse};

/// Redis connection settings for the queue broker.
#[derive(Clone, Debug)]
pub struct RedisConfig {
    /// Redis connection URL (e.g. "redis://127.0.0.1:6379")
    pub url: String,

    /// Optional logical database number, appended to the URL when set
    pub database: Option<u8>,
}

impl RedisConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            database: None,
        }
    }

    pub fn with_database(mut self, database: u8) -> Self {
        self.database = Some(database);
        self
    }

    /// Connection URL with the database suffix applied.
    pub fn connection_url(&self) -> String {
        match self.database {
            Some(db) => format!("{}/{}", self.url.trim_end_matches('/'), db),
            None => self.url.clone(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self::new("redis://127.0.0.1:6379")
    }
}

impl FromEnv for RedisConfig {
    /// - `REDIS_URL` or `REDIS_HOST` (required)
    /// - `REDIS_DATABASE` (optional)
    fn from_env() -> Result<Self, ConfigError> {
        let url = std::env::var("REDIS_URL")
            .or_else(|_| std::env::var("REDIS_HOST"))
            .map_err(|_| ConfigError::MissingEnvVar("REDIS_URL or REDIS_HOST".to_string()))?;

        let database = match std::env::var("REDIS_DATABASE") {
            Ok(_) => Some(env_parse("REDIS_DATABASE", 0u8)?),
            Err(_) => None,
        };

        Ok(Self { url, database })
    }
}

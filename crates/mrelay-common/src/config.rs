use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum GlobalConfigError {
    #[error("missing required global config field: {0}")]
    MissingField(&'static str),
}

/// Final, merged global configuration used by the running process.
///
/// Merge order (after DB connection): CLI > ENV > DB, then persist back to DB.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub host: String,
    pub port: u16,
    /// Database DSN used by this process.
    pub sql_dsn: String,
    /// Optional distributed cache; in-memory indexes stay authoritative.
    pub redis_conn_string: Option<String>,
    /// Must be identical across nodes.
    pub session_secret: String,
    pub crypto_secret: String,
    /// Per-event stream inactivity timeout, seconds.
    pub streaming_timeout: u64,
    /// Max attempts across distinct channels for one client request.
    pub retry_times: u32,
    /// Ability cache rebuild interval, seconds.
    pub channel_update_frequency: u64,
    /// Max async-task list page size.
    pub task_query_limit: usize,
    /// Coalesce used_quota increments through the storage bus.
    pub batch_update_enabled: bool,
    /// Optional outbound proxy for upstream egress.
    pub proxy: Option<String>,
    /// Price table overrides, model name -> ratio.
    pub model_ratio_overrides: Option<serde_json::Value>,
}

/// Optional layer used for merging global config.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub sql_dsn: Option<String>,
    pub redis_conn_string: Option<String>,
    pub session_secret: Option<String>,
    pub crypto_secret: Option<String>,
    pub streaming_timeout: Option<u64>,
    pub retry_times: Option<u32>,
    pub channel_update_frequency: Option<u64>,
    pub task_query_limit: Option<usize>,
    pub batch_update_enabled: Option<bool>,
    pub proxy: Option<String>,
    pub model_ratio_overrides: Option<serde_json::Value>,
}

impl GlobalConfigPatch {
    pub fn overlay(&mut self, other: GlobalConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.sql_dsn.is_some() {
            self.sql_dsn = other.sql_dsn;
        }
        if other.redis_conn_string.is_some() {
            self.redis_conn_string = other.redis_conn_string;
        }
        if other.session_secret.is_some() {
            self.session_secret = other.session_secret;
        }
        if other.crypto_secret.is_some() {
            self.crypto_secret = other.crypto_secret;
        }
        if other.streaming_timeout.is_some() {
            self.streaming_timeout = other.streaming_timeout;
        }
        if other.retry_times.is_some() {
            self.retry_times = other.retry_times;
        }
        if other.channel_update_frequency.is_some() {
            self.channel_update_frequency = other.channel_update_frequency;
        }
        if other.task_query_limit.is_some() {
            self.task_query_limit = other.task_query_limit;
        }
        if other.batch_update_enabled.is_some() {
            self.batch_update_enabled = other.batch_update_enabled;
        }
        if other.proxy.is_some() {
            self.proxy = other.proxy;
        }
        if other.model_ratio_overrides.is_some() {
            self.model_ratio_overrides = other.model_ratio_overrides;
        }
    }

    pub fn into_config(self) -> Result<GlobalConfig, GlobalConfigError> {
        Ok(GlobalConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(3000),
            sql_dsn: self
                .sql_dsn
                .ok_or(GlobalConfigError::MissingField("sql_dsn"))?,
            redis_conn_string: self.redis_conn_string,
            session_secret: self
                .session_secret
                .ok_or(GlobalConfigError::MissingField("session_secret"))?,
            crypto_secret: self
                .crypto_secret
                .ok_or(GlobalConfigError::MissingField("crypto_secret"))?,
            streaming_timeout: self.streaming_timeout.unwrap_or(60),
            retry_times: self.retry_times.unwrap_or(3),
            channel_update_frequency: self.channel_update_frequency.unwrap_or(30),
            task_query_limit: self.task_query_limit.unwrap_or(100),
            batch_update_enabled: self.batch_update_enabled.unwrap_or(false),
            proxy: self.proxy,
            model_ratio_overrides: self.model_ratio_overrides,
        })
    }
}

impl From<GlobalConfig> for GlobalConfigPatch {
    fn from(value: GlobalConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            sql_dsn: Some(value.sql_dsn),
            redis_conn_string: value.redis_conn_string,
            session_secret: Some(value.session_secret),
            crypto_secret: Some(value.crypto_secret),
            streaming_timeout: Some(value.streaming_timeout),
            retry_times: Some(value.retry_times),
            channel_update_frequency: Some(value.channel_update_frequency),
            task_query_limit: Some(value.task_query_limit),
            batch_update_enabled: Some(value.batch_update_enabled),
            proxy: value.proxy,
            model_ratio_overrides: value.model_ratio_overrides,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_patch() -> GlobalConfigPatch {
        GlobalConfigPatch {
            sql_dsn: Some("sqlite::memory:".to_string()),
            session_secret: Some("s".to_string()),
            crypto_secret: Some("c".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn overlay_prefers_later_layer() {
        let mut db = base_patch();
        db.port = Some(3000);
        let env = GlobalConfigPatch {
            port: Some(8080),
            ..Default::default()
        };
        db.overlay(env);
        let config = db.into_config().unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.streaming_timeout, 60);
        assert_eq!(config.retry_times, 3);
    }

    #[test]
    fn missing_dsn_is_an_error() {
        let patch = GlobalConfigPatch {
            session_secret: Some("s".to_string()),
            crypto_secret: Some("c".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            patch.into_config(),
            Err(GlobalConfigError::MissingField("sql_dsn"))
        ));
    }
}

use clap::Parser;

use mrelay_common::GlobalConfigPatch;

/// Unified multi-provider AI API relay.
#[derive(Debug, Parser)]
#[command(name = "mrelay", version, about)]
pub struct Cli {
    #[arg(long, env = "HOST")]
    pub host: Option<String>,

    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// Database DSN (sqlite://, mysql://, postgres://).
    #[arg(long, env = "SQL_DSN")]
    pub sql_dsn: Option<String>,

    #[arg(long, env = "REDIS_CONN_STRING")]
    pub redis_conn_string: Option<String>,

    /// Must match across nodes.
    #[arg(long, env = "SESSION_SECRET")]
    pub session_secret: Option<String>,

    #[arg(long, env = "CRYPTO_SECRET")]
    pub crypto_secret: Option<String>,

    /// Per-event stream inactivity timeout, seconds.
    #[arg(long, env = "STREAMING_TIMEOUT")]
    pub streaming_timeout: Option<u64>,

    /// Retry attempts across distinct channels.
    #[arg(long, env = "RETRY_TIMES")]
    pub retry_times: Option<u32>,

    /// Ability cache refresh interval, seconds.
    #[arg(long, env = "CHANNEL_UPDATE_FREQUENCY")]
    pub channel_update_frequency: Option<u64>,

    /// Max async-task list page size.
    #[arg(long, env = "TASK_QUERY_LIMIT")]
    pub task_query_limit: Option<usize>,

    /// Coalesce used_quota increments.
    #[arg(long, env = "BATCH_UPDATE_ENABLED")]
    pub batch_update_enabled: Option<bool>,

    /// Outbound proxy for upstream egress.
    #[arg(long, env = "RELAY_PROXY")]
    pub proxy: Option<String>,
}

impl Cli {
    pub fn into_patch(self) -> GlobalConfigPatch {
        GlobalConfigPatch {
            host: self.host,
            port: self.port,
            sql_dsn: self.sql_dsn,
            redis_conn_string: self.redis_conn_string,
            session_secret: self.session_secret,
            crypto_secret: self.crypto_secret,
            streaming_timeout: self.streaming_timeout,
            retry_times: self.retry_times,
            channel_update_frequency: self.channel_update_frequency,
            task_query_limit: self.task_query_limit,
            batch_update_enabled: self.batch_update_enabled,
            proxy: self.proxy,
            model_ratio_overrides: None,
        }
    }
}

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;

use mrelay_common::{ChannelKind, ChannelStatus, TokenStatus, UserStatus};

/// Plain rows decoupled from the ORM; everything above the storage crate
/// works with these.
#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: i64,
    pub group: String,
    pub quota: i64,
    pub used_quota: i64,
    pub request_count: i64,
    pub status: UserStatus,
    pub is_admin: bool,
}

#[derive(Debug, Clone)]
pub struct TokenRow {
    pub id: i64,
    pub user_id: i64,
    pub key: String,
    pub name: Option<String>,
    pub remain_quota: i64,
    pub unlimited_quota: bool,
    pub expired_at: i64,
    pub allowed_models: Option<Vec<String>>,
    pub allowed_groups: Option<Vec<String>>,
    pub specific_channel_id: Option<i64>,
    pub status: TokenStatus,
}

impl TokenRow {
    pub fn is_expired(&self, now_unix: i64) -> bool {
        self.expired_at != 0 && self.expired_at <= now_unix
    }
}

/// HTTP status classification override carried per channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusCodeMapping {
    #[serde(default)]
    pub retry: Vec<u16>,
    #[serde(default)]
    pub disable: Vec<u16>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelSetting {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxy: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region_weights: Option<HashMap<String, u32>>,
    #[serde(default)]
    pub sdk_mode: bool,
}

#[derive(Debug, Clone)]
pub struct ChannelRow {
    pub id: i64,
    pub name: String,
    pub kind: ChannelKind,
    /// Ordered credential list; selection round-robins over it.
    pub keys: Vec<String>,
    pub base_url: Option<String>,
    pub models: Vec<String>,
    pub groups: Vec<String>,
    pub model_mapping: HashMap<String, String>,
    pub priority: i64,
    pub weight: u32,
    pub status: ChannelStatus,
    pub auto_ban: bool,
    pub status_code_mapping: Option<StatusCodeMapping>,
    pub setting: ChannelSetting,
}

impl ChannelRow {
    pub fn serves(&self, group: &str, model: &str) -> bool {
        self.groups.iter().any(|g| g == group) && self.models.iter().any(|m| m == model)
    }

    /// Provider-native name for a canonical model.
    pub fn mapped_model<'a>(&'a self, model: &'a str) -> &'a str {
        self.model_mapping
            .get(model)
            .map(String::as_str)
            .unwrap_or(model)
    }
}

#[derive(Debug, Clone)]
pub struct AbilityRow {
    pub group: String,
    pub model: String,
    pub channel_id: i64,
    pub enabled: bool,
    pub priority: i64,
    pub weight: u32,
}

#[derive(Debug, Clone)]
pub struct StorageSnapshot {
    pub channels: Vec<ChannelRow>,
    pub abilities: Vec<AbilityRow>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Submitted,
    InProgress,
    Success,
    Failure,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Submitted => "submitted",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Success => "success",
            TaskStatus::Failure => "failure",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "in_progress" => TaskStatus::InProgress,
            "success" => TaskStatus::Success,
            "failure" => TaskStatus::Failure,
            _ => TaskStatus::Submitted,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failure)
    }
}

#[derive(Debug, Clone)]
pub struct TaskRow {
    pub id: i64,
    pub task_id: String,
    pub platform: String,
    pub user_id: i64,
    pub token_id: i64,
    pub channel_id: i64,
    pub action: String,
    pub status: TaskStatus,
    pub progress: i32,
    pub submit_at: OffsetDateTime,
    pub start_at: Option<OffsetDateTime>,
    pub finish_at: Option<OffsetDateTime>,
    pub quota: i64,
    pub quota_settled: bool,
    pub fail_reason: Option<String>,
    pub result_data: Option<Value>,
}

#[derive(Debug, Clone)]
pub struct TaskInsert {
    pub task_id: String,
    pub platform: String,
    pub user_id: i64,
    pub token_id: i64,
    pub channel_id: i64,
    pub action: String,
    pub quota: i64,
}

/// Mutable slice of a task the poller is allowed to touch.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub status: Option<TaskStatus>,
    pub progress: Option<i32>,
    pub start_at: Option<OffsetDateTime>,
    pub finish_at: Option<OffsetDateTime>,
    pub quota_settled: Option<bool>,
    pub fail_reason: Option<String>,
    pub result_data: Option<Value>,
}

/// Coalesced billing update; `requests` carries how many settles it merges.
#[derive(Debug, Clone, Copy)]
pub struct QuotaDelta {
    pub user_id: i64,
    pub token_id: i64,
    pub delta: i64,
    pub actual: i64,
    pub requests: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogKind {
    Consume,
    TopUp,
    System,
    Error,
    TaskRefund,
}

impl LogKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogKind::Consume => "consume",
            LogKind::TopUp => "top-up",
            LogKind::System => "system",
            LogKind::Error => "error",
            LogKind::TaskRefund => "task-refund",
        }
    }
}

#[derive(Debug, Clone)]
pub struct LogInsert {
    pub kind: LogKind,
    pub user_id: i64,
    pub token_id: Option<i64>,
    pub channel_id: Option<i64>,
    pub model: Option<String>,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub quota: i64,
    pub elapsed_ms: i64,
    pub is_stream: bool,
    pub content: String,
}

impl LogInsert {
    pub fn system(user_id: i64, content: impl Into<String>) -> Self {
        Self {
            kind: LogKind::System,
            user_id,
            token_id: None,
            channel_id: None,
            model: None,
            prompt_tokens: 0,
            completion_tokens: 0,
            quota: 0,
            elapsed_ms: 0,
            is_stream: false,
            content: content.into(),
        }
    }
}

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use mrelay_adapter::{AdapterRegistry, AdapterResponse, RelayContext, RelayRequest};
use mrelay_storage::{LogInsert, LogKind, TaskPatch, TaskRow, TaskStatus};

use crate::ability::AbilityCache;
use crate::ledger::Ledger;
use crate::price::PriceTable;

/// Advances Midjourney/Suno jobs: scans non-terminal tasks, fetches their
/// upstream state grouped by channel, applies transitions, and finalises the
/// quota reservation exactly once per task.
pub struct TaskPoller {
    ledger: Arc<Ledger>,
    cache: Arc<AbilityCache>,
    registry: AdapterRegistry,
    prices: PriceTable,
    interval: Duration,
    stream_timeout: Duration,
}

impl TaskPoller {
    pub fn new(
        ledger: Arc<Ledger>,
        cache: Arc<AbilityCache>,
        registry: AdapterRegistry,
        prices: PriceTable,
        interval: Duration,
        stream_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            cache,
            registry,
            prices,
            interval,
            stream_timeout,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = self.tick().await {
                    tracing::error!(event = "task_poll_failed", error = %err);
                }
            }
        })
    }

    /// One poll round. Public so tests can drive the poller deterministically.
    pub async fn tick(&self) -> Result<(), crate::error::RelayError> {
        let tasks = self.ledger.store().unfinished_tasks().await?;
        if tasks.is_empty() {
            return Ok(());
        }

        let mut by_channel: HashMap<i64, Vec<TaskRow>> = HashMap::new();
        for task in tasks {
            by_channel.entry(task.channel_id).or_default().push(task);
        }

        for (channel_id, tasks) in by_channel {
            let Some(channel) = self.cache.channel(channel_id) else {
                // Channel is gone; the job can never be fetched again.
                for task in tasks {
                    self.finalize(
                        &task,
                        TaskStatus::Failure,
                        Some("channel no longer exists".to_string()),
                        None,
                        None,
                    )
                    .await;
                }
                continue;
            };

            for task in tasks {
                let request = match task.platform.as_str() {
                    "mj" => RelayRequest::MjFetch {
                        task_id: task.task_id.clone(),
                    },
                    _ => RelayRequest::SunoFetch {
                        task_id: task.task_id.clone(),
                    },
                };
                let ctx = RelayContext {
                    trace_id: format!("task-{}", task.task_id),
                    channel_id: channel.id,
                    kind: channel.kind,
                    base_url: channel.base_url.clone(),
                    key: self.cache.next_key(&channel),
                    canonical_model: task.platform.clone(),
                    upstream_model: task.platform.clone(),
                    is_stream: false,
                    prompt_tokens: 0,
                    proxy: channel.setting.proxy.clone(),
                    region: channel.setting.region.clone(),
                    sdk_mode: channel.setting.sdk_mode,
                    stream_timeout: self.stream_timeout,
                };

                let mut adapter = self.registry.create(channel.kind);
                let result = match adapter.init(&ctx).await {
                    Ok(()) => adapter.execute(&request, &ctx).await,
                    Err(err) => Err(err),
                };
                match result {
                    Ok(AdapterResponse::Json { body, .. }) => {
                        self.apply_fetch(&task, &body).await;
                    }
                    Ok(AdapterResponse::Stream { .. }) => {
                        tracing::warn!(event = "task_fetch_streamed", task_id = %task.task_id);
                    }
                    Err(err) => {
                        // Transient fetch failures leave the task for the
                        // next round.
                        tracing::warn!(
                            event = "task_fetch_failed",
                            task_id = %task.task_id,
                            error = %err,
                        );
                    }
                }
            }
        }
        Ok(())
    }

    async fn apply_fetch(&self, task: &TaskRow, body: &bytes::Bytes) {
        let Some(view) = parse_task_view(&task.platform, body) else {
            tracing::warn!(event = "task_fetch_unparsed", task_id = %task.task_id);
            return;
        };

        match view.status {
            TaskStatus::Submitted => {}
            TaskStatus::InProgress => {
                if task.status != TaskStatus::InProgress {
                    let patch = TaskPatch {
                        status: Some(TaskStatus::InProgress),
                        progress: Some(view.progress),
                        start_at: Some(OffsetDateTime::now_utc()),
                        result_data: view.data.clone(),
                        ..Default::default()
                    };
                    if let Err(err) = self.ledger.store().update_task(&task.task_id, &patch).await
                    {
                        tracing::error!(event = "task_update_failed", error = %err);
                    }
                } else if view.progress > task.progress {
                    let patch = TaskPatch {
                        progress: Some(view.progress),
                        result_data: view.data.clone(),
                        ..Default::default()
                    };
                    if let Err(err) = self.ledger.store().update_task(&task.task_id, &patch).await
                    {
                        tracing::error!(event = "task_update_failed", error = %err);
                    }
                }
            }
            terminal => {
                self.finalize(
                    task,
                    terminal,
                    view.fail_reason.clone(),
                    view.data.clone(),
                    view.action.as_deref(),
                )
                .await;
            }
        }
    }

    /// Terminal transition plus quota reconciliation. Re-running on an
    /// already-settled task is a no-op, so repeated polls cannot double-bill.
    ///
    /// `terminal_action` is the action the upstream reports in its terminal
    /// view; when it prices cheaper than what the reservation assumed at
    /// submit time, the surplus is refunded on success.
    async fn finalize(
        &self,
        task: &TaskRow,
        status: TaskStatus,
        fail_reason: Option<String>,
        result_data: Option<Value>,
        terminal_action: Option<&str>,
    ) {
        if task.quota_settled {
            return;
        }
        let patch = TaskPatch {
            status: Some(status),
            progress: Some(100),
            finish_at: Some(OffsetDateTime::now_utc()),
            quota_settled: Some(true),
            fail_reason: fail_reason.clone(),
            result_data,
            ..Default::default()
        };
        if let Err(err) = self.ledger.store().update_task(&task.task_id, &patch).await {
            tracing::error!(event = "task_finalize_failed", task_id = %task.task_id, error = %err);
            return;
        }

        let (log_kind, quota, content) = match status {
            TaskStatus::Failure => {
                if let Err(err) = self
                    .ledger
                    .finalize_task_refund(task.user_id, task.token_id, task.quota)
                    .await
                {
                    tracing::error!(event = "task_refund_failed", task_id = %task.task_id, error = %err);
                }
                (
                    LogKind::TaskRefund,
                    task.quota,
                    fail_reason.unwrap_or_else(|| "task failed".to_string()),
                )
            }
            _ => {
                let actual = self.terminal_cost(task, terminal_action);
                if let Err(err) = self
                    .ledger
                    .finalize_task_success(task.user_id, task.token_id, task.quota, actual)
                    .await
                {
                    tracing::error!(event = "task_settle_failed", task_id = %task.task_id, error = %err);
                }
                let content = if actual < task.quota {
                    format!(
                        "{} {}, refunded {} of {}",
                        task.platform,
                        task.action,
                        task.quota - actual,
                        task.quota,
                    )
                } else {
                    format!("{} {}", task.platform, task.action)
                };
                (LogKind::Consume, actual, content)
            }
        };
        self.ledger.log(LogInsert {
            kind: log_kind,
            user_id: task.user_id,
            token_id: Some(task.token_id),
            channel_id: Some(task.channel_id),
            model: Some(task.platform.clone()),
            prompt_tokens: 0,
            completion_tokens: 0,
            quota,
            elapsed_ms: 0,
            is_stream: false,
            content,
        });
        tracing::info!(
            event = "task_finalized",
            task_id = %task.task_id,
            status = status.as_str(),
            quota,
        );
    }

    /// Price the action the upstream actually performed. Tasks go out through
    /// generic submit endpoints, so the terminal view can name a cheaper
    /// variant than the one the reservation assumed; never charge above the
    /// reservation.
    fn terminal_cost(&self, task: &TaskRow, terminal_action: Option<&str>) -> i64 {
        terminal_action
            .filter(|action| !action.is_empty())
            .and_then(|action| {
                self.prices
                    .fixed_price(&format!("{}_{action}", task.platform))
            })
            .map(|price| (price.ceil() as i64).min(task.quota))
            .unwrap_or(task.quota)
    }
}

struct TaskView {
    status: TaskStatus,
    progress: i32,
    fail_reason: Option<String>,
    data: Option<Value>,
    /// Action named by the upstream's terminal view, lowercased.
    action: Option<String>,
}

fn parse_task_view(platform: &str, body: &bytes::Bytes) -> Option<TaskView> {
    if platform == "mj" {
        let view: mrelay_protocol::mj::TaskView = serde_json::from_slice(body).ok()?;
        let status = match view.status.as_str() {
            "SUCCESS" => TaskStatus::Success,
            "FAILURE" => TaskStatus::Failure,
            "IN_PROGRESS" => TaskStatus::InProgress,
            _ => TaskStatus::Submitted,
        };
        let progress = view
            .progress
            .trim_end_matches('%')
            .parse::<i32>()
            .unwrap_or(0);
        let data = serde_json::to_value(&view).ok();
        let action = (!view.action.is_empty()).then(|| view.action.to_ascii_lowercase());
        return Some(TaskView {
            status,
            progress,
            fail_reason: view.fail_reason.clone(),
            data,
            action,
        });
    }

    let response: mrelay_protocol::suno::ApiResponse = serde_json::from_slice(body).ok()?;
    let data = response.data.clone()?;
    // Fetch answers carry either one task object or a list.
    let record = match &data {
        Value::Array(items) => items.first()?.clone(),
        other => other.clone(),
    };
    let view: mrelay_protocol::suno::TaskView = serde_json::from_value(record).ok()?;
    let status = match view.status.as_str() {
        "SUCCESS" => TaskStatus::Success,
        "FAILURE" => TaskStatus::Failure,
        "IN_PROGRESS" => TaskStatus::InProgress,
        _ => TaskStatus::Submitted,
    };
    // Suno fetch views carry no action; the reservation stands on success.
    Some(TaskView {
        status,
        progress: if status == TaskStatus::Success { 100 } else { 0 },
        fail_reason: view.fail_reason.clone(),
        data: view.data.clone(),
        action: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mj_progress_parses_percent() {
        let body = bytes::Bytes::from(
            r#"{"id":"174","action":"IMAGINE","status":"IN_PROGRESS","progress":"45%"}"#,
        );
        let view = parse_task_view("mj", &body).unwrap();
        assert_eq!(view.status, TaskStatus::InProgress);
        assert_eq!(view.progress, 45);
    }

    #[test]
    fn mj_terminal_states_map() {
        let failed = bytes::Bytes::from(
            r#"{"id":"174","status":"FAILURE","progress":"0%","failReason":"banned prompt"}"#,
        );
        let view = parse_task_view("mj", &failed).unwrap();
        assert_eq!(view.status, TaskStatus::Failure);
        assert_eq!(view.fail_reason.as_deref(), Some("banned prompt"));
    }

    #[test]
    fn suno_fetch_list_uses_first_record() {
        let body = bytes::Bytes::from(
            r#"{"code":"success","message":"","data":[{"task_id":"t1","status":"SUCCESS"}]}"#,
        );
        let view = parse_task_view("suno", &body).unwrap();
        assert_eq!(view.status, TaskStatus::Success);
        assert_eq!(view.progress, 100);
    }
}

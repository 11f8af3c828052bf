use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Midjourney-proxy dialect: `POST /mj/submit/{action}` then poll
/// `GET /mj/task/{id}/fetch`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(rename = "base64Array", skip_serializing_if = "Option::is_none")]
    pub base64_array: Option<Vec<String>>,
    #[serde(rename = "taskId", skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(rename = "notifyHook", skip_serializing_if = "Option::is_none")]
    pub notify_hook: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// `code` 1 means accepted; 21/22 are soft-queue variants the upstream uses
/// for already-existing or queued tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub code: i32,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<Value>,
}

impl SubmitResponse {
    pub fn accepted(&self) -> bool {
        matches!(self.code, 1 | 21 | 22)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskView {
    pub id: String,
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub progress: String,
    #[serde(rename = "imageUrl", skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(rename = "failReason", skip_serializing_if = "Option::is_none")]
    pub fail_reason: Option<String>,
    #[serde(rename = "submitTime", skip_serializing_if = "Option::is_none")]
    pub submit_time: Option<i64>,
    #[serde(rename = "startTime", skip_serializing_if = "Option::is_none")]
    pub start_time: Option<i64>,
    #[serde(rename = "finishTime", skip_serializing_if = "Option::is_none")]
    pub finish_time: Option<i64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TaskView {
    pub fn is_terminal(&self) -> bool {
        matches!(self.status.as_str(), "SUCCESS" | "FAILURE")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn submit_codes() {
        let ok: SubmitResponse =
            serde_json::from_str(r#"{"code":1,"description":"ok","result":"174"}"#).unwrap();
        assert!(ok.accepted());
        let rejected: SubmitResponse =
            serde_json::from_str(r#"{"code":3,"description":"banned prompt"}"#).unwrap();
        assert!(!rejected.accepted());
    }
}

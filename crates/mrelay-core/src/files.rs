use std::collections::HashSet;
use std::path::Path;

use bytes::Bytes;
use futures_util::StreamExt;
use serde::Serialize;
use uuid::Uuid;

use mrelay_adapter::RelayContext;
use mrelay_adapter::provider::gemini;

use crate::error::RelayError;
use crate::pipeline::{Caller, RelayPipeline};

/// One file to push upstream: raw bytes from a multipart body, or a path
/// inside the configured allow-listed directory.
pub enum FileInput {
    Bytes {
        name: String,
        mime_type: String,
        data: Bytes,
    },
    LocalPath {
        path: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct UploadedFile {
    pub name: String,
    pub uri: String,
    /// Follow-up requests referencing the file must route here; clients pin
    /// it with the `<token>-<channel_id>` key suffix.
    pub channel_id: i64,
}

impl RelayPipeline {
    /// Upload media to the upstream file API of a channel serving `model`.
    /// Batches fan out with bounded concurrency; result order matches input
    /// order.
    pub async fn relay_file_upload(
        &self,
        caller: &Caller,
        model: &str,
        inputs: Vec<FileInput>,
    ) -> Result<Vec<UploadedFile>, RelayError> {
        if inputs.is_empty() {
            return Err(RelayError::invalid_request("no files supplied"));
        }
        self.limits.check_model(model)?;
        let _slot = self.limits.acquire_user_slot(caller.user.id)?;

        let tried = HashSet::new();
        let channel = match caller.pinned_channel {
            Some(id) => self
                .cache
                .channel(id)
                .filter(|channel| channel.serves(&caller.group, model))
                .ok_or_else(|| RelayError::no_channel("pinned channel cannot take this file"))?,
            None => self
                .cache
                .select(&caller.group, model, 0, &tried)
                .ok_or_else(|| {
                    RelayError::no_channel(format!("no channel serves model {model}"))
                })?,
        };

        let config = self.config.load_full();
        let ctx = RelayContext {
            trace_id: Uuid::new_v4().to_string(),
            channel_id: channel.id,
            kind: channel.kind,
            base_url: channel.base_url.clone(),
            key: self.cache.next_key(&channel),
            canonical_model: model.to_string(),
            upstream_model: channel.mapped_model(model).to_string(),
            is_stream: false,
            prompt_tokens: 0,
            proxy: channel
                .setting
                .proxy
                .clone()
                .or_else(|| config.default_proxy.clone()),
            region: channel.setting.region.clone(),
            sdk_mode: channel.setting.sdk_mode,
            stream_timeout: config.stream_timeout,
        };

        let mut resolved = Vec::with_capacity(inputs.len());
        for input in inputs {
            resolved.push(self.resolve_input(input, config.file_local_dir.as_deref()).await?);
        }

        let channel_id = channel.id;
        let uploads = futures_util::stream::iter(resolved.into_iter().map(
            |(name, mime_type, data)| {
                let ctx = ctx.clone();
                let channel = channel.clone();
                async move {
                    let uri = gemini::upload_file(&ctx, &name, &mime_type, data)
                        .await
                        .map_err(|err| {
                            crate::error::classify_adapter_error(
                                &err,
                                channel.status_code_mapping.as_ref(),
                            )
                        })?;
                    Ok::<UploadedFile, RelayError>(UploadedFile {
                        name,
                        uri,
                        channel_id,
                    })
                }
            },
        ))
        .buffered(config.upload_concurrency.max(1))
        .collect::<Vec<_>>()
        .await;

        uploads.into_iter().collect()
    }

    /// Query upstream lifecycle state for previously uploaded files. Routing
    /// follows the same channel the upload used, so callers arrive with a
    /// pinned channel.
    pub async fn relay_file_status(
        &self,
        caller: &Caller,
        model: &str,
        names: Vec<String>,
    ) -> Result<Vec<serde_json::Value>, RelayError> {
        let tried = HashSet::new();
        let channel = match caller.pinned_channel {
            Some(id) => self
                .cache
                .channel(id)
                .ok_or_else(|| RelayError::no_channel("pinned channel not found"))?,
            None => self
                .cache
                .select(&caller.group, model, 0, &tried)
                .ok_or_else(|| {
                    RelayError::no_channel(format!("no channel serves model {model}"))
                })?,
        };
        let config = self.config.load_full();
        let ctx = RelayContext {
            trace_id: Uuid::new_v4().to_string(),
            channel_id: channel.id,
            kind: channel.kind,
            base_url: channel.base_url.clone(),
            key: self.cache.next_key(&channel),
            canonical_model: model.to_string(),
            upstream_model: channel.mapped_model(model).to_string(),
            is_stream: false,
            prompt_tokens: 0,
            proxy: channel
                .setting
                .proxy
                .clone()
                .or_else(|| config.default_proxy.clone()),
            region: channel.setting.region.clone(),
            sdk_mode: channel.setting.sdk_mode,
            stream_timeout: config.stream_timeout,
        };

        let mut statuses = Vec::with_capacity(names.len());
        for name in names {
            match gemini::file_status(&ctx, &name).await {
                Ok(value) => statuses.push(value),
                Err(err) => statuses.push(serde_json::json!({
                    "name": name,
                    "state": "UNAVAILABLE",
                    "error": err.to_string(),
                })),
            }
        }
        Ok(statuses)
    }

    async fn resolve_input(
        &self,
        input: FileInput,
        allow_dir: Option<&Path>,
    ) -> Result<(String, String, Bytes), RelayError> {
        match input {
            FileInput::Bytes {
                name,
                mime_type,
                data,
            } => Ok((name, mime_type, data)),
            FileInput::LocalPath { path } => {
                let Some(allow_dir) = allow_dir else {
                    return Err(RelayError::forbidden(
                        "path-based uploads are not enabled",
                    ));
                };
                let allow_root = tokio::fs::canonicalize(allow_dir).await.map_err(|err| {
                    RelayError::internal(format!("upload directory unavailable: {err}"))
                })?;
                let candidate = allow_root.join(&path);
                let canonical = tokio::fs::canonicalize(&candidate)
                    .await
                    .map_err(|err| RelayError::invalid_request(format!("unreadable path: {err}")))?;
                if !canonical.starts_with(&allow_root) {
                    return Err(RelayError::forbidden("path escapes the upload directory"));
                }
                let data = tokio::fs::read(&canonical)
                    .await
                    .map_err(|err| RelayError::invalid_request(format!("read failed: {err}")))?;
                let name = canonical
                    .file_name()
                    .map(|name| name.to_string_lossy().to_string())
                    .unwrap_or_else(|| "file".to_string());
                let mime_type = guess_mime(&name).to_string();
                Ok((name, mime_type, Bytes::from(data)))
            }
        }
    }
}

fn guess_mime(name: &str) -> &'static str {
    match name.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase()) {
        Some(ext) => match ext.as_str() {
            "png" => "image/png",
            "jpg" | "jpeg" => "image/jpeg",
            "gif" => "image/gif",
            "webp" => "image/webp",
            "pdf" => "application/pdf",
            "mp3" => "audio/mpeg",
            "wav" => "audio/wav",
            "mp4" => "video/mp4",
            "txt" => "text/plain",
            _ => "application/octet-stream",
        },
        None => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::guess_mime;

    #[test]
    fn common_extensions_map() {
        assert_eq!(guess_mime("photo.JPG"), "image/jpeg");
        assert_eq!(guess_mime("doc.pdf"), "application/pdf");
        assert_eq!(guess_mime("mystery"), "application/octet-stream");
    }
}

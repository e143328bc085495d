//! 多部分上传处理器：落盘字节，再记录账本。

use axum::extract::{Extension, Multipart, Query};
use axum::response::Json as JsonResponse;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::info;

use crate::atomic::AtomicFile;
use crate::config::{ApiConfig, DEFAULT_LOCK_WAIT_TIMEOUT_SECS, ListBackend};
use crate::error::ApiError;
use crate::ledger::{FileRecord, Ledger};
use crate::locking::LockManager;
use crate::storage::{Storage, UploadDestination, sanitize_file_name};

#[derive(Deserialize)]
pub(crate) struct UploadQuery {
    folder: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UploadResponse {
    pub(crate) success: bool,
    pub(crate) file: FileRecord,
}

/// 接收 multipart 上传：`file` 字段必填，`folder` 可来自查询或表单。
/// 表单里的 `folder` 字段只有出现在 `file` 之前才会生效。
pub async fn upload_file(
    Query(UploadQuery { folder }): Query<UploadQuery>,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(ledger): Extension<Arc<Ledger>>,
    Extension(lock_manager): Extension<Arc<LockManager>>,
    Extension(config): Extension<Arc<ApiConfig>>,
    mut multipart: Multipart,
) -> Result<JsonResponse<UploadResponse>, ApiError> {
    let mut folder_hint = folder;
    let mut saved: Option<(UploadDestination, String)> = None;

    while let Some(mut field) = multipart
        .next_field()
        .await
        .map_err(|err| ApiError::BadRequest(err.to_string()))?
    {
        let field_name = field.name().map(str::to_string);
        match field_name.as_deref() {
            Some("folder") => {
                let value = field
                    .text()
                    .await
                    .map_err(|err| ApiError::BadRequest(err.to_string()))?;
                if !value.trim().is_empty() {
                    folder_hint = Some(value);
                }
            }
            Some("file") => {
                let original = field
                    .file_name()
                    .map(str::to_string)
                    .filter(|name| !name.trim().is_empty())
                    .ok_or_else(|| ApiError::BadRequest("file name is required".into()))?;
                let display_name = sanitize_file_name(&original);
                let destination = storage
                    .resolve_upload_destination(folder_hint.as_deref(), &original)
                    .await?;
                let _guard = lock_manager
                    .lock_path_with_timeout(
                        &destination.relative_path,
                        Duration::from_secs(DEFAULT_LOCK_WAIT_TIMEOUT_SECS),
                    )
                    .await
                    .map_err(|_| ApiError::Conflict("path locked".into()))?;

                let mut atomic = AtomicFile::new(&destination.absolute_path)
                    .await
                    .map_err(|err| ApiError::Internal(err.to_string()))?;
                let write_result: Result<(), ApiError> = async {
                    let mut total: u64 = 0;
                    while let Some(chunk) = field
                        .chunk()
                        .await
                        .map_err(|err| ApiError::BadRequest(err.to_string()))?
                    {
                        total += chunk.len() as u64;
                        if config.upload_max_size > 0 && total > config.upload_max_size {
                            return Err(ApiError::BadRequest("upload size exceeds limit".into()));
                        }
                        atomic
                            .file_mut()
                            .write_all(&chunk)
                            .await
                            .map_err(|err| ApiError::Internal(err.to_string()))?;
                    }
                    Ok(())
                }
                .await;
                if let Err(err) = write_result {
                    atomic.cleanup().await;
                    return Err(err);
                }
                atomic
                    .finalize()
                    .await
                    .map_err(|err| ApiError::Internal(err.to_string()))?;

                saved = Some((destination, display_name));
                break;
            }
            _ => continue,
        }
    }

    let Some((destination, display_name)) = saved else {
        return Err(ApiError::BadRequest("no file uploaded".into()));
    };

    let record = FileRecord {
        name: display_name,
        path: destination.relative_path.clone(),
        url: config.file_url(&destination.relative_path),
        uploaded_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    };
    if config.list_backend == ListBackend::Ledger {
        // 字节已经落盘；账本写失败时移除孤儿文件再上报。
        if let Err(err) = ledger.append(record.clone()).await {
            let _ = fs::remove_file(&destination.absolute_path).await;
            return Err(ApiError::Internal(err.to_string()));
        }
    }

    info!(
        key = destination.storage_key,
        path = record.path,
        "upload complete"
    );
    Ok(JsonResponse(UploadResponse {
        success: true,
        file: record,
    }))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use axum::body::Body as AxumBody;
    use axum::extract::{FromRequest, Multipart, Query};
    use axum::http::Request;
    use std::sync::Arc;
    use tempfile::tempdir;

    const BOUNDARY: &str = "oxidrop-test-boundary";

    pub(crate) struct TestContext {
        pub(crate) _temp: tempfile::TempDir,
        pub(crate) storage: Arc<Storage>,
        pub(crate) ledger: Arc<Ledger>,
        pub(crate) lock_manager: Arc<LockManager>,
        pub(crate) config: Arc<ApiConfig>,
    }

    pub(crate) fn make_context(backend: ListBackend) -> TestContext {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("storage");
        std::fs::create_dir_all(&root).expect("create storage root");
        let ledger = Arc::new(Ledger::new(temp.path().join("ledger.json")));
        TestContext {
            storage: Arc::new(Storage::new(root)),
            ledger,
            lock_manager: Arc::new(LockManager::new()),
            config: Arc::new(ApiConfig {
                public_url: None,
                list_backend: backend,
                upload_max_size: 0,
            }),
            _temp: temp,
        }
    }

    pub(crate) async fn make_multipart(file_name: &str, content: &[u8]) -> Multipart {
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"{file_name}\"\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(content);
        body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());

        let request = Request::builder()
            .header(
                "content-type",
                format!("multipart/form-data; boundary={BOUNDARY}"),
            )
            .body(AxumBody::from(body))
            .expect("build request");
        Multipart::from_request(request, &())
            .await
            .expect("multipart extractor")
    }

    pub(crate) async fn upload(
        ctx: &TestContext,
        folder: Option<&str>,
        file_name: &str,
        content: &[u8],
    ) -> Result<UploadResponse, ApiError> {
        let multipart = make_multipart(file_name, content).await;
        let JsonResponse(response) = upload_file(
            Query(UploadQuery {
                folder: folder.map(str::to_string),
            }),
            Extension(ctx.storage.clone()),
            Extension(ctx.ledger.clone()),
            Extension(ctx.lock_manager.clone()),
            Extension(ctx.config.clone()),
            multipart,
        )
        .await?;
        Ok(response)
    }

    #[tokio::test]
    async fn upload_persists_bytes_and_records_metadata() {
        let ctx = make_context(ListBackend::Ledger);
        let response = upload(&ctx, None, "photo.png", b"fake-png")
            .await
            .unwrap_or_else(|_| panic!("upload failed"));

        assert!(response.success);
        let key = &response.file.path;
        let (millis, name) = key.split_once('_').expect("key shape");
        assert!(!millis.is_empty() && millis.bytes().all(|b| b.is_ascii_digit()));
        assert_eq!(name, "photo.png");
        assert_eq!(response.file.name, "photo.png");
        assert_eq!(response.file.url, format!("/uploads/{key}"));

        let stored = std::fs::read(ctx.storage.root_path().join(key)).expect("stored bytes");
        assert_eq!(stored, b"fake-png");

        let records = ctx.ledger.list().await.expect("list");
        assert_eq!(records.len(), 1);
        assert_eq!(&records[0].path, key);
    }

    #[tokio::test]
    async fn upload_into_folder_nests_the_file() {
        let ctx = make_context(ListBackend::Ledger);
        let response = upload(&ctx, Some("docs/reports"), "q1.pdf", b"pdf")
            .await
            .unwrap_or_else(|_| panic!("upload failed"));

        assert!(response.file.path.starts_with("docs/reports/"));
        assert!(
            ctx.storage
                .root_path()
                .join(&response.file.path)
                .is_file()
        );
    }

    #[tokio::test]
    async fn traversal_folder_hint_is_rejected_and_nothing_is_written() {
        let ctx = make_context(ListBackend::Ledger);
        let result = upload(&ctx, Some("../secret"), "photo.png", b"x").await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));

        let mut entries = std::fs::read_dir(ctx.storage.root_path()).expect("read root");
        assert!(entries.next().is_none(), "storage root must stay empty");
        assert!(ctx.ledger.list().await.expect("list").is_empty());
    }

    #[tokio::test]
    async fn embedded_separators_in_filename_are_stripped() {
        let ctx = make_context(ListBackend::Ledger);
        let response = upload(&ctx, None, "../../etc/passwd", b"x")
            .await
            .unwrap_or_else(|_| panic!("upload failed"));

        assert!(response.file.path.ends_with("_passwd"));
        assert!(!response.file.path.contains(".."));
    }

    #[tokio::test]
    async fn oversized_upload_is_rejected_and_cleaned_up() {
        let mut ctx = make_context(ListBackend::Ledger);
        ctx.config = Arc::new(ApiConfig {
            public_url: None,
            list_backend: ListBackend::Ledger,
            upload_max_size: 4,
        });
        let result = upload(&ctx, None, "big.bin", b"way too big").await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));

        let leftovers = std::fs::read_dir(ctx.storage.root_path())
            .expect("read root")
            .count();
        assert_eq!(leftovers, 0, "no partial file may remain");
    }

    #[tokio::test]
    async fn scan_backend_skips_the_ledger() {
        let ctx = make_context(ListBackend::Scan);
        upload(&ctx, None, "photo.png", b"x")
            .await
            .unwrap_or_else(|_| panic!("upload failed"));
        assert!(ctx.ledger.list().await.expect("list").is_empty());
    }
}

//! 文件列表、删除、重命名与静态读取处理器。

use axum::body::Body as AxumBody;
use axum::extract::{Extension, Json, Path as UrlPath, Query};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Json as JsonResponse, Response};
use chrono::{DateTime, SecondsFormat};
use httpdate::fmt_http_date;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{self, File};
use tokio::io::ErrorKind;
use tokio_util::io::ReaderStream;
use tracing::{debug, info};

use crate::config::{ApiConfig, DEFAULT_LOCK_WAIT_TIMEOUT_SECS, ListBackend};
use crate::error::ApiError;
use crate::ledger::{FileRecord, Ledger};
use crate::locking::LockManager;
use crate::storage::{Storage, StorageError, sanitize_file_name};

#[derive(Deserialize)]
pub(crate) struct RequiredPathQuery {
    path: String,
}

#[derive(Deserialize)]
pub(crate) struct RenameBody {
    from: String,
    to: String,
}

/// 列出全部文件记录，按上传顺序；后端由配置选择。
pub async fn list_files(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(ledger): Extension<Arc<Ledger>>,
    Extension(config): Extension<Arc<ApiConfig>>,
) -> Result<JsonResponse<Vec<FileRecord>>, ApiError> {
    let records = match config.list_backend {
        ListBackend::Ledger => ledger
            .list()
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?,
        ListBackend::Scan => storage
            .scan()
            .await?
            .into_iter()
            .map(|file| {
                let url = config.file_url(&file.path);
                FileRecord {
                    name: file.name,
                    path: file.path,
                    url,
                    // 文件系统拿不到 mtime 时退回纪元零点，字段始终是合法时间戳。
                    uploaded_at: file
                        .modified
                        .unwrap_or(DateTime::UNIX_EPOCH)
                        .to_rfc3339_opts(SecondsFormat::Millis, true),
                }
            })
            .collect(),
    };
    info!(count = records.len(), "list files");
    Ok(JsonResponse(records))
}

/// 删除文件并移除账本记录。
/// 文件与记录是两份资源：任意一份存在都算命中，顺带清掉另一份的残留。
pub async fn delete_file(
    Query(RequiredPathQuery { path }): Query<RequiredPathQuery>,
    Extension(storage): Extension<Arc<Storage>>,
    Extension(ledger): Extension<Arc<Ledger>>,
    Extension(lock_manager): Extension<Arc<LockManager>>,
    Extension(config): Extension<Arc<ApiConfig>>,
) -> Result<StatusCode, ApiError> {
    if path.is_empty() {
        return Err(ApiError::BadRequest("path is required".into()));
    }
    // 先归一化：文件系统与账本必须用同一个路径写法。
    let path = storage.normalize_relative(&path)?;
    let _guard = lock_manager
        .lock_path_with_timeout(&path, Duration::from_secs(DEFAULT_LOCK_WAIT_TIMEOUT_SECS))
        .await
        .map_err(|_| ApiError::Conflict("path locked".into()))?;

    let file_missing = match storage.delete_entry(&path).await {
        Ok(()) => false,
        Err(StorageError::Io(err)) if err.kind() == ErrorKind::NotFound => true,
        Err(err) => return Err(err.into()),
    };
    let record_removed = match config.list_backend {
        ListBackend::Ledger => ledger
            .remove(&path)
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?,
        ListBackend::Scan => false,
    };
    if file_missing && !record_removed {
        return Err(ApiError::NotFound("no such file".into()));
    }

    info!(path, "delete file");
    Ok(StatusCode::NO_CONTENT)
}

/// 重命名或移动文件，同时改写账本记录。
pub async fn rename_file(
    Extension(storage): Extension<Arc<Storage>>,
    Extension(ledger): Extension<Arc<Ledger>>,
    Extension(lock_manager): Extension<Arc<LockManager>>,
    Extension(config): Extension<Arc<ApiConfig>>,
    Json(RenameBody { from, to }): Json<RenameBody>,
) -> Result<StatusCode, ApiError> {
    if from.is_empty() || to.is_empty() {
        return Err(ApiError::BadRequest("from and to are required".into()));
    }
    // 先过越界检查与归一化，再碰任何磁盘状态。
    let from = storage.normalize_relative(&from)?;
    let new_path = storage.normalize_relative(&to)?;
    let _guard = lock_manager
        .lock_path_with_timeout(&from, Duration::from_secs(DEFAULT_LOCK_WAIT_TIMEOUT_SECS))
        .await
        .map_err(|_| ApiError::Conflict("path locked".into()))?;

    storage.rename_entry(&from, &new_path).await?;
    if config.list_backend == ListBackend::Ledger {
        let new_name = sanitize_file_name(&new_path);
        let updated = ledger
            .update_path(&from, &new_path, &new_name, |path| config.file_url(path))
            .await
            .map_err(|err| ApiError::Internal(err.to_string()))?;
        if !updated {
            // 扫描期文件没有账本记录，文件系统重命名本身已经成功。
            debug!(from, "rename matched no ledger record");
        }
    }

    info!(from, to = new_path, "rename file");
    Ok(StatusCode::NO_CONTENT)
}

/// 静态读取：把公开 URL 映射回磁盘位置并流式返回。
pub async fn serve_file(
    UrlPath(path): UrlPath<String>,
    Extension(storage): Extension<Arc<Storage>>,
) -> Result<Response, ApiError> {
    let target = storage.resolve_existing(&path).await?;
    let metadata = fs::metadata(&target)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    if metadata.is_dir() {
        return Err(ApiError::BadRequest("path is not a file".into()));
    }

    let mime = mime_guess::from_path(&path).first_or_octet_stream();
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.essence_str())
            .map_err(|_| ApiError::Internal("无效的 MIME 类型".into()))?,
    );
    headers.insert(
        header::CONTENT_LENGTH,
        HeaderValue::from_str(&metadata.len().to_string())
            .map_err(|_| ApiError::Internal("响应头构建失败".into()))?,
    );
    if let Ok(modified) = metadata.modified() {
        headers.insert(
            header::LAST_MODIFIED,
            HeaderValue::from_str(&fmt_http_date(modified))
                .map_err(|_| ApiError::Internal("响应头构建失败".into()))?,
        );
    }

    let file = File::open(&target)
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    info!(path, size = metadata.len(), "serve file");
    Ok((
        StatusCode::OK,
        headers,
        AxumBody::from_stream(ReaderStream::new(file)),
    )
        .into_response())
}

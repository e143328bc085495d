//! 元数据账本：单个 JSON 文档上的读改写操作。
//!
//! 写操作（追加、删除、改路径）统一持有内部互斥锁做读改写，
//! 落盘走临时文件加 rename，读者永远不会看到半写状态的文档。
//! 文档缺失或无法解析时按空账本处理，不让坏文件拖垮服务。

use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use tokio::fs;
use tokio::io::{AsyncWriteExt, ErrorKind};
use tokio::sync::Mutex;
use tracing::warn;

use crate::atomic::AtomicFile;

/// 一条文件记录，字段形状与对外 JSON 一致。
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub name: String,
    pub path: String,
    pub url: String,
    pub uploaded_at: String,
}

/// 按上传顺序保存文件记录的账本。
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl Ledger {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            write_lock: Mutex::new(()),
        }
    }

    /// 读取当前全部记录。缺失或解析失败按空账本处理；读 IO 失败照常上报。
    async fn read_records(&self) -> io::Result<Vec<FileRecord>> {
        let bytes = match fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err),
        };
        match serde_json::from_slice(&bytes) {
            Ok(records) => Ok(records),
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "账本无法解析，按空账本继续");
                Ok(Vec::new())
            }
        }
    }

    /// 整体写回：写临时文件后原子替换。
    async fn write_records(&self, records: &[FileRecord]) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_vec_pretty(records)
            .map_err(|err| io::Error::other(err.to_string()))?;
        let mut atomic = AtomicFile::new(&self.path).await?;
        if let Err(err) = atomic.file_mut().write_all(&content).await {
            atomic.cleanup().await;
            return Err(err);
        }
        atomic.finalize().await
    }

    /// 追加一条记录。返回后对后续 `list` 立即可见。
    pub async fn append(&self, record: FileRecord) -> io::Result<()> {
        let _guard = self.write_lock.lock().await;
        let mut records = self.read_records().await?;
        records.push(record);
        self.write_records(&records).await
    }

    /// 按插入顺序返回全部记录；无需持锁，文档替换是原子的。
    pub async fn list(&self) -> io::Result<Vec<FileRecord>> {
        self.read_records().await
    }

    /// 删除路径匹配的记录，返回是否有记录被删。
    /// 目录路径会连同其下所有记录一起删除，账本不会留下指向已删文件的残留。
    pub async fn remove(&self, path: &str) -> io::Result<bool> {
        let prefix = format!("{path}/");
        let _guard = self.write_lock.lock().await;
        let mut records = self.read_records().await?;
        let before = records.len();
        records.retain(|record| record.path != path && !record.path.starts_with(&prefix));
        if records.len() == before {
            return Ok(false);
        }
        self.write_records(&records).await?;
        Ok(true)
    }

    /// 重命名或移动：改写匹配记录的路径、展示名与 URL。
    /// 目录路径会把其下所有记录的前缀一并改写（展示名保持不变）。
    /// 调用方必须先用存储层的越界检查验证过 `new_path`。
    pub async fn update_path(
        &self,
        path: &str,
        new_path: &str,
        new_name: &str,
        url_for: impl Fn(&str) -> String,
    ) -> io::Result<bool> {
        let prefix = format!("{path}/");
        let _guard = self.write_lock.lock().await;
        let mut records = self.read_records().await?;
        let mut changed = false;
        for record in records.iter_mut() {
            if record.path == path {
                record.path = new_path.to_string();
                record.name = new_name.to_string();
                record.url = url_for(new_path);
                changed = true;
            } else if let Some(rest) = record.path.strip_prefix(&prefix) {
                record.path = format!("{new_path}/{rest}");
                record.url = url_for(&record.path);
                changed = true;
            }
        }
        if !changed {
            return Ok(false);
        }
        self.write_records(&records).await?;
        Ok(true)
    }
}

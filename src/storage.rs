//! 存储根目录内的路径归一化、存储键分配与目录扫描。

use chrono::{DateTime, Utc};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::fs;
use tokio::io::ErrorKind;

/// 一次上传的落盘位置解析结果。
#[derive(Debug)]
pub struct UploadDestination {
    pub storage_key: String,
    pub relative_path: String,
    pub absolute_path: PathBuf,
}

/// 扫描存储目录得到的文件条目。
#[derive(Debug)]
pub struct ScannedFile {
    pub name: String,
    pub path: String,
    pub modified: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug)]
pub struct Storage {
    root: PathBuf,
}

static LAST_KEY_MILLIS: AtomicI64 = AtomicI64::new(0);

/// 进程内单调递增的毫秒时间戳，同一毫秒内的上传也能得到不同的键。
fn next_key_millis() -> i64 {
    let now = Utc::now().timestamp_millis();
    let mut last = LAST_KEY_MILLIS.load(Ordering::Relaxed);
    loop {
        let next = now.max(last + 1);
        match LAST_KEY_MILLIS.compare_exchange_weak(last, next, Ordering::SeqCst, Ordering::Relaxed)
        {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

/// 去掉客户端文件名中的目录部分，只保留基础名。
pub fn sanitize_file_name(original: &str) -> String {
    let normalized = original.replace('\\', "/");
    let base = normalized.rsplit('/').next().unwrap_or_default().trim();
    if base.is_empty() || base == "." || base == ".." {
        "file".to_string()
    } else {
        base.to_string()
    }
}

impl Storage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub async fn ensure_root(&self) -> io::Result<()> {
        fs::create_dir_all(&self.root).await
    }

    pub fn root_path(&self) -> &Path {
        &self.root
    }

    /// 归一化相对路径：去掉前导分隔符与 `.`，任何越界段直接拒绝。
    fn normalize(&self, relative: &str) -> Result<PathBuf, StorageError> {
        let trimmed = relative.trim().trim_start_matches(['/', '\\']);
        let mut normalized = PathBuf::new();
        for component in Path::new(trimmed).components() {
            match component {
                Component::Normal(segment) => normalized.push(segment),
                Component::CurDir => continue,
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                    return Err(StorageError::InvalidPath);
                }
            }
        }
        Ok(normalized)
    }

    /// 归一化后以斜杠分隔的相对路径字符串。
    pub fn normalize_relative(&self, relative: &str) -> Result<String, StorageError> {
        let normalized = self.normalize(relative)?;
        Ok(normalized
            .to_string_lossy()
            .replace(std::path::MAIN_SEPARATOR, "/"))
    }

    /// 归一化并映射到根目录下的绝对路径。
    pub fn resolve_relative(&self, relative: &str) -> Result<PathBuf, StorageError> {
        Ok(self.root.join(self.normalize(relative)?))
    }

    /// 为一次上传分配存储键与落盘位置，并创建所需的中间目录。
    pub async fn resolve_upload_destination(
        &self,
        folder_hint: Option<&str>,
        original_filename: &str,
    ) -> Result<UploadDestination, StorageError> {
        let folder = self.normalize(folder_hint.unwrap_or_default())?;
        let storage_key = format!(
            "{}_{}",
            next_key_millis(),
            sanitize_file_name(original_filename)
        );
        let relative = folder.join(&storage_key);
        let relative_path = relative
            .to_string_lossy()
            .replace(std::path::MAIN_SEPARATOR, "/");
        let absolute_path = self.root.join(&relative);
        self.ensure_no_symlink_components(&absolute_path, true)
            .await?;
        if let Some(parent) = absolute_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(UploadDestination {
            storage_key,
            relative_path,
            absolute_path,
        })
    }

    /// 逐段检查根目录到目标的每一级：任何符号链接都视为越界。
    async fn ensure_no_symlink_components(
        &self,
        target: &Path,
        allow_missing: bool,
    ) -> Result<(), StorageError> {
        let relative = target
            .strip_prefix(&self.root)
            .map_err(|_| StorageError::InvalidPath)?;
        let mut current = self.root.clone();
        let mut components = relative.components().peekable();

        while let Some(component) = components.next() {
            current.push(component.as_os_str());
            match fs::symlink_metadata(&current).await {
                Ok(metadata) => {
                    if metadata.file_type().is_symlink() {
                        return Err(StorageError::InvalidPath);
                    }
                    if components.peek().is_some() && !metadata.is_dir() {
                        return Err(StorageError::InvalidPath);
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound && allow_missing => {
                    return Ok(());
                }
                Err(err) => return Err(StorageError::Io(err)),
            }
        }

        Ok(())
    }

    /// 解析既有条目的绝对路径；途中任何一级是符号链接都视为越界。
    pub async fn resolve_existing(&self, relative: &str) -> Result<PathBuf, StorageError> {
        let target = self.resolve_relative(relative)?;
        self.ensure_no_symlink_components(&target, false).await?;
        Ok(target)
    }

    /// 删除文件或整个子目录。
    pub async fn delete_entry(&self, relative: &str) -> Result<(), StorageError> {
        let target = self.resolve_existing(relative).await?;
        let metadata = fs::metadata(&target).await?;
        if metadata.is_dir() {
            fs::remove_dir_all(target).await?;
        } else {
            fs::remove_file(target).await?;
        }
        Ok(())
    }

    /// 重命名或移动条目；目标已存在时拒绝，避免悄悄覆盖。
    pub async fn rename_entry(&self, from: &str, to: &str) -> Result<(), StorageError> {
        let source = self.resolve_existing(from).await?;
        let target = self.resolve_relative(to)?;
        self.ensure_no_symlink_components(&target, true).await?;
        if fs::symlink_metadata(&target).await.is_ok() {
            return Err(StorageError::Io(io::Error::new(
                ErrorKind::AlreadyExists,
                "target already exists",
            )));
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::rename(source, target).await?;
        Ok(())
    }

    /// 递归扫描存储根目录，跳过隐藏文件（临时写入产物等）。
    pub async fn scan(&self) -> Result<Vec<ScannedFile>, StorageError> {
        let mut pending = vec![self.root.clone()];
        let mut files = Vec::new();

        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().to_string();
                if name.starts_with('.') {
                    continue;
                }
                let metadata = entry.metadata().await?;
                if metadata.is_dir() {
                    pending.push(entry.path());
                    continue;
                }
                let path = entry
                    .path()
                    .strip_prefix(&self.root)
                    .map_err(|_| StorageError::InvalidPath)?
                    .to_string_lossy()
                    .replace(std::path::MAIN_SEPARATOR, "/");
                let modified = metadata.modified().ok().map(DateTime::<Utc>::from);
                files.push(ScannedFile {
                    name,
                    path,
                    modified,
                });
            }
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }
}

#[derive(Debug)]
pub enum StorageError {
    InvalidPath,
    Io(io::Error),
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::{Storage, StorageError, sanitize_file_name};
    use tempfile::tempdir;

    fn make_storage() -> (tempfile::TempDir, Storage) {
        let temp = tempdir().expect("tempdir");
        let root = temp.path().join("storage");
        std::fs::create_dir_all(&root).expect("create root");
        (temp, Storage::new(root))
    }

    #[test]
    fn sanitize_strips_directory_components() {
        assert_eq!(sanitize_file_name("photo.png"), "photo.png");
        assert_eq!(sanitize_file_name("a/b/photo.png"), "photo.png");
        assert_eq!(sanitize_file_name("..\\..\\photo.png"), "photo.png");
        assert_eq!(sanitize_file_name("  "), "file");
        assert_eq!(sanitize_file_name(".."), "file");
    }

    #[tokio::test]
    async fn upload_destination_stays_inside_root() {
        let (_temp, storage) = make_storage();
        let destination = storage
            .resolve_upload_destination(Some("photos/2026"), "cat.jpg")
            .await
            .expect("resolve destination");

        assert!(destination.absolute_path.starts_with(storage.root_path()));
        assert!(destination.relative_path.starts_with("photos/2026/"));
        assert!(destination.storage_key.ends_with("_cat.jpg"));
    }

    #[tokio::test]
    async fn traversal_folder_hint_is_rejected_without_fs_mutation() {
        let (_temp, storage) = make_storage();
        let result = storage
            .resolve_upload_destination(Some("../secret"), "cat.jpg")
            .await;
        assert!(matches!(result, Err(StorageError::InvalidPath)));

        let mut entries = std::fs::read_dir(storage.root_path()).expect("read root");
        assert!(entries.next().is_none(), "root must stay empty");
    }

    #[tokio::test]
    async fn storage_keys_are_distinct_under_rapid_allocation() {
        let (_temp, storage) = make_storage();
        let mut keys = std::collections::HashSet::new();
        for _ in 0..64 {
            let destination = storage
                .resolve_upload_destination(None, "same.bin")
                .await
                .expect("resolve destination");
            assert!(
                keys.insert(destination.storage_key.clone()),
                "duplicate key {}",
                destination.storage_key
            );
        }
    }

    #[tokio::test]
    async fn scan_finds_nested_files_and_skips_hidden() {
        let (_temp, storage) = make_storage();
        let nested = storage.root_path().join("docs");
        std::fs::create_dir_all(&nested).expect("create nested");
        std::fs::write(nested.join("1_a.txt"), b"a").expect("write a");
        std::fs::write(storage.root_path().join("2_b.txt"), b"b").expect("write b");
        std::fs::write(storage.root_path().join(".2_b.txt.tmp.x"), b"t").expect("write tmp");

        let files = storage.scan().await.expect("scan");
        let paths: Vec<_> = files.iter().map(|file| file.path.as_str()).collect();
        assert_eq!(paths, vec!["2_b.txt", "docs/1_a.txt"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn resolve_existing_rejects_symlink() {
        use std::os::unix::fs::symlink;

        let (temp, storage) = make_storage();
        let outside = temp.path().join("outside.txt");
        std::fs::write(&outside, b"secret").expect("write outside");
        symlink(&outside, storage.root_path().join("link")).expect("symlink");

        let result = storage.resolve_existing("link").await;
        assert!(matches!(result, Err(StorageError::InvalidPath)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn resolve_existing_rejects_symlinked_directory_component() {
        use std::os::unix::fs::symlink;

        let (temp, storage) = make_storage();
        let outside = temp.path().join("outside");
        std::fs::create_dir_all(&outside).expect("create outside dir");
        std::fs::write(outside.join("secret.txt"), b"secret").expect("write secret");
        symlink(&outside, storage.root_path().join("evil")).expect("symlink dir");

        let result = storage.resolve_existing("evil/secret.txt").await;
        assert!(matches!(result, Err(StorageError::InvalidPath)));

        let delete = storage.delete_entry("evil/secret.txt").await;
        assert!(matches!(delete, Err(StorageError::InvalidPath)));
        assert!(outside.join("secret.txt").is_file(), "outside file must survive");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn upload_destination_rejects_symlinked_folder() {
        use std::os::unix::fs::symlink;

        let (temp, storage) = make_storage();
        let outside = temp.path().join("outside");
        std::fs::create_dir_all(&outside).expect("create outside dir");
        symlink(&outside, storage.root_path().join("evil")).expect("symlink dir");

        let result = storage.resolve_upload_destination(Some("evil"), "cat.jpg").await;
        assert!(matches!(result, Err(StorageError::InvalidPath)));
    }
}

//! 临时写入、原子替换与发布的辅助方法。

use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::warn;
use uuid::Uuid;

use crate::error::TusError;

/// 可用于原子替换的临时文件封装。
pub struct AtomicFile {
    target: PathBuf,
    temp_path: PathBuf,
    file: File,
}

impl AtomicFile {
    pub async fn new(target: &Path) -> Result<Self, TusError> {
        let parent = target
            .parent()
            .ok_or_else(|| TusError::StoreUnavailable("target has no parent".into()))?;
        let base = target
            .file_name()
            .map(|name| name.to_string_lossy())
            .unwrap_or_else(|| "record".into());
        let temp_path = parent.join(format!(".{base}.tmp.{}", Uuid::new_v4()));
        let file = File::create(&temp_path).await?;
        Ok(Self {
            target: target.to_path_buf(),
            temp_path,
            file,
        })
    }

    pub async fn write_all(&mut self, bytes: &[u8]) -> Result<(), TusError> {
        if let Err(err) = self.file.write_all(bytes).await {
            let _ = fs::remove_file(&self.temp_path).await;
            return Err(err.into());
        }
        Ok(())
    }

    /// 同步并原子替换目标文件。
    pub async fn commit(self) -> Result<(), TusError> {
        if let Err(err) = self.file.sync_all().await {
            let _ = fs::remove_file(&self.temp_path).await;
            return Err(err.into());
        }
        drop(self.file);

        if let Err(err) = fs::rename(&self.temp_path, &self.target).await {
            #[cfg(windows)]
            {
                if fs::remove_file(&self.target).await.is_ok() {
                    fs::rename(&self.temp_path, &self.target).await?;
                } else {
                    let _ = fs::remove_file(&self.temp_path).await;
                    return Err(err.into());
                }
            }
            #[cfg(not(windows))]
            {
                let _ = fs::remove_file(&self.temp_path).await;
                return Err(err.into());
            }
        }

        if let Some(parent) = self.target.parent() {
            let _ = sync_dir(parent).await;
        }
        Ok(())
    }
}

/// 原子写入整个文件：读者只会看到旧内容或新内容。
pub async fn write_file_atomic(target: &Path, bytes: &[u8]) -> Result<(), TusError> {
    let mut file = AtomicFile::new(target).await?;
    file.write_all(bytes).await?;
    file.commit().await
}

/// 将 `source` 发布为 `target`。
///
/// 不允许覆盖时目标已存在返回 `AlreadyExists`，两个文件保持原样；
/// 硬链接建立后即视为已发布，暂存文件删除失败只记录日志。
pub async fn publish(source: &Path, target: &Path, overwrite: bool) -> io::Result<()> {
    if overwrite {
        fs::rename(source, target).await?;
    } else {
        fs::hard_link(source, target).await?;
        if let Err(err) = fs::remove_file(source).await {
            warn!(
                source = %source.display(),
                error = %err,
                "published upload but could not remove its staging file"
            );
        }
    }
    if let Some(parent) = target.parent() {
        let _ = sync_dir(parent).await;
    }
    Ok(())
}

/// 判断两个路径是否指向同一文件（例如中断的发布遗留的硬链接）。
pub async fn same_file(a: &Path, b: &Path) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;

        match (fs::metadata(a).await, fs::metadata(b).await) {
            (Ok(a), Ok(b)) => a.dev() == b.dev() && a.ino() == b.ino(),
            _ => false,
        }
    }
    #[cfg(not(unix))]
    {
        let _ = (a, b);
        false
    }
}

async fn sync_dir(path: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let dir = std::fs::File::open(path)?;
            dir.sync_all()
        })
        .await
        .map_err(|err| io::Error::other(err.to_string()))?
    }
    #[cfg(not(unix))]
    {
        let _ = path;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn write_file_atomic_replaces_content() {
        let temp = tempdir().expect("tempdir");
        let target = temp.path().join("record.json");
        write_file_atomic(&target, b"first").await.expect("write");
        write_file_atomic(&target, b"second").await.expect("write");
        assert_eq!(std::fs::read(&target).expect("read"), b"second");

        let leftovers = std::fs::read_dir(temp.path()).expect("read dir").count();
        assert_eq!(leftovers, 1, "temp files should not linger");
    }

    #[tokio::test]
    async fn publish_without_overwrite_keeps_existing_target() {
        let temp = tempdir().expect("tempdir");
        let source = temp.path().join("upload.bin");
        let target = temp.path().join("hello.txt");
        std::fs::write(&source, b"new").expect("write source");
        std::fs::write(&target, b"old").expect("write target");

        let err = publish(&source, &target, false).await.expect_err("must fail");
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
        assert_eq!(std::fs::read(&target).expect("read"), b"old");
        assert!(source.exists());

        publish(&source, &target, true).await.expect("overwrite");
        assert_eq!(std::fs::read(&target).expect("read"), b"new");
        assert!(!source.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn same_file_follows_hard_links() {
        let temp = tempdir().expect("tempdir");
        let source = temp.path().join("upload.bin");
        let linked = temp.path().join("linked.txt");
        let copied = temp.path().join("copied.txt");
        std::fs::write(&source, b"data").expect("write source");
        std::fs::hard_link(&source, &linked).expect("link");
        std::fs::write(&copied, b"data").expect("write copy");

        assert!(same_file(&source, &linked).await);
        assert!(!same_file(&source, &copied).await);
        assert!(!same_file(&source, &temp.path().join("missing")).await);
    }
}

//! 基于文件系统的上传存储。
//!
//! 每个存储位置在隐藏的 `.tus` 目录中保存记录：`<id>.json` 为元数据，
//! `<id>.bin` 为原始内容。追加时先写入并同步数据，再原子提交偏移量，
//! 记录的偏移量不会超过已落盘的内容；超出偏移量的残留字节在下次追加时截断。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{ErrorKind, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use uuid::Uuid;

use crate::atomic::{publish, same_file, write_file_atomic};
use crate::error::TusError;
use crate::resolver::StorageLocation;

pub const STATE_DIR: &str = ".tus";
const RECORD_EXT: &str = "json";
const CONTENT_EXT: &str = "bin";

/// 客户端提供的元数据，引擎不解析。
pub type Metadata = BTreeMap<String, String>;

/// 上传的生命周期状态（过期或删除的上传不再有记录）。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadState {
    Created,
    InProgress,
    Complete,
    Finalized,
}

/// 单个上传的持久化记录。
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UploadResource {
    pub id: String,
    pub length: u64,
    pub offset: u64,
    #[serde(default)]
    pub metadata: Metadata,
    pub filename: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalized_path: Option<PathBuf>,
}

impl UploadResource {
    pub fn state(&self) -> UploadState {
        if self.finalized_path.is_some() {
            UploadState::Finalized
        } else if self.offset == self.length {
            UploadState::Complete
        } else if self.offset == 0 {
            UploadState::Created
        } else {
            UploadState::InProgress
        }
    }

    pub fn is_complete(&self) -> bool {
        self.offset == self.length
    }
}

/// 从 `filename` 元数据推导最终文件名，不可用时回退为上传 ID。
pub fn derive_filename(metadata: &Metadata, id: &str) -> String {
    metadata
        .get("filename")
        .and_then(|name| name.rsplit(['/', '\\']).next())
        .map(str::trim)
        .filter(|name| !name.is_empty() && !name.starts_with('.') && !name.contains('\0'))
        .map(str::to_string)
        .unwrap_or_else(|| id.to_string())
}

#[derive(Clone, Debug, Default)]
pub struct UploadStore;

impl UploadStore {
    pub fn new() -> Self {
        Self
    }

    pub fn final_path(&self, location: &StorageLocation, filename: &str) -> PathBuf {
        location.path().join(filename)
    }

    /// 创建偏移量为 0 的新上传与空内容文件。
    pub async fn create(
        &self,
        location: &StorageLocation,
        length: u64,
        metadata: Metadata,
    ) -> Result<UploadResource, TusError> {
        ensure_confined(location).await?;
        let state_dir = location.path().join(STATE_DIR);
        fs::create_dir_all(&state_dir).await?;
        ensure_confined(location).await?;

        let id = Uuid::new_v4().to_string();
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(content_path(location, &id))
            .await?;

        let now = Utc::now();
        let resource = UploadResource {
            filename: derive_filename(&metadata, &id),
            id,
            length,
            offset: 0,
            metadata,
            created_at: now,
            updated_at: now,
            finalized_path: None,
        };
        if let Err(err) = write_record(location, &resource).await {
            let _ = fs::remove_file(content_path(location, &resource.id)).await;
            return Err(err);
        }
        Ok(resource)
    }

    pub async fn get(&self, location: &StorageLocation, id: &str) -> Result<UploadResource, TusError> {
        check_id(id)?;
        let bytes = match fs::read(record_path(location, id)).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(TusError::NotFound(id.to_string()));
            }
            Err(err) => return Err(err.into()),
        };
        serde_json::from_slice(&bytes)
            .map_err(|err| TusError::StoreUnavailable(format!("corrupt record {id}: {err}")))
    }

    /// 在 `expected_offset` 处追加数据并提交新偏移量，校验失败时不做任何修改。
    pub async fn append(
        &self,
        location: &StorageLocation,
        id: &str,
        expected_offset: u64,
        bytes: &[u8],
    ) -> Result<UploadResource, TusError> {
        let mut resource = self.get(location, id).await?;
        if expected_offset != resource.offset {
            return Err(TusError::OffsetConflict {
                expected: resource.offset,
                actual: expected_offset,
            });
        }
        let chunk = bytes.len() as u64;
        if resource.offset.saturating_add(chunk) > resource.length {
            return Err(TusError::LengthExceeded {
                offset: resource.offset,
                chunk,
                length: resource.length,
            });
        }
        if chunk == 0 {
            return Ok(resource);
        }
        ensure_confined(location).await?;

        let mut file = match OpenOptions::new()
            .write(true)
            .open(content_path(location, id))
            .await
        {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(TusError::StoreUnavailable(format!("content of {id} is missing")));
            }
            Err(err) => return Err(err.into()),
        };
        file.set_len(resource.offset).await?;
        file.seek(SeekFrom::Start(resource.offset)).await?;
        file.write_all(bytes).await?;
        file.sync_data().await?;
        drop(file);

        resource.offset += chunk;
        resource.updated_at = Utc::now();
        write_record(location, &resource).await?;
        Ok(resource)
    }

    /// 将已提交偏移量回退到 `offset`，多余字节在下次追加时丢弃。
    pub async fn rewind(
        &self,
        location: &StorageLocation,
        id: &str,
        offset: u64,
    ) -> Result<UploadResource, TusError> {
        let mut resource = self.get(location, id).await?;
        if resource.finalized_path.is_some() || offset > resource.offset {
            return Err(TusError::OffsetConflict {
                expected: resource.offset,
                actual: offset,
            });
        }
        resource.offset = offset;
        resource.updated_at = Utc::now();
        write_record(location, &resource).await?;
        Ok(resource)
    }

    /// 删除记录与未发布的内容，已发布的文件保留；删除不存在的上传视为成功。
    pub async fn delete(&self, location: &StorageLocation, id: &str) -> Result<(), TusError> {
        if check_id(id).is_err() {
            return Ok(());
        }
        remove_if_exists(&content_path(location, id)).await?;
        remove_if_exists(&record_path(location, id)).await?;
        Ok(())
    }

    /// 将已完成上传的内容发布为 `filename` 并记录最终路径。
    pub async fn finalize(
        &self,
        location: &StorageLocation,
        id: &str,
        filename: &str,
        overwrite: bool,
    ) -> Result<PathBuf, TusError> {
        let mut resource = self.get(location, id).await?;
        if let Some(path) = &resource.finalized_path {
            return Ok(path.clone());
        }
        if !resource.is_complete() {
            return Err(TusError::IncompleteUpload {
                offset: resource.offset,
                length: resource.length,
            });
        }
        ensure_confined(location).await?;

        let source = content_path(location, id);
        let target = self.final_path(location, filename);
        // 内容缺失只可能是上次发布后未来得及更新记录。
        let source_exists = fs::try_exists(&source).await?;
        if source_exists {
            match publish(&source, &target, overwrite).await {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if !same_file(&source, &target).await {
                        return Err(TusError::FileExists(filename.to_string()));
                    }
                    // 上次发布已建立硬链接但未删除暂存文件。
                    remove_if_exists(&source).await?;
                }
                Err(err) => return Err(err.into()),
            }
        } else if !fs::try_exists(&target).await? {
            return Err(TusError::StoreUnavailable(format!("content of {id} is missing")));
        }

        resource.finalized_path = Some(target.clone());
        resource.updated_at = Utc::now();
        write_record(location, &resource).await?;
        Ok(target)
    }

    /// 列出存储位置下所有记录的 ID（不解析记录内容）。
    pub async fn list_ids(&self, location: &StorageLocation) -> Result<Vec<String>, TusError> {
        let state_dir = location.path().join(STATE_DIR);
        let mut dir = match fs::read_dir(&state_dir).await {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        let mut ids = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            if let Some(id) = path.file_stem().and_then(|stem| stem.to_str())
                && check_id(id).is_ok()
            {
                ids.push(id.to_string());
            }
        }
        Ok(ids)
    }
}

/// 上传 ID 必须是 UUID。
pub fn check_id(id: &str) -> Result<(), TusError> {
    Uuid::parse_str(id)
        .map(|_| ())
        .map_err(|_| TusError::NotFound(id.to_string()))
}

fn record_path(location: &StorageLocation, id: &str) -> PathBuf {
    location
        .path()
        .join(STATE_DIR)
        .join(format!("{id}.{RECORD_EXT}"))
}

fn content_path(location: &StorageLocation, id: &str) -> PathBuf {
    location
        .path()
        .join(STATE_DIR)
        .join(format!("{id}.{CONTENT_EXT}"))
}

async fn write_record(location: &StorageLocation, resource: &UploadResource) -> Result<(), TusError> {
    let bytes = serde_json::to_vec(resource)
        .map_err(|err| TusError::StoreUnavailable(err.to_string()))?;
    write_file_atomic(&record_path(location, &resource.id), &bytes).await
}

async fn remove_if_exists(path: &Path) -> Result<(), TusError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// 拒绝越出根目录或经过符号链接的存储位置。
async fn ensure_confined(location: &StorageLocation) -> Result<(), TusError> {
    let rejected = || TusError::PathTraversalRejected(location.path().display().to_string());
    let relative = location
        .path()
        .strip_prefix(location.root())
        .map_err(|_| rejected())?;
    let mut current = location.root().to_path_buf();
    for component in relative.components() {
        let std::path::Component::Normal(segment) = component else {
            return Err(rejected());
        };
        current.push(segment);
        match fs::symlink_metadata(&current).await {
            Ok(metadata) => {
                if metadata.file_type().is_symlink() || !metadata.is_dir() {
                    return Err(rejected());
                }
            }
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

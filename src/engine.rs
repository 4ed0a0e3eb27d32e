//! 可续传上传引擎：创建、查询、按偏移追加、完成、删除与过期清理。
//!
//! 同一上传的追加、完成与删除通过上传锁串行化，不同上传互不等待。

use chrono::{DateTime, TimeDelta, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::checksum::Checksum;
use crate::config::{SWEEP_LOCK_TIMEOUT_MS, TusConfig};
use crate::error::TusError;
use crate::locking::LockManager;
use crate::resolver::{Bindings, StorageLocation, UploadEndpoint};
use crate::storage::{
    Metadata, UploadResource, UploadState, UploadStore, check_id, derive_filename,
};

#[derive(Debug)]
pub struct CreatedUpload {
    pub id: String,
    /// 绑定占位符后的端点地址加上传 ID。
    pub address: String,
    pub state: UploadState,
    pub expires_at: Option<DateTime<Utc>>,
    pub final_path: Option<PathBuf>,
}

#[derive(Debug)]
pub struct UploadStatus {
    pub offset: u64,
    pub length: u64,
    pub state: UploadState,
    pub metadata: Metadata,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct AppendOutcome {
    pub offset: u64,
    pub complete: bool,
    pub final_path: Option<PathBuf>,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// 超过保留期被移除的未完成上传。
    pub expired: usize,
    /// 超过保留期被清理的已完成记录。
    pub pruned: usize,
    /// 因请求持有锁而跳过的上传。
    pub busy: usize,
    /// 无法读取或删除的位置与记录。
    pub skipped: usize,
}

pub struct UploadEngine {
    config: Arc<TusConfig>,
    store: UploadStore,
    locks: LockManager,
}

impl UploadEngine {
    pub fn new(config: Arc<TusConfig>) -> Self {
        Self {
            config,
            store: UploadStore::new(),
            locks: LockManager::new(),
        }
    }

    pub fn config(&self) -> &TusConfig {
        &self.config
    }

    pub async fn create_upload(
        &self,
        endpoint: &UploadEndpoint,
        bindings: &Bindings,
        declared_length: i64,
        metadata: Metadata,
    ) -> Result<CreatedUpload, TusError> {
        let length =
            u64::try_from(declared_length).map_err(|_| TusError::InvalidLength(declared_length))?;
        if endpoint.max_size > 0 && length > endpoint.max_size {
            return Err(TusError::MaxSizeExceeded {
                length,
                max: endpoint.max_size,
            });
        }
        // 写入前先校验占位符取值。
        endpoint.url_for(bindings)?;
        let location = endpoint.resolve(bindings)?;

        let requested_name = derive_filename(&metadata, "");
        if !endpoint.allow_overwrite
            && !requested_name.is_empty()
            && tokio::fs::try_exists(self.store.final_path(&location, &requested_name)).await?
        {
            return Err(TusError::FileExists(requested_name));
        }

        let resource = self.store.create(&location, length, metadata).await?;
        let id = resource.id.clone();
        let address = endpoint.resource_url(bindings, &id)?;

        let mut final_path = None;
        let mut state = resource.state();
        if length == 0 {
            let guard = self.locks.lock_upload(&id, self.config.lock_timeout).await?;
            match self.finalize_locked(endpoint, &location, &resource).await {
                Ok(path) => final_path = Some(path),
                Err(err) => {
                    // 调用方拿不到 ID，不留残余记录。
                    self.store.delete(&location, &id).await?;
                    drop(guard);
                    self.locks.forget(&id).await;
                    return Err(err);
                }
            }
            state = UploadState::Finalized;
            drop(guard);
            if !endpoint.retain_completed {
                self.locks.forget(&id).await;
            }
        }

        Ok(CreatedUpload {
            id,
            address,
            state,
            expires_at: final_path
                .is_none()
                .then(|| expires_at(&resource, endpoint.retention))
                .flatten(),
            final_path,
        })
    }

    pub async fn get_status(
        &self,
        endpoint: &UploadEndpoint,
        bindings: &Bindings,
        id: &str,
    ) -> Result<UploadStatus, TusError> {
        let location = endpoint.resolve(bindings)?;
        let resource = self.store.get(&location, id).await?;
        Ok(UploadStatus {
            offset: resource.offset,
            length: resource.length,
            state: resource.state(),
            expires_at: expires_at(&resource, endpoint.retention),
            metadata: resource.metadata,
        })
    }

    pub async fn append_chunk(
        &self,
        endpoint: &UploadEndpoint,
        bindings: &Bindings,
        id: &str,
        offset_claim: u64,
        bytes: &[u8],
        checksum: Option<&Checksum>,
    ) -> Result<AppendOutcome, TusError> {
        let location = endpoint.resolve(bindings)?;
        check_id(id)?;
        let guard = self.locks.lock_upload(id, self.config.lock_timeout).await?;

        let current = self.store.get(&location, id).await?;
        if current.offset != offset_claim {
            return Err(TusError::OffsetConflict {
                expected: current.offset,
                actual: offset_claim,
            });
        }
        if let Some(checksum) = checksum {
            checksum.verify(bytes)?;
        }
        let completes = !bytes.is_empty()
            && current.finalized_path.is_none()
            && current.offset.saturating_add(bytes.len() as u64) == current.length;
        if completes && !endpoint.allow_overwrite {
            self.ensure_target_free(&location, &current).await?;
        }

        let resource = self
            .store
            .append(&location, id, offset_claim, bytes)
            .await?;
        let mut final_path = resource.finalized_path.clone();
        if resource.is_complete() && final_path.is_none() {
            match self.finalize_locked(endpoint, &location, &resource).await {
                Ok(path) => final_path = Some(path),
                Err(err) => {
                    if completes {
                        // 回退最后一个分片，客户端可重新发送。
                        self.store.rewind(&location, id, current.offset).await?;
                    }
                    return Err(err);
                }
            }
        }
        drop(guard);
        if final_path.is_some() && !endpoint.retain_completed {
            self.locks.forget(id).await;
        }

        Ok(AppendOutcome {
            offset: resource.offset,
            complete: resource.is_complete(),
            expires_at: match final_path {
                Some(_) => None,
                None => expires_at(&resource, endpoint.retention),
            },
            final_path,
        })
    }

    /// 删除任意状态的上传，不存在的上传不报错。
    pub async fn delete_upload(
        &self,
        endpoint: &UploadEndpoint,
        bindings: &Bindings,
        id: &str,
    ) -> Result<(), TusError> {
        let location = endpoint.resolve(bindings)?;
        if check_id(id).is_err() {
            return Ok(());
        }
        let guard = self.locks.lock_upload(id, self.config.lock_timeout).await?;
        self.store.delete(&location, id).await?;
        drop(guard);
        self.locks.forget(id).await;
        Ok(())
    }

    /// 清理过期的未完成上传与已完成记录。
    ///
    /// 无法读取的位置或记录只记录日志并计数，不会中断清理。
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();
        for endpoint in &self.config.endpoints {
            if endpoint.retention.is_zero() {
                continue;
            }
            let locations = match endpoint.discover_locations().await {
                Ok(locations) => locations,
                Err(err) => {
                    warn!(
                        url = endpoint.url_template(),
                        error = %err,
                        "cannot walk upload storage"
                    );
                    report.skipped += 1;
                    continue;
                }
            };
            for location in locations {
                self.sweep_location(endpoint, &location, now, &mut report)
                    .await;
            }
        }
        self.locks.prune_idle().await;
        report
    }

    async fn sweep_location(
        &self,
        endpoint: &UploadEndpoint,
        location: &StorageLocation,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) {
        let ids = match self.store.list_ids(location).await {
            Ok(ids) => ids,
            Err(err) => {
                warn!(path = %location.path().display(), error = %err, "cannot list uploads");
                report.skipped += 1;
                return;
            }
        };
        for id in ids {
            let resource = match self.store.get(location, &id).await {
                Ok(resource) => resource,
                Err(TusError::NotFound(_)) => continue,
                Err(err) => {
                    warn!(upload_id = id, error = %err, "skipping unreadable upload record");
                    report.skipped += 1;
                    continue;
                }
            };
            if !is_expired(&resource, endpoint.retention, now) {
                continue;
            }
            if let Err(err) = self.sweep_one(endpoint, location, &id, now, report).await {
                warn!(upload_id = id, error = %err, "failed to expire upload");
                report.skipped += 1;
            }
        }
    }

    async fn sweep_one(
        &self,
        endpoint: &UploadEndpoint,
        location: &StorageLocation,
        id: &str,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> Result<(), TusError> {
        let guard = match self
            .locks
            .lock_upload(id, Duration::from_millis(SWEEP_LOCK_TIMEOUT_MS))
            .await
        {
            Ok(guard) => guard,
            Err(TusError::Busy) => {
                report.busy += 1;
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        // 持锁后重新读取，期间可能有新的追加。
        let resource = match self.store.get(location, id).await {
            Ok(resource) => resource,
            Err(TusError::NotFound(_)) => return Ok(()),
            Err(err) => return Err(err),
        };
        if !is_expired(&resource, endpoint.retention, now) {
            return Ok(());
        }
        self.store.delete(location, id).await?;
        drop(guard);
        self.locks.forget(id).await;

        if resource.state() == UploadState::Finalized {
            report.pruned += 1;
        } else {
            report.expired += 1;
        }
        Ok(())
    }

    async fn ensure_target_free(
        &self,
        location: &StorageLocation,
        resource: &UploadResource,
    ) -> Result<(), TusError> {
        let target = self.store.final_path(location, &resource.filename);
        if tokio::fs::try_exists(&target).await? {
            return Err(TusError::FileExists(resource.filename.clone()));
        }
        Ok(())
    }

    async fn finalize_locked(
        &self,
        endpoint: &UploadEndpoint,
        location: &StorageLocation,
        resource: &UploadResource,
    ) -> Result<PathBuf, TusError> {
        let path = self
            .store
            .finalize(
                location,
                &resource.id,
                &resource.filename,
                endpoint.allow_overwrite,
            )
            .await?;
        if !endpoint.retain_completed {
            self.store.delete(location, &resource.id).await?;
        }
        Ok(path)
    }
}

fn expires_at(resource: &UploadResource, retention: Duration) -> Option<DateTime<Utc>> {
    if retention.is_zero() || resource.state() == UploadState::Finalized {
        return None;
    }
    let retention = TimeDelta::from_std(retention).ok()?;
    resource.updated_at.checked_add_signed(retention)
}

fn is_expired(resource: &UploadResource, retention: Duration, now: DateTime<Utc>) -> bool {
    match TimeDelta::from_std(retention)
        .ok()
        .and_then(|retention| resource.updated_at.checked_add_signed(retention))
    {
        Some(deadline) => deadline <= now,
        None => false,
    }
}

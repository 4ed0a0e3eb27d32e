//! 上传锁：串行化同一上传的追加、完成与删除。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time;

use crate::error::TusError;

pub type UploadGuard = OwnedMutexGuard<()>;

/// Manages asynchronous mutexes keyed by upload identifier.
#[derive(Debug, Default)]
pub struct LockManager {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// 在给定超时时间内获取上传锁，超时返回 `Busy`。
    pub async fn lock_upload(&self, id: &str, timeout: Duration) -> Result<UploadGuard, TusError> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        time::timeout(timeout, lock.lock_owned())
            .await
            .map_err(|_| TusError::Busy)
    }

    /// 移除已删除上传的锁句柄。
    pub async fn forget(&self, id: &str) {
        self.locks.lock().await.remove(id);
    }

    /// 回收无人持有或等待的锁句柄。
    pub async fn prune_idle(&self) -> usize {
        let mut locks = self.locks.lock().await;
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - locks.len()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.locks.lock().await.len()
    }
}

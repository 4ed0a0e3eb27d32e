//! 过期上传清理的后台任务。

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};

use crate::engine::UploadEngine;

/// 启动后台清理任务（首轮立即执行）。
pub fn spawn_background_tasks(engine: Arc<UploadEngine>) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(engine.config().sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            let report = engine.sweep_expired(Utc::now()).await;
            if report.expired > 0 || report.pruned > 0 || report.skipped > 0 {
                info!(
                    expired = report.expired,
                    pruned = report.pruned,
                    busy = report.busy,
                    skipped = report.skipped,
                    "upload sweep finished"
                );
            } else {
                debug!(busy = report.busy, "upload sweep found nothing to do");
            }
        }
    });
}

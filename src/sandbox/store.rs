//! 按运行隔离的分支管理器存储
//!
//! 每次推理运行拥有自己的分支树与沙箱；运行结束时调用 clear 释放全部沙箱。

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::sandbox::{BranchManagerConfig, SandboxBranchManager, SandboxProvider};

pub struct SandboxStore {
    provider: Arc<dyn SandboxProvider>,
    config: BranchManagerConfig,
    runs: Mutex<HashMap<String, Arc<SandboxBranchManager>>>,
}

impl SandboxStore {
    pub fn new(provider: Arc<dyn SandboxProvider>, config: BranchManagerConfig) -> Self {
        Self {
            provider,
            config,
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// 取得（必要时创建）某次运行的分支管理器
    pub async fn get_or_create(&self, run_id: &str) -> Arc<SandboxBranchManager> {
        let mut runs = self.runs.lock().await;
        runs.entry(run_id.to_string())
            .or_insert_with(|| {
                tracing::debug!(run_id, "branch manager created");
                Arc::new(SandboxBranchManager::new(
                    self.provider.clone(),
                    self.config.clone(),
                ))
            })
            .clone()
    }

    /// 移除运行并释放其所有沙箱；未知 run_id 忽略
    pub async fn clear(&self, run_id: &str) {
        let removed = self.runs.lock().await.remove(run_id);
        if let Some(manager) = removed {
            manager.release_all().await;
            tracing::debug!(run_id, "run sandboxes released");
        }
    }

    pub async fn active_runs(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.runs.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }
}

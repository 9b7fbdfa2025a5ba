//! 沙箱分支树
//!
//! 分支以 id 为键存放在 arena 中，父分支只以 id 引用。每个分支记录：
//! - `fork_point`：分叉时父分支有效历史的长度（快照点）；
//! - `commands`：分叉后本分支自己执行过的命令。
//!
//! 有效历史 = 父分支有效历史的前 fork_point 条 + 本分支 commands，沿父链有界回溯计算。
//! 父分支之后追加的命令不会影响已有子分支。
//!
//! 并发模型：结构编辑（插入 / 删除 / 记录）在 arena 的写锁内完成且不跨 await；每个分支的沙箱槽位
//! 由独立的异步互斥锁保护，一次工具调用期间一直持有（[`BranchLease`]）。回收只 try_lock，
//! 正在执行的分支会被跳过，留待下次回收。锁顺序固定为「槽位 → arena」。

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::sandbox::{CodeSandbox, ExecutionOutput, SandboxError, SandboxProvider};

/// 分支 id
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BranchId(String);

impl BranchId {
    pub fn root() -> Self {
        Self("root".to_string())
    }

    fn generate() -> Self {
        Self(format!("branch-{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == "root"
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BranchId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

struct SandboxSlot {
    sandbox: Option<Arc<dyn CodeSandbox>>,
    last_used: Instant,
    evicted: bool,
}

struct BranchNode {
    parent: Option<BranchId>,
    fork_point: usize,
    commands: Vec<String>,
    slot: Arc<Mutex<SandboxSlot>>,
}

impl BranchNode {
    fn new(parent: Option<BranchId>, fork_point: usize) -> Self {
        Self {
            parent,
            fork_point,
            commands: Vec::new(),
            slot: Arc::new(Mutex::new(SandboxSlot {
                sandbox: None,
                last_used: Instant::now(),
                evicted: false,
            })),
        }
    }
}

type Arena = HashMap<BranchId, BranchNode>;

/// 分配重试参数
#[derive(Debug, Clone)]
pub struct BranchManagerConfig {
    pub allocation_attempts: u32,
    pub allocation_backoff: Duration,
}

impl Default for BranchManagerConfig {
    fn default() -> Self {
        Self {
            allocation_attempts: 3,
            allocation_backoff: Duration::from_millis(500),
        }
    }
}

/// 分支树管理器：独占所有分支与活跃沙箱
pub struct SandboxBranchManager {
    provider: Arc<dyn SandboxProvider>,
    config: BranchManagerConfig,
    arena: RwLock<Arena>,
}

impl SandboxBranchManager {
    pub fn new(provider: Arc<dyn SandboxProvider>, config: BranchManagerConfig) -> Self {
        let mut arena = Arena::new();
        arena.insert(BranchId::root(), BranchNode::new(None, 0));
        Self {
            provider,
            config,
            arena: RwLock::new(arena),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Arena> {
        self.arena.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Arena> {
        self.arena.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn root(&self) -> BranchId {
        BranchId::root()
    }

    pub fn contains(&self, id: &BranchId) -> bool {
        self.read().contains_key(id)
    }

    /// 当前所有分支 id（排序后返回）
    pub fn branch_ids(&self) -> Vec<BranchId> {
        let mut ids: Vec<BranchId> = self.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn parent_of(&self, id: &BranchId) -> Option<BranchId> {
        self.read().get(id).and_then(|n| n.parent.clone())
    }

    /// 从 parent 分叉出新分支，快照 parent 当前的有效历史
    pub fn fork(&self, parent: &BranchId) -> Result<BranchId, SandboxError> {
        let mut arena = self.write();
        let fork_point = effective_history(&arena, parent)?.len();
        let id = BranchId::generate();
        arena.insert(id.clone(), BranchNode::new(Some(parent.clone()), fork_point));
        tracing::debug!(branch = %id, parent = %parent, fork_point, "branch forked");
        Ok(id)
    }

    /// 从根开始按顺序重放即可复现该分支状态的命令序列
    pub fn effective_history(&self, id: &BranchId) -> Result<Vec<String>, SandboxError> {
        effective_history(&self.read(), id)
    }

    /// 仅本分支分叉后执行的命令
    pub fn own_commands(&self, id: &BranchId) -> Result<Vec<String>, SandboxError> {
        self.read()
            .get(id)
            .map(|n| n.commands.clone())
            .ok_or_else(|| SandboxError::BranchNotFound(id.clone()))
    }

    /// 追加一条命令到该分支自身的 commands
    pub fn record(&self, id: &BranchId, command: &str) -> Result<(), SandboxError> {
        let mut arena = self.write();
        let node = arena
            .get_mut(id)
            .ok_or_else(|| SandboxError::BranchNotFound(id.clone()))?;
        node.commands.push(command.to_string());
        Ok(())
    }

    /// 取得分支的沙箱租约：未分配时先分配并重放有效历史。
    /// 租约存续期间该分支不会被回收；重放失败对该分支是致命的。
    pub async fn materialize(&self, id: &BranchId) -> Result<BranchLease<'_>, SandboxError> {
        let slot = self
            .read()
            .get(id)
            .map(|n| n.slot.clone())
            .ok_or_else(|| SandboxError::BranchNotFound(id.clone()))?;
        let mut guard = slot.lock_owned().await;
        if guard.evicted {
            return Err(SandboxError::BranchNotFound(id.clone()));
        }

        if guard.sandbox.is_none() {
            let sandbox = self.allocate().await?;
            let history = self.effective_history(id)?;
            for (index, command) in history.iter().enumerate() {
                match sandbox.run(command, None).await {
                    Ok(output) => {
                        if let Some(err) = &output.error {
                            tracing::debug!(branch = %id, index, error = %err.name, "replayed command raised");
                        }
                    }
                    Err(e) => {
                        self.provider.release(sandbox).await;
                        return Err(SandboxError::Replay {
                            branch: id.clone(),
                            index,
                            message: e.to_string(),
                        });
                    }
                }
            }
            tracing::debug!(branch = %id, sandbox = sandbox.id(), replayed = history.len(), "branch materialized");
            guard.sandbox = Some(sandbox);
        }

        guard.last_used = Instant::now();
        Ok(BranchLease {
            manager: self,
            branch: id.clone(),
            slot: guard,
            in_flight: false,
        })
    }

    /// materialize + run 的便捷组合
    pub async fn execute(
        &self,
        id: &BranchId,
        code: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecutionOutput, SandboxError> {
        let mut lease = self.materialize(id).await?;
        lease.run(code, timeout).await
    }

    async fn allocate(&self) -> Result<Arc<dyn CodeSandbox>, SandboxError> {
        let attempts = self.config.allocation_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.provider.allocate().await {
                Ok(sandbox) => return Ok(sandbox),
                Err(e) => {
                    tracing::warn!(attempt, attempts, error = %e, "sandbox allocation failed");
                    last_error = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(self.config.allocation_backoff * attempt).await;
                    }
                }
            }
        }
        Err(SandboxError::Unavailable {
            attempts,
            message: last_error,
        })
    }

    /// 回收除 exclude 与根以外、空闲不少于 max_idle 的分支：释放其沙箱并从树中删除。
    /// 正在执行工具调用的分支会被跳过。返回被删除的分支 id。
    pub async fn evict(&self, exclude: &BranchId, max_idle: Duration) -> Vec<BranchId> {
        let mut released = Vec::new();
        let mut removed = Vec::new();
        {
            let mut arena = self.write();
            let mut candidates: Vec<BranchId> = arena
                .keys()
                .filter(|id| !id.is_root() && *id != exclude)
                .cloned()
                .collect();
            candidates.sort();

            for id in candidates {
                let Some(slot) = arena.get(&id).map(|n| n.slot.clone()) else {
                    continue;
                };
                let Ok(mut slot) = slot.try_lock_owned() else {
                    tracing::debug!(branch = %id, "branch busy, eviction deferred");
                    continue;
                };
                if slot.last_used.elapsed() < max_idle {
                    continue;
                }
                slot.evicted = true;
                if let Some(sandbox) = slot.sandbox.take() {
                    released.push(sandbox);
                }
                drop(slot);
                detach(&mut arena, &id);
                removed.push(id);
            }
        }

        for sandbox in released {
            self.provider.release(sandbox).await;
        }
        if !removed.is_empty() {
            tracing::info!(evicted = removed.len(), kept = %exclude, "idle branches evicted");
        }
        removed
    }

    /// 立即删除指定分支（等待其进行中的调用结束）；根分支被忽略
    pub async fn discard(&self, ids: &[BranchId]) {
        for id in ids.iter().filter(|id| !id.is_root()) {
            let Some(slot) = self.read().get(id).map(|n| n.slot.clone()) else {
                continue;
            };
            let mut slot = slot.lock_owned().await;
            slot.evicted = true;
            let sandbox = slot.sandbox.take();
            detach(&mut self.write(), id);
            drop(slot);
            if let Some(sandbox) = sandbox {
                self.provider.release(sandbox).await;
            }
        }
    }

    /// 释放所有分支持有的沙箱（分支树保留，之后再用会重新分配并重放）
    pub async fn release_all(&self) {
        let slots: Vec<Arc<Mutex<SandboxSlot>>> =
            self.read().values().map(|n| n.slot.clone()).collect();
        for slot in slots {
            let sandbox = slot.lock().await.sandbox.take();
            if let Some(sandbox) = sandbox {
                self.provider.release(sandbox).await;
            }
        }
    }
}

/// 单个分支沙箱的独占租约：只在一次工具调用内持有
pub struct BranchLease<'a> {
    manager: &'a SandboxBranchManager,
    branch: BranchId,
    slot: OwnedMutexGuard<SandboxSlot>,
    /// 命令已发往沙箱但尚未得到结果
    in_flight: bool,
}

impl BranchLease<'_> {
    pub fn branch(&self) -> &BranchId {
        &self.branch
    }

    /// 执行并记录命令。沙箱本身失败或超时时状态未知，释放它，下次使用时重新分配并重放。
    pub async fn run(
        &mut self,
        code: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecutionOutput, SandboxError> {
        let sandbox = self
            .slot
            .sandbox
            .clone()
            .ok_or_else(|| SandboxError::BranchNotFound(self.branch.clone()))?;
        self.in_flight = true;
        let result = match timeout {
            Some(limit) => tokio::time::timeout(limit, sandbox.run(code, Some(limit)))
                .await
                .unwrap_or(Err(SandboxError::Timeout(limit))),
            None => sandbox.run(code, None).await,
        };
        self.in_flight = false;
        self.slot.last_used = Instant::now();
        match result {
            Ok(output) => {
                self.manager.record(&self.branch, code)?;
                Ok(output)
            }
            Err(e) => {
                tracing::warn!(branch = %self.branch, error = %e, "sandbox call failed, releasing sandbox");
                if let Some(broken) = self.slot.sandbox.take() {
                    self.manager.provider.release(broken).await;
                }
                Err(e)
            }
        }
    }
}

/// 调用中途被丢弃（如外层超时）：命令可能已生效却未记录，丢弃该沙箱，下次使用时按记录重放
impl Drop for BranchLease<'_> {
    fn drop(&mut self) {
        if !self.in_flight {
            return;
        }
        let Some(sandbox) = self.slot.sandbox.take() else {
            return;
        };
        tracing::warn!(branch = %self.branch, sandbox = sandbox.id(), "sandbox call abandoned, releasing sandbox");
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let provider = self.manager.provider.clone();
        handle.spawn(async move { provider.release(sandbox).await });
    }
}

/// 沿父链回溯到根，按快照点拼接有效历史；回溯步数以分支总数为界
fn effective_history(arena: &Arena, id: &BranchId) -> Result<Vec<String>, SandboxError> {
    let mut chain = Vec::new();
    let mut cursor = Some(id);
    while let Some(current) = cursor {
        if chain.len() > arena.len() {
            return Err(SandboxError::CorruptLineage(id.clone()));
        }
        let node = arena
            .get(current)
            .ok_or_else(|| SandboxError::BranchNotFound(current.clone()))?;
        chain.push(node);
        cursor = node.parent.as_ref();
    }

    let mut history = Vec::new();
    for node in chain.iter().rev() {
        history.truncate(node.fork_point);
        history.extend(node.commands.iter().cloned());
    }
    Ok(history)
}

/// 从树中摘除分支；子分支改挂到它的父分支上，并把继承到的那段命令并入子分支，有效历史不变
fn detach(arena: &mut Arena, id: &BranchId) {
    let Some(node) = arena.remove(id) else {
        return;
    };
    for child in arena
        .values_mut()
        .filter(|n| n.parent.as_ref() == Some(id))
    {
        let inherited = child
            .fork_point
            .saturating_sub(node.fork_point)
            .min(node.commands.len());
        let mut commands = node.commands[..inherited].to_vec();
        commands.append(&mut child.commands);
        child.commands = commands;
        child.fork_point = node.fork_point;
        child.parent = node.parent.clone();
    }
}

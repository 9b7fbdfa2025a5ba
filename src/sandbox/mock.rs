//! 内存 Mock 沙箱：用于测试与无沙箱服务时的本地演示
//!
//! 不真正执行 Python，只记录收到的代码并返回可预测的输出：
//! - 代码含 `raise` 时返回解释器异常；
//! - 代码含 `#crash` 时模拟沙箱本身失败（Err）；
//! - 代码含 `#slow` 时先记录（即已生效）再等待，用于超时场景。

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

use crate::sandbox::{CodeSandbox, ExecutionError, ExecutionOutput, SandboxError, SandboxProvider};

/// `#slow` 代码的默认等待时长
const DEFAULT_SLOW_DELAY: Duration = Duration::from_secs(5);

pub struct MockSandbox {
    id: String,
    executed: Mutex<Vec<String>>,
    slow_delay: Duration,
}

impl MockSandbox {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            executed: Mutex::new(Vec::new()),
            slow_delay: DEFAULT_SLOW_DELAY,
        }
    }

    pub fn with_slow_delay(mut self, delay: Duration) -> Self {
        self.slow_delay = delay;
        self
    }

    /// 按顺序返回执行过的全部代码（含重放）
    pub fn executed(&self) -> Vec<String> {
        self.executed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl CodeSandbox for MockSandbox {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(&self, code: &str, _timeout: Option<Duration>) -> Result<ExecutionOutput, SandboxError> {
        if code.contains("#crash") {
            return Err(SandboxError::Transport(format!("sandbox {} crashed", self.id)));
        }
        self.executed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(code.to_string());

        if code.contains("#slow") {
            tokio::time::sleep(self.slow_delay).await;
        }
        if code.contains("raise") {
            return Ok(ExecutionOutput {
                error: Some(ExecutionError {
                    name: "RuntimeError".to_string(),
                    message: "raised by mock".to_string(),
                    traceback: String::new(),
                }),
                ..Default::default()
            });
        }
        Ok(ExecutionOutput {
            stdout: format!("ran: {code}"),
            ..Default::default()
        })
    }
}

/// Mock 沙箱提供方，记录分配与释放
#[derive(Default)]
pub struct MockSandboxProvider {
    fail_first: u32,
    attempts: AtomicU32,
    next_id: AtomicUsize,
    sandboxes: Mutex<Vec<Arc<MockSandbox>>>,
    released: Mutex<Vec<String>>,
    slow_delay: Option<Duration>,
}

impl MockSandboxProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// 前 n 次分配失败
    pub fn failing_first(mut self, n: u32) -> Self {
        self.fail_first = n;
        self
    }

    /// 新分配的沙箱执行 `#slow` 代码时的等待时长
    pub fn with_slow_delay(mut self, delay: Duration) -> Self {
        self.slow_delay = Some(delay);
        self
    }

    /// 分配调用次数（含失败）
    pub fn allocation_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// 成功分配过的沙箱，按分配顺序
    pub fn sandboxes(&self) -> Vec<Arc<MockSandbox>> {
        self.sandboxes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn released_ids(&self) -> Vec<String> {
        self.released
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// 当前未释放的沙箱数
    pub fn live_count(&self) -> usize {
        self.sandboxes().len() - self.released_ids().len()
    }
}

#[async_trait]
impl SandboxProvider for MockSandboxProvider {
    async fn allocate(&self) -> Result<Arc<dyn CodeSandbox>, SandboxError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= self.fail_first {
            return Err(SandboxError::Transport("no capacity".to_string()));
        }
        let id = format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut sandbox = MockSandbox::new(id);
        if let Some(delay) = self.slow_delay {
            sandbox = sandbox.with_slow_delay(delay);
        }
        let sandbox = Arc::new(sandbox);
        self.sandboxes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sandbox.clone());
        Ok(sandbox)
    }

    async fn release(&self, sandbox: Arc<dyn CodeSandbox>) {
        self.released
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(sandbox.id().to_string());
    }
}

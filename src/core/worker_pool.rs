//! 有界 worker 池：扇出 / 扇入
//!
//! 每个单元在独立 tokio 任务中运行，先取 Semaphore 许可再执行；结果（含 panic、超时）统一经 mpsc 通道
//! 送回收集端，按完成顺序收集。收集端等待全部单元上报后才返回，单元之间互不取消。

use std::collections::HashSet;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::{mpsc, Semaphore};

use crate::core::AgentError;

/// 单个单元的结果；index 为提交顺序
#[derive(Debug)]
pub struct UnitOutcome<T> {
    pub index: usize,
    pub result: Result<T, AgentError>,
}

/// 有界 worker 池
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    unit_timeout: Option<Duration>,
}

impl WorkerPool {
    pub fn new(max_workers: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_workers.max(1))),
            unit_timeout: None,
        }
    }

    /// 单元超时只让该单元失败，不影响其它单元
    pub fn with_unit_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.unit_timeout = timeout;
        self
    }

    /// 运行全部单元并返回每个单元的结果（按完成顺序）
    pub async fn run_all<T, F, Fut>(&self, units: Vec<F>) -> Vec<UnitOutcome<T>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, AgentError>> + Send + 'static,
        T: Send + 'static,
    {
        let total = units.len();
        let (tx, mut rx) = mpsc::unbounded_channel();

        for (index, unit) in units.into_iter().enumerate() {
            let tx = tx.clone();
            let permits = self.permits.clone();
            let limit = self.unit_timeout;
            tokio::spawn(async move {
                let result = match permits.acquire_owned().await {
                    Ok(permit) => {
                        let result = run_unit(unit, limit).await;
                        drop(permit);
                        result
                    }
                    Err(_) => Err(AgentError::Worker("worker pool closed".to_string())),
                };
                let _ = tx.send(UnitOutcome { index, result });
            });
        }
        drop(tx);

        let mut outcomes = Vec::with_capacity(total);
        while let Some(outcome) = rx.recv().await {
            outcomes.push(outcome);
        }

        // 任务在上报前被运行时销毁时补记失败
        if outcomes.len() < total {
            let reported: HashSet<usize> = outcomes.iter().map(|o| o.index).collect();
            for index in (0..total).filter(|i| !reported.contains(i)) {
                outcomes.push(UnitOutcome {
                    index,
                    result: Err(AgentError::Worker(format!(
                        "unit {index} exited without reporting"
                    ))),
                });
            }
        }
        outcomes
    }
}

async fn run_unit<T, F, Fut>(unit: F, limit: Option<Duration>) -> Result<T, AgentError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, AgentError>>,
{
    let guarded = AssertUnwindSafe(async move { unit().await }).catch_unwind();
    let outcome = match limit {
        Some(limit) => match tokio::time::timeout(limit, guarded).await {
            Ok(outcome) => outcome,
            Err(_) => {
                return Err(AgentError::Worker(format!(
                    "unit timed out after {:.1}s",
                    limit.as_secs_f32()
                )))
            }
        },
        None => guarded.await,
    };
    outcome.unwrap_or_else(|_| Err(AgentError::Worker("unit panicked".to_string())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_every_outcome_is_reported() {
        let pool = WorkerPool::new(2);
        let units: Vec<_> = (0..4usize)
            .map(|i| {
                move || async move {
                    match i {
                        1 => Err(AgentError::Config("bad unit".to_string())),
                        2 => panic!("unit blew up"),
                        _ => Ok(i * 10),
                    }
                }
            })
            .collect();

        let mut outcomes = pool.run_all(units).await;
        outcomes.sort_by_key(|o| o.index);
        assert_eq!(outcomes.len(), 4);
        assert_eq!(outcomes[0].result.as_ref().unwrap(), &0);
        assert!(matches!(outcomes[1].result, Err(AgentError::Config(_))));
        assert!(matches!(outcomes[2].result, Err(AgentError::Worker(_))));
        assert_eq!(outcomes[3].result.as_ref().unwrap(), &30);
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let pool = WorkerPool::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let units: Vec<_> = (0..6)
            .map(|_| {
                let running = running.clone();
                let peak = peak.clone();
                move || async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok::<_, AgentError>(())
                }
            })
            .collect();

        let outcomes = pool.run_all(units).await;
        assert_eq!(outcomes.len(), 6);
        assert!(outcomes.iter().all(|o| o.result.is_ok()));
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_timeout_fails_only_slow_unit() {
        let pool = WorkerPool::new(3).with_unit_timeout(Some(Duration::from_millis(50)));
        let units: Vec<_> = [5u64, 500, 5]
            .into_iter()
            .map(|ms| {
                move || async move {
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok::<_, AgentError>(ms)
                }
            })
            .collect();

        let mut outcomes = pool.run_all(units).await;
        outcomes.sort_by_key(|o| o.index);
        assert!(outcomes[0].result.is_ok());
        assert!(matches!(outcomes[1].result, Err(AgentError::Worker(_))));
        assert!(outcomes[2].result.is_ok());
    }
}

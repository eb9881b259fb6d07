//! 同步协调器模块
//!
//! 负责将离线动作队列排空到云端，包括：
//! - 排空周期状态机（互斥，单周期运行）
//! - 瞬时失败的指数退避重试
//! - 冲突标记与隔离
//! - 同步状态的订阅/广播

pub mod remote;

pub use remote::{HttpRemoteStore, RemoteError, RemoteReviewState, RemoteStore};

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::storage::{ActionQueueRepository, StorageError, StorageResult};

// ============================================================
// 配置与状态类型
// ============================================================

/// 同步配置
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// 退避基准延迟（毫秒）
    pub base_delay_ms: u64,
    /// 退避延迟上限（毫秒）
    pub cap_delay_ms: u64,
    /// 单次云端调用超时（秒）
    pub timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            cap_delay_ms: 60_000,
            timeout_secs: 30,
        }
    }
}

/// 同步状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// 队列已排空
    Synced,
    /// 排空周期进行中
    Syncing,
    /// 存在失败项，等待重试
    Failed,
    /// 存在冲突项，等待外部处置
    Conflict,
}

/// 单个排空周期的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainReport {
    /// 本周期拾取的动作数
    pub attempted: usize,
    /// 成功上行数
    pub succeeded: usize,
    /// 瞬时失败数
    pub failed: usize,
    /// 新增冲突数
    pub conflicts: usize,
    /// 存在残余失败时，整轮重试前的退避延迟
    pub retry_after: Option<Duration>,
}

/// 订阅凭据，传给 unsubscribe 以移除监听器
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

type StatusListener = Arc<dyn Fn(SyncStatus) + Send + Sync>;

// ============================================================
// SyncCoordinator - 同步协调器
// ============================================================

struct CoordinatorInner<R> {
    queue: ActionQueueRepository,
    remote: R,
    config: SyncConfig,
    status: Mutex<SyncStatus>,
    listeners: Mutex<Vec<(u64, StatusListener)>>,
    next_listener_id: AtomicU64,
    /// 整个协调器共用一个重试计数：任何残余失败都会推进退避，
    /// 不按动作单独计数
    retry_count: AtomicU32,
    /// 排空周期互斥：try_lock 失败即表示已有周期在运行
    drain_gate: tokio::sync::Mutex<()>,
}

/// 同步协调器
///
/// 持有队列仓储与云端客户端，将可重试的队列项按入队顺序上行。
/// 克隆共享同一内部状态，可安全跨任务使用。
pub struct SyncCoordinator<R: RemoteStore> {
    inner: Arc<CoordinatorInner<R>>,
}

impl<R: RemoteStore> Clone for SyncCoordinator<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: RemoteStore> SyncCoordinator<R> {
    /// 创建新的同步协调器
    pub fn new(queue: ActionQueueRepository, remote: R, config: SyncConfig) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                queue,
                remote,
                config,
                status: Mutex::new(SyncStatus::Synced),
                listeners: Mutex::new(Vec::new()),
                next_listener_id: AtomicU64::new(1),
                retry_count: AtomicU32::new(0),
                drain_gate: tokio::sync::Mutex::new(()),
            }),
        }
    }

    // ========== 状态与订阅 ==========

    /// 当前同步状态
    pub fn status(&self) -> SyncStatus {
        *self.inner.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// 当前重试计数（残余失败的连续周期数）
    pub fn retry_count(&self) -> u32 {
        self.inner.retry_count.load(Ordering::SeqCst)
    }

    /// 订阅状态变化
    ///
    /// 每次状态转移都会在转移点同步回调所有监听器。
    pub fn subscribe(
        &self,
        listener: impl Fn(SyncStatus) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.inner.next_listener_id.fetch_add(1, Ordering::SeqCst);
        let mut listeners = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        listeners.push((id, Arc::new(listener)));
        SubscriptionId(id)
    }

    /// 取消订阅，返回是否移除了监听器
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id.0);
        listeners.len() < before
    }

    /// 状态转移并同步广播
    fn set_status(&self, status: SyncStatus) {
        {
            let mut current = self.inner.status.lock().unwrap_or_else(|e| e.into_inner());
            if *current == status {
                return;
            }
            *current = status;
        }

        let snapshot: Vec<StatusListener> = {
            let listeners = self
                .inner
                .listeners
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
        };

        for listener in snapshot {
            listener(status);
        }
    }

    // ========== 入队与触发 ==========

    /// 入队一条动作并触发一个排空周期
    ///
    /// 校验/存储错误同步返回；排空中的瞬时失败不在此暴露，
    /// 只通过状态流可见。
    pub async fn submit(&self, kind: &str, payload: &str) -> StorageResult<String> {
        let action_id = self.inner.queue.enqueue(kind, payload)?;
        self.drain().await?;
        Ok(action_id)
    }

    /// 连接恢复信号：立即尝试排空，并对残余失败自动退避重试
    ///
    /// 与手动触发一样，不区分此前失败的原因。
    pub async fn notify_online(&self) -> StorageResult<Option<DrainReport>> {
        log::info!("连接恢复，触发排空");
        self.drain_with_backoff().await
    }

    // ========== 排空周期 ==========

    /// 执行一个排空周期
    ///
    /// 已有周期在运行时返回 `Ok(None)`（触发是无操作）。
    /// 周期内按入队顺序逐条上行；成功删除、冲突隔离、其余失败保留。
    /// 周期结束时若有残余失败，推进重试计数并给出整轮退避延迟。
    pub async fn drain(&self) -> StorageResult<Option<DrainReport>> {
        let _gate = match self.inner.drain_gate.try_lock() {
            Ok(gate) => gate,
            Err(_) => return Ok(None),
        };

        self.set_status(SyncStatus::Syncing);

        let actions = self.inner.queue.list_retryable()?;
        let mut report = DrainReport {
            attempted: actions.len(),
            succeeded: 0,
            failed: 0,
            conflicts: 0,
            retry_after: None,
        };

        for action in &actions {
            match self.inner.queue.mark_syncing(&action.action_id) {
                Ok(()) => {}
                // 同一幂等键的行已随先前成功一并删除
                Err(StorageError::NotFound(_)) => {
                    report.succeeded += 1;
                    continue;
                }
                Err(e) => return Err(e),
            }

            let outcome = tokio::time::timeout(
                Duration::from_secs(self.inner.config.timeout_secs),
                self.inner.remote.apply(action),
            )
            .await;

            match outcome {
                Ok(Ok(())) => {
                    self.inner.queue.mark_succeeded(&action.action_id)?;
                    report.succeeded += 1;
                }
                Ok(Err(RemoteError::Conflict(reason))) => {
                    log::warn!("动作 {} 冲突，等待外部处置: {}", action.action_id, reason);
                    self.inner.queue.mark_conflict(&action.action_id)?;
                    report.conflicts += 1;
                }
                Ok(Err(err)) => {
                    log::warn!("动作 {} 上行失败: {}", action.action_id, err);
                    self.inner
                        .queue
                        .mark_failed(&action.action_id, &err.to_string())?;
                    report.failed += 1;
                }
                Err(_elapsed) => {
                    log::warn!("动作 {} 云端调用超时", action.action_id);
                    self.inner
                        .queue
                        .mark_failed(&action.action_id, "云端调用超时")?;
                    report.failed += 1;
                }
            }
        }

        if report.failed > 0 {
            let n = self.inner.retry_count.fetch_add(1, Ordering::SeqCst);
            report.retry_after = Some(self.backoff_delay(n));
            self.set_status(SyncStatus::Failed);
        } else {
            self.inner.retry_count.store(0, Ordering::SeqCst);
            if self.inner.queue.conflict_count()? > 0 {
                self.set_status(SyncStatus::Conflict);
            } else {
                self.set_status(SyncStatus::Synced);
            }
        }

        log::info!(
            "排空周期结束: 拾取 {}, 成功 {}, 失败 {}, 冲突 {}",
            report.attempted,
            report.succeeded,
            report.failed,
            report.conflicts
        );

        Ok(Some(report))
    }

    /// 执行排空周期，残余失败时按退避延迟重试整轮，直到没有失败项
    pub async fn drain_with_backoff(&self) -> StorageResult<Option<DrainReport>> {
        let mut last = match self.drain().await? {
            Some(report) => report,
            None => return Ok(None),
        };

        while let Some(delay) = last.retry_after {
            log::info!("残余 {} 条失败，{:?} 后重试整轮", last.failed, delay);
            tokio::time::sleep(delay).await;

            match self.drain().await? {
                Some(report) => last = report,
                // 其他周期已接手
                None => break,
            }
        }

        Ok(Some(last))
    }

    /// 第 n 次重试的退避延迟: min(base * 2^n, cap)
    fn backoff_delay(&self, n: u32) -> Duration {
        let factor = 1u64 << n.min(20);
        let delay_ms = self
            .inner
            .config
            .base_delay_ms
            .saturating_mul(factor)
            .min(self.inner.config.cap_delay_ms);
        Duration::from_millis(delay_ms)
    }
}

// ============================================================
// 测试
// ============================================================

//! # fuxi-core - 间隔重复复习引擎与离线同步队列
//!
//! 本 crate 提供学习平台的复习调度子系统:
//!
//! - **SM-2 调度引擎** - 根据回忆质量计算下次复习时间，纯函数、可注入时钟
//! - **到期选择器** - 按到期时间确定性地返回待复习卡片
//! - **离线动作队列** - 崩溃可恢复的本地持久化队列，入队即落盘
//! - **同步协调器** - 排空队列到云端，指数退避重试，冲突隔离，状态订阅
//!
//! ## 数据流
//!
//! 用户评分 → [`scheduler::compute_next_review`] 计算新状态 →
//! 在线时直接落账 ([`storage::ReviewStateRepository::record_review`])，
//! 离线时包装为 [`storage::PendingAction`] 入队 →
//! [`sync::SyncCoordinator`] 最终将队列排空到云端。
//!
//! ## 使用示例
//!
//! ```no_run
//! use fuxi_core::storage::Storage;
//! use fuxi_core::sync::{HttpRemoteStore, SyncConfig, SyncCoordinator};
//!
//! # async fn demo() -> Result<(), fuxi_core::storage::StorageError> {
//! let storage = Storage::new("./data/fuxi.db")?;
//! let config = SyncConfig::default();
//! let remote = HttpRemoteStore::new("https://api.example.com".to_string(), config.timeout_secs);
//! let coordinator = SyncCoordinator::new(storage.action_queue(), remote, config);
//!
//! // 离线提交一次复习，连接恢复后排空
//! coordinator.submit("review", r#"{"cardId":"card-1","quality":4}"#).await?;
//! coordinator.notify_online().await?;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// 模块声明
// ============================================================================

pub mod scheduler;
pub mod storage;
pub mod sync;

// ============================================================================
// 重新导出
// ============================================================================

/// 重新导出调度引擎
pub use scheduler::{compute_next_review, NextReview, ScheduleError, SchedulerState};

/// 重新导出存储层主要类型
pub use storage::{
    ActionQueueRepository, ActionStatus, PendingAction, ReviewState, ReviewStateRepository,
    Storage, StorageError, StorageResult,
};

/// 重新导出同步协调器
pub use sync::{
    DrainReport, HttpRemoteStore, RemoteError, RemoteStore, SubscriptionId, SyncConfig,
    SyncCoordinator, SyncStatus,
};

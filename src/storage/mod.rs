//! SQLite 离线存储模块
//!
//! 提供本地 SQLite 数据库存储功能，支持：
//! - 复习状态的本地持久化与到期查询
//! - 复习/测验提交的离线持久化队列
//! - 同步元数据记录

// ============================================================
// 子模块声明
// ============================================================

pub mod action_queue;
pub mod migrations;
pub mod models;
pub mod review_state;

// ============================================================
// 重新导出主要类型
// ============================================================

pub use action_queue::{ActionQueueRepository, QueueStats};
pub use migrations::run_migrations;
pub use models::{ActionStatus, PendingAction, ReviewState};
pub use review_state::{ReviewStateRepository, ReviewStats};

// ============================================================
// 依赖导入
// ============================================================

use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::scheduler::ScheduleError;

// ============================================================
// 错误类型定义
// ============================================================

/// 存储模块错误类型
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("数据库错误: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("迁移错误: {0}")]
    Migration(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("校验错误: {0}")]
    Validation(String),

    #[error("数据未找到: {0}")]
    NotFound(String),

    #[error("锁获取失败: {0}")]
    LockError(String),
}

impl From<ScheduleError> for StorageError {
    fn from(e: ScheduleError) -> Self {
        StorageError::Validation(e.to_string())
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

// ============================================================
// Storage - 统一存储结构体
// ============================================================

/// 统一存储结构体
///
/// 持有共享数据库连接，提供对各 Repository 的便捷访问。
/// 显式创建、显式传递；不依赖模块加载时的隐式初始化。
pub struct Storage {
    conn: Arc<Mutex<Connection>>,
    db_path: String,
}

impl Storage {
    /// 创建新的 Storage 实例
    ///
    /// 自动启用 WAL 模式、外键约束，并运行数据库迁移。
    ///
    /// # Arguments
    /// * `db_path` - 数据库文件路径
    pub fn new<P: AsRef<Path>>(db_path: P) -> StorageResult<Self> {
        let path_str = db_path.as_ref().to_string_lossy().to_string();
        let connection = Connection::open(&db_path)?;

        // 启用 WAL 模式以提高并发性能
        connection.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA foreign_keys=ON;
             PRAGMA cache_size=-64000;",
        )?;

        let conn = Arc::new(Mutex::new(connection));

        // 运行迁移
        {
            let guard = conn
                .lock()
                .map_err(|e| StorageError::LockError(e.to_string()))?;
            migrations::run_migrations(&guard)?;
        }

        Ok(Self {
            conn,
            db_path: path_str,
        })
    }

    /// 创建内存数据库（用于测试）
    pub fn in_memory() -> StorageResult<Self> {
        let connection = Connection::open_in_memory()?;

        connection.execute_batch(
            "PRAGMA foreign_keys=ON;
             PRAGMA cache_size=-64000;",
        )?;

        let conn = Arc::new(Mutex::new(connection));

        {
            let guard = conn
                .lock()
                .map_err(|e| StorageError::LockError(e.to_string()))?;
            migrations::run_migrations(&guard)?;
        }

        Ok(Self {
            conn,
            db_path: ":memory:".to_string(),
        })
    }

    /// 获取数据库连接
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    /// 获取数据库路径
    pub fn db_path(&self) -> &str {
        &self.db_path
    }

    /// 获取复习状态仓库
    pub fn review_states(&self) -> ReviewStateRepository {
        ReviewStateRepository::new(Arc::clone(&self.conn))
    }

    /// 获取离线动作队列仓库
    pub fn action_queue(&self) -> ActionQueueRepository {
        ActionQueueRepository::new(Arc::clone(&self.conn))
    }

    /// 执行事务
    pub fn transaction<F, T>(&self, f: F) -> StorageResult<T>
    where
        F: FnOnce(&Connection) -> StorageResult<T>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| StorageError::LockError(e.to_string()))?;

        let tx = conn.transaction()?;
        let result = f(&tx)?;
        tx.commit()?;

        Ok(result)
    }

    // ========== 同步元数据操作 ==========

    /// 获取同步元数据
    pub fn get_sync_metadata(&self, key: &str) -> StorageResult<Option<String>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StorageError::LockError(e.to_string()))?;

        let result: Option<String> = conn
            .query_row(
                "SELECT value FROM sync_metadata WHERE key = ?1",
                [key],
                |row| row.get(0),
            )
            .ok();

        Ok(result)
    }

    /// 设置同步元数据
    pub fn set_sync_metadata(&self, key: &str, value: &str) -> StorageResult<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StorageError::LockError(e.to_string()))?;

        conn.execute(
            "INSERT OR REPLACE INTO sync_metadata (key, value, updated_at) VALUES (?1, ?2, datetime('now'))",
            [key, value],
        )?;

        Ok(())
    }

    /// 删除同步元数据
    pub fn delete_sync_metadata(&self, key: &str) -> StorageResult<bool> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| StorageError::LockError(e.to_string()))?;

        let affected = conn.execute("DELETE FROM sync_metadata WHERE key = ?1", [key])?;

        Ok(affected > 0)
    }

    /// 检查是否有待同步的数据
    pub fn has_pending_sync(&self) -> StorageResult<bool> {
        let stats = self.action_queue().stats()?;
        Ok(stats.pending + stats.failed > 0)
    }
}

// ============================================================
// 测试
// ============================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_in_memory() {
        let storage = Storage::in_memory().expect("Failed to create in-memory storage");
        assert_eq!(storage.db_path(), ":memory:");
    }

    #[test]
    fn test_transaction() {
        let storage = Storage::in_memory().expect("Failed to create in-memory storage");

        let result = storage.transaction(|_conn| Ok(42));
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn test_sync_metadata_operations() {
        let storage = Storage::in_memory().expect("Failed to create in-memory storage");

        storage
            .set_sync_metadata("test_key", "test_value")
            .expect("Failed to set metadata");
        let value = storage
            .get_sync_metadata("test_key")
            .expect("Failed to get metadata");
        assert_eq!(value, Some("test_value".to_string()));

        storage
            .set_sync_metadata("test_key", "updated_value")
            .expect("Failed to update metadata");
        let value = storage
            .get_sync_metadata("test_key")
            .expect("Failed to get metadata");
        assert_eq!(value, Some("updated_value".to_string()));

        let deleted = storage
            .delete_sync_metadata("test_key")
            .expect("Failed to delete metadata");
        assert!(deleted);
        let value = storage
            .get_sync_metadata("test_key")
            .expect("Failed to get metadata");
        assert_eq!(value, None);

        // 删除不存在的键
        let deleted = storage
            .delete_sync_metadata("nonexistent_key")
            .expect("Failed to delete");
        assert!(!deleted);
    }

    #[test]
    fn test_has_pending_sync_empty() {
        let storage = Storage::in_memory().expect("Failed to create in-memory storage");

        let has_pending = storage
            .has_pending_sync()
            .expect("Failed to check pending sync");
        assert!(!has_pending);
    }

    #[test]
    fn test_has_pending_sync_with_data() {
        let storage = Storage::in_memory().expect("Failed to create in-memory storage");

        storage
            .action_queue()
            .enqueue("review", r#"{"cardId":"card-1","quality":4}"#)
            .expect("Enqueue should succeed");

        let has_pending = storage
            .has_pending_sync()
            .expect("Failed to check pending sync");
        assert!(has_pending);
    }

    #[test]
    fn test_validation_error_from_schedule_error() {
        let err: StorageError = ScheduleError::QualityOutOfRange(9).into();
        assert!(matches!(err, StorageError::Validation(_)));
    }
}

//! 离线动作队列数据库操作模块
//!
//! 提供持久化动作队列的完整数据库操作支持，包括：
//! - 入队操作 (enqueue)
//! - 可重试项查询 (list_retryable)
//! - 状态管理 (mark_syncing/mark_succeeded/mark_failed/mark_conflict)
//! - 冲突的外部处置 (discard/requeue)
//! - 队列统计 (stats)
//!
//! 入队即落盘：enqueue 返回前完成同步写入，进程崩溃后队列内容仍在。
//! 幂等键 action_id 不在本层去重，由同步协调器与云端共同保证。

use rusqlite::{params, Connection};
use std::sync::{Arc, Mutex};

use chrono::Utc;

use crate::storage::models::{format_datetime, ActionStatus, PendingAction};
use crate::storage::{StorageError, StorageResult};

/// 队列统计信息
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// 待上行数量
    pub pending: i64,
    /// 处理中数量
    pub syncing: i64,
    /// 失败待重试数量
    pub failed: i64,
    /// 冲突数量
    pub conflict: i64,
}

/// 离线动作队列仓储
///
/// 提供对动作队列的所有数据库操作。每个操作独立持锁，
/// 因此入队可以与进行中的排空周期安全交错。
pub struct ActionQueueRepository {
    conn: Arc<Mutex<Connection>>,
}

impl ActionQueueRepository {
    /// 创建新的队列仓储
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    // ========== 入队操作 ==========

    /// 将一条动作入队，返回客户端生成的幂等键
    ///
    /// payload 必须是合法 JSON；校验失败同步拒绝，不落库。
    /// 存储失败向调用方传播，不得吞掉。
    ///
    /// # Arguments
    /// * `kind` - 动作类型 (如 review/quiz)
    /// * `payload` - 动作数据 (JSON 格式)
    ///
    /// # Returns
    /// * `StorageResult<String>` - 新队列项的 action_id
    pub fn enqueue(&self, kind: &str, payload: &str) -> StorageResult<String> {
        serde_json::from_str::<serde_json::Value>(payload)
            .map_err(|e| StorageError::Validation(format!("payload 不是合法 JSON: {}", e)))?;

        let action = PendingAction::new(kind, payload);
        self.enqueue_action(&action)
    }

    /// 入队一条带既有幂等键的动作
    ///
    /// 同一 action_id 允许重复入队：队列不做去重，
    /// 重复投递由云端按幂等键拒绝。
    pub fn enqueue_action(&self, action: &PendingAction) -> StorageResult<String> {
        let conn = self.get_connection()?;
        let seq = action.enqueue(&conn)?;

        log::debug!(
            "动作入队: action_id={}, kind={}, seq={}",
            action.action_id,
            action.kind,
            seq
        );

        Ok(action.action_id.clone())
    }

    // ========== 查询操作 ==========

    /// 查询所有可重试的队列项 (pending/failed)，按入队顺序返回
    pub fn list_retryable(&self) -> StorageResult<Vec<PendingAction>> {
        self.list_by_status(&[ActionStatus::Pending, ActionStatus::Failed])
    }

    /// 查询指定状态的队列项，按入队顺序返回
    ///
    /// 统一的"按谓词取全部行"原语，list_retryable 等均基于它实现。
    pub fn list_by_status(&self, statuses: &[ActionStatus]) -> StorageResult<Vec<PendingAction>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }

        let conn = self.get_connection()?;

        let placeholders: Vec<String> = (1..=statuses.len()).map(|i| format!("?{}", i)).collect();
        let sql = format!(
            "SELECT * FROM action_queue WHERE status IN ({}) ORDER BY seq ASC",
            placeholders.join(", ")
        );

        let status_strs: Vec<&'static str> = statuses.iter().map(|s| s.as_str()).collect();
        let params_vec: Vec<&dyn rusqlite::ToSql> = status_strs
            .iter()
            .map(|s| s as &dyn rusqlite::ToSql)
            .collect();

        let mut stmt = conn.prepare(&sql)?;
        let actions: Vec<PendingAction> = stmt
            .query_map(params_vec.as_slice(), |row| PendingAction::from_row(row))?
            .filter_map(|r| r.ok())
            .collect();

        Ok(actions)
    }

    /// 按幂等键查询队列项（同键多行时返回最早入队的一行）
    pub fn get(&self, action_id: &str) -> StorageResult<Option<PendingAction>> {
        use rusqlite::OptionalExtension;

        let conn = self.get_connection()?;

        let action = conn
            .query_row(
                "SELECT * FROM action_queue WHERE action_id = ?1 ORDER BY seq ASC LIMIT 1",
                [action_id],
                |row| PendingAction::from_row(row),
            )
            .optional()?;

        Ok(action)
    }

    // ========== 状态管理 ==========

    /// 标记为处理中
    pub fn mark_syncing(&self, action_id: &str) -> StorageResult<()> {
        self.update_status(action_id, ActionStatus::Syncing, None)
    }

    /// 标记为失败（保留行，等待下一轮重试）
    pub fn mark_failed(&self, action_id: &str, error: &str) -> StorageResult<()> {
        self.update_status(action_id, ActionStatus::Failed, Some(error))
    }

    /// 标记为冲突（保留行，排空周期不再拾取）
    pub fn mark_conflict(&self, action_id: &str) -> StorageResult<()> {
        self.update_status(action_id, ActionStatus::Conflict, None)
    }

    /// 标记为成功：删除队列行
    pub fn mark_succeeded(&self, action_id: &str) -> StorageResult<()> {
        let conn = self.get_connection()?;

        let affected = conn.execute(
            "DELETE FROM action_queue WHERE action_id = ?1",
            [action_id],
        )?;

        if affected == 0 {
            return Err(StorageError::NotFound(format!(
                "队列项不存在: {}",
                action_id
            )));
        }

        Ok(())
    }

    /// 原子状态转移（按幂等键）
    fn update_status(
        &self,
        action_id: &str,
        status: ActionStatus,
        error: Option<&str>,
    ) -> StorageResult<()> {
        let conn = self.get_connection()?;

        let affected = conn.execute(
            r#"
            UPDATE action_queue
            SET status = ?2,
                last_error = COALESCE(?3, last_error),
                updated_at = ?4
            WHERE action_id = ?1
            "#,
            params![
                action_id,
                status.as_str(),
                error,
                format_datetime(Utc::now())
            ],
        )?;

        if affected == 0 {
            return Err(StorageError::NotFound(format!(
                "队列项不存在: {}",
                action_id
            )));
        }

        Ok(())
    }

    // ========== 冲突的外部处置 ==========

    /// 丢弃一条队列项（冲突的外部解决方式之一）
    pub fn discard(&self, action_id: &str) -> StorageResult<()> {
        self.mark_succeeded(action_id)
    }

    /// 将一条队列项重新置为待上行（冲突的外部解决方式之二）
    pub fn requeue(&self, action_id: &str) -> StorageResult<()> {
        self.update_status(action_id, ActionStatus::Pending, None)
    }

    // ========== 统计操作 ==========

    /// 获取待上行项目数量
    pub fn pending_count(&self) -> StorageResult<i64> {
        self.count_by_status(ActionStatus::Pending)
    }

    /// 获取失败项目数量
    pub fn failed_count(&self) -> StorageResult<i64> {
        self.count_by_status(ActionStatus::Failed)
    }

    /// 获取冲突项目数量
    pub fn conflict_count(&self) -> StorageResult<i64> {
        self.count_by_status(ActionStatus::Conflict)
    }

    fn count_by_status(&self, status: ActionStatus) -> StorageResult<i64> {
        let conn = self.get_connection()?;

        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM action_queue WHERE status = ?1",
            [status.as_str()],
            |row| row.get(0),
        )?;

        Ok(count)
    }

    /// 获取队列统计信息
    pub fn stats(&self) -> StorageResult<QueueStats> {
        let conn = self.get_connection()?;

        let mut stats = QueueStats::default();
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM action_queue GROUP BY status")?;

        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        for row in rows {
            let (status, count) = row?;
            match ActionStatus::from_str(&status) {
                Some(ActionStatus::Pending) => stats.pending = count,
                Some(ActionStatus::Syncing) => stats.syncing = count,
                Some(ActionStatus::Failed) => stats.failed = count,
                Some(ActionStatus::Conflict) => stats.conflict = count,
                _ => {}
            }
        }

        Ok(stats)
    }

    // ========== 辅助方法 ==========

    /// 获取数据库连接
    fn get_connection(&self) -> StorageResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StorageError::LockError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;

    fn setup_queue() -> (Storage, ActionQueueRepository) {
        let storage = Storage::in_memory().expect("Failed to create in-memory storage");
        let queue = storage.action_queue();
        (storage, queue)
    }

    #[test]
    fn test_enqueue_and_list_retryable() {
        let (_storage, queue) = setup_queue();

        let id = queue
            .enqueue("review", r#"{"cardId":"card-1","quality":4}"#)
            .expect("Enqueue should succeed");
        assert!(!id.is_empty());

        let retryable = queue.list_retryable().expect("List should succeed");
        assert_eq!(retryable.len(), 1);
        assert_eq!(retryable[0].action_id, id);
        assert_eq!(retryable[0].status, ActionStatus::Pending);
    }

    #[test]
    fn test_enqueue_rejects_malformed_payload() {
        let (_storage, queue) = setup_queue();

        let result = queue.enqueue("review", "not json at all");
        assert!(matches!(result, Err(StorageError::Validation(_))));

        // 被拒绝的动作不得落库
        let retryable = queue.list_retryable().expect("List should succeed");
        assert!(retryable.is_empty());
    }

    #[test]
    fn test_list_retryable_fifo_order() {
        let (_storage, queue) = setup_queue();

        let id1 = queue.enqueue("review", r#"{"n":1}"#).unwrap();
        let id2 = queue.enqueue("quiz", r#"{"n":2}"#).unwrap();
        let id3 = queue.enqueue("review", r#"{"n":3}"#).unwrap();

        let retryable = queue.list_retryable().expect("List should succeed");
        let ids: Vec<&str> = retryable.iter().map(|a| a.action_id.as_str()).collect();
        assert_eq!(ids, vec![id1.as_str(), id2.as_str(), id3.as_str()]);
    }

    #[test]
    fn test_failed_actions_are_retryable() {
        let (_storage, queue) = setup_queue();

        let id1 = queue.enqueue("review", r#"{"n":1}"#).unwrap();
        let id2 = queue.enqueue("review", r#"{"n":2}"#).unwrap();

        queue.mark_failed(&id1, "connection refused").unwrap();

        let retryable = queue.list_retryable().expect("List should succeed");
        assert_eq!(retryable.len(), 2);
        // FIFO 仍按入队顺序，与失败与否无关
        assert_eq!(retryable[0].action_id, id1);
        assert_eq!(retryable[0].status, ActionStatus::Failed);
        assert_eq!(
            retryable[0].last_error.as_deref(),
            Some("connection refused")
        );
        assert_eq!(retryable[1].action_id, id2);
    }

    #[test]
    fn test_conflict_not_retryable() {
        let (_storage, queue) = setup_queue();

        let id = queue.enqueue("review", r#"{"n":1}"#).unwrap();
        queue.mark_conflict(&id).unwrap();

        let retryable = queue.list_retryable().expect("List should succeed");
        assert!(retryable.is_empty());

        // 冲突行保留在库中等待外部处置
        let conflicts = queue.list_by_status(&[ActionStatus::Conflict]).unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].action_id, id);
    }

    #[test]
    fn test_mark_succeeded_deletes_row() {
        let (_storage, queue) = setup_queue();

        let id = queue.enqueue("review", r#"{"n":1}"#).unwrap();
        queue.mark_succeeded(&id).expect("Mark should succeed");

        assert!(queue.get(&id).unwrap().is_none());
        assert_eq!(queue.pending_count().unwrap(), 0);
    }

    #[test]
    fn test_mark_unknown_id_is_not_found() {
        let (_storage, queue) = setup_queue();

        assert!(matches!(
            queue.mark_syncing("no-such-id"),
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            queue.mark_succeeded("no-such-id"),
            Err(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn test_status_transitions() {
        let (_storage, queue) = setup_queue();

        let id = queue.enqueue("review", r#"{"n":1}"#).unwrap();

        queue.mark_syncing(&id).unwrap();
        assert_eq!(queue.get(&id).unwrap().unwrap().status, ActionStatus::Syncing);

        queue.mark_failed(&id, "timeout").unwrap();
        assert_eq!(queue.get(&id).unwrap().unwrap().status, ActionStatus::Failed);

        queue.mark_conflict(&id).unwrap();
        assert_eq!(
            queue.get(&id).unwrap().unwrap().status,
            ActionStatus::Conflict
        );
    }

    #[test]
    fn test_duplicate_action_id_coexists() {
        let (_storage, queue) = setup_queue();

        let action = PendingAction::new("review", r#"{"n":1}"#);
        queue.enqueue_action(&action).unwrap();
        queue.enqueue_action(&action).unwrap();

        // 队列不去重；两行同键共存
        let retryable = queue.list_retryable().unwrap();
        assert_eq!(retryable.len(), 2);
        assert_eq!(retryable[0].action_id, retryable[1].action_id);

        // 按键删除会同时清掉两行
        queue.mark_succeeded(&action.action_id).unwrap();
        assert!(queue.list_retryable().unwrap().is_empty());
    }

    #[test]
    fn test_requeue_conflict() {
        let (_storage, queue) = setup_queue();

        let id = queue.enqueue("review", r#"{"n":1}"#).unwrap();
        queue.mark_conflict(&id).unwrap();
        assert!(queue.list_retryable().unwrap().is_empty());

        queue.requeue(&id).expect("Requeue should succeed");

        let retryable = queue.list_retryable().unwrap();
        assert_eq!(retryable.len(), 1);
        assert_eq!(retryable[0].status, ActionStatus::Pending);
    }

    #[test]
    fn test_discard_conflict() {
        let (_storage, queue) = setup_queue();

        let id = queue.enqueue("review", r#"{"n":1}"#).unwrap();
        queue.mark_conflict(&id).unwrap();

        queue.discard(&id).expect("Discard should succeed");
        assert!(queue.get(&id).unwrap().is_none());
        assert_eq!(queue.conflict_count().unwrap(), 0);
    }

    #[test]
    fn test_stats() {
        let (_storage, queue) = setup_queue();

        let _p = queue.enqueue("review", r#"{"n":1}"#).unwrap();
        let f = queue.enqueue("review", r#"{"n":2}"#).unwrap();
        let c = queue.enqueue("quiz", r#"{"n":3}"#).unwrap();
        let s = queue.enqueue("quiz", r#"{"n":4}"#).unwrap();

        queue.mark_failed(&f, "err").unwrap();
        queue.mark_conflict(&c).unwrap();
        queue.mark_syncing(&s).unwrap();

        let stats = queue.stats().expect("Stats should succeed");
        assert_eq!(
            stats,
            QueueStats {
                pending: 1,
                syncing: 1,
                failed: 1,
                conflict: 1,
            }
        );
    }

    #[test]
    fn test_queue_survives_reopen() {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let db_path = dir.path().join("fuxi.db");

        let id = {
            let storage = Storage::new(&db_path).expect("Failed to create storage");
            storage
                .action_queue()
                .enqueue("review", r#"{"cardId":"card-1","quality":4}"#)
                .expect("Enqueue should succeed")
        };

        // 模拟进程重启：重新打开同一数据库文件
        let storage = Storage::new(&db_path).expect("Failed to reopen storage");
        let retryable = storage
            .action_queue()
            .list_retryable()
            .expect("List should succeed");

        assert_eq!(retryable.len(), 1);
        assert_eq!(retryable[0].action_id, id);
        assert_eq!(retryable[0].status, ActionStatus::Pending);
    }
}

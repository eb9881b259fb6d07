//! 复习状态数据库操作模块
//!
//! 提供 ReviewState 的 CRUD、到期卡片查询 (due set) 与复习落账。

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

use crate::scheduler::compute_next_review;
use crate::storage::models::{format_datetime, ReviewState};
use crate::storage::{StorageError, StorageResult};

// ============================================================
// ReviewStats - 复习统计数据
// ============================================================

/// 复习统计数据
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReviewStats {
    /// 总卡片数
    pub total_cards: i64,
    /// 到期待复习数
    pub due: i64,
    /// 平均易度因子
    pub avg_efactor: f64,
}

// ============================================================
// ReviewStateRepository - 复习状态仓储
// ============================================================

/// 复习状态仓储
///
/// 提供 ReviewState 的数据库操作方法
pub struct ReviewStateRepository {
    conn: Arc<Mutex<Connection>>,
}

impl ReviewStateRepository {
    /// 创建新的仓储实例
    pub fn new(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    // ========== 基本 CRUD 操作 ==========

    /// 获取单个复习状态
    pub fn get_state(&self, user_id: &str, card_id: &str) -> StorageResult<Option<ReviewState>> {
        let conn = self.get_connection()?;

        let state = conn
            .query_row(
                "SELECT * FROM review_state WHERE user_id = ?1 AND card_id = ?2",
                params![user_id, card_id],
                |row| ReviewState::from_row(row),
            )
            .optional()?;

        Ok(state)
    }

    /// 获取用户的所有复习状态
    pub fn get_states_by_user(&self, user_id: &str) -> StorageResult<Vec<ReviewState>> {
        let conn = self.get_connection()?;

        let mut stmt =
            conn.prepare("SELECT * FROM review_state WHERE user_id = ?1 ORDER BY card_id ASC")?;

        let states: Vec<ReviewState> = stmt
            .query_map(params![user_id], |row| ReviewState::from_row(row))?
            .filter_map(|r| r.ok())
            .collect();

        Ok(states)
    }

    /// 保存复习状态 (upsert)
    pub fn save_state(&self, state: &ReviewState) -> StorageResult<()> {
        let conn = self.get_connection()?;
        state.upsert(&conn)
    }

    // ========== 复习落账 ==========

    /// 记录一次复习并持久化新状态
    ///
    /// 首次复习时创建状态 (upsert 语义)，之后原地更新。
    /// quality 超出 0..=5 时同步拒绝，不产生任何写入。
    ///
    /// # Arguments
    /// * `user_id` - 用户 ID
    /// * `card_id` - 卡片 ID
    /// * `quality` - 回忆质量评分 (0..=5)
    /// * `now` - 当前时间（由调用方注入）
    ///
    /// # Returns
    /// * `StorageResult<ReviewState>` - 更新后的复习状态
    pub fn record_review(
        &self,
        user_id: &str,
        card_id: &str,
        quality: i32,
        now: DateTime<Utc>,
    ) -> StorageResult<ReviewState> {
        let mut state = self
            .get_state(user_id, card_id)?
            .unwrap_or_else(|| ReviewState::new(user_id, card_id, now));

        let next = compute_next_review(&state.scheduler_state(), quality, now)?;
        state.apply(&next, now);

        self.save_state(&state)?;

        log::debug!(
            "复习落账: user={}, card={}, quality={}, 下次复习 {}",
            user_id,
            card_id,
            quality,
            next.next_review_at
        );

        Ok(state)
    }

    // ========== 到期查询 ==========

    /// 获取到期卡片 ID 序列
    ///
    /// 到期定义: next_review_at <= as_of。
    /// 按 next_review_at 升序返回，相同到期时间按 card_id 升序，
    /// 保证重复调用结果一致。只读，无副作用。
    pub fn due_cards(&self, user_id: &str, as_of: DateTime<Utc>) -> StorageResult<Vec<String>> {
        let conn = self.get_connection()?;
        let as_of = format_datetime(as_of);

        let mut stmt = conn.prepare(
            r#"
            SELECT card_id FROM review_state
            WHERE user_id = ?1
                AND next_review_at IS NOT NULL
                AND next_review_at <= ?2
            ORDER BY next_review_at ASC, card_id ASC
            "#,
        )?;

        let cards: Vec<String> = stmt
            .query_map(params![user_id, as_of], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();

        Ok(cards)
    }

    /// 获取到期卡片数量
    pub fn due_count(&self, user_id: &str, as_of: DateTime<Utc>) -> StorageResult<i64> {
        let conn = self.get_connection()?;
        let as_of = format_datetime(as_of);

        let count: i64 = conn.query_row(
            r#"
            SELECT COUNT(*) FROM review_state
            WHERE user_id = ?1
                AND next_review_at IS NOT NULL
                AND next_review_at <= ?2
            "#,
            params![user_id, as_of],
            |row| row.get(0),
        )?;

        Ok(count)
    }

    /// 获取复习统计信息
    pub fn stats(&self, user_id: &str, as_of: DateTime<Utc>) -> StorageResult<ReviewStats> {
        let due = self.due_count(user_id, as_of)?;

        let conn = self.get_connection()?;

        let (total_cards, avg_efactor): (i64, f64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(AVG(efactor), 0.0) FROM review_state WHERE user_id = ?1",
            params![user_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        Ok(ReviewStats {
            total_cards,
            due,
            avg_efactor,
        })
    }

    // ========== 辅助方法 ==========

    /// 获取数据库连接
    fn get_connection(&self) -> StorageResult<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| StorageError::LockError(e.to_string()))
    }
}

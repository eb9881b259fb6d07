//! 数据模型定义
//!
//! 定义 SQLite 存储所需的数据结构，以及与数据库交互的方法。

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Result as SqliteResult, Row};
use serde::{Deserialize, Serialize};

use crate::scheduler::{NextReview, SchedulerState};
use crate::storage::StorageResult;

// ============================================================
// ReviewState - 卡片复习状态
// ============================================================

/// 卡片复习状态
///
/// 每个 (user_id, card_id) 一行，首次复习时创建，之后原地更新，
/// 卡片存在期间不删除。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewState {
    /// 用户 ID
    pub user_id: String,
    /// 卡片 ID
    pub card_id: String,
    /// 易度因子 (>= 1.3)
    pub efactor: f64,
    /// 复习间隔（天）
    pub interval_days: i64,
    /// 连续成功复习次数
    pub repetition: i32,
    /// 最后复习时间
    pub last_reviewed_at: Option<DateTime<Utc>>,
    /// 下次复习时间 (= last_reviewed_at + interval_days 天)
    pub next_review_at: Option<DateTime<Utc>>,
    /// 创建时间
    pub created_at: DateTime<Utc>,
    /// 更新时间
    pub updated_at: DateTime<Utc>,
}

impl ReviewState {
    /// 创建新的复习状态（尚未复习过的卡片）
    pub fn new(user_id: &str, card_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            user_id: user_id.to_string(),
            card_id: card_id.to_string(),
            efactor: 2.5,
            interval_days: 0,
            repetition: 0,
            last_reviewed_at: None,
            next_review_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 转换为调度引擎输入
    pub fn scheduler_state(&self) -> SchedulerState {
        SchedulerState {
            efactor: self.efactor,
            interval_days: self.interval_days,
            repetition: self.repetition,
        }
    }

    /// 将一次调度结果写回状态
    pub fn apply(&mut self, next: &NextReview, now: DateTime<Utc>) {
        self.efactor = next.efactor;
        self.interval_days = next.interval_days;
        self.repetition = next.repetition;
        self.last_reviewed_at = Some(now);
        self.next_review_at = Some(next.next_review_at);
        self.updated_at = now;
    }

    /// 从数据库行解析
    pub fn from_row(row: &Row) -> SqliteResult<Self> {
        Ok(Self {
            user_id: row.get("user_id")?,
            card_id: row.get("card_id")?,
            efactor: row.get("efactor")?,
            interval_days: row.get("interval_days")?,
            repetition: row.get("repetition")?,
            last_reviewed_at: row
                .get::<_, Option<String>>("last_reviewed_at")?
                .map(parse_datetime),
            next_review_at: row
                .get::<_, Option<String>>("next_review_at")?
                .map(parse_datetime),
            created_at: parse_datetime(row.get::<_, String>("created_at")?),
            updated_at: parse_datetime(row.get::<_, String>("updated_at")?),
        })
    }

    /// 插入或更新 (upsert)
    pub fn upsert(&self, conn: &Connection) -> StorageResult<()> {
        conn.execute(
            r#"
            INSERT INTO review_state (
                user_id, card_id, efactor, interval_days, repetition,
                last_reviewed_at, next_review_at, created_at, updated_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9
            )
            ON CONFLICT(user_id, card_id) DO UPDATE SET
                efactor = excluded.efactor,
                interval_days = excluded.interval_days,
                repetition = excluded.repetition,
                last_reviewed_at = excluded.last_reviewed_at,
                next_review_at = excluded.next_review_at,
                updated_at = excluded.updated_at
            "#,
            params![
                self.user_id,
                self.card_id,
                self.efactor,
                self.interval_days,
                self.repetition,
                self.last_reviewed_at.map(format_datetime),
                self.next_review_at.map(format_datetime),
                format_datetime(self.created_at),
                format_datetime(self.updated_at),
            ],
        )?;
        Ok(())
    }
}

// ============================================================
// PendingAction - 离线队列项
// ============================================================

/// 队列项状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    /// 待上行
    Pending,
    /// 排空周期处理中
    Syncing,
    /// 已成功（行随即删除，仅在内存中出现）
    Succeeded,
    /// 瞬时失败，等待重试
    Failed,
    /// 版本冲突，不再自动重试
    Conflict,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Conflict => "conflict",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "syncing" => Some(Self::Syncing),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "conflict" => Some(Self::Conflict),
            _ => None,
        }
    }
}

/// 离线队列项：一条待上行的复习/测验提交
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAction {
    /// FIFO 顺序号（由数据库生成，0 表示尚未入库）
    pub seq: i64,
    /// 客户端生成的幂等键 (UUID)，随请求上行
    pub action_id: String,
    /// 动作类型（对队列不透明，由协调器/云端解释）
    pub kind: String,
    /// 动作数据 (JSON，对队列不透明)
    pub payload: String,
    /// 状态
    pub status: ActionStatus,
    /// 最后一次错误信息
    pub last_error: Option<String>,
    /// 创建时间
    pub created_at: DateTime<Utc>,
    /// 更新时间
    pub updated_at: DateTime<Utc>,
}

impl PendingAction {
    /// 创建新的队列项
    pub fn new(kind: &str, payload: &str) -> Self {
        let now = Utc::now();
        Self {
            seq: 0, // 由数据库自动生成
            action_id: uuid::Uuid::new_v4().to_string(),
            kind: kind.to_string(),
            payload: payload.to_string(),
            status: ActionStatus::Pending,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// 从数据库行解析
    pub fn from_row(row: &Row) -> SqliteResult<Self> {
        let status_str: String = row.get("status")?;
        let status = ActionStatus::from_str(&status_str).unwrap_or(ActionStatus::Pending);

        Ok(Self {
            seq: row.get("seq")?,
            action_id: row.get("action_id")?,
            kind: row.get("kind")?,
            payload: row.get("payload")?,
            status,
            last_error: row.get("last_error")?,
            created_at: parse_datetime(row.get::<_, String>("created_at")?),
            updated_at: parse_datetime(row.get::<_, String>("updated_at")?),
        })
    }

    /// 入队
    pub fn enqueue(&self, conn: &Connection) -> StorageResult<i64> {
        conn.execute(
            r#"
            INSERT INTO action_queue (
                action_id, kind, payload, status, last_error, created_at, updated_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7
            )
            "#,
            params![
                self.action_id,
                self.kind,
                self.payload,
                self.status.as_str(),
                self.last_error,
                format_datetime(self.created_at),
                format_datetime(self.updated_at),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }
}

// ============================================================
// 辅助函数
// ============================================================

/// 解析日期时间字符串
pub(crate) fn parse_datetime(s: String) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(&s) {
        return dt.with_timezone(&Utc);
    }

    if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(&s, "%Y-%m-%d %H:%M:%S") {
        return DateTime::from_naive_utc_and_offset(dt, Utc);
    }

    Utc::now()
}

/// 格式化日期时间为字符串
///
/// 秒级精度、可按字典序比较，review_state 的到期查询依赖这一点。
pub(crate) fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

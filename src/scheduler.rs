use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const MIN_EFACTOR: f64 = 1.3;
const SECOND_INTERVAL_DAYS: i64 = 6;
const PASS_THRESHOLD: i32 = 3;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("质量评分 {0} 超出范围 0..=5")]
    QualityOutOfRange(i32),
}

/// SM-2 调度输入状态
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SchedulerState {
    pub efactor: f64,
    pub interval_days: i64,
    pub repetition: i32,
}

impl Default for SchedulerState {
    fn default() -> Self {
        Self {
            efactor: 2.5,
            interval_days: 0,
            repetition: 0,
        }
    }
}

/// 一次复习的调度结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NextReview {
    pub efactor: f64,
    pub interval_days: i64,
    pub repetition: i32,
    pub next_review_at: DateTime<Utc>,
}

/// SM-2 变体：根据当前状态与回忆质量计算下次复习
///
/// 纯函数，无副作用；`now` 由调用方注入以便测试。
pub fn compute_next_review(
    state: &SchedulerState,
    quality: i32,
    now: DateTime<Utc>,
) -> Result<NextReview, ScheduleError> {
    if !(0..=5).contains(&quality) {
        return Err(ScheduleError::QualityOutOfRange(quality));
    }

    let (interval_days, repetition) = if quality < PASS_THRESHOLD {
        (1, 0)
    } else {
        let interval = match state.repetition {
            0 => 1,
            1 => SECOND_INTERVAL_DAYS,
            // f64::round 即四舍五入（远离零）
            _ => (state.interval_days as f64 * state.efactor).round() as i64,
        };
        (interval, state.repetition + 1)
    };

    let spread = (5 - quality) as f64;
    let efactor = (state.efactor + (0.1 - spread * (0.08 + spread * 0.02))).max(MIN_EFACTOR);
    let interval_days = interval_days.max(1);

    Ok(NextReview {
        efactor,
        interval_days,
        repetition,
        next_review_at: now + Duration::days(interval_days),
    })
}

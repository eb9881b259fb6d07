//! 云端存储客户端
//!
//! 定义同步协调器使用的 RemoteStore 抽象与基于 HTTP 的实现。
//! 云端按 action_id 幂等：同一键的重复投递只生效一次。

use std::future::Future;

use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::storage::models::PendingAction;

/// 云端调用错误
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// 版本/状态冲突，不自动重试
    #[error("版本冲突: {0}")]
    Conflict(String),

    /// 云端校验拒绝（与瞬时失败同样进入重试，不单独区分）
    #[error("云端拒绝: {0}")]
    Rejected(String),

    /// 瞬时失败：超时、连接错误、服务端 5xx
    #[error("瞬时失败: {0}")]
    Transient(String),
}

impl RemoteError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// 云端存储抽象
///
/// 排空周期对每条动作调用一次 `apply`；实现方须按 action_id 幂等。
pub trait RemoteStore: Send + Sync {
    fn apply(
        &self,
        action: &PendingAction,
    ) -> impl Future<Output = Result<(), RemoteError>> + Send;
}

// ============================================================
// HttpRemoteStore - 基于 reqwest 的云端客户端
// ============================================================

/// 通用同步请求体
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SyncActionRequest<'a> {
    id: &'a str,
    kind: &'a str,
    payload: serde_json::Value,
}

/// 复习上行请求体
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReviewUpdateRequest<'a> {
    user_id: &'a str,
    card_id: &'a str,
    quality: i32,
}

/// 云端返回的复习状态
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteReviewState {
    pub next_review_at: DateTime<Utc>,
    pub efactor: f64,
    pub interval: i64,
}

/// 基于 HTTP 的云端存储客户端
pub struct HttpRemoteStore {
    client: Client,
    api_base_url: String,
    auth_token: Option<String>,
}

impl HttpRemoteStore {
    /// 创建新的云端客户端
    ///
    /// `timeout_secs` 限制单次调用时长，挂起的调用以瞬时失败收尾。
    pub fn new(api_base_url: String, timeout_secs: u64) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            api_base_url,
            auth_token: None,
        }
    }

    /// 设置认证令牌
    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    fn request(&self, url: &str, body: &impl Serialize) -> reqwest::RequestBuilder {
        let mut req = self.client.post(url).json(body);
        if let Some(token) = &self.auth_token {
            req = req.bearer_auth(token);
        }
        req
    }

    /// 按 HTTP 状态码归类响应
    async fn classify(response: reqwest::Response) -> Result<reqwest::Response, RemoteError> {
        let status = response.status();

        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        match status {
            StatusCode::CONFLICT => Err(RemoteError::Conflict(body)),
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => {
                Err(RemoteError::Rejected(body))
            }
            _ => Err(RemoteError::Transient(format!("HTTP {}: {}", status, body))),
        }
    }

    /// 复习上行调用
    ///
    /// 请求 `{userId, cardId, quality}`，返回云端计算的复习状态。
    pub async fn push_review(
        &self,
        user_id: &str,
        card_id: &str,
        quality: i32,
    ) -> Result<RemoteReviewState, RemoteError> {
        let url = format!("{}/api/reviews", self.api_base_url);
        let body = ReviewUpdateRequest {
            user_id,
            card_id,
            quality,
        };

        let response = self
            .request(&url, &body)
            .send()
            .await
            .map_err(|e| RemoteError::Transient(e.to_string()))?;

        let response = Self::classify(response).await?;

        response
            .json::<RemoteReviewState>()
            .await
            .map_err(|e| RemoteError::Transient(format!("响应解析失败: {}", e)))
    }
}

impl RemoteStore for HttpRemoteStore {
    async fn apply(&self, action: &PendingAction) -> Result<(), RemoteError> {
        let payload: serde_json::Value = serde_json::from_str(&action.payload)
            .map_err(|e| RemoteError::Rejected(format!("payload 不是合法 JSON: {}", e)))?;

        let url = format!("{}/api/sync/actions", self.api_base_url);
        let body = SyncActionRequest {
            id: &action.action_id,
            kind: &action.kind,
            payload,
        };

        let response = self
            .request(&url, &body)
            .send()
            .await
            .map_err(|e| RemoteError::Transient(e.to_string()))?;

        Self::classify(response).await?;
        Ok(())
    }
}

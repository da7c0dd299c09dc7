//! # 外部協調者
//!
//! ゲートはファームウェア完全性監視・リスク評価・多要素認証をトレイト経由でのみ利用する。
//! 協調者の失敗は呼び出し側（ゲート）でフェイルクローズな判定に変換される。

mod integrity;
mod mfa;
mod risk;

use std::time::Duration;

use astra_types::{IntegrityStatus, RiskAssessment, RiskFeatures};
use async_trait::async_trait;

pub use integrity::FirmwareIntegrityMonitor;
pub use mfa::{OperatorClearance, StaticMfaVerifier};
pub use risk::{HttpRiskScorer, ThresholdRiskScorer, DEFAULT_RISK_THRESHOLD};

/// 協調者呼び出しのエラー型
#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    /// 協調者に到達できない
    #[error("協調者に到達できません: {0}")]
    Unavailable(String),
    /// 協調者の応答が不正
    #[error("協調者の応答が不正です: {0}")]
    InvalidResponse(String),
    /// 呼び出しがタイムアウトした
    #[error("協調者の呼び出しがタイムアウトしました（{0:?}）")]
    Timeout(Duration),
}

/// ファームウェア完全性の監視。
#[async_trait]
pub trait IntegrityMonitor: Send + Sync {
    /// 現在の完全性状態。
    async fn status(&self) -> Result<IntegrityStatus, CollaboratorError>;
}

/// コンテキスト特徴量によるリスク評価。
#[async_trait]
pub trait RiskScorer: Send + Sync {
    /// 特徴量を評価し、判定とスコアを返す。
    async fn score(&self, features: &RiskFeatures) -> Result<RiskAssessment, CollaboratorError>;
}

/// 多要素認証。
#[async_trait]
pub trait MfaVerifier: Send + Sync {
    /// 操作者が多要素認証を通過したか。
    async fn authorize(&self, operator_id: &str) -> Result<bool, CollaboratorError>;
}

/// 協調者呼び出しを期限付きで待つ。期限切れは [`CollaboratorError::Timeout`]。
pub async fn with_timeout<T, F>(timeout: Duration, call: F) -> Result<T, CollaboratorError>
where
    F: std::future::Future<Output = Result<T, CollaboratorError>>,
{
    tokio::time::timeout(timeout, call)
        .await
        .map_err(|_| CollaboratorError::Timeout(timeout))?
}

//! 多要素認証と操作者クリアランス。

use std::collections::HashSet;

use async_trait::async_trait;

use super::{CollaboratorError, MfaVerifier};
use crate::gate::GateError;
use crate::now_millis;

/// 多要素認証を通過した操作者の証明。
///
/// [`OperatorClearance::obtain`] 以外では作成できないため、
/// クリアランスを要求するゲートには未認証の操作者が到達しない。
#[derive(Debug, Clone)]
pub struct OperatorClearance {
    operator_id: String,
    granted_at: u64,
}

impl OperatorClearance {
    /// 多要素認証を行い、通過した場合のみクリアランスを発行する。
    ///
    /// 協調者の失敗は拒否として扱う。
    pub async fn obtain(
        verifier: &dyn MfaVerifier,
        operator_id: &str,
    ) -> Result<Self, GateError> {
        match verifier.authorize(operator_id).await {
            Ok(true) => {
                tracing::info!(operator_id, "多要素認証に成功しました");
                Ok(Self {
                    operator_id: operator_id.to_string(),
                    granted_at: now_millis(),
                })
            }
            Ok(false) => {
                tracing::warn!(operator_id, "多要素認証に失敗しました");
                Err(GateError::OperatorDenied(operator_id.to_string()))
            }
            Err(e) => {
                tracing::error!(operator_id, error = %e, "多要素認証を完了できません");
                Err(GateError::MfaUnavailable(e))
            }
        }
    }

    /// 操作者ID。
    pub fn operator_id(&self) -> &str {
        &self.operator_id
    }

    /// 発行時刻（UNIXミリ秒）。
    pub fn granted_at(&self) -> u64 {
        self.granted_at
    }
}

/// 許可リスト方式の多要素認証（テスト・CLI用）。
#[derive(Debug, Default)]
pub struct StaticMfaVerifier {
    allowed: HashSet<String>,
}

impl StaticMfaVerifier {
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: allowed.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl MfaVerifier for StaticMfaVerifier {
    async fn authorize(&self, operator_id: &str) -> Result<bool, CollaboratorError> {
        Ok(self.allowed.contains(operator_id))
    }
}

//! ファームウェアイメージのSHA-256を信頼済みチェックサムと比較する完全性監視。

use std::path::PathBuf;

use astra_crypto::sha256;
use astra_types::IntegrityStatus;
use async_trait::async_trait;

use super::{CollaboratorError, IntegrityMonitor};

/// ファームウェア完全性監視。
pub struct FirmwareIntegrityMonitor {
    path: PathBuf,
    trusted: [u8; 32],
}

impl FirmwareIntegrityMonitor {
    /// 信頼済みチェックサム（SHA-256のhex）を指定して作成する。
    pub fn new(
        path: impl Into<PathBuf>,
        trusted_sha256_hex: &str,
    ) -> Result<Self, CollaboratorError> {
        let invalid = |reason: String| CollaboratorError::InvalidResponse(reason);
        let trusted: [u8; 32] = hex::decode(trusted_sha256_hex.trim())
            .map_err(|e| invalid(format!("チェックサムが不正です: {e}")))?
            .try_into()
            .map_err(|_| invalid("チェックサムは32バイトである必要があります".into()))?;
        Ok(Self {
            path: path.into(),
            trusted,
        })
    }

    /// 起動時点のファームウェアを信頼済みとして記録する。
    pub async fn capture(path: impl Into<PathBuf>) -> Result<Self, CollaboratorError> {
        let path = path.into();
        let image = tokio::fs::read(&path).await.map_err(|e| {
            CollaboratorError::Unavailable(format!("{}: {e}", path.display()))
        })?;
        let trusted = sha256(&image);
        tracing::info!(
            path = %path.display(),
            sha256 = %hex::encode(trusted),
            "ファームウェアの信頼済みチェックサムを記録しました"
        );
        Ok(Self { path, trusted })
    }

    /// 信頼済みチェックサム（hex）。
    pub fn trusted_checksum(&self) -> String {
        hex::encode(self.trusted)
    }
}

#[async_trait]
impl IntegrityMonitor for FirmwareIntegrityMonitor {
    async fn status(&self) -> Result<IntegrityStatus, CollaboratorError> {
        let image = match tokio::fs::read(&self.path).await {
            Ok(image) => image,
            Err(e) => {
                tracing::error!(
                    path = %self.path.display(),
                    error = %e,
                    "ファームウェアを読み取れません"
                );
                return Ok(IntegrityStatus::Error);
            }
        };
        if sha256(&image) == self.trusted {
            Ok(IntegrityStatus::Ok)
        } else {
            tracing::error!(
                path = %self.path.display(),
                "ファームウェアのチェックサムが一致しません"
            );
            Ok(IntegrityStatus::Corrupted)
        }
    }
}

//! # セキュリティレポート
//!
//! ファームウェア完全性の現在状態、登録済みの鍵ラベル、直近の監査イベントをまとめる。

use std::time::Duration;

use astra_types::{AuditRecord, IntegrityStatus, SecurityReport};

use crate::collaborators::{with_timeout, IntegrityMonitor};
use crate::keystore::{Keystore, KeystoreError};
use crate::now_millis;

/// セキュリティレポートを生成する。
///
/// 完全性監視が応答しない場合は `ERROR` として記録する。
/// `recent_events` は末尾から最大 `limit` 件を採用する。
pub async fn security_report(
    integrity: &dyn IntegrityMonitor,
    keystore: &Keystore,
    recent_events: &[AuditRecord],
    limit: usize,
    timeout: Duration,
) -> Result<SecurityReport, KeystoreError> {
    let integrity = match with_timeout(timeout, integrity.status()).await {
        Ok(status) => status,
        Err(e) => {
            tracing::error!(error = %e, "完全性監視が応答しません");
            IntegrityStatus::Error
        }
    };
    let start = recent_events.len().saturating_sub(limit);
    Ok(SecurityReport {
        generated_at: now_millis(),
        integrity,
        key_labels: keystore.labels()?,
        recent_events: recent_events[start..].to_vec(),
    })
}

//! # CLIエラー型

use astra_core::channel::ChannelError;
use astra_core::collaborators::CollaboratorError;
use astra_core::{GateError, KeystoreError};
use astra_crypto::CryptoError;

/// CLIのエラー型
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// 環境変数の値が不正
    #[error("環境変数 {name} が不正です: {reason}")]
    InvalidConfig { name: &'static str, reason: String },
    /// 引数が不正
    #[error("引数が不正です: {0}")]
    InvalidArgument(String),
    /// キーストアエラー
    #[error(transparent)]
    Keystore(#[from] KeystoreError),
    /// ゲートエラー
    #[error(transparent)]
    Gate(#[from] GateError),
    /// チャネルエラー
    #[error(transparent)]
    Channel(#[from] ChannelError),
    /// 協調者エラー
    #[error(transparent)]
    Collaborator(#[from] CollaboratorError),
    /// 暗号エラー
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    /// 入出力エラー
    #[error("入出力に失敗しました: {0}")]
    Io(#[from] std::io::Error),
    /// JSONエラー
    #[error("JSONの処理に失敗しました: {0}")]
    Json(#[from] serde_json::Error),
}

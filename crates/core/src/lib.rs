//! # Astra Core
//!
//! 重要コマンドの実行を複数の独立した検査の背後に置き、
//! 送信前に地上局とリモートエンドポイントの間で認証付きハイブリッドチャネルを確立する。
//!
//! ## 構成
//! - [`channel`]: 長期署名鍵とセッションKEM鍵を結び付けるチャネル確立プロトコル
//! - [`endpoint`]: チャネルの相手（リモートエンドポイント）の抽象とシミュレーション衛星
//! - [`keystore`] / [`authority`]: 永続化キーストアとコマンド署名機関
//! - [`collaborators`]: 完全性監視・リスク評価・多要素認証の外部協調者
//! - [`gate`]: 完全性 → リスク → チャネル → 署名 の順に評価するフェイルクローズな認可ゲート
//! - [`report`]: セキュリティレポートの生成

pub mod authority;
pub mod channel;
pub mod collaborators;
pub mod endpoint;
pub mod gate;
pub mod keystore;
pub mod report;

use base64::Engine;

pub use authority::{CommandRecord, CommandSigningAuthority};
pub use endpoint::{establish_channel, EndpointSession, RemoteEndpoint, SimulatedSatellite};
pub use gate::{
    AuthorizationDecision, AuthorizationRequest, CommandGate, GateCollaborators, GateConfig,
    GateError,
};
pub use keystore::{Keystore, KeystoreError, ProvisionOutcome};

fn b64() -> base64::engine::GeneralPurpose {
    base64::engine::general_purpose::STANDARD
}

/// Base64エンコード（標準アルファベット、パディングあり）。
pub fn b64_encode(data: &[u8]) -> String {
    b64().encode(data)
}

/// Base64デコード。
pub fn b64_decode(data: &str) -> Result<Vec<u8>, base64::DecodeError> {
    b64().decode(data)
}

/// 現在時刻（UNIXエポックからのミリ秒）。
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

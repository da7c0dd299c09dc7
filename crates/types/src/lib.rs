//! # Astra 共有型定義
//!
//! チャネル確立プロトコルのワイヤ形式、コマンド認可ゲートの監査記録、
//! キーストアの永続化形式をRust構造体として提供する。
//!
//! ## エンコーディング規則
//! - Base64: バイナリデータ（公開鍵、暗号文、署名等）
//! - タイムスタンプ: UNIXエポックからのミリ秒（u64）

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// チャネル確立プロトコル (ASTRA WAVE)
// ---------------------------------------------------------------------------

/// イニシエータ（衛星側）が送信する署名付き公開鍵バンドル。
///
/// 信頼されていない経路で送信される唯一の成果物であり、
/// `signature` は `signing_public_key` による
/// `SHA-256(domain || kem_public_key || classical_public_key)` への署名。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedPublicKeyBundle {
    /// 署名アルゴリズム識別子 ("ed25519" / "dilithium5")
    pub signing_algorithm: String,
    /// Base64エンコードされた長期署名用公開鍵
    pub signing_public_key: String,
    /// Base64エンコードされたセッション用KEM公開鍵（Kyber-1024）
    pub kem_public_key: String,
    /// Base64エンコードされたセッション用X25519公開鍵（32バイト）
    pub classical_public_key: String,
    /// Base64エンコードされた署名
    pub signature: String,
}

/// レスポンダ（地上局側）が返すカプセル化結果と鍵確認タグ。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelResponse {
    /// Base64エンコードされたKEM暗号文
    pub ciphertext: String,
    /// Base64エンコードされたレスポンダのX25519公開鍵（32バイト）
    pub classical_public_key: String,
    /// Base64エンコードされたレスポンダの鍵確認タグ（HMAC-SHA256）
    pub confirmation: String,
}

/// イニシエータが返す鍵確認タグ。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyConfirmation {
    /// Base64エンコードされたイニシエータの鍵確認タグ（HMAC-SHA256）
    pub confirmation: String,
}

/// リモートエンドポイントが提示するハンドシェイク開始メッセージ。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeOffer {
    /// エンドポイント側のセッション識別子（UUID v4）
    pub session_id: String,
    /// 署名付き公開鍵バンドル
    pub bundle: SignedPublicKeyBundle,
}

// ---------------------------------------------------------------------------
// 外部コラボレータの判定 (ASTRA HIVE / ASTRA CORE)
// ---------------------------------------------------------------------------

/// リスク判定。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskVerdict {
    /// 安全
    Safe,
    /// 危険
    Unsafe,
}

/// リスクスコアラーの応答。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiskAssessment {
    /// 判定
    pub verdict: RiskVerdict,
    /// 異常スコア（0.0〜1.0）
    pub score: f64,
}

impl RiskAssessment {
    /// コラボレータ不達時に使用するフェイルクローズ判定。
    pub fn fail_closed() -> Self {
        Self {
            verdict: RiskVerdict::Unsafe,
            score: 1.0,
        }
    }
}

/// コンテキスト特徴量（例: `packet_count`, `latency`, `bandwidth`, `error_rate`）。
pub type RiskFeatures = BTreeMap<String, f64>;

/// ファームウェア完全性の状態。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntegrityStatus {
    /// 信頼されたチェックサムと一致
    Ok,
    /// チェックサム不一致
    Corrupted,
    /// 検査不能（読み取り失敗等）
    Error,
}

// ---------------------------------------------------------------------------
// コマンド認可ゲート (ASTRA SENTRY)
// ---------------------------------------------------------------------------

/// 認可ゲートの状態。`Approved` と `Rejected` が終端。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GateState {
    /// 初期状態
    Pending,
    /// 完全性検査済み
    IntegrityChecked,
    /// リスク検査済み
    RiskChecked,
    /// チャネル確立済み
    ChannelEstablished,
    /// 署名済み
    Signed,
    /// 承認（終端）
    Approved,
    /// 拒否（終端）
    Rejected,
}

impl GateState {
    /// 終端状態か。
    pub fn is_terminal(self) -> bool {
        matches!(self, GateState::Approved | GateState::Rejected)
    }

    /// `self` から `next` への遷移が許可されているか。
    ///
    /// 前進は固定順（Pending → IntegrityChecked → RiskChecked → ChannelEstablished
    /// → Signed → Approved）のみ。非終端状態からはいつでも `Rejected` に遷移できる。
    pub fn can_advance_to(self, next: GateState) -> bool {
        use GateState::*;
        match (self, next) {
            (Approved | Rejected, _) => false,
            (_, Rejected) => true,
            (Pending, IntegrityChecked)
            | (IntegrityChecked, RiskChecked)
            | (RiskChecked, ChannelEstablished)
            | (ChannelEstablished, Signed)
            | (Signed, Approved) => true,
            _ => false,
        }
    }
}

/// 認可を拒否したステージ。承認時は `None`。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailingStage {
    /// 拒否なし
    #[default]
    None,
    /// ファームウェア完全性
    Integrity,
    /// コンテキストリスク
    Risk,
    /// チャネル確立
    Channel,
    /// コマンド署名
    Signature,
}

/// 監査イベントの発生元。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditStage {
    /// ゲート全体（開始・終了・前提条件）
    System,
    /// ファームウェア完全性
    Integrity,
    /// コンテキストリスク
    Risk,
    /// チャネル確立
    Channel,
    /// コマンド署名
    Signature,
}

/// 監査イベントの重大度。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    /// 情報
    Info,
    /// 警告
    Warning,
    /// エラー（コラボレータ不達等）
    Error,
    /// 重大（コマンドのブロック、設定不整合）
    Critical,
}

/// 監査イベント1件。ログ転送用のフラットなレコード。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// 発生時刻（UNIXミリ秒）
    pub timestamp: u64,
    /// 発生元ステージ
    pub stage: AuditStage,
    /// 人間向けメッセージ
    pub message: String,
    /// 重大度
    pub severity: Severity,
}

/// 認可判定のエクスポート形式。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionExport {
    /// 判定ID（UUID v4）
    pub decision_id: String,
    /// 対象コマンド
    pub command: String,
    /// 操作者ID（MFA通過済み）
    pub operator_id: String,
    /// 承認されたか
    pub approved: bool,
    /// 拒否したステージ
    pub failing_stage: FailingStage,
    /// 最終状態
    pub final_state: GateState,
    /// 拒否の原因が地上局側の鍵設定の不整合か（通常の署名拒否と区別する）
    #[serde(default)]
    pub configuration_error: bool,
    /// リスクスコア（リスク検査を実行した場合のみ）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub risk_score: Option<f64>,
    /// セッション指紋（導出秘密のSHA-256先頭8バイトのhex。秘密そのものではない）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_fingerprint: Option<String>,
    /// Base64エンコードされたコマンド署名（承認時のみ）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// 監査イベント列（発生順）
    pub events: Vec<AuditRecord>,
}

// ---------------------------------------------------------------------------
// セキュリティレポート
// ---------------------------------------------------------------------------

/// システム全体の状態とセキュリティイベントのレポート。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityReport {
    /// 生成時刻（UNIXミリ秒）
    pub generated_at: u64,
    /// ファームウェア完全性の現在状態
    pub integrity: IntegrityStatus,
    /// キーストアに登録済みの鍵ラベル
    pub key_labels: Vec<String>,
    /// 直近の監査イベント
    pub recent_events: Vec<AuditRecord>,
}

// ---------------------------------------------------------------------------
// キーストア永続化形式
// ---------------------------------------------------------------------------

/// 現行のキーストアファイル形式バージョン。
pub const KEYSTORE_FORMAT_VERSION: u32 = 1;

/// キーストアファイル全体。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeystoreFile {
    /// 形式バージョン
    pub version: u32,
    /// 鍵ラベル → 鍵レコード
    pub keys: BTreeMap<String, KeyRecord>,
}

/// 鍵ラベル1件分の鍵レコード。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    /// 署名アルゴリズム識別子 ("ed25519" / "dilithium5")
    pub algorithm: String,
    /// Base64エンコードされた公開鍵
    pub public_key: String,
    /// Base64エンコードされた秘密鍵（`sealed` の場合は nonce || AES-256-GCM暗号文）
    pub private_key: String,
    /// 秘密鍵がマスター鍵で封印されているか
    #[serde(default)]
    pub sealed: bool,
    /// 生成時刻（UNIXミリ秒）
    pub created_at: u64,
}

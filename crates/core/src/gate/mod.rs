//! # コマンド認可ゲート (ASTRA SENTRY)
//!
//! 完全性 → リスク → チャネル → 署名 の固定順で検査し、
//! 最初に失敗したステージで `Rejected` に遷移して以降のステージを実行しない。
//! 全ステージを通過した場合のみ `Approved`。
//!
//! ## フェイルクローズ
//! - 協調者の失敗・タイムアウトは拒否（リスクはスコア1.0の `unsafe`）として扱う
//! - 拒否時は確立済みのチャネルも破棄する
//!
//! ## 監査
//! 開始・各ステージ・終了の各時点で監査イベントを1件ずつ記録する。

mod audit;
mod state;

#[cfg(test)]
mod tests;

use std::sync::Arc;
use std::time::Duration;

use astra_types::{
    AuditRecord, AuditStage, DecisionExport, FailingStage, GateState, IntegrityStatus,
    RiskAssessment, RiskFeatures, RiskVerdict, Severity,
};

use crate::authority::{CommandRecord, CommandSigningAuthority};
use crate::channel::{ChannelError, Responder};
use crate::collaborators::{
    with_timeout, CollaboratorError, IntegrityMonitor, OperatorClearance, RiskScorer,
};
use crate::endpoint::{establish_channel, EndpointSession, RemoteEndpoint};
use crate::keystore::KeystoreError;
use crate::b64_encode;

pub use audit::{write_decision_json, write_json_lines, AuditTrail};
use state::{transition, Stage};

/// ゲートのエラー型
#[derive(Debug, thiserror::Error)]
pub enum GateError {
    /// 多要素認証で拒否された
    #[error("操作者 {0} は多要素認証を通過していません")]
    OperatorDenied(String),
    /// 多要素認証の協調者が応答しない
    #[error("多要素認証を完了できません: {0}")]
    MfaUnavailable(CollaboratorError),
    /// 許可されていない状態遷移
    #[error("不正な状態遷移: {from:?} -> {to:?}")]
    InvalidTransition { from: GateState, to: GateState },
    /// エクスポートの書き出しエラー
    #[error("監査ログの書き出しに失敗しました: {0}")]
    Io(#[from] std::io::Error),
    /// エクスポートのシリアライズエラー
    #[error("監査ログのシリアライズに失敗しました: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// ゲートの設定。
#[derive(Debug, Clone)]
pub struct GateConfig {
    /// コマンド署名に使う鍵ラベル
    pub key_label: String,
    /// 協調者1回の呼び出しに許す時間（チャネル確立にも適用）
    pub collaborator_timeout: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            key_label: "operator-01".to_string(),
            collaborator_timeout: Duration::from_secs(5),
        }
    }
}

/// ゲートが利用する外部協調者。
#[derive(Clone)]
pub struct GateCollaborators {
    pub integrity: Arc<dyn IntegrityMonitor>,
    pub risk: Arc<dyn RiskScorer>,
    pub endpoint: Arc<dyn RemoteEndpoint>,
}

/// 認可リクエスト。
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    /// 対象コマンド
    pub command: String,
    /// コンテキスト特徴量。`None` の場合リスク検査はスキップされる
    pub context: Option<RiskFeatures>,
}

impl AuthorizationRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: RiskFeatures) -> Self {
        self.context = Some(context);
        self
    }
}

/// 1回の認可試行の結果。試行ごとに新しく作られ、再利用されない。
#[derive(Debug)]
pub struct AuthorizationDecision {
    decision_id: String,
    command: String,
    operator_id: String,
    state: GateState,
    failing_stage: FailingStage,
    configuration_error: bool,
    risk_score: Option<f64>,
    session: Option<EndpointSession>,
    session_fingerprint: Option<String>,
    command_record: Option<CommandRecord>,
    trail: AuditTrail,
}

impl AuthorizationDecision {
    fn start(clearance: &OperatorClearance, command: &str) -> Self {
        Self {
            decision_id: uuid::Uuid::new_v4().to_string(),
            command: command.to_string(),
            operator_id: clearance.operator_id().to_string(),
            state: GateState::Pending,
            failing_stage: FailingStage::None,
            configuration_error: false,
            risk_score: None,
            session: None,
            session_fingerprint: None,
            command_record: None,
            trail: AuditTrail::new(),
        }
    }

    pub fn decision_id(&self) -> &str {
        &self.decision_id
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn operator_id(&self) -> &str {
        &self.operator_id
    }

    /// 承認されたか。
    pub fn approved(&self) -> bool {
        self.state == GateState::Approved
    }

    /// 最終状態。
    pub fn state(&self) -> GateState {
        self.state
    }

    /// 拒否したステージ。承認時は `FailingStage::None`。
    pub fn failing_stage(&self) -> FailingStage {
        self.failing_stage
    }

    /// 署名鍵の自己検証に失敗したか。オペレータの操作ではなく鍵設定の修正が必要。
    pub fn configuration_error(&self) -> bool {
        self.configuration_error
    }

    /// リスク検査を実行した場合のスコア。
    pub fn risk_score(&self) -> Option<f64> {
        self.risk_score
    }

    /// 確立したチャネルの指紋。
    pub fn session_fingerprint(&self) -> Option<&str> {
        self.session_fingerprint.as_deref()
    }

    /// 承認時の署名済みコマンド。
    pub fn command_record(&self) -> Option<&CommandRecord> {
        self.command_record.as_ref()
    }

    /// 監査イベント（発生順）。
    pub fn audit_events(&self) -> &[AuditRecord] {
        self.trail.events()
    }

    /// 承認時に確立済みチャネルを取り出す。コマンドの送信に使う。
    pub fn take_channel(&mut self) -> Option<EndpointSession> {
        self.session.take()
    }

    /// エクスポート形式に変換する。
    pub fn export(&self) -> DecisionExport {
        DecisionExport {
            decision_id: self.decision_id.clone(),
            command: self.command.clone(),
            operator_id: self.operator_id.clone(),
            approved: self.approved(),
            failing_stage: self.failing_stage,
            final_state: self.state,
            configuration_error: self.configuration_error,
            risk_score: self.risk_score,
            session_fingerprint: self.session_fingerprint.clone(),
            signature: self
                .command_record
                .as_ref()
                .map(|record| b64_encode(&record.signature)),
            events: self.trail.events().to_vec(),
        }
    }

    fn record(&mut self, stage: AuditStage, severity: Severity, message: impl Into<String>) {
        self.trail.record(stage, severity, message);
    }

    fn advance(&mut self, next: GateState) -> Result<(), GateError> {
        self.state = transition(self.state, next)?;
        Ok(())
    }

    fn reject(&mut self, stage: Stage) {
        self.state = GateState::Rejected;
        self.failing_stage = stage.failing_stage();
        // 拒否された試行のチャネル・署名は使わせない
        self.session = None;
        self.command_record = None;
        self.record(
            AuditStage::System,
            Severity::Critical,
            format!(
                "コマンドをブロックしました: {} (stage={:?})",
                self.command, self.failing_stage
            ),
        );
    }
}

/// コマンド認可ゲート。`Arc<CommandGate>` で共有し、独立したコマンドを並行に認可できる。
pub struct CommandGate {
    collaborators: GateCollaborators,
    responder: Responder,
    authority: CommandSigningAuthority,
    config: GateConfig,
}

impl CommandGate {
    pub fn new(
        collaborators: GateCollaborators,
        responder: Responder,
        authority: CommandSigningAuthority,
        config: GateConfig,
    ) -> Self {
        Self {
            collaborators,
            responder,
            authority,
            config,
        }
    }

    pub fn config(&self) -> &GateConfig {
        &self.config
    }

    /// コマンドを認可する。
    ///
    /// 多要素認証を通過した操作者のクリアランスが必要。判定は常に返り、
    /// 拒否の理由は `failing_stage` と監査イベントに記録される。
    pub async fn authorize(
        &self,
        clearance: &OperatorClearance,
        request: AuthorizationRequest,
    ) -> AuthorizationDecision {
        let mut decision = AuthorizationDecision::start(clearance, &request.command);
        decision.record(
            AuditStage::System,
            Severity::Info,
            format!(
                "コマンド認可を開始します: {} (operator={}, decision={})",
                request.command,
                clearance.operator_id(),
                decision.decision_id
            ),
        );

        for stage in Stage::ORDER {
            let passed = match stage {
                Stage::Integrity => self.check_integrity(&mut decision).await,
                Stage::Risk => self.check_risk(&mut decision, request.context.as_ref()).await,
                Stage::Channel => self.open_channel(&mut decision).await,
                Stage::Signature => self.sign_and_verify(&mut decision, &request.command),
            };
            if !passed {
                decision.reject(stage);
                return decision;
            }
            if let Err(e) = decision.advance(stage.passed_state()) {
                decision.record(AuditStage::System, Severity::Critical, e.to_string());
                decision.reject(stage);
                return decision;
            }
        }

        if let Err(e) = decision.advance(GateState::Approved) {
            decision.record(AuditStage::System, Severity::Critical, e.to_string());
            decision.reject(Stage::Signature);
            return decision;
        }
        decision.record(
            AuditStage::System,
            Severity::Info,
            format!("コマンドを承認しました: {}", request.command),
        );
        decision
    }

    async fn check_integrity(&self, decision: &mut AuthorizationDecision) -> bool {
        let status = with_timeout(
            self.config.collaborator_timeout,
            self.collaborators.integrity.status(),
        )
        .await;
        match status {
            Ok(IntegrityStatus::Ok) => {
                decision.record(
                    AuditStage::Integrity,
                    Severity::Info,
                    "ファームウェアの完全性を確認しました",
                );
                true
            }
            Ok(IntegrityStatus::Corrupted) => {
                decision.record(
                    AuditStage::Integrity,
                    Severity::Critical,
                    "ファームウェアの改ざんを検知しました",
                );
                false
            }
            Ok(IntegrityStatus::Error) => {
                decision.record(
                    AuditStage::Integrity,
                    Severity::Error,
                    "ファームウェアの完全性を検査できません",
                );
                false
            }
            Err(e) => {
                decision.record(
                    AuditStage::Integrity,
                    Severity::Error,
                    format!("完全性監視の呼び出しに失敗しました: {e}"),
                );
                false
            }
        }
    }

    async fn check_risk(
        &self,
        decision: &mut AuthorizationDecision,
        context: Option<&RiskFeatures>,
    ) -> bool {
        let Some(features) = context else {
            decision.record(
                AuditStage::Risk,
                Severity::Info,
                "コンテキストが指定されていないためリスク評価をスキップします",
            );
            return true;
        };

        let assessment = match with_timeout(
            self.config.collaborator_timeout,
            self.collaborators.risk.score(features),
        )
        .await
        {
            Ok(assessment) => assessment,
            Err(e) => {
                let fallback = RiskAssessment::fail_closed();
                decision.risk_score = Some(fallback.score);
                decision.record(
                    AuditStage::Risk,
                    Severity::Error,
                    format!(
                        "リスク評価に失敗したため危険と判定します (score: {:.3}): {e}",
                        fallback.score
                    ),
                );
                return false;
            }
        };

        decision.risk_score = Some(assessment.score);
        match assessment.verdict {
            RiskVerdict::Safe => {
                decision.record(
                    AuditStage::Risk,
                    Severity::Info,
                    format!("コンテキストは正常です (score: {:.3})", assessment.score),
                );
                true
            }
            RiskVerdict::Unsafe => {
                decision.record(
                    AuditStage::Risk,
                    Severity::Warning,
                    format!("異常なコンテキストを検知しました (score: {:.3})", assessment.score),
                );
                false
            }
        }
    }

    async fn open_channel(&self, decision: &mut AuthorizationDecision) -> bool {
        let endpoint = self.collaborators.endpoint.as_ref();
        let timeout = self.config.collaborator_timeout;
        match establish_channel(&self.responder, endpoint, timeout).await {
            Ok(session) => {
                let fingerprint = session.channel.fingerprint();
                decision.record(
                    AuditStage::Channel,
                    Severity::Info,
                    format!(
                        "{} とチャネルを確立しました (fingerprint: {fingerprint}, assurance: {:?})",
                        endpoint.name(),
                        session.channel.assurance()
                    ),
                );
                decision.session_fingerprint = Some(fingerprint);
                decision.session = Some(session);
                true
            }
            Err(ChannelError::Timeout(_)) => {
                decision.record(
                    AuditStage::Channel,
                    Severity::Error,
                    format!(
                        "{} とのチャネル確立がタイムアウトしました（{timeout:?}）",
                        endpoint.name()
                    ),
                );
                false
            }
            Err(e) => {
                decision.record(
                    AuditStage::Channel,
                    Severity::Error,
                    format!("{} とのチャネル確立に失敗しました: {e}", endpoint.name()),
                );
                false
            }
        }
    }

    fn sign_and_verify(&self, decision: &mut AuthorizationDecision, command: &str) -> bool {
        let label = self.config.key_label.as_str();
        let record = match self.authority.sign_command(command, label) {
            Ok(record) => record,
            Err(KeystoreError::KeyNotFound(_)) => {
                decision.record(
                    AuditStage::Signature,
                    Severity::Error,
                    format!("署名鍵 {label} が見つかりません"),
                );
                return false;
            }
            Err(e) => {
                decision.record(
                    AuditStage::Signature,
                    Severity::Error,
                    format!("コマンドの署名に失敗しました: {e}"),
                );
                return false;
            }
        };

        match self
            .authority
            .verify_command(command, &record.signature, label)
        {
            Ok(true) => {
                decision.record(
                    AuditStage::Signature,
                    Severity::Info,
                    format!(
                        "コマンドに署名しました (key: {label}, algorithm: {})",
                        record.algorithm
                    ),
                );
                decision.command_record = Some(record);
                true
            }
            Ok(false) => {
                tracing::error!(label, "署名鍵の秘密鍵と公開鍵が対応していません");
                decision.configuration_error = true;
                decision.record(
                    AuditStage::Signature,
                    Severity::Critical,
                    format!(
                        "署名鍵 {label} の署名が自身の公開鍵で検証できません（鍵設定の不整合）"
                    ),
                );
                false
            }
            Err(e) => {
                decision.record(
                    AuditStage::Signature,
                    Severity::Error,
                    format!("署名の検証に失敗しました: {e}"),
                );
                false
            }
        }
    }
}

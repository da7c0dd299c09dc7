//! ゲートのステージと状態遷移。

use astra_types::{FailingStage, GateState};

use super::GateError;

/// 検査ステージ。この順序で実行する。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stage {
    Integrity,
    Risk,
    Channel,
    Signature,
}

impl Stage {
    pub(crate) const ORDER: [Stage; 4] = [
        Stage::Integrity,
        Stage::Risk,
        Stage::Channel,
        Stage::Signature,
    ];

    pub(crate) fn failing_stage(self) -> FailingStage {
        match self {
            Stage::Integrity => FailingStage::Integrity,
            Stage::Risk => FailingStage::Risk,
            Stage::Channel => FailingStage::Channel,
            Stage::Signature => FailingStage::Signature,
        }
    }

    /// ステージ通過後の状態。
    pub(crate) fn passed_state(self) -> GateState {
        match self {
            Stage::Integrity => GateState::IntegrityChecked,
            Stage::Risk => GateState::RiskChecked,
            Stage::Channel => GateState::ChannelEstablished,
            Stage::Signature => GateState::Signed,
        }
    }
}

/// 遷移を検証し、許可されていれば次の状態を返す。
pub(crate) fn transition(from: GateState, to: GateState) -> Result<GateState, GateError> {
    if from.can_advance_to(to) {
        Ok(to)
    } else {
        Err(GateError::InvalidTransition { from, to })
    }
}

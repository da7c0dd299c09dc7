//! 組み込みのリスク評価器。

use std::time::Duration;

use astra_types::{RiskAssessment, RiskFeatures, RiskVerdict};
use async_trait::async_trait;

use super::{CollaboratorError, RiskScorer};

/// これを超えるスコアを危険と判定する既定の閾値。
pub const DEFAULT_RISK_THRESHOLD: f64 = 0.7;

/// 基準値からの正規化偏差の平均をスコアとする評価器。
///
/// 各特徴量について `min(1, |x - base| / max(|base|, ε))` を計算し、平均を取る。
/// 基準にない特徴量は偏差1.0として扱う。
pub struct ThresholdRiskScorer {
    baseline: RiskFeatures,
    threshold: f64,
}

impl ThresholdRiskScorer {
    pub fn new(baseline: RiskFeatures, threshold: f64) -> Self {
        Self {
            baseline,
            threshold,
        }
    }

    /// 平常時のネットワークプロファイルを基準とする評価器。
    pub fn network_default() -> Self {
        Self::new(default_network_baseline(), DEFAULT_RISK_THRESHOLD)
    }

    /// 閾値を変更する。
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    fn deviation(&self, name: &str, value: f64) -> f64 {
        if !value.is_finite() {
            return 1.0;
        }
        match self.baseline.get(name) {
            Some(base) => ((value - base).abs() / base.abs().max(f64::EPSILON)).min(1.0),
            None => 1.0,
        }
    }
}

/// 平常時のネットワーク特徴量。
pub fn default_network_baseline() -> RiskFeatures {
    RiskFeatures::from([
        ("packet_count".to_string(), 1000.0),
        ("latency".to_string(), 50.0),
        ("bandwidth".to_string(), 100.0),
        ("error_rate".to_string(), 0.001),
    ])
}

#[async_trait]
impl RiskScorer for ThresholdRiskScorer {
    async fn score(&self, features: &RiskFeatures) -> Result<RiskAssessment, CollaboratorError> {
        if features.is_empty() {
            return Err(CollaboratorError::InvalidResponse(
                "特徴量が空です".into(),
            ));
        }
        let total: f64 = features
            .iter()
            .map(|(name, value)| self.deviation(name, *value))
            .sum();
        let score = total / features.len() as f64;
        Ok(assessment(score, self.threshold))
    }
}

fn assessment(score: f64, threshold: f64) -> RiskAssessment {
    let verdict = if score > threshold {
        RiskVerdict::Unsafe
    } else {
        RiskVerdict::Safe
    };
    RiskAssessment { verdict, score }
}

/// 外部のスコアリングサービスにHTTPで問い合わせる評価器。
///
/// 特徴量マップをJSONでPOSTし、`{"verdict": "safe"|"unsafe", "score": f64}` を受け取る。
pub struct HttpRiskScorer {
    client: reqwest::Client,
    url: String,
}

impl HttpRiskScorer {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, CollaboratorError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| CollaboratorError::Unavailable(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl RiskScorer for HttpRiskScorer {
    async fn score(&self, features: &RiskFeatures) -> Result<RiskAssessment, CollaboratorError> {
        let resp = self
            .client
            .post(&self.url)
            .json(features)
            .send()
            .await
            .map_err(|e| CollaboratorError::Unavailable(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(CollaboratorError::Unavailable(format!(
                "リスク評価サービスがHTTP {status} を返しました"
            )));
        }

        let assessment: RiskAssessment = resp
            .json()
            .await
            .map_err(|e| CollaboratorError::InvalidResponse(e.to_string()))?;
        if !assessment.score.is_finite() || !(0.0..=1.0).contains(&assessment.score) {
            return Err(CollaboratorError::InvalidResponse(format!(
                "スコアが範囲外です: {}",
                assessment.score
            )));
        }
        Ok(assessment)
    }
}

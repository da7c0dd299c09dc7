use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use astra_crypto::{Kyber1024, SignatureAlgorithm, SigningKeyPair};
use astra_types::{
    ChannelResponse, HandshakeOffer, KeyConfirmation, KeyRecord, KeystoreFile,
    KEYSTORE_FORMAT_VERSION,
};
use async_trait::async_trait;

use super::*;
use crate::channel::ChannelError;
use crate::collaborators::{MfaVerifier, StaticMfaVerifier};
use crate::endpoint::SimulatedSatellite;
use crate::keystore::Keystore;

const ORBIT_COMMAND: &str = "CMD:SET_ORBIT;SAT:ASTRA-042;PARAMS:400km,90deg";
const OPERATOR: &str = "operator-01";
const KEY_LABEL: &str = "Operator-01-Key";

// ---------------------------------------------------------------------------
// モック協調者（呼び出し回数を記録する）
// ---------------------------------------------------------------------------

enum IntegrityBehavior {
    Status(IntegrityStatus),
    Fail,
}

struct MockIntegrity {
    behavior: IntegrityBehavior,
    calls: AtomicUsize,
}

#[async_trait]
impl IntegrityMonitor for MockIntegrity {
    async fn status(&self) -> Result<IntegrityStatus, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            IntegrityBehavior::Status(status) => Ok(status),
            IntegrityBehavior::Fail => {
                Err(CollaboratorError::Unavailable("monitor offline".into()))
            }
        }
    }
}

enum RiskBehavior {
    Respond(RiskVerdict, f64),
    Fail,
    Hang,
}

struct MockRisk {
    behavior: RiskBehavior,
    calls: AtomicUsize,
}

#[async_trait]
impl RiskScorer for MockRisk {
    async fn score(&self, _features: &RiskFeatures) -> Result<RiskAssessment, CollaboratorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.behavior {
            RiskBehavior::Respond(verdict, score) => Ok(RiskAssessment { verdict, score }),
            RiskBehavior::Fail => Err(CollaboratorError::Unavailable("model offline".into())),
            RiskBehavior::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(RiskAssessment {
                    verdict: RiskVerdict::Safe,
                    score: 0.0,
                })
            }
        }
    }
}

/// シミュレーション衛星を包み、提示回数を記録する。
/// `forged_identity` を指定すると、バンドルの署名公開鍵を別の鍵ペアのものに差し替える。
struct CountingEndpoint {
    satellite: SimulatedSatellite,
    forged_identity: Option<Vec<u8>>,
    stall_finish: bool,
    offers: AtomicUsize,
    aborts: AtomicUsize,
}

#[async_trait]
impl RemoteEndpoint for CountingEndpoint {
    fn name(&self) -> &str {
        "ASTRA-042"
    }

    async fn offer_bundle(&self) -> Result<HandshakeOffer, ChannelError> {
        self.offers.fetch_add(1, Ordering::SeqCst);
        let mut offer = self.satellite.offer_bundle().await?;
        if let Some(forged) = &self.forged_identity {
            offer.bundle.signing_public_key = crate::b64_encode(forged);
        }
        Ok(offer)
    }

    async fn finish_handshake(
        &self,
        session_id: &str,
        response: &ChannelResponse,
    ) -> Result<KeyConfirmation, ChannelError> {
        if self.stall_finish {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        self.satellite.finish_handshake(session_id, response).await
    }

    async fn abort_session(&self, session_id: &str) {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        self.satellite.abort_session(session_id).await;
    }
}

struct Fixture {
    gate: Arc<CommandGate>,
    integrity: Arc<MockIntegrity>,
    risk: Arc<MockRisk>,
    endpoint: Arc<CountingEndpoint>,
}

struct FixtureOptions {
    integrity: IntegrityBehavior,
    risk: RiskBehavior,
    forge_identity: bool,
    stall_handshake: bool,
    keystore: Option<Arc<Keystore>>,
    timeout: Duration,
}

impl Default for FixtureOptions {
    fn default() -> Self {
        Self {
            integrity: IntegrityBehavior::Status(IntegrityStatus::Ok),
            risk: RiskBehavior::Respond(RiskVerdict::Safe, 0.05),
            forge_identity: false,
            stall_handshake: false,
            keystore: None,
            timeout: Duration::from_secs(5),
        }
    }
}

fn fixture(options: FixtureOptions) -> Fixture {
    let keystore = options.keystore.unwrap_or_else(|| {
        let keystore = Arc::new(Keystore::in_memory());
        keystore
            .provision(KEY_LABEL, SignatureAlgorithm::Ed25519)
            .unwrap();
        keystore
    });

    let satellite_identity =
        Arc::new(SigningKeyPair::generate(SignatureAlgorithm::Dilithium5, "ASTRA-042").unwrap());
    let forged_identity = options.forge_identity.then(|| {
        SigningKeyPair::generate(SignatureAlgorithm::Dilithium5, "impostor")
            .unwrap()
            .public_key
    });

    let integrity = Arc::new(MockIntegrity {
        behavior: options.integrity,
        calls: AtomicUsize::new(0),
    });
    let risk = Arc::new(MockRisk {
        behavior: options.risk,
        calls: AtomicUsize::new(0),
    });
    let endpoint = Arc::new(CountingEndpoint {
        satellite: SimulatedSatellite::new("ASTRA-042", satellite_identity),
        forged_identity,
        stall_finish: options.stall_handshake,
        offers: AtomicUsize::new(0),
        aborts: AtomicUsize::new(0),
    });

    let gate = CommandGate::new(
        GateCollaborators {
            integrity: integrity.clone(),
            risk: risk.clone(),
            endpoint: endpoint.clone(),
        },
        Responder::new(Arc::new(Kyber1024)),
        CommandSigningAuthority::new(keystore),
        GateConfig {
            key_label: KEY_LABEL.to_string(),
            collaborator_timeout: options.timeout,
        },
    );

    Fixture {
        gate: Arc::new(gate),
        integrity,
        risk,
        endpoint,
    }
}

async fn clearance() -> OperatorClearance {
    let mfa = StaticMfaVerifier::new([OPERATOR]);
    OperatorClearance::obtain(&mfa as &dyn MfaVerifier, OPERATOR)
        .await
        .unwrap()
}

fn normal_context() -> RiskFeatures {
    RiskFeatures::from([
        ("packet_count".to_string(), 1000.0),
        ("latency".to_string(), 50.0),
        ("bandwidth".to_string(), 100.0),
        ("error_rate".to_string(), 0.001),
    ])
}

fn stages(decision: &AuthorizationDecision) -> Vec<AuditStage> {
    decision.audit_events().iter().map(|e| e.stage).collect()
}

// ---------------------------------------------------------------------------
// シナリオ
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_all_checks_pass_approves() {
    let fx = fixture(FixtureOptions::default());
    let request = AuthorizationRequest::new(ORBIT_COMMAND).with_context(normal_context());

    let decision = fx.gate.authorize(&clearance().await, request).await;

    assert!(decision.approved());
    assert_eq!(decision.state(), GateState::Approved);
    assert_eq!(decision.failing_stage(), FailingStage::None);
    assert_eq!(decision.risk_score(), Some(0.05));
    assert!(decision.session_fingerprint().is_some());
    assert_eq!(decision.operator_id(), OPERATOR);

    let record = decision.command_record().unwrap();
    assert_eq!(record.command, ORBIT_COMMAND);
    assert_eq!(record.key_id, KEY_LABEL);

    assert_eq!(
        stages(&decision),
        vec![
            AuditStage::System,
            AuditStage::Integrity,
            AuditStage::Risk,
            AuditStage::Channel,
            AuditStage::Signature,
            AuditStage::System,
        ]
    );
    assert!(decision
        .audit_events()
        .iter()
        .all(|e| e.severity == Severity::Info));
}

#[tokio::test]
async fn test_unsafe_context_rejects_before_channel() {
    let fx = fixture(FixtureOptions {
        risk: RiskBehavior::Respond(RiskVerdict::Unsafe, 0.9),
        ..Default::default()
    });
    let request = AuthorizationRequest::new(ORBIT_COMMAND).with_context(normal_context());

    let decision = fx.gate.authorize(&clearance().await, request).await;

    assert!(!decision.approved());
    assert_eq!(decision.state(), GateState::Rejected);
    assert_eq!(decision.failing_stage(), FailingStage::Risk);
    assert_eq!(decision.risk_score(), Some(0.9));
    assert_eq!(fx.endpoint.offers.load(Ordering::SeqCst), 0);
    assert!(decision.command_record().is_none());
    assert!(!stages(&decision).contains(&AuditStage::Channel));
    assert!(!stages(&decision).contains(&AuditStage::Signature));

    let risk_event = decision
        .audit_events()
        .iter()
        .find(|e| e.stage == AuditStage::Risk)
        .unwrap();
    assert_eq!(risk_event.severity, Severity::Warning);
}

#[tokio::test]
async fn test_forged_bundle_identity_rejects_at_channel() {
    let fx = fixture(FixtureOptions {
        forge_identity: true,
        ..Default::default()
    });
    let request = AuthorizationRequest::new(ORBIT_COMMAND).with_context(normal_context());

    let mut decision = fx.gate.authorize(&clearance().await, request).await;

    assert!(!decision.approved());
    assert_eq!(decision.failing_stage(), FailingStage::Channel);
    assert!(decision.session_fingerprint().is_none());
    assert!(decision.take_channel().is_none());
    assert!(decision.command_record().is_none());
    assert!(!stages(&decision).contains(&AuditStage::Signature));
    assert_eq!(fx.endpoint.satellite.established_sessions(), 0);
    assert_eq!(fx.endpoint.satellite.pending_sessions(), 0);
}

#[tokio::test]
async fn test_rejected_handshakes_leave_no_sessions_behind() {
    let forged = fixture(FixtureOptions {
        forge_identity: true,
        ..Default::default()
    });
    for _ in 0..5 {
        let decision = forged
            .gate
            .authorize(&clearance().await, AuthorizationRequest::new(ORBIT_COMMAND))
            .await;
        assert_eq!(decision.failing_stage(), FailingStage::Channel);
    }
    assert_eq!(forged.endpoint.aborts.load(Ordering::SeqCst), 5);
    assert_eq!(forged.endpoint.satellite.pending_sessions(), 0);
    assert_eq!(forged.endpoint.satellite.established_sessions(), 0);

    let fx = fixture(FixtureOptions::default());
    for _ in 0..3 {
        let mut decision = fx
            .gate
            .authorize(&clearance().await, AuthorizationRequest::new(ORBIT_COMMAND))
            .await;
        let session = decision.take_channel().unwrap();
        assert!(fx.endpoint.satellite.close(&session.session_id));
        assert!(!fx.endpoint.satellite.close(&session.session_id));
    }
    assert_eq!(fx.endpoint.aborts.load(Ordering::SeqCst), 0);
    assert_eq!(fx.endpoint.satellite.pending_sessions(), 0);
    assert_eq!(fx.endpoint.satellite.established_sessions(), 0);
}

#[tokio::test]
async fn test_stalled_handshake_times_out_and_aborts_session() {
    let fx = fixture(FixtureOptions {
        stall_handshake: true,
        timeout: Duration::from_millis(100),
        ..Default::default()
    });

    let decision = fx
        .gate
        .authorize(&clearance().await, AuthorizationRequest::new(ORBIT_COMMAND))
        .await;

    assert_eq!(decision.failing_stage(), FailingStage::Channel);
    assert_eq!(fx.endpoint.offers.load(Ordering::SeqCst), 1);
    assert_eq!(fx.endpoint.aborts.load(Ordering::SeqCst), 1);
    assert_eq!(fx.endpoint.satellite.pending_sessions(), 0);
    let channel_event = decision
        .audit_events()
        .iter()
        .find(|e| e.stage == AuditStage::Channel)
        .unwrap();
    assert!(channel_event.message.contains("タイムアウト"));
}

#[tokio::test]
async fn test_corrupted_firmware_stops_all_later_stages() {
    let fx = fixture(FixtureOptions {
        integrity: IntegrityBehavior::Status(IntegrityStatus::Corrupted),
        ..Default::default()
    });
    let request = AuthorizationRequest::new(ORBIT_COMMAND).with_context(normal_context());

    let decision = fx.gate.authorize(&clearance().await, request).await;

    assert_eq!(decision.failing_stage(), FailingStage::Integrity);
    assert_eq!(fx.integrity.calls.load(Ordering::SeqCst), 1);
    assert_eq!(fx.risk.calls.load(Ordering::SeqCst), 0);
    assert_eq!(fx.endpoint.offers.load(Ordering::SeqCst), 0);
    assert!(decision.command_record().is_none());
    assert_eq!(
        stages(&decision),
        vec![AuditStage::System, AuditStage::Integrity, AuditStage::System]
    );
    assert_eq!(decision.audit_events()[1].severity, Severity::Critical);
}

#[tokio::test]
async fn test_integrity_error_and_unreachable_monitor_reject() {
    for behavior in [
        IntegrityBehavior::Status(IntegrityStatus::Error),
        IntegrityBehavior::Fail,
    ] {
        let fx = fixture(FixtureOptions {
            integrity: behavior,
            ..Default::default()
        });
        let decision = fx
            .gate
            .authorize(&clearance().await, AuthorizationRequest::new(ORBIT_COMMAND))
            .await;

        assert_eq!(decision.failing_stage(), FailingStage::Integrity);
        assert_eq!(decision.audit_events()[1].severity, Severity::Error);
        assert_eq!(fx.risk.calls.load(Ordering::SeqCst), 0);
    }
}

#[tokio::test]
async fn test_missing_context_skips_risk_stage() {
    let fx = fixture(FixtureOptions::default());

    let decision = fx
        .gate
        .authorize(&clearance().await, AuthorizationRequest::new(ORBIT_COMMAND))
        .await;

    assert!(decision.approved());
    assert_eq!(fx.risk.calls.load(Ordering::SeqCst), 0);
    assert_eq!(decision.risk_score(), None);
    assert!(stages(&decision).contains(&AuditStage::Risk));
}

#[tokio::test]
async fn test_risk_collaborator_failure_fails_closed() {
    let fx = fixture(FixtureOptions {
        risk: RiskBehavior::Fail,
        ..Default::default()
    });
    let request = AuthorizationRequest::new(ORBIT_COMMAND).with_context(normal_context());

    let decision = fx.gate.authorize(&clearance().await, request).await;

    assert_eq!(decision.failing_stage(), FailingStage::Risk);
    assert_eq!(decision.risk_score(), Some(1.0));
    assert_eq!(fx.endpoint.offers.load(Ordering::SeqCst), 0);
    let risk_event = decision
        .audit_events()
        .iter()
        .find(|e| e.stage == AuditStage::Risk)
        .unwrap();
    assert_eq!(risk_event.severity, Severity::Error);
}

#[tokio::test]
async fn test_risk_collaborator_timeout_fails_closed() {
    let fx = fixture(FixtureOptions {
        risk: RiskBehavior::Hang,
        timeout: Duration::from_millis(100),
        ..Default::default()
    });
    let request = AuthorizationRequest::new(ORBIT_COMMAND).with_context(normal_context());

    let decision = fx.gate.authorize(&clearance().await, request).await;

    assert_eq!(decision.failing_stage(), FailingStage::Risk);
    assert_eq!(decision.risk_score(), Some(1.0));
}

#[tokio::test]
async fn test_missing_signing_key_rejects_at_signature() {
    let fx = fixture(FixtureOptions {
        keystore: Some(Arc::new(Keystore::in_memory())),
        ..Default::default()
    });

    let mut decision = fx
        .gate
        .authorize(&clearance().await, AuthorizationRequest::new(ORBIT_COMMAND))
        .await;

    assert_eq!(decision.failing_stage(), FailingStage::Signature);
    assert_eq!(fx.endpoint.offers.load(Ordering::SeqCst), 1);
    // 拒否された試行のチャネルは破棄される
    assert!(decision.take_channel().is_none());
    let signature_event = decision
        .audit_events()
        .iter()
        .find(|e| e.stage == AuditStage::Signature)
        .unwrap();
    assert_eq!(signature_event.severity, Severity::Error);
    assert!(!decision.configuration_error());
    assert!(!decision.export().configuration_error);
}

#[tokio::test]
async fn test_mismatched_key_material_is_critical() {
    // 公開鍵と秘密鍵が別の鍵ペアに由来するキーストア
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("keystore.json");
    let a = SigningKeyPair::generate(SignatureAlgorithm::Ed25519, KEY_LABEL).unwrap();
    let b = SigningKeyPair::generate(SignatureAlgorithm::Ed25519, KEY_LABEL).unwrap();
    let mut keys = BTreeMap::new();
    keys.insert(
        KEY_LABEL.to_string(),
        KeyRecord {
            algorithm: "ed25519".into(),
            public_key: crate::b64_encode(&a.public_key),
            private_key: crate::b64_encode(b.private_key_bytes()),
            sealed: false,
            created_at: 0,
        },
    );
    let file = KeystoreFile {
        version: KEYSTORE_FORMAT_VERSION,
        keys,
    };
    std::fs::write(&path, serde_json::to_vec(&file).unwrap()).unwrap();

    let fx = fixture(FixtureOptions {
        keystore: Some(Arc::new(Keystore::open(&path, None).unwrap())),
        ..Default::default()
    });
    let decision = fx
        .gate
        .authorize(&clearance().await, AuthorizationRequest::new(ORBIT_COMMAND))
        .await;

    assert_eq!(decision.state(), GateState::Rejected);
    assert_eq!(decision.failing_stage(), FailingStage::Signature);
    assert!(decision.configuration_error());
    let signature_event = decision
        .audit_events()
        .iter()
        .find(|e| e.stage == AuditStage::Signature)
        .unwrap();
    assert_eq!(signature_event.severity, Severity::Critical);

    let export = decision.export();
    assert!(export.configuration_error);
    let json = serde_json::to_value(&export).unwrap();
    assert_eq!(json["configuration_error"], true);
}

#[tokio::test]
async fn test_approved_command_travels_over_channel() {
    let fx = fixture(FixtureOptions::default());

    let mut decision = fx
        .gate
        .authorize(&clearance().await, AuthorizationRequest::new(ORBIT_COMMAND))
        .await;
    assert!(decision.approved());

    let mut session = decision.take_channel().unwrap();
    let sealed = session.channel.seal(ORBIT_COMMAND.as_bytes()).unwrap();
    let received = fx
        .endpoint
        .satellite
        .receive(&session.session_id, &sealed)
        .unwrap();
    assert_eq!(received, ORBIT_COMMAND.as_bytes());

    assert!(fx.endpoint.satellite.close(&session.session_id));
    assert!(fx
        .endpoint
        .satellite
        .receive(&session.session_id, &sealed)
        .is_err());
}

#[tokio::test]
async fn test_export_matches_decision() {
    let fx = fixture(FixtureOptions::default());
    let request = AuthorizationRequest::new(ORBIT_COMMAND).with_context(normal_context());
    let decision = fx.gate.authorize(&clearance().await, request).await;

    let export = decision.export();
    assert_eq!(export.decision_id, decision.decision_id());
    assert!(export.approved);
    assert_eq!(export.final_state, GateState::Approved);
    assert_eq!(export.events.len(), decision.audit_events().len());
    assert!(export.signature.is_some());

    let json = serde_json::to_value(&export).unwrap();
    assert_eq!(json["failing_stage"], "NONE");
    assert_eq!(json["events"][1]["stage"], "INTEGRITY");

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("decision.json");
    write_decision_json(&path, &export).unwrap();
    let reloaded: DecisionExport =
        serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
    assert_eq!(reloaded, export);
}

#[tokio::test]
async fn test_rejected_export_omits_signature() {
    let fx = fixture(FixtureOptions {
        risk: RiskBehavior::Respond(RiskVerdict::Unsafe, 0.9),
        ..Default::default()
    });
    let request = AuthorizationRequest::new(ORBIT_COMMAND).with_context(normal_context());
    let decision = fx.gate.authorize(&clearance().await, request).await;

    let json = serde_json::to_value(decision.export()).unwrap();
    assert_eq!(json["failing_stage"], "RISK");
    assert_eq!(json["final_state"], "REJECTED");
    assert!(json.get("signature").is_none());
    assert!(json.get("session_fingerprint").is_none());
}

#[tokio::test]
async fn test_concurrent_authorizations_are_independent() {
    let fx = fixture(FixtureOptions::default());
    let operator = clearance().await;

    let handles: Vec<_> = (0..6)
        .map(|i| {
            let gate = Arc::clone(&fx.gate);
            let operator = operator.clone();
            tokio::spawn(async move {
                let request = AuthorizationRequest::new(format!("CMD:PING;SAT:ASTRA-042;SEQ:{i}"));
                gate.authorize(&operator, request).await
            })
        })
        .collect();

    let mut decision_ids = HashSet::new();
    let mut fingerprints = HashSet::new();
    for handle in handles {
        let decision = handle.await.unwrap();
        assert!(decision.approved());
        decision_ids.insert(decision.decision_id().to_string());
        fingerprints.insert(decision.session_fingerprint().unwrap().to_string());
    }
    assert_eq!(decision_ids.len(), 6);
    assert_eq!(fingerprints.len(), 6);
    assert_eq!(fx.endpoint.offers.load(Ordering::SeqCst), 6);
}

//! # サブコマンドの実装

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use astra_core::channel::Responder;
use astra_core::collaborators::{
    FirmwareIntegrityMonitor, HttpRiskScorer, IntegrityMonitor,
    OperatorClearance, RiskScorer, StaticMfaVerifier, ThresholdRiskScorer,
};
use astra_core::gate::{write_decision_json, write_json_lines};
use astra_core::{
    establish_channel, AuthorizationRequest, CommandGate, CommandSigningAuthority,
    GateCollaborators, GateConfig, Keystore, ProvisionOutcome, SimulatedSatellite,
};
use astra_crypto::{Kyber1024, SignatureAlgorithm, SigningKeyPair};
use astra_types::{AuditRecord, RiskFeatures};

use crate::config::CliConfig;
use crate::error::CliError;

/// シミュレーション衛星の長期鍵ID
const SATELLITE_KEY_ID: &str = "astra-sat-01";

/// `authorize` サブコマンドの入力。
pub struct AuthorizeOptions {
    pub command: String,
    pub operator: String,
    pub label: String,
    pub context: Vec<(String, f64)>,
    pub audit_out: Option<PathBuf>,
    pub jsonl: Option<PathBuf>,
}

/// `name=value` 形式の特徴量を解釈する。
pub fn parse_feature(raw: &str) -> Result<(String, f64), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("name=value の形式で指定してください: {raw}"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("特徴量名が空です: {raw}"));
    }
    let value: f64 = value
        .trim()
        .parse()
        .map_err(|_| format!("特徴量の値が数値ではありません: {raw}"))?;
    if !value.is_finite() {
        return Err(format!("特徴量の値が有限ではありません: {raw}"));
    }
    Ok((name.to_string(), value))
}

/// コマンドラインで指定されたリスク閾値を検証する。
pub fn check_threshold(threshold: f64) -> Result<f64, CliError> {
    if (0.0..=1.0).contains(&threshold) {
        Ok(threshold)
    } else {
        Err(CliError::InvalidArgument(format!(
            "リスク閾値は0.0〜1.0である必要があります: {threshold}"
        )))
    }
}

/// 公開鍵の短いフィンガープリント（SHA-256先頭8バイトのhex）。
pub fn key_fingerprint(public_key: &[u8]) -> String {
    hex::encode(&astra_crypto::sha256(public_key)[..8])
}

fn open_authority(config: &CliConfig) -> Result<CommandSigningAuthority, CliError> {
    let keystore = Keystore::open(&config.keystore_path, config.master_key)?;
    if !keystore.is_sealed() {
        tracing::warn!(
            path = %config.keystore_path.display(),
            "ASTRA_KEYSTORE_MASTER_KEY が未設定のため、秘密鍵は平文で保存されます"
        );
    }
    Ok(CommandSigningAuthority::new(Arc::new(keystore)))
}

async fn integrity_monitor(config: &CliConfig) -> Result<FirmwareIntegrityMonitor, CliError> {
    let path = config.firmware_path.clone().ok_or(CliError::InvalidConfig {
        name: "ASTRA_FIRMWARE_PATH",
        reason: "監視対象のファームウェアが指定されていません（--firmware）".to_string(),
    })?;
    if let Some(checksum) = &config.firmware_sha256 {
        return Ok(FirmwareIntegrityMonitor::new(path, checksum)?);
    }

    // 初回に計測したチェックサムをキーストアの隣に保存し、以降はそれと照合する
    let pin_path = firmware_pin_path(&config.keystore_path);
    match std::fs::read_to_string(&pin_path) {
        Ok(checksum) => Ok(FirmwareIntegrityMonitor::new(path, &checksum)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            let monitor = FirmwareIntegrityMonitor::capture(path).await?;
            if let Some(parent) = pin_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&pin_path, monitor.trusted_checksum())?;
            tracing::warn!(
                pin = %pin_path.display(),
                checksum = %monitor.trusted_checksum(),
                "ASTRA_FIRMWARE_SHA256 が未設定のため、現在のイメージを信頼済みとして記録しました"
            );
            Ok(monitor)
        }
        Err(e) => Err(e.into()),
    }
}

/// 初回計測したファームウェアチェックサムの保存先（`<keystore>.firmware.sha256`）。
fn firmware_pin_path(keystore_path: &Path) -> PathBuf {
    let mut name = keystore_path.as_os_str().to_owned();
    name.push(".firmware.sha256");
    PathBuf::from(name)
}

fn risk_scorer(config: &CliConfig) -> Result<Arc<dyn RiskScorer>, CliError> {
    Ok(match &config.risk_url {
        Some(url) => Arc::new(HttpRiskScorer::new(url.clone(), config.collaborator_timeout)?),
        None => Arc::new(
            ThresholdRiskScorer::network_default().with_threshold(config.risk_threshold),
        ),
    })
}

fn simulated_satellite(
    algorithm: SignatureAlgorithm,
) -> Result<Arc<SimulatedSatellite>, CliError> {
    let identity = SigningKeyPair::generate(algorithm, SATELLITE_KEY_ID)?;
    Ok(Arc::new(SimulatedSatellite::new(
        SATELLITE_KEY_ID,
        Arc::new(identity),
    )))
}

pub fn provision(
    config: &CliConfig,
    label: &str,
    algorithm: SignatureAlgorithm,
) -> Result<(), CliError> {
    let authority = open_authority(config)?;
    let outcome = authority.provision(label, algorithm)?;
    let (algorithm, public_key) = authority.public_key(label)?;
    match outcome {
        ProvisionOutcome::Provisioned => println!("provisioned {label} ({algorithm})"),
        ProvisionOutcome::AlreadyProvisioned => {
            println!("{label} already provisioned ({algorithm})")
        }
    }
    println!("fingerprint: {}", key_fingerprint(&public_key));
    Ok(())
}

pub fn sign(config: &CliConfig, command: &str, label: &str) -> Result<(), CliError> {
    let record = open_authority(config)?.sign_command(command, label)?;
    println!("{}", astra_core::b64_encode(&record.signature));
    Ok(())
}

pub fn verify(
    config: &CliConfig,
    command: &str,
    signature_b64: &str,
    label: &str,
) -> Result<bool, CliError> {
    let signature = astra_core::b64_decode(signature_b64.trim())
        .map_err(|e| CliError::InvalidArgument(format!("署名のBase64デコードに失敗: {e}")))?;
    let valid = open_authority(config)?.verify_command(command, &signature, label)?;
    println!("{}", if valid { "valid" } else { "invalid" });
    Ok(valid)
}

pub fn keys(config: &CliConfig) -> Result<(), CliError> {
    let authority = open_authority(config)?;
    for label in authority.labels()? {
        let (algorithm, public_key) = authority.public_key(&label)?;
        println!("{label}\t{algorithm}\t{}", key_fingerprint(&public_key));
    }
    Ok(())
}

pub fn rotate(config: &CliConfig, label: &str) -> Result<(), CliError> {
    let public_key = open_authority(config)?.rotate(label)?;
    println!("rotated {label}");
    println!("fingerprint: {}", key_fingerprint(&public_key));
    Ok(())
}

/// 認可ゲートを実行し、承認されたかどうかを返す。
///
/// 承認された場合は確立済みチャネルでコマンドを暗号化し、シミュレーション衛星へ配送する。
pub async fn authorize(config: &CliConfig, options: AuthorizeOptions) -> Result<bool, CliError> {
    let authority = open_authority(config)?;
    let integrity: Arc<dyn IntegrityMonitor> = Arc::new(integrity_monitor(config).await?);
    let satellite = simulated_satellite(SignatureAlgorithm::Dilithium5)?;
    let responder =
        Responder::new(Arc::new(Kyber1024)).with_pinned_identity(satellite.signing_public_key());

    let gate = CommandGate::new(
        GateCollaborators {
            integrity,
            risk: risk_scorer(config)?,
            endpoint: satellite.clone(),
        },
        responder,
        authority,
        GateConfig {
            key_label: options.label,
            collaborator_timeout: config.collaborator_timeout,
        },
    );

    let verifier = StaticMfaVerifier::new(config.operators.iter().cloned());
    let clearance = OperatorClearance::obtain(&verifier, &options.operator).await?;

    let mut request = AuthorizationRequest::new(options.command);
    if !options.context.is_empty() {
        request = request.with_context(options.context.into_iter().collect::<RiskFeatures>());
    }

    let mut decision = gate.authorize(&clearance, request).await;
    let export = decision.export();
    println!("{}", serde_json::to_string_pretty(&export)?);

    if let Some(path) = &options.audit_out {
        write_decision_json(path, &export)?;
    }
    if let Some(path) = &options.jsonl {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        write_json_lines(file, decision.audit_events())?;
    }

    if !decision.approved() {
        return Ok(false);
    }

    if let Some(mut session) = decision.take_channel() {
        let sealed = session.channel.seal(decision.command().as_bytes())?;
        let delivered = satellite.receive(&session.session_id, &sealed);
        satellite.close(&session.session_id);
        let delivered = delivered?;
        tracing::info!(
            session_id = %session.session_id,
            bytes = delivered.len(),
            "承認済みコマンドを衛星へ配送しました"
        );
    }
    Ok(true)
}

/// シミュレーション衛星とのチャネル確立のみを実行する。
pub async fn handshake(
    config: &CliConfig,
    pin_identity: bool,
    algorithm: SignatureAlgorithm,
) -> Result<(), CliError> {
    let satellite = simulated_satellite(algorithm)?;
    let mut responder = Responder::new(Arc::new(Kyber1024));
    if pin_identity {
        responder = responder.with_pinned_identity(satellite.signing_public_key());
    }

    let mut session =
        establish_channel(&responder, satellite.as_ref(), config.collaborator_timeout).await?;

    let ping = session.channel.seal(b"PING")?;
    let echoed = satellite.receive(&session.session_id, &ping);
    satellite.close(&session.session_id);
    let echoed = echoed?;
    if echoed != b"PING" {
        return Err(CliError::InvalidArgument(
            "チャネル経由の疎通確認に失敗しました".to_string(),
        ));
    }

    println!("session: {}", session.session_id);
    println!("fingerprint: {}", session.channel.fingerprint());
    println!("assurance: {:?}", session.channel.assurance());
    Ok(())
}

/// JSON Lines形式の監査イベントを読み込む。空行は無視する。
pub fn read_events(path: &Path) -> Result<Vec<AuditRecord>, CliError> {
    let reader = BufReader::new(std::fs::File::open(path)?);
    let mut events = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        events.push(serde_json::from_str(&line)?);
    }
    Ok(events)
}

pub async fn report(
    config: &CliConfig,
    events: Option<&Path>,
    limit: usize,
) -> Result<(), CliError> {
    let authority = open_authority(config)?;
    let monitor = integrity_monitor(config).await?;
    let events = match events {
        Some(path) => read_events(path)?,
        None => Vec::new(),
    };
    let report = astra_core::report::security_report(
        &monitor,
        authority.keystore(),
        &events,
        limit,
        config.collaborator_timeout,
    )
    .await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use astra_types::{AuditStage, Severity};

    use super::*;

    fn test_config(dir: &Path) -> CliConfig {
        CliConfig {
            keystore_path: dir.join("keystore.json"),
            master_key: Some([9u8; 32]),
            firmware_path: None,
            firmware_sha256: None,
            risk_url: None,
            risk_threshold: 0.7,
            collaborator_timeout: Duration::from_secs(5),
            operators: vec!["operator-01".to_string()],
        }
    }

    #[test]
    fn test_parse_feature() {
        assert_eq!(
            parse_feature("latency=50").unwrap(),
            ("latency".to_string(), 50.0)
        );
        assert_eq!(
            parse_feature(" error_rate = 0.001 ").unwrap(),
            ("error_rate".to_string(), 0.001)
        );
        assert!(parse_feature("latency").is_err());
        assert!(parse_feature("=5").is_err());
        assert!(parse_feature("latency=fast").is_err());
        assert!(parse_feature("latency=inf").is_err());
    }

    #[test]
    fn test_check_threshold() {
        assert_eq!(check_threshold(0.5).unwrap(), 0.5);
        assert!(matches!(
            check_threshold(1.2),
            Err(CliError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_key_fingerprint_is_short_hex() {
        let fingerprint = key_fingerprint(b"public key");
        assert_eq!(fingerprint.len(), 16);
        assert_eq!(fingerprint, key_fingerprint(b"public key"));
        assert_ne!(fingerprint, key_fingerprint(b"other key"));
    }

    #[test]
    fn test_sign_then_verify_with_persisted_keystore() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        provision(&config, "operator-01", SignatureAlgorithm::Ed25519).unwrap();
        let record = open_authority(&config)
            .unwrap()
            .sign_command("CMD:PING", "operator-01")
            .unwrap();
        let signature = astra_core::b64_encode(&record.signature);

        assert!(verify(&config, "CMD:PING", &signature, "operator-01").unwrap());
        assert!(!verify(&config, "CMD:PONG", &signature, "operator-01").unwrap());
        assert!(matches!(
            verify(&config, "CMD:PING", "%%%", "operator-01"),
            Err(CliError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_authorize_requires_firmware() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        let options = AuthorizeOptions {
            command: "CMD:PING".to_string(),
            operator: "operator-01".to_string(),
            label: "operator-01".to_string(),
            context: Vec::new(),
            audit_out: None,
            jsonl: None,
        };
        assert!(matches!(
            authorize(&config, options).await,
            Err(CliError::InvalidConfig {
                name: "ASTRA_FIRMWARE_PATH",
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_authorize_writes_audit_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let firmware = dir.path().join("firmware.bin");
        std::fs::write(&firmware, b"ASTRA FLIGHT SOFTWARE").unwrap();
        let mut config = test_config(dir.path());
        config.firmware_path = Some(firmware);
        provision(&config, "operator-01", SignatureAlgorithm::Ed25519).unwrap();

        let audit_out = dir.path().join("decision.json");
        let jsonl = dir.path().join("events.jsonl");
        let options = AuthorizeOptions {
            command: "CMD:SET_ORBIT;SAT:ASTRA-042".to_string(),
            operator: "operator-01".to_string(),
            label: "operator-01".to_string(),
            context: vec![("latency".to_string(), 50.0)],
            audit_out: Some(audit_out.clone()),
            jsonl: Some(jsonl.clone()),
        };
        assert!(authorize(&config, options).await.unwrap());

        let export: astra_types::DecisionExport =
            serde_json::from_slice(&std::fs::read(&audit_out).unwrap()).unwrap();
        assert!(export.approved);
        assert!(export.signature.is_some());

        let events = read_events(&jsonl).unwrap();
        assert_eq!(events.len(), export.events.len());
        let last = events.last().unwrap();
        assert_eq!(last.stage, AuditStage::System);
        assert_eq!(last.severity, Severity::Info);
    }

    #[tokio::test]
    async fn test_authorize_unknown_operator_is_denied() {
        let dir = tempfile::tempdir().unwrap();
        let firmware = dir.path().join("firmware.bin");
        std::fs::write(&firmware, b"ASTRA FLIGHT SOFTWARE").unwrap();
        let mut config = test_config(dir.path());
        config.firmware_path = Some(firmware);

        let options = AuthorizeOptions {
            command: "CMD:PING".to_string(),
            operator: "intruder".to_string(),
            label: "operator-01".to_string(),
            context: Vec::new(),
            audit_out: None,
            jsonl: None,
        };
        assert!(matches!(
            authorize(&config, options).await,
            Err(CliError::Gate(astra_core::GateError::OperatorDenied(_)))
        ));
    }

    #[tokio::test]
    async fn test_firmware_change_between_runs_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let firmware = dir.path().join("firmware.bin");
        std::fs::write(&firmware, b"ASTRA FLIGHT SOFTWARE v1").unwrap();
        let mut config = test_config(dir.path());
        config.firmware_path = Some(firmware.clone());
        provision(&config, "operator-01", SignatureAlgorithm::Ed25519).unwrap();

        let audit_out = dir.path().join("decision.json");
        let options = || AuthorizeOptions {
            command: "CMD:PING".to_string(),
            operator: "operator-01".to_string(),
            label: "operator-01".to_string(),
            context: Vec::new(),
            audit_out: Some(audit_out.clone()),
            jsonl: None,
        };

        assert!(authorize(&config, options()).await.unwrap());
        let pin = std::fs::read_to_string(firmware_pin_path(&config.keystore_path)).unwrap();
        assert_eq!(pin.len(), 64);

        std::fs::write(&firmware, b"ASTRA FLIGHT SOFTWARE v1 (tampered)").unwrap();
        assert!(!authorize(&config, options()).await.unwrap());

        let export: astra_types::DecisionExport =
            serde_json::from_slice(&std::fs::read(&audit_out).unwrap()).unwrap();
        assert!(!export.approved);
        assert_eq!(export.failing_stage, astra_types::FailingStage::Integrity);
    }

    #[tokio::test]
    async fn test_explicit_firmware_checksum_overrides_recorded_one() {
        let dir = tempfile::tempdir().unwrap();
        let firmware = dir.path().join("firmware.bin");
        std::fs::write(&firmware, b"ASTRA FLIGHT SOFTWARE v2").unwrap();
        let mut config = test_config(dir.path());
        config.firmware_path = Some(firmware);
        config.firmware_sha256 = Some("00".repeat(32));

        let monitor = integrity_monitor(&config).await.unwrap();
        assert_eq!(monitor.trusted_checksum(), "00".repeat(32));
        assert!(!firmware_pin_path(&config.keystore_path).exists());
    }

    #[tokio::test]
    async fn test_handshake_with_and_without_pin() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());
        handshake(&config, true, SignatureAlgorithm::Ed25519)
            .await
            .unwrap();
        handshake(&config, false, SignatureAlgorithm::Dilithium5)
            .await
            .unwrap();
    }
}

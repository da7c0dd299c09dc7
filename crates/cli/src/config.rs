//! # CLI設定
//!
//! 環境変数から設定を読み込む。コマンドラインフラグが指定された場合はそちらを優先する。
//!
//! | 環境変数 | 内容 | 既定値 |
//! |---------|------|-------|
//! | `ASTRA_KEYSTORE` | キーストアファイルのパス | `astra-keystore.json` |
//! | `ASTRA_KEYSTORE_MASTER_KEY` | 秘密鍵封印用マスター鍵（Base64、32バイト） | なし（平文保存） |
//! | `ASTRA_FIRMWARE_PATH` | 監視対象のファームウェアイメージ | なし |
//! | `ASTRA_FIRMWARE_SHA256` | 信頼済みチェックサム（hex） | 起動時に計測 |
//! | `ASTRA_RISK_URL` | 外部リスク評価サービスのURL | なし（組み込み評価器） |
//! | `ASTRA_RISK_THRESHOLD` | 組み込み評価器の閾値 | `0.7` |
//! | `ASTRA_COLLABORATOR_TIMEOUT_SECS` | 協調者呼び出しのタイムアウト（秒） | `5` |
//! | `ASTRA_OPERATORS` | 多要素認証を通過済みとみなす操作者ID（カンマ区切り） | `operator-01` |

use std::path::PathBuf;
use std::time::Duration;

use astra_core::collaborators::DEFAULT_RISK_THRESHOLD;
use astra_crypto::SymmetricKey;

use crate::error::CliError;

const DEFAULT_KEYSTORE_PATH: &str = "astra-keystore.json";
const DEFAULT_TIMEOUT_SECS: u64 = 5;
const DEFAULT_OPERATOR: &str = "operator-01";

/// CLI全体の設定。
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub keystore_path: PathBuf,
    pub master_key: Option<SymmetricKey>,
    pub firmware_path: Option<PathBuf>,
    pub firmware_sha256: Option<String>,
    pub risk_url: Option<String>,
    pub risk_threshold: f64,
    pub collaborator_timeout: Duration,
    pub operators: Vec<String>,
}

impl CliConfig {
    /// プロセスの環境変数から読み込む。
    pub fn from_env() -> Result<Self, CliError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// 任意の参照関数から読み込む。
    pub fn from_lookup<F>(lookup: F) -> Result<Self, CliError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let master_key = var("ASTRA_KEYSTORE_MASTER_KEY")
            .map(|value| parse_master_key(&value))
            .transpose()?;

        let risk_threshold = match var("ASTRA_RISK_THRESHOLD") {
            Some(value) => parse_threshold(&value)?,
            None => DEFAULT_RISK_THRESHOLD,
        };

        let timeout_secs = match var("ASTRA_COLLABORATOR_TIMEOUT_SECS") {
            Some(value) => value
                .trim()
                .parse::<u64>()
                .ok()
                .filter(|secs| *secs > 0)
                .ok_or_else(|| CliError::InvalidConfig {
                    name: "ASTRA_COLLABORATOR_TIMEOUT_SECS",
                    reason: format!("正の整数である必要があります: {value}"),
                })?,
            None => DEFAULT_TIMEOUT_SECS,
        };

        let operators = var("ASTRA_OPERATORS")
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_else(|| vec![DEFAULT_OPERATOR.to_string()]);

        Ok(Self {
            keystore_path: var("ASTRA_KEYSTORE")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_KEYSTORE_PATH)),
            master_key,
            firmware_path: var("ASTRA_FIRMWARE_PATH").map(PathBuf::from),
            firmware_sha256: var("ASTRA_FIRMWARE_SHA256"),
            risk_url: var("ASTRA_RISK_URL"),
            risk_threshold,
            collaborator_timeout: Duration::from_secs(timeout_secs),
            operators,
        })
    }
}

fn parse_master_key(value: &str) -> Result<SymmetricKey, CliError> {
    let invalid = |reason: String| CliError::InvalidConfig {
        name: "ASTRA_KEYSTORE_MASTER_KEY",
        reason,
    };
    let bytes = astra_core::b64_decode(value.trim()).map_err(|e| invalid(e.to_string()))?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| invalid(format!("32バイトである必要があります（{}バイト）", b.len())))
}

/// リスク閾値（0.0〜1.0）を解釈する。
pub fn parse_threshold(value: &str) -> Result<f64, CliError> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|t| (0.0..=1.0).contains(t))
        .ok_or_else(|| CliError::InvalidConfig {
            name: "ASTRA_RISK_THRESHOLD",
            reason: format!("0.0〜1.0の数値である必要があります: {value}"),
        })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = CliConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.keystore_path, PathBuf::from("astra-keystore.json"));
        assert!(config.master_key.is_none());
        assert!(config.firmware_path.is_none());
        assert_eq!(config.risk_threshold, 0.7);
        assert_eq!(config.collaborator_timeout, Duration::from_secs(5));
        assert_eq!(config.operators, vec!["operator-01"]);
    }

    #[test]
    fn test_reads_all_variables() {
        let master_key = astra_core::b64_encode(&[7u8; 32]);
        let config = CliConfig::from_lookup(lookup(&[
            ("ASTRA_KEYSTORE", "/var/lib/astra/keys.json"),
            ("ASTRA_KEYSTORE_MASTER_KEY", &master_key),
            ("ASTRA_FIRMWARE_PATH", "/opt/astra/firmware.bin"),
            ("ASTRA_FIRMWARE_SHA256", "ab"),
            ("ASTRA_RISK_URL", "http://hive.local/score"),
            ("ASTRA_RISK_THRESHOLD", "0.5"),
            ("ASTRA_COLLABORATOR_TIMEOUT_SECS", "12"),
            ("ASTRA_OPERATORS", "alice, bob,,"),
        ]))
        .unwrap();

        assert_eq!(config.keystore_path, PathBuf::from("/var/lib/astra/keys.json"));
        assert_eq!(config.master_key, Some([7u8; 32]));
        assert_eq!(config.firmware_path, Some(PathBuf::from("/opt/astra/firmware.bin")));
        assert_eq!(config.firmware_sha256.as_deref(), Some("ab"));
        assert_eq!(config.risk_url.as_deref(), Some("http://hive.local/score"));
        assert_eq!(config.risk_threshold, 0.5);
        assert_eq!(config.collaborator_timeout, Duration::from_secs(12));
        assert_eq!(config.operators, vec!["alice", "bob"]);
    }

    #[test]
    fn test_rejects_invalid_values() {
        let short_key = astra_core::b64_encode(&[1u8; 16]);
        for vars in [
            [("ASTRA_KEYSTORE_MASTER_KEY", short_key.as_str())],
            [("ASTRA_KEYSTORE_MASTER_KEY", "not base64!")],
            [("ASTRA_RISK_THRESHOLD", "1.5")],
            [("ASTRA_RISK_THRESHOLD", "high")],
            [("ASTRA_COLLABORATOR_TIMEOUT_SECS", "0")],
        ] {
            assert!(matches!(
                CliConfig::from_lookup(lookup(&vars)),
                Err(CliError::InvalidConfig { .. })
            ));
        }
    }
}

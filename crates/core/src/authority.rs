//! # コマンド署名機関
//!
//! キーストアの鍵ラベルでコマンドに署名し、署名を検証する。
//! 検証は公開鍵・コマンド・署名のみで完結し、秘密鍵を参照しない。

use std::sync::Arc;

use astra_crypto::SignatureAlgorithm;

use crate::keystore::{Keystore, KeystoreError, ProvisionOutcome};

/// 署名済みコマンド。署名後は変更されない。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandRecord {
    /// コマンド文字列
    pub command: String,
    /// 署名
    pub signature: Vec<u8>,
    /// 署名に使った鍵ラベル
    pub key_id: String,
    /// 署名アルゴリズム
    pub algorithm: SignatureAlgorithm,
}

/// コマンド署名機関。
#[derive(Clone)]
pub struct CommandSigningAuthority {
    keystore: Arc<Keystore>,
}

impl CommandSigningAuthority {
    pub fn new(keystore: Arc<Keystore>) -> Self {
        Self { keystore }
    }

    /// 共有しているキーストア。
    pub fn keystore(&self) -> &Arc<Keystore> {
        &self.keystore
    }

    /// 鍵ラベルがなければ鍵ペアを生成する。既存の鍵は再生成しない。
    pub fn provision(
        &self,
        key_label: &str,
        algorithm: SignatureAlgorithm,
    ) -> Result<ProvisionOutcome, KeystoreError> {
        self.keystore.provision(key_label, algorithm)
    }

    /// コマンドに署名する。
    pub fn sign_command(
        &self,
        command: &str,
        key_label: &str,
    ) -> Result<CommandRecord, KeystoreError> {
        let pair = self.keystore.get(key_label)?;
        let signature = pair.sign(command.as_bytes())?;
        tracing::debug!(key_label, algorithm = %pair.algorithm, "コマンドに署名しました");
        Ok(CommandRecord {
            command: command.to_string(),
            signature,
            key_id: key_label.to_string(),
            algorithm: pair.algorithm,
        })
    }

    /// コマンド署名を検証する。
    ///
    /// 暗号的な不一致は `Ok(false)`、鍵ラベルがなければ `Err(KeyNotFound)`。
    pub fn verify_command(
        &self,
        command: &str,
        signature: &[u8],
        key_label: &str,
    ) -> Result<bool, KeystoreError> {
        let pair = self.keystore.get(key_label)?;
        Ok(pair
            .algorithm
            .scheme()
            .verify(&pair.public_key, command.as_bytes(), signature))
    }

    /// ラベルの公開鍵とアルゴリズム。
    pub fn public_key(
        &self,
        key_label: &str,
    ) -> Result<(SignatureAlgorithm, Vec<u8>), KeystoreError> {
        let pair = self.keystore.get(key_label)?;
        Ok((pair.algorithm, pair.public_key.clone()))
    }

    /// 登録済みラベルの一覧。
    pub fn labels(&self) -> Result<Vec<String>, KeystoreError> {
        self.keystore.labels()
    }

    /// 鍵を消去して再生成する。新しい公開鍵を返す。
    pub fn rotate(&self, key_label: &str) -> Result<Vec<u8>, KeystoreError> {
        Ok(self.keystore.rotate(key_label)?.public_key.clone())
    }

    /// 鍵を消去する。
    pub fn erase(&self, key_label: &str) -> Result<(), KeystoreError> {
        self.keystore.erase(key_label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ORBIT_COMMAND: &str = "CMD:SET_ORBIT;SAT:ASTRA-042;PARAMS:400km,90deg";

    fn authority() -> CommandSigningAuthority {
        CommandSigningAuthority::new(Arc::new(Keystore::in_memory()))
    }

    #[test]
    fn test_sign_and_verify_command() {
        let authority = authority();
        for (label, algorithm) in [
            ("classical", SignatureAlgorithm::Ed25519),
            ("post-quantum", SignatureAlgorithm::Dilithium5),
        ] {
            authority.provision(label, algorithm).unwrap();
            let record = authority.sign_command(ORBIT_COMMAND, label).unwrap();
            assert_eq!(record.key_id, label);
            assert_eq!(record.algorithm, algorithm);
            assert!(authority
                .verify_command(ORBIT_COMMAND, &record.signature, label)
                .unwrap());
        }
    }

    #[test]
    fn test_verify_rejects_altered_command_and_signature() {
        let authority = authority();
        authority.provision("primary", SignatureAlgorithm::Ed25519).unwrap();
        let record = authority.sign_command(ORBIT_COMMAND, "primary").unwrap();

        let altered = ORBIT_COMMAND.replace("400km", "200km");
        assert!(!authority
            .verify_command(&altered, &record.signature, "primary")
            .unwrap());

        let mut flipped = record.signature.clone();
        flipped[5] ^= 0x01;
        assert!(!authority
            .verify_command(ORBIT_COMMAND, &flipped, "primary")
            .unwrap());

        assert!(!authority
            .verify_command(ORBIT_COMMAND, b"short", "primary")
            .unwrap());
    }

    #[test]
    fn test_signature_from_other_label_does_not_verify() {
        let authority = authority();
        authority.provision("a", SignatureAlgorithm::Ed25519).unwrap();
        authority.provision("b", SignatureAlgorithm::Ed25519).unwrap();
        let record = authority.sign_command(ORBIT_COMMAND, "a").unwrap();
        assert!(!authority
            .verify_command(ORBIT_COMMAND, &record.signature, "b")
            .unwrap());
    }

    #[test]
    fn test_unknown_label_is_key_not_found() {
        let authority = authority();
        assert!(matches!(
            authority.verify_command(ORBIT_COMMAND, &[0u8; 64], "nonexistent"),
            Err(KeystoreError::KeyNotFound(label)) if label == "nonexistent"
        ));
        assert!(matches!(
            authority.sign_command(ORBIT_COMMAND, "nonexistent"),
            Err(KeystoreError::KeyNotFound(_))
        ));
    }

    #[test]
    fn test_rotation_invalidates_old_signatures() {
        let authority = authority();
        authority.provision("primary", SignatureAlgorithm::Ed25519).unwrap();
        let record = authority.sign_command(ORBIT_COMMAND, "primary").unwrap();

        let (_, before) = authority.public_key("primary").unwrap();
        let after = authority.rotate("primary").unwrap();
        assert_ne!(before, after);
        assert!(!authority
            .verify_command(ORBIT_COMMAND, &record.signature, "primary")
            .unwrap());
    }
}

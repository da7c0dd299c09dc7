//! # 署名プリミティブ
//!
//! 長期署名鍵の生成・署名・検証を提供する。
//!
//! 検証は純粋関数であり、公開鍵・メッセージ・署名のみを入力とする。
//! 不正な入力（長さ不一致、改ざん、別鍵による署名）はすべて `false` を返し、
//! パニックやエラーにはならない。一方、鍵生成の失敗（乱数源の不在）は
//! `CryptoError::KeyGeneration` として検証失敗と区別して返す。

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{Signer, SigningKey as Ed25519SigningKey, VerifyingKey as Ed25519VerifyingKey};
use pqcrypto_dilithium::dilithium5;
use pqcrypto_traits::sign::{
    DetachedSignature as _, PublicKey as PqPublicKey, SecretKey as PqSecretKey,
};
use zeroize::Zeroizing;

use crate::{fill_random, CryptoError};

/// 署名アルゴリズム識別子。キーストアとバンドルに文字列で記録される。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignatureAlgorithm {
    /// Ed25519（古典）
    Ed25519,
    /// Dilithium5（耐量子）
    Dilithium5,
}

impl SignatureAlgorithm {
    /// 識別子文字列。
    pub fn as_str(self) -> &'static str {
        match self {
            SignatureAlgorithm::Ed25519 => "ed25519",
            SignatureAlgorithm::Dilithium5 => "dilithium5",
        }
    }

    /// 公開鍵のバイト長。
    pub fn public_key_len(self) -> usize {
        match self {
            SignatureAlgorithm::Ed25519 => ed25519_dalek::PUBLIC_KEY_LENGTH,
            SignatureAlgorithm::Dilithium5 => dilithium5::public_key_bytes(),
        }
    }

    /// 秘密鍵のバイト長。
    pub fn private_key_len(self) -> usize {
        match self {
            SignatureAlgorithm::Ed25519 => ed25519_dalek::SECRET_KEY_LENGTH,
            SignatureAlgorithm::Dilithium5 => dilithium5::secret_key_bytes(),
        }
    }

    /// アルゴリズムに対応する署名スキーム実装。
    pub fn scheme(self) -> &'static dyn SignatureScheme {
        match self {
            SignatureAlgorithm::Ed25519 => &Ed25519,
            SignatureAlgorithm::Dilithium5 => &Dilithium5,
        }
    }
}

impl fmt::Display for SignatureAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SignatureAlgorithm {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ed25519" => Ok(SignatureAlgorithm::Ed25519),
            "dilithium5" => Ok(SignatureAlgorithm::Dilithium5),
            other => Err(CryptoError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// 署名スキームのトレイト。
///
/// 実装を差し替えても周辺のプロトコル・キーストアは変更不要。
pub trait SignatureScheme: Send + Sync {
    /// アルゴリズム識別子。
    fn algorithm(&self) -> SignatureAlgorithm;

    /// 独立した新しい鍵ペアを生成する。
    fn generate_keypair(&self, key_id: &str) -> Result<SigningKeyPair, CryptoError>;

    /// 秘密鍵でメッセージに署名する。
    fn sign(&self, private_key: &[u8], message: &[u8]) -> Result<Vec<u8>, CryptoError>;

    /// 公開鍵で署名を検証する。不正な入力は常に `false`。
    fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> bool;
}

// ---------------------------------------------------------------------------
// 鍵ペア
// ---------------------------------------------------------------------------

/// 長期署名鍵ペア。秘密鍵はドロップ時にゼロ化される。
pub struct SigningKeyPair {
    /// 鍵ID（キーストアのラベル）
    pub key_id: String,
    /// アルゴリズム
    pub algorithm: SignatureAlgorithm,
    /// 公開鍵
    pub public_key: Vec<u8>,
    private_key: Zeroizing<Vec<u8>>,
}

impl SigningKeyPair {
    /// 指定アルゴリズムで鍵ペアを生成する。
    pub fn generate(algorithm: SignatureAlgorithm, key_id: &str) -> Result<Self, CryptoError> {
        algorithm.scheme().generate_keypair(key_id)
    }

    /// 永続化された鍵素材から鍵ペアを復元する。鍵長がアルゴリズムと一致しなければ拒否する。
    pub fn from_parts(
        algorithm: SignatureAlgorithm,
        key_id: &str,
        public_key: Vec<u8>,
        private_key: Zeroizing<Vec<u8>>,
    ) -> Result<Self, CryptoError> {
        if public_key.len() != algorithm.public_key_len() {
            return Err(CryptoError::InvalidKey(format!(
                "{algorithm}公開鍵の長さが不正です: {} != {}",
                public_key.len(),
                algorithm.public_key_len()
            )));
        }
        if private_key.len() != algorithm.private_key_len() {
            return Err(CryptoError::InvalidKey(format!(
                "{algorithm}秘密鍵の長さが不正です: {} != {}",
                private_key.len(),
                algorithm.private_key_len()
            )));
        }
        Ok(Self {
            key_id: key_id.to_string(),
            algorithm,
            public_key,
            private_key,
        })
    }

    /// 秘密鍵のバイト列。所有コンポーネントの外に出さないこと。
    pub fn private_key_bytes(&self) -> &[u8] {
        &self.private_key
    }

    /// メッセージに署名する。
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.algorithm.scheme().sign(&self.private_key, message)
    }

    /// 自身の公開鍵で署名を検証する。
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        self.algorithm
            .scheme()
            .verify(&self.public_key, message, signature)
    }
}

impl fmt::Debug for SigningKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKeyPair")
            .field("key_id", &self.key_id)
            .field("algorithm", &self.algorithm)
            .field("public_key_len", &self.public_key.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Ed25519
// ---------------------------------------------------------------------------

/// Ed25519署名スキーム。
pub struct Ed25519;

impl SignatureScheme for Ed25519 {
    fn algorithm(&self) -> SignatureAlgorithm {
        SignatureAlgorithm::Ed25519
    }

    fn generate_keypair(&self, key_id: &str) -> Result<SigningKeyPair, CryptoError> {
        let mut seed = Zeroizing::new([0u8; ed25519_dalek::SECRET_KEY_LENGTH]);
        fill_random(&mut seed[..])?;
        let signing_key = Ed25519SigningKey::from_bytes(&seed);
        Ok(SigningKeyPair {
            key_id: key_id.to_string(),
            algorithm: SignatureAlgorithm::Ed25519,
            public_key: signing_key.verifying_key().to_bytes().to_vec(),
            private_key: Zeroizing::new(seed.to_vec()),
        })
    }

    fn sign(&self, private_key: &[u8], message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let seed: &[u8; ed25519_dalek::SECRET_KEY_LENGTH] = private_key
            .try_into()
            .map_err(|_| {
                CryptoError::InvalidKey("Ed25519秘密鍵は32バイトである必要があります".into())
            })?;
        let signing_key = Ed25519SigningKey::from_bytes(seed);
        Ok(signing_key.sign(message).to_bytes().to_vec())
    }

    fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
        let Ok(pk_bytes) = <&[u8; ed25519_dalek::PUBLIC_KEY_LENGTH]>::try_from(public_key) else {
            return false;
        };
        let Ok(verifying_key) = Ed25519VerifyingKey::from_bytes(pk_bytes) else {
            return false;
        };
        let Ok(signature) = ed25519_dalek::Signature::from_slice(signature) else {
            return false;
        };
        verifying_key.verify_strict(message, &signature).is_ok()
    }
}

// ---------------------------------------------------------------------------
// Dilithium5
// ---------------------------------------------------------------------------

/// Dilithium5署名スキーム（分離署名）。
pub struct Dilithium5;

impl SignatureScheme for Dilithium5 {
    fn algorithm(&self) -> SignatureAlgorithm {
        SignatureAlgorithm::Dilithium5
    }

    fn generate_keypair(&self, key_id: &str) -> Result<SigningKeyPair, CryptoError> {
        let (pk, sk) = dilithium5::keypair();
        Ok(SigningKeyPair {
            key_id: key_id.to_string(),
            algorithm: SignatureAlgorithm::Dilithium5,
            public_key: pk.as_bytes().to_vec(),
            private_key: Zeroizing::new(sk.as_bytes().to_vec()),
        })
    }

    fn sign(&self, private_key: &[u8], message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let sk = dilithium5::SecretKey::from_bytes(private_key)
            .map_err(|e| CryptoError::InvalidKey(format!("Dilithium5秘密鍵が不正です: {e:?}")))?;
        Ok(dilithium5::detached_sign(message, &sk).as_bytes().to_vec())
    }

    fn verify(&self, public_key: &[u8], message: &[u8], signature: &[u8]) -> bool {
        let Ok(pk) = dilithium5::PublicKey::from_bytes(public_key) else {
            return false;
        };
        let Ok(sig) = dilithium5::DetachedSignature::from_bytes(signature) else {
            return false;
        };
        dilithium5::verify_detached_signature(&sig, message, &pk).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COMMAND: &[u8] = b"CMD:SET_ORBIT;SAT:ASTRA-042;PARAMS:400km,90deg";

    fn all_algorithms() -> [SignatureAlgorithm; 2] {
        [SignatureAlgorithm::Ed25519, SignatureAlgorithm::Dilithium5]
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        for alg in all_algorithms() {
            let kp = SigningKeyPair::generate(alg, "op").unwrap();
            let sig = kp.sign(COMMAND).unwrap();
            assert!(kp.verify(COMMAND, &sig), "{alg}");
            assert!(alg.scheme().verify(&kp.public_key, COMMAND, &sig), "{alg}");
        }
    }

    #[test]
    fn test_wrong_message_fails() {
        for alg in all_algorithms() {
            let kp = SigningKeyPair::generate(alg, "op").unwrap();
            let sig = kp.sign(COMMAND).unwrap();
            assert!(!kp.verify(b"CMD:SET_ORBIT;SAT:ASTRA-042;PARAMS:800km,90deg", &sig), "{alg}");
        }
    }

    #[test]
    fn test_bit_flip_fails() {
        for alg in all_algorithms() {
            let kp = SigningKeyPair::generate(alg, "op").unwrap();
            let sig = kp.sign(COMMAND).unwrap();
            for idx in [0, sig.len() / 2, sig.len() - 1] {
                let mut corrupted = sig.clone();
                corrupted[idx] ^= 1;
                assert!(!kp.verify(COMMAND, &corrupted), "{alg} byte {idx}");
            }
        }
    }

    #[test]
    fn test_foreign_key_fails() {
        for alg in all_algorithms() {
            let signer = SigningKeyPair::generate(alg, "a").unwrap();
            let other = SigningKeyPair::generate(alg, "b").unwrap();
            assert_ne!(signer.public_key, other.public_key);
            let sig = signer.sign(COMMAND).unwrap();
            assert!(!other.verify(COMMAND, &sig), "{alg}");
        }
    }

    #[test]
    fn test_malformed_inputs_return_false() {
        for alg in all_algorithms() {
            let scheme = alg.scheme();
            assert!(!scheme.verify(&[], COMMAND, &[]));
            assert!(!scheme.verify(&[0u8; 7], COMMAND, &[0u8; 64]));
            let kp = SigningKeyPair::generate(alg, "op").unwrap();
            assert!(!scheme.verify(&kp.public_key, COMMAND, &[0u8; 3]));
        }
    }

    #[test]
    fn test_sign_rejects_malformed_private_key() {
        for alg in all_algorithms() {
            let result = alg.scheme().sign(&[1, 2, 3], COMMAND);
            assert!(matches!(result, Err(CryptoError::InvalidKey(_))), "{alg}");
        }
    }

    #[test]
    fn test_from_parts_validates_lengths() {
        let kp = SigningKeyPair::generate(SignatureAlgorithm::Ed25519, "op").unwrap();
        let restored = SigningKeyPair::from_parts(
            SignatureAlgorithm::Ed25519,
            "op",
            kp.public_key.clone(),
            Zeroizing::new(kp.private_key_bytes().to_vec()),
        )
        .unwrap();
        assert!(restored.verify(COMMAND, &kp.sign(COMMAND).unwrap()));

        // Ed25519の鍵素材をDilithium5として読み込むと拒否される
        let result = SigningKeyPair::from_parts(
            SignatureAlgorithm::Dilithium5,
            "op",
            kp.public_key.clone(),
            Zeroizing::new(kp.private_key_bytes().to_vec()),
        );
        assert!(matches!(result, Err(CryptoError::InvalidKey(_))));
    }

    #[test]
    fn test_algorithm_names() {
        for alg in all_algorithms() {
            assert_eq!(alg.as_str().parse::<SignatureAlgorithm>().unwrap(), alg);
        }
        assert!(matches!(
            "rsa2048".parse::<SignatureAlgorithm>(),
            Err(CryptoError::UnsupportedAlgorithm(_))
        ));
    }
}

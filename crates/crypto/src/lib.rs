//! # Astra 暗号処理
//!
//! コマンド署名とハイブリッド鍵確立で使用する暗号プリミティブを提供する。
//!
//! ## 暗号アルゴリズム
//! | 用途 | アルゴリズム |
//! |------|------------|
//! | 署名（古典） | Ed25519 |
//! | 署名（耐量子） | Dilithium5 |
//! | 鍵カプセル化 | Kyber-1024 |
//! | 鍵交換（古典） | X25519 ECDH |
//! | 鍵導出 | HKDF-SHA256 |
//! | 鍵確認 | HMAC-SHA256 |
//! | 対称暗号 | AES-256-GCM |
//! | ハッシュ | SHA-256 |

pub mod kem;
pub mod sign;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret as X25519StaticSecret};

pub use kem::{Encapsulation, KemKeyPair, KeyEncapsulation, Kyber1024};
pub use sign::{Dilithium5, Ed25519, SignatureAlgorithm, SignatureScheme, SigningKeyPair};
pub use zeroize::Zeroizing;

/// 暗号処理のエラー型
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// 乱数源が利用できない（鍵生成の致命的失敗）
    #[error("鍵生成に失敗しました（乱数源が利用できません）: {0}")]
    KeyGeneration(String),
    /// 鍵のバイト列が不正（長さ不一致等）
    #[error("鍵が不正です: {0}")]
    InvalidKey(String),
    /// KEM暗号文のバイト列が不正
    #[error("KEM暗号文が不正です: {0}")]
    InvalidCiphertext(String),
    /// 未対応のアルゴリズム識別子
    #[error("未対応のアルゴリズム: {0}")]
    UnsupportedAlgorithm(String),
    /// ECDH鍵交換エラー（非寄与的な共有秘密）
    #[error("ECDH鍵交換に失敗しました")]
    EcdhError,
    /// HKDF鍵導出エラー
    #[error("HKDF鍵導出に失敗しました: {0}")]
    HkdfError(String),
    /// AES-GCM暗号化エラー
    #[error("AES-GCM暗号化に失敗しました")]
    EncryptError,
    /// AES-GCM復号エラー
    #[error("AES-GCM復号に失敗しました")]
    DecryptError,
}

/// 対称鍵（AES-256用、32バイト）
pub type SymmetricKey = [u8; 32];

/// AES-GCM nonceの長さ（バイト）
pub const AES_GCM_NONCE_LEN: usize = 12;

/// OS乱数源でバッファを埋める。
///
/// 乱数源の失敗は `CryptoError::KeyGeneration` として返す。
pub fn fill_random(buf: &mut [u8]) -> Result<(), CryptoError> {
    OsRng
        .try_fill_bytes(buf)
        .map_err(|e| CryptoError::KeyGeneration(e.to_string()))
}

/// SHA-256ハッシュ計算。
pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

/// 複数の断片を連結した列のSHA-256ハッシュ。
pub fn sha256_concat(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    let result = hasher.finalize();
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

/// HKDF-SHA256による対称鍵の導出。
pub fn hkdf_derive_key(input_key: &[u8], info: &[u8]) -> Result<SymmetricKey, CryptoError> {
    let hkdf = Hkdf::<Sha256>::new(None, input_key);
    let mut key = [0u8; 32];
    hkdf.expand(info, &mut key)
        .map_err(|e| CryptoError::HkdfError(e.to_string()))?;
    Ok(key)
}

/// HMAC-SHA256タグの計算。
pub fn hmac_sha256(key: &SymmetricKey, message: &[u8]) -> Result<[u8; 32], CryptoError> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
    mac.update(message);
    Ok(mac.finalize().into_bytes().into())
}

/// HMAC-SHA256タグの定数時間検証。
pub fn hmac_sha256_verify(key: &SymmetricKey, message: &[u8], tag: &[u8]) -> bool {
    let Ok(mut mac) = <Hmac<Sha256> as Mac>::new_from_slice(key) else {
        return false;
    };
    mac.update(message);
    mac.verify_slice(tag).is_ok()
}

/// AES-256-GCMによる暗号化（関連データ付き）。
pub fn aes_gcm_encrypt(
    key: &SymmetricKey,
    nonce: &[u8; AES_GCM_NONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::EncryptError)?;
    let nonce = Nonce::from_slice(nonce);
    cipher
        .encrypt(nonce, Payload { msg: plaintext, aad })
        .map_err(|_| CryptoError::EncryptError)
}

/// AES-256-GCMによる復号（関連データ付き）。
pub fn aes_gcm_decrypt(
    key: &SymmetricKey,
    nonce: &[u8; AES_GCM_NONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::DecryptError)?;
    let nonce = Nonce::from_slice(nonce);
    cipher
        .decrypt(nonce, Payload { msg: ciphertext, aad })
        .map_err(|_| CryptoError::DecryptError)
}

/// セッション単位のX25519鍵。ハイブリッド秘密の古典成分に使用する。
pub struct X25519Ephemeral {
    secret: X25519StaticSecret,
    public: X25519PublicKey,
}

impl X25519Ephemeral {
    /// OS乱数源から新しい鍵を生成する。
    pub fn generate() -> Result<Self, CryptoError> {
        let mut seed = Zeroizing::new([0u8; 32]);
        fill_random(&mut seed[..])?;
        let secret = X25519StaticSecret::from(*seed);
        let public = X25519PublicKey::from(&secret);
        Ok(Self { secret, public })
    }

    /// 公開鍵（32バイト）。
    pub fn public_key(&self) -> [u8; 32] {
        self.public.to_bytes()
    }

    /// 相手の公開鍵とのECDH共有秘密を導出する。
    ///
    /// 低位数点などによる非寄与的な結果は拒否する。
    pub fn diffie_hellman(&self, peer_public: &[u8]) -> Result<Zeroizing<[u8; 32]>, CryptoError> {
        let peer: [u8; 32] = peer_public
            .try_into()
            .map_err(|_| {
                CryptoError::InvalidKey("X25519公開鍵は32バイトである必要があります".into())
            })?;
        let shared = self.secret.diffie_hellman(&X25519PublicKey::from(peer));
        if !shared.was_contributory() {
            return Err(CryptoError::EcdhError);
        }
        Ok(Zeroizing::new(*shared.as_bytes()))
    }
}

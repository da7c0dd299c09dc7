//! # 鍵カプセル化プリミティブ
//!
//! セッションごとの短命なKEM鍵ペアを扱う。
//!
//! Kyber-1024は暗黙的拒否を採用しており、改ざん・他者宛ての暗号文を
//! 復号しても長さが正しければエラーにはならず、正規の相手とは一致しない
//! 共有秘密が返る。この不一致はチャネル確立時の鍵確認で検出される。

use pqcrypto_kyber::kyber1024;
use pqcrypto_traits::kem::{
    Ciphertext as _, PublicKey as PqPublicKey, SecretKey as PqSecretKey, SharedSecret as _,
};
use zeroize::Zeroizing;

use crate::CryptoError;

/// KEM鍵ペア。秘密鍵はドロップ時にゼロ化される。
pub struct KemKeyPair {
    /// 公開鍵
    pub public_key: Vec<u8>,
    private_key: Zeroizing<Vec<u8>>,
}

impl KemKeyPair {
    /// 秘密鍵のバイト列。
    pub fn private_key_bytes(&self) -> &[u8] {
        &self.private_key
    }
}

/// カプセル化の結果。
pub struct Encapsulation {
    /// 相手に送信する暗号文
    pub ciphertext: Vec<u8>,
    /// 共有秘密（送信しない）
    pub shared_secret: Zeroizing<Vec<u8>>,
}

/// 鍵カプセル化メカニズムのトレイト。
pub trait KeyEncapsulation: Send + Sync {
    /// アルゴリズム名。
    fn name(&self) -> &'static str;

    /// 新しい鍵ペアを生成する。
    fn generate_keypair(&self) -> KemKeyPair;

    /// 公開鍵に対して新しい共有秘密をカプセル化する。呼び出しごとに独立した秘密を返す。
    fn encapsulate(&self, public_key: &[u8]) -> Result<Encapsulation, CryptoError>;

    /// 暗号文を秘密鍵で復号し、共有秘密を得る。
    fn decapsulate(
        &self,
        ciphertext: &[u8],
        private_key: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError>;
}

/// Kyber-1024 KEM。
pub struct Kyber1024;

impl KeyEncapsulation for Kyber1024 {
    fn name(&self) -> &'static str {
        "kyber1024"
    }

    fn generate_keypair(&self) -> KemKeyPair {
        let (pk, sk) = kyber1024::keypair();
        KemKeyPair {
            public_key: pk.as_bytes().to_vec(),
            private_key: Zeroizing::new(sk.as_bytes().to_vec()),
        }
    }

    fn encapsulate(&self, public_key: &[u8]) -> Result<Encapsulation, CryptoError> {
        let pk = kyber1024::PublicKey::from_bytes(public_key)
            .map_err(|e| CryptoError::InvalidKey(format!("Kyber-1024公開鍵が不正です: {e:?}")))?;
        let (ss, ct) = kyber1024::encapsulate(&pk);
        Ok(Encapsulation {
            ciphertext: ct.as_bytes().to_vec(),
            shared_secret: Zeroizing::new(ss.as_bytes().to_vec()),
        })
    }

    fn decapsulate(
        &self,
        ciphertext: &[u8],
        private_key: &[u8],
    ) -> Result<Zeroizing<Vec<u8>>, CryptoError> {
        let sk = kyber1024::SecretKey::from_bytes(private_key)
            .map_err(|e| CryptoError::InvalidKey(format!("Kyber-1024秘密鍵が不正です: {e:?}")))?;
        let ct = kyber1024::Ciphertext::from_bytes(ciphertext).map_err(|e| {
            CryptoError::InvalidCiphertext(format!("Kyber-1024暗号文が不正です: {e:?}"))
        })?;
        let ss = kyber1024::decapsulate(&ct, &sk);
        Ok(Zeroizing::new(ss.as_bytes().to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kem_roundtrip() {
        let kp = Kyber1024.generate_keypair();
        let encap = Kyber1024.encapsulate(&kp.public_key).unwrap();
        let recovered = Kyber1024
            .decapsulate(&encap.ciphertext, kp.private_key_bytes())
            .unwrap();
        assert_eq!(*encap.shared_secret, *recovered);
    }

    #[test]
    fn test_encapsulation_is_fresh() {
        let kp = Kyber1024.generate_keypair();
        let first = Kyber1024.encapsulate(&kp.public_key).unwrap();
        let second = Kyber1024.encapsulate(&kp.public_key).unwrap();
        assert_ne!(first.ciphertext, second.ciphertext);
        assert_ne!(*first.shared_secret, *second.shared_secret);
    }

    #[test]
    fn test_foreign_ciphertext_never_matches() {
        let kp1 = Kyber1024.generate_keypair();
        let kp2 = Kyber1024.generate_keypair();
        let encap = Kyber1024.encapsulate(&kp1.public_key).unwrap();

        // 暗黙的拒否: エラーにはならないが一致しない
        let wrong = Kyber1024
            .decapsulate(&encap.ciphertext, kp2.private_key_bytes())
            .unwrap();
        assert_ne!(*encap.shared_secret, *wrong);
    }

    #[test]
    fn test_corrupted_ciphertext_never_matches() {
        let kp = Kyber1024.generate_keypair();
        let encap = Kyber1024.encapsulate(&kp.public_key).unwrap();
        let mut corrupted = encap.ciphertext.clone();
        corrupted[0] ^= 0x80;
        let recovered = Kyber1024.decapsulate(&corrupted, kp.private_key_bytes()).unwrap();
        assert_ne!(*encap.shared_secret, *recovered);
    }

    #[test]
    fn test_malformed_inputs_fail_explicitly() {
        let kp = Kyber1024.generate_keypair();
        assert!(matches!(
            Kyber1024.encapsulate(&[0u8; 12]),
            Err(CryptoError::InvalidKey(_))
        ));
        assert!(matches!(
            Kyber1024.decapsulate(&[0u8; 12], kp.private_key_bytes()),
            Err(CryptoError::InvalidCiphertext(_))
        ));
    }
}

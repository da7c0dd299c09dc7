//! 確立済みチャネルとハイブリッド秘密。

use std::fmt;

use astra_crypto::{
    aes_gcm_decrypt, aes_gcm_encrypt, hkdf_derive_key, sha256, sha256_concat, SymmetricKey,
    Zeroizing, AES_GCM_NONCE_LEN,
};
use serde::{Deserialize, Serialize};

use super::{ChannelError, IdentityAssurance};

const TRAFFIC_INFO_I2R: &[u8] = b"astra-wave-traffic/initiator-to-responder";
const TRAFFIC_INFO_R2I: &[u8] = b"astra-wave-traffic/responder-to-initiator";

/// セッション指紋に使用するハッシュ先頭バイト数。
const FINGERPRINT_LEN: usize = 8;

/// 耐量子成分と古典成分から導出したセッション秘密。
///
/// `derived = SHA-256(pqc_component || classical_component)`。
/// 全フィールドはドロップ時にゼロ化され、送信されることはない。
pub struct HybridSecret {
    pqc_component: Zeroizing<Vec<u8>>,
    classical_component: Zeroizing<Vec<u8>>,
    derived: Zeroizing<[u8; 32]>,
}

impl HybridSecret {
    /// 2成分を混合する。
    pub fn combine(pqc_component: &[u8], classical_component: &[u8]) -> Self {
        let derived = sha256_concat(&[pqc_component, classical_component]);
        Self {
            pqc_component: Zeroizing::new(pqc_component.to_vec()),
            classical_component: Zeroizing::new(classical_component.to_vec()),
            derived: Zeroizing::new(derived),
        }
    }

    /// 耐量子成分（KEM共有秘密）。
    pub fn pqc_component(&self) -> &[u8] {
        &self.pqc_component
    }

    /// 古典成分（X25519共有秘密）。
    pub fn classical_component(&self) -> &[u8] {
        &self.classical_component
    }

    /// 導出秘密。
    pub fn derived(&self) -> &[u8; 32] {
        &self.derived
    }

    /// 監査ログ用の指紋（`SHA-256(derived)` 先頭8バイトのhex）。
    pub fn fingerprint(&self) -> String {
        hex::encode(&sha256(self.derived.as_slice())[..FINGERPRINT_LEN])
    }
}

impl fmt::Debug for HybridSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HybridSecret")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}

/// チャネル上での自身の役割。送受信の方向鍵を決める。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    /// バンドルを提示した側（衛星）
    Initiator,
    /// バンドルを検証した側（地上局）
    Responder,
}

/// 確立済みチャネル上で送受信する暗号化メッセージ。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedMessage {
    /// 送信カウンタ（nonceの導出元）
    pub counter: u64,
    /// AES-256-GCM暗号文（タグ込み）
    pub ciphertext: Vec<u8>,
}

/// 双方の鍵確認を通過したチャネル。
///
/// 方向ごとに `HKDF(derived, "astra-wave-traffic/...")` で導出したAES-256-GCM鍵を使い、
/// nonceは送信カウンタから組み立てる。受信側はカウンタの単調増加を要求し、
/// 再送・並べ替えを拒否する。
pub struct EstablishedChannel {
    secret: HybridSecret,
    transcript: [u8; 32],
    assurance: IdentityAssurance,
    role: ChannelRole,
    send_key: Zeroizing<SymmetricKey>,
    recv_key: Zeroizing<SymmetricKey>,
    send_counter: u64,
    recv_next: u64,
}

impl EstablishedChannel {
    pub(crate) fn new(
        secret: HybridSecret,
        transcript: [u8; 32],
        assurance: IdentityAssurance,
        role: ChannelRole,
    ) -> Result<Self, ChannelError> {
        let i2r = Zeroizing::new(hkdf_derive_key(secret.derived(), TRAFFIC_INFO_I2R)?);
        let r2i = Zeroizing::new(hkdf_derive_key(secret.derived(), TRAFFIC_INFO_R2I)?);
        let (send_key, recv_key) = match role {
            ChannelRole::Initiator => (i2r, r2i),
            ChannelRole::Responder => (r2i, i2r),
        };
        Ok(Self {
            secret,
            transcript,
            assurance,
            role,
            send_key,
            recv_key,
            send_counter: 0,
            recv_next: 0,
        })
    }

    /// ハイブリッド秘密。
    pub fn secret(&self) -> &HybridSecret {
        &self.secret
    }

    /// セッション指紋。
    pub fn fingerprint(&self) -> String {
        self.secret.fingerprint()
    }

    /// 相手のアイデンティティ保証レベル。
    pub fn assurance(&self) -> IdentityAssurance {
        self.assurance
    }

    /// 自身の役割。
    pub fn role(&self) -> ChannelRole {
        self.role
    }

    /// ペイロードを暗号化する。トランスクリプトを関連データとして束縛する。
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<SealedMessage, ChannelError> {
        let counter = self.send_counter;
        self.send_counter = counter
            .checked_add(1)
            .ok_or(ChannelError::CounterExhausted)?;
        let ciphertext = aes_gcm_encrypt(
            &self.send_key,
            &counter_nonce(counter),
            plaintext,
            &self.transcript,
        )?;
        Ok(SealedMessage {
            counter,
            ciphertext,
        })
    }

    /// 相手からのメッセージを復号する。
    pub fn open(&mut self, message: &SealedMessage) -> Result<Vec<u8>, ChannelError> {
        if message.counter < self.recv_next {
            return Err(ChannelError::Replay {
                counter: message.counter,
            });
        }
        let plaintext = aes_gcm_decrypt(
            &self.recv_key,
            &counter_nonce(message.counter),
            &message.ciphertext,
            &self.transcript,
        )?;
        self.recv_next = message
            .counter
            .checked_add(1)
            .ok_or(ChannelError::CounterExhausted)?;
        Ok(plaintext)
    }
}

impl fmt::Debug for EstablishedChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EstablishedChannel")
            .field("fingerprint", &self.fingerprint())
            .field("assurance", &self.assurance)
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

fn counter_nonce(counter: u64) -> [u8; AES_GCM_NONCE_LEN] {
    let mut nonce = [0u8; AES_GCM_NONCE_LEN];
    nonce[AES_GCM_NONCE_LEN - 8..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

//! ハンドシェイクの各ステップ。

use std::sync::Arc;

use astra_crypto::{
    hkdf_derive_key, hmac_sha256, hmac_sha256_verify, sha256_concat, CryptoError, KemKeyPair,
    KeyEncapsulation, SignatureAlgorithm, SigningKeyPair, X25519Ephemeral, Zeroizing,
};
use astra_types::{ChannelResponse, KeyConfirmation, SignedPublicKeyBundle};
use serde::{Deserialize, Serialize};

use super::session::{ChannelRole, EstablishedChannel, HybridSecret};
use crate::{b64_decode, b64_encode};

/// バンドル署名のドメイン分離タグ。
const BUNDLE_DOMAIN: &[u8] = b"astra-wave-bundle-v1";
const CONFIRM_INFO: &[u8] = b"astra-wave-key-confirm";
const RESPONDER_LABEL: &[u8] = b"responder";
const INITIATOR_LABEL: &[u8] = b"initiator";

/// チャネル確立のエラー型
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// メッセージの形式が不正（Base64、鍵長等）
    #[error("ハンドシェイクメッセージが不正です: {0}")]
    MalformedMessage(String),
    /// バンドル署名の検証に失敗
    #[error("公開鍵バンドルの署名検証に失敗しました")]
    BundleSignatureInvalid,
    /// ピン留めされた署名公開鍵と一致しない
    #[error("署名公開鍵がピン留めされたアイデンティティと一致しません")]
    IdentityMismatch,
    /// 鍵確認タグの不一致（導出秘密が一致しない）
    #[error("鍵確認に失敗しました（導出秘密が一致しません）")]
    KeyConfirmationFailed,
    /// 受信カウンタの逆行（再送・並べ替え）
    #[error("再送されたメッセージです: counter={counter}")]
    Replay { counter: u64 },
    /// 送受信カウンタの枯渇
    #[error("メッセージカウンタが上限に達しました")]
    CounterExhausted,
    /// 暗号処理エラー
    #[error("暗号処理エラー: {0}")]
    Crypto(#[from] CryptoError),
    /// リモートエンドポイントとの通信エラー
    #[error("リモートエンドポイントとの通信に失敗しました: {0}")]
    Transport(String),
    /// チャネル確立が制限時間内に終わらなかった
    #[error("チャネル確立がタイムアウトしました（{0:?}）")]
    Timeout(std::time::Duration),
}

/// 相手のアイデンティティに関する保証レベル。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IdentityAssurance {
    /// KEM鍵が提示された署名公開鍵に結び付いていることのみを保証する
    BindingOnly,
    /// 署名公開鍵が事前にピン留めされた鍵と一致した
    Pinned,
}

/// バンドル署名の対象ダイジェスト。
///
/// `SHA-256(domain || len(kem_pk) || kem_pk || classical_pk)`。
pub fn bundle_digest(kem_public_key: &[u8], classical_public_key: &[u8]) -> [u8; 32] {
    let kem_len = (kem_public_key.len() as u32).to_be_bytes();
    sha256_concat(&[
        BUNDLE_DOMAIN,
        kem_len.as_slice(),
        kem_public_key,
        classical_public_key,
    ])
}

fn transcript_hash(digest: &[u8; 32], ciphertext: &[u8], responder_classical: &[u8]) -> [u8; 32] {
    sha256_concat(&[digest.as_slice(), ciphertext, responder_classical])
}

fn confirmation_tag(
    secret: &HybridSecret,
    label: &[u8],
    transcript: &[u8; 32],
) -> Result<[u8; 32], ChannelError> {
    let key = Zeroizing::new(hkdf_derive_key(secret.derived(), CONFIRM_INFO)?);
    Ok(hmac_sha256(&key, &[label, transcript.as_slice()].concat())?)
}

fn confirmation_matches(
    secret: &HybridSecret,
    label: &[u8],
    transcript: &[u8; 32],
    tag: &[u8],
) -> Result<bool, ChannelError> {
    let key = Zeroizing::new(hkdf_derive_key(secret.derived(), CONFIRM_INFO)?);
    Ok(hmac_sha256_verify(
        &key,
        &[label, transcript.as_slice()].concat(),
        tag,
    ))
}

// ---------------------------------------------------------------------------
// メッセージ（バイト列表現）
// ---------------------------------------------------------------------------

/// 署名付き公開鍵バンドル（デコード済み）。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyBundle {
    pub signing_algorithm: SignatureAlgorithm,
    pub signing_public_key: Vec<u8>,
    pub kem_public_key: Vec<u8>,
    pub classical_public_key: Vec<u8>,
    pub signature: Vec<u8>,
}

impl KeyBundle {
    /// 署名対象のダイジェスト。
    pub fn digest(&self) -> [u8; 32] {
        bundle_digest(&self.kem_public_key, &self.classical_public_key)
    }

    /// ワイヤ形式へ変換する。
    pub fn to_wire(&self) -> SignedPublicKeyBundle {
        SignedPublicKeyBundle {
            signing_algorithm: self.signing_algorithm.as_str().to_string(),
            signing_public_key: b64_encode(&self.signing_public_key),
            kem_public_key: b64_encode(&self.kem_public_key),
            classical_public_key: b64_encode(&self.classical_public_key),
            signature: b64_encode(&self.signature),
        }
    }

    /// ワイヤ形式からデコードする。署名の検証は行わない。
    pub fn from_wire(wire: &SignedPublicKeyBundle) -> Result<Self, ChannelError> {
        let signing_algorithm = wire
            .signing_algorithm
            .parse::<SignatureAlgorithm>()
            .map_err(|e| ChannelError::MalformedMessage(e.to_string()))?;
        Ok(Self {
            signing_algorithm,
            signing_public_key: decode_field("signing_public_key", &wire.signing_public_key)?,
            kem_public_key: decode_field("kem_public_key", &wire.kem_public_key)?,
            classical_public_key: decode_field("classical_public_key", &wire.classical_public_key)?,
            signature: decode_field("signature", &wire.signature)?,
        })
    }
}

/// レスポンダの応答（デコード済み）。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeReply {
    pub ciphertext: Vec<u8>,
    pub classical_public_key: Vec<u8>,
    pub confirmation: Vec<u8>,
}

impl HandshakeReply {
    /// ワイヤ形式へ変換する。
    pub fn to_wire(&self) -> ChannelResponse {
        ChannelResponse {
            ciphertext: b64_encode(&self.ciphertext),
            classical_public_key: b64_encode(&self.classical_public_key),
            confirmation: b64_encode(&self.confirmation),
        }
    }

    /// ワイヤ形式からデコードする。
    pub fn from_wire(wire: &ChannelResponse) -> Result<Self, ChannelError> {
        Ok(Self {
            ciphertext: decode_field("ciphertext", &wire.ciphertext)?,
            classical_public_key: decode_field("classical_public_key", &wire.classical_public_key)?,
            confirmation: decode_field("confirmation", &wire.confirmation)?,
        })
    }
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>, ChannelError> {
    b64_decode(value).map_err(|e| ChannelError::MalformedMessage(format!("{name}: {e}")))
}

// ---------------------------------------------------------------------------
// イニシエータ
// ---------------------------------------------------------------------------

/// 長期署名アイデンティティを持つ側（衛星）。
pub struct Initiator {
    identity: Arc<SigningKeyPair>,
    kem: Arc<dyn KeyEncapsulation>,
}

impl Initiator {
    pub fn new(identity: Arc<SigningKeyPair>, kem: Arc<dyn KeyEncapsulation>) -> Self {
        Self { identity, kem }
    }

    /// 長期署名公開鍵。地上局がピン留めに使う。
    pub fn signing_public_key(&self) -> &[u8] {
        &self.identity.public_key
    }

    /// 新しいセッションを開始し、送信する署名付きバンドルを返す。
    ///
    /// 呼び出しごとに新しいKEM鍵ペアとX25519鍵を生成する。
    pub fn start_session(&self) -> Result<(InitiatorSession, KeyBundle), ChannelError> {
        let kem_keypair = self.kem.generate_keypair();
        let classical = X25519Ephemeral::generate()?;
        let classical_public_key = classical.public_key().to_vec();

        let digest = bundle_digest(&kem_keypair.public_key, &classical_public_key);
        let signature = self.identity.sign(&digest)?;

        let bundle = KeyBundle {
            signing_algorithm: self.identity.algorithm,
            signing_public_key: self.identity.public_key.clone(),
            kem_public_key: kem_keypair.public_key.clone(),
            classical_public_key,
            signature,
        };
        let session = InitiatorSession {
            kem: Arc::clone(&self.kem),
            kem_keypair,
            classical,
            digest,
        };
        Ok((session, bundle))
    }
}

/// イニシエータ側の進行中セッション。応答を受け取ると消費される。
pub struct InitiatorSession {
    kem: Arc<dyn KeyEncapsulation>,
    kem_keypair: KemKeyPair,
    classical: X25519Ephemeral,
    digest: [u8; 32],
}

impl InitiatorSession {
    /// レスポンダの応答を処理し、鍵確認に成功した場合のみチャネルと自身の確認タグを返す。
    ///
    /// イニシエータ側から見た相手は認証されていないため保証レベルは `BindingOnly`。
    pub fn finish(
        self,
        reply: &HandshakeReply,
    ) -> Result<(EstablishedChannel, Vec<u8>), ChannelError> {
        let pqc_secret = self
            .kem
            .decapsulate(&reply.ciphertext, self.kem_keypair.private_key_bytes())?;
        let classical_secret = self.classical.diffie_hellman(&reply.classical_public_key)?;
        let secret = HybridSecret::combine(&pqc_secret, classical_secret.as_slice());

        let transcript =
            transcript_hash(&self.digest, &reply.ciphertext, &reply.classical_public_key);
        let confirmed =
            confirmation_matches(&secret, RESPONDER_LABEL, &transcript, &reply.confirmation)?;
        if !confirmed {
            tracing::warn!("レスポンダの鍵確認タグが一致しません。セッションを破棄します");
            return Err(ChannelError::KeyConfirmationFailed);
        }

        let tag = confirmation_tag(&secret, INITIATOR_LABEL, &transcript)?;
        let channel = EstablishedChannel::new(
            secret,
            transcript,
            IdentityAssurance::BindingOnly,
            ChannelRole::Initiator,
        )?;
        Ok((channel, tag.to_vec()))
    }
}

// ---------------------------------------------------------------------------
// レスポンダ
// ---------------------------------------------------------------------------

/// バンドルを検証する側（地上局）。
pub struct Responder {
    kem: Arc<dyn KeyEncapsulation>,
    pinned_identity: Option<Vec<u8>>,
}

impl Responder {
    /// ピン留めなしのレスポンダ。
    pub fn new(kem: Arc<dyn KeyEncapsulation>) -> Self {
        Self {
            kem,
            pinned_identity: None,
        }
    }

    /// 相手の署名公開鍵をピン留めする。
    pub fn with_pinned_identity(mut self, signing_public_key: Vec<u8>) -> Self {
        self.pinned_identity = Some(signing_public_key);
        self
    }

    /// バンドルを検証し、カプセル化して応答を組み立てる。
    ///
    /// 署名検証に失敗した場合は秘密を一切生成せずに終了する。
    pub fn respond(
        &self,
        bundle: &KeyBundle,
    ) -> Result<(PendingChannel, HandshakeReply), ChannelError> {
        let digest = bundle.digest();
        let scheme = bundle.signing_algorithm.scheme();
        if !scheme.verify(&bundle.signing_public_key, &digest, &bundle.signature) {
            tracing::warn!(
                algorithm = %bundle.signing_algorithm,
                "公開鍵バンドルの署名検証に失敗しました"
            );
            return Err(ChannelError::BundleSignatureInvalid);
        }

        let assurance = match &self.pinned_identity {
            Some(pinned) if *pinned != bundle.signing_public_key => {
                tracing::warn!("署名公開鍵がピン留めされた鍵と一致しません");
                return Err(ChannelError::IdentityMismatch);
            }
            Some(_) => IdentityAssurance::Pinned,
            None => IdentityAssurance::BindingOnly,
        };

        let encapsulation = self.kem.encapsulate(&bundle.kem_public_key)?;
        let classical = X25519Ephemeral::generate()?;
        let classical_secret = classical.diffie_hellman(&bundle.classical_public_key)?;
        let secret =
            HybridSecret::combine(&encapsulation.shared_secret, classical_secret.as_slice());

        let classical_public_key = classical.public_key().to_vec();
        let transcript =
            transcript_hash(&digest, &encapsulation.ciphertext, &classical_public_key);
        let confirmation = confirmation_tag(&secret, RESPONDER_LABEL, &transcript)?;

        let reply = HandshakeReply {
            ciphertext: encapsulation.ciphertext.clone(),
            classical_public_key,
            confirmation: confirmation.to_vec(),
        };
        let pending = PendingChannel {
            secret,
            transcript,
            assurance,
        };
        Ok((pending, reply))
    }
}

/// イニシエータの確認タグを待つレスポンダ側のセッション。
///
/// この時点の秘密はまだ使用できない。
pub struct PendingChannel {
    secret: HybridSecret,
    transcript: [u8; 32],
    assurance: IdentityAssurance,
}

impl PendingChannel {
    /// 相手に期待する保証レベル。
    pub fn assurance(&self) -> IdentityAssurance {
        self.assurance
    }

    /// イニシエータの確認タグを検証し、チャネルを確立する。
    pub fn confirm(self, initiator_tag: &[u8]) -> Result<EstablishedChannel, ChannelError> {
        let confirmed =
            confirmation_matches(&self.secret, INITIATOR_LABEL, &self.transcript, initiator_tag)?;
        if !confirmed {
            tracing::warn!("イニシエータの鍵確認タグが一致しません。セッションを破棄します");
            return Err(ChannelError::KeyConfirmationFailed);
        }
        EstablishedChannel::new(
            self.secret,
            self.transcript,
            self.assurance,
            ChannelRole::Responder,
        )
    }

    /// ワイヤ形式の確認タグで [`PendingChannel::confirm`] を行う。
    pub fn confirm_wire(
        self,
        confirmation: &KeyConfirmation,
    ) -> Result<EstablishedChannel, ChannelError> {
        let tag = decode_field("confirmation", &confirmation.confirmation)?;
        self.confirm(&tag)
    }
}

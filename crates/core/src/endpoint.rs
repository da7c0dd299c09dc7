//! # リモートエンドポイント
//!
//! ゲートがチャネル確立を駆動する相手の抽象。
//! 同一プロセス内のシミュレーション衛星と、将来のトランスポート実装を差し替え可能にする。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use astra_crypto::{KeyEncapsulation, Kyber1024, SigningKeyPair};
use astra_types::{ChannelResponse, HandshakeOffer, KeyConfirmation};
use async_trait::async_trait;

use crate::b64_encode;
use crate::channel::{
    ChannelError, EstablishedChannel, HandshakeReply, Initiator, InitiatorSession, KeyBundle,
    Responder, SealedMessage,
};

/// チャネルのイニシエータ役を担うリモートエンドポイント。
#[async_trait]
pub trait RemoteEndpoint: Send + Sync {
    /// エンドポイント名（ログ用）。
    fn name(&self) -> &str;

    /// 新しいセッションを開始し、署名付き公開鍵バンドルを提示する。
    async fn offer_bundle(&self) -> Result<HandshakeOffer, ChannelError>;

    /// レスポンダの応答を処理し、自身の鍵確認タグを返す。
    async fn finish_handshake(
        &self,
        session_id: &str,
        response: &ChannelResponse,
    ) -> Result<KeyConfirmation, ChannelError>;

    /// 確立できなかったセッションを破棄する。未知のセッションIDは無視する。
    async fn abort_session(&self, session_id: &str);
}

/// エンドポイントとの確立済みセッション。
#[derive(Debug)]
pub struct EndpointSession {
    /// エンドポイント側のセッションID
    pub session_id: String,
    /// 地上局側のチャネル
    pub channel: EstablishedChannel,
}

/// 地上局側からリモートエンドポイントとのチャネルを確立する。
///
/// 提示 → 検証・カプセル化 → 相手の鍵確認 → 自身の鍵確認 の順に進む。
/// 提示後のいずれかの段階が失敗するか `timeout` を超えた場合は、
/// エンドポイント側のセッションを [`RemoteEndpoint::abort_session`] で破棄する。
pub async fn establish_channel(
    responder: &Responder,
    endpoint: &dyn RemoteEndpoint,
    timeout: Duration,
) -> Result<EndpointSession, ChannelError> {
    let deadline = tokio::time::Instant::now() + timeout;
    let offer = tokio::time::timeout_at(deadline, endpoint.offer_bundle())
        .await
        .map_err(|_| ChannelError::Timeout(timeout))??;

    let handshake = async {
        let bundle = KeyBundle::from_wire(&offer.bundle)?;
        let (pending, reply) = responder.respond(&bundle)?;
        let confirmation = endpoint
            .finish_handshake(&offer.session_id, &reply.to_wire())
            .await?;
        pending.confirm_wire(&confirmation)
    };
    let channel = match tokio::time::timeout_at(deadline, handshake).await {
        Ok(Ok(channel)) => channel,
        Ok(Err(e)) => {
            endpoint.abort_session(&offer.session_id).await;
            return Err(e);
        }
        Err(_) => {
            endpoint.abort_session(&offer.session_id).await;
            return Err(ChannelError::Timeout(timeout));
        }
    };

    tracing::info!(
        endpoint = endpoint.name(),
        session_id = %offer.session_id,
        fingerprint = %channel.fingerprint(),
        assurance = ?channel.assurance(),
        "チャネルを確立しました"
    );
    Ok(EndpointSession {
        session_id: offer.session_id,
        channel,
    })
}

/// 同一プロセス内で動作するシミュレーション衛星。
///
/// 長期署名鍵を保持し、セッションごとにイニシエータとして振る舞う。
/// 確立したチャネルはセッションIDで保持し、受信したコマンドを復号できる。
pub struct SimulatedSatellite {
    name: String,
    initiator: Initiator,
    pending: Mutex<HashMap<String, InitiatorSession>>,
    established: Mutex<HashMap<String, EstablishedChannel>>,
}

impl SimulatedSatellite {
    /// 指定した長期署名鍵でKyber-1024を使う衛星を作成する。
    pub fn new(name: impl Into<String>, identity: Arc<SigningKeyPair>) -> Self {
        Self::with_kem(name, identity, Arc::new(Kyber1024))
    }

    /// KEM実装を指定して作成する。
    pub fn with_kem(
        name: impl Into<String>,
        identity: Arc<SigningKeyPair>,
        kem: Arc<dyn KeyEncapsulation>,
    ) -> Self {
        Self {
            name: name.into(),
            initiator: Initiator::new(identity, kem),
            pending: Mutex::new(HashMap::new()),
            established: Mutex::new(HashMap::new()),
        }
    }

    /// 長期署名公開鍵。地上局のピン留めに使う。
    pub fn signing_public_key(&self) -> Vec<u8> {
        self.initiator.signing_public_key().to_vec()
    }

    /// 確立済みセッション数。
    pub fn established_sessions(&self) -> usize {
        self.established.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// 確立待ちのセッション数。
    pub fn pending_sessions(&self) -> usize {
        self.pending.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// 確立済みチャネル上で受信したコマンドを復号する。
    pub fn receive(
        &self,
        session_id: &str,
        message: &SealedMessage,
    ) -> Result<Vec<u8>, ChannelError> {
        let mut established = lock_table(&self.established)?;
        let channel = established
            .get_mut(session_id)
            .ok_or_else(|| ChannelError::Transport(format!("未知のセッション: {session_id}")))?;
        channel.open(message)
    }

    /// 確立済みセッションを閉じる。閉じたセッションがあれば `true`。
    pub fn close(&self, session_id: &str) -> bool {
        let closed = lock_table(&self.established)
            .map(|mut m| m.remove(session_id).is_some())
            .unwrap_or(false);
        if closed {
            tracing::debug!(endpoint = %self.name, session_id, "セッションを閉じました");
        }
        closed
    }
}

fn lock_table<T>(
    table: &Mutex<HashMap<String, T>>,
) -> Result<MutexGuard<'_, HashMap<String, T>>, ChannelError> {
    table
        .lock()
        .map_err(|_| ChannelError::Transport("セッション表のロックが破損しています".into()))
}

#[async_trait]
impl RemoteEndpoint for SimulatedSatellite {
    fn name(&self) -> &str {
        &self.name
    }

    async fn offer_bundle(&self) -> Result<HandshakeOffer, ChannelError> {
        let (session, bundle) = self.initiator.start_session()?;
        let session_id = uuid::Uuid::new_v4().to_string();
        lock_table(&self.pending)?.insert(session_id.clone(), session);
        tracing::debug!(
            endpoint = %self.name,
            session_id = %session_id,
            "公開鍵バンドルを提示しました"
        );
        Ok(HandshakeOffer {
            session_id,
            bundle: bundle.to_wire(),
        })
    }

    async fn finish_handshake(
        &self,
        session_id: &str,
        response: &ChannelResponse,
    ) -> Result<KeyConfirmation, ChannelError> {
        // 成否に関わらずセッションは一度しか使えない
        let session = lock_table(&self.pending)?
            .remove(session_id)
            .ok_or_else(|| ChannelError::Transport(format!("未知のセッション: {session_id}")))?;

        let reply = HandshakeReply::from_wire(response)?;
        let (channel, tag) = session.finish(&reply)?;
        lock_table(&self.established)?.insert(session_id.to_string(), channel);
        Ok(KeyConfirmation {
            confirmation: b64_encode(&tag),
        })
    }

    async fn abort_session(&self, session_id: &str) {
        let pending = lock_table(&self.pending).map(|mut m| m.remove(session_id).is_some());
        let established =
            lock_table(&self.established).map(|mut m| m.remove(session_id).is_some());
        if matches!(pending, Ok(true)) || matches!(established, Ok(true)) {
            tracing::debug!(
                endpoint = %self.name,
                session_id,
                "確立できなかったセッションを破棄しました"
            );
        }
    }
}

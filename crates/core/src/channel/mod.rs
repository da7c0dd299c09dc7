//! # 認証付きハイブリッドチャネル (ASTRA WAVE)
//!
//! 長期署名アイデンティティとセッション単位のKEM鍵を結び付け、
//! 耐量子成分（Kyber-1024）と古典成分（X25519）を混合したセッション秘密を導出する。
//!
//! ## プロトコル
//! 1. イニシエータ（衛星）はセッションごとにKEM鍵ペアとX25519鍵を生成する
//! 2. `SHA-256(domain || kem_pk || x25519_pk)` に長期鍵で署名し、バンドルとして送信する
//! 3. レスポンダ（地上局）は署名を検証する。失敗した場合は秘密を確立せず終了する
//! 4. レスポンダはカプセル化とX25519を行い、`derived = SHA-256(pqc || classical)` を計算して
//!    暗号文・自身のX25519公開鍵・鍵確認タグを返す
//! 5. イニシエータは復号して同じ `derived` を計算し、タグを検証して自身のタグを返す
//! 6. 双方がタグを検証した時点でチャネル確立とみなす
//!
//! ## アイデンティティ保証
//! バンドル単体が証明するのは「KEM鍵が `signing_public_key` に結び付いている」ことだけで、
//! 相手が誰かは証明しない。相手の署名公開鍵を事前に固定（ピン留め）した場合のみ
//! [`IdentityAssurance::Pinned`] となる。

mod protocol;
mod session;


pub use protocol::{
    bundle_digest, ChannelError, HandshakeReply, IdentityAssurance, Initiator, InitiatorSession,
    KeyBundle, PendingChannel, Responder,
};
pub use session::{ChannelRole, EstablishedChannel, HybridSecret, SealedMessage};

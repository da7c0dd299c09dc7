//! # 永続化キーストア
//!
//! 鍵ラベル → 長期署名鍵ペアの対応をJSONファイルに保存する。
//!
//! ## 不変条件
//! - ラベルは一意。同じラベルの再プロビジョニングは何もしない（鍵を再生成しない）
//! - 鍵を置き換える手段は [`Keystore::rotate`] のみ
//! - 更新は `<path>.lock` の排他ロックを保持したまま
//!   再読み込み → 確認 → 生成 → 永続化 を行う。別プロセス・別ハンドルの更新も失われない
//! - ファイルはプロセスごとの一時ファイルへの書き込みとリネームで原子的に更新する
//!
//! 読み取り（[`Keystore::get`] 等）は直近に読み込んだ内容を返す。
//!
//! マスター鍵を設定した場合、秘密鍵は `nonce || AES-256-GCM(秘密鍵)` として保存し、
//! ラベルを関連データとして束縛する。

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use astra_crypto::{
    aes_gcm_decrypt, aes_gcm_encrypt, fill_random, CryptoError, SignatureAlgorithm,
    SigningKeyPair, SymmetricKey, Zeroizing, AES_GCM_NONCE_LEN,
};
use astra_types::{KeyRecord, KeystoreFile, KEYSTORE_FORMAT_VERSION};

use crate::{b64_decode, b64_encode, now_millis};

/// キーストアのエラー型
#[derive(Debug, thiserror::Error)]
pub enum KeystoreError {
    /// ラベルに対応する鍵がない
    #[error("鍵が見つかりません: {0}")]
    KeyNotFound(String),
    /// 既存の鍵とアルゴリズムが異なる
    #[error("鍵 {label} は既に {existing} で登録されています（要求: {requested}）")]
    AlgorithmMismatch {
        label: String,
        existing: SignatureAlgorithm,
        requested: SignatureAlgorithm,
    },
    /// 空のラベル等
    #[error("鍵ラベルが不正です: {0:?}")]
    InvalidLabel(String),
    /// 永続化された鍵レコードが不正
    #[error("鍵レコード {label} が破損しています: {reason}")]
    CorruptRecord { label: String, reason: String },
    /// 封印された鍵を読むにはマスター鍵が必要
    #[error("鍵 {0} は封印されています。マスター鍵を設定してください")]
    MasterKeyRequired(String),
    /// 未対応のファイル形式バージョン
    #[error("未対応のキーストア形式バージョン: {0}")]
    UnsupportedVersion(u32),
    /// ファイルI/Oエラー
    #[error("キーストアファイルの入出力に失敗しました: {0}")]
    Io(#[from] std::io::Error),
    /// JSONのシリアライズ/デシリアライズエラー
    #[error("キーストアファイルの形式が不正です: {0}")]
    Serialization(#[from] serde_json::Error),
    /// 暗号処理エラー（鍵生成・署名・封印）
    #[error("暗号処理エラー: {0}")]
    Crypto(#[from] CryptoError),
    /// 別スレッドのパニックでロックが破損した
    #[error("キーストアのロックが破損しています")]
    LockPoisoned,
}

/// プロビジョニングの結果。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// 新しい鍵ペアを生成した
    Provisioned,
    /// 既に同じアルゴリズムの鍵があった（何もしていない）
    AlreadyProvisioned,
}

#[derive(Clone)]
struct Entry {
    record: KeyRecord,
    pair: Arc<SigningKeyPair>,
}

type Entries = BTreeMap<String, Entry>;

/// 鍵ラベル → 署名鍵ペアのストア。`Arc<Keystore>` で共有する。
pub struct Keystore {
    path: Option<PathBuf>,
    master_key: Option<Zeroizing<SymmetricKey>>,
    entries: Mutex<Entries>,
}

impl Keystore {
    /// 永続化しないキーストア（テスト・一時利用）。
    pub fn in_memory() -> Self {
        Self {
            path: None,
            master_key: None,
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// ファイルからキーストアを開く。ファイルがなければ空で開始し、最初の更新時に作成する。
    ///
    /// 全レコードの鍵長を宣言されたアルゴリズムと照合し、不一致は
    /// [`KeystoreError::CorruptRecord`] として拒否する。
    pub fn open(
        path: impl Into<PathBuf>,
        master_key: Option<SymmetricKey>,
    ) -> Result<Self, KeystoreError> {
        let path = path.into();
        let store = Self {
            path: Some(path.clone()),
            master_key: master_key.map(Zeroizing::new),
            entries: Mutex::new(BTreeMap::new()),
        };

        let _file_lock = FileLock::acquire(&path)?;
        let (entries, resealed) = store.load(&path)?;
        if resealed {
            store.persist(&entries)?;
        }
        tracing::info!(path = %path.display(), keys = entries.len(), "キーストアを読み込みました");
        *store.lock()? = entries;
        Ok(store)
    }

    /// 永続化先のパス。
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// 秘密鍵を封印して保存するか。
    pub fn is_sealed(&self) -> bool {
        self.master_key.is_some()
    }

    /// 鍵ラベルがなければ鍵ペアを生成して永続化する。
    ///
    /// 既に同じアルゴリズムの鍵があれば何もしない。別アルゴリズムであれば
    /// [`KeystoreError::AlgorithmMismatch`]。
    pub fn provision(
        &self,
        label: &str,
        algorithm: SignatureAlgorithm,
    ) -> Result<ProvisionOutcome, KeystoreError> {
        validate_label(label)?;
        let outcome = self.update(|entries| {
            if let Some(existing) = entries.get(label) {
                if existing.pair.algorithm != algorithm {
                    return Err(KeystoreError::AlgorithmMismatch {
                        label: label.to_string(),
                        existing: existing.pair.algorithm,
                        requested: algorithm,
                    });
                }
                return Ok((ProvisionOutcome::AlreadyProvisioned, false));
            }
            entries.insert(label.to_string(), self.new_entry(label, algorithm)?);
            Ok((ProvisionOutcome::Provisioned, true))
        })?;
        match outcome {
            ProvisionOutcome::Provisioned => {
                tracing::info!(label, %algorithm, "署名鍵をプロビジョニングしました")
            }
            ProvisionOutcome::AlreadyProvisioned => {
                tracing::debug!(label, "鍵は既にプロビジョニング済みです")
            }
        }
        Ok(outcome)
    }

    /// ラベルの鍵ペアを取得する。
    pub fn get(&self, label: &str) -> Result<Arc<SigningKeyPair>, KeystoreError> {
        self.lock()?
            .get(label)
            .map(|entry| Arc::clone(&entry.pair))
            .ok_or_else(|| KeystoreError::KeyNotFound(label.to_string()))
    }

    /// ラベルが登録済みか。
    pub fn contains(&self, label: &str) -> Result<bool, KeystoreError> {
        Ok(self.lock()?.contains_key(label))
    }

    /// 登録済みラベルの一覧（昇順）。
    pub fn labels(&self) -> Result<Vec<String>, KeystoreError> {
        Ok(self.lock()?.keys().cloned().collect())
    }

    /// 既存の鍵を消去し、同じアルゴリズムで再生成する。
    pub fn rotate(&self, label: &str) -> Result<Arc<SigningKeyPair>, KeystoreError> {
        let pair = self.update(|entries| {
            let algorithm = entries
                .get(label)
                .map(|entry| entry.pair.algorithm)
                .ok_or_else(|| KeystoreError::KeyNotFound(label.to_string()))?;
            let entry = self.new_entry(label, algorithm)?;
            let pair = Arc::clone(&entry.pair);
            entries.insert(label.to_string(), entry);
            Ok((pair, true))
        })?;
        tracing::info!(label, algorithm = %pair.algorithm, "署名鍵をローテーションしました");
        Ok(pair)
    }

    /// 鍵を消去する。
    pub fn erase(&self, label: &str) -> Result<(), KeystoreError> {
        self.update(|entries| {
            entries
                .remove(label)
                .ok_or_else(|| KeystoreError::KeyNotFound(label.to_string()))?;
            Ok(((), true))
        })?;
        tracing::info!(label, "署名鍵を消去しました");
        Ok(())
    }

    fn lock(&self) -> Result<MutexGuard<'_, Entries>, KeystoreError> {
        self.entries.lock().map_err(|_| KeystoreError::LockPoisoned)
    }

    /// 鍵表を更新する。
    ///
    /// ファイルロックの下で最新の内容を読み直してから `apply` を適用し、
    /// `apply` が変更ありと返した場合のみ永続化する。失敗時は何も反映しない。
    fn update<T>(
        &self,
        apply: impl FnOnce(&mut Entries) -> Result<(T, bool), KeystoreError>,
    ) -> Result<T, KeystoreError> {
        let mut entries = self.lock()?;
        let _file_lock = match &self.path {
            Some(path) => {
                let file_lock = FileLock::acquire(path)?;
                let (latest, resealed) = self.load(path)?;
                if resealed {
                    self.persist(&latest)?;
                }
                *entries = latest;
                Some(file_lock)
            }
            None => None,
        };

        let mut next = entries.clone();
        let (value, changed) = apply(&mut next)?;
        if changed {
            self.persist(&next)?;
        }
        *entries = next;
        Ok(value)
    }

    /// ファイルから鍵表を読み込む。マスター鍵があり平文レコードを封印し直した場合は `true` を返す。
    fn load(&self, path: &Path) -> Result<(Entries, bool), KeystoreError> {
        let mut entries = BTreeMap::new();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "キーストアファイルがないため空で開始します");
            return Ok((entries, false));
        }

        let file: KeystoreFile = serde_json::from_slice(&fs::read(path)?)?;
        if file.version != KEYSTORE_FORMAT_VERSION {
            return Err(KeystoreError::UnsupportedVersion(file.version));
        }

        let mut resealed = false;
        for (label, record) in file.keys {
            let pair = self.decode_record(&label, &record)?;
            let record = if self.master_key.is_some() && !record.sealed {
                tracing::warn!(label = %label, "平文で保存された鍵をマスター鍵で封印します");
                resealed = true;
                self.encode_record(&label, &pair, record.created_at)?
            } else {
                record
            };
            entries.insert(
                label,
                Entry {
                    record,
                    pair: Arc::new(pair),
                },
            );
        }
        Ok((entries, resealed))
    }

    fn new_entry(
        &self,
        label: &str,
        algorithm: SignatureAlgorithm,
    ) -> Result<Entry, KeystoreError> {
        let pair = SigningKeyPair::generate(algorithm, label)?;
        let record = self.encode_record(label, &pair, now_millis())?;
        Ok(Entry {
            record,
            pair: Arc::new(pair),
        })
    }

    fn encode_record(
        &self,
        label: &str,
        pair: &SigningKeyPair,
        created_at: u64,
    ) -> Result<KeyRecord, KeystoreError> {
        let (private_key, sealed) = match &self.master_key {
            Some(master_key) => {
                let mut nonce = [0u8; AES_GCM_NONCE_LEN];
                fill_random(&mut nonce)?;
                let ciphertext = aes_gcm_encrypt(
                    master_key,
                    &nonce,
                    pair.private_key_bytes(),
                    label.as_bytes(),
                )?;
                let mut blob = nonce.to_vec();
                blob.extend_from_slice(&ciphertext);
                (b64_encode(&blob), true)
            }
            None => (b64_encode(pair.private_key_bytes()), false),
        };
        Ok(KeyRecord {
            algorithm: pair.algorithm.as_str().to_string(),
            public_key: b64_encode(&pair.public_key),
            private_key,
            sealed,
            created_at,
        })
    }

    fn decode_record(
        &self,
        label: &str,
        record: &KeyRecord,
    ) -> Result<SigningKeyPair, KeystoreError> {
        let corrupt = |reason: String| KeystoreError::CorruptRecord {
            label: label.to_string(),
            reason,
        };

        let algorithm = record
            .algorithm
            .parse::<SignatureAlgorithm>()
            .map_err(|e| corrupt(e.to_string()))?;
        let public_key =
            b64_decode(&record.public_key).map_err(|e| corrupt(format!("公開鍵: {e}")))?;
        let stored = Zeroizing::new(
            b64_decode(&record.private_key).map_err(|e| corrupt(format!("秘密鍵: {e}")))?,
        );

        let private_key = if record.sealed {
            let master_key = self
                .master_key
                .as_ref()
                .ok_or_else(|| KeystoreError::MasterKeyRequired(label.to_string()))?;
            if stored.len() < AES_GCM_NONCE_LEN {
                return Err(corrupt("封印データが短すぎます".into()));
            }
            let (nonce, ciphertext) = stored.split_at(AES_GCM_NONCE_LEN);
            let nonce: [u8; AES_GCM_NONCE_LEN] = nonce
                .try_into()
                .map_err(|_| corrupt("nonceが不正です".into()))?;
            Zeroizing::new(
                aes_gcm_decrypt(master_key, &nonce, ciphertext, label.as_bytes())
                    .map_err(|_| corrupt("封印の解除に失敗しました".into()))?,
            )
        } else {
            stored
        };

        SigningKeyPair::from_parts(algorithm, label, public_key, private_key)
            .map_err(|e| corrupt(e.to_string()))
    }

    /// ファイルロック保持中に呼ぶ。
    fn persist(&self, entries: &Entries) -> Result<(), KeystoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let file = KeystoreFile {
            version: KEYSTORE_FORMAT_VERSION,
            keys: entries
                .iter()
                .map(|(label, entry)| (label.clone(), entry.record.clone()))
                .collect(),
        };
        let json = serde_json::to_vec_pretty(&file)?;

        let tmp_path = sibling_path(path, &format!("{}.tmp", std::process::id()));
        let mut tmp = open_private(&tmp_path)?;
        tmp.write_all(&json)?;
        tmp.sync_all()?;
        drop(tmp);
        if let Err(e) = fs::rename(&tmp_path, path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(e.into());
        }
        tracing::debug!(path = %path.display(), keys = entries.len(), "キーストアを保存しました");
        Ok(())
    }
}

fn validate_label(label: &str) -> Result<(), KeystoreError> {
    if label.trim().is_empty() || label.chars().any(char::is_control) {
        return Err(KeystoreError::InvalidLabel(label.to_string()));
    }
    Ok(())
}

/// `<path>.<suffix>` を返す。
fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

/// `<path>.lock` に対する排他アドバイザリロック。ドロップ時に解放する。
///
/// ロックはオープンしたファイル単位のため、同一プロセス内の別ハンドル同士も排他される。
struct FileLock {
    file: fs::File,
}

impl FileLock {
    /// ロックを取得するまで待つ。親ディレクトリがなければ作成する。
    fn acquire(path: &Path) -> Result<Self, KeystoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(sibling_path(path, "lock"))?;
        flock_exclusive(&file)?;
        Ok(Self { file })
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        flock_release(&self.file);
    }
}

#[cfg(unix)]
fn flock_exclusive(file: &fs::File) -> std::io::Result<()> {
    use std::os::unix::io::AsRawFd;
    loop {
        // SAFETY: fdは `file` が所有する有効なファイル記述子。
        #[allow(unsafe_code)]
        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
        if result == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

#[cfg(unix)]
fn flock_release(file: &fs::File) {
    use std::os::unix::io::AsRawFd;
    // SAFETY: fdは `file` が所有する有効なファイル記述子。失敗してもクローズ時に解放される。
    #[allow(unsafe_code)]
    let _ = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
}

#[cfg(not(unix))]
fn flock_exclusive(_file: &fs::File) -> std::io::Result<()> {
    Ok(())
}

#[cfg(not(unix))]
fn flock_release(_file: &fs::File) {}

#[cfg(unix)]
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    use std::os::unix::fs::OpenOptionsExt;
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
}

#[cfg(not(unix))]
fn open_private(path: &Path) -> std::io::Result<fs::File> {
    fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
}

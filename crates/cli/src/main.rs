//! # Astra CLI
//!
//! 地上局オペレータ向けのコマンドラインツール。
//!
//! ## サブコマンド
//! - `provision` / `keys` / `rotate`: 署名鍵の管理
//! - `sign` / `verify`: コマンド署名と検証
//! - `authorize`: 完全性 → リスク → チャネル → 署名 の認可ゲートを実行する
//! - `handshake`: シミュレーション衛星とのチャネル確立のみを実行する
//! - `report`: セキュリティレポートを出力する

mod commands;
mod config;
mod error;

use std::path::PathBuf;
use std::process::ExitCode;

use astra_crypto::SignatureAlgorithm;
use clap::{Parser, Subcommand};

use crate::config::CliConfig;

#[derive(Parser)]
#[command(name = "astra")]
#[command(about = "Command authorization gate and hybrid secure channel for ground stations")]
#[command(version)]
struct Cli {
    /// キーストアファイル（ASTRA_KEYSTOREより優先）
    #[arg(long, global = true)]
    keystore: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 署名鍵を生成する（既に存在する場合は何もしない）
    Provision {
        /// 鍵ラベル
        label: String,
        /// 署名アルゴリズム (ed25519 / dilithium5)
        #[arg(long, default_value = "ed25519")]
        algorithm: SignatureAlgorithm,
    },
    /// コマンドに署名する
    Sign {
        /// コマンド文字列
        command: String,
        /// 鍵ラベル
        #[arg(long)]
        label: String,
    },
    /// コマンド署名を検証する
    Verify {
        /// コマンド文字列
        command: String,
        /// Base64エンコードされた署名
        #[arg(long)]
        signature: String,
        /// 鍵ラベル
        #[arg(long)]
        label: String,
    },
    /// 登録済みの鍵を一覧表示する
    Keys,
    /// 鍵を消去して再生成する
    Rotate {
        /// 鍵ラベル
        label: String,
    },
    /// 認可ゲートを実行する
    Authorize {
        /// コマンド文字列
        command: String,
        /// 操作者ID（多要素認証の対象）
        #[arg(long, default_value = "operator-01")]
        operator: String,
        /// 署名鍵ラベル
        #[arg(long, default_value = "operator-01")]
        label: String,
        /// コンテキスト特徴量（例: --context latency=50）
        #[arg(long = "context", value_parser = commands::parse_feature)]
        context: Vec<(String, f64)>,
        /// 監視対象のファームウェア（ASTRA_FIRMWARE_PATHより優先）
        #[arg(long)]
        firmware: Option<PathBuf>,
        /// リスク閾値（ASTRA_RISK_THRESHOLDより優先）
        #[arg(long)]
        risk_threshold: Option<f64>,
        /// 判定をJSONで書き出すファイル
        #[arg(long)]
        audit_out: Option<PathBuf>,
        /// 監査イベントをJSON Linesで追記するファイル
        #[arg(long)]
        jsonl: Option<PathBuf>,
    },
    /// シミュレーション衛星とのチャネル確立のみを実行する
    Handshake {
        /// 衛星の署名公開鍵をピン留めしない
        #[arg(long)]
        no_pin: bool,
        /// 衛星の署名アルゴリズム
        #[arg(long, default_value = "dilithium5")]
        algorithm: SignatureAlgorithm,
    },
    /// セキュリティレポートを出力する
    Report {
        /// 監査イベントのJSON Linesファイル
        #[arg(long)]
        events: Option<PathBuf>,
        /// 含める直近イベント数
        #[arg(long, default_value_t = 20)]
        limit: usize,
        /// ファームウェア（ASTRA_FIRMWARE_PATHより優先）
        #[arg(long)]
        firmware: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    let mut config = CliConfig::from_env()?;
    if let Some(path) = cli.keystore {
        config.keystore_path = path;
    }

    let code = match cli.command {
        Commands::Provision { label, algorithm } => {
            commands::provision(&config, &label, algorithm)?;
            ExitCode::SUCCESS
        }
        Commands::Sign { command, label } => {
            commands::sign(&config, &command, &label)?;
            ExitCode::SUCCESS
        }
        Commands::Verify {
            command,
            signature,
            label,
        } => {
            if commands::verify(&config, &command, &signature, &label)? {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Commands::Keys => {
            commands::keys(&config)?;
            ExitCode::SUCCESS
        }
        Commands::Rotate { label } => {
            commands::rotate(&config, &label)?;
            ExitCode::SUCCESS
        }
        Commands::Authorize {
            command,
            operator,
            label,
            context,
            firmware,
            risk_threshold,
            audit_out,
            jsonl,
        } => {
            if let Some(path) = firmware {
                config.firmware_path = Some(path);
            }
            if let Some(threshold) = risk_threshold {
                config.risk_threshold = commands::check_threshold(threshold)?;
            }
            let options = commands::AuthorizeOptions {
                command,
                operator,
                label,
                context,
                audit_out,
                jsonl,
            };
            if commands::authorize(&config, options).await? {
                ExitCode::SUCCESS
            } else {
                // 拒否は実行エラーと区別する
                ExitCode::from(2)
            }
        }
        Commands::Handshake { no_pin, algorithm } => {
            commands::handshake(&config, !no_pin, algorithm).await?;
            ExitCode::SUCCESS
        }
        Commands::Report {
            events,
            limit,
            firmware,
        } => {
            if let Some(path) = firmware {
                config.firmware_path = Some(path);
            }
            commands::report(&config, events.as_deref(), limit).await?;
            ExitCode::SUCCESS
        }
    };
    Ok(code)
}

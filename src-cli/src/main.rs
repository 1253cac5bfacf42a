mod commands;
mod events;

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use env_logger::{Builder, Env, Target};
use serde::Serialize;

use mf_core::domain::error::AppError;
use mf_core::domain::fetch::MediaFetcher;
use mf_core::domain::job::JobStatus;
use mf_core::infra::fetch::{ScriptedFetcher, YtDlpConfig, YtDlpFetcher};
use mf_core::infra::storage::Storage;
use mf_core::usecase::app_service::AppService;

use crate::commands::{CmdResult, CommandError, FetchArgs};
use crate::events::{ErrorPayload, ERROR};

#[derive(Debug, Parser)]
#[command(name = "media-fetch", version, about = "yt-dlp を使ったメディアダウンロードジョブ")]
struct Cli {
    /// SQLite データベースのパス
    #[arg(long, env = "MF_DB_PATH", global = true)]
    db_path: Option<PathBuf>,
    /// 出力ディレクトリ（保存済み設定より優先）
    #[arg(long, env = "MF_OUTPUT_DIR", global = true)]
    output_dir: Option<PathBuf>,
    /// yt-dlp を呼ばず、擬似的な進捗で動かす
    #[arg(long, global = true)]
    dry_run: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// URL を取得し、進捗を JSON 行で出力する
    Fetch {
        url: String,
        /// 音声 (mp3) のみ抽出する
        #[arg(long)]
        audio: bool,
        /// 画質 (best / 1080p / 720p / 480p / 360p)
        #[arg(long)]
        quality: Option<String>,
        /// プラットフォームを明示する (YOUTUBE, TIKTOK, ...)
        #[arg(long)]
        platform: Option<String>,
    },
    /// ジョブの状態
    Status { id: String },
    /// 履歴（新しい順）
    History {
        #[arg(long, default_value_t = 20)]
        limit: u32,
        #[arg(long)]
        cursor: Option<String>,
    },
    /// 集計
    Stats,
    /// 保持期間を過ぎた成果物を削除する
    Cleanup {
        #[arg(long)]
        hours: Option<u64>,
    },
    /// 設定の参照・更新
    Settings {
        #[command(subcommand)]
        action: SettingsCommand,
    },
}

impl Command {
    /// ジョブを実行するサブコマンドか。実行するものだけがサービスを start する。
    fn runs_jobs(&self) -> bool {
        matches!(self, Command::Fetch { .. })
    }
}

#[derive(Debug, Subcommand)]
enum SettingsCommand {
    Get,
    /// 例: `settings set retention_hours 48`
    Set { key: String, value: String },
}

fn init_logger() {
    // stdout はイベント用なのでログは stderr へ
    Builder::from_env(Env::default().default_filter_or("info"))
        .target(Target::Stderr)
        .init();
}

fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("media-fetch")
        .join("media-fetch.db")
}

fn open_storage(path: &Path) -> Result<Storage, AppError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| {
            AppError::storage(format!("データディレクトリ作成失敗 {}: {e}", dir.display()))
        })?;
    }
    Storage::open(&path.to_string_lossy())
}

fn build_service(cli: &Cli) -> Result<Arc<AppService>, AppError> {
    let db_path = cli.db_path.clone().unwrap_or_else(default_db_path);
    let storage = open_storage(&db_path)?;

    let mut settings = storage.get_settings()?;
    if let Some(dir) = &cli.output_dir {
        settings.output_dir = dir.clone();
    }

    let fetcher: Arc<dyn MediaFetcher> = if cli.dry_run {
        log::info!("dry-run: yt-dlp を呼ばずに擬似ジョブを実行します");
        Arc::new(
            ScriptedFetcher::default()
                .with_delay(Duration::from_millis(300))
                .writing_to(&settings.output_dir),
        )
    } else {
        let fetcher = YtDlpFetcher::new(YtDlpConfig::from_settings(&settings));
        if let Err(e) = fetcher.validate() {
            log::warn!("yt-dlp の検証に失敗: {e}");
        }
        Arc::new(fetcher)
    };

    log::info!("database: {}", db_path.display());
    Ok(Arc::new(AppService::with_settings(storage, fetcher, settings)))
}

fn print_json<T: Serialize>(value: &T) -> CmdResult<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// 成功なら true。fetch は終端が COMPLETED のときだけ成功とする。
async fn run(service: &AppService, command: Command) -> CmdResult<bool> {
    match command {
        Command::Fetch {
            url,
            audio,
            quality,
            platform,
        } => {
            let record = commands::fetch(
                service,
                FetchArgs {
                    url,
                    audio,
                    quality,
                    platform,
                },
            )
            .await?;
            Ok(record.status == JobStatus::Completed)
        }
        Command::Status { id } => {
            print_json(&commands::status(service, &id).await?)?;
            Ok(true)
        }
        Command::History { limit, cursor } => {
            print_json(&commands::history(service, limit, cursor.as_deref())?)?;
            Ok(true)
        }
        Command::Stats => {
            print_json(&commands::stats(service)?)?;
            Ok(true)
        }
        Command::Cleanup { hours } => {
            print_json(&commands::cleanup(service, hours).await?)?;
            Ok(true)
        }
        Command::Settings { action } => {
            match action {
                SettingsCommand::Get => print_json(&commands::get_settings(service))?,
                SettingsCommand::Set { key, value } => {
                    print_json(&commands::set_setting(service, &key, &value)?)?
                }
            }
            Ok(true)
        }
    }
}

fn report_error(error: &CommandError) {
    log::error!("{error}");
    events::emit_event(ERROR, ErrorPayload::from_app(&error.to_app_error(), None));
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logger();
    let cli = Cli::parse();

    let service = match build_service(&cli) {
        Ok(service) => service,
        Err(e) => {
            report_error(&CommandError::App(e));
            return ExitCode::FAILURE;
        }
    };
    // 読み取り系は他プロセスの実行中ジョブに触れない
    if cli.command.runs_jobs() {
        if let Err(e) = service.start() {
            report_error(&CommandError::App(e));
            return ExitCode::FAILURE;
        }
    }

    let result = run(&service, cli.command).await;
    service.stop().await;

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(e) => {
            report_error(&e);
            ExitCode::FAILURE
        }
    }
}

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::error::AppError;

/// ダウンロード設定（SQLite の settings テーブルに保存される）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadSettings {
    /// 成果物の出力先ディレクトリ
    pub output_dir: PathBuf,
    /// yt-dlp バイナリのパス
    pub ytdlp_binary: PathBuf,
    /// ジョブ単位のタイムアウト秒数
    pub job_timeout_secs: u64,
    /// オブザーバーごとの最小通知間隔（ミリ秒）
    pub notify_interval_ms: u64,
    /// 完了済みファイルの保持時間
    pub retention_hours: u64,
    /// 保持期間スイープの実行間隔（秒）
    pub sweep_interval_secs: u64,
    /// 画質指定が無い場合の既定値
    pub default_quality: String,
    /// 永続化失敗時のリトライ回数
    pub persist_retries: u32,
    /// 終了済みジョブをメモリに残す秒数（以降はストアから読む）
    pub memory_ttl_secs: u64,
}

impl DownloadSettings {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn notify_interval(&self) -> Duration {
        Duration::from_millis(self.notify_interval_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn memory_ttl(&self) -> Duration {
        Duration::from_secs(self.memory_ttl_secs)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.output_dir.as_os_str().is_empty() {
            return Err(AppError::invalid_request("output_dir が空です"));
        }
        if self.ytdlp_binary.as_os_str().is_empty() {
            return Err(AppError::invalid_request("ytdlp_binary が空です"));
        }
        if self.job_timeout_secs == 0 {
            return Err(AppError::invalid_request("job_timeout_secs は 1 以上にしてください"));
        }
        if self.default_quality.trim().is_empty() {
            return Err(AppError::invalid_request("default_quality が空です"));
        }
        Ok(())
    }
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./temp"),
            ytdlp_binary: PathBuf::from("yt-dlp"),
            job_timeout_secs: 600,
            notify_interval_ms: 2000,
            retention_hours: 24,
            sweep_interval_secs: 3600,
            default_quality: "best".to_string(),
            persist_retries: 3,
            memory_ttl_secs: 300,
        }
    }
}

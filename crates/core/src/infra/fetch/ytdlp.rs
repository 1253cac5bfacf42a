use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::fetch::{FetchError, MediaFetcher, ProgressFn};
use crate::domain::job::{Artifact, JobId};
use crate::domain::settings::DownloadSettings;
use crate::domain::types::{JobRequest, MediaKind};

use super::process::{run_streaming, CommandSpec, LineSource};
use super::progress::ProgressTracker;

/// 最終移動後に 1 行の JSON としてメタデータを出力させるテンプレート
const METADATA_TEMPLATE: &str = "after_move:%(.{title,duration,thumbnail,filepath})j";

/// yt-dlp sidecar の設定。
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct YtDlpConfig {
    /// yt-dlp バイナリのパス
    pub binary_path: PathBuf,
    /// 出力ディレクトリ (`<output_dir>/<job-id>.<ext>`)
    pub output_dir: PathBuf,
    /// タイムアウト秒数
    pub timeout_secs: u64,
    /// URL の前に追加する引数 (例: `--cookies`)
    #[serde(default)]
    pub extra_args: Vec<String>,
}

impl Default for YtDlpConfig {
    fn default() -> Self {
        Self::from_settings(&DownloadSettings::default())
    }
}

impl YtDlpConfig {
    pub fn from_settings(settings: &DownloadSettings) -> Self {
        Self {
            binary_path: settings.ytdlp_binary.clone(),
            output_dir: settings.output_dir.clone(),
            timeout_secs: settings.job_timeout_secs,
            extra_args: Vec::new(),
        }
    }
}

/// yt-dlp sidecar プロセスによるメディア取得。
pub struct YtDlpFetcher {
    config: parking_lot::RwLock<YtDlpConfig>,
}

impl YtDlpFetcher {
    pub fn new(config: YtDlpConfig) -> Self {
        Self {
            config: parking_lot::RwLock::new(config),
        }
    }

    /// 設定を動的に更新する。実行中のジョブには影響しない。
    pub fn update_config(&self, config: YtDlpConfig) {
        *self.config.write() = config;
    }

    /// 現在の設定のクローンを取得する。
    pub fn config(&self) -> YtDlpConfig {
        self.config.read().clone()
    }

    /// yt-dlp バイナリの存在を検証する。
    pub fn validate(&self) -> Result<(), FetchError> {
        let config = self.config.read();
        if !config.binary_path.exists() && which_binary(&config.binary_path).is_none() {
            return Err(FetchError::spawn(format!(
                "yt-dlp binary not found: {:?}",
                config.binary_path
            )));
        }
        Ok(())
    }

    /// yt-dlp 用のコマンドライン引数を構築する。URL は必ず `--` の後に置く。
    fn build_args(config: &YtDlpConfig, request: &JobRequest) -> Vec<String> {
        let output_template = config
            .output_dir
            .join(format!("{}.%(ext)s", request.job_id));

        let mut args: Vec<String> = vec![
            "--newline".into(),
            "--no-simulate".into(),
            "--progress".into(),
            "--no-playlist".into(),
            "--print".into(),
            METADATA_TEMPLATE.into(),
            "-o".into(),
            output_template.to_string_lossy().into(),
        ];

        match request.media_kind {
            MediaKind::Video => {
                args.push("-f".into());
                args.push(format_selector(&request.quality));
                args.push("--merge-output-format".into());
                args.push("mp4".into());
            }
            MediaKind::Audio => {
                args.push("-x".into());
                args.push("--audio-format".into());
                args.push("mp3".into());
            }
        }

        args.extend(config.extra_args.iter().cloned());

        args.push("--".into());
        args.push(request.source_url.clone());
        args
    }
}

/// 画質ヒントを yt-dlp のフォーマット指定に変換する。
pub fn format_selector(quality: &str) -> String {
    let capped = |height: u32| format!("bv*[height<={height}]+ba/b[height<={height}]");
    let quality = quality.trim();
    match quality.to_ascii_lowercase().as_str() {
        "" | "best" => "bv*+ba/b".to_string(),
        "worst" => "wv*+wa/w".to_string(),
        "1080p" => capped(1080),
        "720p" => capped(720),
        "480p" => capped(480),
        "360p" => capped(360),
        // それ以外はフォーマット指定としてそのまま渡す
        _ => quality.to_string(),
    }
}

// ─── メタデータ行 ───────────────────────────────────────────────

/// `--print after_move:...j` の出力
#[derive(Debug, Default, serde::Deserialize)]
struct YtDlpMetadata {
    title: Option<String>,
    duration: Option<f64>,
    thumbnail: Option<String>,
    filepath: Option<String>,
}

fn parse_metadata_line(line: &str) -> Option<YtDlpMetadata> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }
    match serde_json::from_str(trimmed) {
        Ok(meta) => Some(meta),
        Err(e) => {
            log::debug!("yt-dlp metadata line を解析できません: {e}");
            None
        }
    }
}

/// JSON 行が得られなかった場合、ジョブ ID 接頭辞で出力ファイルを探す。
async fn locate_output(dir: &Path, job_id: JobId) -> Option<PathBuf> {
    let prefix = format!("{job_id}.");
    let mut entries = tokio::fs::read_dir(dir).await.ok()?;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with(&prefix) && !name.ends_with(".part") && !name.ends_with(".ytdl") {
            return Some(entry.path());
        }
    }
    None
}

/// PATH 上でバイナリを検索する簡易ヘルパー。
fn which_binary(name: &Path) -> Option<PathBuf> {
    let name_str = name.to_string_lossy();
    if name_str.contains('/') || name_str.contains('\\') {
        return if name.exists() { Some(name.to_path_buf()) } else { None };
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|full| full.exists())
}

// ─── MediaFetcher 実装 ──────────────────────────────────────────

#[async_trait::async_trait]
impl MediaFetcher for YtDlpFetcher {
    async fn fetch(
        &self,
        request: &JobRequest,
        on_progress: ProgressFn<'_>,
    ) -> Result<Artifact, FetchError> {
        // config のスナップショットを取得（ロック保持を最小化）
        let config = self.config();

        tokio::fs::create_dir_all(&config.output_dir)
            .await
            .map_err(|e| {
                FetchError::spawn(format!(
                    "出力ディレクトリを作成できません {:?}: {e}",
                    config.output_dir
                ))
            })?;

        let spec = CommandSpec::new(&config.binary_path).args(Self::build_args(&config, request));
        let timeout = Duration::from_secs(config.timeout_secs);

        let mut tracker = ProgressTracker::new();
        let mut metadata: Option<YtDlpMetadata> = None;

        run_streaming(&spec, timeout, |source, line| {
            if source == LineSource::Stdout {
                if let Some(meta) = parse_metadata_line(line) {
                    metadata = Some(meta);
                    return;
                }
            }
            if let Some(progress) = tracker.observe(line) {
                on_progress(progress);
            }
        })
        .await?;

        let metadata = metadata.unwrap_or_default();
        let path = match metadata.filepath.as_deref().filter(|p| !p.is_empty()) {
            Some(p) => PathBuf::from(p),
            None => locate_output(&config.output_dir, request.job_id)
                .await
                .ok_or_else(|| {
                    FetchError::missing_output(format!(
                        "yt-dlp は正常終了しましたが出力ファイルが見つかりません ({:?})",
                        config.output_dir
                    ))
                })?,
        };

        let stat = tokio::fs::metadata(&path).await.map_err(|e| {
            FetchError::missing_output(format!("出力ファイルを確認できません {path:?}: {e}"))
        })?;
        if !stat.is_file() {
            return Err(FetchError::missing_output(format!(
                "出力パスがファイルではありません: {path:?}"
            )));
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        log::info!(
            "yt-dlp finished job {}: {} ({} bytes)",
            request.job_id,
            file_name,
            stat.len()
        );

        Ok(Artifact {
            file_name,
            file_size_bytes: stat.len(),
            file_path: path.to_string_lossy().into_owned(),
            media_kind: request.media_kind,
            thumbnail_url: metadata.thumbnail.filter(|t| !t.is_empty()),
            title: metadata.title,
            duration_seconds: metadata
                .duration
                .filter(|d| d.is_finite() && *d >= 0.0)
                .map(|d| d.round() as u64),
        })
    }

    fn name(&self) -> &str {
        "yt-dlp"
    }

    fn apply_settings(&self, settings: &DownloadSettings) {
        let extra_args = self.config.read().extra_args.clone();
        self.update_config(YtDlpConfig {
            extra_args,
            ..YtDlpConfig::from_settings(settings)
        });
    }
}

// ─── テスト ─────────────────────────────────────────────────────

use std::sync::Arc;
use std::time::Duration;

use mf_core::domain::error::{AppError, ErrorCode};
use mf_core::domain::job::{JobId, JobRecord};
use mf_core::domain::settings::DownloadSettings;
use mf_core::domain::types::{DownloadStats, HistoryPage, Platform, SubmitRequest, SweepReport};
use mf_core::usecase::app_service::AppService;

use crate::events::{self, ConsoleObserver};

/// wait_terminal に与える、ジョブタイムアウトを超える余裕
const WAIT_MARGIN: Duration = Duration::from_secs(30);

/// コマンドエラー型
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("{0}")]
    App(#[from] AppError),
    #[error("不正な引数: {0}")]
    InvalidArgument(String),
    #[error("JSON 変換失敗: {0}")]
    Json(#[from] serde_json::Error),
}

impl CommandError {
    /// error イベント用に AppError 形へ寄せる
    pub fn to_app_error(&self) -> AppError {
        match self {
            Self::App(e) => e.clone(),
            other => AppError::invalid_request(other.to_string()),
        }
    }
}

pub type CmdResult<T> = Result<T, CommandError>;

#[derive(Debug, Clone)]
pub struct FetchArgs {
    pub url: String,
    pub audio: bool,
    pub quality: Option<String>,
    pub platform: Option<String>,
}

/// 投入して進捗を流し、終端まで待つ。Ctrl-C でキャンセルする。
pub async fn fetch(service: &AppService, args: FetchArgs) -> CmdResult<JobRecord> {
    let mut request = if args.audio {
        SubmitRequest::audio(args.url)
    } else {
        SubmitRequest::video(args.url)
    };
    if let Some(quality) = args.quality {
        request = request.with_quality(quality);
    }
    if let Some(platform) = args.platform.as_deref() {
        let parsed = Platform::parse(platform)
            .ok_or_else(|| CommandError::InvalidArgument(format!("platform: {platform}")))?;
        request.platform = Some(parsed);
    }

    let job_id = service.submit(request)?;
    let subscription = service.subscribe(job_id, Arc::new(ConsoleObserver)).await?;
    let limit = service.get_settings().job_timeout() + WAIT_MARGIN;

    let record = tokio::select! {
        record = service.wait_terminal(job_id, limit) => record?,
        _ = tokio::signal::ctrl_c() => {
            log::info!("job {job_id}: Ctrl-C を受信、キャンセルします");
            match service.cancel(job_id).await {
                Ok(record) => record,
                // 直前に終端へ到達していた
                Err(e) if e.code == ErrorCode::NotFound => service.status(job_id).await?,
                Err(e) => return Err(e.into()),
            }
        }
    };

    service.unsubscribe(job_id, subscription);
    events::emit_terminal(&record);
    Ok(record)
}

pub async fn status(service: &AppService, id: &str) -> CmdResult<JobRecord> {
    let job_id = JobId::parse(id)?;
    Ok(service.status(job_id).await?)
}

pub fn history(service: &AppService, limit: u32, cursor: Option<&str>) -> CmdResult<HistoryPage> {
    Ok(service.history(limit, cursor)?)
}

pub fn stats(service: &AppService) -> CmdResult<DownloadStats> {
    Ok(service.stats()?)
}

pub async fn cleanup(service: &AppService, hours: Option<u64>) -> CmdResult<SweepReport> {
    let hours = hours.unwrap_or(service.get_settings().retention_hours);
    Ok(service.cleanup_expired(hours).await?)
}

pub fn get_settings(service: &AppService) -> DownloadSettings {
    service.get_settings()
}

/// 1 項目だけ更新する。値は JSON として解釈し、失敗したら文字列として扱う。
pub fn set_setting(service: &AppService, key: &str, value: &str) -> CmdResult<DownloadSettings> {
    let updated = apply_setting(service.get_settings(), key, value)?;
    service.update_settings(updated.clone())?;
    Ok(updated)
}

fn apply_setting(
    current: DownloadSettings,
    key: &str,
    value: &str,
) -> CmdResult<DownloadSettings> {
    let mut json = serde_json::to_value(current)?;
    let fields = json
        .as_object_mut()
        .ok_or_else(|| CommandError::InvalidArgument("settings が object ではありません".into()))?;
    if !fields.contains_key(key) {
        return Err(CommandError::InvalidArgument(format!("未知の設定キー: {key}")));
    }

    let parsed = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    fields.insert(key.to_string(), parsed);
    Ok(serde_json::from_value(json)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_setting_number() {
        let updated = apply_setting(DownloadSettings::default(), "retention_hours", "6").unwrap();
        assert_eq!(updated.retention_hours, 6);
    }

    #[test]
    fn test_apply_setting_bare_string() {
        let updated =
            apply_setting(DownloadSettings::default(), "default_quality", "720p").unwrap();
        assert_eq!(updated.default_quality, "720p");

        let updated =
            apply_setting(DownloadSettings::default(), "output_dir", "/tmp/media").unwrap();
        assert_eq!(updated.output_dir, std::path::PathBuf::from("/tmp/media"));
    }

    #[test]
    fn test_apply_setting_unknown_key() {
        let err = apply_setting(DownloadSettings::default(), "nope", "1").unwrap_err();
        assert!(matches!(err, CommandError::InvalidArgument(_)));
    }

    #[test]
    fn test_apply_setting_type_mismatch() {
        let err =
            apply_setting(DownloadSettings::default(), "job_timeout_secs", "soon").unwrap_err();
        assert!(matches!(err, CommandError::Json(_)));
    }
}

use async_trait::async_trait;
use serde::Serialize;

use mf_core::domain::error::AppError;
use mf_core::domain::job::{JobRecord, JobStatus, JobUpdate};
use mf_core::usecase::notifier::{ObserverError, ProgressObserver};

/// イベント名定数
pub const JOB_PROGRESS: &str = "job_progress";
pub const JOB_COMPLETED: &str = "job_completed";
pub const JOB_FAILED: &str = "job_failed";
pub const ERROR: &str = "error";

#[derive(Serialize)]
struct Envelope<'a, S: Serialize> {
    event: &'a str,
    payload: S,
}

/// 統一イベント送信関数。stdout に 1 行 1 イベントの JSON を書く。
pub fn emit_event<S: Serialize>(event_name: &str, payload: S) {
    match serde_json::to_string(&Envelope {
        event: event_name,
        payload,
    }) {
        Ok(line) => println!("{line}"),
        Err(e) => log::error!("イベント送信失敗 [{event_name}]: {e}"),
    }
}

/// job_progress ペイロード
#[derive(Debug, Clone, Serialize)]
pub struct JobProgressPayload {
    pub job_id: String,
    pub status: String,
    pub progress: u8,
    pub timestamp: String,
}

/// job_completed ペイロード
#[derive(Debug, Clone, Serialize)]
pub struct JobCompletedPayload {
    pub job_id: String,
    pub file_name: String,
    pub file_path: String,
    pub file_size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<u64>,
}

/// job_failed ペイロード
#[derive(Debug, Clone, Serialize)]
pub struct JobFailedPayload {
    pub job_id: String,
    pub code: String,
    pub message: String,
}

/// error ペイロード
#[derive(Debug, Clone, Serialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
    pub recoverable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

impl ErrorPayload {
    pub fn from_app(error: &AppError, job_id: Option<String>) -> Self {
        Self {
            code: error.code.as_str().to_string(),
            message: error.message.clone(),
            recoverable: error.recoverable,
            job_id,
        }
    }
}

/// 終端レコードを job_completed / job_failed として送る。
pub fn emit_terminal(record: &JobRecord) {
    let job_id = record.job_id.to_string();
    match (record.status, &record.artifact, &record.failure) {
        (JobStatus::Completed, Some(artifact), _) => emit_event(
            JOB_COMPLETED,
            JobCompletedPayload {
                job_id,
                file_name: artifact.file_name.clone(),
                file_path: artifact.file_path.clone(),
                file_size_bytes: artifact.file_size_bytes,
                title: artifact.title.clone(),
                duration_seconds: artifact.duration_seconds,
            },
        ),
        (JobStatus::Failed, _, Some(failure)) => emit_event(
            JOB_FAILED,
            JobFailedPayload {
                job_id,
                code: failure.code.as_str().to_string(),
                message: failure.message.clone(),
            },
        ),
        (status, _, _) => log::warn!("job {job_id} は終端状態ではありません: {}", status.as_str()),
    }
}

/// 進捗を job_progress として書き出すオブザーバー。終端はコマンド側が送る。
pub struct ConsoleObserver;

#[async_trait]
impl ProgressObserver for ConsoleObserver {
    async fn on_update(&self, update: &JobUpdate) -> Result<(), ObserverError> {
        if update.is_terminal() {
            return Ok(());
        }
        emit_event(
            JOB_PROGRESS,
            JobProgressPayload {
                job_id: update.job_id.to_string(),
                status: update.status.as_str().to_string(),
                progress: update.progress,
                timestamp: chrono::Utc::now().to_rfc3339(),
            },
        );
        Ok(())
    }
}

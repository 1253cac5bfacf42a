use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{AppError, ErrorCode};
use super::types::{JobRequest, MediaKind, Platform};

/// ジョブ識別子 (UUID v4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, AppError> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|e| AppError::invalid_request(format!("不正なジョブID '{s}': {e}")))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// ジョブ状態（前進のみ）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "PROCESSING" => Some(Self::Processing),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// 完了時の成果物メタデータ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub file_name: String,
    pub file_size_bytes: u64,
    pub file_path: String,
    pub media_kind: MediaKind,
    pub thumbnail_url: Option<String>,
    pub title: Option<String>,
    pub duration_seconds: Option<u64>,
}

/// 失敗理由
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobFailure {
    pub code: ErrorCode,
    pub message: String,
}

impl JobFailure {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorCode::Cancelled, "ジョブはキャンセルされました")
    }
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)
    }
}

/// ジョブレコード。実行中はスケジューラが単独で書き換える。
///
/// 不変条件:
/// - status は前進のみ (PENDING → PROCESSING → COMPLETED | FAILED, PENDING → FAILED)
/// - progress は単調非減少、100 になるのは COMPLETED と同時のみ
/// - artifact は COMPLETED のときだけ、failure は FAILED のときだけ存在する
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub source_url: String,
    pub platform: Platform,
    pub media_kind: MediaKind,
    pub quality: String,
    pub status: JobStatus,
    pub progress: u8,
    pub artifact: Option<Artifact>,
    pub failure: Option<JobFailure>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(request: &JobRequest, now: DateTime<Utc>) -> Self {
        Self {
            job_id: request.job_id,
            source_url: request.source_url.clone(),
            platform: request.platform,
            media_kind: request.media_kind,
            quality: request.quality.clone(),
            status: JobStatus::Pending,
            progress: 0,
            artifact: None,
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// PENDING → PROCESSING
    pub fn start_processing(&mut self, now: DateTime<Utc>) -> Result<StatusTransition, AppError> {
        match self.status {
            JobStatus::Pending => Ok(self.transition(JobStatus::Processing, now)),
            other => Err(AppError::invalid_state(format!(
                "start_processing は {} 状態では実行できません",
                other.as_str()
            ))),
        }
    }

    /// 進捗を反映する。減少・重複・100 以上は無視して false を返す。
    pub fn apply_progress(&mut self, progress: u8, now: DateTime<Utc>) -> bool {
        if self.status != JobStatus::Processing {
            return false;
        }
        // 100 は完了時にのみ書き込む
        if progress >= 100 || progress <= self.progress {
            return false;
        }
        self.progress = progress;
        self.updated_at = now;
        true
    }

    /// PROCESSING → COMPLETED。成果物と progress=100 を同時に書き込む。
    pub fn complete(
        &mut self,
        artifact: Artifact,
        now: DateTime<Utc>,
    ) -> Result<StatusTransition, AppError> {
        match self.status {
            JobStatus::Processing => {
                self.artifact = Some(artifact);
                self.progress = 100;
                Ok(self.transition(JobStatus::Completed, now))
            }
            other => Err(AppError::invalid_state(format!(
                "complete は {} 状態では実行できません",
                other.as_str()
            ))),
        }
    }

    /// PENDING | PROCESSING → FAILED
    pub fn fail(
        &mut self,
        failure: JobFailure,
        now: DateTime<Utc>,
    ) -> Result<StatusTransition, AppError> {
        match self.status {
            JobStatus::Pending | JobStatus::Processing => {
                self.failure = Some(failure);
                Ok(self.transition(JobStatus::Failed, now))
            }
            other => Err(AppError::invalid_state(format!(
                "fail は {} 状態では実行できません",
                other.as_str()
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// 通知用のスナップショット
    pub fn to_update(&self) -> JobUpdate {
        JobUpdate {
            job_id: self.job_id,
            status: self.status,
            progress: self.progress,
            failure: self.failure.clone(),
        }
    }

    fn transition(&mut self, next: JobStatus, now: DateTime<Utc>) -> StatusTransition {
        let prev = self.status;
        self.status = next;
        self.updated_at = now;
        StatusTransition {
            job_id: self.job_id,
            prev_status: prev,
            new_status: next,
        }
    }
}

/// 状態遷移イベントペイロード
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusTransition {
    pub job_id: JobId,
    pub prev_status: JobStatus,
    pub new_status: JobStatus,
}

/// オブザーバーに配信する進捗更新
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobUpdate {
    pub job_id: JobId,
    pub status: JobStatus,
    pub progress: u8,
    pub failure: Option<JobFailure>,
}

impl JobUpdate {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

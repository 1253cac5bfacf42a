use serde::{Deserialize, Serialize};

/// アプリケーション共通エラーコード
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "E_INVALID_REQUEST")]
    InvalidRequest,
    #[serde(rename = "E_ALREADY_RUNNING")]
    AlreadyRunning,
    #[serde(rename = "E_NOT_FOUND")]
    NotFound,
    #[serde(rename = "E_PROCESS_FAILURE")]
    ProcessFailure,
    #[serde(rename = "E_TIMEOUT")]
    Timeout,
    #[serde(rename = "E_CANCELLED")]
    Cancelled,
    #[serde(rename = "E_PERSISTENCE")]
    Persistence,
    /// 再起動時に PROCESSING のまま残っていたジョブ
    #[serde(rename = "E_ORPHANED")]
    Orphaned,
    #[serde(rename = "E_INVALID_STATE")]
    InvalidState,
    #[serde(rename = "E_INTERNAL")]
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidRequest => "E_INVALID_REQUEST",
            Self::AlreadyRunning => "E_ALREADY_RUNNING",
            Self::NotFound => "E_NOT_FOUND",
            Self::ProcessFailure => "E_PROCESS_FAILURE",
            Self::Timeout => "E_TIMEOUT",
            Self::Cancelled => "E_CANCELLED",
            Self::Persistence => "E_PERSISTENCE",
            Self::Orphaned => "E_ORPHANED",
            Self::InvalidState => "E_INVALID_STATE",
            Self::Internal => "E_INTERNAL",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "E_INVALID_REQUEST" => Self::InvalidRequest,
            "E_ALREADY_RUNNING" => Self::AlreadyRunning,
            "E_NOT_FOUND" => Self::NotFound,
            "E_PROCESS_FAILURE" => Self::ProcessFailure,
            "E_TIMEOUT" => Self::Timeout,
            "E_CANCELLED" => Self::Cancelled,
            "E_PERSISTENCE" => Self::Persistence,
            "E_ORPHANED" => Self::Orphaned,
            "E_INVALID_STATE" => Self::InvalidState,
            _ => Self::Internal,
        }
    }
}

/// アプリケーションエラー（イベントペイロード兼用）
#[derive(Debug, Clone, Serialize)]
pub struct AppError {
    pub code: ErrorCode,
    pub message: String,
    pub recoverable: bool,
}

impl AppError {
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::InvalidRequest,
            message: msg.into(),
            recoverable: false,
        }
    }

    pub fn already_running(msg: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::AlreadyRunning,
            message: msg.into(),
            recoverable: true,
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::NotFound,
            message: msg.into(),
            recoverable: false,
        }
    }

    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::InvalidState,
            message: msg.into(),
            recoverable: true,
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Internal,
            message: msg.into(),
            recoverable: false,
        }
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self {
            code: ErrorCode::Persistence,
            message: msg.into(),
            recoverable: true,
        }
    }
}

impl std::fmt::Display for AppError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for AppError {}

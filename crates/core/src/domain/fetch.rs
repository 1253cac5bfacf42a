use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::error::ErrorCode;
use super::job::{Artifact, JobFailure};
use super::settings::DownloadSettings;
use super::types::JobRequest;

// ─── FetchError ──────────────────────────────────────────────────

/// 取得処理（外部プロセス）で発生するエラー。境界を越えて panic させず、必ず値で返す。
#[derive(Debug, Clone)]
pub struct FetchError {
    /// エラー種別
    pub kind: FetchErrorKind,
    /// 人間が読める詳細メッセージ
    pub detail: String,
}

/// 取得エラー種別。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchErrorKind {
    /// プロセスを起動できなかった (バイナリ未検出、権限不足等)
    Spawn,
    /// 非ゼロ終了
    NonZeroExit,
    /// 正常終了したが出力ファイルが無い
    MissingOutput,
    /// ウォールクロックタイムアウト
    Timeout,
    /// キャンセル要求による強制終了
    Cancelled,
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FetchError::{:?}: {}", self.kind, self.detail)
    }
}

impl std::error::Error for FetchError {}

impl FetchError {
    pub fn spawn(detail: impl Into<String>) -> Self {
        Self { kind: FetchErrorKind::Spawn, detail: detail.into() }
    }

    pub fn non_zero_exit(detail: impl Into<String>) -> Self {
        Self { kind: FetchErrorKind::NonZeroExit, detail: detail.into() }
    }

    pub fn missing_output(detail: impl Into<String>) -> Self {
        Self { kind: FetchErrorKind::MissingOutput, detail: detail.into() }
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        Self { kind: FetchErrorKind::Timeout, detail: detail.into() }
    }

    pub fn cancelled() -> Self {
        Self { kind: FetchErrorKind::Cancelled, detail: "cancelled".into() }
    }

    /// ジョブレコードに書き込む失敗理由へ変換する。
    pub fn to_failure(&self) -> JobFailure {
        match self.kind {
            FetchErrorKind::Timeout => JobFailure::new(ErrorCode::Timeout, self.detail.clone()),
            FetchErrorKind::Cancelled => JobFailure::cancelled(),
            FetchErrorKind::Spawn
            | FetchErrorKind::NonZeroExit
            | FetchErrorKind::MissingOutput => {
                JobFailure::new(ErrorCode::ProcessFailure, self.detail.clone())
            }
        }
    }
}

// ─── MediaFetcher ────────────────────────────────────────────────

/// 進捗コールバック。値は 0–100、呼び出しごとに単調増加。
pub type ProgressFn<'a> = &'a (dyn Fn(u8) + Send + Sync);

/// メディア取得エンジン trait。
///
/// 実装はキャンセル安全であること: future が drop されたら子プロセスも終了させる。
#[async_trait]
pub trait MediaFetcher: Send + Sync {
    async fn fetch(
        &self,
        request: &JobRequest,
        on_progress: ProgressFn<'_>,
    ) -> Result<Artifact, FetchError>;

    fn name(&self) -> &str;

    /// 設定更新を反映する。既定では何もしない。
    fn apply_settings(&self, _settings: &DownloadSettings) {}
}

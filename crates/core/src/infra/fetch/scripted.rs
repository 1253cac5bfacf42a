use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use crate::domain::fetch::{FetchError, MediaFetcher, ProgressFn};
use crate::domain::job::Artifact;
use crate::domain::types::{JobRequest, MediaKind};

/// 最後に返す結果
#[derive(Debug, Clone)]
enum Outcome {
    Succeed { file_size_bytes: u64 },
    Fail(FetchError),
    /// キャンセルかタイムアウトされるまで終わらない
    Hang,
}

/// ScriptedFetcher: 決められた進捗列を流して決められた結果を返す実装。
/// テストと `--dry-run` 用。外部プロセスは起動しない。
pub struct ScriptedFetcher {
    steps: Vec<u8>,
    step_delay: Duration,
    outcome: Outcome,
    gate: Option<Arc<Notify>>,
    output_dir: Option<PathBuf>,
    calls: AtomicUsize,
}

impl Default for ScriptedFetcher {
    fn default() -> Self {
        Self::new(vec![10, 50, 90, 100])
    }
}

impl ScriptedFetcher {
    pub fn new(steps: Vec<u8>) -> Self {
        Self {
            steps,
            step_delay: Duration::ZERO,
            outcome: Outcome::Succeed { file_size_bytes: 1024 },
            gate: None,
            output_dir: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// 進捗ステップ間の待ち時間
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    pub fn failing(mut self, error: FetchError) -> Self {
        self.outcome = Outcome::Fail(error);
        self
    }

    pub fn hanging(mut self) -> Self {
        self.outcome = Outcome::Hang;
        self
    }

    /// 進捗を流した後、`gate` が通知されるまで結果を返さない。
    pub fn gated(mut self, gate: Arc<Notify>) -> Self {
        self.gate = Some(gate);
        self
    }

    /// 指定時は成果物ファイルを実際に書き出す。
    pub fn writing_to(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = Some(dir.into());
        self
    }

    /// fetch が呼ばれた回数
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    async fn write_artifact(
        &self,
        request: &JobRequest,
        file_size_bytes: u64,
    ) -> Result<Artifact, FetchError> {
        let ext = match request.media_kind {
            MediaKind::Video => "mp4",
            MediaKind::Audio => "mp3",
        };
        let file_name = format!("{}.{ext}", request.job_id);

        let file_path = match &self.output_dir {
            Some(dir) => {
                let path = dir.join(&file_name);
                tokio::fs::create_dir_all(dir)
                    .await
                    .map_err(|e| FetchError::spawn(format!("出力ディレクトリを作成できません: {e}")))?;
                let size = usize::try_from(file_size_bytes).unwrap_or(usize::MAX);
                tokio::fs::write(&path, vec![0u8; size])
                    .await
                    .map_err(|e| FetchError::missing_output(format!("書き込みに失敗: {e}")))?;
                path
            }
            None => PathBuf::from(&file_name),
        };

        Ok(Artifact {
            file_name,
            file_size_bytes,
            file_path: file_path.to_string_lossy().into_owned(),
            media_kind: request.media_kind,
            thumbnail_url: None,
            title: Some("Scripted media".to_string()),
            duration_seconds: Some(1),
        })
    }
}

#[async_trait]
impl MediaFetcher for ScriptedFetcher {
    async fn fetch(
        &self,
        request: &JobRequest,
        on_progress: ProgressFn<'_>,
    ) -> Result<Artifact, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        for &step in &self.steps {
            if !self.step_delay.is_zero() {
                tokio::time::sleep(self.step_delay).await;
            }
            on_progress(step);
        }

        if let Some(gate) = &self.gate {
            gate.notified().await;
        }

        match &self.outcome {
            Outcome::Succeed { file_size_bytes } => {
                self.write_artifact(request, *file_size_bytes).await
            }
            Outcome::Fail(err) => Err(err.clone()),
            Outcome::Hang => {
                std::future::pending::<()>().await;
                Err(FetchError::cancelled())
            }
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

mod repository;

pub use repository::Storage;

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use crate::domain::error::AppError;
use crate::domain::job::{JobId, JobRecord};
use crate::domain::store::JobStore;

/// リトライ間の基本待ち時間（試行ごとに倍増）
const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// `Storage` を共有する JobStore 実装。
#[derive(Clone)]
pub struct SqliteJobStore {
    storage: Arc<Mutex<Storage>>,
    retries: u32,
    owner: Option<String>,
}

impl SqliteJobStore {
    pub fn new(storage: Arc<Mutex<Storage>>, retries: u32) -> Self {
        Self {
            storage,
            retries,
            owner: None,
        }
    }

    /// 保存する行に書き込み元のサービスインスタンス id を付ける。
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn persist(&self, record: &JobRecord) -> Result<(), AppError> {
        let mut attempt = 0u32;
        loop {
            let result = self
                .storage
                .lock()
                .upsert_job_owned(record, self.owner.as_deref());
            match result {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.retries => {
                    attempt += 1;
                    log::warn!(
                        "ジョブ {} の保存に失敗 (attempt {attempt}/{}): {e}",
                        record.job_id,
                        self.retries
                    );
                    tokio::time::sleep(RETRY_BACKOFF * 2u32.saturating_pow(attempt - 1)).await;
                }
                Err(e) => {
                    return Err(AppError::storage(format!(
                        "ジョブ {} の保存を {} 回試行して断念: {}",
                        record.job_id,
                        attempt + 1,
                        e.message
                    )));
                }
            }
        }
    }

    async fn load(&self, job_id: JobId) -> Result<Option<JobRecord>, AppError> {
        self.storage.lock().get_job(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::job::JobStatus;
    use crate::domain::types::{JobRequest, SubmitRequest};

    #[tokio::test]
    async fn test_persist_and_load() {
        let storage = Arc::new(Mutex::new(Storage::open_in_memory().unwrap()));
        let store = SqliteJobStore::new(storage.clone(), 3);

        let req = JobRequest::from_submit(
            JobId::new(),
            &SubmitRequest::video("https://youtube.com/watch?v=abc"),
            "best",
        )
        .unwrap();
        let record = JobRecord::new(&req, chrono::Utc::now());

        store.persist(&record).await.unwrap();
        store.persist(&record).await.unwrap();

        let loaded = store.load(record.job_id).await.unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Pending);
        assert!(store.load(JobId::new()).await.unwrap().is_none());

        // 同じ Storage を共有している
        assert!(storage.lock().get_job(record.job_id).unwrap().is_some());
    }
}

use async_trait::async_trait;

use super::error::AppError;
use super::job::{JobId, JobRecord};

/// ジョブレコードの永続化シンク。
///
/// `persist` はレコード全体の upsert で、同じ内容を何度呼んでも結果は変わらない。
/// リトライは実装側で有限回行い、最終的に失敗したら `E_PERSISTENCE` を返す。
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn persist(&self, record: &JobRecord) -> Result<(), AppError>;

    async fn load(&self, job_id: JobId) -> Result<Option<JobRecord>, AppError>;
}

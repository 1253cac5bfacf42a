use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::domain::error::{AppError, ErrorCode};
use crate::domain::fetch::MediaFetcher;
use crate::domain::job::{Artifact, JobFailure, JobId, JobRecord, JobStatus};
use crate::domain::settings::DownloadSettings;
use crate::domain::store::JobStore;
use crate::domain::types::{JobRequest, SubmitRequest};
use crate::infra::metrics::Metrics;

use super::notifier::{ProgressNotifier, ProgressObserver, SubscriptionId};
use super::registry::JobRegistry;

/// cancel() が終端状態を待つ上限
const CANCEL_WAIT: Duration = Duration::from_secs(5);

/// スケジューラ設定
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// ジョブ単位のウォールクロックタイムアウト
    pub job_timeout: Duration,
    /// 画質指定が無い場合の既定値
    pub default_quality: String,
}

impl From<&DownloadSettings> for SchedulerConfig {
    fn from(settings: &DownloadSettings) -> Self {
        Self {
            job_timeout: settings.job_timeout(),
            default_quality: settings.default_quality.clone(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&DownloadSettings::default())
    }
}

/// 取得処理の結果
enum Outcome {
    Completed(Artifact),
    Failed(JobFailure),
}

/// メモリ上のジョブ。record は実行タスクだけが書き換える。
struct JobEntry {
    record: RwLock<JobRecord>,
    done: watch::Sender<bool>,
    /// 終端レコードがストアに書けたか。書けるまではメモリから落とさない。
    persisted: AtomicBool,
}

struct SchedulerInner {
    registry: JobRegistry,
    notifier: ProgressNotifier,
    jobs: RwLock<HashMap<JobId, Arc<JobEntry>>>,
    handles: Mutex<HashMap<JobId, JoinHandle<()>>>,
    fetcher: Arc<dyn MediaFetcher>,
    store: Arc<dyn JobStore>,
    metrics: Arc<Metrics>,
    config: RwLock<SchedulerConfig>,
}

/// ジョブスケジューラ: 投入 → 取得処理 → 進捗反映 → 終端処理 → スロット解放
pub struct JobScheduler {
    inner: Arc<SchedulerInner>,
}

impl JobScheduler {
    pub fn new(
        fetcher: Arc<dyn MediaFetcher>,
        store: Arc<dyn JobStore>,
        notifier: ProgressNotifier,
        metrics: Arc<Metrics>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                registry: JobRegistry::new(),
                notifier,
                jobs: RwLock::new(HashMap::new()),
                handles: Mutex::new(HashMap::new()),
                fetcher,
                store,
                metrics,
                config: RwLock::new(config),
            }),
        }
    }

    pub fn update_config(&self, config: SchedulerConfig) {
        *self.inner.config.write() = config;
    }

    pub fn config(&self) -> SchedulerConfig {
        self.inner.config.read().clone()
    }

    /// ジョブを投入する。呼び出し側が待つのはスロット確保まで。
    ///
    /// tokio ランタイム上で呼ぶこと。
    pub fn submit(&self, submit: SubmitRequest) -> Result<JobId, AppError> {
        let inner = &self.inner;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| AppError::internal(format!("tokio ランタイム外から submit されました: {e}")))?;

        let job_id = JobId::new();
        let default_quality = inner.config.read().default_quality.clone();
        let request = match JobRequest::from_submit(job_id, &submit, &default_quality) {
            Ok(request) => request,
            Err(e) => {
                inner.metrics.inc_jobs_rejected(e.code);
                return Err(e);
            }
        };

        // レコード作成より前にスロットを確保する（拒否時は何も残さない）
        let fingerprint = request.fingerprint();
        let Some(cancel_rx) = inner.registry.reserve(fingerprint.clone(), job_id) else {
            inner.metrics.inc_jobs_rejected(ErrorCode::AlreadyRunning);
            let holder = inner
                .registry
                .holder_of(&fingerprint)
                .map(|id| id.to_string())
                .unwrap_or_default();
            log::info!("submit rejected: {fingerprint} is already running ({holder})");
            return Err(AppError::already_running(format!(
                "同じダウンロードが実行中です (job {holder})"
            )));
        };

        let record = JobRecord::new(&request, Utc::now());
        let (done, _) = watch::channel(false);
        inner.jobs.write().insert(
            job_id,
            Arc::new(JobEntry {
                record: RwLock::new(record),
                done,
                persisted: AtomicBool::new(false),
            }),
        );

        let guard = FinalizeGuard {
            inner: inner.clone(),
            job_id,
            armed: true,
        };

        // タスクが自分のハンドルを外す前に登録を終えるため、spawn もロック内で行う
        {
            let mut handles = inner.handles.lock();
            let handle = runtime.spawn(run_job(inner.clone(), request, cancel_rx, guard));
            handles.insert(job_id, handle);
        }

        inner.metrics.inc_jobs_submitted();
        log::info!("job {job_id} submitted: {} ({fingerprint})", submit.url.trim());
        Ok(job_id)
    }

    /// 現在のスナップショット。メモリに無ければストアを参照する。
    pub async fn status(&self, job_id: JobId) -> Result<JobRecord, AppError> {
        if let Some(entry) = self.inner.entry(job_id) {
            return Ok(entry.record.read().clone());
        }
        self.inner
            .store
            .load(job_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("ジョブ {job_id} が見つかりません")))
    }

    /// キャンセルを要求し、終端状態になるまで（上限付きで）待つ。
    pub async fn cancel(&self, job_id: JobId) -> Result<JobRecord, AppError> {
        if !self.inner.registry.signal_cancel(job_id) {
            return Err(AppError::not_found(format!(
                "ジョブ {job_id} は実行中ではありません"
            )));
        }
        log::info!("job {job_id}: cancel signalled");
        self.wait_terminal(job_id, CANCEL_WAIT).await
    }

    /// 終端状態まで待つ。タイムアウトした場合はその時点のスナップショットを返す。
    pub async fn wait_terminal(
        &self,
        job_id: JobId,
        timeout: Duration,
    ) -> Result<JobRecord, AppError> {
        let Some(entry) = self.inner.entry(job_id) else {
            return self.status(job_id).await;
        };

        let mut done = entry.done.subscribe();
        if tokio::time::timeout(timeout, done.wait_for(|d| *d))
            .await
            .is_err()
        {
            log::warn!("job {job_id}: 終端状態を {}ms 以内に確認できません", timeout.as_millis());
        }
        let snapshot = entry.record.read().clone();
        Ok(snapshot)
    }

    /// 進捗オブザーバーを登録する。既に終端なら終端更新だけが即座に届く。
    pub async fn subscribe(
        &self,
        job_id: JobId,
        observer: Arc<dyn ProgressObserver>,
    ) -> Result<SubscriptionId, AppError> {
        if let Some(entry) = self.inner.entry(job_id) {
            // 読み取りロック中に登録し、スナップショットと以降の更新の間に欠落を作らない
            let record = entry.record.read();
            let id = self
                .inner
                .notifier
                .subscribe(job_id, observer, Some(record.to_update()));
            return Ok(id);
        }

        let record = self.status(job_id).await?;
        Ok(self
            .inner
            .notifier
            .subscribe(job_id, observer, Some(record.to_update())))
    }

    pub fn unsubscribe(&self, job_id: JobId, id: SubscriptionId) -> bool {
        self.inner.notifier.unsubscribe(job_id, id)
    }

    /// レジストリにスロットがあるか（保持期間スイープが削除してよいかの判定に使う）
    pub fn is_active(&self, job_id: JobId) -> bool {
        self.inner.registry.is_active(job_id)
    }

    pub fn active_ids(&self) -> Vec<JobId> {
        self.inner.registry.active_ids()
    }

    /// 終端レコードの書き込みに失敗したジョブを再保存する。保存できた件数を返す。
    pub async fn flush_terminal(&self) -> usize {
        let unsaved: Vec<(Arc<JobEntry>, JobRecord)> = self
            .inner
            .jobs
            .read()
            .values()
            .filter(|entry| !entry.persisted.load(Ordering::Acquire))
            .filter_map(|entry| {
                let record = entry.record.read();
                record
                    .is_terminal()
                    .then(|| (entry.clone(), record.clone()))
            })
            .collect();

        let mut flushed = 0;
        for (entry, record) in unsaved {
            if self.inner.persist(&record).await {
                entry.persisted.store(true, Ordering::Release);
                log::info!("job {}: 終端レコードを再保存しました", record.job_id);
                flushed += 1;
            }
        }
        flushed
    }

    /// `older_than` 以上前に終端になったジョブをメモリから落とす（ストアには残る）。
    ///
    /// 終端レコードをまだ保存できていないジョブは残す。
    pub fn evict_terminal(&self, older_than: Duration) -> usize {
        let Some(cutoff) = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
        else {
            return 0;
        };
        let mut jobs = self.inner.jobs.write();
        let before = jobs.len();
        jobs.retain(|job_id, entry| {
            let record = entry.record.read();
            let evict = record.is_terminal()
                && entry.persisted.load(Ordering::Acquire)
                && record.updated_at <= cutoff
                && !self.inner.registry.is_active(*job_id);
            !evict
        });
        before - jobs.len()
    }

    /// 全実行中ジョブへキャンセルを送る。
    pub fn cancel_all(&self) -> Vec<JobId> {
        let ids = self.inner.registry.signal_all();
        if !ids.is_empty() {
            log::info!("cancel_all: {} job(s) signalled", ids.len());
        }
        ids
    }

    /// 全ジョブをキャンセルし、`grace` 内に終わらないタスクは abort する。
    pub async fn shutdown(&self, grace: Duration) {
        self.cancel_all();

        let handles: Vec<(JobId, JoinHandle<()>)> =
            self.inner.handles.lock().drain().collect();
        let deadline = tokio::time::Instant::now() + grace;
        for (job_id, mut handle) in handles {
            if tokio::time::timeout_at(deadline, &mut handle).await.is_err() {
                log::warn!("job {job_id}: shutdown grace exceeded, aborting task");
                handle.abort();
                let _ = handle.await;
            }
        }
        self.inner.notifier.clear();
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }
}

impl SchedulerInner {
    fn entry(&self, job_id: JobId) -> Option<Arc<JobEntry>> {
        self.jobs.read().get(&job_id).cloned()
    }

    /// 永続化。失敗してもジョブは止めない（ログとメトリクスのみ）。成功なら true。
    async fn persist(&self, record: &JobRecord) -> bool {
        match self.store.persist(record).await {
            Ok(()) => true,
            Err(e) => {
                log::error!("job {}: 永続化に失敗しました: {e}", record.job_id);
                self.metrics.inc_persist_failures();
                false
            }
        }
    }

    /// 終端レコードを保存し、成功したらエントリに記録する。
    async fn persist_terminal(&self, record: &JobRecord) {
        if self.persist(record).await {
            if let Some(entry) = self.entry(record.job_id) {
                entry.persisted.store(true, Ordering::Release);
            }
        }
    }

    /// 終端処理。スロットを先に解放してから終端状態を書き込む。
    ///
    /// 既に終端なら何もせず None（重複完了は無視される）。
    fn finalize_now(&self, job_id: JobId, outcome: Outcome) -> Option<JobRecord> {
        let started_at = self.registry.started_at(job_id);
        self.registry.release(job_id);

        let Some(entry) = self.entry(job_id) else {
            log::error!("job {job_id}: 終端処理対象のレコードがありません");
            return None;
        };

        let now = Utc::now();
        let completed = matches!(outcome, Outcome::Completed(_));
        let result = {
            let mut record = entry.record.write();
            let transition = match outcome {
                Outcome::Completed(artifact) => record.complete(artifact, now),
                Outcome::Failed(failure) => record.fail(failure, now),
            };
            transition.map(|_| record.clone())
        };

        let record = match result {
            Ok(record) => record,
            Err(e) => {
                log::warn!("job {job_id}: 重複した終端処理を無視しました: {e}");
                return None;
            }
        };

        entry.done.send_replace(true);
        self.handles.lock().remove(&job_id);

        if completed {
            self.metrics.inc_jobs_completed();
            if let Some(started) = started_at {
                let elapsed = (now - started).num_milliseconds().max(0) as u64;
                self.metrics.record_latency("download", elapsed);
            }
            log::info!(
                "job {job_id} completed: {}",
                record
                    .artifact
                    .as_ref()
                    .map(|a| a.file_name.as_str())
                    .unwrap_or_default()
            );
        } else if let Some(failure) = &record.failure {
            self.metrics.inc_jobs_failed(failure.code);
            log::warn!("job {job_id} failed: {failure}");
        }

        self.notifier.publish(&record.to_update());
        Some(record)
    }
}

/// 実行タスクが終端処理を経ずに終わった（panic / abort）場合の後始末
struct FinalizeGuard {
    inner: Arc<SchedulerInner>,
    job_id: JobId,
    armed: bool,
}

impl FinalizeGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for FinalizeGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        log::error!("job {}: task ended without finalization", self.job_id);
        let failure = JobFailure::new(ErrorCode::Internal, "ジョブタスクが異常終了しました");
        let Some(record) = self.inner.finalize_now(self.job_id, Outcome::Failed(failure)) else {
            return;
        };
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let inner = self.inner.clone();
            runtime.spawn(async move { inner.persist_terminal(&record).await });
        }
    }
}

async fn run_job(
    inner: Arc<SchedulerInner>,
    request: JobRequest,
    mut cancel_rx: oneshot::Receiver<()>,
    mut guard: FinalizeGuard,
) {
    let job_id = request.job_id;
    let Some(entry) = inner.entry(job_id) else {
        return;
    };

    let pending = entry.record.read().clone();
    inner.persist(&pending).await;

    // PENDING のうちにキャンセルされていれば取得処理を起動しない
    if cancel_rx.try_recv().is_ok() {
        log::info!("job {job_id}: cancelled before dispatch");
        finish(&inner, &mut guard, Outcome::Failed(JobFailure::cancelled())).await;
        return;
    }

    let started = {
        let mut record = entry.record.write();
        record
            .start_processing(Utc::now())
            .map(|_| record.clone())
    };
    let processing = match started {
        Ok(record) => record,
        Err(e) => {
            log::error!("job {job_id}: cannot start: {e}");
            finish(
                &inner,
                &mut guard,
                Outcome::Failed(JobFailure::new(ErrorCode::InvalidState, e.message)),
            )
            .await;
            return;
        }
    };
    inner.persist(&processing).await;
    inner.notifier.publish(&processing.to_update());
    log::info!(
        "job {job_id} dispatched to {} ({} {})",
        inner.fetcher.name(),
        request.media_kind.as_str(),
        request.quality
    );

    let timeout = inner.config.read().job_timeout;

    // 進捗スナップショットは watch で集約し、別タスクで永続化する
    let (snap_tx, snap_rx) = watch::channel(processing);
    let snapshot_writer = tokio::spawn(persist_snapshots(inner.clone(), snap_rx));
    let on_progress = {
        let entry = entry.clone();
        let inner = inner.clone();
        move |progress: u8| {
            let update = {
                let mut record = entry.record.write();
                if record.apply_progress(progress, Utc::now()) {
                    snap_tx.send_replace(record.clone());
                    Some(record.to_update())
                } else {
                    None
                }
            };
            if let Some(update) = update {
                log::debug!("job {}: progress {}", update.job_id, update.progress);
                inner.notifier.publish(&update);
            }
        }
    };

    let outcome = {
        let fetch = tokio::time::timeout(timeout, inner.fetcher.fetch(&request, &on_progress));
        tokio::pin!(fetch);
        let mut cancel_live = true;

        loop {
            tokio::select! {
                biased;
                res = &mut cancel_rx, if cancel_live => match res {
                    Ok(()) => {
                        log::info!("job {job_id}: cancelling running fetch");
                        break Outcome::Failed(JobFailure::cancelled());
                    }
                    Err(_) => cancel_live = false,
                },
                res = &mut fetch => break match res {
                    Ok(Ok(artifact)) => Outcome::Completed(artifact),
                    Ok(Err(e)) => Outcome::Failed(e.to_failure()),
                    Err(_) => Outcome::Failed(JobFailure::new(
                        ErrorCode::Timeout,
                        format!("ジョブが {}s でタイムアウトしました", timeout.as_secs()),
                    )),
                },
            }
        }
        // ここで fetch future が drop され、子プロセスは kill される
    };

    // 終端レコードの後に古い PROCESSING が書かれないよう先に止める
    snapshot_writer.abort();
    finish(&inner, &mut guard, outcome).await;
}

/// 最新の PROCESSING スナップショットだけを書く。送信側が drop されたら終わる。
async fn persist_snapshots(
    inner: Arc<SchedulerInner>,
    mut snapshots: watch::Receiver<JobRecord>,
) {
    while snapshots.changed().await.is_ok() {
        let snapshot = snapshots.borrow_and_update().clone();
        if snapshot.status == JobStatus::Processing {
            inner.persist(&snapshot).await;
        }
    }
}

async fn finish(inner: &Arc<SchedulerInner>, guard: &mut FinalizeGuard, outcome: Outcome) {
    let record = inner.finalize_now(guard.job_id, outcome);
    guard.disarm();
    if let Some(record) = record {
        inner.persist_terminal(&record).await;
    }
}

use chrono::{DateTime, Local, Utc};
use parking_lot::{Mutex, RwLock};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;

use crate::domain::error::AppError;
use crate::domain::fetch::MediaFetcher;
use crate::domain::job::{JobId, JobRecord, JobStatus};
use crate::domain::settings::DownloadSettings;
use crate::domain::types::{DownloadStats, HistoryPage, SubmitRequest, SweepReport};
use crate::infra::metrics::{Metrics, MetricsSummary};
use crate::infra::storage::{SqliteJobStore, Storage};

use super::notifier::{ProgressNotifier, ProgressObserver, SubscriptionId};
use super::scheduler::{JobScheduler, SchedulerConfig};

/// stop() が実行中ジョブの終了を待つ上限
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// 生存を記録する間隔
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// これより古いハートビートのインスタンスは停止したとみなす
const INSTANCE_STALE_AFTER: Duration = Duration::from_secs(30);

/// アプリケーションサービス。起動時に明示的に構築し、呼び出し側へ渡して使う。
pub struct AppService {
    instance_id: String,
    storage: Arc<Mutex<Storage>>,
    scheduler: JobScheduler,
    fetcher: Arc<dyn MediaFetcher>,
    metrics: Arc<Metrics>,
    settings: RwLock<DownloadSettings>,
    /// start() で起動するスイープとハートビート
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl AppService {
    /// 保存済み設定を読み込んで構築する。ジョブはまだ受け付けない（`start` を呼ぶこと）。
    pub fn new(storage: Storage, fetcher: Arc<dyn MediaFetcher>) -> Result<Self, AppError> {
        let settings = storage.get_settings()?;
        Ok(Self::with_settings(storage, fetcher, settings))
    }

    pub fn with_settings(
        storage: Storage,
        fetcher: Arc<dyn MediaFetcher>,
        settings: DownloadSettings,
    ) -> Self {
        let instance_id = uuid::Uuid::new_v4().to_string();
        let storage = Arc::new(Mutex::new(storage));
        let metrics = Arc::new(Metrics::new());
        fetcher.apply_settings(&settings);

        let store = Arc::new(
            SqliteJobStore::new(storage.clone(), settings.persist_retries)
                .with_owner(instance_id.clone()),
        );
        let notifier =
            ProgressNotifier::new(settings.notify_interval()).with_metrics(metrics.clone());
        let scheduler = JobScheduler::new(
            fetcher.clone(),
            store,
            notifier,
            metrics.clone(),
            SchedulerConfig::from(&settings),
        );

        Self {
            instance_id,
            storage,
            scheduler,
            fetcher,
            metrics,
            settings: RwLock::new(settings),
            background: Mutex::new(Vec::new()),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    // ==================== Lifecycle ====================

    /// ジョブを実行するインスタンスとして登録し、停止済みインスタンスの残骸を
    /// ORPHANED にする。保持期間スイープとハートビートも開始する。孤立化した件数を返す。
    ///
    /// 同じ DB を読むだけのインスタンスは呼ばないこと。
    pub fn start(self: &Arc<Self>) -> Result<u32, AppError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| AppError::internal(format!("tokio ランタイム外から start されました: {e}")))?;

        self.storage.lock().heartbeat(&self.instance_id, Utc::now())?;
        let orphaned = self.reconcile_orphans()?;

        let mut background = self.background.lock();
        if background.is_empty() {
            let interval = self.settings.read().sweep_interval();
            background.push(runtime.spawn(sweep_loop(Arc::downgrade(self), interval)));
            background.push(runtime.spawn(heartbeat_loop(Arc::downgrade(self))));
            log::info!(
                "service {} started (fetcher: {}, sweep every {}s)",
                self.instance_id,
                self.fetcher.name(),
                interval.as_secs()
            );
        }
        Ok(orphaned)
    }

    /// バックグラウンド処理を止め、実行中ジョブをキャンセルして終了を待つ。
    pub async fn stop(&self) {
        let background: Vec<JoinHandle<()>> = self.background.lock().drain(..).collect();
        for handle in background {
            handle.abort();
        }
        self.scheduler.shutdown(SHUTDOWN_GRACE).await;
        if let Err(e) = self.storage.lock().remove_instance(&self.instance_id) {
            log::warn!("インスタンス登録の削除に失敗: {e}");
        }
        log::info!("service {} stopped", self.instance_id);
    }

    /// 生存していないインスタンスが残した PENDING / PROCESSING を ORPHANED にする。
    fn reconcile_orphans(&self) -> Result<u32, AppError> {
        let now = Utc::now();
        let live_since = chrono::Duration::from_std(INSTANCE_STALE_AFTER)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .ok_or_else(|| AppError::internal("ハートビート期限を計算できません"))?;
        let orphaned = self.storage.lock().mark_orphaned(now, live_since)?;
        if orphaned > 0 {
            log::warn!("{orphaned} 件の中断ジョブを ORPHANED として終了しました");
        }
        Ok(orphaned)
    }

    fn beat(&self) {
        let beat = self.storage.lock().heartbeat(&self.instance_id, Utc::now());
        if let Err(e) = beat.and_then(|_| self.reconcile_orphans()) {
            log::warn!("ハートビートに失敗: {e}");
        }
    }

    // ==================== Jobs ====================

    pub fn submit(&self, request: SubmitRequest) -> Result<JobId, AppError> {
        self.scheduler.submit(request)
    }

    pub async fn status(&self, job_id: JobId) -> Result<JobRecord, AppError> {
        self.scheduler.status(job_id).await
    }

    pub async fn cancel(&self, job_id: JobId) -> Result<JobRecord, AppError> {
        self.scheduler.cancel(job_id).await
    }

    pub async fn wait_terminal(
        &self,
        job_id: JobId,
        timeout: Duration,
    ) -> Result<JobRecord, AppError> {
        self.scheduler.wait_terminal(job_id, timeout).await
    }

    pub async fn subscribe(
        &self,
        job_id: JobId,
        observer: Arc<dyn ProgressObserver>,
    ) -> Result<SubscriptionId, AppError> {
        self.scheduler.subscribe(job_id, observer).await
    }

    pub fn unsubscribe(&self, job_id: JobId, id: SubscriptionId) -> bool {
        self.scheduler.unsubscribe(job_id, id)
    }

    pub fn is_active(&self, job_id: JobId) -> bool {
        self.scheduler.is_active(job_id)
    }

    /// 完了済みで、ファイルがまだ存在する場合だけパスを返す。
    pub async fn artifact_path(&self, job_id: JobId) -> Result<PathBuf, AppError> {
        let record = self.status(job_id).await?;
        let artifact = match (record.status, record.artifact) {
            (JobStatus::Completed, Some(artifact)) => artifact,
            _ => {
                return Err(AppError::not_found(format!(
                    "ジョブ {job_id} は完了していません"
                )))
            }
        };

        let path = PathBuf::from(&artifact.file_path);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(path),
            _ => Err(AppError::not_found(format!(
                "ファイルが見つかりません: {}",
                path.display()
            ))),
        }
    }

    // ==================== Queries ====================

    pub fn history(&self, limit: u32, cursor: Option<&str>) -> Result<HistoryPage, AppError> {
        self.storage.lock().list_history(limit, cursor)
    }

    /// 統計。today はローカル時刻の 0 時以降。
    pub fn stats(&self) -> Result<DownloadStats, AppError> {
        let today_start = local_midnight_utc()?;
        self.storage.lock().stats(today_start)
    }

    // ==================== Retention ====================

    /// `hours` より古い COMPLETED レコードとファイル、出力先の古い残骸を削除する。
    ///
    /// 実行中ジョブのものは削除しない。`hours == 0` は何もしない。
    pub async fn cleanup_expired(&self, hours: u64) -> Result<SweepReport, AppError> {
        let mut report = SweepReport::default();
        if hours == 0 {
            return Ok(report);
        }
        let started = std::time::Instant::now();
        let max_age = Duration::from_secs(hours.saturating_mul(3600));
        let cutoff = chrono::Duration::from_std(max_age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .ok_or_else(|| AppError::invalid_request(format!("保持時間が大きすぎます: {hours}")))?;

        let candidates = self.storage.lock().list_retention_candidates(cutoff)?;
        for candidate in candidates {
            if self.scheduler.is_active(candidate.job_id) {
                report.skipped_active += 1;
                continue;
            }
            if let Some(path) = candidate.file_path.as_deref() {
                match remove_file_if_exists(Path::new(path)).await {
                    Ok(true) => report.files_deleted += 1,
                    Ok(false) => {}
                    Err(e) => {
                        // ファイルが消せない場合はレコードを残して次回に回す
                        log::warn!("job {}: {e}", candidate.job_id);
                        continue;
                    }
                }
            }
            if self.storage.lock().delete_job(candidate.job_id)? {
                report.records_deleted += 1;
            }
        }

        let output_dir = self.settings.read().output_dir.clone();
        report.files_deleted += self.sweep_stray_files(&output_dir, max_age).await;

        self.metrics.add_files_swept(u64::from(report.files_deleted));
        self.metrics
            .record_latency("sweep", started.elapsed().as_millis() as u64);
        log::info!(
            "保持期間スイープ: {} レコード、{} ファイル削除（{} 件は実行中のためスキップ, TTL: {hours}時間）",
            report.records_deleted,
            report.files_deleted,
            report.skipped_active
        );
        Ok(report)
    }

    /// どの実行中ジョブにも属さない古いファイルを出力先から消す。
    async fn sweep_stray_files(&self, dir: &Path, max_age: Duration) -> u32 {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return 0,
            Err(e) => {
                log::warn!("出力ディレクトリを読めません {}: {e}", dir.display());
                return 0;
            }
        };

        let now = SystemTime::now();
        let mut deleted = 0;
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    log::warn!("出力ディレクトリの走査に失敗: {e}");
                    break;
                }
            };
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let age = meta
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age < max_age {
                continue;
            }
            if owning_job(&entry.file_name().to_string_lossy())
                .is_some_and(|job_id| self.scheduler.is_active(job_id))
            {
                continue;
            }
            match remove_file_if_exists(&entry.path()).await {
                Ok(true) => deleted += 1,
                Ok(false) => {}
                Err(e) => log::warn!("{e}"),
            }
        }
        deleted
    }

    async fn run_sweep(&self) {
        let (retention_hours, memory_ttl) = {
            let settings = self.settings.read();
            (settings.retention_hours, settings.memory_ttl())
        };
        let flushed = self.scheduler.flush_terminal().await;
        if flushed > 0 {
            log::info!("{flushed} 件の終端レコードを再保存");
        }
        let evicted = self.scheduler.evict_terminal(memory_ttl);
        if evicted > 0 {
            log::debug!("{evicted} 件の終了済みジョブをメモリから解放");
        }
        if let Err(e) = self.cleanup_expired(retention_hours).await {
            log::error!("保持期間スイープに失敗: {e}");
        }
    }

    // ==================== Settings ====================

    pub fn get_settings(&self) -> DownloadSettings {
        self.settings.read().clone()
    }

    /// 設定を保存して反映する。通知間隔とスイープ間隔は次回起動から有効。
    pub fn update_settings(&self, settings: DownloadSettings) -> Result<(), AppError> {
        settings.validate()?;
        self.storage.lock().save_settings(&settings)?;
        self.fetcher.apply_settings(&settings);
        self.scheduler.update_config(SchedulerConfig::from(&settings));
        *self.settings.write() = settings;
        Ok(())
    }

    // ==================== Metrics ====================

    pub fn get_metrics(&self) -> MetricsSummary {
        self.metrics.summary()
    }
}

async fn sweep_loop(service: Weak<AppService>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // 初回 tick は即時に返るので読み捨てる
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(service) = service.upgrade() else {
            break;
        };
        service.run_sweep().await;
    }
}

async fn heartbeat_loop(service: Weak<AppService>) {
    let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(service) = service.upgrade() else {
            break;
        };
        service.beat();
    }
}

/// ファイル名 `<job-id>.<ext>[.part]` から所有ジョブを得る。
fn owning_job(file_name: &str) -> Option<JobId> {
    let stem = file_name.split('.').next()?;
    JobId::parse(stem).ok()
}

async fn remove_file_if_exists(path: &Path) -> Result<bool, AppError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(AppError::storage(format!(
            "ファイル削除失敗 {}: {e}",
            path.display()
        ))),
    }
}

fn local_midnight_utc() -> Result<DateTime<Utc>, AppError> {
    Local::now()
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .and_then(|midnight| midnight.and_local_timezone(Local).earliest())
        .map(|midnight| midnight.with_timezone(&Utc))
        .ok_or_else(|| AppError::internal("ローカル日付の 0 時を計算できません"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::error::ErrorCode;
    use crate::domain::job::Artifact;
    use crate::domain::types::{JobRequest, MediaKind};
    use crate::infra::fetch::ScriptedFetcher;
    use std::fs::File;
    use tokio::sync::Notify;

    const URL: &str = "https://www.youtube.com/watch?v=abc";
    const WAIT: Duration = Duration::from_secs(5);

    fn service_in(dir: &Path, fetcher: ScriptedFetcher) -> Arc<AppService> {
        let settings = DownloadSettings {
            output_dir: dir.to_path_buf(),
            notify_interval_ms: 0,
            ..Default::default()
        };
        Arc::new(AppService::with_settings(
            Storage::open_in_memory().unwrap(),
            Arc::new(fetcher.writing_to(dir)),
            settings,
        ))
    }

    fn make_old(path: &Path, hours: u64) {
        let file = File::options().write(true).open(path).unwrap();
        file.set_modified(SystemTime::now() - Duration::from_secs(hours * 3600))
            .unwrap();
    }

    fn old_completed(dir: &Path, hours_ago: i64) -> JobRecord {
        let created = Utc::now() - chrono::Duration::hours(hours_ago);
        let request =
            JobRequest::from_submit(JobId::new(), &SubmitRequest::video(URL), "best").unwrap();
        let mut record = JobRecord::new(&request, created);
        record.start_processing(created).unwrap();
        let file_name = format!("{}.mp4", record.job_id);
        let path = dir.join(&file_name);
        std::fs::write(&path, b"media").unwrap();
        make_old(&path, hours_ago as u64);
        record
            .complete(
                Artifact {
                    file_name,
                    file_size_bytes: 5,
                    file_path: path.to_string_lossy().into_owned(),
                    media_kind: MediaKind::Video,
                    thumbnail_url: None,
                    title: None,
                    duration_seconds: None,
                },
                created,
            )
            .unwrap();
        record
    }

    #[tokio::test]
    async fn test_start_marks_leftover_jobs_orphaned() {
        let storage = Storage::open_in_memory().unwrap();
        let request =
            JobRequest::from_submit(JobId::new(), &SubmitRequest::video(URL), "best").unwrap();
        let mut record = JobRecord::new(&request, Utc::now());
        record.start_processing(Utc::now()).unwrap();
        storage.upsert_job(&record).unwrap();

        let service =
            Arc::new(AppService::new(storage, Arc::new(ScriptedFetcher::default())).unwrap());
        assert_eq!(service.start().unwrap(), 1);

        let loaded = service.status(record.job_id).await.unwrap();
        assert_eq!(loaded.status, JobStatus::Failed);
        assert_eq!(loaded.failure.unwrap().code, ErrorCode::Orphaned);

        // 二度目の start はスイープを二重起動しない
        assert_eq!(service.start().unwrap(), 0);
        service.stop().await;
    }

    #[tokio::test]
    async fn test_start_leaves_jobs_of_live_instance_alone() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("shared.db");
        let open = |fetcher: ScriptedFetcher| {
            let storage = Storage::open(&db.to_string_lossy()).unwrap();
            Arc::new(AppService::with_settings(
                storage,
                Arc::new(fetcher.writing_to(dir.path())),
                DownloadSettings {
                    output_dir: dir.path().to_path_buf(),
                    notify_interval_ms: 0,
                    ..Default::default()
                },
            ))
        };

        let gate = Arc::new(Notify::new());
        let runner = open(ScriptedFetcher::new(vec![20]).gated(gate.clone()));
        runner.start().unwrap();
        let id = runner.submit(SubmitRequest::video(URL)).unwrap();
        for _ in 0..200 {
            if runner.status(id).await.unwrap().status == JobStatus::Processing {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        // 別インスタンスの start は実行中のジョブを孤立扱いしない
        let other = open(ScriptedFetcher::default());
        assert_ne!(other.instance_id(), runner.instance_id());
        assert_eq!(other.start().unwrap(), 0);
        assert_eq!(
            other.status(id).await.unwrap().status,
            JobStatus::Processing
        );

        gate.notify_one();
        let done = runner.wait_terminal(id, WAIT).await.unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        let stored = other.status(id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        assert!(stored.failure.is_none());

        other.stop().await;
        runner.stop().await;
    }

    #[tokio::test]
    async fn test_submit_history_and_stats() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(dir.path(), ScriptedFetcher::default());

        let id = service.submit(SubmitRequest::video(URL)).unwrap();
        let record = service.wait_terminal(id, WAIT).await.unwrap();
        assert_eq!(record.status, JobStatus::Completed);
        let failed = service.submit(SubmitRequest::audio(URL)).unwrap();
        service.cancel(failed).await.unwrap();

        let page = service.history(10, None).unwrap();
        assert_eq!(page.items.len(), 2);
        assert!(page.next_cursor.is_none());

        let stats = service.stats().unwrap();
        assert_eq!(stats.total_downloads, 2);
        assert_eq!(stats.successful_downloads, 1);
        assert_eq!(stats.failed_downloads, 1);
        assert_eq!(stats.today_downloads, 2);
        assert!((stats.success_rate - 50.0).abs() < 1e-9);

        let metrics = service.get_metrics();
        assert_eq!(metrics.jobs_submitted, 2);
        assert_eq!(metrics.jobs_completed, 1);
    }

    #[tokio::test]
    async fn test_artifact_path() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(dir.path(), ScriptedFetcher::default());

        let id = service.submit(SubmitRequest::video(URL)).unwrap();
        service.wait_terminal(id, WAIT).await.unwrap();

        let path = service.artifact_path(id).await.unwrap();
        assert_eq!(path, dir.path().join(format!("{id}.mp4")));

        std::fs::remove_file(&path).unwrap();
        let err = service.artifact_path(id).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);

        let err = service.artifact_path(JobId::new()).await.unwrap_err();
        assert_eq!(err.code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_cleanup_expired_removes_old_records_and_files() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(dir.path(), ScriptedFetcher::default());

        let old = old_completed(dir.path(), 48);
        let recent = old_completed(dir.path(), 1);
        {
            let storage = service.storage.lock();
            storage.upsert_job(&old).unwrap();
            storage.upsert_job(&recent).unwrap();
        }

        let report = service.cleanup_expired(24).await.unwrap();
        assert_eq!(report.records_deleted, 1);
        assert_eq!(report.files_deleted, 1);

        assert!(!Path::new(&old.artifact.as_ref().unwrap().file_path).exists());
        assert!(Path::new(&recent.artifact.as_ref().unwrap().file_path).exists());
        assert_eq!(
            service.status(old.job_id).await.unwrap_err().code,
            ErrorCode::NotFound
        );
        assert!(service.status(recent.job_id).await.is_ok());
        assert_eq!(service.get_metrics().files_swept, 1);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_files_of_active_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let gate = Arc::new(Notify::new());
        let service = service_in(dir.path(), ScriptedFetcher::new(vec![]).gated(gate.clone()));

        let active = service.submit(SubmitRequest::video(URL)).unwrap();
        let partial = dir.path().join(format!("{active}.mp4.part"));
        std::fs::write(&partial, b"partial").unwrap();
        make_old(&partial, 48);

        let stray = dir.path().join("leftover.webm");
        std::fs::write(&stray, b"junk").unwrap();
        make_old(&stray, 48);

        let fresh = dir.path().join("fresh.webm");
        std::fs::write(&fresh, b"new").unwrap();

        let report = service.cleanup_expired(24).await.unwrap();
        assert_eq!(report.files_deleted, 1);
        assert!(partial.exists());
        assert!(!stray.exists());
        assert!(fresh.exists());

        gate.notify_one();
        service.wait_terminal(active, WAIT).await.unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_zero_hours_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(dir.path(), ScriptedFetcher::default());
        let old = old_completed(dir.path(), 48);
        service.storage.lock().upsert_job(&old).unwrap();

        assert_eq!(service.cleanup_expired(0).await.unwrap(), SweepReport::default());
        assert!(service.status(old.job_id).await.is_ok());
    }

    #[tokio::test]
    async fn test_update_settings() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(dir.path(), ScriptedFetcher::default());

        let invalid = DownloadSettings {
            job_timeout_secs: 0,
            ..service.get_settings()
        };
        assert_eq!(
            service.update_settings(invalid).unwrap_err().code,
            ErrorCode::InvalidRequest
        );

        let updated = DownloadSettings {
            default_quality: "720p".into(),
            job_timeout_secs: 30,
            ..service.get_settings()
        };
        service.update_settings(updated.clone()).unwrap();
        assert_eq!(service.get_settings(), updated);
        assert_eq!(service.storage.lock().get_settings().unwrap(), updated);
        assert_eq!(service.scheduler.config().job_timeout, Duration::from_secs(30));

        // 既定画質が新しい投入に反映される
        let id = service.submit(SubmitRequest::video(URL)).unwrap();
        let record = service.wait_terminal(id, WAIT).await.unwrap();
        assert_eq!(record.quality, "720p");
    }

    #[tokio::test]
    async fn test_stop_cancels_running_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let service = service_in(dir.path(), ScriptedFetcher::new(vec![10]).hanging());
        service.start().unwrap();

        let id = service.submit(SubmitRequest::video(URL)).unwrap();
        service.stop().await;

        let record = service.status(id).await.unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.failure.unwrap().code, ErrorCode::Cancelled);
        assert!(!service.is_active(id));
    }

    #[test]
    fn test_owning_job() {
        let id = JobId::new();
        assert_eq!(owning_job(&format!("{id}.mp4")), Some(id));
        assert_eq!(owning_job(&format!("{id}.f137.mp4.part")), Some(id));
        assert_eq!(owning_job("random.mp4"), None);
    }
}

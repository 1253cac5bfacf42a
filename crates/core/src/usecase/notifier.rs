use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::domain::job::{JobId, JobUpdate};
use crate::infra::metrics::Metrics;

/// オブザーバー配信エラー
#[derive(Debug, thiserror::Error)]
pub enum ObserverError {
    #[error("observer closed")]
    Closed,
    #[error("delivery failed: {0}")]
    Delivery(String),
}

/// 進捗を受け取るオブザーバー。失敗したら購読から外される。
#[async_trait]
pub trait ProgressObserver: Send + Sync {
    async fn on_update(&self, update: &JobUpdate) -> Result<(), ObserverError>;
}

pub type SubscriptionId = u64;

struct Subscription {
    id: SubscriptionId,
    tx: watch::Sender<Option<JobUpdate>>,
    handle: JoinHandle<()>,
}

type SubscriptionMap = HashMap<JobId, Vec<Subscription>>;

/// 進捗の fan-out。
///
/// 購読ごとに watch チャネルと配信タスクを持つ。中間更新は最新値に集約され、
/// オブザーバーは `min_interval` に 1 回までしか呼ばれない。終端更新は間隔を待たずに
/// 配信され、配信後に購読は終了する。
pub struct ProgressNotifier {
    subscriptions: Arc<Mutex<SubscriptionMap>>,
    min_interval: Duration,
    next_id: AtomicU64,
    metrics: Option<Arc<Metrics>>,
}

impl ProgressNotifier {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
            min_interval,
            next_id: AtomicU64::new(1),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// 購読を登録する。`current` があれば最初にそれを配信する。
    pub fn subscribe(
        &self,
        job_id: JobId,
        observer: Arc<dyn ProgressObserver>,
        current: Option<JobUpdate>,
    ) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);
        if let Some(update) = current {
            let _ = tx.send(Some(update));
        }

        // 配信タスクが自分を外す前に登録を終えるため、spawn もロック内で行う
        let mut subs = self.subscriptions.lock();
        let handle = tokio::spawn(deliver_loop(Delivery {
            job_id,
            id,
            observer,
            rx,
            min_interval: self.min_interval,
            subscriptions: Arc::downgrade(&self.subscriptions),
            metrics: self.metrics.clone(),
        }));
        subs.entry(job_id)
            .or_default()
            .push(Subscription { id, tx, handle });

        log::debug!("job {job_id}: subscription {id} registered");
        id
    }

    /// 購読を解除する。存在しなければ false。
    pub fn unsubscribe(&self, job_id: JobId, id: SubscriptionId) -> bool {
        let mut subs = self.subscriptions.lock();
        let Some(list) = subs.get_mut(&job_id) else {
            return false;
        };
        let Some(pos) = list.iter().position(|s| s.id == id) else {
            return false;
        };
        let sub = list.remove(pos);
        sub.handle.abort();
        if list.is_empty() {
            subs.remove(&job_id);
        }
        true
    }

    /// 該当ジョブの全購読へ更新を流す。進捗の後退と終端後の更新は捨てる。
    pub fn publish(&self, update: &JobUpdate) {
        let subs = self.subscriptions.lock();
        let Some(list) = subs.get(&update.job_id) else {
            return;
        };
        for sub in list {
            sub.tx.send_if_modified(|current| {
                let accept = match current {
                    Some(cur) if cur.is_terminal() => false,
                    Some(cur) if cur == update => false,
                    Some(cur) => update.is_terminal() || update.progress >= cur.progress,
                    None => true,
                };
                if accept {
                    *current = Some(update.clone());
                }
                accept
            });
        }
    }

    pub fn subscriber_count(&self, job_id: JobId) -> usize {
        self.subscriptions
            .lock()
            .get(&job_id)
            .map_or(0, |list| list.len())
    }

    /// 全購読を停止する
    pub fn clear(&self) {
        let mut subs = self.subscriptions.lock();
        for (_, list) in subs.drain() {
            for sub in list {
                sub.handle.abort();
            }
        }
    }
}

struct Delivery {
    job_id: JobId,
    id: SubscriptionId,
    observer: Arc<dyn ProgressObserver>,
    rx: watch::Receiver<Option<JobUpdate>>,
    min_interval: Duration,
    subscriptions: Weak<Mutex<SubscriptionMap>>,
    metrics: Option<Arc<Metrics>>,
}

fn latest_is_terminal(rx: &watch::Receiver<Option<JobUpdate>>) -> bool {
    rx.borrow().as_ref().is_some_and(JobUpdate::is_terminal)
}

async fn deliver_loop(mut d: Delivery) {
    let mut last_sent: Option<Instant> = None;

    'outer: loop {
        if d.rx.changed().await.is_err() {
            break;
        }

        // 間隔内なら待つ。待機中の更新は最新値に集約し、終端が来たら即座に抜ける。
        if let Some(last) = last_sent {
            let deadline = last + d.min_interval;
            while !latest_is_terminal(&d.rx) && Instant::now() < deadline {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break,
                    res = d.rx.changed() => {
                        if res.is_err() {
                            break 'outer;
                        }
                    }
                }
            }
        }

        let Some(update) = d.rx.borrow_and_update().clone() else {
            continue;
        };

        match d.observer.on_update(&update).await {
            Ok(()) => {
                last_sent = Some(Instant::now());
                if update.is_terminal() {
                    break;
                }
            }
            Err(e) => {
                log::warn!(
                    "job {}: observer {} failed, unsubscribing: {e}",
                    d.job_id,
                    d.id
                );
                if let Some(m) = &d.metrics {
                    m.inc_observer_failures();
                }
                break;
            }
        }
    }

    if let Some(subs) = d.subscriptions.upgrade() {
        let mut subs = subs.lock();
        if let Some(list) = subs.get_mut(&d.job_id) {
            list.retain(|s| s.id != d.id);
            if list.is_empty() {
                subs.remove(&d.job_id);
            }
        }
    }
}

// ─── 組み込みオブザーバー ───────────────────────────────────────

/// 更新を mpsc チャネルへ転送する。受信側が閉じたら Closed。
pub struct ChannelObserver {
    tx: mpsc::Sender<JobUpdate>,
}

impl ChannelObserver {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<JobUpdate>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ProgressObserver for ChannelObserver {
    async fn on_update(&self, update: &JobUpdate) -> Result<(), ObserverError> {
        self.tx
            .send(update.clone())
            .await
            .map_err(|_| ObserverError::Closed)
    }
}

/// 最後に受け取った更新を保持する（ポーリング用）
#[derive(Default)]
pub struct LatestObserver {
    latest: Mutex<Option<JobUpdate>>,
}

impl LatestObserver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest(&self) -> Option<JobUpdate> {
        self.latest.lock().clone()
    }
}

#[async_trait]
impl ProgressObserver for LatestObserver {
    async fn on_update(&self, update: &JobUpdate) -> Result<(), ObserverError> {
        *self.latest.lock() = Some(update.clone());
        Ok(())
    }
}

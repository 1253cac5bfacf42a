use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::oneshot;

use crate::domain::job::JobId;
use crate::domain::types::Fingerprint;

/// 実行中ジョブ 1 件分のエントリ。PENDING / PROCESSING の間だけ存在する。
struct RegistryEntry {
    fingerprint: Fingerprint,
    cancel_tx: Option<oneshot::Sender<()>>,
    started_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    by_fingerprint: HashMap<Fingerprint, JobId>,
    by_id: HashMap<JobId, RegistryEntry>,
}

/// ジョブレジストリ: 指紋ごとに同時実行 1 件を保証する。
///
/// 永続化はしない。プロセス再起動で中身は失われる。
#[derive(Default)]
pub struct JobRegistry {
    inner: Mutex<Inner>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 指紋が空いていればスロットを確保し、キャンセル受信側を返す。
    /// 既に同じ指紋が実行中なら None。
    pub fn reserve(
        &self,
        fingerprint: Fingerprint,
        job_id: JobId,
    ) -> Option<oneshot::Receiver<()>> {
        let mut inner = self.inner.lock();
        if inner.by_fingerprint.contains_key(&fingerprint) || inner.by_id.contains_key(&job_id) {
            return None;
        }

        let (cancel_tx, cancel_rx) = oneshot::channel();
        inner.by_fingerprint.insert(fingerprint.clone(), job_id);
        inner.by_id.insert(
            job_id,
            RegistryEntry {
                fingerprint,
                cancel_tx: Some(cancel_tx),
                started_at: Utc::now(),
            },
        );
        Some(cancel_rx)
    }

    /// スロットを解放する。未登録・二重解放は何もしない。
    pub fn release(&self, job_id: JobId) -> bool {
        let mut inner = self.inner.lock();
        match inner.by_id.remove(&job_id) {
            Some(entry) => {
                inner.by_fingerprint.remove(&entry.fingerprint);
                true
            }
            None => false,
        }
    }

    /// キャンセルシグナルを送る。エントリが存在すれば true（送信済みでも true）。
    pub fn signal_cancel(&self, job_id: JobId) -> bool {
        let mut inner = self.inner.lock();
        match inner.by_id.get_mut(&job_id) {
            Some(entry) => {
                if let Some(tx) = entry.cancel_tx.take() {
                    let _ = tx.send(());
                }
                true
            }
            None => false,
        }
    }

    /// 全エントリにキャンセルシグナルを送る。
    pub fn signal_all(&self) -> Vec<JobId> {
        let mut inner = self.inner.lock();
        let mut signalled = Vec::with_capacity(inner.by_id.len());
        for (job_id, entry) in inner.by_id.iter_mut() {
            if let Some(tx) = entry.cancel_tx.take() {
                let _ = tx.send(());
            }
            signalled.push(*job_id);
        }
        signalled
    }

    pub fn is_active(&self, job_id: JobId) -> bool {
        self.inner.lock().by_id.contains_key(&job_id)
    }

    /// 指紋を保持しているジョブ
    pub fn holder_of(&self, fingerprint: &Fingerprint) -> Option<JobId> {
        self.inner.lock().by_fingerprint.get(fingerprint).copied()
    }

    pub fn started_at(&self, job_id: JobId) -> Option<DateTime<Utc>> {
        self.inner.lock().by_id.get(&job_id).map(|e| e.started_at)
    }

    pub fn active_ids(&self) -> Vec<JobId> {
        self.inner.lock().by_id.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::MediaKind;
    use std::sync::Arc;

    fn fp(url: &str) -> Fingerprint {
        Fingerprint::new(url, MediaKind::Video, "best")
    }

    #[test]
    fn test_reserve_and_release() {
        let registry = JobRegistry::new();
        let id = JobId::new();
        assert!(registry.reserve(fp("https://youtube.com/watch?v=a"), id).is_some());
        assert!(registry.is_active(id));
        assert_eq!(registry.len(), 1);
        assert!(registry.started_at(id).is_some());

        assert!(registry.release(id));
        assert!(!registry.is_active(id));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_fingerprint_rejected() {
        let registry = JobRegistry::new();
        let first = JobId::new();
        assert!(registry.reserve(fp("https://youtube.com/watch?v=a"), first).is_some());
        assert!(registry
            .reserve(fp("https://www.youtube.com/watch?v=a"), JobId::new())
            .is_none());
        assert_eq!(
            registry.holder_of(&fp("https://youtube.com/watch?v=a")),
            Some(first)
        );

        // 別の指紋は通る
        assert!(registry.reserve(fp("https://youtube.com/watch?v=b"), JobId::new()).is_some());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_release_is_idempotent() {
        let registry = JobRegistry::new();
        let id = JobId::new();
        registry.reserve(fp("https://youtube.com/watch?v=a"), id);
        assert!(registry.release(id));
        assert!(!registry.release(id));
        assert!(!registry.release(JobId::new()));

        // 解放後は同じ指紋を再確保できる
        assert!(registry.reserve(fp("https://youtube.com/watch?v=a"), JobId::new()).is_some());
    }

    #[tokio::test]
    async fn test_signal_cancel() {
        let registry = JobRegistry::new();
        let id = JobId::new();
        let rx = registry.reserve(fp("https://youtube.com/watch?v=a"), id).unwrap();

        assert!(registry.signal_cancel(id));
        assert!(registry.signal_cancel(id), "二度目も true");
        assert!(rx.await.is_ok());
        assert!(!registry.signal_cancel(JobId::new()));

        // シグナルだけではスロットは残る
        assert!(registry.is_active(id));
    }

    #[tokio::test]
    async fn test_signal_all() {
        let registry = JobRegistry::new();
        let rx1 = registry.reserve(fp("https://youtube.com/watch?v=a"), JobId::new()).unwrap();
        let rx2 = registry.reserve(fp("https://youtube.com/watch?v=b"), JobId::new()).unwrap();

        assert_eq!(registry.signal_all().len(), 2);
        assert!(rx1.await.is_ok());
        assert!(rx2.await.is_ok());
    }

    #[test]
    fn test_concurrent_reserve_single_winner() {
        let registry = Arc::new(JobRegistry::new());
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    registry
                        .reserve(fp("https://youtube.com/watch?v=same"), JobId::new())
                        .is_some()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(registry.len(), 1);
    }
}

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::domain::error::{AppError, ErrorCode};
use crate::domain::job::{Artifact, JobFailure, JobId, JobRecord, JobStatus};
use crate::domain::settings::DownloadSettings;
use crate::domain::types::{
    DownloadStats, HistoryPage, MediaKind, Platform, PlatformCount, RetentionCandidate,
};

const JOB_COLUMNS: &str = "job_id, source_url, platform, media_kind, quality, status, progress,
     file_name, file_size, file_path, thumbnail_url, title, duration_seconds,
     failure_code, failure_message, created_at, updated_at";

/// SQLiteストレージ（downloads + service_instances + settings）
pub struct Storage {
    conn: Connection,
}

impl Storage {
    /// 新規接続（ファイルパス指定）
    pub fn open(path: &str) -> Result<Self, AppError> {
        let conn = Connection::open(path)
            .map_err(|e| AppError::storage(format!("DB接続に失敗: {e}")))?;
        let storage = Self { conn };
        storage.migrate()?;
        Ok(storage)
    }

    /// in-memory DB（テスト用）
    pub fn open_in_memory() -> Result<Self, AppError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| AppError::storage(format!("in-memory DB作成に失敗: {e}")))?;
        let storage = Self { conn };
        storage.migrate()?;
        Ok(storage)
    }

    /// スキーママイグレーション
    fn migrate(&self) -> Result<(), AppError> {
        self.conn
            .execute_batch(
                "
                CREATE TABLE IF NOT EXISTS downloads (
                    job_id           TEXT PRIMARY KEY,
                    source_url       TEXT NOT NULL,
                    platform         TEXT NOT NULL,
                    media_kind       TEXT NOT NULL,
                    quality          TEXT NOT NULL,
                    status           TEXT NOT NULL DEFAULT 'PENDING',
                    progress         INTEGER NOT NULL DEFAULT 0,
                    file_name        TEXT,
                    file_size        INTEGER,
                    file_path        TEXT,
                    thumbnail_url    TEXT,
                    title            TEXT,
                    duration_seconds INTEGER,
                    failure_code     TEXT,
                    failure_message  TEXT,
                    created_at       TEXT NOT NULL,
                    updated_at       TEXT NOT NULL
                );

                CREATE INDEX IF NOT EXISTS idx_downloads_created_at ON downloads(created_at);
                CREATE INDEX IF NOT EXISTS idx_downloads_status ON downloads(status);

                CREATE TABLE IF NOT EXISTS service_instances (
                    instance_id  TEXT PRIMARY KEY,
                    heartbeat_at TEXT NOT NULL
                );

                CREATE TABLE IF NOT EXISTS settings (
                    key   TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                );
                ",
            )
            .map_err(|e| AppError::storage(format!("マイグレーション失敗: {e}")))?;

        // owner 列は後から追加したので既存 DB には ALTER で足す
        let has_owner: bool = self
            .conn
            .query_row(
                "SELECT COUNT(*) FROM pragma_table_info('downloads') WHERE name = 'owner'",
                [],
                |row| row.get::<_, i64>(0),
            )
            .map(|n| n > 0)
            .map_err(|e| AppError::storage(format!("マイグレーション失敗: {e}")))?;
        if !has_owner {
            self.conn
                .execute_batch("ALTER TABLE downloads ADD COLUMN owner TEXT;")
                .map_err(|e| AppError::storage(format!("マイグレーション失敗: {e}")))?;
        }
        Ok(())
    }

    // --- Downloads ---

    /// レコード全体を upsert する。終端状態の行は上書きしない。
    pub fn upsert_job(&self, record: &JobRecord) -> Result<(), AppError> {
        self.upsert_job_owned(record, None)
    }

    /// `owner` は書き込んだサービスインスタンスの id（孤立判定に使う）。
    pub fn upsert_job_owned(
        &self,
        record: &JobRecord,
        owner: Option<&str>,
    ) -> Result<(), AppError> {
        let artifact = record.artifact.as_ref();
        let failure = record.failure.as_ref();

        self.conn
            .execute(
                "INSERT INTO downloads (
                    job_id, source_url, platform, media_kind, quality, status, progress,
                    file_name, file_size, file_path, thumbnail_url, title, duration_seconds,
                    failure_code, failure_message, created_at, updated_at, owner
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)
                 ON CONFLICT(job_id) DO UPDATE SET
                    status           = excluded.status,
                    progress         = excluded.progress,
                    file_name        = excluded.file_name,
                    file_size        = excluded.file_size,
                    file_path        = excluded.file_path,
                    thumbnail_url    = excluded.thumbnail_url,
                    title            = excluded.title,
                    duration_seconds = excluded.duration_seconds,
                    failure_code     = excluded.failure_code,
                    failure_message  = excluded.failure_message,
                    updated_at       = excluded.updated_at,
                    owner            = COALESCE(excluded.owner, downloads.owner)
                 WHERE downloads.status NOT IN ('COMPLETED', 'FAILED')",
                params![
                    record.job_id.to_string(),
                    record.source_url,
                    record.platform.as_str(),
                    record.media_kind.as_str(),
                    record.quality,
                    record.status.as_str(),
                    record.progress,
                    artifact.map(|a| a.file_name.as_str()),
                    artifact.map(|a| a.file_size_bytes as i64),
                    artifact.map(|a| a.file_path.as_str()),
                    artifact.and_then(|a| a.thumbnail_url.as_deref()),
                    artifact.and_then(|a| a.title.as_deref()),
                    artifact.and_then(|a| a.duration_seconds).map(|d| d as i64),
                    failure.map(|f| f.code.as_str()),
                    failure.map(|f| f.message.as_str()),
                    timestamp(&record.created_at),
                    timestamp(&record.updated_at),
                    owner,
                ],
            )
            .map_err(|e| AppError::storage(format!("ジョブ保存失敗: {e}")))?;
        Ok(())
    }

    pub fn get_job(&self, job_id: JobId) -> Result<Option<JobRecord>, AppError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM downloads WHERE job_id = ?1");
        self.conn
            .query_row(&sql, params![job_id.to_string()], map_job_row)
            .optional()
            .map_err(|e| AppError::storage(format!("ジョブ取得失敗: {e}")))
    }

    pub fn delete_job(&self, job_id: JobId) -> Result<bool, AppError> {
        let affected = self
            .conn
            .execute(
                "DELETE FROM downloads WHERE job_id = ?1",
                params![job_id.to_string()],
            )
            .map_err(|e| AppError::storage(format!("ジョブ削除失敗: {e}")))?;
        Ok(affected > 0)
    }

    // --- Service instances ---

    /// インスタンスの生存を記録する。
    pub fn heartbeat(&self, instance_id: &str, now: DateTime<Utc>) -> Result<(), AppError> {
        self.conn
            .execute(
                "INSERT INTO service_instances (instance_id, heartbeat_at) VALUES (?1, ?2)
                 ON CONFLICT(instance_id) DO UPDATE SET heartbeat_at = excluded.heartbeat_at",
                params![instance_id, timestamp(&now)],
            )
            .map_err(|e| AppError::storage(format!("ハートビート更新失敗: {e}")))?;
        Ok(())
    }

    pub fn remove_instance(&self, instance_id: &str) -> Result<(), AppError> {
        self.conn
            .execute(
                "DELETE FROM service_instances WHERE instance_id = ?1",
                params![instance_id],
            )
            .map_err(|e| AppError::storage(format!("インスタンス削除失敗: {e}")))?;
        Ok(())
    }

    /// PENDING / PROCESSING のまま残ったジョブのうち、書き込んだインスタンスが
    /// `live_since` 以降ハートビートしていないものを FAILED にする。
    ///
    /// 所有者の無い行も対象。期限切れのインスタンス行は削除する。
    pub fn mark_orphaned(
        &self,
        now: DateTime<Utc>,
        live_since: DateTime<Utc>,
    ) -> Result<u32, AppError> {
        let live_since = timestamp(&live_since);
        let affected = self
            .conn
            .execute(
                "UPDATE downloads
                 SET status = 'FAILED', failure_code = ?1, failure_message = ?2, updated_at = ?3
                 WHERE status IN ('PENDING', 'PROCESSING')
                   AND (owner IS NULL OR owner NOT IN (
                        SELECT instance_id FROM service_instances WHERE heartbeat_at >= ?4))",
                params![
                    ErrorCode::Orphaned.as_str(),
                    "実行していたプロセスが終了したため中断されました",
                    timestamp(&now),
                    live_since,
                ],
            )
            .map_err(|e| AppError::storage(format!("孤立ジョブ更新失敗: {e}")))?;

        self.conn
            .execute(
                "DELETE FROM service_instances WHERE heartbeat_at < ?1",
                params![live_since],
            )
            .map_err(|e| AppError::storage(format!("インスタンス削除失敗: {e}")))?;
        Ok(affected as u32)
    }

    // --- Queries ---

    /// 新しい順の履歴。カーソルは `<created_at>|<job_id>`。
    pub fn list_history(&self, limit: u32, cursor: Option<&str>) -> Result<HistoryPage, AppError> {
        let limit = limit.max(1);

        let rows: Vec<JobRecord> = match cursor.map(parse_cursor).transpose()? {
            Some((created_at, job_id)) => {
                let sql = format!(
                    "SELECT {JOB_COLUMNS} FROM downloads
                     WHERE created_at < ?1 OR (created_at = ?1 AND job_id < ?2)
                     ORDER BY created_at DESC, job_id DESC
                     LIMIT ?3"
                );
                let mut stmt = self
                    .conn
                    .prepare(&sql)
                    .map_err(|e| AppError::storage(format!("クエリ準備失敗: {e}")))?;
                let rows = stmt
                    .query_map(params![created_at, job_id, limit + 1], map_job_row)
                    .map_err(|e| AppError::storage(format!("クエリ実行失敗: {e}")))?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| AppError::storage(format!("行読み取り失敗: {e}")))?;
                rows
            }
            None => {
                let sql = format!(
                    "SELECT {JOB_COLUMNS} FROM downloads
                     ORDER BY created_at DESC, job_id DESC
                     LIMIT ?1"
                );
                let mut stmt = self
                    .conn
                    .prepare(&sql)
                    .map_err(|e| AppError::storage(format!("クエリ準備失敗: {e}")))?;
                let rows = stmt
                    .query_map(params![limit + 1], map_job_row)
                    .map_err(|e| AppError::storage(format!("クエリ実行失敗: {e}")))?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|e| AppError::storage(format!("行読み取り失敗: {e}")))?;
                rows
            }
        };

        let has_next = rows.len() > limit as usize;
        let items: Vec<JobRecord> = rows.into_iter().take(limit as usize).collect();
        let next_cursor = if has_next {
            items
                .last()
                .map(|r| format!("{}|{}", timestamp(&r.created_at), r.job_id))
        } else {
            None
        };

        Ok(HistoryPage { items, next_cursor })
    }

    /// ダウンロード統計。`today_start` 以降の作成分を today として数える。
    pub fn stats(&self, today_start: DateTime<Utc>) -> Result<DownloadStats, AppError> {
        let count = |sql: &str, p: &[&dyn rusqlite::ToSql]| -> Result<u64, AppError> {
            self.conn
                .query_row(sql, p, |row| row.get::<_, i64>(0))
                .map(|n| n.max(0) as u64)
                .map_err(|e| AppError::storage(format!("統計取得失敗: {e}")))
        };

        let total = count("SELECT COUNT(*) FROM downloads", &[])?;
        let completed = count(
            "SELECT COUNT(*) FROM downloads WHERE status = 'COMPLETED'",
            &[],
        )?;
        let failed = count("SELECT COUNT(*) FROM downloads WHERE status = 'FAILED'", &[])?;
        let today_ts = timestamp(&today_start);
        let today = count(
            "SELECT COUNT(*) FROM downloads WHERE created_at >= ?1",
            &[&today_ts],
        )?;

        let mut stmt = self
            .conn
            .prepare(
                "SELECT platform, COUNT(*) FROM downloads GROUP BY platform ORDER BY COUNT(*) DESC, platform",
            )
            .map_err(|e| AppError::storage(format!("クエリ準備失敗: {e}")))?;
        let platform_stats = stmt
            .query_map([], |row| {
                let platform: String = row.get(0)?;
                let count: i64 = row.get(1)?;
                Ok(PlatformCount {
                    platform: Platform::parse(&platform).unwrap_or(Platform::Other),
                    count: count.max(0) as u64,
                })
            })
            .map_err(|e| AppError::storage(format!("クエリ実行失敗: {e}")))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AppError::storage(format!("行読み取り失敗: {e}")))?;

        let success_rate = if total > 0 {
            completed as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        Ok(DownloadStats {
            total_downloads: total,
            successful_downloads: completed,
            failed_downloads: failed,
            today_downloads: today,
            platform_stats,
            success_rate,
        })
    }

    /// `before` より前に作成された COMPLETED レコード（保持期間スイープ用）
    pub fn list_retention_candidates(
        &self,
        before: DateTime<Utc>,
    ) -> Result<Vec<RetentionCandidate>, AppError> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT job_id, created_at, file_path FROM downloads
                 WHERE status = 'COMPLETED' AND created_at < ?1
                 ORDER BY created_at",
            )
            .map_err(|e| AppError::storage(format!("クエリ準備失敗: {e}")))?;

        let rows = stmt
            .query_map(params![timestamp(&before)], |row| {
                let job_id: String = row.get(0)?;
                let created_at: String = row.get(1)?;
                Ok(RetentionCandidate {
                    job_id: parse_job_id(0, &job_id)?,
                    created_at: parse_timestamp(1, &created_at)?,
                    file_path: row.get(2)?,
                })
            })
            .map_err(|e| AppError::storage(format!("クエリ実行失敗: {e}")))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AppError::storage(format!("行読み取り失敗: {e}")))?;
        Ok(rows)
    }

    // --- Settings ---

    pub fn get_settings(&self) -> Result<DownloadSettings, AppError> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, value FROM settings")
            .map_err(|e| AppError::storage(format!("クエリ準備失敗: {e}")))?;

        let rows: Vec<(String, String)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
            .map_err(|e| AppError::storage(format!("クエリ実行失敗: {e}")))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| AppError::storage(format!("行読み取り失敗: {e}")))?;

        if rows.is_empty() {
            return Ok(DownloadSettings::default());
        }

        // key-value をJSONに組み立ててデシリアライズ
        let mut map = serde_json::Map::new();
        for (key, value) in rows {
            let v = serde_json::from_str(&value).unwrap_or(serde_json::Value::String(value));
            map.insert(key, v);
        }

        match serde_json::from_value::<DownloadSettings>(serde_json::Value::Object(map)) {
            Ok(settings) => Ok(settings),
            Err(e) => {
                log::warn!("保存済み設定を読み込めません。既定値を使用します: {e}");
                Ok(DownloadSettings::default())
            }
        }
    }

    pub fn save_settings(&self, settings: &DownloadSettings) -> Result<(), AppError> {
        let json = serde_json::to_value(settings)
            .map_err(|e| AppError::internal(format!("settings serialize: {e}")))?;

        if let Some(obj) = json.as_object() {
            for (key, value) in obj {
                self.conn
                    .execute(
                        "INSERT INTO settings (key, value) VALUES (?1, ?2)
                         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                        params![key, value.to_string()],
                    )
                    .map_err(|e| AppError::storage(format!("設定保存失敗: {e}")))?;
            }
        }

        Ok(())
    }
}

/// 辞書順 = 時刻順になる固定幅の RFC3339
fn timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_error(col: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        col,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, msg)),
    )
}

fn parse_timestamp(col: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(col, format!("invalid timestamp '{s}': {e}")))
}

fn parse_job_id(col: usize, s: &str) -> rusqlite::Result<JobId> {
    JobId::parse(s).map_err(|e| conversion_error(col, e.message))
}

fn parse_cursor(cursor: &str) -> Result<(String, String), AppError> {
    let (created_at, job_id) = cursor
        .split_once('|')
        .ok_or_else(|| AppError::invalid_request(format!("不正なカーソル: {cursor}")))?;
    let created_at = DateTime::parse_from_rfc3339(created_at)
        .map_err(|e| AppError::invalid_request(format!("不正なカーソル: {e}")))?;
    let job_id = JobId::parse(job_id)?;
    Ok((timestamp(&created_at.with_timezone(&Utc)), job_id.to_string()))
}

fn map_job_row(row: &rusqlite::Row) -> rusqlite::Result<JobRecord> {
    let job_id: String = row.get(0)?;
    let platform: String = row.get(2)?;
    let media_kind: String = row.get(3)?;
    let status: String = row.get(5)?;
    let progress: i64 = row.get(6)?;
    let file_name: Option<String> = row.get(7)?;
    let file_size: Option<i64> = row.get(8)?;
    let file_path: Option<String> = row.get(9)?;
    let duration: Option<i64> = row.get(12)?;
    let failure_code: Option<String> = row.get(13)?;
    let failure_message: Option<String> = row.get(14)?;
    let created_at: String = row.get(15)?;
    let updated_at: String = row.get(16)?;

    let media_kind = MediaKind::parse(&media_kind).unwrap_or(MediaKind::Video);
    let status = JobStatus::parse(&status).unwrap_or(JobStatus::Failed);

    // artifact は COMPLETED のときだけ復元する
    let artifact = match (status, file_name, file_path) {
        (JobStatus::Completed, Some(file_name), Some(file_path)) => Some(Artifact {
            file_name,
            file_size_bytes: file_size.unwrap_or(0).max(0) as u64,
            file_path,
            media_kind,
            thumbnail_url: row.get(10)?,
            title: row.get(11)?,
            duration_seconds: duration.map(|d| d.max(0) as u64),
        }),
        _ => None,
    };

    let failure = match status {
        JobStatus::Failed => Some(JobFailure::new(
            failure_code
                .as_deref()
                .map(ErrorCode::parse)
                .unwrap_or(ErrorCode::Internal),
            failure_message.unwrap_or_default(),
        )),
        _ => None,
    };

    Ok(JobRecord {
        job_id: parse_job_id(0, &job_id)?,
        source_url: row.get(1)?,
        platform: Platform::parse(&platform).unwrap_or(Platform::Other),
        media_kind,
        quality: row.get(4)?,
        status,
        progress: progress.clamp(0, 100) as u8,
        artifact,
        failure,
        created_at: parse_timestamp(15, &created_at)?,
        updated_at: parse_timestamp(16, &updated_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{JobRequest, SubmitRequest};
    use chrono::Duration;

    fn base_time() -> DateTime<Utc> {
        "2025-01-15T10:30:00Z".parse().unwrap()
    }

    fn record_at(url: &str, created_at: DateTime<Utc>) -> JobRecord {
        let req =
            JobRequest::from_submit(JobId::new(), &SubmitRequest::video(url), "best").unwrap();
        JobRecord::new(&req, created_at)
    }

    fn artifact(path: &str) -> Artifact {
        Artifact {
            file_name: "clip.mp4".into(),
            file_size_bytes: 2048,
            file_path: path.into(),
            media_kind: MediaKind::Video,
            thumbnail_url: Some("https://i.ytimg.com/t.jpg".into()),
            title: Some("Clip".into()),
            duration_seconds: Some(42),
        }
    }

    fn completed(url: &str, created_at: DateTime<Utc>) -> JobRecord {
        let mut rec = record_at(url, created_at);
        rec.start_processing(created_at).unwrap();
        rec.complete(artifact("/tmp/clip.mp4"), created_at).unwrap();
        rec
    }

    #[test]
    fn test_upsert_and_get_job() {
        let storage = Storage::open_in_memory().unwrap();
        let mut rec = record_at("https://youtube.com/watch?v=abc", base_time());
        storage.upsert_job(&rec).unwrap();

        let loaded = storage.get_job(rec.job_id).unwrap().unwrap();
        assert_eq!(loaded, rec);

        rec.start_processing(base_time()).unwrap();
        rec.apply_progress(40, base_time() + Duration::seconds(1));
        storage.upsert_job(&rec).unwrap();
        // 同じ内容の再保存は冪等
        storage.upsert_job(&rec).unwrap();

        let loaded = storage.get_job(rec.job_id).unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Processing);
        assert_eq!(loaded.progress, 40);
    }

    #[test]
    fn test_completed_roundtrip_keeps_artifact() {
        let storage = Storage::open_in_memory().unwrap();
        let rec = completed("https://youtube.com/watch?v=abc", base_time());
        storage.upsert_job(&rec).unwrap();

        let loaded = storage.get_job(rec.job_id).unwrap().unwrap();
        assert_eq!(loaded.progress, 100);
        assert_eq!(loaded.artifact, rec.artifact);
        assert!(loaded.failure.is_none());
    }

    #[test]
    fn test_terminal_row_is_not_overwritten() {
        let storage = Storage::open_in_memory().unwrap();
        let rec = completed("https://youtube.com/watch?v=abc", base_time());
        storage.upsert_job(&rec).unwrap();

        let mut stale = rec.clone();
        stale.status = JobStatus::Processing;
        stale.progress = 50;
        stale.artifact = None;
        storage.upsert_job(&stale).unwrap();

        let loaded = storage.get_job(rec.job_id).unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Completed);
        assert_eq!(loaded.progress, 100);
    }

    #[test]
    fn test_failed_roundtrip_keeps_reason() {
        let storage = Storage::open_in_memory().unwrap();
        let mut rec = record_at("https://youtube.com/watch?v=abc", base_time());
        rec.fail(JobFailure::cancelled(), base_time()).unwrap();
        storage.upsert_job(&rec).unwrap();

        let loaded = storage.get_job(rec.job_id).unwrap().unwrap();
        assert_eq!(loaded.failure.unwrap().code, ErrorCode::Cancelled);
        assert!(loaded.artifact.is_none());
    }

    #[test]
    fn test_get_nonexistent_job() {
        let storage = Storage::open_in_memory().unwrap();
        assert!(storage.get_job(JobId::new()).unwrap().is_none());
    }

    #[test]
    fn test_list_history_pagination() {
        let storage = Storage::open_in_memory().unwrap();
        let mut ids = Vec::new();
        for i in 0..5 {
            let rec = record_at(
                &format!("https://youtube.com/watch?v={i}"),
                base_time() + Duration::minutes(i),
            );
            ids.push(rec.job_id);
            storage.upsert_job(&rec).unwrap();
        }

        let page1 = storage.list_history(2, None).unwrap();
        assert_eq!(page1.items.len(), 2);
        assert!(page1.next_cursor.is_some());
        // 最新が先頭
        assert_eq!(page1.items[0].job_id, ids[4]);
        assert_eq!(page1.items[1].job_id, ids[3]);

        let page2 = storage
            .list_history(2, page1.next_cursor.as_deref())
            .unwrap();
        assert_eq!(page2.items.len(), 2);
        assert_eq!(page2.items[0].job_id, ids[2]);

        let page3 = storage
            .list_history(2, page2.next_cursor.as_deref())
            .unwrap();
        assert_eq!(page3.items.len(), 1);
        assert!(page3.next_cursor.is_none());
    }

    #[test]
    fn test_list_history_same_timestamp_is_not_skipped() {
        let storage = Storage::open_in_memory().unwrap();
        for i in 0..3 {
            let rec = record_at(&format!("https://youtube.com/watch?v={i}"), base_time());
            storage.upsert_job(&rec).unwrap();
        }

        let page1 = storage.list_history(2, None).unwrap();
        let page2 = storage
            .list_history(2, page1.next_cursor.as_deref())
            .unwrap();
        assert_eq!(page1.items.len() + page2.items.len(), 3);
        assert!(page2.next_cursor.is_none());
    }

    #[test]
    fn test_list_history_rejects_bad_cursor() {
        let storage = Storage::open_in_memory().unwrap();
        let err = storage.list_history(10, Some("garbage")).unwrap_err();
        assert_eq!(err.code, ErrorCode::InvalidRequest);
    }

    #[test]
    fn test_stats() {
        let storage = Storage::open_in_memory().unwrap();
        let yesterday = base_time() - Duration::days(1);

        storage
            .upsert_job(&completed("https://youtube.com/watch?v=a", base_time()))
            .unwrap();
        storage
            .upsert_job(&completed("https://youtube.com/watch?v=b", yesterday))
            .unwrap();
        let mut failed = record_at("https://www.tiktok.com/@u/video/1", base_time());
        failed
            .fail(JobFailure::new(ErrorCode::ProcessFailure, "exit 1"), base_time())
            .unwrap();
        storage.upsert_job(&failed).unwrap();
        storage
            .upsert_job(&record_at("https://vimeo.com/1", base_time()))
            .unwrap();

        let stats = storage.stats(base_time() - Duration::hours(1)).unwrap();
        assert_eq!(stats.total_downloads, 4);
        assert_eq!(stats.successful_downloads, 2);
        assert_eq!(stats.failed_downloads, 1);
        assert_eq!(stats.today_downloads, 3);
        assert!((stats.success_rate - 50.0).abs() < f64::EPSILON);

        let youtube = stats
            .platform_stats
            .iter()
            .find(|p| p.platform == Platform::Youtube)
            .unwrap();
        assert_eq!(youtube.count, 2);
        assert_eq!(stats.platform_stats[0].platform, Platform::Youtube);
    }

    #[test]
    fn test_stats_empty() {
        let storage = Storage::open_in_memory().unwrap();
        let stats = storage.stats(base_time()).unwrap();
        assert_eq!(stats.total_downloads, 0);
        assert_eq!(stats.success_rate, 0.0);
        assert!(stats.platform_stats.is_empty());
    }

    #[test]
    fn test_retention_candidates_only_old_completed() {
        let storage = Storage::open_in_memory().unwrap();
        let old = base_time() - Duration::hours(30);

        let old_completed = completed("https://youtube.com/watch?v=a", old);
        storage.upsert_job(&old_completed).unwrap();
        storage
            .upsert_job(&completed("https://youtube.com/watch?v=b", base_time()))
            .unwrap();
        let mut old_failed = record_at("https://youtube.com/watch?v=c", old);
        old_failed.fail(JobFailure::cancelled(), old).unwrap();
        storage.upsert_job(&old_failed).unwrap();

        let candidates = storage
            .list_retention_candidates(base_time() - Duration::hours(24))
            .unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].job_id, old_completed.job_id);
        assert_eq!(candidates[0].file_path.as_deref(), Some("/tmp/clip.mp4"));

        assert!(storage.delete_job(old_completed.job_id).unwrap());
        assert!(!storage.delete_job(old_completed.job_id).unwrap());
    }

    #[test]
    fn test_mark_orphaned() {
        let storage = Storage::open_in_memory().unwrap();
        let pending = record_at("https://youtube.com/watch?v=a", base_time());
        let mut processing = record_at("https://youtube.com/watch?v=b", base_time());
        processing.start_processing(base_time()).unwrap();
        let done = completed("https://youtube.com/watch?v=c", base_time());
        for rec in [&pending, &processing, &done] {
            storage.upsert_job(rec).unwrap();
        }

        let n = storage.mark_orphaned(base_time(), base_time()).unwrap();
        assert_eq!(n, 2);

        let loaded = storage.get_job(processing.job_id).unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Failed);
        assert_eq!(loaded.failure.unwrap().code, ErrorCode::Orphaned);
        assert_eq!(
            storage.get_job(done.job_id).unwrap().unwrap().status,
            JobStatus::Completed
        );
    }

    #[test]
    fn test_mark_orphaned_skips_live_owner() {
        let storage = Storage::open_in_memory().unwrap();
        let live_since = base_time() - Duration::seconds(30);
        storage.heartbeat("live", base_time()).unwrap();
        storage
            .heartbeat("dead", base_time() - Duration::minutes(5))
            .unwrap();

        let mut running = record_at("https://youtube.com/watch?v=a", base_time());
        running.start_processing(base_time()).unwrap();
        storage.upsert_job_owned(&running, Some("live")).unwrap();
        // 所有者なしの再保存で所有者は消えない
        storage.upsert_job(&running).unwrap();
        let abandoned = record_at("https://youtube.com/watch?v=b", base_time());
        storage.upsert_job_owned(&abandoned, Some("dead")).unwrap();

        assert_eq!(storage.mark_orphaned(base_time(), live_since).unwrap(), 1);
        assert_eq!(
            storage.get_job(running.job_id).unwrap().unwrap().status,
            JobStatus::Processing
        );
        let loaded = storage.get_job(abandoned.job_id).unwrap().unwrap();
        assert_eq!(loaded.failure.unwrap().code, ErrorCode::Orphaned);

        // 生存中の所有者が書く終端レコードはそのまま保存される
        running.apply_progress(60, base_time());
        running.complete(artifact("/tmp/clip.mp4"), base_time()).unwrap();
        storage.upsert_job_owned(&running, Some("live")).unwrap();
        assert_eq!(
            storage.get_job(running.job_id).unwrap().unwrap().status,
            JobStatus::Completed
        );

        // 停止したインスタンスの行は孤立扱いになる
        let mut next = record_at("https://youtube.com/watch?v=c", base_time());
        next.start_processing(base_time()).unwrap();
        storage.upsert_job_owned(&next, Some("live")).unwrap();
        storage.remove_instance("live").unwrap();
        assert_eq!(storage.mark_orphaned(base_time(), live_since).unwrap(), 1);
    }

    #[test]
    fn test_settings_default_when_empty() {
        let storage = Storage::open_in_memory().unwrap();
        let settings = storage.get_settings().unwrap();
        assert_eq!(settings, DownloadSettings::default());
    }

    #[test]
    fn test_save_and_get_settings() {
        let storage = Storage::open_in_memory().unwrap();
        let settings = DownloadSettings {
            job_timeout_secs: 30,
            retention_hours: 48,
            default_quality: "720p".into(),
            ..Default::default()
        };
        storage.save_settings(&settings).unwrap();

        let loaded = storage.get_settings().unwrap();
        assert_eq!(loaded.job_timeout_secs, 30);
        assert_eq!(loaded.retention_hours, 48);
        assert_eq!(loaded.default_quality, "720p");
    }
}

//! ダウンロードジョブのライフサイクル管理コア。
//!
//! - `domain`: ジョブレコード、エラー、設定などの型
//! - `infra`: 外部プロセス実行 (yt-dlp)、SQLite 永続化、メトリクス
//! - `usecase`: レジストリ、スケジューラ、進捗通知、サービスコンテキスト

pub mod domain;
pub mod infra;
pub mod usecase;

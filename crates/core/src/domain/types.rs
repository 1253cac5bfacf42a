use serde::{Deserialize, Serialize};
use url::Url;

use super::error::AppError;
use super::job::{JobId, JobRecord};

/// 取得元プラットフォーム
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Platform {
    Youtube,
    Tiktok,
    Instagram,
    Twitter,
    Other,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Youtube => "YOUTUBE",
            Self::Tiktok => "TIKTOK",
            Self::Instagram => "INSTAGRAM",
            Self::Twitter => "TWITTER",
            Self::Other => "OTHER",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "YOUTUBE" => Some(Self::Youtube),
            "TIKTOK" => Some(Self::Tiktok),
            "INSTAGRAM" => Some(Self::Instagram),
            "TWITTER" => Some(Self::Twitter),
            "OTHER" => Some(Self::Other),
            _ => None,
        }
    }

    /// ホスト名からプラットフォームを判定する。
    pub fn detect(url: &Url) -> Self {
        let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
        let matches = |domain: &str| host == domain || host.ends_with(&format!(".{domain}"));

        if matches("youtube.com") || matches("youtu.be") {
            Self::Youtube
        } else if matches("tiktok.com") {
            Self::Tiktok
        } else if matches("instagram.com") {
            Self::Instagram
        } else if matches("twitter.com") || matches("x.com") {
            Self::Twitter
        } else {
            Self::Other
        }
    }
}

/// 取得するメディア種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Video => "VIDEO",
            Self::Audio => "AUDIO",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "VIDEO" => Some(Self::Video),
            "AUDIO" => Some(Self::Audio),
            _ => None,
        }
    }
}

/// 呼び出し側から受け取る投入リクエスト（未検証）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub url: String,
    /// 省略時は URL から判定
    #[serde(default)]
    pub platform: Option<Platform>,
    #[serde(default = "default_media_kind")]
    pub media_kind: MediaKind,
    #[serde(default)]
    pub quality: Option<String>,
}

fn default_media_kind() -> MediaKind {
    MediaKind::Video
}

impl SubmitRequest {
    pub fn video(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            platform: None,
            media_kind: MediaKind::Video,
            quality: None,
        }
    }

    pub fn audio(url: impl Into<String>) -> Self {
        Self {
            media_kind: MediaKind::Audio,
            ..Self::video(url)
        }
    }

    pub fn with_quality(mut self, quality: impl Into<String>) -> Self {
        self.quality = Some(quality.into());
        self
    }
}

/// 検証済みのジョブリクエスト。投入後は不変。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRequest {
    pub job_id: JobId,
    pub source_url: String,
    pub platform: Platform,
    pub media_kind: MediaKind,
    pub quality: String,
}

impl JobRequest {
    /// SubmitRequest を検証して JobRequest を組み立てる。
    pub fn from_submit(
        job_id: JobId,
        req: &SubmitRequest,
        default_quality: &str,
    ) -> Result<Self, AppError> {
        let url = parse_source_url(&req.url)?;
        let platform = req.platform.unwrap_or_else(|| Platform::detect(&url));

        // 音声抽出は YouTube のみ対応
        if req.media_kind == MediaKind::Audio && platform != Platform::Youtube {
            return Err(AppError::invalid_request(format!(
                "音声のダウンロードは YouTube のみ対応しています ({})",
                platform.as_str()
            )));
        }

        let quality = req
            .quality
            .as_deref()
            .map(str::trim)
            .filter(|q| !q.is_empty())
            .map(normalize_quality)
            .unwrap_or_else(|| normalize_quality(default_quality));

        Ok(Self {
            job_id,
            source_url: url.to_string(),
            platform,
            media_kind: req.media_kind,
            quality,
        })
    }

    /// 重複検出用の指紋
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::new(&self.source_url, self.media_kind, &self.quality)
    }
}

/// 正規化 URL + メディア種別 + 画質 から作る重複検出キー
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn new(source_url: &str, media_kind: MediaKind, quality: &str) -> Self {
        let normalized = Url::parse(source_url)
            .map(|u| normalize_url(&u))
            .unwrap_or_else(|_| source_url.trim().to_string());
        Self(format!(
            "{normalized}|{}|{}",
            media_kind.as_str(),
            normalize_quality(quality)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// 名前付きの画質プリセット
pub const QUALITY_PRESETS: &[&str] = &["best", "worst", "1080p", "720p", "480p", "360p"];

/// プリセット名だけを小文字に揃える。yt-dlp のフォーマット指定は大文字小文字を区別するのでそのまま。
pub fn normalize_quality(raw: &str) -> String {
    let trimmed = raw.trim();
    let lower = trimmed.to_ascii_lowercase();
    if QUALITY_PRESETS.contains(&lower.as_str()) {
        lower
    } else {
        trimmed.to_string()
    }
}

fn parse_source_url(raw: &str) -> Result<Url, AppError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(AppError::invalid_request("URL が指定されていません"));
    }

    let url = Url::parse(trimmed)
        .map_err(|e| AppError::invalid_request(format!("URL を解析できません: {e}")))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(AppError::invalid_request(format!(
            "対応していないスキームです: {}",
            url.scheme()
        )));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(AppError::invalid_request("URL にホストがありません"));
    }

    Ok(url)
}

/// 指紋用の URL 正規化: スキームを https に統一、www./m. を除去、
/// フラグメントと末尾スラッシュを削除、クエリをキー順にソート
pub fn normalize_url(url: &Url) -> String {
    let host = url.host_str().unwrap_or_default().to_ascii_lowercase();
    let host = host
        .strip_prefix("www.")
        .or_else(|| host.strip_prefix("m."))
        .unwrap_or(&host)
        .to_string();

    let path = url.path().trim_end_matches('/');

    let mut pairs: Vec<(String, String)> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    pairs.sort();

    let mut normalized = format!("https://{host}{path}");
    if !pairs.is_empty() {
        let query: Vec<String> = pairs.iter().map(|(k, v)| format!("{k}={v}")).collect();
        normalized.push('?');
        normalized.push_str(&query.join("&"));
    }
    normalized
}

/// 履歴ページ（カーソルベースページネーション）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryPage {
    pub items: Vec<JobRecord>,
    pub next_cursor: Option<String>,
}

/// プラットフォーム別件数
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformCount {
    pub platform: Platform,
    pub count: u64,
}

/// ダウンロード統計
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadStats {
    pub total_downloads: u64,
    pub successful_downloads: u64,
    pub failed_downloads: u64,
    pub today_downloads: u64,
    pub platform_stats: Vec<PlatformCount>,
    pub success_rate: f64,
}

/// 保持期間切れの削除候補
#[derive(Debug, Clone)]
pub struct RetentionCandidate {
    pub job_id: JobId,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub file_path: Option<String>,
}

/// 保持期間スイープの結果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub records_deleted: u32,
    pub files_deleted: u32,
    /// 実行中のため残したジョブ数
    pub skipped_active: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(url: &str) -> Result<JobRequest, AppError> {
        JobRequest::from_submit(JobId::new(), &SubmitRequest::video(url), "best")
    }

    #[test]
    fn test_detect_platform() {
        let cases = [
            ("https://www.youtube.com/watch?v=abc", Platform::Youtube),
            ("https://youtu.be/abc", Platform::Youtube),
            ("https://m.youtube.com/watch?v=abc", Platform::Youtube),
            ("https://www.tiktok.com/@user/video/1", Platform::Tiktok),
            ("https://instagram.com/p/xyz", Platform::Instagram),
            ("https://twitter.com/u/status/1", Platform::Twitter),
            ("https://x.com/u/status/1", Platform::Twitter),
            ("https://vimeo.com/123", Platform::Other),
        ];
        for (url, expected) in cases {
            assert_eq!(request(url).unwrap().platform, expected, "{url}");
        }
    }

    #[test]
    fn test_detect_does_not_match_substring_host() {
        // "max.com" は x.com ではない
        assert_eq!(request("https://max.com/v/1").unwrap().platform, Platform::Other);
    }

    #[test]
    fn test_rejects_invalid_urls() {
        for url in ["", "   ", "not a url", "ftp://example.com/a", "file:///etc/passwd"] {
            let err = request(url).unwrap_err();
            assert_eq!(err.code, crate::domain::error::ErrorCode::InvalidRequest, "{url}");
        }
    }

    #[test]
    fn test_audio_only_for_youtube() {
        let err = JobRequest::from_submit(
            JobId::new(),
            &SubmitRequest::audio("https://www.tiktok.com/@u/video/1"),
            "best",
        )
        .unwrap_err();
        assert_eq!(err.code, crate::domain::error::ErrorCode::InvalidRequest);

        let ok = JobRequest::from_submit(
            JobId::new(),
            &SubmitRequest::audio("https://youtube.com/watch?v=abc"),
            "best",
        )
        .unwrap();
        assert_eq!(ok.media_kind, MediaKind::Audio);
    }

    #[test]
    fn test_quality_defaults_and_normalizes() {
        let r = request("https://youtube.com/watch?v=abc").unwrap();
        assert_eq!(r.quality, "best");

        let r = JobRequest::from_submit(
            JobId::new(),
            &SubmitRequest::video("https://youtube.com/watch?v=abc").with_quality(" 720P "),
            "best",
        )
        .unwrap();
        assert_eq!(r.quality, "720p");

        // フォーマット指定は大文字小文字を保つ
        let r = JobRequest::from_submit(
            JobId::new(),
            &SubmitRequest::video("https://youtube.com/watch?v=abc")
                .with_quality(" bv*[vcodec^=AVC1]+ba "),
            "best",
        )
        .unwrap();
        assert_eq!(r.quality, "bv*[vcodec^=AVC1]+ba");
        assert_ne!(
            r.fingerprint(),
            Fingerprint::new(&r.source_url, MediaKind::Video, "bv*[vcodec^=avc1]+ba")
        );
    }

    #[test]
    fn test_fingerprint_normalizes_equivalent_urls() {
        let a = Fingerprint::new("https://www.youtube.com/watch?v=abc&t=1#frag", MediaKind::Video, "best");
        let b = Fingerprint::new("http://youtube.com/watch/?t=1&v=abc", MediaKind::Video, "BEST");
        assert_eq!(a, b);
    }

    #[test]
    fn test_fingerprint_differs_by_kind_and_quality() {
        let url = "https://youtube.com/watch?v=abc";
        let video = Fingerprint::new(url, MediaKind::Video, "best");
        let audio = Fingerprint::new(url, MediaKind::Audio, "best");
        let hd = Fingerprint::new(url, MediaKind::Video, "720p");
        assert_ne!(video, audio);
        assert_ne!(video, hd);
    }
}

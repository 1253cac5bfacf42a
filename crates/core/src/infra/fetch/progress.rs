use regex::Regex;
use std::sync::OnceLock;

/// 後処理フェーズ（結合・変換）に入ったとみなす進捗値
pub const POST_PROCESSING_PROGRESS: u8 = 95;

/// yt-dlp が後処理中に出力する行の接頭辞
const POST_PROCESSOR_PREFIXES: &[&str] = &[
    "[Merger]",
    "[ExtractAudio]",
    "[VideoConvertor]",
    "[VideoRemuxer]",
    "[FixupM3u8]",
];

fn percent_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*\[download\]\s+(\d{1,3}(?:\.\d+)?)%").expect("valid progress regex")
    })
}

/// 1 行から進捗値 (0–100) を取り出す。進捗行でなければ None。
pub fn parse_progress_line(line: &str) -> Option<u8> {
    if let Some(caps) = percent_regex().captures(line) {
        let value: f64 = caps.get(1)?.as_str().parse().ok()?;
        return Some(value.floor().clamp(0.0, 100.0) as u8);
    }

    let trimmed = line.trim_start();
    if POST_PROCESSOR_PREFIXES
        .iter()
        .any(|prefix| trimmed.starts_with(prefix))
    {
        return Some(POST_PROCESSING_PROGRESS);
    }

    None
}

/// 出力行を順に受け取り、増加したときだけ進捗値を返す。
///
/// 同じ値・減少した値は捨てる（フォーマット毎にリセットされる
/// yt-dlp の 0% 行などもここで吸収される）。
#[derive(Debug, Default)]
pub struct ProgressTracker {
    last: Option<u8>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn observe(&mut self, line: &str) -> Option<u8> {
        let value = parse_progress_line(line)?;
        match self.last {
            Some(last) if value <= last => None,
            _ => {
                self.last = Some(value);
                Some(value)
            }
        }
    }

    pub fn last(&self) -> Option<u8> {
        self.last
    }
}

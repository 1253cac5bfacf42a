pub mod process;
pub mod progress;
mod scripted;
pub mod ytdlp;

pub use scripted::ScriptedFetcher;
pub use ytdlp::{YtDlpConfig, YtDlpFetcher};

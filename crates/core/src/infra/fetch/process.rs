use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;

use crate::domain::fetch::FetchError;

/// 失敗時メッセージに含める stderr の最大行数
const STDERR_TAIL_LINES: usize = 20;

/// 外部コマンドの完全な指定。シェル文字列ではなく引数ベクタで渡す。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }
}

/// 出力行の由来
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineSource {
    Stdout,
    Stderr,
}

/// 正常終了したプロセスの結果
#[derive(Debug)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stderr_tail: Vec<String>,
}

/// コマンドを起動し、stdout/stderr を行単位で `on_line` に流す。
///
/// - 非ゼロ終了・起動失敗・タイムアウトはすべて `FetchError` として返す
/// - タイムアウト時は子プロセスを kill する
/// - 返された future を drop した場合も `kill_on_drop` で子プロセスは終了する
pub async fn run_streaming<F>(
    spec: &CommandSpec,
    timeout: Duration,
    mut on_line: F,
) -> Result<ProcessOutput, FetchError>
where
    F: FnMut(LineSource, &str),
{
    let program = spec.program.display().to_string();

    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(dir) = &spec.working_dir {
        command.current_dir(dir);
    }

    log::debug!("Running {:?} {:?}", spec.program, spec.args);

    let mut child = command.spawn().map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => {
            FetchError::spawn(format!("{program} が見つかりません: {e}"))
        }
        std::io::ErrorKind::PermissionDenied => {
            FetchError::spawn(format!("{program} を実行する権限がありません: {e}"))
        }
        _ => FetchError::spawn(format!("{program} の起動に失敗: {e}")),
    })?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| FetchError::spawn("stdout パイプを取得できません"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| FetchError::spawn("stderr パイプを取得できません"))?;

    let mut stderr_tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);

    let drive = async {
        let mut out_lines = BufReader::new(stdout).lines();
        let mut err_lines = BufReader::new(stderr).lines();
        let mut out_done = false;
        let mut err_done = false;

        // 出力が両方閉じるまで到着順に処理する
        while !(out_done && err_done) {
            tokio::select! {
                line = out_lines.next_line(), if !out_done => match line {
                    Ok(Some(line)) => on_line(LineSource::Stdout, &line),
                    Ok(None) => out_done = true,
                    Err(e) => {
                        log::warn!("{program} stdout read error: {e}");
                        out_done = true;
                    }
                },
                line = err_lines.next_line(), if !err_done => match line {
                    Ok(Some(line)) => {
                        on_line(LineSource::Stderr, &line);
                        if stderr_tail.len() == STDERR_TAIL_LINES {
                            stderr_tail.pop_front();
                        }
                        stderr_tail.push_back(line);
                    }
                    Ok(None) => err_done = true,
                    Err(e) => {
                        log::warn!("{program} stderr read error: {e}");
                        err_done = true;
                    }
                },
            }
        }

        child.wait().await
    };

    let result = tokio::time::timeout(timeout, drive).await;

    let status = match result {
        Ok(Ok(status)) => status,
        Ok(Err(e)) => {
            return Err(FetchError::non_zero_exit(format!(
                "{program} の終了待ちに失敗: {e}"
            )));
        }
        Err(_) => {
            if let Err(e) = child.kill().await {
                log::warn!("{program} の強制終了に失敗: {e}");
            }
            return Err(FetchError::timeout(format!(
                "{program} が {}s でタイムアウトしました",
                timeout.as_secs()
            )));
        }
    };

    let stderr_tail: Vec<String> = stderr_tail.into_iter().collect();

    if !status.success() {
        return Err(FetchError::non_zero_exit(format!(
            "{program} exited with status {status}: {}",
            stderr_tail.join("\n")
        )));
    }

    Ok(ProcessOutput {
        status,
        stderr_tail,
    })
}

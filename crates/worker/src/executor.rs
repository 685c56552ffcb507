use std::fs;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use autoreduce_core::{
    config::{ExecutorConfig, PathsConfig},
    FailureKind, JobMessage, LogLocations, Outcome, PathTranslator, ReductionExecutor,
};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{error, info, instrument, warn};

use crate::output_capture::{open_stream_capture, pump_lines, StreamKind};
use crate::workspace::{copy_tree, OutputLayout, RunPaths, RunWorkspace};

/// 脚本通过退出码声明跳过时的消息
pub const SKIPPED_MESSAGE: &str = "Run has been skipped in script";

/// 约简脚本执行器
///
/// 每次运行启动一个独立的解释器子进程:
/// `interpreter... <script> <data> <staging> <variables>`,
/// 超过时间预算后杀掉整个进程组。
pub struct ScriptExecutor {
    config: ExecutorConfig,
    layout: OutputLayout,
    translator: PathTranslator,
}

enum Termination {
    Exited(ExitStatus),
    TimedOut,
    WaitFailed(String),
}

impl ScriptExecutor {
    pub fn new(config: ExecutorConfig, paths: PathsConfig) -> Self {
        Self {
            config,
            translator: PathTranslator::from_config(&paths),
            layout: OutputLayout::new(paths),
        }
    }

    /// 在给定路径上运行脚本
    #[instrument(skip(self, job, paths), fields(run = %job.identity()))]
    pub async fn run(&self, job: &JobMessage, paths: &RunPaths) -> Outcome {
        if let Err(detail) = validate_paths(paths) {
            warn!("路径校验失败: {}", detail);
            return Outcome::failure(FailureKind::Path, format!("Path error: {detail}"));
        }

        let log_dir = paths.log_dir();
        if let Err(e) = fs::create_dir_all(&log_dir) {
            return Outcome::failure(
                FailureKind::Path,
                format!("Permission error: cannot create {}: {e}", log_dir.display()),
            );
        }

        let logs = paths.log_locations(job);
        let label = job.identity().to_string();
        let excerpt = self.config.log_excerpt_bytes;
        let captures = open_stream_capture(&logs.out_log, StreamKind::Stdout, &label, excerpt)
            .and_then(|out| {
                open_stream_capture(&logs.err_log, StreamKind::Stderr, &label, excerpt)
                    .map(|err| (out, err))
            });
        let ((out_tee, _out_tail), (err_tee, err_tail)) = match captures {
            Ok(c) => c,
            Err(e) => {
                return Outcome::Error {
                    kind: FailureKind::Path,
                    message: format!("Permission error: cannot open log files: {e}"),
                    logs: None,
                    output_directory: Some(paths.final_dir.clone()),
                }
            }
        };

        let started = Instant::now();
        let mut child = match self.spawn(paths) {
            Ok(child) => child,
            Err(e) => {
                error!("启动约简脚本失败: {}", e);
                return self.script_error(
                    format!("Failed to start reduction script: {e}"),
                    logs,
                    paths,
                );
            }
        };

        let pumps = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => vec![
                tokio::spawn(pump_lines(stdout, out_tee)),
                tokio::spawn(pump_lines(stderr, err_tee)),
            ],
            _ => {
                let _ = child.kill().await;
                return self.script_error(
                    "Failed to capture reduction script output".to_string(),
                    logs,
                    paths,
                );
            }
        };

        let termination = self.wait_with_budget(&mut child).await;
        self.drain_pumps(pumps).await;

        info!(
            "约简脚本结束: run={}, duration={}ms",
            label,
            started.elapsed().as_millis()
        );

        let outcome = match termination {
            Termination::TimedOut => Outcome::Error {
                kind: FailureKind::Timeout,
                message: format!(
                    "Script ran for more than {} seconds - timed out",
                    self.config.script_timeout_seconds
                ),
                logs: Some(logs),
                output_directory: Some(paths.final_dir.clone()),
            },
            Termination::WaitFailed(e) => self.script_error(
                format!("Failed to wait for reduction script: {e}"),
                logs,
                paths,
            ),
            Termination::Exited(status) if status.success() => Outcome::Completed {
                logs,
                output_directory: paths.final_dir.clone(),
            },
            Termination::Exited(status) if status.code() == Some(self.config.skip_exit_code) => {
                let message = match err_tail.last_line() {
                    Some(reason) => format!("{SKIPPED_MESSAGE}: {reason}"),
                    None => SKIPPED_MESSAGE.to_string(),
                };
                Outcome::Error {
                    kind: FailureKind::Unsupported,
                    message,
                    logs: Some(logs),
                    output_directory: Some(paths.final_dir.clone()),
                }
            }
            Termination::Exited(status) => {
                let message = match err_tail.last_line() {
                    Some(line) => format!("Reduction script failed ({status}): {line}"),
                    None => format!("Reduction script failed ({status})"),
                };
                self.script_error(message, logs, paths)
            }
        };

        self.publish_staged_output(outcome, paths).await
    }

    fn spawn(&self, paths: &RunPaths) -> std::io::Result<Child> {
        let (program, interpreter_args) = self
            .config
            .interpreter
            .split_first()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "解释器未配置"))?;

        let mut cmd = Command::new(program);
        cmd.args(interpreter_args)
            .arg(&paths.script_file)
            .arg(&paths.data_file)
            .arg(&paths.staging_dir)
            .arg(&paths.variables_file)
            .current_dir(&paths.staging_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        cmd.process_group(0);

        cmd.spawn()
    }

    async fn wait_with_budget(&self, child: &mut Child) -> Termination {
        let budget = Duration::from_secs(self.config.script_timeout_seconds);
        match timeout(budget, child.wait()).await {
            Ok(Ok(status)) => Termination::Exited(status),
            Ok(Err(e)) => Termination::WaitFailed(e.to_string()),
            Err(_) => {
                warn!(
                    "约简脚本超过 {} 秒，强制终止",
                    self.config.script_timeout_seconds
                );
                kill_process_tree(child).await;
                Termination::TimedOut
            }
        }
    }

    /// 等待输出读取结束; 子进程的后代仍持有管道时放弃读取
    async fn drain_pumps(&self, pumps: Vec<JoinHandle<std::io::Result<()>>>) {
        let grace = Duration::from_secs(self.config.kill_grace_seconds);
        for pump in pumps {
            let abort = pump.abort_handle();
            match timeout(grace, pump).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => warn!("写入脚本日志失败: {}", e),
                Ok(Err(e)) => warn!("输出读取任务异常: {}", e),
                Err(_) => {
                    warn!("输出读取超时，放弃剩余输出");
                    abort.abort();
                }
            }
        }
    }

    fn script_error(&self, message: String, logs: LogLocations, paths: &RunPaths) -> Outcome {
        Outcome::Error {
            kind: FailureKind::Script,
            message,
            logs: Some(logs),
            output_directory: Some(paths.final_dir.clone()),
        }
    }

    /// 暂存目录复制到最终目录, 失败时保留部分输出便于诊断
    async fn publish_staged_output(&self, outcome: Outcome, paths: &RunPaths) -> Outcome {
        let source = paths.staging_dir.clone();
        let destination = paths.final_dir.clone();
        let copied =
            tokio::task::spawn_blocking(move || copy_tree(&source, &destination)).await;

        let failure = match copied {
            Ok(Ok(())) => return outcome,
            Ok(Err(e)) => e.to_string(),
            Err(e) => e.to_string(),
        };
        error!("复制约简输出到 {} 失败: {}", paths.final_dir.display(), failure);

        match outcome {
            Outcome::Completed {
                logs,
                output_directory,
            } => Outcome::Error {
                kind: FailureKind::Path,
                message: format!(
                    "Permission error: cannot copy output to {}: {failure}",
                    paths.final_dir.display()
                ),
                logs: Some(logs),
                output_directory: Some(output_directory),
            },
            other => other,
        }
    }
}

#[async_trait]
impl ReductionExecutor for ScriptExecutor {
    async fn execute(&self, job: &JobMessage) -> Outcome {
        let workspace = match RunWorkspace::prepare(job, &self.layout, &self.translator) {
            Ok(workspace) => workspace,
            Err(e) => {
                warn!("准备运行工作区失败: {}", e);
                return Outcome::failure(
                    FailureKind::Path,
                    format!("Permission error: cannot prepare run workspace: {e}"),
                );
            }
        };
        self.run(job, workspace.paths()).await
    }
}

#[cfg(unix)]
async fn kill_process_tree(child: &mut Child) {
    if let Some(pid) = child.id() {
        // 进程组ID等于子进程ID
        match Command::new("kill")
            .args(["-KILL", "--", &format!("-{pid}")])
            .status()
            .await
        {
            Ok(status) if status.success() => {}
            Ok(status) => warn!("终止进程组 {} 失败: {}", pid, status),
            Err(e) => warn!("执行kill命令失败: pid={}, error={}", pid, e),
        }
    }
    if let Err(e) = child.kill().await {
        warn!("终止约简脚本失败: {}", e);
    }
}

#[cfg(not(unix))]
async fn kill_process_tree(child: &mut Child) {
    if let Err(e) = child.kill().await {
        warn!("终止约简脚本失败: {}", e);
    }
}

/// 所有路径必须是绝对路径、存在且可访问
pub fn validate_paths(paths: &RunPaths) -> Result<(), String> {
    check_readable_file("data file", &paths.data_file)?;
    check_readable_file("script file", &paths.script_file)?;
    check_readable_file("variables file", &paths.variables_file)?;
    check_writable_dir("staging directory", &paths.staging_dir)?;
    check_writable_dir("output directory", &paths.final_dir)?;
    Ok(())
}

fn check_absolute(what: &str, path: &Path) -> Result<(), String> {
    if path.is_absolute() {
        Ok(())
    } else {
        Err(format!("{what} is not an absolute path: {}", path.display()))
    }
}

fn check_readable_file(what: &str, path: &Path) -> Result<(), String> {
    check_absolute(what, path)?;
    if !path.is_file() {
        return Err(format!("{what} does not exist: {}", path.display()));
    }
    fs::File::open(path)
        .map(|_| ())
        .map_err(|e| format!("{what} is not readable: {} ({e})", path.display()))
}

fn check_writable_dir(what: &str, path: &Path) -> Result<(), String> {
    check_absolute(what, path)?;
    let metadata = fs::metadata(path)
        .map_err(|_| format!("{what} does not exist: {}", path.display()))?;
    if !metadata.is_dir() {
        return Err(format!("{what} is not a directory: {}", path.display()));
    }
    if metadata.permissions().readonly() {
        return Err(format!("{what} is not writable: {}", path.display()));
    }
    Ok(())
}

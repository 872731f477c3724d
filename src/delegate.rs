//! Delegate invoker: runs the external program that owns every session mutation
//!
//! The program is called as `<program> <verb> <args...>`. Exit code 0 is success.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::{QnaError, Result};
use crate::events::EventSink;

/// Outcome of one delegate run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelegateOutput {
    pub success: bool,
    /// Full stdout, trailing newline included
    pub output: String,
    /// Failure description, or stderr of a successful run when non-empty
    pub error: Option<String>,
}

impl DelegateOutput {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
        }
    }

    /// Map a failed run to [`QnaError::Delegate`] carrying the delegate's text
    pub fn into_result(self, verb: &str) -> Result<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(QnaError::Delegate {
                message: self
                    .error
                    .filter(|e| !e.trim().is_empty())
                    .unwrap_or_else(|| format!("{} failed", verb)),
            })
        }
    }
}

/// Capability to run one delegate verb
#[async_trait]
pub trait Delegate: Send + Sync {
    async fn run(&self, verb: &str, args: &[String]) -> DelegateOutput;
}

/// Quote an argument for display when it is empty or would split in a shell
pub fn quote_arg(arg: &str) -> String {
    let needs_quotes = arg.is_empty()
        || arg
            .chars()
            .any(|c| c.is_whitespace() || "\"'\\$`;&|<>()*?!#~".contains(c));
    if !needs_quotes {
        return arg.to_string();
    }
    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    for ch in arg.chars() {
        if matches!(ch, '"' | '\\' | '$' | '`') {
            quoted.push('\\');
        }
        quoted.push(ch);
    }
    quoted.push('"');
    quoted
}

/// Human-readable `verb arg1 "arg two"` rendering of an invocation
pub fn command_line(verb: &str, args: &[String]) -> String {
    std::iter::once(verb.to_string())
        .chain(args.iter().map(|a| quote_arg(a)))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Runs the delegate as a child process, without a shell
#[derive(Debug, Clone)]
pub struct ProcessDelegate {
    program: PathBuf,
    cwd: Option<PathBuf>,
}

impl ProcessDelegate {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            cwd: None,
        }
    }

    /// Set the working directory for the delegate subprocess
    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

#[async_trait]
impl Delegate for ProcessDelegate {
    async fn run(&self, verb: &str, args: &[String]) -> DelegateOutput {
        let mut cmd = Command::new(&self.program);
        cmd.kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .arg(verb)
            .args(args);
        if let Some(ref dir) = self.cwd {
            cmd.current_dir(dir);
        }

        let output = match cmd.output().await {
            Ok(output) => output,
            Err(e) => {
                return DelegateOutput::failed(format!(
                    "failed to start {}: {}",
                    self.program.display(),
                    e
                ));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if output.status.success() {
            DelegateOutput {
                success: true,
                output: stdout,
                error: (!stderr.is_empty()).then_some(stderr),
            }
        } else {
            let error = if stderr.is_empty() {
                format!("{} exited with {}", verb, output.status)
            } else {
                stderr
            };
            DelegateOutput {
                success: false,
                output: stdout,
                error: Some(error),
            }
        }
    }
}

/// One recorded call made against a [`ScriptedDelegate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub verb: String,
    pub args: Vec<String>,
}

impl RecordedCall {
    pub fn command_line(&self) -> String {
        command_line(&self.verb, &self.args)
    }
}

/// Fake delegate replaying scripted outputs in order and recording every call.
///
/// Once the script runs out every call succeeds with empty output.
#[derive(Default)]
pub struct ScriptedDelegate {
    script: Mutex<VecDeque<DelegateOutput>>,
    calls: Mutex<Vec<RecordedCall>>,
    delay: Option<Duration>,
}

impl ScriptedDelegate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_outputs(outputs: impl IntoIterator<Item = DelegateOutput>) -> Self {
        Self {
            script: Mutex::new(outputs.into_iter().collect()),
            ..Self::default()
        }
    }

    /// Sleep before answering, to exercise timeouts
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Delegate for ScriptedDelegate {
    async fn run(&self, verb: &str, args: &[String]) -> DelegateOutput {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(RecordedCall {
                verb: verb.to_string(),
                args: args.to_vec(),
            });
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.script
            .lock()
            .ok()
            .and_then(|mut s| s.pop_front())
            .unwrap_or_else(|| DelegateOutput::ok(""))
    }
}

/// Wraps a [`Delegate`] with a timeout, optional serialization and event logging
pub struct DelegateInvoker {
    delegate: Arc<dyn Delegate>,
    events: Arc<dyn EventSink>,
    timeout: Duration,
    gate: Option<tokio::sync::Mutex<()>>,
}

impl DelegateInvoker {
    pub fn new(delegate: Arc<dyn Delegate>, events: Arc<dyn EventSink>, timeout: Duration) -> Self {
        Self {
            delegate,
            events,
            timeout,
            gate: None,
        }
    }

    /// Run at most one invocation at a time
    pub fn serialized(mut self, serialize: bool) -> Self {
        self.gate = serialize.then(|| tokio::sync::Mutex::new(()));
        self
    }

    pub fn is_serialized(&self) -> bool {
        self.gate.is_some()
    }

    /// Run `verb` with `args`. Only a timeout is an `Err`; delegate failures come
    /// back as an unsuccessful [`DelegateOutput`].
    pub async fn invoke(&self, verb: &str, args: &[String]) -> Result<DelegateOutput> {
        let _guard = match self.gate {
            Some(ref gate) => Some(gate.lock().await),
            None => None,
        };

        tracing::debug!("delegate: {}", command_line(verb, args));
        match tokio::time::timeout(self.timeout, self.delegate.run(verb, args)).await {
            Ok(result) => {
                self.events.delegate_call(
                    verb,
                    args,
                    result.success,
                    &result.output,
                    result.error.as_deref(),
                );
                Ok(result)
            }
            Err(_) => {
                let timeout_ms = self.timeout.as_millis() as u64;
                self.events.delegate_call(
                    verb,
                    args,
                    false,
                    "",
                    Some(&format!("timed out after {}ms", timeout_ms)),
                );
                Err(QnaError::DelegateTimeout {
                    verb: verb.to_string(),
                    timeout_ms,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{EventLevel, MemorySink};

    fn args(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_command_line_quotes_free_text() {
        assert_eq!(
            command_line("create_question", &args(&["Pick a color"])),
            r#"create_question "Pick a color""#
        );
        assert_eq!(
            command_line("update_answer", &args(&["q_001", "blue", "", "", "option"])),
            r#"update_answer q_001 blue "" "" option"#
        );
        assert_eq!(quote_arg(r#"say "hi" $HOME"#), r#""say \"hi\" \$HOME""#);
    }

    #[tokio::test]
    async fn test_invoker_records_event_per_call() {
        let sink = Arc::new(MemorySink::new());
        let delegate = Arc::new(ScriptedDelegate::with_outputs([
            DelegateOutput::ok("x".repeat(500)),
            DelegateOutput::failed("disk full"),
        ]));
        let invoker = DelegateInvoker::new(delegate.clone(), sink.clone(), Duration::from_secs(5));

        let first = invoker.invoke("backup", &[]).await.unwrap();
        assert!(first.success);
        let second = invoker.invoke("backup", &[]).await.unwrap();
        assert!(!second.success);

        let events = sink.matching("Delegate call: backup");
        assert_eq!(events.len(), 2);
        let preview = events[0].data.as_ref().unwrap()["output"].as_str().unwrap();
        assert_eq!(preview.len(), 200);
        assert_eq!(events[1].level, EventLevel::Error);
        assert_eq!(delegate.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_invoker_times_out() {
        let sink = Arc::new(MemorySink::new());
        let delegate =
            Arc::new(ScriptedDelegate::new().with_delay(Duration::from_millis(500)));
        let invoker = DelegateInvoker::new(delegate, sink.clone(), Duration::from_millis(20))
            .serialized(true);

        let err = invoker.invoke("backup", &[]).await.unwrap_err();
        assert!(matches!(
            err,
            QnaError::DelegateTimeout { timeout_ms: 20, .. }
        ));
        assert_eq!(sink.matching("Delegate call").len(), 1);
    }

    /// Tracks how many runs overlap
    #[derive(Default)]
    struct OverlapDelegate {
        in_flight: std::sync::atomic::AtomicUsize,
        max_in_flight: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl Delegate for OverlapDelegate {
        async fn run(&self, _verb: &str, _args: &[String]) -> DelegateOutput {
            use std::sync::atomic::Ordering;
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            DelegateOutput::ok("")
        }
    }

    async fn max_overlap(serialize: bool) -> usize {
        let delegate = Arc::new(OverlapDelegate::default());
        let invoker = DelegateInvoker::new(
            delegate.clone(),
            Arc::new(MemorySink::new()),
            Duration::from_secs(5),
        )
        .serialized(serialize);
        assert_eq!(invoker.is_serialized(), serialize);

        let a = args(&["q_1", "red", "", "", "option"]);
        let b = args(&["q_2", "blue", "", "", "option"]);
        let (first, second) = tokio::join!(
            invoker.invoke("update_answer", &a),
            invoker.invoke("update_answer", &b)
        );
        assert!(first.unwrap().success && second.unwrap().success);
        delegate
            .max_in_flight
            .load(std::sync::atomic::Ordering::SeqCst)
    }

    #[tokio::test]
    async fn test_serialized_invoker_runs_one_at_a_time() {
        assert_eq!(max_overlap(true).await, 1);
        assert_eq!(max_overlap(false).await, 2);
    }

    #[test]
    fn test_failed_output_maps_to_delegate_error() {
        let err = DelegateOutput::failed("disk full")
            .into_result("backup")
            .unwrap_err();
        assert_eq!(err.public_message(), "disk full");

        let err = DelegateOutput::failed("  ").into_result("backup").unwrap_err();
        assert_eq!(err.public_message(), "backup failed");
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use tempfile::tempdir;

        fn script(dir: &std::path::Path, body: &str) -> PathBuf {
            let path = dir.join("core_script.sh");
            std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            let mut perms = std::fs::metadata(&path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&path, perms).unwrap();
            path
        }

        #[tokio::test]
        async fn test_process_passes_args_verbatim() {
            let dir = tempdir().unwrap();
            let program = script(
                dir.path(),
                r#"echo "verb=$1"; echo "argc=$#"; echo "second=$3"; echo "warn" >&2"#,
            );
            let delegate = ProcessDelegate::new(program).with_cwd(dir.path());

            let out = delegate
                .run("update_answer", &args(&["q_1", "", "two words"]))
                .await;
            assert!(out.success);
            assert_eq!(out.output, "verb=update_answer\nargc=4\nsecond=\n");
            assert_eq!(out.error.as_deref(), Some("warn"));
        }

        #[tokio::test]
        async fn test_process_failure_uses_stderr() {
            let dir = tempdir().unwrap();
            let program = script(dir.path(), r#"echo partial; echo "disk full" >&2; exit 3"#);
            let out = ProcessDelegate::new(program).run("backup", &[]).await;

            assert!(!out.success);
            assert_eq!(out.output, "partial\n");
            assert_eq!(out.error.as_deref(), Some("disk full"));
        }

        #[tokio::test]
        async fn test_process_spawn_failure() {
            let dir = tempdir().unwrap();
            let out = ProcessDelegate::new(dir.path().join("missing.sh"))
                .run("backup", &[])
                .await;
            assert!(!out.success);
            assert!(out.error.unwrap().contains("failed to start"));
        }
    }
}

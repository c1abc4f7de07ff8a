//! Generic stream-JSON subprocess driver.
//!
//! Shared by every CLI backend: spawn the binary, read newline-delimited
//! JSON, fan typed events to the handler, and enforce liveness with three
//! timers. The heartbeat fires on read inactivity, the watchdog on
//! absolute elapsed time, and cancellation grants a short grace period
//! before the kill. All timers race the reader inside one `select!` loop,
//! so a process that exits normally can never be killed late — the EOF
//! branch wins first (the `cmd_done` short-circuit, expressed as control
//! flow).

use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::errors::{BackendError, BackendErrorKind};

use super::stream::{ContentBlock, StreamFrame, tool_result_text};
use super::{BackendEvent, BackendResult, ExecuteOptions, normalize_tool_name};

/// Wait this long after context cancellation before SIGKILL.
const GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Individual frames may be up to 1 MiB.
const READ_BUFFER: usize = 1024 * 1024;

#[derive(Default)]
struct ParseState {
    session_id: Option<String>,
    model: Option<String>,
    tokens_input: u64,
    tokens_output: u64,
    /// Authoritative totals from the result frame, when present.
    result_usage_seen: bool,
    accumulated_text: String,
    final_output: Option<String>,
    result_is_error: bool,
}

enum Ending {
    Eof,
    Heartbeat,
    Watchdog,
    Cancelled,
}

/// Run a session-resume-aware execution: on `session_not_found` with a
/// resume id set, retry once with the id cleared.
pub(crate) async fn run_with_session_retry<F>(
    binary: &str,
    opts: &ExecuteOptions,
    tool_table: &[(&str, &str)],
    build_args: F,
) -> Result<BackendResult, BackendError>
where
    F: Fn(&ExecuteOptions) -> Vec<String>,
{
    let first = run_stream_cli(binary, build_args(opts), opts, tool_table).await;
    match first {
        Err(ref e)
            if e.kind == BackendErrorKind::SessionNotFound
                && opts.resume_session_id.is_some() =>
        {
            warn!(backend = binary, "session not found, retrying with a clean session");
            let mut retry_opts = opts.clone();
            retry_opts.resume_session_id = None;
            run_stream_cli(binary, build_args(&retry_opts), &retry_opts, tool_table).await
        }
        other => other,
    }
}

/// Spawn the CLI and drive it to completion.
pub(crate) async fn run_stream_cli(
    binary: &str,
    args: Vec<String>,
    opts: &ExecuteOptions,
    tool_table: &[(&str, &str)],
) -> Result<BackendResult, BackendError> {
    debug!(binary, ?args, "spawning backend subprocess");

    let mut child = Command::new(binary)
        .args(&args)
        .current_dir(&opts.project_path)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| {
            BackendError::new(
                BackendErrorKind::InvalidConfig,
                format!("failed to spawn {binary}: {e}"),
            )
        })?;

    let pid = child.id().unwrap_or(0);

    let stdout = child.stdout.take().ok_or_else(|| {
        BackendError::new(BackendErrorKind::Unknown, "subprocess stdout not captured")
    })?;
    let stderr = child.stderr.take();
    let stderr_task = tokio::spawn(async move {
        let mut buf = String::new();
        if let Some(mut stderr) = stderr {
            let _ = stderr.read_to_string(&mut buf).await;
        }
        buf
    });

    let mut reader = BufReader::with_capacity(READ_BUFFER, stdout).lines();
    let mut state = ParseState::default();
    let mut cancel = opts.cancel.clone();

    let started = Instant::now();
    let mut last_frame = started;

    let ending = loop {
        let heartbeat_deadline = last_frame + opts.heartbeat_timeout;
        let watchdog_deadline = started + opts.watchdog_timeout;

        tokio::select! {
            line = reader.next_line() => match line {
                Ok(Some(line)) => {
                    last_frame = Instant::now();
                    process_line(&line, tool_table, &mut state, opts);
                }
                Ok(None) => break Ending::Eof,
                Err(e) => {
                    emit(opts, &BackendEvent::Error { message: format!("stream read error: {e}") });
                    break Ending::Eof;
                }
            },
            _ = tokio::time::sleep_until(heartbeat_deadline) => break Ending::Heartbeat,
            _ = tokio::time::sleep_until(watchdog_deadline) => break Ending::Watchdog,
            _ = cancelled(&mut cancel) => break Ending::Cancelled,
        }
    };

    match ending {
        Ending::Eof => {
            // stdout closed; the process normally exits right behind it.
            // A process that lingers past the heartbeat window is hung.
            let status = match tokio::time::timeout(opts.heartbeat_timeout, child.wait()).await {
                Ok(status) => status.map_err(|e| {
                    BackendError::new(BackendErrorKind::Unknown, format!("wait failed: {e}"))
                })?,
                Err(_) => {
                    warn!(pid, "output closed but process did not exit, killing");
                    kill_and_reap(&mut child).await;
                    let _ = stderr_task.await;
                    return Err(BackendError::new(
                        BackendErrorKind::Timeout,
                        "process did not exit after closing its output",
                    ));
                }
            };
            let stderr = stderr_task.await.unwrap_or_default();
            finish(state, status.code().unwrap_or(-1), status.success(), &stderr)
        }
        Ending::Heartbeat => {
            let age = last_frame.elapsed();
            warn!(pid, ?age, "heartbeat timeout, killing subprocess");
            if let Some(cb) = &opts.heartbeat_callback {
                cb(pid, age);
            }
            kill_and_reap(&mut child).await;
            let _ = stderr_task.await;
            Err(BackendError::new(
                BackendErrorKind::Timeout,
                format!("no output for {}s, subprocess killed", age.as_secs()),
            ))
        }
        Ending::Watchdog => {
            let elapsed = started.elapsed();
            warn!(pid, ?elapsed, "watchdog timeout, killing subprocess");
            if let Some(cb) = &opts.watchdog_callback {
                cb(pid, elapsed);
            }
            kill_and_reap(&mut child).await;
            let _ = stderr_task.await;
            Err(BackendError::new(
                BackendErrorKind::Timeout,
                format!(
                    "exceeded watchdog timeout of {}s, subprocess killed",
                    opts.watchdog_timeout.as_secs()
                ),
            ))
        }
        Ending::Cancelled => {
            debug!(pid, "cancelled, waiting grace period");
            tokio::select! {
                _ = child.wait() => {}
                _ = tokio::time::sleep(GRACE_PERIOD) => {
                    warn!(pid, "grace period expired, killing subprocess");
                    kill_and_reap(&mut child).await;
                }
            }
            let _ = stderr_task.await;
            Err(BackendError::new(
                BackendErrorKind::Unknown,
                "cancelled by caller",
            ))
        }
    }
}

/// Resolve once the cancel signal reads `true`. A closed channel means
/// the caller can no longer cancel; pend forever.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// SIGKILL, tolerating an already-dead process, then reap.
async fn kill_and_reap(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "kill failed, process already exited");
    }
    let _ = child.wait().await;
}

fn emit(opts: &ExecuteOptions, event: &BackendEvent) {
    if let Some(handler) = &opts.event_handler {
        handler(event);
    }
}

fn process_line(
    line: &str,
    tool_table: &[(&str, &str)],
    state: &mut ParseState,
    opts: &ExecuteOptions,
) {
    if line.trim().is_empty() {
        return;
    }

    let frame = match serde_json::from_str::<StreamFrame>(line) {
        Ok(frame) => frame,
        Err(_) => {
            // Interleaved non-JSON output is surfaced, not fatal
            emit(opts, &BackendEvent::Text { text: line.to_string() });
            return;
        }
    };

    match frame {
        StreamFrame::System {
            subtype,
            session_id,
            model,
        } => {
            if let Some(model) = model {
                state.model.get_or_insert(model);
            }
            if subtype == "init" {
                if let Some(sid) = session_id {
                    state.session_id = Some(sid.clone());
                    emit(opts, &BackendEvent::Init { session_id: sid });
                }
            }
        }
        StreamFrame::Assistant { message, .. } => {
            if let Some(model) = message.model {
                state.model = Some(model);
            }
            if let Some(usage) = message.usage {
                if !state.result_usage_seen {
                    state.tokens_input += usage.input_tokens;
                    state.tokens_output += usage.output_tokens;
                }
            }
            for block in message.content {
                match block {
                    ContentBlock::ToolUse { name, input, .. } => {
                        let name = normalize_tool_name(&name, tool_table);
                        emit(opts, &BackendEvent::ToolUse { name, input });
                    }
                    ContentBlock::Text { text } => {
                        state.accumulated_text.push_str(&text);
                        state.accumulated_text.push('\n');
                        emit(opts, &BackendEvent::Text { text });
                    }
                    ContentBlock::ToolResult { content, is_error } => {
                        emit(
                            opts,
                            &BackendEvent::ToolResult {
                                output: tool_result_text(&content),
                                is_error,
                            },
                        );
                    }
                }
            }
        }
        StreamFrame::User {
            tool_use_result,
            message,
        } => {
            // Some backends put results flat at top level, others nest
            // them in message content; accept both.
            if let Some(result) = tool_use_result {
                emit(
                    opts,
                    &BackendEvent::ToolResult {
                        output: tool_result_text(&result),
                        is_error: false,
                    },
                );
            } else if let Some(message) = message {
                for block in message.content {
                    if let ContentBlock::ToolResult { content, is_error } = block {
                        emit(
                            opts,
                            &BackendEvent::ToolResult {
                                output: tool_result_text(&content),
                                is_error,
                            },
                        );
                    }
                }
            }
        }
        StreamFrame::Result {
            result,
            is_error,
            usage,
            model,
            session_id,
            ..
        } => {
            if let Some(usage) = usage {
                // Result-frame usage is the authoritative total
                state.tokens_input = usage.input_tokens;
                state.tokens_output = usage.output_tokens;
                state.result_usage_seen = true;
            }
            if let Some(model) = model {
                state.model = Some(model);
            }
            if let Some(sid) = session_id {
                state.session_id.get_or_insert(sid);
            }
            state.result_is_error = is_error;
            let output = result.unwrap_or_default();
            state.final_output = Some(output.clone());
            emit(
                opts,
                &BackendEvent::Result {
                    output,
                    is_error,
                    tokens_input: state.tokens_input,
                    tokens_output: state.tokens_output,
                    model: state.model.clone(),
                },
            );
        }
    }
}

fn finish(
    state: ParseState,
    exit_code: i32,
    exited_ok: bool,
    stderr: &str,
) -> Result<BackendResult, BackendError> {
    if !exited_ok {
        return Err(BackendError::from_exit(exit_code, stderr));
    }
    if state.result_is_error {
        let message = state
            .final_output
            .clone()
            .filter(|o| !o.is_empty())
            .unwrap_or_else(|| "backend reported an error result".to_string());
        let kind = BackendErrorKind::classify(&format!("{message}\n{stderr}"));
        return Err(BackendError::new(kind, message).with_stderr(stderr));
    }

    let output = match state.final_output {
        Some(o) if !o.is_empty() => o,
        _ => state.accumulated_text,
    };
    Ok(BackendResult {
        success: true,
        output,
        session_id: state.session_id,
        tokens_input: state.tokens_input,
        tokens_output: state.tokens_output,
        model: state.model,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::{Arc, Mutex};

    fn opts_collecting(events: Arc<Mutex<Vec<BackendEvent>>>) -> ExecuteOptions {
        let mut opts = ExecuteOptions::new("prompt", PathBuf::from("/tmp"));
        opts.event_handler = Some(Arc::new(move |e: &BackendEvent| {
            events.lock().unwrap().push(e.clone());
        }));
        opts
    }

    #[test]
    fn process_line_invalid_json_becomes_text() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let opts = opts_collecting(Arc::clone(&events));
        let mut state = ParseState::default();

        process_line("npm WARN deprecated", &[], &mut state, &opts);

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            BackendEvent::Text { text } => assert_eq!(text, "npm WARN deprecated"),
            other => panic!("expected Text, got {other:?}"),
        }
    }

    #[test]
    fn process_line_init_captures_session() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let opts = opts_collecting(Arc::clone(&events));
        let mut state = ParseState::default();

        process_line(
            r#"{"type":"system","subtype":"init","session_id":"s-9"}"#,
            &[],
            &mut state,
            &opts,
        );
        assert_eq!(state.session_id.as_deref(), Some("s-9"));
    }

    #[test]
    fn process_line_normalizes_tool_names() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let opts = opts_collecting(Arc::clone(&events));
        let mut state = ParseState::default();
        let table = &[("read_file", "Read")];

        process_line(
            r#"{"type":"assistant","message":{"content":[{"type":"tool_use","name":"read_file","input":{}}]}}"#,
            table,
            &mut state,
            &opts,
        );
        let events = events.lock().unwrap();
        match &events[0] {
            BackendEvent::ToolUse { name, .. } => assert_eq!(name, "Read"),
            other => panic!("expected ToolUse, got {other:?}"),
        }
    }

    #[test]
    fn result_usage_overrides_assistant_accumulation() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let opts = opts_collecting(Arc::clone(&events));
        let mut state = ParseState::default();

        process_line(
            r#"{"type":"assistant","message":{"content":[],"usage":{"input_tokens":10,"output_tokens":5}}}"#,
            &[],
            &mut state,
            &opts,
        );
        assert_eq!(state.tokens_input, 10);

        process_line(
            r#"{"type":"result","subtype":"success","result":"ok","usage":{"input_tokens":100,"output_tokens":40}}"#,
            &[],
            &mut state,
            &opts,
        );
        assert_eq!(state.tokens_input, 100);
        assert_eq!(state.tokens_output, 40);
    }

    #[test]
    fn finish_prefers_result_output_over_accumulated() {
        let mut state = ParseState::default();
        state.accumulated_text = "thinking...\n".to_string();
        state.final_output = Some("final answer".to_string());
        let result = finish(state, 0, true, "").unwrap();
        assert_eq!(result.output, "final answer");
        assert!(result.success);
    }

    #[test]
    fn finish_falls_back_to_accumulated_text() {
        let mut state = ParseState::default();
        state.accumulated_text = "only prose".to_string();
        let result = finish(state, 0, true, "").unwrap();
        assert_eq!(result.output, "only prose");
    }

    #[test]
    fn finish_nonzero_exit_classifies_stderr() {
        let state = ParseState::default();
        let err = finish(state, 1, false, "rate limit exceeded").unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::RateLimit);
    }

    #[test]
    fn finish_error_result_with_clean_exit() {
        let mut state = ParseState::default();
        state.result_is_error = true;
        state.final_output = Some("session not found".to_string());
        let err = finish(state, 0, true, "").unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::SessionNotFound);
    }

    #[tokio::test]
    async fn heartbeat_kills_silent_process() {
        let mut opts = ExecuteOptions::new("p", std::env::temp_dir());
        opts.heartbeat_timeout = Duration::from_millis(200);
        opts.watchdog_timeout = Duration::from_secs(60);
        let fired = Arc::new(Mutex::new(None));
        let fired_clone = Arc::clone(&fired);
        opts.heartbeat_callback = Some(Arc::new(move |pid, age| {
            *fired_clone.lock().unwrap() = Some((pid, age));
        }));

        let err = run_stream_cli("sleep", vec!["30".to_string()], &opts, &[])
            .await
            .unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::Timeout);
        assert!(fired.lock().unwrap().is_some());
    }

    #[tokio::test]
    async fn watchdog_kills_long_running_process() {
        let mut opts = ExecuteOptions::new("p", std::env::temp_dir());
        // heartbeat longer than watchdog so the watchdog fires first
        opts.heartbeat_timeout = Duration::from_secs(60);
        opts.watchdog_timeout = Duration::from_millis(200);
        let fired = Arc::new(Mutex::new(false));
        let fired_clone = Arc::clone(&fired);
        opts.watchdog_callback = Some(Arc::new(move |_pid, _dur| {
            *fired_clone.lock().unwrap() = true;
        }));

        let err = run_stream_cli("sleep", vec!["30".to_string()], &opts, &[])
            .await
            .unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::Timeout);
        assert!(*fired.lock().unwrap());
    }

    #[tokio::test]
    async fn frequent_output_keeps_heartbeat_quiet() {
        let mut opts = ExecuteOptions::new("p", std::env::temp_dir());
        opts.heartbeat_timeout = Duration::from_millis(400);
        opts.watchdog_timeout = Duration::from_secs(60);

        // emits a line every 100ms for ~0.5s, then exits cleanly
        let script = "for i in 1 2 3 4 5; do echo line-$i; sleep 0.1; done";
        let result = run_stream_cli(
            "sh",
            vec!["-c".to_string(), script.to_string()],
            &opts,
            &[],
        )
        .await
        .unwrap();
        assert!(result.success);
    }

    #[tokio::test]
    async fn cancellation_stops_the_run() {
        let (tx, rx) = watch::channel(false);
        let mut opts = ExecuteOptions::new("p", std::env::temp_dir()).with_cancel(rx);
        opts.heartbeat_timeout = Duration::from_secs(60);
        opts.watchdog_timeout = Duration::from_secs(60);

        let handle = tokio::spawn(async move {
            run_stream_cli("sleep", vec!["30".to_string()], &opts, &[]).await
        });
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();

        let err = handle.await.unwrap().unwrap_err();
        assert!(err.message.contains("cancelled"));
    }

    #[tokio::test]
    async fn missing_binary_is_invalid_config() {
        let opts = ExecuteOptions::new("p", std::env::temp_dir());
        let err = run_stream_cli("definitely-not-a-binary-xyz", vec![], &opts, &[])
            .await
            .unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::InvalidConfig);
    }

    #[tokio::test]
    async fn full_stream_end_to_end() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let mut opts = opts_collecting(Arc::clone(&events));
        opts.project_path = std::env::temp_dir();
        opts.heartbeat_timeout = Duration::from_secs(10);
        opts.watchdog_timeout = Duration::from_secs(10);

        let script = concat!(
            "echo '{\"type\":\"system\",\"subtype\":\"init\",\"session_id\":\"s1\"}'; ",
            "echo '{\"type\":\"assistant\",\"message\":{\"content\":[{\"type\":\"text\",\"text\":\"working\"}]}}'; ",
            "echo '{\"type\":\"result\",\"subtype\":\"success\",\"result\":\"done\",\"usage\":{\"input_tokens\":7,\"output_tokens\":3}}'",
        );
        let result = run_stream_cli(
            "sh",
            vec!["-c".to_string(), script.to_string()],
            &opts,
            &[],
        )
        .await
        .unwrap();

        assert!(result.success);
        assert_eq!(result.output, "done");
        assert_eq!(result.session_id.as_deref(), Some("s1"));
        assert_eq!(result.tokens_input, 7);
        assert_eq!(result.tokens_output, 3);

        let events = events.lock().unwrap();
        assert!(matches!(events[0], BackendEvent::Init { .. }));
        assert!(matches!(events[1], BackendEvent::Text { .. }));
        assert!(matches!(events.last().unwrap(), BackendEvent::Result { .. }));
    }

    #[tokio::test]
    async fn session_retry_clears_resume_id() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let calls = Arc::new(AtomicU32::new(0));
        let mut opts = ExecuteOptions::new("p", std::env::temp_dir());
        opts.resume_session_id = Some("dead-session".to_string());
        opts.heartbeat_timeout = Duration::from_secs(10);
        opts.watchdog_timeout = Duration::from_secs(10);

        // First invocation (resume id present) fails with session-not-found
        // on stderr; the retry (no resume id) succeeds.
        let calls_clone = Arc::clone(&calls);
        let result = run_with_session_retry("sh", &opts, &[], move |o| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            if o.resume_session_id.is_some() {
                vec![
                    "-c".to_string(),
                    "echo 'session not found' >&2; exit 1".to_string(),
                ]
            } else {
                vec![
                    "-c".to_string(),
                    "echo '{\"type\":\"result\",\"subtype\":\"success\",\"result\":\"ok\"}'"
                        .to_string(),
                ]
            }
        })
        .await
        .unwrap();

        assert!(result.success);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}

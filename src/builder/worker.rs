//! Worker threads.
//!
//! Each worker owns one child process at a time. The planner sends it a
//! resolved command plus the pipe-joined output paths; the worker runs the
//! command through the shell with combined stdout+stderr captured to a
//! per-worker temp file. On failure it deletes partial outputs, preserves
//! the captured output (renamed to `<target>-failed` for test actions), and
//! reports the log back for one consolidated failure message. Workers exit
//! silently when the request channel closes.
//!
//! Two pseudo-commands bypass the shell: `COPY src dst` (verbatim copy
//! preserving the execute bit) and `DUMMY path` (write a one-byte sentinel).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result;
use crossbeam_channel::{Receiver, Sender};

use crate::builder::graph::ActionId;
use crate::builder::killer::Killer;
use crate::util::fs;
use crate::util::process::ShellCommand;

/// Planner-to-worker dispatch.
#[derive(Debug, Clone)]
pub struct Request {
    pub action: ActionId,
    pub name: String,
    pub command: String,
    /// Pipe-joined output paths, build-dir-relative.
    pub outputs: String,
    pub is_test: bool,
    /// Soft timeout in seconds, for test actions.
    pub timeout: Option<u64>,
}

/// Worker-to-planner completion.
#[derive(Debug)]
pub enum Report {
    Done {
        worker: usize,
        action: ActionId,
    },
    Failed {
        worker: usize,
        action: ActionId,
        log: String,
    },
    /// Something unrecoverable happened inside a worker.
    Fatal,
}

/// Worker thread body.
pub fn run_worker(
    index: usize,
    build_dir: PathBuf,
    requests: Receiver<Request>,
    reports: Sender<Report>,
    killer: Arc<Killer>,
) {
    let capture = build_dir.join("tmp").join(format!("worker-{index}.log"));

    while let Ok(req) = requests.recv() {
        let report = match run_request(&build_dir, &capture, &req, &killer) {
            Ok(()) => Report::Done {
                worker: index,
                action: req.action,
            },
            Err(log) => {
                clean_failed_outputs(&build_dir, &req, &capture);
                Report::Failed {
                    worker: index,
                    action: req.action,
                    log,
                }
            }
        };
        if reports.send(report).is_err() {
            return;
        }
    }
}

/// Run one request. The error value is the diagnostic to show the user.
fn run_request(
    build_dir: &Path,
    capture: &Path,
    req: &Request,
    killer: &Killer,
) -> Result<(), String> {
    if let Some(result) = run_pseudo(build_dir, &req.command) {
        return result.map_err(|e| format!("{e:#}"));
    }

    if let Some(parent) = capture.parent() {
        fs::ensure_dir(parent).map_err(|e| format!("{e:#}"))?;
    }
    let mut child = ShellCommand::new(&req.command)
        .cwd(build_dir)
        .spawn_captured(capture)
        .map_err(|e| format!("{e:#}"))?;

    killer.register(child.id(), &req.name, req.timeout);
    let status = child.wait();
    killer.unregister(child.id());

    let status = status.map_err(|e| format!("{e:#}"))?;
    if !status.success() {
        let log = std::fs::read_to_string(capture).unwrap_or_default();
        return Err(log);
    }

    if req.is_test {
        // The captured run log becomes the passed-sentinel. The marker line
        // keeps it non-empty even for a silent test (a zero-length output
        // reads as missing).
        let log = std::fs::read_to_string(capture).unwrap_or_default();
        let sentinel = build_dir.join(first_output(req));
        fs::write_string(&sentinel, &format!("{log}passed\n"))
            .map_err(|e| format!("{e:#}"))?;
    }
    Ok(())
}

/// Handle `COPY` and `DUMMY`. Returns `None` for real shell commands.
fn run_pseudo(build_dir: &Path, command: &str) -> Option<Result<()>> {
    let tokens: Vec<&str> = command.split_whitespace().collect();
    match tokens.as_slice() {
        ["COPY", src, dst] => Some(fs::copy_preserving_exec(
            &build_dir.join(src),
            &build_dir.join(dst),
        )),
        ["DUMMY", path] => {
            // A zero-length file reads as missing, so the sentinel carries
            // one byte.
            Some(fs::write_string(&build_dir.join(path), "\n"))
        }
        _ => None,
    }
}

/// A failed action leaves no partial outputs behind. For test actions the
/// captured output is preserved as `<target>-failed`.
fn clean_failed_outputs(build_dir: &Path, req: &Request, capture: &Path) {
    for out in req.outputs.split('|').filter(|o| !o.is_empty()) {
        let _ = std::fs::remove_file(build_dir.join(out));
    }
    if req.is_test && capture.exists() {
        let failed = failed_path(first_output(req));
        let _ = std::fs::rename(capture, build_dir.join(failed));
    }
}

fn first_output(req: &Request) -> &str {
    req.outputs.split('|').next().unwrap_or_default()
}

fn failed_path(passed: &str) -> String {
    match passed.strip_suffix("-passed") {
        Some(stem) => format!("{stem}-failed"),
        None => format!("{passed}-failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use tempfile::TempDir;

    fn request(command: &str, outputs: &str) -> Request {
        Request {
            action: ActionId(0),
            name: "test action".to_string(),
            command: command.to_string(),
            outputs: outputs.to_string(),
            is_test: false,
            timeout: None,
        }
    }

    fn run_one(tmp: &TempDir, req: Request) -> Report {
        let (req_tx, req_rx) = unbounded();
        let (rep_tx, rep_rx) = unbounded();
        let killer = Killer::new();
        let dir = tmp.path().to_path_buf();
        let handle = std::thread::spawn(move || run_worker(0, dir, req_rx, rep_tx, killer));
        req_tx.send(req).unwrap();
        drop(req_tx);
        let report = rep_rx.recv().unwrap();
        handle.join().unwrap();
        report
    }

    #[test]
    fn test_successful_command() {
        let tmp = TempDir::new().unwrap();
        let report = run_one(&tmp, request("echo out > result", "result"));
        assert!(matches!(report, Report::Done { worker: 0, .. }));
        assert!(tmp.path().join("result").exists());
    }

    #[test]
    fn test_failure_deletes_outputs_and_reports_log() {
        let tmp = TempDir::new().unwrap();
        let report = run_one(
            &tmp,
            request("echo partial > result; echo broken >&2; false", "result"),
        );
        match report {
            Report::Failed { log, .. } => assert!(log.contains("broken")),
            other => panic!("expected failure, got {other:?}"),
        }
        assert!(!tmp.path().join("result").exists());
    }

    #[test]
    fn test_copy_pseudo_command() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("in"), "payload").unwrap();
        let report = run_one(&tmp, request("COPY in dist/out", "dist/out"));
        assert!(matches!(report, Report::Done { .. }));
        assert_eq!(
            std::fs::read_to_string(tmp.path().join("dist/out")).unwrap(),
            "payload"
        );
    }

    #[test]
    fn test_dummy_pseudo_command_is_nonempty() {
        let tmp = TempDir::new().unwrap();
        let report = run_one(&tmp, request("DUMMY obj/sentinel.slib", "obj/sentinel.slib"));
        assert!(matches!(report, Report::Done { .. }));
        let meta = std::fs::metadata(tmp.path().join("obj/sentinel.slib")).unwrap();
        assert!(meta.len() > 0);
    }

    #[test]
    fn test_test_action_writes_passed_sentinel() {
        let tmp = TempDir::new().unwrap();
        let mut req = request("echo test output", "priv/test/check-passed");
        req.is_test = true;
        std::fs::create_dir_all(tmp.path().join("priv/test")).unwrap();
        let report = run_one(&tmp, req);
        assert!(matches!(report, Report::Done { .. }));
        let sentinel = std::fs::read_to_string(tmp.path().join("priv/test/check-passed")).unwrap();
        assert!(sentinel.contains("test output"));
    }

    #[test]
    fn test_failed_test_leaves_failed_file() {
        let tmp = TempDir::new().unwrap();
        let mut req = request("echo assertion blew up; false", "priv/test/check-passed");
        req.is_test = true;
        std::fs::create_dir_all(tmp.path().join("priv/test")).unwrap();
        let report = run_one(&tmp, req);
        assert!(matches!(report, Report::Failed { .. }));
        let failed = std::fs::read_to_string(tmp.path().join("priv/test/check-failed")).unwrap();
        assert!(failed.contains("assertion blew up"));
        assert!(!tmp.path().join("priv/test/check-passed").exists());
    }

    #[test]
    fn test_worker_exits_on_channel_close() {
        let tmp = TempDir::new().unwrap();
        let (req_tx, req_rx) = unbounded::<Request>();
        let (rep_tx, _rep_rx) = unbounded();
        let killer = Killer::new();
        let dir = tmp.path().to_path_buf();
        let handle = std::thread::spawn(move || run_worker(0, dir, req_rx, rep_tx, killer));
        drop(req_tx);
        handle.join().unwrap();
    }
}

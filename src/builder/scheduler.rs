//! The scheduler: a single planner thread driving N worker threads.
//!
//! The planner owns the graph outright. It pops ready actions in ascending
//! creation order, dispatches dirty ones to idle workers, and completes
//! clean ones itself — from the loop, never from inside the readiness check
//! that discovered them, which is what keeps update propagation iterative
//! instead of unboundedly recursive. It blocks only while waiting for a
//! worker report.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use indicatif::{ProgressBar, ProgressStyle};

use crate::builder::graph::{ActionId, Engine, FileId};
use crate::builder::killer::Killer;
use crate::builder::worker::{self, Report, Request};
use crate::core::error::BuildError;
use crate::util::fs;

const DEFAULT_JOBS: usize = 4;
const DEFAULT_MAX_JOBS: usize = 16;

/// What a finished run looked like.
#[derive(Debug, Clone, Copy)]
pub struct BuildOutcome {
    /// Actions dispatched to workers (dirty actions).
    pub updated: usize,
    /// Total actions in the graph.
    pub total: usize,
}

/// The planner.
pub struct Scheduler {
    pub engine: Engine,
    jobs: usize,
    test_timeout: Option<u64>,
    show_progress: bool,
    bail: Arc<AtomicBool>,
    killer: Arc<Killer>,
}

impl Scheduler {
    /// `jobs` is clamped to `1..=MAX-JOBS` (a `Buboptions` variable,
    /// default 16).
    pub fn new(engine: Engine, jobs: Option<usize>, test_timeout: Option<u64>) -> Scheduler {
        let max = engine
            .opts
            .option("MAX-JOBS")
            .first()
            .and_then(|s| s.parse().ok())
            .unwrap_or(DEFAULT_MAX_JOBS);
        let jobs = jobs.unwrap_or(DEFAULT_JOBS).clamp(1, max.max(1));
        Scheduler {
            engine,
            jobs,
            test_timeout,
            show_progress: false,
            bail: Arc::new(AtomicBool::new(false)),
            killer: Killer::new(),
        }
    }

    pub fn show_progress(mut self, show: bool) -> Scheduler {
        self.show_progress = show;
        self
    }

    /// The shared cancellation flag, for the signal handler.
    pub fn bail_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.bail)
    }

    /// The worker supervisor, for the signal handler.
    pub fn killer_handle(&self) -> Arc<Killer> {
        Arc::clone(&self.killer)
    }

    /// Drive the graph to quiescence.
    pub fn run(&mut self) -> Result<BuildOutcome> {
        // Merge the dependency cache into the graph, then seed the ready
        // queue.
        for aid in self.engine.action_ids().collect::<Vec<_>>() {
            self.engine.add_cached_dependencies(aid)?;
        }
        for aid in self.engine.action_ids().collect::<Vec<_>>() {
            self.engine.issue_if_ready(aid)?;
        }

        let mut outstanding: HashSet<FileId> = self
            .engine
            .file_ids()
            .filter(|&f| self.engine.file(f).action.is_some())
            .collect();

        let total = self.engine.action_count();
        let pb = if self.show_progress && total > 1 {
            let pb = ProgressBar::new(total as u64);
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                    .unwrap()
                    .progress_chars("#>-"),
            );
            Some(pb)
        } else {
            None
        };

        self.killer.spawn_ticker();
        let (report_tx, report_rx) = unbounded();
        let mut request_txs = Vec::with_capacity(self.jobs);
        for index in 0..self.jobs {
            let (req_tx, req_rx) = unbounded();
            request_txs.push(req_tx);
            let build_dir = self.engine.build_dir.clone();
            let reports = report_tx.clone();
            let killer = Arc::clone(&self.killer);
            std::thread::Builder::new()
                .name(format!("worker-{index}"))
                .spawn(move || worker::run_worker(index, build_dir, req_rx, reports, killer))
                .expect("failed to spawn worker thread");
        }
        let mut idle: BinaryHeap<Reverse<usize>> = (0..self.jobs).map(Reverse).collect();

        let mut updated = 0usize;
        loop {
            if self.bail.load(Ordering::SeqCst) {
                return self.bailed("signal", &outstanding, &report_rx, &idle);
            }

            // Dispatch while there is something ready and, for dirty
            // actions, an idle worker to run it.
            loop {
                let dirty_next = match self.engine.peek_ready() {
                    None => break,
                    Some(e) => e.dirty,
                };
                if dirty_next && idle.is_empty() {
                    break;
                }
                let entry = self.engine.pop_ready().unwrap();
                let aid = entry.action;
                if entry.dirty {
                    if let Some(culprit) = &entry.culprit {
                        tracing::debug!(
                            target: "bub::culprit",
                            "{} is dirty because of {}",
                            self.engine.action(aid).name,
                            culprit.display()
                        );
                    }
                    let worker = idle.pop().unwrap().0;
                    self.dispatch(aid, worker, &request_txs)?;
                    updated += 1;
                } else {
                    tracing::debug!(
                        target: "bub::actions",
                        "up to date: {}",
                        self.engine.action(aid).name
                    );
                    self.finish(aid, false, &mut outstanding)?;
                    if let Some(pb) = &pb {
                        pb.inc(1);
                    }
                }
            }

            if outstanding.is_empty() {
                break;
            }

            let in_flight = self.jobs - idle.len();
            if in_flight == 0 && self.engine.peek_ready().is_none() {
                anyhow::bail!(
                    "build graph stuck: {} target(s) outstanding with nothing ready",
                    outstanding.len()
                );
            }

            match report_rx.recv_timeout(Duration::from_millis(200)) {
                Ok(Report::Done { worker, action }) => {
                    tracing::debug!(
                        target: "bub::actions",
                        "updated: {}",
                        self.engine.action(action).name
                    );
                    self.finish(action, true, &mut outstanding)?;
                    idle.push(Reverse(worker));
                    if let Some(pb) = &pb {
                        pb.inc(1);
                    }
                }
                Ok(Report::Failed { worker, action, log }) => {
                    idle.push(Reverse(worker));
                    let name = self.engine.action(action).name.clone();
                    eprintln!("{name} FAILED:\n{log}");
                    return self.bailed("action failure", &outstanding, &report_rx, &idle);
                }
                Ok(Report::Fatal) => {
                    return self.bailed("worker fatal", &outstanding, &report_rx, &idle);
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    anyhow::bail!("worker channel closed unexpectedly");
                }
            }
        }

        if let Some(pb) = &pb {
            pb.finish_with_message("done");
        }
        Ok(BuildOutcome { updated, total })
    }

    fn dispatch(&mut self, aid: ActionId, worker: usize, txs: &[Sender<Request>]) -> Result<()> {
        // An aborted run must never see the old record as current.
        let primary = self.engine.primary_output(aid);
        let primary_path = self.engine.file(primary).path.clone();
        self.engine.cache.remove(&primary_path)?;

        // Tools do not create output directories.
        for &out in &self.engine.action(aid).outputs.clone() {
            let abs = self.engine.abs(&self.engine.file(out).path.clone());
            if let Some(parent) = abs.parent() {
                fs::ensure_dir(parent)?;
            }
        }
        if let Some(df) = self.engine.action(aid).deps_file.clone() {
            if let Some(parent) = self.engine.abs(&df).parent() {
                fs::ensure_dir(parent)?;
            }
        }

        let a = self.engine.action(aid);
        let outputs = a
            .outputs
            .iter()
            .map(|&f| self.engine.file(f).path.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("|");
        let request = Request {
            action: aid,
            name: a.name.clone(),
            command: a.command.clone().expect("dispatching unissued action"),
            outputs,
            is_test: a.is_test,
            timeout: a.is_test.then_some(self.test_timeout).flatten(),
        };
        tracing::debug!(target: "bub::actions", "dispatch[{worker}]: {}", request.command);
        txs[worker]
            .send(request)
            .map_err(|_| anyhow::anyhow!("worker {worker} is gone"))?;
        Ok(())
    }

    fn finish(
        &mut self,
        aid: ActionId,
        ran: bool,
        outstanding: &mut HashSet<FileId>,
    ) -> Result<()> {
        for &out in &self.engine.action(aid).outputs.clone() {
            outstanding.remove(&out);
        }
        self.engine.action_finished(aid, ran)
    }

    /// Terminate the run: escalate the killer, give in-flight workers a
    /// bounded chance to report (so partial outputs get cleaned), and
    /// surface the outstanding count.
    fn bailed(
        &self,
        initiator: &str,
        outstanding: &HashSet<FileId>,
        report_rx: &crossbeam_channel::Receiver<Report>,
        idle: &BinaryHeap<Reverse<usize>>,
    ) -> Result<BuildOutcome> {
        self.bail.store(true, Ordering::SeqCst);
        self.killer.bail(initiator);

        let mut in_flight = self.jobs - idle.len();
        let deadline = std::time::Instant::now() + Duration::from_secs(8);
        while in_flight > 0 && std::time::Instant::now() < deadline {
            match report_rx.recv_timeout(Duration::from_millis(500)) {
                Ok(Report::Done { .. }) | Ok(Report::Failed { .. }) => in_flight -= 1,
                Ok(Report::Fatal) => {}
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        Err(BuildError::Bail {
            initiator: initiator.to_string(),
            outstanding: outstanding.len(),
        }
        .into())
    }
}

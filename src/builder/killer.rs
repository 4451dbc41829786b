//! Worker-process supervision.
//!
//! The killer keeps a map from child pid to its termination state and
//! escalates on a one-second tick: a soft timeout moves a child to `term`
//! (SIGTERM); a child that has not exited ~6 seconds later is moved to
//! `kill` (SIGKILL). `bail` moves every child to `term` at once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Escalation stage of a supervised child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Nothing,
    Term,
    Kill,
}

#[derive(Debug)]
struct Victim {
    action: String,
    stage: Stage,
    /// Ticks until the next escalation; `None` while nothing is pending.
    remaining: Option<u32>,
}

/// Supervisor for spawned worker child processes.
#[derive(Debug, Default)]
pub struct Killer {
    children: Mutex<HashMap<u32, Victim>>,
}

const TERM_GRACE_TICKS: u32 = 6;

impl Killer {
    pub fn new() -> Arc<Killer> {
        Arc::new(Killer::default())
    }

    /// Start supervising a child. A soft timeout (seconds) schedules an
    /// automatic escalation to `term`.
    pub fn register(&self, pid: u32, action: &str, soft_timeout: Option<u64>) {
        let mut children = self.children.lock().unwrap();
        children.insert(
            pid,
            Victim {
                action: action.to_string(),
                stage: Stage::Nothing,
                remaining: soft_timeout.map(|s| s.max(1) as u32),
            },
        );
    }

    /// The child exited on its own.
    pub fn unregister(&self, pid: u32) {
        self.children.lock().unwrap().remove(&pid);
    }

    /// Move every untouched child to `term` synchronously.
    pub fn bail(&self, initiator: &str) {
        tracing::debug!("bail({initiator}): terminating workers");
        let mut children = self.children.lock().unwrap();
        for (&pid, victim) in children.iter_mut() {
            if victim.stage == Stage::Nothing {
                victim.stage = Stage::Term;
                victim.remaining = Some(TERM_GRACE_TICKS);
                tracing::debug!("terminating {} (pid {pid})", victim.action);
                signal_term(pid);
            }
        }
    }

    /// One supervision tick: decrement pending timers and escalate those
    /// that reach zero.
    pub fn tick(&self) {
        let mut children = self.children.lock().unwrap();
        for (&pid, victim) in children.iter_mut() {
            let Some(remaining) = victim.remaining.as_mut() else {
                continue;
            };
            if *remaining > 0 {
                *remaining -= 1;
            }
            if *remaining > 0 {
                continue;
            }
            match victim.stage {
                Stage::Nothing => {
                    victim.stage = Stage::Term;
                    victim.remaining = Some(TERM_GRACE_TICKS);
                    tracing::warn!("{} timed out; terminating pid {pid}", victim.action);
                    signal_term(pid);
                }
                Stage::Term => {
                    victim.stage = Stage::Kill;
                    victim.remaining = None;
                    tracing::warn!("{} ignored SIGTERM; killing pid {pid}", victim.action);
                    signal_kill(pid);
                }
                Stage::Kill => {}
            }
        }
    }

    /// Run the tick loop on a background thread for the life of the
    /// process.
    pub fn spawn_ticker(self: &Arc<Self>) {
        let killer = Arc::clone(self);
        std::thread::Builder::new()
            .name("killer".to_string())
            .spawn(move || loop {
                std::thread::sleep(Duration::from_secs(1));
                killer.tick();
            })
            .expect("failed to spawn killer thread");
    }
}

#[cfg(unix)]
fn signal_term(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

#[cfg(unix)]
fn signal_kill(pid: u32) {
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn signal_term(_pid: u32) {}

#[cfg(not(unix))]
fn signal_kill(_pid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::process::ShellCommand;

    #[test]
    fn test_register_unregister() {
        let killer = Killer::new();
        killer.register(1234, "compile x.c", None);
        assert_eq!(killer.children.lock().unwrap().len(), 1);
        killer.unregister(1234);
        assert!(killer.children.lock().unwrap().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn test_bail_terminates_child() {
        let tmp = tempfile::TempDir::new().unwrap();
        let capture = tmp.path().join("log");
        let mut child = ShellCommand::new("sleep 30")
            .spawn_captured(&capture)
            .unwrap();

        let killer = Killer::new();
        killer.register(child.id(), "sleep", None);
        killer.bail("test");

        let status = child.wait().unwrap();
        assert!(!status.success());
        killer.unregister(child.id());
    }

    #[cfg(unix)]
    #[test]
    fn test_soft_timeout_escalates() {
        let tmp = tempfile::TempDir::new().unwrap();
        let capture = tmp.path().join("log");
        let mut child = ShellCommand::new("sleep 30")
            .spawn_captured(&capture)
            .unwrap();

        let killer = Killer::new();
        killer.register(child.id(), "sleep", Some(1));
        killer.tick();
        killer.tick();

        let status = child.wait().unwrap();
        assert!(!status.success());
        killer.unregister(child.id());
    }
}

//! Async Progress Thread Manager.
//!
//! When enabled, one background thread per process repeatedly calls the
//! device's progress test while holding the runtime's global critical
//! section, handing the section over between iterations so application
//! threads are not starved. The thread stops when the shared `done` flag is
//! raised by [`AsyncProgress::finalize`], after one final drain round.
//!
//! # Affinity
//!
//! The affinity table has `threads_per_node * cpus_per_process` entries: the
//! processors listed in [`RuntimeConfig::progress_thread_affinity`], or by
//! default the highest-numbered processors in descending order, wrapping when
//! the node has more threads than processors. A process with affinity index
//! `i` binds its thread to entries `i * n .. (i + 1) * n`.
//!
//! The index is the node-local rank, or the world rank when cliques split the
//! nodes (then the table spans the whole job). A malformed or too short
//! affinity string fails initialization; failing to bind is only an error when
//! the string was given explicitly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Mutex, MutexGuard};

use crate::comm::Comm;
use crate::config::RuntimeConfig;
use crate::device::Device;
use crate::error::{Error, Result};
use crate::ThreadLevel;

/// Lifecycle of the progress thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressState {
    /// No thread has been started
    Uninitialized,
    /// The thread is driving progress
    Running,
    /// `done` is raised, waiting for the thread to exit
    Terminating,
    /// The thread has exited and been joined
    Joined,
}

/// Where the calling process sits among the progress threads of its node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressLayout {
    /// World rank
    pub global_rank: usize,
    /// Rank in the node-local communicator (0 if none)
    pub local_rank: usize,
    /// Size of the node-local communicator (1 if none)
    pub local_size: usize,
    /// World size
    pub world_size: usize,
}

impl ProgressLayout {
    /// Layout derived from the committed world communicator.
    pub fn from_world(world: &Comm) -> Self {
        let (local_rank, local_size) = world
            .node_comm()
            .map_or((0, 1), |node| (node.rank(), node.size()));
        ProgressLayout {
            global_rank: world.rank(),
            local_rank,
            local_size,
            world_size: world.size(),
        }
    }
}

/// Processors assigned to this process's progress thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AffinityPlan {
    /// Full table for the node (or job, with cliques)
    pub table: Vec<usize>,
    /// This process's slice of the table
    pub cpus: Vec<usize>,
    /// Whether the table came from an explicit affinity string
    pub explicit: bool,
}

/// Parse `count` processor ids from a comma/whitespace separated list.
///
/// Only the first `count` entries are read; anything after them, including a
/// trailing separator, is ignored.
pub fn parse_affinity(spec: &str, count: usize) -> Result<Vec<usize>> {
    let mut table = Vec::with_capacity(count);
    for token in spec
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .take(count)
    {
        let cpu: i64 = token.parse().map_err(|_| {
            Error::InvalidAffinity(format!("'{token}' is not a processor index"))
        })?;
        let cpu = usize::try_from(cpu)
            .map_err(|_| Error::InvalidAffinity(format!("negative processor index {cpu}")))?;
        table.push(cpu);
    }
    if table.len() < count {
        return Err(Error::InvalidAffinity(format!(
            "'{spec}' lists {} processors, {count} required",
            table.len()
        )));
    }
    Ok(table)
}

/// Default table: highest-numbered processors first, wrapping around.
pub fn default_affinity(count: usize, proc_count: usize) -> Vec<usize> {
    let proc_count = proc_count.max(1);
    (0..count).map(|i| proc_count - (i % proc_count) - 1).collect()
}

/// Compute this process's affinity from the configuration and its layout.
pub fn compute_affinity(
    config: &RuntimeConfig,
    layout: &ProgressLayout,
    proc_count: usize,
) -> Result<AffinityPlan> {
    let cliques = config.effective_cliques() > 1;
    if cliques && config.has_explicit_affinity() {
        tracing::warn!("cliques combined with an explicit progress thread affinity");
    }
    let (threads, index) = if cliques {
        (layout.world_size, layout.global_rank)
    } else {
        (layout.local_size, layout.local_rank)
    };
    let per_process = config.progress_cpus_per_process.max(1);
    let count = threads * per_process;

    let explicit = config.has_explicit_affinity();
    let table = match config.progress_thread_affinity.as_deref() {
        Some(spec) if explicit => parse_affinity(spec, count)?,
        _ => default_affinity(count, proc_count),
    };
    let start = index * per_process;
    let cpus = table
        .get(start..start + per_process)
        .ok_or_else(|| {
            Error::Config(format!(
                "affinity index {index} outside a table for {threads} threads"
            ))
        })?
        .to_vec();
    tracing::debug!(?table, ?cpus, explicit, "progress thread affinity");
    Ok(AffinityPlan {
        table,
        cpus,
        explicit,
    })
}

#[cfg(target_os = "linux")]
fn bind_current_thread(cpus: &[usize]) -> Result<()> {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let mut cpu_set = CpuSet::new();
    for &cpu in cpus {
        cpu_set
            .set(cpu)
            .map_err(|e| Error::Thread(format!("processor {cpu}: {e}")))?;
    }
    sched_setaffinity(Pid::from_raw(0), &cpu_set)
        .map_err(|e| Error::Thread(format!("binding to {cpus:?}: {e}")))
}

#[cfg(not(target_os = "linux"))]
fn bind_current_thread(cpus: &[usize]) -> Result<()> {
    Err(Error::NotSupported(format!(
        "binding to {cpus:?} on this platform"
    )))
}

fn progress_loop(device: &dyn Device, global_cs: &Mutex<()>, done: &AtomicBool) {
    let mut guard = global_cs.lock();
    let mut rounds: u64 = 0;
    while !done.load(Ordering::SeqCst) {
        if let Err(e) = device.progress_test() {
            tracing::warn!(error = %e, "progress test failed");
        }
        rounds += 1;
        MutexGuard::unlocked_fair(&mut guard, thread::yield_now);
    }
    if let Err(e) = device.progress_drain() {
        tracing::warn!(error = %e, "final progress drain failed");
    }
    drop(guard);
    tracing::debug!(rounds, "progress thread exiting");
}

/// The per-process progress thread.
#[derive(Debug)]
pub struct AsyncProgress {
    state: ProgressState,
    done: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
    plan: Option<AffinityPlan>,
}

impl Default for AsyncProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncProgress {
    /// A manager with no thread.
    pub fn new() -> Self {
        AsyncProgress {
            state: ProgressState::Uninitialized,
            done: Arc::new(AtomicBool::new(false)),
            thread: None,
            plan: None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ProgressState {
        self.state
    }

    /// Affinity used by the running (or last) thread.
    pub fn plan(&self) -> Option<&AffinityPlan> {
        self.plan.as_ref()
    }

    /// Start the progress thread if the configuration asks for it.
    ///
    /// Requires [`ThreadLevel::Multiple`]; with a lower level a warning is
    /// logged and nothing starts. Returns whether a thread was started.
    pub fn initialize(
        &mut self,
        config: &RuntimeConfig,
        thread_level: ThreadLevel,
        layout: &ProgressLayout,
        device: Arc<dyn Device>,
        global_cs: Arc<Mutex<()>>,
    ) -> Result<bool> {
        if !config.async_progress {
            return Ok(false);
        }
        if thread_level != ThreadLevel::Multiple {
            tracing::warn!(
                ?thread_level,
                "async progress requires ThreadLevel::Multiple, not starting"
            );
            return Ok(false);
        }
        if self.state == ProgressState::Running {
            return Err(Error::Thread("progress thread already running".into()));
        }

        let proc_count = thread::available_parallelism().map_or(1, |n| n.get());
        let plan = compute_affinity(config, layout, proc_count)?;

        self.done.store(false, Ordering::SeqCst);
        let done = Arc::clone(&self.done);
        let cpus = plan.cpus.clone();
        let (tx, rx) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("ferrocomm-progress".into())
            .spawn(move || {
                let _ = tx.send(bind_current_thread(&cpus));
                progress_loop(device.as_ref(), &global_cs, &done);
            })
            .map_err(|e| Error::Thread(format!("spawning progress thread: {e}")))?;
        self.thread = Some(handle);
        self.state = ProgressState::Running;

        match rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) if plan.explicit => {
                self.finalize()?;
                return Err(e);
            }
            Ok(Err(e)) => {
                tracing::debug!(error = %e, "progress thread left unbound");
            }
            Err(_) => {
                self.finalize()?;
                return Err(Error::Thread("progress thread exited during startup".into()));
            }
        }

        tracing::debug!(cpus = ?plan.cpus, "progress thread started");
        self.plan = Some(plan);
        Ok(true)
    }

    /// Stop and join the progress thread. A no-op unless it is running.
    pub fn finalize(&mut self) -> Result<()> {
        let Some(handle) = self.thread.take() else {
            return Ok(());
        };
        self.state = ProgressState::Terminating;
        self.done.store(true, Ordering::SeqCst);
        let joined = handle.join();
        self.state = ProgressState::Joined;
        joined.map_err(|_| Error::Thread("progress thread panicked".into()))?;
        tracing::debug!("progress thread joined");
        Ok(())
    }
}

impl Drop for AsyncProgress {
    fn drop(&mut self) {
        if let Err(e) = self.finalize() {
            tracing::error!(error = %e, "failed to stop progress thread");
        }
    }
}

//! The preforking supervisor: forks N workers over the shared listening
//! socket, reaps and restarts them with backoff, and handles TERM/INT
//! (drain) and HUP (rolling restart) signals.

use std::io::Read;
use std::os::unix::io::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Error};
use nix::sys::signal::{kill, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use signal_hook::consts::{SIGCHLD, SIGHUP, SIGINT, SIGTERM};

use crate::managed::ManagedServer;
use crate::managed::poll_readable;

/// Restart backoff for crashing workers: exponential between these
/// bounds, reset once a worker survives past `RAPID_EXIT`.
const BACKOFF_FLOOR: Duration = Duration::from_millis(50);
const BACKOFF_CEILING: Duration = Duration::from_secs(5);
const RAPID_EXIT: Duration = Duration::from_secs(1);
/// Give up after this many consecutive rapid crashes at full backoff so
/// an external init can take over.
const CRASH_LOOP_LIMIT: u32 = 10;

/// How long a rolling restart waits for a new worker's readiness byte.
const READY_DEADLINE: Duration = Duration::from_secs(30);

type WorkerFn = Arc<dyn Fn(&mut ManagedServer) -> Result<(), Error> + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WorkerState {
    Starting,
    Serving,
    Draining,
    Dead,
}

struct WorkerRecord {
    pid: Pid,
    generation: u64,
    started_at: Instant,
    state: WorkerState,
    ready_pipe: Option<OwnedFd>,
}

impl WorkerRecord {
    fn is_alive(&self) -> bool {
        self.state != WorkerState::Dead
    }

    /// Wait for the readiness byte the worker writes after entering its
    /// accept loop.
    fn wait_ready(&mut self, deadline: Duration) -> Result<(), Error> {
        if self.state != WorkerState::Starting {
            return Ok(());
        }
        let pipe = self
            .ready_pipe
            .take()
            .ok_or_else(|| anyhow::format_err!("worker {} has no readiness pipe", self.pid))?;
        if !poll_readable(pipe.as_fd(), deadline)? {
            bail!("worker {} did not become ready in time", self.pid);
        }
        let mut buf = [0u8; 1];
        let n = nix::unistd::read(pipe.as_raw_fd(), &mut buf)
            .context("failed to read readiness byte")?;
        if n == 0 {
            bail!("worker {} exited before becoming ready", self.pid);
        }
        self.state = WorkerState::Serving;
        Ok(())
    }
}

/// Forks and babysits a pool of worker processes, each running
/// `worker_fn` against the shared listening socket.
pub struct PreForkingSupervisor {
    server: ManagedServer,
    worker_fn: WorkerFn,
    workers: Vec<WorkerRecord>,
    generation: u64,
    backoff: Duration,
    rapid_exits: u32,
}

impl PreForkingSupervisor {
    pub fn new(
        server: ManagedServer,
        worker_fn: impl Fn(&mut ManagedServer) -> Result<(), Error> + Send + Sync + 'static,
    ) -> PreForkingSupervisor {
        PreForkingSupervisor {
            server,
            worker_fn: Arc::new(worker_fn),
            workers: Vec::new(),
            generation: 0,
            backoff: BACKOFF_FLOOR,
            rapid_exits: 0,
        }
    }

    pub fn server(&self) -> &ManagedServer {
        &self.server
    }

    pub fn server_mut(&mut self) -> &mut ManagedServer {
        &mut self.server
    }

    fn pool_size(&self) -> usize {
        self.server.config().num_workers.max(1)
    }

    /// Bind, activate, fork the initial pool and babysit it until a
    /// shutdown signal arrives. Does not return in worker processes.
    pub fn run(&mut self) -> Result<(), Error> {
        self.server.server_bind()?;
        self.server.server_activate()?;
        self.supervise()
    }

    /// Like [`run`](Self::run) for a server that is already bound and
    /// activated.
    pub fn supervise(&mut self) -> Result<(), Error> {
        let signals = SignalPipe::new()?;

        for _ in 0..self.pool_size() {
            let record = self.spawn_worker()?;
            self.workers.push(record);
        }
        log::info!(
            "supervisor {} started {} workers on {}",
            std::process::id(),
            self.pool_size(),
            self.server.canonical_address()
        );

        loop {
            signals.wait(Duration::from_secs(1))?;

            self.reap();

            if signals.shutdown_requested() {
                log::info!("got shutdown request, draining workers");
                self.shutdown()?;
                return Ok(());
            }

            if signals.reload_requested() {
                log::info!("got reload request (SIGHUP), rolling restart");
                if let Err(err) = self.rolling_restart() {
                    log::error!("rolling restart failed: {err:#}");
                }
            }

            self.replace_dead_workers()?;
        }
    }

    fn spawn_worker(&mut self) -> Result<WorkerRecord, Error> {
        let (ready_r, ready_w) = nix::unistd::pipe().context("failed to create ready pipe")?;
        match unsafe { fork() }.context("fork failed")? {
            ForkResult::Child => {
                drop(ready_r);
                // the fork copied the supervisor's signal handlers and
                // self-pipe; a worker starts from default dispositions
                // and installs only its own quit handler
                reset_inherited_signals();
                // release the other workers' readiness pipes we inherited
                self.workers.clear();
                let status = match self.run_worker(ready_w) {
                    Ok(()) => 0,
                    Err(err) => {
                        log::error!("worker failed: {err:#}");
                        1
                    }
                };
                // never unwind back into the supervisor's stack
                unsafe { libc::_exit(status) }
            }
            ForkResult::Parent { child } => {
                drop(ready_w);
                log::info!("forked worker {child} (generation {})", self.generation);
                Ok(WorkerRecord {
                    pid: child,
                    generation: self.generation,
                    started_at: Instant::now(),
                    state: WorkerState::Starting,
                    ready_pipe: Some(ready_r),
                })
            }
        }
    }

    fn run_worker(&mut self, ready_pipe: OwnedFd) -> Result<(), Error> {
        self.server.enter_worker(ready_pipe)?;
        let worker_fn = Arc::clone(&self.worker_fn);
        worker_fn(&mut self.server)
    }

    /// Collect every exited child without blocking.
    fn reap(&mut self) {
        loop {
            match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => break,
                Ok(WaitStatus::Exited(pid, status)) => self.mark_dead(pid, status == 0),
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    log::warn!("worker {pid} killed by {signal:?}");
                    self.mark_dead(pid, false);
                }
                Ok(_) => continue,
                Err(nix::errno::Errno::ECHILD) => break,
                Err(err) => {
                    log::error!("waitpid failed: {err}");
                    break;
                }
            }
        }
    }

    fn mark_dead(&mut self, pid: Pid, clean: bool) {
        if let Some(record) = self.workers.iter_mut().find(|w| w.pid == pid) {
            let expected = record.state == WorkerState::Draining;
            record.state = WorkerState::Dead;
            if expected || clean {
                log::info!("worker {pid} exited");
                self.rapid_exits = 0;
                self.backoff = BACKOFF_FLOOR;
            } else if record.started_at.elapsed() < RAPID_EXIT {
                self.rapid_exits += 1;
                self.backoff = (self.backoff * 2).min(BACKOFF_CEILING);
                log::warn!(
                    "worker {pid} crashed after {:?}, backoff {:?}",
                    record.started_at.elapsed(),
                    self.backoff
                );
            } else {
                self.rapid_exits = 0;
                self.backoff = BACKOFF_FLOOR;
                log::warn!("worker {pid} exited unexpectedly");
            }
        }
    }

    fn replace_dead_workers(&mut self) -> Result<(), Error> {
        let alive = self.workers.iter().filter(|w| w.is_alive()).count();
        if alive >= self.pool_size() {
            self.workers.retain(|w| w.is_alive());
            return Ok(());
        }
        if self.rapid_exits >= CRASH_LOOP_LIMIT {
            bail!(
                "workers crashed {} times in a row, giving up",
                self.rapid_exits
            );
        }
        if self.backoff > BACKOFF_FLOOR {
            std::thread::sleep(self.backoff);
        }
        self.workers.retain(|w| w.is_alive());
        while self.workers.len() < self.pool_size() {
            let record = self.spawn_worker()?;
            self.workers.push(record);
        }
        Ok(())
    }

    /// Replace the fleet one worker at a time: spawn a new-generation
    /// worker, wait until it accepts, then retire one old worker. The
    /// pool never shrinks below N-1 nor grows beyond N+1.
    fn rolling_restart(&mut self) -> Result<(), Error> {
        self.generation += 1;
        let old_pids: Vec<Pid> = self
            .workers
            .iter()
            .filter(|w| w.is_alive() && w.generation < self.generation)
            .map(|w| w.pid)
            .collect();

        for old_pid in old_pids {
            let mut fresh = self.spawn_worker()?;
            if let Err(err) = fresh.wait_ready(READY_DEADLINE) {
                let _ = kill(fresh.pid, Signal::SIGKILL);
                let _ = waitpid(fresh.pid, None);
                return Err(err.context("new worker never became ready"));
            }
            self.workers.push(fresh);

            self.retire_worker(old_pid)?;
            self.workers.retain(|w| w.is_alive());
        }
        log::info!("rolling restart complete (generation {})", self.generation);
        Ok(())
    }

    /// TERM one worker and wait for it within the drain deadline,
    /// escalating to SIGKILL.
    fn retire_worker(&mut self, pid: Pid) -> Result<(), Error> {
        if let Some(record) = self.workers.iter_mut().find(|w| w.pid == pid) {
            record.state = WorkerState::Draining;
        }
        let _ = kill(pid, Signal::SIGTERM);

        let deadline = Instant::now() + self.server.config().drain_deadline;
        loop {
            match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => {
                    if Instant::now() >= deadline {
                        log::warn!("worker {pid} ignored SIGTERM, sending SIGKILL");
                        let _ = kill(pid, Signal::SIGKILL);
                        let _ = waitpid(pid, None);
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(20));
                }
                Ok(_) => break,
                Err(nix::errno::Errno::ECHILD) => break,
                Err(err) => return Err(Error::new(err).context("waitpid failed")),
            }
        }
        if let Some(record) = self.workers.iter_mut().find(|w| w.pid == pid) {
            record.state = WorkerState::Dead;
        }
        Ok(())
    }

    /// Propagate TERM to the fleet and wait for it to drain, then
    /// SIGKILL the stragglers.
    fn shutdown(&mut self) -> Result<(), Error> {
        for worker in self.workers.iter_mut().filter(|w| w.is_alive()) {
            worker.state = WorkerState::Draining;
            let _ = kill(worker.pid, Signal::SIGTERM);
        }

        let deadline = Instant::now() + self.server.config().drain_deadline;
        while Instant::now() < deadline {
            self.reap();
            if self.workers.iter().all(|w| !w.is_alive()) {
                log::info!("all workers drained");
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(20));
        }

        for worker in self.workers.iter().filter(|w| w.is_alive()) {
            log::warn!("worker {} ignored SIGTERM, sending SIGKILL", worker.pid);
            let _ = kill(worker.pid, Signal::SIGKILL);
            let _ = waitpid(worker.pid, None);
        }
        self.workers.clear();
        Ok(())
    }
}

/// Restore the default disposition of every signal the supervisor
/// hooks. Runs in a freshly forked worker: without this, a TERM aimed
/// directly at the worker would fire the inherited handlers and write
/// into the self-pipe shared with the supervisor.
fn reset_inherited_signals() {
    let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    for signal in [Signal::SIGCHLD, Signal::SIGTERM, Signal::SIGINT, Signal::SIGHUP] {
        if let Err(err) = unsafe { sigaction(signal, &default) } {
            log::warn!("failed to reset {signal:?} disposition: {err}");
        }
    }
}

/// Self-pipe signal plumbing: TERM/INT/HUP set flags, and every signal
/// (including CHLD) wakes the supervisor loop through the pipe.
struct SignalPipe {
    read_end: UnixStream,
    shutdown: Arc<std::sync::atomic::AtomicBool>,
    reload: Arc<std::sync::atomic::AtomicBool>,
}

impl SignalPipe {
    fn new() -> Result<SignalPipe, Error> {
        use std::sync::atomic::AtomicBool;

        let (read_end, write_end) = UnixStream::pair().context("failed to create signal pipe")?;
        read_end
            .set_nonblocking(true)
            .context("failed to set signal pipe non-blocking")?;
        write_end
            .set_nonblocking(true)
            .context("failed to set signal pipe non-blocking")?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let reload = Arc::new(AtomicBool::new(false));

        for signal in [SIGCHLD, SIGTERM, SIGINT, SIGHUP] {
            signal_hook::low_level::pipe::register(signal, write_end.try_clone()?)
                .context("failed to register signal pipe")?;
        }
        signal_hook::flag::register(SIGTERM, Arc::clone(&shutdown))?;
        signal_hook::flag::register(SIGINT, Arc::clone(&shutdown))?;
        signal_hook::flag::register(SIGHUP, Arc::clone(&reload))?;

        Ok(SignalPipe {
            read_end,
            shutdown,
            reload,
        })
    }

    /// Sleep until a signal arrives or the timeout elapses, then drain
    /// the pipe.
    fn wait(&self, timeout: Duration) -> Result<(), Error> {
        if poll_readable(self.read_end.as_fd(), timeout)? {
            let mut buf = [0u8; 64];
            let mut reader = &self.read_end;
            while matches!(reader.read(&mut buf), Ok(n) if n > 0) {}
        }
        Ok(())
    }

    fn shutdown_requested(&self) -> bool {
        self.shutdown.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Reads and clears the reload flag.
    fn reload_requested(&self) -> bool {
        self.reload.swap(false, std::sync::atomic::Ordering::AcqRel)
    }
}

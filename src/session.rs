//! Session lifecycle: the attach handshake, command dispatch, the receive
//! loop, and detach.

use std::io::Write;
use std::thread;
use std::time::{Duration, Instant};

use nix::unistd::Pid;
use tracing::{debug, error, warn};

use crate::error::{Error, Result};
use crate::event::Event;
use crate::queue::{self, QueuePair};
use crate::render::{DisplayOptions, Disposition, Trace};
use crate::selector::{self, Selector};
use crate::wire::{self, Value};

/// Default budget for command acknowledgement.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

const EVAL_TIMEOUT: Duration = Duration::from_secs(15);
const FORK_TIMEOUT: Duration = Duration::from_secs(30);

/// Polling cadence while waiting on the target.
const POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Ceiling on non-blocking drains per loop iteration.
const DRAIN_BATCH: usize = 50;
/// Back-off while the target is inside a collection.
const GC_PAUSE: Duration = Duration::from_millis(10);

/// An attached controller session against one target process.
#[derive(Debug)]
pub struct Session {
    pid: Pid,
    queues: QueuePair,
    trace: Trace,
    timeout: Duration,
}

impl Session {
    /// Attach to `pid` and perform the ownership handshake.
    ///
    /// Fails when the queue pair cannot be found, when the target is owned
    /// by another controller, or when no acknowledgement arrives within
    /// `timeout`.
    pub fn attach(
        pid: i32,
        opts: DisplayOptions,
        timeout: Duration,
        out: Box<dyn Write + Send>,
    ) -> Result<Self> {
        let pid = Pid::from_raw(pid);
        let queues = QueuePair::open(pid)?;

        let controller = std::process::id() as u64;
        let trace = Trace::new(pid.as_raw(), controller, opts, out);

        let mut session = Self {
            pid,
            queues,
            trace,
            timeout,
        };

        session.send_cmd("attach", vec![Value::Int(controller as i64)])?;
        if !session.wait("attach", timeout, |trace| trace.attached())? {
            return Err(Error::AttachTimeout { pid });
        }

        Ok(session)
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn attached(&self) -> bool {
        self.trace.attached()
    }

    /// Ask the target to report calls slower than `threshold_ms`, measured
    /// in wall time, or in cpu time when `cpu_time` is set.
    pub fn watch(&mut self, threshold_ms: u64, cpu_time: bool) -> Result<()> {
        let op = if cpu_time { "watchcpu" } else { "watch" };
        self.send_cmd(op, vec![Value::Int(threshold_ms as i64)])
    }

    /// Report every call and return.
    pub fn firehose(&mut self) -> Result<()> {
        self.send_cmd("firehose", vec![])
    }

    /// Tolerate class and method redefinition in the target.
    pub fn devmode(&mut self) -> Result<()> {
        self.send_cmd("devmode", vec![])
    }

    /// Report garbage-collection brackets.
    pub fn gc(&mut self) -> Result<()> {
        self.send_cmd("gc", vec![])
    }

    /// Install a tracer for `selector`; `slow_only` restricts it to the
    /// slow watch. Parenthesized argument expressions become `addexpr`
    /// follow-ups on the same tracer.
    pub fn add_tracer(&mut self, selector: &str, slow_only: bool) -> Result<()> {
        let selector = Selector::parse(selector)?;

        self.send_cmd(
            "add",
            vec![Value::Str(selector.query), Value::Bool(slow_only)],
        )?;
        for expr in selector.expressions {
            self.send_cmd("addexpr", vec![Value::Str(expr)])?;
        }
        Ok(())
    }

    /// Evaluate `code` in the target; returns its rendering, or `None` when
    /// the target does not answer within budget.
    pub fn eval(&mut self, code: &str) -> Result<Option<String>> {
        selector::validate_expression(code)?;

        self.trace.evaled = None;
        self.send_cmd("eval", vec![Value::Str(code.to_string())])?;

        if self.wait("eval", EVAL_TIMEOUT, |trace| trace.evaled.is_some())? {
            Ok(self.trace.evaled.take())
        } else {
            warn!("eval did not complete within {EVAL_TIMEOUT:?}");
            eprintln!("*** timed out waiting for eval");
            Ok(None)
        }
    }

    /// Ask the target to fork a paused sibling; returns the child pid, or
    /// `None` when the target does not answer within budget.
    pub fn fork(&mut self) -> Result<Option<u64>> {
        self.trace.forked = None;
        self.send_cmd("fork", vec![])?;

        if self.wait("fork", FORK_TIMEOUT, |trace| trace.forked.is_some())? {
            Ok(self.trace.forked.take())
        } else {
            warn!("fork did not complete within {FORK_TIMEOUT:?}");
            eprintln!("*** timed out waiting for fork");
            Ok(None)
        }
    }

    /// Poll until `ready` holds or `timeout` elapses, draining pending
    /// events and re-ringing the doorbell at every tick.
    ///
    /// A user interrupt does not abort the wait: a progress line is printed
    /// and the wait resumes, so an impatient Ctrl-C cannot corrupt a
    /// handshake in flight.
    pub fn wait(
        &mut self,
        reason: &str,
        timeout: Duration,
        ready: impl Fn(&Trace) -> bool,
    ) -> Result<bool> {
        let deadline = Instant::now() + timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());

            match self.drain() {
                Ok(_) => {}
                // Ctrl-C landed mid-drain; report progress and keep waiting.
                Err(Error::Interrupted) => {
                    queue::clear_interrupt();
                    eprintln!("*** waiting for {reason} ({}s left)", remaining.as_secs());
                }
                Err(err) => return Err(err),
            }

            if ready(&self.trace) {
                return Ok(true);
            }

            if remaining.is_zero() {
                debug!(reason, "wait timed out");
                return Ok(false);
            }

            thread::sleep(POLL_INTERVAL.min(remaining));
            if queue::interrupted() {
                queue::clear_interrupt();
                eprintln!("*** waiting for {reason} ({}s left)", remaining.as_secs());
            }
            self.queues.signal()?;
        }
    }

    /// Stream events until the target goes away or the user interrupts.
    ///
    /// Two-phase receive: block for the next event, then drain any backlog
    /// without blocking, so a burst cannot fill the in-kernel queue. Exits
    /// silently when the queue is removed out from under us.
    pub fn run(&mut self) -> Result<()> {
        loop {
            match self.run_once() {
                Ok(()) => {}
                Err(Error::QueueRemoved) => {
                    debug!("queue removed, target exited");
                    self.trace.attached = false;
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn run_once(&mut self) -> Result<()> {
        if let Some(buf) = self.queues.recv(true)? {
            self.dispatch(&buf)?;
        }
        self.drain()?;
        // Keep the target flushing its side while we stream.
        self.queues.signal()
    }

    /// Release the target. Idempotent across target exit, and re-attempted
    /// across user interrupts so the target is not left bound.
    pub fn detach(&mut self) -> Result<()> {
        loop {
            match self.try_detach() {
                Ok(()) => return Ok(()),
                Err(Error::Interrupted) => {
                    queue::clear_interrupt();
                    continue;
                }
                Err(Error::QueueRemoved) => {
                    eprintln!("*** process {} is gone", self.pid);
                    self.trace.attached = false;
                    return Ok(());
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn try_detach(&mut self) -> Result<()> {
        if !self.trace.attached() {
            return Ok(());
        }

        self.send_cmd("detach", vec![])?;
        if !self.wait("detach", self.timeout, |trace| !trace.attached())? {
            warn!("target did not acknowledge detach");
            eprintln!("*** timed out waiting for detach");
        }
        Ok(())
    }

    fn send_cmd(&mut self, op: &str, args: Vec<Value>) -> Result<()> {
        let buf = wire::encode_message(op, args)?;
        debug!(op, len = buf.len(), "sending command");
        self.queues.send(&buf)?;
        // The queue has no notification primitive; the signal is the
        // doorbell.
        self.queues.signal()
    }

    /// Drain up to a batch of pending events without blocking.
    fn drain(&mut self) -> Result<usize> {
        let mut drained = 0;
        while drained < DRAIN_BATCH {
            match self.queues.recv(false)? {
                Some(buf) => {
                    self.dispatch(&buf)?;
                    drained += 1;
                }
                None => break,
            }
        }
        self.trace.flush()?;
        Ok(drained)
    }

    fn dispatch(&mut self, buf: &[u8]) -> Result<()> {
        let value = wire::decode(buf)?;
        let event = Event::parse(value)?;

        match self.trace.process(event.clone()) {
            Ok(Disposition::Continue) => Ok(()),
            Ok(Disposition::Throttle) => {
                // The target is collecting; give it room before the next
                // doorbell.
                thread::sleep(GC_PAUSE);
                self.queues.signal()
            }
            Err(err) => {
                error!(?event, %err, "failed to process event");
                eprintln!("*** error processing {event:?}: {err}");
                Err(err)
            }
        }
    }
}

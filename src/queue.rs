//! SysV message-queue transport between the controller and the target.
//!
//! The target's tracing agent creates two queues keyed on its pid: `+pid`
//! carries events to the controller, `-pid` carries commands to the target.
//! The queues have no notification primitive, so every command is followed by
//! a `SIGURG` doorbell. On some hosts `msgrcv` is not restartable, and any
//! delivered signal wakes it with `EINTR`; both queue operations loop across
//! these spurious wakeups.

use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::Pid;
use tracing::{debug, trace};

use crate::error::{Error, Result};

/// Kernel-enforced message body size, agreed with the target agent at build
/// time. There is no negotiation in the protocol.
#[cfg(target_os = "linux")]
pub const BUF_SIZE: usize = 256;
#[cfg(not(target_os = "linux"))]
pub const BUF_SIZE: usize = 120;

/// Signal that wakes the target's agent so it drains its command queue.
pub const WAKEUP_SIGNAL: Signal = Signal::SIGURG;

const OPEN_ATTEMPTS: usize = 5;
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(150);

/// Application messages always carry this type tag.
const MSG_TYPE: libc::c_long = 1;

#[repr(C)]
struct MsgBuf {
    mtype: libc::c_long,
    mtext: [u8; BUF_SIZE],
}

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn note_interrupt(_signo: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Install a `SIGINT` handler that sets a flag instead of killing the
/// process.
///
/// The handler is installed without `SA_RESTART`, so a blocking `msgrcv`
/// returns `EINTR` and gets a chance to observe the flag.
pub fn install_interrupt_handler() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(note_interrupt),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe { signal::sigaction(Signal::SIGINT, &action) }
        .map_err(|source| Error::Queue { op: "sigaction", source })?;
    Ok(())
}

/// The user has interrupted since the flag was last cleared.
pub fn interrupted() -> bool {
    INTERRUPTED.load(Ordering::SeqCst)
}

pub fn clear_interrupt() {
    INTERRUPTED.store(false, Ordering::SeqCst);
}

/// The controller's handles on a target's queue pair.
///
/// The target owns queue lifecycle; the controller only attaches and
/// detaches. Once the target exits and removes the queues, every operation
/// here reports [`Error::QueueRemoved`].
#[derive(Debug)]
pub struct QueuePair {
    pid: Pid,
    /// Events from the target.
    qin: libc::c_int,
    /// Commands to the target.
    qout: libc::c_int,
}

impl QueuePair {
    /// Attach to the queue pair of `pid`.
    ///
    /// The agent may not have created the queues yet, so each attempt rings
    /// the doorbell first and the handle request is retried a few times.
    pub fn open(pid: Pid) -> Result<Self> {
        if pid.as_raw() <= 0 {
            return Err(Error::InvalidPid { pid: pid.as_raw() });
        }

        // Existence and permission check, per kill(2) with a null signal.
        match signal::kill(pid, None) {
            Ok(()) => {}
            Err(Errno::ESRCH) => return Err(Error::InvalidPid { pid: pid.as_raw() }),
            Err(Errno::EPERM) => return Err(Error::PermissionDenied { pid }),
            Err(source) => return Err(Error::Queue { op: "kill", source }),
        }

        for attempt in 0..OPEN_ATTEMPTS {
            if attempt > 0 {
                thread::sleep(OPEN_RETRY_DELAY);
            }

            signal_wakeup(pid)?;

            let qin = unsafe { libc::msgget(pid.as_raw() as libc::key_t, 0o666) };
            let qout = unsafe { libc::msgget(-pid.as_raw() as libc::key_t, 0o666) };

            if qin >= 0 && qout >= 0 {
                debug!(%pid, qin, qout, "opened queue pair");
                return Ok(Self { pid, qin, qout });
            }

            trace!(%pid, attempt, "queue pair not present yet");
        }

        Err(Error::AgentNotListening { pid })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Ring the target's doorbell.
    pub fn signal(&self) -> Result<()> {
        signal_wakeup(self.pid)
    }

    /// Send one command payload to the target.
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        debug_assert!(payload.len() <= BUF_SIZE);

        let mut msg = MsgBuf { mtype: MSG_TYPE, mtext: [0; BUF_SIZE] };
        msg.mtext[..payload.len()].copy_from_slice(payload);

        loop {
            let res = unsafe {
                libc::msgsnd(
                    self.qout,
                    &msg as *const MsgBuf as *const libc::c_void,
                    BUF_SIZE,
                    0,
                )
            };

            if res == 0 {
                return Ok(());
            }

            match Errno::last() {
                Errno::EINTR if !interrupted() => continue,
                Errno::EINTR => return Err(Error::Interrupted),
                Errno::EIDRM | Errno::EINVAL => return Err(Error::QueueRemoved),
                source => return Err(Error::Queue { op: "msgsnd", source }),
            }
        }
    }

    /// Receive one event payload from the target.
    ///
    /// Returns `None` when non-blocking and the queue is empty.
    pub fn recv(&self, blocking: bool) -> Result<Option<[u8; BUF_SIZE]>> {
        let flags = if blocking { 0 } else { libc::IPC_NOWAIT };
        let mut msg = MsgBuf { mtype: 0, mtext: [0; BUF_SIZE] };

        loop {
            let res = unsafe {
                libc::msgrcv(
                    self.qin,
                    &mut msg as *mut MsgBuf as *mut libc::c_void,
                    BUF_SIZE,
                    0,
                    flags,
                )
            };

            if res >= 0 {
                return Ok(Some(msg.mtext));
            }

            match Errno::last() {
                Errno::ENOMSG | Errno::EAGAIN if !blocking => return Ok(None),
                Errno::EINTR if !interrupted() => continue,
                Errno::EINTR => return Err(Error::Interrupted),
                Errno::EIDRM | Errno::EINVAL => return Err(Error::QueueRemoved),
                source => return Err(Error::Queue { op: "msgrcv", source }),
            }
        }
    }
}

fn signal_wakeup(pid: Pid) -> Result<()> {
    match signal::kill(pid, WAKEUP_SIGNAL) {
        Ok(()) => Ok(()),
        // The target went away mid-session; let the caller wind down.
        Err(Errno::ESRCH) => Err(Error::QueueRemoved),
        Err(Errno::EPERM) => Err(Error::PermissionDenied { pid }),
        Err(source) => Err(Error::Queue { op: "kill", source }),
    }
}

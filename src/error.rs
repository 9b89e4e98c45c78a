use std::io;

use nix::errno::Errno;
use nix::unistd::Pid;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid pid: {pid}")]
    InvalidPid { pid: i32 },

    #[error("pid {pid} cannot be signaled, run as the process owner or as root")]
    PermissionDenied { pid: Pid },

    #[error("pid {pid} is not listening for commands, is the tracing agent loaded?")]
    AgentNotListening { pid: Pid },

    #[error("process {pid} is already being traced ({owner} != {us})")]
    AlreadyTraced { pid: Pid, owner: u64, us: u64 },

    #[error("timed out waiting for pid {pid} to acknowledge attach")]
    AttachTimeout { pid: Pid },

    #[error("command {op:?} does not fit in a message ({len} > {max} bytes)")]
    CommandTooLarge { op: String, len: usize, max: usize },

    #[error("expression {expr:?} is not valid: {reason}")]
    InvalidExpression { expr: String, reason: &'static str },

    #[error("malformed message: {reason}")]
    Malformed { reason: String },

    #[error("interrupted")]
    Interrupted,

    #[error("message queue removed by the target")]
    QueueRemoved,

    #[error("queue operation {op} failed")]
    Queue { op: &'static str, source: Errno },

    #[error("input/output error")]
    InputOutput(#[from] io::Error),
}

impl Error {
    /// True for attach-phase failures the caller cannot recover from.
    pub fn is_attach_failure(&self) -> bool {
        matches!(
            self,
            Error::InvalidPid { .. }
                | Error::PermissionDenied { .. }
                | Error::AgentNotListening { .. }
                | Error::AlreadyTraced { .. }
                | Error::AttachTimeout { .. }
        )
    }
}

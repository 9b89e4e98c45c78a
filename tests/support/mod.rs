#![allow(dead_code)]

//! Test support: an in-process stand-in for the target's tracing agent.
//!
//! The fake agent owns a real SysV queue pair keyed on the test process pid,
//! serves the command queue from a background thread, and lets tests inject
//! events exactly as the real agent would. `SIGURG` doorbells from the
//! controller land on this same process, where they are ignored by default.

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use qtrace::queue::BUF_SIZE;
use qtrace::wire::{self, Value};

/// Queue keys are derived from the test process pid, so tests inside one
/// binary must not overlap.
pub fn lock() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[repr(C)]
struct Msg {
    mtype: libc::c_long,
    mtext: [u8; BUF_SIZE],
}

#[derive(Clone, Copy)]
pub struct FakeAgent {
    pid: i32,
    /// Events to the controller.
    qin: libc::c_int,
    /// Commands from the controller.
    qout: libc::c_int,
    /// Pid to acknowledge attach with; `None` echoes the requester.
    attach_reply: Option<i64>,
    /// Artificial delay before each reply, to hold controller waits open.
    reply_delay: Option<Duration>,
}

impl FakeAgent {
    /// Create (or re-open) the queue pair the agent side owns and drain any
    /// messages a previous test left behind.
    pub fn new() -> anyhow::Result<Self> {
        let pid = std::process::id() as i32;

        let qin = unsafe { libc::msgget(pid as libc::key_t, libc::IPC_CREAT | 0o666) };
        anyhow::ensure!(qin >= 0, "msgget(+pid): {}", last_os_error());

        let qout = unsafe { libc::msgget(-pid as libc::key_t, libc::IPC_CREAT | 0o666) };
        anyhow::ensure!(qout >= 0, "msgget(-pid): {}", last_os_error());

        let agent = Self {
            pid,
            qin,
            qout,
            attach_reply: None,
            reply_delay: None,
        };

        while try_recv(agent.qin)?.is_some() {}
        while try_recv(agent.qout)?.is_some() {}

        Ok(agent)
    }

    /// Acknowledge attach requests with `pid` instead of echoing the
    /// requester, as a target already owned by another controller would.
    pub fn with_attach_reply(mut self, pid: i64) -> Self {
        self.attach_reply = Some(pid);
        self
    }

    /// Delay every reply, keeping the controller polling in its wait loop.
    pub fn with_reply_delay(mut self, delay: Duration) -> Self {
        self.reply_delay = Some(delay);
        self
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Serve the command queue on a background thread, recording every
    /// command and acknowledging the handshake ops.
    pub fn serve(self) -> ServingAgent {
        let commands = Arc::new(Mutex::new(Vec::new()));
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let commands = Arc::clone(&commands);
            let stop = Arc::clone(&stop);
            thread::spawn(move || self.serve_loop(&commands, &stop))
        };

        ServingAgent {
            agent: self,
            commands,
            stop,
            handle: Some(handle),
        }
    }

    fn serve_loop(self, commands: &Mutex<Vec<Value>>, stop: &AtomicBool) {
        while !stop.load(Ordering::SeqCst) {
            let Ok(received) = try_recv(self.qout) else {
                return;
            };
            let Some(command) = received else {
                thread::sleep(Duration::from_millis(2));
                continue;
            };

            commands.lock().unwrap().push(command.clone());

            let Value::Array(items) = command else {
                continue;
            };
            match items.as_slice() {
                [Value::Str(op), Value::Int(requester)] if op == "attach" => {
                    self.pause();
                    let reply = self.attach_reply.unwrap_or(*requester);
                    self.emit(vec![Value::Str("attached".into()), Value::Int(reply)])
                        .unwrap();
                }
                [Value::Str(op)] if op == "detach" => {
                    self.pause();
                    self.emit(vec![
                        Value::Str("detached".into()),
                        Value::Int(self.pid as i64),
                    ])
                    .unwrap();
                }
                [Value::Str(op), Value::Str(_code)] if op == "eval" => {
                    self.pause();
                    self.emit(vec![Value::Str("evaled".into()), Value::Str("42".into())])
                        .unwrap();
                }
                [Value::Str(op)] if op == "fork" => {
                    self.pause();
                    self.emit(vec![Value::Str("forked".into()), Value::Int(31337)])
                        .unwrap();
                }
                _ => {}
            }
        }
    }

    fn pause(&self) {
        if let Some(delay) = self.reply_delay {
            thread::sleep(delay);
        }
    }

    /// Send one event to the controller, as the target agent would.
    pub fn emit(&self, items: Vec<Value>) -> anyhow::Result<()> {
        let mut payload = Vec::new();
        wire::encode(&Value::Array(items), &mut payload);
        anyhow::ensure!(payload.len() <= BUF_SIZE, "event too large for a message");

        let mut msg = Msg {
            mtype: 1,
            mtext: [0; BUF_SIZE],
        };
        msg.mtext[..payload.len()].copy_from_slice(&payload);

        let res = unsafe {
            libc::msgsnd(
                self.qin,
                &msg as *const Msg as *const libc::c_void,
                BUF_SIZE,
                0,
            )
        };
        anyhow::ensure!(res == 0, "msgsnd: {}", last_os_error());
        Ok(())
    }
}

/// A fake agent with its responder thread running.
pub struct ServingAgent {
    agent: FakeAgent,
    commands: Arc<Mutex<Vec<Value>>>,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ServingAgent {
    pub fn pid(&self) -> i32 {
        self.agent.pid
    }

    /// Send one event to the controller.
    pub fn emit(&self, items: Vec<Value>) -> anyhow::Result<()> {
        self.agent.emit(items)
    }

    /// Stop the responder thread and return every command it saw.
    pub fn stop(&mut self) -> Vec<Value> {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        self.commands.lock().unwrap().clone()
    }

    /// Stop the responder and remove both queues, as an exiting target does.
    pub fn remove_queues(&mut self) {
        self.stop();
        unsafe {
            libc::msgctl(self.agent.qin, libc::IPC_RMID, std::ptr::null_mut());
            libc::msgctl(self.agent.qout, libc::IPC_RMID, std::ptr::null_mut());
        }
    }
}

impl Drop for ServingAgent {
    fn drop(&mut self) {
        self.remove_queues();
    }
}

fn try_recv(queue: libc::c_int) -> anyhow::Result<Option<Value>> {
    let mut msg = Msg {
        mtype: 0,
        mtext: [0; BUF_SIZE],
    };

    let res = unsafe {
        libc::msgrcv(
            queue,
            &mut msg as *mut Msg as *mut libc::c_void,
            BUF_SIZE,
            0,
            libc::IPC_NOWAIT,
        )
    };

    if res < 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENOMSG) {
            return Ok(None);
        }
        anyhow::bail!("msgrcv: {err}");
    }

    Ok(Some(wire::decode(&msg.mtext)?))
}

fn last_os_error() -> std::io::Error {
    std::io::Error::last_os_error()
}

/// First element of a command tuple.
pub fn tag(command: &Value) -> &str {
    match command {
        Value::Array(items) => match items.first() {
            Some(Value::Str(op)) => op,
            _ => panic!("command has no tag: {command:?}"),
        },
        _ => panic!("command is not a tuple: {command:?}"),
    }
}

/// Cloneable sink capturing everything the renderer writes.
#[derive(Clone, Default)]
pub struct CaptureSink(Arc<Mutex<Vec<u8>>>);

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl Write for CaptureSink {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

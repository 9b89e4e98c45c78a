//! Event interpretation and call-tree rendering.
//!
//! The target emits a stream of small events; this module folds them into a
//! human-readable hierarchical trace. All state lives in a single [`Trace`]
//! value owned by the session loop: the interned symbol tables, one record
//! per installed tracer, and the render cursor (nesting depth, the still-open
//! output line, any pending GC bracket).

use std::collections::HashMap;
use std::io::Write;

use chrono::{Local, LocalResult, TimeZone};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::event::Event;

/// Display switches for the renderer.
#[derive(Clone, Debug)]
pub struct DisplayOptions {
    /// Prefix every line with a wall-clock timestamp.
    pub show_time: bool,
    /// Append ` <seconds>` to completed calls.
    pub show_duration: bool,
    /// Indentation unit, repeated once per nesting level.
    pub prefix: String,
}

impl Default for DisplayOptions {
    fn default() -> Self {
        Self {
            show_time: false,
            show_duration: true,
            prefix: "  ".to_string(),
        }
    }
}

/// What the session loop should do after an event was interpreted.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Disposition {
    Continue,
    /// The target is mid-collection; back off briefly, then re-ring the
    /// doorbell.
    Throttle,
}

/// One installed tracer inside the target.
#[derive(Debug, Default)]
struct Tracer {
    /// The selector this tracer was installed for.
    query: String,
    /// In-flight calls: (start µs, qualified name).
    call_stack: Vec<(u64, String)>,
    /// expr id → source text, for argument display.
    expressions: HashMap<i64, String>,
    /// Argument values buffered until this tracer's next call renders.
    pending_args: String,
    /// A `(` has been written without its `)`.
    arglist_open: bool,
    /// `name:depth` of the most recently printed call; used to collapse a
    /// leaf call/return pair onto one line.
    last_printed: Option<String>,
}

/// The controller-side view of one tracing session.
pub struct Trace {
    out: Box<dyn Write + Send>,
    opts: DisplayOptions,
    /// Pid of the traced process, for diagnostics.
    target: i32,
    /// Our own pid, checked against `attached` replies.
    controller: u64,

    methods: HashMap<i64, String>,
    classes: HashMap<i64, String>,
    tracers: HashMap<i64, Tracer>,

    /// Call depth at the render cursor, across all tracers.
    nesting: u64,
    /// Deepest nesting this session has reached; flat traces skip group
    /// separators.
    max_nesting_seen: u64,
    last_nesting: u64,
    /// The current output line is terminated.
    printed_newline: bool,
    /// The previous line was left blank.
    blank_line: bool,
    /// Tracer whose call line is still open.
    open_line: Option<i64>,
    /// Start of an unclosed GC bracket.
    gc_started_at: Option<u64>,

    pub(crate) attached: bool,
    /// Last `evaled` reply, taken by the session.
    pub(crate) evaled: Option<String>,
    /// Last `forked` reply.
    pub(crate) forked: Option<u64>,
}

impl std::fmt::Debug for Trace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trace")
            .field("opts", &self.opts)
            .field("target", &self.target)
            .field("controller", &self.controller)
            .field("methods", &self.methods)
            .field("classes", &self.classes)
            .field("tracers", &self.tracers)
            .field("nesting", &self.nesting)
            .field("max_nesting_seen", &self.max_nesting_seen)
            .field("last_nesting", &self.last_nesting)
            .field("printed_newline", &self.printed_newline)
            .field("blank_line", &self.blank_line)
            .field("open_line", &self.open_line)
            .field("gc_started_at", &self.gc_started_at)
            .field("attached", &self.attached)
            .field("evaled", &self.evaled)
            .field("forked", &self.forked)
            .finish()
    }
}

impl Trace {
    pub fn new(target: i32, controller: u64, opts: DisplayOptions, out: Box<dyn Write + Send>) -> Self {
        Self {
            out,
            opts,
            target,
            controller,
            methods: HashMap::new(),
            classes: HashMap::new(),
            tracers: HashMap::new(),
            nesting: 0,
            max_nesting_seen: 0,
            last_nesting: 0,
            printed_newline: true,
            blank_line: false,
            open_line: None,
            gc_started_at: None,
            attached: false,
            evaled: None,
            forked: None,
        }
    }

    pub fn attached(&self) -> bool {
        self.attached
    }

    pub fn flush(&mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }

    /// Interpret one event, mutating trace state and the output sink.
    ///
    /// Recoverable oddities (a return with no matching call, an unknown
    /// event tag) are absorbed; anything else is an error, and the caller
    /// should treat the stream as unusable.
    pub fn process(&mut self, event: Event) -> Result<Disposition> {
        match event {
            Event::Attached { pid } => {
                if pid != self.controller {
                    return Err(Error::AlreadyTraced {
                        pid: Pid::from_raw(self.target),
                        owner: pid,
                        us: self.controller,
                    });
                }
                if !self.attached {
                    self.attached = true;
                    eprintln!("*** attached to process {}", self.target);
                }
            }
            Event::Detached { .. } => {
                self.attached = false;
                eprintln!("*** detached from process {}", self.target);
            }
            Event::Method { id, name } => {
                self.methods.insert(id, name);
            }
            Event::Class { id, name } => {
                self.classes.insert(id, name);
            }
            Event::TracerAdded { tracer, query } => {
                if tracer == -1 {
                    eprintln!("*** unable to install tracer for {query}");
                } else {
                    let record = self.tracers.entry(tracer).or_default();
                    record.query = query;
                    debug!(tracer, query = %record.query, "tracer installed");
                }
            }
            Event::NewExpr { tracer, expr, source } => {
                self.tracers
                    .entry(tracer)
                    .or_default()
                    .expressions
                    .insert(expr, source);
            }
            Event::ExprVal { tracer, expr, value } => self.expr_val(tracer, expr, value)?,
            Event::Call { time, tracer, mid, singleton, klass } => {
                self.call(time, tracer, mid, singleton, klass)?
            }
            Event::Return { time, tracer } => self.ret(time, tracer)?,
            Event::Slow { time, elapsed, depth, mid, singleton, klass } => {
                self.slow(time, elapsed, depth, mid, singleton, klass)?
            }
            Event::GcStart { time } => self.begin_gc(time)?,
            Event::GcEnd { time } => self.end_gc(time)?,
            Event::Gc { time } => self.gc_mark(time)?,
            Event::DuringGc => return Ok(Disposition::Throttle),
            Event::Evaled { result } => {
                self.evaled = Some(result);
            }
            Event::Forked { pid } => {
                self.forked = Some(pid);
            }
            Event::Unknown { name, args } => {
                warn!(event = %name, ?args, "unknown event");
                eprintln!("*** unknown event {name}");
            }
        }

        Ok(Disposition::Continue)
    }

    /// `Klass#method` for instance methods, `Klass.method` for singletons.
    fn qualified_name(&self, mid: i64, singleton: bool, klass: i64) -> String {
        let Some(method) = self.methods.get(&mid) else {
            return "(unknown)".to_string();
        };
        match self.classes.get(&klass) {
            Some(class) if singleton => format!("{class}.{method}"),
            Some(class) => format!("{class}#{method}"),
            None => method.clone(),
        }
    }

    fn call(&mut self, time: u64, tracer_id: i64, mid: i64, singleton: bool, klass: i64) -> Result<()> {
        let name = self.qualified_name(mid, singleton, klass);

        self.break_line()?;
        self.line_start(time, self.nesting)?;
        write!(self.out, "{name}")?;

        let pending = {
            let tracer = self.tracers.entry(tracer_id).or_default();
            tracer.call_stack.push((time, name.clone()));
            tracer.last_printed = Some(format!("{name}:{}", self.nesting));
            std::mem::take(&mut tracer.pending_args)
        };
        if !pending.is_empty() {
            write!(self.out, "{pending}")?;
            if let Some(tracer) = self.tracers.get_mut(&tracer_id) {
                tracer.arglist_open = true;
            }
        }

        self.printed_newline = false;
        self.open_line = Some(tracer_id);
        self.nesting += 1;
        self.max_nesting_seen = self.max_nesting_seen.max(self.nesting);
        self.last_nesting = self.nesting;
        Ok(())
    }

    fn ret(&mut self, time: u64, tracer_id: i64) -> Result<()> {
        let frame = self
            .tracers
            .get_mut(&tracer_id)
            .and_then(|t| t.call_stack.pop());
        let Some((start, name)) = frame else {
            // We attached mid-call; nothing of ours to unwind.
            return Ok(());
        };

        if self.nesting > 0 {
            self.nesting -= 1;
        }

        self.close_arglist()?;

        let elapsed = time.saturating_sub(start);
        let label = format!("{name}:{}", self.nesting);
        let collapse = !self.printed_newline
            && self
                .tracers
                .get(&tracer_id)
                .and_then(|t| t.last_printed.as_deref())
                == Some(label.as_str());

        if collapse {
            // Leaf pair: finish the call's own line.
            if self.opts.show_duration {
                write!(self.out, " <{}>", format_duration(elapsed))?;
            }
            writeln!(self.out)?;
        } else {
            if !self.printed_newline {
                writeln!(self.out)?;
            }
            self.line_start(time, self.nesting)?;
            write!(self.out, "{name}")?;
            if self.opts.show_duration {
                write!(self.out, " <{}>", format_duration(elapsed))?;
            }
            writeln!(self.out)?;
        }

        self.printed_newline = true;
        self.open_line = None;
        self.last_nesting = self.nesting;

        if self.nesting == 0 && self.max_nesting_seen > 1 {
            self.group_break()?;
        }
        Ok(())
    }

    fn expr_val(&mut self, tracer_id: i64, expr: i64, value: String) -> Result<()> {
        // Values arriving while this tracer's call line is open continue it;
        // anything else waits for the tracer's next call to render.
        let inline = self.open_line == Some(tracer_id) && !self.printed_newline;

        let tracer = self.tracers.entry(tracer_id).or_default();
        let text = match tracer.expressions.get(&expr) {
            Some(source) => format!("{source}={value}"),
            None => value,
        };

        if inline {
            let lead = if tracer.arglist_open { ", " } else { "(" };
            tracer.arglist_open = true;
            write!(self.out, "{lead}{text}")?;
        } else {
            if tracer.pending_args.is_empty() {
                tracer.pending_args.push('(');
            } else {
                tracer.pending_args.push_str(", ");
            }
            tracer.pending_args.push_str(&text);
        }
        Ok(())
    }

    fn slow(&mut self, time: u64, elapsed: u64, depth: u64, mid: i64, singleton: bool, klass: i64) -> Result<()> {
        let name = self.qualified_name(mid, singleton, klass);

        self.break_line()?;
        self.line_start(time, depth)?;
        writeln!(self.out, "{name} <{}>", format_duration(elapsed))?;
        self.printed_newline = true;

        self.max_nesting_seen = self.max_nesting_seen.max(depth);
        self.last_nesting = depth;

        if depth == 0 && self.max_nesting_seen > 1 {
            self.group_break()?;
        }
        Ok(())
    }

    fn begin_gc(&mut self, time: u64) -> Result<()> {
        // A second gc_start without a gc_end replaces the open bracket.
        self.gc_started_at = Some(time);

        self.break_line()?;
        self.line_start(time, self.last_nesting)?;
        write!(self.out, "garbage_collect")?;
        self.printed_newline = false;
        self.open_line = None;
        Ok(())
    }

    fn end_gc(&mut self, time: u64) -> Result<()> {
        let Some(start) = self.gc_started_at.take() else {
            return Ok(());
        };
        let duration = format_duration(time.saturating_sub(start));

        if !self.printed_newline && self.open_line.is_none() {
            writeln!(self.out, " <{duration}>")?;
        } else {
            // The bracket line was broken by interleaved output; reprint it.
            self.break_line()?;
            self.line_start(time, self.last_nesting)?;
            writeln!(self.out, "garbage_collect <{duration}>")?;
        }
        self.printed_newline = true;
        Ok(())
    }

    fn gc_mark(&mut self, time: u64) -> Result<()> {
        if self.gc_started_at.is_some() {
            // Mark tick inside an open bracket.
            return Ok(());
        }

        self.break_line()?;
        self.line_start(time, self.last_nesting)?;
        writeln!(self.out, "garbage_collect")?;
        self.printed_newline = true;
        Ok(())
    }

    /// Close the open line, first balancing any unterminated arglist.
    fn break_line(&mut self) -> Result<()> {
        self.close_arglist()?;
        if !self.printed_newline {
            writeln!(self.out)?;
            self.printed_newline = true;
        }
        self.open_line = None;
        Ok(())
    }

    fn close_arglist(&mut self) -> Result<()> {
        if let Some(owner) = self.open_line {
            let was_open = self
                .tracers
                .get_mut(&owner)
                .map(|t| std::mem::replace(&mut t.arglist_open, false))
                .unwrap_or(false);
            if was_open {
                write!(self.out, ")")?;
            }
        }
        Ok(())
    }

    fn line_start(&mut self, time: u64, depth: u64) -> Result<()> {
        if self.opts.show_time {
            write!(self.out, "{} ", format_time(time))?;
        }
        let indent = self.opts.prefix.repeat(depth as usize);
        write!(self.out, "{indent}")?;
        self.blank_line = false;
        Ok(())
    }

    /// Blank line between completed depth-0 call groups; never doubled.
    fn group_break(&mut self) -> Result<()> {
        if !self.blank_line {
            writeln!(self.out)?;
            self.blank_line = true;
        }
        Ok(())
    }
}

fn format_duration(us: u64) -> String {
    format!("{:.6}", us as f64 / 1_000_000.0)
}

fn format_time(us: u64) -> String {
    let secs = (us / 1_000_000) as i64;
    let nanos = (us % 1_000_000) as u32 * 1_000;
    match Local.timestamp_opt(secs, nanos) {
        LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => {
            dt.format("%H:%M:%S%.6f").to_string()
        }
        LocalResult::None => format!("{}.{:06}", secs, us % 1_000_000),
    }
}

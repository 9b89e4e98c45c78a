use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use qtrace::{queue, DisplayOptions, Error, Session};

/// Attach to an instrumented process and stream its method calls.
#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Opt {
    /// pid of the target process
    #[arg(short, long)]
    pid: i32,

    /// method selector to trace, e.g. "Class#method(arg)" (repeatable)
    #[arg(short, long = "method", value_name = "SELECTOR")]
    methods: Vec<String>,

    /// trace every method call and return
    #[arg(short, long)]
    firehose: bool,

    /// report methods taking longer than this many milliseconds
    #[arg(long, value_name = "MS")]
    slow: Option<u64>,

    /// measure the slow threshold in cpu time instead of wall time
    #[arg(long, requires = "slow")]
    slow_cpu: bool,

    /// restrict the slow watch to these selectors (repeatable)
    #[arg(long = "slow-method", value_name = "SELECTOR", requires = "slow")]
    slow_methods: Vec<String>,

    /// report garbage-collection runs
    #[arg(long)]
    gc: bool,

    /// evaluate an expression in the target and print the result
    #[arg(short, long, value_name = "CODE")]
    eval: Option<String>,

    /// ask the target to fork a paused copy of itself
    #[arg(long)]
    fork: bool,

    /// tolerate class and method redefinition in the target
    #[arg(long)]
    devmode: bool,

    /// write the trace to a file instead of stdout
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// append to the output file instead of truncating it
    #[arg(short, long, requires = "output")]
    append: bool,

    /// prefix each line with a wall-clock timestamp
    #[arg(short, long)]
    timestamp: bool,

    /// do not append call durations
    #[arg(long)]
    no_duration: bool,

    /// indentation width per nesting level
    #[arg(long, value_name = "N", default_value_t = 2)]
    prefix_spaces: usize,

    /// seconds to wait for the target to acknowledge commands
    #[arg(long, value_name = "SECS", default_value_t = 5)]
    timeout: u64,
}

fn main() {
    let opt = Opt::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    if let Err(err) = queue::install_interrupt_handler() {
        eprintln!("*** {err}");
        process::exit(-1);
    }

    match run(&opt) {
        Ok(()) => {}
        Err(Error::Interrupted) => process::exit(1),
        Err(err) if err.is_attach_failure() => {
            eprintln!("*** {err}");
            process::exit(-1);
        }
        Err(err) => {
            eprintln!("*** {err}");
            process::exit(1);
        }
    }
}

fn run(opt: &Opt) -> Result<(), Error> {
    let out = open_sink(opt)?;
    let display = DisplayOptions {
        show_time: opt.timestamp,
        show_duration: !opt.no_duration,
        prefix: " ".repeat(opt.prefix_spaces),
    };

    let mut session = Session::attach(
        opt.pid,
        display,
        Duration::from_secs(opt.timeout),
        out,
    )?;

    if opt.devmode {
        session.devmode()?;
    }
    if opt.fork {
        if let Some(child) = session.fork()? {
            eprintln!("*** forked off a new process {child}");
        }
    }
    if let Some(threshold_ms) = opt.slow {
        session.watch(threshold_ms, opt.slow_cpu)?;
        for selector in &opt.slow_methods {
            session.add_tracer(selector, true)?;
        }
    }
    if opt.firehose {
        session.firehose()?;
    }
    if opt.gc {
        session.gc()?;
    }
    for selector in &opt.methods {
        session.add_tracer(selector, false)?;
    }
    if let Some(code) = &opt.eval {
        if let Some(result) = session.eval(code)? {
            println!("{result}");
        }
    }

    let streaming =
        opt.firehose || opt.gc || opt.slow.is_some() || !opt.methods.is_empty();

    let outcome = if streaming { session.run() } else { Ok(()) };

    match outcome {
        Ok(()) => session.detach(),
        Err(Error::Interrupted) => {
            queue::clear_interrupt();
            session.detach()?;
            Err(Error::Interrupted)
        }
        Err(err) => {
            // Best effort not to leave the target bound on a hard failure.
            let _ = session.detach();
            Err(err)
        }
    }
}

fn open_sink(opt: &Opt) -> Result<Box<dyn Write + Send>, Error> {
    match &opt.output {
        None => Ok(Box::new(io::stdout())),
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .append(opt.append)
                .truncate(!opt.append)
                .open(path)?;
            Ok(Box::new(file))
        }
    }
}

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use clap::Parser;
use crossbeam_channel::RecvTimeoutError;

use dnswatch::cli::Cli;
use dnswatch::error::DnsWatchError;
use dnswatch::output;
use dnswatch::pipeline;

/// How long the sink keeps draining results after termination is requested.
const SINK_GRACE: Duration = Duration::from_secs(10);

/// Global shutdown flag, set by signal handlers.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

extern "C" fn signal_handler(_sig: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() {
    unsafe {
        libc::signal(libc::SIGTERM, signal_handler as libc::sighandler_t);
        libc::signal(libc::SIGINT, signal_handler as libc::sighandler_t);
    }
}

fn exit_code(err: &DnsWatchError) -> i32 {
    match err {
        DnsWatchError::Config(_) => 2,
        DnsWatchError::Capture(_) | DnsWatchError::Filter(_) => 3,
        _ => 4,
    }
}

fn main() {
    env_logger::init();
    let config = Cli::parse().into_config();
    match run(config) {
        Ok(()) => {}
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(exit_code(&e));
        }
    }
}

fn run(config: dnswatch::CaptureConfig) -> Result<(), DnsWatchError> {
    install_signal_handlers();

    let (mut handle, results) = pipeline::start(config)?;

    let stdout = io::stdout();
    let mut sink = io::BufWriter::new(stdout.lock());
    let mut terminating_since: Option<Instant> = None;

    loop {
        if SHUTDOWN_REQUESTED.load(Ordering::Relaxed) && terminating_since.is_none() {
            log::info!("interrupt received, shutting down");
            handle.shutdown(true);
            terminating_since = Some(Instant::now());
        }
        if let Some(since) = terminating_since {
            if since.elapsed() > SINK_GRACE {
                log::warn!("sink grace period elapsed, abandoning remaining results");
                break;
            }
        }

        match results.recv_timeout(Duration::from_millis(250)) {
            Ok(result) => output::write_result(&result, &mut sink)?,
            Err(RecvTimeoutError::Timeout) => {
                sink.flush().map_err(DnsWatchError::Serialization)?;
            }
            // Every result sender is gone: the pipeline has fully drained.
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    sink.flush().map_err(DnsWatchError::Serialization)?;
    let counters = handle.counters();
    handle.join();
    log::info!("pipeline finished: {:?}", counters);
    Ok(())
}

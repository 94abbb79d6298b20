//! Process lifecycle: signal handling and the port run loop.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use ptp_core::{PtpClock, RunTimeOpts};
use tracing::info;

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_signal(_: libc::c_int) {
    RUNNING.store(false, Ordering::SeqCst);
}

/// Run the ordinary clock until SIGINT/SIGTERM, then release sockets and
/// restore the time source. Initialization failures propagate out and exit
/// non-zero.
pub fn run(opts: RunTimeOpts) -> Result<()> {
    RUNNING.store(true, Ordering::SeqCst);
    unsafe {
        libc::signal(libc::SIGINT, handle_signal as *const () as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handle_signal as *const () as libc::sighandler_t);
    }

    info!(
        "starting on subdomain {} ({:?} time source)",
        opts.subdomain_name, opts.time
    );

    let mut clock = PtpClock::new(opts);
    let result = clock.run(&RUNNING);
    clock.shutdown();
    result
}

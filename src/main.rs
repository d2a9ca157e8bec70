use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use zmesh::config::Config;
use zmesh::router::{Router, DUMP_TABLES, SHUTDOWN};

extern "C" fn on_shutdown(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

extern "C" fn on_dump(_sig: libc::c_int) {
    DUMP_TABLES.store(true, Ordering::Relaxed);
}

/// Redirect stdout and stderr into an append-only logfile.
fn redirect_output(path: &str) -> Result<(), String> {
    let file = std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .mode(0o664)
        .open(path)
        .map_err(|e| format!("unable to open logfile '{path}': {e}"))?;
    // SAFETY: duplicating an owned fd onto stdout/stderr.
    unsafe {
        if libc::dup2(file.as_raw_fd(), 1) < 0 || libc::dup2(file.as_raw_fd(), 2) < 0 {
            return Err(format!(
                "dup2() failed: {}",
                std::io::Error::last_os_error()
            ));
        }
        libc::signal(libc::SIGHUP, libc::SIG_IGN);
    }
    Ok(())
}

fn main() -> ExitCode {
    let mut confpath = PathBuf::from("/etc/z.conf");

    for arg in std::env::args().skip(1) {
        if arg.is_empty() {
            continue;
        }
        if arg == "-h" || arg == "--help" {
            println!("USAGE: z [--help] [L<logfile>] [C<conffile>]");
            return ExitCode::SUCCESS;
        }
        if let Some(logfile) = arg.strip_prefix('L') {
            if let Err(e) = redirect_output(logfile) {
                eprintln!("STARTUP ERROR: {e}");
                return ExitCode::FAILURE;
            }
        } else if let Some(path) = arg.strip_prefix('C') {
            confpath = PathBuf::from(path);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cfg = match Config::load(&confpath) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    let mut router = match Router::init(cfg) {
        Ok(r) => r,
        Err(e) => {
            error!("{e}");
            return ExitCode::FAILURE;
        }
    };

    // SAFETY: installing signal handlers that only touch atomics.
    unsafe {
        libc::signal(libc::SIGHUP, libc::SIG_IGN);
        libc::signal(libc::SIGUSR1, on_dump as extern "C" fn(libc::c_int) as libc::sighandler_t);
        libc::signal(
            libc::SIGINT,
            on_shutdown as extern "C" fn(libc::c_int) as libc::sighandler_t,
        );
        libc::signal(
            libc::SIGTERM,
            on_shutdown as extern "C" fn(libc::c_int) as libc::sighandler_t,
        );
    }

    let code = match router.run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(_) => ExitCode::FAILURE,
    };
    router.shutdown();
    info!("QUIT");
    code
}

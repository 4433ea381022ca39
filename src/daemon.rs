//! Classic double-fork daemonization for running under an rc system.

use std::fs::OpenOptions;
use std::os::unix::io::AsRawFd;

/// Detach from the controlling terminal and write `pid_file`.
///
/// Must be called before any threads (including the tokio runtime) are
/// started, since only the calling thread survives a fork.
pub fn daemonize(pid_file: &str) -> anyhow::Result<()> {
    log::info!("Starting in daemon mode...");

    fork_and_exit_parent()?;

    if unsafe { libc::setsid() } == -1 {
        anyhow::bail!("failed to create new session: {}", std::io::Error::last_os_error());
    }

    // The session leader exiting would otherwise hang us up
    unsafe {
        libc::signal(libc::SIGHUP, libc::SIG_IGN);
    }

    // Second fork so we can never reacquire a controlling terminal
    fork_and_exit_parent()?;

    if let Err(e) = std::env::set_current_dir("/") {
        log::warn!("Failed to change working directory to /: {e}");
    }

    unsafe {
        libc::umask(0o022);
    }

    match OpenOptions::new().read(true).write(true).open("/dev/null") {
        Ok(dev_null) => {
            let null_fd = dev_null.as_raw_fd();
            unsafe {
                libc::dup2(null_fd, 0);
                libc::dup2(null_fd, 1);
                libc::dup2(null_fd, 2);
            }
        }
        Err(e) => log::warn!("Failed to open /dev/null, keeping standard descriptors: {e}"),
    }

    let pid = std::process::id();
    if let Err(e) = std::fs::write(pid_file, pid.to_string()) {
        log::warn!("Failed to write PID file: {e}");
    } else {
        log::info!("PID file written: {pid_file} ({pid})");
    }

    let pid_file = pid_file.to_string();
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal, cleaning up...");
        if let Err(e) = std::fs::remove_file(&pid_file) {
            log::warn!("Failed to remove PID file: {e}");
        }
        std::process::exit(0);
    })?;

    log::info!("Daemon mode initialization complete");
    Ok(())
}

fn fork_and_exit_parent() -> anyhow::Result<()> {
    match unsafe { libc::fork() } {
        -1 => anyhow::bail!("failed to fork: {}", std::io::Error::last_os_error()),
        0 => Ok(()),
        _ => std::process::exit(0),
    }
}

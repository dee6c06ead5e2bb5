//! Cooperative shutdown.
//!
//! The connection loop spends its idle time parked in `accept`, so clearing
//! the running flag alone is not observed until the next client arrives.
//! [`Shutdown::trigger`] clears the flag and then opens, and immediately
//! drops, a connection to the server's own listening address so the parked
//! accept returns and the loop sees the flag.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

/// Handle for stopping a running server
#[derive(Debug, Clone)]
pub struct Shutdown {
    running: Arc<AtomicBool>,
    wake_addr: SocketAddr,
}

impl Shutdown {
    /// `listen_addr` is the listener's bound address; unspecified addresses
    /// are reached through loopback.
    pub fn new(running: Arc<AtomicBool>, listen_addr: SocketAddr) -> Self {
        Shutdown {
            running,
            wake_addr: wake_address(listen_addr),
        }
    }

    /// Stop the server.
    ///
    /// Returns `true` for the call that cleared the flag. Later calls find it
    /// already cleared and do nothing, so the wake-up connection is made once.
    pub async fn trigger(&self) -> bool {
        if !self.running.swap(false, Ordering::SeqCst) {
            debug!("Shutdown already in progress");
            return false;
        }

        info!(addr = %self.wake_addr, "Shutdown requested, waking connection loop");
        match TcpStream::connect(self.wake_addr).await {
            Ok(stream) => drop(stream),
            Err(e) => warn!(addr = %self.wake_addr, error = %e, "Wake-up connection failed"),
        }
        true
    }
}

fn wake_address(addr: SocketAddr) -> SocketAddr {
    if !addr.ip().is_unspecified() {
        return addr;
    }
    let ip: IpAddr = match addr {
        SocketAddr::V4(_) => Ipv4Addr::LOCALHOST.into(),
        SocketAddr::V6(_) => Ipv6Addr::LOCALHOST.into(),
    };
    SocketAddr::new(ip, addr.port())
}

/// The process signals that stop the server.
#[cfg(unix)]
pub struct StopSignals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl StopSignals {
    /// Register the SIGINT and SIGTERM handlers.
    ///
    /// Signals delivered after this returns are queued even if nothing is
    /// waiting on [`StopSignals::recv`] yet. Must be called from within a
    /// tokio runtime.
    pub fn install() -> io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(StopSignals {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Wait for the next signal and return its name
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
        }
    }

    /// Trigger `shutdown` on every signal received, forever
    pub async fn relay(mut self, shutdown: Shutdown) {
        loop {
            let name = self.recv().await;
            info!(signal = name, "Signal received");
            shutdown.trigger().await;
        }
    }
}

/// Trigger `shutdown` on every SIGINT or SIGTERM.
///
/// Runs until the runtime is dropped; only fails if the signal handlers
/// cannot be installed.
#[cfg(unix)]
pub async fn watch_signals(shutdown: Shutdown) -> io::Result<()> {
    StopSignals::install()?.relay(shutdown).await;
    Ok(())
}

/// Trigger `shutdown` on every Ctrl-C.
#[cfg(not(unix))]
pub async fn watch_signals(shutdown: Shutdown) -> io::Result<()> {
    loop {
        tokio::signal::ctrl_c().await?;
        info!(signal = "ctrl-c", "Signal received");
        shutdown.trigger().await;
    }
}

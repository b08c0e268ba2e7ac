mod stream;
mod tcp;

use std::future::Future;
use std::io;

pub use tcp::TcpTransport;

/// The network side of the device. The supervisor only ever starts and stops
/// it; framing and per-connection handling live behind this trait.
pub trait Transport: Send + Sync {
    /// Brings the listener up. An error here is retried by the supervisor.
    fn start(&self) -> impl Future<Output = io::Result<()>> + Send;

    /// Stops accepting and closes open connections. Safe to call when the
    /// transport never started.
    fn stop(&self) -> impl Future<Output = ()> + Send;
}

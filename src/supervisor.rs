//! Startup, background loops and shutdown for the simulated device.
//!
//! ```text
//! Idle ─► Starting ─(retry)─► Running ─► Draining ─► Stopped
//!             └───── attempts exhausted / cancelled ──────┘
//! ```

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use tokio::task::JoinSet;
use tokio_retry::strategy::FixedInterval;
use tokio_retry::Retry;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::SupervisorError;
use crate::slave::Dispatcher;
use crate::tasks::{run_counter_loop, run_health_loop};
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Idle,
    Starting,
    Running,
    Draining,
    Stopped,
}

/// How often to try bringing the transport up. There is no wait before the
/// first attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    /// Delays between attempts; `max_attempts - 1` of them, at least one
    /// attempt is always made.
    pub fn strategy(&self) -> impl Iterator<Item = Duration> {
        let retries = self.max_attempts.saturating_sub(1) as usize;
        FixedInterval::new(self.delay).take(retries)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SupervisorConfig {
    pub retry: RetryPolicy,
    pub counter_interval: Duration,
    pub health_interval: Duration,
    pub shutdown_timeout: Duration,
}

pub struct Supervisor<T> {
    transport: T,
    dispatcher: Dispatcher,
    config: SupervisorConfig,
    cancel: CancellationToken,
    loops: JoinSet<()>,
    state: Lifecycle,
}

impl<T: Transport> Supervisor<T> {
    pub fn new(
        transport: T,
        dispatcher: Dispatcher,
        config: SupervisorConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            dispatcher,
            config,
            cancel,
            loops: JoinSet::new(),
            state: Lifecycle::Idle,
        }
    }

    pub fn state(&self) -> Lifecycle {
        self.state
    }

    #[cfg(test)]
    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn transition(&mut self, next: Lifecycle) {
        debug!(from = ?self.state, to = ?next, "Lifecycle transition");
        self.state = next;
    }

    /// Brings the transport up, retrying per the policy, then spawns the
    /// counter and health loops. Cancellation while waiting aborts at once.
    pub async fn start(&mut self) -> Result<(), SupervisorError> {
        self.transition(Lifecycle::Starting);

        let policy = self.config.retry;
        let attempts = AtomicU32::new(0);
        let transport = &self.transport;
        let action = || {
            let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
            async move {
                if attempt > 1 {
                    warn!(attempt, max = policy.max_attempts, "Retrying server start");
                }
                info!(attempt, "Starting server");
                transport.start().await.inspect_err(|err| {
                    error!(error = %err, attempt, "Server start failed");
                })
            }
        };

        let started = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SupervisorError::Cancelled),
            res = Retry::start(policy.strategy(), action) => {
                res.map_err(|source| SupervisorError::StartFailed {
                    attempts: attempts.load(Ordering::Relaxed),
                    source,
                })
            }
        };

        if let Err(err) = started {
            self.transition(Lifecycle::Stopped);
            return Err(err);
        }

        self.loops.spawn(run_counter_loop(
            self.dispatcher.store().clone(),
            self.config.counter_interval,
            self.cancel.clone(),
        ));
        self.loops.spawn(run_health_loop(
            self.dispatcher.clone(),
            self.config.health_interval,
            self.cancel.clone(),
        ));

        self.transition(Lifecycle::Running);
        info!("Server started successfully");
        Ok(())
    }

    /// Parks until the shared cancellation token fires.
    pub async fn wait(&self) {
        self.cancel.cancelled().await;
    }

    /// Cancels everything, stops the transport and waits for the loops, all
    /// within the shutdown deadline. On timeout the loops are left to finish
    /// on their own.
    pub async fn shutdown(&mut self) -> Result<(), SupervisorError> {
        if matches!(self.state, Lifecycle::Idle | Lifecycle::Stopped) {
            self.transition(Lifecycle::Stopped);
            return Ok(());
        }

        self.transition(Lifecycle::Draining);
        info!("Stopping server");
        self.cancel.cancel();

        let transport = &self.transport;
        let loops = &mut self.loops;
        let drained = tokio::time::timeout(self.config.shutdown_timeout, async {
            transport.stop().await;
            while let Some(res) = loops.join_next().await {
                if let Err(err) = res {
                    error!(error = %err, "Background task failed");
                }
            }
        })
        .await;

        self.transition(Lifecycle::Stopped);
        match drained {
            Ok(()) => {
                info!("All background tasks stopped");
                Ok(())
            }
            Err(_) => {
                self.loops.detach_all();
                warn!(
                    timeout = ?self.config.shutdown_timeout,
                    "Shutdown timeout, some tasks may still be running"
                );
                Err(SupervisorError::ShutdownTimeout(self.config.shutdown_timeout))
            }
        }
    }

    /// Start, wait for cancellation, shut down.
    pub async fn run(mut self) -> Result<(), SupervisorError> {
        self.start().await?;
        self.wait().await;
        self.shutdown().await
    }
}

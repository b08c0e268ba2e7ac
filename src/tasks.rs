use std::sync::Arc;
use std::time::Duration;

use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::slave::{Dispatcher, RegisterStore};

pub const HEALTH_INTERVAL: Duration = Duration::from_secs(30);

fn ticker(period: Duration) -> time::Interval {
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Bumps the live counter once per `period` until cancelled.
pub async fn run_counter_loop(store: Arc<RegisterStore>, period: Duration, cancel: CancellationToken) {
    let mut interval = ticker(period);
    debug!(?period, "Register updater started");

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                store.increment_counter();
            }
        }
    }

    debug!("Register updater stopping");
}

/// Logs request statistics once per `period` until cancelled. Never touches
/// the tables.
pub async fn run_health_loop(dispatcher: Dispatcher, period: Duration, cancel: CancellationToken) {
    let mut interval = ticker(period);

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let stats = dispatcher.stats();
                info!(
                    requests_handled = stats.requests_handled,
                    errors = stats.errors,
                    identity_errors = stats.identity_errors,
                    address_errors = stats.address_errors,
                    counter = dispatcher.store().counter_value(),
                    started_at = %stats.start_time.to_rfc3339(),
                    uptime_secs = stats.uptime.as_secs(),
                    "Health check"
                );
            }
        }
    }

    debug!("Health checker stopping");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModbusConfig;

    fn store() -> Arc<RegisterStore> {
        let config = ModbusConfig {
            unit_id: 1,
            max_registers: 200,
            counter_address: 10,
            update_interval: 1,
            initial_data: vec![],
        };
        Arc::new(RegisterStore::new(&config).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn counter_ticks_once_per_period() {
        let store = store();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_counter_loop(
            Arc::clone(&store),
            Duration::from_secs(1),
            cancel.clone(),
        ));

        time::sleep(Duration::from_millis(5500)).await;
        assert_eq!(store.counter_value(), 5);
        assert_eq!(store.read_holding(1, 10, 1).unwrap(), vec![5]);

        cancel.cancel();
        task.await.unwrap();

        time::sleep(Duration::from_secs(3)).await;
        assert_eq!(store.counter_value(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn counter_exits_promptly_on_cancel() {
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_counter_loop(store(), Duration::from_secs(3600), cancel.clone()));

        cancel.cancel();
        let started = Instant::now();
        task.await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn health_loop_only_observes() {
        let store = store();
        let dispatcher = Dispatcher::new(Arc::clone(&store));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_health_loop(dispatcher, HEALTH_INTERVAL, cancel.clone()));

        time::sleep(HEALTH_INTERVAL * 3 + Duration::from_secs(1)).await;
        cancel.cancel();
        task.await.unwrap();

        let stats = store.snapshot_stats();
        assert_eq!(stats.requests_handled, 0);
        assert_eq!(stats.errors, 0);
        assert_eq!(store.counter_value(), 0);
    }
}

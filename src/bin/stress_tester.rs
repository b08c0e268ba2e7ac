//! Hammers a running simulator with concurrent clients and checks that it
//! behaves like the device it pretends to be.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use clap::Parser;
use tokio::task::JoinSet;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_modbus::prelude::*;
use tracing::{debug, error, info, warn};

#[derive(Debug, Parser)]
#[command(about = "Concurrent conformance check against a Modbus slave simulator")]
struct Args {
    /// Simulator address, host:port.
    #[arg(long, default_value = "localhost:1502")]
    host: String,
    /// Unit id the simulator answers to.
    #[arg(long, default_value_t = 1)]
    unit_id: u8,
    /// Number of concurrent clients.
    #[arg(long, default_value_t = 5)]
    clients: u16,
    /// Test duration in seconds.
    #[arg(long, default_value_t = 30)]
    duration: u64,
    /// Test sequences per second, per client.
    #[arg(long, default_value_t = 10)]
    rate: u32,
    /// Address of the auto-incrementing counter register.
    #[arg(long, default_value_t = 102)]
    counter_addr: u16,
}

#[derive(Debug, Default)]
struct Tally {
    successes: AtomicU64,
    failures: AtomicU64,
}

impl Tally {
    fn pass(&self, n: u64) {
        self.successes.fetch_add(n, Ordering::Relaxed);
    }

    fn fail(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug, Clone, Copy)]
struct Target {
    addr: SocketAddr,
    unit_id: u8,
    counter_addr: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_target(false).init();
    let args = Args::parse();

    let addr = args
        .host
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| anyhow!("cannot resolve hostname {}", args.host))?;
    let target = Target {
        addr,
        unit_id: args.unit_id,
        counter_addr: args.counter_addr,
    };
    let period = Duration::from_secs(1) / args.rate.max(1);
    let deadline = Instant::now() + Duration::from_secs(args.duration);

    info!(
        server = %addr,
        unit_id = args.unit_id,
        clients = args.clients,
        duration_secs = args.duration,
        rate = args.rate,
        "Starting Modbus stress test"
    );

    let tally = Arc::new(Tally::default());
    let mut join_set = JoinSet::new();
    for client_id in 1..=args.clients {
        let tally = Arc::clone(&tally);
        join_set.spawn(run_client(client_id, target, period, deadline, tally));
    }
    while let Some(res) = join_set.join_next().await {
        if let Err(err) = res {
            error!(error = %err, "Client task failed");
            tally.fail();
        }
    }

    let successes = tally.successes.load(Ordering::Relaxed);
    let failures = tally.failures.load(Ordering::Relaxed);
    info!(successes, failures, "Test finished");

    if failures > 0 {
        bail!("{failures} check(s) failed");
    }
    Ok(())
}

async fn run_client(
    client_id: u16,
    target: Target,
    period: Duration,
    deadline: Instant,
    tally: Arc<Tally>,
) {
    let mut ctx = match tcp::connect_slave(target.addr, Slave(target.unit_id)).await {
        Ok(ctx) => ctx,
        Err(err) => {
            error!(client_id, error = %err, "Failed to connect");
            tally.fail();
            return;
        }
    };
    info!(client_id, "Connected");

    let mut interval = time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = time::sleep_until(deadline) => break,
            _ = interval.tick() => {
                if let Err(err) = run_sequence(&mut ctx, client_id, target, &tally).await {
                    warn!(client_id, error = %err, "Transport error during test sequence");
                    tally.fail();
                }
            }
        }
    }

    info!(client_id, "Test duration ended, disconnecting");
    if let Err(err) = ctx.disconnect().await {
        debug!(client_id, error = %err, "Disconnect failed");
    }
}

/// One pass of every check. Transport errors abort the pass; protocol
/// outcomes are scored individually.
async fn run_sequence(
    ctx: &mut client::Context,
    client_id: u16,
    target: Target,
    tally: &Tally,
) -> Result<(), tokio_modbus::Error> {
    ctx.set_slave(Slave(target.unit_id));

    // Write then read back.
    let test_addr = 200 + client_id;
    let test_value = 1000 + client_id;
    match ctx.write_single_register(test_addr, test_value).await? {
        Ok(()) => {
            tally.pass(1);
            match ctx.read_holding_registers(test_addr, 1).await? {
                Ok(regs) if regs == [test_value] => tally.pass(1),
                other => {
                    warn!(client_id, wrote = test_value, read = ?other, "Data integrity check failed");
                    tally.fail();
                }
            }
        }
        Err(code) => {
            warn!(client_id, address = test_addr, ?code, "Could not write register");
            tally.fail();
        }
    }

    // The counter register ignores writes.
    match ctx.write_single_register(target.counter_addr, 9999).await? {
        Ok(()) => {
            tally.pass(1);
            match ctx.read_holding_registers(target.counter_addr, 1).await? {
                Ok(regs) if regs != [9999] => tally.pass(1),
                other => {
                    warn!(client_id, read = ?other, "Protected register check failed");
                    tally.fail();
                }
            }
        }
        Err(code) => {
            warn!(client_id, ?code, "Could not write protected register");
            tally.fail();
        }
    }

    // The counter advances on its own (it wraps, so only change is checked).
    let first = ctx.read_holding_registers(target.counter_addr, 1).await?;
    time::sleep(Duration::from_millis(1100)).await;
    let second = ctx.read_holding_registers(target.counter_addr, 1).await?;
    match (&first, &second) {
        (Ok(a), Ok(b)) if a != b => tally.pass(2),
        _ => {
            warn!(client_id, ?first, ?second, "Counter check failed");
            tally.fail();
        }
    }

    // Another unit id is rejected.
    ctx.set_slave(Slave(99));
    match ctx.read_holding_registers(100, 1).await? {
        Err(_) => tally.pass(1),
        Ok(_) => {
            warn!(client_id, "Invalid unit id was accepted");
            tally.fail();
        }
    }
    ctx.set_slave(Slave(target.unit_id));

    // Reads past the table end are rejected.
    match ctx.read_holding_registers(9999, 1).await? {
        Err(_) => tally.pass(1),
        Ok(_) => {
            warn!(client_id, "Out of bounds read was accepted");
            tally.fail();
        }
    }

    Ok(())
}

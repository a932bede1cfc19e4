//! Stream physical WAL from a primary and print what arrives.
//!
//! PGHOST=127.0.0.1 PGUSER=replicator PGPASSWORD=secret PGSLOT=standby_1 \
//!     cargo run --example physical_stream
//!
//! START_LSN and TIMELINE default to the primary's current position.

use anyhow::Context;
use pgwire_walreceiver::{Lsn, ReplicationConfig, TimelineId, WalEvent, WalReceiver};

fn env(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,pgwire_walreceiver=debug".into()),
        )
        .init();

    let mut cfg = ReplicationConfig {
        host: env("PGHOST", "127.0.0.1"),
        port: env("PGPORT", "5432").parse().context("PGPORT")?,
        user: env("PGUSER", "postgres"),
        password: env("PGPASSWORD", "postgres"),
        status_interval: std::time::Duration::from_secs(1),
        ..Default::default()
    };
    if let Ok(slot) = std::env::var("PGSLOT") {
        cfg.slot = Some(slot);
    }
    if let Ok(lsn) = std::env::var("START_LSN") {
        cfg.start_lsn = Some(Lsn::parse(&lsn).context("START_LSN")?);
    }
    if let Ok(tli) = std::env::var("TIMELINE") {
        cfg.timeline = Some(TimelineId::parse(&tli).context("TIMELINE")?);
    }

    let mut rx = WalReceiver::connect(cfg).await?;
    let mut total = 0usize;

    let interrupted = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break true,
            ev = rx.recv() => match ev? {
                WalEvent::WalData { data_start, wal_end, data, .. } => {
                    total += data.len();
                    println!("WAL {data_start}..{wal_end} bytes={}", data.len());
                }
                WalEvent::KeepAlive { wal_end, reply_requested, .. } => {
                    println!("KeepAlive wal_end={wal_end} reply_requested={reply_requested}");
                }
                WalEvent::TimelineSwitch { timeline, start } => {
                    println!("switched to timeline {timeline} at {start}");
                }
                WalEvent::Ended { next_timeline } => {
                    println!("streaming ended (next timeline: {next_timeline:?})");
                    break false;
                }
            },
        }
    };

    if interrupted {
        println!("stopping after {total} WAL bytes");
        rx.stop();
    }

    rx.join().await?;
    Ok(())
}

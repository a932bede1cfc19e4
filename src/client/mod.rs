//! PostgreSQL physical replication client.
//!
//! Two layers:
//!
//! - [`PgConnection`]: a replication-mode connection implementing
//!   [`ReplicationTransport`](crate::transport::ReplicationTransport). Use it
//!   directly with [`StreamSession`](crate::session::StreamSession) when you
//!   want to drive the stream yourself.
//! - [`WalReceiver`]: runs the streaming loop on a background task and hands
//!   out [`WalEvent`]s.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     channel      ┌─────────────────┐
//! │                 │◄─────────────────│                 │
//! │  Your App       │     WalEvent     │  Worker Task    │
//! │                 │─────────────────►│                 │
//! │                 │    stop flag     │                 │
//! └─────────────────┘                  └────────┬────────┘
//!                                               │
//!                                               │ TCP
//!                                               ▼
//!                                      ┌─────────────────┐
//!                                      │   PostgreSQL    │
//!                                      │   (walsender)   │
//!                                      └─────────────────┘
//! ```
//!
//! # Example
//!
//! ```ignore
//! use pgwire_walreceiver::{ReplicationConfig, WalEvent, WalReceiver};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cfg = ReplicationConfig::from_conninfo("host=primary user=replicator password=secret")?;
//!     let mut receiver = WalReceiver::connect(cfg).await?;
//!
//!     loop {
//!         match receiver.recv().await? {
//!             WalEvent::WalData { data_start, data, .. } => {
//!                 println!("{} bytes at {data_start}", data.len());
//!             }
//!             WalEvent::TimelineSwitch { timeline, start } => {
//!                 println!("now on timeline {timeline} from {start}");
//!             }
//!             WalEvent::Ended { .. } => break,
//!             WalEvent::KeepAlive { .. } => {}
//!         }
//!     }
//!     Ok(())
//! }
//! ```

mod connection;
mod receiver;

pub use connection::PgConnection;
pub use receiver::{WalEvent, WalEventReceiver, WalReceiver};

#![warn(
    clippy::all,
    clippy::cargo,
    clippy::perf,
    clippy::style,
    clippy::correctness,
    clippy::suspicious
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::multiple_crate_versions
)]

//! Standby side of PostgreSQL physical streaming replication.
//!
//! [`session::StreamSession`] runs one streaming phase over any
//! [`transport::ReplicationTransport`]: it decodes WAL data and keepalives,
//! tracks the last reported WAL end and answers with status replies.
//! [`client::WalReceiver`] wraps that in a background task over TCP and
//! follows timeline switches.

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod lsn;
pub mod protocol;
pub mod session;
pub mod state;
pub mod transport;

pub use client::{PgConnection, WalEvent, WalEventReceiver, WalReceiver};
pub use config::ReplicationConfig;
pub use error::{ReplicationError, Result};
pub use lsn::{Lsn, TimelineId};
pub use protocol::{ReplicationMessage, StatusReply};
pub use session::{Received, SessionState, StreamMode, StreamSession, TimelineSwitch};
pub use state::ReplicationState;
pub use transport::{CopyFrame, QueryResult, Readiness, ReplicationTransport, ResultSet};

//! PostgreSQL wire protocol implementation.
//!
//! This module provides low-level primitives for:
//! - Reading and writing PostgreSQL frontend/backend messages ([`framing`])
//! - Parsing authentication, error and result-set messages ([`messages`])
//! - The copy-both messages of physical streaming replication ([`replication`])
//!
//! # Wire Protocol Overview
//!
//! PostgreSQL uses a message-based protocol where each message consists of:
//! - 1 byte: message type tag
//! - 4 bytes: message length (including these 4 bytes)
//! - N bytes: message payload
//!
//! Exception: the startup message omits the type tag.
//!
//! # Replication Protocol
//!
//! After `START_REPLICATION` the connection enters copy-both mode. The primary
//! sends CopyData messages containing either WAL data (`'w'`) or keepalives
//! (`'k'`). The standby answers with status replies (`'r'`) reporting how far
//! it has received WAL.

pub mod framing;
pub mod messages;
pub mod replication;

pub use framing::BackendMessage;
pub use messages::{parse_auth_request, parse_error_response};
pub use replication::{
    KEEPALIVE_LEN, Keepalive, PAGE_SIZE, ReplicationMessage, STATUS_REPLY_LEN, StatusReply,
    WAL_DATA_HEADER_LEN, WalData, decode, next_page_boundary,
};

use std::time::Duration;

use crate::error::{ReplicationError, Result};
use crate::lsn::{Lsn, TimelineId};

#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    pub host: String,
    pub port: u16,

    pub user: String,
    pub password: String,
    pub application_name: String,

    /// Physical replication slot to stream from. Without one the primary keeps
    /// no WAL on our behalf.
    pub slot: Option<String>,

    /// Start position. `None` streams from the primary's current flush position
    /// (as reported by `IDENTIFY_SYSTEM`).
    pub start_lsn: Option<Lsn>,

    /// Timeline to request. `None` uses the primary's current timeline.
    pub timeline: Option<TimelineId>,

    /// Restart streaming on the next timeline when the primary ends the current one.
    pub follow_timeline_switch: bool,

    /// How often to send standby status replies when the primary did not ask for one.
    pub status_interval: Duration,

    /// Upper bound on a single wait for the socket to become readable.
    pub wait_timeout: Duration,

    pub connect_timeout: Duration,

    /// Bounded buffer size (#events) between the receiver worker and consumer.
    pub buffer_events: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 5432,
            user: "postgres".into(),
            password: "postgres".into(),
            application_name: "pgwire-walreceiver".into(),

            slot: None,
            start_lsn: None,
            timeline: None,
            follow_timeline_switch: true,

            status_interval: Duration::from_secs(10),
            wait_timeout: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(10),
            buffer_events: 8192,
        }
    }
}

impl ReplicationConfig {
    /// Build a config from a libpq-style keyword/value string, e.g.
    /// `host=db1 port=5433 user=replicator password=secret`.
    ///
    /// Unset keywords keep their [`Default`] values. Values may be single-quoted;
    /// inside quotes `\'` and `\\` are escapes.
    pub fn from_conninfo(conninfo: &str) -> Result<Self> {
        let mut cfg = ReplicationConfig::default();
        for (key, value) in parse_conninfo(conninfo)? {
            match key.as_str() {
                "host" | "hostaddr" => cfg.host = value,
                "port" => {
                    cfg.port = value
                        .parse()
                        .map_err(|_| ReplicationError::Config(format!("invalid port: {value}")))?
                }
                "user" => cfg.user = value,
                "password" => cfg.password = value,
                "application_name" => cfg.application_name = value,
                "connect_timeout" => {
                    let secs: u64 = value.parse().map_err(|_| {
                        ReplicationError::Config(format!("invalid connect_timeout: {value}"))
                    })?;
                    cfg.connect_timeout = Duration::from_secs(secs);
                }
                // accepted for compatibility with walreceiver-style conninfo strings
                "replication" | "dbname" => {}
                other => {
                    return Err(ReplicationError::Config(format!(
                        "unsupported conninfo keyword: {other}"
                    )));
                }
            }
        }
        Ok(cfg)
    }
}

fn parse_conninfo(s: &str) -> Result<Vec<(String, String)>> {
    let mut out = Vec::new();
    let mut chars = s.chars().peekable();

    loop {
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if chars.peek().is_none() {
            return Ok(out);
        }

        let mut key = String::new();
        while let Some(c) = chars.next_if(|c| *c != '=' && !c.is_whitespace()) {
            key.push(c);
        }
        while chars.next_if(|c| c.is_whitespace()).is_some() {}
        if chars.next() != Some('=') {
            return Err(ReplicationError::Config(format!(
                "missing \"=\" after \"{key}\" in connection string"
            )));
        }
        while chars.next_if(|c| c.is_whitespace()).is_some() {}

        let mut value = String::new();
        if chars.next_if_eq(&'\'').is_some() {
            loop {
                match chars.next() {
                    Some('\\') => match chars.next() {
                        Some(c) => value.push(c),
                        None => break,
                    },
                    Some('\'') => break,
                    Some(c) => value.push(c),
                    None => {
                        return Err(ReplicationError::Config(
                            "unterminated quoted string in connection string".into(),
                        ));
                    }
                }
            }
        } else {
            while let Some(c) = chars.next_if(|c| !c.is_whitespace()) {
                value.push(c);
            }
        }
        out.push((key, value));
    }
}

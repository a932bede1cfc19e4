//! Password authentication for replication connections.
//!
//! - cleartext: always available (the server decides whether to ask for it)
//! - **SCRAM-SHA-256** (feature `scram`, default): the method PostgreSQL 14+
//!   uses by default
//! - **MD5** (feature `md5`): legacy `md5` entries in `pg_hba.conf`
//!
//! GSSAPI, SSPI and certificate authentication are not supported.

#[cfg(feature = "scram")]
pub mod scram;

#[cfg(feature = "scram")]
pub use scram::ScramSha256;

/// Authentication request codes of the `R` backend message.
pub mod codes {
    pub const OK: i32 = 0;
    pub const CLEARTEXT: i32 = 3;
    pub const MD5: i32 = 5;
    pub const SASL: i32 = 10;
    pub const SASL_CONTINUE: i32 = 11;
    pub const SASL_FINAL: i32 = 12;
}

/// Mechanism names offered in an AuthenticationSASL message (NUL-terminated
/// list, empty string last).
pub fn sasl_mechanisms(payload: &[u8]) -> Vec<String> {
    payload
        .split(|&b| b == 0)
        .take_while(|m| !m.is_empty())
        .map(|m| String::from_utf8_lossy(m).into_owned())
        .collect()
}

/// `md5` + hex(md5(hex(md5(password + user)) + salt))
#[cfg(feature = "md5")]
pub fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = format!("{:x}", md5::compute(format!("{password}{user}")));
    let mut outer = inner.into_bytes();
    outer.extend_from_slice(salt);
    format!("md5{:x}", md5::compute(outer))
}

//! SCRAM-SHA-256 client exchange (RFC 5802, RFC 7677).
//!
//! ```text
//! client-first   n,,n=<user>,r=<client nonce>
//! server-first   r=<nonce>,s=<salt>,i=<iterations>
//! client-final   c=biws,r=<nonce>,p=<proof>
//! server-final   v=<server signature>
//! ```
//!
//! No channel binding and no SASLprep: passwords are used as raw UTF-8.

use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::{ReplicationError, Result};

pub const MECHANISM: &str = "SCRAM-SHA-256";

type HmacSha256 = Hmac<Sha256>;

/// GS2 header "n,," in base64.
const CHANNEL_BINDING: &str = "biws";

#[derive(Debug, Clone)]
pub struct ScramSha256 {
    nonce: String,
    client_first_bare: String,
    server_signature: Option<[u8; 32]>,
}

impl ScramSha256 {
    pub fn new(user: &str) -> Self {
        let mut raw = [0u8; 18];
        rand::rng().fill_bytes(&mut raw);
        Self::with_nonce(user, &B64.encode(raw))
    }

    pub(crate) fn with_nonce(user: &str, nonce: &str) -> Self {
        let user = user.replace('=', "=3D").replace(',', "=2C");
        Self {
            nonce: nonce.to_string(),
            client_first_bare: format!("n={user},r={nonce}"),
            server_signature: None,
        }
    }

    /// Body of the SASLInitialResponse.
    pub fn client_first(&self) -> String {
        format!("n,,{}", self.client_first_bare)
    }

    /// Answer the server challenge. Remembers the signature the server must
    /// present in its final message.
    pub fn client_final(&mut self, password: &str, server_first: &str) -> Result<String> {
        let challenge = ServerFirst::parse(server_first)?;
        if !challenge.nonce.starts_with(&self.nonce) || challenge.nonce.len() == self.nonce.len() {
            return Err(scram_error("server nonce does not extend the client nonce"));
        }
        let salt = B64
            .decode(challenge.salt.as_bytes())
            .map_err(|e| scram_error(&format!("invalid salt: {e}")))?;

        let salted = salted_password(password.as_bytes(), &salt, challenge.iterations);
        let client_key = hmac_sha256(&salted, b"Client Key");
        let stored_key: [u8; 32] = Sha256::digest(client_key).into();

        let without_proof = format!("c={CHANNEL_BINDING},r={}", challenge.nonce);
        let auth_message = format!("{},{server_first},{without_proof}", self.client_first_bare);

        let signature = hmac_sha256(&stored_key, auth_message.as_bytes());
        let mut proof = client_key;
        for (p, s) in proof.iter_mut().zip(signature) {
            *p ^= s;
        }

        let server_key = hmac_sha256(&salted, b"Server Key");
        self.server_signature = Some(hmac_sha256(&server_key, auth_message.as_bytes()));

        Ok(format!("{without_proof},p={}", B64.encode(proof)))
    }

    /// Check the server's proof that it knows the password too.
    pub fn verify_server_final(&self, server_final: &str) -> Result<()> {
        let expected = self
            .server_signature
            .ok_or_else(|| scram_error("server-final received before client-final was sent"))?;

        let mut verifier = None;
        for attr in server_final.split(',') {
            if let Some(e) = attr.strip_prefix("e=") {
                return Err(scram_error(&format!("server reported {e}")));
            }
            if let Some(v) = attr.strip_prefix("v=") {
                verifier = Some(v.trim());
            }
        }
        let verifier = verifier.ok_or_else(|| scram_error("server-final missing signature"))?;
        let got = B64
            .decode(verifier.as_bytes())
            .map_err(|e| scram_error(&format!("invalid server signature: {e}")))?;

        if got.len() != expected.len()
            || got.iter().zip(expected).fold(0u8, |acc, (a, b)| acc | (a ^ b)) != 0
        {
            return Err(scram_error("server signature mismatch"));
        }
        Ok(())
    }
}

struct ServerFirst<'a> {
    nonce: &'a str,
    salt: &'a str,
    iterations: u32,
}

impl<'a> ServerFirst<'a> {
    fn parse(msg: &'a str) -> Result<Self> {
        let (mut nonce, mut salt, mut iterations) = (None, None, None);
        for attr in msg.split(',') {
            match attr.split_once('=') {
                Some(("r", v)) => nonce = Some(v),
                Some(("s", v)) => salt = Some(v),
                Some(("i", v)) => iterations = v.parse::<u32>().ok().filter(|i| *i > 0),
                _ => {}
            }
        }
        Ok(ServerFirst {
            nonce: nonce.ok_or_else(|| scram_error("server-first missing nonce"))?,
            salt: salt.ok_or_else(|| scram_error("server-first missing salt"))?,
            iterations: iterations
                .ok_or_else(|| scram_error("server-first missing or invalid iteration count"))?,
        })
    }
}

fn scram_error(msg: &str) -> ReplicationError {
    ReplicationError::Connect(format!("SCRAM authentication failed: {msg}"))
}

fn hmac_sha256(key: &[u8], msg: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(msg);
    mac.finalize().into_bytes().into()
}

/// Hi() from RFC 5802, i.e. PBKDF2-HMAC-SHA-256 with one output block.
fn salted_password(password: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut block = Vec::with_capacity(salt.len() + 4);
    block.extend_from_slice(salt);
    block.extend_from_slice(&1u32.to_be_bytes());

    let mut u = hmac_sha256(password, &block);
    let mut out = u;
    for _ in 1..iterations {
        u = hmac_sha256(password, &u);
        for (o, x) in out.iter_mut().zip(u) {
            *o ^= x;
        }
    }
    out
}

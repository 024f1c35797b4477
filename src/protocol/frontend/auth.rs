//! Password and SASL responses.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::protocol::codec::MessageBuilder;

type HmacSha256 = Hmac<Sha256>;

/// PasswordMessage with a cleartext or MD5-hashed password.
pub fn write_password(buf: &mut Vec<u8>, password: &str) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::PASSWORD);
    msg.cstr(password);
    msg.finish();
}

/// `"md5" + hex(md5(hex(md5(password + user)) + salt))`
pub fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = md5_hex(password, user);
    let outer = md5::Md5::new()
        .chain_update(inner)
        .chain_update(salt)
        .finalize();
    format!("md5{outer:x}")
}

/// Stored form of an MD5 password: `"md5" + hex(md5(password + user))`.
///
/// Suitable for `CREATE ROLE ... PASSWORD` and `ALTER ROLE ... PASSWORD`
/// without sending the cleartext.
pub fn encrypt_password(password: &str, user: &str) -> String {
    format!("md5{}", md5_hex(password, user))
}

fn md5_hex(password: &str, user: &str) -> String {
    let digest = md5::Md5::new()
        .chain_update(password)
        .chain_update(user)
        .finalize();
    format!("{digest:x}")
}

pub fn write_sasl_initial_response(buf: &mut Vec<u8>, mechanism: &str, data: &[u8]) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::PASSWORD);
    msg.cstr(mechanism).i32(data.len() as i32).bytes(data);
    msg.finish();
}

pub fn write_sasl_response(buf: &mut Vec<u8>, data: &[u8]) {
    let mut msg = MessageBuilder::new(buf, super::msg_type::PASSWORD);
    msg.bytes(data);
    msg.finish();
}

fn hmac(key: &[u8], data: &[u8]) -> Result<[u8; 32]> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| Error::Auth(format!("HMAC key rejected: {e}")))?;
    mac.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    Ok(out)
}

/// SCRAM-SHA-256 exchange without channel binding.
pub struct ScramClient {
    password: String,
    client_nonce: String,
    /// `ServerSignature`, known after the server-first message
    expected_server_signature: Option<[u8; 32]>,
}

impl ScramClient {
    /// Mechanism name announced in SASLInitialResponse.
    pub const MECHANISM: &'static str = "SCRAM-SHA-256";

    const GS2_HEADER: &'static str = "n,,";

    pub fn new(password: &str) -> Self {
        use rand::Rng;

        let mut raw = [0u8; 18];
        rand::rng().fill(&mut raw);
        Self::with_nonce(password, BASE64.encode(raw))
    }

    fn with_nonce(password: &str, client_nonce: String) -> Self {
        Self {
            password: password.to_string(),
            client_nonce,
            expected_server_signature: None,
        }
    }

    fn first_bare(&self) -> String {
        // The server takes the user name from the startup packet.
        format!("n=,r={}", self.client_nonce)
    }

    pub fn client_first(&self) -> String {
        format!("{}{}", Self::GS2_HEADER, self.first_bare())
    }

    /// Answer `r=...,s=...,i=...` with the client-final message.
    pub fn client_final(&mut self, server_first: &str) -> Result<String> {
        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;
        for attr in server_first.split(',') {
            match attr.split_at_checked(2) {
                Some(("r=", v)) => nonce = Some(v),
                Some(("s=", v)) => salt = Some(v),
                Some(("i=", v)) => iterations = v.parse::<u32>().ok(),
                _ => {}
            }
        }
        let (Some(nonce), Some(salt), Some(iterations)) = (nonce, salt, iterations) else {
            return Err(Error::Auth("malformed SCRAM server-first message".into()));
        };
        if !nonce.starts_with(&self.client_nonce) || nonce.len() == self.client_nonce.len() {
            return Err(Error::Auth("SCRAM server nonce does not extend client nonce".into()));
        }
        let salt = BASE64
            .decode(salt)
            .map_err(|e| Error::Auth(format!("invalid SCRAM salt: {e}")))?;

        let mut salted = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(self.password.as_bytes(), &salt, iterations, &mut salted);

        let client_key = hmac(&salted, b"Client Key")?;
        let stored_key = Sha256::digest(client_key);

        let without_proof = format!("c={},r={}", BASE64.encode(Self::GS2_HEADER), nonce);
        let auth_message = format!("{},{},{}", self.first_bare(), server_first, without_proof);

        let signature = hmac(&stored_key, auth_message.as_bytes())?;
        let proof: Vec<u8> = client_key
            .iter()
            .zip(signature.iter())
            .map(|(k, s)| k ^ s)
            .collect();

        let server_key = hmac(&salted, b"Server Key")?;
        self.expected_server_signature = Some(hmac(&server_key, auth_message.as_bytes())?);

        Ok(format!("{},p={}", without_proof, BASE64.encode(proof)))
    }

    /// Check `v=...` against the signature derived in [`ScramClient::client_final`].
    pub fn verify_server_final(&self, server_final: &str) -> Result<()> {
        if let Some(err) = server_final.strip_prefix("e=") {
            return Err(Error::Auth(format!("SCRAM error: {err}")));
        }
        let encoded = server_final
            .strip_prefix("v=")
            .ok_or_else(|| Error::Auth("malformed SCRAM server-final message".into()))?;
        let received = BASE64
            .decode(encoded)
            .map_err(|e| Error::Auth(format!("invalid SCRAM server signature: {e}")))?;
        match &self.expected_server_signature {
            Some(expected) if expected.as_slice() == received.as_slice() => Ok(()),
            Some(_) => Err(Error::Auth("SCRAM server signature mismatch".into())),
            None => Err(Error::Auth("SCRAM server-final before server-first".into())),
        }
    }
}

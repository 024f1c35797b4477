//! Startup and authentication state machine.
//!
//! Consumes one framed backend message at a time and appends any reply to the
//! caller's output buffer. Asynchronous messages (notices, parameter status)
//! are filtered out by the driver before they reach [`StartupMachine::step`].

use crate::error::{Error, Result, Verbosity};
use crate::opts::Opts;
use crate::protocol::backend::{
    Authentication, BackendKeyData, RawMessage, ReadyForQuery, msg_type, parse_fields,
};
use crate::protocol::frontend::{
    ScramClient, md5_password, write_password, write_sasl_initial_response, write_sasl_response,
    write_ssl_request, write_startup,
};
use crate::protocol::types::tx_status;

/// Where the handshake currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupPhase {
    /// SSLRequest sent, waiting for the single-byte answer
    AwaitingSslResponse,
    /// StartupMessage sent, waiting for an authentication request
    AwaitingAuth,
    /// SCRAM exchange in progress
    Sasl,
    /// Credentials sent, waiting for AuthenticationOk
    AwaitingAuthResult,
    /// Authenticated; collecting BackendKeyData until ReadyForQuery
    AwaitingReady,
    Ready,
    Failed,
}

/// Answer to an SSLRequest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SslResponse {
    /// Server agreed; run the TLS handshake, then [`StartupMachine::send_startup`]
    Handshake,
    /// Server refused; StartupMessage already queued in plaintext
    Plain,
}

/// Outcome of [`StartupMachine::step`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// More messages expected (output may have been queued)
    Continue,
    /// ReadyForQuery received
    Ready,
}

pub struct StartupMachine {
    phase: StartupPhase,
    user: String,
    password: Option<String>,
    startup_params: Vec<(String, String)>,
    scram: Option<ScramClient>,
    backend_key: Option<(u32, u32)>,
    transaction_status: u8,
    password_needed: bool,
    password_used: bool,
    verbosity: Verbosity,
}

impl StartupMachine {
    pub fn new(opts: &Opts, verbosity: Verbosity) -> Result<Self> {
        let user = opts.effective_user()?;
        let mut startup_params = vec![
            ("user".to_string(), user.clone()),
            ("database".to_string(), opts.effective_dbname()?),
            ("client_encoding".to_string(), "UTF8".to_string()),
        ];
        if let Some(options) = &opts.options {
            startup_params.push(("options".into(), options.clone()));
        }
        if let Some(app) = &opts.application_name {
            startup_params.push(("application_name".into(), app.clone()));
        }
        for (name, value) in &opts.params {
            match startup_params.iter_mut().find(|(k, _)| k == name) {
                Some(entry) => entry.1 = value.clone(),
                None => startup_params.push((name.clone(), value.clone())),
            }
        }

        Ok(Self {
            phase: StartupPhase::AwaitingAuth,
            user,
            password: opts.password.clone(),
            startup_params,
            scram: None,
            backend_key: None,
            transaction_status: tx_status::IDLE,
            password_needed: false,
            password_used: false,
            verbosity,
        })
    }

    pub fn phase(&self) -> StartupPhase {
        self.phase
    }

    /// `(pid, secret)` from BackendKeyData.
    pub fn backend_key(&self) -> Option<(u32, u32)> {
        self.backend_key
    }

    /// Status byte of the final ReadyForQuery.
    pub fn transaction_status(&self) -> u8 {
        self.transaction_status
    }

    /// The server asked for a password.
    pub fn password_needed(&self) -> bool {
        self.password_needed
    }

    /// A password was sent.
    pub fn password_used(&self) -> bool {
        self.password_used
    }

    pub fn send_ssl_request(&mut self, out: &mut Vec<u8>) {
        write_ssl_request(out);
        self.phase = StartupPhase::AwaitingSslResponse;
    }

    pub fn send_startup(&mut self, out: &mut Vec<u8>) {
        let params: Vec<(&str, &str)> = self
            .startup_params
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        write_startup(out, &params);
        self.phase = StartupPhase::AwaitingAuth;
    }

    /// Handle the `'S'` / `'N'` byte answering SSLRequest.
    pub fn ssl_response(&mut self, byte: u8, tls_required: bool, out: &mut Vec<u8>) -> Result<SslResponse> {
        match byte {
            b'S' => Ok(SslResponse::Handshake),
            b'N' if tls_required => self.fail(Error::Connect(
                "server does not support SSL, but SSL was required".into(),
            )),
            b'N' => {
                self.send_startup(out);
                Ok(SslResponse::Plain)
            }
            // An old server answering SSLRequest with ErrorResponse.
            b'E' => self.fail(Error::Connect(
                "server rejected the SSL negotiation request".into(),
            )),
            other => self.fail(Error::Connect(format!(
                "received invalid response to SSL negotiation: {}",
                other as char
            ))),
        }
    }

    fn fail<T>(&mut self, err: Error) -> Result<T> {
        self.phase = StartupPhase::Failed;
        Err(err)
    }

    /// Process one backend message.
    pub fn step(&mut self, msg: RawMessage<'_>, out: &mut Vec<u8>) -> Result<Step> {
        let result = self.step_inner(msg, out);
        if result.is_err() {
            self.phase = StartupPhase::Failed;
        }
        result
    }

    fn step_inner(&mut self, msg: RawMessage<'_>, out: &mut Vec<u8>) -> Result<Step> {
        if msg.type_byte == msg_type::ERROR_RESPONSE {
            let fields = parse_fields(msg.payload)?;
            return Err(Error::Connect(fields.render(self.verbosity).trim_end().to_string()));
        }

        match self.phase {
            StartupPhase::AwaitingAuth => self.on_auth_request(msg, out),
            StartupPhase::Sasl => self.on_sasl(msg, out),
            StartupPhase::AwaitingAuthResult => match Self::auth(msg)? {
                Authentication::Ok => {
                    self.phase = StartupPhase::AwaitingReady;
                    Ok(Step::Continue)
                }
                other => Err(Error::Protocol(format!(
                    "unexpected authentication message {other:?}"
                ))),
            },
            StartupPhase::AwaitingReady => self.on_ready_phase(msg),
            phase => Err(Error::Protocol(format!(
                "unexpected message '{}' during startup phase {phase:?}",
                msg.type_byte as char
            ))),
        }
    }

    fn auth(msg: RawMessage<'_>) -> Result<Authentication<'_>> {
        if msg.type_byte != msg_type::AUTHENTICATION {
            return Err(Error::Protocol(format!(
                "expected authentication request from server, but received '{}'",
                msg.type_byte as char
            )));
        }
        Authentication::parse(msg.payload)
    }

    fn require_password(&mut self) -> Result<String> {
        self.password_needed = true;
        let password = self
            .password
            .clone()
            .ok_or_else(|| Error::Connect("fe_sendauth: no password supplied".into()))?;
        self.password_used = true;
        Ok(password)
    }

    fn on_auth_request(&mut self, msg: RawMessage<'_>, out: &mut Vec<u8>) -> Result<Step> {
        match Self::auth(msg)? {
            Authentication::Ok => {
                self.phase = StartupPhase::AwaitingReady;
            }
            Authentication::CleartextPassword => {
                let password = self.require_password()?;
                write_password(out, &password);
                self.phase = StartupPhase::AwaitingAuthResult;
            }
            Authentication::Md5Password { salt } => {
                let password = self.require_password()?;
                write_password(out, &md5_password(&self.user, &password, &salt));
                self.phase = StartupPhase::AwaitingAuthResult;
            }
            Authentication::Sasl { mechanisms } => {
                if !mechanisms.contains(&ScramClient::MECHANISM) {
                    return Err(Error::Unsupported(format!(
                        "none of the server's SASL authentication mechanisms are supported: {mechanisms:?}"
                    )));
                }
                let password = self.require_password()?;
                let scram = ScramClient::new(&password);
                write_sasl_initial_response(out, ScramClient::MECHANISM, scram.client_first().as_bytes());
                self.scram = Some(scram);
                self.phase = StartupPhase::Sasl;
            }
            Authentication::Unsupported(code) => {
                return Err(Error::Unsupported(format!(
                    "authentication method {code} not supported"
                )));
            }
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected authentication message {other:?}"
                )));
            }
        }
        Ok(Step::Continue)
    }

    fn on_sasl(&mut self, msg: RawMessage<'_>, out: &mut Vec<u8>) -> Result<Step> {
        let auth = Self::auth(msg)?;
        let scram = self
            .scram
            .as_mut()
            .ok_or_else(|| Error::Protocol("SASL message without an exchange".into()))?;
        match auth {
            Authentication::SaslContinue { data } => {
                let server_first = simdutf8::basic::from_utf8(data)
                    .map_err(|_| Error::Auth("server-first message is not UTF-8".into()))?;
                let client_final = scram.client_final(server_first)?;
                write_sasl_response(out, client_final.as_bytes());
            }
            Authentication::SaslFinal { data } => {
                let server_final = simdutf8::basic::from_utf8(data)
                    .map_err(|_| Error::Auth("server-final message is not UTF-8".into()))?;
                scram.verify_server_final(server_final)?;
                self.phase = StartupPhase::AwaitingAuthResult;
            }
            other => {
                return Err(Error::Protocol(format!(
                    "unexpected message during SASL exchange {other:?}"
                )));
            }
        }
        Ok(Step::Continue)
    }

    fn on_ready_phase(&mut self, msg: RawMessage<'_>) -> Result<Step> {
        match msg.type_byte {
            msg_type::BACKEND_KEY_DATA => {
                let key = BackendKeyData::parse(msg.payload)?;
                self.backend_key = Some((key.process_id(), key.secret_key()));
                Ok(Step::Continue)
            }
            // Protocol downgrade notice; 3.0 is all we ask for.
            msg_type::NEGOTIATE_PROTOCOL_VERSION => Ok(Step::Continue),
            msg_type::READY_FOR_QUERY => {
                self.transaction_status = ReadyForQuery::parse(msg.payload)?.status;
                self.phase = StartupPhase::Ready;
                Ok(Step::Ready)
            }
            other => Err(Error::Protocol(format!(
                "unexpected message '{}' after authentication",
                other as char
            ))),
        }
    }
}

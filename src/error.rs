//! Error types for pgpoll.

use thiserror::Error;

use crate::result::PgResult;

/// Result type for pgpoll operations.
pub type Result<T> = core::result::Result<T, Error>;

/// How much detail rendered error messages carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Verbosity {
    /// Severity, primary message and position only
    Terse,
    /// Adds detail, hint, query and context lines
    #[default]
    Default,
    /// Adds the SQLSTATE code and source location
    Verbose,
}

/// PostgreSQL error/notice field types.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorFields {
    /// Severity: ERROR, FATAL, PANIC, WARNING, NOTICE, DEBUG, INFO, LOG
    pub severity: Option<String>,
    /// Non-localized severity (same as severity but never translated)
    pub severity_non_localized: Option<String>,
    /// SQLSTATE error code (5 characters)
    pub code: Option<String>,
    /// Primary error message
    pub message: Option<String>,
    /// Detailed error explanation
    pub detail: Option<String>,
    /// Suggestion for fixing the error
    pub hint: Option<String>,
    /// Cursor position in query string (1-based)
    pub position: Option<u32>,
    /// Position in internal query
    pub internal_position: Option<u32>,
    /// Failed internal command text
    pub internal_query: Option<String>,
    /// Context/stack trace
    pub where_: Option<String>,
    /// Schema name
    pub schema: Option<String>,
    /// Table name
    pub table: Option<String>,
    /// Column name
    pub column: Option<String>,
    /// Data type name
    pub data_type: Option<String>,
    /// Constraint name
    pub constraint: Option<String>,
    /// Source file name
    pub file: Option<String>,
    /// Source line number
    pub line: Option<u32>,
    /// Source routine name
    pub routine: Option<String>,
}

impl ErrorFields {
    /// Build fields for a client-side failure (no server involvement).
    pub fn client(severity: &str, message: impl Into<String>) -> Self {
        Self {
            severity: Some(severity.to_string()),
            severity_non_localized: Some(severity.to_string()),
            message: Some(message.into()),
            ..Self::default()
        }
    }

    /// Look up a field by its single-byte protocol code (`'C'`, `'M'`, ...).
    pub fn get(&self, code: u8) -> Option<String> {
        use crate::protocol::backend::error::field_type as ft;
        match code {
            ft::SEVERITY => self.severity.clone(),
            ft::SEVERITY_NON_LOCALIZED => self.severity_non_localized.clone(),
            ft::CODE => self.code.clone(),
            ft::MESSAGE => self.message.clone(),
            ft::DETAIL => self.detail.clone(),
            ft::HINT => self.hint.clone(),
            ft::POSITION => self.position.map(|p| p.to_string()),
            ft::INTERNAL_POSITION => self.internal_position.map(|p| p.to_string()),
            ft::INTERNAL_QUERY => self.internal_query.clone(),
            ft::WHERE => self.where_.clone(),
            ft::SCHEMA => self.schema.clone(),
            ft::TABLE => self.table.clone(),
            ft::COLUMN => self.column.clone(),
            ft::DATA_TYPE => self.data_type.clone(),
            ft::CONSTRAINT => self.constraint.clone(),
            ft::FILE => self.file.clone(),
            ft::LINE => self.line.map(|l| l.to_string()),
            ft::ROUTINE => self.routine.clone(),
            _ => None,
        }
    }

    /// Render the fields the way `psql` prints server errors.
    ///
    /// The result always ends with a newline.
    pub fn render(&self, verbosity: Verbosity) -> String {
        let mut out = String::new();
        let severity = self.severity.as_deref().unwrap_or("ERROR");
        out.push_str(severity);
        out.push_str(":  ");
        if verbosity == Verbosity::Verbose {
            if let Some(code) = &self.code {
                out.push_str(code);
                out.push_str(": ");
            }
        }
        out.push_str(self.message.as_deref().unwrap_or("(no message)"));
        if let Some(position) = self.position {
            out.push_str(&format!(" at character {position}"));
        }
        out.push('\n');

        if verbosity == Verbosity::Terse {
            return out;
        }

        let lines = [
            ("DETAIL", &self.detail),
            ("HINT", &self.hint),
            ("QUERY", &self.internal_query),
            ("CONTEXT", &self.where_),
        ];
        for (label, value) in lines {
            if let Some(value) = value {
                out.push_str(&format!("{label}:  {value}\n"));
            }
        }

        if verbosity == Verbosity::Verbose {
            let location = match (&self.routine, &self.file, self.line) {
                (Some(routine), Some(file), Some(line)) => Some(format!("{routine}, {file}:{line}")),
                (None, Some(file), Some(line)) => Some(format!("{file}:{line}")),
                _ => None,
            };
            if let Some(location) = location {
                out.push_str(&format!("LOCATION:  {location}\n"));
            }
        }
        out
    }
}

impl std::fmt::Display for ErrorFields {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(severity) = &self.severity {
            write!(f, "{}: ", severity)?;
        }
        if let Some(message) = &self.message {
            write!(f, "{}", message)?;
        }
        if let Some(code) = &self.code {
            write!(f, " (SQLSTATE {})", code)?;
        }
        if let Some(detail) = &self.detail {
            write!(f, "\nDETAIL: {}", detail)?;
        }
        if let Some(hint) = &self.hint {
            write!(f, "\nHINT: {}", hint)?;
        }
        Ok(())
    }
}

/// A command finished with an error status.
///
/// Carries the erroring result (when the server produced one) and the identity
/// of the connection it ran on.
#[derive(Debug)]
pub struct CommandError {
    /// Rendered error message
    pub message: String,
    /// Backend process id of the originating connection (0 if unknown)
    pub backend_pid: u32,
    /// Connection parameters of the originating connection, password removed
    pub conninfo: String,
    /// The erroring result, if one could be constructed
    pub result: Option<PgResult>,
}

impl CommandError {
    /// Structured server error fields, when the result carries them.
    pub fn fields(&self) -> Option<&ErrorFields> {
        self.result.as_ref().and_then(PgResult::error_fields)
    }
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message.trim_end())
    }
}

/// Error type for pgpoll.
#[derive(Debug, Error)]
pub enum Error {
    /// Connection parameters are malformed
    #[error("Invalid connection parameters: {0}")]
    Config(String),

    /// Connection handshake failed
    #[error("Connection failed: {0}")]
    Connect(String),

    /// Reset handshake failed
    #[error("Connection reset failed: {0}")]
    Reset(String),

    /// A command could not be sent
    #[error("Dispatch failed: {0}")]
    Dispatch(String),

    /// A command finished with an error result
    #[error("{0}")]
    Command(Box<CommandError>),

    /// The result was cleared and its contents released
    #[error("Result has been cleared")]
    ResultCleared,

    /// The connection was closed
    #[error("Connection is closed")]
    ConnectionClosed,

    /// A blocking wait ran out of time
    #[error("Timed out waiting for the server")]
    Timeout,

    /// A cancel request could not be delivered
    #[error("Cancel request failed: {0}")]
    CancelFailed(String),

    /// Protocol error (malformed message, unexpected response, etc.)
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// TLS error
    #[cfg(feature = "tls")]
    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    /// Invalid usage (e.g., nested transactions)
    #[error("Invalid usage: {0}")]
    InvalidUsage(String),

    /// Unsupported feature
    #[error("Unsupported: {0}")]
    Unsupported(String),
}

impl Error {
    /// Returns true if the error indicates the connection is broken and cannot be reused.
    pub fn is_connection_broken(&self) -> bool {
        match self {
            Error::Io(_) | Error::ConnectionClosed | Error::Protocol(_) => true,
            Error::Command(err) => matches!(
                err.fields().and_then(|f| f.severity_non_localized.as_deref().or(f.severity.as_deref())),
                Some("FATAL") | Some("PANIC")
            ),
            _ => false,
        }
    }

    /// Get the SQLSTATE code if this is a server error.
    pub fn sqlstate(&self) -> Option<&str> {
        match self {
            Error::Command(err) => err.fields().and_then(|f| f.code.as_deref()),
            _ => None,
        }
    }

    /// The erroring result of a failed command.
    pub fn result(&self) -> Option<&PgResult> {
        match self {
            Error::Command(err) => err.result.as_ref(),
            _ => None,
        }
    }
}

impl<Src: std::fmt::Debug, Dst: std::fmt::Debug + ?Sized>
    From<zerocopy::error::CastError<Src, Dst>> for Error
{
    fn from(err: zerocopy::error::CastError<Src, Dst>) -> Self {
        Error::Protocol(format!("zerocopy cast error: {err:?}"))
    }
}

impl<Src: std::fmt::Debug, Dst: std::fmt::Debug + ?Sized>
    From<zerocopy::error::SizeError<Src, Dst>> for Error
{
    fn from(err: zerocopy::error::SizeError<Src, Dst>) -> Self {
        Error::Protocol(format!("zerocopy size error: {err:?}"))
    }
}

impl From<std::convert::Infallible> for Error {
    fn from(err: std::convert::Infallible) -> Self {
        match err {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ErrorFields {
        ErrorFields {
            severity: Some("ERROR".into()),
            code: Some("42P01".into()),
            message: Some("relation \"missing\" does not exist".into()),
            position: Some(15),
            hint: Some("Check the spelling.".into()),
            file: Some("parse_relation.c".into()),
            line: Some(1392),
            routine: Some("parserOpenTable".into()),
            ..ErrorFields::default()
        }
    }

    #[test]
    fn render_terse() {
        assert_eq!(
            sample().render(Verbosity::Terse),
            "ERROR:  relation \"missing\" does not exist at character 15\n"
        );
    }

    #[test]
    fn render_default_includes_hint() {
        let text = sample().render(Verbosity::Default);
        assert!(text.contains("HINT:  Check the spelling.\n"));
        assert!(!text.contains("42P01"));
    }

    #[test]
    fn render_verbose_includes_code_and_location() {
        let text = sample().render(Verbosity::Verbose);
        assert!(text.starts_with("ERROR:  42P01: relation"));
        assert!(text.ends_with("LOCATION:  parserOpenTable, parse_relation.c:1392\n"));
    }

    #[test]
    fn field_lookup_by_code() {
        let fields = sample();
        assert_eq!(fields.get(b'C').as_deref(), Some("42P01"));
        assert_eq!(fields.get(b'P').as_deref(), Some("15"));
        assert_eq!(fields.get(b'Z'), None);
    }
}

//! Notices, notifications and the per-connection receiver slot.

use crate::error::{ErrorFields, Verbosity};
use crate::state::action::AsyncMessage;

/// A NOTIFY payload delivered to this session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// Channel name
    pub relname: String,
    /// Process id of the notifying backend
    pub be_pid: u32,
    /// Payload string (may be empty)
    pub extra: String,
}

/// A server notice or warning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub fields: ErrorFields,
    /// Rendered at the connection's verbosity
    pub message: String,
}

impl Notice {
    pub(crate) fn new(fields: ErrorFields, verbosity: Verbosity) -> Self {
        let message = fields.render(verbosity);
        Self { fields, message }
    }

    pub fn severity(&self) -> &str {
        self.fields
            .severity_non_localized
            .as_deref()
            .or(self.fields.severity.as_deref())
            .unwrap_or("NOTICE")
    }
}

/// Callback invoked synchronously for every out-of-band message parsed while
/// reading input.
pub trait AsyncMessageHandler: Send {
    fn handle(&mut self, msg: &AsyncMessage);
}

impl<F: FnMut(&AsyncMessage) + Send> AsyncMessageHandler for F {
    fn handle(&mut self, msg: &AsyncMessage) {
        self(msg)
    }
}

/// Boxed receiver held in a connection's single receiver slot.
pub type NoticeReceiver = Box<dyn AsyncMessageHandler>;

/// Callback given the rendered text of each notice.
pub type NoticeProcessor = Box<dyn FnMut(&str) + Send>;

/// Receiver every connection starts with; forwards to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingReceiver;

impl AsyncMessageHandler for LoggingReceiver {
    fn handle(&mut self, msg: &AsyncMessage) {
        match msg {
            AsyncMessage::Notice(notice) => match notice.severity() {
                "WARNING" => tracing::warn!("{}", notice.message.trim_end()),
                _ => tracing::info!("{}", notice.message.trim_end()),
            },
            AsyncMessage::Notification(n) => {
                tracing::debug!(channel = %n.relname, pid = n.be_pid, "notification received");
            }
            AsyncMessage::ParameterChanged { name, value } => {
                tracing::debug!(%name, %value, "server parameter changed");
            }
        }
    }
}

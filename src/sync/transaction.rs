//! Transaction support for the blocking adapter.

use crate::conn::{Conn, TransactionStatus};
use crate::error::Error;

impl Conn {
    /// Run `f` inside `BEGIN` ... `COMMIT`.
    ///
    /// If `f` returns an error, `ROLLBACK` is sent and that same error is
    /// returned. A failing `ROLLBACK` is logged, not reported, so the
    /// original error is never masked.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidUsage` if a transaction is already open.
    pub fn transaction<T, E, F>(&mut self, f: F) -> std::result::Result<T, E>
    where
        F: FnOnce(&mut Conn) -> std::result::Result<T, E>,
        E: From<Error>,
    {
        if self.transaction_status() != TransactionStatus::Idle {
            return Err(Error::InvalidUsage("nested transactions are not supported".into()).into());
        }

        self.exec("BEGIN")?;

        match f(self) {
            Ok(value) => {
                self.exec("COMMIT")?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback) = self.exec("ROLLBACK") {
                    tracing::warn!(error = %rollback, "ROLLBACK after a failed transaction block failed");
                }
                Err(err)
            }
        }
    }
}

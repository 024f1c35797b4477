//! COPY streaming.

use crate::error::{Error, Result};
use crate::protocol::backend::{RawMessage, msg_type};
use crate::protocol::codec::split_message;
use crate::state::PipelineState;
use crate::transport::Interest;

use super::Conn;

/// Queued output beyond which non-blocking COPY writes report `false`.
const COPY_BUFFER_LIMIT: usize = 64 * 1024;

/// One step of [`Conn::get_copy_data`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CopyData {
    /// The payload of one CopyData message, usually one row
    Data(Vec<u8>),
    /// COPY-out is over; fetch the command result with `get_result`
    Done,
    /// Nothing complete is buffered yet
    WouldBlock,
}

impl Conn {
    fn copy_in_room(&mut self, extra: usize) -> Result<bool> {
        if !self.nonblocking || self.outbuf.len() + extra <= COPY_BUFFER_LIMIT {
            return Ok(true);
        }
        self.flush()?;
        Ok(self.outbuf.is_empty() || self.outbuf.len() + extra <= COPY_BUFFER_LIMIT)
    }

    /// Send a chunk of COPY FROM STDIN data.
    ///
    /// `Ok(false)` means the data was not queued because the connection is
    /// non-blocking and the output buffer is full; wait for writability and
    /// retry.
    pub fn put_copy_data(&mut self, data: &[u8]) -> Result<bool> {
        self.check_ready()?;
        // An ErrorResponse may already have ended the COPY.
        self.parse_or_lose()?;
        if self.pipeline.state() != PipelineState::CopyIn {
            return Err(Error::InvalidUsage("no COPY in progress".into()));
        }
        if !self.copy_in_room(data.len() + 5)? {
            return Ok(false);
        }
        let start = self.outbuf.len();
        self.pipeline.copy_data(&mut self.outbuf, data)?;
        self.trace_output(start);
        self.send_output()?;
        Ok(true)
    }

    /// Finish COPY FROM STDIN, or abort it with `error`.
    ///
    /// Afterwards collect the command's result with [`Conn::get_result`].
    pub fn put_copy_end(&mut self, error: Option<&str>) -> Result<bool> {
        self.check_ready()?;
        self.parse_or_lose()?;
        if self.pipeline.state() != PipelineState::CopyIn {
            return Err(Error::InvalidUsage("no COPY in progress".into()));
        }
        let needed = 5 + error.map_or(0, |e| e.len() + 1);
        if !self.copy_in_room(needed)? {
            return Ok(false);
        }
        let start = self.outbuf.len();
        self.pipeline.copy_end(&mut self.outbuf, error)?;
        self.trace_output(start);
        self.send_output()?;
        Ok(true)
    }

    /// Receive the next chunk of COPY TO STDOUT data.
    ///
    /// With `nonblocking` set this never waits and returns
    /// [`CopyData::WouldBlock`] until [`Conn::consume_input`] has buffered a
    /// complete message.
    pub fn get_copy_data(&mut self, nonblocking: bool) -> Result<CopyData> {
        self.check_ready()?;
        loop {
            if let Some(data) = self.next_copy_message()? {
                return Ok(data);
            }
            if nonblocking {
                return Ok(CopyData::WouldBlock);
            }
            self.wait_socket(Interest::Read, None)?;
            self.consume_input()?;
        }
    }

    fn next_copy_message(&mut self) -> Result<Option<CopyData>> {
        if self.pipeline.state() != PipelineState::CopyOut {
            return Err(Error::InvalidUsage("no COPY in progress".into()));
        }
        loop {
            let Some((type_byte, payload, len)) = split_message(&self.inbuf[self.in_start..])? else {
                return Ok(None);
            };
            self.in_start += len;
            self.session.trace_message("From backend", type_byte, len);
            let msg = RawMessage::new(type_byte, payload);
            if type_byte == msg_type::COPY_DATA {
                return Ok(Some(CopyData::Data(payload.to_vec())));
            }
            if msg.is_async() {
                self.session.on_async(msg)?;
                continue;
            }
            self.pipeline.copy_out_finished();
            if type_byte != msg_type::COPY_DONE {
                // ErrorResponse, or the command finished without CopyDone.
                if let Err(err) = self.pipeline.handle(msg) {
                    self.connection_lost(&err.to_string());
                    return Err(err);
                }
            }
            break;
        }
        self.parse_or_lose()?;
        Ok(Some(CopyData::Done))
    }
}

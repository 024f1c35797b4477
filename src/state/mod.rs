//! Sans-I/O state machines.
//!
//! Each machine consumes framed backend messages and appends frontend bytes to
//! an output buffer owned by the driver. None of them touches a socket.

pub mod action;
pub mod pipeline;
pub mod startup;

pub use action::{AsyncMessage, PollStatus};
pub use pipeline::{CommandPipeline, PipelineState, QueryClass};
pub use startup::{SslResponse, StartupMachine, StartupPhase, Step};

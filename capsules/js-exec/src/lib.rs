//! JavaScript execution capsule.
//!
//! This crate is the half of the sandbox that runs *inside* the worker process.
//! The service re-executes itself with the `worker` subcommand for every request;
//! that process reads the program from stdin, calls [`run_program`], and exits.
//!
//! The only capability handed to the program is `console.log`. Each call is
//! streamed to the supervisor as a [`Frame::Log`] the moment it happens, and the
//! run ends with exactly one [`Frame::Done`] carrying the [`Report`].

pub mod protocol;
pub mod worker;

pub use protocol::{
    decode_frame, encode_frame, Frame, GraphNode, ProtocolError, Report, ValueGraph,
    MAX_FRAME_BYTES,
};
pub use worker::{run_program, WorkerError, WorkerOptions};

//! Wire format between the sandbox supervisor and a worker process.
//!
//! The worker writes newline-delimited JSON objects to its stdout. The
//! supervisor treats that stream as untrusted input: every frame is size-capped
//! and parsed into the closed types below before anything else looks at it.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Upper bound on a single frame, newline included.
pub const MAX_FRAME_BYTES: usize = 8 * 1024 * 1024;

/// One message from the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    /// One `console.log` call, arguments already joined with a single space.
    Log { line: String },
    /// Final frame of a run.
    Done { report: Report },
}

/// How the program ended, as seen from inside the isolate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Report {
    /// The script ran to completion; `value` is its completion value.
    Completed { value: ValueGraph },
    /// The script ran to completion but its value could not be captured
    /// (a getter threw, the value was too large, ...).
    Unserializable { message: String },
    /// The script threw, or the isolate was terminated.
    Failed { message: String },
}

/// A captured JavaScript value.
///
/// Objects are stored once and referenced by index, so shared substructure and
/// reference cycles survive the trip across the process boundary instead of
/// blowing up the worker. Resolving them is the supervisor's job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueGraph {
    pub root: usize,
    pub nodes: Vec<GraphNode>,
}

impl ValueGraph {
    pub fn new(root: usize, nodes: Vec<GraphNode>) -> Self {
        Self { root, nodes }
    }

    /// A graph holding a single scalar node.
    pub fn scalar(node: GraphNode) -> Self {
        Self {
            root: 0,
            nodes: vec![node],
        }
    }

    pub fn node(&self, index: usize) -> Option<&GraphNode> {
        self.nodes.get(index)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", rename_all = "snake_case")]
pub enum GraphNode {
    Undefined,
    Null,
    Bool {
        v: bool,
    },
    /// `None` for NaN and the infinities, which JSON has no spelling for.
    Num {
        v: Option<f64>,
    },
    Str {
        v: String,
    },
    Arr {
        items: Vec<usize>,
    },
    Obj {
        entries: Vec<(String, usize)>,
    },
    Function,
    Symbol,
    Bigint,
}

impl GraphNode {
    /// Name used in fallback messages for values JSON cannot hold.
    pub fn kind(&self) -> &'static str {
        match self {
            GraphNode::Undefined => "undefined",
            GraphNode::Null => "null",
            GraphNode::Bool { .. } => "boolean",
            GraphNode::Num { .. } => "number",
            GraphNode::Str { .. } => "string",
            GraphNode::Arr { .. } => "array",
            GraphNode::Obj { .. } => "object",
            GraphNode::Function => "function",
            GraphNode::Symbol => "symbol",
            GraphNode::Bigint => "bigint",
        }
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("frame exceeds {limit} bytes")]
    Oversized { limit: usize },

    #[error("stream ended inside a frame")]
    Truncated,

    #[error("failed to read frame: {0}")]
    Io(#[from] std::io::Error),
}

/// Serialize a frame, trailing newline included.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = serde_json::to_vec(frame)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Parse one frame. A single trailing newline is allowed.
pub fn decode_frame(bytes: &[u8]) -> Result<Frame, ProtocolError> {
    if bytes.len() > MAX_FRAME_BYTES {
        return Err(ProtocolError::Oversized {
            limit: MAX_FRAME_BYTES,
        });
    }
    let body = bytes.strip_suffix(b"\n").unwrap_or(bytes);
    Ok(serde_json::from_slice(body)?)
}

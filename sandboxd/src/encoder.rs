//! Turns an execution outcome and its logs into the response body.
//!
//! The worker reports the completion value as a graph that may contain cycles,
//! shared objects and values JSON has no room for. Encoding never fails: every
//! problem becomes `null` in the result plus a `Warning: ...` log entry.

use std::fmt::{self, Display};

use capsules_js_exec::{GraphNode, ValueGraph};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::sandbox::{CapturedValue, ExecutionOutcome};

/// Largest integer magnitude that round-trips through an f64.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

/// Warnings about individual values beyond this many are folded into one entry.
const MAX_VALUE_WARNINGS: usize = 16;

/// Deepest nesting the encoder will walk, whatever the configured limit.
/// Building the result recurses once per level.
pub const MAX_SUPPORTED_DEPTH: usize = 1024;

/// Response body for every request, success or not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResponse {
    pub result: Value,
    pub logs: Vec<String>,
}

impl ExecutionResponse {
    /// A body carrying only an error entry.
    pub fn error(message: impl Display) -> Self {
        Self {
            result: Value::Null,
            logs: vec![format!("Error: {message}")],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderLimits {
    pub max_depth: usize,
    pub max_nodes: usize,
}

impl EncoderLimits {
    /// The configured depth limit, capped at [`MAX_SUPPORTED_DEPTH`].
    pub fn depth(&self) -> usize {
        self.max_depth.min(MAX_SUPPORTED_DEPTH)
    }
}

impl Default for EncoderLimits {
    fn default() -> Self {
        Self {
            max_depth: 256,
            max_nodes: 100_000,
        }
    }
}

pub fn encode(
    outcome: ExecutionOutcome,
    mut logs: Vec<String>,
    limits: &EncoderLimits,
) -> ExecutionResponse {
    let result = match outcome {
        ExecutionOutcome::Failed(message) => {
            logs.push(format!("Error: {message}"));
            Value::Null
        }
        ExecutionOutcome::Completed(CapturedValue::Uncapturable { reason }) => {
            logs.push(format!(
                "Warning: result could not be captured ({reason}); replaced with null"
            ));
            Value::Null
        }
        ExecutionOutcome::Completed(CapturedValue::Graph(graph)) => {
            let mut warnings = Warnings::default();
            let result = encode_graph(&graph, limits, &mut warnings);
            logs.extend(warnings.into_entries());
            result
        }
    };
    ExecutionResponse { result, logs }
}

fn encode_graph(graph: &ValueGraph, limits: &EncoderLimits, warnings: &mut Warnings) -> Value {
    match find_cycle(graph) {
        Ok(()) => {}
        Err(GraphFault::Cycle(path)) => {
            warnings.push_fatal(format!(
                "Warning: result contains a circular reference at {path}; replaced with null"
            ));
            return Value::Null;
        }
        Err(GraphFault::Dangling(index)) => {
            warnings.push_fatal(format!(
                "Warning: result references missing value #{index}; replaced with null"
            ));
            return Value::Null;
        }
    }

    let mut builder = Builder {
        graph,
        limits,
        warnings,
        emitted: 0,
        path: Path::default(),
    };
    match builder.build(graph.root, 0) {
        Ok(value) => value.unwrap_or(Value::Null),
        Err(exceeded) => {
            let message = match exceeded {
                LimitExceeded::Depth => format!(
                    "Warning: result nests deeper than {} levels; replaced with null",
                    limits.depth()
                ),
                LimitExceeded::Nodes => format!(
                    "Warning: result has more than {} values; replaced with null",
                    limits.max_nodes
                ),
            };
            builder.warnings.push_fatal(message);
            Value::Null
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Segment {
    Index(usize),
    Key(String),
}

/// Location inside the result, rendered like a JavaScript accessor chain.
#[derive(Debug, Clone, Default, PartialEq)]
struct Path(Vec<Segment>);

impl Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("result")?;
        for segment in &self.0 {
            match segment {
                Segment::Index(i) => write!(f, "[{i}]")?,
                Segment::Key(key) if is_identifier(key) => write!(f, ".{key}")?,
                Segment::Key(key) => write!(f, "[{}]", Value::String(key.clone()))?,
            }
        }
        Ok(())
    }
}

fn is_identifier(key: &str) -> bool {
    let mut chars = key.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

#[derive(Debug, PartialEq)]
enum GraphFault {
    Cycle(Path),
    Dangling(usize),
}

#[derive(Clone, Copy, PartialEq)]
enum Colour {
    White,
    Grey,
    Black,
}

fn children(node: &GraphNode) -> Vec<(Segment, usize)> {
    match node {
        GraphNode::Arr { items } => items
            .iter()
            .enumerate()
            .map(|(i, child)| (Segment::Index(i), *child))
            .collect(),
        GraphNode::Obj { entries } => entries
            .iter()
            .map(|(key, child)| (Segment::Key(key.clone()), *child))
            .collect(),
        _ => Vec::new(),
    }
}

/// Depth-first search for a back edge, without recursion. Shared substructure
/// (an object reachable along two paths) is fine; only a path that returns to
/// one of its own ancestors is a cycle.
fn find_cycle(graph: &ValueGraph) -> Result<(), GraphFault> {
    let nodes = &graph.nodes;
    if graph.root >= nodes.len() {
        return Err(GraphFault::Dangling(graph.root));
    }

    let mut colour = vec![Colour::White; nodes.len()];
    // (node, its children, next child to visit)
    let mut stack = vec![(graph.root, children(&nodes[graph.root]), 0usize)];
    let mut path = Path::default();
    colour[graph.root] = Colour::Grey;

    while let Some((node, edges, next)) = stack.last_mut() {
        let Some((segment, child)) = edges.get(*next).cloned() else {
            colour[*node] = Colour::Black;
            stack.pop();
            path.0.pop();
            continue;
        };
        *next += 1;

        if child >= nodes.len() {
            return Err(GraphFault::Dangling(child));
        }
        match colour[child] {
            Colour::Grey => {
                path.0.push(segment);
                return Err(GraphFault::Cycle(path));
            }
            Colour::Black => {}
            Colour::White => {
                colour[child] = Colour::Grey;
                path.0.push(segment);
                stack.push((child, children(&nodes[child]), 0));
            }
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum LimitExceeded {
    Depth,
    Nodes,
}

struct Builder<'a> {
    graph: &'a ValueGraph,
    limits: &'a EncoderLimits,
    warnings: &'a mut Warnings,
    emitted: usize,
    path: Path,
}

impl Builder<'_> {
    /// `Ok(None)` is `undefined`: omitted from objects, `null` elsewhere.
    ///
    /// Only called on an acyclic graph with in-range indices.
    fn build(&mut self, index: usize, depth: usize) -> Result<Option<Value>, LimitExceeded> {
        self.emitted += 1;
        if self.emitted > self.limits.max_nodes {
            return Err(LimitExceeded::Nodes);
        }
        let graph = self.graph;
        let Some(node) = graph.node(index) else {
            return Ok(Some(Value::Null));
        };

        let value = match node {
            GraphNode::Undefined => return Ok(None),
            GraphNode::Null => Value::Null,
            GraphNode::Bool { v } => Value::Bool(*v),
            GraphNode::Num { v } => v.map(number_value).unwrap_or(Value::Null),
            GraphNode::Str { v } => Value::String(v.clone()),
            GraphNode::Function | GraphNode::Symbol | GraphNode::Bigint => {
                self.warnings.push(format!(
                    "Warning: {} is a {} and cannot be represented; replaced with null",
                    self.path,
                    node.kind()
                ));
                Value::Null
            }
            GraphNode::Arr { items } => {
                if depth >= self.limits.depth() {
                    return Err(LimitExceeded::Depth);
                }
                let mut array = Vec::with_capacity(items.len());
                for (i, item) in items.iter().enumerate() {
                    self.path.0.push(Segment::Index(i));
                    let value = self.build(*item, depth + 1)?;
                    self.path.0.pop();
                    array.push(value.unwrap_or(Value::Null));
                }
                Value::Array(array)
            }
            GraphNode::Obj { entries } => {
                if depth >= self.limits.depth() {
                    return Err(LimitExceeded::Depth);
                }
                let mut object = Map::new();
                for (key, child) in entries {
                    self.path.0.push(Segment::Key(key.clone()));
                    let value = self.build(*child, depth + 1)?;
                    self.path.0.pop();
                    if let Some(value) = value {
                        object.insert(key.clone(), value);
                    }
                }
                Value::Object(object)
            }
        };
        Ok(Some(value))
    }
}

/// Integral values in the safe range are emitted as integers (`42`, not `42.0`).
fn number_value(v: f64) -> Value {
    if v.fract() == 0.0 && v.abs() <= MAX_SAFE_INTEGER {
        return Value::from(v as i64);
    }
    Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null)
}

#[derive(Default)]
struct Warnings {
    entries: Vec<String>,
    suppressed: usize,
}

impl Warnings {
    fn push(&mut self, entry: String) {
        if self.entries.len() < MAX_VALUE_WARNINGS {
            self.entries.push(entry);
        } else {
            self.suppressed += 1;
        }
    }

    /// A warning about the whole result; replaces any per-value warnings,
    /// since the values they describe were discarded.
    fn push_fatal(&mut self, entry: String) {
        self.entries.clear();
        self.suppressed = 0;
        self.entries.push(entry);
    }

    fn into_entries(mut self) -> Vec<String> {
        if self.suppressed > 0 {
            self.entries.push(format!(
                "Warning: {} more values could not be represented",
                self.suppressed
            ));
        }
        self.entries
    }
}

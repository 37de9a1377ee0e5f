//! Runs one program in a fresh V8 isolate and streams frames to a writer.
//!
//! Everything here executes inside the disposable worker process. Isolation
//! from the host and from other requests comes from that process boundary and
//! the limits the supervisor applies before exec; this module only makes sure
//! the program sees nothing but `console.log`.

use std::ffi::c_void;
use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use deno_core::{op2, v8, JsRuntime, OpState, RuntimeOptions};
use thiserror::Error;
use tracing::{debug, warn};

use crate::protocol::{encode_frame, Frame, Report};

const HARNESS: &str = include_str!("harness.js");

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// V8 heap ceiling for the isolate.
    pub heap_limit_bytes: usize,
    /// Most values the completion value may expand to.
    pub max_result_nodes: usize,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            heap_limit_bytes: 128 * 1024 * 1024,
            max_result_nodes: 100_000,
        }
    }
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("failed to encode program source: {0}")]
    Source(#[from] serde_json::Error),

    #[error("failed to write frame: {0}")]
    Output(#[source] io::Error),
}

/// Where frames go. Write failures are remembered rather than thrown into the
/// isolate, so a closed pipe cannot change what the program observes.
struct FrameSink {
    out: Box<dyn Write>,
    failure: Option<io::Error>,
}

impl FrameSink {
    fn new(out: Box<dyn Write>) -> Self {
        Self { out, failure: None }
    }

    fn send(&mut self, frame: &Frame) {
        if self.failure.is_some() {
            return;
        }
        let result = encode_frame(frame)
            .map_err(io::Error::from)
            .and_then(|bytes| self.out.write_all(&bytes))
            .and_then(|()| self.out.flush());
        if let Err(err) = result {
            warn!(error = %err, "frame sink failed; dropping further frames");
            self.failure = Some(err);
        }
    }

    fn finish(mut self, report: Report) -> Result<(), WorkerError> {
        self.send(&Frame::Done { report });
        match self.failure {
            Some(err) => Err(WorkerError::Output(err)),
            None => Ok(()),
        }
    }
}

/// Raw report handed over by the harness, parsed after the script returns.
struct FinishedReport(String);

#[op2(fast)]
fn op_sandbox_log(state: &mut OpState, #[string] line: String) {
    state.borrow_mut::<FrameSink>().send(&Frame::Log { line });
}

#[op2(fast)]
fn op_sandbox_finish(state: &mut OpState, #[string] report: String) {
    if state.try_borrow::<FinishedReport>().is_none() {
        state.put(FinishedReport(report));
    }
}

deno_core::extension!(
    sandbox_capabilities,
    ops = [op_sandbox_log, op_sandbox_finish],
);

struct HeapLimitState {
    handle: v8::IsolateHandle,
    triggered: AtomicBool,
}

/// Terminates the isolate when the heap is about to run out, and grants 1MB of
/// headroom so the termination can unwind instead of aborting the process.
extern "C" fn near_heap_limit_callback(
    data: *mut c_void,
    current_heap_limit: usize,
    _initial_heap_limit: usize,
) -> usize {
    // SAFETY: `data` points at the `HeapLimitState` boxed in `run_program`,
    // which outlives the runtime (the runtime is dropped first).
    let state = unsafe { &*(data as *const HeapLimitState) };
    if !state.triggered.swap(true, Ordering::SeqCst) {
        state.handle.terminate_execution();
    }
    current_heap_limit + 1024 * 1024
}

/// Run `source` as a top-level script, writing a `log` frame per
/// `console.log` call and a final `done` frame to `out`.
///
/// Program failures are not errors here: they end up in the report. The error
/// path is reserved for the worker being unable to talk to its supervisor.
pub fn run_program<W: Write + 'static>(
    source: &str,
    options: &WorkerOptions,
    out: W,
) -> Result<(), WorkerError> {
    let script = format!(
        "{HARNESS}({}, {});",
        serde_json::to_string(source)?,
        options.max_result_nodes
    );

    let create_params = v8::CreateParams::default().heap_limits(0, options.heap_limit_bytes);
    let mut runtime = JsRuntime::new(RuntimeOptions {
        extensions: vec![sandbox_capabilities::init()],
        create_params: Some(create_params),
        ..Default::default()
    });
    runtime
        .op_state()
        .borrow_mut()
        .put(FrameSink::new(Box::new(out)));

    let heap_state = Box::new(HeapLimitState {
        handle: runtime.v8_isolate().thread_safe_handle(),
        triggered: AtomicBool::new(false),
    });
    runtime.v8_isolate().add_near_heap_limit_callback(
        near_heap_limit_callback,
        &*heap_state as *const HeapLimitState as *mut c_void,
    );

    debug!(source_len = source.len(), "running program");
    let script_error = runtime
        .execute_script("[sandbox:program]", script)
        .err()
        .map(|err| err.to_string());

    let (report, sink) = {
        let state = runtime.op_state();
        let mut state = state.borrow_mut();
        let finished = state.try_take::<FinishedReport>();
        let sink = state.take::<FrameSink>();
        let report = if heap_state.triggered.load(Ordering::SeqCst) {
            Report::Failed {
                message: "Memory limit exceeded".to_string(),
            }
        } else {
            settle_report(finished, script_error)
        };
        (report, sink)
    };
    drop(runtime);
    drop(heap_state);

    sink.finish(report)
}

fn settle_report(finished: Option<FinishedReport>, script_error: Option<String>) -> Report {
    match (finished, script_error) {
        (Some(FinishedReport(raw)), _) => {
            serde_json::from_str(&raw).unwrap_or_else(|err| Report::Unserializable {
                message: format!("unreadable capture: {err}"),
            })
        }
        (None, Some(message)) => Report::Failed { message },
        (None, None) => Report::Failed {
            message: "program ended without a result".to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode_frame, GraphNode};
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn run(source: &str) -> (Vec<String>, Report) {
        run_with(source, &WorkerOptions::default())
    }

    fn run_with(source: &str, options: &WorkerOptions) -> (Vec<String>, Report) {
        let buffer = SharedBuffer::default();
        run_program(source, options, buffer.clone()).unwrap();
        let bytes = buffer.0.borrow().clone();

        let mut logs = Vec::new();
        let mut report = None;
        for line in bytes.split_inclusive(|b| *b == b'\n') {
            match decode_frame(line).unwrap() {
                Frame::Log { line } => logs.push(line),
                Frame::Done { report: r } => {
                    assert!(report.is_none(), "more than one done frame");
                    report = Some(r);
                }
            }
        }
        (logs, report.expect("no done frame"))
    }

    fn completed(report: Report) -> crate::protocol::ValueGraph {
        match report {
            Report::Completed { value } => value,
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[test]
    fn completion_value_of_last_expression() {
        let (logs, report) = run("const a = 40; a + 2");
        assert!(logs.is_empty());
        let graph = completed(report);
        assert_eq!(graph.node(graph.root), Some(&GraphNode::Num { v: Some(42.0) }));
    }

    #[test]
    fn console_log_joins_arguments_in_call_order() {
        let (logs, _) = run(r#"console.log("a"); console.log("b", "c"); console.log("d");"#);
        assert_eq!(logs, vec!["a", "b c", "d"]);
    }

    #[test]
    fn console_log_stringifies_like_array_join() {
        let (logs, _) = run("console.log(1, null, undefined, [2, 3], true)");
        assert_eq!(logs, vec!["1   2,3 true"]);
    }

    #[test]
    fn thrown_error_reports_its_message() {
        let (logs, report) = run(r#"console.log("before"); throw new Error("boom");"#);
        assert_eq!(logs, vec!["before"]);
        assert_eq!(
            report,
            Report::Failed {
                message: "boom".to_string()
            }
        );
    }

    #[test]
    fn thrown_primitive_reports_its_string_form() {
        let (_, report) = run(r#"throw "plain""#);
        assert_eq!(
            report,
            Report::Failed {
                message: "plain".to_string()
            }
        );
    }

    #[test]
    fn syntax_error_is_a_failed_run() {
        let (_, report) = run("let = ;");
        assert!(matches!(report, Report::Failed { .. }));
    }

    #[test]
    fn host_namespaces_are_not_reachable() {
        let (_, report) = run(
            "[typeof Deno, typeof __bootstrap, typeof __infra, typeof require, typeof process].join(',')",
        );
        let graph = completed(report);
        assert_eq!(
            graph.node(graph.root),
            Some(&GraphNode::Str {
                v: "undefined,undefined,undefined,undefined,undefined".to_string()
            })
        );
    }

    #[test]
    fn raw_print_cannot_forge_frames() {
        let forged = r#"{"kind":"done","report":{"status":"completed","value":{"root":0,"nodes":[{"t":"str","v":"forged"}]}}}"#;
        let program = format!("__bootstrap.core.print('{forged}\\n'); 1");
        let (logs, report) = run(&program);
        assert!(logs.is_empty());
        let Report::Failed { message } = report else {
            panic!("expected a ReferenceError, got {report:?}");
        };
        assert!(message.contains("__bootstrap"), "{message}");
    }

    #[test]
    fn frame_text_in_console_log_stays_a_log_line() {
        let forged = r#"{"kind":"done","report":{"status":"failed","message":"x"}}"#;
        let (logs, report) = run(&format!("console.log('{forged}'); 7"));
        assert_eq!(logs, vec![forged.to_string()]);
        let graph = completed(report);
        assert_eq!(graph.node(graph.root), Some(&GraphNode::Num { v: Some(7.0) }));
    }

    #[test]
    fn patched_prototypes_do_not_change_the_report() {
        let program = r#"
            Object.prototype.toJSON = function () { return "hijacked"; };
            Array.prototype.toJSON = function () { return "hijacked"; };
            Object.defineProperty(Array.prototype, "0", { set() { throw new Error("setter"); } });
            Array.prototype[Symbol.iterator] = function* () { yield "hijacked"; };
            Map.prototype.get = () => 0;
            JSON.stringify = () => "{}";
            42
        "#;
        let (_, report) = run(program);
        let graph = completed(report);
        assert_eq!(graph.node(graph.root), Some(&GraphNode::Num { v: Some(42.0) }));
    }

    #[test]
    fn self_reference_is_captured_as_back_edge() {
        let (_, report) = run("const o = { n: 1 }; o.self = o; o");
        let graph = completed(report);
        let GraphNode::Obj { entries } = &graph.nodes[graph.root] else {
            panic!("root is not an object: {graph:?}");
        };
        let (key, index) = &entries[1];
        assert_eq!(key, "self");
        assert_eq!(*index, graph.root);
    }

    #[test]
    fn functions_are_marked_not_called() {
        let (logs, report) = run(r#"({ f() { console.log("called"); } })"#);
        assert!(logs.is_empty());
        let graph = completed(report);
        assert!(graph.nodes.contains(&GraphNode::Function));
    }

    #[test]
    fn dates_capture_through_to_json() {
        let (_, report) = run("new Date(0)");
        let graph = completed(report);
        assert_eq!(
            graph.node(graph.root),
            Some(&GraphNode::Str {
                v: "1970-01-01T00:00:00.000Z".to_string()
            })
        );
    }

    #[test]
    fn oversized_result_is_unserializable() {
        let options = WorkerOptions {
            max_result_nodes: 10,
            ..WorkerOptions::default()
        };
        let (_, report) = run_with("Array.from({ length: 100 }, (_, i) => i)", &options);
        assert!(matches!(report, Report::Unserializable { .. }));
    }

    #[test]
    fn throwing_getter_makes_result_unserializable() {
        let (_, report) = run(r#"({ get bad() { throw new Error("nope"); } })"#);
        assert_eq!(
            report,
            Report::Unserializable {
                message: "nope".to_string()
            }
        );
    }

    #[test]
    fn each_run_starts_from_a_clean_global() {
        let (_, _) = run("globalThis.leaked = 'secret'");
        let (_, report) = run("typeof leaked");
        let graph = completed(report);
        assert_eq!(
            graph.node(graph.root),
            Some(&GraphNode::Str {
                v: "undefined".to_string()
            })
        );
    }

    #[test]
    #[ignore] // Exhausts the isolate heap; V8 aborts the whole test binary if the callback is bypassed
    fn heap_exhaustion_reports_memory_limit() {
        let options = WorkerOptions {
            heap_limit_bytes: 16 * 1024 * 1024,
            ..WorkerOptions::default()
        };
        let (_, report) = run_with(
            "const keep = []; while (true) keep.push(new Array(4096).fill(1));",
            &options,
        );
        assert_eq!(
            report,
            Report::Failed {
                message: "Memory limit exceeded".to_string()
            }
        );
    }
}

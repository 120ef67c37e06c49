//! Wire protocol: the broker's duplex message channel.
//!
//! One JSON object per line in each direction. The tagged-union shapes are
//! kept exhaustive so the dispatcher's `match` is compiler-checked: adding a
//! request variant without a handler is a build error, not a silent drop.

use serde::{Deserialize, Serialize};

/// Requests sent by the controlling side to the broker.
///
/// `id` is a caller-chosen correlation token, unique per in-flight
/// execution. All events produced by one command carry the same id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    /// Negotiate sandbox availability (idempotent, see the init gate)
    Init,
    /// Execute a command line through the sandbox shell image,
    /// or the fallback interpreter when the sandbox is unavailable
    ExecProgram {
        id: String,
        cmd: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    /// Execute the entrypoint of a registry package (auto-installs)
    ExecPackage {
        id: String,
        /// Registry package name, e.g. "sharrattj/coreutils"
        package: String,
        /// Arguments passed to the package entrypoint
        args: Vec<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    /// Pre-install a package from the registry (response: PackageInstalled)
    InstallPackage { id: String, package: String },
    /// List cached package names
    ListPackages { id: String },
    /// Cancel a running execution (bypasses the command queue)
    CancelExec { id: String },
    /// Write to stdin of a running process (best-effort)
    WriteStdin { id: String, data: String },
}

impl Request {
    /// Correlation id, when the variant carries one.
    pub fn id(&self) -> Option<&str> {
        match self {
            Request::Init => None,
            Request::ExecProgram { id, .. }
            | Request::ExecPackage { id, .. }
            | Request::InstallPackage { id, .. }
            | Request::ListPackages { id }
            | Request::CancelExec { id }
            | Request::WriteStdin { id, .. } => Some(id),
        }
    }
}

/// Events emitted by the broker back to the controlling side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    /// Initialization concluded (successfully or degraded to fallback)
    Ready,
    /// stdout data from an execution
    Stdout { id: String, data: String },
    /// stderr data from an execution
    Stderr { id: String, data: String },
    /// Execution finished, terminal for its id
    ExitCode { id: String, code: i32 },
    /// A failure, terminal for its id when one is attached
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        message: String,
    },
    /// A package was installed (or was already cached)
    PackageInstalled {
        id: String,
        package: String,
        cached: bool,
    },
    /// Snapshot of cached package names
    PackageList { id: String, packages: Vec<String> },
}

impl Event {
    /// True for events that close out an execution id's lifecycle.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::ExitCode { .. } | Event::Error { id: Some(_), .. }
        )
    }
}

/// Decodes one inbound line. Unknown message types come back as `Err` so the
/// caller can log and ignore them without crashing (protocol policy).
pub fn decode_request(line: &str) -> Result<Request, serde_json::Error> {
    serde_json::from_str(line)
}

/// Encodes an event as a single JSON line (no trailing newline).
pub fn encode_event(event: &Event) -> String {
    // Event serialization cannot fail: no maps with non-string keys,
    // no non-finite floats.
    serde_json::to_string(event).unwrap_or_else(|e| {
        format!(r#"{{"type":"Error","message":"event encoding failed: {e}"}}"#)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_exec_program() {
        let req = decode_request(
            r#"{"type":"ExecProgram","id":"a1","cmd":"echo hi","timeout_ms":500}"#,
        )
        .unwrap();
        match req {
            Request::ExecProgram { id, cmd, timeout_ms } => {
                assert_eq!(id, "a1");
                assert_eq!(cmd, "echo hi");
                assert_eq!(timeout_ms, Some(500));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_decode_exec_program_without_timeout() {
        let req =
            decode_request(r#"{"type":"ExecProgram","id":"a1","cmd":"date"}"#).unwrap();
        match req {
            Request::ExecProgram { timeout_ms, .. } => assert_eq!(timeout_ms, None),
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn test_decode_unknown_type_is_error() {
        assert!(decode_request(r#"{"type":"SelfDestruct","id":"x"}"#).is_err());
        assert!(decode_request("not json at all").is_err());
    }

    #[test]
    fn test_request_id_accessor() {
        assert_eq!(Request::Init.id(), None);
        let req = Request::CancelExec { id: "k".into() };
        assert_eq!(req.id(), Some("k"));
    }

    #[test]
    fn test_encode_ready_and_exit() {
        assert_eq!(encode_event(&Event::Ready), r#"{"type":"Ready"}"#);
        let line = encode_event(&Event::ExitCode { id: "a".into(), code: 137 });
        assert_eq!(line, r#"{"type":"ExitCode","id":"a","code":137}"#);
    }

    #[test]
    fn test_error_event_omits_missing_id() {
        let line = encode_event(&Event::Error {
            id: None,
            message: "boom".into(),
        });
        assert!(!line.contains(r#""id""#));

        let line = encode_event(&Event::Error {
            id: Some("e1".into()),
            message: "boom".into(),
        });
        assert!(line.contains(r#""id":"e1""#));
    }

    #[test]
    fn test_terminal_classification() {
        assert!(Event::ExitCode { id: "a".into(), code: 0 }.is_terminal());
        assert!(Event::Error { id: Some("a".into()), message: "m".into() }.is_terminal());
        assert!(!Event::Error { id: None, message: "m".into() }.is_terminal());
        assert!(!Event::Stdout { id: "a".into(), data: "d".into() }.is_terminal());
        assert!(!Event::Ready.is_terminal());
    }
}

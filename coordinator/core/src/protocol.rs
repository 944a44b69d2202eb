//! Worker Frame Protocol
//!
//! Message vocabulary for the persistent bidirectional channel between the
//! coordinator and each worker node. Frames are self-describing records
//! discriminated by a `type` tag; a frame whose tag is unknown fails to
//! deserialize and is treated as a protocol error by the connection handler,
//! never silently ignored.
//!
//! Direction conventions:
//!
//! - [`NodeMessage`]: worker to coordinator (register, heartbeat, stream
//!   chunks, results, errors)
//! - [`CoordinatorMessage`]: coordinator to worker (acks, assignments,
//!   cancellations)
//!
//! Frame ordering per channel is preserved end to end; within a subtask a
//! worker's `task_stream` sequence numbers are monotonic and `task_result`
//! is the last frame that worker sends for the subtask.

use serde::{Deserialize, Serialize};

use crate::registry::NodeId;
use crate::tasks::TaskId;
use crate::tier::NodeTier;

/// Quantization level a worker's model is running at.
///
/// Quantization scales the declared parameter count into the *effective*
/// parameter count that tier derivation consumes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Quantization {
    /// 4-bit quantization (multiplier 1.0).
    #[default]
    Q4,
    /// 5-bit quantization (multiplier 1.1).
    Q5,
    /// 6-bit quantization (multiplier 1.2).
    Q6,
    /// 8-bit quantization (multiplier 1.4).
    Q8,
    /// Half-precision floating point (multiplier 1.6).
    F16,
}

impl Quantization {
    /// Multiplier applied to the declared parameter count.
    #[must_use]
    pub fn multiplier(&self) -> f64 {
        match self {
            Self::Q4 => 1.0,
            Self::Q5 => 1.1,
            Self::Q6 => 1.2,
            Self::Q8 => 1.4,
            Self::F16 => 1.6,
        }
    }
}

/// Capabilities a worker declares once at registration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeCapabilities {
    /// Model identifier as reported by the local model server.
    pub model_name: String,
    /// Parameter count in billions. Zero means unknown; the registry then
    /// falls back to parsing the model name.
    #[serde(default)]
    pub model_params: f64,
    /// Quantization level of the loaded model.
    #[serde(default)]
    pub quantization: Quantization,
    /// Declared VRAM in gigabytes.
    #[serde(default)]
    pub vram_gb: f64,
    /// Benchmarked generation speed in tokens per second.
    #[serde(default)]
    pub tokens_per_second: f64,
    /// Whether the model accepts image inputs.
    #[serde(default)]
    pub supports_vision: bool,
    /// Configured load penalty. Fallback nodes declare a non-zero offset to
    /// deprioritise themselves in selection; real workers declare 0.
    #[serde(default)]
    pub artificial_load_offset: u32,
}

/// A file the user attached to a request, forwarded to workers or to the
/// direct document processor.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileAttachment {
    /// Original file name.
    pub name: String,
    /// MIME type, e.g. `application/pdf` or `image/png`.
    pub media_type: String,
    /// Payload size in bytes.
    pub size_bytes: u64,
    /// Base64-encoded content.
    #[serde(default)]
    pub content_base64: String,
}

impl FileAttachment {
    /// Whether this attachment is an image.
    #[must_use]
    pub fn is_image(&self) -> bool {
        self.media_type.starts_with("image/")
    }

    /// Lower-cased extension of the file name, if any.
    #[must_use]
    pub fn extension(&self) -> Option<String> {
        self.name.rsplit_once('.').map(|(_, ext)| ext.to_lowercase())
    }
}

/// Failure categories a worker may report in `task_error`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerErrorKind {
    /// The model refused to answer the prompt.
    ModelRefused,
    /// Unspecified internal failure inside the worker.
    Internal,
    /// The worker ran out of memory while generating.
    OutOfMemory,
    /// The subtask carried an image but the model has no vision support.
    VisionUnsupported,
}

impl std::fmt::Display for WorkerErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::ModelRefused => "model_refused",
            Self::Internal => "internal",
            Self::OutOfMemory => "out_of_memory",
            Self::VisionUnsupported => "vision_unsupported",
        };
        write!(f, "{label}")
    }
}

/// Frames sent by workers to the coordinator.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeMessage {
    /// Registration handshake. Must be the first frame on a new channel.
    NodeRegister {
        /// Identity the worker claims.
        node_id: NodeId,
        /// Account proof (account key) authorising the registration.
        account_key: String,
        /// Declared hardware and model capabilities.
        capabilities: NodeCapabilities,
    },

    /// Periodic liveness report, expected every heartbeat interval.
    NodeHeartbeat {
        /// Identity of the reporting worker.
        node_id: NodeId,
        /// Number of subtasks the worker is currently processing.
        current_load: u32,
        /// Seconds the worker process has been up.
        uptime_seconds: u64,
        /// Fresh generation-speed measurement, if the worker re-benchmarked.
        #[serde(default)]
        tokens_per_second: Option<f64>,
    },

    /// A streaming chunk produced while generating a subtask response.
    TaskStream {
        /// Parent task.
        task_id: TaskId,
        /// Index of the subtask within the task.
        subtask_index: u32,
        /// Monotonic sequence number within this attempt.
        seq: u64,
        /// Generated text fragment.
        payload: String,
    },

    /// Final successful result for a subtask. Last frame for the subtask.
    TaskResult {
        /// Parent task.
        task_id: TaskId,
        /// Index of the subtask within the task.
        subtask_index: u32,
        /// Complete response text.
        payload: String,
        /// Wall-clock generation time measured by the worker.
        execution_time_ms: u64,
    },

    /// Terminal failure for a subtask.
    TaskError {
        /// Parent task.
        task_id: TaskId,
        /// Index of the subtask within the task.
        subtask_index: u32,
        /// Failure category.
        kind: WorkerErrorKind,
        /// Free-form description.
        detail: String,
    },
}

/// Frames sent by the coordinator to workers.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorMessage {
    /// Registration accepted.
    RegisterAck {
        /// Node id the registration was recorded under.
        node_id: NodeId,
        /// Tier derived from the declared capabilities.
        tier: NodeTier,
    },

    /// Registration rejected. The channel is closed after this frame.
    RegisterNack {
        /// Why the handshake was refused.
        reason: String,
    },

    /// Heartbeat acknowledgment, lets workers detect dead sockets.
    HeartbeatAck,

    /// Work assignment for one subtask.
    TaskAssign {
        /// Parent task.
        task_id: TaskId,
        /// Index of the subtask within the task.
        subtask_index: u32,
        /// Fragment prompt to run.
        prompt: String,
        /// Attachments relevant to the prompt.
        files: Vec<FileAttachment>,
        /// Whether the worker should emit `task_stream` chunks.
        streaming: bool,
        /// Attempt budget in milliseconds before the coordinator gives up.
        deadline_ms: u64,
    },

    /// Best-effort cancellation of an assigned subtask.
    TaskCancel {
        /// Parent task.
        task_id: TaskId,
        /// Index of the subtask within the task.
        subtask_index: u32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantization_multipliers() {
        assert!((Quantization::Q4.multiplier() - 1.0).abs() < f64::EPSILON);
        assert!((Quantization::Q8.multiplier() - 1.4).abs() < f64::EPSILON);
        assert!((Quantization::F16.multiplier() - 1.6).abs() < f64::EPSILON);
    }

    #[test]
    fn test_frame_tagging_roundtrip() {
        let msg = NodeMessage::TaskStream {
            task_id: TaskId::new("t1"),
            subtask_index: 2,
            seq: 7,
            payload: "hello".to_string(),
        };

        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"task_stream\""));

        let back: NodeMessage = serde_json::from_str(&json).unwrap();
        match back {
            NodeMessage::TaskStream { subtask_index, seq, .. } => {
                assert_eq!(subtask_index, 2);
                assert_eq!(seq, 7);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_frame_kind_rejected() {
        let raw = r#"{"type":"node_selfdestruct","node_id":"n1"}"#;
        let result: Result<NodeMessage, _> = serde_json::from_str(raw);
        assert!(result.is_err());
    }

    #[test]
    fn test_heartbeat_defaults() {
        let raw = r#"{"type":"node_heartbeat","node_id":"n1","current_load":1,"uptime_seconds":30}"#;
        let msg: NodeMessage = serde_json::from_str(raw).unwrap();
        match msg {
            NodeMessage::NodeHeartbeat { tokens_per_second, .. } => {
                assert!(tokens_per_second.is_none());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn test_attachment_helpers() {
        let pdf = FileAttachment {
            name: "Report.PDF".to_string(),
            media_type: "application/pdf".to_string(),
            size_bytes: 1024,
            content_base64: String::new(),
        };
        assert_eq!(pdf.extension().as_deref(), Some("pdf"));
        assert!(!pdf.is_image());

        let png = FileAttachment {
            name: "photo.png".to_string(),
            media_type: "image/png".to_string(),
            size_bytes: 10,
            content_base64: String::new(),
        };
        assert!(png.is_image());
    }
}

//! JSON frames exchanged over a kernel channel, discriminated by `type`.
use serde::{Deserialize, Serialize};

use crate::output::{DisplayKind, ExecutionStatus, MimeBundle, OutputEvent, StreamName};
use crate::sandbox::Language;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    ExecuteRequest(ExecuteRequest),
    InterruptRequest(InterruptRequest),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub cell_id: String,
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub language: Option<Language>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterruptRequest {
    #[serde(default)]
    pub notebook_id: Option<String>,
}

impl InboundFrame {
    /// Parses and validates one text message from the client.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let frame: InboundFrame =
            serde_json::from_str(raw).map_err(|e| format!("invalid frame: {e}"))?;
        if let InboundFrame::ExecuteRequest(request) = &frame {
            if request.cell_id.trim().is_empty() {
                return Err("execute_request requires a non-empty cellId".to_string());
            }
            if request.timeout_ms == Some(0) {
                return Err("timeoutMs must be greater than zero".to_string());
            }
        }
        Ok(frame)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KernelState {
    Idle,
    Busy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DisplayFrame {
    pub cell_id: String,
    pub data: MimeBundle,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorFrame {
    /// Absent for connection-level errors
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cell_id: Option<String>,
    pub ename: String,
    pub evalue: String,
    pub traceback: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum OutboundFrame {
    Hello {
        notebook_id: String,
        session_id: String,
    },
    Status {
        state: KernelState,
    },
    Stream {
        cell_id: String,
        name: StreamName,
        text: String,
    },
    DisplayData(DisplayFrame),
    ExecuteResult(DisplayFrame),
    UpdateDisplayData(DisplayFrame),
    Error(ErrorFrame),
    ExecuteReply {
        cell_id: String,
        status: ExecutionStatus,
        exec_time_ms: u64,
    },
}

impl OutboundFrame {
    pub fn status(state: KernelState) -> Self {
        OutboundFrame::Status { state }
    }

    pub fn error(cell_id: Option<&str>, ename: &str, evalue: impl Into<String>) -> Self {
        OutboundFrame::Error(ErrorFrame {
            cell_id: cell_id.map(str::to_string),
            ename: ename.to_string(),
            evalue: evalue.into(),
            traceback: Vec::new(),
        })
    }

    /// Frame for one execution output, tagged with the cell it belongs to.
    pub fn from_output(cell_id: &str, output: &OutputEvent) -> Self {
        match output {
            OutputEvent::Stream { name, text } => OutboundFrame::Stream {
                cell_id: cell_id.to_string(),
                name: *name,
                text: text.clone(),
            },
            OutputEvent::Display {
                data,
                metadata,
                kind,
                display_id,
            } => {
                let frame = DisplayFrame {
                    cell_id: cell_id.to_string(),
                    data: data.clone(),
                    metadata: metadata.clone(),
                    display_id: display_id.clone(),
                };
                match kind {
                    DisplayKind::DisplayData => OutboundFrame::DisplayData(frame),
                    DisplayKind::ExecuteResult => OutboundFrame::ExecuteResult(frame),
                    DisplayKind::UpdateDisplayData => OutboundFrame::UpdateDisplayData(frame),
                }
            }
            OutputEvent::Error(error) => OutboundFrame::Error(ErrorFrame {
                cell_id: Some(cell_id.to_string()),
                ename: error.name.clone(),
                evalue: error.message.clone(),
                traceback: error.traceback.clone(),
            }),
        }
    }
}

/// What a connection hands to its transport.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Frame(OutboundFrame),
    /// Close the connection with a WebSocket close code
    Close { code: u16, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::output::ErrorOutput;
    use serde_json::json;

    #[test]
    fn test_parse_execute_request() {
        let frame = InboundFrame::parse(
            r#"{"type":"execute_request","cellId":"c1","code":"1+1","language":"ts","timeoutMs":500}"#,
        )
        .unwrap();
        assert_eq!(
            frame,
            InboundFrame::ExecuteRequest(ExecuteRequest {
                cell_id: "c1".to_string(),
                code: "1+1".to_string(),
                language: Some(Language::Ts),
                timeout_ms: Some(500),
            })
        );
    }

    #[test]
    fn test_parse_interrupt() {
        let frame = InboundFrame::parse(r#"{"type":"interrupt_request","notebookId":"nb"}"#).unwrap();
        assert!(matches!(frame, InboundFrame::InterruptRequest(_)));
    }

    #[test]
    fn test_parse_rejects_bad_frames() {
        assert!(InboundFrame::parse("not json").is_err());
        assert!(InboundFrame::parse(r#"{"type":"shutdown_request"}"#).is_err());
        assert!(InboundFrame::parse(r#"{"type":"execute_request","code":"1"}"#).is_err());
        assert!(InboundFrame::parse(r#"{"type":"execute_request","cellId":" "}"#).is_err());
        assert!(InboundFrame::parse(r#"{"type":"execute_request","cellId":"c","language":"python"}"#).is_err());
        assert!(InboundFrame::parse(r#"{"type":"execute_request","cellId":"c","timeoutMs":0}"#).is_err());
    }

    #[test]
    fn test_outbound_shapes() {
        let hello = OutboundFrame::Hello {
            notebook_id: "nb".to_string(),
            session_id: "s".to_string(),
        };
        assert_eq!(
            serde_json::to_value(&hello).unwrap(),
            json!({"type": "hello", "notebookId": "nb", "sessionId": "s"})
        );

        let reply = OutboundFrame::ExecuteReply {
            cell_id: "c1".to_string(),
            status: ExecutionStatus::Ok,
            exec_time_ms: 12,
        };
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            json!({"type": "execute_reply", "cellId": "c1", "status": "ok", "execTimeMs": 12})
        );

        assert_eq!(
            serde_json::to_value(OutboundFrame::status(KernelState::Busy)).unwrap(),
            json!({"type": "status", "state": "busy"})
        );
    }

    #[test]
    fn test_from_output_maps_kinds() {
        let display = OutputEvent::Display {
            data: [("text/plain".to_string(), json!("4"))].into_iter().collect(),
            metadata: Default::default(),
            kind: DisplayKind::ExecuteResult,
            display_id: None,
        };
        let value = serde_json::to_value(OutboundFrame::from_output("c1", &display)).unwrap();
        assert_eq!(
            value,
            json!({"type": "execute_result", "cellId": "c1", "data": {"text/plain": "4"}, "metadata": {}})
        );

        let error = OutputEvent::Error(
            ErrorOutput::new("Error", "boom").with_traceback(vec!["Error: boom".to_string()]),
        );
        let value = serde_json::to_value(OutboundFrame::from_output("c1", &error)).unwrap();
        assert_eq!(
            value,
            json!({"type": "error", "cellId": "c1", "ename": "Error", "evalue": "boom", "traceback": ["Error: boom"]})
        );

        let stream = OutputEvent::stream(StreamName::Stderr, "x\n");
        let value = serde_json::to_value(OutboundFrame::from_output("c1", &stream)).unwrap();
        assert_eq!(value, json!({"type": "stream", "cellId": "c1", "name": "stderr", "text": "x\n"}));
    }

    #[test]
    fn test_connection_error_has_no_cell_id() {
        let value =
            serde_json::to_value(OutboundFrame::error(None, "ProtocolError", "invalid frame")).unwrap();
        assert!(value.get("cellId").is_none());
        assert_eq!(value["ename"], "ProtocolError");
    }
}

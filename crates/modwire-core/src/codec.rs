//! Wire frames and their codec.
//!
//! Every frame is a positional array whose first element is the integer event
//! code. Client and server speak different shapes for the same events, so each
//! direction has its own frame type:
//!
//! ```text
//! client → server  [event, taskId, module, method, [args...]]
//!                  [PING, timestamp] | [PONG, timestamp]
//! server → client  [CONNECT, serverId]
//!                  [event, taskId, payload]
//!                  [PUBLISH, topic, data]
//!                  [PING, timestamp] | [PONG, timestamp]
//! ```

use crate::{Result, RpcError};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;

/// Event tag carried as the first element of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connect = 1,
    Invoke = 2,
    Return = 3,
    Throw = 4,
    Yield = 5,
    Publish = 6,
    Ping = 7,
    Pong = 8,
}

impl EventKind {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(EventKind::Connect),
            2 => Some(EventKind::Invoke),
            3 => Some(EventKind::Return),
            4 => Some(EventKind::Throw),
            5 => Some(EventKind::Yield),
            6 => Some(EventKind::Publish),
            7 => Some(EventKind::Ping),
            8 => Some(EventKind::Pong),
            _ => None,
        }
    }
}

/// Payload codec negotiated out of band through the connection descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    #[default]
    Json,
}

impl Codec {
    /// Parse a codec identifier; an empty string selects the default.
    pub fn parse(name: &str) -> Result<Self> {
        match name.trim().to_ascii_uppercase().as_str() {
            "" | "JSON" => Ok(Codec::Json),
            other => Err(RpcError::Configuration {
                message: format!("unsupported codec '{}'", other),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Codec::Json => "JSON",
        }
    }

    fn encode(&self, fields: Value) -> Result<Message> {
        match self {
            Codec::Json => Ok(Message::Text(serde_json::to_string(&fields)?)),
        }
    }

    /// Decode a transport message into its field array.
    ///
    /// Returns `Ok(None)` for control messages that carry no frame.
    fn decode(&self, message: &Message) -> Result<Option<Vec<Value>>> {
        let text = match message {
            Message::Text(text) => text.as_str(),
            Message::Binary(bytes) => std::str::from_utf8(bytes).map_err(|_| RpcError::Protocol {
                message: "binary frame is not valid UTF-8".to_string(),
            })?,
            _ => return Ok(None),
        };

        match self {
            Codec::Json => {
                let value: Value = serde_json::from_str(text).map_err(|e| RpcError::Protocol {
                    message: format!("malformed frame: {}", e),
                })?;
                match value {
                    Value::Array(fields) => Ok(Some(fields)),
                    _ => Err(RpcError::Protocol {
                        message: "frame is not an array".to_string(),
                    }),
                }
            }
        }
    }
}

fn event_of(fields: &[Value]) -> Result<EventKind> {
    let code = fields
        .first()
        .and_then(Value::as_i64)
        .ok_or_else(|| RpcError::Protocol {
            message: "frame does not start with an integer event code".to_string(),
        })?;

    EventKind::from_code(code).ok_or_else(|| RpcError::Protocol {
        message: format!("unknown event code {}", code),
    })
}

fn task_id_of(fields: &[Value]) -> Result<u64> {
    fields
        .get(1)
        .and_then(Value::as_u64)
        .ok_or_else(|| RpcError::Protocol {
            message: "frame is missing a numeric task id".to_string(),
        })
}

fn field(fields: &[Value], index: usize) -> Value {
    fields.get(index).cloned().unwrap_or(Value::Null)
}

/// A frame sent by a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientFrame {
    /// INVOKE, or a generator step (YIELD / THROW / RETURN).
    Call {
        event: EventKind,
        task_id: u64,
        module: String,
        method: String,
        args: Vec<Value>,
    },
    Ping(Value),
    Pong(Value),
}

impl ClientFrame {
    pub fn encode(&self, codec: Codec) -> Result<Message> {
        let fields = match self {
            ClientFrame::Call {
                event,
                task_id,
                module,
                method,
                args,
            } => json!([event.code(), task_id, module, method, args]),
            ClientFrame::Ping(stamp) => json!([EventKind::Ping.code(), stamp]),
            ClientFrame::Pong(stamp) => json!([EventKind::Pong.code(), stamp]),
        };
        codec.encode(fields)
    }

    pub fn decode(codec: Codec, message: &Message) -> Result<Option<Self>> {
        let Some(fields) = codec.decode(message)? else {
            return Ok(None);
        };

        let frame = match event_of(&fields)? {
            event @ (EventKind::Invoke | EventKind::Yield | EventKind::Throw | EventKind::Return) => {
                ClientFrame::Call {
                    event,
                    task_id: task_id_of(&fields)?,
                    module: fields.get(2).and_then(Value::as_str).unwrap_or_default().to_string(),
                    method: fields.get(3).and_then(Value::as_str).unwrap_or_default().to_string(),
                    args: match fields.get(4) {
                        Some(Value::Array(args)) => args.clone(),
                        _ => Vec::new(),
                    },
                }
            }
            EventKind::Ping => ClientFrame::Ping(field(&fields, 1)),
            EventKind::Pong => ClientFrame::Pong(field(&fields, 1)),
            other => {
                return Err(RpcError::Protocol {
                    message: format!("unexpected {:?} frame from client", other),
                })
            }
        };

        Ok(Some(frame))
    }
}

/// A frame sent by a server.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    Connect { server_id: String },
    /// RETURN / THROW / YIELD, or the INVOKE streaming-start marker.
    Settle {
        event: EventKind,
        task_id: u64,
        payload: Value,
    },
    Publish { topic: String, data: Value },
    Ping(Value),
    Pong(Value),
}

impl ServerFrame {
    pub fn encode(&self, codec: Codec) -> Result<Message> {
        let fields = match self {
            ServerFrame::Connect { server_id } => json!([EventKind::Connect.code(), server_id]),
            ServerFrame::Settle {
                event,
                task_id,
                payload,
            } => json!([event.code(), task_id, payload]),
            ServerFrame::Publish { topic, data } => {
                json!([EventKind::Publish.code(), topic, data])
            }
            ServerFrame::Ping(stamp) => json!([EventKind::Ping.code(), stamp]),
            ServerFrame::Pong(stamp) => json!([EventKind::Pong.code(), stamp]),
        };
        codec.encode(fields)
    }

    pub fn decode(codec: Codec, message: &Message) -> Result<Option<Self>> {
        let Some(fields) = codec.decode(message)? else {
            return Ok(None);
        };

        let frame = match event_of(&fields)? {
            EventKind::Connect => ServerFrame::Connect {
                server_id: match fields.get(1) {
                    Some(Value::String(id)) => id.clone(),
                    Some(Value::Null) | None => String::new(),
                    Some(other) => other.to_string(),
                },
            },
            event @ (EventKind::Invoke | EventKind::Return | EventKind::Throw | EventKind::Yield) => {
                ServerFrame::Settle {
                    event,
                    task_id: task_id_of(&fields)?,
                    payload: field(&fields, 2),
                }
            }
            EventKind::Publish => ServerFrame::Publish {
                topic: fields
                    .get(1)
                    .and_then(Value::as_str)
                    .ok_or_else(|| RpcError::Protocol {
                        message: "PUBLISH frame is missing its topic".to_string(),
                    })?
                    .to_string(),
                data: field(&fields, 2),
            },
            EventKind::Ping => ServerFrame::Ping(field(&fields, 1)),
            EventKind::Pong => ServerFrame::Pong(field(&fields, 1)),
        };

        Ok(Some(frame))
    }
}

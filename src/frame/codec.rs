//! JSON text codec for gateway frames.

use serde_json::Value;

use super::types::{EventFrame, HelloOk, InboundFrame, RequestFrame, ResponseFrame};
use crate::core::{CodecError, HELLO_OK_TYPE};

/// Decode one inbound text message.
///
/// Only `res` and `event` frames are accepted; anything else, including a
/// server-originated `req`, is reported as [`CodecError::UnsupportedType`].
pub fn decode_inbound(text: &str) -> Result<InboundFrame, CodecError> {
    let value: Value = serde_json::from_str(text)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();

    match kind.as_str() {
        "res" => Ok(InboundFrame::Response(serde_json::from_value::<ResponseFrame>(
            value,
        )?)),
        "event" => Ok(InboundFrame::Event(serde_json::from_value::<EventFrame>(
            value,
        )?)),
        _ => Err(CodecError::UnsupportedType(kind)),
    }
}

/// Encode an outbound request.
pub fn encode_request(frame: &RequestFrame) -> Result<String, CodecError> {
    Ok(serde_json::to_string(frame)?)
}

/// Interpret the payload of a successful `connect` response.
///
/// A payload whose `type` is not `hello-ok` is rejected so a misbehaving
/// gateway cannot open the session with an arbitrary body.
pub fn decode_hello(payload: Value) -> Result<HelloOk, CodecError> {
    let hello: HelloOk = serde_json::from_value(payload)?;
    if hello.r#type != HELLO_OK_TYPE {
        return Err(CodecError::UnsupportedType(hello.r#type));
    }
    Ok(hello)
}

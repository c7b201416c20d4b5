#![allow(dead_code)]

use amp_codec::{Codec, CodecConfig, encode};
use amp_kernel::AgentRuntime;
use amp_primitives::{
    AgentId, AgentIdentity, Capability, CapabilityId, Endpoint, ErrorCode, ErrorPayload, Message,
    MessageType, RequestPayload, ResponsePayload,
};
use bytes::Bytes;
use serde_json::Value;

pub fn agent(id: &str) -> AgentId {
    AgentId::new(id).unwrap()
}

pub fn identity(id: &str) -> AgentIdentity {
    AgentIdentity::builder(agent(id))
        .name(id)
        .unwrap()
        .version("1.0.0")
        .unwrap()
        .build()
        .unwrap()
}

pub fn runtime(id: &str) -> AgentRuntime {
    AgentRuntime::builder(identity(id)).build().unwrap()
}

pub fn capability(id: &str, version: &str) -> Capability {
    Capability::builder(CapabilityId::new(id).unwrap())
        .version(version)
        .unwrap()
        .build()
        .unwrap()
}

pub fn request(from: &str, to: &str, capability: &str, parameters: Value) -> Message {
    Message::request(
        Endpoint::agent(agent(from)),
        Endpoint::agent(agent(to)),
        &RequestPayload::new(CapabilityId::new(capability).unwrap(), parameters),
    )
}

pub fn raw(message: &Message) -> Bytes {
    encode(message).unwrap()
}

pub fn decode(raw: &[u8]) -> Message {
    Codec::new(CodecConfig::default()).unwrap().decode(raw).unwrap()
}

/// Decodes a reply and asserts it answers `request_id`.
pub fn reply_to(request_id: &str, raw: &[u8]) -> Message {
    let reply = decode(raw);
    assert_eq!(reply.headers.correlation_id.as_deref(), Some(request_id));
    reply
}

pub fn success(request_id: &str, raw: &[u8]) -> ResponsePayload {
    let reply = reply_to(request_id, raw);
    assert_eq!(reply.kind, MessageType::Response, "unexpected reply {:?}", reply.payload);
    reply.payload_as().unwrap()
}

pub fn error_code(request_id: &str, raw: &[u8]) -> ErrorCode {
    let reply = reply_to(request_id, raw);
    assert_eq!(reply.kind, MessageType::Error, "unexpected reply {:?}", reply.payload);
    reply.payload_as::<ErrorPayload>().unwrap().code
}

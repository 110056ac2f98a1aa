//! Conversion between calls and wire frames.
//!
//! A [`Frame`] mirrors the wire layout: call id, frame kind, service id, a
//! selector (method index for requests, outcome tag for responses) and an
//! opaque payload. Everything here is pure and stateless.

use crate::{
    contract::{MethodDescriptor, ServiceDescriptor, ServiceId},
    error::{ApplicationError, CodecError, ProtocolFault},
    types::Value,
};
use bincode::Options;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    Request = 0,
    Response = 1,
    Ping = 2,
    Pong = 3,
}

impl TryFrom<u8> for FrameKind {
    type Error = CodecError;

    fn try_from(kind: u8) -> Result<Self, CodecError> {
        use FrameKind::*;
        Ok(match kind {
            0 => Request,
            1 => Response,
            2 => Ping,
            3 => Pong,
            _ => return Err(CodecError::MalformedFrame(format!("unknown frame kind {kind}"))),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub call_id: u64,
    pub kind: u8,
    pub service: ServiceId,
    pub selector: u32,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn kind(&self) -> Result<FrameKind, CodecError> {
        FrameKind::try_from(self.kind)
    }

    pub fn ping(call_id: u64) -> Self {
        Self::control(call_id, FrameKind::Ping)
    }

    pub fn pong(call_id: u64) -> Self {
        Self::control(call_id, FrameKind::Pong)
    }

    fn control(call_id: u64, kind: FrameKind) -> Self {
        Self {
            call_id,
            kind: kind as u8,
            service: ServiceId::new("", 0),
            selector: 0,
            payload: Vec::new(),
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        Ok(wire_options().serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        Ok(wire_options().deserialize(bytes)?)
    }
}

/// Largest payload (and frame byte form) the codec encodes or decodes.
pub const MAX_PAYLOAD_BYTES: u64 = 16 * 1024 * 1024;

fn wire_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .reject_trailing_bytes()
        .with_limit(MAX_PAYLOAD_BYTES)
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallRequest {
    pub call_id: u64,
    pub service: ServiceId,
    pub method_index: u32,
    pub args: Vec<Value>,
    pub created_at: SystemTime,
}

impl CallRequest {
    pub fn new(call_id: u64, service: ServiceId, method_index: u32, args: Vec<Value>) -> Self {
        Self {
            call_id,
            service,
            method_index,
            args,
            created_at: SystemTime::now(),
        }
    }
}

#[derive(Serialize)]
struct RequestBodyRef<'a> {
    created_at: SystemTime,
    args: &'a [Value],
}

#[derive(Deserialize)]
struct RequestBody {
    created_at: SystemTime,
    args: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(Value),
    ApplicationError(ApplicationError),
    ProtocolError(ProtocolFault),
}

const SUCCESS: u32 = 0;
const APPLICATION_ERROR: u32 = 1;
const PROTOCOL_ERROR: u32 = 2;

impl Outcome {
    fn tag(&self) -> u32 {
        match self {
            Outcome::Success(_) => SUCCESS,
            Outcome::ApplicationError(_) => APPLICATION_ERROR,
            Outcome::ProtocolError(_) => PROTOCOL_ERROR,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CallResponse {
    pub call_id: u64,
    pub service: ServiceId,
    pub outcome: Outcome,
}

pub fn encode_request(request: &CallRequest) -> Result<Frame, CodecError> {
    let body = RequestBodyRef {
        created_at: request.created_at,
        args: &request.args,
    };
    Ok(Frame {
        call_id: request.call_id,
        kind: FrameKind::Request as u8,
        service: request.service.clone(),
        selector: request.method_index,
        payload: wire_options().serialize(&body)?,
    })
}

pub fn decode_request(frame: &Frame) -> Result<CallRequest, CodecError> {
    expect_kind(frame, FrameKind::Request)?;
    let RequestBody { created_at, args } = wire_options().deserialize(&frame.payload)?;
    Ok(CallRequest {
        call_id: frame.call_id,
        service: frame.service.clone(),
        method_index: frame.selector,
        args,
        created_at,
    })
}

pub fn encode_response(response: &CallResponse) -> Result<Frame, CodecError> {
    let options = wire_options();
    let payload = match &response.outcome {
        Outcome::Success(value) => options.serialize(value)?,
        Outcome::ApplicationError(err) => options.serialize(err)?,
        Outcome::ProtocolError(fault) => options.serialize(fault)?,
    };
    Ok(Frame {
        call_id: response.call_id,
        kind: FrameKind::Response as u8,
        service: response.service.clone(),
        selector: response.outcome.tag(),
        payload,
    })
}

pub fn decode_response(frame: &Frame) -> Result<CallResponse, CodecError> {
    expect_kind(frame, FrameKind::Response)?;
    let options = wire_options();
    let outcome = match frame.selector {
        SUCCESS => Outcome::Success(options.deserialize(&frame.payload)?),
        APPLICATION_ERROR => Outcome::ApplicationError(options.deserialize(&frame.payload)?),
        PROTOCOL_ERROR => Outcome::ProtocolError(options.deserialize(&frame.payload)?),
        tag => return Err(CodecError::UnknownOutcomeTag(tag)),
    };
    Ok(CallResponse {
        call_id: frame.call_id,
        service: frame.service.clone(),
        outcome,
    })
}

/// Resolves the request's method on `descriptor` and checks the arguments against it.
pub fn typecheck_request<'d>(
    descriptor: &'d ServiceDescriptor,
    request: &CallRequest,
) -> Result<&'d MethodDescriptor, ProtocolFault> {
    let method = descriptor.method(request.method_index)?;
    method
        .check_args(&request.args)
        .map_err(ProtocolFault::TypeMismatch)?;
    Ok(method)
}

fn expect_kind(frame: &Frame, expected: FrameKind) -> Result<(), CodecError> {
    let kind = frame.kind()?;
    if kind != expected {
        return Err(CodecError::MalformedFrame(format!(
            "expected {expected:?} frame, got {kind:?}"
        )));
    }
    Ok(())
}

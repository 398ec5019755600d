//! Wire messages
//!
//! Every message on the wire is framed the same way:
//!
//! ```text
//! serialization_version : u32 (little endian)
//! type                  : u8
//! body_len              : u64 (little endian)
//! body                  : body_len bytes (bincode)
//! ```
//!
//! Three request/response pairs plus the streamed result part. A receiver
//! rejects frames whose version does not match its own, frames of an
//! unexpected type for the read direction, and frames whose declared length
//! is absurd. Ciphertexts and keys travel as opaque byte strings; the crypto
//! layer validates them against the active BFV context after framing.

#![allow(missing_docs)]

use std::io::{Read, Write};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{PsiError, Result};

/// Version of the wire encoding. Bump on any incompatible change.
pub const SERIALIZATION_VERSION: u32 = 1;

/// Upper bound on a single message body; anything larger is a protocol error.
const MAX_BODY_BYTES: u64 = 1 << 31;

const KIND_PARAMS_REQUEST: u8 = 0;
const KIND_OPRF_REQUEST: u8 = 1;
const KIND_QUERY_REQUEST: u8 = 2;
const KIND_PARAMS_RESPONSE: u8 = 3;
const KIND_OPRF_RESPONSE: u8 = 4;
const KIND_QUERY_RESPONSE: u8 = 5;
const KIND_RESULT_PART: u8 = 6;

// ============================================================================
// Message bodies
// ============================================================================

/// Blinded OPRF points, concatenated (length must be a multiple of 32).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OprfRequest {
    pub data: Vec<u8>,
}

/// The encrypted query: relinearization keys plus, for every source power,
/// one serialized ciphertext per bundle index (sorted by power).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRequest {
    pub compr_mode: u8,
    pub relin_keys: Vec<u8>,
    pub data: Vec<(u32, Vec<Vec<u8>>)>,
}

/// Serialized `PsiParams` (validated on parse by the receiver).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamsResponse {
    pub params: Vec<u8>,
}

/// Evaluated OPRF points; same length as the request on success, empty when
/// the request was refused.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OprfResponse {
    pub data: Vec<u8>,
}

/// How many result parts will follow. Zero means the query produced nothing
/// (empty database) or was refused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResponse {
    pub package_count: u32,
}

/// One bundle's evaluated result: the match-indicator ciphertext and the
/// label ciphertexts (empty for unlabeled databases). Parts may arrive in any
/// order; `bundle_idx` carries the position explicitly.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultPart {
    pub bundle_idx: u32,
    pub label_byte_count: u32,
    pub nonce_byte_count: u32,
    pub psi_result: Vec<u8>,
    pub label_result: Vec<Vec<u8>>,
}

/// A message the receiver sends to the sender.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    Params,
    Oprf(OprfRequest),
    Query(QueryRequest),
}

/// A message the sender sends back (result parts travel separately).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    Params(ParamsResponse),
    Oprf(OprfResponse),
    Query(QueryResponse),
}

// ============================================================================
// Framing
// ============================================================================

fn write_frame<W: Write, T: Serialize>(writer: &mut W, kind: u8, body: &T) -> Result<u64> {
    let body = bincode::serialize(body)?;
    writer.write_all(&SERIALIZATION_VERSION.to_le_bytes())?;
    writer.write_all(&[kind])?;
    writer.write_all(&(body.len() as u64).to_le_bytes())?;
    writer.write_all(&body)?;
    writer.flush()?;
    Ok(4 + 1 + 8 + body.len() as u64)
}

fn read_frame<R: Read>(reader: &mut R) -> Result<(u8, Vec<u8>, u64)> {
    let mut header = [0u8; 13];
    reader.read_exact(&mut header)?;

    let version = u32::from_le_bytes(header[0..4].try_into().expect("4 bytes"));
    if version != SERIALIZATION_VERSION {
        return Err(PsiError::InvalidProtocol(format!(
            "peer speaks serialization version {version}, expected {SERIALIZATION_VERSION}"
        )));
    }
    let kind = header[4];
    let body_len = u64::from_le_bytes(header[5..13].try_into().expect("8 bytes"));
    if body_len > MAX_BODY_BYTES {
        return Err(PsiError::InvalidProtocol(format!("message body of {body_len} bytes refused")));
    }

    let mut body = vec![0u8; body_len as usize];
    reader.read_exact(&mut body)?;
    Ok((kind, body, 13 + body_len))
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(body)?)
}

/// Write a request frame; returns the bytes put on the wire.
pub fn write_request<W: Write>(writer: &mut W, request: &Request) -> Result<u64> {
    match request {
        Request::Params => write_frame(writer, KIND_PARAMS_REQUEST, &()),
        Request::Oprf(body) => write_frame(writer, KIND_OPRF_REQUEST, body),
        Request::Query(body) => write_frame(writer, KIND_QUERY_REQUEST, body),
    }
}

/// Read one request frame; responses and result parts are protocol errors
/// in this direction.
pub fn read_request<R: Read>(reader: &mut R) -> Result<(Request, u64)> {
    let (kind, body, size) = read_frame(reader)?;
    let request = match kind {
        KIND_PARAMS_REQUEST => Request::Params,
        KIND_OPRF_REQUEST => Request::Oprf(decode(&body)?),
        KIND_QUERY_REQUEST => Request::Query(decode(&body)?),
        other => {
            return Err(PsiError::InvalidProtocol(format!(
                "expected a request, got message type {other}"
            )))
        }
    };
    Ok((request, size))
}

/// Write a response frame; returns the bytes put on the wire.
pub fn write_response<W: Write>(writer: &mut W, response: &Response) -> Result<u64> {
    match response {
        Response::Params(body) => write_frame(writer, KIND_PARAMS_RESPONSE, body),
        Response::Oprf(body) => write_frame(writer, KIND_OPRF_RESPONSE, body),
        Response::Query(body) => write_frame(writer, KIND_QUERY_RESPONSE, body),
    }
}

/// Read one response frame.
pub fn read_response<R: Read>(reader: &mut R) -> Result<(Response, u64)> {
    let (kind, body, size) = read_frame(reader)?;
    let response = match kind {
        KIND_PARAMS_RESPONSE => Response::Params(decode(&body)?),
        KIND_OPRF_RESPONSE => Response::Oprf(decode(&body)?),
        KIND_QUERY_RESPONSE => Response::Query(decode(&body)?),
        other => {
            return Err(PsiError::InvalidProtocol(format!(
                "expected a response, got message type {other}"
            )))
        }
    };
    Ok((response, size))
}

/// Write a result-part frame; returns the bytes put on the wire.
pub fn write_result_part<W: Write>(writer: &mut W, part: &ResultPart) -> Result<u64> {
    write_frame(writer, KIND_RESULT_PART, part)
}

/// Read one result-part frame.
pub fn read_result_part<R: Read>(reader: &mut R) -> Result<(ResultPart, u64)> {
    let (kind, body, size) = read_frame(reader)?;
    if kind != KIND_RESULT_PART {
        return Err(PsiError::InvalidProtocol(format!(
            "expected a result part, got message type {kind}"
        )));
    }
    Ok((decode(&body)?, size))
}

// ============================================================================
// Tests
// ============================================================================

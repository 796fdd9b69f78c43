//! Agent protocol messages: request encoding and response decoding.
//!
//! A message is one frame payload: a message-number byte followed by the
//! message body. Framing itself lives in [`crate::codec`].

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};

use crate::encoding::{read_string, read_u32, read_u8, read_utf8, write_string, write_u32};
use crate::error::AgentError;
use crate::identity::Identity;

/// Message numbers from draft-miller-ssh-agent-17.
pub mod msg {
    pub const FAILURE: u8 = 5;
    pub const SUCCESS: u8 = 6;
    pub const REQUEST_IDENTITIES: u8 = 11;
    pub const IDENTITIES_ANSWER: u8 = 12;
    pub const SIGN_REQUEST: u8 = 13;
    pub const SIGN_RESPONSE: u8 = 14;
    pub const ADD_IDENTITY: u8 = 17;
    pub const REMOVE_IDENTITY: u8 = 18;
    pub const REMOVE_ALL_IDENTITIES: u8 = 19;
}

/// A public key held by the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity {
    /// SSH wire-format public key, reusable verbatim in a sign request.
    pub key_blob: Vec<u8>,
    pub comment: String,
}

impl AgentIdentity {
    /// `SHA256:...` fingerprint of the key blob, as `ssh-add -l` prints it.
    pub fn fingerprint(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.key_blob);
        let hash = hasher.finalize();

        format!("SHA256:{}", STANDARD_NO_PAD.encode(hash))
    }

    /// Key-type label parsed out of the blob, e.g. `ssh-ed25519`.
    pub fn key_type(&self) -> String {
        let mut cursor = &self.key_blob[..];
        match read_string(&mut cursor) {
            Some(label) => String::from_utf8_lossy(label).to_string(),
            None => "unknown".to_string(),
        }
    }
}

/// Client-to-agent messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    RequestIdentities,
    SignRequest {
        key_blob: Vec<u8>,
        data: Vec<u8>,
        flags: u32,
    },
    AddIdentity(Identity),
    RemoveIdentity {
        key_blob: Vec<u8>,
    },
    RemoveAllIdentities,
}

/// Agent-to-client messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Success,
    Failure,
    IdentitiesAnswer(Vec<AgentIdentity>),
    SignResponse(Vec<u8>),
    /// A defined or unknown message number this client does not interpret.
    /// The body is not parsed.
    Unsupported(u8),
}

/// Encode a request as a frame payload (message number plus body).
pub fn encode_request(request: &Request) -> Vec<u8> {
    let mut out = Vec::new();
    match request {
        Request::RequestIdentities => {
            out.push(msg::REQUEST_IDENTITIES);
        }
        Request::SignRequest {
            key_blob,
            data,
            flags,
        } => {
            out.push(msg::SIGN_REQUEST);
            write_string(&mut out, key_blob);
            write_string(&mut out, data);
            write_u32(&mut out, *flags);
        }
        Request::AddIdentity(identity) => {
            out.push(msg::ADD_IDENTITY);
            for field in identity.fields() {
                write_string(&mut out, field);
            }
        }
        Request::RemoveIdentity { key_blob } => {
            out.push(msg::REMOVE_IDENTITY);
            write_string(&mut out, key_blob);
        }
        Request::RemoveAllIdentities => {
            out.push(msg::REMOVE_ALL_IDENTITIES);
        }
    }
    out
}

/// Decode one response frame payload.
pub fn decode_response(frame: &[u8]) -> Result<Response, AgentError> {
    let mut buf = frame;
    let number =
        read_u8(&mut buf).ok_or_else(|| AgentError::BadResponse("empty frame".into()))?;

    match number {
        msg::SUCCESS => {
            expect_end(buf)?;
            Ok(Response::Success)
        }
        msg::FAILURE => {
            expect_end(buf)?;
            Ok(Response::Failure)
        }
        msg::IDENTITIES_ANSWER => {
            let count = read_u32(&mut buf)
                .ok_or_else(|| AgentError::BadResponse("missing identity count".into()))?;
            let mut identities = Vec::new();
            for _ in 0..count {
                let key_blob = read_string(&mut buf)
                    .ok_or_else(|| AgentError::BadResponse("truncated identity key blob".into()))?
                    .to_vec();
                let comment = read_utf8(&mut buf)?
                    .ok_or_else(|| AgentError::BadResponse("truncated identity comment".into()))?;
                identities.push(AgentIdentity { key_blob, comment });
            }
            expect_end(buf)?;
            Ok(Response::IdentitiesAnswer(identities))
        }
        msg::SIGN_RESPONSE => match read_string(&mut buf) {
            // An agent that cannot sign may answer with a bare message
            // number; treat that as a refusal rather than garbage.
            None => Ok(Response::Failure),
            Some(signature) => {
                let signature = signature.to_vec();
                expect_end(buf)?;
                Ok(Response::SignResponse(signature))
            }
        },
        other => Ok(Response::Unsupported(other)),
    }
}

fn expect_end(buf: &[u8]) -> Result<(), AgentError> {
    if buf.is_empty() {
        Ok(())
    } else {
        Err(AgentError::TrailingBytes(buf.len()))
    }
}

/// Decode a frame payload back into a [`Request`]. The inverse of
/// [`encode_request`], for round-trip tests.
#[cfg(test)]
pub(crate) fn decode_request(frame: &[u8]) -> Result<Request, AgentError> {
    let mut buf = frame;
    let number =
        read_u8(&mut buf).ok_or_else(|| AgentError::BadResponse("empty frame".into()))?;

    let bad = |what: &str| AgentError::BadResponse(what.into());
    match number {
        msg::REQUEST_IDENTITIES => {
            expect_end(buf)?;
            Ok(Request::RequestIdentities)
        }
        msg::SIGN_REQUEST => {
            let key_blob = read_string(&mut buf).ok_or_else(|| bad("key blob"))?.to_vec();
            let data = read_string(&mut buf).ok_or_else(|| bad("data"))?.to_vec();
            let flags = read_u32(&mut buf).ok_or_else(|| bad("flags"))?;
            expect_end(buf)?;
            Ok(Request::SignRequest {
                key_blob,
                data,
                flags,
            })
        }
        msg::ADD_IDENTITY => {
            let mut fields = Vec::new();
            while !buf.is_empty() {
                fields.push(read_string(&mut buf).ok_or_else(|| bad("identity field"))?.to_vec());
            }
            Ok(Request::AddIdentity(Identity::from_fields(fields)))
        }
        msg::REMOVE_IDENTITY => {
            let key_blob = read_string(&mut buf).ok_or_else(|| bad("key blob"))?.to_vec();
            expect_end(buf)?;
            Ok(Request::RemoveIdentity { key_blob })
        }
        msg::REMOVE_ALL_IDENTITIES => {
            expect_end(buf)?;
            Ok(Request::RemoveAllIdentities)
        }
        other => Err(bad(&format!("unknown request number {other}"))),
    }
}

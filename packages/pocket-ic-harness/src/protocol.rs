//! Call envelopes and the wire generations that produce them.
//!
//! Every canister call returns exactly one of `{"Ok": ..}` or `{"Err": {..}}`.
//! How the reply sits under `Ok`, and whether an update call takes one round
//! trip or two, depends on the server generation. A [`WireProtocol`] is chosen
//! once per session and all calls go through it.

use crate::error::{PocketIcError, RejectResponse};
use serde_json::Value;

/// The magic prefix of candid-encoded payloads.
pub const CANDID_MAGIC: &[u8; 4] = b"DIDL";

/// The wire generation spoken with the server.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WireProtocol {
    /// Update calls are one synchronous `update/execute_ingress_message` round
    /// trip and replies are nested as `{"Ok": {"Reply": <base64>}}`.
    #[default]
    Synchronous,
    /// Update calls are submitted with `update/submit_ingress_message` and
    /// collected with `update/await_ingress_message`; replies are flat
    /// `{"Ok": <base64>}`.
    SubmitAwait,
}

impl WireProtocol {
    pub(crate) fn reply_from_ok(self, ok: &Value) -> Result<Vec<u8>, PocketIcError> {
        match self {
            WireProtocol::Synchronous => {
                let Some(inner) = ok.as_object() else {
                    return Err(PocketIcError::protocol_violation(
                        "\"Ok\" is not an object",
                        ok,
                    ));
                };
                if let Some(reply) = inner.get("Reply") {
                    return decode_base64(reply);
                }
                // Canister-level rejects of this generation carry only a message.
                // The error code is the one the replica assigns to explicit
                // canister rejects; nothing was certified.
                if let Some(Value::String(message)) = inner.get("Reject") {
                    return Err(PocketIcError::Rejected(RejectResponse {
                        reject_code: crate::error::RejectCode::CanisterReject,
                        reject_message: message.clone(),
                        error_code: crate::error::ErrorCode::CanisterRejectedMessage,
                        certified: false,
                    }));
                }
                Err(PocketIcError::protocol_violation(
                    "request contains no key \"Reply\"",
                    ok,
                ))
            }
            WireProtocol::SubmitAwait => decode_base64(ok),
        }
    }
}

fn decode_base64(value: &Value) -> Result<Vec<u8>, PocketIcError> {
    let Value::String(text) = value else {
        return Err(PocketIcError::protocol_violation(
            "reply is not a base64 string",
            value,
        ));
    };
    base64::decode(text)
        .map_err(|e| PocketIcError::protocol_violation(format!("reply is not base64: {e}"), value))
}

/// A successful reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Reply {
    /// Starts with [`CANDID_MAGIC`]; decode it against explicit types.
    Candid(Vec<u8>),
    /// Anything else, returned as an opaque byte list and never run through the decoder.
    Bytes(Vec<u8>),
}

impl Reply {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        if bytes.starts_with(CANDID_MAGIC) {
            Reply::Candid(bytes)
        } else {
            Reply::Bytes(bytes)
        }
    }

    pub fn is_candid(&self) -> bool {
        matches!(self, Reply::Candid(_))
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Reply::Candid(bytes) | Reply::Bytes(bytes) => bytes,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            Reply::Candid(bytes) | Reply::Bytes(bytes) => bytes,
        }
    }
}

/// Splits an envelope into its `Ok` or `Err` half.
///
/// A missing discriminant is a protocol violation and the payload is quoted verbatim.
pub(crate) fn split_envelope(body: &str) -> Result<Result<Value, RejectResponse>, PocketIcError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| PocketIcError::protocol_violation(format!("invalid JSON: {e}"), body))?;
    let Some(object) = value.as_object() else {
        return Err(PocketIcError::protocol_violation(
            "envelope is not an object",
            body,
        ));
    };
    if let Some(ok) = object.get("Ok") {
        return Ok(Ok(ok.clone()));
    }
    if let Some(err) = object.get("Err") {
        let reject = serde_json::from_value(err.clone()).map_err(|e| {
            PocketIcError::protocol_violation(format!("unrecognized \"Err\": {e}"), body)
        })?;
        return Ok(Err(reject));
    }
    Err(PocketIcError::protocol_violation(
        "neither \"Ok\" nor \"Err\"",
        body,
    ))
}

/// Unwraps a call result envelope into a [`Reply`] or a typed rejection.
pub(crate) fn unwrap_call_result(protocol: WireProtocol, body: &str) -> Result<Reply, PocketIcError> {
    match split_envelope(body)? {
        Ok(ok) => protocol.reply_from_ok(&ok).map(Reply::from_bytes),
        Err(reject) => Err(PocketIcError::Rejected(reject)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use assert_matches::assert_matches;

    #[test]
    fn candid_replies_are_kept_as_is() {
        // base64("DIDL\0\x01\x7d\x2a")
        let body = r#"{"Ok":{"Reply":"RElETAABfSo="}}"#;
        let reply = unwrap_call_result(WireProtocol::Synchronous, body).unwrap();
        assert_eq!(reply, Reply::Candid(b"DIDL\x00\x01\x7d\x2a".to_vec()));
    }

    #[test]
    fn non_candid_replies_are_opaque_bytes() {
        let body = r#"{"Ok":{"Reply":"AAAAAQ=="}}"#;
        let reply = unwrap_call_result(WireProtocol::Synchronous, body).unwrap();
        assert_eq!(reply, Reply::Bytes(vec![0, 0, 0, 1]));
        assert!(!reply.is_candid());
    }

    #[test]
    fn flat_replies_for_submit_await() {
        let reply = unwrap_call_result(WireProtocol::SubmitAwait, r#"{"Ok":"AQI="}"#).unwrap();
        assert_eq!(reply.into_bytes(), vec![1, 2]);
        // The nested shape is not accepted by the flat generation, and vice versa.
        assert_matches!(
            unwrap_call_result(WireProtocol::SubmitAwait, r#"{"Ok":{"Reply":"AQI="}}"#),
            Err(PocketIcError::ProtocolViolation { .. })
        );
        assert_matches!(
            unwrap_call_result(WireProtocol::Synchronous, r#"{"Ok":"AQI="}"#),
            Err(PocketIcError::ProtocolViolation { .. })
        );
    }

    #[test]
    fn missing_reply_is_a_protocol_violation() {
        let body = r#"{"Ok":{"Replied":"AQI="}}"#;
        let err = unwrap_call_result(WireProtocol::Synchronous, body).unwrap_err();
        assert_matches!(&err, PocketIcError::ProtocolViolation { payload, .. } if payload.contains("Replied"));
    }

    #[test]
    fn unknown_discriminant_quotes_the_payload() {
        let body = r#"{"Maybe":42}"#;
        let err = unwrap_call_result(WireProtocol::Synchronous, body).unwrap_err();
        assert_matches!(&err, PocketIcError::ProtocolViolation { payload, .. } if payload == body);
        assert!(err.to_string().contains(body));
    }

    #[test]
    fn rejections_are_typed() {
        let body = r#"{"Err":{"reject_code":5,"reject_message":"Canister has no wasm module","error_code":"CanisterWasmModuleNotFound","certified":true}}"#;
        let err = unwrap_call_result(WireProtocol::Synchronous, body).unwrap_err();
        assert_eq!(err.error_code(), Some(ErrorCode::CanisterWasmModuleNotFound));
    }

    #[test]
    fn legacy_canister_reject() {
        let body = r#"{"Ok":{"Reject":"nope"}}"#;
        let err = unwrap_call_result(WireProtocol::Synchronous, body).unwrap_err();
        let reject = assert_matches!(err, PocketIcError::Rejected(reject) => reject);
        assert_eq!(reject.reject_message, "nope");
        assert_eq!(reject.error_code, ErrorCode::CanisterRejectedMessage);
        assert!(!reject.certified);
    }
}

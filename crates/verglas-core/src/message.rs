use bytes::Bytes;
use std::collections::BTreeMap;

use verglas_codec::{EncodingError, InputStream, OutputStream};
use verglas_wire::{
    EncodingVersion, Identity, MessageHeader, MessageType, OperationMode, ReplyStatus,
    HEADER_SIZE,
};

use crate::{LocalError, ProtocolError};

/// Request context: free-form metadata forwarded with every invocation.
pub type Context = BTreeMap<String, String>;

/// Everything needed to put one request on the wire. The params
/// encapsulation carries its own encoding version, which may differ from
/// the frame's; both sides tolerate the asymmetry.
pub(crate) struct RequestSpec {
    pub identity: Identity,
    pub facet: String,
    pub operation: String,
    pub mode: OperationMode,
    pub context: Context,
    /// The in-parameters encapsulation, header included.
    pub params: Bytes,
    /// Proxy-level override; unset defers to the endpoint's `-z`.
    pub compress: Option<bool>,
}

/// A decoded reply, handed to the waiter for final interpretation.
#[derive(Debug)]
pub struct ReplyData {
    pub status: ReplyStatus,
    /// Reply body after the status byte: an encapsulation for Ok and
    /// UserException, structured fields for the other statuses.
    pub body: Bytes,
    pub encoding: EncodingVersion,
}

/// An inbound request parsed off a connection, before servant lookup.
pub(crate) struct ParsedRequest {
    /// 0 for oneway and batched requests.
    pub request_id: i32,
    pub identity: Identity,
    pub facet: String,
    pub operation: String,
    pub mode: OperationMode,
    pub context: Context,
    /// The in-parameters encapsulation, header included.
    pub params: Bytes,
    pub encoding: EncodingVersion,
}

/// Serialize the request body (everything after the 14-byte header and
/// the request id slot).
pub(crate) fn write_request_body(
    out: &mut OutputStream,
    spec: &RequestSpec,
) -> Result<(), EncodingError> {
    out.write_string(&spec.identity.name)?;
    out.write_string(&spec.identity.category)?;
    // The facet travels as a sequence of at most one string.
    if spec.facet.is_empty() {
        out.write_size(0)?;
    } else {
        out.write_size(1)?;
        out.write_string(&spec.facet)?;
    }
    out.write_string(&spec.operation)?;
    out.write_u8(spec.mode.as_u8());
    out.write_string_dict(&spec.context)?;
    out.write_blob(&spec.params);
    Ok(())
}

/// Parse a request body; `input` is positioned after the request id.
pub(crate) fn read_request_body(
    input: &mut InputStream,
    request_id: i32,
    encoding: EncodingVersion,
) -> Result<ParsedRequest, LocalError> {
    let name = input.read_string()?;
    let category = input.read_string()?;
    let facet = match input.read_size()? {
        0 => String::new(),
        1 => input.read_string()?,
        n => {
            return Err(
                ProtocolError::Violation(format!("facet path with {n} elements")).into()
            )
        }
    };
    let operation = input.read_string()?;
    let mode_byte = input.read_u8()?;
    let mode = OperationMode::from_u8(mode_byte)
        .ok_or_else(|| ProtocolError::Violation(format!("operation mode {mode_byte}")))?;
    let context = input.read_string_dict()?;
    let (params, _params_encoding) = input.read_encapsulation()?;
    Ok(ParsedRequest {
        request_id,
        identity: Identity { category, name },
        facet,
        operation,
        mode,
        context,
        params,
        encoding,
    })
}

/// Frame a message: header with patched size, then the body.
pub(crate) fn build_frame(
    message_type: MessageType,
    encoding: EncodingVersion,
    body: impl FnOnce(&mut OutputStream) -> Result<(), EncodingError>,
) -> Result<Bytes, EncodingError> {
    let mut out = OutputStream::new(encoding);
    let header = MessageHeader::new(message_type, encoding, 0);
    out.write_blob(&header.to_bytes());
    body(&mut out)?;
    let size = out.len() as i32;
    let mut bytes = out.finished().to_vec();
    bytes[10..14].copy_from_slice(&size.to_le_bytes());
    Ok(Bytes::from(bytes))
}

/// A bare 14-byte frame: validation and heartbeat messages.
pub(crate) fn control_frame(message_type: MessageType, encoding: EncodingVersion) -> Bytes {
    let header = MessageHeader::new(message_type, encoding, HEADER_SIZE as i32);
    Bytes::copy_from_slice(&header.to_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use verglas_wire::ENCODING_1_1;

    fn empty_encaps() -> Bytes {
        let mut out = OutputStream::new(ENCODING_1_1);
        out.write_empty_encapsulation(ENCODING_1_1).unwrap();
        out.finished()
    }

    #[test]
    fn request_body_roundtrip() {
        let spec = RequestSpec {
            identity: Identity::new("cat", "obj"),
            facet: "side".into(),
            operation: "doIt".into(),
            mode: OperationMode::Idempotent,
            context: Context::from([("k".to_string(), "v".to_string())]),
            params: empty_encaps(),
            compress: None,
        };
        let mut out = OutputStream::new(ENCODING_1_1);
        write_request_body(&mut out, &spec).unwrap();

        let mut input = InputStream::new(out.finished(), ENCODING_1_1);
        let parsed = read_request_body(&mut input, 7, ENCODING_1_1).unwrap();
        assert_eq!(parsed.request_id, 7);
        assert_eq!(parsed.identity, spec.identity);
        assert_eq!(parsed.facet, "side");
        assert_eq!(parsed.operation, "doIt");
        assert_eq!(parsed.mode, OperationMode::Idempotent);
        assert_eq!(parsed.context.get("k").map(String::as_str), Some("v"));
        assert_eq!(&parsed.params[..], &spec.params[..]);
    }

    #[test]
    fn empty_facet_is_zero_length_sequence() {
        let spec = RequestSpec {
            identity: Identity::named("obj"),
            facet: String::new(),
            operation: "op".into(),
            mode: OperationMode::Normal,
            context: Context::new(),
            params: empty_encaps(),
            compress: None,
        };
        let mut out = OutputStream::new(ENCODING_1_1);
        write_request_body(&mut out, &spec).unwrap();
        let bytes = out.finished();
        // name, category, then the facet sequence size byte.
        assert_eq!(bytes[0], 3); // "obj"
        assert_eq!(bytes[4], 0); // empty category
        assert_eq!(bytes[5], 0); // empty facet sequence
    }

    #[test]
    fn frame_size_is_patched() {
        let frame = build_frame(MessageType::Reply, ENCODING_1_1, |out| {
            out.write_i32(99);
            Ok(())
        })
        .unwrap();
        assert_eq!(frame.len(), HEADER_SIZE + 4);
        let declared = i32::from_le_bytes([frame[10], frame[11], frame[12], frame[13]]);
        assert_eq!(declared as usize, frame.len());
    }

    #[test]
    fn control_frame_is_header_only() {
        let frame = control_frame(MessageType::ValidateConnection, ENCODING_1_1);
        assert_eq!(frame.len(), HEADER_SIZE);
        assert_eq!(frame[8], MessageType::ValidateConnection.as_u8());
    }
}

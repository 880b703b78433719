//! The wire envelope and its two codecs.
//!
//! Every frame exchanged between nodes is one envelope. The textual codec is
//! the classic JSON array form; the binary codec is a fixed-width big-endian
//! record carrying the same logical fields so the two can round-trip the same
//! envelope. Multi-hop metadata (destination, network path, timestamp,
//! signatures) travels in a trailer outside the base tuple.

use crate::error::{Error, ErrorCode};
use crate::routing::{NetworkPath, NodeId};
use crate::signature::{Signature, SignatureAlgorithm};
use serde_json::value::RawValue;
use serde_json::{json, Value};

/// Discriminant of the base tuple, as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeKind {
    Request,
    Response,
    RequestError,
    ResponseError,
}

impl EnvelopeKind {
    pub fn wire_id(&self) -> u8 {
        match self {
            EnvelopeKind::Request => 2,
            EnvelopeKind::Response => 3,
            EnvelopeKind::RequestError => 4,
            EnvelopeKind::ResponseError => 5,
        }
    }

    pub fn from_wire_id(id: u8) -> Option<EnvelopeKind> {
        match id {
            2 => Some(EnvelopeKind::Request),
            3 => Some(EnvelopeKind::Response),
            4 => Some(EnvelopeKind::RequestError),
            5 => Some(EnvelopeKind::ResponseError),
            _ => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, EnvelopeKind::RequestError | EnvelopeKind::ResponseError)
    }
}

/// Error fields carried by the two error kinds.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorFields {
    pub code: ErrorCode,
    pub description: String,
    /// Opaque JSON object with additional diagnostics.
    pub details: Value,
}

/// One unit on the wire.
///
/// `payload` is opaque to this crate: JSON bytes on the textual codec, any
/// blob on the binary codec. Interpretation belongs to the message catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub kind: EnvelopeKind,
    pub request_id: String,
    /// Present only on requests.
    pub action: Option<String>,
    pub payload: Vec<u8>,
    pub destination: Option<NodeId>,
    pub network_path: NetworkPath,
    pub signatures: Vec<Signature>,
    /// Millisecond timestamp, set on error kinds when composed locally.
    pub timestamp: Option<u64>,
    pub error: Option<ErrorFields>,
}

impl Envelope {
    pub fn new_request(request_id: &str, action: &str, payload: Vec<u8>) -> Envelope {
        Envelope {
            kind: EnvelopeKind::Request,
            request_id: request_id.to_string(),
            action: Some(action.to_string()),
            payload,
            destination: None,
            network_path: NetworkPath::new(),
            signatures: vec![],
            timestamp: None,
            error: None,
        }
    }

    pub fn new_response(request_id: &str, payload: Vec<u8>) -> Envelope {
        Envelope {
            kind: EnvelopeKind::Response,
            request_id: request_id.to_string(),
            action: None,
            payload,
            destination: None,
            network_path: NetworkPath::new(),
            signatures: vec![],
            timestamp: None,
            error: None,
        }
    }

    pub fn new_request_error(request_id: &str, code: ErrorCode, description: &str) -> Envelope {
        Envelope {
            kind: EnvelopeKind::RequestError,
            request_id: request_id.to_string(),
            action: None,
            payload: vec![],
            destination: None,
            network_path: NetworkPath::new(),
            signatures: vec![],
            timestamp: None,
            error: Some(ErrorFields {
                code,
                description: description.to_string(),
                details: json!({}),
            }),
        }
    }

    pub fn new_response_error(request_id: &str, code: ErrorCode, description: &str) -> Envelope {
        let mut envelope = Envelope::new_request_error(request_id, code, description);
        envelope.kind = EnvelopeKind::ResponseError;
        envelope
    }

    /// Whether the trailer block must be emitted.
    fn has_trailer(&self) -> bool {
        self.destination.is_some()
            || !self.network_path.is_empty()
            || self.timestamp.is_some()
            || !self.signatures.is_empty()
    }

    /// Deterministic bytes for one named envelope field, the unit the
    /// signature engine hashes over. `None` means the field is absent from
    /// this envelope.
    pub fn field_bytes(&self, name: &str) -> Option<Vec<u8>> {
        match name {
            "requestId" => Some(self.request_id.as_bytes().to_vec()),
            "action" => self.action.as_ref().map(|a| a.as_bytes().to_vec()),
            "payload" => {
                if self.kind.is_error() {
                    None
                } else {
                    Some(self.payload.clone())
                }
            }
            "destination" => self
                .destination
                .as_ref()
                .map(|d| d.as_str().as_bytes().to_vec()),
            "networkPath" => {
                if self.network_path.is_empty() {
                    None
                } else {
                    Some(self.network_path.to_string().into_bytes())
                }
            }
            "timestamp" => self.timestamp.map(|ts| ts.to_be_bytes().to_vec()),
            "errorCode" => self
                .error
                .as_ref()
                .map(|e| e.code.as_str().as_bytes().to_vec()),
            "errorDescription" => self
                .error
                .as_ref()
                .map(|e| e.description.as_bytes().to_vec()),
            "errorDetails" => self
                .error
                .as_ref()
                .map(|e| e.details.to_string().into_bytes()),
            _ => None,
        }
    }

    /// Names of every field present on this envelope, in canonical order.
    pub fn present_fields(&self) -> Vec<String> {
        let mut fields = vec![];
        for name in [
            "action",
            "destination",
            "errorCode",
            "errorDescription",
            "errorDetails",
            "networkPath",
            "payload",
            "requestId",
            "timestamp",
        ] {
            if self.field_bytes(name).is_some() {
                fields.push(name.to_string());
            }
        }
        fields
    }
}

/// Decode one frame. `binary` selects the codec; a websocket text frame uses
/// the JSON codec, a binary frame the fixed-width codec.
pub fn decode(bytes: &[u8], binary: bool) -> crate::Result<Envelope> {
    if binary {
        decode_binary(bytes)
    } else {
        decode_json(bytes)
    }
}

/// Encode one envelope with the selected codec.
pub fn encode(envelope: &Envelope, binary: bool) -> crate::Result<Vec<u8>> {
    if binary {
        Ok(encode_binary(envelope))
    } else {
        encode_json(envelope)
    }
}

//
// JSON codec
//

fn encode_json(envelope: &Envelope) -> crate::Result<Vec<u8>> {
    // Frame elements are raw JSON fragments so the opaque payload bytes pass
    // through untouched; re-serializing them would reorder keys and break
    // any signature covering the payload.
    let mut frame: Vec<Box<RawValue>> = vec![
        raw_fragment(&json!(envelope.kind.wire_id()))?,
        raw_fragment(&json!(envelope.request_id))?,
    ];
    match envelope.kind {
        EnvelopeKind::Request => {
            let action = envelope.action.as_ref().ok_or_else(|| {
                Error::FormationViolation("request without an action".to_string())
            })?;
            frame.push(raw_fragment(&json!(action))?);
            frame.push(payload_to_raw(&envelope.payload)?);
        }
        EnvelopeKind::Response => {
            frame.push(payload_to_raw(&envelope.payload)?);
        }
        EnvelopeKind::RequestError | EnvelopeKind::ResponseError => {
            let fields = envelope.error.as_ref().ok_or_else(|| {
                Error::FormationViolation("error envelope without error fields".to_string())
            })?;
            frame.push(raw_fragment(&json!(fields.code.as_str()))?);
            frame.push(raw_fragment(&json!(fields.description))?);
            frame.push(raw_fragment(&fields.details)?);
        }
    }
    if envelope.has_trailer() {
        frame.push(raw_fragment(&trailer_to_value(envelope))?);
    }
    Ok(serde_json::to_vec(&frame)
        .map_err(|e| Error::FormationViolation(e.to_string()))?)
}

fn raw_fragment(value: &Value) -> crate::Result<Box<RawValue>> {
    serde_json::value::to_raw_value(value).map_err(|e| Error::FormationViolation(e.to_string()))
}

fn payload_to_raw(payload: &[u8]) -> crate::Result<Box<RawValue>> {
    if payload.is_empty() {
        return raw_fragment(&json!({}));
    }
    let text = std::str::from_utf8(payload).map_err(|_| {
        Error::FormationViolation("payload is not UTF-8 for the textual codec".to_string())
    })?;
    RawValue::from_string(text.to_string()).map_err(|_| {
        Error::FormationViolation("payload is not valid JSON for the textual codec".to_string())
    })
}

fn trailer_to_value(envelope: &Envelope) -> Value {
    let mut trailer = serde_json::Map::new();
    if let Some(dest) = &envelope.destination {
        trailer.insert("destination".to_string(), json!(dest.as_str()));
    }
    if !envelope.network_path.is_empty() {
        let hops: Vec<&str> = envelope.network_path.hops().iter().map(|h| h.as_str()).collect();
        trailer.insert("networkPath".to_string(), json!(hops));
    }
    if let Some(ts) = envelope.timestamp {
        trailer.insert("timestamp".to_string(), json!(ts));
    }
    if !envelope.signatures.is_empty() {
        let sigs: Vec<Value> = envelope.signatures.iter().map(signature_to_value).collect();
        trailer.insert("signatures".to_string(), json!(sigs));
    }
    Value::Object(trailer)
}

fn signature_to_value(sig: &Signature) -> Value {
    json!({
        "keyId": sig.key_id,
        "algorithm": sig.algorithm.as_str(),
        "signedFields": sig.signed_fields,
        "signature": hex::encode(&sig.bytes),
    })
}

fn decode_json(bytes: &[u8]) -> crate::Result<Envelope> {
    let frame: Vec<&RawValue> = serde_json::from_slice(bytes)
        .map_err(|e| Error::FormationViolation(format!("invalid JSON frame: {}", e)))?;
    if frame.len() < 3 {
        return Err(Error::FormationViolation(format!(
            "frame arity {} too small",
            frame.len()
        )));
    }

    let wire_id: u64 = serde_json::from_str(frame[0].get())
        .map_err(|_| Error::FormationViolation("kind is not a number".to_string()))?;
    let kind = EnvelopeKind::from_wire_id(wire_id as u8).ok_or_else(|| {
        Error::FormationViolation(format!("unknown envelope kind {}", wire_id))
    })?;
    let request_id: String = serde_json::from_str(frame[1].get())
        .map_err(|_| Error::FormationViolation("requestId is not a string".to_string()))?;

    let (base_arity, mut envelope) = match kind {
        EnvelopeKind::Request => {
            if frame.len() < 4 {
                return Err(Error::FormationViolation("request arity below 4".to_string()));
            }
            let action: String = serde_json::from_str(frame[2].get())
                .map_err(|_| Error::FormationViolation("action is not a string".to_string()))?;
            let payload = object_payload(frame[3], "request payload")?;
            (4, Envelope::new_request(&request_id, &action, payload))
        }
        EnvelopeKind::Response => {
            let payload = object_payload(frame[2], "response payload")?;
            (3, Envelope::new_response(&request_id, payload))
        }
        EnvelopeKind::RequestError | EnvelopeKind::ResponseError => {
            if frame.len() < 5 {
                return Err(Error::FormationViolation("error arity below 5".to_string()));
            }
            let code: String = serde_json::from_str(frame[2].get()).map_err(|_| {
                Error::FormationViolation("errorCode is not a string".to_string())
            })?;
            let description: String = serde_json::from_str(frame[3].get()).map_err(|_| {
                Error::FormationViolation("errorDescription is not a string".to_string())
            })?;
            let details: Value = serde_json::from_str(frame[4].get())
                .map_err(|e| Error::FormationViolation(e.to_string()))?;
            if !details.is_object() {
                return Err(Error::FormationViolation(
                    "errorDetails is not an object".to_string(),
                ));
            }
            let mut envelope = Envelope::new_request_error(
                &request_id,
                ErrorCode::from_str_lossy(&code),
                &description,
            );
            envelope.kind = kind;
            if let Some(fields) = envelope.error.as_mut() {
                fields.details = details;
            }
            (5, envelope)
        }
    };

    match frame.len() {
        n if n == base_arity => {}
        n if n == base_arity + 1 => {
            let trailer: Value = serde_json::from_str(frame[base_arity].get())
                .map_err(|e| Error::FormationViolation(e.to_string()))?;
            apply_trailer(&mut envelope, &trailer)?;
        }
        n => {
            return Err(Error::FormationViolation(format!(
                "unexpected frame arity {}",
                n
            )));
        }
    }
    Ok(envelope)
}

/// Validate a payload element is a JSON object, then hand back its raw bytes
/// exactly as they appeared in the frame.
fn object_payload(raw: &RawValue, what: &str) -> crate::Result<Vec<u8>> {
    let value: Value = serde_json::from_str(raw.get())
        .map_err(|e| Error::FormationViolation(e.to_string()))?;
    if !value.is_object() {
        return Err(Error::FormationViolation(format!(
            "{} is not an object",
            what
        )));
    }
    Ok(raw.get().as_bytes().to_vec())
}

fn apply_trailer(envelope: &mut Envelope, trailer: &Value) -> crate::Result<()> {
    let trailer = trailer.as_object().ok_or_else(|| {
        Error::FormationViolation("routing trailer is not an object".to_string())
    })?;
    if let Some(dest) = trailer.get("destination") {
        let dest = dest.as_str().ok_or_else(|| {
            Error::FormationViolation("destination is not a string".to_string())
        })?;
        envelope.destination = Some(NodeId::new(dest));
    }
    if let Some(path) = trailer.get("networkPath") {
        let hops = path.as_array().ok_or_else(|| {
            Error::FormationViolation("networkPath is not an array".to_string())
        })?;
        let mut parsed = vec![];
        for hop in hops {
            let hop = hop.as_str().ok_or_else(|| {
                Error::FormationViolation("networkPath hop is not a string".to_string())
            })?;
            parsed.push(NodeId::new(hop));
        }
        envelope.network_path = NetworkPath::from_hops(parsed);
    }
    if let Some(ts) = trailer.get("timestamp") {
        let ts = ts.as_u64().ok_or_else(|| {
            Error::FormationViolation("timestamp is not an integer".to_string())
        })?;
        envelope.timestamp = Some(ts);
    }
    if let Some(sigs) = trailer.get("signatures") {
        let sigs = sigs.as_array().ok_or_else(|| {
            Error::FormationViolation("signatures is not an array".to_string())
        })?;
        for sig in sigs {
            envelope.signatures.push(signature_from_value(sig)?);
        }
    }
    Ok(())
}

fn signature_from_value(value: &Value) -> crate::Result<Signature> {
    let obj = value.as_object().ok_or_else(|| {
        Error::FormationViolation("signature is not an object".to_string())
    })?;
    let key_id = obj
        .get("keyId")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::FormationViolation("signature without keyId".to_string()))?;
    let algorithm = obj
        .get("algorithm")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::FormationViolation("signature without algorithm".to_string()))?;
    let algorithm = SignatureAlgorithm::from_name(algorithm).ok_or_else(|| {
        Error::FormationViolation(format!("unknown signature algorithm {}", algorithm))
    })?;
    let signed_fields = obj
        .get("signedFields")
        .and_then(|v| v.as_array())
        .ok_or_else(|| Error::FormationViolation("signature without signedFields".to_string()))?
        .iter()
        .map(|f| {
            f.as_str().map(str::to_string).ok_or_else(|| {
                Error::FormationViolation("signedFields entry is not a string".to_string())
            })
        })
        .collect::<crate::Result<Vec<String>>>()?;
    let bytes = obj
        .get("signature")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::FormationViolation("signature without bytes".to_string()))?;
    let bytes = hex::decode(bytes)
        .map_err(|_| Error::FormationViolation("signature bytes are not hex".to_string()))?;
    Ok(Signature {
        key_id: key_id.to_string(),
        algorithm,
        signed_fields,
        bytes,
    })
}

//
// Binary codec
//
// Fixed-width big-endian records in the style of the textual layout:
//
//   0       u8   kind (2..=5)
//   1       u8   flags (bit0: trailer block, bit1: signature block)
//   2..     str  requestId
//   [Request]        str action
//   [Error kinds]    str code, str description, blob details(JSON)
//   [Req/Resp]       u64 payloadLength, payload
//   [trailer block]  u8 hasDestination, (str destination),
//                    u16 hopCount, hopCount * str,
//                    u8 hasTimestamp, (u64 timestamp)
//   [signature block] u16 count, count * signature
//
// where `str` is a u16 length prefix + UTF-8 bytes and `blob` is a u32
// length prefix + raw bytes. A signature is str keyId, u8 algorithm,
// u16 fieldCount, fieldCount * str, str signatureBytes.
//

const FLAG_TRAILER: u8 = 0b0000_0001;
const FLAG_SIGNATURES: u8 = 0b0000_0010;

fn encode_binary(envelope: &Envelope) -> Vec<u8> {
    let mut vbytes: Vec<u8> = vec![];
    vbytes.push(envelope.kind.wire_id());
    let mut flags = 0u8;
    let has_trailer = envelope.destination.is_some()
        || !envelope.network_path.is_empty()
        || envelope.timestamp.is_some();
    if has_trailer {
        flags |= FLAG_TRAILER;
    }
    if !envelope.signatures.is_empty() {
        flags |= FLAG_SIGNATURES;
    }
    vbytes.push(flags);
    write_str(&mut vbytes, &envelope.request_id);
    match envelope.kind {
        EnvelopeKind::Request => {
            write_str(&mut vbytes, envelope.action.as_deref().unwrap_or(""));
            vbytes.extend(&(envelope.payload.len() as u64).to_be_bytes());
            vbytes.extend(&envelope.payload);
        }
        EnvelopeKind::Response => {
            vbytes.extend(&(envelope.payload.len() as u64).to_be_bytes());
            vbytes.extend(&envelope.payload);
        }
        EnvelopeKind::RequestError | EnvelopeKind::ResponseError => {
            let (code, description, details) = match &envelope.error {
                Some(fields) => (
                    fields.code.as_str().to_string(),
                    fields.description.clone(),
                    fields.details.to_string().into_bytes(),
                ),
                None => (
                    ErrorCode::GenericError.as_str().to_string(),
                    String::new(),
                    b"{}".to_vec(),
                ),
            };
            write_str(&mut vbytes, &code);
            write_str(&mut vbytes, &description);
            vbytes.extend(&(details.len() as u32).to_be_bytes());
            vbytes.extend(&details);
        }
    }
    if has_trailer {
        match &envelope.destination {
            Some(dest) => {
                vbytes.push(1);
                write_str(&mut vbytes, dest.as_str());
            }
            None => vbytes.push(0),
        }
        vbytes.extend(&(envelope.network_path.len() as u16).to_be_bytes());
        for hop in envelope.network_path.hops() {
            write_str(&mut vbytes, hop.as_str());
        }
        match envelope.timestamp {
            Some(ts) => {
                vbytes.push(1);
                vbytes.extend(&ts.to_be_bytes());
            }
            None => vbytes.push(0),
        }
    }
    if !envelope.signatures.is_empty() {
        vbytes.extend(&(envelope.signatures.len() as u16).to_be_bytes());
        for sig in &envelope.signatures {
            write_str(&mut vbytes, &sig.key_id);
            vbytes.push(sig.algorithm.wire_id());
            vbytes.extend(&(sig.signed_fields.len() as u16).to_be_bytes());
            for field in &sig.signed_fields {
                write_str(&mut vbytes, field);
            }
            vbytes.extend(&(sig.bytes.len() as u16).to_be_bytes());
            vbytes.extend(&sig.bytes);
        }
    }
    vbytes
}

fn decode_binary(bytes: &[u8]) -> crate::Result<Envelope> {
    let mut reader = Reader::new(bytes);
    let kind = EnvelopeKind::from_wire_id(reader.read_u8()?).ok_or_else(|| {
        Error::FormationViolation("unknown envelope kind".to_string())
    })?;
    let flags = reader.read_u8()?;
    let request_id = reader.read_str()?;

    let mut envelope = match kind {
        EnvelopeKind::Request => {
            let action = reader.read_str()?;
            let payload_len = reader.read_u64()? as usize;
            let payload = reader.read_bytes(payload_len)?.to_vec();
            Envelope::new_request(&request_id, &action, payload)
        }
        EnvelopeKind::Response => {
            let payload_len = reader.read_u64()? as usize;
            let payload = reader.read_bytes(payload_len)?.to_vec();
            Envelope::new_response(&request_id, payload)
        }
        EnvelopeKind::RequestError | EnvelopeKind::ResponseError => {
            let code = reader.read_str()?;
            let description = reader.read_str()?;
            let details_len = reader.read_u32()? as usize;
            let details_bytes = reader.read_bytes(details_len)?;
            let details: Value = serde_json::from_slice(details_bytes).map_err(|_| {
                Error::FormationViolation("errorDetails is not valid JSON".to_string())
            })?;
            let mut envelope = Envelope::new_request_error(
                &request_id,
                ErrorCode::from_str_lossy(&code),
                &description,
            );
            envelope.kind = kind;
            if let Some(fields) = envelope.error.as_mut() {
                fields.details = details;
            }
            envelope
        }
    };

    if flags & FLAG_TRAILER != 0 {
        if reader.read_u8()? == 1 {
            envelope.destination = Some(NodeId::new(&reader.read_str()?));
        }
        let hop_count = reader.read_u16()? as usize;
        let mut hops = Vec::with_capacity(hop_count);
        for _ in 0..hop_count {
            hops.push(NodeId::new(&reader.read_str()?));
        }
        envelope.network_path = NetworkPath::from_hops(hops);
        if reader.read_u8()? == 1 {
            envelope.timestamp = Some(reader.read_u64()?);
        }
    }
    if flags & FLAG_SIGNATURES != 0 {
        let count = reader.read_u16()? as usize;
        for _ in 0..count {
            let key_id = reader.read_str()?;
            let algorithm = SignatureAlgorithm::from_wire_id(reader.read_u8()?)
                .ok_or_else(|| {
                    Error::FormationViolation("unknown signature algorithm".to_string())
                })?;
            let field_count = reader.read_u16()? as usize;
            let mut signed_fields = Vec::with_capacity(field_count);
            for _ in 0..field_count {
                signed_fields.push(reader.read_str()?);
            }
            let sig_len = reader.read_u16()? as usize;
            let sig_bytes = reader.read_bytes(sig_len)?.to_vec();
            envelope.signatures.push(Signature {
                key_id,
                algorithm,
                signed_fields,
                bytes: sig_bytes,
            });
        }
    }
    if !reader.is_empty() {
        return Err(Error::FormationViolation(
            "trailing garbage after envelope".to_string(),
        ));
    }
    Ok(envelope)
}

fn write_str(vbytes: &mut Vec<u8>, s: &str) {
    vbytes.extend(&(s.len() as u16).to_be_bytes());
    vbytes.extend(s.as_bytes());
}

/// Bounds-checked cursor over a binary frame. Truncated input yields
/// `FormationViolation` instead of a slice panic.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf, pos: 0 }
    }

    fn read_bytes(&mut self, len: usize) -> crate::Result<&'a [u8]> {
        // `len` comes straight off the wire; the subtraction form cannot
        // overflow on a huge declared length.
        if len > self.buf.len() - self.pos {
            return Err(Error::FormationViolation(format!(
                "truncated frame: wanted {} bytes at offset {}, have {}",
                len,
                self.pos,
                self.buf.len()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_u8(&mut self) -> crate::Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    fn read_u16(&mut self) -> crate::Result<u16> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&mut self) -> crate::Result<u32> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_u64(&mut self) -> crate::Result<u64> {
        let bytes = self.read_bytes(8)?;
        let mut out = [0u8; 8];
        out.copy_from_slice(bytes);
        Ok(u64::from_be_bytes(out))
    }

    fn read_str(&mut self) -> crate::Result<String> {
        let len = self.read_u16()? as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| Error::FormationViolation("string field is not UTF-8".to_string()))
    }

    fn is_empty(&self) -> bool {
        self.pos == self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn multi_hop_request() -> Envelope {
        let mut envelope = Envelope::new_request(
            "b3c9",
            "BootNotification",
            br#"{"chargingStation":{"model":"X1","vendorName":"Acme"},"reason":"PowerUp"}"#
                .to_vec(),
        );
        envelope.destination = Some(NodeId::new("CSMS"));
        envelope.network_path =
            NetworkPath::from_hops(vec![NodeId::new("CS001"), NodeId::new("NN1")]);
        envelope
    }

    #[test]
    fn test_json_round_trip_request() {
        let envelope = multi_hop_request();
        let bytes = encode(&envelope, false).unwrap();
        let decoded = decode(&bytes, false).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn test_json_round_trip_response() {
        let envelope = Envelope::new_response("b3c9", br#"{"status":"Accepted"}"#.to_vec());
        let bytes = encode(&envelope, false).unwrap();
        assert_eq!(decode(&bytes, false).unwrap(), envelope);
    }

    #[test]
    fn test_json_round_trip_errors() {
        for kind in [EnvelopeKind::RequestError, EnvelopeKind::ResponseError] {
            let mut envelope = Envelope::new_request_error(
                "e-77",
                ErrorCode::NotImplemented,
                "no handler produced a result",
            );
            envelope.kind = kind;
            envelope.timestamp = Some(1_700_000_000_000);
            let bytes = encode(&envelope, false).unwrap();
            let decoded = decode(&bytes, false).unwrap();
            assert_eq!(decoded, envelope);
        }
    }

    #[test]
    fn test_binary_round_trip() {
        let envelope = multi_hop_request();
        let bytes = encode(&envelope, true).unwrap();
        assert_eq!(decode(&bytes, true).unwrap(), envelope);
    }

    #[test]
    fn test_binary_round_trip_error_with_trailer() {
        let mut envelope =
            Envelope::new_request_error("e-1", ErrorCode::SecurityError, "signature rejected");
        envelope.destination = Some(NodeId::new("CS001"));
        envelope.network_path =
            NetworkPath::from_hops(vec![NodeId::new("NN2"), NodeId::new("NN1")]);
        envelope.timestamp = Some(42);
        let bytes = encode(&envelope, true).unwrap();
        assert_eq!(decode(&bytes, true).unwrap(), envelope);
    }

    #[test]
    fn test_codecs_round_trip_each_other() {
        // The same logical envelope must survive either codec.
        let envelope = multi_hop_request();
        let via_json = decode(&encode(&envelope, false).unwrap(), false).unwrap();
        let via_binary = decode(&encode(&envelope, true).unwrap(), true).unwrap();
        assert_eq!(via_json, via_binary);
    }

    #[test]
    fn test_unknown_action_is_not_a_decode_error() {
        let bytes = br#"[2,"id-1","NoSuchAction",{}]"#;
        let envelope = decode(bytes, false).unwrap();
        assert_eq!(envelope.action.as_deref(), Some("NoSuchAction"));
    }

    #[test]
    fn test_malformed_frames_yield_formation_violation() {
        let cases: Vec<&[u8]> = vec![
            b"not json at all",
            br#"{"kind":2}"#,
            br#"[2,"id-1"]"#,
            br#"[9,"id-1","Action",{}]"#,
            br#"[2,42,"Action",{}]"#,
            br#"[2,"id-1","Action","not an object"]"#,
            br#"[4,"id-1","Code","desc"]"#,
            br#"[2,"id-1","Action",{},{"destination":7}]"#,
        ];
        for bytes in cases {
            match decode(bytes, false) {
                Err(Error::FormationViolation(_)) => {}
                other => panic!("expected FormationViolation for {:?}, got {:?}", bytes, other),
            }
        }
    }

    #[test]
    fn test_truncated_binary_frame() {
        let envelope = multi_hop_request();
        let bytes = encode(&envelope, true).unwrap();
        for cut in [0, 1, 5, bytes.len() / 2, bytes.len() - 1] {
            match decode(&bytes[..cut], true) {
                Err(Error::FormationViolation(_)) => {}
                other => panic!("expected FormationViolation at cut {}, got {:?}", cut, other),
            }
        }
    }

    #[test]
    fn test_json_payload_bytes_survive_verbatim() {
        // Payload keys are not in canonical order; the codec must not
        // rewrite them.
        let envelope =
            Envelope::new_request("r-raw", "DataTransfer", br#"{"b":1,"a":2}"#.to_vec());
        let bytes = encode(&envelope, false).unwrap();
        let decoded = decode(&bytes, false).unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(decoded.payload, br#"{"b":1,"a":2}"#.to_vec());
    }

    #[test]
    fn test_binary_frame_with_oversized_declared_length() {
        // A declared payload length near u64::MAX must be rejected, not
        // panic the decoder.
        let mut bytes = vec![2u8, 0u8];
        bytes.extend(&2u16.to_be_bytes());
        bytes.extend(b"id");
        bytes.extend(&1u16.to_be_bytes());
        bytes.extend(b"A");
        bytes.extend(&u64::MAX.to_be_bytes());
        assert!(matches!(
            decode(&bytes, true),
            Err(Error::FormationViolation(_))
        ));
    }

    #[test]
    fn test_trailing_garbage_binary_frame() {
        let envelope = Envelope::new_response("id", br#"{"ok":true}"#.to_vec());
        let mut bytes = encode(&envelope, true).unwrap();
        bytes.push(0xFF);
        assert!(matches!(
            decode(&bytes, true),
            Err(Error::FormationViolation(_))
        ));
    }
}

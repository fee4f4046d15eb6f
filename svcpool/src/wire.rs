//! Minimal wire helpers: the request header the engine reads and the status
//! codes it writes into synthetic error replies.
//!
//! Everything past the common header is opaque to the engine; services
//! define their own payload layouts.

/// Number of addressable service slots; valid tags are `0..MAX_SERVICES`.
pub const MAX_SERVICES: usize = 8;

/// Service tag as it appears on the wire.
pub type ServiceTag = u16;

/// Bytes of request header the engine requires: service tag then opcode,
/// both little-endian `u16`. The opcode is routed through untouched.
pub const REQUEST_HEADER_LEN: usize = 4;

/// Status codes clients see in synthetic replies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum Status {
    Ok = 0,
    /// The request payload lacked the common header.
    MessageTooShort = 1,
    /// The decoded tag is out of range or has no registered service.
    ServiceNotAvailable = 2,
}

impl Status {
    /// Decodes a raw status word.
    pub fn from_raw(raw: u32) -> Option<Status> {
        match raw {
            0 => Some(Status::Ok),
            1 => Some(Status::MessageTooShort),
            2 => Some(Status::ServiceNotAvailable),
            _ => None,
        }
    }
}

/// Decodes the service tag from the leading request bytes, or `None` when
/// the payload is shorter than the common header.
pub fn request_service_tag(payload: &[u8]) -> Option<ServiceTag> {
    if payload.len() < REQUEST_HEADER_LEN {
        return None;
    }
    Some(u16::from_le_bytes([payload[0], payload[1]]))
}

/// Encodes a request header in front of `body`.
pub fn encode_request(tag: ServiceTag, opcode: u16, body: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(REQUEST_HEADER_LEN + body.len());
    payload.extend_from_slice(&tag.to_le_bytes());
    payload.extend_from_slice(&opcode.to_le_bytes());
    payload.extend_from_slice(body);
    payload
}

/// Overwrites `reply` with a status-only error response.
pub fn prepare_error_response(reply: &mut Vec<u8>, status: Status) {
    reply.clear();
    reply.extend_from_slice(&(status as u32).to_le_bytes());
}

/// Reads the status word of a reply payload.
pub fn response_status(payload: &[u8]) -> Option<Status> {
    let raw: [u8; 4] = payload.get(..4)?.try_into().ok()?;
    Status::from_raw(u32::from_le_bytes(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_service_tag() {
        assert_eq!(request_service_tag(&encode_request(3, 0, b"body")), Some(3));
        assert_eq!(request_service_tag(&[5, 0, 0, 0]), Some(5));
        assert_eq!(request_service_tag(&[0x34, 0x12, 0, 0]), Some(0x1234));
    }

    #[test]
    fn test_short_payloads_have_no_tag() {
        assert_eq!(request_service_tag(&[]), None);
        assert_eq!(request_service_tag(&[1]), None);
        assert_eq!(request_service_tag(&[1, 0, 0]), None);
    }

    #[test]
    fn test_error_response_roundtrip() {
        let mut reply = b"stale contents".to_vec();
        prepare_error_response(&mut reply, Status::ServiceNotAvailable);
        assert_eq!(reply.len(), 4);
        assert_eq!(response_status(&reply), Some(Status::ServiceNotAvailable));

        prepare_error_response(&mut reply, Status::MessageTooShort);
        assert_eq!(response_status(&reply), Some(Status::MessageTooShort));
    }

    #[test]
    fn test_unknown_status_word() {
        assert_eq!(response_status(&99u32.to_le_bytes()), None);
        assert_eq!(response_status(&[1, 0]), None);
    }
}

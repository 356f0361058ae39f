//! Deserialisation of DNS messages from the network.  See the `types`
//! module for details of the format.
//!
//! Parsing is strict: a message which runs short, or whose
//! compression pointers misbehave, is an error in its entirety.  No
//! partially-parsed record lists are returned.

use bytes::Bytes;

use crate::protocol::types::*;

/// The most compression-pointer hops tolerated while expanding a
/// single name.  Far beyond anything legitimate, but bounds the work a
/// hostile message can cause.
pub const POINTER_HOP_LIMIT: usize = 128;

/// Decode a response message, checking its ID against the query that
/// prompted it.
///
/// The question sections are consumed (and the first is retained);
/// answer, authority, and additional records are all parsed, both to
/// keep them and to advance the offset correctly.
///
/// # Errors
///
/// If the message cannot be parsed, is not a response, carries a
/// reserved RCODE, or its ID is not the expected one.
pub fn decode_response(octets: &[u8], expected_id: u16) -> Result<DnsResponse, DecodeError> {
    let buffer = &mut ConsumableBuffer::new(octets);
    let header = decode_header(buffer)?;

    if header.id != expected_id {
        return Err(DecodeError::IdMismatch {
            expected: expected_id,
            actual: header.id,
        });
    }
    if !header.is_response {
        return Err(DecodeError::NotAResponse(header.id));
    }

    let mut question = None;
    for _ in 0..header.qdcount {
        let parsed = decode_question(header.id, buffer)?;
        question.get_or_insert(parsed);
    }

    let mut answers = Vec::with_capacity(usize::from(header.ancount));
    for _ in 0..header.ancount {
        answers.push(decode_record(header.id, buffer)?);
    }
    let mut authority = Vec::with_capacity(usize::from(header.nscount));
    for _ in 0..header.nscount {
        authority.push(decode_record(header.id, buffer)?);
    }
    let mut additional = Vec::with_capacity(usize::from(header.arcount));
    for _ in 0..header.arcount {
        additional.push(decode_record(header.id, buffer)?);
    }

    Ok(DnsResponse {
        id: header.id,
        rcode: header.rcode,
        authoritative: header.is_authoritative,
        question,
        answers,
        authority,
        additional,
    })
}

/// Decode an inbound query, returning its first question.
///
/// # Errors
///
/// If the message cannot be parsed, is not a query, uses a
/// non-standard opcode, or has no question.  Errors carry the header
/// ID when one was parsed, so a FORMERR response can be addressed.
pub fn decode_query(octets: &[u8]) -> Result<Question, DecodeError> {
    let buffer = &mut ConsumableBuffer::new(octets);
    let header = decode_header(buffer)?;

    if header.is_response {
        return Err(DecodeError::NotAQuery(header.id));
    }
    if header.opcode != 0 {
        return Err(DecodeError::UnsupportedOpcode {
            id: header.id,
            opcode: header.opcode,
        });
    }
    if header.qdcount == 0 {
        return Err(DecodeError::QuestionTooShort(header.id));
    }

    decode_question(header.id, buffer)
}

/// The parsed 12-octet header.
struct WireHeader {
    id: u16,
    is_response: bool,
    opcode: u8,
    is_authoritative: bool,
    rcode: Rcode,
    qdcount: u16,
    ancount: u16,
    nscount: u16,
    arcount: u16,
}

fn decode_header(buffer: &mut ConsumableBuffer) -> Result<WireHeader, DecodeError> {
    let id = buffer.next_u16().ok_or(DecodeError::CompletelyBusted)?;
    let flags1 = buffer.next_u8().ok_or(DecodeError::HeaderTooShort(id))?;
    let flags2 = buffer.next_u8().ok_or(DecodeError::HeaderTooShort(id))?;
    let qdcount = buffer.next_u16().ok_or(DecodeError::HeaderTooShort(id))?;
    let ancount = buffer.next_u16().ok_or(DecodeError::HeaderTooShort(id))?;
    let nscount = buffer.next_u16().ok_or(DecodeError::HeaderTooShort(id))?;
    let arcount = buffer.next_u16().ok_or(DecodeError::HeaderTooShort(id))?;

    let rcode_value = flags2 & HEADER_MASK_RCODE;
    let rcode = Rcode::try_from_u8(rcode_value).map_err(|_| DecodeError::RcodeInvalid {
        id,
        value: rcode_value,
    })?;

    Ok(WireHeader {
        id,
        is_response: flags1 & HEADER_MASK_QR != 0,
        opcode: (flags1 & HEADER_MASK_OPCODE) >> HEADER_OFFSET_OPCODE,
        is_authoritative: flags1 & HEADER_MASK_AA != 0,
        rcode,
        qdcount,
        ancount,
        nscount,
        arcount,
    })
}

fn decode_question(id: u16, buffer: &mut ConsumableBuffer) -> Result<Question, DecodeError> {
    let name = decode_name(id, buffer)?;
    let qtype = buffer.next_u16().ok_or(DecodeError::QuestionTooShort(id))?;
    let qclass = buffer.next_u16().ok_or(DecodeError::QuestionTooShort(id))?;

    Ok(Question {
        id,
        name,
        qtype: RecordType::from(qtype),
        qclass: RecordClass::from(qclass),
    })
}

fn decode_record(id: u16, buffer: &mut ConsumableBuffer) -> Result<ResourceRecord, DecodeError> {
    let name = decode_name(id, buffer)?;
    let rtype = buffer.next_u16().ok_or(DecodeError::RecordTooShort(id))?;
    let rclass = buffer.next_u16().ok_or(DecodeError::RecordTooShort(id))?;
    let ttl = buffer.next_u32().ok_or(DecodeError::RecordTooShort(id))?;
    let rdlength = buffer.next_u16().ok_or(DecodeError::RecordTooShort(id))?;
    let rdata = buffer
        .take(usize::from(rdlength))
        .ok_or(DecodeError::RecordTooShort(id))?;

    Ok(ResourceRecord {
        name,
        rtype: RecordType::from(rtype),
        rclass: RecordClass::from(rclass),
        ttl,
        expires_at: None,
        data: Bytes::copy_from_slice(rdata),
        text: String::new(),
    })
}

/// Expand a (possibly compressed) name starting at the buffer's
/// position.
///
/// A compression pointer (two high bits set) is a 14-bit offset into
/// the original message.  Pointers may only point strictly before the
/// name currently being parsed (RFC 1035 section 4.1.4 requires a
/// *prior* occurrence), which rules out cycles; the hop count bounds
/// the chain regardless.
fn decode_name(id: u16, buffer: &mut ConsumableBuffer) -> Result<Name, DecodeError> {
    let mut labels = Vec::with_capacity(8);
    collect_labels(id, buffer, 0, &mut labels)?;

    let label_refs: Vec<&[u8]> = labels.iter().map(Vec::as_slice).collect();
    Name::from_labels(&label_refs).map_err(|_| DecodeError::NameInvalid(id))
}

fn collect_labels(
    id: u16,
    buffer: &mut ConsumableBuffer,
    hops: usize,
    labels: &mut Vec<Vec<u8>>,
) -> Result<(), DecodeError> {
    let start = buffer.position;
    let mut encoded_len = 1;

    loop {
        let size = buffer.next_u8().ok_or(DecodeError::NameTooShort(id))?;

        if size == 0 {
            return Ok(());
        } else if usize::from(size) <= LABEL_MAX_LEN {
            encoded_len += 1 + usize::from(size);
            if encoded_len > NAME_MAX_LEN {
                return Err(DecodeError::NameTooLong(id));
            }

            let octets = buffer
                .take(usize::from(size))
                .ok_or(DecodeError::NameTooShort(id))?;
            labels.push(octets.to_vec());
        } else if size >= 192 {
            if hops >= POINTER_HOP_LIMIT {
                return Err(DecodeError::PointerLimit(id));
            }

            let hi = size & 0b0011_1111;
            let lo = buffer.next_u8().ok_or(DecodeError::NameTooShort(id))?;
            let ptr = usize::from(u16::from_be_bytes([hi, lo]));

            // pointer must be to an earlier occurrence (not merely a
            // different one: an earlier one: RFC 1035 section 4.1.4)
            if ptr >= start {
                return Err(DecodeError::PointerInvalid(id));
            }

            return collect_labels(id, &mut buffer.at_offset(ptr), hops + 1, labels);
        } else {
            return Err(DecodeError::LabelInvalid(id));
        }
    }
}

/// Errors encountered when parsing a datagram.  In all the errors
/// which have a `u16` parameter, that is the ID from the header - so
/// that an error response can be sent.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum DecodeError {
    /// The datagram is not even 2 octets long, so it doesn't even
    /// contain a valid ID.  An error cannot even be sent back to the
    /// client in this case as, without an ID, it cannot be linked
    /// with the correct query.
    CompletelyBusted,

    /// The header is missing one or more required fields.
    HeaderTooShort(u16),

    /// A question ends with an incomplete field, or a query has no
    /// question at all.
    QuestionTooShort(u16),

    /// A resource record ends with an incomplete field.
    RecordTooShort(u16),

    /// A name is incomplete.
    NameTooShort(u16),

    /// A name is over 255 octets in size.
    NameTooLong(u16),

    /// A name's labels do not form a valid canonical name.
    NameInvalid(u16),

    /// A compression pointer points to or after the current name.
    PointerInvalid(u16),

    /// A name chains through more compression pointers than the hop
    /// limit allows.
    PointerLimit(u16),

    /// A label is longer than 63 octets, but not a pointer.
    LabelInvalid(u16),

    /// The RCODE field is a reserved value.
    RcodeInvalid { id: u16, value: u8 },

    /// A response's ID does not match the query it should answer.
    IdMismatch { expected: u16, actual: u16 },

    /// Expected a response but the QR flag says query.
    NotAResponse(u16),

    /// Expected a query but the QR flag says response.
    NotAQuery(u16),

    /// The query uses an opcode this server does not implement.
    UnsupportedOpcode { id: u16, opcode: u8 },
}

impl DecodeError {
    pub fn id(self) -> Option<u16> {
        match self {
            DecodeError::CompletelyBusted => None,
            DecodeError::HeaderTooShort(id)
            | DecodeError::QuestionTooShort(id)
            | DecodeError::RecordTooShort(id)
            | DecodeError::NameTooShort(id)
            | DecodeError::NameTooLong(id)
            | DecodeError::NameInvalid(id)
            | DecodeError::PointerInvalid(id)
            | DecodeError::PointerLimit(id)
            | DecodeError::LabelInvalid(id)
            | DecodeError::RcodeInvalid { id, .. }
            | DecodeError::NotAResponse(id)
            | DecodeError::NotAQuery(id)
            | DecodeError::UnsupportedOpcode { id, .. } => Some(id),
            DecodeError::IdMismatch { actual, .. } => Some(actual),
        }
    }
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            DecodeError::CompletelyBusted => write!(f, "datagram too short to carry an ID"),
            DecodeError::HeaderTooShort(_) => write!(f, "header too short"),
            DecodeError::QuestionTooShort(_) => write!(f, "question too short"),
            DecodeError::RecordTooShort(_) => write!(f, "resource record too short"),
            DecodeError::NameTooShort(_) => write!(f, "name too short"),
            DecodeError::NameTooLong(_) => write!(f, "name over 255 octets"),
            DecodeError::NameInvalid(_) => write!(f, "name is not a valid canonical name"),
            DecodeError::PointerInvalid(_) => write!(f, "compression pointer does not point backwards"),
            DecodeError::PointerLimit(_) => write!(f, "compression pointer chain too long"),
            DecodeError::LabelInvalid(_) => write!(f, "label over 63 octets"),
            DecodeError::RcodeInvalid { value, .. } => write!(f, "reserved RCODE {value}"),
            DecodeError::IdMismatch { expected, actual } => {
                write!(f, "expected ID {expected} but got {actual}")
            }
            DecodeError::NotAResponse(_) => write!(f, "expected a response, got a query"),
            DecodeError::NotAQuery(_) => write!(f, "expected a query, got a response"),
            DecodeError::UnsupportedOpcode { opcode, .. } => {
                write!(f, "unsupported opcode {opcode}")
            }
        }
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

/// A buffer which will be consumed by the parsing process.
pub struct ConsumableBuffer<'a> {
    octets: &'a [u8],
    position: usize,
}

impl<'a> ConsumableBuffer<'a> {
    pub fn new(octets: &'a [u8]) -> Self {
        Self { octets, position: 0 }
    }

    pub fn next_u8(&mut self) -> Option<u8> {
        if self.octets.len() > self.position {
            let a = self.octets[self.position];
            self.position += 1;
            Some(a)
        } else {
            None
        }
    }

    pub fn next_u16(&mut self) -> Option<u16> {
        if self.octets.len() > self.position + 1 {
            let a = self.octets[self.position];
            let b = self.octets[self.position + 1];
            self.position += 2;
            Some(u16::from_be_bytes([a, b]))
        } else {
            None
        }
    }

    pub fn next_u32(&mut self) -> Option<u32> {
        if self.octets.len() > self.position + 3 {
            let a = self.octets[self.position];
            let b = self.octets[self.position + 1];
            let c = self.octets[self.position + 2];
            let d = self.octets[self.position + 3];
            self.position += 4;
            Some(u32::from_be_bytes([a, b, c, d]))
        } else {
            None
        }
    }

    pub fn take(&mut self, size: usize) -> Option<&'a [u8]> {
        if self.octets.len() >= self.position + size {
            let slice = &self.octets[self.position..self.position + size];
            self.position += size;
            Some(slice)
        } else {
            None
        }
    }

    pub fn at_offset(&self, position: usize) -> ConsumableBuffer<'a> {
        Self {
            octets: self.octets,
            position,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::serialise::{encode_query, encode_response};
    use crate::protocol::types::test_util::*;

    #[test]
    fn decode_response_rejects_short_buffers() {
        assert_eq!(Err(DecodeError::CompletelyBusted), decode_response(&[], 0));
        assert_eq!(
            Err(DecodeError::CompletelyBusted),
            decode_response(&[0x01], 0)
        );
        assert_eq!(
            Err(DecodeError::HeaderTooShort(7)),
            decode_response(&[0, 7, 0x80, 0, 0, 0], 7)
        );
    }

    #[test]
    fn decode_response_checks_id() {
        let octets = response_bytes(21, &[]);
        assert_eq!(
            Err(DecodeError::IdMismatch {
                expected: 12,
                actual: 21
            }),
            decode_response(&octets, 12)
        );
    }

    #[test]
    fn decode_response_checks_qr() {
        let q = question(5, "www.example.com.", RecordType::A);
        let octets = encode_query(&q).unwrap();
        assert_eq!(Err(DecodeError::NotAResponse(5)), decode_response(&octets, 5));
    }

    #[test]
    fn decode_response_parses_answers() {
        let rr = a_record("www.example.com.", [192, 0, 2, 1]);
        let octets = response_bytes(33, std::slice::from_ref(&rr));

        let decoded = decode_response(&octets, 33).unwrap();
        assert_eq!(33, decoded.id);
        assert_eq!(Rcode::NoError, decoded.rcode);
        assert_eq!(vec![rr], decoded.answers);
        assert!(decoded.authority.is_empty());
        assert!(decoded.additional.is_empty());
    }

    #[test]
    fn decode_response_is_strict_about_short_records() {
        let rr = a_record("www.example.com.", [192, 0, 2, 1]);
        let octets = response_bytes(33, &[rr]);

        // chopping anywhere inside the answer is an error, not a
        // partial parse
        for cut in 34..octets.len() {
            let result = decode_response(&octets[..cut], 33);
            assert!(result.is_err(), "cut at {cut} parsed: {result:?}");
        }
    }

    #[test]
    #[rustfmt::skip]
    fn decode_expands_compression_pointers() {
        // a response with two A records; the second record's name is a
        // pointer to the first name at offset 12.
        let octets = vec![
            0, 8, // ID
            0b1000_0000, 0b1000_0000, // QR=1, RA=1
            0, 0, // QDCOUNT
            0, 2, // ANCOUNT
            0, 0, // NSCOUNT
            0, 0, // ARCOUNT
            // answer 1, name at offset 12
            3, b'w', b'w', b'w',
            7, b'e', b'x', b'a', b'm', b'p', b'l', b'e',
            3, b'c', b'o', b'm', 0,
            0, 1, 0, 1, // A IN
            0, 0, 1, 44, // TTL = 300
            0, 4, 192, 0, 2, 1,
            // answer 2, name = pointer to offset 12
            0b1100_0000, 12,
            0, 1, 0, 1,
            0, 0, 1, 44,
            0, 4, 192, 0, 2, 2,
        ];

        let decoded = decode_response(&octets, 8).unwrap();
        assert_eq!(2, decoded.answers.len());
        assert_eq!("www.example.com.", decoded.answers[0].name.as_str());
        assert_eq!("www.example.com.", decoded.answers[1].name.as_str());

        // re-encoding without compression and re-decoding yields the
        // same logical response
        let question = question(8, "www.example.com.", RecordType::A);
        let mut rebuilt = DnsResponse::with_answers(&question, decoded.answers.clone());
        rebuilt.question = None;
        let re_encoded = encode_response(&rebuilt).unwrap();
        let re_decoded = decode_response(&re_encoded, 8).unwrap();
        assert_eq!(decoded.answers, re_decoded.answers);
    }

    #[test]
    #[rustfmt::skip]
    fn decode_rejects_forward_pointers() {
        let octets = vec![
            0, 9,
            0b1000_0000, 0b1000_0000,
            0, 0,
            0, 1,
            0, 0,
            0, 0,
            // answer name = pointer to itself
            0b1100_0000, 12,
            0, 1, 0, 1,
            0, 0, 1, 44,
            0, 4, 192, 0, 2, 1,
        ];

        assert_eq!(Err(DecodeError::PointerInvalid(9)), decode_response(&octets, 9));
    }

    #[test]
    #[rustfmt::skip]
    fn decode_rejects_reserved_rcode() {
        let octets = vec![
            0, 1,
            0b1000_0000, 0b1000_1100, // RCODE = 12
            0, 0, 0, 0, 0, 0, 0, 0,
        ];
        assert_eq!(
            Err(DecodeError::RcodeInvalid { id: 1, value: 12 }),
            decode_response(&octets, 1)
        );
    }

    #[test]
    #[allow(clippy::cast_possible_truncation)]
    fn decode_rejects_overlong_pointer_chains() {
        // every pointer points strictly backwards, so the forward
        // guard never fires; the hop cap has to
        let mut octets = vec![
            0, 3, // ID
            0b1000_0000, 0b1000_0000, // QR=1, RA=1
            0, 131, // QDCOUNT
            0, 0, 0, 0, 0, 0,
        ];
        // first question: a real name
        octets.extend_from_slice(&[1, b'a', 0, 0, 1, 0, 1]);
        // each later question's name is a pointer to the previous
        // question's name, so chains grow one hop per question
        let mut previous_name = 12u16;
        for _ in 0..130 {
            let here = octets.len() as u16;
            octets.push(0b1100_0000 | (previous_name >> 8) as u8);
            octets.push((previous_name & 0xff) as u8);
            octets.extend_from_slice(&[0, 1, 0, 1]);
            previous_name = here;
        }

        assert_eq!(
            Err(DecodeError::PointerLimit(3)),
            decode_response(&octets, 3)
        );
    }

    #[test]
    fn decode_query_roundtrips_encode_query() {
        let q = question(4660, "mail.example.org.", RecordType::MX);
        let octets = encode_query(&q).unwrap();
        assert_eq!(Ok(q), decode_query(&octets));
    }

    #[test]
    fn decode_query_rejects_responses_and_odd_opcodes() {
        let q = question(1, "www.example.com.", RecordType::A);
        let response = DnsResponse::empty(&q, Rcode::NoError);
        let octets = encode_response(&response).unwrap();
        assert_eq!(Err(DecodeError::NotAQuery(1)), decode_query(&octets));

        let mut query = encode_query(&q).unwrap();
        query[2] |= 0b0001_0000; // opcode 2 (STATUS)
        assert_eq!(
            Err(DecodeError::UnsupportedOpcode { id: 1, opcode: 2 }),
            decode_query(&query)
        );
    }

    #[test]
    fn decode_query_requires_a_question() {
        let q = question(6, "www.example.com.", RecordType::A);
        let mut octets = encode_query(&q).unwrap();
        octets[5] = 0; // QDCOUNT = 0
        octets.truncate(12);
        assert_eq!(Err(DecodeError::QuestionTooShort(6)), decode_query(&octets));
    }

    /// Serialise a response with the given answers and no question
    /// echo, via the production encoder.
    fn response_bytes(id: u16, answers: &[ResourceRecord]) -> Vec<u8> {
        let q = question(id, "www.example.com.", RecordType::A);
        let mut response = DnsResponse::with_answers(&q, answers.to_vec());
        response.question = None;
        encode_response(&response).unwrap()
    }
}

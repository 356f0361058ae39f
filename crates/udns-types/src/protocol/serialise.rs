//! Serialisation of DNS messages to the wire format.  See the `types`
//! module for details of the format.

use std::time::Instant;

use crate::protocol::types::*;

/// Maximum UDP payload without EDNS.  Responses over this limit are
/// truncated at a record boundary and flagged TC.
pub const MAX_UDP_PAYLOAD: usize = 512;

/// Encode a query message for the question: a 12-octet header (ID
/// echoed, QR=0, opcode 0, RD=1, QDCOUNT=1) followed by the question
/// section.
///
/// # Errors
///
/// If a label is over 63 octets or the name encodes to over 255
/// octets.  Neither can happen to a `Name` built through its
/// validating constructors.
pub fn encode_query(question: &Question) -> Result<Vec<u8>, EncodeError> {
    let mut buffer = WritableBuffer::default();

    buffer.write_u16(question.id);
    buffer.write_u8(HEADER_MASK_RD);
    buffer.write_u8(0);
    buffer.write_u16(1); // QDCOUNT
    buffer.write_u16(0); // ANCOUNT
    buffer.write_u16(0); // NSCOUNT
    buffer.write_u16(0); // ARCOUNT

    write_question(&mut buffer, question)?;

    Ok(buffer.octets)
}

/// Encode a response message: QR=1, AA per the response, RA set, the
/// RCODE as given, a question echo when there is one, then the three
/// record sections.
///
/// Cached records are written with their remaining TTL as of now;
/// authoritative records with their original TTL.
///
/// Names are not compressed.  If the result exceeds 512 octets the
/// trailing records are dropped at a record boundary and the TC flag
/// is set.
///
/// # Errors
///
/// If a name fails the length checks or a section or RDATA length
/// does not fit in 16 bits.
pub fn encode_response(response: &DnsResponse) -> Result<Vec<u8>, EncodeError> {
    encode_response_at(response, Instant::now())
}

/// `encode_response` against an explicit clock reading, for callers
/// (and tests) that need a fixed time.
///
/// # Errors
///
/// As `encode_response`.
pub fn encode_response_at(response: &DnsResponse, now: Instant) -> Result<Vec<u8>, EncodeError> {
    let ancount = usize_to_u16(response.answers.len())?;
    let nscount = usize_to_u16(response.authority.len())?;
    let arcount = usize_to_u16(response.additional.len())?;

    let mut buffer = WritableBuffer::default();

    let flags1 = HEADER_MASK_QR
        | if response.authoritative {
            HEADER_MASK_AA
        } else {
            0
        };
    let flags2 = HEADER_MASK_RA | (HEADER_MASK_RCODE & u8::from(response.rcode));

    buffer.write_u16(response.id);
    buffer.write_u8(flags1);
    buffer.write_u8(flags2);
    buffer.write_u16(u16::from(response.question.is_some()));
    buffer.write_u16(ancount);
    buffer.write_u16(nscount);
    buffer.write_u16(arcount);

    if let Some(question) = &response.question {
        write_question(&mut buffer, question)?;
    }
    let question_end = buffer.index();

    // remember where each record ends, and in which section, so the
    // message can be cut back to a record boundary if it overflows.
    let mut boundaries = Vec::with_capacity(
        response.answers.len() + response.authority.len() + response.additional.len(),
    );
    let sections = [
        &response.answers,
        &response.authority,
        &response.additional,
    ];
    for (section, records) in sections.iter().enumerate() {
        for rr in records.iter() {
            write_record(&mut buffer, rr, now)?;
            boundaries.push((buffer.index(), section));
        }
    }

    if buffer.index() > MAX_UDP_PAYLOAD {
        truncate_to_boundary(&mut buffer, question_end, &boundaries);
    }

    Ok(buffer.octets)
}

/// Cut an overflowing message back to the last record boundary within
/// the UDP payload limit, fix up the section counts, and set TC.  The
/// header and question echo always fit (a name is at most 255 octets)
/// and are never cut.
fn truncate_to_boundary(
    buffer: &mut WritableBuffer,
    question_end: usize,
    boundaries: &[(usize, usize)],
) {
    let mut keep_len = question_end;
    let mut kept = [0u16; 3];

    for &(end, section) in boundaries {
        if end > MAX_UDP_PAYLOAD {
            break;
        }
        keep_len = end;
        kept[section] += 1;
    }

    buffer.octets.truncate(keep_len);
    buffer.octets[2] |= HEADER_MASK_TC;

    let [an_hi, an_lo] = kept[0].to_be_bytes();
    let [ns_hi, ns_lo] = kept[1].to_be_bytes();
    let [ar_hi, ar_lo] = kept[2].to_be_bytes();
    buffer.octets[6] = an_hi;
    buffer.octets[7] = an_lo;
    buffer.octets[8] = ns_hi;
    buffer.octets[9] = ns_lo;
    buffer.octets[10] = ar_hi;
    buffer.octets[11] = ar_lo;
}

fn write_question(buffer: &mut WritableBuffer, question: &Question) -> Result<(), EncodeError> {
    write_name(buffer, &question.name)?;
    buffer.write_u16(question.qtype.into());
    buffer.write_u16(question.qclass.into());
    Ok(())
}

fn write_record(
    buffer: &mut WritableBuffer,
    rr: &ResourceRecord,
    now: Instant,
) -> Result<(), EncodeError> {
    write_name(buffer, &rr.name)?;
    buffer.write_u16(rr.rtype.into());
    buffer.write_u16(rr.rclass.into());
    buffer.write_u32(rr.effective_ttl(now));

    // filled in below
    let rdlength_index = buffer.index();
    buffer.write_u16(0);

    if rr.data.is_empty() {
        buffer.write_octets(rr.text.as_bytes());
    } else {
        buffer.write_octets(&rr.data);
    }

    // -2 so we don't also include the 2 octets for the rdlength
    let rdlength = usize_to_u16(buffer.index() - rdlength_index - 2)?;
    let [hi, lo] = rdlength.to_be_bytes();
    buffer.octets[rdlength_index] = hi;
    buffer.octets[rdlength_index + 1] = lo;

    Ok(())
}

/// Write a name as length-prefixed labels terminated by the zero
/// octet.
fn write_name(buffer: &mut WritableBuffer, name: &Name) -> Result<(), EncodeError> {
    let start = buffer.index();

    for label in name.labels() {
        if label.len() > LABEL_MAX_LEN {
            return Err(EncodeError::InvalidName { name: name.clone() });
        }
        #[allow(clippy::cast_possible_truncation)]
        buffer.write_u8(label.len() as u8);
        buffer.write_octets(label.as_bytes());
    }
    buffer.write_u8(0);

    if buffer.index() - start > NAME_MAX_LEN {
        return Err(EncodeError::InvalidName { name: name.clone() });
    }

    Ok(())
}

/// Errors encountered when serialising a message.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum EncodeError {
    /// A name violates the label or total length limits.
    InvalidName { name: Name },

    /// A counter does not fit in the desired width.
    CounterTooLarge { counter: usize, bits: u32 },
}

impl std::fmt::Display for EncodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            EncodeError::InvalidName { name } => {
                write!(f, "'{name}' cannot be encoded as labels")
            }
            EncodeError::CounterTooLarge { counter, bits } => {
                write!(f, "'{counter}' cannot be converted to a u{bits}")
            }
        }
    }
}

impl std::error::Error for EncodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

/// A buffer which can be written to, for serialisation purposes.
pub struct WritableBuffer {
    pub octets: Vec<u8>,
}

impl Default for WritableBuffer {
    fn default() -> Self {
        Self {
            octets: Vec::with_capacity(MAX_UDP_PAYLOAD),
        }
    }
}

impl WritableBuffer {
    pub fn index(&self) -> usize {
        self.octets.len()
    }

    pub fn write_u8(&mut self, octet: u8) {
        self.octets.push(octet);
    }

    pub fn write_u16(&mut self, value: u16) {
        for octet in value.to_be_bytes() {
            self.octets.push(octet);
        }
    }

    pub fn write_u32(&mut self, value: u32) {
        for octet in value.to_be_bytes() {
            self.octets.push(octet);
        }
    }

    pub fn write_octets(&mut self, octets: &[u8]) {
        for octet in octets {
            self.octets.push(*octet);
        }
    }
}

/// Helper function to convert a `usize` into a `u16` (or return an error).
fn usize_to_u16(counter: usize) -> Result<u16, EncodeError> {
    if let Ok(t) = u16::try_from(counter) {
        Ok(t)
    } else {
        Err(EncodeError::CounterTooLarge {
            counter,
            bits: u16::BITS,
        })
    }
}

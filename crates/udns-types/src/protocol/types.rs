use bytes::Bytes;
use std::fmt;
use std::time::Instant;

/// The maximum encoded length of a domain name, including both length
/// and label octets.  See RFC 1035 section 2.3.4.
pub const NAME_MAX_LEN: usize = 255;

/// Header flag masks and offsets.  The flags occupy two octets:
///
/// ```text
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |QR|   Opcode  |AA|TC|RD|RA|   Z    |   RCODE   |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
/// ```
///
/// See section 4.1.1 of RFC 1035.
pub const HEADER_MASK_QR: u8 = 0b1000_0000;
pub const HEADER_MASK_OPCODE: u8 = 0b0111_1000;
pub const HEADER_OFFSET_OPCODE: u8 = 3;
pub const HEADER_MASK_AA: u8 = 0b0000_0100;
pub const HEADER_MASK_TC: u8 = 0b0000_0010;
pub const HEADER_MASK_RD: u8 = 0b0000_0001;
pub const HEADER_MASK_RA: u8 = 0b1000_0000;
pub const HEADER_MASK_RCODE: u8 = 0b0000_1111;

/// The maximum length of a single label.  See RFC 1035 section 2.3.4.
pub const LABEL_MAX_LEN: usize = 63;

/// A canonical domain name: lowercased ASCII, whitespace-trimmed, and
/// always terminated with a single trailing dot.  The root is `"."`.
///
/// Every name flowing between components below the wire boundary is
/// canonical, so the rest of the system can compare names, derive
/// fingerprints, and reverse byte sequences without worrying about
/// case or dot placement.
///
/// Construction always validates: a `Name` that exists is canonical
/// and within the RFC 1035 length limits.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Name {
    inner: String,
}

impl Name {
    /// The root name, `"."`.
    pub fn root() -> Self {
        Self {
            inner: ".".to_string(),
        }
    }

    /// Canonicalise a string: trim surrounding whitespace, lowercase,
    /// and append the trailing dot if it is missing.
    ///
    /// Canonicalisation is idempotent: feeding the output back in
    /// produces the same name.
    ///
    /// # Errors
    ///
    /// If the name is empty, not ASCII, has an empty or over-long
    /// label, or exceeds the total encoded length limit.
    pub fn canonicalise(s: &str) -> Result<Self, ValidationError> {
        let trimmed = s.trim();

        if trimmed.is_empty() {
            return Err(ValidationError::EmptyName);
        }
        if trimmed == "." {
            return Ok(Self::root());
        }
        if !trimmed.is_ascii() {
            return Err(ValidationError::NameNotAscii {
                name: trimmed.into(),
            });
        }

        let mut inner = trimmed.to_ascii_lowercase();
        if !inner.ends_with('.') {
            inner.push('.');
        }

        // 1 length octet per label, plus the label octets, plus the
        // root's zero octet.
        let mut encoded_len = 1;
        let without_dot = &inner[..inner.len() - 1];
        for label in without_dot.split('.') {
            if label.is_empty() {
                return Err(ValidationError::EmptyLabel {
                    name: inner.clone(),
                });
            }
            if label.len() > LABEL_MAX_LEN {
                return Err(ValidationError::LabelTooLong {
                    label: label.into(),
                });
            }
            encoded_len += 1 + label.len();
        }
        if encoded_len > NAME_MAX_LEN {
            return Err(ValidationError::NameTooLong { name: inner });
        }

        Ok(Self { inner })
    }

    /// Build a name from wire-format labels (without the terminating
    /// empty label).  Labels are lowercased; the same validation as
    /// `canonicalise` applies.
    ///
    /// # Errors
    ///
    /// If any label is invalid or the total length limit is exceeded.
    pub fn from_labels(labels: &[&[u8]]) -> Result<Self, ValidationError> {
        if labels.is_empty() {
            return Ok(Self::root());
        }

        let mut s = String::with_capacity(NAME_MAX_LEN);
        for label in labels {
            for octet in *label {
                if !octet.is_ascii() {
                    return Err(ValidationError::NameNotAscii {
                        name: String::from_utf8_lossy(label).into_owned(),
                    });
                }
                s.push(octet.to_ascii_lowercase() as char);
            }
            s.push('.');
        }

        Self::canonicalise(&s)
    }

    pub fn is_root(&self) -> bool {
        self.inner == "."
    }

    /// The canonical form, trailing dot included.
    pub fn as_str(&self) -> &str {
        &self.inner
    }

    /// The canonical form without the trailing dot.  The root becomes
    /// the empty string.  This is the form used for blocklist keys.
    pub fn without_trailing_dot(&self) -> &str {
        &self.inner[..self.inner.len() - 1]
    }

    /// The labels of the name, leftmost first, without the root.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.without_trailing_dot()
            .split('.')
            .filter(|l| !l.is_empty())
    }

    /// The zone apex this name falls under: the effective TLD plus one
    /// label, from the public suffix list.  Names the list cannot
    /// place (unknown or bare TLDs, the root) are their own apex.
    pub fn apex(&self) -> Name {
        match psl::domain(self.without_trailing_dot().as_bytes()) {
            Some(domain) => match std::str::from_utf8(domain.as_bytes()) {
                // already canonical: a substring of a canonical name
                Ok(apex) => Name {
                    inner: format!("{apex}."),
                },
                Err(_) => self.clone(),
            },
            None => self.clone(),
        }
    }

    /// True if this name equals `other` or is a subdomain of it.
    pub fn is_subdomain_of(&self, other: &Name) -> bool {
        if other.is_root() {
            return true;
        }
        self.inner == other.inner || self.inner.ends_with(&format!(".{}", other.inner))
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl std::str::FromStr for Name {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::canonicalise(s)
    }
}

#[cfg(any(feature = "test-util", test))]
impl<'a> arbitrary::Arbitrary<'a> for Name {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        let num_labels = u.int_in_range::<usize>(1..=5)?;
        let mut s = String::new();
        for _ in 0..num_labels {
            let label_len = u.int_in_range::<u8>(1..=20)?;
            for _ in 0..label_len {
                let octet = u.int_in_range::<u8>(0..=25)? + b'a';
                s.push(octet as char);
            }
            s.push('.');
        }
        Ok(Self::canonicalise(&s).unwrap())
    }
}

/// Record types are used by resource records and by queries.  The
/// recognised set covers the types this server is prepared to answer
/// for and cache; anything else is representable but flagged as
/// unrecognised.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum RecordType {
    A,
    NS,
    CNAME,
    SOA,
    PTR,
    MX,
    TXT,
    AAAA,
    SRV,
    OPT,
    CAA,
    /// The wildcard meta-type, `ANY` / `*`.  Only meaningful in
    /// questions, but representable everywhere.
    ANY,
    Unknown(RecordTypeUnknown),
}

/// A struct with a private constructor, to ensure arbitrary
/// `RecordType`s cannot be confused with recognised ones.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RecordTypeUnknown(u16);

impl RecordType {
    pub fn is_recognised(&self) -> bool {
        !matches!(self, RecordType::Unknown(_))
    }

    /// True if a record of this type answers a question for `qtype`.
    pub fn matches(&self, qtype: RecordType) -> bool {
        qtype == RecordType::ANY || *self == qtype
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RecordType::A => write!(f, "A"),
            RecordType::NS => write!(f, "NS"),
            RecordType::CNAME => write!(f, "CNAME"),
            RecordType::SOA => write!(f, "SOA"),
            RecordType::PTR => write!(f, "PTR"),
            RecordType::MX => write!(f, "MX"),
            RecordType::TXT => write!(f, "TXT"),
            RecordType::AAAA => write!(f, "AAAA"),
            RecordType::SRV => write!(f, "SRV"),
            RecordType::OPT => write!(f, "OPT"),
            RecordType::CAA => write!(f, "CAA"),
            RecordType::ANY => write!(f, "ANY"),
            RecordType::Unknown(RecordTypeUnknown(n)) => write!(f, "{n}"),
        }
    }
}

impl From<u16> for RecordType {
    fn from(value: u16) -> Self {
        match value {
            1 => RecordType::A,
            2 => RecordType::NS,
            5 => RecordType::CNAME,
            6 => RecordType::SOA,
            12 => RecordType::PTR,
            15 => RecordType::MX,
            16 => RecordType::TXT,
            28 => RecordType::AAAA,
            33 => RecordType::SRV,
            41 => RecordType::OPT,
            255 => RecordType::ANY,
            257 => RecordType::CAA,
            _ => RecordType::Unknown(RecordTypeUnknown(value)),
        }
    }
}

impl From<RecordType> for u16 {
    fn from(value: RecordType) -> Self {
        match value {
            RecordType::A => 1,
            RecordType::NS => 2,
            RecordType::CNAME => 5,
            RecordType::SOA => 6,
            RecordType::PTR => 12,
            RecordType::MX => 15,
            RecordType::TXT => 16,
            RecordType::AAAA => 28,
            RecordType::SRV => 33,
            RecordType::OPT => 41,
            RecordType::ANY => 255,
            RecordType::CAA => 257,
            RecordType::Unknown(RecordTypeUnknown(value)) => value,
        }
    }
}

impl std::str::FromStr for RecordType {
    type Err = ValidationError;

    /// Parse a mnemonic (`A`, `aaaa`, ...) or a bare type number.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "A" => Ok(RecordType::A),
            "NS" => Ok(RecordType::NS),
            "CNAME" => Ok(RecordType::CNAME),
            "SOA" => Ok(RecordType::SOA),
            "PTR" => Ok(RecordType::PTR),
            "MX" => Ok(RecordType::MX),
            "TXT" => Ok(RecordType::TXT),
            "AAAA" => Ok(RecordType::AAAA),
            "SRV" => Ok(RecordType::SRV),
            "OPT" => Ok(RecordType::OPT),
            "CAA" => Ok(RecordType::CAA),
            "ANY" | "*" => Ok(RecordType::ANY),
            other => match other.parse::<u16>() {
                Ok(value) => Ok(RecordType::from(value)),
                Err(_) => Err(ValidationError::UnknownTypeName {
                    name: s.to_string(),
                }),
            },
        }
    }
}

#[cfg(any(feature = "test-util", test))]
impl<'a> arbitrary::Arbitrary<'a> for RecordType {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        Ok(Self::from(u.arbitrary::<u16>()?))
    }
}

/// Record classes are used by resource records and by queries.
/// Predominantly `IN`; the rest exist so that the wire codec can round
/// trip anything it is handed.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum RecordClass {
    IN,
    CH,
    HS,
    NONE,
    ANY,
    Unknown(RecordClassUnknown),
}

/// A struct with a private constructor, to ensure arbitrary
/// `RecordClass`es cannot be confused with recognised ones.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RecordClassUnknown(u16);

impl RecordClass {
    pub fn is_recognised(&self) -> bool {
        !matches!(self, RecordClass::Unknown(_))
    }

    pub fn matches(&self, qclass: RecordClass) -> bool {
        qclass == RecordClass::ANY || *self == qclass
    }
}

impl fmt::Display for RecordClass {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RecordClass::IN => write!(f, "IN"),
            RecordClass::CH => write!(f, "CH"),
            RecordClass::HS => write!(f, "HS"),
            RecordClass::NONE => write!(f, "NONE"),
            RecordClass::ANY => write!(f, "ANY"),
            RecordClass::Unknown(RecordClassUnknown(n)) => write!(f, "{n}"),
        }
    }
}

impl From<u16> for RecordClass {
    fn from(value: u16) -> Self {
        match value {
            1 => RecordClass::IN,
            3 => RecordClass::CH,
            4 => RecordClass::HS,
            254 => RecordClass::NONE,
            255 => RecordClass::ANY,
            _ => RecordClass::Unknown(RecordClassUnknown(value)),
        }
    }
}

impl From<RecordClass> for u16 {
    fn from(value: RecordClass) -> Self {
        match value {
            RecordClass::IN => 1,
            RecordClass::CH => 3,
            RecordClass::HS => 4,
            RecordClass::NONE => 254,
            RecordClass::ANY => 255,
            RecordClass::Unknown(RecordClassUnknown(value)) => value,
        }
    }
}

#[cfg(any(feature = "test-util", test))]
impl<'a> arbitrary::Arbitrary<'a> for RecordClass {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        Ok(Self::from(u.arbitrary::<u16>()?))
    }
}

/// Response codes, RFC 1035 section 4.1.1 extended by RFC 2136.
/// Values outside 0..=10 are invalid and cannot be constructed.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Rcode {
    NoError,
    FormatError,
    ServerFailure,
    NameError,
    NotImplemented,
    Refused,
    YxDomain,
    YxRrSet,
    NxRrSet,
    NotAuth,
    NotZone,
}

impl Rcode {
    /// # Errors
    ///
    /// If the value is outside the valid 0..=10 range.
    pub fn try_from_u8(value: u8) -> Result<Self, ValidationError> {
        match value {
            0 => Ok(Rcode::NoError),
            1 => Ok(Rcode::FormatError),
            2 => Ok(Rcode::ServerFailure),
            3 => Ok(Rcode::NameError),
            4 => Ok(Rcode::NotImplemented),
            5 => Ok(Rcode::Refused),
            6 => Ok(Rcode::YxDomain),
            7 => Ok(Rcode::YxRrSet),
            8 => Ok(Rcode::NxRrSet),
            9 => Ok(Rcode::NotAuth),
            10 => Ok(Rcode::NotZone),
            _ => Err(ValidationError::RcodeOutOfRange { value }),
        }
    }
}

impl From<Rcode> for u8 {
    fn from(value: Rcode) -> Self {
        match value {
            Rcode::NoError => 0,
            Rcode::FormatError => 1,
            Rcode::ServerFailure => 2,
            Rcode::NameError => 3,
            Rcode::NotImplemented => 4,
            Rcode::Refused => 5,
            Rcode::YxDomain => 6,
            Rcode::YxRrSet => 7,
            Rcode::NxRrSet => 8,
            Rcode::NotAuth => 9,
            Rcode::NotZone => 10,
        }
    }
}

impl fmt::Display for Rcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Rcode::NoError => write!(f, "NOERROR"),
            Rcode::FormatError => write!(f, "FORMERR"),
            Rcode::ServerFailure => write!(f, "SERVFAIL"),
            Rcode::NameError => write!(f, "NXDOMAIN"),
            Rcode::NotImplemented => write!(f, "NOTIMP"),
            Rcode::Refused => write!(f, "REFUSED"),
            Rcode::YxDomain => write!(f, "YXDOMAIN"),
            Rcode::YxRrSet => write!(f, "YXRRSET"),
            Rcode::NxRrSet => write!(f, "NXRRSET"),
            Rcode::NotAuth => write!(f, "NOTAUTH"),
            Rcode::NotZone => write!(f, "NOTZONE"),
        }
    }
}

/// A single question: the ID it arrived under, the name being asked
/// about, and the type and class being asked for.
///
/// ```text
///                                     1  1  1  1  1  1
///       0  1  2  3  4  5  6  7  8  9  0  1  2  3  4  5
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                                               |
///     /                     QNAME                     /
///     /                                               /
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                     QTYPE                     |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
///     |                     QCLASS                    |
///     +--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+--+
/// ```
///
/// See section 4.1.2 of RFC 1035.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Question {
    pub id: u16,
    pub name: Name,
    pub qtype: RecordType,
    pub qclass: RecordClass,
}

impl Question {
    /// Construct a validated question.
    ///
    /// # Errors
    ///
    /// If the type or class is unrecognised.  The name is canonical
    /// by construction.
    pub fn new(
        id: u16,
        name: Name,
        qtype: RecordType,
        qclass: RecordClass,
    ) -> Result<Self, ValidationError> {
        let question = Self {
            id,
            name,
            qtype,
            qclass,
        };
        question.validate()?;
        Ok(question)
    }

    /// # Errors
    ///
    /// If the type or class is unrecognised.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.qtype.is_recognised() {
            return Err(ValidationError::UnrecognisedType {
                value: self.qtype.into(),
            });
        }
        if !self.qclass.is_recognised() {
            return Err(ValidationError::UnrecognisedClass {
                value: self.qclass.into(),
            });
        }
        Ok(())
    }

    /// The cache fingerprint: `apex|name|type|class`.  Pipe
    /// separators cannot collide with anything in a canonical name or
    /// in the colon-bearing textual forms of IPv6 record data.
    ///
    /// The fingerprint depends only on (apex, name, type, class), so
    /// it is stable across runs and processes.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.name.apex(), &self.name, self.qtype, self.qclass)
    }
}

impl fmt::Display for Question {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {} {}", self.name, self.qclass, self.qtype)
    }
}

#[cfg(any(feature = "test-util", test))]
impl<'a> arbitrary::Arbitrary<'a> for Question {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        Ok(Self {
            id: u.arbitrary()?,
            name: u.arbitrary()?,
            qtype: u.arbitrary()?,
            qclass: u.arbitrary()?,
        })
    }
}

/// Shared fingerprint construction, used by questions, records, and
/// the zone store so that all of them index the same way.
pub fn fingerprint(apex: &Name, name: &Name, rtype: RecordType, rclass: RecordClass) -> String {
    format!("{apex}|{name}|{rtype}|{rclass}")
}

/// A single resource record.
///
/// Records come in two lifecycle variants:
///
/// - *authoritative* records have no expiry timestamp and their wire
///   TTL is always the original TTL;
///
/// - *cached* records carry `expires_at = creation time + TTL`, and
///   their wire TTL counts down to zero as that moment approaches.
///
/// Records are immutable after construction; whichever container owns
/// one (zone store or response cache) holds it exclusively, sharing
/// only reference-counted views.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct ResourceRecord {
    pub name: Name,
    pub rtype: RecordType,
    pub rclass: RecordClass,

    /// Original time-to-live in seconds.
    pub ttl: u32,

    /// Absent for authoritative records; for cached records, the
    /// instant the record stops being usable.
    pub expires_at: Option<Instant>,

    /// Raw RDATA octets.  At least one of `data` and `text` is
    /// non-empty.
    pub data: Bytes,

    /// Textual data, for record types whose RDATA is character
    /// strings rather than structured octets.
    pub text: String,
}

impl ResourceRecord {
    /// Construct a validated authoritative record.
    ///
    /// # Errors
    ///
    /// If the type or class is unrecognised, or both `data` and
    /// `text` are empty.
    pub fn authoritative(
        name: Name,
        rtype: RecordType,
        rclass: RecordClass,
        ttl: u32,
        data: Bytes,
        text: String,
    ) -> Result<Self, ValidationError> {
        let record = Self {
            name,
            rtype,
            rclass,
            ttl,
            expires_at: None,
            data,
            text,
        };
        record.validate()?;
        Ok(record)
    }

    /// Convert a record into its cached variant, expiring `ttl`
    /// seconds after `now`.
    pub fn into_cached(self, now: Instant) -> Self {
        let expires_at = now + std::time::Duration::from_secs(u64::from(self.ttl));
        Self {
            expires_at: Some(expires_at),
            ..self
        }
    }

    /// # Errors
    ///
    /// If the type or class is unrecognised, or both `data` and
    /// `text` are empty.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.rtype.is_recognised() {
            return Err(ValidationError::UnrecognisedType {
                value: self.rtype.into(),
            });
        }
        if !self.rclass.is_recognised() {
            return Err(ValidationError::UnrecognisedClass {
                value: self.rclass.into(),
            });
        }
        if self.data.is_empty() && self.text.is_empty() {
            return Err(ValidationError::EmptyRecordData {
                name: self.name.clone(),
            });
        }
        Ok(())
    }

    /// The TTL to put on the wire at time `now`: the original TTL for
    /// authoritative records, the remaining lifetime (floored at zero)
    /// for cached ones.
    pub fn effective_ttl(&self, now: Instant) -> u32 {
        match self.expires_at {
            None => self.ttl,
            Some(expires_at) => expires_at
                .saturating_duration_since(now)
                .as_secs()
                .try_into()
                .unwrap_or(u32::MAX),
        }
    }

    /// True once a cached record's expiry has passed.  Authoritative
    /// records never expire.
    pub fn is_expired(&self, now: Instant) -> bool {
        match self.expires_at {
            None => false,
            Some(expires_at) => expires_at <= now,
        }
    }

    /// The cache fingerprint of this record, built the same way as a
    /// question's so that records and the questions they answer index
    /// identically.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.name.apex(), &self.name, self.rtype, self.rclass)
    }

    pub fn matches(&self, question: &Question) -> bool {
        self.name == question.name
            && self.rtype.matches(question.qtype)
            && self.rclass.matches(question.qclass)
    }
}

#[cfg(any(feature = "test-util", test))]
impl<'a> arbitrary::Arbitrary<'a> for ResourceRecord {
    fn arbitrary(u: &mut arbitrary::Unstructured<'a>) -> arbitrary::Result<Self> {
        let len = u.int_in_range(1..=64)?;
        let data = Bytes::copy_from_slice(u.bytes(len)?);
        Ok(Self {
            name: u.arbitrary()?,
            rtype: u.arbitrary()?,
            rclass: u.arbitrary()?,
            ttl: u.arbitrary()?,
            expires_at: None,
            data,
            text: String::new(),
        })
    }
}

/// A response message: the echoed ID, the outcome, and the three
/// record sections.  The question is carried along so that the encoder
/// can echo it, as resolvers and stub clients expect.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DnsResponse {
    pub id: u16,
    pub rcode: Rcode,

    /// Set when the answers come from the zone store; drives the AA
    /// header flag on encode.
    pub authoritative: bool,

    pub question: Option<Question>,
    pub answers: Vec<ResourceRecord>,
    pub authority: Vec<ResourceRecord>,
    pub additional: Vec<ResourceRecord>,
}

impl DnsResponse {
    /// A response with no records, echoing the question.
    pub fn empty(question: &Question, rcode: Rcode) -> Self {
        Self {
            id: question.id,
            rcode,
            authoritative: false,
            question: Some(question.clone()),
            answers: Vec::new(),
            authority: Vec::new(),
            additional: Vec::new(),
        }
    }

    /// A response carrying answer records for the question.
    pub fn with_answers(question: &Question, answers: Vec<ResourceRecord>) -> Self {
        Self {
            id: question.id,
            rcode: Rcode::NoError,
            authoritative: false,
            question: Some(question.clone()),
            answers,
            authority: Vec::new(),
            additional: Vec::new(),
        }
    }

    /// # Errors
    ///
    /// If any contained record is invalid, or the ID does not echo
    /// the question's.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if let Some(question) = &self.question {
            if question.id != self.id {
                return Err(ValidationError::IdNotEchoed {
                    question: question.id,
                    response: self.id,
                });
            }
        }
        for rr in self
            .answers
            .iter()
            .chain(self.authority.iter())
            .chain(self.additional.iter())
        {
            rr.validate()?;
        }
        Ok(())
    }
}

/// Errors raised by constructors and `validate` methods.  No
/// partially-constructed value escapes: a constructor either returns a
/// value that passes validation or one of these.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ValidationError {
    /// The name is empty (after trimming whitespace).
    EmptyName,

    /// The name contains non-ASCII octets.
    NameNotAscii { name: String },

    /// A label is empty (consecutive or leading dots).
    EmptyLabel { name: String },

    /// A label is over 63 octets.
    LabelTooLong { label: String },

    /// The encoded name is over 255 octets.
    NameTooLong { name: String },

    /// The type value is not in the recognised set.
    UnrecognisedType { value: u16 },

    /// The type name is not a known mnemonic or number.
    UnknownTypeName { name: String },

    /// The class value is not in the recognised set.
    UnrecognisedClass { value: u16 },

    /// The response code is outside 0..=10.
    RcodeOutOfRange { value: u8 },

    /// A record has neither data octets nor text.
    EmptyRecordData { name: Name },

    /// A response ID differs from its question's.
    IdNotEchoed { question: u16, response: u16 },
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ValidationError::EmptyName => write!(f, "name is empty"),
            ValidationError::NameNotAscii { name } => write!(f, "name '{name}' is not ASCII"),
            ValidationError::EmptyLabel { name } => write!(f, "name '{name}' has an empty label"),
            ValidationError::LabelTooLong { label } => {
                write!(f, "label '{label}' is over {LABEL_MAX_LEN} octets")
            }
            ValidationError::NameTooLong { name } => {
                write!(f, "name '{name}' encodes to over {NAME_MAX_LEN} octets")
            }
            ValidationError::UnrecognisedType { value } => {
                write!(f, "record type {value} is not recognised")
            }
            ValidationError::UnknownTypeName { name } => {
                write!(f, "'{name}' is not a record type")
            }
            ValidationError::UnrecognisedClass { value } => {
                write!(f, "record class {value} is not recognised")
            }
            ValidationError::RcodeOutOfRange { value } => {
                write!(f, "response code {value} is outside 0..=10")
            }
            ValidationError::EmptyRecordData { name } => {
                write!(f, "record for '{name}' has no data and no text")
            }
            ValidationError::IdNotEchoed { question, response } => {
                write!(f, "response ID {response} does not echo question ID {question}")
            }
        }
    }
}

impl std::error::Error for ValidationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

#[cfg(test)]
mod tests {
    use fake::{Fake, Faker};

    use super::test_util::*;
    use super::*;

    #[test]
    fn u16_recordtype_roundtrip() {
        for i in 0..300 {
            assert_eq!(u16::from(RecordType::from(i)), i);
        }
    }

    #[test]
    fn u16_recordclass_roundtrip() {
        for i in 0..300 {
            assert_eq!(u16::from(RecordClass::from(i)), i);
        }
    }

    #[test]
    fn u8_rcode_roundtrip() {
        for i in 0..=10 {
            assert_eq!(u8::from(Rcode::try_from_u8(i).unwrap()), i);
        }
    }

    #[test]
    fn rcode_rejects_out_of_range() {
        for i in 11..=255 {
            assert_eq!(
                Err(ValidationError::RcodeOutOfRange { value: i }),
                Rcode::try_from_u8(i)
            );
        }
    }

    #[test]
    fn canonicalise_lowercases_trims_and_dots() {
        assert_eq!(
            "www.example.com.",
            Name::canonicalise("  WWW.Example.COM ").unwrap().as_str()
        );
        assert_eq!(
            "www.example.com.",
            Name::canonicalise("www.example.com.").unwrap().as_str()
        );
        assert_eq!(".", Name::canonicalise(".").unwrap().as_str());
    }

    #[test]
    fn canonicalise_is_idempotent() {
        for _ in 0..100 {
            let raw = arbitrary_name_string();
            let once = Name::canonicalise(&raw).unwrap();
            let twice = Name::canonicalise(once.as_str()).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn canonicalise_rejects_junk() {
        assert_eq!(Err(ValidationError::EmptyName), Name::canonicalise(""));
        assert_eq!(Err(ValidationError::EmptyName), Name::canonicalise("   "));
        assert!(Name::canonicalise("a..b").is_err());
        assert!(Name::canonicalise("héllo.example").is_err());
        assert!(Name::canonicalise(&format!("{}.example", "x".repeat(64))).is_err());

        // 128 two-octet labels encode to 385 octets
        let long = vec!["xy"; 128].join(".");
        assert_eq!(
            Err(ValidationError::NameTooLong {
                name: format!("{long}.")
            }),
            Name::canonicalise(&long)
        );
    }

    #[test]
    fn without_trailing_dot_strips_exactly_one() {
        let name = Name::canonicalise("ads.example.com").unwrap();
        assert_eq!("ads.example.com", name.without_trailing_dot());
        assert_eq!("", Name::root().without_trailing_dot());
    }

    #[test]
    fn apex_is_effective_tld_plus_one() {
        let name = Name::canonicalise("www.example.com.").unwrap();
        assert_eq!("example.com.", name.apex().as_str());

        let name = Name::canonicalise("a.b.example.co.uk.").unwrap();
        assert_eq!("example.co.uk.", name.apex().as_str());
    }

    #[test]
    fn apex_falls_back_to_full_name() {
        // a label that is no TLD at all
        let name = Name::canonicalise("something.internal-zone-x.").unwrap();
        let apex = name.apex();
        assert!(apex == name || apex.as_str() == "internal-zone-x.");
    }

    #[test]
    fn fingerprint_is_deterministic() {
        for _ in 0..100 {
            let question = Question {
                id: Faker.fake(),
                name: name(&arbitrary_name_string()),
                qtype: RecordType::from((0..300u16).fake::<u16>()),
                qclass: RecordClass::from((0..300u16).fake::<u16>()),
            };
            assert_eq!(question.fingerprint(), question.fingerprint());

            // the ID plays no part
            let mut other = question.clone();
            other.id = question.id.wrapping_add(1);
            assert_eq!(question.fingerprint(), other.fingerprint());
        }
    }

    #[test]
    fn fingerprint_uses_pipe_separators() {
        let question = Question::new(
            1,
            name("www.example.com."),
            RecordType::AAAA,
            RecordClass::IN,
        )
        .unwrap();
        assert_eq!(
            "example.com.|www.example.com.|AAAA|IN",
            question.fingerprint()
        );
    }

    #[test]
    fn question_validation_is_total() {
        for _ in 0..100 {
            let id = Faker.fake();
            let qname = name(&arbitrary_name_string());
            let qtype = RecordType::from((0..300u16).fake::<u16>());
            let qclass = RecordClass::from((0..300u16).fake::<u16>());

            match Question::new(id, qname, qtype, qclass) {
                Ok(question) => assert_eq!(Ok(()), question.validate()),
                Err(_) => assert!(!qtype.is_recognised() || !qclass.is_recognised()),
            }
        }
    }

    #[test]
    fn record_requires_data_or_text() {
        let err = ResourceRecord::authoritative(
            name("www.example.com."),
            RecordType::A,
            RecordClass::IN,
            300,
            Bytes::new(),
            String::new(),
        );
        assert!(matches!(
            err,
            Err(ValidationError::EmptyRecordData { .. })
        ));

        assert!(ResourceRecord::authoritative(
            name("www.example.com."),
            RecordType::TXT,
            RecordClass::IN,
            300,
            Bytes::new(),
            "hello".to_string(),
        )
        .is_ok());
    }

    #[test]
    fn authoritative_ttl_never_decays() {
        let rr = a_record("www.example.com.", [192, 0, 2, 1]);
        let now = Instant::now();
        assert_eq!(300, rr.effective_ttl(now));
        assert_eq!(
            300,
            rr.effective_ttl(now + std::time::Duration::from_secs(1_000_000))
        );
        assert!(!rr.is_expired(now + std::time::Duration::from_secs(1_000_000)));
    }

    #[test]
    fn cached_ttl_counts_down() {
        let now = Instant::now();
        let rr = a_record("www.example.com.", [192, 0, 2, 1]).into_cached(now);

        assert_eq!(300, rr.effective_ttl(now));
        assert_eq!(
            200,
            rr.effective_ttl(now + std::time::Duration::from_secs(100))
        );
        assert_eq!(
            0,
            rr.effective_ttl(now + std::time::Duration::from_secs(300))
        );
        assert!(rr.is_expired(now + std::time::Duration::from_secs(300)));
        assert!(!rr.is_expired(now + std::time::Duration::from_secs(299)));
    }

    #[test]
    fn response_validation_checks_id_echo() {
        let question =
            Question::new(7, name("www.example.com."), RecordType::A, RecordClass::IN).unwrap();
        let mut response = DnsResponse::empty(&question, Rcode::NoError);
        assert_eq!(Ok(()), response.validate());

        response.id = 8;
        assert!(matches!(
            response.validate(),
            Err(ValidationError::IdNotEchoed { .. })
        ));
    }

    fn arbitrary_name_string() -> String {
        let labels_len = (1..5).fake::<usize>();
        let mut out = String::new();
        for i in 0..labels_len {
            if i > 0 {
                out.push('.');
            }
            let label_len = (1..10).fake::<usize>();
            for _ in 0..label_len {
                let mut chr = (32..126).fake::<u8>();
                if chr == b'.' || chr == b'|' || (chr as char).is_whitespace() {
                    chr = b'X';
                }
                out.push(chr as char);
            }
        }
        out
    }
}

#[cfg(any(feature = "test-util", test))]
pub mod test_util {
    use super::*;

    pub fn name(s: &str) -> Name {
        Name::canonicalise(s).unwrap()
    }

    pub fn question(id: u16, s: &str, rtype: RecordType) -> Question {
        Question::new(id, name(s), rtype, RecordClass::IN).unwrap()
    }

    pub fn a_record(s: &str, address: [u8; 4]) -> ResourceRecord {
        ResourceRecord::authoritative(
            name(s),
            RecordType::A,
            RecordClass::IN,
            300,
            Bytes::copy_from_slice(&address),
            String::new(),
        )
        .unwrap()
    }

    pub fn aaaa_record(s: &str, address: [u8; 16]) -> ResourceRecord {
        ResourceRecord::authoritative(
            name(s),
            RecordType::AAAA,
            RecordClass::IN,
            300,
            Bytes::copy_from_slice(&address),
            String::new(),
        )
        .unwrap()
    }

    pub fn txt_record(s: &str, text: &str) -> ResourceRecord {
        ResourceRecord::authoritative(
            name(s),
            RecordType::TXT,
            RecordClass::IN,
            300,
            Bytes::new(),
            text.to_string(),
        )
        .unwrap()
    }

    pub fn arbitrary_resourcerecord(seed: u64) -> ResourceRecord {
        use arbitrary::{Arbitrary, Unstructured};

        for size in [128, 256, 512, 1024] {
            let mut state = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            let mut buf = Vec::with_capacity(size);
            for _ in 0..size {
                state = state
                    .wrapping_mul(6_364_136_223_846_793_005)
                    .wrapping_add(1_442_695_040_888_963_407);
                #[allow(clippy::cast_possible_truncation)]
                buf.push((state >> 56) as u8);
            }

            if let Ok(rr) = ResourceRecord::arbitrary(&mut Unstructured::new(&buf)) {
                return rr;
            }
        }

        panic!("could not generate arbitrary value!");
    }
}

//! File loaders for the two external inputs: zone files and
//! blocklist files.  These produce the record tuples and rules the
//! core consumes through `put_zone` and `update_all`; the core itself
//! never reads files.

use bytes::Bytes;
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use udns_blocklist::rules::{BlockRule, BlockRuleKind};
use udns_types::protocol::types::*;

/// Parse a zone file: one record per line in the form
///
/// ```text
/// # comment
/// www.example.com.  300  IN  A     192.0.2.1
/// example.com.      600  IN  TXT   "spf, but shorter"
/// alias.example.com. 300 IN  CNAME www.example.com.
/// ```
///
/// and group the records by apex, ready for `put_zone`.
///
/// # Errors
///
/// On the first malformed line, with its line number.
pub fn parse_zone_file(data: &str) -> Result<HashMap<Name, Vec<ResourceRecord>>, LoaderError> {
    let mut zones: HashMap<Name, Vec<ResourceRecord>> = HashMap::new();

    for (index, line) in data.lines().enumerate() {
        let line_number = index + 1;
        let line = strip_comment(line);
        if line.is_empty() {
            continue;
        }

        let record = parse_zone_line(line).map_err(|reason| LoaderError::BadZoneLine {
            line_number,
            reason,
        })?;
        zones.entry(record.name.apex()).or_default().push(record);
    }

    Ok(zones)
}

fn parse_zone_line(line: &str) -> Result<ResourceRecord, String> {
    let mut fields = line.split_whitespace();
    let name_field = fields.next().ok_or("missing name")?;
    let ttl_field = fields.next().ok_or("missing TTL")?;
    let class_field = fields.next().ok_or("missing class")?;
    let type_field = fields.next().ok_or("missing type")?;
    let rdata: Vec<&str> = fields.collect();

    let name = Name::canonicalise(name_field).map_err(|error| error.to_string())?;
    let ttl: u32 = ttl_field
        .parse()
        .map_err(|_| format!("'{ttl_field}' is not a TTL"))?;
    let rclass = match class_field {
        "IN" => RecordClass::IN,
        "CH" => RecordClass::CH,
        "HS" => RecordClass::HS,
        other => return Err(format!("unsupported class '{other}'")),
    };

    let (rtype, data, text) = parse_rdata(type_field, &rdata)?;

    ResourceRecord::authoritative(name, rtype, rclass, ttl, data, text)
        .map_err(|error| error.to_string())
}

fn parse_rdata(type_field: &str, rdata: &[&str]) -> Result<(RecordType, Bytes, String), String> {
    match type_field {
        "A" => {
            let address = single_field(rdata)?;
            let address =
                Ipv4Addr::from_str(address).map_err(|_| format!("'{address}' is not an IPv4 address"))?;
            Ok((RecordType::A, Bytes::copy_from_slice(&address.octets()), String::new()))
        }
        "AAAA" => {
            let address = single_field(rdata)?;
            let address =
                Ipv6Addr::from_str(address).map_err(|_| format!("'{address}' is not an IPv6 address"))?;
            Ok((RecordType::AAAA, Bytes::copy_from_slice(&address.octets()), String::new()))
        }
        "TXT" => {
            // the remaining fields, with optional surrounding quotes
            let text = rdata.join(" ").trim_matches('"').to_string();
            if text.is_empty() {
                return Err("empty TXT data".to_string());
            }
            Ok((RecordType::TXT, Bytes::new(), text))
        }
        "CNAME" | "NS" | "PTR" => {
            let target = Name::canonicalise(single_field(rdata)?).map_err(|error| error.to_string())?;
            let rtype = match type_field {
                "CNAME" => RecordType::CNAME,
                "NS" => RecordType::NS,
                _ => RecordType::PTR,
            };
            Ok((rtype, Bytes::from(wire_name(&target)), String::new()))
        }
        "MX" => {
            if rdata.len() != 2 {
                return Err("MX needs a preference and an exchange".to_string());
            }
            let preference: u16 = rdata[0]
                .parse()
                .map_err(|_| format!("'{}' is not a preference", rdata[0]))?;
            let exchange = Name::canonicalise(rdata[1]).map_err(|error| error.to_string())?;

            let mut data = Vec::with_capacity(2 + exchange.as_str().len() + 1);
            data.extend_from_slice(&preference.to_be_bytes());
            data.extend_from_slice(&wire_name(&exchange));
            Ok((RecordType::MX, Bytes::from(data), String::new()))
        }
        "SRV" => {
            if rdata.len() != 4 {
                return Err("SRV needs priority, weight, port, and a target".to_string());
            }
            let mut data = Vec::new();
            for field in &rdata[..3] {
                let value: u16 = field
                    .parse()
                    .map_err(|_| format!("'{field}' is not a 16-bit number"))?;
                data.extend_from_slice(&value.to_be_bytes());
            }
            let target = Name::canonicalise(rdata[3]).map_err(|error| error.to_string())?;
            data.extend_from_slice(&wire_name(&target));
            Ok((RecordType::SRV, Bytes::from(data), String::new()))
        }
        "CAA" => {
            if rdata.len() != 3 {
                return Err("CAA needs flags, a tag, and a value".to_string());
            }
            let flags: u8 = rdata[0]
                .parse()
                .map_err(|_| format!("'{}' is not a flags octet", rdata[0]))?;
            let tag = rdata[1];
            if tag.is_empty() || tag.len() > 255 {
                return Err("CAA tag must be 1..=255 octets".to_string());
            }
            let value = rdata[2].trim_matches('"');

            let mut data = Vec::with_capacity(2 + tag.len() + value.len());
            data.push(flags);
            #[allow(clippy::cast_possible_truncation)]
            data.push(tag.len() as u8);
            data.extend_from_slice(tag.as_bytes());
            data.extend_from_slice(value.as_bytes());
            Ok((RecordType::CAA, Bytes::from(data), String::new()))
        }
        other => Err(format!("unsupported record type '{other}'")),
    }
}

fn single_field<'a>(rdata: &[&'a str]) -> Result<&'a str, String> {
    match rdata {
        [field] => Ok(*field),
        _ => Err("expected exactly one data field".to_string()),
    }
}

/// A name as length-prefixed wire labels, for name-valued RDATA.
fn wire_name(name: &Name) -> Vec<u8> {
    let mut octets = Vec::with_capacity(name.as_str().len() + 1);
    for label in name.labels() {
        #[allow(clippy::cast_possible_truncation)]
        octets.push(label.len() as u8);
        octets.extend_from_slice(label.as_bytes());
    }
    octets.push(0);
    octets
}

/// Parse a blocklist file.  Two shapes of line are accepted, in any
/// mix:
///
/// ```text
/// # hosts style: every name on the line is an exact rule
/// 0.0.0.0 ads.example tracker.example
///
/// # bare domains: exact, or a suffix rule with a *. prefix
/// ads2.example
/// *.doubleclick.net
/// ```
///
/// Unparseable names are skipped (blocklists in the wild are dirty),
/// so this never fails; it returns the rules it could read.
pub fn parse_block_file(data: &str, source: &str, added_at: u64) -> Vec<BlockRule> {
    let mut rules = Vec::new();

    for line in data.lines() {
        let line = strip_comment(line);
        if line.is_empty() {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();

        if Ipv4Addr::from_str(fields[0]).is_ok() || Ipv6Addr::from_str(fields[0]).is_ok() {
            // hosts style: the address is routing junk, the names are
            // the payload
            for field in &fields[1..] {
                if let Some(rule) = bare_rule(field, BlockRuleKind::Exact, source, added_at) {
                    rules.push(rule);
                }
            }
        } else if let [field] = fields[..] {
            let (kind, name_part) = match field.strip_prefix("*.") {
                Some(rest) => (BlockRuleKind::Suffix, rest),
                None => (BlockRuleKind::Exact, field),
            };
            if let Some(rule) = bare_rule(name_part, kind, source, added_at) {
                rules.push(rule);
            }
        }
        // anything else is junk; skip the line
    }

    rules
}

fn bare_rule(field: &str, kind: BlockRuleKind, source: &str, added_at: u64) -> Option<BlockRule> {
    // names like "localhost" are fine; junk with spaces or non-ASCII
    // is not
    if Name::canonicalise(field).is_err() {
        return None;
    }
    Some(BlockRule::new(field, kind, source, added_at))
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(index) => line[..index].trim(),
        None => line.trim(),
    }
}

/// An error reading one of the input files.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum LoaderError {
    BadZoneLine { line_number: usize, reason: String },
}

impl std::fmt::Display for LoaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            LoaderError::BadZoneLine {
                line_number,
                reason,
            } => write!(f, "zone file line {line_number}: {reason}"),
        }
    }
}

impl std::error::Error for LoaderError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zone_file_groups_by_apex() {
        let zones = parse_zone_file(
            "# records for two zones\n\
             www.example.com.  300 IN A    192.0.2.1\n\
             www.example.com.  300 IN A    192.0.2.2\n\
             mail.example.org. 600 IN AAAA 2001:db8::1\n\
             \n\
             example.org.      600 IN TXT  \"hello world\"\n",
        )
        .unwrap();

        assert_eq!(2, zones.len());
        let com = &zones[&Name::canonicalise("example.com.").unwrap()];
        assert_eq!(2, com.len());
        assert_eq!([192, 0, 2, 1].as_slice(), &com[0].data[..]);

        let org = &zones[&Name::canonicalise("example.org.").unwrap()];
        assert_eq!(2, org.len());
        let txt = org.iter().find(|rr| rr.rtype == RecordType::TXT).unwrap();
        assert_eq!("hello world", txt.text);
    }

    #[test]
    fn zone_file_encodes_name_rdata_as_labels() {
        let zones = parse_zone_file("alias.example.com. 300 IN CNAME www.example.com.\n").unwrap();
        let records = &zones[&Name::canonicalise("example.com.").unwrap()];

        assert_eq!(RecordType::CNAME, records[0].rtype);
        assert_eq!(
            [
                3, b'w', b'w', b'w', 7, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 3, b'c', b'o',
                b'm', 0
            ]
            .as_slice(),
            &records[0].data[..]
        );
    }

    #[test]
    fn zone_file_mx_rdata_has_preference_then_exchange() {
        let zones = parse_zone_file("example.com. 300 IN MX 10 mail.example.com.\n").unwrap();
        let records = &zones[&Name::canonicalise("example.com.").unwrap()];

        assert_eq!(RecordType::MX, records[0].rtype);
        assert_eq!([0, 10], records[0].data[..2]);
    }

    #[test]
    fn zone_file_srv_and_caa_rdata() {
        let zones = parse_zone_file(
            "_sip._udp.example.com. 300 IN SRV 10 60 5060 sip.example.com.\n\
             example.com.           300 IN CAA 0 issue \"ca.example.net\"\n",
        )
        .unwrap();
        let records = &zones[&Name::canonicalise("example.com.").unwrap()];

        let srv = records.iter().find(|rr| rr.rtype == RecordType::SRV).unwrap();
        assert_eq!([0, 10, 0, 60, 19, 196], srv.data[..6]);

        let caa = records.iter().find(|rr| rr.rtype == RecordType::CAA).unwrap();
        assert_eq!(0, caa.data[0]);
        assert_eq!(5, caa.data[1]);
        assert_eq!(b"issue", &caa.data[2..7]);
        assert_eq!(b"ca.example.net", &caa.data[7..]);
    }

    #[test]
    fn zone_file_errors_carry_line_numbers() {
        let result = parse_zone_file(
            "www.example.com. 300 IN A 192.0.2.1\n\
             www.example.com. oops IN A 192.0.2.1\n",
        );

        assert!(matches!(
            result,
            Err(LoaderError::BadZoneLine { line_number: 2, .. })
        ));
    }

    #[test]
    fn block_file_mixes_hosts_and_bare_domains() {
        let rules = parse_block_file(
            "# a messy list\n\
             0.0.0.0 ads.example tracker.example\n\
             127.0.0.1 local-ads.example # trailing comment\n\
             ads2.example\n\
             *.doubleclick.net\n\
             not a name at all\n",
            "list.txt",
            1_700_000_000,
        );

        let names: Vec<(&str, BlockRuleKind)> = rules
            .iter()
            .map(|rule| (rule.name.as_str(), rule.kind))
            .collect();
        assert_eq!(
            vec![
                ("ads.example", BlockRuleKind::Exact),
                ("tracker.example", BlockRuleKind::Exact),
                ("local-ads.example", BlockRuleKind::Exact),
                ("ads2.example", BlockRuleKind::Exact),
                ("doubleclick.net", BlockRuleKind::Suffix),
            ],
            names
        );

        for rule in &rules {
            assert_eq!("list.txt", rule.source);
            assert_eq!(1_700_000_000, rule.added_at);
        }
    }
}

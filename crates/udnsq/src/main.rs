use clap::Parser;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::process;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use udns_resolver::context::Context;
use udns_resolver::upstream::Forwarder;
use udns_types::protocol::deserialise::ConsumableBuffer;
use udns_types::protocol::types::{
    DnsResponse, Name, Question, Rcode, RecordClass, RecordType, ResourceRecord,
};

fn print_section(heading: &str, rrs: &[ResourceRecord], now: Instant) {
    if rrs.is_empty() {
        return;
    }

    println!("\n;; {heading}");
    for rr in rrs {
        println!(
            "{}\t{}\t{}\t{}\t{}",
            rr.name,
            rr.effective_ttl(now),
            rr.rclass,
            rr.rtype,
            format_rdata(rr)
        );
    }
}

/// Render RDATA the way a zone file would write it, for the types
/// where that form is obvious; everything else is hex.
fn format_rdata(rr: &ResourceRecord) -> String {
    if rr.data.is_empty() {
        return rr.text.clone();
    }

    match rr.rtype {
        RecordType::A if rr.data.len() == 4 => {
            Ipv4Addr::new(rr.data[0], rr.data[1], rr.data[2], rr.data[3]).to_string()
        }
        RecordType::AAAA if rr.data.len() == 16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&rr.data);
            Ipv6Addr::from(octets).to_string()
        }
        RecordType::CNAME | RecordType::NS | RecordType::PTR => wire_name_to_string(&rr.data),
        RecordType::TXT => String::from_utf8_lossy(&rr.data).into_owned(),
        _ => rr
            .data
            .iter()
            .map(|octet| format!("{octet:02x}"))
            .collect::<String>(),
    }
}

/// Expand label-encoded RDATA back into a dotted name, falling back
/// to hex when it isn't one.
fn wire_name_to_string(data: &[u8]) -> String {
    let mut buffer = ConsumableBuffer::new(data);
    let mut labels = Vec::new();

    loop {
        let Some(size) = buffer.next_u8() else {
            return data.iter().map(|octet| format!("{octet:02x}")).collect();
        };
        if size == 0 {
            break;
        }
        let Some(label) = buffer.take(usize::from(size)) else {
            return data.iter().map(|octet| format!("{octet:02x}")).collect();
        };
        labels.push(String::from_utf8_lossy(label).into_owned());
    }

    let mut out = labels.join(".");
    out.push('.');
    out
}

// the doc comments for this struct turn into the CLI help text
#[derive(Parser)]
/// DNS lookup utility: send one question to one server over UDP and
/// print what comes back.
struct Args {
    /// Domain name to resolve
    #[clap(value_parser)]
    domain: Name,

    /// Query type to resolve
    #[clap(default_value_t = RecordType::A, value_parser)]
    qtype: RecordType,

    /// Server to query
    #[clap(short, long, value_parser, default_value = "1.1.1.1:53")]
    server: SocketAddr,

    /// Timeout in seconds
    #[clap(short, long, value_parser, default_value_t = 5)]
    timeout: u64,
}

fn print_response(response: &DnsResponse) {
    if response.rcode != Rcode::NoError {
        println!("\n;; ANSWER");
        println!("; {}", response.rcode);
        return;
    }

    let now = Instant::now();
    print_section("ANSWER", &response.answers, now);
    print_section("AUTHORITY", &response.authority, now);
    print_section("ADDITIONAL", &response.additional, now);
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();

    // any ID works for a one-shot query; the clock is as good a
    // source as any
    #[allow(clippy::cast_possible_truncation)]
    let id = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(1, |duration| duration.subsec_nanos() as u16);

    let question = Question {
        id,
        name: args.domain,
        qtype: args.qtype,
        qclass: RecordClass::IN,
    };
    if let Err(error) = question.validate() {
        eprintln!("invalid question: {error}");
        process::exit(1);
    }

    println!(";; QUESTION");
    println!("{}\t{}\t{}", question.name, question.qclass, question.qtype);

    let forwarder = Forwarder::with_timeout(vec![args.server], Duration::from_secs(args.timeout));
    match forwarder.resolve(&Context::background(), &question).await {
        Ok(response) => print_response(&response),
        Err(error) => {
            println!("\n;; ANSWER");
            println!("; {error}");
            process::exit(1);
        }
    }
}

use bytes::BytesMut;
use clap::Parser;
use std::collections::{HashMap, HashSet};
use std::env;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tokio::net::UdpSocket;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use udns_blocklist::rules::BlockRule;
use udns_blocklist::store::Store;
use udns_blocklist::Repository;
use udns_resolver::cache::SharedCache;
use udns_resolver::context::Context;
use udns_resolver::upstream::Forwarder;
use udns_resolver::Resolver;
use udns_types::protocol::deserialise::{decode_query, DecodeError};
use udns_types::protocol::serialise::{encode_response, MAX_UDP_PAYLOAD};
use udns_types::protocol::types::{DnsResponse, Name, Rcode, ResourceRecord};
use udns_types::zones::Zones;

mod loader;
mod settings;

use crate::settings::Settings;

/// Handle one raw datagram end to end: decode, resolve, encode.
///
/// Returns `None` when no reply should be sent - that is, when the
/// datagram is so broken no ID can be derived from it.
async fn handle_datagram(resolver: &Resolver, octets: &[u8]) -> Option<Vec<u8>> {
    match decode_query(octets) {
        Ok(question) => {
            let started = Instant::now();
            let response = resolver.resolve(&Context::background(), &question).await;
            tracing::info!(
                %question,
                rcode = %response.rcode,
                duration_seconds = %started.elapsed().as_secs_f64(),
                "ok"
            );

            match encode_response(&response) {
                Ok(octets) => Some(octets),
                Err(error) => {
                    tracing::warn!(?response, %error, "could not serialise response");
                    None
                }
            }
        }
        Err(error) => {
            tracing::debug!(%error, "could not parse query");
            let rcode = match error {
                DecodeError::UnsupportedOpcode { .. } => Rcode::NotImplemented,
                _ => Rcode::FormatError,
            };
            let id = error.id()?;
            let response = DnsResponse {
                id,
                rcode,
                authoritative: false,
                question: None,
                answers: Vec::new(),
                authority: Vec::new(),
                additional: Vec::new(),
            };
            encode_response(&response).ok()
        }
    }
}

/// Read datagrams, resolve each in its own task, and funnel the
/// replies back through a channel to the socket owner.
async fn listen_udp_task(resolver: Resolver, socket: UdpSocket) {
    let (tx, mut rx) = mpsc::channel::<(Vec<u8>, std::net::SocketAddr)>(32);
    let mut buf = vec![0u8; MAX_UDP_PAYLOAD];

    loop {
        tokio::select! {
            Ok((size, peer)) = socket.recv_from(&mut buf) => {
                tracing::debug!(?peer, "UDP request");
                let bytes = BytesMut::from(&buf[..size]);
                let reply = tx.clone();
                let resolver = resolver.clone();
                tokio::spawn(async move {
                    if let Some(octets) = handle_datagram(&resolver, bytes.as_ref()).await {
                        if let Err(error) = reply.send((octets, peer)).await {
                            tracing::debug!(?peer, %error, "UDP reply channel error");
                        }
                    }
                });
            }

            Some((octets, peer)) = rx.recv() => {
                if let Err(error) = socket.send_to(&octets, peer).await {
                    tracing::debug!(?peer, %error, "UDP send error");
                }
            }
        }
    }
}

/// Load every configured zone file into per-apex record sets.
async fn load_zone_configuration(
    settings: &Settings,
) -> Option<HashMap<Name, Vec<ResourceRecord>>> {
    let mut combined: HashMap<Name, Vec<ResourceRecord>> = HashMap::new();
    let mut is_error = false;

    for path in &settings.zone_files {
        match tokio::fs::read_to_string(Path::new(path)).await {
            Ok(data) => match loader::parse_zone_file(&data) {
                Ok(zones) => {
                    for (apex, mut records) in zones {
                        combined.entry(apex).or_default().append(&mut records);
                    }
                }
                Err(error) => {
                    tracing::warn!(?path, %error, "could not parse zone file");
                    is_error = true;
                }
            },
            Err(error) => {
                tracing::warn!(?path, %error, "could not read zone file");
                is_error = true;
            }
        }
    }

    if is_error {
        None
    } else {
        Some(combined)
    }
}

/// Load every configured blocklist file into rules.
async fn load_block_rules(settings: &Settings) -> Option<Vec<BlockRule>> {
    let added_at = unix_now();
    let mut rules = Vec::new();
    let mut is_error = false;

    for path in &settings.block_files {
        match tokio::fs::read_to_string(Path::new(path)).await {
            Ok(data) => {
                let source = Path::new(path)
                    .file_name()
                    .map_or_else(|| path.clone(), |name| name.to_string_lossy().into_owned());
                let mut parsed = loader::parse_block_file(&data, &source, added_at);
                tracing::info!(?path, rules = parsed.len(), "loaded blocklist file");
                rules.append(&mut parsed);
            }
            Err(error) => {
                tracing::warn!(?path, %error, "could not read blocklist file");
                is_error = true;
            }
        }
    }

    if is_error {
        None
    } else {
        Some(rules)
    }
}

/// Publish freshly-loaded zones, dropping apexes that are no longer
/// present in the files.
fn apply_zones(resolver: &Resolver, loaded: HashMap<Name, Vec<ResourceRecord>>) {
    let keep: HashSet<Name> = loaded.keys().cloned().collect();
    for apex in resolver.zones.zones() {
        if !keep.contains(&apex) {
            resolver.zones.remove_zone(&apex);
        }
    }
    for (apex, records) in loaded {
        resolver.zones.put_zone(apex, records);
    }
    tracing::info!(zones = resolver.zones.count(), "zones published");
}

/// Reload zones and blocklist files on SIGUSR1, without a restart.
async fn reload_task(resolver: Resolver, settings: Settings, version: Arc<AtomicU64>) {
    let mut stream = match signal(SignalKind::user_defined1()) {
        Ok(stream) => stream,
        Err(error) => {
            tracing::error!(%error, "could not subscribe to SIGUSR1");
            process::exit(1);
        }
    };

    loop {
        stream.recv().await;
        tracing::info!("SIGUSR1 received, reloading");
        let started = Instant::now();

        match load_zone_configuration(&settings).await {
            Some(loaded) => apply_zones(&resolver, loaded),
            None => tracing::warn!("zone reload failed, keeping the previous zones"),
        }

        if let Some(rules) = load_block_rules(&settings).await {
            let next_version = version.fetch_add(1, Ordering::SeqCst) + 1;
            match resolver
                .blocklist
                .update_all(&rules, next_version, unix_now_signed())
            {
                Ok(()) => {}
                Err(error) => {
                    tracing::warn!(%error, "blocklist update failed, keeping the previous snapshot");
                }
            }
        } else {
            tracing::warn!("blocklist reload failed, keeping the previous snapshot");
        }

        tracing::info!(duration_seconds = %started.elapsed().as_secs_f64(), "reload done");
    }
}

fn begin_logging(settings: &Settings) {
    let log_format = if let Ok(var) = env::var("RUST_LOG_FORMAT") {
        let mut set = HashSet::new();
        for s in var.split(',') {
            set.insert(s.to_string());
        }
        set
    } else {
        HashSet::new()
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(settings.log_level.to_string()));
    let logger = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(!log_format.contains("no-ansi"));

    if log_format.contains("json") {
        if log_format.contains("no-time") {
            logger.json().without_time().init();
        } else {
            logger.json().init();
        }
    } else if log_format.contains("compact") {
        if log_format.contains("no-time") {
            logger.compact().without_time().init();
        } else {
            logger.compact().init();
        }
    } else if log_format.contains("no-time") {
        logger.without_time().init();
    } else {
        logger.init();
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_secs())
}

fn unix_now_signed() -> i64 {
    i64::try_from(unix_now()).unwrap_or(i64::MAX)
}

// the doc comments for this struct turn into the CLI help text
#[derive(Debug, Parser, Clone)]
/// A DNS server for networks that want their own zones and fewer ads.
///
/// udns answers from its authoritative zones, filters names through a
/// multi-source blocklist, serves recent answers from cache, and
/// forwards everything else to the configured upstream resolvers.
///
/// Configuration comes from UDNS_-prefixed environment variables,
/// optionally layered over a config file (UDNS_CONFIG or --config).
/// Send SIGUSR1 to reload zone and blocklist files without a restart.
struct Args {
    /// Path to a configuration file
    #[clap(short, long, value_parser)]
    config: Option<PathBuf>,

    /// Validate the configuration, print nothing else, and exit
    #[clap(long, action(clap::ArgAction::SetTrue))]
    check_config: bool,

    /// Probe the upstream servers and exit 0 only if one answers
    #[clap(long, action(clap::ArgAction::SetTrue))]
    health_upstreams: bool,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    if let Some(path) = &args.config {
        env::set_var("UDNS_CONFIG", path);
    }

    let settings = match Settings::load() {
        Ok(settings) => settings,
        Err(error) => {
            eprintln!("configuration error: {error}");
            process::exit(1);
        }
    };

    if args.check_config {
        println!("configuration ok");
        return;
    }

    begin_logging(&settings);
    tracing::info!(env = ?settings.env, upstreams = ?settings.upstreams, "starting udns");

    let upstream = Forwarder::with_timeout(settings.upstream_addrs(), settings.upstream_timeout());

    if args.health_upstreams {
        if upstream.health().await {
            tracing::info!("upstream health check passed");
            return;
        }
        tracing::error!("upstream health check failed");
        process::exit(1);
    }

    let store = match Store::open(Path::new(&settings.store_path)) {
        Ok(store) => store,
        Err(error) => {
            tracing::error!(path = %settings.store_path, %error, "could not open blocklist store");
            process::exit(1);
        }
    };
    let repository = Repository::new(
        store,
        settings.decision_cache_size as usize,
        settings.bloom_fp_rate,
    );

    let cache = match SharedCache::with_capacity(settings.cache_size as usize) {
        Ok(cache) => cache,
        Err(error) => {
            tracing::error!(%error, "could not create response cache");
            process::exit(1);
        }
    };

    let resolver = Resolver {
        blocklist: Arc::new(repository),
        zones: Arc::new(Zones::new()),
        cache: Arc::new(cache),
        upstream: Arc::new(upstream),
    };

    let Some(loaded_zones) = load_zone_configuration(&settings).await else {
        tracing::error!("could not load zone configuration");
        process::exit(1);
    };
    apply_zones(&resolver, loaded_zones);

    let Some(rules) = load_block_rules(&settings).await else {
        tracing::error!("could not load blocklist configuration");
        process::exit(1);
    };
    let initial_version = match resolver.blocklist.metadata() {
        Ok(Some(metadata)) => metadata.version + 1,
        _ => 1,
    };
    if let Err(error) = resolver
        .blocklist
        .update_all(&rules, initial_version, unix_now_signed())
    {
        tracing::error!(%error, "could not build the initial blocklist snapshot");
        process::exit(1);
    }

    tracing::info!(interface = %settings.interface, port = %settings.port, "binding DNS UDP socket");
    let udp = match UdpSocket::bind((settings.interface, settings.port)).await {
        Ok(socket) => socket,
        Err(error) => {
            tracing::error!(%error, "could not bind DNS UDP socket");
            process::exit(1);
        }
    };

    let version = Arc::new(AtomicU64::new(initial_version));
    tokio::spawn(listen_udp_task(resolver.clone(), udp));
    tokio::spawn(reload_task(resolver, settings, version));

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(error) => {
            tracing::error!(%error, "could not subscribe to SIGTERM");
            process::exit(1);
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    tracing::info!("shutting down");
}

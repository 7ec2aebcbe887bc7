use crate::config::Config;
use crate::Args;
use relay_bus::{BusBridge, BusConfig, GroupSpec};
use relay_codec::Codec;
use relay_dedup::DedupRing;
use relay_ingress::receive_callback;
use relay_overlay::{AnnounceEvent, FakeOverlay, OverlayTransport};
use relay_path::{read_observer_file, write_path_state_file, Observation, PathController};
use relay_peers::PeerDirectory;
use relay_sender::ReliableSender;
use relay_spool::Spool;
use relay_status::PacketEventLog;
use relay_types::AppPort;
use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex as SyncMutex};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

const DEFAULT_DICTIONARY_SAMPLES: &[&str] = &[
    "<event version=\"2.0\" type=\"a-f-G-U-C\" uid=\"relayd-bootstrap\"><point lat=\"0.0\" lon=\"0.0\" hae=\"0.0\" ce=\"1.0\" le=\"1.0\"/></event>",
];

fn default_dictionary() -> Vec<u8> {
    let samples: Vec<Vec<u8>> = DEFAULT_DICTIONARY_SAMPLES.iter().map(|s| s.as_bytes().to_vec()).collect();
    zstd::dict::from_samples(&samples, 8 * 1024).unwrap_or_default()
}

fn default_bus_config(bridge_iface: String) -> BusConfig {
    BusConfig {
        bridge_iface,
        egress_groups: vec![
            GroupSpec::new(Ipv4Addr::new(224, 10, 10, 1), 17012),
            GroupSpec::new(Ipv4Addr::new(239, 2, 3, 1), 6969),
            GroupSpec::new(Ipv4Addr::new(239, 5, 5, 55), 7171),
        ],
        ingress_groups: vec![
            GroupSpec::new(Ipv4Addr::new(224, 10, 10, 1), 17013),
            GroupSpec::new(Ipv4Addr::new(239, 2, 3, 1), 6971),
        ],
    }
}

/// Loads the config file, applies CLI overrides. A malformed or missing
/// config file is `ConfigInvalid` — fatal, exit code 1.
pub fn load_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_path(path)?,
        None => Config::default(),
    };
    if let Some(iface) = &args.bridge_iface {
        config.bridge_iface = iface.clone();
    }
    if let Some(level) = &args.log_level {
        config.log_level = level.clone();
    }
    Ok(config)
}

pub fn init_tracing(log_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_new(log_level)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Wires every component together and runs every task to completion
/// (i.e. until `shutdown` fires). Returns once every task has exited.
pub async fn run(config: Config, dry_run: bool, shutdown: CancellationToken) -> anyhow::Result<()> {
    let codec = Arc::new(match &config.dictionary_path {
        Some(path) => Codec::new(std::fs::read(path)?),
        None => {
            tracing::warn!("no DICTIONARY_PATH configured, using a minimal built-in fallback dictionary");
            Codec::new(default_dictionary())
        }
    });
    let spool = Arc::new(Spool::open(&config.spool_root)?);
    let dedup = Arc::new(DedupRing::new());
    let peer_directory = PeerDirectory::new();
    let path_controller = Arc::new(PathController::new());
    let packet_event_log = Arc::new(PacketEventLog::new());

    // The real Overlay Transport (a Reticulum-class mesh/radio stack) is
    // out of this crate's scope; `FakeOverlay` is the integration point a
    // production build would replace with a real implementation of
    // `relay_overlay::OverlayTransport`.
    let overlay: Arc<dyn OverlayTransport> = Arc::new(FakeOverlay::new());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn({
        let shutdown = shutdown.clone();
        let shutdown_tx = shutdown_tx.clone();
        async move {
            shutdown.cancelled().await;
            let _ = shutdown_tx.send(true);
        }
    });

    {
        let peer_directory = peer_directory.clone();
        let overlay_for_announce = overlay.clone();
        overlay.register_announce_handler(Box::new(move |event: AnnounceEvent| {
            let hostname = String::from_utf8_lossy(&event.app_data).to_string();
            let is_new = peer_directory.on_announce(&event, hostname);
            if is_new {
                let overlay = overlay_for_announce.clone();
                tokio::spawn(relay_peers::announce_self_once_delayed(overlay, b"relayd".to_vec()));
            }
        }));
    }

    if dry_run {
        tracing::info!("dry-run: skipping real multicast bus, operating overlay-only");
        run_overlay_only(config, spool, peer_directory, path_controller, packet_event_log, overlay, shutdown_rx).await
    } else {
        run_with_real_bus(config, codec, spool, dedup, peer_directory, path_controller, packet_event_log, overlay, shutdown_rx).await
    }
}

async fn run_overlay_only(
    config: Config,
    spool: Arc<Spool>,
    peer_directory: Arc<PeerDirectory>,
    path_controller: Arc<PathController>,
    packet_event_log: Arc<PacketEventLog>,
    overlay: Arc<dyn OverlayTransport>,
    shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let sender = ReliableSender::new(spool, peer_directory.clone(), path_controller.clone(), overlay.clone(), packet_event_log.clone());

    let sender_task = spawn_sender_task(sender, shutdown_rx.clone());
    let path_task = spawn_path_task(config.clone(), path_controller.clone(), peer_directory.clone(), packet_event_log.clone(), shutdown_rx.clone());
    let peerdir_task = spawn_peerdir_task(config.clone(), peer_directory.clone(), overlay.clone(), shutdown_rx.clone());

    let _ = tokio::join!(sender_task, path_task, peerdir_task);
    Ok(())
}

async fn run_with_real_bus(
    config: Config,
    codec: Arc<Codec>,
    spool: Arc<Spool>,
    dedup: Arc<DedupRing>,
    peer_directory: Arc<PeerDirectory>,
    path_controller: Arc<PathController>,
    packet_event_log: Arc<PacketEventLog>,
    overlay: Arc<dyn OverlayTransport>,
    shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let bus_config = default_bus_config(config.bridge_iface.clone());
    let bridge = BusBridge::open(bus_config)?;
    let ingress_ports = bridge.ingress_ports();
    let bus = Arc::new(SyncMutex::new(bridge));

    let primary_ingress_port = *ingress_ports.first().unwrap_or(&AppPort(17013));
    overlay.set_receive_callback(receive_callback(
        dedup.clone(),
        codec.clone(),
        bus.clone(),
        primary_ingress_port,
        packet_event_log.clone(),
    ));

    let sender = ReliableSender::new(spool.clone(), peer_directory.clone(), path_controller.clone(), overlay.clone(), packet_event_log.clone());

    let bus_task = spawn_bus_task(bus.clone(), codec, dedup, spool, packet_event_log.clone(), shutdown_rx.clone());
    let iface_task = tokio::spawn(relay_bus::watch_interface(bus.clone(), shutdown_rx.clone()));
    let sender_task = spawn_sender_task(sender, shutdown_rx.clone());
    let path_task = spawn_path_task(config.clone(), path_controller.clone(), peer_directory.clone(), packet_event_log.clone(), shutdown_rx.clone());
    let peerdir_task = spawn_peerdir_task(config.clone(), peer_directory.clone(), overlay.clone(), shutdown_rx.clone());

    let _ = tokio::join!(bus_task, iface_task, sender_task, path_task, peerdir_task);
    Ok(())
}

/// T-bus: a single thread polling every egress socket on a short
/// non-blocking cycle, driven on a dedicated blocking thread so the
/// multi-threaded Tokio runtime's worker threads are never tied up in a
/// sleep/poll loop. Every datagram read this cycle is run through the
/// outbound pipeline synchronously (bus receive -> compress -> dedup ->
/// spool) before the next poll.
fn spawn_bus_task(
    bus: Arc<SyncMutex<BusBridge>>,
    codec: Arc<Codec>,
    dedup: Arc<DedupRing>,
    spool: Arc<Spool>,
    packet_event_log: Arc<PacketEventLog>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        let received = {
            let mut bridge = bus.lock().expect("bus bridge mutex poisoned");
            bridge.poll_egress()
        };
        for (_source_port, raw) in received {
            stage_egress_packet(&raw, &codec, &dedup, &spool, &packet_event_log);
        }
        std::thread::sleep(std::time::Duration::from_millis(100));
    })
}

/// Compresses, dedups, and spools one app-egress datagram. A compressed
/// size over `MAX_COMPRESSED` or a dictionary failure drops the packet;
/// this is deliberate, not a bug — an oversized CoT event has no safe
/// fallback on a bandwidth-constrained mesh. A fresh content hash
/// proceeds to `Spool::stage`.
fn stage_egress_packet(raw: &[u8], codec: &Codec, dedup: &DedupRing, spool: &Spool, packet_event_log: &PacketEventLog) {
    let compressed = match codec.compress(raw) {
        Ok(compressed) => compressed,
        Err(relay_codec::CodecError::TooLarge { actual, limit }) => {
            tracing::warn!(actual, limit, "dropping egress packet: exceeds compressed-size ceiling");
            packet_event_log.record(
                relay_status::PacketEventKind::DroppedTooLarge,
                None,
                None,
                None,
                Some(format!("{actual} bytes exceeds {limit}-byte ceiling")),
            );
            return;
        }
        Err(err) => {
            tracing::warn!(error = %err, "failed to compress egress packet");
            return;
        }
    };
    let content_hash = relay_types::ContentHash::from_bytes(&compressed);
    if dedup.observe(content_hash) == relay_dedup::Observation::Duplicate {
        tracing::debug!(hash = %content_hash, "dropping duplicate egress packet");
        packet_event_log.record(relay_status::PacketEventKind::DroppedDuplicate, None, Some(content_hash), None, None);
        return;
    }
    match spool.stage(&compressed) {
        Ok(packet_id) => {
            packet_event_log.record(relay_status::PacketEventKind::Staged, Some(packet_id), Some(content_hash), None, None);
        }
        Err(err) => tracing::warn!(error = %err, "failed to stage egress packet"),
    }
}

fn spawn_sender_task(sender: Arc<ReliableSender>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = ticker.tick() => sender.tick(),
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    })
}

fn spawn_path_task(
    config: Config,
    path_controller: Arc<PathController>,
    peer_directory: Arc<PeerDirectory>,
    packet_event_log: Arc<PacketEventLog>,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let observations = read_observer_file(&config.observer_file);
                    for (hostname, seconds_since_last) in &observations {
                        path_controller.observe(hostname, Observation::Heartbeat { seconds_since_last: *seconds_since_last });
                    }
                    path_controller.clean_stale();
                    peer_directory.clean_stale();
                    if let Err(err) = write_path_state_file(&path_controller, &config.path_state_file) {
                        tracing::warn!(error = %err, "failed to write path state export");
                    }
                    if let Err(err) = peer_directory.export_to_file(&config.peer_directory_export) {
                        tracing::warn!(error = %err, "failed to write peer directory export");
                    }
                    if let Err(err) = packet_event_log.export_to_file(&config.packet_event_log_export) {
                        tracing::warn!(error = %err, "failed to write packet event log export");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    })
}

fn spawn_peerdir_task(
    config: Config,
    peer_directory: Arc<PeerDirectory>,
    overlay: Arc<dyn OverlayTransport>,
    shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    let _ = peer_directory;
    let hostname = hostname_app_data();
    let _ = config;
    tokio::spawn(relay_peers::run_periodic_announce(overlay, hostname, shutdown))
}

fn hostname_app_data() -> Vec<u8> {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "relayd-node".to_string()).into_bytes()
}

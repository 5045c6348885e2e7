use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{debug, error, info, warn};
use tokio::net::UdpSocket;
use tokio::signal;
use tokio::sync::watch;

use ztpd::auth::AuthStage;
use ztpd::classify::Classifier;
use ztpd::config::Config;
use ztpd::fetcher::HttpFetcher;
use ztpd::http;
use ztpd::keyman::KeyMan;
use ztpd::metrics::Metrics;
use ztpd::packet::{Handled, Packet, Pipeline, Stage};
use ztpd::peers::PeerTable;
use ztpd::transform::Transformer;
use ztpd::transition::{self, TransitionStage};
use ztpd::tunnel::{Tunnel, UdpTunnel};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(long, short = 'C', help = "Path to config file")]
    config: Option<PathBuf>,
    #[arg(long, help = "Path to the master secret file")]
    master_secret: PathBuf,
}

const MAX_PACKET: usize = 65536;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::init();

    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::load_or_default(),
    };
    config.validate()?;

    let master_secret = fs::read(&args.master_secret)
        .context(format!("Failed to read master secret: {:?}", args.master_secret))?;
    if master_secret.is_empty() {
        anyhow::bail!("master secret file is empty");
    }

    info!("Starting ZTP daemon as {}", config.daemon.local_addr);

    let peers = Arc::new(PeerTable::new(
        config.peers.iter().map(|p| (p.id.clone(), p.data_port)),
    )?);
    let keyman = Arc::new(KeyMan::new(master_secret, config.keys.clone()));
    let transformer = Arc::new(Transformer::new());
    let tunnel: Arc<dyn Tunnel> = Arc::new(
        UdpTunnel::new(config.tunnel.forward_addr).context("Failed to open tunnel socket")?,
    );
    let transition_stage = Arc::new(TransitionStage::new(
        Arc::clone(&tunnel),
        config.transition.flow_bypass,
        config.transition.flow_bypass_ttl(),
    ));
    if config.transition.flow_bypass {
        warn!(
            "established-flow bypass enabled ({}s window): denied packets may \
             be admitted when the reverse flow was recently seen",
            config.transition.flow_bypass_ttl_secs
        );
    }
    let metrics = Metrics::new();

    let egress_pipeline = Arc::new(Pipeline::new(vec![
        Stage::Classify(Classifier),
        Stage::Transition(Arc::clone(&transition_stage)),
        Stage::Auth(AuthStage::new(
            Arc::clone(&keyman),
            Arc::clone(&transformer),
            false,
            config.keys.max_time_diff(),
        )),
    ]));
    let ingress_pipeline = Arc::new(Pipeline::new(vec![
        Stage::Auth(AuthStage::new(
            Arc::clone(&keyman),
            Arc::clone(&transformer),
            true,
            config.keys.max_time_diff(),
        )),
        Stage::Classify(Classifier),
        Stage::Transition(Arc::clone(&transition_stage)),
    ]));

    // Control plane: policy refresh, L1 key service, cache sweep, metrics.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let fetcher = HttpFetcher::new(
        config.daemon.local_addr.clone(),
        config.transition.controller_addr.clone(),
    )?;
    let refresh_handle = tokio::spawn(transition::run_refresh(
        Arc::clone(&transition_stage),
        fetcher,
        config.transition.refresh_interval(),
        shutdown_rx,
    ));
    let serve_handle = tokio::spawn(Arc::clone(&keyman).serve_l1(Arc::clone(&peers)));
    tokio::spawn(Arc::clone(&keyman).run_purge());

    let metrics_http = Arc::clone(&metrics);
    let metrics_port = config.metrics.port;
    tokio::spawn(async move {
        if let Err(e) = http::serve_status(metrics_http, metrics_port).await {
            error!("metrics server failed: {}", e);
        }
    });

    // Datapath: underlay socket towards peers, tunnel socket towards the LAN.
    let data_socket = Arc::new(
        UdpSocket::bind(("0.0.0.0", config.daemon.data_port))
            .await
            .context("Failed to bind underlay data socket")?,
    );
    let tunnel_socket = UdpSocket::bind(config.tunnel.listen_addr)
        .await
        .context("Failed to bind tunnel listen socket")?;
    info!(
        "datapath up: underlay port {}, tunnel {}",
        config.daemon.data_port, config.tunnel.listen_addr
    );

    // Ingress: underlay -> pipeline -> tunnel. Each packet is handled by
    // its own task end-to-end.
    {
        let data_socket = Arc::clone(&data_socket);
        let peers = Arc::clone(&peers);
        let pipeline = Arc::clone(&ingress_pipeline);
        let tunnel = Arc::clone(&tunnel);
        let metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_PACKET];
            loop {
                let (len, src) = match data_socket.recv_from(&mut buf).await {
                    Ok(recv) => recv,
                    Err(e) => {
                        error!("underlay socket error: {}", e);
                        continue;
                    }
                };
                metrics.inc_ingress();
                let Some(remote_tp) = peers.id_by_ip(src.ip()).map(str::to_string) else {
                    metrics.record_drop("spoofed_source");
                    debug!("dropping packet from unknown underlay address {}", src);
                    continue;
                };
                let pkt = Packet::ingress(buf[..len].to_vec(), remote_tp);
                let pipeline = Arc::clone(&pipeline);
                let tunnel = Arc::clone(&tunnel);
                let metrics = Arc::clone(&metrics);
                tokio::spawn(async move {
                    match pipeline.handle(pkt).await {
                        Ok(Handled::Forward(p)) => {
                            if let Err(e) = tunnel.write_packet(&p.raw) {
                                warn!("tunnel write failed: {}", e);
                            }
                        }
                        Ok(Handled::Consumed) => {}
                        Err(e) => {
                            metrics.record_drop(e.kind());
                            debug!("ingress drop: {}", e);
                        }
                    }
                });
            }
        });
    }

    // Egress: tunnel -> pipeline -> underlay.
    {
        let data_socket = Arc::clone(&data_socket);
        let peers = Arc::clone(&peers);
        let pipeline = Arc::clone(&egress_pipeline);
        let metrics = Arc::clone(&metrics);
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_PACKET];
            loop {
                let (len, _) = match tunnel_socket.recv_from(&mut buf).await {
                    Ok(recv) => recv,
                    Err(e) => {
                        error!("tunnel socket error: {}", e);
                        continue;
                    }
                };
                metrics.inc_egress();
                let pkt = Packet::egress(buf[..len].to_vec());
                let pipeline = Arc::clone(&pipeline);
                let peers = Arc::clone(&peers);
                let data_socket = Arc::clone(&data_socket);
                let metrics = Arc::clone(&metrics);
                tokio::spawn(async move {
                    match pipeline.handle(pkt).await {
                        Ok(Handled::Forward(p)) => match peers.get(&p.remote_tp) {
                            Some(peer) => {
                                if let Err(e) = data_socket.send_to(&p.raw, peer.data_addr()).await
                                {
                                    warn!("underlay send to {} failed: {}", p.remote_tp, e);
                                }
                            }
                            None => {
                                metrics.record_drop("key_unavailable");
                                debug!("no underlay endpoint for {}", p.remote_tp);
                            }
                        },
                        Ok(Handled::Consumed) => {}
                        Err(e) => {
                            metrics.record_drop(e.kind());
                            debug!("egress drop: {}", e);
                        }
                    }
                });
            }
        });
    }

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Exiting...");
            let _ = shutdown_tx.send(true);
        }
        res = refresh_handle => {
            match res {
                Ok(Err(e)) => anyhow::bail!("policy refresh failed: {}", e),
                Err(e) => anyhow::bail!("policy refresh task panicked: {}", e),
                Ok(Ok(())) => {}
            }
        }
        res = serve_handle => {
            match res {
                Ok(Err(e)) => anyhow::bail!("L1 key service failed: {}", e),
                Err(e) => anyhow::bail!("L1 key service task panicked: {}", e),
                Ok(Ok(())) => {}
            }
        }
    }

    Ok(())
}

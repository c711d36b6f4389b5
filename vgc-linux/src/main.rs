// Virtual game controller daemon for Linux: DNS-SD discovery, TCP stream pairs, one event loop.

mod config;
mod console;
mod discovery;
mod transport;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tokio::io::AsyncBufReadExt;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vgc_core::{
    ControllerEvent, DeviceDescriptor, ElementId, ElementRegistry, Role, TopologyController,
};

use crate::config::Config;
use crate::console::Command;
use crate::discovery::MdnsBackend;
use crate::transport::{NetEvent, StreamIds, TcpConnector};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const TICK_INTERVAL: Duration = Duration::from_millis(250);

type Controller = TopologyController<MdnsBackend, TcpConnector>;

fn main() -> anyhow::Result<()> {
    let mut role = None;
    let mut name = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("vgc-linux {}", VERSION);
                return Ok(());
            }
            "--role" => {
                let value = args.next().context("--role needs a value")?;
                role = Some(value.parse::<Role>().map_err(anyhow::Error::msg)?);
            }
            "--name" => name = Some(args.next().context("--name needs a value")?),
            other => anyhow::bail!("unknown argument {other:?}"),
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("VGC_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let mut cfg = config::load();
    if let Some(role) = role {
        cfg.core.role = role;
    }
    if let Some(name) = name {
        cfg.name = name;
    }

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(run(cfg))
}

async fn run(cfg: Config) -> anyhow::Result<()> {
    let role = cfg.core.role;
    info!(version = VERSION, ?role, name = %cfg.name, "vgc-linux starting");

    let registry = Arc::new(ElementRegistry::standard());
    let mapping = resolve_mapping(&registry, &cfg.mapping)?;
    let ids = StreamIds::default();
    let (net_tx, mut net_rx) = mpsc::unbounded_channel();
    let (disc_tx, mut disc_rx) = mpsc::unbounded_channel();

    let listener = if role.accepts_peripherals() {
        Some(transport::bind(cfg.port).await.context("binding stream listener")?)
    } else {
        None
    };
    let port = match &listener {
        Some(l) => l.local_addr()?.port(),
        None => cfg.port,
    };

    let backend = MdnsBackend::new(port, disc_tx).context("starting mDNS")?;
    let connector = TcpConnector::new(ids.clone(), net_tx.clone());
    let descriptor =
        DeviceDescriptor::new(cfg.name.clone(), cfg.profile).with_motion(cfg.supports_motion);
    let mut controller: Controller =
        TopologyController::new(cfg.core.clone(), registry, descriptor, backend, connector);
    controller.set_mapping(mapping);

    if let Some(listener) = listener {
        tokio::spawn(transport::accept_loop(listener, ids, net_tx.clone()));
        controller.advertise(&cfg.name)?;
    }
    if role != Role::Sink {
        controller.browse()?;
    }

    let mut console = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut console_open = true;
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            r = &mut shutdown => {
                if let Err(e) = r {
                    warn!("signal handler failed: {}", e);
                }
                break;
            }
            _ = ticker.tick() => controller.tick(Instant::now()),
            Some(event) = net_rx.recv() => on_net_event(&mut controller, event),
            Some(event) = disc_rx.recv() => controller.on_discovery_event(event),
            line = console.next_line(), if console_open => match line {
                Ok(Some(line)) if !line.trim().is_empty() => run_command(&mut controller, &line),
                Ok(Some(_)) => {}
                Ok(None) | Err(_) => console_open = false,
            },
        }
        drain_events(&mut controller, &cfg);
    }

    info!("shutting down");
    controller.disconnect();
    controller.stop_browsing();
    controller.stop_advertising();
    controller.discovery().backend().shutdown();
    Ok(())
}

fn on_net_event(controller: &mut Controller, event: NetEvent) {
    let now = Instant::now();
    match event {
        NetEvent::Inbound {
            stream,
            preamble,
            channel,
        } => controller.on_inbound_stream(stream, preamble, channel, now),
        NetEvent::Opened(stream) => controller.on_stream_opened(stream, now),
        NetEvent::Bytes(stream, bytes) => controller.on_stream_bytes(stream, &bytes, now),
        NetEvent::Closed { stream, error } => controller.on_stream_closed(stream, error, now),
    }
}

fn drain_events(controller: &mut Controller, cfg: &Config) {
    while let Some(event) = controller.poll_event() {
        match event {
            ControllerEvent::EndpointFound(endpoint) => {
                info!(name = %endpoint.name, role = ?endpoint.role, "found");
                if cfg.auto_connect && controller.role() == Role::Source {
                    if let Err(e) = controller.connect_to(endpoint) {
                        warn!("auto-connect failed: {}", e);
                    }
                }
            }
            ControllerEvent::EndpointLost { full_name } => info!(%full_name, "lost"),
            ControllerEvent::Connected { link, descriptor } => match descriptor {
                Some(d) => info!(%link, vendor = %d.vendor_name, profile = ?d.profile, "connected"),
                None => info!(%link, "connected"),
            },
            ControllerEvent::ConnectionFailed { link, reason } => {
                warn!(%link, ?reason, "connection failed")
            }
            ControllerEvent::Disconnected { link } => info!(%link, "disconnected"),
            ControllerEvent::ElementValueChanged { link, id, value } => {
                let name = controller
                    .registry()
                    .get(id)
                    .map(|e| e.name().to_string())
                    .unwrap_or_else(|| id.to_string());
                info!(%link, element = %name, %value, "value");
            }
            ControllerEvent::InvalidMessage {
                link,
                reported_by_peer,
            } => warn!(%link, reported_by_peer, "invalid message"),
        }
    }
}

fn run_command(controller: &mut Controller, line: &str) {
    let command = match Command::parse(line, controller.registry()) {
        Ok(c) => c,
        Err(e) => {
            println!("{}", e);
            return;
        }
    };
    match command {
        Command::Help => println!("{}", console::HELP),
        Command::List => {
            for e in controller.discovery().endpoints() {
                println!("{:<24} {:?} {:?}", e.name, e.role, e.addresses);
            }
        }
        Command::Links => {
            for l in controller.links() {
                println!(
                    "{} {} {} {} frames={} invalid={:.1}% sent={} dropped={}",
                    l.id,
                    if l.inbound { "in " } else { "out" },
                    if l.connected { "connected " } else { "connecting" },
                    l.descriptor
                        .as_ref()
                        .map(|d| d.vendor_name.as_str())
                        .or(l.endpoint.as_deref())
                        .unwrap_or("-"),
                    l.metrics.frames,
                    l.metrics.invalid_rate() * 100.0,
                    l.sent,
                    l.dropped,
                );
            }
        }
        Command::Browse => {
            if let Err(e) = controller.browse() {
                println!("browse failed: {}", e);
            }
        }
        Command::StopBrowse => controller.stop_browsing(),
        Command::Connect(name) => match controller.connect(&name) {
            Ok(link) => println!("connecting {}", link),
            Err(e) => println!("{}", e),
        },
        Command::Disconnect(None) => controller.disconnect(),
        Command::Disconnect(Some(link)) => controller.disconnect_link(link),
        Command::Set(id, value) => match controller.registry().set(id, value) {
            Ok(()) => controller.send(id),
            Err(e) => println!("{}", e),
        },
    }
}

/// Resolve the configured name-to-name mapping against the registry.
fn resolve_mapping(
    registry: &ElementRegistry,
    names: &HashMap<String, String>,
) -> anyhow::Result<HashMap<ElementId, ElementId>> {
    names
        .iter()
        .map(|(from, to)| {
            let from_id = registry
                .id_of(from)
                .with_context(|| format!("mapping: unknown element {from:?}"))?;
            let to_id = registry
                .id_of(to)
                .with_context(|| format!("mapping: unknown element {to:?}"))?;
            Ok((from_id, to_id))
        })
        .collect()
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}

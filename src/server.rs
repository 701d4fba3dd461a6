//! Per-interface listeners around the [`Engine`].
//!
//! Each configured interface gets a raw `pnet` channel. A blocking thread
//! reads frames into a bounded queue and a tokio task decodes them, runs
//! the engine and writes the framed reply back on the same channel.
//!
//! # Shutdown
//!
//! Reads time out every [`READ_TIMEOUT`] so an idle reader notices when its
//! handler task is gone and returns, letting the runtime shut down.

use std::io;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use ipnet::Ipv4Net;
use pnet::datalink::{self, Channel, DataLinkReceiver, DataLinkSender};
use pnet::util::MacAddr;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::{Config, InterfaceConfig};
use crate::engine::Engine;
use crate::error::{Error, Result};
use crate::frame::{self, InboundFrame, ReplyAddressing};
use crate::store::Repository;

/// Ethernet header plus one VLAN tag.
const ETHERNET_OVERHEAD: usize = 18;
/// Frames buffered between a raw reader and its handler task.
const FRAME_QUEUE_DEPTH: usize = 256;
/// Longest a raw read blocks before the reader checks on its handler.
pub const READ_TIMEOUT: Duration = Duration::from_millis(500);

pub struct DhcpServer<R: Repository> {
    config: Arc<Config>,
    engine: Arc<Engine<R>>,
}

impl<R: Repository> DhcpServer<R> {
    pub fn new(config: Config, repo: Arc<R>) -> Self {
        Self {
            config: Arc::new(config),
            engine: Arc::new(Engine::new(repo)),
        }
    }

    /// Opens every configured interface and serves until all listeners stop.
    ///
    /// # Errors
    ///
    /// Fails before serving anything if any interface cannot be opened.
    pub async fn run(&self) -> Result<()> {
        let listeners = self
            .config
            .interfaces
            .iter()
            .map(Listener::open)
            .collect::<Result<Vec<_>>>()?;

        let mut tasks = JoinSet::new();
        for listener in listeners {
            tasks.spawn(listener.serve(Arc::clone(&self.engine)));
        }

        info!("DHCP server ready on {} interface(s)", tasks.len());

        while let Some(result) = tasks.join_next().await {
            if let Err(error) = result {
                error!("Listener task failed: {}", error);
            }
        }

        Ok(())
    }

}

/// What a reader does after a failed read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadFailure {
    /// Nothing arrived within the timeout; read again.
    Idle,
    /// The handler task is gone; stop quietly.
    Abandoned,
    /// The interface cannot be read any more.
    Fatal,
}

fn classify_read_error(error: &io::Error, handler_gone: bool) -> ReadFailure {
    match error.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => {
            if handler_gone {
                ReadFailure::Abandoned
            } else {
                ReadFailure::Idle
            }
        }
        _ => ReadFailure::Fatal,
    }
}

/// One raw channel on one interface.
struct Listener {
    name: String,
    mac: MacAddr,
    ip: Ipv4Addr,
    local_net: Option<Ipv4Net>,
    tx: Box<dyn DataLinkSender>,
    rx: Box<dyn DataLinkReceiver>,
}

impl Listener {
    fn open(config: &InterfaceConfig) -> Result<Self> {
        let interface = datalink::interfaces()
            .into_iter()
            .find(|interface| interface.name == config.name)
            .ok_or_else(|| Error::Interface(format!("Interface {} not found", config.name)))?;

        let mac = interface
            .mac
            .ok_or_else(|| Error::Interface(format!("{} has no MAC address", config.name)))?;

        let networks: Vec<(Ipv4Addr, u8)> = interface
            .ips
            .iter()
            .filter_map(|network| match network.ip() {
                IpAddr::V4(ip) => Some((ip, network.prefix())),
                IpAddr::V6(_) => None,
            })
            .collect();

        let ip = match config.address {
            Some(ip) => ip,
            None => networks.first().map(|(ip, _)| *ip).ok_or_else(|| {
                Error::Interface(format!("{} has no IPv4 address", config.name))
            })?,
        };

        let local_net = networks
            .iter()
            .find(|(address, _)| *address == ip)
            .and_then(|(address, prefix)| Ipv4Net::new(*address, *prefix).ok())
            .map(|net| net.trunc());

        let channel_config = datalink::Config {
            read_buffer_size: usize::from(config.mtu) + ETHERNET_OVERHEAD,
            read_timeout: Some(READ_TIMEOUT),
            ..Default::default()
        };

        let (tx, rx) = match datalink::channel(&interface, channel_config) {
            Ok(Channel::Ethernet(tx, rx)) => (tx, rx),
            Ok(_) => {
                return Err(Error::Interface(format!(
                    "Unsupported channel type on {}",
                    config.name
                )));
            }
            Err(error) => {
                return Err(Error::Socket(format!(
                    "Failed to open {}: {}. Try running as root or with CAP_NET_RAW.",
                    config.name, error
                )));
            }
        };

        Ok(Self {
            name: config.name.clone(),
            mac,
            ip,
            local_net,
            tx,
            rx,
        })
    }

    /// Reads frames on a blocking thread and answers them on this task.
    ///
    /// Returns when the interface can no longer be read.
    async fn serve<R: Repository>(self, engine: Arc<Engine<R>>) {
        let Listener {
            name,
            mac,
            ip,
            local_net,
            mut tx,
            mut rx,
        } = self;

        let (frames_tx, mut frames_rx) = mpsc::channel::<Vec<u8>>(FRAME_QUEUE_DEPTH);
        let reader_name = name.clone();
        let reader = tokio::task::spawn_blocking(move || {
            loop {
                match rx.next() {
                    Ok(frame) => {
                        if frames_tx.blocking_send(frame.to_vec()).is_err() {
                            break;
                        }
                    }
                    Err(error) => match classify_read_error(&error, frames_tx.is_closed()) {
                        ReadFailure::Idle => {}
                        ReadFailure::Abandoned => {
                            debug!("Reader for {} stopping: handler gone", reader_name);
                            break;
                        }
                        ReadFailure::Fatal => {
                            error!("Error reading from {}: {}", reader_name, error);
                            break;
                        }
                    },
                }
            }
        });

        info!(
            "Listening on {} ({}, {}, network {})",
            name,
            ip,
            mac,
            local_net.map_or_else(|| "unknown".to_string(), |net| net.to_string())
        );

        while let Some(bytes) = frames_rx.recv().await {
            let inbound = match frame::decode(&bytes) {
                Ok(inbound) => inbound,
                Err(error) => {
                    debug!("Dropping frame on {}: {}", name, error);
                    continue;
                }
            };

            if inbound.src_mac == mac {
                continue;
            }

            match respond(&engine, &inbound, mac, ip, local_net).await {
                Ok(Some(reply)) => match tx.send_to(&reply, None) {
                    Some(Ok(())) => {}
                    Some(Err(error)) => warn!("Error sending reply on {}: {}", name, error),
                    None => warn!("Error sending reply on {}: channel closed", name),
                },
                Ok(None) => {}
                Err(error) => warn!(
                    "Dropping request from {} on {}: {}",
                    inbound.dhcp.format_mac(),
                    name,
                    error
                ),
            }
        }

        if let Err(error) = reader.await {
            error!("Reader for {} panicked: {}", name, error);
        }
        error!("Stopped listening on {}", name);
    }
}

/// Runs one decoded request through the engine and frames the reply.
async fn respond<R: Repository>(
    engine: &Engine<R>,
    inbound: &InboundFrame,
    interface_mac: MacAddr,
    interface_ip: Ipv4Addr,
    local_net: Option<Ipv4Net>,
) -> Result<Option<Vec<u8>>> {
    let request = &inbound.dhcp;
    let scope = frame::classify(interface_ip, local_net, inbound.src_ip, request.giaddr);

    if let Some(message_type) = request.message_type() {
        info!("{} from {} ({})", message_type, request.format_mac(), scope);
    }

    let Some(reply) = engine.handle(request, scope.ip, interface_ip).await? else {
        return Ok(None);
    };

    let addressing = ReplyAddressing::for_request(inbound, interface_mac, interface_ip);
    frame::encode(&addressing, &reply.encode()).map(Some)
}

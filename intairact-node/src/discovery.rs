//! LAN discovery: UDP multicast announcements, goodbye on stop, peer expiry.
//!
//! Discovery only reports events; the registry decides what they mean (own device,
//! duplicate refresh, malformed announcement).

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use intairact_core::wire::{decode_datagram, encode_datagram};
use intairact_core::{Announcement, DeviceId, DatagramEncodeError, Message};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::config::Config;

/// What discovery reports to its subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    /// An announcement arrived from `host`. Sent for every announcement, not only new peers.
    Found {
        announcement: Announcement,
        host: IpAddr,
    },
    Lost(DeviceId),
}

/// A discovery mechanism. Methods that start work must be called inside a Tokio runtime.
pub trait Discovery: Send + Sync {
    /// Deliver events to `events` until stopped or the receiver is dropped.
    fn subscribe(&self, events: mpsc::UnboundedSender<DiscoveryEvent>);
    /// Start announcing; the current value of `announcement` goes out on every cycle.
    fn announce(&self, announcement: watch::Receiver<Announcement>) -> Result<(), DiscoveryError>;
    /// Stop announcing and listening. Idempotent.
    fn stop(&self);
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("discovery socket: {0}")]
    Socket(#[from] io::Error),
    #[error(transparent)]
    Encode(#[from] DatagramEncodeError),
}

#[derive(Default)]
struct Subscribers(Mutex<Vec<mpsc::UnboundedSender<DiscoveryEvent>>>);

impl Subscribers {
    fn add(&self, tx: mpsc::UnboundedSender<DiscoveryEvent>) {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).push(tx);
    }

    fn send(&self, event: DiscoveryEvent) {
        let mut subs = self.0.lock().unwrap_or_else(|e| e.into_inner());
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }
}

/// Multicast settings, usually taken from `Config`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MulticastSettings {
    pub group: Ipv4Addr,
    pub port: u16,
    pub interval: Duration,
    pub peer_timeout: Duration,
}

impl MulticastSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            group: config.multicast_group,
            port: config.discovery_port,
            interval: config.announce_interval(),
            peer_timeout: config.peer_timeout(),
        }
    }

    fn dest(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(self.group, self.port))
    }
}

struct Running {
    socket: Arc<UdpSocket>,
    announcement: watch::Receiver<Announcement>,
    tasks: Vec<JoinHandle<()>>,
}

/// Multicast discovery: announce loop, receive loop, peer timeout loop over one socket.
pub struct MulticastDiscovery {
    settings: MulticastSettings,
    subscribers: Arc<Subscribers>,
    running: Mutex<Option<Running>>,
}

impl MulticastDiscovery {
    pub fn new(settings: MulticastSettings) -> Self {
        Self {
            settings,
            subscribers: Arc::new(Subscribers::default()),
            running: Mutex::new(None),
        }
    }
}

impl Discovery for MulticastDiscovery {
    fn subscribe(&self, events: mpsc::UnboundedSender<DiscoveryEvent>) {
        self.subscribers.add(events);
    }

    fn announce(&self, announcement: watch::Receiver<Announcement>) -> Result<(), DiscoveryError> {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.is_some() {
            return Ok(());
        }
        // Fail early on an announcement that does not fit a datagram.
        encode_datagram(&Message::Announce(announcement.borrow().clone()))?;
        let socket = Arc::new(make_multicast_socket(&self.settings)?);
        let peers: Arc<Mutex<HashMap<DeviceId, Instant>>> = Arc::new(Mutex::new(HashMap::new()));

        let tasks = vec![
            tokio::spawn(announce_loop(
                socket.clone(),
                announcement.clone(),
                self.settings.dest(),
                self.settings.interval,
            )),
            tokio::spawn(recv_loop(
                socket.clone(),
                peers.clone(),
                self.subscribers.clone(),
            )),
            tokio::spawn(peer_timeout_loop(
                peers,
                self.subscribers.clone(),
                self.settings.peer_timeout,
            )),
        ];
        tracing::info!(
            group = %self.settings.group,
            port = self.settings.port,
            "multicast discovery started"
        );
        *running = Some(Running {
            socket,
            announcement,
            tasks,
        });
        Ok(())
    }

    fn stop(&self) {
        let Some(running) = self.running.lock().unwrap_or_else(|e| e.into_inner()).take() else {
            return;
        };
        let device_id = running.announcement.borrow().device_id.clone();
        match encode_datagram(&Message::Goodbye { device_id }) {
            Ok(datagram) => {
                if let Err(e) = running.socket.try_send_to(&datagram, self.settings.dest()) {
                    tracing::debug!(error = %e, "goodbye not sent");
                }
            }
            Err(e) => tracing::debug!(error = %e, "goodbye not encoded"),
        }
        for task in running.tasks {
            task.abort();
        }
        tracing::info!("multicast discovery stopped");
    }
}

impl Drop for MulticastDiscovery {
    fn drop(&mut self) {
        self.stop();
    }
}

fn make_multicast_socket(settings: &MulticastSettings) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    // Several nodes on one host share the discovery port.
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    let bind = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, settings.port));
    socket.bind(&bind.into())?;
    socket.join_multicast_v4(&settings.group, &Ipv4Addr::UNSPECIFIED)?;
    socket.set_multicast_loop_v4(true)?;
    socket.set_multicast_ttl_v4(1)?;
    socket.set_nonblocking(true)?;
    UdpSocket::from_std(socket.into())
}

async fn announce_loop(
    socket: Arc<UdpSocket>,
    mut announcement: watch::Receiver<Announcement>,
    dest: SocketAddr,
    interval: Duration,
) {
    loop {
        let msg = Message::Announce(announcement.borrow_and_update().clone());
        match encode_datagram(&msg) {
            Ok(datagram) => {
                if let Err(e) = socket.send_to(&datagram, dest).await {
                    tracing::debug!(%dest, error = %e, "announce send failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "announcement not encodable"),
        }
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            changed = announcement.changed() => {
                if changed.is_err() {
                    return;
                }
            }
        }
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    peers: Arc<Mutex<HashMap<DeviceId, Instant>>>,
    subscribers: Arc<Subscribers>,
) {
    let mut buf = vec![0u8; 65536];
    loop {
        let (n, from) = match socket.recv_from(&mut buf).await {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "discovery receive failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        let event = {
            let mut peers = peers.lock().unwrap_or_else(|e| e.into_inner());
            handle_datagram(&buf[..n], from, &mut peers, Instant::now())
        };
        if let Some(event) = event {
            subscribers.send(event);
        }
    }
}

/// Turn one datagram into an event, tracking when each peer was last heard.
fn handle_datagram(
    bytes: &[u8],
    from: SocketAddr,
    peers: &mut HashMap<DeviceId, Instant>,
    now: Instant,
) -> Option<DiscoveryEvent> {
    let msg = match decode_datagram(bytes) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::debug!(%from, error = %e, "ignoring datagram");
            return None;
        }
    };
    match msg {
        Message::Announce(announcement) => {
            peers.insert(announcement.device_id.clone(), now);
            Some(DiscoveryEvent::Found {
                announcement,
                host: from.ip(),
            })
        }
        Message::Goodbye { device_id } => {
            peers.remove(&device_id);
            Some(DiscoveryEvent::Lost(device_id))
        }
    }
}

/// Remove and return peers not heard from within `timeout`.
fn expire_peers(
    peers: &mut HashMap<DeviceId, Instant>,
    now: Instant,
    timeout: Duration,
) -> Vec<DeviceId> {
    let expired: Vec<DeviceId> = peers
        .iter()
        .filter(|(_, seen)| now.duration_since(**seen) >= timeout)
        .map(|(id, _)| id.clone())
        .collect();
    for id in &expired {
        peers.remove(id);
    }
    expired
}

async fn peer_timeout_loop(
    peers: Arc<Mutex<HashMap<DeviceId, Instant>>>,
    subscribers: Arc<Subscribers>,
    timeout: Duration,
) {
    let tick = (timeout / 4).max(Duration::from_millis(250));
    loop {
        tokio::time::sleep(tick).await;
        let expired = {
            let mut peers = peers.lock().unwrap_or_else(|e| e.into_inner());
            expire_peers(&mut peers, Instant::now(), timeout)
        };
        for id in expired {
            tracing::debug!(device = %id, "peer timed out");
            subscribers.send(DiscoveryEvent::Lost(id));
        }
    }
}

/// Discovery driven by hand: events are injected, announcements are only recorded.
/// For tests and for embedding with an external discovery mechanism.
#[derive(Default)]
pub struct ManualDiscovery {
    subscribers: Subscribers,
    announcement: Mutex<Option<watch::Receiver<Announcement>>>,
}

impl ManualDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inject(&self, event: DiscoveryEvent) {
        self.subscribers.send(event);
    }

    /// The announcement currently published, if announcing.
    pub fn announcement(&self) -> Option<Announcement> {
        self.announcement
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|rx| rx.borrow().clone())
    }

    pub fn is_announcing(&self) -> bool {
        self.announcement
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}

impl Discovery for ManualDiscovery {
    fn subscribe(&self, events: mpsc::UnboundedSender<DiscoveryEvent>) {
        self.subscribers.add(events);
    }

    fn announce(&self, announcement: watch::Receiver<Announcement>) -> Result<(), DiscoveryError> {
        *self.announcement.lock().unwrap_or_else(|e| e.into_inner()) = Some(announcement);
        Ok(())
    }

    fn stop(&self) {
        self.announcement
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }
}

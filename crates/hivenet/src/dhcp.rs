//! DHCPv4 client.
//!
//! Implements the RFC 2131 client lease state machine for an interface
//! borrowed onto a bridge:
//!
//! ```text
//! INIT -> SELECTING/REQUESTING -> BOUND -> RENEWING (T1) -> BOUND
//!                                       -> REBINDING (T2) -> BOUND | INIT
//!                                       -> RELEASED (on stop)
//! ```
//!
//! T1 fires at half the lease time and renews by unicast against the
//! server that granted the lease; T2 fires at 7/8 of the lease time and
//! rebinds by broadcast to any server. The two timers stay distinct
//! because the protocol's reachability assumptions differ: a renew that
//! cannot reach the original server must still leave rebind a chance.
//!
//! The wire exchange runs over UDP ports 67/68. Transport is a trait so
//! the state machine is testable against a scripted fake server.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{NetError, Result};

/// DHCP server port.
pub const DHCP_SERVER_PORT: u16 = 67;
/// DHCP client port.
pub const DHCP_CLIENT_PORT: u16 = 68;

/// Default handshake retry count.
pub const DEFAULT_RETRY_TIMES: u32 = 3;
/// Default inter-retry delay.
pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// BOOTP op code for client-originated messages.
pub const BOOTREQUEST: u8 = 1;
/// BOOTP op code for server replies.
pub const BOOTREPLY: u8 = 2;
const FLAG_BROADCAST: u16 = 0x8000;
const MAGIC_COOKIE: [u8; 4] = [99, 130, 83, 99];
const MIN_PACKET: usize = 240;

const OPT_SUBNET_MASK: u8 = 1;
const OPT_ROUTER: u8 = 3;
const OPT_REQUESTED_IP: u8 = 50;
const OPT_LEASE_TIME: u8 = 51;
const OPT_MESSAGE_TYPE: u8 = 53;
const OPT_SERVER_ID: u8 = 54;
const OPT_PARAM_REQUEST: u8 = 55;
const OPT_CLIENT_ID: u8 = 61;
const OPT_END: u8 = 255;

/// DHCP message type (option 53).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// DHCPDISCOVER
    Discover = 1,
    /// DHCPOFFER
    Offer = 2,
    /// DHCPREQUEST
    Request = 3,
    /// DHCPDECLINE
    Decline = 4,
    /// DHCPACK
    Ack = 5,
    /// DHCPNAK
    Nak = 6,
    /// DHCPRELEASE
    Release = 7,
    /// DHCPINFORM
    Inform = 8,
}

impl TryFrom<u8> for MessageType {
    type Error = ();

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Discover),
            2 => Ok(Self::Offer),
            3 => Ok(Self::Request),
            4 => Ok(Self::Decline),
            5 => Ok(Self::Ack),
            6 => Ok(Self::Nak),
            7 => Ok(Self::Release),
            8 => Ok(Self::Inform),
            _ => Err(()),
        }
    }
}

/// A DHCPv4 packet, fixed header plus the options this client reads.
#[derive(Debug, Clone)]
pub struct DhcpPacket {
    /// Operation (1 = request, 2 = reply).
    pub op: u8,
    /// Transaction ID.
    pub xid: u32,
    /// Flags (broadcast bit).
    pub flags: u16,
    /// Client IP address (set when renewing).
    pub ciaddr: Ipv4Addr,
    /// Your IP address (assigned by the server).
    pub yiaddr: Ipv4Addr,
    /// Client hardware address.
    pub chaddr: [u8; 16],
    /// Message type (option 53).
    pub message_type: Option<MessageType>,
    /// Requested IP (option 50).
    pub requested_ip: Option<Ipv4Addr>,
    /// Server identifier (option 54).
    pub server_id: Option<Ipv4Addr>,
    /// Subnet mask (option 1).
    pub subnet_mask: Option<Ipv4Addr>,
    /// Router/gateway (option 3).
    pub router: Option<Ipv4Addr>,
    /// Lease time in seconds (option 51).
    pub lease_secs: Option<u32>,
}

impl DhcpPacket {
    /// Creates a request packet for the given hardware address.
    #[must_use]
    pub fn request_for(mac: [u8; 6], xid: u32) -> Self {
        let mut chaddr = [0u8; 16];
        chaddr[..6].copy_from_slice(&mac);
        Self {
            op: BOOTREQUEST,
            xid,
            flags: FLAG_BROADCAST,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            message_type: None,
            requested_ip: None,
            server_id: None,
            subnet_mask: None,
            router: None,
            lease_secs: None,
        }
    }

    /// Parses a packet from the wire.
    ///
    /// # Errors
    ///
    /// Returns an error if the packet is truncated or the magic cookie is
    /// missing.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < MIN_PACKET {
            return Err(NetError::Dhcp("packet too short".into()));
        }
        if data[236..240] != MAGIC_COOKIE {
            return Err(NetError::Dhcp("missing magic cookie".into()));
        }

        let mut chaddr = [0u8; 16];
        chaddr.copy_from_slice(&data[28..44]);
        let mut packet = Self {
            op: data[0],
            xid: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            flags: u16::from_be_bytes([data[10], data[11]]),
            ciaddr: Ipv4Addr::new(data[12], data[13], data[14], data[15]),
            yiaddr: Ipv4Addr::new(data[16], data[17], data[18], data[19]),
            chaddr,
            message_type: None,
            requested_ip: None,
            server_id: None,
            subnet_mask: None,
            router: None,
            lease_secs: None,
        };
        packet.parse_options(&data[240..]);
        Ok(packet)
    }

    fn parse_options(&mut self, data: &[u8]) {
        let mut i = 0;
        while i < data.len() {
            let code = data[i];
            if code == OPT_END {
                break;
            }
            if code == 0 {
                i += 1;
                continue;
            }
            if i + 1 >= data.len() {
                break;
            }
            let len = data[i + 1] as usize;
            if i + 2 + len > data.len() {
                break;
            }
            let value = &data[i + 2..i + 2 + len];
            match code {
                OPT_MESSAGE_TYPE if !value.is_empty() => {
                    self.message_type = MessageType::try_from(value[0]).ok();
                }
                OPT_SUBNET_MASK if len >= 4 => {
                    self.subnet_mask = Some(Ipv4Addr::new(value[0], value[1], value[2], value[3]));
                }
                OPT_ROUTER if len >= 4 => {
                    self.router = Some(Ipv4Addr::new(value[0], value[1], value[2], value[3]));
                }
                OPT_REQUESTED_IP if len >= 4 => {
                    self.requested_ip =
                        Some(Ipv4Addr::new(value[0], value[1], value[2], value[3]));
                }
                OPT_SERVER_ID if len >= 4 => {
                    self.server_id = Some(Ipv4Addr::new(value[0], value[1], value[2], value[3]));
                }
                OPT_LEASE_TIME if len >= 4 => {
                    self.lease_secs =
                        Some(u32::from_be_bytes([value[0], value[1], value[2], value[3]]));
                }
                _ => {}
            }
            i += 2 + len;
        }
    }

    /// Serializes the packet for the wire.
    #[must_use]
    pub fn encode(&self, message_type: MessageType) -> Vec<u8> {
        let mut data = vec![0u8; 300];
        data[0] = self.op;
        data[1] = 1; // Ethernet
        data[2] = 6;
        data[4..8].copy_from_slice(&self.xid.to_be_bytes());
        data[10..12].copy_from_slice(&self.flags.to_be_bytes());
        data[12..16].copy_from_slice(&self.ciaddr.octets());
        data[16..20].copy_from_slice(&self.yiaddr.octets());
        data[28..44].copy_from_slice(&self.chaddr);
        data[236..240].copy_from_slice(&MAGIC_COOKIE);

        let mut offset = 240;
        data[offset] = OPT_MESSAGE_TYPE;
        data[offset + 1] = 1;
        data[offset + 2] = message_type as u8;
        offset += 3;

        data[offset] = OPT_CLIENT_ID;
        data[offset + 1] = 7;
        data[offset + 2] = 1; // Ethernet
        data[offset + 3..offset + 9].copy_from_slice(&self.chaddr[..6]);
        offset += 9;

        if let Some(ip) = self.requested_ip {
            data[offset] = OPT_REQUESTED_IP;
            data[offset + 1] = 4;
            data[offset + 2..offset + 6].copy_from_slice(&ip.octets());
            offset += 6;
        }
        if let Some(ip) = self.server_id {
            data[offset] = OPT_SERVER_ID;
            data[offset + 1] = 4;
            data[offset + 2..offset + 6].copy_from_slice(&ip.octets());
            offset += 6;
        }
        if matches!(message_type, MessageType::Discover | MessageType::Request) {
            data[offset] = OPT_PARAM_REQUEST;
            data[offset + 1] = 4;
            data[offset + 2..offset + 6].copy_from_slice(&[
                OPT_SUBNET_MASK,
                OPT_ROUTER,
                OPT_LEASE_TIME,
                OPT_SERVER_ID,
            ]);
            offset += 6;
        }
        if let Some(mask) = self.subnet_mask {
            data[offset] = OPT_SUBNET_MASK;
            data[offset + 1] = 4;
            data[offset + 2..offset + 6].copy_from_slice(&mask.octets());
            offset += 6;
        }
        if let Some(router) = self.router {
            data[offset] = OPT_ROUTER;
            data[offset + 1] = 4;
            data[offset + 2..offset + 6].copy_from_slice(&router.octets());
            offset += 6;
        }
        if let Some(secs) = self.lease_secs {
            data[offset] = OPT_LEASE_TIME;
            data[offset + 1] = 4;
            data[offset + 2..offset + 6].copy_from_slice(&secs.to_be_bytes());
            offset += 6;
        }

        data[offset] = OPT_END;
        data.truncate(offset + 1);
        data
    }
}

/// One granted lease. Superseded, never mutated, on renew/rebind.
#[derive(Debug, Clone)]
pub struct DhcpLease {
    /// Leased client address.
    pub client_ip: Ipv4Addr,
    /// Server that granted the lease.
    pub server_ip: Ipv4Addr,
    /// Subnet mask.
    pub subnet_mask: Ipv4Addr,
    /// Default gateway, when offered.
    pub gateway: Option<Ipv4Addr>,
    /// Lease duration in seconds.
    pub lease_secs: u32,
    /// When the lease was granted.
    pub acquired: Instant,
}

impl DhcpLease {
    /// T1, the renewal deadline (half the lease time).
    #[must_use]
    pub fn t1(&self) -> Instant {
        self.acquired + Duration::from_secs(u64::from(self.lease_secs) / 2)
    }

    /// T2, the rebinding deadline (7/8 of the lease time).
    #[must_use]
    pub fn t2(&self) -> Instant {
        self.acquired + Duration::from_secs(u64::from(self.lease_secs) * 7 / 8)
    }
}

/// UDP transport seam for the client.
#[async_trait]
pub trait DhcpTransport: Send + Sync {
    /// Sends to 255.255.255.255:67.
    async fn send_broadcast(&self, payload: &[u8]) -> Result<()>;

    /// Sends to a specific server, port 67.
    async fn send_unicast(&self, server: Ipv4Addr, payload: &[u8]) -> Result<()>;

    /// Receives one datagram.
    async fn recv(&self, buf: &mut [u8]) -> Result<usize>;
}

/// Real transport: a UDP socket bound to 0.0.0.0:68 on one interface.
#[cfg(target_os = "linux")]
pub struct UdpTransport {
    socket: tokio::net::UdpSocket,
}

#[cfg(target_os = "linux")]
impl UdpTransport {
    /// Binds the DHCP client socket to `iface`.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket cannot be created or bound to the
    /// device (binding to a device requires CAP_NET_RAW).
    pub fn new(iface: &str) -> Result<Self> {
        use std::os::unix::io::AsRawFd;

        let socket = std::net::UdpSocket::bind(("0.0.0.0", DHCP_CLIENT_PORT))?;
        socket.set_broadcast(true)?;

        let fd = socket.as_raw_fd();
        let ret = unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_BINDTODEVICE,
                iface.as_ptr().cast(),
                iface.len() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(NetError::Dhcp(format!(
                "failed to bind socket to {iface}: {}",
                std::io::Error::last_os_error()
            )));
        }

        socket.set_nonblocking(true)?;
        Ok(Self {
            socket: tokio::net::UdpSocket::from_std(socket)?,
        })
    }
}

#[cfg(target_os = "linux")]
#[async_trait]
impl DhcpTransport for UdpTransport {
    async fn send_broadcast(&self, payload: &[u8]) -> Result<()> {
        self.socket
            .send_to(payload, (Ipv4Addr::BROADCAST, DHCP_SERVER_PORT))
            .await?;
        Ok(())
    }

    async fn send_unicast(&self, server: Ipv4Addr, payload: &[u8]) -> Result<()> {
        self.socket
            .send_to(payload, (server, DHCP_SERVER_PORT))
            .await?;
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
        let (n, _) = self.socket.recv_from(buf).await?;
        Ok(n)
    }
}

/// DHCPv4 client driving one interface's lease.
pub struct DhcpClient {
    iface: String,
    mac: [u8; 6],
    transport: Arc<dyn DhcpTransport>,
    retry_times: u32,
    retry_interval: Duration,
    running: Arc<AtomicBool>,
    lease_tx: Arc<watch::Sender<Option<DhcpLease>>>,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl DhcpClient {
    /// Creates a client for `iface` with default retry budget.
    #[must_use]
    pub fn new(iface: impl Into<String>, mac: [u8; 6], transport: Arc<dyn DhcpTransport>) -> Self {
        let (lease_tx, _) = watch::channel(None);
        let (stop_tx, _) = watch::channel(false);
        Self {
            iface: iface.into(),
            mac,
            transport,
            retry_times: DEFAULT_RETRY_TIMES,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            running: Arc::new(AtomicBool::new(false)),
            lease_tx: Arc::new(lease_tx),
            stop_tx,
            task: Mutex::new(None),
        }
    }

    /// Overrides the handshake retry budget.
    #[must_use]
    pub fn with_retry(mut self, times: u32, interval: Duration) -> Self {
        self.retry_times = times;
        self.retry_interval = interval;
        self
    }

    /// True while the lease loop is running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Starts the lease loop. A second call while running is a no-op.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let worker = Worker {
            iface: self.iface.clone(),
            mac: self.mac,
            transport: Arc::clone(&self.transport),
            retry_times: self.retry_times,
            retry_interval: self.retry_interval,
            running: Arc::clone(&self.running),
            lease_tx: Arc::clone(&self.lease_tx),
            stop_rx: self.stop_tx.subscribe(),
        };
        let task = tokio::spawn(worker.run());
        *self.task.lock().unwrap() = Some(task);
    }

    /// Requests a release-and-exit. The loop sends a DHCPRELEASE for the
    /// current lease and stops both timers.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Waits for the first lease, bounded by retry_times × retry_interval.
    ///
    /// # Errors
    ///
    /// Returns `Timeout` if no lease is published within the budget.
    pub async fn get_ipv4_addr(&self) -> Result<DhcpLease> {
        let budget = self.retry_interval * self.retry_times;
        let mut rx = self.lease_tx.subscribe();
        let lease = tokio::time::timeout(budget, rx.wait_for(Option::is_some))
            .await
            .map_err(|_| {
                NetError::Timeout(format!("no DHCP lease on {} within {budget:?}", self.iface))
            })?
            .map_err(|_| NetError::Dhcp("lease channel closed".into()))?;
        Ok(lease.clone().unwrap())
    }
}

/// The lease loop state, owned by the spawned task.
struct Worker {
    iface: String,
    mac: [u8; 6],
    transport: Arc<dyn DhcpTransport>,
    retry_times: u32,
    retry_interval: Duration,
    running: Arc<AtomicBool>,
    lease_tx: Arc<watch::Sender<Option<DhcpLease>>>,
    stop_rx: watch::Receiver<bool>,
}

impl Worker {
    async fn run(self) {
        let mut stop_rx = self.stop_rx.clone();
        'init: loop {
            // INIT: bounded discover/offer/request/ack handshake.
            let mut lease = match self.acquire().await {
                Ok(lease) => lease,
                Err(e) => {
                    tracing::warn!("DHCP handshake on {} failed: {e}", self.iface);
                    break;
                }
            };
            tracing::info!(
                "DHCP bound on {}: {} from {}",
                self.iface,
                lease.client_ip,
                lease.server_ip
            );
            self.lease_tx.send_replace(Some(lease.clone()));

            // BOUND: wait for T1/T2/stop.
            let mut renew_exhausted = false;
            loop {
                let t1 = lease.t1();
                let t2 = lease.t2();
                tokio::select! {
                    Ok(()) = stop_rx.changed() => {
                        self.release(&lease).await;
                        self.running.store(false, Ordering::SeqCst);
                        return;
                    }
                    () = tokio::time::sleep_until(t1), if !renew_exhausted => {
                        // RENEWING: unicast against the granting server.
                        match self.renew(&lease, false).await {
                            Ok(renewed) => {
                                tracing::info!("DHCP renewed on {}", self.iface);
                                lease = renewed;
                                self.lease_tx.send_replace(Some(lease.clone()));
                            }
                            Err(e) => {
                                tracing::warn!("DHCP renew on {} failed: {e}", self.iface);
                                // Leave T2 armed; rebind gets its chance.
                                renew_exhausted = true;
                            }
                        }
                    }
                    () = tokio::time::sleep_until(t2) => {
                        // REBINDING: broadcast to any server.
                        match self.renew(&lease, true).await {
                            Ok(renewed) => {
                                tracing::info!("DHCP rebound on {}", self.iface);
                                lease = renewed;
                                self.lease_tx.send_replace(Some(lease.clone()));
                                renew_exhausted = false;
                            }
                            Err(e) => {
                                tracing::warn!(
                                    "DHCP rebind on {} failed, restarting: {e}",
                                    self.iface
                                );
                                continue 'init;
                            }
                        }
                    }
                }
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }

    /// The INIT handshake, retried up to the budget with one retry
    /// interval between attempts.
    async fn acquire(&self) -> Result<DhcpLease> {
        let mut last = NetError::Timeout(format!("no DHCP response on {}", self.iface));
        for attempt in 0..self.retry_times {
            let started = Instant::now();
            match self.handshake().await {
                Ok(lease) => return Ok(lease),
                Err(e) => {
                    tracing::debug!(
                        "DHCP attempt {}/{} on {} failed: {e}",
                        attempt + 1,
                        self.retry_times,
                        self.iface
                    );
                    last = e;
                }
            }
            // A NAK or transport error fails faster than the reply
            // timeout; pace the next attempt to the retry interval.
            if attempt + 1 < self.retry_times {
                let elapsed = started.elapsed();
                if elapsed < self.retry_interval {
                    tokio::time::sleep(self.retry_interval - elapsed).await;
                }
            }
        }
        Err(last)
    }

    async fn handshake(&self) -> Result<DhcpLease> {
        let xid = rand::thread_rng().gen();

        let discover = DhcpPacket::request_for(self.mac, xid);
        self.transport
            .send_broadcast(&discover.encode(MessageType::Discover))
            .await?;
        let offer = self.wait_reply(xid, MessageType::Offer).await?;
        let server = offer
            .server_id
            .ok_or_else(|| NetError::Dhcp("offer without server id".into()))?;

        let mut request = DhcpPacket::request_for(self.mac, xid);
        request.requested_ip = Some(offer.yiaddr);
        request.server_id = Some(server);
        self.transport
            .send_broadcast(&request.encode(MessageType::Request))
            .await?;
        let ack = self.wait_reply(xid, MessageType::Ack).await?;

        self.lease_from_ack(&ack, server)
    }

    /// Renew (unicast) or rebind (broadcast) the current lease.
    async fn renew(&self, lease: &DhcpLease, broadcast: bool) -> Result<DhcpLease> {
        let xid = rand::thread_rng().gen();
        let mut request = DhcpPacket::request_for(self.mac, xid);
        request.flags = 0;
        request.ciaddr = lease.client_ip;
        let payload = request.encode(MessageType::Request);
        if broadcast {
            self.transport.send_broadcast(&payload).await?;
        } else {
            self.transport.send_unicast(lease.server_ip, &payload).await?;
        }
        let ack = self.wait_reply(xid, MessageType::Ack).await?;
        let server = ack.server_id.unwrap_or(lease.server_ip);
        self.lease_from_ack(&ack, server)
    }

    async fn release(&self, lease: &DhcpLease) {
        let mut packet = DhcpPacket::request_for(self.mac, rand::thread_rng().gen());
        packet.flags = 0;
        packet.ciaddr = lease.client_ip;
        packet.server_id = Some(lease.server_ip);
        if let Err(e) = self
            .transport
            .send_unicast(lease.server_ip, &packet.encode(MessageType::Release))
            .await
        {
            tracing::warn!("DHCP release on {} failed: {e}", self.iface);
        } else {
            tracing::info!("DHCP released {} on {}", lease.client_ip, self.iface);
        }
        self.lease_tx.send_replace(None);
    }

    /// Waits for a matching reply, bounded by one retry interval.
    async fn wait_reply(&self, xid: u32, want: MessageType) -> Result<DhcpPacket> {
        let wait = async {
            let mut buf = [0u8; 1500];
            loop {
                let n = self.transport.recv(&mut buf).await?;
                let Ok(packet) = DhcpPacket::parse(&buf[..n]) else {
                    continue;
                };
                if packet.op != BOOTREPLY || packet.xid != xid {
                    continue;
                }
                match packet.message_type {
                    Some(t) if t == want => return Ok(packet),
                    Some(MessageType::Nak) => {
                        return Err(NetError::Dhcp(format!(
                            "server NAK on {}",
                            self.iface
                        )));
                    }
                    _ => continue,
                }
            }
        };
        tokio::time::timeout(self.retry_interval, wait)
            .await
            .map_err(|_| {
                NetError::Timeout(format!("waiting for {want:?} on {}", self.iface))
            })?
    }

    fn lease_from_ack(&self, ack: &DhcpPacket, server: Ipv4Addr) -> Result<DhcpLease> {
        let subnet_mask = ack
            .subnet_mask
            .ok_or_else(|| NetError::Dhcp("ack without subnet mask".into()))?;
        let lease_secs = ack
            .lease_secs
            .ok_or_else(|| NetError::Dhcp("ack without lease time".into()))?;
        Ok(DhcpLease {
            client_ip: ack.yiaddr,
            server_ip: server,
            subnet_mask,
            gateway: ack.router,
            lease_secs,
            acquired: Instant::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use tokio::sync::Notify;

    const SERVER: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);
    const OFFERED: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 50);

    /// Scripted server: answers discover with an offer and request with an
    /// ack, or stays silent. Records everything the client sends. The drop
    /// flags selectively ignore traffic so renew/rebind failures can be
    /// staged.
    struct FakeServer {
        silent: bool,
        drop_unicast: bool,
        drop_renewals: bool,
        nak_requests: bool,
        lease_secs: u32,
        replies: Mutex<VecDeque<Vec<u8>>>,
        notify: Notify,
        sent: Mutex<Vec<(bool, DhcpPacket)>>,
    }

    impl FakeServer {
        fn new(silent: bool, lease_secs: u32) -> Self {
            Self {
                silent,
                drop_unicast: false,
                drop_renewals: false,
                nak_requests: false,
                lease_secs,
                replies: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                sent: Mutex::new(Vec::new()),
            }
        }

        /// Ignores unicast traffic, forcing renewals to fail over to
        /// broadcast rebind.
        fn dropping_unicast(mut self) -> Self {
            self.drop_unicast = true;
            self
        }

        /// Ignores any request carrying a bound address, failing both
        /// renew and rebind while still answering fresh handshakes.
        fn dropping_renewals(mut self) -> Self {
            self.drop_renewals = true;
            self
        }

        /// Refuses every request with a NAK.
        fn nacking_requests(mut self) -> Self {
            self.nak_requests = true;
            self
        }

        fn reply_to(&self, payload: &[u8], broadcast: bool) {
            let packet = DhcpPacket::parse(payload).unwrap();
            self.sent.lock().unwrap().push((broadcast, packet.clone()));
            if self.silent {
                return;
            }
            if self.drop_unicast && !broadcast {
                return;
            }
            if self.drop_renewals && !packet.ciaddr.is_unspecified() {
                return;
            }
            let reply_type = match packet.message_type {
                Some(MessageType::Discover) => MessageType::Offer,
                Some(MessageType::Request) if self.nak_requests => MessageType::Nak,
                Some(MessageType::Request) => MessageType::Ack,
                _ => return,
            };
            let mut reply = packet;
            reply.op = BOOTREPLY;
            reply.yiaddr = if reply.ciaddr.is_unspecified() {
                OFFERED
            } else {
                reply.ciaddr
            };
            reply.server_id = Some(SERVER);
            reply.subnet_mask = Some(Ipv4Addr::new(255, 255, 255, 0));
            reply.router = Some(SERVER);
            reply.lease_secs = Some(self.lease_secs);
            self.replies
                .lock()
                .unwrap()
                .push_back(reply.encode(reply_type));
            self.notify.notify_one();
        }
    }

    #[async_trait]
    impl DhcpTransport for FakeServer {
        async fn send_broadcast(&self, payload: &[u8]) -> Result<()> {
            self.reply_to(payload, true);
            Ok(())
        }

        async fn send_unicast(&self, _server: Ipv4Addr, payload: &[u8]) -> Result<()> {
            self.reply_to(payload, false);
            Ok(())
        }

        async fn recv(&self, buf: &mut [u8]) -> Result<usize> {
            loop {
                if let Some(reply) = self.replies.lock().unwrap().pop_front() {
                    buf[..reply.len()].copy_from_slice(&reply);
                    return Ok(reply.len());
                }
                self.notify.notified().await;
            }
        }
    }

    const MAC: [u8; 6] = [0x52, 0x54, 0, 0, 0, 9];

    #[test]
    fn test_packet_round_trip() {
        let mut packet = DhcpPacket::request_for(MAC, 0xdead_beef);
        packet.requested_ip = Some(OFFERED);
        packet.server_id = Some(SERVER);
        let wire = packet.encode(MessageType::Request);

        let parsed = DhcpPacket::parse(&wire).unwrap();
        assert_eq!(parsed.op, BOOTREQUEST);
        assert_eq!(parsed.xid, 0xdead_beef);
        assert_eq!(parsed.message_type, Some(MessageType::Request));
        assert_eq!(parsed.requested_ip, Some(OFFERED));
        assert_eq!(parsed.server_id, Some(SERVER));
        assert_eq!(&parsed.chaddr[..6], &MAC);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(DhcpPacket::parse(&[0u8; 10]).is_err());
        let mut no_cookie = vec![0u8; 300];
        no_cookie[0] = BOOTREPLY;
        assert!(DhcpPacket::parse(&no_cookie).is_err());
    }

    #[tokio::test]
    async fn test_handshake_binds() {
        let server = Arc::new(FakeServer::new(false, 3600));
        let client = DhcpClient::new("eth0", MAC, server.clone())
            .with_retry(3, Duration::from_millis(200));
        client.start();

        let lease = client.get_ipv4_addr().await.unwrap();
        assert_eq!(lease.client_ip, OFFERED);
        assert_eq!(lease.server_ip, SERVER);
        assert_eq!(lease.subnet_mask, Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(lease.gateway, Some(SERVER));
        assert!(client.is_running());
        client.stop();
    }

    #[tokio::test]
    async fn test_stop_sends_release() {
        let server = Arc::new(FakeServer::new(false, 3600));
        let client = DhcpClient::new("eth0", MAC, server.clone())
            .with_retry(3, Duration::from_millis(200));
        client.start();
        client.get_ipv4_addr().await.unwrap();

        client.stop();
        for _ in 0..100 {
            if !client.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!client.is_running());

        let sent = server.sent.lock().unwrap();
        let release = sent
            .iter()
            .find(|(_, p)| p.message_type == Some(MessageType::Release))
            .expect("no release sent");
        // Releases go unicast to the granting server.
        assert!(!release.0);
        assert_eq!(release.1.ciaddr, OFFERED);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_at_t1() {
        let server = Arc::new(FakeServer::new(false, 8));
        let client = DhcpClient::new("eth0", MAC, server.clone())
            .with_retry(3, Duration::from_millis(200));
        client.start();
        let first = client.get_ipv4_addr().await.unwrap();

        // Past T1 (4s) the client renews by unicast and stays bound.
        tokio::time::sleep(Duration::from_secs(5)).await;
        let renewals: Vec<_> = server
            .sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(broadcast, p)| {
                !broadcast && p.message_type == Some(MessageType::Request)
            })
            .map(|(_, p)| p.ciaddr)
            .collect();
        assert!(!renewals.is_empty());
        assert_eq!(renewals[0], first.client_ip);
        assert!(client.is_running());
        client.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_rebind_after_failed_renew() {
        let server = Arc::new(FakeServer::new(false, 8).dropping_unicast());
        let client = DhcpClient::new("eth0", MAC, server.clone())
            .with_retry(3, Duration::from_millis(200));
        client.start();
        let first = client.get_ipv4_addr().await.unwrap();

        // The T1 (4s) unicast renew goes unanswered; the T2 (7s)
        // broadcast rebind succeeds and rebases the timers, so the client
        // is still bound past the original 8s expiry.
        tokio::time::sleep(Duration::from_secs(10)).await;

        let sent = server.sent.lock().unwrap();
        let rebind = sent
            .iter()
            .find(|(broadcast, p)| {
                *broadcast
                    && p.message_type == Some(MessageType::Request)
                    && !p.ciaddr.is_unspecified()
            })
            .expect("no broadcast rebind sent");
        assert_eq!(rebind.1.ciaddr, first.client_ip);
        // Rebind succeeded, so the client never fell back to INIT.
        let discovers = sent
            .iter()
            .filter(|(_, p)| p.message_type == Some(MessageType::Discover))
            .count();
        assert_eq!(discovers, 1);
        drop(sent);

        assert!(client.is_running());
        client.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_rebind_restarts_from_init() {
        let server = Arc::new(FakeServer::new(false, 8).dropping_renewals());
        let client = DhcpClient::new("eth0", MAC, server.clone())
            .with_retry(3, Duration::from_millis(200));
        client.start();
        client.get_ipv4_addr().await.unwrap();

        // Renew fails at T1 (4s), rebind fails at T2 (7s), and the client
        // falls back to a fresh INIT handshake, which the server answers.
        tokio::time::sleep(Duration::from_secs(12)).await;

        let discovers = server
            .sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, p)| p.message_type == Some(MessageType::Discover))
            .count();
        assert!(discovers >= 2, "expected a second discover, saw {discovers}");
        assert!(client.is_running());
        client.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_nak_retries_are_paced() {
        let server = Arc::new(FakeServer::new(false, 3600).nacking_requests());
        let client = DhcpClient::new("eth0", MAC, server.clone())
            .with_retry(3, Duration::from_millis(500));
        client.start();

        let discovers = |server: &FakeServer| {
            server
                .sent
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, p)| p.message_type == Some(MessageType::Discover))
                .count()
        };

        // The NAK fails the handshake immediately, but the next attempt
        // still waits out the retry interval.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(discovers(&server), 1);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(discovers(&server), 2);
        client.stop();
    }

    #[tokio::test]
    async fn test_timeout_exhausts_budget() {
        let server = Arc::new(FakeServer::new(true, 3600));
        let client = DhcpClient::new("eth0", MAC, server)
            .with_retry(2, Duration::from_millis(50));
        client.start();

        let err = client.get_ipv4_addr().await.unwrap_err();
        assert!(matches!(err, NetError::Timeout(_)));

        // The loop exits once the retry budget is exhausted.
        for _ in 0..100 {
            if !client.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!client.is_running());
    }
}

//! RADIUS client: request retransmission, server failover and reply
//! dispatch.
//!
//! The client does no I/O scheduling of its own. The owner feeds it received
//! datagrams through [`RadiusClient::receive`] and calls
//! [`RadiusClient::handle_timeout`] whenever [`RadiusClient::next_timeout`]
//! has passed.

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use portauth_core::{Config, RadiusServerConfig};
use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

use crate::radius::{RadiusCode, RadiusMsg, Result};

const RADIUS_CLIENT_FIRST_WAIT: Duration = Duration::from_secs(1);
const RADIUS_CLIENT_MAX_WAIT: Duration = Duration::from_secs(120);
/// Transmissions of one request before it is dropped.
const RADIUS_CLIENT_MAX_RETRIES: u32 = 10;
const RADIUS_CLIENT_MAX_ENTRIES: usize = 30;
/// Transmissions after which the server is considered down.
const RADIUS_CLIENT_NUM_FAILOVER: u32 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadiusMsgType {
    Auth,
}

/// What a receive handler did with a reply.
#[derive(Debug)]
pub enum RxOutcome {
    /// Handled; the client drops the reply.
    Processed,
    /// Handled; the handler kept what it needed from the reply.
    Queued,
    /// Not for this handler; try the next one.
    Unknown(RadiusMsg),
}

/// Receive handler: `(context, reply, original request, shared secret)`.
pub type RxHandler<C> = fn(&mut C, RadiusMsg, &RadiusMsg, &[u8]) -> RxOutcome;

/// Access to the client owned by a handler context.
pub trait RadiusContext: Sized {
    fn radius_client(&mut self) -> &mut RadiusClient<Self>;
}

/// Datagram sender for one server group.
pub trait RadiusTransport: Send {
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize>;
}

impl RadiusTransport for Arc<UdpSocket> {
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        self.try_send_to(buf, addr)
    }
}

/// Per-server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RadiusServerCounters {
    pub requests: u32,
    pub retransmissions: u32,
    pub timeouts: u32,
    pub responses: u32,
    pub access_accepts: u32,
    pub access_rejects: u32,
    pub access_challenges: u32,
    pub malformed_responses: u32,
    pub unknown_types: u32,
    pub packets_dropped: u32,
}

struct PendingEntry {
    seq: u64,
    msg: RadiusMsg,
    msg_type: RadiusMsgType,
    secret: Vec<u8>,
    first_try: Instant,
    next_try: Instant,
    attempts: u32,
    next_wait: Duration,
    bss: usize,
    group: usize,
}

/// Ordered server list shared by one or more BSSes, with its socket.
struct ServerGroup {
    servers: Vec<RadiusServerConfig>,
    current: usize,
    counters: Vec<RadiusServerCounters>,
    socket: Option<Box<dyn RadiusTransport>>,
    failback_at: Option<Instant>,
}

impl ServerGroup {
    fn new(servers: Vec<RadiusServerConfig>) -> Self {
        Self {
            counters: vec![RadiusServerCounters::default(); servers.len()],
            servers,
            current: 0,
            socket: None,
            failback_at: None,
        }
    }

    fn current_server(&self) -> Option<&RadiusServerConfig> {
        self.servers.get(self.current)
    }
}

pub struct RadiusClient<C> {
    groups: Vec<ServerGroup>,
    bss_group: Vec<usize>,
    pending: VecDeque<PendingEntry>,
    handlers: Vec<(RadiusMsgType, RxHandler<C>)>,
    next_radius_identifier: u8,
    next_seq: u64,
    retry_primary_interval: Duration,
}

/// Server lists derived from configuration: group 0 holds the global
/// servers, every BSS with its own list gets a further group.
pub fn server_groups(config: &Config) -> (Vec<Vec<RadiusServerConfig>>, Vec<usize>) {
    let mut groups = vec![config.auth_servers.clone()];
    let mut bss_group = Vec::with_capacity(config.bss.len());
    for bss in &config.bss {
        if bss.auth_servers.is_empty() {
            bss_group.push(0);
        } else {
            groups.push(bss.auth_servers.clone());
            bss_group.push(groups.len() - 1);
        }
    }
    (groups, bss_group)
}

impl<C: RadiusContext> RadiusClient<C> {
    pub fn new(
        groups: Vec<Vec<RadiusServerConfig>>,
        bss_group: Vec<usize>,
        retry_primary_interval: u32,
    ) -> Self {
        Self {
            groups: groups.into_iter().map(ServerGroup::new).collect(),
            bss_group,
            pending: VecDeque::new(),
            handlers: Vec::new(),
            next_radius_identifier: 0,
            next_seq: 0,
            retry_primary_interval: Duration::from_secs(retry_primary_interval as u64),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        let (groups, bss_group) = server_groups(config);
        Self::new(groups, bss_group, config.radius_retry_primary_interval)
    }

    /// Binds one UDP socket per server group that has servers. A bind
    /// failure only disables that group. Returns the bound sockets so the
    /// caller can read replies from them.
    pub async fn init(&mut self) -> Vec<(usize, Arc<UdpSocket>)> {
        let groups: Vec<usize> = (0..self.groups.len()).collect();
        self.bind_groups(&groups).await
    }

    async fn bind_groups(&mut self, groups: &[usize]) -> Vec<(usize, Arc<UdpSocket>)> {
        let mut sockets = Vec::new();
        for &index in groups {
            let Some(group) = self.groups.get_mut(index) else {
                continue;
            };
            if group.servers.is_empty() {
                continue;
            }
            match UdpSocket::bind("0.0.0.0:0").await {
                Ok(socket) => {
                    let socket = Arc::new(socket);
                    if let Ok(local) = socket.local_addr() {
                        info!("RADIUS client for server group {} bound to {}", index, local);
                    }
                    group.socket = Some(Box::new(socket.clone()));
                    sockets.push((index, socket));
                }
                Err(e) => {
                    error!("Failed to bind RADIUS socket for server group {}: {}", index, e);
                }
            }
        }
        sockets
    }

    /// Installs the transport used for a server group.
    pub fn attach_transport(&mut self, group: usize, transport: Box<dyn RadiusTransport>) {
        if let Some(g) = self.groups.get_mut(group) {
            g.socket = Some(transport);
        }
    }

    pub fn register(&mut self, msg_type: RadiusMsgType, handler: RxHandler<C>) {
        self.handlers.push((msg_type, handler));
    }

    pub fn group_for_bss(&self, bss: usize) -> usize {
        self.bss_group.get(bss).copied().unwrap_or(0)
    }

    pub fn current_server(&self, group: usize) -> Option<&RadiusServerConfig> {
        self.groups.get(group).and_then(|g| g.current_server())
    }

    /// `(server, counters)` for every server of a group.
    pub fn server_counters(&self, group: usize) -> Vec<(&RadiusServerConfig, &RadiusServerCounters)> {
        self.groups
            .get(group)
            .map(|g| g.servers.iter().zip(g.counters.iter()).collect())
            .unwrap_or_default()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Next RADIUS identifier. Queued requests that already use it are
    /// dropped so a late reply cannot be matched to the new request.
    pub fn get_id(&mut self) -> u8 {
        let id = self.next_radius_identifier;
        self.next_radius_identifier = self.next_radius_identifier.wrapping_add(1);

        let before = self.pending.len();
        self.pending.retain(|e| e.msg.identifier() != id);
        if self.pending.len() != before {
            debug!("Removed {} pending RADIUS request(s) reusing identifier {}", before - self.pending.len(), id);
        }
        id
    }

    fn transmit(&mut self, group: usize, buf: &[u8]) {
        let Some(g) = self.groups.get_mut(group) else {
            return;
        };
        let Some(server) = g.servers.get(g.current) else {
            warn!("No RADIUS server configured for server group {}", group);
            return;
        };
        let addr = SocketAddr::from((server.addr, server.port));
        match &g.socket {
            Some(socket) => {
                if let Err(e) = socket.send_to(buf, addr) {
                    warn!("Failed to send RADIUS message to {}: {}", addr, e);
                }
            }
            None => warn!("No RADIUS socket for server group {}", group),
        }
    }

    /// Finalizes `msg` for the BSS's current server, transmits it and queues
    /// it for retransmission.
    pub fn send(&mut self, mut msg: RadiusMsg, msg_type: RadiusMsgType, bss: usize, now: Instant) -> Result<()> {
        let group = self.group_for_bss(bss);
        let secret = match self.current_server(group) {
            Some(server) => server.shared_secret.as_bytes().to_vec(),
            None => {
                warn!("No RADIUS server for BSS {}; dropping request", bss);
                return Ok(());
            }
        };

        if msg.radius_code() == Some(RadiusCode::AccessRequest) {
            msg.make_authenticator()?;
        }
        msg.finish(Some(&secret))?;
        debug!("Sending RADIUS message to server group {}:\n{}", group, msg);

        self.transmit(group, msg.as_bytes());
        if let Some(g) = self.groups.get_mut(group) {
            let current = g.current;
            g.counters[current].requests += 1;
        }

        if self.pending.len() >= RADIUS_CLIENT_MAX_ENTRIES {
            if let Some(oldest) = self.pending.pop_front() {
                info!(
                    "Too many pending RADIUS requests, removing oldest (id {})",
                    oldest.msg.identifier()
                );
            }
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.push_back(PendingEntry {
            seq,
            msg,
            msg_type,
            secret,
            first_try: now,
            next_try: now + RADIUS_CLIENT_FIRST_WAIT,
            attempts: 1,
            next_wait: RADIUS_CLIENT_FIRST_WAIT * 2,
            bss,
            group,
        });
        Ok(())
    }

    /// Drops every pending request.
    pub fn flush(&mut self) {
        if !self.pending.is_empty() {
            info!("Flushing {} pending RADIUS request(s)", self.pending.len());
        }
        self.pending.clear();
    }

    fn flush_group(&mut self, group: usize) {
        self.pending.retain(|e| e.group != group);
    }

    /// Earliest instant at which `handle_timeout` has work to do.
    pub fn next_timeout(&self) -> Option<Instant> {
        let retransmit = self.pending.iter().map(|e| e.next_try).min();
        let failback = self.groups.iter().filter_map(|g| g.failback_at).min();
        match (retransmit, failback) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Retransmits due requests, drops expired ones and performs server
    /// failover and failback.
    pub fn handle_timeout(&mut self, now: Instant) {
        let mut failover = Vec::new();
        let mut i = 0;
        while i < self.pending.len() {
            let entry = &mut self.pending[i];
            if now < entry.next_try {
                i += 1;
                continue;
            }
            let group = entry.group;
            if entry.attempts >= RADIUS_CLIENT_MAX_RETRIES {
                info!(
                    "Removing un-ACKed RADIUS message (id {}, bss {}) after {} attempts",
                    entry.msg.identifier(),
                    entry.bss,
                    entry.attempts
                );
                if let Some(g) = self.groups.get_mut(group) {
                    let current = g.current;
                    if let Some(c) = g.counters.get_mut(current) {
                        c.timeouts += 1;
                    }
                }
                self.pending.remove(i);
                continue;
            }

            entry.attempts += 1;
            entry.next_try = now + entry.next_wait;
            entry.next_wait = (entry.next_wait * 2).min(RADIUS_CLIENT_MAX_WAIT);
            let attempts = entry.attempts;
            let buf = entry.msg.as_bytes().to_vec();
            debug!(
                "Resending RADIUS message (id {}, attempt {})",
                entry.msg.identifier(),
                attempts
            );

            self.transmit(group, &buf);
            if let Some(g) = self.groups.get_mut(group) {
                let current = g.current;
                if let Some(c) = g.counters.get_mut(current) {
                    c.retransmissions += 1;
                }
            }
            if attempts > RADIUS_CLIENT_NUM_FAILOVER && !failover.contains(&group) {
                failover.push(group);
            }
            i += 1;
        }

        for group in failover {
            let Some(g) = self.groups.get(group) else {
                continue;
            };
            if g.servers.len() > 1 {
                let next = (g.current + 1) % g.servers.len();
                self.change_server(group, next, now);
            }
        }

        for group in 0..self.groups.len() {
            let due = matches!(self.groups[group].failback_at, Some(at) if at <= now);
            if due {
                self.groups[group].failback_at = None;
                if self.groups[group].current != 0 {
                    info!("Trying to return to the primary RADIUS server of group {}", group);
                    self.change_server(group, 0, now);
                }
            }
        }
    }

    fn change_server(&mut self, group: usize, index: usize, now: Instant) {
        let Some(g) = self.groups.get_mut(group) else {
            return;
        };
        let (Some(old), Some(new)) = (g.servers.get(g.current), g.servers.get(index)) else {
            return;
        };
        info!(
            "Changing RADIUS authentication server from {}:{} to {}:{}",
            old.addr, old.port, new.addr, new.port
        );
        let same_secret = old.shared_secret == new.shared_secret;
        g.current = index;
        g.failback_at = if index != 0 && !self.retry_primary_interval.is_zero() {
            Some(now + self.retry_primary_interval)
        } else {
            None
        };

        if same_secret {
            for entry in self.pending.iter_mut().filter(|e| e.group == group) {
                entry.attempts = 0;
                entry.next_try = entry.first_try + RADIUS_CLIENT_FIRST_WAIT;
                entry.next_wait = RADIUS_CLIENT_FIRST_WAIT * 2;
            }
        } else {
            // Messages signed with the old secret cannot be resent.
            self.flush_group(group);
        }
    }

    /// Applies new server lists. Groups whose servers did not change keep
    /// their state; for a changed group pending requests survive only when
    /// the new primary shares the old current server's secret. Newly created
    /// groups get sockets bound here.
    pub async fn reconfigure(&mut self, config: &Config) -> Vec<(usize, Arc<UdpSocket>)> {
        let (groups, bss_group) = server_groups(config);
        self.bss_group = bss_group;
        self.retry_primary_interval = Duration::from_secs(config.radius_retry_primary_interval as u64);

        let mut unbound = Vec::new();
        for (index, servers) in groups.into_iter().enumerate() {
            match self.groups.get_mut(index) {
                Some(g) if g.servers == servers => {}
                Some(g) => {
                    let old_secret = g.current_server().map(|s| s.shared_secret.clone());
                    let new_secret = servers.first().map(|s| s.shared_secret.clone());
                    info!("RADIUS servers of group {} changed", index);
                    g.counters = vec![RadiusServerCounters::default(); servers.len()];
                    g.servers = servers;
                    g.current = 0;
                    g.failback_at = None;
                    if g.socket.is_none() {
                        unbound.push(index);
                    }
                    if old_secret != new_secret {
                        self.flush_group(index);
                    }
                }
                None => {
                    self.groups.push(ServerGroup::new(servers));
                    unbound.push(index);
                }
            }
        }
        let count = self.groups.len();
        if self.bss_group.iter().any(|&g| g >= count) {
            error!("BSS refers to an unknown RADIUS server group");
        }
        self.bind_groups(&unbound).await
    }

    /// Handles one datagram received on a server group's socket. Datagrams
    /// whose source is not the group's current server are dropped.
    pub fn receive(ctx: &mut C, group: usize, src: SocketAddr, data: &[u8]) {
        let client = ctx.radius_client();
        let expected = client
            .current_server(group)
            .map(|s| SocketAddr::from((s.addr, s.port)));
        if expected != Some(src) {
            warn!("Dropping RADIUS datagram from unexpected source {}", src);
            client.count(group, |c| c.packets_dropped += 1);
            return;
        }
        let reply = match RadiusMsg::parse(data) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Parsing incoming RADIUS frame failed: {}", e);
                client.count(group, |c| c.malformed_responses += 1);
                return;
            }
        };

        let msg_type = match reply.radius_code() {
            Some(RadiusCode::AccessAccept) => {
                client.count(group, |c| c.access_accepts += 1);
                RadiusMsgType::Auth
            }
            Some(RadiusCode::AccessReject) => {
                client.count(group, |c| c.access_rejects += 1);
                RadiusMsgType::Auth
            }
            Some(RadiusCode::AccessChallenge) => {
                client.count(group, |c| c.access_challenges += 1);
                RadiusMsgType::Auth
            }
            _ => {
                warn!("Unexpected RADIUS message code {}", reply.code());
                client.count(group, |c| c.unknown_types += 1);
                return;
            }
        };
        client.count(group, |c| c.responses += 1);
        debug!("Received RADIUS message:\n{}", reply);

        let Some(entry) = client
            .pending
            .iter()
            .find(|e| e.group == group && e.msg_type == msg_type && e.msg.identifier() == reply.identifier())
        else {
            debug!("No matching RADIUS request found (id {}), dropping", reply.identifier());
            client.count(group, |c| c.packets_dropped += 1);
            return;
        };
        let seq = entry.seq;
        let request = entry.msg.clone();
        let secret = entry.secret.clone();
        let handlers: Vec<RxHandler<C>> = client
            .handlers
            .iter()
            .filter(|(t, _)| *t == msg_type)
            .map(|(_, h)| *h)
            .collect();

        let mut reply = reply;
        for handler in handlers {
            match handler(ctx, reply, &request, &secret) {
                RxOutcome::Processed | RxOutcome::Queued => {
                    ctx.radius_client().pending.retain(|e| e.seq != seq);
                    return;
                }
                RxOutcome::Unknown(msg) => reply = msg,
            }
        }
        debug!(
            "No RADIUS RX handler accepted message (id {}), dropping",
            reply.identifier()
        );
        ctx.radius_client().count(group, |c| c.packets_dropped += 1);
    }

    fn count(&mut self, group: usize, f: impl FnOnce(&mut RadiusServerCounters)) {
        if let Some(g) = self.groups.get_mut(group) {
            let current = g.current;
            if let Some(c) = g.counters.get_mut(current) {
                f(c);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::radius::RadiusAttributeType;
    use std::net::Ipv4Addr;
    use std::sync::Mutex;

    type Sent = Arc<Mutex<Vec<(SocketAddr, Vec<u8>)>>>;

    struct MockTransport(Sent);

    impl RadiusTransport for MockTransport {
        fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
            self.0.lock().unwrap().push((addr, buf.to_vec()));
            Ok(buf.len())
        }
    }

    #[derive(Default)]
    struct Ctx {
        client: Option<RadiusClient<Ctx>>,
        seen: Vec<(&'static str, u8)>,
    }

    impl RadiusContext for Ctx {
        fn radius_client(&mut self) -> &mut RadiusClient<Self> {
            self.client.as_mut().unwrap()
        }
    }

    fn server(last: u8, secret: &str) -> RadiusServerConfig {
        RadiusServerConfig {
            addr: Ipv4Addr::new(10, 0, 0, last),
            port: 1812,
            shared_secret: secret.to_string(),
        }
    }

    fn from_server(last: u8) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::new(10, 0, 0, last), 1812))
    }

    fn setup(servers: Vec<RadiusServerConfig>, retry_primary: u32) -> (Ctx, Sent) {
        let sent: Sent = Arc::new(Mutex::new(Vec::new()));
        let mut client = RadiusClient::new(vec![servers], vec![0], retry_primary);
        client.attach_transport(0, Box::new(MockTransport(sent.clone())));
        (Ctx { client: Some(client), seen: Vec::new() }, sent)
    }

    fn request(client: &mut RadiusClient<Ctx>) -> RadiusMsg {
        let id = client.get_id();
        let mut msg = RadiusMsg::new(RadiusCode::AccessRequest, id);
        msg.add_attr(RadiusAttributeType::UserName, b"alice").unwrap();
        msg
    }

    fn sent_request(sent: &Sent, index: usize) -> RadiusMsg {
        RadiusMsg::parse(&sent.lock().unwrap()[index].1).unwrap()
    }

    fn accept_for(req: &RadiusMsg, secret: &[u8]) -> Vec<u8> {
        let mut reply = RadiusMsg::new(RadiusCode::AccessAccept, req.identifier());
        reply.finish_response(secret, &req.authenticator()).unwrap();
        reply.as_bytes().to_vec()
    }

    fn verifying_handler(ctx: &mut Ctx, msg: RadiusMsg, req: &RadiusMsg, secret: &[u8]) -> RxOutcome {
        if msg.verify(secret, req).is_err() {
            return RxOutcome::Unknown(msg);
        }
        ctx.seen.push(("verify", msg.identifier()));
        RxOutcome::Processed
    }

    fn declining_handler(ctx: &mut Ctx, msg: RadiusMsg, _req: &RadiusMsg, _secret: &[u8]) -> RxOutcome {
        ctx.seen.push(("decline", msg.identifier()));
        RxOutcome::Unknown(msg)
    }

    #[test]
    fn test_get_id_purges_reused_identifier() {
        let (mut ctx, _sent) = setup(vec![server(1, "s")], 0);
        let now = Instant::now();
        let client = ctx.radius_client();
        let first = request(client);
        assert_eq!(first.identifier(), 0);
        client.send(first, RadiusMsgType::Auth, 0, now).unwrap();
        for _ in 1..256 {
            client.get_id();
        }
        assert_eq!(client.pending_len(), 1);
        // Identifier 0 comes around again.
        assert_eq!(client.get_id(), 0);
        assert_eq!(client.pending_len(), 0);
    }

    #[test]
    fn test_backoff_and_removal_after_ten_attempts() {
        let (mut ctx, sent) = setup(vec![server(1, "s")], 0);
        let start = Instant::now();
        let client = ctx.radius_client();
        let msg = request(client);
        client.send(msg, RadiusMsgType::Auth, 0, start).unwrap();

        let mut now = start;
        let mut waits = Vec::new();
        while let Some(next) = client.next_timeout() {
            waits.push(next - now);
            now = next;
            client.handle_timeout(now);
        }
        assert_eq!(sent.lock().unwrap().len(), 10);
        assert_eq!(client.pending_len(), 0);
        assert!(waits.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(waits[0], Duration::from_secs(1));
        assert_eq!(*waits.last().unwrap(), Duration::from_secs(120));
        let counters = client.server_counters(0);
        assert_eq!(counters[0].1.retransmissions, 9);
        assert_eq!(counters[0].1.timeouts, 1);
    }

    #[test]
    fn test_queue_evicts_oldest() {
        let (mut ctx, _sent) = setup(vec![server(1, "s")], 0);
        let now = Instant::now();
        let client = ctx.radius_client();
        for _ in 0..31 {
            let msg = request(client);
            client.send(msg, RadiusMsgType::Auth, 0, now).unwrap();
        }
        assert_eq!(client.pending_len(), 30);
        assert!(client.pending.iter().all(|e| e.msg.identifier() != 0));
    }

    #[test]
    fn test_failover_with_same_secret_keeps_requests() {
        let (mut ctx, sent) = setup(vec![server(1, "s"), server(2, "s")], 0);
        let start = Instant::now();
        let client = ctx.radius_client();
        let msg = request(client);
        client.send(msg, RadiusMsgType::Auth, 0, start).unwrap();

        let mut now = start;
        for _ in 0..4 {
            now = client.next_timeout().unwrap();
            client.handle_timeout(now);
        }
        assert_eq!(client.current_server(0).unwrap().addr, Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(client.pending_len(), 1);

        // The retry state was reset, so the request goes out right away.
        let next = client.next_timeout().unwrap();
        assert!(next <= now);
        client.handle_timeout(now);
        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 6);
        assert!(sent[..5].iter().all(|(a, _)| a.ip() == Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(sent[5].0, SocketAddr::from((Ipv4Addr::new(10, 0, 0, 2), 1812)));
        assert_eq!(sent[5].1, sent[0].1);
    }

    #[test]
    fn test_failover_with_different_secret_flushes() {
        let (mut ctx, _sent) = setup(vec![server(1, "s1"), server(2, "s2")], 0);
        let start = Instant::now();
        let client = ctx.radius_client();
        let msg = request(client);
        client.send(msg, RadiusMsgType::Auth, 0, start).unwrap();
        for _ in 0..4 {
            let now = client.next_timeout().unwrap();
            client.handle_timeout(now);
        }
        assert_eq!(client.current_server(0).unwrap().shared_secret, "s2");
        assert_eq!(client.pending_len(), 0);
    }

    #[test]
    fn test_failback_to_primary() {
        let (mut ctx, _sent) = setup(vec![server(1, "s"), server(2, "s")], 60);
        let start = Instant::now();
        let client = ctx.radius_client();
        let msg = request(client);
        client.send(msg, RadiusMsgType::Auth, 0, start).unwrap();
        let mut now = start;
        for _ in 0..4 {
            now = client.next_timeout().unwrap();
            client.handle_timeout(now);
        }
        assert_eq!(client.current_server(0).unwrap().addr, Ipv4Addr::new(10, 0, 0, 2));

        client.flush();
        assert_eq!(client.next_timeout(), Some(now + Duration::from_secs(60)));
        client.handle_timeout(now + Duration::from_secs(60));
        assert_eq!(client.current_server(0).unwrap().addr, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(client.next_timeout(), None);
    }

    #[test]
    fn test_handlers_in_order_and_claim() {
        let (mut ctx, sent) = setup(vec![server(1, "secret")], 0);
        let now = Instant::now();
        {
            let client = ctx.radius_client();
            client.register(RadiusMsgType::Auth, declining_handler);
            client.register(RadiusMsgType::Auth, verifying_handler);
            let msg = request(client);
            client.send(msg, RadiusMsgType::Auth, 0, now).unwrap();
        }
        let req = sent_request(&sent, 0);
        let reply = accept_for(&req, b"secret");

        RadiusClient::receive(&mut ctx, 0, from_server(1), &reply);
        assert_eq!(ctx.seen, vec![("decline", 0), ("verify", 0)]);
        assert_eq!(ctx.radius_client().pending_len(), 0);

        // A duplicate finds no pending request.
        RadiusClient::receive(&mut ctx, 0, from_server(1), &reply);
        assert_eq!(ctx.seen.len(), 2);
        assert_eq!(ctx.radius_client().server_counters(0)[0].1.packets_dropped, 1);
    }

    #[test]
    fn test_corrupted_reply_leaves_request_queued() {
        let (mut ctx, sent) = setup(vec![server(1, "secret")], 0);
        let now = Instant::now();
        {
            let client = ctx.radius_client();
            client.register(RadiusMsgType::Auth, verifying_handler);
            let msg = request(client);
            client.send(msg, RadiusMsgType::Auth, 0, now).unwrap();
        }
        let req = sent_request(&sent, 0);
        let mut reply = accept_for(&req, b"secret");
        let last = reply.len() - 1;
        reply[last] ^= 0x04;

        RadiusClient::receive(&mut ctx, 0, from_server(1), &reply);
        assert!(ctx.seen.is_empty());
        let client = ctx.radius_client();
        assert_eq!(client.pending_len(), 1);

        client.handle_timeout(now + Duration::from_secs(1));
        assert_eq!(sent.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_reply_from_wrong_source_is_dropped() {
        let (mut ctx, sent) = setup(vec![server(1, "secret"), server(2, "secret")], 0);
        let now = Instant::now();
        {
            let client = ctx.radius_client();
            client.register(RadiusMsgType::Auth, verifying_handler);
            let msg = request(client);
            client.send(msg, RadiusMsgType::Auth, 0, now).unwrap();
        }
        let req = sent_request(&sent, 0);
        let reply = accept_for(&req, b"secret");

        // The secondary server is not in use yet.
        RadiusClient::receive(&mut ctx, 0, from_server(2), &reply);
        // Right address, wrong port.
        RadiusClient::receive(&mut ctx, 0, SocketAddr::from((Ipv4Addr::new(10, 0, 0, 1), 1645)), &reply);
        assert!(ctx.seen.is_empty());
        assert_eq!(ctx.radius_client().pending_len(), 1);
        let counters = ctx.radius_client().server_counters(0);
        assert_eq!(counters[0].1.packets_dropped, 2);
        assert_eq!(counters[0].1.responses, 0);

        RadiusClient::receive(&mut ctx, 0, from_server(1), &reply);
        assert_eq!(ctx.seen, vec![("verify", 0)]);
        assert_eq!(ctx.radius_client().pending_len(), 0);
    }

    #[test]
    fn test_malformed_and_unexpected_replies() {
        let (mut ctx, _sent) = setup(vec![server(1, "secret")], 0);
        RadiusClient::receive(&mut ctx, 0, from_server(1), &[2, 0, 0]);
        let mut acct = RadiusMsg::new(RadiusCode::AccountingResponse, 0);
        acct.finish(None).unwrap();
        RadiusClient::receive(&mut ctx, 0, from_server(1), acct.as_bytes());

        let counters = ctx.radius_client().server_counters(0);
        assert_eq!(counters[0].1.malformed_responses, 1);
        assert_eq!(counters[0].1.unknown_types, 1);
    }
}

pub mod cmdsock;
pub mod config;
pub mod driver;
pub mod ieee802_1x;

use anyhow::Result;
use pnet_base::MacAddr;
use portauth_core::{Config, Scheduler, SmAction, SmParams, StationTable, TimerId};
use portauth_ipc::{Command, Response, StationInfo};
use portauth_net::radius_client::RadiusContext;
use portauth_net::{RadiusClient, RadiusMsgType};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::cmdsock::ControlRequest;
use crate::driver::{Driver, DriverRequest, LinkDriver, RxFrame};

const EAPOL_TICK: Duration = Duration::from_secs(1);
const RADIUS_BUF_SIZE: usize = 4096;

/// Scheduled work owned by the authenticator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timer {
    EapolTick(MacAddr),
    SessionTimeout(MacAddr),
    WepRekey,
}

/// The authenticator instance: station table, RADIUS client, timers and
/// driver, all owned by one task.
pub struct Authenticator {
    pub(crate) config: Config,
    pub(crate) sm_params: SmParams,
    pub(crate) stations: StationTable,
    pub(crate) radius: RadiusClient<Authenticator>,
    pub(crate) timers: Scheduler<Timer>,
    pub(crate) driver: Box<dyn Driver>,
    pub(crate) own_addrs: Vec<MacAddr>,
    pub(crate) default_wep_key: Option<Vec<u8>>,
    pub(crate) default_wep_key_idx: u8,
    pub(crate) rekey_timer: Option<TimerId>,
    /// Time of the event being processed.
    pub(crate) now: Instant,
}

impl RadiusContext for Authenticator {
    fn radius_client(&mut self) -> &mut RadiusClient<Self> {
        &mut self.radius
    }
}

impl Authenticator {
    /// Creates the authenticator. `own_addrs` holds the MAC address of each
    /// configured BSS. RADIUS sockets are attached separately.
    pub fn new(config: Config, own_addrs: Vec<MacAddr>, driver: Box<dyn Driver>, now: Instant) -> Self {
        let mut radius = RadiusClient::from_config(&config);
        radius.register(RadiusMsgType::Auth, ieee802_1x::receive_auth);

        let mut auth = Self {
            sm_params: SmParams::from(&config),
            stations: StationTable::new(config.max_stations),
            radius,
            timers: Scheduler::new(),
            driver,
            own_addrs,
            default_wep_key: None,
            // The first rekey wraps this to the initial index.
            default_wep_key_idx: 3,
            rekey_timer: None,
            now,
            config,
        };
        if auth.config.default_wep_key_len > 0 {
            auth.rekey();
        }
        auth
    }

    pub fn stations(&self) -> &StationTable {
        &self.stations
    }

    /// Index and value of the current broadcast key.
    pub fn default_wep_key(&self) -> Option<(u8, &[u8])> {
        self.default_wep_key
            .as_deref()
            .map(|key| (self.default_wep_key_idx, key))
    }

    pub fn handle_eapol(&mut self, bss: usize, src: MacAddr, ethertype: u16, frame: &[u8], now: Instant) {
        self.now = now;
        self.receive(bss, src, ethertype, frame);
    }

    pub fn handle_radius(&mut self, group: usize, src: SocketAddr, data: &[u8], now: Instant) {
        self.now = now;
        RadiusClient::receive(self, group, src, data);
    }

    /// Station association reported by the driver.
    pub fn handle_new_station(&mut self, bss: usize, addr: MacAddr, now: Instant) {
        self.now = now;
        self.new_station(bss, addr);
    }

    pub fn handle_disconnect(&mut self, addr: MacAddr, now: Instant) {
        self.now = now;
        self.station_disconnected(addr);
    }

    /// Earliest instant at which `handle_timeout` has work to do.
    pub fn next_timeout(&self) -> Option<Instant> {
        match (self.timers.next_deadline(), self.radius.next_timeout()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn handle_timeout(&mut self, now: Instant) {
        self.now = now;
        self.radius.handle_timeout(now);

        while let Some((_, timer)) = self.timers.pop_expired(now) {
            match timer {
                Timer::EapolTick(addr) => {
                    let Some(sta) = self.stations.get_mut(&addr) else {
                        continue;
                    };
                    sta.tick_timer = Some(self.timers.schedule(now + EAPOL_TICK, Timer::EapolTick(addr)));
                    let actions = sta.sm.tick();
                    self.run_actions(addr, actions);
                }
                Timer::SessionTimeout(addr) => {
                    if let Some(sta) = self.stations.get_mut(&addr) {
                        sta.session_timer = None;
                        info!("Session timeout for station {}, deauthenticating", addr);
                        let bss = sta.bss;
                        self.driver_request(bss, DriverRequest::Deauthenticate { addr });
                        self.free_station(&addr);
                    }
                }
                Timer::WepRekey => {
                    self.rekey_timer = None;
                    self.rekey();
                }
            }
        }
    }

    pub fn handle_command(&mut self, command: Command, now: Instant) -> Response {
        self.now = now;
        match command {
            Command::List => {
                info!("Received List command");
                Response::Stations(self.stations.iter().map(station_info).collect())
            }
            Command::Disconnect { mac } => {
                info!("Received Disconnect command for {}", mac);
                let Some(bss) = self.stations.get(&mac).map(|s| s.bss) else {
                    return Response::Error(format!("station {} not found", mac));
                };
                self.driver_request(bss, DriverRequest::Deauthenticate { addr: mac });
                self.free_station(&mac);
                Response::Success
            }
            Command::Reauthenticate { mac } => {
                info!("Received Reauthenticate command for {}", mac);
                let Some(sta) = self.stations.get_mut(&mac) else {
                    return Response::Error(format!("station {} not found", mac));
                };
                sta.sm.reauthenticate = true;
                self.step_station(mac);
                Response::Success
            }
        }
    }

    /// Applies a reloaded configuration. Station state machine parameters
    /// apply to stations created afterwards. Returns newly bound RADIUS
    /// sockets.
    pub async fn reload(&mut self, config: Config) -> Vec<(usize, Arc<UdpSocket>)> {
        let sockets = self.radius.reconfigure(&config).await;
        self.sm_params = SmParams::from(&config);
        if config.default_wep_key_len != self.config.default_wep_key_len
            || config.wep_rekey_period != self.config.wep_rekey_period
        {
            info!("Broadcast key settings changed, rekeying");
            if let Some(id) = self.rekey_timer.take() {
                self.timers.cancel(id);
            }
            self.config = config;
            if self.config.default_wep_key_len > 0 {
                self.rekey();
            } else {
                self.default_wep_key = None;
            }
        } else {
            self.config = config;
        }
        sockets
    }

    pub(crate) fn step_station(&mut self, addr: MacAddr) {
        let Some(sta) = self.stations.get_mut(&addr) else {
            return;
        };
        let actions = sta.sm.step();
        self.run_actions(addr, actions);
    }

    pub(crate) fn run_actions(&mut self, addr: MacAddr, actions: Vec<SmAction>) {
        for action in actions {
            match action {
                SmAction::SetPortAuthorized(authorized) => self.set_sta_authorized(addr, authorized),
                SmAction::TxCannedEap { id, success } => self.tx_canned_eap(addr, id, success),
                SmAction::RequestIdentity { id } => self.request_identity(addr, id),
                SmAction::TxReq { id } => self.tx_req(addr, id),
                SmAction::TxFinal { id, success } => self.tx_final(addr, id, success),
                SmAction::SendRespToServer => self.send_resp_to_server(addr),
                SmAction::AbortAuth => self.abort_auth(addr),
                SmAction::TxKey { .. } => self.tx_key(addr),
            }
        }
    }

    /// Removes a station and cancels every timer it owns.
    pub(crate) fn free_station(&mut self, addr: &MacAddr) {
        if let Some(sta) = self.stations.free(addr) {
            for id in sta.timers() {
                self.timers.cancel(id);
            }
        }
    }

    pub(crate) fn driver_request(&mut self, bss: usize, request: DriverRequest) {
        let name = request.name();
        if let Err(e) = self.driver.request(bss, request) {
            warn!("Driver request {} failed: {}", name, e);
        }
    }
}

fn station_info(sta: &portauth_core::Station) -> StationInfo {
    let (auth_pae, be_auth, reauth_timer, key_tx) = sta.sm.states();
    StationInfo {
        addr: sta.addr,
        aid: sta.aid,
        bss: sta.bss,
        identity: sta.identity_str(),
        authorized: sta.flags.authorized,
        auth_pae,
        be_auth,
        reauth_timer,
        key_tx,
        counters: sta.counters.clone(),
    }
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.loglevel.as_filter()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

type RadiusDatagram = (usize, SocketAddr, Vec<u8>);

fn spawn_radius_reader(group: usize, socket: Arc<UdpSocket>, tx: mpsc::Sender<RadiusDatagram>) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; RADIUS_BUF_SIZE];
        loop {
            match socket.recv_from(&mut buf).await {
                Ok((len, src)) => {
                    if tx.send((group, src, buf[..len].to_vec())).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!("RADIUS socket receive error: {}", e);
                }
            }
        }
    });
}

pub async fn run() -> Result<()> {
    let initial_config = match config::load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading config: {}", e);
            std::process::exit(1);
        }
    };
    init_logging(&initial_config);

    info!("Starting portauth");

    let (frame_tx, mut frame_rx) = mpsc::channel::<RxFrame>(1024);
    let (driver, own_addrs) = match LinkDriver::open(&initial_config.bss, frame_tx) {
        Ok(result) => result,
        Err(e) => {
            error!("Error opening interfaces: {}", e);
            std::process::exit(1);
        }
    };

    let cmdsocket = initial_config.cmdsocket.clone();
    let mut auth = Authenticator::new(initial_config, own_addrs, Box::new(driver), Instant::now());

    let (radius_tx, mut radius_rx) = mpsc::channel::<RadiusDatagram>(256);
    for (group, socket) in auth.radius.init().await {
        spawn_radius_reader(group, socket, radius_tx.clone());
    }

    let (control_tx, mut control_rx) = mpsc::channel::<ControlRequest>(16);
    if let Some(path) = cmdsocket {
        tokio::spawn(async move {
            if let Err(e) = cmdsock::run_cmdsock_listener(path, control_tx).await {
                error!("Cmdsock listener failed: {}", e);
            }
        });
    }

    let mut hangup = signal(SignalKind::hangup())?;

    loop {
        let deadline = auth
            .next_timeout()
            .map(tokio::time::Instant::from_std)
            .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(3600));

        tokio::select! {
            Some(frame) = frame_rx.recv() => {
                auth.handle_eapol(frame.bss, frame.src, frame.ethertype, &frame.data, Instant::now());
            }
            Some((group, src, data)) = radius_rx.recv() => {
                auth.handle_radius(group, src, &data, Instant::now());
            }
            Some(request) = control_rx.recv() => {
                let response = auth.handle_command(request.command, Instant::now());
                if request.reply.send(response).is_err() {
                    warn!("Control client went away before the reply");
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                auth.handle_timeout(Instant::now());
            }
            _ = hangup.recv() => {
                info!("SIGHUP received, reloading configuration...");
                match config::load_config() {
                    Ok(new_config) => {
                        for (group, socket) in auth.reload(new_config).await {
                            spawn_radius_reader(group, socket, radius_tx.clone());
                        }
                        info!("Configuration reloaded successfully.");
                    }
                    Err(e) => error!("Failed to reload configuration: {}", e),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    auth.radius.flush();
    Ok(())
}

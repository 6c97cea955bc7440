//! IEEE 802.1X-2001 §8.5 authenticator state machines.
//!
//! One [`EapolStateMachine`] exists per station. It holds the four
//! cooperating machines (Authenticator PAE, Backend Authentication,
//! Reauthentication Timer, Authenticator Key Transmit) and the variables they
//! share. The machine never performs I/O itself: entry actions that must reach
//! the outside world are returned from [`EapolStateMachine::step`] as an
//! ordered list of [`SmAction`]s for the protocol handler to execute.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Bound on settle passes; only zero timer periods can keep the machines
/// re-entering a state forever.
const MAX_SETTLE_PASSES: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortControl {
    ForceUnauthorized,
    ForceAuthorized,
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortStatus {
    Unauthorized,
    Authorized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthPaeState {
    Initialize,
    Disconnected,
    Connecting,
    Authenticating,
    Authenticated,
    Aborting,
    Held,
    ForceAuth,
    ForceUnauth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BeAuthState {
    Initialize,
    Idle,
    Request,
    Response,
    Success,
    Fail,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReauthTimerState {
    Initialize,
    Reauthenticate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyTxState {
    NoKeyTransmit,
    KeyTransmit,
}

/// Side effects requested by state entry actions, in the order they occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmAction {
    SetPortAuthorized(bool),
    TxCannedEap { id: u8, success: bool },
    RequestIdentity { id: u8 },
    /// Relay the last EAP request from the server with identifier `id`.
    TxReq { id: u8 },
    /// Relay the final EAP frame from the server, or a canned one if the
    /// server sent none.
    TxFinal { id: u8, success: bool },
    SendRespToServer,
    AbortAuth,
    TxKey { id: u8 },
}

/// Timer and retry constants, taken from configuration at allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmParams {
    pub quiet_period: u32,
    pub tx_period: u32,
    pub reauth_max: u32,
    pub supp_timeout: u32,
    pub server_timeout: u32,
    pub max_req: u32,
    pub reauth_period: u32,
    pub key_tx_enabled: bool,
}

impl Default for SmParams {
    fn default() -> Self {
        Self {
            quiet_period: 60,
            tx_period: 30,
            reauth_max: 2,
            supp_timeout: 30,
            server_timeout: 30,
            max_req: 2,
            reauth_period: 3600,
            key_tx_enabled: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthPaeCounters {
    pub enters_connecting: u32,
    pub eap_logoffs_while_connecting: u32,
    pub enters_authenticating: u32,
    pub auth_successes_while_authenticating: u32,
    pub auth_timeouts_while_authenticating: u32,
    pub auth_fail_while_authenticating: u32,
    pub auth_reauths_while_authenticating: u32,
    pub auth_eap_starts_while_authenticating: u32,
    pub auth_eap_logoff_while_authenticating: u32,
    pub auth_reauths_while_authenticated: u32,
    pub auth_eap_starts_while_authenticated: u32,
    pub auth_eap_logoff_while_authenticated: u32,
}

#[derive(Debug, Clone)]
pub struct AuthPae {
    pub state: AuthPaeState,
    pub eap_logoff: bool,
    pub eap_start: bool,
    pub port_mode: PortControl,
    pub reauth_count: u32,
    pub rx_initial_rsp: bool,
    pub quiet_period: u32,
    pub reauth_max: u32,
    pub tx_period: u32,
    pub counters: AuthPaeCounters,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BackendCounters {
    pub responses: u32,
    pub access_challenges: u32,
    pub other_requests_to_supplicant: u32,
    pub non_nak_responses_from_supplicant: u32,
    pub auth_successes: u32,
    pub auth_fails: u32,
}

#[derive(Debug, Clone)]
pub struct BackendAuth {
    pub state: BeAuthState,
    pub req_count: u32,
    pub rx_resp: bool,
    pub a_success: bool,
    pub a_fail: bool,
    pub a_req: bool,
    pub id_from_server: u8,
    pub supp_timeout: u32,
    pub server_timeout: u32,
    pub max_req: u32,
    pub counters: BackendCounters,
}

#[derive(Debug, Clone)]
pub struct ReauthTimer {
    pub state: ReauthTimerState,
    pub reauth_period: u32,
    pub reauth_enabled: bool,
}

#[derive(Debug, Clone)]
pub struct AuthKeyTx {
    pub state: KeyTxState,
}

#[derive(Debug, Clone)]
pub struct EapolStateMachine {
    pub auth_pae: AuthPae,
    pub be_auth: BackendAuth,
    pub reauth_timer: ReauthTimer,
    pub auth_key_tx: AuthKeyTx,

    // timers, decremented once per second by `tick`
    pub a_while: u32,
    pub quiet_while: u32,
    pub reauth_when: u32,
    pub tx_when: u32,

    pub auth_abort: bool,
    pub auth_fail: bool,
    pub auth_start: bool,
    pub auth_timeout: bool,
    pub auth_success: bool,
    pub current_id: u8,
    pub initialize: bool,
    pub port_control: PortControl,
    pub port_enabled: bool,
    pub port_status: PortStatus,
    pub reauthenticate: bool,

    pub key_available: bool,
    pub key_tx_enabled: bool,
    pub port_valid: bool,

    /// Set by every state entry during a settle pass.
    changed: bool,
    actions: Vec<SmAction>,
}

impl EapolStateMachine {
    /// Creates a machine with every sub-machine in its initial state and
    /// runs the initialization sequence. The port starts disabled; the
    /// caller enables it once the station is known to be present.
    pub fn new(params: &SmParams) -> Self {
        let mut sm = Self {
            auth_pae: AuthPae {
                state: AuthPaeState::Initialize,
                eap_logoff: false,
                eap_start: false,
                port_mode: PortControl::Auto,
                reauth_count: 0,
                rx_initial_rsp: false,
                quiet_period: params.quiet_period,
                reauth_max: params.reauth_max,
                tx_period: params.tx_period,
                counters: AuthPaeCounters::default(),
            },
            be_auth: BackendAuth {
                state: BeAuthState::Initialize,
                req_count: 0,
                rx_resp: false,
                a_success: false,
                a_fail: false,
                a_req: false,
                id_from_server: 0,
                supp_timeout: params.supp_timeout,
                server_timeout: params.server_timeout,
                max_req: params.max_req,
                counters: BackendCounters::default(),
            },
            reauth_timer: ReauthTimer {
                state: ReauthTimerState::Initialize,
                reauth_period: params.reauth_period,
                reauth_enabled: params.reauth_period > 0,
            },
            auth_key_tx: AuthKeyTx {
                state: KeyTxState::NoKeyTransmit,
            },
            a_while: 0,
            quiet_while: 0,
            reauth_when: 0,
            tx_when: 0,
            auth_abort: false,
            auth_fail: false,
            auth_start: false,
            auth_timeout: false,
            auth_success: false,
            current_id: 0,
            initialize: false,
            port_control: PortControl::Auto,
            port_enabled: false,
            port_status: PortStatus::Unauthorized,
            reauthenticate: false,
            key_available: false,
            key_tx_enabled: params.key_tx_enabled,
            port_valid: true,
            changed: false,
            actions: Vec::new(),
        };
        // Nothing observable can happen while the port is disabled, so the
        // actions of the bootstrap sequence are discarded.
        sm.initialize();
        sm
    }

    /// Asserts `initialize`, settles, deasserts it and settles again so each
    /// entry action of the initial states runs exactly once.
    pub fn initialize(&mut self) -> Vec<SmAction> {
        self.initialize = true;
        let mut actions = self.step();
        self.initialize = false;
        actions.extend(self.step());
        actions
    }

    /// Re-evaluates all four machines until a pass enters no state. A
    /// re-entry of the current state counts, since its entry actions can
    /// change the guards of the other machines.
    pub fn step(&mut self) -> Vec<SmAction> {
        for _ in 0..MAX_SETTLE_PASSES {
            self.changed = false;
            self.step_auth_pae();
            self.step_be_auth();
            self.step_reauth_timer();
            self.step_auth_key_tx();
            if !self.changed {
                return std::mem::take(&mut self.actions);
            }
        }
        warn!("EAPOL state machines did not settle after {} passes", MAX_SETTLE_PASSES);
        std::mem::take(&mut self.actions)
    }

    /// One-second timer: decrement the running timers and re-evaluate.
    pub fn tick(&mut self) -> Vec<SmAction> {
        self.a_while = self.a_while.saturating_sub(1);
        self.quiet_while = self.quiet_while.saturating_sub(1);
        self.reauth_when = self.reauth_when.saturating_sub(1);
        self.tx_when = self.tx_when.saturating_sub(1);
        self.step()
    }

    pub fn states(&self) -> (AuthPaeState, BeAuthState, ReauthTimerState, KeyTxState) {
        (
            self.auth_pae.state,
            self.be_auth.state,
            self.reauth_timer.state,
            self.auth_key_tx.state,
        )
    }

    pub fn is_authorized(&self) -> bool {
        self.port_status == PortStatus::Authorized
    }

    /// Entry through a global transition. Its condition holds on every pass,
    /// so entering the state the machine is already in is not a change.
    fn enter_global(&mut self, already: bool, enter: impl FnOnce(&mut Self)) {
        let changed = self.changed;
        enter(self);
        if already {
            self.changed = changed;
        }
    }

    fn emit(&mut self, action: SmAction) {
        self.actions.push(action);
    }

    fn set_port_status(&mut self, status: PortStatus) {
        self.port_status = status;
        self.emit(SmAction::SetPortAuthorized(status == PortStatus::Authorized));
    }

    // Authenticator PAE

    fn enter_auth_pae(&mut self, state: AuthPaeState) {
        self.changed = true;
        let prev = self.auth_pae.state;
        if prev != state {
            debug!("AUTH_PAE {:?} -> {:?}", prev, state);
        }
        let c = &mut self.auth_pae.counters;
        match state {
            AuthPaeState::Initialize => {
                self.auth_pae.state = state;
                self.current_id = 0;
                self.auth_pae.port_mode = PortControl::Auto;
            }
            AuthPaeState::Disconnected => {
                if self.auth_pae.eap_logoff && prev == AuthPaeState::Connecting {
                    c.eap_logoffs_while_connecting += 1;
                }
                self.auth_pae.state = state;
                self.set_port_status(PortStatus::Unauthorized);
                self.auth_pae.eap_logoff = false;
                self.auth_pae.reauth_count = 0;
                // Some supplicants deauthenticate when they see EAP-Failure
                // before any request, so skip it right after INITIALIZE.
                if prev != AuthPaeState::Initialize {
                    self.emit(SmAction::TxCannedEap { id: self.current_id, success: false });
                }
                self.current_id = self.current_id.wrapping_add(1);
            }
            AuthPaeState::Connecting => {
                if prev != AuthPaeState::Connecting {
                    c.enters_connecting += 1;
                }
                if prev == AuthPaeState::Authenticated {
                    if self.reauthenticate {
                        c.auth_reauths_while_authenticated += 1;
                    }
                    if self.auth_pae.eap_start {
                        c.auth_eap_starts_while_authenticated += 1;
                    }
                    if self.auth_pae.eap_logoff {
                        c.auth_eap_logoff_while_authenticated += 1;
                    }
                }
                self.auth_pae.state = state;
                self.auth_pae.eap_start = false;
                self.reauthenticate = false;
                self.tx_when = self.auth_pae.tx_period;
                self.auth_pae.rx_initial_rsp = false;
                self.auth_pae.reauth_count += 1;
                self.emit(SmAction::RequestIdentity { id: self.current_id });
            }
            AuthPaeState::Authenticating => {
                if prev == AuthPaeState::Connecting && self.auth_pae.rx_initial_rsp {
                    c.enters_authenticating += 1;
                }
                self.auth_pae.state = state;
                self.auth_success = false;
                self.auth_fail = false;
                self.auth_timeout = false;
                self.auth_start = true;
            }
            AuthPaeState::Authenticated => {
                if prev == AuthPaeState::Authenticating && self.auth_success {
                    c.auth_successes_while_authenticating += 1;
                }
                self.auth_pae.state = state;
                self.set_port_status(PortStatus::Authorized);
                self.auth_pae.reauth_count = 0;
                self.current_id = self.current_id.wrapping_add(1);
            }
            AuthPaeState::Held => {
                if prev == AuthPaeState::Authenticating && self.auth_fail {
                    c.auth_fail_while_authenticating += 1;
                }
                self.auth_pae.state = state;
                self.set_port_status(PortStatus::Unauthorized);
                self.quiet_while = self.auth_pae.quiet_period;
                self.auth_pae.eap_logoff = false;
                self.current_id = self.current_id.wrapping_add(1);
            }
            AuthPaeState::Aborting => {
                if prev == AuthPaeState::Authenticating {
                    if self.auth_timeout {
                        c.auth_timeouts_while_authenticating += 1;
                    }
                    if self.reauthenticate {
                        c.auth_reauths_while_authenticating += 1;
                    }
                    if self.auth_pae.eap_start {
                        c.auth_eap_starts_while_authenticating += 1;
                    }
                    if self.auth_pae.eap_logoff {
                        c.auth_eap_logoff_while_authenticating += 1;
                    }
                }
                self.auth_pae.state = state;
                self.auth_abort = true;
                self.current_id = self.current_id.wrapping_add(1);
            }
            AuthPaeState::ForceAuth => {
                self.auth_pae.state = state;
                self.set_port_status(PortStatus::Authorized);
                self.auth_pae.port_mode = PortControl::ForceAuthorized;
                self.auth_pae.eap_start = false;
                self.emit(SmAction::TxCannedEap { id: self.current_id, success: true });
                self.current_id = self.current_id.wrapping_add(1);
            }
            AuthPaeState::ForceUnauth => {
                self.auth_pae.state = state;
                self.set_port_status(PortStatus::Unauthorized);
                self.auth_pae.port_mode = PortControl::ForceUnauthorized;
                self.auth_pae.eap_start = false;
                self.emit(SmAction::TxCannedEap { id: self.current_id, success: false });
                self.current_id = self.current_id.wrapping_add(1);
            }
        }
    }

    fn step_auth_pae(&mut self) {
        let port_down = self.initialize || !self.port_enabled;
        if (self.port_control == PortControl::Auto && self.auth_pae.port_mode != self.port_control)
            || port_down
        {
            let already = self.auth_pae.state == AuthPaeState::Initialize;
            self.enter_global(already, |sm| sm.enter_auth_pae(AuthPaeState::Initialize));
            return;
        }
        if self.port_control == PortControl::ForceAuthorized
            && self.auth_pae.port_mode != self.port_control
        {
            self.enter_auth_pae(AuthPaeState::ForceAuth);
            return;
        }
        if self.port_control == PortControl::ForceUnauthorized
            && self.auth_pae.port_mode != self.port_control
        {
            self.enter_auth_pae(AuthPaeState::ForceUnauth);
            return;
        }

        let pae = &self.auth_pae;
        let next = match pae.state {
            AuthPaeState::Initialize => Some(AuthPaeState::Disconnected),
            AuthPaeState::Disconnected => Some(AuthPaeState::Connecting),
            AuthPaeState::Held => (self.quiet_while == 0).then_some(AuthPaeState::Connecting),
            AuthPaeState::Connecting => {
                if pae.eap_logoff || pae.reauth_count > pae.reauth_max {
                    Some(AuthPaeState::Disconnected)
                } else if pae.rx_initial_rsp {
                    Some(AuthPaeState::Authenticating)
                } else if self.tx_when == 0 || pae.eap_start || self.reauthenticate {
                    Some(AuthPaeState::Connecting)
                } else {
                    None
                }
            }
            AuthPaeState::Authenticated => {
                if pae.eap_start || self.reauthenticate {
                    Some(AuthPaeState::Connecting)
                } else if pae.eap_logoff || !self.port_valid {
                    Some(AuthPaeState::Disconnected)
                } else {
                    None
                }
            }
            AuthPaeState::Authenticating => {
                if self.auth_success && self.port_valid {
                    Some(AuthPaeState::Authenticated)
                } else if self.auth_fail {
                    Some(AuthPaeState::Held)
                } else if self.reauthenticate
                    || pae.eap_start
                    || pae.eap_logoff
                    || self.auth_timeout
                {
                    Some(AuthPaeState::Aborting)
                } else {
                    None
                }
            }
            AuthPaeState::Aborting => {
                if self.auth_abort {
                    None
                } else if pae.eap_logoff {
                    Some(AuthPaeState::Disconnected)
                } else {
                    Some(AuthPaeState::Connecting)
                }
            }
            AuthPaeState::ForceAuth => pae.eap_start.then_some(AuthPaeState::ForceAuth),
            AuthPaeState::ForceUnauth => pae.eap_start.then_some(AuthPaeState::ForceUnauth),
        };
        if let Some(state) = next {
            self.enter_auth_pae(state);
        }
    }

    // Backend Authentication

    fn enter_be_auth(&mut self, state: BeAuthState) {
        self.changed = true;
        let prev = self.be_auth.state;
        if prev != state {
            debug!("BE_AUTH {:?} -> {:?}", prev, state);
        }
        self.be_auth.state = state;
        match state {
            BeAuthState::Initialize => {
                if prev != BeAuthState::Initialize {
                    self.emit(SmAction::AbortAuth);
                }
                self.auth_abort = false;
            }
            BeAuthState::Request => {
                self.current_id = self.be_auth.id_from_server;
                self.emit(SmAction::TxReq { id: self.current_id });
                self.a_while = self.be_auth.supp_timeout;
                self.be_auth.req_count += 1;
                self.be_auth.counters.other_requests_to_supplicant += 1;
            }
            BeAuthState::Response => {
                self.be_auth.a_req = false;
                self.be_auth.a_success = false;
                self.auth_timeout = false;
                self.be_auth.rx_resp = false;
                self.be_auth.a_fail = false;
                self.a_while = self.be_auth.server_timeout;
                self.be_auth.req_count = 0;
                self.be_auth.counters.responses += 1;
                self.emit(SmAction::SendRespToServer);
            }
            BeAuthState::Success => {
                self.current_id = self.be_auth.id_from_server;
                self.emit(SmAction::TxFinal { id: self.current_id, success: true });
                self.auth_success = true;
                self.be_auth.counters.auth_successes += 1;
            }
            BeAuthState::Fail => {
                self.current_id = self.be_auth.id_from_server;
                self.emit(SmAction::TxFinal { id: self.current_id, success: false });
                self.auth_fail = true;
                self.be_auth.counters.auth_fails += 1;
            }
            BeAuthState::Timeout => {
                if self.port_status == PortStatus::Unauthorized {
                    self.emit(SmAction::TxCannedEap { id: self.current_id, success: false });
                }
                self.auth_timeout = true;
            }
            BeAuthState::Idle => {
                self.auth_start = false;
            }
        }
    }

    fn step_be_auth(&mut self) {
        if self.port_control != PortControl::Auto || self.initialize || self.auth_abort {
            let already = self.be_auth.state == BeAuthState::Initialize;
            self.enter_global(already, |sm| sm.enter_be_auth(BeAuthState::Initialize));
            return;
        }

        let be = &self.be_auth;
        let next = match be.state {
            BeAuthState::Initialize => Some(BeAuthState::Idle),
            BeAuthState::Request => {
                if self.a_while == 0 && be.req_count < be.max_req {
                    Some(BeAuthState::Request)
                } else if be.rx_resp {
                    Some(BeAuthState::Response)
                } else if self.a_while == 0 {
                    Some(BeAuthState::Timeout)
                } else {
                    None
                }
            }
            BeAuthState::Response => {
                if be.a_req {
                    Some(BeAuthState::Request)
                } else if be.a_success {
                    Some(BeAuthState::Success)
                } else if be.a_fail {
                    Some(BeAuthState::Fail)
                } else if self.a_while == 0 {
                    Some(BeAuthState::Timeout)
                } else {
                    None
                }
            }
            BeAuthState::Success | BeAuthState::Fail | BeAuthState::Timeout => {
                Some(BeAuthState::Idle)
            }
            BeAuthState::Idle => self.auth_start.then_some(BeAuthState::Response),
        };
        if let Some(state) = next {
            if state == BeAuthState::Request && be.state == BeAuthState::Response {
                self.be_auth.counters.access_challenges += 1;
            }
            self.enter_be_auth(state);
        }
    }

    // Reauthentication Timer

    fn enter_reauth_timer(&mut self, state: ReauthTimerState) {
        self.changed = true;
        if self.reauth_timer.state != state {
            debug!("REAUTH_TIMER {:?} -> {:?}", self.reauth_timer.state, state);
        }
        self.reauth_timer.state = state;
        match state {
            ReauthTimerState::Initialize => {
                self.reauth_when = self.reauth_timer.reauth_period;
            }
            ReauthTimerState::Reauthenticate => {
                self.reauthenticate = true;
            }
        }
    }

    fn step_reauth_timer(&mut self) {
        if self.port_control != PortControl::Auto
            || self.initialize
            || self.port_status == PortStatus::Unauthorized
            || !self.reauth_timer.reauth_enabled
        {
            let already = self.reauth_timer.state == ReauthTimerState::Initialize;
            self.enter_global(already, |sm| sm.enter_reauth_timer(ReauthTimerState::Initialize));
            return;
        }
        match self.reauth_timer.state {
            ReauthTimerState::Initialize => {
                if self.reauth_when == 0 {
                    self.enter_reauth_timer(ReauthTimerState::Reauthenticate);
                }
            }
            ReauthTimerState::Reauthenticate => {
                self.enter_reauth_timer(ReauthTimerState::Initialize);
            }
        }
    }

    // Authenticator Key Transmit

    fn enter_auth_key_tx(&mut self, state: KeyTxState) {
        self.changed = true;
        if self.auth_key_tx.state != state {
            debug!("AUTH_KEY_TX {:?} -> {:?}", self.auth_key_tx.state, state);
        }
        self.auth_key_tx.state = state;
        if state == KeyTxState::KeyTransmit {
            self.emit(SmAction::TxKey { id: self.current_id });
            self.key_available = false;
        }
    }

    fn step_auth_key_tx(&mut self) {
        if self.initialize || self.port_control != PortControl::Auto {
            if self.auth_key_tx.state != KeyTxState::NoKeyTransmit {
                self.enter_auth_key_tx(KeyTxState::NoKeyTransmit);
            }
            return;
        }
        match self.auth_key_tx.state {
            KeyTxState::NoKeyTransmit => {
                if self.key_tx_enabled
                    && self.key_available
                    && self.port_status == PortStatus::Authorized
                {
                    self.enter_auth_key_tx(KeyTxState::KeyTransmit);
                }
            }
            KeyTxState::KeyTransmit => {
                if !self.key_tx_enabled || self.auth_fail || self.auth_pae.eap_logoff {
                    self.enter_auth_key_tx(KeyTxState::NoKeyTransmit);
                } else if self.key_available {
                    self.enter_auth_key_tx(KeyTxState::KeyTransmit);
                }
            }
        }
    }
}

// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 GridMesh Systems

//! Device-side bootstrap client
//!
//! Drives a device from power-on to admitted: randomized startup delay,
//! discovery scan, candidate ordering, then the EAP-PSK exchange against
//! the coordinator through the chosen relay. Once connected the client
//! stays alive to answer re-authentication (group-key delivery) and
//! activation parameters, and to honor a kick.
//!
//! Like the server this is an effects FSM: entry points take the current
//! tick and hand back what the platform must do.

use gm_common::config::BootClientConfig;
use gm_common::constants::{
    MAX_ID_LEN, MAX_PAN_CANDIDATES, PCHANNEL_NONCE_BOUND, RAND_SIZE,
};
use gm_common::log::RingLog;
use gm_common::time::{Millis, Ticks};
use gm_common::{
    log_info, log_warn, Error, ExtendedAddress, PanId, Result, ShortAddress,
};
use gm_crypto::{constant_time_eq, Aes128Key, CryptoRng};
use heapless::Vec;
use zeroize::Zeroize;

use crate::codec::{
    ChannelData, ChannelResult, ConfigParam, EapBody, EapCode, EapFrame, Envelope, EnvelopeCode,
    EnvelopePayload, PChannel, ParamResult, ATTR_GMK_ACTIVATION, MAX_PARAMS,
};
use crate::keys::{compute_mac_p, compute_mac_s, derive_ak_kdk, derive_tek, Ak, Kdk, Tek};
use crate::pansort::{self, PanCandidate, PanSortConfig};

const LOG_MODULE: &str = "boot-cli";
const LOG_CAPACITY: usize = 16;

/// Maximum side effects returned by one entry point
pub const MAX_EFFECTS: usize = 8;

/// Side effects for the platform to carry out
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Call `timer_fired` after this delay
    ArmTimer(Millis),
    /// Run a discovery scan for this long, then call `discovery_complete`
    StartDiscovery(Millis),
    /// Transmit this envelope through the current relay
    Send(Envelope),
    /// Offer the candidate list for external re-ordering; answer via
    /// `pan_sort_response` or let `sweep` proceed after the wait window
    RequestPanSort(Vec<PanCandidate, MAX_PAN_CANDIDATES>),
    /// Install a group key into the MAC key slot
    InstallGmk {
        /// Slot index
        index: u8,
        /// Key bytes
        key: [u8; 16],
    },
    /// Switch the MAC to the given key slot
    ActivateGmkIndex(u8),
    /// Adopt this short address
    SetShortAddress(ShortAddress),
    /// Start route discovery toward the coordinator
    StartRouteDiscovery(ShortAddress),
    /// Admission finished
    JoinComplete {
        /// Network joined
        pan_id: PanId,
        /// Address assigned by the coordinator
        short_addr: ShortAddress,
    },
    /// All candidates exhausted; the device stays down
    JoinFailed,
    /// The device left the network (kick or local leave)
    LeftNetwork,
}

/// Effect list returned by the client entry points
pub type Effects = Vec<Effect, MAX_EFFECTS>;

/// Client lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientState {
    /// Powered but not on any network
    #[default]
    Disconnected,
    /// Startup delay running
    WaitTimer,
    /// Discovery scan running
    WaitDiscoverConfirm,
    /// Candidate list offered for external ordering
    WaitPanSortRequest,
    /// Admission exchange running against a candidate
    Bootstrapping,
    /// Admitted, route discovery running
    Routing,
    /// On the network
    Connected,
    /// Local leave announced, waiting for the MAC confirm
    Leaving,
}

/// Device counters, saturating
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClientStats {
    /// Discovery scans started
    pub discoveries: u32,
    /// Join attempts sent
    pub join_attempts: u32,
    /// Successful admissions
    pub joins_completed: u32,
    /// Group keys installed after admission
    pub rekeys_applied: u32,
    /// Kicks honored
    pub kicks_received: u32,
}

/// Network attributes surviving a power cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoredNetwork {
    /// Network the device was on
    pub pan_id: PanId,
    /// Short address it held
    pub short_addr: ShortAddress,
    /// Active key slot
    pub gmk_index: u8,
    /// Group key in that slot
    pub gmk: [u8; 16],
}

/// Persistence seam for warm restarts
///
/// A device that stored its attributes before powering down can come back
/// without a full admission; `BootClient::start` replays the stored
/// attributes as effects and goes straight to connected.
pub trait PersistedAttributes {
    /// Stored attributes, if any
    fn load(&self) -> Option<RestoredNetwork>;
    /// Store attributes after a successful admission
    fn store(&mut self, network: &RestoredNetwork);
    /// Forget stored attributes after a leave or kick
    fn clear(&mut self);
}

/// Persistence stub for devices without storage
#[derive(Default)]
pub struct NoPersistence;

impl PersistedAttributes for NoPersistence {
    fn load(&self) -> Option<RestoredNetwork> {
        None
    }
    fn store(&mut self, _network: &RestoredNetwork) {}
    fn clear(&mut self) {}
}

// In-flight responder handshake
struct Handshake {
    eap_id: u8,
    rand_s: [u8; RAND_SIZE],
    rand_p: [u8; RAND_SIZE],
    id_s: Vec<u8, MAX_ID_LEN>,
    ak: Ak,
    kdk: Kdk,
    tek: Option<Tek>,
    last_nonce: u32,
    pending_short: Option<ShortAddress>,
    pending_gmk: Option<(u8, [u8; 16])>,
}

impl Drop for Handshake {
    fn drop(&mut self) {
        self.rand_s.zeroize();
        self.rand_p.zeroize();
    }
}

/// The device bootstrap client
pub struct BootClient {
    config: BootClientConfig,
    sort_config: PanSortConfig,
    state: ClientState,
    ext_addr: ExtendedAddress,
    candidates: Vec<PanCandidate, MAX_PAN_CANDIDATES>,
    cursor: usize,
    attempts: u8,
    attempt_started_at: Ticks,
    sort_requested_at: Ticks,
    handshake: Option<Handshake>,
    short_addr: ShortAddress,
    pan_id: Option<PanId>,
    stats: ClientStats,
    log: RingLog<LOG_CAPACITY>,
}

impl BootClient {
    /// Create a disconnected client
    #[must_use]
    pub fn new(config: BootClientConfig, sort_config: PanSortConfig, ext_addr: ExtendedAddress) -> Self {
        Self {
            config,
            sort_config,
            state: ClientState::Disconnected,
            ext_addr,
            candidates: Vec::new(),
            cursor: 0,
            attempts: 0,
            attempt_started_at: Ticks::ZERO,
            sort_requested_at: Ticks::ZERO,
            handshake: None,
            short_addr: ShortAddress::UNASSIGNED,
            pan_id: None,
            stats: ClientStats::default(),
            log: RingLog::new(),
        }
    }

    /// Current lifecycle state
    #[must_use]
    pub const fn state(&self) -> ClientState {
        self.state
    }

    /// Counter snapshot
    #[must_use]
    pub const fn stats(&self) -> ClientStats {
        self.stats
    }

    /// Assigned short address, `UNASSIGNED` while off the network
    #[must_use]
    pub const fn short_addr(&self) -> ShortAddress {
        self.short_addr
    }

    /// Drain the trace log
    pub fn log_mut(&mut self) -> &mut RingLog<LOG_CAPACITY> {
        &mut self.log
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Power-on entry point
    ///
    /// With stored attributes the client restores them and reports
    /// connected without a handshake; otherwise it arms the randomized
    /// startup delay.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidState` unless disconnected, or
    /// `Error::RngFailure` if the delay cannot be randomized.
    pub fn start<R: CryptoRng, P: PersistedAttributes>(
        &mut self,
        now: Ticks,
        rng: &mut R,
        persisted: &P,
    ) -> Result<Effects> {
        if self.state != ClientState::Disconnected {
            return Err(Error::InvalidState);
        }
        let mut effects = Effects::new();

        if let Some(network) = persisted.load() {
            self.short_addr = network.short_addr;
            self.pan_id = Some(network.pan_id);
            self.state = ClientState::Connected;
            log_info!(self.log, now, LOG_MODULE, "restored {} as {}", network.pan_id, network.short_addr);
            push(&mut effects, Effect::InstallGmk {
                index: network.gmk_index,
                key: network.gmk,
            })?;
            push(&mut effects, Effect::ActivateGmkIndex(network.gmk_index))?;
            push(&mut effects, Effect::SetShortAddress(network.short_addr))?;
            push(&mut effects, Effect::JoinComplete {
                pan_id: network.pan_id,
                short_addr: network.short_addr,
            })?;
            return Ok(effects);
        }

        let min = self.config.startup_delay_min.as_u32();
        let max = self.config.startup_delay_max.as_u32().max(min);
        let span = max - min + 1;
        let delay = Millis::new(min + rng.next_u32().map_err(Error::from)? % span);
        self.state = ClientState::WaitTimer;
        log_info!(self.log, now, LOG_MODULE, "startup delay {} ms", delay.as_u32());
        push(&mut effects, Effect::ArmTimer(delay))?;
        Ok(effects)
    }

    /// Startup delay elapsed
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidState` when no timer was armed.
    pub fn timer_fired(&mut self, now: Ticks) -> Result<Effects> {
        if self.state != ClientState::WaitTimer {
            return Err(Error::InvalidState);
        }
        self.state = ClientState::WaitDiscoverConfirm;
        ClientStats::bump(&mut self.stats.discoveries);
        log_info!(self.log, now, LOG_MODULE, "discovery scan");
        let mut effects = Effects::new();
        push(&mut effects, Effect::StartDiscovery(self.config.discovery_duration))?;
        Ok(effects)
    }

    /// Discovery scan finished with the collected candidates
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidState` when no scan was running.
    pub fn discovery_complete(
        &mut self,
        candidates: &[PanCandidate],
        now: Ticks,
    ) -> Result<Effects> {
        if self.state != ClientState::WaitDiscoverConfirm {
            return Err(Error::InvalidState);
        }
        let mut effects = Effects::new();

        self.candidates.clear();
        for candidate in candidates {
            if candidate.link_quality < self.config.link_quality_threshold {
                continue;
            }
            if self.candidates.push(*candidate).is_err() {
                break;
            }
        }
        pansort::sort(&mut self.candidates, &self.sort_config);

        if self.candidates.is_empty() {
            log_warn!(self.log, now, LOG_MODULE, "no usable candidate");
            self.state = ClientState::Disconnected;
            push(&mut effects, Effect::JoinFailed)?;
            return Ok(effects);
        }

        self.state = ClientState::WaitPanSortRequest;
        self.sort_requested_at = now;
        push(&mut effects, Effect::RequestPanSort(self.candidates.clone()))?;
        Ok(effects)
    }

    /// Externally re-ordered candidate list, answering `RequestPanSort`
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidState` when no ordering was requested.
    pub fn pan_sort_response(
        &mut self,
        candidates: Option<&[PanCandidate]>,
        now: Ticks,
    ) -> Result<Effects> {
        if self.state != ClientState::WaitPanSortRequest {
            return Err(Error::InvalidState);
        }
        if let Some(list) = candidates {
            self.candidates.clear();
            // The quality floor applies to the re-ordered list as well
            for candidate in list {
                if candidate.link_quality < self.config.link_quality_threshold {
                    continue;
                }
                if self.candidates.push(*candidate).is_err() {
                    break;
                }
            }
        }
        if self.candidates.is_empty() {
            log_warn!(self.log, now, LOG_MODULE, "no usable candidate");
            self.state = ClientState::Disconnected;
            let mut effects = Effects::new();
            push(&mut effects, Effect::JoinFailed)?;
            return Ok(effects);
        }
        self.cursor = 0;
        self.attempts = 0;
        self.begin_attempt(now)
    }

    /// Announce a local leave
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidState` unless on the network.
    pub fn leave(&mut self, now: Ticks) -> Result<Effects> {
        if !matches!(self.state, ClientState::Connected | ClientState::Routing) {
            return Err(Error::InvalidState);
        }
        self.state = ClientState::Leaving;
        log_info!(self.log, now, LOG_MODULE, "leaving");
        let mut effects = Effects::new();
        push(
            &mut effects,
            Effect::Send(Envelope::empty(
                EnvelopeCode::Kick,
                self.ext_addr,
                self.short_addr,
            )),
        )?;
        Ok(effects)
    }

    /// MAC confirm for the leave announcement
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidState` when no leave is in flight.
    pub fn leave_confirm<P: PersistedAttributes>(
        &mut self,
        now: Ticks,
        persisted: &mut P,
    ) -> Result<Effects> {
        if self.state != ClientState::Leaving {
            return Err(Error::InvalidState);
        }
        self.reset_network(persisted);
        log_info!(self.log, now, LOG_MODULE, "left");
        let mut effects = Effects::new();
        push(&mut effects, Effect::LeftNetwork)?;
        Ok(effects)
    }

    /// Route discovery outcome; the device is on the network either way
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidState` when no route discovery is running.
    pub fn route_complete(&mut self, success: bool, now: Ticks) -> Result<()> {
        if self.state != ClientState::Routing {
            return Err(Error::InvalidState);
        }
        if !success {
            log_warn!(self.log, now, LOG_MODULE, "route discovery failed");
        }
        self.state = ClientState::Connected;
        Ok(())
    }

    // =========================================================================
    // Envelope handling
    // =========================================================================

    /// Handle a received bootstrapping envelope
    ///
    /// Unverifiable traffic (bad MAC, stale challenge, bad nonce) is
    /// silently dropped.
    ///
    /// # Errors
    ///
    /// Propagates internal crypto or codec failures only; peer-attributable
    /// problems never surface as errors.
    pub fn on_envelope<R: CryptoRng, P: PersistedAttributes>(
        &mut self,
        env: &Envelope,
        now: Ticks,
        rng: &mut R,
        persisted: &mut P,
    ) -> Result<Effects> {
        let mut effects = Effects::new();
        if env.target != self.ext_addr {
            return Ok(effects);
        }

        match env.code {
            EnvelopeCode::Kick => {
                // No argument: drop everything and go dark
                ClientStats::bump(&mut self.stats.kicks_received);
                log_warn!(self.log, now, LOG_MODULE, "kicked");
                self.reset_network(persisted);
                push(&mut effects, Effect::LeftNetwork)?;
            }
            EnvelopeCode::Decline => {
                if self.state == ClientState::Bootstrapping {
                    log_warn!(self.log, now, LOG_MODULE, "declined");
                    self.handshake = None;
                    let retry = self.next_attempt(now)?;
                    extend(&mut effects, retry)?;
                }
            }
            EnvelopeCode::Challenge | EnvelopeCode::Accepted => {
                match env.parse_payload() {
                    Ok(EnvelopePayload::Eap(frame)) => {
                        self.on_eap(env, &frame, now, rng, persisted, &mut effects)?;
                    }
                    Ok(EnvelopePayload::Params(params)) => {
                        self.on_params(&params, now, persisted, &mut effects)?;
                    }
                    Ok(EnvelopePayload::Empty) | Err(_) => {
                        log_warn!(self.log, now, LOG_MODULE, "bad payload");
                    }
                }
            }
            EnvelopeCode::Joining => {}
        }
        Ok(effects)
    }

    fn on_eap<R: CryptoRng, P: PersistedAttributes>(
        &mut self,
        env: &Envelope,
        frame: &EapFrame,
        now: Ticks,
        rng: &mut R,
        persisted: &mut P,
        effects: &mut Effects,
    ) -> Result<()> {
        match &frame.body {
            EapBody::First { rand_s, id_s } => self.on_first(env, frame, *rand_s, id_s, now, rng, effects),
            EapBody::Third { .. } => self.on_third(env, frame, now, effects),
            EapBody::Success => self.on_success(now, persisted, effects),
            _ => Ok(()),
        }
    }

    /// First message: derive keys, answer with the peer response
    fn on_first<R: CryptoRng>(
        &mut self,
        env: &Envelope,
        frame: &EapFrame,
        rand_s: [u8; RAND_SIZE],
        id_s: &Vec<u8, MAX_ID_LEN>,
        now: Ticks,
        rng: &mut R,
        effects: &mut Effects,
    ) -> Result<()> {
        // Admission runs in Bootstrapping; a re-authentication to deliver a
        // new group key arrives while Connected
        if !matches!(self.state, ClientState::Bootstrapping | ClientState::Connected) {
            return Ok(());
        }

        let mut rand_p = [0u8; RAND_SIZE];
        rng.fill_bytes(&mut rand_p).map_err(Error::from)?;
        let (ak, kdk) = derive_ak_kdk(&Aes128Key::new(self.config.psk));
        let id_p = *self.ext_addr.as_bytes();
        let mac_p = compute_mac_p(&ak, &id_p, id_s, &rand_s, &rand_p).map_err(Error::from)?;

        self.handshake = Some(Handshake {
            eap_id: frame.identifier,
            rand_s,
            rand_p,
            id_s: id_s.clone(),
            ak,
            kdk,
            tek: None,
            last_nonce: 0,
            pending_short: None,
            pending_gmk: None,
        });

        let mut id = Vec::new();
        id.extend_from_slice(&id_p).map_err(|_| Error::BufferTooSmall)?;
        let second = EapFrame {
            code: EapCode::Response,
            identifier: frame.identifier,
            body: EapBody::Second {
                rand_s,
                rand_p,
                id_p: id,
                mac_p,
            },
        };
        log_info!(self.log, now, LOG_MODULE, "challenge from relay {}", env.relay);
        let reply = Envelope::with_eap(EnvelopeCode::Joining, self.ext_addr, env.relay, &second)?;
        push(effects, Effect::Send(reply))
    }

    /// Third message: authenticate the server, take the parameters, answer
    /// with the protected result
    fn on_third(
        &mut self,
        env: &Envelope,
        frame: &EapFrame,
        now: Ticks,
        effects: &mut Effects,
    ) -> Result<()> {
        let EapBody::Third {
            rand_s,
            mac_s,
            channel,
        } = &frame.body
        else {
            return Ok(());
        };
        let Some(handshake) = self.handshake.as_mut() else {
            return Ok(());
        };
        if frame.identifier != handshake.eap_id
            || !constant_time_eq(rand_s, &handshake.rand_s)
        {
            log_warn!(self.log, now, LOG_MODULE, "stale third message");
            return Ok(());
        }
        let expected =
            compute_mac_s(&handshake.ak, &handshake.id_s, &handshake.rand_p).map_err(Error::from)?;
        if !constant_time_eq(&expected, mac_s) {
            log_warn!(self.log, now, LOG_MODULE, "server mac mismatch");
            return Ok(());
        }
        if channel.nonce == 0
            || channel.nonce <= handshake.last_nonce
            || channel.nonce >= PCHANNEL_NONCE_BOUND
        {
            log_warn!(self.log, now, LOG_MODULE, "nonce out of range");
            return Ok(());
        }

        let tek = derive_tek(&handshake.kdk, &handshake.rand_p);
        let aad = frame.channel_aad()?;
        let data = match channel.open(&tek, &aad) {
            Ok(data) => data,
            Err(_) => {
                log_warn!(self.log, now, LOG_MODULE, "channel auth failed");
                return Ok(());
            }
        };

        let mut results: Vec<ConfigParam, MAX_PARAMS> = Vec::new();
        for param in &data.params {
            let applied = match param {
                ConfigParam::ShortAddress(addr) => {
                    handshake.pending_short = Some(*addr);
                    true
                }
                ConfigParam::Gmk { index, key } => {
                    handshake.pending_gmk = Some((*index, *key));
                    true
                }
                ConfigParam::GmkActivation { .. } => true,
                ConfigParam::ParamResult { .. } => false,
            };
            let result = if applied {
                ParamResult::Success
            } else {
                ParamResult::UnsupportedParam
            };
            results
                .push(ConfigParam::ParamResult {
                    result,
                    attr_id: param.attr_id(),
                })
                .map_err(|_| Error::BufferTooSmall)?;
        }

        let reply_nonce = channel.nonce + 1;
        let mut reply_data = ChannelData::bare(ChannelResult::DoneSuccess);
        reply_data.params = results;

        let mut fourth = EapFrame {
            code: EapCode::Response,
            identifier: handshake.eap_id,
            body: EapBody::Fourth {
                rand_s: handshake.rand_s,
                channel: PChannel::seal(&tek, reply_nonce, &reply_data, b"")?,
            },
        };
        let reply_aad = fourth.channel_aad()?;
        if let EapBody::Fourth { channel, .. } = &mut fourth.body {
            *channel = PChannel::seal(&tek, reply_nonce, &reply_data, &reply_aad)?;
        }

        handshake.last_nonce = reply_nonce;
        handshake.tek = Some(tek);

        let reply = Envelope::with_eap(EnvelopeCode::Joining, self.ext_addr, env.relay, &fourth)?;
        push(effects, Effect::Send(reply))?;

        // A connected device got this exchange purely for key delivery;
        // there is no Success coming, install now
        if self.state == ClientState::Connected {
            if let Some((index, key)) = self.handshake.as_ref().and_then(|h| h.pending_gmk) {
                ClientStats::bump(&mut self.stats.rekeys_applied);
                log_info!(self.log, now, LOG_MODULE, "group key staged in slot {}", index);
                push(effects, Effect::InstallGmk { index, key })?;
            }
            self.handshake = None;
        }
        Ok(())
    }

    /// EAP Success: adopt the delivered attributes and come up
    fn on_success<P: PersistedAttributes>(
        &mut self,
        now: Ticks,
        persisted: &mut P,
        effects: &mut Effects,
    ) -> Result<()> {
        if self.state != ClientState::Bootstrapping {
            return Ok(());
        }
        let Some(handshake) = self.handshake.take() else {
            return Ok(());
        };
        let Some(short_addr) = handshake.pending_short else {
            log_warn!(self.log, now, LOG_MODULE, "accept without address");
            let retry = self.next_attempt(now)?;
            return extend(effects, retry);
        };
        let candidate = self.candidates.get(self.cursor).ok_or(Error::InternalError)?;
        let pan_id = candidate.pan_id;
        let relay = candidate.relay;

        self.short_addr = short_addr;
        self.pan_id = Some(pan_id);
        ClientStats::bump(&mut self.stats.joins_completed);
        log_info!(self.log, now, LOG_MODULE, "joined {} as {}", pan_id, short_addr);

        if let Some((index, key)) = handshake.pending_gmk {
            push(effects, Effect::InstallGmk { index, key })?;
            push(effects, Effect::ActivateGmkIndex(index))?;
            persisted.store(&RestoredNetwork {
                pan_id,
                short_addr,
                gmk_index: index,
                gmk: key,
            });
        }
        push(effects, Effect::SetShortAddress(short_addr))?;
        push(effects, Effect::JoinComplete { pan_id, short_addr })?;

        if self.config.route_discovery {
            self.state = ClientState::Routing;
            push(effects, Effect::StartRouteDiscovery(relay))?;
        } else {
            self.state = ClientState::Connected;
        }
        Ok(())
    }

    fn on_params<P: PersistedAttributes>(
        &mut self,
        params: &[ConfigParam],
        now: Ticks,
        persisted: &mut P,
        effects: &mut Effects,
    ) -> Result<()> {
        if !matches!(self.state, ClientState::Connected | ClientState::Routing) {
            return Ok(());
        }
        let mut results: Vec<ConfigParam, MAX_PARAMS> = Vec::new();
        for param in params {
            match param {
                ConfigParam::GmkActivation { index } => {
                    log_info!(self.log, now, LOG_MODULE, "switching to slot {}", index);
                    push(effects, Effect::ActivateGmkIndex(*index))?;
                    // The key bytes were stored when the slot was delivered;
                    // only the index moves here
                    if let Some(mut stored) = persisted.load() {
                        stored.gmk_index = *index;
                        persisted.store(&stored);
                    }
                    results
                        .push(ConfigParam::ParamResult {
                            result: ParamResult::Success,
                            attr_id: ATTR_GMK_ACTIVATION,
                        })
                        .map_err(|_| Error::BufferTooSmall)?;
                }
                other => {
                    results
                        .push(ConfigParam::ParamResult {
                            result: ParamResult::UnsupportedParam,
                            attr_id: other.attr_id(),
                        })
                        .map_err(|_| Error::BufferTooSmall)?;
                }
            }
        }
        if !results.is_empty() {
            let reply = Envelope::with_params(
                EnvelopeCode::Joining,
                self.ext_addr,
                self.short_addr,
                &results,
            )?;
            push(effects, Effect::Send(reply))?;
        }
        Ok(())
    }

    // =========================================================================
    // Timeout sweep
    // =========================================================================

    /// Run timeout processing
    ///
    /// # Errors
    ///
    /// Propagates internal codec failures.
    pub fn sweep(&mut self, now: Ticks) -> Result<Effects> {
        match self.state {
            ClientState::WaitPanSortRequest
                if self.sort_requested_at.has_elapsed(now, self.config.sort_wait) =>
            {
                // Nobody re-sorted; go with our own order
                self.cursor = 0;
                self.attempts = 0;
                self.begin_attempt(now)
            }
            ClientState::Bootstrapping
                if self.attempt_started_at.has_elapsed(now, self.config.join_timeout) =>
            {
                log_warn!(self.log, now, LOG_MODULE, "join attempt timed out");
                self.handshake = None;
                self.next_attempt(now)
            }
            _ => Ok(Effects::new()),
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Send the join request to the current candidate
    fn begin_attempt(&mut self, now: Ticks) -> Result<Effects> {
        let mut effects = Effects::new();
        let Some(candidate) = self.candidates.get(self.cursor) else {
            log_warn!(self.log, now, LOG_MODULE, "candidates exhausted");
            self.state = ClientState::Disconnected;
            push(&mut effects, Effect::JoinFailed)?;
            return Ok(effects);
        };
        self.state = ClientState::Bootstrapping;
        self.attempt_started_at = now;
        ClientStats::bump(&mut self.stats.join_attempts);
        log_info!(
            self.log,
            now,
            LOG_MODULE,
            "join via relay {} on {}",
            candidate.relay,
            candidate.pan_id
        );
        let join = Envelope::empty(EnvelopeCode::Joining, self.ext_addr, candidate.relay);
        push(&mut effects, Effect::Send(join))?;
        Ok(effects)
    }

    /// Retry the current candidate or move to the next one
    fn next_attempt(&mut self, now: Ticks) -> Result<Effects> {
        self.attempts += 1;
        if self.attempts >= self.config.join_retries {
            self.cursor += 1;
            self.attempts = 0;
        }
        self.begin_attempt(now)
    }

    fn reset_network<P: PersistedAttributes>(&mut self, persisted: &mut P) {
        self.state = ClientState::Disconnected;
        self.handshake = None;
        self.short_addr = ShortAddress::UNASSIGNED;
        self.pan_id = None;
        self.candidates.clear();
        self.cursor = 0;
        self.attempts = 0;
        persisted.clear();
    }
}

impl ClientStats {
    fn bump(counter: &mut u32) {
        *counter = counter.saturating_add(1);
    }
}

fn push(effects: &mut Effects, effect: Effect) -> Result<()> {
    effects.push(effect).map_err(|_| Error::BufferTooSmall)
}

fn extend(effects: &mut Effects, more: Effects) -> Result<()> {
    for effect in more {
        push(effects, effect)?;
    }
    Ok(())
}

// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 GridMesh Systems

//! Coordinator bootstrap server
//!
//! Single-threaded FSM owning the join, device, access and group-key
//! tables. Every entry point takes the current tick and returns the side
//! effects the platform must carry out (frames to transmit, callbacks to
//! raise, attributes to write); the server itself never blocks and never
//! calls back into the platform.

use gm_common::config::BootServerConfig;
use gm_common::constants::{MAX_JOIN_ENTRIES, RAND_SIZE};
use gm_common::log::RingLog;
use gm_common::time::Ticks;
use gm_common::{
    log_info, log_warn, Error, ExtendedAddress, MediaType, PanId, Result, ShortAddress,
};
use gm_crypto::{Aes128Key, CryptoRng};
use heapless::Vec;

use crate::access::{AccessDecision, AccessTable};
use crate::codec::{
    ChannelResult, ConfigParam, EapBody, Envelope, EnvelopeCode, EnvelopePayload, ParamResult,
    ATTR_GMK_ACTIVATION,
};
use crate::device_table::{ConnectionState, DeviceTable};
use crate::join::{admission_params, JoinEntry, JoinState, JoinTable, Purpose};
use crate::rekey::{GmkSlotPair, RekeyError, RekeyPhase, RekeyStep, Rekeyer};

const LOG_MODULE: &str = "boot-srv";
const LOG_CAPACITY: usize = 16;

/// Maximum side effects returned by one entry point
pub const MAX_EFFECTS: usize = 16;

/// Side effects for the platform to carry out
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Transmit this envelope
    Send(Envelope),
    /// Ask the MAC layer to start the PAN
    StartNetwork(PanId),
    /// Ask the policy provider for the PSK of an unprovisioned device
    RequestPsk(ExtendedAddress),
    /// Install a group key into the local MAC key slot
    InstallGmk {
        /// Slot index
        index: u8,
        /// Key bytes
        key: [u8; 16],
    },
    /// Flip the local MAC active key index; answered via `attribute_confirm`
    CommitGmkIndex(u8),
    /// A device completed admission
    NotifyJoin {
        /// Device EUI-64
        ext_addr: ExtendedAddress,
        /// Assigned short address
        short_addr: ShortAddress,
    },
    /// A device left, was kicked, or went silent
    NotifyLeave(ExtendedAddress),
    /// A group-key rotation finished
    RekeyDone(RekeyError),
}

/// Effect list returned by the server entry points
pub type Effects = Vec<Effect, MAX_EFFECTS>;

/// Lifecycle of the server itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerState {
    /// Not serving
    #[default]
    Inactive,
    /// PAN start requested, waiting for the MAC confirm
    WaitNetworkStart,
    /// Serving joins
    Active,
}

/// Coordinator counters, saturating
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    /// Handshakes started
    pub joins_started: u32,
    /// Devices admitted
    pub joins_completed: u32,
    /// Joins refused by policy or protocol failure
    pub joins_declined: u32,
    /// Messages dropped without an answer
    pub silent_discards: u32,
    /// Rotations completed
    pub rekeys_completed: u32,
    /// Rotations rolled back
    pub rekeys_failed: u32,
    /// Devices kicked
    pub kicks: u32,
}

impl ServerStats {
    fn bump(counter: &mut u32) {
        *counter = counter.saturating_add(1);
    }
}

// Sweep action decided while the join table is borrowed, applied after
enum SweepAction {
    PskFallback,
    Resend,
    Abandon,
}

/// The coordinator bootstrap server
pub struct BootServer {
    config: BootServerConfig,
    state: ServerState,
    ext_addr: ExtendedAddress,
    pan_id: PanId,
    joins: JoinTable,
    devices: DeviceTable,
    access: AccessTable,
    gmk: GmkSlotPair,
    rekeyer: Rekeyer,
    pending_kick: Option<ExtendedAddress>,
    next_short: u16,
    next_eap_id: u8,
    stats: ServerStats,
    log: RingLog<LOG_CAPACITY>,
}

impl BootServer {
    /// Create an inactive server
    ///
    /// `ext_addr` doubles as the EAP server identity; `initial_gmk` lands
    /// in key slot 0.
    #[must_use]
    pub fn new(
        config: BootServerConfig,
        ext_addr: ExtendedAddress,
        pan_id: PanId,
        initial_gmk: Aes128Key,
    ) -> Self {
        Self {
            next_short: config.short_addr_base,
            config,
            state: ServerState::Inactive,
            ext_addr,
            pan_id,
            joins: JoinTable::new(),
            devices: DeviceTable::new(),
            access: AccessTable::new(),
            gmk: GmkSlotPair::new(initial_gmk),
            rekeyer: Rekeyer::new(),
            pending_kick: None,
            next_eap_id: 0,
            stats: ServerStats::default(),
            log: RingLog::new(),
        }
    }

    /// Current lifecycle state
    #[must_use]
    pub const fn state(&self) -> ServerState {
        self.state
    }

    /// Counter snapshot
    #[must_use]
    pub const fn stats(&self) -> ServerStats {
        self.stats
    }

    /// The access-policy table, for provisioning
    pub fn access_mut(&mut self) -> &mut AccessTable {
        &mut self.access
    }

    /// The device registry
    #[must_use]
    pub const fn devices(&self) -> &DeviceTable {
        &self.devices
    }

    /// Active group-key slot index
    #[must_use]
    pub const fn gmk_index(&self) -> u8 {
        self.gmk.active_index()
    }

    /// Drain the trace log
    pub fn log_mut(&mut self) -> &mut RingLog<LOG_CAPACITY> {
        &mut self.log
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Bring the PAN up
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidState` unless the server is inactive.
    pub fn start(&mut self, now: Ticks) -> Result<Effects> {
        if self.state != ServerState::Inactive {
            return Err(Error::InvalidState);
        }
        self.state = ServerState::WaitNetworkStart;
        log_info!(self.log, now, LOG_MODULE, "starting {}", self.pan_id);
        let mut effects = Effects::new();
        push(&mut effects, Effect::StartNetwork(self.pan_id))?;
        Ok(effects)
    }

    /// MAC confirm for the PAN start
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidState` unless a start is pending.
    pub fn network_start_confirm(&mut self, success: bool, now: Ticks) -> Result<()> {
        if self.state != ServerState::WaitNetworkStart {
            return Err(Error::InvalidState);
        }
        self.state = if success {
            ServerState::Active
        } else {
            ServerState::Inactive
        };
        log_info!(self.log, now, LOG_MODULE, "pan start ok={}", success);
        Ok(())
    }

    /// Stop serving; in-flight handshakes are dropped
    pub fn stop(&mut self) {
        self.state = ServerState::Inactive;
        self.joins = JoinTable::new();
        self.rekeyer = Rekeyer::new();
        self.pending_kick = None;
        self.gmk.revert_pending();
    }

    // =========================================================================
    // Envelope handling
    // =========================================================================

    /// Handle a received bootstrapping envelope
    ///
    /// Silent-discard conditions (bad MAC, stale challenge, bad nonce)
    /// produce an empty effect list and a counter bump, never an error to
    /// the caller and never a frame to the wire.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidState` when the server is not active.
    pub fn on_envelope<R: CryptoRng>(
        &mut self,
        env: &Envelope,
        media: MediaType,
        now: Ticks,
        rng: &mut R,
    ) -> Result<Effects> {
        if self.state != ServerState::Active {
            return Err(Error::InvalidState);
        }
        let mut effects = Effects::new();

        // A device announces its own departure with a Kick envelope
        if env.code == EnvelopeCode::Kick {
            if self.devices.remove(&env.target).is_ok() {
                self.joins.remove(&env.target);
                log_info!(self.log, now, LOG_MODULE, "{} left", env.target);
                push(&mut effects, Effect::NotifyLeave(env.target))?;
            }
            return Ok(effects);
        }
        if env.code != EnvelopeCode::Joining {
            self.discard(now, "unexpected code");
            return Ok(effects);
        }
        self.devices.heartbeat(&env.target, now);

        let payload = match env.parse_payload() {
            Ok(payload) => payload,
            Err(err) => {
                log_warn!(self.log, now, LOG_MODULE, "bad payload: {}", err);
                self.discard(now, "malformed");
                return Ok(effects);
            }
        };

        match payload {
            EnvelopePayload::Empty => {
                self.on_join_request(env, media, now, rng, &mut effects)?;
            }
            EnvelopePayload::Eap(frame) => match &frame.body {
                EapBody::Second { .. } => {
                    self.on_second(env, &frame, now, &mut effects)?;
                }
                EapBody::Fourth { .. } => {
                    self.on_fourth(env, &frame, now, rng, &mut effects)?;
                }
                _ => self.discard(now, "unexpected eap body"),
            },
            EnvelopePayload::Params(params) => {
                self.on_param_result(env, &params, now, rng, &mut effects)?;
            }
        }
        Ok(effects)
    }

    fn on_join_request<R: CryptoRng>(
        &mut self,
        env: &Envelope,
        media: MediaType,
        now: Ticks,
        rng: &mut R,
        effects: &mut Effects,
    ) -> Result<()> {
        let ext_addr = env.target;

        // A joiner that moved to a different relay mid-handshake gets one
        // refusal and a clean slate
        if let Some(existing) = self.joins.get(&ext_addr) {
            if existing.relay != env.relay {
                log_warn!(self.log, now, LOG_MODULE, "relay moved for {}", ext_addr);
                self.joins.remove(&ext_addr);
                return self.decline(env, effects);
            }
        }

        if self.joins.get(&ext_addr).is_none() && self.joins.len() >= MAX_JOIN_ENTRIES {
            log_warn!(self.log, now, LOG_MODULE, "join table full, refusing {}", ext_addr);
            return self.decline(env, effects);
        }

        if self.devices.begin_bootstrap(ext_addr, media, now).is_err() {
            log_warn!(self.log, now, LOG_MODULE, "device table full, refusing {}", ext_addr);
            return self.decline(env, effects);
        }

        match self.access.check(self.config.access_mode, &ext_addr) {
            AccessDecision::Deny => {
                ServerStats::bump(&mut self.stats.joins_declined);
                log_info!(self.log, now, LOG_MODULE, "policy refused {}", ext_addr);
                self.decline(env, effects)
            }
            AccessDecision::Allow { psk, short_addr } => {
                let mut entry = self.new_entry(env, media, Purpose::Admission, now, rng)?;
                entry.short_addr = Some(match short_addr {
                    Some(pinned) => pinned,
                    None => self.allocate_short()?,
                });
                entry.set_psk(psk, now);
                self.begin_handshake(entry, now, effects)
            }
            AccessDecision::Unknown => {
                let entry = self.new_entry(env, media, Purpose::Admission, now, rng)?;
                let ext = entry.ext_addr;
                self.joins.insert(entry)?;
                log_info!(self.log, now, LOG_MODULE, "psk lookup for {}", ext);
                push(effects, Effect::RequestPsk(ext))
            }
        }
    }

    fn on_second(
        &mut self,
        env: &Envelope,
        frame: &crate::codec::EapFrame,
        now: Ticks,
        effects: &mut Effects,
    ) -> Result<()> {
        let id_s = *self.ext_addr.as_bytes();
        if self.relay_moved(env, now, effects)? {
            return Ok(());
        }
        let Some(entry) = self.joins.get_mut(&env.target) else {
            self.discard(now, "no exchange");
            return Ok(());
        };
        if let Err(err) = entry.handle_second(frame, &id_s, now) {
            self.discard(now, err.description());
            return Ok(());
        }

        let params = match self.joins.get(&env.target).map(|e| e.purpose) {
            Some(Purpose::Admission) => {
                let entry = self.joins.get(&env.target).ok_or(Error::InternalError)?;
                let short = entry.short_addr.ok_or(Error::InternalError)?;
                admission_params(short, self.gmk.active_index(), self.gmk.active_key()?.as_bytes())
            }
            Some(Purpose::Rekey) => {
                let index = self.gmk.pending_index().ok_or(Error::InvalidState)?;
                let key = *self.gmk.pending_key()?.as_bytes();
                let mut params = Vec::new();
                let _ = params.push(ConfigParam::Gmk { index, key });
                params
            }
            None => return Err(Error::InternalError),
        };

        let entry = self.joins.get_mut(&env.target).ok_or(Error::InternalError)?;
        let third = entry.third_frame(&id_s, &params)?;
        let send = Envelope::with_eap(EnvelopeCode::Challenge, env.target, entry.relay, &third)?;
        push(effects, Effect::Send(send))
    }

    fn on_fourth<R: CryptoRng>(
        &mut self,
        env: &Envelope,
        frame: &crate::codec::EapFrame,
        now: Ticks,
        rng: &mut R,
        effects: &mut Effects,
    ) -> Result<()> {
        if self.relay_moved(env, now, effects)? {
            return Ok(());
        }
        let Some(entry) = self.joins.get_mut(&env.target) else {
            self.discard(now, "no exchange");
            return Ok(());
        };
        let purpose = entry.purpose;
        let data = match entry.handle_fourth(frame) {
            Ok(data) => data,
            Err(err) => {
                self.discard(now, err.description());
                return Ok(());
            }
        };

        let param_failure = data
            .params
            .iter()
            .any(|p| matches!(p, ConfigParam::ParamResult { result, .. } if *result != ParamResult::Success));
        let accepted = data.result == ChannelResult::DoneSuccess && !param_failure;

        match (purpose, accepted) {
            (Purpose::Admission, true) => {
                // Admission finalizes in send_confirm, once the success
                // frame is known to have left the coordinator
                let entry = self.joins.get_mut(&env.target).ok_or(Error::InternalError)?;
                let success = entry.success_frame();
                let accept =
                    Envelope::with_eap(EnvelopeCode::Accepted, env.target, entry.relay, &success)?;
                entry.transition(JoinState::WaitConfirm, now);
                log_info!(self.log, now, LOG_MODULE, "accept sent to {}", env.target);
                push(effects, Effect::Send(accept))
            }
            (Purpose::Admission, false) => {
                self.joins.remove(&env.target);
                let _ = self.devices.remove(&env.target);
                ServerStats::bump(&mut self.stats.joins_declined);
                log_warn!(self.log, now, LOG_MODULE, "{} reported failure", env.target);
                self.decline(env, effects)
            }
            (Purpose::Rekey, true) => {
                self.joins.remove(&env.target);
                let step = self.rekeyer.device_done()?;
                self.perform_step(step, now, rng, effects)
            }
            (Purpose::Rekey, false) => {
                self.joins.remove(&env.target);
                let error = if param_failure {
                    RekeyError::Param
                } else {
                    RekeyError::FourthMessage
                };
                self.rekey_fail(error, now, effects)
            }
        }
    }

    fn on_param_result<R: CryptoRng>(
        &mut self,
        env: &Envelope,
        params: &[ConfigParam],
        now: Ticks,
        rng: &mut R,
        effects: &mut Effects,
    ) -> Result<()> {
        let Some(entry) = self.joins.get(&env.target) else {
            self.discard(now, "no exchange");
            return Ok(());
        };
        if entry.state != JoinState::WaitParam || entry.purpose != Purpose::Rekey {
            self.discard(now, "unexpected params");
            return Ok(());
        }

        let confirmed = params.iter().any(|p| {
            matches!(
                p,
                ConfigParam::ParamResult {
                    result: ParamResult::Success,
                    attr_id: ATTR_GMK_ACTIVATION,
                }
            )
        });

        self.joins.remove(&env.target);
        if confirmed {
            let step = self.rekeyer.device_done()?;
            self.perform_step(step, now, rng, effects)
        } else {
            self.rekey_fail(RekeyError::Param, now, effects)
        }
    }

    // =========================================================================
    // Operator / platform entry points
    // =========================================================================

    /// Answer to a previous `Effect::RequestPsk`; `None` refuses the device
    ///
    /// # Errors
    ///
    /// Returns `Error::NotFound` when no exchange is waiting for a PSK.
    pub fn psk_response(
        &mut self,
        ext_addr: &ExtendedAddress,
        psk: Option<Aes128Key>,
        now: Ticks,
    ) -> Result<Effects> {
        let mut effects = Effects::new();
        let entry = self.joins.get_mut(ext_addr).ok_or(Error::NotFound)?;
        if entry.state != JoinState::WaitPsk {
            return Err(Error::InvalidState);
        }
        match psk {
            Some(psk) => {
                entry.set_psk(psk, now);
                let mut entry = self.joins.remove(ext_addr).ok_or(Error::InternalError)?;
                entry.short_addr = Some(self.allocate_short()?);
                self.begin_handshake(entry, now, &mut effects)?;
            }
            None => {
                let entry = self.joins.remove(ext_addr).ok_or(Error::InternalError)?;
                let _ = self.devices.remove(ext_addr);
                ServerStats::bump(&mut self.stats.joins_declined);
                let env = Envelope::empty(EnvelopeCode::Decline, *ext_addr, entry.relay);
                push(&mut effects, Effect::Send(env))?;
            }
        }
        Ok(effects)
    }

    /// Kick a connected device off the network
    ///
    /// # Errors
    ///
    /// `Error::Busy` while a key rotation is in flight, `Error::NotFound`
    /// for unknown or disconnected devices.
    pub fn kick(&mut self, ext_addr: &ExtendedAddress, now: Ticks) -> Result<Effects> {
        if self.state != ServerState::Active {
            return Err(Error::InvalidState);
        }
        if self.rekeyer.is_active() || self.pending_kick.is_some() {
            return Err(Error::Busy);
        }
        let record = self.devices.get(ext_addr).ok_or(Error::NotFound)?;
        if record.state != ConnectionState::Connected {
            return Err(Error::NotFound);
        }
        let relay = record.short_addr;

        // The registry entry survives until the Kick transmission confirms
        self.joins.remove(ext_addr);
        self.pending_kick = Some(*ext_addr);
        log_info!(self.log, now, LOG_MODULE, "kicking {}", ext_addr);
        let mut effects = Effects::new();
        push(
            &mut effects,
            Effect::Send(Envelope::empty(EnvelopeCode::Kick, *ext_addr, relay)),
        )?;
        Ok(effects)
    }

    /// Transport confirm for a previously sent Accepted or Kick envelope
    ///
    /// An admission completes only once the success frame made it onto the
    /// wire; a kick removes the device only once the Kick envelope did. A
    /// failed transmission drops the pending operation without the
    /// completion callback.
    ///
    /// # Errors
    ///
    /// `Error::NotFound` when nothing is waiting on a confirm for the
    /// device, `Error::InvalidState` when its exchange is mid-handshake.
    pub fn send_confirm(
        &mut self,
        ext_addr: &ExtendedAddress,
        success: bool,
        now: Ticks,
    ) -> Result<Effects> {
        let mut effects = Effects::new();
        if self.pending_kick == Some(*ext_addr) {
            self.pending_kick = None;
            if success {
                self.devices.remove(ext_addr)?;
                ServerStats::bump(&mut self.stats.kicks);
                log_info!(self.log, now, LOG_MODULE, "kicked {}", ext_addr);
                push(&mut effects, Effect::NotifyLeave(*ext_addr))?;
            } else {
                log_warn!(self.log, now, LOG_MODULE, "kick send failed for {}", ext_addr);
            }
            return Ok(effects);
        }

        let entry = self.joins.get(ext_addr).ok_or(Error::NotFound)?;
        if entry.state != JoinState::WaitConfirm {
            return Err(Error::InvalidState);
        }
        if success {
            let entry = self.joins.remove(ext_addr).ok_or(Error::InternalError)?;
            let short = entry.short_addr.ok_or(Error::InternalError)?;
            let psk = entry.psk().cloned().ok_or(Error::InternalError)?;
            self.devices.promote(ext_addr, short, psk, now)?;
            ServerStats::bump(&mut self.stats.joins_completed);
            log_info!(self.log, now, LOG_MODULE, "{} joined as {}", ext_addr, short);
            push(
                &mut effects,
                Effect::NotifyJoin {
                    ext_addr: *ext_addr,
                    short_addr: short,
                },
            )?;
        } else {
            self.joins.remove(ext_addr);
            let _ = self.devices.remove(ext_addr);
            ServerStats::bump(&mut self.stats.joins_declined);
            log_warn!(self.log, now, LOG_MODULE, "accept send failed for {}", ext_addr);
        }
        Ok(effects)
    }

    /// Begin rotating the group key to `new_gmk`
    ///
    /// # Errors
    ///
    /// `Error::Busy` while another rotation is staged or running.
    pub fn rekey_start<R: CryptoRng>(
        &mut self,
        new_gmk: Aes128Key,
        now: Ticks,
        rng: &mut R,
    ) -> Result<Effects> {
        if self.state != ServerState::Active {
            return Err(Error::InvalidState);
        }
        let index = self.gmk.install_pending(new_gmk)?;
        let key = *self.gmk.pending_key()?.as_bytes();

        let mut effects = Effects::new();
        push(&mut effects, Effect::InstallGmk { index, key })?;

        let snapshot = self.devices.connected();
        log_info!(
            self.log,
            now,
            LOG_MODULE,
            "rekey to slot {} over {} devices",
            index,
            snapshot.len()
        );
        let step = match self.rekeyer.start(snapshot, index) {
            Ok(step) => step,
            Err(err) => {
                self.gmk.revert_pending();
                return Err(err);
            }
        };
        self.perform_step(step, now, rng, &mut effects)?;
        Ok(effects)
    }

    /// Platform confirm for a previous `Effect::CommitGmkIndex`
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidState` when no commit is outstanding.
    pub fn attribute_confirm(&mut self, success: bool, now: Ticks) -> Result<Effects> {
        let mut effects = Effects::new();
        if self.rekeyer.phase() != RekeyPhase::WaitIndexConfirm {
            return Err(Error::InvalidState);
        }
        if success {
            self.gmk.commit_pending()?;
            self.rekeyer.index_confirmed()?;
            ServerStats::bump(&mut self.stats.rekeys_completed);
            log_info!(self.log, now, LOG_MODULE, "rekey done, active slot {}", self.gmk.active_index());
            push(&mut effects, Effect::RekeyDone(RekeyError::None))?;
        } else {
            self.rekey_fail(RekeyError::SetAttribute, now, &mut effects)?;
        }
        Ok(effects)
    }

    /// Abort an in-flight rotation
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidState` when no rotation is running.
    pub fn rekey_abort(&mut self, now: Ticks) -> Result<Effects> {
        if !self.rekeyer.is_active() {
            return Err(Error::InvalidState);
        }
        let mut effects = Effects::new();
        if let Some(current) = self.rekeyer.current_device() {
            self.joins.remove(&current);
        }
        self.rekey_fail(RekeyError::Abort, now, &mut effects)?;
        Ok(effects)
    }

    // =========================================================================
    // Timeout sweep
    // =========================================================================

    /// Run timeout processing; call every `config.sweep_period`
    ///
    /// # Errors
    ///
    /// Propagates internal codec or crypto failures.
    pub fn sweep<R: CryptoRng>(&mut self, now: Ticks, rng: &mut R) -> Result<Effects> {
        let mut effects = Effects::new();
        if self.state != ServerState::Active {
            return Ok(effects);
        }

        let mut actions: Vec<(ExtendedAddress, SweepAction), MAX_JOIN_ENTRIES> = Vec::new();
        for entry in self.joins.iter() {
            let action = if entry.started_at.has_elapsed(now, self.config.handshake_ttl) {
                Some(SweepAction::Abandon)
            } else if entry.state == JoinState::WaitPsk {
                if entry.stage_started_at.has_elapsed(now, self.config.psk_deadline) {
                    if entry.psk_fallback_used {
                        Some(SweepAction::Abandon)
                    } else {
                        Some(SweepAction::PskFallback)
                    }
                } else {
                    None
                }
            } else {
                // Rekeying exchanges run under their own per-phase deadlines
                let (stage_timeout, retry_bound) = match entry.purpose {
                    Purpose::Admission => (self.config.retry_timeout, self.config.max_retries),
                    Purpose::Rekey => {
                        (self.config.rekey.phase_timeout, self.config.rekey.max_retries)
                    }
                };
                if entry.stage_started_at.has_elapsed(now, stage_timeout) {
                    if entry.retries >= retry_bound {
                        Some(SweepAction::Abandon)
                    } else {
                        Some(SweepAction::Resend)
                    }
                } else {
                    None
                }
            };
            if let Some(action) = action {
                // Same capacity as the join table, push cannot fail
                let _ = actions.push((entry.ext_addr, action));
            }
        }

        for (ext_addr, action) in actions {
            match action {
                SweepAction::PskFallback => self.apply_psk_fallback(&ext_addr, now, &mut effects)?,
                SweepAction::Resend => self.resend(&ext_addr, now, &mut effects)?,
                SweepAction::Abandon => self.abandon(&ext_addr, now, rng, &mut effects)?,
            }
        }

        for ext_addr in self.devices.expire(now, self.config.device_ttl) {
            log_info!(self.log, now, LOG_MODULE, "{} went silent", ext_addr);
            push(&mut effects, Effect::NotifyLeave(ext_addr))?;
        }
        Ok(effects)
    }

    fn apply_psk_fallback(
        &mut self,
        ext_addr: &ExtendedAddress,
        now: Ticks,
        effects: &mut Effects,
    ) -> Result<()> {
        let default_psk = Aes128Key::new(self.config.default_psk);
        let short = self.allocate_short()?;
        let entry = self.joins.get_mut(ext_addr).ok_or(Error::InternalError)?;
        entry.psk_fallback_used = true;
        entry.short_addr = Some(short);
        entry.set_psk(default_psk, now);
        log_info!(self.log, now, LOG_MODULE, "default psk for {}", ext_addr);

        let mut entry = self.joins.remove(ext_addr).ok_or(Error::InternalError)?;
        // begin_handshake reinserts; keep the fallback flag intact
        entry.psk_fallback_used = true;
        self.begin_handshake(entry, now, effects)
    }

    fn resend(&mut self, ext_addr: &ExtendedAddress, now: Ticks, effects: &mut Effects) -> Result<()> {
        let id_s = *self.ext_addr.as_bytes();
        let index = self.gmk.pending_index();
        let entry = self.joins.get_mut(ext_addr).ok_or(Error::InternalError)?;
        entry.retries += 1;
        entry.stage_started_at = now;

        let frame_env = match entry.state {
            JoinState::WaitSecond => {
                let frame = entry.first_frame(&id_s)?;
                Some(Envelope::with_eap(EnvelopeCode::Challenge, entry.ext_addr, entry.relay, &frame)?)
            }
            JoinState::WaitParam => {
                let index = index.ok_or(Error::InvalidState)?;
                Some(Envelope::with_params(
                    EnvelopeCode::Challenge,
                    entry.ext_addr,
                    entry.relay,
                    &[ConfigParam::GmkActivation { index }],
                )?)
            }
            JoinState::WaitConfirm => {
                let frame = entry.success_frame();
                Some(Envelope::with_eap(EnvelopeCode::Accepted, entry.ext_addr, entry.relay, &frame)?)
            }
            // The third message cannot be replayed under a fresh nonce
            // cheaply; the entry waits out its retry budget instead
            _ => None,
        };
        if let Some(env) = frame_env {
            log_info!(self.log, now, LOG_MODULE, "resend to {}", ext_addr);
            push(effects, Effect::Send(env))?;
        }
        Ok(())
    }

    fn abandon<R: CryptoRng>(
        &mut self,
        ext_addr: &ExtendedAddress,
        now: Ticks,
        _rng: &mut R,
        effects: &mut Effects,
    ) -> Result<()> {
        let Some(entry) = self.joins.remove(ext_addr) else {
            return Ok(());
        };
        log_warn!(self.log, now, LOG_MODULE, "{} timed out", ext_addr);
        match entry.purpose {
            Purpose::Admission => {
                let _ = self.devices.remove(ext_addr);
                ServerStats::bump(&mut self.stats.joins_declined);
                let env = Envelope::empty(EnvelopeCode::Decline, *ext_addr, entry.relay);
                push(effects, Effect::Send(env))
            }
            Purpose::Rekey => {
                let error = match entry.state {
                    JoinState::WaitSecond => RekeyError::SecondMessage,
                    JoinState::WaitFourth => RekeyError::FourthMessage,
                    JoinState::WaitParam => RekeyError::Param,
                    JoinState::WaitPsk | JoinState::WaitConfirm => RekeyError::Procedure,
                };
                self.rekey_fail(error, now, effects)
            }
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn new_entry<R: CryptoRng>(
        &mut self,
        env: &Envelope,
        media: MediaType,
        purpose: Purpose,
        now: Ticks,
        rng: &mut R,
    ) -> Result<JoinEntry> {
        let mut rand_s = [0u8; RAND_SIZE];
        rng.fill_bytes(&mut rand_s).map_err(Error::from)?;
        self.next_eap_id = self.next_eap_id.wrapping_add(1);
        Ok(JoinEntry::new(
            env.target,
            env.relay,
            media,
            purpose,
            self.next_eap_id,
            rand_s,
            now,
        ))
    }

    /// Insert the entry and send the first message
    fn begin_handshake(&mut self, entry: JoinEntry, now: Ticks, effects: &mut Effects) -> Result<()> {
        let id_s = *self.ext_addr.as_bytes();
        let frame = entry.first_frame(&id_s)?;
        let env = Envelope::with_eap(EnvelopeCode::Challenge, entry.ext_addr, entry.relay, &frame)?;
        // Counted here, once per admission, whichever path supplied the PSK
        if entry.purpose == Purpose::Admission {
            ServerStats::bump(&mut self.stats.joins_started);
        }
        log_info!(self.log, now, LOG_MODULE, "challenge to {}", entry.ext_addr);
        self.joins.insert(entry)?;
        push(effects, Effect::Send(env))
    }

    fn perform_step<R: CryptoRng>(
        &mut self,
        step: RekeyStep,
        now: Ticks,
        rng: &mut R,
        effects: &mut Effects,
    ) -> Result<()> {
        match step {
            RekeyStep::Deliver(ext_addr) => {
                let Some(record) = self.devices.get(&ext_addr) else {
                    // Device vanished between snapshot and delivery
                    return self.rekey_fail(RekeyError::Procedure, now, effects);
                };
                let relay = record.short_addr;
                let media = record.media;
                // Rekeying reuses the key the device authenticated with
                let Some(psk) = record.psk.clone() else {
                    return self.rekey_fail(RekeyError::Procedure, now, effects);
                };

                let probe = Envelope::empty(EnvelopeCode::Challenge, ext_addr, relay);
                let mut entry = self.new_entry(&probe, media, Purpose::Rekey, now, rng)?;
                entry.set_psk(psk, now);
                if self.joins.get(&ext_addr).is_none() && self.joins.len() >= MAX_JOIN_ENTRIES {
                    return self.rekey_fail(RekeyError::TableFull, now, effects);
                }
                self.begin_handshake(entry, now, effects)
            }
            RekeyStep::Activate(ext_addr) => {
                let Some(record) = self.devices.get(&ext_addr) else {
                    return self.rekey_fail(RekeyError::Procedure, now, effects);
                };
                let relay = record.short_addr;
                let media = record.media;
                let index = self.rekeyer.new_index();

                let probe = Envelope::empty(EnvelopeCode::Challenge, ext_addr, relay);
                let mut entry = self.new_entry(&probe, media, Purpose::Rekey, now, rng)?;
                entry.transition(JoinState::WaitParam, now);
                self.joins.insert(entry)?;

                let env = Envelope::with_params(
                    EnvelopeCode::Challenge,
                    ext_addr,
                    relay,
                    &[ConfigParam::GmkActivation { index }],
                )?;
                push(effects, Effect::Send(env))
            }
            RekeyStep::CommitIndex(index) => push(effects, Effect::CommitGmkIndex(index)),
        }
    }

    fn rekey_fail(&mut self, error: RekeyError, now: Ticks, effects: &mut Effects) -> Result<()> {
        let old_index = self.gmk.active_index();
        let rollback = self.rekeyer.fail(error);
        log_warn!(self.log, now, LOG_MODULE, "rekey failed: {:?}", error);

        for ext_addr in &rollback {
            let Some(record) = self.devices.get(ext_addr) else {
                continue;
            };
            let env = Envelope::with_params(
                EnvelopeCode::Challenge,
                *ext_addr,
                record.short_addr,
                &[ConfigParam::GmkActivation { index: old_index }],
            )?;
            // Rollback is fire-and-forget; an overflowing effect list drops
            // the remaining targets
            if effects.push(Effect::Send(env)).is_err() {
                break;
            }
        }
        if self.rekeyer.phase() == RekeyPhase::DeactivateGmk {
            self.rekeyer.rollback_done()?;
        }
        self.gmk.revert_pending();
        ServerStats::bump(&mut self.stats.rekeys_failed);
        push(effects, Effect::RekeyDone(error))
    }

    /// Enforce relay continuity for an in-flight exchange
    ///
    /// Every message of a handshake must arrive through the relay the
    /// exchange started on. An admission that moved is refused and reset;
    /// a moved rekey message is dropped and the entry waits out its
    /// timeout.
    fn relay_moved(&mut self, env: &Envelope, now: Ticks, effects: &mut Effects) -> Result<bool> {
        let Some(entry) = self.joins.get(&env.target) else {
            return Ok(false);
        };
        if entry.relay == env.relay {
            return Ok(false);
        }
        log_warn!(self.log, now, LOG_MODULE, "relay moved for {}", env.target);
        if entry.purpose == Purpose::Admission {
            self.joins.remove(&env.target);
            let _ = self.devices.remove(&env.target);
            ServerStats::bump(&mut self.stats.joins_declined);
            self.decline(env, effects)?;
        } else {
            self.discard(now, "relay moved");
        }
        Ok(true)
    }

    fn decline(&mut self, env: &Envelope, effects: &mut Effects) -> Result<()> {
        let reply = Envelope::empty(EnvelopeCode::Decline, env.target, env.relay);
        push(effects, Effect::Send(reply))
    }

    fn discard(&mut self, _now: Ticks, _reason: &str) {
        ServerStats::bump(&mut self.stats.silent_discards);
    }

    fn allocate_short(&mut self) -> Result<ShortAddress> {
        for _ in 0..u16::MAX {
            let candidate = ShortAddress::new(self.next_short);
            self.next_short = self.next_short.wrapping_add(1);
            if self.next_short == ShortAddress::UNASSIGNED.value() || self.next_short == 0 {
                self.next_short = self.config.short_addr_base;
            }
            if candidate.is_assigned()
                && candidate != ShortAddress::COORDINATOR
                && !self.devices.short_addr_in_use(candidate)
                && !self
                    .joins
                    .iter()
                    .any(|e| e.short_addr == Some(candidate))
            {
                return Ok(candidate);
            }
        }
        Err(Error::TableFull)
    }
}

fn push(effects: &mut Effects, effect: Effect) -> Result<()> {
    effects.push(effect).map_err(|_| Error::BufferTooSmall)
}

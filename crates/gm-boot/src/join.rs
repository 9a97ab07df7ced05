// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 GridMesh Systems

//! Per-device handshake entries on the coordinator side
//!
//! A `JoinEntry` tracks one in-flight EAP-PSK exchange: the server
//! challenge, the keys derived along the way, and where in the exchange the
//! device currently is. The coordinator drives entries from its envelope
//! handler; this module only validates and produces protocol messages.

use gm_common::constants::{MAX_ID_LEN, MAX_JOIN_ENTRIES, PCHANNEL_NONCE_BOUND, RAND_SIZE};
use gm_common::time::Ticks;
use gm_common::{Error, ExtendedAddress, MediaType, Result, ShortAddress};
use gm_crypto::{constant_time_eq, Aes128Key};
use heapless::Vec;
use zeroize::Zeroize;

use crate::codec::{
    ChannelData, ChannelResult, ConfigParam, EapBody, EapCode, EapFrame, PChannel, MAX_PARAMS,
};
use crate::keys::{compute_mac_p, compute_mac_s, derive_ak_kdk, derive_tek, Ak, Kdk, Tek};

/// Why this exchange is running
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    /// First-time admission of a device
    Admission,
    /// Re-authentication to deliver a new group key
    Rekey,
}

/// Stage of the exchange, from the coordinator's point of view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinState {
    /// Waiting for the operator to supply the device PSK
    WaitPsk,
    /// First message sent, waiting for the peer response
    WaitSecond,
    /// Third message sent, waiting for the peer result
    WaitFourth,
    /// Parameter sent outside the handshake, waiting for its result
    WaitParam,
    /// Success frame sent, waiting for the transport confirm
    WaitConfirm,
}

/// One in-flight exchange
pub struct JoinEntry {
    /// Device EUI-64
    pub ext_addr: ExtendedAddress,
    /// Relay short address to answer through
    pub relay: ShortAddress,
    /// Medium the exchange runs on
    pub media: MediaType,
    /// Admission or rekey
    pub purpose: Purpose,
    /// Current stage
    pub state: JoinState,
    /// EAP identifier of the outstanding request
    pub eap_id: u8,
    /// When the exchange began
    pub started_at: Ticks,
    /// When the current stage began, reset on every transition
    pub stage_started_at: Ticks,
    /// Resend attempts for the outstanding message
    pub retries: u8,
    /// Whether the default PSK was substituted after the operator deadline
    pub psk_fallback_used: bool,
    /// Short address selected for the device
    pub short_addr: Option<ShortAddress>,
    psk: Option<Aes128Key>,
    rand_s: [u8; RAND_SIZE],
    rand_p: [u8; RAND_SIZE],
    id_p: Vec<u8, MAX_ID_LEN>,
    ak: Option<Ak>,
    kdk: Option<Kdk>,
    tek: Option<Tek>,
    next_nonce: u32,
}

impl Drop for JoinEntry {
    fn drop(&mut self) {
        self.rand_s.zeroize();
        self.rand_p.zeroize();
    }
}

impl JoinEntry {
    /// Create an entry at the start of an exchange
    #[must_use]
    pub fn new(
        ext_addr: ExtendedAddress,
        relay: ShortAddress,
        media: MediaType,
        purpose: Purpose,
        eap_id: u8,
        rand_s: [u8; RAND_SIZE],
        now: Ticks,
    ) -> Self {
        Self {
            ext_addr,
            relay,
            media,
            purpose,
            state: JoinState::WaitPsk,
            eap_id,
            started_at: now,
            stage_started_at: now,
            retries: 0,
            psk_fallback_used: false,
            short_addr: None,
            psk: None,
            rand_s,
            rand_p: [0; RAND_SIZE],
            id_p: Vec::new(),
            ak: None,
            kdk: None,
            tek: None,
            next_nonce: 1,
        }
    }

    /// The PSK the exchange runs under, once installed
    #[must_use]
    pub fn psk(&self) -> Option<&Aes128Key> {
        self.psk.as_ref()
    }

    /// Install the device PSK and move to waiting for the peer response
    pub fn set_psk(&mut self, psk: Aes128Key, now: Ticks) {
        self.psk = Some(psk);
        self.transition(JoinState::WaitSecond, now);
    }

    /// Enter a new stage, resetting the stage clock and retry counter
    pub fn transition(&mut self, state: JoinState, now: Ticks) {
        self.state = state;
        self.stage_started_at = now;
        self.retries = 0;
    }

    /// Build the first message of the exchange
    ///
    /// # Errors
    ///
    /// Returns a codec error if `id_s` exceeds the identity limit.
    pub fn first_frame(&self, id_s: &[u8]) -> Result<EapFrame> {
        let mut id = Vec::new();
        id.extend_from_slice(id_s).map_err(|_| Error::BufferTooSmall)?;
        Ok(EapFrame {
            code: EapCode::Request,
            identifier: self.eap_id,
            body: EapBody::First {
                rand_s: self.rand_s,
                id_s: id,
            },
        })
    }

    /// Validate the peer response and derive the session keys
    ///
    /// All failures here are silent-discard conditions: the challenge echo
    /// must match and MAC_P must verify under the installed PSK.
    ///
    /// # Errors
    ///
    /// `Error::InvalidState` when no response is expected,
    /// `Error::ValidationFailed` on a challenge mismatch,
    /// `Error::MacMismatch` when MAC_P does not verify.
    pub fn handle_second(&mut self, frame: &EapFrame, id_s: &[u8], now: Ticks) -> Result<()> {
        if self.state != JoinState::WaitSecond {
            return Err(Error::InvalidState);
        }
        let EapBody::Second {
            rand_s,
            rand_p,
            id_p,
            mac_p,
        } = &frame.body
        else {
            return Err(Error::UnexpectedMessage);
        };
        if frame.identifier != self.eap_id {
            return Err(Error::ValidationFailed);
        }
        if !constant_time_eq(rand_s, &self.rand_s) {
            return Err(Error::ValidationFailed);
        }
        let psk = self.psk.as_ref().ok_or(Error::InvalidState)?;
        let (ak, kdk) = derive_ak_kdk(psk);
        let expected = compute_mac_p(&ak, id_p, id_s, &self.rand_s, rand_p)
            .map_err(Error::from)?;
        if !constant_time_eq(&expected, mac_p) {
            return Err(Error::MacMismatch);
        }

        self.rand_p = *rand_p;
        self.id_p = id_p.clone();
        self.tek = Some(derive_tek(&kdk, rand_p));
        self.ak = Some(ak);
        self.kdk = Some(kdk);
        self.transition(JoinState::WaitFourth, now);
        Ok(())
    }

    /// Build the third message carrying `params` in the protected channel
    ///
    /// # Errors
    ///
    /// Propagates crypto and codec errors.
    pub fn third_frame(&mut self, id_s: &[u8], params: &[ConfigParam]) -> Result<EapFrame> {
        let ak = self.ak.as_ref().ok_or(Error::InvalidState)?;
        let tek = self.tek.as_ref().ok_or(Error::InvalidState)?;
        let mac_s = compute_mac_s(ak, id_s, &self.rand_p).map_err(Error::from)?;

        let mut data = ChannelData::bare(ChannelResult::DoneSuccess);
        for param in params {
            data.params.push(param.clone()).map_err(|_| Error::BufferTooSmall)?;
        }

        let nonce = self.next_nonce;
        // Seal twice: once to size the frame, once against its real header
        let mut frame = EapFrame {
            code: EapCode::Request,
            identifier: self.eap_id,
            body: EapBody::Third {
                rand_s: self.rand_s,
                mac_s,
                channel: PChannel::seal(tek, nonce, &data, b"")?,
            },
        };
        let aad = frame.channel_aad()?;
        if let EapBody::Third { channel, .. } = &mut frame.body {
            *channel = PChannel::seal(tek, nonce, &data, &aad)?;
        }
        self.next_nonce = nonce + 1;
        Ok(frame)
    }

    /// The EAP Success frame concluding the exchange
    #[must_use]
    pub fn success_frame(&self) -> EapFrame {
        EapFrame {
            code: EapCode::Success,
            identifier: self.eap_id,
            body: EapBody::Success,
        }
    }

    /// Validate and decrypt the peer result message
    ///
    /// The channel nonce must be non-zero, strictly newer than anything the
    /// server has sent, and below the channel lifetime bound.
    ///
    /// # Errors
    ///
    /// `Error::ValidationFailed` on a challenge mismatch,
    /// `Error::NonceOutOfRange` on a stale or exhausted nonce,
    /// `Error::AeadAuthFailed` when the channel does not authenticate.
    pub fn handle_fourth(&mut self, frame: &EapFrame) -> Result<ChannelData> {
        if self.state != JoinState::WaitFourth {
            return Err(Error::InvalidState);
        }
        let EapBody::Fourth { rand_s, channel } = &frame.body else {
            return Err(Error::UnexpectedMessage);
        };
        if frame.identifier != self.eap_id || !constant_time_eq(rand_s, &self.rand_s) {
            return Err(Error::ValidationFailed);
        }
        if channel.nonce == 0
            || channel.nonce < self.next_nonce
            || channel.nonce >= PCHANNEL_NONCE_BOUND
        {
            return Err(Error::NonceOutOfRange);
        }
        let tek = self.tek.as_ref().ok_or(Error::InvalidState)?;
        let aad = frame.channel_aad()?;
        let data = channel.open(tek, &aad)?;
        self.next_nonce = channel.nonce + 1;
        Ok(data)
    }
}

/// Fixed-capacity table of in-flight exchanges, one per device
#[derive(Default)]
pub struct JoinTable {
    entries: Vec<JoinEntry, MAX_JOIN_ENTRIES>,
}

impl JoinTable {
    /// Empty table
    #[must_use]
    pub const fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Number of in-flight exchanges
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether any exchange is in flight
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up the exchange for a device
    #[must_use]
    pub fn get(&self, ext_addr: &ExtendedAddress) -> Option<&JoinEntry> {
        self.entries.iter().find(|e| e.ext_addr == *ext_addr)
    }

    /// Mutable lookup
    pub fn get_mut(&mut self, ext_addr: &ExtendedAddress) -> Option<&mut JoinEntry> {
        self.entries.iter_mut().find(|e| e.ext_addr == *ext_addr)
    }

    /// Insert a fresh exchange, replacing any stale one for the same device
    ///
    /// # Errors
    ///
    /// Returns `Error::TableFull` when every slot is taken by other devices.
    pub fn insert(&mut self, entry: JoinEntry) -> Result<&mut JoinEntry> {
        if let Some(idx) = self
            .entries
            .iter()
            .position(|e| e.ext_addr == entry.ext_addr)
        {
            self.entries[idx] = entry;
            return Ok(&mut self.entries[idx]);
        }
        self.entries.push(entry).map_err(|_| Error::TableFull)?;
        let idx = self.entries.len() - 1;
        Ok(&mut self.entries[idx])
    }

    /// Drop the exchange for a device, if any
    pub fn remove(&mut self, ext_addr: &ExtendedAddress) -> Option<JoinEntry> {
        let idx = self.entries.iter().position(|e| e.ext_addr == *ext_addr)?;
        Some(self.entries.swap_remove(idx))
    }

    /// Iterate all exchanges mutably (used by the timeout sweep)
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut JoinEntry> {
        self.entries.iter_mut()
    }

    /// Iterate all exchanges
    pub fn iter(&self) -> impl Iterator<Item = &JoinEntry> {
        self.entries.iter()
    }
}

/// Parameters for an admission third message: assigned short address plus
/// the active group key
#[must_use]
pub fn admission_params(
    short_addr: ShortAddress,
    gmk_index: u8,
    gmk: &[u8; 16],
) -> Vec<ConfigParam, MAX_PARAMS> {
    let mut params = Vec::new();
    // Two pushes into a four-slot vector cannot fail
    let _ = params.push(ConfigParam::ShortAddress(short_addr));
    let _ = params.push(ConfigParam::Gmk {
        index: gmk_index,
        key: *gmk,
    });
    params
}

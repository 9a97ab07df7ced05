// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 GridMesh Systems

//! Wire codec for the bootstrapping protocol
//!
//! Three layers, all big-endian:
//!
//! - the **bootstrapping envelope** that rides on the MAC layer
//!   (code ‖ target EUI-64 ‖ relay short address ‖ payload)
//! - the four **EAP-PSK messages** (RFC 4764) inside Joining/Challenge
//!   envelopes
//! - the **configuration-parameter** sub-messages, either embedded in the
//!   Protected Channel of messages 3/4 or carried bare in an envelope
//!
//! An envelope payload starting with a byte whose top bit is set is a bare
//! configuration-parameter list; EAP codes occupy 1..=4, so the flag bit
//! disambiguates the two payload kinds.
//!
//! Direction convention: devices transmit `Joining` envelopes; the
//! coordinator transmits `Challenge`, `Accepted`, `Decline` and `Kick`.

use gm_common::constants::{
    EAP_TYPE_PSK, EAX_TAG_SIZE, MAX_EAP_MSG, MAX_ENVELOPE_SIZE, MAX_ID_LEN,
    MAX_PCHANNEL_PLAINTEXT, RAND_SIZE,
};
use gm_common::{Error, ExtendedAddress, Result, ShortAddress};
use gm_crypto::aead::{Eax128, EaxNonce};
use heapless::Vec;

use crate::keys::Tek;

/// Maximum configuration parameters per message
pub const MAX_PARAMS: usize = 4;

/// Extension type carrying configuration parameters in a P-Channel
pub const EXT_TYPE_CONFIG: u8 = 0x01;

const EAP_HEADER_LEN: usize = 6;
const PCHANNEL_HEADER_LEN: usize = 4 + EAX_TAG_SIZE;

// =============================================================================
// Envelope
// =============================================================================

/// Bootstrapping envelope code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EnvelopeCode {
    /// Device-originated bootstrap traffic
    Joining = 0x01,
    /// Forced removal of a device
    Kick = 0x04,
    /// Admission completed
    Accepted = 0x09,
    /// Coordinator-originated handshake traffic
    Challenge = 0x0A,
    /// Admission refused
    Decline = 0x0B,
}

impl EnvelopeCode {
    /// Convert from a raw byte
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(Self::Joining),
            0x04 => Some(Self::Kick),
            0x09 => Some(Self::Accepted),
            0x0A => Some(Self::Challenge),
            0x0B => Some(Self::Decline),
            _ => None,
        }
    }
}

/// Parsed envelope payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvelopePayload {
    /// An EAP frame
    Eap(EapFrame),
    /// A bare configuration-parameter list
    Params(Vec<ConfigParam, MAX_PARAMS>),
    /// No payload (Kick, Decline)
    Empty,
}

/// Link-layer bootstrapping envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    /// Envelope code
    pub code: EnvelopeCode,
    /// Extended address of the joining/target device
    pub target: ExtendedAddress,
    /// Short address of the relay agent (the device itself once addressed,
    /// or an intermediate agent forwarding for it)
    pub relay: ShortAddress,
    /// Raw payload bytes
    pub payload: Vec<u8, MAX_EAP_MSG>,
}

impl Envelope {
    /// Build an envelope with no payload
    #[must_use]
    pub fn empty(code: EnvelopeCode, target: ExtendedAddress, relay: ShortAddress) -> Self {
        Self {
            code,
            target,
            relay,
            payload: Vec::new(),
        }
    }

    /// Build an envelope carrying an EAP frame
    ///
    /// # Errors
    ///
    /// Returns `Error::BufferTooSmall` if the frame does not fit.
    pub fn with_eap(
        code: EnvelopeCode,
        target: ExtendedAddress,
        relay: ShortAddress,
        frame: &EapFrame,
    ) -> Result<Self> {
        Ok(Self {
            code,
            target,
            relay,
            payload: frame.encode()?,
        })
    }

    /// Build an envelope carrying a bare configuration-parameter list
    ///
    /// # Errors
    ///
    /// Returns `Error::BufferTooSmall` if the parameters do not fit.
    pub fn with_params(
        code: EnvelopeCode,
        target: ExtendedAddress,
        relay: ShortAddress,
        params: &[ConfigParam],
    ) -> Result<Self> {
        let mut payload = Vec::new();
        encode_params(params, &mut payload)?;
        Ok(Self {
            code,
            target,
            relay,
            payload,
        })
    }

    /// Serialize for transmission
    ///
    /// # Errors
    ///
    /// Returns `Error::BufferTooSmall` if the envelope exceeds the wire
    /// limit (cannot happen with well-formed payloads).
    pub fn encode(&self) -> Result<Vec<u8, MAX_ENVELOPE_SIZE>> {
        let mut out = Vec::new();
        out.push(self.code as u8).map_err(|_| Error::BufferTooSmall)?;
        out.extend_from_slice(self.target.as_bytes())
            .map_err(|_| Error::BufferTooSmall)?;
        out.extend_from_slice(&self.relay.to_be_bytes())
            .map_err(|_| Error::BufferTooSmall)?;
        out.extend_from_slice(&self.payload)
            .map_err(|_| Error::BufferTooSmall)?;
        Ok(out)
    }

    /// Parse a received envelope
    ///
    /// # Errors
    ///
    /// `Error::MalformedMessage` on truncation, `Error::UnknownMessageCode`
    /// for an unrecognized code byte.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 11 {
            return Err(Error::MalformedMessage);
        }
        let code = EnvelopeCode::from_u8(bytes[0]).ok_or(Error::UnknownMessageCode)?;
        let target = ExtendedAddress::from_slice(&bytes[1..9]).ok_or(Error::MalformedMessage)?;
        let relay = ShortAddress::from_be_bytes([bytes[9], bytes[10]]);
        let mut payload = Vec::new();
        payload
            .extend_from_slice(&bytes[11..])
            .map_err(|_| Error::MalformedMessage)?;
        Ok(Self {
            code,
            target,
            relay,
            payload,
        })
    }

    /// Classify and parse the payload
    ///
    /// # Errors
    ///
    /// Propagates codec errors from the embedded EAP frame or parameter
    /// list.
    pub fn parse_payload(&self) -> Result<EnvelopePayload> {
        match self.payload.first() {
            None => Ok(EnvelopePayload::Empty),
            Some(first) if first & 0x80 != 0 => {
                Ok(EnvelopePayload::Params(decode_params(&self.payload)?))
            }
            Some(_) => Ok(EnvelopePayload::Eap(EapFrame::decode(&self.payload)?)),
        }
    }
}

// =============================================================================
// EAP frames
// =============================================================================

/// EAP packet code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EapCode {
    /// Request (coordinator to device)
    Request = 1,
    /// Response (device to coordinator)
    Response = 2,
    /// Success
    Success = 3,
    /// Failure
    Failure = 4,
}

impl EapCode {
    /// Convert from a raw byte
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Request),
            2 => Some(Self::Response),
            3 => Some(Self::Success),
            4 => Some(Self::Failure),
            _ => None,
        }
    }
}

/// Body of an EAP frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EapBody {
    /// Message 1: server identity and challenge
    First {
        /// Server random challenge
        rand_s: [u8; RAND_SIZE],
        /// Server identity
        id_s: Vec<u8, MAX_ID_LEN>,
    },
    /// Message 2: peer response with authentication tag
    Second {
        /// Echo of the server challenge
        rand_s: [u8; RAND_SIZE],
        /// Peer random challenge
        rand_p: [u8; RAND_SIZE],
        /// Peer identity
        id_p: Vec<u8, MAX_ID_LEN>,
        /// MAC_P = CMAC(AK, IdP ‖ IdS ‖ RandS ‖ RandP)
        mac_p: [u8; 16],
    },
    /// Message 3: server authentication plus protected payload
    Third {
        /// Echo of the server challenge
        rand_s: [u8; RAND_SIZE],
        /// MAC_S = CMAC(AK, IdS ‖ RandP)
        mac_s: [u8; 16],
        /// Protected Channel
        channel: PChannel,
    },
    /// Message 4: peer result inside the protected channel
    Fourth {
        /// Echo of the server challenge
        rand_s: [u8; RAND_SIZE],
        /// Protected Channel
        channel: PChannel,
    },
    /// EAP Success (header only)
    Success,
    /// EAP Failure (header only)
    Failure,
}

impl EapBody {
    const fn subtype(&self) -> Option<u8> {
        match self {
            Self::First { .. } => Some(1),
            Self::Second { .. } => Some(2),
            Self::Third { .. } => Some(3),
            Self::Fourth { .. } => Some(4),
            Self::Success | Self::Failure => None,
        }
    }
}

/// A complete EAP frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EapFrame {
    /// EAP code
    pub code: EapCode,
    /// EAP identifier, echoed by responses
    pub identifier: u8,
    /// Frame body
    pub body: EapBody,
}

impl EapFrame {
    /// Serialize the frame
    ///
    /// # Errors
    ///
    /// Returns `Error::BufferTooSmall` if the frame exceeds `MAX_EAP_MSG`.
    pub fn encode(&self) -> Result<Vec<u8, MAX_EAP_MSG>> {
        let mut out: Vec<u8, MAX_EAP_MSG> = Vec::new();
        let push = |out: &mut Vec<u8, MAX_EAP_MSG>, b: &[u8]| {
            out.extend_from_slice(b).map_err(|_| Error::BufferTooSmall)
        };

        // Header placeholder; length is patched once the body is in place
        push(&mut out, &[self.code as u8, self.identifier, 0, 0])?;

        if let Some(t) = self.body.subtype() {
            // T is a two-bit field; subtypes 1..=4 ride as 0..=3
            push(&mut out, &[EAP_TYPE_PSK, (t - 1) << 6])?;
            match &self.body {
                EapBody::First { rand_s, id_s } => {
                    push(&mut out, rand_s)?;
                    push(&mut out, id_s)?;
                }
                EapBody::Second {
                    rand_s,
                    rand_p,
                    id_p,
                    mac_p,
                } => {
                    push(&mut out, rand_s)?;
                    push(&mut out, rand_p)?;
                    push(&mut out, id_p)?;
                    push(&mut out, mac_p)?;
                }
                EapBody::Third {
                    rand_s,
                    mac_s,
                    channel,
                } => {
                    push(&mut out, rand_s)?;
                    push(&mut out, mac_s)?;
                    channel.write_to(&mut out)?;
                }
                EapBody::Fourth { rand_s, channel } => {
                    push(&mut out, rand_s)?;
                    channel.write_to(&mut out)?;
                }
                EapBody::Success | EapBody::Failure => unreachable!(),
            }
        }

        let len = out.len() as u16;
        out[2..4].copy_from_slice(&len.to_be_bytes());
        Ok(out)
    }

    /// Parse a received frame
    ///
    /// # Errors
    ///
    /// `Error::MalformedMessage` on truncation or structural problems,
    /// `Error::LengthMismatch` if the declared length disagrees with the
    /// buffer, `Error::UnknownMessageCode` for unknown codes or subtypes.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 4 {
            return Err(Error::MalformedMessage);
        }
        let code = EapCode::from_u8(bytes[0]).ok_or(Error::UnknownMessageCode)?;
        let identifier = bytes[1];
        let declared = u16::from_be_bytes([bytes[2], bytes[3]]) as usize;
        if declared != bytes.len() {
            return Err(Error::LengthMismatch);
        }

        if matches!(code, EapCode::Success | EapCode::Failure) {
            if bytes.len() != 4 {
                return Err(Error::MalformedMessage);
            }
            let body = if code == EapCode::Success {
                EapBody::Success
            } else {
                EapBody::Failure
            };
            return Ok(Self {
                code,
                identifier,
                body,
            });
        }

        if bytes.len() < EAP_HEADER_LEN + RAND_SIZE || bytes[4] != EAP_TYPE_PSK {
            return Err(Error::MalformedMessage);
        }
        let subtype = (bytes[5] >> 6) + 1;
        let rest = &bytes[EAP_HEADER_LEN..];

        let mut rand_s = [0u8; RAND_SIZE];
        rand_s.copy_from_slice(&rest[..RAND_SIZE]);
        let rest = &rest[RAND_SIZE..];

        let body = match subtype {
            1 => {
                let mut id_s = Vec::new();
                id_s.extend_from_slice(rest).map_err(|_| Error::MalformedMessage)?;
                EapBody::First { rand_s, id_s }
            }
            2 => {
                // IdP is variable; MAC_P is the trailing 16 bytes
                if rest.len() < RAND_SIZE + 16 {
                    return Err(Error::MalformedMessage);
                }
                let mut rand_p = [0u8; RAND_SIZE];
                rand_p.copy_from_slice(&rest[..RAND_SIZE]);
                let id_end = rest.len() - 16;
                let mut id_p = Vec::new();
                id_p.extend_from_slice(&rest[RAND_SIZE..id_end])
                    .map_err(|_| Error::MalformedMessage)?;
                let mut mac_p = [0u8; 16];
                mac_p.copy_from_slice(&rest[id_end..]);
                EapBody::Second {
                    rand_s,
                    rand_p,
                    id_p,
                    mac_p,
                }
            }
            3 => {
                if rest.len() < 16 {
                    return Err(Error::MalformedMessage);
                }
                let mut mac_s = [0u8; 16];
                mac_s.copy_from_slice(&rest[..16]);
                let channel = PChannel::parse(&rest[16..])?;
                EapBody::Third {
                    rand_s,
                    mac_s,
                    channel,
                }
            }
            4 => {
                let channel = PChannel::parse(rest)?;
                EapBody::Fourth { rand_s, channel }
            }
            _ => return Err(Error::UnknownMessageCode),
        };

        Ok(Self {
            code,
            identifier,
            body,
        })
    }

    /// The bytes of the encoded frame preceding its P-Channel, used as
    /// associated data when sealing and opening the channel
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidParameter` for bodies that carry no channel.
    pub fn channel_aad(&self) -> Result<Vec<u8, MAX_EAP_MSG>> {
        let encoded = self.encode()?;
        let aad_len = match &self.body {
            EapBody::Third { .. } => EAP_HEADER_LEN + RAND_SIZE + 16,
            EapBody::Fourth { .. } => EAP_HEADER_LEN + RAND_SIZE,
            _ => return Err(Error::InvalidParameter),
        };
        let mut aad = Vec::new();
        aad.extend_from_slice(&encoded[..aad_len])
            .map_err(|_| Error::BufferTooSmall)?;
        Ok(aad)
    }
}

// =============================================================================
// Protected Channel
// =============================================================================

/// Result code carried in the P-Channel flags byte (top two bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChannelResult {
    /// Exchange continues
    Continue = 1,
    /// Exchange done, success
    DoneSuccess = 2,
    /// Exchange done, failure
    DoneFailure = 3,
}

impl ChannelResult {
    /// Convert from the top two bits of the flags byte
    #[must_use]
    pub const fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            1 => Some(Self::Continue),
            2 => Some(Self::DoneSuccess),
            3 => Some(Self::DoneFailure),
            _ => None,
        }
    }
}

/// Decrypted P-Channel contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelData {
    /// Result flag
    pub result: ChannelResult,
    /// Embedded configuration parameters (the EXT payload)
    pub params: Vec<ConfigParam, MAX_PARAMS>,
}

impl ChannelData {
    /// Channel data with no extension
    #[must_use]
    pub fn bare(result: ChannelResult) -> Self {
        Self {
            result,
            params: Vec::new(),
        }
    }

    fn encode(&self) -> Result<Vec<u8, MAX_PCHANNEL_PLAINTEXT>> {
        let mut out: Vec<u8, MAX_PCHANNEL_PLAINTEXT> = Vec::new();
        let ext = !self.params.is_empty();
        let flags = ((self.result as u8) << 6) | if ext { 0x20 } else { 0 };
        out.push(flags).map_err(|_| Error::BufferTooSmall)?;
        if ext {
            out.push(EXT_TYPE_CONFIG).map_err(|_| Error::BufferTooSmall)?;
            encode_params(&self.params, &mut out)?;
        }
        Ok(out)
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let flags = *bytes.first().ok_or(Error::MalformedMessage)?;
        let result = ChannelResult::from_bits(flags >> 6).ok_or(Error::MalformedMessage)?;
        let ext = flags & 0x20 != 0;

        let mut params = Vec::new();
        if ext {
            if bytes.len() < 2 || bytes[1] != EXT_TYPE_CONFIG {
                return Err(Error::MalformedMessage);
            }
            params = decode_params(&bytes[2..])?;
        } else if bytes.len() != 1 {
            return Err(Error::MalformedMessage);
        }
        Ok(Self { result, params })
    }
}

/// Encrypted Protected Channel as carried on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PChannel {
    /// Wire nonce counter (4 bytes big-endian on the wire)
    pub nonce: u32,
    /// EAX authentication tag
    pub tag: [u8; EAX_TAG_SIZE],
    /// Ciphertext (same length as the plaintext)
    pub ciphertext: Vec<u8, MAX_PCHANNEL_PLAINTEXT>,
}

impl PChannel {
    /// Encrypt `data` under `tek` with the given nonce counter
    ///
    /// # Errors
    ///
    /// Propagates codec and AEAD errors.
    pub fn seal(tek: &Tek, nonce: u32, data: &ChannelData, aad: &[u8]) -> Result<Self> {
        let plaintext = data.encode()?;
        let mut buf = [0u8; MAX_PCHANNEL_PLAINTEXT + EAX_TAG_SIZE];
        let total = Eax128::encrypt(
            tek.key(),
            &EaxNonce::from_counter(nonce),
            &plaintext,
            aad,
            &mut buf,
        )
        .map_err(Error::from)?;
        let ct_len = total - EAX_TAG_SIZE;

        let mut ciphertext = Vec::new();
        ciphertext
            .extend_from_slice(&buf[..ct_len])
            .map_err(|_| Error::BufferTooSmall)?;
        let mut tag = [0u8; EAX_TAG_SIZE];
        tag.copy_from_slice(&buf[ct_len..total]);
        Ok(Self {
            nonce,
            tag,
            ciphertext,
        })
    }

    /// Decrypt and parse the channel contents
    ///
    /// Fails closed: `Error::AeadAuthFailed` means the message must be
    /// silently discarded, never answered.
    ///
    /// # Errors
    ///
    /// `Error::AeadAuthFailed` on authentication failure, codec errors if
    /// the authenticated plaintext is structurally invalid.
    pub fn open(&self, tek: &Tek, aad: &[u8]) -> Result<ChannelData> {
        let mut joined = [0u8; MAX_PCHANNEL_PLAINTEXT + EAX_TAG_SIZE];
        let total = self.ciphertext.len() + EAX_TAG_SIZE;
        joined[..self.ciphertext.len()].copy_from_slice(&self.ciphertext);
        joined[self.ciphertext.len()..total].copy_from_slice(&self.tag);

        let mut plaintext = [0u8; MAX_PCHANNEL_PLAINTEXT];
        let pt_len = Eax128::decrypt(
            tek.key(),
            &EaxNonce::from_counter(self.nonce),
            &joined[..total],
            aad,
            &mut plaintext,
        )
        .map_err(Error::from)?;
        ChannelData::decode(&plaintext[..pt_len])
    }

    fn write_to(&self, out: &mut Vec<u8, MAX_EAP_MSG>) -> Result<()> {
        out.extend_from_slice(&self.nonce.to_be_bytes())
            .map_err(|_| Error::BufferTooSmall)?;
        out.extend_from_slice(&self.tag)
            .map_err(|_| Error::BufferTooSmall)?;
        out.extend_from_slice(&self.ciphertext)
            .map_err(|_| Error::BufferTooSmall)?;
        Ok(())
    }

    fn parse(bytes: &[u8]) -> Result<Self> {
        // At least the flags byte must be present under the tag
        if bytes.len() < PCHANNEL_HEADER_LEN + 1 {
            return Err(Error::MalformedMessage);
        }
        let nonce = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let mut tag = [0u8; EAX_TAG_SIZE];
        tag.copy_from_slice(&bytes[4..PCHANNEL_HEADER_LEN]);
        let mut ciphertext = Vec::new();
        ciphertext
            .extend_from_slice(&bytes[PCHANNEL_HEADER_LEN..])
            .map_err(|_| Error::MalformedMessage)?;
        Ok(Self {
            nonce,
            tag,
            ciphertext,
        })
    }
}

// =============================================================================
// Configuration parameters
// =============================================================================

/// Attribute identifier: assigned short address (PSI)
pub const ATTR_SHORT_ADDRESS: u8 = 0x1D;
/// Attribute identifier: GMK slot install (PSI)
pub const ATTR_GMK: u8 = 0x27;
/// Attribute identifier: parameter processing result (DSI)
pub const ATTR_PARAM_RESULT: u8 = 0x29;
/// Attribute identifier: GMK slot activation (PSI)
pub const ATTR_GMK_ACTIVATION: u8 = 0x2B;

/// Result of applying a configuration parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ParamResult {
    /// Parameter applied
    Success = 0,
    /// A required parameter was absent
    MissingParam = 1,
    /// Parameter value rejected
    InvalidValue = 2,
    /// Parameter not supported by this device
    UnsupportedParam = 3,
}

impl ParamResult {
    /// Convert from a raw byte
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Success),
            1 => Some(Self::MissingParam),
            2 => Some(Self::InvalidValue),
            3 => Some(Self::UnsupportedParam),
            _ => None,
        }
    }
}

/// One configuration-parameter sub-message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigParam {
    /// Short address assigned to the device
    ShortAddress(ShortAddress),
    /// Install a GMK into the given slot
    Gmk {
        /// Key slot index (0 or 1)
        index: u8,
        /// 16-byte group master key
        key: [u8; 16],
    },
    /// Activate the GMK in the given slot
    GmkActivation {
        /// Key slot index (0 or 1)
        index: u8,
    },
    /// Device-side result for a previously received parameter
    ParamResult {
        /// Outcome
        result: ParamResult,
        /// Attribute the result refers to
        attr_id: u8,
    },
}

impl ConfigParam {
    /// Attribute identifier of this parameter
    #[must_use]
    pub const fn attr_id(&self) -> u8 {
        match self {
            Self::ShortAddress(_) => ATTR_SHORT_ADDRESS,
            Self::Gmk { .. } => ATTR_GMK,
            Self::GmkActivation { .. } => ATTR_GMK_ACTIVATION,
            Self::ParamResult { .. } => ATTR_PARAM_RESULT,
        }
    }

    /// Whether the attribute is device-specific (DSI) rather than
    /// PAN-specific (PSI)
    #[must_use]
    pub const fn is_dsi(&self) -> bool {
        matches!(self, Self::ParamResult { .. })
    }
}

/// Append encoded parameters to `out`
///
/// Wire form per parameter: type byte (bit 7 = config-parameter flag,
/// bit 0 = DSI/PSI) ‖ attribute id ‖ length ‖ value.
///
/// # Errors
///
/// Returns `Error::BufferTooSmall` if the buffer fills up.
pub fn encode_params<const N: usize>(params: &[ConfigParam], out: &mut Vec<u8, N>) -> Result<()> {
    for param in params {
        let type_byte = 0x80 | u8::from(param.is_dsi());
        let header = [type_byte, param.attr_id()];
        out.extend_from_slice(&header).map_err(|_| Error::BufferTooSmall)?;
        match param {
            ConfigParam::ShortAddress(addr) => {
                out.push(2).map_err(|_| Error::BufferTooSmall)?;
                out.extend_from_slice(&addr.to_be_bytes())
                    .map_err(|_| Error::BufferTooSmall)?;
            }
            ConfigParam::Gmk { index, key } => {
                out.push(17).map_err(|_| Error::BufferTooSmall)?;
                out.push(*index).map_err(|_| Error::BufferTooSmall)?;
                out.extend_from_slice(key).map_err(|_| Error::BufferTooSmall)?;
            }
            ConfigParam::GmkActivation { index } => {
                out.push(1).map_err(|_| Error::BufferTooSmall)?;
                out.push(*index).map_err(|_| Error::BufferTooSmall)?;
            }
            ConfigParam::ParamResult { result, attr_id } => {
                out.push(2).map_err(|_| Error::BufferTooSmall)?;
                out.push(*result as u8).map_err(|_| Error::BufferTooSmall)?;
                out.push(*attr_id).map_err(|_| Error::BufferTooSmall)?;
            }
        }
    }
    Ok(())
}

/// Parse a configuration-parameter list
///
/// # Errors
///
/// `Error::MalformedMessage` on truncation, `Error::UnknownAttribute` for
/// attributes this implementation does not know, `Error::LengthMismatch`
/// when a declared value length is wrong for its attribute.
pub fn decode_params(mut bytes: &[u8]) -> Result<Vec<ConfigParam, MAX_PARAMS>> {
    let mut params = Vec::new();
    while !bytes.is_empty() {
        if bytes.len() < 3 {
            return Err(Error::MalformedMessage);
        }
        let type_byte = bytes[0];
        if type_byte & 0x80 == 0 {
            return Err(Error::MalformedMessage);
        }
        let attr_id = bytes[1];
        let len = bytes[2] as usize;
        if bytes.len() < 3 + len {
            return Err(Error::MalformedMessage);
        }
        let value = &bytes[3..3 + len];

        let param = match attr_id {
            ATTR_SHORT_ADDRESS => {
                if len != 2 {
                    return Err(Error::LengthMismatch);
                }
                ConfigParam::ShortAddress(ShortAddress::from_be_bytes([value[0], value[1]]))
            }
            ATTR_GMK => {
                if len != 17 {
                    return Err(Error::LengthMismatch);
                }
                let mut key = [0u8; 16];
                key.copy_from_slice(&value[1..]);
                ConfigParam::Gmk {
                    index: value[0],
                    key,
                }
            }
            ATTR_GMK_ACTIVATION => {
                if len != 1 {
                    return Err(Error::LengthMismatch);
                }
                ConfigParam::GmkActivation { index: value[0] }
            }
            ATTR_PARAM_RESULT => {
                if len != 2 {
                    return Err(Error::LengthMismatch);
                }
                ConfigParam::ParamResult {
                    result: ParamResult::from_u8(value[0]).ok_or(Error::MalformedMessage)?,
                    attr_id: value[1],
                }
            }
            _ => return Err(Error::UnknownAttribute),
        };
        params.push(param).map_err(|_| Error::BufferTooSmall)?;
        bytes = &bytes[3 + len..];
    }
    Ok(params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{derive_ak_kdk, derive_tek};
    use gm_crypto::Aes128Key;

    fn addr(byte: u8) -> ExtendedAddress {
        ExtendedAddress::new([byte; 8])
    }

    fn tek() -> Tek {
        let (_, kdk) = derive_ak_kdk(&Aes128Key::new([0x10; 16]));
        derive_tek(&kdk, &[0x20; 16])
    }

    #[test]
    fn envelope_roundtrip() {
        let env = Envelope::empty(EnvelopeCode::Kick, addr(7), ShortAddress::new(0x0012));
        let bytes = env.encode().unwrap();
        let parsed = Envelope::decode(&bytes).unwrap();
        assert_eq!(parsed, env);
        assert_eq!(parsed.parse_payload().unwrap(), EnvelopePayload::Empty);
    }

    #[test]
    fn envelope_rejects_truncation_and_bad_code() {
        assert_eq!(Envelope::decode(&[0x01, 0x02]), Err(Error::MalformedMessage));
        let mut bytes = Envelope::empty(EnvelopeCode::Joining, addr(1), ShortAddress::COORDINATOR)
            .encode()
            .unwrap();
        bytes[0] = 0x7E;
        assert_eq!(Envelope::decode(&bytes), Err(Error::UnknownMessageCode));
    }

    #[test]
    fn first_message_roundtrip() {
        let mut id_s = Vec::new();
        id_s.extend_from_slice(b"gridmesh-coord").unwrap();
        let frame = EapFrame {
            code: EapCode::Request,
            identifier: 9,
            body: EapBody::First {
                rand_s: [0x5A; 16],
                id_s,
            },
        };
        let bytes = frame.encode().unwrap();
        assert_eq!(EapFrame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn second_message_roundtrip_variable_id() {
        let mut id_p = Vec::new();
        id_p.extend_from_slice(b"lamp-0042").unwrap();
        let frame = EapFrame {
            code: EapCode::Response,
            identifier: 9,
            body: EapBody::Second {
                rand_s: [1; 16],
                rand_p: [2; 16],
                id_p,
                mac_p: [3; 16],
            },
        };
        let bytes = frame.encode().unwrap();
        assert_eq!(EapFrame::decode(&bytes).unwrap(), frame);
    }

    #[test]
    fn length_field_is_validated() {
        let frame = EapFrame {
            code: EapCode::Success,
            identifier: 1,
            body: EapBody::Success,
        };
        let mut bytes = frame.encode().unwrap();
        assert_eq!(bytes.len(), 4);
        bytes[3] = 99;
        assert_eq!(EapFrame::decode(&bytes), Err(Error::LengthMismatch));
    }

    #[test]
    fn third_message_channel_roundtrip() {
        let tek = tek();
        let mut data = ChannelData::bare(ChannelResult::Continue);
        data.params
            .push(ConfigParam::ShortAddress(ShortAddress::new(0x0042)))
            .unwrap();
        data.params
            .push(ConfigParam::Gmk {
                index: 0,
                key: [0xC0; 16],
            })
            .unwrap();

        // Seal against the header bytes the finished frame will carry
        let mut frame = EapFrame {
            code: EapCode::Request,
            identifier: 3,
            body: EapBody::Third {
                rand_s: [7; 16],
                mac_s: [8; 16],
                channel: PChannel::seal(&tek, 1, &data, b"").unwrap(),
            },
        };
        let aad = frame.channel_aad().unwrap();
        if let EapBody::Third { channel, .. } = &mut frame.body {
            *channel = PChannel::seal(&tek, 1, &data, &aad).unwrap();
        }

        let bytes = frame.encode().unwrap();
        let parsed = EapFrame::decode(&bytes).unwrap();
        let parsed_aad = parsed.channel_aad().unwrap();
        if let EapBody::Third { channel, .. } = &parsed.body {
            let opened = channel.open(&tek, &parsed_aad).unwrap();
            assert_eq!(opened, data);
        } else {
            panic!("wrong body");
        }
    }

    #[test]
    fn fourth_message_roundtrip() {
        let tek = tek();
        let data = ChannelData::bare(ChannelResult::DoneSuccess);

        let mut frame = EapFrame {
            code: EapCode::Response,
            identifier: 3,
            body: EapBody::Fourth {
                rand_s: [7; 16],
                channel: PChannel::seal(&tek, 2, &data, b"").unwrap(),
            },
        };
        let aad = frame.channel_aad().unwrap();
        if let EapBody::Fourth { channel, .. } = &mut frame.body {
            *channel = PChannel::seal(&tek, 2, &data, &aad).unwrap();
        }

        let bytes = frame.encode().unwrap();
        // Subtype 4 must fit the two-bit T field
        assert_eq!(bytes[5], 0xC0);
        let parsed = EapFrame::decode(&bytes).unwrap();
        let parsed_aad = parsed.channel_aad().unwrap();
        if let EapBody::Fourth { channel, .. } = &parsed.body {
            let opened = channel.open(&tek, &parsed_aad).unwrap();
            assert_eq!(opened, data);
        } else {
            panic!("wrong body");
        }
    }

    #[test]
    fn subtype_field_covers_all_messages() {
        let mut id_s = Vec::new();
        id_s.extend_from_slice(b"c").unwrap();
        let first = EapFrame {
            code: EapCode::Request,
            identifier: 1,
            body: EapBody::First {
                rand_s: [0; 16],
                id_s,
            },
        };
        let bytes = first.encode().unwrap();
        assert_eq!(bytes[5], 0x00);
        assert!(matches!(
            EapFrame::decode(&bytes).unwrap().body,
            EapBody::First { .. }
        ));
    }

    #[test]
    fn channel_open_fails_with_wrong_aad() {
        let tek = tek();
        let data = ChannelData::bare(ChannelResult::DoneSuccess);
        let channel = PChannel::seal(&tek, 5, &data, b"good").unwrap();
        assert_eq!(channel.open(&tek, b"evil"), Err(Error::AeadAuthFailed));
    }

    #[test]
    fn params_roundtrip_via_envelope() {
        let params = [
            ConfigParam::GmkActivation { index: 1 },
            ConfigParam::ParamResult {
                result: ParamResult::Success,
                attr_id: ATTR_GMK_ACTIVATION,
            },
        ];
        let env = Envelope::with_params(
            EnvelopeCode::Challenge,
            addr(2),
            ShortAddress::new(0x0007),
            &params,
        )
        .unwrap();
        let parsed = Envelope::decode(&env.encode().unwrap()).unwrap();
        match parsed.parse_payload().unwrap() {
            EnvelopePayload::Params(p) => assert_eq!(p.as_slice(), &params),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn unknown_attribute_rejected() {
        let bytes = [0x80, 0x55, 0x01, 0x00];
        assert_eq!(decode_params(&bytes), Err(Error::UnknownAttribute));
    }
}

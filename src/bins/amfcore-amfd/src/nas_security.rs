//! NAS security context and message protection
//!
//! Protected PDU layout:
//!
//! ```text
//! [EPD][SHT][MAC x4][SQN][5GMM message, ciphered when SHT says so]
//! ```
//!
//! The MAC covers `SQN || message` after ciphering. NAS COUNT is the 24-bit
//! value `overflow(16) || SQN(8)`; only the SQN byte travels on the wire, so
//! the receiver rebuilds the full uplink COUNT from the last value it
//! accepted.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use amfcore_crypt::kdf::{self, ACCESS_TYPE_3GPP, NAS_ENC_ALG, NAS_INT_ALG};
use amfcore_crypt::nea::{self, CipheringAlgorithm};
use amfcore_crypt::nia::{self, IntegrityAlgorithm};
use amfcore_crypt::{CryptError, Direction, KEY256_LEN, KEY_LEN, MAC_LEN};

use crate::nas_message::{
    security_header_type, NasCodecError, SecurityHeaderType, UeSecurityCapability, EPD_5GMM,
    SECURITY_HEADER_LEN,
};

/// BEARER input of the NAS algorithms
pub const NAS_BEARER: u8 = 1;

/// Largest NAS COUNT value
pub const NAS_COUNT_MAX: u32 = 0x00ff_ffff;

/// Number of valid ngKSI values (7 means "no key available")
pub const NGKSI_RANGE: u8 = 7;

/// Next-hop chaining counter range
pub const NCC_RANGE: u8 = 8;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NasSecurityError {
    #[error("message too short: {0} bytes")]
    MessageTooShort(usize),
    #[error("invalid security header: {0}")]
    InvalidHeader(#[from] NasCodecError),
    #[error("no usable security context")]
    NoSecurityContext,
    #[error("MAC verification failed (count={count:#08x})")]
    MacMismatch { count: u32 },
    #[error("NAS COUNT exhausted")]
    CountExhausted,
    #[error(transparent)]
    Crypt(#[from] CryptError),
}

// ============================================================================
// NAS COUNT
// ============================================================================

/// 24-bit NAS COUNT
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NasCount {
    pub overflow: u16,
    pub sqn: u8,
}

impl NasCount {
    pub fn from_value(value: u32) -> Self {
        Self {
            overflow: ((value >> 8) & 0xffff) as u16,
            sqn: (value & 0xff) as u8,
        }
    }

    pub fn value(&self) -> u32 {
        ((self.overflow as u32) << 8) | self.sqn as u32
    }

    /// Advance by one; fails instead of wrapping
    pub fn increment(&mut self) -> Result<(), NasSecurityError> {
        let value = self.value();
        if value >= NAS_COUNT_MAX {
            return Err(NasSecurityError::CountExhausted);
        }
        *self = Self::from_value(value + 1);
        Ok(())
    }

    /// Rebuild the full uplink COUNT from a received SQN byte
    ///
    /// `expected` is the smallest COUNT the receiver would accept next. A SQN
    /// below the expected SQN means the sender crossed an overflow boundary.
    pub fn estimate(expected: u32, sqn: u8) -> u32 {
        let mut overflow = expected >> 8;
        if (sqn as u32) < (expected & 0xff) {
            overflow += 1;
        }
        (overflow << 8) | sqn as u32
    }
}

// ============================================================================
// Security context
// ============================================================================

/// Lifecycle of a NAS security context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SecurityContextState {
    /// No keys, or invalidated pending re-authentication
    #[default]
    NotAvailable,
    /// Security Mode Command sent, Complete not yet received
    Partial,
    /// Security Mode Complete received
    FullNative,
}

/// Result of verifying an uplink PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnprotectedPdu {
    pub header_type: SecurityHeaderType,
    pub count: u32,
    /// Plain 5GMM message
    pub message: Bytes,
}

/// Keys, algorithms and counters of one NAS security context
#[derive(Clone)]
pub struct NasSecurityContext {
    pub ngksi: u8,
    kamf: [u8; KEY256_LEN],
    knas_int: [u8; KEY_LEN],
    knas_enc: [u8; KEY_LEN],
    pub integrity: IntegrityAlgorithm,
    pub ciphering: CipheringAlgorithm,
    ul_count: NasCount,
    /// At least one uplink PDU accepted under this context
    ul_seen: bool,
    dl_count: NasCount,
    state: SecurityContextState,
    kgnb: [u8; KEY256_LEN],
    nh: [u8; KEY256_LEN],
    ncc: u8,
}

impl std::fmt::Debug for NasSecurityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NasSecurityContext")
            .field("ngksi", &self.ngksi)
            .field("integrity", &self.integrity)
            .field("ciphering", &self.ciphering)
            .field("ul_count", &self.ul_count.value())
            .field("dl_count", &self.dl_count.value())
            .field("state", &self.state)
            .field("ncc", &self.ncc)
            .finish_non_exhaustive()
    }
}

impl NasSecurityContext {
    /// New context from the Kamf of a successful authentication
    pub fn new(ngksi: u8, kamf: [u8; KEY256_LEN]) -> Self {
        Self {
            ngksi,
            kamf,
            knas_int: [0; KEY_LEN],
            knas_enc: [0; KEY_LEN],
            integrity: IntegrityAlgorithm::Nia0,
            ciphering: CipheringAlgorithm::Nea0,
            ul_count: NasCount::default(),
            ul_seen: false,
            dl_count: NasCount::default(),
            state: SecurityContextState::NotAvailable,
            kgnb: [0; KEY256_LEN],
            nh: [0; KEY256_LEN],
            ncc: 0,
        }
    }

    pub fn state(&self) -> SecurityContextState {
        self.state
    }

    pub fn is_full_native(&self) -> bool {
        self.state == SecurityContextState::FullNative
    }

    pub fn kamf(&self) -> &[u8; KEY256_LEN] {
        &self.kamf
    }

    pub fn ul_count(&self) -> u32 {
        self.ul_count.value()
    }

    pub fn dl_count(&self) -> u32 {
        self.dl_count.value()
    }

    /// Select algorithms and derive the NAS keys (Security Mode Command)
    ///
    /// Both counters restart at zero.
    pub fn activate(&mut self, integrity: IntegrityAlgorithm, ciphering: CipheringAlgorithm) {
        self.integrity = integrity;
        self.ciphering = ciphering;
        self.knas_int = kdf::algorithm_key(&self.kamf, NAS_INT_ALG, integrity.id());
        self.knas_enc = kdf::algorithm_key(&self.kamf, NAS_ENC_ALG, ciphering.id());
        self.ul_count = NasCount::default();
        self.ul_seen = false;
        self.dl_count = NasCount::default();
        self.state = SecurityContextState::Partial;
        log::debug!(
            "NAS security activated: ngKSI={} {} {}",
            self.ngksi,
            integrity.name(),
            ciphering.name()
        );
    }

    /// Security Mode Complete accepted; false if already FULL-NATIVE
    pub fn complete(&mut self) -> bool {
        match self.state {
            SecurityContextState::Partial => {
                self.state = SecurityContextState::FullNative;
                true
            }
            _ => false,
        }
    }

    /// Mark unusable pending re-authentication
    pub fn invalidate(&mut self) {
        self.state = SecurityContextState::NotAvailable;
    }

    // ------------------------------------------------------------------------
    // AS key chain
    // ------------------------------------------------------------------------

    /// KgNB for Initial Context Setup; restarts the NH chain with NCC 0
    pub fn initial_kgnb(&mut self) -> [u8; KEY256_LEN] {
        self.kgnb = kdf::kgnb(&self.kamf, self.ul_count.value(), ACCESS_TYPE_3GPP);
        self.nh = self.kgnb;
        self.ncc = 0;
        self.kgnb
    }

    /// NCC (3 bits, wrapping) and NH a Handover Request carries; the chain
    /// itself does not move
    pub fn pending_next_hop(&self) -> (u8, [u8; KEY256_LEN]) {
        ((self.ncc + 1) % NCC_RANGE, kdf::nh(&self.kamf, &self.nh))
    }

    /// Advance the next-hop chain once the target has admitted the UE
    pub fn next_hop(&mut self) -> (u8, [u8; KEY256_LEN]) {
        let (ncc, nh) = self.pending_next_hop();
        self.ncc = ncc;
        self.nh = nh;
        (ncc, nh)
    }

    pub fn ncc(&self) -> u8 {
        self.ncc
    }

    pub fn nh(&self) -> &[u8; KEY256_LEN] {
        &self.nh
    }

    // ------------------------------------------------------------------------
    // Protection
    // ------------------------------------------------------------------------

    /// Protect a downlink plain 5GMM message
    ///
    /// The downlink COUNT advances by exactly one per protected message.
    pub fn protect(
        &mut self,
        message: &[u8],
        header_type: SecurityHeaderType,
    ) -> Result<Bytes, NasSecurityError> {
        if header_type == SecurityHeaderType::Plain {
            return Ok(Bytes::copy_from_slice(message));
        }
        let usable = match self.state {
            SecurityContextState::FullNative => true,
            SecurityContextState::Partial => header_type.is_new_context(),
            SecurityContextState::NotAvailable => false,
        };
        if !usable {
            return Err(NasSecurityError::NoSecurityContext);
        }

        let count = self.dl_count;
        let mut body = BytesMut::with_capacity(1 + message.len());
        body.put_u8(count.sqn);
        body.put_slice(message);
        if header_type.is_ciphered() {
            nea::apply(
                self.ciphering,
                &self.knas_enc,
                count.value(),
                NAS_BEARER,
                Direction::Downlink,
                &mut body[1..],
            )?;
        }
        let mac = nia::compute_mac(
            self.integrity,
            &self.knas_int,
            count.value(),
            NAS_BEARER,
            Direction::Downlink,
            &body,
        )?;
        self.dl_count.increment()?;

        let mut pdu = BytesMut::with_capacity(SECURITY_HEADER_LEN + message.len());
        pdu.put_u8(EPD_5GMM);
        pdu.put_u8(header_type as u8);
        pdu.put_slice(&mac);
        pdu.put_slice(&body);
        Ok(pdu.freeze())
    }

    /// Verify and decipher an uplink protected PDU
    ///
    /// On MAC failure the context is left untouched.
    pub fn unprotect(&mut self, pdu: &[u8]) -> Result<UnprotectedPdu, NasSecurityError> {
        let header_type = security_header_type(pdu)?;
        if header_type == SecurityHeaderType::Plain {
            return Err(NasSecurityError::InvalidHeader(
                NasCodecError::InvalidSecurityHeader(0),
            ));
        }
        if pdu.len() < SECURITY_HEADER_LEN {
            return Err(NasSecurityError::MessageTooShort(pdu.len()));
        }
        if self.state == SecurityContextState::NotAvailable {
            return Err(NasSecurityError::NoSecurityContext);
        }

        let mut mac = [0u8; MAC_LEN];
        mac.copy_from_slice(&pdu[2..6]);
        let sqn = pdu[6];

        let expected = if self.ul_seen {
            self.ul_count.value() + 1
        } else {
            0
        };
        let count = NasCount::estimate(expected, sqn);
        if count > NAS_COUNT_MAX {
            return Err(NasSecurityError::CountExhausted);
        }

        let computed = nia::compute_mac(
            self.integrity,
            &self.knas_int,
            count,
            NAS_BEARER,
            Direction::Uplink,
            &pdu[6..],
        )?;
        if self.integrity != IntegrityAlgorithm::Nia0 && computed != mac {
            return Err(NasSecurityError::MacMismatch { count });
        }

        let mut message = pdu[SECURITY_HEADER_LEN..].to_vec();
        if header_type.is_ciphered() {
            nea::apply(
                self.ciphering,
                &self.knas_enc,
                count,
                NAS_BEARER,
                Direction::Uplink,
                &mut message,
            )?;
        }
        self.ul_count = NasCount::from_value(count);
        self.ul_seen = true;

        Ok(UnprotectedPdu {
            header_type,
            count,
            message: Bytes::from(message),
        })
    }
}

/// Pick the first configured algorithm pair the UE supports
///
/// Falls back to NIA0/NEA0 when nothing in the preference order matches.
pub fn select_algorithms(
    capability: &UeSecurityCapability,
    integrity_order: &[IntegrityAlgorithm],
    ciphering_order: &[CipheringAlgorithm],
) -> (IntegrityAlgorithm, CipheringAlgorithm) {
    let integrity = integrity_order
        .iter()
        .copied()
        .find(|alg| capability.supports_integrity(*alg))
        .unwrap_or(IntegrityAlgorithm::Nia0);
    let ciphering = ciphering_order
        .iter()
        .copied()
        .find(|alg| capability.supports_ciphering(*alg))
        .unwrap_or(CipheringAlgorithm::Nea0);
    (integrity, ciphering)
}

/// ngKSI assigned to a fresh authentication of this subscriber
pub fn fresh_ngksi(amf_ue_id: u64) -> u8 {
    ((amf_ue_id + 1) % NGKSI_RANGE as u64) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active(integrity: IntegrityAlgorithm, ciphering: CipheringAlgorithm) -> NasSecurityContext {
        let mut ctx = NasSecurityContext::new(1, [0x42; KEY256_LEN]);
        ctx.activate(integrity, ciphering);
        ctx.complete();
        ctx
    }

    /// Uplink PDU built the way a UE would
    fn uplink(ctx: &NasSecurityContext, count: u32, message: &[u8], ciphered: bool) -> Vec<u8> {
        let mut body = vec![(count & 0xff) as u8];
        body.extend_from_slice(message);
        if ciphered {
            nea::apply(
                ctx.ciphering,
                &ctx.knas_enc,
                count,
                NAS_BEARER,
                Direction::Uplink,
                &mut body[1..],
            )
            .unwrap();
        }
        let mac = nia::compute_mac(
            ctx.integrity,
            &ctx.knas_int,
            count,
            NAS_BEARER,
            Direction::Uplink,
            &body,
        )
        .unwrap();
        let sht = if ciphered { 2 } else { 1 };
        let mut pdu = vec![EPD_5GMM, sht];
        pdu.extend_from_slice(&mac);
        pdu.extend_from_slice(&body);
        pdu
    }

    #[test]
    fn test_count_estimate_crosses_overflow() {
        assert_eq!(NasCount::estimate(0, 0), 0);
        assert_eq!(NasCount::estimate(0x00fe, 0xff), 0x00ff);
        assert_eq!(NasCount::estimate(0x0100, 0x00), 0x0100);
        assert_eq!(NasCount::estimate(0x01ff, 0x02), 0x0202);
    }

    #[test]
    fn test_count_exhausted() {
        let mut count = NasCount::from_value(NAS_COUNT_MAX);
        assert_eq!(count.increment(), Err(NasSecurityError::CountExhausted));
        let mut count = NasCount::from_value(0xff);
        count.increment().unwrap();
        assert_eq!(count, NasCount { overflow: 1, sqn: 0 });
    }

    #[test]
    fn test_downlink_count_increments_by_one() {
        let mut ctx = active(IntegrityAlgorithm::Nia2, CipheringAlgorithm::Nea2);
        for expected in 0u8..5 {
            let pdu = ctx
                .protect(&[0x7e, 0x00, 0x42], SecurityHeaderType::IntegrityProtectedAndCiphered)
                .unwrap();
            assert_eq!(pdu[6], expected);
        }
        assert_eq!(ctx.dl_count(), 5);
    }

    #[test]
    fn test_uplink_verify_and_decipher() {
        let mut ctx = active(IntegrityAlgorithm::Nia2, CipheringAlgorithm::Nea2);
        let message = [0x7e, 0x00, 0x43];
        let pdu = uplink(&ctx, 0, &message, true);
        let out = ctx.unprotect(&pdu).unwrap();
        assert_eq!(out.message.as_ref(), &message);
        assert_eq!(out.count, 0);

        let pdu = uplink(&ctx, 1, &message, true);
        assert_eq!(ctx.unprotect(&pdu).unwrap().count, 1);
        assert_eq!(ctx.ul_count(), 1);
    }

    #[test]
    fn test_uplink_mac_failure_leaves_state() {
        let mut ctx = active(IntegrityAlgorithm::Nia2, CipheringAlgorithm::Nea0);
        let mut pdu = uplink(&ctx, 0, &[0x7e, 0x00, 0x43], false);
        pdu[3] ^= 0x01;
        assert!(matches!(
            ctx.unprotect(&pdu),
            Err(NasSecurityError::MacMismatch { .. })
        ));
        let pdu = uplink(&ctx, 0, &[0x7e, 0x00, 0x43], false);
        assert!(ctx.unprotect(&pdu).is_ok());
    }

    #[test]
    fn test_activate_resets_counters() {
        let mut ctx = active(IntegrityAlgorithm::Nia2, CipheringAlgorithm::Nea2);
        ctx.protect(&[1, 2, 3], SecurityHeaderType::IntegrityProtected).unwrap();
        assert_eq!(ctx.dl_count(), 1);
        ctx.activate(IntegrityAlgorithm::Nia3, CipheringAlgorithm::Nea3);
        assert_eq!(ctx.dl_count(), 0);
        assert_eq!(ctx.ul_count(), 0);
        assert_eq!(ctx.state(), SecurityContextState::Partial);
    }

    #[test]
    fn test_partial_context_only_protects_new_context_header() {
        let mut ctx = NasSecurityContext::new(0, [1; KEY256_LEN]);
        assert_eq!(
            ctx.protect(&[1], SecurityHeaderType::IntegrityProtected),
            Err(NasSecurityError::NoSecurityContext)
        );
        ctx.activate(IntegrityAlgorithm::Nia2, CipheringAlgorithm::Nea0);
        assert!(ctx
            .protect(&[1], SecurityHeaderType::IntegrityProtectedWithNewContext)
            .is_ok());
        assert!(ctx.protect(&[1], SecurityHeaderType::IntegrityProtected).is_err());
        assert!(ctx.complete());
        assert!(!ctx.complete());
    }

    #[test]
    fn test_next_hop_wraps_ncc() {
        let mut ctx = active(IntegrityAlgorithm::Nia2, CipheringAlgorithm::Nea2);
        let kgnb = ctx.initial_kgnb();
        assert_eq!(ctx.nh(), &kgnb);
        let pending = ctx.pending_next_hop();
        assert_eq!(ctx.ncc(), 0);
        assert_eq!(ctx.nh(), &kgnb);
        let (ncc, nh1) = ctx.next_hop();
        assert_eq!((ncc, nh1), pending);
        assert_eq!(ncc, 1);
        assert_ne!(nh1, kgnb);
        for _ in 0..7 {
            ctx.next_hop();
        }
        assert_eq!(ctx.ncc(), 0);
    }

    #[test]
    fn test_select_algorithms_prefers_configured_order() {
        let cap = UeSecurityCapability::new(0xf0, 0x70);
        let (int, enc) = select_algorithms(
            &cap,
            &[IntegrityAlgorithm::Nia2, IntegrityAlgorithm::Nia1],
            &[CipheringAlgorithm::Nea1, CipheringAlgorithm::Nea2, CipheringAlgorithm::Nea0],
        );
        assert_eq!(int, IntegrityAlgorithm::Nia2);
        assert_eq!(enc, CipheringAlgorithm::Nea1);
    }

    #[test]
    fn test_select_algorithms_snow3g_only_ue() {
        // EA1/IA1 only, besides the null algorithms
        let cap = UeSecurityCapability::new(0xc0, 0xc0);
        let (int, enc) = select_algorithms(
            &cap,
            &[IntegrityAlgorithm::Nia2, IntegrityAlgorithm::Nia1, IntegrityAlgorithm::Nia0],
            &[CipheringAlgorithm::Nea2, CipheringAlgorithm::Nea1, CipheringAlgorithm::Nea0],
        );
        assert_eq!(int, IntegrityAlgorithm::Nia1);
        assert_eq!(enc, CipheringAlgorithm::Nea1);

        let mut ctx = active(int, enc);
        let message = [0x7e, 0x00, 0x5e];
        let pdu = uplink(&ctx, 0, &message, true);
        assert_eq!(ctx.unprotect(&pdu).unwrap().message.as_ref(), &message);
    }

    #[test]
    fn test_select_algorithms_fallback() {
        let cap = UeSecurityCapability::new(0x40, 0x40);
        let (int, enc) = select_algorithms(
            &cap,
            &[IntegrityAlgorithm::Nia2],
            &[CipheringAlgorithm::Nea2],
        );
        assert_eq!(int, IntegrityAlgorithm::Nia0);
        assert_eq!(enc, CipheringAlgorithm::Nea0);
    }

    #[test]
    fn test_fresh_ngksi() {
        assert_eq!(fresh_ngksi(1), 2);
        assert_eq!(fresh_ngksi(6), 0);
    }
}

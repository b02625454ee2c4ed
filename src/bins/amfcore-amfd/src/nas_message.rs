//! 5GMM message catalog and codec
//!
//! Message types and cause values follow TS 24.501. The information element
//! layout is a compact tag/length/value form (one byte IEI, two byte length)
//! rather than the full TS 24.501 grammar:
//!
//! ```text
//! plain:     [EPD 0x7e][SHT 0][message type][IE]...
//! protected: [EPD 0x7e][SHT][MAC x4][SQN][plain or ciphered 5GMM message]
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use amfcore_crypt::nea::CipheringAlgorithm;
use amfcore_crypt::nia::IntegrityAlgorithm;

use crate::types::{Guti, Plmn, STmsi, Snssai, Supi, Tai};

/// Extended protocol discriminator of 5GMM messages
pub const EPD_5GMM: u8 = 0x7e;

/// Length of the security protected header (EPD, SHT, MAC, SQN)
pub const SECURITY_HEADER_LEN: usize = 7;

/// Codec errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NasCodecError {
    #[error("buffer too short: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("invalid extended protocol discriminator: {0:#04x}")]
    InvalidEpd(u8),
    #[error("invalid security header type: {0}")]
    InvalidSecurityHeader(u8),
    #[error("unknown message type: {0:#04x}")]
    UnknownMessageType(u8),
    #[error("malformed IE {iei:#04x}: {reason}")]
    BadIe { iei: u8, reason: &'static str },
    #[error("missing mandatory IE: {0}")]
    MissingIe(&'static str),
}

pub type NasResult<T> = Result<T, NasCodecError>;

// ============================================================================
// Constants
// ============================================================================

/// 5GMM message types
pub mod message_type {
    pub const REGISTRATION_REQUEST: u8 = 0x41;
    pub const REGISTRATION_ACCEPT: u8 = 0x42;
    pub const REGISTRATION_COMPLETE: u8 = 0x43;
    pub const REGISTRATION_REJECT: u8 = 0x44;
    pub const DEREGISTRATION_REQUEST: u8 = 0x45;
    pub const DEREGISTRATION_ACCEPT: u8 = 0x46;
    pub const SERVICE_REQUEST: u8 = 0x4c;
    pub const SERVICE_REJECT: u8 = 0x4d;
    pub const SERVICE_ACCEPT: u8 = 0x4e;
    pub const AUTHENTICATION_REQUEST: u8 = 0x56;
    pub const AUTHENTICATION_RESPONSE: u8 = 0x57;
    pub const AUTHENTICATION_REJECT: u8 = 0x58;
    pub const AUTHENTICATION_FAILURE: u8 = 0x59;
    pub const IDENTITY_REQUEST: u8 = 0x5b;
    pub const IDENTITY_RESPONSE: u8 = 0x5c;
    pub const SECURITY_MODE_COMMAND: u8 = 0x5d;
    pub const SECURITY_MODE_COMPLETE: u8 = 0x5e;
    pub const SECURITY_MODE_REJECT: u8 = 0x5f;
    pub const UL_NAS_TRANSPORT: u8 = 0x67;
    pub const DL_NAS_TRANSPORT: u8 = 0x68;
}

/// 5GMM cause values
pub mod cause {
    pub const ILLEGAL_UE: u8 = 3;
    pub const UE_IDENTITY_CANNOT_BE_DERIVED: u8 = 9;
    pub const IMPLICITLY_DEREGISTERED: u8 = 10;
    pub const PLMN_NOT_ALLOWED: u8 = 11;
    pub const MAC_FAILURE: u8 = 20;
    pub const SYNCH_FAILURE: u8 = 21;
    pub const SECURITY_MODE_REJECTED_UNSPECIFIED: u8 = 24;
    pub const NON_5G_AUTHENTICATION_UNACCEPTABLE: u8 = 26;
    pub const NO_NETWORK_SLICES_AVAILABLE: u8 = 62;
    pub const PAYLOAD_WAS_NOT_FORWARDED: u8 = 90;
    pub const NGKSI_ALREADY_IN_USE: u8 = 71;
    pub const SEMANTICALLY_INCORRECT_MESSAGE: u8 = 95;
    pub const PROTOCOL_ERROR_UNSPECIFIED: u8 = 111;
}

/// Information element identifiers
mod iei {
    pub const REGISTRATION_TYPE: u8 = 0x01;
    pub const NGKSI: u8 = 0x02;
    pub const MOBILE_IDENTITY: u8 = 0x03;
    pub const REQUEST_TYPE: u8 = 0x08;
    pub const PDU_SESSION_ID: u8 = 0x12;
    pub const ALLOWED_NSSAI: u8 = 0x15;
    pub const AUTN: u8 = 0x20;
    pub const RAND: u8 = 0x21;
    pub const SNSSAI: u8 = 0x22;
    pub const NETWORK_FEATURE_SUPPORT: u8 = 0x23;
    pub const DNN: u8 = 0x25;
    pub const REACTIVATION_RESULT: u8 = 0x26;
    pub const RES_STAR: u8 = 0x2d;
    pub const UE_SECURITY_CAPABILITY: u8 = 0x2e;
    pub const REQUESTED_NSSAI: u8 = 0x2f;
    pub const AUTS: u8 = 0x30;
    pub const IMEISV: u8 = 0x31;
    pub const IDENTITY_TYPE: u8 = 0x32;
    pub const DEREGISTRATION_TYPE: u8 = 0x33;
    pub const SERVICE_TYPE: u8 = 0x34;
    pub const PAYLOAD_CONTAINER_TYPE: u8 = 0x35;
    pub const REGISTRATION_RESULT: u8 = 0x36;
    pub const ABBA: u8 = 0x38;
    pub const UPLINK_DATA_STATUS: u8 = 0x40;
    pub const NETWORK_NAME: u8 = 0x43;
    pub const PDU_SESSION_STATUS: u8 = 0x50;
    pub const TAI_LIST: u8 = 0x54;
    pub const SELECTED_ALGORITHMS: u8 = 0x57;
    pub const CAUSE: u8 = 0x58;
    pub const T3512: u8 = 0x5e;
    pub const NAS_CONTAINER: u8 = 0x71;
    pub const GUTI: u8 = 0x77;
    pub const PAYLOAD_CONTAINER: u8 = 0x7b;
    pub const IMEISV_REQUEST: u8 = 0xe0;
}

/// Security header type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SecurityHeaderType {
    Plain = 0,
    IntegrityProtected = 1,
    IntegrityProtectedAndCiphered = 2,
    IntegrityProtectedWithNewContext = 3,
    IntegrityProtectedAndCipheredWithNewContext = 4,
}

impl SecurityHeaderType {
    pub fn from_u8(value: u8) -> NasResult<Self> {
        match value {
            0 => Ok(Self::Plain),
            1 => Ok(Self::IntegrityProtected),
            2 => Ok(Self::IntegrityProtectedAndCiphered),
            3 => Ok(Self::IntegrityProtectedWithNewContext),
            4 => Ok(Self::IntegrityProtectedAndCipheredWithNewContext),
            other => Err(NasCodecError::InvalidSecurityHeader(other)),
        }
    }

    pub fn is_ciphered(self) -> bool {
        matches!(
            self,
            Self::IntegrityProtectedAndCiphered | Self::IntegrityProtectedAndCipheredWithNewContext
        )
    }

    pub fn is_new_context(self) -> bool {
        matches!(
            self,
            Self::IntegrityProtectedWithNewContext
                | Self::IntegrityProtectedAndCipheredWithNewContext
        )
    }
}

/// Security header type of a NAS PDU
pub fn security_header_type(pdu: &[u8]) -> NasResult<SecurityHeaderType> {
    if pdu.len() < 2 {
        return Err(NasCodecError::Truncated {
            expected: 2,
            actual: pdu.len(),
        });
    }
    if pdu[0] != EPD_5GMM {
        return Err(NasCodecError::InvalidEpd(pdu[0]));
    }
    SecurityHeaderType::from_u8(pdu[1] & 0x0f)
}

// ============================================================================
// Information element types
// ============================================================================

/// 5GS registration type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RegistrationType {
    #[default]
    Initial = 1,
    MobilityUpdating = 2,
    PeriodicUpdating = 3,
    Emergency = 4,
}

impl RegistrationType {
    fn from_u8(value: u8) -> NasResult<Self> {
        match value {
            1 => Ok(Self::Initial),
            2 => Ok(Self::MobilityUpdating),
            3 => Ok(Self::PeriodicUpdating),
            4 => Ok(Self::Emergency),
            _ => Err(NasCodecError::BadIe {
                iei: iei::REGISTRATION_TYPE,
                reason: "unknown registration type",
            }),
        }
    }
}

/// Requested identity type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityType {
    Suci = 1,
    Guti = 2,
    Imei = 3,
    STmsi = 4,
    Imeisv = 5,
}

impl IdentityType {
    fn from_u8(value: u8) -> NasResult<Self> {
        match value {
            1 => Ok(Self::Suci),
            2 => Ok(Self::Guti),
            3 => Ok(Self::Imei),
            4 => Ok(Self::STmsi),
            5 => Ok(Self::Imeisv),
            _ => Err(NasCodecError::BadIe {
                iei: iei::IDENTITY_TYPE,
                reason: "unknown identity type",
            }),
        }
    }
}

/// SUCI with the null protection scheme
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Suci {
    pub plmn: Plmn,
    pub msin: String,
}

impl Suci {
    pub fn to_supi(&self) -> Supi {
        Supi::from_imsi(&format!("{}{}{}", self.plmn.mcc, self.plmn.mnc, self.msin))
    }
}

/// 5GS mobile identity
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum MobileIdentity {
    #[default]
    NoIdentity,
    Suci(Suci),
    Guti(Guti),
    Imei(String),
    STmsi(STmsi),
}

impl MobileIdentity {
    pub fn type_name(&self) -> &'static str {
        match self {
            MobileIdentity::NoIdentity => "no-identity",
            MobileIdentity::Suci(_) => "SUCI",
            MobileIdentity::Guti(_) => "5G-GUTI",
            MobileIdentity::Imei(_) => "IMEI",
            MobileIdentity::STmsi(_) => "5G-S-TMSI",
        }
    }

    fn encode(&self, buf: &mut BytesMut) {
        match self {
            MobileIdentity::NoIdentity => buf.put_u8(0),
            MobileIdentity::Suci(suci) => {
                buf.put_u8(1);
                put_plmn(buf, &suci.plmn);
                put_str(buf, &suci.msin);
            }
            MobileIdentity::Guti(guti) => {
                buf.put_u8(2);
                put_plmn(buf, &guti.plmn);
                buf.put_u8(guti.region_id);
                buf.put_u16(guti.set_id);
                buf.put_u8(guti.pointer);
                buf.put_u32(guti.tmsi);
            }
            MobileIdentity::Imei(imei) => {
                buf.put_u8(3);
                put_str(buf, imei);
            }
            MobileIdentity::STmsi(s_tmsi) => {
                buf.put_u8(4);
                buf.put_u16(s_tmsi.set_id);
                buf.put_u8(s_tmsi.pointer);
                buf.put_u32(s_tmsi.tmsi);
            }
        }
    }

    fn decode(buf: &mut Bytes) -> NasResult<Self> {
        match get_u8(buf)? {
            0 => Ok(MobileIdentity::NoIdentity),
            1 => Ok(MobileIdentity::Suci(Suci {
                plmn: get_plmn(buf)?,
                msin: get_str(buf)?,
            })),
            2 => Ok(MobileIdentity::Guti(Guti {
                plmn: get_plmn(buf)?,
                region_id: get_u8(buf)?,
                set_id: get_u16(buf)?,
                pointer: get_u8(buf)?,
                tmsi: get_u32(buf)?,
            })),
            3 => Ok(MobileIdentity::Imei(get_str(buf)?)),
            4 => Ok(MobileIdentity::STmsi(STmsi {
                set_id: get_u16(buf)?,
                pointer: get_u8(buf)?,
                tmsi: get_u32(buf)?,
            })),
            _ => Err(NasCodecError::BadIe {
                iei: iei::MOBILE_IDENTITY,
                reason: "unknown identity type",
            }),
        }
    }
}

/// UE security capability (5G-EA and 5G-IA bitmaps, algorithm 0 in the MSB)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct UeSecurityCapability {
    pub nea: u8,
    pub nia: u8,
}

impl UeSecurityCapability {
    pub fn new(nea: u8, nia: u8) -> Self {
        Self { nea, nia }
    }

    pub fn supports_ciphering(&self, algorithm: CipheringAlgorithm) -> bool {
        self.nea & (0x80 >> algorithm.id()) != 0
    }

    pub fn supports_integrity(&self, algorithm: IntegrityAlgorithm) -> bool {
        self.nia & (0x80 >> algorithm.id()) != 0
    }
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RegistrationRequest {
    pub registration_type: RegistrationType,
    pub follow_on_request: bool,
    pub ngksi: u8,
    pub identity: MobileIdentity,
    pub ue_security_capability: Option<UeSecurityCapability>,
    pub requested_nssai: Vec<Snssai>,
    pub pdu_session_status: Option<u16>,
    pub uplink_data_status: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RegistrationAccept {
    /// 5GS registration result (1 = 3GPP access)
    pub result: u8,
    pub guti: Option<Guti>,
    pub allowed_nssai: Vec<Snssai>,
    pub tai_list: Vec<Tai>,
    pub network_feature_support: Option<u8>,
    pub network_name: Option<String>,
    /// T3512 in seconds
    pub t3512: Option<u32>,
    pub pdu_session_status: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeregistrationRequest {
    pub switch_off: bool,
    /// 1 = 3GPP, 2 = non-3GPP, 3 = both
    pub access_type: u8,
    pub ngksi: u8,
    pub identity: MobileIdentity,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServiceRequest {
    pub service_type: u8,
    pub ngksi: u8,
    pub identity: MobileIdentity,
    pub uplink_data_status: Option<u16>,
    pub pdu_session_status: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServiceAccept {
    pub pdu_session_status: Option<u16>,
    pub reactivation_result: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticationRequest {
    pub ngksi: u8,
    pub abba: Vec<u8>,
    pub rand: [u8; 16],
    pub autn: [u8; 16],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityModeCommand {
    pub integrity: IntegrityAlgorithm,
    pub ciphering: CipheringAlgorithm,
    pub ngksi: u8,
    pub replayed_capability: UeSecurityCapability,
    pub imeisv_request: bool,
    pub abba: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UlNasTransport {
    /// 1 = N1 SM information
    pub payload_container_type: u8,
    pub payload: Bytes,
    pub pdu_session_id: Option<u8>,
    /// 1 = initial request, 2 = existing PDU session
    pub request_type: Option<u8>,
    pub snssai: Option<Snssai>,
    pub dnn: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DlNasTransport {
    pub payload_container_type: u8,
    pub payload: Bytes,
    pub pdu_session_id: Option<u8>,
    pub cause: Option<u8>,
}

/// PDU session request types carried in UL NAS Transport
pub mod request_type {
    pub const INITIAL_REQUEST: u8 = 1;
    pub const EXISTING_PDU_SESSION: u8 = 2;
}

/// Payload container type for N1 SM information
pub const PAYLOAD_CONTAINER_N1_SM: u8 = 1;

/// 5GMM messages
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NasMessage {
    RegistrationRequest(RegistrationRequest),
    RegistrationAccept(RegistrationAccept),
    RegistrationComplete,
    RegistrationReject { cause: u8 },
    DeregistrationRequest(DeregistrationRequest),
    DeregistrationAccept,
    ServiceRequest(ServiceRequest),
    ServiceAccept(ServiceAccept),
    ServiceReject { cause: u8 },
    AuthenticationRequest(AuthenticationRequest),
    AuthenticationResponse { res_star: Option<[u8; 16]> },
    AuthenticationReject,
    AuthenticationFailure { cause: u8, auts: Option<[u8; 14]> },
    IdentityRequest { identity_type: IdentityType },
    IdentityResponse { identity: MobileIdentity },
    SecurityModeCommand(SecurityModeCommand),
    SecurityModeComplete { imeisv: Option<String>, nas_container: Option<Bytes> },
    SecurityModeReject { cause: u8 },
    UlNasTransport(UlNasTransport),
    DlNasTransport(DlNasTransport),
}

impl NasMessage {
    pub fn message_type(&self) -> u8 {
        use message_type::*;
        match self {
            NasMessage::RegistrationRequest(_) => REGISTRATION_REQUEST,
            NasMessage::RegistrationAccept(_) => REGISTRATION_ACCEPT,
            NasMessage::RegistrationComplete => REGISTRATION_COMPLETE,
            NasMessage::RegistrationReject { .. } => REGISTRATION_REJECT,
            NasMessage::DeregistrationRequest(_) => DEREGISTRATION_REQUEST,
            NasMessage::DeregistrationAccept => DEREGISTRATION_ACCEPT,
            NasMessage::ServiceRequest(_) => SERVICE_REQUEST,
            NasMessage::ServiceAccept(_) => SERVICE_ACCEPT,
            NasMessage::ServiceReject { .. } => SERVICE_REJECT,
            NasMessage::AuthenticationRequest(_) => AUTHENTICATION_REQUEST,
            NasMessage::AuthenticationResponse { .. } => AUTHENTICATION_RESPONSE,
            NasMessage::AuthenticationReject => AUTHENTICATION_REJECT,
            NasMessage::AuthenticationFailure { .. } => AUTHENTICATION_FAILURE,
            NasMessage::IdentityRequest { .. } => IDENTITY_REQUEST,
            NasMessage::IdentityResponse { .. } => IDENTITY_RESPONSE,
            NasMessage::SecurityModeCommand(_) => SECURITY_MODE_COMMAND,
            NasMessage::SecurityModeComplete { .. } => SECURITY_MODE_COMPLETE,
            NasMessage::SecurityModeReject { .. } => SECURITY_MODE_REJECT,
            NasMessage::UlNasTransport(_) => UL_NAS_TRANSPORT,
            NasMessage::DlNasTransport(_) => DL_NAS_TRANSPORT,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            NasMessage::RegistrationRequest(_) => "Registration Request",
            NasMessage::RegistrationAccept(_) => "Registration Accept",
            NasMessage::RegistrationComplete => "Registration Complete",
            NasMessage::RegistrationReject { .. } => "Registration Reject",
            NasMessage::DeregistrationRequest(_) => "Deregistration Request",
            NasMessage::DeregistrationAccept => "Deregistration Accept",
            NasMessage::ServiceRequest(_) => "Service Request",
            NasMessage::ServiceAccept(_) => "Service Accept",
            NasMessage::ServiceReject { .. } => "Service Reject",
            NasMessage::AuthenticationRequest(_) => "Authentication Request",
            NasMessage::AuthenticationResponse { .. } => "Authentication Response",
            NasMessage::AuthenticationReject => "Authentication Reject",
            NasMessage::AuthenticationFailure { .. } => "Authentication Failure",
            NasMessage::IdentityRequest { .. } => "Identity Request",
            NasMessage::IdentityResponse { .. } => "Identity Response",
            NasMessage::SecurityModeCommand(_) => "Security Mode Command",
            NasMessage::SecurityModeComplete { .. } => "Security Mode Complete",
            NasMessage::SecurityModeReject { .. } => "Security Mode Reject",
            NasMessage::UlNasTransport(_) => "UL NAS Transport",
            NasMessage::DlNasTransport(_) => "DL NAS Transport",
        }
    }

    /// Messages a UE may send without a security context
    pub fn allowed_unprotected(&self) -> bool {
        matches!(
            self,
            NasMessage::RegistrationRequest(_)
                | NasMessage::IdentityResponse { .. }
                | NasMessage::AuthenticationResponse { .. }
                | NasMessage::AuthenticationFailure { .. }
                | NasMessage::DeregistrationRequest(_)
                | NasMessage::ServiceRequest(_)
                | NasMessage::SecurityModeReject { .. }
        )
    }

    /// Encode as a plain 5GMM message
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64);
        buf.put_u8(EPD_5GMM);
        buf.put_u8(SecurityHeaderType::Plain as u8);
        buf.put_u8(self.message_type());

        match self {
            NasMessage::RegistrationRequest(m) => {
                let mut reg_type = m.registration_type as u8;
                if m.follow_on_request {
                    reg_type |= 0x08;
                }
                put_ie(&mut buf, iei::REGISTRATION_TYPE, &[reg_type]);
                put_ie(&mut buf, iei::NGKSI, &[m.ngksi]);
                put_identity(&mut buf, iei::MOBILE_IDENTITY, &m.identity);
                if let Some(cap) = m.ue_security_capability {
                    put_ie(&mut buf, iei::UE_SECURITY_CAPABILITY, &[cap.nea, cap.nia]);
                }
                if !m.requested_nssai.is_empty() {
                    put_nssai(&mut buf, iei::REQUESTED_NSSAI, &m.requested_nssai);
                }
                put_opt_u16(&mut buf, iei::PDU_SESSION_STATUS, m.pdu_session_status);
                put_opt_u16(&mut buf, iei::UPLINK_DATA_STATUS, m.uplink_data_status);
            }
            NasMessage::RegistrationAccept(m) => {
                put_ie(&mut buf, iei::REGISTRATION_RESULT, &[m.result]);
                if let Some(guti) = &m.guti {
                    put_identity(&mut buf, iei::GUTI, &MobileIdentity::Guti(guti.clone()));
                }
                if !m.allowed_nssai.is_empty() {
                    put_nssai(&mut buf, iei::ALLOWED_NSSAI, &m.allowed_nssai);
                }
                if !m.tai_list.is_empty() {
                    let mut value = BytesMut::new();
                    value.put_u8(m.tai_list.len() as u8);
                    for tai in &m.tai_list {
                        put_plmn(&mut value, &tai.plmn);
                        value.put_u32(tai.tac);
                    }
                    put_ie(&mut buf, iei::TAI_LIST, &value);
                }
                if let Some(nfs) = m.network_feature_support {
                    put_ie(&mut buf, iei::NETWORK_FEATURE_SUPPORT, &[nfs]);
                }
                if let Some(name) = &m.network_name {
                    put_ie(&mut buf, iei::NETWORK_NAME, name.as_bytes());
                }
                if let Some(t3512) = m.t3512 {
                    put_ie(&mut buf, iei::T3512, &t3512.to_be_bytes());
                }
                put_opt_u16(&mut buf, iei::PDU_SESSION_STATUS, m.pdu_session_status);
            }
            NasMessage::RegistrationComplete
            | NasMessage::DeregistrationAccept
            | NasMessage::AuthenticationReject => {}
            NasMessage::RegistrationReject { cause }
            | NasMessage::ServiceReject { cause }
            | NasMessage::SecurityModeReject { cause } => {
                put_ie(&mut buf, iei::CAUSE, &[*cause]);
            }
            NasMessage::DeregistrationRequest(m) => {
                let mut dereg_type = m.access_type & 0x03;
                if m.switch_off {
                    dereg_type |= 0x08;
                }
                put_ie(&mut buf, iei::DEREGISTRATION_TYPE, &[dereg_type]);
                put_ie(&mut buf, iei::NGKSI, &[m.ngksi]);
                put_identity(&mut buf, iei::MOBILE_IDENTITY, &m.identity);
            }
            NasMessage::ServiceRequest(m) => {
                put_ie(&mut buf, iei::SERVICE_TYPE, &[m.service_type]);
                put_ie(&mut buf, iei::NGKSI, &[m.ngksi]);
                put_identity(&mut buf, iei::MOBILE_IDENTITY, &m.identity);
                put_opt_u16(&mut buf, iei::UPLINK_DATA_STATUS, m.uplink_data_status);
                put_opt_u16(&mut buf, iei::PDU_SESSION_STATUS, m.pdu_session_status);
            }
            NasMessage::ServiceAccept(m) => {
                put_opt_u16(&mut buf, iei::PDU_SESSION_STATUS, m.pdu_session_status);
                put_opt_u16(&mut buf, iei::REACTIVATION_RESULT, m.reactivation_result);
            }
            NasMessage::AuthenticationRequest(m) => {
                put_ie(&mut buf, iei::NGKSI, &[m.ngksi]);
                put_ie(&mut buf, iei::ABBA, &m.abba);
                put_ie(&mut buf, iei::RAND, &m.rand);
                put_ie(&mut buf, iei::AUTN, &m.autn);
            }
            NasMessage::AuthenticationResponse { res_star } => {
                if let Some(res_star) = res_star {
                    put_ie(&mut buf, iei::RES_STAR, res_star);
                }
            }
            NasMessage::AuthenticationFailure { cause, auts } => {
                put_ie(&mut buf, iei::CAUSE, &[*cause]);
                if let Some(auts) = auts {
                    put_ie(&mut buf, iei::AUTS, auts);
                }
            }
            NasMessage::IdentityRequest { identity_type } => {
                put_ie(&mut buf, iei::IDENTITY_TYPE, &[*identity_type as u8]);
            }
            NasMessage::IdentityResponse { identity } => {
                put_identity(&mut buf, iei::MOBILE_IDENTITY, identity);
            }
            NasMessage::SecurityModeCommand(m) => {
                put_ie(
                    &mut buf,
                    iei::SELECTED_ALGORITHMS,
                    &[(m.ciphering.id() << 4) | m.integrity.id()],
                );
                put_ie(&mut buf, iei::NGKSI, &[m.ngksi]);
                put_ie(
                    &mut buf,
                    iei::UE_SECURITY_CAPABILITY,
                    &[m.replayed_capability.nea, m.replayed_capability.nia],
                );
                if m.imeisv_request {
                    put_ie(&mut buf, iei::IMEISV_REQUEST, &[1]);
                }
                put_ie(&mut buf, iei::ABBA, &m.abba);
            }
            NasMessage::SecurityModeComplete {
                imeisv,
                nas_container,
            } => {
                if let Some(imeisv) = imeisv {
                    put_ie(&mut buf, iei::IMEISV, imeisv.as_bytes());
                }
                if let Some(container) = nas_container {
                    put_ie(&mut buf, iei::NAS_CONTAINER, container);
                }
            }
            NasMessage::UlNasTransport(m) => {
                put_ie(&mut buf, iei::PAYLOAD_CONTAINER_TYPE, &[m.payload_container_type]);
                put_ie(&mut buf, iei::PAYLOAD_CONTAINER, &m.payload);
                if let Some(id) = m.pdu_session_id {
                    put_ie(&mut buf, iei::PDU_SESSION_ID, &[id]);
                }
                if let Some(request_type) = m.request_type {
                    put_ie(&mut buf, iei::REQUEST_TYPE, &[request_type]);
                }
                if let Some(snssai) = m.snssai {
                    put_nssai(&mut buf, iei::SNSSAI, &[snssai]);
                }
                if let Some(dnn) = &m.dnn {
                    put_ie(&mut buf, iei::DNN, dnn.as_bytes());
                }
            }
            NasMessage::DlNasTransport(m) => {
                put_ie(&mut buf, iei::PAYLOAD_CONTAINER_TYPE, &[m.payload_container_type]);
                put_ie(&mut buf, iei::PAYLOAD_CONTAINER, &m.payload);
                if let Some(id) = m.pdu_session_id {
                    put_ie(&mut buf, iei::PDU_SESSION_ID, &[id]);
                }
                if let Some(cause) = m.cause {
                    put_ie(&mut buf, iei::CAUSE, &[cause]);
                }
            }
        }
        buf.freeze()
    }

    /// Decode a plain 5GMM message
    pub fn decode(pdu: &[u8]) -> NasResult<Self> {
        let sht = security_header_type(pdu)?;
        if sht != SecurityHeaderType::Plain {
            return Err(NasCodecError::InvalidSecurityHeader(sht as u8));
        }
        let mut buf = Bytes::copy_from_slice(&pdu[2..]);
        let msg_type = get_u8(&mut buf)?;
        let ies = Ies::parse(buf)?;

        use message_type::*;
        let msg = match msg_type {
            REGISTRATION_REQUEST => {
                let reg_type = ies.u8(iei::REGISTRATION_TYPE, "5GS registration type")?;
                NasMessage::RegistrationRequest(RegistrationRequest {
                    registration_type: RegistrationType::from_u8(reg_type & 0x07)?,
                    follow_on_request: reg_type & 0x08 != 0,
                    ngksi: ies.u8(iei::NGKSI, "ngKSI")?,
                    identity: ies.identity(iei::MOBILE_IDENTITY, "5GS mobile identity")?,
                    ue_security_capability: ies.capability()?,
                    requested_nssai: ies.nssai(iei::REQUESTED_NSSAI)?,
                    pdu_session_status: ies.opt_u16(iei::PDU_SESSION_STATUS)?,
                    uplink_data_status: ies.opt_u16(iei::UPLINK_DATA_STATUS)?,
                })
            }
            REGISTRATION_ACCEPT => {
                let guti = match ies.get(iei::GUTI) {
                    Some(mut value) => match MobileIdentity::decode(&mut value)? {
                        MobileIdentity::Guti(guti) => Some(guti),
                        _ => {
                            return Err(NasCodecError::BadIe {
                                iei: iei::GUTI,
                                reason: "not a 5G-GUTI",
                            })
                        }
                    },
                    None => None,
                };
                let tai_list = match ies.get(iei::TAI_LIST) {
                    Some(mut value) => {
                        let count = get_u8(&mut value)?;
                        let mut list = Vec::with_capacity(count as usize);
                        for _ in 0..count {
                            list.push(Tai {
                                plmn: get_plmn(&mut value)?,
                                tac: get_u32(&mut value)?,
                            });
                        }
                        list
                    }
                    None => Vec::new(),
                };
                NasMessage::RegistrationAccept(RegistrationAccept {
                    result: ies.u8(iei::REGISTRATION_RESULT, "5GS registration result")?,
                    guti,
                    allowed_nssai: ies.nssai(iei::ALLOWED_NSSAI)?,
                    tai_list,
                    network_feature_support: ies.opt_u8(iei::NETWORK_FEATURE_SUPPORT)?,
                    network_name: ies.opt_string(iei::NETWORK_NAME)?,
                    t3512: match ies.get(iei::T3512) {
                        Some(mut value) => Some(get_u32(&mut value)?),
                        None => None,
                    },
                    pdu_session_status: ies.opt_u16(iei::PDU_SESSION_STATUS)?,
                })
            }
            REGISTRATION_COMPLETE => NasMessage::RegistrationComplete,
            REGISTRATION_REJECT => NasMessage::RegistrationReject {
                cause: ies.u8(iei::CAUSE, "5GMM cause")?,
            },
            DEREGISTRATION_REQUEST => {
                let dereg_type = ies.u8(iei::DEREGISTRATION_TYPE, "de-registration type")?;
                NasMessage::DeregistrationRequest(DeregistrationRequest {
                    switch_off: dereg_type & 0x08 != 0,
                    access_type: dereg_type & 0x03,
                    ngksi: ies.u8(iei::NGKSI, "ngKSI")?,
                    identity: ies.identity(iei::MOBILE_IDENTITY, "5GS mobile identity")?,
                })
            }
            DEREGISTRATION_ACCEPT => NasMessage::DeregistrationAccept,
            SERVICE_REQUEST => NasMessage::ServiceRequest(ServiceRequest {
                service_type: ies.u8(iei::SERVICE_TYPE, "service type")?,
                ngksi: ies.u8(iei::NGKSI, "ngKSI")?,
                identity: ies.identity(iei::MOBILE_IDENTITY, "5G-S-TMSI")?,
                uplink_data_status: ies.opt_u16(iei::UPLINK_DATA_STATUS)?,
                pdu_session_status: ies.opt_u16(iei::PDU_SESSION_STATUS)?,
            }),
            SERVICE_ACCEPT => NasMessage::ServiceAccept(ServiceAccept {
                pdu_session_status: ies.opt_u16(iei::PDU_SESSION_STATUS)?,
                reactivation_result: ies.opt_u16(iei::REACTIVATION_RESULT)?,
            }),
            SERVICE_REJECT => NasMessage::ServiceReject {
                cause: ies.u8(iei::CAUSE, "5GMM cause")?,
            },
            AUTHENTICATION_REQUEST => {
                NasMessage::AuthenticationRequest(AuthenticationRequest {
                    ngksi: ies.u8(iei::NGKSI, "ngKSI")?,
                    abba: ies.require(iei::ABBA, "ABBA")?.to_vec(),
                    rand: ies.array(iei::RAND, "RAND")?,
                    autn: ies.array(iei::AUTN, "AUTN")?,
                })
            }
            AUTHENTICATION_RESPONSE => NasMessage::AuthenticationResponse {
                res_star: ies.opt_array(iei::RES_STAR)?,
            },
            AUTHENTICATION_REJECT => NasMessage::AuthenticationReject,
            AUTHENTICATION_FAILURE => NasMessage::AuthenticationFailure {
                cause: ies.u8(iei::CAUSE, "5GMM cause")?,
                auts: ies.opt_array(iei::AUTS)?,
            },
            IDENTITY_REQUEST => NasMessage::IdentityRequest {
                identity_type: IdentityType::from_u8(ies.u8(iei::IDENTITY_TYPE, "identity type")?)?,
            },
            IDENTITY_RESPONSE => NasMessage::IdentityResponse {
                identity: ies.identity(iei::MOBILE_IDENTITY, "mobile identity")?,
            },
            SECURITY_MODE_COMMAND => {
                let algs = ies.u8(iei::SELECTED_ALGORITHMS, "selected NAS security algorithms")?;
                let bad_alg = |_| NasCodecError::BadIe {
                    iei: iei::SELECTED_ALGORITHMS,
                    reason: "unknown algorithm",
                };
                NasMessage::SecurityModeCommand(SecurityModeCommand {
                    integrity: IntegrityAlgorithm::from_id(algs & 0x0f).map_err(bad_alg)?,
                    ciphering: CipheringAlgorithm::from_id(algs >> 4).map_err(bad_alg)?,
                    ngksi: ies.u8(iei::NGKSI, "ngKSI")?,
                    replayed_capability: ies
                        .capability()?
                        .ok_or(NasCodecError::MissingIe("replayed UE security capabilities"))?,
                    imeisv_request: ies.get(iei::IMEISV_REQUEST).is_some(),
                    abba: ies.require(iei::ABBA, "ABBA")?.to_vec(),
                })
            }
            SECURITY_MODE_COMPLETE => NasMessage::SecurityModeComplete {
                imeisv: ies.opt_string(iei::IMEISV)?,
                nas_container: ies.get(iei::NAS_CONTAINER),
            },
            SECURITY_MODE_REJECT => NasMessage::SecurityModeReject {
                cause: ies.u8(iei::CAUSE, "5GMM cause")?,
            },
            UL_NAS_TRANSPORT => NasMessage::UlNasTransport(UlNasTransport {
                payload_container_type: ies.u8(iei::PAYLOAD_CONTAINER_TYPE, "payload container type")?,
                payload: ies.require(iei::PAYLOAD_CONTAINER, "payload container")?,
                pdu_session_id: ies.opt_u8(iei::PDU_SESSION_ID)?,
                request_type: ies.opt_u8(iei::REQUEST_TYPE)?,
                snssai: ies.nssai(iei::SNSSAI)?.first().copied(),
                dnn: ies.opt_string(iei::DNN)?,
            }),
            DL_NAS_TRANSPORT => NasMessage::DlNasTransport(DlNasTransport {
                payload_container_type: ies.u8(iei::PAYLOAD_CONTAINER_TYPE, "payload container type")?,
                payload: ies.require(iei::PAYLOAD_CONTAINER, "payload container")?,
                pdu_session_id: ies.opt_u8(iei::PDU_SESSION_ID)?,
                cause: ies.opt_u8(iei::CAUSE)?,
            }),
            other => return Err(NasCodecError::UnknownMessageType(other)),
        };
        Ok(msg)
    }
}

// ============================================================================
// Encoding helpers
// ============================================================================

fn put_ie(buf: &mut BytesMut, iei: u8, value: &[u8]) {
    buf.put_u8(iei);
    buf.put_u16(value.len() as u16);
    buf.put_slice(value);
}

fn put_opt_u16(buf: &mut BytesMut, iei: u8, value: Option<u16>) {
    if let Some(value) = value {
        put_ie(buf, iei, &value.to_be_bytes());
    }
}

fn put_identity(buf: &mut BytesMut, iei: u8, identity: &MobileIdentity) {
    let mut value = BytesMut::new();
    identity.encode(&mut value);
    put_ie(buf, iei, &value);
}

fn put_nssai(buf: &mut BytesMut, iei: u8, nssai: &[Snssai]) {
    let mut value = BytesMut::new();
    value.put_u8(nssai.len() as u8);
    for snssai in nssai {
        value.put_u8(snssai.sst);
        match snssai.sd {
            Some(sd) => {
                value.put_u8(1);
                value.put_u32(sd);
            }
            None => value.put_u8(0),
        }
    }
    put_ie(buf, iei, &value);
}

fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u8(s.len() as u8);
    buf.put_slice(s.as_bytes());
}

fn put_plmn(buf: &mut BytesMut, plmn: &Plmn) {
    put_str(buf, &plmn.mcc);
    put_str(buf, &plmn.mnc);
}

// ============================================================================
// Decoding helpers
// ============================================================================

fn need(buf: &Bytes, n: usize) -> NasResult<()> {
    if buf.remaining() < n {
        return Err(NasCodecError::Truncated {
            expected: n,
            actual: buf.remaining(),
        });
    }
    Ok(())
}

fn get_u8(buf: &mut Bytes) -> NasResult<u8> {
    need(buf, 1)?;
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut Bytes) -> NasResult<u16> {
    need(buf, 2)?;
    Ok(buf.get_u16())
}

fn get_u32(buf: &mut Bytes) -> NasResult<u32> {
    need(buf, 4)?;
    Ok(buf.get_u32())
}

fn get_str(buf: &mut Bytes) -> NasResult<String> {
    let len = get_u8(buf)? as usize;
    need(buf, len)?;
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| NasCodecError::BadIe {
        iei: iei::MOBILE_IDENTITY,
        reason: "invalid digits",
    })
}

fn get_plmn(buf: &mut Bytes) -> NasResult<Plmn> {
    let mcc = get_str(buf)?;
    let mnc = get_str(buf)?;
    Ok(Plmn { mcc, mnc })
}

/// Parsed information elements of one message
struct Ies(Vec<(u8, Bytes)>);

impl Ies {
    fn parse(mut buf: Bytes) -> NasResult<Self> {
        let mut ies = Vec::new();
        while buf.has_remaining() {
            let iei = get_u8(&mut buf)?;
            let len = get_u16(&mut buf)? as usize;
            need(&buf, len)?;
            ies.push((iei, buf.split_to(len)));
        }
        Ok(Self(ies))
    }

    fn get(&self, iei: u8) -> Option<Bytes> {
        self.0
            .iter()
            .find(|(id, _)| *id == iei)
            .map(|(_, value)| value.clone())
    }

    fn require(&self, iei: u8, name: &'static str) -> NasResult<Bytes> {
        self.get(iei).ok_or(NasCodecError::MissingIe(name))
    }

    fn u8(&self, iei: u8, name: &'static str) -> NasResult<u8> {
        get_u8(&mut self.require(iei, name)?)
    }

    fn opt_u8(&self, iei: u8) -> NasResult<Option<u8>> {
        self.get(iei).map(|mut v| get_u8(&mut v)).transpose()
    }

    fn opt_u16(&self, iei: u8) -> NasResult<Option<u16>> {
        self.get(iei).map(|mut v| get_u16(&mut v)).transpose()
    }

    fn opt_string(&self, iei: u8) -> NasResult<Option<String>> {
        self.get(iei)
            .map(|v| {
                String::from_utf8(v.to_vec()).map_err(|_| NasCodecError::BadIe {
                    iei,
                    reason: "invalid string",
                })
            })
            .transpose()
    }

    fn array<const N: usize>(&self, iei: u8, name: &'static str) -> NasResult<[u8; N]> {
        let value = self.require(iei, name)?;
        value.as_ref().try_into().map_err(|_| NasCodecError::BadIe {
            iei,
            reason: "wrong length",
        })
    }

    fn opt_array<const N: usize>(&self, iei: u8) -> NasResult<Option<[u8; N]>> {
        match self.get(iei) {
            Some(_) => self.array(iei, "").map(Some),
            None => Ok(None),
        }
    }

    fn identity(&self, iei: u8, name: &'static str) -> NasResult<MobileIdentity> {
        MobileIdentity::decode(&mut self.require(iei, name)?)
    }

    fn capability(&self) -> NasResult<Option<UeSecurityCapability>> {
        match self.get(iei::UE_SECURITY_CAPABILITY) {
            Some(mut value) => Ok(Some(UeSecurityCapability {
                nea: get_u8(&mut value)?,
                nia: get_u8(&mut value)?,
            })),
            None => Ok(None),
        }
    }

    fn nssai(&self, iei: u8) -> NasResult<Vec<Snssai>> {
        let Some(mut value) = self.get(iei) else {
            return Ok(Vec::new());
        };
        let count = get_u8(&mut value)?;
        let mut nssai = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let sst = get_u8(&mut value)?;
            let sd = match get_u8(&mut value)? {
                0 => None,
                _ => Some(get_u32(&mut value)?),
            };
            nssai.push(Snssai { sst, sd });
        }
        Ok(nssai)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn suci() -> MobileIdentity {
        MobileIdentity::Suci(Suci {
            plmn: Plmn::new("001", "01"),
            msin: "0000000001".into(),
        })
    }

    #[test]
    fn test_registration_request_roundtrip() {
        let msg = NasMessage::RegistrationRequest(RegistrationRequest {
            registration_type: RegistrationType::Initial,
            follow_on_request: true,
            ngksi: 7,
            identity: suci(),
            ue_security_capability: Some(UeSecurityCapability::new(0xf0, 0x70)),
            requested_nssai: vec![Snssai::new(1, None), Snssai::new(2, Some(0xabcdef))],
            pdu_session_status: Some(0x0020),
            uplink_data_status: None,
        });
        let pdu = msg.encode();
        assert_eq!(&pdu[..3], &[EPD_5GMM, 0x00, message_type::REGISTRATION_REQUEST]);
        assert_eq!(NasMessage::decode(&pdu).unwrap(), msg);
    }

    #[test]
    fn test_registration_accept_with_guti() {
        let guti = Guti {
            plmn: Plmn::new("001", "01"),
            region_id: 0x80,
            set_id: 4,
            pointer: 1,
            tmsi: 0xdeadbeef,
        };
        let msg = NasMessage::RegistrationAccept(RegistrationAccept {
            result: 1,
            guti: Some(guti),
            allowed_nssai: vec![Snssai::new(1, None)],
            tai_list: vec![Tai {
                plmn: Plmn::new("001", "01"),
                tac: 1,
            }],
            network_feature_support: Some(0x01),
            network_name: Some("amfcore".into()),
            t3512: Some(3240),
            pdu_session_status: None,
        });
        assert_eq!(NasMessage::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_suci_to_supi() {
        let MobileIdentity::Suci(suci) = suci() else {
            panic!("not a SUCI");
        };
        assert_eq!(suci.to_supi().as_str(), "imsi-001010000000001");
    }

    #[test]
    fn test_security_mode_command_algorithms() {
        let msg = NasMessage::SecurityModeCommand(SecurityModeCommand {
            integrity: IntegrityAlgorithm::Nia2,
            ciphering: CipheringAlgorithm::Nea3,
            ngksi: 2,
            replayed_capability: UeSecurityCapability::new(0xb0, 0x30),
            imeisv_request: true,
            abba: vec![0, 0],
        });
        assert_eq!(NasMessage::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_missing_mandatory_ie() {
        // Registration Reject without a cause
        let pdu = [EPD_5GMM, 0x00, message_type::REGISTRATION_REJECT];
        assert_eq!(
            NasMessage::decode(&pdu),
            Err(NasCodecError::MissingIe("5GMM cause"))
        );
    }

    #[test]
    fn test_unknown_message_type() {
        let pdu = [EPD_5GMM, 0x00, 0x99];
        assert_eq!(
            NasMessage::decode(&pdu),
            Err(NasCodecError::UnknownMessageType(0x99))
        );
    }

    #[test]
    fn test_truncated_ie() {
        let pdu = [EPD_5GMM, 0x00, message_type::REGISTRATION_REJECT, iei::CAUSE, 0x00, 0x05, 3];
        assert!(matches!(
            NasMessage::decode(&pdu),
            Err(NasCodecError::Truncated { .. })
        ));
    }

    #[test]
    fn test_invalid_epd() {
        assert_eq!(
            security_header_type(&[0x2e, 0x00]),
            Err(NasCodecError::InvalidEpd(0x2e))
        );
    }

    #[test]
    fn test_auth_failure_with_auts() {
        let msg = NasMessage::AuthenticationFailure {
            cause: cause::SYNCH_FAILURE,
            auts: Some([0x5a; 14]),
        };
        assert_eq!(NasMessage::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn test_ue_security_capability_bits() {
        let cap = UeSecurityCapability::new(0xa0, 0x20);
        assert!(cap.supports_ciphering(CipheringAlgorithm::Nea0));
        assert!(cap.supports_ciphering(CipheringAlgorithm::Nea2));
        assert!(!cap.supports_ciphering(CipheringAlgorithm::Nea1));
        assert!(cap.supports_integrity(IntegrityAlgorithm::Nia2));
        assert!(!cap.supports_integrity(IntegrityAlgorithm::Nia0));
    }
}

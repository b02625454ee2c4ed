//! NGAP message catalog
//!
//! Decoded NGAP PDUs as exchanged with the radio transport. The ASN.1 PER
//! codec sits behind the transport; this module only carries the
//! information elements the AMF acts on.

use bytes::Bytes;

use crate::nas_message::UeSecurityCapability;
use crate::ue_context::PduSessionId;
use crate::types::{
    AmfUeId, Guami, NrCgi, PlmnSupport, RanUeId, RrcEstablishmentCause, STmsi, Snssai, Tai,
};

// ============================================================================
// Causes
// ============================================================================

/// NGAP cause
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NgapCause {
    RadioNetwork(u8),
    Transport(u8),
    Nas(u8),
    Protocol(u8),
    Misc(u8),
}

impl std::fmt::Display for NgapCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NgapCause::RadioNetwork(v) => write!(f, "radioNetwork({})", v),
            NgapCause::Transport(v) => write!(f, "transport({})", v),
            NgapCause::Nas(v) => write!(f, "nas({})", v),
            NgapCause::Protocol(v) => write!(f, "protocol({})", v),
            NgapCause::Misc(v) => write!(f, "misc({})", v),
        }
    }
}

/// Radio network layer cause values
pub mod radio_network_cause {
    pub const UNSPECIFIED: u8 = 0;
    pub const SUCCESSFUL_HANDOVER: u8 = 2;
    pub const HANDOVER_CANCELLED: u8 = 5;
    pub const PARTIAL_HANDOVER: u8 = 6;
    pub const HO_FAILURE_IN_TARGET_5GC_NGRAN_NODE_OR_TARGET_SYSTEM: u8 = 7;
    pub const HO_TARGET_NOT_ALLOWED: u8 = 8;
    pub const TNGRELOCPREP_EXPIRY: u8 = 10;
    pub const UNKNOWN_TARGET_ID: u8 = 12;
    pub const UNKNOWN_LOCAL_UE_NGAP_ID: u8 = 14;
    pub const INCONSISTENT_REMOTE_UE_NGAP_ID: u8 = 15;
    pub const USER_INACTIVITY: u8 = 20;
    pub const RADIO_CONNECTION_WITH_UE_LOST: u8 = 21;
    pub const UNKNOWN_PDU_SESSION_ID: u8 = 26;
    pub const NG_INTRA_SYSTEM_HANDOVER_TRIGGERED: u8 = 31;
}

/// NAS cause values
pub mod nas_cause {
    pub const NORMAL_RELEASE: u8 = 0;
    pub const AUTHENTICATION_FAILURE: u8 = 1;
    pub const DEREGISTER: u8 = 2;
    pub const UNSPECIFIED: u8 = 3;
}

/// Protocol cause values
pub mod protocol_cause {
    pub const MESSAGE_NOT_COMPATIBLE_WITH_RECEIVER_STATE: u8 = 4;
    pub const SEMANTIC_ERROR: u8 = 5;
    pub const UNSPECIFIED: u8 = 6;
}

/// Miscellaneous cause values
pub mod misc_cause {
    pub const CONTROL_PROCESSING_OVERLOAD: u8 = 0;
    pub const OM_INTERVENTION: u8 = 3;
    pub const UNKNOWN_PLMN_OR_SNPN: u8 = 4;
    pub const UNSPECIFIED: u8 = 5;
}

// ============================================================================
// Information elements
// ============================================================================

/// Tracking area supported by a radio node, with its broadcast PLMNs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupportedTa {
    pub tac: u32,
    pub broadcast_plmns: Vec<PlmnSupport>,
}

/// UE association named in a partial NG Reset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UeAssociation {
    pub amf_ue_id: Option<AmfUeId>,
    pub ran_ue_id: Option<RanUeId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetType {
    All,
    Partial(Vec<UeAssociation>),
}

/// UE NGAP ids of a UE Context Release Command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UeNgapIds {
    Pair { amf_ue_id: AmfUeId, ran_ue_id: RanUeId },
    AmfOnly(AmfUeId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoverType {
    IntraFiveGs,
    FiveGsToEps,
    EpsToFiveGs,
}

/// Per-session item carrying an SMF-built transfer container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PduSessionResourceItem {
    pub id: PduSessionId,
    pub snssai: Option<Snssai>,
    pub transfer: Bytes,
}

impl PduSessionResourceItem {
    pub fn new(id: PduSessionId, transfer: Bytes) -> Self {
        Self {
            id,
            snssai: None,
            transfer,
        }
    }
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NgSetupRequest {
    pub global_gnb_id: u32,
    pub ran_node_name: Option<String>,
    pub supported_tas: Vec<SupportedTa>,
    pub paging_drx: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NgSetupResponse {
    pub amf_name: String,
    pub served_guami: Vec<Guami>,
    pub relative_capacity: u8,
    pub plmn_support: Vec<PlmnSupport>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialUeMessage {
    pub ran_ue_id: RanUeId,
    pub nas_pdu: Bytes,
    pub tai: Tai,
    pub cgi: NrCgi,
    pub rrc_cause: RrcEstablishmentCause,
    pub s_tmsi: Option<STmsi>,
    pub ue_context_requested: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UplinkNasTransport {
    pub amf_ue_id: AmfUeId,
    pub ran_ue_id: RanUeId,
    pub nas_pdu: Bytes,
    pub tai: Option<Tai>,
    pub cgi: Option<NrCgi>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialContextSetupRequest {
    pub amf_ue_id: AmfUeId,
    pub ran_ue_id: RanUeId,
    pub guami: Guami,
    pub allowed_nssai: Vec<Snssai>,
    pub ue_security_capability: UeSecurityCapability,
    pub security_key: [u8; 32],
    pub nas_pdu: Option<Bytes>,
    pub pdu_sessions: Vec<PduSessionResourceItem>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoverRequired {
    pub amf_ue_id: AmfUeId,
    pub ran_ue_id: RanUeId,
    pub handover_type: HandoverType,
    pub cause: NgapCause,
    pub target_gnb_id: u32,
    pub target_tai: Tai,
    pub pdu_sessions: Vec<PduSessionResourceItem>,
    pub source_to_target: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoverRequest {
    pub amf_ue_id: AmfUeId,
    pub handover_type: HandoverType,
    pub cause: NgapCause,
    pub guami: Guami,
    pub ue_security_capability: UeSecurityCapability,
    pub ncc: u8,
    pub nh: [u8; 32],
    pub allowed_nssai: Vec<Snssai>,
    pub pdu_sessions: Vec<PduSessionResourceItem>,
    pub source_to_target: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoverRequestAcknowledge {
    pub amf_ue_id: AmfUeId,
    /// RAN-UE-NGAP-ID allocated by the target
    pub ran_ue_id: RanUeId,
    pub admitted: Vec<PduSessionResourceItem>,
    pub failed: Vec<PduSessionId>,
    pub target_to_source: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandoverCommand {
    pub amf_ue_id: AmfUeId,
    pub ran_ue_id: RanUeId,
    pub handover_type: HandoverType,
    pub pdu_sessions: Vec<PduSessionResourceItem>,
    pub released: Vec<PduSessionId>,
    pub target_to_source: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RerouteNasRequest {
    pub ran_ue_id: RanUeId,
    pub amf_ue_id: Option<AmfUeId>,
    /// The original Initial UE Message NAS PDU
    pub nas_pdu: Bytes,
    pub amf_set_id: u16,
    pub allowed_nssai: Vec<Snssai>,
}

/// Decoded NGAP PDU
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NgapMessage {
    // Interface management
    NgSetupRequest(NgSetupRequest),
    NgSetupResponse(NgSetupResponse),
    NgSetupFailure {
        cause: NgapCause,
        time_to_wait: Option<u8>,
    },
    NgReset {
        cause: NgapCause,
        reset_type: ResetType,
    },
    NgResetAcknowledge {
        ue_associations: Vec<UeAssociation>,
    },
    ErrorIndication {
        amf_ue_id: Option<AmfUeId>,
        ran_ue_id: Option<RanUeId>,
        cause: NgapCause,
    },

    // NAS transport
    InitialUeMessage(InitialUeMessage),
    UplinkNasTransport(UplinkNasTransport),
    DownlinkNasTransport {
        amf_ue_id: AmfUeId,
        ran_ue_id: RanUeId,
        nas_pdu: Bytes,
    },
    RerouteNasRequest(RerouteNasRequest),

    // UE context management
    InitialContextSetupRequest(InitialContextSetupRequest),
    InitialContextSetupResponse {
        amf_ue_id: AmfUeId,
        ran_ue_id: RanUeId,
        pdu_sessions: Vec<PduSessionResourceItem>,
    },
    InitialContextSetupFailure {
        amf_ue_id: AmfUeId,
        ran_ue_id: RanUeId,
        cause: NgapCause,
    },
    UeContextReleaseRequest {
        amf_ue_id: AmfUeId,
        ran_ue_id: RanUeId,
        cause: NgapCause,
        pdu_sessions: Vec<PduSessionId>,
    },
    UeContextReleaseCommand {
        ue: UeNgapIds,
        cause: NgapCause,
    },
    UeContextReleaseComplete {
        amf_ue_id: AmfUeId,
        ran_ue_id: RanUeId,
        pdu_sessions: Vec<PduSessionId>,
    },

    // PDU session resource management
    PduSessionResourceSetupRequest {
        amf_ue_id: AmfUeId,
        ran_ue_id: RanUeId,
        nas_pdu: Option<Bytes>,
        pdu_sessions: Vec<PduSessionResourceItem>,
    },
    PduSessionResourceSetupResponse {
        amf_ue_id: AmfUeId,
        ran_ue_id: RanUeId,
        pdu_sessions: Vec<PduSessionResourceItem>,
        failed: Vec<PduSessionResourceItem>,
    },
    PduSessionResourceModifyRequest {
        amf_ue_id: AmfUeId,
        ran_ue_id: RanUeId,
        nas_pdu: Option<Bytes>,
        pdu_sessions: Vec<PduSessionResourceItem>,
    },
    PduSessionResourceModifyResponse {
        amf_ue_id: AmfUeId,
        ran_ue_id: RanUeId,
        pdu_sessions: Vec<PduSessionResourceItem>,
    },
    PduSessionResourceReleaseCommand {
        amf_ue_id: AmfUeId,
        ran_ue_id: RanUeId,
        nas_pdu: Option<Bytes>,
        pdu_sessions: Vec<PduSessionResourceItem>,
    },
    PduSessionResourceReleaseResponse {
        amf_ue_id: AmfUeId,
        ran_ue_id: RanUeId,
        pdu_sessions: Vec<PduSessionResourceItem>,
    },

    // Mobility
    HandoverRequired(HandoverRequired),
    HandoverRequest(HandoverRequest),
    HandoverRequestAcknowledge(HandoverRequestAcknowledge),
    HandoverFailure {
        amf_ue_id: AmfUeId,
        cause: NgapCause,
    },
    HandoverCommand(HandoverCommand),
    HandoverPreparationFailure {
        amf_ue_id: AmfUeId,
        ran_ue_id: RanUeId,
        cause: NgapCause,
    },
    HandoverNotify {
        amf_ue_id: AmfUeId,
        ran_ue_id: RanUeId,
        tai: Option<Tai>,
        cgi: Option<NrCgi>,
    },
    HandoverCancel {
        amf_ue_id: AmfUeId,
        ran_ue_id: RanUeId,
        cause: NgapCause,
    },
    HandoverCancelAcknowledge {
        amf_ue_id: AmfUeId,
        ran_ue_id: RanUeId,
    },
    UplinkRanStatusTransfer {
        amf_ue_id: AmfUeId,
        ran_ue_id: RanUeId,
        container: Bytes,
    },
    DownlinkRanStatusTransfer {
        amf_ue_id: AmfUeId,
        ran_ue_id: RanUeId,
        container: Bytes,
    },

    // Paging
    Paging {
        s_tmsi: STmsi,
        tai_list: Vec<Tai>,
        paging_drx: Option<u8>,
    },
}

impl NgapMessage {
    pub fn name(&self) -> &'static str {
        match self {
            NgapMessage::NgSetupRequest(_) => "NGSetupRequest",
            NgapMessage::NgSetupResponse(_) => "NGSetupResponse",
            NgapMessage::NgSetupFailure { .. } => "NGSetupFailure",
            NgapMessage::NgReset { .. } => "NGReset",
            NgapMessage::NgResetAcknowledge { .. } => "NGResetAcknowledge",
            NgapMessage::ErrorIndication { .. } => "ErrorIndication",
            NgapMessage::InitialUeMessage(_) => "InitialUEMessage",
            NgapMessage::UplinkNasTransport(_) => "UplinkNASTransport",
            NgapMessage::DownlinkNasTransport { .. } => "DownlinkNASTransport",
            NgapMessage::RerouteNasRequest(_) => "RerouteNASRequest",
            NgapMessage::InitialContextSetupRequest(_) => "InitialContextSetupRequest",
            NgapMessage::InitialContextSetupResponse { .. } => "InitialContextSetupResponse",
            NgapMessage::InitialContextSetupFailure { .. } => "InitialContextSetupFailure",
            NgapMessage::UeContextReleaseRequest { .. } => "UEContextReleaseRequest",
            NgapMessage::UeContextReleaseCommand { .. } => "UEContextReleaseCommand",
            NgapMessage::UeContextReleaseComplete { .. } => "UEContextReleaseComplete",
            NgapMessage::PduSessionResourceSetupRequest { .. } => "PDUSessionResourceSetupRequest",
            NgapMessage::PduSessionResourceSetupResponse { .. } => {
                "PDUSessionResourceSetupResponse"
            }
            NgapMessage::PduSessionResourceModifyRequest { .. } => {
                "PDUSessionResourceModifyRequest"
            }
            NgapMessage::PduSessionResourceModifyResponse { .. } => {
                "PDUSessionResourceModifyResponse"
            }
            NgapMessage::PduSessionResourceReleaseCommand { .. } => {
                "PDUSessionResourceReleaseCommand"
            }
            NgapMessage::PduSessionResourceReleaseResponse { .. } => {
                "PDUSessionResourceReleaseResponse"
            }
            NgapMessage::HandoverRequired(_) => "HandoverRequired",
            NgapMessage::HandoverRequest(_) => "HandoverRequest",
            NgapMessage::HandoverRequestAcknowledge(_) => "HandoverRequestAcknowledge",
            NgapMessage::HandoverFailure { .. } => "HandoverFailure",
            NgapMessage::HandoverCommand(_) => "HandoverCommand",
            NgapMessage::HandoverPreparationFailure { .. } => "HandoverPreparationFailure",
            NgapMessage::HandoverNotify { .. } => "HandoverNotify",
            NgapMessage::HandoverCancel { .. } => "HandoverCancel",
            NgapMessage::HandoverCancelAcknowledge { .. } => "HandoverCancelAcknowledge",
            NgapMessage::UplinkRanStatusTransfer { .. } => "UplinkRANStatusTransfer",
            NgapMessage::DownlinkRanStatusTransfer { .. } => "DownlinkRANStatusTransfer",
            NgapMessage::Paging { .. } => "Paging",
        }
    }

    /// UE-associated signalling goes on a per-UE stream, the rest on stream 0
    pub fn is_ue_associated(&self) -> bool {
        !matches!(
            self,
            NgapMessage::NgSetupRequest(_)
                | NgapMessage::NgSetupResponse(_)
                | NgapMessage::NgSetupFailure { .. }
                | NgapMessage::NgReset { .. }
                | NgapMessage::NgResetAcknowledge { .. }
                | NgapMessage::Paging { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_classification() {
        let reset = NgapMessage::NgReset {
            cause: NgapCause::Misc(misc_cause::OM_INTERVENTION),
            reset_type: ResetType::All,
        };
        assert!(!reset.is_ue_associated());
        let dl = NgapMessage::DownlinkNasTransport {
            amf_ue_id: AmfUeId(1),
            ran_ue_id: RanUeId(1),
            nas_pdu: Bytes::from_static(&[0x7e, 0x00, 0x42]),
        };
        assert!(dl.is_ue_associated());
        assert_eq!(dl.name(), "DownlinkNASTransport");
    }

    #[test]
    fn test_cause_display() {
        assert_eq!(
            NgapCause::Nas(nas_cause::DEREGISTER).to_string(),
            "nas(2)"
        );
    }
}

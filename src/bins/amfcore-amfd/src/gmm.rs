//! NAS procedure engine (N1 task)
//!
//! Runs the 5GMM procedures for every subscriber: registration with
//! identification, 5G AKA and security mode control; service request;
//! UE-initiated and implicit de-registration; 5GSM payload transport.
//! Outbound NAS goes to the NGAP session manager as N2 requests.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::oneshot;

use amfcore_crypt::kdf::{self, ABBA_DEFAULT};

use crate::arena;
use crate::auth::{AuthError, HeAuthVector};
use crate::config::AuthenticationMode;
use crate::context::TaskBase;
use crate::event::{EventPayload, Reachability};
use crate::gmm_sm::{CmState, GmmEvent, GmmFsmResult, GmmState};
use crate::nas_context::{NasContext, SharedNasContext};
use crate::nas_message::{
    cause, request_type, security_header_type, AuthenticationRequest, DeregistrationRequest,
    DlNasTransport, IdentityType, MobileIdentity, NasCodecError, NasMessage, RegistrationAccept,
    RegistrationRequest, RegistrationType, SecurityHeaderType, SecurityModeCommand,
    ServiceAccept, ServiceRequest, UlNasTransport, PAYLOAD_CONTAINER_N1_SM, SECURITY_HEADER_LEN,
};
use crate::nas_security::{select_algorithms, NasSecurityContext, NasSecurityError, NGKSI_RANGE};
use crate::ngap::{ContextSetup, N2Message};
use crate::ngap_context::ReleaseAction;
use crate::ngap_message::{nas_cause, NgapCause, PduSessionResourceItem};
use crate::runtime::{Task, TaskId};
use crate::sbi::{
    self, ResyncInfo, SbiError, SbiRequest, SbiResponse, SmContextCreate, SmContextUpdate,
    UeAuthenticationRequest, UpCnxState,
};
use crate::types::{AmfUeId, AssocId, Guti, NrCgi, RanUeId, STmsi, Snssai, Supi, Tai};
use crate::ue_context::{PduSessionContext, PduSessionId};

/// DNN used when a PDU session request names none
pub const DEFAULT_DNN: &str = "internet";

/// Registration result value: 3GPP access
const REGISTRATION_RESULT_3GPP: u8 = 1;

/// Margin between T3512 and the mobile reachable timer (seconds)
const MOBILE_REACHABLE_MARGIN: u64 = 4 * 60;

// ============================================================================
// Messages
// ============================================================================

/// Signalling connection established with an initial NAS message
#[derive(Debug)]
pub struct Establishment {
    pub amf_ue_id: AmfUeId,
    pub ran_ue_id: RanUeId,
    pub assoc: AssocId,
    pub nas_pdu: Bytes,
    pub tai: Tai,
    pub cgi: Option<NrCgi>,
    pub s_tmsi: Option<STmsi>,
}

/// Outcome of an N1/N2 message transfer request from a session peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum N1N2TransferResult {
    Transferred,
    /// Subscriber idle: paging started
    AttemptingToReach,
    UeNotReachable,
    ContextNotFound,
}

#[derive(Debug)]
pub enum N1Message {
    Establish(Box<Establishment>),
    UplinkNas {
        amf_ue_id: AmfUeId,
        ran_ue_id: RanUeId,
        nas_pdu: Bytes,
        tai: Option<Tai>,
        cgi: Option<NrCgi>,
    },
    /// Radio released the connection; the subscriber stays registered
    ConnectionLost { amf_ue_id: AmfUeId },
    MobileReachableExpired { amf_ue_id: AmfUeId },
    ImplicitDeregExpired { amf_ue_id: AmfUeId },
    N1N2Transfer {
        supi: Supi,
        pdu_session_id: PduSessionId,
        n1_sm: Option<Bytes>,
        n2_sm: Option<Bytes>,
        reply: oneshot::Sender<N1N2TransferResult>,
    },
}

#[derive(Debug, Error)]
pub enum GmmError {
    #[error(transparent)]
    Codec(#[from] NasCodecError),
    #[error(transparent)]
    Security(#[from] NasSecurityError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Sbi(#[from] SbiError),
    #[error("{0} is not accepted without integrity protection")]
    Unprotected(&'static str),
}

impl GmmError {
    /// 5GMM cause for a registration that cannot proceed
    fn reject_cause(&self) -> u8 {
        match self {
            GmmError::Auth(AuthError::UnknownSubscriber(_))
            | GmmError::Sbi(SbiError::Peer { status: 403 | 404, .. }) => cause::ILLEGAL_UE,
            _ => cause::PROTOCOL_ERROR_UNSPECIFIED,
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// PDU session status bitmap (bit n = session n)
pub fn session_bitmap(ids: &[PduSessionId]) -> u16 {
    ids.iter()
        .filter(|id| **id < 16)
        .fold(0u16, |bits, id| bits | (1 << id))
}

pub fn bitmap_sessions(bits: u16) -> Vec<PduSessionId> {
    (1..16u8).filter(|id| bits & (1 << id) != 0).collect()
}

/// Encode a downlink message, protected once the context is FULL-NATIVE
fn secure(nas: &mut NasContext, msg: &NasMessage) -> Result<Bytes, NasSecurityError> {
    let plain = msg.encode();
    match nas.security.as_mut() {
        Some(sec) if sec.is_full_native() => {
            sec.protect(&plain, SecurityHeaderType::IntegrityProtectedAndCiphered)
        }
        _ => Ok(plain),
    }
}

/// Protected Service Accept and the KgNB of the Initial Context Setup
/// carrying it; `None` once the security context is gone
fn service_accept(
    nas: &mut NasContext,
    accept: &NasMessage,
) -> Result<Option<(Bytes, [u8; 32])>, NasSecurityError> {
    let Some(kgnb) = nas.security.as_mut().map(|sec| sec.initial_kgnb()) else {
        return Ok(None);
    };
    Ok(Some((secure(nas, accept)?, kgnb)))
}

fn identity_guti(msg: &NasMessage, guami: Option<&crate::types::Guami>) -> Option<Guti> {
    let identity = match msg {
        NasMessage::RegistrationRequest(req) => &req.identity,
        NasMessage::DeregistrationRequest(req) => &req.identity,
        NasMessage::ServiceRequest(req) => &req.identity,
        _ => return None,
    };
    match identity {
        MobileIdentity::Guti(guti) => Some(guti.clone()),
        MobileIdentity::STmsi(s_tmsi) => guami.map(|g| Guti::from_s_tmsi(g, s_tmsi)),
        _ => None,
    }
}

// ============================================================================
// N1 task
// ============================================================================

pub struct N1Task {
    base: TaskBase,
}

impl N1Task {
    pub fn new(base: TaskBase) -> Self {
        Self { base }
    }

    fn send_n2(&self, msg: N2Message) {
        let _ = self.base.n2.send(msg);
    }

    fn send_dl(&self, amf_ue_id: AmfUeId, nas_pdu: Bytes) {
        self.send_n2(N2Message::DownlinkNas { amf_ue_id, nas_pdu });
    }

    fn release(&self, amf_ue_id: AmfUeId, cause: NgapCause, action: ReleaseAction) {
        self.send_n2(N2Message::ReleaseUe {
            amf_ue_id,
            cause,
            action,
        });
    }

    fn nas(&self, amf_ue_id: AmfUeId) -> Option<SharedNasContext> {
        self.base.ctx.nas_contexts.lookup_by_amf_id(amf_ue_id)
    }

    /// Dispatch to the 5GMM FSM, publishing registration state changes
    fn dispatch(&self, nas: &mut NasContext, event: GmmEvent) -> GmmFsmResult {
        let result = nas.fsm.dispatch(event);
        if let GmmFsmResult::Transition(state) = result {
            if matches!(state, GmmState::Registered | GmmState::Deregistered) {
                self.base
                    .ctx
                    .publish(nas.supi.as_ref(), EventPayload::RegistrationState(state));
            }
        }
        result
    }

    fn stop_timers(&self, nas: &mut NasContext) {
        for timer in [
            nas.mobile_reachable_timer.take(),
            nas.implicit_dereg_timer.take(),
        ]
        .into_iter()
        .flatten()
        {
            self.base.ctx.timers.cancel(timer);
        }
        nas.mobile_reachable_expired = false;
    }

    fn publish_location(&self, amf_ue_id: AmfUeId) {
        let Some(ue) = self.base.ctx.ue_contexts.lookup_by_amf_id(amf_ue_id) else {
            return;
        };
        let (supi, tai, cgi) = {
            let ue = arena::read(&ue);
            (ue.supi.clone(), ue.tai.clone(), ue.cgi.clone())
        };
        if let Some(tai) = tai {
            self.base
                .ctx
                .publish(supi.as_ref(), EventPayload::Location { tai, cgi });
        }
    }

    fn bind_supi(&self, amf_ue_id: AmfUeId, supi: &Supi) {
        self.base.ctx.nas_contexts.bind_supi(amf_ue_id, supi);
        self.base.ctx.ue_contexts.bind_supi(amf_ue_id, supi);
    }

    /// Move a known subscriber onto the signalling connection `new_id`
    ///
    /// The NAS context is re-keyed; identity and PDU sessions of the old UE
    /// context move into the new one. A still-open older connection is
    /// released without touching the subscriber.
    fn adopt(&self, old_id: AmfUeId, new_id: AmfUeId, ran_ue_id: RanUeId) {
        if old_id == new_id {
            return;
        }
        let ctx = &self.base.ctx;
        if let Some(old_ue) = ctx.ue_contexts.remove(old_id) {
            let (supi, tmsi, sessions) = {
                let old = arena::read(&old_ue);
                (old.supi.clone(), old.tmsi, old.pdu_sessions.clone())
            };
            if let Some(new_ue) = ctx.ue_contexts.lookup_by_amf_id(new_id) {
                {
                    let mut new = arena::write(&new_ue);
                    new.tmsi = tmsi;
                    new.pdu_sessions = sessions;
                }
                if let Some(supi) = supi {
                    ctx.ue_contexts.bind_supi(new_id, &supi);
                }
            }
        }
        ctx.nas_contexts.rekey_amf(old_id, new_id, ran_ue_id);
        if ctx.ngap.ue_by_amf(old_id).is_some() {
            self.release(
                old_id,
                NgapCause::Nas(nas_cause::NORMAL_RELEASE),
                ReleaseAction::DropAssociation,
            );
        }
    }

    // ------------------------------------------------------------------------
    // Uplink entry
    // ------------------------------------------------------------------------

    /// Classify an initial NAS message and find the subscriber it belongs to
    ///
    /// Returns the message, the resolved context and whether integrity was
    /// verified. A readable message failing the MAC check is handled as
    /// unverified.
    fn decode_initial(
        &self,
        pdu: &[u8],
        s_tmsi: Option<&STmsi>,
    ) -> Result<(NasMessage, Option<SharedNasContext>, bool), GmmError> {
        let config = self.base.ctx.config();
        let guami = config.serving_guami();
        let lookup = |guti: &Guti| self.base.ctx.nas_contexts.lookup_by_guti(guti);

        let mut known = s_tmsi
            .zip(guami)
            .and_then(|(s, g)| lookup(&Guti::from_s_tmsi(g, s)));

        let header_type = security_header_type(pdu)?;
        if header_type == SecurityHeaderType::Plain {
            let msg = NasMessage::decode(pdu)?;
            if !msg.allowed_unprotected() {
                return Err(GmmError::Unprotected(msg.name()));
            }
            if known.is_none() {
                known = identity_guti(&msg, guami).and_then(|g| lookup(&g));
            }
            return Ok((msg, known, false));
        }

        let readable = if header_type.is_ciphered() {
            None
        } else {
            Some(NasMessage::decode(
                pdu.get(SECURITY_HEADER_LEN..).unwrap_or_default(),
            )?)
        };
        if known.is_none() {
            known = readable
                .as_ref()
                .and_then(|msg| identity_guti(msg, guami))
                .and_then(|g| lookup(&g));
        }

        if let Some(shared) = &known {
            let mut nas = arena::write(shared);
            if let Some(sec) = nas.security.as_mut() {
                match sec.unprotect(pdu) {
                    Ok(unprotected) => {
                        let msg = NasMessage::decode(&unprotected.message)?;
                        return Ok((msg, known.clone(), true));
                    }
                    Err(e) => log::warn!("[{}] initial NAS message not verified: {}", nas.tag(), e),
                }
            }
        }
        match readable {
            Some(msg) if msg.allowed_unprotected() => Ok((msg, known, false)),
            Some(msg) => Err(GmmError::Unprotected(msg.name())),
            None => Err(NasSecurityError::NoSecurityContext.into()),
        }
    }

    async fn establish(&mut self, e: Establishment) {
        log::debug!(
            "[amf_ue_ngap_id={}] initial NAS message ({} bytes)",
            e.amf_ue_id,
            e.nas_pdu.len()
        );
        let (msg, known, verified) = match self.decode_initial(&e.nas_pdu, e.s_tmsi.as_ref()) {
            Ok(decoded) => decoded,
            Err(err) => {
                log::warn!("[amf_ue_ngap_id={}] initial NAS message dropped: {}", e.amf_ue_id, err);
                self.release(
                    e.amf_ue_id,
                    NgapCause::Nas(nas_cause::UNSPECIFIED),
                    ReleaseAction::RemoveContext,
                );
                return;
            }
        };
        if let Some(shared) = &known {
            self.stop_timers(&mut arena::write(shared));
        }

        match msg {
            NasMessage::RegistrationRequest(req) => {
                self.registration_request(e.amf_ue_id, e.ran_ue_id, req, verified, known)
                    .await
            }
            NasMessage::ServiceRequest(req) => {
                self.service_request(e.amf_ue_id, e.ran_ue_id, req, verified, known)
                    .await
            }
            NasMessage::DeregistrationRequest(req) => {
                if let Some(shared) = &known {
                    let old = arena::read(shared).amf_ue_id;
                    self.adopt(old, e.amf_ue_id, e.ran_ue_id);
                }
                self.deregistration_request(e.amf_ue_id, req).await
            }
            other => {
                log::warn!(
                    "[amf_ue_ngap_id={}] {} is not an initial NAS message",
                    e.amf_ue_id,
                    other.name()
                );
                self.release(
                    e.amf_ue_id,
                    NgapCause::Nas(nas_cause::UNSPECIFIED),
                    ReleaseAction::RemoveContext,
                );
            }
        }
    }

    async fn uplink_nas(
        &mut self,
        amf_ue_id: AmfUeId,
        ran_ue_id: RanUeId,
        pdu: Bytes,
        tai: Option<Tai>,
        cgi: Option<NrCgi>,
    ) {
        let Some(shared) = self.nas(amf_ue_id) else {
            log::warn!("[amf_ue_ngap_id={}] uplink NAS without NAS context", amf_ue_id);
            return;
        };
        if tai.is_some() {
            if let Some(ue) = self.base.ctx.ue_contexts.lookup_by_amf_id(amf_ue_id) {
                let mut ue = arena::write(&ue);
                ue.tai = tai;
                if cgi.is_some() {
                    ue.cgi = cgi;
                }
            }
            self.publish_location(amf_ue_id);
        }

        let decoded = {
            let mut nas = arena::write(&shared);
            let tag = nas.tag();
            let result = Self::decode_uplink(&mut nas, &pdu);
            if let Err(e) = &result {
                log::warn!("[{}] uplink NAS dropped: {}", tag, e);
            }
            result
        };
        let Ok((msg, verified)) = decoded else {
            return;
        };
        log::debug!("[amf_ue_ngap_id={}] {} received", amf_ue_id, msg.name());

        match msg {
            NasMessage::AuthenticationResponse { res_star } => {
                self.authentication_response(amf_ue_id, res_star).await
            }
            NasMessage::AuthenticationFailure { cause, auts } => {
                self.authentication_failure(amf_ue_id, cause, auts).await
            }
            NasMessage::IdentityResponse { identity } => {
                self.identity_response(amf_ue_id, ran_ue_id, identity).await
            }
            NasMessage::SecurityModeComplete { imeisv, .. } if verified => {
                self.security_mode_complete(amf_ue_id, imeisv).await
            }
            NasMessage::SecurityModeReject { cause } => {
                log::warn!("[amf_ue_ngap_id={}] security mode rejected ({})", amf_ue_id, cause);
                self.reject_registration(amf_ue_id, cause::SECURITY_MODE_REJECTED_UNSPECIFIED);
            }
            NasMessage::RegistrationComplete if verified => {
                self.registration_complete(amf_ue_id)
            }
            NasMessage::RegistrationRequest(req) => {
                self.registration_request(amf_ue_id, ran_ue_id, req, verified, Some(shared))
                    .await
            }
            NasMessage::ServiceRequest(req) => {
                self.service_request(amf_ue_id, ran_ue_id, req, verified, Some(shared))
                    .await
            }
            NasMessage::DeregistrationRequest(req) => {
                self.deregistration_request(amf_ue_id, req).await
            }
            NasMessage::UlNasTransport(transport) if verified => {
                self.ul_nas_transport(amf_ue_id, transport).await
            }
            other => log::warn!(
                "[amf_ue_ngap_id={}] unexpected {} (integrity {})",
                amf_ue_id,
                other.name(),
                if verified { "verified" } else { "not verified" }
            ),
        }
    }

    fn decode_uplink(nas: &mut NasContext, pdu: &[u8]) -> Result<(NasMessage, bool), GmmError> {
        if security_header_type(pdu)? == SecurityHeaderType::Plain {
            let msg = NasMessage::decode(pdu)?;
            if !msg.allowed_unprotected() {
                return Err(GmmError::Unprotected(msg.name()));
            }
            return Ok((msg, false));
        }
        let sec = nas
            .security
            .as_mut()
            .ok_or(NasSecurityError::NoSecurityContext)?;
        let unprotected = sec.unprotect(pdu)?;
        Ok((NasMessage::decode(&unprotected.message)?, true))
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    async fn registration_request(
        &mut self,
        amf_ue_id: AmfUeId,
        ran_ue_id: RanUeId,
        req: RegistrationRequest,
        verified: bool,
        known: Option<SharedNasContext>,
    ) {
        let ctx = Arc::clone(&self.base.ctx);
        log::info!(
            "[amf_ue_ngap_id={}] Registration request ({:?}, {})",
            amf_ue_id,
            req.registration_type,
            req.identity.type_name()
        );

        let (existing, supi, unresolved) = match &req.identity {
            MobileIdentity::Suci(suci) => {
                let supi = suci.to_supi();
                let existing = ctx
                    .nas_contexts
                    .lookup_by_supi(&supi)
                    .or_else(|| self.nas(amf_ue_id));
                (existing, Some(supi), false)
            }
            MobileIdentity::Guti(_) => {
                let supi = known.as_ref().and_then(|k| arena::read(k).supi.clone());
                let unresolved = known.is_none();
                (known.or_else(|| self.nas(amf_ue_id)), supi, unresolved)
            }
            other => {
                log::warn!(
                    "[amf_ue_ngap_id={}] registration with {} identity refused",
                    amf_ue_id,
                    other.type_name()
                );
                self.send_dl(
                    amf_ue_id,
                    NasMessage::RegistrationReject {
                        cause: cause::UE_IDENTITY_CANNOT_BE_DERIVED,
                    }
                    .encode(),
                );
                self.release(
                    amf_ue_id,
                    NgapCause::Nas(nas_cause::UNSPECIFIED),
                    ReleaseAction::RemoveContext,
                );
                return;
            }
        };

        let shared = match existing {
            Some(shared) => {
                let old = arena::read(&shared).amf_ue_id;
                self.adopt(old, amf_ue_id, ran_ue_id);
                shared
            }
            None => ctx.nas_contexts.insert(NasContext::new(amf_ue_id, ran_ue_id)),
        };

        let config = ctx.config();
        let snn = config
            .serving_guami()
            .map(|g| g.plmn.serving_network_name())
            .unwrap_or_default();
        let skip_authentication = {
            let mut nas = arena::write(&shared);
            self.stop_timers(&mut nas);
            nas.cm_state = CmState::Connected;
            nas.registration_type = req.registration_type;
            nas.follow_on_request = req.follow_on_request;
            nas.requested_nssai = req.requested_nssai.clone();
            nas.pdu_session_status = req.pdu_session_status;
            nas.serving_network_name = snn;
            nas.integrity_verified = verified;
            nas.registration_completed = false;
            nas.resync_attempted = false;
            if let Some(cap) = req.ue_security_capability {
                nas.ue_security_capability = Some(cap);
            }
            if let MobileIdentity::Suci(suci) = &req.identity {
                nas.suci = Some(suci.clone());
            }
            self.dispatch(&mut nas, GmmEvent::RegistrationRequest);

            if nas.ue_security_capability.is_none() {
                None
            } else {
                let update = matches!(
                    req.registration_type,
                    RegistrationType::MobilityUpdating | RegistrationType::PeriodicUpdating
                );
                let skip = update && verified && nas.has_full_security() && !unresolved;
                if !skip {
                    if let Some(sec) = nas.security.as_mut() {
                        sec.invalidate();
                    }
                }
                Some(skip)
            }
        };
        let Some(skip_authentication) = skip_authentication else {
            log::warn!("[amf_ue_ngap_id={}] no UE security capability", amf_ue_id);
            self.reject_registration(amf_ue_id, cause::SEMANTICALLY_INCORRECT_MESSAGE);
            return;
        };

        if unresolved {
            log::info!("[amf_ue_ngap_id={}] unknown 5G-GUTI, identity requested", amf_ue_id);
            arena::write(&shared).suspended_registration = Some(req);
            self.send_dl(
                amf_ue_id,
                NasMessage::IdentityRequest {
                    identity_type: IdentityType::Suci,
                }
                .encode(),
            );
            return;
        }

        if let Some(supi) = &supi {
            self.bind_supi(amf_ue_id, supi);
        }
        self.publish_location(amf_ue_id);

        if skip_authentication {
            log::info!("[amf_ue_ngap_id={}] integrity verified, authentication skipped", amf_ue_id);
            self.send_registration_accept(amf_ue_id).await;
        } else {
            self.start_authentication(amf_ue_id).await;
        }
    }

    async fn identity_response(
        &mut self,
        amf_ue_id: AmfUeId,
        ran_ue_id: RanUeId,
        identity: MobileIdentity,
    ) {
        let Some(shared) = self.nas(amf_ue_id) else {
            return;
        };
        let suspended = arena::write(&shared).suspended_registration.take();
        let Some(mut req) = suspended else {
            log::warn!("[amf_ue_ngap_id={}] unsolicited identity response", amf_ue_id);
            return;
        };
        match identity {
            MobileIdentity::Suci(suci) => {
                req.identity = MobileIdentity::Suci(suci);
                self.registration_request(amf_ue_id, ran_ue_id, req, false, None)
                    .await
            }
            other => {
                log::warn!(
                    "[amf_ue_ngap_id={}] identity response with {}",
                    amf_ue_id,
                    other.type_name()
                );
                self.reject_registration(amf_ue_id, cause::UE_IDENTITY_CANNOT_BE_DERIVED);
            }
        }
    }

    fn reject_registration(&self, amf_ue_id: AmfUeId, reject_cause: u8) {
        log::warn!(
            "[amf_ue_ngap_id={}] Registration reject (cause {})",
            amf_ue_id,
            reject_cause
        );
        let msg = NasMessage::RegistrationReject {
            cause: reject_cause,
        };
        let pdu = match self.nas(amf_ue_id) {
            Some(shared) => {
                let mut nas = arena::write(&shared);
                self.dispatch(&mut nas, GmmEvent::RegistrationRejected);
                secure(&mut nas, &msg)
            }
            None => Ok(msg.encode()),
        };
        match pdu {
            Ok(pdu) => self.send_dl(amf_ue_id, pdu),
            Err(e) => log::error!("[amf_ue_ngap_id={}] cannot protect reject: {}", amf_ue_id, e),
        }
        let ngap_cause = if reject_cause == cause::ILLEGAL_UE {
            nas_cause::AUTHENTICATION_FAILURE
        } else {
            nas_cause::UNSPECIFIED
        };
        self.release(
            amf_ue_id,
            NgapCause::Nas(ngap_cause),
            ReleaseAction::RemoveContext,
        );
    }

    // ------------------------------------------------------------------------
    // Authentication
    // ------------------------------------------------------------------------

    async fn fetch_vector(
        &self,
        supi: &Supi,
        serving_network_name: &str,
        resync: Option<ResyncInfo>,
    ) -> Result<HeAuthVector, GmmError> {
        let config = self.base.ctx.config();
        match config.authentication.mode {
            AuthenticationMode::Local => {
                let auth = self.base.ctx.local_auth();
                if let Some(resync) = &resync {
                    auth.resync(supi, &resync.rand, &resync.auts)?;
                }
                Ok(auth.generate(supi, serving_network_name)?)
            }
            AuthenticationMode::External => {
                let reply = sbi::request(
                    &self.base,
                    SbiRequest::UeAuthentication(UeAuthenticationRequest {
                        supi_or_suci: supi.to_string(),
                        serving_network_name: serving_network_name.to_string(),
                        resync,
                    }),
                    config.timers.peer_response(),
                )
                .await?;
                match reply {
                    SbiResponse::Authentication(av) => Ok(*av),
                    _ => Err(SbiError::UnexpectedResponse("ue-authentications").into()),
                }
            }
        }
    }

    async fn start_authentication(&mut self, amf_ue_id: AmfUeId) {
        let Some(shared) = self.nas(amf_ue_id) else {
            return;
        };
        let (reuse, supi, snn) = {
            let mut nas = arena::write(&shared);
            let reuse = !nas.auth_vectors.is_empty();
            if reuse {
                nas.auth_vector_index = nas.auth_vectors.len() - 1;
                if !nas.ngksi_available(nas.pending_ngksi) {
                    nas.pending_ngksi = nas.unused_ngksi();
                }
            }
            (reuse, nas.supi.clone(), nas.serving_network_name.clone())
        };
        let Some(supi) = supi else {
            self.reject_registration(amf_ue_id, cause::UE_IDENTITY_CANNOT_BE_DERIVED);
            return;
        };

        if !reuse {
            match self.fetch_vector(&supi, &snn, None).await {
                Ok(av) => {
                    let mut nas = arena::write(&shared);
                    nas.push_vector(av);
                    nas.pending_ngksi = nas.unused_ngksi();
                }
                Err(e) => {
                    log::warn!("[{}] no authentication vector: {}", supi, e);
                    self.reject_registration(amf_ue_id, e.reject_cause());
                    return;
                }
            }
        }
        self.send_authentication_request(&shared);
    }

    fn send_authentication_request(&self, shared: &SharedNasContext) {
        let (amf_ue_id, msg) = {
            let nas = arena::read(shared);
            let Some(av) = nas.current_vector() else {
                return;
            };
            (
                nas.amf_ue_id,
                NasMessage::AuthenticationRequest(AuthenticationRequest {
                    ngksi: nas.pending_ngksi,
                    abba: ABBA_DEFAULT.to_vec(),
                    rand: av.rand,
                    autn: av.autn,
                }),
            )
        };
        log::info!("[amf_ue_ngap_id={}] Authentication request", amf_ue_id);
        self.send_dl(amf_ue_id, msg.encode());
    }

    async fn authentication_response(&mut self, amf_ue_id: AmfUeId, res_star: Option<[u8; 16]>) {
        let Some(shared) = self.nas(amf_ue_id) else {
            return;
        };
        let (av, supi, state) = {
            let nas = arena::read(&shared);
            (nas.current_vector().cloned(), nas.supi.clone(), nas.state())
        };
        let (Some(av), Some(supi), GmmState::CommonProcedureInitiated) = (av, supi, state) else {
            log::warn!("[amf_ue_ngap_id={}] unexpected authentication response", amf_ue_id);
            return;
        };

        let kseaf = match res_star {
            Some(res_star) if av.verify_res_star(&res_star) => match &av.confirmation {
                Some(confirmation) => self.confirm_aka(confirmation, res_star).await,
                None => av.kseaf,
            },
            _ => None,
        };
        let Some(kseaf) = kseaf else {
            log::warn!("[{}] RES* verification failed", supi);
            self.send_dl(amf_ue_id, NasMessage::AuthenticationReject.encode());
            self.reject_registration(amf_ue_id, cause::ILLEGAL_UE);
            return;
        };

        {
            let mut nas = arena::write(&shared);
            let kamf = kdf::kamf(supi.as_str(), &ABBA_DEFAULT, &kseaf);
            nas.security = Some(NasSecurityContext::new(nas.pending_ngksi, kamf));
            let index = nas.auth_vector_index;
            if index < nas.auth_vectors.len() {
                nas.auth_vectors.remove(index);
            }
            nas.auth_vector_index = nas.auth_vectors.len().saturating_sub(1);
            nas.resync_attempted = false;
        }
        log::info!("[{}] authentication successful", supi);
        self.start_security_mode(amf_ue_id);
    }

    async fn confirm_aka(&self, confirmation: &str, res_star: [u8; 16]) -> Option<[u8; 32]> {
        let reply = sbi::request(
            &self.base,
            SbiRequest::ConfirmAka {
                confirmation: confirmation.to_string(),
                res_star,
            },
            self.base.ctx.config().timers.peer_response(),
        )
        .await;
        match reply {
            Ok(SbiResponse::AkaConfirmed(result)) if result.success => result.kseaf,
            Ok(_) => None,
            Err(e) => {
                log::warn!("5G AKA confirmation failed: {}", e);
                None
            }
        }
    }

    async fn authentication_failure(
        &mut self,
        amf_ue_id: AmfUeId,
        failure_cause: u8,
        auts: Option<[u8; 14]>,
    ) {
        let Some(shared) = self.nas(amf_ue_id) else {
            return;
        };
        log::warn!(
            "[amf_ue_ngap_id={}] Authentication failure (cause {})",
            amf_ue_id,
            failure_cause
        );
        match failure_cause {
            cause::SYNCH_FAILURE => {
                let (attempted, rand, supi, snn) = {
                    let mut nas = arena::write(&shared);
                    let attempted = nas.resync_attempted;
                    nas.resync_attempted = true;
                    (
                        attempted,
                        nas.current_vector().map(|av| av.rand),
                        nas.supi.clone(),
                        nas.serving_network_name.clone(),
                    )
                };
                let (false, Some(rand), Some(auts), Some(supi)) = (attempted, rand, auts, supi)
                else {
                    self.send_dl(amf_ue_id, NasMessage::AuthenticationReject.encode());
                    self.reject_registration(amf_ue_id, cause::ILLEGAL_UE);
                    return;
                };
                match self
                    .fetch_vector(&supi, &snn, Some(ResyncInfo { rand, auts }))
                    .await
                {
                    Ok(av) => {
                        let mut nas = arena::write(&shared);
                        nas.clear_vectors();
                        nas.push_vector(av);
                        nas.pending_ngksi = nas.unused_ngksi();
                        self.dispatch(&mut nas, GmmEvent::AuthenticationRestart);
                    }
                    Err(e) => {
                        log::warn!("[{}] re-synchronisation failed: {}", supi, e);
                        self.reject_registration(amf_ue_id, cause::ILLEGAL_UE);
                        return;
                    }
                }
                self.send_authentication_request(&shared);
            }
            cause::NGKSI_ALREADY_IN_USE => {
                {
                    let mut nas = arena::write(&shared);
                    let mut next = (nas.pending_ngksi + 1) % NGKSI_RANGE;
                    if !nas.ngksi_available(next) {
                        next = (next + 1) % NGKSI_RANGE;
                    }
                    nas.pending_ngksi = next;
                    self.dispatch(&mut nas, GmmEvent::AuthenticationRestart);
                }
                self.send_authentication_request(&shared);
            }
            _ => {
                self.send_dl(amf_ue_id, NasMessage::AuthenticationReject.encode());
                self.reject_registration(amf_ue_id, cause::ILLEGAL_UE);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Security mode control
    // ------------------------------------------------------------------------

    fn start_security_mode(&self, amf_ue_id: AmfUeId) {
        let Some(shared) = self.nas(amf_ue_id) else {
            return;
        };
        let config = self.base.ctx.config();
        let integrity_order = config.integrity_order().unwrap_or_default();
        let ciphering_order = config.ciphering_order().unwrap_or_default();

        let pdu = {
            let mut nas = arena::write(&shared);
            let capability = nas.ue_security_capability.unwrap_or_default();
            let Some(sec) = nas.security.as_mut() else {
                return;
            };
            let (integrity, ciphering) =
                select_algorithms(&capability, &integrity_order, &ciphering_order);
            sec.activate(integrity, ciphering);
            let msg = NasMessage::SecurityModeCommand(SecurityModeCommand {
                integrity,
                ciphering,
                ngksi: sec.ngksi,
                replayed_capability: capability,
                imeisv_request: true,
                abba: ABBA_DEFAULT.to_vec(),
            });
            sec.protect(
                &msg.encode(),
                SecurityHeaderType::IntegrityProtectedWithNewContext,
            )
        };
        match pdu {
            Ok(pdu) => {
                log::info!("[amf_ue_ngap_id={}] Security mode command", amf_ue_id);
                self.send_dl(amf_ue_id, pdu);
            }
            Err(e) => log::error!("[amf_ue_ngap_id={}] security mode command: {}", amf_ue_id, e),
        }
    }

    async fn security_mode_complete(&mut self, amf_ue_id: AmfUeId, imeisv: Option<String>) {
        let Some(shared) = self.nas(amf_ue_id) else {
            return;
        };
        {
            let mut nas = arena::write(&shared);
            let tag = nas.tag();
            let Some(sec) = nas.security.as_mut() else {
                return;
            };
            if !sec.complete() {
                log::info!("[{}] duplicate security mode complete ignored", tag);
                return;
            }
            nas.imeisv = imeisv;
        }
        self.send_registration_accept(amf_ue_id).await;
    }

    // ------------------------------------------------------------------------
    // Registration accept
    // ------------------------------------------------------------------------

    /// Allowed NSSAI for a subscriber, or a target AMF set to reroute to
    async fn select_slices(
        &self,
        supi: &Supi,
        requested: &[Snssai],
        tai: Option<Tai>,
    ) -> Result<Vec<Snssai>, u16> {
        let config = self.base.ctx.config();
        let bound = config.timers.peer_response();
        let Some(guami) = config.serving_guami().cloned() else {
            return Ok(Vec::new());
        };
        let configured = config.slices_for(&guami.plmn);
        let requested: Vec<Snssai> = if requested.is_empty() {
            configured.clone()
        } else {
            requested
                .iter()
                .filter(|s| configured.contains(s))
                .cloned()
                .collect()
        };

        let subscribed = match sbi::request(
            &self.base,
            SbiRequest::SliceSubscription(supi.clone()),
            bound,
        )
        .await
        {
            Ok(SbiResponse::SubscribedSlices(slices)) => slices,
            _ => config
                .subscriber(supi)
                .map(|s| s.slices.clone())
                .unwrap_or_default(),
        };
        let local: Vec<Snssai> = requested
            .iter()
            .filter(|s| subscribed.is_empty() || subscribed.contains(s))
            .cloned()
            .collect();

        let selection = sbi::request(
            &self.base,
            SbiRequest::SliceSelection {
                supi: supi.clone(),
                requested: requested.clone(),
                subscribed,
                tai,
            },
            bound,
        )
        .await;
        match selection {
            Ok(SbiResponse::SliceSelection(selection)) => {
                if let Some(set) = selection.target_amf_set {
                    if set != guami.set_id {
                        return Err(set);
                    }
                }
                Ok(selection
                    .allowed
                    .into_iter()
                    .filter(|s| configured.contains(s))
                    .collect())
            }
            other => {
                log::warn!("[{}] slice selection unavailable ({:?}), local policy used", supi, other.err());
                Ok(local)
            }
        }
    }

    async fn send_registration_accept(&mut self, amf_ue_id: AmfUeId) {
        let ctx = Arc::clone(&self.base.ctx);
        let (Some(shared), Some(ue)) = (self.nas(amf_ue_id), ctx.ue_contexts.lookup_by_amf_id(amf_ue_id))
        else {
            return;
        };
        let (supi, requested) = {
            let nas = arena::read(&shared);
            (nas.supi.clone(), nas.requested_nssai.clone())
        };
        let Some(supi) = supi else {
            return;
        };
        let tai = arena::read(&ue).tai.clone();

        let allowed = match self.select_slices(&supi, &requested, tai).await {
            Ok(allowed) => allowed,
            Err(amf_set_id) => {
                log::info!("[{}] rerouted to AMF set {}", supi, amf_set_id);
                self.send_n2(N2Message::Reroute {
                    amf_ue_id,
                    amf_set_id,
                    allowed_nssai: requested,
                });
                return;
            }
        };
        if allowed.is_empty() {
            self.reject_registration(amf_ue_id, cause::NO_NETWORK_SLICES_AVAILABLE);
            return;
        }

        let config = ctx.config();
        let Some(guami) = config.serving_guami().cloned() else {
            return;
        };
        let guti = Guti::new(&guami, ctx.ids.next_tmsi());
        ctx.nas_contexts.bind_guti(amf_ue_id, &guti);
        let (sessions, context_requested) = {
            let mut ue = arena::write(&ue);
            ue.tmsi = Some(guti.tmsi);
            (ue.pdu_session_ids(), ue.context_requested)
        };

        let accept = NasMessage::RegistrationAccept(RegistrationAccept {
            result: REGISTRATION_RESULT_3GPP,
            guti: Some(guti.clone()),
            allowed_nssai: allowed.clone(),
            tai_list: config.tai.clone(),
            network_feature_support: None,
            network_name: Some(config.network_name.full.clone()),
            t3512: Some(
                config
                    .timers
                    .mobile_reachable
                    .saturating_sub(MOBILE_REACHABLE_MARGIN) as u32,
            ),
            pdu_session_status: Some(session_bitmap(&sessions)),
        });

        let delivery = {
            let mut nas = arena::write(&shared);
            nas.allowed_nssai = allowed.clone();
            let pdu = secure(&mut nas, &accept);
            let capability = nas.ue_security_capability.unwrap_or_default();
            let kgnb = nas.security.as_mut().map(|sec| sec.initial_kgnb());
            self.dispatch(&mut nas, GmmEvent::RegistrationAccepted);
            pdu.map(|pdu| (pdu, capability, kgnb))
        };
        let (pdu, capability, kgnb) = match delivery {
            Ok(delivery) => delivery,
            Err(e) => {
                log::error!("[{}] cannot protect registration accept: {}", supi, e);
                return;
            }
        };
        log::info!("[{}] Registration accept (GUTI {})", supi, guti);
        ctx.publish(Some(&supi), EventPayload::Reachability(Reachability::Reachable));
        ctx.publish(Some(&supi), EventPayload::ConnectivityState(CmState::Connected));

        match (context_requested, kgnb) {
            (true, Some(security_key)) => self.send_n2(N2Message::InitialContextSetup(Box::new(
                ContextSetup {
                    amf_ue_id,
                    nas_pdu: Some(pdu),
                    security_key,
                    allowed_nssai: allowed,
                    ue_security_capability: capability,
                    pdu_sessions: Vec::new(),
                },
            ))),
            _ => self.send_dl(amf_ue_id, pdu),
        }
    }

    fn registration_complete(&mut self, amf_ue_id: AmfUeId) {
        let Some(shared) = self.nas(amf_ue_id) else {
            return;
        };
        let mut nas = arena::write(&shared);
        if self.dispatch(&mut nas, GmmEvent::RegistrationComplete) != GmmFsmResult::Ignored {
            nas.registration_completed = true;
            log::info!("[{}] Registration complete", nas.tag());
        }
    }

    // ------------------------------------------------------------------------
    // Service request
    // ------------------------------------------------------------------------

    fn reject_service(&self, amf_ue_id: AmfUeId, reject_cause: u8) {
        log::warn!(
            "[amf_ue_ngap_id={}] Service reject (cause {})",
            amf_ue_id,
            reject_cause
        );
        self.send_dl(
            amf_ue_id,
            NasMessage::ServiceReject {
                cause: reject_cause,
            }
            .encode(),
        );
        self.release(
            amf_ue_id,
            NgapCause::Nas(nas_cause::NORMAL_RELEASE),
            ReleaseAction::RemoveContext,
        );
    }

    async fn service_request(
        &mut self,
        amf_ue_id: AmfUeId,
        ran_ue_id: RanUeId,
        req: ServiceRequest,
        verified: bool,
        known: Option<SharedNasContext>,
    ) {
        let ctx = Arc::clone(&self.base.ctx);
        let Some(shared) = known else {
            self.reject_service(amf_ue_id, cause::UE_IDENTITY_CANNOT_BE_DERIVED);
            return;
        };
        let (old, registered, secured) = {
            let nas = arena::read(&shared);
            (nas.amf_ue_id, nas.fsm.is_registered(), nas.has_full_security())
        };
        if !(secured && verified) {
            self.reject_service(amf_ue_id, cause::UE_IDENTITY_CANNOT_BE_DERIVED);
            return;
        }
        if !registered {
            self.reject_service(amf_ue_id, cause::IMPLICITLY_DEREGISTERED);
            return;
        }
        self.adopt(old, amf_ue_id, ran_ue_id);

        let supi = {
            let mut nas = arena::write(&shared);
            self.stop_timers(&mut nas);
            nas.cm_state = CmState::Connected;
            self.dispatch(&mut nas, GmmEvent::ServiceRequest);
            nas.supi.clone()
        };
        log::info!("[amf_ue_ngap_id={}] Service request", amf_ue_id);
        ctx.publish(supi.as_ref(), EventPayload::Reachability(Reachability::Reachable));
        ctx.publish(supi.as_ref(), EventPayload::ConnectivityState(CmState::Connected));
        self.publish_location(amf_ue_id);

        // Sessions the UE wants back, among those it still has
        let requested = req
            .uplink_data_status
            .or(req.pdu_session_status)
            .map(bitmap_sessions)
            .unwrap_or_default();
        let (sessions, to_activate) = match ctx.ue_contexts.lookup_by_amf_id(amf_ue_id) {
            Some(ue) => {
                let ue = arena::read(&ue);
                let to_activate: Vec<(PduSessionId, String)> = ue
                    .pdu_sessions
                    .values()
                    .filter(|s| requested.contains(&s.id))
                    .filter_map(|s| s.sm_context_ref.clone().map(|r| (s.id, r)))
                    .collect();
                (ue.pdu_session_ids(), to_activate)
            }
            None => (Vec::new(), Vec::new()),
        };

        let requests = to_activate
            .iter()
            .map(|(_, sm_ref)| {
                let mut update = SmContextUpdate::new(sm_ref);
                update.up_cnx_state = Some(UpCnxState::Activating);
                SbiRequest::UpdateSmContext(update)
            })
            .collect();
        let replies =
            sbi::request_all(&self.base, requests, ctx.config().timers.peer_response()).await;
        let mut items = Vec::new();
        let mut failed = Vec::new();
        for ((id, _), reply) in to_activate.iter().zip(replies) {
            match reply {
                Ok(SbiResponse::SmContextUpdated(updated)) => {
                    if let Some(n2) = updated.n2_sm {
                        items.push(PduSessionResourceItem::new(*id, n2));
                    }
                }
                _ => failed.push(*id),
            }
        }

        let accept = NasMessage::ServiceAccept(ServiceAccept {
            pdu_session_status: Some(session_bitmap(&sessions)),
            reactivation_result: if failed.is_empty() {
                None
            } else {
                Some(session_bitmap(&failed))
            },
        });
        let (delivery, capability, allowed) = {
            let mut nas = arena::write(&shared);
            let capability = nas.ue_security_capability.unwrap_or_default();
            let allowed = nas.allowed_nssai.clone();
            (service_accept(&mut nas, &accept), capability, allowed)
        };
        match delivery {
            Ok(Some((pdu, security_key))) => {
                self.send_n2(N2Message::InitialContextSetup(Box::new(ContextSetup {
                    amf_ue_id,
                    nas_pdu: Some(pdu),
                    security_key,
                    allowed_nssai: allowed,
                    ue_security_capability: capability,
                    pdu_sessions: items,
                })))
            }
            Ok(None) => {
                log::warn!(
                    "[amf_ue_ngap_id={}] security context gone before service accept",
                    amf_ue_id
                );
                self.reject_service(amf_ue_id, cause::UE_IDENTITY_CANNOT_BE_DERIVED);
            }
            Err(e) => log::error!("[amf_ue_ngap_id={}] cannot protect service accept: {}", amf_ue_id, e),
        }
    }

    // ------------------------------------------------------------------------
    // De-registration
    // ------------------------------------------------------------------------

    /// Release every SM context of a subscriber
    async fn release_sessions(&self, amf_ue_id: AmfUeId) {
        let Some(ue) = self.base.ctx.ue_contexts.lookup_by_amf_id(amf_ue_id) else {
            return;
        };
        let sessions: Vec<PduSessionContext> = {
            let mut ue = arena::write(&ue);
            std::mem::take(&mut ue.pdu_sessions).into_values().collect()
        };
        let requests = sessions
            .iter()
            .filter_map(|s| s.sm_context_ref.clone())
            .map(SbiRequest::ReleaseSmContext)
            .collect();
        let bound = self.base.ctx.config().timers.peer_response();
        for reply in sbi::request_all(&self.base, requests, bound).await {
            if let Err(e) = reply {
                log::warn!("[amf_ue_ngap_id={}] SM context release: {}", amf_ue_id, e);
            }
        }
    }

    async fn deregistration_request(&mut self, amf_ue_id: AmfUeId, req: DeregistrationRequest) {
        log::info!(
            "[amf_ue_ngap_id={}] De-registration request{}",
            amf_ue_id,
            if req.switch_off { " (switch off)" } else { "" }
        );
        let Some(shared) = self.nas(amf_ue_id) else {
            if !req.switch_off {
                self.send_dl(amf_ue_id, NasMessage::DeregistrationAccept.encode());
            }
            self.release(
                amf_ue_id,
                NgapCause::Nas(nas_cause::DEREGISTER),
                ReleaseAction::RemoveContext,
            );
            return;
        };

        self.release_sessions(amf_ue_id).await;
        let accept = {
            let mut nas = arena::write(&shared);
            self.stop_timers(&mut nas);
            self.dispatch(&mut nas, GmmEvent::DeregistrationRequest);
            if req.switch_off {
                None
            } else {
                Some(secure(&mut nas, &NasMessage::DeregistrationAccept))
            }
        };
        match accept {
            Some(Ok(pdu)) => self.send_dl(amf_ue_id, pdu),
            Some(Err(e)) => log::error!("[amf_ue_ngap_id={}] de-registration accept: {}", amf_ue_id, e),
            None => {}
        }
        self.base.ctx.nas_contexts.remove(amf_ue_id);
        self.release(
            amf_ue_id,
            NgapCause::Nas(nas_cause::DEREGISTER),
            ReleaseAction::RemoveContext,
        );
    }

    // ------------------------------------------------------------------------
    // 5GSM transport
    // ------------------------------------------------------------------------

    /// Deliver SM payloads: N2 content goes in a PDU session resource setup,
    /// N1 content alone in a downlink NAS transport
    fn deliver_sm(
        &self,
        amf_ue_id: AmfUeId,
        pdu_session_id: PduSessionId,
        n1_sm: Option<Bytes>,
        n2_sm: Option<Bytes>,
        error_cause: Option<u8>,
    ) {
        let nas_pdu = match (n1_sm, self.nas(amf_ue_id)) {
            (Some(payload), Some(shared)) => {
                let msg = NasMessage::DlNasTransport(DlNasTransport {
                    payload_container_type: PAYLOAD_CONTAINER_N1_SM,
                    payload,
                    pdu_session_id: Some(pdu_session_id),
                    cause: error_cause,
                });
                match secure(&mut arena::write(&shared), &msg) {
                    Ok(pdu) => Some(pdu),
                    Err(e) => {
                        log::error!("[amf_ue_ngap_id={}] DL NAS transport: {}", amf_ue_id, e);
                        return;
                    }
                }
            }
            _ => None,
        };
        match (n2_sm, nas_pdu) {
            (Some(transfer), nas_pdu) => {
                let snssai = self
                    .base
                    .ctx
                    .ue_contexts
                    .lookup_by_amf_id(amf_ue_id)
                    .and_then(|ue| {
                        arena::read(&ue)
                            .pdu_session(pdu_session_id)
                            .map(|s| s.snssai)
                    });
                self.send_n2(N2Message::PduSessionSetup {
                    amf_ue_id,
                    nas_pdu,
                    pdu_sessions: vec![PduSessionResourceItem {
                        id: pdu_session_id,
                        snssai,
                        transfer,
                    }],
                });
            }
            (None, Some(nas_pdu)) => self.send_dl(amf_ue_id, nas_pdu),
            (None, None) => {}
        }
    }

    async fn ul_nas_transport(&mut self, amf_ue_id: AmfUeId, transport: UlNasTransport) {
        let ctx = Arc::clone(&self.base.ctx);
        let (Some(shared), Some(ue)) = (self.nas(amf_ue_id), ctx.ue_contexts.lookup_by_amf_id(amf_ue_id))
        else {
            return;
        };
        let (supi, allowed, registered) = {
            let nas = arena::read(&shared);
            (nas.supi.clone(), nas.allowed_nssai.clone(), nas.fsm.is_registered())
        };
        let (Some(supi), true) = (supi, registered) else {
            log::warn!("[amf_ue_ngap_id={}] UL NAS transport before registration", amf_ue_id);
            return;
        };
        if transport.payload_container_type != PAYLOAD_CONTAINER_N1_SM {
            log::warn!(
                "[{}] payload container type {} not supported",
                supi,
                transport.payload_container_type
            );
            return;
        }
        let Some(psi) = transport.pdu_session_id else {
            log::warn!("[{}] 5GSM payload without PDU session id", supi);
            return;
        };
        let bound = ctx.config().timers.peer_response();
        let existing_ref = arena::read(&ue)
            .pdu_session(psi)
            .and_then(|s| s.sm_context_ref.clone());

        if transport.request_type == Some(request_type::INITIAL_REQUEST) || existing_ref.is_none() {
            let Some(snssai) = transport.snssai.or_else(|| allowed.first().copied()) else {
                self.deliver_sm(
                    amf_ue_id,
                    psi,
                    Some(transport.payload),
                    None,
                    Some(cause::PAYLOAD_WAS_NOT_FORWARDED),
                );
                return;
            };
            let dnn = transport.dnn.clone().unwrap_or_else(|| DEFAULT_DNN.to_string());
            arena::write(&ue).set_pdu_session(PduSessionContext::new(psi, &dnn, snssai));
            log::info!("[{}] PDU session {} create (dnn={} s-nssai={})", supi, psi, dnn, snssai);

            let reply = sbi::request(
                &self.base,
                SbiRequest::CreateSmContext(SmContextCreate {
                    supi: supi.clone(),
                    pdu_session_id: psi,
                    dnn,
                    snssai,
                    n1_sm: transport.payload.clone(),
                }),
                bound,
            )
            .await;
            match reply {
                Ok(SbiResponse::SmContextCreated(created)) => {
                    if let Some(session) = arena::write(&ue).pdu_session_mut(psi) {
                        session.sm_context_ref = Some(created.sm_context_ref.clone());
                        session.smf_addr = Some(created.smf_addr.clone());
                        session.n2_sm = created.n2_sm.clone();
                    }
                    self.deliver_sm(amf_ue_id, psi, created.n1_sm, created.n2_sm, None);
                }
                other => {
                    log::warn!("[{}] PDU session {} not created: {:?}", supi, psi, other.err());
                    arena::write(&ue).remove_pdu_session(psi);
                    self.deliver_sm(
                        amf_ue_id,
                        psi,
                        Some(transport.payload),
                        None,
                        Some(cause::PAYLOAD_WAS_NOT_FORWARDED),
                    );
                }
            }
        } else if let Some(sm_ref) = existing_ref {
            let mut update = SmContextUpdate::new(&sm_ref);
            update.n1_sm = Some(transport.payload.clone());
            match sbi::request(&self.base, SbiRequest::UpdateSmContext(update), bound).await {
                Ok(SbiResponse::SmContextUpdated(updated)) => {
                    self.deliver_sm(amf_ue_id, psi, updated.n1_sm, updated.n2_sm, None)
                }
                other => {
                    log::warn!("[{}] PDU session {} update failed: {:?}", supi, psi, other.err());
                    self.deliver_sm(
                        amf_ue_id,
                        psi,
                        Some(transport.payload),
                        None,
                        Some(cause::PAYLOAD_WAS_NOT_FORWARDED),
                    );
                }
            }
        }
    }

    async fn n1n2_transfer(
        &mut self,
        supi: Supi,
        pdu_session_id: PduSessionId,
        n1_sm: Option<Bytes>,
        n2_sm: Option<Bytes>,
    ) -> N1N2TransferResult {
        let Some(shared) = self.base.ctx.nas_contexts.lookup_by_supi(&supi) else {
            return N1N2TransferResult::ContextNotFound;
        };
        let (amf_ue_id, cm_state, expired) = {
            let nas = arena::read(&shared);
            (nas.amf_ue_id, nas.cm_state, nas.mobile_reachable_expired)
        };
        match cm_state {
            CmState::Idle if expired => N1N2TransferResult::UeNotReachable,
            CmState::Idle => {
                self.send_n2(N2Message::Page { amf_ue_id });
                N1N2TransferResult::AttemptingToReach
            }
            CmState::Connected => {
                self.deliver_sm(amf_ue_id, pdu_session_id, n1_sm, n2_sm, None);
                N1N2TransferResult::Transferred
            }
        }
    }

    // ------------------------------------------------------------------------
    // Connection loss and timers
    // ------------------------------------------------------------------------

    async fn connection_lost(&mut self, amf_ue_id: AmfUeId) {
        let ctx = Arc::clone(&self.base.ctx);
        let Some(shared) = self.nas(amf_ue_id) else {
            return;
        };
        let supi = {
            let mut nas = arena::write(&shared);
            nas.cm_state = CmState::Idle;
            nas.supi.clone()
        };
        log::info!("[amf_ue_ngap_id={}] {}", amf_ue_id, CmState::Idle.name());
        ctx.publish(supi.as_ref(), EventPayload::ConnectivityState(CmState::Idle));

        // User plane goes down with the radio connection
        let active: Vec<String> = ctx
            .ue_contexts
            .lookup_by_amf_id(amf_ue_id)
            .map(|ue| {
                let mut ue = arena::write(&ue);
                ue.pdu_sessions
                    .values_mut()
                    .filter_map(|s| {
                        s.up_active = false;
                        s.sm_context_ref.clone()
                    })
                    .collect()
            })
            .unwrap_or_default();
        let requests = active
            .iter()
            .map(|sm_ref| {
                let mut update = SmContextUpdate::new(sm_ref);
                update.up_cnx_state = Some(UpCnxState::Deactivated);
                SbiRequest::UpdateSmContext(update)
            })
            .collect();
        sbi::request_all(&self.base, requests, ctx.config().timers.peer_response()).await;

        let registered = arena::read(&shared).fsm.is_registered();
        if registered {
            let timer = ctx.timers.start(
                &self.base.n1,
                ctx.config().timers.mobile_reachable(),
                N1Message::MobileReachableExpired { amf_ue_id },
            );
            arena::write(&shared).mobile_reachable_timer = Some(timer);
        }
    }

    fn mobile_reachable_expired(&mut self, amf_ue_id: AmfUeId) {
        let ctx = Arc::clone(&self.base.ctx);
        let Some(shared) = self.nas(amf_ue_id) else {
            return;
        };
        let supi = {
            let mut nas = arena::write(&shared);
            if nas.mobile_reachable_timer.take().is_none() {
                return;
            }
            nas.mobile_reachable_expired = true;
            nas.supi.clone()
        };
        log::info!("[amf_ue_ngap_id={}] mobile reachable timer expired", amf_ue_id);
        ctx.publish(supi.as_ref(), EventPayload::Reachability(Reachability::Unreachable));
        let timer = ctx.timers.start(
            &self.base.n1,
            ctx.config().timers.implicit_deregistration(),
            N1Message::ImplicitDeregExpired { amf_ue_id },
        );
        arena::write(&shared).implicit_dereg_timer = Some(timer);
    }

    async fn implicit_dereg_expired(&mut self, amf_ue_id: AmfUeId) {
        let Some(shared) = self.nas(amf_ue_id) else {
            return;
        };
        if arena::write(&shared).implicit_dereg_timer.take().is_none() {
            return;
        }
        log::info!("[amf_ue_ngap_id={}] implicit de-registration", amf_ue_id);
        self.release_sessions(amf_ue_id).await;
        {
            let mut nas = arena::write(&shared);
            self.dispatch(&mut nas, GmmEvent::ImplicitDeregistration);
        }
        self.base.ctx.nas_contexts.remove(amf_ue_id);
        self.release(
            amf_ue_id,
            NgapCause::Nas(nas_cause::DEREGISTER),
            ReleaseAction::RemoveContext,
        );
    }
}

#[async_trait]
impl Task for N1Task {
    type Message = N1Message;

    fn id(&self) -> TaskId {
        TaskId::N1
    }

    async fn handle(&mut self, msg: N1Message) {
        match msg {
            N1Message::Establish(e) => self.establish(*e).await,
            N1Message::UplinkNas {
                amf_ue_id,
                ran_ue_id,
                nas_pdu,
                tai,
                cgi,
            } => self.uplink_nas(amf_ue_id, ran_ue_id, nas_pdu, tai, cgi).await,
            N1Message::ConnectionLost { amf_ue_id } => self.connection_lost(amf_ue_id).await,
            N1Message::MobileReachableExpired { amf_ue_id } => {
                self.mobile_reachable_expired(amf_ue_id)
            }
            N1Message::ImplicitDeregExpired { amf_ue_id } => {
                self.implicit_dereg_expired(amf_ue_id).await
            }
            N1Message::N1N2Transfer {
                supi,
                pdu_session_id,
                n1_sm,
                n2_sm,
                reply,
            } => {
                let result = self.n1n2_transfer(supi, pdu_session_id, n1_sm, n2_sm).await;
                let _ = reply.send(result);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nas_message::UeSecurityCapability;
    use crate::types::Plmn;

    #[test]
    fn test_session_bitmap() {
        assert_eq!(session_bitmap(&[1, 5]), 0b0010_0010);
        assert_eq!(bitmap_sessions(0b0010_0010), vec![1, 5]);
        assert_eq!(session_bitmap(&[]), 0);
        assert!(bitmap_sessions(1).is_empty());
    }

    #[test]
    fn test_secure_is_plain_without_full_context() {
        let mut nas = NasContext::new(AmfUeId(1), RanUeId(1));
        let msg = NasMessage::RegistrationReject {
            cause: cause::ILLEGAL_UE,
        };
        assert_eq!(secure(&mut nas, &msg).unwrap(), msg.encode());

        let mut sec = NasSecurityContext::new(1, [7u8; 32]);
        sec.activate(
            amfcore_crypt::nia::IntegrityAlgorithm::Nia2,
            amfcore_crypt::nea::CipheringAlgorithm::Nea0,
        );
        nas.security = Some(sec);
        // Partial context: still plain
        assert_eq!(secure(&mut nas, &msg).unwrap(), msg.encode());

        nas.security.as_mut().unwrap().complete();
        let protected = secure(&mut nas, &msg).unwrap();
        assert_eq!(
            security_header_type(&protected).unwrap(),
            SecurityHeaderType::IntegrityProtectedAndCiphered
        );
        assert_eq!(nas.security.as_ref().unwrap().dl_count(), 1);
    }

    #[test]
    fn test_service_accept_needs_security_context() {
        let accept = NasMessage::ServiceAccept(ServiceAccept {
            pdu_session_status: Some(0),
            reactivation_result: None,
        });
        let mut nas = NasContext::new(AmfUeId(4), RanUeId(9));
        assert_eq!(service_accept(&mut nas, &accept).unwrap(), None);

        let mut sec = NasSecurityContext::new(5, [3u8; 32]);
        sec.activate(
            amfcore_crypt::nia::IntegrityAlgorithm::Nia2,
            amfcore_crypt::nea::CipheringAlgorithm::Nea2,
        );
        sec.complete();
        nas.security = Some(sec);
        let (pdu, kgnb) = service_accept(&mut nas, &accept).unwrap().unwrap();
        assert_eq!(
            security_header_type(&pdu).unwrap(),
            SecurityHeaderType::IntegrityProtectedAndCiphered
        );
        let sec = nas.security.as_ref().unwrap();
        assert_eq!(sec.dl_count(), 1);
        assert_eq!(sec.ncc(), 0);
        assert_ne!(kgnb, [0u8; 32]);
    }

    #[test]
    fn test_identity_guti_from_s_tmsi() {
        let guami = crate::types::Guami {
            plmn: Plmn::new("001", "01"),
            region_id: 0x80,
            set_id: 4,
            pointer: 1,
        };
        let guti = Guti::new(&guami, 9);
        let msg = NasMessage::ServiceRequest(ServiceRequest {
            service_type: 0,
            ngksi: 1,
            identity: MobileIdentity::STmsi(guti.s_tmsi()),
            uplink_data_status: None,
            pdu_session_status: None,
        });
        assert_eq!(identity_guti(&msg, Some(&guami)), Some(guti));
        let reg = NasMessage::RegistrationRequest(RegistrationRequest {
            ue_security_capability: Some(UeSecurityCapability::new(0xf0, 0xf0)),
            ..RegistrationRequest::default()
        });
        assert_eq!(identity_guti(&reg, Some(&guami)), None);
    }

    #[test]
    fn test_reject_cause_mapping() {
        let unknown = GmmError::Auth(AuthError::UnknownSubscriber(Supi::from_imsi("1")));
        assert_eq!(unknown.reject_cause(), cause::ILLEGAL_UE);
        let timeout = GmmError::Sbi(SbiError::Timeout(std::time::Duration::from_secs(1)));
        assert_eq!(timeout.reject_cause(), cause::PROTOCOL_ERROR_UNSPECIFIED);
    }
}

//! NGAP session manager (N2 task)
//!
//! Handles radio-node associations and NG interface management, routes NAS
//! between the radio side and the NAS engine, and coordinates UE context
//! release, paging and N2 handover.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::app::AppMessage;
use crate::arena;
use crate::config::AmfConfig;
use crate::context::TaskBase;
use crate::event::EventPayload;
use crate::gmm::N1Message;
use crate::nas_message::UeSecurityCapability;
use crate::ngap_context::{ReleaseAction, UeNgapContext, DEFAULT_OUTBOUND_STREAMS};
use crate::ngap_message::{
    misc_cause, protocol_cause, radio_network_cause, HandoverCommand, HandoverRequest,
    HandoverRequestAcknowledge, HandoverRequired, HandoverType, InitialContextSetupRequest,
    InitialUeMessage, NgSetupRequest, NgSetupResponse, NgapCause, NgapMessage,
    PduSessionResourceItem, RerouteNasRequest, ResetType, SupportedTa, UeNgapIds,
    UplinkNasTransport,
};
use crate::ngap_sm::{GnbEvent, GnbState, UeNgapEvent};
use crate::runtime::{Task, TaskId};
use crate::sbi::{self, HoState, SbiRequest, SbiResponse, SmContextUpdate, UpCnxState};
use crate::types::{AmfUeId, AssocId, Guti, PlmnSupport, RanUeId, Snssai};
use crate::ue_context::PduSessionId;

/// Stream for non-UE-associated signalling
const COMMON_STREAM: u16 = 0;

// ============================================================================
// Messages
// ============================================================================

/// Initial Context Setup content prepared by the NAS engine
#[derive(Debug, Clone)]
pub struct ContextSetup {
    pub amf_ue_id: AmfUeId,
    pub nas_pdu: Option<Bytes>,
    pub security_key: [u8; 32],
    pub allowed_nssai: Vec<Snssai>,
    pub ue_security_capability: UeSecurityCapability,
    pub pdu_sessions: Vec<PduSessionResourceItem>,
}

#[derive(Debug)]
pub enum N2Message {
    AssociationUp {
        assoc: AssocId,
        max_ostreams: u16,
    },
    AssociationDown {
        assoc: AssocId,
    },
    /// Decoded NGAP PDU received on an association
    Pdu {
        assoc: AssocId,
        stream: u16,
        msg: NgapMessage,
    },
    DownlinkNas {
        amf_ue_id: AmfUeId,
        nas_pdu: Bytes,
    },
    InitialContextSetup(Box<ContextSetup>),
    PduSessionSetup {
        amf_ue_id: AmfUeId,
        nas_pdu: Option<Bytes>,
        pdu_sessions: Vec<PduSessionResourceItem>,
    },
    ReleaseUe {
        amf_ue_id: AmfUeId,
        cause: NgapCause,
        action: ReleaseAction,
    },
    Page {
        amf_ue_id: AmfUeId,
    },
    Reroute {
        amf_ue_id: AmfUeId,
        amf_set_id: u16,
        allowed_nssai: Vec<Snssai>,
    },
}

/// PLMN/slice support common to the radio node and this AMF
///
/// A broadcast PLMN counts when one of its TAs is configured here and at
/// least one of its slices is served for that PLMN.
pub fn common_plmn_support(config: &AmfConfig, supported_tas: &[SupportedTa]) -> Vec<PlmnSupport> {
    let mut common: Vec<PlmnSupport> = Vec::new();
    for ta in supported_tas {
        for broadcast in &ta.broadcast_plmns {
            let configured_ta = config
                .tai
                .iter()
                .any(|tai| tai.plmn == broadcast.plmn && tai.tac == ta.tac);
            if !configured_ta {
                continue;
            }
            let served = config.slices_for(&broadcast.plmn);
            let slices: Vec<Snssai> = broadcast
                .slices
                .iter()
                .filter(|s| served.contains(s))
                .cloned()
                .collect();
            if slices.is_empty() {
                continue;
            }
            match common.iter_mut().find(|p| p.plmn == broadcast.plmn) {
                Some(entry) => {
                    for slice in slices {
                        if !entry.slices.contains(&slice) {
                            entry.slices.push(slice);
                        }
                    }
                }
                None => common.push(PlmnSupport {
                    plmn: broadcast.plmn.clone(),
                    slices,
                }),
            }
        }
    }
    common
}

// ============================================================================
// N2 task
// ============================================================================

pub struct N2Task {
    base: TaskBase,
}

impl N2Task {
    pub fn new(base: TaskBase) -> Self {
        Self { base }
    }

    fn send(&self, assoc: AssocId, stream: u16, msg: NgapMessage) {
        if let Err(e) = self.base.radio.send(assoc, stream, msg) {
            log::error!("NGAP send failed: {}", e);
        }
    }

    /// Serving association of a subscriber: (assoc, stream, RAN id)
    fn route(&self, amf_ue_id: AmfUeId) -> Option<(AssocId, u16, RanUeId)> {
        let ue = self.base.ctx.ngap.ue_by_amf(amf_ue_id)?;
        let ue = arena::read(&ue);
        Some((ue.assoc, ue.stream, ue.ran_ue_id))
    }

    fn error_indication(
        &self,
        assoc: AssocId,
        stream: u16,
        amf_ue_id: Option<AmfUeId>,
        ran_ue_id: Option<RanUeId>,
        cause: NgapCause,
    ) {
        log::warn!(
            "[assoc={}] Error Indication (amf_ue_ngap_id={:?} ran_ue_ngap_id={:?} cause={})",
            assoc,
            amf_ue_id,
            ran_ue_id,
            cause
        );
        self.send(
            assoc,
            stream,
            NgapMessage::ErrorIndication {
                amf_ue_id,
                ran_ue_id,
                cause,
            },
        );
    }

    fn release_command(&self, assoc: AssocId, stream: u16, amf_ue_id: AmfUeId, ran_ue_id: RanUeId, cause: NgapCause) {
        self.send(
            assoc,
            stream,
            NgapMessage::UeContextReleaseCommand {
                ue: UeNgapIds::Pair {
                    amf_ue_id,
                    ran_ue_id,
                },
                cause,
            },
        );
    }

    /// Remove every UE association on a radio node
    ///
    /// Subscribers served through it lose their UE and NAS contexts too.
    /// Returns the number of UE associations removed.
    fn remove_ues_on(&self, assoc: AssocId) -> usize {
        let ctx = &self.base.ctx;
        let ues: Vec<(RanUeId, Option<AmfUeId>)> = ctx
            .ngap
            .ues_on(assoc)
            .iter()
            .map(|ue| {
                let ue = arena::read(ue);
                (ue.ran_ue_id, ue.amf_ue_id)
            })
            .collect();
        for (ran_ue_id, amf_ue_id) in &ues {
            self.remove_ue_association(assoc, *ran_ue_id, *amf_ue_id);
        }
        ues.len()
    }

    fn remove_ue_association(&self, assoc: AssocId, ran_ue_id: RanUeId, amf_ue_id: Option<AmfUeId>) {
        let ctx = &self.base.ctx;
        let serving = amf_ue_id.filter(|amf| {
            self.route(*amf)
                .map(|(a, _, r)| a == assoc && r == ran_ue_id)
                .unwrap_or(false)
        });
        match serving {
            Some(amf_ue_id) => ctx.remove_ue(amf_ue_id),
            None => {
                ctx.ngap.remove_ue(assoc, ran_ue_id);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Association lifecycle
    // ------------------------------------------------------------------------

    fn association_up(&mut self, assoc: AssocId, max_ostreams: u16) {
        log::info!("[assoc={}] gNB association up ({} streams)", assoc, max_ostreams);
        self.base.ctx.ngap.add_gnb(assoc, max_ostreams);
    }

    fn association_down(&mut self, assoc: AssocId) {
        let Some(gnb) = self.base.ctx.ngap.gnb(assoc) else {
            return;
        };
        arena::write(&gnb).fsm.dispatch(GnbEvent::AssociationDown);
        let removed = self.remove_ues_on(assoc);
        self.base.ctx.ngap.remove_gnb(assoc);
        log::info!(
            "[assoc={}] gNB association down ({} UE associations removed)",
            assoc,
            removed
        );
    }

    // ------------------------------------------------------------------------
    // Interface management
    // ------------------------------------------------------------------------

    fn ng_setup(&mut self, assoc: AssocId, req: NgSetupRequest) {
        let ctx = Arc::clone(&self.base.ctx);
        let gnb = match ctx.ngap.gnb(assoc) {
            Some(gnb) => gnb,
            None => ctx.ngap.add_gnb(assoc, DEFAULT_OUTBOUND_STREAMS),
        };
        let state = arena::read(&gnb).fsm.state();
        if matches!(state, GnbState::Resetting | GnbState::Shutdown) {
            log::warn!("[assoc={}] NG Setup ignored in {}", assoc, state.name());
            return;
        }

        let config = ctx.config();
        let common = common_plmn_support(&config, &req.supported_tas);
        if common.is_empty() {
            log::warn!(
                "[assoc={}] NG Setup failure: no common PLMN/TA/slice (gNB {:#x})",
                assoc,
                req.global_gnb_id
            );
            self.send(
                assoc,
                COMMON_STREAM,
                NgapMessage::NgSetupFailure {
                    cause: NgapCause::Misc(misc_cause::UNKNOWN_PLMN_OR_SNPN),
                    time_to_wait: None,
                },
            );
            return;
        }

        {
            let mut gnb = arena::write(&gnb);
            gnb.name = req.ran_node_name.clone();
            gnb.supported_tas = req.supported_tas;
            gnb.paging_drx = req.paging_drx;
            gnb.fsm.dispatch(GnbEvent::NgSetupAccepted);
        }
        ctx.ngap.set_gnb_id(assoc, req.global_gnb_id);
        log::info!(
            "[assoc={}] NG Setup from gNB {:#x} ({})",
            assoc,
            req.global_gnb_id,
            req.ran_node_name.as_deref().unwrap_or("unnamed")
        );
        self.send(
            assoc,
            COMMON_STREAM,
            NgapMessage::NgSetupResponse(NgSetupResponse {
                amf_name: config.amf_name.clone(),
                served_guami: config.guami.clone(),
                relative_capacity: config.relative_capacity,
                plmn_support: common,
            }),
        );
    }

    fn ng_reset(&mut self, assoc: AssocId, cause: NgapCause, reset_type: ResetType) {
        let Some(gnb) = self.base.ctx.ngap.gnb(assoc) else {
            return;
        };
        arena::write(&gnb).fsm.dispatch(GnbEvent::ResetStarted);
        let ue_associations = match reset_type {
            ResetType::All => {
                let removed = self.remove_ues_on(assoc);
                log::info!("[assoc={}] NG Reset all ({}): {} UE associations", assoc, cause, removed);
                Vec::new()
            }
            ResetType::Partial(list) => {
                for item in &list {
                    let found = match (item.ran_ue_id, item.amf_ue_id) {
                        (Some(ran), _) => self.base.ctx.ngap.ue(assoc, ran),
                        (None, Some(amf)) => self
                            .base
                            .ctx
                            .ngap
                            .ue_by_amf(amf)
                            .filter(|ue| arena::read(ue).assoc == assoc),
                        (None, None) => None,
                    };
                    if let Some(ue) = found {
                        let (ran, amf) = {
                            let ue = arena::read(&ue);
                            (ue.ran_ue_id, ue.amf_ue_id)
                        };
                        self.remove_ue_association(assoc, ran, amf);
                    }
                }
                log::info!("[assoc={}] NG Reset partial ({}): {} UE associations", assoc, cause, list.len());
                list
            }
        };
        arena::write(&gnb).fsm.dispatch(GnbEvent::ResetCompleted);
        self.send(
            assoc,
            COMMON_STREAM,
            NgapMessage::NgResetAcknowledge { ue_associations },
        );
    }

    // ------------------------------------------------------------------------
    // NAS transport
    // ------------------------------------------------------------------------

    fn initial_ue_message(&mut self, assoc: AssocId, stream: u16, msg: InitialUeMessage) {
        let ctx = &self.base.ctx;
        let Some(gnb) = ctx.ngap.gnb(assoc) else {
            return;
        };
        if !arena::read(&gnb).fsm.is_ready() {
            self.error_indication(
                assoc,
                stream,
                None,
                Some(msg.ran_ue_id),
                NgapCause::Protocol(protocol_cause::MESSAGE_NOT_COMPATIBLE_WITH_RECEIVER_STATE),
            );
            return;
        }
        let ue = match ctx.ngap.ue(assoc, msg.ran_ue_id) {
            Some(ue) => ue,
            None => {
                let stream = arena::write(&gnb).allocate_stream();
                ctx.ngap
                    .add_ue(UeNgapContext::new(assoc, msg.ran_ue_id, stream), false)
            }
        };
        let amf_ue_id = {
            let mut ue = arena::write(&ue);
            ue.initial_nas = Some(msg.nas_pdu.clone());
            ue.release_action = ReleaseAction::KeepContext;
            ue.amf_ue_id
        };
        log::debug!(
            "[assoc={} ran_ue_ngap_id={}] Initial UE Message ({:?})",
            assoc,
            msg.ran_ue_id,
            msg.rrc_cause
        );
        let _ = self.base.app.send(AppMessage::InitialUeMessage {
            assoc,
            ran_ue_id: msg.ran_ue_id,
            amf_ue_id,
            nas_pdu: msg.nas_pdu,
            tai: msg.tai,
            cgi: msg.cgi,
            rrc_cause: msg.rrc_cause,
            s_tmsi: msg.s_tmsi,
            context_requested: msg.ue_context_requested,
        });
    }

    fn uplink_nas(&mut self, assoc: AssocId, stream: u16, msg: UplinkNasTransport) {
        let bound = self
            .base
            .ctx
            .ngap
            .ue(assoc, msg.ran_ue_id)
            .and_then(|ue| arena::read(&ue).amf_ue_id);
        match bound {
            None => self.error_indication(
                assoc,
                stream,
                Some(msg.amf_ue_id),
                Some(msg.ran_ue_id),
                NgapCause::RadioNetwork(radio_network_cause::UNKNOWN_LOCAL_UE_NGAP_ID),
            ),
            Some(amf_ue_id) if amf_ue_id != msg.amf_ue_id => self.error_indication(
                assoc,
                stream,
                Some(msg.amf_ue_id),
                Some(msg.ran_ue_id),
                NgapCause::RadioNetwork(radio_network_cause::INCONSISTENT_REMOTE_UE_NGAP_ID),
            ),
            Some(amf_ue_id) => {
                let _ = self.base.n1.send(N1Message::UplinkNas {
                    amf_ue_id,
                    ran_ue_id: msg.ran_ue_id,
                    nas_pdu: msg.nas_pdu,
                    tai: msg.tai,
                    cgi: msg.cgi,
                });
            }
        }
    }

    fn downlink_nas(&mut self, amf_ue_id: AmfUeId, nas_pdu: Bytes) {
        match self.route(amf_ue_id) {
            Some((assoc, stream, ran_ue_id)) => self.send(
                assoc,
                stream,
                NgapMessage::DownlinkNasTransport {
                    amf_ue_id,
                    ran_ue_id,
                    nas_pdu,
                },
            ),
            None => log::warn!("[amf_ue_ngap_id={}] no UE association for DL NAS", amf_ue_id),
        }
    }

    // ------------------------------------------------------------------------
    // UE context management
    // ------------------------------------------------------------------------

    fn initial_context_setup(&mut self, setup: ContextSetup) {
        let Some((assoc, stream, ran_ue_id)) = self.route(setup.amf_ue_id) else {
            log::warn!("[amf_ue_ngap_id={}] no UE association for context setup", setup.amf_ue_id);
            return;
        };
        let config = self.base.ctx.config();
        let Some(guami) = config.serving_guami().cloned() else {
            return;
        };
        self.send(
            assoc,
            stream,
            NgapMessage::InitialContextSetupRequest(InitialContextSetupRequest {
                amf_ue_id: setup.amf_ue_id,
                ran_ue_id,
                guami,
                allowed_nssai: setup.allowed_nssai,
                ue_security_capability: setup.ue_security_capability,
                security_key: setup.security_key,
                nas_pdu: setup.nas_pdu,
                pdu_sessions: setup.pdu_sessions,
            }),
        );
    }

    fn pdu_session_setup(
        &mut self,
        amf_ue_id: AmfUeId,
        nas_pdu: Option<Bytes>,
        pdu_sessions: Vec<PduSessionResourceItem>,
    ) {
        match self.route(amf_ue_id) {
            Some((assoc, stream, ran_ue_id)) => self.send(
                assoc,
                stream,
                NgapMessage::PduSessionResourceSetupRequest {
                    amf_ue_id,
                    ran_ue_id,
                    nas_pdu,
                    pdu_sessions,
                },
            ),
            None => log::warn!("[amf_ue_ngap_id={}] no UE association for PDU session setup", amf_ue_id),
        }
    }

    /// Forward the radio side's per-session N2 answers to the SM peer
    async fn sessions_established(&mut self, amf_ue_id: AmfUeId, items: Vec<PduSessionResourceItem>) {
        if items.is_empty() {
            return;
        }
        let Some(ue) = self.base.ctx.ue_contexts.lookup_by_amf_id(amf_ue_id) else {
            return;
        };
        let requests: Vec<SbiRequest> = {
            let mut ue = arena::write(&ue);
            items
                .into_iter()
                .filter_map(|item| {
                    let session = ue.pdu_session_mut(item.id)?;
                    session.up_active = true;
                    let mut update = SmContextUpdate::new(session.sm_context_ref.as_deref()?);
                    update.up_cnx_state = Some(UpCnxState::Activated);
                    update.n2_sm = Some(item.transfer);
                    Some(SbiRequest::UpdateSmContext(update))
                })
                .collect()
        };
        let bound = self.base.ctx.config().timers.peer_response();
        for reply in sbi::request_all(&self.base, requests, bound).await {
            if let Err(e) = reply {
                log::warn!("[amf_ue_ngap_id={}] SM context update: {}", amf_ue_id, e);
            }
        }
    }

    fn release_ue(&mut self, amf_ue_id: AmfUeId, cause: NgapCause, action: ReleaseAction) {
        let Some(ue) = self.base.ctx.ngap.ue_by_amf(amf_ue_id) else {
            if action == ReleaseAction::RemoveContext {
                self.base.ctx.remove_ue(amf_ue_id);
            }
            return;
        };
        let (assoc, stream, ran_ue_id) = {
            let mut ue = arena::write(&ue);
            ue.release_action = action;
            (ue.assoc, ue.stream, ue.ran_ue_id)
        };
        log::info!(
            "[amf_ue_ngap_id={}] UE Context Release Command ({}, {:?})",
            amf_ue_id,
            cause,
            action
        );
        self.release_command(assoc, stream, amf_ue_id, ran_ue_id, cause);
    }

    fn release_request(&mut self, assoc: AssocId, stream: u16, amf_ue_id: AmfUeId, ran_ue_id: RanUeId, cause: NgapCause) {
        let Some(ue) = self.base.ctx.ngap.ue(assoc, ran_ue_id) else {
            self.error_indication(
                assoc,
                stream,
                Some(amf_ue_id),
                Some(ran_ue_id),
                NgapCause::RadioNetwork(radio_network_cause::UNKNOWN_LOCAL_UE_NGAP_ID),
            );
            return;
        };
        let stream = {
            let mut ue = arena::write(&ue);
            ue.release_action = ReleaseAction::KeepContext;
            ue.stream
        };
        log::info!("[amf_ue_ngap_id={}] UE Context Release Request ({})", amf_ue_id, cause);
        self.release_command(assoc, stream, amf_ue_id, ran_ue_id, cause);
    }

    fn release_complete(&mut self, assoc: AssocId, amf_ue_id: AmfUeId, ran_ue_id: RanUeId) {
        let ctx = Arc::clone(&self.base.ctx);
        let serving = self
            .route(amf_ue_id)
            .map(|(a, _, r)| a == assoc && r == ran_ue_id)
            .unwrap_or(false);
        let Some(ue) = ctx.ngap.remove_ue(assoc, ran_ue_id) else {
            log::warn!("[assoc={} ran_ue_ngap_id={}] release complete for unknown UE", assoc, ran_ue_id);
            return;
        };
        let action = arena::read(&ue).release_action;
        log::info!(
            "[amf_ue_ngap_id={}] UE Context Release Complete ({:?})",
            amf_ue_id,
            action
        );
        match action {
            ReleaseAction::KeepContext if serving => {
                let _ = self.base.n1.send(N1Message::ConnectionLost { amf_ue_id });
            }
            ReleaseAction::RemoveContext => ctx.remove_ue(amf_ue_id),
            _ => {}
        }
    }

    // ------------------------------------------------------------------------
    // Paging and reroute
    // ------------------------------------------------------------------------

    fn page(&mut self, amf_ue_id: AmfUeId) {
        let ctx = Arc::clone(&self.base.ctx);
        let expired = ctx
            .nas_contexts
            .lookup_by_amf_id(amf_ue_id)
            .map(|nas| arena::read(&nas).mobile_reachable_expired)
            .unwrap_or(true);
        if expired {
            log::info!("[amf_ue_ngap_id={}] paging suppressed: not reachable", amf_ue_id);
            return;
        }
        let Some(ue) = ctx.ue_contexts.lookup_by_amf_id(amf_ue_id) else {
            return;
        };
        let (tmsi, tai) = {
            let ue = arena::read(&ue);
            (ue.tmsi, ue.tai.clone())
        };
        let config = ctx.config();
        let (Some(tmsi), Some(tai), Some(guami)) = (tmsi, tai, config.serving_guami()) else {
            log::warn!("[amf_ue_ngap_id={}] paging without 5G-S-TMSI or TAI", amf_ue_id);
            return;
        };
        let s_tmsi = Guti::new(guami, tmsi).s_tmsi();

        let mut paged = 0;
        for gnb in ctx.ngap.gnbs() {
            let target = {
                let gnb = arena::read(&gnb);
                (gnb.fsm.is_ready() && gnb.serves_tai(&tai)).then_some((gnb.assoc, gnb.paging_drx))
            };
            if let Some((assoc, paging_drx)) = target {
                self.send(
                    assoc,
                    COMMON_STREAM,
                    NgapMessage::Paging {
                        s_tmsi,
                        tai_list: vec![tai.clone()],
                        paging_drx: Some(paging_drx),
                    },
                );
                paged += 1;
            }
        }
        log::info!("[amf_ue_ngap_id={}] paging sent to {} gNB(s) for {}", amf_ue_id, paged, tai);
    }

    fn reroute(&mut self, amf_ue_id: AmfUeId, amf_set_id: u16, allowed_nssai: Vec<Snssai>) {
        let Some(ue) = self.base.ctx.ngap.ue_by_amf(amf_ue_id) else {
            return;
        };
        let (assoc, stream, ran_ue_id, nas_pdu) = {
            let ue = arena::read(&ue);
            (ue.assoc, ue.stream, ue.ran_ue_id, ue.initial_nas.clone())
        };
        let Some(nas_pdu) = nas_pdu else {
            log::warn!("[amf_ue_ngap_id={}] no initial NAS message to reroute", amf_ue_id);
            return;
        };
        log::info!("[amf_ue_ngap_id={}] Reroute NAS Request to AMF set {}", amf_ue_id, amf_set_id);
        self.send(
            assoc,
            stream,
            NgapMessage::RerouteNasRequest(RerouteNasRequest {
                ran_ue_id,
                amf_ue_id: Some(amf_ue_id),
                nas_pdu,
                amf_set_id,
                allowed_nssai,
            }),
        );
        self.base.ctx.remove_ue(amf_ue_id);
    }

    // ------------------------------------------------------------------------
    // Handover
    // ------------------------------------------------------------------------

    fn preparation_failure(&self, assoc: AssocId, stream: u16, amf_ue_id: AmfUeId, ran_ue_id: RanUeId, cause: NgapCause) {
        log::warn!("[amf_ue_ngap_id={}] Handover Preparation Failure ({})", amf_ue_id, cause);
        self.send(
            assoc,
            stream,
            NgapMessage::HandoverPreparationFailure {
                amf_ue_id,
                ran_ue_id,
                cause,
            },
        );
    }

    /// Update every listed session's SM context; failed sessions are dropped
    async fn update_sessions(
        &self,
        amf_ue_id: AmfUeId,
        sessions: Vec<(PduSessionId, Option<Bytes>)>,
        ho_state: HoState,
    ) -> Vec<(PduSessionId, Option<Bytes>)> {
        let ctx = &self.base.ctx;
        let Some(ue) = ctx.ue_contexts.lookup_by_amf_id(amf_ue_id) else {
            return Vec::new();
        };
        let (ids, requests): (Vec<PduSessionId>, Vec<SbiRequest>) = {
            let ue = arena::read(&ue);
            sessions
                .into_iter()
                .filter_map(|(id, n2)| {
                    let session = ue.pdu_session(id)?;
                    let mut update = SmContextUpdate::new(session.sm_context_ref.as_deref()?);
                    update.ho_state = Some(ho_state);
                    update.n2_sm = n2;
                    Some((id, SbiRequest::UpdateSmContext(update)))
                })
                .unzip()
        };
        let bound = ctx.config().timers.handover_wait();
        let replies = sbi::request_all(&self.base, requests, bound).await;
        ids.into_iter()
            .zip(replies)
            .filter_map(|(id, reply)| match reply {
                Ok(SbiResponse::SmContextUpdated(updated)) => Some((id, updated.n2_sm)),
                Ok(_) => None,
                Err(e) => {
                    log::warn!(
                        "[amf_ue_ngap_id={}] PDU session {} handover update ({:?}): {}",
                        amf_ue_id,
                        id,
                        ho_state,
                        e
                    );
                    None
                }
            })
            .collect()
    }

    async fn handover_required(&mut self, assoc: AssocId, stream: u16, msg: HandoverRequired) {
        let ctx = Arc::clone(&self.base.ctx);
        let source = ctx
            .ngap
            .ue(assoc, msg.ran_ue_id)
            .filter(|ue| arena::read(ue).amf_ue_id == Some(msg.amf_ue_id));
        let Some(source) = source else {
            self.error_indication(
                assoc,
                stream,
                Some(msg.amf_ue_id),
                Some(msg.ran_ue_id),
                NgapCause::RadioNetwork(radio_network_cause::UNKNOWN_LOCAL_UE_NGAP_ID),
            );
            return;
        };
        let stream = arena::read(&source).stream;
        let fail = |cause: u8| {
            self.preparation_failure(
                assoc,
                stream,
                msg.amf_ue_id,
                msg.ran_ue_id,
                NgapCause::RadioNetwork(cause),
            )
        };

        if msg.handover_type != HandoverType::IntraFiveGs {
            fail(radio_network_cause::HO_TARGET_NOT_ALLOWED);
            return;
        }
        let target = ctx
            .ngap
            .gnb_by_id(msg.target_gnb_id)
            .filter(|gnb| arena::read(gnb).fsm.is_ready());
        let Some(target) = target else {
            fail(radio_network_cause::UNKNOWN_TARGET_ID);
            return;
        };
        let (target_assoc, target_stream) = {
            let mut gnb = arena::write(&target);
            (gnb.assoc, gnb.allocate_stream())
        };

        // Next-hop key for the target; committed on its acknowledge
        let security = ctx.nas_contexts.lookup_by_amf_id(msg.amf_ue_id).and_then(|nas| {
            let nas = arena::read(&nas);
            let sec = nas.security.as_ref().filter(|sec| sec.is_full_native())?;
            let (ncc, nh) = sec.pending_next_hop();
            Some((
                ncc,
                nh,
                nas.ue_security_capability.unwrap_or_default(),
                nas.allowed_nssai.clone(),
            ))
        });
        let Some((ncc, nh, capability, allowed_nssai)) = security else {
            fail(radio_network_cause::UNSPECIFIED);
            return;
        };

        let requested: Vec<(PduSessionId, Option<Bytes>)> = msg
            .pdu_sessions
            .iter()
            .map(|item| (item.id, Some(item.transfer.clone())))
            .collect();
        let prepared = self
            .update_sessions(msg.amf_ue_id, requested.clone(), HoState::Preparing)
            .await;
        if prepared.is_empty() && !requested.is_empty() {
            fail(radio_network_cause::HO_FAILURE_IN_TARGET_5GC_NGRAN_NODE_OR_TARGET_SYSTEM);
            return;
        }
        let snssais: Vec<(PduSessionId, Snssai)> = ctx
            .ue_contexts
            .lookup_by_amf_id(msg.amf_ue_id)
            .map(|ue| {
                arena::read(&ue)
                    .pdu_sessions
                    .values()
                    .map(|s| (s.id, s.snssai))
                    .collect()
            })
            .unwrap_or_default();
        let pdu_sessions = prepared
            .into_iter()
            .filter_map(|(id, n2)| {
                Some(PduSessionResourceItem {
                    id,
                    snssai: snssais.iter().find(|(i, _)| *i == id).map(|(_, s)| *s),
                    transfer: n2?,
                })
            })
            .collect();

        {
            let mut source = arena::write(&source);
            source.target = Some((target_assoc, None));
            source.ho_target_tai = Some(msg.target_tai.clone());
            source.fsm.dispatch(UeNgapEvent::HandoverStarted);
        }
        let Some(guami) = ctx.config().serving_guami().cloned() else {
            return;
        };
        log::info!(
            "[amf_ue_ngap_id={}] Handover Request to gNB {:#x} (NCC={})",
            msg.amf_ue_id,
            msg.target_gnb_id,
            ncc
        );
        self.send(
            target_assoc,
            target_stream,
            NgapMessage::HandoverRequest(HandoverRequest {
                amf_ue_id: msg.amf_ue_id,
                handover_type: msg.handover_type,
                cause: msg.cause,
                guami,
                ue_security_capability: capability,
                ncc,
                nh,
                allowed_nssai,
                pdu_sessions,
                source_to_target: msg.source_to_target,
            }),
        );
    }

    async fn handover_request_ack(&mut self, assoc: AssocId, stream: u16, msg: HandoverRequestAcknowledge) {
        let ctx = Arc::clone(&self.base.ctx);
        let source = ctx
            .ngap
            .ue_by_amf(msg.amf_ue_id)
            .filter(|ue| matches!(arena::read(ue).target, Some((a, None)) if a == assoc));
        let Some(source) = source else {
            self.error_indication(
                assoc,
                stream,
                Some(msg.amf_ue_id),
                Some(msg.ran_ue_id),
                NgapCause::RadioNetwork(radio_network_cause::UNKNOWN_LOCAL_UE_NGAP_ID),
            );
            return;
        };
        let (source_assoc, source_stream, source_ran) = {
            let mut ue = arena::write(&source);
            ue.target = Some((assoc, Some(msg.ran_ue_id)));
            ue.ho_admitted = msg.admitted.clone();
            (ue.assoc, ue.stream, ue.ran_ue_id)
        };
        if let Some(nas) = ctx.nas_contexts.lookup_by_amf_id(msg.amf_ue_id) {
            if let Some(sec) = arena::write(&nas).security.as_mut() {
                let (ncc, _) = sec.next_hop();
                log::debug!("[amf_ue_ngap_id={}] NCC advanced to {}", msg.amf_ue_id, ncc);
            }
        }
        let mut target = UeNgapContext::new(assoc, msg.ran_ue_id, stream);
        target.amf_ue_id = Some(msg.amf_ue_id);
        target.source = Some((source_assoc, source_ran));
        target.release_action = ReleaseAction::DropAssociation;
        ctx.ngap.add_ue(target, false);

        let admitted = msg
            .admitted
            .iter()
            .map(|item| (item.id, Some(item.transfer.clone())))
            .collect();
        let prepared = self
            .update_sessions(msg.amf_ue_id, admitted, HoState::Prepared)
            .await;
        if let Some(ue) = ctx.ue_contexts.lookup_by_amf_id(msg.amf_ue_id) {
            let mut ue = arena::write(&ue);
            for (id, _) in &prepared {
                if let Some(session) = ue.pdu_session_mut(*id) {
                    session.ho_accepted = true;
                }
            }
        }
        let mut released = msg.failed.clone();
        released.extend(
            msg.admitted
                .iter()
                .map(|item| item.id)
                .filter(|id| !prepared.iter().any(|(p, _)| p == id)),
        );
        let pdu_sessions = prepared
            .into_iter()
            .filter_map(|(id, n2)| Some(PduSessionResourceItem::new(id, n2?)))
            .collect();

        log::info!("[amf_ue_ngap_id={}] Handover Command", msg.amf_ue_id);
        self.send(
            source_assoc,
            source_stream,
            NgapMessage::HandoverCommand(HandoverCommand {
                amf_ue_id: msg.amf_ue_id,
                ran_ue_id: source_ran,
                handover_type: HandoverType::IntraFiveGs,
                pdu_sessions,
                released,
                target_to_source: msg.target_to_source,
            }),
        );
    }

    fn handover_failure(&mut self, amf_ue_id: AmfUeId, cause: NgapCause) {
        let Some(source) = self.base.ctx.ngap.ue_by_amf(amf_ue_id) else {
            return;
        };
        let (assoc, stream, ran_ue_id) = {
            let mut ue = arena::write(&source);
            ue.target = None;
            ue.ho_target_tai = None;
            ue.ho_admitted.clear();
            ue.fsm.dispatch(UeNgapEvent::HandoverAborted);
            (ue.assoc, ue.stream, ue.ran_ue_id)
        };
        self.preparation_failure(assoc, stream, amf_ue_id, ran_ue_id, cause);
    }

    async fn handover_notify(&mut self, assoc: AssocId, msg: NgapMessage) {
        let NgapMessage::HandoverNotify {
            amf_ue_id,
            ran_ue_id,
            tai,
            cgi,
        } = msg
        else {
            return;
        };
        let ctx = Arc::clone(&self.base.ctx);
        let source_key = ctx
            .ngap
            .ue(assoc, ran_ue_id)
            .filter(|ue| arena::read(ue).amf_ue_id == Some(amf_ue_id))
            .and_then(|ue| arena::read(&ue).source);
        let Some((source_assoc, source_ran)) = source_key else {
            log::warn!("[amf_ue_ngap_id={}] Handover Notify without handover", amf_ue_id);
            return;
        };

        let accepted: Vec<(PduSessionId, Option<Bytes>)> = ctx
            .ue_contexts
            .lookup_by_amf_id(amf_ue_id)
            .map(|ue| {
                arena::read(&ue)
                    .pdu_sessions
                    .values()
                    .filter(|s| s.ho_accepted)
                    .map(|s| (s.id, None))
                    .collect()
            })
            .unwrap_or_default();
        self.update_sessions(amf_ue_id, accepted, HoState::Completed).await;

        // Target becomes serving
        ctx.ngap.promote(assoc, ran_ue_id);
        if let Some(target) = ctx.ngap.ue(assoc, ran_ue_id) {
            let mut target = arena::write(&target);
            target.source = None;
            target.release_action = ReleaseAction::KeepContext;
        }
        ctx.ue_contexts.update_ran_id(amf_ue_id, ran_ue_id, assoc);
        let supi = ctx.ue_contexts.lookup_by_amf_id(amf_ue_id).and_then(|ue| {
            let mut ue = arena::write(&ue);
            for session in ue.pdu_sessions.values_mut() {
                session.ho_accepted = false;
            }
            if tai.is_some() {
                ue.tai = tai.clone();
            }
            if cgi.is_some() {
                ue.cgi = cgi.clone();
            }
            ue.supi.clone()
        });
        if let Some(nas) = ctx.nas_contexts.lookup_by_amf_id(amf_ue_id) {
            arena::write(&nas).ran_ue_id = ran_ue_id;
        }
        if let Some(tai) = tai {
            ctx.publish(supi.as_ref(), EventPayload::Location { tai, cgi });
        }

        if let Some(source) = ctx.ngap.ue(source_assoc, source_ran) {
            let stream = {
                let mut ue = arena::write(&source);
                ue.release_action = ReleaseAction::DropAssociation;
                ue.target = None;
                ue.fsm.dispatch(UeNgapEvent::HandoverCompleted);
                ue.stream
            };
            self.release_command(
                source_assoc,
                stream,
                amf_ue_id,
                source_ran,
                NgapCause::RadioNetwork(radio_network_cause::SUCCESSFUL_HANDOVER),
            );
        }
        log::info!(
            "[amf_ue_ngap_id={}] handover complete: assoc {} -> {}",
            amf_ue_id,
            source_assoc,
            assoc
        );
    }

    async fn handover_cancel(&mut self, assoc: AssocId, stream: u16, amf_ue_id: AmfUeId, ran_ue_id: RanUeId, cause: NgapCause) {
        let ctx = Arc::clone(&self.base.ctx);
        let Some(source) = ctx.ngap.ue(assoc, ran_ue_id) else {
            self.error_indication(
                assoc,
                stream,
                Some(amf_ue_id),
                Some(ran_ue_id),
                NgapCause::RadioNetwork(radio_network_cause::UNKNOWN_LOCAL_UE_NGAP_ID),
            );
            return;
        };
        let (target, stream) = {
            let mut ue = arena::write(&source);
            let target = ue.target.take();
            ue.ho_target_tai = None;
            ue.ho_admitted.clear();
            ue.fsm.dispatch(UeNgapEvent::HandoverAborted);
            (target, ue.stream)
        };
        log::info!("[amf_ue_ngap_id={}] Handover Cancel ({})", amf_ue_id, cause);

        if let Some((target_assoc, Some(target_ran))) = target {
            if let Some(target) = ctx.ngap.ue(target_assoc, target_ran) {
                let target_stream = {
                    let mut ue = arena::write(&target);
                    ue.release_action = ReleaseAction::DropAssociation;
                    ue.stream
                };
                self.release_command(
                    target_assoc,
                    target_stream,
                    amf_ue_id,
                    target_ran,
                    NgapCause::RadioNetwork(radio_network_cause::HANDOVER_CANCELLED),
                );
            }
        }
        let accepted: Vec<(PduSessionId, Option<Bytes>)> = ctx
            .ue_contexts
            .lookup_by_amf_id(amf_ue_id)
            .map(|ue| {
                let mut ue = arena::write(&ue);
                ue.pdu_sessions
                    .values_mut()
                    .filter(|s| s.ho_accepted)
                    .map(|s| {
                        s.ho_accepted = false;
                        (s.id, None)
                    })
                    .collect()
            })
            .unwrap_or_default();
        self.update_sessions(amf_ue_id, accepted, HoState::Cancelled).await;
        self.send(
            assoc,
            stream,
            NgapMessage::HandoverCancelAcknowledge {
                amf_ue_id,
                ran_ue_id,
            },
        );
    }

    fn ran_status_transfer(&mut self, assoc: AssocId, amf_ue_id: AmfUeId, ran_ue_id: RanUeId, container: Bytes) {
        let target = self
            .base
            .ctx
            .ngap
            .ue(assoc, ran_ue_id)
            .and_then(|ue| arena::read(&ue).target);
        let Some((target_assoc, Some(target_ran))) = target else {
            log::warn!("[amf_ue_ngap_id={}] RAN status transfer without handover target", amf_ue_id);
            return;
        };
        let Some(target) = self.base.ctx.ngap.ue(target_assoc, target_ran) else {
            return;
        };
        let stream = arena::read(&target).stream;
        self.send(
            target_assoc,
            stream,
            NgapMessage::DownlinkRanStatusTransfer {
                amf_ue_id,
                ran_ue_id: target_ran,
                container,
            },
        );
    }

    // ------------------------------------------------------------------------
    // Inbound dispatch
    // ------------------------------------------------------------------------

    async fn pdu(&mut self, assoc: AssocId, stream: u16, msg: NgapMessage) {
        log::debug!("[assoc={}] {} received on stream {}", assoc, msg.name(), stream);
        if self.base.ctx.ngap.gnb(assoc).is_none() {
            log::warn!("[assoc={}] {} on unknown association", assoc, msg.name());
            return;
        }
        match msg {
            NgapMessage::NgSetupRequest(req) => self.ng_setup(assoc, req),
            NgapMessage::NgReset { cause, reset_type } => self.ng_reset(assoc, cause, reset_type),
            NgapMessage::InitialUeMessage(m) => self.initial_ue_message(assoc, stream, m),
            NgapMessage::UplinkNasTransport(m) => self.uplink_nas(assoc, stream, m),
            NgapMessage::InitialContextSetupResponse {
                amf_ue_id,
                pdu_sessions,
                ..
            } => {
                log::info!("[amf_ue_ngap_id={}] Initial Context Setup Response", amf_ue_id);
                self.sessions_established(amf_ue_id, pdu_sessions).await;
            }
            NgapMessage::InitialContextSetupFailure {
                amf_ue_id,
                ran_ue_id,
                cause,
            } => {
                log::warn!("[amf_ue_ngap_id={}] Initial Context Setup Failure ({})", amf_ue_id, cause);
                self.release_request(assoc, stream, amf_ue_id, ran_ue_id, cause);
            }
            NgapMessage::UeContextReleaseRequest {
                amf_ue_id,
                ran_ue_id,
                cause,
                ..
            } => self.release_request(assoc, stream, amf_ue_id, ran_ue_id, cause),
            NgapMessage::UeContextReleaseComplete {
                amf_ue_id,
                ran_ue_id,
                ..
            } => self.release_complete(assoc, amf_ue_id, ran_ue_id),
            NgapMessage::PduSessionResourceSetupResponse {
                amf_ue_id,
                pdu_sessions,
                failed,
                ..
            } => {
                for item in &failed {
                    log::warn!("[amf_ue_ngap_id={}] PDU session {} setup failed", amf_ue_id, item.id);
                }
                self.sessions_established(amf_ue_id, pdu_sessions).await;
            }
            NgapMessage::HandoverRequired(m) => self.handover_required(assoc, stream, m).await,
            NgapMessage::HandoverRequestAcknowledge(m) => {
                self.handover_request_ack(assoc, stream, m).await
            }
            NgapMessage::HandoverFailure { amf_ue_id, cause } => {
                self.handover_failure(amf_ue_id, cause)
            }
            notify @ NgapMessage::HandoverNotify { .. } => self.handover_notify(assoc, notify).await,
            NgapMessage::HandoverCancel {
                amf_ue_id,
                ran_ue_id,
                cause,
            } => {
                self.handover_cancel(assoc, stream, amf_ue_id, ran_ue_id, cause)
                    .await
            }
            NgapMessage::UplinkRanStatusTransfer {
                amf_ue_id,
                ran_ue_id,
                container,
            } => self.ran_status_transfer(assoc, amf_ue_id, ran_ue_id, container),
            NgapMessage::PduSessionResourceModifyResponse { amf_ue_id, .. }
            | NgapMessage::PduSessionResourceReleaseResponse { amf_ue_id, .. } => {
                log::debug!("[amf_ue_ngap_id={}] PDU session resource response", amf_ue_id)
            }
            NgapMessage::ErrorIndication {
                amf_ue_id,
                ran_ue_id,
                cause,
            } => log::warn!(
                "[assoc={}] Error Indication from gNB (amf_ue_ngap_id={:?} ran_ue_ngap_id={:?} cause={})",
                assoc,
                amf_ue_id,
                ran_ue_id,
                cause
            ),
            other => {
                log::warn!("[assoc={}] unexpected {}", assoc, other.name());
                self.error_indication(
                    assoc,
                    stream,
                    None,
                    None,
                    NgapCause::Protocol(protocol_cause::MESSAGE_NOT_COMPATIBLE_WITH_RECEIVER_STATE),
                );
            }
        }
    }
}

#[async_trait]
impl Task for N2Task {
    type Message = N2Message;

    fn id(&self) -> TaskId {
        TaskId::N2
    }

    async fn handle(&mut self, msg: N2Message) {
        match msg {
            N2Message::AssociationUp {
                assoc,
                max_ostreams,
            } => self.association_up(assoc, max_ostreams),
            N2Message::AssociationDown { assoc } => self.association_down(assoc),
            N2Message::Pdu { assoc, stream, msg } => self.pdu(assoc, stream, msg).await,
            N2Message::DownlinkNas { amf_ue_id, nas_pdu } => self.downlink_nas(amf_ue_id, nas_pdu),
            N2Message::InitialContextSetup(setup) => self.initial_context_setup(*setup),
            N2Message::PduSessionSetup {
                amf_ue_id,
                nas_pdu,
                pdu_sessions,
            } => self.pdu_session_setup(amf_ue_id, nas_pdu, pdu_sessions),
            N2Message::ReleaseUe {
                amf_ue_id,
                cause,
                action,
            } => self.release_ue(amf_ue_id, cause, action),
            N2Message::Page { amf_ue_id } => self.page(amf_ue_id),
            N2Message::Reroute {
                amf_ue_id,
                amf_set_id,
                allowed_nssai,
            } => self.reroute(amf_ue_id, amf_set_id, allowed_nssai),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Plmn, Tai};

    fn config() -> AmfConfig {
        let mut config = AmfConfig::default();
        let plmn = Plmn::new("001", "01");
        config.tai = vec![Tai {
            plmn: plmn.clone(),
            tac: 1,
        }];
        config.plmn_support = vec![PlmnSupport {
            plmn,
            slices: vec![Snssai::new(1, None), Snssai::new(2, Some(0x10))],
        }];
        config
    }

    fn ta(tac: u32, mcc: &str, slices: Vec<Snssai>) -> SupportedTa {
        SupportedTa {
            tac,
            broadcast_plmns: vec![PlmnSupport {
                plmn: Plmn::new(mcc, "01"),
                slices,
            }],
        }
    }

    #[test]
    fn test_common_plmn_support_intersects_slices() {
        let config = config();
        let common = common_plmn_support(
            &config,
            &[ta(1, "001", vec![Snssai::new(1, None), Snssai::new(3, None)])],
        );
        assert_eq!(common.len(), 1);
        assert_eq!(common[0].slices, vec![Snssai::new(1, None)]);
    }

    #[test]
    fn test_common_plmn_support_empty_when_nothing_shared() {
        let config = config();
        // Unknown TAC
        assert!(common_plmn_support(&config, &[ta(7, "001", vec![Snssai::new(1, None)])]).is_empty());
        // Unknown PLMN
        assert!(common_plmn_support(&config, &[ta(1, "999", vec![Snssai::new(1, None)])]).is_empty());
        // No common slice
        assert!(common_plmn_support(&config, &[ta(1, "001", vec![Snssai::new(9, None)])]).is_empty());
    }

    #[test]
    fn test_common_plmn_support_merges_tas() {
        let mut config = config();
        let plmn = Plmn::new("001", "01");
        config.tai.push(Tai { plmn, tac: 2 });
        let common = common_plmn_support(
            &config,
            &[
                ta(1, "001", vec![Snssai::new(1, None)]),
                ta(2, "001", vec![Snssai::new(2, Some(0x10)), Snssai::new(1, None)]),
            ],
        );
        assert_eq!(common.len(), 1);
        assert_eq!(
            common[0].slices,
            vec![Snssai::new(1, None), Snssai::new(2, Some(0x10))]
        );
    }
}

//! Application task
//!
//! Entry point for new signalling connections (AMF-UE-NGAP-ID assignment and
//! UE context creation), configuration access, event exposure subscriptions
//! and N1/N2 message transfer requests from session peers.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::arena;
use crate::config::{AmfConfig, ConfigError};
use crate::context::TaskBase;
use crate::event::{EventKind, UeEvent};
use crate::gmm::{Establishment, N1Message, N1N2TransferResult};
use crate::runtime::{Task, TaskId};
use crate::sbi::{self, NfProfile, SbiRequest};
use crate::types::{AmfUeId, AssocId, NrCgi, RanUeId, RrcEstablishmentCause, STmsi, SubscriptionId, Supi, Tai};
use crate::ue_context::{PduSessionId, UeContext};

/// Services this AMF registers with the NF repository
pub const AMF_SERVICES: [&str; 2] = ["namf-comm", "namf-evts"];

#[derive(Debug)]
pub enum AppMessage {
    InitialUeMessage {
        assoc: AssocId,
        ran_ue_id: RanUeId,
        /// Set when the RAN association already carries an AMF id
        amf_ue_id: Option<AmfUeId>,
        nas_pdu: Bytes,
        tai: Tai,
        cgi: NrCgi,
        rrc_cause: RrcEstablishmentCause,
        s_tmsi: Option<STmsi>,
        context_requested: bool,
    },
    ReadConfiguration {
        reply: oneshot::Sender<AmfConfig>,
    },
    UpdateConfiguration {
        config: Box<AmfConfig>,
        reply: oneshot::Sender<Result<(), ConfigError>>,
    },
    Subscribe {
        kind: EventKind,
        supi: Option<Supi>,
        reply: oneshot::Sender<SubscriptionId>,
    },
    Unsubscribe {
        id: SubscriptionId,
        reply: oneshot::Sender<bool>,
    },
    N1N2MessageTransfer {
        supi: Supi,
        pdu_session_id: PduSessionId,
        n1_sm: Option<Bytes>,
        n2_sm: Option<Bytes>,
        reply: oneshot::Sender<N1N2TransferResult>,
    },
    RegisterNf,
}

// ============================================================================
// Notification sink
// ============================================================================

/// Receiver of events for external subscribers
pub trait NotificationSink: Send + Sync {
    fn notify(&self, id: SubscriptionId, event: &UeEvent);
}

/// Sink that only logs the notification
#[derive(Debug, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, id: SubscriptionId, event: &UeEvent) {
        log::info!(
            "[subscription {}] {} for {}: {:?}",
            id,
            event.payload.kind().name(),
            event.supi,
            event.payload
        );
    }
}

// ============================================================================
// App task
// ============================================================================

pub struct AppTask {
    base: TaskBase,
    sink: Arc<dyn NotificationSink>,
    forwarders: HashMap<SubscriptionId, JoinHandle<()>>,
}

impl AppTask {
    pub fn new(base: TaskBase, sink: Arc<dyn NotificationSink>) -> Self {
        Self {
            base,
            sink,
            forwarders: HashMap::new(),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn initial_ue_message(
        &mut self,
        assoc: AssocId,
        ran_ue_id: RanUeId,
        amf_ue_id: Option<AmfUeId>,
        nas_pdu: Bytes,
        tai: Tai,
        cgi: NrCgi,
        rrc_cause: RrcEstablishmentCause,
        s_tmsi: Option<STmsi>,
        context_requested: bool,
    ) {
        let ctx = &self.base.ctx;
        let existing = amf_ue_id.and_then(|id| ctx.ue_contexts.lookup_by_amf_id(id));
        let amf_ue_id = match existing {
            Some(ue) => {
                let mut ue = arena::write(&ue);
                ue.tai = Some(tai.clone());
                ue.cgi = Some(cgi.clone());
                ue.rrc_cause = rrc_cause;
                ue.context_requested = context_requested;
                ue.amf_ue_id
            }
            None => {
                let amf_ue_id = ctx.ids.next_amf_ue_id();
                let mut ue = UeContext::new(ran_ue_id, amf_ue_id, assoc);
                ue.tai = Some(tai.clone());
                ue.cgi = Some(cgi.clone());
                ue.rrc_cause = rrc_cause;
                ue.context_requested = context_requested;
                ctx.ue_contexts.insert(ue);
                amf_ue_id
            }
        };
        ctx.ngap.bind_amf(assoc, ran_ue_id, amf_ue_id);
        log::info!(
            "[amf_ue_ngap_id={}] signalling connection (assoc={} ran_ue_ngap_id={} tai={})",
            amf_ue_id,
            assoc,
            ran_ue_id,
            tai
        );
        let _ = self.base.n1.send(N1Message::Establish(Box::new(Establishment {
            amf_ue_id,
            ran_ue_id,
            assoc,
            nas_pdu,
            tai,
            cgi: Some(cgi),
            s_tmsi,
        })));
    }

    fn subscribe(&mut self, kind: EventKind, supi: Option<Supi>) -> SubscriptionId {
        let (id, mut rx) = self.base.ctx.events.subscribe(&self.base.ctx.ids, kind, supi);
        let sink = Arc::clone(&self.sink);
        let forwarder = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                sink.notify(id, &event);
            }
        });
        self.forwarders.insert(id, forwarder);
        id
    }

    fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        if let Some(forwarder) = self.forwarders.remove(&id) {
            forwarder.abort();
        }
        self.base.ctx.events.unsubscribe(id)
    }

    async fn register_nf(&mut self) {
        let config = self.base.ctx.config();
        let profile = NfProfile {
            nf_instance_name: config.amf_name.clone(),
            services: AMF_SERVICES.iter().map(|s| s.to_string()).collect(),
        };
        match sbi::request(
            &self.base,
            SbiRequest::NfRegister(profile),
            config.timers.peer_response(),
        )
        .await
        {
            Ok(_) => log::info!("NF registered as {}", config.amf_name),
            Err(e) => log::error!("NF registration failed: {}", e),
        }
    }
}

#[async_trait]
impl Task for AppTask {
    type Message = AppMessage;

    fn id(&self) -> TaskId {
        TaskId::App
    }

    async fn handle(&mut self, msg: AppMessage) {
        match msg {
            AppMessage::InitialUeMessage {
                assoc,
                ran_ue_id,
                amf_ue_id,
                nas_pdu,
                tai,
                cgi,
                rrc_cause,
                s_tmsi,
                context_requested,
            } => self.initial_ue_message(
                assoc,
                ran_ue_id,
                amf_ue_id,
                nas_pdu,
                tai,
                cgi,
                rrc_cause,
                s_tmsi,
                context_requested,
            ),
            AppMessage::ReadConfiguration { reply } => {
                let _ = reply.send(self.base.ctx.config());
            }
            AppMessage::UpdateConfiguration { config, reply } => {
                let result = self.base.ctx.update_config(*config);
                if let Err(e) = &result {
                    log::warn!("configuration update refused: {}", e);
                }
                let _ = reply.send(result);
            }
            AppMessage::Subscribe { kind, supi, reply } => {
                let id = self.subscribe(kind, supi);
                let _ = reply.send(id);
            }
            AppMessage::Unsubscribe { id, reply } => {
                let removed = self.unsubscribe(id);
                let _ = reply.send(removed);
            }
            AppMessage::N1N2MessageTransfer {
                supi,
                pdu_session_id,
                n1_sm,
                n2_sm,
                reply,
            } => {
                let forwarded = self.base.n1.send(N1Message::N1N2Transfer {
                    supi,
                    pdu_session_id,
                    n1_sm,
                    n2_sm,
                    reply,
                });
                if let Err(e) = forwarded {
                    log::error!("N1N2 message transfer not forwarded: {}", e);
                }
            }
            AppMessage::RegisterNf => self.register_nf().await,
        }
    }
}

impl Drop for AppTask {
    fn drop(&mut self) {
        for (_, forwarder) in self.forwarders.drain() {
            forwarder.abort();
        }
    }
}

//! AMF context
//!
//! Process-wide state shared by the tasks: configuration, identifier
//! generators, the three context registries, timers, promises and the event
//! bus. One instance per process, passed explicitly to every task inside a
//! [`TaskBase`].

use std::sync::{Arc, RwLock};

use thiserror::Error;
use tokio::sync::mpsc;

use crate::app::AppMessage;
use crate::arena;
use crate::auth::LocalAuthenticator;
use crate::config::{AmfConfig, ConfigError};
use crate::event::{EventBus, EventPayload};
use crate::gmm::N1Message;
use crate::nas_context::NasContextRegistry;
use crate::ngap::N2Message;
use crate::ngap_message::NgapMessage;
use crate::ngap_context::NgapRegistry;
use crate::runtime::{PromiseTable, TaskHandle, TimerService};
use crate::sbi::{N11Message, SbiResponse, SbiResult};
use crate::types::{AmfUeId, AssocId, IdGenerators, Supi};
use crate::ue_context::UeContextRegistry;

// ============================================================================
// AmfContext
// ============================================================================

pub struct AmfContext {
    config: RwLock<AmfConfig>,
    local_auth: RwLock<Arc<LocalAuthenticator>>,
    pub ids: IdGenerators,
    pub ue_contexts: UeContextRegistry,
    pub nas_contexts: NasContextRegistry,
    pub ngap: NgapRegistry,
    pub timers: TimerService,
    pub promises: PromiseTable<SbiResult<SbiResponse>>,
    pub events: EventBus,
}

impl std::fmt::Debug for AmfContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmfContext")
            .field("ue_contexts", &self.ue_contexts)
            .field("nas_contexts", &self.nas_contexts.len())
            .field("ngap", &self.ngap)
            .finish_non_exhaustive()
    }
}

impl AmfContext {
    pub fn new(config: AmfConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let local_auth = LocalAuthenticator::from_config(&config)?;
        Ok(Self {
            config: RwLock::new(config),
            local_auth: RwLock::new(Arc::new(local_auth)),
            ids: IdGenerators::new(),
            ue_contexts: UeContextRegistry::new(),
            nas_contexts: NasContextRegistry::new(),
            ngap: NgapRegistry::new(),
            timers: TimerService::new(),
            promises: PromiseTable::new(),
            events: EventBus::new(),
        })
    }

    /// Snapshot of the running configuration
    pub fn config(&self) -> AmfConfig {
        arena::read(&self.config).clone()
    }

    /// Replace the running configuration
    ///
    /// Refused while radio nodes are attached: served GUAMI, TAI and slices
    /// were already advertised to them in NG Setup.
    pub fn update_config(&self, config: AmfConfig) -> Result<(), ConfigError> {
        let attached = self.ngap.gnb_count();
        if attached > 0 {
            return Err(ConfigError::RadioNodesAttached(attached));
        }
        config.validate()?;
        let local_auth = LocalAuthenticator::from_config(&config)?;
        *arena::write(&self.local_auth) = Arc::new(local_auth);
        *arena::write(&self.config) = config;
        log::info!("AMF configuration updated");
        Ok(())
    }

    pub fn local_auth(&self) -> Arc<LocalAuthenticator> {
        Arc::clone(&arena::read(&self.local_auth))
    }

    pub fn publish(&self, supi: Option<&Supi>, payload: EventPayload) {
        if let Some(supi) = supi {
            self.events.publish(supi, payload);
        }
    }

    /// Drop every context of a subscriber
    ///
    /// Removes the UE and NAS contexts (cancelling the NAS timers) and the
    /// serving UE NGAP association.
    pub fn remove_ue(&self, amf_ue_id: AmfUeId) {
        if let Some(nas) = self.nas_contexts.remove(amf_ue_id) {
            let mut nas = arena::write(&nas);
            for timer in [
                nas.mobile_reachable_timer.take(),
                nas.implicit_dereg_timer.take(),
            ]
            .into_iter()
            .flatten()
            {
                self.timers.cancel(timer);
            }
        }
        self.ue_contexts.remove(amf_ue_id);
        if let Some(ue) = self.ngap.ue_by_amf(amf_ue_id) {
            let (assoc, ran_ue_id) = {
                let ue = arena::read(&ue);
                (ue.assoc, ue.ran_ue_id)
            };
            self.ngap.remove_ue(assoc, ran_ue_id);
        }
        log::info!("[amf_ue_ngap_id={}] contexts removed", amf_ue_id);
    }
}

// ============================================================================
// Radio transport
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("association {0} closed")]
    Closed(AssocId),
}

/// One outbound NGAP PDU
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundPdu {
    pub assoc: AssocId,
    pub stream: u16,
    pub msg: NgapMessage,
}

/// Outbound side of the SCTP associations
pub trait RadioTransport: Send + Sync {
    fn send(&self, assoc: AssocId, stream: u16, msg: NgapMessage) -> Result<(), TransportError>;
}

/// Transport handing PDUs to an SCTP writer over a channel
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<OutboundPdu>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<OutboundPdu>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl RadioTransport for ChannelTransport {
    fn send(&self, assoc: AssocId, stream: u16, msg: NgapMessage) -> Result<(), TransportError> {
        log::debug!("[assoc={}] {} sent on stream {}", assoc, msg.name(), stream);
        self.tx
            .send(OutboundPdu { assoc, stream, msg })
            .map_err(|_| TransportError::Closed(assoc))
    }
}

// ============================================================================
// Task base
// ============================================================================

/// What every task holds: the shared context and the other tasks' queues
#[derive(Clone)]
pub struct TaskBase {
    pub ctx: Arc<AmfContext>,
    pub app: TaskHandle<AppMessage>,
    pub n1: TaskHandle<N1Message>,
    pub n2: TaskHandle<N2Message>,
    pub n11: TaskHandle<N11Message>,
    pub radio: Arc<dyn RadioTransport>,
}

impl std::fmt::Debug for TaskBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskBase").field("ctx", &self.ctx).finish()
    }
}

//! 5GMM state machine
//!
//! `DEREGISTERED -> COMMON-PROCEDURE-INITIATED -> REGISTERED -> DEREGISTERED`
//!
//! The NAS procedure engine drives one [`GmmFsm`] per subscriber. Handlers
//! report procedure milestones as [`GmmEvent`]s; the FSM decides whether the
//! milestone is a transition, is absorbed in the current state, or does not
//! apply and must be ignored (in which case the caller treats the triggering
//! message as a protocol violation).

use crate::types::AmfUeId;

/// 5GMM states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum GmmState {
    /// Not registered; terminal for a session instance
    #[default]
    Deregistered,
    /// Identification, authentication or security mode control running
    CommonProcedureInitiated,
    /// Registration accepted
    Registered,
}

impl GmmState {
    pub fn name(&self) -> &'static str {
        match self {
            GmmState::Deregistered => "5GMM-DEREGISTERED",
            GmmState::CommonProcedureInitiated => "5GMM-COMMON-PROCEDURE-INITIATED",
            GmmState::Registered => "5GMM-REGISTERED",
        }
    }
}

/// Connection management state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CmState {
    #[default]
    Idle,
    Connected,
}

impl CmState {
    pub fn name(&self) -> &'static str {
        match self {
            CmState::Idle => "CM-IDLE",
            CmState::Connected => "CM-CONNECTED",
        }
    }
}

/// Procedure milestones fed to the FSM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GmmEvent {
    /// Registration Request received
    RegistrationRequest,
    /// Authentication restarted after synch failure or ngKSI collision
    AuthenticationRestart,
    /// Registration Accept sent
    RegistrationAccepted,
    /// Registration Complete received
    RegistrationComplete,
    /// Registration, authentication or security mode rejected
    RegistrationRejected,
    /// Service Request received
    ServiceRequest,
    /// UE-initiated de-registration
    DeregistrationRequest,
    /// Implicit de-registration timer expired
    ImplicitDeregistration,
}

impl GmmEvent {
    pub fn name(&self) -> &'static str {
        match self {
            GmmEvent::RegistrationRequest => "REGISTRATION_REQUEST",
            GmmEvent::AuthenticationRestart => "AUTHENTICATION_RESTART",
            GmmEvent::RegistrationAccepted => "REGISTRATION_ACCEPTED",
            GmmEvent::RegistrationComplete => "REGISTRATION_COMPLETE",
            GmmEvent::RegistrationRejected => "REGISTRATION_REJECTED",
            GmmEvent::ServiceRequest => "SERVICE_REQUEST",
            GmmEvent::DeregistrationRequest => "DEREGISTRATION_REQUEST",
            GmmEvent::ImplicitDeregistration => "IMPLICIT_DEREGISTRATION",
        }
    }
}

/// Result of dispatching an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GmmFsmResult {
    /// State changed
    Transition(GmmState),
    /// Event absorbed in the current state
    Handled,
    /// Event does not apply to the current state
    Ignored,
}

/// Per-subscriber 5GMM state machine
#[derive(Debug, Clone)]
pub struct GmmFsm {
    state: GmmState,
    amf_ue_id: AmfUeId,
}

impl GmmFsm {
    pub fn new(amf_ue_id: AmfUeId) -> Self {
        Self {
            state: GmmState::Deregistered,
            amf_ue_id,
        }
    }

    pub fn state(&self) -> GmmState {
        self.state
    }

    pub fn is_registered(&self) -> bool {
        self.state == GmmState::Registered
    }

    /// Re-key after the context moved to another AMF-UE-NGAP-ID
    pub fn set_amf_ue_id(&mut self, amf_ue_id: AmfUeId) {
        self.amf_ue_id = amf_ue_id;
    }

    /// Dispatch an event to the FSM
    pub fn dispatch(&mut self, event: GmmEvent) -> GmmFsmResult {
        let result = match self.state {
            GmmState::Deregistered => self.handle_deregistered(event),
            GmmState::CommonProcedureInitiated => self.handle_common_procedure(event),
            GmmState::Registered => self.handle_registered(event),
        };

        match result {
            GmmFsmResult::Transition(new_state) => {
                log::debug!(
                    "GMM state transition: {} -> {} on {} (amf_ue_id={})",
                    self.state.name(),
                    new_state.name(),
                    event.name(),
                    self.amf_ue_id
                );
                self.state = new_state;
            }
            GmmFsmResult::Ignored => {
                log::warn!(
                    "{} ignored in {} (amf_ue_id={})",
                    event.name(),
                    self.state.name(),
                    self.amf_ue_id
                );
            }
            GmmFsmResult::Handled => {}
        }
        result
    }

    fn handle_deregistered(&self, event: GmmEvent) -> GmmFsmResult {
        match event {
            GmmEvent::RegistrationRequest => {
                GmmFsmResult::Transition(GmmState::CommonProcedureInitiated)
            }
            GmmEvent::DeregistrationRequest
            | GmmEvent::ImplicitDeregistration
            | GmmEvent::RegistrationRejected => GmmFsmResult::Handled,
            _ => GmmFsmResult::Ignored,
        }
    }

    fn handle_common_procedure(&self, event: GmmEvent) -> GmmFsmResult {
        match event {
            GmmEvent::RegistrationRequest | GmmEvent::AuthenticationRestart => {
                GmmFsmResult::Handled
            }
            GmmEvent::RegistrationAccepted => GmmFsmResult::Transition(GmmState::Registered),
            GmmEvent::RegistrationRejected
            | GmmEvent::DeregistrationRequest
            | GmmEvent::ImplicitDeregistration => {
                GmmFsmResult::Transition(GmmState::Deregistered)
            }
            GmmEvent::RegistrationComplete | GmmEvent::ServiceRequest => GmmFsmResult::Ignored,
        }
    }

    fn handle_registered(&self, event: GmmEvent) -> GmmFsmResult {
        match event {
            // Mobility and periodic updates re-run the common procedures
            GmmEvent::RegistrationRequest => {
                GmmFsmResult::Transition(GmmState::CommonProcedureInitiated)
            }
            GmmEvent::RegistrationAccepted
            | GmmEvent::RegistrationComplete
            | GmmEvent::ServiceRequest => GmmFsmResult::Handled,
            GmmEvent::RegistrationRejected
            | GmmEvent::DeregistrationRequest
            | GmmEvent::ImplicitDeregistration => {
                GmmFsmResult::Transition(GmmState::Deregistered)
            }
            GmmEvent::AuthenticationRestart => GmmFsmResult::Ignored,
        }
    }
}

//! NGAP state machines
//!
//! Per radio node: `READY <-> RESETTING -> SHUTDOWN`, entered from the state
//! an SCTP association is in before NG Setup completes.
//! Per UE association: `CONNECTED <-> HANDOVER`.

use crate::types::{AssocId, RanUeId};

// ============================================================================
// Radio node
// ============================================================================

/// NG interface state of one radio node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum GnbState {
    /// Association up, NG Setup not yet accepted
    #[default]
    AwaitingSetup,
    /// NG Setup complete
    Ready,
    /// NG Reset in progress
    Resetting,
    /// Association removed
    Shutdown,
}

impl GnbState {
    pub fn name(&self) -> &'static str {
        match self {
            GnbState::AwaitingSetup => "NGAP_STATE_AWAITING_SETUP",
            GnbState::Ready => "NGAP_STATE_READY",
            GnbState::Resetting => "NGAP_STATE_RESETTING",
            GnbState::Shutdown => "NGAP_STATE_SHUTDOWN",
        }
    }
}

/// Radio node events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GnbEvent {
    NgSetupAccepted,
    ResetStarted,
    ResetCompleted,
    AssociationDown,
}

/// Result of dispatching an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NgapFsmResult<S> {
    Transition(S),
    Handled,
    Ignored,
}

/// NG interface state machine of one radio node
#[derive(Debug, Clone)]
pub struct GnbFsm {
    state: GnbState,
    assoc: AssocId,
}

impl GnbFsm {
    pub fn new(assoc: AssocId) -> Self {
        Self {
            state: GnbState::AwaitingSetup,
            assoc,
        }
    }

    pub fn state(&self) -> GnbState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == GnbState::Ready
    }

    pub fn dispatch(&mut self, event: GnbEvent) -> NgapFsmResult<GnbState> {
        use GnbEvent::*;
        use GnbState::*;

        let result = match (self.state, event) {
            (Shutdown, _) => NgapFsmResult::Ignored,
            (_, AssociationDown) => NgapFsmResult::Transition(Shutdown),
            (AwaitingSetup, NgSetupAccepted) => NgapFsmResult::Transition(Ready),
            (Ready, NgSetupAccepted) => NgapFsmResult::Handled,
            (Ready, ResetStarted) => NgapFsmResult::Transition(Resetting),
            (Resetting, ResetCompleted) => NgapFsmResult::Transition(Ready),
            _ => NgapFsmResult::Ignored,
        };

        if let NgapFsmResult::Transition(new_state) = result {
            log::debug!(
                "NGAP state transition: {} -> {} (assoc={})",
                self.state.name(),
                new_state.name(),
                self.assoc
            );
            self.state = new_state;
        }
        result
    }
}

// ============================================================================
// UE association
// ============================================================================

/// NGAP state of one UE association
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum UeNgapState {
    #[default]
    Connected,
    Handover,
}

impl UeNgapState {
    pub fn name(&self) -> &'static str {
        match self {
            UeNgapState::Connected => "NGAP_UE_CONNECTED",
            UeNgapState::Handover => "NGAP_UE_HANDOVER",
        }
    }
}

/// UE association events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UeNgapEvent {
    /// Handover Request sent to the target
    HandoverStarted,
    /// Handover Notify received from the target
    HandoverCompleted,
    /// Handover cancelled or failed
    HandoverAborted,
}

#[derive(Debug, Clone)]
pub struct UeNgapFsm {
    state: UeNgapState,
    ran_ue_id: RanUeId,
}

impl UeNgapFsm {
    pub fn new(ran_ue_id: RanUeId) -> Self {
        Self {
            state: UeNgapState::Connected,
            ran_ue_id,
        }
    }

    pub fn state(&self) -> UeNgapState {
        self.state
    }

    pub fn dispatch(&mut self, event: UeNgapEvent) -> NgapFsmResult<UeNgapState> {
        use UeNgapEvent::*;
        use UeNgapState::*;

        let result = match (self.state, event) {
            (Connected, HandoverStarted) => NgapFsmResult::Transition(Handover),
            (Handover, HandoverCompleted) | (Handover, HandoverAborted) => {
                NgapFsmResult::Transition(Connected)
            }
            (Connected, HandoverAborted) => NgapFsmResult::Handled,
            _ => NgapFsmResult::Ignored,
        };

        if let NgapFsmResult::Transition(new_state) = result {
            log::debug!(
                "NGAP UE state transition: {} -> {} (ran_ue_id={})",
                self.state.name(),
                new_state.name(),
                self.ran_ue_id
            );
            self.state = new_state;
        }
        result
    }
}

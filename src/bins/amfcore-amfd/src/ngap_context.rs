//! NGAP contexts
//!
//! Radio nodes are keyed by SCTP association (and global gNB id once NG Setup
//! names it). UE associations are keyed by (association, RAN-UE-NGAP-ID) and
//! by AMF-UE-NGAP-ID. During handover a subscriber has two UE associations;
//! only the serving one is reachable by AMF id until the target is promoted.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::arena;
use crate::ngap_message::{PduSessionResourceItem, SupportedTa};
use crate::ngap_sm::{GnbFsm, UeNgapFsm};
use crate::types::{AmfUeId, AssocId, PlmnSupport, RanUeId, Tai};

/// Outbound SCTP streams negotiated per association
pub const DEFAULT_OUTBOUND_STREAMS: u16 = 2;

// ============================================================================
// Radio node
// ============================================================================

#[derive(Debug, Clone)]
pub struct GnbContext {
    pub assoc: AssocId,
    pub gnb_id: Option<u32>,
    pub name: Option<String>,
    pub fsm: GnbFsm,
    pub supported_tas: Vec<SupportedTa>,
    pub paging_drx: u8,
    max_ostreams: u16,
    next_ostream: u16,
}

impl GnbContext {
    pub fn new(assoc: AssocId, max_ostreams: u16) -> Self {
        Self {
            assoc,
            gnb_id: None,
            name: None,
            fsm: GnbFsm::new(assoc),
            supported_tas: Vec::new(),
            paging_drx: 0,
            max_ostreams: max_ostreams.max(1),
            next_ostream: 0,
        }
    }

    /// Round-robin stream for a new UE association; stream 0 is reserved
    /// for non-UE signalling
    pub fn allocate_stream(&mut self) -> u16 {
        if self.max_ostreams <= 1 {
            return 0;
        }
        self.next_ostream += 1;
        if self.next_ostream >= self.max_ostreams {
            self.next_ostream = 1;
        }
        self.next_ostream
    }

    pub fn serves_tai(&self, tai: &Tai) -> bool {
        self.supported_tas.iter().any(|ta| {
            ta.tac == tai.tac
                && ta
                    .broadcast_plmns
                    .iter()
                    .any(|support: &PlmnSupport| support.plmn == tai.plmn)
        })
    }
}

pub type SharedGnbContext = Arc<RwLock<GnbContext>>;

// ============================================================================
// UE association
// ============================================================================

/// What to do once the radio confirms a UE context release
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReleaseAction {
    /// Connection lost or inactive: keep the subscriber, move to CM-IDLE
    #[default]
    KeepContext,
    /// De-registered: drop every context of the subscriber
    RemoveContext,
    /// Drop only this association (handover source, cancelled target or a
    /// connection superseded by a newer one)
    DropAssociation,
}

#[derive(Debug, Clone)]
pub struct UeNgapContext {
    pub ran_ue_id: RanUeId,
    pub amf_ue_id: Option<AmfUeId>,
    pub assoc: AssocId,
    pub stream: u16,
    pub fsm: UeNgapFsm,
    pub release_action: ReleaseAction,
    /// Handover target while this association is the source
    pub target: Option<(AssocId, Option<RanUeId>)>,
    /// Source association while this association is the target
    pub source: Option<(AssocId, RanUeId)>,
    /// Sessions admitted by the handover target
    pub ho_admitted: Vec<PduSessionResourceItem>,
    /// Target gNB id and TAI named in Handover Required
    pub ho_target_tai: Option<Tai>,
    /// Initial UE Message NAS PDU, kept for a NAS reroute
    pub initial_nas: Option<bytes::Bytes>,
}

impl UeNgapContext {
    pub fn new(assoc: AssocId, ran_ue_id: RanUeId, stream: u16) -> Self {
        Self {
            ran_ue_id,
            amf_ue_id: None,
            assoc,
            stream,
            fsm: UeNgapFsm::new(ran_ue_id),
            release_action: ReleaseAction::default(),
            target: None,
            source: None,
            ho_admitted: Vec::new(),
            ho_target_tai: None,
            initial_nas: None,
        }
    }
}

pub type SharedUeNgapContext = Arc<RwLock<UeNgapContext>>;

// ============================================================================
// Registry
// ============================================================================

#[derive(Default)]
struct GnbTables {
    by_assoc: HashMap<AssocId, SharedGnbContext>,
    by_gnb_id: HashMap<u32, AssocId>,
}

#[derive(Default)]
struct UeTables {
    by_ran: HashMap<(AssocId, RanUeId), SharedUeNgapContext>,
    /// Serving association of each subscriber
    by_amf: HashMap<AmfUeId, (AssocId, RanUeId)>,
}

/// Radio node and UE association registry
#[derive(Default)]
pub struct NgapRegistry {
    gnbs: RwLock<GnbTables>,
    ues: RwLock<UeTables>,
}

impl std::fmt::Debug for NgapRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NgapRegistry")
            .field("gnbs", &self.gnb_count())
            .field("ues", &self.ue_count())
            .finish()
    }
}

impl NgapRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // ------------------------------------------------------------------------
    // Radio nodes
    // ------------------------------------------------------------------------

    /// Context for an association, created before NG Setup if needed
    pub fn add_gnb(&self, assoc: AssocId, max_ostreams: u16) -> SharedGnbContext {
        let mut tables = arena::write(&self.gnbs);
        Arc::clone(
            tables
                .by_assoc
                .entry(assoc)
                .or_insert_with(|| Arc::new(RwLock::new(GnbContext::new(assoc, max_ostreams)))),
        )
    }

    pub fn gnb(&self, assoc: AssocId) -> Option<SharedGnbContext> {
        arena::read(&self.gnbs).by_assoc.get(&assoc).cloned()
    }

    pub fn gnb_by_id(&self, gnb_id: u32) -> Option<SharedGnbContext> {
        let tables = arena::read(&self.gnbs);
        let assoc = tables.by_gnb_id.get(&gnb_id)?;
        tables.by_assoc.get(assoc).cloned()
    }

    /// Record the global gNB id learned from NG Setup
    pub fn set_gnb_id(&self, assoc: AssocId, gnb_id: u32) -> bool {
        let mut tables = arena::write(&self.gnbs);
        let Some(gnb) = tables.by_assoc.get(&assoc).cloned() else {
            return false;
        };
        let previous = arena::write(&gnb).gnb_id.replace(gnb_id);
        if let Some(previous) = previous {
            if tables.by_gnb_id.get(&previous) == Some(&assoc) {
                tables.by_gnb_id.remove(&previous);
            }
        }
        tables.by_gnb_id.insert(gnb_id, assoc);
        true
    }

    pub fn remove_gnb(&self, assoc: AssocId) -> Option<SharedGnbContext> {
        let mut tables = arena::write(&self.gnbs);
        let gnb = tables.by_assoc.remove(&assoc)?;
        if let Some(gnb_id) = arena::read(&gnb).gnb_id {
            if tables.by_gnb_id.get(&gnb_id) == Some(&assoc) {
                tables.by_gnb_id.remove(&gnb_id);
            }
        }
        Some(gnb)
    }

    pub fn gnbs(&self) -> Vec<SharedGnbContext> {
        arena::read(&self.gnbs).by_assoc.values().cloned().collect()
    }

    pub fn gnb_count(&self) -> usize {
        arena::read(&self.gnbs).by_assoc.len()
    }

    // ------------------------------------------------------------------------
    // UE associations
    // ------------------------------------------------------------------------

    /// Register a UE association; a serving association with an AMF id is
    /// also indexed by that id
    pub fn add_ue(&self, ctx: UeNgapContext, serving: bool) -> SharedUeNgapContext {
        let mut tables = arena::write(&self.ues);
        let key = (ctx.assoc, ctx.ran_ue_id);
        let amf_ue_id = ctx.amf_ue_id;
        let shared = Arc::new(RwLock::new(ctx));
        if let Some(old) = tables.by_ran.insert(key, Arc::clone(&shared)) {
            if let Some(old_amf) = arena::read(&old).amf_ue_id {
                if tables.by_amf.get(&old_amf) == Some(&key) {
                    tables.by_amf.remove(&old_amf);
                }
            }
        }
        if serving {
            if let Some(amf_ue_id) = amf_ue_id {
                tables.by_amf.insert(amf_ue_id, key);
            }
        }
        shared
    }

    pub fn ue(&self, assoc: AssocId, ran_ue_id: RanUeId) -> Option<SharedUeNgapContext> {
        arena::read(&self.ues).by_ran.get(&(assoc, ran_ue_id)).cloned()
    }

    pub fn ue_by_amf(&self, amf_ue_id: AmfUeId) -> Option<SharedUeNgapContext> {
        let tables = arena::read(&self.ues);
        let key = tables.by_amf.get(&amf_ue_id)?;
        tables.by_ran.get(key).cloned()
    }

    /// Bind the AMF id assigned to an association and make it serving
    pub fn bind_amf(&self, assoc: AssocId, ran_ue_id: RanUeId, amf_ue_id: AmfUeId) -> bool {
        self.promote_with(assoc, ran_ue_id, Some(amf_ue_id))
    }

    /// Make an association the serving one for its AMF id (handover completion)
    pub fn promote(&self, assoc: AssocId, ran_ue_id: RanUeId) -> bool {
        self.promote_with(assoc, ran_ue_id, None)
    }

    fn promote_with(&self, assoc: AssocId, ran_ue_id: RanUeId, bind: Option<AmfUeId>) -> bool {
        let mut tables = arena::write(&self.ues);
        let key = (assoc, ran_ue_id);
        let Some(shared) = tables.by_ran.get(&key).cloned() else {
            return false;
        };
        let mut ctx = arena::write(&shared);
        if let Some(amf_ue_id) = bind {
            if let Some(previous) = ctx.amf_ue_id.replace(amf_ue_id) {
                if previous != amf_ue_id && tables.by_amf.get(&previous) == Some(&key) {
                    tables.by_amf.remove(&previous);
                }
            }
        }
        match ctx.amf_ue_id {
            Some(amf_ue_id) => {
                tables.by_amf.insert(amf_ue_id, key);
                true
            }
            None => false,
        }
    }

    pub fn remove_ue(&self, assoc: AssocId, ran_ue_id: RanUeId) -> Option<SharedUeNgapContext> {
        let mut tables = arena::write(&self.ues);
        let key = (assoc, ran_ue_id);
        let shared = tables.by_ran.remove(&key)?;
        if let Some(amf_ue_id) = arena::read(&shared).amf_ue_id {
            if tables.by_amf.get(&amf_ue_id) == Some(&key) {
                tables.by_amf.remove(&amf_ue_id);
            }
        }
        log::debug!(
            "UE NGAP context removed (assoc={} ran_ue_ngap_id={})",
            assoc,
            ran_ue_id
        );
        Some(shared)
    }

    /// Every UE association on a radio node
    pub fn ues_on(&self, assoc: AssocId) -> Vec<SharedUeNgapContext> {
        arena::read(&self.ues)
            .by_ran
            .iter()
            .filter(|((a, _), _)| *a == assoc)
            .map(|(_, ctx)| Arc::clone(ctx))
            .collect()
    }

    pub fn ue_count(&self) -> usize {
        arena::read(&self.ues).by_ran.len()
    }
}

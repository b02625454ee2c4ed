//! NAS context registry
//!
//! One [`NasContext`] per subscriber, reachable by AMF-UE-NGAP-ID, by 5G-GUTI
//! and by SUPI. Same locking discipline as the UE context registry: the
//! index tables are taken before any payload.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::arena::{self, Arena, Handle};
use crate::auth::HeAuthVector;
use crate::gmm_sm::{CmState, GmmFsm, GmmState};
use crate::nas_message::{RegistrationRequest, RegistrationType, Suci, UeSecurityCapability};
use crate::nas_security::{fresh_ngksi, NasSecurityContext, NGKSI_RANGE};
use crate::runtime::TimerId;
use crate::types::{AmfUeId, Guti, RanUeId, Snssai, Supi};

/// Vectors kept per subscriber
pub const AUTH_VECTOR_POOL: usize = 5;

/// Per-subscriber NAS protocol state
#[derive(Debug, Clone)]
pub struct NasContext {
    pub amf_ue_id: AmfUeId,
    pub ran_ue_id: RanUeId,
    pub supi: Option<Supi>,
    pub suci: Option<Suci>,
    pub guti: Option<Guti>,
    pub fsm: GmmFsm,
    pub cm_state: CmState,
    pub serving_network_name: String,
    pub registration_type: RegistrationType,
    pub follow_on_request: bool,
    pub requested_nssai: Vec<Snssai>,
    pub allowed_nssai: Vec<Snssai>,
    pub ue_security_capability: Option<UeSecurityCapability>,
    pub pdu_session_status: Option<u16>,
    pub imeisv: Option<String>,

    /// Current security context (ngKSI, keys, counters)
    pub security: Option<NasSecurityContext>,
    /// Vectors received or generated, oldest first
    pub auth_vectors: Vec<HeAuthVector>,
    /// Vector in use by the running authentication
    pub auth_vector_index: usize,
    /// ngKSI offered in the last Authentication Request
    pub pending_ngksi: u8,
    /// SQN re-synchronisation already tried for this authentication
    pub resync_attempted: bool,

    /// Registration parked while the Identity procedure runs
    pub suspended_registration: Option<RegistrationRequest>,
    /// Registration Complete received for the current registration
    pub registration_completed: bool,
    /// Last uplink PDU passed integrity verification
    pub integrity_verified: bool,

    pub mobile_reachable_timer: Option<TimerId>,
    pub implicit_dereg_timer: Option<TimerId>,
    /// Mobile reachable timer fired; paging is suppressed
    pub mobile_reachable_expired: bool,
}

impl NasContext {
    pub fn new(amf_ue_id: AmfUeId, ran_ue_id: RanUeId) -> Self {
        Self {
            amf_ue_id,
            ran_ue_id,
            supi: None,
            suci: None,
            guti: None,
            fsm: GmmFsm::new(amf_ue_id),
            cm_state: CmState::Connected,
            serving_network_name: String::new(),
            registration_type: RegistrationType::Initial,
            follow_on_request: false,
            requested_nssai: Vec::new(),
            allowed_nssai: Vec::new(),
            ue_security_capability: None,
            pdu_session_status: None,
            imeisv: None,
            security: None,
            auth_vectors: Vec::new(),
            auth_vector_index: 0,
            pending_ngksi: 0,
            resync_attempted: false,
            suspended_registration: None,
            registration_completed: false,
            integrity_verified: false,
            mobile_reachable_timer: None,
            implicit_dereg_timer: None,
            mobile_reachable_expired: false,
        }
    }

    pub fn state(&self) -> GmmState {
        self.fsm.state()
    }

    /// Vector used by the running authentication
    pub fn current_vector(&self) -> Option<&HeAuthVector> {
        self.auth_vectors.get(self.auth_vector_index)
    }

    /// Store a new vector and make it current; the oldest is dropped when full
    pub fn push_vector(&mut self, vector: HeAuthVector) {
        if self.auth_vectors.len() >= AUTH_VECTOR_POOL {
            self.auth_vectors.remove(0);
        }
        self.auth_vectors.push(vector);
        self.auth_vector_index = self.auth_vectors.len() - 1;
    }

    pub fn clear_vectors(&mut self) {
        self.auth_vectors.clear();
        self.auth_vector_index = 0;
    }

    /// Whether `ngksi` can name a new security context: in range and not
    /// the one of the current context
    pub fn ngksi_available(&self, ngksi: u8) -> bool {
        ngksi < NGKSI_RANGE
            && self
                .security
                .as_ref()
                .map_or(true, |sec| sec.ngksi != ngksi)
    }

    /// ngKSI for a new authentication
    pub fn unused_ngksi(&self) -> u8 {
        let preferred = fresh_ngksi(self.amf_ue_id.0);
        if self.ngksi_available(preferred) {
            preferred
        } else {
            (preferred + 1) % NGKSI_RANGE
        }
    }

    /// Security context usable for protected signalling
    pub fn has_full_security(&self) -> bool {
        self.security
            .as_ref()
            .map(|sec| sec.is_full_native())
            .unwrap_or(false)
    }

    /// Log tag `[supi]` or `[amf_ue_id]`
    pub fn tag(&self) -> String {
        match &self.supi {
            Some(supi) => supi.to_string(),
            None => format!("amf_ue_ngap_id={}", self.amf_ue_id),
        }
    }
}

/// Shared handle to a registered NAS context
pub type SharedNasContext = Arc<RwLock<NasContext>>;

struct Entry {
    amf_ue_id: AmfUeId,
    guti: Option<Guti>,
    supi: Option<Supi>,
    ctx: SharedNasContext,
}

#[derive(Default)]
struct Tables {
    arena: Arena<Entry>,
    by_amf_id: HashMap<AmfUeId, Handle>,
    by_guti: HashMap<Guti, Handle>,
    by_supi: HashMap<Supi, Handle>,
}

impl Tables {
    fn get(&self, handle: Option<&Handle>) -> Option<SharedNasContext> {
        handle
            .and_then(|h| self.arena.get(*h))
            .map(|entry| Arc::clone(&entry.ctx))
    }

    fn unindex(&mut self, handle: Handle) {
        let Some(entry) = self.arena.get(handle) else {
            return;
        };
        let (amf_ue_id, guti, supi) = (entry.amf_ue_id, entry.guti.clone(), entry.supi.clone());
        if self.by_amf_id.get(&amf_ue_id) == Some(&handle) {
            self.by_amf_id.remove(&amf_ue_id);
        }
        if let Some(guti) = guti {
            if self.by_guti.get(&guti) == Some(&handle) {
                self.by_guti.remove(&guti);
            }
        }
        if let Some(supi) = supi {
            if self.by_supi.get(&supi) == Some(&handle) {
                self.by_supi.remove(&supi);
            }
        }
    }

    fn index(&mut self, handle: Handle) {
        let Some(entry) = self.arena.get(handle) else {
            return;
        };
        let (amf_ue_id, guti, supi) = (entry.amf_ue_id, entry.guti.clone(), entry.supi.clone());
        self.by_amf_id.insert(amf_ue_id, handle);
        if let Some(guti) = guti {
            if let Some(previous) = self.by_guti.insert(guti, handle) {
                if previous != handle {
                    if let Some(old) = self.arena.get_mut(previous) {
                        old.guti = None;
                        arena::write(&old.ctx).guti = None;
                    }
                }
            }
        }
        if let Some(supi) = supi {
            if let Some(previous) = self.by_supi.insert(supi, handle) {
                if previous != handle {
                    if let Some(old) = self.arena.get_mut(previous) {
                        old.supi = None;
                        arena::write(&old.ctx).supi = None;
                    }
                }
            }
        }
    }
}

/// Concurrent multi-key registry of NAS contexts
#[derive(Default)]
pub struct NasContextRegistry {
    tables: RwLock<Tables>,
}

impl std::fmt::Debug for NasContextRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NasContextRegistry")
            .field("len", &self.len())
            .finish()
    }
}

impl NasContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new context, replacing any context under the same AMF id
    pub fn insert(&self, ctx: NasContext) -> SharedNasContext {
        let mut tables = arena::write(&self.tables);
        let entry = Entry {
            amf_ue_id: ctx.amf_ue_id,
            guti: ctx.guti.clone(),
            supi: ctx.supi.clone(),
            ctx: Arc::new(RwLock::new(ctx)),
        };
        let shared = Arc::clone(&entry.ctx);
        let amf_ue_id = entry.amf_ue_id;
        if let Some(previous) = tables.by_amf_id.get(&amf_ue_id).copied() {
            tables.unindex(previous);
            tables.arena.remove(previous);
        }
        let handle = tables.arena.insert(entry);
        tables.index(handle);
        log::debug!("NAS context amf_ue_ngap_id={} registered", amf_ue_id);
        shared
    }

    pub fn lookup_by_amf_id(&self, amf_ue_id: AmfUeId) -> Option<SharedNasContext> {
        let tables = arena::read(&self.tables);
        tables.get(tables.by_amf_id.get(&amf_ue_id))
    }

    pub fn lookup_by_guti(&self, guti: &Guti) -> Option<SharedNasContext> {
        let tables = arena::read(&self.tables);
        tables.get(tables.by_guti.get(guti))
    }

    pub fn lookup_by_supi(&self, supi: &Supi) -> Option<SharedNasContext> {
        let tables = arena::read(&self.tables);
        tables.get(tables.by_supi.get(supi))
    }

    pub fn bind_supi(&self, amf_ue_id: AmfUeId, supi: &Supi) -> bool {
        self.rekey(amf_ue_id, |entry| {
            entry.supi = Some(supi.clone());
            arena::write(&entry.ctx).supi = Some(supi.clone());
        })
    }

    /// Assign a new 5G-GUTI; the previous one stops resolving
    pub fn bind_guti(&self, amf_ue_id: AmfUeId, guti: &Guti) -> bool {
        self.rekey(amf_ue_id, |entry| {
            entry.guti = Some(guti.clone());
            arena::write(&entry.ctx).guti = Some(guti.clone());
        })
    }

    /// Move a context to the AMF id of a new signalling connection
    ///
    /// Whatever context was registered under `new_id` is discarded.
    pub fn rekey_amf(&self, old_id: AmfUeId, new_id: AmfUeId, ran_ue_id: RanUeId) -> bool {
        let mut tables = arena::write(&self.tables);
        let Some(handle) = tables.by_amf_id.get(&old_id).copied() else {
            return false;
        };
        if old_id != new_id {
            if let Some(stale) = tables.by_amf_id.get(&new_id).copied() {
                tables.unindex(stale);
                tables.arena.remove(stale);
            }
        }
        tables.unindex(handle);
        if let Some(entry) = tables.arena.get_mut(handle) {
            entry.amf_ue_id = new_id;
            let mut ctx = arena::write(&entry.ctx);
            ctx.amf_ue_id = new_id;
            ctx.ran_ue_id = ran_ue_id;
            ctx.fsm.set_amf_ue_id(new_id);
        }
        tables.index(handle);
        log::debug!("NAS context amf_ue_ngap_id={} moved to {}", old_id, new_id);
        true
    }

    fn rekey(&self, amf_ue_id: AmfUeId, update: impl FnOnce(&mut Entry)) -> bool {
        let mut tables = arena::write(&self.tables);
        let Some(handle) = tables.by_amf_id.get(&amf_ue_id).copied() else {
            return false;
        };
        tables.unindex(handle);
        if let Some(entry) = tables.arena.get_mut(handle) {
            update(entry);
        }
        tables.index(handle);
        true
    }

    /// Remove a context and all its index entries
    pub fn remove(&self, amf_ue_id: AmfUeId) -> Option<SharedNasContext> {
        let mut tables = arena::write(&self.tables);
        let handle = tables.by_amf_id.get(&amf_ue_id).copied()?;
        tables.unindex(handle);
        let entry = tables.arena.remove(handle)?;
        log::debug!("NAS context amf_ue_ngap_id={} removed", amf_ue_id);
        Some(entry.ctx)
    }

    pub fn len(&self) -> usize {
        arena::read(&self.tables).arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Guami, Plmn};

    fn guti(tmsi: u32) -> Guti {
        let guami = Guami {
            plmn: Plmn::new("001", "01"),
            region_id: 0x80,
            set_id: 4,
            pointer: 1,
        };
        Guti::new(&guami, tmsi)
    }

    #[test]
    fn test_unused_ngksi_skips_current_context() {
        let mut nas = NasContext::new(AmfUeId(1), RanUeId(7));
        assert_eq!(nas.unused_ngksi(), 2);
        assert!(!nas.ngksi_available(NGKSI_RANGE));

        nas.security = Some(NasSecurityContext::new(2, [0; 32]));
        assert!(!nas.ngksi_available(2));
        assert_eq!(nas.unused_ngksi(), 3);

        nas.security = Some(NasSecurityContext::new(3, [0; 32]));
        assert_eq!(nas.unused_ngksi(), 2);
    }

    #[test]
    fn test_lookup_by_every_key() {
        let registry = NasContextRegistry::new();
        let shared = registry.insert(NasContext::new(AmfUeId(1), RanUeId(7)));
        let supi = Supi::from_imsi("001010000000001");
        assert!(registry.bind_supi(AmfUeId(1), &supi));
        assert!(registry.bind_guti(AmfUeId(1), &guti(0x10)));

        assert!(Arc::ptr_eq(&shared, &registry.lookup_by_supi(&supi).unwrap()));
        assert!(Arc::ptr_eq(&shared, &registry.lookup_by_guti(&guti(0x10)).unwrap()));
        assert_eq!(arena::read(&shared).guti, Some(guti(0x10)));
    }

    #[test]
    fn test_new_guti_replaces_old() {
        let registry = NasContextRegistry::new();
        registry.insert(NasContext::new(AmfUeId(1), RanUeId(7)));
        registry.bind_guti(AmfUeId(1), &guti(0x10));
        registry.bind_guti(AmfUeId(1), &guti(0x11));
        assert!(registry.lookup_by_guti(&guti(0x10)).is_none());
        assert!(registry.lookup_by_guti(&guti(0x11)).is_some());
    }

    #[test]
    fn test_rekey_amf_discards_placeholder() {
        let registry = NasContextRegistry::new();
        let old = registry.insert(NasContext::new(AmfUeId(1), RanUeId(7)));
        registry.bind_guti(AmfUeId(1), &guti(0x20));
        registry.insert(NasContext::new(AmfUeId(2), RanUeId(8)));

        assert!(registry.rekey_amf(AmfUeId(1), AmfUeId(2), RanUeId(8)));
        assert_eq!(registry.len(), 1);
        assert!(registry.lookup_by_amf_id(AmfUeId(1)).is_none());
        let moved = registry.lookup_by_amf_id(AmfUeId(2)).unwrap();
        assert!(Arc::ptr_eq(&old, &moved));
        assert!(Arc::ptr_eq(&old, &registry.lookup_by_guti(&guti(0x20)).unwrap()));
        assert_eq!(arena::read(&moved).ran_ue_id, RanUeId(8));
    }

    #[test]
    fn test_remove_clears_indexes() {
        let registry = NasContextRegistry::new();
        registry.insert(NasContext::new(AmfUeId(3), RanUeId(1)));
        let supi = Supi::from_imsi("001010000000003");
        registry.bind_supi(AmfUeId(3), &supi);
        registry.bind_guti(AmfUeId(3), &guti(3));
        assert!(registry.remove(AmfUeId(3)).is_some());
        assert!(registry.lookup_by_supi(&supi).is_none());
        assert!(registry.lookup_by_guti(&guti(3)).is_none());
        assert!(registry.remove(AmfUeId(3)).is_none());
    }

    #[test]
    fn test_vector_pool_is_bounded() {
        let mut ctx = NasContext::new(AmfUeId(1), RanUeId(1));
        for i in 0..(AUTH_VECTOR_POOL as u8 + 2) {
            ctx.push_vector(HeAuthVector {
                rand: [i; 16],
                autn: [0; 16],
                hxres_star: [0; 16],
                xres_star: None,
                kseaf: None,
                confirmation: None,
            });
        }
        assert_eq!(ctx.auth_vectors.len(), AUTH_VECTOR_POOL);
        assert_eq!(ctx.current_vector().unwrap().rand, [AUTH_VECTOR_POOL as u8 + 1; 16]);
    }
}

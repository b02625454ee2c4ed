//! UE context registry
//!
//! One [`UeContext`] per active subscriber, reachable by AMF-UE-NGAP-ID, by
//! the (RAN id, AMF id) context key and, once known, by SUPI. The registry
//! owns the key bookkeeping: key fields of a context are changed only through
//! registry methods so every index moves together.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use bytes::Bytes;

use crate::arena::{self, Arena, Handle};
use crate::types::{
    AmfUeId, AssocId, NrCgi, RanUeId, RrcEstablishmentCause, Snssai, Supi, Tai, UeContextKey,
};

/// PDU session identity (1..15)
pub type PduSessionId = u8;

/// Per-session state brokered by the session management function
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PduSessionContext {
    pub id: PduSessionId,
    pub dnn: String,
    pub snssai: Snssai,
    /// Peer SMF address
    pub smf_addr: Option<String>,
    pub smf_api_version: Option<String>,
    /// SM context location returned by the SMF
    pub sm_context_ref: Option<String>,
    /// Last N2 SM information received for the session
    pub n2_sm: Option<Bytes>,
    /// Admitted by the handover target
    pub ho_accepted: bool,
    /// User plane currently active
    pub up_active: bool,
}

impl PduSessionContext {
    pub fn new(id: PduSessionId, dnn: &str, snssai: Snssai) -> Self {
        Self {
            id,
            dnn: dnn.to_string(),
            snssai,
            smf_addr: None,
            smf_api_version: None,
            sm_context_ref: None,
            n2_sm: None,
            ho_accepted: false,
            up_active: false,
        }
    }
}

/// Per-subscriber radio and session state
#[derive(Debug, Clone)]
pub struct UeContext {
    pub ran_ue_id: RanUeId,
    pub amf_ue_id: AmfUeId,
    pub supi: Option<Supi>,
    /// Serving SCTP association
    pub assoc: AssocId,
    pub tai: Option<Tai>,
    pub cgi: Option<NrCgi>,
    pub rrc_cause: RrcEstablishmentCause,
    /// Radio node asked for a full UE context (Initial Context Setup)
    pub context_requested: bool,
    /// Last assigned 5G-TMSI
    pub tmsi: Option<u32>,
    pub pdu_sessions: BTreeMap<PduSessionId, PduSessionContext>,
}

impl UeContext {
    pub fn new(ran_ue_id: RanUeId, amf_ue_id: AmfUeId, assoc: AssocId) -> Self {
        Self {
            ran_ue_id,
            amf_ue_id,
            supi: None,
            assoc,
            tai: None,
            cgi: None,
            rrc_cause: RrcEstablishmentCause::default(),
            context_requested: false,
            tmsi: None,
            pdu_sessions: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> UeContextKey {
        UeContextKey::new(self.ran_ue_id, self.amf_ue_id)
    }

    pub fn pdu_session(&self, id: PduSessionId) -> Option<&PduSessionContext> {
        self.pdu_sessions.get(&id)
    }

    pub fn pdu_session_mut(&mut self, id: PduSessionId) -> Option<&mut PduSessionContext> {
        self.pdu_sessions.get_mut(&id)
    }

    /// Insert or replace a session
    pub fn set_pdu_session(&mut self, session: PduSessionContext) {
        self.pdu_sessions.insert(session.id, session);
    }

    pub fn remove_pdu_session(&mut self, id: PduSessionId) -> Option<PduSessionContext> {
        self.pdu_sessions.remove(&id)
    }

    pub fn pdu_session_ids(&self) -> Vec<PduSessionId> {
        self.pdu_sessions.keys().copied().collect()
    }
}

/// Shared handle to a registered context
pub type SharedUeContext = Arc<RwLock<UeContext>>;

struct Entry {
    amf_ue_id: AmfUeId,
    key: UeContextKey,
    supi: Option<Supi>,
    ctx: SharedUeContext,
}

#[derive(Default)]
struct Tables {
    arena: Arena<Entry>,
    by_amf_id: HashMap<AmfUeId, Handle>,
    by_key: HashMap<UeContextKey, Handle>,
    by_supi: HashMap<Supi, Handle>,
}

impl Tables {
    fn get(&self, handle: Option<&Handle>) -> Option<SharedUeContext> {
        handle
            .and_then(|h| self.arena.get(*h))
            .map(|entry| Arc::clone(&entry.ctx))
    }

    /// Drop every index entry of a record
    fn unindex(&mut self, handle: Handle) {
        let Some(entry) = self.arena.get(handle) else {
            return;
        };
        let (amf_ue_id, key, supi) = (entry.amf_ue_id, entry.key, entry.supi.clone());
        if self.by_amf_id.get(&amf_ue_id) == Some(&handle) {
            self.by_amf_id.remove(&amf_ue_id);
        }
        if self.by_key.get(&key) == Some(&handle) {
            self.by_key.remove(&key);
        }
        if let Some(supi) = supi {
            if self.by_supi.get(&supi) == Some(&handle) {
                self.by_supi.remove(&supi);
            }
        }
    }

    /// Point every key of a record at it, evicting previous holders
    fn index(&mut self, handle: Handle) {
        let Some(entry) = self.arena.get(handle) else {
            return;
        };
        let (amf_ue_id, key, supi) = (entry.amf_ue_id, entry.key, entry.supi.clone());
        self.by_amf_id.insert(amf_ue_id, handle);
        self.by_key.insert(key, handle);
        if let Some(supi) = supi {
            if let Some(previous) = self.by_supi.insert(supi.clone(), handle) {
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

/// Concurrent multi-key registry of UE contexts
#[derive(Default)]
pub struct UeContextRegistry {
    tables: RwLock<Tables>,
}

impl std::fmt::Debug for UeContextRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UeContextRegistry")
            .field("len", &self.len())
            .finish()
    }
}

impl UeContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert by AMF-UE-NGAP-ID
    ///
    /// An existing record keeps its shared handle; its payload is replaced
    /// and its keys re-indexed.
    pub fn insert(&self, ctx: UeContext) -> SharedUeContext {
        let mut tables = arena::write(&self.tables);
        let amf_ue_id = ctx.amf_ue_id;
        let key = ctx.key();
        let supi = ctx.supi.clone();

        let existing = tables.by_amf_id.get(&amf_ue_id).copied();
        let found = existing.and_then(|h| tables.arena.get(h).map(|e| (h, Arc::clone(&e.ctx))));
        let (handle, shared) = match found {
            Some((handle, shared)) => {
                tables.unindex(handle);
                if let Some(entry) = tables.arena.get_mut(handle) {
                    entry.key = key;
                    entry.supi = supi;
                }
                *arena::write(&shared) = ctx;
                (handle, shared)
            }
            None => {
                let shared = Arc::new(RwLock::new(ctx));
                let handle = tables.arena.insert(Entry {
                    amf_ue_id,
                    key,
                    supi,
                    ctx: Arc::clone(&shared),
                });
                (handle, shared)
            }
        };
        tables.index(handle);
        log::debug!("UE context {} registered", key);
        shared
    }

    pub fn lookup_by_amf_id(&self, amf_ue_id: AmfUeId) -> Option<SharedUeContext> {
        let tables = arena::read(&self.tables);
        tables.get(tables.by_amf_id.get(&amf_ue_id))
    }

    pub fn lookup_by_context_key(&self, key: &UeContextKey) -> Option<SharedUeContext> {
        let tables = arena::read(&self.tables);
        tables.get(tables.by_key.get(key))
    }

    pub fn lookup_by_supi(&self, supi: &Supi) -> Option<SharedUeContext> {
        let tables = arena::read(&self.tables);
        tables.get(tables.by_supi.get(supi))
    }

    /// Associate the SUPI learned during registration
    pub fn bind_supi(&self, amf_ue_id: AmfUeId, supi: &Supi) -> bool {
        self.rekey(amf_ue_id, |entry| {
            entry.supi = Some(supi.clone());
            arena::write(&entry.ctx).supi = Some(supi.clone());
        })
    }

    /// Move the context to a new RAN-UE-NGAP-ID and association (handover)
    pub fn update_ran_id(&self, amf_ue_id: AmfUeId, ran_ue_id: RanUeId, assoc: AssocId) -> bool {
        self.rekey(amf_ue_id, |entry| {
            entry.key = UeContextKey::new(ran_ue_id, amf_ue_id);
            let mut ctx = arena::write(&entry.ctx);
            ctx.ran_ue_id = ran_ue_id;
            ctx.assoc = assoc;
        })
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

    /// Remove a context and all its index entries; its PDU sessions go with it
    pub fn remove(&self, amf_ue_id: AmfUeId) -> Option<SharedUeContext> {
        let mut tables = arena::write(&self.tables);
        let handle = tables.by_amf_id.get(&amf_ue_id).copied()?;
        tables.unindex(handle);
        let entry = tables.arena.remove(handle)?;
        {
            let mut ctx = arena::write(&entry.ctx);
            if !ctx.pdu_sessions.is_empty() {
                log::debug!(
                    "Dropping {} PDU session(s) of {}",
                    ctx.pdu_sessions.len(),
                    entry.key
                );
            }
            ctx.pdu_sessions.clear();
        }
        log::debug!("UE context {} removed", entry.key);
        Some(entry.ctx)
    }

    /// AMF ids of every context served on an association
    pub fn amf_ids_on(&self, assoc: AssocId) -> Vec<AmfUeId> {
        let tables = arena::read(&self.tables);
        tables
            .arena
            .iter()
            .filter(|(_, entry)| arena::read(&entry.ctx).assoc == assoc)
            .map(|(_, entry)| entry.amf_ue_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        arena::read(&self.tables).arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//! Property-based tests for the AMF state machines, codecs and registries

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::{BufMut, BytesMut};
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;

use amfcore_crypt::kdf::{self, NAS_ENC_ALG, NAS_INT_ALG};
use amfcore_crypt::nea::{self, CipheringAlgorithm};
use amfcore_crypt::nia::{self, IntegrityAlgorithm};
use amfcore_crypt::Direction;

use crate::arena::{self, Arena};
use crate::gmm::{bitmap_sessions, session_bitmap};
use crate::gmm_sm::{GmmEvent, GmmFsm, GmmState};
use crate::nas_context::{NasContext, NasContextRegistry};
use crate::nas_message::{NasMessage, SecurityHeaderType, EPD_5GMM};
use crate::nas_security::{
    NasCount, NasSecurityContext, NasSecurityError, NAS_BEARER, NAS_COUNT_MAX,
};
use crate::ngap_sm::{GnbEvent, GnbFsm, GnbState, UeNgapEvent, UeNgapFsm, UeNgapState};
use crate::types::{AmfUeId, AssocId, Guami, Guti, Plmn, RanUeId, Supi, UeContextKey};
use crate::ue_context::{UeContext, UeContextRegistry};

fn arb_gmm_event() -> impl Strategy<Value = GmmEvent> {
    prop_oneof![
        Just(GmmEvent::RegistrationRequest),
        Just(GmmEvent::AuthenticationRestart),
        Just(GmmEvent::RegistrationAccepted),
        Just(GmmEvent::RegistrationComplete),
        Just(GmmEvent::RegistrationRejected),
        Just(GmmEvent::ServiceRequest),
        Just(GmmEvent::DeregistrationRequest),
        Just(GmmEvent::ImplicitDeregistration),
    ]
}

fn arb_gnb_event() -> impl Strategy<Value = GnbEvent> {
    prop_oneof![
        Just(GnbEvent::NgSetupAccepted),
        Just(GnbEvent::ResetStarted),
        Just(GnbEvent::ResetCompleted),
        Just(GnbEvent::AssociationDown),
    ]
}

fn arb_ue_ngap_event() -> impl Strategy<Value = UeNgapEvent> {
    prop_oneof![
        Just(UeNgapEvent::HandoverStarted),
        Just(UeNgapEvent::HandoverCompleted),
        Just(UeNgapEvent::HandoverAborted),
    ]
}

fn arb_cipher() -> impl Strategy<Value = CipheringAlgorithm> {
    prop_oneof![
        Just(CipheringAlgorithm::Nea0),
        Just(CipheringAlgorithm::Nea2),
        Just(CipheringAlgorithm::Nea3),
    ]
}

fn guami(set_id: u16, pointer: u8) -> Guami {
    Guami {
        plmn: Plmn::new("001", "01"),
        region_id: 0x80,
        set_id,
        pointer,
    }
}

/// Uplink PDU as a UE would build it
fn uplink_pdu(
    kamf: &[u8; 32],
    integrity: IntegrityAlgorithm,
    ciphering: CipheringAlgorithm,
    count: u32,
    message: &[u8],
) -> Vec<u8> {
    let knas_int = kdf::algorithm_key(kamf, NAS_INT_ALG, integrity.id());
    let knas_enc = kdf::algorithm_key(kamf, NAS_ENC_ALG, ciphering.id());
    let mut payload = message.to_vec();
    nea::apply(ciphering, &knas_enc, count, NAS_BEARER, Direction::Uplink, &mut payload).unwrap();
    let mut body = vec![(count & 0xff) as u8];
    body.extend_from_slice(&payload);
    let mac = nia::compute_mac(integrity, &knas_int, count, NAS_BEARER, Direction::Uplink, &body)
        .unwrap();

    let mut pdu = BytesMut::new();
    pdu.put_u8(EPD_5GMM);
    pdu.put_u8(SecurityHeaderType::IntegrityProtectedAndCiphered as u8);
    pdu.put_slice(&mac);
    pdu.put_slice(&body);
    pdu.to_vec()
}

fn imsi(n: u8) -> Supi {
    Supi::from_imsi(&format!("00101000000000{}", n))
}

fn registry_guti(n: u32) -> Guti {
    Guti::new(&guami(4, 1), 0x100 + n)
}

#[derive(Debug, Clone)]
enum UeOp {
    Insert { amf: u64, ran: u64 },
    BindSupi { amf: u64, supi: u8 },
    UpdateRan { amf: u64, ran: u64, assoc: u32 },
    Remove { amf: u64 },
}

fn arb_ue_op() -> impl Strategy<Value = UeOp> {
    prop_oneof![
        (1u64..6, 1u64..6).prop_map(|(amf, ran)| UeOp::Insert { amf, ran }),
        (1u64..6, 0u8..4).prop_map(|(amf, supi)| UeOp::BindSupi { amf, supi }),
        (1u64..6, 1u64..6, 1u32..3).prop_map(|(amf, ran, assoc)| UeOp::UpdateRan { amf, ran, assoc }),
        (1u64..6).prop_map(|amf| UeOp::Remove { amf }),
    ]
}

/// Expected registry content: AMF id -> (RAN id, association, SUPI)
type UeModel = BTreeMap<u64, (u64, u32, Option<u8>)>;

fn apply_ue_op(
    registry: &UeContextRegistry,
    model: &mut UeModel,
    op: &UeOp,
) -> Result<(), TestCaseError> {
    match *op {
        UeOp::Insert { amf, ran } => {
            registry.insert(UeContext::new(RanUeId(ran), AmfUeId(amf), AssocId(1)));
            model.insert(amf, (ran, 1, None));
        }
        UeOp::BindSupi { amf, supi } => {
            let known = model.contains_key(&amf);
            prop_assert_eq!(registry.bind_supi(AmfUeId(amf), &imsi(supi)), known);
            if known {
                for entry in model.values_mut() {
                    if entry.2 == Some(supi) {
                        entry.2 = None;
                    }
                }
                if let Some(entry) = model.get_mut(&amf) {
                    entry.2 = Some(supi);
                }
            }
        }
        UeOp::UpdateRan { amf, ran, assoc } => {
            let known = model.contains_key(&amf);
            prop_assert_eq!(registry.update_ran_id(AmfUeId(amf), RanUeId(ran), AssocId(assoc)), known);
            if let Some(entry) = model.get_mut(&amf) {
                entry.0 = ran;
                entry.1 = assoc;
            }
        }
        UeOp::Remove { amf } => {
            let removed = registry.remove(AmfUeId(amf));
            prop_assert_eq!(removed.is_some(), model.remove(&amf).is_some());
            if let Some(removed) = removed {
                let live = registry.lookup_by_amf_id(AmfUeId(amf));
                prop_assert!(!live.is_some_and(|c| Arc::ptr_eq(&c, &removed)));
            }
        }
    }
    Ok(())
}

fn check_ue_registry(registry: &UeContextRegistry, model: &UeModel) -> Result<(), TestCaseError> {
    prop_assert_eq!(registry.len(), model.len());
    for amf in 1u64..6 {
        let found = registry.lookup_by_amf_id(AmfUeId(amf));
        match model.get(&amf) {
            Some(&(ran, assoc, supi)) => {
                let Some(shared) = found else {
                    return Err(TestCaseError::fail(format!("amf id {} not indexed", amf)));
                };
                {
                    let ctx = arena::read(&shared);
                    prop_assert_eq!(ctx.amf_ue_id, AmfUeId(amf));
                    prop_assert_eq!(ctx.ran_ue_id, RanUeId(ran));
                    prop_assert_eq!(ctx.assoc, AssocId(assoc));
                    prop_assert_eq!(ctx.supi.clone(), supi.map(imsi));
                }
                let key = UeContextKey::new(RanUeId(ran), AmfUeId(amf));
                let by_key = registry.lookup_by_context_key(&key);
                prop_assert!(by_key.is_some_and(|c| Arc::ptr_eq(&c, &shared)));
                if let Some(n) = supi {
                    let by_supi = registry.lookup_by_supi(&imsi(n));
                    prop_assert!(by_supi.is_some_and(|c| Arc::ptr_eq(&c, &shared)));
                }
            }
            None => prop_assert!(found.is_none()),
        }
        for ran in 1u64..6 {
            let held = model.get(&amf).is_some_and(|entry| entry.0 == ran);
            let key = UeContextKey::new(RanUeId(ran), AmfUeId(amf));
            prop_assert_eq!(registry.lookup_by_context_key(&key).is_some(), held);
        }
    }
    for n in 0u8..4 {
        let holders = model.values().filter(|entry| entry.2 == Some(n)).count();
        prop_assert!(holders <= 1);
        prop_assert_eq!(registry.lookup_by_supi(&imsi(n)).is_some(), holders == 1);
    }
    Ok(())
}

#[derive(Debug, Clone)]
enum NasOp {
    Insert { amf: u64 },
    BindSupi { amf: u64, supi: u8 },
    BindGuti { amf: u64, tmsi: u32 },
    RekeyAmf { old: u64, new: u64 },
    Remove { amf: u64 },
}

fn arb_nas_op() -> impl Strategy<Value = NasOp> {
    prop_oneof![
        (1u64..6).prop_map(|amf| NasOp::Insert { amf }),
        (1u64..6, 0u8..4).prop_map(|(amf, supi)| NasOp::BindSupi { amf, supi }),
        (1u64..6, 0u32..4).prop_map(|(amf, tmsi)| NasOp::BindGuti { amf, tmsi }),
        (1u64..6, 1u64..6).prop_map(|(old, new)| NasOp::RekeyAmf { old, new }),
        (1u64..6).prop_map(|amf| NasOp::Remove { amf }),
    ]
}

/// Expected registry content: AMF id -> (SUPI, GUTI)
type NasModel = BTreeMap<u64, (Option<u8>, Option<u32>)>;

fn apply_nas_op(
    registry: &NasContextRegistry,
    model: &mut NasModel,
    op: &NasOp,
) -> Result<(), TestCaseError> {
    match *op {
        NasOp::Insert { amf } => {
            registry.insert(NasContext::new(AmfUeId(amf), RanUeId(amf)));
            model.insert(amf, (None, None));
        }
        NasOp::BindSupi { amf, supi } => {
            let known = model.contains_key(&amf);
            prop_assert_eq!(registry.bind_supi(AmfUeId(amf), &imsi(supi)), known);
            if known {
                for entry in model.values_mut() {
                    if entry.0 == Some(supi) {
                        entry.0 = None;
                    }
                }
                if let Some(entry) = model.get_mut(&amf) {
                    entry.0 = Some(supi);
                }
            }
        }
        NasOp::BindGuti { amf, tmsi } => {
            let known = model.contains_key(&amf);
            prop_assert_eq!(registry.bind_guti(AmfUeId(amf), &registry_guti(tmsi)), known);
            if known {
                for entry in model.values_mut() {
                    if entry.1 == Some(tmsi) {
                        entry.1 = None;
                    }
                }
                if let Some(entry) = model.get_mut(&amf) {
                    entry.1 = Some(tmsi);
                }
            }
        }
        NasOp::RekeyAmf { old, new } => {
            let known = model.contains_key(&old);
            prop_assert_eq!(registry.rekey_amf(AmfUeId(old), AmfUeId(new), RanUeId(new)), known);
            if known && old != new {
                model.remove(&new);
                if let Some(entry) = model.remove(&old) {
                    model.insert(new, entry);
                }
            }
        }
        NasOp::Remove { amf } => {
            prop_assert_eq!(registry.remove(AmfUeId(amf)).is_some(), model.remove(&amf).is_some());
        }
    }
    Ok(())
}

fn check_nas_registry(registry: &NasContextRegistry, model: &NasModel) -> Result<(), TestCaseError> {
    prop_assert_eq!(registry.len(), model.len());
    for amf in 1u64..6 {
        let found = registry.lookup_by_amf_id(AmfUeId(amf));
        match model.get(&amf) {
            Some(&(supi, tmsi)) => {
                let Some(shared) = found else {
                    return Err(TestCaseError::fail(format!("amf id {} not indexed", amf)));
                };
                {
                    let ctx = arena::read(&shared);
                    prop_assert_eq!(ctx.amf_ue_id, AmfUeId(amf));
                    prop_assert_eq!(ctx.supi.clone(), supi.map(imsi));
                    prop_assert_eq!(ctx.guti.clone(), tmsi.map(registry_guti));
                }
                if let Some(n) = supi {
                    let by_supi = registry.lookup_by_supi(&imsi(n));
                    prop_assert!(by_supi.is_some_and(|c| Arc::ptr_eq(&c, &shared)));
                }
                if let Some(n) = tmsi {
                    let by_guti = registry.lookup_by_guti(&registry_guti(n));
                    prop_assert!(by_guti.is_some_and(|c| Arc::ptr_eq(&c, &shared)));
                }
            }
            None => prop_assert!(found.is_none()),
        }
    }
    for n in 0u8..4 {
        let holders = model.values().filter(|entry| entry.0 == Some(n)).count();
        prop_assert!(holders <= 1);
        prop_assert_eq!(registry.lookup_by_supi(&imsi(n)).is_some(), holders == 1);
    }
    for n in 0u32..4 {
        let holders = model.values().filter(|entry| entry.1 == Some(n)).count();
        prop_assert!(holders <= 1);
        prop_assert_eq!(registry.lookup_by_guti(&registry_guti(n)).is_some(), holders == 1);
    }
    Ok(())
}

proptest! {
    #[test]
    fn prop_count_estimate_within_window(
        expected in 0u32..(NAS_COUNT_MAX - 0x100),
        ahead in 0u32..0x100,
    ) {
        let actual = expected + ahead;
        let sqn = (actual & 0xff) as u8;
        prop_assert_eq!(NasCount::estimate(expected, sqn), actual);
    }

    #[test]
    fn prop_count_increment_is_successor(value in 0u32..NAS_COUNT_MAX) {
        let mut count = NasCount::from_value(value);
        prop_assert!(count.increment().is_ok());
        prop_assert_eq!(count.value(), value + 1);
    }

    #[test]
    fn prop_session_bitmap_roundtrip(
        ids in proptest::collection::btree_set(1u8..16, 0..15),
    ) {
        let ids: Vec<u8> = ids.into_iter().collect();
        let bits = session_bitmap(&ids);
        prop_assert_eq!(bits & 1, 0);
        prop_assert_eq!(bitmap_sessions(bits), ids);
    }

    #[test]
    fn prop_guti_survives_s_tmsi(
        set_id in 0u16..0x400,
        pointer in 0u8..0x40,
        tmsi in any::<u32>(),
    ) {
        let guami = guami(set_id, pointer);
        let guti = Guti::new(&guami, tmsi);
        let s_tmsi = guti.s_tmsi();
        prop_assert_eq!(s_tmsi.tmsi, tmsi);
        prop_assert_eq!(Guti::from_s_tmsi(&guami, &s_tmsi), guti);
    }

    #[test]
    fn prop_arena_rejects_stale_handles(
        values in proptest::collection::vec(any::<u32>(), 1..64),
        removals in proptest::collection::vec(any::<prop::sample::Index>(), 0..32),
    ) {
        let mut arena = Arena::new();
        let handles: Vec<_> = values.iter().map(|v| arena.insert(*v)).collect();
        let mut removed = std::collections::HashSet::new();
        for index in removals {
            let i = index.index(handles.len());
            let first = removed.insert(i);
            prop_assert_eq!(arena.remove(handles[i]).is_some(), first);
        }
        prop_assert_eq!(arena.len(), values.len() - removed.len());

        // Reused slots must not resurrect old handles
        let fresh: Vec<_> = (0..removed.len()).map(|n| arena.insert(u32::MAX - n as u32)).collect();
        for (i, handle) in handles.iter().enumerate() {
            if removed.contains(&i) {
                prop_assert!(arena.get(*handle).is_none());
                prop_assert!(!fresh.contains(handle));
            } else {
                prop_assert_eq!(arena.get(*handle), Some(&values[i]));
            }
        }
    }

    #[test]
    fn prop_ue_registry_indexes_agree(
        ops in proptest::collection::vec(arb_ue_op(), 1..48),
    ) {
        let registry = UeContextRegistry::new();
        let mut model = UeModel::new();
        for op in &ops {
            apply_ue_op(&registry, &mut model, op)?;
            check_ue_registry(&registry, &model)?;
        }
    }

    #[test]
    fn prop_nas_registry_indexes_agree(
        ops in proptest::collection::vec(arb_nas_op(), 1..48),
    ) {
        let registry = NasContextRegistry::new();
        let mut model = NasModel::new();
        for op in &ops {
            apply_nas_op(&registry, &mut model, op)?;
            check_nas_registry(&registry, &model)?;
        }
    }

    #[test]
    fn prop_gmm_registered_flag_tracks_state(
        events in proptest::collection::vec(arb_gmm_event(), 0..32),
    ) {
        let mut fsm = GmmFsm::new(AmfUeId(1));
        for event in events {
            fsm.dispatch(event);
            prop_assert_eq!(fsm.is_registered(), fsm.state() == GmmState::Registered);
        }
    }

    #[test]
    fn prop_gnb_shutdown_is_final(
        before in proptest::collection::vec(arb_gnb_event(), 0..16),
        after in proptest::collection::vec(arb_gnb_event(), 0..16),
    ) {
        let mut fsm = GnbFsm::new(AssocId(1));
        for event in before {
            fsm.dispatch(event);
            prop_assert_eq!(fsm.is_ready(), fsm.state() == GnbState::Ready);
        }
        fsm.dispatch(GnbEvent::AssociationDown);
        for event in after {
            fsm.dispatch(event);
            prop_assert_eq!(fsm.state(), GnbState::Shutdown);
        }
    }

    #[test]
    fn prop_handover_abort_returns_to_connected(
        events in proptest::collection::vec(arb_ue_ngap_event(), 0..16),
    ) {
        let mut fsm = UeNgapFsm::new(RanUeId(1));
        for event in events {
            fsm.dispatch(event);
        }
        fsm.dispatch(UeNgapEvent::HandoverAborted);
        prop_assert_eq!(fsm.state(), UeNgapState::Connected);
    }

    #[test]
    fn prop_nas_decode_never_panics(
        pdu in proptest::collection::vec(any::<u8>(), 0..128),
    ) {
        let _ = NasMessage::decode(&pdu);
    }

    #[test]
    fn prop_uplink_sequence_verifies(
        kamf in any::<[u8; 32]>(),
        ciphering in arb_cipher(),
        messages in proptest::collection::vec(
            proptest::collection::vec(any::<u8>(), 1..64),
            1..8,
        ),
        tamper in any::<prop::sample::Index>(),
    ) {
        let mut ctx = NasSecurityContext::new(1, kamf);
        ctx.activate(IntegrityAlgorithm::Nia2, ciphering);
        prop_assert!(ctx.complete());

        for (count, message) in messages.iter().enumerate() {
            let pdu = uplink_pdu(&kamf, IntegrityAlgorithm::Nia2, ciphering, count as u32, message);
            let opened = ctx.unprotect(&pdu).unwrap();
            prop_assert_eq!(opened.count, count as u32);
            prop_assert_eq!(&opened.message[..], &message[..]);
            prop_assert_eq!(ctx.ul_count(), count as u32);
        }

        // A flipped bit after the header fails the MAC and leaves the count alone
        let next = messages.len() as u32;
        let mut pdu = uplink_pdu(&kamf, IntegrityAlgorithm::Nia2, ciphering, next, &messages[0]);
        let i = 7 + tamper.index(pdu.len() - 7);
        pdu[i] ^= 0x01;
        prop_assert!(
            matches!(ctx.unprotect(&pdu), Err(NasSecurityError::MacMismatch { .. })),
            "tampered PDU accepted"
        );
        prop_assert_eq!(ctx.ul_count(), next - 1);
    }
}

//! Property-based tests for the crypto library

use proptest::prelude::*;

use crate::kdf;
use crate::milenage::{sqn_from_u64, sqn_to_u64, Milenage};
use crate::nea::{self, CipheringAlgorithm};
use crate::nia::{self, IntegrityAlgorithm};
use crate::Direction;

fn arb_cipher() -> impl Strategy<Value = CipheringAlgorithm> {
    prop_oneof![
        Just(CipheringAlgorithm::Nea0),
        Just(CipheringAlgorithm::Nea1),
        Just(CipheringAlgorithm::Nea2),
        Just(CipheringAlgorithm::Nea3),
    ]
}

fn arb_integrity() -> impl Strategy<Value = IntegrityAlgorithm> {
    prop_oneof![
        Just(IntegrityAlgorithm::Nia1),
        Just(IntegrityAlgorithm::Nia2),
        Just(IntegrityAlgorithm::Nia3),
    ]
}

fn arb_direction() -> impl Strategy<Value = Direction> {
    prop_oneof![Just(Direction::Uplink), Just(Direction::Downlink)]
}

proptest! {
    #[test]
    fn prop_ciphering_roundtrip(
        alg in arb_cipher(),
        key in any::<[u8; 16]>(),
        count in any::<u32>(),
        bearer in 0u8..32,
        dir in arb_direction(),
        plain in proptest::collection::vec(any::<u8>(), 0..256),
    ) {
        let mut data = plain.clone();
        nea::apply(alg, &key, count, bearer, dir, &mut data).unwrap();
        nea::apply(alg, &key, count, bearer, dir, &mut data).unwrap();
        prop_assert_eq!(data, plain);
    }

    #[test]
    fn prop_mac_detects_single_bit_flip(
        alg in arb_integrity(),
        key in any::<[u8; 16]>(),
        count in any::<u32>(),
        msg in proptest::collection::vec(any::<u8>(), 1..64),
        bit in any::<prop::sample::Index>(),
    ) {
        let original = nia::compute_mac(alg, &key, count, 1, Direction::Uplink, &msg).unwrap();
        let mut flipped = msg.clone();
        let i = bit.index(msg.len() * 8);
        flipped[i / 8] ^= 0x80 >> (i % 8);
        let tampered = nia::compute_mac(alg, &key, count, 1, Direction::Uplink, &flipped).unwrap();
        prop_assert_ne!(original, tampered);
    }

    #[test]
    fn prop_resync_roundtrip(
        k in any::<[u8; 16]>(),
        opc in any::<[u8; 16]>(),
        rand in any::<[u8; 16]>(),
        sqn in 0u64..(1u64 << 48),
    ) {
        let m = Milenage::new(&k, &opc);
        let sqn_ms = sqn_from_u64(sqn);
        let auts = m.auts(&rand, &sqn_ms);
        let recovered = m.resync(&rand, &auts).unwrap();
        prop_assert_eq!(sqn_to_u64(&recovered), sqn);
    }

    #[test]
    fn prop_hxres_star_depends_on_rand(
        rand1 in any::<[u8; 16]>(),
        rand2 in any::<[u8; 16]>(),
        xres in any::<[u8; 16]>(),
    ) {
        prop_assume!(rand1 != rand2);
        prop_assert_ne!(kdf::hxres_star(&rand1, &xres), kdf::hxres_star(&rand2, &xres));
    }
}

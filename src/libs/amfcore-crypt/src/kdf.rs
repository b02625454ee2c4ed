//! Key Derivation Functions
//!
//! The generic KDF of TS 33.220 Annex B.2.0 and the 5G key hierarchy of
//! TS 33.501 Annex A built on it.

use hmac::digest::generic_array::GenericArray;
use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::{KEY256_LEN, KEY_LEN, RAND_LEN, SQN_LEN};

// FC values (TS 33.501 Annex A)
const FC_ALGORITHM_KEY: u8 = 0x69;
const FC_KAUSF: u8 = 0x6A;
const FC_RES_STAR: u8 = 0x6B;
const FC_KSEAF: u8 = 0x6C;
const FC_KAMF: u8 = 0x6D;
const FC_KGNB: u8 = 0x6E;
const FC_NH: u8 = 0x6F;

/// Algorithm type distinguisher for NAS ciphering keys
pub const NAS_ENC_ALG: u8 = 0x01;
/// Algorithm type distinguisher for NAS integrity keys
pub const NAS_INT_ALG: u8 = 0x02;

/// Access type distinguisher: 3GPP access
pub const ACCESS_TYPE_3GPP: u8 = 0x01;
/// Access type distinguisher: non-3GPP access
pub const ACCESS_TYPE_NON_3GPP: u8 = 0x02;

/// ABBA value for the initial 5G key hierarchy
pub const ABBA_DEFAULT: [u8; 2] = [0x00, 0x00];

type HmacSha256 = Hmac<Sha256>;

/// KDF(key, S) with S = FC || P0 || L0 || P1 || L1 ...
///
/// Every key fed to the 5G KDF is 256 bits. HMAC zero-pads keys to the block
/// size, so the key is placed into a full block and the infallible
/// constructor is used.
pub fn kdf(key: &[u8; KEY256_LEN], fc: u8, params: &[&[u8]]) -> [u8; KEY256_LEN] {
    let mut block = GenericArray::default();
    block[..KEY256_LEN].copy_from_slice(key);
    let mut mac = <HmacSha256 as KeyInit>::new(&block);

    mac.update(&[fc]);
    for param in params {
        mac.update(param);
        mac.update(&(param.len() as u16).to_be_bytes());
    }

    let mut out = [0u8; KEY256_LEN];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

fn ck_ik(ck: &[u8; KEY_LEN], ik: &[u8; KEY_LEN]) -> [u8; KEY256_LEN] {
    let mut key = [0u8; KEY256_LEN];
    key[..KEY_LEN].copy_from_slice(ck);
    key[KEY_LEN..].copy_from_slice(ik);
    key
}

fn lower_half(full: &[u8; KEY256_LEN]) -> [u8; KEY_LEN] {
    let mut half = [0u8; KEY_LEN];
    half.copy_from_slice(&full[KEY_LEN..]);
    half
}

/// Serving network name: `5G:mnc<MNC>.mcc<MCC>.3gppnetwork.org`
///
/// Two-digit MNCs are zero-padded to three digits.
pub fn serving_network_name(mcc: &str, mnc: &str) -> String {
    format!("5G:mnc{:0>3}.mcc{}.3gppnetwork.org", mnc, mcc)
}

/// A.2: Kausf from CK, IK, serving network name and SQN ^ AK
pub fn kausf(
    ck: &[u8; KEY_LEN],
    ik: &[u8; KEY_LEN],
    serving_network_name: &str,
    sqn_xor_ak: &[u8; SQN_LEN],
) -> [u8; KEY256_LEN] {
    kdf(
        &ck_ik(ck, ik),
        FC_KAUSF,
        &[serving_network_name.as_bytes(), sqn_xor_ak],
    )
}

/// A.4: RES* / XRES*, the lower 128 bits of the KDF output
pub fn res_star(
    ck: &[u8; KEY_LEN],
    ik: &[u8; KEY_LEN],
    serving_network_name: &str,
    rand: &[u8; RAND_LEN],
    res: &[u8],
) -> [u8; KEY_LEN] {
    let out = kdf(
        &ck_ik(ck, ik),
        FC_RES_STAR,
        &[serving_network_name.as_bytes(), rand, res],
    );
    lower_half(&out)
}

/// A.5: HRES* / HXRES*, the lower 128 bits of SHA-256(RAND || RES*)
pub fn hxres_star(rand: &[u8; RAND_LEN], res_star: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    let mut hasher = Sha256::new();
    hasher.update(rand);
    hasher.update(res_star);
    let digest = hasher.finalize();

    let mut out = [0u8; KEY_LEN];
    out.copy_from_slice(&digest[KEY_LEN..]);
    out
}

/// A.6: Kseaf from Kausf
pub fn kseaf(serving_network_name: &str, kausf: &[u8; KEY256_LEN]) -> [u8; KEY256_LEN] {
    kdf(kausf, FC_KSEAF, &[serving_network_name.as_bytes()])
}

/// A.7: Kamf from Kseaf, SUPI and ABBA
///
/// The SUPI type prefix (`imsi-`, `nai-`) is not part of the input.
pub fn kamf(supi: &str, abba: &[u8], kseaf: &[u8; KEY256_LEN]) -> [u8; KEY256_LEN] {
    let value = supi_value(supi);
    kdf(kseaf, FC_KAMF, &[value.as_bytes(), abba])
}

/// A.8: NAS algorithm key (Knas-enc / Knas-int), the lower 128 bits
pub fn algorithm_key(
    kamf: &[u8; KEY256_LEN],
    distinguisher: u8,
    algorithm_id: u8,
) -> [u8; KEY_LEN] {
    let out = kdf(kamf, FC_ALGORITHM_KEY, &[&[distinguisher], &[algorithm_id]]);
    lower_half(&out)
}

/// A.9: KgNB from Kamf, uplink NAS COUNT and access type
pub fn kgnb(kamf: &[u8; KEY256_LEN], ul_count: u32, access_type: u8) -> [u8; KEY256_LEN] {
    kdf(kamf, FC_KGNB, &[&ul_count.to_be_bytes(), &[access_type]])
}

/// A.10: NH from Kamf and the sync input (KgNB first, then the previous NH)
pub fn nh(kamf: &[u8; KEY256_LEN], sync_input: &[u8; KEY256_LEN]) -> [u8; KEY256_LEN] {
    kdf(kamf, FC_NH, &[sync_input])
}

/// Value part of a SUPI (`imsi-001010000000001` -> `001010000000001`)
pub fn supi_value(supi: &str) -> &str {
    match supi.split_once('-') {
        Some((_, value)) => value,
        None => supi,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serving_network_name_pads_mnc() {
        assert_eq!(
            serving_network_name("001", "01"),
            "5G:mnc001.mcc001.3gppnetwork.org"
        );
        assert_eq!(
            serving_network_name("310", "410"),
            "5G:mnc410.mcc310.3gppnetwork.org"
        );
    }

    #[test]
    fn test_kdf_matches_manual_hmac() {
        let key = [0x11u8; 32];
        let mut mac = <HmacSha256 as Mac>::new_from_slice(&key).unwrap();
        mac.update(&[0x6C, b'a', b'b', 0x00, 0x02]);
        let expected = mac.finalize().into_bytes();

        assert_eq!(kdf(&key, 0x6C, &[b"ab"])[..], expected[..]);
    }

    #[test]
    fn test_hxres_star_is_lower_half_of_sha256() {
        let rand = [0xAAu8; 16];
        let xres = [0x55u8; 16];
        let mut hasher = Sha256::new();
        hasher.update([0xAAu8; 16]);
        hasher.update([0x55u8; 16]);
        let digest = hasher.finalize();
        assert_eq!(hxres_star(&rand, &xres)[..], digest[16..]);
    }

    #[test]
    fn test_kamf_ignores_supi_prefix() {
        let kseaf = [0x42u8; 32];
        assert_eq!(
            kamf("imsi-001010000000001", &ABBA_DEFAULT, &kseaf),
            kamf("001010000000001", &ABBA_DEFAULT, &kseaf)
        );
    }

    #[test]
    fn test_algorithm_keys_differ_by_distinguisher() {
        let kamf = [0x07u8; 32];
        let enc = algorithm_key(&kamf, NAS_ENC_ALG, 2);
        let int = algorithm_key(&kamf, NAS_INT_ALG, 2);
        assert_ne!(enc, int);
        assert_ne!(algorithm_key(&kamf, NAS_INT_ALG, 1), int);
    }

    #[test]
    fn test_nh_chain_changes_each_hop() {
        let kamf = [0x01u8; 32];
        let kgnb = kgnb(&kamf, 0, ACCESS_TYPE_3GPP);
        let nh1 = nh(&kamf, &kgnb);
        let nh2 = nh(&kamf, &nh1);
        assert_ne!(nh1, kgnb);
        assert_ne!(nh1, nh2);
    }

    #[test]
    fn test_kgnb_depends_on_count() {
        let kamf = [0x01u8; 32];
        assert_ne!(
            kgnb(&kamf, 0, ACCESS_TYPE_3GPP),
            kgnb(&kamf, 1, ACCESS_TYPE_3GPP)
        );
    }

    #[test]
    fn test_res_star_and_kausf_bind_serving_network() {
        let ck = [1u8; 16];
        let ik = [2u8; 16];
        let rand = [3u8; 16];
        let res = [4u8; 8];
        let a = res_star(&ck, &ik, "5G:mnc001.mcc001.3gppnetwork.org", &rand, &res);
        let b = res_star(&ck, &ik, "5G:mnc002.mcc001.3gppnetwork.org", &rand, &res);
        assert_ne!(a, b);

        let sqn_xor_ak = [5u8; 6];
        assert_ne!(
            kausf(&ck, &ik, "5G:mnc001.mcc001.3gppnetwork.org", &sqn_xor_ak),
            kausf(&ck, &ik, "5G:mnc002.mcc001.3gppnetwork.org", &sqn_xor_ak)
        );
    }
}

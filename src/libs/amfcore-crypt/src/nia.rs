//! NAS integrity algorithms (TS 33.501 Annex D)
//!
//! - NIA0: null integrity, MAC is all zeros
//! - NIA1: SNOW 3G f9 (128-EIA1)
//! - NIA2: AES-128-CMAC (128-EIA2)
//! - NIA3: ZUC (128-EIA3)

use aes::Aes128;
use cmac::digest::generic_array::GenericArray;
use cmac::{Cmac, Mac};
use zuc::Zuc128Core as ZUC128;

use crate::nea::counter_block;
use crate::{snow3g, CryptError, Direction, KEY_LEN, MAC_LEN};

/// 5G NAS integrity algorithm identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IntegrityAlgorithm {
    Nia0 = 0,
    Nia1 = 1,
    Nia2 = 2,
    Nia3 = 3,
}

impl IntegrityAlgorithm {
    /// Algorithm from its 3-bit identifier
    pub fn from_id(id: u8) -> Result<Self, CryptError> {
        match id {
            0 => Ok(Self::Nia0),
            1 => Ok(Self::Nia1),
            2 => Ok(Self::Nia2),
            3 => Ok(Self::Nia3),
            other => Err(CryptError::UnknownAlgorithm(other)),
        }
    }

    /// 3-bit identifier
    pub fn id(self) -> u8 {
        self as u8
    }

    /// Name as used in configuration files
    pub fn name(self) -> &'static str {
        match self {
            Self::Nia0 => "NIA0",
            Self::Nia1 => "NIA1",
            Self::Nia2 => "NIA2",
            Self::Nia3 => "NIA3",
        }
    }
}

/// Compute the 32-bit MAC of `data`
pub fn compute_mac(
    algorithm: IntegrityAlgorithm,
    key: &[u8; KEY_LEN],
    count: u32,
    bearer: u8,
    direction: Direction,
    data: &[u8],
) -> Result<[u8; MAC_LEN], CryptError> {
    match algorithm {
        IntegrityAlgorithm::Nia0 => Ok([0u8; MAC_LEN]),
        IntegrityAlgorithm::Nia1 => {
            let fresh = u32::from(bearer & 0x1f) << 27;
            Ok(snow3g::f9(key, count, fresh, direction, data, data.len() * 8))
        }
        IntegrityAlgorithm::Nia2 => Ok(nia2(key, count, bearer, direction, data)),
        IntegrityAlgorithm::Nia3 => Ok(nia3(key, count, bearer, direction, data, data.len() * 8)),
    }
}

fn nia2(key: &[u8; KEY_LEN], count: u32, bearer: u8, direction: Direction, data: &[u8]) -> [u8; MAC_LEN] {
    // M = COUNT || BEARER || DIRECTION || 0^26 || MESSAGE
    let header = counter_block(count, bearer, direction);
    let mut mac = <Cmac<Aes128> as Mac>::new(GenericArray::from_slice(key));
    mac.update(&header[..8]);
    mac.update(data);
    let tag = mac.finalize().into_bytes();

    let mut out = [0u8; MAC_LEN];
    out.copy_from_slice(&tag[..MAC_LEN]);
    out
}

/// EIA3 IV (TS 35.223 clause 4.3)
fn nia3_iv(count: u32, bearer: u8, direction: Direction) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[0..4].copy_from_slice(&count.to_be_bytes());
    iv[4] = (bearer & 0x1F) << 3;
    iv[8] = iv[0] ^ (direction.bit() << 7);
    iv.copy_within(1..4, 9);
    iv[12] = iv[4];
    iv[14] = iv[6] ^ (direction.bit() << 7);
    iv
}

/// 32 keystream bits starting at bit `i`
fn keystream_word(z: &[u32], i: usize) -> u32 {
    let j = i / 32;
    let r = i % 32;
    if r == 0 {
        z[j]
    } else {
        (z[j] << r) | (z[j + 1] >> (32 - r))
    }
}

/// EIA3 over the first `length` bits of `data`
fn nia3(
    key: &[u8; KEY_LEN],
    count: u32,
    bearer: u8,
    direction: Direction,
    data: &[u8],
    length: usize,
) -> [u8; MAC_LEN] {
    let words = length.div_ceil(32) + 2;

    let iv = nia3_iv(count, bearer, direction);
    let mut zuc = ZUC128::new(key, &iv);
    let z: Vec<u32> = (0..words).map(|_| zuc.generate()).collect();

    let mut t = 0u32;
    for i in 0..length {
        if data[i / 8] & (0x80 >> (i % 8)) != 0 {
            t ^= keystream_word(&z, i);
        }
    }
    t ^= keystream_word(&z, length);
    (t ^ z[words - 1]).to_be_bytes()
}

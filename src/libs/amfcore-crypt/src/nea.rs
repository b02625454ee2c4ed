//! NAS ciphering algorithms (TS 33.501 Annex D)
//!
//! - NEA0: null ciphering
//! - NEA1: SNOW 3G f8 (128-EEA1)
//! - NEA2: AES-128 in counter mode (128-EEA2)
//! - NEA3: ZUC (128-EEA3)

use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use zuc::Zuc128Core as ZUC128;

use crate::{snow3g, CryptError, Direction, KEY_LEN};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;

/// 5G NAS ciphering algorithm identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CipheringAlgorithm {
    Nea0 = 0,
    Nea1 = 1,
    Nea2 = 2,
    Nea3 = 3,
}

impl CipheringAlgorithm {
    /// Algorithm from its 3-bit identifier
    pub fn from_id(id: u8) -> Result<Self, CryptError> {
        match id {
            0 => Ok(Self::Nea0),
            1 => Ok(Self::Nea1),
            2 => Ok(Self::Nea2),
            3 => Ok(Self::Nea3),
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
            Self::Nea0 => "NEA0",
            Self::Nea1 => "NEA1",
            Self::Nea2 => "NEA2",
            Self::Nea3 => "NEA3",
        }
    }
}

/// Cipher or decipher `data` in place
///
/// All algorithms are XOR stream ciphers, so the same call both encrypts and
/// decrypts.
pub fn apply(
    algorithm: CipheringAlgorithm,
    key: &[u8; KEY_LEN],
    count: u32,
    bearer: u8,
    direction: Direction,
    data: &mut [u8],
) -> Result<(), CryptError> {
    let length = data.len() * 8;
    apply_bits(algorithm, key, count, bearer, direction, data, length)
}

/// Cipher the first `length` bits of `data`
///
/// Bits of the last touched byte past `length` are cleared; bytes after it
/// are left alone.
pub fn apply_bits(
    algorithm: CipheringAlgorithm,
    key: &[u8; KEY_LEN],
    count: u32,
    bearer: u8,
    direction: Direction,
    data: &mut [u8],
    length: usize,
) -> Result<(), CryptError> {
    let bytes = length.div_ceil(8);
    if data.len() < bytes {
        return Err(CryptError::InvalidLength {
            what: "ciphering input",
            expected: bytes,
            actual: data.len(),
        });
    }
    let data = &mut data[..bytes];

    match algorithm {
        CipheringAlgorithm::Nea0 => {}
        CipheringAlgorithm::Nea1 => snow3g::f8(key, count, bearer, direction, data, length),
        CipheringAlgorithm::Nea2 => nea2(key, count, bearer, direction, data),
        CipheringAlgorithm::Nea3 => nea3(key, count, bearer, direction, data),
    }

    let tail = length % 8;
    if tail != 0 && algorithm != CipheringAlgorithm::Nea0 {
        data[bytes - 1] &= 0xffu8 << (8 - tail);
    }
    Ok(())
}

/// COUNT || BEARER || DIRECTION || 0..0
pub(crate) fn counter_block(count: u32, bearer: u8, direction: Direction) -> [u8; 16] {
    let mut block = [0u8; 16];
    block[0..4].copy_from_slice(&count.to_be_bytes());
    block[4] = ((bearer & 0x1F) << 3) | (direction.bit() << 2);
    block
}

fn nea2(key: &[u8; KEY_LEN], count: u32, bearer: u8, direction: Direction, data: &mut [u8]) {
    let iv = counter_block(count, bearer, direction);
    let mut cipher = Aes128Ctr::new(key.into(), &iv.into());
    cipher.apply_keystream(data);
}

/// EEA3 IV: the first 64 bits of the counter block, repeated
fn nea3_iv(count: u32, bearer: u8, direction: Direction) -> [u8; 16] {
    let mut iv = counter_block(count, bearer, direction);
    let (head, tail) = iv.split_at_mut(8);
    tail.copy_from_slice(head);
    iv
}

fn nea3(key: &[u8; KEY_LEN], count: u32, bearer: u8, direction: Direction, data: &mut [u8]) {
    let iv = nea3_iv(count, bearer, direction);
    let mut zuc = ZUC128::new(key, &iv);
    for chunk in data.chunks_mut(4) {
        let word = zuc.generate().to_be_bytes();
        for (byte, k) in chunk.iter_mut().zip(word.iter()) {
            *byte ^= k;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::cipher::generic_array::GenericArray;
    use aes::cipher::{BlockEncrypt, KeyInit};

    const KEY: [u8; 16] = [
        0xd3, 0xc5, 0xd5, 0x92, 0x32, 0x7f, 0xb1, 0x1c, 0x40, 0x35, 0xc6, 0x68, 0x0a, 0xf8, 0xc6,
        0xd1,
    ];

    #[test]
    fn test_counter_block_layout() {
        let block = counter_block(0x12345678, 0x0A, Direction::Downlink);
        assert_eq!(&block[0..4], &[0x12, 0x34, 0x56, 0x78]);
        assert_eq!(block[4], 0x54);
        assert!(block[5..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_nea3_iv_repeats_first_half() {
        let iv = nea3_iv(0xa94059da, 0x0a, Direction::Uplink);
        assert_eq!(iv[..8], iv[8..]);
        assert_eq!(iv[4], 0x50);
    }

    #[test]
    fn test_nea2_first_block_is_aes_of_counter() {
        let mut data = [0u8; 16];
        apply(CipheringAlgorithm::Nea2, &KEY, 0x398a59b4, 0x15, Direction::Downlink, &mut data)
            .unwrap();

        let cipher = aes::Aes128::new(GenericArray::from_slice(&KEY));
        let mut block = GenericArray::clone_from_slice(&counter_block(
            0x398a59b4,
            0x15,
            Direction::Downlink,
        ));
        cipher.encrypt_block(&mut block);
        assert_eq!(&data[..], &block[..]);
    }

    #[test]
    fn test_nea0_leaves_data_untouched() {
        let mut data = *b"plain nas";
        apply(CipheringAlgorithm::Nea0, &KEY, 1, 1, Direction::Uplink, &mut data).unwrap();
        assert_eq!(&data, b"plain nas");
    }

    #[test]
    fn test_nea1_matches_snow3g_f8() {
        let plain = b"security mode command".to_vec();
        let mut data = plain.clone();
        apply(CipheringAlgorithm::Nea1, &KEY, 0x398a59b4, 0x15, Direction::Downlink, &mut data)
            .unwrap();

        let mut expected = plain.clone();
        let length = expected.len() * 8;
        snow3g::f8(&KEY, 0x398a59b4, 0x15, Direction::Downlink, &mut expected, length);
        assert_eq!(data, expected);
        assert_ne!(data, plain);

        apply(CipheringAlgorithm::Nea1, &KEY, 0x398a59b4, 0x15, Direction::Downlink, &mut data)
            .unwrap();
        assert_eq!(data, plain);
    }

    #[test]
    fn test_nea3_eea3_test_set_1() {
        let key = [
            0x17, 0x3d, 0x14, 0xba, 0x50, 0x03, 0x73, 0x1d, 0x7a, 0x60, 0x04, 0x94, 0x70, 0xf0,
            0x0a, 0x29,
        ];
        let mut data = [
            0x6c, 0xf6, 0x53, 0x40, 0x73, 0x55, 0x52, 0xab, 0x0c, 0x97, 0x52, 0xfa, 0x6f, 0x90,
            0x25, 0xfe, 0x0b, 0xd6, 0x75, 0xd9, 0x00, 0x58, 0x75, 0xb2, 0x00,
        ];
        let expected = [
            0xa6, 0xc8, 0x5f, 0xc6, 0x6a, 0xfb, 0x85, 0x33, 0xaa, 0xfc, 0x25, 0x18, 0xdf, 0xe7,
            0x84, 0x94, 0x0e, 0xe1, 0xe4, 0xb0, 0x30, 0x23, 0x8c, 0xc8, 0x00,
        ];
        apply_bits(CipheringAlgorithm::Nea3, &key, 0x66035492, 0x0f, Direction::Uplink, &mut data, 193)
            .unwrap();
        assert_eq!(data, expected);
    }

    #[test]
    fn test_apply_bits_rejects_short_input() {
        let mut data = [0u8; 2];
        assert_eq!(
            apply_bits(CipheringAlgorithm::Nea2, &KEY, 0, 0, Direction::Uplink, &mut data, 17),
            Err(CryptError::InvalidLength {
                what: "ciphering input",
                expected: 3,
                actual: 2,
            })
        );
    }

    #[test]
    fn test_nea3_roundtrip_odd_length() {
        let plain = b"registration accept payload".to_vec();
        let mut data = plain.clone();
        apply(CipheringAlgorithm::Nea3, &KEY, 7, 1, Direction::Downlink, &mut data).unwrap();
        assert_ne!(data, plain);
        apply(CipheringAlgorithm::Nea3, &KEY, 7, 1, Direction::Downlink, &mut data).unwrap();
        assert_eq!(data, plain);
    }

    #[test]
    fn test_direction_changes_keystream() {
        let mut up = [0u8; 8];
        let mut down = [0u8; 8];
        apply(CipheringAlgorithm::Nea2, &KEY, 3, 1, Direction::Uplink, &mut up).unwrap();
        apply(CipheringAlgorithm::Nea2, &KEY, 3, 1, Direction::Downlink, &mut down).unwrap();
        assert_ne!(up, down);
    }

    #[test]
    fn test_from_id() {
        assert_eq!(CipheringAlgorithm::from_id(2), Ok(CipheringAlgorithm::Nea2));
        assert_eq!(CipheringAlgorithm::from_id(9), Err(CryptError::UnknownAlgorithm(9)));
    }
}

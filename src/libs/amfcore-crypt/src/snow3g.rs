//! SNOW 3G keystream generator with the f8 and f9 functions (TS 35.215/35.216)
//!
//! 128-NEA1 is f8 with the 5-bit NAS bearer; 128-NIA1 is f9 with
//! FRESH = BEARER || 0^27 (TS 33.401 Annex B).

use crate::{Direction, KEY_LEN, MAC_LEN};

/// Rijndael S-box used by S1
const SR: [u8; 256] = [
    0x63, 0x7C, 0x77, 0x7B, 0xF2, 0x6B, 0x6F, 0xC5, 0x30, 0x01, 0x67, 0x2B, 0xFE, 0xD7, 0xAB, 0x76,
    0xCA, 0x82, 0xC9, 0x7D, 0xFA, 0x59, 0x47, 0xF0, 0xAD, 0xD4, 0xA2, 0xAF, 0x9C, 0xA4, 0x72, 0xC0,
    0xB7, 0xFD, 0x93, 0x26, 0x36, 0x3F, 0xF7, 0xCC, 0x34, 0xA5, 0xE5, 0xF1, 0x71, 0xD8, 0x31, 0x15,
    0x04, 0xC7, 0x23, 0xC3, 0x18, 0x96, 0x05, 0x9A, 0x07, 0x12, 0x80, 0xE2, 0xEB, 0x27, 0xB2, 0x75,
    0x09, 0x83, 0x2C, 0x1A, 0x1B, 0x6E, 0x5A, 0xA0, 0x52, 0x3B, 0xD6, 0xB3, 0x29, 0xE3, 0x2F, 0x84,
    0x53, 0xD1, 0x00, 0xED, 0x20, 0xFC, 0xB1, 0x5B, 0x6A, 0xCB, 0xBE, 0x39, 0x4A, 0x4C, 0x58, 0xCF,
    0xD0, 0xEF, 0xAA, 0xFB, 0x43, 0x4D, 0x33, 0x85, 0x45, 0xF9, 0x02, 0x7F, 0x50, 0x3C, 0x9F, 0xA8,
    0x51, 0xA3, 0x40, 0x8F, 0x92, 0x9D, 0x38, 0xF5, 0xBC, 0xB6, 0xDA, 0x21, 0x10, 0xFF, 0xF3, 0xD2,
    0xCD, 0x0C, 0x13, 0xEC, 0x5F, 0x97, 0x44, 0x17, 0xC4, 0xA7, 0x7E, 0x3D, 0x64, 0x5D, 0x19, 0x73,
    0x60, 0x81, 0x4F, 0xDC, 0x22, 0x2A, 0x90, 0x88, 0x46, 0xEE, 0xB8, 0x14, 0xDE, 0x5E, 0x0B, 0xDB,
    0xE0, 0x32, 0x3A, 0x0A, 0x49, 0x06, 0x24, 0x5C, 0xC2, 0xD3, 0xAC, 0x62, 0x91, 0x95, 0xE4, 0x79,
    0xE7, 0xC8, 0x37, 0x6D, 0x8D, 0xD5, 0x4E, 0xA9, 0x6C, 0x56, 0xF4, 0xEA, 0x65, 0x7A, 0xAE, 0x08,
    0xBA, 0x78, 0x25, 0x2E, 0x1C, 0xA6, 0xB4, 0xC6, 0xE8, 0xDD, 0x74, 0x1F, 0x4B, 0xBD, 0x8B, 0x8A,
    0x70, 0x3E, 0xB5, 0x66, 0x48, 0x03, 0xF6, 0x0E, 0x61, 0x35, 0x57, 0xB9, 0x86, 0xC1, 0x1D, 0x9E,
    0xE1, 0xF8, 0x98, 0x11, 0x69, 0xD9, 0x8E, 0x94, 0x9B, 0x1E, 0x87, 0xE9, 0xCE, 0x55, 0x28, 0xDF,
    0x8C, 0xA1, 0x89, 0x0D, 0xBF, 0xE6, 0x42, 0x68, 0x41, 0x99, 0x2D, 0x0F, 0xB0, 0x54, 0xBB, 0x16,
];

/// S-box used by S2
const SQ: [u8; 256] = [
    0x25, 0x24, 0x73, 0x67, 0xD7, 0xAE, 0x5C, 0x30, 0xA4, 0xEE, 0x6E, 0xCB, 0x7D, 0xB5, 0x82, 0xDB,
    0xE4, 0x8E, 0x48, 0x49, 0x4F, 0x5D, 0x6A, 0x78, 0x70, 0x88, 0xE8, 0x5F, 0x5E, 0x84, 0x65, 0xE2,
    0xD8, 0xE9, 0xCC, 0xED, 0x40, 0x2F, 0x11, 0x28, 0x57, 0xD2, 0xAC, 0xE3, 0x4A, 0x15, 0x1B, 0xB9,
    0xB2, 0x80, 0x85, 0xA6, 0x2E, 0x02, 0x47, 0x29, 0x07, 0x4B, 0x0E, 0xC1, 0x51, 0xAA, 0x89, 0xD4,
    0xCA, 0x01, 0x46, 0xB3, 0xEF, 0xDD, 0x44, 0x7B, 0xC2, 0x7F, 0xBE, 0xC3, 0x9F, 0x20, 0x4C, 0x64,
    0x83, 0xA2, 0x68, 0x42, 0x13, 0xB4, 0x41, 0xCD, 0xBA, 0xC6, 0xBB, 0x6D, 0x4D, 0x71, 0x21, 0xF4,
    0x8D, 0xB0, 0xE5, 0x93, 0xFE, 0x8F, 0xE6, 0xCF, 0x43, 0x45, 0x31, 0x22, 0x37, 0x36, 0x96, 0xFA,
    0xBC, 0x0F, 0x08, 0x52, 0x1D, 0x55, 0x1A, 0xC5, 0x4E, 0x23, 0x69, 0x7A, 0x92, 0xFF, 0x5B, 0x5A,
    0xEB, 0x9A, 0x1C, 0xA9, 0xD1, 0x7E, 0x0D, 0xFC, 0x50, 0x8A, 0xB6, 0x62, 0xF5, 0x0A, 0xF8, 0xDC,
    0x03, 0x3C, 0x0C, 0x39, 0xF1, 0xB8, 0xF3, 0x3D, 0xF2, 0xD5, 0x97, 0x66, 0x81, 0x32, 0xA0, 0x00,
    0x06, 0xCE, 0xF6, 0xEA, 0xB7, 0x17, 0xF7, 0x8C, 0x79, 0xD6, 0xA7, 0xBF, 0x8B, 0x3F, 0x1F, 0x53,
    0x63, 0x75, 0x35, 0x2C, 0x60, 0xFD, 0x27, 0xD3, 0x94, 0xA5, 0x7C, 0xA1, 0x05, 0x58, 0x2D, 0xBD,
    0xD9, 0xC7, 0xAF, 0x6B, 0x54, 0x0B, 0xE0, 0x38, 0x04, 0xC8, 0x9D, 0xE7, 0x14, 0xB1, 0x87, 0x9C,
    0xDF, 0x6F, 0xF9, 0xDA, 0x2A, 0xC4, 0x59, 0x16, 0x74, 0x91, 0xAB, 0x26, 0x61, 0x76, 0x34, 0x2B,
    0xAD, 0x99, 0xFB, 0x72, 0xEC, 0x33, 0x12, 0xDE, 0x98, 0x3B, 0xC0, 0x9B, 0x3E, 0x18, 0x10, 0x3A,
    0x56, 0xE1, 0x77, 0xC9, 0x1E, 0x9E, 0x95, 0xA3, 0x90, 0x19, 0xA8, 0x6C, 0x09, 0xD0, 0xF0, 0x86,
];

/// MULx over GF(2^8) with reduction constant `c`
fn mul_x(v: u8, c: u8) -> u8 {
    if v & 0x80 != 0 {
        (v << 1) ^ c
    } else {
        v << 1
    }
}

fn mul_x_pow(mut v: u8, i: u32, c: u8) -> u8 {
    for _ in 0..i {
        v = mul_x(v, c);
    }
    v
}

/// One 32-bit word of MULalpha or DIValpha for a byte
fn alpha_word(c: u8, powers: [u32; 4]) -> u32 {
    u32::from_be_bytes(powers.map(|p| mul_x_pow(c, p, 0xa9)))
}

fn mul_alpha(c: u8) -> u32 {
    alpha_word(c, [23, 245, 48, 239])
}

fn div_alpha(c: u8) -> u32 {
    alpha_word(c, [16, 39, 6, 64])
}

/// S-box layer followed by the MixColumn step, with `c` as reduction constant
fn s_box(w: u32, table: &[u8; 256], c: u8) -> u32 {
    let [w0, w1, w2, w3] = w.to_be_bytes().map(|b| table[b as usize]);
    let r0 = mul_x(w0, c) ^ w1 ^ w2 ^ mul_x(w3, c) ^ w3;
    let r1 = mul_x(w0, c) ^ w0 ^ mul_x(w1, c) ^ w2 ^ w3;
    let r2 = w0 ^ mul_x(w1, c) ^ w1 ^ mul_x(w2, c) ^ w3;
    let r3 = w0 ^ w1 ^ mul_x(w2, c) ^ w2 ^ mul_x(w3, c);
    u32::from_be_bytes([r0, r1, r2, r3])
}

fn s1(w: u32) -> u32 {
    s_box(w, &SR, 0x1b)
}

fn s2(w: u32) -> u32 {
    s_box(w, &SQ, 0x69)
}

/// LFSR and FSM state
struct Snow3g {
    s: [u32; 16],
    r1: u32,
    r2: u32,
    r3: u32,
}

impl Snow3g {
    /// Load key words k0..k3 and IV words iv0..iv3, then run the 32
    /// initialisation clocks
    fn new(k: [u32; 4], iv: [u32; 4]) -> Self {
        let ones = u32::MAX;
        let s = [
            k[0] ^ ones,
            k[1] ^ ones,
            k[2] ^ ones,
            k[3] ^ ones,
            k[0],
            k[1],
            k[2],
            k[3],
            k[0] ^ ones,
            k[1] ^ ones ^ iv[3],
            k[2] ^ ones ^ iv[2],
            k[3] ^ ones,
            k[0] ^ iv[1],
            k[1],
            k[2],
            k[3] ^ iv[0],
        ];
        let mut state = Self { s, r1: 0, r2: 0, r3: 0 };
        for _ in 0..32 {
            let f = state.clock_fsm();
            state.clock_lfsr(f);
        }
        state
    }

    fn clock_lfsr(&mut self, f: u32) {
        let s0 = self.s[0];
        let s11 = self.s[11];
        let v = (s0 << 8)
            ^ mul_alpha((s0 >> 24) as u8)
            ^ self.s[2]
            ^ (s11 >> 8)
            ^ div_alpha(s11 as u8)
            ^ f;
        self.s.copy_within(1.., 0);
        self.s[15] = v;
    }

    fn clock_fsm(&mut self) -> u32 {
        let f = self.s[15].wrapping_add(self.r1) ^ self.r2;
        let r = self.r2.wrapping_add(self.r3 ^ self.s[5]);
        self.r3 = s2(self.r2);
        self.r2 = s1(self.r1);
        self.r1 = r;
        f
    }

    /// `n` keystream words; the first FSM output is discarded
    fn keystream(&mut self, n: usize) -> Vec<u32> {
        self.clock_fsm();
        self.clock_lfsr(0);
        (0..n)
            .map(|_| {
                let z = self.clock_fsm() ^ self.s[0];
                self.clock_lfsr(0);
                z
            })
            .collect()
    }
}

/// Key bytes as k3 || k2 || k1 || k0
fn key_words(key: &[u8; KEY_LEN]) -> [u32; 4] {
    let mut k = [0u32; 4];
    for (i, chunk) in key.chunks_exact(4).enumerate() {
        k[3 - i] = u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    k
}

/// f8: XOR the first `length` bits of `data` with keystream
///
/// Bits of the last byte past `length` are cleared. The caller guarantees
/// `data` holds at least `length` bits.
pub fn f8(
    key: &[u8; KEY_LEN],
    count: u32,
    bearer: u8,
    direction: Direction,
    data: &mut [u8],
    length: usize,
) {
    if length == 0 {
        return;
    }
    let word = (u32::from(bearer & 0x1f) << 27) | (u32::from(direction.bit()) << 26);
    let mut snow = Snow3g::new(key_words(key), [word, count, word, count]);

    let bytes = length.div_ceil(8);
    let keystream = snow.keystream(bytes.div_ceil(4));
    for (chunk, z) in data[..bytes].chunks_mut(4).zip(keystream) {
        for (byte, k) in chunk.iter_mut().zip(z.to_be_bytes()) {
            *byte ^= k;
        }
    }

    let tail = length % 8;
    if tail != 0 {
        data[bytes - 1] &= 0xffu8 << (8 - tail);
    }
}

/// MUL64x with the f9 reduction constant
fn mul64x(v: u64) -> u64 {
    if v & 0x8000_0000_0000_0000 != 0 {
        (v << 1) ^ 0x1b
    } else {
        v << 1
    }
}

fn mul64(mut v: u64, p: u64) -> u64 {
    let mut result = 0u64;
    for i in 0..64 {
        if (p >> i) & 1 == 1 {
            result ^= v;
        }
        v = mul64x(v);
    }
    result
}

/// 64-bit message block `index`, with bits past `length` cleared
fn message_block(data: &[u8], index: usize, length: usize) -> u64 {
    let start = index * 8;
    let end = (start + 8).min(data.len());
    let mut bytes = [0u8; 8];
    if start < end {
        bytes[..end - start].copy_from_slice(&data[start..end]);
    }
    let block = u64::from_be_bytes(bytes);
    let valid = length - index * 64;
    if valid < 64 {
        block & !(u64::MAX >> valid)
    } else {
        block
    }
}

/// f9: 32-bit MAC over the first `length` bits of `data`
pub fn f9(
    key: &[u8; KEY_LEN],
    count: u32,
    fresh: u32,
    direction: Direction,
    data: &[u8],
    length: usize,
) -> [u8; MAC_LEN] {
    let dir = u32::from(direction.bit());
    let iv = [fresh ^ (dir << 15), count ^ (dir << 31), fresh, count];
    let mut snow = Snow3g::new(key_words(key), iv);
    let z = snow.keystream(5);

    let p = (u64::from(z[0]) << 32) | u64::from(z[1]);
    let q = (u64::from(z[2]) << 32) | u64::from(z[3]);

    let mut eval = 0u64;
    for index in 0..length.div_ceil(64) {
        eval = mul64(eval ^ message_block(data, index, length), p);
    }
    eval ^= length as u64;
    eval = mul64(eval, q);

    (((eval >> 32) as u32) ^ z[4]).to_be_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: [u8; 16] = [
        0x2B, 0xD6, 0x45, 0x9F, 0x82, 0xC5, 0xB3, 0x00, 0x95, 0x2C, 0x49, 0x10, 0x48, 0x81, 0xFF,
        0x48,
    ];

    #[test]
    fn test_keystream_test_set_1() {
        let k = [0x2BD6459F, 0x82C5B300, 0x952C4910, 0x4881FF48];
        let iv = [0xEA024714, 0xAD5C4D84, 0xDF1F9B25, 0x1C0BF45F];
        let z = Snow3g::new(k, iv).keystream(2);
        assert_eq!(z, vec![0xABEE9704, 0x7AC31373]);
    }

    #[test]
    fn test_f8_test_set_1() {
        let plaintext: [u8; 100] = [
            0x7E, 0xC6, 0x12, 0x72, 0x74, 0x3B, 0xF1, 0x61, 0x47, 0x26, 0x44, 0x6A, 0x6C, 0x38,
            0xCE, 0xD1, 0x66, 0xF6, 0xCA, 0x76, 0xEB, 0x54, 0x30, 0x04, 0x42, 0x86, 0x34, 0x6C,
            0xEF, 0x13, 0x0F, 0x92, 0x92, 0x2B, 0x03, 0x45, 0x0D, 0x3A, 0x99, 0x75, 0xE5, 0xBD,
            0x2E, 0xA0, 0xEB, 0x55, 0xAD, 0x8E, 0x1B, 0x19, 0x9E, 0x3E, 0xC4, 0x31, 0x60, 0x20,
            0xE9, 0xA1, 0xB2, 0x85, 0xE7, 0x62, 0x79, 0x53, 0x59, 0xB7, 0xBD, 0xFD, 0x39, 0xBE,
            0xF4, 0xB2, 0x48, 0x45, 0x83, 0xD5, 0xAF, 0xE0, 0x82, 0xAE, 0xE6, 0x38, 0xBF, 0x5F,
            0xD5, 0xA6, 0x06, 0x19, 0x39, 0x01, 0xA0, 0x8F, 0x4A, 0xB4, 0x1A, 0xAB, 0x9B, 0x13,
            0x48, 0x80,
        ];
        let expected: [u8; 100] = [
            0x8C, 0xEB, 0xA6, 0x29, 0x43, 0xDC, 0xED, 0x3A, 0x09, 0x90, 0xB0, 0x6E, 0xA1, 0xB0,
            0xA2, 0xC4, 0xFB, 0x3C, 0xED, 0xC7, 0x1B, 0x36, 0x9F, 0x42, 0xBA, 0x64, 0xC1, 0xEB,
            0x66, 0x65, 0xE7, 0x2A, 0xA1, 0xC9, 0xBB, 0x0D, 0xEA, 0xA2, 0x0F, 0xE8, 0x60, 0x58,
            0xB8, 0xBA, 0xEE, 0x2C, 0x2E, 0x7F, 0x0B, 0xEC, 0xCE, 0x48, 0xB5, 0x29, 0x32, 0xA5,
            0x3C, 0x9D, 0x5F, 0x93, 0x1A, 0x3A, 0x7C, 0x53, 0x22, 0x59, 0xAF, 0x43, 0x25, 0xE2,
            0xA6, 0x5E, 0x30, 0x84, 0xAD, 0x5F, 0x6A, 0x51, 0x3B, 0x7B, 0xDD, 0xC1, 0xB6, 0x5F,
            0x0A, 0xA0, 0xD9, 0x7A, 0x05, 0x3D, 0xB5, 0x5A, 0x88, 0xC4, 0xC4, 0xF9, 0x60, 0x5E,
            0x41, 0x40,
        ];

        let mut data = plaintext;
        f8(&KEY, 0x72A4F20F, 0x0C, Direction::Downlink, &mut data, 798);
        assert_eq!(data, expected);
    }

    #[test]
    fn test_f9_eia1_test_set_1() {
        let message = [0x33, 0x32, 0x34, 0x62, 0x63, 0x39, 0x38, 0x61, 0x37, 0x34, 0x79];
        let mac = f9(&KEY, 0x38A6F056, 0x1F << 27, Direction::Uplink, &message, 88);
        assert_eq!(mac, [0x73, 0x1F, 0x11, 0x65]);
    }

    #[test]
    fn test_f9_ignores_bits_past_length() {
        let a = [0xA5, 0xF0];
        let b = [0xA5, 0xFF];
        assert_eq!(
            f9(&KEY, 1, 0, Direction::Downlink, &a, 12),
            f9(&KEY, 1, 0, Direction::Downlink, &b, 12)
        );
        assert_ne!(
            f9(&KEY, 1, 0, Direction::Downlink, &a, 16),
            f9(&KEY, 1, 0, Direction::Downlink, &b, 16)
        );
    }

    #[test]
    fn test_f8_clears_trailing_bits() {
        let mut data = [0xFF, 0xFF];
        f8(&KEY, 0x72A4F20F, 0x0C, Direction::Downlink, &mut data, 13);
        assert_eq!(data[1] & 0x07, 0);
    }

    #[test]
    fn test_mul_x() {
        assert_eq!(mul_x(0x40, 0x1b), 0x80);
        assert_eq!(mul_x(0x81, 0x1b), 0x1b ^ 0x02);
        assert_eq!(mul_x_pow(0x42, 0, 0x1b), 0x42);
    }
}

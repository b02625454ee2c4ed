//! AMF core cryptographic library
//!
//! Provides the 3GPP algorithms the AMF needs to run 5G AKA and protect NAS
//! signalling: Milenage (TS 35.206), the TS 33.501 Annex A key hierarchy and
//! the NAS ciphering/integrity algorithm families NEA and NIA.

pub mod error;      // CryptError
pub mod milenage;   // 3GPP Milenage f1..f5*
pub mod kdf;        // TS 33.220 / TS 33.501 key derivation
pub mod snow3g;     // SNOW 3G f8/f9
pub mod nea;        // NAS ciphering (NEA0..NEA3)
pub mod nia;        // NAS integrity (NIA0..NIA3)

#[cfg(test)]
mod property_tests;

pub use error::CryptError;

/// 128-bit key length
pub const KEY_LEN: usize = 16;
/// RAND length
pub const RAND_LEN: usize = 16;
/// SQN length (48 bits)
pub const SQN_LEN: usize = 6;
/// AMF (authentication management field) length
pub const AMF_LEN: usize = 2;
/// AUTN length
pub const AUTN_LEN: usize = 16;
/// AUTS length
pub const AUTS_LEN: usize = 14;
/// RES length produced by Milenage f2
pub const RES_LEN: usize = 8;
/// 256-bit key length (Kausf, Kseaf, Kamf, KgNB, NH)
pub const KEY256_LEN: usize = 32;
/// NAS MAC length
pub const MAC_LEN: usize = 4;

/// Transmission direction used as algorithm input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Uplink = 0,
    Downlink = 1,
}

impl Direction {
    /// Direction bit as defined by TS 33.501
    pub fn bit(self) -> u8 {
        self as u8
    }
}

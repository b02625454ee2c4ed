//! 3GPP Milenage algorithm set (TS 35.206)
//!
//! A [`Milenage`] instance binds one subscriber key K and operator constant
//! OPc. All functions share the TEMP = E_K(RAND ^ OPc) step, so callers that
//! need several outputs for one RAND should use [`Milenage::f2345`] or
//! [`Milenage::generate`] rather than calling the functions piecemeal.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;

use crate::{CryptError, AMF_LEN, AUTN_LEN, AUTS_LEN, KEY_LEN, RAND_LEN, RES_LEN, SQN_LEN};

// Rotation amounts (in bytes) and constants of TS 35.206 clause 4.1.
const R1: usize = 8;
const R2: usize = 0;
const R3: usize = 4;
const R4: usize = 8;
const R5: usize = 12;
const C2: u8 = 1;
const C3: u8 = 2;
const C4: u8 = 4;
const C5: u8 = 8;

/// AMF value used for re-synchronisation (TS 33.102 6.3.3)
pub const RESYNC_AMF: [u8; AMF_LEN] = [0x00, 0x00];

/// Output of f2, f3, f4, f5 and f5* for one RAND
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct F2345 {
    pub res: [u8; RES_LEN],
    pub ck: [u8; KEY_LEN],
    pub ik: [u8; KEY_LEN],
    pub ak: [u8; SQN_LEN],
    pub ak_star: [u8; SQN_LEN],
}

/// A complete UMTS authentication vector
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthVector {
    pub rand: [u8; RAND_LEN],
    pub autn: [u8; AUTN_LEN],
    pub res: [u8; RES_LEN],
    pub ck: [u8; KEY_LEN],
    pub ik: [u8; KEY_LEN],
    pub ak: [u8; SQN_LEN],
}

/// Milenage bound to a subscriber key and OPc
#[derive(Clone)]
pub struct Milenage {
    cipher: Aes128,
    opc: [u8; KEY_LEN],
}

impl std::fmt::Debug for Milenage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Milenage").finish_non_exhaustive()
    }
}

impl Milenage {
    /// Create from K and OPc
    pub fn new(k: &[u8; KEY_LEN], opc: &[u8; KEY_LEN]) -> Self {
        Self {
            cipher: Aes128::new(GenericArray::from_slice(k)),
            opc: *opc,
        }
    }

    /// Create from K and OP, computing OPc
    pub fn with_op(k: &[u8; KEY_LEN], op: &[u8; KEY_LEN]) -> Self {
        let cipher = Aes128::new(GenericArray::from_slice(k));
        let mut opc = encrypt_block(&cipher, op);
        xor_in_place(&mut opc, op);
        Self { cipher, opc }
    }

    /// OPc = E_K(OP) ^ OP
    pub fn opc(&self) -> &[u8; KEY_LEN] {
        &self.opc
    }

    fn encrypt(&self, block: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
        encrypt_block(&self.cipher, block)
    }

    fn temp(&self, rand: &[u8; RAND_LEN]) -> [u8; KEY_LEN] {
        let mut input = *rand;
        xor_in_place(&mut input, &self.opc);
        self.encrypt(&input)
    }

    /// OUTk = E_K(rot(TEMP ^ OPc, rk) ^ ck) ^ OPc
    fn out(&self, temp: &[u8; KEY_LEN], rot: usize, c: u8) -> [u8; KEY_LEN] {
        let mut input = [0u8; KEY_LEN];
        for (i, byte) in input.iter_mut().enumerate() {
            let j = (i + rot) % KEY_LEN;
            *byte = temp[j] ^ self.opc[j];
        }
        input[KEY_LEN - 1] ^= c;
        let mut out = self.encrypt(&input);
        xor_in_place(&mut out, &self.opc);
        out
    }

    /// f1 and f1*: network and re-synchronisation authentication codes
    ///
    /// Returns `(MAC-A, MAC-S)`.
    pub fn f1(
        &self,
        rand: &[u8; RAND_LEN],
        sqn: &[u8; SQN_LEN],
        amf: &[u8; AMF_LEN],
    ) -> ([u8; 8], [u8; 8]) {
        let temp = self.temp(rand);

        // IN1 = SQN || AMF || SQN || AMF
        let mut in1 = [0u8; KEY_LEN];
        in1[0..6].copy_from_slice(sqn);
        in1[6..8].copy_from_slice(amf);
        in1[8..14].copy_from_slice(sqn);
        in1[14..16].copy_from_slice(amf);

        // OUT1 = E_K(TEMP ^ rot(IN1 ^ OPc, r1) ^ c1) ^ OPc, with c1 = 0
        let mut input = [0u8; KEY_LEN];
        for (i, byte) in input.iter_mut().enumerate() {
            let j = (i + R1) % KEY_LEN;
            *byte = temp[i] ^ in1[j] ^ self.opc[j];
        }
        let mut out1 = self.encrypt(&input);
        xor_in_place(&mut out1, &self.opc);

        let mut mac_a = [0u8; 8];
        let mut mac_s = [0u8; 8];
        mac_a.copy_from_slice(&out1[0..8]);
        mac_s.copy_from_slice(&out1[8..16]);
        (mac_a, mac_s)
    }

    /// f2 (RES), f3 (CK), f4 (IK), f5 (AK) and f5* (AK for resync)
    pub fn f2345(&self, rand: &[u8; RAND_LEN]) -> F2345 {
        let temp = self.temp(rand);

        let out2 = self.out(&temp, R2, C2);
        let out3 = self.out(&temp, R3, C3);
        let out4 = self.out(&temp, R4, C4);
        let out5 = self.out(&temp, R5, C5);

        let mut res = [0u8; RES_LEN];
        let mut ak = [0u8; SQN_LEN];
        let mut ak_star = [0u8; SQN_LEN];
        res.copy_from_slice(&out2[8..16]);
        ak.copy_from_slice(&out2[0..6]);
        ak_star.copy_from_slice(&out5[0..6]);

        F2345 {
            res,
            ck: out3,
            ik: out4,
            ak,
            ak_star,
        }
    }

    /// Build an authentication vector: AUTN = (SQN ^ AK) || AMF || MAC-A
    pub fn generate(
        &self,
        rand: &[u8; RAND_LEN],
        sqn: &[u8; SQN_LEN],
        amf: &[u8; AMF_LEN],
    ) -> AuthVector {
        let (mac_a, _) = self.f1(rand, sqn, amf);
        let out = self.f2345(rand);

        let mut autn = [0u8; AUTN_LEN];
        for i in 0..SQN_LEN {
            autn[i] = sqn[i] ^ out.ak[i];
        }
        autn[6..8].copy_from_slice(amf);
        autn[8..16].copy_from_slice(&mac_a);

        AuthVector {
            rand: *rand,
            autn,
            res: out.res,
            ck: out.ck,
            ik: out.ik,
            ak: out.ak,
        }
    }

    /// Recover SQN_MS from AUTS = (SQN_MS ^ AK*) || MAC-S and verify MAC-S
    pub fn resync(&self, rand: &[u8; RAND_LEN], auts: &[u8]) -> Result<[u8; SQN_LEN], CryptError> {
        if auts.len() != AUTS_LEN {
            return Err(CryptError::InvalidLength {
                what: "AUTS",
                expected: AUTS_LEN,
                actual: auts.len(),
            });
        }

        let out = self.f2345(rand);
        let mut sqn_ms = [0u8; SQN_LEN];
        for i in 0..SQN_LEN {
            sqn_ms[i] = auts[i] ^ out.ak_star[i];
        }

        let (_, mac_s) = self.f1(rand, &sqn_ms, &RESYNC_AMF);
        if mac_s[..] != auts[SQN_LEN..] {
            log::debug!("AUTS MAC-S mismatch");
            return Err(CryptError::MacSMismatch);
        }
        Ok(sqn_ms)
    }

    /// Build AUTS for `sqn_ms`, as a UE would on synch failure
    pub fn auts(&self, rand: &[u8; RAND_LEN], sqn_ms: &[u8; SQN_LEN]) -> [u8; AUTS_LEN] {
        let out = self.f2345(rand);
        let (_, mac_s) = self.f1(rand, sqn_ms, &RESYNC_AMF);
        let mut auts = [0u8; AUTS_LEN];
        for i in 0..SQN_LEN {
            auts[i] = sqn_ms[i] ^ out.ak_star[i];
        }
        auts[SQN_LEN..].copy_from_slice(&mac_s);
        auts
    }
}

fn encrypt_block(cipher: &Aes128, input: &[u8; KEY_LEN]) -> [u8; KEY_LEN] {
    let mut block = GenericArray::clone_from_slice(input);
    cipher.encrypt_block(&mut block);
    let mut out = [0u8; KEY_LEN];
    out.copy_from_slice(&block);
    out
}

fn xor_in_place(dst: &mut [u8; KEY_LEN], src: &[u8; KEY_LEN]) {
    for (d, s) in dst.iter_mut().zip(src.iter()) {
        *d ^= s;
    }
}

/// SQN as a 48-bit integer
pub fn sqn_to_u64(sqn: &[u8; SQN_LEN]) -> u64 {
    sqn.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

/// 48-bit integer as SQN
pub fn sqn_from_u64(value: u64) -> [u8; SQN_LEN] {
    let bytes = value.to_be_bytes();
    let mut sqn = [0u8; SQN_LEN];
    sqn.copy_from_slice(&bytes[2..8]);
    sqn
}

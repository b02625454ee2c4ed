//! 5G AKA authentication vectors
//!
//! In `local` mode vectors are generated here from the configured subscriber
//! credentials with Milenage and the TS 33.501 key chain. In `external` mode
//! the authentication service supplies them through the peer NF client and
//! RES* is confirmed there.

use std::collections::HashMap;
use std::sync::Mutex;

use rand::RngCore;
use thiserror::Error;

use amfcore_crypt::kdf;
use amfcore_crypt::milenage::{sqn_from_u64, sqn_to_u64, Milenage};
use amfcore_crypt::{CryptError, KEY256_LEN, KEY_LEN, RAND_LEN, SQN_LEN};

use crate::config::{AmfConfig, ConfigError};
use crate::types::Supi;

/// SQN increment between two generated vectors (IND is 5 bits)
pub const SQN_STEP: u64 = 32;

/// Largest 48-bit SQN
const SQN_MAX: u64 = 0xffff_ffff_ffff;

/// One 5G home-environment authentication vector as held by the AMF
#[derive(Clone, PartialEq, Eq)]
pub struct HeAuthVector {
    pub rand: [u8; RAND_LEN],
    pub autn: [u8; 16],
    pub hxres_star: [u8; KEY_LEN],
    /// Known only for locally generated vectors
    pub xres_star: Option<[u8; KEY_LEN]>,
    /// Known only for locally generated vectors
    pub kseaf: Option<[u8; KEY256_LEN]>,
    /// Confirmation resource of the authentication service
    pub confirmation: Option<String>,
}

impl std::fmt::Debug for HeAuthVector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeAuthVector")
            .field("rand", &hex::encode(self.rand))
            .field("confirmation", &self.confirmation)
            .finish_non_exhaustive()
    }
}

impl HeAuthVector {
    /// Check RES* against the stored HXRES*
    pub fn verify_res_star(&self, res_star: &[u8; KEY_LEN]) -> bool {
        kdf::hxres_star(&self.rand, res_star) == self.hxres_star
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no credentials for {0}")]
    UnknownSubscriber(Supi),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Crypt(#[from] CryptError),
}

struct Credentials {
    milenage: Milenage,
    amf: [u8; 2],
    sqn: u64,
}

/// Local authentication vector generator
pub struct LocalAuthenticator {
    subscribers: Mutex<HashMap<Supi, Credentials>>,
}

impl std::fmt::Debug for LocalAuthenticator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let n = self.subscribers.lock().map(|s| s.len()).unwrap_or(0);
        f.debug_struct("LocalAuthenticator")
            .field("subscribers", &n)
            .finish()
    }
}

impl LocalAuthenticator {
    pub fn from_config(config: &AmfConfig) -> Result<Self, ConfigError> {
        let mut subscribers = HashMap::new();
        for subscriber in &config.subscribers {
            let keys = subscriber.keys()?;
            subscribers.insert(
                subscriber.supi.clone(),
                Credentials {
                    milenage: Milenage::new(&keys.k, &keys.opc),
                    amf: keys.amf,
                    sqn: sqn_to_u64(&keys.sqn),
                },
            );
        }
        Ok(Self {
            subscribers: Mutex::new(subscribers),
        })
    }

    pub fn knows(&self, supi: &Supi) -> bool {
        self.subscribers
            .lock()
            .map(|s| s.contains_key(supi))
            .unwrap_or(false)
    }

    /// Generate a fresh vector and advance the subscriber's SQN
    pub fn generate(
        &self,
        supi: &Supi,
        serving_network_name: &str,
    ) -> Result<HeAuthVector, AuthError> {
        let mut rand = [0u8; RAND_LEN];
        rand::thread_rng().fill_bytes(&mut rand);

        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        let creds = subscribers
            .get_mut(supi)
            .ok_or_else(|| AuthError::UnknownSubscriber(supi.clone()))?;

        let sqn = sqn_from_u64(creds.sqn);
        let av = creds.milenage.generate(&rand, &sqn, &creds.amf);
        creds.sqn = (creds.sqn + SQN_STEP) & SQN_MAX;

        let mut sqn_xor_ak = [0u8; SQN_LEN];
        sqn_xor_ak.copy_from_slice(&av.autn[..SQN_LEN]);
        let kausf = kdf::kausf(&av.ck, &av.ik, serving_network_name, &sqn_xor_ak);
        let xres_star = kdf::res_star(&av.ck, &av.ik, serving_network_name, &rand, &av.res);

        log::debug!("[{}] authentication vector generated (sqn={:#x})", supi, sqn_to_u64(&sqn));
        Ok(HeAuthVector {
            rand,
            autn: av.autn,
            hxres_star: kdf::hxres_star(&rand, &xres_star),
            xres_star: Some(xres_star),
            kseaf: Some(kdf::kseaf(serving_network_name, &kausf)),
            confirmation: None,
        })
    }

    /// Re-synchronise the SQN from an AUTS reported with synch failure
    ///
    /// The next vector uses SQN_MS + one step.
    pub fn resync(
        &self,
        supi: &Supi,
        rand: &[u8; RAND_LEN],
        auts: &[u8],
    ) -> Result<(), AuthError> {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        let creds = subscribers
            .get_mut(supi)
            .ok_or_else(|| AuthError::UnknownSubscriber(supi.clone()))?;
        let sqn_ms = sqn_to_u64(&creds.milenage.resync(rand, auts)?);
        creds.sqn = (sqn_ms + SQN_STEP) & SQN_MAX;
        log::info!("[{}] SQN re-synchronised to {:#x}", supi, creds.sqn);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SubscriberConfig;

    const K: &str = "465b5ce8b199b49faa5f0a2ee238a6bc";
    const OPC: &str = "cd63cb71954a9f4e48a5994e37a02baf";

    fn config(supi: &Supi) -> AmfConfig {
        AmfConfig {
            subscribers: vec![SubscriberConfig {
                supi: supi.clone(),
                k: K.into(),
                opc: OPC.into(),
                amf: "8000".into(),
                sqn: 0x20,
                slices: Vec::new(),
            }],
            ..AmfConfig::default()
        }
    }

    fn ue_res_star(rand: &[u8; 16], snn: &str) -> [u8; 16] {
        let k: [u8; 16] = hex::decode(K).unwrap().try_into().unwrap();
        let opc: [u8; 16] = hex::decode(OPC).unwrap().try_into().unwrap();
        let out = Milenage::new(&k, &opc).f2345(rand);
        kdf::res_star(&out.ck, &out.ik, snn, rand, &out.res)
    }

    #[test]
    fn test_generate_and_verify() {
        let supi = Supi::from_imsi("001010000000001");
        let auth = LocalAuthenticator::from_config(&config(&supi)).unwrap();
        let snn = "5G:mnc001.mcc001.3gppnetwork.org";
        let av = auth.generate(&supi, snn).unwrap();

        let res_star = ue_res_star(&av.rand, snn);
        assert_eq!(Some(res_star), av.xres_star);
        assert!(av.verify_res_star(&res_star));
        assert!(!av.verify_res_star(&[0u8; 16]));
        assert!(av.kseaf.is_some());
    }

    #[test]
    fn test_unknown_subscriber() {
        let auth = LocalAuthenticator::from_config(&AmfConfig::default()).unwrap();
        let supi = Supi::from_imsi("001019999999999");
        assert!(!auth.knows(&supi));
        assert!(matches!(
            auth.generate(&supi, "5G:mnc001.mcc001.3gppnetwork.org"),
            Err(AuthError::UnknownSubscriber(_))
        ));
    }

    #[test]
    fn test_resync_moves_sqn() {
        let supi = Supi::from_imsi("001010000000001");
        let auth = LocalAuthenticator::from_config(&config(&supi)).unwrap();
        let k: [u8; 16] = hex::decode(K).unwrap().try_into().unwrap();
        let opc: [u8; 16] = hex::decode(OPC).unwrap().try_into().unwrap();
        let ue = Milenage::new(&k, &opc);

        let rand = [0x11u8; 16];
        let sqn_ms = sqn_from_u64(0x1000);
        let auts = ue.auts(&rand, &sqn_ms);
        auth.resync(&supi, &rand, &auts).unwrap();

        let av = auth
            .generate(&supi, "5G:mnc001.mcc001.3gppnetwork.org")
            .unwrap();
        let out = ue.f2345(&av.rand);
        let mut sqn = [0u8; 6];
        for i in 0..6 {
            sqn[i] = av.autn[i] ^ out.ak[i];
        }
        assert_eq!(sqn_to_u64(&sqn), 0x1000 + SQN_STEP);
    }

    #[test]
    fn test_resync_rejects_bad_auts() {
        let supi = Supi::from_imsi("001010000000001");
        let auth = LocalAuthenticator::from_config(&config(&supi)).unwrap();
        assert!(auth.resync(&supi, &[0u8; 16], &[0u8; 14]).is_err());
    }
}

//! Identifiers and value types shared by every AMF task

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use serde::{Deserialize, Deserializer, Serialize};

// ============================================================================
// Subscriber identifiers
// ============================================================================

/// AMF-UE-NGAP-ID, assigned by this AMF
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AmfUeId(pub u64);

/// RAN-UE-NGAP-ID, assigned by the radio node and unique per association
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RanUeId(pub u64);

/// SCTP association carrying one radio node's NGAP signalling
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AssocId(pub u32);

impl fmt::Display for AmfUeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RanUeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for AssocId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Permanent subscriber identity (`imsi-<digits>`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Supi(String);

impl Supi {
    /// SUPI from IMSI digits
    pub fn from_imsi(imsi: &str) -> Self {
        Self(format!("imsi-{}", imsi))
    }

    /// Parse a SUPI string; only the `imsi-` type is accepted
    pub fn parse(s: &str) -> Option<Self> {
        let digits = s.strip_prefix("imsi-")?;
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        Some(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// IMSI digits without the type prefix
    pub fn imsi(&self) -> &str {
        self.0.strip_prefix("imsi-").unwrap_or(&self.0)
    }
}

impl fmt::Display for Supi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Composite key used by the UE context registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UeContextKey {
    pub ran_ue_id: RanUeId,
    pub amf_ue_id: AmfUeId,
}

impl UeContextKey {
    pub fn new(ran_ue_id: RanUeId, amf_ue_id: AmfUeId) -> Self {
        Self {
            ran_ue_id,
            amf_ue_id,
        }
    }
}

impl fmt::Display for UeContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "app_ue_ranid_{}:amfid_{}", self.ran_ue_id, self.amf_ue_id)
    }
}

// ============================================================================
// Network identities
// ============================================================================

fn digits<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Digits {
        Text(String),
        Number(u64),
    }
    Ok(match Digits::deserialize(deserializer)? {
        Digits::Text(s) => s,
        Digits::Number(n) => n.to_string(),
    })
}

/// PLMN identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Plmn {
    #[serde(deserialize_with = "digits")]
    pub mcc: String,
    #[serde(deserialize_with = "digits")]
    pub mnc: String,
}

impl Plmn {
    pub fn new(mcc: &str, mnc: &str) -> Self {
        Self {
            mcc: mcc.to_string(),
            mnc: mnc.to_string(),
        }
    }

    /// Serving network name used as KDF input
    pub fn serving_network_name(&self) -> String {
        amfcore_crypt::kdf::serving_network_name(&self.mcc, &self.mnc)
    }
}

impl fmt::Display for Plmn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.mcc, self.mnc)
    }
}

/// Single network slice selection assistance information
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Snssai {
    pub sst: u8,
    #[serde(default)]
    pub sd: Option<u32>,
}

impl Snssai {
    pub fn new(sst: u8, sd: Option<u32>) -> Self {
        Self { sst, sd }
    }
}

impl fmt::Display for Snssai {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.sd {
            Some(sd) => write!(f, "{}-{:06x}", self.sst, sd),
            None => write!(f, "{}", self.sst),
        }
    }
}

/// Tracking area identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tai {
    pub plmn: Plmn,
    pub tac: u32,
}

impl fmt::Display for Tai {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:06x}", self.plmn, self.tac)
    }
}

/// NR cell global identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NrCgi {
    pub plmn: Plmn,
    pub cell_id: u64,
}

/// PLMN with the slices served in it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlmnSupport {
    pub plmn: Plmn,
    pub slices: Vec<Snssai>,
}

/// Globally unique AMF identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Guami {
    pub plmn: Plmn,
    pub region_id: u8,
    pub set_id: u16,
    pub pointer: u8,
}

/// 5G-S-TMSI as carried in Initial UE Message, Service Request and Paging
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct STmsi {
    pub set_id: u16,
    pub pointer: u8,
    pub tmsi: u32,
}

/// 5G globally unique temporary identity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Guti {
    pub plmn: Plmn,
    pub region_id: u8,
    pub set_id: u16,
    pub pointer: u8,
    pub tmsi: u32,
}

impl Guti {
    pub fn new(guami: &Guami, tmsi: u32) -> Self {
        Self {
            plmn: guami.plmn.clone(),
            region_id: guami.region_id,
            set_id: guami.set_id,
            pointer: guami.pointer,
            tmsi,
        }
    }

    /// Rebuild a GUTI from an S-TMSI and the serving AMF's GUAMI
    pub fn from_s_tmsi(guami: &Guami, s_tmsi: &STmsi) -> Self {
        Self {
            plmn: guami.plmn.clone(),
            region_id: guami.region_id,
            set_id: s_tmsi.set_id,
            pointer: s_tmsi.pointer,
            tmsi: s_tmsi.tmsi,
        }
    }

    pub fn s_tmsi(&self) -> STmsi {
        STmsi {
            set_id: self.set_id,
            pointer: self.pointer,
            tmsi: self.tmsi,
        }
    }
}

impl fmt::Display for Guti {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{:02x}{:03x}{:02x}{:08x}",
            self.plmn.mcc, self.plmn.mnc, self.region_id, self.set_id, self.pointer, self.tmsi
        )
    }
}

/// RRC establishment cause reported in Initial UE Message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RrcEstablishmentCause {
    Emergency,
    HighPriorityAccess,
    MtAccess,
    #[default]
    MoSignalling,
    MoData,
    MoVoiceCall,
    MoVideoCall,
    MoSms,
    MpsPriorityAccess,
    McsPriorityAccess,
}

// ============================================================================
// Identifier generators
// ============================================================================

/// Event subscription identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

/// Correlation id of an outstanding peer request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PromiseId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PromiseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-wide monotonic generators, owned by the AMF context
#[derive(Debug)]
pub struct IdGenerators {
    amf_ue_id: AtomicU64,
    tmsi: AtomicU32,
    subscription: AtomicU64,
    promise: AtomicU64,
}

impl Default for IdGenerators {
    fn default() -> Self {
        Self::new()
    }
}

impl IdGenerators {
    pub fn new() -> Self {
        Self {
            amf_ue_id: AtomicU64::new(1),
            tmsi: AtomicU32::new(1),
            subscription: AtomicU64::new(1),
            promise: AtomicU64::new(1),
        }
    }

    /// Next AMF-UE-NGAP-ID (first value is 1)
    pub fn next_amf_ue_id(&self) -> AmfUeId {
        AmfUeId(self.amf_ue_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Next 5G-TMSI
    pub fn next_tmsi(&self) -> u32 {
        self.tmsi.fetch_add(1, Ordering::Relaxed)
    }

    pub fn next_subscription_id(&self) -> SubscriptionId {
        SubscriptionId(self.subscription.fetch_add(1, Ordering::Relaxed))
    }

    pub fn next_promise_id(&self) -> PromiseId {
        PromiseId(self.promise.fetch_add(1, Ordering::Relaxed))
    }
}

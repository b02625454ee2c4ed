//! AMF configuration
//!
//! Loaded from the `amf:` section of a YAML file. A missing file falls back
//! to the built-in defaults; malformed YAML or an unusable configuration is a
//! startup error.

use std::path::Path;
use std::time::Duration;

use amfcore_crypt::milenage::sqn_from_u64;
use amfcore_crypt::nea::CipheringAlgorithm;
use amfcore_crypt::nia::IntegrityAlgorithm;
use amfcore_crypt::KEY_LEN;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{Guami, Plmn, PlmnSupport, Snssai, Supi, Tai};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("configuration is locked while {0} radio node(s) are attached")]
    RadioNodesAttached(usize),
}

// ============================================================================
// Sections
// ============================================================================

/// NAS algorithm preference order, strongest first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub integrity_order: Vec<String>,
    pub ciphering_order: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            integrity_order: vec!["NIA2".into(), "NIA1".into(), "NIA0".into()],
            ciphering_order: vec!["NEA0".into(), "NEA1".into(), "NEA2".into()],
        }
    }
}

/// Network names sent to the UE
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkName {
    pub full: String,
    pub short: String,
}

impl Default for NetworkName {
    fn default() -> Self {
        Self {
            full: "amfcore".into(),
            short: "amfcore".into(),
        }
    }
}

/// Timer values
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    /// Mobile reachable timer (seconds)
    pub mobile_reachable: u64,
    /// Implicit de-registration timer (seconds)
    pub implicit_deregistration: u64,
    /// Bound on a single peer network function reply (milliseconds)
    pub peer_response_ms: u64,
    /// Bound on the per-session replies of one handover step (milliseconds)
    pub handover_wait_ms: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            // T3512 (54 min) + 4 min
            mobile_reachable: 58 * 60,
            implicit_deregistration: 4 * 60,
            peer_response_ms: 1000,
            handover_wait_ms: 1000,
        }
    }
}

impl TimerConfig {
    pub fn mobile_reachable(&self) -> Duration {
        Duration::from_secs(self.mobile_reachable)
    }

    pub fn implicit_deregistration(&self) -> Duration {
        Duration::from_secs(self.implicit_deregistration)
    }

    pub fn peer_response(&self) -> Duration {
        Duration::from_millis(self.peer_response_ms)
    }

    pub fn handover_wait(&self) -> Duration {
        Duration::from_millis(self.handover_wait_ms)
    }
}

/// Where authentication vectors come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthenticationMode {
    /// Generated here from the configured subscriber list
    #[default]
    Local,
    /// Delegated to the authentication service
    External,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthenticationConfig {
    pub mode: AuthenticationMode,
}

/// Subscriber credentials for local vector generation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberConfig {
    pub supi: Supi,
    /// K, 32 hex digits
    pub k: String,
    /// OPc, 32 hex digits
    pub opc: String,
    /// Authentication management field, 4 hex digits
    #[serde(default = "default_amf_field")]
    pub amf: String,
    /// Next sequence number to use
    #[serde(default)]
    pub sqn: u64,
    /// Subscribed slices; empty means every configured slice
    #[serde(default)]
    pub slices: Vec<Snssai>,
}

fn default_amf_field() -> String {
    "8000".into()
}

/// Decoded subscriber credentials
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberKeys {
    pub k: [u8; KEY_LEN],
    pub opc: [u8; KEY_LEN],
    pub amf: [u8; 2],
    pub sqn: [u8; 6],
}

impl SubscriberConfig {
    pub fn keys(&self) -> Result<SubscriberKeys, ConfigError> {
        Ok(SubscriberKeys {
            k: hex_array(&self.k, "k")?,
            opc: hex_array(&self.opc, "opc")?,
            amf: hex_array(&self.amf, "amf")?,
            sqn: sqn_from_u64(self.sqn),
        })
    }
}

fn hex_array<const N: usize>(value: &str, what: &str) -> Result<[u8; N], ConfigError> {
    let bytes = hex::decode(value)
        .map_err(|e| ConfigError::Invalid(format!("{}: {}", what, e)))?;
    bytes.try_into().map_err(|b: Vec<u8>| {
        ConfigError::Invalid(format!("{}: expected {} bytes, got {}", what, N, b.len()))
    })
}

// ============================================================================
// AmfConfig
// ============================================================================

/// Runtime configuration of this AMF
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AmfConfig {
    pub amf_name: String,
    pub relative_capacity: u8,
    pub guami: Vec<Guami>,
    pub tai: Vec<Tai>,
    pub plmn_support: Vec<PlmnSupport>,
    pub security: SecurityConfig,
    pub network_name: NetworkName,
    pub timers: TimerConfig,
    pub authentication: AuthenticationConfig,
    pub subscribers: Vec<SubscriberConfig>,
}

impl Default for AmfConfig {
    fn default() -> Self {
        let plmn = Plmn::new("001", "01");
        Self {
            amf_name: "amfcore-amf".into(),
            relative_capacity: 255,
            guami: vec![Guami {
                plmn: plmn.clone(),
                region_id: 0x80,
                set_id: 0x004,
                pointer: 0x01,
            }],
            tai: vec![Tai {
                plmn: plmn.clone(),
                tac: 1,
            }],
            plmn_support: vec![PlmnSupport {
                plmn,
                slices: vec![Snssai::new(1, None)],
            }],
            security: SecurityConfig::default(),
            network_name: NetworkName::default(),
            timers: TimerConfig::default(),
            authentication: AuthenticationConfig::default(),
            subscribers: Vec::new(),
        }
    }
}

#[derive(Deserialize)]
struct ConfigFile {
    amf: Option<AmfConfig>,
}

impl AmfConfig {
    /// Load from a YAML file, falling back to defaults if it does not exist
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::warn!(
                    "Could not read config file '{}': {}. Using defaults.",
                    path.display(),
                    e
                );
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        Self::from_yaml(&content)
    }

    /// Parse and validate a YAML document
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = serde_yaml::from_str(content)?;
        let config = match file.amf {
            Some(config) => config,
            None => {
                log::warn!("No 'amf' section in config file");
                Self::default()
            }
        };
        config.validate()?;
        log::info!(
            "AMF configuration loaded: {} GUAMI, {} TAI, {} PLMN support, {} subscribers",
            config.guami.len(),
            config.tai.len(),
            config.plmn_support.len(),
            config.subscribers.len()
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.guami.is_empty() {
            return Err(ConfigError::Invalid("no GUAMI configured".into()));
        }
        if self.plmn_support.is_empty() {
            return Err(ConfigError::Invalid("no PLMN support configured".into()));
        }
        self.integrity_order()?;
        self.ciphering_order()?;
        for subscriber in &self.subscribers {
            if Supi::parse(subscriber.supi.as_str()).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "bad SUPI '{}'",
                    subscriber.supi
                )));
            }
            subscriber.keys()?;
        }
        Ok(())
    }

    /// Serving GUAMI (the first configured one)
    pub fn serving_guami(&self) -> Option<&Guami> {
        self.guami.first()
    }

    /// Configured integrity algorithms, strongest first
    pub fn integrity_order(&self) -> Result<Vec<IntegrityAlgorithm>, ConfigError> {
        self.security
            .integrity_order
            .iter()
            .map(|name| {
                parse_integrity_algorithm(name).ok_or_else(|| {
                    ConfigError::Invalid(format!("unknown integrity algorithm '{}'", name))
                })
            })
            .collect()
    }

    /// Configured ciphering algorithms, strongest first
    pub fn ciphering_order(&self) -> Result<Vec<CipheringAlgorithm>, ConfigError> {
        self.security
            .ciphering_order
            .iter()
            .map(|name| {
                parse_ciphering_algorithm(name).ok_or_else(|| {
                    ConfigError::Invalid(format!("unknown ciphering algorithm '{}'", name))
                })
            })
            .collect()
    }

    /// Slices served for a PLMN
    pub fn slices_for(&self, plmn: &Plmn) -> Vec<Snssai> {
        self.plmn_support
            .iter()
            .filter(|support| &support.plmn == plmn)
            .flat_map(|support| support.slices.iter().copied())
            .collect()
    }

    pub fn subscriber(&self, supi: &Supi) -> Option<&SubscriberConfig> {
        self.subscribers.iter().find(|s| &s.supi == supi)
    }
}

/// Parse integrity algorithm name
pub fn parse_integrity_algorithm(name: &str) -> Option<IntegrityAlgorithm> {
    match name.to_uppercase().as_str() {
        "NIA0" => Some(IntegrityAlgorithm::Nia0),
        "NIA1" | "128-NIA1" => Some(IntegrityAlgorithm::Nia1),
        "NIA2" | "128-NIA2" => Some(IntegrityAlgorithm::Nia2),
        "NIA3" | "128-NIA3" => Some(IntegrityAlgorithm::Nia3),
        _ => None,
    }
}

/// Parse ciphering algorithm name
pub fn parse_ciphering_algorithm(name: &str) -> Option<CipheringAlgorithm> {
    match name.to_uppercase().as_str() {
        "NEA0" => Some(CipheringAlgorithm::Nea0),
        "NEA1" | "128-NEA1" => Some(CipheringAlgorithm::Nea1),
        "NEA2" | "128-NEA2" => Some(CipheringAlgorithm::Nea2),
        "NEA3" | "128-NEA3" => Some(CipheringAlgorithm::Nea3),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
amf:
  amf_name: amf-test
  relative_capacity: 10
  guami:
    - plmn: { mcc: "208", mnc: "93" }
      region_id: 128
      set_id: 1
      pointer: 1
  tai:
    - plmn: { mcc: "208", mnc: "93" }
      tac: 1
  plmn_support:
    - plmn: { mcc: 208, mnc: 93 }
      slices:
        - sst: 1
        - sst: 1
          sd: 66051
  security:
    integrity_order: [NIA2, 128-NIA3, NIA0]
    ciphering_order: [NEA2, NEA0]
  timers:
    mobile_reachable: 60
  subscribers:
    - supi: imsi-208930000000001
      k: 465b5ce8b199b49faa5f0a2ee238a6bc
      opc: cd63cb71954a9f4e48a5994e37a02baf
"#;

    #[test]
    fn test_parse_sample() {
        let config = AmfConfig::from_yaml(SAMPLE).unwrap();
        assert_eq!(config.amf_name, "amf-test");
        assert_eq!(config.guami[0].plmn, Plmn::new("208", "93"));
        assert_eq!(config.plmn_support[0].slices[1], Snssai::new(1, Some(0x010203)));
        assert_eq!(
            config.integrity_order().unwrap(),
            vec![
                IntegrityAlgorithm::Nia2,
                IntegrityAlgorithm::Nia3,
                IntegrityAlgorithm::Nia0
            ]
        );
        assert_eq!(config.timers.mobile_reachable(), Duration::from_secs(60));
        assert_eq!(config.timers.implicit_deregistration, 240);
        assert_eq!(config.authentication.mode, AuthenticationMode::Local);

        let keys = config.subscribers[0].keys().unwrap();
        assert_eq!(keys.amf, [0x80, 0x00]);
        assert_eq!(keys.k[0], 0x46);
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = AmfConfig::load("/nonexistent/amfcore/amf.yaml").unwrap();
        assert_eq!(config, AmfConfig::default());
    }

    #[test]
    fn test_empty_guami_is_rejected() {
        let yaml = "amf:\n  guami: []\n";
        assert!(matches!(
            AmfConfig::from_yaml(yaml),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_unknown_algorithm_is_rejected() {
        let yaml = "amf:\n  security:\n    integrity_order: [NIA9]\n";
        assert!(AmfConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_malformed_yaml_is_an_error() {
        assert!(matches!(
            AmfConfig::from_yaml("amf: [unterminated"),
            Err(ConfigError::Yaml(_))
        ));
    }

    #[test]
    fn test_bad_subscriber_key_is_rejected() {
        let yaml = r#"
amf:
  subscribers:
    - supi: imsi-001010000000001
      k: "0011"
      opc: cd63cb71954a9f4e48a5994e37a02baf
"#;
        assert!(AmfConfig::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_slices_for_plmn() {
        let config = AmfConfig::default();
        assert_eq!(
            config.slices_for(&Plmn::new("001", "01")),
            vec![Snssai::new(1, None)]
        );
        assert!(config.slices_for(&Plmn::new("999", "99")).is_empty());
    }
}

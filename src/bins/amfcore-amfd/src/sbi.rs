//! Peer network function client (N11 task)
//!
//! Every request to a peer NF (authentication, slice selection, session
//! management) goes through the N11 task: the caller registers a promise,
//! enqueues the request and waits on the promise with a bound. The task runs
//! each request concurrently and resolves the promise with the reply or with
//! an [`SbiError`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

use crate::auth::{AuthError, HeAuthVector, LocalAuthenticator};
use crate::config::AmfConfig;
use crate::context::TaskBase;
use crate::runtime::{RuntimeError, Task, TaskId};
use crate::types::{PromiseId, Snssai, Supi, Tai};
use crate::ue_context::PduSessionId;

/// SBI service names
pub mod service_name {
    pub const NAUSF_AUTH: &str = "nausf-auth";
    pub const NUDM_SDM: &str = "nudm-sdm";
    pub const NSMF_PDUSESSION: &str = "nsmf-pdusession";
    pub const NNSSF_NSSELECTION: &str = "nnssf-nsselection";
    pub const NNRF_NFM: &str = "nnrf-nfm";
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SbiError {
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error("peer answered {status}: {cause}")]
    Peer { status: u16, cause: String },
    #[error("no {0} peer available")]
    NoPeer(&'static str),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("unexpected reply to {0}")]
    UnexpectedResponse(&'static str),
}

pub type SbiResult<T> = Result<T, SbiError>;

// ============================================================================
// Requests and replies
// ============================================================================

/// NF profile sent to the repository at startup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NfProfile {
    pub nf_instance_name: String,
    pub services: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResyncInfo {
    pub rand: [u8; 16],
    pub auts: [u8; 14],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UeAuthenticationRequest {
    /// SUPI or SUCI string as received from the UE
    pub supi_or_suci: String,
    pub serving_network_name: String,
    pub resync: Option<ResyncInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AkaConfirmation {
    pub success: bool,
    pub supi: Option<Supi>,
    pub kseaf: Option<[u8; 32]>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceSelection {
    pub allowed: Vec<Snssai>,
    /// Set when another AMF set should serve the subscriber
    pub target_amf_set: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmContextCreate {
    pub supi: Supi,
    pub pdu_session_id: PduSessionId,
    pub dnn: String,
    pub snssai: Snssai,
    pub n1_sm: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmContextCreated {
    pub sm_context_ref: String,
    pub smf_addr: String,
    pub n1_sm: Option<Bytes>,
    pub n2_sm: Option<Bytes>,
}

/// Handover state carried in an SM context update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoState {
    Preparing,
    Prepared,
    Completed,
    Cancelled,
}

/// User plane connection state carried in an SM context update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpCnxState {
    Activating,
    Activated,
    Deactivated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmContextUpdate {
    pub sm_context_ref: String,
    pub ho_state: Option<HoState>,
    pub up_cnx_state: Option<UpCnxState>,
    pub n1_sm: Option<Bytes>,
    pub n2_sm: Option<Bytes>,
}

impl SmContextUpdate {
    pub fn new(sm_context_ref: &str) -> Self {
        Self {
            sm_context_ref: sm_context_ref.to_string(),
            ho_state: None,
            up_cnx_state: None,
            n1_sm: None,
            n2_sm: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SmContextUpdated {
    pub n1_sm: Option<Bytes>,
    pub n2_sm: Option<Bytes>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SbiRequest {
    NfRegister(NfProfile),
    UeAuthentication(UeAuthenticationRequest),
    ConfirmAka {
        confirmation: String,
        res_star: [u8; 16],
    },
    SliceSubscription(Supi),
    SliceSelection {
        supi: Supi,
        requested: Vec<Snssai>,
        subscribed: Vec<Snssai>,
        tai: Option<Tai>,
    },
    CreateSmContext(SmContextCreate),
    UpdateSmContext(SmContextUpdate),
    ReleaseSmContext(String),
}

impl SbiRequest {
    pub fn service(&self) -> &'static str {
        match self {
            SbiRequest::NfRegister(_) => service_name::NNRF_NFM,
            SbiRequest::UeAuthentication(_) | SbiRequest::ConfirmAka { .. } => {
                service_name::NAUSF_AUTH
            }
            SbiRequest::SliceSubscription(_) => service_name::NUDM_SDM,
            SbiRequest::SliceSelection { .. } => service_name::NNSSF_NSSELECTION,
            SbiRequest::CreateSmContext(_)
            | SbiRequest::UpdateSmContext(_)
            | SbiRequest::ReleaseSmContext(_) => service_name::NSMF_PDUSESSION,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SbiResponse {
    Registered,
    Authentication(Box<HeAuthVector>),
    AkaConfirmed(AkaConfirmation),
    SubscribedSlices(Vec<Snssai>),
    SliceSelection(SliceSelection),
    SmContextCreated(SmContextCreated),
    SmContextUpdated(SmContextUpdated),
    SmContextReleased,
}

// ============================================================================
// Peer NF seam
// ============================================================================

/// Operations the AMF consumes from its peer network functions
#[async_trait]
pub trait PeerNf: Send + Sync {
    async fn nf_register(&self, profile: NfProfile) -> SbiResult<()>;

    async fn ue_authentication(&self, request: UeAuthenticationRequest)
        -> SbiResult<HeAuthVector>;

    async fn confirm_5g_aka(
        &self,
        confirmation: &str,
        res_star: &[u8; 16],
    ) -> SbiResult<AkaConfirmation>;

    async fn slice_selection_subscription_data(&self, supi: &Supi) -> SbiResult<Vec<Snssai>>;

    async fn network_slice_selection(
        &self,
        supi: &Supi,
        requested: &[Snssai],
        subscribed: &[Snssai],
        tai: Option<&Tai>,
    ) -> SbiResult<SliceSelection>;

    async fn create_sm_context(&self, request: SmContextCreate) -> SbiResult<SmContextCreated>;

    async fn update_sm_context(&self, request: SmContextUpdate) -> SbiResult<SmContextUpdated>;

    async fn release_sm_context(&self, sm_context_ref: &str) -> SbiResult<()>;
}

/// Run one request against a peer
pub async fn execute(peer: &dyn PeerNf, request: SbiRequest) -> SbiResult<SbiResponse> {
    match request {
        SbiRequest::NfRegister(profile) => {
            peer.nf_register(profile).await.map(|_| SbiResponse::Registered)
        }
        SbiRequest::UeAuthentication(req) => peer
            .ue_authentication(req)
            .await
            .map(|av| SbiResponse::Authentication(Box::new(av))),
        SbiRequest::ConfirmAka {
            confirmation,
            res_star,
        } => peer
            .confirm_5g_aka(&confirmation, &res_star)
            .await
            .map(SbiResponse::AkaConfirmed),
        SbiRequest::SliceSubscription(supi) => peer
            .slice_selection_subscription_data(&supi)
            .await
            .map(SbiResponse::SubscribedSlices),
        SbiRequest::SliceSelection {
            supi,
            requested,
            subscribed,
            tai,
        } => peer
            .network_slice_selection(&supi, &requested, &subscribed, tai.as_ref())
            .await
            .map(SbiResponse::SliceSelection),
        SbiRequest::CreateSmContext(req) => peer
            .create_sm_context(req)
            .await
            .map(SbiResponse::SmContextCreated),
        SbiRequest::UpdateSmContext(req) => peer
            .update_sm_context(req)
            .await
            .map(SbiResponse::SmContextUpdated),
        SbiRequest::ReleaseSmContext(sm_context_ref) => peer
            .release_sm_context(&sm_context_ref)
            .await
            .map(|_| SbiResponse::SmContextReleased),
    }
}

// ============================================================================
// N11 task
// ============================================================================

#[derive(Debug)]
pub enum N11Message {
    Request {
        promise: PromiseId,
        request: SbiRequest,
    },
}

pub struct N11Task {
    base: TaskBase,
    peer: Arc<dyn PeerNf>,
}

impl N11Task {
    pub fn new(base: TaskBase, peer: Arc<dyn PeerNf>) -> Self {
        Self { base, peer }
    }
}

#[async_trait]
impl Task for N11Task {
    type Message = N11Message;

    fn id(&self) -> TaskId {
        TaskId::N11
    }

    async fn handle(&mut self, msg: N11Message) {
        let N11Message::Request { promise, request } = msg;
        let bound = self.base.ctx.config().timers.peer_response();
        let peer = Arc::clone(&self.peer);
        let ctx = Arc::clone(&self.base.ctx);
        let service = request.service();
        log::debug!("[{}] request {} sent", service, promise);
        tokio::spawn(async move {
            let result = match tokio::time::timeout(bound, execute(&*peer, request)).await {
                Ok(result) => result,
                Err(_) => Err(SbiError::Timeout(bound)),
            };
            if let Err(e) = &result {
                log::warn!("[{}] request {} failed: {}", service, promise, e);
            }
            ctx.promises.fulfill(promise, result);
        });
    }
}

/// Send a request through N11 and wait for the reply
pub async fn request(
    base: &TaskBase,
    request: SbiRequest,
    bound: Duration,
) -> SbiResult<SbiResponse> {
    let promise = base.ctx.promises.register(&base.ctx.ids);
    base.n11.send(N11Message::Request {
        promise: promise.id,
        request,
    })?;
    base.ctx
        .promises
        .wait(promise, bound)
        .await
        .unwrap_or(Err(SbiError::Timeout(bound)))
}

/// Send several requests and wait for all of them under one bound
pub async fn request_all(
    base: &TaskBase,
    requests: Vec<SbiRequest>,
    bound: Duration,
) -> Vec<SbiResult<SbiResponse>> {
    futures::future::join_all(
        requests
            .into_iter()
            .map(|req| request(base, req, bound)),
    )
    .await
}

// ============================================================================
// Static peer
// ============================================================================

/// Peer answering from local configuration
///
/// Authentication uses the configured subscriber credentials, slice data the
/// configured subscriber slices, and SM contexts are acknowledged without
/// N1/N2 content.
pub struct StaticPeerNf {
    config: AmfConfig,
    auth: LocalAuthenticator,
    pending_confirmations: Mutex<HashMap<String, (Supi, HeAuthVector)>>,
    next_ref: Mutex<u64>,
}

impl StaticPeerNf {
    pub fn new(config: AmfConfig) -> Result<Self, crate::config::ConfigError> {
        let auth = LocalAuthenticator::from_config(&config)?;
        Ok(Self {
            config,
            auth,
            pending_confirmations: Mutex::new(HashMap::new()),
            next_ref: Mutex::new(0),
        })
    }

    fn auth_error(e: AuthError) -> SbiError {
        match e {
            AuthError::UnknownSubscriber(supi) => SbiError::Peer {
                status: 404,
                cause: format!("USER_NOT_FOUND {}", supi),
            },
            other => SbiError::Peer {
                status: 500,
                cause: other.to_string(),
            },
        }
    }
}

#[async_trait]
impl PeerNf for StaticPeerNf {
    async fn nf_register(&self, profile: NfProfile) -> SbiResult<()> {
        log::info!(
            "NF profile {} registered ({} services)",
            profile.nf_instance_name,
            profile.services.len()
        );
        Ok(())
    }

    async fn ue_authentication(
        &self,
        request: UeAuthenticationRequest,
    ) -> SbiResult<HeAuthVector> {
        let supi = Supi::parse(&request.supi_or_suci).ok_or(SbiError::Peer {
            status: 403,
            cause: "SERVING_NETWORK_NOT_AUTHORIZED".into(),
        })?;
        if let Some(resync) = &request.resync {
            self.auth
                .resync(&supi, &resync.rand, &resync.auts)
                .map_err(Self::auth_error)?;
        }
        let mut av = self
            .auth
            .generate(&supi, &request.serving_network_name)
            .map_err(Self::auth_error)?;
        let confirmation = format!("{}/5g-aka-confirmation", hex::encode(av.rand));
        av.confirmation = Some(confirmation.clone());
        if let Ok(mut pending) = self.pending_confirmations.lock() {
            pending.insert(confirmation, (supi, av.clone()));
        }
        // The home network keeps XRES* and Kseaf to itself.
        av.xres_star = None;
        av.kseaf = None;
        Ok(av)
    }

    async fn confirm_5g_aka(
        &self,
        confirmation: &str,
        res_star: &[u8; 16],
    ) -> SbiResult<AkaConfirmation> {
        let entry = self
            .pending_confirmations
            .lock()
            .ok()
            .and_then(|mut pending| pending.remove(confirmation));
        let Some((supi, av)) = entry else {
            return Err(SbiError::Peer {
                status: 404,
                cause: "CONTEXT_NOT_FOUND".into(),
            });
        };
        let success = av.xres_star.as_ref() == Some(res_star);
        Ok(AkaConfirmation {
            success,
            supi: Some(supi),
            kseaf: if success { av.kseaf } else { None },
        })
    }

    async fn slice_selection_subscription_data(&self, supi: &Supi) -> SbiResult<Vec<Snssai>> {
        match self.config.subscriber(supi) {
            Some(subscriber) if !subscriber.slices.is_empty() => Ok(subscriber.slices.clone()),
            _ => Ok(self
                .config
                .plmn_support
                .iter()
                .flat_map(|support| support.slices.iter().cloned())
                .collect()),
        }
    }

    async fn network_slice_selection(
        &self,
        _supi: &Supi,
        requested: &[Snssai],
        subscribed: &[Snssai],
        _tai: Option<&Tai>,
    ) -> SbiResult<SliceSelection> {
        let allowed = if requested.is_empty() {
            subscribed.to_vec()
        } else {
            requested
                .iter()
                .filter(|s| subscribed.contains(s))
                .cloned()
                .collect()
        };
        Ok(SliceSelection {
            allowed,
            target_amf_set: None,
        })
    }

    async fn create_sm_context(&self, request: SmContextCreate) -> SbiResult<SmContextCreated> {
        let id = {
            let mut next = self.next_ref.lock().unwrap_or_else(|p| p.into_inner());
            *next += 1;
            *next
        };
        Ok(SmContextCreated {
            sm_context_ref: format!("/nsmf-pdusession/v1/sm-contexts/{}", id),
            smf_addr: "127.0.0.4:7777".into(),
            n1_sm: Some(request.n1_sm),
            n2_sm: None,
        })
    }

    async fn update_sm_context(&self, request: SmContextUpdate) -> SbiResult<SmContextUpdated> {
        Ok(SmContextUpdated {
            n1_sm: None,
            n2_sm: request.n2_sm,
        })
    }

    async fn release_sm_context(&self, sm_context_ref: &str) -> SbiResult<()> {
        log::debug!("SM context {} released", sm_context_ref);
        Ok(())
    }
}

// ============================================================================
// Scripted peer (tests)
// ============================================================================


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SubscriberConfig;

    fn config() -> AmfConfig {
        AmfConfig {
            subscribers: vec![SubscriberConfig {
                supi: Supi::from_imsi("001010000000001"),
                k: "465b5ce8b199b49faa5f0a2ee238a6bc".into(),
                opc: "cd63cb71954a9f4e48a5994e37a02baf".into(),
                amf: "8000".into(),
                sqn: 0x20,
                slices: vec![Snssai::new(1, None)],
            }],
            ..AmfConfig::default()
        }
    }

    #[tokio::test]
    async fn test_static_peer_confirms_aka_once() {
        let peer = StaticPeerNf::new(config()).unwrap();
        let snn = "5G:mnc001.mcc001.3gppnetwork.org";
        let av = peer
            .ue_authentication(UeAuthenticationRequest {
                supi_or_suci: "imsi-001010000000001".into(),
                serving_network_name: snn.into(),
                resync: None,
            })
            .await
            .unwrap();
        assert!(av.xres_star.is_none());
        let confirmation = av.confirmation.clone().unwrap();

        let bad = peer.confirm_5g_aka(&confirmation, &[0u8; 16]).await.unwrap();
        assert!(!bad.success);
        assert!(bad.kseaf.is_none());
        // Context consumed by the first confirmation
        assert!(peer.confirm_5g_aka(&confirmation, &[0u8; 16]).await.is_err());
    }

    #[tokio::test]
    async fn test_static_peer_unknown_subscriber() {
        let peer = StaticPeerNf::new(config()).unwrap();
        let err = peer
            .ue_authentication(UeAuthenticationRequest {
                supi_or_suci: "imsi-001019999999999".into(),
                serving_network_name: "5G:mnc001.mcc001.3gppnetwork.org".into(),
                resync: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SbiError::Peer { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_static_slice_selection_intersects() {
        let peer = StaticPeerNf::new(config()).unwrap();
        let supi = Supi::from_imsi("001010000000001");
        let subscribed = peer.slice_selection_subscription_data(&supi).await.unwrap();
        let selection = peer
            .network_slice_selection(
                &supi,
                &[Snssai::new(1, None), Snssai::new(2, Some(7))],
                &subscribed,
                None,
            )
            .await
            .unwrap();
        assert_eq!(selection.allowed, vec![Snssai::new(1, None)]);
        assert_eq!(selection.target_amf_set, None);
    }

    #[test]
    fn test_request_service_names() {
        assert_eq!(
            SbiRequest::ReleaseSmContext("x".into()).service(),
            service_name::NSMF_PDUSESSION
        );
        assert_eq!(
            SbiRequest::SliceSubscription(Supi::from_imsi("001010000000001")).service(),
            service_name::NUDM_SDM
        );
    }
}

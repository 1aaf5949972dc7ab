//! Submits a certificate signing request to the cluster's certificate authority, approves it
//! according to an [`ApprovalPolicy`], and waits (bounded) for the signed certificate.
//!
//! The request moves through [`SigningPhase::Requested`] and [`SigningPhase::Approved`] and ends
//! in exactly one of [`SigningPhase::Signed`], [`SigningPhase::TimedOut`] or
//! [`SigningPhase::Failed`]. A single [`ApprovalWorkflow::submit`] never retries.

use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use futures::{stream::BoxStream, StreamExt, TryStreamExt};
use serde_json::json;
use snafu::{ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::{
        api::certificates::v1::{
            CertificateSigningRequest, CertificateSigningRequestCondition,
            CertificateSigningRequestSpec,
        },
        apimachinery::pkg::apis::meta::v1::Time,
        chrono::Utc,
        ByteString,
    },
    kube::{
        self,
        api::{DeleteParams, ObjectMeta, Patch, PatchParams, PostParams, WatchEvent, WatchParams},
        runtime::reflector::ObjectRef,
        Api,
    },
};
use tracing::{debug, info, warn};

use crate::utils::{is_not_found, trystream_find_map};

/// Label used to find the request again when watching for its certificate
pub const LABEL_CSR_NAME: &str = "csr-name";

/// How long to wait for the signed certificate after approval
pub const DEFAULT_SIGNING_TIMEOUT: Duration = Duration::from_secs(10);

/// The built-in kubelet-serving signer only issues for `system:node:*` subjects, so clusters
/// provisioning service certificates must run a signer that accepts them under this name or
/// have it overridden.
pub const DEFAULT_SIGNER_NAME: &str = "kubernetes.io/kubelet-serving";

/// Key usages requested for a TLS serving certificate
pub const SERVER_USAGES: [&str; 3] = ["digital signature", "key encipherment", "server auth"];

const CONDITION_APPROVED: &str = "Approved";
const CONDITION_DENIED: &str = "Denied";
const CONDITION_FAILED: &str = "Failed";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to create {csr}"))]
    CreateCsr {
        source: kube::Error,
        csr: ObjectRef<CertificateSigningRequest>,
    },

    #[snafu(display("failed to approve {csr}"))]
    ApproveCsr {
        source: kube::Error,
        csr: ObjectRef<CertificateSigningRequest>,
    },

    #[snafu(display("failed to watch {csr} for its certificate"))]
    WatchCsr {
        source: kube::Error,
        csr: ObjectRef<CertificateSigningRequest>,
    },

    #[snafu(display("{csr} was not signed within {timeout:?}"))]
    ApprovalTimeout {
        csr: ObjectRef<CertificateSigningRequest>,
        timeout: Duration,
    },

    #[snafu(display("{csr} was marked {condition} ({reason}): {message}"))]
    SigningFailed {
        csr: ObjectRef<CertificateSigningRequest>,
        condition: String,
        reason: String,
        message: String,
    },

    #[snafu(display("watch for {csr} ended before it was signed"))]
    WatchClosed {
        csr: ObjectRef<CertificateSigningRequest>,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, strum::Display)]
pub enum SigningPhase {
    Requested,
    Approved,
    Signed,
    TimedOut,
    Failed,
}

pub type CsrEventStream =
    BoxStream<'static, Result<WatchEvent<CertificateSigningRequest>, kube::Error>>;

/// The cluster-scoped authority that signs certificate signing requests.
#[async_trait]
pub trait CsrAuthority: Send + Sync {
    async fn delete(&self, name: &str) -> Result<(), kube::Error>;
    async fn create(
        &self,
        csr: &CertificateSigningRequest,
    ) -> Result<CertificateSigningRequest, kube::Error>;
    /// Writes the conditions in `csr.status` to the approval status of the request.
    async fn update_approval(
        &self,
        csr: &CertificateSigningRequest,
    ) -> Result<CertificateSigningRequest, kube::Error>;
    async fn watch(&self, label_selector: &str) -> Result<CsrEventStream, kube::Error>;
}

#[async_trait]
impl CsrAuthority for Api<CertificateSigningRequest> {
    async fn delete(&self, name: &str) -> Result<(), kube::Error> {
        Api::delete(self, name, &DeleteParams::background())
            .await
            .map(|_| ())
    }

    async fn create(
        &self,
        csr: &CertificateSigningRequest,
    ) -> Result<CertificateSigningRequest, kube::Error> {
        Api::create(self, &PostParams::default(), csr).await
    }

    async fn update_approval(
        &self,
        csr: &CertificateSigningRequest,
    ) -> Result<CertificateSigningRequest, kube::Error> {
        let name = csr.metadata.name.as_deref().unwrap_or_default();
        let conditions = csr
            .status
            .as_ref()
            .and_then(|status| status.conditions.as_ref());
        self.patch_subresource(
            "approval",
            name,
            &PatchParams::default(),
            &Patch::Merge(json!({ "status": { "conditions": conditions } })),
        )
        .await
    }

    async fn watch(&self, label_selector: &str) -> Result<CsrEventStream, kube::Error> {
        // Watching from "0" replays the current state, so a certificate issued between
        // approval and the start of the watch is not missed
        Ok(Api::watch(self, &WatchParams::default().labels(label_selector), "0")
            .await?
            .boxed())
    }
}

/// Decides which usages are requested and who approves the request.
pub trait ApprovalPolicy: Send + Sync {
    fn usages(&self) -> Vec<String>;

    /// The approval condition to record on `csr`, or `None` if approval is left to someone else.
    fn approval(&self, csr: &CertificateSigningRequest)
        -> Option<CertificateSigningRequestCondition>;
}

/// Approves its own requests, for processes that are the trust root of their own endpoint.
#[derive(Clone, Debug, Default)]
pub struct SelfApprove;

impl ApprovalPolicy for SelfApprove {
    fn usages(&self) -> Vec<String> {
        SERVER_USAGES.map(String::from).to_vec()
    }

    fn approval(
        &self,
        _csr: &CertificateSigningRequest,
    ) -> Option<CertificateSigningRequestCondition> {
        Some(CertificateSigningRequestCondition {
            type_: CONDITION_APPROVED.to_string(),
            status: "True".to_string(),
            reason: Some("PodSelfApprove".to_string()),
            message: Some("This CSR was approved by pod certificate approve.".to_string()),
            last_update_time: Some(Time(Utc::now())),
            ..CertificateSigningRequestCondition::default()
        })
    }
}

/// Leaves approval to an external reviewer and only waits for the certificate.
#[derive(Clone, Debug)]
pub struct ExternalApproval {
    pub usages: Vec<String>,
}

impl ApprovalPolicy for ExternalApproval {
    fn usages(&self) -> Vec<String> {
        self.usages.clone()
    }

    fn approval(
        &self,
        _csr: &CertificateSigningRequest,
    ) -> Option<CertificateSigningRequestCondition> {
        None
    }
}

#[derive(Debug, PartialEq)]
enum Outcome {
    Signed(Vec<u8>),
    Failed {
        condition: String,
        reason: String,
        message: String,
    },
}

pub struct ApprovalWorkflow<A, P> {
    authority: A,
    policy: P,
    signer_name: String,
    timeout: Duration,
}

impl<A: CsrAuthority, P: ApprovalPolicy> ApprovalWorkflow<A, P> {
    pub fn new(authority: A, policy: P) -> Self {
        Self {
            authority,
            policy,
            signer_name: DEFAULT_SIGNER_NAME.to_string(),
            timeout: DEFAULT_SIGNING_TIMEOUT,
        }
    }

    pub fn with_signer_name(mut self, signer_name: impl Into<String>) -> Self {
        self.signer_name = signer_name.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Submits `csr_pem` as the request called `name` and returns the signed certificate (PEM).
    ///
    /// Any earlier request with the same name is deleted first.
    pub async fn submit(&self, name: &str, csr_pem: &[u8]) -> Result<Vec<u8>> {
        let csr_ref = || ObjectRef::<CertificateSigningRequest>::new(name);

        // Deleting is best-effort, the create below reports any real problem
        match self.authority.delete(name).await {
            Ok(()) => debug!(csr = %csr_ref(), "Deleted stale certificate signing request"),
            Err(err) if is_not_found(&err) => {}
            Err(err) => warn!(
                csr = %csr_ref(),
                error = &err as &dyn std::error::Error,
                "Failed to delete stale certificate signing request, continuing"
            ),
        }
        let request = CertificateSigningRequest {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(BTreeMap::from([(LABEL_CSR_NAME.to_string(), name.to_string())])),
                ..ObjectMeta::default()
            },
            spec: CertificateSigningRequestSpec {
                request: ByteString(csr_pem.to_vec()),
                signer_name: self.signer_name.clone(),
                usages: Some(self.policy.usages()),
                ..CertificateSigningRequestSpec::default()
            },
            status: None,
        };
        let mut created = self
            .authority
            .create(&request)
            .await
            .with_context(|_| CreateCsrSnafu { csr: csr_ref() })?;
        info!(
            csr = %csr_ref(),
            phase = %SigningPhase::Requested,
            signer = %self.signer_name,
            "Submitted certificate signing request"
        );

        match self.policy.approval(&created) {
            Some(condition) => {
                created.status.get_or_insert_with(Default::default).conditions =
                    Some(vec![condition]);
                self.authority
                    .update_approval(&created)
                    .await
                    .with_context(|_| ApproveCsrSnafu { csr: csr_ref() })?;
                info!(
                    csr = %csr_ref(),
                    phase = %SigningPhase::Approved,
                    "Approved certificate signing request"
                );
            }
            None => info!(
                csr = %csr_ref(),
                "Waiting for certificate signing request to be approved externally"
            ),
        }

        let events = self
            .authority
            .watch(&format!("{LABEL_CSR_NAME}={name}"))
            .await
            .with_context(|_| WatchCsrSnafu { csr: csr_ref() })?
            .map_ok(|event| observe(name, event));
        match tokio::time::timeout(self.timeout, trystream_find_map(events)).await {
            Ok(Ok(Some(Outcome::Signed(certificate)))) => {
                info!(
                    csr = %csr_ref(),
                    phase = %SigningPhase::Signed,
                    "Certificate signing request was signed"
                );
                Ok(certificate)
            }
            Ok(Ok(Some(Outcome::Failed {
                condition,
                reason,
                message,
            }))) => {
                warn!(
                    csr = %csr_ref(),
                    phase = %SigningPhase::Failed,
                    %condition,
                    %reason,
                    "Certificate signing request was rejected"
                );
                SigningFailedSnafu {
                    csr: csr_ref(),
                    condition,
                    reason,
                    message,
                }
                .fail()
            }
            Ok(Ok(None)) => WatchClosedSnafu { csr: csr_ref() }.fail(),
            Ok(Err(err)) => Err(err).context(WatchCsrSnafu { csr: csr_ref() }),
            Err(_elapsed) => {
                warn!(
                    csr = %csr_ref(),
                    phase = %SigningPhase::TimedOut,
                    timeout = ?self.timeout,
                    "Gave up waiting for certificate"
                );
                ApprovalTimeoutSnafu {
                    csr: csr_ref(),
                    timeout: self.timeout,
                }
                .fail()
            }
        }
    }
}

/// Inspects one change of the tracked request, returning `Some` once it has reached a
/// terminal state.
fn observe(name: &str, event: WatchEvent<CertificateSigningRequest>) -> Option<Outcome> {
    let csr = match event {
        WatchEvent::Added(csr) | WatchEvent::Modified(csr) => csr,
        WatchEvent::Error(err) => {
            warn!(csr.name = name, error = %err, "Watch reported an error, ignoring");
            return None;
        }
        WatchEvent::Deleted(_) | WatchEvent::Bookmark(_) => return None,
    };
    if csr.metadata.name.as_deref() != Some(name) {
        return None;
    }
    let status = csr.status?;
    if let Some(ByteString(certificate)) = status.certificate.filter(|cert| !cert.0.is_empty()) {
        return Some(Outcome::Signed(certificate));
    }
    status
        .conditions
        .unwrap_or_default()
        .into_iter()
        .find(|cond| {
            (cond.type_ == CONDITION_DENIED || cond.type_ == CONDITION_FAILED)
                && cond.status == "True"
        })
        .map(|cond| Outcome::Failed {
            condition: cond.type_,
            reason: cond.reason.unwrap_or_default(),
            message: cond.message.unwrap_or_default(),
        })
}

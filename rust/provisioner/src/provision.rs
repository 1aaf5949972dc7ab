//! Runs the provisioning pipeline: record, signing, trust anchor, webhook configurations and
//! finally the files on disk. Every stage aborts the run on failure, leaving whatever was
//! already persisted for the next run to resume from.

use std::path::PathBuf;

use openssl::x509::X509;
use snafu::{ResultExt, Snafu};
use stackable_operator::k8s_openapi::api::admissionregistration::v1::{
    MutatingWebhookConfiguration, ValidatingWebhookConfiguration,
};
use strum::{EnumDiscriminants, IntoStaticStr};
use tracing::info;

use crate::{
    csr::{self, ApprovalPolicy, ApprovalWorkflow, CsrAuthority, DEFAULT_SIGNER_NAME},
    identity::{self, Identity, KeyAlgorithm},
    patcher::{self, default_bindings, BindingStore, ConfigurationPatcher, WebhookBindings},
    store::{self, CertificateRecord, CertificateStore, RecordState, RecordStore},
    trust_anchor::{self, TrustAnchor, TrustAnchorResolver, TrustAnchorSource},
    utils::{asn1time_to_offsetdatetime, Asn1TimeParseError},
    writer::{self, IdentityWriter},
};

pub const DEFAULT_ORGANIZATION: &str = "webhook-cert-provisioner";
pub const DEFAULT_NAMESPACE: &str = "kube-system";
pub const DEFAULT_SERVICE_NAME: &str = "webhook-service";
pub const DEFAULT_SECRET_NAME: &str = "webhook-secret";
pub const DEFAULT_CSR_NAME: &str = "webhook-csr";

/// `<tmp>/k8s-webhook-server/serving-certs`, where webhook servers look for their certificate
pub fn default_cert_dir() -> PathBuf {
    std::env::temp_dir()
        .join("k8s-webhook-server")
        .join("serving-certs")
}

#[derive(Debug, Snafu, EnumDiscriminants)]
#[strum_discriminants(derive(IntoStaticStr))]
pub enum Error {
    #[snafu(display("failed to generate private key"))]
    KeyGeneration { source: identity::Error },

    #[snafu(display("failed to build certificate signing request"))]
    CsrBuild { source: identity::Error },

    #[snafu(display("certificate record is missing"))]
    NotFound { source: store::Error },

    #[snafu(display("failed to access certificate record"))]
    Record { source: store::Error },

    #[snafu(display("certificate was not issued in time"))]
    ApprovalTimeout { source: csr::Error },

    #[snafu(display("failed to get certificate signed"))]
    Signing { source: csr::Error },

    #[snafu(display("CA bundle is unavailable"))]
    TrustAnchorMissing { source: trust_anchor::Error },

    #[snafu(display("failed to resolve CA bundle"))]
    ResolveTrustAnchor { source: trust_anchor::Error },

    #[snafu(display("failed to parse issued certificate"))]
    ParseCertificate { source: openssl::error::ErrorStack },

    #[snafu(display("failed to read expiry of issued certificate"))]
    CertificateExpiry { source: Asn1TimeParseError },

    #[snafu(display("failed to patch webhook configurations"))]
    Patch { source: patcher::Error },

    #[snafu(display("failed to write certificate files"))]
    Filesystem { source: writer::Error },
}
type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// A stable name for the kind of failure, for logs and exit reporting
    pub fn category(&self) -> &'static str {
        ErrorDiscriminants::from(self).into()
    }
}

impl From<identity::Error> for Error {
    fn from(source: identity::Error) -> Self {
        match source {
            identity::Error::GenerateKey { .. } | identity::Error::SerializeKey { .. } => {
                Error::KeyGeneration { source }
            }
            identity::Error::EmptyCommonName | identity::Error::BuildCsr { .. } => {
                Error::CsrBuild { source }
            }
        }
    }
}

impl From<store::Error> for Error {
    fn from(source: store::Error) -> Self {
        match source {
            store::Error::GenerateIdentity { source } => source.into(),
            store::Error::RecordNotFound { .. } => Error::NotFound { source },
            source => Error::Record { source },
        }
    }
}

impl From<csr::Error> for Error {
    fn from(source: csr::Error) -> Self {
        match source {
            csr::Error::ApprovalTimeout { .. } => Error::ApprovalTimeout { source },
            source => Error::Signing { source },
        }
    }
}

impl From<trust_anchor::Error> for Error {
    fn from(source: trust_anchor::Error) -> Self {
        match source {
            trust_anchor::Error::GetTrustAnchor { .. } => Error::ResolveTrustAnchor { source },
            source => Error::TrustAnchorMissing { source },
        }
    }
}

#[derive(Clone, Debug)]
pub struct ProvisionConfig {
    /// Subject organizations of the requested certificate
    pub organization: Vec<String>,
    /// Namespace of the webhook service and of the certificate record
    pub namespace: String,
    pub cert_dir: PathBuf,
    pub service_name: String,
    pub secret_name: String,
    pub csr_name: String,
    pub key_algorithm: KeyAlgorithm,
    pub signer_name: String,
    /// Discard any stored key and certificate and start over
    pub force_regenerate: bool,
    pub trust_anchor: TrustAnchor,
    pub bindings: Vec<WebhookBindings>,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            organization: vec![DEFAULT_ORGANIZATION.to_string()],
            namespace: DEFAULT_NAMESPACE.to_string(),
            cert_dir: default_cert_dir(),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
            secret_name: DEFAULT_SECRET_NAME.to_string(),
            csr_name: DEFAULT_CSR_NAME.to_string(),
            key_algorithm: KeyAlgorithm::default(),
            signer_name: DEFAULT_SIGNER_NAME.to_string(),
            force_regenerate: false,
            trust_anchor: TrustAnchor::default(),
            bindings: default_bindings(),
        }
    }
}

impl ProvisionConfig {
    pub fn identity(&self) -> Identity {
        Identity::for_service(
            &self.service_name,
            &self.namespace,
            self.organization.clone(),
        )
    }
}

/// The cluster-side stores the pipeline reads and writes.
pub struct Collaborators<S, C, T, V, M> {
    /// `Secret`s in [`ProvisionConfig::namespace`]
    pub records: S,
    pub authority: C,
    /// `ConfigMap`s in the trust anchor's namespace
    pub trust_anchor: T,
    pub validating: V,
    pub mutating: M,
}

pub struct Provisioner<S, C, P, T, V, M> {
    config: ProvisionConfig,
    store: CertificateStore<S>,
    workflow: ApprovalWorkflow<C, P>,
    trust_anchor: TrustAnchorResolver<T>,
    patcher: ConfigurationPatcher<V, M>,
    writer: IdentityWriter,
}

impl<S, C, P, T, V, M> Provisioner<S, C, P, T, V, M>
where
    S: RecordStore,
    C: CsrAuthority,
    P: ApprovalPolicy,
    T: TrustAnchorSource,
    V: BindingStore<ValidatingWebhookConfiguration>,
    M: BindingStore<MutatingWebhookConfiguration>,
{
    pub fn new(
        config: ProvisionConfig,
        collaborators: Collaborators<S, C, T, V, M>,
        policy: P,
    ) -> Self {
        let Collaborators {
            records,
            authority,
            trust_anchor,
            validating,
            mutating,
        } = collaborators;
        Self {
            store: CertificateStore::new(
                records,
                &config.namespace,
                config.identity(),
                config.key_algorithm,
            ),
            workflow: ApprovalWorkflow::new(authority, policy)
                .with_signer_name(&config.signer_name),
            trust_anchor: TrustAnchorResolver::new(trust_anchor, config.trust_anchor.clone()),
            patcher: ConfigurationPatcher::new(validating, mutating),
            writer: IdentityWriter::new(&config.cert_dir),
            config,
        }
    }

    /// Provisions the serving certificate and returns the completed record.
    pub async fn run(&self) -> Result<CertificateRecord> {
        let config = &self.config;
        let record = if config.force_regenerate {
            self.store.regenerate(&config.secret_name).await?
        } else {
            self.store.get_or_create(&config.secret_name).await?
        };

        let cert_pem = match record.state {
            RecordState::Complete { cert_pem, .. } => {
                info!(
                    secret = %record.secret,
                    "Certificate was already issued, skipping signing request"
                );
                cert_pem
            }
            RecordState::New | RecordState::AwaitingSignature => {
                let cert_pem = self
                    .workflow
                    .submit(&config.csr_name, &record.csr_pem)
                    .await?;
                log_certificate_expiry(&cert_pem)?;
                cert_pem
            }
        };

        let ca_bundle = self.trust_anchor.resolve().await?;
        let record = self
            .store
            .persist(&config.secret_name, cert_pem.clone(), ca_bundle.clone())
            .await?;
        self.patcher
            .apply(
                &config.bindings,
                &config.service_name,
                &config.namespace,
                &ca_bundle,
            )
            .await
            .context(PatchSnafu)?;
        self.writer
            .write(&cert_pem, &record.key_pem)
            .await
            .context(FilesystemSnafu)?;
        info!(
            secret = %record.secret,
            cert.dir = %self.writer.dir().display(),
            "Provisioned webhook serving certificate"
        );
        Ok(record)
    }
}

fn log_certificate_expiry(cert_pem: &[u8]) -> Result<()> {
    let cert = X509::from_pem(cert_pem).context(ParseCertificateSnafu)?;
    let expires_at = asn1time_to_offsetdatetime(cert.not_after()).context(CertificateExpirySnafu)?;
    info!(%expires_at, "Certificate signing request was issued");
    Ok(())
}

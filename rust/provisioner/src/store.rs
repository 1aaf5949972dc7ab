//! Get-or-create persistence of the provisioned identity (key, CSR, signed certificate and
//! CA bundle) in a Kubernetes `Secret`.

use std::collections::BTreeMap;

use async_trait::async_trait;
use snafu::{OptionExt, ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::{api::core::v1::Secret, ByteString},
    kube::{
        self,
        api::{ObjectMeta, PostParams},
        Api,
    },
};
use strum::IntoStaticStr;
use tracing::info;
use webhook_cert_provisioner_utils::refs::SecretReference;

use crate::{
    identity::{self, Identity, KeyAlgorithm},
    utils::{is_not_found, Unloggable},
};

pub const SECRET_KEY_CSR: &str = "tls.csr";
pub const SECRET_KEY_KEY: &str = "tls.key";
pub const SECRET_KEY_CERT: &str = "tls.crt";
pub const SECRET_KEY_CA_BUNDLE: &str = "caBundle";

/// Records the lifecycle state of the record, see [`RecordState`]
pub const ANNOTATION_STATE: &str = "webhook-cert-provisioner/state";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to get record {secret}"))]
    GetRecord {
        source: kube::Error,
        secret: SecretReference,
    },

    #[snafu(display("failed to generate key and certificate signing request"))]
    GenerateIdentity { source: identity::Error },

    #[snafu(display("failed to create record {secret}"))]
    CreateRecord {
        source: kube::Error,
        secret: SecretReference,
    },

    #[snafu(display("failed to update record {secret}"))]
    UpdateRecord {
        source: kube::Error,
        secret: SecretReference,
    },

    #[snafu(display("record {secret} does not exist (was it deleted concurrently?)"))]
    RecordNotFound { secret: SecretReference },

    #[snafu(display("record {secret} is missing required key {key:?}"))]
    MissingRecordKey {
        key: &'static str,
        secret: SecretReference,
    },

    #[snafu(display("record {secret} has unknown state {state:?}"))]
    UnknownState {
        state: String,
        secret: SecretReference,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

/// Storage for records, scoped to a single namespace.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Returns `None` if no record called `name` exists.
    async fn get(&self, name: &str) -> Result<Option<Secret>, kube::Error>;
    async fn create(&self, record: &Secret) -> Result<Secret, kube::Error>;
    async fn update(&self, record: &Secret) -> Result<Secret, kube::Error>;
}

#[async_trait]
impl RecordStore for Api<Secret> {
    async fn get(&self, name: &str) -> Result<Option<Secret>, kube::Error> {
        self.get_opt(name).await
    }

    async fn create(&self, record: &Secret) -> Result<Secret, kube::Error> {
        Api::create(self, &PostParams::default(), record).await
    }

    async fn update(&self, record: &Secret) -> Result<Secret, kube::Error> {
        let name = record.metadata.name.as_deref().unwrap_or_default();
        self.replace(name, &PostParams::default(), record).await
    }
}

/// Where a record is in the provisioning workflow.
#[derive(Clone, Debug, PartialEq, Eq, IntoStaticStr)]
pub enum RecordState {
    /// Key and CSR were generated by this run, nothing has been submitted yet
    New,
    /// Key and CSR were loaded from an earlier run that never completed
    AwaitingSignature,
    /// The certificate has been signed and the CA bundle resolved
    Complete {
        cert_pem: Vec<u8>,
        ca_bundle: Vec<u8>,
    },
}

impl RecordState {
    pub fn as_str(&self) -> &'static str {
        self.into()
    }
}

#[derive(Clone, Debug)]
pub struct CertificateRecord {
    pub secret: SecretReference,
    pub csr_pem: Vec<u8>,
    pub key_pem: Unloggable<Vec<u8>>,
    pub state: RecordState,
}

impl CertificateRecord {
    fn from_secret(secret_ref: SecretReference, secret: &Secret) -> Result<Self> {
        let take = |key: &'static str| {
            secret
                .data
                .as_ref()
                .and_then(|data| data.get(key))
                .map(|ByteString(value)| value.clone())
        };
        let csr_pem = take(SECRET_KEY_CSR).context(MissingRecordKeySnafu {
            key: SECRET_KEY_CSR,
            secret: secret_ref.clone(),
        })?;
        let key_pem = take(SECRET_KEY_KEY).context(MissingRecordKeySnafu {
            key: SECRET_KEY_KEY,
            secret: secret_ref.clone(),
        })?;
        let cert_pem = take(SECRET_KEY_CERT);
        let ca_bundle = take(SECRET_KEY_CA_BUNDLE);
        let recorded_state = secret
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(ANNOTATION_STATE))
            .map(String::as_str);
        let state = match (recorded_state, cert_pem, ca_bundle) {
            (Some("Complete") | None, Some(cert_pem), Some(ca_bundle)) => RecordState::Complete {
                cert_pem,
                ca_bundle,
            },
            (Some("Complete"), cert_pem, _) => {
                return MissingRecordKeySnafu {
                    key: if cert_pem.is_none() {
                        SECRET_KEY_CERT
                    } else {
                        SECRET_KEY_CA_BUNDLE
                    },
                    secret: secret_ref,
                }
                .fail()
            }
            // A record created by an earlier run has been waiting ever since
            (Some("New" | "AwaitingSignature") | None, _, _) => RecordState::AwaitingSignature,
            (Some(state), _, _) => {
                return UnknownStateSnafu {
                    state,
                    secret: secret_ref,
                }
                .fail()
            }
        };
        Ok(Self {
            secret: secret_ref,
            csr_pem,
            key_pem: Unloggable(key_pem),
            state,
        })
    }

    /// Writes the record into `secret`, leaving unrelated keys, labels and annotations alone.
    fn write_to(&self, secret: &mut Secret) {
        let data = secret.data.get_or_insert_with(BTreeMap::new);
        data.insert(SECRET_KEY_CSR.to_string(), ByteString(self.csr_pem.clone()));
        data.insert(SECRET_KEY_KEY.to_string(), ByteString(self.key_pem.to_vec()));
        match &self.state {
            RecordState::Complete {
                cert_pem,
                ca_bundle,
            } => {
                data.insert(SECRET_KEY_CERT.to_string(), ByteString(cert_pem.clone()));
                data.insert(
                    SECRET_KEY_CA_BUNDLE.to_string(),
                    ByteString(ca_bundle.clone()),
                );
            }
            RecordState::New | RecordState::AwaitingSignature => {
                data.remove(SECRET_KEY_CERT);
                data.remove(SECRET_KEY_CA_BUNDLE);
            }
        }
        secret
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(
                ANNOTATION_STATE.to_string(),
                self.state.as_str().to_string(),
            );
    }

    fn to_secret(&self) -> Secret {
        let mut secret = Secret {
            metadata: ObjectMeta {
                name: Some(self.secret.name.clone()),
                namespace: Some(self.secret.namespace.clone()),
                ..ObjectMeta::default()
            },
            ..Secret::default()
        };
        self.write_to(&mut secret);
        secret
    }
}

/// Get-or-create persistence for the identity's key material, keyed by record name.
pub struct CertificateStore<S> {
    store: S,
    namespace: String,
    identity: Identity,
    key_algorithm: KeyAlgorithm,
}

impl<S: RecordStore> CertificateStore<S> {
    /// `identity` and `key_algorithm` are only used when a record has to be created.
    pub fn new(
        store: S,
        namespace: impl Into<String>,
        identity: Identity,
        key_algorithm: KeyAlgorithm,
    ) -> Self {
        Self {
            store,
            namespace: namespace.into(),
            identity,
            key_algorithm,
        }
    }

    fn secret_ref(&self, name: &str) -> SecretReference {
        SecretReference::new(&self.namespace, name)
    }

    /// Returns the record called `name`, creating it with a fresh key and CSR if it is absent.
    ///
    /// Existing records are returned unchanged, so repeated calls never regenerate keys.
    pub async fn get_or_create(&self, name: &str) -> Result<CertificateRecord> {
        let secret_ref = self.secret_ref(name);
        match self
            .store
            .get(name)
            .await
            .with_context(|_| GetRecordSnafu {
                secret: secret_ref.clone(),
            })? {
            Some(secret) => {
                let record = CertificateRecord::from_secret(secret_ref, &secret)?;
                info!(
                    secret = %record.secret,
                    state = record.state.as_str(),
                    "Reusing existing certificate record"
                );
                Ok(record)
            }
            None => {
                info!(
                    secret = %secret_ref,
                    "Provisioning a new key and certificate signing request, because no record could be found"
                );
                let record = self.new_record(secret_ref.clone())?;
                self.store
                    .create(&record.to_secret())
                    .await
                    .context(CreateRecordSnafu { secret: secret_ref })?;
                Ok(record)
            }
        }
    }

    /// Replaces the key and CSR of the record called `name`, discarding any certificate
    /// and CA bundle stored so far. Creates the record if it is absent.
    pub async fn regenerate(&self, name: &str) -> Result<CertificateRecord> {
        let secret_ref = self.secret_ref(name);
        let existing = self
            .store
            .get(name)
            .await
            .with_context(|_| GetRecordSnafu {
                secret: secret_ref.clone(),
            })?;
        let record = self.new_record(secret_ref.clone())?;
        match existing {
            Some(mut secret) => {
                info!(secret = %secret_ref, "Regenerating key material of existing record");
                record.write_to(&mut secret);
                self.update(&secret, &secret_ref).await?;
            }
            None => {
                info!(
                    secret = %secret_ref,
                    "Provisioning a new key and certificate signing request"
                );
                self.store
                    .create(&record.to_secret())
                    .await
                    .context(CreateRecordSnafu { secret: secret_ref })?;
            }
        }
        Ok(record)
    }

    /// Stores the signed certificate and CA bundle in the existing record called `name`.
    pub async fn persist(
        &self,
        name: &str,
        cert_pem: Vec<u8>,
        ca_bundle: Vec<u8>,
    ) -> Result<CertificateRecord> {
        let secret_ref = self.secret_ref(name);
        let mut secret = self
            .store
            .get(name)
            .await
            .with_context(|_| GetRecordSnafu {
                secret: secret_ref.clone(),
            })?
            .with_context(|| RecordNotFoundSnafu {
                secret: secret_ref.clone(),
            })?;
        let mut record = CertificateRecord::from_secret(secret_ref.clone(), &secret)?;
        record.state = RecordState::Complete {
            cert_pem,
            ca_bundle,
        };
        record.write_to(&mut secret);
        self.update(&secret, &secret_ref).await?;
        info!(secret = %secret_ref, "Stored signed certificate and CA bundle");
        Ok(record)
    }

    async fn update(&self, secret: &Secret, secret_ref: &SecretReference) -> Result<()> {
        match self.store.update(secret).await {
            Ok(_) => Ok(()),
            Err(err) if is_not_found(&err) => RecordNotFoundSnafu {
                secret: secret_ref.clone(),
            }
            .fail(),
            Err(err) => Err(err).context(UpdateRecordSnafu {
                secret: secret_ref.clone(),
            }),
        }
    }

    fn new_record(&self, secret: SecretReference) -> Result<CertificateRecord> {
        let (key, csr_pem) = identity::generate(&self.identity, self.key_algorithm)
            .context(GenerateIdentitySnafu)?;
        Ok(CertificateRecord {
            secret,
            csr_pem,
            key_pem: Unloggable(key.to_pem().context(GenerateIdentitySnafu)?),
            state: RecordState::New,
        })
    }
}

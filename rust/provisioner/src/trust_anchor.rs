//! Resolves the cluster's client CA bundle, which verifiers use to trust the signed certificate.

use async_trait::async_trait;
use snafu::{ensure, OptionExt, ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::api::core::v1::ConfigMap,
    kube::{self, Api},
};
use tracing::debug;
use webhook_cert_provisioner_utils::{pem::split_pem_certificates, refs::ConfigMapReference};

pub const DEFAULT_TRUST_ANCHOR_NAMESPACE: &str = "kube-system";
pub const DEFAULT_TRUST_ANCHOR_NAME: &str = "extension-apiserver-authentication";
pub const DEFAULT_TRUST_ANCHOR_KEY: &str = "client-ca-file";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to get trust anchor {config_map}"))]
    GetTrustAnchor {
        source: kube::Error,
        config_map: ConfigMapReference,
    },

    #[snafu(display("trust anchor {config_map} does not exist"))]
    TrustAnchorObjectMissing { config_map: ConfigMapReference },

    #[snafu(display("trust anchor {config_map} has no key {key:?}"))]
    TrustAnchorKeyMissing {
        config_map: ConfigMapReference,
        key: String,
    },

    #[snafu(display("trust anchor {config_map}/{key} contains no PEM certificates"))]
    NoCertificatesInBundle {
        config_map: ConfigMapReference,
        key: String,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

/// Read access to the `ConfigMap`s of the trust anchor's namespace.
#[async_trait]
pub trait TrustAnchorSource: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<ConfigMap>, kube::Error>;
}

#[async_trait]
impl TrustAnchorSource for Api<ConfigMap> {
    async fn get(&self, name: &str) -> Result<Option<ConfigMap>, kube::Error> {
        self.get_opt(name).await
    }
}

/// Where the CA bundle is stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrustAnchor {
    pub config_map: ConfigMapReference,
    pub key: String,
}

impl Default for TrustAnchor {
    fn default() -> Self {
        Self {
            config_map: ConfigMapReference::new(
                DEFAULT_TRUST_ANCHOR_NAMESPACE,
                DEFAULT_TRUST_ANCHOR_NAME,
            ),
            key: DEFAULT_TRUST_ANCHOR_KEY.to_string(),
        }
    }
}

pub struct TrustAnchorResolver<S> {
    source: S,
    anchor: TrustAnchor,
}

impl<S: TrustAnchorSource> TrustAnchorResolver<S> {
    /// `source` must be scoped to the namespace of `anchor`.
    pub fn new(source: S, anchor: TrustAnchor) -> Self {
        Self { source, anchor }
    }

    pub fn anchor(&self) -> &TrustAnchor {
        &self.anchor
    }

    /// Returns the PEM-encoded CA bundle verbatim.
    pub async fn resolve(&self) -> Result<Vec<u8>> {
        let TrustAnchor { config_map, key } = &self.anchor;
        let cm = self
            .source
            .get(&config_map.name)
            .await
            .context(GetTrustAnchorSnafu {
                config_map: config_map.clone(),
            })?
            .context(TrustAnchorObjectMissingSnafu {
                config_map: config_map.clone(),
            })?;
        let bundle = cm
            .data
            .and_then(|mut data| data.remove(key))
            .context(TrustAnchorKeyMissingSnafu {
                config_map: config_map.clone(),
                key,
            })?
            .into_bytes();
        let certificates = split_pem_certificates(&bundle).len();
        ensure!(
            certificates > 0,
            NoCertificatesInBundleSnafu {
                config_map: config_map.clone(),
                key,
            }
        );
        debug!(%config_map, certificates, "Resolved CA bundle");
        Ok(bundle)
    }
}

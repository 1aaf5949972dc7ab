//! In-memory stand-ins for the cluster, and helpers for inspecting generated material.

use std::{
    collections::BTreeMap,
    net::IpAddr,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use futures::{stream, StreamExt};
use openssl::{
    asn1::Asn1Time,
    bn::BigNum,
    ec::{EcGroup, EcKey},
    hash::MessageDigest,
    nid::Nid,
    pkey::PKey,
    x509::{X509Builder, X509NameBuilder},
};
use stackable_operator::{
    k8s_openapi::{
        api::{
            admissionregistration::v1::{
                MutatingWebhook, MutatingWebhookConfiguration, ValidatingWebhook,
                ValidatingWebhookConfiguration,
            },
            certificates::v1::{CertificateSigningRequest, CertificateSigningRequestStatus},
            core::v1::{ConfigMap, Secret},
        },
        apimachinery::pkg::apis::meta::v1::LabelSelector,
        ByteString,
    },
    kube::{
        self,
        api::{ObjectMeta, WatchEvent},
        core::ErrorResponse,
        Resource,
    },
};
use x509_parser::{extensions::GeneralName, pem::parse_x509_pem, prelude::*};

use crate::{
    csr::{CsrAuthority, CsrEventStream},
    patcher::BindingStore,
    store::RecordStore,
    trust_anchor::TrustAnchorSource,
};

const TEST_CA_PEM: &str = "-----BEGIN CERTIFICATE-----
MIIBkDCCATegAwIBAgIUCYthmb3O484TeIRvIViFtAm8x7QwCgYIKoZIzj0EAwIw
HTEbMBkGA1UEAwwSa3ViZXJuZXRlcy10ZXN0LWNhMCAXDTI2MTAxOTE2MDYwNVoY
DzIxMjYwOTI1MTYwNjA1WjAdMRswGQYDVQQDDBJrdWJlcm5ldGVzLXRlc3QtY2Ew
WTATBgcqhkjOPQIBBggqhkjOPQMBBwNCAARMLSuf7dB+9m5teJ8XHSzxqgflfodw
CCYo40JnthjCaLXTHX4Zfz2td2ft+O9R9DVzH3GugB9eR2fCZZ/MAKtDo1MwUTAd
BgNVHQ4EFgQUxVbckYR7qwzqm6dgmcQ/CkXc7TQwHwYDVR0jBBgwFoAUxVbckYR7
qwzqm6dgmcQ/CkXc7TQwDwYDVR0TAQH/BAUwAwEB/zAKBggqhkjOPQQDAgNHADBE
AiAaIm3Xv8Fr/7f0GPqQEK8OWB2aZfyv0D/ntKJeyrl8KQIgJYoOXLK6YwQmV6h5
vsCceFUYOTE5WcBSfAtqyHrUwd4=
-----END CERTIFICATE-----
";

/// A self-signed CA certificate
pub fn test_ca_pem() -> &'static str {
    TEST_CA_PEM
}

pub fn api_error(code: u16, reason: &str) -> kube::Error {
    kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("injected {reason} error"),
        reason: reason.to_string(),
        code,
    })
}

/// Issues a self-signed certificate for `common_name` that is valid for `days` days.
pub fn self_signed_cert_pem(common_name: &str, days: u32) -> Vec<u8> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    let key = PKey::try_from(EcKey::generate(&group).unwrap()).unwrap();
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_nid(Nid::COMMONNAME, common_name).unwrap();
    let name = name.build();
    let serial = BigNum::from_u32(1).unwrap().to_asn1_integer().unwrap();
    let not_before = Asn1Time::days_from_now(0).unwrap();
    let not_after = Asn1Time::days_from_now(days).unwrap();
    let mut cert = X509Builder::new().unwrap();
    cert.set_version(2).unwrap();
    cert.set_serial_number(&serial).unwrap();
    cert.set_subject_name(&name).unwrap();
    cert.set_issuer_name(&name).unwrap();
    cert.set_pubkey(&key).unwrap();
    cert.set_not_before(&not_before).unwrap();
    cert.set_not_after(&not_after).unwrap();
    cert.sign(&key, MessageDigest::sha256()).unwrap();
    cert.build().to_pem().unwrap()
}

#[derive(Debug)]
pub struct DecodedCsr {
    pub common_name: String,
    pub organization: Vec<String>,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
}

pub fn decode_csr(pem: &[u8]) -> DecodedCsr {
    let (_, pem) = parse_x509_pem(pem).unwrap();
    assert_eq!(pem.label, "CERTIFICATE REQUEST");
    let (_, csr) = X509CertificationRequest::from_der(&pem.contents).unwrap();
    let subject = &csr.certification_request_info.subject;
    let mut decoded = DecodedCsr {
        common_name: subject
            .iter_common_name()
            .map(|cn| cn.as_str().unwrap().to_string())
            .next()
            .unwrap_or_default(),
        organization: subject
            .iter_organization()
            .map(|org| org.as_str().unwrap().to_string())
            .collect(),
        dns_names: Vec::new(),
        ip_addresses: Vec::new(),
    };
    for extension in csr.requested_extensions().into_iter().flatten() {
        if let ParsedExtension::SubjectAlternativeName(san) = extension {
            for name in &san.general_names {
                match name {
                    GeneralName::DNSName(dns) => decoded.dns_names.push(dns.to_string()),
                    GeneralName::IPAddress(ip) => decoded.ip_addresses.push(match ip.len() {
                        4 => IpAddr::from(<[u8; 4]>::try_from(*ip).unwrap()),
                        16 => IpAddr::from(<[u8; 16]>::try_from(*ip).unwrap()),
                        len => panic!("invalid IP address length {len}"),
                    }),
                    _ => {}
                }
            }
        }
    }
    decoded
}

#[derive(Default)]
struct SecretsState {
    secrets: BTreeMap<String, Secret>,
    creates: usize,
    get_error: Option<kube::Error>,
    update_error: Option<kube::Error>,
}

/// A namespace's `Secret`s. Clones share the same contents.
#[derive(Clone, Default)]
pub struct InMemorySecrets(Arc<Mutex<SecretsState>>);

impl InMemorySecrets {
    pub fn secret(&self, name: &str) -> Option<Secret> {
        self.0.lock().unwrap().secrets.get(name).cloned()
    }

    pub fn creates(&self) -> usize {
        self.0.lock().unwrap().creates
    }

    /// Fails the next `get` with `err`
    pub fn fail_gets_with(&self, err: kube::Error) {
        self.0.lock().unwrap().get_error = Some(err);
    }

    /// Fails the next `update` with `err`
    pub fn fail_updates_with(&self, err: kube::Error) {
        self.0.lock().unwrap().update_error = Some(err);
    }
}

#[async_trait]
impl RecordStore for InMemorySecrets {
    async fn get(&self, name: &str) -> Result<Option<Secret>, kube::Error> {
        let mut state = self.0.lock().unwrap();
        match state.get_error.take() {
            Some(err) => Err(err),
            None => Ok(state.secrets.get(name).cloned()),
        }
    }

    async fn create(&self, record: &Secret) -> Result<Secret, kube::Error> {
        let mut state = self.0.lock().unwrap();
        let name = record.metadata.name.clone().unwrap();
        if state.secrets.contains_key(&name) {
            return Err(api_error(409, "AlreadyExists"));
        }
        let mut record = record.clone();
        record.metadata.resource_version = Some("1".to_string());
        state.creates += 1;
        state.secrets.insert(name, record.clone());
        Ok(record)
    }

    async fn update(&self, record: &Secret) -> Result<Secret, kube::Error> {
        let mut state = self.0.lock().unwrap();
        if let Some(err) = state.update_error.take() {
            return Err(err);
        }
        let name = record.metadata.name.clone().unwrap();
        let Some(existing) = state.secrets.get(&name) else {
            return Err(api_error(404, "NotFound"));
        };
        let version: u64 = existing
            .metadata
            .resource_version
            .as_deref()
            .unwrap()
            .parse()
            .unwrap();
        if record.metadata.resource_version != Some(version.to_string()) {
            return Err(api_error(409, "Conflict"));
        }
        // Secret type is immutable
        if record.type_ != existing.type_ {
            return Err(api_error(422, "Invalid"));
        }
        let mut record = record.clone();
        record.metadata.resource_version = Some((version + 1).to_string());
        state.secrets.insert(name, record.clone());
        Ok(record)
    }
}

#[derive(Default)]
struct ConfigMapsState {
    config_maps: BTreeMap<String, ConfigMap>,
    get_error: Option<kube::Error>,
}

#[derive(Clone, Default)]
pub struct InMemoryConfigMaps(Arc<Mutex<ConfigMapsState>>);

impl InMemoryConfigMaps {
    pub fn with<'a>(self, name: &str, data: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let config_map = ConfigMap {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..ObjectMeta::default()
            },
            data: Some(
                data.into_iter()
                    .map(|(key, value)| (key.to_string(), value.to_string()))
                    .collect(),
            ),
            ..ConfigMap::default()
        };
        self.0
            .lock()
            .unwrap()
            .config_maps
            .insert(name.to_string(), config_map);
        self
    }

    pub fn fail_gets_with(&self, err: kube::Error) {
        self.0.lock().unwrap().get_error = Some(err);
    }
}

#[async_trait]
impl TrustAnchorSource for InMemoryConfigMaps {
    async fn get(&self, name: &str) -> Result<Option<ConfigMap>, kube::Error> {
        let mut state = self.0.lock().unwrap();
        match state.get_error.take() {
            Some(err) => Err(err),
            None => Ok(state.config_maps.get(name).cloned()),
        }
    }
}

pub fn pending_csr(name: &str) -> WatchEvent<CertificateSigningRequest> {
    WatchEvent::Modified(CertificateSigningRequest {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..ObjectMeta::default()
        },
        ..CertificateSigningRequest::default()
    })
}

pub fn signed_csr(name: &str, certificate: &[u8]) -> WatchEvent<CertificateSigningRequest> {
    WatchEvent::Modified(CertificateSigningRequest {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..ObjectMeta::default()
        },
        status: Some(CertificateSigningRequestStatus {
            certificate: Some(ByteString(certificate.to_vec())),
            conditions: None,
        }),
        ..CertificateSigningRequest::default()
    })
}

#[derive(Default)]
struct AuthorityState {
    events: Vec<WatchEvent<CertificateSigningRequest>>,
    end_stream: bool,
    delete_error: Option<kube::Error>,
    approval_error: Option<kube::Error>,
    calls: Vec<&'static str>,
    created: Vec<CertificateSigningRequest>,
    approved: Vec<CertificateSigningRequest>,
    watched_selectors: Vec<String>,
}

/// A certificate authority whose watch replays scripted events.
///
/// Unless [`FakeAuthority::ending_stream`] is used, the stream stays open after the scripted
/// events, like a real watch with nothing more to report.
#[derive(Clone, Default)]
pub struct FakeAuthority(Arc<Mutex<AuthorityState>>);

impl FakeAuthority {
    pub fn with_events(
        events: impl IntoIterator<Item = WatchEvent<CertificateSigningRequest>>,
    ) -> Self {
        let authority = Self::default();
        authority.0.lock().unwrap().events = events.into_iter().collect();
        authority
    }

    pub fn ending_stream(self) -> Self {
        self.0.lock().unwrap().end_stream = true;
        self
    }

    pub fn fail_delete_with(self, err: kube::Error) -> Self {
        self.0.lock().unwrap().delete_error = Some(err);
        self
    }

    pub fn reject_approval_with(self, err: kube::Error) -> Self {
        self.0.lock().unwrap().approval_error = Some(err);
        self
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.0.lock().unwrap().calls.clone()
    }

    /// The most recently created request
    pub fn created(&self) -> CertificateSigningRequest {
        self.0.lock().unwrap().created.last().cloned().unwrap()
    }

    /// The most recently approved request
    pub fn approved(&self) -> CertificateSigningRequest {
        self.0.lock().unwrap().approved.last().cloned().unwrap()
    }

    pub fn watched_selector(&self) -> String {
        self.0.lock().unwrap().watched_selectors.last().cloned().unwrap()
    }
}

#[async_trait]
impl CsrAuthority for FakeAuthority {
    async fn delete(&self, _name: &str) -> Result<(), kube::Error> {
        let mut state = self.0.lock().unwrap();
        state.calls.push("delete");
        match state.delete_error.take() {
            Some(err) => Err(err),
            None if state.created.is_empty() => Err(api_error(404, "NotFound")),
            None => Ok(()),
        }
    }

    async fn create(
        &self,
        csr: &CertificateSigningRequest,
    ) -> Result<CertificateSigningRequest, kube::Error> {
        let mut state = self.0.lock().unwrap();
        state.calls.push("create");
        state.created.push(csr.clone());
        Ok(csr.clone())
    }

    async fn update_approval(
        &self,
        csr: &CertificateSigningRequest,
    ) -> Result<CertificateSigningRequest, kube::Error> {
        let mut state = self.0.lock().unwrap();
        state.calls.push("approve");
        if let Some(err) = state.approval_error.take() {
            return Err(err);
        }
        state.approved.push(csr.clone());
        Ok(csr.clone())
    }

    async fn watch(&self, label_selector: &str) -> Result<CsrEventStream, kube::Error> {
        let mut state = self.0.lock().unwrap();
        state.calls.push("watch");
        state.watched_selectors.push(label_selector.to_string());
        let events = stream::iter(std::mem::take(&mut state.events).into_iter().map(Ok));
        Ok(if state.end_stream {
            events.boxed()
        } else {
            events.chain(stream::pending()).boxed()
        })
    }
}

pub fn label_selector(tier: &str) -> LabelSelector {
    LabelSelector {
        match_labels: Some(BTreeMap::from([("tier".to_string(), tier.to_string())])),
        ..LabelSelector::default()
    }
}

/// A `ValidatingWebhookConfiguration` called `name`, with one webhook per
/// `(name, object selector tier)`
pub fn validating_configuration(
    name: &str,
    webhooks: &[(&str, Option<&str>)],
) -> ValidatingWebhookConfiguration {
    ValidatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..ObjectMeta::default()
        },
        webhooks: Some(
            webhooks
                .iter()
                .map(|(name, tier)| ValidatingWebhook {
                    name: name.to_string(),
                    object_selector: tier.map(label_selector),
                    ..ValidatingWebhook::default()
                })
                .collect(),
        ),
    }
}

pub fn mutating_configuration(
    name: &str,
    webhooks: &[(&str, Option<&str>)],
) -> MutatingWebhookConfiguration {
    MutatingWebhookConfiguration {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            ..ObjectMeta::default()
        },
        webhooks: Some(
            webhooks
                .iter()
                .map(|(name, tier)| MutatingWebhook {
                    name: name.to_string(),
                    object_selector: tier.map(label_selector),
                    ..MutatingWebhook::default()
                })
                .collect(),
        ),
    }
}

struct BindingsState<K> {
    bindings: BTreeMap<String, K>,
    updates: usize,
    update_error: Option<kube::Error>,
}

impl<K> Default for BindingsState<K> {
    fn default() -> Self {
        Self {
            bindings: BTreeMap::new(),
            updates: 0,
            update_error: None,
        }
    }
}

/// Cluster-scoped webhook configurations of one kind. Clones share the same contents.
pub struct InMemoryBindings<K>(Arc<Mutex<BindingsState<K>>>);

impl<K> Clone for InMemoryBindings<K> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<K> Default for InMemoryBindings<K> {
    fn default() -> Self {
        Self(Arc::default())
    }
}

impl<K: Resource + Clone> InMemoryBindings<K> {
    pub fn with(self, binding: K) -> Self {
        let name = binding.meta().name.clone().unwrap();
        self.0.lock().unwrap().bindings.insert(name, binding);
        self
    }

    pub fn binding(&self, name: &str) -> Option<K> {
        self.0.lock().unwrap().bindings.get(name).cloned()
    }

    pub fn updates(&self) -> usize {
        self.0.lock().unwrap().updates
    }

    pub fn fail_updates_with(&self, err: kube::Error) {
        self.0.lock().unwrap().update_error = Some(err);
    }
}

#[async_trait]
impl<K: Resource + Clone + Send + Sync + 'static> BindingStore<K> for InMemoryBindings<K> {
    async fn get(&self, name: &str) -> Result<K, kube::Error> {
        self.binding(name).ok_or_else(|| api_error(404, "NotFound"))
    }

    async fn update(&self, binding: &K) -> Result<K, kube::Error> {
        let mut state = self.0.lock().unwrap();
        if let Some(err) = state.update_error.take() {
            return Err(err);
        }
        let name = binding.meta().name.clone().unwrap();
        if !state.bindings.contains_key(&name) {
            return Err(api_error(404, "NotFound"));
        }
        state.updates += 1;
        state.bindings.insert(name, binding.clone());
        Ok(binding.clone())
    }
}

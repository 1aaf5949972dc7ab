//! Derives the endpoint identity of a webhook service and generates the key pair and
//! certificate signing request (CSR) that are submitted for it.

use std::net::IpAddr;

use openssl::{
    ec::{EcGroup, EcKey},
    error::ErrorStack,
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, Private},
    rsa::Rsa,
    stack::Stack,
    x509::{extension::SubjectAlternativeName, X509NameBuilder, X509ReqBuilder},
};
use snafu::{ensure, ResultExt, Snafu};

/// Size of generated RSA keys
pub const RSA_KEY_BITS: u32 = 2048;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to generate {algorithm} private key"))]
    GenerateKey {
        source: ErrorStack,
        algorithm: KeyAlgorithm,
    },

    #[snafu(display("certificate signing request requires a non-empty common name"))]
    EmptyCommonName,

    #[snafu(display("failed to build certificate signing request for {common_name:?}"))]
    BuildCsr {
        source: ErrorStack,
        common_name: String,
    },

    #[snafu(display("failed to serialize private key"))]
    SerializeKey { source: ErrorStack },
}
type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, clap::ValueEnum, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum KeyAlgorithm {
    /// RSA with a 2048 bit modulus
    #[default]
    Rsa,
    /// ECDSA over the NIST P-256 curve
    Ecdsa,
}

/// The names and addresses a certificate is requested for.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Identity {
    pub common_name: String,
    pub organization: Vec<String>,
    pub dns_names: Vec<String>,
    pub ip_addresses: Vec<IpAddr>,
}

impl Identity {
    /// The identity of the in-cluster `Service` `service` in `namespace`.
    ///
    /// The common name is `<service>.<namespace>`, and the DNS names cover the short,
    /// `.svc` and fully qualified `.svc.cluster.local` forms.
    pub fn for_service(service: &str, namespace: &str, organization: Vec<String>) -> Self {
        let host = format!("{service}.{namespace}");
        Self {
            dns_names: vec![
                host.clone(),
                format!("{host}.svc"),
                format!("{host}.svc.cluster.local"),
            ],
            common_name: host,
            organization,
            ip_addresses: Vec::new(),
        }
    }
}

/// A freshly generated private key, owned by the provisioning run that created it.
pub struct KeyMaterial {
    key: PKey<Private>,
    algorithm: KeyAlgorithm,
}

impl KeyMaterial {
    pub fn generate(algorithm: KeyAlgorithm) -> Result<Self> {
        let key = match algorithm {
            KeyAlgorithm::Rsa => Rsa::generate(RSA_KEY_BITS).and_then(PKey::try_from),
            KeyAlgorithm::Ecdsa => EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)
                .and_then(|group| EcKey::generate(&group))
                .and_then(PKey::try_from),
        }
        .context(GenerateKeySnafu { algorithm })?;
        Ok(Self { key, algorithm })
    }

    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }

    /// PKCS#8 PEM encoding of the private key
    pub fn to_pem(&self) -> Result<Vec<u8>> {
        self.key.private_key_to_pem_pkcs8().context(SerializeKeySnafu)
    }
}

/// Generates a new key pair and a PEM-encoded CSR for `identity`.
///
/// The subject carries the common name and organizations. DNS names and IP addresses are
/// copied into the subject alternative names in the given order, without deduplication.
pub fn generate(identity: &Identity, algorithm: KeyAlgorithm) -> Result<(KeyMaterial, Vec<u8>)> {
    ensure!(!identity.common_name.is_empty(), EmptyCommonNameSnafu);
    let key = KeyMaterial::generate(algorithm)?;
    let csr_pem = build_csr(identity, &key.key).context(BuildCsrSnafu {
        common_name: &identity.common_name,
    })?;
    Ok((key, csr_pem))
}

fn build_csr(identity: &Identity, key: &PKey<Private>) -> Result<Vec<u8>, ErrorStack> {
    let subject_name = X509NameBuilder::new()
        .and_then(|mut name| {
            name.append_entry_by_nid(Nid::COMMONNAME, &identity.common_name)?;
            for org in &identity.organization {
                name.append_entry_by_nid(Nid::ORGANIZATIONNAME, org)?;
            }
            Ok(name)
        })?
        .build();
    let mut req = X509ReqBuilder::new()?;
    req.set_version(0)?;
    req.set_subject_name(&subject_name)?;
    req.set_pubkey(key)?;
    if !identity.dns_names.is_empty() || !identity.ip_addresses.is_empty() {
        let mut san_ext = SubjectAlternativeName::new();
        for dns in &identity.dns_names {
            san_ext.dns(dns);
        }
        for ip in &identity.ip_addresses {
            san_ext.ip(&ip.to_string());
        }
        let san_ext = san_ext.build(&req.x509v3_context(None))?;
        let mut exts = Stack::new()?;
        exts.push(san_ext)?;
        req.add_extensions(&exts)?;
    }
    req.sign(key, MessageDigest::sha256())?;
    req.build().to_pem()
}

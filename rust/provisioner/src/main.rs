use std::{io::Write, path::PathBuf};

use anyhow::Context;
use clap::{crate_description, crate_version, Parser};
use stackable_operator::{
    k8s_openapi::api::{
        admissionregistration::v1::{MutatingWebhookConfiguration, ValidatingWebhookConfiguration},
        certificates::v1::CertificateSigningRequest,
        core::v1::{ConfigMap, Secret},
    },
    kube::Api,
    logging::TracingTarget,
};
use webhook_cert_provisioner::{
    csr::{SelfApprove, DEFAULT_SIGNER_NAME},
    identity::{self, Identity, KeyAlgorithm},
    patcher::{default_bindings, WebhookBindings},
    provision::{
        default_cert_dir, Collaborators, ProvisionConfig, Provisioner, DEFAULT_CSR_NAME,
        DEFAULT_NAMESPACE, DEFAULT_ORGANIZATION, DEFAULT_SECRET_NAME, DEFAULT_SERVICE_NAME,
    },
    trust_anchor::TrustAnchor,
    utils::error_full_message,
};

pub const APP_NAME: &str = "webhook-cert-provisioner";
const FIELD_MANAGER: &str = "webhook-cert-provisioner";

#[derive(clap::Parser)]
#[clap(author, version, about)]
struct Opts {
    #[clap(subcommand)]
    cmd: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Provision the serving certificate and patch the webhook configurations
    Run(ProvisionerRun),
    /// Print a newly generated private key and certificate signing request, without contacting
    /// the cluster
    GenerateCsr(IdentityArgs),
}

#[derive(clap::Args)]
struct IdentityArgs {
    /// Subject organization, may be given multiple times
    #[arg(
        long = "organization",
        env = "ORGANIZATION",
        value_delimiter = ',',
        default_value = DEFAULT_ORGANIZATION
    )]
    organizations: Vec<String>,
    /// Namespace of the webhook service
    #[arg(long, env, default_value = DEFAULT_NAMESPACE)]
    namespace: String,
    #[arg(long, env, default_value = DEFAULT_SERVICE_NAME)]
    service_name: String,
    #[arg(long, env, default_value_t, value_enum)]
    key_type: KeyAlgorithm,
}

#[derive(clap::Args)]
struct ProvisionerRun {
    #[clap(flatten)]
    identity: IdentityArgs,
    /// Directory that tls.crt and tls.key are written to
    #[arg(long, env, default_value_os_t = default_cert_dir())]
    cert_dir: PathBuf,
    /// Secret that stores the key material between runs
    #[arg(long, env, default_value = DEFAULT_SECRET_NAME)]
    secret_name: String,
    #[arg(long, env, default_value = DEFAULT_CSR_NAME)]
    csr_name: String,
    /// Signer to request the certificate from, it must accept `<service>.<namespace>` subjects
    #[arg(long, env, default_value = DEFAULT_SIGNER_NAME)]
    signer_name: String,
    /// Replace any stored key and certificate
    #[arg(long, env)]
    force_regenerate: bool,
    /// ValidatingWebhookConfiguration to patch, may be given multiple times
    #[arg(long = "validating-webhook", env = "VALIDATING_WEBHOOKS", value_delimiter = ',')]
    validating_webhooks: Vec<String>,
    /// MutatingWebhookConfiguration to patch, may be given multiple times
    #[arg(long = "mutating-webhook", env = "MUTATING_WEBHOOKS", value_delimiter = ',')]
    mutating_webhooks: Vec<String>,
    /// YAML list of webhook bindings, including selector overrides
    #[arg(long, env)]
    bindings_file: Option<PathBuf>,
    /// Tracing log collector system
    #[arg(long, env, default_value_t, value_enum)]
    tracing_target: TracingTarget,
}

impl IdentityArgs {
    fn identity(&self) -> Identity {
        Identity::for_service(
            &self.service_name,
            &self.namespace,
            self.organizations.clone(),
        )
    }
}

impl ProvisionerRun {
    fn bindings(&self) -> anyhow::Result<Vec<WebhookBindings>> {
        let mut bindings: Vec<WebhookBindings> = match &self.bindings_file {
            Some(path) => serde_yaml::from_reader(
                std::fs::File::open(path)
                    .with_context(|| format!("failed to open bindings file {}", path.display()))?,
            )
            .with_context(|| format!("failed to parse bindings file {}", path.display()))?,
            None => Vec::new(),
        };
        bindings.extend(self.validating_webhooks.iter().map(|name| WebhookBindings {
            validating_name: Some(name.clone()),
            ..WebhookBindings::default()
        }));
        bindings.extend(self.mutating_webhooks.iter().map(|name| WebhookBindings {
            mutating_name: Some(name.clone()),
            ..WebhookBindings::default()
        }));
        if bindings.is_empty() {
            bindings = default_bindings();
        }
        Ok(bindings)
    }

    fn config(&self) -> anyhow::Result<ProvisionConfig> {
        Ok(ProvisionConfig {
            bindings: self.bindings()?,
            organization: self.identity.organizations.clone(),
            namespace: self.identity.namespace.clone(),
            service_name: self.identity.service_name.clone(),
            key_algorithm: self.identity.key_type,
            cert_dir: self.cert_dir.clone(),
            secret_name: self.secret_name.clone(),
            csr_name: self.csr_name.clone(),
            signer_name: self.signer_name.clone(),
            force_regenerate: self.force_regenerate,
            trust_anchor: TrustAnchor::default(),
        })
    }
}

mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
    pub const TARGET: Option<&str> = option_env!("TARGET");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = Opts::parse();
    match opts.cmd {
        Command::GenerateCsr(args) => {
            let (key, csr_pem) = identity::generate(&args.identity(), args.key_type)?;
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&key.to_pem()?)?;
            stdout.write_all(&csr_pem)?;
        }
        Command::Run(run) => {
            let config = run.config()?;
            stackable_operator::logging::initialize_logging(
                "WEBHOOK_CERT_PROVISIONER_LOG",
                APP_NAME,
                run.tracing_target,
            );
            stackable_operator::utils::print_startup_string(
                crate_description!(),
                crate_version!(),
                built_info::GIT_VERSION,
                built_info::TARGET.unwrap_or("unknown target"),
                built_info::BUILT_TIME_UTC,
                built_info::RUSTC_VERSION,
            );
            let client =
                stackable_operator::client::create_client(Some(FIELD_MANAGER.to_string())).await?;
            let kube = client.as_kube_client();
            let collaborators = Collaborators {
                records: Api::<Secret>::namespaced(kube.clone(), &config.namespace),
                authority: Api::<CertificateSigningRequest>::all(kube.clone()),
                trust_anchor: Api::<ConfigMap>::namespaced(
                    kube.clone(),
                    &config.trust_anchor.config_map.namespace,
                ),
                validating: Api::<ValidatingWebhookConfiguration>::all(kube.clone()),
                mutating: Api::<MutatingWebhookConfiguration>::all(kube),
            };
            let provisioner = Provisioner::new(config, collaborators, SelfApprove);
            if let Err(err) = provisioner.run().await {
                tracing::error!(
                    error.category = err.category(),
                    error.message = %error_full_message(&err),
                    "Provisioning failed"
                );
                return Err(err.into());
            }
        }
    }
    Ok(())
}

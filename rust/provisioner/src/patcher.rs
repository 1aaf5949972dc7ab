//! Propagates the webhook service coordinates and CA bundle into the admission webhook
//! configurations that call the service.

use std::{collections::BTreeMap, fmt::Debug};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use stackable_operator::{
    k8s_openapi::{
        api::admissionregistration::v1::{
            MutatingWebhook, MutatingWebhookConfiguration, ServiceReference, ValidatingWebhook,
            ValidatingWebhookConfiguration, WebhookClientConfig,
        },
        apimachinery::pkg::apis::meta::v1::LabelSelector,
        ByteString,
    },
    kube::{self, api::PostParams, runtime::reflector::ObjectRef, Api, Resource},
};
use tracing::{debug, info};

pub const DEFAULT_VALIDATING_BINDING: &str = "validating-webhook-configuration";
pub const DEFAULT_MUTATING_BINDING: &str = "mutating-webhook-configuration";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to get {binding}"))]
    GetBinding {
        source: kube::Error,
        binding: String,
    },

    #[snafu(display("failed to update {binding}"))]
    UpdateBinding {
        source: kube::Error,
        binding: String,
    },
}
type Result<T, E = Error> = std::result::Result<T, E>;

/// Describes which webhook configurations to patch, and the selector overrides to apply to
/// their webhooks.
#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookBindings {
    /// Name of a `ValidatingWebhookConfiguration`, if any.
    #[serde(default)]
    pub validating_name: Option<String>,
    /// Name of a `MutatingWebhookConfiguration`, if any.
    #[serde(default)]
    pub mutating_name: Option<String>,
    /// Namespace selector overrides, keyed by webhook name.
    #[serde(default)]
    pub namespace_selectors: BTreeMap<String, LabelSelector>,
    /// Object selector overrides, keyed by webhook name.
    #[serde(default)]
    pub object_selectors: BTreeMap<String, LabelSelector>,
}

/// Bindings used when none are configured: the mutating configuration, then the validating one.
pub fn default_bindings() -> Vec<WebhookBindings> {
    vec![
        WebhookBindings {
            mutating_name: Some(DEFAULT_MUTATING_BINDING.to_string()),
            ..WebhookBindings::default()
        },
        WebhookBindings {
            validating_name: Some(DEFAULT_VALIDATING_BINDING.to_string()),
            ..WebhookBindings::default()
        },
    ]
}

/// One webhook inside a webhook configuration
pub trait WebhookEntry {
    fn name(&self) -> &str;
    fn client_config_mut(&mut self) -> &mut WebhookClientConfig;
    fn namespace_selector_mut(&mut self) -> &mut Option<LabelSelector>;
    fn object_selector_mut(&mut self) -> &mut Option<LabelSelector>;
}

pub trait WebhookConfiguration: Resource<DynamicType = ()> + Send + Sync {
    type Entry: WebhookEntry;

    fn entries_mut(&mut self) -> &mut [Self::Entry];
}

macro_rules! webhook_configuration {
    ($configuration:ty, $entry:ty) => {
        impl WebhookEntry for $entry {
            fn name(&self) -> &str {
                &self.name
            }

            fn client_config_mut(&mut self) -> &mut WebhookClientConfig {
                &mut self.client_config
            }

            fn namespace_selector_mut(&mut self) -> &mut Option<LabelSelector> {
                &mut self.namespace_selector
            }

            fn object_selector_mut(&mut self) -> &mut Option<LabelSelector> {
                &mut self.object_selector
            }
        }

        impl WebhookConfiguration for $configuration {
            type Entry = $entry;

            fn entries_mut(&mut self) -> &mut [Self::Entry] {
                self.webhooks.as_deref_mut().unwrap_or_default()
            }
        }
    };
}

webhook_configuration!(ValidatingWebhookConfiguration, ValidatingWebhook);
webhook_configuration!(MutatingWebhookConfiguration, MutatingWebhook);

/// Cluster-scoped storage of one kind of webhook configuration.
#[async_trait]
pub trait BindingStore<K>: Send + Sync {
    async fn get(&self, name: &str) -> Result<K, kube::Error>;
    async fn update(&self, binding: &K) -> Result<K, kube::Error>;
}

#[async_trait]
impl<K> BindingStore<K> for Api<K>
where
    K: Resource + Clone + Debug + DeserializeOwned + Serialize + Send + Sync + 'static,
{
    async fn get(&self, name: &str) -> Result<K, kube::Error> {
        Api::get(self, name).await
    }

    async fn update(&self, binding: &K) -> Result<K, kube::Error> {
        let name = binding.meta().name.as_deref().unwrap_or_default();
        self.replace(name, &PostParams::default(), binding).await
    }
}

/// Rewrites every webhook of `configuration` to call `service_name` in `service_namespace`
/// and trust `ca_bundle`. Selectors are only replaced for webhooks that `bindings` has an
/// override for.
pub fn patch_configuration<K: WebhookConfiguration>(
    configuration: &mut K,
    bindings: &WebhookBindings,
    service_name: &str,
    service_namespace: &str,
    ca_bundle: &[u8],
) {
    for entry in configuration.entries_mut() {
        if let Some(selector) = bindings.namespace_selectors.get(entry.name()) {
            *entry.namespace_selector_mut() = Some(selector.clone());
        }
        if let Some(selector) = bindings.object_selectors.get(entry.name()) {
            *entry.object_selector_mut() = Some(selector.clone());
        }
        let client_config = entry.client_config_mut();
        client_config.ca_bundle = Some(ByteString(ca_bundle.to_vec()));
        let service = client_config
            .service
            .get_or_insert_with(ServiceReference::default);
        service.name = service_name.to_string();
        service.namespace = service_namespace.to_string();
    }
}

pub struct ConfigurationPatcher<V, M> {
    validating: V,
    mutating: M,
}

impl<V, M> ConfigurationPatcher<V, M>
where
    V: BindingStore<ValidatingWebhookConfiguration>,
    M: BindingStore<MutatingWebhookConfiguration>,
{
    pub fn new(validating: V, mutating: M) -> Self {
        Self {
            validating,
            mutating,
        }
    }

    /// Patches every configuration named by `bindings`, in order.
    ///
    /// Stops at the first failure, leaving later configurations untouched.
    pub async fn apply(
        &self,
        bindings: &[WebhookBindings],
        service_name: &str,
        service_namespace: &str,
        ca_bundle: &[u8],
    ) -> Result<()> {
        for binding in bindings {
            if let Some(name) = non_empty(&binding.validating_name) {
                patch_binding(
                    &self.validating,
                    name,
                    binding,
                    service_name,
                    service_namespace,
                    ca_bundle,
                )
                .await?;
            }
            if let Some(name) = non_empty(&binding.mutating_name) {
                patch_binding(
                    &self.mutating,
                    name,
                    binding,
                    service_name,
                    service_namespace,
                    ca_bundle,
                )
                .await?;
            }
        }
        Ok(())
    }
}

fn non_empty(name: &Option<String>) -> Option<&str> {
    name.as_deref().filter(|name| !name.is_empty())
}

async fn patch_binding<K: WebhookConfiguration>(
    store: &impl BindingStore<K>,
    name: &str,
    bindings: &WebhookBindings,
    service_name: &str,
    service_namespace: &str,
    ca_bundle: &[u8],
) -> Result<()> {
    let binding = ObjectRef::<K>::new(name).to_string();
    let mut configuration = store
        .get(name)
        .await
        .with_context(|_| GetBindingSnafu {
            binding: binding.clone(),
        })?;
    patch_configuration(
        &mut configuration,
        bindings,
        service_name,
        service_namespace,
        ca_bundle,
    );
    debug!(
        %binding,
        webhooks = configuration.entries_mut().len(),
        "Writing back patched webhook configuration"
    );
    store
        .update(&configuration)
        .await
        .with_context(|_| UpdateBindingSnafu {
            binding: binding.clone(),
        })?;
    info!(
        %binding,
        service.name = service_name,
        service.namespace = service_namespace,
        "Patched webhook configuration"
    );
    Ok(())
}

//! Reference data loaded from the `[catalog]` section of the config file.
//!
//! An empty catalog yields a single provider and model built from the
//! `[llm]` section plus the built-in templates.

use std::collections::BTreeSet;

use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;

use crate::config::LlmConfig;
use crate::domain::operation::{Capability, OperationType};
use crate::domain::provider::{Model, ModelId, Provider, ProviderId};
use crate::domain::template::Template;
use crate::registry::{ProviderRegistry, RegistryError};
use crate::templates::{TemplateStore, TemplateStoreError};

#[derive(Clone, Debug, Default, Deserialize)]
pub struct CatalogConfig {
    #[serde(default)]
    pub providers: Vec<ProviderEntry>,
    #[serde(default)]
    pub models: Vec<ModelEntry>,
    #[serde(default)]
    pub templates: Vec<TemplateEntry>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ProviderEntry {
    pub id: String,
    pub display_name: Option<String>,
    pub base_url: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    pub provider: String,
    pub display_name: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default)]
    pub cost_per_1k_tokens: Decimal,
    pub capabilities: Vec<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub priority: u32,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TemplateEntry {
    pub name: String,
    pub operation: String,
    pub prompt_template: String,
    #[serde(default)]
    pub system_message: String,
    #[serde(default = "default_template_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_true")]
    pub active: bool,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("catalog model `{model}` lists unknown capability `{capability}`")]
    UnknownCapability { model: String, capability: String },
    #[error("catalog template `{template}` names unknown operation `{operation}`")]
    UnknownOperation { template: String, operation: String },
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Template(#[from] TemplateStoreError),
}

fn default_true() -> bool {
    true
}

fn default_max_tokens() -> u32 {
    4096
}

fn default_requests_per_minute() -> u32 {
    60
}

fn default_template_max_tokens() -> u32 {
    500
}

fn default_temperature() -> f32 {
    0.7
}

impl CatalogConfig {
    pub fn build_registry(&self, llm: &LlmConfig) -> Result<ProviderRegistry, CatalogError> {
        if self.providers.is_empty() && self.models.is_empty() {
            return Ok(ProviderRegistry::new(vec![fallback_provider(llm)], vec![fallback_model(llm)])?);
        }

        let providers = self
            .providers
            .iter()
            .map(|entry| Provider {
                id: ProviderId(entry.id.clone()),
                display_name: entry.display_name.clone().unwrap_or_else(|| entry.id.clone()),
                base_url: entry.base_url.clone(),
                active: entry.active,
                max_tokens: entry.max_tokens,
                requests_per_minute: entry.requests_per_minute,
            })
            .collect();

        let mut models = Vec::with_capacity(self.models.len());
        for entry in &self.models {
            let mut capabilities = BTreeSet::new();
            for raw in &entry.capabilities {
                let capability =
                    Capability::parse(raw).ok_or_else(|| CatalogError::UnknownCapability {
                        model: entry.id.clone(),
                        capability: raw.clone(),
                    })?;
                capabilities.insert(capability);
            }
            models.push(Model {
                id: ModelId(entry.id.clone()),
                provider_id: ProviderId(entry.provider.clone()),
                display_name: entry.display_name.clone().unwrap_or_else(|| entry.id.clone()),
                max_tokens: entry.max_tokens,
                cost_per_1k_tokens: entry.cost_per_1k_tokens,
                capabilities,
                active: entry.active,
                priority: entry.priority,
            });
        }

        Ok(ProviderRegistry::new(providers, models)?)
    }

    /// Built-in templates, with catalog entries added on top. An active
    /// catalog template replaces the built-in one for its operation.
    pub fn build_templates(&self) -> Result<TemplateStore, CatalogError> {
        let mut store = TemplateStore::with_defaults();

        for entry in &self.templates {
            let operation = OperationType::parse(&entry.operation).ok_or_else(|| {
                CatalogError::UnknownOperation {
                    template: entry.name.clone(),
                    operation: entry.operation.clone(),
                }
            })?;

            store.register(Template {
                name: entry.name.clone(),
                operation,
                prompt_template: entry.prompt_template.clone(),
                system_message: entry.system_message.clone(),
                max_tokens: entry.max_tokens,
                temperature: entry.temperature,
                active: false,
            })?;
            if entry.active {
                store.activate(&entry.name)?;
            }
        }

        Ok(store)
    }
}

fn fallback_provider(llm: &LlmConfig) -> Provider {
    Provider {
        id: ProviderId(llm.provider.as_str().to_string()),
        display_name: llm.provider.as_str().to_string(),
        base_url: llm.resolved_base_url(),
        active: true,
        max_tokens: default_max_tokens(),
        requests_per_minute: llm.requests_per_minute,
    }
}

fn fallback_model(llm: &LlmConfig) -> Model {
    Model {
        id: ModelId(llm.model.clone()),
        provider_id: ProviderId(llm.provider.as_str().to_string()),
        display_name: llm.model.clone(),
        max_tokens: default_max_tokens(),
        cost_per_1k_tokens: Decimal::ZERO,
        capabilities: [
            Capability::TextGeneration,
            Capability::Summarization,
            Capability::Analysis,
            Capability::Reasoning,
        ]
        .into_iter()
        .collect(),
        active: true,
        priority: 0,
    }
}

//! Provider Registry
//!
//! Reference data for the external model providers and the models they
//! serve. Selection is deterministic: among active models of active
//! providers that advertise the capability an operation needs, the lowest
//! priority value wins and ties fall back to load order.

use std::collections::BTreeSet;

use rust_decimal::Decimal;
use thiserror::Error;

use crate::domain::operation::OperationType;
use crate::domain::provider::{Model, ModelId, Provider, ProviderId};
use crate::errors::DispatchError;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("duplicate provider id `{0}`")]
    DuplicateProvider(String),
    #[error("duplicate model id `{0}`")]
    DuplicateModel(String),
    #[error("model `{model}` references unknown provider `{provider}`")]
    UnknownProvider { model: String, provider: String },
    #[error("model `{0}` has a negative cost per 1k tokens")]
    NegativeCost(String),
    #[error("provider `{0}` not registered")]
    ProviderNotFound(String),
    #[error("model `{0}` not registered")]
    ModelNotFound(String),
}

/// Provider and model chosen for one dispatch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModelSelection {
    pub provider: Provider,
    pub model: Model,
}

#[derive(Clone, Debug, Default)]
pub struct ProviderRegistry {
    providers: Vec<Provider>,
    models: Vec<Model>,
}

impl ProviderRegistry {
    pub fn new(providers: Vec<Provider>, models: Vec<Model>) -> Result<Self, RegistryError> {
        let mut provider_ids = BTreeSet::new();
        for provider in &providers {
            if !provider_ids.insert(provider.id.clone()) {
                return Err(RegistryError::DuplicateProvider(provider.id.0.clone()));
            }
        }

        let mut model_ids = BTreeSet::new();
        for model in &models {
            if !model_ids.insert(model.id.clone()) {
                return Err(RegistryError::DuplicateModel(model.id.0.clone()));
            }
            if !provider_ids.contains(&model.provider_id) {
                return Err(RegistryError::UnknownProvider {
                    model: model.id.0.clone(),
                    provider: model.provider_id.0.clone(),
                });
            }
            if model.cost_per_1k_tokens < Decimal::ZERO {
                return Err(RegistryError::NegativeCost(model.id.0.clone()));
            }
        }

        Ok(Self { providers, models })
    }

    pub fn providers(&self) -> &[Provider] {
        &self.providers
    }

    pub fn models(&self) -> &[Model] {
        &self.models
    }

    pub fn provider(&self, id: &ProviderId) -> Option<&Provider> {
        self.providers.iter().find(|provider| &provider.id == id)
    }

    pub fn model(&self, id: &ModelId) -> Option<&Model> {
        self.models.iter().find(|model| &model.id == id)
    }

    pub fn active_model(&self, operation: OperationType) -> Result<ModelSelection, DispatchError> {
        let capability = operation.required_capability();

        self.models
            .iter()
            .enumerate()
            .filter(|(_, model)| model.active && model.supports(capability))
            .filter_map(|(index, model)| {
                self.provider(&model.provider_id)
                    .filter(|provider| provider.active)
                    .map(|provider| (model.priority, index, provider, model))
            })
            .min_by_key(|(priority, index, _, _)| (*priority, *index))
            .map(|(_, _, provider, model)| ModelSelection {
                provider: provider.clone(),
                model: model.clone(),
            })
            .ok_or(DispatchError::NoCapableModel { operation })
    }

    pub fn set_provider_active(
        &mut self,
        id: &ProviderId,
        active: bool,
    ) -> Result<(), RegistryError> {
        let provider = self
            .providers
            .iter_mut()
            .find(|provider| &provider.id == id)
            .ok_or_else(|| RegistryError::ProviderNotFound(id.0.clone()))?;
        provider.active = active;
        Ok(())
    }

    pub fn set_model_active(&mut self, id: &ModelId, active: bool) -> Result<(), RegistryError> {
        let model = self
            .models
            .iter_mut()
            .find(|model| &model.id == id)
            .ok_or_else(|| RegistryError::ModelNotFound(id.0.clone()))?;
        model.active = active;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use rust_decimal::Decimal;

    use super::{ProviderRegistry, RegistryError};
    use crate::domain::operation::{Capability, OperationType};
    use crate::domain::provider::{Model, ModelId, Provider, ProviderId};
    use crate::errors::DispatchError;

    fn provider(id: &str) -> Provider {
        Provider {
            id: ProviderId(id.to_string()),
            display_name: id.to_uppercase(),
            base_url: format!("https://{id}.example.test/v1"),
            active: true,
            max_tokens: 8000,
            requests_per_minute: 60,
        }
    }

    fn model(id: &str, provider: &str, priority: u32, capabilities: &[Capability]) -> Model {
        Model {
            id: ModelId(id.to_string()),
            provider_id: ProviderId(provider.to_string()),
            display_name: id.to_string(),
            max_tokens: 4000,
            cost_per_1k_tokens: Decimal::new(2, 3),
            capabilities: capabilities.iter().copied().collect::<BTreeSet<_>>(),
            active: true,
            priority,
        }
    }

    #[test]
    fn lowest_priority_capable_model_wins() {
        let registry = ProviderRegistry::new(
            vec![provider("openai")],
            vec![
                model("big", "openai", 5, &[Capability::Summarization, Capability::Reasoning]),
                model("small", "openai", 1, &[Capability::Summarization]),
            ],
        )
        .expect("registry");

        let selection = registry.active_model(OperationType::Summarize).expect("selection");
        assert_eq!(selection.model.id.0, "small");

        let selection = registry.active_model(OperationType::TaskBreakdown).expect("selection");
        assert_eq!(selection.model.id.0, "big");
    }

    #[test]
    fn equal_priority_falls_back_to_load_order() {
        let registry = ProviderRegistry::new(
            vec![provider("openai")],
            vec![
                model("first", "openai", 0, &[Capability::Analysis]),
                model("second", "openai", 0, &[Capability::Analysis]),
            ],
        )
        .expect("registry");

        let selection = registry.active_model(OperationType::ExtractKeywords).expect("selection");
        assert_eq!(selection.model.id.0, "first");
    }

    #[test]
    fn inactive_provider_hides_its_models() {
        let mut registry = ProviderRegistry::new(
            vec![provider("openai"), provider("backup")],
            vec![
                model("primary", "openai", 0, &[Capability::Analysis]),
                model("fallback", "backup", 9, &[Capability::Analysis]),
            ],
        )
        .expect("registry");

        registry.set_provider_active(&ProviderId("openai".to_string()), false).expect("toggle");
        let selection = registry.active_model(OperationType::AnalyzeSentiment).expect("selection");
        assert_eq!(selection.provider.id.0, "backup");

        registry.set_model_active(&ModelId("fallback".to_string()), false).expect("toggle");
        assert_eq!(
            registry.active_model(OperationType::AnalyzeSentiment),
            Err(DispatchError::NoCapableModel { operation: OperationType::AnalyzeSentiment })
        );
    }

    #[test]
    fn load_rejects_dangling_and_negative_cost_models() {
        let dangling = ProviderRegistry::new(
            vec![provider("openai")],
            vec![model("orphan", "missing", 0, &[Capability::Analysis])],
        );
        assert!(matches!(dangling, Err(RegistryError::UnknownProvider { .. })));

        let mut negative = model("cheap", "openai", 0, &[Capability::Analysis]);
        negative.cost_per_1k_tokens = Decimal::new(-1, 2);
        let rejected = ProviderRegistry::new(vec![provider("openai")], vec![negative]);
        assert_eq!(rejected.err(), Some(RegistryError::NegativeCost("cheap".to_string())));
    }
}

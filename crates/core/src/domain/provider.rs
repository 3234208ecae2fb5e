use std::collections::BTreeSet;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::operation::Capability;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProviderId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModelId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provider {
    pub id: ProviderId,
    pub display_name: String,
    pub base_url: String,
    pub active: bool,
    pub max_tokens: u32,
    pub requests_per_minute: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    pub id: ModelId,
    pub provider_id: ProviderId,
    pub display_name: String,
    pub max_tokens: u32,
    pub cost_per_1k_tokens: Decimal,
    pub capabilities: BTreeSet<Capability>,
    pub active: bool,
    /// Lower values are preferred when several models qualify.
    pub priority: u32,
}

impl Model {
    pub fn supports(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
    }

    /// Cost of `tokens` at this model's per-1k rate.
    pub fn cost_for(&self, tokens: u32) -> Decimal {
        Decimal::from(tokens) * self.cost_per_1k_tokens / Decimal::from(1000)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use rust_decimal::Decimal;

    use super::{Model, ModelId, ProviderId};
    use crate::domain::operation::Capability;

    #[test]
    fn cost_is_prorated_per_thousand_tokens() {
        let model = Model {
            id: ModelId("gpt-4o-mini".to_string()),
            provider_id: ProviderId("openai".to_string()),
            display_name: "GPT-4o mini".to_string(),
            max_tokens: 4000,
            cost_per_1k_tokens: Decimal::new(2, 3),
            capabilities: BTreeSet::from([Capability::Summarization]),
            active: true,
            priority: 0,
        };

        assert_eq!(model.cost_for(1500), Decimal::new(3, 3));
        assert!(model.supports(Capability::Summarization));
        assert!(!model.supports(Capability::Reasoning));
    }
}

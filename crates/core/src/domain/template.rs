use serde::{Deserialize, Serialize};

use crate::domain::operation::OperationType;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    pub operation: OperationType,
    pub prompt_template: String,
    pub system_message: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub active: bool,
}

/// Fully substituted prompt ready to send to a provider.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RenderedPrompt {
    pub template_name: String,
    pub system_message: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

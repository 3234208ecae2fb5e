//! Template Store
//!
//! Named prompt templates with `{name}` placeholders. Rendering is plain
//! string interpolation: substituted values are copied verbatim and never
//! scanned for further placeholders. `{{` and `}}` produce literal braces.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::domain::operation::OperationType;
use crate::domain::template::{RenderedPrompt, Template};
use crate::errors::DispatchError;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum TemplateStoreError {
    #[error("template `{0}` already registered")]
    DuplicateName(String),
    #[error("operation `{operation}` already has active template `{active}`")]
    ActiveConflict { operation: OperationType, active: String },
    #[error("template `{0}` not found")]
    NotFound(String),
    #[error("template `{name}` temperature {temperature} is outside 0.0..=1.0")]
    Temperature { name: String, temperature: f32 },
    #[error("template `{name}` is malformed: {reason}")]
    Malformed { name: String, reason: String },
}

#[derive(Clone, Debug, Default)]
pub struct TemplateStore {
    templates: Vec<Template>,
}

impl TemplateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store preloaded with one active template per operation.
    pub fn with_defaults() -> Self {
        let mut store = Self::new();
        for template in default_templates() {
            // Built-in templates are distinct per operation and well formed.
            let _ = store.register(template);
        }
        store
    }

    pub fn templates(&self) -> &[Template] {
        &self.templates
    }

    pub fn active_template(&self, operation: OperationType) -> Option<&Template> {
        self.templates.iter().find(|template| template.active && template.operation == operation)
    }

    pub fn register(&mut self, template: Template) -> Result<(), TemplateStoreError> {
        if self.templates.iter().any(|existing| existing.name == template.name) {
            return Err(TemplateStoreError::DuplicateName(template.name));
        }
        if !(0.0..=1.0).contains(&template.temperature) {
            return Err(TemplateStoreError::Temperature {
                name: template.name,
                temperature: template.temperature,
            });
        }
        placeholders(&template.prompt_template).map_err(|reason| TemplateStoreError::Malformed {
            name: template.name.clone(),
            reason,
        })?;
        if template.active {
            if let Some(active) = self.active_template(template.operation) {
                return Err(TemplateStoreError::ActiveConflict {
                    operation: template.operation,
                    active: active.name.clone(),
                });
            }
        }

        self.templates.push(template);
        Ok(())
    }

    /// Makes `name` the active template of its operation, deactivating the previous one.
    pub fn activate(&mut self, name: &str) -> Result<(), TemplateStoreError> {
        let operation = self
            .templates
            .iter()
            .find(|template| template.name == name)
            .map(|template| template.operation)
            .ok_or_else(|| TemplateStoreError::NotFound(name.to_string()))?;

        for template in self.templates.iter_mut().filter(|t| t.operation == operation) {
            template.active = template.name == name;
        }
        Ok(())
    }

    pub fn deactivate(&mut self, name: &str) -> Result<(), TemplateStoreError> {
        let template = self
            .templates
            .iter_mut()
            .find(|template| template.name == name)
            .ok_or_else(|| TemplateStoreError::NotFound(name.to_string()))?;
        template.active = false;
        Ok(())
    }

    pub fn render(
        &self,
        operation: OperationType,
        params: &BTreeMap<String, String>,
    ) -> Result<RenderedPrompt, DispatchError> {
        let template =
            self.active_template(operation).ok_or(DispatchError::TemplateMissing { operation })?;

        let prompt = interpolate(&template.prompt_template, params).map_err(|failure| {
            match failure {
                InterpolationFailure::Missing(param) => {
                    DispatchError::TemplateParam { template: template.name.clone(), param }
                }
                InterpolationFailure::Malformed(reason) => DispatchError::InvalidInput(format!(
                    "template `{}` is malformed: {reason}",
                    template.name
                )),
            }
        })?;

        Ok(RenderedPrompt {
            template_name: template.name.clone(),
            system_message: template.system_message.clone(),
            prompt,
            max_tokens: template.max_tokens,
            temperature: template.temperature,
        })
    }
}

/// Parameters every render of `operation` receives unless the caller overrides them.
pub fn default_params(operation: OperationType) -> BTreeMap<String, String> {
    let defaults: &[(&str, &str)] = match operation {
        OperationType::ExtractKeywords => &[("count", "10")],
        OperationType::SuggestTags => &[("existing_tags", "")],
        OperationType::PriorityAnalysis => &[("context", "")],
        _ => &[],
    };
    defaults.iter().map(|(key, value)| (key.to_string(), value.to_string())).collect()
}

#[derive(Debug, PartialEq, Eq)]
enum InterpolationFailure {
    Missing(String),
    Malformed(String),
}

enum Segment<'a> {
    Literal(&'a str),
    Brace(char),
    Placeholder(&'a str),
}

fn segments(source: &str) -> Result<Vec<Segment<'_>>, String> {
    let mut segments = Vec::new();
    let bytes = source.as_bytes();
    let mut literal_start = 0;
    let mut index = 0;

    while index < bytes.len() {
        match bytes[index] {
            b'{' if bytes.get(index + 1) == Some(&b'{') => {
                segments.push(Segment::Literal(&source[literal_start..index]));
                segments.push(Segment::Brace('{'));
                index += 2;
                literal_start = index;
            }
            b'}' if bytes.get(index + 1) == Some(&b'}') => {
                segments.push(Segment::Literal(&source[literal_start..index]));
                segments.push(Segment::Brace('}'));
                index += 2;
                literal_start = index;
            }
            b'{' => {
                let close = source[index + 1..]
                    .find('}')
                    .map(|offset| index + 1 + offset)
                    .ok_or_else(|| format!("unclosed `{{` at byte {index}"))?;
                let name = &source[index + 1..close];
                if name.is_empty()
                    || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                {
                    return Err(format!("invalid placeholder `{{{name}}}`"));
                }
                segments.push(Segment::Literal(&source[literal_start..index]));
                segments.push(Segment::Placeholder(name));
                index = close + 1;
                literal_start = index;
            }
            b'}' => return Err(format!("unmatched `}}` at byte {index}")),
            _ => index += 1,
        }
    }
    segments.push(Segment::Literal(&source[literal_start..]));
    Ok(segments)
}

/// Placeholder names in order of first appearance.
pub fn placeholders(source: &str) -> Result<Vec<String>, String> {
    let mut names: Vec<String> = Vec::new();
    for segment in segments(source)? {
        if let Segment::Placeholder(name) = segment {
            if !names.iter().any(|existing| existing == name) {
                names.push(name.to_string());
            }
        }
    }
    Ok(names)
}

fn interpolate(
    source: &str,
    params: &BTreeMap<String, String>,
) -> Result<String, InterpolationFailure> {
    let segments = segments(source).map_err(InterpolationFailure::Malformed)?;
    let mut rendered = String::with_capacity(source.len());
    for segment in segments {
        match segment {
            Segment::Literal(text) => rendered.push_str(text),
            Segment::Brace(brace) => rendered.push(brace),
            Segment::Placeholder(name) => {
                let value = params
                    .get(name)
                    .ok_or_else(|| InterpolationFailure::Missing(name.to_string()))?;
                rendered.push_str(value);
            }
        }
    }
    Ok(rendered)
}

fn default_templates() -> Vec<Template> {
    let template = |operation: OperationType,
                    prompt: &str,
                    system: &str,
                    max_tokens: u32,
                    temperature: f32| Template {
        name: format!("{}_default", operation.as_str()),
        operation,
        prompt_template: prompt.to_string(),
        system_message: system.to_string(),
        max_tokens,
        temperature,
        active: true,
    };

    vec![
        template(
            OperationType::Summarize,
            "Summarize the following content in a few sentences:\n\n{content}",
            "You write concise, faithful summaries.",
            300,
            0.3,
        ),
        template(
            OperationType::ExtractKeywords,
            "Extract the {count} most relevant keywords from the content below. \
             Respond with a JSON array of strings.\n\n{content}",
            "You extract keywords and answer with JSON only.",
            150,
            0.2,
        ),
        template(
            OperationType::AnalyzeSentiment,
            "Classify the overall sentiment of the content below as positive, negative \
             or neutral. Respond with the single word.\n\n{content}",
            "You are a sentiment classifier.",
            10,
            0.0,
        ),
        template(
            OperationType::SuggestTags,
            "Suggest up to 5 short tags for the content below. Existing tags: \
             [{existing_tags}]. Respond with a JSON array of strings.\n\n{content}",
            "You organise notes with short, reusable tags.",
            100,
            0.4,
        ),
        template(
            OperationType::IdentifyTopics,
            "List the main topics of the content below as a JSON array of strings.\n\n{content}",
            "You identify the main topics of a text.",
            150,
            0.3,
        ),
        template(
            OperationType::TaskBreakdown,
            "Break the following task into concrete, ordered subtasks. Respond with a JSON \
             array of strings.\n\nTask: {content}",
            "You are a pragmatic project planner.",
            400,
            0.5,
        ),
        template(
            OperationType::PriorityAnalysis,
            "Rate the priority of this task as low, medium, high or urgent. Respond with \
             the single word.\n\nTask: {content}\n\nContext: {context}",
            "You triage tasks by urgency and impact.",
            10,
            0.0,
        ),
        template(
            OperationType::TimeEstimation,
            "Estimate how many minutes the following task takes. Respond with a single \
             integer.\n\nTask: {content}",
            "You estimate task durations realistically.",
            20,
            0.0,
        ),
    ]
}

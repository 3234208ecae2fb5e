//! Turns raw completion text into the structured result of each operation.

use crate::domain::job::OperationResult;
use crate::domain::operation::OperationType;

const MAX_TAGS: usize = 5;
const DEFAULT_KEYWORD_COUNT: usize = 10;
const DEFAULT_MINUTES: u32 = 30;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("completion for `{operation}` could not be interpreted: {reason}")]
pub struct ParseFailure {
    pub operation: OperationType,
    pub reason: String,
}

/// Parses `text` for `operation`. `keyword_count` caps keyword lists.
pub fn parse_completion(
    operation: OperationType,
    text: &str,
    keyword_count: Option<usize>,
) -> Result<OperationResult, ParseFailure> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ParseFailure { operation, reason: "empty completion".to_string() });
    }

    let result = match operation {
        OperationType::Summarize => OperationResult::Summary { text: trimmed.to_string() },
        OperationType::ExtractKeywords => {
            let mut keywords = string_list(trimmed);
            keywords.truncate(keyword_count.unwrap_or(DEFAULT_KEYWORD_COUNT));
            OperationResult::Keywords { keywords }
        }
        OperationType::AnalyzeSentiment => {
            OperationResult::Sentiment { label: trimmed.to_lowercase() }
        }
        OperationType::SuggestTags => {
            let mut tags = string_list(trimmed);
            tags.truncate(MAX_TAGS);
            OperationResult::Tags { tags }
        }
        OperationType::IdentifyTopics => OperationResult::Topics { topics: string_list(trimmed) },
        OperationType::TaskBreakdown => {
            let subtasks = json_list(trimmed).unwrap_or_else(|| bullet_lines(trimmed));
            if subtasks.is_empty() {
                return Err(ParseFailure {
                    operation,
                    reason: "no subtasks found in completion".to_string(),
                });
            }
            OperationResult::Subtasks { subtasks }
        }
        OperationType::PriorityAnalysis => {
            OperationResult::Priority { level: normalize_priority(trimmed).to_string() }
        }
        OperationType::TimeEstimation => {
            OperationResult::TimeEstimate { minutes: first_integer(trimmed).unwrap_or(DEFAULT_MINUTES) }
        }
    };

    Ok(result)
}

fn json_list(text: &str) -> Option<Vec<String>> {
    let values: Vec<serde_json::Value> = serde_json::from_str(text).ok()?;
    Some(
        values
            .into_iter()
            .map(|value| match value {
                serde_json::Value::String(text) => text.trim().to_string(),
                other => other.to_string(),
            })
            .filter(|item| !item.is_empty())
            .collect(),
    )
}

fn string_list(text: &str) -> Vec<String> {
    json_list(text).unwrap_or_else(|| {
        text.split(',').map(str::trim).filter(|item| !item.is_empty()).map(str::to_string).collect()
    })
}

/// Numbered or bulleted lines with their markers stripped.
fn bullet_lines(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|line| {
            line.chars().next().is_some_and(|first| first.is_ascii_digit() || first == '-' || first == '•')
        })
        .map(|line| {
            line.trim_start_matches(|c: char| {
                c.is_ascii_digit() || matches!(c, '-' | '•' | '.' | ')') || c.is_whitespace()
            })
            .trim()
            .to_string()
        })
        .filter(|line| !line.is_empty())
        .collect()
}

fn normalize_priority(text: &str) -> &'static str {
    let lowered = text.to_lowercase();
    if lowered.contains("urgent") || lowered.contains("critical") {
        "urgent"
    } else if lowered.contains("high") {
        "high"
    } else if lowered.contains("low") {
        "low"
    } else {
        "medium"
    }
}

fn first_integer(text: &str) -> Option<u32> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let digits: String = text[start..].chars().take_while(char::is_ascii_digit).collect();
    digits.parse().ok()
}

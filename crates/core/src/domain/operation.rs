use serde::{Deserialize, Serialize};

/// AI operations a note or task can request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Summarize,
    ExtractKeywords,
    AnalyzeSentiment,
    SuggestTags,
    IdentifyTopics,
    TaskBreakdown,
    PriorityAnalysis,
    TimeEstimation,
}

/// Capability flags a model advertises.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    TextGeneration,
    Summarization,
    Analysis,
    Reasoning,
}

struct OperationEntry {
    operation: OperationType,
    key: &'static str,
    capability: Capability,
}

const OPERATION_TABLE: [OperationEntry; 8] = [
    OperationEntry {
        operation: OperationType::Summarize,
        key: "summarize",
        capability: Capability::Summarization,
    },
    OperationEntry {
        operation: OperationType::ExtractKeywords,
        key: "extract_keywords",
        capability: Capability::Analysis,
    },
    OperationEntry {
        operation: OperationType::AnalyzeSentiment,
        key: "analyze_sentiment",
        capability: Capability::Analysis,
    },
    OperationEntry {
        operation: OperationType::SuggestTags,
        key: "suggest_tags",
        capability: Capability::Analysis,
    },
    OperationEntry {
        operation: OperationType::IdentifyTopics,
        key: "identify_topics",
        capability: Capability::Analysis,
    },
    OperationEntry {
        operation: OperationType::TaskBreakdown,
        key: "task_breakdown",
        capability: Capability::Reasoning,
    },
    OperationEntry {
        operation: OperationType::PriorityAnalysis,
        key: "priority_analysis",
        capability: Capability::Reasoning,
    },
    OperationEntry {
        operation: OperationType::TimeEstimation,
        key: "time_estimation",
        capability: Capability::Reasoning,
    },
];

impl OperationType {
    pub const ALL: [OperationType; 8] = [
        Self::Summarize,
        Self::ExtractKeywords,
        Self::AnalyzeSentiment,
        Self::SuggestTags,
        Self::IdentifyTopics,
        Self::TaskBreakdown,
        Self::PriorityAnalysis,
        Self::TimeEstimation,
    ];

    fn entry(&self) -> &'static OperationEntry {
        // Table order mirrors the enum declaration order.
        &OPERATION_TABLE[*self as usize]
    }

    pub fn as_str(&self) -> &'static str {
        self.entry().key
    }

    pub fn required_capability(&self) -> Capability {
        self.entry().capability
    }

    pub fn parse(value: &str) -> Option<Self> {
        let normalized = value.trim().to_ascii_lowercase();
        OPERATION_TABLE.iter().find(|entry| entry.key == normalized).map(|entry| entry.operation)
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TextGeneration => "text_generation",
            Self::Summarization => "summarization",
            Self::Analysis => "analysis",
            Self::Reasoning => "reasoning",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text_generation" => Some(Self::TextGeneration),
            "summarization" => Some(Self::Summarization),
            "analysis" => Some(Self::Analysis),
            "reasoning" => Some(Self::Reasoning),
            _ => None,
        }
    }
}

//! Node categories and handle types.
//!
//! A node's `type` string decides where its work runs. Boundary nodes carry
//! data in or out of a graph and never reach a queue. Every other category
//! maps to one queue.

use genweave_provider::PredictionKind;
use genweave_queue::QueueName;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Node types that only carry data and complete without work.
pub const BOUNDARY_TYPES: &[&str] = &[
    "imageInput",
    "videoInput",
    "audioInput",
    "textInput",
    "prompt",
    "output",
    WORKFLOW_INPUT_TYPE,
    WORKFLOW_OUTPUT_TYPE,
];

/// Entry point of a graph used as a sub-workflow.
pub const WORKFLOW_INPUT_TYPE: &str = "workflowInput";
/// Exit point of a graph used as a sub-workflow.
pub const WORKFLOW_OUTPUT_TYPE: &str = "workflowOutput";

/// How a node's work is carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeCategory {
    /// Input/output nodes; recorded complete at initialization.
    Boundary,
    /// Image generation through the prediction provider.
    Image,
    /// Video generation through the prediction provider.
    Video,
    /// Synchronous text generation.
    Llm,
    /// Any other media processing step through the prediction provider.
    Processing,
    /// Runs another workflow as a child execution.
    WorkflowRef,
}

impl NodeCategory {
    /// Classifies a node `type` string.
    #[must_use]
    pub fn from_node_type(node_type: &str) -> Self {
        match node_type {
            t if BOUNDARY_TYPES.contains(&t) => Self::Boundary,
            "imageGen" => Self::Image,
            "videoGen" => Self::Video,
            "llm" => Self::Llm,
            "workflowRef" => Self::WorkflowRef,
            _ => Self::Processing,
        }
    }

    #[must_use]
    pub fn is_boundary(self) -> bool {
        self == Self::Boundary
    }

    /// Queue that runs nodes of this category. Boundary nodes have none.
    #[must_use]
    pub fn queue(self) -> Option<QueueName> {
        match self {
            Self::Boundary => None,
            Self::Image => Some(QueueName::ImageGeneration),
            Self::Video => Some(QueueName::VideoGeneration),
            Self::Llm => Some(QueueName::LlmGeneration),
            Self::Processing => Some(QueueName::Processing),
            Self::WorkflowRef => Some(QueueName::SubWorkflow),
        }
    }

    /// Prediction kind for categories served by the prediction provider.
    #[must_use]
    pub fn prediction_kind(self) -> Option<PredictionKind> {
        match self {
            Self::Image => Some(PredictionKind::Image),
            Self::Video => Some(PredictionKind::Video),
            Self::Processing => Some(PredictionKind::Processing),
            Self::Boundary | Self::Llm | Self::WorkflowRef => None,
        }
    }
}

impl fmt::Display for NodeCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Boundary => "boundary",
            Self::Image => "image",
            Self::Video => "video",
            Self::Llm => "llm",
            Self::Processing => "processing",
            Self::WorkflowRef => "workflow_ref",
        };
        f.write_str(name)
    }
}

/// Kind of data flowing through a handle.
///
/// Handle ids are named after what they carry (`image`, `image-1`,
/// `text-out`, ...). Handles without a recognizable prefix accept anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandleType {
    Image,
    Video,
    Text,
    Audio,
    Any,
}

impl HandleType {
    /// Derives the type from a handle id.
    #[must_use]
    pub fn from_handle(handle: Option<&str>) -> Self {
        let Some(handle) = handle else {
            return Self::Any;
        };
        let lower = handle.to_ascii_lowercase();
        if lower.starts_with("image") {
            Self::Image
        } else if lower.starts_with("video") {
            Self::Video
        } else if lower.starts_with("text") || lower.starts_with("prompt") {
            Self::Text
        } else if lower.starts_with("audio") {
            Self::Audio
        } else {
            Self::Any
        }
    }

    /// Whether an edge may connect a handle of this type to one of `target`.
    #[must_use]
    pub fn is_compatible_with(self, target: Self) -> bool {
        self == Self::Any || target == Self::Any || self == target
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::MAX_DEPTH;

    #[test]
    fn boundary_types_classify_as_boundary() {
        for t in BOUNDARY_TYPES {
            assert_eq!(NodeCategory::from_node_type(t), NodeCategory::Boundary);
            assert_eq!(NodeCategory::from_node_type(t).queue(), None);
        }
    }

    #[test]
    fn categories_route_to_queues() {
        assert_eq!(
            NodeCategory::from_node_type("imageGen").queue(),
            Some(QueueName::ImageGeneration)
        );
        assert_eq!(
            NodeCategory::from_node_type("videoGen").queue(),
            Some(QueueName::VideoGeneration)
        );
        assert_eq!(
            NodeCategory::from_node_type("llm").queue(),
            Some(QueueName::LlmGeneration)
        );
        assert_eq!(
            NodeCategory::from_node_type("workflowRef").queue(),
            Some(QueueName::SubWorkflow)
        );
        assert_eq!(
            NodeCategory::from_node_type("upscale").queue(),
            Some(QueueName::Processing)
        );
    }

    #[test]
    fn sub_workflow_queue_fits_a_full_nesting_chain() {
        // Every level of a nested chain holds a slot while its child runs.
        let chain = usize::try_from(MAX_DEPTH).expect("depth fits usize");
        assert!(QueueName::SubWorkflow.default_concurrency() > chain);
        assert!(
            QueueName::SubWorkflow.default_concurrency()
                > QueueName::Processing.default_concurrency()
        );
    }

    #[test]
    fn only_provider_categories_have_prediction_kinds() {
        assert_eq!(
            NodeCategory::Image.prediction_kind(),
            Some(PredictionKind::Image)
        );
        assert_eq!(NodeCategory::Llm.prediction_kind(), None);
        assert_eq!(NodeCategory::WorkflowRef.prediction_kind(), None);
    }

    #[test]
    fn handle_types_follow_prefix() {
        assert_eq!(HandleType::from_handle(Some("image-1")), HandleType::Image);
        assert_eq!(HandleType::from_handle(Some("prompt")), HandleType::Text);
        assert_eq!(HandleType::from_handle(Some("mask")), HandleType::Any);
        assert_eq!(HandleType::from_handle(None), HandleType::Any);
    }

    #[test]
    fn any_is_compatible_with_everything() {
        assert!(HandleType::Any.is_compatible_with(HandleType::Video));
        assert!(HandleType::Text.is_compatible_with(HandleType::Any));
        assert!(HandleType::Image.is_compatible_with(HandleType::Image));
        assert!(!HandleType::Image.is_compatible_with(HandleType::Video));
    }
}

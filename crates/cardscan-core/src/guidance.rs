//! User guidance attached to every scan result.
//!
//! The decision table is fixed:
//!
//! | condition                  | action                    | priority |
//! |----------------------------|---------------------------|----------|
//! | `error_kind = offline_mode`| `retry_when_online`       | info     |
//! | `error_kind = ml_error`    | `retry_with_better_image` | warning  |
//! | confidence < 0.7           | `suggest_retry`           | warning  |
//! | otherwise                  | `add_to_collection`       | success  |

use serde::{Deserialize, Serialize};

use crate::types::ErrorKind;

/// Confidence below which a successful scan still suggests a retry.
pub const LOW_CONFIDENCE_THRESHOLD: f64 = 0.7;

/// What the client should do next.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GuidanceAction {
    RetryWhenOnline,
    RetryWithBetterImage,
    SuggestRetry,
    AddToCollection,
}

/// How prominently the client should surface the guidance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GuidancePriority {
    Info,
    Warning,
    Success,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserGuidance {
    pub message: String,
    pub action: GuidanceAction,
    pub priority: GuidancePriority,
}

impl UserGuidance {
    /// Choose guidance for a scan outcome.
    pub fn for_outcome(error_kind: Option<ErrorKind>, confidence: f64) -> Self {
        match error_kind {
            Some(ErrorKind::OfflineMode) => Self {
                message: "You're currently offline. Your scan will be processed when you're back online."
                    .to_string(),
                action: GuidanceAction::RetryWhenOnline,
                priority: GuidancePriority::Info,
            },
            Some(ErrorKind::MlError) => Self {
                message: "Scan failed. Try adjusting lighting or taking a clearer photo.".to_string(),
                action: GuidanceAction::RetryWithBetterImage,
                priority: GuidancePriority::Warning,
            },
            None if confidence < LOW_CONFIDENCE_THRESHOLD => Self {
                message: "Low confidence scan. Consider retrying with a clearer image.".to_string(),
                action: GuidanceAction::SuggestRetry,
                priority: GuidancePriority::Warning,
            },
            None => Self {
                message: "Scan completed successfully!".to_string(),
                action: GuidanceAction::AddToCollection,
                priority: GuidancePriority::Success,
            },
        }
    }
}

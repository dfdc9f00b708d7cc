//! # cardscan-core
//!
//! Data model for the card scanning service.
//!
//! This crate holds everything about a scan that does not depend on
//! an external service:
//! - Upload validation (content type allow-list, size limit)
//! - The scan result record and the system status attached to it
//! - The fixed user guidance decision table
//! - History of accepted scans
//!
//! The resilience layer and the pipeline that produce results live in
//! `cardscan-runtime`.
//!
//! ## Example
//!
//! ```rust
//! use cardscan_core::{
//!     GuidanceAction, Prediction, ScanLimits, ScanMode, ScanRecord, ScanResult, SystemStatus,
//! };
//!
//! let limits = ScanLimits::default();
//! limits.validate("image/jpeg", 1024, 1024).unwrap();
//!
//! let prediction = Prediction {
//!     name: "Pikachu".to_string(),
//!     set: "Base Set".to_string(),
//!     number: Some("58/102".to_string()),
//!     rarity: "Common".to_string(),
//!     confidence: 0.95,
//!     model_version: "clip-v1".to_string(),
//!     processing_time_ms: 120,
//! };
//! let record = ScanRecord::from_prediction(prediction, ScanMode::Online);
//! let result = ScanResult::assemble(record, SystemStatus::default(), 0);
//! assert_eq!(result.user_guidance.action, GuidanceAction::AddToCollection);
//! ```

pub mod guidance;
pub mod history;
pub mod types;
pub mod upload;

// Re-export main types at crate root
pub use guidance::{GuidanceAction, GuidancePriority, UserGuidance, LOW_CONFIDENCE_THRESHOLD};
pub use history::{HistoryEntry, ScanHistory, ScanStats};
pub use types::{
    BoundingBox, ConnectionStatus, ErrorKind, Prediction, Region, RetryAdvice, ScanMode,
    ScanRecord, ScanResult, SystemStatus, UNKNOWN_CARD,
};
pub use upload::{media_type, ScanLimits, UploadError, DEFAULT_MAX_UPLOAD_BYTES};

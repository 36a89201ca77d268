//! persona-core: Face-attribute detection aggregation engine.
//!
//! Runs an ordered cascade of detector backends on each frame, keeps the
//! frame's best verdict, and fuses verdicts across frames with a
//! confidence-weighted vote into one decision and certainty band.

pub mod aggregate;
pub mod analyzer;
pub mod backend;
pub mod cascade;
pub mod certainty;
pub mod frame;
pub mod pipeline;
pub mod report;
pub mod scratch;
pub mod types;

pub use aggregate::{combine, AggregationError, AggregationResult};
pub use analyzer::{CandidatePolicy, FrameAnalyzer};
pub use backend::{DetectFailure, Detection, DetectorBackend};
pub use cascade::{CascadeThresholds, DetectorCascade};
pub use certainty::{CertaintyBand, CertaintyClassifier, CertaintyThresholds};
pub use frame::{DecodeError, Frame, Passthrough, Preprocessor, Resize};
pub use pipeline::{Pipeline, PipelineError, PipelineOutcome};
pub use report::{DecisionReport, ErrorReport, SingleReport};
pub use types::{Auxiliary, FrameResult, Label, LabelSet};

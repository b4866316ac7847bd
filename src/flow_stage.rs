//! # Flow Stages - Content Pipeline State Machine Nodes
//!
//! Defines the fixed set of pipeline stages and the compile-time transition
//! table that governs which moves the engine may record. The table is the
//! single source of truth for transition validity; `ANY → FAILED` and
//! same-stage self-transitions (retry semantics) are validated on top of it
//! by [`validate_transition`].

use serde::{Deserialize, Serialize};

/// A node in the content-generation state machine.
///
/// The terminal set is `{Finalized, Failed}`. Every other stage has at least
/// one outgoing edge in [`TRANSITION_TABLE`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStage {
    InputValidation,
    Research,
    AudienceAlign,
    DraftGeneration,
    StyleValidation,
    QualityCheck,
    Finalized,
    Failed,
}

impl FlowStage {
    /// All stages in declaration order. Declaration order is significant:
    /// when two guards permit the same transition the earlier entry wins.
    pub const ALL: [FlowStage; 8] = [
        FlowStage::InputValidation,
        FlowStage::Research,
        FlowStage::AudienceAlign,
        FlowStage::DraftGeneration,
        FlowStage::StyleValidation,
        FlowStage::QualityCheck,
        FlowStage::Finalized,
        FlowStage::Failed,
    ];

    /// Stable string key used in maps, file names and log output.
    pub fn key(&self) -> &'static str {
        match self {
            FlowStage::InputValidation => "input_validation",
            FlowStage::Research => "research",
            FlowStage::AudienceAlign => "audience_align",
            FlowStage::DraftGeneration => "draft_generation",
            FlowStage::StyleValidation => "style_validation",
            FlowStage::QualityCheck => "quality_check",
            FlowStage::Finalized => "finalized",
            FlowStage::Failed => "failed",
        }
    }

    /// Parse a stable string key back into a stage.
    pub fn from_key(key: &str) -> Option<FlowStage> {
        FlowStage::ALL.iter().copied().find(|s| s.key() == key)
    }
}

impl std::fmt::Display for FlowStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// Allowed-transition table, indexed in enum declaration order.
///
/// Includes the feedback-routing edges (`DraftGeneration → AudienceAlign`
/// and `DraftGeneration → Research` for major/pivot feedback,
/// `QualityCheck → AudienceAlign` for pivot on original content) alongside
/// the canonical chain edges.
pub const TRANSITION_TABLE: [(FlowStage, &[FlowStage]); 8] = [
    (
        FlowStage::InputValidation,
        &[FlowStage::Research, FlowStage::AudienceAlign],
    ),
    (
        FlowStage::Research,
        &[FlowStage::AudienceAlign, FlowStage::InputValidation],
    ),
    (FlowStage::AudienceAlign, &[FlowStage::DraftGeneration]),
    (
        FlowStage::DraftGeneration,
        &[
            FlowStage::StyleValidation,
            FlowStage::AudienceAlign,
            FlowStage::Research,
        ],
    ),
    (
        FlowStage::StyleValidation,
        &[FlowStage::QualityCheck, FlowStage::DraftGeneration],
    ),
    (
        FlowStage::QualityCheck,
        &[
            FlowStage::Finalized,
            FlowStage::Research,
            FlowStage::AudienceAlign,
        ],
    ),
    (FlowStage::Finalized, &[]),
    (FlowStage::Failed, &[]),
];

/// Edges that exist only for concurrency-recovery scenarios. They are part
/// of [`TRANSITION_TABLE`] but flagged so tests and status reports can call
/// them out.
pub const BACK_EDGES: [(FlowStage, FlowStage); 1] =
    [(FlowStage::Research, FlowStage::InputValidation)];

/// True for stages with no outgoing edges.
pub fn is_terminal_stage(stage: FlowStage) -> bool {
    matches!(stage, FlowStage::Finalized | FlowStage::Failed)
}

/// Stages reachable from `stage` through the table, in declaration order.
pub fn allowed_next(stage: FlowStage) -> &'static [FlowStage] {
    TRANSITION_TABLE
        .iter()
        .find(|(from, _)| *from == stage)
        .map(|(_, to)| *to)
        .unwrap_or(&[])
}

/// Table lookup only. Does not apply the `ANY → FAILED` or self-transition
/// special cases; use [`validate_transition`] for full engine semantics.
pub fn can_transition(from: FlowStage, to: FlowStage) -> bool {
    allowed_next(from).contains(&to)
}

/// Full transition validity as enforced by the engine:
/// any stage may fail, any stage may re-enter itself (retry), everything
/// else must be in the table.
pub fn validate_transition(from: FlowStage, to: FlowStage) -> bool {
    if to == FlowStage::Failed {
        return true;
    }
    if to == from {
        return true;
    }
    can_transition(from, to)
}

/// True if `(from, to)` is one of the explicitly flagged back-edges.
pub fn is_back_edge(from: FlowStage, to: FlowStage) -> bool {
    BACK_EDGES.contains(&(from, to))
}

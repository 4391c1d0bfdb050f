// diag.rs — Structural error model for the graph checker
//
// One variant per error kind in the checker taxonomy. The checker fails fast:
// the first detected error is returned and carries the offending node/port
// names. Callers at the engine boundary see the coarse `Status` view, with
// the detailed kind preserved as diagnostic text.
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use thiserror::Error;

// ── Error kinds ─────────────────────────────────────────────────────────────

/// Discriminant of a structural error, stable across message changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    BadGraphSyntax,
    UnknownFlowunit,
    UnknownPort,
    PortFanInConflict,
    HierarchyMismatch,
    OverHierarchyLink,
    UncollapsedExpand,
    CollapseWithoutExpand,
    AmbiguousCollapse,
    ConditionBranchLeak,
    AmbiguousConditionJoin,
    ConditionCrossOverEdge,
    LoopBackEdgeScope,
    CardinalityViolation,
}

// ── Error type ──────────────────────────────────────────────────────────────

/// A structural error detected while validating a graph.
#[derive(Debug, Clone, Error)]
pub enum GraphError {
    #[error("graph syntax error: {0}")]
    BadGraphSyntax(String),

    #[error("node '{node}' references unknown flowunit '{flowunit}'")]
    UnknownFlowunit { node: String, flowunit: String },

    #[error("unknown port '{port}' on node '{node}'")]
    UnknownPort { node: String, port: String },

    #[error("input port '{node}:{port}' receives multiple unrelated edges")]
    PortFanInConflict { node: String, port: String },

    #[error("inputs of node '{node}' arrive from incompatible hierarchy levels")]
    HierarchyMismatch { node: String },

    #[error("edge into '{node}:{port}' crosses hierarchy levels without a matching collapse or join")]
    OverHierarchyLink { node: String, port: String },

    #[error("expand '{expand}' reaches graph output '{node}' without a collapse")]
    UncollapsedExpand { expand: String, node: String },

    #[error("collapse '{node}' has no matching expand on its hierarchy path")]
    CollapseWithoutExpand { node: String },

    #[error("collapses '{first}' and '{second}' both fold expand '{expand}' on overlapping paths")]
    AmbiguousCollapse {
        expand: String,
        first: String,
        second: String,
    },

    #[error("branch of condition '{condition}' reaches graph output '{node}' without rejoining")]
    ConditionBranchLeak { condition: String, node: String },

    #[error("branches of condition '{condition}' reach conflicting join points at '{node}'")]
    AmbiguousConditionJoin { condition: String, node: String },

    #[error("branch of condition '{condition}' mixes with inputs from outside its region at '{node}'")]
    ConditionCrossOverEdge { condition: String, node: String },

    #[error("loop '{loop_node}' body escapes its scope at '{node}'")]
    LoopBackEdgeScope { loop_node: String, node: String },

    #[error("node '{node}' ({flowunit}): {detail}")]
    CardinalityViolation {
        node: String,
        flowunit: String,
        detail: String,
    },
}

impl GraphError {
    /// The stable kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            GraphError::BadGraphSyntax(_) => ErrorKind::BadGraphSyntax,
            GraphError::UnknownFlowunit { .. } => ErrorKind::UnknownFlowunit,
            GraphError::UnknownPort { .. } => ErrorKind::UnknownPort,
            GraphError::PortFanInConflict { .. } => ErrorKind::PortFanInConflict,
            GraphError::HierarchyMismatch { .. } => ErrorKind::HierarchyMismatch,
            GraphError::OverHierarchyLink { .. } => ErrorKind::OverHierarchyLink,
            GraphError::UncollapsedExpand { .. } => ErrorKind::UncollapsedExpand,
            GraphError::CollapseWithoutExpand { .. } => ErrorKind::CollapseWithoutExpand,
            GraphError::AmbiguousCollapse { .. } => ErrorKind::AmbiguousCollapse,
            GraphError::ConditionBranchLeak { .. } => ErrorKind::ConditionBranchLeak,
            GraphError::AmbiguousConditionJoin { .. } => ErrorKind::AmbiguousConditionJoin,
            GraphError::ConditionCrossOverEdge { .. } => ErrorKind::ConditionCrossOverEdge,
            GraphError::LoopBackEdgeScope { .. } => ErrorKind::LoopBackEdgeScope,
            GraphError::CardinalityViolation { .. } => ErrorKind::CardinalityViolation,
        }
    }
}

// ── Coarse status ───────────────────────────────────────────────────────────

/// Caller-visible verdict: every structural error collapses to `BadConf`,
/// with the detailed kind attached as text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    Ok,
    BadConf(String),
}

impl Status {
    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }
}

impl From<GraphError> for Status {
    fn from(err: GraphError) -> Self {
        Status::BadConf(err.to_string())
    }
}

impl<T> From<Result<T, GraphError>> for Status {
    fn from(result: Result<T, GraphError>) -> Self {
        match result {
            Ok(_) => Status::Ok,
            Err(err) => err.into(),
        }
    }
}

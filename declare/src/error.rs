use crate::future::FeedbackId;
use crate::hook::HookError;
use crate::proof::TacticError;
use kernel::ast::MetaId;
use kernel::checker::TypeError;
use kernel::universe::UniverseError;
use std::sync::Arc;
use thiserror::Error;

pub type Result<T, E = DeclareError> = std::result::Result<T, E>;

fn join_metas(metas: &[MetaId]) -> String {
    metas
        .iter()
        .map(|m| m.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Error, Debug)]
pub enum DeclareError {
    #[error("{0} already exists")]
    DuplicateName(String),
    #[error("attempt to save an incomplete proof of {name} ({remaining} goal(s) remaining)")]
    OpenGoalsRemain { name: String, remaining: usize },
    #[error("{name} has unresolved existential variables: {}", join_metas(.metas))]
    UnresolvedExistential { name: String, metas: Vec<MetaId> },
    #[error("obligation {obligation} of {program} depends on unsolved obligations: {}", .missing.join(", "))]
    UnresolvedObligationDependency {
        program: String,
        obligation: String,
        missing: Vec<String>,
    },
    #[error("more than one program with unsolved obligations: {}", .0.join(", "))]
    AmbiguousActiveProgram(Vec<String>),
    #[error("universe inconsistency: {0}")]
    UniverseInconsistency(#[from] UniverseError),
    #[error("no open goals")]
    NoOpenGoals,
    #[error("deferred proof {got} was matched against session {expected}")]
    FeedbackMismatch { expected: FeedbackId, got: FeedbackId },
    #[error("no program with unsolved obligations")]
    NoActiveProgram,
    #[error("unknown program {0}")]
    UnknownProgram(String),
    #[error("program {program} has no obligation number {index}")]
    UnknownObligation { program: String, index: usize },
    #[error("obligation {0} is already solved")]
    ObligationAlreadySolved(String),
    #[error("invalid hole {hole} in program {program}: {reason}")]
    InvalidHole {
        program: String,
        hole: usize,
        reason: String,
    },
    #[error("malformed goal for {name}: {reason}")]
    MalformedGoal { name: String, reason: String },
    #[error("section variables: {0}")]
    SectionClosure(String),
    #[error("unknown section variable {0}")]
    UnknownSectionVariable(String),
    #[error("tactic failure: {0}")]
    Tactic(#[from] TacticError),
    #[error("kernel rejected the declaration: {0}")]
    Type(#[from] TypeError),
    #[error("deferred proof {0} was cancelled")]
    Cancelled(FeedbackId),
    #[error("deferred proof {id} panicked: {message}")]
    DeferredPanicked { id: FeedbackId, message: String },
    #[error("deferred proof {id} failed: {source}")]
    Deferred {
        id: FeedbackId,
        source: Arc<DeclareError>,
    },
    #[error("{0} is not closed by this command")]
    WrongProofEnding(String),
    #[error("declaration hook failed: {0}")]
    Hook(HookError),
}

impl DeclareError {
    /// Invariant breaches by the caller rather than user mistakes.
    pub fn is_internal(&self) -> bool {
        match self {
            DeclareError::UnresolvedObligationDependency { .. }
            | DeclareError::NoOpenGoals
            | DeclareError::FeedbackMismatch { .. }
            | DeclareError::InvalidHole { .. }
            | DeclareError::WrongProofEnding(_) => true,
            DeclareError::Deferred { source, .. } => source.is_internal(),
            _ => false,
        }
    }

    /// The underlying error of a failed deferred proof.
    pub fn root(&self) -> &DeclareError {
        match self {
            DeclareError::Deferred { source, .. } => source.root(),
            other => other,
        }
    }
}

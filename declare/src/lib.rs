//! Declaration and proof finalization on top of the `kernel` checker.
//!
//! Interactive proofs live in [`proof`], deferred closing in [`future`],
//! program-mode obligations in [`obligations`] and [`program_table`]. Every
//! path ends in [`registry::Registry`], the only way a name enters the global
//! environment.

pub mod declare;
pub mod diagnostics;
pub mod entry;
pub mod error;
pub mod future;
pub mod hook;
pub mod obligations;
pub mod program_table;
pub mod proof;
pub mod registry;

pub use declare::{declare_assumption, declare_definition, declare_mutual};
pub use diagnostics::{Diagnostic, DiagnosticCollector, DiagnosticHandler, NullHandler};
pub use entry::{
    CloseMode, ClosedGoal, ClosedProof, DeclBody, DeclGroup, DeclKind, Declaration, GlobalRef, GroupMode, Opacity,
    ProofEnding, ProofEntry, ProofInfo, Scope,
};
pub use error::{DeclareError, Result};
pub use future::{DeferredProof, FeedbackId, FutureProof};
pub use hook::{Hook, HookError, HookSnapshot};
pub use obligations::{
    Hole, HoleKind, HoleSource, Obligation, ObligationBody, ObligationId, ObligationProgram, ObligationStatus,
    ProgramInfo, Progress,
};
pub use program_table::ProgramTable;
pub use proof::{Goal, InitialGoal, ProofSession, SaveError, Tactic, TacticError};
pub use registry::Registry;

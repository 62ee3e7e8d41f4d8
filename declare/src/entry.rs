//! Data handed to the registry: what gets declared, under which name, with
//! which visibility.

use crate::hook::Hook;
use crate::obligations::ObligationId;
use kernel::ast::{Definition, Term};
use kernel::universe::UniverseContext;
use std::fmt;
use std::sync::Arc;

/// Visibility of a declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Global,
    /// Not exported past the current module.
    Local,
    /// Section-local: discharged when the section closes.
    Discharge,
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Global => write!(f, "global"),
            Scope::Local => write!(f, "local"),
            Scope::Discharge => write!(f, "discharge"),
        }
    }
}

/// Logical kind of a declaration, as the user stated it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeclKind {
    Definition,
    Theorem,
    Lemma,
    Example,
    Assumption,
}

impl DeclKind {
    pub fn is_proof(self) -> bool {
        matches!(self, DeclKind::Theorem | DeclKind::Lemma)
    }
}

impl fmt::Display for DeclKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeclKind::Definition => "definition",
            DeclKind::Theorem => "theorem",
            DeclKind::Lemma => "lemma",
            DeclKind::Example => "example",
            DeclKind::Assumption => "assumption",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opacity {
    Opaque,
    Transparent,
}

impl Opacity {
    pub fn is_opaque(self) -> bool {
        self == Opacity::Opaque
    }
}

/// Handle to a registered declaration. Only the registry creates these.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalRef {
    name: String,
    serial: u64,
}

impl GlobalRef {
    pub(crate) fn new(name: String, serial: u64) -> Self {
        GlobalRef { name, serial }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registration order, starting at 0.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn to_term(&self) -> Arc<Term> {
        Term::constant(self.name.clone())
    }
}

impl fmt::Display for GlobalRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// A checked-to-be body together with everything produced while building it.
#[derive(Debug, Clone, PartialEq)]
pub struct ProofEntry {
    pub body: Arc<Term>,
    pub ty: Option<Arc<Term>>,
    pub opaque: bool,
    pub universes: UniverseContext,
    /// Auxiliary declarations, in production order.
    pub side_effects: Vec<Definition>,
}

impl ProofEntry {
    pub fn new(body: Arc<Term>) -> Self {
        ProofEntry {
            body,
            ty: None,
            opaque: false,
            universes: UniverseContext::new(),
            side_effects: Vec::new(),
        }
    }

    pub fn with_type(mut self, ty: Arc<Term>) -> Self {
        self.ty = Some(ty);
        self
    }

    pub fn opaque(mut self, opaque: bool) -> Self {
        self.opaque = opaque;
        self
    }

    pub fn with_universes(mut self, universes: UniverseContext) -> Self {
        self.universes = universes;
        self
    }

    pub fn with_side_effects(mut self, side_effects: Vec<Definition>) -> Self {
        self.side_effects = side_effects;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeclBody {
    Defined(ProofEntry),
    Assumed { ty: Arc<Term> },
}

/// One member of a registration group.
#[derive(Debug)]
pub struct Declaration {
    pub name: String,
    pub kind: DeclKind,
    /// Positions of implicit arguments.
    pub impargs: Vec<usize>,
    pub body: DeclBody,
    pub hook: Option<Hook>,
    /// Obligation names and the terms they were solved with.
    pub obligations: Vec<(String, Arc<Term>)>,
}

impl Declaration {
    pub fn new(name: impl Into<String>, kind: DeclKind, body: DeclBody) -> Self {
        Declaration {
            name: name.into(),
            kind,
            impargs: Vec::new(),
            body,
            hook: None,
            obligations: Vec::new(),
        }
    }

    pub fn with_impargs(mut self, impargs: Vec<usize>) -> Self {
        self.impargs = impargs;
        self
    }

    pub fn with_hook(mut self, hook: Option<Hook>) -> Self {
        self.hook = hook;
        self
    }

    pub fn with_obligations(mut self, obligations: Vec<(String, Arc<Term>)>) -> Self {
        self.obligations = obligations;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupMode {
    /// Each member may refer to the previous ones.
    Sequential,
    /// Every member's body may refer to every member.
    Mutual,
}

/// Declarations committed together: either all of them land or none does.
#[derive(Debug)]
pub struct DeclGroup {
    pub decls: Vec<Declaration>,
    pub scope: Scope,
    pub universes: UniverseContext,
    pub polymorphic: bool,
    pub mode: GroupMode,
}

impl DeclGroup {
    pub fn new(scope: Scope) -> Self {
        DeclGroup {
            decls: Vec::new(),
            scope,
            universes: UniverseContext::new(),
            polymorphic: false,
            mode: GroupMode::Sequential,
        }
    }

    pub fn with_decl(mut self, decl: Declaration) -> Self {
        self.decls.push(decl);
        self
    }

    pub fn with_universes(mut self, universes: UniverseContext) -> Self {
        self.universes = universes;
        self
    }

    pub fn polymorphic(mut self, polymorphic: bool) -> Self {
        self.polymorphic = polymorphic;
        self
    }

    pub fn mutual(mut self) -> Self {
        self.mode = GroupMode::Mutual;
        self
    }
}

/// How a proof session is meant to end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProofEnding {
    Regular,
    /// The proof solves an obligation of a pending program.
    Obligation { program: String, id: ObligationId },
}

/// Construction metadata of a proof session.
#[derive(Debug)]
pub struct ProofInfo {
    pub hook: Option<Hook>,
    pub ending: ProofEnding,
    pub scope: Scope,
    pub kind: DeclKind,
    /// Declared universe variables and constraints.
    pub udecl: UniverseContext,
    pub impargs: Vec<usize>,
}

impl ProofInfo {
    pub fn new(kind: DeclKind) -> Self {
        ProofInfo {
            hook: None,
            ending: ProofEnding::Regular,
            scope: Scope::Global,
            kind,
            udecl: UniverseContext::new(),
            impargs: Vec::new(),
        }
    }

    pub fn with_hook(mut self, hook: Hook) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn with_ending(mut self, ending: ProofEnding) -> Self {
        self.ending = ending;
        self
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_udecl(mut self, udecl: UniverseContext) -> Self {
        self.udecl = udecl;
        self
    }

    pub fn with_impargs(mut self, impargs: Vec<usize>) -> Self {
        self.impargs = impargs;
        self
    }
}

impl Default for ProofInfo {
    fn default() -> Self {
        ProofInfo::new(DeclKind::Theorem)
    }
}

/// One initial goal after closing: its declared name and type, and its body
/// unless the proof was closed partially.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedGoal {
    pub name: String,
    pub ty: Arc<Term>,
    pub body: Option<Arc<Term>>,
}

/// What closing a proof produces: terms, universe constraints and safety.
#[derive(Debug, Clone, PartialEq)]
pub struct ClosedProof {
    pub outputs: Vec<ClosedGoal>,
    pub universes: UniverseContext,
    pub safe: bool,
    pub opaque: bool,
    pub side_effects: Vec<Definition>,
    /// Whether every goal was solved, even when closed partially.
    pub complete: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseMode {
    Complete,
    /// Tolerates open goals; yields statements only.
    Partial,
}

//! Program-mode obligations.
//!
//! A program is a definition whose body (and possibly type) contains holes.
//! Hole `i` is the metavariable `?i` of the template and becomes obligation
//! `i`, named `{program}_obligation_{i+1}`. Obligations live in a fixed arena
//! indexed by [`ObligationId`]; dependency sets are index sets over the same
//! arena. The dependency relation is acyclic by construction and is not
//! checked here.

mod resolve;

pub use resolve::{
    abandon, add_program, admit_obligations, next_obligation, progress, resolve, resolver_fn, save_obligation,
    solve_all, FnResolver, NoResolver, ObligationAnswer, Resolver, TacticResolver,
};

use crate::entry::{DeclBody, DeclGroup, DeclKind, Declaration, GlobalRef, ProofEntry, Scope};
use crate::error::{DeclareError, Result};
use crate::hook::Hook;
use crate::proof::Tactic;
use crate::registry::Registry;
use kernel::ast::{MetaId, Term};
use kernel::universe::UniverseContext;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObligationId(pub usize);

impl fmt::Display for ObligationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0 + 1)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoleKind {
    /// An explicit `?` left by the user.
    QuestionMark,
    ImplicitArg,
    /// Proof of a subset-type predicate.
    Subset,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HoleSource {
    pub kind: HoleKind,
    pub location: Option<String>,
}

impl Default for HoleSource {
    fn default() -> Self {
        HoleSource {
            kind: HoleKind::QuestionMark,
            location: None,
        }
    }
}

/// How a solved obligation ends up in the final term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObligationStatus {
    /// The raw solution is substituted in place.
    Expand,
    /// The solution is registered as a global of its own.
    Define { opaque: bool },
}

/// A hole as the elaborator reports it.
#[derive(Debug, Clone)]
pub struct Hole {
    pub ty: Arc<Term>,
    pub source: HoleSource,
    pub deps: BTreeSet<ObligationId>,
    pub status: ObligationStatus,
    pub tactic: Option<Arc<dyn Tactic>>,
}

impl Hole {
    pub fn new(ty: Arc<Term>) -> Self {
        Hole {
            ty,
            source: HoleSource::default(),
            deps: BTreeSet::new(),
            status: ObligationStatus::Define { opaque: true },
            tactic: None,
        }
    }

    pub fn depends_on(mut self, deps: impl IntoIterator<Item = usize>) -> Self {
        self.deps.extend(deps.into_iter().map(ObligationId));
        self
    }

    pub fn with_status(mut self, status: ObligationStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_source(mut self, source: HoleSource) -> Self {
        self.source = source;
        self
    }

    pub fn with_tactic(mut self, tactic: Arc<dyn Tactic>) -> Self {
        self.tactic = Some(tactic);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ObligationBody {
    /// Registered as a global.
    Defined { reference: GlobalRef, value: Arc<Term> },
    /// Raw term awaiting substitution.
    Term(Arc<Term>),
}

#[derive(Debug, Clone)]
pub struct Obligation {
    pub name: String,
    pub ty: Arc<Term>,
    pub source: HoleSource,
    pub deps: BTreeSet<ObligationId>,
    pub status: ObligationStatus,
    pub body: Option<ObligationBody>,
    pub tactic: Option<Arc<dyn Tactic>>,
    /// A resolver answered and the answer was rejected. Resolution rounds
    /// skip it until [`ObligationProgram::clear_attempts`].
    pub attempted: bool,
}

impl Obligation {
    pub fn is_solved(&self) -> bool {
        self.body.is_some()
    }

    /// What the obligation contributes to a term mentioning it. With
    /// `opaque_only`, defined obligations contribute their constant.
    pub fn solution(&self, opaque_only: bool) -> Option<Arc<Term>> {
        match (&self.body, self.status) {
            (None, _) => None,
            (Some(ObligationBody::Term(raw)), _) => Some(raw.clone()),
            (Some(ObligationBody::Defined { value, .. }), ObligationStatus::Define { opaque: false })
                if !opaque_only =>
            {
                Some(value.clone())
            }
            (Some(ObligationBody::Defined { reference, .. }), _) => Some(reference.to_term()),
        }
    }
}

/// Per-program settings.
#[derive(Debug)]
pub struct ProgramInfo {
    pub polymorphic: bool,
    pub opaque: bool,
    pub scope: Scope,
    pub kind: DeclKind,
    /// Other members of the mutual group this program belongs to.
    pub mutual: Vec<String>,
    pub hook: Option<Hook>,
    pub impargs: Vec<usize>,
}

impl ProgramInfo {
    pub fn new(kind: DeclKind) -> Self {
        ProgramInfo {
            polymorphic: false,
            opaque: false,
            scope: Scope::Global,
            kind,
            mutual: Vec::new(),
            hook: None,
            impargs: Vec::new(),
        }
    }

    pub fn polymorphic(mut self, polymorphic: bool) -> Self {
        self.polymorphic = polymorphic;
        self
    }

    pub fn opaque(mut self, opaque: bool) -> Self {
        self.opaque = opaque;
        self
    }

    pub fn with_scope(mut self, scope: Scope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_mutual(mut self, mutual: Vec<String>) -> Self {
        self.mutual = mutual;
        self
    }

    pub fn with_hook(mut self, hook: Hook) -> Self {
        self.hook = Some(hook);
        self
    }

    pub fn with_impargs(mut self, impargs: Vec<usize>) -> Self {
        self.impargs = impargs;
        self
    }
}

impl Default for ProgramInfo {
    fn default() -> Self {
        ProgramInfo::new(DeclKind::Definition)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Progress {
    /// That many obligations are still unsolved.
    Remain(usize),
    /// Everything is solved but the program waits on other members of its
    /// mutual group.
    Dependent,
    Defined(GlobalRef),
}

#[derive(Debug)]
pub struct ObligationProgram {
    pub name: String,
    pub info: ProgramInfo,
    pub universes: UniverseContext,
    pub ty: Arc<Term>,
    pub body: Arc<Term>,
    pub obligations: Vec<Obligation>,
    pub remaining: usize,
}

impl ObligationProgram {
    pub fn obligation(&self, id: ObligationId) -> Result<&Obligation> {
        self.obligations.get(id.0).ok_or_else(|| DeclareError::UnknownObligation {
            program: self.name.clone(),
            index: id.0,
        })
    }

    /// Make every failed obligation available to resolution rounds again.
    pub fn clear_attempts(&mut self) {
        for obl in &mut self.obligations {
            obl.attempted = false;
        }
    }

    /// Unsolved obligations whose dependencies are all solved, in id order.
    pub fn eligible(&self) -> Vec<ObligationId> {
        self.obligations
            .iter()
            .enumerate()
            .filter(|(_, obl)| !obl.is_solved() && obl.deps.iter().all(|d| self.obligations[d.0].is_solved()))
            .map(|(i, _)| ObligationId(i))
            .collect()
    }

    /// The type of obligation `id` with solved obligations substituted.
    pub fn statement(&self, id: ObligationId) -> Result<Arc<Term>> {
        let obl = self.obligation(id)?;
        Ok(obl.ty.instantiate_metas(&|m| self.lookup(m, true)))
    }

    fn lookup(&self, meta: MetaId, opaque_only: bool) -> Option<Arc<Term>> {
        self.obligations.get(meta.0).and_then(|o| o.solution(opaque_only))
    }

    /// The template with every obligation substituted, and the obligation
    /// name/term associations handed to the hook.
    #[allow(clippy::type_complexity)]
    pub fn reassemble(&self) -> Result<(Arc<Term>, Arc<Term>, Vec<(String, Arc<Term>)>)> {
        let lookup = |m: MetaId| self.lookup(m, true);
        let ty = self.ty.instantiate_metas(&lookup);
        let body = self.body.instantiate_metas(&lookup);
        let mut metas = ty.metas();
        body.collect_metas(&mut metas);
        if !metas.is_empty() {
            return Err(DeclareError::UnresolvedExistential {
                name: self.name.clone(),
                metas: metas.into_iter().collect(),
            });
        }
        let associations = self
            .obligations
            .iter()
            .filter_map(|o| o.solution(true).map(|t| (o.name.clone(), t)))
            .collect();
        Ok((ty, body, associations))
    }

    /// One line per obligation.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        for obl in &self.obligations {
            let status = match obl.status {
                ObligationStatus::Expand => "expand",
                ObligationStatus::Define { opaque: true } => "define opaque",
                ObligationStatus::Define { opaque: false } => "define",
            };
            let solved = if obl.is_solved() { "solved" } else { "unsolved" };
            out.push_str(&format!("{} : {} [{}] {}", obl.name, obl.ty, status, solved));
            if !obl.deps.is_empty() {
                let deps: Vec<String> = obl.deps.iter().map(|d| self.obligations[d.0].name.clone()).collect();
                out.push_str(&format!(" after {}", deps.join(", ")));
            }
            out.push('\n');
        }
        out
    }
}

/// Build a program from its template and the holes the elaborator found.
pub fn decompose(
    name: &str,
    info: ProgramInfo,
    ty: Arc<Term>,
    body: Arc<Term>,
    universes: UniverseContext,
    holes: Vec<Hole>,
) -> Result<ObligationProgram> {
    let count = holes.len();
    let invalid = |hole: usize, reason: String| DeclareError::InvalidHole {
        program: name.to_string(),
        hole,
        reason,
    };
    for (i, hole) in holes.iter().enumerate() {
        for dep in &hole.deps {
            if dep.0 >= count || dep.0 == i {
                return Err(invalid(i, format!("bad dependency {}", dep.0)));
            }
        }
        for meta in hole.ty.metas() {
            if !hole.deps.contains(&ObligationId(meta.0)) {
                return Err(invalid(i, format!("type mentions {} outside its dependencies", meta)));
            }
        }
    }
    let mut template_metas = ty.metas();
    body.collect_metas(&mut template_metas);
    if let Some(meta) = template_metas.into_iter().find(|m| m.0 >= count) {
        return Err(invalid(meta.0, "no such hole".to_string()));
    }

    let obligations = holes
        .into_iter()
        .enumerate()
        .map(|(i, hole)| Obligation {
            name: format!("{}_obligation_{}", name, i + 1),
            ty: hole.ty,
            source: hole.source,
            deps: hole.deps,
            status: hole.status,
            body: None,
            tactic: hole.tactic,
            attempted: false,
        })
        .collect();
    Ok(ObligationProgram {
        name: name.to_string(),
        info,
        universes,
        ty,
        body,
        obligations,
        remaining: count,
    })
}

/// Solve obligation `id` with `body`. Returns whether it was registered as
/// a global of its own.
pub fn declare_obligation<'p>(
    registry: &mut Registry,
    program: &'p mut ObligationProgram,
    id: ObligationId,
    universes: UniverseContext,
    body: Arc<Term>,
) -> Result<(bool, &'p Obligation)> {
    let entry = ProofEntry::new(body).with_universes(universes);
    declare_obligation_entry(registry, program, id, entry)
}

pub(crate) fn declare_obligation_entry<'p>(
    registry: &mut Registry,
    program: &'p mut ObligationProgram,
    id: ObligationId,
    entry: ProofEntry,
) -> Result<(bool, &'p Obligation)> {
    let obl = program.obligation(id)?;
    if obl.is_solved() {
        return Err(DeclareError::ObligationAlreadySolved(obl.name.clone()));
    }
    let missing: Vec<String> = obl
        .deps
        .iter()
        .map(|d| &program.obligations[d.0])
        .filter(|dep| !dep.is_solved())
        .map(|dep| dep.name.clone())
        .collect();
    if !missing.is_empty() {
        return Err(DeclareError::UnresolvedObligationDependency {
            program: program.name.clone(),
            obligation: obl.name.clone(),
            missing,
        });
    }
    let body_metas = entry.body.metas();
    if !body_metas.is_empty() {
        return Err(DeclareError::UnresolvedExistential {
            name: obl.name.clone(),
            metas: body_metas.into_iter().collect(),
        });
    }

    let name = obl.name.clone();
    let status = obl.status;
    let statement = program.statement(id)?;
    let solution = match status {
        ObligationStatus::Define { opaque } => {
            let kind = if opaque {
                DeclKind::Lemma
            } else {
                DeclKind::Definition
            };
            let value = entry.body.clone();
            let decl = Declaration::new(
                name.clone(),
                kind,
                DeclBody::Defined(entry.with_type(statement).opaque(opaque)),
            );
            let group = DeclGroup::new(program.info.scope)
                .with_universes(program.universes.clone())
                .polymorphic(program.info.polymorphic)
                .with_decl(decl);
            let reference = registry
                .register_group(group)?
                .pop()
                .ok_or_else(|| DeclareError::UnknownObligation {
                    program: program.name.clone(),
                    index: id.0,
                })?;
            ObligationBody::Defined { reference, value }
        }
        ObligationStatus::Expand => {
            let universes = program.universes.union(&entry.universes);
            registry.validate_universes(&universes)?;
            registry.check_entry(&entry, &statement)?;
            registry.integrate_side_effects(&entry.side_effects)?;
            program.universes = universes;
            ObligationBody::Term(entry.body)
        }
    };
    let defined = matches!(solution, ObligationBody::Defined { .. });
    program.obligations[id.0].body = Some(solution);
    program.remaining -= 1;
    debug!(program = %program.name, obligation = %name, defined, remaining = program.remaining, "obligation solved");
    Ok((defined, &program.obligations[id.0]))
}

/// Substitution data for the solved obligations among `targets`:
/// `(name, (statement, solution))`.
#[allow(clippy::type_complexity)]
pub fn obl_substitution(
    opaque_only: bool,
    obligations: &[Obligation],
    targets: &BTreeSet<ObligationId>,
) -> Vec<(String, (Arc<Term>, Arc<Term>))> {
    let lookup = |m: MetaId| obligations.get(m.0).and_then(|o| o.solution(true));
    targets
        .iter()
        .filter_map(|id| obligations.get(id.0))
        .filter_map(|obl| {
            let solution = obl.solution(opaque_only)?;
            Some((obl.name.clone(), (obl.ty.instantiate_metas(&lookup), solution)))
        })
        .collect()
}

/// Transitive dependencies of `id`, excluding `id` itself.
pub fn dependencies(obligations: &[Obligation], id: ObligationId) -> BTreeSet<ObligationId> {
    let mut out = BTreeSet::new();
    let mut stack: Vec<ObligationId> = obligations
        .get(id.0)
        .map(|o| o.deps.iter().copied().collect())
        .unwrap_or_default();
    while let Some(dep) = stack.pop() {
        if out.insert(dep) {
            if let Some(obl) = obligations.get(dep.0) {
                stack.extend(obl.deps.iter().copied());
            }
        }
    }
    out
}

use super::goal::{Goal, InitialGoal, MetaStore};
use super::tactic::Tactic;
use crate::diagnostics::Diagnostic;
use crate::entry::{
    CloseMode, ClosedGoal, ClosedProof, DeclBody, DeclGroup, DeclKind, Declaration, GlobalRef, Opacity,
    ProofEntry, ProofEnding, ProofInfo,
};
use crate::error::{DeclareError, Result};
use crate::future::{DeferredProof, FutureProof};
use crate::hook::Hook;
use crate::registry::Registry;
use kernel::ast::{Definition, MetaId, Term};
use kernel::checker::{self, Context, Env};
use kernel::universe::UniverseContext;
use std::collections::BTreeSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Everything a proof needs to be finished elsewhere. `Send`, so it can be
/// captured by a deferred proof.
#[derive(Debug, Clone)]
pub(crate) struct ProofState {
    name: String,
    env: Env,
    initial: Vec<InitialGoal>,
    metas: MetaStore,
    open: Vec<Goal>,
    side_effects: Vec<Definition>,
    universes: UniverseContext,
    safe: bool,
    section_vars: BTreeSet<String>,
    closure: Option<BTreeSet<String>>,
}

impl ProofState {
    pub(crate) fn new(name: &str, env: Env, initial: Vec<InitialGoal>, universes: UniverseContext) -> Self {
        let open = initial
            .iter()
            .enumerate()
            .map(|(i, goal)| Goal {
                meta: MetaId(i),
                ctx: goal.hyps.clone(),
                ty: goal.ty.clone(),
            })
            .collect();
        ProofState {
            name: name.to_string(),
            env,
            metas: MetaStore::new(initial.len()),
            initial,
            open,
            side_effects: Vec::new(),
            universes,
            safe: true,
            section_vars: BTreeSet::new(),
            closure: None,
        }
    }

    pub(crate) fn open_goal_count(&self) -> usize {
        self.open.len()
    }

    /// Run one tactic on the first open goal. On failure nothing changes.
    pub(crate) fn apply(&mut self, tactic: &dyn Tactic) -> Result<bool> {
        self.apply_at(0, tactic)
    }

    pub(crate) fn apply_at(&mut self, index: usize, tactic: &dyn Tactic) -> Result<bool> {
        let focused = self.open.get(index).ok_or(DeclareError::NoOpenGoals)?;
        let goal = self.metas.instantiate_goal(focused);
        let mut supply = self.metas.supply();
        let outcome = tactic.run(&self.env, &goal, &mut supply)?;

        let mut env = self.env.clone();
        for effect in &outcome.side_effects {
            env.add_definition(effect.clone())?;
        }

        debug!(
            proof = %self.name,
            ?tactic,
            goal = %goal,
            produced = outcome.new_goals.len(),
            "tactic step"
        );
        self.env = env;
        self.metas.advance(&supply);
        self.metas.assign(goal.meta, outcome.proof);
        self.open.splice(index..index + 1, outcome.new_goals);
        self.side_effects.extend(outcome.side_effects);
        self.safe &= outcome.safe;
        Ok(self.safe)
    }

    pub(crate) fn goals(&self) -> Vec<Goal> {
        self.open.iter().map(|g| self.metas.instantiate_goal(g)).collect()
    }

    pub(crate) fn compact(&mut self) {
        let roots: Vec<MetaId> = (0..self.initial.len()).map(MetaId).collect();
        self.metas.compact(roots);
        let open = std::mem::take(&mut self.open);
        self.open = open.iter().map(|g| self.metas.instantiate_goal(g)).collect();
    }

    fn goal_name(&self, index: usize) -> String {
        if index == 0 {
            return self.name.clone();
        }
        match &self.initial[index].name {
            Some(name) => name.clone(),
            None => format!("{}_{}", self.name, index),
        }
    }

    pub(crate) fn goal_names(&self) -> Vec<String> {
        (0..self.initial.len()).map(|i| self.goal_name(i)).collect()
    }

    fn unresolved(&self, term: &Arc<Term>) -> Result<()> {
        let metas = term.metas();
        if metas.is_empty() {
            Ok(())
        } else {
            Err(DeclareError::UnresolvedExistential {
                name: self.name.clone(),
                metas: metas.into_iter().collect(),
            })
        }
    }

    fn check_closure(&self, terms: &[&Arc<Term>]) -> Result<()> {
        let Some(closure) = &self.closure else {
            return Ok(());
        };
        let mut used = BTreeSet::new();
        for term in terms {
            term.collect_consts(&mut used);
        }
        let escaping: Vec<String> = used
            .into_iter()
            .filter(|name| self.section_vars.contains(name) && !closure.contains(name))
            .collect();
        if escaping.is_empty() {
            Ok(())
        } else {
            Err(DeclareError::SectionClosure(format!(
                "the proof of {} uses undeclared section variables: {}",
                self.name,
                escaping.join(", ")
            )))
        }
    }

    /// The finished statement and proof of every initial goal.
    pub(crate) fn close(&self, opacity: Opacity, mode: CloseMode) -> Result<ClosedProof> {
        if mode == CloseMode::Complete && !self.open.is_empty() {
            return Err(DeclareError::OpenGoalsRemain {
                name: self.name.clone(),
                remaining: self.open.len(),
            });
        }
        // in a partial close an unfinished earlier goal stands for the
        // assumption it is registered as
        let finished: Vec<Option<Arc<Term>>> = (0..self.initial.len())
            .map(|j| {
                self.metas
                    .get(MetaId(j))
                    .map(|p| self.metas.instantiate(&p))
                    .filter(|p| !p.has_metas())
            })
            .collect();
        let partial = |m: MetaId| match finished.get(m.0) {
            Some(Some(proof)) => Some(proof.clone()),
            Some(None) => Some(Term::constant(self.goal_name(m.0))),
            None => self.metas.get(m),
        };
        let mut outputs = Vec::with_capacity(self.initial.len());
        let mut complete = self.open.is_empty();
        for (i, goal) in self.initial.iter().enumerate() {
            let ty = match mode {
                CloseMode::Complete => self.metas.instantiate(&goal.statement()),
                CloseMode::Partial => goal.statement().instantiate_metas(&partial),
            };
            self.unresolved(&ty)?;
            let proof = self
                .metas
                .get(MetaId(i))
                .map(|p| goal.hyps.close_lam(self.metas.instantiate(&p)));
            let body = match mode {
                CloseMode::Complete => {
                    let body = proof.ok_or(DeclareError::OpenGoalsRemain {
                        name: self.name.clone(),
                        remaining: 1,
                    })?;
                    self.unresolved(&body)?;
                    self.check_closure(&[&ty, &body])?;
                    Some(body)
                }
                CloseMode::Partial => {
                    complete &= proof.map(|p| !p.has_metas()).unwrap_or(false);
                    self.check_closure(&[&ty])?;
                    None
                }
            };
            outputs.push(ClosedGoal {
                name: self.goal_name(i),
                ty,
                body,
            });
        }
        Ok(ClosedProof {
            outputs,
            universes: self.universes.clone(),
            safe: self.safe,
            opaque: opacity.is_opaque(),
            side_effects: match mode {
                CloseMode::Complete => self.side_effects.clone(),
                CloseMode::Partial => Vec::new(),
            },
            complete,
        })
    }
}

/// One declaration per initial goal, side effects on the first one.
/// Hooks are attached by the caller.
fn proof_group(name: &str, info: &ProofInfo, polymorphic: bool, closed: &ClosedProof) -> Result<DeclGroup> {
    let mut group = DeclGroup::new(info.scope)
        .with_universes(info.udecl.union(&closed.universes))
        .polymorphic(polymorphic);
    for (i, goal) in closed.outputs.iter().enumerate() {
        let body = goal.body.clone().ok_or(DeclareError::OpenGoalsRemain {
            name: name.to_string(),
            remaining: 1,
        })?;
        let side_effects = if i == 0 { closed.side_effects.clone() } else { Vec::new() };
        let entry = ProofEntry::new(body)
            .with_type(goal.ty.clone())
            .opaque(closed.opaque)
            .with_side_effects(side_effects);
        let mut decl = Declaration::new(goal.name.clone(), info.kind, DeclBody::Defined(entry));
        if i == 0 {
            decl = decl.with_impargs(info.impargs.clone());
        }
        group = group.with_decl(decl);
    }
    Ok(group)
}

/// The statements of a partially closed proof, as assumptions.
fn assumption_group(info: &ProofInfo, polymorphic: bool, closed: &ClosedProof) -> DeclGroup {
    let mut group = DeclGroup::new(info.scope)
        .with_universes(info.udecl.union(&closed.universes))
        .polymorphic(polymorphic);
    for goal in &closed.outputs {
        group = group.with_decl(Declaration::new(
            goal.name.clone(),
            DeclKind::Assumption,
            DeclBody::Assumed { ty: goal.ty.clone() },
        ));
    }
    group
}

fn attach_hook(group: &mut DeclGroup, hook: Option<Hook>) {
    if let Some(first) = group.decls.first_mut() {
        first.hook = hook;
    }
}

/// Registration metadata kept by the caller while a proof is finished,
/// possibly elsewhere.
#[derive(Debug)]
pub(crate) struct SessionMeta {
    pub(crate) name: String,
    pub(crate) info: ProofInfo,
    pub(crate) polymorphic: bool,
}

impl SessionMeta {
    /// Register a completely closed proof, side effects first, the hook on
    /// the first declaration.
    pub(crate) fn register(mut self, registry: &mut Registry, closed: ClosedProof) -> Result<Vec<GlobalRef>> {
        let mut group = proof_group(&self.name, &self.info, self.polymorphic, &closed)?;
        attach_hook(&mut group, self.info.hook.take());
        let refs = registry.register_group(group)?;
        if !closed.safe {
            registry.emit(
                Diagnostic::warning(format!("{} depends on admitted steps", self.name))
                    .with_code("unsafe-proof")
                    .with_subject(self.name.clone()),
            );
        }
        Ok(refs)
    }

    /// Register the statements of a partially closed proof as assumptions.
    pub(crate) fn admit(mut self, registry: &mut Registry, closed: ClosedProof) -> Result<Vec<GlobalRef>> {
        if closed.complete {
            registry.emit(
                Diagnostic::warning(format!("the proof of {} is complete, it could be saved", self.name))
                    .with_code("proof-complete")
                    .with_subject(self.name.clone()),
            );
        }
        let mut group = assumption_group(&self.info, self.polymorphic, &closed);
        attach_hook(&mut group, self.info.hook.take());
        registry.register_group(group)
    }
}

/// A failed [`ProofSession::save`] or [`ProofSession::save_admitted`].
///
/// `session` is the untouched session when nothing was registered, so the
/// proof can go on. It is `None` when the declaration was already committed
/// and only its hook failed.
#[derive(Error, Debug)]
#[error("{error}")]
pub struct SaveError {
    pub error: DeclareError,
    pub session: Option<Box<ProofSession>>,
}

impl SaveError {
    fn kept(error: DeclareError, session: ProofSession) -> Self {
        SaveError {
            error,
            session: Some(Box::new(session)),
        }
    }

    fn spent(error: DeclareError) -> Self {
        SaveError { error, session: None }
    }

    pub fn into_session(self) -> Option<ProofSession> {
        self.session.map(|s| *s)
    }
}

impl From<SaveError> for DeclareError {
    fn from(err: SaveError) -> Self {
        err.error
    }
}

/// An interactive proof.
///
/// Consumed by [`ProofSession::save`], [`ProofSession::save_admitted`],
/// [`ProofSession::abort`] or [`ProofSession::close_future`].
#[derive(Debug)]
pub struct ProofSession {
    state: ProofState,
    info: ProofInfo,
    polymorphic: bool,
    end_tactic: Option<Arc<dyn Tactic>>,
}

impl ProofSession {
    /// Start a proof of independent goals.
    pub fn start(
        registry: &Registry,
        name: &str,
        polymorphic: bool,
        goals: Vec<InitialGoal>,
        info: ProofInfo,
    ) -> Result<ProofSession> {
        for goal in &goals {
            let mut metas = goal.ty.metas();
            for (_, ty) in goal.hyps.entries() {
                ty.collect_metas(&mut metas);
            }
            if let Some(meta) = metas.into_iter().next() {
                return Err(DeclareError::MalformedGoal {
                    name: name.to_string(),
                    reason: format!("independent goals cannot mention {}", meta),
                });
            }
        }
        Self::start_dependent(registry, name, polymorphic, info, goals)
    }

    /// Start a proof whose goal `i` may mention the solutions `?j` of
    /// earlier goals `j < i`, which must have no hypotheses.
    pub fn start_dependent(
        registry: &Registry,
        name: &str,
        polymorphic: bool,
        info: ProofInfo,
        telescope: Vec<InitialGoal>,
    ) -> Result<ProofSession> {
        if registry.is_declared(name) {
            return Err(DeclareError::DuplicateName(name.to_string()));
        }
        if telescope.is_empty() {
            return Err(DeclareError::MalformedGoal {
                name: name.to_string(),
                reason: "no goals".to_string(),
            });
        }
        // earlier goals stand for scratch constants while later ones are checked
        let placeholder = |j: usize| format!("{}.goal{}", name, j);
        let mut scratch = registry.env().clone();
        for (i, goal) in telescope.iter().enumerate() {
            let mut metas = goal.ty.metas();
            for (_, ty) in goal.hyps.entries() {
                ty.collect_metas(&mut metas);
            }
            for meta in &metas {
                if meta.0 >= i || !telescope[meta.0].hyps.is_empty() {
                    return Err(DeclareError::MalformedGoal {
                        name: name.to_string(),
                        reason: format!("goal {} cannot refer to {}", i, meta),
                    });
                }
            }
            let resolve = |m: MetaId| Some(Term::constant(placeholder(m.0)));
            let mut ctx = Context::new();
            for (hyp, ty) in goal.hyps.entries() {
                let ty = ty.instantiate_metas(&resolve);
                checker::ensure_type(&scratch, &ctx, &ty)?;
                ctx = ctx.push_named(hyp, ty);
            }
            let ty = goal.ty.instantiate_metas(&resolve);
            checker::ensure_type(&scratch, &ctx, &ty)?;
            if goal.hyps.is_empty() {
                scratch.add_definition(Definition::axiom(placeholder(i), ty))?;
            }
        }

        let mut state = ProofState::new(name, registry.env().clone(), telescope, info.udecl.clone());
        for extra in state.goal_names().into_iter().skip(1) {
            if registry.is_declared(&extra) {
                return Err(DeclareError::DuplicateName(extra));
            }
        }
        state.section_vars = registry.section_variables().iter().cloned().collect();
        info!(proof = %name, goals = state.open.len(), "proof started");
        Ok(ProofSession {
            state,
            info,
            polymorphic,
            end_tactic: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.state.name
    }

    pub fn info(&self) -> &ProofInfo {
        &self.info
    }

    pub fn is_polymorphic(&self) -> bool {
        self.polymorphic
    }

    /// Tactic run after every step taken through [`ProofSession::apply_ended`].
    pub fn set_end_tactic(&mut self, tactic: Arc<dyn Tactic>) {
        self.end_tactic = Some(tactic);
    }

    pub fn open_goal_count(&self) -> usize {
        self.state.open_goal_count()
    }

    /// Open goals, focused first, with solved goals substituted.
    pub fn goals(&self) -> Vec<Goal> {
        self.state.goals()
    }

    /// False as soon as any step was unsafe.
    pub fn is_safe(&self) -> bool {
        self.state.safe
    }

    /// Apply one tactic to the first open goal and return the safety flag.
    pub fn apply(&mut self, tactic: &dyn Tactic) -> Result<bool> {
        self.state.apply(tactic)
    }

    /// Apply `tactic`, then try the end tactic on every goal it produced.
    /// A failing end tactic leaves that goal open.
    pub fn apply_ended(&mut self, tactic: &dyn Tactic) -> Result<bool> {
        let before = self.state.open_goal_count();
        let mut staged = self.state.clone();
        staged.apply(tactic)?;
        if let Some(end) = &self.end_tactic {
            // produced goals replace the focused one at the front
            let produced = (staged.open_goal_count() + 1).saturating_sub(before);
            let targets: Vec<MetaId> = staged.open.iter().take(produced).map(|g| g.meta).collect();
            for meta in targets {
                let Some(index) = staged.open.iter().position(|g| g.meta == meta) else {
                    continue;
                };
                if let Err(err) = staged.apply_at(index, end.as_ref()) {
                    debug!(proof = %staged.name, goal = %meta, %err, "end tactic failed");
                }
            }
        }
        self.state = staged;
        Ok(self.state.safe)
    }

    /// Declare the section variables the proof may use. Returns the closure:
    /// `names`, the section variables the statements mention, and everything
    /// their types mention, transitively.
    pub fn set_used_variables(&mut self, registry: &Registry, names: &[String]) -> Result<BTreeSet<String>> {
        if self.state.closure.is_some() {
            return Err(DeclareError::SectionClosure(format!(
                "used section variables of {} were already declared",
                self.state.name
            )));
        }
        for name in names {
            if !registry.is_section_variable(name) {
                return Err(DeclareError::UnknownSectionVariable(name.clone()));
            }
        }
        let mut pending: Vec<String> = names.to_vec();
        for goal in &self.state.initial {
            for used in goal.statement().consts() {
                if registry.is_section_variable(&used) {
                    pending.push(used);
                }
            }
        }
        let mut closure = BTreeSet::new();
        while let Some(var) = pending.pop() {
            if !closure.insert(var.clone()) {
                continue;
            }
            if let Some(def) = registry.definition(&var) {
                pending.extend(
                    def.ty
                        .consts()
                        .into_iter()
                        .filter(|c| registry.is_section_variable(c)),
                );
            }
        }
        debug!(proof = %self.state.name, ?closure, "section variables declared");
        self.state.closure = Some(closure.clone());
        Ok(closure)
    }

    /// Refresh the global environment the session checks against, keeping
    /// the session's own side effects.
    pub fn update_global_env(&mut self, registry: &Registry) -> Result<()> {
        let mut env = registry.env().clone();
        for effect in &self.state.side_effects {
            match env.get_def(&effect.name) {
                Some(existing) if existing.same_entry(effect) => {}
                Some(_) => return Err(DeclareError::DuplicateName(effect.name.clone())),
                None => env.add_definition(effect.clone())?,
            }
        }
        self.state.env = env;
        self.state.section_vars = registry.section_variables().iter().cloned().collect();
        Ok(())
    }

    pub fn compact(&mut self) {
        self.state.compact();
    }

    pub fn close(&self, opacity: Opacity) -> Result<ClosedProof> {
        self.state.close(opacity, CloseMode::Complete)
    }

    pub fn close_partial(&self) -> Result<ClosedProof> {
        self.state.close(Opacity::Opaque, CloseMode::Partial)
    }

    fn into_meta(self) -> (ProofState, SessionMeta) {
        let meta = SessionMeta {
            name: self.state.name.clone(),
            info: self.info,
            polymorphic: self.polymorphic,
        };
        (self.state, meta)
    }

    fn ensure_regular(&self) -> Result<()> {
        match self.info.ending {
            ProofEnding::Regular => Ok(()),
            ProofEnding::Obligation { .. } => Err(DeclareError::WrongProofEnding(self.state.name.clone())),
        }
    }

    /// Every check [`ProofSession::save`] performs, without registering.
    fn check_save(&self, registry: &Registry, opacity: Opacity) -> Result<ClosedProof> {
        self.ensure_regular()?;
        let closed = self.close(opacity)?;
        let group = proof_group(&self.state.name, &self.info, self.polymorphic, &closed)?;
        registry.check_group(&group)?;
        Ok(closed)
    }

    fn check_admitted(&self, registry: &Registry) -> Result<ClosedProof> {
        self.ensure_regular()?;
        let closed = self.close_partial()?;
        registry.check_group(&assumption_group(&self.info, self.polymorphic, &closed))?;
        Ok(closed)
    }

    /// Close and register. Goal 0 is registered under the session name.
    /// On failure the session comes back in the error, unless only the hook
    /// failed.
    pub fn save(self, registry: &mut Registry, opacity: Opacity) -> Result<Vec<GlobalRef>, SaveError> {
        let closed = match self.check_save(registry, opacity) {
            Ok(closed) => closed,
            Err(error) => return Err(SaveError::kept(error, self)),
        };
        let (_, meta) = self.into_meta();
        meta.register(registry, closed).map_err(SaveError::spent)
    }

    /// Register every initial goal as an assumption, open goals allowed.
    pub fn save_admitted(self, registry: &mut Registry) -> Result<Vec<GlobalRef>, SaveError> {
        let closed = match self.check_admitted(registry) {
            Ok(closed) => closed,
            Err(error) => return Err(SaveError::kept(error, self)),
        };
        let (_, meta) = self.into_meta();
        meta.admit(registry, closed).map_err(SaveError::spent)
    }

    pub fn abort(self) {
        debug!(proof = %self.state.name, open = self.state.open.len(), "proof aborted");
    }

    /// Hand the proof to a deferred computation that runs `script` and then
    /// closes it. The returned value registers the result once merged.
    pub fn close_future(self, opacity: Opacity, mode: CloseMode, script: Vec<Box<dyn Tactic>>) -> DeferredProof {
        let (state, meta) = self.into_meta();
        let future = FutureProof::new(state, script, opacity, mode);
        info!(proof = %meta.name, id = %future.id(), "proof deferred");
        DeferredProof::new(meta, mode, future)
    }

    /// Split off a proof that solves an obligation.
    pub(crate) fn into_obligation_parts(self) -> Result<(String, crate::obligations::ObligationId, ClosedProof)> {
        let ProofEnding::Obligation { program, id } = self.info.ending.clone() else {
            return Err(DeclareError::WrongProofEnding(self.state.name.clone()));
        };
        let closed = self.close(Opacity::Opaque)?;
        if !closed.safe {
            warn!(proof = %self.state.name, "obligation solved with admitted steps");
        }
        Ok((program, id, closed))
    }
}

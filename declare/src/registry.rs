//! The declaration registry: the only way into the global environment.
//!
//! Every registration goes through [`Registry::register_group`], which stages
//! the whole group on a copy of the environment and universe graph and only
//! swaps the copies in once every check passed. Hooks fire after the swap.

use crate::diagnostics::{Diagnostic, DiagnosticHandler, NullHandler};
use crate::entry::{DeclBody, DeclGroup, DeclKind, Declaration, GlobalRef, GroupMode, ProofEntry, Scope};
use crate::error::{DeclareError, Result};
use crate::hook::{Hook, HookSnapshot};
use kernel::ast::{Definition, DefinitionKind, Term, Transparency};
use kernel::checker::{self, Context, Env};
use kernel::universe::{UniverseContext, UniverseGraph};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info};

/// A fully checked group, ready to be swapped in.
struct Staged {
    env: Env,
    universes: UniverseGraph,
    context: UniverseContext,
    side_effects: Vec<(String, DeclKind)>,
}

pub struct Registry {
    env: Env,
    universes: UniverseGraph,
    refs: HashMap<String, GlobalRef>,
    kinds: HashMap<String, DeclKind>,
    locality: HashMap<String, Scope>,
    impargs: HashMap<String, Vec<usize>>,
    section_vars: Vec<String>,
    next_serial: u64,
    diagnostics: Box<dyn DiagnosticHandler>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            env: Env::new(),
            universes: UniverseGraph::new(),
            refs: HashMap::new(),
            kinds: HashMap::new(),
            locality: HashMap::new(),
            impargs: HashMap::new(),
            section_vars: Vec::new(),
            next_serial: 0,
            diagnostics: Box::new(NullHandler),
        }
    }

    pub fn with_diagnostics(mut self, handler: impl DiagnosticHandler + 'static) -> Self {
        self.diagnostics = Box::new(handler);
        self
    }

    pub fn set_diagnostic_handler(&mut self, handler: Box<dyn DiagnosticHandler>) {
        self.diagnostics = handler;
    }

    pub fn env(&self) -> &Env {
        &self.env
    }

    pub fn universes(&self) -> &UniverseGraph {
        &self.universes
    }

    pub fn is_declared(&self, name: &str) -> bool {
        self.env.contains(name)
    }

    pub fn lookup(&self, name: &str) -> Option<&GlobalRef> {
        self.refs.get(name)
    }

    pub fn definition(&self, name: &str) -> Option<&Definition> {
        self.env.get_def(name)
    }

    pub fn kind_of(&self, name: &str) -> Option<DeclKind> {
        self.kinds.get(name).copied()
    }

    pub fn scope_of(&self, name: &str) -> Option<Scope> {
        self.locality.get(name).copied()
    }

    pub fn impargs_of(&self, name: &str) -> &[usize] {
        self.impargs.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Section variables in declaration order.
    pub fn section_variables(&self) -> &[String] {
        &self.section_vars
    }

    pub fn is_section_variable(&self, name: &str) -> bool {
        self.section_vars.iter().any(|v| v == name)
    }

    pub(crate) fn emit(&mut self, diagnostic: Diagnostic) {
        debug!(level = %diagnostic.level, text = %diagnostic.message, "diagnostic");
        self.diagnostics.handle(diagnostic);
    }

    /// Register one declaration.
    #[allow(clippy::too_many_arguments)]
    pub fn register(
        &mut self,
        name: &str,
        scope: Scope,
        kind: DeclKind,
        universes: UniverseContext,
        impargs: Vec<usize>,
        entry: ProofEntry,
        hook: Option<Hook>,
    ) -> Result<GlobalRef> {
        let decl = Declaration::new(name, kind, DeclBody::Defined(entry))
            .with_impargs(impargs)
            .with_hook(hook);
        let group = DeclGroup::new(scope).with_universes(universes).with_decl(decl);
        let mut refs = self.register_group(group)?;
        refs.pop().ok_or_else(|| DeclareError::DuplicateName(name.to_string()))
    }

    /// Register an assumption. With [`Scope::Discharge`] it becomes a section
    /// variable.
    pub fn register_assumption(
        &mut self,
        name: &str,
        scope: Scope,
        ty: Arc<Term>,
        universes: UniverseContext,
        hook: Option<Hook>,
    ) -> Result<GlobalRef> {
        let decl = Declaration::new(name, DeclKind::Assumption, DeclBody::Assumed { ty }).with_hook(hook);
        let group = DeclGroup::new(scope).with_universes(universes).with_decl(decl);
        let mut refs = self.register_group(group)?;
        refs.pop().ok_or_else(|| DeclareError::DuplicateName(name.to_string()))
    }

    /// Register several declarations at once. Side effects of every member
    /// are integrated first, in production order; then the universe context
    /// is merged and each member is checked. Nothing is committed unless all
    /// of this succeeds. Hooks fire afterwards, in member order.
    pub fn register_group(&mut self, mut group: DeclGroup) -> Result<Vec<GlobalRef>> {
        let staged = self.stage(&group)?;
        let hooks: Vec<_> = group.decls.iter_mut().map(|d| d.hook.take()).collect();
        self.commit(staged, group, hooks)
    }

    /// Stage only: every check `register_group` performs, without committing.
    pub fn check_group(&self, group: &DeclGroup) -> Result<()> {
        self.stage(group).map(|_| ())
    }

    fn stage(&self, group: &DeclGroup) -> Result<Staged> {
        let mut names = BTreeSet::new();
        for decl in &group.decls {
            if self.is_declared(&decl.name) || !names.insert(decl.name.clone()) {
                return Err(DeclareError::DuplicateName(decl.name.clone()));
            }
        }

        let mut env = self.env.clone();
        let mut side_effects = Vec::new();
        let mut context = group.universes.clone();
        for decl in &group.decls {
            if let DeclBody::Defined(entry) = &decl.body {
                context = context.union(&entry.universes);
                for effect in &entry.side_effects {
                    if names.contains(&effect.name) {
                        return Err(DeclareError::DuplicateName(effect.name.clone()));
                    }
                    if let Some(existing) = env.get_def(&effect.name) {
                        if existing.same_entry(effect) {
                            continue;
                        }
                        return Err(DeclareError::DuplicateName(effect.name.clone()));
                    }
                    env.add_definition(effect.clone())?;
                    let kind = if effect.is_axiom() {
                        DeclKind::Assumption
                    } else {
                        DeclKind::Lemma
                    };
                    side_effects.push((effect.name.clone(), kind));
                }
            }
        }

        let mut universes = self.universes.clone();
        if group.polymorphic {
            universes.check(&context)?;
        } else {
            universes.merge(&context)?;
        }
        let univ_params: Vec<String> = if group.polymorphic {
            context.vars.iter().cloned().collect()
        } else {
            Vec::new()
        };

        let mut mutual = Vec::new();
        for decl in &group.decls {
            let def = match &decl.body {
                DeclBody::Assumed { ty } => Definition::axiom(decl.name.clone(), ty.clone()),
                DeclBody::Defined(entry) => {
                    // sequential members may refer to the ones before them
                    let ty = match &entry.ty {
                        Some(ty) => ty.clone(),
                        None => checker::infer(&env, &Context::new(), entry.body.clone())?,
                    };
                    let mut def = Definition::definition(decl.name.clone(), ty, entry.body.clone());
                    if decl.kind.is_proof() {
                        def.kind = DefinitionKind::Theorem;
                    }
                    if entry.opaque {
                        def.transparency = Transparency::None;
                    }
                    def
                }
            };
            let def = def.with_univ_params(univ_params.clone());
            match group.mode {
                GroupMode::Sequential => env.add_definition(def)?,
                GroupMode::Mutual => mutual.push(def),
            }
        }
        if group.mode == GroupMode::Mutual {
            env.add_mutual(mutual)?;
        }

        Ok(Staged {
            env,
            universes,
            context,
            side_effects,
        })
    }

    fn commit(
        &mut self,
        staged: Staged,
        group: DeclGroup,
        hooks: Vec<Option<Hook>>,
    ) -> Result<Vec<GlobalRef>> {
        self.env = staged.env;
        self.universes = staged.universes;

        for (name, kind) in staged.side_effects {
            debug!(%name, %kind, "integrated side effect");
            self.record(name, kind, group.scope, Vec::new());
        }

        let mut refs = Vec::with_capacity(group.decls.len());
        let mut obligations = Vec::with_capacity(group.decls.len());
        for decl in group.decls {
            info!(name = %decl.name, kind = %decl.kind, scope = %group.scope, "registered");
            let message = match decl.body {
                DeclBody::Assumed { .. } => format!("{} is assumed", decl.name),
                DeclBody::Defined(_) => format!("{} is defined", decl.name),
            };
            let reference = self.record(decl.name.clone(), decl.kind, group.scope, decl.impargs);
            if group.scope == Scope::Discharge && decl.kind == DeclKind::Assumption {
                self.section_vars.push(decl.name.clone());
            }
            self.emit(Diagnostic::info(message).with_subject(decl.name));
            obligations.push(decl.obligations);
            refs.push(reference);
        }

        let mut failure = None;
        for ((hook, reference), obligations) in hooks.into_iter().zip(&refs).zip(obligations) {
            if let Some(hook) = hook {
                let snapshot = HookSnapshot {
                    universes: staged.context.clone(),
                    obligations,
                    scope: group.scope,
                    reference: reference.clone(),
                };
                if let Err(err) = hook.call(&snapshot) {
                    failure.get_or_insert(err);
                }
            }
        }
        match failure {
            Some(err) => Err(DeclareError::Hook(err)),
            None => Ok(refs),
        }
    }

    fn record(&mut self, name: String, kind: DeclKind, scope: Scope, impargs: Vec<usize>) -> GlobalRef {
        let reference = GlobalRef::new(name.clone(), self.next_serial);
        self.next_serial += 1;
        self.kinds.insert(name.clone(), kind);
        self.locality.insert(name.clone(), scope);
        if !impargs.is_empty() {
            self.impargs.insert(name.clone(), impargs);
        }
        self.refs.insert(name, reference.clone());
        reference
    }

    /// Integrate auxiliary declarations on their own, in order. Entries that
    /// are already present unchanged are skipped.
    pub fn integrate_side_effects(&mut self, effects: &[Definition]) -> Result<()> {
        let mut env = self.env.clone();
        let mut added = Vec::new();
        for effect in effects {
            if let Some(existing) = env.get_def(&effect.name) {
                if existing.same_entry(effect) {
                    continue;
                }
                return Err(DeclareError::DuplicateName(effect.name.clone()));
            }
            env.add_definition(effect.clone())?;
            added.push(effect);
        }
        self.env = env;
        for effect in added {
            let kind = if effect.is_axiom() {
                DeclKind::Assumption
            } else {
                DeclKind::Lemma
            };
            self.record(effect.name.clone(), kind, Scope::Global, Vec::new());
        }
        Ok(())
    }

    /// Check a universe context against the current graph without merging it.
    pub fn validate_universes(&self, ctx: &UniverseContext) -> Result<()> {
        self.universes.check(ctx)?;
        Ok(())
    }

    /// Kernel check of a closed term against a type.
    pub fn check_term(&self, term: &Arc<Term>, ty: &Arc<Term>) -> Result<()> {
        checker::check(&self.env, &Context::new(), term.clone(), ty.clone())?;
        Ok(())
    }

    /// Same as [`Registry::check_term`], with `side_effects` visible.
    pub fn check_entry(&self, entry: &ProofEntry, ty: &Arc<Term>) -> Result<()> {
        let mut env = self.env.clone();
        for effect in &entry.side_effects {
            match env.get_def(&effect.name) {
                Some(existing) if existing.same_entry(effect) => continue,
                Some(_) => return Err(DeclareError::DuplicateName(effect.name.clone())),
                None => env.add_definition(effect.clone())?,
            }
        }
        checker::check(&env, &Context::new(), entry.body.clone(), ty.clone())?;
        Ok(())
    }

    /// Axioms `name` depends on, transitively.
    pub fn assumptions_of(&self, name: &str) -> Result<Vec<String>> {
        match self.env.get_def(name) {
            Some(def) => Ok(def.axioms.clone()),
            None => Err(kernel::checker::TypeError::UnknownConst(name.to_string()).into()),
        }
    }
}

use kernel::ast::{MetaId, Term};
use kernel::checker::Context;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A statement to prove, as given when a session starts.
#[derive(Debug, Clone, PartialEq)]
pub struct InitialGoal {
    /// Name the proved statement is registered under, for goals after the first.
    pub name: Option<String>,
    pub hyps: Context,
    pub ty: Arc<Term>,
}

impl InitialGoal {
    pub fn new(ty: Arc<Term>) -> Self {
        InitialGoal {
            name: None,
            hyps: Context::new(),
            ty,
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_hyp(mut self, name: &str, ty: Arc<Term>) -> Self {
        self.hyps = self.hyps.push_named(name, ty);
        self
    }

    /// The registered statement: hypotheses become leading binders.
    pub fn statement(&self) -> Arc<Term> {
        self.hyps.close_pi(self.ty.clone())
    }
}

/// An open goal of the proof tree.
#[derive(Debug, Clone, PartialEq)]
pub struct Goal {
    pub meta: MetaId,
    pub ctx: Context,
    pub ty: Arc<Term>,
}

impl fmt::Display for Goal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (name, ty)) in self.ctx.entries().iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{} : {}", name, ty)?;
        }
        if !self.ctx.is_empty() {
            write!(f, " ")?;
        }
        write!(f, "|- {}", self.ty)
    }
}

/// Hands out fresh metavariables to a tactic. Goals created through it are
/// only recorded once the tactic succeeds.
#[derive(Debug)]
pub struct MetaSupply {
    next: usize,
}

impl MetaSupply {
    pub(crate) fn starting_at(next: usize) -> Self {
        MetaSupply { next }
    }

    pub(crate) fn next_index(&self) -> usize {
        self.next
    }

    pub fn fresh(&mut self, ctx: Context, ty: Arc<Term>) -> Goal {
        let meta = MetaId(self.next);
        self.next += 1;
        Goal { meta, ctx, ty }
    }
}

/// Metavariable assignments of one proof.
#[derive(Debug, Clone, Default)]
pub(crate) struct MetaStore {
    next: usize,
    assignments: BTreeMap<MetaId, Arc<Term>>,
}

impl MetaStore {
    pub(crate) fn new(next: usize) -> Self {
        MetaStore {
            next,
            assignments: BTreeMap::new(),
        }
    }

    pub(crate) fn supply(&self) -> MetaSupply {
        MetaSupply::starting_at(self.next)
    }

    pub(crate) fn advance(&mut self, supply: &MetaSupply) {
        self.next = self.next.max(supply.next_index());
    }

    pub(crate) fn assign(&mut self, meta: MetaId, value: Arc<Term>) {
        self.assignments.insert(meta, value);
    }

    pub(crate) fn get(&self, meta: MetaId) -> Option<Arc<Term>> {
        self.assignments.get(&meta).cloned()
    }

    pub(crate) fn instantiate(&self, term: &Arc<Term>) -> Arc<Term> {
        term.instantiate_metas(&|m| self.get(m))
    }

    pub(crate) fn instantiate_goal(&self, goal: &Goal) -> Goal {
        Goal {
            meta: goal.meta,
            ctx: goal.ctx.map_types(|ty| self.instantiate(ty)),
            ty: self.instantiate(&goal.ty),
        }
    }

    /// Keep only `roots`, with their assignments fully instantiated.
    pub(crate) fn compact(&mut self, roots: impl IntoIterator<Item = MetaId>) {
        let mut kept = BTreeMap::new();
        for root in roots {
            if let Some(value) = self.assignments.get(&root) {
                kept.insert(root, self.instantiate(value));
            }
        }
        self.assignments = kept;
    }
}

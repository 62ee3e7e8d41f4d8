//! The reference tactic engine: a handful of single-step tactics behind the
//! [`Tactic`] trait the proof session drives.

use super::goal::{Goal, MetaSupply};
use kernel::ast::{Definition, Term};
use kernel::checker::{self, Env, TypeError};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TacticError {
    #[error("goal is not a product: {0}")]
    NotAProduct(Arc<Term>),
    #[error("no hypothesis matches {0}")]
    NoMatchingAssumption(Arc<Term>),
    #[error("cannot apply {term}: its conclusion does not match {goal}")]
    CannotApply { term: Arc<Term>, goal: Arc<Term> },
    #[error("cannot apply {0}: dependent premises are not supported")]
    DependentPremise(Arc<Term>),
    #[error("goal mentions unsolved goal {0}")]
    GoalNotReady(kernel::ast::MetaId),
    #[error("{0} goal(s) left by the abstracted tactic")]
    Incomplete(usize),
    #[error("type check failed: {0}")]
    Kernel(#[from] TypeError),
}

/// Result of one tactic step on one goal.
#[derive(Debug, Clone)]
pub struct TacticOutcome {
    /// Proof of the goal; may mention the metavariables of `new_goals`.
    pub proof: Arc<Term>,
    pub new_goals: Vec<Goal>,
    pub safe: bool,
    /// Auxiliary declarations, in production order.
    pub side_effects: Vec<Definition>,
}

impl TacticOutcome {
    pub fn solved(proof: Arc<Term>) -> Self {
        TacticOutcome {
            proof,
            new_goals: Vec::new(),
            safe: true,
            side_effects: Vec::new(),
        }
    }
}

pub trait Tactic: fmt::Debug + Send + Sync {
    fn run(&self, env: &Env, goal: &Goal, metas: &mut MetaSupply) -> Result<TacticOutcome, TacticError>;
}

impl<T: Tactic + ?Sized> Tactic for Arc<T> {
    fn run(&self, env: &Env, goal: &Goal, metas: &mut MetaSupply) -> Result<TacticOutcome, TacticError> {
        (**self).run(env, goal, metas)
    }
}

impl<T: Tactic + ?Sized> Tactic for Box<T> {
    fn run(&self, env: &Env, goal: &Goal, metas: &mut MetaSupply) -> Result<TacticOutcome, TacticError> {
        (**self).run(env, goal, metas)
    }
}

fn ready(goal: &Goal) -> Result<(), TacticError> {
    let mut metas = goal.ty.metas();
    for (_, ty) in goal.ctx.entries() {
        ty.collect_metas(&mut metas);
    }
    match metas.into_iter().next() {
        Some(meta) => Err(TacticError::GoalNotReady(meta)),
        None => Ok(()),
    }
}

/// Close the goal with a term.
#[derive(Debug, Clone)]
pub struct Exact(pub Arc<Term>);

impl Tactic for Exact {
    fn run(&self, env: &Env, goal: &Goal, _metas: &mut MetaSupply) -> Result<TacticOutcome, TacticError> {
        ready(goal)?;
        checker::check(env, &goal.ctx, self.0.clone(), goal.ty.clone())?;
        Ok(TacticOutcome::solved(self.0.clone()))
    }
}

/// Move the head binder of a product into the context.
#[derive(Debug, Clone)]
pub struct Intro(pub String);

impl Tactic for Intro {
    fn run(&self, env: &Env, goal: &Goal, metas: &mut MetaSupply) -> Result<TacticOutcome, TacticError> {
        let ty = checker::whnf(env, goal.ty.clone());
        let Term::Pi(dom, body, _) = &*ty else {
            return Err(TacticError::NotAProduct(goal.ty.clone()));
        };
        let inner = metas.fresh(goal.ctx.push_named(&self.0, dom.clone()), body.clone());
        Ok(TacticOutcome {
            proof: Term::lam(dom.clone(), Term::meta(inner.meta)),
            new_goals: vec![inner],
            safe: true,
            side_effects: Vec::new(),
        })
    }
}

/// Close the goal with the innermost matching hypothesis.
#[derive(Debug, Clone)]
pub struct Assumption;

impl Tactic for Assumption {
    fn run(&self, env: &Env, goal: &Goal, _metas: &mut MetaSupply) -> Result<TacticOutcome, TacticError> {
        ready(goal)?;
        for idx in 0..goal.ctx.len() {
            if let Some(hyp) = goal.ctx.get(idx) {
                if checker::is_def_eq(env, hyp, goal.ty.clone()) {
                    return Ok(TacticOutcome::solved(Term::var(idx)));
                }
            }
        }
        Err(TacticError::NoMatchingAssumption(goal.ty.clone()))
    }
}

/// Backward reasoning with a term `f : A1 -> ... -> An -> goal`: one new goal
/// per premise.
#[derive(Debug, Clone)]
pub struct Apply(pub Arc<Term>);

impl Tactic for Apply {
    fn run(&self, env: &Env, goal: &Goal, metas: &mut MetaSupply) -> Result<TacticOutcome, TacticError> {
        ready(goal)?;
        let mut ty = checker::whnf(env, checker::infer(env, &goal.ctx, self.0.clone())?);
        let mut premises = Vec::new();
        while !checker::is_def_eq(env, ty.clone(), goal.ty.clone()) {
            let next = match &*ty {
                Term::Pi(dom, body, _) => {
                    if body.has_loose_bvar(0) {
                        return Err(TacticError::DependentPremise(self.0.clone()));
                    }
                    premises.push(dom.clone());
                    body.subst(0, &Term::prop())
                }
                _ => {
                    return Err(TacticError::CannotApply {
                        term: self.0.clone(),
                        goal: goal.ty.clone(),
                    })
                }
            };
            ty = checker::whnf(env, next);
        }
        let new_goals: Vec<Goal> = premises
            .into_iter()
            .map(|premise| metas.fresh(goal.ctx.clone(), premise))
            .collect();
        let proof = Term::apps(self.0.clone(), new_goals.iter().map(|g| Term::meta(g.meta)));
        Ok(TacticOutcome {
            proof,
            new_goals,
            safe: true,
            side_effects: Vec::new(),
        })
    }
}

static ADMITTED: AtomicUsize = AtomicUsize::new(0);

fn fresh_name(env: &Env, stem: &str) -> String {
    loop {
        let n = ADMITTED.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}_{}", stem, n);
        if !env.contains(&name) {
            return name;
        }
    }
}

/// Close the goal with a fresh axiom. Unsafe.
#[derive(Debug, Clone, Default)]
pub struct Admit;

impl Tactic for Admit {
    fn run(&self, env: &Env, goal: &Goal, _metas: &mut MetaSupply) -> Result<TacticOutcome, TacticError> {
        ready(goal)?;
        let statement = goal.ctx.close_pi(goal.ty.clone());
        let name = fresh_name(env, "admitted");
        let axiom = Definition::axiom(name.clone(), statement);
        Ok(TacticOutcome {
            proof: Term::apps(Term::constant(name), goal.ctx.vars()),
            new_goals: Vec::new(),
            safe: false,
            side_effects: vec![axiom],
        })
    }
}

/// Solve the goal with `tactic` and package the proof as an auxiliary lemma
/// named `name`.
#[derive(Debug)]
pub struct Abstract {
    pub name: String,
    pub tactic: Box<dyn Tactic>,
}

impl Abstract {
    pub fn new(name: impl Into<String>, tactic: impl Tactic + 'static) -> Self {
        Abstract {
            name: name.into(),
            tactic: Box::new(tactic),
        }
    }
}

impl Tactic for Abstract {
    fn run(&self, env: &Env, goal: &Goal, metas: &mut MetaSupply) -> Result<TacticOutcome, TacticError> {
        ready(goal)?;
        let inner = self.tactic.run(env, goal, metas)?;
        if !inner.new_goals.is_empty() {
            return Err(TacticError::Incomplete(inner.new_goals.len()));
        }
        let statement = goal.ctx.close_pi(goal.ty.clone());
        let lemma = Definition::theorem(self.name.clone(), statement, goal.ctx.close_lam(inner.proof));
        let mut side_effects = inner.side_effects;
        side_effects.push(lemma);
        Ok(TacticOutcome {
            proof: Term::apps(Term::constant(self.name.clone()), goal.ctx.vars()),
            new_goals: Vec::new(),
            safe: inner.safe,
            side_effects,
        })
    }
}

/// `first; rest`: run `first`, then `rest` on every goal it produced.
#[derive(Debug)]
pub struct Then {
    pub first: Box<dyn Tactic>,
    pub rest: Box<dyn Tactic>,
}

impl Then {
    pub fn new(first: impl Tactic + 'static, rest: impl Tactic + 'static) -> Self {
        Then {
            first: Box::new(first),
            rest: Box::new(rest),
        }
    }
}

impl Tactic for Then {
    fn run(&self, env: &Env, goal: &Goal, metas: &mut MetaSupply) -> Result<TacticOutcome, TacticError> {
        let first = self.first.run(env, goal, metas)?;
        let mut local = env.clone();
        for effect in &first.side_effects {
            local.add_definition(effect.clone())?;
        }

        let mut solutions = Vec::new();
        let mut new_goals = Vec::new();
        let mut side_effects = first.side_effects;
        let mut safe = first.safe;
        for sub in &first.new_goals {
            let outcome = self.rest.run(&local, sub, metas)?;
            for effect in &outcome.side_effects {
                local.add_definition(effect.clone())?;
            }
            safe &= outcome.safe;
            side_effects.extend(outcome.side_effects);
            new_goals.extend(outcome.new_goals);
            solutions.push((sub.meta, outcome.proof));
        }
        let proof = first.proof.instantiate_metas(&|m| {
            solutions
                .iter()
                .find(|(meta, _)| *meta == m)
                .map(|(_, proof)| proof.clone())
        });
        Ok(TacticOutcome {
            proof,
            new_goals,
            safe,
            side_effects,
        })
    }
}

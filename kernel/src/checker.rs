use crate::ast::{level_eq, normalize_level, Definition, Level, MetaId, Term};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TypeError {
    #[error("Unknown variable: {0}")]
    UnknownVariable(usize),
    #[error("Type mismatch: expected {expected}, got {got}")]
    TypeMismatch { expected: Arc<Term>, got: Arc<Term> },
    #[error("Expected function type, got {0}")]
    ExpectedFunction(Arc<Term>),
    #[error("Expected sort, got {0}")]
    ExpectedSort(Arc<Term>),
    #[error("Unknown constant: {0}")]
    UnknownConst(String),
    #[error("Constant {name} expects {expected} universe levels, got {got}")]
    LevelArity {
        name: String,
        expected: usize,
        got: usize,
    },
    #[error("Unassigned metavariable {0}")]
    UnassignedMeta(MetaId),
    #[error("Definition {0} already exists")]
    AlreadyDefined(String),
    #[error("Definition {0} has no body")]
    MissingValue(String),
}

/// Local typing context: named hypotheses, innermost last.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Context {
    entries: Vec<(String, Arc<Term>)>,
}

impl Context {
    pub fn new() -> Self {
        Context {
            entries: Vec::new(),
        }
    }

    pub fn push(&self, ty: Arc<Term>) -> Self {
        self.push_named("_", ty)
    }

    pub fn push_named(&self, name: &str, ty: Arc<Term>) -> Self {
        let mut entries = self.entries.clone();
        entries.push((name.to_string(), ty));
        Context { entries }
    }

    /// Type of de Bruijn variable `idx`, shifted into the current context.
    pub fn get(&self, idx: usize) -> Option<Arc<Term>> {
        // de Bruijn index: 0 is the most recently pushed
        if idx < self.entries.len() {
            let (_, ty) = &self.entries[self.entries.len() - 1 - idx];
            Some(ty.shift(0, idx + 1))
        } else {
            None
        }
    }

    pub fn name(&self, idx: usize) -> Option<&str> {
        if idx < self.entries.len() {
            Some(self.entries[self.entries.len() - 1 - idx].0.as_str())
        } else {
            None
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries outermost first, types relative to their own position.
    pub fn entries(&self) -> &[(String, Arc<Term>)] {
        &self.entries
    }

    pub fn has_metas(&self) -> bool {
        self.entries.iter().any(|(_, ty)| ty.has_metas())
    }

    /// `(x1 : A1) -> ... -> target`
    pub fn close_pi(&self, target: Arc<Term>) -> Arc<Term> {
        self.entries
            .iter()
            .rev()
            .fold(target, |acc, (_, ty)| Term::pi(ty.clone(), acc))
    }

    /// `fun (x1 : A1) ... => body`
    pub fn close_lam(&self, body: Arc<Term>) -> Arc<Term> {
        self.entries
            .iter()
            .rev()
            .fold(body, |acc, (_, ty)| Term::lam(ty.clone(), acc))
    }

    /// The context variables as arguments, outermost first.
    pub fn vars(&self) -> Vec<Arc<Term>> {
        (0..self.entries.len()).rev().map(Term::var).collect()
    }

    pub fn map_types<F: Fn(&Arc<Term>) -> Arc<Term>>(&self, f: F) -> Context {
        Context {
            entries: self
                .entries
                .iter()
                .map(|(name, ty)| (name.clone(), f(ty)))
                .collect(),
        }
    }
}

/// Global environment: an append-only store of checked definitions.
///
/// Backed by persistent maps so that snapshots handed to proof sessions and
/// deferred computations are cheap to take.
#[derive(Clone, Default, Debug)]
pub struct Env {
    defs: im::HashMap<String, Arc<Definition>>,
    order: im::Vector<String>,
}

impl Env {
    pub fn new() -> Self {
        Env {
            defs: im::HashMap::new(),
            order: im::Vector::new(),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.defs.contains_key(name)
    }

    /// Get a definition by name
    pub fn get_def(&self, name: &str) -> Option<&Definition> {
        self.defs.get(name).map(|def| def.as_ref())
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Definitions in the order they were added.
    pub fn definitions(&self) -> impl Iterator<Item = &Definition> + '_ {
        self.order.iter().filter_map(move |name| self.get_def(name))
    }

    /// Register a global definition after checking it.
    pub fn add_definition(&mut self, def: Definition) -> Result<(), TypeError> {
        if self.contains(&def.name) {
            return Err(TypeError::AlreadyDefined(def.name));
        }
        check_declaration(self, &def)?;
        self.insert(def);
        Ok(())
    }

    /// Register a group of mutually recursive definitions.
    ///
    /// Every member's type is checked first; bodies are then checked with all
    /// members available as opaque constants. Termination is not checked here.
    pub fn add_mutual(&mut self, defs: Vec<Definition>) -> Result<(), TypeError> {
        let mut names = BTreeSet::new();
        for def in &defs {
            if self.contains(&def.name) || !names.insert(def.name.clone()) {
                return Err(TypeError::AlreadyDefined(def.name.clone()));
            }
            if def.value.is_none() {
                return Err(TypeError::MissingValue(def.name.clone()));
            }
        }

        let mut provisional = self.clone();
        for def in &defs {
            ensure_type(&provisional, &Context::new(), &def.ty)?;
            provisional.insert(Definition::axiom(def.name.clone(), def.ty.clone()));
        }
        for def in &defs {
            if let Some(value) = &def.value {
                check(&provisional, &Context::new(), value.clone(), def.ty.clone())?;
            }
        }

        // axioms flow along calls between members until nothing changes
        let index: BTreeMap<&str, usize> = defs.iter().enumerate().map(|(i, d)| (d.name.as_str(), i)).collect();
        let mut axioms = Vec::with_capacity(defs.len());
        let mut calls = Vec::with_capacity(defs.len());
        for def in &defs {
            let mut own: BTreeSet<String> = self.axiom_dependencies(&def.ty).into_iter().collect();
            let mut used = def.ty.consts();
            if let Some(value) = &def.value {
                own.extend(self.axiom_dependencies(value));
                used.extend(value.consts());
            }
            axioms.push(own);
            calls.push(used.iter().filter_map(|c| index.get(c.as_str()).copied()).collect::<Vec<_>>());
        }
        let mut changed = true;
        while changed {
            changed = false;
            for i in 0..defs.len() {
                for &j in &calls[i] {
                    if i == j {
                        continue;
                    }
                    let missing: Vec<String> = axioms[j].difference(&axioms[i]).cloned().collect();
                    if !missing.is_empty() {
                        axioms[i].extend(missing);
                        changed = true;
                    }
                }
            }
        }

        for (mut def, axioms) in defs.into_iter().zip(axioms) {
            def.axioms = axioms.into_iter().collect();
            self.order.push_back(def.name.clone());
            self.defs.insert(def.name.clone(), Arc::new(def));
        }
        Ok(())
    }

    /// Axioms a term depends on, through the definitions it mentions.
    pub fn axiom_dependencies(&self, term: &Term) -> Vec<String> {
        let mut out = BTreeSet::new();
        for name in term.consts() {
            if let Some(def) = self.get_def(&name) {
                out.extend(def.axioms.iter().cloned());
            }
        }
        out.into_iter().collect()
    }

    fn insert(&mut self, mut def: Definition) {
        if !def.is_axiom() {
            let mut axioms: BTreeSet<String> = self.axiom_dependencies(&def.ty).into_iter().collect();
            if let Some(value) = &def.value {
                axioms.extend(self.axiom_dependencies(value));
            }
            axioms.extend(def.axioms.drain(..));
            def.axioms = axioms.into_iter().collect();
        }
        self.order.push_back(def.name.clone());
        self.defs.insert(def.name.clone(), Arc::new(def));
    }
}

// =============================================================================
// Universe Level Helpers
// =============================================================================

/// Compute the successor of a universe level
pub fn level_succ(l: Level) -> Level {
    Level::Succ(Box::new(l))
}

/// Compute imax(l1, l2) = 0 if l2 = 0, else max(l1, l2)
/// This is used for Pi types: if the codomain is Prop, the Pi is in Prop
pub fn level_imax(l1: Level, l2: Level) -> Level {
    normalize_level(Level::IMax(Box::new(l1), Box::new(l2)))
}

/// Extract the universe level from a Sort term, or return None if not a Sort
pub fn extract_level(term: &Arc<Term>) -> Option<Level> {
    match &**term {
        Term::Sort(l) => Some(l.clone()),
        _ => None,
    }
}

fn instantiate_const_type(def: &Definition, levels: &[Level]) -> Result<Arc<Term>, TypeError> {
    if levels.is_empty() {
        return Ok(def.ty.clone());
    }
    if levels.len() != def.univ_params.len() {
        return Err(TypeError::LevelArity {
            name: def.name.clone(),
            expected: def.univ_params.len(),
            got: levels.len(),
        });
    }
    let subst: Vec<(String, Level)> = def
        .univ_params
        .iter()
        .cloned()
        .zip(levels.iter().cloned())
        .collect();
    Ok(def.ty.instantiate_levels(&subst))
}

/// Weak Head Normal Form reduction (beta, zeta, delta on reducible constants)
pub fn whnf(env: &Env, t: Arc<Term>) -> Arc<Term> {
    match &*t {
        Term::App(f, a) => {
            let f_norm = whnf(env, f.clone());
            if let Term::Lam(_, body, _) = &*f_norm {
                whnf(env, body.subst(0, a))
            } else if Arc::ptr_eq(&f_norm, f) {
                t
            } else {
                Term::app(f_norm, a.clone())
            }
        }
        Term::LetE(_, val, body) => whnf(env, body.subst(0, val)),
        Term::Const(name, levels) => match env.get_def(name) {
            Some(def) if def.is_unfoldable() => match &def.value {
                Some(val) if levels.is_empty() => whnf(env, val.clone()),
                Some(val) => {
                    let subst: Vec<(String, Level)> = def
                        .univ_params
                        .iter()
                        .cloned()
                        .zip(levels.iter().cloned())
                        .collect();
                    whnf(env, val.instantiate_levels(&subst))
                }
                None => t,
            },
            _ => t,
        },
        _ => t,
    }
}

/// Definitional equality checking
pub fn is_def_eq(env: &Env, t1: Arc<Term>, t2: Arc<Term>) -> bool {
    if t1 == t2 {
        return true;
    }
    let t1 = whnf(env, t1);
    let t2 = whnf(env, t2);

    if t1 == t2 {
        return true;
    }

    match (&*t1, &*t2) {
        (Term::Sort(l1), Term::Sort(l2)) => level_eq(l1, l2),
        (Term::Var(i1), Term::Var(i2)) => i1 == i2,
        (Term::Const(n1, ls1), Term::Const(n2, ls2)) => {
            n1 == n2
                && ls1.len() == ls2.len()
                && ls1.iter().zip(ls2.iter()).all(|(a, b)| level_eq(a, b))
        }
        (Term::App(f1, a1), Term::App(f2, a2)) => {
            is_def_eq(env, f1.clone(), f2.clone()) && is_def_eq(env, a1.clone(), a2.clone())
        }
        (Term::Lam(ty1, b1, _), Term::Lam(ty2, b2, _))
        | (Term::Pi(ty1, b1, _), Term::Pi(ty2, b2, _)) => {
            is_def_eq(env, ty1.clone(), ty2.clone()) && is_def_eq(env, b1.clone(), b2.clone())
        }
        // Eta: (fun x => f x) == f
        (Term::Lam(_, body, _), _) => {
            let expanded = Term::app(t2.shift(0, 1), Term::var(0));
            is_def_eq(env, body.clone(), expanded)
        }
        (_, Term::Lam(_, body, _)) => {
            let expanded = Term::app(t1.shift(0, 1), Term::var(0));
            is_def_eq(env, expanded, body.clone())
        }
        (Term::Meta(m1), Term::Meta(m2)) => m1 == m2,
        _ => false,
    }
}

pub fn check(env: &Env, ctx: &Context, term: Arc<Term>, expected_type: Arc<Term>) -> Result<(), TypeError> {
    let inferred = infer(env, ctx, term)?;
    if !is_def_eq(env, inferred.clone(), expected_type.clone()) {
        return Err(TypeError::TypeMismatch {
            expected: expected_type,
            got: inferred,
        });
    }
    Ok(())
}

/// Check that `ty` is a type and return its universe level.
pub fn ensure_type(env: &Env, ctx: &Context, ty: &Arc<Term>) -> Result<Level, TypeError> {
    let sort = whnf(env, infer(env, ctx, ty.clone())?);
    extract_level(&sort).ok_or(TypeError::ExpectedSort(sort))
}

/// Check a global entry against the environment it is about to join.
pub fn check_declaration(env: &Env, def: &Definition) -> Result<(), TypeError> {
    ensure_type(env, &Context::new(), &def.ty)?;
    if let Some(value) = &def.value {
        check(env, &Context::new(), value.clone(), def.ty.clone())?;
    }
    Ok(())
}

pub fn infer(env: &Env, ctx: &Context, term: Arc<Term>) -> Result<Arc<Term>, TypeError> {
    match &*term {
        Term::Var(idx) => ctx.get(*idx).ok_or(TypeError::UnknownVariable(*idx)),
        Term::Sort(l) => {
            // Sort u : Sort (u+1)
            Ok(Term::sort(level_succ(l.clone())))
        }
        Term::Const(name, levels) => match env.get_def(name) {
            Some(def) => instantiate_const_type(def, levels),
            None => Err(TypeError::UnknownConst(name.clone())),
        },
        Term::App(f, a) => {
            let f_ty = infer(env, ctx, f.clone())?;
            let f_ty_norm = whnf(env, f_ty);

            if let Term::Pi(arg_ty, body_ty, _) = &*f_ty_norm {
                check(env, ctx, a.clone(), arg_ty.clone())?;
                Ok(body_ty.subst(0, a))
            } else {
                Err(TypeError::ExpectedFunction(f_ty_norm))
            }
        }
        Term::Lam(ty, body, info) => {
            ensure_type(env, ctx, ty)?;
            let new_ctx = ctx.push(ty.clone());
            let body_ty = infer(env, &new_ctx, body.clone())?;
            Ok(Arc::new(Term::Pi(ty.clone(), body_ty, *info)))
        }
        Term::Pi(ty, body, _) => {
            // Pi (x : A) -> B has type Sort(imax(level(A), level(B)))
            let l1 = ensure_type(env, ctx, ty)?;
            let new_ctx = ctx.push(ty.clone());
            let l2 = ensure_type(env, &new_ctx, body)?;
            Ok(Term::sort(level_imax(l1, l2)))
        }
        Term::LetE(ty, v, b) => {
            ensure_type(env, ctx, ty)?;
            check(env, ctx, v.clone(), ty.clone())?;
            let new_ctx = ctx.push(ty.clone());
            let b_ty = infer(env, &new_ctx, b.clone())?;
            Ok(b_ty.subst(0, v))
        }
        Term::Meta(id) => Err(TypeError::UnassignedMeta(*id)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_with_p() -> Env {
        let mut env = Env::new();
        env.add_definition(Definition::axiom("P".to_string(), Term::prop()))
            .expect("P : Prop");
        env
    }

    #[test]
    fn identity_on_props_checks() {
        let env = Env::new();
        // fun (A : Prop) (x : A) => x  :  (A : Prop) -> A -> A
        let id = Term::lam(Term::prop(), Term::lam(Term::var(0), Term::var(0)));
        let ty = Term::pi(Term::prop(), Term::pi(Term::var(0), Term::var(1)));
        check(&env, &Context::new(), id, ty).expect("polymorphic identity");
    }

    #[test]
    fn impredicative_pi_lives_in_prop() {
        let env = Env::new();
        let all = Term::pi(Term::prop(), Term::var(0));
        let sort = infer(&env, &Context::new(), all).expect("well-typed");
        assert_eq!(*sort, Term::Sort(Level::Zero));
    }

    #[test]
    fn duplicate_definitions_are_rejected() {
        let mut env = env_with_p();
        let err = env
            .add_definition(Definition::axiom("P".to_string(), Term::prop()))
            .expect_err("P twice");
        assert_eq!(err, TypeError::AlreadyDefined("P".to_string()));
    }

    #[test]
    fn opaque_definitions_do_not_unfold() {
        let mut env = env_with_p();
        env.add_definition(Definition::definition(
            "Q".to_string(),
            Term::prop(),
            Term::constant("P"),
        ))
        .expect("Q := P");
        let mut r = Definition::definition("R".to_string(), Term::prop(), Term::constant("P"));
        r.mark_opaque();
        env.add_definition(r).expect("R := P, opaque");
        assert!(is_def_eq(&env, Term::constant("Q"), Term::constant("P")));
        assert!(!is_def_eq(&env, Term::constant("R"), Term::constant("P")));
    }

    #[test]
    fn axiom_dependencies_are_transitive() {
        let mut env = env_with_p();
        env.add_definition(Definition::axiom("p".to_string(), Term::constant("P")))
            .expect("p : P");
        env.add_definition(Definition::theorem(
            "t".to_string(),
            Term::constant("P"),
            Term::constant("p"),
        ))
        .expect("t := p");
        env.add_definition(Definition::theorem(
            "u".to_string(),
            Term::constant("P"),
            Term::constant("t"),
        ))
        .expect("u := t");
        assert_eq!(env.get_def("u").map(|d| d.axioms.clone()), Some(vec!["P".to_string(), "p".to_string()]));
    }

    #[test]
    fn mutual_bodies_see_each_other() {
        let mut env = env_with_p();
        let f = Definition::theorem("f".to_string(), Term::constant("P"), Term::constant("g"));
        let g = Definition::theorem("g".to_string(), Term::constant("P"), Term::constant("f"));
        env.add_mutual(vec![f, g]).expect("mutual group");
        assert!(env.contains("f") && env.contains("g"));
        assert!(!env.get_def("f").map(|d| d.is_axiom()).unwrap_or(true));
    }
}

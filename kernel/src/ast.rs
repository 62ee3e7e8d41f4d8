use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

// =============================================================================
// Definitions
// =============================================================================

/// Transparency levels for reduction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Transparency {
    None,      // Opaque / Irreducible
    Reducible, // Unfolds during conversion
}

/// Classification of global entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DefinitionKind {
    /// Ordinary definition with a body.
    Def,
    /// Proved statement. Same shape as `Def`, kept apart for reporting.
    Theorem,
    /// Assumed without proof.
    Axiom,
}

/// A global entry of the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Definition {
    pub name: String,
    pub ty: Arc<Term>,
    pub value: Option<Arc<Term>>, // None for axioms
    pub kind: DefinitionKind,
    /// Unfolding transparency hint
    pub transparency: Transparency,
    /// Universe parameters the entry is polymorphic over.
    pub univ_params: Vec<String>,
    /// Axioms used by this entry (transitive closure, filled in by the environment).
    pub axioms: Vec<String>,
}

impl Definition {
    /// Transparent definition.
    pub fn definition(name: String, ty: Arc<Term>, value: Arc<Term>) -> Self {
        Definition {
            name,
            ty,
            value: Some(value),
            kind: DefinitionKind::Def,
            transparency: Transparency::Reducible,
            univ_params: vec![],
            axioms: vec![],
        }
    }

    /// Opaque proved statement.
    pub fn theorem(name: String, ty: Arc<Term>, value: Arc<Term>) -> Self {
        Definition {
            name,
            ty,
            value: Some(value),
            kind: DefinitionKind::Theorem,
            transparency: Transparency::None,
            univ_params: vec![],
            axioms: vec![],
        }
    }

    /// Create an axiom (assumed without proof)
    pub fn axiom(name: String, ty: Arc<Term>) -> Self {
        let axiom_name = name.clone();
        Definition {
            name,
            ty,
            value: None,
            kind: DefinitionKind::Axiom,
            transparency: Transparency::None, // Axioms don't unfold
            univ_params: vec![],
            axioms: vec![axiom_name], // Axiom depends on itself
        }
    }

    pub fn with_univ_params(mut self, params: Vec<String>) -> Self {
        self.univ_params = params;
        self
    }

    /// Mark this definition as Opaque (Irreducible)
    pub fn mark_opaque(&mut self) {
        self.transparency = Transparency::None;
    }

    pub fn is_axiom(&self) -> bool {
        self.kind == DefinitionKind::Axiom
    }

    /// Whether conversion may unfold this entry.
    pub fn is_unfoldable(&self) -> bool {
        self.transparency == Transparency::Reducible && self.value.is_some()
    }

    /// Same entry up to the axiom bookkeeping the environment fills in.
    pub fn same_entry(&self, other: &Definition) -> bool {
        self.name == other.name
            && self.ty == other.ty
            && self.value == other.value
            && self.kind == other.kind
            && self.transparency == other.transparency
            && self.univ_params == other.univ_params
    }
}

// =============================================================================
// Universe Levels
// =============================================================================

/// Universe levels
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Level {
    Zero,
    Succ(Box<Level>),
    Max(Box<Level>, Box<Level>),
    IMax(Box<Level>, Box<Level>),
    Param(String),
}

impl Level {
    pub fn of_nat(n: usize) -> Level {
        (0..n).fold(Level::Zero, |acc, _| Level::Succ(Box::new(acc)))
    }

    pub fn succ(self) -> Level {
        Level::Succ(Box::new(self))
    }

    /// Collect the universe parameters mentioned by this level.
    pub fn collect_params(&self, out: &mut BTreeSet<String>) {
        match self {
            Level::Zero => {}
            Level::Param(name) => {
                out.insert(name.clone());
            }
            Level::Succ(inner) => inner.collect_params(out),
            Level::Max(a, b) | Level::IMax(a, b) => {
                a.collect_params(out);
                b.collect_params(out);
            }
        }
    }

    /// Replace parameters according to `subst`; unmapped parameters are kept.
    pub fn instantiate(&self, subst: &[(String, Level)]) -> Level {
        match self {
            Level::Zero => Level::Zero,
            Level::Param(name) => subst
                .iter()
                .find(|(param, _)| param == name)
                .map(|(_, level)| level.clone())
                .unwrap_or_else(|| self.clone()),
            Level::Succ(inner) => Level::Succ(Box::new(inner.instantiate(subst))),
            Level::Max(a, b) => {
                Level::Max(Box::new(a.instantiate(subst)), Box::new(b.instantiate(subst)))
            }
            Level::IMax(a, b) => {
                Level::IMax(Box::new(a.instantiate(subst)), Box::new(b.instantiate(subst)))
            }
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Level::Zero => write!(f, "0"),
            Level::Param(name) => write!(f, "{}", name),
            Level::Succ(inner) => write!(f, "(succ {})", inner),
            Level::Max(a, b) => write!(f, "(max {} {})", a, b),
            Level::IMax(a, b) => write!(f, "(imax {} {})", a, b),
        }
    }
}

fn level_key(level: &Level) -> String {
    match level {
        Level::Zero => "0".to_string(),
        Level::Param(name) => format!("P({})", name),
        Level::Succ(inner) => format!("S({})", level_key(inner)),
        Level::Max(a, b) => format!("M({}, {})", level_key(a), level_key(b)),
        Level::IMax(a, b) => format!("I({}, {})", level_key(a), level_key(b)),
    }
}

fn collect_max(level: Level, out: &mut Vec<Level>) {
    match level {
        Level::Max(a, b) => {
            collect_max(*a, out);
            collect_max(*b, out);
        }
        other => out.push(other),
    }
}

fn normalize_max(levels: Vec<Level>) -> Level {
    let mut flat = Vec::new();
    for level in levels {
        collect_max(level, &mut flat);
    }

    flat.retain(|level| !matches!(level, Level::Zero));

    if flat.len() <= 1 {
        return flat.pop().unwrap_or(Level::Zero);
    }

    if flat.iter().all(|level| matches!(level, Level::Succ(_))) {
        let inners: Vec<Level> = flat
            .into_iter()
            .map(|level| match level {
                Level::Succ(inner) => *inner,
                other => other,
            })
            .collect();
        return Level::Succ(Box::new(normalize_max(inners)));
    }

    let mut seen = HashSet::new();
    flat.retain(|level| seen.insert(level.clone()));
    flat.sort_by_key(level_key);

    let mut iter = flat.into_iter();
    let first = iter.next().unwrap_or(Level::Zero);
    iter.fold(first, |acc, level| Level::Max(Box::new(acc), Box::new(level)))
}

pub fn normalize_level(level: Level) -> Level {
    match level {
        Level::Zero | Level::Param(_) => level,
        Level::Succ(inner) => Level::Succ(Box::new(normalize_level(*inner))),
        Level::IMax(a, b) => {
            let a_norm = normalize_level(*a);
            let b_norm = normalize_level(*b);
            if matches!(b_norm, Level::Zero) {
                Level::Zero
            } else {
                normalize_max(vec![a_norm, b_norm])
            }
        }
        Level::Max(a, b) => {
            let a_norm = normalize_level(*a);
            let b_norm = normalize_level(*b);
            normalize_max(vec![a_norm, b_norm])
        }
    }
}

pub fn level_eq(l1: &Level, l2: &Level) -> bool {
    normalize_level(l1.clone()) == normalize_level(l2.clone())
}

// =============================================================================
// Terms
// =============================================================================

/// Binder information (explicit, implicit)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinderInfo {
    Default,
    Implicit,
}

/// Metavariable identifier. Proof goals and program holes are metavariables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetaId(pub usize);

impl fmt::Display for MetaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "?{}", self.0)
    }
}

/// The core terms of the calculus, using de Bruijn indices.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Term {
    /// Bound variable (de Bruijn index)
    Var(usize),
    /// Universe
    Sort(Level),
    /// Constant (global definition)
    Const(String, Vec<Level>),
    /// Application: (f a)
    App(Arc<Term>, Arc<Term>),
    /// Lambda abstraction: \x:A. b
    Lam(Arc<Term>, Arc<Term>, BinderInfo),
    /// Pi type: (x:A) -> B
    Pi(Arc<Term>, Arc<Term>, BinderInfo),
    /// Let binding: let x:A = v in b
    LetE(Arc<Term>, Arc<Term>, Arc<Term>),
    /// Metavariable: an open goal or a program hole
    Meta(MetaId),
}

// Helper constructors for convenience
impl Term {
    pub fn var(n: usize) -> Arc<Self> {
        Arc::new(Term::Var(n))
    }

    pub fn sort(l: Level) -> Arc<Self> {
        Arc::new(Term::Sort(l))
    }

    pub fn prop() -> Arc<Self> {
        Term::sort(Level::Zero)
    }

    pub fn constant(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Term::Const(name.into(), vec![]))
    }

    pub fn app(f: Arc<Term>, a: Arc<Term>) -> Arc<Self> {
        Arc::new(Term::App(f, a))
    }

    pub fn apps(f: Arc<Term>, args: impl IntoIterator<Item = Arc<Term>>) -> Arc<Self> {
        args.into_iter().fold(f, Term::app)
    }

    pub fn lam(ty: Arc<Term>, body: Arc<Term>) -> Arc<Self> {
        Arc::new(Term::Lam(ty, body, BinderInfo::Default))
    }

    pub fn pi(ty: Arc<Term>, body: Arc<Term>) -> Arc<Self> {
        Arc::new(Term::Pi(ty, body, BinderInfo::Default))
    }

    /// Non-dependent function type `a -> b`.
    pub fn arrow(a: Arc<Term>, b: Arc<Term>) -> Arc<Self> {
        Term::pi(a, b.shift(0, 1))
    }

    pub fn meta(id: MetaId) -> Arc<Self> {
        Arc::new(Term::Meta(id))
    }

    /// Shift indices in a term by `d` above cutoff `c`.
    pub fn shift(&self, c: usize, d: usize) -> Arc<Term> {
        match self {
            Term::Var(k) => {
                if *k < c {
                    Arc::new(Term::Var(*k))
                } else {
                    Arc::new(Term::Var(k + d))
                }
            }
            Term::Sort(_) | Term::Const(_, _) | Term::Meta(_) => Arc::new(self.clone()),
            Term::App(f, a) => Arc::new(Term::App(f.shift(c, d), a.shift(c, d))),
            Term::Lam(ty, body, info) => {
                Arc::new(Term::Lam(ty.shift(c, d), body.shift(c + 1, d), *info))
            }
            Term::Pi(ty, body, info) => {
                Arc::new(Term::Pi(ty.shift(c, d), body.shift(c + 1, d), *info))
            }
            Term::LetE(ty, v, b) => {
                Arc::new(Term::LetE(ty.shift(c, d), v.shift(c, d), b.shift(c + 1, d)))
            }
        }
    }

    /// Substitute `s` for variable `k` in `t`.
    pub fn subst(&self, k: usize, s: &Arc<Term>) -> Arc<Term> {
        match self {
            Term::Var(i) => {
                if *i == k {
                    s.clone()
                } else if *i > k {
                    Arc::new(Term::Var(i - 1))
                } else {
                    Arc::new(Term::Var(*i))
                }
            }
            Term::Sort(_) | Term::Const(_, _) | Term::Meta(_) => Arc::new(self.clone()),
            Term::App(f, a) => Arc::new(Term::App(f.subst(k, s), a.subst(k, s))),
            Term::Lam(ty, body, info) => Arc::new(Term::Lam(
                ty.subst(k, s),
                body.subst(k + 1, &s.shift(0, 1)),
                *info,
            )),
            Term::Pi(ty, body, info) => Arc::new(Term::Pi(
                ty.subst(k, s),
                body.subst(k + 1, &s.shift(0, 1)),
                *info,
            )),
            Term::LetE(ty, v, b) => Arc::new(Term::LetE(
                ty.subst(k, s),
                v.subst(k, s),
                b.subst(k + 1, &s.shift(0, 1)),
            )),
        }
    }

    /// Whether de Bruijn index `k` (relative to this term) occurs free.
    pub fn has_loose_bvar(&self, k: usize) -> bool {
        match self {
            Term::Var(i) => *i == k,
            Term::Sort(_) | Term::Const(_, _) | Term::Meta(_) => false,
            Term::App(f, a) => f.has_loose_bvar(k) || a.has_loose_bvar(k),
            Term::Lam(ty, body, _) | Term::Pi(ty, body, _) => {
                ty.has_loose_bvar(k) || body.has_loose_bvar(k + 1)
            }
            Term::LetE(ty, v, b) => {
                ty.has_loose_bvar(k) || v.has_loose_bvar(k) || b.has_loose_bvar(k + 1)
            }
        }
    }

    /// Replace assigned metavariables. Assignments are themselves instantiated,
    /// so chains `?0 := f ?1`, `?1 := a` resolve fully.
    pub fn instantiate_metas<F>(self: &Arc<Self>, lookup: &F) -> Arc<Term>
    where
        F: Fn(MetaId) -> Option<Arc<Term>>,
    {
        if !self.has_metas() {
            return self.clone();
        }
        match &**self {
            Term::Meta(id) => match lookup(*id) {
                Some(solution) => solution.instantiate_metas(lookup),
                None => self.clone(),
            },
            Term::Var(_) | Term::Sort(_) | Term::Const(_, _) => self.clone(),
            Term::App(f, a) => {
                Arc::new(Term::App(f.instantiate_metas(lookup), a.instantiate_metas(lookup)))
            }
            Term::Lam(ty, body, info) => Arc::new(Term::Lam(
                ty.instantiate_metas(lookup),
                body.instantiate_metas(lookup),
                *info,
            )),
            Term::Pi(ty, body, info) => Arc::new(Term::Pi(
                ty.instantiate_metas(lookup),
                body.instantiate_metas(lookup),
                *info,
            )),
            Term::LetE(ty, v, b) => Arc::new(Term::LetE(
                ty.instantiate_metas(lookup),
                v.instantiate_metas(lookup),
                b.instantiate_metas(lookup),
            )),
        }
    }

    /// Instantiate universe parameters throughout the term.
    pub fn instantiate_levels(&self, subst: &[(String, Level)]) -> Arc<Term> {
        if subst.is_empty() {
            return Arc::new(self.clone());
        }
        match self {
            Term::Var(_) | Term::Meta(_) => Arc::new(self.clone()),
            Term::Sort(l) => Arc::new(Term::Sort(l.instantiate(subst))),
            Term::Const(n, ls) => Arc::new(Term::Const(
                n.clone(),
                ls.iter().map(|l| l.instantiate(subst)).collect(),
            )),
            Term::App(f, a) => Arc::new(Term::App(
                f.instantiate_levels(subst),
                a.instantiate_levels(subst),
            )),
            Term::Lam(ty, body, info) => Arc::new(Term::Lam(
                ty.instantiate_levels(subst),
                body.instantiate_levels(subst),
                *info,
            )),
            Term::Pi(ty, body, info) => Arc::new(Term::Pi(
                ty.instantiate_levels(subst),
                body.instantiate_levels(subst),
                *info,
            )),
            Term::LetE(ty, v, b) => Arc::new(Term::LetE(
                ty.instantiate_levels(subst),
                v.instantiate_levels(subst),
                b.instantiate_levels(subst),
            )),
        }
    }

    pub fn has_metas(&self) -> bool {
        match self {
            Term::Meta(_) => true,
            Term::Var(_) | Term::Sort(_) | Term::Const(_, _) => false,
            Term::App(f, a) => f.has_metas() || a.has_metas(),
            Term::Lam(ty, body, _) | Term::Pi(ty, body, _) => ty.has_metas() || body.has_metas(),
            Term::LetE(ty, v, b) => ty.has_metas() || v.has_metas() || b.has_metas(),
        }
    }

    pub fn collect_metas(&self, out: &mut BTreeSet<MetaId>) {
        match self {
            Term::Meta(id) => {
                out.insert(*id);
            }
            Term::Var(_) | Term::Sort(_) | Term::Const(_, _) => {}
            Term::App(f, a) => {
                f.collect_metas(out);
                a.collect_metas(out);
            }
            Term::Lam(ty, body, _) | Term::Pi(ty, body, _) => {
                ty.collect_metas(out);
                body.collect_metas(out);
            }
            Term::LetE(ty, v, b) => {
                ty.collect_metas(out);
                v.collect_metas(out);
                b.collect_metas(out);
            }
        }
    }

    pub fn metas(&self) -> BTreeSet<MetaId> {
        let mut out = BTreeSet::new();
        self.collect_metas(&mut out);
        out
    }

    /// Collect the names of the global constants this term mentions.
    pub fn collect_consts(&self, out: &mut BTreeSet<String>) {
        match self {
            Term::Const(name, _) => {
                out.insert(name.clone());
            }
            Term::Var(_) | Term::Sort(_) | Term::Meta(_) => {}
            Term::App(f, a) => {
                f.collect_consts(out);
                a.collect_consts(out);
            }
            Term::Lam(ty, body, _) | Term::Pi(ty, body, _) => {
                ty.collect_consts(out);
                body.collect_consts(out);
            }
            Term::LetE(ty, v, b) => {
                ty.collect_consts(out);
                v.collect_consts(out);
                b.collect_consts(out);
            }
        }
    }

    pub fn consts(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_consts(&mut out);
        out
    }

    pub fn mentions_const(&self, name: &str) -> bool {
        match self {
            Term::Const(n, _) => n == name,
            Term::Var(_) | Term::Sort(_) | Term::Meta(_) => false,
            Term::App(f, a) => f.mentions_const(name) || a.mentions_const(name),
            Term::Lam(ty, body, _) | Term::Pi(ty, body, _) => {
                ty.mentions_const(name) || body.mentions_const(name)
            }
            Term::LetE(ty, v, b) => {
                ty.mentions_const(name) || v.mentions_const(name) || b.mentions_const(name)
            }
        }
    }
}

/// Prints terms in the s-expression syntax `parser` reads back.
impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Term::Var(idx) => write!(f, "{}", idx),
            Term::Sort(Level::Zero) => write!(f, "Prop"),
            Term::Sort(level) => {
                if *level == Level::of_nat(1) {
                    write!(f, "Type")
                } else {
                    write!(f, "(sort {})", level)
                }
            }
            Term::Const(name, levels) if levels.is_empty() => write!(f, "{}", name),
            Term::Const(name, levels) => {
                write!(f, "(const {}", name)?;
                for level in levels {
                    write!(f, " {}", level)?;
                }
                write!(f, ")")
            }
            Term::App(fun, arg) => write!(f, "(app {} {})", fun, arg),
            Term::Lam(ty, body, _) => write!(f, "(lam {} {})", ty, body),
            Term::Pi(ty, body, _) => write!(f, "(pi {} {})", ty, body),
            Term::LetE(ty, val, body) => write!(f, "(let {} {} {})", ty, val, body),
            Term::Meta(id) => write!(f, "(? {})", id.0),
        }
    }
}

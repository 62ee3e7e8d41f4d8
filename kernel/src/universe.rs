//! Universe constraints and the ambient universe graph.
//!
//! Constraints relate named universe variables (`u < v`, `u <= v`, `u = v`).
//! A set of constraints is consistent when no cycle of the induced graph
//! contains a strict edge.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConstraintKind {
    Lt,
    Le,
    Eq,
}

impl fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstraintKind::Lt => write!(f, "<"),
            ConstraintKind::Le => write!(f, "<="),
            ConstraintKind::Eq => write!(f, "="),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnivConstraint {
    pub left: String,
    pub kind: ConstraintKind,
    pub right: String,
}

impl UnivConstraint {
    pub fn new(left: impl Into<String>, kind: ConstraintKind, right: impl Into<String>) -> Self {
        UnivConstraint {
            left: left.into(),
            kind,
            right: right.into(),
        }
    }

    pub fn lt(left: impl Into<String>, right: impl Into<String>) -> Self {
        Self::new(left, ConstraintKind::Lt, right)
    }

    pub fn le(left: impl Into<String>, right: impl Into<String>) -> Self {
        Self::new(left, ConstraintKind::Le, right)
    }

    pub fn eq(left: impl Into<String>, right: impl Into<String>) -> Self {
        Self::new(left, ConstraintKind::Eq, right)
    }

    fn mentions(&self, var: &str) -> bool {
        self.left == var || self.right == var
    }
}

impl fmt::Display for UnivConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.left, self.kind, self.right)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UniverseError {
    #[error("cannot enforce {0}: it contradicts the current universe constraints")]
    Inconsistent(UnivConstraint),
}

/// Universe variables and constraints attached to one declaration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UniverseContext {
    pub vars: BTreeSet<String>,
    pub constraints: BTreeSet<UnivConstraint>,
}

impl UniverseContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty() && self.constraints.is_empty()
    }

    pub fn with_var(mut self, var: impl Into<String>) -> Self {
        self.vars.insert(var.into());
        self
    }

    pub fn with_constraint(mut self, constraint: UnivConstraint) -> Self {
        self.add_constraint(constraint);
        self
    }

    /// Adding a constraint also declares the variables it mentions.
    pub fn add_constraint(&mut self, constraint: UnivConstraint) {
        self.vars.insert(constraint.left.clone());
        self.vars.insert(constraint.right.clone());
        self.constraints.insert(constraint);
    }

    pub fn union(&self, other: &UniverseContext) -> UniverseContext {
        let mut merged = self.clone();
        merged.vars.extend(other.vars.iter().cloned());
        merged.constraints.extend(other.constraints.iter().cloned());
        merged
    }

    /// Keep only the variables in `keep`, together with the constraints among
    /// them that the full context implies.
    pub fn restrict(&self, keep: &BTreeSet<String>) -> UniverseContext {
        let graph = Graph::build(self.vars.iter(), self.constraints.iter());
        let vars: BTreeSet<String> = self.vars.intersection(keep).cloned().collect();
        let mut constraints = BTreeSet::new();
        for constraint in &self.constraints {
            if keep.contains(&constraint.left) && keep.contains(&constraint.right) {
                constraints.insert(constraint.clone());
            }
        }
        // Constraints that only held through a dropped variable.
        for left in &vars {
            for right in &vars {
                if left == right {
                    continue;
                }
                if let Some(strict) = graph.path_strictness(left, right) {
                    let direct = self.constraints.iter().any(|c| {
                        c.left == *left && c.right == *right
                            || (c.kind == ConstraintKind::Eq && c.right == *left && c.left == *right)
                    });
                    if !direct {
                        let kind = if strict {
                            ConstraintKind::Lt
                        } else {
                            ConstraintKind::Le
                        };
                        constraints.insert(UnivConstraint::new(left.clone(), kind, right.clone()));
                    }
                }
            }
        }
        UniverseContext { vars, constraints }
    }

    pub fn mentions(&self, var: &str) -> bool {
        self.vars.contains(var) || self.constraints.iter().any(|c| c.mentions(var))
    }
}

impl fmt::Display for UniverseContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let vars: Vec<&str> = self.vars.iter().map(String::as_str).collect();
        write!(f, "{{{}}}", vars.join(" "))?;
        if !self.constraints.is_empty() {
            let constraints: Vec<String> = self.constraints.iter().map(|c| c.to_string()).collect();
            write!(f, " |= {}", constraints.join(", "))?;
        }
        Ok(())
    }
}

/// Edge `from -> to` with weight 1 (strict) or 0 (large): `to >= from + weight`.
struct Graph {
    index: BTreeMap<String, usize>,
    edges: Vec<(usize, usize, u8)>,
}

impl Graph {
    fn build<'a>(
        vars: impl Iterator<Item = &'a String>,
        constraints: impl Iterator<Item = &'a UnivConstraint>,
    ) -> Graph {
        let mut graph = Graph {
            index: BTreeMap::new(),
            edges: Vec::new(),
        };
        for var in vars {
            graph.node(var);
        }
        for constraint in constraints {
            graph.add(constraint);
        }
        graph
    }

    fn node(&mut self, var: &str) -> usize {
        let next = self.index.len();
        *self.index.entry(var.to_string()).or_insert(next)
    }

    fn add(&mut self, constraint: &UnivConstraint) {
        let l = self.node(&constraint.left);
        let r = self.node(&constraint.right);
        match constraint.kind {
            ConstraintKind::Lt => self.edges.push((l, r, 1)),
            ConstraintKind::Le => self.edges.push((l, r, 0)),
            ConstraintKind::Eq => {
                self.edges.push((l, r, 0));
                self.edges.push((r, l, 0));
            }
        }
    }

    /// Bellman-Ford on longest paths: a positive cycle means some variable
    /// would have to be strictly greater than itself.
    fn is_consistent(&self) -> bool {
        let n = self.index.len();
        let mut dist = vec![0u64; n];
        for _ in 0..=n {
            let mut changed = false;
            for &(from, to, weight) in &self.edges {
                let candidate = dist[from] + weight as u64;
                if candidate > dist[to] {
                    dist[to] = candidate;
                    changed = true;
                }
            }
            if !changed {
                return true;
            }
        }
        false
    }

    /// `Some(strict)` when `to` is reachable from `from`; `strict` when some
    /// path crosses a strict edge.
    fn path_strictness(&self, from: &str, to: &str) -> Option<bool> {
        let start = *self.index.get(from)?;
        let goal = *self.index.get(to)?;
        // best[node] = Some(strict) for the strongest path found so far
        let mut best: Vec<Option<bool>> = vec![None; self.index.len()];
        best[start] = Some(false);
        let mut stack = vec![start];
        while let Some(node) = stack.pop() {
            let here = best[node].unwrap_or(false);
            for &(from, to, weight) in &self.edges {
                if from != node {
                    continue;
                }
                let strict = here || weight > 0;
                let improves = match best[to] {
                    None => true,
                    Some(old) => strict && !old,
                };
                if improves {
                    best[to] = Some(strict);
                    stack.push(to);
                }
            }
        }
        if start == goal {
            return None;
        }
        best[goal]
    }
}

/// The ambient universe state: every constraint accepted so far.
#[derive(Debug, Clone, Default)]
pub struct UniverseGraph {
    vars: BTreeSet<String>,
    constraints: Vec<UnivConstraint>,
}

impl UniverseGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn vars(&self) -> &BTreeSet<String> {
        &self.vars
    }

    pub fn constraints(&self) -> &[UnivConstraint] {
        &self.constraints
    }

    /// Check that `ctx` can be added without committing it.
    pub fn check(&self, ctx: &UniverseContext) -> Result<(), UniverseError> {
        let mut graph = Graph::build(self.vars.iter(), self.constraints.iter());
        for var in &ctx.vars {
            graph.node(var);
        }
        for constraint in &ctx.constraints {
            graph.add(constraint);
            if !graph.is_consistent() {
                return Err(UniverseError::Inconsistent(constraint.clone()));
            }
        }
        Ok(())
    }

    /// Check then commit.
    pub fn merge(&mut self, ctx: &UniverseContext) -> Result<(), UniverseError> {
        self.check(ctx)?;
        self.vars.extend(ctx.vars.iter().cloned());
        for constraint in &ctx.constraints {
            if !self.constraints.contains(constraint) {
                self.constraints.push(constraint.clone());
            }
        }
        Ok(())
    }
}

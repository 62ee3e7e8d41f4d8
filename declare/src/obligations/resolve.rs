//! Driving programs to completion: resolution rounds, interactive obligation
//! proofs, and the final registration of a program.

use super::{declare_obligation_entry, decompose, Hole, Obligation, ObligationBody, ObligationProgram, ProgramInfo, Progress};
use crate::entry::{
    CloseMode, DeclBody, DeclGroup, Declaration, Opacity, ProofEnding, ProofEntry, ProofInfo, DeclKind,
};
use crate::error::{DeclareError, Result};
use crate::program_table::ProgramTable;
use crate::proof::session::ProofState;
use crate::proof::{InitialGoal, ProofSession, Tactic};
use crate::registry::Registry;
use kernel::ast::{Definition, Term};
use kernel::checker::Env;
use kernel::universe::UniverseContext;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A proposed solution for an obligation.
#[derive(Debug, Clone)]
pub struct ObligationAnswer {
    pub body: Arc<Term>,
    pub side_effects: Vec<Definition>,
    pub universes: UniverseContext,
}

impl From<Arc<Term>> for ObligationAnswer {
    fn from(body: Arc<Term>) -> Self {
        ObligationAnswer {
            body,
            side_effects: Vec::new(),
            universes: UniverseContext::new(),
        }
    }
}

/// Tries to solve eligible obligations automatically.
pub trait Resolver {
    /// `statement` is the obligation's type with solved obligations
    /// substituted. `None` leaves the obligation unsolved.
    fn attempt(&mut self, env: &Env, obligation: &Obligation, statement: &Arc<Term>) -> Option<ObligationAnswer>;
}

/// Never solves anything.
#[derive(Debug, Default)]
pub struct NoResolver;

impl Resolver for NoResolver {
    fn attempt(&mut self, _env: &Env, _obligation: &Obligation, _statement: &Arc<Term>) -> Option<ObligationAnswer> {
        None
    }
}

pub struct FnResolver<F>(F);

impl<F> fmt::Debug for FnResolver<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FnResolver(..)")
    }
}

/// Resolver from a closure returning a body.
pub fn resolver_fn<F>(f: F) -> FnResolver<F>
where
    F: FnMut(&Env, &Obligation, &Arc<Term>) -> Option<Arc<Term>>,
{
    FnResolver(f)
}

impl<F> Resolver for FnResolver<F>
where
    F: FnMut(&Env, &Obligation, &Arc<Term>) -> Option<Arc<Term>>,
{
    fn attempt(&mut self, env: &Env, obligation: &Obligation, statement: &Arc<Term>) -> Option<ObligationAnswer> {
        (self.0)(env, obligation, statement).map(ObligationAnswer::from)
    }
}

/// Runs the obligation's own tactic, or `default`, in a private proof.
#[derive(Debug, Default, Clone)]
pub struct TacticResolver {
    pub default: Option<Arc<dyn Tactic>>,
}

impl TacticResolver {
    pub fn new(default: Option<Arc<dyn Tactic>>) -> Self {
        TacticResolver { default }
    }
}

impl Resolver for TacticResolver {
    fn attempt(&mut self, env: &Env, obligation: &Obligation, statement: &Arc<Term>) -> Option<ObligationAnswer> {
        let tactic = obligation.tactic.clone().or_else(|| self.default.clone())?;
        let goal = InitialGoal::new(statement.clone());
        let mut state = ProofState::new(&obligation.name, env.clone(), vec![goal], UniverseContext::new());
        if let Err(err) = state.apply(tactic.as_ref()) {
            debug!(obligation = %obligation.name, %err, "tactic did not apply");
            return None;
        }
        if state.open_goal_count() > 0 {
            debug!(obligation = %obligation.name, open = state.open_goal_count(), "tactic left goals");
            return None;
        }
        let closed = state.close(Opacity::Opaque, CloseMode::Complete).ok()?;
        let body = closed.outputs.into_iter().next()?.body?;
        Some(ObligationAnswer {
            body,
            side_effects: closed.side_effects,
            universes: closed.universes,
        })
    }
}

/// Register a new program: decompose it, try every obligation once with
/// `resolver`, and register it right away if nothing remains.
#[allow(clippy::too_many_arguments)]
pub fn add_program(
    registry: &mut Registry,
    table: &mut ProgramTable,
    name: &str,
    info: ProgramInfo,
    ty: Arc<Term>,
    body: Arc<Term>,
    universes: UniverseContext,
    holes: Vec<Hole>,
    resolver: &mut dyn Resolver,
) -> Result<Progress> {
    if registry.is_declared(name) || table.contains(name) {
        return Err(DeclareError::DuplicateName(name.to_string()));
    }
    let program = decompose(name, info, ty, body, universes, holes)?;
    info!(program = %name, obligations = program.obligations.len(), "program added");
    let empty = program.obligations.is_empty();
    table.insert(program);
    if empty {
        progress(registry, table, name)
    } else {
        resolve(registry, table, name, resolver)
    }
}

/// One resolution round over the obligations eligible when it starts and
/// not yet attempted. Obligations that become eligible during the round wait
/// for the next one.
pub fn resolve(
    registry: &mut Registry,
    table: &mut ProgramTable,
    name: &str,
    resolver: &mut dyn Resolver,
) -> Result<Progress> {
    let program = table
        .get_mut(name)
        .ok_or_else(|| DeclareError::UnknownProgram(name.to_string()))?;
    for id in program.eligible() {
        if program.obligations[id.0].attempted {
            continue;
        }
        let statement = program.statement(id)?;
        let Some(answer) = resolver.attempt(registry.env(), &program.obligations[id.0], &statement) else {
            continue;
        };
        program.obligations[id.0].attempted = true;
        let entry = ProofEntry::new(answer.body)
            .with_side_effects(answer.side_effects)
            .with_universes(answer.universes);
        match declare_obligation_entry(registry, program, id, entry).map(|(defined, _)| defined) {
            Ok(_) => {}
            Err(err) if !err.is_internal() => {
                warn!(program = %name, obligation = %program.obligations[id.0].name, %err, "solution rejected");
            }
            Err(err) => return Err(err),
        }
    }
    progress(registry, table, name)
}

/// Resolution rounds until the program is registered or a round makes no
/// progress. Earlier failed attempts are retried.
pub fn solve_all(
    registry: &mut Registry,
    table: &mut ProgramTable,
    name: &str,
    resolver: &mut dyn Resolver,
) -> Result<Progress> {
    table
        .get_mut(name)
        .ok_or_else(|| DeclareError::UnknownProgram(name.to_string()))?
        .clear_attempts();
    loop {
        let before = table
            .get(name)
            .map(|p| p.remaining)
            .ok_or_else(|| DeclareError::UnknownProgram(name.to_string()))?;
        match resolve(registry, table, name, resolver)? {
            Progress::Remain(after) if after < before => continue,
            other => return Ok(other),
        }
    }
}

/// Where the program stands; registers it once nothing remains.
pub fn progress(registry: &mut Registry, table: &mut ProgramTable, name: &str) -> Result<Progress> {
    let program = table
        .get(name)
        .ok_or_else(|| DeclareError::UnknownProgram(name.to_string()))?;
    if program.remaining > 0 {
        return Ok(Progress::Remain(program.remaining));
    }
    finalize(registry, table, name)
}

/// Register a complete program, together with the rest of its mutual group.
fn finalize(registry: &mut Registry, table: &mut ProgramTable, name: &str) -> Result<Progress> {
    let Some(program) = table.get(name) else {
        return Err(DeclareError::UnknownProgram(name.to_string()));
    };
    let mut members = vec![name.to_string()];
    for other in &program.info.mutual {
        if !members.contains(other) {
            members.push(other.clone());
        }
    }
    if members
        .iter()
        .any(|m| table.get(m).map(|p| p.remaining > 0).unwrap_or(true))
    {
        debug!(program = %name, "waiting on the rest of the mutual group");
        return Ok(Progress::Dependent);
    }

    let mut group = DeclGroup::new(program.info.scope).polymorphic(program.info.polymorphic);
    if members.len() > 1 {
        group = group.mutual();
    }
    let mut universes = UniverseContext::new();
    for member in &members {
        let program = table
            .get(member)
            .ok_or_else(|| DeclareError::UnknownProgram(member.clone()))?;
        let (ty, body, associations) = program.reassemble()?;
        universes = universes.union(&program.universes);
        let entry = ProofEntry::new(body).with_type(ty).opaque(program.info.opaque);
        group = group.with_decl(
            Declaration::new(member.clone(), program.info.kind, DeclBody::Defined(entry))
                .with_impargs(program.info.impargs.clone())
                .with_obligations(associations),
        );
    }
    group = group.with_universes(universes);
    registry.check_group(&group)?;

    for (decl, member) in group.decls.iter_mut().zip(&members) {
        decl.hook = table.get_mut(member).and_then(|p| p.info.hook.take());
    }
    let registered = registry.register_group(group);
    if matches!(registered, Ok(_) | Err(DeclareError::Hook(_))) {
        for member in &members {
            table.remove(member);
        }
    }
    let refs = registered?;
    info!(program = %name, members = members.len(), "program defined");
    refs.into_iter()
        .next()
        .map(Progress::Defined)
        .ok_or_else(|| DeclareError::UnknownProgram(name.to_string()))
}

/// Open a proof of the first eligible obligation of the selected program.
pub fn next_obligation(registry: &Registry, table: &ProgramTable, program: Option<&str>) -> Result<ProofSession> {
    let program = table.unique_open(program)?;
    let id = program
        .eligible()
        .into_iter()
        .next()
        .ok_or(DeclareError::NoActiveProgram)?;
    let obligation = program.obligation(id)?;
    let kind = match obligation.status {
        super::ObligationStatus::Define { opaque: true } => DeclKind::Lemma,
        _ => DeclKind::Definition,
    };
    let info = ProofInfo::new(kind)
        .with_scope(program.info.scope)
        .with_udecl(program.universes.clone())
        .with_ending(ProofEnding::Obligation {
            program: program.name.clone(),
            id,
        });
    let statement = program.statement(id)?;
    let mut session = ProofSession::start(
        registry,
        &obligation.name,
        program.info.polymorphic,
        vec![InitialGoal::new(statement)],
        info,
    )?;
    if let Some(tactic) = &obligation.tactic {
        session.set_end_tactic(tactic.clone());
    }
    Ok(session)
}

/// Close a proof opened by [`next_obligation`] and solve the obligation.
pub fn save_obligation(registry: &mut Registry, table: &mut ProgramTable, session: ProofSession) -> Result<Progress> {
    let (program, id, closed) = session.into_obligation_parts()?;
    let goal = closed
        .outputs
        .into_iter()
        .next()
        .ok_or_else(|| DeclareError::UnknownProgram(program.clone()))?;
    let body = goal.body.ok_or_else(|| DeclareError::OpenGoalsRemain {
        name: goal.name.clone(),
        remaining: 1,
    })?;
    let entry = ProofEntry::new(body)
        .with_side_effects(closed.side_effects)
        .with_universes(closed.universes);
    let target = table
        .get_mut(&program)
        .ok_or_else(|| DeclareError::UnknownProgram(program.clone()))?;
    declare_obligation_entry(registry, target, id, entry)?;
    progress(registry, table, &program)
}

/// Assume every unsolved obligation of the selected program, in dependency
/// order.
pub fn admit_obligations(registry: &mut Registry, table: &mut ProgramTable, program: Option<&str>) -> Result<Progress> {
    let name = table.unique_open(program)?.name.clone();
    loop {
        let target = table
            .get_mut(&name)
            .ok_or_else(|| DeclareError::UnknownProgram(name.clone()))?;
        let eligible = target.eligible();
        if eligible.is_empty() {
            break;
        }
        for id in eligible {
            let statement = target.statement(id)?;
            let obligation_name = target.obligations[id.0].name.clone();
            let reference = registry.register_assumption(
                &obligation_name,
                target.info.scope,
                statement,
                target.universes.clone(),
                None,
            )?;
            warn!(program = %name, obligation = %obligation_name, "obligation admitted");
            target.obligations[id.0].body = Some(ObligationBody::Defined {
                value: reference.to_term(),
                reference,
            });
            target.remaining -= 1;
        }
    }
    progress(registry, table, &name)
}

/// Drop a program without registering anything. The rest of its mutual
/// group stops waiting for it.
pub fn abandon(table: &mut ProgramTable, name: &str) -> Result<ObligationProgram> {
    let program = table
        .remove(name)
        .ok_or_else(|| DeclareError::UnknownProgram(name.to_string()))?;
    table.detach(name);
    info!(program = %name, remaining = program.remaining, "program abandoned");
    Ok(program)
}

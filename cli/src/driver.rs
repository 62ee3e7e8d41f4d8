//! Command driver: reads s-expression commands and runs them against one
//! registry, one program table and at most one open proof.
//!
//! ```text
//! (axiom A Prop)
//! (theorem id_a (-> A A))
//! (intro h)
//! (assumption)
//! (qed)
//! ```

use crate::config::DriverConfig;
use anyhow::{anyhow, bail, Context, Result};
use declare::obligations::{self, TacticResolver};
use declare::proof::{Abstract, Admit, Apply, Assumption, Exact, Intro, Tactic, Then};
use declare::{
    declare_assumption, declare_definition, declare_mutual, CloseMode, DeclKind, DeclareError, DeferredProof,
    DiagnosticCollector, Hole, InitialGoal, ObligationStatus, Opacity, ProgramInfo, ProgramTable, ProofEnding,
    ProofInfo, ProofSession, Progress, Registry, Scope,
};
use kernel::parser::{parse_sexps, term_from_sexp, Sexp};
use kernel::universe::{UnivConstraint, UniverseContext};
use kernel::Term;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, info, warn};

/// How an interactive proof ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ending {
    Qed,
    Defined,
    Admitted,
}

struct ActiveProof {
    session: ProofSession,
    /// Steps recorded for a deferred close; `None` when steps run immediately.
    script: Option<Vec<Box<dyn Tactic>>>,
}

impl ActiveProof {
    fn is_obligation(&self) -> bool {
        matches!(self.session.info().ending, ProofEnding::Obligation { .. })
    }
}

pub struct Driver {
    registry: Registry,
    programs: ProgramTable,
    proof: Option<ActiveProof>,
    pending: Vec<DeferredProof>,
    config: DriverConfig,
    obligation_tactic: Option<Arc<dyn Tactic>>,
    diagnostics: DiagnosticCollector,
    runtime: Runtime,
}

impl Driver {
    pub fn new(config: DriverConfig) -> Result<Self> {
        let diagnostics = DiagnosticCollector::new();
        let registry = Registry::new().with_diagnostics(diagnostics.clone());
        let obligation_tactic = match &config.obligation_tactic {
            Some(source) => Some(Arc::from(parse_tactic_source(source).context("in obligation-tactic")?)),
            None => None,
        };
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("declare-worker")
            .build()
            .context("starting the proof worker pool")?;
        Ok(Driver {
            registry,
            programs: ProgramTable::new(),
            proof: None,
            pending: Vec::new(),
            config,
            obligation_tactic,
            diagnostics,
            runtime,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn programs(&self) -> &ProgramTable {
        &self.programs
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Name of the open proof, if any.
    pub fn current_proof(&self) -> Option<&str> {
        self.proof.as_ref().map(|p| p.session.name())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn run_file(&mut self, path: &Path) -> Result<Vec<String>> {
        let source = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        self.run_source(&source)
            .with_context(|| format!("in {}", path.display()))
    }

    /// Run every command in `source`, stopping at the first failure.
    pub fn run_source(&mut self, source: &str) -> Result<Vec<String>> {
        let commands = parse_sexps(source).context("parse error")?;
        let mut output = Vec::new();
        for (i, command) in commands.iter().enumerate() {
            let lines = self.execute(command).with_context(|| {
                format!("command {} ({})", i + 1, command.head().unwrap_or("?"))
            })?;
            output.extend(lines);
        }
        Ok(output)
    }

    /// Run one command. Returns the messages it produced, registration
    /// notices first.
    pub fn execute(&mut self, command: &Sexp) -> Result<Vec<String>> {
        let items = command
            .as_list()
            .ok_or_else(|| anyhow!("expected a command, got {}", command))?;
        let head = command
            .head()
            .ok_or_else(|| anyhow!("expected a command name in {}", command))?;
        let args = &items[1..];
        debug!(command = head, "executing");
        let result = match head {
            "axiom" => self.assumption(args, Scope::Global),
            "variable" => self.assumption(args, Scope::Discharge),
            "definition" => self.definition(args),
            "mutual" => self.mutual(args),
            "theorem" => self.start_proof(args, DeclKind::Theorem),
            "lemma" => self.start_proof(args, DeclKind::Lemma),
            "intro" | "exact" | "assumption" | "apply" | "admit" | "abstract" | "then" => self.tactic(command),
            "proof-using" => self.proof_using(args),
            "qed" => self.end_proof(Ending::Qed),
            "defined" => self.end_proof(Ending::Defined),
            "admitted" => self.end_proof(Ending::Admitted),
            "abort" => self.abort(),
            "program" => self.program(args),
            "next-obligation" => self.next_obligation(args),
            "solve-obligations" => self.solve_obligations(args),
            "admit-obligations" => self.admit_obligations(args),
            "obligations" => self.obligations(args),
            "print" => self.print(args),
            "print-assumptions" => self.print_assumptions(args),
            "join" => self.join(),
            other => Err(anyhow!("unknown command {}", other)),
        };
        let notices = self.diagnostics.take();
        let lines = result?;
        Ok(notices.iter().map(|d| d.to_string()).chain(lines).collect())
    }

    /// Merge outstanding deferred proofs and report what is left unfinished.
    pub fn finish(&mut self) -> Result<Vec<String>> {
        let mut output = self.join()?;
        output.extend(self.diagnostics.take().iter().map(|d| d.to_string()));
        if let Some(proof) = &self.proof {
            warn!(proof = %proof.session.name(), "proof left open");
            output.push(format!("{} is still open", proof.session.name()));
        }
        for program in self.programs.open_programs() {
            output.push(format!("{}: {} obligation(s) remaining", program.name, program.remaining));
        }
        Ok(output)
    }

    pub fn goal_lines(&self) -> Vec<String> {
        match &self.proof {
            Some(proof) => render_goals(&proof.session),
            None => vec!["No proof in progress.".to_string()],
        }
    }

    // -------------------------------------------------------------------------
    // Declarations
    // -------------------------------------------------------------------------

    fn assumption(&mut self, args: &[Sexp], scope: Scope) -> Result<Vec<String>> {
        let (args, universes) = split_universes(args)?;
        let [name, ty] = args else {
            bail!("expected a name and a type");
        };
        declare_assumption(&mut self.registry, atom(name)?, scope, term(ty)?, universes)?;
        Ok(Vec::new())
    }

    fn definition(&mut self, args: &[Sexp]) -> Result<Vec<String>> {
        let (args, universes) = split_universes(args)?;
        let (name, ty, body) = match args {
            [name, body] => (name, None, body),
            [name, ty, body] => (name, Some(term(ty)?), body),
            _ => bail!("expected a name, an optional type and a body"),
        };
        let info = ProgramInfo::new(DeclKind::Definition).polymorphic(self.config.polymorphic);
        declare_definition(
            &mut self.registry,
            atom(name)?,
            info,
            ty,
            term(body)?,
            universes,
            Vec::new(),
        )?;
        Ok(Vec::new())
    }

    fn mutual(&mut self, args: &[Sexp]) -> Result<Vec<String>> {
        let (args, universes) = split_universes(args)?;
        let mut defs = Vec::with_capacity(args.len());
        for member in args {
            let [name, ty, body] = list(member)? else {
                bail!("expected (name type body), got {}", member);
            };
            defs.push((atom(name)?.to_string(), term(ty)?, term(body)?));
        }
        if defs.is_empty() {
            bail!("empty mutual block");
        }
        let info = ProgramInfo::new(DeclKind::Definition).polymorphic(self.config.polymorphic);
        declare_mutual(&mut self.registry, info, defs, universes)?;
        Ok(Vec::new())
    }

    // -------------------------------------------------------------------------
    // Interactive proofs
    // -------------------------------------------------------------------------

    fn ensure_no_proof(&self) -> Result<()> {
        match &self.proof {
            Some(proof) => bail!("finish the proof of {} first", proof.session.name()),
            None => Ok(()),
        }
    }

    fn start_proof(&mut self, args: &[Sexp], kind: DeclKind) -> Result<Vec<String>> {
        self.ensure_no_proof()?;
        let (args, universes) = split_universes(args)?;
        let Some((name, statements)) = args.split_first() else {
            bail!("expected a name and at least one statement");
        };
        let goals = statements
            .iter()
            .map(|s| term(s).map(InitialGoal::new))
            .collect::<Result<Vec<_>>>()?;
        let info = ProofInfo::new(kind).with_udecl(universes);
        let session = ProofSession::start(&self.registry, atom(name)?, self.config.polymorphic, goals, info)?;
        let lines = render_goals(&session);
        let script = self.config.async_proofs.then(Vec::new);
        self.proof = Some(ActiveProof { session, script });
        Ok(lines)
    }

    fn tactic(&mut self, command: &Sexp) -> Result<Vec<String>> {
        let tactic = parse_tactic(command)?;
        let proof = self.proof.as_mut().ok_or_else(|| anyhow!("no proof in progress"))?;
        if let Some(script) = &mut proof.script {
            script.push(tactic);
            return Ok(vec![format!("{} step(s) recorded", script.len())]);
        }
        proof.session.apply(tactic.as_ref())?;
        Ok(render_goals(&proof.session))
    }

    fn proof_using(&mut self, args: &[Sexp]) -> Result<Vec<String>> {
        let names = args
            .iter()
            .map(|a| atom(a).map(str::to_string))
            .collect::<Result<Vec<_>>>()?;
        let proof = self.proof.as_mut().ok_or_else(|| anyhow!("no proof in progress"))?;
        let closure = proof.session.set_used_variables(&self.registry, &names)?;
        let used: Vec<String> = closure.into_iter().collect();
        Ok(vec![if used.is_empty() {
            format!("{} uses no section variables", proof.session.name())
        } else {
            format!("{} uses {}", proof.session.name(), used.join(", "))
        }])
    }

    fn end_proof(&mut self, ending: Ending) -> Result<Vec<String>> {
        let proof = self.proof.as_ref().ok_or_else(|| anyhow!("no proof in progress"))?;
        if proof.is_obligation() && ending == Ending::Admitted {
            bail!("use admit-obligations to admit obligations");
        }
        // obligation sessions are consumed by save_obligation
        let open = proof.session.open_goal_count();
        if proof.is_obligation() && open > 0 {
            return Err(DeclareError::OpenGoalsRemain {
                name: proof.session.name().to_string(),
                remaining: open,
            }
            .into());
        }
        let Some(proof) = self.proof.take() else {
            bail!("no proof in progress");
        };

        let opacity = match ending {
            Ending::Defined => Opacity::Transparent,
            Ending::Qed | Ending::Admitted => Opacity::Opaque,
        };
        let ActiveProof { session, script } = proof;
        let program = match &session.info().ending {
            ProofEnding::Obligation { program, .. } => Some(program.clone()),
            ProofEnding::Regular => None,
        };
        if let Some(program) = program {
            let progress = obligations::save_obligation(&mut self.registry, &mut self.programs, session)?;
            debug!(%program, ?progress, "obligation saved");
            return Ok(render_progress(&program, progress));
        }
        match script {
            Some(script) => {
                let mode = match ending {
                    Ending::Admitted => CloseMode::Partial,
                    Ending::Qed | Ending::Defined => CloseMode::Complete,
                };
                let deferred = session.close_future(opacity, mode, script);
                // the handle is not needed: merging waits for the result
                drop(deferred.future().spawn(self.runtime.handle()));
                let line = format!("{} deferred as {}", deferred.name(), deferred.id());
                self.pending.push(deferred);
                Ok(vec![line])
            }
            None => {
                let saved = match ending {
                    Ending::Admitted => session.save_admitted(&mut self.registry),
                    Ending::Qed | Ending::Defined => session.save(&mut self.registry, opacity),
                };
                match saved {
                    Ok(_) => Ok(Vec::new()),
                    Err(err) => {
                        if let Some(session) = err.session {
                            self.proof = Some(ActiveProof {
                                session: *session,
                                script: None,
                            });
                        }
                        Err(err.error.into())
                    }
                }
            }
        }
    }

    fn abort(&mut self) -> Result<Vec<String>> {
        let proof = self.proof.take().ok_or_else(|| anyhow!("no proof in progress"))?;
        let name = proof.session.name().to_string();
        proof.session.abort();
        Ok(vec![format!("{} aborted", name)])
    }

    /// Merge every deferred proof, oldest first.
    fn join(&mut self) -> Result<Vec<String>> {
        let mut output = Vec::new();
        while !self.pending.is_empty() {
            let deferred = self.pending.remove(0);
            let name = deferred.name().to_string();
            let id = deferred.id();
            info!(proof = %name, %id, "joining");
            deferred
                .merge(&mut self.registry)
                .with_context(|| format!("deferred proof {} of {}", id, name))?;
            output.extend(self.diagnostics.take().iter().map(|d| d.to_string()));
        }
        Ok(output)
    }

    // -------------------------------------------------------------------------
    // Programs
    // -------------------------------------------------------------------------

    fn program(&mut self, args: &[Sexp]) -> Result<Vec<String>> {
        let [name, ty, body, clauses @ ..] = args else {
            bail!("expected a name, a type, a body and obligation clauses");
        };
        let name = atom(name)?;
        let mut holes = Vec::new();
        let mut mutual = Vec::new();
        let mut universes = UniverseContext::new();
        for clause in clauses {
            match clause.head() {
                Some("obligation") => holes.push(self.hole(clause)?),
                Some("mutual") => {
                    for member in &list(clause)?[1..] {
                        mutual.push(atom(member)?.to_string());
                    }
                }
                Some("universes") => universes = parse_universes(clause)?,
                _ => bail!("unexpected program clause {}", clause),
            }
        }
        let info = ProgramInfo::new(DeclKind::Definition)
            .polymorphic(self.config.polymorphic)
            .with_mutual(mutual);
        let mut resolver = TacticResolver::new(self.obligation_tactic.clone());
        let progress = obligations::add_program(
            &mut self.registry,
            &mut self.programs,
            name,
            info,
            term(ty)?,
            term(body)?,
            universes,
            holes,
            &mut resolver,
        )?;
        Ok(render_progress(name, progress))
    }

    /// `(obligation T (deps 0 1) expand (by TACTIC))`; everything after the
    /// type is optional.
    fn hole(&self, clause: &Sexp) -> Result<Hole> {
        let items = list(clause)?;
        let ty = items
            .get(1)
            .ok_or_else(|| anyhow!("obligation without a type"))?;
        let mut hole = Hole::new(term(ty)?).with_status(ObligationStatus::Define {
            opaque: !self.config.transparent_obligations,
        });
        for option in &items[2..] {
            match (option.as_atom(), option.head()) {
                (Some("expand"), _) => hole = hole.with_status(ObligationStatus::Expand),
                (Some("transparent"), _) => hole = hole.with_status(ObligationStatus::Define { opaque: false }),
                (Some("opaque"), _) => hole = hole.with_status(ObligationStatus::Define { opaque: true }),
                (_, Some("deps")) => {
                    let deps = list(option)?[1..]
                        .iter()
                        .map(|d| d.as_int().ok_or_else(|| anyhow!("dependency {} is not an index", d)))
                        .collect::<Result<Vec<_>>>()?;
                    hole = hole.depends_on(deps);
                }
                (_, Some("by")) => {
                    let [_, tactic] = list(option)? else {
                        bail!("expected (by TACTIC), got {}", option);
                    };
                    hole = hole.with_tactic(Arc::from(parse_tactic(tactic)?));
                }
                _ => bail!("unexpected obligation option {}", option),
            }
        }
        Ok(hole)
    }

    fn next_obligation(&mut self, args: &[Sexp]) -> Result<Vec<String>> {
        self.ensure_no_proof()?;
        let program = optional_name(args)?;
        let session = obligations::next_obligation(&self.registry, &self.programs, program)?;
        let mut lines = vec![format!("Proving {}", session.name())];
        lines.extend(render_goals(&session));
        self.proof = Some(ActiveProof { session, script: None });
        Ok(lines)
    }

    fn solve_obligations(&mut self, args: &[Sexp]) -> Result<Vec<String>> {
        let name = self.programs.unique_open(optional_name(args)?)?.name.clone();
        let mut resolver = TacticResolver::new(self.obligation_tactic.clone());
        let progress = obligations::solve_all(&mut self.registry, &mut self.programs, &name, &mut resolver)?;
        Ok(render_progress(&name, progress))
    }

    fn admit_obligations(&mut self, args: &[Sexp]) -> Result<Vec<String>> {
        let name = self.programs.unique_open(optional_name(args)?)?.name.clone();
        let progress = obligations::admit_obligations(&mut self.registry, &mut self.programs, Some(&name))?;
        Ok(render_progress(&name, progress))
    }

    fn obligations(&self, args: &[Sexp]) -> Result<Vec<String>> {
        let program = self.programs.unique_open(optional_name(args)?)?;
        Ok(program.describe().lines().map(str::to_string).collect())
    }



    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    fn print(&self, args: &[Sexp]) -> Result<Vec<String>> {
        let [name] = args else {
            bail!("expected a name");
        };
        let name = atom(name)?;
        let def = self
            .registry
            .definition(name)
            .ok_or_else(|| anyhow!("unknown name {}", name))?;
        let kind = self
            .registry
            .kind_of(name)
            .map(|k| k.to_string())
            .unwrap_or_else(|| "constant".to_string());
        Ok(vec![match &def.value {
            Some(value) => format!("{} {} : {} := {}", kind, name, def.ty, value),
            None => format!("{} {} : {}", kind, name, def.ty),
        }])
    }

    fn print_assumptions(&self, args: &[Sexp]) -> Result<Vec<String>> {
        let [name] = args else {
            bail!("expected a name");
        };
        let name = atom(name)?;
        let axioms = self.registry.assumptions_of(name)?;
        Ok(vec![if axioms.is_empty() {
            format!("{} is closed under the global context", name)
        } else {
            format!("{} depends on {}", name, axioms.join(", "))
        }])
    }
}

fn render_progress(program: &str, progress: Progress) -> Vec<String> {
    match progress {
        Progress::Remain(n) => vec![format!("{}: {} obligation(s) remaining", program, n)],
        Progress::Dependent => vec![format!("{}: complete, waiting on its mutual block", program)],
        Progress::Defined(_) => Vec::new(),
    }
}

fn render_goals(session: &ProofSession) -> Vec<String> {
    let goals = session.goals();
    if goals.is_empty() {
        return vec!["No more goals.".to_string()];
    }
    let mut lines = vec![format!("{} goal(s)", goals.len())];
    lines.extend(goals.iter().map(|g| format!("  {}", g)));
    lines
}

fn atom(sexp: &Sexp) -> Result<&str> {
    sexp.as_atom().ok_or_else(|| anyhow!("expected a name, got {}", sexp))
}

fn list(sexp: &Sexp) -> Result<&[Sexp]> {
    sexp.as_list().ok_or_else(|| anyhow!("expected a list, got {}", sexp))
}

fn optional_name(args: &[Sexp]) -> Result<Option<&str>> {
    match args {
        [] => Ok(None),
        [name] => atom(name).map(Some),
        _ => bail!("expected at most one program name"),
    }
}

/// A trailing `(universes ...)` clause, if present.
fn split_universes(args: &[Sexp]) -> Result<(&[Sexp], UniverseContext)> {
    match args.split_last() {
        Some((last, rest)) if last.head() == Some("universes") => Ok((rest, parse_universes(last)?)),
        _ => Ok((args, UniverseContext::new())),
    }
}

/// `(universes u v (< u v) (<= v w) (= w x))`
fn parse_universes(clause: &Sexp) -> Result<UniverseContext> {
    let mut ctx = UniverseContext::new();
    for item in &list(clause)?[1..] {
        if let Some(var) = item.as_atom() {
            ctx = ctx.with_var(var);
            continue;
        }
        let [op, left, right] = list(item)? else {
            bail!("expected a universe or a constraint, got {}", item);
        };
        let (left, right) = (atom(left)?, atom(right)?);
        let constraint = match atom(op)? {
            "<" => UnivConstraint::lt(left, right),
            "<=" => UnivConstraint::le(left, right),
            "=" => UnivConstraint::eq(left, right),
            other => bail!("unknown universe constraint {}", other),
        };
        ctx = ctx.with_constraint(constraint);
    }
    Ok(ctx)
}

fn term(sexp: &Sexp) -> Result<Arc<Term>> {
    term_from_sexp(sexp).with_context(|| format!("in term {}", sexp))
}

pub fn parse_tactic(sexp: &Sexp) -> Result<Box<dyn Tactic>> {
    if let Some(name) = sexp.as_atom() {
        return match name {
            "assumption" => Ok(Box::new(Assumption)),
            "admit" => Ok(Box::new(Admit)),
            other => bail!("unknown tactic {}", other),
        };
    }
    let items = list(sexp)?;
    let head = sexp.head().ok_or_else(|| anyhow!("expected a tactic, got {}", sexp))?;
    let tactic: Box<dyn Tactic> = match (head, &items[1..]) {
        ("intro", [name]) => Box::new(Intro(atom(name)?.to_string())),
        ("exact", [t]) => Box::new(Exact(term(t)?)),
        ("apply", [t]) => Box::new(Apply(term(t)?)),
        ("assumption", []) => Box::new(Assumption),
        ("admit", []) => Box::new(Admit),
        ("abstract", [name, inner]) => Box::new(Abstract::new(atom(name)?, parse_tactic(inner)?)),
        ("then", [first, rest]) => Box::new(Then::new(parse_tactic(first)?, parse_tactic(rest)?)),
        _ => bail!("malformed tactic {}", sexp),
    };
    Ok(tactic)
}

fn parse_tactic_source(source: &str) -> Result<Box<dyn Tactic>> {
    let sexps = parse_sexps(source)?;
    let [tactic] = sexps.as_slice() else {
        bail!("expected exactly one tactic");
    };
    parse_tactic(tactic)
}

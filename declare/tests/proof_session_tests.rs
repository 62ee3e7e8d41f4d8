//! Interactive proof sessions: goal accounting, safety, saving and admitting.

use declare::diagnostics::{DiagnosticCollector, Level};
use declare::proof::{Abstract, Admit, Apply, Assumption, Exact, Intro};
use declare::{
    declare_assumption, DeclKind, DeclareError, Hook, InitialGoal, Opacity, ProofInfo, ProofSession, Registry, Scope,
};
use kernel::parser::parse_term;
use kernel::universe::UniverseContext;
use kernel::Term;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

fn term(src: &str) -> Arc<Term> {
    parse_term(src).expect("test term should parse")
}

fn assume(registry: &mut Registry, name: &str, ty: &str) {
    declare_assumption(registry, name, Scope::Global, term(ty), UniverseContext::new())
        .unwrap_or_else(|err| panic!("{} : {} should be accepted: {}", name, ty, err));
}

/// A : Prop, B : Prop, a : A, f : A -> B
fn base_registry() -> Registry {
    let mut registry = Registry::new();
    assume(&mut registry, "A", "Prop");
    assume(&mut registry, "B", "Prop");
    assume(&mut registry, "a", "A");
    assume(&mut registry, "f", "(-> A B)");
    registry
}

fn start(registry: &Registry, name: &str, goals: &[&str]) -> ProofSession {
    let goals = goals.iter().map(|g| InitialGoal::new(term(g))).collect();
    ProofSession::start(registry, name, false, goals, ProofInfo::new(DeclKind::Theorem))
        .expect("session should start")
}

// =============================================================================
// GOAL ACCOUNTING
// =============================================================================

/// intro + assumption proves A -> A and the proof is registered
#[test]
fn save_registers_the_closed_proof() {
    let mut registry = base_registry();
    let mut session = start(&registry, "id_a", &["(-> A A)"]);
    session.apply(&Intro("h".to_string())).expect("intro");
    assert_eq!(session.open_goal_count(), 1);
    session.apply(&Assumption).expect("assumption");
    assert_eq!(session.open_goal_count(), 0);

    let refs = session.save(&mut registry, Opacity::Opaque).expect("complete proof saves");
    assert_eq!(refs.len(), 1);
    assert_eq!(refs[0].name(), "id_a");
    assert_eq!(registry.kind_of("id_a"), Some(DeclKind::Theorem));
    let value = registry
        .definition("id_a")
        .and_then(|d| d.value.clone())
        .expect("theorem has a body");
    insta::assert_snapshot!(value.to_string(), @"(lam A 0)");
}

/// Once every goal is closed further steps fail and the count stays at zero
#[test]
fn goal_count_never_goes_negative() {
    let registry = base_registry();
    let mut session = start(&registry, "t", &["A"]);
    session.apply(&Exact(term("a"))).expect("a proves A");
    let result = session.apply(&Exact(term("a")));
    assert!(
        matches!(result, Err(DeclareError::NoOpenGoals)),
        "no goal left to solve: {:?}",
        result
    );
    assert_eq!(session.open_goal_count(), 0);
}

/// A failing tactic leaves the session untouched
#[test]
fn failed_steps_change_nothing() {
    let registry = base_registry();
    let mut session = start(&registry, "t", &["B"]);
    let before = session.goals();
    let result = session.apply(&Exact(term("a")));
    assert!(matches!(result, Err(DeclareError::Tactic(_))), "a does not prove B: {:?}", result);
    assert_eq!(session.goals(), before);
    assert!(session.is_safe());
}

/// apply produces one goal per premise
#[test]
fn apply_opens_premises() {
    let mut registry = base_registry();
    let mut session = start(&registry, "b", &["B"]);
    session.apply(&Apply(term("f"))).expect("f concludes B");
    let goals: Vec<String> = session.goals().iter().map(|g| g.to_string()).collect();
    assert_eq!(goals, vec!["|- A"]);
    session.apply(&Exact(term("a"))).expect("a proves A");
    session.save(&mut registry, Opacity::Opaque).expect("complete");
    assert!(registry.is_declared("b"));
}

/// Two goals, one discharged: saving fails and hands the session back,
/// admitting that same session registers both statements as assumptions
#[test]
fn two_goals_one_discharged() {
    let mut registry = base_registry();
    let mut session = start(&registry, "two", &["A", "B"]);
    session.apply(&Exact(term("a"))).expect("a proves A");
    assert_eq!(session.open_goal_count(), 1);

    let err = session
        .save(&mut registry, Opacity::Opaque)
        .expect_err("one goal is still open");
    assert!(
        matches!(err.error, DeclareError::OpenGoalsRemain { remaining: 1, .. }),
        "{:?}",
        err.error
    );
    assert!(!registry.is_declared("two"), "a failed save registers nothing");
    let session = err.into_session().expect("nothing was registered, the session survives");
    assert_eq!(session.open_goal_count(), 1);

    let refs = session
        .save_admitted(&mut registry)
        .expect("admitting accepts open goals");
    let names: Vec<&str> = refs.iter().map(|r| r.name()).collect();
    assert_eq!(names, vec!["two", "two_1"]);
    assert_eq!(registry.kind_of("two"), Some(DeclKind::Assumption));
    assert!(registry.definition("two").map(|d| d.is_axiom()).unwrap_or(false));
}

/// A name taken while the proof was open fails the save; the session
/// survives and the proof can be finished under the same name later
#[test]
fn failed_saves_keep_the_session() {
    let mut registry = base_registry();
    let mut session = start(&registry, "late_name", &["A"]);
    session.apply(&Exact(term("a"))).expect("a proves A");
    assume(&mut registry, "late_name", "B");

    let err = session
        .save(&mut registry, Opacity::Opaque)
        .expect_err("late_name is taken");
    assert!(matches!(err.error, DeclareError::DuplicateName(ref n) if n == "late_name"), "{:?}", err.error);
    let session = err.into_session().expect("the session survives a duplicate name");
    assert_eq!(session.open_goal_count(), 0);
    let err = session.save_admitted(&mut registry).expect_err("still taken");
    assert!(err.session.is_some());
}

/// Admitting an already complete proof is allowed and reported
#[test]
fn admitting_a_complete_proof_warns() {
    let collector = DiagnosticCollector::new();
    let mut registry = base_registry();
    registry.set_diagnostic_handler(Box::new(collector.clone()));
    let mut session = start(&registry, "done", &["A"]);
    session.apply(&Exact(term("a"))).expect("a proves A");
    session.save_admitted(&mut registry).expect("admit");
    let warnings: Vec<String> = collector
        .snapshot()
        .into_iter()
        .filter(|d| d.level == Level::Warning)
        .map(|d| d.to_string())
        .collect();
    assert_eq!(
        warnings,
        vec!["Warning: [proof-complete] the proof of done is complete, it could be saved"]
    );
}

// =============================================================================
// SAFETY
// =============================================================================

/// One admitted step makes the whole proof unsafe, for good
#[test]
fn safety_is_monotonic() {
    let collector = DiagnosticCollector::new();
    let mut registry = base_registry();
    registry.set_diagnostic_handler(Box::new(collector.clone()));
    let mut session = start(&registry, "shaky", &["B", "A"]);
    assert!(session.is_safe());
    let safe = session.apply(&Admit).expect("admit always applies");
    assert!(!safe);
    let safe = session.apply(&Exact(term("a"))).expect("a proves A");
    assert!(!safe, "a safe step cannot restore safety");
    assert!(!session.is_safe());

    session.save(&mut registry, Opacity::Opaque).expect("admitted proofs still save");
    assert!(collector
        .snapshot()
        .iter()
        .any(|d| d.code == Some("unsafe-proof") && d.subject.as_deref() == Some("shaky")));
    let axioms = registry.assumptions_of("shaky").expect("registered");
    assert!(
        axioms.iter().any(|name| name.starts_with("admitted_")),
        "the admitted axiom is an assumption of the proof: {:?}",
        axioms
    );
}

// =============================================================================
// NAMES, SIDE EFFECTS AND HOOKS
// =============================================================================

/// Proofs cannot reuse a registered name
#[test]
fn session_names_must_be_fresh() {
    let registry = base_registry();
    let result = ProofSession::start(
        &registry,
        "a",
        false,
        vec![InitialGoal::new(term("A"))],
        ProofInfo::default(),
    );
    assert!(matches!(result, Err(DeclareError::DuplicateName(ref n)) if n == "a"), "{:?}", result.map(|s| s.name().to_string()));
}

/// Auxiliary lemmas are registered before the proof that uses them
#[test]
fn abstracted_lemmas_are_registered_first() {
    let mut registry = base_registry();
    let mut session = start(&registry, "main", &["A"]);
    session
        .apply(&Abstract::new("main_aux", Exact(term("a"))))
        .expect("abstract");
    let refs = session.save(&mut registry, Opacity::Opaque).expect("save");
    assert_eq!(refs.len(), 1);
    let aux = registry.lookup("main_aux").expect("side effect registered");
    let main = registry.lookup("main").expect("proof registered");
    assert!(aux.serial() < main.serial());
    assert_eq!(registry.kind_of("main_aux"), Some(DeclKind::Lemma));
}

/// The hook fires exactly once, with the new reference
#[test]
fn hook_fires_once_after_registration() {
    let mut registry = base_registry();
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(None));
    let hook = {
        let calls = calls.clone();
        let seen = seen.clone();
        Hook::new(move |snapshot| {
            calls.fetch_add(1, Ordering::SeqCst);
            *seen.lock().expect("hook lock") = Some(snapshot.reference.name().to_string());
            Ok(())
        })
    };
    let info = ProofInfo::new(DeclKind::Lemma).with_hook(hook);
    let mut session =
        ProofSession::start(&registry, "hooked", false, vec![InitialGoal::new(term("A"))], info).expect("start");
    session.apply(&Exact(term("a"))).expect("exact");
    session.save(&mut registry, Opacity::Opaque).expect("save");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(seen.lock().expect("hook lock").as_deref(), Some("hooked"));
}

/// A failing hook is reported, but the declaration stays
#[test]
fn hook_errors_propagate() {
    let mut registry = base_registry();
    let info = ProofInfo::default().with_hook(Hook::new(|_| Err("refused".into())));
    let mut session =
        ProofSession::start(&registry, "refused", false, vec![InitialGoal::new(term("A"))], info).expect("start");
    session.apply(&Exact(term("a"))).expect("exact");
    let result = session.save(&mut registry, Opacity::Opaque);
    match result {
        Err(err) if matches!(err.error, DeclareError::Hook(_)) => {
            insta::assert_snapshot!(err.to_string(), @"declaration hook failed: refused");
            assert!(err.session.is_none(), "the declaration was committed");
        }
        other => panic!("expected a hook failure, got {:?}", other),
    }
    assert!(registry.is_declared("refused"));
}

/// The end tactic runs on every goal a step produced
#[test]
fn end_tactic_closes_produced_goals() {
    let mut registry = base_registry();
    let mut session = start(&registry, "ended", &["(-> A A)"]);
    session.set_end_tactic(Arc::new(Assumption));
    session.apply_ended(&Intro("h".to_string())).expect("intro");
    assert_eq!(session.open_goal_count(), 0);
    session.save(&mut registry, Opacity::Transparent).expect("save");
    assert!(registry.is_declared("ended"));
}

/// A failing end tactic leaves the produced goal open
#[test]
fn failing_end_tactic_is_tolerated() {
    let registry = base_registry();
    let mut session = start(&registry, "ended", &["(-> A B)"]);
    session.set_end_tactic(Arc::new(Assumption));
    session.apply_ended(&Intro("h".to_string())).expect("intro");
    assert_eq!(session.open_goal_count(), 1);
}

// =============================================================================
// DEPENDENT GOALS, SECTIONS AND ENVIRONMENT UPDATES
// =============================================================================

/// Later goals may mention the solutions of earlier ones
#[test]
fn dependent_goals_see_earlier_solutions() {
    let mut registry = base_registry();
    let telescope = vec![InitialGoal::new(term("Prop")), InitialGoal::new(term("(? 0)")).named("witness")];
    let mut session =
        ProofSession::start_dependent(&registry, "prop", false, ProofInfo::new(DeclKind::Definition), telescope)
            .expect("well-formed telescope");
    session.apply(&Exact(term("A"))).expect("A : Prop");
    let goals: Vec<String> = session.goals().iter().map(|g| g.to_string()).collect();
    assert_eq!(goals, vec!["|- A"]);
    session.apply(&Exact(term("a"))).expect("a : A");
    let refs = session.save(&mut registry, Opacity::Transparent).expect("save");
    let names: Vec<&str> = refs.iter().map(|r| r.name()).collect();
    assert_eq!(names, vec!["prop", "witness"]);
}

/// Admitting a telescope with an unsolved earlier goal states the later
/// goal in terms of the earlier assumption
#[test]
fn admitted_dependent_goals_mention_earlier_assumptions() {
    let mut registry = base_registry();
    let telescope = vec![InitialGoal::new(term("Prop")), InitialGoal::new(term("(? 0)")).named("witness")];
    let session =
        ProofSession::start_dependent(&registry, "prop", false, ProofInfo::new(DeclKind::Definition), telescope)
            .expect("well-formed telescope");
    let refs = session.save_admitted(&mut registry).expect("open goals may be admitted");
    let names: Vec<&str> = refs.iter().map(|r| r.name()).collect();
    assert_eq!(names, vec!["prop", "witness"]);
    let ty = registry.definition("witness").map(|d| d.ty.clone());
    assert_eq!(ty, Some(term("prop")));

    // a solved earlier goal is substituted as usual
    let telescope = vec![InitialGoal::new(term("Prop")), InitialGoal::new(term("(? 0)")).named("witness2")];
    let mut session =
        ProofSession::start_dependent(&registry, "prop2", false, ProofInfo::new(DeclKind::Definition), telescope)
            .expect("well-formed telescope");
    session.apply(&Exact(term("A"))).expect("A : Prop");
    session.save_admitted(&mut registry).expect("admit");
    let ty = registry.definition("witness2").map(|d| d.ty.clone());
    assert_eq!(ty, Some(term("A")));
}

/// A goal cannot mention itself or later goals
#[test]
fn forward_references_are_malformed() {
    let registry = base_registry();
    let telescope = vec![InitialGoal::new(term("(? 1)")), InitialGoal::new(term("Prop"))];
    let result = ProofSession::start_dependent(&registry, "bad", false, ProofInfo::default(), telescope);
    assert!(matches!(result, Err(DeclareError::MalformedGoal { .. })));
}

/// Section variables used by a proof must be declared
#[test]
fn undeclared_section_variables_are_rejected() {
    let mut registry = base_registry();
    declare_assumption(&mut registry, "x", Scope::Discharge, term("A"), UniverseContext::new()).expect("x : A");
    assert_eq!(registry.section_variables(), ["x".to_string()]);

    let mut session = start(&registry, "uses_x", &["A"]);
    let closure = session.set_used_variables(&registry, &[]).expect("empty list");
    assert!(closure.is_empty());
    session.apply(&Exact(term("x"))).expect("x : A");
    let result = session.close(Opacity::Opaque);
    assert!(matches!(result, Err(DeclareError::SectionClosure(_))), "{:?}", result);

    let mut session = start(&registry, "uses_x", &["A"]);
    session
        .set_used_variables(&registry, &["x".to_string()])
        .expect("x is a section variable");
    session.apply(&Exact(term("x"))).expect("x : A");
    session.save(&mut registry, Opacity::Opaque).expect("x was declared");

    let mut session = start(&registry, "other", &["A"]);
    let result = session.set_used_variables(&registry, &["a".to_string()]);
    assert!(matches!(result, Err(DeclareError::UnknownSectionVariable(ref n)) if n == "a"));
}

/// Refreshing the environment makes later declarations visible
#[test]
fn update_global_env_sees_new_declarations() {
    let mut registry = base_registry();
    let mut session = start(&registry, "late", &["B"]);
    assume(&mut registry, "b", "B");
    assert!(session.apply(&Exact(term("b"))).is_err(), "b is not visible yet");
    session.update_global_env(&registry).expect("refresh");
    session.apply(&Exact(term("b"))).expect("b is visible now");
    session.save(&mut registry, Opacity::Opaque).expect("save");
}

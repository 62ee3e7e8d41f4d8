//! Program-mode obligations: ordering, automatic resolution, interactive
//! obligation proofs and final registration.

use declare::obligations::{
    abandon, add_program, admit_obligations, declare_obligation, next_obligation, progress, resolve, resolver_fn,
    save_obligation, solve_all, NoResolver, ObligationId, ObligationStatus, TacticResolver,
};
use declare::proof::Exact;
use declare::{
    declare_assumption, DeclKind, DeclareError, Hole, Hook, Obligation, Opacity, ProgramInfo, ProgramTable, Progress,
    Registry, Scope,
};
use kernel::checker::Env;
use kernel::parser::parse_term;
use kernel::universe::{UnivConstraint, UniverseContext};
use kernel::Term;
use std::sync::{Arc, Mutex};

fn term(src: &str) -> Arc<Term> {
    parse_term(src).expect("test term should parse")
}

/// A, B, C : Prop with witnesses a, b, c
fn base_registry() -> Registry {
    let mut registry = Registry::new();
    for (name, ty) in [
        ("A", "Prop"),
        ("B", "Prop"),
        ("C", "Prop"),
        ("a", "A"),
        ("b", "B"),
        ("c", "C"),
    ] {
        declare_assumption(&mut registry, name, Scope::Global, term(ty), UniverseContext::new())
            .expect("base declarations are well-typed");
    }
    registry
}

/// p : C := ?2 with obligations A, B after A, C after A and B
fn chain_holes() -> Vec<Hole> {
    vec![
        Hole::new(term("A")),
        Hole::new(term("B")).depends_on([0]),
        Hole::new(term("C")).depends_on([0, 1]),
    ]
}

fn add_chain(registry: &mut Registry, table: &mut ProgramTable) -> Progress {
    add_program(
        registry,
        table,
        "p",
        ProgramInfo::default(),
        term("C"),
        term("(? 2)"),
        UniverseContext::new(),
        chain_holes(),
        &mut NoResolver,
    )
    .expect("well-formed program")
}

/// Answers every obligation of type X with the lowercase witness x.
fn witness(_env: &Env, _obligation: &Obligation, statement: &Arc<Term>) -> Option<Arc<Term>> {
    Some(Term::constant(statement.to_string().to_lowercase()))
}

// =============================================================================
// ORDERING
// =============================================================================

/// A, B{A}, C{A,B}: each solution lowers the count, the last one defines p
#[test]
fn chained_obligations_in_order() {
    let mut registry = base_registry();
    let mut table = ProgramTable::new();
    assert_eq!(add_chain(&mut registry, &mut table), Progress::Remain(3));

    for (id, body, expected) in [(0, "a", Progress::Remain(2)), (1, "b", Progress::Remain(1))] {
        let program = table.get_mut("p").expect("p is open");
        let (defined, obligation) =
            declare_obligation(&mut registry, program, ObligationId(id), UniverseContext::new(), term(body))
                .expect("dependencies are solved");
        assert!(defined);
        assert!(obligation.is_solved());
        assert_eq!(progress(&mut registry, &mut table, "p").expect("progress"), expected);
    }

    let program = table.get_mut("p").expect("p is open");
    declare_obligation(&mut registry, program, ObligationId(2), UniverseContext::new(), term("c")).expect("last");
    match progress(&mut registry, &mut table, "p").expect("progress") {
        Progress::Defined(reference) => assert_eq!(reference.name(), "p"),
        other => panic!("expected p to be defined, got {:?}", other),
    }
    assert!(!table.contains("p"), "defined programs leave the table");
    let value = registry.definition("p").and_then(|d| d.value.clone()).expect("body");
    insta::assert_snapshot!(value.to_string(), @"p_obligation_3");
}

/// Solving C while B is open is rejected and changes nothing
#[test]
fn out_of_order_solutions_are_rejected() {
    let mut registry = base_registry();
    let mut table = ProgramTable::new();
    add_chain(&mut registry, &mut table);
    let program = table.get_mut("p").expect("p is open");
    declare_obligation(&mut registry, program, ObligationId(0), UniverseContext::new(), term("a")).expect("A first");

    let result = declare_obligation(&mut registry, program, ObligationId(2), UniverseContext::new(), term("c"));
    match result {
        Err(err @ DeclareError::UnresolvedObligationDependency { .. }) => {
            assert!(err.is_internal());
            insta::assert_snapshot!(err.to_string(), @"obligation p_obligation_3 of p depends on unsolved obligations: p_obligation_2");
        }
        other => panic!("expected a dependency error, got {:?}", other.map(|(d, _)| d)),
    }
    assert_eq!(program.remaining, 2);
    assert!(!program.obligations[2].is_solved());
    assert!(!registry.is_declared("p_obligation_3"));
}

/// Obligations cannot be solved twice, and ill-typed answers are rejected
#[test]
fn solutions_are_checked() {
    let mut registry = base_registry();
    let mut table = ProgramTable::new();
    add_chain(&mut registry, &mut table);
    let program = table.get_mut("p").expect("p is open");

    let result = declare_obligation(&mut registry, program, ObligationId(0), UniverseContext::new(), term("b"));
    assert!(matches!(result, Err(DeclareError::Type(_))), "b does not prove A");
    assert_eq!(program.remaining, 3);

    declare_obligation(&mut registry, program, ObligationId(0), UniverseContext::new(), term("a")).expect("a proves A");
    let result = declare_obligation(&mut registry, program, ObligationId(0), UniverseContext::new(), term("a"));
    assert!(matches!(result, Err(DeclareError::ObligationAlreadySolved(_))));
    assert_eq!(program.remaining, 2);
}

// =============================================================================
// AUTOMATIC RESOLUTION
// =============================================================================

/// With a resolver that always succeeds, an N-obligation chain is defined
/// within N rounds
#[test]
fn dag_resolves_within_n_rounds() {
    let mut registry = base_registry();
    let mut table = ProgramTable::new();
    let n = 4;
    let holes = (0..n)
        .map(|i| {
            let hole = Hole::new(term("A"));
            if i == 0 {
                hole
            } else {
                hole.depends_on([i - 1])
            }
        })
        .collect();
    let mut resolver = resolver_fn(witness);
    let mut rounds = 1;
    let mut state = add_program(
        &mut registry,
        &mut table,
        "chain",
        ProgramInfo::default(),
        term("A"),
        term(&format!("(? {})", n - 1)),
        UniverseContext::new(),
        holes,
        &mut resolver,
    )
    .expect("well-formed program");
    assert_eq!(state, Progress::Remain(n - 1), "one obligation per round");
    while let Progress::Remain(_) = state {
        rounds += 1;
        state = resolve(&mut registry, &mut table, "chain", &mut resolver).expect("round");
    }
    assert!(matches!(state, Progress::Defined(_)));
    assert!(rounds <= n, "took {} rounds", rounds);
}

/// solve_all keeps going until the program is defined
#[test]
fn solve_all_finishes_the_chain() {
    let mut registry = base_registry();
    let mut table = ProgramTable::new();
    add_chain(&mut registry, &mut table);
    let state = solve_all(&mut registry, &mut table, "p", &mut resolver_fn(witness)).expect("solve");
    assert!(matches!(state, Progress::Defined(_)), "{:?}", state);
    assert!(registry.is_declared("p"));
}

/// Answers the kernel rejects are failed attempts, not errors
#[test]
fn rejected_answers_leave_obligations_open() {
    let mut registry = base_registry();
    let mut table = ProgramTable::new();
    add_chain(&mut registry, &mut table);
    let mut wrong = resolver_fn(|_: &Env, _: &Obligation, _: &Arc<Term>| Some(Term::constant("b")));
    let state = resolve(&mut registry, &mut table, "p", &mut wrong).expect("a stalled round is not an error");
    assert_eq!(state, Progress::Remain(3));
    assert!(!registry.is_declared("p_obligation_1"));
}

/// A failed obligation is not offered again by later rounds; solve_all
/// retries it
#[test]
fn failed_obligations_wait_for_solve_all() {
    let mut registry = base_registry();
    let mut table = ProgramTable::new();
    add_chain(&mut registry, &mut table);
    let offered = Arc::new(Mutex::new(Vec::new()));
    let mut wrong = {
        let offered = offered.clone();
        resolver_fn(move |_: &Env, obligation: &Obligation, _: &Arc<Term>| {
            offered.lock().expect("offered lock").push(obligation.name.clone());
            Some(Term::constant("b"))
        })
    };
    resolve(&mut registry, &mut table, "p", &mut wrong).expect("first round");
    assert!(table.get("p").map(|p| p.obligations[0].attempted).unwrap_or(false));
    let state = resolve(&mut registry, &mut table, "p", &mut wrong).expect("second round");
    assert_eq!(state, Progress::Remain(3));
    assert_eq!(*offered.lock().expect("offered lock"), vec!["p_obligation_1".to_string()]);

    let state = solve_all(&mut registry, &mut table, "p", &mut resolver_fn(witness)).expect("solve");
    assert!(matches!(state, Progress::Defined(_)), "{:?}", state);
}

/// Expanded obligations are substituted in place
#[test]
fn expanded_obligations_are_inlined() {
    let mut registry = base_registry();
    let mut table = ProgramTable::new();
    let holes = vec![Hole::new(term("A")).with_status(ObligationStatus::Expand)];
    let state = add_program(
        &mut registry,
        &mut table,
        "inline",
        ProgramInfo::default(),
        term("A"),
        term("(? 0)"),
        UniverseContext::new(),
        holes,
        &mut resolver_fn(witness),
    )
    .expect("add");
    assert!(matches!(state, Progress::Defined(_)));
    assert!(!registry.is_declared("inline_obligation_1"));
    let value = registry.definition("inline").and_then(|d| d.value.clone()).expect("body");
    insta::assert_snapshot!(value.to_string(), @"a");
}

/// An expanded solution with inconsistent universes is refused and leaves
/// the program untouched
#[test]
fn expanded_solutions_validate_universes() {
    let mut registry = base_registry();
    let mut table = ProgramTable::new();
    let holes = vec![Hole::new(term("A")).with_status(ObligationStatus::Expand)];
    add_program(
        &mut registry,
        &mut table,
        "inline",
        ProgramInfo::default(),
        term("A"),
        term("(? 0)"),
        UniverseContext::new(),
        holes,
        &mut NoResolver,
    )
    .expect("add");
    let cyclic = UniverseContext::new()
        .with_var("u")
        .with_var("v")
        .with_constraint(UnivConstraint::lt("u", "v"))
        .with_constraint(UnivConstraint::lt("v", "u"));
    let program = table.get_mut("inline").expect("inline is open");
    let result = declare_obligation(&mut registry, program, ObligationId(0), cyclic, term("a"));
    assert!(matches!(result, Err(DeclareError::UniverseInconsistency(_))), "{:?}", result.map(|_| ()));
    let program = table.get("inline").expect("still open");
    assert_eq!(program.remaining, 1);
    assert!(program.universes.vars.is_empty(), "nothing was merged");
}

/// Holes carrying a tactic are solved by running it
#[test]
fn tactic_resolver_runs_hole_tactics() {
    let mut registry = base_registry();
    let mut table = ProgramTable::new();
    let holes = vec![
        Hole::new(term("A")).with_tactic(Arc::new(Exact(term("a")))),
        Hole::new(term("B")),
    ];
    let mut resolver = TacticResolver::default();
    let state = add_program(
        &mut registry,
        &mut table,
        "tac",
        ProgramInfo::default(),
        term("A"),
        term("(? 0)"),
        UniverseContext::new(),
        holes,
        &mut resolver,
    )
    .expect("add");
    assert_eq!(state, Progress::Remain(1), "B has no tactic and no default");

    let mut resolver = TacticResolver::new(Some(Arc::new(Exact(term("b")))));
    let state = resolve(&mut registry, &mut table, "tac", &mut resolver).expect("round");
    assert!(matches!(state, Progress::Defined(_)));
}

// =============================================================================
// PROGRAMS
// =============================================================================

/// Programs without holes are defined right away; names are unique
#[test]
fn programs_share_the_namespace() {
    let mut registry = base_registry();
    let mut table = ProgramTable::new();
    let state = add_program(
        &mut registry,
        &mut table,
        "plain",
        ProgramInfo::default(),
        term("A"),
        term("a"),
        UniverseContext::new(),
        Vec::new(),
        &mut NoResolver,
    )
    .expect("add");
    assert!(matches!(state, Progress::Defined(_)));

    add_chain(&mut registry, &mut table);
    for name in ["plain", "p"] {
        let result = add_program(
            &mut registry,
            &mut table,
            name,
            ProgramInfo::default(),
            term("A"),
            term("a"),
            UniverseContext::new(),
            Vec::new(),
            &mut NoResolver,
        );
        assert!(matches!(result, Err(DeclareError::DuplicateName(_))), "{} is taken", name);
    }
}

/// Holes referring to missing obligations are rejected up front
#[test]
fn invalid_holes_are_rejected() {
    let mut registry = base_registry();
    let mut table = ProgramTable::new();
    let result = add_program(
        &mut registry,
        &mut table,
        "bad",
        ProgramInfo::default(),
        term("A"),
        term("(? 1)"),
        UniverseContext::new(),
        vec![Hole::new(term("A"))],
        &mut NoResolver,
    );
    assert!(matches!(result, Err(DeclareError::InvalidHole { .. })));
    assert!(!table.contains("bad"));
}

/// The hook sees the obligations the program was built from
#[test]
fn program_hook_receives_obligations() {
    let mut registry = base_registry();
    let mut table = ProgramTable::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let hook = {
        let seen = seen.clone();
        Hook::new(move |snapshot| {
            let mut seen = seen.lock().expect("hook lock");
            seen.extend(snapshot.obligations.iter().map(|(name, t)| format!("{} := {}", name, t)));
            Ok(())
        })
    };
    let state = add_program(
        &mut registry,
        &mut table,
        "hooked",
        ProgramInfo::default().with_hook(hook),
        term("A"),
        term("(? 0)"),
        UniverseContext::new(),
        vec![Hole::new(term("A"))],
        &mut resolver_fn(witness),
    )
    .expect("add");
    assert!(matches!(state, Progress::Defined(_)));
    assert_eq!(
        *seen.lock().expect("hook lock"),
        vec!["hooked_obligation_1 := hooked_obligation_1".to_string()]
    );
}

/// Mutual programs are registered together once all of them are complete
#[test]
fn mutual_programs_finalize_together() {
    let mut registry = base_registry();
    let mut table = ProgramTable::new();
    let state = add_program(
        &mut registry,
        &mut table,
        "even",
        ProgramInfo::default().with_mutual(vec!["odd".to_string()]),
        term("B"),
        term("b"),
        UniverseContext::new(),
        Vec::new(),
        &mut NoResolver,
    )
    .expect("add even");
    assert_eq!(state, Progress::Dependent);
    assert!(!registry.is_declared("even"));

    let state = add_program(
        &mut registry,
        &mut table,
        "odd",
        ProgramInfo::default().with_mutual(vec!["even".to_string()]),
        term("A"),
        term("(? 0)"),
        UniverseContext::new(),
        vec![Hole::new(term("A"))],
        &mut NoResolver,
    )
    .expect("add odd");
    assert_eq!(state, Progress::Remain(1));

    let program = table.get_mut("odd").expect("odd is open");
    declare_obligation(&mut registry, program, ObligationId(0), UniverseContext::new(), term("a")).expect("solve");
    let state = progress(&mut registry, &mut table, "odd").expect("progress");
    assert!(matches!(state, Progress::Defined(ref r) if r.name() == "odd"));
    assert!(registry.is_declared("even"));
    assert!(table.is_empty());
}

/// Abandoned programs register nothing
#[test]
fn abandon_drops_the_program() {
    let mut registry = base_registry();
    let mut table = ProgramTable::new();
    add_chain(&mut registry, &mut table);
    let program = abandon(&mut table, "p").expect("p exists");
    assert_eq!(program.remaining, 3);
    assert!(!registry.is_declared("p"));
    assert!(matches!(abandon(&mut table, "p"), Err(DeclareError::UnknownProgram(_))));
}

/// Abandoning a mutual partner releases the rest of the group
#[test]
fn abandoned_partners_release_the_group() {
    let mut registry = base_registry();
    let mut table = ProgramTable::new();
    for (name, partner, ty, body, holes) in [
        ("even", "odd", "B", "b", Vec::new()),
        ("odd", "even", "A", "(? 0)", vec![Hole::new(term("A"))]),
    ] {
        add_program(
            &mut registry,
            &mut table,
            name,
            ProgramInfo::default().with_mutual(vec![partner.to_string()]),
            term(ty),
            term(body),
            UniverseContext::new(),
            holes,
            &mut NoResolver,
        )
        .expect("well-formed program");
    }
    assert_eq!(progress(&mut registry, &mut table, "even").expect("even"), Progress::Dependent);

    abandon(&mut table, "odd").expect("odd exists");
    assert_eq!(table.get("even").map(|p| p.info.mutual.len()), Some(0));
    let state = progress(&mut registry, &mut table, "even").expect("even stands alone");
    assert!(matches!(state, Progress::Defined(ref r) if r.name() == "even"), "{:?}", state);
    assert!(!registry.is_declared("odd"));
    assert!(table.is_empty());
}

// =============================================================================
// INTERACTIVE OBLIGATIONS
// =============================================================================

/// next_obligation opens the first eligible obligation; saving it feeds the
/// program
#[test]
fn obligations_are_proved_interactively() {
    let mut registry = base_registry();
    let mut table = ProgramTable::new();
    add_chain(&mut registry, &mut table);

    let mut session = next_obligation(&registry, &table, None).expect("p is the only open program");
    assert_eq!(session.name(), "p_obligation_1");
    assert_eq!(session.info().kind, DeclKind::Lemma);
    session.apply(&Exact(term("a"))).expect("a proves A");
    let state = save_obligation(&mut registry, &mut table, session).expect("save");
    assert_eq!(state, Progress::Remain(2));
    assert!(registry.is_declared("p_obligation_1"));

    let session = next_obligation(&registry, &table, Some("p")).expect("B is next");
    assert_eq!(session.name(), "p_obligation_2");
    let result = session.save(&mut registry, Opacity::Opaque);
    assert!(
        matches!(result, Err(ref err) if matches!(err.error, DeclareError::WrongProofEnding(_))),
        "obligation proofs end with save_obligation"
    );
}

/// Without a name, the open program must be unique
#[test]
fn ambiguous_programs_need_a_name() {
    let mut registry = base_registry();
    let mut table = ProgramTable::new();
    add_chain(&mut registry, &mut table);
    add_program(
        &mut registry,
        &mut table,
        "q",
        ProgramInfo::default(),
        term("A"),
        term("(? 0)"),
        UniverseContext::new(),
        vec![Hole::new(term("A"))],
        &mut NoResolver,
    )
    .expect("add q");

    match next_obligation(&registry, &table, None) {
        Err(err @ DeclareError::AmbiguousActiveProgram(_)) => {
            insta::assert_snapshot!(err.to_string(), @"more than one program with unsolved obligations: p, q");
        }
        other => panic!("expected ambiguity, got {:?}", other.map(|s| s.name().to_string())),
    }
    assert!(next_obligation(&registry, &table, Some("q")).is_ok());
}

/// Admitting obligations assumes them in dependency order and defines the
/// program
#[test]
fn admitted_obligations_become_assumptions() {
    let mut registry = base_registry();
    let mut table = ProgramTable::new();
    add_chain(&mut registry, &mut table);
    let state = admit_obligations(&mut registry, &mut table, None).expect("admit");
    assert!(matches!(state, Progress::Defined(_)));
    for i in 1..=3 {
        let name = format!("p_obligation_{}", i);
        assert_eq!(registry.kind_of(&name), Some(DeclKind::Assumption), "{}", name);
    }
    let axioms = registry.assumptions_of("p").expect("p is registered");
    assert!(axioms.contains(&"p_obligation_3".to_string()), "{:?}", axioms);
}

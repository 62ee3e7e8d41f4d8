//! The registry: unique names, atomic commits, side effects, universes and
//! one-go declarations.

use declare::diagnostics::DiagnosticCollector;
use declare::{
    declare_assumption, declare_definition, declare_mutual, DeclBody, DeclGroup, DeclKind, Declaration, DeclareError,
    ProgramInfo, ProofEntry, Registry, Scope,
};
use kernel::ast::{Definition, MetaId};
use kernel::parser::parse_term;
use kernel::universe::{UnivConstraint, UniverseContext};
use kernel::Term;
use std::sync::Arc;

fn term(src: &str) -> Arc<Term> {
    parse_term(src).expect("test term should parse")
}

fn base_registry() -> Registry {
    let mut registry = Registry::new();
    for (name, ty) in [("A", "Prop"), ("B", "Prop"), ("a", "A"), ("h", "(-> A B)")] {
        declare_assumption(&mut registry, name, Scope::Global, term(ty), UniverseContext::new())
            .expect("base declarations are well-typed");
    }
    registry
}

fn define(registry: &mut Registry, name: &str, ty: &str, body: &str) -> declare::Result<declare::GlobalRef> {
    declare_definition(
        registry,
        name,
        ProgramInfo::default(),
        Some(term(ty)),
        term(body),
        UniverseContext::new(),
        Vec::new(),
    )
}

// =============================================================================
// NAMES
// =============================================================================

/// foo twice is a duplicate; foo then bar is fine
#[test]
fn names_are_unique() {
    let mut registry = base_registry();
    let foo = define(&mut registry, "foo", "A", "a").expect("foo");
    let bar = define(&mut registry, "bar", "A", "foo").expect("bar");
    assert!(foo.serial() < bar.serial());

    let result = define(&mut registry, "foo", "A", "a");
    match result {
        Err(err @ DeclareError::DuplicateName(_)) => {
            insta::assert_snapshot!(err.to_string(), @"foo already exists");
        }
        other => panic!("expected a duplicate, got {:?}", other),
    }
}

/// A rejected declaration leaves no trace
#[test]
fn rejected_declarations_change_nothing() {
    let mut registry = base_registry();
    let before = registry.env().len();
    let result = define(&mut registry, "wrong", "B", "a");
    assert!(matches!(result, Err(DeclareError::Type(_))), "a does not prove B");
    assert!(!registry.is_declared("wrong"));
    assert_eq!(registry.env().len(), before);
}

/// Leftover holes and metavariables are unresolved existentials
#[test]
fn definitions_must_be_closed() {
    let mut registry = base_registry();
    let result = declare_definition(
        &mut registry,
        "holey",
        ProgramInfo::default(),
        None,
        term("(? 0)"),
        UniverseContext::new(),
        vec![MetaId(3)],
    );
    match result {
        Err(err @ DeclareError::UnresolvedExistential { .. }) => {
            insta::assert_snapshot!(err.to_string(), @"holey has unresolved existential variables: ?0, ?3");
        }
        other => panic!("expected unresolved existentials, got {:?}", other),
    }
}

/// Missing types are inferred
#[test]
fn types_are_inferred() {
    let mut registry = base_registry();
    declare_definition(
        &mut registry,
        "b",
        ProgramInfo::default(),
        None,
        term("(app h a)"),
        UniverseContext::new(),
        Vec::new(),
    )
    .expect("h a : B");
    let ty = registry.definition("b").map(|d| d.ty.to_string()).expect("registered");
    assert_eq!(ty, "B");
}

// =============================================================================
// SIDE EFFECTS
// =============================================================================

/// Side effects are registered before the entry; an identical one already
/// present is skipped, a different one is a duplicate
#[test]
fn side_effects_are_staged_first() {
    let mut registry = base_registry();
    let aux = Definition::theorem("aux".to_string(), term("A"), term("a"));
    let entry = ProofEntry::new(term("aux"))
        .with_type(term("A"))
        .with_side_effects(vec![aux.clone()]);
    let reference = registry
        .register("main", Scope::Global, DeclKind::Theorem, UniverseContext::new(), Vec::new(), entry, None)
        .expect("aux is visible to main");
    let aux_ref = registry.lookup("aux").expect("side effect registered");
    assert!(aux_ref.serial() < reference.serial());

    let again = ProofEntry::new(term("aux"))
        .with_type(term("A"))
        .with_side_effects(vec![aux]);
    registry
        .register("main2", Scope::Global, DeclKind::Theorem, UniverseContext::new(), Vec::new(), again, None)
        .expect("identical side effects are merged once");

    let conflicting = Definition::theorem("aux".to_string(), term("(-> A A)"), term("(lam A 0)"));
    let clash = ProofEntry::new(term("a"))
        .with_type(term("A"))
        .with_side_effects(vec![conflicting]);
    let result = registry.register("main3", Scope::Global, DeclKind::Theorem, UniverseContext::new(), Vec::new(), clash, None);
    assert!(matches!(result, Err(DeclareError::DuplicateName(ref n)) if n == "aux"));
    assert!(!registry.is_declared("main3"));
}

// =============================================================================
// UNIVERSES
// =============================================================================

/// Contradicting constraints are rejected at registration
#[test]
fn inconsistent_universes_are_rejected() {
    let mut registry = base_registry();
    let forward = UniverseContext::new()
        .with_var("u")
        .with_var("v")
        .with_constraint(UnivConstraint::lt("u", "v"));
    declare_assumption(&mut registry, "C", Scope::Global, term("Prop"), forward).expect("u < v");

    let backward = UniverseContext::new()
        .with_var("u")
        .with_var("v")
        .with_constraint(UnivConstraint::le("v", "u"));
    let result = declare_assumption(&mut registry, "D", Scope::Global, term("Prop"), backward.clone());
    assert!(matches!(result, Err(DeclareError::UniverseInconsistency(_))), "{:?}", result);
    assert!(!registry.is_declared("D"));
    assert!(registry.validate_universes(&backward).is_err());
}

/// Universe-polymorphic definitions carry their parameters
#[test]
fn polymorphic_definitions_take_levels() {
    let mut registry = Registry::new();
    let udecl = UniverseContext::new().with_var("u");
    declare_definition(
        &mut registry,
        "id",
        ProgramInfo::default().polymorphic(true),
        Some(term("(pi (sort u) (pi 0 1))")),
        term("(lam (sort u) (lam 0 0))"),
        udecl,
        Vec::new(),
    )
    .expect("polymorphic identity");
    let params = registry.definition("id").map(|d| d.univ_params.clone()).expect("registered");
    assert_eq!(params, vec!["u".to_string()]);
    assert!(registry.universes().vars().is_empty(), "polymorphic levels stay local");
}

// =============================================================================
// GROUPS
// =============================================================================

/// Mutual definitions see each other and are registered together
#[test]
fn mutual_definitions_are_atomic() {
    let mut registry = base_registry();
    let refs = declare_mutual(
        &mut registry,
        ProgramInfo::default(),
        vec![
            ("left".to_string(), term("B"), term("(app h right)")),
            ("right".to_string(), term("A"), term("a")),
        ],
        UniverseContext::new(),
    )
    .expect("each body checks with both types in scope");
    assert_eq!(refs.len(), 2);

    let result = declare_mutual(
        &mut registry,
        ProgramInfo::default(),
        vec![
            ("fine".to_string(), term("A"), term("a")),
            ("broken".to_string(), term("A"), term("(app h a)")),
        ],
        UniverseContext::new(),
    );
    assert!(matches!(result, Err(DeclareError::Type(_))));
    assert!(!registry.is_declared("fine"), "no member of a failed group is registered");
}

/// Sequential groups register in order; later members see earlier ones
#[test]
fn sequential_groups_see_earlier_members() {
    let mut registry = base_registry();
    let group = DeclGroup::new(Scope::Local)
        .with_decl(Declaration::new(
            "first",
            DeclKind::Definition,
            DeclBody::Defined(ProofEntry::new(term("a")).with_type(term("A"))),
        ))
        .with_decl(Declaration::new(
            "second",
            DeclKind::Definition,
            DeclBody::Defined(ProofEntry::new(term("(app h first)"))),
        ));
    let refs = registry.register_group(group).expect("sequential");
    assert_eq!(refs.iter().map(|r| r.name()).collect::<Vec<_>>(), vec!["first", "second"]);
    assert_eq!(registry.scope_of("second"), Some(Scope::Local));
}

// =============================================================================
// BOOKKEEPING
// =============================================================================

/// Registration reports what happened
#[test]
fn registration_emits_diagnostics() {
    let collector = DiagnosticCollector::new();
    let mut registry = Registry::new().with_diagnostics(collector.clone());
    declare_assumption(&mut registry, "A", Scope::Global, term("Prop"), UniverseContext::new()).expect("A");
    define(&mut registry, "T", "Prop", "A").expect("T");
    let messages: Vec<String> = collector.take().into_iter().map(|d| d.to_string()).collect();
    insta::assert_debug_snapshot!(messages, @r###"
    [
        "Info: A is assumed",
        "Info: T is defined",
    ]
    "###);
    assert!(!collector.has_warnings());
}

/// Axiom dependencies are tracked transitively
#[test]
fn assumptions_are_tracked() {
    let mut registry = base_registry();
    define(&mut registry, "b", "B", "(app h a)").expect("b");
    define(&mut registry, "b2", "B", "b").expect("b2");
    let mut axioms = registry.assumptions_of("b2").expect("registered");
    axioms.sort();
    assert_eq!(axioms, vec!["B", "a", "h"]);
    assert!(registry.assumptions_of("missing").is_err());
}

/// Implicit arguments are recorded per name
#[test]
fn implicit_arguments_are_recorded() {
    let mut registry = base_registry();
    declare_definition(
        &mut registry,
        "idA",
        ProgramInfo::default().with_impargs(vec![0]),
        Some(term("(-> A A)")),
        term("(lam A 0)"),
        UniverseContext::new(),
        Vec::new(),
    )
    .expect("idA");
    assert_eq!(registry.impargs_of("idA"), &[0]);
    assert!(registry.impargs_of("a").is_empty());
}

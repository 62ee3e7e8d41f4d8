//! Declarations made in one go, without an interactive proof.

use crate::entry::{DeclBody, DeclGroup, Declaration, GlobalRef, ProofEntry, Scope};
use crate::error::{DeclareError, Result};
use crate::obligations::ProgramInfo;
use crate::registry::Registry;
use kernel::ast::{MetaId, Term};
use kernel::universe::UniverseContext;
use std::sync::Arc;

/// Declare an elaborated definition. `holes` are the metavariables the
/// elaborator could not solve; any of them, or any metavariable left in the
/// terms, is an error.
pub fn declare_definition(
    registry: &mut Registry,
    name: &str,
    info: ProgramInfo,
    ty: Option<Arc<Term>>,
    body: Arc<Term>,
    universes: UniverseContext,
    holes: Vec<MetaId>,
) -> Result<GlobalRef> {
    let mut metas = body.metas();
    if let Some(ty) = &ty {
        ty.collect_metas(&mut metas);
    }
    metas.extend(holes);
    if !metas.is_empty() {
        return Err(DeclareError::UnresolvedExistential {
            name: name.to_string(),
            metas: metas.into_iter().collect(),
        });
    }
    let ProgramInfo {
        polymorphic,
        opaque,
        scope,
        kind,
        hook,
        impargs,
        ..
    } = info;
    let mut entry = ProofEntry::new(body).opaque(opaque);
    if let Some(ty) = ty {
        entry = entry.with_type(ty);
    }
    let decl = Declaration::new(name, kind, DeclBody::Defined(entry))
        .with_impargs(impargs)
        .with_hook(hook);
    let group = DeclGroup::new(scope)
        .with_universes(universes)
        .polymorphic(polymorphic)
        .with_decl(decl);
    registry
        .register_group(group)?
        .pop()
        .ok_or_else(|| DeclareError::DuplicateName(name.to_string()))
}

pub fn declare_assumption(
    registry: &mut Registry,
    name: &str,
    scope: Scope,
    ty: Arc<Term>,
    universes: UniverseContext,
) -> Result<GlobalRef> {
    if let Some(meta) = ty.metas().into_iter().next() {
        return Err(DeclareError::UnresolvedExistential {
            name: name.to_string(),
            metas: vec![meta],
        });
    }
    registry.register_assumption(name, scope, ty, universes, None)
}

/// Declare mutually recursive definitions. Every body is checked with all
/// the members' types in scope; either all of them are registered or none.
/// The hook in `info` goes to the first member.
pub fn declare_mutual(
    registry: &mut Registry,
    info: ProgramInfo,
    defs: Vec<(String, Arc<Term>, Arc<Term>)>,
    universes: UniverseContext,
) -> Result<Vec<GlobalRef>> {
    let mut group = DeclGroup::new(info.scope)
        .with_universes(universes)
        .polymorphic(info.polymorphic)
        .mutual();
    let mut hook = info.hook;
    for (name, ty, body) in defs {
        let mut metas = ty.metas();
        body.collect_metas(&mut metas);
        if !metas.is_empty() {
            return Err(DeclareError::UnresolvedExistential {
                name,
                metas: metas.into_iter().collect(),
            });
        }
        let entry = ProofEntry::new(body).with_type(ty).opaque(info.opaque);
        group = group.with_decl(Declaration::new(name, info.kind, DeclBody::Defined(entry)).with_hook(hook.take()));
    }
    registry.register_group(group)
}

//! Callbacks fired once a declaration is registered.

use crate::entry::{GlobalRef, Scope};
use kernel::ast::Term;
use kernel::universe::UniverseContext;
use std::fmt;
use std::sync::Arc;

pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// What a hook gets to see about the declaration that was just registered.
#[derive(Debug, Clone)]
pub struct HookSnapshot {
    pub universes: UniverseContext,
    pub obligations: Vec<(String, Arc<Term>)>,
    pub scope: Scope,
    pub reference: GlobalRef,
}

type HookFn = Box<dyn FnOnce(&HookSnapshot) -> Result<(), HookError> + Send>;

/// A one-shot callback. It fires at most once, synchronously, after commit.
pub struct Hook(HookFn);

impl Hook {
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(&HookSnapshot) -> Result<(), HookError> + Send + 'static,
    {
        Hook(Box::new(f))
    }

    pub(crate) fn call(self, snapshot: &HookSnapshot) -> Result<(), HookError> {
        (self.0)(snapshot)
    }
}

impl fmt::Debug for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hook(..)")
    }
}

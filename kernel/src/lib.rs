pub mod ast;
pub mod checker;
pub mod parser;
pub mod universe;

pub use ast::*;
pub use checker::{Context, Env, TypeError};
pub use universe::{UnivConstraint, UniverseContext, UniverseError, UniverseGraph};

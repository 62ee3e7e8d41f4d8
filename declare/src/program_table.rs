//! Programs with unsolved obligations, by name.

use crate::error::{DeclareError, Result};
use crate::obligations::ObligationProgram;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct ProgramTable {
    programs: BTreeMap<String, ObligationProgram>,
}

impl ProgramTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, program: ObligationProgram) {
        self.programs.insert(program.name.clone(), program);
    }

    pub fn get(&self, name: &str) -> Option<&ObligationProgram> {
        self.programs.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ObligationProgram> {
        self.programs.get_mut(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<ObligationProgram> {
        self.programs.remove(name)
    }

    /// Remove `name` from every mutual group that lists it.
    pub fn detach(&mut self, name: &str) {
        for program in self.programs.values_mut() {
            program.info.mutual.retain(|m| m != name);
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.programs.contains_key(name)
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.programs.keys().map(String::as_str)
    }

    /// Programs that still have unsolved obligations, by name.
    pub fn open_programs(&self) -> impl Iterator<Item = &ObligationProgram> {
        self.programs.values().filter(|p| p.remaining > 0)
    }

    /// The program a command without an explicit target acts on: `name` if
    /// given, otherwise the only open program.
    pub fn unique_open(&self, name: Option<&str>) -> Result<&ObligationProgram> {
        if let Some(name) = name {
            return self
                .programs
                .get(name)
                .ok_or_else(|| DeclareError::UnknownProgram(name.to_string()));
        }
        let mut open = self.open_programs();
        match (open.next(), open.next()) {
            (None, _) => Err(DeclareError::NoActiveProgram),
            (Some(program), None) => Ok(program),
            (Some(_), Some(_)) => Err(DeclareError::AmbiguousActiveProgram(
                self.open_programs().map(|p| p.name.clone()).collect(),
            )),
        }
    }
}

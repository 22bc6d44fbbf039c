//! Compilation contract for executable artifacts.
//!
//! The hub never compiles source itself; a [`Compiler`] is injected into the
//! publish coordinator and called once per service in a package.

use async_trait::async_trait;
use std::fmt::{Display, Formatter};

/// Opaque compiled form of a service, persisted as a compiled unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutableUnit {
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub line: u32,
    pub column: u32,
    pub message: String,
}

impl Display for Diagnostic {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}: {}", self.line, self.column, self.message)
    }
}

/// An artifact the compiled service refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileDependency {
    /// Dotted full name, e.g. `sales.Entities.Invoice`.
    pub full_name: String,
    pub source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileRequest {
    /// Name the unit is stored and invalidated under (`app.Service`).
    pub unit_name: String,
    pub source: String,
    pub dependencies: Vec<CompileDependency>,
}

pub type CompileOutcome = Result<ExecutableUnit, Vec<Diagnostic>>;

#[async_trait]
pub trait Compiler: Send + Sync {
    async fn compile(&self, request: &CompileRequest) -> CompileOutcome;
}

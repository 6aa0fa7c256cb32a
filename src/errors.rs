// File: src/errors.rs
//
// Error surface of the interpreter. Diagnostics are printed to stderr at
// the point of failure (the compiler and VM own their own report formats);
// callers only see which class of failure occurred.

use std::fmt;

/// Outcome classes of `Vm::interpret`. Compile errors mean no code ran;
/// runtime errors mean execution halted partway with the stack reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterpretError {
    Compile,
    Runtime,
}

impl InterpretError {
    /// Conventional process exit codes: 65 for data errors, 70 for internal
    /// software errors.
    pub fn exit_code(self) -> i32 {
        match self {
            InterpretError::Compile => 65,
            InterpretError::Runtime => 70,
        }
    }
}

impl fmt::Display for InterpretError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            InterpretError::Compile => write!(f, "compile error"),
            InterpretError::Runtime => write!(f, "runtime error"),
        }
    }
}

impl std::error::Error for InterpretError {}

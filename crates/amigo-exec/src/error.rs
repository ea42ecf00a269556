use amigo_astructs::StructError;
use amigo_machine::{GuestMemoryError, Reg};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecError {
    #[error(transparent)]
    Struct(#[from] StructError),

    #[error(transparent)]
    Memory(#[from] GuestMemoryError),

    /// `Wait` was called between `Forbid` and the matching `Permit`.
    #[error("task {task} waited while task switching was forbidden")]
    WaitWhileForbidden { task: String },

    /// The task blocked with no other task left to wake it.
    #[error("task {task} is waiting but no other task can run")]
    Deadlock { task: String },

    #[error("task {task} panicked")]
    TaskPanicked { task: String },

    #[error("no exec function at library offset {offset}")]
    UnknownFunction { offset: i32 },

    /// Host-side setup ran out of guest memory.
    #[error("out of guest memory allocating {what}")]
    OutOfMemory { what: &'static str },

    /// A required pointer argument was null.
    #[error("{function} called with a null {reg}")]
    NullArgument { function: &'static str, reg: Reg },
}

pub type ExecResult<T> = Result<T, ExecError>;

use amigo_machine::GuestMemoryError;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructError {
    #[error(transparent)]
    Memory(#[from] GuestMemoryError),

    /// A view of one structure kind was stored through a pointer to another.
    #[error("pointer expects {expected} but got {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    /// The pointer owns an allocated referent; it must be freed before it can be re-targeted.
    #[error("pointer field {field} owns its referent and cannot be re-targeted")]
    PointerOwned { field: &'static str },

    /// `free` through a pointer field that did not allocate its referent.
    #[error("pointer field {field} did not allocate 0x{addr:08x} and cannot free it")]
    NotOwner { field: &'static str, addr: u32 },

    /// Block pointers can only address 4-byte aligned memory.
    #[error("address 0x{addr:08x} is not 4-byte aligned and cannot be stored as a block pointer")]
    Misaligned { addr: u32 },
}

pub type StructResult<T> = Result<T, StructError>;

/// Descriptor consistency problems reported by [`crate::StructDef::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LayoutError {
    #[error("{strukt}.{field} ends at {end} past the struct size {size}")]
    FieldOutOfBounds {
        strukt: &'static str,
        field: &'static str,
        end: u32,
        size: u32,
    },

    #[error("{strukt}.{first} overlaps {strukt}.{second}")]
    FieldOverlap {
        strukt: &'static str,
        first: &'static str,
        second: &'static str,
    },

    #[error("{strukt}.{field} is declared as an alias of unknown field {target}")]
    UnknownAlias {
        strukt: &'static str,
        field: &'static str,
        target: &'static str,
    },
}

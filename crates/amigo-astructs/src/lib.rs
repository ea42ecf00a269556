//! Typed, byte-exact views over big-endian guest memory.
//!
//! A [`StructDef`] describes a guest structure; a [`View`] binds one to an address (or a CPU
//! register) in a [`Space`]. Field handles ([`Scalar`], [`FlagField`], [`CStrField`],
//! [`PointerCell`]) decode and encode individual fields on every access, so host code and
//! emulated instructions always see the same bytes.

#![forbid(unsafe_code)]

mod cstr;
mod def;
mod error;
mod field;
mod pointer;
mod strukt;
mod view;

pub use cstr::CStrField;
pub use def::{FieldDef, FieldType, PtrEncoding, StructDef, LONG_CELL, VOID};
pub use error::{LayoutError, StructError, StructResult};
pub use field::{FlagField, Scalar, ScalarType};
pub use pointer::{
    block_to_direct, direct_to_block, Aptr, Block, Bptr, Direct, Encoding, PointerCell,
};
pub use strukt::{GuestStruct, Void};
pub use view::{Location, Space, View};

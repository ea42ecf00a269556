use std::fmt;

use amigo_machine::{cstring_len, Allocator, Hex, Reg};
use tracing::debug;

use crate::def::{FieldDef, FieldType, LONG_CELL, VALUE};
use crate::error::StructResult;
use crate::view::{Space, View};

/// A `char *` field.
pub struct CStrField<'a> {
    view: View<'a>,
    field: &'static FieldDef,
}

impl<'a> CStrField<'a> {
    pub(crate) fn new(view: View<'a>, field: &'static FieldDef) -> Self {
        assert!(
            matches!(field.ty, FieldType::CString | FieldType::U32),
            "{}.{} is not a string pointer",
            view.def().name,
            field.name
        );
        Self { view, field }
    }

    /// String pointer passed in `reg`.
    pub fn in_register(space: Space<'a>, reg: Reg) -> Self {
        Self::new(View::in_register(space, &LONG_CELL, reg), &VALUE)
    }

    pub fn addr(&self) -> StructResult<u32> {
        self.view.read_raw(self.field)
    }

    pub fn set_addr(&self, addr: u32) -> StructResult<()> {
        self.view.write_raw(self.field, addr)
    }

    /// The pointed-to string, `None` for a null pointer.
    pub fn get(&self) -> StructResult<Option<String>> {
        match self.addr()? {
            0 => Ok(None),
            addr => Ok(Some(self.view.space().mem().read_cstring(addr)?)),
        }
    }

    /// Copies `s` into freshly allocated guest memory and points the field at it.
    ///
    /// Returns `Ok(None)` when the allocator is exhausted; the field is left null.
    ///
    /// # Panics
    ///
    /// The field must be null: a string it already points at would leak.
    pub fn alloc_str(&self, allocator: &dyn Allocator, s: &str) -> StructResult<Option<u32>> {
        let current = self.addr()?;
        assert!(
            current == 0,
            "{}.{} already points at a string ({})",
            self.view.def().name,
            self.field.name,
            Hex(current)
        );

        let Some(addr) = allocator.allocate(cstring_len(s) as u32, self.field.name) else {
            return Ok(None);
        };
        if let Err(err) = self.view.space().mem().write_cstring(addr, s) {
            allocator.free(addr);
            return Err(err.into());
        }
        self.set_addr(addr)?;
        debug!(field = self.field.name, addr = %Hex(addr), s, "string allocated");
        Ok(Some(addr))
    }

    /// Frees the pointed-to string and nulls the field. Returns `false` for a null pointer.
    pub fn free_str(&self, allocator: &dyn Allocator) -> StructResult<bool> {
        let addr = self.addr()?;
        if addr == 0 {
            return Ok(false);
        }
        allocator.free(addr);
        self.set_addr(0)?;
        Ok(true)
    }
}

impl fmt::Debug for CStrField<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}.{}", self.view, self.field.name)
    }
}

impl<'a> View<'a> {
    pub fn cstr(&self, field: &'static FieldDef) -> CStrField<'a> {
        CStrField::new(*self, field)
    }
}

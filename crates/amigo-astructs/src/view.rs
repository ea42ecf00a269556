use std::fmt;

use amigo_machine::{Allocator, Cpu, GuestMemory, Hex, Reg};
use tracing::debug;

use crate::def::{FieldDef, FieldType, StructDef};
use crate::error::StructResult;

/// The address space a view reads and writes through.
#[derive(Clone, Copy)]
pub struct Space<'a> {
    mem: &'a dyn GuestMemory,
    cpu: Option<&'a dyn Cpu>,
    alloc: Option<&'a dyn Allocator>,
}

impl<'a> Space<'a> {
    pub fn new(mem: &'a dyn GuestMemory) -> Self {
        Self {
            mem,
            cpu: None,
            alloc: None,
        }
    }

    pub fn with_cpu(mem: &'a dyn GuestMemory, cpu: &'a dyn Cpu) -> Self {
        Self {
            mem,
            cpu: Some(cpu),
            alloc: None,
        }
    }

    /// Attaches the allocator whose ownership records pointer fields consult before they are
    /// re-targeted.
    pub fn with_allocator(self, alloc: &'a dyn Allocator) -> Self {
        Self {
            alloc: Some(alloc),
            ..self
        }
    }

    pub fn mem(&self) -> &'a dyn GuestMemory {
        self.mem
    }

    pub fn cpu(&self) -> Option<&'a dyn Cpu> {
        self.cpu
    }

    pub fn allocator(&self) -> Option<&'a dyn Allocator> {
        self.alloc
    }
}

impl fmt::Debug for Space<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Space")
            .field("size", &self.mem.size())
            .field("cpu", &self.cpu.is_some())
            .field("alloc", &self.alloc.is_some())
            .finish()
    }
}

/// Where a view's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Location {
    Addr(u32),
    Register(Reg),
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Addr(addr) => write!(f, "{}", Hex(*addr)),
            Location::Register(reg) => write!(f, "{reg}"),
        }
    }
}

/// A descriptor bound to a location in a [`Space`].
///
/// Views hold no ownership: copying one is free and dropping one never releases guest memory.
/// Two views are equal when they describe the same kind of structure at the same location.
#[derive(Clone, Copy)]
pub struct View<'a> {
    space: Space<'a>,
    def: &'static StructDef,
    loc: Location,
}

impl<'a> View<'a> {
    pub fn at(space: Space<'a>, def: &'static StructDef, addr: u32) -> Self {
        Self {
            space,
            def,
            loc: Location::Addr(addr),
        }
    }

    /// Binds `def` to a CPU register. Only structures that fit in one register can live there.
    pub fn in_register(space: Space<'a>, def: &'static StructDef, reg: Reg) -> Self {
        assert!(
            space.cpu.is_some(),
            "register-resident {} needs a CPU",
            def.name
        );
        assert!(
            def.size <= 4,
            "{} is {} bytes and does not fit in a register",
            def.name,
            def.size
        );
        Self {
            space,
            def,
            loc: Location::Register(reg),
        }
    }

    pub fn space(&self) -> Space<'a> {
        self.space
    }

    pub fn def(&self) -> &'static StructDef {
        self.def
    }

    pub fn location(&self) -> Location {
        self.loc
    }

    /// Guest address of the structure.
    ///
    /// # Panics
    ///
    /// Register-resident views have no address.
    pub fn addr(&self) -> u32 {
        match self.loc {
            Location::Addr(addr) => addr,
            Location::Register(reg) => panic!("{} in {reg} has no guest address", self.def.name),
        }
    }

    pub fn try_addr(&self) -> Option<u32> {
        match self.loc {
            Location::Addr(addr) => Some(addr),
            Location::Register(_) => None,
        }
    }

    /// Same location, different descriptor.
    pub fn cast(&self, def: &'static StructDef) -> View<'a> {
        View { def, ..*self }
    }

    pub fn field_by_name(&self, name: &str) -> Option<&'static FieldDef> {
        self.def.field(name)
    }

    fn check_field(&self, field: &FieldDef) {
        assert!(
            self.def.contains(field),
            "{} has no field {} at offset {}",
            self.def.name,
            field.name,
            field.offset
        );
    }

    fn register_of(&self, field: &FieldDef) -> Option<Reg> {
        let Location::Register(reg) = self.loc else {
            return None;
        };
        assert!(
            field.offset == 0 && field.width() <= 4 && field.ty.is_integer(),
            "register-resident {} only supports whole-register access, not {}",
            self.def.name,
            field.name
        );
        Some(reg)
    }

    fn cpu(&self) -> &'a dyn Cpu {
        match self.space.cpu {
            Some(cpu) => cpu,
            None => unreachable!("register views are only built with a CPU"),
        }
    }

    /// Reads an integer-typed field as its zero-extended big-endian value.
    pub fn read_raw(&self, field: &FieldDef) -> StructResult<u32> {
        self.check_field(field);
        let width = field.width();
        if let Some(reg) = self.register_of(field) {
            let value = self.cpu().read_register(reg);
            return Ok(match width {
                1 => value & 0xFF,
                2 => value & 0xFFFF,
                _ => value,
            });
        }

        assert!(
            field.ty.is_integer(),
            "{}.{} is an embedded struct, not an integer",
            self.def.name,
            field.name
        );
        let addr = self.addr().wrapping_add(field.offset);
        let mem = self.space.mem;
        Ok(match width {
            1 => u32::from(mem.read_u8(addr)?),
            2 => u32::from(mem.read_u16(addr)?),
            4 => mem.read_u32(addr)?,
            other => panic!("{}.{} has unsupported width {other}", self.def.name, field.name),
        })
    }

    /// Writes the low `width` bytes of `value` into an integer-typed field.
    ///
    /// Narrow writes to a register leave the upper register bits untouched.
    pub fn write_raw(&self, field: &FieldDef, value: u32) -> StructResult<()> {
        self.check_field(field);
        let width = field.width();
        if let Some(reg) = self.register_of(field) {
            let cpu = self.cpu();
            let merged = match width {
                1 => (cpu.read_register(reg) & !0xFF) | (value & 0xFF),
                2 => (cpu.read_register(reg) & !0xFFFF) | (value & 0xFFFF),
                _ => value,
            };
            cpu.write_register(reg, merged);
            return Ok(());
        }

        assert!(
            field.ty.is_integer(),
            "{}.{} is an embedded struct, not an integer",
            self.def.name,
            field.name
        );
        let addr = self.addr().wrapping_add(field.offset);
        let mem = self.space.mem;
        match width {
            1 => mem.write_u8(addr, value as u8)?,
            2 => mem.write_u16(addr, value as u16)?,
            4 => mem.write_u32(addr, value)?,
            other => panic!("{}.{} has unsupported width {other}", self.def.name, field.name),
        }
        Ok(())
    }

    /// Raw value of the named field, `None` if the descriptor has no integer field by that name.
    pub fn read_field(&self, name: &str) -> StructResult<Option<u32>> {
        match self.def.field(name) {
            Some(field) if field.ty.is_integer() => self.read_raw(field).map(Some),
            _ => Ok(None),
        }
    }

    /// Guest address of an embedded sub-structure field.
    pub fn embedded_addr(&self, field: &FieldDef) -> u32 {
        self.check_field(field);
        self.addr().wrapping_add(field.offset)
    }

    /// Zero-fills the whole structure.
    pub fn clear(&self) -> StructResult<()> {
        self.space
            .mem
            .fill(self.addr(), self.def.size as usize, 0)?;
        Ok(())
    }

    /// Releases the structure's memory. The view must not be used afterwards.
    pub fn free(self, allocator: &dyn Allocator) {
        allocator.free(self.addr());
    }

    /// Logs every descriptor field with its offset and current value.
    pub fn dump(&self) -> StructResult<()> {
        debug!(strukt = self.def.name, at = %self.loc, size = self.def.size, "dump");
        for field in self.def.fields {
            match field.ty {
                FieldType::Struct(sub) => {
                    debug!(
                        field = field.name,
                        offset = field.offset,
                        "  embedded {}",
                        sub.name
                    );
                }
                _ if matches!(self.loc, Location::Register(_)) && field.offset != 0 => {}
                _ => {
                    let value = self.read_raw(field)?;
                    debug!(
                        field = field.name,
                        offset = field.offset,
                        value = %Hex(value),
                        "  field"
                    );
                }
            }
        }
        Ok(())
    }
}

impl PartialEq for View<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.def.name == other.def.name && self.loc == other.loc
    }
}

impl Eq for View<'_> {}

impl fmt::Debug for View<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.def.name, self.loc)
    }
}

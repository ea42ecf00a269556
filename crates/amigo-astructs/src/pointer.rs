//! Pointer fields: direct byte pointers (`APTR`) and block pointers (`BPTR`).
//!
//! A block pointer stores the referent's address divided by four, so the referent must be
//! longword aligned. The integer stored in the field ([`PointerCell::raw`]) and the resolved
//! byte address ([`PointerCell::addr`]) therefore differ by the shift for block pointers and are
//! never interchangeable.

use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;

use amigo_machine::{Allocator, Hex, Reg};
use tracing::debug;

use crate::def::{FieldDef, FieldType, PtrEncoding, LONG_CELL, VALUE, VOID};
use crate::error::{StructError, StructResult};
use crate::strukt::GuestStruct;
use crate::view::{Location, Space, View};

pub const fn block_to_direct(block: u32) -> u32 {
    block << 2
}

pub const fn direct_to_block(addr: u32) -> u32 {
    addr >> 2
}

/// Address encoding of a pointer field.
pub trait Encoding {
    const KIND: PtrEncoding;

    fn encode(addr: u32) -> StructResult<u32>;
    fn decode(stored: u32) -> u32;
}

/// Stored value is the byte address.
#[derive(Debug)]
pub enum Direct {}

/// Stored value is the byte address shifted right by two.
#[derive(Debug)]
pub enum Block {}

impl Encoding for Direct {
    const KIND: PtrEncoding = PtrEncoding::Direct;

    fn encode(addr: u32) -> StructResult<u32> {
        Ok(addr)
    }

    fn decode(stored: u32) -> u32 {
        stored
    }
}

impl Encoding for Block {
    const KIND: PtrEncoding = PtrEncoding::Block;

    fn encode(addr: u32) -> StructResult<u32> {
        if addr % 4 != 0 {
            return Err(StructError::Misaligned { addr });
        }
        Ok(direct_to_block(addr))
    }

    fn decode(stored: u32) -> u32 {
        block_to_direct(stored)
    }
}

/// A pointer field resolved to a typed referent.
///
/// The resolved referent is cached against the raw stored value; every [`get`](Self::get)
/// re-reads the field and rebuilds the referent only if the raw value changed, so writes made
/// by guest code are always observed.
///
/// A field that allocated its referent through [`alloc`](Self::alloc) owns it until
/// [`free`](Self::free). Ownership is recorded in the allocator against the field's guest
/// address, so it holds for every cell built over the same field. While owned, the field refuses
/// to be re-targeted through any cell whose [`Space`] carries that allocator.
pub struct PointerCell<'a, T, E> {
    view: View<'a>,
    field: &'static FieldDef,
    cache: Cell<Option<(u32, Option<T>)>>,
    _encoding: PhantomData<E>,
}

pub type Aptr<'a, T> = PointerCell<'a, T, Direct>;
pub type Bptr<'a, T> = PointerCell<'a, T, Block>;

impl<'a, T: GuestStruct<'a>, E: Encoding> PointerCell<'a, T, E> {
    pub(crate) fn new(view: View<'a>, field: &'static FieldDef) -> Self {
        match field.ty {
            FieldType::Ptr { target, encoding } => {
                assert_eq!(
                    encoding,
                    E::KIND,
                    "{}.{} has the wrong pointer encoding",
                    view.def().name,
                    field.name
                );
                assert!(
                    target == T::DEF.name || target == VOID.name || T::DEF.name == VOID.name,
                    "{}.{} points at {target}, not {}",
                    view.def().name,
                    field.name,
                    T::DEF.name
                );
            }
            // A bare longword (typically a register) reinterpreted as a pointer.
            FieldType::U32 => {}
            _ => panic!("{}.{} is not a pointer", view.def().name, field.name),
        }
        Self {
            view,
            field,
            cache: Cell::new(None),
            _encoding: PhantomData,
        }
    }

    /// Pointer passed in `reg`.
    pub fn in_register(space: Space<'a>, reg: Reg) -> Self {
        Self::new(View::in_register(space, &LONG_CELL, reg), &VALUE)
    }

    /// The stored integer: the address for direct pointers, the block index for block pointers.
    pub fn raw(&self) -> StructResult<u32> {
        self.view.read_raw(self.field)
    }

    /// Resolved byte address of the referent, 0 for null.
    pub fn addr(&self) -> StructResult<u32> {
        self.raw().map(E::decode)
    }

    pub fn is_null(&self) -> StructResult<bool> {
        Ok(self.raw()? == 0)
    }

    pub fn get(&self) -> StructResult<Option<T>> {
        let raw = self.raw()?;
        if let Some((seen, referent)) = self.cache.get() {
            if seen == raw {
                return Ok(referent);
            }
        }
        let referent = match E::decode(raw) {
            0 => None,
            addr => Some(T::at(self.view.space(), addr)),
        };
        self.cache.set(Some((raw, referent)));
        Ok(referent)
    }

    pub fn set(&self, referent: Option<T>) -> StructResult<()> {
        self.set_addr(referent.map_or(0, |r| r.addr()))
    }

    /// Stores an arbitrary view, checking that it describes the referent type.
    pub fn set_view(&self, view: Option<View<'a>>) -> StructResult<()> {
        let Some(view) = view else {
            return self.set(None);
        };
        if view.def().name != T::DEF.name && T::DEF.name != VOID.name {
            return Err(StructError::TypeMismatch {
                expected: T::DEF.name,
                found: view.def().name,
            });
        }
        self.set(Some(T::from_view(view.cast(T::DEF))))
    }

    pub fn set_addr(&self, addr: u32) -> StructResult<()> {
        self.check_not_owned()?;
        self.store(E::encode(addr)?)
    }

    /// Allocates and zero-fills a new referent and points the field at it.
    ///
    /// `Ok(None)` when the allocator is exhausted; the field is left untouched.
    ///
    /// # Panics
    ///
    /// Panics if the field already owns a referent or is not null, and for register-resident
    /// pointers, which cannot own memory.
    pub fn alloc(&self, allocator: &dyn Allocator, tag: &str) -> StructResult<Option<T>> {
        self.alloc_with(allocator, tag, |_| Ok(()))
    }

    /// [`alloc`](Self::alloc), then runs `init` on the new referent before it is stored.
    pub fn alloc_with(
        &self,
        allocator: &dyn Allocator,
        tag: &str,
        init: impl FnOnce(T) -> StructResult<()>,
    ) -> StructResult<Option<T>> {
        let Some(owner) = self.owner_key() else {
            panic!("{self:?} lives in a register and cannot own a referent");
        };
        let owned = self.owns_referent(allocator)?;
        assert!(!owned, "{self:?} already owns an allocated referent");
        let current = self.addr()?;
        assert!(
            current == 0,
            "{self:?} already points at {}; clear it before allocating",
            Hex(current)
        );
        let Some(referent) = T::alloc(self.view.space(), allocator, tag)? else {
            return Ok(None);
        };
        let stored = init(referent).and_then(|()| E::encode(referent.addr()));
        let stored = match stored {
            Ok(stored) => stored,
            Err(err) => {
                referent.free(allocator);
                return Err(err);
            }
        };
        self.store(stored)?;
        allocator.set_owner(referent.addr(), Some(owner));
        debug!(cell = ?self, addr = %Hex(referent.addr()), "pointer referent allocated");
        Ok(Some(referent))
    }

    /// Releases the referent to `allocator` and nulls the field. Returns `false` if the field was
    /// already null.
    ///
    /// Only a referent this field allocated can be freed through it; anything else is
    /// [`StructError::NotOwner`] and is left alone.
    pub fn free(&self, allocator: &dyn Allocator) -> StructResult<bool> {
        let Some(referent) = self.get()? else {
            return Ok(false);
        };
        if !self.owns_referent(allocator)? {
            return Err(StructError::NotOwner {
                field: self.field.name,
                addr: referent.addr(),
            });
        }
        referent.free(allocator);
        self.store(0)?;
        debug!(cell = ?self, addr = %Hex(referent.addr()), "pointer referent freed");
        Ok(true)
    }

    /// Whether `allocator` records this field as the owner of its current referent.
    pub fn owns_referent(&self, allocator: &dyn Allocator) -> StructResult<bool> {
        let Some(owner) = self.owner_key() else {
            return Ok(false);
        };
        let addr = self.addr()?;
        Ok(addr != 0 && allocator.owner_of(addr) == Some(owner))
    }

    /// Guest address of the field itself; ownership is keyed on it.
    fn owner_key(&self) -> Option<u32> {
        match self.view.location() {
            Location::Addr(base) => Some(base + self.field.offset),
            Location::Register(_) => None,
        }
    }

    fn check_not_owned(&self) -> StructResult<()> {
        let Some(allocator) = self.view.space().allocator() else {
            return Ok(());
        };
        if self.owns_referent(allocator)? {
            return Err(StructError::PointerOwned {
                field: self.field.name,
            });
        }
        Ok(())
    }

    fn store(&self, raw: u32) -> StructResult<()> {
        self.view.write_raw(self.field, raw)?;
        self.cache.set(None);
        Ok(())
    }
}

impl<'a, T: GuestStruct<'a>> PointerCell<'a, T, Block> {
    /// The stored block index.
    pub fn block(&self) -> StructResult<u32> {
        self.raw()
    }

    pub fn set_block(&self, block: u32) -> StructResult<()> {
        self.check_not_owned()?;
        self.store(block)
    }
}

impl<T, E> fmt::Debug for PointerCell<'_, T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}.{}", self.view, self.field.name)
    }
}

impl<'a> View<'a> {
    pub fn pointer<T: GuestStruct<'a>, E: Encoding>(
        &self,
        field: &'static FieldDef,
    ) -> PointerCell<'a, T, E> {
        PointerCell::new(*self, field)
    }

    pub fn aptr<T: GuestStruct<'a>>(&self, field: &'static FieldDef) -> Aptr<'a, T> {
        self.pointer(field)
    }

    pub fn bptr<T: GuestStruct<'a>>(&self, field: &'static FieldDef) -> Bptr<'a, T> {
        self.pointer(field)
    }
}

#[cfg(test)]
mod tests {
    use amigo_machine::{Cpu, DenseMemory, GuestMemory, MemoryArena, RegisterFile};

    use super::*;
    use crate::def::StructDef;
    use crate::strukt::Void;

    const CELL: StructDef = StructDef::new("Cell", 4, &[FieldDef::new("v", 0, FieldType::U32)]);
    const HOLDER: StructDef = StructDef::new(
        "Holder",
        12,
        &[
            FieldDef::new(
                "direct",
                0,
                FieldType::Ptr {
                    target: "Cell",
                    encoding: PtrEncoding::Direct,
                },
            ),
            FieldDef::new(
                "block",
                4,
                FieldType::Ptr {
                    target: "Cell",
                    encoding: PtrEncoding::Block,
                },
            ),
            FieldDef::new(
                "any",
                8,
                FieldType::Ptr {
                    target: "VOID",
                    encoding: PtrEncoding::Direct,
                },
            ),
        ],
    );

    crate::guest_struct!(struct CellS => CELL;);
    crate::guest_struct!(struct Holder => HOLDER;);

    struct Fixture {
        mem: DenseMemory,
        arena: MemoryArena,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                mem: DenseMemory::new(0x4000).unwrap(),
                arena: MemoryArena::new(0x1000, 0x3000),
            }
        }

        fn space(&self) -> Space<'_> {
            Space::new(&self.mem).with_allocator(&self.arena)
        }

        fn holder(&self) -> Holder<'_> {
            Holder::alloc(self.space(), &self.arena, "holder")
                .unwrap()
                .unwrap()
        }
    }

    #[test]
    fn set_then_get_returns_the_same_referent() {
        let fx = Fixture::new();
        let holder = fx.holder();
        let target = CellS::at(Space::new(&fx.mem), 0x2000);

        let direct = holder.view().aptr::<CellS>(&HOLDER.fields[0]);
        direct.set(Some(target)).unwrap();
        assert_eq!(direct.get().unwrap(), Some(target));
        assert_eq!(direct.raw().unwrap(), 0x2000);
    }

    #[test]
    fn block_pointer_stores_the_shifted_address() {
        let fx = Fixture::new();
        let holder = fx.holder();
        let block = holder.view().bptr::<CellS>(&HOLDER.fields[1]);

        block.set_addr(0x2000).unwrap();
        assert_eq!(block.raw().unwrap(), 0x800);
        assert_eq!(block.block().unwrap(), 0x800);
        assert_eq!(block.addr().unwrap(), 0x2000);
        assert_eq!(fx.mem.read_u32(holder.addr() + 4).unwrap(), 0x800);

        assert_eq!(
            block.set_addr(0x2002),
            Err(StructError::Misaligned { addr: 0x2002 })
        );
    }

    #[test]
    fn external_writes_invalidate_the_cache() {
        let fx = Fixture::new();
        let holder = fx.holder();
        let direct = holder.view().aptr::<CellS>(&HOLDER.fields[0]);

        direct.set_addr(0x2000).unwrap();
        assert_eq!(direct.get().unwrap().map(|c| c.addr()), Some(0x2000));

        fx.mem.write_u32(holder.addr(), 0x2100).unwrap();
        assert_eq!(direct.get().unwrap().map(|c| c.addr()), Some(0x2100));

        fx.mem.write_u32(holder.addr(), 0).unwrap();
        assert_eq!(direct.get().unwrap(), None);
    }

    #[test]
    fn alloc_free_round_trip() {
        let fx = Fixture::new();
        let holder = fx.holder();
        let direct = holder.view().aptr::<CellS>(&HOLDER.fields[0]);

        let cell = direct.alloc(&fx.arena, "cell").unwrap().unwrap();
        assert!(direct.owns_referent(&fx.arena).unwrap());
        assert_eq!(direct.get().unwrap(), Some(cell));
        assert_eq!(
            direct.set(None),
            Err(StructError::PointerOwned { field: "direct" })
        );

        assert!(direct.free(&fx.arena).unwrap());
        assert_eq!(direct.raw().unwrap(), 0);
        assert_eq!(direct.get().unwrap(), None);
        assert!(!direct.owns_referent(&fx.arena).unwrap());
        assert_eq!(fx.arena.live_blocks(), 1);
    }

    #[test]
    fn ownership_holds_across_separate_cells() {
        let fx = Fixture::new();
        let holder = fx.holder();
        let field = || holder.view().aptr::<CellS>(&HOLDER.fields[0]);

        let cell = field().alloc(&fx.arena, "cell").unwrap().unwrap();
        assert!(field().owns_referent(&fx.arena).unwrap());
        assert_eq!(
            field().set_addr(0x3000),
            Err(StructError::PointerOwned { field: "direct" })
        );
        assert_eq!(field().get().unwrap(), Some(cell));

        // The neighbouring field does not own what it merely points at.
        let block = holder.view().bptr::<CellS>(&HOLDER.fields[1]);
        block.set(Some(cell)).unwrap();
        assert!(!block.owns_referent(&fx.arena).unwrap());
        assert_eq!(
            block.free(&fx.arena),
            Err(StructError::NotOwner {
                field: "block",
                addr: cell.addr()
            })
        );
        assert_eq!(fx.arena.size_of(cell.addr()), Some(4));
        block.set(None).unwrap();

        assert!(field().free(&fx.arena).unwrap());
        assert_eq!(fx.arena.live_blocks(), 1);
        field().set_addr(0x3000).unwrap();
    }

    #[test]
    fn free_refuses_memory_the_field_did_not_allocate() {
        let fx = Fixture::new();
        let holder = fx.holder();
        let direct = holder.view().aptr::<CellS>(&HOLDER.fields[0]);

        direct.set_addr(0x3000).unwrap();
        assert_eq!(
            direct.free(&fx.arena),
            Err(StructError::NotOwner {
                field: "direct",
                addr: 0x3000
            })
        );
        assert_eq!(direct.addr().unwrap(), 0x3000);

        let foreign = fx.arena.allocate(4, "foreign").unwrap();
        direct.set_addr(foreign).unwrap();
        assert!(direct.free(&fx.arena).is_err());
        assert_eq!(fx.arena.size_of(foreign), Some(4));
    }

    #[test]
    #[should_panic(expected = "already owns")]
    fn double_alloc_panics() {
        let fx = Fixture::new();
        let holder = fx.holder();
        let direct = holder.view().aptr::<CellS>(&HOLDER.fields[0]);
        direct.alloc(&fx.arena, "one").unwrap();
        let _ = direct.alloc(&fx.arena, "two");
    }

    #[test]
    #[should_panic(expected = "already owns")]
    fn double_alloc_through_a_fresh_cell_panics() {
        let fx = Fixture::new();
        let holder = fx.holder();
        holder
            .view()
            .aptr::<CellS>(&HOLDER.fields[0])
            .alloc(&fx.arena, "one")
            .unwrap();
        let _ = holder
            .view()
            .aptr::<CellS>(&HOLDER.fields[0])
            .alloc(&fx.arena, "two");
    }

    #[test]
    #[should_panic(expected = "already points at")]
    fn alloc_over_a_borrowed_referent_panics() {
        let fx = Fixture::new();
        let holder = fx.holder();
        let direct = holder.view().aptr::<CellS>(&HOLDER.fields[0]);
        direct.set_addr(0x3000).unwrap();
        let _ = direct.alloc(&fx.arena, "cell");
    }

    #[test]
    fn set_view_checks_the_referent_kind() {
        let fx = Fixture::new();
        let holder = fx.holder();
        let space = Space::new(&fx.mem);
        let direct = holder.view().aptr::<CellS>(&HOLDER.fields[0]);

        let err = direct
            .set_view(Some(View::at(space, &HOLDER, 0x2000)))
            .unwrap_err();
        assert_eq!(
            err,
            StructError::TypeMismatch {
                expected: "Cell",
                found: "Holder"
            }
        );

        direct.set_view(Some(View::at(space, &CELL, 0x2000))).unwrap();
        assert_eq!(direct.addr().unwrap(), 0x2000);

        // Untyped pointers take any structure.
        let any = holder.view().aptr::<Void>(&HOLDER.fields[2]);
        any.set_view(Some(holder.view())).unwrap();
        assert_eq!(any.addr().unwrap(), holder.addr());
    }

    #[test]
    fn register_pointer_reads_the_register() {
        let mem = DenseMemory::new(0x100).unwrap();
        let cpu = RegisterFile::new();
        cpu.write_register(Reg::A1, 0x40);
        let cell = Aptr::<CellS>::in_register(Space::with_cpu(&mem, &cpu), Reg::A1);
        assert_eq!(cell.get().unwrap().map(|c| c.addr()), Some(0x40));
        cell.set(None).unwrap();
        assert_eq!(cpu.read_register(Reg::A1), 0);
    }

    proptest::proptest! {
        #[test]
        fn block_and_direct_are_inverse_for_aligned_addresses(block in 0u32..(1 << 30)) {
            let addr = block_to_direct(block);
            proptest::prop_assert_eq!(direct_to_block(addr), block);
            proptest::prop_assert_eq!(block_to_direct(direct_to_block(addr)), addr);
            proptest::prop_assert_eq!(Block::encode(addr).unwrap(), block);
        }
    }
}

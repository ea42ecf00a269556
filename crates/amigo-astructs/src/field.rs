//! Typed handles over integer and bit-flag fields.

use std::fmt;
use std::marker::PhantomData;

use amigo_machine::Reg;
use bitflags::Flags;

use crate::def::{FieldDef, FieldType, StructDef, LONG_CELL, VALUE};
use crate::error::StructResult;
use crate::view::{Space, View};

/// Host integer types a field can decode into.
pub trait ScalarType: Copy + fmt::Debug {
    const WIDTH: u32;

    fn from_raw(raw: u32) -> Self;
    fn to_raw(self) -> u32;
}

macro_rules! scalar_type {
    ($($ty:ty => $width:expr),* $(,)?) => {
        $(
            impl ScalarType for $ty {
                const WIDTH: u32 = $width;

                fn from_raw(raw: u32) -> Self {
                    raw as $ty
                }

                fn to_raw(self) -> u32 {
                    // Sign-extends for signed types; `write_raw` keeps only the low bytes.
                    self as u32
                }
            }
        )*
    };
}

scalar_type!(u8 => 1, i8 => 1, u16 => 2, i16 => 2, u32 => 4, i32 => 4);

const BYTE_CELL: StructDef = StructDef::new("BYTE", 1, &[FieldDef::new("value", 0, FieldType::U8)]);
const WORD_CELL: StructDef =
    StructDef::new("WORD", 2, &[FieldDef::new("value", 0, FieldType::U16)]);

/// One-field descriptor of the given width, used for register-resident scalars.
pub(crate) fn register_cell(width: u32) -> (&'static StructDef, &'static FieldDef) {
    match width {
        1 => (&BYTE_CELL, &BYTE_CELL.fields[0]),
        2 => (&WORD_CELL, &WORD_CELL.fields[0]),
        _ => (&LONG_CELL, &VALUE),
    }
}

pub struct Scalar<'a, T> {
    view: View<'a>,
    field: &'static FieldDef,
    _ty: PhantomData<T>,
}

impl<'a, T: ScalarType> Scalar<'a, T> {
    pub(crate) fn new(view: View<'a>, field: &'static FieldDef) -> Self {
        assert!(
            field.ty.is_integer() && field.width() == T::WIDTH,
            "{}.{} is {} bytes wide, not {}",
            view.def().name,
            field.name,
            field.width(),
            T::WIDTH
        );
        Self {
            view,
            field,
            _ty: PhantomData,
        }
    }

    /// The low `T::WIDTH` bytes of `reg`.
    pub fn in_register(space: Space<'a>, reg: Reg) -> Self {
        let (def, field) = register_cell(T::WIDTH);
        Self::new(View::in_register(space, def, reg), field)
    }

    pub fn get(&self) -> StructResult<T> {
        self.view.read_raw(self.field).map(T::from_raw)
    }

    pub fn set(&self, value: T) -> StructResult<()> {
        self.view.write_raw(self.field, value.to_raw())
    }

    /// Read-modify-write; returns the previous value.
    pub fn update(&self, f: impl FnOnce(T) -> T) -> StructResult<T> {
        let old = self.get()?;
        self.set(f(old))?;
        Ok(old)
    }
}

impl<T> fmt::Debug for Scalar<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}.{}", self.view, self.field.name)
    }
}

/// A `bitflags` set layered over an unsigned integer field.
pub struct FlagField<'a, F> {
    view: View<'a>,
    field: &'static FieldDef,
    _ty: PhantomData<F>,
}

impl<'a, F> FlagField<'a, F>
where
    F: Flags,
    F::Bits: ScalarType,
{
    pub(crate) fn new(view: View<'a>, field: &'static FieldDef) -> Self {
        assert!(
            matches!(field.ty, FieldType::Flags { .. }) && field.width() == F::Bits::WIDTH,
            "{}.{} is not a {}-byte flag field",
            view.def().name,
            field.name,
            <F::Bits as ScalarType>::WIDTH
        );
        Self {
            view,
            field,
            _ty: PhantomData,
        }
    }

    /// Every stored bit is kept, including ones the flag type does not name.
    pub fn get(&self) -> StructResult<F> {
        let raw = self.view.read_raw(self.field)?;
        Ok(F::from_bits_retain(F::Bits::from_raw(raw)))
    }

    pub fn set(&self, flags: F) -> StructResult<()> {
        self.view.write_raw(self.field, flags.bits().to_raw())
    }

    pub fn insert(&self, flags: F) -> StructResult<()> {
        let mut current = self.get()?;
        current.insert(flags);
        self.set(current)
    }

    pub fn remove(&self, flags: F) -> StructResult<()> {
        let mut current = self.get()?;
        current.remove(flags);
        self.set(current)
    }

    pub fn contains(&self, flags: F) -> StructResult<bool> {
        Ok(self.get()?.contains(flags))
    }

    /// Tests a flag by its declared name. Unknown names are a programming error.
    pub fn test_named(&self, name: &str) -> StructResult<bool> {
        let flag = Self::named(name);
        self.contains(flag)
    }

    pub fn set_named(&self, name: &str) -> StructResult<()> {
        self.insert(Self::named(name))
    }

    pub fn clear_named(&self, name: &str) -> StructResult<()> {
        self.remove(Self::named(name))
    }

    fn named(name: &str) -> F {
        match F::from_name(name) {
            Some(flag) => flag,
            None => panic!("no flag named {name}"),
        }
    }
}

impl<F> fmt::Debug for FlagField<'_, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}.{}", self.view, self.field.name)
    }
}

impl<'a> View<'a> {
    pub fn scalar<T: ScalarType>(&self, field: &'static FieldDef) -> Scalar<'a, T> {
        Scalar::new(*self, field)
    }

    pub fn flags<F>(&self, field: &'static FieldDef) -> FlagField<'a, F>
    where
        F: Flags,
        F::Bits: ScalarType,
    {
        FlagField::new(*self, field)
    }
}

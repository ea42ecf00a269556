use amigo_machine::Allocator;

use crate::def::{FieldDef, FieldType, StructDef, VOID};
use crate::error::StructResult;
use crate::view::{Space, View};

/// A typed wrapper around a [`View`] of one particular descriptor.
///
/// Wrappers are `Copy` handles; they never own the memory they describe. Use [`guest_struct!`]
/// to declare one.
///
/// [`guest_struct!`]: crate::guest_struct
pub trait GuestStruct<'a>: Copy + Sized {
    const DEF: &'static StructDef;

    fn from_view(view: View<'a>) -> Self;

    fn view(&self) -> View<'a>;

    fn at(space: Space<'a>, addr: u32) -> Self {
        Self::from_view(View::at(space, Self::DEF, addr))
    }

    fn addr(&self) -> u32 {
        self.view().addr()
    }

    /// Allocates `DEF.size` zeroed bytes. `Ok(None)` when the allocator is exhausted.
    fn alloc(space: Space<'a>, allocator: &dyn Allocator, tag: &str) -> StructResult<Option<Self>> {
        let Some(addr) = allocator.allocate(Self::DEF.size, tag) else {
            return Ok(None);
        };
        let this = Self::at(space, addr);
        if let Err(err) = this.view().clear() {
            allocator.free(addr);
            return Err(err);
        }
        Ok(Some(this))
    }

    fn free(self, allocator: &dyn Allocator) {
        self.view().free(allocator);
    }
}

/// Declares a `Copy` wrapper type implementing [`GuestStruct`] for a descriptor constant.
///
/// ```ignore
/// guest_struct! {
///     /// Doc comment for the wrapper.
///     pub struct Node => NODE;
/// }
/// ```
#[macro_export]
macro_rules! guest_struct {
    ($(#[$meta:meta])* $vis:vis struct $name:ident => $def:path;) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        $vis struct $name<'a>($crate::View<'a>);

        impl<'a> $crate::GuestStruct<'a> for $name<'a> {
            const DEF: &'static $crate::StructDef = &$def;

            fn from_view(view: $crate::View<'a>) -> Self {
                Self(view)
            }

            fn view(&self) -> $crate::View<'a> {
                self.0
            }
        }
    };
}

guest_struct! {
    /// Referent of an untyped pointer.
    pub struct Void => VOID;
}

impl<'a> View<'a> {
    /// Sub-structure stored inline at `field`. Shares this view's memory; never freed on its own.
    pub fn embedded<T: GuestStruct<'a>>(&self, field: &'static FieldDef) -> T {
        match field.ty {
            FieldType::Struct(def) if def.name == T::DEF.name => {}
            _ => panic!(
                "{}.{} is not an embedded {}",
                self.def().name,
                field.name,
                T::DEF.name
            ),
        }
        T::at(self.space(), self.embedded_addr(field))
    }

    /// Reinterprets this view as `T` at the same address.
    pub fn to<T: GuestStruct<'a>>(&self) -> T {
        T::from_view(self.cast(T::DEF))
    }
}

//! Binary layout descriptors.
//!
//! A [`StructDef`] is pure metadata: the guest name of a structure, its total size, and an ordered
//! list of fields with byte offsets and semantic types. Descriptors are `const` items, defined
//! once per structure kind and never mutated.

use crate::error::LayoutError;

/// How a pointer field encodes the referent's address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PtrEncoding {
    /// The stored value is the byte address.
    Direct,
    /// The stored value is the byte address shifted right by two (a "BPTR").
    Block,
}

#[derive(Debug, Clone, Copy)]
pub enum FieldType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    /// Bit-flag set layered over an unsigned integer of `width` bytes.
    Flags { width: u32 },
    /// Sub-structure stored inline.
    Struct(&'static StructDef),
    /// Pointer to a NUL-terminated string.
    CString,
    /// Pointer to another structure, named by its descriptor name.
    ///
    /// The target is referenced by name so that self-referential layouts (a node pointing at
    /// nodes) stay expressible as constants.
    Ptr {
        target: &'static str,
        encoding: PtrEncoding,
    },
}

impl FieldType {
    pub const fn width(&self) -> u32 {
        match self {
            FieldType::U8 | FieldType::I8 => 1,
            FieldType::U16 | FieldType::I16 => 2,
            FieldType::U32 | FieldType::I32 => 4,
            FieldType::Flags { width } => *width,
            FieldType::Struct(def) => def.size,
            FieldType::CString | FieldType::Ptr { .. } => 4,
        }
    }

    /// Scalars, flags and pointers are read as one big-endian integer.
    pub const fn is_integer(&self) -> bool {
        !matches!(self, FieldType::Struct(_))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FieldDef {
    pub name: &'static str,
    pub offset: u32,
    pub ty: FieldType,
    /// Set when the field deliberately overlays another field.
    pub alias_of: Option<&'static str>,
}

impl FieldDef {
    pub const fn new(name: &'static str, offset: u32, ty: FieldType) -> Self {
        Self {
            name,
            offset,
            ty,
            alias_of: None,
        }
    }

    pub const fn alias(name: &'static str, offset: u32, ty: FieldType, of: &'static str) -> Self {
        Self {
            name,
            offset,
            ty,
            alias_of: Some(of),
        }
    }

    pub const fn width(&self) -> u32 {
        self.ty.width()
    }

    pub const fn end(&self) -> u32 {
        self.offset + self.ty.width()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StructDef {
    pub name: &'static str,
    pub size: u32,
    pub fields: &'static [FieldDef],
}

impl StructDef {
    pub const fn new(name: &'static str, size: u32, fields: &'static [FieldDef]) -> Self {
        Self { name, size, fields }
    }

    pub fn field(&self, name: &str) -> Option<&'static FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Whether `field` belongs to this descriptor.
    pub fn contains(&self, field: &FieldDef) -> bool {
        self.fields
            .iter()
            .any(|f| f.name == field.name && f.offset == field.offset)
    }

    /// Checks that every field lies inside the struct and that fields only overlap when one of
    /// them is a declared alias.
    pub fn validate(&self) -> Result<(), LayoutError> {
        for field in self.fields {
            if field.end() > self.size {
                return Err(LayoutError::FieldOutOfBounds {
                    strukt: self.name,
                    field: field.name,
                    end: field.end(),
                    size: self.size,
                });
            }
            if let Some(target) = field.alias_of {
                if self.field(target).is_none() {
                    return Err(LayoutError::UnknownAlias {
                        strukt: self.name,
                        field: field.name,
                        target,
                    });
                }
            }
        }

        for (i, a) in self.fields.iter().enumerate() {
            for b in &self.fields[i + 1..] {
                let overlaps = a.offset < b.end() && b.offset < a.end();
                if overlaps && a.alias_of.is_none() && b.alias_of.is_none() {
                    return Err(LayoutError::FieldOverlap {
                        strukt: self.name,
                        first: a.name,
                        second: b.name,
                    });
                }
            }
        }
        Ok(())
    }
}

impl PartialEq for StructDef {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.size == other.size
    }
}

impl Eq for StructDef {}

/// Placeholder referent for untyped pointers (`APTR`/`BPTR` to anything).
pub const VOID: StructDef = StructDef::new("VOID", 0, &[]);

pub(crate) const VALUE: FieldDef = FieldDef::new("value", 0, FieldType::U32);

/// One-longword cell used to view a single register (or any bare longword) as a struct.
pub const LONG_CELL: StructDef = StructDef::new("LONG", 4, &[VALUE]);

#[cfg(test)]
mod tests {
    use super::*;

    const INNER: StructDef = StructDef::new(
        "Inner",
        6,
        &[
            FieldDef::new("a", 0, FieldType::U16),
            FieldDef::new("b", 2, FieldType::U32),
        ],
    );

    #[test]
    fn widths_follow_types() {
        assert_eq!(FieldType::I8.width(), 1);
        assert_eq!(FieldType::Flags { width: 2 }.width(), 2);
        assert_eq!(FieldType::Struct(&INNER).width(), 6);
        assert_eq!(FieldType::CString.width(), 4);
    }

    #[test]
    fn validate_accepts_declared_aliases() {
        const OUTER: StructDef = StructDef::new(
            "Outer",
            10,
            &[
                FieldDef::new("hdr", 0, FieldType::U32),
                FieldDef::new("inner", 4, FieldType::Struct(&INNER)),
                FieldDef::alias("inner_a", 4, FieldType::U16, "inner"),
            ],
        );
        assert_eq!(OUTER.validate(), Ok(()));
        assert_eq!(OUTER.field("inner_a").map(|f| f.offset), Some(4));
    }

    #[test]
    fn validate_rejects_overlap_and_overrun() {
        const OVERLAP: StructDef = StructDef::new(
            "Overlap",
            4,
            &[
                FieldDef::new("x", 0, FieldType::U32),
                FieldDef::new("y", 2, FieldType::U16),
            ],
        );
        assert!(matches!(
            OVERLAP.validate(),
            Err(LayoutError::FieldOverlap { first: "x", second: "y", .. })
        ));

        const OVERRUN: StructDef =
            StructDef::new("Overrun", 3, &[FieldDef::new("x", 0, FieldType::U32)]);
        assert!(matches!(
            OVERRUN.validate(),
            Err(LayoutError::FieldOutOfBounds { end: 4, size: 3, .. })
        ));

        const DANGLING: StructDef = StructDef::new(
            "Dangling",
            4,
            &[FieldDef::alias("x", 0, FieldType::U32, "nope")],
        );
        assert!(matches!(
            DANGLING.validate(),
            Err(LayoutError::UnknownAlias { target: "nope", .. })
        ));
    }
}

use amigo_astructs::{
    guest_struct, CStrField, FieldDef, FieldType, FlagField, Scalar, StructDef, StructResult,
};
use bitflags::bitflags;

use super::node::{Node, NodeType, NODE};

pub const LIB_NODE: FieldDef = FieldDef::new("lib_Node", 0, FieldType::Struct(&NODE));
pub const LIB_FLAGS: FieldDef = FieldDef::new("lib_Flags", 14, FieldType::Flags { width: 1 });
pub const LIB_PAD: FieldDef = FieldDef::new("lib_pad", 15, FieldType::U8);
pub const LIB_NEG_SIZE: FieldDef = FieldDef::new("lib_NegSize", 16, FieldType::U16);
pub const LIB_POS_SIZE: FieldDef = FieldDef::new("lib_PosSize", 18, FieldType::U16);
pub const LIB_VERSION: FieldDef = FieldDef::new("lib_Version", 20, FieldType::U16);
pub const LIB_REVISION: FieldDef = FieldDef::new("lib_Revision", 22, FieldType::U16);
pub const LIB_ID_STRING: FieldDef = FieldDef::new("lib_IdString", 24, FieldType::CString);
pub const LIB_SUM: FieldDef = FieldDef::new("lib_Sum", 28, FieldType::U32);
pub const LIB_OPEN_CNT: FieldDef = FieldDef::new("lib_OpenCnt", 32, FieldType::U16);

pub const LIBRARY: StructDef = StructDef::new(
    "Library",
    34,
    &[
        LIB_NODE,
        LIB_FLAGS,
        LIB_PAD,
        LIB_NEG_SIZE,
        LIB_POS_SIZE,
        LIB_VERSION,
        LIB_REVISION,
        LIB_ID_STRING,
        LIB_SUM,
        LIB_OPEN_CNT,
    ],
);

bitflags! {
    /// `lib_Flags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct LibFlags: u8 {
        const SUMMING = 1 << 0;
        const CHANGED = 1 << 1;
        const SUMUSED = 1 << 2;
        const DELEXP = 1 << 3;
    }
}

guest_struct! {
    /// Library (or device) base.
    pub struct Library => LIBRARY;
}

impl<'a> Library<'a> {
    pub fn init(&self, kind: NodeType, version: u16, revision: u16) -> StructResult<()> {
        self.node().init(kind, 0)?;
        self.0.scalar::<u16>(&LIB_VERSION).set(version)?;
        self.0.scalar::<u16>(&LIB_REVISION).set(revision)?;
        self.0.scalar::<u16>(&LIB_POS_SIZE).set(LIBRARY.size as u16)
    }

    pub fn node(&self) -> Node<'a> {
        self.0.embedded(&LIB_NODE)
    }

    pub fn flags(&self) -> FlagField<'a, LibFlags> {
        self.0.flags(&LIB_FLAGS)
    }

    /// Size of the base past the jump table; larger than `Library` for extended bases.
    pub fn pos_size(&self) -> Scalar<'a, u16> {
        self.0.scalar(&LIB_POS_SIZE)
    }

    pub fn version(&self) -> StructResult<u16> {
        self.0.scalar::<u16>(&LIB_VERSION).get()
    }

    pub fn revision(&self) -> StructResult<u16> {
        self.0.scalar::<u16>(&LIB_REVISION).get()
    }

    pub fn id_string(&self) -> CStrField<'a> {
        self.0.cstr(&LIB_ID_STRING)
    }

    pub fn open_cnt(&self) -> StructResult<u16> {
        self.0.scalar::<u16>(&LIB_OPEN_CNT).get()
    }

    /// Bumps `lib_OpenCnt` and returns the new count.
    pub fn open(&self) -> StructResult<u16> {
        let old = self
            .0
            .scalar::<u16>(&LIB_OPEN_CNT)
            .update(|n| n.wrapping_add(1))?;
        Ok(old.wrapping_add(1))
    }
}

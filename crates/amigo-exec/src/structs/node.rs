use std::fmt;

use amigo_astructs::{
    guest_struct, CStrField, FieldDef, FieldType, GuestStruct, Space, StructDef, StructResult,
};
use amigo_machine::Hex;
use tracing::warn;

use super::aptr;

pub const MLN_SUCC: FieldDef = FieldDef::new("mln_Succ", 0, aptr("MinNode"));
pub const MLN_PRED: FieldDef = FieldDef::new("mln_Pred", 4, aptr("MinNode"));

pub const MIN_NODE: StructDef = StructDef::new("MinNode", 8, &[MLN_SUCC, MLN_PRED]);

pub const LN_SUCC: FieldDef = FieldDef::new("ln_Succ", 0, aptr("Node"));
pub const LN_PRED: FieldDef = FieldDef::new("ln_Pred", 4, aptr("Node"));
pub const LN_TYPE: FieldDef = FieldDef::new("ln_Type", 8, FieldType::U8);
pub const LN_PRI: FieldDef = FieldDef::new("ln_Pri", 9, FieldType::I8);
pub const LN_NAME: FieldDef = FieldDef::new("ln_Name", 10, FieldType::CString);

pub const NODE: StructDef =
    StructDef::new("Node", 14, &[LN_SUCC, LN_PRED, LN_TYPE, LN_PRI, LN_NAME]);

/// Upper bound on list walks, so a corrupted guest list cannot hang the host.
pub(crate) const MAX_WALK: usize = 1 << 20;

/// Runtime kind stored in `ln_Type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NodeType {
    Unknown = 0,
    Task = 1,
    Interrupt = 2,
    Device = 3,
    MsgPort = 4,
    Message = 5,
    FreeMsg = 6,
    ReplyMsg = 7,
    Resource = 8,
    Library = 9,
    Memory = 10,
    SoftInt = 11,
    Font = 12,
    Process = 13,
    Semaphore = 14,
}

impl NodeType {
    pub const fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => NodeType::Unknown,
            1 => NodeType::Task,
            2 => NodeType::Interrupt,
            3 => NodeType::Device,
            4 => NodeType::MsgPort,
            5 => NodeType::Message,
            6 => NodeType::FreeMsg,
            7 => NodeType::ReplyMsg,
            8 => NodeType::Resource,
            9 => NodeType::Library,
            10 => NodeType::Memory,
            11 => NodeType::SoftInt,
            12 => NodeType::Font,
            13 => NodeType::Process,
            14 => NodeType::Semaphore,
            _ => return None,
        })
    }

    pub const fn raw(self) -> u8 {
        self as u8
    }

    pub const fn name(self) -> &'static str {
        match self {
            NodeType::Unknown => "NT_UNKNOWN",
            NodeType::Task => "NT_TASK",
            NodeType::Interrupt => "NT_INTERRUPT",
            NodeType::Device => "NT_DEVICE",
            NodeType::MsgPort => "NT_MSGPORT",
            NodeType::Message => "NT_MESSAGE",
            NodeType::FreeMsg => "NT_FREEMSG",
            NodeType::ReplyMsg => "NT_REPLYMSG",
            NodeType::Resource => "NT_RESOURCE",
            NodeType::Library => "NT_LIBRARY",
            NodeType::Memory => "NT_MEMORY",
            NodeType::SoftInt => "NT_SOFTINT",
            NodeType::Font => "NT_FONT",
            NodeType::Process => "NT_PROCESS",
            NodeType::Semaphore => "NT_SEMAPHORE",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

guest_struct! {
    /// Bare successor/predecessor header.
    pub struct MinNode => MIN_NODE;
}

guest_struct! {
    /// List header with type, priority and name.
    pub struct Node => NODE;
}

impl<'a> MinNode<'a> {
    pub fn succ(&self) -> StructResult<u32> {
        self.0.aptr::<MinNode>(&MLN_SUCC).addr()
    }

    pub fn pred(&self) -> StructResult<u32> {
        self.0.aptr::<MinNode>(&MLN_PRED).addr()
    }

    pub fn set_succ(&self, addr: u32) -> StructResult<()> {
        self.0.aptr::<MinNode>(&MLN_SUCC).set_addr(addr)
    }

    pub fn set_pred(&self, addr: u32) -> StructResult<()> {
        self.0.aptr::<MinNode>(&MLN_PRED).set_addr(addr)
    }

    /// Both links set. A node is never half-linked.
    pub fn is_linked(&self) -> StructResult<bool> {
        Ok(self.succ()? != 0 && self.pred()? != 0)
    }

    /// Unlinks the node and clears its links. Returns `false` if it was not linked.
    pub fn remove(&self) -> StructResult<bool> {
        let succ = self.succ()?;
        let pred = self.pred()?;
        if succ == 0 || pred == 0 {
            return Ok(false);
        }
        let space = self.0.space();
        MinNode::at(space, succ).set_pred(pred)?;
        MinNode::at(space, pred).set_succ(succ)?;
        self.set_succ(0)?;
        self.set_pred(0)?;
        Ok(true)
    }
}

impl<'a> Node<'a> {
    /// Sets type and priority; links and name are left alone.
    pub fn init(&self, kind: NodeType, pri: i8) -> StructResult<()> {
        self.set_kind(kind)?;
        self.set_pri(pri)
    }

    pub fn as_min(&self) -> MinNode<'a> {
        self.0.to()
    }

    pub fn succ(&self) -> StructResult<u32> {
        self.0.aptr::<Node>(&LN_SUCC).addr()
    }

    pub fn pred(&self) -> StructResult<u32> {
        self.0.aptr::<Node>(&LN_PRED).addr()
    }

    pub fn is_linked(&self) -> StructResult<bool> {
        self.as_min().is_linked()
    }

    pub fn kind_raw(&self) -> StructResult<u8> {
        self.0.scalar::<u8>(&LN_TYPE).get()
    }

    /// `None` for tags outside the known node types.
    pub fn kind(&self) -> StructResult<Option<NodeType>> {
        self.kind_raw().map(NodeType::from_raw)
    }

    pub fn set_kind(&self, kind: NodeType) -> StructResult<()> {
        self.0.scalar::<u8>(&LN_TYPE).set(kind.raw())
    }

    pub fn pri(&self) -> StructResult<i8> {
        self.0.scalar::<i8>(&LN_PRI).get()
    }

    pub fn set_pri(&self, pri: i8) -> StructResult<()> {
        self.0.scalar::<i8>(&LN_PRI).set(pri)
    }

    pub fn name_field(&self) -> CStrField<'a> {
        self.0.cstr(&LN_NAME)
    }

    pub fn name(&self) -> StructResult<Option<String>> {
        self.name_field().get()
    }

    pub fn remove(&self) -> StructResult<bool> {
        self.as_min().remove()
    }

    /// First node after this one whose name is `name`, stopping at the list's tail sentinel.
    ///
    /// Starting from a found node continues the search, so duplicate names can be enumerated.
    pub fn find_name_after(&self, name: &str) -> StructResult<Option<Node<'a>>> {
        find_name_from(self.0.space(), self.addr(), name)
    }
}

/// Walks successors of the node (or list header) at `start` looking for `name`.
pub(crate) fn find_name_from<'a>(
    space: Space<'a>,
    start: u32,
    name: &str,
) -> StructResult<Option<Node<'a>>> {
    let mut cur = MinNode::at(space, start).succ()?;
    for _ in 0..MAX_WALK {
        if cur == 0 {
            return Ok(None);
        }
        let node = Node::at(space, cur);
        let next = node.succ()?;
        if next == 0 {
            // `cur` is the tail sentinel.
            return Ok(None);
        }
        if node.name()?.as_deref() == Some(name) {
            return Ok(Some(node));
        }
        cur = next;
    }
    warn!(start = %Hex(start), "list walk did not terminate");
    Ok(None)
}

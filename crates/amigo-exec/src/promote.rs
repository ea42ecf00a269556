//! Type-tag driven reinterpretation of list nodes.

use amigo_astructs::{GuestStruct, Space, StructResult};

use crate::structs::{Library, Message, MsgPort, Node, NodeType, Process, Task};

/// A node viewed as the structure its `ln_Type` says it heads.
///
/// Every variant covers the same address as the node it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Promoted<'a> {
    Task(Task<'a>),
    Process(Process<'a>),
    Library(Library<'a>),
    Message(Message<'a>),
    MsgPort(MsgPort<'a>),
    /// Tag without a richer structure.
    Node(Node<'a>),
}

impl<'a> Promoted<'a> {
    pub fn addr(&self) -> u32 {
        match self {
            Promoted::Task(t) => t.addr(),
            Promoted::Process(p) => p.addr(),
            Promoted::Library(l) => l.addr(),
            Promoted::Message(m) => m.addr(),
            Promoted::MsgPort(p) => p.addr(),
            Promoted::Node(n) => n.addr(),
        }
    }

    pub fn node(&self) -> Node<'a> {
        Node::at(self.space(), self.addr())
    }

    fn space(&self) -> Space<'a> {
        match self {
            Promoted::Task(t) => t.view().space(),
            Promoted::Process(p) => p.view().space(),
            Promoted::Library(l) => l.view().space(),
            Promoted::Message(m) => m.view().space(),
            Promoted::MsgPort(p) => p.view().space(),
            Promoted::Node(n) => n.view().space(),
        }
    }
}

/// Reads `ln_Type` and returns the matching richer view at the same address.
pub fn promote(node: Node<'_>) -> StructResult<Promoted<'_>> {
    let view = node.view();
    Ok(match node.kind()? {
        Some(NodeType::Task) => Promoted::Task(view.to()),
        Some(NodeType::Process) => Promoted::Process(view.to()),
        Some(NodeType::Device | NodeType::Library) => Promoted::Library(view.to()),
        Some(NodeType::Message | NodeType::FreeMsg | NodeType::ReplyMsg) => {
            Promoted::Message(view.to())
        }
        Some(NodeType::MsgPort) => Promoted::MsgPort(view.to()),
        _ => Promoted::Node(node),
    })
}

impl<'a> Node<'a> {
    pub fn promote(&self) -> StructResult<Promoted<'a>> {
        promote(*self)
    }
}

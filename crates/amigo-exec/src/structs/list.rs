//! Sentinel lists.
//!
//! A list header doubles as two overlapping sentinel nodes: the head sentinel lives at the
//! header address (`lh_Head` is its successor, `lh_Tail` its predecessor) and the tail sentinel
//! at header + 4 (`lh_Tail` is its successor, `lh_TailPred` its predecessor). `lh_Tail` is
//! always 0, so a walk stops at the first node whose successor is null. An empty list has
//! `lh_Head` pointing at the tail sentinel and `lh_TailPred` pointing at the header.

use std::marker::PhantomData;

use amigo_astructs::{
    guest_struct, FieldDef, FieldType, GuestStruct, Space, StructDef, StructResult,
};
use amigo_machine::Hex;
use tracing::warn;

use super::node::{find_name_from, MinNode, Node, NodeType, MAX_WALK, MIN_NODE};
use super::aptr;

pub const LH_HEAD: FieldDef = FieldDef::new("lh_Head", 0, aptr("Node"));
pub const LH_TAIL: FieldDef = FieldDef::new("lh_Tail", 4, aptr("Node"));
pub const LH_TAIL_PRED: FieldDef = FieldDef::new("lh_TailPred", 8, aptr("Node"));
pub const LH_TYPE: FieldDef = FieldDef::new("lh_Type", 12, FieldType::U8);
pub const L_PAD: FieldDef = FieldDef::new("l_pad", 13, FieldType::U8);
pub const LH_HEAD_NODE: FieldDef =
    FieldDef::alias("lh_HeadNode", 0, FieldType::Struct(&MIN_NODE), "lh_Head");
pub const LH_TAIL_NODE: FieldDef =
    FieldDef::alias("lh_TailNode", 4, FieldType::Struct(&MIN_NODE), "lh_Tail");

pub const LIST: StructDef = StructDef::new(
    "List",
    14,
    &[
        LH_HEAD,
        LH_TAIL,
        LH_TAIL_PRED,
        LH_TYPE,
        L_PAD,
        LH_HEAD_NODE,
        LH_TAIL_NODE,
    ],
);

pub const MLH_HEAD: FieldDef = FieldDef::new("mlh_Head", 0, aptr("MinNode"));
pub const MLH_TAIL: FieldDef = FieldDef::new("mlh_Tail", 4, aptr("MinNode"));
pub const MLH_TAIL_PRED: FieldDef = FieldDef::new("mlh_TailPred", 8, aptr("MinNode"));

pub const MIN_LIST: StructDef =
    StructDef::new("MinList", 12, &[MLH_HEAD, MLH_TAIL, MLH_TAIL_PRED]);

guest_struct! {
    /// Doubly linked list of [`Node`]s with a type tag.
    pub struct List => LIST;
}

guest_struct! {
    /// Doubly linked list of [`MinNode`]s.
    pub struct MinList => MIN_LIST;
}

/// Address-level sentinel list operations shared by [`List`] and [`MinList`].
#[derive(Clone, Copy)]
struct Links<'a> {
    space: Space<'a>,
    head: u32,
}

impl<'a> Links<'a> {
    fn new(space: Space<'a>, header: u32) -> Self {
        Self {
            space,
            head: header,
        }
    }

    fn tail(&self) -> u32 {
        self.head + 4
    }

    fn node(&self, addr: u32) -> MinNode<'a> {
        MinNode::at(self.space, addr)
    }

    fn init(&self) -> StructResult<()> {
        let head = self.node(self.head);
        head.set_succ(self.tail())?;
        head.set_pred(0)?;
        self.node(self.tail()).set_pred(self.head)
    }

    fn is_empty(&self) -> StructResult<bool> {
        Ok(self.node(self.tail()).pred()? == self.head)
    }

    fn first(&self) -> StructResult<Option<u32>> {
        if self.is_empty()? {
            return Ok(None);
        }
        self.node(self.head).succ().map(Some)
    }

    fn last(&self) -> StructResult<Option<u32>> {
        if self.is_empty()? {
            return Ok(None);
        }
        self.node(self.tail()).pred().map(Some)
    }

    fn link_between(&self, pred: u32, node: u32, succ: u32) -> StructResult<()> {
        let n = self.node(node);
        n.set_succ(succ)?;
        n.set_pred(pred)?;
        self.node(pred).set_succ(node)?;
        self.node(succ).set_pred(node)
    }

    fn add_head(&self, node: u32) -> StructResult<()> {
        let first = self.node(self.head).succ()?;
        self.link_between(self.head, node, first)
    }

    fn add_tail(&self, node: u32) -> StructResult<()> {
        let last = self.node(self.tail()).pred()?;
        self.link_between(last, node, self.tail())
    }

    fn insert_after(&self, member: u32, node: u32) -> StructResult<()> {
        let succ = self.node(member).succ()?;
        self.link_between(member, node, succ)
    }

    fn insert_before(&self, member: u32, node: u32) -> StructResult<()> {
        let pred = self.node(member).pred()?;
        self.link_between(pred, node, member)
    }

    fn rem_head(&self) -> StructResult<Option<u32>> {
        let Some(first) = self.first()? else {
            return Ok(None);
        };
        self.node(first).remove()?;
        Ok(Some(first))
    }

    fn rem_tail(&self) -> StructResult<Option<u32>> {
        let Some(last) = self.last()? else {
            return Ok(None);
        };
        self.node(last).remove()?;
        Ok(Some(last))
    }

    fn iter<N: GuestStruct<'a>>(&self) -> ListIter<'a, N> {
        ListIter {
            space: self.space,
            cur: self.head,
            steps: 0,
            done: false,
            _node: PhantomData,
        }
    }
}

/// Walks list members from head to tail.
///
/// Yields an error (and then stops) if guest memory cannot be read.
pub struct ListIter<'a, N> {
    space: Space<'a>,
    cur: u32,
    steps: usize,
    done: bool,
    _node: PhantomData<N>,
}

impl<'a, N: GuestStruct<'a>> ListIter<'a, N> {
    fn step(&mut self) -> StructResult<Option<u32>> {
        let cand = MinNode::at(self.space, self.cur).succ()?;
        if cand == 0 || MinNode::at(self.space, cand).succ()? == 0 {
            return Ok(None);
        }
        self.cur = cand;
        Ok(Some(cand))
    }
}

impl<'a, N: GuestStruct<'a>> Iterator for ListIter<'a, N> {
    type Item = StructResult<N>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        self.steps += 1;
        if self.steps > MAX_WALK {
            warn!(at = %Hex(self.cur), "list walk did not terminate");
            self.done = true;
            return None;
        }
        match self.step() {
            Ok(Some(addr)) => Some(Ok(N::at(self.space, addr))),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

impl<'a> List<'a> {
    fn links(&self) -> Links<'a> {
        Links::new(self.0.space(), self.addr())
    }

    /// Makes the list empty and stores its type tag.
    pub fn init(&self, kind: NodeType) -> StructResult<()> {
        self.links().init()?;
        self.0.scalar::<u8>(&LH_TYPE).set(kind.raw())
    }

    pub fn kind(&self) -> StructResult<Option<NodeType>> {
        self.0.scalar::<u8>(&LH_TYPE).get().map(NodeType::from_raw)
    }

    pub fn is_empty(&self) -> StructResult<bool> {
        self.links().is_empty()
    }

    pub fn head(&self) -> StructResult<Option<Node<'a>>> {
        Ok(self.links().first()?.map(|a| Node::at(self.0.space(), a)))
    }

    pub fn tail(&self) -> StructResult<Option<Node<'a>>> {
        Ok(self.links().last()?.map(|a| Node::at(self.0.space(), a)))
    }

    pub fn add_head(&self, node: Node<'a>) -> StructResult<()> {
        self.links().add_head(node.addr())
    }

    pub fn add_tail(&self, node: Node<'a>) -> StructResult<()> {
        self.links().add_tail(node.addr())
    }

    /// Links `node` after `pred`, or at the head when `pred` is `None`.
    pub fn insert(&self, node: Node<'a>, pred: Option<Node<'a>>) -> StructResult<()> {
        match pred {
            Some(pred) => self.insert_after(pred, node),
            None => self.add_head(node),
        }
    }

    pub fn insert_after(&self, member: Node<'a>, node: Node<'a>) -> StructResult<()> {
        self.links().insert_after(member.addr(), node.addr())
    }

    pub fn insert_before(&self, member: Node<'a>, node: Node<'a>) -> StructResult<()> {
        self.links().insert_before(member.addr(), node.addr())
    }

    /// Unlinks `node`; `false` if it was not linked.
    pub fn remove(&self, node: Node<'a>) -> StructResult<bool> {
        node.remove()
    }

    pub fn rem_head(&self) -> StructResult<Option<Node<'a>>> {
        Ok(self.links().rem_head()?.map(|a| Node::at(self.0.space(), a)))
    }

    pub fn rem_tail(&self) -> StructResult<Option<Node<'a>>> {
        Ok(self.links().rem_tail()?.map(|a| Node::at(self.0.space(), a)))
    }

    /// Inserts `node` before the first member with a strictly lower priority, so members stay in
    /// descending priority order and equal priorities keep their arrival order.
    pub fn enqueue(&self, node: Node<'a>) -> StructResult<()> {
        let pri = node.pri()?;
        for member in self.iter() {
            let member = member?;
            if member.pri()? < pri {
                return self.insert_before(member, node);
            }
        }
        self.add_tail(node)
    }

    /// First member named `name`.
    pub fn find_name(&self, name: &str) -> StructResult<Option<Node<'a>>> {
        find_name_from(self.0.space(), self.addr(), name)
    }

    pub fn iter(&self) -> ListIter<'a, Node<'a>> {
        self.links().iter()
    }

    pub fn to_vec(&self) -> StructResult<Vec<Node<'a>>> {
        self.iter().collect()
    }

    pub fn len(&self) -> StructResult<usize> {
        self.iter().try_fold(0, |n, node| node.map(|_| n + 1))
    }
}

impl<'a> MinList<'a> {
    fn links(&self) -> Links<'a> {
        Links::new(self.0.space(), self.addr())
    }

    pub fn init(&self) -> StructResult<()> {
        self.links().init()
    }

    pub fn is_empty(&self) -> StructResult<bool> {
        self.links().is_empty()
    }

    pub fn head(&self) -> StructResult<Option<MinNode<'a>>> {
        Ok(self.links().first()?.map(|a| MinNode::at(self.0.space(), a)))
    }

    pub fn tail(&self) -> StructResult<Option<MinNode<'a>>> {
        Ok(self.links().last()?.map(|a| MinNode::at(self.0.space(), a)))
    }

    pub fn add_head(&self, node: MinNode<'a>) -> StructResult<()> {
        self.links().add_head(node.addr())
    }

    pub fn add_tail(&self, node: MinNode<'a>) -> StructResult<()> {
        self.links().add_tail(node.addr())
    }

    pub fn insert_after(&self, member: MinNode<'a>, node: MinNode<'a>) -> StructResult<()> {
        self.links().insert_after(member.addr(), node.addr())
    }

    pub fn insert_before(&self, member: MinNode<'a>, node: MinNode<'a>) -> StructResult<()> {
        self.links().insert_before(member.addr(), node.addr())
    }

    pub fn rem_head(&self) -> StructResult<Option<MinNode<'a>>> {
        Ok(self.links().rem_head()?.map(|a| MinNode::at(self.0.space(), a)))
    }

    pub fn rem_tail(&self) -> StructResult<Option<MinNode<'a>>> {
        Ok(self.links().rem_tail()?.map(|a| MinNode::at(self.0.space(), a)))
    }

    pub fn iter(&self) -> ListIter<'a, MinNode<'a>> {
        self.links().iter()
    }

    pub fn to_vec(&self) -> StructResult<Vec<MinNode<'a>>> {
        self.iter().collect()
    }

    pub fn len(&self) -> StructResult<usize> {
        self.iter().try_fold(0, |n, node| node.map(|_| n + 1))
    }
}

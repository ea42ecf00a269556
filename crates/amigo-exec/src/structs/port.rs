use amigo_astructs::{guest_struct, Aptr, FieldDef, FieldType, StructDef, StructResult};

use super::list::{List, LIST};
use super::node::{Node, NodeType, NODE};
use super::task::Task;
use super::aptr;

pub const MP_NODE: FieldDef = FieldDef::new("mp_Node", 0, FieldType::Struct(&NODE));
pub const MP_FLAGS: FieldDef = FieldDef::new("mp_Flags", 14, FieldType::U8);
pub const MP_SIG_BIT: FieldDef = FieldDef::new("mp_SigBit", 15, FieldType::U8);
pub const MP_SIG_TASK: FieldDef = FieldDef::new("mp_SigTask", 16, aptr("Task"));
pub const MP_MSG_LIST: FieldDef = FieldDef::new("mp_MsgList", 20, FieldType::Struct(&LIST));

pub const MSG_PORT: StructDef = StructDef::new(
    "MsgPort",
    34,
    &[MP_NODE, MP_FLAGS, MP_SIG_BIT, MP_SIG_TASK, MP_MSG_LIST],
);

pub const MN_NODE: FieldDef = FieldDef::new("mn_Node", 0, FieldType::Struct(&NODE));
pub const MN_REPLY_PORT: FieldDef = FieldDef::new("mn_ReplyPort", 14, aptr("MsgPort"));
pub const MN_LENGTH: FieldDef = FieldDef::new("mn_Length", 18, FieldType::U16);

pub const MESSAGE: StructDef =
    StructDef::new("Message", 20, &[MN_NODE, MN_REPLY_PORT, MN_LENGTH]);

/// Bits of `mp_Flags` selecting what happens when a message arrives.
pub const PF_ACTION: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PortAction {
    /// Signal `mp_SigTask` with `mp_SigBit`.
    Signal = 0,
    /// Cause a software interrupt.
    SoftInt = 1,
    /// Just queue the message.
    Ignore = 2,
}

impl PortAction {
    /// Decodes the action bits of `mp_Flags`; `None` for the undefined value 3.
    pub const fn from_flags(flags: u8) -> Option<Self> {
        match flags & PF_ACTION {
            0 => Some(PortAction::Signal),
            1 => Some(PortAction::SoftInt),
            2 => Some(PortAction::Ignore),
            _ => None,
        }
    }
}

guest_struct! {
    pub struct MsgPort => MSG_PORT;
}

guest_struct! {
    pub struct Message => MESSAGE;
}

impl<'a> MsgPort<'a> {
    /// Fresh, unnamed port signalling `sig_task` with `sig_bit`.
    pub fn init(&self, sig_bit: u8, sig_task: Option<Task<'a>>) -> StructResult<()> {
        self.node().init(NodeType::MsgPort, 0)?;
        self.set_action(PortAction::Signal)?;
        self.0.scalar::<u8>(&MP_SIG_BIT).set(sig_bit)?;
        self.sig_task().set(sig_task)?;
        self.msg_list().init(NodeType::Message)
    }

    pub fn node(&self) -> Node<'a> {
        self.0.embedded(&MP_NODE)
    }

    pub fn flags(&self) -> StructResult<u8> {
        self.0.scalar::<u8>(&MP_FLAGS).get()
    }

    pub fn action(&self) -> StructResult<Option<PortAction>> {
        self.flags().map(PortAction::from_flags)
    }

    /// Replaces the action bits, keeping the rest of `mp_Flags`.
    pub fn set_action(&self, action: PortAction) -> StructResult<()> {
        self.0
            .scalar::<u8>(&MP_FLAGS)
            .update(|flags| (flags & !PF_ACTION) | action as u8)
            .map(drop)
    }

    pub fn sig_bit(&self) -> StructResult<u8> {
        self.0.scalar::<u8>(&MP_SIG_BIT).get()
    }

    pub fn sig_task(&self) -> Aptr<'a, Task<'a>> {
        self.0.aptr(&MP_SIG_TASK)
    }

    pub fn msg_list(&self) -> List<'a> {
        self.0.embedded(&MP_MSG_LIST)
    }

    pub fn name(&self) -> StructResult<Option<String>> {
        self.node().name()
    }
}

impl<'a> Message<'a> {
    /// Sets the reply port and `mn_Length` to the size of a bare message.
    pub fn init(&self, reply_port: Option<MsgPort<'a>>) -> StructResult<()> {
        self.reply_port().set(reply_port)?;
        self.set_length(MESSAGE.size as u16)
    }

    pub fn node(&self) -> Node<'a> {
        self.0.embedded(&MN_NODE)
    }

    pub fn reply_port(&self) -> Aptr<'a, MsgPort<'a>> {
        self.0.aptr(&MN_REPLY_PORT)
    }

    pub fn length(&self) -> StructResult<u16> {
        self.0.scalar::<u16>(&MN_LENGTH).get()
    }

    pub fn set_length(&self, len: u16) -> StructResult<()> {
        self.0.scalar::<u16>(&MN_LENGTH).set(len)
    }

    pub fn kind(&self) -> StructResult<Option<NodeType>> {
        self.node().kind()
    }
}

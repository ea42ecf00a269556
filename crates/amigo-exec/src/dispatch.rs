//! Register-level entry points: library vector offset to handler, arguments from the 68k ABI
//! registers, result to `D0`.

use std::fmt;

use amigo_astructs::{Aptr, CStrField, GuestStruct, Scalar};
use amigo_machine::Reg;
use tracing::debug;

use crate::error::{ExecError, ExecResult};
use crate::exec::TaskContext;
use crate::structs::{List, Message, MsgPort, Node, Task};

macro_rules! exec_functions {
    ($($name:ident = $offset:literal,)*) => {
        /// The exec library functions this layer implements.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum ExecFunction {
            $($name,)*
        }

        impl ExecFunction {
            pub const ALL: &'static [ExecFunction] = &[$(ExecFunction::$name,)*];

            /// Negative offset of the function's jump vector from the library base.
            pub const fn offset(self) -> i32 {
                match self {
                    $(ExecFunction::$name => $offset,)*
                }
            }

            pub const fn name(self) -> &'static str {
                match self {
                    $(ExecFunction::$name => stringify!($name),)*
                }
            }
        }
    };
}

exec_functions! {
    Forbid = -132,
    Permit = -138,
    Insert = -234,
    AddHead = -240,
    AddTail = -246,
    Remove = -252,
    RemHead = -258,
    RemTail = -264,
    Enqueue = -270,
    FindName = -276,
    FindTask = -294,
    SetSignal = -306,
    Wait = -318,
    Signal = -324,
    AllocSignal = -330,
    FreeSignal = -336,
    AddPort = -354,
    RemPort = -360,
    PutMsg = -366,
    GetMsg = -372,
    ReplyMsg = -378,
    WaitPort = -384,
    FindPort = -390,
    CreateMsgPort = -666,
    DeleteMsgPort = -672,
}

impl ExecFunction {
    pub fn from_offset(offset: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|f| f.offset() == offset)
    }
}

impl fmt::Display for ExecFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl<'e> TaskContext<'e> {
    /// Runs the exec function at library offset `offset` with arguments taken from the CPU
    /// registers, writing its result (if it has one) to `D0`.
    pub fn dispatch(&self, offset: i32) -> ExecResult<()> {
        let function =
            ExecFunction::from_offset(offset).ok_or(ExecError::UnknownFunction { offset })?;
        debug!(task = self.label(), %function, offset, "dispatch");

        let space = self.space();
        let reg = |reg: Reg| Scalar::<u32>::in_register(space, reg).get();
        let result = |value: u32| -> ExecResult<()> {
            Scalar::<u32>::in_register(space, Reg::D0).set(value)?;
            Ok(())
        };
        let addr_of = |found: Option<u32>| found.unwrap_or(0);

        match function {
            ExecFunction::Forbid => self.forbid()?,
            ExecFunction::Permit => self.permit()?,
            ExecFunction::Insert => {
                let list = self.required::<List>(function, Reg::A0)?;
                let node = self.required::<Node>(function, Reg::A1)?;
                let pred = Aptr::<Node>::in_register(space, Reg::A2).get()?;
                self.insert(list, node, pred)?;
            }
            ExecFunction::AddHead => {
                let list = self.required::<List>(function, Reg::A0)?;
                self.add_head(list, self.required(function, Reg::A1)?)?;
            }
            ExecFunction::AddTail => {
                let list = self.required::<List>(function, Reg::A0)?;
                self.add_tail(list, self.required(function, Reg::A1)?)?;
            }
            ExecFunction::Remove => {
                self.remove(self.required(function, Reg::A1)?)?;
            }
            ExecFunction::RemHead => {
                let node = self.rem_head(self.required(function, Reg::A0)?)?;
                result(addr_of(node.map(|n| n.addr())))?;
            }
            ExecFunction::RemTail => {
                let node = self.rem_tail(self.required(function, Reg::A0)?)?;
                result(addr_of(node.map(|n| n.addr())))?;
            }
            ExecFunction::Enqueue => {
                let list = self.required::<List>(function, Reg::A0)?;
                self.enqueue(list, self.required(function, Reg::A1)?)?;
            }
            ExecFunction::FindName => {
                let start = self.required::<Node>(function, Reg::A0)?;
                let name = self.required_str(function, Reg::A1)?;
                let node = self.find_name(start.addr(), &name)?;
                result(addr_of(node.map(|n| n.addr())))?;
            }
            ExecFunction::FindTask => {
                let name = CStrField::in_register(space, Reg::A1).get()?;
                let task = self.find_task(name.as_deref())?;
                result(addr_of(task.map(|t| t.addr())))?;
            }
            ExecFunction::SetSignal => {
                let old = self.set_signal(reg(Reg::D0)?, reg(Reg::D1)?)?;
                result(old)?;
            }
            ExecFunction::Wait => {
                let got = self.wait(reg(Reg::D0)?)?;
                result(got)?;
            }
            ExecFunction::Signal => {
                let task = self.required::<Task>(function, Reg::A1)?;
                self.signal(task, reg(Reg::D0)?)?;
            }
            ExecFunction::AllocSignal => {
                let requested = Scalar::<i8>::in_register(space, Reg::D0).get()?;
                let bit = self.alloc_signal(i32::from(requested))?;
                result(bit as u32)?;
            }
            ExecFunction::FreeSignal => {
                let bit = Scalar::<i32>::in_register(space, Reg::D0).get()?;
                self.free_signal(bit)?;
            }
            ExecFunction::AddPort => {
                self.add_port(self.required(function, Reg::A1)?)?;
            }
            ExecFunction::RemPort => {
                self.rem_port(self.required(function, Reg::A1)?)?;
            }
            ExecFunction::PutMsg => {
                let port = self.required::<MsgPort>(function, Reg::A0)?;
                self.put_msg(port, self.required(function, Reg::A1)?)?;
            }
            ExecFunction::GetMsg => {
                let msg = self.get_msg(self.required(function, Reg::A0)?)?;
                result(addr_of(msg.map(|m| m.addr())))?;
            }
            ExecFunction::ReplyMsg => {
                self.reply_msg(self.required::<Message>(function, Reg::A1)?)?;
            }
            ExecFunction::WaitPort => {
                let msg = self.wait_port(self.required(function, Reg::A0)?)?;
                result(addr_of(msg.map(|m| m.addr())))?;
            }
            ExecFunction::FindPort => {
                let name = self.required_str(function, Reg::A1)?;
                let port = self.find_port(&name)?;
                result(addr_of(port.map(|p| p.addr())))?;
            }
            ExecFunction::CreateMsgPort => {
                let port = self.create_msg_port()?;
                result(addr_of(port.map(|p| p.addr())))?;
            }
            ExecFunction::DeleteMsgPort => {
                // DeleteMsgPort(NULL) is a no-op.
                if let Some(port) = Aptr::<MsgPort>::in_register(space, Reg::A0).get()? {
                    self.delete_msg_port(port)?;
                }
            }
        }
        Ok(())
    }

    /// Structure pointed to by `reg`; a null pointer is a guest programming error.
    fn required<T: GuestStruct<'e>>(&self, function: ExecFunction, reg: Reg) -> ExecResult<T> {
        Aptr::<T>::in_register(self.space(), reg)
            .get()?
            .ok_or(ExecError::NullArgument {
                function: function.name(),
                reg,
            })
    }

    fn required_str(&self, function: ExecFunction, reg: Reg) -> ExecResult<String> {
        let field = CStrField::in_register(self.space(), reg);
        match field.get()? {
            Some(name) => Ok(name),
            None => Err(ExecError::NullArgument {
                function: function.name(),
                reg,
            }),
        }
    }
}

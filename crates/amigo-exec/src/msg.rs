//! Message ports and messages.

use amigo_astructs::GuestStruct;
use amigo_machine::Hex;
use tracing::{debug, error, info, warn, Level};

use crate::error::ExecResult;
use crate::exec::TaskContext;
use crate::signal::NO_SIGNAL;
use crate::structs::{Message, MsgPort, NodeType, PortAction};

impl<'e> TaskContext<'e> {
    /// Allocates an anonymous port signalling the calling task on a fresh signal bit.
    ///
    /// `None` when no signal bit or no memory is left.
    pub fn create_msg_port(&self) -> ExecResult<Option<MsgPort<'e>>> {
        let bit = self.alloc_signal_quiet(NO_SIGNAL)?;
        if bit == NO_SIGNAL {
            error!(task = self.label(), "CreateMsgPort: no free signal bit");
            return Ok(None);
        }

        let exec = self.exec();
        let Some(port) = MsgPort::alloc(self.space(), exec.allocator(), "exec_port")? else {
            error!(task = self.label(), "CreateMsgPort: out of memory");
            self.free_signal_quiet(bit)?;
            return Ok(None);
        };
        port.init(bit as u8, self.current_task())?;
        if tracing::enabled!(Level::DEBUG) {
            port.view().dump()?;
        }
        info!(task = self.label(), port = %Hex(port.addr()), signal = bit, "CreateMsgPort");
        Ok(Some(port))
    }

    /// Frees the port's signal bit, then the port. Queued messages are the caller's problem.
    pub fn delete_msg_port(&self, port: MsgPort<'e>) -> ExecResult<()> {
        if port.node().is_linked()? {
            warn!(port = %Hex(port.addr()), "deleting a port that is still listed");
            port.node().remove()?;
        }
        let bit = port.sig_bit()?;
        self.free_signal_quiet(i32::from(bit))?;
        port.free(self.exec().allocator());
        info!(task = self.label(), port = %Hex(port.addr()), signal = bit, "DeleteMsgPort");
        Ok(())
    }

    pub fn put_msg(&self, port: MsgPort<'e>, msg: Message<'e>) -> ExecResult<()> {
        self.put(port, msg, NodeType::Message)?;
        info!(task = self.label(), port = %Hex(port.addr()), msg = %Hex(msg.addr()), "PutMsg");
        Ok(())
    }

    /// Tags `msg`, queues it at the tail of `port` and notifies per the port's action.
    ///
    /// An `NT_FREEMSG` message is terminal: it is logged and never queued again.
    fn put(&self, port: MsgPort<'e>, msg: Message<'e>, kind: NodeType) -> ExecResult<()> {
        if msg.kind()? == Some(NodeType::FreeMsg) {
            error!(
                task = self.label(),
                port = %Hex(port.addr()),
                msg = %Hex(msg.addr()),
                "refusing to queue a freed message"
            );
            return Ok(());
        }
        msg.node().set_kind(kind)?;
        port.msg_list().add_tail(msg.node())?;

        match port.action()? {
            Some(PortAction::Signal) => {
                let bit = port.sig_bit()?;
                let mask = 1u32 << (bit & 31);
                match port.sig_task().get()? {
                    Some(task) => {
                        self.exec().post_signals(task.addr(), mask)?;
                    }
                    None if self.current_task().is_none() => {
                        self.exec().fallback().with(|masks| masks.post(mask));
                    }
                    None => {
                        error!(port = %Hex(port.addr()), signal = bit, "port has no task to signal");
                    }
                }
                debug!(port = %Hex(port.addr()), msg = %Hex(msg.addr()), signal = bit, "message signalled");
            }
            Some(PortAction::SoftInt) => {
                error!(port = %Hex(port.addr()), "soft interrupt delivery is not supported");
            }
            Some(PortAction::Ignore) => {
                debug!(port = %Hex(port.addr()), msg = %Hex(msg.addr()), "message queued silently");
            }
            None => {
                let flags = port.flags()?;
                error!(port = %Hex(port.addr()), flags, "unknown port action");
            }
        }
        Ok(())
    }

    /// Removes and returns the head message; `None` for an empty port. Never blocks.
    pub fn get_msg(&self, port: MsgPort<'e>) -> ExecResult<Option<Message<'e>>> {
        let msg = port.msg_list().rem_head()?.map(|node| node.view().to::<Message>());
        info!(
            task = self.label(),
            port = %Hex(port.addr()),
            msg = %Hex(msg.map_or(0, |m| m.addr())),
            "GetMsg"
        );
        Ok(msg)
    }

    /// Waits on the port's signal until a message is queued and returns the head without
    /// removing it.
    ///
    /// Outside the scheduler nothing can arrive while waiting, so an empty port yields `None`.
    pub fn wait_port(&self, port: MsgPort<'e>) -> ExecResult<Option<Message<'e>>> {
        info!(task = self.label(), port = %Hex(port.addr()), "WaitPort");
        let mask = 1u32 << (port.sig_bit()? & 31);
        loop {
            if let Some(head) = port.msg_list().head()? {
                let msg = head.view().to::<Message>();
                info!(task = self.label(), port = %Hex(port.addr()), msg = %Hex(msg.addr()), "WaitPort done");
                return Ok(Some(msg));
            }
            if self.current_task().is_none() {
                warn!(port = %Hex(port.addr()), "WaitPort on an empty port outside any task");
                return Ok(None);
            }
            self.wait_quiet(mask)?;
        }
    }

    /// Sends `msg` back to its reply port tagged `NT_REPLYMSG`, or marks it `NT_FREEMSG` when it
    /// has none.
    pub fn reply_msg(&self, msg: Message<'e>) -> ExecResult<()> {
        match msg.reply_port().get()? {
            Some(port) => {
                self.put(port, msg, NodeType::ReplyMsg)?;
                info!(task = self.label(), msg = %Hex(msg.addr()), port = %Hex(port.addr()), "ReplyMsg");
            }
            None => {
                msg.node().set_kind(NodeType::FreeMsg)?;
                info!(task = self.label(), msg = %Hex(msg.addr()), "ReplyMsg without reply port");
            }
        }
        Ok(())
    }

    /// Lists `port` in the named-port directory, by priority.
    pub fn add_port(&self, port: MsgPort<'e>) -> ExecResult<()> {
        port.node().set_kind(NodeType::MsgPort)?;
        self.exec().port_list().enqueue(port.node())?;
        let name = port.name()?;
        info!(task = self.label(), port = %Hex(port.addr()), name = ?name, "AddPort");
        Ok(())
    }

    pub fn rem_port(&self, port: MsgPort<'e>) -> ExecResult<bool> {
        let removed = port.node().remove()?;
        if !removed {
            warn!(port = %Hex(port.addr()), "removing a port that is not listed");
        }
        info!(task = self.label(), port = %Hex(port.addr()), removed, "RemPort");
        Ok(removed)
    }

    pub fn find_port(&self, name: &str) -> ExecResult<Option<MsgPort<'e>>> {
        let port = self
            .exec()
            .port_list()
            .find_name(name)?
            .map(|node| node.view().to::<MsgPort>());
        info!(
            task = self.label(),
            name,
            port = %Hex(port.map_or(0, |p| p.addr())),
            "FindPort"
        );
        Ok(port)
    }
}

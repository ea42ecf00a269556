use std::fmt;

use amigo_astructs::{GuestStruct, Space};
use amigo_machine::{Allocator, Hex, Machine};
use tracing::{info, warn};

use crate::config::ExecConfig;
use crate::error::{ExecError, ExecResult};
use crate::sched::RunQueue;
use crate::signal::{FallbackSignals, SignalMasks};
use crate::structs::{
    AttnFlags, ExecBase, List, Node, NodeType, Task, ABS_EXEC_BASE, EXEC_BASE,
};

/// Name of the library node heading the base.
pub const EXEC_NAME: &str = "exec.library";

/// The exec library instance of one emulation session.
///
/// Owns the machine handles, the scheduler state and the out-of-task signal registry. The
/// system lists (named ports, ready tasks, waiting tasks) live in the guest-resident
/// [`ExecBase`], whose address is also stored at [`ABS_EXEC_BASE`].
#[derive(Debug)]
pub struct ExecLib {
    machine: Machine,
    config: ExecConfig,
    fallback: FallbackSignals,
    base: u32,
    pub(crate) queue: RunQueue,
}

impl ExecLib {
    pub fn new(machine: Machine, config: ExecConfig) -> ExecResult<Self> {
        let space = Space::new(&*machine.mem).with_allocator(&*machine.alloc);
        let base = ExecBase::alloc(space, &*machine.alloc, "exec_base")?
            .ok_or(ExecError::OutOfMemory { what: "exec base" })?;
        if let Err(err) = init_base(base, &machine, &config) {
            base.library().node().name_field().free_str(&*machine.alloc)?;
            base.free(&*machine.alloc);
            return Err(err);
        }
        info!(
            base = %Hex(base.addr()),
            version = config.version,
            revision = config.revision,
            "exec base ready"
        );

        let base = base.addr();
        Ok(Self {
            fallback: FallbackSignals::new(config.reserved_signals),
            machine,
            config,
            base,
            queue: RunQueue::default(),
        })
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn config(&self) -> &ExecConfig {
        &self.config
    }

    /// Guest memory plus the register file, for memory- and register-resident views.
    pub fn space(&self) -> Space<'_> {
        Space::with_cpu(&*self.machine.mem, &*self.machine.cpu)
            .with_allocator(&*self.machine.alloc)
    }

    pub fn allocator(&self) -> &dyn Allocator {
        &*self.machine.alloc
    }

    /// Registry shared by every call made outside a scheduled task.
    pub fn fallback(&self) -> &FallbackSignals {
        &self.fallback
    }

    /// `SysBase`.
    pub fn base(&self) -> ExecBase<'_> {
        ExecBase::at(self.space(), self.base)
    }

    /// The named-port directory.
    pub fn port_list(&self) -> List<'_> {
        self.base().port_list()
    }

    pub fn task_ready(&self) -> List<'_> {
        self.base().task_ready()
    }

    pub fn task_wait(&self) -> List<'_> {
        self.base().task_wait()
    }

    /// A context with no current task. Signal operations use the fallback registry.
    pub fn context(&self) -> TaskContext<'_> {
        TaskContext {
            exec: self,
            task: None,
        }
    }
}

/// Fills in a zeroed base: library header, system lists, nesting counters, and `SysBase` at
/// [`ABS_EXEC_BASE`].
fn init_base(base: ExecBase<'_>, machine: &Machine, config: &ExecConfig) -> ExecResult<()> {
    let lib = base.library();
    lib.init(NodeType::Library, config.version, config.revision)?;
    lib.pos_size().set(EXEC_BASE.size as u16)?;
    lib.node()
        .name_field()
        .alloc_str(&*machine.alloc, EXEC_NAME)?
        .ok_or(ExecError::OutOfMemory { what: "exec name" })?;
    base.soft_ver().set(config.revision)?;
    let ram = u32::try_from(machine.mem.size()).unwrap_or(u32::MAX);
    base.max_loc_mem().set(ram)?;
    base.attn_flags().set(AttnFlags::from_bits_retain(config.attn_flags))?;
    base.id_nest_cnt().set(-1)?;
    base.td_nest_cnt().set(-1)?;
    base.task_sig_alloc().set(config.reserved_signals)?;

    base.mem_list().init(NodeType::Memory)?;
    base.resource_list().init(NodeType::Resource)?;
    base.device_list().init(NodeType::Device)?;
    base.intr_list().init(NodeType::Interrupt)?;
    base.lib_list().init(NodeType::Library)?;
    base.port_list().init(NodeType::MsgPort)?;
    base.task_ready().init(NodeType::Task)?;
    base.task_wait().init(NodeType::Task)?;
    base.semaphore_list().init(NodeType::Semaphore)?;
    base.mem_handlers().init()?;
    base.lib_list().enqueue(lib.node())?;

    machine.mem.write_u32(ABS_EXEC_BASE, base.addr())?;
    Ok(())
}

#[derive(Debug, Clone)]
pub(crate) struct Current {
    pub(crate) id: usize,
    pub(crate) addr: u32,
    pub(crate) name: String,
}

/// The caller of an exec function: the library plus the task making the call, if any.
pub struct TaskContext<'e> {
    pub(crate) exec: &'e ExecLib,
    pub(crate) task: Option<Current>,
}

impl fmt::Debug for TaskContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskContext")
            .field("task", &self.label())
            .finish_non_exhaustive()
    }
}

impl<'e> TaskContext<'e> {
    pub(crate) fn for_task(exec: &'e ExecLib, id: usize, addr: u32, name: &str) -> Self {
        Self {
            exec,
            task: Some(Current {
                id,
                addr,
                name: name.to_owned(),
            }),
        }
    }

    pub fn exec(&self) -> &'e ExecLib {
        self.exec
    }

    pub fn space(&self) -> Space<'e> {
        self.exec.space()
    }

    /// The calling task's guest structure; `None` outside the scheduler.
    pub fn current_task(&self) -> Option<Task<'e>> {
        self.task.as_ref().map(|cur| Task::at(self.space(), cur.addr))
    }

    pub(crate) fn label(&self) -> &str {
        self.task.as_ref().map_or("-", |cur| cur.name.as_str())
    }

    fn with_signals<R>(&self, f: impl FnOnce(&mut SignalMasks) -> R) -> ExecResult<R> {
        match &self.task {
            Some(cur) => self.exec.task_signals(cur.addr, f),
            None => Ok(self.exec.fallback.with(f)),
        }
    }

    /// Allocates signal `requested` (or the lowest free one for -1); -1 when none is available.
    pub fn alloc_signal(&self, requested: i32) -> ExecResult<i32> {
        let bit = self.alloc_signal_quiet(requested)?;
        info!(task = self.label(), requested, signal = bit, "AllocSignal");
        Ok(bit)
    }

    pub(crate) fn alloc_signal_quiet(&self, requested: i32) -> ExecResult<i32> {
        self.with_signals(|masks| masks.alloc(requested))
    }

    /// Returns `false` (and logs) if `bit` was not allocated.
    pub fn free_signal(&self, bit: i32) -> ExecResult<bool> {
        let freed = self.free_signal_quiet(bit)?;
        info!(task = self.label(), signal = bit, freed, "FreeSignal");
        Ok(freed)
    }

    pub(crate) fn free_signal_quiet(&self, bit: i32) -> ExecResult<bool> {
        let freed = self.with_signals(|masks| masks.free(bit))?;
        if !freed {
            warn!(task = self.label(), signal = bit, "freeing a signal that is not allocated");
        }
        Ok(freed)
    }

    /// Replaces the pending bits selected by `mask`; returns the previous pending mask.
    pub fn set_signal(&self, new: u32, mask: u32) -> ExecResult<u32> {
        let old = self.with_signals(|masks| masks.set(new, mask))?;
        info!(task = self.label(), new = %Hex(new), mask = %Hex(mask), old = %Hex(old), "SetSignal");
        Ok(old)
    }

    /// Posts `mask` to `task`, waking it if it waits on one of the bits.
    pub fn signal(&self, task: Task<'e>, mask: u32) -> ExecResult<()> {
        let delivered = self.exec.post_signals(task.addr(), mask)?;
        info!(
            task = self.label(),
            to = %Hex(task.addr()),
            mask = %Hex(mask),
            delivered = %Hex(delivered),
            "Signal"
        );
        Ok(())
    }

    /// Blocks until a bit of `mask` is pending, then consumes and returns the pending subset.
    ///
    /// Outside the scheduler this never blocks and may return 0.
    pub fn wait(&self, mask: u32) -> ExecResult<u32> {
        info!(task = self.label(), mask = %Hex(mask), "Wait");
        let got = self.wait_quiet(mask)?;
        info!(task = self.label(), mask = %Hex(mask), got = %Hex(got), "Wait done");
        Ok(got)
    }

    pub(crate) fn wait_quiet(&self, mask: u32) -> ExecResult<u32> {
        match &self.task {
            Some(cur) => self.exec.wait_signals(cur.id, mask),
            None => {
                if self.exec.fallback.forbid_count() > 0 {
                    return Err(ExecError::WaitWhileForbidden {
                        task: self.label().to_owned(),
                    });
                }
                Ok(self.exec.fallback.with(|masks| masks.take(mask)))
            }
        }
    }

    pub fn forbid(&self) -> ExecResult<()> {
        let depth = match &self.task {
            Some(cur) => self.exec.forbid_task(cur.id)?,
            None => self.exec.fallback.forbid(),
        };
        info!(task = self.label(), depth, "Forbid");
        Ok(())
    }

    pub fn permit(&self) -> ExecResult<()> {
        let depth = match &self.task {
            Some(cur) => self.exec.permit_task(cur.id)?,
            None => {
                if self.exec.fallback.forbid_count() == 0 {
                    warn!(task = self.label(), "Permit without Forbid");
                }
                self.exec.fallback.permit()
            }
        };
        info!(task = self.label(), depth, "Permit");
        Ok(())
    }

    /// The calling task for `None`, otherwise the first scheduled task named `name`.
    pub fn find_task(&self, name: Option<&str>) -> ExecResult<Option<Task<'e>>> {
        let found = match name {
            None => self.current_task(),
            Some(name) => self.exec.find_task(name)?,
        };
        info!(
            task = self.label(),
            name = ?name,
            found = %Hex(found.map_or(0, |t| t.addr())),
            "FindTask"
        );
        Ok(found)
    }

    pub fn add_head(&self, list: List<'e>, node: Node<'e>) -> ExecResult<()> {
        list.add_head(node)?;
        info!(task = self.label(), list = %Hex(list.addr()), node = %Hex(node.addr()), "AddHead");
        Ok(())
    }

    pub fn add_tail(&self, list: List<'e>, node: Node<'e>) -> ExecResult<()> {
        list.add_tail(node)?;
        info!(task = self.label(), list = %Hex(list.addr()), node = %Hex(node.addr()), "AddTail");
        Ok(())
    }

    /// Links `node` after `pred`, or at the head for `None`.
    pub fn insert(&self, list: List<'e>, node: Node<'e>, pred: Option<Node<'e>>) -> ExecResult<()> {
        list.insert(node, pred)?;
        info!(
            task = self.label(),
            list = %Hex(list.addr()),
            node = %Hex(node.addr()),
            pred = %Hex(pred.map_or(0, |p| p.addr())),
            "Insert"
        );
        Ok(())
    }

    /// Unlinks `node`; an unlinked node is logged and left alone.
    pub fn remove(&self, node: Node<'e>) -> ExecResult<bool> {
        let removed = node.remove()?;
        if !removed {
            warn!(task = self.label(), node = %Hex(node.addr()), "removing a node that is not linked");
        }
        info!(task = self.label(), node = %Hex(node.addr()), removed, "Remove");
        Ok(removed)
    }

    pub fn rem_head(&self, list: List<'e>) -> ExecResult<Option<Node<'e>>> {
        let node = list.rem_head()?;
        info!(
            task = self.label(),
            list = %Hex(list.addr()),
            node = %Hex(node.map_or(0, |n| n.addr())),
            "RemHead"
        );
        Ok(node)
    }

    pub fn rem_tail(&self, list: List<'e>) -> ExecResult<Option<Node<'e>>> {
        let node = list.rem_tail()?;
        info!(
            task = self.label(),
            list = %Hex(list.addr()),
            node = %Hex(node.map_or(0, |n| n.addr())),
            "RemTail"
        );
        Ok(node)
    }

    pub fn enqueue(&self, list: List<'e>, node: Node<'e>) -> ExecResult<()> {
        list.enqueue(node)?;
        let pri = node.pri()?;
        info!(
            task = self.label(),
            list = %Hex(list.addr()),
            node = %Hex(node.addr()),
            pri,
            "Enqueue"
        );
        Ok(())
    }

    /// Searches the members following `start`, which is either a list header or a member
    /// returned by an earlier search.
    pub fn find_name(&self, start: u32, name: &str) -> ExecResult<Option<Node<'e>>> {
        let found = Node::at(self.space(), start).find_name_after(name)?;
        info!(
            task = self.label(),
            start = %Hex(start),
            name,
            found = %Hex(found.map_or(0, |n| n.addr())),
            "FindName"
        );
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use amigo_machine::MachineConfig;

    use super::*;

    fn exec() -> ExecLib {
        let machine = Machine::new(&MachineConfig::default()).unwrap();
        ExecLib::new(machine, ExecConfig::default()).unwrap()
    }

    fn named_node<'e>(exec: &'e ExecLib, name: &str, pri: i8) -> Node<'e> {
        let node = Node::alloc(exec.space(), exec.allocator(), "node")
            .unwrap()
            .unwrap();
        node.set_pri(pri).unwrap();
        node.name_field().alloc_str(exec.allocator(), name).unwrap();
        node
    }

    #[test]
    fn system_lists_start_empty_with_their_types() {
        let exec = exec();
        assert_eq!(exec.port_list().kind().unwrap(), Some(NodeType::MsgPort));
        assert_eq!(exec.task_ready().kind().unwrap(), Some(NodeType::Task));
        assert!(exec.port_list().is_empty().unwrap());
        assert!(exec.task_wait().is_empty().unwrap());

        let base = exec.base();
        assert_eq!(base.mem_list().kind().unwrap(), Some(NodeType::Memory));
        assert_eq!(base.device_list().kind().unwrap(), Some(NodeType::Device));
        assert_eq!(base.semaphore_list().kind().unwrap(), Some(NodeType::Semaphore));
        assert!(base.resource_list().is_empty().unwrap());
        assert!(base.intr_list().is_empty().unwrap());
        assert!(base.mem_handlers().is_empty().unwrap());
    }

    #[test]
    fn sys_base_describes_the_library() {
        let exec = exec();
        let base = exec.base();
        let mem = &exec.machine().mem;

        assert_eq!(mem.read_u32(ABS_EXEC_BASE).unwrap(), base.addr());
        // Guest code reaches the port list through SysBase + 0x188.
        assert_eq!(
            exec.port_list().addr(),
            mem.read_u32(ABS_EXEC_BASE).unwrap() + 0x188
        );

        let lib = base.library();
        assert_eq!(lib.node().kind().unwrap(), Some(NodeType::Library));
        assert_eq!(lib.node().name().unwrap().as_deref(), Some(EXEC_NAME));
        assert_eq!(lib.version().unwrap(), 40);
        assert_eq!(lib.pos_size().get().unwrap(), 632);
        assert_eq!(base.attn_flags().get().unwrap(), AttnFlags::empty());
        assert_eq!(base.max_loc_mem().get().unwrap(), 0x10_0000);
        assert_eq!(base.td_nest_cnt().get().unwrap(), -1);
        assert_eq!(base.task_sig_alloc().get().unwrap(), 0xFFFF);
        assert_eq!(base.this_task().get().unwrap(), None);
        assert_eq!(
            base.lib_list().find_name(EXEC_NAME).unwrap(),
            Some(lib.node())
        );
    }

    #[test]
    fn base_takes_version_and_cpu_flags_from_config() {
        let machine = Machine::new(&MachineConfig::default()).unwrap();
        let config = ExecConfig {
            version: 45,
            revision: 20,
            attn_flags: 0x0007,
            ..ExecConfig::default()
        };
        let exec = ExecLib::new(machine, config).unwrap();
        let base = exec.base();
        assert_eq!(base.library().version().unwrap(), 45);
        assert_eq!(base.library().revision().unwrap(), 20);
        assert_eq!(base.soft_ver().get().unwrap(), 20);
        assert!(base
            .attn_flags()
            .contains(AttnFlags::M68010 | AttnFlags::M68020 | AttnFlags::M68030)
            .unwrap());
    }

    #[test]
    fn degraded_signals_use_the_fallback_registry() {
        let exec = exec();
        let ctx = exec.context();
        assert_eq!(ctx.current_task(), None);

        let bit = ctx.alloc_signal(-1).unwrap();
        assert_eq!(bit, 16);
        assert_eq!(ctx.alloc_signal(bit).unwrap(), -1);

        assert_eq!(ctx.set_signal(1 << bit, 1 << bit).unwrap(), 0);
        assert_eq!(exec.fallback().masks().recvd, 1 << bit);
        assert_eq!(ctx.set_signal(0, 0).unwrap(), 1 << bit);

        // Never blocks: consumes what is pending, then returns 0.
        assert_eq!(ctx.wait(1 << bit).unwrap(), 1 << bit);
        assert_eq!(ctx.wait(1 << bit).unwrap(), 0);

        assert!(ctx.free_signal(bit).unwrap());
        assert!(!ctx.free_signal(bit).unwrap());
        assert!(!ctx.free_signal(-1).unwrap());
    }

    #[test]
    fn degraded_wait_inside_forbid_is_an_error() {
        let exec = exec();
        let ctx = exec.context();
        ctx.forbid().unwrap();
        assert!(matches!(
            ctx.wait(1),
            Err(ExecError::WaitWhileForbidden { .. })
        ));
        ctx.permit().unwrap();
        ctx.permit().unwrap();
        assert_eq!(ctx.wait(1).unwrap(), 0);
    }

    #[test]
    fn signal_reaches_an_unscheduled_task_struct() {
        let exec = exec();
        let ctx = exec.context();
        let task = Task::alloc(exec.space(), exec.allocator(), "task")
            .unwrap()
            .unwrap();
        task.sig_alloc().set(0x0003_0000).unwrap();

        ctx.signal(task, 0x0001_0001).unwrap();
        assert_eq!(task.sig_recvd().get().unwrap(), 0x0001_0000);
    }

    #[test]
    fn list_handlers() {
        let exec = exec();
        let ctx = exec.context();
        let list = List::alloc(exec.space(), exec.allocator(), "list")
            .unwrap()
            .unwrap();
        list.init(NodeType::Unknown).unwrap();

        let a = named_node(&exec, "a", 0);
        let b = named_node(&exec, "b", 5);
        let c = named_node(&exec, "c", 0);
        ctx.add_tail(list, a).unwrap();
        ctx.enqueue(list, b).unwrap();
        ctx.insert(list, c, Some(a)).unwrap();
        assert_eq!(list.to_vec().unwrap(), [b, a, c]);

        assert_eq!(ctx.find_name(list.addr(), "c").unwrap(), Some(c));
        assert_eq!(ctx.find_name(c.addr(), "c").unwrap(), None);

        assert!(ctx.remove(a).unwrap());
        assert!(!ctx.remove(a).unwrap());
        assert_eq!(ctx.rem_tail(list).unwrap(), Some(c));
        assert_eq!(ctx.rem_head(list).unwrap(), Some(b));
        assert_eq!(ctx.rem_head(list).unwrap(), None);

        ctx.add_head(list, a).unwrap();
        assert_eq!(list.head().unwrap(), Some(a));
    }

    #[test]
    fn find_task_outside_the_scheduler() {
        let exec = exec();
        let ctx = exec.context();
        assert_eq!(ctx.find_task(None).unwrap(), None);
        assert_eq!(ctx.find_task(Some("nobody")).unwrap(), None);
    }
}

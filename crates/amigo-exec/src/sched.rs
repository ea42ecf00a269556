//! Cooperative task scheduling.
//!
//! Every task body runs on its own host thread, but only the thread holding the turn token
//! (`QueueState::current`) executes; all others sleep on one condition variable. The turn only
//! moves when the running task waits for signals or exits, so list and signal updates never
//! interleave. Ready and waiting tasks are mirrored into the guest `TaskReady`/`TaskWait` lists and
//! `tc_State`, and the running task into `ThisTask`.
//!
//! All tasks share the machine's register file. A task switch saves the outgoing task's registers
//! into its slot and loads the incoming task's, so each task sees only its own register values.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;

use amigo_astructs::GuestStruct;
use amigo_machine::{Hex, Reg};
use tracing::{debug, info, warn};

use crate::error::{ExecError, ExecResult};
use crate::exec::{ExecLib, TaskContext};
use crate::signal::SignalMasks;
use crate::structs::{NodeType, Process, Task, TaskState, SIGB_DOS};

type TaskBody<'f> = Box<dyn FnOnce(&TaskContext<'_>) -> ExecResult<u32> + Send + 'f>;

/// Which guest structure backs a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Task,
    /// A `Process`, with its packet port bound to `SIGB_DOS`.
    Process,
}

/// A task to start: name, priority and the host closure standing in for its code.
pub struct TaskSpec<'f> {
    name: String,
    pri: i8,
    kind: TaskKind,
    body: TaskBody<'f>,
}

impl<'f> TaskSpec<'f> {
    pub fn new(
        name: impl Into<String>,
        body: impl FnOnce(&TaskContext<'_>) -> ExecResult<u32> + Send + 'f,
    ) -> Self {
        Self {
            name: name.into(),
            pri: 0,
            kind: TaskKind::Task,
            body: Box::new(body),
        }
    }

    pub fn process(
        name: impl Into<String>,
        body: impl FnOnce(&TaskContext<'_>) -> ExecResult<u32> + Send + 'f,
    ) -> Self {
        Self {
            kind: TaskKind::Process,
            ..Self::new(name, body)
        }
    }

    pub fn with_priority(mut self, pri: i8) -> Self {
        self.pri = pri;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Ready,
    Running,
    Waiting,
    Done,
}

#[derive(Debug)]
struct Slot {
    name: String,
    addr: u32,
    pri: i8,
    state: SlotState,
    wait_mask: u32,
    forbid: u32,
    /// Set when a waiting task is resumed only because nothing could ever signal it.
    abort: bool,
    /// Register context while the task is not running.
    regs: [u32; 16],
}

#[derive(Debug, Default)]
struct QueueState {
    slots: Vec<Slot>,
    /// Ready slots, highest priority first and FIFO within a priority.
    ready: VecDeque<usize>,
    current: Option<usize>,
}

impl QueueState {
    fn push_ready(&mut self, id: usize) {
        let pri = self.slots[id].pri;
        let at = self
            .ready
            .iter()
            .position(|&other| self.slots[other].pri < pri)
            .unwrap_or(self.ready.len());
        self.ready.insert(at, id);
    }

    fn live_slot(&self, addr: u32) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| slot.addr == addr && slot.state != SlotState::Done)
    }

    /// Next slot to hand the turn to. When nothing is ready, a waiting slot is resumed with its
    /// abort flag set, since no task is left that could signal it.
    fn next_turn(&mut self) -> Option<usize> {
        if let Some(next) = self.ready.pop_front() {
            return Some(next);
        }
        let stuck = self
            .slots
            .iter()
            .position(|slot| slot.state == SlotState::Waiting)?;
        warn!(task = %self.slots[stuck].name, "no task left to signal a waiting task");
        self.slots[stuck].abort = true;
        Some(stuck)
    }
}

/// Turn token shared by all task threads.
#[derive(Debug, Default)]
pub(crate) struct RunQueue {
    state: Mutex<QueueState>,
    turn: Condvar,
}

impl RunQueue {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sleep<'g>(&self, guard: MutexGuard<'g, QueueState>) -> MutexGuard<'g, QueueState> {
        self.turn.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }
}

/// Drives a set of tasks to completion.
#[derive(Debug, Clone, Copy)]
pub struct Scheduler<'e> {
    exec: &'e ExecLib,
}

impl<'e> Scheduler<'e> {
    pub fn new(exec: &'e ExecLib) -> Self {
        Self { exec }
    }

    /// Starts every task (in submission order, highest priority first) and returns each task's
    /// exit code in submission order once all of them have finished.
    ///
    /// A task that could not be set up (guest memory exhausted) reports its error without running.
    ///
    /// # Panics
    ///
    /// Panics if called while another `run` on the same library is still in progress.
    pub fn run(&self, tasks: Vec<TaskSpec<'_>>) -> Vec<ExecResult<u32>> {
        let exec = self.exec;
        let mut results: Vec<Option<ExecResult<u32>>> = Vec::with_capacity(tasks.len());
        let mut started = Vec::with_capacity(tasks.len());
        {
            let mut q = exec.queue.lock();
            assert!(
                q.slots.iter().all(|slot| slot.state == SlotState::Done),
                "scheduler is already running"
            );
            *q = QueueState::default();

            for spec in tasks {
                match exec.spawn(&mut q, &spec.name, spec.pri, spec.kind) {
                    Ok((id, addr)) => {
                        started.push((results.len(), id, addr, spec.name, spec.body));
                        results.push(None);
                    }
                    Err(err) => {
                        warn!(task = %spec.name, %err, "task not started");
                        results.push(Some(Err(err)));
                    }
                }
            }

            if let Some(first) = q.ready.pop_front() {
                exec.switch_to(&mut q, first);
            }
        }

        thread::scope(|s| {
            let handles: Vec<_> = started
                .into_iter()
                .map(|(index, id, addr, name, body)| {
                    let handle = s.spawn(move || exec.run_task(id, addr, &name, body));
                    (index, handle)
                })
                .collect();
            for (index, handle) in handles {
                let result = handle.join().unwrap_or_else(|_| {
                    Err(ExecError::TaskPanicked {
                        task: format!("#{index}"),
                    })
                });
                results[index] = Some(result);
            }
        });

        results.into_iter().flatten().collect()
    }
}

impl ExecLib {
    fn spawn(
        &self,
        q: &mut QueueState,
        name: &str,
        pri: i8,
        kind: TaskKind,
    ) -> ExecResult<(usize, u32)> {
        let task = self.create_task(name, pri, kind)?;
        let linked = task
            .set_state(TaskState::Ready)
            .and_then(|()| self.task_ready().enqueue(task.node()))
            .and_then(|()| task.sp_reg().addr());
        let sp = match linked {
            Ok(sp) => sp,
            Err(err) => {
                if let Err(cleanup) = self.release_task(task) {
                    warn!(task = name, %cleanup, "releasing a half-built task failed");
                }
                return Err(err.into());
            }
        };

        // A task starts with its stack pointer and SysBase loaded; everything else is 0.
        let mut regs = [0; 16];
        regs[Reg::A6.index()] = self.base().addr();
        regs[Reg::A7.index()] = sp;

        let id = q.slots.len();
        q.slots.push(Slot {
            name: name.to_owned(),
            addr: task.addr(),
            pri,
            state: SlotState::Ready,
            wait_mask: 0,
            forbid: 0,
            abort: false,
            regs,
        });
        q.push_ready(id);
        debug!(task = name, addr = %Hex(task.addr()), pri, ?kind, "task added");
        Ok((id, task.addr()))
    }

    fn create_task(&self, name: &str, pri: i8, kind: TaskKind) -> ExecResult<Task<'_>> {
        let space = self.space();
        let alloc = self.allocator();
        let task = match kind {
            TaskKind::Task => Task::alloc(space, alloc, "exec_task")?,
            TaskKind::Process => Process::alloc(space, alloc, "exec_process")?.map(|p| p.task()),
        };
        let task = task.ok_or(ExecError::OutOfMemory { what: "task" })?;
        if let Err(err) = self.init_task(task, name, pri, kind) {
            if let Err(cleanup) = self.release_task(task) {
                warn!(task = name, %cleanup, "releasing a half-built task failed");
            }
            return Err(err);
        }
        Ok(task)
    }

    fn init_task(&self, task: Task<'_>, name: &str, pri: i8, kind: TaskKind) -> ExecResult<()> {
        let alloc = self.allocator();
        let node_type = match kind {
            TaskKind::Task => NodeType::Task,
            TaskKind::Process => NodeType::Process,
        };
        task.node().init(node_type, pri)?;
        task.node()
            .name_field()
            .alloc_str(alloc, name)?
            .ok_or(ExecError::OutOfMemory { what: "task name" })?;
        task.id_nest_cnt().set(-1)?;
        task.td_nest_cnt().set(-1)?;
        task.sig_alloc().set(self.config().reserved_signals)?;
        task.mem_entry().init(NodeType::Memory)?;

        let size = self.config().task_stack_size;
        let stack = alloc
            .allocate(size, "exec_stack")
            .ok_or(ExecError::OutOfMemory { what: "task stack" })?;
        task.sp_lower().set_addr(stack)?;
        task.sp_upper().set_addr(stack + size)?;
        task.sp_reg().set_addr(stack + size)?;

        if kind == TaskKind::Process {
            let process: Process<'_> = task.view().to();
            process.stack_size().set(size)?;
            process.msg_port().init(SIGB_DOS, Some(task))?;
            process.local_vars().init()?;
            task.sig_alloc().update(|bits| bits | 1 << SIGB_DOS)?;
        }
        task.set_state(TaskState::Added)?;
        Ok(())
    }

    /// Clears the task's signals, unlinks it and returns its name, stack and structure to the
    /// allocator.
    fn release_task(&self, task: Task<'_>) -> ExecResult<()> {
        let alloc = self.allocator();
        SignalMasks::default().store(&task)?;
        task.sig_wait().set(0)?;
        task.node().remove()?;
        task.set_state(TaskState::Removed)?;
        task.node().name_field().free_str(alloc)?;
        let stack = task.sp_lower().addr()?;
        if stack != 0 {
            alloc.free(stack);
            task.sp_lower().set_addr(0)?;
        }
        task.free(alloc);
        Ok(())
    }

    fn run_task(&self, id: usize, addr: u32, name: &str, body: TaskBody<'_>) -> ExecResult<u32> {
        {
            let mut q = self.queue.lock();
            while q.current != Some(id) {
                q = self.queue.sleep(q);
            }
        }
        debug!(task = name, "task started");

        let ctx = TaskContext::for_task(self, id, addr, name);
        let result = panic::catch_unwind(AssertUnwindSafe(|| body(&ctx))).unwrap_or_else(|_| {
            Err(ExecError::TaskPanicked {
                task: name.to_owned(),
            })
        });

        self.finish_task(id);
        match &result {
            Ok(code) => info!(task = name, code, "task exited"),
            Err(err) => warn!(task = name, %err, "task failed"),
        }
        result
    }

    fn finish_task(&self, id: usize) {
        let mut q = self.queue.lock();
        q.slots[id].state = SlotState::Done;
        q.ready.retain(|&other| other != id);
        let task = Task::at(self.space(), q.slots[id].addr);
        if let Err(err) = self.release_task(task) {
            warn!(task = %q.slots[id].name, %err, "task teardown failed");
        }

        if q.current == Some(id) {
            q.current = None;
            match q.next_turn() {
                Some(next) => self.switch_to(&mut q, next),
                None => {
                    let base = self.base();
                    let cleared = base
                        .this_task()
                        .set(None)
                        .and_then(|()| base.td_nest_cnt().set(-1));
                    if let Err(err) = cleared {
                        warn!(%err, "could not clear ThisTask");
                    }
                }
            }
        }
    }

    /// Hands the turn to `next`, loads its registers and wakes its thread.
    ///
    /// The outgoing task's registers must already be saved in its slot.
    fn switch_to(&self, q: &mut QueueState, next: usize) {
        q.current = Some(next);
        let slot = &mut q.slots[next];
        slot.state = SlotState::Running;
        self.machine().cpu.restore(slot.regs);
        self.queue.turn.notify_all();

        let base = self.base();
        let task = Task::at(self.space(), slot.addr);
        let nest = nest_count(slot.forbid);
        let mirrored = task
            .node()
            .remove()
            .and_then(|_| task.set_state(TaskState::Run))
            .and_then(|()| base.this_task().set(Some(task)))
            .and_then(|()| base.td_nest_cnt().set(nest))
            .and_then(|()| base.disp_count().update(|n| n.wrapping_add(1)).map(drop));
        if let Err(err) = mirrored {
            warn!(task = %slot.name, %err, "could not mirror task switch");
        }
        debug!(task = %slot.name, "task switch");
    }

    /// Runs `f` on the signal registry stored in the guest task at `addr`.
    pub(crate) fn task_signals<R>(
        &self,
        addr: u32,
        f: impl FnOnce(&mut SignalMasks) -> R,
    ) -> ExecResult<R> {
        let _q = self.queue.lock();
        let task = Task::at(self.space(), addr);
        let mut masks = SignalMasks::load(&task)?;
        let result = f(&mut masks);
        masks.store(&task)?;
        Ok(result)
    }

    /// Posts `mask` to the task at `addr` and makes it ready if it waits on one of the bits.
    /// Returns the bits actually delivered.
    pub(crate) fn post_signals(&self, addr: u32, mask: u32) -> ExecResult<u32> {
        let mut q = self.queue.lock();
        let task = Task::at(self.space(), addr);
        let mut masks = SignalMasks::load(&task)?;
        let delivered = masks.post(mask);
        masks.store(&task)?;
        debug!(to = %Hex(addr), mask = %Hex(mask), delivered = %Hex(delivered), "signal posted");

        let Some(id) = q.live_slot(addr) else {
            return Ok(delivered);
        };
        let slot = &q.slots[id];
        if slot.state == SlotState::Waiting && masks.recvd & slot.wait_mask != 0 {
            debug!(task = %slot.name, "waiting task made ready");
            q.slots[id].state = SlotState::Ready;
            q.push_ready(id);
            task.node().remove()?;
            task.set_state(TaskState::Ready)?;
            self.task_ready().enqueue(task.node())?;
        }
        Ok(delivered)
    }

    /// Suspends task `id` until one of `mask` is pending, then consumes the pending subset.
    pub(crate) fn wait_signals(&self, id: usize, mask: u32) -> ExecResult<u32> {
        let mut q = self.queue.lock();
        let name = q.slots[id].name.clone();
        let task = Task::at(self.space(), q.slots[id].addr);

        if q.slots[id].forbid > 0 {
            return Err(ExecError::WaitWhileForbidden { task: name });
        }
        let take = |mask: u32| -> ExecResult<u32> {
            let mut masks = SignalMasks::load(&task)?;
            let got = masks.take(mask);
            masks.store(&task)?;
            Ok(got)
        };
        let got = take(mask)?;
        if got != 0 {
            return Ok(got);
        }
        let Some(next) = q.ready.pop_front() else {
            return Err(ExecError::Deadlock { task: name });
        };

        let slot = &mut q.slots[id];
        slot.state = SlotState::Waiting;
        slot.wait_mask = mask;
        let mirrored = task
            .sig_wait()
            .set(mask)
            .and_then(|()| task.set_state(TaskState::Wait))
            .and_then(|()| self.task_wait().add_tail(task.node()));
        if let Err(err) = mirrored {
            warn!(task = %name, %err, "could not mirror task wait");
        }
        debug!(task = %name, mask = %Hex(mask), "task waiting");
        q.slots[id].regs = self.machine().cpu.snapshot();
        self.switch_to(&mut q, next);

        while q.current != Some(id) {
            q = self.queue.sleep(q);
        }
        let slot = &mut q.slots[id];
        slot.wait_mask = 0;
        let aborted = std::mem::take(&mut slot.abort);
        task.sig_wait().set(0)?;
        if aborted {
            return Err(ExecError::Deadlock { task: name });
        }
        let got = take(mask)?;
        debug!(task = %name, got = %Hex(got), "task resumed");
        Ok(got)
    }

    /// Returns the new nesting depth.
    pub(crate) fn forbid_task(&self, id: usize) -> ExecResult<u32> {
        let mut q = self.queue.lock();
        let slot = &mut q.slots[id];
        slot.forbid += 1;
        let depth = slot.forbid;
        self.mirror_nest(slot.addr, depth)?;
        Ok(depth)
    }

    /// Returns the new nesting depth; never goes below zero.
    pub(crate) fn permit_task(&self, id: usize) -> ExecResult<u32> {
        let mut q = self.queue.lock();
        let slot = &mut q.slots[id];
        if slot.forbid == 0 {
            warn!(task = %slot.name, "Permit without Forbid");
        }
        slot.forbid = slot.forbid.saturating_sub(1);
        let depth = slot.forbid;
        self.mirror_nest(slot.addr, depth)?;
        Ok(depth)
    }

    /// Mirrors the running task's nesting into its `tc_TDNestCnt` and `SysBase->TDNestCnt`.
    fn mirror_nest(&self, addr: u32, depth: u32) -> ExecResult<()> {
        let nest = nest_count(depth);
        Task::at(self.space(), addr).td_nest_cnt().set(nest)?;
        self.base().td_nest_cnt().set(nest)?;
        Ok(())
    }

    /// The running task or a ready or waiting task named `name`.
    pub(crate) fn find_task(&self, name: &str) -> ExecResult<Option<Task<'_>>> {
        let q = self.queue.lock();
        if let Some(current) = q.current {
            let task = Task::at(self.space(), q.slots[current].addr);
            if task.name()?.as_deref() == Some(name) {
                return Ok(Some(task));
            }
        }
        for list in [self.task_ready(), self.task_wait()] {
            if let Some(node) = list.find_name(name)? {
                return Ok(Some(node.view().to()));
            }
        }
        Ok(None)
    }
}

/// `TDNestCnt` is -1 while switching is enabled.
fn nest_count(depth: u32) -> i8 {
    i8::try_from(i64::from(depth) - 1).unwrap_or(i8::MAX)
}

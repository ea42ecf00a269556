use amigo_astructs::{
    guest_struct, Aptr, Bptr, CStrField, FieldDef, FieldType, FlagField, Scalar, StructDef,
    StructResult, Void,
};
use bitflags::bitflags;

use super::list::{List, MinList, LIST, MIN_LIST};
use super::node::{Node, NODE};
use super::port::{MsgPort, MSG_PORT};
use super::{aptr, bptr};

pub const TC_NODE: FieldDef = FieldDef::new("tc_Node", 0, FieldType::Struct(&NODE));
pub const TC_FLAGS: FieldDef = FieldDef::new("tc_Flags", 14, FieldType::Flags { width: 1 });
pub const TC_STATE: FieldDef = FieldDef::new("tc_State", 15, FieldType::U8);
pub const TC_ID_NEST_CNT: FieldDef = FieldDef::new("tc_IDNestCnt", 16, FieldType::I8);
pub const TC_TD_NEST_CNT: FieldDef = FieldDef::new("tc_TDNestCnt", 17, FieldType::I8);
pub const TC_SIG_ALLOC: FieldDef = FieldDef::new("tc_SigAlloc", 18, FieldType::U32);
pub const TC_SIG_WAIT: FieldDef = FieldDef::new("tc_SigWait", 22, FieldType::U32);
pub const TC_SIG_RECVD: FieldDef = FieldDef::new("tc_SigRecvd", 26, FieldType::U32);
pub const TC_SIG_EXCEPT: FieldDef = FieldDef::new("tc_SigExcept", 30, FieldType::U32);
pub const TC_TRAP_ALLOC: FieldDef = FieldDef::new("tc_TrapAlloc", 34, FieldType::U16);
pub const TC_TRAP_ABLE: FieldDef = FieldDef::new("tc_TrapAble", 36, FieldType::U16);
pub const TC_EXCEPT_DATA: FieldDef = FieldDef::new("tc_ExceptData", 38, aptr("VOID"));
pub const TC_EXCEPT_CODE: FieldDef = FieldDef::new("tc_ExceptCode", 42, aptr("VOID"));
pub const TC_TRAP_DATA: FieldDef = FieldDef::new("tc_TrapData", 46, aptr("VOID"));
pub const TC_TRAP_CODE: FieldDef = FieldDef::new("tc_TrapCode", 50, aptr("VOID"));
pub const TC_SP_REG: FieldDef = FieldDef::new("tc_SPReg", 54, aptr("VOID"));
pub const TC_SP_LOWER: FieldDef = FieldDef::new("tc_SPLower", 58, aptr("VOID"));
pub const TC_SP_UPPER: FieldDef = FieldDef::new("tc_SPUpper", 62, aptr("VOID"));
pub const TC_SWITCH: FieldDef = FieldDef::new("tc_Switch", 66, aptr("VOID"));
pub const TC_LAUNCH: FieldDef = FieldDef::new("tc_Launch", 70, aptr("VOID"));
pub const TC_MEM_ENTRY: FieldDef = FieldDef::new("tc_MemEntry", 74, FieldType::Struct(&LIST));
pub const TC_USER_DATA: FieldDef = FieldDef::new("tc_UserData", 88, aptr("VOID"));

pub const TASK: StructDef = StructDef::new(
    "Task",
    92,
    &[
        TC_NODE,
        TC_FLAGS,
        TC_STATE,
        TC_ID_NEST_CNT,
        TC_TD_NEST_CNT,
        TC_SIG_ALLOC,
        TC_SIG_WAIT,
        TC_SIG_RECVD,
        TC_SIG_EXCEPT,
        TC_TRAP_ALLOC,
        TC_TRAP_ABLE,
        TC_EXCEPT_DATA,
        TC_EXCEPT_CODE,
        TC_TRAP_DATA,
        TC_TRAP_CODE,
        TC_SP_REG,
        TC_SP_LOWER,
        TC_SP_UPPER,
        TC_SWITCH,
        TC_LAUNCH,
        TC_MEM_ENTRY,
        TC_USER_DATA,
    ],
);

pub const PR_TASK: FieldDef = FieldDef::new("pr_Task", 0, FieldType::Struct(&TASK));
pub const PR_MSG_PORT: FieldDef = FieldDef::new("pr_MsgPort", 92, FieldType::Struct(&MSG_PORT));
pub const PR_PAD: FieldDef = FieldDef::new("pr_Pad", 126, FieldType::U16);
pub const PR_SEG_LIST: FieldDef = FieldDef::new("pr_SegList", 128, bptr("VOID"));
pub const PR_STACK_SIZE: FieldDef = FieldDef::new("pr_StackSize", 132, FieldType::U32);
pub const PR_GLOB_VEC: FieldDef = FieldDef::new("pr_GlobVec", 136, aptr("VOID"));
pub const PR_TASK_NUM: FieldDef = FieldDef::new("pr_TaskNum", 140, FieldType::I32);
pub const PR_STACK_BASE: FieldDef = FieldDef::new("pr_StackBase", 144, bptr("VOID"));
pub const PR_RESULT2: FieldDef = FieldDef::new("pr_Result2", 148, FieldType::I32);
pub const PR_CURRENT_DIR: FieldDef = FieldDef::new("pr_CurrentDir", 152, bptr("VOID"));
pub const PR_CIS: FieldDef = FieldDef::new("pr_CIS", 156, bptr("VOID"));
pub const PR_COS: FieldDef = FieldDef::new("pr_COS", 160, bptr("VOID"));
pub const PR_CONSOLE_TASK: FieldDef = FieldDef::new("pr_ConsoleTask", 164, aptr("VOID"));
pub const PR_FILE_SYSTEM_TASK: FieldDef = FieldDef::new("pr_FileSystemTask", 168, aptr("VOID"));
pub const PR_CLI: FieldDef = FieldDef::new("pr_CLI", 172, bptr("VOID"));
pub const PR_RETURN_ADDR: FieldDef = FieldDef::new("pr_ReturnAddr", 176, aptr("VOID"));
pub const PR_PKT_WAIT: FieldDef = FieldDef::new("pr_PktWait", 180, aptr("VOID"));
pub const PR_WINDOW_PTR: FieldDef = FieldDef::new("pr_WindowPtr", 184, aptr("VOID"));
pub const PR_HOME_DIR: FieldDef = FieldDef::new("pr_HomeDir", 188, bptr("VOID"));
pub const PR_FLAGS: FieldDef = FieldDef::new("pr_Flags", 192, FieldType::U32);
pub const PR_EXIT_CODE: FieldDef = FieldDef::new("pr_ExitCode", 196, aptr("VOID"));
pub const PR_EXIT_DATA: FieldDef = FieldDef::new("pr_ExitData", 200, FieldType::I32);
pub const PR_ARGUMENTS: FieldDef = FieldDef::new("pr_Arguments", 204, FieldType::CString);
pub const PR_LOCAL_VARS: FieldDef =
    FieldDef::new("pr_LocalVars", 208, FieldType::Struct(&MIN_LIST));
pub const PR_SHELL_PRIVATE: FieldDef = FieldDef::new("pr_ShellPrivate", 220, FieldType::U32);
pub const PR_CES: FieldDef = FieldDef::new("pr_CES", 224, bptr("VOID"));

pub const PROCESS: StructDef = StructDef::new(
    "Process",
    228,
    &[
        PR_TASK,
        PR_MSG_PORT,
        PR_PAD,
        PR_SEG_LIST,
        PR_STACK_SIZE,
        PR_GLOB_VEC,
        PR_TASK_NUM,
        PR_STACK_BASE,
        PR_RESULT2,
        PR_CURRENT_DIR,
        PR_CIS,
        PR_COS,
        PR_CONSOLE_TASK,
        PR_FILE_SYSTEM_TASK,
        PR_CLI,
        PR_RETURN_ADDR,
        PR_PKT_WAIT,
        PR_WINDOW_PTR,
        PR_HOME_DIR,
        PR_FLAGS,
        PR_EXIT_CODE,
        PR_EXIT_DATA,
        PR_ARGUMENTS,
        PR_LOCAL_VARS,
        PR_SHELL_PRIVATE,
        PR_CES,
    ],
);

/// Signal bit a process port uses for packet replies.
pub const SIGB_DOS: u8 = 8;

bitflags! {
    /// `tc_Flags`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct TaskFlags: u8 {
        const PROCTIME = 1 << 0;
        const ETASK = 1 << 3;
        const STACKCHK = 1 << 4;
        const EXCEPT = 1 << 5;
        const SWITCH = 1 << 6;
        const LAUNCH = 1 << 7;
    }
}

/// `tc_State`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TaskState {
    Invalid = 0,
    Added = 1,
    Run = 2,
    Ready = 3,
    Wait = 4,
    Except = 5,
    Removed = 6,
}

impl TaskState {
    pub const fn from_raw(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => TaskState::Invalid,
            1 => TaskState::Added,
            2 => TaskState::Run,
            3 => TaskState::Ready,
            4 => TaskState::Wait,
            5 => TaskState::Except,
            6 => TaskState::Removed,
            _ => return None,
        })
    }
}

guest_struct! {
    pub struct Task => TASK;
}

guest_struct! {
    /// A DOS process: a task followed by its packet port and DOS bookkeeping.
    pub struct Process => PROCESS;
}

impl<'a> Task<'a> {
    pub fn node(&self) -> Node<'a> {
        self.0.embedded(&TC_NODE)
    }

    pub fn name(&self) -> StructResult<Option<String>> {
        self.node().name()
    }

    pub fn flags(&self) -> FlagField<'a, TaskFlags> {
        self.0.flags(&TC_FLAGS)
    }

    pub fn state(&self) -> StructResult<Option<TaskState>> {
        self.0.scalar::<u8>(&TC_STATE).get().map(TaskState::from_raw)
    }

    pub fn set_state(&self, state: TaskState) -> StructResult<()> {
        self.0.scalar::<u8>(&TC_STATE).set(state as u8)
    }

    pub fn id_nest_cnt(&self) -> Scalar<'a, i8> {
        self.0.scalar(&TC_ID_NEST_CNT)
    }

    /// Task-switch disable nesting: -1 when switching is enabled.
    pub fn td_nest_cnt(&self) -> Scalar<'a, i8> {
        self.0.scalar(&TC_TD_NEST_CNT)
    }

    pub fn sig_alloc(&self) -> Scalar<'a, u32> {
        self.0.scalar(&TC_SIG_ALLOC)
    }

    pub fn sig_wait(&self) -> Scalar<'a, u32> {
        self.0.scalar(&TC_SIG_WAIT)
    }

    pub fn sig_recvd(&self) -> Scalar<'a, u32> {
        self.0.scalar(&TC_SIG_RECVD)
    }

    pub fn sig_except(&self) -> Scalar<'a, u32> {
        self.0.scalar(&TC_SIG_EXCEPT)
    }

    pub fn sp_reg(&self) -> Aptr<'a, Void<'a>> {
        self.0.aptr(&TC_SP_REG)
    }

    pub fn sp_lower(&self) -> Aptr<'a, Void<'a>> {
        self.0.aptr(&TC_SP_LOWER)
    }

    pub fn sp_upper(&self) -> Aptr<'a, Void<'a>> {
        self.0.aptr(&TC_SP_UPPER)
    }

    pub fn mem_entry(&self) -> List<'a> {
        self.0.embedded(&TC_MEM_ENTRY)
    }

    pub fn user_data(&self) -> Aptr<'a, Void<'a>> {
        self.0.aptr(&TC_USER_DATA)
    }
}

impl<'a> Process<'a> {
    pub fn task(&self) -> Task<'a> {
        self.0.embedded(&PR_TASK)
    }

    pub fn msg_port(&self) -> MsgPort<'a> {
        self.0.embedded(&PR_MSG_PORT)
    }

    pub fn seg_list(&self) -> Bptr<'a, Void<'a>> {
        self.0.bptr(&PR_SEG_LIST)
    }

    pub fn stack_size(&self) -> Scalar<'a, u32> {
        self.0.scalar(&PR_STACK_SIZE)
    }

    pub fn task_num(&self) -> Scalar<'a, i32> {
        self.0.scalar(&PR_TASK_NUM)
    }

    pub fn result2(&self) -> Scalar<'a, i32> {
        self.0.scalar(&PR_RESULT2)
    }

    pub fn current_dir(&self) -> Bptr<'a, Void<'a>> {
        self.0.bptr(&PR_CURRENT_DIR)
    }

    pub fn cli(&self) -> Bptr<'a, Void<'a>> {
        self.0.bptr(&PR_CLI)
    }

    pub fn arguments(&self) -> CStrField<'a> {
        self.0.cstr(&PR_ARGUMENTS)
    }

    pub fn local_vars(&self) -> MinList<'a> {
        self.0.embedded(&PR_LOCAL_VARS)
    }
}

#[cfg(test)]
mod tests {
    use amigo_astructs::{GuestStruct, Space};
    use amigo_machine::{DenseMemory, GuestMemory};

    use super::*;

    #[test]
    fn task_flags_map_to_tc_flags() {
        let mem = DenseMemory::new(0x200).unwrap();
        let task = Task::at(Space::new(&mem), 0x40);
        task.flags()
            .insert(TaskFlags::STACKCHK | TaskFlags::LAUNCH)
            .unwrap();
        assert_eq!(mem.read_u8(0x40 + 14).unwrap(), 0x90);
        assert!(task.flags().test_named("LAUNCH").unwrap());

        task.set_state(TaskState::Wait).unwrap();
        assert_eq!(mem.read_u8(0x40 + 15).unwrap(), 4);
        assert_eq!(task.state().unwrap(), Some(TaskState::Wait));
    }

    #[test]
    fn process_embeds_task_and_port() {
        let mem = DenseMemory::new(0x400).unwrap();
        let proc = Process::at(Space::new(&mem), 0x100);
        assert_eq!(proc.task().addr(), 0x100);
        assert_eq!(proc.msg_port().addr(), 0x100 + 92);

        proc.stack_size().set(8000).unwrap();
        assert_eq!(mem.read_u32(0x100 + 132).unwrap(), 8000);

        proc.current_dir().set_addr(0x200).unwrap();
        assert_eq!(mem.read_u32(0x100 + 152).unwrap(), 0x80);
    }
}

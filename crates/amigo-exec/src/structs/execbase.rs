use amigo_astructs::{guest_struct, Aptr, FieldDef, FieldType, FlagField, Scalar, StructDef};
use bitflags::bitflags;

use super::aptr;
use super::library::{Library, LIBRARY};
use super::list::{List, MinList, LIST, MIN_LIST};
use super::task::Task;

pub const EX_LIB_NODE: FieldDef = FieldDef::new("LibNode", 0, FieldType::Struct(&LIBRARY));
pub const EX_SOFT_VER: FieldDef = FieldDef::new("SoftVer", 34, FieldType::U16);
pub const EX_LOW_MEM_CHK_SUM: FieldDef = FieldDef::new("LowMemChkSum", 36, FieldType::I16);
pub const EX_CHK_BASE: FieldDef = FieldDef::new("ChkBase", 38, FieldType::U32);
pub const EX_COLD_CAPTURE: FieldDef = FieldDef::new("ColdCapture", 42, aptr("VOID"));
pub const EX_COOL_CAPTURE: FieldDef = FieldDef::new("CoolCapture", 46, aptr("VOID"));
pub const EX_WARM_CAPTURE: FieldDef = FieldDef::new("WarmCapture", 50, aptr("VOID"));
pub const EX_SYS_STK_UPPER: FieldDef = FieldDef::new("SysStkUpper", 54, aptr("VOID"));
pub const EX_SYS_STK_LOWER: FieldDef = FieldDef::new("SysStkLower", 58, aptr("VOID"));
pub const EX_MAX_LOC_MEM: FieldDef = FieldDef::new("MaxLocMem", 62, FieldType::U32);
pub const EX_DEBUG_ENTRY: FieldDef = FieldDef::new("DebugEntry", 66, aptr("VOID"));
pub const EX_DEBUG_DATA: FieldDef = FieldDef::new("DebugData", 70, aptr("VOID"));
pub const EX_ALERT_DATA: FieldDef = FieldDef::new("AlertData", 74, aptr("VOID"));
pub const EX_MAX_EXT_MEM: FieldDef = FieldDef::new("MaxExtMem", 78, aptr("VOID"));
pub const EX_CHK_SUM: FieldDef = FieldDef::new("ChkSum", 82, FieldType::U16);
// IntVects[16] (84..276) is not modelled.
pub const EX_THIS_TASK: FieldDef = FieldDef::new("ThisTask", 276, aptr("Task"));
pub const EX_IDLE_COUNT: FieldDef = FieldDef::new("IdleCount", 280, FieldType::U32);
pub const EX_DISP_COUNT: FieldDef = FieldDef::new("DispCount", 284, FieldType::U32);
pub const EX_QUANTUM: FieldDef = FieldDef::new("Quantum", 288, FieldType::U16);
pub const EX_ELAPSED: FieldDef = FieldDef::new("Elapsed", 290, FieldType::U16);
pub const EX_SYS_FLAGS: FieldDef = FieldDef::new("SysFlags", 292, FieldType::U16);
pub const EX_ID_NEST_CNT: FieldDef = FieldDef::new("IDNestCnt", 294, FieldType::I8);
pub const EX_TD_NEST_CNT: FieldDef = FieldDef::new("TDNestCnt", 295, FieldType::I8);
pub const EX_ATTN_FLAGS: FieldDef = FieldDef::new("AttnFlags", 296, FieldType::Flags { width: 2 });
pub const EX_ATTN_RESCHED: FieldDef = FieldDef::new("AttnResched", 298, FieldType::U16);
pub const EX_RES_MODULES: FieldDef = FieldDef::new("ResModules", 300, aptr("VOID"));
pub const EX_TASK_TRAP_CODE: FieldDef = FieldDef::new("TaskTrapCode", 304, aptr("VOID"));
pub const EX_TASK_EXCEPT_CODE: FieldDef = FieldDef::new("TaskExceptCode", 308, aptr("VOID"));
pub const EX_TASK_EXIT_CODE: FieldDef = FieldDef::new("TaskExitCode", 312, aptr("VOID"));
pub const EX_TASK_SIG_ALLOC: FieldDef = FieldDef::new("TaskSigAlloc", 316, FieldType::U32);
pub const EX_TASK_TRAP_ALLOC: FieldDef = FieldDef::new("TaskTrapAlloc", 320, FieldType::U16);
pub const EX_MEM_LIST: FieldDef = FieldDef::new("MemList", 322, FieldType::Struct(&LIST));
pub const EX_RESOURCE_LIST: FieldDef = FieldDef::new("ResourceList", 336, FieldType::Struct(&LIST));
pub const EX_DEVICE_LIST: FieldDef = FieldDef::new("DeviceList", 350, FieldType::Struct(&LIST));
pub const EX_INTR_LIST: FieldDef = FieldDef::new("IntrList", 364, FieldType::Struct(&LIST));
pub const EX_LIB_LIST: FieldDef = FieldDef::new("LibList", 378, FieldType::Struct(&LIST));
pub const EX_PORT_LIST: FieldDef = FieldDef::new("PortList", 392, FieldType::Struct(&LIST));
pub const EX_TASK_READY: FieldDef = FieldDef::new("TaskReady", 406, FieldType::Struct(&LIST));
pub const EX_TASK_WAIT: FieldDef = FieldDef::new("TaskWait", 420, FieldType::Struct(&LIST));
// SoftInts[5] (434..514) and LastAlert[4] (514..530) are not modelled.
pub const EX_VBLANK_FREQUENCY: FieldDef = FieldDef::new("VBlankFrequency", 530, FieldType::U8);
pub const EX_POWER_SUPPLY_FREQUENCY: FieldDef =
    FieldDef::new("PowerSupplyFrequency", 531, FieldType::U8);
pub const EX_SEMAPHORE_LIST: FieldDef =
    FieldDef::new("SemaphoreList", 532, FieldType::Struct(&LIST));
pub const EX_KICK_MEM_PTR: FieldDef = FieldDef::new("KickMemPtr", 546, aptr("VOID"));
pub const EX_KICK_TAG_PTR: FieldDef = FieldDef::new("KickTagPtr", 550, aptr("VOID"));
pub const EX_KICK_CHECK_SUM: FieldDef = FieldDef::new("KickCheckSum", 554, aptr("VOID"));
pub const EX_PAD0: FieldDef = FieldDef::new("ex_Pad0", 558, FieldType::U16);
pub const EX_LAUNCH_POINT: FieldDef = FieldDef::new("ex_LaunchPoint", 560, FieldType::U32);
pub const EX_RAM_LIB_PRIVATE: FieldDef = FieldDef::new("ex_RamLibPrivate", 564, aptr("VOID"));
pub const EX_ECLOCK_FREQUENCY: FieldDef =
    FieldDef::new("ex_EClockFrequency", 568, FieldType::U32);
pub const EX_CACHE_CONTROL: FieldDef = FieldDef::new("ex_CacheControl", 572, FieldType::U32);
pub const EX_TASK_ID: FieldDef = FieldDef::new("ex_TaskID", 576, FieldType::U32);
// ex_Reserved1[5] (580..600).
pub const EX_MMU_LOCK: FieldDef = FieldDef::new("ex_MMULock", 600, aptr("VOID"));
// ex_Reserved2[3] (604..616).
pub const EX_MEM_HANDLERS: FieldDef =
    FieldDef::new("ex_MemHandlers", 616, FieldType::Struct(&MIN_LIST));
pub const EX_MEM_HANDLER: FieldDef = FieldDef::new("ex_MemHandler", 628, aptr("VOID"));

pub const EXEC_BASE: StructDef = StructDef::new(
    "ExecBase",
    632,
    &[
        EX_LIB_NODE,
        EX_SOFT_VER,
        EX_LOW_MEM_CHK_SUM,
        EX_CHK_BASE,
        EX_COLD_CAPTURE,
        EX_COOL_CAPTURE,
        EX_WARM_CAPTURE,
        EX_SYS_STK_UPPER,
        EX_SYS_STK_LOWER,
        EX_MAX_LOC_MEM,
        EX_DEBUG_ENTRY,
        EX_DEBUG_DATA,
        EX_ALERT_DATA,
        EX_MAX_EXT_MEM,
        EX_CHK_SUM,
        EX_THIS_TASK,
        EX_IDLE_COUNT,
        EX_DISP_COUNT,
        EX_QUANTUM,
        EX_ELAPSED,
        EX_SYS_FLAGS,
        EX_ID_NEST_CNT,
        EX_TD_NEST_CNT,
        EX_ATTN_FLAGS,
        EX_ATTN_RESCHED,
        EX_RES_MODULES,
        EX_TASK_TRAP_CODE,
        EX_TASK_EXCEPT_CODE,
        EX_TASK_EXIT_CODE,
        EX_TASK_SIG_ALLOC,
        EX_TASK_TRAP_ALLOC,
        EX_MEM_LIST,
        EX_RESOURCE_LIST,
        EX_DEVICE_LIST,
        EX_INTR_LIST,
        EX_LIB_LIST,
        EX_PORT_LIST,
        EX_TASK_READY,
        EX_TASK_WAIT,
        EX_VBLANK_FREQUENCY,
        EX_POWER_SUPPLY_FREQUENCY,
        EX_SEMAPHORE_LIST,
        EX_KICK_MEM_PTR,
        EX_KICK_TAG_PTR,
        EX_KICK_CHECK_SUM,
        EX_PAD0,
        EX_LAUNCH_POINT,
        EX_RAM_LIB_PRIVATE,
        EX_ECLOCK_FREQUENCY,
        EX_CACHE_CONTROL,
        EX_TASK_ID,
        EX_MMU_LOCK,
        EX_MEM_HANDLERS,
        EX_MEM_HANDLER,
    ],
);

/// Guest address holding the `ExecBase` pointer (`SysBase`).
pub const ABS_EXEC_BASE: u32 = 4;

bitflags! {
    /// `AttnFlags`: processor and FPU present.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AttnFlags: u16 {
        const M68010 = 1 << 0;
        const M68020 = 1 << 1;
        const M68030 = 1 << 2;
        const M68040 = 1 << 3;
        const M68881 = 1 << 4;
        const M68882 = 1 << 5;
        const FPU40 = 1 << 6;
        const M68060 = 1 << 7;
    }
}

guest_struct! {
    /// The exec library base, `SysBase`.
    pub struct ExecBase => EXEC_BASE;
}

impl<'a> ExecBase<'a> {
    pub fn library(&self) -> Library<'a> {
        self.0.embedded(&EX_LIB_NODE)
    }

    pub fn soft_ver(&self) -> Scalar<'a, u16> {
        self.0.scalar(&EX_SOFT_VER)
    }

    pub fn max_loc_mem(&self) -> Scalar<'a, u32> {
        self.0.scalar(&EX_MAX_LOC_MEM)
    }

    /// The running task; null while no task is scheduled.
    pub fn this_task(&self) -> Aptr<'a, Task<'a>> {
        self.0.aptr(&EX_THIS_TASK)
    }

    /// Number of task switches so far.
    pub fn disp_count(&self) -> Scalar<'a, u32> {
        self.0.scalar(&EX_DISP_COUNT)
    }

    pub fn id_nest_cnt(&self) -> Scalar<'a, i8> {
        self.0.scalar(&EX_ID_NEST_CNT)
    }

    /// Task-switch disable nesting of the running task: -1 when switching is enabled.
    pub fn td_nest_cnt(&self) -> Scalar<'a, i8> {
        self.0.scalar(&EX_TD_NEST_CNT)
    }

    pub fn attn_flags(&self) -> FlagField<'a, AttnFlags> {
        self.0.flags(&EX_ATTN_FLAGS)
    }

    /// Signals new tasks start with allocated.
    pub fn task_sig_alloc(&self) -> Scalar<'a, u32> {
        self.0.scalar(&EX_TASK_SIG_ALLOC)
    }

    pub fn mem_list(&self) -> List<'a> {
        self.0.embedded(&EX_MEM_LIST)
    }

    pub fn resource_list(&self) -> List<'a> {
        self.0.embedded(&EX_RESOURCE_LIST)
    }

    pub fn device_list(&self) -> List<'a> {
        self.0.embedded(&EX_DEVICE_LIST)
    }

    pub fn intr_list(&self) -> List<'a> {
        self.0.embedded(&EX_INTR_LIST)
    }

    pub fn lib_list(&self) -> List<'a> {
        self.0.embedded(&EX_LIB_LIST)
    }

    /// The named-port directory.
    pub fn port_list(&self) -> List<'a> {
        self.0.embedded(&EX_PORT_LIST)
    }

    pub fn task_ready(&self) -> List<'a> {
        self.0.embedded(&EX_TASK_READY)
    }

    pub fn task_wait(&self) -> List<'a> {
        self.0.embedded(&EX_TASK_WAIT)
    }

    pub fn semaphore_list(&self) -> List<'a> {
        self.0.embedded(&EX_SEMAPHORE_LIST)
    }

    pub fn mem_handlers(&self) -> MinList<'a> {
        self.0.embedded(&EX_MEM_HANDLERS)
    }
}

//! Byte-exact layouts of the exec structures the library touches, with typed wrappers.

use amigo_astructs::{FieldType, PtrEncoding, StructDef};

mod execbase;
mod library;
mod list;
mod node;
mod port;
mod task;

pub use execbase::*;
pub use library::*;
pub use list::*;
pub use node::*;
pub use port::*;
pub use task::*;

/// Direct (`APTR`-style) pointer to `target`.
pub(crate) const fn aptr(target: &'static str) -> FieldType {
    FieldType::Ptr {
        target,
        encoding: PtrEncoding::Direct,
    }
}

/// Block (`BPTR`) pointer to `target`.
pub(crate) const fn bptr(target: &'static str) -> FieldType {
    FieldType::Ptr {
        target,
        encoding: PtrEncoding::Block,
    }
}

/// Every descriptor in the catalog.
pub const CATALOG: &[&StructDef] = &[
    &MIN_NODE, &NODE, &MIN_LIST, &LIST, &MSG_PORT, &MESSAGE, &LIBRARY, &TASK, &PROCESS,
    &EXEC_BASE,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_layouts_are_consistent() {
        for def in CATALOG {
            def.validate()
                .unwrap_or_else(|err| panic!("{}: {err}", def.name));
        }
    }

    #[test]
    fn catalog_sizes_match_the_guest_abi() {
        let sizes: Vec<(&str, u32)> = CATALOG.iter().map(|d| (d.name, d.size)).collect();
        assert_eq!(
            sizes,
            [
                ("MinNode", 8),
                ("Node", 14),
                ("MinList", 12),
                ("List", 14),
                ("MsgPort", 34),
                ("Message", 20),
                ("Library", 34),
                ("Task", 92),
                ("Process", 228),
                ("ExecBase", 632),
            ]
        );
    }

    #[test]
    fn selected_offsets() {
        let offset = |def: &StructDef, name: &str| def.field(name).map(|f| f.offset);
        assert_eq!(offset(&NODE, "ln_Name"), Some(10));
        assert_eq!(offset(&MSG_PORT, "mp_MsgList"), Some(20));
        assert_eq!(offset(&MESSAGE, "mn_Length"), Some(18));
        assert_eq!(offset(&TASK, "tc_SigRecvd"), Some(26));
        assert_eq!(offset(&TASK, "tc_UserData"), Some(88));
        assert_eq!(offset(&PROCESS, "pr_MsgPort"), Some(92));
        assert_eq!(offset(&PROCESS, "pr_LocalVars"), Some(208));
        assert_eq!(offset(&PROCESS, "pr_CES"), Some(224));
        assert_eq!(offset(&LIBRARY, "lib_OpenCnt"), Some(32));
        assert_eq!(offset(&EXEC_BASE, "ThisTask"), Some(0x114));
        assert_eq!(offset(&EXEC_BASE, "AttnFlags"), Some(0x128));
        assert_eq!(offset(&EXEC_BASE, "LibList"), Some(0x17A));
        assert_eq!(offset(&EXEC_BASE, "PortList"), Some(0x188));
        assert_eq!(offset(&EXEC_BASE, "TaskReady"), Some(0x196));
        assert_eq!(offset(&EXEC_BASE, "TaskWait"), Some(0x1A4));
        assert_eq!(offset(&EXEC_BASE, "SemaphoreList"), Some(0x214));
    }
}

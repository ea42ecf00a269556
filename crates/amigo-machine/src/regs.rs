use std::fmt;
use std::sync::{Mutex, PoisonError};

/// 68k integer register slots visible to library calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Reg {
    D0,
    D1,
    D2,
    D3,
    D4,
    D5,
    D6,
    D7,
    A0,
    A1,
    A2,
    A3,
    A4,
    A5,
    A6,
    A7,
}

impl Reg {
    pub const ALL: [Reg; 16] = [
        Reg::D0,
        Reg::D1,
        Reg::D2,
        Reg::D3,
        Reg::D4,
        Reg::D5,
        Reg::D6,
        Reg::D7,
        Reg::A0,
        Reg::A1,
        Reg::A2,
        Reg::A3,
        Reg::A4,
        Reg::A5,
        Reg::A6,
        Reg::A7,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub const fn is_address(self) -> bool {
        self.index() >= 8
    }
}

impl fmt::Display for Reg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let i = self.index();
        if self.is_address() {
            write!(f, "a{}", i - 8)
        } else {
            write!(f, "d{i}")
        }
    }
}

/// Register access into the CPU emulator.
pub trait Cpu: Send + Sync {
    fn read_register(&self, reg: Reg) -> u32;
    fn write_register(&self, reg: Reg, value: u32);
}

/// Host-side register file used when no instruction emulator is attached.
#[derive(Debug, Default)]
pub struct RegisterFile {
    regs: Mutex<[u32; 16]>,
}

impl RegisterFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of all sixteen registers, `D0` first.
    pub fn snapshot(&self) -> [u32; 16] {
        *self.regs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Loads all sixteen registers from a [`snapshot`](Self::snapshot).
    pub fn restore(&self, regs: [u32; 16]) {
        *self.regs.lock().unwrap_or_else(PoisonError::into_inner) = regs;
    }
}

impl Cpu for RegisterFile {
    fn read_register(&self, reg: Reg) -> u32 {
        self.regs.lock().unwrap_or_else(PoisonError::into_inner)[reg.index()]
    }

    fn write_register(&self, reg: Reg, value: u32) {
        self.regs.lock().unwrap_or_else(PoisonError::into_inner)[reg.index()] = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_are_independent() {
        let cpu = RegisterFile::new();
        for (i, reg) in Reg::ALL.iter().enumerate() {
            cpu.write_register(*reg, i as u32 * 0x1111);
        }
        assert_eq!(cpu.read_register(Reg::D3), 0x3333);
        assert_eq!(cpu.read_register(Reg::A1), 0x9999);
        assert_eq!(cpu.snapshot()[15], 15 * 0x1111);
    }

    #[test]
    fn restore_replaces_every_register() {
        let cpu = RegisterFile::new();
        let saved = cpu.snapshot();
        cpu.write_register(Reg::D2, 0xAAAA);
        cpu.write_register(Reg::A7, 0x8000);
        let mut other = saved;
        other[Reg::D2.index()] = 0xBBBB;

        cpu.restore(other);
        assert_eq!(cpu.read_register(Reg::D2), 0xBBBB);
        assert_eq!(cpu.read_register(Reg::A7), 0);
    }

    #[test]
    fn display_uses_68k_names() {
        assert_eq!(Reg::D0.to_string(), "d0");
        assert_eq!(Reg::A6.to_string(), "a6");
    }
}

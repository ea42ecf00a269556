#![allow(dead_code)]

use amigo_exec::{ExecConfig, ExecFunction, ExecLib, ExecResult, TaskContext};
use amigo_machine::{Cpu, GuestMemory, Machine, MachineConfig, Reg};
use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

/// Machine and exec settings for one session, as read from JSON.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub machine: MachineConfig,
    pub exec: ExecConfig,
}

/// A booted exec personality plus helpers that poke it the way emulated code would.
pub struct Session {
    pub exec: ExecLib,
}

impl Session {
    pub fn new() -> Result<Self> {
        Self::with_config(SessionConfig::default())
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: SessionConfig =
            serde_json::from_str(json).context("failed to parse session config")?;
        Self::with_config(config)
    }

    pub fn with_config(config: SessionConfig) -> Result<Self> {
        init_tracing();
        let machine = Machine::new(&config.machine).context("failed to build machine")?;
        let exec = ExecLib::new(machine, config.exec).context("failed to set up exec")?;
        Ok(Self { exec })
    }

    pub fn live_blocks(&self) -> usize {
        self.exec.machine().alloc.live_blocks()
    }

    /// Copies `s` into a fresh guest block and returns its address.
    pub fn string(&self, s: &str) -> Result<u32> {
        let addr = self.alloc(amigo_machine::cstring_len(s) as u32, "harness_string")?;
        self.exec.machine().mem.write_cstring(addr, s)?;
        Ok(addr)
    }

    pub fn alloc(&self, size: u32, tag: &str) -> Result<u32> {
        self.exec
            .allocator()
            .allocate(size, tag)
            .ok_or_else(|| anyhow!("guest arena exhausted allocating {size} bytes for {tag}"))
    }

    pub fn free(&self, addr: u32) {
        self.exec.allocator().free(addr);
    }

    pub fn read_u32(&self, addr: u32) -> Result<u32> {
        Ok(self.exec.machine().mem.read_u32(addr)?)
    }

    pub fn write_u32(&self, addr: u32, value: u32) -> Result<()> {
        Ok(self.exec.machine().mem.write_u32(addr, value)?)
    }
}

/// Loads `args` into the registers, calls `function` through its library offset, and returns
/// `D0`.
pub fn call(
    ctx: &TaskContext<'_>,
    function: ExecFunction,
    args: &[(Reg, u32)],
) -> ExecResult<u32> {
    let cpu = &ctx.exec().machine().cpu;
    for &(reg, value) in args {
        cpu.write_register(reg, value);
    }
    ctx.dispatch(function.offset())?;
    Ok(cpu.read_register(Reg::D0))
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

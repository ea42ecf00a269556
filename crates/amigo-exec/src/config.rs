use serde::{Deserialize, Serialize};

/// Tunables of the exec layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecConfig {
    /// Signal bits every new task (and the out-of-task fallback registry) starts with allocated.
    pub reserved_signals: u32,
    /// Size of the stack block recorded in each task's `tc_SPLower`/`tc_SPUpper`.
    pub task_stack_size: u32,
    /// `lib_Version` and `SoftVer` of the library base.
    pub version: u16,
    pub revision: u16,
    /// Raw `AttnFlags`; 0 describes a plain 68000.
    pub attn_flags: u16,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            reserved_signals: 0x0000_FFFF,
            task_stack_size: 4096,
            version: 40,
            revision: 0,
            attn_flags: 0,
        }
    }
}

impl ExecConfig {
    pub fn from_json_str(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = ExecConfig::from_json_str(r#"{ "task_stack_size": 8192 }"#).unwrap();
        assert_eq!(config.task_stack_size, 8192);
        assert_eq!(config.reserved_signals, 0xFFFF);
        assert_eq!(config.version, 40);
        assert_eq!(config.attn_flags, 0);
    }

    #[test]
    fn unknown_types_are_rejected() {
        assert!(ExecConfig::from_json_str(r#"{ "reserved_signals": "all" }"#).is_err());
    }
}

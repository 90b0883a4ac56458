//! Platform constants and tunables.
//!
//! Defaults describe the firmware the loader was derived against. Several of
//! them are offsets into system binaries and must be re-derived whenever the
//! target build changes.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct Config {
    pub bridge: BridgeConfig,
    pub host: HostConfig,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Upper bound on single steps spent inside one staged call.
    pub step_limit: usize,
    /// Routine whose body contains the syscall instruction used as stub.
    pub syscall_stub_nid: &'static str,
    /// Distance from the routine's address to its syscall instruction.
    pub syscall_stub_offset: u64,
    /// Loader handles probed in order when resolving a symbol.
    pub library_handles: [u32; 2],
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            step_limit: 1_000_000,
            syscall_stub_nid: "HoLVWNanBBc",
            syscall_stub_offset: 0xa,
            library_handles: [0x1, 0x2001],
        }
    }
}

#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Bytes past the dynamic loader's entry where it calls main().
    ///
    /// Build specific. Re-derive by disassembling the loader entry of the
    /// target firmware.
    pub main_breakpoint_offset: u64,
    /// Trusted image executed by directly spawned hosts.
    pub spawn_helper: PathBuf,
    /// stdin, stdout and stderr of directly spawned hosts.
    pub debug_devices: [PathBuf; 3],
    /// Name of the process that forks launched applications.
    pub supervisor_name: String,
    pub default_process_name: String,
    pub app_exit_poll: Duration,
    pub app_exit_attempts: u32,
    pub decoy: DecoyConfig,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            main_breakpoint_offset: 58,
            spawn_helper: PathBuf::from("/system/vsh/app/NPXS40112/eboot.bin"),
            debug_devices: [
                PathBuf::from("/dev/deci_stdin"),
                PathBuf::from("/dev/deci_stdout"),
                PathBuf::from("/dev/deci_stderr"),
            ],
            supervisor_name: "SceSysCore.elf".to_string(),
            default_process_name: "payload".to_string(),
            app_exit_poll: Duration::from_secs(1),
            app_exit_attempts: 30,
            decoy: DecoyConfig::default(),
        }
    }
}

/// On-disk stand-in application used for the hijack pathway.
#[derive(Debug, Clone)]
pub struct DecoyConfig {
    pub root: PathBuf,
    /// System executable copied into the decoy on first use.
    pub base_executable: PathBuf,
    pub title_id: String,
    pub content_id: String,
    pub title_name: String,
}

impl Default for DecoyConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("/system_ex/app/FAKE00000"),
            base_executable: PathBuf::from("/system_ex/app/NPXS40106/eboot.bin"),
            title_id: "FAKE00000".to_string(),
            content_id: "IV9999-FAKE00000_00-HOMEBREWLOADER00".to_string(),
            title_name: "Homebrew Loader".to_string(),
        }
    }
}

impl Config {
    /// Defaults with overrides from HBLDR_STEP_LIMIT, HBLDR_MAIN_OFFSET and
    /// HBLDR_DECOY_ROOT.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Config::default();
        if let Some(limit) = lookup("HBLDR_STEP_LIMIT").and_then(|v| v.parse().ok()) {
            config.bridge.step_limit = limit;
        }
        if let Some(offset) = lookup("HBLDR_MAIN_OFFSET").and_then(|v| parse_u64(&v)) {
            config.host.main_breakpoint_offset = offset;
        }
        if let Some(root) = lookup("HBLDR_DECOY_ROOT").filter(|v| !v.is_empty()) {
            config.host.decoy.root = PathBuf::from(root);
        }
        config
    }
}

fn parse_u64(s: &str) -> Option<u64> {
    let s = s.trim();
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

//! In-process configuration contract.
//!
//! CLI parsing and the decoy-binary/IPC glue around the credential-service
//! strategy are out of scope for this crate (spec.md's "external
//! collaborator" note) -- a host binary builds a [`DumpConfig`] however it
//! likes (argv, a config file, a binary-serialised argument block handed
//! over by an injector) and passes it to [`crate::controller::run_dump`].
use serde::{Deserialize, Serialize};

/// Parameters for the "credential-service abuse" (MalSecLogon) handle
/// strategy. Only meaningful when [`DumpConfig::malseclogon`] is `Some`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MalSecLogonConfig {
    /// Path to the decoy binary the secondary-logon service will be asked
    /// to launch with alternate credentials.
    pub decoy_binary: std::path::PathBuf,
}

/// Mirrors the command-line surface documented in spec.md's EXTERNAL
/// INTERFACES table one field at a time; a host binary is responsible for
/// populating this from argv, a config file, or an IPC message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpConfig {
    /// Overrides PID discovery (`--pid`). `None` means "find lsass.exe by
    /// name".
    pub pid: Option<u32>,
    /// Emit the canonical MiniDump signature/version (`--valid`). `false`
    /// selects invalid-signature mode.
    pub valid_signature: bool,
    /// Apply the snapshot/fork strategy (`--fork`). Composable with `dup`
    /// and `malseclogon`.
    pub fork: bool,
    /// Apply the handle-duplication strategy (`--dup`).
    pub dup: bool,
    /// Apply the credential-service strategy (`--malseclogon`), combined
    /// with `dup`/`fork` per spec.md's composition rule.
    pub malseclogon: Option<MalSecLogonConfig>,
    /// Run as stage 2 of the credential-service rendezvous (`--stage2`):
    /// this invocation expects to find the leaked handle already sitting
    /// in its own handle table rather than acquiring one itself.
    pub stage2: bool,
    /// Upper bound on the synthesized dump's size in bytes. Exceeding it
    /// aborts with [`crate::error::Error::DumpTooLarge`] rather than
    /// growing the buffer without limit.
    pub max_size: usize,
    /// Restrict the module list to the allow-listed credential-bearing
    /// DLLs (`true`, the production default) or keep every module the
    /// target has loaded (`false`). spec.md notes this comparator "may be
    /// swapped to 'all modules' by a boolean parameter for diagnostic
    /// use" -- there is no `--` flag for it in the EXTERNAL INTERFACES
    /// table, so a host binary opts in by setting the field directly.
    pub important_only: bool,
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self {
            pid: None,
            valid_signature: true,
            fork: false,
            dup: false,
            malseclogon: None,
            stage2: false,
            // Generous enough to hold lsass's credential-bearing modules and
            // their important memory ranges; controller surfaces DumpTooLarge
            // well before actually exhausting address space.
            max_size: 256 * 1024 * 1024,
            important_only: true,
        }
    }
}

impl DumpConfig {
    /// Whether the credential-service strategy should have its own spawned
    /// decoy perform the dump locally ("stage 1 local": stage 2 executes in
    /// the spawned decoy and writes the dump file itself) rather than
    /// leaking the handle back for this invocation to use directly
    /// ("remote": `malseclogon` combined with `dup`), per spec.md §4.C.
    pub fn use_malseclogon_locally(&self) -> bool {
        self.malseclogon.is_some() && !self.dup
    }
}

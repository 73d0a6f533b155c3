//! Finding a target process by name.
//!
//! The process-listing *utility* (a reusable "list every process" CLI
//! surface) is out of scope; what's in scope is the one lookup the
//! controller actually needs -- snapshot the process table, compare names
//! case-insensitively, return the first match.
use windows_sys::Win32::System::Diagnostics::ToolHelp::{
    CreateToolhelp32Snapshot, Process32FirstW, Process32NextW, PROCESSENTRY32W,
    TH32CS_SNAPPROCESS,
};

use crate::error::Error;

/// Snapshots the system process table and returns every PID whose image
/// name matches `name` case-insensitively, in snapshot order.
pub fn find_all_by_name(name: &str) -> crate::Result<Vec<u32>> {
    let snapshot = unsafe { CreateToolhelp32Snapshot(TH32CS_SNAPPROCESS, 0) };
    if snapshot == windows_sys::Win32::Foundation::INVALID_HANDLE_VALUE {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }

    let mut matches = Vec::new();
    let mut entry = PROCESSENTRY32W {
        dwSize: std::mem::size_of::<PROCESSENTRY32W>() as u32,
        ..unsafe { std::mem::zeroed() }
    };

    let mut ok = unsafe { Process32FirstW(snapshot, &mut entry) };
    while ok != 0 {
        if exe_name(&entry.szExeFile).eq_ignore_ascii_case(name) {
            matches.push(entry.th32ProcessID);
        }
        ok = unsafe { Process32NextW(snapshot, &mut entry) };
    }

    unsafe {
        windows_sys::Win32::Foundation::CloseHandle(snapshot);
    }

    Ok(matches)
}

/// Snapshots the system process table and returns the PID of the first
/// process whose image name matches `name` case-insensitively.
///
/// Returns [`Error::TargetNotFound`] if nothing matches. The lsass-specific
/// convenience wrapper just calls this with `"lsass.exe"`.
pub fn find_process_by_name(name: &str) -> crate::Result<u32> {
    find_all_by_name(name)?
        .into_iter()
        .next()
        .ok_or_else(|| Error::TargetNotFound(name.to_string()))
}

/// Finds the running LSASS process, failing if there isn't exactly one --
/// a host being unsure which LSASS to target is a caller error the
/// controller surfaces rather than guesses at, unlike the first-match
/// behavior of [`find_process_by_name`].
pub fn find_lsass() -> crate::Result<u32> {
    let matches = find_all_by_name("lsass.exe")?;
    match matches.len() {
        0 => Err(Error::TargetNotFound("lsass.exe".to_string())),
        1 => Ok(matches[0]),
        _ => Err(Error::AmbiguousTarget("lsass.exe".to_string())),
    }
}

fn exe_name(raw: &[u16]) -> String {
    let len = raw.iter().position(|&c| c == 0).unwrap_or(raw.len());
    String::from_utf16_lossy(&raw[..len])
}

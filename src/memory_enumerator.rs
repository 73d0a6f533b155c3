//! Address-space enumeration and the region-selection predicate.
//!
//! Walks the target's address space one region at a time starting at
//! address 0, advancing the cursor by each returned region's size, and
//! keeps only the regions worth dumping: committed, accessible, not
//! file-backed, and -- for image mappings -- belonging to an allow-listed
//! module.
use windows_sys::Win32::Foundation::HANDLE;

use crate::modules::ModuleRecord;
use crate::ntapi::Gateway;

// MEMORY_BASIC_INFORMATION::State
const MEM_COMMIT: u32 = 0x1000;
// MEMORY_BASIC_INFORMATION::Type
const MEM_IMAGE: u32 = 0x1000000;
const MEM_MAPPED: u32 = 0x40000;
// MEMORY_BASIC_INFORMATION::Protect (bit flags, may combine with PAGE_GUARD/PAGE_NOCACHE)
const PAGE_NOACCESS: u32 = 0x01;
const PAGE_GUARD: u32 = 0x100;

/// One region of the target's address space selected for inclusion in the
/// dump.
#[derive(Debug, Clone, Copy)]
pub struct MemoryRange {
    pub base: u64,
    pub size: u64,
}

/// Enumerates `process`'s address space and returns every region the
/// selection predicate keeps.
///
/// The walk terminates on the first non-success query status, including
/// transient ones -- per spec, address-space walks do not recover from a
/// failed query, so the status itself is not inspected past success/failure.
pub fn enumerate_memory(gateway: &Gateway, process: HANDLE, important_modules: &[ModuleRecord]) -> Vec<MemoryRange> {
    let mut ranges = Vec::new();
    let mut cursor: u64 = 0;

    loop {
        if failspot::failspot!(crate::FailSpotName::QueryVirtualMemory) {
            break;
        }

        let (status, info) = gateway.query_virtual_memory(process, cursor);
        if !status.is_success() {
            break;
        }
        if info.region_size == 0 {
            break;
        }

        if should_include(&info, important_modules) {
            ranges.push(MemoryRange {
                base: info.base_address,
                size: info.region_size,
            });
        }

        let next = info.base_address.wrapping_add(info.region_size);
        if next <= cursor {
            break;
        }
        cursor = next;
    }

    ranges
}

fn should_include(info: &crate::ntapi::MemoryBasicInformation, important_modules: &[ModuleRecord]) -> bool {
    if info.state != MEM_COMMIT {
        return false;
    }
    if info.protect & PAGE_NOACCESS != 0 {
        return false;
    }
    if info.protect & PAGE_GUARD != 0 {
        return false;
    }
    if info.ty == MEM_MAPPED {
        return false;
    }
    if info.ty == MEM_IMAGE {
        return important_modules.iter().any(|m| m.contains(info.base_address));
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ntapi::MemoryBasicInformation;

    fn region(state: u32, protect: u32, ty: u32) -> MemoryBasicInformation {
        MemoryBasicInformation {
            base_address: 0x1000,
            allocation_base: 0x1000,
            allocation_protect: protect,
            region_size: 0x1000,
            state,
            protect,
            ty,
        }
    }

    #[test]
    fn skips_uncommitted() {
        let info = region(0x2000 /* MEM_RESERVE */, 0x04, MEM_IMAGE);
        assert!(!should_include(&info, &[]));
    }

    #[test]
    fn skips_noaccess_and_guard() {
        assert!(!should_include(&region(MEM_COMMIT, PAGE_NOACCESS, 0x20000), &[]));
        assert!(!should_include(&region(MEM_COMMIT, 0x04 | PAGE_GUARD, 0x20000), &[]));
    }

    #[test]
    fn skips_mapped() {
        assert!(!should_include(&region(MEM_COMMIT, 0x04, MEM_MAPPED), &[]));
    }

    #[test]
    fn image_requires_important_module_match() {
        let info = region(MEM_COMMIT, 0x04, MEM_IMAGE);
        assert!(!should_include(&info, &[]));

        let module = ModuleRecord {
            base: 0x1000,
            size: 0x2000,
            checksum: 0,
            timestamp: 0,
            path: "lsasrv.dll".into(),
            name_rva: 0,
        };
        assert!(should_include(&info, &[module]));
    }

    #[test]
    fn includes_private_committed_regions() {
        let info = region(MEM_COMMIT, 0x04, 0x20000 /* MEM_PRIVATE */);
        assert!(should_include(&info, &[]));
    }
}

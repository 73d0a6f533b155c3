//! PEB / loader-data structures and our own process's bootstrap resolver.
//!
//! Offsets below match the x86-64 `PEB`/`PEB_LDR_DATA`/
//! `LDR_DATA_TABLE_ENTRY` layout as of Windows 10/11. They are
//! undocumented implementation detail, not a stable contract, and have
//! shifted between major OS versions in the past -- see spec.md §9's note
//! on PEB-offset fragility. No WoW64 support: a 32-bit target is out of
//! scope (spec.md Non-goals), so only the x86-64 layout is implemented.

/// Offset of `Ldr` within `PEB`.
pub(crate) const PEB_LDR_OFFSET: usize = 0x18;
/// Offset of `InMemoryOrderModuleList` within `PEB_LDR_DATA`.
pub(crate) const LDR_IN_MEMORY_ORDER_MODULE_LIST_OFFSET: usize = 0x20;
/// Offset of `InMemoryOrderLinks` within `LDR_DATA_TABLE_ENTRY`. The list
/// nodes returned by walking this list point here, not at the start of the
/// entry -- subtract this offset to recover the entry's base address.
pub(crate) const ENTRY_IN_MEMORY_ORDER_LINKS_OFFSET: usize = 0x10;
pub(crate) const ENTRY_DLL_BASE_OFFSET: usize = 0x30;
pub(crate) const ENTRY_SIZE_OF_IMAGE_OFFSET: usize = 0x40;
/// `UNICODE_STRING FullDllName` -- the path we embed in the dump's
/// ModuleList stream (spec.md's `ModuleRecord.path` is a full pathname).
pub(crate) const ENTRY_FULL_DLL_NAME_OFFSET: usize = 0x48;
/// `UNICODE_STRING BaseDllName` -- just the filename, used only to find
/// `ntdll.dll` itself while bootstrapping the gateway.
pub(crate) const ENTRY_BASE_DLL_NAME_OFFSET: usize = 0x58;

/// Offsets of `PEB.OSMajorVersion`/`OSMinorVersion`/`OSBuildNumber`, read
/// out of the *target's* PEB (not our own) to populate the SystemInfoStream
/// without an extra `GetVersionEx`-style call. Per spec.md §9, these are
/// undocumented and not stable across OS versions.
pub(crate) const PEB_OS_MAJOR_VERSION_OFFSET: usize = 0x118;
pub(crate) const PEB_OS_MINOR_VERSION_OFFSET: usize = 0x11c;
pub(crate) const PEB_OS_BUILD_NUMBER_OFFSET: usize = 0x120;

/// Mirrors `UNICODE_STRING`: a counted, not nul-terminated, UTF-16 string.
#[repr(C)]
pub(crate) struct UnicodeString {
    pub length: u16,
    pub maximum_length: u16,
    _reserved: u32,
    pub buffer: u64,
}

/// Reads our own PEB's base address straight out of the TEB via the `gs`
/// segment, with no NT call involved -- this is how [`crate::ntapi::Gateway`]
/// bootstraps itself before any syscall function pointer exists to call.
#[cfg(target_arch = "x86_64")]
fn own_peb_address() -> u64 {
    let peb: u64;
    unsafe {
        std::arch::asm!("mov {}, gs:[0x60]", out(reg) peb, options(nostack, readonly));
    }
    peb
}

#[cfg(not(target_arch = "x86_64"))]
fn own_peb_address() -> u64 {
    compile_error!("lsass-dump-writer only implements the x86-64 PEB layout");
}

/// Reads a `T` out of our own address space at `address`. Only valid to
/// call with addresses known to belong to this process's own mappings --
/// used exclusively for walking our own loader data.
unsafe fn read_own<T: Copy>(address: u64) -> T {
    unsafe { std::ptr::read_unaligned(address as *const T) }
}

/// A resolved `ntdll.dll` mapped into our own process, ready for export
/// lookups.
pub struct NtdllModule {
    base: u64,
    size: u32,
}

impl NtdllModule {
    /// Parses the module's export directory and returns the address of
    /// `name`, cast to a thin function pointer the caller transmutes to
    /// the right signature.
    pub fn find_export(&self, name: &str) -> crate::Result<*const ()> {
        let image = unsafe { std::slice::from_raw_parts(self.base as *const u8, self.size as usize) };
        let pe = goblin::pe::PE::parse(image)?;
        let export = pe
            .exports
            .iter()
            .find(|e| e.name == Some(name))
            .ok_or(crate::error::Error::ReadFailed)?;
        let rva = export.rva;
        Ok((self.base as usize + rva) as *const ())
    }
}

/// Walks our own process's loader list looking for `ntdll.dll`. No syscall
/// is needed or available yet -- this runs before [`crate::ntapi::Gateway`]
/// exists, which is exactly why it has to be done this way.
pub fn ntdll_module() -> crate::Result<NtdllModule> {
    let peb = own_peb_address();
    let ldr: u64 = unsafe { read_own(peb + PEB_LDR_OFFSET as u64) };
    let list_head = ldr + LDR_IN_MEMORY_ORDER_MODULE_LIST_OFFSET as u64;

    let mut current: u64 = unsafe { read_own(list_head) }; // Flink
    while current != list_head {
        let entry_base = current - ENTRY_IN_MEMORY_ORDER_LINKS_OFFSET as u64;
        let dll_base: u64 = unsafe { read_own(entry_base + ENTRY_DLL_BASE_OFFSET as u64) };
        let size_of_image: u32 = unsafe { read_own(entry_base + ENTRY_SIZE_OF_IMAGE_OFFSET as u64) };
        let name = unsafe { read_unicode_string_own(entry_base + ENTRY_BASE_DLL_NAME_OFFSET as u64) };

        if name.eq_ignore_ascii_case("ntdll.dll") {
            return Ok(NtdllModule {
                base: dll_base,
                size: size_of_image,
            });
        }

        current = unsafe { read_own(current) }; // Flink of this node
    }

    Err(crate::error::Error::ReadFailed)
}

unsafe fn read_unicode_string_own(address: u64) -> String {
    let us: UnicodeString = unsafe { read_own(address) };
    if us.buffer == 0 || us.length == 0 {
        return String::new();
    }
    let units = unsafe {
        std::slice::from_raw_parts(us.buffer as *const u16, us.length as usize / 2)
    };
    String::from_utf16_lossy(units)
}

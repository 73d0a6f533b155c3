//! The on-disk MiniDump structures this crate emits, plus the two
//! generic section writers used to back-patch them into a growing buffer.
//!
//! Only the pieces needed for a 3-stream dump (header, directory,
//! SystemInfoStream, ModuleListStream, Memory64ListStream) are kept here;
//! thread, exception, and handle-data streams have no counterpart in this
//! crate and are not modeled.
use crate::Result;
use std::io::{Cursor, Write};

/* An MDRVA is an offset into the minidump file.  The beginning of the
 * MDRawHeader is at offset 0. */
type MDRVA = u32;

#[repr(C)]
#[derive(Debug, Default, PartialEq)]
pub struct MDVSFixedFileInfo {
    pub signature: u32,
    pub struct_version: u32,
    pub file_version_hi: u32,
    pub file_version_lo: u32,
    pub product_version_hi: u32,
    pub product_version_lo: u32,
    pub file_flags_mask: u32,
    pub file_flags: u32,
    pub file_os: u32,
    pub file_type: u32,
    pub file_subtype: u32,
    pub file_date_hi: u32,
    pub file_date_lo: u32,
}

#[repr(C)]
#[derive(Debug, Default, PartialEq)]
pub struct MDLocationDescriptor {
    pub data_size: u32,
    pub rva: MDRVA,
}

#[repr(C)]
#[derive(Debug, Default, PartialEq)]
pub struct MDMemoryDescriptor64 {
    pub start_of_memory_range: u64,
    pub data_size: u64,
}

#[repr(C)]
#[derive(Debug, Default, PartialEq)]
pub struct MDRawHeader {
    pub signature: u32,
    pub version: u32,
    pub stream_count: u32,
    pub stream_directory_rva: MDRVA,
    pub checksum: u32,
    pub time_date_stamp: u32, /* time_t */
    pub flags: u64,
}

#[repr(C)]
#[derive(Debug, Default, PartialEq)]
pub struct MDRawDirectory {
    pub stream_type: u32,
    pub location: MDLocationDescriptor,
}

#[repr(C)]
#[derive(Debug, Default, PartialEq)]
pub struct MDRawModule {
    pub base_of_image: u64,
    pub size_of_image: u32,
    pub checksum: u32,        /* 0 if unknown */
    pub time_date_stamp: u32, /* time_t */
    pub module_name_rva: MDRVA,
    pub version_info: MDVSFixedFileInfo,
    pub cv_record: MDLocationDescriptor,
    pub misc_record: MDLocationDescriptor,

    /* Defined by the platform SDK as two 64-bit reserved quantities; split
     * into 32-bit pairs here for predictable alignment, same workaround the
     * upstream format headers use. Always written as zero -- the upstream
     * C tool this was ported from writes reserved0 twice and never
     * reserved1, which is a transcription bug in that source, not part of
     * the format; both are zeroed here. */
    pub reserved0: [u32; 2],
    pub reserved1: [u32; 2],
}

// The inclusion of a 64-bit type in MINIDUMP_MODULE forces the struct to be
// tail-padded out to a multiple of 64 bits under some ABIs. This doesn't
// occur on systems that don't tail-pad this way, where the real size is
// 108. TODO: we currently ignore this and use size_of::<MDRawModule>()
// everywhere instead of this constant.
pub const MD_MODULE_SIZE: usize = 108;

/// `MINIDUMP_SYSTEM_INFO`. `processor_level`, `processor_revision`,
/// `number_of_processors`, and the architecture-specific `cpu` feature
/// union are deliberately left zeroed -- a known deviation from what the
/// OS dumper would populate, acceptable per spec since no consumer of this
/// dump inspects them for this crate's purposes.
#[repr(C)]
#[derive(Debug, Default, PartialEq)]
pub struct MDRawSystemInfo {
    pub processor_architecture: u16,
    pub processor_level: u16,
    pub processor_revision: u16,
    pub number_of_processors: u8,
    pub product_type: u8,
    pub major_version: u32,
    pub minor_version: u32,
    pub build_number: u32,
    pub platform_id: u32,
    pub csd_version_rva: MDRVA,
    pub suite_mask: u16,
    pub reserved2: u16,
    pub cpu: [u8; 24],
}

pub const MD_CPU_ARCHITECTURE_AMD64: u16 = 9;
pub const VER_PLATFORM_WIN32_NT: u32 = 2;
pub const VER_NT_WORKSTATION: u8 = 1;

/* For (MDRawHeader).signature and (MDRawHeader).version.  Note that only the
 * low 16 bits of (MDRawHeader).version are MD_HEADER_VERSION.  Per the
 * documentation, the high 16 bits are implementation-specific. */
pub const MD_HEADER_SIGNATURE: u32 = 0x504d444d; /* 'PMDM' */
pub const MD_HEADER_VERSION: u32 = 0x0000a793; /* 42899 */

/* For (MDRawHeader).flags: */
pub enum MDType {
    Normal = 0x00000000,
    WithDataSegs = 0x00000001,
    WithFullMemory = 0x00000002,
    WithHandleData = 0x00000004,
    FilterMemory = 0x00000008,
    ScanMemory = 0x00000010,
    WithUnloadedModules = 0x00000020,
    WithIndirectlyReferencedMemory = 0x00000040,
    FilterModulePaths = 0x00000080,
    WithProcessThreadData = 0x00000100,
    WithPrivateReadWriteMemory = 0x00000200,
    WithoutOptionalData = 0x00000400,
    WithFullMemoryInfo = 0x00000800,
    WithThreadInfo = 0x00001000,
    WithCodeSegs = 0x00002000,
    WithoutAuxilliarySegs = 0x00004000,
    WithFullAuxilliaryState = 0x00008000,
    WithPrivateWriteCopyMemory = 0x00010000,
    IgnoreInaccessibleMemory = 0x00020000,
    WithTokenInformation = 0x00040000,
}

/* For (MDRawDirectory).stream_type */
pub enum MDStreamType {
    UnusedStream = 0,
    ReservedStream0 = 1,
    ReservedStream1 = 2,
    ThreadListStream = 3,
    ModuleListStream = 4, /* MDRawModuleList */
    MemoryListStream = 5,
    ExceptionStream = 6,
    SystemInfoStream = 7, /* MDRawSystemInfo */
    ThreadExListStream = 8,
    Memory64ListStream = 9,
    CommentStreamA = 10,
    CommentStreamW = 11,
    HandleDataStream = 12,
    FunctionTableStream = 13,
    UnloadedModuleListStream = 14,
    MiscInfoStream = 15,
    MemoryInfoListStream = 16,
    ThreadInfoListStream = 17,
    HandleOperationListStream = 18,
    TokenStream = 19,
    JavascriptDataStream = 20,
    SystemMemoryInfoStream = 21,
    ProcessVmCountersStream = 22,
    LastReservedStream = 0x0000ffff,
}

#[derive(Debug, PartialEq)]
pub struct SectionWriter<T: Default + Sized> {
    pub position: MDRVA,
    phantom: std::marker::PhantomData<T>,
}

impl<T> SectionWriter<T>
where
    T: Default + Sized,
{
    /// Create a slot for a type T in the buffer, we can fill right now with real values.
    pub fn alloc_with_val(buffer: &mut Cursor<Vec<u8>>, val: T) -> Result<Self> {
        let position = buffer.position();
        let bytes = unsafe {
            std::slice::from_raw_parts(&val as *const T as *const u8, std::mem::size_of::<T>())
        };
        buffer.write_all(bytes)?;

        Ok(SectionWriter {
            position: position as u32,
            phantom: std::marker::PhantomData::<T> {},
        })
    }

    /// Create a slot for a type T in the buffer, we can fill later with real values.
    pub fn alloc(buffer: &mut Cursor<Vec<u8>>) -> Result<Self> {
        let val: T = Default::default();
        Self::alloc_with_val(buffer, val)
    }

    /// Write actual values in the buffer-slot we got during `alloc()`
    pub fn set_value(&mut self, buffer: &mut Cursor<Vec<u8>>, val: T) -> Result<()> {
        let curr_pos = buffer.position();

        buffer.set_position(self.position as u64);
        let bytes = unsafe {
            std::slice::from_raw_parts(&val as *const T as *const u8, std::mem::size_of::<T>())
        };
        let res = buffer.write_all(bytes);

        buffer.set_position(curr_pos);

        res?;
        Ok(())
    }

    pub fn location(&self) -> MDLocationDescriptor {
        MDLocationDescriptor {
            data_size: std::mem::size_of::<T>() as u32,
            rva: self.position,
        }
    }
}

#[derive(Debug, PartialEq)]
pub struct SectionArrayWriter<T: Default + Sized> {
    pub position: MDRVA,
    array_size: usize,
    phantom: std::marker::PhantomData<T>,
}

impl<T> SectionArrayWriter<T>
where
    T: Default + Sized,
{
    /// Create a slot for a type T in the buffer, we can fill later with real values.
    pub fn alloc_array(buffer: &mut Cursor<Vec<u8>>, array_size: usize) -> Result<Self> {
        let position = buffer.position();
        for _ in 0..array_size {
            let val: T = Default::default();
            let bytes = unsafe {
                std::slice::from_raw_parts(&val as *const T as *const u8, std::mem::size_of::<T>())
            };
            buffer.write_all(bytes)?;
        }

        Ok(SectionArrayWriter {
            position: position as u32,
            array_size,
            phantom: std::marker::PhantomData::<T> {},
        })
    }

    pub fn location(&self) -> MDLocationDescriptor {
        MDLocationDescriptor {
            data_size: (std::mem::size_of::<T>() * self.array_size) as u32,
            rva: self.position,
        }
    }

    /// Write actual values in the buffer-slot we got during `alloc()`
    pub fn set_value_at(
        &mut self,
        buffer: &mut Cursor<Vec<u8>>,
        val: T,
        index: usize,
    ) -> Result<()> {
        let curr_pos = buffer.position();

        buffer.set_position(self.position as u64 + (std::mem::size_of::<T>() * index) as u64);
        let bytes = unsafe {
            std::slice::from_raw_parts(&val as *const T as *const u8, std::mem::size_of::<T>())
        };
        let res = buffer.write_all(bytes);

        buffer.set_position(curr_pos);

        res?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_info_struct_is_56_bytes() {
        assert_eq!(std::mem::size_of::<MDRawSystemInfo>(), 56);
    }

    #[test]
    fn section_writer_backpatches_in_place() {
        let mut buffer = Cursor::new(Vec::new());
        let mut writer = SectionWriter::<u32>::alloc(&mut buffer).unwrap();
        buffer.write_all(&[0xAA; 4]).unwrap();
        writer.set_value(&mut buffer, 0xdead_beef).unwrap();

        let bytes = buffer.into_inner();
        assert_eq!(&bytes[0..4], &0xdead_beefu32.to_ne_bytes());
        assert_eq!(&bytes[4..8], &[0xAA; 4]);
    }

    #[test]
    fn section_array_writer_indexes_correctly() {
        let mut buffer = Cursor::new(Vec::new());
        let mut writer = SectionArrayWriter::<u64>::alloc_array(&mut buffer, 3).unwrap();
        writer.set_value_at(&mut buffer, 1, 0).unwrap();
        writer.set_value_at(&mut buffer, 2, 1).unwrap();
        writer.set_value_at(&mut buffer, 3, 2).unwrap();

        let bytes = buffer.into_inner();
        assert_eq!(u64::from_ne_bytes(bytes[0..8].try_into().unwrap()), 1);
        assert_eq!(u64::from_ne_bytes(bytes[8..16].try_into().unwrap()), 2);
        assert_eq!(u64::from_ne_bytes(bytes[16..24].try_into().unwrap()), 3);
    }
}

//! Synthesizes a MiniDump-format snapshot of a running Windows process into a
//! caller-owned buffer, without going through `MiniDumpWriteDump`.
//!
//! The crate is organized the same way the dump flows: [`process_list`] and
//! [`modules`] find the target and its credential-bearing DLLs,
//! [`handle_acquisition`] turns that into a usable process handle,
//! [`memory_enumerator`] decides which pages are worth keeping, and
//! [`dump_writer`] serializes all of it through [`minidump_format`]'s
//! section writers. [`controller`] sequences the whole thing and is the
//! crate's main entry point.
#![allow(clippy::useless_conversion)]

cfg_if::cfg_if! {
    if #[cfg(target_os = "windows")] {
        mod ntapi;
        mod peb;

        pub mod config;
        pub mod controller;
        pub mod dump_writer;
        pub mod error;
        pub mod error_list;
        pub mod handle_acquisition;
        pub mod memory_enumerator;
        pub mod minidump_format;
        pub mod modules;
        pub mod process_list;
        pub mod sink;

        pub use config::DumpConfig;
        pub use controller::run_dump;
        pub use error::Error;
    } else {
        compile_error!("lsass-dump-writer only supports target_os = \"windows\": it walks PEB/loader structures and calls NT APIs directly");
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Fault-injection points used by integration tests to force failures that
/// would otherwise require a real, privileged target process (buffer
/// exhaustion, a partial memory read, address-space query exhaustion).
///
/// Compiled away entirely unless the `failspot/enabled` feature is turned on
/// (dev-dependency only), so none of this exists in a release build.
failspot::failspot_name! {
    pub enum FailSpotName {
        QueryVirtualMemory,
        ReadVirtualMemoryPartialCopy,
        DumpTooLarge,
        OpenProcess,
    }
}

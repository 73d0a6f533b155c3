use thiserror::Error;

/// Fatal errors that abort a dump attempt entirely.
///
/// Anything that leaves the target process and its modules in a usable
/// (if incomplete) state belongs in [`crate::error_list::SoftErrorList`]
/// instead -- these variants are for failures where continuing would just
/// produce garbage or nothing at all.
#[derive(Debug, Error)]
pub enum Error {
    #[error("this process is not running with SeDebugPrivilege, or the target is otherwise inaccessible")]
    PrivilegeDenied,

    #[error("could not find a running process named {0:?}")]
    TargetNotFound(String),

    #[error("more than one process named {0:?} is running and no pid was given")]
    AmbiguousTarget(String),

    #[error("failed to acquire a usable handle to pid {pid}: {status}")]
    HandleDenied { pid: u32, status: crate::ntapi::NtStatus },

    #[error("duplicated/cloned handle was meant to resolve to pid {expected} but actually resolves to pid {actual}")]
    HandleTargetMismatch { expected: u32, actual: u32 },

    #[error("NtQueryVirtualMemory failed while walking the target's address space: {0}")]
    AddressSpaceQueryFailed(crate::ntapi::NtStatus),

    #[error("failed to read the target's PEB or loader data")]
    ReadFailed,

    #[error("none of the allow-listed modules were found in the target process")]
    NoImportantModules,

    #[error("the synthesized dump exceeded the caller-supplied buffer budget ({0} bytes)")]
    DumpTooLarge(usize),

    #[error("failed to deliver the finished dump to its destination")]
    SinkFailed(#[source] std::io::Error),

    #[error("the MalSecLogon duplication handshake failed: {0}")]
    MalSecLogonFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Pe(#[from] goblin::error::Error),

    #[error(transparent)]
    Format(#[from] scroll::Error),

    #[error("system clock is before the Unix epoch")]
    Time(#[from] std::time::SystemTimeError),
}

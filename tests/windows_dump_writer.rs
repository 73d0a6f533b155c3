//! End-to-end coverage driving `controller::dump_to_buffer` against a real
//! (if unprivileged) child process, checking the result with the `minidump`
//! crate rather than only our own writer/reader round trip (P8).
//!
//! Scenarios 5 (handle duplication via an auxiliary process) and 6
//! (MalSecLogon's stage split) need a privileged target and a second logon
//! session respectively, so those two are `#[ignore]`d rather than run by
//! default -- they document the scenario and the exact invocation a
//! privileged CI runner would use, per the teacher's own convention of
//! `#[ignore]`-marking tests that need more than a plain child process.
#![cfg(windows)]

use std::time::Duration;

use lsass_dump_writer::config::DumpConfig;
use lsass_dump_writer::{controller, Error, FailSpotName};
use minidump::{Minidump, MinidumpModuleList, MinidumpSystemInfo};

fn spawn_target() -> std::process::Child {
    std::process::Command::new("cmd.exe")
        .args(["/C", "timeout", "/T", "30", "/NOBREAK"])
        .spawn()
        .expect("failed to spawn a throwaway target process")
}

fn kill(mut child: std::process::Child) {
    let _ = child.kill();
    let _ = child.wait();
}

#[test]
fn dumps_a_real_process_and_a_real_consumer_accepts_it() {
    let child = spawn_target();
    let config = DumpConfig {
        pid: Some(child.id()),
        valid_signature: true,
        // `cmd.exe` never loads any of the allow-listed credential DLLs,
        // so the default important_only=true filter would leave the
        // module list empty and fail with NoImportantModules. This test
        // is only checking that a real process round-trips through a
        // real consumer, not the allow-list itself, so ask for every
        // module per spec.md's documented diagnostic escape hatch.
        important_only: false,
        ..Default::default()
    };

    let outcome = controller::dump_to_buffer(&config).expect("dump should succeed");
    assert_eq!(&outcome.buffer[0..4], b"MDMP");

    let mut tmpfile = tempfile::Builder::new()
        .prefix("lsass_dump_writer_test")
        .tempfile()
        .unwrap();
    lsass_dump_writer::sink::write_to_path(&outcome.buffer, tmpfile.path()).unwrap();

    let dump = Minidump::read_path(tmpfile.path()).expect("failed to read back our own minidump");
    let _system_info: MinidumpSystemInfo = dump.get_stream().expect("missing SystemInfoStream");
    let modules: MinidumpModuleList = dump.get_stream().expect("missing ModuleListStream");
    assert!(modules.iter().count() > 0);

    tmpfile.close().ok();
    kill(child);
}

#[test]
fn invalid_signature_mode_hides_the_canonical_bytes_but_patches_back_clean() {
    let child = spawn_target();
    let config = DumpConfig {
        pid: Some(child.id()),
        valid_signature: false,
        important_only: false,
        ..Default::default()
    };

    let outcome = controller::dump_to_buffer(&config).expect("dump should succeed");
    assert_ne!(&outcome.buffer[0..4], b"MDMP");

    let mut patched = outcome.buffer.clone();
    patched[0..4].copy_from_slice(&0x504d_444du32.to_le_bytes());
    patched[4..8].copy_from_slice(&0x0000_a793u32.to_le_bytes());

    let mut tmpfile = tempfile::Builder::new()
        .prefix("lsass_dump_writer_test_patched")
        .tempfile()
        .unwrap();
    lsass_dump_writer::sink::write_to_path(&patched, tmpfile.path()).unwrap();

    let dump = Minidump::read_path(tmpfile.path()).expect("patched dump should be a valid minidump");
    let _system_info: MinidumpSystemInfo = dump.get_stream().expect("missing SystemInfoStream");

    tmpfile.close().ok();
    kill(child);
}

#[test]
fn dump_too_large_is_rejected_instead_of_silently_truncated() {
    let mut client = FailSpotName::testing_client();
    client.set_enabled(FailSpotName::DumpTooLarge, true);

    let child = spawn_target();
    let config = DumpConfig {
        pid: Some(child.id()),
        important_only: false,
        ..Default::default()
    };

    let result = controller::dump_to_buffer(&config);
    client.set_enabled(FailSpotName::DumpTooLarge, false);
    kill(child);

    assert!(matches!(result, Err(Error::DumpTooLarge(_))));
}

#[test]
fn a_forced_partial_memory_copy_is_a_soft_error_not_a_failed_dump() {
    let mut client = FailSpotName::testing_client();
    client.set_enabled(FailSpotName::ReadVirtualMemoryPartialCopy, true);

    let child = spawn_target();
    let config = DumpConfig {
        pid: Some(child.id()),
        important_only: false,
        ..Default::default()
    };

    let outcome = controller::dump_to_buffer(&config);
    client.set_enabled(FailSpotName::ReadVirtualMemoryPartialCopy, false);
    kill(child);

    let outcome = outcome.expect("a partial copy on every range should still finish the dump");
    assert!(!outcome.soft_errors.is_empty());
}

#[test]
#[ignore = "needs a target the caller can't open directly but can reach via a handle-duplicating auxiliary process"]
fn handle_duplication_strategy_dumps_a_process_we_cannot_open_directly() {
    let child = spawn_target();
    let config = DumpConfig {
        pid: Some(child.id()),
        dup: true,
        important_only: false,
        ..Default::default()
    };
    let outcome = controller::dump_to_buffer(&config).expect("dump via duplicated handle should succeed");
    assert!(!outcome.buffer.is_empty());
    kill(child);
}

#[test]
#[ignore = "needs a real secondary logon session and a decoy binary; stage 2 must run as a separate process"]
fn malseclogon_stage_split_hands_off_to_a_spawned_decoy() {
    let config = DumpConfig {
        pid: Some(std::process::id()),
        malseclogon: Some(lsass_dump_writer::config::MalSecLogonConfig {
            decoy_binary: std::path::PathBuf::from("C:\\Windows\\System32\\notepad.exe"),
        }),
        ..Default::default()
    };
    match controller::run_dump(&config).expect("stage 1 should at least spawn the decoy") {
        controller::RunOutcome::SpawnedLocalStage2 { decoy_pid } => {
            std::thread::sleep(Duration::from_millis(100));
            assert!(decoy_pid > 0);
        }
        controller::RunOutcome::Dumped(_) => panic!("local MalSecLogon stage 1 should not dump directly"),
    }
}

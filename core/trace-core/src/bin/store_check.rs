//! Startup self-check for a trace store.
//!
//! Sweeps stale temp files, validates every session record and event log,
//! runs a reconciliation pass and prints a summary. Pass a directory to check
//! a store other than the one named by the environment.

use std::process::ExitCode;

use trace_core::{cleanup_orphaned_temp_files, validate_write, StorageConfig, TraceStore};

fn main() -> ExitCode {
    let storage = match std::env::args().nth(1) {
        Some(root) => StorageConfig::with_root(root),
        None => match StorageConfig::from_env() {
            Ok(storage) => storage,
            Err(e) => {
                eprintln!("Cannot resolve store root: {}", e);
                return ExitCode::FAILURE;
            }
        },
    };

    let store = match TraceStore::open(storage) {
        Ok(store) => store,
        Err(e) => {
            eprintln!("Cannot open store: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let storage = store.storage();
    let mut problems = 0usize;

    println!("═══════════════════════════════════════════════════════════");
    println!("  Trace Store Check");
    println!("═══════════════════════════════════════════════════════════");
    println!();
    println!("Store root: {}", storage.root().display());
    println!();

    println!("── Temp Files ────────────────────────────────────────────");
    let stats = cleanup_orphaned_temp_files(storage.root(), store.config().temp_file_max_age());
    println!("  scanned {} │ removed {}", stats.scanned, stats.removed);
    for error in &stats.errors {
        problems += 1;
        println!("  ✗ {}", error);
    }
    println!();

    println!("── Session Records ───────────────────────────────────────");
    let session_ids = store.registry().session_ids().unwrap_or_else(|e| {
        problems += 1;
        println!("  ✗ cannot list sessions: {}", e);
        Vec::new()
    });
    let mut valid = 0usize;
    for id in &session_ids {
        match validate_write(&storage.session_file(id)) {
            Ok(()) => valid += 1,
            Err(e) => {
                problems += 1;
                println!("  ✗ {}", e);
            }
        }
    }
    println!("  {} of {} valid", valid, session_ids.len());
    println!();

    println!("── Event Logs ────────────────────────────────────────────");
    let logged = match std::fs::read_dir(storage.events_dir()) {
        Ok(entries) => entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_file())
            .filter(|path| path.extension().map(|e| e == "json").unwrap_or(false))
            .collect::<Vec<_>>(),
        Err(_) => Vec::new(),
    };
    let mut valid = 0usize;
    for path in &logged {
        match validate_write(path) {
            Ok(()) => valid += 1,
            Err(e) => {
                problems += 1;
                println!("  ✗ {}", e);
            }
        }
    }
    println!("  {} of {} valid", valid, logged.len());
    println!();

    println!("── Reconciliation ────────────────────────────────────────");
    match store.reconcile() {
        Ok(report) => {
            println!(
                "  buckets {} │ records {} │ adopted {} │ still waiting {}",
                report.buckets_scanned,
                report.records_scanned,
                report.adopted,
                report.still_waiting
            );
        }
        Err(e) => {
            problems += 1;
            println!("  ✗ {}", e);
        }
    }
    println!();

    println!("── Session Forest ────────────────────────────────────────");
    match store.session_tree() {
        Ok(forest) if forest.is_empty() => println!("  (no sessions)"),
        Ok(forest) => {
            for root in &forest {
                println!(
                    "  {} │ {:?} │ {} session(s)",
                    root.session.id,
                    root.session.status,
                    root.session_count()
                );
            }
        }
        Err(e) => {
            problems += 1;
            println!("  ✗ {}", e);
        }
    }
    println!();

    println!("═══════════════════════════════════════════════════════════");
    if problems == 0 {
        println!("  Check complete: no problems");
    } else {
        println!("  Check complete: {} problem(s)", problems);
    }
    println!("═══════════════════════════════════════════════════════════");

    if problems == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

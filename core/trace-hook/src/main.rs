//! trace-hook: records agent sessions and events into the trace store.
//!
//! Called from agent hooks. The session comes from the inherited environment
//! (`TRACE_SESSION_ID`, or `TRACE_PARENT_SESSION_ID` + `TRACE_OWNER_LABEL`),
//! never from "whatever ran last".
//!
//! ## Subcommands
//!
//! - `session-start`: resolve or create this process's session, print its id
//! - `session-end`: mark it completed or failed
//! - `event-start`: record an event, print its id
//! - `event-end`: resolve a pending event
//! - `child-env`: print the variables to export into a delegate process
//! - `reconcile`: adopt orphans whose parent now exists
//! - `tree`: print the session forest as JSON
//!
//! Store failures are logged and the exit code stays 0, so a broken store
//! never blocks the agent being observed.

mod commands;
mod logging;

use clap::{Parser, Subcommand};
use trace_core::{ContextSource, StorageConfig, TraceStore};

use commands::{EventOutcome, EventStart, SessionOutcome};

#[derive(Parser)]
#[command(name = "trace-hook")]
#[command(about = "Agent session and event attribution recorder")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve or create this process's session and print its id
    SessionStart {
        /// Owner label for a delegate session (overrides TRACE_OWNER_LABEL)
        #[arg(long)]
        label: Option<String>,
    },

    /// Mark this process's session as ended
    SessionEnd {
        #[arg(long, value_enum, default_value = "completed")]
        status: SessionOutcome,
    },

    /// Record an event and print its id
    EventStart {
        /// Event kind (e.g. tool name)
        #[arg(long)]
        kind: String,

        /// Event id other processes already know (generated if omitted)
        #[arg(long)]
        id: Option<String>,

        /// Short payload summary (truncated by the store)
        #[arg(long)]
        summary: Option<String>,

        /// Parent event or session id (overrides TRACE_PARENT_EVENT_ID)
        #[arg(long)]
        parent: Option<String>,
    },

    /// Resolve a pending event
    EventEnd {
        #[arg(long)]
        id: String,

        #[arg(long, value_enum, default_value = "succeeded")]
        status: EventOutcome,
    },

    /// Print KEY=VALUE lines for a delegate process's environment
    ChildEnv {
        /// Owner label of the delegate
        #[arg(long)]
        label: String,

        /// Event that requested the delegation
        #[arg(long)]
        parent_event: Option<String>,
    },

    /// Adopt orphans whose parent now exists
    Reconcile,

    /// Print the session forest as JSON
    Tree,
}

fn main() {
    let cli = Cli::parse();

    let storage = match StorageConfig::from_env() {
        Ok(storage) => storage,
        Err(e) => {
            eprintln!("trace-hook: {}", e);
            return;
        }
    };
    let _logging_guard = logging::init(&storage);

    let store = match TraceStore::open(storage) {
        Ok(store) => store,
        Err(e) => {
            tracing::error!(error = %e, "Failed to open trace store");
            return;
        }
    };

    let ctx = ContextSource::from_env();
    let (name, result) = match cli.command {
        Commands::SessionStart { label } => (
            "session-start",
            commands::session_start(&store, &ctx.with_owner_label(label)),
        ),
        Commands::SessionEnd { status } => (
            "session-end",
            commands::session_end(&store, &ctx, status),
        ),
        Commands::EventStart {
            kind,
            id,
            summary,
            parent,
        } => (
            "event-start",
            commands::event_start(
                &store,
                &ctx,
                EventStart {
                    kind,
                    id,
                    summary,
                    parent,
                },
            ),
        ),
        Commands::EventEnd { id, status } => {
            ("event-end", commands::event_end(&store, &id, status))
        }
        Commands::ChildEnv {
            label,
            parent_event,
        } => (
            "child-env",
            commands::child_env_lines(&store, &ctx, &label, parent_event.as_deref()),
        ),
        Commands::Reconcile => ("reconcile", commands::reconcile(&store)),
        Commands::Tree => ("tree", commands::tree(&store)),
    };

    match result {
        Ok(output) => println!("{}", output),
        Err(e) => tracing::warn!(command = name, error = %e, "trace-hook command failed"),
    }
}

//! CLI smoke entry point.
//!
//! # Responsibility
//! - Drive one in-memory stack end to end: background insert, merge into
//!   main, persist, fetch.
//! - Optionally start file logging so store lifecycle and fatal events land
//!   in `--log-dir`.
//! - Keep output deterministic for quick local sanity checks.

use clap::Parser;
use datastack_core::{
    attributes, core_version, default_log_level, init_logging, Context, DataStack,
    EntityDescription, FetchRequest, Model, PersistNotification, StackConfig, StoreType,
};
use log::error;
use serde_json::json;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc;

/// Smoke run of an in-memory data stack.
#[derive(Parser)]
#[command(name = "datastack")]
struct Cli {
    /// Absolute directory for rolling log files (logging is off when unset)
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    println!("datastack_core version={}", core_version());

    if let Some(log_dir) = &cli.log_dir {
        let level = cli.log_level.as_deref().unwrap_or(default_log_level());
        if let Err(err) = init_logging(level, log_dir) {
            eprintln!("logging init failed: {err}");
            return ExitCode::FAILURE;
        }
    }

    match smoke_run() {
        Ok(summary) => {
            println!("{summary}");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("event=smoke_run module=cli status=error error={err}");
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}

fn smoke_run() -> Result<String, String> {
    let model = Model::new(
        "Smoke",
        [EntityDescription::new("User", ["remoteID", "name"])],
    )
    .map_err(|err| format!("invalid smoke model: {err}"))?;

    let config = StackConfig::new("Smoke")
        .with_store_type(StoreType::InMemory)
        .with_test_mode(true);
    let stack = DataStack::with_model(config, model);
    let events = stack.persist_events();

    let (insert_tx, insert_rx) = mpsc::channel();
    stack.perform_in_new_background_context(move |context| {
        let inserted = context.insert(
            "User",
            attributes([("remoteID", json!(1)), ("name", json!("Joshua Ivanof"))]),
        );
        let outcome = inserted.and_then(|_| context.save());
        if insert_tx.send(outcome.map_err(|err| err.to_string())).is_err() {
            error!("event=smoke_run module=cli status=error reason=insert_receiver_gone");
        }
    });
    insert_rx
        .recv()
        .map_err(|_| "background insert never completed".to_string())?
        .map_err(|err| format!("background insert failed: {err}"))?;

    let (done_tx, done_rx) = mpsc::channel();
    stack.persist(move |outcome| {
        if done_tx.send(outcome.map_err(|err| err.to_string())).is_err() {
            error!("event=smoke_run module=cli status=error reason=persist_receiver_gone");
        }
    });
    done_rx
        .recv()
        .map_err(|_| "persist completion was dropped".to_string())?
        .map_err(|err| format!("persist failed: {err}"))?;

    let persisted = matches!(events.try_recv(), Ok(PersistNotification::DidPersist));
    let users = count_users(&stack.main_context())?;
    let committed_users = count_users(&stack.new_background_context(Some("smoke.check")))?;

    Ok(format!(
        "main_users={users} committed_users={committed_users} did_persist={persisted}"
    ))
}

fn count_users(context: &Context) -> Result<usize, String> {
    context
        .count(&FetchRequest::new("User"))
        .map_err(|err| format!("count in {} context failed: {err}", context.kind()))
}

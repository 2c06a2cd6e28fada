//! corral worker process.
//!
//! Reads length-prefixed `TaskMessage`s from stdin, runs the requested operation and writes
//! `ReplyMessage`s to stdout. Exits cleanly when stdin closes. Logs go to stderr.

mod ops;

use std::io::{self, BufReader, BufWriter};

use anyhow::Context;
use clap::Parser;
use corral_core::ipc::{read_frame, run_task, write_frame};
use corral_core::serialize::DEFAULT_MAX_DEPTH;
use corral_core::{Encoding, MessageSerializer, SerializerConfig, TaskMessage};

#[derive(Parser)]
#[command(name = "corral-worker")]
#[command(about = "Worker process for corral task pools")]
#[command(version)]
struct Cli {
    /// Message encoding on stdin/stdout (json or bincode)
    #[arg(long, default_value = "json")]
    encoding: String,

    /// Rebuild special types from incoming type information
    #[arg(long)]
    preserve_types: bool,

    /// Attach type information to results
    #[arg(long)]
    include_type_info: bool,

    /// Maximum nesting depth of results
    #[arg(long, default_value_t = DEFAULT_MAX_DEPTH)]
    max_depth: usize,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();

    let encoding: Encoding = cli.encoding.parse()?;
    let mut serializer = MessageSerializer::new(SerializerConfig {
        preserve_types: cli.preserve_types,
        include_type_info: cli.include_type_info,
        max_depth: cli.max_depth,
        ..SerializerConfig::default()
    });

    let mut stdin = BufReader::new(io::stdin().lock());
    let mut stdout = BufWriter::new(io::stdout().lock());
    tracing::debug!("Worker {} ready ({})", std::process::id(), encoding);

    while let Some(message) = read_frame::<_, TaskMessage>(&mut stdin, encoding)
        .context("Failed to read task")?
    {
        let task_id = message.task_id.clone();
        let reply = run_task(message, &mut serializer, |data| {
            if let Some(code) = ops::exit_code(&data) {
                tracing::debug!("Exiting with code {} on request", code);
                std::process::exit(code);
            }
            ops::dispatch(data)
        });
        tracing::debug!("Task {} finished (success: {})", task_id, reply.success);
        write_frame(&mut stdout, encoding, &reply).context("Failed to write reply")?;
    }

    tracing::debug!("stdin closed, exiting");
    Ok(())
}

//! MCP host adapter: serves the broker's tools over stdio JSON-RPC.
#![deny(clippy::print_stdout, clippy::print_stderr)]

use std::io::Result as IoResult;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use filebroker_core::BrokerContext;
use filebroker_core::Config;
use filebroker_core::ConfigOverrides;
use mcp_types::JSONRPCMessage;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::io::{self};
use tokio::sync::mpsc;
use tracing::debug;
use tracing::error;
use tracing::info;

mod message_processor;
mod tool_config;

use crate::message_processor::MessageProcessor;

/// Size of the bounded channels between the reader, processor and writer
/// tasks. 128 in-flight messages is plenty for one orchestrator.
const CHANNEL_CAPACITY: usize = 128;

#[derive(Debug, Parser)]
#[command(
    name = "filebroker-mcp-server",
    about = "Transactional filesystem broker served over the Model Context Protocol"
)]
pub struct Cli {
    /// Project roots the broker may touch; the first is the primary root.
    /// Overridden by the BROKER_ROOTS environment variable when set.
    #[arg(value_name = "ROOT", num_args = 0..)]
    pub roots: Vec<PathBuf>,

    /// Fallback 8-bit charset for files that are not UTF-8.
    #[arg(long, value_name = "LABEL")]
    pub fallback_charset: Option<String>,

    /// Maximum readable file size in bytes.
    #[arg(long, value_name = "BYTES")]
    pub max_file_size: Option<u64>,
}

pub async fn run_main(cli: Cli) -> IoResult<()> {
    // Logs go to stderr so stdout stays a clean JSON-RPC channel; the
    // level is controlled with RUST_LOG.
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load_with_overrides(ConfigOverrides {
        roots: if cli.roots.is_empty() { None } else { Some(cli.roots) },
        max_file_size: cli.max_file_size,
        fallback_charset_label: cli.fallback_charset,
        ..Default::default()
    })?;
    info!("serving {} project root(s)", config.roots.len());
    let context = Arc::new(BrokerContext::new(config));

    let (incoming_tx, mut incoming_rx) = mpsc::channel::<JSONRPCMessage>(CHANNEL_CAPACITY);
    let (outgoing_tx, mut outgoing_rx) = mpsc::channel::<JSONRPCMessage>(CHANNEL_CAPACITY);

    // Task: read from stdin, push to `incoming_tx`.
    let stdin_reader_handle = tokio::spawn({
        let incoming_tx = incoming_tx.clone();
        async move {
            let stdin = io::stdin();
            let reader = BufReader::new(stdin);
            let mut lines = reader.lines();

            while let Ok(Some(line)) = lines.next_line().await {
                match serde_json::from_str::<JSONRPCMessage>(&line) {
                    Ok(msg) => {
                        if incoming_tx.send(msg).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => error!("failed to deserialize JSONRPCMessage: {e}"),
                }
            }

            debug!("stdin reader finished (EOF)");
        }
    });

    // Task: process incoming messages.
    let processor_handle = tokio::spawn({
        let mut processor = MessageProcessor::new(context, outgoing_tx.clone());
        async move {
            while let Some(msg) = incoming_rx.recv().await {
                match msg {
                    JSONRPCMessage::Request(r) => processor.process_request(r),
                    JSONRPCMessage::Response(r) => processor.process_response(r),
                    JSONRPCMessage::Notification(n) => processor.process_notification(n),
                    JSONRPCMessage::Error(e) => processor.process_error(e),
                }
            }

            info!("processor task exited (channel closed)");
        }
    });

    // Task: write outgoing messages to stdout.
    let stdout_writer_handle = tokio::spawn(async move {
        let mut stdout = io::stdout();
        while let Some(msg) = outgoing_rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if let Err(e) = stdout.write_all(json.as_bytes()).await {
                        error!("failed to write to stdout: {e}");
                        break;
                    }
                    if let Err(e) = stdout.write_all(b"\n").await {
                        error!("failed to write newline to stdout: {e}");
                        break;
                    }
                    if let Err(e) = stdout.flush().await {
                        error!("failed to flush stdout: {e}");
                        break;
                    }
                }
                Err(e) => error!("failed to serialize JSONRPCMessage: {e}"),
            }
        }

        info!("stdout writer exited (channel closed)");
    });

    // The typical exit path is the stdin reader hitting EOF which, once
    // it drops `incoming_tx`, propagates shutdown to the processor and
    // then to the stdout task.
    let _ = tokio::join!(stdin_reader_handle, processor_handle, stdout_writer_handle);

    Ok(())
}

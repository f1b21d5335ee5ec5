//! Console Bot Example
//!
//! Every line typed on stdin is one inbound message from a single console
//! user; responses are printed to stdout.
//!
//! ```text
//! /help                 list commands
//! /hello                hello world
//! /model --name kes     nested option binding
//! /arg word admin       lazy response sequence
//! anything else         starts a two-step conversation
//! ```
//!
//! # Usage
//!
//! ```bash
//! cargo run --package console-bot -- --admin
//! ```

mod console;
mod plugins;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use kestrel::core::{MemberInfo, MemberRole};
use kestrel::prelude::*;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info};

use crate::console::ConsoleTransport;

const CHANNEL: &str = "console";

#[derive(Parser, Debug)]
#[command(version, about = "Chat with Kestrel plugins from the terminal")]
struct Cli {
    /// Configuration file (defaults to ./kestrel.toml when present).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Plugin root directory.
    #[arg(long, default_value = concat!(env!("CARGO_MANIFEST_DIR"), "/plugins"))]
    plugins: PathBuf,

    /// Name of the console user.
    #[arg(short, long, default_value = "you")]
    user: String,

    /// Appear as a channel admin.
    #[arg(long)]
    admin: bool,

    /// Appear as a root user.
    #[arg(long)]
    root: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut base = KestrelConfig::default();
    base.plugins.directory = cli.plugins.clone();
    let mut loader = ConfigLoader::new().with_current_dir().merge(base);
    if let Some(path) = &cli.config {
        loader = loader.file(path);
    }
    let mut config = loader.load()?;
    if cli.root {
        config.dispatch.root_users.push(cli.user.clone());
    }
    let prefix = config.dispatch.command_prefix.clone();

    let contacts = Arc::new(MemoryContacts::new());
    contacts.upsert_member(MemberInfo {
        channel: CHANNEL.to_string(),
        sub_channel: None,
        user: cli.user.clone(),
        nickname: Some(cli.user.clone()),
        role: if cli.admin {
            MemberRole::Admin
        } else {
            MemberRole::Member
        },
    });

    let runtime = KestrelRuntime::builder()
        .config(config)
        .transport(Arc::new(ConsoleTransport))
        .contacts(contacts)
        .artifact(plugins::artifact())
        .build()?;
    runtime.start().await?;

    let conversation = ConversationId::new(CHANNEL, &cli.user);
    println!("Type {prefix}help for commands, {prefix}quit to leave.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else { break };
        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if text == format!("{prefix}quit") {
            break;
        }
        debug!(text, "Console input");
        runtime.deliver(InboundMessage::new(conversation.clone(), text));
    }

    info!(stats = ?runtime.stats(), "Leaving");
    runtime.shutdown().await;
    Ok(())
}

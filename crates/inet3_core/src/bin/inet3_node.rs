/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - FEDI3 Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{Context, Result};
use inet3_core::config::{default_config_path, CoreConfig};
use inet3_core::console::{ChatOutbox, ConsoleCommand, HELP};
use inet3_core::framer::FileUpload;
use inet3_core::identity::StaticIdentity;
use inet3_core::manager::SessionEvent;
use inet3_core::node::{save_received_file, start_node};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

fn parse_config_path() -> Result<PathBuf> {
    let mut args = std::env::args().skip(1);
    match args.next() {
        Some(arg) if arg == "--config" => args.next().map(PathBuf::from).context("--config requires a path"),
        Some(arg) => Ok(PathBuf::from(arg)),
        None => default_config_path(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().unwrap()),
        )
        .init();

    let cfg_path = parse_config_path()?;
    info!("config: {}", cfg_path.display());
    let cfg = CoreConfig::load(&cfg_path)?;
    let download_dir = cfg.download_dir()?;
    let identity = StaticIdentity::from(&cfg);

    let mut node = start_node(&cfg, &identity).await.context("start node")?;
    let manager = node.manager.clone();
    let outbox = ChatOutbox::spawn(manager.clone());
    println!("{HELP}");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("shutdown requested");
                break;
            }
            ev = node.events.recv() => {
                let Some(ev) = ev else { break; };
                match ev {
                    SessionEvent::StateChanged { peer_id, state } => println!("* {peer_id}: {state}"),
                    SessionEvent::Chat { peer_id, message } => println!("<{peer_id}> {}", message.content),
                    SessionEvent::FileReceived { peer_id, file } => {
                        match save_received_file(&download_dir, &file).await {
                            Ok(path) => println!("* {peer_id} sent {} ({} bytes) -> {}", file.name, file.size, path.display()),
                            Err(e) => error!(peer=%peer_id, "saving {} failed: {e:#}", file.name),
                        }
                    }
                    SessionEvent::Error { peer_id, error } => warn!(peer=%peer_id, "{error}"),
                }
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break; };
                if line.trim().is_empty() {
                    continue;
                }
                let cmd = match ConsoleCommand::parse(&line) {
                    Ok(c) => c,
                    Err(e) => {
                        println!("{e}\n{HELP}");
                        continue;
                    }
                };
                match cmd {
                    ConsoleCommand::Quit => break,
                    ConsoleCommand::Connect { peer, public_key } => {
                        let manager = manager.clone();
                        let timeout = cfg.connect_timeout();
                        tokio::spawn(async move {
                            let handle = match manager.connect(&peer, &public_key).await {
                                Ok(h) => h,
                                Err(e) => {
                                    println!("! connect {peer}: {e}");
                                    return;
                                }
                            };
                            if let Err(e) = handle.wait_connected(timeout).await {
                                println!("! {e}");
                            }
                        });
                    }
                    ConsoleCommand::Disconnect { peer } => manager.disconnect(&peer).await,
                    ConsoleCommand::Msg { peer, text } => {
                        if !outbox.push(&peer, &text) {
                            println!("! chat outbox stopped");
                        }
                    }
                    ConsoleCommand::File { peer, path } => {
                        let manager = manager.clone();
                        tokio::spawn(async move {
                            let upload = match FileUpload::open(&path).await {
                                Ok(u) => u,
                                Err(e) => {
                                    println!("! {path}: {e}");
                                    return;
                                }
                            };
                            match manager.send_file(&peer, upload).await {
                                Ok(n) => println!("* sent {path} to {peer} ({n} bytes)"),
                                Err(e) => println!("! {e}"),
                            }
                        });
                    }
                    ConsoleCommand::Peers => {
                        for peer in manager.list_connected().await {
                            println!("  {peer}");
                        }
                    }
                    ConsoleCommand::History { peer } => {
                        for m in manager.history(&peer).await {
                            println!("  [{}] {}: {}", m.timestamp, m.sender, m.content);
                        }
                    }
                }
            }
        }
    }

    node.shutdown();
    Ok(())
}

//! Minimal chat host for `agent-relay`: relays one command line message, or
//! every line read from stdin, and prints the reply fragments as they arrive.

use std::io::{BufRead as _, Write as _};
use std::path::PathBuf;

use agent_relay::command::usage_hint;
use agent_relay::prelude::*;
use clap::Parser;
use tracing::warn;

#[derive(Parser, Debug)]
#[command(name = "agent-relay", version, about = "Relay chat commands to a conversational agent API")]
struct Args {
    /// Message to send. Reads one message per stdin line when omitted.
    message: Vec<String>,

    /// Session / user id forwarded to the agent as `user_id`.
    #[arg(long, default_value = "agent-relay-cli")]
    user_id: String,

    /// Reply mode override: stream, buffered or poll.
    #[arg(long, value_parser = parse_mode)]
    mode: Option<ReplyMode>,

    /// Extra env file to load before the process environment is read.
    #[arg(long)]
    env_file: Option<PathBuf>,
}

fn parse_mode(raw: &str) -> Result<ReplyMode, String> {
    raw.parse().map_err(|e: RelayError| e.to_string())
}

fn load_env(extra: Option<&PathBuf>) {
    if let Some(path) = extra
        && let Err(e) = dotenvy::from_path(path)
    {
        eprintln!("could not load {}: {e}", path.display());
    }
    dotenvy::dotenv().ok();
}

/// Relays one raw chat line, printing fragments until the reply ends or
/// Ctrl-C cancels it.
async fn relay_line(relay: &Relay, raw: &str, user_id: &str) {
    let keyword = &relay.config().command_keyword;
    let Some(command) = ChatCommand::parse(raw, keyword, user_id) else {
        println!("{}", usage_hint(keyword));
        return;
    };

    let mut stream = relay.handle(command);
    let abort = stream.abort_handle();
    let mut stdout = std::io::stdout();
    loop {
        tokio::select! {
            fragment = stream.next_fragment() => match fragment {
                Some(fragment) => {
                    print!("{fragment}");
                    let _ = stdout.flush();
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                abort.abort();
            }
        }
    }
    println!();

    if let Err(err) = stream.finish().await
        && err.is_fatal()
    {
        warn!(error = %err, "relay aborted");
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    load_env(args.env_file.as_ref());
    agent_relay::init_observability();

    let mut config = RelayConfig::from_env()?;
    if let Some(mode) = args.mode {
        config = config.reply_mode(mode);
    }
    let relay = Relay::new(config)?;

    if !args.message.is_empty() {
        relay_line(&relay, &args.message.join(" "), &args.user_id).await;
        return Ok(());
    }

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        relay_line(&relay, &line, &args.user_id).await;
    }
    Ok(())
}

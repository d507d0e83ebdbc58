use std::io::BufRead;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use worldline::agent::Agent;
use worldline::config::AgentConfig;

/// A REPL line, parsed.
#[derive(Debug, PartialEq, Eq)]
enum Input<'a> {
    Exit,
    States,
    Recall(&'a str),
    Unknown(&'a str),
    Message(&'a str),
}

fn parse(line: &str) -> Input<'_> {
    let Some(command) = line.strip_prefix('/') else {
        return Input::Message(line);
    };
    let (name, rest) = command.split_once(char::is_whitespace).unwrap_or((command, ""));
    match name {
        "exit" | "quit" => Input::Exit,
        "states" => Input::States,
        "recall" => Input::Recall(rest.trim()),
        _ => Input::Unknown(name),
    }
}

/// Interactive chat on stdin/stdout until `/exit`, end of input, or Ctrl-C at the prompt.
///
/// Ctrl-C while a reply is streaming cuts that reply short instead.
pub async fn chat(config: AgentConfig) -> Result<()> {
    let mut agent = Agent::open(config)?;
    let mut stdout = tokio::io::stdout();
    let mut lines = spawn_stdin_reader();
    let reply_slot = ReplySlot::default();
    let quit = CancellationToken::new();
    let watcher = spawn_interrupt_watcher(reply_slot.clone(), quit.clone());

    println!("Chatting with {}. /states shows the world state, /recall <text> searches past turns, /exit quits.", agent.config().generation.model);

    loop {
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;

        let line = tokio::select! {
            line = lines.recv() => line,
            _ = quit.cancelled() => {
                println!();
                break;
            }
        };
        let Some(line) = line else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match parse(line) {
            Input::Exit => break,
            Input::States => println!("{}", states(&agent).await),
            Input::Recall(query) if query.is_empty() => println!("usage: /recall <text>"),
            Input::Recall(query) => {
                let recalled = agent.recall(query).await;
                if recalled.is_empty() {
                    println!("Nothing similar found.");
                }
                for r in recalled {
                    println!("  ({:.3}) [{}] {}", r.distance, r.turn.role, r.turn.content);
                }
            }
            Input::Unknown(name) => println!("unknown command: /{name}"),
            Input::Message(text) => {
                let token = CancellationToken::new();
                set_reply(&reply_slot, Some(token.clone()));
                let reply = agent.respond(text, &token).await;
                set_reply(&reply_slot, None);

                if !reply.text.is_empty() {
                    println!("{}", reply.text);
                }
                if reply.interrupted {
                    println!("[interrupted]");
                }
                for e in &reply.errors {
                    if e.is_fatal() {
                        eprintln!("error: {e} (check generation.program in the config)");
                    } else {
                        eprintln!("warning: {e}");
                    }
                }
            }
        }
    }

    watcher.abort();
    agent.shutdown().await;
    Ok(())
}

/// Cancellation handle of the reply currently streaming, if any.
type ReplySlot = Arc<Mutex<Option<CancellationToken>>>;

fn set_reply(slot: &Mutex<Option<CancellationToken>>, token: Option<CancellationToken>) {
    *slot.lock().unwrap_or_else(PoisonError::into_inner) = token;
}

/// Handle one Ctrl-C: cancel the streaming reply, or ask the REPL to quit when idle.
/// Returns `true` when quitting.
fn on_interrupt(slot: &Mutex<Option<CancellationToken>>, quit: &CancellationToken) -> bool {
    let reply = slot.lock().unwrap_or_else(PoisonError::into_inner).clone();
    match reply {
        Some(token) => {
            token.cancel();
            false
        }
        None => {
            quit.cancel();
            true
        }
    }
}

/// One Ctrl-C listener for the whole session.
fn spawn_interrupt_watcher(slot: ReplySlot, quit: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if on_interrupt(&slot, &quit) {
                break;
            }
        }
    })
}

/// Stdin lines, read on a plain thread so a pending read never holds up shutdown.
fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        for line in std::io::stdin().lock().lines() {
            let Ok(line) = line else {
                break;
            };
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });
    rx
}

/// The world state as it stands, without waiting for or stopping a running update.
async fn states(agent: &Agent) -> String {
    let mut out = {
        let world = agent.world().lock().await;
        super::state::render(&world)
    };
    if agent.has_pending_world_state() {
        out.push_str("(update in progress)\n");
    }
    out
}

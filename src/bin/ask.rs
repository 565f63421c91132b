//! Ask a hosted language model questions from the terminal.
//!
//! # Usage
//!
//! ```bash
//! # One question, answer streamed to stdout
//! ask "What is a sliding window rate limiter?"
//!
//! # Interactive session keeping the conversation
//! ask --model claude-3-5-haiku-20241022 --system "Answer in one sentence."
//! ```
//!
//! Ctrl-C cancels the answer in flight; Ctrl-D or `/quit` exits.  Set
//! `RUST_LOG=ask=debug` to watch retries and rate limiting on stderr.

use std::io::Write;
use std::process::ExitCode;
use std::sync::{Arc, Mutex, PoisonError};

use arrrg::CommandLine;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use ask::chat::{ChatArgs, ChatCommand, ChatConfig, ChatSession, help_text, parse_command};
use ask::{ConnectionPool, Error};

type CurrentToken = Arc<Mutex<CancellationToken>>;

#[tokio::main]
async fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let (args, free) = ChatArgs::from_command_line_relaxed("ask [OPTIONS] [PROMPT...]");
    let config = ChatConfig::load(args)?;
    let pool = ConnectionPool::new(config.pool.clone())?;
    pool.initialize()?;
    let client = config.client(pool.clone())?;
    let mut session = ChatSession::new(client, config.stream);

    let current: CurrentToken = Arc::new(Mutex::new(CancellationToken::new()));
    ctrlc::set_handler({
        let current = Arc::clone(&current);
        move || {
            current
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .cancel();
        }
    })?;

    let status = if free.is_empty() {
        repl(&mut session, &current).await?;
        ExitCode::SUCCESS
    } else {
        let prompt = free.join(" ");
        match answer(&mut session, &prompt, &current).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(err) => {
                eprintln!("error: {err}");
                ExitCode::FAILURE
            }
        }
    };
    pool.close();
    Ok(status)
}

async fn repl(
    session: &mut ChatSession,
    current: &CurrentToken,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut rl = DefaultEditor::new()?;
    println!("ask (model: {})", session.model());
    println!("Type /help for commands, /quit to exit\n");

    loop {
        match rl.readline("> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(line);

                if let Some(command) = parse_command(line) {
                    match command {
                        ChatCommand::Quit => break,
                        ChatCommand::Clear => {
                            session.clear();
                            println!("Conversation cleared.");
                        }
                        ChatCommand::Stats => match serde_yaml::to_string(&session.stats()) {
                            Ok(yaml) => print!("{yaml}"),
                            Err(err) => eprintln!("error: {err}"),
                        },
                        ChatCommand::Help => println!("{}", help_text()),
                        ChatCommand::Invalid(message) => eprintln!("{message}"),
                    }
                    continue;
                }

                if let Err(err) = answer(session, line, current).await {
                    if err.is_cancelled() {
                        eprintln!("[cancelled]");
                    } else {
                        eprintln!("error: {err}");
                    }
                }
            }
            Err(ReadlineError::Interrupted) => continue,
            Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("input error: {err}");
                break;
            }
        }
    }
    Ok(())
}

async fn answer(
    session: &mut ChatSession,
    prompt: &str,
    current: &CurrentToken,
) -> Result<(), Error> {
    let token = CancellationToken::new();
    *current.lock().unwrap_or_else(PoisonError::into_inner) = token.clone();
    let mut stdout = std::io::stdout();
    session
        .send(
            prompt,
            |text| {
                let _ = write!(stdout, "{text}");
                let _ = stdout.flush();
            },
            token,
        )
        .await?;
    println!();
    Ok(())
}

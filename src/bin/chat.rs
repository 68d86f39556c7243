//! Terminal chat client over the session layer.
//!
//! Connects to a finchat server, streams the transcript to stdout, and
//! prompts y/n on confirmation requests. Credentials come from flags/env or
//! the server's dev-login route.

use std::io::Write as _;
use std::sync::Arc;

use clap::Parser;
use finchat::client::assembler::ConfirmPrompt;
use finchat::client::auth::{Credentials, HttpTokenRefresher};
use finchat::client::session::{self, ConnectionState, SessionConfig, SessionEvent, SessionHandle};
use finchat::client::transport::WsConnector;
use finchat::protocol::{Role, now_ms};

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("dev login failed: {0}")]
    DevLogin(String),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("stdin closed")]
    StdinClosed,
}

#[derive(Parser, Debug)]
#[command(name = "finchat-chat", about = "FinChat terminal client")]
struct Cli {
    #[arg(long, env = "FINCHAT_BASE_URL", default_value = "http://127.0.0.1:3000")]
    base_url: String,

    /// Existing access token; omit to use the server's dev-login route.
    #[arg(long, env = "FINCHAT_ACCESS_TOKEN")]
    access_token: Option<String>,

    #[arg(long, env = "FINCHAT_REFRESH_TOKEN")]
    refresh_token: Option<String>,

    /// Access token expiry (ms since epoch); required with --access-token.
    #[arg(long, env = "FINCHAT_TOKEN_EXPIRES_AT")]
    expires_at: Option<i64>,
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let credentials = match (&cli.access_token, &cli.refresh_token, cli.expires_at) {
        (Some(access), Some(refresh), Some(expires_at)) => Credentials {
            access_token: access.clone(),
            refresh_token: refresh.clone(),
            expires_at,
        },
        _ => dev_login(&cli.base_url).await?,
    };

    let connector = Arc::new(WsConnector::new(cli.base_url.clone()));
    let refresher = Arc::new(HttpTokenRefresher::new(cli.base_url.clone()));
    let handle = session::spawn_session(connector, refresher, credentials, SessionConfig::default());

    run_repl(handle).await
}

async fn run_repl(mut handle: SessionHandle) -> Result<(), CliError> {
    use tokio::io::AsyncBufReadExt;

    // `next_line` is cancellation safe, so it can sit in the select loop.
    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut pending: Option<ConfirmPrompt> = None;
    let mut shown = 0usize;

    println!("finchat — type a message, `y`/`n` on confirmations, ctrl-d to quit");
    prompt();

    loop {
        tokio::select! {
            read = lines.next_line() => {
                let Ok(Some(line)) = read else {
                    handle.close().await;
                    return Err(CliError::StdinClosed);
                };
                let input = line.trim().to_owned();
                if input.is_empty() {
                    prompt();
                    continue;
                }
                if let Some(p) = pending.take() {
                    match input.as_str() {
                        "y" | "yes" => handle.confirm(p.action_id).await,
                        "n" | "no" => handle.cancel(p.action_id).await,
                        _ => {
                            println!("(answer y or n — {} expires in {}s)", p.summary, p.remaining_ms(now_ms()) / 1000);
                            pending = Some(p);
                        }
                    }
                } else if input == "/reset" {
                    handle.reset().await;
                } else if input == "/quit" {
                    handle.close().await;
                    return Ok(());
                } else {
                    handle.send_message(input).await;
                }
            }

            event = handle.next_event() => {
                let Some(event) = event else {
                    println!("session ended");
                    return Ok(());
                };
                render_event(event, &mut pending, &mut shown);
            }
        }
    }
}

fn render_event(event: SessionEvent, pending: &mut Option<ConfirmPrompt>, shown: &mut usize) {
    match event {
        SessionEvent::State(state) => match state {
            ConnectionState::Connecting => println!("· connecting…"),
            ConnectionState::Connected => println!("· connected"),
            ConnectionState::Reconnecting { attempt } => println!("· reconnecting (attempt {attempt})…"),
            ConnectionState::Error => println!("· connection failed — `/reset` to retry"),
            ConnectionState::Disconnected => println!("· disconnected"),
        },
        SessionEvent::Transcript { messages, streaming } => {
            // Print only finalized messages we have not shown yet; the
            // in-flight streaming message keeps changing under us.
            let visible = messages.len() - usize::from(streaming);
            if visible < *shown {
                // A resume or fresh conversation replaced the transcript.
                *shown = 0;
            }
            for msg in &messages[*shown..visible] {
                let who = match msg.role {
                    Role::User => "you",
                    Role::Assistant => "agent",
                };
                println!("{who}: {}", msg.content);
            }
            *shown = visible;
            prompt();
        }
        SessionEvent::ConfirmRequested(prompt_card) => {
            println!(
                "! approve `{}`? [y/n] ({}s left)",
                prompt_card.summary,
                prompt_card.remaining_ms(now_ms()) / 1000
            );
            *pending = Some(prompt_card);
            prompt();
        }
        SessionEvent::ConfirmCleared => {
            if pending.take().is_some() {
                println!("! confirmation expired");
                prompt();
            }
        }
        SessionEvent::TurnCompleted { usage } => {
            if let Some(usage) = usage {
                tracing::debug!(
                    input_tokens = usage.input_tokens,
                    output_tokens = usage.output_tokens,
                    "turn complete"
                );
            }
        }
        SessionEvent::Fatal(reason) => {
            println!("✗ {reason}");
            prompt();
        }
    }
}

fn prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}

async fn dev_login(base_url: &str) -> Result<Credentials, CliError> {
    let url = format!("{}/api/auth/dev-login", base_url.trim_end_matches('/'));
    let response = reqwest::Client::new()
        .post(url)
        .json(&serde_json::json!({}))
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        return Err(CliError::DevLogin(format!(
            "HTTP {} (is the server running with DEV_LOGIN=1?)",
            status.as_u16()
        )));
    }

    let body: serde_json::Value = response.json().await?;
    let field = |key: &str| {
        body.get(key)
            .and_then(|v| v.as_str())
            .map(ToOwned::to_owned)
            .ok_or_else(|| CliError::DevLogin(format!("missing `{key}` in response")))
    };

    Ok(Credentials {
        access_token: field("access_token")?,
        refresh_token: field("refresh_token")?,
        expires_at: body
            .get("expires_at")
            .and_then(serde_json::Value::as_i64)
            .ok_or_else(|| CliError::DevLogin("missing `expires_at` in response".into()))?,
    })
}

//! Interactive command line client for the Huddle router.
//!
//! ```bash
//! huddle-cli http://127.0.0.1:8080 --as did:plc:alice --token <token>
//! ```
//!
//! Commands are read from stdin, one per line:
//!
//! - `listen <doc>...` - Listen to exactly these documents
//! - `add <doc>...` / `remove <doc>...` - Change the listened set
//! - `send <did> <connection> <doc> <text>` - Send text to a peer
//! - `members` - Show known peers per document
//! - `quit`

use anyhow::{bail, Context, Result};
use clap::Parser;
use huddle_client::{connect_url, request_token, RouterClient, RouterEvent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "huddle-cli", version, about = "Talk to a Huddle router")]
struct Args {
    /// Router base URL, e.g. http://127.0.0.1:8080
    url: String,

    /// Identity to connect as.
    #[arg(long = "as", value_name = "DID")]
    identity: String,

    /// Upgrade token.
    #[arg(short, long, conflicts_with = "bearer", required_unless_present = "bearer")]
    token: Option<String>,

    /// Bearer JWT to exchange for an upgrade token.
    #[arg(short, long)]
    bearer: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Listen(Vec<String>),
    Add(Vec<String>),
    Remove(Vec<String>),
    Send {
        identity: String,
        connection_id: String,
        document: String,
        text: String,
    },
    Members,
    Quit,
}

fn parse_command(line: &str) -> Result<Option<Command>> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let rest: Vec<String> = words.map(str::to_string).collect();

    let command = match verb {
        "listen" => Command::Listen(rest),
        "add" => Command::Add(rest),
        "remove" => Command::Remove(rest),
        "send" => {
            if rest.len() < 4 {
                bail!("usage: send <did> <connection> <doc> <text>");
            }
            Command::Send {
                identity: rest[0].clone(),
                connection_id: rest[1].clone(),
                document: rest[2].clone(),
                text: rest[3..].join(" "),
            }
        }
        "members" => Command::Members,
        "quit" | "exit" => Command::Quit,
        other => bail!("unknown command: {other}"),
    };
    Ok(Some(command))
}

/// Run one command. Returns `false` when the session should end.
fn run_command(client: &mut RouterClient, command: Command) -> Result<bool> {
    match command {
        Command::Listen(documents) => client.listen(documents)?,
        Command::Add(documents) => client.add_interests(documents)?,
        Command::Remove(documents) => client.remove_interests(documents)?,
        Command::Send {
            identity,
            connection_id,
            document,
            text,
        } => {
            client.send(&identity, &connection_id, &document, text.as_bytes())?;
            println!("→ Sent to {identity}({connection_id})");
        }
        Command::Members => {
            let interests: Vec<&String> = client.interests().collect();
            println!("Listening to: {interests:?}");
            for (document, members) in client.membership() {
                println!("  {document}:");
                for member in members {
                    println!("    {}({})", member.identity, member.connection_id);
                }
            }
        }
        Command::Quit => return Ok(false),
    }
    Ok(true)
}

fn print_event(event: &RouterEvent) {
    match event {
        RouterEvent::Join {
            identity,
            connection_id,
            document,
        } => println!("{identity}({connection_id}) joined {document}"),
        RouterEvent::Leave {
            identity,
            connection_id,
            document,
        } => println!("{identity}({connection_id}) left {document}"),
        RouterEvent::Data {
            identity,
            connection_id,
            document,
            body,
        } => println!(
            "← Received message from {identity}({connection_id}) on {document}: {}",
            String::from_utf8_lossy(body)
        ),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "huddle_client=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let token = match (args.token, args.bearer) {
        (Some(token), _) => token,
        (None, Some(bearer)) => request_token(&args.url, &bearer)
            .await
            .context("Failed to obtain an upgrade token")?,
        (None, None) => bail!("either --token or --bearer is required"),
    };

    let url = connect_url(&args.url, &args.identity);
    println!("Connecting to {url}");
    let (mut client, mut events) = RouterClient::connect(&url, &token)
        .await
        .with_context(|| format!("Failed to connect to {url}"))?;
    println!("Connected.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => print_event(&event),
                None => {
                    println!("Disconnected.");
                    break;
                }
            },
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                match parse_command(&line) {
                    Ok(Some(command)) => {
                        if !run_command(&mut client, command)? {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(e) => eprintln!("{e}"),
                }
            }
        }
    }

    client.close().await;
    Ok(())
}

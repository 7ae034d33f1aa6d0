//! hab-client command-line entry point.
//!
//! ```text
//! hab-client <command_type> [json-params]   send one command, print the result
//! hab-client watch [event_type]             print events until Ctrl-C
//! ```
//!
//! Connection settings come from the environment (`HAB_URL`, `HAB_TOKEN`,
//! ...), optionally loaded from a `.env` file.

use anyhow::{Context, bail};
use serde_json::{Map, Value};
use tracing_subscriber::EnvFilter;

use hab_client::config::ClientConfig;
use hab_client::error::{ClientError, ExitCode};
use hab_client::ws::{Command, WebSocketClient};

enum Invocation {
    Command { command_type: String, params: Map<String, Value> },
    Watch { event_type: Option<String> },
}

fn parse_args(mut args: impl Iterator<Item = String>) -> anyhow::Result<Invocation> {
    let Some(first) = args.next() else {
        bail!("usage: hab-client <command_type> [json-params] | hab-client watch [event_type]");
    };
    if first == "watch" {
        return Ok(Invocation::Watch {
            event_type: args.next(),
        });
    }
    let params = match args.next() {
        Some(raw) => match serde_json::from_str(&raw).context("params must be JSON")? {
            Value::Object(map) => map,
            _ => bail!("params must be a JSON object"),
        },
        None => Map::new(),
    };
    Ok(Invocation::Command {
        command_type: first,
        params,
    })
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if std::env::var("HAB_LOG_FORMAT").is_ok_and(|format| format == "json") {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn run(invocation: Invocation) -> anyhow::Result<()> {
    let config = ClientConfig::from_env()?;
    let client = WebSocketClient::connect_with(config).await?;

    let outcome = match invocation {
        Invocation::Command {
            command_type,
            params,
        } => execute(&client, Command::new(command_type).params(params)).await,
        Invocation::Watch { event_type } => watch(&client, event_type.as_deref()).await,
    };

    client.close().await;
    outcome
}

async fn execute(client: &WebSocketClient, command: Command) -> anyhow::Result<()> {
    let result = client.send_command(command).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn watch(client: &WebSocketClient, event_type: Option<&str>) -> anyhow::Result<()> {
    let (subscription, mut events) = client.subscribe_channel(event_type).await?;
    tracing::info!(%subscription, event_type = event_type.unwrap_or("*"), "watching events");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Some(event) => println!("{}", serde_json::to_string(&event)?),
                None => return Err(ClientError::ConnectionClosed.into()),
            },
        }
    }

    client.unsubscribe(subscription).await?;
    Ok(())
}

fn exit_code(err: &anyhow::Error) -> ExitCode {
    match err.downcast_ref::<ClientError>() {
        Some(client_err) => client_err.exit_code(),
        None => ExitCode::InvalidArguments,
    }
}

#[tokio::main]
async fn main() {
    init_tracing();

    let outcome = match parse_args(std::env::args().skip(1)) {
        Ok(invocation) => run(invocation).await,
        Err(e) => Err(e),
    };

    let code = match outcome {
        Ok(()) => ExitCode::Success,
        Err(e) => {
            match e.downcast_ref::<ClientError>() {
                Some(client_err) => {
                    eprintln!("error [{}]: {client_err}", client_err.error_code());
                }
                None => eprintln!("error: {e:#}"),
            }
            exit_code(&e)
        }
    };
    std::process::exit(i32::from(code.code()));
}

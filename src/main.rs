use anyhow::Result;
use clap::Parser;
use medvoice::agent::Agent;
use medvoice::audio::capture::list_devices;
use medvoice::cli::{Cli, Commands};
use medvoice::config::Config;
use medvoice::daemon::run_daemon;
use medvoice::ipc::client::{follow, send_command};
use medvoice::ipc::protocol::{Command, Response};
use medvoice::ipc::server::IpcServer;
use medvoice::output::{render_event, render_warning};
use medvoice::session::SessionSnapshot;
use owo_colors::OwoColorize;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    medvoice::logging::init(&config.logging, cli.quiet, cli.verbose);
    let color = !cli.no_color && std::io::stdout().is_terminal();
    let socket = cli.socket;

    match cli.command {
        Commands::Daemon => {
            run_daemon(config, socket).await?;
        }
        Commands::Connect { token } => {
            handle_ipc_command(socket, Command::Connect { token }, cli.quiet).await?;
        }
        Commands::Disconnect => {
            handle_ipc_command(socket, Command::Disconnect, cli.quiet).await?;
        }
        Commands::Ack => {
            handle_ipc_command(socket, Command::AcknowledgeError, cli.quiet).await?;
        }
        Commands::Listen => {
            handle_ipc_command(socket, Command::StartListening, cli.quiet).await?;
        }
        Commands::Stop => {
            handle_ipc_command(socket, Command::StopListening, cli.quiet).await?;
        }
        Commands::Say { text } => {
            let text = text.join(" ");
            handle_ipc_command(socket, Command::SendText { text }, cli.quiet).await?;
        }
        Commands::Transfer { agent } => {
            handle_ipc_command(socket, Command::Transfer { agent }, cli.quiet).await?;
        }
        Commands::Status => {
            handle_ipc_command(socket, Command::Status, cli.quiet).await?;
        }
        Commands::History { since } => {
            let socket_path = socket.unwrap_or_else(IpcServer::default_socket_path);
            match send_command(&socket_path, Command::History { since }).await {
                Ok(Response::History { events }) => {
                    if events.is_empty() && !cli.quiet {
                        eprintln!("{}", "No conversation entries".dimmed());
                    }
                    for event in &events {
                        render_event(event, color);
                    }
                }
                Ok(other) => print_response(other, cli.quiet),
                Err(e) => daemon_unreachable(e),
            }
        }
        Commands::Follow { since } => {
            handle_follow(socket, since, color, cli.quiet).await?;
        }
        Commands::Shutdown => {
            handle_ipc_command(socket, Command::Shutdown, cli.quiet).await?;
        }
        Commands::Devices => {
            list_audio_devices()?;
        }
        Commands::Agents => {
            for agent in Agent::ALL {
                let info = agent.info();
                let marker = if agent == config.session.default_agent {
                    "●".green().to_string()
                } else {
                    "○".to_string()
                };
                println!(
                    "  {} {:<8} {} {}",
                    marker,
                    agent.as_str(),
                    info.name,
                    format!("({})", info.description).dimmed()
                );
            }
        }
    }

    Ok(())
}

/// Load configuration from file or use defaults.
///
/// Priority order:
/// 1. Custom config path from CLI (--config)
/// 2. Default config path (~/.config/medvoice/config.toml)
/// 3. Built-in defaults with environment variable overrides
fn load_config(custom_path: Option<&Path>) -> Result<Config> {
    let config = if let Some(path) = custom_path {
        Config::load(path)?
    } else {
        match Config::default_path() {
            Ok(path) => Config::load_or_default(&path)?,
            Err(_) => Config::default(),
        }
    };

    Ok(config.with_env_overrides())
}

/// List available audio input devices.
fn list_audio_devices() -> Result<()> {
    let devices = list_devices()?;

    if devices.is_empty() {
        eprintln!("No audio input devices found");
        std::process::exit(1);
    }

    println!("Available audio input devices:");
    for (idx, device) in devices.iter().enumerate() {
        println!("  [{}] {}", idx, device);
    }

    Ok(())
}

/// Send IPC command to daemon and handle response.
async fn handle_ipc_command(socket: Option<PathBuf>, command: Command, quiet: bool) -> Result<()> {
    let socket_path = socket.unwrap_or_else(IpcServer::default_socket_path);

    match send_command(&socket_path, command).await {
        Ok(response) => print_response(response, quiet),
        Err(e) => daemon_unreachable(e),
    }

    Ok(())
}

fn print_response(response: Response, quiet: bool) {
    match response {
        Response::Ok => {
            if !quiet {
                println!("{}", "ok".green());
            }
        }
        Response::Transferred { agent } => {
            println!("Transferred to {}", agent.info().name.green());
        }
        Response::Status {
            session,
            endpoint,
            device,
            log_entries,
        } => print_status(&session, &endpoint, &device, log_entries),
        Response::History { events } => {
            for event in &events {
                render_event(event, false);
            }
        }
        Response::Event { event } => render_event(&event, false),
        Response::Error { message } => {
            eprintln!("{}", format!("Error: {}", message).red());
            std::process::exit(1);
        }
    }
}

fn print_status(session: &SessionSnapshot, endpoint: &str, device: &str, log_entries: u64) {
    let yes_no = |flag: bool| if flag { "yes" } else { "no" };

    println!("Status:");
    println!("  {}    {}", "Client:".dimmed(), medvoice::version_string());
    println!("  {}  {}", "Endpoint:".dimmed(), endpoint);
    println!("  {}    {}", "Device:".dimmed(), device);

    let state = session.connection_state.as_str();
    let state = match session.connection_state {
        medvoice::ConnectionState::Connected => state.green().to_string(),
        medvoice::ConnectionState::Error => state.red().to_string(),
        _ => state.yellow().to_string(),
    };
    println!("  {}     {}", "State:".dimmed(), state);
    println!("  {}     {}", "Agent:".dimmed(), session.active_agent.info().name);
    if let Some(pending) = session.pending_transfer {
        println!(
            "  {}  {}",
            "Transfer:".dimmed(),
            format!("pending to {}", pending).yellow()
        );
    }
    println!("  {} {}", "Listening:".dimmed(), yes_no(session.listening));
    println!("  {}  {}", "Speaking:".dimmed(), yes_no(session.speaking));
    if let Some(transcript) = &session.last_transcript {
        println!("  {}  {}", "Last you:".dimmed(), transcript);
    }
    if let Some(reply) = &session.last_reply {
        println!("  {} {}", "Last reply:".dimmed(), reply);
    }
    println!("  {}   {}", "Entries:".dimmed(), log_entries);
}

fn daemon_unreachable(e: medvoice::VoiceError) -> ! {
    eprintln!(
        "{}",
        format!("Failed to communicate with daemon: {}", e).red()
    );
    eprintln!("Is the daemon running? Start it with: medvoice daemon");
    std::process::exit(1);
}

/// Follow the conversation and render entries as they arrive.
async fn handle_follow(socket: Option<PathBuf>, since: u64, color: bool, quiet: bool) -> Result<()> {
    let socket_path = socket.unwrap_or_else(IpcServer::default_socket_path);

    if !quiet {
        eprintln!("Following conversation... (Ctrl+C to stop)");
    }

    let result = follow(&socket_path, since, |response| {
        match response {
            Response::Event { event } => render_event(&event, color),
            Response::Error { message } => render_warning(&message, color),
            other => render_warning(&format!("Unexpected response: {:?}", other), color),
        }
        true
    })
    .await;

    match result {
        Ok(()) => {
            if !quiet {
                eprintln!("Daemon connection closed");
            }
            Ok(())
        }
        Err(e) => daemon_unreachable(e),
    }
}

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use ssh_agent_client::cli::{Cli, Commands};
use ssh_agent_client::client::AgentClient;
use ssh_agent_client::config::Config;
use ssh_agent_client::identity::parse_identity;
use ssh_agent_client::protocol::AgentIdentity;
use ssh_agent_client::spawn::SpawnedAgent;
use std::path::PathBuf;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    // Keep a spawned agent alive for the whole command.
    let mut spawned = None;

    // Socket precedence: --spawn, then --socket, then config file (which
    // itself defaults to SSH_AUTH_SOCK).
    let socket = if cli.spawn {
        let path =
            std::env::temp_dir().join(format!("ssh-agent-client-{}.sock", std::process::id()));
        let agent = SpawnedAgent::launch(&path)?;
        println!("Spawned private ssh-agent at {:?}", agent.socket_path());
        let socket = agent.socket_path().to_path_buf();
        spawned = Some(agent);
        socket
    } else if let Some(socket) = cli.socket.clone() {
        socket
    } else {
        let config = Config::load()?;
        if config.socket.is_empty() {
            eprintln!("No agent socket configured.");
            eprintln!(
                "Set SSH_AUTH_SOCK, pass --socket, or edit {:?}.",
                Config::config_path()?
            );
            return Ok(());
        }
        PathBuf::from(config.socket)
    };

    let client = AgentClient::new(socket);
    let result = handle_command(cli.command.unwrap_or(Commands::List), &client).await;

    drop(spawned);
    result
}

async fn handle_command(command: Commands, client: &AgentClient) -> Result<()> {
    match command {
        Commands::List => {
            let keys = client.request_identities().await?;
            println!("Keys held by the agent:");
            for (i, key) in keys.iter().enumerate() {
                println!("  {}. {} ({})", i + 1, key.fingerprint(), key.key_type());
                println!("     Comment: {}", key.comment);
            }
            if keys.is_empty() {
                println!("  (none)");
            }
        }
        Commands::Add { file } => {
            let pem = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {:?}", file))?;
            let identity = parse_identity(&pem)
                .ok_or_else(|| anyhow!("{:?} is not an unencrypted OpenSSH private key", file))?;
            client.add_identity(&identity).await?;
            println!(
                "Added {} key ({})",
                identity.key_type().unwrap_or("unknown"),
                identity.comment().unwrap_or("no comment")
            );
        }
        Commands::Sign { key, data } => {
            let data = match data {
                Some(data) => data.into_bytes(),
                None => {
                    use std::io::Read;
                    let mut buf = Vec::new();
                    std::io::stdin()
                        .read_to_end(&mut buf)
                        .context("Failed to read data from stdin")?;
                    buf
                }
            };
            let target = find_key(client, &key).await?;
            let signature = client.sign(&target.key_blob, &data, 0).await?;
            println!("{}", hex::encode(signature));
        }
        Commands::Remove { key } => {
            let target = find_key(client, &key).await?;
            client.remove_identity(&target.key_blob).await?;
            println!("Removed {}", key);
        }
        Commands::RemoveAll => {
            client.remove_all_identities().await?;
            println!("Removed all keys");
        }
        Commands::Status => {
            println!("SSH Agent Client Status");
            println!("=======================");
            println!("Socket: {:?}", client.socket_path());

            match client.request_identities().await {
                Ok(keys) => {
                    println!("Agent status: Connected");
                    println!("Available keys: {}", keys.len());
                }
                Err(e) => {
                    println!("Agent status: Error - {}", e);
                }
            }
        }
    }

    Ok(())
}

async fn find_key(client: &AgentClient, fingerprint: &str) -> Result<AgentIdentity> {
    let keys = client.request_identities().await?;
    keys.into_iter()
        .find(|k| k.fingerprint() == fingerprint)
        .ok_or_else(|| anyhow!("The agent holds no key with fingerprint {}", fingerprint))
}

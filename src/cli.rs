use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "ssh-agent-client")]
#[command(about = "Talk to an SSH agent: list, add, sign and remove keys")]
#[command(
    long_about = "Client for a running SSH agent over its UNIX socket.\n\nExamples:\n  ssh-agent-client list\n  ssh-agent-client add ~/.ssh/id_ed25519\n  echo -n payload | ssh-agent-client sign --key SHA256:abc123\n  ssh-agent-client --spawn status"
)]
pub struct Cli {
    /// Path to the agent socket (default: $SSH_AUTH_SOCK, or the config file)
    #[arg(long, value_name = "PATH")]
    pub socket: Option<PathBuf>,

    /// Launch a private ssh-agent for the duration of the command
    #[arg(long)]
    pub spawn: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List keys held by the agent
    List,

    /// Add a private key from an OpenSSH PEM file
    Add {
        /// Path to the unencrypted private key file
        file: PathBuf,
    },

    /// Sign data with one of the agent's keys
    Sign {
        /// Fingerprint of the key to sign with (as shown by `list`)
        #[arg(long, value_name = "FINGERPRINT")]
        key: String,

        /// Data to sign; read from stdin when omitted
        #[arg(long, value_name = "STRING")]
        data: Option<String>,
    },

    /// Ask the agent to forget one key
    Remove {
        /// Fingerprint of the key to remove (as shown by `list`)
        #[arg(long, value_name = "FINGERPRINT")]
        key: String,
    },

    /// Ask the agent to forget all keys
    RemoveAll,

    /// Show agent status
    Status,
}

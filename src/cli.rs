use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};
use portmux::endpoint::Endpoint;

/// A dynamically reconfigurable TCP/UDP port forwarder.
///
/// Endpoints are written as PROTO:host:port, for example
/// TCP:www.example.org:80, UDP::5353 or TCP:[::1]:22. An empty host means
/// every local address for a source and the loopback address for a
/// destination.
#[derive(Debug, Parser)]
#[command(version)]
pub struct Cli {
    /// Verbose output (-v, -vv)
    #[arg(short, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Path of the control socket [default: /tmp/.proxy-socket]
    #[arg(short, long, global = true)]
    pub socket: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the forwarder
    Serve {
        /// Configuration file with initial mappings
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Forward SRC to DEST
    Add { src: Endpoint, dest: Endpoint },

    /// Stop forwarding SRC
    Del { src: Endpoint },

    /// List every mapping
    List,

    /// Stop the forwarder
    Quit,
}

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "sommelier", about = "Sommelier agent backend")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP/SSE server.
    Serve {
        /// Port to listen on (overrides config).
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Print provider health and exit.
    Health,
}

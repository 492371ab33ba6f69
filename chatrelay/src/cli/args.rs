//! CLI argument definitions.

use clap::{Args, Parser, Subcommand};

use crate::config::{ProviderKind, DEFAULT_HOST, DEFAULT_PORT};
use crate::provider::{DEFAULT_API_BASE, DEFAULT_MODEL};

/// chatrelay - Stream chat completions to browsers over session channels
#[derive(Parser, Debug)]
#[command(name = "chatrelay")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the relay server
    Serve(ServeArgs),

    /// Send a message through a running relay and print the streamed reply
    Chat {
        #[command(flatten)]
        target: ServerArgs,

        /// Session id for the receive channel (generated when omitted)
        #[arg(short, long)]
        session: Option<String>,

        /// Model to request
        #[arg(short, long)]
        model: Option<String>,

        /// Stream the reply in the submit response instead of a session channel
        #[arg(long)]
        inline: bool,

        /// Wait for the whole reply instead of streaming it
        #[arg(long, conflicts_with = "inline")]
        no_stream: bool,

        /// Message to send
        #[arg(trailing_var_arg = true, required = true)]
        message: Vec<String>,
    },

    /// Show whether the relay's provider key is valid
    Status {
        #[command(flatten)]
        target: ServerArgs,
    },

    /// List open receive channels
    Sessions {
        #[command(flatten)]
        target: ServerArgs,
    },

    /// List the models the relay's provider can serve
    Models {
        #[command(flatten)]
        target: ServerArgs,
    },
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to bind
    #[arg(long, env = "HOST", default_value = DEFAULT_HOST)]
    pub host: String,

    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Seconds between heartbeat frames on idle receive channels
    #[arg(long, env = "CHATRELAY_HEARTBEAT_SECS", default_value_t = 30)]
    pub heartbeat_secs: u64,

    /// Frames buffered per connection before writers wait
    #[arg(long, default_value_t = 64)]
    pub sink_capacity: usize,

    /// Upstream chunk producer
    #[arg(long, env = "CHATRELAY_PROVIDER", value_enum, default_value_t = ProviderKind::Openai)]
    pub provider: ProviderKind,

    /// Provider API key
    #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Provider API base URL
    #[arg(long, env = "OPENAI_API_BASE", default_value = DEFAULT_API_BASE)]
    pub api_base: String,

    /// Model used when a request does not name one
    #[arg(long, default_value = DEFAULT_MODEL)]
    pub default_model: String,
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    /// Relay server origin
    #[arg(long, env = "CHATRELAY_URL", default_value = "http://127.0.0.1:3001")]
    pub server: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn serve_defaults() {
        let cli = Cli::try_parse_from(["chatrelay", "serve", "--provider", "echo"]).unwrap();
        let Commands::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        assert_eq!(args.provider, ProviderKind::Echo);
        assert_eq!(args.sink_capacity, 64);
        assert_eq!(args.default_model, "gpt-3.5-turbo");
    }

    #[test]
    fn chat_collects_message_words() {
        let cli = Cli::try_parse_from(["chatrelay", "chat", "--inline", "hello", "there"]).unwrap();
        let Commands::Chat { message, inline, .. } = cli.command else {
            panic!("expected chat");
        };
        assert!(inline);
        assert_eq!(message.join(" "), "hello there");
    }

    #[test]
    fn no_stream_conflicts_with_inline() {
        let parsed = Cli::try_parse_from(["chatrelay", "chat", "--inline", "--no-stream", "hi"]);
        assert!(parsed.is_err());

        let cli = Cli::try_parse_from(["chatrelay", "chat", "--no-stream", "hi"]).unwrap();
        let Commands::Chat { no_stream, .. } = cli.command else {
            panic!("expected chat");
        };
        assert!(no_stream);
    }
}

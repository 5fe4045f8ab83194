use clap::Parser;
use server::config::ServerConfig;
use server::network::Server;
use std::time::Duration;

/// Parses command-line arguments, builds the configuration and runs the
/// server loop until shutdown.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    #[derive(Parser, Debug)]
    #[clap(author, version, about)]
    struct Args {
        /// Server IP address to bind to
        #[clap(short = 'H', long, default_value = "127.0.0.1")]
        host: String,
        /// Server port to listen on
        #[clap(short, long, default_value = "8080")]
        port: u16,
        /// Tick rate (updates per second)
        #[clap(short, long, default_value = "30")]
        tick_rate: u32,
        /// Require session tokens to resolve to a user id
        #[clap(long)]
        auth: bool,
        /// Keep non-ASCII characters in display names
        #[clap(long)]
        allow_non_ascii_usernames: bool,
        /// Display-name prefix reserved for bot connections
        #[clap(long, default_value = "")]
        bots_name_prefix: String,
        /// Mute duration in milliseconds
        #[clap(long)]
        mute_duration_ms: Option<u64>,
        /// Minimum active play time (ms) before a vote-mute counts
        #[clap(long)]
        min_playtime_to_vote_ms: Option<u64>,
        /// Flag code used when neither client nor geolocation provides one
        #[clap(long)]
        default_flag: Option<String>,
        /// Maximum simultaneous connections
        #[clap(long)]
        max_connections: Option<usize>,
    }

    env_logger::init();

    let args = Args::parse();

    let mut config = ServerConfig {
        auth_active: args.auth,
        allow_non_ascii_usernames: args.allow_non_ascii_usernames,
        bots_name_prefix: args.bots_name_prefix,
        ..ServerConfig::default()
    };
    if let Some(duration) = args.mute_duration_ms {
        config.mute_duration_ms = duration;
    }
    if let Some(playtime) = args.min_playtime_to_vote_ms {
        config.min_playtime_to_vote_ms = playtime;
    }
    if let Some(flag) = args.default_flag {
        config.default_flag = flag.to_uppercase();
    }
    if let Some(max) = args.max_connections {
        config.max_connections = max;
    }

    let address = format!("{}:{}", args.host, args.port);
    let tick_duration = Duration::from_secs_f64(1.0 / args.tick_rate.max(1) as f64);

    let mut server = Server::new(&address, tick_duration, config).await?;
    server.run().await
}

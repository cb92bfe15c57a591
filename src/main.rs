use std::net::SocketAddr;

use clap::{Parser, Subcommand};

use wikiproxy::config::Config;

#[derive(Parser)]
#[command(
    name = "wikiproxy",
    version,
    about = "Reverse proxy exposing multi-domain Wikipedia behind one host per language"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Config file path
    #[arg(short, long, global = true, default_value = "wikiproxy.yaml")]
    config: String,

    /// Log at debug level
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the proxy (default when no subcommand given)
    Run {
        /// Override the configured listen address
        #[arg(short, long)]
        bind: Option<SocketAddr>,
    },

    /// Validate the config file and exit
    Check,

    /// Print a commented sample config to stdout
    Generate,
}

fn main() -> wikiproxy::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        None | Some(Commands::Run { bind: None }) => {
            let config = Config::load(&cli.config)?;
            wikiproxy::serve::run(config, cli.debug)
        }
        Some(Commands::Run { bind: Some(bind) }) => {
            let mut config = Config::load(&cli.config)?;
            config.server.bind = bind;
            wikiproxy::serve::run(config, cli.debug)
        }
        Some(Commands::Check) => {
            let config = Config::load(&cli.config)?;
            println!(
                "configuration OK: {} binding(s), proxy: {}",
                config.wikis.len(),
                config.proxy.as_deref().unwrap_or("none")
            );
            Ok(())
        }
        Some(Commands::Generate) => {
            print!("{}", Config::sample());
            Ok(())
        }
    }
}

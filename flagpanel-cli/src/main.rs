mod logging;
mod remote;
mod server;

use std::process;

use clap::{Args as ClapArgs, Parser, Subcommand};

use crate::remote::{resolve_remote, Remote};
use crate::server::config::PanelConfig;

#[derive(Parser, Debug)]
#[command(name = "flagpanel")]
#[command(version)]
#[command(about = "Toggle feature flags kept in a single JSON document", long_about = None)]
struct Args {
    /// Path to config file
    #[arg(short = 'c', long = "config", default_value = "flagpanel.toml", global = true)]
    config: String,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Command,
}

/// Where remote commands connect.
#[derive(ClapArgs, Debug)]
struct RemoteArgs {
    /// Panel server URL
    #[arg(short = 'r', long = "remote", env = "FP_URL")]
    remote: Option<String>,

    /// API or session token
    #[arg(long = "token", env = "FP_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Refuse to write if someone else changed the flags since they were read
    #[arg(long = "strict")]
    strict: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the panel HTTP server
    Serve {
        /// Port to listen on
        #[arg(short = 'p', long = "port")]
        port: Option<u16>,

        /// Address to bind
        #[arg(long = "hostname")]
        hostname: Option<String>,
    },
    /// List flags
    List {
        #[command(flatten)]
        remote: RemoteArgs,

        /// Only show keys containing this text (case-insensitive)
        #[arg(short = 's', long = "search")]
        search: Option<String>,

        /// Print the raw listing as JSON
        #[arg(long = "json")]
        json: bool,
    },
    /// Create a disabled flag
    Create {
        #[command(flatten)]
        remote: RemoteArgs,
        key: String,
    },
    /// Turn a flag on
    Enable {
        #[command(flatten)]
        remote: RemoteArgs,
        key: String,
    },
    /// Turn a flag off
    Disable {
        #[command(flatten)]
        remote: RemoteArgs,
        key: String,
    },
    /// Flip a flag
    Toggle {
        #[command(flatten)]
        remote: RemoteArgs,
        key: String,
    },
    /// Rename a flag, keeping its value
    Rename {
        #[command(flatten)]
        remote: RemoteArgs,
        old_key: String,
        new_key: String,
    },
    /// Delete flags, one request per key
    Delete {
        #[command(flatten)]
        remote: RemoteArgs,

        /// Skip the confirmation prompt
        #[arg(short = 'y', long = "yes")]
        yes: bool,

        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Show or set maintenance mode
    Maintenance {
        #[command(flatten)]
        remote: RemoteArgs,

        /// on or off; omit to show the current state
        state: Option<String>,
    },
    /// Apply several key=on|off changes in one write
    Save {
        #[command(flatten)]
        remote: RemoteArgs,

        #[arg(required = true)]
        assignments: Vec<String>,
    },
    /// Sign in as an operator and print a session token
    Login {
        /// Panel server URL
        #[arg(short = 'r', long = "remote", env = "FP_URL")]
        remote: Option<String>,

        #[arg(short = 'e', long = "email")]
        email: String,

        /// Read from stdin when omitted
        #[arg(long = "password", env = "FP_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },
    /// Hash a password for the [[auth.operators]] section
    HashPassword {
        /// Read from stdin when omitted
        password: Option<String>,
    },
}

fn remote_for(args: &RemoteArgs, config: &PanelConfig) -> Remote {
    resolve_remote(args.remote.as_deref(), args.token.as_deref(), &config.remote)
}

fn run_hash_password(password: Option<String>) {
    let password = password.unwrap_or_else(remote::read_password);
    if password.is_empty() {
        eprintln!("Password must not be empty");
        process::exit(1);
    }

    match server::session::hash_password(&password) {
        Ok(hash) => println!("{}", hash),
        Err(e) => {
            eprintln!("Hashing failed: {}", e);
            process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Args::parse();

    let mut config = PanelConfig::load(&cli.config);
    config.apply_env_overrides();
    logging::init_tracing(&config.logging, cli.verbose);

    match cli.cmd {
        Command::Serve { port, hostname } => server::run_serve(config, port, hostname).await,
        Command::List {
            remote,
            search,
            json,
        } => remote::run_list(&remote_for(&remote, &config), search.as_deref(), json).await,
        Command::Create { remote, key } => {
            remote::run_create(&remote_for(&remote, &config), &key, remote.strict).await
        }
        Command::Enable { remote, key } => {
            remote::run_set(&remote_for(&remote, &config), &key, true, remote.strict).await
        }
        Command::Disable { remote, key } => {
            remote::run_set(&remote_for(&remote, &config), &key, false, remote.strict).await
        }
        Command::Toggle { remote, key } => {
            remote::run_toggle(&remote_for(&remote, &config), &key, remote.strict).await
        }
        Command::Rename {
            remote,
            old_key,
            new_key,
        } => {
            remote::run_rename(&remote_for(&remote, &config), &old_key, &new_key, remote.strict)
                .await
        }
        Command::Delete { remote, yes, keys } => {
            remote::run_delete(&remote_for(&remote, &config), &keys, yes, remote.strict).await
        }
        Command::Maintenance { remote, state } => {
            remote::run_maintenance(&remote_for(&remote, &config), state.as_deref(), remote.strict)
                .await
        }
        Command::Save {
            remote,
            assignments,
        } => remote::run_save(&remote_for(&remote, &config), &assignments, remote.strict).await,
        Command::Login {
            remote,
            email,
            password,
        } => {
            let url = resolve_remote(remote.as_deref(), None, &config.remote).url;
            remote::run_login(&url, &email, password).await
        }
        Command::HashPassword { password } => run_hash_password(password),
    }
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn cli_definition_is_consistent() {
        Args::command().debug_assert();
    }

    #[test]
    fn parses_delete_with_flags() {
        let args = Args::try_parse_from([
            "flagpanel", "delete", "--yes", "--remote", "http://panel:8080", "a", "b",
        ])
        .unwrap();
        match args.cmd {
            Command::Delete { remote, yes, keys } => {
                assert!(yes);
                assert_eq!(remote.remote.as_deref(), Some("http://panel:8080"));
                assert_eq!(keys, vec!["a", "b"]);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }
}

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::{
    api::ConnectRequest,
    bridge::Notice,
    config::Config,
    error::Error,
    registry::SessionRegistry,
    transport::ConnectionKind,
};

/// The command line interface for serial harbor.
#[derive(Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to a configuration file
    pub config: Option<PathBuf>,

    /// Address to listen on, overrides the configuration file
    #[arg(long, env = "HARBOR_HOST")]
    pub host: Option<String>,

    /// Port to listen on, overrides the configuration file
    #[arg(long, env = "HARBOR_PORT")]
    pub port: Option<u16>,

    /// Log level, overrides the configuration file
    #[arg(long, env = "HARBOR_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Subcommands
    #[command(subcommand)]
    pub command: Option<Commands>,
}

impl Cli {
    /// Apply command line and environment overrides on top of `config`.
    pub fn apply_overrides(&self, mut config: Config) -> Config {
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(log_level) = &self.log_level {
            config.log_level = log_level.clone();
        }

        config
    }
}

/// Commands available in the command line interface.
#[derive(Subcommand)]
pub enum Commands {
    /// Examples for user convenience.
    #[command(subcommand)]
    Examples(Examples),

    /// List the serial ports visible to this machine.
    ListPorts,
}

/// Helpful examples for users.
#[derive(Subcommand, Clone)]
pub enum Examples {
    /// Show an example of a configuration file's contents.
    Config,

    /// Show an example JSON request body for opening a session.
    ConnectRequest,

    /// Show an example JSON error notice sent to a viewer.
    ErrorNotice,
}

fn example(example: Examples) -> String {
    match example {
        Examples::Config => Config::example().serialize_pretty(),
        Examples::ConnectRequest => {
            let request = ConnectRequest {
                port: "192.168.1.50:2323".into(),
                baudrate: None,
                connection_type: ConnectionKind::Tcp,
            };
            serde_json::to_string_pretty(&request).unwrap_or_default()
        }
        Examples::ErrorNotice => {
            Notice::error(Error::NotConnected("/dev/ttyACM0".into()).to_string()).to_json()
        }
    }
}

/// Run a subcommand to completion, printing its output.
pub fn handle_command(command: Commands) -> Result<(), Error> {
    match command {
        Commands::Examples(examples) => println!("{}", example(examples)),
        Commands::ListPorts => {
            let ports = SessionRegistry::list_ports()?;

            if ports.is_empty() {
                println!("No serial ports found");
            }

            for port in ports {
                println!("{}", port.identifier);
                println!("    {}", port.description);
                if let Some(manufacturer) = port.manufacturer {
                    println!("    {manufacturer}");
                }
                println!("    {}", port.hardware_id);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn overrides_win() {
        let cli = Cli::parse_from(["serial-harbor", "--port", "9999", "--log-level", "trace"]);
        let config = cli.apply_overrides(Config::default());

        assert_eq!(config.port, 9999);
        assert_eq!(config.log_level, "trace");
        assert_eq!(config.host, "0.0.0.0");
    }

    #[test]
    fn examples_parse_back() {
        let request: ConnectRequest = serde_json::from_str(&example(Examples::ConnectRequest)).unwrap();
        assert_eq!(request.connection_type, ConnectionKind::Tcp);

        let config = Config::deserialize(&example(Examples::Config)).unwrap();
        assert_eq!(config, Config::example());

        let notice: Notice = serde_json::from_str(&example(Examples::ErrorNotice)).unwrap();
        assert_eq!(notice, Notice::error("`/dev/ttyACM0` is not connected"));
    }
}

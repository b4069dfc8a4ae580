//! Command-line interface handling for the Relay server.
//!
//! Global options select the configuration file and logging; the
//! subcommand decides whether this process runs the server or hands a
//! message to one that is already running.

use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use std::path::PathBuf;

/// Configuration file used when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "relay.toml";

/// Message queued by `relay send` when none is given.
pub const DEFAULT_MESSAGE: &str = "{}";

/// Command line arguments parsed from user input.
#[derive(Debug, Clone, PartialEq)]
pub struct CliArgs {
    /// Path to the configuration file
    pub config_path: PathBuf,
    /// Optional override for log level
    pub log_level: Option<String>,
    /// Whether to force JSON log output
    pub json_logs: bool,
    pub command: CliCommand,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CliCommand {
    /// Run the server until the process is stopped.
    Start(ListenOverrides),
    /// Drop a message into a running server's backlog.
    Send(SendArgs),
}

/// Listen address overrides shared by both subcommands.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ListenOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub path: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SendArgs {
    pub message: String,
    /// Sets the `type` member of a JSON object message
    pub message_type: Option<String>,
    pub listen: ListenOverrides,
}

impl CliArgs {
    /// Parses the process arguments, exiting with usage on error.
    pub fn parse() -> Self {
        Self::from_matches(&Self::command().get_matches())
    }

    /// Builds the clap command tree.
    pub fn command() -> Command {
        Command::new("relay")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Single-threaded WebSocket server with a file-based backlog mailbox")
            .subcommand_required(true)
            .arg_required_else_help(true)
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path")
                    .default_value(DEFAULT_CONFIG_PATH)
                    .global(true),
            )
            .arg(
                Arg::new("log-level")
                    .short('l')
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level (trace, debug, info, warn, error)")
                    .global(true),
            )
            .arg(
                Arg::new("json-logs")
                    .long("json-logs")
                    .help("Output logs in JSON format")
                    .action(ArgAction::SetTrue)
                    .global(true),
            )
            .subcommand(
                Command::new("start")
                    .about("Bind the listener and run the reactor loop")
                    .arg(host_arg())
                    .arg(port_arg()),
            )
            .subcommand(
                Command::new("send")
                    .about("Queue a message for a running server without opening a socket")
                    .arg(
                        Arg::new("message")
                            .value_name("MESSAGE")
                            .help("Message to queue")
                            .default_value(DEFAULT_MESSAGE),
                    )
                    .arg(host_arg())
                    .arg(port_arg())
                    .arg(
                        Arg::new("path")
                            .long("path")
                            .value_name("PATH")
                            .help("Path the target server listens on"),
                    )
                    .arg(
                        Arg::new("type")
                            .short('t')
                            .long("type")
                            .value_name("TYPE")
                            .help("Value for the message's `type` member"),
                    ),
            )
    }

    /// Converts clap matches into [`CliArgs`].
    pub fn from_matches(matches: &ArgMatches) -> Self {
        let command = match matches.subcommand() {
            Some(("send", sub)) => CliCommand::Send(SendArgs {
                message: sub
                    .get_one::<String>("message")
                    .cloned()
                    .unwrap_or_else(|| DEFAULT_MESSAGE.to_string()),
                message_type: sub.get_one::<String>("type").cloned(),
                listen: listen_overrides(sub),
            }),
            Some(("start", sub)) => CliCommand::Start(listen_overrides(sub)),
            _ => CliCommand::Start(ListenOverrides::default()),
        };

        Self {
            config_path: PathBuf::from(
                matches
                    .get_one::<String>("config")
                    .map(String::as_str)
                    .unwrap_or(DEFAULT_CONFIG_PATH),
            ),
            log_level: matches.get_one::<String>("log-level").cloned(),
            json_logs: matches.get_flag("json-logs"),
            command,
        }
    }
}

fn host_arg() -> Arg {
    Arg::new("host")
        .long("host")
        .value_name("HOST")
        .help("Listen host (e.g., 127.0.0.1)")
}

fn port_arg() -> Arg {
    Arg::new("port")
        .short('p')
        .long("port")
        .value_name("PORT")
        .help("Listen port")
        .value_parser(value_parser!(u16))
}

fn listen_overrides(matches: &ArgMatches) -> ListenOverrides {
    ListenOverrides {
        host: matches.get_one::<String>("host").cloned(),
        port: matches.get_one::<u16>("port").copied(),
        path: matches
            .try_get_one::<String>("path")
            .ok()
            .flatten()
            .cloned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> CliArgs {
        let matches = CliArgs::command().try_get_matches_from(args).unwrap();
        CliArgs::from_matches(&matches)
    }

    #[test]
    fn test_start_defaults() {
        let args = parse(&["relay", "start"]);
        assert_eq!(args.config_path, PathBuf::from("relay.toml"));
        assert_eq!(args.log_level, None);
        assert!(!args.json_logs);
        assert_eq!(args.command, CliCommand::Start(ListenOverrides::default()));
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = parse(&["relay", "start", "--port", "9001", "-c", "other.toml", "--json-logs", "-l", "debug"]);
        assert_eq!(args.config_path, PathBuf::from("other.toml"));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert!(args.json_logs);
        match args.command {
            CliCommand::Start(listen) => {
                assert_eq!(listen.port, Some(9001));
                assert_eq!(listen.host, None);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_send_arguments() {
        let args = parse(&["relay", "send", r#"{"text":"hi"}"#, "--host", "127.0.0.1", "--path", "/chat", "--type", "notice"]);
        match args.command {
            CliCommand::Send(send) => {
                assert_eq!(send.message, r#"{"text":"hi"}"#);
                assert_eq!(send.message_type.as_deref(), Some("notice"));
                assert_eq!(send.listen.host.as_deref(), Some("127.0.0.1"));
                assert_eq!(send.listen.path.as_deref(), Some("/chat"));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_send_default_message() {
        let args = parse(&["relay", "send"]);
        assert!(matches!(args.command, CliCommand::Send(ref send) if send.message == "{}"));
    }

    #[test]
    fn test_rejects_bad_port_and_missing_subcommand() {
        assert!(CliArgs::command().try_get_matches_from(["relay", "start", "--port", "http"]).is_err());
        assert!(CliArgs::command().try_get_matches_from(["relay"]).is_err());
    }
}

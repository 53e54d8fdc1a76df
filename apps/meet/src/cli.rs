use clap::builder::FalseyValueParser;
use clap::{Args, Parser};
use std::path::PathBuf;

use crate::telemetry::logging::{LogConfig, LogLevel};

#[derive(Parser, Debug)]
#[command(
    name = "meet",
    about = "Join a rendezvous room and negotiate a two-party media session",
    version
)]
pub struct Cli {
    #[arg(
        long,
        value_name = "ROOM",
        help = "Room to join; a random room is picked when omitted"
    )]
    pub room: Option<String>,

    #[arg(
        long,
        env = "MEET_ROOM_SERVER",
        value_name = "URL",
        help = "Base URL of the rendezvous service"
    )]
    pub server: Option<String>,

    #[command(flatten)]
    pub logging: LoggingArgs,
}

#[derive(Args, Debug, Clone)]
pub struct LoggingArgs {
    #[arg(
        long = "log-level",
        value_enum,
        env = "MEET_LOG_LEVEL",
        default_value_t = LogLevel::Warn,
        help = "Minimum log level (error, warn, info, debug, trace)"
    )]
    pub level: LogLevel,

    #[arg(
        long = "log-file",
        value_name = "PATH",
        env = "MEET_LOG_FILE",
        help = "Append logs to the specified file instead of stderr"
    )]
    pub file: Option<PathBuf>,

    #[arg(
        long = "log-filter",
        value_name = "DIRECTIVES",
        env = "MEET_LOG_FILTER",
        help = "Raw tracing filter directives; overrides --log-level"
    )]
    pub filter: Option<String>,

    #[arg(
        long = "trace-deps",
        env = "MEET_TRACE_DEPS",
        value_parser = FalseyValueParser::new(),
        help = "Keep trace output from HTTP, websocket and WebRTC crates"
    )]
    pub trace_dependencies: bool,
}

impl LoggingArgs {
    pub fn to_config(&self) -> LogConfig {
        LogConfig {
            level: self.level,
            file: self.file.clone(),
            filter: self.filter.clone(),
            trace_dependencies: self.trace_dependencies,
        }
    }
}

use clap::{Args, Parser, Subcommand};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::env;
use std::fmt;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, env = "CONFIG_FILE", global = true)]
    pub config: Option<String>,

    /// Port to listen on
    #[arg(long, env = "PORT", global = true)]
    pub port: Option<u16>,

    /// Maximum number of runs executing at once
    #[arg(long, env = "MAX_CONCURRENT_RUNS", global = true)]
    pub max_concurrent_runs: Option<usize>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Serve the HTTP API and web UI (default)
    Serve,

    /// Export the messages of one chat, or of every chat shared with the
    /// given participants
    ExportChat {
        /// Chat id, as shown in the Teams URL (encoded or not)
        #[arg(long, required_unless_present = "participants", conflicts_with = "participants")]
        chat_id: Option<String>,

        /// Display names or e-mails of the other participants (comma separated)
        #[arg(long, value_delimiter = ',')]
        participants: Vec<String>,

        /// Start of the range (YYYY-MM-DD, YYYY-MM-DDTHH:MM:SS[Z], or RFC 3339)
        #[arg(long)]
        since: String,

        /// End of the range, exclusive (defaults to now)
        #[arg(long)]
        until: Option<String>,

        /// Drop system events such as member changes
        #[arg(long)]
        exclude_system_messages: bool,

        /// Only messages sent by the signed-in user
        #[arg(long)]
        only_mine: bool,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// List chats matching type, size, topic and participant filters
    ListChats {
        /// oneOnOne, group, meeting, or all
        #[arg(long, default_value = "oneOnOne")]
        chat_type: String,

        /// Maximum member count; 0 disables the limit (default 2)
        #[arg(long)]
        max_participants: Option<usize>,

        /// Topic keywords to include (comma separated)
        #[arg(long, value_delimiter = ',')]
        topic_include: Vec<String>,

        /// Topic keywords to exclude (comma separated)
        #[arg(long, value_delimiter = ',')]
        topic_exclude: Vec<String>,

        /// Member e-mail addresses (comma separated)
        #[arg(long, value_delimiter = ',')]
        participants: Vec<String>,

        #[command(flatten)]
        output: OutputArgs,
    },

    /// List recently active chats, most recent first
    ListActiveChats {
        /// Activity window in days; 0 keeps all chats
        #[arg(long, default_value_t = 365)]
        min_activity_days: u32,

        /// Skip meetings with more members than this; 0 disables the limit
        #[arg(long, default_value_t = 10)]
        max_meeting_participants: usize,

        #[command(flatten)]
        output: OutputArgs,
    },
}

#[derive(Args, Debug, Clone, PartialEq, Eq)]
pub struct OutputArgs {
    /// Write the JSON result here instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub graph: GraphConfig,
    pub runs: RunsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub host: String,
    pub static_dir: PathBuf,
    pub request_timeout_secs: u64,
}

#[derive(Deserialize, Clone)]
pub struct GraphConfig {
    pub base_url: String,
    #[serde(default)]
    pub access_token: Option<String>,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub page_size: u32,
}

impl fmt::Debug for GraphConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphConfig")
            .field("base_url", &self.base_url)
            .field("access_token", &self.access_token.as_ref().map(|_| "<redacted>"))
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("max_retries", &self.max_retries)
            .field("backoff_base_ms", &self.backoff_base_ms)
            .field("backoff_max_ms", &self.backoff_max_ms)
            .field("page_size", &self.page_size)
            .finish()
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ResultStoreKind {
    File,
    Memory,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RunsConfig {
    pub max_concurrent: usize,
    pub result_store: ResultStoreKind,
    pub results_dir: PathBuf,
}

impl AppConfig {
    pub fn load_from_args<I, T>(args: I) -> Result<Self, config::ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        let cli =
            Cli::try_parse_from(args).map_err(|e| config::ConfigError::Message(e.to_string()))?;
        Self::load_with_cli(&cli)
    }

    /// Defaults, then the config file, then `CHAT_EXPORT_*` variables, then CLI flags.
    pub fn load_with_cli(cli: &Cli) -> Result<Self, config::ConfigError> {
        let mut builder = Config::builder()
            .set_default("server.port", 8080)?
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.static_dir", "web")?
            .set_default("server.request_timeout_secs", 30)?
            .set_default("graph.base_url", "https://graph.microsoft.com/v1.0")?
            .set_default("graph.request_timeout_secs", 30)?
            .set_default("graph.max_retries", 5)?
            .set_default("graph.backoff_base_ms", 2000)?
            .set_default("graph.backoff_max_ms", 60_000)?
            .set_default("graph.page_size", 50)?
            .set_default("runs.max_concurrent", 3)?
            .set_default("runs.result_store", "file")?
            .set_default("runs.results_dir", "api_results")?;

        // Unprefixed token variable, lowest precedence after the defaults.
        if let Ok(token) = env::var("GRAPH_ACCESS_TOKEN") {
            if !token.trim().is_empty() {
                builder = builder.set_default("graph.access_token", token)?;
            }
        }

        builder = match &cli.config {
            Some(path) => builder.add_source(File::with_name(path)),
            None => builder.add_source(File::with_name("config").required(false)),
        };

        // E.g. CHAT_EXPORT_GRAPH__MAX_RETRIES=8
        builder = builder.add_source(
            Environment::with_prefix("CHAT_EXPORT")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        if let Some(port) = cli.port {
            builder = builder.set_override("server.port", i64::from(port))?;
        }
        if let Some(max) = cli.max_concurrent_runs {
            builder = builder.set_override("runs.max_concurrent", max as u64)?;
        }

        let cfg = builder.build()?;
        cfg.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subcommand_parsing() {
        let cli = Cli::try_parse_from([
            "chat-export",
            "list-chats",
            "--chat-type",
            "group",
            "--topic-include",
            "alpha,beta",
            "-o",
            "out.json",
        ])
        .unwrap();

        match cli.command {
            Some(Command::ListChats {
                chat_type,
                topic_include,
                max_participants,
                output,
                ..
            }) => {
                assert_eq!(chat_type, "group");
                assert_eq!(topic_include, ["alpha", "beta"]);
                assert_eq!(max_participants, None);
                assert_eq!(output.output, Some(PathBuf::from("out.json")));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_no_subcommand_means_serve() {
        let cli = Cli::try_parse_from(["chat-export"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_graph_config_debug_redacts_token() {
        let cfg = GraphConfig {
            base_url: "https://graph.microsoft.com/v1.0".into(),
            access_token: Some("eyJ-secret".into()),
            request_timeout_secs: 30,
            max_retries: 5,
            backoff_base_ms: 2000,
            backoff_max_ms: 60_000,
            page_size: 50,
        };
        assert!(!format!("{cfg:?}").contains("eyJ-secret"));
    }
}

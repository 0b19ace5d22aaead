use std::time::Duration;

use clap::Parser;
use uuid::Uuid;

use crate::collectors::backoff::BackoffConfig;
use crate::jobs::runner::RunnerSettings;

#[derive(Parser, Debug, Clone)]
#[command(name = "inboxcollector", about = "Social inbox collection service")]
pub struct Config {
    /// Database connection URL
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Run database migrations on startup
    #[arg(long, env = "RUN_MIGRATIONS", default_value = "true")]
    pub run_migrations: bool,

    /// Emit logs as JSON lines instead of human-readable text
    #[arg(long, env = "LOG_JSON", default_value = "false")]
    pub log_json: bool,

    /// First retry delay in milliseconds
    #[arg(long, env = "RETRY_INITIAL_DELAY_MS", default_value = "1000")]
    pub retry_initial_delay_ms: u64,

    /// Upper bound for a single retry delay in milliseconds
    #[arg(long, env = "RETRY_MAX_DELAY_MS", default_value = "60000")]
    pub retry_max_delay_ms: u64,

    #[arg(long, env = "RETRY_MULTIPLIER", default_value = "2.0")]
    pub retry_multiplier: f64,

    #[arg(long, env = "RETRY_MAX_RETRIES", default_value = "3")]
    pub retry_max_retries: u32,

    /// Longest rate-limit reset worth waiting for between accounts
    #[arg(long, env = "MAX_INTER_ACCOUNT_WAIT_SECS", default_value = "60")]
    pub max_inter_account_wait_secs: u64,

    /// Items requested per collector call
    #[arg(long, env = "COLLECTION_PAGE_SIZE", default_value = "50")]
    pub collection_page_size: u32,

    /// Pages followed per message kind in one account job
    #[arg(long, env = "MAX_PAGES_PER_CALL", default_value = "10")]
    pub max_pages_per_call: u32,

    #[arg(long, env = "HTTP_TIMEOUT_SECS", default_value = "30")]
    pub http_timeout_secs: u64,

    #[arg(long, env = "TWITTER_API_BASE", default_value = "https://api.twitter.com")]
    pub twitter_api_base: String,

    #[arg(
        long,
        env = "FACEBOOK_GRAPH_BASE",
        default_value = "https://graph.facebook.com/v19.0"
    )]
    pub facebook_graph_base: String,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(clap::Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the trigger API (default when no subcommand given)
    Serve {
        /// Listen address
        #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8080")]
        listen_addr: String,

        /// Bearer token external schedulers must present
        #[arg(long, env = "SCHEDULER_TOKEN", hide_env_values = true)]
        scheduler_token: String,
    },
    /// Run one collection pass and print the results as JSON
    Collect {
        /// Collect a single account
        #[arg(long, conflicts_with = "workspace")]
        account: Option<Uuid>,

        /// Collect every account of one workspace
        #[arg(long)]
        workspace: Option<Uuid>,
    },
    /// Run the global collection on a fixed interval until interrupted
    Schedule {
        #[arg(long, env = "COLLECTION_INTERVAL_SECS", default_value = "300")]
        interval_secs: u64,
    },
}

impl Config {
    /// Resolve the command, defaulting to Serve if none specified.
    pub fn resolved_command(&self) -> anyhow::Result<Command> {
        if let Some(command) = &self.command {
            return Ok(command.clone());
        }
        let scheduler_token = std::env::var("SCHEDULER_TOKEN")
            .map_err(|_| anyhow::anyhow!("SCHEDULER_TOKEN must be set to serve the API"))?;
        Ok(Command::Serve {
            listen_addr: std::env::var("LISTEN_ADDR")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            scheduler_token,
        })
    }

    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            initial_delay: Duration::from_millis(self.retry_initial_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            multiplier: self.retry_multiplier,
            max_retries: self.retry_max_retries,
        }
    }

    pub fn runner_settings(&self) -> RunnerSettings {
        RunnerSettings {
            page_size: self.collection_page_size,
            max_pages: self.max_pages_per_call,
            max_inter_account_wait: Duration::from_secs(self.max_inter_account_wait_secs),
        }
    }
}

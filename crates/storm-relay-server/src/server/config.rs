use crate::server::telemetry::LogFormat;
use anyhow::bail;
use clap::Parser;
use core::time::Duration;
use storm_relay_core::RunnerConfig;

/// Runtime configuration for the `storm-relay-server` binary.
///
/// These settings control concurrency, buffering and time limits of the
/// relay. All values are parsed from CLI arguments or environment variables
/// (a `.env` file is loaded first), with defaults suitable for a single-node
/// deployment.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "storm-relay-server",
    version,
    about = "An HTTP service streaming progress and results of article generation runs"
)]
pub struct CliArgs {
    /// Address to listen on.
    ///
    /// Environment variable: `SERVER_ADDR`
    #[arg(long, env = "SERVER_ADDR", default_value_t = String::from("0.0.0.0:8000"))]
    pub server_addr: String,

    /// Number of worker threads executing generation jobs concurrently.
    ///
    /// Each job occupies its worker for the whole run, so this is also the
    /// number of runs that make progress at the same time.
    ///
    /// Environment variable: `NUM_WORKERS`
    #[arg(long, env = "NUM_WORKERS", default_value_t = 2)]
    pub num_workers: usize,

    /// Runs that may wait for a free worker before requests are rejected with
    /// `503 Service Unavailable`.
    ///
    /// Environment variable: `QUEUE_CAPACITY`
    #[arg(long, env = "QUEUE_CAPACITY", default_value_t = 8)]
    pub queue_capacity: usize,

    /// Capacity of each run's progress channel.
    ///
    /// When a client reads slower than the job reports, the job blocks once
    /// this many events are buffered.
    ///
    /// Environment variable: `PROGRESS_BUFFER_SIZE`
    #[arg(long, env = "PROGRESS_BUFFER_SIZE", default_value_t = 256)]
    pub progress_buffer_size: usize,

    /// Largest artifact a job may write into its in-memory store, in bytes.
    ///
    /// Environment variable: `MAX_ARTIFACT_BYTES`
    #[arg(long, env = "MAX_ARTIFACT_BYTES", default_value_t = 1 << 30)]
    pub max_artifact_bytes: usize,

    /// Maximum duration of one run in seconds; `0` disables the limit.
    ///
    /// Environment variable: `RUN_TIMEOUT_SECS`
    #[arg(long, env = "RUN_TIMEOUT_SECS", default_value_t = 1800)]
    pub run_timeout_secs: u64,

    /// How long shutdown waits for in-flight runs before cancelling them.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_SECS`
    #[arg(long, env = "SHUTDOWN_TIMEOUT_SECS", default_value_t = 30)]
    pub shutdown_timeout_secs: u64,

    /// Longest accepted topic, in characters.
    ///
    /// Environment variable: `MAX_TOPIC_CHARS`
    #[arg(long, env = "MAX_TOPIC_CHARS", default_value_t = 500)]
    pub max_topic_chars: usize,

    /// Pause of the built-in template generator between stages, in
    /// milliseconds.
    ///
    /// Environment variable: `STAGE_DELAY_MS`
    #[arg(long, env = "STAGE_DELAY_MS", default_value_t = 250)]
    pub stage_delay_ms: u64,

    /// Log output format.
    ///
    /// Environment variable: `LOG_FORMAT`
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Pretty)]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub server_addr: String,
    pub num_workers: usize,
    pub queue_capacity: usize,
    pub progress_buffer_size: usize,
    pub max_artifact_bytes: usize,
    pub run_timeout: Option<Duration>,
    pub shutdown_timeout: Duration,
    pub max_topic_chars: usize,
    pub stage_delay: Duration,
    pub log_format: LogFormat,
}

impl ServerConfig {
    /// The task runner settings derived from this configuration.
    #[must_use]
    pub fn runner_config(&self) -> RunnerConfig {
        RunnerConfig {
            num_workers: self.num_workers,
            queue_capacity: self.queue_capacity,
            progress_buffer_size: self.progress_buffer_size,
            max_artifact_bytes: self.max_artifact_bytes,
            run_timeout: self.run_timeout,
            shutdown_timeout: self.shutdown_timeout,
            max_topic_chars: self.max_topic_chars,
        }
    }
}

impl TryFrom<CliArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        if args.num_workers == 0 {
            bail!("NUM_WORKERS must be greater than 0");
        }

        if args.progress_buffer_size == 0 {
            bail!("PROGRESS_BUFFER_SIZE must be greater than 0");
        }

        if args.max_artifact_bytes == 0 {
            bail!("MAX_ARTIFACT_BYTES must be greater than 0");
        }

        if args.max_topic_chars == 0 {
            bail!("MAX_TOPIC_CHARS must be greater than 0");
        }

        let run_timeout =
            (args.run_timeout_secs > 0).then(|| Duration::from_secs(args.run_timeout_secs));

        Ok(Self {
            server_addr: args.server_addr,
            num_workers: args.num_workers,
            queue_capacity: args.queue_capacity,
            progress_buffer_size: args.progress_buffer_size,
            max_artifact_bytes: args.max_artifact_bytes,
            run_timeout,
            shutdown_timeout: Duration::from_secs(args.shutdown_timeout_secs),
            max_topic_chars: args.max_topic_chars,
            stage_delay: Duration::from_millis(args.stage_delay_ms),
            log_format: args.log_format,
        })
    }
}

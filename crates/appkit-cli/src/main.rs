//! CLI binary for serving streams and tailing them with automatic resume.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use appkit_client::{BackoffPolicy, ConnectOptions, Payload, StreamClient, StreamEnd};
use appkit_server::{serve, AppState, ServerConfig};
use appkit_types::duration_serde::parse_duration;
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "appkit", version, about = "Resumable Server-Sent Event streams")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the stream server
    Serve(ServeArgs),

    /// Print a stream's events, reconnecting and resuming on failure
    Tail(TailArgs),
}

#[derive(Args, Debug, Default)]
struct ServeArgs {
    /// JSON config file; flags override its values
    #[arg(short, long, env = "APPKIT_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on (default: 127.0.0.1:8080)
    #[arg(short, long, env = "APPKIT_BIND")]
    bind: Option<String>,

    /// Events retained per stream
    #[arg(long, env = "APPKIT_BUFFER_EVENTS")]
    buffer_events: Option<usize>,

    /// Payload bytes retained per stream
    #[arg(long, env = "APPKIT_BUFFER_BYTES")]
    buffer_bytes: Option<usize>,

    /// How long finished streams stay available for replay (e.g. 10m)
    #[arg(long, env = "APPKIT_RETENTION", value_parser = parse_duration)]
    retention: Option<Duration>,

    /// Idle time after which a stream with no clients is evicted (e.g. 5m)
    #[arg(long, env = "APPKIT_ABANDONMENT", value_parser = parse_duration)]
    abandonment: Option<Duration>,

    /// Interval between heartbeat comments on idle connections (e.g. 10s)
    #[arg(long, env = "APPKIT_HEARTBEAT", value_parser = parse_duration)]
    heartbeat: Option<Duration>,

    /// Maximum number of live streams before the least recently used is evicted
    #[arg(long, env = "APPKIT_MAX_ACTIVE_STREAMS")]
    max_active_streams: Option<usize>,

    /// Don't serve the demo ticker for new streams
    #[arg(long, env = "APPKIT_NO_DEMO")]
    no_demo: bool,
}

#[derive(Args, Debug)]
struct TailArgs {
    /// Stream URL, e.g. http://127.0.0.1:8080/api/stream/demo
    url: String,

    /// Request body; sends a POST instead of a GET. Non-JSON is sent as-is.
    #[arg(short, long)]
    payload: Option<String>,

    /// Resume after this event id
    #[arg(long)]
    last_event_id: Option<String>,

    /// Wait between reconnect attempts
    #[arg(long, default_value = "2s", value_parser = parse_duration)]
    retry_delay: Duration,

    /// Double the wait after each consecutive failure, up to this cap
    #[arg(long, value_parser = parse_duration)]
    max_retry_delay: Option<Duration>,

    /// Give up after this many consecutive failures (default: never)
    #[arg(long)]
    max_retries: Option<usize>,

    /// Longest wait for headers or the next chunk
    #[arg(long, value_parser = parse_duration)]
    timeout: Option<Duration>,

    /// Largest undelimited frame accepted, in bytes
    #[arg(long, default_value = "1048576")]
    max_buffer_size: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Serve(args) => cmd_serve(args).await?,
        Commands::Tail(args) => cmd_tail(args).await?,
    }

    Ok(())
}

fn server_config(args: &ServeArgs) -> anyhow::Result<ServerConfig> {
    let mut config = match &args.config {
        Some(path) => ServerConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => ServerConfig::default(),
    };

    if let Some(bind) = &args.bind {
        config.bind = bind.clone();
    }
    if let Some(events) = args.buffer_events {
        config.stream.buffer.max_events = events;
    }
    if let Some(bytes) = args.buffer_bytes {
        config.stream.buffer.max_bytes = bytes;
    }
    if let Some(retention) = args.retention {
        config.stream.retention = retention;
    }
    if let Some(abandonment) = args.abandonment {
        config.stream.abandonment = abandonment;
    }
    if let Some(heartbeat) = args.heartbeat {
        config.stream.heartbeat_interval = heartbeat;
    }
    if let Some(max) = args.max_active_streams {
        config.stream.max_active_streams = max;
    }
    if args.no_demo {
        config.demo_source = false;
    }

    config.validate()?;
    Ok(config)
}

async fn cmd_serve(args: ServeArgs) -> anyhow::Result<()> {
    let config = server_config(&args)?;
    let state = AppState::from_config(&config)?;
    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("binding {}", config.bind))?;

    serve(listener, state, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;
    Ok(())
}

fn connect_options(args: &TailArgs) -> ConnectOptions {
    let mut options = ConnectOptions::new(&args.url).max_buffer_size(args.max_buffer_size);
    options.backoff = match args.max_retry_delay {
        Some(max) => BackoffPolicy::Exponential {
            base: args.retry_delay,
            max,
        },
        None => BackoffPolicy::Fixed(args.retry_delay),
    };
    if let Some(payload) = &args.payload {
        options.payload = Some(match serde_json::from_str(payload) {
            Ok(json) => Payload::Json(json),
            Err(_) => Payload::Raw(payload.clone()),
        });
    }
    options.last_event_id = args.last_event_id.clone();
    options.max_retries = args.max_retries;
    options.timeout = args.timeout;
    options
}

async fn cmd_tail(args: TailArgs) -> anyhow::Result<()> {
    let options = connect_options(&args);
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            cancel.cancel();
        });
    }

    let summary = StreamClient::new()
        .connect(
            options,
            |message| {
                println!(
                    "{}\t{}\t{}",
                    message.id.as_deref().unwrap_or("-"),
                    message.event_type(),
                    message.data
                );
            },
            |err| eprintln!("stream error: {err}"),
            cancel,
        )
        .await?;

    match summary.end {
        StreamEnd::Completed => {
            tracing::info!(messages = summary.messages, attempts = summary.attempts, "Stream complete");
        }
        StreamEnd::Cancelled => {
            eprintln!(
                "cancelled; resume with --last-event-id {}",
                summary.last_event_id.as_deref().unwrap_or("<none>")
            );
        }
        StreamEnd::Failed(payload) => {
            anyhow::bail!("stream failed ({}): {}", payload.code, payload.error);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_serve_flags() {
        let cli = Cli::try_parse_from([
            "appkit",
            "serve",
            "--bind",
            "0.0.0.0:9000",
            "--retention",
            "30s",
            "--buffer-events",
            "10",
            "--no-demo",
        ])
        .unwrap();
        let Commands::Serve(args) = cli.command else {
            panic!("expected serve");
        };
        let config = server_config(&args).unwrap();
        assert_eq!(config.bind, "0.0.0.0:9000");
        assert_eq!(config.stream.retention, Duration::from_secs(30));
        assert_eq!(config.stream.buffer.max_events, 10);
        assert!(!config.demo_source);
        // Untouched values keep their defaults.
        assert_eq!(config.stream.heartbeat_interval, Duration::from_secs(10));
    }

    #[test]
    fn zero_buffer_is_rejected() {
        let args = ServeArgs {
            buffer_events: Some(0),
            ..ServeArgs::default()
        };
        assert!(server_config(&args).is_err());
    }

    #[test]
    fn tail_options() {
        let cli = Cli::try_parse_from([
            "appkit",
            "tail",
            "http://localhost:8080/api/stream/demo",
            "--payload",
            r#"{"payload":{"count":3}}"#,
            "--retry-delay",
            "500ms",
            "--max-retry-delay",
            "8s",
            "--max-retries",
            "4",
        ])
        .unwrap();
        let Commands::Tail(args) = cli.command else {
            panic!("expected tail");
        };
        let options = connect_options(&args);
        assert_eq!(
            options.backoff,
            BackoffPolicy::Exponential {
                base: Duration::from_millis(500),
                max: Duration::from_secs(8),
            }
        );
        assert_eq!(options.max_retries, Some(4));
        assert!(matches!(options.payload, Some(Payload::Json(_))));
        assert_eq!(options.max_buffer_size, 1024 * 1024);
    }

    #[test]
    fn non_json_payload_is_sent_raw() {
        let cli =
            Cli::try_parse_from(["appkit", "tail", "http://x/api/stream/a", "-p", "plain text"])
                .unwrap();
        let Commands::Tail(args) = cli.command else {
            panic!("expected tail");
        };
        assert_eq!(
            connect_options(&args).payload,
            Some(Payload::Raw("plain text".into()))
        );
        assert_eq!(connect_options(&args).backoff, BackoffPolicy::Fixed(Duration::from_secs(2)));
    }
}

//! Purpose: `keyplane` CLI entry point and shared output helpers.
//! Exports: Binary entry point (`main`) plus internal helpers used by `command_dispatch`.
//! Role: Parse args, load config, run one command, emit JSON lines and stable exit codes.
//! Invariants: stdout carries only JSON lines; diagnostics and logs go to stderr.
//! Invariants: Exit codes come from `to_exit_code`; a signal-driven stop exits 0.
#![allow(clippy::result_large_err)]

use std::io::{self, IsTerminal};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use clap::error::ErrorKind as ClapErrorKind;
use clap::{Parser, Subcommand, ValueEnum};
use serde_json::{Map, Value, json};
use std::error::Error as StdError;
use tracing_subscriber::EnvFilter;

mod command_dispatch;

use keyplane::api::config::PEER;
use keyplane::api::{Config, Error, ErrorKind, Reply, Sample, to_exit_code};

const CONFIG_ENV: &str = "KEYPLANE_CONFIG";

#[derive(Copy, Clone, Debug)]
struct RunOutcome {
    exit_code: i32,
}

impl RunOutcome {
    fn ok() -> Self {
        Self { exit_code: 0 }
    }

    fn with_code(exit_code: i32) -> Self {
        Self { exit_code }
    }
}

fn main() {
    init_tracing();
    let exit_code = match run() {
        Ok(outcome) => outcome.exit_code,
        Err((err, color_mode)) => {
            emit_error(&err, color_mode);
            to_exit_code(err.kind())
        }
    };
    std::process::exit(exit_code);
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

fn run() -> Result<RunOutcome, (Error, ColorMode)> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => match err.kind() {
            ClapErrorKind::DisplayHelp
            | ClapErrorKind::DisplayVersion
            | ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand => {
                err.print().map_err(|io_err| {
                    (
                        Error::new(ErrorKind::Internal)
                            .with_message("failed to write help")
                            .with_source(io_err),
                        ColorMode::Auto,
                    )
                })?;
                let exit_code = if matches!(
                    err.kind(),
                    ClapErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
                ) {
                    2
                } else {
                    0
                };
                return Ok(RunOutcome::with_code(exit_code));
            }
            _ => {
                return Err((
                    Error::new(ErrorKind::Usage)
                        .with_message(clap_error_summary(&err))
                        .with_hint("Try `keyplane --help`."),
                    ColorMode::Auto,
                ));
            }
        },
    };

    let color_mode = cli.color;
    let config_path = cli
        .config
        .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from));
    let config = match config_path {
        Some(path) => Config::from_json_file(&path),
        None => Ok(Config::new()),
    }
    .map_err(|err| (err, color_mode))?;

    command_dispatch::dispatch_command(cli.command, config, color_mode)
        .map_err(|err| (err, color_mode))
}

fn clap_error_summary(err: &clap::Error) -> String {
    let rendered = err.to_string();
    rendered
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .map(|line| line.trim_start_matches("error: ").to_string())
        .unwrap_or_else(|| "invalid arguments".to_string())
}

#[derive(Parser)]
#[command(
    name = "keyplane",
    version,
    about = "Publish, subscribe and query over key expressions",
    after_help = r#"EXAMPLES
  $ keyplane put /demo/example/greeting 'hello'
  $ keyplane pub /demo/example/ticker 'tick' mem/default
  $ keyplane get '/demo/example/**?verbose=1'

NOTES
  - Peers are endpoints of the form <proto>/<address>; this build ships `mem/<hub>`
  - KEYPLANE_CONFIG (or --config) names a JSON config file
  - Logs go to stderr; set RUST_LOG=debug for detail"#,
    arg_required_else_help = true
)]
struct Cli {
    #[arg(long, help = "JSON config file (default: $KEYPLANE_CONFIG)")]
    config: Option<PathBuf>,
    #[arg(
        long,
        default_value = "auto",
        value_enum,
        help = "Colorize stderr diagnostics: auto|always|never"
    )]
    color: ColorMode,

    #[command(subcommand)]
    command: Command,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ColorMode {
    Auto,
    Always,
    Never,
}

impl ColorMode {
    fn use_color(self, is_tty: bool) -> bool {
        match self {
            ColorMode::Auto => is_tty,
            ColorMode::Always => true,
            ColorMode::Never => false,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Declare a key expression and put one value on it")]
    Put {
        #[arg(default_value = "/demo/example/keyplane-put")]
        key: String,
        #[arg(default_value = "Put from Rust!")]
        value: String,
        #[arg(help = "Peer endpoint, e.g. mem/default")]
        peer: Option<String>,
        #[arg(long = "attach", value_name = "KEY=VALUE", help = "Repeatable attachment pair")]
        attach: Vec<String>,
    },
    #[command(about = "Put a numbered value once per interval until interrupted")]
    Pub {
        #[arg(default_value = "/demo/example/keyplane-pub")]
        key: String,
        #[arg(default_value = "Pub from Rust!")]
        value: String,
        peer: Option<String>,
        #[arg(long, default_value_t = 1000, help = "Delay between puts")]
        interval_ms: u64,
        #[arg(long, help = "Stop after this many puts")]
        count: Option<u64>,
    },
    #[command(about = "Print samples matching a key expression")]
    Sub {
        #[arg(default_value = "/demo/example/**")]
        key: String,
        peer: Option<String>,
        #[arg(long, help = "Exit after this many samples")]
        count: Option<u64>,
    },
    #[command(about = "Query a selector (`key?parameters`) and print every reply")]
    Get {
        #[arg(default_value = "/demo/example/**")]
        selector: String,
        peer: Option<String>,
        #[arg(long, help = "Query timeout (default: query_timeout_ms from config)")]
        timeout_ms: Option<u64>,
    },
    #[command(about = "Answer queries on a key expression with a fixed value")]
    Queryable {
        #[arg(default_value = "/demo/example/keyplane-queryable")]
        key: String,
        #[arg(default_value = "Queryable from Rust!")]
        value: String,
        peer: Option<String>,
    },
}

/// Applies a positional peer on top of the loaded config.
fn with_peer(mut config: Config, peer: Option<String>) -> Result<Config, Error> {
    if let Some(peer) = peer {
        config.insert(PEER, peer)?;
    }
    Ok(config)
}

fn install_stop_flag() -> Result<Arc<AtomicBool>, Error> {
    let stop = Arc::new(AtomicBool::new(false));
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(signal, Arc::clone(&stop)).map_err(|err| {
            Error::new(ErrorKind::Internal)
                .with_message("failed to install signal handler")
                .with_source(err)
        })?;
    }
    Ok(stop)
}

fn stopped(stop: &AtomicBool) -> bool {
    stop.load(Ordering::Relaxed)
}

fn emit_json(value: Value) {
    let json = serde_json::to_string(&value)
        .unwrap_or_else(|_| "{\"error\":\"json encode failed\"}".to_string());
    println!("{json}");
}

fn format_time(time: SystemTime) -> Option<String> {
    use time::format_description::well_known::Rfc3339;
    let duration = time.duration_since(UNIX_EPOCH).ok()?;
    let ts = time::OffsetDateTime::from_unix_timestamp_nanos(duration.as_nanos() as i128).ok()?;
    ts.format(&Rfc3339).ok()
}

fn sample_json(sample: &Sample) -> Value {
    let mut map = Map::new();
    map.insert("kind".to_string(), json!(sample.kind.as_str()));
    map.insert("key_expr".to_string(), json!(sample.key_expr.as_str()));
    map.insert(
        "payload".to_string(),
        json!(String::from_utf8_lossy(&sample.payload)),
    );
    map.insert("encoding".to_string(), json!(sample.encoding.as_str()));
    if let Some(time) = format_time(sample.timestamp) {
        map.insert("time".to_string(), json!(time));
    }
    if let Some(source) = sample.source {
        map.insert("source".to_string(), json!(source.to_string()));
    }
    if let Some(attachment) = &sample.attachment {
        map.insert("attachment".to_string(), attachment_json(attachment));
    }
    Value::Object(map)
}

fn reply_json(reply: &Reply) -> Value {
    let mut map = Map::new();
    map.insert("replier".to_string(), json!(reply.replier().to_string()));
    match (reply.sample(), reply.error()) {
        (Some(sample), _) => {
            map.insert("ok".to_string(), sample_json(sample));
        }
        (None, Some(error)) => {
            map.insert(
                "err".to_string(),
                json!({
                    "payload": String::from_utf8_lossy(&error.payload),
                    "encoding": error.encoding.as_str(),
                }),
            );
        }
        (None, None) => {}
    }
    Value::Object(map)
}

/// Undecodable attachments render as `{"corrupt": "<reason>"}` instead of failing the line.
fn attachment_json(attachment: &keyplane::api::Attachment) -> Value {
    match attachment.to_pairs() {
        Ok(pairs) => Value::Array(
            pairs
                .iter()
                .map(|(key, value)| {
                    json!({
                        "key": String::from_utf8_lossy(key),
                        "value": String::from_utf8_lossy(value),
                    })
                })
                .collect(),
        ),
        Err(err) => json!({ "corrupt": error_message(&err) }),
    }
}

#[derive(Copy, Clone, Debug)]
enum AnsiColor {
    Red,
    Yellow,
}

fn colorize_label(label: &str, enabled: bool, color: AnsiColor) -> String {
    if !enabled {
        return label.to_string();
    }
    let code = match color {
        AnsiColor::Red => "31",
        AnsiColor::Yellow => "33",
    };
    format!("\u{1b}[{code}m{label}\u{1b}[0m")
}

fn emit_error(err: &Error, color_mode: ColorMode) {
    let is_tty = io::stderr().is_terminal();
    if is_tty {
        eprintln!("{}", error_text(err, color_mode.use_color(is_tty)));
        return;
    }

    let json = serde_json::to_string(&error_json(err)).unwrap_or_else(|_| {
        "{\"error\":{\"kind\":\"Internal\",\"message\":\"json encode failed\"}}".to_string()
    });
    eprintln!("{json}");
}

fn error_message(err: &Error) -> String {
    if let Some(message) = err.message() {
        return message.to_string();
    }
    match err.kind() {
        ErrorKind::Internal => "internal error",
        ErrorKind::Usage => "usage error",
        ErrorKind::InvalidExpression => "invalid key expression",
        ErrorKind::UnknownId => "unknown id",
        ErrorKind::StaleHandle => "stale handle",
        ErrorKind::Connection => "connection failed",
        ErrorKind::Transport => "transport failure",
        ErrorKind::CorruptAttachment => "corrupt attachment",
        ErrorKind::AttachmentMismatch => "unexpected attachment content",
        ErrorKind::ChannelFull => "channel is full",
        ErrorKind::ChannelClosed => "channel is closed",
    }
    .to_string()
}

fn error_causes(err: &Error) -> Vec<String> {
    let mut causes = Vec::new();
    let mut cur = err.source();
    while let Some(source) = cur {
        causes.push(source.to_string());
        cur = source.source();
    }
    causes
}

fn error_json(err: &Error) -> Value {
    let mut inner = Map::new();
    inner.insert("kind".to_string(), json!(format!("{:?}", err.kind())));
    inner.insert("message".to_string(), json!(error_message(err)));
    if let Some(hint) = err.hint() {
        inner.insert("hint".to_string(), json!(hint));
    }
    if let Some(key_expr) = err.key_expr() {
        inner.insert("key_expr".to_string(), json!(key_expr));
    }
    if let Some(id) = err.id() {
        inner.insert("id".to_string(), json!(id));
    }
    let causes = error_causes(err);
    if !causes.is_empty() {
        inner.insert("causes".to_string(), json!(causes));
    }

    let mut outer = Map::new();
    outer.insert("error".to_string(), Value::Object(inner));
    Value::Object(outer)
}

fn error_text(err: &Error, use_color: bool) -> String {
    let mut lines = vec![format!(
        "{} {}",
        colorize_label("error:", use_color, AnsiColor::Red),
        error_message(err)
    )];
    if let Some(key_expr) = err.key_expr() {
        lines.push(format!("  key expression: {key_expr}"));
    }
    if let Some(hint) = err.hint() {
        lines.push(format!(
            "{} {hint}",
            colorize_label("hint:", use_color, AnsiColor::Yellow)
        ));
    }
    for cause in error_causes(err) {
        lines.push(format!("  caused by: {cause}"));
    }
    lines.join("\n")
}

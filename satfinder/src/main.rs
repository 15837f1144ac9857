//! satfinder: dish-alignment signal monitor for SAT>IP servers.
//!
//! Opens one tuner session per requested transponder and renders live
//! signal bars while the dish is being aligned.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use log::{info, warn};

mod descriptor;
mod display;
mod error;
mod logging;
mod tuner;

use display::SignalDisplay;
use satip_protocol::{TuneRequest, TunerEndpoint, DEFAULT_RTSP_PORT};
use tuner::pool::PoolConfig;
use tuner::SessionPool;

const DESCRIPTOR_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// satfinder - dish-alignment signal monitor for SAT>IP servers
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// URL of the server description document
    /// (e.g. http://192.168.1.50:8080/desc.xml)
    #[arg(short = 's', long)]
    server_descriptor_url: Option<String>,

    /// Tune spec `frequency,polarisation,system,symbol_rate,fec[,name]`,
    /// e.g. `10817.5,v,dvbs2,23000,34,BBC1HD`; repeatable
    #[arg(short = 't', long = "tune")]
    tunes: Vec<String>,

    /// RTSP control port on the server
    #[arg(long, default_value = "554")]
    rtsp_port: u16,

    /// First local UDP port for RTP; each session claims the next pair
    #[arg(long, default_value = "57000")]
    base_rtp_port: u16,

    /// Display refresh interval in milliseconds
    #[arg(long, default_value = "1000")]
    refresh_ms: u64,

    /// Cap on usable tuners, overriding the server-advertised count
    #[arg(long)]
    max_tuners: Option<usize>,

    /// Configuration file path
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Directory where log files are stored
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    /// Number of days to keep log files
    #[arg(long, default_value = "7")]
    log_retention_days: u64,
}

/// Configuration file format.
#[derive(Debug, serde::Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    server: ServerSection,
    #[serde(default)]
    timeouts: TimeoutsSection,
    #[serde(default)]
    logging: LoggingSection,
    #[serde(default)]
    display: DisplaySection,
    /// Structured tune requests, used when no `--tune` is given.
    #[serde(default)]
    tunes: Vec<TuneRequest>,
}

#[derive(Debug, serde::Deserialize, Default)]
struct ServerSection {
    descriptor_url: Option<String>,
    rtsp_port: Option<u16>,
    base_rtp_port: Option<u16>,
    max_tuners: Option<usize>,
}

#[derive(Debug, serde::Deserialize, Default)]
struct TimeoutsSection {
    connect_secs: Option<u64>,
    reply_secs: Option<u64>,
    keepalive_margin_secs: Option<u64>,
    keepalive_failure_limit: Option<u32>,
    reconnect_limit: Option<u32>,
    status_idle_secs: Option<u64>,
    staleness_secs: Option<u64>,
    shutdown_secs: Option<u64>,
}

#[derive(Debug, serde::Deserialize, Default)]
struct LoggingSection {
    log_dir: Option<String>,
    retention_days: Option<u64>,
    level: Option<String>,
}

#[derive(Debug, serde::Deserialize, Default)]
struct DisplaySection {
    refresh_ms: Option<u64>,
}

fn load_config(path: &PathBuf) -> Result<ConfigFile, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: ConfigFile = toml::from_str(&contents)?;
    Ok(config)
}

fn pool_config(timeouts: &TimeoutsSection) -> PoolConfig {
    let defaults = PoolConfig::default();
    let mut session = defaults.session.clone();
    if let Some(secs) = timeouts.connect_secs {
        session.connect_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = timeouts.reply_secs {
        session.reply_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = timeouts.keepalive_margin_secs {
        session.keepalive_margin = Duration::from_secs(secs);
    }
    if let Some(limit) = timeouts.keepalive_failure_limit {
        session.keepalive_failure_limit = limit;
    }
    if let Some(limit) = timeouts.reconnect_limit {
        session.reconnect_limit = limit;
    }
    if let Some(secs) = timeouts.status_idle_secs {
        session.status_idle_timeout = Duration::from_secs(secs);
    }

    PoolConfig {
        session,
        shutdown_timeout: timeouts
            .shutdown_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.shutdown_timeout),
        staleness_threshold: timeouts
            .staleness_secs
            .map(Duration::from_secs)
            .unwrap_or(defaults.staleness_threshold),
    }
}

/// Usable tuner count: the server-advertised DVB-S count capped by the
/// configured override. When the descriptor carries no usable capability
/// entry the override alone states the count.
fn resolve_tuner_ceiling(
    override_cap: Option<usize>,
    advertised: usize,
) -> Result<usize, &'static str> {
    match (advertised, override_cap) {
        (0, Some(cap)) => Ok(cap),
        (0, None) => {
            Err("server advertises no satellite tuners; set --max-tuners to state the count")
        }
        (advertised, Some(cap)) => Ok(cap.min(advertised)),
        (advertised, None) => Ok(advertised),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Load config file: explicit path > auto-detect > default
    let config_path = args.config.clone().or_else(|| {
        let default_path = PathBuf::from("satfinder.toml");
        if default_path.exists() {
            Some(default_path)
        } else {
            None
        }
    });
    let file_config = if let Some(config_path) = &config_path {
        match load_config(config_path) {
            Ok(c) => {
                eprintln!("Loaded config from: {}", config_path.display());
                c
            }
            Err(e) => {
                eprintln!("Failed to load config file: {}", e);
                return Err(e);
            }
        }
    } else {
        ConfigFile::default()
    };

    // Merge logging configs (command line takes precedence)
    let log_dir = if args.log_dir.to_string_lossy() != "logs" {
        args.log_dir.clone()
    } else {
        PathBuf::from(file_config.logging.log_dir.as_deref().unwrap_or("logs"))
    };
    let log_retention_days = if args.log_retention_days != 7 {
        args.log_retention_days
    } else {
        file_config.logging.retention_days.unwrap_or(7)
    };
    let log_level = file_config.logging.level.as_deref();
    logging::init_logging(&log_dir, log_retention_days, args.verbose, log_level)?;

    // Server endpoint settings (command line takes precedence)
    let descriptor_url = args
        .server_descriptor_url
        .or(file_config.server.descriptor_url)
        .ok_or("no server descriptor URL given (use -s or [server].descriptor_url)")?;
    let rtsp_port = if args.rtsp_port != DEFAULT_RTSP_PORT {
        args.rtsp_port
    } else {
        file_config.server.rtsp_port.unwrap_or(DEFAULT_RTSP_PORT)
    };
    let base_rtp_port = if args.base_rtp_port != 57000 {
        args.base_rtp_port
    } else {
        file_config.server.base_rtp_port.unwrap_or(57000)
    };
    let refresh_ms = if args.refresh_ms != 1000 {
        args.refresh_ms
    } else {
        file_config.display.refresh_ms.unwrap_or(1000)
    };

    // Tune requests: CLI specs win over the config file's structured list.
    let requests: Vec<TuneRequest> = if args.tunes.is_empty() {
        file_config.tunes.clone()
    } else {
        args.tunes
            .iter()
            .map(|spec| spec.parse())
            .collect::<Result<_, _>>()?
    };

    let server = descriptor::fetch(&descriptor_url, DESCRIPTOR_FETCH_TIMEOUT).await?;
    let override_cap = args.max_tuners.or(file_config.server.max_tuners);
    let available_tuners = resolve_tuner_ceiling(override_cap, server.satellite_tuners())?;

    let endpoint = TunerEndpoint::new(server.host.clone(), rtsp_port, base_rtp_port);

    info!("satfinder starting...");
    info!("  Server: {} ({})", endpoint.base_uri(), server.friendly_name.as_deref().unwrap_or("unnamed"));
    info!("  Satellite tuners: {}", available_tuners);
    info!("  Tune requests: {}", requests.len());
    for request in &requests {
        info!("    {}", request.display_name());
    }

    let pool = SessionPool::start(
        endpoint,
        requests,
        available_tuners,
        pool_config(&file_config.timeouts),
    )
    .await?;

    let display = SignalDisplay::new(&pool.labels());
    let refresh = Duration::from_millis(refresh_ms.max(50));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received, shutting down");
                break;
            }
            _ = tokio::time::sleep(refresh) => {
                display.render(&pool.snapshot_all());
            }
        }
    }

    // Leave the last readings on screen, then tear the sessions down.
    display.render(&pool.snapshot_all());
    display.finish();

    let dropped: u64 = pool
        .snapshot_all()
        .iter()
        .map(|report| report.dropped_records)
        .sum();
    if dropped > 0 {
        warn!("{} malformed status records were dropped during this run", dropped);
    }

    pool.shutdown().await;
    info!("satfinder stopped");
    Ok(())
}

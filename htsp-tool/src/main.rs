//! htsp-tool: query a Tvheadend server over HTSP from the command line.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{Local, NaiveDateTime, TimeZone};
use clap::{Parser, Subcommand};
use serde::Serialize;

use htsp_client::config::load_config;
use htsp_client::{ConnectionConfig, HtspData, Recording, TimerRequest};

mod logging;

/// htsp-tool - HTSP data client
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server host
    #[arg(long)]
    host: Option<String>,

    /// HTSP port
    #[arg(short, long)]
    port: Option<u16>,

    /// Username for authentication
    #[arg(short, long)]
    user: Option<String>,

    /// Password for authentication
    #[arg(long)]
    password: Option<String>,

    /// Seconds to wait for the initial sync
    #[arg(long, default_value = "10")]
    sync_timeout: u64,

    /// Configuration file path
    #[arg(short = 'f', long)]
    config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Directory where log files are stored
    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    /// Number of days to keep log files
    #[arg(long, default_value = "7")]
    log_retention_days: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List channels
    Channels {
        /// Only radio channels
        #[arg(long, conflicts_with = "tv")]
        radio: bool,
        /// Only TV channels
        #[arg(long)]
        tv: bool,
        /// Only members of this tag
        #[arg(long)]
        tag: Option<u32>,
    },
    /// List channel tags
    Tags,
    /// List finished recordings
    Recordings,
    /// List scheduled and running recordings
    Timers,
    /// Show the programme guide of a channel
    Epg {
        channel: u32,
        /// Hours ahead to show
        #[arg(long, default_value = "6")]
        hours: i64,
    },
    /// Show recording storage
    Disk,
    /// Show the server clock
    Time,
    /// Schedule a recording
    AddTimer {
        #[arg(long)]
        channel: u32,
        #[arg(long)]
        title: String,
        /// Local start time, "YYYY-MM-DD HH:MM"
        #[arg(long, value_parser = parse_local_time)]
        start: i64,
        /// Local stop time, "YYYY-MM-DD HH:MM"
        #[arg(long, value_parser = parse_local_time)]
        stop: i64,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// Cancel a scheduled recording
    DeleteTimer { id: u32 },
    /// Delete a finished recording
    DeleteRecording { id: u32 },
    /// Change the title of a recording
    RenameRecording { id: u32, title: String },
}

/// Configuration file format.
#[derive(Debug, serde::Deserialize, Default)]
struct ConfigFile {
    #[serde(default)]
    server: ServerSection,
    #[serde(default)]
    logging: LoggingSection,
}

#[derive(Debug, serde::Deserialize, Default)]
struct ServerSection {
    host: Option<String>,
    htsp_port: Option<u16>,
    http_port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    client_name: Option<String>,
    connect_timeout_ms: Option<u64>,
    response_timeout_ms: Option<u64>,
}

#[derive(Debug, serde::Deserialize, Default)]
struct LoggingSection {
    log_dir: Option<String>,
    retention_days: Option<u64>,
    level: Option<String>,
}

fn load_config_file(path: &Path) -> Result<ConfigFile, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    let config: ConfigFile = toml::from_str(&contents)?;
    Ok(config)
}

fn parse_local_time(s: &str) -> Result<i64, String> {
    let naive = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M")
        .map_err(|e| format!("expected \"YYYY-MM-DD HH:MM\": {}", e))?;
    Local
        .from_local_datetime(&naive)
        .single()
        .map(|t| t.timestamp())
        .ok_or_else(|| format!("ambiguous local time: {}", s))
}

fn format_time(secs: i64) -> String {
    match Local.timestamp_opt(secs, 0).single() {
        Some(t) => t.format("%Y-%m-%d %H:%M").to_string(),
        None => secs.to_string(),
    }
}

/// Layer the sources: INI/environment, then the TOML file, then arguments.
fn merge_connection_config(
    base: ConnectionConfig,
    file: &ServerSection,
    args: &Args,
) -> ConnectionConfig {
    let mut config = base;
    if let Some(host) = &file.host {
        config.host = host.clone();
    }
    if let Some(port) = file.htsp_port {
        config.htsp_port = port;
    }
    if let Some(port) = file.http_port {
        config.http_port = port;
    }
    if let Some(username) = &file.username {
        config.username = username.clone();
    }
    if let Some(password) = &file.password {
        config.password = password.clone();
    }
    if let Some(name) = &file.client_name {
        config.client_name = name.clone();
    }
    if let Some(ms) = file.connect_timeout_ms {
        config.connect_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = file.response_timeout_ms {
        config.response_timeout = Duration::from_millis(ms);
    }

    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    if let Some(port) = args.port {
        config.htsp_port = port;
    }
    if let Some(user) = &args.user {
        config.username = user.clone();
    }
    if let Some(password) = &args.password {
        config.password = password.clone();
    }
    config
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_dvr_entries(data: &HtspData, entries: &[Recording], with_url: bool) {
    for entry in entries {
        let channel = data
            .channel_name(entry.channel)
            .unwrap_or_else(|| format!("#{}", entry.channel));
        println!(
            "{:>6}  {}  {:>4} min  {:<10}  {:<16}  {}",
            entry.id,
            format_time(entry.start),
            entry.duration() / 60,
            format!("{:?}", entry.state),
            channel,
            entry.title
        );
        if with_url {
            println!("        {}", data.recording_url(entry));
        }
    }
}

fn run(data: &HtspData, command: Command, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Channels { radio, tv, tag } => {
            let filter = match (radio, tv) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            };
            let mut channels = match tag {
                Some(tag) => data.channels_in_tag(tag),
                None => data.channels(None)?,
            };
            if let Some(radio) = filter {
                channels.retain(|c| c.radio == radio);
            }
            if json {
                return print_json(&channels);
            }
            for c in &channels {
                let kind = if c.radio { "radio" } else { "tv" };
                println!("{:>6}  {:>5}  {:<5}  {}", c.id, c.number, kind, c.name);
            }
        }
        Command::Tags => {
            let tags = data.tags();
            if json {
                return print_json(&tags);
            }
            for t in &tags {
                println!("{:>6}  {:<24}  {} channels", t.id, t.name, t.members.len());
            }
        }
        Command::Recordings => {
            let recordings = data.recordings();
            if json {
                return print_json(&recordings);
            }
            print_dvr_entries(data, &recordings, true);
        }
        Command::Timers => {
            let timers = data.timers();
            if json {
                return print_json(&timers);
            }
            print_dvr_entries(data, &timers, false);
        }
        Command::Epg { channel, hours } => {
            let now = Local::now().timestamp();
            let events = data.epg(channel, now, now + hours * 3600)?;
            if json {
                return print_json(&events);
            }
            for e in &events {
                println!(
                    "{}  {}  {}",
                    format_time(e.start),
                    format_time(e.stop),
                    e.title
                );
            }
        }
        Command::Disk => {
            let space = data.drive_space()?;
            if json {
                return print_json(&space);
            }
            println!(
                "total {} MiB, used {} MiB",
                space.total / 1024,
                space.used / 1024
            );
        }
        Command::Time => {
            let time = data.server_time()?;
            if json {
                return print_json(&time);
            }
            println!("{} (gmt offset {})", format_time(time.local_time), time.gmt_offset);
        }
        Command::AddTimer {
            channel,
            title,
            start,
            stop,
            description,
        } => {
            if stop <= start {
                return Err("stop must be after start".into());
            }
            let id = data.add_timer(&TimerRequest {
                channel_id: channel,
                title,
                description,
                start,
                stop,
                ..Default::default()
            })?;
            match id {
                Some(id) => println!("scheduled as {}", id),
                None => println!("scheduled"),
            }
        }
        Command::DeleteTimer { id } => data.delete_timer(id)?,
        Command::DeleteRecording { id } => data.delete_recording(id)?,
        Command::RenameRecording { id, title } => data.rename_recording(id, &title)?,
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Config file: explicit path > auto-detect > default
    let config_path = args.config.clone().or_else(|| {
        let default_path = PathBuf::from("htsp-tool.toml");
        default_path.exists().then_some(default_path)
    });
    let file_config = match &config_path {
        Some(path) => load_config_file(path).map_err(|e| {
            eprintln!("Failed to load config file {}: {}", path.display(), e);
            e
        })?,
        None => ConfigFile::default(),
    };

    // Command line takes precedence over the file.
    let log_dir = if args.log_dir != Path::new("logs") {
        args.log_dir.clone()
    } else {
        PathBuf::from(file_config.logging.log_dir.as_deref().unwrap_or("logs"))
    };
    let retention_days = if args.log_retention_days != 7 {
        args.log_retention_days
    } else {
        file_config.logging.retention_days.unwrap_or(7)
    };
    logging::init_logging(
        &log_dir,
        retention_days,
        args.verbose,
        file_config.logging.level.as_deref(),
    )?;

    let config = merge_connection_config(load_config(), &file_config.server, &args);
    log::info!("Connecting to {}", config.server_addr());

    let data = HtspData::new();
    data.try_open(config, Duration::from_secs(args.sync_timeout))?;
    if !data.is_synced() {
        log::warn!("Initial sync incomplete, listings may be partial");
    }

    let result = run(&data, args.command, args.json);
    data.close();
    result
}

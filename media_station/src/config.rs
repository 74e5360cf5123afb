use std::{fs, path::PathBuf, time::Duration};

use anyhow::{Context, Result};
use clap::Parser;
use serde::Deserialize;

/// Command line options for the service.
#[derive(Parser, Debug, Default)]
#[command(author, version, about)]
pub struct Cli {
    /// Override bind address (host:port).
    #[arg(long)]
    pub bind: Option<String>,
    /// Override server port.
    #[arg(long)]
    pub port: Option<u16>,
    /// Enable or disable logging (true/false).
    #[arg(long)]
    pub logging: Option<bool>,
    /// Path to configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,
}

/// Runtime configuration resolved once at startup from CLI, env, file and
/// defaults. Components receive it explicitly and never re-read the
/// environment.
#[derive(Clone, Debug)]
pub struct Config {
    /// Address to bind the HTTP server to.
    pub bind: String,
    pub logging_enabled: bool,
    /// Where uploads waiting for conversion are written.
    pub input_dir: PathBuf,
    /// Where converted artifacts are written.
    pub output_dir: PathBuf,
    /// Backing directory of the file station.
    pub station_dir: PathBuf,
    /// Upload limit for `/convert`, in bytes.
    pub max_file_size: u64,
    /// Upload limit for the file station, in bytes.
    pub station_max_file_size: u64,
    pub janitor: JanitorConfig,
    pub transcoder: TranscoderConfig,
}

#[derive(Clone, Debug)]
pub struct JanitorConfig {
    /// Age after which a file becomes eligible for deletion.
    pub retention: Duration,
    /// Pause between scans. Deletion happens at most `retention +
    /// scan_interval` after the last modification.
    pub scan_interval: Duration,
    /// Watched in addition to the input and output directories.
    pub extra_dirs: Vec<PathBuf>,
}

#[derive(Clone, Debug)]
pub struct TranscoderConfig {
    pub program: PathBuf,
    pub timeout: Duration,
    /// Accept `audio/*` uploads as well as `video/*`.
    pub accept_audio: bool,
}

impl Config {
    /// Defaults rooted at `data_dir`, used by `load` and handy for tests.
    pub fn with_data_dir(data_dir: PathBuf) -> Self {
        Self {
            bind: format!("127.0.0.1:{}", default_port()),
            logging_enabled: default_logging(),
            input_dir: data_dir.join("uploads"),
            output_dir: data_dir.join("outputs"),
            station_dir: data_dir.join("station"),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
            station_max_file_size: DEFAULT_STATION_MAX_FILE_SIZE,
            janitor: JanitorConfig {
                retention: Duration::from_secs(DEFAULT_RETENTION_SECS),
                scan_interval: Duration::from_secs(DEFAULT_SCAN_INTERVAL_SECS),
                extra_dirs: Vec::new(),
            },
            transcoder: TranscoderConfig {
                program: PathBuf::from("ffmpeg"),
                timeout: Duration::from_secs(DEFAULT_TRANSCODE_TIMEOUT_SECS),
                accept_audio: false,
            },
        }
    }

    /// Replace every configured directory with its canonical path. The
    /// storage directories must exist; janitor extras that do not are kept
    /// as given and skipped by the sweep.
    pub fn canonicalize_dirs(&mut self) -> Result<()> {
        for dir in [
            &mut self.input_dir,
            &mut self.output_dir,
            &mut self.station_dir,
        ] {
            *dir = fs::canonicalize(&*dir)
                .with_context(|| format!("resolving {}", dir.display()))?;
        }
        for dir in &mut self.janitor.extra_dirs {
            if let Ok(canonical) = fs::canonicalize(&*dir) {
                *dir = canonical;
            }
        }
        Ok(())
    }

    /// Directories swept by the janitor.
    pub fn watched_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = vec![self.input_dir.clone(), self.output_dir.clone()];
        for dir in &self.janitor.extra_dirs {
            if !dirs.contains(dir) {
                dirs.push(dir.clone());
            }
        }
        dirs
    }
}

const DEFAULT_MAX_FILE_SIZE: u64 = 20 * 1024 * 1024;
const DEFAULT_STATION_MAX_FILE_SIZE: u64 = 2000 * 1024 * 1024;
const DEFAULT_RETENTION_SECS: u64 = 3600;
const DEFAULT_SCAN_INTERVAL_SECS: u64 = 600;
const DEFAULT_TRANSCODE_TIMEOUT_SECS: u64 = 300;

#[derive(Deserialize, Default)]
struct FileConfig {
    #[serde(default)]
    server: FileServer,
    #[serde(default)]
    logging: FileLogging,
    #[serde(default)]
    storage: FileStorage,
    #[serde(default)]
    limits: FileLimits,
    #[serde(default)]
    janitor: FileJanitor,
    #[serde(default)]
    transcoder: FileTranscoder,
}

#[derive(Deserialize)]
struct FileServer {
    #[serde(default = "default_port")]
    port: u16,
}

#[derive(Deserialize)]
struct FileLogging {
    #[serde(default = "default_logging")]
    enabled: bool,
}

#[derive(Deserialize, Default)]
struct FileStorage {
    data_dir: Option<PathBuf>,
    input_dir: Option<PathBuf>,
    output_dir: Option<PathBuf>,
    station_dir: Option<PathBuf>,
}

#[derive(Deserialize, Default)]
struct FileLimits {
    max_file_size: Option<u64>,
    station_max_file_size: Option<u64>,
}

#[derive(Deserialize, Default)]
struct FileJanitor {
    retention_secs: Option<u64>,
    scan_interval_secs: Option<u64>,
    #[serde(default)]
    extra_dirs: Vec<PathBuf>,
}

#[derive(Deserialize, Default)]
struct FileTranscoder {
    program: Option<PathBuf>,
    timeout_secs: Option<u64>,
    accept_audio: Option<bool>,
}

fn default_port() -> u16 {
    5000
}

fn default_logging() -> bool {
    true
}

impl Default for FileServer {
    fn default() -> Self {
        Self {
            port: default_port(),
        }
    }
}

impl Default for FileLogging {
    fn default() -> Self {
        Self {
            enabled: default_logging(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

/// Parse a byte count the way deployment files tend to write it, e.g.
/// `20971520  # 20MB`.
pub fn parse_size(raw: &str) -> Option<u64> {
    raw.split('#').next()?.trim().parse().ok()
}

impl Config {
    /// Resolve configuration from CLI, environment variables, config file and defaults.
    pub fn load(cli: &Cli) -> Result<Self> {
        // config file path precedence: CLI -> ENV -> default
        let config_path = cli
            .config
            .clone()
            .or_else(|| std::env::var("MEDIA_STATION_CONFIG").ok().map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("config/media_station.toml"));

        let file_cfg = match fs::read(&config_path) {
            Ok(bytes) => {
                let contents = String::from_utf8_lossy(&bytes);
                toml::from_str::<FileConfig>(&contents)
                    .with_context(|| format!("invalid config file {}", config_path.display()))?
            }
            Err(_) => FileConfig::default(),
        };

        let data_dir = std::env::var("DATA_DIR")
            .map(PathBuf::from)
            .ok()
            .or(file_cfg.storage.data_dir)
            .unwrap_or_else(|| PathBuf::from("./data"));
        let mut cfg = Self::with_data_dir(data_dir);

        // file values
        let mut port = file_cfg.server.port;
        cfg.logging_enabled = file_cfg.logging.enabled;
        if let Some(d) = file_cfg.storage.input_dir {
            cfg.input_dir = d;
        }
        if let Some(d) = file_cfg.storage.output_dir {
            cfg.output_dir = d;
        }
        if let Some(d) = file_cfg.storage.station_dir {
            cfg.station_dir = d;
        }
        if let Some(n) = file_cfg.limits.max_file_size {
            cfg.max_file_size = n;
        }
        if let Some(n) = file_cfg.limits.station_max_file_size {
            cfg.station_max_file_size = n;
        }
        if let Some(s) = file_cfg.janitor.retention_secs {
            cfg.janitor.retention = Duration::from_secs(s);
        }
        if let Some(s) = file_cfg.janitor.scan_interval_secs {
            cfg.janitor.scan_interval = Duration::from_secs(s);
        }
        cfg.janitor.extra_dirs = file_cfg.janitor.extra_dirs;
        if let Some(p) = file_cfg.transcoder.program {
            cfg.transcoder.program = p;
        }
        if let Some(s) = file_cfg.transcoder.timeout_secs {
            cfg.transcoder.timeout = Duration::from_secs(s);
        }
        if let Some(a) = file_cfg.transcoder.accept_audio {
            cfg.transcoder.accept_audio = a;
        }

        // environment overrides
        if let Some(p) = env_parse::<u16>("MEDIA_STATION_PORT") {
            port = p;
        }
        if let Some(l) = env_parse::<bool>("MEDIA_STATION_LOGGING") {
            cfg.logging_enabled = l;
        }
        if let Ok(d) = std::env::var("UPLOAD_FOLDER") {
            cfg.input_dir = PathBuf::from(d);
        }
        if let Ok(d) = std::env::var("OUTPUT_FOLDER") {
            cfg.output_dir = PathBuf::from(d);
        }
        if let Ok(d) = std::env::var("STATION_FOLDER") {
            cfg.station_dir = PathBuf::from(d);
        }
        if let Ok(raw) = std::env::var("MAX_FILE_SIZE") {
            // unparsable values fall back to the default
            cfg.max_file_size = parse_size(&raw).unwrap_or(DEFAULT_MAX_FILE_SIZE);
        }
        if let Some(s) = env_parse::<u64>("RETENTION_SECS") {
            cfg.janitor.retention = Duration::from_secs(s);
        }
        if let Some(s) = env_parse::<u64>("SCAN_INTERVAL_SECS") {
            cfg.janitor.scan_interval = Duration::from_secs(s);
        }
        if let Ok(p) = std::env::var("FFMPEG_PATH") {
            cfg.transcoder.program = PathBuf::from(p);
        }
        if let Some(s) = env_parse::<u64>("TRANSCODE_TIMEOUT_SECS") {
            cfg.transcoder.timeout = Duration::from_secs(s);
        }

        // CLI overrides
        if let Some(p) = cli.port {
            port = p;
        }
        if let Some(l) = cli.logging {
            cfg.logging_enabled = l;
        }

        // validate
        if !(1024..=65535).contains(&port) {
            anyhow::bail!("invalid_port");
        }
        if cfg.janitor.retention.is_zero() {
            anyhow::bail!("retention must be non-zero");
        }
        if cfg.janitor.scan_interval.is_zero() {
            anyhow::bail!("scan interval must be non-zero");
        }
        if cfg.transcoder.timeout.is_zero() {
            anyhow::bail!("transcode timeout must be non-zero");
        }

        // bind address precedence for host override
        cfg.bind = if let Some(b) = &cli.bind {
            b.clone()
        } else if let Ok(b) = std::env::var("BIND") {
            b
        } else {
            format!("127.0.0.1:{}", port)
        };

        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;

    const ENV_KEYS: &[&str] = &[
        "MEDIA_STATION_CONFIG",
        "MEDIA_STATION_PORT",
        "MEDIA_STATION_LOGGING",
        "BIND",
        "DATA_DIR",
        "UPLOAD_FOLDER",
        "OUTPUT_FOLDER",
        "STATION_FOLDER",
        "MAX_FILE_SIZE",
        "RETENTION_SECS",
        "SCAN_INTERVAL_SECS",
        "FFMPEG_PATH",
        "TRANSCODE_TIMEOUT_SECS",
    ];

    fn clear_env() {
        for key in ENV_KEYS {
            std::env::remove_var(key);
        }
    }

    fn load_from(contents: &str) -> Result<Config> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.toml");
        fs::write(&path, contents).unwrap();
        let cli = Cli {
            config: Some(path),
            ..Default::default()
        };
        Config::load(&cli)
    }

    #[test]
    #[serial]
    fn missing_keys_defaults() {
        clear_env();
        let cfg = load_from("").unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:5000");
        assert!(cfg.logging_enabled);
        assert_eq!(cfg.input_dir, PathBuf::from("./data/uploads"));
        assert_eq!(cfg.output_dir, PathBuf::from("./data/outputs"));
        assert_eq!(cfg.max_file_size, 20 * 1024 * 1024);
        assert_eq!(cfg.janitor.retention, Duration::from_secs(3600));
        assert_eq!(cfg.janitor.scan_interval, Duration::from_secs(600));
        assert_eq!(cfg.transcoder.program, PathBuf::from("ffmpeg"));
        assert!(!cfg.transcoder.accept_audio);
    }

    #[test]
    #[serial]
    fn file_values_used_when_no_overrides() {
        clear_env();
        let cfg = load_from(
            r#"
[server]
port = 4444
[logging]
enabled = false
[storage]
data_dir = "/srv/media"
output_dir = "/srv/out"
[limits]
max_file_size = 1024
[janitor]
retention_secs = 120
scan_interval_secs = 30
extra_dirs = ["/srv/media/station"]
[transcoder]
program = "/opt/ffmpeg/bin/ffmpeg"
timeout_secs = 10
accept_audio = true
"#,
        )
        .unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:4444");
        assert!(!cfg.logging_enabled);
        assert_eq!(cfg.input_dir, PathBuf::from("/srv/media/uploads"));
        assert_eq!(cfg.output_dir, PathBuf::from("/srv/out"));
        assert_eq!(cfg.max_file_size, 1024);
        assert_eq!(cfg.janitor.retention, Duration::from_secs(120));
        assert_eq!(cfg.janitor.scan_interval, Duration::from_secs(30));
        assert_eq!(cfg.transcoder.timeout, Duration::from_secs(10));
        assert!(cfg.transcoder.accept_audio);
        assert_eq!(
            cfg.watched_dirs(),
            vec![
                PathBuf::from("/srv/media/uploads"),
                PathBuf::from("/srv/out"),
                PathBuf::from("/srv/media/station"),
            ]
        );
    }

    #[test]
    #[serial]
    fn precedence_cli_env_file() {
        clear_env();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cfg.toml");
        fs::write(&path, "[server]\nport=1111\n[janitor]\nretention_secs=10\n").unwrap();
        std::env::set_var("MEDIA_STATION_PORT", "2222");
        std::env::set_var("RETENTION_SECS", "20");
        std::env::set_var("UPLOAD_FOLDER", "/tmp/in");
        let cli = Cli {
            config: Some(path),
            port: Some(3333),
            ..Default::default()
        };
        let cfg = Config::load(&cli).unwrap();
        assert_eq!(cfg.bind, "127.0.0.1:3333");
        assert_eq!(cfg.janitor.retention, Duration::from_secs(20));
        assert_eq!(cfg.input_dir, PathBuf::from("/tmp/in"));
        clear_env();
    }

    #[test]
    #[serial]
    fn max_file_size_env_strips_comment() {
        clear_env();
        std::env::set_var("MAX_FILE_SIZE", " 1048576 # 1MB ");
        assert_eq!(load_from("").unwrap().max_file_size, 1_048_576);
        std::env::set_var("MAX_FILE_SIZE", "twenty megs");
        assert_eq!(load_from("").unwrap().max_file_size, 20 * 1024 * 1024);
        clear_env();
    }

    #[test]
    #[serial]
    fn invalid_values_fail() {
        clear_env();
        assert!(load_from("[server]\nport=80\n").is_err());
        assert!(load_from("[janitor]\nretention_secs=0\n").is_err());
        assert!(load_from("[janitor]\nscan_interval_secs=0\n").is_err());
        assert!(load_from("[transcoder]\ntimeout_secs=0\n").is_err());
        assert!(load_from("[server\n").is_err());
    }

    #[test]
    fn canonical_dirs_dedup_watched_set() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = Config::with_data_dir(tmp.path().join("data"));
        for dir in [&cfg.input_dir, &cfg.output_dir, &cfg.station_dir] {
            fs::create_dir_all(dir).unwrap();
        }
        cfg.janitor.extra_dirs = vec![
            tmp.path().join("data/uploads/../uploads"),
            tmp.path().join("data/./station"),
            tmp.path().join("not-there"),
        ];
        cfg.canonicalize_dirs().unwrap();

        let station = fs::canonicalize(tmp.path().join("data/station")).unwrap();
        assert_eq!(
            cfg.watched_dirs(),
            [
                cfg.input_dir.clone(),
                cfg.output_dir.clone(),
                station.clone(),
                tmp.path().join("not-there"),
            ]
        );
        assert_eq!(cfg.station_dir, station);
    }

    #[test]
    fn canonicalize_requires_storage_dirs() {
        let tmp = tempfile::tempdir().unwrap();
        let mut cfg = Config::with_data_dir(tmp.path().join("missing"));
        assert!(cfg.canonicalize_dirs().is_err());
    }

    #[test]
    fn parse_size_handles_comments() {
        assert_eq!(parse_size("100"), Some(100));
        assert_eq!(parse_size("100#x"), Some(100));
        assert_eq!(parse_size("# only comment"), None);
        assert_eq!(parse_size("-5"), None);
    }
}

use std::path::PathBuf;

use clap::Parser;

/// Mount a remote HTTP directory listing as a read-only filesystem.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
#[clap(args_override_self(true))]
pub struct Cli {
    /// The URL of the remote directory (or of the file in single-file mode)
    pub url: String,
    /// Where to mount the filesystem
    pub mountpoint: PathBuf,

    /// Read extra options (one per line, "--name value" form) from this file
    #[clap(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// HTTP authentication username
    #[clap(short = 'u', long)]
    pub username: Option<String>,
    /// HTTP authentication password
    #[clap(short = 'p', long)]
    pub password: Option<String>,
    /// Proxy address for the HTTP client
    #[clap(short = 'P', long)]
    pub proxy: Option<String>,
    /// Username for the proxy
    #[clap(long)]
    pub proxy_username: Option<String>,
    /// Password for the proxy
    #[clap(long)]
    pub proxy_password: Option<String>,
    /// Certificate authority bundle for the proxy
    #[clap(long, value_name = "PATH")]
    pub proxy_cacert: Option<PathBuf>,
    /// Certificate authority bundle for the server
    #[clap(long, value_name = "PATH")]
    pub cacert: Option<PathBuf>,

    /// Enable the disk cache
    #[clap(long)]
    pub cache: bool,
    /// Cache root directory (default: "${XDG_CACHE_HOME}/httpdirfs")
    #[clap(long, value_name = "DIR")]
    pub cache_location: Option<PathBuf>,
    /// Download segment size, in MiB
    #[clap(long, value_name = "MiB", default_value_t = 8)]
    pub dl_seg_size: u64,
    /// Maximum number of download segments a file can have
    #[clap(long, value_name = "N", default_value_t = 128 * 1024)]
    pub max_seg_count: u32,
    /// Maximum number of network connections
    #[clap(long, value_name = "N", default_value_t = 10)]
    pub max_conns: usize,
    /// Override the user agent string
    #[clap(long, value_name = "STRING")]
    pub user_agent: Option<String>,
    /// Delay in seconds before retrying a temporarily failed HTTP request
    #[clap(long, value_name = "SEC", default_value_t = 5)]
    pub retry_wait: u64,
    /// Skip probing the server for HTTP range request support
    #[clap(long)]
    pub no_range_check: bool,
    /// Disable TLS certificate verification
    #[clap(long)]
    pub insecure_tls: bool,
    /// Present a single URL as a one-file directory
    #[clap(long)]
    pub single_file_mode: bool,

    /// Username for an Airsonic / Subsonic server
    #[clap(long)]
    pub sonic_username: Option<String>,
    /// Password for an Airsonic / Subsonic server
    #[clap(long)]
    pub sonic_password: Option<String>,
    /// Present the Subsonic server in Artist/Album/Song (ID3) layout
    #[clap(long)]
    pub sonic_id3: bool,
    /// Authenticate with the legacy hex-encoded password scheme
    #[clap(long)]
    pub sonic_insecure: bool,

    /// Mount options passed through to the FUSE layer
    #[clap(short = 'o', value_name = "OPT", action = clap::ArgAction::Append)]
    pub mount_options: Vec<String>,
    /// Enable debug output
    #[clap(short = 'd', long = "debug")]
    pub debug: bool,
    /// Stay in the foreground (the default; accepted for compatibility)
    #[clap(short = 'f')]
    pub foreground: bool,
    /// Single-threaded FUSE dispatch (the default; accepted for compatibility)
    #[clap(short = 's')]
    pub single_threaded: bool,
}

/// Collect `std::env::args` with the config file contents merged in. The
/// config file path comes from `--config` if present, otherwise the XDG
/// default. Config-file options are appended after the command line ones,
/// and later occurrences override earlier ones.
pub fn merged_args() -> Vec<String> {
    let cli_args: Vec<String> = std::env::args().collect();
    merge_config_args(cli_args)
}

fn merge_config_args(mut args: Vec<String>) -> Vec<String> {
    let config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(PathBuf::from)
        .or_else(crate::config::default_config_path);
    if let Some(path) = config_path {
        args.extend(crate::config::config_file_args(&path));
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::io::Write;

    #[test]
    fn parses_minimal_invocation() {
        let cli = Cli::parse_from(["httpdirfs", "http://example.com/", "/mnt/http"]);
        assert_eq!(cli.url, "http://example.com/");
        assert_eq!(cli.dl_seg_size, 8);
        assert_eq!(cli.max_seg_count, 128 * 1024);
        assert_eq!(cli.max_conns, 10);
        assert_eq!(cli.retry_wait, 5);
        assert!(!cli.cache);
    }

    #[test]
    fn later_occurrence_overrides_earlier() {
        let cli = Cli::parse_from([
            "httpdirfs",
            "--retry-wait",
            "5",
            "--retry-wait",
            "9",
            "http://example.com/",
            "/mnt/http",
        ]);
        assert_eq!(cli.retry_wait, 9);
    }

    #[test]
    fn repeated_mount_options_accumulate() {
        let cli = Cli::parse_from([
            "httpdirfs",
            "-o",
            "allow_other",
            "-o",
            "fsname=remote",
            "http://example.com/",
            "/mnt/http",
        ]);
        assert_eq!(cli.mount_options, vec!["allow_other", "fsname=remote"]);
    }

    #[test]
    fn config_file_merges_after_cli() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config");
        let mut f = std::fs::File::create(&path).expect("create");
        writeln!(f, "--cache").expect("write");
        drop(f);

        let merged = super::merge_config_args(vec![
            "httpdirfs".into(),
            "--config".into(),
            path.to_string_lossy().into_owned(),
            "http://example.com/".into(),
            "/mnt/http".into(),
        ]);
        let cli = Cli::parse_from(&merged);
        assert!(cli.cache);
    }
}

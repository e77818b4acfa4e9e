use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};

use crate::cli::Cli;

/// How the remote tree is enumerated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationMode {
    /// Scrape HTML index pages.
    Normal,
    /// Present a single URL as a one-file directory.
    Single,
    /// Enumerate through the Subsonic API.
    Sonic,
}

/// Runtime configuration assembled from the CLI (with the config file already
/// merged into the argument list).
#[derive(Debug, Clone)]
pub struct Config {
    pub mode: OperationMode,
    pub base_url: String,

    pub http_username: Option<String>,
    pub http_password: Option<String>,
    pub proxy: Option<String>,
    pub proxy_username: Option<String>,
    pub proxy_password: Option<String>,
    pub proxy_cafile: Option<PathBuf>,
    pub cafile: Option<PathBuf>,
    pub user_agent: String,
    pub max_conns: usize,
    pub retry_wait: Duration,
    pub no_range_check: bool,
    pub insecure_tls: bool,

    pub cache_enabled: bool,
    pub cache_dir: Option<PathBuf>,
    /// Download segment size in bytes.
    pub data_blksz: u64,
    /// Maximum number of segments a single file may have.
    pub max_segbc: u32,

    pub sonic_username: Option<String>,
    pub sonic_password: Option<String>,
    pub sonic_id3: bool,
    pub sonic_insecure: bool,
}

impl Config {
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let base_url = cli.url.trim_end_matches('/').to_string();
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            bail!("please supply a valid URL (http:// or https://)");
        }
        url::Url::parse(&base_url).with_context(|| format!("cannot parse URL {}", base_url))?;

        let mode = match (&cli.sonic_username, &cli.sonic_password) {
            (Some(_), Some(_)) => OperationMode::Sonic,
            (None, None) => {
                if cli.single_file_mode {
                    OperationMode::Single
                } else {
                    OperationMode::Normal
                }
            }
            _ => bail!(
                "you have to supply both --sonic-username and --sonic-password \
                 to activate Sonic mode"
            ),
        };

        if cli.dl_seg_size == 0 {
            bail!("--dl-seg-size must be at least 1 MiB");
        }
        if cli.max_seg_count == 0 {
            bail!("--max-seg-count must be positive");
        }

        Ok(Config {
            mode,
            base_url,
            http_username: cli.username.clone(),
            http_password: cli.password.clone(),
            proxy: cli.proxy.clone(),
            proxy_username: cli.proxy_username.clone(),
            proxy_password: cli.proxy_password.clone(),
            proxy_cafile: cli.proxy_cacert.clone(),
            cafile: cli.cacert.clone(),
            user_agent: cli
                .user_agent
                .clone()
                .unwrap_or_else(|| format!("HTTPDirFS-{}", env!("CARGO_PKG_VERSION"))),
            max_conns: cli.max_conns.max(1),
            retry_wait: Duration::from_secs(cli.retry_wait),
            no_range_check: cli.no_range_check,
            insecure_tls: cli.insecure_tls,
            cache_enabled: cli.cache,
            cache_dir: cli.cache_location.clone(),
            data_blksz: cli.dl_seg_size * 1024 * 1024,
            max_segbc: cli.max_seg_count,
            sonic_username: cli.sonic_username.clone(),
            sonic_password: cli.sonic_password.clone(),
            sonic_id3: cli.sonic_id3,
            sonic_insecure: cli.sonic_insecure,
        })
    }

    /// Root directory for the disk cache. An explicit `--cache-location` is
    /// used verbatim; otherwise one directory per base URL is kept under
    /// `${XDG_CACHE_HOME}/httpdirfs`.
    pub fn cache_root(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.cache_dir {
            return Ok(dir.clone());
        }
        let base = dirs::cache_dir().context("cannot determine the XDG cache directory")?;
        Ok(base.join("httpdirfs").join(url_to_dirname(&self.base_url)))
    }
}

/// Flatten a URL into a single path component usable as a directory name.
fn url_to_dirname(url: &str) -> String {
    url.replace("://", ".")
        .replace('/', "_")
        .replace(':', "_")
}

/// Default location of the config file:
/// `${XDG_CONFIG_HOME:-$HOME/.config}/httpdirfs/config`.
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("httpdirfs").join("config"))
}

/// Read extra arguments from a config file. Each option sits on its own
/// line in `--name value` form; the line is split on the first space. Lines
/// not starting with '-' are ignored.
pub fn config_file_args(path: &std::path::Path) -> Vec<String> {
    let mut out = Vec::new();
    let Ok(content) = std::fs::read_to_string(path) else {
        return out;
    };
    for line in content.lines() {
        let line = line.trim_end();
        if !line.starts_with('-') {
            continue;
        }
        match line.split_once(' ') {
            Some((opt, value)) => {
                out.push(opt.to_string());
                out.push(value.to_string());
            }
            None => out.push(line.to_string()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn config_file_lines_split_on_first_space() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("config");
        let mut f = std::fs::File::create(&path).expect("create");
        writeln!(f, "--cache").expect("write");
        writeln!(f, "--retry-wait 10").expect("write");
        writeln!(f, "# a comment").expect("write");
        writeln!(f, "--user-agent probe agent").expect("write");
        drop(f);

        let args = config_file_args(&path);
        assert_eq!(
            args,
            vec!["--cache", "--retry-wait", "10", "--user-agent", "probe agent"]
        );
    }

    #[test]
    fn missing_config_file_yields_no_args() {
        assert!(config_file_args(std::path::Path::new("/nonexistent/httpdirfs/config")).is_empty());
    }

    #[test]
    fn url_dirname_is_flat() {
        let name = url_to_dirname("https://host:8443/pub/data");
        assert!(!name.contains('/'));
        assert!(!name.contains(':'));
    }
}

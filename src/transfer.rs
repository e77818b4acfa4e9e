use std::sync::Once;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, UNIX_EPOCH};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, unbounded};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header;
use reqwest::redirect::Policy;

use crate::config::Config;
use crate::error::{TransferError, http_temp_failure};

/// Result of a single HEAD probe against a file link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatOutcome {
    /// HTTP 200 with a positive content length.
    Found { length: u64, mtime: i64 },
    /// Permanent failure, or a non-positive content length.
    Invalid,
    /// Temporary failure (429/520/524): probe again on the next pass.
    Retry,
}

/// A whole response body together with the server-reported mtime.
pub struct FetchedBody {
    pub data: Vec<u8>,
    pub mtime: i64,
}

struct StatJob {
    idx: usize,
    url: String,
}

/// The shared multi-transfer engine. One `reqwest` blocking client carries
/// the pooled DNS, TLS and TCP connection state for every transfer; a fixed
/// pool of worker threads serves the non-blocking stat probes.
pub struct Transfer {
    client: Client,
    http_username: Option<String>,
    http_password: Option<String>,
    retry_wait: Duration,
    no_range_check: bool,
    range_probe: Once,
    job_tx: Sender<StatJob>,
    res_rx: Receiver<(usize, StatOutcome)>,
    in_flight: AtomicUsize,
    workers: Vec<std::thread::JoinHandle<()>>,
}

impl Transfer {
    /// Build the shared client and spawn the stat worker pool. Failures here
    /// are fatal for the process: nothing works without the network stack.
    pub fn init(cfg: &Config) -> Result<Self> {
        let client = build_client(cfg)?;
        let (job_tx, job_rx) = unbounded::<StatJob>();
        let (res_tx, res_rx) = unbounded::<(usize, StatOutcome)>();

        let mut workers = Vec::with_capacity(cfg.max_conns);
        for worker_id in 0..cfg.max_conns {
            let job_rx: Receiver<StatJob> = job_rx.clone();
            let res_tx = res_tx.clone();
            let client = client.clone();
            let username = cfg.http_username.clone();
            let password = cfg.http_password.clone();
            let handle = std::thread::spawn(move || {
                while let Ok(job) = job_rx.recv() {
                    tracing::debug!("[stat] worker_id={} HEAD {}", worker_id, job.url);
                    let outcome = head_stat(&client, &job.url, &username, &password);
                    if res_tx.send((job.idx, outcome)).is_err() {
                        break;
                    }
                }
            });
            workers.push(handle);
        }

        Ok(Transfer {
            client,
            http_username: cfg.http_username.clone(),
            http_password: cfg.http_password.clone(),
            retry_wait: cfg.retry_wait,
            no_range_check: cfg.no_range_check,
            range_probe: Once::new(),
            job_tx,
            res_rx,
            in_flight: AtomicUsize::new(0),
            workers,
        })
    }

    fn request(&self, url: &str) -> RequestBuilder {
        let mut req = self.client.get(url);
        if let Some(user) = &self.http_username {
            req = req.basic_auth(user, self.http_password.as_deref());
        }
        req
    }

    /// Download a whole body, retrying temporary failures after `retry_wait`.
    pub fn get_full(&self, url: &str) -> Result<FetchedBody, TransferError> {
        loop {
            let resp = self.request(url).send().map_err(|e| TransferError::Network {
                url: url.to_string(),
                msg: e.to_string(),
            })?;
            let code = resp.status().as_u16();
            if http_temp_failure(code) {
                tracing::warn!("[transfer] URL: {}, HTTP {}, retrying later", url, code);
                std::thread::sleep(self.retry_wait);
                continue;
            }
            if !resp.status().is_success() {
                tracing::warn!("[transfer] cannot retrieve URL: {}, HTTP {}", url, code);
                return Err(TransferError::Status { url: url.to_string(), code });
            }
            let mtime = response_mtime(&resp);
            let data = resp
                .bytes()
                .map_err(|e| TransferError::Network { url: url.to_string(), msg: e.to_string() })?
                .to_vec();
            return Ok(FetchedBody { data, mtime });
        }
    }

    /// Download the half-open byte range `[start, end)`, retrying temporary
    /// failures. The first ranged fetch of the process probes the server for
    /// `Accept-Ranges: bytes` support unless disabled.
    pub fn get_range(&self, url: &str, start: u64, end: u64) -> Result<Vec<u8>, TransferError> {
        debug_assert!(end > start);
        loop {
            let resp = self
                .request(url)
                .header(header::RANGE, format!("bytes={}-{}", start, end - 1))
                .send()
                .map_err(|e| TransferError::Network {
                    url: url.to_string(),
                    msg: e.to_string(),
                })?;
            let code = resp.status().as_u16();
            if http_temp_failure(code) {
                tracing::warn!("[transfer] URL: {}, HTTP {}, retrying later", url, code);
                std::thread::sleep(self.retry_wait);
                continue;
            }
            if !resp.status().is_success() {
                tracing::warn!("[transfer] cannot retrieve URL: {}, HTTP {}", url, code);
                return Err(TransferError::Status { url: url.to_string(), code });
            }

            if !self.no_range_check {
                self.range_probe.call_once(|| {
                    let advertised = resp
                        .headers()
                        .get(header::ACCEPT_RANGES)
                        .and_then(|v| v.to_str().ok())
                        .map(|v| v.eq_ignore_ascii_case("bytes"))
                        .unwrap_or(false);
                    if code != 206 && !advertised {
                        // Without range support every read would re-download
                        // the whole file. Same hard stop as the original.
                        tracing::error!(
                            "[transfer] this web server does not support HTTP range requests"
                        );
                        eprintln!("This web server does not support HTTP range requests");
                        std::process::exit(1);
                    }
                });
            }

            let mut data = resp
                .bytes()
                .map_err(|e| TransferError::Network { url: url.to_string(), msg: e.to_string() })?
                .to_vec();
            if code == 200 {
                // The server ignored the range header and sent the whole
                // body: carve out the requested window.
                let lo = (start as usize).min(data.len());
                let hi = (end as usize).min(data.len());
                data = data[lo..hi].to_vec();
            } else if data.len() as u64 > end - start {
                data.truncate((end - start) as usize);
            }
            return Ok(data);
        }
    }

    /// Queue a HEAD probe; the outcome is collected with `stat_collect`.
    pub fn stat_submit(&self, idx: usize, url: String) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        self.job_tx
            .send(StatJob { idx, url })
            .expect("stat worker pool disconnected");
    }

    /// Collect `n` completed probe outcomes, blocking until they arrive.
    pub fn stat_collect(&self, n: usize) -> Vec<(usize, StatOutcome)> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            let res = self.res_rx.recv().expect("stat worker pool disconnected");
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            out.push(res);
        }
        out
    }

    /// Number of submitted probes not yet collected.
    pub fn pending(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }
}

impl Drop for Transfer {
    fn drop(&mut self) {
        // Closing the job channel lets the workers drain and exit.
        let (tx, _) = unbounded::<StatJob>();
        let _ = std::mem::replace(&mut self.job_tx, tx);
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn build_client(cfg: &Config) -> Result<Client> {
    let mut builder = Client::builder()
        .user_agent(cfg.user_agent.clone())
        .connect_timeout(Duration::from_secs(15))
        .redirect(Policy::limited(3))
        .pool_max_idle_per_host(cfg.max_conns)
        .tcp_keepalive(Duration::from_secs(60));

    if cfg.insecure_tls {
        builder = builder
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true);
    }
    for cafile in [&cfg.cafile, &cfg.proxy_cafile].into_iter().flatten() {
        let pem = std::fs::read(cafile)
            .with_context(|| format!("cannot read CA bundle {}", cafile.display()))?;
        let cert = reqwest::Certificate::from_pem(&pem)
            .with_context(|| format!("cannot parse CA bundle {}", cafile.display()))?;
        builder = builder.add_root_certificate(cert);
    }
    if let Some(proxy_url) = &cfg.proxy {
        let mut proxy = reqwest::Proxy::all(proxy_url)
            .with_context(|| format!("cannot parse proxy {}", proxy_url))?;
        if let (Some(user), Some(pass)) = (&cfg.proxy_username, &cfg.proxy_password) {
            proxy = proxy.basic_auth(user, pass);
        }
        builder = builder.proxy(proxy);
    }

    builder.build().context("cannot initialise the HTTP client")
}

fn head_stat(
    client: &Client,
    url: &str,
    username: &Option<String>,
    password: &Option<String>,
) -> StatOutcome {
    let mut req = client.head(url);
    if let Some(user) = username {
        req = req.basic_auth(user, password.as_deref());
    }
    let resp = match req.send() {
        Ok(resp) => resp,
        Err(e) => {
            tracing::warn!("[stat] {}: {}", url, e);
            return StatOutcome::Invalid;
        }
    };
    let code = resp.status().as_u16();
    if code == 200 {
        let length = resp
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        if length == 0 {
            return StatOutcome::Invalid;
        }
        StatOutcome::Found { length, mtime: response_mtime(&resp) }
    } else if http_temp_failure(code) {
        tracing::warn!("[stat] HTTP {}, retrying later: {}", code, url);
        StatOutcome::Retry
    } else {
        tracing::warn!("[stat] HTTP {}: {}", code, url);
        StatOutcome::Invalid
    }
}

/// Parse `Last-Modified` into seconds since the epoch; 0 when absent.
fn response_mtime(resp: &Response) -> i64 {
    resp.headers()
        .get(header::LAST_MODIFIED)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| httpdate::parse_http_date(v).ok())
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

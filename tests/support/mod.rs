//! A minimal in-process HTTP server for exercising the crate end-to-end.
//! It speaks just enough HTTP/1.1 (keep-alive, HEAD, ranges) for the
//! blocking client, and counts every request so tests can assert on
//! traffic.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};

/// Fixed Last-Modified stamp served for every file.
pub const LAST_MODIFIED: &str = "Mon, 15 Jul 2024 10:00:00 GMT";

/// Epoch seconds corresponding to `LAST_MODIFIED`.
pub fn last_modified_epoch() -> i64 {
    httpdate::parse_http_date(LAST_MODIFIED)
        .expect("fixture date")
        .duration_since(std::time::UNIX_EPOCH)
        .expect("fixture date after the epoch")
        .as_secs() as i64
}

#[derive(Default)]
pub struct SiteSpec {
    /// Request path -> HTML body of the index page.
    pub dirs: Vec<(String, String)>,
    /// Request path -> file bytes.
    pub files: Vec<(String, Vec<u8>)>,
    /// Paths that answer 429 on their first hit, then behave.
    pub flaky: Vec<String>,
}

pub struct TestServer {
    pub base: String,
    hits: Arc<Mutex<HashMap<String, usize>>>,
}

impl TestServer {
    pub fn start(spec: SiteSpec) -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind test server");
        let addr = listener.local_addr().expect("test server addr");
        let hits: Arc<Mutex<HashMap<String, usize>>> = Arc::new(Mutex::new(HashMap::new()));
        let flaky = Arc::new(Mutex::new(spec.flaky.clone()));
        let spec = Arc::new(spec);

        let accept_hits = hits.clone();
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { continue };
                let spec = spec.clone();
                let hits = accept_hits.clone();
                let flaky = flaky.clone();
                std::thread::spawn(move || serve_connection(stream, &spec, &hits, &flaky));
            }
        });

        TestServer { base: format!("http://{}", addr), hits }
    }

    /// How many times `METHOD path` has been requested.
    pub fn hits(&self, method: &str, path: &str) -> usize {
        *self
            .hits
            .lock()
            .expect("hit counter")
            .get(&format!("{} {}", method, path))
            .unwrap_or(&0)
    }
}

fn serve_connection(
    stream: TcpStream,
    spec: &SiteSpec,
    hits: &Mutex<HashMap<String, usize>>,
    flaky: &Mutex<Vec<String>>,
) {
    let mut reader = BufReader::new(match stream.try_clone() {
        Ok(clone) => clone,
        Err(_) => return,
    });
    let mut stream = stream;

    loop {
        let mut request_line = String::new();
        if reader.read_line(&mut request_line).unwrap_or(0) == 0 {
            return;
        }
        let mut parts = request_line.split_whitespace();
        let (Some(method), Some(path)) = (parts.next(), parts.next()) else {
            return;
        };
        let method = method.to_string();
        // Match and count on the path alone; auth query strings vary.
        let path = path.split('?').next().unwrap_or(path).to_string();

        let mut range: Option<(u64, u64)> = None;
        loop {
            let mut header = String::new();
            if reader.read_line(&mut header).unwrap_or(0) == 0 {
                return;
            }
            let header = header.trim_end();
            if header.is_empty() {
                break;
            }
            if let Some(spec) = header
                .to_ascii_lowercase()
                .strip_prefix("range: bytes=")
                .map(str::to_string)
            {
                if let Some((a, b)) = spec.split_once('-') {
                    if let (Ok(a), Ok(b)) = (a.parse(), b.parse()) {
                        range = Some((a, b));
                    }
                }
            }
        }

        *hits
            .lock()
            .expect("hit counter")
            .entry(format!("{} {}", method, path))
            .or_insert(0) += 1;

        {
            let mut flaky = flaky.lock().expect("flaky list");
            if let Some(pos) = flaky.iter().position(|p| *p == path) {
                flaky.remove(pos);
                respond(&mut stream, "429 Too Many Requests", &[], b"", false);
                continue;
            }
        }

        if let Some((_, html)) = spec.dirs.iter().find(|(p, _)| *p == path) {
            respond(
                &mut stream,
                "200 OK",
                &[("Content-Type", "text/html".to_string())],
                html.as_bytes(),
                method == "HEAD",
            );
            continue;
        }

        if let Some((_, data)) = spec.files.iter().find(|(p, _)| *p == path) {
            let common = [
                ("Accept-Ranges", "bytes".to_string()),
                ("Last-Modified", LAST_MODIFIED.to_string()),
            ];
            match (method.as_str(), range) {
                ("HEAD", _) | ("GET", None) => {
                    respond(&mut stream, "200 OK", &common, data, method == "HEAD");
                }
                ("GET", Some((a, b))) => {
                    let lo = (a as usize).min(data.len());
                    let hi = ((b + 1) as usize).min(data.len());
                    let slice = &data[lo..hi];
                    let mut headers = common.to_vec();
                    headers.push((
                        "Content-Range",
                        format!("bytes {}-{}/{}", lo, hi.saturating_sub(1), data.len()),
                    ));
                    respond(&mut stream, "206 Partial Content", &headers, slice, false);
                }
                _ => respond(&mut stream, "405 Method Not Allowed", &[], b"", false),
            }
            continue;
        }

        respond(&mut stream, "404 Not Found", &[], b"not found", method == "HEAD");
    }
}

fn respond(
    stream: &mut TcpStream,
    status: &str,
    headers: &[(&str, String)],
    body: &[u8],
    head_only: bool,
) {
    let mut out = format!("HTTP/1.1 {}\r\nContent-Length: {}\r\n", status, body.len());
    for (name, value) in headers {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
    out.push_str("\r\n");
    let _ = stream.write_all(out.as_bytes());
    if !head_only {
        let _ = stream.write_all(body);
    }
    let _ = stream.flush();
}

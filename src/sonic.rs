use anyhow::{Context, Result, bail};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use serde::{Deserialize, Deserializer};

use crate::config::Config;
use crate::link::{Link, LinkKind, LinkTable};
use crate::transfer::Transfer;

/// Listing adapter for Airsonic / Subsonic servers. It speaks the JSON API
/// but produces the same LinkTable shape as the HTML scraper, so everything
/// downstream (path resolution, caching, reads) is unchanged.
pub struct SonicCtx {
    base: String,
    auth: String,
    id3: bool,
}

impl SonicCtx {
    pub fn new(cfg: &Config) -> Self {
        let username = cfg
            .sonic_username
            .as_deref()
            .expect("sonic mode requires a username");
        let password = cfg
            .sonic_password
            .as_deref()
            .expect("sonic mode requires a password");
        let auth = if cfg.sonic_insecure {
            // Legacy scheme: hex-encoded password, understood by old servers.
            format!(
                "u={}&p=enc:{}&v=1.8.0&c=httpdirfs&f=json",
                escape(username),
                hex_encode(password.as_bytes())
            )
        } else {
            let salt = uuid::Uuid::new_v4().simple().to_string();
            format!(
                "u={}&t={}&s={}&v=1.13.0&c=httpdirfs&f=json",
                escape(username),
                auth_token(password, &salt),
                salt
            )
        };
        SonicCtx { base: cfg.base_url.clone(), auth, id3: cfg.sonic_id3 }
    }

    fn api_url(&self, method: &str, params: &[(&str, &str)]) -> String {
        let mut url = format!("{}/rest/{}.view?{}", self.base, method, self.auth);
        for (k, v) in params {
            url.push('&');
            url.push_str(k);
            url.push('=');
            url.push_str(&escape(v));
        }
        url
    }

    fn download_url(&self, id: &str) -> String {
        self.api_url("download", &[("id", id)])
    }

    /// The root listing: music folders and top-level entries in index mode,
    /// artists in ID3 mode.
    pub fn build_root(&self, transfer: &Transfer) -> Result<LinkTable> {
        if self.id3 {
            let url = self.api_url("getArtists", &[]);
            let resp = self.call(transfer, &url)?;
            let indexes = resp.artists.context("getArtists returned no artist list")?;
            Ok(self.artists_to_table(&url, indexes, 1))
        } else {
            let url = self.api_url("getIndexes", &[]);
            let resp = self.call(transfer, &url)?;
            let indexes = resp.indexes.context("getIndexes returned no index")?;
            let mut table = self.artists_to_table(&url, indexes.clone(), 0);
            for child in &indexes.child {
                self.push_child(&mut table, child);
            }
            Ok(table)
        }
    }

    /// Expand one directory entry. `depth` selects the ID3 layer; index mode
    /// ignores it.
    pub fn build_dir(&self, transfer: &Transfer, id: &str, depth: u64) -> Result<LinkTable> {
        if !self.id3 {
            let url = self.api_url("getMusicDirectory", &[("id", id)]);
            let resp = self.call(transfer, &url)?;
            let dir = resp.directory.context("getMusicDirectory returned no directory")?;
            let mut table = LinkTable::with_head(&url);
            for child in &dir.child {
                self.push_child(&mut table, child);
            }
            return Ok(table);
        }
        match depth {
            1 => {
                let url = self.api_url("getArtist", &[("id", id)]);
                let resp = self.call(transfer, &url)?;
                let artist = resp.artist.context("getArtist returned no artist")?;
                let mut table = LinkTable::with_head(&url);
                for album in &artist.album {
                    let name = album.name.as_deref().unwrap_or(&album.id);
                    let mut link = Link::new(&sanitize(name), LinkKind::Dir);
                    link.f_url = self.api_url("getAlbum", &[("id", &album.id)]);
                    link.time = parse_created(album.created.as_deref());
                    link.sonic_id = Some(album.id.clone());
                    link.sonic_depth = 2;
                    table.push(link);
                }
                Ok(table)
            }
            2 => {
                let url = self.api_url("getAlbum", &[("id", id)]);
                let resp = self.call(transfer, &url)?;
                let album = resp.album.context("getAlbum returned no album")?;
                let mut table = LinkTable::with_head(&url);
                for song in &album.song {
                    self.push_child(&mut table, song);
                }
                Ok(table)
            }
            _ => bail!("unexpected ID3 nesting depth {}", depth),
        }
    }

    fn artists_to_table(&self, url: &str, indexes: IndexesNode, depth: u64) -> LinkTable {
        let mut table = LinkTable::with_head(url);
        for group in &indexes.index {
            for artist in &group.artist {
                let mut link = Link::new(&sanitize(&artist.name), LinkKind::Dir);
                link.f_url = self.api_url("getMusicDirectory", &[("id", &artist.id)]);
                link.sonic_id = Some(artist.id.clone());
                link.sonic_depth = depth;
                table.push(link);
            }
        }
        table
    }

    fn push_child(&self, table: &mut LinkTable, child: &ChildEntry) {
        let title = child
            .title
            .as_deref()
            .or(child.name.as_deref())
            .unwrap_or(&child.id);
        if child.is_dir {
            let mut link = Link::new(&sanitize(title), LinkKind::Dir);
            link.f_url = self.api_url("getMusicDirectory", &[("id", &child.id)]);
            link.time = parse_created(child.created.as_deref());
            link.sonic_id = Some(child.id.clone());
            table.push(link);
        } else {
            let mut name = sanitize(title);
            if let Some(suffix) = &child.suffix {
                let dotted = format!(".{}", suffix);
                if !name.ends_with(&dotted) {
                    name.push_str(&dotted);
                }
            }
            // The API reports sizes directly, so no stat fill is needed. A
            // song without a size cannot be read; mark it invalid.
            let kind = if child.size > 0 { LinkKind::File } else { LinkKind::Invalid };
            let mut link = Link::new(&name, kind);
            link.f_url = self.download_url(&child.id);
            link.content_length = child.size;
            link.time = parse_created(child.created.as_deref());
            link.sonic_id = Some(child.id.clone());
            table.push(link);
        }
    }

    fn call(&self, transfer: &Transfer, url: &str) -> Result<SonicResponse> {
        let body = transfer
            .get_full(url)
            .with_context(|| format!("Subsonic request failed: {}", url))?;
        let envelope: SonicEnvelope = serde_json::from_slice(&body.data)
            .with_context(|| format!("cannot parse the Subsonic response from {}", url))?;
        let resp = envelope.response;
        if let Some(err) = &resp.error {
            bail!("Subsonic error {}: {}", err.code, err.message);
        }
        if resp.status.as_deref() != Some("ok") {
            bail!("Subsonic response status is not ok");
        }
        Ok(resp)
    }
}

/// token = md5(password + salt), lowercase hex.
fn auth_token(password: &str, salt: &str) -> String {
    format!("{:x}", md5::compute(format!("{}{}", password, salt)))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn escape(s: &str) -> String {
    utf8_percent_encode(s, NON_ALPHANUMERIC).to_string()
}

/// Titles become path components; an embedded '/' would split them.
fn sanitize(name: &str) -> String {
    name.replace('/', "-")
}

/// Servers emit `created` with or without a UTC offset; treat the bare form
/// as UTC.
fn parse_created(created: Option<&str>) -> i64 {
    let Some(s) = created else { return 0 };
    if let Ok(t) = chrono::DateTime::parse_from_rfc3339(s) {
        return t.timestamp();
    }
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
        .map(|t| t.and_utc().timestamp())
        .unwrap_or(0)
}

fn de_id<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<String, D::Error> {
    let v = serde_json::Value::deserialize(d)?;
    match v {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        _ => Err(serde::de::Error::custom("id must be a string or a number")),
    }
}

#[derive(Deserialize)]
struct SonicEnvelope {
    #[serde(rename = "subsonic-response")]
    response: SonicResponse,
}

#[derive(Deserialize)]
struct SonicResponse {
    status: Option<String>,
    error: Option<SonicError>,
    indexes: Option<IndexesNode>,
    directory: Option<DirectoryNode>,
    artists: Option<IndexesNode>,
    artist: Option<ArtistNode>,
    album: Option<AlbumNode>,
}

#[derive(Deserialize)]
struct SonicError {
    code: i64,
    message: String,
}

#[derive(Deserialize, Clone)]
struct IndexesNode {
    #[serde(default)]
    index: Vec<IndexGroup>,
    #[serde(default)]
    child: Vec<ChildEntry>,
}

#[derive(Deserialize, Clone)]
struct IndexGroup {
    #[serde(default)]
    artist: Vec<ArtistEntry>,
}

#[derive(Deserialize, Clone)]
struct ArtistEntry {
    #[serde(deserialize_with = "de_id")]
    id: String,
    name: String,
}

#[derive(Deserialize)]
struct DirectoryNode {
    #[serde(default)]
    child: Vec<ChildEntry>,
}

#[derive(Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
struct ChildEntry {
    #[serde(deserialize_with = "de_id")]
    id: String,
    #[serde(default)]
    is_dir: bool,
    title: Option<String>,
    name: Option<String>,
    #[serde(default)]
    size: u64,
    created: Option<String>,
    suffix: Option<String>,
}

#[derive(Deserialize)]
struct ArtistNode {
    #[serde(default)]
    album: Vec<AlbumEntry>,
}

#[derive(Deserialize)]
struct AlbumEntry {
    #[serde(deserialize_with = "de_id")]
    id: String,
    name: Option<String>,
    created: Option<String>,
}

#[derive(Deserialize)]
struct AlbumNode {
    #[serde(default)]
    song: Vec<ChildEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_md5_of_password_and_salt() {
        // md5("sesamec19b2d") from the Subsonic API documentation example.
        assert_eq!(auth_token("sesame", "c19b2d"), "26719a1196d2a940705a59634eb18eab");
    }

    #[test]
    fn insecure_auth_hex_encodes_the_password() {
        assert_eq!(hex_encode(b"sesame"), "736573616d65");
    }

    #[test]
    fn directory_response_parses_numeric_and_string_ids() {
        let raw = r#"{"subsonic-response":{"status":"ok","version":"1.13.0",
            "directory":{"id":"11","name":"Arrival","child":[
                {"id":111,"isDir":false,"title":"Dancing Queen","size":3037672,
                 "suffix":"mp3","created":"2004-11-08T23:36:11"},
                {"id":"12","isDir":true,"title":"Bonus Disc"}
            ]}}}"#;
        let env: SonicEnvelope = serde_json::from_str(raw).expect("parse");
        let dir = env.response.directory.expect("directory");
        assert_eq!(dir.child.len(), 2);
        assert_eq!(dir.child[0].id, "111");
        assert!(!dir.child[0].is_dir);
        assert_eq!(dir.child[1].id, "12");
        assert!(dir.child[1].is_dir);
    }

    #[test]
    fn songs_become_file_links_with_suffix() {
        let cfg = test_config();
        let sonic = SonicCtx::new(&cfg);
        let mut table = LinkTable::with_head("http://host/rest");
        let child = ChildEntry {
            id: "111".into(),
            is_dir: false,
            title: Some("Dancing Queen".into()),
            name: None,
            size: 3_037_672,
            created: Some("2004-11-08T23:36:11+00:00".into()),
            suffix: Some("mp3".into()),
        };
        sonic.push_child(&mut table, &child);
        assert_eq!(table.links[1].name, "Dancing Queen.mp3");
        assert_eq!(table.links[1].kind, LinkKind::File);
        assert_eq!(table.links[1].content_length, 3_037_672);
        assert!(table.links[1].time > 0);
        assert!(table.links[1].f_url.contains("download.view"));
        assert!(table.links[1].f_url.contains("id=111"));
    }

    #[test]
    fn slashes_in_titles_are_sanitized() {
        assert_eq!(sanitize("AC/DC"), "AC-DC");
    }

    fn test_config() -> crate::config::Config {
        use clap::Parser;
        let cli = crate::cli::Cli::parse_from([
            "httpdirfs",
            "--sonic-username",
            "admin",
            "--sonic-password",
            "sesame",
            "http://host",
            "/mnt",
        ]);
        crate::config::Config::from_cli(&cli).expect("config")
    }
}

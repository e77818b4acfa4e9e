use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};

use crate::config::{Config, OperationMode};
use crate::sonic::SonicCtx;
use crate::transfer::{StatOutcome, Transfer};
use crate::util::{MAX_FILENAME_LEN, path_append, truncate_at_boundary, unescape};

/// Upper bound on directory nesting. A listing loop on the server (e.g. a
/// symlinked ancestor) would otherwise expand forever.
pub const MAX_DIR_DEPTH: usize = 64;

/// What a directory entry points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    /// The sentinel at index 0 carrying the directory's own URL.
    Head,
    Dir,
    File,
    Invalid,
    /// A file entry whose stats have not been probed yet.
    Uninitialized,
}

impl LinkKind {
    fn to_byte(self) -> u8 {
        match self {
            LinkKind::Head => b'H',
            LinkKind::Dir => b'D',
            LinkKind::File => b'F',
            LinkKind::Invalid => b'I',
            LinkKind::Uninitialized => b'U',
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            b'H' => Some(LinkKind::Head),
            b'D' => Some(LinkKind::Dir),
            b'F' => Some(LinkKind::File),
            b'I' => Some(LinkKind::Invalid),
            b'U' => Some(LinkKind::Uninitialized),
            _ => None,
        }
    }
}

/// One entry in a directory listing.
#[derive(Debug, PartialEq)]
pub struct Link {
    /// Short name; percent-decoded once the table is filled.
    pub name: String,
    /// Full URL the entry resolves to.
    pub f_url: String,
    pub kind: LinkKind,
    pub content_length: u64,
    /// mtime in seconds since the epoch; 0 when the server gave none.
    pub time: i64,
    /// Subsonic object id, when enumerating through the Subsonic API.
    pub sonic_id: Option<String>,
    /// Nesting depth in Subsonic ID3 mode (artist 0, album 1, song 2).
    pub sonic_depth: u64,
    children: Option<Box<LinkTable>>,
}

impl Link {
    /// A new entry from a raw href. A single trailing '/' is stripped and
    /// the name is bounded at `MAX_FILENAME_LEN`.
    pub fn new(raw_name: &str, kind: LinkKind) -> Self {
        let mut name = raw_name.to_string();
        if name.ends_with('/') {
            name.pop();
        }
        truncate_at_boundary(&mut name, MAX_FILENAME_LEN);
        Link {
            name,
            f_url: String::new(),
            kind,
            content_length: 0,
            time: 0,
            sonic_id: None,
            sonic_depth: 0,
            children: None,
        }
    }

    pub fn info(&self) -> LinkInfo {
        LinkInfo {
            name: self.name.clone(),
            f_url: self.f_url.clone(),
            kind: self.kind,
            content_length: self.content_length,
            time: self.time,
        }
    }
}

/// Snapshot of a Link handed out of the link lock.
#[derive(Debug, Clone)]
pub struct LinkInfo {
    pub name: String,
    pub f_url: String,
    pub kind: LinkKind,
    pub content_length: u64,
    pub time: i64,
}

/// A directory's materialized listing. Index 0 is the head sentinel.
#[derive(Debug, PartialEq)]
pub struct LinkTable {
    pub links: Vec<Link>,
}

impl LinkTable {
    /// An empty table whose head sentinel carries the directory URL.
    pub fn with_head(url: &str) -> Self {
        let mut head = Link::new("/", LinkKind::Head);
        head.name = "/".to_string();
        head.f_url = url.to_string();
        LinkTable { links: vec![head] }
    }

    pub fn push(&mut self, link: Link) {
        self.links.push(link);
    }

    fn last_raw_name(&self) -> &str {
        &self.links[self.links.len() - 1].name
    }

    fn find(&self, name: &str) -> Option<usize> {
        self.links
            .iter()
            .skip(1)
            .position(|l| l.name == name)
            .map(|p| p + 1)
    }

    /// Give previously failed entries another chance. Used when a disk
    /// listing is reused: the failure may have been transient.
    fn reset_invalid(&mut self) {
        let mut reset = 0;
        for link in &mut self.links[1..] {
            if link.kind == LinkKind::Invalid {
                link.kind = LinkKind::Uninitialized;
                reset += 1;
            }
        }
        tracing::debug!("[link] {} invalid links reset", reset);
    }

    fn log_dump(&self) {
        tracing::debug!("[link] ---- LinkTable for {} ----", self.links[0].f_url);
        let mut invalid = 0;
        for (i, link) in self.links.iter().enumerate() {
            tracing::debug!(
                "[link] {} {} {} {} {}",
                i,
                link.kind.to_byte() as char,
                link.content_length,
                link.name,
                link.f_url
            );
            if !matches!(link.kind, LinkKind::File | LinkKind::Dir | LinkKind::Head) {
                invalid += 1;
            }
        }
        tracing::debug!("[link] invalid link count: {}", invalid);
    }
}

/// Classify a raw href. Valid names start with an ASCII alphanumeric or '%'
/// (percent-encoded names) and contain no interior '/'; a trailing '/'
/// marks a directory.
fn classify(href: &str) -> LinkKind {
    let bytes = href.as_bytes();
    let Some(&first) = bytes.first() else {
        return LinkKind::Invalid;
    };
    if !first.is_ascii_alphanumeric() && first != b'%' {
        return LinkKind::Invalid;
    }
    if let Some(pos) = href.find('/') {
        if pos != href.len() - 1 {
            return LinkKind::Invalid;
        }
    }
    if href.ends_with('/') {
        LinkKind::Dir
    } else {
        LinkKind::Uninitialized
    }
}

/// Whether a freshly parsed href repeats the previous entry. Apache's
/// `IconsAreLinks` emits the same target twice, the second time possibly
/// with a trailing '/'.
fn names_equal(prev: &str, href: &str) -> bool {
    prev == href
        || (href.len() == prev.len() + 1 && href.ends_with('/') && href.starts_with(prev))
}

/// The lazily expanded tree of directory listings. One lock serializes
/// resolution and growth: listing generation takes priority over data
/// transfers.
pub struct LinkSystem {
    root: Mutex<LinkTable>,
    transfer: Arc<Transfer>,
    meta_dir: Option<PathBuf>,
    mode: OperationMode,
    sonic: Option<SonicCtx>,
}

impl LinkSystem {
    /// Build the root listing for the configured mode. A root that cannot
    /// be built is fatal to startup.
    pub fn init(
        cfg: &Config,
        transfer: Arc<Transfer>,
        meta_dir: Option<PathBuf>,
    ) -> Result<Arc<Self>> {
        let system = LinkSystem {
            root: Mutex::new(LinkTable::with_head(&cfg.base_url)),
            transfer,
            // Single-file mode keeps nothing on disk: its root is synthetic.
            meta_dir: if cfg.mode == OperationMode::Single { None } else { meta_dir },
            mode: cfg.mode,
            sonic: if cfg.mode == OperationMode::Sonic {
                Some(SonicCtx::new(cfg))
            } else {
                None
            },
        };

        let root = match cfg.mode {
            OperationMode::Normal => system.build_table(&cfg.base_url, "/")?,
            OperationMode::Single => system.single_table(&cfg.base_url)?,
            OperationMode::Sonic => {
                let sonic = system.sonic.as_ref().expect("sonic context just built");
                sonic.build_root(&system.transfer)?
            }
        };
        *system.root.lock().expect("link lock poisoned") = root;
        Ok(Arc::new(system))
    }

    /// Resolve a '/'-separated filesystem path to a Link snapshot,
    /// materializing intermediate listings as needed. The root itself has no
    /// Link; callers special-case "/".
    pub fn resolve(&self, path: &str) -> Option<LinkInfo> {
        let segs = split_path(path);
        if segs.is_empty() || segs.len() > MAX_DIR_DEPTH {
            return None;
        }
        let mut root = self.root.lock().expect("link lock poisoned");
        self.resolve_in(&mut root, &segs, "/")
    }

    /// Snapshot the (materialized) listing of a directory path; "/" lists
    /// the root.
    pub fn list_dir(&self, path: &str) -> Option<Vec<LinkInfo>> {
        let segs = split_path(path);
        if segs.len() > MAX_DIR_DEPTH {
            return None;
        }
        let mut root = self.root.lock().expect("link lock poisoned");
        let table = self.descend(&mut root, &segs, "/")?;
        Some(table.links[1..].iter().map(Link::info).collect())
    }

    fn resolve_in(
        &self,
        table: &mut LinkTable,
        segs: &[String],
        dir_path: &str,
    ) -> Option<LinkInfo> {
        let (first, rest) = segs.split_first()?;
        let idx = table.find(first)?;
        if rest.is_empty() {
            return Some(table.links[idx].info());
        }
        let child_dir = path_append(dir_path, first);
        if self.ensure_children(table, idx, &child_dir).is_err() {
            return None;
        }
        let child = table.links[idx]
            .children
            .as_mut()
            .expect("child table just ensured");
        self.resolve_in(child, rest, &child_dir)
    }

    fn descend<'a>(
        &self,
        table: &'a mut LinkTable,
        segs: &[String],
        dir_path: &str,
    ) -> Option<&'a mut LinkTable> {
        let Some((first, rest)) = segs.split_first() else {
            return Some(table);
        };
        let idx = table.find(first)?;
        let child_dir = path_append(dir_path, first);
        if self.ensure_children(table, idx, &child_dir).is_err() {
            return None;
        }
        let child = table.links[idx]
            .children
            .as_mut()
            .expect("child table just ensured");
        self.descend(child, rest, &child_dir)
    }

    /// Materialize the child listing of `links[idx]` if it does not exist
    /// yet. Once built, a listing is never rebuilt within the process.
    fn ensure_children(&self, table: &mut LinkTable, idx: usize, dir_path: &str) -> Result<()> {
        if table.links[idx].children.is_some() {
            return Ok(());
        }
        let url = table.links[idx].f_url.clone();
        let sonic_id = table.links[idx].sonic_id.clone();
        let sonic_depth = table.links[idx].sonic_depth;
        let built = match self.mode {
            OperationMode::Normal => self.build_table(&url, dir_path)?,
            OperationMode::Sonic => {
                let sonic = self.sonic.as_ref().expect("sonic mode without context");
                let id = sonic_id.context("directory entry without a Subsonic id")?;
                sonic.build_dir(&self.transfer, &id, sonic_depth)?
            }
            OperationMode::Single => bail!("single-file mode has no subdirectories"),
        };
        table.links[idx].children = Some(Box::new(built));
        Ok(())
    }

    /// Fetch and parse one HTML index page into a filled LinkTable, reusing
    /// the on-disk listing when its entry count matches the fresh parse.
    fn build_table(&self, url: &str, fs_path: &str) -> Result<LinkTable> {
        tracing::debug!("[link] building LinkTable for {}", url);
        let body = self
            .transfer
            .get_full(url)
            .with_context(|| format!("cannot download the index page at {}", url))?;
        if body.data.is_empty() {
            bail!("empty index page at {}", url);
        }
        let html = String::from_utf8_lossy(&body.data);

        let mut table = LinkTable::with_head(url);
        for href in extract_hrefs(&html) {
            let kind = classify(&href);
            if matches!(kind, LinkKind::Dir | LinkKind::Uninitialized)
                && !names_equal(table.last_raw_name(), &href)
            {
                table.push(Link::new(&href, kind));
            }
        }

        let mut reused_disk = false;
        let disk_path = self.meta_dir.as_ref().map(|d| table_path(d, fs_path));
        if let Some(disk_path) = &disk_path {
            if let Some(parent) = disk_path.parent() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    tracing::warn!("[link] cannot create {}: {}", parent.display(), e);
                }
            }
            if let Some(disk) = table_load(disk_path) {
                tracing::debug!(
                    "[link] disk listing: {} entries, fresh: {}",
                    disk.links.len(),
                    table.links.len()
                );
                if disk.links.len() == table.links.len() {
                    table = disk;
                    table.reset_invalid();
                    reused_disk = true;
                }
            }
        }

        if !reused_disk {
            self.fill_urls_and_names(&mut table);
        }
        self.fill_unknown(&mut table);

        if let Some(disk_path) = &disk_path {
            if let Err(e) = table_save(&table, disk_path) {
                tracing::warn!("[link] failed to save the LinkTable: {}", e);
            }
        }

        table.log_dump();
        Ok(table)
    }

    /// Compose full URLs from the head URL and percent-decode the names.
    /// URLs keep the escaped form; names are what path resolution matches.
    fn fill_urls_and_names(&self, table: &mut LinkTable) {
        let base = table.links[0].f_url.clone();
        for link in &mut table.links[1..] {
            link.f_url = path_append(&base, &link.name);
            link.name = unescape(&link.name);
        }
    }

    /// Probe stats for every uninitialized entry, pass after pass. Entries
    /// that hit a temporary failure stay uninitialized and are probed again
    /// on the next pass.
    fn fill_unknown(&self, table: &mut LinkTable) {
        loop {
            let pending: Vec<usize> = table
                .links
                .iter()
                .enumerate()
                .filter(|(_, l)| l.kind == LinkKind::Uninitialized)
                .map(|(i, _)| i)
                .collect();
            if pending.is_empty() {
                break;
            }
            tracing::debug!("[link] probing {} uninitialised entries", pending.len());
            for &i in &pending {
                self.transfer.stat_submit(i, table.links[i].f_url.clone());
            }
            for (i, outcome) in self.transfer.stat_collect(pending.len()) {
                let link = &mut table.links[i];
                match outcome {
                    StatOutcome::Found { length, mtime } => {
                        link.kind = LinkKind::File;
                        link.content_length = length;
                        link.time = mtime;
                    }
                    StatOutcome::Invalid => link.kind = LinkKind::Invalid,
                    StatOutcome::Retry => {}
                }
            }
        }
    }

    /// The root listing for single-file mode: one synthetic entry named
    /// after the URL's basename.
    fn single_table(&self, url: &str) -> Result<LinkTable> {
        let basename = url.rsplit('/').next().unwrap_or(url);
        if basename.is_empty() {
            bail!("cannot derive a file name from {}", url);
        }
        let mut table = LinkTable::with_head(url);
        let mut link = Link::new(basename, LinkKind::Uninitialized);
        link.f_url = url.to_string();
        table.push(link);
        self.fill_unknown(&mut table);
        table.log_dump();
        Ok(table)
    }
}

fn split_path(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Collect every `<a href>` value from an HTML document. The tokenizer is
/// forgiving: broken markup yields whatever anchors it can see, which is
/// exactly what auto-index pages need.
pub fn extract_hrefs(html: &str) -> Vec<String> {
    use std::cell::RefCell;

    use html5ever::tokenizer::{
        BufferQueue, TagKind, Token, TokenSink, TokenSinkResult, Tokenizer, TokenizerOpts,
    };

    #[derive(Default)]
    struct AnchorSink {
        hrefs: RefCell<Vec<String>>,
    }

    impl TokenSink for AnchorSink {
        type Handle = ();

        fn process_token(&self, token: Token, _line_number: u64) -> TokenSinkResult<()> {
            if let Token::TagToken(tag) = token {
                if tag.kind == TagKind::StartTag && tag.name.as_ref() == "a" {
                    for attr in &tag.attrs {
                        if attr.name.local.as_ref() == "href" {
                            self.hrefs.borrow_mut().push(attr.value.to_string());
                        }
                    }
                }
            }
            TokenSinkResult::Continue
        }
    }

    let input = BufferQueue::default();
    input.push_back(html.into());
    let tokenizer = Tokenizer::new(AnchorSink::default(), TokenizerOpts::default());
    let _ = tokenizer.feed(&input);
    tokenizer.end();
    let sink = tokenizer.sink;
    sink.hrefs.into_inner()
}

fn table_path(meta_dir: &Path, fs_path: &str) -> PathBuf {
    meta_dir
        .join(fs_path.trim_start_matches('/'))
        .join(".LinkTable")
}

/// Serialize a listing: count, then per record the name, the URL, the kind
/// byte, the content length and the mtime. All integers little-endian.
fn table_save(table: &LinkTable, path: &Path) -> std::io::Result<()> {
    let mut out = Vec::new();
    out.extend_from_slice(&(table.links.len() as u32).to_le_bytes());
    for link in &table.links {
        let name = link.name.as_bytes();
        let url = link.f_url.as_bytes();
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(name);
        out.extend_from_slice(&(url.len() as u16).to_le_bytes());
        out.extend_from_slice(url);
        out.push(link.kind.to_byte());
        out.extend_from_slice(&link.content_length.to_le_bytes());
        out.extend_from_slice(&link.time.to_le_bytes());
    }
    let mut file = std::fs::File::create(path)?;
    file.write_all(&out)
}

/// Load a previously saved listing. Any short read, I/O error or unknown
/// kind byte discards the disk copy.
fn table_load(path: &Path) -> Option<LinkTable> {
    match read_table(path) {
        Ok(table) => Some(table),
        Err(e) => {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!("[link] discarding {}: {}", path.display(), e);
                let _ = std::fs::remove_file(path);
            }
            None
        }
    }
}

fn take<'a>(buf: &'a [u8], cursor: &mut usize, n: usize) -> std::io::Result<&'a [u8]> {
    use std::io::{Error, ErrorKind};
    if *cursor + n > buf.len() {
        return Err(Error::new(ErrorKind::UnexpectedEof, "short LinkTable file"));
    }
    let out = &buf[*cursor..*cursor + n];
    *cursor += n;
    Ok(out)
}

fn take_u16(buf: &[u8], cursor: &mut usize) -> std::io::Result<u16> {
    let mut raw = [0u8; 2];
    raw.copy_from_slice(take(buf, cursor, 2)?);
    Ok(u16::from_le_bytes(raw))
}

fn take_u64(buf: &[u8], cursor: &mut usize) -> std::io::Result<u64> {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(take(buf, cursor, 8)?);
    Ok(u64::from_le_bytes(raw))
}

fn read_table(path: &Path) -> std::io::Result<LinkTable> {
    use std::io::{Error, ErrorKind};

    let mut file = std::fs::File::open(path)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    let mut cursor = 0usize;

    let mut raw_count = [0u8; 4];
    raw_count.copy_from_slice(take(&buf, &mut cursor, 4)?);
    let count = u32::from_le_bytes(raw_count) as usize;

    let mut links = Vec::with_capacity(count.min(4096));
    for _ in 0..count {
        let name_len = take_u16(&buf, &mut cursor)? as usize;
        let name = String::from_utf8_lossy(take(&buf, &mut cursor, name_len)?).into_owned();
        let url_len = take_u16(&buf, &mut cursor)? as usize;
        let f_url = String::from_utf8_lossy(take(&buf, &mut cursor, url_len)?).into_owned();
        let kind = LinkKind::from_byte(take(&buf, &mut cursor, 1)?[0])
            .ok_or_else(|| Error::new(ErrorKind::InvalidData, "unknown link kind"))?;
        let content_length = take_u64(&buf, &mut cursor)?;
        let time = take_u64(&buf, &mut cursor)? as i64;
        links.push(Link {
            name,
            f_url,
            kind,
            content_length,
            time,
            sonic_id: None,
            sonic_depth: 0,
            children: None,
        });
    }
    if links.is_empty() {
        return Err(Error::new(ErrorKind::InvalidData, "LinkTable without a head"));
    }
    Ok(LinkTable { links })
}

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, bounded};

use crate::config::Config;
use crate::error::{CacheError, TransferError};
use crate::link::LinkInfo;
use crate::transfer::Transfer;

/// Bytes of metadata ahead of the segment bitmap: content length, mtime,
/// segment size, segment count.
const META_HEADER_LEN: usize = 8 + 8 + 4 + 4;

/// The disk cache: two files per remote file (metadata + sparse data),
/// mirroring the remote tree under `meta/` and `data/` roots.
pub struct CacheSystem {
    meta_dir: PathBuf,
    data_dir: PathBuf,
    blksz: u64,
    max_segbc: u32,
    transfer: Arc<Transfer>,
    open_files: Mutex<HashMap<String, Arc<Cache>>>,
}

impl CacheSystem {
    pub fn init(cfg: &Config, transfer: Arc<Transfer>) -> Result<Arc<Self>> {
        let root = cfg.cache_root()?;
        let meta_dir = root.join("meta");
        let data_dir = root.join("data");
        std::fs::create_dir_all(&meta_dir)
            .with_context(|| format!("cannot create {}", meta_dir.display()))?;
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("cannot create {}", data_dir.display()))?;
        tracing::info!("[cache] enabled at {}", root.display());
        Ok(Arc::new(CacheSystem {
            meta_dir,
            data_dir,
            blksz: cfg.data_blksz,
            max_segbc: cfg.max_segbc,
            transfer,
            open_files: Mutex::new(HashMap::new()),
        }))
    }

    /// Where directory listings are persisted.
    pub fn meta_dir(&self) -> &Path {
        &self.meta_dir
    }

    fn meta_path(&self, fs_path: &str) -> PathBuf {
        self.meta_dir.join(fs_path.trim_start_matches('/'))
    }

    fn data_path(&self, fs_path: &str) -> PathBuf {
        self.data_dir.join(fs_path.trim_start_matches('/'))
    }

    /// Create the cache file pair for a link: a zeroed metadata sidecar and
    /// a data file pre-truncated to the full remote size.
    pub fn create(&self, fs_path: &str, link: &LinkInfo) -> Result<(), CacheError> {
        let segbc = segment_count(link.content_length, self.blksz);
        if segbc > self.max_segbc as u64 {
            return Err(CacheError::TooManySegments {
                path: fs_path.to_string(),
                need: segbc,
                max: self.max_segbc,
            });
        }
        let meta_path = self.meta_path(fs_path);
        let data_path = self.data_path(fs_path);
        for path in [&meta_path, &data_path] {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| CacheError::Io(format!("mkdir {}", parent.display()), e))?;
            }
        }

        let data = File::create(&data_path)
            .map_err(|e| CacheError::Io(format!("create {}", data_path.display()), e))?;
        data.set_len(link.content_length)
            .map_err(|e| CacheError::Io(format!("truncate {}", data_path.display()), e))?;

        let meta = Meta {
            content_length: link.content_length,
            time: link.time,
            blksz: self.blksz as u32,
            segbc: segbc as u32,
            bitmap: vec![0; segbc as usize],
        };
        write_meta_file(&meta_path, &meta)
            .map_err(|e| CacheError::Io(format!("write {}", meta_path.display()), e))?;
        tracing::debug!("[cache] created cache files for {}", fs_path);
        Ok(())
    }

    /// Open the cache file pair for a path. Returns None when the files do
    /// not exist or disagree with the current link (the caller may delete
    /// and re-create). Spawns the per-file prefetch thread.
    pub fn open(&self, fs_path: &str, link: &LinkInfo) -> Option<Arc<Cache>> {
        let mut reg = self.open_files.lock().expect("cache registry poisoned");
        if let Some(existing) = reg.get(fs_path) {
            existing.open_count.fetch_add(1, Ordering::SeqCst);
            return Some(existing.clone());
        }

        let meta_path = self.meta_path(fs_path);
        let data_path = self.data_path(fs_path);
        let meta = match read_meta(&meta_path) {
            Ok(meta) => meta,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("[cache] unreadable metadata for {}: {}", fs_path, e);
                }
                return None;
            }
        };
        if meta.blksz == 0 || meta.segbc as u64 != segment_count(meta.content_length, meta.blksz as u64)
        {
            tracing::warn!("[cache] inconsistent metadata for {}", fs_path);
            return None;
        }
        if meta.segbc > self.max_segbc {
            tracing::warn!("[cache] {} exceeds the segment limit", fs_path);
            return None;
        }
        if meta.content_length != link.content_length || meta.time != link.time {
            tracing::info!("[cache] stale cache for {}, discarding", fs_path);
            return None;
        }
        let data_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&data_path)
            .ok()?;
        let meta_file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&meta_path)
            .ok()?;

        // One token wakes the prefetch thread for one step; the foreground
        // posts, the thread consumes.
        let (gate_tx, gate_rx) = bounded::<()>(1);
        let cache = Arc::new(Cache {
            fs_path: fs_path.to_string(),
            url: link.f_url.clone(),
            content_length: meta.content_length,
            time: meta.time,
            blksz: meta.blksz as u64,
            seg: Mutex::new(meta.bitmap),
            data_file,
            meta_file: Mutex::new(meta_file),
            w_lock: Mutex::new(()),
            gate_tx,
            next_dl_offset: AtomicU64::new(0),
            closing: AtomicBool::new(false),
            open_count: AtomicUsize::new(1),
            bgt: Mutex::new(None),
            transfer: self.transfer.clone(),
        });

        let thread_cache = cache.clone();
        let handle = std::thread::spawn(move || bg_loop(thread_cache, gate_rx));
        *cache.bgt.lock().expect("cache thread slot poisoned") = Some(handle);

        reg.insert(fs_path.to_string(), cache.clone());
        Some(cache)
    }

    /// Drop one open reference; the last close joins the prefetch thread
    /// and forgets the handle.
    pub fn close(&self, cache: &Arc<Cache>) {
        let mut reg = self.open_files.lock().expect("cache registry poisoned");
        if cache.open_count.fetch_sub(1, Ordering::SeqCst) != 1 {
            return;
        }
        reg.remove(&cache.fs_path);
        drop(reg);

        cache.closing.store(true, Ordering::SeqCst);
        let _ = cache.gate_tx.try_send(());
        let handle = cache
            .bgt
            .lock()
            .expect("cache thread slot poisoned")
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        tracing::debug!("[cache] closed {}", cache.fs_path);
    }

    /// Remove the cache file pair for a path.
    pub fn delete(&self, fs_path: &str) {
        for path in [self.meta_path(fs_path), self.data_path(fs_path)] {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("[cache] cannot remove {}: {}", path.display(), e);
                }
            }
        }
    }
}

/// One opened cache file pair.
pub struct Cache {
    fs_path: String,
    url: String,
    content_length: u64,
    time: i64,
    blksz: u64,
    /// One byte per segment; non-zero iff the segment is on disk.
    seg: Mutex<Vec<u8>>,
    data_file: File,
    meta_file: Mutex<File>,
    /// Serializes segment downloads so concurrent demand for the same
    /// segment fetches it exactly once.
    w_lock: Mutex<()>,
    gate_tx: Sender<()>,
    next_dl_offset: AtomicU64,
    closing: AtomicBool,
    open_count: AtomicUsize,
    bgt: Mutex<Option<std::thread::JoinHandle<()>>>,
    transfer: Arc<Transfer>,
}

impl Cache {
    pub fn content_length(&self) -> u64 {
        self.content_length
    }

    /// Read at most one segment's worth of bytes at `offset`, fetching the
    /// segment from the server first if it is not on disk. Callers loop to
    /// fill larger buffers.
    pub fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize, CacheError> {
        if buf.is_empty() || offset >= self.content_length {
            return Ok(0);
        }
        let s = offset / self.blksz;
        let n = read_span(offset, self.content_length, self.blksz, buf.len());

        if !self.seg_present(s) {
            let _w = self.w_lock.lock().expect("cache write lock poisoned");
            // Another reader may have fetched it while we waited.
            if !self.seg_present(s) {
                self.fetch_segment(s)?;
            }
        }

        self.data_file
            .read_exact_at(&mut buf[..n], offset)
            .map_err(|e| CacheError::Io(format!("read {}", self.fs_path), e))?;

        if s >= self.next_dl_offset.load(Ordering::SeqCst) / self.blksz {
            let _ = self.gate_tx.try_send(());
        }
        Ok(n)
    }

    fn seg_present(&self, s: u64) -> bool {
        self.seg.lock().expect("segment bitmap poisoned")[s as usize] != 0
    }

    /// Download one whole segment into the data file and persist the
    /// metadata. The caller must hold `w_lock`.
    fn fetch_segment(&self, s: u64) -> Result<(), CacheError> {
        let start = s * self.blksz;
        let end = ((s + 1) * self.blksz).min(self.content_length);
        tracing::debug!("[cache] {}: segment {} [{}, {})", self.fs_path, s, start, end);
        let data = self
            .transfer
            .get_range(&self.url, start, end)
            .map_err(CacheError::Fetch)?;
        if data.len() as u64 != end - start {
            return Err(CacheError::Fetch(TransferError::Network {
                url: self.url.clone(),
                msg: format!("short segment: got {}, want {}", data.len(), end - start),
            }));
        }
        self.data_file
            .write_all_at(&data, start)
            .map_err(|e| CacheError::Io(format!("write {}", self.fs_path), e))?;
        self.seg.lock().expect("segment bitmap poisoned")[s as usize] = 1;
        self.write_meta()
    }

    fn write_meta(&self) -> Result<(), CacheError> {
        let bitmap = self.seg.lock().expect("segment bitmap poisoned").clone();
        let mut out = Vec::with_capacity(META_HEADER_LEN + bitmap.len());
        out.extend_from_slice(&self.content_length.to_le_bytes());
        out.extend_from_slice(&self.time.to_le_bytes());
        out.extend_from_slice(&(self.blksz as u32).to_le_bytes());
        out.extend_from_slice(&(bitmap.len() as u32).to_le_bytes());
        out.extend_from_slice(&bitmap);
        let meta_file = self.meta_file.lock().expect("metadata handle poisoned");
        meta_file
            .write_all_at(&out, 0)
            .map_err(|e| CacheError::Io(format!("write metadata for {}", self.fs_path), e))
    }
}

/// The per-file prefetch thread: each gate token buys one step ahead of the
/// read cursor. Ends when the file is fully walked or the cache closes.
fn bg_loop(cache: Arc<Cache>, gate_rx: Receiver<()>) {
    loop {
        if gate_rx.recv().is_err() || cache.closing.load(Ordering::SeqCst) {
            break;
        }
        let offset = cache.next_dl_offset.fetch_add(cache.blksz, Ordering::SeqCst) + cache.blksz;
        if offset >= cache.content_length {
            break;
        }
        let s = offset / cache.blksz;
        if cache.seg_present(s) {
            continue;
        }
        let _w = cache.w_lock.lock().expect("cache write lock poisoned");
        if cache.seg_present(s) {
            continue;
        }
        if let Err(e) = cache.fetch_segment(s) {
            tracing::warn!("[cache] {}: prefetch failed: {}", cache.fs_path, e);
        }
    }
    tracing::debug!("[cache] {}: prefetch thread done", cache.fs_path);
}

fn segment_count(content_length: u64, blksz: u64) -> u64 {
    content_length.div_ceil(blksz).max(1)
}

/// How many bytes a single cache read may serve: bounded by the buffer, the
/// end of the segment, and the end of the file.
fn read_span(offset: u64, content_length: u64, blksz: u64, want: usize) -> usize {
    let seg_end = (offset / blksz + 1) * blksz;
    let end = seg_end.min(content_length);
    (want as u64).min(end - offset) as usize
}

struct Meta {
    content_length: u64,
    time: i64,
    blksz: u32,
    segbc: u32,
    bitmap: Vec<u8>,
}

fn write_meta_file(path: &Path, meta: &Meta) -> std::io::Result<()> {
    let mut out = Vec::with_capacity(META_HEADER_LEN + meta.bitmap.len());
    out.extend_from_slice(&meta.content_length.to_le_bytes());
    out.extend_from_slice(&meta.time.to_le_bytes());
    out.extend_from_slice(&meta.blksz.to_le_bytes());
    out.extend_from_slice(&meta.segbc.to_le_bytes());
    out.extend_from_slice(&meta.bitmap);
    std::fs::write(path, out)
}

fn read_meta(path: &Path) -> std::io::Result<Meta> {
    use std::io::{Error, ErrorKind};

    let mut file = File::open(path)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf)?;
    if buf.len() < META_HEADER_LEN {
        return Err(Error::new(ErrorKind::UnexpectedEof, "short metadata header"));
    }
    let mut u64_raw = [0u8; 8];
    let mut u32_raw = [0u8; 4];
    u64_raw.copy_from_slice(&buf[0..8]);
    let content_length = u64::from_le_bytes(u64_raw);
    u64_raw.copy_from_slice(&buf[8..16]);
    let time = i64::from_le_bytes(u64_raw);
    u32_raw.copy_from_slice(&buf[16..20]);
    let blksz = u32::from_le_bytes(u32_raw);
    u32_raw.copy_from_slice(&buf[20..24]);
    let segbc = u32::from_le_bytes(u32_raw);
    let bitmap = buf[META_HEADER_LEN..].to_vec();
    if bitmap.len() != segbc as usize {
        return Err(Error::new(ErrorKind::InvalidData, "bitmap length mismatch"));
    }
    Ok(Meta { content_length, time, blksz, segbc, bitmap })
}

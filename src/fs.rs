use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, MountOption, ReplyAttr, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, Request,
};

use crate::cache::{Cache, CacheSystem};
use crate::link::{LinkInfo, LinkKind, LinkSystem};
use crate::transfer::Transfer;
use crate::util::path_append;

/// Attribute time-to-live handed to the kernel. Stats never change within
/// a process lifetime, but a short TTL keeps remounts honest.
const TTL: Duration = Duration::from_secs(1);

const ROOT_INO: u64 = 1;

/// The FUSE-facing adapter: translates kernel callbacks into link-graph and
/// cache calls. Inode numbers are allocated on first sight of a path.
pub struct HttpDirFs {
    links: Arc<LinkSystem>,
    cache: Option<Arc<CacheSystem>>,
    transfer: Arc<Transfer>,
    inode_to_path: HashMap<u64, String>,
    path_to_inode: HashMap<String, u64>,
    next_inode: u64,
    open_handles: HashMap<u64, Arc<Cache>>,
    next_fh: u64,
    uid: u32,
    gid: u32,
}

impl HttpDirFs {
    pub fn new(
        links: Arc<LinkSystem>,
        cache: Option<Arc<CacheSystem>>,
        transfer: Arc<Transfer>,
    ) -> Self {
        let mut fs = HttpDirFs {
            links,
            cache,
            transfer,
            inode_to_path: HashMap::new(),
            path_to_inode: HashMap::new(),
            next_inode: ROOT_INO + 1,
            open_handles: HashMap::new(),
            next_fh: 1,
            uid: unsafe { libc::getuid() },
            gid: unsafe { libc::getgid() },
        };
        fs.inode_to_path.insert(ROOT_INO, "/".to_string());
        fs.path_to_inode.insert("/".to_string(), ROOT_INO);
        fs
    }

    fn inode_for(&mut self, path: &str) -> u64 {
        if let Some(&ino) = self.path_to_inode.get(path) {
            return ino;
        }
        let ino = self.next_inode;
        self.next_inode += 1;
        self.path_to_inode.insert(path.to_string(), ino);
        self.inode_to_path.insert(ino, path.to_string());
        ino
    }

    fn root_attr(&self) -> FileAttr {
        FileAttr {
            ino: ROOT_INO,
            size: 0,
            blocks: 0,
            atime: UNIX_EPOCH,
            mtime: UNIX_EPOCH,
            ctime: UNIX_EPOCH,
            crtime: UNIX_EPOCH,
            kind: FileType::Directory,
            perm: 0o755,
            nlink: 1,
            uid: self.uid,
            gid: self.gid,
            rdev: 0,
            blksize: 128 * 1024,
            flags: 0,
        }
    }

    /// Map a resolved link onto stat attributes. Invalid and unprobed
    /// entries do not exist as far as the kernel is concerned.
    fn attr_for(&self, ino: u64, info: &LinkInfo) -> Option<FileAttr> {
        let mtime = UNIX_EPOCH + Duration::from_secs(info.time.max(0) as u64);
        let mut attr = self.root_attr();
        attr.ino = ino;
        attr.mtime = mtime;
        match info.kind {
            LinkKind::Dir => Some(attr),
            LinkKind::File => {
                attr.kind = FileType::RegularFile;
                attr.perm = 0o444;
                attr.size = info.content_length;
                attr.blocks = info.content_length / 512;
                Some(attr)
            }
            _ => None,
        }
    }

    /// Serve a read through the cache, one segment per iteration.
    fn cached_read(&self, cache: &Arc<Cache>, offset: u64, size: usize) -> Vec<u8> {
        let len = cache.content_length();
        if offset >= len {
            return Vec::new();
        }
        let want = size.min((len - offset) as usize);
        let mut buf = vec![0u8; want];
        let mut filled = 0usize;
        while filled < want {
            match cache.read(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) => {
                    tracing::warn!("[fs] cache read failed: {}", e);
                    break;
                }
            }
        }
        buf.truncate(filled);
        buf
    }

    /// Serve a read with a direct ranged download, bypassing the cache.
    fn direct_read(&self, info: &LinkInfo, offset: u64, size: usize) -> Vec<u8> {
        if offset >= info.content_length {
            return Vec::new();
        }
        let end = (offset + size as u64).min(info.content_length);
        match self.transfer.get_range(&info.f_url, offset, end) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!("[fs] cannot download {}: {}", info.f_url, e);
                Vec::new()
            }
        }
    }
}

impl Filesystem for HttpDirFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), libc::c_int> {
        Ok(())
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = name.to_str() else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(parent_path) = self.inode_to_path.get(&parent).cloned() else {
            reply.error(libc::ENOENT);
            return;
        };
        let path = path_append(&parent_path, name);
        let Some(info) = self.links.resolve(&path) else {
            reply.error(libc::ENOENT);
            return;
        };
        let ino = self.inode_for(&path);
        match self.attr_for(ino, &info) {
            Some(attr) => reply.entry(&TTL, &attr, 0),
            None => reply.error(libc::ENOENT),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        if ino == ROOT_INO {
            reply.attr(&TTL, &self.root_attr());
            return;
        }
        let Some(path) = self.inode_to_path.get(&ino).cloned() else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.links.resolve(&path).and_then(|info| self.attr_for(ino, &info)) {
            Some(attr) => reply.attr(&TTL, &attr),
            None => reply.error(libc::ENOENT),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let Some(path) = self.inode_to_path.get(&ino).cloned() else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(children) = self.links.list_dir(&path) else {
            tracing::debug!("[fs] readdir: no listing for {}", path);
            reply.error(libc::ENOENT);
            return;
        };

        let parent_ino = if ino == ROOT_INO {
            ROOT_INO
        } else {
            let parent_path = match path.rfind('/') {
                Some(0) | None => "/".to_string(),
                Some(p) => path[..p].to_string(),
            };
            self.inode_for(&parent_path)
        };
        let mut entries: Vec<(u64, FileType, String)> = vec![
            (ino, FileType::Directory, ".".to_string()),
            (parent_ino, FileType::Directory, "..".to_string()),
        ];
        for child in children {
            let kind = match child.kind {
                LinkKind::Dir => FileType::Directory,
                LinkKind::File => FileType::RegularFile,
                _ => continue,
            };
            let child_path = path_append(&path, &child.name);
            let child_ino = self.inode_for(&child_path);
            entries.push((child_ino, kind, child.name));
        }

        for (i, (ino, kind, name)) in entries.iter().enumerate().skip(offset as usize) {
            if reply.add(*ino, (i + 1) as i64, *kind, name) {
                break;
            }
        }
        reply.ok();
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        if write_access_requested(flags) {
            reply.error(libc::EROFS);
            return;
        }
        let Some(path) = self.inode_to_path.get(&ino).cloned() else {
            reply.error(libc::ENOENT);
            return;
        };
        let Some(info) = self.links.resolve(&path) else {
            reply.error(libc::ENOENT);
            return;
        };
        if info.kind != LinkKind::File {
            reply.error(libc::ENOENT);
            return;
        }

        let Some(cache_sys) = &self.cache else {
            reply.opened(0, 0);
            return;
        };
        // The link clearly exists; a cache that cannot be opened is deleted
        // and built from scratch before giving up.
        let handle = cache_sys.open(&path, &info).or_else(|| {
            cache_sys.delete(&path);
            if let Err(e) = cache_sys.create(&path, &info) {
                tracing::warn!("[fs] cache creation failed for {}: {}", path, e);
                return None;
            }
            cache_sys.open(&path, &info)
        });
        match handle {
            Some(cache) => {
                let fh = self.next_fh;
                self.next_fh += 1;
                self.open_handles.insert(fh, cache);
                reply.opened(fh, 0);
            }
            None => {
                tracing::warn!("[fs] cache file creation failure for {}", path);
                reply.error(libc::ENOENT);
            }
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let offset = offset.max(0) as u64;
        let size = size as usize;

        if let Some(cache) = self.open_handles.get(&fh).cloned() {
            let data = self.cached_read(&cache, offset, size);
            reply.data(&data);
            return;
        }

        let Some(path) = self.inode_to_path.get(&ino).cloned() else {
            reply.error(libc::ENOENT);
            return;
        };
        match self.links.resolve(&path) {
            Some(info) if info.kind == LinkKind::File => {
                let data = self.direct_read(&info, offset, size);
                reply.data(&data);
            }
            _ => reply.error(libc::ENOENT),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        if let Some(cache) = self.open_handles.remove(&fh) {
            if let Some(cache_sys) = &self.cache {
                cache_sys.close(&cache);
            }
        }
        reply.ok();
    }
}

/// Any access mode other than read-only is refused on this filesystem.
pub fn write_access_requested(flags: i32) -> bool {
    flags & libc::O_ACCMODE != libc::O_RDONLY
}

/// Translate `-o` strings into typed mount options; unknown ones pass
/// through verbatim. The filesystem itself is always read-only.
pub fn mount_options(raw: &[String]) -> Vec<MountOption> {
    let mut opts = vec![
        MountOption::RO,
        MountOption::FSName("httpdirfs".to_string()),
    ];
    for group in raw {
        for opt in group.split(',').filter(|s| !s.is_empty()) {
            opts.push(parse_mount_option(opt));
        }
    }
    opts
}

fn parse_mount_option(opt: &str) -> MountOption {
    match opt {
        "allow_other" => MountOption::AllowOther,
        "allow_root" => MountOption::AllowRoot,
        "auto_unmount" => MountOption::AutoUnmount,
        "default_permissions" => MountOption::DefaultPermissions,
        "ro" => MountOption::RO,
        "noexec" => MountOption::NoExec,
        "nosuid" => MountOption::NoSuid,
        "nodev" => MountOption::NoDev,
        "noatime" => MountOption::NoAtime,
        _ => {
            if let Some(name) = opt.strip_prefix("fsname=") {
                MountOption::FSName(name.to_string())
            } else if let Some(subtype) = opt.strip_prefix("subtype=") {
                MountOption::Subtype(subtype.to_string())
            } else {
                MountOption::CUSTOM(opt.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_read_only_opens_are_allowed() {
        assert!(!write_access_requested(libc::O_RDONLY));
        assert!(write_access_requested(libc::O_WRONLY));
        assert!(write_access_requested(libc::O_RDWR));
        assert!(!write_access_requested(libc::O_RDONLY | libc::O_NONBLOCK));
    }

    #[test]
    fn mount_options_parse_typed_and_custom() {
        let opts = mount_options(&["allow_other,fsname=remote".to_string(), "weird".to_string()]);
        assert!(opts.contains(&MountOption::RO));
        assert!(opts.contains(&MountOption::AllowOther));
        assert!(opts.contains(&MountOption::FSName("remote".to_string())));
        assert!(opts.contains(&MountOption::CUSTOM("weird".to_string())));
    }
}

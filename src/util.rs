use percent_encoding::percent_decode_str;

/// Maximum length of a path or a URL. Matches the Ext4 path limit.
pub const MAX_PATH_LEN: usize = 4096;

/// Maximum length of a single file name. Matches the Ext4 name limit.
pub const MAX_FILENAME_LEN: usize = 255;

/// Join a path with the next level, taking the trailing slash of the upper
/// level into account. The result is truncated at `MAX_PATH_LEN`.
pub fn path_append(path: &str, name: &str) -> String {
    let mut out = String::with_capacity(path.len() + name.len() + 1);
    out.push_str(path);
    match (path.ends_with('/'), name.starts_with('/')) {
        (true, true) => {
            out.pop();
        }
        (false, false) => out.push('/'),
        _ => {}
    }
    out.push_str(name);
    truncate_at_boundary(&mut out, MAX_PATH_LEN);
    out
}

/// Percent-decode a link name as served in an HTML index page.
pub fn unescape(s: &str) -> String {
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}

/// Truncate a string to at most `max` bytes without splitting a UTF-8
/// character.
pub fn truncate_at_boundary(s: &mut String, max: usize) {
    if s.len() <= max {
        return;
    }
    let mut cut = max;
    while !s.is_char_boundary(cut) {
        cut -= 1;
    }
    s.truncate(cut);
}

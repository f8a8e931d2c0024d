//! `LIST` and `MLSD` output.
//!
//! `LIST` lines follow the `ls -l` layout most FTP clients parse:
//!
//! ```text
//! drwxrwxrwx   3 1000     1000            0 Jan 05 14:02 reports
//! -rw-rw-rw-   1 1000     1000         4096 Mar 17  2023 old.csv
//! ```
//!
//! Entries older than six months show the year instead of the time.
//! `MLSD` lines are RFC 3659 fact lists. Times are rendered in UTC unless
//! the filesystem was configured for local time.

use blobftp_core::{FileNode, NodeKind, join_path, split_path};
use chrono::{DateTime, Local, Utc};

use crate::error::{FsError, FsResult, Reply};
use crate::filesystem::{PSEUDO_ID, StorageFs};

/// Age after which `LIST` shows the year rather than the time of day.
pub const SIX_MONTHS: i64 = 180 * 24 * 60 * 60;

/// `ls -l` style mode string derived from the capability letters.
///
/// `r` grants read, `w` grants write, and on directories `e` grants
/// search (`x`).
pub fn unix_mode(node: &FileNode) -> String {
    let read = node.permission.contains('r') || (node.is_dir && node.permission.contains('l'));
    let write = node.permission.contains('w');
    let search = node.is_dir && node.permission.contains('e');

    let mut mode = String::with_capacity(10);
    mode.push(if node.is_dir { 'd' } else { '-' });
    for _ in 0..3 {
        mode.push(if read { 'r' } else { '-' });
        mode.push(if write { 'w' } else { '-' });
        mode.push(if search { 'x' } else { '-' });
    }
    mode
}

fn render_time(mtime: i64, format: &str, use_gmt: bool) -> String {
    let utc = DateTime::<Utc>::from_timestamp(mtime, 0).unwrap_or_default();
    if use_gmt {
        utc.format(format).to_string()
    } else {
        utc.with_timezone(&Local).format(format).to_string()
    }
}

/// One `LIST` line, CRLF-terminated. `now` is in seconds since the epoch.
pub fn format_list_line(node: &FileNode, now: i64, use_gmt: bool) -> String {
    let format = if now - node.mtime > SIX_MONTHS {
        "%b %d  %Y"
    } else {
        "%b %d %H:%M"
    };
    format!(
        "{} {:>3} {:<8} {:<8} {:>8} {} {}\r\n",
        unix_mode(node),
        node.links,
        PSEUDO_ID,
        PSEUDO_ID,
        node.size,
        render_time(node.mtime, format, use_gmt),
        node.name
    )
}

/// One `MLSD` line, CRLF-terminated.
pub fn format_mlsd_line(node: &FileNode, use_gmt: bool) -> String {
    let kind = if node.is_dir { "dir" } else { "file" };
    format!(
        "type={kind};size={};perm={};modify={};owner={PSEUDO_ID};group={PSEUDO_ID};unique=0g{:x}; {}\r\n",
        node.size,
        node.permission,
        render_time(node.mtime, "%Y%m%d%H%M%S", use_gmt),
        node.id.0,
        node.name
    )
}

/// Fill in a file's size, which may need the backend. Directories and
/// every mtime are shown as cached. Returns `None` if the node disappeared
/// meanwhile.
async fn hydrate(fs: &StorageFs, path: &str, mut node: FileNode) -> FsResult<Option<FileNode>> {
    if node.is_dir {
        return Ok(Some(node));
    }
    match fs.get_size(path).await {
        Ok(size) => node.size = size,
        Err(e) if e.is_not_found() => return Ok(None),
        Err(e) => return Err(e),
    }
    Ok(Some(node))
}

async fn hydrated_children(fs: &StorageFs, segments: &[String]) -> FsResult<Vec<FileNode>> {
    let mut out = Vec::new();
    for child in fs.list_entries(&join_path(segments))? {
        let mut child_path = segments.to_vec();
        child_path.push(child.name.clone());
        if let Some(node) = hydrate(fs, &join_path(&child_path), child).await? {
            out.push(node);
        }
    }
    Ok(out)
}

/// Lines for a `LIST` of `path`: a directory's children, or the file
/// itself. A missing path is `NotFound` (reply 550).
pub async fn list_command(fs: &StorageFs, path: &str, now: i64) -> FsResult<Vec<String>> {
    let segments = split_path(path);
    let node = fs.meta().resolve(&segments)?;
    let entries = if node.is_dir {
        hydrated_children(fs, &segments).await?
    } else {
        hydrate(fs, &join_path(&segments), node)
            .await?
            .into_iter()
            .collect()
    };
    Ok(entries
        .iter()
        .map(|n| format_list_line(n, now, fs.use_gmt_times()))
        .collect())
}

/// Lines for an `MLSD` of `path`, which must be a directory.
pub async fn mlsd_command(fs: &StorageFs, path: &str) -> FsResult<Vec<String>> {
    let segments = split_path(path);
    if !fs.meta().is_directory(&segments) {
        return Err(FsError::TypeMismatch {
            path: join_path(&segments),
            expected: NodeKind::Directory,
        });
    }
    Ok(hydrated_children(fs, &segments)
        .await?
        .iter()
        .map(|n| format_mlsd_line(n, fs.use_gmt_times()))
        .collect())
}

/// Reply for a failed `MLSD`; a non-directory target answers 501.
pub fn mlsd_failure_reply(err: &FsError) -> Reply {
    match err {
        FsError::TypeMismatch { .. } => Reply::new(501, "No such directory."),
        other => other.reply(),
    }
}

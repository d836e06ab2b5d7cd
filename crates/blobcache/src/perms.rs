//! Explicit permission handling for files and directories the cache creates
//!
//! Several user accounts may share one cache directory, so everything the
//! cache creates is made group-writable. Modes are passed explicitly instead
//! of adjusting the process umask.

use crate::{Error, Result};
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

/// Permission bits applied to newly created cache paths
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateMode {
    /// Mode for directories the cache creates
    pub dir: u32,
    /// Mode for writable files (registry, audit log)
    pub file: u32,
    /// Mode for committed cache entries
    pub readonly: u32,
}

impl CreateMode {
    /// Group-cooperative defaults for caches shared between accounts
    pub const SHARED: Self = Self {
        dir: 0o775,
        file: 0o664,
        readonly: 0o444,
    };
}

impl Default for CreateMode {
    fn default() -> Self {
        Self::SHARED
    }
}

/// Create `path` and any missing parents, applying `mode` to each directory
/// this call creates. Directories that already exist are left untouched.
pub fn create_dir_all(path: &Path, mode: u32) -> Result<()> {
    let mut missing = Vec::new();
    let mut cursor = Some(path);
    while let Some(dir) = cursor {
        if dir.as_os_str().is_empty() || dir.is_dir() {
            break;
        }
        missing.push(dir);
        cursor = dir.parent();
    }

    for dir in missing.into_iter().rev() {
        match fs::create_dir(dir) {
            Ok(()) => set_mode(dir, mode)?,
            // Another process created it first
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(Error::io(e, dir, "create_dir")),
        }
    }
    Ok(())
}

/// Set the permission bits of `path`
#[cfg(unix)]
pub fn set_mode(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .map_err(|e| Error::io(e, path, "set_permissions"))
}

/// Set the permission bits of `path`
///
/// Only the owner write bit is meaningful off unix; it maps to the read-only flag.
#[cfg(not(unix))]
pub fn set_mode(path: &Path, mode: u32) -> Result<()> {
    let mut perms = fs::metadata(path)
        .map_err(|e| Error::io(e, path, "metadata"))?
        .permissions();
    perms.set_readonly(mode & 0o200 == 0);
    fs::set_permissions(path, perms).map_err(|e| Error::io(e, path, "set_permissions"))
}

/// Append `line` to `path`, creating the file if needed
///
/// The file is given `mode` when this user owns it. Only the owner may chmod;
/// other accounts sharing the cache just append.
pub fn append_line(path: &Path, line: &str, mode: u32) -> Result<()> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| file.write_all(line.as_bytes()))
        .map_err(|e| Error::io(e, path, "append"))?;

    if owned_by_current_user(path)? {
        set_mode(path, mode)?;
    }
    Ok(())
}

/// Whether the current user owns `path`
#[cfg(unix)]
pub fn owned_by_current_user(path: &Path) -> Result<bool> {
    use std::os::unix::fs::MetadataExt;
    let meta = fs::metadata(path).map_err(|e| Error::io(e, path, "metadata"))?;
    Ok(meta.uid() == current_uid())
}

/// Whether the current user owns `path`
#[cfg(not(unix))]
pub fn owned_by_current_user(_path: &Path) -> Result<bool> {
    Ok(true)
}

/// Set-group-id bit; directories created below inherit the directory's group
pub const SETGID: u32 = 0o2000;

const MAX_GROUP_BUFFER: usize = 1 << 20;

/// Hand a freshly created cache root to `group` so every account in it can share the cache
///
/// `group` is a group name or a numeric id. The root gets `dir_mode` plus
/// [`SETGID`] so subdirectories stay in the group.
#[cfg(unix)]
pub fn share_with_group(root: &Path, group: &str, dir_mode: u32) -> Result<()> {
    let gid = group_id(group)?;
    std::os::unix::fs::chown(root, None, Some(gid)).map_err(|e| Error::io(e, root, "chown"))?;
    set_mode(root, dir_mode | SETGID)?;
    tracing::debug!(root = %root.display(), group, gid, "Assigned cache group");
    Ok(())
}

/// Hand a freshly created cache root to `group`
///
/// Groups are a unix concept; elsewhere this only logs.
#[cfg(not(unix))]
pub fn share_with_group(root: &Path, group: &str, _dir_mode: u32) -> Result<()> {
    tracing::warn!(root = %root.display(), group, "Cache groups are not supported on this platform");
    Ok(())
}

/// Resolve a group name or numeric id to a gid
#[cfg(unix)]
pub fn group_id(group: &str) -> Result<u32> {
    if let Ok(gid) = group.parse::<u32>() {
        return Ok(gid);
    }
    let name = std::ffi::CString::new(group)
        .map_err(|_| Error::configuration(format!("invalid group name {group:?}")))?;

    let mut buf: Vec<libc::c_char> = vec![0; 1024];
    loop {
        match lookup_gid(&name, &mut buf) {
            Ok(Some(gid)) => return Ok(gid),
            Ok(None) => {
                return Err(Error::configuration(format!("unknown cache group {group:?}")));
            }
            Err(code) if code == libc::ERANGE && buf.len() < MAX_GROUP_BUFFER => {
                buf.resize(buf.len() * 2, 0);
            }
            Err(code) => {
                return Err(Error::configuration(format!(
                    "cannot resolve cache group {group:?}: {}",
                    io::Error::from_raw_os_error(code)
                )));
            }
        }
    }
}

#[cfg(unix)]
fn lookup_gid(
    name: &std::ffi::CStr,
    buf: &mut [libc::c_char],
) -> std::result::Result<Option<u32>, i32> {
    let mut group = std::mem::MaybeUninit::<libc::group>::uninit();
    let mut found: *mut libc::group = std::ptr::null_mut();
    // SAFETY: every pointer refers to storage owned by this frame and `buf.len()`
    // is the real buffer size. `found` is only read after getgrnam_r reports
    // success with a non-null entry, in which case it points at `group`.
    #[expect(unsafe_code, reason = "Required to resolve a group name")]
    unsafe {
        match libc::getgrnam_r(
            name.as_ptr(),
            group.as_mut_ptr(),
            buf.as_mut_ptr(),
            buf.len(),
            &raw mut found,
        ) {
            0 if found.is_null() => Ok(None),
            0 => Ok(Some((*found).gr_gid)),
            code => Err(code),
        }
    }
}

#[cfg(unix)]
fn current_uid() -> u32 {
    // SAFETY: getuid takes no arguments, cannot fail, and touches no memory.
    #[expect(unsafe_code, reason = "Required to read the real user id")]
    unsafe {
        libc::getuid()
    }
}

use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Suffix appended to a resource path to get its owner marker
pub const OWNER_MARKER_SUFFIX: &str = ".owner";

/// Get the path to the owner marker file for a given resource
///
/// The suffix is appended to the full file name, so `clip.mp4` maps to
/// `clip.mp4.owner` rather than replacing the extension.
pub fn owner_marker_path(file_path: &Path) -> PathBuf {
    let mut raw: OsString = file_path.as_os_str().to_owned();
    raw.push(OWNER_MARKER_SUFFIX);
    PathBuf::from(raw)
}

/// Read the principal recorded in the owner marker of `file_path`
pub fn read_owner_marker(file_path: &Path) -> io::Result<String> {
    fs::read_to_string(owner_marker_path(file_path))
}

/// Create the owner marker for `file_path` and write `owner` into it
///
/// Creation is exclusive: if a marker already exists this fails with
/// `io::ErrorKind::AlreadyExists` without touching it. A marker that was
/// created but could not be fully written is removed again before the
/// error is returned, so an empty or truncated marker is never left behind.
pub fn create_owner_marker(file_path: &Path, owner: &str) -> io::Result<()> {
    let marker = owner_marker_path(file_path);

    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&marker)?;

    fill_marker(&marker, file, owner, |file| file.sync_all())
}

/// Write `owner` into the just-created `marker`, then `finalize` it
///
/// The marker is removed again if either step fails.
fn fill_marker<W: Write>(
    marker: &Path,
    mut writer: W,
    owner: &str,
    finalize: impl FnOnce(&W) -> io::Result<()>,
) -> io::Result<()> {
    let written = writer
        .write_all(owner.as_bytes())
        .and_then(|()| finalize(&writer));
    drop(writer);

    if let Err(e) = written {
        let _ = fs::remove_file(marker);
        return Err(e);
    }

    Ok(())
}

/// Remove the owner marker of `file_path`
pub fn remove_owner_marker(file_path: &Path) -> io::Result<()> {
    fs::remove_file(owner_marker_path(file_path))
}

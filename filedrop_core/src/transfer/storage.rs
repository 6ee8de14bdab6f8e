use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::info;

use super::CompletedFile;
use super::constants::MAX_FILENAME_LENGTH;

const FALLBACK_NAME: &str = "unknown_file";

/// Windows device names, refused on every platform so a saved file can be
/// copied anywhere.
const RESERVED_NAMES: [&str; 22] = [
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Largest char boundary at or below `max`
fn floor_char_boundary(s: &str, max: usize) -> usize {
    let mut cutoff = max.min(s.len());
    while !s.is_char_boundary(cutoff) {
        cutoff -= 1;
    }
    cutoff
}

/// Reduce a peer-supplied name to a single safe path component.
pub fn sanitize_file_name(file_name: &str) -> String {
    // Directories are dropped, whichever separator the peer used
    let last = file_name.rsplit(['/', '\\']).next().unwrap_or_default();

    let mut clean: String = last.chars().filter(|c| !c.is_control()).collect();

    if clean == "."
        || clean == ".."
        || clean.trim().is_empty()
        || RESERVED_NAMES.iter().any(|r| clean.eq_ignore_ascii_case(r))
    {
        return FALLBACK_NAME.to_string();
    }

    if clean.len() > MAX_FILENAME_LENGTH {
        match clean.rfind('.') {
            // Keep short extensions intact
            Some(idx) if clean.len() - idx < 20 => {
                let ext = clean[idx..].to_string();
                let cutoff = floor_char_boundary(&clean[..idx], MAX_FILENAME_LENGTH - ext.len());
                clean.truncate(cutoff);
                clean.push_str(&ext);
            }
            _ => {
                let cutoff = floor_char_boundary(&clean, MAX_FILENAME_LENGTH);
                clean.truncate(cutoff);
            }
        }
    }

    clean
}

/// `report.pdf` -> `report (1).pdf`
fn numbered_name(name: &str, n: usize) -> String {
    match name.rfind('.') {
        Some(idx) if idx > 0 => format!("{} ({}){}", &name[..idx], n, &name[idx..]),
        _ => format!("{} ({})", name, n),
    }
}

/// Create a new file readable only by the owner on Unix. Fails if the
/// path already exists.
pub async fn open_secure_file(path: &Path) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);
    options.open(path).await
}

/// Write a received file into `dir` without overwriting anything there.
/// Returns the path written.
pub async fn save_completed_file(dir: &Path, file: &CompletedFile) -> std::io::Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    let name = sanitize_file_name(&file.entry.name);

    let mut n = 0;
    let (path, mut out) = loop {
        let candidate = if n == 0 {
            dir.join(&name)
        } else {
            dir.join(numbered_name(&name, n))
        };
        match open_secure_file(&candidate).await {
            Ok(out) => break (candidate, out),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => n += 1,
            Err(e) => return Err(e),
        }
    };

    out.write_all(&file.data).await?;
    out.flush().await?;
    info!("Saved {} to {:?}", file.entry.name, path);
    Ok(path)
}

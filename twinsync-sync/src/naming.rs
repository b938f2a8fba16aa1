//! Names given to items moved aside by conflict handling or rescue.

use chrono::Utc;
use rand::Rng;
use rand::distributions::Alphanumeric;
use twinsync_types::SyncName;

/// Splits `name` into stem and extension (with its dot). Directories and
/// dot-files have no extension.
pub fn split_extension(name: &str, is_dir: bool) -> (&str, &str) {
    if is_dir {
        return (name, "");
    }
    match name.rfind('.') {
        Some(index) if index > 0 => name.split_at(index),
        _ => (name, ""),
    }
}

/// `report.pdf` becomes `report<suffix>20240131_235959_Ab3dE5fG7h.pdf`.
pub fn conflict_name(name: &str, suffix: &str, is_dir: bool) -> SyncName {
    let (stem, ext) = split_extension(name, is_dir);
    let stamp = Utc::now().format("%Y%m%d_%H%M%S");
    let random: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(10)
        .map(char::from)
        .collect();
    SyncName::new(&format!("{stem}{suffix}{stamp}_{random}{ext}"))
}

/// `name` for attempt 0, then `stem (n).ext`.
pub fn numbered_name(name: &str, attempt: u32, is_dir: bool) -> String {
    if attempt == 0 {
        return name.to_string();
    }
    let (stem, ext) = split_extension(name, is_dir);
    format!("{stem} ({attempt}){ext}")
}

use std::fs;
use std::path::Path;

use chrono::{DateTime, Utc};

use crate::Error;

/// One `LIST` line: mode, links, uid, gid, size, mtime, basename.
/// Numeric columns are right-justified and all columns are joined by two
/// spaces.
pub fn file_property(path: &Path) -> Result<String, Error> {
    let meta = fs::metadata(path)
        .map_err(|err| Error::Filesystem(format!("Couldn't stat {}: {err}.", path.display())))?;

    let mtime = meta
        .modified()
        .map(|time| DateTime::<Utc>::from(time).format("%b %d %H:%M").to_string())
        .unwrap_or_default();

    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned());

    let (mode, nlink, uid, gid) = ownership(&meta);

    Ok(format!(
        "{}  {:>4}  {:>4}  {:>4}  {:>12}  {:>12}  {}",
        mode,
        nlink,
        uid,
        gid,
        meta.len(),
        mtime,
        name
    ))
}

#[cfg(unix)]
fn ownership(meta: &fs::Metadata) -> (String, u64, u32, u32) {
    use std::os::unix::fs::MetadataExt;

    (mode_string(meta.mode(), meta.is_dir()), meta.nlink(), meta.uid(), meta.gid())
}

// hosts without unix metadata get stable substitutes instead of a failure
#[cfg(not(unix))]
fn ownership(meta: &fs::Metadata) -> (String, u64, u32, u32) {
    let kind = if meta.is_dir() { 'd' } else { '-' };

    (format!("{kind}---------"), 0, 0, 0)
}

#[cfg(unix)]
fn mode_string(mode: u32, is_dir: bool) -> String {
    let mut out = String::with_capacity(10);
    out.push(if is_dir { 'd' } else { '-' });

    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        out.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        out.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        out.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn mode_bits_render_like_ls() {
        assert_eq!(mode_string(0o755, true), "drwxr-xr-x");
        assert_eq!(mode_string(0o644, false), "-rw-r--r--");
        assert_eq!(mode_string(0o000, false), "----------");
        assert_eq!(mode_string(0o421, false), "-r---w---x");
    }

    #[cfg(unix)]
    #[test]
    fn lines_carry_seven_columns_and_the_basename_last() {
        use std::io::Write;

        let dir = std::env::temp_dir().join(format!("rftp-list-{}", std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        let file = dir.join("entry.txt");
        let mut handle = fs::File::create(&file).unwrap();
        handle.write_all(b"twelve bytes").unwrap();
        drop(handle);

        let line = file_property(&file).unwrap();
        let columns: Vec<&str> = line.split("  ").filter(|part| !part.is_empty()).collect();

        assert_eq!(columns.len(), 7);
        assert_eq!(columns[0].len(), 10);
        assert!(columns[0].starts_with('-'));
        assert_eq!(columns[4].trim(), "12");
        assert_eq!(columns[6], "entry.txt");

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn missing_paths_surface_a_filesystem_error() {
        let missing = Path::new("/definitely/not/here");

        assert!(matches!(file_property(missing), Err(Error::Filesystem(_))));
    }
}

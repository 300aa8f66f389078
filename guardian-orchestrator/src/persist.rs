//! Durable JSON files shared by the file-backed stores.

use std::fs::{self, File};
use std::io::{self, BufWriter};
use std::path::Path;

use serde::Serialize;
use tokio::runtime::{Handle, RuntimeFlavor};

/// Write `value` as pretty JSON to `path` through a temp file, fsync and
/// rename. On any error the previous file is left untouched.
pub(crate) fn write_json_atomic<T, E>(path: &Path, value: &T) -> Result<(), E>
where
    T: Serialize + ?Sized,
    E: From<io::Error> + From<serde_json::Error>,
{
    let temp_path = path.with_extension("tmp");
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut writer = BufWriter::new(File::create(&temp_path)?);
    serde_json::to_writer_pretty(&mut writer, value)?;
    // into_inner flushes; a failed flush must not reach the rename.
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;

    fs::rename(&temp_path, path)?;
    Ok(())
}

/// Run synchronous disk work from async code. On a multi-threaded runtime
/// the worker is handed off first so other tasks keep running.
pub(crate) fn blocking_io<R>(f: impl FnOnce() -> R) -> R {
    match Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashMap};
    use tempfile::TempDir;

    #[test]
    fn test_write_replaces_file_and_leaves_no_temp() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state.json");
        fs::write(&path, "old").unwrap();

        let value = BTreeMap::from([("a", 1u64)]);
        write_json_atomic::<_, io::Error>(&path, &value).unwrap();

        let read: BTreeMap<String, u64> = serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        assert_eq!(read.get("a"), Some(&1));
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn test_failed_write_keeps_previous_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("state.json");
        fs::write(&path, "{\"a\":1}").unwrap();

        // Non-string map keys fail halfway through serialization.
        let value = HashMap::from([((1u8, 2u8), 3u8)]);
        let result = write_json_atomic::<_, io::Error>(&path, &value);

        assert!(result.is_err());
        assert_eq!(fs::read_to_string(&path).unwrap(), "{\"a\":1}");
    }

    #[test]
    fn test_creates_missing_parent() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("state.json");
        write_json_atomic::<_, io::Error>(&path, &vec![1u8, 2]).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn test_blocking_io_outside_runtime() {
        assert_eq!(blocking_io(|| 7), 7);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_blocking_io_on_multi_thread_runtime() {
        assert_eq!(blocking_io(|| 7), 7);
    }

    #[tokio::test]
    async fn test_blocking_io_on_current_thread_runtime() {
        assert_eq!(blocking_io(|| 7), 7);
    }
}

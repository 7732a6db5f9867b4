//! Durable credential persistence.

use std::fs::File;
use std::io::Write;
use std::path::Path;

use crate::error::DeployError;

/// Write `contents` to `path` and flush it through to stable storage.
///
/// Credentials handed back by the pipeline must survive a crash right after
/// the run reports success, so this syncs the file before returning.
///
/// # Errors
///
/// Returns [`DeployError::Io`] with the offending path on any failure.
pub fn write_durable(path: &Path, contents: &str) -> Result<(), DeployError> {
    let io_err = |e| DeployError::io(path, e);
    let mut file = File::create(path).map_err(io_err)?;
    file.write_all(contents.as_bytes()).map_err(io_err)?;
    file.flush().map_err(io_err)?;
    file.sync_all().map_err(io_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    #[test]
    fn writes_and_overwrites() {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let path = std::env::temp_dir().join(format!("forge-persist-{nanos}"));

        write_durable(&path, "first").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first");

        write_durable(&path, "second").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn missing_parent_directory_reports_path() {
        let path = Path::new("/nonexistent-forge-dir/kubeconfig.yaml");
        let err = write_durable(path, "x").unwrap_err();
        assert!(err.to_string().contains("nonexistent-forge-dir"));
    }
}

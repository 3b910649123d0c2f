//! Exclusive claim on the capture device for the lifetime of the service.
//!
//! A pid file next to the recordings; a stale file left by a dead process
//! is taken over.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

pub struct DeviceReservation {
    path: PathBuf,
}

fn pid_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

impl DeviceReservation {
    pub fn acquire(path: &Path) -> Result<Self> {
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    writeln!(file, "{}", std::process::id())
                        .with_context(|| format!("Cannot write {}", path.display()))?;
                    info!("Device reserved ({})", path.display());
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let holder = std::fs::read_to_string(path)
                        .ok()
                        .and_then(|s| s.trim().parse::<u32>().ok());
                    match holder {
                        Some(pid) if pid != std::process::id() && pid_alive(pid) => {
                            bail!("Capture device already reserved by pid {pid} ({})", path.display());
                        }
                        _ => {
                            warn!("Removing stale reservation {}", path.display());
                            std::fs::remove_file(path).ok();
                        }
                    }
                }
                Err(e) => {
                    return Err(e).with_context(|| format!("Cannot create {}", path.display()));
                }
            }
        }
        bail!("Cannot reserve capture device ({})", path.display())
    }

    pub fn release(self) {
        // Drop does the work.
    }
}

impl Drop for DeviceReservation {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => info!("Device reservation released"),
            Err(e) => warn!("Cannot remove {}: {e}", self.path.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_fails_while_held() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("rewind.lock");
        let held = DeviceReservation::acquire(&path).unwrap();
        // Our own pid counts as stale, so fake a live holder: pid 1.
        std::fs::write(&path, "1\n").unwrap();
        assert!(DeviceReservation::acquire(&path).is_err());
        drop(held);
        assert!(!path.exists());
    }

    #[test]
    fn test_stale_reservation_is_taken_over() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("rewind.lock");
        std::fs::write(&path, "not-a-pid").unwrap();
        let r = DeviceReservation::acquire(&path).unwrap();
        let pid: u32 = std::fs::read_to_string(&path).unwrap().trim().parse().unwrap();
        assert_eq!(pid, std::process::id());
        r.release();
        assert!(!path.exists());
    }
}

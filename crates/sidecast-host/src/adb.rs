//! ADB reverse port-forward helper.
//!
//! A USB-attached tablet reaches the host through `adb reverse tcp:<port>
//! tcp:<port>` instead of Wi-Fi. Everything here is best-effort: a missing
//! binary or a failing command is logged and streaming proceeds over the
//! network path.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::{debug, info, warn};

pub struct AdbForwarder {
    binary: Option<PathBuf>,
}

impl AdbForwarder {
    /// Locate the adb binary (`$ANDROID_HOME`/`$ANDROID_SDK_ROOT`
    /// platform-tools first, then `$PATH`).
    pub fn locate() -> Self {
        let binary = find_binary();
        match &binary {
            Some(path) => info!("adb found at {}", path.display()),
            None => info!("adb not found — USB forwarding disabled"),
        }
        Self { binary }
    }

    pub fn is_available(&self) -> bool {
        self.binary.is_some()
    }

    /// `adb reverse tcp:<port> tcp:<port>`; true on success.
    pub async fn setup_reverse(&self, port: u16) -> bool {
        self.run(&["reverse".into(), format!("tcp:{port}"), format!("tcp:{port}")])
            .await
            .is_some()
    }

    /// `adb reverse --remove tcp:<port>`; true on success.
    pub async fn remove_reverse(&self, port: u16) -> bool {
        self.run(&["reverse".into(), "--remove".into(), format!("tcp:{port}")])
            .await
            .is_some()
    }

    /// Whether `adb devices` lists at least one attached device.
    pub async fn is_device_connected(&self) -> bool {
        match self.run(&["devices".into()]).await {
            Some(output) => parse_device_count(&output) > 0,
            None => false,
        }
    }

    async fn run(&self, args: &[String]) -> Option<String> {
        let binary = self.binary.as_ref()?;
        let output = Command::new(binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await;
        match output {
            Ok(output) if output.status.success() => {
                Some(String::from_utf8_lossy(&output.stdout).into_owned())
            }
            Ok(output) => {
                warn!(
                    "adb {:?} failed: {}",
                    args,
                    String::from_utf8_lossy(&output.stderr).trim()
                );
                None
            }
            Err(e) => {
                warn!("adb {:?} could not run: {}", args, e);
                None
            }
        }
    }
}

/// Search the usual locations for the adb binary.
pub fn find_binary() -> Option<PathBuf> {
    for var in ["ANDROID_HOME", "ANDROID_SDK_ROOT"] {
        if let Ok(sdk) = std::env::var(var) {
            let candidate = Path::new(&sdk).join("platform-tools").join(adb_name());
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }
    let path = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(adb_name());
        if candidate.is_file() {
            debug!("adb candidate {}", candidate.display());
            return Some(candidate);
        }
    }
    None
}

fn adb_name() -> &'static str {
    if cfg!(windows) { "adb.exe" } else { "adb" }
}

/// Count `device`-state entries in `adb devices` output (skips the banner,
/// `unauthorized` and `offline` entries).
fn parse_device_count(output: &str) -> usize {
    output
        .lines()
        .skip(1)
        .filter(|line| {
            let mut fields = line.split_whitespace();
            matches!((fields.next(), fields.next()), (Some(_), Some("device")))
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_only_ready_devices() {
        let output = "List of devices attached\n\
                      R52M1234\tdevice\n\
                      emulator-5554\toffline\n\
                      0A3B\tunauthorized\n\n";
        assert_eq!(parse_device_count(output), 1);
    }

    #[test]
    fn empty_listing_has_no_devices() {
        assert_eq!(parse_device_count("List of devices attached\n\n"), 0);
    }
}

//! `ChangerDriver` implementation that shells out to the external robotic
//! control binary (conventionally `mtx`) and parses its textual status
//! output.

mod parse;

use std::process::Command;

use crate::changer::{ChangerDriver, MtxStatus};
use crate::error::MediaError;

fn run(command: &mut Command) -> Result<String, MediaError> {
    let output = command
        .output()
        .map_err(|err| MediaError::ChangerFailed(format!("failed to execute {command:?} - {err}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = if stderr.trim().is_empty() {
            "no error message".to_string()
        } else {
            stderr.trim().to_string()
        };
        return Err(MediaError::ChangerFailed(format!(
            "{command:?} failed: {stderr}"
        )));
    }

    String::from_utf8(output.stdout)
        .map_err(|err| MediaError::ChangerFailed(format!("non-utf8 output from {command:?} - {err}")))
}

/// Drives a changer through the `mtx` command-line tool at `binary`,
/// addressing the device at `device`.
pub struct MtxChanger {
    binary: String,
    device: String,
}

impl MtxChanger {
    pub fn new(device: impl Into<String>) -> Self {
        MtxChanger {
            binary: "mtx".to_string(),
            device: device.into(),
        }
    }

    /// Override the binary name/path, for tests that point at a stub script.
    pub fn with_binary(device: impl Into<String>, binary: impl Into<String>) -> Self {
        MtxChanger {
            binary: binary.into(),
            device: device.into(),
        }
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut command = Command::new(&self.binary);
        command.arg("-f").arg(&self.device);
        command.args(args);
        command
    }
}

impl ChangerDriver for MtxChanger {
    fn status(&mut self) -> Result<MtxStatus, MediaError> {
        let output = run(&mut self.command(&["status"]))?;
        parse::parse_status(&output).map_err(|err| MediaError::ChangerFailed(err.to_string()))
    }

    fn load(&mut self, slot: u64, drive_slot: u64) -> Result<(), MediaError> {
        run(&mut self.command(&["load", &slot.to_string(), &drive_slot.to_string()]))?;
        Ok(())
    }

    fn unload(&mut self, slot: u64, drive_slot: u64) -> Result<(), MediaError> {
        run(&mut self.command(&["unload", &slot.to_string(), &drive_slot.to_string()]))?;
        Ok(())
    }

    fn transfer(&mut self, from: u64, to: u64) -> Result<(), MediaError> {
        run(&mut self.command(&["transfer", &from.to_string(), &to.to_string()]))?;
        Ok(())
    }
}

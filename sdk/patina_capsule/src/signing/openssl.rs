//! Signer that shells out to an `openssl` executable.
//!
//! The executable is located through the `OPENSSL_PATH` environment variable when set, otherwise
//! `openssl` is resolved from `PATH`.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use std::{
    env,
    ffi::OsStr,
    io::Write,
    path::{Path, PathBuf},
    process::{Command, Output, Stdio},
};

use super::SigningCapability;
use crate::err::{CapsuleError, Result};

/// Environment variable naming the directory that contains the `openssl` executable.
pub const OPENSSL_PATH_ENV: &str = "OPENSSL_PATH";

/// Signs by invoking `openssl rsa` and `openssl dgst` against a PEM private key file.
#[derive(Debug, Clone)]
pub struct OpensslSigner {
    command: PathBuf,
    private_key: PathBuf,
}

impl OpensslSigner {
    /// Use `command` as the openssl executable.
    pub fn new(command: impl Into<PathBuf>, private_key: impl Into<PathBuf>) -> Self {
        Self { command: command.into(), private_key: private_key.into() }
    }

    /// Locate openssl through `OPENSSL_PATH`, falling back to `PATH`.
    pub fn from_env(private_key: impl Into<PathBuf>) -> Self {
        let command = match env::var_os(OPENSSL_PATH_ENV) {
            Some(dir) if !dir.is_empty() => Path::new(&dir).join("openssl"),
            _ => PathBuf::from("openssl"),
        };
        Self::new(command, private_key)
    }

    /// Path of the openssl executable in use.
    pub fn command(&self) -> &Path {
        &self.command
    }

    /// Run `openssl version` to confirm the executable is usable, returning its version string.
    pub fn version(&self) -> Result<String> {
        let output = self.run(["version"], None).map_err(|err| {
            log::error!("Open SSL command not available. Please verify PATH or set {OPENSSL_PATH_ENV}");
            err
        })?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn run<I, S>(&self, args: I, stdin: Option<&[u8]>) -> Result<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut child = Command::new(&self.command)
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| {
                log::error!("unable to run {}: {err}", self.command.display());
                CapsuleError::SigningFailed
            })?;

        if let (Some(data), Some(mut pipe)) = (stdin, child.stdin.take()) {
            pipe.write_all(data).map_err(|err| {
                log::error!("unable to pass data to {}: {err}", self.command.display());
                CapsuleError::SigningFailed
            })?;
        }

        let output = child.wait_with_output().map_err(|err| {
            log::error!("{} did not complete: {err}", self.command.display());
            CapsuleError::SigningFailed
        })?;

        if !output.status.success() {
            log::error!(
                "{} failed ({}): {}",
                self.command.display(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Err(CapsuleError::KeyError);
        }
        Ok(output)
    }
}

impl SigningCapability for OpensslSigner {
    fn derive_public_modulus(&self) -> Result<Vec<u8>> {
        let key = self.private_key.as_os_str();
        let args = [OsStr::new("rsa"), OsStr::new("-in"), key, OsStr::new("-modulus"), OsStr::new("-noout")];
        let output = self.run(args, None)?;
        parse_modulus(&String::from_utf8_lossy(&output.stdout))
    }

    fn sign_rsa2048_sha256(&self, data: &[u8]) -> Result<Vec<u8>> {
        let key = self.private_key.as_os_str();
        let output = self.run([OsStr::new("dgst"), OsStr::new("-sha256"), OsStr::new("-sign"), key], Some(data))?;
        Ok(output.stdout)
    }
}

/// Parse the `Modulus=<HEX>` line printed by `openssl rsa -modulus`.
fn parse_modulus(text: &str) -> Result<Vec<u8>> {
    let hex_digits = text
        .lines()
        .filter_map(|line| line.trim().split_once('='))
        .find_map(|(name, value)| (name.trim() == "Modulus").then(|| value.trim()))
        .ok_or_else(|| {
            log::error!("openssl did not report a modulus");
            CapsuleError::KeyError
        })?;
    hex::decode(hex_digits).map_err(|err| {
        log::error!("invalid modulus reported by openssl: {err}");
        CapsuleError::KeyError
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modulus_line_is_parsed() {
        assert_eq!(parse_modulus("Modulus=00C3FF10\n").unwrap(), [0x00, 0xc3, 0xff, 0x10]);
        assert_eq!(parse_modulus("writing RSA key\nModulus=abcd\n").unwrap(), [0xab, 0xcd]);
    }

    #[test]
    fn missing_or_invalid_modulus_is_key_error() {
        assert_eq!(parse_modulus(""), Err(CapsuleError::KeyError));
        assert_eq!(parse_modulus("Modulus=XYZ"), Err(CapsuleError::KeyError));
    }

    #[test]
    fn missing_executable_fails_signing() {
        let signer = OpensslSigner::new("/nonexistent/openssl", "key.pem");
        assert_eq!(signer.version(), Err(CapsuleError::SigningFailed));
        assert_eq!(signer.sign_rsa2048_sha256(b"data"), Err(CapsuleError::SigningFailed));
    }
}

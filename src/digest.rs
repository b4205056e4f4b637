//! Content/configuration fingerprinting.
//!
//! An MD5 accumulator fed with `update`, finalized, and rendered as a hex string.
//! [`Digester`] is a general accumulator so callers can fold in configuration
//! fragments incrementally before asking for the final digest, rather than hashing an
//! entire build's worth of input in one shot.

use md5::{Digest as _, Md5};
use std::{fs, io::Read, path::Path};

use crate::error::{EngineError, Result};

/// A fresh fingerprint accumulator, created via [`crate::BuildContext::new_digester`].
#[derive(Default)]
pub struct Digester {
    hasher: Md5,
}

impl Digester {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds `bytes` into the running digest.
    pub fn update(&mut self, bytes: &[u8]) -> &mut Self {
        self.hasher.update(bytes);
        self
    }

    /// Consumes the accumulator, returning the raw digest bytes.
    pub fn finish(self) -> Vec<u8> {
        self.hasher.finalize().to_vec()
    }

    /// Consumes the accumulator, returning the digest hex-encoded.
    pub fn finish_hex(self) -> String {
        hex::encode(self.finish())
    }

    /// Hashes a single byte slice in one shot.
    pub fn of_bytes(bytes: &[u8]) -> Vec<u8> {
        let mut digester = Self::new();
        digester.update(bytes);
        digester.finish()
    }

    /// Hashes the concatenated content of `files`, in order, in one shot.
    ///
    /// Missing files contribute no bytes (callers that need "file presence" as part
    /// of the digest should fold the path itself in as well).
    pub fn of_files<I, P>(files: I) -> Result<Vec<u8>>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut digester = Self::new();
        for path in files {
            let path = path.as_ref();
            let mut file = match fs::File::open(path) {
                Ok(file) => file,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(EngineError::io(err, path)),
            };
            let mut buf = Vec::new();
            file.read_to_end(&mut buf).map_err(|err| EngineError::io(err, path))?;
            digester.update(&buf);
        }
        Ok(digester.finish())
    }
}

/// Renders a digest as the lowercase hex string used in state-file names.
pub fn hex_digest(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

//! [`IncrementalOutputStream`]: a write-through-compare output sink.
//!
//! Generated output is byte-compared against what's already on disk as it is
//! written; the stream only actually rewrites the file from the first point of
//! divergence onward, so a generator that reproduces identical bytes never perturbs
//! the output file's mtime (and, downstream, never causes *its* consumers to be
//! considered dirty).

use std::{
    collections::BTreeSet,
    fs,
    io::{self, Read, Write},
    path::PathBuf,
    sync::{Arc, Mutex},
};

use crate::error::{EngineError, Result};
use crate::path_utils;

/// The modified/unmodified working sets a [`BuildContext`](crate::BuildContext)
/// reconciles at commit. Shared between the context and every stream it hands out, so
/// a stream's own close() can move its output between the two sets without needing a
/// second mutable reference back into the context.
#[derive(Debug, Default)]
pub(crate) struct OutputTracking {
    pub(crate) modified: BTreeSet<PathBuf>,
    pub(crate) unmodified: BTreeSet<PathBuf>,
}

impl OutputTracking {
    pub(crate) fn record(&mut self, path: PathBuf, modified: bool) {
        if modified {
            self.unmodified.remove(&path);
            self.modified.insert(path);
        } else {
            self.modified.remove(&path);
            self.unmodified.insert(path);
        }
    }
}

/// A write-through-compare handle for a single output file.
///
/// Must be [`close`](Self::close)d to take effect; dropping without closing leaves
/// any divergence buffered in a temp file that is never promoted into place. On
/// close, reports back to the shared [`OutputTracking`] (if any) whether the file's
/// content actually changed.
pub struct IncrementalOutputStream {
    path: PathBuf,
    tmp_path: PathBuf,
    file_existed: bool,
    existing_len: u64,
    existing_reader: Option<io::BufReader<fs::File>>,
    rewrite: Option<io::BufWriter<fs::File>>,
    pos: u64,
    diverged: bool,
    closed: bool,
    tracking: Option<Arc<Mutex<OutputTracking>>>,
}

impl IncrementalOutputStream {
    pub(crate) fn open(path: PathBuf, tracking: Option<Arc<Mutex<OutputTracking>>>) -> Result<Self> {
        let (file_existed, existing_len, existing_reader) = match fs::File::open(&path) {
            Ok(file) => {
                let len = file.metadata().map_err(|err| EngineError::io(err, &path))?.len();
                (true, len, Some(io::BufReader::new(file)))
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => (false, 0, None),
            Err(err) => return Err(EngineError::io(err, &path)),
        };
        let tmp_path = path_utils::tmp_sibling(&path);
        Ok(Self {
            path,
            tmp_path,
            file_existed,
            existing_len,
            existing_reader,
            rewrite: None,
            pos: 0,
            diverged: false,
            closed: false,
            tracking,
        })
    }

    /// Writes `bytes` at the current position, comparing against the existing file's
    /// content at that position until the first divergence.
    pub fn write(&mut self, bytes: &[u8]) -> Result<()> {
        if self.closed {
            return Err(EngineError::illegal_state("write after close on output stream"));
        }
        if bytes.is_empty() {
            return Ok(());
        }

        if !self.diverged {
            let matched = self
                .existing_reader
                .as_mut()
                .map(|reader| {
                    let mut buf = vec![0u8; bytes.len()];
                    reader.read_exact(&mut buf).is_ok() && buf == bytes
                })
                .unwrap_or(false);
            if matched {
                self.pos += bytes.len() as u64;
                return Ok(());
            }
            self.start_rewrite()?;
        }

        let writer = self.rewrite.as_mut().expect("rewrite writer present once diverged");
        writer.write_all(bytes).map_err(|err| EngineError::io(err, &self.tmp_path))?;
        self.pos += bytes.len() as u64;
        Ok(())
    }

    fn start_rewrite(&mut self) -> Result<()> {
        path_utils::create_parent_dir_all(&self.tmp_path)?;
        let mut tmp = fs::File::create(&self.tmp_path).map_err(|err| EngineError::io(err, &self.tmp_path))?;

        if self.pos > 0 {
            let mut prefix = fs::File::open(&self.path).map_err(|err| EngineError::io(err, &self.path))?;
            let mut remaining = self.pos;
            let mut buf = [0u8; 64 * 1024];
            while remaining > 0 {
                let n = (remaining as usize).min(buf.len());
                prefix.read_exact(&mut buf[..n]).map_err(|err| EngineError::io(err, &self.path))?;
                tmp.write_all(&buf[..n]).map_err(|err| EngineError::io(err, &self.tmp_path))?;
                remaining -= n as u64;
            }
        }

        self.rewrite = Some(io::BufWriter::new(tmp));
        self.existing_reader = None;
        self.diverged = true;
        Ok(())
    }

    /// Closes the stream, returning `true` if the output file's content changed.
    /// Idempotent: a second call returns the same verdict without side effects.
    pub fn close(&mut self) -> Result<bool> {
        if self.closed {
            return Ok(self.diverged || self.pos < self.existing_len || !self.file_existed);
        }
        self.closed = true;

        let modified = self.close_inner()?;
        if let Some(tracking) = &self.tracking {
            tracking.lock().expect("output tracking poisoned").record(self.path.clone(), modified);
        }
        Ok(modified)
    }

    fn close_inner(&mut self) -> Result<bool> {
        if self.diverged {
            let mut writer = self.rewrite.take().expect("rewrite writer present once diverged");
            writer.flush().map_err(|err| EngineError::io(err, &self.tmp_path))?;
            drop(writer);
            fs::rename(&self.tmp_path, &self.path).map_err(|err| EngineError::io(err, &self.path))?;
            return Ok(true);
        }

        if !self.file_existed {
            path_utils::create_parent_dir_all(&self.path)?;
            fs::File::create(&self.path).map_err(|err| EngineError::io(err, &self.path))?;
            return Ok(true);
        }

        if self.pos < self.existing_len {
            let file = fs::OpenOptions::new()
                .write(true)
                .open(&self.path)
                .map_err(|err| EngineError::io(err, &self.path))?;
            file.set_len(self.pos).map_err(|err| EngineError::io(err, &self.path))?;
            return Ok(true);
        }

        Ok(false)
    }
}

impl Drop for IncrementalOutputStream {
    fn drop(&mut self) {
        if !self.closed {
            let _ = path_utils::remove_file_if_exists(&self.tmp_path);
        }
    }
}

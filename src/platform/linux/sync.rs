use std::fs::File;
use std::io::{self, Read};
use std::os::fd::OwnedFd;

use anyhow::{bail, Context, Result};
use nix::fcntl::OFlag;
use nix::unistd::pipe2;

/// Single-use "go" signal from the runtime to its cloned child.
///
/// Both processes hold a copy after `clone`. The parent fires it with
/// [`ReleaseSignal::release`]; the child blocks in [`ReleaseSignal::wait`]
/// until every write end is gone. No payload is ever sent.
#[derive(Debug)]
pub struct ReleaseSignal {
    reader: File,
    writer: Option<OwnedFd>,
}

impl ReleaseSignal {
    pub fn new() -> Result<Self> {
        let (read, write) = pipe2(OFlag::O_CLOEXEC).context("failed to create sync pipe")?;
        Ok(Self {
            reader: File::from(read),
            writer: Some(write),
        })
    }

    /// Let the child proceed. Idempotent.
    pub fn release(&mut self) {
        self.writer.take();
    }

    /// Drop this process's write end and block until end-of-file.
    pub fn wait(&mut self) -> Result<()> {
        self.writer.take();
        let mut buf = [0u8; 1];
        loop {
            match self.reader.read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(_) => bail!("unexpected data on sync pipe"),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e).context("failed to read sync pipe"),
            }
        }
    }
}

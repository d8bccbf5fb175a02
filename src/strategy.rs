//! The two remote-transfer strategies.
//!
//! Archive-copy tars the tree on the source host, copies one archive, and
//! extracts at the destination: one compression round-trip buys fewer,
//! larger network writes. Direct-copy walks the remote listing and mirrors
//! file by file: one `mkdir`/`stat` of overhead per file, but progress
//! survives per file. Both run the same phase machine and report through
//! the same `ProgressSink`.

use std::collections::HashSet;
use std::io::{Read, Write};
use std::time::Instant;
use tracing::{error, info, warn};

use crate::config::Platform;
use crate::error::{Result, TransferError};
use crate::progress::{ProgressSample, ProgressSink};
use crate::ssh::{CommandOutput, RemoteEndpoint};

/// Phases of one transfer. FAILED is reachable from any non-terminal phase
/// by propagating an error out of `drive`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Created,
    Sizing,
    Staging,
    Copying,
    Finalizing,
    Done,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Created => "created",
            Phase::Sizing => "sizing",
            Phase::Staging => "staging",
            Phase::Copying => "copying",
            Phase::Finalizing => "finalizing",
            Phase::Done => "done",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    ArchiveCopy,
    DirectCopy,
}

impl StrategyKind {
    /// Strategy selection is a configuration decision keyed on the
    /// destination platform, never probed at runtime.
    pub fn for_platform(platform: Platform) -> Self {
        match platform {
            Platform::Linux => StrategyKind::ArchiveCopy,
            Platform::Windows => StrategyKind::DirectCopy,
        }
    }

    pub fn build(self, chunk_size: usize) -> Box<dyn TransferStrategy> {
        match self {
            StrategyKind::ArchiveCopy => Box::new(ArchiveCopy { chunk_size }),
            StrategyKind::DirectCopy => Box::new(DirectCopy { chunk_size }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOutcome {
    pub files: u64,
    pub bytes_transferred: u64,
    pub total_bytes: u64,
}

/// One full data-movement sequence between two already-open endpoints.
pub trait TransferStrategy: Send {
    fn kind(&self) -> StrategyKind;

    /// Implementation body. Call `run`, not this; `run` owns session
    /// teardown.
    fn drive(
        &self,
        source: &mut dyn RemoteEndpoint,
        dest: &mut dyn RemoteEndpoint,
        source_path: &str,
        dest_path: &str,
        sink: &dyn ProgressSink,
    ) -> Result<TransferOutcome>;

    /// Run the transfer. Both endpoint sessions are closed before any error
    /// propagates to the caller.
    fn run(
        &self,
        source: &mut dyn RemoteEndpoint,
        dest: &mut dyn RemoteEndpoint,
        source_path: &str,
        dest_path: &str,
        sink: &dyn ProgressSink,
    ) -> Result<TransferOutcome> {
        let result = self.drive(source, dest, source_path, dest_path, sink);
        source.close();
        dest.close();
        if let Err(e) = &result {
            error!(strategy = ?self.kind(), error = %e, "transfer failed");
        }
        result
    }
}

/// Single-quote a path for a remote shell command line.
fn shell_quote(path: &str) -> String {
    format!("'{}'", path.replace('\'', r"'\''"))
}

/// First whitespace-delimited token of a size command's stdout, as bytes.
fn parse_size(stdout: &str) -> Result<u64> {
    let token = stdout
        .split_whitespace()
        .next()
        .ok_or_else(|| TransferError::SizeQuery("empty output".into()))?;
    token
        .parse::<u64>()
        .map_err(|_| TransferError::SizeQuery(format!("non-numeric size output: {token:?}")))
}

fn query_size(ep: &mut dyn RemoteEndpoint, command: String) -> Result<u64> {
    let out = ep.run(&command)?;
    if !out.success() {
        return Err(TransferError::SizeQuery(remote_failure(&out)));
    }
    parse_size(&out.stdout)
}

fn tree_size(ep: &mut dyn RemoteEndpoint, path: &str) -> Result<u64> {
    query_size(ep, format!("du -sb {}", shell_quote(path)))
}

fn file_size(ep: &mut dyn RemoteEndpoint, path: &str) -> Result<u64> {
    query_size(ep, format!("stat -c%s {}", shell_quote(path)))
}

fn remote_failure(out: &CommandOutput) -> String {
    let stderr = out.stderr.trim();
    if stderr.is_empty() {
        format!("exit status {}", out.exit_status)
    } else {
        stderr.to_string()
    }
}

/// Archive commands follow the empty-stderr convention: anything written to
/// stderr is fatal even on a zero exit status.
fn stderr_is_clean(out: &CommandOutput) -> bool {
    out.success() && out.stderr.trim().is_empty()
}

/// Best-effort `rm` of a staging archive. `rm` is destructive, so it is
/// issued once and never retried; failure is logged and swallowed.
fn remove_archive(ep: &mut dyn RemoteEndpoint, path: &str) {
    let command = format!("rm -f {}", shell_quote(path));
    match ep.run(&command) {
        Ok(out) if out.success() => {}
        Ok(out) => warn!(
            endpoint = ep.name(),
            path,
            detail = %remote_failure(&out),
            "archive cleanup failed"
        ),
        Err(e) => warn!(endpoint = ep.name(), path, error = %e, "archive cleanup failed"),
    }
}

/// Fixed-size chunk pump with cumulative progress across files.
struct ChunkCopier<'a> {
    chunk_size: usize,
    total_bytes: u64,
    transferred: u64,
    started: Instant,
    sink: &'a dyn ProgressSink,
}

impl<'a> ChunkCopier<'a> {
    fn new(chunk_size: usize, total_bytes: u64, sink: &'a dyn ProgressSink) -> Self {
        ChunkCopier {
            chunk_size,
            total_bytes,
            transferred: 0,
            started: Instant::now(),
            sink,
        }
    }

    fn copy(
        &mut self,
        mut reader: Box<dyn Read + Send>,
        mut writer: Box<dyn Write + Send>,
        current_file: &str,
    ) -> Result<u64> {
        let mut buf = vec![0u8; self.chunk_size];
        let mut copied = 0u64;
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n])?;
            copied += n as u64;
            self.transferred += n as u64;
            let sample =
                ProgressSample::new(self.transferred, self.total_bytes, self.started.elapsed());
            self.sink.sample(&sample, current_file);
        }
        writer.flush()?;
        Ok(copied)
    }
}

/// Tar on the source, copy the archive once, untar at the destination.
pub struct ArchiveCopy {
    pub chunk_size: usize,
}

impl TransferStrategy for ArchiveCopy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::ArchiveCopy
    }

    fn drive(
        &self,
        source: &mut dyn RemoteEndpoint,
        dest: &mut dyn RemoteEndpoint,
        source_path: &str,
        dest_path: &str,
        sink: &dyn ProgressSink,
    ) -> Result<TransferOutcome> {
        let mut phase = Phase::Sizing;
        let tree_bytes = tree_size(source, source_path)?;
        info!(phase = %phase, source_path, bytes = tree_bytes, "source tree sized");

        phase = Phase::Staging;
        let archive = format!("{}.tar.gz", source_path.trim_end_matches('/'));
        let tar_cmd = format!(
            "tar -czf {} -C {} .",
            shell_quote(&archive),
            shell_quote(source_path)
        );
        let out = source.run(&tar_cmd)?;
        if !stderr_is_clean(&out) {
            return Err(TransferError::Staging(remote_failure(&out)));
        }
        // the archive is what goes over the wire, so its size is the total
        let total_bytes = file_size(source, &archive)?;
        info!(phase = %phase, archive = %archive, bytes = total_bytes, "archive staged");

        phase = Phase::Copying;
        let archive_name = archive.rsplit('/').next().unwrap_or(&archive);
        let dest_archive = format!("{}/{}", dest_path.trim_end_matches('/'), archive_name);
        let reader = source.open_read(&archive)?;
        let writer = dest.open_write(&dest_archive)?;
        let mut copier = ChunkCopier::new(self.chunk_size, total_bytes, sink);
        let copied = copier.copy(reader, writer, archive_name)?;
        info!(phase = %phase, bytes = copied, "archive copied");

        phase = Phase::Finalizing;
        let untar_cmd = format!(
            "tar -xzf {} -C {}",
            shell_quote(&dest_archive),
            shell_quote(dest_path)
        );
        let out = dest.run(&untar_cmd)?;
        if !stderr_is_clean(&out) {
            return Err(TransferError::Extraction(remote_failure(&out)));
        }
        remove_archive(dest, &dest_archive);
        remove_archive(source, &archive);

        phase = Phase::Done;
        info!(phase = %phase, source_path, dest_path, "transfer complete");
        Ok(TransferOutcome {
            files: 1,
            bytes_transferred: copied,
            total_bytes,
        })
    }
}

/// Enumerate the source tree remotely and mirror it file by file.
pub struct DirectCopy {
    pub chunk_size: usize,
}

impl TransferStrategy for DirectCopy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::DirectCopy
    }

    fn drive(
        &self,
        source: &mut dyn RemoteEndpoint,
        dest: &mut dyn RemoteEndpoint,
        source_path: &str,
        dest_path: &str,
        sink: &dyn ProgressSink,
    ) -> Result<TransferOutcome> {
        let mut phase = Phase::Sizing;
        // one listing round-trip yields the files and their exact sizes;
        // du block accounting would overshoot the copyable total and the
        // final sample could never reach 100%
        let listing = source.run(&format!(
            "find {} -type f -printf '%s %p\\n'",
            shell_quote(source_path)
        ))?;
        if !listing.success() {
            return Err(TransferError::Command {
                status: listing.exit_status,
                stderr: listing.stderr.trim().to_string(),
            });
        }
        let mut files: Vec<(u64, &str)> = Vec::new();
        for line in listing.stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
            let (size, path) = line
                .split_once(' ')
                .ok_or_else(|| TransferError::SizeQuery(format!("bad listing line: {line:?}")))?;
            let size = size.parse::<u64>().map_err(|_| {
                TransferError::SizeQuery(format!("non-numeric size in listing: {size:?}"))
            })?;
            files.push((size, path));
        }
        let total_bytes: u64 = files.iter().map(|(size, _)| size).sum();
        info!(
            phase = %phase,
            source_path,
            files = files.len(),
            bytes = total_bytes,
            "source tree sized"
        );

        phase = Phase::Copying;
        let src_root = source_path.trim_end_matches('/');
        let dest_root = dest_path.trim_end_matches('/');
        let mut made_dirs: HashSet<String> = HashSet::new();
        let mut copier = ChunkCopier::new(self.chunk_size, total_bytes, sink);

        for &(_, file) in &files {
            let rel = file
                .strip_prefix(src_root)
                .map(|r| r.trim_start_matches('/'))
                .unwrap_or(file);
            let target = format!("{dest_root}/{rel}");

            // destination directories are created on demand, once each
            if let Some(idx) = target.rfind('/') {
                let parent = &target[..idx];
                if !parent.is_empty() && made_dirs.insert(parent.to_string()) {
                    let out = dest.run(&format!("mkdir -p {}", shell_quote(parent)))?;
                    if !out.success() {
                        return Err(TransferError::Command {
                            status: out.exit_status,
                            stderr: out.stderr.trim().to_string(),
                        });
                    }
                }
            }

            let reader = source.open_read(file)?;
            let writer = dest.open_write(&target)?;
            copier.copy(reader, writer, rel)?;
        }

        phase = Phase::Done;
        info!(phase = %phase, files = files.len(), bytes = copier.transferred, "transfer complete");
        Ok(TransferOutcome {
            files: files.len() as u64,
            bytes_transferred: copier.transferred,
            total_bytes,
        })
    }
}

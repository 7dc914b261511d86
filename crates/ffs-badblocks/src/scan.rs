//! External `badblocks` invocation.
//!
//! The scanner is spawned directly (no shell), with the device identifier as
//! a single argv element, and its stdout is read as a candidate source with
//! the same grammar as a manifest file.

use crate::ingest::{CandidateSource, IngestStats, InvalidBlockHandler, ingest_records};
use crate::list::BadBlockList;
use ffs_error::{FfsError, Result};
use ffs_types::BlockRange;
use std::ffi::{OsStr, OsString};
use std::io::BufReader;
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use tracing::{debug, info, warn};

pub const DEFAULT_SCAN_PROGRAM: &str = "badblocks";

/// Knobs for a scanner run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOptions {
    pub program: PathBuf,
    /// Echo the command line before running it.
    pub verbose: bool,
    /// Batch mode: no progress output from the scanner (`-s` omitted).
    pub preen: bool,
    /// Destructive write-verify scan (`-w`). The caller owns this decision.
    pub destructive: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            program: PathBuf::from(DEFAULT_SCAN_PROGRAM),
            verbose: false,
            preen: false,
            destructive: false,
        }
    }
}

/// Fully built scanner command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanCommand {
    program: PathBuf,
    args: Vec<OsString>,
}

impl ScanCommand {
    /// `<program> [-s] [-w] <device> <blocks_count>`
    #[must_use]
    pub fn new(options: &ScanOptions, device: &OsStr, blocks_count: u64) -> Self {
        let mut args = Vec::with_capacity(4);
        if !options.preen {
            args.push(OsString::from("-s"));
        }
        if options.destructive {
            args.push(OsString::from("-w"));
        }
        args.push(device.to_os_string());
        args.push(OsString::from(blocks_count.to_string()));
        Self {
            program: options.program.clone(),
            args,
        }
    }

    #[must_use]
    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    /// Space-joined rendering for logs. Not meant to be fed to a shell.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = self.program.display().to_string();
        for arg in &self.args {
            out.push(' ');
            out.push_str(&arg.to_string_lossy());
        }
        out
    }

    /// Spawn the scanner with stdout piped and stdin closed.
    pub fn spawn(&self) -> Result<ScanProcess> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|err| {
                FfsError::source_unavailable(format!("while trying to run {}", self.render()), err)
            })?;
        let Some(stdout) = child.stdout.take() else {
            // Unreachable with Stdio::piped(), but never leave a child behind.
            reap(&mut child);
            return Err(FfsError::source_unavailable(
                format!("while trying to run {}", self.render()),
                std::io::Error::other("scanner stdout was not captured"),
            ));
        };
        debug!(pid = child.id(), command = %self.render(), "scanner started");
        Ok(ScanProcess {
            child,
            stdout: BufReader::new(stdout),
        })
    }
}

fn reap(child: &mut Child) {
    if let Err(err) = child.kill() {
        debug!(error = %err, "scanner already exited");
    }
    if let Err(err) = child.wait() {
        warn!(error = %err, "failed to reap scanner process");
    }
}

/// A running scanner.
#[derive(Debug)]
pub struct ScanProcess {
    child: Child,
    stdout: BufReader<ChildStdout>,
}

impl ScanProcess {
    pub fn stdout(&mut self) -> &mut BufReader<ChildStdout> {
        &mut self.stdout
    }

    /// Close stdout and block until the scanner exits.
    pub fn wait(self) -> Result<ExitStatus> {
        let Self { mut child, stdout } = self;
        drop(stdout);
        child.wait().map_err(FfsError::Io)
    }

    /// Kill and reap the scanner.
    pub fn abort(self) {
        let Self { mut child, stdout } = self;
        drop(stdout);
        reap(&mut child);
    }
}

/// Candidate source backed by a scanner run.
#[derive(Debug, Clone)]
pub struct ScanSource {
    command: ScanCommand,
    verbose: bool,
}

impl ScanSource {
    #[must_use]
    pub fn new(options: &ScanOptions, device: &OsStr, blocks_count: u64) -> Self {
        Self {
            command: ScanCommand::new(options, device, blocks_count),
            verbose: options.verbose,
        }
    }
}

impl CandidateSource for ScanSource {
    fn label(&self) -> String {
        self.command.render()
    }

    fn echoed_command(&self) -> Option<String> {
        self.verbose.then(|| self.command.render())
    }

    fn ingest(
        &mut self,
        range: BlockRange,
        list: &mut BadBlockList,
        handler: &mut dyn InvalidBlockHandler,
    ) -> Result<IngestStats> {
        let label = self.label();
        if self.verbose {
            info!(command = %label, "Running command: {label}");
        } else {
            debug!(command = %label, "running scanner");
        }

        let mut process = self.command.spawn()?;
        let stats = match ingest_records(process.stdout(), &label, range, list, handler) {
            Ok(stats) => stats,
            Err(err) => {
                process.abort();
                return Err(err);
            }
        };

        let status = process.wait()?;
        if status.success() {
            debug!(command = %label, "scanner finished");
        } else {
            warn!(command = %label, %status, "scanner exited unsuccessfully; keeping its output");
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ffs_types::BlockNumber;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn write_script(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("fake-badblocks");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn args_of(cmd: &ScanCommand) -> Vec<String> {
        cmd.args()
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn interactive_scan_shows_progress() {
        let cmd = ScanCommand::new(&ScanOptions::default(), OsStr::new("/dev/sdb1"), 8193);
        assert_eq!(args_of(&cmd), vec!["-s", "/dev/sdb1", "8193"]);
        assert_eq!(cmd.render(), "badblocks -s /dev/sdb1 8193");
    }

    #[test]
    fn preen_scan_is_silent() {
        let options = ScanOptions {
            preen: true,
            ..ScanOptions::default()
        };
        let cmd = ScanCommand::new(&options, OsStr::new("/dev/sdb1"), 100);
        assert_eq!(args_of(&cmd), vec!["/dev/sdb1", "100"]);
    }

    #[test]
    fn destructive_flag_selects_write_mode() {
        let options = ScanOptions {
            destructive: true,
            preen: true,
            ..ScanOptions::default()
        };
        let cmd = ScanCommand::new(&options, OsStr::new("/dev/sdc"), 64);
        assert_eq!(args_of(&cmd), vec!["-w", "/dev/sdc", "64"]);
    }

    #[test]
    fn device_name_is_one_opaque_argument() {
        let device = "/tmp/img; rm -rf / $(whoami)";
        let cmd = ScanCommand::new(&ScanOptions::default(), OsStr::new(device), 10);
        assert_eq!(cmd.args().len(), 3);
        assert_eq!(cmd.args()[1], OsString::from(device));
    }

    #[test]
    fn verbose_scan_echoes_its_command() {
        let quiet = ScanSource::new(&ScanOptions::default(), OsStr::new("/dev/sdb1"), 100);
        assert_eq!(quiet.echoed_command(), None);

        let options = ScanOptions {
            verbose: true,
            ..ScanOptions::default()
        };
        let loud = ScanSource::new(&options, OsStr::new("/dev/sdb1"), 100);
        assert_eq!(
            loud.echoed_command().as_deref(),
            Some("badblocks -s /dev/sdb1 100")
        );
    }

    #[test]
    fn scanner_output_is_ingested() {
        let dir = tempfile::tempdir().unwrap();
        // The last line reports how many arguments the scanner received.
        let program = write_script(dir.path(), "echo 5\necho 7\necho 5000\necho \"$#\"");
        let options = ScanOptions {
            program,
            preen: true,
            ..ScanOptions::default()
        };
        let mut source = ScanSource::new(&options, OsStr::new("dev0"), 100);
        let mut list = BadBlockList::new();
        let mut rejected = Vec::new();
        let stats = source
            .ingest(
                BlockRange::new(1, 100),
                &mut list,
                &mut |e: &crate::InvalidEntry| rejected.push(e.clone()),
            )
            .unwrap();

        // "$#" prints 2: the device and the block count.
        assert_eq!(
            list.to_vec(),
            vec![BlockNumber(2), BlockNumber(5), BlockNumber(7)]
        );
        assert_eq!(stats.invalid, 1);
        assert_eq!(rejected.len(), 1);
    }

    #[test]
    fn failing_scanner_keeps_output() {
        let dir = tempfile::tempdir().unwrap();
        let program = write_script(dir.path(), "echo 9\nexit 3");
        let options = ScanOptions {
            program,
            ..ScanOptions::default()
        };
        let mut source = ScanSource::new(&options, OsStr::new("dev0"), 100);
        let mut list = BadBlockList::new();
        source
            .ingest(BlockRange::new(1, 100), &mut list, &mut crate::LogInvalidBlocks)
            .unwrap();
        assert_eq!(list.to_vec(), vec![BlockNumber(9)]);
    }

    #[test]
    fn missing_scanner_is_source_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let options = ScanOptions {
            program: dir.path().join("no-such-scanner"),
            ..ScanOptions::default()
        };
        let mut source = ScanSource::new(&options, OsStr::new("dev0"), 100);
        let err = source
            .ingest(
                BlockRange::new(1, 100),
                &mut BadBlockList::new(),
                &mut crate::LogInvalidBlocks,
            )
            .unwrap_err();
        assert!(matches!(err, FfsError::SourceUnavailable { .. }));
        assert!(err.to_string().contains("while trying to run"));
    }
}

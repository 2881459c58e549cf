//! Recursive filesystem copy with a pluggable problem solver.
//!
//! The engine never decides policy for a failing syscall. Each failure is
//! turned into a *problem*: the destination and source paths (as string
//! values) plus a [`ProblemCode`] are handed to the caller's
//! [`ProblemSolver`], which answers `Nothing` to say "resolved, carry on (or
//! retry)" or an error value to abort the whole copy with that value. This
//! keeps interactive hosts able to prompt, create missing sources, or skip,
//! without the engine knowing any of it.
//!
//! Regular file content goes through a kernel-side zero-copy transfer first;
//! the first time that fails, the engine downgrades to a buffered read/write
//! loop for the rest of the invocation rather than re-probing a kernel that
//! already said no.

use std::ffi::CString;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{MetadataExt, OpenOptionsExt, PermissionsExt, symlink};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use crate::process::Process;
use crate::text;
use crate::value::Value;
use crate::worker::WorkerContext;

/// Buffer size of the fallback read/write loop, and the per-call ceiling of
/// the zero-copy transfer.
const FILE_BUFFER_SIZE: usize = 128 * 1024;

/// Which syscall failed. The numbering is part of the generated-code contract.
#[repr(u32)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProblemCode {
    Stat = 1,
    ReadLink = 2,
    CreateSymlink = 3,
    OpenDir = 4,
    MakeDir = 5,
    OpenFile = 6,
    CreateFile = 7,
    ReadFromFile = 8,
    WriteToFile = 9,
}

/// The caller's policy for failing syscalls.
///
/// `Nothing` means the problem is resolved (or should be skipped) and the
/// engine may retry or move on; any other value aborts the copy and becomes
/// its result. The solver runs on the copying worker's thread with its
/// context.
pub trait ProblemSolver {
    fn solve(
        &mut self,
        destination: &Value,
        source: &Value,
        code: ProblemCode,
        ctx: &mut WorkerContext,
    ) -> Value;
}

impl<F> ProblemSolver for F
where
    F: FnMut(&Value, &Value, ProblemCode, &mut WorkerContext) -> Value,
{
    fn solve(
        &mut self,
        destination: &Value,
        source: &Value,
        code: ProblemCode,
        ctx: &mut WorkerContext,
    ) -> Value {
        self(destination, source, code, ctx)
    }
}

/// Copies `source` to `destination` recursively.
///
/// Symlink chains at the top level are followed to their target; inside the
/// tree, symlinks are recreated rather than followed. Returns `Nothing` on
/// success or the solver's abort value. The copy is not transactional: an
/// abort leaves everything copied so far in place.
pub fn copy(
    process: &Process,
    ctx: &mut WorkerContext,
    destination: &Path,
    source: &Path,
    solver: &mut dyn ProblemSolver,
) -> Value {
    let mut copier = Copier {
        process,
        ctx,
        solver,
        fast_path: FastPath::new(),
        buffer: vec![0; FILE_BUFFER_SIZE],
    };
    copier.copy_tree(destination, source)
}

struct Copier<'a> {
    process: &'a Process,
    ctx: &'a mut WorkerContext,
    solver: &'a mut dyn ProblemSolver,
    fast_path: FastPath,
    buffer: Vec<u8>,
}

impl Copier<'_> {
    /// Routes one problem to the solver. The paths travel as string values
    /// which the engine owns, so they are released once the solver returns.
    fn solve(&mut self, destination: &Path, source: &Path, code: ProblemCode) -> Value {
        let destination = text::path_value(destination);
        let source = text::path_value(source);
        let verdict = self.solver.solve(&destination, &source, code, self.ctx);
        self.process.hooks().release(&destination, self.ctx, false);
        self.process.hooks().release(&source, self.ctx, false);
        verdict
    }

    fn copy_tree(&mut self, destination: &Path, source: &Path) -> Value {
        // Follow the symlink chain at the root; a chain ends at a regular
        // file, a directory, or a problem the solver aborts on.
        let mut source = source.to_path_buf();
        let metadata = loop {
            match fs::symlink_metadata(&source) {
                Ok(metadata) if metadata.is_symlink() => match fs::read_link(&source) {
                    Ok(target) => source = resolve_link_target(&source, target),
                    Err(_) => {
                        let verdict = self.solve(destination, &source, ProblemCode::ReadLink);
                        if !verdict.is_nothing() {
                            return verdict;
                        }
                    }
                },
                Ok(metadata) => break metadata,
                Err(_) => {
                    let verdict = self.solve(destination, &source, ProblemCode::Stat);
                    if !verdict.is_nothing() {
                        return verdict;
                    }
                }
            }
        };
        if metadata.is_dir() {
            self.copy_dir(destination, &source)
        } else {
            self.copy_file(destination, &source, metadata.mode())
        }
    }

    fn copy_dir(&mut self, destination: &Path, source: &Path) -> Value {
        match fs::create_dir(destination) {
            Ok(()) => {
                mirror_attributes(destination, source);
            }
            Err(_) => {
                let verdict = self.solve(destination, source, ProblemCode::MakeDir);
                if !verdict.is_nothing() {
                    return verdict;
                }
            }
        }
        let entries = loop {
            match fs::read_dir(source) {
                Ok(entries) => break entries,
                Err(_) => {
                    let verdict = self.solve(destination, source, ProblemCode::OpenDir);
                    if !verdict.is_nothing() {
                        return verdict;
                    }
                }
            }
        };

        // Files and symlinks are copied during the listing pass; directories
        // wait until the listing is exhausted so at most one directory handle
        // is open per level.
        let mut deferred: Vec<(PathBuf, PathBuf)> = Vec::new();
        let mut result = Value::Nothing;
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(_) => {
                    result = self.solve(destination, source, ProblemCode::OpenDir);
                    if result.is_nothing() {
                        continue;
                    }
                    break;
                }
            };
            let source_child = entry.path();
            let destination_child = destination.join(entry.file_name());
            let metadata = loop {
                match fs::symlink_metadata(&source_child) {
                    Ok(metadata) => break Some(metadata),
                    Err(_) => {
                        result = self.solve(&destination_child, &source_child, ProblemCode::Stat);
                        if !result.is_nothing() {
                            break None;
                        }
                    }
                }
            };
            let Some(metadata) = metadata else { break };
            if metadata.is_dir() {
                deferred.push((destination_child, source_child));
            } else if metadata.is_symlink() {
                result = self.copy_link(&destination_child, &source_child);
                if !result.is_nothing() {
                    break;
                }
            } else {
                result = self.copy_file(&destination_child, &source_child, metadata.mode());
                if !result.is_nothing() {
                    break;
                }
            }
        }
        for (destination_child, source_child) in deferred.iter().rev() {
            if !result.is_nothing() {
                break;
            }
            result = self.copy_dir(destination_child, source_child);
        }
        result
    }

    /// Recreates a symlink with its original target, unresolved.
    fn copy_link(&mut self, destination: &Path, source: &Path) -> Value {
        loop {
            match fs::read_link(source) {
                Ok(target) => {
                    return match symlink(&target, destination) {
                        Ok(()) => Value::Nothing,
                        Err(_) => self.solve(destination, source, ProblemCode::CreateSymlink),
                    };
                }
                Err(_) => {
                    let verdict = self.solve(destination, source, ProblemCode::ReadLink);
                    if !verdict.is_nothing() {
                        return verdict;
                    }
                }
            }
        }
    }

    fn copy_file(&mut self, destination: &Path, source: &Path, mode: u32) -> Value {
        let source_file = match File::open(source) {
            Ok(file) => file,
            Err(_) => return self.solve(destination, source, ProblemCode::OpenFile),
        };
        let mut destination_file = match OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(mode & 0o7777)
            .open(destination)
        {
            Ok(file) => file,
            Err(_) => return self.solve(destination, source, ProblemCode::CreateFile),
        };

        if self.fast_path.enabled {
            if self.fast_path.transfer(&source_file, &destination_file) {
                mirror_attributes(destination, source);
                return Value::Nothing;
            }
            // The kernel transfer may have moved both offsets before
            // failing; restart the file from scratch.
            let _ = (&source_file).seek(SeekFrom::Start(0));
            let _ = destination_file.set_len(0);
            let _ = destination_file.seek(SeekFrom::Start(0));
        }

        let mut source_file = source_file;
        loop {
            let read = match source_file.read(&mut self.buffer) {
                Ok(0) => break,
                Ok(read) => read,
                Err(_) => {
                    let verdict = self.solve(destination, source, ProblemCode::ReadFromFile);
                    if verdict.is_nothing() {
                        continue;
                    }
                    return verdict;
                }
            };
            let mut written = 0;
            while written < read {
                match destination_file.write(&self.buffer[written..read]) {
                    Ok(count) => written += count,
                    Err(_) => {
                        let verdict = self.solve(destination, source, ProblemCode::WriteToFile);
                        if !verdict.is_nothing() {
                            return verdict;
                        }
                    }
                }
            }
        }
        mirror_attributes(destination, source);
        Value::Nothing
    }
}

/// A relative link target is interpreted against the link's own directory.
fn resolve_link_target(link: &Path, target: PathBuf) -> PathBuf {
    if target.is_absolute() {
        target
    } else {
        match link.parent() {
            Some(parent) => parent.join(target),
            None => target,
        }
    }
}

/// Copies permission bits and ownership, best-effort.
fn mirror_attributes(destination: &Path, source: &Path) {
    let Ok(metadata) = fs::symlink_metadata(source) else {
        return;
    };
    let _ = fs::set_permissions(
        destination,
        fs::Permissions::from_mode(metadata.mode() & 0o7777),
    );
    if let Ok(path) = CString::new(destination.as_os_str().as_bytes()) {
        unsafe {
            libc::chown(path.as_ptr(), metadata.uid(), metadata.gid());
        }
    }
}

/// Kernel-side zero-copy file transfer, disabled for good at the first
/// failure.
struct FastPath {
    enabled: bool,
    attempts: u64,
    #[cfg(test)]
    force_failure: bool,
}

impl FastPath {
    fn new() -> Self {
        Self {
            enabled: true,
            attempts: 0,
            #[cfg(test)]
            force_failure: false,
        }
    }

    /// Moves the whole of `input` into `output` inside the kernel. Returns
    /// `false` (and disables itself) when the kernel refuses.
    fn transfer(&mut self, input: &File, output: &File) -> bool {
        self.attempts += 1;
        #[cfg(test)]
        if self.force_failure {
            self.enabled = false;
            return false;
        }
        loop {
            let copied = unsafe {
                libc::copy_file_range(
                    input.as_raw_fd(),
                    std::ptr::null_mut(),
                    output.as_raw_fd(),
                    std::ptr::null_mut(),
                    FILE_BUFFER_SIZE,
                    0,
                )
            };
            if copied == 0 {
                return true;
            }
            if copied < 0 {
                self.enabled = false;
                return false;
            }
        }
    }
}

// =========================================================================
// Standalone filesystem operations
// =========================================================================

/// Copies mode and ownership between two existing objects of the same
/// filesystem type. Returns `false` when either side is missing or the types
/// differ.
pub fn copy_attributes(destination: &Path, source: &Path) -> bool {
    let Ok(source_metadata) = fs::metadata(source) else {
        return false;
    };
    let Ok(destination_metadata) = fs::metadata(destination) else {
        return false;
    };
    if source_metadata.mode() & libc::S_IFMT != destination_metadata.mode() & libc::S_IFMT {
        return false;
    }
    if fs::set_permissions(
        destination,
        fs::Permissions::from_mode(source_metadata.mode() & 0o7777),
    )
    .is_err()
    {
        return false;
    }
    let Ok(path) = CString::new(destination.as_os_str().as_bytes()) else {
        return false;
    };
    unsafe { libc::chown(path.as_ptr(), source_metadata.uid(), source_metadata.gid()) == 0 }
}

/// The target of a symlink as a string value, or `Nothing` on any failure.
pub fn read_symlink(path: &Path) -> Value {
    match fs::read_link(path) {
        Ok(target) => text::path_value(&target),
        Err(_) => Value::Nothing,
    }
}

/// Creates a symlink at `link` pointing to `target`.
pub fn create_symlink(link: &Path, target: &Path) -> bool {
    symlink(target, link).is_ok()
}

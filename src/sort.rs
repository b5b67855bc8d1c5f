//! External merge sorter.
//!
//! Records are collected in memory, spilled to temporary files as packed
//! memory arrays (PMAs) when a size threshold is crossed, and read back in
//! sorted order through a tournament-tree merge. Large spills merge through
//! a tree of incremental mergers with a fan-in of sixteen; an optional pool
//! of worker threads takes over flushing and region population.
//!
//! A PMA is a leading varint holding the total content size, followed by
//! `[varint length][record bytes]` entries in ascending key order.

use std::cmp::Ordering;
use std::fmt;
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use memmap2::Mmap;

use crate::record::{CodecError, KeyCompare, UnpackedRecord, put_varint, varint_len};

pub type Result<T> = std::result::Result<T, Error>;

/// Maximum number of PMAs merged by a single tournament tree; more inputs
/// build a tree of incremental mergers of this fan-in.
const MAX_MERGE_COUNT: usize = 16;

/// Accounting overhead charged per in-memory record.
const RECORD_HEADER: usize = 16;

const NIL: u32 = u32::MAX;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    NoMem,
    Io(io::ErrorKind),
    /// A PMA header or record failed to validate.
    Corrupt,
    /// Out-of-order calls or invalid parameters; a programmer error.
    Misuse(&'static str),
    /// The declared key-field count disagrees with the comparator's.
    KeyInfoMismatch { expected: usize, got: usize },
    /// A worker thread panicked.
    Thread,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoMem => f.write_str("Out of memory"),
            Self::Io(kind) => write!(f, "Sorter I/O error: {kind}"),
            Self::Corrupt => f.write_str("Sorter temp file is corrupt"),
            Self::Misuse(what) => write!(f, "Sorter misuse: {what}"),
            Self::KeyInfoMismatch { expected, got } => {
                write!(f, "Sorter key has {got} fields, comparator expects {expected}")
            }
            Self::Thread => f.write_str("Sorter worker thread panicked"),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(err.kind())
    }
}

impl From<CodecError> for Error {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Corrupt => Self::Corrupt,
            CodecError::NoMem => Self::NoMem,
        }
    }
}

/// Sorter tuning knobs.
#[derive(Clone)]
pub struct SorterConfig {
    /// Temp-file I/O happens in blocks of this size.
    pub page_size: usize,
    /// Below this in-memory size a flush only happens under memory
    /// pressure.
    pub min_pma_size: usize,
    /// In-memory size that forces a flush; `0` disables spilling entirely.
    pub max_pma_size: usize,
    /// Number of background worker threads; `0` keeps all work on the
    /// caller's thread.
    pub workers: usize,
    /// Temp files up to this size are read through a memory map; `0`
    /// disables mapping.
    pub mmap_limit: u64,
    /// Store records in one growing arena rather than one allocation each.
    pub bulk_memory: bool,
    /// Host hint consulted by the small-list flush heuristic.
    pub heap_nearly_full: Option<Arc<dyn Fn() -> bool + Send + Sync>>,
}

impl Default for SorterConfig {
    fn default() -> Self {
        let page_size = 4096;
        Self {
            page_size,
            min_pma_size: 10 * page_size,
            max_pma_size: 256 * page_size,
            workers: 0,
            mmap_limit: 0,
            bulk_memory: true,
            heap_nearly_full: None,
        }
    }
}

impl fmt::Debug for SorterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SorterConfig")
            .field("page_size", &self.page_size)
            .field("min_pma_size", &self.min_pma_size)
            .field("max_pma_size", &self.max_pma_size)
            .field("workers", &self.workers)
            .field("mmap_limit", &self.mmap_limit)
            .field("bulk_memory", &self.bulk_memory)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, Debug)]
struct IoCfg {
    pgsz: usize,
    mmap_limit: u64,
}

/// Comparison context threaded through every sort and merge operation: the
/// host comparator plus its reusable unpacked-record scratch.
struct SortCtx {
    cmp: Arc<dyn KeyCompare>,
    scratch: UnpackedRecord,
    io: IoCfg,
}

impl SortCtx {
    fn new(cmp: &Arc<dyn KeyCompare>, field_limit: usize, io: IoCfg) -> Self {
        Self { cmp: Arc::clone(cmp), scratch: UnpackedRecord::new(field_limit), io }
    }

    #[inline]
    fn compare(&mut self, left: &[u8], right: Option<&[u8]>) -> Ordering {
        self.cmp.compare(left, right, &mut self.scratch)
    }

    /// Surface a sticky comparator error, clearing it.
    fn take_err(&mut self) -> Result<()> {
        match self.scratch.err.take() {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }
}

fn open_temp() -> Result<Arc<File>> {
    Ok(Arc::new(tempfile::tempfile()?))
}

fn lock_file2(file2: &Mutex<TaskFile>) -> MutexGuard<'_, TaskFile> {
    match file2.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// A temp-file handle plus the amount of data stored in it.
#[derive(Clone)]
struct SorterFile {
    fd: Arc<File>,
    eof: u64,
}

/// The subtask's second temp file, carved into regions by the
/// single-threaded incremental mergers that share it.
struct TaskFile {
    fd: Option<Arc<File>>,
    eof: u64,
}

// ---------------------------------------------------------------------------
// PMA writer

/// Page-aligned buffered PMA writer. Writes are coalesced into page-sized
/// blocks; once an error is seen all further writes are discarded and the
/// error surfaces at finish time.
struct PmaWriter {
    err: Option<Error>,
    buf: Box<[u8]>,
    start: usize,
    end: usize,
    write_off: u64,
    fd: Arc<File>,
}

impl PmaWriter {
    fn new(fd: Arc<File>, n_buf: usize, start_off: u64) -> Self {
        let rem = (start_off % n_buf as u64) as usize;
        Self {
            err: None,
            buf: vec![0; n_buf].into_boxed_slice(),
            start: rem,
            end: rem,
            write_off: start_off - rem as u64,
            fd,
        }
    }

    fn write(&mut self, data: &[u8]) {
        let mut rem = data.len();
        while rem > 0 && self.err.is_none() {
            let n_copy = rem.min(self.buf.len() - self.end);
            let at = data.len() - rem;
            self.buf[self.end..self.end + n_copy].copy_from_slice(&data[at..at + n_copy]);
            self.end += n_copy;
            if self.end == self.buf.len() {
                if let Err(err) = self
                    .fd
                    .write_all_at(&self.buf[self.start..self.end], self.write_off + self.start as u64)
                {
                    self.err = Some(err.into());
                }
                self.start = 0;
                self.end = 0;
                self.write_off += self.buf.len() as u64;
            }
            rem -= n_copy;
        }
    }

    fn write_varint(&mut self, value: u64) {
        let mut buf = Vec::with_capacity(9);
        put_varint(&mut buf, value);
        self.write(&buf);
    }

    /// Flush the buffered tail and return the end-of-data offset.
    fn finish(mut self) -> Result<u64> {
        if self.err.is_none() && self.end > self.start {
            if let Err(err) = self
                .fd
                .write_all_at(&self.buf[self.start..self.end], self.write_off + self.start as u64)
            {
                self.err = Some(err.into());
            }
        }
        let eof = self.write_off + self.end as u64;
        match self.err {
            Some(err) => Err(err),
            None => Ok(eof),
        }
    }
}

// ---------------------------------------------------------------------------
// PMA reader

#[derive(Clone, Copy, Debug, Default)]
enum KeyLoc {
    #[default]
    None,
    Buf(usize),
    Alloc,
    Map(usize),
}

/// Reads one PMA (or the output of an incremental merger) in key order.
/// The current key is valid until the next advance. At EOF the reader
/// releases all of its resources and `fd` is `None`.
#[derive(Default)]
struct PmaReader {
    read_off: u64,
    eof: u64,
    fd: Option<Arc<File>>,
    buf: Box<[u8]>,
    alloc: Vec<u8>,
    map: Option<Mmap>,
    key_loc: KeyLoc,
    n_key: usize,
    incr: Option<Box<IncrMerger>>,
}

impl PmaReader {
    fn is_eof(&self) -> bool {
        self.fd.is_none()
    }

    fn key(&self) -> &[u8] {
        match self.key_loc {
            KeyLoc::Buf(off) => &self.buf[off..off + self.n_key],
            KeyLoc::Alloc => &self.alloc[..self.n_key],
            KeyLoc::Map(off) => match &self.map {
                Some(map) => &map[off..off + self.n_key],
                None => &[],
            },
            KeyLoc::None => &[],
        }
    }

    fn clear(&mut self) {
        // Dropping the incremental merger joins its outstanding thread.
        self.incr = None;
        self.fd = None;
        self.map = None;
        self.buf = Box::default();
        self.alloc = Vec::new();
        self.key_loc = KeyLoc::None;
        self.n_key = 0;
        self.read_off = 0;
        self.eof = 0;
    }

    /// Point the reader at `off` within `file`, mapping the file when it
    /// fits under the mmap limit.
    fn seek(&mut self, io: IoCfg, file: &SorterFile, off: u64) -> Result<()> {
        self.map = None;
        self.read_off = off;
        self.eof = file.eof;
        self.fd = Some(Arc::clone(&file.fd));
        if file.eof > 0 && file.eof <= io.mmap_limit {
            // SAFETY: the mapping is read-only over a temp file owned by
            // this sorter; a region is only rewritten after its reader
            // re-seeks (and re-maps).
            if let Ok(map) = unsafe { Mmap::map(&*file.fd) } {
                self.map = Some(map);
            }
        }
        if self.map.is_none() {
            if self.buf.is_empty() {
                self.buf = vec![0; io.pgsz].into_boxed_slice();
            }
            let i_buf = (off % self.buf.len() as u64) as usize;
            if i_buf != 0 {
                let mut n_read = self.buf.len() - i_buf;
                if off + n_read as u64 > self.eof {
                    n_read = (self.eof - off) as usize;
                }
                if let Some(fd) = &self.fd {
                    fd.read_exact_at(&mut self.buf[i_buf..i_buf + n_read], off)?;
                }
            }
        }
        Ok(())
    }

    /// Refill the whole buffer from the (block-aligned) read offset.
    fn refill(&mut self) -> Result<()> {
        let n_read = (self.eof - self.read_off).min(self.buf.len() as u64) as usize;
        if let Some(fd) = &self.fd {
            fd.read_exact_at(&mut self.buf[..n_read], self.read_off)?;
        }
        Ok(())
    }

    /// Read `n` bytes. The result points into the read buffer when the
    /// span fits, or into the straddle scratch otherwise; with a mapped
    /// file it points straight into the map.
    fn read_blob(&mut self, n: usize) -> Result<KeyLoc> {
        if self.read_off + n as u64 > self.eof {
            return Err(Error::Corrupt);
        }
        if self.map.is_some() {
            let off = self.read_off as usize;
            self.read_off += n as u64;
            return Ok(KeyLoc::Map(off));
        }
        let n_buf = self.buf.len();
        let i_buf = (self.read_off % n_buf as u64) as usize;
        if i_buf == 0 {
            self.refill()?;
        }
        let n_avail = n_buf - i_buf;
        if n <= n_avail {
            self.read_off += n as u64;
            Ok(KeyLoc::Buf(i_buf))
        } else {
            self.alloc.clear();
            self.alloc.extend_from_slice(&self.buf[i_buf..]);
            self.read_off += n_avail as u64;
            let mut rem = n - n_avail;
            while rem > 0 {
                self.refill()?;
                let n_copy = rem.min(n_buf);
                self.alloc.extend_from_slice(&self.buf[..n_copy]);
                self.read_off += n_copy as u64;
                rem -= n_copy;
            }
            Ok(KeyLoc::Alloc)
        }
    }

    fn read_varint(&mut self) -> Result<u64> {
        if let Some(map) = &self.map {
            let slice = &map[self.read_off as usize..self.eof as usize];
            let (value, n) = crate::record::get_varint(slice).ok_or(Error::Corrupt)?;
            self.read_off += n as u64;
            return Ok(value);
        }
        let n_buf = self.buf.len();
        let i_buf = (self.read_off % n_buf as u64) as usize;
        if i_buf != 0 && n_buf - i_buf >= 9 {
            let (value, n) = crate::record::get_varint(&self.buf[i_buf..]).ok_or(Error::Corrupt)?;
            self.read_off += n as u64;
            Ok(value)
        } else {
            // The varint may straddle a buffer boundary; go byte by byte.
            let mut bytes = [0u8; 9];
            for i in 0.. {
                if i == 9 {
                    return Err(Error::Corrupt);
                }
                let loc = self.read_blob(1)?;
                let byte = match loc {
                    KeyLoc::Buf(off) => self.buf[off],
                    _ => return Err(Error::Corrupt),
                };
                bytes[i] = byte;
                if byte & 0x80 == 0 {
                    break;
                }
            }
            let (value, _) = crate::record::get_varint(&bytes).ok_or(Error::Corrupt)?;
            Ok(value)
        }
    }

    /// Advance to the next key. Reaching the end of the current data asks
    /// the incremental merger (if any) for a refill; otherwise the reader
    /// clears itself and reports EOF through `is_eof`.
    fn next(&mut self, ctx: &mut SortCtx) -> Result<()> {
        if self.read_off >= self.eof {
            let mut reseek = None;
            if let Some(incr) = self.incr.as_mut() {
                incr.swap(ctx)?;
                if !incr.eof {
                    reseek = Some((incr.files[0].clone(), incr.start_off));
                }
            }
            match reseek {
                Some((Some(file), start)) => self.seek(ctx.io, &file, start)?,
                _ => {
                    self.clear();
                    return Ok(());
                }
            }
        }
        let n = self.read_varint()? as usize;
        self.n_key = n;
        self.key_loc = self.read_blob(n)?;
        Ok(())
    }

    /// Seed the reader on the PMA starting at `start` in `file`, leaving it
    /// on the first key. Returns the offset one past the PMA.
    fn init_pma(
        &mut self,
        io: IoCfg,
        file: &SorterFile,
        start: u64,
        ctx: &mut SortCtx,
    ) -> Result<u64> {
        self.seek(io, file, start)?;
        let n = self.read_varint()?;
        self.eof = self.read_off + n;
        if self.eof > file.eof {
            return Err(Error::Corrupt);
        }
        let end = self.eof;
        self.next(ctx)?;
        Ok(end)
    }

    /// Set up the temp-file side of an attached incremental merger and load
    /// the first key (except in task mode, where a later advance does it).
    fn incr_init(&mut self, ctx: &mut SortCtx, mode: IncrInitMode) -> Result<()> {
        if self.incr.is_none() {
            return Ok(());
        }
        if let Some(incr) = self.incr.as_mut() {
            if let Some(merger) = incr.merger.as_mut() {
                merger.init(ctx, mode)?;
            }
            if incr.use_thread {
                incr.files[0] = Some(SorterFile { fd: open_temp()?, eof: 0 });
                incr.files[1] = Some(SorterFile { fd: open_temp()?, eof: 0 });
            } else {
                let fd = {
                    let mut file2 = lock_file2(&incr.file2);
                    if file2.fd.is_none() {
                        file2.fd = Some(open_temp()?);
                        file2.eof = 0;
                    }
                    incr.start_off = file2.eof;
                    file2.eof += incr.mx_sz;
                    Arc::clone(file2.fd.as_ref().expect("file2 opened above"))
                };
                incr.files[1] = Some(SorterFile { fd, eof: incr.start_off });
                incr.files[0] = incr.files[1].clone();
            }
            if incr.use_thread {
                // Populate the first region on the current thread; in task
                // mode that thread is already a background worker.
                incr.populate_fg(ctx)?;
            }
        }
        if mode != IncrInitMode::Task {
            self.next(ctx)?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tournament-tree merge engine

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum IncrInitMode {
    Normal,
    Task,
    Root,
}

/// Merges N sorted inputs via a tournament tree.
///
/// `readers` is padded to a power of two P (extra readers sit at EOF). The
/// final P/2 slots of `tree` cache pairwise winners over adjacent readers,
/// the preceding P/4 slots the winners of those, and so on; `tree[1]` names
/// the reader holding the overall minimum. EOF compares greater than every
/// key and ties go to the lower reader index, so single-threaded merges are
/// stable. Each advance costs about log2(P) comparisons.
struct MergeEngine {
    n_tree: usize,
    tree: Vec<usize>,
    readers: Vec<PmaReader>,
}

impl MergeEngine {
    fn new(n_readers: usize) -> Self {
        let mut p = 2;
        while p < n_readers {
            p += p;
        }
        Self { n_tree: p, tree: vec![0; p], readers: (0..p).map(|_| PmaReader::default()).collect() }
    }

    fn current(&self) -> &PmaReader {
        &self.readers[self.tree[1]]
    }

    /// Seed every reader and fill the comparison tree bottom-up.
    fn init(&mut self, ctx: &mut SortCtx, mode: IncrInitMode) -> Result<()> {
        let n = self.n_tree;
        for i in 0..n {
            if mode == IncrInitMode::Root {
                // Root mode: children were already initialized in task
                // mode; reverse order lets the reader that blocks on the
                // main thread start last.
                self.readers[n - 1 - i].next(ctx)?;
            } else {
                self.readers[i].incr_init(ctx, IncrInitMode::Normal)?;
            }
        }
        for i in (1..n).rev() {
            self.compare_slot(ctx, i);
        }
        ctx.take_err()
    }

    /// Recompute one tree slot from scratch.
    fn compare_slot(&mut self, ctx: &mut SortCtx, out: usize) {
        let (i1, i2) = if out >= self.n_tree / 2 {
            let i1 = (out - self.n_tree / 2) * 2;
            (i1, i1 + 1)
        } else {
            (self.tree[out * 2], self.tree[out * 2 + 1])
        };
        let r1 = &self.readers[i1];
        let r2 = &self.readers[i2];
        let winner = if r1.is_eof() {
            i2
        } else if r2.is_eof() {
            i1
        } else if ctx.compare(r1.key(), Some(r2.key())).is_le() {
            i1
        } else {
            i2
        };
        self.tree[out] = winner;
    }

    /// Advance past the current minimum. Only the path from the advanced
    /// reader's leaf to the root is recomputed; when the right-hand reader
    /// of a comparison is unchanged its unpacked key is reused from the
    /// scratch. Returns true at overall EOF.
    fn advance(&mut self, ctx: &mut SortCtx) -> Result<bool> {
        let i_prev = self.tree[1];
        self.readers[i_prev].next(ctx)?;

        let n_tree = self.n_tree;
        let tree = &mut self.tree;
        let readers = &self.readers;
        let mut i1 = i_prev & !1usize;
        let mut i2 = i_prev | 1;
        let mut cached = false;
        let mut i = (n_tree + i_prev) / 2;
        while i > 0 {
            let res = if readers[i1].is_eof() {
                Ordering::Greater
            } else if readers[i2].is_eof() {
                Ordering::Less
            } else {
                let right = if cached { None } else { Some(readers[i2].key()) };
                ctx.compare(readers[i1].key(), right)
            };
            if res == Ordering::Less || (res == Ordering::Equal && i1 < i2) {
                tree[i] = i1;
                i2 = tree[i ^ 1];
                cached = false;
            } else {
                // The scratch now holds the winner's key; skip re-unpacking
                // it on the next level, unless no comparison actually ran.
                if !readers[i1].is_eof() {
                    cached = true;
                }
                tree[i] = i2;
                i1 = tree[i ^ 1];
            }
            i /= 2;
        }
        let eof = self.readers[self.tree[1]].is_eof();
        ctx.take_err()?;
        Ok(eof)
    }
}

// ---------------------------------------------------------------------------
// Incremental merger

type PopulateResult = (Box<MergeEngine>, SortCtx, SorterFile, Result<()>);

/// A bounded refillable view over a merge engine's output.
///
/// Single-threaded mergers own a region of their subtask's second temp
/// file and refill it in place when the reader runs dry. Multi-threaded
/// mergers own two private temp files: the reader drains `files[0]` while
/// a background thread fills `files[1]`, and an advance past the end swaps
/// them.
struct IncrMerger {
    /// The owning subtask's second file; single-threaded mergers carve
    /// their region out of it.
    file2: Arc<Mutex<TaskFile>>,
    start_off: u64,
    mx_sz: u64,
    eof: bool,
    use_thread: bool,
    files: [Option<SorterFile>; 2],
    merger: Option<Box<MergeEngine>>,
    ctx: Option<SortCtx>,
    handle: Option<JoinHandle<PopulateResult>>,
}

impl IncrMerger {
    fn new(
        file2: Arc<Mutex<TaskFile>>,
        merger: Box<MergeEngine>,
        mx_keysize: usize,
        mx_pma_size: usize,
    ) -> Box<IncrMerger> {
        let mx_sz = ((mx_keysize + 9).max(mx_pma_size / 2)) as u64;
        Box::new(IncrMerger {
            file2,
            start_off: 0,
            mx_sz,
            eof: false,
            use_thread: false,
            files: [None, None],
            merger: Some(merger),
            ctx: None,
            handle: None,
        })
    }

    fn set_threads(&mut self, ctx: SortCtx) {
        self.use_thread = true;
        self.ctx = Some(ctx);
    }

    /// Refill the write-side file from the merge engine on this thread.
    fn populate_fg(&mut self, ctx: &mut SortCtx) -> Result<()> {
        let Some(merger) = self.merger.as_mut() else {
            return Ok(());
        };
        let Some(out) = self.files[1].as_ref() else {
            return Ok(());
        };
        let eof = populate_region(merger, Arc::clone(&out.fd), self.start_off, self.mx_sz, ctx)?;
        if let Some(out) = self.files[1].as_mut() {
            out.eof = eof;
        }
        Ok(())
    }

    fn spawn_populate(&mut self) -> Result<()> {
        let Some(mut merger) = self.merger.take() else {
            return Ok(());
        };
        let Some(mut ctx) = self.ctx.take() else {
            self.merger = Some(merger);
            return Err(Error::Misuse("threaded merger without context"));
        };
        let Some(mut file) = self.files[1].clone() else {
            self.merger = Some(merger);
            self.ctx = Some(ctx);
            return Err(Error::Misuse("threaded merger without files"));
        };
        let (start, mx) = (self.start_off, self.mx_sz);
        self.handle = Some(std::thread::spawn(move || {
            let rc = populate_region(&mut merger, Arc::clone(&file.fd), start, mx, &mut ctx)
                .map(|eof| file.eof = eof);
            (merger, ctx, file, rc)
        }));
        Ok(())
    }

    fn join(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        match handle.join() {
            Ok((merger, ctx, file, rc)) => {
                self.merger = Some(merger);
                self.ctx = Some(ctx);
                self.files[1] = Some(file);
                rc
            }
            Err(_) => Err(Error::Thread),
        }
    }

    /// Make the next region available to the reader. Multi-threaded: join
    /// the populate thread, swap the files, and kick off the next populate.
    /// Single-threaded: refill the region in place.
    fn swap(&mut self, ctx: &mut SortCtx) -> Result<()> {
        if self.use_thread {
            self.join()?;
            self.files.swap(0, 1);
            if self.files[0].as_ref().is_none_or(|f| f.eof == self.start_off) {
                self.eof = true;
            } else {
                self.spawn_populate()?;
            }
        } else {
            self.populate_fg(ctx)?;
            self.files[0] = self.files[1].clone();
            if self.files[0].as_ref().is_none_or(|f| f.eof == self.start_off) {
                self.eof = true;
            }
        }
        Ok(())
    }
}

impl Drop for IncrMerger {
    fn drop(&mut self) {
        // Never leave a populate thread running; nested mergers join their
        // own threads as the engine tree drops.
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Drain keys from `merger` into the file region `[start, start + mx)`.
/// The region uses the PMA record format without the leading size varint.
/// Returns the end offset of the data written.
fn populate_region(
    merger: &mut MergeEngine,
    fd: Arc<File>,
    start: u64,
    mx: u64,
    ctx: &mut SortCtx,
) -> Result<u64> {
    let mut writer = PmaWriter::new(fd, ctx.io.pgsz, start);
    loop {
        {
            let reader = merger.current();
            if reader.is_eof() {
                break;
            }
            let n = reader.n_key;
            let end = writer.write_off + writer.end as u64;
            if end + n as u64 + varint_len(n as u64) as u64 > start + mx {
                break;
            }
            writer.write_varint(n as u64);
        }
        writer.write(merger.current().key());
        merger.advance(ctx)?;
    }
    writer.finish()
}

// ---------------------------------------------------------------------------
// In-memory record list

enum RecordStore {
    Bulk { mem: Vec<u8>, spans: Vec<(u32, u32)> },
    Heap { recs: Vec<Box<[u8]>> },
}

impl RecordStore {
    fn len(&self) -> usize {
        match self {
            Self::Bulk { spans, .. } => spans.len(),
            Self::Heap { recs } => recs.len(),
        }
    }

    fn rec(&self, i: u32) -> &[u8] {
        match self {
            Self::Bulk { mem, spans } => {
                let (start, len) = spans[i as usize];
                &mem[start as usize..(start + len) as usize]
            }
            Self::Heap { recs } => &recs[i as usize],
        }
    }

    fn push(&mut self, record: &[u8]) {
        match self {
            Self::Bulk { mem, spans } => {
                spans.push((mem.len() as u32, record.len() as u32));
                mem.extend_from_slice(record);
            }
            Self::Heap { recs } => recs.push(record.into()),
        }
    }

    fn clear(&mut self) {
        match self {
            Self::Bulk { mem, spans } => {
                mem.clear();
                spans.clear();
            }
            Self::Heap { recs } => recs.clear(),
        }
    }

    fn mem_used(&self) -> usize {
        match self {
            Self::Bulk { mem, spans } => mem.len() + spans.len() * RECORD_HEADER,
            Self::Heap { recs } => recs.iter().map(|r| r.len() + RECORD_HEADER).sum(),
        }
    }
}

/// In-memory list of records awaiting a sort or flush, linked newest-first
/// through `next` so insertion is O(1).
struct SorterList {
    store: RecordStore,
    next: Vec<u32>,
    head: u32,
    /// Size of the list when serialized as a PMA.
    sz_pma: usize,
}

impl SorterList {
    fn new(bulk: bool) -> Self {
        let store = if bulk {
            RecordStore::Bulk { mem: Vec::new(), spans: Vec::new() }
        } else {
            RecordStore::Heap { recs: Vec::new() }
        };
        Self { store, next: Vec::new(), head: NIL, sz_pma: 0 }
    }

    fn is_empty(&self) -> bool {
        self.head == NIL
    }

    fn push(&mut self, record: &[u8]) {
        let idx = self.store.len() as u32;
        self.store.push(record);
        self.next.push(self.head);
        self.head = idx;
    }

    fn clear(&mut self) {
        self.store.clear();
        self.next.clear();
        self.head = NIL;
        self.sz_pma = 0;
    }
}

/// Merge two sorted runs, reusing the scratch for the unchanged right key.
fn merge_runs(
    ctx: &mut SortCtx,
    store: &RecordStore,
    next: &mut [u32],
    mut p1: u32,
    mut p2: u32,
) -> u32 {
    let mut head = NIL;
    let mut tail = NIL;
    let mut cached = false;
    loop {
        let res = {
            let right = if cached { None } else { Some(store.rec(p2)) };
            ctx.compare(store.rec(p1), right)
        };
        if res.is_le() {
            if head == NIL {
                head = p1;
            } else {
                next[tail as usize] = p1;
            }
            let succ = next[p1 as usize];
            tail = p1;
            p1 = succ;
            if p1 == NIL {
                next[tail as usize] = p2;
                break;
            }
            cached = true;
        } else {
            if head == NIL {
                head = p2;
            } else {
                next[tail as usize] = p2;
            }
            let succ = next[p2 as usize];
            tail = p2;
            p2 = succ;
            if p2 == NIL {
                next[tail as usize] = p1;
                break;
            }
            cached = false;
        }
    }
    head
}

/// Sort the list with a cascade of 64 merge bins: each record is merged
/// into consecutive occupied bins until a free one is found, then the bins
/// are merged left to right. Stable under the original insertion order.
fn sort_list(ctx: &mut SortCtx, list: &mut SorterList) -> Result<()> {
    if list.head == NIL {
        return Ok(());
    }
    let SorterList { store, next, head, .. } = list;
    let mut slots: [u32; 64] = [NIL; 64];
    let mut p = *head;
    while p != NIL {
        let succ = next[p as usize];
        next[p as usize] = NIL;
        let mut merged = p;
        let mut i = 0;
        while i < slots.len() && slots[i] != NIL {
            merged = merge_runs(ctx, store, next, merged, slots[i]);
            slots[i] = NIL;
            i += 1;
        }
        slots[i.min(slots.len() - 1)] = merged;
        p = succ;
    }
    let mut all = NIL;
    for slot in slots {
        if slot == NIL {
            continue;
        }
        all = if all == NIL { slot } else { merge_runs(ctx, store, next, all, slot) };
    }
    *head = all;
    ctx.take_err()
}

// ---------------------------------------------------------------------------
// Subtasks

/// Per-subtask state that moves into a worker thread for the duration of a
/// flush and comes back at join.
struct TaskCore {
    file: Option<SorterFile>,
    file2: Arc<Mutex<TaskFile>>,
    n_pma: usize,
    ctx: SortCtx,
}

/// One flush subtask slot: its core (absent while a worker holds it), a
/// recycled list, and the worker's join handle.
struct FlushSlot {
    core: Option<TaskCore>,
    spare: Option<SorterList>,
    handle: Option<JoinHandle<(TaskCore, SorterList, Result<()>)>>,
}

/// Sort the list and append it to the subtask's level-0 file as one PMA.
fn list_to_pma(core: &mut TaskCore, list: &mut SorterList) -> Result<()> {
    if core.file.is_none() {
        core.file = Some(SorterFile { fd: open_temp()?, eof: 0 });
    }
    sort_list(&mut core.ctx, list)?;
    let Some(file) = core.file.as_mut() else {
        return Err(Error::Misuse("subtask file missing"));
    };
    let mut writer = PmaWriter::new(Arc::clone(&file.fd), core.ctx.io.pgsz, file.eof);
    core.n_pma += 1;
    writer.write_varint(list.sz_pma as u64);
    let mut p = list.head;
    while p != NIL {
        let rec = list.store.rec(p);
        writer.write_varint(rec.len() as u64);
        writer.write(rec);
        p = list.next[p as usize];
    }
    file.eof = writer.finish()?;
    list.clear();
    Ok(())
}

// ---------------------------------------------------------------------------
// Sorter

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Build,
    Read,
}

/// An external merge sorter over opaque, length-prefixed key records.
///
/// Lifecycle: write records, `rewind`, then step the sorted stream with
/// `next`/`rowkey`/`compare`; `reset` returns to the write phase cheaply.
/// Calls out of that order are `Misuse` errors. Any error is sticky:
/// subsequent operations re-surface it until `reset` or drop.
///
/// ```
/// use std::sync::Arc;
/// use quern::record::{FieldRef, RecordCompare, encode_key};
/// use quern::sort::{Sorter, SorterConfig};
///
/// let mut sorter = Sorter::new(1, Arc::new(RecordCompare::new(1)), SorterConfig::default());
/// for v in [3i64, 1, 2] {
///     sorter.write(&encode_key(&[FieldRef::Integer(v)])).unwrap();
/// }
/// let mut eof = sorter.rewind().unwrap();
/// let mut seen = Vec::new();
/// while !eof {
///     seen.push(sorter.rowkey().unwrap().to_vec());
///     eof = sorter.next().unwrap();
/// }
/// assert_eq!(seen[0], encode_key(&[FieldRef::Integer(1)]));
/// ```
pub struct Sorter {
    cfg: SorterConfig,
    io: IoCfg,
    cmp: Arc<dyn KeyCompare>,
    field_limit: usize,
    declared_fields: usize,
    list: SorterList,
    slots: Vec<FlushSlot>,
    i_prev: usize,
    mx_keysize: usize,
    use_pma: bool,
    use_threads: bool,
    reader: Option<Box<PmaReader>>,
    merger: Option<Box<MergeEngine>>,
    read_ctx: Option<SortCtx>,
    scratch: Option<UnpackedRecord>,
    state: State,
    err: Option<Error>,
}

impl Sorter {
    /// Create a sorter comparing `n_key_fields` leading fields of each
    /// record (`0` defers to the comparator). The narrower field count is
    /// only honoured single-threaded, where the sort is stable and
    /// trailing fields cannot reorder equal keys.
    pub fn new(n_key_fields: usize, cmp: Arc<dyn KeyCompare>, cfg: SorterConfig) -> Sorter {
        let use_threads = cfg.workers > 0;
        let field_limit = if !use_threads && n_key_fields > 0 {
            n_key_fields
        } else {
            cmp.fields()
        };
        let io = IoCfg { pgsz: cfg.page_size.max(128), mmap_limit: cfg.mmap_limit };
        let slots = (0..cfg.workers + 1)
            .map(|_| FlushSlot {
                core: Some(TaskCore {
                    file: None,
                    file2: Arc::new(Mutex::new(TaskFile { fd: None, eof: 0 })),
                    n_pma: 0,
                    ctx: SortCtx::new(&cmp, field_limit, io),
                }),
                spare: None,
                handle: None,
            })
            .collect();
        Sorter {
            list: SorterList::new(cfg.bulk_memory),
            io,
            cmp,
            field_limit,
            declared_fields: n_key_fields,
            slots,
            i_prev: 0,
            mx_keysize: 0,
            use_pma: false,
            use_threads,
            reader: None,
            merger: None,
            read_ctx: None,
            scratch: None,
            state: State::Build,
            err: None,
            cfg,
        }
    }

    fn check_err(&self) -> Result<()> {
        match &self.err {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    fn fail<T>(&mut self, err: Error) -> Result<T> {
        self.err = Some(err.clone());
        Err(err)
    }

    fn stick<T>(&mut self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result
            && self.err.is_none()
        {
            self.err = Some(err.clone());
        }
        result
    }

    fn heap_nearly_full(&self) -> bool {
        self.cfg.heap_nearly_full.as_ref().is_some_and(|hint| hint())
    }

    /// Add one record to the sorter.
    pub fn write(&mut self, record: &[u8]) -> Result<()> {
        self.check_err()?;
        if self.state != State::Build {
            return self.fail(Error::Misuse("write after rewind"));
        }
        if record.is_empty() {
            return self.fail(Error::Misuse("empty record"));
        }
        let n_pma = record.len() + varint_len(record.len() as u64);
        if self.cfg.max_pma_size > 0 {
            let flush = match &self.list.store {
                RecordStore::Bulk { .. } => {
                    let used = self.list.store.mem_used();
                    used > 0 && used + record.len() + RECORD_HEADER > self.cfg.max_pma_size
                }
                RecordStore::Heap { .. } => {
                    self.list.sz_pma > self.cfg.max_pma_size
                        || (self.list.sz_pma > self.cfg.min_pma_size && self.heap_nearly_full())
                }
            };
            if flush {
                let rc = self.flush_pma();
                self.stick(rc)?;
            }
        }
        self.list.sz_pma += n_pma;
        if n_pma > self.mx_keysize {
            self.mx_keysize = n_pma;
        }
        self.list.push(record);
        Ok(())
    }

    /// Sort and flush the in-memory list as a new level-0 PMA, handing the
    /// work to a free worker when threads are enabled. Workers are chosen
    /// round-robin, preferring ones whose previous flush already finished;
    /// with every worker busy the foreground subtask runs the flush
    /// inline.
    fn flush_pma(&mut self) -> Result<()> {
        self.use_pma = true;
        if !self.use_threads {
            let Some(core) = self.slots[0].core.as_mut() else {
                return Err(Error::Misuse("subtask core missing"));
            };
            return list_to_pma(core, &mut self.list);
        }
        let n_worker = self.slots.len() - 1;
        let mut chosen = None;
        for i in 0..n_worker {
            let t = (self.i_prev + i + 1) % n_worker;
            if self.slots[t].handle.as_ref().is_some_and(JoinHandle::is_finished) {
                self.join_slot(t)?;
            }
            if self.slots[t].handle.is_none() {
                chosen = Some(t);
                break;
            }
        }
        match chosen {
            None => {
                // Every worker is busy: flush on the foreground subtask.
                let Some(core) = self.slots[n_worker].core.as_mut() else {
                    return Err(Error::Misuse("subtask core missing"));
                };
                list_to_pma(core, &mut self.list)
            }
            Some(t) => {
                self.i_prev = t;
                let slot = &mut self.slots[t];
                let Some(mut core) = slot.core.take() else {
                    return Err(Error::Misuse("subtask core missing"));
                };
                let fresh =
                    slot.spare.take().unwrap_or_else(|| SorterList::new(self.cfg.bulk_memory));
                let mut list = std::mem::replace(&mut self.list, fresh);
                slot.handle = Some(std::thread::spawn(move || {
                    let rc = list_to_pma(&mut core, &mut list);
                    (core, list, rc)
                }));
                Ok(())
            }
        }
    }

    fn join_slot(&mut self, t: usize) -> Result<()> {
        let Some(handle) = self.slots[t].handle.take() else {
            return Ok(());
        };
        match handle.join() {
            Ok((core, list, rc)) => {
                self.slots[t].core = Some(core);
                self.slots[t].spare = Some(list);
                rc
            }
            Err(_) => Err(Error::Thread),
        }
    }

    /// Join every outstanding flush worker, highest-indexed first.
    fn join_all(&mut self) -> Result<()> {
        let mut rc = Ok(());
        for t in (0..self.slots.len()).rev() {
            let r = self.join_slot(t);
            if rc.is_ok() {
                rc = r;
            }
        }
        rc
    }

    /// End the write phase and ready the sorted stream. Returns true when
    /// the sorter holds no records at all.
    pub fn rewind(&mut self) -> Result<bool> {
        self.check_err()?;
        if self.state != State::Build {
            return self.fail(Error::Misuse("rewind outside the write phase"));
        }
        if self.declared_fields > self.cmp.fields() {
            return self.fail(Error::KeyInfoMismatch {
                expected: self.cmp.fields(),
                got: self.declared_fields,
            });
        }
        if !self.use_pma {
            // Nothing was spilled; serve reads from the sorted list.
            self.state = State::Read;
            if self.list.is_empty() {
                return Ok(true);
            }
            let rc = match self.slots[0].core.as_mut() {
                Some(core) => sort_list(&mut core.ctx, &mut self.list),
                None => Err(Error::Misuse("subtask core missing")),
            };
            self.stick(rc)?;
            return Ok(false);
        }
        let rc_flush = self.flush_pma();
        let rc_join = self.join_all();
        self.stick(rc_flush)?;
        self.stick(rc_join)?;
        let rc = self.setup_merge();
        self.stick(rc)?;
        self.state = State::Read;
        Ok(false)
    }

    /// Number of PMAs written so far across all subtasks.
    pub fn pma_count(&self) -> usize {
        self.slots.iter().filter_map(|s| s.core.as_ref()).map(|c| c.n_pma).sum()
    }

    fn fresh_ctx(&self) -> SortCtx {
        SortCtx::new(&self.cmp, self.field_limit, self.io)
    }

    /// Build the merge tree over every PMA on disk and seed its readers.
    fn setup_merge(&mut self) -> Result<()> {
        let main = self.merge_tree_build()?;
        if self.use_threads {
            let mut read_ctx = self.fresh_ctx();
            let last = self.slots.len() - 1;
            let last_file2 = match self.slots[last].core.as_ref() {
                Some(core) => Arc::clone(&core.file2),
                None => return Err(Error::Misuse("subtask core missing")),
            };
            let mut root =
                IncrMerger::new(last_file2, main, self.mx_keysize, self.cfg.max_pma_size);
            root.set_threads(self.fresh_ctx());
            let mut bg = Vec::new();
            if let Some(merger) = root.merger.as_mut() {
                for reader in merger.readers.iter_mut() {
                    if let Some(incr) = reader.incr.as_mut() {
                        incr.set_threads(SortCtx::new(&self.cmp, self.field_limit, self.io));
                    }
                }
                // Task-mode init runs in background threads, except for the
                // last subtask whose populate work lands on this thread.
                let n = self.slots.len();
                for t in 0..n {
                    if merger.readers[t].incr.is_none() {
                        continue;
                    }
                    if t == n - 1 {
                        let mut ctx = SortCtx::new(&self.cmp, self.field_limit, self.io);
                        merger.readers[t].incr_init(&mut ctx, IncrInitMode::Task)?;
                    } else {
                        let mut reader = std::mem::take(&mut merger.readers[t]);
                        let mut ctx = SortCtx::new(&self.cmp, self.field_limit, self.io);
                        bg.push((
                            t,
                            std::thread::spawn(move || {
                                let rc = reader.incr_init(&mut ctx, IncrInitMode::Task);
                                (reader, rc)
                            }),
                        ));
                    }
                }
            }
            let mut rc: Result<()> = Ok(());
            for (t, handle) in bg {
                match handle.join() {
                    Ok((reader, r)) => {
                        if let Some(merger) = root.merger.as_mut() {
                            merger.readers[t] = reader;
                        }
                        if rc.is_ok() {
                            rc = r;
                        }
                    }
                    Err(_) => {
                        if rc.is_ok() {
                            rc = Err(Error::Thread);
                        }
                    }
                }
            }
            rc?;
            let mut reader = Box::new(PmaReader::default());
            reader.incr = Some(root);
            reader.incr_init(&mut read_ctx, IncrInitMode::Root)?;
            self.reader = Some(reader);
            self.read_ctx = Some(read_ctx);
        } else {
            let mut main = main;
            match self.slots[0].core.as_mut() {
                Some(core) => main.init(&mut core.ctx, IncrInitMode::Normal)?,
                None => return Err(Error::Misuse("subtask core missing")),
            }
            self.merger = Some(main);
        }
        Ok(())
    }

    /// Build the merge-engine tree: one subtree per subtask (fan-in 16 with
    /// incremental mergers between levels), plus a top-level engine reading
    /// one stream per subtask when threads are in use.
    fn merge_tree_build(&mut self) -> Result<Box<MergeEngine>> {
        let n_task = self.slots.len();
        let mut main: Option<Box<MergeEngine>> =
            if self.use_threads { Some(Box::new(MergeEngine::new(n_task))) } else { None };
        for t in 0..n_task {
            let n_pma = self.slots[t].core.as_ref().map_or(0, |core| core.n_pma);
            if n_pma == 0 {
                continue;
            }
            let root = self.task_tree(t, n_pma)?;
            match main.as_mut() {
                None => main = Some(root),
                Some(main) => {
                    let file2 = match self.slots[t].core.as_ref() {
                        Some(core) => Arc::clone(&core.file2),
                        None => return Err(Error::Misuse("subtask core missing")),
                    };
                    main.readers[t].incr = Some(IncrMerger::new(
                        file2,
                        root,
                        self.mx_keysize,
                        self.cfg.max_pma_size,
                    ));
                }
            }
        }
        main.ok_or(Error::Misuse("rewind without records"))
    }

    /// Merge tree for one subtask's level-0 PMAs.
    fn task_tree(&mut self, t: usize, n_pma: usize) -> Result<Box<MergeEngine>> {
        let (file, file2) = match self.slots[t].core.as_ref() {
            Some(core) => match core.file.clone() {
                Some(file) => (file, Arc::clone(&core.file2)),
                None => return Err(Error::Misuse("subtask has PMAs but no file")),
            },
            None => return Err(Error::Misuse("subtask core missing")),
        };
        let io = self.io;
        let mut off = 0u64;
        if n_pma <= MAX_MERGE_COUNT {
            let mut engine = Box::new(MergeEngine::new(n_pma));
            let Some(core) = self.slots[t].core.as_mut() else {
                return Err(Error::Misuse("subtask core missing"));
            };
            for i in 0..n_pma {
                off = engine.readers[i].init_pma(io, &file, off, &mut core.ctx)?;
            }
            return Ok(engine);
        }
        let depth = tree_depth(n_pma);
        let mut root = Box::new(MergeEngine::new(MAX_MERGE_COUNT));
        let mut seq = 0usize;
        let mut i = 0usize;
        while i < n_pma {
            let n = (n_pma - i).min(MAX_MERGE_COUNT);
            let mut engine = Box::new(MergeEngine::new(n));
            {
                let Some(core) = self.slots[t].core.as_mut() else {
                    return Err(Error::Misuse("subtask core missing"));
                };
                for j in 0..n {
                    off = engine.readers[j].init_pma(io, &file, off, &mut core.ctx)?;
                }
            }
            add_to_tree(
                &mut root,
                depth,
                seq,
                engine,
                &file2,
                self.mx_keysize,
                self.cfg.max_pma_size,
            )?;
            seq += 1;
            i += n;
        }
        Ok(root)
    }

    /// Step to the next record of the sorted stream; true at EOF.
    pub fn next(&mut self) -> Result<bool> {
        self.check_err()?;
        if self.state != State::Read {
            return self.fail(Error::Misuse("next before rewind"));
        }
        if !self.use_pma {
            if self.list.head == NIL {
                return Ok(true);
            }
            self.list.head = self.list.next[self.list.head as usize];
            return Ok(self.list.head == NIL);
        }
        if self.use_threads {
            let rc = match (self.reader.as_mut(), self.read_ctx.as_mut()) {
                (Some(reader), Some(ctx)) => reader.next(ctx).and_then(|()| ctx.take_err()),
                _ => Err(Error::Misuse("reader missing")),
            };
            self.stick(rc)?;
            Ok(self.reader.as_ref().is_none_or(|r| r.is_eof()))
        } else {
            let rc = match (self.merger.as_mut(), self.slots[0].core.as_mut()) {
                (Some(merger), Some(core)) => merger.advance(&mut core.ctx),
                _ => Err(Error::Misuse("merger missing")),
            };
            self.stick(rc)
        }
    }

    /// Current key, by reference; valid until the next advance.
    pub fn rowkey(&self) -> Result<&[u8]> {
        self.check_err()?;
        if self.state != State::Read {
            return Err(Error::Misuse("rowkey before rewind"));
        }
        if !self.use_pma {
            if self.list.head == NIL {
                return Err(Error::Misuse("rowkey at EOF"));
            }
            return Ok(self.list.store.rec(self.list.head));
        }
        let reader = if self.use_threads {
            self.reader.as_deref()
        } else {
            self.merger.as_ref().map(|m| m.current())
        };
        match reader {
            Some(reader) if !reader.is_eof() => Ok(reader.key()),
            _ => Err(Error::Misuse("rowkey at EOF")),
        }
    }

    /// Copy the current key into `out`.
    pub fn rowkey_to(&self, out: &mut Vec<u8>) -> Result<()> {
        let key = self.rowkey()?;
        out.clear();
        out.extend_from_slice(key);
        Ok(())
    }

    /// Compare a caller key against the current sorter key, ignoring the
    /// trailing `n_ignore` fields of the sorter key. A sorter key holding
    /// any NULL field reports `Less` without consulting the comparator.
    pub fn compare(&mut self, key: &[u8], n_ignore: usize) -> Result<Ordering> {
        self.check_err()?;
        if self.state != State::Read {
            return self.fail(Error::Misuse("compare before rewind"));
        }
        let Some(limit) = self.cmp.fields().checked_sub(n_ignore).filter(|n| *n > 0) else {
            return self.fail(Error::Misuse("ignore count leaves no fields"));
        };
        let mut scratch = match self.scratch.take() {
            Some(scratch) => scratch,
            None => UnpackedRecord::new(limit),
        };
        scratch.set_field_limit(limit);
        {
            let current = match self.rowkey() {
                Ok(current) => current,
                Err(err) => {
                    self.scratch = Some(scratch);
                    return Err(err);
                }
            };
            scratch.unpack(current);
        }
        let result = match scratch.err.take() {
            Some(err) => self.fail(err.into()),
            None if scratch.has_null() => Ok(Ordering::Less),
            None => {
                let ord = self.cmp.compare(key, None, &mut scratch);
                match scratch.err.take() {
                    Some(err) => self.fail(err.into()),
                    None => Ok(ord),
                }
            }
        };
        self.scratch = Some(scratch);
        result
    }

    /// Return the sorter to its empty write-phase state, keeping its
    /// configuration and buffers. Clears any sticky error.
    pub fn reset(&mut self) {
        let _ = self.join_all();
        self.reader = None;
        self.merger = None;
        self.read_ctx = None;
        for slot in &mut self.slots {
            slot.spare = None;
            if let Some(core) = slot.core.as_mut() {
                core.file = None;
                core.n_pma = 0;
                let mut file2 = lock_file2(&core.file2);
                file2.fd = None;
                file2.eof = 0;
            }
        }
        self.list.clear();
        self.use_pma = false;
        self.mx_keysize = 0;
        self.i_prev = 0;
        self.scratch = None;
        self.err = None;
        self.state = State::Build;
    }

    /// Release every resource. Dropping the sorter is equivalent.
    pub fn close(self) {}
}

impl Drop for Sorter {
    fn drop(&mut self) {
        let _ = self.join_all();
        // Readers and mergers join their populate threads as they drop;
        // temp files are anonymous and vanish with their handles.
        self.reader = None;
        self.merger = None;
    }
}

/// Depth of the incremental merge tree over `n_pma` inputs, excluding the
/// leaf level: up to 16 PMAs merge directly, 256 need one extra level, and
/// so on.
fn tree_depth(n_pma: usize) -> usize {
    let mut depth = 0;
    let mut div = MAX_MERGE_COUNT as u64;
    while div < n_pma as u64 {
        div *= MAX_MERGE_COUNT as u64;
        depth += 1;
    }
    depth
}

/// Attach `leaf` (the `seq`'th level-0 merge engine) to the incremental
/// merge tree rooted at `root`, creating intermediate engines on demand.
fn add_to_tree(
    root: &mut MergeEngine,
    depth: usize,
    seq: usize,
    leaf: Box<MergeEngine>,
    file2: &Arc<Mutex<TaskFile>>,
    mx_keysize: usize,
    mx_pma_size: usize,
) -> Result<()> {
    let incr = IncrMerger::new(Arc::clone(file2), leaf, mx_keysize, mx_pma_size);
    let mut n_div = 1usize;
    for _ in 1..depth {
        n_div *= MAX_MERGE_COUNT;
    }
    let mut p: &mut MergeEngine = root;
    for _ in 1..depth {
        let i_iter = (seq / n_div) % MAX_MERGE_COUNT;
        let node = p;
        let reader = &mut node.readers[i_iter];
        if reader.incr.is_none() {
            let sub = Box::new(MergeEngine::new(MAX_MERGE_COUNT));
            reader.incr = Some(IncrMerger::new(Arc::clone(file2), sub, mx_keysize, mx_pma_size));
        }
        let Some(incr_ref) = reader.incr.as_mut() else {
            return Err(Error::Misuse("merge tree shape"));
        };
        let Some(merger) = incr_ref.merger.as_mut() else {
            return Err(Error::Misuse("merge tree shape"));
        };
        p = merger;
        n_div /= MAX_MERGE_COUNT;
    }
    p.readers[seq % MAX_MERGE_COUNT].incr = Some(incr);
    Ok(())
}

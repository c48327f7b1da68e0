//! Log-structured append-only key→value store.
//!
//! Keys are immutable content digests: there is no delete and no update, and
//! inserting an existing key fails with [`StoreError::KeyExists`]. The store
//! keeps three sibling files under its directory:
//!
//! - `blocks.dat` — header followed by appended `[key_len][data_len][key][data]`
//!   records,
//! - `blocks.key` — header followed by appended `[key_len][key][offset][size]`
//!   index entries, scanned at open to rebuild the in-memory index,
//! - `blocks.log` — write-ahead journal marking an insert in flight; a
//!   non-empty journal at open means the tail past the last fully indexed
//!   record is torn and gets truncated.
//!
//! An insert journals its intent, appends the record, appends the index
//! entry, then clears the journal, so any crash leaves a prefix of committed
//! records plus a reconstructible tail. The in-memory index is an `ahash`
//! map seeded from the salt recorded in the file headers.

use std::{
    fs::{File, OpenOptions},
    io::{self, Cursor, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use ahash::RandomState;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

const DAT_FILE: &str = "blocks.dat";
const KEY_FILE: &str = "blocks.key";
const LOG_FILE: &str = "blocks.log";

const DAT_MAGIC: [u8; 8] = *b"strata.d";
const KEY_MAGIC: [u8; 8] = *b"strata.k";
const FORMAT_VERSION: u32 = 1;

const DAT_HEADER_LEN: u64 = 8 + 4 + 4 + 8;
const KEY_HEADER_LEN: u64 = 8 + 4 + 8 + 4 + 8;

/// Record framing: key_len u8 + data_len u32 precede the key bytes.
const RECORD_PREFIX_LEN: u64 = 1 + 4;
/// Index entry framing past the key bytes: offset u64 + size u32.
const ENTRY_SUFFIX_LEN: usize = 8 + 4;

#[derive(Error, Debug)]
pub enum StoreError {
    /// The key is already present. Benign under concurrent fills of the same
    /// block: the store is idempotent on equal-key-equal-value inserts.
    #[error("key already exists")]
    KeyExists,

    #[error("key not found")]
    NotFound,

    /// The record format cannot represent zero-length values.
    #[error("zero-length values are not supported")]
    EmptyValue,

    #[error("key length {0} exceeds maximum")]
    KeyTooLong(usize),

    #[error("store corrupt: {0}")]
    Corrupt(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    /// Offset of the value bytes inside `blocks.dat`.
    offset: u64,
    size: u32,
}

struct Writer {
    dat: File,
    key: File,
    log: File,
    /// End of the last committed record in `blocks.dat`.
    data_end: u64,
}

struct RateWindow {
    at: Instant,
    bytes: u64,
}

/// Handle to an open store. Cheap to clone via `Arc`; `fetch` and `insert`
/// are safe to call concurrently.
pub struct Store {
    path: PathBuf,
    salt: u64,
    app_num: u32,
    block_size: u32,
    load_factor: f64,
    index: RwLock<std::collections::HashMap<Box<[u8]>, Slot, RandomState>>,
    writer: Mutex<Writer>,
    reader: Mutex<File>,
    record_count: AtomicU64,
    bytes_written: AtomicU64,
    rate: Mutex<RateWindow>,
}

impl Store {
    /// Generates a fresh random salt for store creation.
    #[must_use]
    pub fn new_salt() -> u64 {
        rand::random()
    }

    /// Creates the three store files under `dir`. Fails if `blocks.dat`
    /// already exists.
    pub fn create(
        dir: &Path,
        app_num: u32,
        salt: u64,
        block_size: u32,
        load_factor: f64,
    ) -> Result<(), StoreError> {
        std::fs::create_dir_all(dir)?;
        let dat_path = dir.join(DAT_FILE);
        if dat_path.exists() {
            return Err(StoreError::Corrupt(format!("{} already exists", dat_path.display())));
        }

        let mut dat = File::create(&dat_path)?;
        dat.write_all(&DAT_MAGIC)?;
        dat.write_all(&FORMAT_VERSION.to_le_bytes())?;
        dat.write_all(&app_num.to_le_bytes())?;
        dat.write_all(&salt.to_le_bytes())?;
        dat.sync_all()?;

        let mut key = File::create(dir.join(KEY_FILE))?;
        key.write_all(&KEY_MAGIC)?;
        key.write_all(&FORMAT_VERSION.to_le_bytes())?;
        key.write_all(&salt.to_le_bytes())?;
        key.write_all(&block_size.to_le_bytes())?;
        key.write_all(&load_factor.to_le_bytes())?;
        key.sync_all()?;

        File::create(dir.join(LOG_FILE))?.sync_all()?;
        Ok(())
    }

    /// Opens an existing store, rebuilding the in-memory index from the key
    /// file and truncating any torn tail left by a crash mid-insert.
    pub fn open(dir: &Path) -> Result<Arc<Self>, StoreError> {
        let dat_path = dir.join(DAT_FILE);
        let key_path = dir.join(KEY_FILE);
        let log_path = dir.join(LOG_FILE);

        let mut dat = OpenOptions::new().read(true).write(true).open(&dat_path)?;
        let (app_num, dat_salt) = read_dat_header(&mut dat)?;

        let mut key = OpenOptions::new().read(true).write(true).open(&key_path)?;
        let (key_salt, block_size, load_factor) = read_key_header(&mut key)?;
        if key_salt != dat_salt {
            return Err(StoreError::Corrupt(format!(
                "salt mismatch between {DAT_FILE} and {KEY_FILE}"
            )));
        }

        let hasher = RandomState::with_seeds(
            dat_salt,
            dat_salt.rotate_left(17),
            dat_salt.rotate_left(31),
            dat_salt.rotate_left(47),
        );
        let mut index = std::collections::HashMap::with_hasher(hasher);

        let dat_len = dat.metadata()?.len();
        let key_len = key.metadata()?.len();
        let mut entries = Vec::new();
        key.seek(SeekFrom::Start(KEY_HEADER_LEN))?;
        let mut reader = io::BufReader::new(&mut key);
        let mut pos = KEY_HEADER_LEN;
        let mut data_end = DAT_HEADER_LEN;
        loop {
            match read_index_entry(&mut reader, pos, key_len, dat_len) {
                Some((entry_key, slot, next_pos)) => {
                    data_end = data_end.max(slot.offset + u64::from(slot.size));
                    entries.push((entry_key, slot));
                    pos = next_pos;
                }
                None => break,
            }
        }
        drop(reader);

        // A short tail in either file is the remnant of an interrupted
        // insert: drop it so reads only ever see committed records.
        if pos < key_len {
            key.set_len(pos)?;
        }
        if data_end < dat_len {
            dat.set_len(data_end)?;
        }

        let log = OpenOptions::new().read(true).write(true).open(&log_path)?;
        log.set_len(0)?;

        let record_count = entries.len() as u64;
        for (k, slot) in entries {
            index.insert(k, slot);
        }

        dat.seek(SeekFrom::End(0))?;
        key.seek(SeekFrom::End(0))?;
        let reader_file = File::open(&dat_path)?;

        Ok(Arc::new(Self {
            path: dir.to_path_buf(),
            salt: dat_salt,
            app_num,
            block_size,
            load_factor,
            index: RwLock::new(index),
            writer: Mutex::new(Writer { dat, key, log, data_end }),
            reader: Mutex::new(reader_file),
            record_count: AtomicU64::new(record_count),
            bytes_written: AtomicU64::new(0),
            rate: Mutex::new(RateWindow { at: Instant::now(), bytes: 0 }),
        }))
    }

    /// Opens the store under `dir`, creating it first when `blocks.dat` is
    /// absent (app-num 1, fresh salt, 4096-byte blocks, 0.5 load factor).
    pub fn open_or_create(dir: &Path) -> Result<Arc<Self>, StoreError> {
        if !dir.join(DAT_FILE).exists() {
            tracing::info!(path = %dir.display(), "creating block store");
            Self::create(dir, 1, Self::new_salt(), 4096, 0.5)?;
        }
        tracing::info!(path = %dir.display(), "opening block store");
        Self::open(dir)
    }

    /// Durably appends `value` under `key`, or reports [`StoreError::KeyExists`].
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        if value.is_empty() {
            return Err(StoreError::EmptyValue);
        }
        if key.len() > usize::from(u8::MAX) {
            return Err(StoreError::KeyTooLong(key.len()));
        }
        if self.index.read().contains_key(key) {
            return Err(StoreError::KeyExists);
        }

        let mut w = self.writer.lock();
        // A racing insert may have committed while we waited for the writer.
        if self.index.read().contains_key(key) {
            return Err(StoreError::KeyExists);
        }

        let key_len = key.len() as u8;
        let data_len = u32::try_from(value.len())
            .map_err(|_| StoreError::Corrupt(format!("value of {} bytes too large", value.len())))?;

        // Journal the intent first so an interrupted append is recoverable.
        w.log.seek(SeekFrom::Start(0))?;
        w.log.write_all(&[key_len])?;
        w.log.write_all(&data_len.to_le_bytes())?;
        w.log.write_all(key)?;
        w.log.sync_data()?;

        let record_start = w.data_end;
        w.dat.seek(SeekFrom::Start(record_start))?;
        w.dat.write_all(&[key_len])?;
        w.dat.write_all(&data_len.to_le_bytes())?;
        w.dat.write_all(key)?;
        w.dat.write_all(value)?;
        w.dat.sync_data()?;

        let offset = record_start + RECORD_PREFIX_LEN + u64::from(key_len);
        w.key.write_all(&[key_len])?;
        w.key.write_all(key)?;
        w.key.write_all(&offset.to_le_bytes())?;
        w.key.write_all(&data_len.to_le_bytes())?;
        w.key.sync_data()?;

        w.log.set_len(0)?;
        w.data_end = offset + u64::from(data_len);

        self.index.write().insert(key.into(), Slot { offset, size: data_len });
        self.record_count.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(u64::from(data_len), Ordering::Relaxed);
        Ok(())
    }

    /// Returns a reader over the value stored under `key`.
    pub fn fetch(&self, key: &[u8]) -> Result<Fetch, StoreError> {
        let slot = *self.index.read().get(key).ok_or(StoreError::NotFound)?;
        let mut buf = vec![0u8; slot.size as usize];
        {
            let mut reader = self.reader.lock();
            reader.seek(SeekFrom::Start(slot.offset))?;
            reader.read_exact(&mut buf)?;
        }
        Ok(Fetch { inner: Cursor::new(buf) })
    }

    /// True iff `key` has a committed record.
    #[must_use]
    pub fn contains(&self, key: &[u8]) -> bool {
        self.index.read().contains_key(key)
    }

    #[must_use]
    pub fn record_count(&self) -> u64 {
        self.record_count.load(Ordering::Relaxed)
    }

    /// Bytes-per-second write rate since the previous call.
    #[must_use]
    pub fn write_rate(&self) -> f64 {
        let total = self.bytes_written.load(Ordering::Relaxed);
        let mut window = self.rate.lock();
        let elapsed = window.at.elapsed().as_secs_f64();
        let delta = total.saturating_sub(window.bytes);
        window.at = Instant::now();
        window.bytes = total;
        if elapsed > 0.0 {
            delta as f64 / elapsed
        } else {
            0.0
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn salt(&self) -> u64 {
        self.salt
    }

    #[must_use]
    pub fn app_num(&self) -> u32 {
        self.app_num
    }

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    #[must_use]
    pub fn load_factor(&self) -> f64 {
        self.load_factor
    }

    /// Flushes the data file. Called on shutdown; inserts are already
    /// synced individually.
    pub fn close(&self) -> Result<(), StoreError> {
        let w = self.writer.lock();
        w.dat.sync_all()?;
        w.key.sync_all()?;
        Ok(())
    }
}

/// Positioned reader over a single stored value.
pub struct Fetch {
    inner: Cursor<Vec<u8>>,
}

impl Fetch {
    /// Size of the value in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.get_ref().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.get_ref().is_empty()
    }
}

impl Read for Fetch {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

fn read_dat_header(dat: &mut File) -> Result<(u32, u64), StoreError> {
    let mut magic = [0u8; 8];
    let mut word = [0u8; 4];
    let mut salt = [0u8; 8];
    dat.seek(SeekFrom::Start(0))?;
    dat.read_exact(&mut magic)
        .map_err(|_| StoreError::Corrupt(format!("{DAT_FILE} header truncated")))?;
    if magic != DAT_MAGIC {
        return Err(StoreError::Corrupt(format!("{DAT_FILE} has wrong magic")));
    }
    dat.read_exact(&mut word)?;
    if u32::from_le_bytes(word) != FORMAT_VERSION {
        return Err(StoreError::Corrupt(format!(
            "{DAT_FILE} format version {} unsupported",
            u32::from_le_bytes(word)
        )));
    }
    dat.read_exact(&mut word)?;
    let app_num = u32::from_le_bytes(word);
    dat.read_exact(&mut salt)?;
    Ok((app_num, u64::from_le_bytes(salt)))
}

fn read_key_header(key: &mut File) -> Result<(u64, u32, f64), StoreError> {
    let mut magic = [0u8; 8];
    let mut word = [0u8; 4];
    let mut wide = [0u8; 8];
    key.seek(SeekFrom::Start(0))?;
    key.read_exact(&mut magic)
        .map_err(|_| StoreError::Corrupt(format!("{KEY_FILE} header truncated")))?;
    if magic != KEY_MAGIC {
        return Err(StoreError::Corrupt(format!("{KEY_FILE} has wrong magic")));
    }
    key.read_exact(&mut word)?;
    if u32::from_le_bytes(word) != FORMAT_VERSION {
        return Err(StoreError::Corrupt(format!(
            "{KEY_FILE} format version {} unsupported",
            u32::from_le_bytes(word)
        )));
    }
    key.read_exact(&mut wide)?;
    let salt = u64::from_le_bytes(wide);
    key.read_exact(&mut word)?;
    let block_size = u32::from_le_bytes(word);
    key.read_exact(&mut wide)?;
    let load_factor = f64::from_le_bytes(wide);
    Ok((salt, block_size, load_factor))
}

/// Reads one index entry, returning `None` for a truncated or out-of-range
/// entry (the torn tail marker).
fn read_index_entry(
    reader: &mut impl Read,
    pos: u64,
    key_file_len: u64,
    dat_len: u64,
) -> Option<(Box<[u8]>, Slot, u64)> {
    let mut len_byte = [0u8; 1];
    if reader.read_exact(&mut len_byte).is_err() {
        return None;
    }
    let key_len = usize::from(len_byte[0]);
    let entry_len = 1 + key_len as u64 + ENTRY_SUFFIX_LEN as u64;
    if key_len == 0 || pos + entry_len > key_file_len {
        return None;
    }
    let mut key = vec![0u8; key_len];
    if reader.read_exact(&mut key).is_err() {
        return None;
    }
    let mut wide = [0u8; 8];
    let mut word = [0u8; 4];
    if reader.read_exact(&mut wide).is_err() || reader.read_exact(&mut word).is_err() {
        return None;
    }
    let slot = Slot { offset: u64::from_le_bytes(wide), size: u32::from_le_bytes(word) };
    if slot.size == 0 || slot.offset < DAT_HEADER_LEN || slot.offset + u64::from(slot.size) > dat_len
    {
        return None;
    }
    Some((key.into_boxed_slice(), slot, pos + entry_len))
}

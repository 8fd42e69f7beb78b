#![allow(dead_code)]

use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use spitelog::{Binlog, BinlogOptions, DbKey, Result};

pub fn temp_binlog(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    (dir, path)
}

/// Opens the binlog and collects every replayed live event as (id, payload).
pub fn open_and_collect(
    path: &Path,
    options: BinlogOptions,
) -> Result<(Binlog, Vec<(u64, Vec<u8>)>)> {
    let mut replayed = Vec::new();
    let binlog = Binlog::open(path, options, |event| {
        replayed.push((event.id.0, event.data().to_vec()));
    })?;
    Ok((binlog, replayed))
}

/// Opens, replays, closes; returns the live set as (id, payload) in id order.
pub fn replay_set(path: &Path, options: BinlogOptions) -> Vec<(u64, Vec<u8>)> {
    let (mut binlog, replayed) = open_and_collect(path, options).expect("open binlog");
    binlog.close(false).expect("close binlog");
    replayed
}

pub fn plain_options() -> BinlogOptions {
    BinlogOptions::new()
}

pub fn password_options(password: &str) -> BinlogOptions {
    BinlogOptions::new().with_db_key(DbKey::password(password))
}

/// Raw keys take the fast derivation path, keeping encrypted tests quick.
pub fn raw_key_options(seed: u8) -> BinlogOptions {
    BinlogOptions::new().with_db_key(DbKey::raw_key(vec![seed; 32]))
}

pub fn file_size(path: &Path) -> u64 {
    std::fs::metadata(path).expect("stat file").len()
}

pub fn read_file(path: &Path) -> Vec<u8> {
    std::fs::read(path).expect("read file")
}

/// Truncates the file to `len` bytes, simulating a crash mid-write.
pub fn truncate_file(path: &Path, len: u64) {
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .expect("open for truncate");
    file.set_len(len).expect("truncate file");
}

/// Flips every bit of the byte at `offset`.
pub fn corrupt_byte(path: &Path, offset: u64) {
    let mut file = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .expect("open for corruption");
    file.seek(SeekFrom::Start(offset)).expect("seek");
    let mut byte = [0u8; 1];
    file.read_exact(&mut byte).expect("read byte");
    byte[0] ^= 0xff;
    file.seek(SeekFrom::Start(offset)).expect("seek back");
    file.write_all(&byte).expect("write corrupted byte");
}

/// Overwrites the file contents at `offset` with `bytes`.
pub fn overwrite_bytes(path: &Path, offset: u64, bytes: &[u8]) {
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .expect("open for overwrite");
    file.seek(SeekFrom::Start(offset)).expect("seek");
    file.write_all(bytes).expect("overwrite bytes");
}

/// On-disk size of a frame holding `payload_len` payload bytes.
pub fn frame_size(payload_len: usize) -> u64 {
    (spitelog::codec::HEADER_SIZE + payload_len + spitelog::codec::TAIL_SIZE) as u64
}

/// The `.new` sidecar path used by compaction.
pub fn sidecar(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".new");
    PathBuf::from(os)
}

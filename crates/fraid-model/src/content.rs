//! Content file: the persisted snapshot of the array model.
//!
//! The snapshot holds everything the next run needs to resume: geometry,
//! hash algorithm/seed pairs, every disk's file table and block cells, and
//! the per-index info words. Runtime configuration (parity paths, autosave
//! threshold) lives in the user config, not here.
//!
//! # Format
//!
//! ```text
//! Content File:
//! +------------------+---------+
//! | magic            | 4 bytes | = "FRCT"
//! | version          | 4 bytes | = 1
//! | block_size       | 4 bytes |
//! | level            | 4 bytes |
//! | hash kind        | 4 bytes | 0 = BLAKE3, 1 = XXH3
//! | hash seed        | 16 bytes|
//! | prev hash kind   | 4 bytes |
//! | prev hash seed   | 16 bytes|
//! | clear_past_hash  | 4 bytes |
//! | disk_count       | 4 bytes |
//! +------------------+---------+
//! | For each disk:             |
//! |   name, dir      | len+data|
//! |   file table     |         |
//! |   block cells    | tagged  |
//! +------------------+---------+
//! | info words       | 8 bytes each
//! | crc32c           | 4 bytes | CRC of entire content before this field
//! +------------------+---------+
//! ```
//!
//! Writes go to a temp file, are fsynced, and are renamed over the old
//! snapshot, so a crash mid-write leaves the previous snapshot intact.

use crate::block::{BlockCell, Disk, FileEntity, FileId, LiveState};
use crate::info::{InfoArray, InfoWord};
use crate::ArrayState;
use fraid_error::{FraidError, Result};
use fraid_hash::{HashKind, HashSpec};
use fraid_types::{read_fixed, read_le_u32, read_le_u64, BlockHash, BlockIndex, BlockSize};
use std::io::Write;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

const MAGIC: u32 = u32::from_le_bytes(*b"FRCT");
const VERSION: u32 = 1;

const TAG_EMPTY: u8 = 0;
const TAG_DELETED: u8 = 1;
const TAG_CHG: u8 = 2;
const TAG_REP: u8 = 3;
const TAG_BLK: u8 = 4;

// ── Encode ──────────────────────────────────────────────────────────────────

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_i64(out: &mut Vec<u8>, v: i64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    #[expect(clippy::cast_possible_truncation)] // paths and names are short
    put_u32(out, bytes.len() as u32);
    out.extend_from_slice(bytes);
}

fn hash_kind_id(kind: HashKind) -> u32 {
    match kind {
        HashKind::Blake3 => 0,
        HashKind::Xxh3 => 1,
    }
}

fn put_spec(out: &mut Vec<u8>, spec: &HashSpec) {
    put_u32(out, hash_kind_id(spec.kind));
    out.extend_from_slice(&spec.seed);
}

fn put_cell(out: &mut Vec<u8>, cell: &BlockCell) {
    match cell {
        BlockCell::Empty => out.push(TAG_EMPTY),
        BlockCell::Deleted { hash } => {
            out.push(TAG_DELETED);
            out.extend_from_slice(&hash.0);
        }
        BlockCell::Live {
            state,
            file,
            file_pos,
            hash,
        } => {
            out.push(match state {
                LiveState::Chg => TAG_CHG,
                LiveState::Rep => TAG_REP,
                LiveState::Blk => TAG_BLK,
            });
            put_u32(out, file.0);
            put_u32(out, *file_pos);
            out.extend_from_slice(&hash.0);
        }
    }
}

#[expect(clippy::cast_possible_truncation)] // counts bounded by u32 indices
pub(crate) fn encode(state: &ArrayState) -> Vec<u8> {
    let mut out = Vec::new();
    put_u32(&mut out, MAGIC);
    put_u32(&mut out, VERSION);
    put_u32(&mut out, state.block_size.get());
    put_u32(&mut out, state.level as u32);
    put_spec(&mut out, &state.hash);
    put_spec(&mut out, &state.prev_hash);
    put_u32(&mut out, u32::from(state.clear_past_hash));

    put_u32(&mut out, state.disks.len() as u32);
    for disk in &state.disks {
        put_bytes(&mut out, disk.name.as_bytes());
        put_bytes(&mut out, disk.dir.as_os_str().as_bytes());

        put_u32(&mut out, disk.files().len() as u32);
        for file in disk.files() {
            put_bytes(&mut out, file.sub.as_os_str().as_bytes());
            put_u64(&mut out, file.size);
            put_i64(&mut out, file.mtime_sec);
            put_u32(&mut out, file.mtime_nsec);
            put_u64(&mut out, file.inode);
            put_u32(&mut out, u32::from(file.is_copy));
        }

        put_u32(&mut out, disk.raw_blocks().len() as u32);
        for cell in disk.raw_blocks() {
            put_cell(&mut out, cell);
        }
    }

    put_u32(&mut out, state.info.raw().len() as u32);
    for word in state.info.raw() {
        put_u64(&mut out, word.0);
    }

    let crc = crc32c::crc32c(&out);
    put_u32(&mut out, crc);
    out
}

// ── Decode ──────────────────────────────────────────────────────────────────

struct Reader<'a> {
    data: &'a [u8],
    off: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, off: 0 }
    }

    fn bad(detail: impl Into<String>) -> FraidError {
        FraidError::Content {
            detail: detail.into(),
        }
    }

    fn u32(&mut self) -> Result<u32> {
        let v = read_le_u32(self.data, self.off).map_err(|e| Self::bad(e.to_string()))?;
        self.off += 4;
        Ok(v)
    }

    fn u64(&mut self) -> Result<u64> {
        let v = read_le_u64(self.data, self.off).map_err(|e| Self::bad(e.to_string()))?;
        self.off += 8;
        Ok(v)
    }

    fn i64(&mut self) -> Result<i64> {
        let bytes: [u8; 8] =
            read_fixed(self.data, self.off).map_err(|e| Self::bad(e.to_string()))?;
        self.off += 8;
        Ok(i64::from_le_bytes(bytes))
    }

    fn u8(&mut self) -> Result<u8> {
        let bytes: [u8; 1] =
            read_fixed(self.data, self.off).map_err(|e| Self::bad(e.to_string()))?;
        self.off += 1;
        Ok(bytes[0])
    }

    fn hash(&mut self) -> Result<BlockHash> {
        let bytes: [u8; 16] =
            read_fixed(self.data, self.off).map_err(|e| Self::bad(e.to_string()))?;
        self.off += 16;
        Ok(BlockHash(bytes))
    }

    fn bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.u32()? as usize;
        let slice = fraid_types::ensure_slice(self.data, self.off, len)
            .map_err(|e| Self::bad(e.to_string()))?;
        self.off += len;
        Ok(slice.to_vec())
    }

    fn spec(&mut self) -> Result<HashSpec> {
        let kind = match self.u32()? {
            0 => HashKind::Blake3,
            1 => HashKind::Xxh3,
            other => return Err(Self::bad(format!("unknown hash kind {other}"))),
        };
        let seed: [u8; 16] =
            read_fixed(self.data, self.off).map_err(|e| Self::bad(e.to_string()))?;
        self.off += 16;
        Ok(HashSpec::new(kind, seed))
    }
}

pub(crate) fn decode(data: &[u8]) -> Result<ArrayState> {
    if data.len() < 4 {
        return Err(Reader::bad("file too short"));
    }
    let (body, crc_bytes) = data.split_at(data.len() - 4);
    let stored = u32::from_le_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    let computed = crc32c::crc32c(body);
    if stored != computed {
        return Err(Reader::bad(format!(
            "crc mismatch: stored {stored:#010x}, computed {computed:#010x}"
        )));
    }

    let mut r = Reader::new(body);
    let magic = r.u32()?;
    if magic != MAGIC {
        return Err(FraidError::Content {
            detail: format!("invalid magic {magic:#010x}"),
        });
    }
    let version = r.u32()?;
    if version != VERSION {
        return Err(Reader::bad(format!("unsupported version {version}")));
    }

    let block_size = BlockSize::new(r.u32()?).map_err(|e| Reader::bad(e.to_string()))?;
    let level = r.u32()? as usize;
    if level == 0 || level > fraid_types::LEV_MAX {
        return Err(Reader::bad(format!("invalid level {level}")));
    }
    let hash = r.spec()?;
    let prev_hash = r.spec()?;
    let clear_past_hash = r.u32()? != 0;

    let disk_count = r.u32()? as usize;
    let mut disks = Vec::with_capacity(disk_count);
    for _ in 0..disk_count {
        let name = String::from_utf8(r.bytes()?)
            .map_err(|_| Reader::bad("disk name is not utf-8"))?;
        let dir = PathBuf::from(std::ffi::OsString::from_vec(r.bytes()?));
        let mut disk = Disk::new(name, dir);

        let file_count = r.u32()? as usize;
        for _ in 0..file_count {
            let sub = PathBuf::from(std::ffi::OsString::from_vec(r.bytes()?));
            let size = r.u64()?;
            let mtime_sec = r.i64()?;
            let mtime_nsec = r.u32()?;
            let inode = r.u64()?;
            let flags = r.u32()?;
            disk.push_file(FileEntity {
                sub,
                size,
                mtime_sec,
                mtime_nsec,
                inode,
                is_copy: flags & 1 != 0,
            });
        }

        let block_count = r.u32()?;
        for i in 0..block_count {
            let cell = match r.u8()? {
                TAG_EMPTY => BlockCell::Empty,
                TAG_DELETED => BlockCell::Deleted { hash: r.hash()? },
                tag @ (TAG_CHG | TAG_REP | TAG_BLK) => {
                    let file = FileId(r.u32()?);
                    let file_pos = r.u32()?;
                    let hash = r.hash()?;
                    if file.0 as usize >= disk.files().len() {
                        return Err(Reader::bad(format!("block {i} references file {}", file.0)));
                    }
                    BlockCell::Live {
                        state: match tag {
                            TAG_CHG => LiveState::Chg,
                            TAG_REP => LiveState::Rep,
                            _ => LiveState::Blk,
                        },
                        file,
                        file_pos,
                        hash,
                    }
                }
                other => return Err(Reader::bad(format!("unknown block tag {other}"))),
            };
            disk.set_block(BlockIndex(i), cell);
        }
        disks.push(disk);
    }

    let info_count = r.u32()?;
    let mut info = InfoArray::new();
    for i in 0..info_count {
        info.set(BlockIndex(i), InfoWord(r.u64()?));
    }

    Ok(ArrayState {
        block_size,
        level,
        hash,
        prev_hash,
        disks,
        info,
        parity_paths: Vec::new(),
        content_path: PathBuf::new(),
        autosave: 0,
        clear_past_hash,
        need_write: false,
    })
}

// ── File I/O ────────────────────────────────────────────────────────────────

pub(crate) fn save_to(state: &ArrayState, path: &Path) -> Result<()> {
    let bytes = encode(state);
    let temp = path.with_extension("tmp");
    {
        let mut file = std::fs::File::create(&temp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
    }
    std::fs::rename(&temp, path)?;
    Ok(())
}

pub(crate) fn load_from(path: &Path) -> Result<ArrayState> {
    let bytes = std::fs::read(path)?;
    let mut state = decode(&bytes)?;
    state.content_path = path.to_owned();
    Ok(state)
}

//! Log segment files: the segment header, segment discovery and frame reading.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::common::types::Lsn;
use crate::transaction::wal::log_buffer::FRAME_HEADER_SIZE;
use crate::transaction::wal::log_record::LogRecord;

/// Upper bound on a single frame payload; anything larger is garbage
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentHeader {
    pub magic: u32,
    pub version: u32,
    pub segment: u64,
    pub first_lsn: Lsn,
}

impl SegmentHeader {
    /// "WALD" in ASCII
    pub const MAGIC: u32 = 0x57414C44;
    pub const VERSION: u32 = 1;
    pub const SIZE: u64 = 24;

    pub fn new(segment: u64, first_lsn: Lsn) -> Self {
        Self {
            magic: Self::MAGIC,
            version: Self::VERSION,
            segment,
            first_lsn,
        }
    }

    pub fn write_to(&self, file: &mut File) -> io::Result<()> {
        file.seek(SeekFrom::Start(0))?;
        file.write_u32::<LittleEndian>(self.magic)?;
        file.write_u32::<LittleEndian>(self.version)?;
        file.write_u64::<LittleEndian>(self.segment)?;
        file.write_u64::<LittleEndian>(self.first_lsn)?;
        file.flush()
    }

    pub fn read_from(reader: &mut impl Read) -> io::Result<Self> {
        Ok(Self {
            magic: reader.read_u32::<LittleEndian>()?,
            version: reader.read_u32::<LittleEndian>()?,
            segment: reader.read_u64::<LittleEndian>()?,
            first_lsn: reader.read_u64::<LittleEndian>()?,
        })
    }

    pub fn validate(&self) -> bool {
        self.magic == Self::MAGIC && self.version == Self::VERSION
    }
}

/// Path of segment `n` in `dir`
pub fn segment_path(dir: &Path, base_name: &str, segment: u64) -> PathBuf {
    dir.join(format!("{}.{}", base_name, segment))
}

/// Existing segments in ascending order
pub fn find_segments(dir: &Path, base_name: &str) -> io::Result<Vec<(u64, PathBuf)>> {
    let mut segments = Vec::new();
    if !dir.exists() {
        return Ok(segments);
    }
    let prefix = format!("{}.", base_name);
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let sequence = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_prefix(&prefix))
            .and_then(|suffix| suffix.parse::<u64>().ok());
        if let Some(sequence) = sequence {
            segments.push((sequence, path));
        }
    }
    segments.sort_unstable_by_key(|(sequence, _)| *sequence);
    Ok(segments)
}

/// Outcome of reading one frame
#[derive(Debug)]
pub enum FrameRead {
    Record(LogRecord, u64),
    /// Clean end of the segment
    End,
    /// A short, checksum-failing or undecodable frame
    Torn,
}

/// Read the next frame. On `Record` the frame's total length is returned
/// alongside the record.
pub fn read_frame(reader: &mut impl Read) -> io::Result<FrameRead> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    match read_full(reader, &mut header)? {
        0 => return Ok(FrameRead::End),
        n if n < FRAME_HEADER_SIZE => return Ok(FrameRead::Torn),
        _ => {}
    }

    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if len == 0 || len > MAX_FRAME_SIZE {
        return Ok(FrameRead::Torn);
    }

    let mut payload = vec![0u8; len];
    if read_full(reader, &mut payload)? < len || crc32fast::hash(&payload) != crc {
        return Ok(FrameRead::Torn);
    }

    match LogRecord::deserialize(&payload) {
        Ok(record) => Ok(FrameRead::Record(record, (FRAME_HEADER_SIZE + len) as u64)),
        Err(_) => Ok(FrameRead::Torn),
    }
}

/// Like `read_exact`, but reports how many bytes were available instead of
/// failing at end of file
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

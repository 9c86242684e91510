//! Segment container file format.
//!
//! A segment is one contiguous recorded clip bounded by a motion episode or
//! a duration cap. Frames are stored in a length-prefixed binary container:
//!
//! - header: magic, format version, camera id, start timestamp
//! - one record per frame: timestamp, dimensions, payload length, payload
//! - footer: frame count and a SHA-256 digest of all frame payloads
//!
//! The digest is written when the file is finalized and re-verified on
//! decode, so a corrupt transfer or a torn write is detected before a
//! segment enters processing. Every length field is checked against a hard
//! maximum on decode.

use anyhow::{anyhow, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::frame::Frame;
use crate::validate_camera_id;

const MAGIC: &[u8; 4] = b"WPS1";
const FORMAT_VERSION: u16 = 1;

const MAX_CAMERA_ID_LEN: usize = 64;
/// Hard cap on a single frame payload (64 MiB) to prevent memory
/// exhaustion from a corrupt length field.
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;
const MAX_FRAME_COUNT: u32 = 1_000_000;

/// File name for a segment, addressed by camera id + start timestamp.
pub fn segment_file_name(camera_id: &str, start_ms: u64) -> String {
    format!("{}_{}.wps", camera_id, start_ms)
}

/// Incremental writer used by the recorder while a segment is open.
pub struct SegmentWriter {
    out: BufWriter<File>,
    path: PathBuf,
    hasher: Sha256,
    frame_count: u32,
}

impl SegmentWriter {
    pub fn create(path: &Path, camera_id: &str, start_ms: u64) -> Result<Self> {
        validate_camera_id(camera_id)?;
        let file = File::create(path)
            .map_err(|e| anyhow!("failed to create segment {}: {}", path.display(), e))?;
        let mut out = BufWriter::new(file);

        out.write_all(MAGIC)?;
        out.write_all(&FORMAT_VERSION.to_le_bytes())?;
        let id_bytes = camera_id.as_bytes();
        out.write_all(&(id_bytes.len() as u32).to_le_bytes())?;
        out.write_all(id_bytes)?;
        out.write_all(&start_ms.to_le_bytes())?;

        Ok(Self {
            out,
            path: path.to_path_buf(),
            hasher: Sha256::new(),
            frame_count: 0,
        })
    }

    pub fn append_frame(&mut self, frame: &Frame) -> Result<()> {
        if self.frame_count >= MAX_FRAME_COUNT {
            return Err(anyhow!("segment frame count exceeds maximum"));
        }
        let data = frame.data();
        self.out.write_all(&frame.timestamp_ms.to_le_bytes())?;
        self.out.write_all(&frame.width.to_le_bytes())?;
        self.out.write_all(&frame.height.to_le_bytes())?;
        self.out.write_all(&(data.len() as u32).to_le_bytes())?;
        self.out.write_all(data)?;
        self.hasher.update(data);
        self.frame_count += 1;
        Ok(())
    }

    pub fn frame_count(&self) -> u32 {
        self.frame_count
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the footer, flush, and sync to disk. Returns the payload
    /// digest for the segment index and upload manifest.
    pub fn finalize(mut self) -> Result<SegmentSummary> {
        let digest: [u8; 32] = self.hasher.finalize().into();
        self.out.write_all(&self.frame_count.to_le_bytes())?;
        self.out.write_all(&digest)?;
        self.out.flush()?;
        self.out.get_ref().sync_all()?;
        Ok(SegmentSummary {
            path: self.path,
            frame_count: self.frame_count,
            checksum: hex::encode(digest),
        })
    }
}

/// What finalize reports back to the recorder.
#[derive(Clone, Debug)]
pub struct SegmentSummary {
    pub path: PathBuf,
    pub frame_count: u32,
    pub checksum: String,
}

/// A fully decoded segment.
#[derive(Clone, Debug)]
pub struct SegmentFile {
    pub camera_id: String,
    pub start_ms: u64,
    pub frames: Vec<Frame>,
    pub checksum: String,
}

impl SegmentFile {
    pub fn read(path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path)
            .map_err(|e| anyhow!("failed to read segment {}: {}", path.display(), e))?;
        Self::decode(&bytes)
    }

    /// Decode and verify a segment container.
    ///
    /// Fails on structural damage and on payload digest mismatch.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = 0usize;

        let magic = read_slice(bytes, &mut cursor, 4)?;
        if magic != MAGIC {
            return Err(anyhow!("not a segment container (bad magic)"));
        }
        let version = read_u16(bytes, &mut cursor)?;
        if version != FORMAT_VERSION {
            return Err(anyhow!("unsupported segment format version {}", version));
        }

        let id_len = read_u32(bytes, &mut cursor)? as usize;
        if id_len > MAX_CAMERA_ID_LEN {
            return Err(anyhow!(
                "camera id length {} exceeds maximum {}",
                id_len,
                MAX_CAMERA_ID_LEN
            ));
        }
        let id_bytes = read_slice(bytes, &mut cursor, id_len)?;
        let camera_id = std::str::from_utf8(id_bytes)
            .map_err(|_| anyhow!("invalid camera id encoding"))?
            .to_string();
        let start_ms = read_u64(bytes, &mut cursor)?;

        // Frame records run until only the footer remains.
        const FOOTER_LEN: usize = 4 + 32;
        let mut frames = Vec::new();
        let mut hasher = Sha256::new();
        while bytes.len() - cursor > FOOTER_LEN {
            let timestamp_ms = read_u64(bytes, &mut cursor)?;
            let width = read_u32(bytes, &mut cursor)?;
            let height = read_u32(bytes, &mut cursor)?;
            let len = read_u32(bytes, &mut cursor)? as usize;
            if len > MAX_FRAME_BYTES {
                return Err(anyhow!(
                    "frame payload length {} exceeds maximum {}",
                    len,
                    MAX_FRAME_BYTES
                ));
            }
            let data = read_slice(bytes, &mut cursor, len)?;
            hasher.update(data);
            frames.push(Frame::new(timestamp_ms, width, height, data.to_vec()));
        }

        let frame_count = read_u32(bytes, &mut cursor)?;
        let stored_digest = read_slice(bytes, &mut cursor, 32)?;
        if frame_count as usize != frames.len() {
            return Err(anyhow!(
                "corrupt segment: footer says {} frames, decoded {}",
                frame_count,
                frames.len()
            ));
        }
        let digest: [u8; 32] = hasher.finalize().into();
        if digest != stored_digest {
            return Err(anyhow!("corrupt segment: payload digest mismatch"));
        }

        Ok(Self {
            camera_id,
            start_ms,
            frames,
            checksum: hex::encode(digest),
        })
    }
}

fn read_slice<'a>(bytes: &'a [u8], cursor: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = cursor
        .checked_add(len)
        .ok_or_else(|| anyhow!("corrupt segment: length overflow"))?;
    if end > bytes.len() {
        return Err(anyhow!("corrupt segment: truncated"));
    }
    let slice = &bytes[*cursor..end];
    *cursor = end;
    Ok(slice)
}

fn read_u16(bytes: &[u8], cursor: &mut usize) -> Result<u16> {
    let slice = read_slice(bytes, cursor, 2)?;
    Ok(u16::from_le_bytes([slice[0], slice[1]]))
}

fn read_u32(bytes: &[u8], cursor: &mut usize) -> Result<u32> {
    let slice = read_slice(bytes, cursor, 4)?;
    Ok(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

fn read_u64(bytes: &[u8], cursor: &mut usize) -> Result<u64> {
    let slice = read_slice(bytes, cursor, 8)?;
    let mut out = [0u8; 8];
    out.copy_from_slice(slice);
    Ok(u64::from_le_bytes(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(ts: u64, fill: u8) -> Frame {
        Frame::new(ts, 8, 6, vec![fill; 48])
    }

    #[test]
    fn written_segment_decodes_with_matching_checksum() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join(segment_file_name("front_door", 1_000));

        let mut writer = SegmentWriter::create(&path, "front_door", 1_000)?;
        for ts in [1_000, 1_100, 1_200] {
            writer.append_frame(&frame(ts, ts as u8))?;
        }
        let summary = writer.finalize()?;
        assert_eq!(summary.frame_count, 3);

        let decoded = SegmentFile::read(&path)?;
        assert_eq!(decoded.camera_id, "front_door");
        assert_eq!(decoded.start_ms, 1_000);
        assert_eq!(decoded.frames.len(), 3);
        assert_eq!(decoded.frames[1].timestamp_ms, 1_100);
        assert_eq!(decoded.checksum, summary.checksum);
        Ok(())
    }

    #[test]
    fn flipped_payload_byte_fails_digest_check() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("seg.wps");
        let mut writer = SegmentWriter::create(&path, "front_door", 0)?;
        writer.append_frame(&frame(0, 42))?;
        writer.finalize()?;

        let mut bytes = std::fs::read(&path)?;
        // Flip a byte inside the frame payload, past the header.
        let payload_start = bytes.len() - (4 + 32) - 10;
        bytes[payload_start] ^= 0xff;

        let err = SegmentFile::decode(&bytes).unwrap_err();
        assert!(err.to_string().contains("digest mismatch"));
        Ok(())
    }

    #[test]
    fn truncated_file_is_rejected() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("seg.wps");
        let mut writer = SegmentWriter::create(&path, "front_door", 0)?;
        writer.append_frame(&frame(0, 42))?;
        writer.finalize()?;

        let bytes = std::fs::read(&path)?;
        assert!(SegmentFile::decode(&bytes[..bytes.len() - 5]).is_err());
        Ok(())
    }

    #[test]
    fn bad_magic_is_rejected() {
        assert!(SegmentFile::decode(b"NOPE").is_err());
    }
}

//! Order-preserving encoding of composite storage keys.
//!
//! Strings escape `0x00` as `0x00 0xFF` and end with `0x00 0x01`, so a
//! string always sorts before any longer string it prefixes. Integers are
//! big-endian with the sign bit flipped. A resource path is its segments as
//! strings followed by `0x00 0x02`.

use crate::firestore::error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::firestore::model::{DocumentKey, ResourcePath, SnapshotVersion, Timestamp};

const ESCAPE: u8 = 0x00;
const ESCAPED_NUL: u8 = 0xFF;
const STRING_END: u8 = 0x01;
const PATH_END: u8 = 0x02;

#[derive(Clone, Debug, Default)]
pub struct KeyEncoder {
    bytes: Vec<u8>,
}

impl KeyEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn string(mut self, value: &str) -> Self {
        self.write_string(value);
        self
    }

    pub fn i64(mut self, value: i64) -> Self {
        self.bytes
            .extend_from_slice(&((value as u64) ^ (1 << 63)).to_be_bytes());
        self
    }

    pub fn i32(self, value: i32) -> Self {
        self.i64(value as i64)
    }

    pub fn path(mut self, path: &ResourcePath) -> Self {
        self.write_segments(path);
        self.bytes.extend_from_slice(&[ESCAPE, PATH_END]);
        self
    }

    /// Segments of `path` without the terminator, for prefix scans over
    /// every path below `path`.
    pub fn path_prefix(mut self, path: &ResourcePath) -> Self {
        self.write_segments(path);
        self
    }

    pub fn version(self, version: SnapshotVersion) -> Self {
        let timestamp = version.timestamp();
        self.i64(timestamp.seconds).i64(timestamp.nanos as i64)
    }

    pub fn finish(self) -> Vec<u8> {
        self.bytes
    }

    fn write_segments(&mut self, path: &ResourcePath) {
        for segment in path.iter() {
            self.write_string(segment);
        }
    }

    fn write_string(&mut self, value: &str) {
        for &byte in value.as_bytes() {
            if byte == ESCAPE {
                self.bytes.extend_from_slice(&[ESCAPE, ESCAPED_NUL]);
            } else {
                self.bytes.push(byte);
            }
        }
        self.bytes.extend_from_slice(&[ESCAPE, STRING_END]);
    }
}

/// Reads back the components written by [`KeyEncoder`], in order.
pub struct KeyDecoder<'a> {
    bytes: &'a [u8],
    position: usize,
}

impl<'a> KeyDecoder<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, position: 0 }
    }

    pub fn string(&mut self) -> FirestoreResult<String> {
        let mut out = Vec::new();
        loop {
            let byte = self.next_byte()?;
            if byte != ESCAPE {
                out.push(byte);
                continue;
            }
            match self.next_byte()? {
                ESCAPED_NUL => out.push(ESCAPE),
                STRING_END => break,
                other => return Err(corrupt(format!("unexpected escape byte {other:#x}"))),
            }
        }
        String::from_utf8(out).map_err(|err| corrupt(err.to_string()))
    }

    pub fn i64(&mut self) -> FirestoreResult<i64> {
        let end = self.position + 8;
        let slice = self
            .bytes
            .get(self.position..end)
            .ok_or_else(|| corrupt("truncated integer"))?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(slice);
        self.position = end;
        Ok((u64::from_be_bytes(raw) ^ (1 << 63)) as i64)
    }

    pub fn i32(&mut self) -> FirestoreResult<i32> {
        let value = self.i64()?;
        i32::try_from(value).map_err(|err| corrupt(err.to_string()))
    }

    pub fn path(&mut self) -> FirestoreResult<ResourcePath> {
        let mut segments = Vec::new();
        loop {
            let rest = &self.bytes[self.position..];
            if rest.starts_with(&[ESCAPE, PATH_END]) {
                self.position += 2;
                return Ok(ResourcePath::new(segments));
            }
            segments.push(self.string()?);
        }
    }

    pub fn document_key(&mut self) -> FirestoreResult<DocumentKey> {
        DocumentKey::from_path(self.path()?)
    }

    pub fn version(&mut self) -> FirestoreResult<SnapshotVersion> {
        let seconds = self.i64()?;
        let nanos = self.i64()?;
        let nanos = i32::try_from(nanos).map_err(|err| corrupt(err.to_string()))?;
        Ok(SnapshotVersion::new(Timestamp::new(seconds, nanos)))
    }

    fn next_byte(&mut self) -> FirestoreResult<u8> {
        let byte = *self
            .bytes
            .get(self.position)
            .ok_or_else(|| corrupt("truncated key"))?;
        self.position += 1;
        Ok(byte)
    }
}

fn corrupt(message: impl Into<String>) -> FirestoreError {
    FirestoreError::new(
        FirestoreErrorCode::DataLoss,
        format!("Corrupt storage key: {}", message.into()),
    )
}

//! Byte layout of store keys.
//!
//! Value rows are keyed `<path><timestamp_ms u64 BE><seq u64 BE>` so that all rows of
//! one path are contiguous and ordered by time. The path encoding is prefix-free:
//!
//! ```text
//! node     := addr 0x00
//! service  := addr 0x01 svc 0x00
//! datatype := addr 0x01 svc 0x01 type 0x00
//! channel  := addr 0x01 svc 0x01 type 0x01 index(u32 BE)
//! type     := 0x10 id | 0x11 len(u32 BE) name
//! ```
//!
//! Known datatypes are stored by catalogue id, anything else by lower-cased name.
//! Console and floorplan rows are keyed by `<timestamp_ms><seq>` only.
use crate::errors::StoreError;
use crate::protocol::{datatype_by_id, lookup_datatype};
use crate::state::changeset::ChangePath;

const END: u8 = 0x00;
const MORE: u8 = 0x01;
const TYPE_KNOWN: u8 = 0x10;
const TYPE_NAMED: u8 = 0x11;

pub const TIME_KEY_LEN: usize = 16;

fn encode_type(out: &mut Vec<u8>, data_type: &str) {
    match lookup_datatype(data_type) {
        Some(info) => {
            out.push(TYPE_KNOWN);
            out.push(info.id);
        }
        None => {
            let name = data_type.to_ascii_lowercase();
            out.push(TYPE_NAMED);
            out.extend_from_slice(&(name.len() as u32).to_be_bytes());
            out.extend_from_slice(name.as_bytes());
        }
    }
}

pub fn encode_path(path: &ChangePath) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    out.push(path.node());
    match path {
        ChangePath::Node(_) => out.push(END),
        ChangePath::Service(_, s) => out.extend_from_slice(&[MORE, *s, END]),
        ChangePath::DataType(_, s, t) => {
            out.extend_from_slice(&[MORE, *s, MORE]);
            encode_type(&mut out, t);
            out.push(END);
        }
        ChangePath::Channel(_, s, t, i) => {
            out.extend_from_slice(&[MORE, *s, MORE]);
            encode_type(&mut out, t);
            out.push(MORE);
            out.extend_from_slice(&i.to_be_bytes());
        }
    }
    out
}

pub fn time_key(timestamp_ms: u64, seq: u64) -> [u8; TIME_KEY_LEN] {
    let mut out = [0u8; TIME_KEY_LEN];
    out[..8].copy_from_slice(&timestamp_ms.to_be_bytes());
    out[8..].copy_from_slice(&seq.to_be_bytes());
    out
}

pub fn row_key(path: &ChangePath, timestamp_ms: u64, seq: u64) -> Vec<u8> {
    let mut key = encode_path(path);
    key.extend_from_slice(&time_key(timestamp_ms, seq));
    key
}

/// Greatest key any row of `path` can have.
pub fn last_row_key(path: &ChangePath) -> Vec<u8> {
    row_key(path, u64::MAX, u64::MAX)
}

pub fn decode_time_key(bytes: &[u8]) -> Result<(u64, u64), StoreError> {
    if bytes.len() != TIME_KEY_LEN {
        return Err(StoreError::Corrupt(format!(
            "time key of {} bytes",
            bytes.len()
        )));
    }
    let mut ts = [0u8; 8];
    let mut seq = [0u8; 8];
    ts.copy_from_slice(&bytes[..8]);
    seq.copy_from_slice(&bytes[8..]);
    Ok((u64::from_be_bytes(ts), u64::from_be_bytes(seq)))
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn byte(&mut self) -> Result<u8, StoreError> {
        let b = *self
            .bytes
            .get(self.pos)
            .ok_or_else(|| StoreError::Corrupt("truncated key".into()))?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], StoreError> {
        let end = self.pos + n;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or_else(|| StoreError::Corrupt("truncated key".into()))?;
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self) -> Result<u32, StoreError> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(self.take(4)?);
        Ok(u32::from_be_bytes(buf))
    }

    fn data_type(&mut self) -> Result<String, StoreError> {
        match self.byte()? {
            TYPE_KNOWN => {
                let id = self.byte()?;
                datatype_by_id(id)
                    .map(|info| info.key())
                    .ok_or_else(|| StoreError::Corrupt(format!("unknown datatype id {}", id)))
            }
            TYPE_NAMED => {
                let len = self.u32()? as usize;
                Ok(String::from_utf8_lossy(self.take(len)?).into_owned())
            }
            tag => Err(StoreError::Corrupt(format!("bad datatype tag {:#x}", tag))),
        }
    }

    fn tag(&mut self) -> Result<bool, StoreError> {
        match self.byte()? {
            END => Ok(false),
            MORE => Ok(true),
            tag => Err(StoreError::Corrupt(format!("bad level tag {:#x}", tag))),
        }
    }
}

/// Split a value row key into path, timestamp and sequence number.
pub fn decode_row_key(key: &[u8]) -> Result<(ChangePath, u64, u64), StoreError> {
    let mut cur = Cursor { bytes: key, pos: 0 };
    let node = cur.byte()?;
    let path = if !cur.tag()? {
        ChangePath::Node(node)
    } else {
        let service = cur.byte()?;
        if !cur.tag()? {
            ChangePath::Service(node, service)
        } else {
            let data_type = cur.data_type()?;
            if !cur.tag()? {
                ChangePath::DataType(node, service, data_type)
            } else {
                ChangePath::Channel(node, service, data_type, cur.u32()?)
            }
        }
    };
    let (ts, seq) = decode_time_key(&key[cur.pos..])?;
    Ok((path, ts, seq))
}

//! Vectorised key-value access delegating to the KV store collaborator.

use crate::rpc::commands::CommandSpec;
use crate::rpc::server::{CommandCtx, Outcome};
use bedrock::auth::AuthLevel;
use bedrock::error::{Error, Result};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use hashbrown::HashMap;
use std::io::Write;
use std::sync::Mutex;

/// Wire code stamped into the trailing read entry when the response
/// frame runs out of room.
const NO_SPACE: i16 = -28;

/// Largest value accepted by the in-memory store's validation hook.
const MAX_VALUE_LEN: usize = 128;

/// Key-value store collaborator. Implementations decide persistence;
/// the commands only handle framing and protection.
pub trait KvStore: Send + Sync {
    /// Copy the value for `id` into `out`, returning the copied length.
    fn read(&self, id: u16, out: &mut [u8]) -> Result<usize>;

    fn write(&self, id: u16, value: &[u8]) -> Result<()>;

    /// Ids the peer may never overwrite.
    fn write_protected(&self, id: u16) -> bool;

    /// Per-value validation applied before a write is accepted.
    fn validate(&self, _id: u16, _value: &[u8]) -> Result<()> {
        Ok(())
    }
}

/// Default in-memory store with inclusive write-protected id ranges.
pub struct MemoryKvStore {
    values: Mutex<HashMap<u16, Vec<u8>>>,
    protected: Vec<(u16, u16)>,
}

impl MemoryKvStore {
    pub fn new() -> MemoryKvStore {
        MemoryKvStore::with_protected(Vec::new())
    }

    pub fn with_protected(protected: Vec<(u16, u16)>) -> MemoryKvStore {
        MemoryKvStore {
            values: Mutex::new(HashMap::new()),
            protected,
        }
    }

    /// Seed a value, bypassing protection.
    pub fn insert(&self, id: u16, value: &[u8]) {
        self.values
            .lock()
            .expect("KV store lock poisoned")
            .insert(id, value.to_vec());
    }
}

impl KvStore for MemoryKvStore {
    fn read(&self, id: u16, out: &mut [u8]) -> Result<usize> {
        let values = self.values.lock().expect("KV store lock poisoned");

        let value = values.get(&id).ok_or(Error::NotFound)?;
        let count = value.len().min(out.len());

        out[..count].copy_from_slice(&value[..count]);
        Ok(count)
    }

    fn write(&self, id: u16, value: &[u8]) -> Result<()> {
        self.values
            .lock()
            .expect("KV store lock poisoned")
            .insert(id, value.to_vec());
        Ok(())
    }

    fn write_protected(&self, id: u16) -> bool {
        self.protected.iter().any(|(low, high)| id >= *low && id <= *high)
    }

    fn validate(&self, _id: u16, value: &[u8]) -> Result<()> {
        match value.is_empty() || value.len() > MAX_VALUE_LEN {
            true => Err(Error::InvalidArgument),
            _ => Ok(()),
        }
    }
}

pub static READ_COMMAND: CommandSpec = CommandSpec {
    id: super::KV_READ,
    name: "kv_read",
    min_auth: AuthLevel::Device,
    run: run_read,
};

pub static WRITE_COMMAND: CommandSpec = CommandSpec {
    id: super::KV_WRITE,
    name: "kv_write",
    min_auth: AuthLevel::Network,
    run: run_write,
};

/// Request: a vector of `{id: u16, max_len: u16}`. Response: one
/// `{id: u16, len: i16, data}` entry per request until tailroom is
/// exhausted; the trailing entry then reads `{id, NO_SPACE}`.
fn run_read(ctx: &mut CommandCtx) -> Outcome {
    let mut frame = match ctx.alloc_response() {
        Ok(frame) => frame,
        Err(err) => return Outcome::error(err),
    };

    let mut params = ctx.params();
    let mut value = [0u8; MAX_VALUE_LEN];
    let mut last_entry = 0usize;

    while params.len() >= 4 {
        let id = params.read_u16::<LittleEndian>().expect("Length checked");
        let max_len = params.read_u16::<LittleEndian>().expect("Length checked") as usize;

        let lookup = ctx.kv().read(id, &mut value[..max_len.min(MAX_VALUE_LEN)]);

        let (len_code, data_len) = match &lookup {
            Ok(count) => (*count as i16, *count),
            Err(err) => (err.wire_code(), 0),
        };

        if frame.tailroom() < 4 + data_len {
            // Roll back to the previous entry boundary so the no-space
            // marker always fits.
            if frame.tailroom() < 4 {
                frame.truncate(last_entry);
            }

            let mut slot = frame.append(4).expect("Entry room reclaimed");
            slot.write_u16::<LittleEndian>(id).expect("Slot sized for entry");
            slot.write_i16::<LittleEndian>(NO_SPACE).expect("Slot sized for entry");
            break;
        }

        last_entry = frame.len();

        let mut slot = frame.append(4 + data_len).expect("Tailroom checked");
        slot.write_u16::<LittleEndian>(id).expect("Slot sized for entry");
        slot.write_i16::<LittleEndian>(len_code).expect("Slot sized for entry");
        slot.write_all(&value[..data_len]).expect("Slot sized for entry");
    }

    Outcome::ok(frame)
}

/// Request: a vector of `{id: u16, len: u16, data}`. Response: one `i16`
/// result per entry, in request order.
fn run_write(ctx: &mut CommandCtx) -> Outcome {
    let mut frame = match ctx.alloc_response() {
        Ok(frame) => frame,
        Err(err) => return Outcome::error(err),
    };

    let mut stream = ctx.params();

    while stream.len() >= 4 {
        let id = stream.read_u16::<LittleEndian>().expect("Length checked");
        let len = stream.read_u16::<LittleEndian>().expect("Length checked") as usize;

        if stream.len() < len {
            return Outcome::error(Error::InvalidArgument);
        }

        let (value, rest) = stream.split_at(len);
        stream = rest;

        let result = if ctx.kv().write_protected(id) {
            Error::AccessDenied.wire_code()
        } else {
            match ctx.kv().validate(id, value).and_then(|_| ctx.kv().write(id, value)) {
                Ok(()) => value.len() as i16,
                Err(err) => err.wire_code(),
            }
        };

        match frame.append(2) {
            Ok(mut slot) => slot
                .write_i16::<LittleEndian>(result)
                .expect("Slot sized for result"),
            Err(err) => return Outcome::error(err),
        }
    }

    Outcome::ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_roundtrip() {
        let store = MemoryKvStore::new();

        store.write(10, &[1, 2, 3]).unwrap();

        let mut out = [0u8; 8];
        assert_eq!(store.read(10, &mut out).unwrap(), 3);
        assert_eq!(&out[..3], &[1, 2, 3]);

        assert_eq!(store.read(11, &mut out).unwrap_err(), Error::NotFound);
    }

    #[test]
    fn test_write_protection_ranges() {
        let store = MemoryKvStore::with_protected(vec![(0, 9), (100, 100)]);

        assert!(store.write_protected(0));
        assert!(store.write_protected(9));
        assert!(store.write_protected(100));
        assert!(!store.write_protected(10));
        assert!(!store.write_protected(101));
    }

    #[test]
    fn test_validation_bounds() {
        let store = MemoryKvStore::new();

        assert_eq!(store.validate(1, &[]).unwrap_err(), Error::InvalidArgument);
        assert_eq!(
            store.validate(1, &vec![0; MAX_VALUE_LEN + 1]).unwrap_err(),
            Error::InvalidArgument
        );
        store.validate(1, &[1]).unwrap();
    }
}

use std::sync::OnceLock;

use crate::error::StoreError;
use crate::kv::{self, MapRead, Writer};

/// Persistent monotonic allocator for one store's internal IDs.
///
/// The counter lives in the meta map under the store's sequence key, so
/// IDs survive restarts and are never reused. Allocation happens inside
/// the caller's write batch; the engine's write lock serializes it.
pub struct IdAllocator {
    seq_key: &'static [u8],
}

impl IdAllocator {
    pub const fn new(seq_key: &'static [u8]) -> Self {
        Self { seq_key }
    }

    /// The next internal ID; always positive, counter only moves forward.
    pub fn next(&self, w: &mut Writer<'_>) -> Result<i64, StoreError> {
        let next = match w.get(kv::META, self.seq_key)? {
            Some(raw) => kv::id_from_bytes(&raw) + 1,
            None => 1,
        };
        w.put(kv::META, self.seq_key.to_vec(), kv::id_bytes(next).to_vec());
        Ok(next)
    }
}

/// External form of an internal ID.
///
/// Internal IDs are positive 63-bit integers assigned monotonically per
/// store. The external form scrambles them with a process-scoped key so
/// clients cannot enumerate resources, and appends a 16-bit checksum so a
/// tampered string decodes to a non-positive value ("not found") instead of
/// pointing at an unrelated resource.
pub struct IdCodec {
    k1: u64,
    k2: u64,
}

static PROCESS_CODEC: OnceLock<IdCodec> = OnceLock::new();

impl IdCodec {
    pub fn new(k1: u64, k2: u64) -> Self {
        Self { k1, k2 }
    }

    /// The process-wide codec, keyed once at first use.
    pub fn process() -> &'static IdCodec {
        PROCESS_CODEC.get_or_init(|| {
            let mut rng = rand::rng();
            IdCodec::new(rand::Rng::random(&mut rng), rand::Rng::random(&mut rng))
        })
    }

    fn scramble(&self, mut x: u64) -> u64 {
        x ^= self.k1;
        x = x.rotate_left(21);
        x = x.wrapping_add(self.k2);
        x = x.rotate_left(42);
        x ^= self.k1.rotate_left(17);
        x
    }

    fn unscramble(&self, mut x: u64) -> u64 {
        x ^= self.k1.rotate_left(17);
        x = x.rotate_right(42);
        x = x.wrapping_sub(self.k2);
        x = x.rotate_right(21);
        x ^= self.k1;
        x
    }

    fn checksum(x: u64) -> u16 {
        let mut c: u16 = 0xA5A5;
        for b in x.to_be_bytes() {
            c = c.rotate_left(3) ^ (b as u16);
        }
        c
    }

    pub fn encode(&self, id: i64) -> String {
        debug_assert!(id > 0);
        let s = self.scramble(id as u64);
        format!("{:016x}{:04x}", s, Self::checksum(s))
    }

    /// Decodes an external ID. Returns 0 or a negative value when the input
    /// is malformed or tampered; callers treat that as "not found".
    pub fn decode(&self, encoded: &str) -> i64 {
        if encoded.len() != 20 {
            return 0;
        }
        let (body, check) = encoded.split_at(16);
        let Ok(s) = u64::from_str_radix(body, 16) else {
            return 0;
        };
        let Ok(check) = u16::from_str_radix(check, 16) else {
            return 0;
        };
        if Self::checksum(s) != check {
            return 0;
        }
        self.unscramble(s) as i64
    }
}

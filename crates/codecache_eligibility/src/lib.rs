//! Per-function cache eligibility index.
//!
//! While a source is being compiled, every function whose compiled form was
//! written into the cache blob is recorded here, keyed by the function's start
//! offset within its enclosing source. On the next run the producer consults
//! the index to decide which functions it should expect (and keep) in the blob.
//!
//! The index has its own flat binary format: a sequence of fixed-size records
//! with no header, the record count implied by the total length.
//!
//! ```text
//! 0      4        5         8
//! +------+--------+---------+
//! | i32  | flags  | padding |
//! +------+--------+---------+
//! ```
//!
//! All integers are little-endian. `flags` bit 0 marks the direct-call
//! specialization, bit 1 the construct specialization. Padding is written as
//! zeros and ignored on read.

use std::io::{self, Read, Write};

use ahash::AHashMap;
use thiserror::Error;
use tracing::warn;

/// Size in bytes of one encoded record.
pub const RECORD_SIZE: usize = 8;

/// Upper bound accepted by [`CacheEligibilityIndex::read_framed`] for the
/// length prefix, so a corrupt prefix cannot trigger a huge allocation.
pub const MAX_FRAMED_LEN: u64 = 64 * 1024 * 1024;

/// The call specialization a compiled function body was produced for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecializationKind {
    /// Invoked as a plain function call.
    Call,
    /// Invoked as a constructor.
    Construct,
}

/// Which specializations of a function belong in the cache blob.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct EligibilityFlags {
    pub for_direct_call: bool,
    pub for_construct: bool,
}

impl EligibilityFlags {
    const DIRECT_CALL: u8 = 0b01;
    const CONSTRUCT: u8 = 0b10;
    const ALL: u8 = Self::DIRECT_CALL | Self::CONSTRUCT;

    pub fn bits(self) -> u8 {
        let mut bits = 0;
        if self.for_direct_call {
            bits |= Self::DIRECT_CALL;
        }
        if self.for_construct {
            bits |= Self::CONSTRUCT;
        }
        bits
    }

    /// Returns `None` when `bits` carries anything outside the two known flags.
    pub fn from_bits(bits: u8) -> Option<Self> {
        if bits & !Self::ALL != 0 {
            return None;
        }
        Some(Self {
            for_direct_call: bits & Self::DIRECT_CALL != 0,
            for_construct: bits & Self::CONSTRUCT != 0,
        })
    }

    pub fn contains(self, kind: SpecializationKind) -> bool {
        match kind {
            SpecializationKind::Call => self.for_direct_call,
            SpecializationKind::Construct => self.for_construct,
        }
    }

    fn insert(&mut self, kind: SpecializationKind) {
        match kind {
            SpecializationKind::Call => self.for_direct_call = true,
            SpecializationKind::Construct => self.for_construct = true,
        }
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("index length {len} is not a multiple of the record size")]
    Misaligned { len: usize },
    #[error("record for offset {offset} carries unknown flag bits {bits:#04x}")]
    UnknownFlags { offset: i32, bits: u8 },
    #[error("framed index declares {declared} bytes but only {available} are present")]
    Truncated { declared: u64, available: u64 },
    #[error("framed index length {0} exceeds the supported maximum")]
    Oversized(u64),
    #[error("failed to read framed index: {0}")]
    Io(#[from] io::Error),
}

/// Mapping from function source offset to its cache eligibility flags.
#[derive(Debug, Clone, Default)]
pub struct CacheEligibilityIndex {
    entries: AHashMap<i32, EligibilityFlags>,
}

impl CacheEligibilityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Marks the function starting at `offset` as cached for `kind`. Flags
    /// already recorded for the other kind are kept.
    pub fn record_eligible(&mut self, offset: i32, kind: SpecializationKind) {
        self.entries.entry(offset).or_default().insert(kind);
    }

    pub fn is_eligible(&self, offset: i32, kind: SpecializationKind) -> bool {
        self.entries
            .get(&offset)
            .is_some_and(|flags| flags.contains(kind))
    }

    pub fn flags(&self, offset: i32) -> Option<EligibilityFlags> {
        self.entries.get(&offset).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (i32, EligibilityFlags)> + '_ {
        self.entries.iter().map(|(offset, flags)| (*offset, *flags))
    }

    /// Encodes one record per entry, in map iteration order.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.entries.len() * RECORD_SIZE);
        for (offset, flags) in self.entries.iter() {
            out.extend_from_slice(&offset.to_le_bytes());
            out.push(flags.bits());
            out.extend_from_slice(&[0; RECORD_SIZE - 5]);
        }
        out
    }

    /// Rebuilds an index from [`encode`](Self::encode) output. A later record
    /// for an offset replaces an earlier one.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        if bytes.len() % RECORD_SIZE != 0 {
            return Err(DecodeError::Misaligned { len: bytes.len() });
        }

        let mut entries = AHashMap::with_capacity(bytes.len() / RECORD_SIZE);
        for record in bytes.chunks_exact(RECORD_SIZE) {
            let offset = i32::from_le_bytes([record[0], record[1], record[2], record[3]]);
            let bits = record[4];
            let flags = EligibilityFlags::from_bits(bits)
                .ok_or(DecodeError::UnknownFlags { offset, bits })?;
            entries.insert(offset, flags);
        }

        Ok(Self { entries })
    }

    /// Like [`decode`](Self::decode) but falls back to an empty index, so a
    /// damaged index never leaves partially applied state behind.
    pub fn decode_or_empty(bytes: &[u8]) -> Self {
        Self::decode(bytes).unwrap_or_else(|err| {
            warn!(error = %err, "discarding undecodable eligibility index");
            Self::default()
        })
    }

    /// Writes the index prefixed with its encoded length as a little-endian
    /// `u64`, for embedding inside a larger stream.
    pub fn write_framed<W: Write>(&self, writer: &mut W) -> io::Result<()> {
        let encoded = self.encode();
        writer.write_all(&(encoded.len() as u64).to_le_bytes())?;
        writer.write_all(&encoded)
    }

    pub fn read_framed<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let mut prefix = [0u8; 8];
        reader.read_exact(&mut prefix)?;
        let declared = u64::from_le_bytes(prefix);
        if declared > MAX_FRAMED_LEN {
            return Err(DecodeError::Oversized(declared));
        }

        let mut body = Vec::with_capacity(declared as usize);
        reader.take(declared).read_to_end(&mut body)?;
        if body.len() as u64 != declared {
            return Err(DecodeError::Truncated {
                declared,
                available: body.len() as u64,
            });
        }
        Self::decode(&body)
    }
}

impl PartialEq for CacheEligibilityIndex {
    fn eq(&self, other: &Self) -> bool {
        self.entries.len() == other.entries.len()
            && self
                .entries
                .iter()
                .all(|(offset, flags)| other.entries.get(offset) == Some(flags))
    }
}

impl Eq for CacheEligibilityIndex {}

impl FromIterator<(i32, SpecializationKind)> for CacheEligibilityIndex {
    fn from_iter<T: IntoIterator<Item = (i32, SpecializationKind)>>(iter: T) -> Self {
        let mut index = Self::new();
        for (offset, kind) in iter {
            index.record_eligible(offset, kind);
        }
        index
    }
}

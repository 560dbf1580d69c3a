//! Keyed BLAKE3 slot fingerprints and trailing canaries.
//!
//! Every slot reserves [`CANARY_SIZE`] bytes after its element storage. On
//! allocation the arena writes a canary derived from
//! `(arena_id, slot_index, generation)`; on release and during integrity
//! scans it checks the bytes are untouched. A mismatch means something wrote
//! past the end of the element.
//!
//! Binding the generation into the digest means a canary copied from an
//! earlier allocation of the same slot does not verify.

/// Size of the trailing canary appended to each slot.
pub const CANARY_SIZE: usize = 8;

/// Fixed key: this is integrity checking, not authentication.
const FINGERPRINT_KEY: [u8; 32] = *b"slotguard.canary.v1.key.32bytes!";

/// Identity of one allocation of one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotFingerprint {
    pub arena_id: u64,
    pub slot_index: u64,
    pub generation: u64,
}

impl SlotFingerprint {
    #[must_use]
    pub fn compute(arena_id: u64, slot_index: usize, generation: u64) -> Self {
        Self {
            arena_id,
            slot_index: slot_index as u64,
            generation,
        }
    }

    /// Serialize the identity as the digest input.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 24] {
        let mut buf = [0u8; 24];
        buf[0..8].copy_from_slice(&self.arena_id.to_le_bytes());
        buf[8..16].copy_from_slice(&self.slot_index.to_le_bytes());
        buf[16..24].copy_from_slice(&self.generation.to_le_bytes());
        buf
    }

    /// Keyed digest of the identity.
    #[must_use]
    pub fn digest(&self) -> [u8; 32] {
        *blake3::keyed_hash(&FINGERPRINT_KEY, &self.to_bytes()).as_bytes()
    }

    /// Derive the trailing canary.
    #[must_use]
    pub fn canary(&self) -> Canary {
        let digest = self.digest();
        let mut value = [0u8; CANARY_SIZE];
        value.copy_from_slice(&digest[..CANARY_SIZE]);
        Canary { value }
    }
}

/// Trailing canary for overflow detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Canary {
    pub value: [u8; CANARY_SIZE],
}

impl Canary {
    #[must_use]
    pub fn to_bytes(&self) -> [u8; CANARY_SIZE] {
        self.value
    }

    /// Check if a byte slice matches this canary.
    #[must_use]
    pub fn verify(&self, bytes: &[u8]) -> bool {
        bytes == self.value
    }
}

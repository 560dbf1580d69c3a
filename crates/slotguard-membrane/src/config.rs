//! Arena configuration.
//!
//! Capacity and element layout are fixed per arena. The quarantine delay and
//! poison byte can be overridden from the environment:
//! - `SLOTGUARD_QUARANTINE_DELAY`: number of allocation requests a freed slot
//!   waits before it may be reused. `off`, `none`, `disabled` or `0` turn the
//!   quarantine off (immediate reuse).
//! - `SLOTGUARD_POISON`: byte written over freed storage, decimal or `0x..`.
//!
//! Unparseable values are ignored and the configured value is kept.

use std::alloc::Layout;

use crate::error::ArenaError;

/// Default quarantine delay, in allocation requests.
pub const DEFAULT_QUARANTINE_DELAY: u64 = 8;

/// Default poison byte for released storage.
pub const DEFAULT_POISON_BYTE: u8 = 0xDD;

/// Default diagnostic journal capacity.
pub const DEFAULT_JOURNAL_LIMIT: usize = 1024;

pub const QUARANTINE_DELAY_ENV: &str = "SLOTGUARD_QUARANTINE_DELAY";
pub const POISON_ENV: &str = "SLOTGUARD_POISON";

/// Construction parameters for a [`BlockArena`](crate::arena::BlockArena).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaConfig {
    /// Number of slots. Never grows.
    pub capacity: usize,
    /// Size and alignment of one element.
    pub element_layout: Layout,
    /// Allocation requests a freed slot sits in quarantine. 0 disables quarantine.
    pub quarantine_delay: u64,
    /// Byte pattern written over released storage.
    pub poison_byte: u8,
    /// Maximum findings kept in the diagnostic journal.
    pub journal_limit: usize,
}

impl ArenaConfig {
    /// Config with default quarantine, poison and journal settings.
    #[must_use]
    pub const fn new(capacity: usize, element_layout: Layout) -> Self {
        Self {
            capacity,
            element_layout,
            quarantine_delay: DEFAULT_QUARANTINE_DELAY,
            poison_byte: DEFAULT_POISON_BYTE,
            journal_limit: DEFAULT_JOURNAL_LIMIT,
        }
    }

    /// Config whose slots hold exactly one `T`.
    #[must_use]
    pub const fn for_type<T>(capacity: usize) -> Self {
        Self::new(capacity, Layout::new::<T>())
    }

    #[must_use]
    pub const fn with_quarantine_delay(mut self, delay: u64) -> Self {
        self.quarantine_delay = delay;
        self
    }

    #[must_use]
    pub const fn with_poison_byte(mut self, poison_byte: u8) -> Self {
        self.poison_byte = poison_byte;
        self
    }

    #[must_use]
    pub const fn with_journal_limit(mut self, limit: usize) -> Self {
        self.journal_limit = limit;
        self
    }

    /// Apply `SLOTGUARD_*` overrides from the process environment.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary key lookup.
    #[must_use]
    pub fn with_overrides_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(delay) = lookup(QUARANTINE_DELAY_ENV).and_then(|v| parse_quarantine_delay(&v))
        {
            self.quarantine_delay = delay;
        }
        if let Some(poison) = lookup(POISON_ENV).and_then(|v| parse_poison_byte(&v)) {
            self.poison_byte = poison;
        }
        self
    }

    /// Reject configurations that cannot back an arena.
    pub fn validate(&self) -> Result<(), ArenaError> {
        if self.capacity == 0 {
            return Err(ArenaError::InvalidConfig(
                "capacity must be at least one slot".to_string(),
            ));
        }
        if self.journal_limit == 0 {
            return Err(ArenaError::InvalidConfig(
                "journal limit must be at least one record".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parse a quarantine delay (case-insensitive).
#[must_use]
pub fn parse_quarantine_delay(raw: &str) -> Option<u64> {
    let trimmed = raw.trim();
    match trimmed.to_ascii_lowercase().as_str() {
        "off" | "none" | "disabled" => Some(0),
        other => other.parse().ok(),
    }
}

/// Parse a poison byte as decimal or `0x`-prefixed hex.
#[must_use]
pub fn parse_poison_byte(raw: &str) -> Option<u8> {
    let trimmed = raw.trim();
    match trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        Some(hex) => u8::from_str_radix(hex, 16).ok(),
        None => trimmed.parse().ok(),
    }
}

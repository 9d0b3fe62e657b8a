//! KSU slot layout configuration
//!
//! The hardware exposes `KSU_MAX_KEY_SLOTS` slots. The low indices are carved
//! out for system keys:
//!
//! | slots                        | use                                  |
//! |------------------------------|--------------------------------------|
//! | `0`                          | key loaded from non-volatile storage |
//! | `1 .. 1 + RPA`               | BLE RPA identity resolving keys      |
//! | `KSU_KEY_SLOT_USER_START ..` | general allocation pool              |
//!
//! The RPA block is only reserved with the `rpa` feature. The IRKs must be
//! contiguous because the RPA engine is programmed with the first slot id and
//! a key count.

use core::ops::Range;

use static_assertions::const_assert;

use crate::error::{KsuError, KsuResult};
use crate::slot::KeySlotId;

/// Total number of hardware key slots.
pub const KSU_MAX_KEY_SLOTS: usize = 64;

/// Slots reserved for keys restored from non-volatile storage.
pub const KSU_NVM_RESERVED_SLOTS: usize = 1;

/// Slots reserved for BLE RPA identity resolving keys.
#[cfg(feature = "rpa")]
pub const KSU_RPA_RESERVED_SLOTS: usize = 32;
/// Slots reserved for BLE RPA identity resolving keys.
#[cfg(not(feature = "rpa"))]
pub const KSU_RPA_RESERVED_SLOTS: usize = 0;

/// First slot of the general allocation pool.
pub const KSU_KEY_SLOT_USER_START: usize = KSU_NVM_RESERVED_SLOTS + KSU_RPA_RESERVED_SLOTS;

// Slot ids travel as u8 in descriptors.
const_assert!(KSU_MAX_KEY_SLOTS <= 256);
const_assert!(KSU_KEY_SLOT_USER_START < KSU_MAX_KEY_SLOTS);
// The RPA engine resolves at most 32 IRKs per run.
const_assert!(KSU_RPA_RESERVED_SLOTS <= 32);

/// Reserved-region layout of a slot table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KsuLayout {
    nvm_reserved: usize,
    rpa_reserved: usize,
}

impl KsuLayout {
    /// Layout built from the compile-time constants.
    pub const DEFAULT: Self = Self {
        nvm_reserved: KSU_NVM_RESERVED_SLOTS,
        rpa_reserved: KSU_RPA_RESERVED_SLOTS,
    };

    pub const fn new(nvm_reserved: usize, rpa_reserved: usize) -> Self {
        Self {
            nvm_reserved,
            rpa_reserved,
        }
    }

    /// Number of reserved slots at the bottom of the table.
    #[inline]
    pub const fn reserved_count(&self) -> usize {
        self.nvm_reserved + self.rpa_reserved
    }

    /// First index of the user allocation pool.
    #[inline]
    pub const fn user_start(&self) -> usize {
        self.reserved_count()
    }

    /// Slot holding the key restored from non-volatile storage, if reserved.
    pub fn nvm_slot(&self) -> Option<KeySlotId> {
        if self.nvm_reserved == 0 {
            None
        } else {
            Some(KeySlotId(0))
        }
    }

    /// Base slot id and count of the RPA IRK block, if reserved.
    pub fn rpa_irk_slots(&self) -> Option<(KeySlotId, usize)> {
        if self.rpa_reserved == 0 {
            return None;
        }
        // Validated layouts keep every reserved index below 256.
        let base = u8::try_from(self.nvm_reserved).ok()?;
        Some((KeySlotId(base), self.rpa_reserved))
    }

    /// Index range of the user allocation pool for a table of `max_slots`.
    pub fn user_range(&self, max_slots: usize) -> Range<usize> {
        self.user_start()..max_slots
    }

    /// Check that the layout leaves at least one user slot in a table of
    /// `max_slots` and that every index fits a slot id.
    pub fn validate(&self, max_slots: usize) -> KsuResult<()> {
        if max_slots == 0 || max_slots > 256 {
            return Err(KsuError::InvalidParameter);
        }
        if self.rpa_reserved > 32 {
            return Err(KsuError::InvalidParameter);
        }
        if self.reserved_count() >= max_slots {
            return Err(KsuError::InvalidParameter);
        }
        Ok(())
    }
}

impl Default for KsuLayout {
    fn default() -> Self {
        Self::DEFAULT
    }
}

//! Key Storage Unit (KSU) Slot Manager
//!
//! Tracks which hardware key slot backs which logical key and drives the
//! Secure Element (SE) commands that fill and clear those slots.
//! Provides APIs for:
//! - Slot allocation (bookkeeping only)
//! - Key import / generation / transfer into a free slot
//! - Key deletion
//! - Lookup of slot id and crypto engine by owner reference
//!
//! The SE itself and the OS lock are reached through traits
//! ([`SeGateway`], [`KsuLock`]), so the manager runs the same on bare metal,
//! under an RTOS or on a host with the software SE.
//!
//! # Example
//!
//! ```
//! use exo_ksu::{KeyDescriptor, KeyType, KsuLayout, KsuManager, SoftSe, SpinLock, UserRef};
//!
//! let ksu: KsuManager<SoftSe<8>, SpinLock, 8> =
//!     KsuManager::init(SoftSe::new([7; 32]), SpinLock::new(), KsuLayout::new(1, 0)).unwrap();
//!
//! let owner = UserRef::new(0x2000_0100).unwrap();
//! let mut desc = KeyDescriptor::ksu(KeyType::Aes128);
//! ksu.import_key(&mut desc, &[0x11; 16], owner).unwrap();
//!
//! assert_eq!(ksu.lookup_slot_id(owner).unwrap(), desc.key_slot().unwrap());
//! ksu.delete_key(&desc).unwrap();
//! ```

#![no_std]

#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod config;
pub mod descriptor;
pub mod error;
pub mod gateway;
pub mod lock;
pub mod manager;
pub mod slot;

#[cfg(feature = "soft-se")]
pub mod soft_se;

pub use config::{
    KsuLayout, KSU_KEY_SLOT_USER_START, KSU_MAX_KEY_SLOTS, KSU_NVM_RESERVED_SLOTS,
    KSU_RPA_RESERVED_SLOTS,
};
pub use descriptor::{
    KeyDescriptor, KeyFlags, KeyStorage, KeyType, KsuKeyDescriptor, KsuLocation, PlaintextKey,
};
pub use error::{KsuError, KsuResult};
pub use gateway::{CommandContext, SeError, SeGateway, SeResult};
pub use lock::{KsuLock, LockError, LockTimeout, NoLock, SpinLock};
pub use manager::KsuManager;
pub use slot::{CryptoEngineId, KeySlotId, Slot, SlotStatus, SlotTable, UserRef};

#[cfg(feature = "std")]
pub use lock::OsLock;

#[cfg(feature = "soft-se")]
pub use soft_se::{SeCommand, SoftSe};

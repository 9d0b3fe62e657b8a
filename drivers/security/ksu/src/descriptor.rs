//! Key descriptors
//!
//! The manager only cares where a key lives in the KSU: [`KsuKeyDescriptor`]
//! exposes that location and nothing else. [`KeyDescriptor`] is the full
//! SE-style descriptor used by the software SE and by callers that have no
//! descriptor type of their own.

use bitflags::bitflags;

use crate::slot::{CryptoEngineId, KeySlotId};

/// Location of a key inside the KSU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct KsuLocation {
    /// `None` until the manager assigns a slot, and again after a failed
    /// import/generate/copy.
    pub keyslot: Option<KeySlotId>,
    pub crypto_engine_id: CryptoEngineId,
}

/// Opaque key handle as seen by the KSU manager.
pub trait KsuKeyDescriptor {
    /// `None` if the key is not stored in the KSU.
    fn ksu_location(&self) -> Option<&KsuLocation>;

    fn ksu_location_mut(&mut self) -> Option<&mut KsuLocation>;
}

/// Plaintext source key for an import, borrowing the caller's bytes.
#[derive(Debug, Clone, Copy)]
pub struct PlaintextKey<'a> {
    data: &'a [u8],
    buffer_size: usize,
}

impl<'a> PlaintextKey<'a> {
    /// The SE reads key buffers in whole words, so the advertised buffer size
    /// is the key length rounded up to a multiple of 4.
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            buffer_size: (data.len() + 3) & !3,
        }
    }

    #[inline]
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    #[inline]
    pub fn key_len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }
}

bitflags! {
    /// Key attribute flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct KeyFlags: u32 {
        const NON_EXPORTABLE      = 1 << 24;
        const IS_DEVICE_GENERATED = 1 << 25;
        const IS_RESTRICTED       = 1 << 26;
    }
}

/// Key Type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Aes128,
    Aes192,
    Aes256,
    /// Raw symmetric key (HMAC and friends), size in bytes.
    Symmetric(usize),
}

impl KeyType {
    pub fn key_size(&self) -> usize {
        match self {
            KeyType::Aes128 => 16,
            KeyType::Aes192 => 24,
            KeyType::Aes256 => 32,
            KeyType::Symmetric(size) => *size,
        }
    }
}

/// Where the key material lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStorage {
    /// Plaintext in application memory.
    ExternalPlaintext { size: usize },
    /// SE-internal volatile storage.
    Volatile,
    /// KSU key slot.
    Ksu(KsuLocation),
}

/// SE key descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeyDescriptor {
    pub key_type: KeyType,
    pub flags: KeyFlags,
    pub storage: KeyStorage,
}

impl KeyDescriptor {
    /// Descriptor for a key to be placed in the KSU, bound to the AES engine.
    pub fn ksu(key_type: KeyType) -> Self {
        Self {
            key_type,
            flags: KeyFlags::empty(),
            storage: KeyStorage::Ksu(KsuLocation::default()),
        }
    }

    pub fn plaintext(key_type: KeyType) -> Self {
        Self {
            key_type,
            flags: KeyFlags::empty(),
            storage: KeyStorage::ExternalPlaintext {
                size: key_type.key_size(),
            },
        }
    }

    pub fn with_engine(mut self, engine: CryptoEngineId) -> Self {
        if let KeyStorage::Ksu(location) = &mut self.storage {
            location.crypto_engine_id = engine;
        }
        self
    }

    pub fn with_flags(mut self, flags: KeyFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn key_slot(&self) -> Option<KeySlotId> {
        self.ksu_location().and_then(|location| location.keyslot)
    }

    pub fn crypto_engine_id(&self) -> Option<CryptoEngineId> {
        self.ksu_location().map(|location| location.crypto_engine_id)
    }
}

impl KsuKeyDescriptor for KeyDescriptor {
    fn ksu_location(&self) -> Option<&KsuLocation> {
        match &self.storage {
            KeyStorage::Ksu(location) => Some(location),
            _ => None,
        }
    }

    fn ksu_location_mut(&mut self) -> Option<&mut KsuLocation> {
        match &mut self.storage {
            KeyStorage::Ksu(location) => Some(location),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plaintext_buffer_size_rounds_to_words() {
        assert_eq!(PlaintextKey::new(&[0; 16]).buffer_size(), 16);
        assert_eq!(PlaintextKey::new(&[0; 17]).buffer_size(), 20);
        assert_eq!(PlaintextKey::new(&[0; 5]).buffer_size(), 8);
        assert_eq!(PlaintextKey::new(&[0; 5]).key_len(), 5);
    }

    #[test]
    fn test_ksu_descriptor_location() {
        let mut desc = KeyDescriptor::ksu(KeyType::Aes256).with_engine(CryptoEngineId::HASH);
        assert_eq!(desc.key_slot(), None);
        assert_eq!(desc.crypto_engine_id(), Some(CryptoEngineId::HASH));

        desc.ksu_location_mut().unwrap().keyslot = Some(KeySlotId(3));
        assert_eq!(desc.key_slot(), Some(KeySlotId(3)));
    }

    #[test]
    fn test_non_ksu_descriptor_has_no_location() {
        let mut desc = KeyDescriptor::plaintext(KeyType::Aes128).with_engine(CryptoEngineId::HASH);
        assert!(desc.ksu_location().is_none());
        assert!(desc.ksu_location_mut().is_none());
        assert_eq!(desc.storage, KeyStorage::ExternalPlaintext { size: 16 });
    }
}

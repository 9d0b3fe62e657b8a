//! KSU slot table
//!
//! Fixed-size array of slot records, one per hardware key slot. Lookups are
//! linear first-fit scans over the user range; tables hold a few dozen slots
//! and the lowest free index must win.

use core::fmt;
use core::num::NonZeroUsize;

use crate::config::KsuLayout;
use crate::error::{KsuError, KsuResult};

/// Hardware key slot index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct KeySlotId(pub u8);

impl KeySlotId {
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for KeySlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ksu#{}", self.0)
    }
}

/// Opaque owner token supplied by the caller (usually the address of the
/// object owning the key). Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct UserRef(NonZeroUsize);

impl UserRef {
    /// Returns `None` for the null token.
    pub const fn new(raw: usize) -> Option<Self> {
        match NonZeroUsize::new(raw) {
            Some(raw) => Some(Self(raw)),
            None => None,
        }
    }

    /// Token derived from an object address.
    pub fn from_ptr<T>(ptr: *const T) -> Option<Self> {
        Self::new(ptr as usize)
    }

    #[inline]
    pub const fn get(self) -> usize {
        self.0.get()
    }
}

/// Crypto engine a stored key is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(transparent)]
pub struct CryptoEngineId(pub u8);

impl CryptoEngineId {
    pub const AES: Self = Self(0);
    pub const HASH: Self = Self(1);
}

/// Slot state without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Available,
    InUse,
    Reserved,
}

/// One slot table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// Free for allocation, no owner.
    Available,
    /// Holds a key for `owner`, bound to `engine`.
    InUse {
        owner: UserRef,
        engine: CryptoEngineId,
    },
    /// Carved out for system keys at init, never handed out.
    Reserved,
}

impl Slot {
    pub fn status(&self) -> SlotStatus {
        match self {
            Slot::Available => SlotStatus::Available,
            Slot::InUse { .. } => SlotStatus::InUse,
            Slot::Reserved => SlotStatus::Reserved,
        }
    }

    pub fn owner(&self) -> Option<UserRef> {
        match self {
            Slot::InUse { owner, .. } => Some(*owner),
            _ => None,
        }
    }

    /// Engine id, `0` unless the slot is in use.
    pub fn engine_id(&self) -> CryptoEngineId {
        match self {
            Slot::InUse { engine, .. } => *engine,
            _ => CryptoEngineId::default(),
        }
    }

    #[inline]
    pub fn is_available(&self) -> bool {
        matches!(self, Slot::Available)
    }
}

/// Slot table for `N` hardware slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotTable<const N: usize> {
    slots: [Slot; N],
    user_start: usize,
}

impl<const N: usize> SlotTable<N> {
    /// Build a table with the reserved region of `layout` marked `Reserved`
    /// and every other slot `Available`.
    pub fn new(layout: &KsuLayout) -> KsuResult<Self> {
        layout.validate(N)?;

        let user_start = layout.user_start();
        let mut slots = [Slot::Available; N];
        for slot in slots.iter_mut().take(user_start) {
            *slot = Slot::Reserved;
        }

        Ok(Self { slots, user_start })
    }

    #[inline]
    pub const fn capacity(&self) -> usize {
        N
    }

    #[inline]
    pub fn user_start(&self) -> usize {
        self.user_start
    }

    pub fn slot(&self, id: KeySlotId) -> Option<&Slot> {
        self.slots.get(id.index())
    }

    /// All slots with their ids, reserved ones included.
    pub fn iter(&self) -> impl Iterator<Item = (KeySlotId, &Slot)> {
        // N <= 256 is checked in new().
        self.slots
            .iter()
            .enumerate()
            .map(|(i, slot)| (KeySlotId(i as u8), slot))
    }

    fn user_slots(&self) -> impl Iterator<Item = (KeySlotId, &Slot)> {
        self.iter().skip(self.user_start)
    }

    /// First available slot of the user range.
    pub fn find_free_slot(&self) -> KsuResult<KeySlotId> {
        self.user_slots()
            .find(|(_, slot)| slot.is_available())
            .map(|(id, _)| id)
            .ok_or(KsuError::Full)
    }

    /// First available slot for a new key of `owner`; fails if the owner
    /// already holds one.
    pub fn find_free_slot_for(&self, owner: UserRef) -> KsuResult<KeySlotId> {
        if self.lookup_by_owner(owner).is_ok() {
            return Err(KsuError::AlreadyExists);
        }
        self.find_free_slot()
    }

    pub fn lookup_by_owner(&self, owner: UserRef) -> KsuResult<KeySlotId> {
        self.user_slots()
            .find(|(_, slot)| slot.owner() == Some(owner))
            .map(|(id, _)| id)
            .ok_or(KsuError::NotFound)
    }

    pub fn engine_id_of(&self, owner: UserRef) -> KsuResult<CryptoEngineId> {
        self.user_slots()
            .find(|(_, slot)| slot.owner() == Some(owner))
            .map(|(_, slot)| slot.engine_id())
            .ok_or(KsuError::NotFound)
    }

    /// Bind `id` to `owner`. The slot must be free (or already bound to the
    /// same owner) and the owner must not hold another slot.
    pub fn mark_in_use(
        &mut self,
        id: KeySlotId,
        owner: UserRef,
        engine: CryptoEngineId,
    ) -> KsuResult<()> {
        match self.slot(id) {
            None => return Err(KsuError::InvalidParameter),
            Some(Slot::Reserved) => return Err(KsuError::PermissionDenied),
            Some(Slot::InUse { owner: current, .. }) if *current != owner => {
                return Err(KsuError::AlreadyExists)
            }
            Some(_) => {}
        }
        if let Ok(other) = self.lookup_by_owner(owner) {
            if other != id {
                return Err(KsuError::AlreadyExists);
            }
        }

        self.slots[id.index()] = Slot::InUse { owner, engine };
        Ok(())
    }

    /// Return `id` to the pool, yielding the previous entry.
    pub fn mark_available(&mut self, id: KeySlotId) -> KsuResult<Slot> {
        let slot = self
            .slots
            .get_mut(id.index())
            .ok_or(KsuError::InvalidParameter)?;
        if *slot == Slot::Reserved {
            return Err(KsuError::PermissionDenied);
        }
        Ok(core::mem::replace(slot, Slot::Available))
    }

    pub fn available_count(&self) -> usize {
        self.user_slots().filter(|(_, slot)| slot.is_available()).count()
    }

    pub fn in_use_count(&self) -> usize {
        self.user_slots()
            .filter(|(_, slot)| slot.status() == SlotStatus::InUse)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(raw: usize) -> UserRef {
        UserRef::new(raw).unwrap()
    }

    #[test]
    fn test_new_table_layout() {
        let table: SlotTable<6> = SlotTable::new(&KsuLayout::new(1, 2)).unwrap();

        let states: [SlotStatus; 6] = core::array::from_fn(|i| {
            table.slot(KeySlotId(i as u8)).unwrap().status()
        });
        assert_eq!(
            states,
            [
                SlotStatus::Reserved,
                SlotStatus::Reserved,
                SlotStatus::Reserved,
                SlotStatus::Available,
                SlotStatus::Available,
                SlotStatus::Available,
            ]
        );
        assert_eq!(table.available_count(), 3);
        assert_eq!(table.in_use_count(), 0);
    }

    #[test]
    fn test_first_fit_reuses_lowest_index() {
        let mut table: SlotTable<4> = SlotTable::new(&KsuLayout::new(1, 0)).unwrap();

        table.mark_in_use(KeySlotId(1), owner(0x10), CryptoEngineId::AES).unwrap();
        table.mark_in_use(KeySlotId(2), owner(0x20), CryptoEngineId::AES).unwrap();
        assert_eq!(table.find_free_slot(), Ok(KeySlotId(3)));

        table.mark_available(KeySlotId(1)).unwrap();
        assert_eq!(table.find_free_slot(), Ok(KeySlotId(1)));
    }

    #[test]
    fn test_find_free_slot_for_existing_owner() {
        let mut table: SlotTable<4> = SlotTable::new(&KsuLayout::new(1, 0)).unwrap();
        table.mark_in_use(KeySlotId(2), owner(0x10), CryptoEngineId::HASH).unwrap();

        assert_eq!(table.find_free_slot_for(owner(0x10)), Err(KsuError::AlreadyExists));
        assert_eq!(table.find_free_slot_for(owner(0x20)), Ok(KeySlotId(1)));
    }

    #[test]
    fn test_full_table() {
        let mut table: SlotTable<3> = SlotTable::new(&KsuLayout::new(1, 0)).unwrap();
        table.mark_in_use(KeySlotId(1), owner(1), CryptoEngineId::AES).unwrap();
        table.mark_in_use(KeySlotId(2), owner(2), CryptoEngineId::AES).unwrap();

        assert_eq!(table.find_free_slot(), Err(KsuError::Full));
        assert_eq!(table.available_count(), 0);
    }

    #[test]
    fn test_lookup_by_owner_and_engine() {
        let mut table: SlotTable<4> = SlotTable::new(&KsuLayout::new(1, 0)).unwrap();
        table.mark_in_use(KeySlotId(3), owner(0x30), CryptoEngineId::HASH).unwrap();

        assert_eq!(table.lookup_by_owner(owner(0x30)), Ok(KeySlotId(3)));
        assert_eq!(table.engine_id_of(owner(0x30)), Ok(CryptoEngineId::HASH));
        assert_eq!(table.lookup_by_owner(owner(0x40)), Err(KsuError::NotFound));
        assert_eq!(table.engine_id_of(owner(0x40)), Err(KsuError::NotFound));
    }

    #[test]
    fn test_reserved_slots_cannot_change() {
        let mut table: SlotTable<4> = SlotTable::new(&KsuLayout::new(1, 0)).unwrap();

        assert_eq!(
            table.mark_in_use(KeySlotId(0), owner(1), CryptoEngineId::AES),
            Err(KsuError::PermissionDenied)
        );
        assert_eq!(table.mark_available(KeySlotId(0)), Err(KsuError::PermissionDenied));
        assert_eq!(table.slot(KeySlotId(0)), Some(&Slot::Reserved));
    }

    #[test]
    fn test_mark_in_use_keeps_owners_unique() {
        let mut table: SlotTable<4> = SlotTable::new(&KsuLayout::new(1, 0)).unwrap();
        table.mark_in_use(KeySlotId(1), owner(7), CryptoEngineId::AES).unwrap();

        assert_eq!(
            table.mark_in_use(KeySlotId(2), owner(7), CryptoEngineId::AES),
            Err(KsuError::AlreadyExists)
        );
        assert_eq!(
            table.mark_in_use(KeySlotId(1), owner(8), CryptoEngineId::AES),
            Err(KsuError::AlreadyExists)
        );
        assert_eq!(
            table.mark_in_use(KeySlotId(9), owner(8), CryptoEngineId::AES),
            Err(KsuError::InvalidParameter)
        );
    }

    #[test]
    fn test_mark_available_returns_previous_entry() {
        let mut table: SlotTable<4> = SlotTable::new(&KsuLayout::new(1, 0)).unwrap();
        table.mark_in_use(KeySlotId(1), owner(5), CryptoEngineId::HASH).unwrap();

        let previous = table.mark_available(KeySlotId(1)).unwrap();
        assert_eq!(previous.owner(), Some(owner(5)));
        assert_eq!(previous.engine_id(), CryptoEngineId::HASH);

        let slot = table.slot(KeySlotId(1)).unwrap();
        assert_eq!(slot.owner(), None);
        assert_eq!(slot.engine_id(), CryptoEngineId(0));
    }

    #[test]
    fn test_null_user_ref_rejected() {
        assert!(UserRef::new(0).is_none());
        assert!(UserRef::from_ptr(core::ptr::null::<u32>()).is_none());
        let value = 5u32;
        assert!(UserRef::from_ptr(&value).is_some());
    }
}

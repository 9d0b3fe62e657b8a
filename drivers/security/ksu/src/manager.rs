//! KSU Manager
//!
//! Owns the slot table and the SE gateway behind one lock. Every operation
//! takes the lock once on entry; the guard releases it on every return path.
//!
//! Import, generate and copy claim the first free user slot, run the SE
//! command against it and only then record the owner. If anything fails after
//! the slot id was written into the descriptor, the table entry and the
//! descriptor are put back as they were.
//!
//! Delete is the exception: the table entry is cleared *before* the SE delete
//! runs and is not restored if the SE reports an error.

use crate::config::{KsuLayout, KSU_MAX_KEY_SLOTS};
use crate::descriptor::{KsuKeyDescriptor, PlaintextKey};
use crate::error::{KsuError, KsuResult};
use crate::gateway::{CommandContext, SeGateway, SeResult};
use crate::lock::{KsuGuard, KsuLock, KsuMutex, LockTimeout, SpinLock};
use crate::slot::{CryptoEngineId, KeySlotId, Slot, SlotTable, UserRef};

struct KsuState<G, const N: usize> {
    table: SlotTable<N>,
    gateway: G,
}

/// KSU slot manager for a table of `N` hardware slots.
pub struct KsuManager<G: SeGateway, L: KsuLock = SpinLock, const N: usize = KSU_MAX_KEY_SLOTS> {
    state: KsuMutex<L, KsuState<G, N>>,
    layout: KsuLayout,
    lock_timeout: LockTimeout,
}

fn set_keyslot<D: KsuKeyDescriptor>(desc: &mut D, keyslot: Option<KeySlotId>) {
    if let Some(location) = desc.ksu_location_mut() {
        location.keyslot = keyslot;
    }
}

impl<G: SeGateway, L: KsuLock, const N: usize> KsuManager<G, L, N> {
    /// Bring up the SE gateway and the lock, then build the slot table with
    /// the reserved region of `layout`.
    pub fn init(mut gateway: G, lock: L, layout: KsuLayout) -> KsuResult<Self> {
        // Checked first so a bad layout leaves the SE untouched.
        layout.validate(N)?;

        gateway.init().map_err(|err| {
            log::error!("KSU: secure element init failed: {}", err);
            KsuError::Se(err)
        })?;
        lock.init()?;

        let table = SlotTable::new(&layout)?;
        log::info!(
            "KSU initialized: {} slots, {} reserved, user pool {}..{}",
            N,
            layout.reserved_count(),
            layout.user_start(),
            N
        );

        Ok(Self {
            state: KsuMutex::new(lock, KsuState { table, gateway }),
            layout,
            lock_timeout: LockTimeout::WaitForever,
        })
    }

    /// Bound how long each operation waits for the lock.
    pub fn with_lock_timeout(mut self, timeout: LockTimeout) -> Self {
        self.lock_timeout = timeout;
        self
    }

    fn lock(&self) -> KsuResult<KsuGuard<'_, L, KsuState<G, N>>> {
        Ok(self.state.acquire(self.lock_timeout)?)
    }

    // =========================================================================
    // Slot lifecycle
    // =========================================================================

    /// Reserve a slot for `owner` without touching the SE.
    ///
    /// On success the slot id and `engine` are written into `key`.
    pub fn allocate_slot(
        &self,
        key: &mut G::Descriptor,
        owner: UserRef,
        engine: CryptoEngineId,
    ) -> KsuResult<KeySlotId> {
        let location = key.ksu_location_mut().ok_or(KsuError::InvalidParameter)?;

        let mut state = self.lock()?;
        let id = state.table.find_free_slot_for(owner)?;
        state.table.mark_in_use(id, owner, engine)?;

        location.keyslot = Some(id);
        location.crypto_engine_id = engine;
        log::debug!("KSU: {} allocated to {:#x}", id, owner.get());
        Ok(id)
    }

    /// Import a plaintext key into a free slot for `owner`.
    pub fn import_key(
        &self,
        key: &mut G::Descriptor,
        key_bytes: &[u8],
        owner: UserRef,
    ) -> KsuResult<KeySlotId> {
        if key_bytes.is_empty() {
            return Err(KsuError::InvalidParameter);
        }
        let plaintext = PlaintextKey::new(key_bytes);

        self.provision(key, owner, "import", |gateway, ctx, target| {
            gateway.import_key(ctx, &plaintext, target)
        })
    }

    /// Have the SE generate a random key into a free slot for `owner`.
    pub fn generate_key(&self, key: &mut G::Descriptor, owner: UserRef) -> KsuResult<KeySlotId> {
        self.provision(key, owner, "generate", |gateway, ctx, target| {
            gateway.generate_key(ctx, target)
        })
    }

    /// Copy the key described by `source` into a free slot for `owner`,
    /// recorded in `target`.
    pub fn copy_key(
        &self,
        source: &G::Descriptor,
        target: &mut G::Descriptor,
        owner: UserRef,
    ) -> KsuResult<KeySlotId> {
        self.provision(target, owner, "copy", |gateway, ctx, target| {
            gateway.transfer_key(ctx, source, target)
        })
    }

    fn provision<F>(
        &self,
        target: &mut G::Descriptor,
        owner: UserRef,
        op: &'static str,
        command: F,
    ) -> KsuResult<KeySlotId>
    where
        F: FnOnce(&mut G, &mut CommandContext, &mut G::Descriptor) -> SeResult<()>,
    {
        if target.ksu_location().is_none() {
            return Err(KsuError::InvalidParameter);
        }

        let mut state = self.lock()?;
        let id = state.table.find_free_slot_for(owner)?;
        set_keyslot(target, Some(id));

        let result = Self::run_command(&mut state, target, id, owner, command);
        match result {
            Ok(()) => {
                log::debug!("KSU: {} {} for {:#x}", op, id, owner.get());
                Ok(id)
            }
            Err(err) => {
                if matches!(state.table.slot(id), Some(Slot::InUse { .. })) {
                    // Only this call can have bound the slot: it was free
                    // under the same lock hold.
                    let _ = state.table.mark_available(id);
                }
                set_keyslot(target, None);
                log::warn!("KSU: {} into {} failed: {}, slot released", op, id, err);
                Err(err)
            }
        }
    }

    fn run_command<F>(
        state: &mut KsuState<G, N>,
        target: &mut G::Descriptor,
        id: KeySlotId,
        owner: UserRef,
        command: F,
    ) -> KsuResult<()>
    where
        F: FnOnce(&mut G, &mut CommandContext, &mut G::Descriptor) -> SeResult<()>,
    {
        let KsuState { table, gateway } = state;

        let mut ctx = gateway.init_command_context()?;
        let outcome = command(&mut *gateway, &mut ctx, &mut *target)
            .map_err(KsuError::from)
            .and_then(|()| {
                let engine = target
                    .ksu_location()
                    .map(|location| location.crypto_engine_id)
                    .ok_or(KsuError::InvalidParameter)?;
                table.mark_in_use(id, owner, engine)
            });

        match outcome {
            Ok(()) => Ok(gateway.deinit_command_context(ctx)?),
            Err(err) => {
                if let Err(deinit) = gateway.deinit_command_context(ctx) {
                    log::warn!("KSU: command context release failed: {}", deinit);
                }
                Err(err)
            }
        }
    }

    /// Free the slot recorded in `key` and erase it in the SE.
    ///
    /// The table entry is released before the SE command; an SE error is
    /// returned as is and the slot stays free. Deleting a free slot yields
    /// [`KsuError::AlreadyDeleted`].
    pub fn delete_key(&self, key: &G::Descriptor) -> KsuResult<()> {
        let id = key
            .ksu_location()
            .and_then(|location| location.keyslot)
            .ok_or(KsuError::InvalidParameter)?;
        if id.index() >= N {
            return Err(KsuError::InvalidParameter);
        }

        let mut state = self.lock()?;
        match state.table.slot(id) {
            None => return Err(KsuError::InvalidParameter),
            Some(Slot::Reserved) => {
                log::warn!("KSU: delete of reserved {} refused", id);
                return Err(KsuError::PermissionDenied);
            }
            Some(Slot::Available) => return Err(KsuError::AlreadyDeleted),
            Some(Slot::InUse { .. }) => {}
        }

        let previous = state.table.mark_available(id)?;
        if let Some(owner) = previous.owner() {
            log::debug!("KSU: {} released by {:#x}", id, owner.get());
        }

        let KsuState { gateway, .. } = &mut *state;
        let mut ctx = gateway.init_command_context()?;
        let deleted = gateway.delete_key(&mut ctx, key);
        let released = gateway.deinit_command_context(ctx);
        if let Err(err) = deleted {
            log::warn!("KSU: SE delete of {} failed: {}", id, err);
        }
        deleted?;
        released?;
        Ok(())
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    pub fn lookup_slot_id(&self, owner: UserRef) -> KsuResult<KeySlotId> {
        self.lock()?.table.lookup_by_owner(owner)
    }

    pub fn lookup_engine_id(&self, owner: UserRef) -> KsuResult<CryptoEngineId> {
        self.lock()?.table.engine_id_of(owner)
    }

    /// Copy of one table entry.
    pub fn slot(&self, id: KeySlotId) -> KsuResult<Slot> {
        self.lock()?
            .table
            .slot(id)
            .copied()
            .ok_or(KsuError::InvalidParameter)
    }

    /// Consistent copy of the whole table.
    pub fn snapshot(&self) -> KsuResult<SlotTable<N>> {
        Ok(self.lock()?.table.clone())
    }

    pub fn available_slots(&self) -> KsuResult<usize> {
        Ok(self.lock()?.table.available_count())
    }

    pub fn layout(&self) -> &KsuLayout {
        &self.layout
    }

    /// Slot reserved for the key restored from non-volatile storage.
    pub fn nvm_key_slot(&self) -> Option<KeySlotId> {
        self.layout.nvm_slot()
    }

    /// Base slot and count to program the RPA engine with.
    pub fn rpa_irk_slots(&self) -> Option<(KeySlotId, usize)> {
        self.layout.rpa_irk_slots()
    }

    /// True while some operation holds the manager lock.
    pub fn is_busy(&self) -> bool {
        !self.state.lock_ref().is_accessible()
    }

    /// Run `f` on the gateway under the manager lock, for SE commands that
    /// must not interleave with slot changes.
    pub fn with_gateway<R>(&self, f: impl FnOnce(&mut G) -> R) -> KsuResult<R> {
        let mut state = self.lock()?;
        Ok(f(&mut state.gateway))
    }
}

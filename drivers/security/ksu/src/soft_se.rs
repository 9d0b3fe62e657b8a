//! Software Secure Element
//!
//! In-memory model of the SE key commands against a KSU of `N` slots. Used on
//! host builds and in tests. Generated keys come from a BLAKE3 keyed XOF over
//! a caller-provided seed, so runs are reproducible. Deleted material is wiped.
//!
//! Any command can be made to fail once with [`SoftSe::fail_next`].

use subtle::ConstantTimeEq;
use zeroize::Zeroize;

use crate::config::KSU_MAX_KEY_SLOTS;
use crate::descriptor::{KeyDescriptor, KsuKeyDescriptor, PlaintextKey};
use crate::gateway::{CommandContext, SeError, SeGateway, SeResult};
use crate::slot::KeySlotId;

/// Largest key the model stores (AES-256).
const MAX_KEY_SIZE: usize = 32;

const GENERATE_CONTEXT: &[u8] = b"exo-ksu soft-se generate";

/// Commands the model can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeCommand {
    Init,
    InitContext,
    DeinitContext,
    Import,
    Generate,
    Transfer,
    Delete,
}

struct KeyMaterial {
    bytes: [u8; MAX_KEY_SIZE],
    len: usize,
}

impl KeyMaterial {
    fn from_slice(data: &[u8]) -> Self {
        let mut bytes = [0u8; MAX_KEY_SIZE];
        bytes[..data.len()].copy_from_slice(data);
        Self {
            bytes,
            len: data.len(),
        }
    }

    fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

/// Software SE with `N` KSU slots.
pub struct SoftSe<const N: usize = KSU_MAX_KEY_SLOTS> {
    seed: [u8; 32],
    initialized: bool,
    generated: u64,
    executed: u32,
    keys: [Option<KeyMaterial>; N],
    fault: Option<(SeCommand, SeError)>,
}

impl<const N: usize> SoftSe<N> {
    pub fn new(seed: [u8; 32]) -> Self {
        Self {
            seed,
            initialized: false,
            generated: 0,
            executed: 0,
            keys: core::array::from_fn(|_| None),
            fault: None,
        }
    }

    /// Make the next `command` return `err`. Replaces any pending fault.
    pub fn fail_next(&mut self, command: SeCommand, err: SeError) {
        self.fault = Some((command, err));
    }

    /// Key commands (import/generate/transfer/delete) that reached the model,
    /// failed ones included.
    pub fn commands_executed(&self) -> u32 {
        self.executed
    }

    pub fn holds_key(&self, slot: KeySlotId) -> bool {
        matches!(self.keys.get(slot.index()), Some(Some(_)))
    }

    /// Constant-time comparison of the slot content with `expected`.
    pub fn key_matches(&self, slot: KeySlotId, expected: &[u8]) -> bool {
        match self.keys.get(slot.index()) {
            Some(Some(key)) if key.len == expected.len() => {
                key.as_slice().ct_eq(expected).into()
            }
            _ => false,
        }
    }

    /// True if both slots hold the same key.
    pub fn same_key(&self, a: KeySlotId, b: KeySlotId) -> bool {
        match self.keys.get(b.index()) {
            Some(Some(key)) => self.key_matches(a, key.as_slice()),
            _ => false,
        }
    }

    fn check(&mut self, command: SeCommand) -> SeResult<()> {
        if let Some((pending, err)) = self.fault {
            if pending == command {
                self.fault = None;
                return Err(err);
            }
        }
        if !self.initialized && command != SeCommand::Init {
            return Err(SeError::NotInitialized);
        }
        Ok(())
    }

    fn slot_of(&self, desc: &KeyDescriptor) -> SeResult<usize> {
        let slot = desc.key_slot().ok_or(SeError::InvalidParameter)?;
        if slot.index() >= N {
            return Err(SeError::InvalidParameter);
        }
        Ok(slot.index())
    }

    fn target_size(desc: &KeyDescriptor) -> SeResult<usize> {
        let size = desc.key_type.key_size();
        if size == 0 || size > MAX_KEY_SIZE {
            return Err(SeError::InvalidParameter);
        }
        Ok(size)
    }
}

impl<const N: usize> SeGateway for SoftSe<N> {
    type Descriptor = KeyDescriptor;

    fn init(&mut self) -> SeResult<()> {
        self.check(SeCommand::Init)?;
        self.initialized = true;
        log::debug!("soft SE up, {} KSU slots", N);
        Ok(())
    }

    fn init_command_context(&mut self) -> SeResult<CommandContext> {
        self.check(SeCommand::InitContext)?;
        Ok(CommandContext::new())
    }

    fn deinit_command_context(&mut self, _ctx: CommandContext) -> SeResult<()> {
        self.check(SeCommand::DeinitContext)
    }

    fn import_key(
        &mut self,
        _ctx: &mut CommandContext,
        plaintext: &PlaintextKey<'_>,
        target: &mut KeyDescriptor,
    ) -> SeResult<()> {
        self.executed += 1;
        self.check(SeCommand::Import)?;

        let slot = self.slot_of(target)?;
        let size = Self::target_size(target)?;
        if plaintext.key_len() != size || plaintext.buffer_size() % 4 != 0 {
            return Err(SeError::InvalidParameter);
        }

        self.keys[slot] = Some(KeyMaterial::from_slice(plaintext.data()));
        Ok(())
    }

    fn generate_key(
        &mut self,
        _ctx: &mut CommandContext,
        target: &mut KeyDescriptor,
    ) -> SeResult<()> {
        self.executed += 1;
        self.check(SeCommand::Generate)?;

        let slot = self.slot_of(target)?;
        let size = Self::target_size(target)?;

        let mut hasher = blake3::Hasher::new_keyed(&self.seed);
        hasher.update(GENERATE_CONTEXT);
        hasher.update(&self.generated.to_le_bytes());
        hasher.update(&[slot as u8]);
        self.generated += 1;

        let mut bytes = [0u8; MAX_KEY_SIZE];
        hasher.finalize_xof().fill(&mut bytes[..size]);
        self.keys[slot] = Some(KeyMaterial::from_slice(&bytes[..size]));
        bytes.zeroize();
        Ok(())
    }

    fn transfer_key(
        &mut self,
        _ctx: &mut CommandContext,
        source: &KeyDescriptor,
        target: &mut KeyDescriptor,
    ) -> SeResult<()> {
        self.executed += 1;
        self.check(SeCommand::Transfer)?;

        // The model only holds material for KSU slots.
        if source.ksu_location().is_none() {
            return Err(SeError::InvalidCommand);
        }
        let from = self.slot_of(source)?;
        let to = self.slot_of(target)?;
        if Self::target_size(target)? != source.key_type.key_size() {
            return Err(SeError::InvalidParameter);
        }

        let copy = match &self.keys[from] {
            Some(key) => KeyMaterial::from_slice(key.as_slice()),
            None => return Err(SeError::InvalidParameter),
        };
        self.keys[to] = Some(copy);
        Ok(())
    }

    fn delete_key(&mut self, _ctx: &mut CommandContext, key: &KeyDescriptor) -> SeResult<()> {
        self.executed += 1;
        self.check(SeCommand::Delete)?;

        let slot = self.slot_of(key)?;
        self.keys[slot] = None;
        Ok(())
    }
}

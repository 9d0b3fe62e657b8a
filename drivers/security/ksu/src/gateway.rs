//! Secure Element command gateway
//!
//! The manager never talks to the SE mailbox itself. Whatever executes key
//! commands (the SE manager firmware, a software model) implements
//! [`SeGateway`]. The gateway owns its own hardware lock; the KSU manager only
//! serializes access to its slot table around the calls.

use core::fmt;

use crate::descriptor::{KsuKeyDescriptor, PlaintextKey};

/// Result type for SE commands.
pub type SeResult<T> = core::result::Result<T, SeError>;

/// SE command status classes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeError {
    InvalidCommand,
    AuthorizationError,
    InvalidSignature,
    BusError,
    InternalError,
    CryptoError,
    InvalidParameter,
    Aborted,
    SelfTestFailed,
    NotInitialized,
    /// Vendor status without a dedicated variant.
    CommandFailed(u32),
}

impl fmt::Display for SeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeError::InvalidCommand => write!(f, "Invalid command"),
            SeError::AuthorizationError => write!(f, "Authorization error"),
            SeError::InvalidSignature => write!(f, "Invalid signature"),
            SeError::BusError => write!(f, "Bus error"),
            SeError::InternalError => write!(f, "Internal error"),
            SeError::CryptoError => write!(f, "Crypto error"),
            SeError::InvalidParameter => write!(f, "Invalid parameter"),
            SeError::Aborted => write!(f, "Command aborted"),
            SeError::SelfTestFailed => write!(f, "Self-test failed"),
            SeError::NotInitialized => write!(f, "Not initialized"),
            SeError::CommandFailed(code) => write!(f, "Command failed: {:#x}", code),
        }
    }
}

/// Per-command state handed to the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CommandContext {
    /// Yield the core while waiting for command completion.
    pub yield_core: bool,
}

impl CommandContext {
    pub const fn new() -> Self {
        Self { yield_core: false }
    }
}

/// Key commands executed by the secure element.
///
/// `target` descriptors arrive with their KSU slot id already chosen by the
/// manager. The gateway may record the crypto engine it bound the key to in
/// the descriptor; the manager reads it back after a successful command.
pub trait SeGateway {
    type Descriptor: KsuKeyDescriptor;

    /// Bring up the SE interface. Called once from `KsuManager::init`.
    fn init(&mut self) -> SeResult<()>;

    fn init_command_context(&mut self) -> SeResult<CommandContext> {
        Ok(CommandContext::new())
    }

    fn deinit_command_context(&mut self, _ctx: CommandContext) -> SeResult<()> {
        Ok(())
    }

    /// Load the plaintext key into the slot named by `target`.
    fn import_key(
        &mut self,
        ctx: &mut CommandContext,
        plaintext: &PlaintextKey<'_>,
        target: &mut Self::Descriptor,
    ) -> SeResult<()>;

    /// Generate a random key directly into the slot named by `target`.
    fn generate_key(
        &mut self,
        ctx: &mut CommandContext,
        target: &mut Self::Descriptor,
    ) -> SeResult<()>;

    /// Copy the key described by `source` into the slot named by `target`.
    fn transfer_key(
        &mut self,
        ctx: &mut CommandContext,
        source: &Self::Descriptor,
        target: &mut Self::Descriptor,
    ) -> SeResult<()>;

    /// Erase the key in the slot named by `key`.
    fn delete_key(&mut self, ctx: &mut CommandContext, key: &Self::Descriptor) -> SeResult<()>;
}

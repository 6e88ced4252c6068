//! Channel slots, event lines, and per-channel program generation.
//!
//! The [`Engine`] owns a fixed pool of channel slots and a fixed table of
//! hardware event lines. Allocation is a first-free linear scan, and both
//! scans are all-or-nothing: a failed scan changes no state. The scans are
//! not internally atomic; hosts that allocate from interrupt context must
//! bracket these calls with their own critical section.

use crate::codegen;
use crate::descriptor::TransferDescriptor;
use crate::mcode::Program;
use crate::{Engine, Error, Result};

bitflags::bitflags! {
    /// Per-channel transfer-mode flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TransferFlags: u8 {
        /// The transfer also feeds the hardware checksum engine. The
        /// generated program streams to a plain address and skips the
        /// peripheral handshake.
        const CHECKSUM_PASSTHROUGH = 1 << 0;
        /// Duplicate mono audio across a stereo peripheral: writes pad
        /// the unused channel with silence, reads discard its samples.
        const MONO_DUPLICATE = 1 << 1;
    }
}

/// Identifies an allocated DMA channel.
///
/// Produced by [`Engine::allocate_channel`]; there is no other way to
/// mint one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ChannelId(pub(crate) usize);

impl ChannelId {
    /// The channel's index in the hardware pool.
    pub const fn index(self) -> usize {
        self.0
    }
}

/// State of one physical DMA channel.
pub(crate) struct ChannelSlot {
    pub(crate) in_use: bool,
    /// Opaque caller tag. The crate stores it; it never interprets it.
    pub(crate) owner: u32,
    pub(crate) flags: TransferFlags,
    pub(crate) descriptor: Option<TransferDescriptor>,
    /// Cached index of the event line bound to this channel, so code
    /// generation doesn't rescan the event table.
    pub(crate) event: Option<u8>,
    pub(crate) program: Program,
}

impl ChannelSlot {
    pub(crate) const fn new() -> Self {
        ChannelSlot {
            in_use: false,
            owner: 0,
            flags: TransferFlags::empty(),
            descriptor: None,
            event: None,
            program: Program::new(),
        }
    }
}

pub(crate) const FREE_SLOT: ChannelSlot = ChannelSlot::new();

impl<const CHANNELS: usize, const EVENTS: usize> Engine<CHANNELS, EVENTS> {
    /// Claims the first free channel slot.
    ///
    /// The claimed slot's flag set and caller tag are cleared. Returns
    /// [`Error::Exhausted`] when every channel is in use, leaving the
    /// pool unchanged.
    pub fn allocate_channel(&mut self) -> Result<ChannelId> {
        for (index, slot) in self.channels.iter_mut().enumerate() {
            if !slot.in_use {
                slot.in_use = true;
                slot.owner = 0;
                slot.flags = TransferFlags::empty();
                return Ok(ChannelId(index));
            }
        }
        Err(Error::Exhausted)
    }

    /// Binds the first free hardware event line to `channel`.
    ///
    /// Returns the event number, which the generated program will pulse
    /// at completion or phase switches. Returns [`Error::Exhausted`]
    /// when every line is bound, leaving the table unchanged.
    ///
    /// # Panics
    ///
    /// Panics if `channel` is not allocated.
    pub fn allocate_event(&mut self, channel: ChannelId) -> Result<u8> {
        assert!(self.channels[channel.index()].in_use);
        for (index, line) in self.events.iter_mut().enumerate() {
            if line.is_none() {
                *line = Some(channel.index());
                self.channels[channel.index()].event = Some(index as u8);
                return Ok(index as u8);
            }
        }
        Err(Error::Exhausted)
    }

    /// Returns `channel` and any event line bound to it to the free
    /// pool.
    ///
    /// The caller is responsible for making sure the hardware engine is
    /// no longer executing this channel's program.
    ///
    /// # Panics
    ///
    /// Panics if `channel` is not allocated.
    pub fn release_channel(&mut self, channel: ChannelId) {
        let slot = &mut self.channels[channel.index()];
        assert!(slot.in_use);
        if let Some(event) = slot.event.take() {
            self.events[event as usize] = None;
        }
        slot.descriptor = None;
        slot.in_use = false;
    }

    /// Attaches `descriptor` to `channel`, normalized.
    ///
    /// Normalization clears the device-side cache nibble before any
    /// control word is built, so stale cache bits from a prior use of
    /// the slot cannot leak into this transfer.
    ///
    /// # Panics
    ///
    /// Panics if `channel` is not allocated.
    pub fn set_descriptor(&mut self, channel: ChannelId, descriptor: TransferDescriptor) {
        self.slot_mut(channel).descriptor = Some(descriptor.normalized());
    }

    /// The descriptor attached to `channel`, if any.
    pub fn descriptor(&self, channel: ChannelId) -> Option<&TransferDescriptor> {
        self.slot(channel).descriptor.as_ref()
    }

    /// Replaces `channel`'s transfer-mode flags.
    pub fn set_flags(&mut self, channel: ChannelId, flags: TransferFlags) {
        self.slot_mut(channel).flags = flags;
    }

    /// `channel`'s transfer-mode flags.
    pub fn flags(&self, channel: ChannelId) -> TransferFlags {
        self.slot(channel).flags
    }

    /// Tags `channel` with an opaque caller identifier.
    pub fn set_owner(&mut self, channel: ChannelId, owner: u32) {
        self.slot_mut(channel).owner = owner;
    }

    /// `channel`'s opaque caller tag.
    pub fn owner(&self, channel: ChannelId) -> u32 {
        self.slot(channel).owner
    }

    /// Compiles `channel`'s transfer program into its microcode buffer.
    ///
    /// On success the buffer returned by [`program`](Engine::program) is
    /// ready to hand to the hardware engine. On failure the buffer holds
    /// scratch bytes; judge completion only by the returned result.
    ///
    /// # Panics
    ///
    /// Panics if `channel` is not allocated, has no descriptor, or has
    /// no bound event line.
    pub fn generate_program(&mut self, channel: ChannelId) -> Result<()> {
        let slot = &mut self.channels[channel.index()];
        assert!(slot.in_use);
        let (Some(descriptor), Some(event)) = (slot.descriptor.as_ref(), slot.event) else {
            panic!("code generation needs a descriptor and an event line");
        };
        codegen::compile(descriptor, slot.flags, event, &mut slot.program)
    }

    /// The bytes of `channel`'s most recently generated program.
    pub fn program(&self, channel: ChannelId) -> &[u8] {
        self.slot(channel).program.as_bytes()
    }

    fn slot(&self, channel: ChannelId) -> &ChannelSlot {
        let slot = &self.channels[channel.index()];
        assert!(slot.in_use);
        slot
    }

    fn slot_mut(&mut self, channel: ChannelId) -> &mut ChannelSlot {
        let slot = &mut self.channels[channel.index()];
        assert!(slot.in_use);
        slot
    }
}

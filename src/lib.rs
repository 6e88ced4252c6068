//! Transfer-program compiler for programmable DMA engines.
//!
//! `pdma` provides
//!
//! - allocation over a fixed pool of DMA channels and hardware event
//!   lines.
//! - declarative [`TransferDescriptor`](descriptor::TransferDescriptor)s
//!   and the packed [`ControlWord`](descriptor::ControlWord)s derived
//!   from them.
//! - a microcode compiler that turns a descriptor into the bounded
//!   program such an engine executes autonomously: nested hardware
//!   loops, peripheral handshakes, and the self-referential backward
//!   branch that keeps a double-buffered stream running.
//!
//! This crate computes programs; it never touches hardware. Handing a
//! finished buffer to the engine, servicing its event interrupts, and
//! stopping a running channel all belong to the surrounding firmware.
//!
//! # Getting started
//!
//! Allocate an [`Engine`] sized for your hardware: the number of DMA
//! channels and the number of event lines (at most 32, since event
//! numbers ride in a five-bit operand field). Acquire a channel and an event
//! line, attach a descriptor, and generate.
//!
//! ```
//! use pdma::descriptor::{
//!     Burst, BurstLength, BurstSize, Direction, Peripheral, TransferDescriptor,
//! };
//! use pdma::Engine;
//!
//! let mut engine = Engine::<8, 8>::new();
//!
//! let channel = engine.allocate_channel()?;
//! engine.allocate_event(channel)?;
//! engine.set_descriptor(
//!     channel,
//!     TransferDescriptor {
//!         direction: Direction::MemoryToPeripheral,
//!         len: 1024,
//!         src: 0x2000_0000,
//!         dst: 0x4001_100c,
//!         alt_dst: None,
//!         src_burst: Burst {
//!             size: BurstSize::Four,
//!             len: BurstLength::new(8).unwrap(),
//!         },
//!         dst_burst: Burst {
//!             size: BurstSize::Four,
//!             len: BurstLength::new(8).unwrap(),
//!         },
//!         peripheral: Peripheral::new(5).unwrap(),
//!         cache_control: 0x02,
//!     },
//! );
//! engine.generate_program(channel)?;
//!
//! // Ready for the hardware hand-off.
//! let microcode = engine.program(channel);
//! assert!(!microcode.is_empty());
//! # Ok::<(), pdma::Error>(())
//! ```
//!
//! Channel and event allocation scan shared tables without masking
//! interrupts; callers that allocate from more than one execution
//! context bracket those calls with their own critical section.
//!
//! ### License
//!
//! Licensed under either of
//!
//! - [Apache License, Version 2.0](http://www.apache.org/licenses/LICENSE-2.0) ([LICENSE-APACHE](./LICENSE-APACHE))
//! - [MIT License](http://opensource.org/licenses/MIT) ([LICENSE-MIT](./LICENSE-MIT))
//!
//! at your option.
//!
//! Unless you explicitly state otherwise, any contribution intentionally submitted
//! for inclusion in the work by you, as defined in the Apache-2.0 license, shall be
//! dual licensed as above, without any additional terms or conditions.

#![cfg_attr(not(test), no_std)]

pub mod channel;
pub mod codegen;
pub mod descriptor;
mod error;
pub mod mcode;

pub use channel::{ChannelId, TransferFlags};
pub use error::Error;

/// A `pdma` result.
pub type Result<T> = core::result::Result<T, Error>;

/// A DMA engine's allocation context: the channel pool and the event
/// table.
///
/// `CHANNELS` and `EVENTS` mirror the hardware: the number of physical
/// DMA channels and the number of event lines the engine can pulse.
/// Every operation takes the engine explicitly, so independent engine
/// instances (and tests) never share hidden state.
///
/// `Engine::new` is `const`; hosts typically place one in a static and
/// wrap access in whatever synchronization their interrupt story
/// requires.
pub struct Engine<const CHANNELS: usize, const EVENTS: usize> {
    pub(crate) channels: [ChannelSlot; CHANNELS],
    /// Event line → bound channel index. `None` marks a free line.
    pub(crate) events: [Option<usize>; EVENTS],
}

impl<const CHANNELS: usize, const EVENTS: usize> Engine<CHANNELS, EVENTS> {
    /// Creates an engine with every channel and event line free.
    pub const fn new() -> Self {
        assert!(EVENTS <= 32, "event numbers encode in five bits");
        Engine {
            channels: [FREE_SLOT; CHANNELS],
            events: [None; EVENTS],
        }
    }
}

impl<const CHANNELS: usize, const EVENTS: usize> Default for Engine<CHANNELS, EVENTS> {
    fn default() -> Self {
        Self::new()
    }
}

use channel::{ChannelSlot, FREE_SLOT};

//! The microcode compiler.
//!
//! [`compile`] turns one normalized [`TransferDescriptor`] into a complete
//! transfer program. The interesting work is decomposing an arbitrarily
//! large burst count into nested hardware loops whose counters and
//! backward branches both have hard encoding limits, and laying out the
//! self-referential tail that keeps a double-buffered stream running
//! forever.
//!
//! Every emission is checked; the first instruction that does not fit the
//! buffer, or the first branch that does not encode, aborts compilation.
//! Whatever bytes were already written are scratch; callers judge
//! completion by the returned [`Result`] alone.

use crate::channel::TransferFlags;
use crate::descriptor::{BurstLength, ControlWord, Direction, TransferDescriptor};
use crate::mcode::{LoopCounter, LoopEnd, Program, Register, MAX_BACKWARD_JUMP, MAX_LOOP_COUNT};
use crate::{Error, Result};

/// Compiles `descriptor` into `program`.
///
/// The buffer is cleared first; on success it holds a complete program
/// ready to hand to the engine, signalling `event` at each completion (or
/// phase switch, for double-buffered descriptors). The descriptor should
/// already be normalized; [`Engine::set_descriptor`](crate::Engine::set_descriptor)
/// takes care of that for channel-bound descriptors.
pub fn compile<const N: usize>(
    descriptor: &TransferDescriptor,
    flags: TransferFlags,
    event: u8,
    program: &mut Program<N>,
) -> Result<()> {
    program.clear();

    program.load_register(Register::Control, ControlWord::build(descriptor).raw())?;
    program.load_register(Register::Source, descriptor.src)?;
    program.load_register(Register::Destination, descriptor.dst)?;

    // Everything from here through the write barrier is what a
    // double-buffered program re-runs against its alternate address.
    let loop_block_start = program.len();
    emit_transfer_block(program, descriptor, flags)?;

    match descriptor.alt_dst {
        None => {
            program.signal_event(event)?;
            program.end()?;
        }
        Some(alternate) => {
            let block_end = program.len();
            program.load_register(Register::Destination, alternate)?;
            program.signal_event(event)?;
            program.duplicate(loop_block_start..block_end)?;
            program.load_register(Register::Destination, descriptor.dst)?;
            program.signal_event(event)?;
            let jump = backward_jump(program.len(), loop_block_start)?;
            program.loop_end(LoopEnd {
                counter: LoopCounter::Lc0,
                jump,
                not_final: true,
            })?;
        }
    }
    Ok(())
}

/// Emits the full-burst loops, the remainder pass, and the trailing
/// write barrier.
fn emit_transfer_block<const N: usize>(
    program: &mut Program<N>,
    descriptor: &TransferDescriptor,
    flags: TransferFlags,
) -> Result<()> {
    let beat_bytes = descriptor.dst_burst.size.bytes();
    let burst_bytes = descriptor.dst_burst.bytes();
    let mut full_bursts = descriptor.len / burst_bytes;
    let remainder_bytes = descriptor.len % burst_bytes;

    while full_bursts != 0 {
        let (outer, inner) = split_loop_counts(full_bursts, MAX_LOOP_COUNT);
        full_bursts -= match outer {
            Some(count) => count * inner,
            None => inner,
        };

        let outer_start = match outer {
            Some(count) => {
                program.loop_begin(LoopCounter::Lc1, count)?;
                Some(program.len())
            }
            None => None,
        };
        program.loop_begin(LoopCounter::Lc0, inner)?;
        let inner_start = program.len();

        emit_burst(program, descriptor, flags)?;

        let jump = backward_jump(program.len(), inner_start)?;
        program.loop_end(LoopEnd {
            counter: LoopCounter::Lc0,
            jump,
            not_final: false,
        })?;
        if let Some(start) = outer_start {
            // The outer branch lands on the inner loop-begin, reloading
            // LC0 for the next outer iteration.
            let jump = backward_jump(program.len(), start)?;
            program.loop_end(LoopEnd {
                counter: LoopCounter::Lc1,
                jump,
                not_final: false,
            })?;
        }
    }

    if let Some(reduced) = BurstLength::new((remainder_bytes / beat_bytes) as u8) {
        program.load_register(
            Register::Control,
            ControlWord::with_burst_length(descriptor, reduced).raw(),
        )?;
        emit_burst(program, descriptor, flags)?;
    }

    program.write_barrier()
}

/// Emits one direction-specific transfer of a single burst.
fn emit_burst<const N: usize>(
    program: &mut Program<N>,
    descriptor: &TransferDescriptor,
    flags: TransferFlags,
) -> Result<()> {
    let handshake = !flags.contains(TransferFlags::CHECKSUM_PASSTHROUGH);
    match descriptor.direction {
        Direction::MemoryToMemory => {
            program.load()?;
            program.store()?;
        }
        Direction::MemoryToPeripheral => {
            if handshake {
                program.flush_peripheral(descriptor.peripheral)?;
                program.wait_peripheral(descriptor.peripheral)?;
            }
            program.load()?;
            if handshake {
                program.store_peripheral(descriptor.peripheral)?;
            } else {
                // Checksum passthrough streams into a plain address.
                program.store()?;
            }
            if flags.contains(TransferFlags::MONO_DUPLICATE) {
                // Keep the unused channel of a stereo peripheral silent.
                program.store_zero()?;
            }
        }
        Direction::PeripheralToMemory => {
            if handshake {
                program.flush_peripheral(descriptor.peripheral)?;
                program.wait_peripheral(descriptor.peripheral)?;
            }
            program.load_peripheral(descriptor.peripheral)?;
            program.store()?;
            if flags.contains(TransferFlags::MONO_DUPLICATE) {
                // Drain the unused channel's sample, then rewind so the
                // next real sample overwrites it.
                program.load_peripheral(descriptor.peripheral)?;
                program.store()?;
                program.adjust_destination(-(descriptor.dst_burst.bytes() as i16))?;
            }
        }
    }
    Ok(())
}

/// Splits a remaining burst count into one pass of loop iterations, each
/// counter bounded by `max`.
///
/// Prefers a saturated nested pair while `remaining >= max * max`, then a
/// single saturated inner loop under an outer counter, then a bare inner
/// loop. The pass consumes `outer * inner` (or `inner`) bursts, which is
/// always at least one, so repeated splitting terminates.
const fn split_loop_counts(remaining: u32, max: u32) -> (Option<u32>, u32) {
    if remaining >= max * max {
        (Some(max), max)
    } else if remaining >= max {
        (Some(remaining / max), max)
    } else {
        (None, remaining)
    }
}

fn backward_jump(from: usize, to: usize) -> Result<u8> {
    let distance = from - to;
    if distance > MAX_BACKWARD_JUMP {
        return Err(Error::BranchRange);
    }
    Ok(distance as u8)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::{Burst, BurstSize, Peripheral};
    use crate::mcode::{
        OP_BARRIER, OP_END, OP_FLUSH_PERIPHERAL, OP_LOAD, OP_LOAD_PERIPHERAL, OP_LOAD_REGISTER,
        OP_LOOP, OP_LOOP_END, OP_SIGNAL, OP_STORE, OP_STORE_PERIPHERAL, OP_STORE_ZERO,
        OP_SUB_DESTINATION, OP_WAIT_PERIPHERAL,
    };

    const EVENT: u8 = 5;

    fn descriptor(direction: Direction, len: u32) -> TransferDescriptor {
        TransferDescriptor {
            direction,
            len,
            src: 0x2000_1000,
            dst: 0x2004_0000,
            alt_dst: None,
            src_burst: Burst {
                size: BurstSize::Eight,
                len: BurstLength::new(16).unwrap(),
            },
            dst_burst: Burst {
                size: BurstSize::Eight,
                len: BurstLength::new(16).unwrap(),
            },
            peripheral: Peripheral::new(2).unwrap(),
            cache_control: 0,
        }
        .normalized()
    }

    fn mov(register: Register, value: u32) -> [u8; 6] {
        let [b0, b1, b2, b3] = value.to_le_bytes();
        [OP_LOAD_REGISTER, register as u8, b0, b1, b2, b3]
    }

    #[test]
    fn split_walks_a_count_down_within_bounds() {
        // 300 bursts against a maximum of 16: a saturated nested pass,
        // a partial nested pass, and a bare inner loop.
        let mut remaining = 300;
        let mut passes = std::vec::Vec::new();
        while remaining != 0 {
            let (outer, inner) = split_loop_counts(remaining, 16);
            assert!(inner >= 1 && inner <= 16);
            if let Some(outer) = outer {
                assert!(outer >= 1 && outer <= 16);
            }
            let consumed = outer.unwrap_or(1) * inner;
            assert!(consumed <= remaining);
            remaining -= consumed;
            passes.push((outer, inner));
        }
        assert_eq!(passes, vec![(Some(16), 16), (Some(2), 16), (None, 12)]);
    }

    #[test]
    fn split_prefers_saturated_pairs() {
        assert_eq!(split_loop_counts(256 * 256, 256), (Some(256), 256));
        assert_eq!(split_loop_counts(300, 256), (Some(1), 256));
        assert_eq!(split_loop_counts(255, 256), (None, 255));
        assert_eq!(split_loop_counts(1, 256), (None, 1));
    }

    #[test]
    fn single_burst_copy_program() {
        // One full 128-byte burst, no remainder: a bare inner loop of one.
        let desc = descriptor(Direction::MemoryToMemory, 128);
        let mut program = Program::<64>::new();
        compile(&desc, TransferFlags::empty(), EVENT, &mut program).unwrap();

        let mut expected = std::vec::Vec::new();
        expected.extend_from_slice(&mov(Register::Control, ControlWord::build(&desc).raw()));
        expected.extend_from_slice(&mov(Register::Source, desc.src));
        expected.extend_from_slice(&mov(Register::Destination, desc.dst));
        expected.extend_from_slice(&[OP_LOOP, 0]);
        expected.extend_from_slice(&[OP_LOAD, OP_STORE]);
        expected.extend_from_slice(&[OP_LOOP_END, 2]);
        expected.extend_from_slice(&[OP_BARRIER, OP_SIGNAL, EVENT << 3, OP_END]);
        assert_eq!(program.as_bytes(), expected.as_slice());
    }

    #[test]
    fn remainder_rebuilds_the_control_word() {
        // 1000 bytes against 128-byte bursts: seven full bursts, then a
        // 104-byte remainder at thirteen beats.
        let desc = descriptor(Direction::MemoryToMemory, 1000);
        let mut program = Program::<64>::new();
        compile(&desc, TransferFlags::empty(), EVENT, &mut program).unwrap();

        let reduced = ControlWord::with_burst_length(&desc, BurstLength::new(13).unwrap());
        let mut expected = std::vec::Vec::new();
        expected.extend_from_slice(&mov(Register::Control, ControlWord::build(&desc).raw()));
        expected.extend_from_slice(&mov(Register::Source, desc.src));
        expected.extend_from_slice(&mov(Register::Destination, desc.dst));
        expected.extend_from_slice(&[OP_LOOP, 6]);
        expected.extend_from_slice(&[OP_LOAD, OP_STORE]);
        expected.extend_from_slice(&[OP_LOOP_END, 2]);
        expected.extend_from_slice(&mov(Register::Control, reduced.raw()));
        expected.extend_from_slice(&[OP_LOAD, OP_STORE]);
        expected.extend_from_slice(&[OP_BARRIER, OP_SIGNAL, EVENT << 3, OP_END]);
        assert_eq!(program.as_bytes(), expected.as_slice());
    }

    #[test]
    fn nested_loops_for_large_counts() {
        // 300 full bursts exceed MAX_LOOP_COUNT, forcing an outer counter.
        let desc = descriptor(Direction::MemoryToMemory, 300 * 128);
        let mut program = Program::<64>::new();
        compile(&desc, TransferFlags::empty(), EVENT, &mut program).unwrap();

        let code = program.as_bytes();
        // Header, then LC1 = 300 / 256 = 1, LC0 = 256.
        assert_eq!(&code[18..22], &[OP_LOOP | 1 << 1, 0, OP_LOOP, 255]);
        // Body, inner end (jump over the body), outer end (jump over the
        // inner loop-begin too).
        assert_eq!(
            &code[22..28],
            &[OP_LOAD, OP_STORE, OP_LOOP_END, 2, OP_LOOP_END | 1 << 2, 6]
        );
        // Second pass: a bare LC0 = 44.
        assert_eq!(&code[28..30], &[OP_LOOP, 43]);
    }

    #[test]
    fn peripheral_write_body() {
        let desc = descriptor(Direction::MemoryToPeripheral, 128);
        let mut program = Program::<64>::new();
        compile(&desc, TransferFlags::empty(), EVENT, &mut program).unwrap();

        let p = desc.peripheral.get() << 3;
        assert_eq!(
            &program.as_bytes()[20..27],
            &[
                OP_FLUSH_PERIPHERAL,
                p,
                OP_WAIT_PERIPHERAL,
                p,
                OP_LOAD,
                OP_STORE_PERIPHERAL,
                p,
            ]
        );
    }

    #[test]
    fn checksum_passthrough_suppresses_the_handshake() {
        let desc = descriptor(Direction::MemoryToPeripheral, 128);
        let mut program = Program::<64>::new();
        compile(
            &desc,
            TransferFlags::CHECKSUM_PASSTHROUGH,
            EVENT,
            &mut program,
        )
        .unwrap();

        // Plain load/store body, as if this were a memory copy.
        assert_eq!(&program.as_bytes()[20..22], &[OP_LOAD, OP_STORE]);
    }

    #[test]
    fn mono_duplication_stores_a_zero_sample() {
        let desc = descriptor(Direction::MemoryToPeripheral, 128);
        let mut program = Program::<64>::new();
        compile(&desc, TransferFlags::MONO_DUPLICATE, EVENT, &mut program).unwrap();

        let p = desc.peripheral.get() << 3;
        assert_eq!(
            &program.as_bytes()[20..28],
            &[
                OP_FLUSH_PERIPHERAL,
                p,
                OP_WAIT_PERIPHERAL,
                p,
                OP_LOAD,
                OP_STORE_PERIPHERAL,
                p,
                OP_STORE_ZERO,
            ]
        );
    }

    #[test]
    fn mono_duplication_rewinds_a_read() {
        let desc = descriptor(Direction::PeripheralToMemory, 128);
        let mut program = Program::<64>::new();
        compile(&desc, TransferFlags::MONO_DUPLICATE, EVENT, &mut program).unwrap();

        let p = desc.peripheral.get() << 3;
        assert_eq!(
            &program.as_bytes()[20..33],
            &[
                OP_FLUSH_PERIPHERAL,
                p,
                OP_WAIT_PERIPHERAL,
                p,
                OP_LOAD_PERIPHERAL,
                p,
                OP_STORE,
                OP_LOAD_PERIPHERAL,
                p,
                OP_STORE,
                OP_SUB_DESTINATION,
                128,
                0,
            ]
        );
    }

    #[test]
    fn zero_length_transfer_has_no_loops() {
        let desc = descriptor(Direction::MemoryToMemory, 0);
        let mut program = Program::<32>::new();
        compile(&desc, TransferFlags::empty(), EVENT, &mut program).unwrap();
        assert_eq!(
            &program.as_bytes()[18..],
            &[OP_BARRIER, OP_SIGNAL, EVENT << 3, OP_END]
        );
    }

    #[test]
    fn compile_clears_previous_contents() {
        let desc = descriptor(Direction::MemoryToMemory, 128);
        let mut program = Program::<64>::new();
        compile(&desc, TransferFlags::empty(), EVENT, &mut program).unwrap();
        let first_len = program.len();
        compile(&desc, TransferFlags::empty(), EVENT, &mut program).unwrap();
        assert_eq!(program.len(), first_len);
    }
}

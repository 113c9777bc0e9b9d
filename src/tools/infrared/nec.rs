//! NEC infrared protocol encoding
//!
//! A frame is a 9 ms leader mark, a 4.5 ms space, 32 data bits (address,
//! inverted address, command, inverted command, each LSB first) and a final
//! stop mark. Every bit is a 560 µs mark followed by a 560 µs (zero) or
//! 1690 µs (one) space.

/// Leader mark, µs
pub const HEADER_MARK: u32 = 9000;
/// Leader space, µs
pub const HEADER_SPACE: u32 = 4500;
/// Mark preceding every bit and ending the frame, µs
pub const BIT_MARK: u32 = 560;
pub const ONE_SPACE: u32 = 1690;
pub const ZERO_SPACE: u32 = 560;

/// Pulse count of one frame: leader pair, 32 bit pairs, stop mark
pub const FRAME_LEN: usize = 2 + 32 * 2 + 1;

/// Encode one frame as alternating mark/space durations in µs, starting with a mark
#[must_use]
pub fn encode(address: u8, command: u8) -> Vec<u32> {
    let mut pulses = Vec::with_capacity(FRAME_LEN);
    pulses.push(HEADER_MARK);
    pulses.push(HEADER_SPACE);

    for byte in [address, !address, command, !command] {
        for bit in 0..8 {
            pulses.push(BIT_MARK);
            pulses.push(if (byte >> bit) & 1 == 1 {
                ONE_SPACE
            } else {
                ZERO_SPACE
            });
        }
    }

    pulses.push(BIT_MARK);
    pulses
}

/// Decode a frame produced by [`encode`], checking the inverted bytes
#[must_use]
pub fn decode(pulses: &[u32]) -> Option<(u8, u8)> {
    if pulses.len() != FRAME_LEN || pulses[0] != HEADER_MARK || pulses[1] != HEADER_SPACE {
        return None;
    }

    let mut bytes = [0_u8; 4];
    for (i, pair) in pulses[2..FRAME_LEN - 1].chunks_exact(2).enumerate() {
        if pair[0] != BIT_MARK {
            return None;
        }
        let bit = match pair[1] {
            ONE_SPACE => 1,
            ZERO_SPACE => 0,
            _ => return None,
        };
        bytes[i / 8] |= bit << (i % 8);
    }

    (bytes[0] == !bytes[1] && bytes[2] == !bytes[3]).then_some((bytes[0], bytes[2]))
}

/// Total duration of a frame in µs
#[must_use]
pub fn duration_us(pulses: &[u32]) -> u64 {
    pulses.iter().map(|&p| u64::from(p)).sum()
}

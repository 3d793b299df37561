//! RSP wire framing: escaping, checksums, and the packet-reassembly state
//! machine.
//!
//! The checksum is the wrapping sum of the post-escape payload bytes; the
//! escape convention is `}` followed by the escaped byte XOR 0x20. Framing
//! is a buffer-driven state machine the front end can feed from any stream,
//! rather than a blocking byte-at-a-time read.

/// Maximum decoded packet payload this stub will accept or emit, §3
/// "Packet buffer".
pub const PKT_MAX: usize = 16384;

/// Maximum on-wire frame size: payload doubled for worst-case escaping,
/// plus `$`, `#`, and two checksum digits.
pub const WIRE_MAX: usize = PKT_MAX * 2 + 4;

const ESCAPE_FLAG: u8 = 0x7d;
const ESCAPE_XOR: u8 = 0x20;

fn needs_escape(b: u8) -> bool {
    matches!(b, b'$' | b'#' | b'*' | b'}')
}

/// Expands reserved bytes (`$ # * }`) into the `}`+XOR-0x20 wire encoding.
///
/// Returns `None` if the escaped output would exceed [`WIRE_MAX`].
pub fn escape(src: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(src.len());
    for &b in src {
        if needs_escape(b) {
            out.push(ESCAPE_FLAG);
            out.push(b ^ ESCAPE_XOR);
        } else {
            out.push(b);
        }
        if out.len() > WIRE_MAX {
            return None;
        }
    }
    Some(out)
}

/// Collapses `}x` escape pairs back to `x XOR 0x20`.
///
/// Returns `None` if `wire` ends mid-escape or the decoded payload would
/// exceed [`PKT_MAX`].
pub fn unescape(wire: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(wire.len());
    let mut iter = wire.iter().copied();
    while let Some(b) = iter.next() {
        if b == ESCAPE_FLAG {
            let escaped = iter.next()?;
            out.push(escaped ^ ESCAPE_XOR);
        } else {
            out.push(b);
        }
        if out.len() > PKT_MAX {
            return None;
        }
    }
    Some(out)
}

/// The 8-bit unsigned sum of wire bytes, §4.1.
pub fn checksum(wire_bytes: &[u8]) -> u8 {
    wire_bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// Wraps a payload as `$<escaped-payload>#<checksum>`.
pub fn encode_frame(payload: &[u8]) -> Option<Vec<u8>> {
    let wire_payload = escape(payload)?;
    let cs = checksum(&wire_payload);
    let mut frame = Vec::with_capacity(wire_payload.len() + 4);
    frame.push(b'$');
    frame.extend_from_slice(&wire_payload);
    frame.push(b'#');
    frame.extend_from_slice(format!("{:02x}", cs).as_bytes());
    Some(frame)
}

/// Outcome of scanning the reassembly window for a complete frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    /// Not enough bytes buffered yet to know the outcome.
    NeedMore,
    /// A bare `^C` (0x03) byte, the debugger's out-of-band interrupt.
    ControlC,
    /// A checksum-valid packet payload, already unescaped, plus the number
    /// of window bytes it consumed (caller must drain exactly this many).
    Packet(Vec<u8>, usize),
    /// Non-framing bytes discarded ahead of the first `$`/`^C` found, so
    /// the caller can log a warning.
    Garbage(usize),
    /// A checksum mismatch: `-` should be sent and the frame discarded.
    BadChecksum(usize),
}

/// Scans a reassembly window for the next complete frame, §4.2 steps 1-5.
///
/// The window is caller-owned; this function never mutates it, only
/// reports how many leading bytes the caller should drain for the
/// returned outcome.
pub fn decode_frame(window: &[u8]) -> Decoded {
    if window.is_empty() {
        return Decoded::NeedMore;
    }

    let start = window.iter().position(|&b| b == b'$' || b == 0x03);
    let start = match start {
        Some(i) => i,
        None => return Decoded::Garbage(window.len()),
    };
    if start > 0 {
        return Decoded::Garbage(start);
    }

    if window[0] == 0x03 {
        return Decoded::ControlC;
    }

    let end = match window[1..].iter().position(|&b| b == b'#') {
        Some(i) => i + 1,
        None => return Decoded::NeedMore,
    };
    if window.len() < end + 3 {
        return Decoded::NeedMore;
    }

    let wire_payload = &window[1..end];
    let checksum_digits = &window[end + 1..end + 3];
    let consumed = end + 3;

    let received = match std::str::from_utf8(checksum_digits)
        .ok()
        .and_then(|s| u8::from_str_radix(s, 16).ok())
    {
        Some(v) => v,
        None => return Decoded::BadChecksum(consumed),
    };

    if checksum(wire_payload) != received {
        return Decoded::BadChecksum(consumed);
    }

    match unescape(wire_payload) {
        Some(payload) => Decoded::Packet(payload, consumed),
        None => Decoded::BadChecksum(consumed),
    }
}

fn hex_digit(nibble: u8) -> u8 {
    match nibble {
        0..=9 => b'0' + nibble,
        10..=15 => b'a' + (nibble - 10),
        _ => unreachable!("nibble out of range"),
    }
}

fn hex_value(digit: u8) -> Option<u8> {
    match digit {
        b'0'..=b'9' => Some(digit - b'0'),
        b'a'..=b'f' => Some(digit - b'a' + 10),
        b'A'..=b'F' => Some(digit - b'A' + 10),
        _ => None,
    }
}

/// Encodes an arbitrary byte buffer as hex digit pairs, big-to-little
/// within each byte (high nibble first), in buffer order.
pub fn bin2hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(hex_digit(b >> 4) as char);
        out.push(hex_digit(b & 0xf) as char);
    }
    out
}

/// Decodes a hex-digit-pair string back to bytes. `None` on odd length or
/// a non-hex digit.
pub fn hex2bin(hex: &str) -> Option<Vec<u8>> {
    let bytes = hex.as_bytes();
    if bytes.len() % 2 != 0 {
        return None;
    }
    let mut out = Vec::with_capacity(bytes.len() / 2);
    for pair in bytes.chunks_exact(2) {
        let hi = hex_value(pair[0])?;
        let lo = hex_value(pair[1])?;
        out.push((hi << 4) | lo);
    }
    Some(out)
}

/// Encodes an integer's little-endian byte order as hex, §4.1 "Hex
/// helpers": byte 0 (least significant) comes first on the wire.
pub fn val_to_hex(value: u64, width_bytes: usize) -> String {
    bin2hex(&value.to_le_bytes()[..width_bytes])
}

/// Inverse of [`val_to_hex`]: parses little-endian hex digit pairs back
/// into an integer.
pub fn hex_to_val(hex: &str) -> Option<u64> {
    let bytes = hex2bin(hex)?;
    if bytes.len() > 8 {
        return None;
    }
    let mut buf = [0u8; 8];
    buf[..bytes.len()].copy_from_slice(&bytes);
    Some(u64::from_le_bytes(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_then_unescape_round_trips_reserved_bytes() {
        let payload = b"a$b#c*d}e";
        let wire = escape(payload).unwrap();
        assert_ne!(&wire[..], payload);
        assert_eq!(unescape(&wire).unwrap(), payload);
    }

    #[test]
    fn unescape_rejects_trailing_escape_flag() {
        assert_eq!(unescape(&[b'a', ESCAPE_FLAG]), None);
    }

    #[test]
    fn hex2bin_of_bin2hex_is_identity() {
        let data = vec![0x00, 0x7f, 0x80, 0xff, 0x0a];
        assert_eq!(hex2bin(&bin2hex(&data)).unwrap(), data);
    }

    #[test]
    fn val_to_hex_emits_little_endian_byte_order() {
        assert_eq!(val_to_hex(0xdeadbeef, 4), "efbeadde");
        assert_eq!(hex_to_val("efbeadde"), Some(0xdeadbeef));
    }

    #[test]
    fn decode_frame_round_trips_encode_frame() {
        let frame = encode_frame(b"g").unwrap();
        match decode_frame(&frame) {
            Decoded::Packet(payload, consumed) => {
                assert_eq!(payload, b"g");
                assert_eq!(consumed, frame.len());
            }
            other => panic!("expected Packet, got {other:?}"),
        }
    }

    #[test]
    fn decode_frame_reports_need_more_for_a_partial_frame() {
        assert_eq!(decode_frame(b"$g"), Decoded::NeedMore);
        assert_eq!(decode_frame(b"$g#6"), Decoded::NeedMore);
    }

    #[test]
    fn decode_frame_reports_garbage_before_the_first_dollar() {
        assert_eq!(decode_frame(b"+++$g#67"), Decoded::Garbage(3));
    }

    #[test]
    fn decode_frame_detects_a_bad_checksum() {
        let mut frame = encode_frame(b"g").unwrap();
        let last = frame.len() - 1;
        frame[last] = if frame[last] == b'0' { b'1' } else { b'0' };
        assert_eq!(decode_frame(&frame), Decoded::BadChecksum(frame.len()));
    }

    #[test]
    fn decode_frame_surfaces_control_c_as_its_own_pseudo_packet() {
        assert_eq!(decode_frame(&[0x03]), Decoded::ControlC);
    }

    #[test]
    fn checksum_is_associative_over_any_partition() {
        let payload = b"01234567890abcdef";
        let whole = checksum(payload);
        let (a, b) = payload.split_at(7);
        let parts = checksum(a).wrapping_add(checksum(b));
        assert_eq!(whole, parts);
    }
}

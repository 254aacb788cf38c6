//! C1: the gadget oracle.
//!
//! Purely functional: given a signed 64-bit PC-relative displacement,
//! decide whether its little-endian byte encoding contains an *unintended*
//! x86-64 CRA gadget, and if so report the minimum NOP-sled size that would
//! shift the encoding past it. See spec §4.1 and §6.2.

/// Second-byte values that, preceded by `0xff`, encode an indirect
/// jmp/call through a register or `[reg]` (JOP/COP), per spec §6.2.
const INDIRECT_BRANCH_MODRM: [u8; 26] = [
    0x20, 0x21, 0x22, 0x23, 0x26, 0x27, 0xe0, 0xe1, 0xe2, 0xe3, 0xe4, 0xe6, 0xe7, 0x10, 0x11,
    0x12, 0x13, 0x16, 0x17, 0xd0, 0xd1, 0xd2, 0xd3, 0xd4, 0xd6, 0xd7,
];

/// Render a signed 64-bit displacement as its 8 little-endian bytes (byte 0
/// = LSB), the byte-oriented equivalent of spec step 1's 16-hex-char
/// rendering — each byte here is exactly one "even index" pair of hex
/// characters there.
fn le_bytes(displacement: i64) -> [u8; 8] {
    (displacement as u64).to_le_bytes()
}

/// 256^k as a u64 (k in 0..=7, so this never overflows).
fn pow256(k: u32) -> u64 {
    1u64 << (8 * k)
}

/// C1: minimum NOP count to insert so the new displacement's little-endian
/// byte sequence no longer matches any pattern in the gadget byte table at
/// or before the original match offset. Returns 0 if `displacement` encodes
/// no unintended gadget. Total: terminates for every `i64` (spec P2).
pub fn gadget_sled(displacement: i64) -> u64 {
    let bytes = le_bytes(displacement);

    // c3 - near ret (ROP). Sign-double when d < 0.
    if let Some(k) = bytes.iter().position(|&b| b == 0xc3) {
        return if displacement < 0 {
            2 * pow256(k as u32)
        } else {
            pow256(k as u32)
        };
    }

    // c2 - ret imm16 (ROP). Sign-double when d > 0.
    if let Some(k) = bytes.iter().position(|&b| b == 0xc2) {
        return if displacement > 0 {
            2 * pow256(k as u32)
        } else {
            pow256(k as u32)
        };
    }

    // ca - retf (ROP). Sign-double when d > 0.
    if let Some(k) = bytes.iter().position(|&b| b == 0xca) {
        return if displacement > 0 {
            2 * pow256(k as u32)
        } else {
            pow256(k as u32)
        };
    }

    // cb - retf imm16 (ROP). Sign-double when d < 0.
    if let Some(k) = bytes.iter().position(|&b| b == 0xcb) {
        return if displacement < 0 {
            2 * pow256(k as u32)
        } else {
            pow256(k as u32)
        };
    }

    // ff + {indirect branch modrm byte} - jmp/call reg|[reg] (JOP/COP).
    for k in 0..bytes.len().saturating_sub(1) {
        if bytes[k] == 0xff && INDIRECT_BRANCH_MODRM.contains(&bytes[k + 1]) {
            return pow256(k as u32);
        }
    }

    // 67 ff + {indirect branch modrm byte} - same, 32-bit addr-size prefix.
    for k in 0..bytes.len().saturating_sub(2) {
        if bytes[k] == 0x67 && bytes[k + 1] == 0xff && INDIRECT_BRANCH_MODRM.contains(&bytes[k + 2])
        {
            return pow256(k as u32);
        }
    }

    // cd 80 - int 0x80 syscall.
    for k in 0..bytes.len().saturating_sub(1) {
        if bytes[k] == 0xcd && bytes[k + 1] == 0x80 {
            return pow256(k as u32);
        }
    }

    // 0f 34 - sysenter.
    for k in 0..bytes.len().saturating_sub(1) {
        if bytes[k] == 0x0f && bytes[k + 1] == 0x34 {
            return pow256(k as u32);
        }
    }

    // 0f 05 - syscall.
    for k in 0..bytes.len().saturating_sub(1) {
        if bytes[k] == 0x0f && bytes[k + 1] == 0x05 {
            return pow256(k as u32);
        }
    }

    0
}

/// Cross-instruction boundary patterns (spec §6.2, "boundary rows"), used by
/// C4 (widen-barriers). `last` is the final byte of the earlier instruction,
/// `first` is the first byte of the next contiguous instruction.
pub fn is_boundary_gadget(last: u8, first: u8) -> bool {
    match last {
        0xff => INDIRECT_BRANCH_MODRM.contains(&first),
        0x0f => first == 0x34 || first == 0x05,
        0xcd => first == 0x80,
        _ => false,
    }
}

//! Clock rate conversion and baud rate adjustment tables (ISO/IEC 7816-3 tables 7 and 8)

/// Default Fi index (Fi = 372, f max = 5 MHz)
pub const DEFAULT_FI_INDEX: u8 = 1;

/// Default Di index (Di = 1)
pub const DEFAULT_DI_INDEX: u8 = 1;

/// Clock rate conversion factor Fi and maximum clock frequency for each index
const FI_TABLE: [Option<(u16, u32)>; 16] = [
    Some((372, 4_000_000)),
    Some((372, 5_000_000)),
    Some((558, 6_000_000)),
    Some((744, 8_000_000)),
    Some((1116, 12_000_000)),
    Some((1488, 16_000_000)),
    Some((1860, 20_000_000)),
    None,
    None,
    Some((512, 5_000_000)),
    Some((768, 7_500_000)),
    Some((1024, 10_000_000)),
    Some((1536, 15_000_000)),
    Some((2048, 20_000_000)),
    None,
    None,
];

/// Baud rate adjustment factor Di for each index
const DI_TABLE: [Option<u8>; 16] = [
    None,
    Some(1),
    Some(2),
    Some(4),
    Some(8),
    Some(16),
    Some(32),
    Some(64),
    Some(12),
    Some(20),
    None,
    None,
    None,
    None,
    None,
    None,
];

/// Clock rate conversion factor for a Fi index, `None` if reserved
pub const fn fi_value(index: u8) -> Option<u16> {
    match FI_TABLE[(index & 0x0F) as usize] {
        Some((fi, _)) => Some(fi),
        None => None,
    }
}

/// Maximum clock frequency in hertz for a Fi index, `None` if reserved
pub const fn fmax_hz(index: u8) -> Option<u32> {
    match FI_TABLE[(index & 0x0F) as usize] {
        Some((_, f)) => Some(f),
        None => None,
    }
}

/// Baud rate adjustment factor for a Di index, `None` if reserved
pub const fn di_value(index: u8) -> Option<u8> {
    DI_TABLE[(index & 0x0F) as usize]
}

/// Whether a Fi/Di index pair can be used
pub const fn fi_di_valid(fi: u8, di: u8) -> bool {
    fi_value(fi).is_some() && di_value(di).is_some()
}

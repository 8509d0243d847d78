use crate::types::SeatColor;

pub const BOARD_LENGTH: u32 = 100;
pub const BOARD_COLUMNS: u32 = 10;
pub const DIE_FACES: u32 = 6;

pub const MIN_ROOM_CAPACITY: usize = 2;
pub const MAX_ROOM_CAPACITY: usize = 4;
pub const DEFAULT_ROOM_CAPACITY: usize = 4;

pub const ROOM_CODE_LEN: usize = 6;
pub const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
pub const ROOM_CODE_ATTEMPTS: usize = 16;

pub const MAX_NAME_CHARS: usize = 16;
pub const MAX_ROOM_NAME_CHARS: usize = 40;

pub const STORE_TIMEOUT_MS: u64 = 5_000;
pub const OUTBOUND_QUEUE_LEN: usize = 256;

/// Seat palette in assignment order; the host always takes the first entry.
pub const SEAT_PALETTE: [SeatColor; MAX_ROOM_CAPACITY] = [
    SeatColor::Yellow,
    SeatColor::Pink,
    SeatColor::Blue,
    SeatColor::Green,
];

pub fn lowest_free_color(taken: &[SeatColor]) -> Option<SeatColor> {
    SEAT_PALETTE
        .iter()
        .copied()
        .find(|color| !taken.contains(color))
}

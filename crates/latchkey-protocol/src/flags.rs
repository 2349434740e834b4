//! Flag bytes and modifier words.
//!
//! The 32-bit `timeout` and `expire` fields of a lock command carry the
//! numeric value in the low 16 bits and a modifier-flag word in the high
//! 16 bits. [`pack`], [`value`] and [`modifiers`] build and split them.

/// Flags for the `flag` byte of a lock command.
pub mod lock {
    pub const SHOW_WHEN_LOCKED: u8 = 0x01;
    pub const UPDATE_WHEN_LOCKED: u8 = 0x02;
    pub const FROM_AOF: u8 = 0x04;
    pub const CONCURRENT_CHECK: u8 = 0x08;
    pub const LOCK_TREE_LOCK: u8 = 0x10;
    pub const CONTAINS_DATA: u8 = 0x20;
}

/// Flags for the `flag` byte of an unlock command.
pub mod unlock {
    pub const UNLOCK_FIRST_LOCK_WHEN_UNLOCKED: u8 = 0x01;
    pub const CANCEL_WAIT_LOCK_WHEN_UNLOCKED: u8 = 0x02;
    pub const FROM_AOF: u8 = 0x04;
    pub const SUCCEED_TO_LOCK_WAIT: u8 = 0x08;
    pub const UNLOCK_TREE_LOCK: u8 = 0x10;
    pub const CONTAINS_DATA: u8 = 0x20;
}

/// Modifier flags carried in the high word of the `timeout` field.
pub mod timeout {
    pub const PUSH_SUBSCRIBE: u16 = 0x0020;
    pub const MINUTE_TIME: u16 = 0x0040;
    /// Wait until the key becomes locked instead of unlocked.
    pub const REVERSE_KEY_LOCK_WAIT: u16 = 0x0080;
    /// The `rCount` byte is a waiter priority, not a reentrancy limit.
    pub const RCOUNT_IS_PRIORITY: u16 = 0x0100;
    pub const MILLISECOND_TIME: u16 = 0x0400;
    pub const LOG_ERROR_WHEN_TIMEOUT: u16 = 0x0800;
    pub const REQUIRE_ACKED: u16 = 0x1000;
    pub const UPDATE_NO_RESET_TIMEOUT_CHECKED: u16 = 0x2000;
    /// A holder with a higher version in the lock id counts as success.
    pub const LESS_LOCK_VERSION_IS_LOCK_SUCCEED: u16 = 0x4000;
    pub const KEEP_ALIVE: u16 = 0x8000;
}

/// Modifier flags carried in the high word of the `expire` field.
pub mod expire {
    pub const PUSH_SUBSCRIBE: u16 = 0x0020;
    pub const MINUTE_TIME: u16 = 0x0040;
    pub const UNLIMITED_EXPIRE_TIME: u16 = 0x0080;
    pub const MILLISECOND_TIME: u16 = 0x0400;
    pub const LOG_ERROR_WHEN_EXPIRED: u16 = 0x0800;
    pub const ZERO_AOF_TIME: u16 = 0x1000;
    pub const UPDATE_NO_RESET_EXPIRE_CHECKED: u16 = 0x2000;
    pub const UNLIMITED_AOF_TIME: u16 = 0x4000;
    pub const KEEP_ALIVE: u16 = 0x8000;
}

/// Packs a numeric value and a modifier word into one wire field.
pub const fn pack(value: u16, modifiers: u16) -> u32 {
    ((modifiers as u32) << 16) | value as u32
}

/// Numeric half of a packed field.
pub const fn value(field: u32) -> u16 {
    (field & 0xffff) as u16
}

/// Modifier half of a packed field.
pub const fn modifiers(field: u32) -> u16 {
    (field >> 16) as u16
}

/// Adds modifier flags to an already packed field.
pub const fn with_modifiers(field: u32, extra: u16) -> u32 {
    field | ((extra as u32) << 16)
}

//! Status bitfields for work rows and checkpoints.
//!
//! Work rows (outbox and perspective events) share one bitfield; inbox rows
//! and perspective checkpoints each use their own encoding. The bits mirror
//! the values persisted in the `status` columns, so these constants are the
//! single source of truth for both the Rust side and the SQL the schema
//! module generates.

/// Bits for outbox and perspective-event rows.
pub mod work {
    /// Row is leased to an instance (`instance_id` and `lease_expiry` set).
    pub const CLAIMED: i32 = 1;
    /// Row has been handed to a handler by its claimer.
    pub const IN_FLIGHT: i32 = 2;
    /// Terminal success; lease cleared.
    pub const COMPLETED: i32 = 4;
    /// Handler failure recorded; excluded from claims until cleared.
    pub const FAILED: i32 = 8;
    /// Exceeded the attempt threshold; terminal.
    pub const POISON: i32 = 16;

    /// Bits cleared when a lease is recovered or a result is applied.
    pub const LEASE_BITS: i32 = CLAIMED | IN_FLIGHT;
    /// Rows with any of these bits are never claimable.
    pub const UNCLAIMABLE: i32 = CLAIMED | COMPLETED | FAILED | POISON;
    /// Rows with any of these bits never change again.
    pub const TERMINAL: i32 = COMPLETED | POISON;

    pub fn is_completed(status: i32) -> bool {
        status & COMPLETED != 0
    }

    pub fn is_claimable(status: i32) -> bool {
        status & UNCLAIMABLE == 0
    }

    pub fn is_terminal(status: i32) -> bool {
        status & TERMINAL != 0
    }
}

/// Bits for inbox rows.
pub mod inbox {
    pub const CLAIMED: i32 = 1;
    pub const PROCESSED: i32 = 2;
    pub const FAILED: i32 = 4;

    pub const UNCLAIMABLE: i32 = CLAIMED | PROCESSED | FAILED;

    pub fn is_processed(status: i32) -> bool {
        status & PROCESSED != 0
    }

    pub fn is_claimable(status: i32) -> bool {
        status & UNCLAIMABLE == 0
    }
}

/// Perspective checkpoint state. Stored as a smallint, not a bitfield.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[repr(i16)]
pub enum CheckpointStatus {
    None = 0,
    Completed = 1,
    Failed = 2,
    Blocked = 4,
}

impl CheckpointStatus {
    pub fn from_i16(value: i16) -> Self {
        match value {
            1 => CheckpointStatus::Completed,
            2 => CheckpointStatus::Failed,
            4 => CheckpointStatus::Blocked,
            _ => CheckpointStatus::None,
        }
    }

    /// A failed or blocked checkpoint fail-stops its (stream, perspective).
    pub fn halts_delivery(self) -> bool {
        matches!(self, CheckpointStatus::Failed | CheckpointStatus::Blocked)
    }
}

//! Composite state key encoding shared by every accumulator in this crate.
//!
//! A process bucket is `proc_state + mem_factor * STATE_COUNT`; a service
//! bucket is just `mem_factor` (the process-state axis is unused there).
//! Both fit in the 8-bit type tag of a [`crate::pool::PackedOffset`].

/// Number of process lifecycle states (`ProcState` variants).
pub const STATE_COUNT: u8 = 10;

/// Number of mem-factor × screen-state combinations used by service records.
pub const ADJ_COUNT: usize = 8;

/// Longs reserved per PSS table entry: `{count, min, avg, max}`.
pub const PSS_COUNT: u16 = 4;

/// Longs per `LongPool` array.
pub const LONGS_SIZE: usize = 4096;

/// Bit added to a mem factor to indicate the screen is on.
pub const ADJ_SCREEN_ON: u8 = 4;

/// Single-letter mem-factor tags used by the checkin/CSV dump contract
/// (`spec.md` §6), indexed by `MemFactor as u8`.
pub const MEM_TAGS: [char; 4] = ['n', 'm', 'l', 'c'];

/// Single-letter process-state tags used by the checkin/CSV dump contract
/// (`spec.md` §6), indexed by `ProcState as u8`.
pub const PROC_TAGS: [char; STATE_COUNT as usize] = ['y', 't', 'f', 'v', 'r', 'b', 's', 'h', 'p', 'c'];

/// Coarse process lifecycle states, ordered as in `spec.md` §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcState {
    Persistent = 0,
    Top = 1,
    Foreground = 2,
    Visible = 3,
    Perceptible = 4,
    Backup = 5,
    Service = 6,
    Home = 7,
    Previous = 8,
    Cached = 9,
}

impl ProcState {
    pub const COUNT: u8 = STATE_COUNT;

    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Persistent,
            1 => Self::Top,
            2 => Self::Foreground,
            3 => Self::Visible,
            4 => Self::Perceptible,
            5 => Self::Backup,
            6 => Self::Service,
            7 => Self::Home,
            8 => Self::Previous,
            9 => Self::Cached,
            _ => return None,
        })
    }
}

/// Device-wide memory pressure level, before combining with screen state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MemFactor {
    Normal = 0,
    Moderate = 1,
    Low = 2,
    Critical = 3,
}

impl MemFactor {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Normal,
            1 => Self::Moderate,
            2 => Self::Low,
            3 => Self::Critical,
            _ => return None,
        })
    }

    /// Combines this factor with screen state into the 0..8 adjusted value
    /// used by service records and `GlobalState::mem_factor`.
    pub fn adjusted(self, screen_on: bool) -> u8 {
        self as u8 + if screen_on { ADJ_SCREEN_ON } else { 0 }
    }
}

/// Composes a process-state bucket (0..80) from a raw process state and an
/// already-adjusted mem factor (0..8). Returns `None` for `STATE_NOTHING`.
pub fn composite_bucket(proc_state: u8, adjusted_mem_factor: u8) -> Option<u8> {
    let bucket = proc_state as u32 + adjusted_mem_factor as u32 * STATE_COUNT as u32;
    if bucket < 80 { Some(bucket as u8) } else { None }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_bucket_matches_spec_range() {
        assert_eq!(composite_bucket(1, 0), Some(1));
        assert_eq!(composite_bucket(9, 7), Some(79));
        assert_eq!(composite_bucket(0, 0), Some(0));
    }

    #[test]
    fn mem_factor_adjustment() {
        assert_eq!(MemFactor::Low.adjusted(false), 2);
        assert_eq!(MemFactor::Low.adjusted(true), 6);
    }
}

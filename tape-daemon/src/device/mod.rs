//! Uniform contract over block-based sequential-access devices.
//!
//! The API is shaped after tape drives and loaders, but the back end does
//! not have to be one: virtual tape libraries or a raw file backend are
//! equally valid, since the lowest common denominator is sequential access.
//!
//! Error convention: 0 is success, a positive value mirrors a system errno,
//! and a negative value is an error internal to the back end. A
//! distinguished negative value signals end-of-medium.

pub mod changer;
pub mod file;
pub mod registry;

use thiserror::Error;

/// Distinguished internal code: the end of the medium has been reached.
pub const EOM_ERROR_CODE: i32 = -90000;
/// Internal code: operation attempted while the drive was not idle.
pub const BAD_STATE_ERROR_CODE: i32 = -90001;
/// Internal code: no medium is loaded in the drive.
pub const NO_MEDIUM_ERROR_CODE: i32 = -90002;
/// Internal code: the request itself was invalid (bad address, bad size).
pub const BAD_REQUEST_ERROR_CODE: i32 = -90003;

/// What a drive is doing at a given time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DriveState {
    #[default]
    Idle,
    WritingData,
    WritingMetadata,
    Reading,
    SeekingForward,
    SeekingBackward,
    Rewinding,
    Loading,
    Unloading,
    Erasing,
    Retensioning,
    Unknown,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// Positive error mirroring a system errno.
    #[error("system error (errno {0})")]
    System(i32),

    /// Negative error internal to the device back end.
    #[error("back-end internal error ({0})")]
    Internal(i32),

    /// The medium is full; the writer recovers by swapping media.
    #[error("end of medium")]
    EndOfMedium,

    /// Operation rejected because the drive was not idle.
    #[error("drive is busy ({state:?}) during {op}")]
    NotIdle { op: &'static str, state: DriveState },

    #[error("no medium loaded")]
    NoMedium,
}

impl DeviceError {
    /// The tri-state integer representation of this error.
    pub fn code(&self) -> i32 {
        match self {
            DeviceError::System(errno) => *errno,
            DeviceError::Internal(code) => *code,
            DeviceError::EndOfMedium => EOM_ERROR_CODE,
            DeviceError::NotIdle { .. } => BAD_STATE_ERROR_CODE,
            DeviceError::NoMedium => NO_MEDIUM_ERROR_CODE,
        }
    }

    /// Map a tri-state code back to an error; `0` is success.
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => None,
            EOM_ERROR_CODE => Some(DeviceError::EndOfMedium),
            NO_MEDIUM_ERROR_CODE => Some(DeviceError::NoMedium),
            c if c > 0 => Some(DeviceError::System(c)),
            c => Some(DeviceError::Internal(c)),
        }
    }
}

pub type DeviceResult<T> = std::result::Result<T, DeviceError>;

/// Generalized drive status. Some of this is coarse by necessity; physical
/// drives expose wildly different registers.
#[derive(Debug, Clone, Default)]
pub struct DriveStatus {
    pub state: DriveState,
    pub bytes_written: u64,
    pub bytes_written_error: u64,
    pub bytes_read: u64,
    pub bytes_read_error: u64,
}

/// Contract the writer consumes. One implementation per back end.
pub trait SequentialDevice: Send {
    fn status(&self) -> DeviceResult<DriveStatus>;

    /// Current logical block position.
    fn position(&self) -> DeviceResult<u64>;

    fn seek_to(&mut self, block: u64) -> DeviceResult<()>;

    fn rewind(&mut self) -> DeviceResult<()>;

    /// Valid only while the drive is idle and the medium is unlocked.
    fn eject(&mut self) -> DeviceResult<()>;

    fn lock_medium(&mut self, locked: bool) -> DeviceResult<()>;

    /// Write one record starting at the current position. A file mark is
    /// appended only when requested. Returns the bytes actually written; a
    /// short count means the medium filled mid-record.
    fn write(&mut self, data: &[u8], append_filemark: bool) -> DeviceResult<usize>;

    /// Write a file mark at the current position, marking the end of a
    /// record.
    fn write_filemark(&mut self) -> DeviceResult<()>;

    /// Read the record at the current position. Returns 0 at a file mark
    /// or at the end of recorded data.
    fn read(&mut self, buf: &mut [u8]) -> DeviceResult<usize>;

    fn is_at_end_of_medium(&self) -> DeviceResult<bool>;

    /// Space forward past the next file mark.
    fn skip_filemark(&mut self) -> DeviceResult<()>;
}

/// Tracks what the drive is doing and rejects conflicting operations.
///
/// Every operation-starting state returns to `Idle` on completion; `eject`
/// is valid only from `Idle`; anything else is rejected while non-idle.
#[derive(Debug, Default)]
pub struct DriveStateMachine {
    state: DriveState,
    locked: bool,
}

impl DriveStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> DriveState {
        self.state
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub fn set_locked(&mut self, locked: bool) {
        self.locked = locked;
    }

    /// Enter an operation state. Fails unless the drive is idle.
    pub fn begin(&mut self, next: DriveState, op: &'static str) -> DeviceResult<()> {
        if self.state != DriveState::Idle {
            return Err(DeviceError::NotIdle {
                op,
                state: self.state,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Begin an eject; additionally rejected while the medium is locked.
    pub fn begin_eject(&mut self) -> DeviceResult<()> {
        if self.locked {
            return Err(DeviceError::Internal(BAD_STATE_ERROR_CODE));
        }
        self.begin(DriveState::Unloading, "eject")
    }

    /// The running operation finished; the drive is idle again.
    pub fn complete(&mut self) {
        self.state = DriveState::Idle;
    }
}

//! File-backed virtual tape library.
//!
//! Media are plain files holding a sequence of length-framed records and
//! file marks; a medium has a fixed capacity and signals end-of-medium when
//! a record no longer fits. The media bay models the physical locations
//! (drive and slots) and is shared between the device and its changer.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use super::{
    DeviceError, DeviceResult, DriveState, DriveStateMachine, DriveStatus, SequentialDevice,
    BAD_REQUEST_ERROR_CODE,
};

const FRAME_HEADER_LEN: u64 = 9;
const FRAME_DATA: u8 = 0;
const FRAME_FILEMARK: u8 = 1;

/// Physical locations of a virtual library's media. One medium file per
/// slot; the drive holds at most one medium at a time.
#[derive(Debug)]
pub struct MediaBay {
    slots: Vec<Option<PathBuf>>,
    drive: Option<PathBuf>,
}

impl MediaBay {
    /// Create a bay with `num_slots` fresh media under `media_dir`. All
    /// slots start full; the drive starts empty. Capacity is a property of
    /// the drive, not the bay.
    pub fn create(media_dir: &Path, num_slots: usize) -> std::io::Result<Self> {
        std::fs::create_dir_all(media_dir)?;
        let mut slots = Vec::with_capacity(num_slots);
        for i in 0..num_slots {
            let path = media_dir.join(format!("medium-{i:02}.vtape"));
            if !path.exists() {
                File::create(&path)?;
            }
            slots.push(Some(path));
        }
        Ok(Self { slots, drive: None })
    }

    pub fn num_slots(&self) -> usize {
        self.slots.len()
    }

    pub fn slot_medium(&self, idx: usize) -> Option<&PathBuf> {
        self.slots.get(idx).and_then(|s| s.as_ref())
    }

    pub fn drive_medium(&self) -> Option<&PathBuf> {
        self.drive.as_ref()
    }

    pub fn slot_label(&self, idx: usize) -> Option<String> {
        self.slot_medium(idx).map(|p| medium_label(p))
    }

    pub fn drive_label(&self) -> Option<String> {
        self.drive.as_ref().map(|p| medium_label(p))
    }

    pub fn load_drive_from(&mut self, slot: usize) -> DeviceResult<()> {
        if self.drive.is_some() {
            return Err(DeviceError::Internal(BAD_REQUEST_ERROR_CODE));
        }
        let medium = self
            .slots
            .get_mut(slot)
            .ok_or(DeviceError::Internal(BAD_REQUEST_ERROR_CODE))?
            .take()
            .ok_or(DeviceError::NoMedium)?;
        info!(slot, label = %medium_label(&medium), "loading medium into drive");
        self.drive = Some(medium);
        Ok(())
    }

    pub fn unload_drive_into(&mut self, slot: usize) -> DeviceResult<()> {
        let dest = self
            .slots
            .get_mut(slot)
            .ok_or(DeviceError::Internal(BAD_REQUEST_ERROR_CODE))?;
        if dest.is_some() {
            return Err(DeviceError::Internal(BAD_REQUEST_ERROR_CODE));
        }
        let medium = self.drive.take().ok_or(DeviceError::NoMedium)?;
        info!(slot, label = %medium_label(&medium), "unloading medium from drive");
        *dest = Some(medium);
        Ok(())
    }

    pub fn move_between_slots(&mut self, from: usize, to: usize) -> DeviceResult<()> {
        if from == to || from >= self.slots.len() || to >= self.slots.len() {
            return Err(DeviceError::Internal(BAD_REQUEST_ERROR_CODE));
        }
        if self.slots[to].is_some() {
            return Err(DeviceError::Internal(BAD_REQUEST_ERROR_CODE));
        }
        let medium = self.slots[from].take().ok_or(DeviceError::NoMedium)?;
        self.slots[to] = Some(medium);
        Ok(())
    }

    pub fn exchange_slots(&mut self, a: usize, b: usize) -> DeviceResult<()> {
        if a >= self.slots.len() || b >= self.slots.len() {
            return Err(DeviceError::Internal(BAD_REQUEST_ERROR_CODE));
        }
        self.slots.swap(a, b);
        Ok(())
    }

    pub fn eject_drive(&mut self) -> DeviceResult<()> {
        self.drive.take().map(|_| ()).ok_or(DeviceError::NoMedium)
    }
}

fn medium_label(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "UNKNOWN".to_string())
}

#[derive(Debug, Clone, Copy)]
struct RecordMeta {
    /// Offset of the frame header within the medium file.
    offset: u64,
    len: u64,
    filemark: bool,
}

struct LoadedMedium {
    path: PathBuf,
    file: File,
    records: Vec<RecordMeta>,
    /// Logical block position: an index into `records`.
    pos: usize,
    /// Byte offset just past the last valid frame.
    data_end: u64,
}

impl LoadedMedium {
    fn open(path: &Path) -> DeviceResult<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(io_to_device)?;

        let file_len = file.metadata().map_err(io_to_device)?.len();
        let mut records = Vec::new();
        let mut offset = 0u64;

        // Rebuild the record index from the frame stream; anything after a
        // malformed frame is treated as unrecorded tape.
        while offset + FRAME_HEADER_LEN <= file_len {
            file.seek(SeekFrom::Start(offset)).map_err(io_to_device)?;
            let mut header = [0u8; FRAME_HEADER_LEN as usize];
            if file.read_exact(&mut header).is_err() {
                break;
            }
            let len = u64::from_le_bytes(header[0..8].try_into().unwrap());
            let kind = header[8];
            if kind != FRAME_DATA && kind != FRAME_FILEMARK {
                break;
            }
            if offset + FRAME_HEADER_LEN + len > file_len {
                break;
            }
            records.push(RecordMeta {
                offset,
                len,
                filemark: kind == FRAME_FILEMARK,
            });
            offset += FRAME_HEADER_LEN + len;
        }

        Ok(Self {
            path: path.to_path_buf(),
            file,
            records,
            pos: 0,
            data_end: offset,
        })
    }

    /// Writing at a position in the middle of the tape discards everything
    /// recorded after it.
    fn truncate_at_position(&mut self) -> DeviceResult<()> {
        if self.pos < self.records.len() {
            let cut = self.records[self.pos].offset;
            self.records.truncate(self.pos);
            self.data_end = cut;
            self.file.set_len(cut).map_err(io_to_device)?;
        }
        Ok(())
    }

    fn append_frame(&mut self, kind: u8, data: &[u8]) -> DeviceResult<()> {
        self.file
            .seek(SeekFrom::Start(self.data_end))
            .map_err(io_to_device)?;

        let mut header = [0u8; FRAME_HEADER_LEN as usize];
        header[0..8].copy_from_slice(&(data.len() as u64).to_le_bytes());
        header[8] = kind;
        self.file.write_all(&header).map_err(io_to_device)?;
        self.file.write_all(data).map_err(io_to_device)?;

        self.records.push(RecordMeta {
            offset: self.data_end,
            len: data.len() as u64,
            filemark: kind == FRAME_FILEMARK,
        });
        self.data_end += FRAME_HEADER_LEN + data.len() as u64;
        self.pos = self.records.len();
        Ok(())
    }
}

const EIO: i32 = 5;

fn io_to_device(err: std::io::Error) -> DeviceError {
    DeviceError::System(err.raw_os_error().unwrap_or(EIO))
}

/// Sequential device over the medium currently in the bay's drive.
pub struct FileDevice {
    bay: Arc<Mutex<MediaBay>>,
    capacity: u64,
    sm: DriveStateMachine,
    loaded: Option<LoadedMedium>,
    bytes_written: u64,
    bytes_written_error: u64,
    bytes_read: u64,
    bytes_read_error: u64,
}

impl FileDevice {
    pub fn new(bay: Arc<Mutex<MediaBay>>, capacity: u64) -> Self {
        Self {
            bay,
            capacity,
            sm: DriveStateMachine::new(),
            loaded: None,
            bytes_written: 0,
            bytes_written_error: 0,
            bytes_read: 0,
            bytes_read_error: 0,
        }
    }

    /// Re-open the backing medium if the changer swapped it since the last
    /// operation.
    fn sync_medium(&mut self) -> DeviceResult<()> {
        let current = self.bay.lock().unwrap().drive_medium().cloned();
        match current {
            None => {
                self.loaded = None;
                Err(DeviceError::NoMedium)
            }
            Some(path) => {
                let reload = self
                    .loaded
                    .as_ref()
                    .map(|l| l.path != path)
                    .unwrap_or(true);
                if reload {
                    debug!(medium = %medium_label(&path), "opening medium");
                    self.loaded = Some(LoadedMedium::open(&path)?);
                }
                Ok(())
            }
        }
    }

    fn loaded_mut(&mut self) -> DeviceResult<&mut LoadedMedium> {
        self.loaded.as_mut().ok_or(DeviceError::NoMedium)
    }
}

impl SequentialDevice for FileDevice {
    fn status(&self) -> DeviceResult<DriveStatus> {
        Ok(DriveStatus {
            state: self.sm.state(),
            bytes_written: self.bytes_written,
            bytes_written_error: self.bytes_written_error,
            bytes_read: self.bytes_read,
            bytes_read_error: self.bytes_read_error,
        })
    }

    fn position(&self) -> DeviceResult<u64> {
        let medium = self.loaded.as_ref().ok_or(DeviceError::NoMedium)?;
        Ok(medium.pos as u64)
    }

    fn seek_to(&mut self, block: u64) -> DeviceResult<()> {
        let direction = match self.loaded.as_ref() {
            Some(l) if (block as usize) < l.pos => DriveState::SeekingBackward,
            _ => DriveState::SeekingForward,
        };
        self.sm.begin(direction, "seek")?;
        let result = self.sync_medium().and_then(|()| {
            let medium = self.loaded_mut()?;
            medium.pos = (block as usize).min(medium.records.len());
            Ok(())
        });
        self.sm.complete();
        result
    }

    fn rewind(&mut self) -> DeviceResult<()> {
        self.sm.begin(DriveState::Rewinding, "rewind")?;
        let result = self.sync_medium().and_then(|()| {
            self.loaded_mut()?.pos = 0;
            Ok(())
        });
        self.sm.complete();
        result
    }

    fn eject(&mut self) -> DeviceResult<()> {
        self.sm.begin_eject()?;
        let result = self.bay.lock().unwrap().eject_drive();
        self.loaded = None;
        self.sm.complete();
        result
    }

    fn lock_medium(&mut self, locked: bool) -> DeviceResult<()> {
        self.sm.set_locked(locked);
        Ok(())
    }

    fn write(&mut self, data: &[u8], append_filemark: bool) -> DeviceResult<usize> {
        self.sm.begin(DriveState::WritingData, "write")?;
        let result = (|| {
            self.sync_medium()?;
            let capacity = self.capacity;
            let medium = self.loaded_mut()?;
            medium.truncate_at_position()?;

            if medium.data_end + FRAME_HEADER_LEN + data.len() as u64 > capacity {
                return Err(DeviceError::EndOfMedium);
            }

            medium.append_frame(FRAME_DATA, data)?;
            if append_filemark {
                medium.append_frame(FRAME_FILEMARK, &[])?;
                medium.file.sync_data().map_err(io_to_device)?;
            }
            Ok(data.len())
        })();
        self.sm.complete();

        match &result {
            Ok(n) => self.bytes_written += *n as u64,
            Err(_) => self.bytes_written_error += data.len() as u64,
        }
        result
    }

    fn write_filemark(&mut self) -> DeviceResult<()> {
        self.sm.begin(DriveState::WritingMetadata, "write_filemark")?;
        let result = self.sync_medium().and_then(|()| {
            let medium = self.loaded_mut()?;
            medium.truncate_at_position()?;
            medium.append_frame(FRAME_FILEMARK, &[])?;
            // The file mark is the durability point for the record before
            // it; it is acknowledged only once it has hit stable storage.
            medium.file.sync_data().map_err(io_to_device)
        });
        self.sm.complete();
        result
    }

    fn read(&mut self, buf: &mut [u8]) -> DeviceResult<usize> {
        self.sm.begin(DriveState::Reading, "read")?;
        let result = (|| {
            self.sync_medium()?;
            let medium = self.loaded_mut()?;

            let Some(record) = medium.records.get(medium.pos).copied() else {
                return Ok(0); // end of recorded data
            };
            if record.filemark {
                return Ok(0);
            }
            if (buf.len() as u64) < record.len {
                return Err(DeviceError::Internal(BAD_REQUEST_ERROR_CODE));
            }

            medium
                .file
                .seek(SeekFrom::Start(record.offset + FRAME_HEADER_LEN))
                .map_err(io_to_device)?;
            medium
                .file
                .read_exact(&mut buf[..record.len as usize])
                .map_err(io_to_device)?;
            medium.pos += 1;
            Ok(record.len as usize)
        })();
        self.sm.complete();

        match &result {
            Ok(n) => self.bytes_read += *n as u64,
            Err(_) => self.bytes_read_error += buf.len() as u64,
        }
        result
    }

    fn is_at_end_of_medium(&self) -> DeviceResult<bool> {
        match self.loaded.as_ref() {
            Some(medium) => Ok(medium.data_end >= self.capacity),
            None => {
                let path = self
                    .bay
                    .lock()
                    .unwrap()
                    .drive_medium()
                    .cloned()
                    .ok_or(DeviceError::NoMedium)?;
                let len = std::fs::metadata(path).map_err(io_to_device)?.len();
                Ok(len >= self.capacity)
            }
        }
    }

    fn skip_filemark(&mut self) -> DeviceResult<()> {
        self.sm.begin(DriveState::SeekingForward, "skip_filemark")?;
        let result = self.sync_medium().and_then(|()| {
            let medium = self.loaded_mut()?;
            while medium.pos < medium.records.len() {
                let was_filemark = medium.records[medium.pos].filemark;
                medium.pos += 1;
                if was_filemark {
                    break;
                }
            }
            Ok(())
        });
        self.sm.complete();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn device_with_medium(capacity: u64) -> (TempDir, FileDevice) {
        let dir = TempDir::new().unwrap();
        let mut bay = MediaBay::create(dir.path(), 2).unwrap();
        bay.load_drive_from(0).unwrap();
        let device = FileDevice::new(Arc::new(Mutex::new(bay)), capacity);
        (dir, device)
    }

    #[test]
    fn test_write_read_roundtrip() {
        let (_dir, mut device) = device_with_medium(1024 * 1024);

        assert_eq!(device.write(b"record one", false).unwrap(), 10);
        device.write_filemark().unwrap();
        assert_eq!(device.write(b"record two!", true).unwrap(), 11);

        device.rewind().unwrap();
        assert_eq!(device.position().unwrap(), 0);

        let mut buf = [0u8; 64];
        assert_eq!(device.read(&mut buf).unwrap(), 10);
        assert_eq!(&buf[..10], b"record one");

        // Positioned at the file mark now: reads return zero until skipped.
        assert_eq!(device.read(&mut buf).unwrap(), 0);
        device.skip_filemark().unwrap();
        assert_eq!(device.read(&mut buf).unwrap(), 11);
        assert_eq!(&buf[..11], b"record two!");
    }

    #[test]
    fn test_capacity_signals_end_of_medium() {
        let (_dir, mut device) = device_with_medium(64);

        assert_eq!(device.write(&[0xAB; 32], false).unwrap(), 32);
        let err = device.write(&[0xCD; 32], false).unwrap_err();
        assert_eq!(err, DeviceError::EndOfMedium);
        assert!(device.is_at_end_of_medium().unwrap() || device.status().unwrap().bytes_written_error > 0);
    }

    #[test]
    fn test_write_after_rewind_truncates() {
        let (_dir, mut device) = device_with_medium(1024 * 1024);

        device.write(b"old data", true).unwrap();
        device.write(b"more old", true).unwrap();

        device.rewind().unwrap();
        device.write(b"new", true).unwrap();

        device.rewind().unwrap();
        let mut buf = [0u8; 64];
        assert_eq!(device.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"new");
        device.skip_filemark().unwrap();
        assert_eq!(device.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_medium_swap_through_bay() {
        let dir = TempDir::new().unwrap();
        let mut bay = MediaBay::create(dir.path(), 2).unwrap();
        bay.load_drive_from(0).unwrap();
        let bay = Arc::new(Mutex::new(bay));
        let mut device = FileDevice::new(bay.clone(), 1024);

        device.write(b"on medium zero", false).unwrap();

        {
            let mut bay = bay.lock().unwrap();
            bay.unload_drive_into(0).unwrap();
            bay.load_drive_from(1).unwrap();
        }

        device.rewind().unwrap();
        let mut buf = [0u8; 64];
        // Fresh medium: nothing recorded.
        assert_eq!(device.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_eject_requires_unlocked() {
        let (_dir, mut device) = device_with_medium(1024);
        device.lock_medium(true).unwrap();
        assert!(device.eject().is_err());
        device.lock_medium(false).unwrap();
        device.eject().unwrap();
        assert!(matches!(device.position(), Err(DeviceError::NoMedium)));
    }

    #[test]
    fn test_no_medium_reported() {
        let dir = TempDir::new().unwrap();
        let bay = MediaBay::create(dir.path(), 1).unwrap();
        // Nothing loaded into the drive.
        let mut device = FileDevice::new(Arc::new(Mutex::new(bay)), 1024);
        assert!(matches!(
            device.write(b"x", false),
            Err(DeviceError::NoMedium)
        ));
    }
}

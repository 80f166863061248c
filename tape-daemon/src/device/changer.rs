//! Media changer (loader) contract and the virtual-library implementation.
//!
//! A changer moves media between storage elements: the transport (picker),
//! slots, import/export portals, and drives. The writer only ever asks for
//! a single move, slot to drive, when the current medium fills up.

use std::sync::{Arc, Mutex};

use super::file::MediaBay;
use super::{DeviceError, DeviceResult, BAD_REQUEST_ERROR_CODE};

/// Kinds of storage elements a loader exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementKind {
    /// Medium transport element (picker).
    Transport,
    /// Storage element (slot).
    Slot,
    /// Import/export element (mailslot).
    Portal,
    /// Data transfer element (drive).
    Drive,
}

/// Flags describing a storage element; logically OR-ed together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ElementFlags(pub u32);

impl ElementFlags {
    pub const FULL: u32 = 1 << 0;
    pub const PLACED_BY_OPERATOR: u32 = 1 << 1;
    pub const INVALID_LABEL: u32 = 1 << 2;
    pub const ACCESSIBLE: u32 = 1 << 3;
    pub const SUPPORTS_EXPORT: u32 = 1 << 8;
    pub const SUPPORTS_IMPORT: u32 = 1 << 9;

    pub fn contains(self, flag: u32) -> bool {
        self.0 & flag != 0
    }

    pub fn is_full(self) -> bool {
        self.contains(Self::FULL)
    }

    pub fn is_accessible(self) -> bool {
        self.contains(Self::ACCESSIBLE)
    }
}

/// Snapshot of one storage element.
#[derive(Debug, Clone)]
pub struct ElementInfo {
    /// Loader-specific logical address.
    pub address: u64,
    pub kind: ElementKind,
    pub flags: ElementFlags,
    /// Volume label, when the element holds a labeled medium.
    pub label: Option<String>,
}

/// Loader operations the writer and the control surface consume.
pub trait MediaChanger: Send {
    fn num_elements(&self, kind: ElementKind) -> DeviceResult<usize>;

    fn elements(&self, kind: ElementKind) -> DeviceResult<Vec<ElementInfo>>;

    /// Move the medium at `src` into `dst`. Blocks for the duration.
    fn move_medium(&mut self, src: u64, dst: u64) -> DeviceResult<()>;

    /// Exchange the media in two elements. Not supported by many loaders.
    fn exchange_medium(&mut self, a: u64, b: u64) -> DeviceResult<()>;

    /// Re-inventory all elements, re-reading labels where possible.
    fn perform_inventory(&mut self) -> DeviceResult<()>;
}

/// Element addressing used by the virtual library: the picker is 0, the
/// drive is 1, the portal is 8, and slots start at 16.
pub const TRANSPORT_ADDRESS: u64 = 0;
pub const DRIVE_ADDRESS: u64 = 1;
pub const PORTAL_ADDRESS: u64 = 8;
pub const SLOT_BASE_ADDRESS: u64 = 16;

/// Changer over the shared media bay of a virtual library.
pub struct BayChanger {
    bay: Arc<Mutex<MediaBay>>,
}

impl BayChanger {
    pub fn new(bay: Arc<Mutex<MediaBay>>) -> Self {
        Self { bay }
    }

    fn slot_index(address: u64, num_slots: usize) -> DeviceResult<usize> {
        let idx = address
            .checked_sub(SLOT_BASE_ADDRESS)
            .ok_or(DeviceError::Internal(BAD_REQUEST_ERROR_CODE))? as usize;
        if idx >= num_slots {
            return Err(DeviceError::Internal(BAD_REQUEST_ERROR_CODE));
        }
        Ok(idx)
    }
}

impl MediaChanger for BayChanger {
    fn num_elements(&self, kind: ElementKind) -> DeviceResult<usize> {
        let bay = self.bay.lock().unwrap();
        Ok(match kind {
            ElementKind::Transport => 1,
            ElementKind::Slot => bay.num_slots(),
            ElementKind::Portal => 1,
            ElementKind::Drive => 1,
        })
    }

    fn elements(&self, kind: ElementKind) -> DeviceResult<Vec<ElementInfo>> {
        let bay = self.bay.lock().unwrap();
        let accessible = ElementFlags(ElementFlags::ACCESSIBLE);

        Ok(match kind {
            ElementKind::Transport => vec![ElementInfo {
                address: TRANSPORT_ADDRESS,
                kind,
                flags: accessible,
                label: None,
            }],
            ElementKind::Portal => vec![ElementInfo {
                address: PORTAL_ADDRESS,
                kind,
                flags: ElementFlags(
                    ElementFlags::ACCESSIBLE
                        | ElementFlags::SUPPORTS_IMPORT
                        | ElementFlags::SUPPORTS_EXPORT,
                ),
                label: None,
            }],
            ElementKind::Drive => {
                let mut flags = ElementFlags::ACCESSIBLE;
                if bay.drive_medium().is_some() {
                    flags |= ElementFlags::FULL;
                }
                vec![ElementInfo {
                    address: DRIVE_ADDRESS,
                    kind,
                    flags: ElementFlags(flags),
                    label: bay.drive_label(),
                }]
            }
            ElementKind::Slot => (0..bay.num_slots())
                .map(|i| {
                    let mut flags = ElementFlags::ACCESSIBLE;
                    if bay.slot_medium(i).is_some() {
                        flags |= ElementFlags::FULL;
                    }
                    ElementInfo {
                        address: SLOT_BASE_ADDRESS + i as u64,
                        kind,
                        flags: ElementFlags(flags),
                        label: bay.slot_label(i),
                    }
                })
                .collect(),
        })
    }

    fn move_medium(&mut self, src: u64, dst: u64) -> DeviceResult<()> {
        let mut bay = self.bay.lock().unwrap();
        let num_slots = bay.num_slots();

        match (src, dst) {
            (DRIVE_ADDRESS, slot) => {
                let idx = Self::slot_index(slot, num_slots)?;
                bay.unload_drive_into(idx)
            }
            (slot, DRIVE_ADDRESS) => {
                let idx = Self::slot_index(slot, num_slots)?;
                bay.load_drive_from(idx)
            }
            (a, b) => {
                let from = Self::slot_index(a, num_slots)?;
                let to = Self::slot_index(b, num_slots)?;
                bay.move_between_slots(from, to)
            }
        }
    }

    fn exchange_medium(&mut self, a: u64, b: u64) -> DeviceResult<()> {
        let mut bay = self.bay.lock().unwrap();
        let num_slots = bay.num_slots();
        let from = Self::slot_index(a, num_slots)?;
        let to = Self::slot_index(b, num_slots)?;
        bay.exchange_slots(from, to)
    }

    fn perform_inventory(&mut self) -> DeviceResult<()> {
        // The bay's view of its media is always current.
        Ok(())
    }
}

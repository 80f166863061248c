//! Registry of the virtual tape libraries the daemon controls.
//!
//! Built once at startup from configuration. Each library owns a media bay
//! shared between its drive and its changer; a backup job checks the drive
//! out for exclusive use and releases it on completion.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::utils::errors::Result;
use super::changer::BayChanger;
use super::file::{FileDevice, MediaBay};

pub struct VirtualLibrary {
    pub id: Uuid,
    pub name: String,
    pub drive_id: Uuid,
    pub drive_name: String,
    pub loader_id: Uuid,
    pub loader_name: String,
    /// Directory holding this library's medium files.
    pub media_dir: PathBuf,
    pub media_capacity: u64,

    bay: Arc<Mutex<MediaBay>>,
    in_use: AtomicBool,
}

impl VirtualLibrary {
    /// Exclusive checkout of the library's drive (plus its changer) for a
    /// backup job. Loads a medium into the drive if it is empty.
    pub fn checkout(&self) -> Option<(FileDevice, BayChanger)> {
        if self
            .in_use
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }

        {
            let mut bay = self.bay.lock().unwrap();
            if bay.drive_medium().is_none() {
                let first_full = (0..bay.num_slots()).find(|&i| bay.slot_medium(i).is_some());
                if let Some(slot) = first_full {
                    // A failed load leaves the drive empty; the writer will
                    // surface the missing medium.
                    let _ = bay.load_drive_from(slot);
                }
            }
        }

        Some((
            FileDevice::new(self.bay.clone(), self.media_capacity),
            BayChanger::new(self.bay.clone()),
        ))
    }

    pub fn release(&self) {
        self.in_use.store(false, Ordering::Release);
    }

    pub fn is_in_use(&self) -> bool {
        self.in_use.load(Ordering::Acquire)
    }

    /// A changer handle for read-only element listing.
    pub fn changer(&self) -> BayChanger {
        BayChanger::new(self.bay.clone())
    }
}

pub struct DeviceRegistry {
    pub libraries: Vec<VirtualLibrary>,
}

impl DeviceRegistry {
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut libraries = Vec::with_capacity(config.library.len());

        for lib_cfg in &config.library {
            let media_dir = config
                .daemon
                .data_dir
                .join("media")
                .join(sanitize_dir_name(&lib_cfg.name));
            let bay = MediaBay::create(&media_dir, lib_cfg.slots)?;

            info!(
                library = %lib_cfg.name,
                slots = lib_cfg.slots,
                capacity = lib_cfg.media_capacity,
                media_dir = %media_dir.display(),
                "registered virtual tape library"
            );

            libraries.push(VirtualLibrary {
                id: Uuid::new_v4(),
                name: lib_cfg.name.clone(),
                drive_id: Uuid::new_v4(),
                drive_name: lib_cfg.drive.clone(),
                loader_id: Uuid::new_v4(),
                loader_name: format!("{} Loader", lib_cfg.name),
                media_dir,
                media_capacity: lib_cfg.media_capacity,
                bay: Arc::new(Mutex::new(bay)),
                in_use: AtomicBool::new(false),
            });
        }

        Ok(Self { libraries })
    }

    /// Find a library by name, or fall back to the first one.
    pub fn find(&self, name: Option<&str>) -> Option<&VirtualLibrary> {
        match name {
            Some(name) => self.libraries.iter().find(|l| l.name == name),
            None => self.libraries.first(),
        }
    }
}

fn sanitize_dir_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' { c } else { '_' })
        .collect::<String>()
        .to_lowercase()
}

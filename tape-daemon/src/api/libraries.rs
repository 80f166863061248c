//! Hardware enumeration endpoint.
//!
//! `GET /api/libraries` returns four flat arrays: the libraries, their
//! drives and loaders (referenced by id from the library objects), and
//! every storage element known to the loaders.

use axum::extract::State;
use axum::Json;
use serde::Serialize;
use tracing::warn;

use crate::device::changer::{ElementInfo, ElementKind, MediaChanger};
use crate::device::registry::DeviceRegistry;
use super::AppState;

#[derive(Debug, Serialize)]
pub struct LibrariesResponse {
    pub libraries: Vec<LibraryJson>,
    pub drives: Vec<DriveJson>,
    pub loaders: Vec<LoaderJson>,
    pub element: Vec<ElementJson>,
}

#[derive(Debug, Serialize)]
pub struct LibraryJson {
    pub id: String,
    pub name: String,
    pub drives: Vec<String>,
    pub loaders: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct DriveJson {
    pub id: String,
    pub name: String,
    pub file: String,
}

#[derive(Debug, Serialize)]
pub struct LoaderJson {
    pub id: String,
    pub name: String,
    pub file: String,
    pub elements: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct ElementJson {
    pub id: String,
    pub address: u64,
    #[serde(rename = "isEmpty")]
    pub is_empty: bool,
    pub kind: &'static str,
    pub label: String,
}

fn element_kind_name(kind: ElementKind) -> &'static str {
    match kind {
        ElementKind::Drive => "drive",
        ElementKind::Slot => "storage",
        ElementKind::Portal => "portal",
        ElementKind::Transport => "transport",
    }
}

fn element_json(loader_id: &str, info: &ElementInfo) -> ElementJson {
    ElementJson {
        // Stable across requests: the owning loader plus the element's
        // logical address.
        id: format!("{loader_id}:{}", info.address),
        address: info.address,
        is_empty: !info.flags.is_full(),
        kind: element_kind_name(info.kind),
        label: info.label.clone().unwrap_or_default(),
    }
}

/// Build the response from the registry's current state.
pub fn libraries_response(registry: &DeviceRegistry) -> LibrariesResponse {
    let mut libraries = Vec::new();
    let mut drives = Vec::new();
    let mut loaders = Vec::new();
    let mut element = Vec::new();

    for library in &registry.libraries {
        let drive_id = library.drive_id.to_string();
        drives.push(DriveJson {
            id: drive_id.clone(),
            name: library.drive_name.clone(),
            file: library.media_dir.display().to_string(),
        });

        let loader_id = library.loader_id.to_string();
        let mut loader_element_ids = Vec::new();

        let changer = library.changer();
        for kind in [
            ElementKind::Transport,
            ElementKind::Drive,
            ElementKind::Portal,
            ElementKind::Slot,
        ] {
            match changer.elements(kind) {
                Ok(infos) => {
                    for info in &infos {
                        let json = element_json(&loader_id, info);
                        loader_element_ids.push(json.id.clone());
                        element.push(json);
                    }
                }
                Err(err) => {
                    warn!(library = %library.name, ?kind, %err, "element enumeration failed")
                }
            }
        }

        loaders.push(LoaderJson {
            id: loader_id.clone(),
            name: library.loader_name.clone(),
            file: library.media_dir.display().to_string(),
            elements: loader_element_ids,
        });

        libraries.push(LibraryJson {
            id: library.id.to_string(),
            name: library.name.clone(),
            drives: vec![drive_id],
            loaders: vec![loader_id],
        });
    }

    LibrariesResponse {
        libraries,
        drives,
        loaders,
        element,
    }
}

pub async fn get_all_libraries(State(state): State<AppState>) -> Json<LibrariesResponse> {
    Json(libraries_response(&state.registry))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, LibraryConfig};
    use tempfile::TempDir;

    #[test]
    fn test_response_shape() {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.daemon.data_dir = dir.path().to_path_buf();
        config.library.push(LibraryConfig {
            name: "Library A".to_string(),
            drive: "Drive 0".to_string(),
            slots: 2,
            media_capacity: 1024 * 1024,
        });

        let registry = DeviceRegistry::from_config(&config).unwrap();
        let response = libraries_response(&registry);

        assert_eq!(response.libraries.len(), 1);
        assert_eq!(response.drives.len(), 1);
        assert_eq!(response.loaders.len(), 1);
        // transport + drive + portal + 2 slots
        assert_eq!(response.element.len(), 5);

        let library = &response.libraries[0];
        assert_eq!(library.drives, vec![response.drives[0].id.clone()]);
        assert_eq!(library.loaders, vec![response.loaders[0].id.clone()]);

        let kinds: Vec<_> = response.element.iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&"transport"));
        assert!(kinds.contains(&"drive"));
        assert!(kinds.contains(&"portal"));
        assert!(kinds.contains(&"storage"));

        // Fresh library: slots are full, the drive is empty.
        let storage: Vec<_> = response
            .element
            .iter()
            .filter(|e| e.kind == "storage")
            .collect();
        assert!(storage.iter().all(|e| !e.is_empty));
        assert!(storage.iter().all(|e| !e.label.is_empty()));

        let json = serde_json::to_value(&response).unwrap();
        assert!(json.get("element").is_some());
        assert!(json["element"][0].get("isEmpty").is_some());
    }
}

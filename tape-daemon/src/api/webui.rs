//! Static web UI assets with ETag revalidation.
//!
//! Everything that is not an API route is resolved against the configured
//! `webui` directory. Directory requests serve `index.html`; paths that
//! try to escape the root are rejected.

use std::path::{Component, Path, PathBuf};

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use tracing::debug;

use crate::chunk::format::crc32c;
use super::AppState;

/// Resolve a request path inside `root`, refusing traversal components.
fn resolve_asset(root: &Path, request_path: &str) -> Option<PathBuf> {
    let relative = request_path.trim_start_matches('/');
    let relative = if relative.is_empty() {
        "index.html"
    } else {
        relative
    };

    let candidate = Path::new(relative);
    for component in candidate.components() {
        match component {
            Component::Normal(_) => {}
            _ => return None,
        }
    }

    let mut path = root.join(candidate);
    if path.is_dir() {
        path.push("index.html");
    }
    path.is_file().then_some(path)
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("ico") => "image/x-icon",
        _ => "application/octet-stream",
    }
}

pub async fn serve_asset(
    State(state): State<AppState>,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let root = &state.config.daemon.webui_dir;
    let Some(path) = resolve_asset(root, uri.path()) else {
        return (StatusCode::NOT_FOUND, "not found").into_response();
    };

    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(err) => {
            debug!(path = %path.display(), %err, "failed to read asset");
            return (StatusCode::NOT_FOUND, "not found").into_response();
        }
    };

    let etag = format!("\"{:08x}-{:x}\"", crc32c(&bytes), bytes.len());
    if let Some(candidate) = headers.get(header::IF_NONE_MATCH) {
        if candidate.to_str().map(|v| v == etag).unwrap_or(false) {
            return (StatusCode::NOT_MODIFIED, [(header::ETAG, etag)], ()).into_response();
        }
    }

    (
        [
            (header::CONTENT_TYPE, content_type(&path).to_string()),
            (header::ETAG, etag),
        ],
        bytes,
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_resolve_rejects_traversal() {
        let root = TempDir::new().unwrap();
        fs::write(root.path().join("index.html"), "<html/>").unwrap();

        assert!(resolve_asset(root.path(), "/../etc/passwd").is_none());
        assert!(resolve_asset(root.path(), "/a/../../secret").is_none());
        assert!(resolve_asset(root.path(), "/missing.css").is_none());
    }

    #[test]
    fn test_resolve_serves_index_for_directories() {
        let root = TempDir::new().unwrap();
        fs::write(root.path().join("index.html"), "<html/>").unwrap();
        fs::create_dir(root.path().join("docs")).unwrap();
        fs::write(root.path().join("docs/index.html"), "<html/>").unwrap();

        assert_eq!(
            resolve_asset(root.path(), "/"),
            Some(root.path().join("index.html"))
        );
        assert_eq!(
            resolve_asset(root.path(), "/docs"),
            Some(root.path().join("docs/index.html"))
        );
    }

    #[test]
    fn test_content_types() {
        assert_eq!(content_type(Path::new("a.html")), "text/html; charset=utf-8");
        assert_eq!(content_type(Path::new("a.js")), "application/javascript");
        assert_eq!(content_type(Path::new("a.bin")), "application/octet-stream");
    }
}

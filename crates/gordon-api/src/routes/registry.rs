//! OCI Distribution v2 routes.
//!
//! Routes a suffix-based path parser and per-method handler split onto
//! `gordon_core::RegistryService`, with `/v2/{name}/tags/list` and
//! `/v2/_catalog` endpoints gated by `gordon_auth::require_scope`.
//! Cross-registry blob-mount (`mount`/`from` query params) is out of scope:
//! Gordon has no upstream registry to mount from.

use axum::extract::{Extension, Path, Query, Request, State};
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, head, patch, post, put};
use axum::Router;
use bytes::Bytes;
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio_util::io::StreamReader;
use tracing::debug;

use gordon_auth::{require_scope, Action, AuthPrincipal};
use gordon_storage::StorageError;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct UploadCompleteQuery {
    digest: Option<String>,
}

#[derive(Serialize)]
struct TagsListResponse {
    name: String,
    tags: Vec<String>,
}

#[derive(Serialize)]
struct CatalogResponse {
    repositories: Vec<String>,
}

async fn version_check() -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        "{}",
    )
        .into_response()
}

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/v2/", get(version_check))
        .route("/v2/{*path}", get(handle_get_or_head_request))
        .route("/v2/{*path}", head(handle_get_or_head_request))
        .route("/v2/{*path}", put(handle_put_request))
        .route("/v2/{*path}", post(handle_post_request))
        .route("/v2/{*path}", patch(handle_patch_request))
        .route("/v2/{*path}", axum::routing::delete(handle_delete_request))
}

enum RegistryRequest {
    Manifest { name: String, reference: String },
    Blob { name: String, digest: String },
    StartUpload { name: String },
    Upload { name: String, session_id: String },
    TagsList { name: String },
    Catalog,
}

fn parse_registry_path(path: &str) -> Option<RegistryRequest> {
    if path == "_catalog" {
        return Some(RegistryRequest::Catalog);
    }

    if let Some(idx) = path.rfind("/tags/list") {
        return Some(RegistryRequest::TagsList {
            name: path[..idx].to_string(),
        });
    }

    if let Some(idx) = path.rfind("/manifests/") {
        let name = &path[..idx];
        let reference = &path[idx + "/manifests/".len()..];
        return Some(RegistryRequest::Manifest {
            name: name.to_string(),
            reference: reference.to_string(),
        });
    }

    if let Some(idx) = path.rfind("/blobs/uploads/") {
        let name = &path[..idx];
        let session_id = &path[idx + "/blobs/uploads/".len()..];
        return Some(if session_id.is_empty() {
            RegistryRequest::StartUpload {
                name: name.to_string(),
            }
        } else {
            RegistryRequest::Upload {
                name: name.to_string(),
                session_id: session_id.to_string(),
            }
        });
    }

    if let Some(idx) = path.rfind("/blobs/") {
        let name = &path[..idx];
        let digest = &path[idx + "/blobs/".len()..];
        return Some(RegistryRequest::Blob {
            name: name.to_string(),
            digest: digest.to_string(),
        });
    }

    None
}

fn authorize(
    state: &AppState,
    principal: &Option<AuthPrincipal>,
    repository: &str,
    action: Action,
) -> Result<(), ApiError> {
    if state.auth.provider.is_none() {
        // Auth disabled entirely: nothing to enforce.
        return Ok(());
    }
    require_scope(
        principal.as_ref(),
        state.auth.anonymous_pull,
        repository,
        action,
    )
    .map_err(ApiError::from)
}

async fn handle_get_or_head_request(
    State(state): State<AppState>,
    Path(path): Path<String>,
    principal: Option<Extension<AuthPrincipal>>,
    method: Method,
) -> Result<Response, ApiError> {
    let principal = principal.map(|Extension(p)| p);
    let req = parse_registry_path(&path).ok_or_else(|| ApiError::NotFound(path.clone()))?;

    match req {
        RegistryRequest::Catalog => {
            let repositories = state.registry.list_repositories().await?;
            Ok(axum::Json(CatalogResponse { repositories }).into_response())
        }
        RegistryRequest::TagsList { name } => {
            authorize(&state, &principal, &name, Action::Pull)?;
            let tags = state.registry.list_tags(&name).await?;
            Ok(axum::Json(TagsListResponse { name, tags }).into_response())
        }
        RegistryRequest::Manifest { name, reference } => {
            authorize(&state, &principal, &name, Action::Pull)?;
            if method == Method::HEAD {
                debug!(%name, %reference, "head manifest");
                match state.registry.manifest_exists(&name, &reference).await? {
                    Some(manifest) => {
                        let mut response = StatusCode::OK.into_response();
                        let headers = response.headers_mut();
                        headers.insert(
                            header::CONTENT_TYPE,
                            HeaderValue::from_str(&manifest.media_type)
                                .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
                        );
                        headers.insert(
                            header::CONTENT_LENGTH,
                            HeaderValue::from(manifest.body.len() as u64),
                        );
                        headers.insert(
                            "Docker-Content-Digest",
                            HeaderValue::from_str(&manifest.digest).unwrap(),
                        );
                        Ok(response)
                    }
                    None => Err(ApiError::NotFound(format!("{name}:{reference}"))),
                }
            } else {
                debug!(%name, %reference, "get manifest");
                let manifest = state.registry.get_manifest(&name, &reference).await?;
                let mut response = (StatusCode::OK, manifest.body).into_response();
                let headers = response.headers_mut();
                headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_str(&manifest.media_type)
                        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
                );
                headers.insert(
                    "Docker-Content-Digest",
                    HeaderValue::from_str(&manifest.digest).unwrap(),
                );
                Ok(response)
            }
        }
        RegistryRequest::Blob { name, digest } => {
            authorize(&state, &principal, &name, Action::Pull)?;
            if method == Method::HEAD {
                debug!(%digest, "head blob");
                match state.registry.blob_exists(&digest).await? {
                    Some(size) => {
                        let mut response = StatusCode::OK.into_response();
                        let headers = response.headers_mut();
                        headers.insert(
                            header::CONTENT_TYPE,
                            HeaderValue::from_static("application/octet-stream"),
                        );
                        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
                        headers.insert(
                            "Docker-Content-Digest",
                            HeaderValue::from_str(&digest).unwrap(),
                        );
                        Ok(response)
                    }
                    None => Err(ApiError::NotFound(digest)),
                }
            } else {
                debug!(%digest, "get blob");
                let (stream, size) = state.registry.get_blob(&digest).await?;
                let body = axum::body::Body::from_stream(stream);
                let mut response = (StatusCode::OK, body).into_response();
                let headers = response.headers_mut();
                headers.insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/octet-stream"),
                );
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(size));
                headers.insert(
                    "Docker-Content-Digest",
                    HeaderValue::from_str(&digest).unwrap(),
                );
                Ok(response)
            }
        }
        RegistryRequest::Upload { name, session_id } => {
            authorize(&state, &principal, &name, Action::Push)?;
            debug!(%session_id, "get upload status");
            let session = state.registry.get_upload_session(&session_id).await?;
            let location = format!("/v2/{name}/blobs/uploads/{session_id}");
            let range = format!("0-{}", session.bytes_written.saturating_sub(1));
            let mut response = StatusCode::NO_CONTENT.into_response();
            let headers = response.headers_mut();
            headers.insert(header::LOCATION, HeaderValue::from_str(&location).unwrap());
            headers.insert(
                "Docker-Upload-UUID",
                HeaderValue::from_str(&session_id).unwrap(),
            );
            headers.insert(header::RANGE, HeaderValue::from_str(&range).unwrap());
            Ok(response)
        }
        RegistryRequest::StartUpload { .. } => Err(ApiError::Unsupported(
            "GET/HEAD not supported on upload sessions".to_string(),
        )),
    }
}

async fn handle_put_request(
    State(state): State<AppState>,
    Path(path): Path<String>,
    Query(query): Query<UploadCompleteQuery>,
    principal: Option<Extension<AuthPrincipal>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let principal = principal.map(|Extension(p)| p);
    let req = parse_registry_path(&path).ok_or_else(|| ApiError::NotFound(path.clone()))?;

    match req {
        RegistryRequest::Manifest { name, reference } => {
            authorize(&state, &principal, &name, Action::Push)?;
            debug!(%name, %reference, "put manifest");
            let content_type = headers
                .get(header::CONTENT_TYPE)
                .and_then(|h| h.to_str().ok())
                .unwrap_or("application/vnd.oci.image.manifest.v1+json");
            let digest = state
                .registry
                .put_manifest(&name, &reference, content_type, body)
                .await?;
            let location = format!("/v2/{name}/manifests/{digest}");
            let mut response = StatusCode::CREATED.into_response();
            let resp_headers = response.headers_mut();
            resp_headers.insert(header::LOCATION, HeaderValue::from_str(&location).unwrap());
            resp_headers.insert(
                "Docker-Content-Digest",
                HeaderValue::from_str(&digest).unwrap(),
            );
            Ok(response)
        }
        RegistryRequest::Upload { name, session_id } => {
            authorize(&state, &principal, &name, Action::Push)?;
            let digest = query
                .digest
                .ok_or_else(|| ApiError::BadRequest("missing digest parameter".to_string()))?;
            debug!(%session_id, %digest, "finalize upload");
            if !body.is_empty() {
                state.registry.append_upload(&session_id, body).await?;
            }
            let (digest, _size) = state.registry.complete_upload(&session_id, &digest).await?;
            let location = format!("/v2/{name}/blobs/{digest}");
            let mut response = StatusCode::CREATED.into_response();
            let headers = response.headers_mut();
            headers.insert(header::LOCATION, HeaderValue::from_str(&location).unwrap());
            headers.insert(
                "Docker-Content-Digest",
                HeaderValue::from_str(&digest).unwrap(),
            );
            Ok(response)
        }
        _ => Err(ApiError::Unsupported("PUT not supported on this path".to_string())),
    }
}

async fn handle_post_request(
    State(state): State<AppState>,
    Path(path): Path<String>,
    principal: Option<Extension<AuthPrincipal>>,
) -> Result<Response, ApiError> {
    let principal = principal.map(|Extension(p)| p);
    let req = parse_registry_path(&path).ok_or_else(|| ApiError::NotFound(path.clone()))?;

    match req {
        RegistryRequest::StartUpload { name } => {
            authorize(&state, &principal, &name, Action::Push)?;
            debug!(%name, "start upload");
            let session_id = state.registry.start_upload(&name).await?;
            let location = format!("/v2/{name}/blobs/uploads/{session_id}");
            let mut response = StatusCode::ACCEPTED.into_response();
            let headers = response.headers_mut();
            headers.insert(header::LOCATION, HeaderValue::from_str(&location).unwrap());
            headers.insert(
                "Docker-Upload-UUID",
                HeaderValue::from_str(&session_id).unwrap(),
            );
            headers.insert(header::RANGE, HeaderValue::from_static("0-0"));
            Ok(response)
        }
        _ => Err(ApiError::Unsupported("POST not supported on this path".to_string())),
    }
}

async fn handle_patch_request(
    State(state): State<AppState>,
    Path(path): Path<String>,
    principal: Option<Extension<AuthPrincipal>>,
    request: Request,
) -> Result<Response, ApiError> {
    let principal = principal.map(|Extension(p)| p);
    let req = parse_registry_path(&path).ok_or_else(|| ApiError::NotFound(path.clone()))?;

    match req {
        RegistryRequest::Upload { name, session_id } => {
            authorize(&state, &principal, &name, Action::Push)?;
            debug!(%session_id, "append upload chunk");

            let mut writer = state.registry.get_upload_writer(&session_id).await?;
            let mut reader = StreamReader::new(
                request
                    .into_body()
                    .into_data_stream()
                    .map_err(std::io::Error::other),
            );
            tokio::io::copy(&mut reader, &mut writer)
                .await
                .map_err(StorageError::Io)?;
            writer.flush().await.map_err(StorageError::Io)?;
            drop(writer);

            let session = state.registry.get_upload_session(&session_id).await?;
            let new_size = session.bytes_written;
            let location = format!("/v2/{name}/blobs/uploads/{session_id}");
            let range = format!("0-{}", new_size.saturating_sub(1));
            let mut response = StatusCode::ACCEPTED.into_response();
            let headers = response.headers_mut();
            headers.insert(header::LOCATION, HeaderValue::from_str(&location).unwrap());
            headers.insert(
                "Docker-Upload-UUID",
                HeaderValue::from_str(&session_id).unwrap(),
            );
            headers.insert(header::RANGE, HeaderValue::from_str(&range).unwrap());
            Ok(response)
        }
        _ => Err(ApiError::Unsupported("PATCH not supported on this path".to_string())),
    }
}

async fn handle_delete_request(
    State(state): State<AppState>,
    Path(path): Path<String>,
    principal: Option<Extension<AuthPrincipal>>,
) -> Result<Response, ApiError> {
    let principal = principal.map(|Extension(p)| p);
    let req = parse_registry_path(&path).ok_or_else(|| ApiError::NotFound(path.clone()))?;

    match req {
        RegistryRequest::Manifest { name, reference } => {
            authorize(&state, &principal, &name, Action::Push)?;
            debug!(%name, %reference, "delete manifest");
            state.registry.delete_manifest(&name, &reference).await?;
            Ok(StatusCode::ACCEPTED.into_response())
        }
        RegistryRequest::Upload { name, session_id } => {
            authorize(&state, &principal, &name, Action::Push)?;
            debug!(%session_id, "cancel upload");
            state.registry.cancel_upload(&session_id).await?;
            Ok(StatusCode::NO_CONTENT.into_response())
        }
        _ => Err(ApiError::Unsupported("DELETE not supported on this path".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_manifest_path() {
        match parse_registry_path("library/alpine/manifests/latest").unwrap() {
            RegistryRequest::Manifest { name, reference } => {
                assert_eq!(name, "library/alpine");
                assert_eq!(reference, "latest");
            }
            _ => panic!("expected manifest"),
        }
    }

    #[test]
    fn parses_tags_list_path() {
        match parse_registry_path("app/tags/list").unwrap() {
            RegistryRequest::TagsList { name } => assert_eq!(name, "app"),
            _ => panic!("expected tags list"),
        }
    }

    #[test]
    fn parses_catalog_path() {
        assert!(matches!(
            parse_registry_path("_catalog"),
            Some(RegistryRequest::Catalog)
        ));
    }

    #[test]
    fn parses_upload_start_and_continuation() {
        match parse_registry_path("app/blobs/uploads/").unwrap() {
            RegistryRequest::StartUpload { name } => assert_eq!(name, "app"),
            _ => panic!("expected start upload"),
        }
        match parse_registry_path("app/blobs/uploads/abc123").unwrap() {
            RegistryRequest::Upload { name, session_id } => {
                assert_eq!(name, "app");
                assert_eq!(session_id, "abc123");
            }
            _ => panic!("expected upload"),
        }
    }

    #[test]
    fn parses_blob_path() {
        match parse_registry_path("app/blobs/sha256:abc").unwrap() {
            RegistryRequest::Blob { name, digest } => {
                assert_eq!(name, "app");
                assert_eq!(digest, "sha256:abc");
            }
            _ => panic!("expected blob"),
        }
    }
}

//! The HTTP surface of §6: kernelspecs, kernels, sessions. Each handler is a
//! thin adapter from an axum request onto the MKM/SessionRegistry operations
//! defined in `mkm.rs`/`session.rs`; routing, JSON envelopes and status codes
//! live here, nowhere else.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::mkm::KernelModel;
use crate::runtime::Runtime;
use crate::session::{SessionModel, SessionPatch, SessionType};

pub fn router() -> Router<Arc<Runtime>> {
    Router::new()
        .route("/api/kernelspecs", get(list_kernelspecs))
        .route("/api/kernelspecs/:name", get(get_kernelspec))
        .route("/api/kernels", get(list_kernels).post(start_kernel))
        .route(
            "/api/kernels/:id",
            get(get_kernel).delete(delete_kernel),
        )
        .route("/api/kernels/:id/restart", post(restart_kernel))
        .route("/api/kernels/:id/interrupt", post(interrupt_kernel))
        .route("/api/sessions", get(list_sessions).post(create_session))
        .route(
            "/api/sessions/:id",
            get(get_session).delete(delete_session).patch(patch_session),
        )
}

// ---- kernelspecs (§6 Kernel spec files) ----------------------------------

#[derive(Serialize)]
struct KernelspecModel {
    name: String,
    spec: KernelspecBody,
    resources: HashMap<String, String>,
}

#[derive(Serialize)]
struct KernelspecBody {
    display_name: String,
    language: String,
    argv: Vec<String>,
    interrupt_mode: zasper_protocol::InterruptMode,
    env: serde_json::Value,
    metadata: serde_json::Value,
}

fn kernelspec_model(dir: &zasper_runtime::kernelspec::KernelspecDir) -> KernelspecModel {
    let resources = dir
        .resources
        .iter()
        .map(|file| (file.clone(), format!("/kernelspecs/{}/{}", dir.kernel_name, file)))
        .collect();
    KernelspecModel {
        name: dir.kernel_name.clone(),
        spec: KernelspecBody {
            display_name: dir.kernelspec.display_name.clone(),
            language: dir.kernelspec.language.clone(),
            argv: dir.kernelspec.argv.clone(),
            interrupt_mode: dir.kernelspec.interrupt_mode.clone(),
            env: serde_json::to_value(&dir.kernelspec.env).unwrap_or(serde_json::Value::Null),
            metadata: serde_json::to_value(&dir.kernelspec.metadata).unwrap_or(serde_json::Value::Null),
        },
        resources,
    }
}

#[derive(Serialize)]
struct KernelspecsResponse {
    default: String,
    kernelspecs: HashMap<String, KernelspecModel>,
}

async fn list_kernelspecs(State(runtime): State<Arc<Runtime>>) -> Result<Json<KernelspecsResponse>> {
    let specs = zasper_runtime::kernelspec::list_kernelspecs()?;
    let kernelspecs = specs.iter().map(|d| (d.kernel_name.clone(), kernelspec_model(d))).collect();
    Ok(Json(KernelspecsResponse {
        default: runtime.settings.default_kernel_name.clone(),
        kernelspecs,
    }))
}

async fn get_kernelspec(Path(name): Path<String>) -> Result<Json<KernelspecModel>> {
    let dir = zasper_runtime::kernelspec::find_kernelspec(&name)?;
    Ok(Json(kernelspec_model(&dir)))
}

// ---- kernels (§6, §4.4) ---------------------------------------------------

#[derive(Deserialize, Default)]
struct KernelStartRequest {
    name: Option<String>,
    kernel_id: Option<String>,
}

async fn list_kernels(State(runtime): State<Arc<Runtime>>) -> Json<Vec<KernelModel>> {
    Json(runtime.mkm.list_models().await)
}

/// §8 Boundary behavior: an empty body uses `default_kernel_name` instead of
/// 400ing on invalid JSON.
async fn start_kernel(
    State(runtime): State<Arc<Runtime>>,
    body: axum::body::Bytes,
) -> Result<Response> {
    let request: KernelStartRequest = if body.is_empty() {
        KernelStartRequest::default()
    } else {
        serde_json::from_slice(&body).map_err(|e| AppError::BadRequest(e.to_string()))?
    };

    let id = runtime
        .mkm
        .start(request.name, request.kernel_id, HashMap::new(), None)
        .await?;
    let model = runtime.mkm.get_model(&id).await?;

    let mut headers = HeaderMap::new();
    headers.insert(
        axum::http::header::LOCATION,
        HeaderValue::from_str(&format!("/api/kernels/{id}")).unwrap(),
    );
    Ok((StatusCode::CREATED, headers, Json(model)).into_response())
}

async fn get_kernel(State(runtime): State<Arc<Runtime>>, Path(id): Path<String>) -> Result<Json<KernelModel>> {
    Ok(Json(runtime.mkm.get_model(&id).await?))
}

async fn delete_kernel(State(runtime): State<Arc<Runtime>>, Path(id): Path<String>) -> Result<StatusCode> {
    runtime.mkm.shutdown(&id, false, false).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn restart_kernel(
    State(runtime): State<Arc<Runtime>>,
    Path(id): Path<String>,
) -> Result<Json<KernelModel>> {
    runtime.mkm.restart(&id, false).await?;
    Ok(Json(runtime.mkm.get_model(&id).await?))
}

async fn interrupt_kernel(State(runtime): State<Arc<Runtime>>, Path(id): Path<String>) -> Result<StatusCode> {
    runtime.mkm.interrupt(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ---- sessions (§6, §4.6) ---------------------------------------------------

#[derive(Deserialize)]
struct SessionKernelRef {
    id: Option<String>,
    name: Option<String>,
}

#[derive(Deserialize)]
struct SessionCreateRequest {
    path: String,
    #[serde(default)]
    name: String,
    #[serde(rename = "type", default = "default_session_type")]
    session_type: SessionType,
    #[serde(default)]
    kernel: Option<SessionKernelRef>,
}

fn default_session_type() -> SessionType {
    SessionType::Notebook
}

async fn list_sessions(State(runtime): State<Arc<Runtime>>) -> Result<Json<Vec<SessionModel>>> {
    Ok(Json(runtime.sessions.list().await?))
}

async fn create_session(
    State(runtime): State<Arc<Runtime>>,
    Json(request): Json<SessionCreateRequest>,
) -> Result<Response> {
    let (kernel_name, kernel_id) = match request.kernel {
        Some(k) => (k.name, k.id),
        None => (None, None),
    };
    let model = runtime
        .sessions
        .create(request.path, request.name, request.session_type, kernel_name, kernel_id)
        .await?;

    let mut headers = HeaderMap::new();
    headers.insert(
        axum::http::header::LOCATION,
        HeaderValue::from_str(&format!("/api/sessions/{}", model.session_id)).unwrap(),
    );
    Ok((StatusCode::CREATED, headers, Json(model)).into_response())
}

async fn get_session(State(runtime): State<Arc<Runtime>>, Path(id): Path<String>) -> Result<Json<SessionModel>> {
    Ok(Json(runtime.sessions.get(&id).await?))
}

async fn delete_session(State(runtime): State<Arc<Runtime>>, Path(id): Path<String>) -> Result<StatusCode> {
    runtime.sessions.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn patch_session(
    State(runtime): State<Arc<Runtime>>,
    Path(id): Path<String>,
    Json(patch): Json<SessionPatch>,
) -> Result<Json<SessionModel>> {
    Ok(Json(runtime.sessions.update(&id, patch).await?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn kernelspec_model_maps_resource_urls() {
        let dir = zasper_runtime::kernelspec::KernelspecDir {
            kernel_name: "python3".to_string(),
            path: PathBuf::from("/usr/share/jupyter/kernels/python3"),
            kernelspec: zasper_protocol::JupyterKernelspec {
                argv: vec!["python3".to_string(), "-m".to_string(), "ipykernel".to_string()],
                display_name: "Python 3".to_string(),
                language: "python".to_string(),
                metadata: None,
                interrupt_mode: zasper_protocol::InterruptMode::Signal,
                env: None,
            },
            resources: vec!["logo-64x64.png".to_string()],
        };
        let model = kernelspec_model(&dir);
        assert_eq!(model.name, "python3");
        assert_eq!(
            model.resources.get("logo-64x64.png").unwrap(),
            "/kernelspecs/python3/logo-64x64.png"
        );
        assert_eq!(model.spec.env, serde_json::Value::Null);
    }

    #[test]
    fn start_kernel_request_defaults_are_none() {
        let request = KernelStartRequest::default();
        assert!(request.name.is_none());
        assert!(request.kernel_id.is_none());
    }

    #[test]
    fn session_create_request_defaults_type_to_notebook() {
        let request: SessionCreateRequest = serde_json::from_str(r#"{"path": "notebook.ipynb"}"#).unwrap();
        assert_eq!(request.session_type, SessionType::Notebook);
        assert_eq!(request.name, "");
        assert!(request.kernel.is_none());
    }

    #[test]
    fn session_create_request_honors_explicit_kernel_ref() {
        let request: SessionCreateRequest = serde_json::from_str(
            r#"{"path": "notebook.ipynb", "type": "notebook", "kernel": {"name": "python3"}}"#,
        )
        .unwrap();
        let kernel = request.kernel.unwrap();
        assert_eq!(kernel.name.as_deref(), Some("python3"));
        assert!(kernel.id.is_none());
    }
}

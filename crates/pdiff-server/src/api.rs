use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{
        rejection::{BytesRejection, FormRejection},
        DefaultBodyLimit, Path, Query, State,
    },
    http::StatusCode,
    routing::{get, post},
    Form, Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::info;

use pdiff_shared::ImageUpload;
use pdiff_store::{DiffSummary, Site};

use crate::backend::Backend;
use crate::config::ServerConfig;
use crate::error::ServiceError;

#[derive(Clone)]
pub struct AppState {
    pub backend: Backend,
    pub config: Arc<ServerConfig>,
}

impl AppState {
    /// Hand an error to the backend's diagnostic sink and pass it on.
    fn report(&self, context: &str, err: ServiceError) -> ServiceError {
        self.backend.report_error(context, &err);
        err
    }
}

pub fn build_router(state: AppState) -> Router {
    let body_limit = state.config.upload_body_limit();

    Router::new()
        .route("/health", get(health_check))
        .route("/create-site", post(create_site))
        .route("/post-image", post(post_image))
        .route("/sites/:site/unreviewed", get(unreviewed))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

#[derive(Default, Deserialize)]
struct CreateSiteForm {
    #[serde(default)]
    site: String,
}

/// Registration response. Field names and base64 byte encoding are what
/// existing upload clients parse.
#[derive(Debug, Serialize, Deserialize)]
pub struct SiteResponse {
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Key", with = "pdiff_shared::encoding::base64_bytes")]
    pub key: Vec<u8>,
    #[serde(rename = "Secret", with = "pdiff_shared::encoding::base64_bytes")]
    pub secret: Vec<u8>,
}

impl From<Site> for SiteResponse {
    fn from(site: Site) -> Self {
        Self {
            name: site.name,
            key: site.key,
            secret: site.secret,
        }
    }
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `site` is read from a urlencoded body, falling back to the query string.
/// A body without a form content type is treated as carrying no fields.
async fn create_site(
    State(state): State<AppState>,
    query: Option<Query<CreateSiteForm>>,
    form: Result<Form<CreateSiteForm>, FormRejection>,
) -> Result<Json<SiteResponse>, ServiceError> {
    let from_body = match form {
        Ok(Form(form)) => form.site,
        Err(FormRejection::InvalidFormContentType(_)) => String::new(),
        Err(rejection) => {
            return Err(state.report(
                "create-site",
                ServiceError::BadRequest(rejection.body_text()),
            ))
        }
    };
    let from_query = query.map(|Query(q)| q.site).unwrap_or_default();

    let name = if from_body.trim().is_empty() {
        from_query.trim().to_string()
    } else {
        from_body.trim().to_string()
    };
    if name.is_empty() {
        return Err(state.report("create-site", ServiceError::BadRequest("no site".into())));
    }

    let site = state
        .backend
        .register_site(&name)
        .await
        .map_err(|e| state.report("create-site", e))?;

    info!(site = %site.name, "Site registered via API");
    Ok(Json(site.into()))
}

async fn post_image(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<StatusCode, ServiceError> {
    let body = body.map_err(|rejection| {
        let err = if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ServiceError::BodyTooLarge {
                max: state.config.upload_body_limit(),
            }
        } else {
            ServiceError::BadRequest(rejection.body_text())
        };
        state.report("post-image", err)
    })?;

    let upload = ImageUpload::from_json(&body).map_err(|e| state.report("post-image", e.into()))?;

    state
        .backend
        .ingest_upload(&upload)
        .await
        .map_err(|e| state.report("post-image", e))?;

    Ok(StatusCode::OK)
}

async fn unreviewed(
    State(state): State<AppState>,
    Path(site): Path<String>,
) -> Result<Json<Vec<DiffSummary>>, ServiceError> {
    let diffs = state
        .backend
        .get_unreviewed_images(&site)
        .await
        .map_err(|e| state.report("unreviewed", e))?;
    Ok(Json(diffs))
}

pub async fn serve(state: AppState, addr: std::net::SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);

    info!(addr = %addr, "Starting HTTP API server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

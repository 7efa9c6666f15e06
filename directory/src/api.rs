use crate::instance_cache::{EntityLookup, LookupError, NOT_FOUND};
use crate::types::{Entity, EntityType, InvalidEntityType};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;

#[derive(thiserror::Error, Debug)]
pub enum LookupApiError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

#[derive(thiserror::Error, Debug)]
enum HandlerError {
    #[error(transparent)]
    InvalidEntityType(#[from] InvalidEntityType),
    #[error(transparent)]
    Lookup(#[from] LookupError),
    #[error("no metrics instance named '{name}' in org {org_id}")]
    NoMetricsInstance { org_id: i64, name: String },
}

type SharedLookup = Arc<dyn EntityLookup>;

pub fn router(cache: SharedLookup) -> Router {
    Router::new()
        .route("/entities/{entity_type}/{id}", get(get_entity))
        .route("/metrics-instances", get(get_metrics_instance))
        .with_state(cache)
}

/// Serves the lookup API until `shutdown` resolves.
pub async fn serve<F>(
    host: &str,
    port: u16,
    cache: SharedLookup,
    shutdown: F,
) -> Result<(), LookupApiError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!("{host}:{port}");
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Lookup API listening on {addr}");

    axum::serve(listener, router(cache))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn get_entity(
    State(cache): State<SharedLookup>,
    Path((entity_type, id)): Path<(String, i64)>,
) -> Result<Json<Entity>, HandlerError> {
    let entity_type: EntityType = entity_type.parse()?;
    Ok(Json(cache.get_by_id(entity_type, id)?))
}

#[derive(Deserialize, Debug)]
struct MetricsInstanceParams {
    org_id: i64,
    name: String,
}

#[derive(Serialize)]
struct MetricsInstanceResponse {
    id: i64,
}

async fn get_metrics_instance(
    State(cache): State<SharedLookup>,
    Query(params): Query<MetricsInstanceParams>,
) -> Result<Json<MetricsInstanceResponse>, HandlerError> {
    match cache.get_metrics_id_by_org_and_name(params.org_id, &params.name) {
        NOT_FOUND => Err(HandlerError::NoMetricsInstance {
            org_id: params.org_id,
            name: params.name,
        }),
        id => Ok(Json(MetricsInstanceResponse { id })),
    }
}

#[derive(Serialize)]
struct ApiErrorResponse {
    error_message: String,
}

impl IntoResponse for HandlerError {
    fn into_response(self) -> Response {
        let status = match self {
            HandlerError::InvalidEntityType(_) => StatusCode::BAD_REQUEST,
            HandlerError::Lookup(_) | HandlerError::NoMetricsInstance { .. } => {
                StatusCode::NOT_FOUND
            }
        };

        let body = Json(ApiErrorResponse {
            error_message: self.to_string(),
        });

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance_cache::{CacheConfig, InstanceCache};
    use crate::mock::{FIXTURE_ORG_ID, FIXTURE_STACK_ID, MockDirectoryClient};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    async fn app() -> Router {
        let config = CacheConfig {
            complete_refresh_interval: Duration::from_secs(3600),
            incremental_refresh_interval: Duration::from_secs(3600),
            stack_cluster_filter: None,
            entity_types: vec![EntityType::Stack, EntityType::Metrics],
        };
        let cache = InstanceCache::new(config, Arc::new(MockDirectoryClient::with_fixtures()))
            .await
            .unwrap();
        router(Arc::new(cache))
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap_or_default())
    }

    #[tokio::test]
    async fn test_get_entity() {
        let (status, body) = get(app().await, &format!("/entities/grafana/{FIXTURE_STACK_ID}")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], FIXTURE_STACK_ID);
        assert_eq!(body["orgId"], FIXTURE_ORG_ID);
        assert_eq!(body["hmInstancePromId"], 11);
    }

    #[tokio::test]
    async fn test_get_entity_errors() {
        let (status, body) = get(app().await, "/entities/grafana/42").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(
            body["error_message"],
            "grafana instance with ID 42 does not exist"
        );

        let (status, body) = get(app().await, "/entities/logs/1111").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error_message"], "logs instance cache doesn't exist");

        let (status, _) = get(app().await, "/entities/unknown/1").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_get_metrics_instance() {
        let (status, body) = get(
            app().await,
            &format!("/metrics-instances?org_id={FIXTURE_ORG_ID}&name=prometheus-11"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["id"], 11);

        let (status, _) = get(
            app().await,
            &format!("/metrics-instances?org_id={FIXTURE_ORG_ID}&name=missing"),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}

//! Read-side dashboard API over stored partners.

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use pmon_core::{Country, Partner, PartnerStatus};
use pmon_storage::{MonitorStore, PartnerFilter};
use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

mod dashboard;

pub use dashboard::{
    partner_status_ranking, project_size_ranking, Ranked, SizeBuckets, StatusCounts, RANK_SIZE,
};

pub const CRATE_NAME: &str = "pmon-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn MonitorStore>,
}

impl AppState {
    pub fn new(store: Arc<dyn MonitorStore>) -> Self {
        Self { store }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct DashboardQuery {
    pub status_filter: Option<String>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/dashboard/partner_data", get(partner_data_handler))
        .route("/dashboard/project_size_data", get(project_size_data_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "dashboard api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

async fn partner_data_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DashboardQuery>,
) -> Response {
    match load_partners(&state, &query).await {
        Ok((partners, countries)) => Json(partner_status_ranking(&partners, &countries)).into_response(),
        Err(resp) => resp,
    }
}

async fn project_size_data_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DashboardQuery>,
) -> Response {
    match load_partners(&state, &query).await {
        Ok((partners, countries)) => Json(project_size_ranking(&partners, &countries)).into_response(),
        Err(resp) => resp,
    }
}

async fn load_partners(
    state: &AppState,
    query: &DashboardQuery,
) -> Result<(Vec<Partner>, Vec<Country>), Response> {
    let status = match query.status_filter.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => match raw.parse::<PartnerStatus>() {
            Ok(status) => Some(status),
            Err(err) => return Err(bad_request(err.to_string())),
        },
    };
    let filter = PartnerFilter {
        status,
        ..Default::default()
    };

    let partners = state
        .store
        .list_partners(&filter)
        .await
        .map_err(|err| server_error(anyhow::Error::new(err)))?;
    let countries = state
        .store
        .list_countries(None)
        .await
        .map_err(|err| server_error(anyhow::Error::new(err)))?;
    Ok((partners, countries))
}

fn bad_request(message: String) -> Response {
    (StatusCode::BAD_REQUEST, Json(json!({ "error": message }))).into_response()
}

fn server_error(err: anyhow::Error) -> Response {
    error!(error = %format!("{err:#}"), "dashboard query failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": format!("server error: {err}") })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use chrono::NaiveDate;
    use http_body_util::BodyExt;
    use pmon_core::{NewPartner, PartnerFields};
    use pmon_storage::MemoryStore;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;

    async fn seeded_store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        let belgium = store.create_country("Belgium").await.unwrap();
        let france = store.create_country("France").await.unwrap();

        let rows = [
            ("Acme", Some(belgium.id), PartnerStatus::Gold, 3.0),
            ("Bistro", Some(belgium.id), PartnerStatus::Silver, 8.0),
            ("Cedar", Some(belgium.id), PartnerStatus::Gold, 40.0),
            ("Delta", Some(france.id), PartnerStatus::Ready, 12.0),
            ("Echo", None, PartnerStatus::Ready, 25.0),
        ];
        for (name, country_id, status, avg) in rows {
            let partner = NewPartner {
                name: name.to_string(),
                fields: PartnerFields {
                    profile_url: None,
                    status,
                    country_id,
                    retention_rate: 90.0,
                    total_references: 1,
                    largest_project_size: 10,
                    average_project_size: avg,
                },
                first_seen_on: NaiveDate::from_ymd_opt(2026, 3, 1).unwrap(),
            };
            store.create_partner(partner, None).await.unwrap();
        }
        store
    }

    async fn get_json(uri: &str) -> (StatusCode, Value) {
        let app = app(AppState::new(seeded_store().await));
        let resp = app
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn partner_data_groups_by_country_and_status() {
        let (status, body) = get_json("/dashboard/partner_data").await;
        assert_eq!(status, StatusCode::OK);

        let top = body["top5"].as_array().unwrap();
        assert_eq!(top.len(), 3);
        assert_eq!(top[0][0], "Belgium");
        assert_eq!(top[0][1]["gold"], 2);
        assert_eq!(top[0][1]["silver"], 1);
        assert_eq!(top[1][0], "France");
        assert_eq!(top[2][0], "Unknown");
        assert_eq!(body["bottom5"], body["top5"]);
    }

    #[tokio::test]
    async fn status_filter_narrows_the_partner_set() {
        let (status, body) = get_json("/dashboard/partner_data?status_filter=gold").await;
        assert_eq!(status, StatusCode::OK);
        let top = body["top5"].as_array().unwrap();
        assert_eq!(top.len(), 1);
        assert_eq!(top[0][1]["gold"], 2);
        assert_eq!(top[0][1]["ready"], 0);
    }

    #[tokio::test]
    async fn project_size_data_buckets_average_size() {
        let (status, body) = get_json("/dashboard/project_size_data").await;
        assert_eq!(status, StatusCode::OK);
        let belgium = &body["top5"][0];
        assert_eq!(belgium[0], "Belgium");
        assert_eq!(belgium[1]["<5"], 1);
        assert_eq!(belgium[1]["5-10"], 1);
        assert_eq!(belgium[1]["25+"], 1);

        let unknown = body["top5"]
            .as_array()
            .unwrap()
            .iter()
            .find(|group| group[0] == "Unknown")
            .unwrap();
        assert_eq!(unknown[1]["11-25"], 1);
    }

    #[tokio::test]
    async fn unknown_status_filter_is_rejected() {
        let (status, body) = get_json("/dashboard/project_size_data?status_filter=platinum").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("platinum"));
    }
}

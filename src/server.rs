/// HTTP adapter over the bean sack
///
/// Query routes (`/beans`, `/beans/search`, `/beans/trending`, `/nuggets/trending`)
/// accept GET or POST with `window`, `topn` and repeatable `kind` query
/// parameters and an optional JSON body. Empty results answer 204. Ingest
/// routes (`PUT /beans`, `POST /rectify`) exist only when an internal auth token
/// is configured and require it in `X-API-Key`.

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put, MethodRouter};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::InstanceMode;
use crate::errors::SackError;
use crate::sack::models::{Bean, Kind};
use crate::sack::{BeanSack, IngestReport};
use crate::search::{SearchOptions, DEFAULT_TOPN};

pub const API_KEY_HEADER: &str = "x-api-key";

#[derive(Clone)]
pub struct AppState {
    pub sack: Arc<BeanSack>,
    pub auth_token: Option<String>,
}

impl AppState {
    pub fn new(sack: Arc<BeanSack>, auth_token: Option<String>) -> Self {
        AppState {
            sack,
            auth_token: auth_token.filter(|t| !t.is_empty()),
        }
    }
}

/// Routes for `mode`. Ingest routes need both an indexing mode and an auth token.
pub fn router(state: AppState, mode: InstanceMode) -> Router {
    let queries = mode.serves_queries();
    let ingest = mode.runs_indexer() && state.auth_token.is_some();

    let mut router = Router::new().route("/health", get(health));

    let beans: Option<MethodRouter<AppState>> = match (queries, ingest) {
        (true, true) => Some(get(get_beans).post(get_beans).put(put_beans)),
        (true, false) => Some(get(get_beans).post(get_beans)),
        (false, true) => Some(put(put_beans)),
        (false, false) => None,
    };
    if let Some(beans) = beans {
        router = router.route("/beans", beans);
    }
    if queries {
        router = router
            .route("/beans/search", get(search_beans).post(search_beans))
            .route("/beans/trending", get(trending_beans).post(trending_beans))
            .route("/nuggets/trending", get(trending_nuggets).post(trending_nuggets));
    }
    if ingest {
        router = router.route("/rectify", post(rectify));
    }
    router.with_state(state)
}

async fn health() -> StatusCode {
    StatusCode::OK
}

async fn get_beans(
    State(state): State<AppState>,
    Query(params): Query<Vec<(String, String)>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let (opts, _) = parse_request(params, &body)?;
    Ok(respond(state.sack.retrieve(&opts).await))
}

async fn search_beans(
    State(state): State<AppState>,
    Query(params): Query<Vec<(String, String)>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let (opts, nuggets) = parse_request(params, &body)?;
    let beans = if nuggets.is_empty() {
        state.sack.fuzzy_search(&opts).await
    } else {
        state.sack.nugget_search(&nuggets, &opts).await
    };
    Ok(respond(beans))
}

async fn trending_beans(
    State(state): State<AppState>,
    Query(params): Query<Vec<(String, String)>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let (opts, _) = parse_request(params, &body)?;
    Ok(respond(state.sack.trending_beans(&opts).await))
}

async fn trending_nuggets(
    State(state): State<AppState>,
    Query(params): Query<Vec<(String, String)>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let (opts, _) = parse_request(params, &body)?;
    Ok(respond(state.sack.trending_nuggets(&opts).await))
}

async fn put_beans(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(beans): Json<Vec<Bean>>,
) -> Result<Json<IngestReport>, ApiError> {
    authorize(&state, &headers)?;
    let report = state.sack.add_beans(beans).await?;
    Ok(Json(report))
}

async fn rectify(State(state): State<AppState>, headers: HeaderMap) -> Result<StatusCode, ApiError> {
    authorize(&state, &headers)?;
    let sack = Arc::clone(&state.sack);
    state.sack.spawn_background("rectify", async move {
        sack.rectify().await;
    });
    Ok(StatusCode::ACCEPTED)
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let presented = headers.get(API_KEY_HEADER).and_then(|v| v.to_str().ok());
    match (&state.auth_token, presented) {
        (Some(expected), Some(presented)) if expected == presented => Ok(()),
        _ => Err(json_error(StatusCode::UNAUTHORIZED, "unauthorized", "Missing or invalid API key.", None)),
    }
}

fn respond<T: Serialize>(items: Vec<T>) -> Response {
    if items.is_empty() {
        StatusCode::NO_CONTENT.into_response()
    } else {
        Json(items).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct QueryBody {
    nuggets: Vec<String>,
    categories: Vec<String>,
    embeddings: Vec<Vec<f32>>,
    context: Option<String>,
    urls: Vec<String>,
}

/// Search options plus the requested nugget names.
fn parse_request(params: Vec<(String, String)>, body: &[u8]) -> Result<(SearchOptions, Vec<String>), ApiError> {
    let mut window = None;
    let mut top_n = DEFAULT_TOPN as i64;
    let mut kinds = Vec::new();
    for (name, value) in params {
        match name.as_str() {
            "window" => window = Some(parse_int("window", &value)?),
            "topn" => top_n = parse_int("topn", &value)?,
            "kind" => kinds.push(parse_kind(&value)?),
            _ => {}
        }
    }

    let body: QueryBody = if body.iter().all(|b| b.is_ascii_whitespace()) {
        QueryBody::default()
    } else {
        serde_json::from_slice(body).map_err(|e| {
            json_error(StatusCode::BAD_REQUEST, "invalid_body", format!("Invalid JSON body: {e}"), None)
        })?
    };

    let mut opts = SearchOptions::new()
        .with_top_n(top_n)
        .with_kinds(&kinds)
        .with_urls(&body.urls)
        .with_search_texts(body.categories)
        .with_search_embeddings(body.embeddings)
        .with_context(body.context);
    if let Some(days) = window {
        opts = opts.with_time_window(days);
    }
    Ok((opts, body.nuggets))
}

fn parse_int(field: &str, value: &str) -> Result<i64, ApiError> {
    value
        .trim()
        .parse()
        .map_err(|_| SackError::validation(field, &format!("{field} must be an integer")).into())
}

fn parse_kind(value: &str) -> Result<Kind, ApiError> {
    match serde_json::from_value::<Kind>(serde_json::Value::from(value.to_lowercase())) {
        Ok(kind) if kind != Kind::Invalid => Ok(kind),
        _ => Err(SackError::validation("kind", &format!("unknown kind '{value}'")).into()),
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error_code: String,
    message: String,
    fields: Option<Vec<String>>,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    error_code: String,
    message: String,
    fields: Option<Vec<String>>,
}

fn json_error(status: StatusCode, code: &str, message: impl Into<String>, fields: Option<Vec<String>>) -> ApiError {
    ApiError {
        status,
        error_code: code.to_string(),
        message: message.into(),
        fields,
    }
}

impl From<SackError> for ApiError {
    fn from(err: SackError) -> Self {
        match err {
            SackError::Validation { message, field } => {
                json_error(StatusCode::BAD_REQUEST, "invalid_request", message, field.map(|f| vec![f]))
            }
            other => {
                tracing::error!(error = %other, "Request failed");
                json_error(StatusCode::INTERNAL_SERVER_ERROR, "internal_error", other.to_string(), None)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error_code: self.error_code,
            message: self.message,
            fields: self.fields,
        };
        (self.status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sack::testing::{bean, create_test_sack, long_text};
    use axum::body::{self, Body};
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::util::ServiceExt;

    const TOKEN: &str = "secret";

    async fn seeded_app(mode: InstanceMode) -> Router {
        let sack = create_test_sack();
        sack.add_beans(vec![
            bean("https://a.com/ai", &long_text("ai chips")),
            bean("https://b.com/rates", &long_text("rates")),
        ])
        .await
        .unwrap();
        sack.flush().await;
        router(AppState::new(sack, Some(TOKEN.to_string())), mode)
    }

    fn request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder().method(method).uri(uri);
        match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn json_body(response: Response) -> Value {
        let bytes = body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let app = router(AppState::new(create_test_sack(), None), InstanceMode::Cdn);
        let response = app.oneshot(request("GET", "/health", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_empty_result_is_no_content() {
        let app = router(AppState::new(create_test_sack(), None), InstanceMode::Cdn);
        let response = app.oneshot(request("GET", "/beans", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_get_beans_with_topn() {
        let app = seeded_app(InstanceMode::Cdn).await;
        let response = app.oneshot(request("GET", "/beans?topn=1&window=1", None)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let beans = json_body(response).await;
        assert_eq!(beans.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_query_is_bad_request() {
        let app = seeded_app(InstanceMode::Cdn).await;

        let response = app.clone().oneshot(request("GET", "/beans?topn=ten", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let error = json_body(response).await;
        assert_eq!(error["fields"], json!(["topn"]));

        let response = app.oneshot(request("GET", "/beans?kind=podcast", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_search_by_category_body() {
        let app = seeded_app(InstanceMode::Cdn).await;
        let response = app
            .oneshot(request("POST", "/beans/search?kind=article", Some(json!({"categories": ["rates"]}))))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let beans = json_body(response).await;
        assert_eq!(beans[0]["url"], "https://b.com/rates");
    }

    #[tokio::test]
    async fn test_ingest_requires_api_key() {
        let app = router(AppState::new(create_test_sack(), Some(TOKEN.to_string())), InstanceMode::Dual);
        let payload = json!([{"url": "https://n.com/1", "kind": "article", "source": "n", "text": long_text("space")}]);

        let response = app.clone().oneshot(request("PUT", "/beans", Some(payload.clone()))).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let mut authed = request("PUT", "/beans", Some(payload));
        authed.headers_mut().insert(API_KEY_HEADER, TOKEN.parse().unwrap());
        let response = app.clone().oneshot(authed).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let report = json_body(response).await;
        assert_eq!(report["inserted"], 1);

        let mut rectify = request("POST", "/rectify", None);
        rectify.headers_mut().insert(API_KEY_HEADER, TOKEN.parse().unwrap());
        let response = app.oneshot(rectify).await.unwrap();
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn test_cdn_mode_has_no_ingest_routes() {
        let app = seeded_app(InstanceMode::Cdn).await;

        let response = app.clone().oneshot(request("PUT", "/beans", Some(json!([])))).await.unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);

        let response = app.oneshot(request("POST", "/rectify", None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

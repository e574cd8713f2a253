use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;

use super::domain::{Actor, PublicationDraft, PublicationId, RequestId, Role, UserId};
use super::moderation::ReviewDecision;
use super::payment::PaymentProcessor;
use super::service::{MarketplaceService, WorkflowError};
use super::store::{MarketplaceStore, OfferSearch, StoreError};

/// Header carrying the authenticated user id, set by the gateway.
pub const USER_ID_HEADER: &str = "x-user-id";
/// Header carrying the authenticated user's role, set by the gateway.
pub const USER_ROLE_HEADER: &str = "x-user-role";

type SharedService<S, P> = Arc<MarketplaceService<S, P>>;

/// Router builder exposing the publication/request workflow over HTTP.
pub fn marketplace_router<S, P>(service: SharedService<S, P>) -> Router
where
    S: MarketplaceStore + 'static,
    P: PaymentProcessor + 'static,
{
    Router::new()
        .route("/api/v1/publications", post(create_publication_handler::<S, P>))
        .route(
            "/api/v1/publications/pending",
            get(pending_publications_handler::<S, P>),
        )
        .route(
            "/api/v1/publications/available",
            get(available_offers_handler::<S, P>),
        )
        .route(
            "/api/v1/publications/:publication_id",
            get(publication_handler::<S, P>),
        )
        .route(
            "/api/v1/publications/:publication_id/review",
            put(review_handler::<S, P>),
        )
        .route(
            "/api/v1/publications/:publication_id/interest",
            post(interest_handler::<S, P>),
        )
        .route(
            "/api/v1/publications/:publication_id/favorite",
            post(favorite_handler::<S, P>),
        )
        .route(
            "/api/v1/publications/:publication_id/offer",
            put(start_negotiation_handler::<S, P>),
        )
        .route(
            "/api/v1/publications/:publication_id/requests",
            get(publication_requests_handler::<S, P>),
        )
        .route(
            "/api/v1/publications/:publication_id/payment",
            post(initiate_payment_handler::<S, P>),
        )
        .route(
            "/api/v1/publications/:publication_id/payment/confirm",
            post(confirm_payment_handler::<S, P>),
        )
        .route(
            "/api/v1/publications/:publication_id/payout",
            post(release_payout_handler::<S, P>),
        )
        .route("/api/v1/requests/mine", get(my_requests_handler::<S, P>))
        .route(
            "/api/v1/requests/:request_id",
            delete(delete_request_handler::<S, P>),
        )
        .route(
            "/api/v1/requests/:request_id/reject",
            put(reject_request_handler::<S, P>),
        )
        .route(
            "/api/v1/requests/:request_id/accept/:publication_id",
            put(accept_request_handler::<S, P>),
        )
        .with_state(service)
}

#[derive(Debug, Deserialize)]
pub(crate) struct ReviewBody {
    pub decision: ReviewDecision,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PaymentBody {
    pub payment_method: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ConfirmBody {
    pub payment_reference: String,
}

/// Reads the caller identity forwarded by the authentication gateway.
pub fn actor_from_headers(headers: &HeaderMap) -> Option<Actor> {
    let user_id = headers
        .get(USER_ID_HEADER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()?;
    let role = Role::parse(headers.get(USER_ROLE_HEADER)?.to_str().ok()?)?;
    Some(Actor::new(UserId(user_id), role))
}

fn unauthorized() -> Response {
    let payload = json!({
        "error": "missing or malformed caller identity",
        "kind": "unauthorized",
    });
    (StatusCode::UNAUTHORIZED, Json(payload)).into_response()
}

/// Runs a service call on the blocking pool; row locks may park the thread.
async fn run_blocking<S, P, T, F>(service: SharedService<S, P>, call: F) -> Result<T, WorkflowError>
where
    S: MarketplaceStore + 'static,
    P: PaymentProcessor + 'static,
    T: Send + 'static,
    F: FnOnce(&MarketplaceService<S, P>) -> Result<T, WorkflowError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || call(&service))
        .await
        .map_err(|err| WorkflowError::Internal(StoreError::Unavailable(err.to_string())))?
}

fn respond<T: serde::Serialize>(status: StatusCode, result: Result<T, WorkflowError>) -> Response {
    match result {
        Ok(body) => (status, Json(body)).into_response(),
        Err(err) => err.into_response(),
    }
}

impl IntoResponse for WorkflowError {
    fn into_response(self) -> Response {
        let status = match self {
            WorkflowError::NotFound(_) => StatusCode::NOT_FOUND,
            WorkflowError::InvalidState(_) | WorkflowError::Conflict(_) => StatusCode::CONFLICT,
            WorkflowError::UpstreamFailure(_) => StatusCode::BAD_GATEWAY,
            WorkflowError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let payload = json!({
            "error": self.to_string(),
            "kind": self.kind().label(),
        });
        (status, Json(payload)).into_response()
    }
}

pub(crate) async fn create_publication_handler<S, P>(
    State(service): State<SharedService<S, P>>,
    headers: HeaderMap,
    Json(draft): Json<PublicationDraft>,
) -> Response
where
    S: MarketplaceStore + 'static,
    P: PaymentProcessor + 'static,
{
    let Some(actor) = actor_from_headers(&headers) else {
        return unauthorized();
    };
    let result = run_blocking(service, move |service| {
        service.create_publication(&actor, draft)
    })
    .await;
    respond(StatusCode::CREATED, result)
}

pub(crate) async fn publication_handler<S, P>(
    State(service): State<SharedService<S, P>>,
    headers: HeaderMap,
    Path(publication_id): Path<u64>,
) -> Response
where
    S: MarketplaceStore + 'static,
    P: PaymentProcessor + 'static,
{
    let Some(actor) = actor_from_headers(&headers) else {
        return unauthorized();
    };
    let result = run_blocking(service, move |service| {
        service.publication(&actor, PublicationId(publication_id))
    })
    .await;
    respond(StatusCode::OK, result)
}

pub(crate) async fn pending_publications_handler<S, P>(
    State(service): State<SharedService<S, P>>,
    headers: HeaderMap,
) -> Response
where
    S: MarketplaceStore + 'static,
    P: PaymentProcessor + 'static,
{
    let Some(actor) = actor_from_headers(&headers) else {
        return unauthorized();
    };
    let result = run_blocking(service, move |service| service.pending_publications(&actor)).await;
    respond(StatusCode::OK, result)
}

pub(crate) async fn available_offers_handler<S, P>(
    State(service): State<SharedService<S, P>>,
    headers: HeaderMap,
    Query(search): Query<OfferSearch>,
) -> Response
where
    S: MarketplaceStore + 'static,
    P: PaymentProcessor + 'static,
{
    let Some(actor) = actor_from_headers(&headers) else {
        return unauthorized();
    };
    let result = run_blocking(service, move |service| {
        service.available_offers(&actor, &search)
    })
    .await;
    respond(StatusCode::OK, result)
}

pub(crate) async fn review_handler<S, P>(
    State(service): State<SharedService<S, P>>,
    headers: HeaderMap,
    Path(publication_id): Path<u64>,
    Json(body): Json<ReviewBody>,
) -> Response
where
    S: MarketplaceStore + 'static,
    P: PaymentProcessor + 'static,
{
    let Some(actor) = actor_from_headers(&headers) else {
        return unauthorized();
    };
    let result = run_blocking(service, move |service| {
        service.review_publication(&actor, PublicationId(publication_id), body.decision)
    })
    .await;
    respond(StatusCode::OK, result)
}

pub(crate) async fn interest_handler<S, P>(
    State(service): State<SharedService<S, P>>,
    headers: HeaderMap,
    Path(publication_id): Path<u64>,
) -> Response
where
    S: MarketplaceStore + 'static,
    P: PaymentProcessor + 'static,
{
    let Some(actor) = actor_from_headers(&headers) else {
        return unauthorized();
    };
    let result = run_blocking(service, move |service| {
        service.express_interest(&actor, PublicationId(publication_id))
    })
    .await;
    respond(StatusCode::CREATED, result)
}

pub(crate) async fn favorite_handler<S, P>(
    State(service): State<SharedService<S, P>>,
    headers: HeaderMap,
    Path(publication_id): Path<u64>,
) -> Response
where
    S: MarketplaceStore + 'static,
    P: PaymentProcessor + 'static,
{
    let Some(actor) = actor_from_headers(&headers) else {
        return unauthorized();
    };
    let result = run_blocking(service, move |service| {
        service.mark_favorite(&actor, PublicationId(publication_id))
    })
    .await;
    respond(StatusCode::CREATED, result)
}

pub(crate) async fn start_negotiation_handler<S, P>(
    State(service): State<SharedService<S, P>>,
    headers: HeaderMap,
    Path(publication_id): Path<u64>,
) -> Response
where
    S: MarketplaceStore + 'static,
    P: PaymentProcessor + 'static,
{
    let Some(actor) = actor_from_headers(&headers) else {
        return unauthorized();
    };
    let result = run_blocking(service, move |service| {
        service.start_negotiation(&actor, PublicationId(publication_id))
    })
    .await;
    respond(StatusCode::OK, result)
}

pub(crate) async fn publication_requests_handler<S, P>(
    State(service): State<SharedService<S, P>>,
    headers: HeaderMap,
    Path(publication_id): Path<u64>,
) -> Response
where
    S: MarketplaceStore + 'static,
    P: PaymentProcessor + 'static,
{
    let Some(actor) = actor_from_headers(&headers) else {
        return unauthorized();
    };
    let result = run_blocking(service, move |service| {
        service.requests_for_publication(&actor, PublicationId(publication_id))
    })
    .await;
    respond(StatusCode::OK, result)
}

pub(crate) async fn my_requests_handler<S, P>(
    State(service): State<SharedService<S, P>>,
    headers: HeaderMap,
) -> Response
where
    S: MarketplaceStore + 'static,
    P: PaymentProcessor + 'static,
{
    let Some(actor) = actor_from_headers(&headers) else {
        return unauthorized();
    };
    let result = run_blocking(service, move |service| service.my_requests(&actor)).await;
    respond(StatusCode::OK, result)
}

pub(crate) async fn delete_request_handler<S, P>(
    State(service): State<SharedService<S, P>>,
    headers: HeaderMap,
    Path(request_id): Path<u64>,
) -> Response
where
    S: MarketplaceStore + 'static,
    P: PaymentProcessor + 'static,
{
    let Some(actor) = actor_from_headers(&headers) else {
        return unauthorized();
    };
    let result = run_blocking(service, move |service| {
        service.delete_request(&actor, RequestId(request_id))
    })
    .await;
    match result {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => err.into_response(),
    }
}

pub(crate) async fn reject_request_handler<S, P>(
    State(service): State<SharedService<S, P>>,
    headers: HeaderMap,
    Path(request_id): Path<u64>,
) -> Response
where
    S: MarketplaceStore + 'static,
    P: PaymentProcessor + 'static,
{
    let Some(actor) = actor_from_headers(&headers) else {
        return unauthorized();
    };
    let result = run_blocking(service, move |service| {
        service.reject_request(&actor, RequestId(request_id))
    })
    .await;
    respond(StatusCode::OK, result)
}

pub(crate) async fn accept_request_handler<S, P>(
    State(service): State<SharedService<S, P>>,
    headers: HeaderMap,
    Path((request_id, publication_id)): Path<(u64, u64)>,
) -> Response
where
    S: MarketplaceStore + 'static,
    P: PaymentProcessor + 'static,
{
    let Some(actor) = actor_from_headers(&headers) else {
        return unauthorized();
    };
    let result = run_blocking(service, move |service| {
        service.accept_request(
            &actor,
            RequestId(request_id),
            PublicationId(publication_id),
        )
    })
    .await;
    respond(StatusCode::OK, result)
}

/// A processor status other than `succeeded` is still a 200: the body carries
/// the status so the client can drive the interactive step.
pub(crate) async fn initiate_payment_handler<S, P>(
    State(service): State<SharedService<S, P>>,
    headers: HeaderMap,
    Path(publication_id): Path<u64>,
    Json(body): Json<PaymentBody>,
) -> Response
where
    S: MarketplaceStore + 'static,
    P: PaymentProcessor + 'static,
{
    let Some(actor) = actor_from_headers(&headers) else {
        return unauthorized();
    };
    let result = run_blocking(service, move |service| {
        service.initiate_payment(&actor, PublicationId(publication_id), &body.payment_method)
    })
    .await;
    respond(StatusCode::OK, result)
}

pub(crate) async fn confirm_payment_handler<S, P>(
    State(service): State<SharedService<S, P>>,
    headers: HeaderMap,
    Path(publication_id): Path<u64>,
    Json(body): Json<ConfirmBody>,
) -> Response
where
    S: MarketplaceStore + 'static,
    P: PaymentProcessor + 'static,
{
    let Some(actor) = actor_from_headers(&headers) else {
        return unauthorized();
    };
    let result = run_blocking(service, move |service| {
        service.confirm_payment(
            &actor,
            PublicationId(publication_id),
            &body.payment_reference,
        )
    })
    .await;
    respond(StatusCode::OK, result)
}

pub(crate) async fn release_payout_handler<S, P>(
    State(service): State<SharedService<S, P>>,
    headers: HeaderMap,
    Path(publication_id): Path<u64>,
) -> Response
where
    S: MarketplaceStore + 'static,
    P: PaymentProcessor + 'static,
{
    let Some(actor) = actor_from_headers(&headers) else {
        return unauthorized();
    };
    let result = run_blocking(service, move |service| {
        service.release_payout(&actor, PublicationId(publication_id))
    })
    .await;
    respond(StatusCode::OK, result)
}

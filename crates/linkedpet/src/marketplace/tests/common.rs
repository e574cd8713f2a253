use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier, Mutex};

use axum::body::Body;
use axum::http::{Method, Request as HttpRequest};
use axum::response::Response;
use serde_json::Value;

use crate::config::{PaymentConfig, StoreConfig};
use crate::marketplace::domain::{
    Account, Actor, AnimalDetails, ListingKind, PublicationDraft, PublicationId, RequestId, Role,
    UserId,
};
use crate::marketplace::memory::{MemoryStore, MemoryUnit};
use crate::marketplace::moderation::ReviewDecision;
use crate::marketplace::payment::{
    PaymentIntent, PaymentProcessor, PaymentStatus, PayoutReceipt, ProcessorError,
};
use crate::marketplace::router::{marketplace_router, USER_ID_HEADER, USER_ROLE_HEADER};
use crate::marketplace::service::MarketplaceService;
use crate::marketplace::store::{MarketplaceStore, StoreError};

pub(super) const OWNER: Actor = Actor::particular(1);
pub(super) const BUYER_A: Actor = Actor::particular(2);
pub(super) const BUYER_B: Actor = Actor::particular(3);
pub(super) const BUYER_C: Actor = Actor::particular(4);
pub(super) const SHELTER: Actor = Actor::shelter(5);
pub(super) const MODERATOR: Actor = Actor::moderator(9);

pub(super) const PRICE_CENTS: u64 = 40_000;

pub(super) type TestService = MarketplaceService<MemoryStore, ScriptedProcessor>;

pub(super) fn accounts() -> Vec<Account> {
    [
        (OWNER, "Marta Ruiz", "marta@example.com"),
        (BUYER_A, "Jon Etxeberria", "jon@example.com"),
        (BUYER_B, "Ane Goikoetxea", "ane@example.com"),
        (BUYER_C, "Iker Larra", "iker@example.com"),
        (SHELTER, "Refugio Norte", "payouts@refugio-norte.org"),
        (MODERATOR, "Moderation desk", "moderation@example.com"),
    ]
    .into_iter()
    .map(|(actor, name, email)| Account {
        user_id: actor.user_id,
        role: actor.role,
        display_name: name.to_string(),
        email: email.to_string(),
    })
    .collect()
}

pub(super) fn store() -> Arc<MemoryStore> {
    let store = MemoryStore::new(StoreConfig {
        lock_timeout: std::time::Duration::from_millis(2_000),
    });
    for account in accounts() {
        store.register_account(account).expect("seed account");
    }
    Arc::new(store)
}

pub(super) fn build_service() -> (TestService, Arc<MemoryStore>, Arc<ScriptedProcessor>) {
    let store = store();
    let processor = Arc::new(ScriptedProcessor::default());
    let service = MarketplaceService::new(
        store.clone(),
        processor.clone(),
        PaymentConfig::default(),
    );
    (service, store, processor)
}

pub(super) fn breeding_draft() -> PublicationDraft {
    PublicationDraft {
        kind: ListingKind::Breeding,
        title: "Border collie puppy".to_string(),
        animal: AnimalDetails {
            species: Some("dog".to_string()),
            breed: Some("border collie".to_string()),
            age_months: Some(3),
            genre: Some("female".to_string()),
            location: Some("Bilbao".to_string()),
            pedigree: Some(true),
        },
        price_cents: Some(PRICE_CENTS),
    }
}

pub(super) fn adoption_draft() -> PublicationDraft {
    PublicationDraft {
        kind: ListingKind::Adoption,
        title: "Senior tabby".to_string(),
        animal: AnimalDetails::default(),
        price_cents: None,
    }
}

/// Registers and approves a breeding listing owned by [`OWNER`].
pub(super) fn approved_listing(service: &TestService) -> PublicationId {
    let publication = service
        .create_publication(&OWNER, breeding_draft())
        .expect("create listing");
    service
        .review_publication(&MODERATOR, publication.id, ReviewDecision::Accept)
        .expect("approve listing");
    publication.id
}

/// Approved listing with one pending request per buyer, moved to `Offered`.
pub(super) fn offered_listing(
    service: &TestService,
    buyers: &[Actor],
) -> (PublicationId, Vec<RequestId>) {
    let publication_id = approved_listing(service);
    let requests = buyers
        .iter()
        .map(|buyer| {
            service
                .express_interest(buyer, publication_id)
                .expect("interest registered")
                .id
        })
        .collect();
    service
        .start_negotiation(&OWNER, publication_id)
        .expect("negotiation started");
    (publication_id, requests)
}

/// Listing whose request from [`BUYER_A`] was accepted, waiting for payment.
pub(super) fn listing_in_payment(service: &TestService) -> (PublicationId, RequestId) {
    let (publication_id, requests) = offered_listing(service, &[BUYER_A, BUYER_B]);
    service
        .accept_request(&OWNER, requests[0], publication_id)
        .expect("acceptance succeeds");
    (publication_id, requests[0])
}

/// Listing with an authorized payment, ready for payout.
pub(super) fn listing_awaiting_payout(service: &TestService) -> PublicationId {
    let (publication_id, _) = listing_in_payment(service);
    service
        .initiate_payment(&BUYER_A, publication_id, "tok_visa")
        .expect("payment authorized");
    publication_id
}

/// Payment processor double replaying scripted statuses and recording calls.
#[derive(Default)]
pub(super) struct ScriptedProcessor {
    intent_status: Mutex<Option<PaymentStatus>>,
    retrieve_status: Mutex<Option<PaymentStatus>>,
    payout_results: Mutex<VecDeque<Result<PaymentStatus, ProcessorError>>>,
    intent_failure: Mutex<Option<ProcessorError>>,
    calls: Mutex<Vec<String>>,
    gate: Mutex<Option<Arc<Barrier>>>,
    next_id: AtomicU64,
}

impl ScriptedProcessor {
    pub(super) fn with_intent_status(&self, status: PaymentStatus) {
        *self.intent_status.lock().expect("processor mutex poisoned") = Some(status);
    }

    pub(super) fn with_retrieve_status(&self, status: PaymentStatus) {
        *self.retrieve_status.lock().expect("processor mutex poisoned") = Some(status);
    }

    pub(super) fn fail_intents_with(&self, error: ProcessorError) {
        *self.intent_failure.lock().expect("processor mutex poisoned") = Some(error);
    }

    pub(super) fn push_payout(&self, result: Result<PaymentStatus, ProcessorError>) {
        self.payout_results
            .lock()
            .expect("processor mutex poisoned")
            .push_back(result);
    }

    pub(super) fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("processor mutex poisoned").clone()
    }

    pub(super) fn intents(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| call.starts_with("intent"))
            .collect()
    }

    pub(super) fn payouts(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|call| call.starts_with("payout"))
            .collect()
    }

    /// Holds intent creation and payouts until the test has met the gate twice:
    /// once when the call has started, once to let it finish.
    pub(super) fn hold_calls_on(&self, gate: Arc<Barrier>) {
        *self.gate.lock().expect("processor mutex poisoned") = Some(gate);
    }

    fn record(&self, call: String) {
        self.calls.lock().expect("processor mutex poisoned").push(call);
    }

    fn pass_gate(&self) {
        let gate = self.gate.lock().expect("processor mutex poisoned").clone();
        if let Some(gate) = gate {
            gate.wait();
            gate.wait();
        }
    }
}

impl PaymentProcessor for ScriptedProcessor {
    fn create_payment_method(&self, token: &str) -> Result<String, ProcessorError> {
        self.record(format!("payment_method {token}"));
        Ok(format!("pm_{token}"))
    }

    fn create_payment_intent(
        &self,
        amount_cents: u64,
        currency: &str,
        payment_method: &str,
        return_url: &str,
    ) -> Result<PaymentIntent, ProcessorError> {
        self.record(format!(
            "intent {amount_cents} {currency} {payment_method} {return_url}"
        ));
        self.pass_gate();
        if let Some(error) = self.intent_failure.lock().expect("processor mutex poisoned").clone() {
            return Err(error);
        }
        let status = self
            .intent_status
            .lock()
            .expect("processor mutex poisoned")
            .clone()
            .unwrap_or(PaymentStatus::Succeeded);
        Ok(PaymentIntent {
            id: format!("pi_{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1),
            amount_cents,
            currency: currency.to_string(),
            status,
        })
    }

    fn retrieve_payment_intent(&self, intent_id: &str) -> Result<PaymentIntent, ProcessorError> {
        self.record(format!("retrieve {intent_id}"));
        let status = self
            .retrieve_status
            .lock()
            .expect("processor mutex poisoned")
            .clone()
            .unwrap_or(PaymentStatus::Succeeded);
        Ok(PaymentIntent {
            id: intent_id.to_string(),
            amount_cents: PRICE_CENTS,
            currency: "eur".to_string(),
            status,
        })
    }

    fn payout(
        &self,
        amount_cents: u64,
        currency: &str,
        recipient: &str,
    ) -> Result<PayoutReceipt, ProcessorError> {
        self.record(format!("payout {amount_cents} {currency} {recipient}"));
        self.pass_gate();
        let result = self
            .payout_results
            .lock()
            .expect("processor mutex poisoned")
            .pop_front()
            .unwrap_or(Ok(PaymentStatus::Succeeded));
        result.map(|status| PayoutReceipt {
            batch_id: format!("batch_{}", self.next_id.fetch_add(1, Ordering::Relaxed) + 1),
            status,
        })
    }
}

/// Store whose every unit of work fails to open.
pub(super) struct UnavailableStore;

impl MarketplaceStore for UnavailableStore {
    type Unit<'a> = MemoryUnit<'a>;

    fn begin(&self) -> Result<MemoryUnit<'_>, StoreError> {
        Err(StoreError::Unavailable("database offline".to_string()))
    }
}

pub(super) fn router_with_service(service: TestService) -> axum::Router {
    marketplace_router(Arc::new(service))
}

pub(super) fn request_as(
    actor: Actor,
    method: Method,
    uri: &str,
    body: Option<Value>,
) -> HttpRequest<Body> {
    let builder = HttpRequest::builder()
        .method(method)
        .uri(uri)
        .header(USER_ID_HEADER, actor.user_id.0.to_string())
        .header(USER_ROLE_HEADER, actor.role.label());
    match body {
        Some(payload) => builder
            .header(axum::http::header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(&payload).expect("json body")))
            .expect("request builds"),
        None => builder.body(Body::empty()).expect("request builds"),
    }
}

pub(super) async fn read_json_body(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), 64 * 1024)
        .await
        .expect("read body");
    serde_json::from_slice(&body).expect("json payload")
}

pub(super) fn user(id: u64, role: Role) -> Actor {
    Actor::new(UserId(id), role)
}

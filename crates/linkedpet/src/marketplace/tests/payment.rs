use std::sync::{Arc, Barrier};
use std::thread;

use super::common::*;
use crate::marketplace::domain::{PublicationId, TransactionStatus};
use crate::marketplace::memory::MemoryStore;
use crate::marketplace::moderation::ReviewDecision;
use crate::marketplace::payment::{PaymentStatus, ProcessorError};
use crate::marketplace::service::ErrorKind;
use crate::marketplace::store::{MarketplaceStore, UnitOfWork};

fn status_of(store: &MemoryStore, id: PublicationId) -> Option<TransactionStatus> {
    store
        .committed_publication(id)
        .expect("store readable")
        .expect("publication exists")
        .transaction_status
}

#[test]
fn successful_charge_moves_to_awaiting_payment() {
    let (service, store, processor) = build_service();
    let (publication_id, _) = listing_in_payment(&service);

    let outcome = service
        .initiate_payment(&BUYER_A, publication_id, "tok_visa")
        .expect("payment authorized");
    assert_eq!(outcome.processor_status(), Some(&PaymentStatus::Succeeded));
    assert_eq!(
        outcome.publication.transaction_status,
        Some(TransactionStatus::AwaitingPayment)
    );
    assert_eq!(outcome.publication.payment_intent.as_deref(), Some("pi_1"));
    assert_eq!(
        status_of(&store, publication_id),
        Some(TransactionStatus::AwaitingPayment)
    );

    assert_eq!(
        processor.calls(),
        vec![
            "payment_method tok_visa".to_string(),
            format!(
                "intent {PRICE_CENTS} eur pm_tok_visa http://localhost:8080/payment/return?publicationId={publication_id}"
            ),
        ]
    );
}

#[test]
fn only_the_accepted_particular_pays() {
    let (service, _, processor) = build_service();
    let (publication_id, _) = listing_in_payment(&service);

    for actor in [BUYER_B, BUYER_C, OWNER] {
        let err = service
            .initiate_payment(&actor, publication_id, "tok_visa")
            .expect_err("not the payer");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
    assert!(processor.calls().is_empty());
}

#[test]
fn charging_twice_is_rejected_once_authorized() {
    let (service, _, _) = build_service();
    let publication_id = listing_awaiting_payout(&service);

    let err = service
        .initiate_payment(&BUYER_A, publication_id, "tok_visa")
        .expect_err("already authorized");
    assert_eq!(err.kind(), ErrorKind::InvalidState);
}

#[test]
fn interactive_authorization_completes_through_confirmation() {
    let (service, store, processor) = build_service();
    let (publication_id, _) = listing_in_payment(&service);
    processor.with_intent_status(PaymentStatus::RequiresAction);

    let outcome = service
        .initiate_payment(&BUYER_A, publication_id, "tok_3ds")
        .expect("intent created");
    assert_eq!(
        outcome.processor_status(),
        Some(&PaymentStatus::RequiresAction)
    );
    assert_eq!(
        outcome.publication.transaction_status,
        Some(TransactionStatus::InPayment)
    );
    let reference = outcome
        .publication
        .payment_intent
        .clone()
        .expect("intent recorded");

    processor.with_retrieve_status(PaymentStatus::RequiresAction);
    let err = service
        .confirm_payment(&BUYER_A, publication_id, &reference)
        .expect_err("still waiting on the payer");
    assert_eq!(err.kind(), ErrorKind::UpstreamFailure);
    assert_eq!(
        status_of(&store, publication_id),
        Some(TransactionStatus::InPayment)
    );

    processor.with_retrieve_status(PaymentStatus::Succeeded);
    let outcome = service
        .confirm_payment(&BUYER_A, publication_id, &reference)
        .expect("confirmation succeeds");
    assert_eq!(
        outcome.publication.transaction_status,
        Some(TransactionStatus::AwaitingPayment)
    );

    service
        .confirm_payment(&BUYER_A, publication_id, &reference)
        .expect("confirming again is idempotent");
    assert_eq!(
        status_of(&store, publication_id),
        Some(TransactionStatus::AwaitingPayment)
    );
}

#[test]
fn confirmation_needs_the_recorded_reference() {
    let (service, _, processor) = build_service();
    let publication_id = listing_awaiting_payout(&service);

    let err = service
        .confirm_payment(&BUYER_A, publication_id, "pi_forged")
        .expect_err("unknown reference");
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(!processor
        .calls()
        .iter()
        .any(|call| call.starts_with("retrieve")));
}

#[test]
fn canceled_authorization_falls_back_to_in_payment() {
    let (service, store, processor) = build_service();
    let publication_id = listing_awaiting_payout(&service);
    let reference = store
        .committed_publication(publication_id)
        .expect("store readable")
        .and_then(|publication| publication.payment_intent)
        .expect("intent recorded");

    processor.with_retrieve_status(PaymentStatus::Canceled);
    let err = service
        .confirm_payment(&BUYER_A, publication_id, &reference)
        .expect_err("canceled authorizations fail");
    assert_eq!(err.kind(), ErrorKind::UpstreamFailure);

    let publication = store
        .committed_publication(publication_id)
        .expect("store readable")
        .expect("publication exists");
    assert_eq!(
        publication.transaction_status,
        Some(TransactionStatus::InPayment)
    );
    assert_eq!(publication.payment_intent, None);

    let outcome = service
        .initiate_payment(&BUYER_A, publication_id, "tok_visa")
        .expect("payer starts over");
    assert_eq!(
        outcome.publication.transaction_status,
        Some(TransactionStatus::AwaitingPayment)
    );
}

#[test]
fn unreachable_processor_leaves_the_listing_in_payment() {
    let (service, store, processor) = build_service();
    let (publication_id, _) = listing_in_payment(&service);
    processor.fail_intents_with(ProcessorError::Unreachable("connect timeout".to_string()));

    let err = service
        .initiate_payment(&BUYER_A, publication_id, "tok_visa")
        .expect_err("processor down");
    assert_eq!(err.kind(), ErrorKind::UpstreamFailure);

    let publication = store
        .committed_publication(publication_id)
        .expect("store readable")
        .expect("publication exists");
    assert_eq!(
        publication.transaction_status,
        Some(TransactionStatus::InPayment)
    );
    assert_eq!(publication.payment_intent, None);
}

#[test]
fn payout_withholds_the_platform_fee_and_completes() {
    let (service, store, processor) = build_service();
    let publication_id = listing_awaiting_payout(&service);

    let outcome = service
        .release_payout(&OWNER, publication_id)
        .expect("payout released");
    assert_eq!(outcome.amount_cents, 37_000);
    assert!(outcome.receipt.is_some());
    assert_eq!(
        outcome.publication.transaction_status,
        Some(TransactionStatus::Completed)
    );
    assert!(!outcome.publication.payout_in_flight);
    assert_eq!(
        processor.payouts(),
        vec!["payout 37000 eur marta@example.com".to_string()]
    );

    let err = service
        .release_payout(&OWNER, publication_id)
        .expect_err("completed is terminal");
    assert_eq!(err.kind(), ErrorKind::InvalidState);
    assert_eq!(processor.payouts().len(), 1);
    assert_eq!(
        status_of(&store, publication_id),
        Some(TransactionStatus::Completed)
    );
}

#[test]
fn payout_is_owner_only_and_needs_an_authorized_payment() {
    let (service, _, processor) = build_service();
    let (publication_id, _) = listing_in_payment(&service);

    let err = service
        .release_payout(&OWNER, publication_id)
        .expect_err("nothing authorized yet");
    assert_eq!(err.kind(), ErrorKind::InvalidState);

    service
        .initiate_payment(&BUYER_A, publication_id, "tok_visa")
        .expect("payment authorized");
    let err = service
        .release_payout(&BUYER_A, publication_id)
        .expect_err("payers are not paid out");
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(processor.payouts().is_empty());
}

#[test]
fn failed_payout_parks_the_listing_until_retried() {
    let (service, store, processor) = build_service();
    let publication_id = listing_awaiting_payout(&service);
    processor.push_payout(Err(ProcessorError::Unreachable("gateway timeout".to_string())));
    processor.push_payout(Ok(PaymentStatus::Processing));

    let err = service
        .release_payout(&OWNER, publication_id)
        .expect_err("transport failure");
    assert_eq!(err.kind(), ErrorKind::UpstreamFailure);
    let publication = store
        .committed_publication(publication_id)
        .expect("store readable")
        .expect("publication exists");
    assert_eq!(
        publication.transaction_status,
        Some(TransactionStatus::PayoutFailed)
    );
    assert!(!publication.payout_in_flight);

    let err = service
        .release_payout(&OWNER, publication_id)
        .expect_err("payout not settled");
    assert_eq!(err.kind(), ErrorKind::UpstreamFailure);

    let outcome = service
        .release_payout(&OWNER, publication_id)
        .expect("third attempt succeeds");
    assert_eq!(
        outcome.publication.transaction_status,
        Some(TransactionStatus::Completed)
    );
    assert_eq!(processor.payouts().len(), 3);
}

#[test]
fn claimed_payout_cannot_be_released_twice() {
    let (service, store, processor) = build_service();
    let publication_id = listing_awaiting_payout(&service);

    let mut unit = store.begin().expect("unit opens");
    let mut publication = unit
        .lock_publication(publication_id)
        .expect("lock taken")
        .expect("publication exists");
    publication.payout_in_flight = true;
    unit.update_publication(&publication).expect("claim staged");
    unit.commit().expect("claim committed");

    let err = service
        .release_payout(&OWNER, publication_id)
        .expect_err("payout already claimed");
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert!(processor.payouts().is_empty());
}

#[test]
fn free_adoption_completes_without_moving_money() {
    let (service, store, processor) = build_service();
    let publication = service
        .create_publication(&SHELTER, adoption_draft())
        .expect("listing registered");
    service
        .review_publication(&MODERATOR, publication.id, ReviewDecision::Accept)
        .expect("approved");
    let request = service
        .express_interest(&BUYER_A, publication.id)
        .expect("interest registered");
    service
        .start_negotiation(&SHELTER, publication.id)
        .expect("negotiation started");
    service
        .accept_request(&SHELTER, request.id, publication.id)
        .expect("accepted");

    let outcome = service
        .initiate_payment(&BUYER_A, publication.id, "tok_unused")
        .expect("nothing to charge");
    assert!(outcome.intent.is_none());
    assert_eq!(
        outcome.publication.transaction_status,
        Some(TransactionStatus::AwaitingPayment)
    );

    let payout = service
        .release_payout(&SHELTER, publication.id)
        .expect("completes");
    assert_eq!(payout.amount_cents, 0);
    assert!(payout.receipt.is_none());
    assert_eq!(
        status_of(&store, publication.id),
        Some(TransactionStatus::Completed)
    );
    assert!(processor.calls().is_empty());
}

#[test]
fn pending_intent_blocks_a_second_charge() {
    let (service, store, processor) = build_service();
    let (publication_id, _) = listing_in_payment(&service);
    processor.with_intent_status(PaymentStatus::RequiresAction);

    let first = service
        .initiate_payment(&BUYER_A, publication_id, "tok_3ds")
        .expect("intent created");
    let reference = first
        .intent
        .map(|intent| intent.id)
        .expect("intent returned");

    processor.with_retrieve_status(PaymentStatus::RequiresAction);
    let err = service
        .initiate_payment(&BUYER_A, publication_id, "tok_3ds")
        .expect_err("first charge still pending");
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(processor.intents().len(), 1);

    let publication = store
        .committed_publication(publication_id)
        .expect("store readable")
        .expect("publication exists");
    assert_eq!(publication.payment_intent.as_deref(), Some(reference.as_str()));
    assert!(!publication.charge_in_flight);

    processor.with_retrieve_status(PaymentStatus::Succeeded);
    let outcome = service
        .confirm_payment(&BUYER_A, publication_id, &reference)
        .expect("first charge confirms");
    assert_eq!(
        outcome.publication.transaction_status,
        Some(TransactionStatus::AwaitingPayment)
    );
}

#[test]
fn settled_intent_is_reused_instead_of_charging_again() {
    let (service, _, processor) = build_service();
    let (publication_id, _) = listing_in_payment(&service);
    processor.with_intent_status(PaymentStatus::RequiresAction);
    service
        .initiate_payment(&BUYER_A, publication_id, "tok_3ds")
        .expect("intent created");

    processor.with_retrieve_status(PaymentStatus::Succeeded);
    let outcome = service
        .initiate_payment(&BUYER_A, publication_id, "tok_3ds")
        .expect("settled intent recorded");
    assert_eq!(
        outcome.intent.map(|intent| intent.id).as_deref(),
        Some("pi_1")
    );
    assert_eq!(
        outcome.publication.transaction_status,
        Some(TransactionStatus::AwaitingPayment)
    );
    assert_eq!(processor.intents().len(), 1);
}

#[test]
fn declined_intent_is_replaced_by_a_new_card() {
    let (service, _, processor) = build_service();
    let (publication_id, _) = listing_in_payment(&service);
    processor.with_intent_status(PaymentStatus::RequiresPaymentMethod);
    service
        .initiate_payment(&BUYER_A, publication_id, "tok_decline")
        .expect("declined intent recorded");

    processor.with_retrieve_status(PaymentStatus::RequiresPaymentMethod);
    processor.with_intent_status(PaymentStatus::Succeeded);
    let outcome = service
        .initiate_payment(&BUYER_A, publication_id, "tok_visa")
        .expect("second card charged");
    assert_eq!(outcome.publication.payment_intent.as_deref(), Some("pi_2"));
    assert_eq!(
        outcome.publication.transaction_status,
        Some(TransactionStatus::AwaitingPayment)
    );
    assert_eq!(processor.intents().len(), 2);
}

#[test]
fn concurrent_charges_create_a_single_intent() {
    let (service, store, processor) = build_service();
    let (publication_id, _) = listing_in_payment(&service);
    let gate = Arc::new(Barrier::new(2));
    processor.hold_calls_on(gate.clone());

    let (second, claimed) = thread::scope(|scope| {
        let first = scope.spawn(|| service.initiate_payment(&BUYER_A, publication_id, "tok_visa"));
        gate.wait();
        let second = service.initiate_payment(&BUYER_A, publication_id, "tok_visa");
        let claimed = store
            .committed_publication(publication_id)
            .expect("store readable")
            .map(|publication| publication.charge_in_flight);
        gate.wait();
        first
            .join()
            .expect("charging thread")
            .expect("first charge succeeds");
        (second, claimed)
    });

    assert_eq!(
        second.expect_err("charge already claimed").kind(),
        ErrorKind::Conflict
    );
    assert_eq!(claimed, Some(true));
    assert_eq!(processor.intents().len(), 1);
    let publication = store
        .committed_publication(publication_id)
        .expect("store readable")
        .expect("publication exists");
    assert!(!publication.charge_in_flight);
    assert_eq!(
        publication.transaction_status,
        Some(TransactionStatus::AwaitingPayment)
    );
}

#[test]
fn failed_charge_releases_its_claim() {
    let (service, store, processor) = build_service();
    let (publication_id, _) = listing_in_payment(&service);
    processor.fail_intents_with(ProcessorError::Unreachable("connect timeout".to_string()));

    service
        .initiate_payment(&BUYER_A, publication_id, "tok_visa")
        .expect_err("processor down");
    let publication = store
        .committed_publication(publication_id)
        .expect("store readable")
        .expect("publication exists");
    assert!(!publication.charge_in_flight);
}

#[test]
fn canceled_authorization_cannot_reopen_a_payout_in_flight() {
    let (service, store, processor) = build_service();
    let publication_id = listing_awaiting_payout(&service);
    let gate = Arc::new(Barrier::new(2));
    processor.hold_calls_on(gate.clone());
    processor.with_retrieve_status(PaymentStatus::Canceled);

    let (confirmed, mid_payout, payout) = thread::scope(|scope| {
        let payout = scope.spawn(|| service.release_payout(&OWNER, publication_id));
        gate.wait();
        let confirmed = service.confirm_payment(&BUYER_A, publication_id, "pi_1");
        let mid_payout = status_of(&store, publication_id);
        gate.wait();
        (
            confirmed,
            mid_payout,
            payout.join().expect("payout thread"),
        )
    });

    assert_eq!(
        confirmed.expect_err("payout in flight").kind(),
        ErrorKind::Conflict
    );
    assert_eq!(mid_payout, Some(TransactionStatus::AwaitingPayment));
    let outcome = payout.expect("payout completes");
    assert_eq!(
        outcome.publication.transaction_status,
        Some(TransactionStatus::Completed)
    );
}

#[test]
fn payout_is_not_recorded_once_the_listing_left_its_payout_phase() {
    let (service, store, processor) = build_service();
    let publication_id = listing_awaiting_payout(&service);
    let gate = Arc::new(Barrier::new(2));
    processor.hold_calls_on(gate.clone());

    let payout = thread::scope(|scope| {
        let payout = scope.spawn(|| service.release_payout(&OWNER, publication_id));
        gate.wait();
        let mut unit = store.begin().expect("unit opens");
        let mut publication = unit
            .lock_publication(publication_id)
            .expect("lock taken")
            .expect("publication exists");
        publication.transaction_status = Some(TransactionStatus::InPayment);
        unit.update_publication(&publication).expect("write staged");
        unit.commit().expect("write committed");
        gate.wait();
        payout.join().expect("payout thread")
    });

    assert_eq!(
        payout.expect_err("phase changed").kind(),
        ErrorKind::Conflict
    );
    let publication = store
        .committed_publication(publication_id)
        .expect("store readable")
        .expect("publication exists");
    assert_eq!(
        publication.transaction_status,
        Some(TransactionStatus::InPayment)
    );
    assert!(publication.payout_in_flight, "claim stays for an operator");
}

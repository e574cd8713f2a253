use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::domain::{Actor, Publication, PublicationId, RequestStatus, Role, TransactionStatus};
use super::service::{
    locked_publication, owned_publication, require_role, resolve_lister, MarketplaceService,
    WorkflowError,
};
use super::store::{MarketplaceStore, UnitOfWork};

/// Status reported by the processor for a charge or payout. Only `succeeded`
/// moves the workflow forward; every other value means "not yet".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum PaymentStatus {
    Succeeded,
    RequiresAction,
    RequiresPaymentMethod,
    RequiresConfirmation,
    Processing,
    Canceled,
    Other(String),
}

impl PaymentStatus {
    pub fn as_str(&self) -> &str {
        match self {
            PaymentStatus::Succeeded => "succeeded",
            PaymentStatus::RequiresAction => "requires_action",
            PaymentStatus::RequiresPaymentMethod => "requires_payment_method",
            PaymentStatus::RequiresConfirmation => "requires_confirmation",
            PaymentStatus::Processing => "processing",
            PaymentStatus::Canceled => "canceled",
            PaymentStatus::Other(raw) => raw,
        }
    }

    pub fn is_succeeded(&self) -> bool {
        matches!(self, PaymentStatus::Succeeded)
    }
}

impl From<&str> for PaymentStatus {
    fn from(value: &str) -> Self {
        match value {
            "succeeded" => PaymentStatus::Succeeded,
            "requires_action" => PaymentStatus::RequiresAction,
            "requires_payment_method" => PaymentStatus::RequiresPaymentMethod,
            "requires_confirmation" => PaymentStatus::RequiresConfirmation,
            "processing" => PaymentStatus::Processing,
            "canceled" => PaymentStatus::Canceled,
            other => PaymentStatus::Other(other.to_string()),
        }
    }
}

impl From<String> for PaymentStatus {
    fn from(value: String) -> Self {
        PaymentStatus::from(value.as_str())
    }
}

impl From<PaymentStatus> for String {
    fn from(value: PaymentStatus) -> Self {
        value.as_str().to_string()
    }
}

/// Charge created with the processor for one publication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub amount_cents: u64,
    pub currency: String,
    pub status: PaymentStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayoutReceipt {
    pub batch_id: String,
    pub status: PaymentStatus,
}

/// Client for the external card processor and payout API.
pub trait PaymentProcessor: Send + Sync {
    /// Exchanges a client-side card token for a reusable payment method id.
    fn create_payment_method(&self, token: &str) -> Result<String, ProcessorError>;

    fn create_payment_intent(
        &self,
        amount_cents: u64,
        currency: &str,
        payment_method: &str,
        return_url: &str,
    ) -> Result<PaymentIntent, ProcessorError>;

    fn retrieve_payment_intent(&self, intent_id: &str) -> Result<PaymentIntent, ProcessorError>;

    fn payout(
        &self,
        amount_cents: u64,
        currency: &str,
        recipient: &str,
    ) -> Result<PayoutReceipt, ProcessorError>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessorError {
    #[error("payment processor unreachable: {0}")]
    Unreachable(String),
    #[error("payment processor refused the call: {0}")]
    Refused(String),
}

impl From<ProcessorError> for WorkflowError {
    fn from(value: ProcessorError) -> Self {
        WorkflowError::UpstreamFailure(value.to_string())
    }
}

/// Publication state after a charge attempt, with the processor's view of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentOutcome {
    pub publication: Publication,
    /// Absent when there was nothing to charge.
    pub intent: Option<PaymentIntent>,
}

impl PaymentOutcome {
    pub fn processor_status(&self) -> Option<&PaymentStatus> {
        self.intent.as_ref().map(|intent| &intent.status)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PayoutOutcome {
    pub publication: Publication,
    pub amount_cents: u64,
    /// Absent when the listing was free and no money moved.
    pub receipt: Option<PayoutReceipt>,
}

/// The payer is the particular holding the accepted request; anyone else
/// learns nothing about the publication.
fn require_payer<U: UnitOfWork>(
    unit: &mut U,
    actor: &Actor,
    publication: &Publication,
) -> Result<(), WorkflowError> {
    let is_payer = unit
        .request_for(publication.id, actor.user_id)?
        .is_some_and(|request| request.status == RequestStatus::Accepted);
    if is_payer {
        Ok(())
    } else {
        Err(WorkflowError::publication_not_found(publication.id))
    }
}

fn require_payment_phase(publication: &Publication) -> Result<(), WorkflowError> {
    match publication.transaction_status {
        Some(TransactionStatus::InPayment | TransactionStatus::AwaitingPayment) => Ok(()),
        other => Err(WorkflowError::InvalidState(format!(
            "publication {} is not in its payment phase ({})",
            publication.id,
            other.map_or("unreviewed", TransactionStatus::label)
        ))),
    }
}

impl<S, P> MarketplaceService<S, P>
where
    S: MarketplaceStore + 'static,
    P: PaymentProcessor + 'static,
{
    /// Charge the accepted particular for the publication price.
    ///
    /// A non-succeeded processor status is returned to the caller unchanged and
    /// leaves the transaction status where it was so the payer can finish any
    /// interactive step and confirm later. A recorded intent that can still
    /// settle is never replaced by a second charge.
    pub fn initiate_payment(
        &self,
        actor: &Actor,
        publication_id: PublicationId,
        payment_method_token: &str,
    ) -> Result<PaymentOutcome, WorkflowError> {
        let (price, outstanding) = self.in_unit("initiate_payment", |unit| {
            require_role(unit, actor, Role::Particular)?;
            let mut publication = locked_publication(unit, publication_id)?;
            require_payer(unit, actor, &publication)?;

            if publication.transaction_status != Some(TransactionStatus::InPayment) {
                return Err(WorkflowError::InvalidState(format!(
                    "publication {publication_id} is not waiting for a payment ({})",
                    publication
                        .transaction_status
                        .map_or("unreviewed", TransactionStatus::label)
                )));
            }
            if publication.charge_in_flight {
                return Err(WorkflowError::Conflict(format!(
                    "a charge for publication {publication_id} is already being created"
                )));
            }

            publication.charge_in_flight = true;
            unit.update_publication(&publication)?;
            Ok((
                publication.price_cents.unwrap_or(0),
                publication.payment_intent.clone(),
            ))
        })?;

        let intent = match self.charge(
            publication_id,
            price,
            outstanding.as_deref(),
            payment_method_token,
        ) {
            Ok(intent) => intent,
            Err(err) => {
                self.release_charge_claim(publication_id);
                return Err(err);
            }
        };

        let publication = match self.settle_charge(publication_id, intent.as_ref()) {
            Ok(publication) => publication,
            Err(err) => {
                warn!(
                    publication = %publication_id,
                    intent = intent.as_ref().map(|intent| intent.id.as_str()),
                    error = %err,
                    "charge not recorded, charge claim left set"
                );
                return Err(err);
            }
        };

        match &intent {
            None => info!(publication = %publication_id, "free listing authorized without a charge"),
            Some(intent) if intent.status.is_succeeded() => {
                info!(publication = %publication_id, intent = %intent.id, "payment authorized")
            }
            Some(intent) => info!(
                publication = %publication_id,
                intent = %intent.id,
                status = intent.status.as_str(),
                "payment needs further action"
            ),
        }

        Ok(PaymentOutcome {
            publication,
            intent,
        })
    }

    /// Re-check a previously created charge with the processor.
    pub fn confirm_payment(
        &self,
        actor: &Actor,
        publication_id: PublicationId,
        payment_reference: &str,
    ) -> Result<PaymentOutcome, WorkflowError> {
        self.in_unit("confirm_payment", |unit| {
            require_role(unit, actor, Role::Particular)?;
            let publication = unit
                .publication(publication_id)?
                .ok_or_else(|| WorkflowError::publication_not_found(publication_id))?;
            require_payer(unit, actor, &publication)?;

            if publication.payment_intent.as_deref() != Some(payment_reference) {
                return Err(WorkflowError::NotFound(format!(
                    "payment {payment_reference} not found"
                )));
            }
            if publication.charge_in_flight {
                return Err(WorkflowError::Conflict(format!(
                    "a charge for publication {publication_id} is being created"
                )));
            }
            require_payment_phase(&publication)
        })?;

        let intent = self.processor.retrieve_payment_intent(payment_reference)?;

        if !intent.status.is_succeeded() {
            if intent.status == PaymentStatus::Canceled {
                self.revert_canceled_authorization(publication_id, payment_reference)?;
            }
            warn!(
                publication = %publication_id,
                intent = %intent.id,
                status = intent.status.as_str(),
                "payment not successful"
            );
            return Err(WorkflowError::UpstreamFailure(format!(
                "payment {payment_reference} not successful ({})",
                intent.status.as_str()
            )));
        }

        let publication = self.record_confirmation(publication_id, &intent)?;
        info!(publication = %publication_id, intent = %intent.id, "payment confirmed");
        Ok(PaymentOutcome {
            publication,
            intent: Some(intent),
        })
    }

    /// Pay the owner the price minus the platform fee and complete the listing.
    ///
    /// A failed payout parks the publication in `PayoutFailed`, from where the
    /// owner may retry.
    pub fn release_payout(
        &self,
        actor: &Actor,
        publication_id: PublicationId,
    ) -> Result<PayoutOutcome, WorkflowError> {
        let (amount, recipient) = self.in_unit("release_payout", |unit| {
            let account = resolve_lister(unit, actor)?;
            let mut publication = owned_publication(unit, actor, publication_id)?;

            if !in_payout_phase(&publication) {
                return Err(WorkflowError::InvalidState(format!(
                    "publication {publication_id} has no authorized payment to release ({})",
                    publication
                        .transaction_status
                        .map_or("unreviewed", TransactionStatus::label)
                )));
            }
            if publication.payout_in_flight {
                return Err(WorkflowError::Conflict(format!(
                    "a payout for publication {publication_id} is already in progress"
                )));
            }

            publication.payout_in_flight = true;
            unit.update_publication(&publication)?;

            let amount = self
                .payments
                .payout_amount(publication.price_cents.unwrap_or(0));
            Ok((amount, account.email))
        })?;

        let paid = if amount == 0 {
            Ok(None)
        } else {
            match self
                .processor
                .payout(amount, &self.payments.currency, &recipient)
            {
                Ok(receipt) if receipt.status.is_succeeded() => Ok(Some(receipt)),
                Ok(receipt) => Err(WorkflowError::UpstreamFailure(format!(
                    "payout {} for publication {publication_id} not successful ({})",
                    receipt.batch_id,
                    receipt.status.as_str()
                ))),
                Err(err) => Err(WorkflowError::from(err)),
            }
        };

        let next = if paid.is_ok() {
            TransactionStatus::Completed
        } else {
            TransactionStatus::PayoutFailed
        };
        let recorded = self.in_unit("release_payout", |unit| {
            let mut publication = locked_publication(unit, publication_id)?;
            if !in_payout_phase(&publication) {
                return Err(WorkflowError::Conflict(format!(
                    "publication {publication_id} left its payout phase while the payout ran ({})",
                    publication
                        .transaction_status
                        .map_or("unreviewed", TransactionStatus::label)
                )));
            }
            publication.payout_in_flight = false;
            publication.advance(next)?;
            unit.update_publication(&publication)?;
            Ok(publication)
        });
        let publication = match recorded {
            Ok(publication) => publication,
            Err(err) => {
                warn!(
                    publication = %publication_id,
                    amount,
                    paid = paid.is_ok(),
                    error = %err,
                    "payout outcome not recorded, payout claim left set"
                );
                return Err(err);
            }
        };

        match paid {
            Ok(receipt) => {
                info!(publication = %publication_id, amount, "payout released, publication completed");
                Ok(PayoutOutcome {
                    publication,
                    amount_cents: amount,
                    receipt,
                })
            }
            Err(err) => {
                warn!(publication = %publication_id, error = %err, "payout failed");
                Err(err)
            }
        }
    }

    /// Processor side of a charge. An outstanding intent is looked up first: a
    /// settled one is reused, a pending one blocks the new charge, and only a
    /// dead one is replaced. `None` when there is nothing to charge.
    fn charge(
        &self,
        publication_id: PublicationId,
        price: u64,
        outstanding: Option<&str>,
        payment_method_token: &str,
    ) -> Result<Option<PaymentIntent>, WorkflowError> {
        if price == 0 {
            return Ok(None);
        }

        if let Some(reference) = outstanding {
            let previous = self.processor.retrieve_payment_intent(reference)?;
            if previous.status.is_succeeded() {
                return Ok(Some(previous));
            }
            match &previous.status {
                PaymentStatus::RequiresPaymentMethod | PaymentStatus::Canceled => {
                    debug!(
                        publication = %publication_id,
                        intent = %reference,
                        status = previous.status.as_str(),
                        "replacing dead payment intent"
                    );
                }
                pending => {
                    return Err(WorkflowError::Conflict(format!(
                        "payment {reference} for publication {publication_id} is still {}; confirm it instead",
                        pending.as_str()
                    )))
                }
            }
        }

        let method = self.processor.create_payment_method(payment_method_token)?;
        let return_url = format!(
            "{}?publicationId={publication_id}",
            self.payments.return_url
        );
        let intent = self.processor.create_payment_intent(
            price,
            &self.payments.currency,
            &method,
            &return_url,
        )?;
        Ok(Some(intent))
    }

    /// Stores the charge made under this call's claim and releases the claim.
    /// Moves to `AwaitingPayment` when the processor reports success or there
    /// was nothing to charge.
    fn settle_charge(
        &self,
        publication_id: PublicationId,
        intent: Option<&PaymentIntent>,
    ) -> Result<Publication, WorkflowError> {
        self.in_unit("settle_charge", |unit| {
            let mut publication = locked_publication(unit, publication_id)?;
            if !publication.charge_in_flight
                || publication.transaction_status != Some(TransactionStatus::InPayment)
            {
                return Err(WorkflowError::Conflict(format!(
                    "publication {publication_id} changed while its charge was created"
                )));
            }

            publication.charge_in_flight = false;
            if let Some(intent) = intent {
                publication.payment_intent = Some(intent.id.clone());
            }
            if intent.map_or(true, |intent| intent.status.is_succeeded()) {
                publication.advance(TransactionStatus::AwaitingPayment)?;
            }

            unit.update_publication(&publication)?;
            Ok(publication)
        })
    }

    fn release_charge_claim(&self, publication_id: PublicationId) {
        let released = self.in_unit("release_charge_claim", |unit| {
            let mut publication = locked_publication(unit, publication_id)?;
            publication.charge_in_flight = false;
            unit.update_publication(&publication)
                .map_err(WorkflowError::from)
        });
        if let Err(err) = released {
            warn!(publication = %publication_id, error = %err, "charge claim left set");
        }
    }

    /// Marks the confirmed intent as authorized. The processor call ran outside
    /// any unit of work, so the intent must still be the recorded one.
    fn record_confirmation(
        &self,
        publication_id: PublicationId,
        intent: &PaymentIntent,
    ) -> Result<Publication, WorkflowError> {
        self.in_unit("record_confirmation", |unit| {
            let mut publication = locked_publication(unit, publication_id)?;
            require_payment_phase(&publication)?;
            if publication.charge_in_flight
                || publication.payment_intent.as_deref() != Some(intent.id.as_str())
            {
                return Err(WorkflowError::Conflict(format!(
                    "payment {} was superseded on publication {publication_id}",
                    intent.id
                )));
            }

            publication.advance(TransactionStatus::AwaitingPayment)?;
            unit.update_publication(&publication)?;
            Ok(publication)
        })
    }

    /// The processor voided an authorization we had recorded: fall back to
    /// `InPayment` so the payer can start over. Refused while the owner is
    /// being paid.
    fn revert_canceled_authorization(
        &self,
        publication_id: PublicationId,
        payment_reference: &str,
    ) -> Result<(), WorkflowError> {
        self.in_unit("revert_canceled_authorization", |unit| {
            let mut publication = locked_publication(unit, publication_id)?;
            if publication.transaction_status != Some(TransactionStatus::AwaitingPayment)
                || publication.payment_intent.as_deref() != Some(payment_reference)
            {
                return Ok(());
            }
            if publication.payout_in_flight {
                return Err(WorkflowError::Conflict(format!(
                    "payment {payment_reference} was canceled while publication {publication_id} is being paid out"
                )));
            }

            publication.advance(TransactionStatus::InPayment)?;
            publication.payment_intent = None;
            unit.update_publication(&publication)?;
            warn!(publication = %publication_id, "authorization canceled, payment reopened");
            Ok(())
        })
    }
}

fn in_payout_phase(publication: &Publication) -> bool {
    matches!(
        publication.transaction_status,
        Some(TransactionStatus::AwaitingPayment | TransactionStatus::PayoutFailed)
    )
}

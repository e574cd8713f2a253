//! Owner-side negotiation: closing a listing to new interest, rejecting
//! requests, and promoting exactly one request to accepted.

use serde::Serialize;
use tracing::info;

use super::domain::{
    Actor, DocumentStatus, Publication, PublicationId, Request, RequestId, RequestStatus,
    TransactionStatus,
};
use super::payment::PaymentProcessor;
use super::service::{
    locked_publication, owned_publication, resolve_lister, MarketplaceService, WorkflowError,
};
use super::store::{MarketplaceStore, UnitOfWork};

/// Result of a successful acceptance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AcceptanceOutcome {
    pub accepted: Request,
    /// Sibling requests that were pending and are now rejected.
    pub rejected: Vec<RequestId>,
    pub publication: Publication,
}

impl<S, P> MarketplaceService<S, P>
where
    S: MarketplaceStore + 'static,
    P: PaymentProcessor + 'static,
{
    /// Stop taking new interest so the owner can pick among pending requests.
    pub fn start_negotiation(
        &self,
        actor: &Actor,
        publication_id: PublicationId,
    ) -> Result<Publication, WorkflowError> {
        self.in_unit("start_negotiation", |unit| {
            resolve_lister(unit, actor)?;
            let mut publication = owned_publication(unit, actor, publication_id)?;

            if !publication.is_open_for_interest() {
                return Err(WorkflowError::InvalidState(format!(
                    "publication {publication_id} is not open for interest"
                )));
            }

            let pending = unit
                .requests_for_publication(publication_id)?
                .iter()
                .filter(|request| request.status == RequestStatus::Pending)
                .count();
            if pending == 0 {
                return Err(WorkflowError::InvalidState(format!(
                    "publication {publication_id} has no pending requests to choose from"
                )));
            }

            publication.advance(TransactionStatus::Offered)?;
            unit.update_publication(&publication)?;

            info!(publication = %publication_id, pending, "negotiation started");
            Ok(publication)
        })
    }

    pub fn reject_request(
        &self,
        actor: &Actor,
        request_id: RequestId,
    ) -> Result<Request, WorkflowError> {
        self.in_unit("reject_request", |unit| {
            resolve_lister(unit, actor)?;
            let publication_id = unit
                .request(request_id)?
                .ok_or_else(|| WorkflowError::request_not_found(request_id))?
                .publication_id;

            let publication = locked_publication(unit, publication_id)?;
            if !publication.owner.is(actor) {
                return Err(WorkflowError::request_not_found(request_id));
            }

            let mut request = unit
                .request(request_id)?
                .ok_or_else(|| WorkflowError::request_not_found(request_id))?;
            if request.status != RequestStatus::Pending {
                return Err(WorkflowError::InvalidState(format!(
                    "request {request_id} is {} and cannot be rejected",
                    request.status.label()
                )));
            }

            request.status = RequestStatus::Rejected;
            unit.update_request(&request)?;

            info!(publication = %publication_id, request = %request_id, "request rejected");
            Ok(request)
        })
    }

    /// Accept one pending request and reject every other pending request on the
    /// same publication, moving the publication to payment.
    ///
    /// The publication row stays locked from the state check to the commit, so
    /// a concurrent acceptance on a sibling either waits and then finds the
    /// publication no longer offered, or wins and leaves this call to find the
    /// same.
    pub fn accept_request(
        &self,
        actor: &Actor,
        request_id: RequestId,
        publication_id: PublicationId,
    ) -> Result<AcceptanceOutcome, WorkflowError> {
        self.in_unit("accept_request", |unit| {
            resolve_lister(unit, actor)?;
            let mut publication = owned_publication(unit, actor, publication_id)?;

            if publication.document_status != DocumentStatus::Accepted
                || publication.transaction_status != Some(TransactionStatus::Offered)
            {
                return Err(WorkflowError::InvalidState(format!(
                    "publication {publication_id} is not in an acceptable state ({})",
                    publication
                        .transaction_status
                        .map_or("unreviewed", TransactionStatus::label)
                )));
            }

            let mut accepted = unit
                .request(request_id)?
                .filter(|request| request.publication_id == publication_id)
                .ok_or_else(|| WorkflowError::request_not_found(request_id))?;
            if accepted.status != RequestStatus::Pending {
                return Err(WorkflowError::InvalidState(format!(
                    "request {request_id} is {} and cannot be accepted",
                    accepted.status.label()
                )));
            }

            let siblings: Vec<Request> = unit
                .requests_for_publication(publication_id)?
                .into_iter()
                .filter(|request| request.id != request_id)
                .collect();

            if let Some(holder) = siblings
                .iter()
                .find(|request| request.status == RequestStatus::Accepted)
            {
                return Err(WorkflowError::Conflict(format!(
                    "publication {publication_id} already accepted request {}",
                    holder.id
                )));
            }

            let mut rejected = Vec::new();
            for mut sibling in siblings
                .into_iter()
                .filter(|request| request.status == RequestStatus::Pending)
            {
                sibling.status = RequestStatus::Rejected;
                unit.update_request(&sibling)?;
                rejected.push(sibling.id);
            }

            accepted.status = RequestStatus::Accepted;
            unit.update_request(&accepted)?;

            publication.advance(TransactionStatus::InPayment)?;
            unit.update_publication(&publication)?;

            info!(
                publication = %publication_id,
                request = %request_id,
                rejected = rejected.len(),
                "request accepted"
            );
            Ok(AcceptanceOutcome {
                accepted,
                rejected,
                publication,
            })
        })
    }
}

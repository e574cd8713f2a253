use tracing::info;

use super::domain::{
    Actor, DocumentStatus, NewRequest, Publication, PublicationId, Request, RequestId,
    RequestStatus, Role,
};
use super::payment::PaymentProcessor;
use super::service::{locked_publication, require_role, MarketplaceService, WorkflowError};
use super::store::{MarketplaceStore, UnitOfWork};

fn reject_own_listing(actor: &Actor, publication: &Publication) -> Result<(), WorkflowError> {
    if publication.owner.user_id() == actor.user_id {
        return Err(WorkflowError::InvalidState(format!(
            "particular {} cannot show interest in their own publication {}",
            actor.user_id, publication.id
        )));
    }
    Ok(())
}

impl<S, P> MarketplaceService<S, P>
where
    S: MarketplaceStore + 'static,
    P: PaymentProcessor + 'static,
{
    /// Register (or renew) a particular's interest in a listing open for negotiation.
    ///
    /// The publication row is locked before the existing request is looked up, so
    /// two concurrent calls for the same pair cannot both miss it.
    pub fn express_interest(
        &self,
        actor: &Actor,
        publication_id: PublicationId,
    ) -> Result<Request, WorkflowError> {
        self.in_unit("express_interest", |unit| {
            require_role(unit, actor, Role::Particular)?;
            let publication = locked_publication(unit, publication_id)?;
            reject_own_listing(actor, &publication)?;

            let existing = unit.request_for(publication_id, actor.user_id)?;
            if existing
                .as_ref()
                .is_some_and(|request| request.status == RequestStatus::Pending)
            {
                return Err(WorkflowError::Conflict(format!(
                    "particular {} is already interested in publication {publication_id}",
                    actor.user_id
                )));
            }

            if !publication.is_open_for_interest() {
                return Err(WorkflowError::InvalidState(format!(
                    "publication {publication_id} is not verified or is already under negotiation"
                )));
            }

            let request = match existing {
                Some(mut request) => {
                    request.status = RequestStatus::Pending;
                    unit.update_request(&request)?;
                    request
                }
                None => unit.insert_request(NewRequest {
                    publication_id,
                    particular_id: actor.user_id,
                    status: RequestStatus::Pending,
                    is_favorite: false,
                })?,
            };

            info!(
                publication = %publication_id,
                request = %request.id,
                particular = %actor.user_id,
                "interest registered"
            );
            Ok(request)
        })
    }

    /// Bookmark a verified listing without entering the negotiation.
    pub fn mark_favorite(
        &self,
        actor: &Actor,
        publication_id: PublicationId,
    ) -> Result<Request, WorkflowError> {
        self.in_unit("mark_favorite", |unit| {
            require_role(unit, actor, Role::Particular)?;
            let publication = locked_publication(unit, publication_id)?;
            reject_own_listing(actor, &publication)?;

            let existing = unit.request_for(publication_id, actor.user_id)?;
            if existing.as_ref().is_some_and(|request| request.is_favorite) {
                return Err(WorkflowError::Conflict(format!(
                    "publication {publication_id} is already a favorite of particular {}",
                    actor.user_id
                )));
            }

            if publication.document_status != DocumentStatus::Accepted {
                return Err(WorkflowError::InvalidState(format!(
                    "publication {publication_id} has not been verified"
                )));
            }

            let request = match existing {
                Some(mut request) => {
                    request.is_favorite = true;
                    unit.update_request(&request)?;
                    request
                }
                None => unit.insert_request(NewRequest {
                    publication_id,
                    particular_id: actor.user_id,
                    status: RequestStatus::Favorite,
                    is_favorite: true,
                })?,
            };

            info!(publication = %publication_id, request = %request.id, "favorite marked");
            Ok(request)
        })
    }

    /// Withdraw one of the caller's own requests. Accepted requests are final.
    pub fn delete_request(&self, actor: &Actor, request_id: RequestId) -> Result<(), WorkflowError> {
        self.in_unit("delete_request", |unit| {
            require_role(unit, actor, Role::Particular)?;
            let publication_id = unit
                .request(request_id)?
                .ok_or_else(|| WorkflowError::request_not_found(request_id))?
                .publication_id;

            // Serialize with acceptance before re-reading the row.
            locked_publication(unit, publication_id)?;
            let request = unit
                .request(request_id)?
                .filter(|request| request.particular_id == actor.user_id)
                .ok_or_else(|| WorkflowError::request_not_found(request_id))?;

            if request.status == RequestStatus::Accepted {
                return Err(WorkflowError::InvalidState(format!(
                    "request {request_id} was accepted and can no longer be deleted"
                )));
            }

            unit.delete_request(request_id)?;
            info!(publication = %publication_id, request = %request_id, "request deleted");
            Ok(())
        })
    }
}

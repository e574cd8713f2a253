use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier wrapper for listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PublicationId(pub u64);

/// Identifier wrapper for interest/favorite records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(pub u64);

/// Identifier of a user account as issued by the authorization provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(pub u64);

impl fmt::Display for PublicationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Particular,
    Shelter,
    Moderator,
    Administrator,
}

impl Role {
    pub const fn label(self) -> &'static str {
        match self {
            Role::Particular => "particular",
            Role::Shelter => "shelter",
            Role::Moderator => "moderator",
            Role::Administrator => "administrator",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "particular" => Some(Role::Particular),
            "shelter" => Some(Role::Shelter),
            "moderator" => Some(Role::Moderator),
            "administrator" | "admin" => Some(Role::Administrator),
            _ => None,
        }
    }
}

/// The already-authenticated caller of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: UserId,
    pub role: Role,
}

impl Actor {
    pub const fn new(user_id: UserId, role: Role) -> Self {
        Self { user_id, role }
    }

    pub const fn particular(id: u64) -> Self {
        Self::new(UserId(id), Role::Particular)
    }

    pub const fn shelter(id: u64) -> Self {
        Self::new(UserId(id), Role::Shelter)
    }

    pub const fn moderator(id: u64) -> Self {
        Self::new(UserId(id), Role::Moderator)
    }
}

/// Directory entry for a platform user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub user_id: UserId,
    pub role: Role,
    pub display_name: String,
    /// Payout recipient for listing owners.
    pub email: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingKind {
    /// Animal offered for sale by a particular.
    Breeding,
    /// Animal offered for adoption by a shelter or a particular.
    Adoption,
}

/// Who may write the listing until a request is accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "user_id", rename_all = "snake_case")]
pub enum Owner {
    Particular(UserId),
    Shelter(UserId),
}

impl Owner {
    pub const fn user_id(self) -> UserId {
        match self {
            Owner::Particular(id) | Owner::Shelter(id) => id,
        }
    }

    pub fn is(self, actor: &Actor) -> bool {
        match self {
            Owner::Particular(id) => actor.role == Role::Particular && id == actor.user_id,
            Owner::Shelter(id) => actor.role == Role::Shelter && id == actor.user_id,
        }
    }
}

/// Outcome of the moderator's review of the listing documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    InRevision,
    Accepted,
    Rejected,
}

impl DocumentStatus {
    pub const fn label(self) -> &'static str {
        match self {
            DocumentStatus::InRevision => "In revision",
            DocumentStatus::Accepted => "Accepted",
            DocumentStatus::Rejected => "Rejected",
        }
    }
}

/// Negotiation and payment progress. Declaration order is the forward order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    InProgress,
    Offered,
    InPayment,
    AwaitingPayment,
    PayoutFailed,
    Completed,
}

impl TransactionStatus {
    pub const fn label(self) -> &'static str {
        match self {
            TransactionStatus::InProgress => "In progress",
            TransactionStatus::Offered => "Offered",
            TransactionStatus::InPayment => "In payment",
            TransactionStatus::AwaitingPayment => "Awaiting payment",
            TransactionStatus::PayoutFailed => "Payout failed",
            TransactionStatus::Completed => "Completed",
        }
    }

    /// Forward moves only, plus the canceled-authorization retry path.
    pub fn can_move_to(self, next: Self) -> bool {
        next > self
            || (self == TransactionStatus::AwaitingPayment && next == TransactionStatus::InPayment)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Favorite,
    Pending,
    Accepted,
    Rejected,
}

impl RequestStatus {
    pub const fn label(self) -> &'static str {
        match self {
            RequestStatus::Favorite => "Favorite",
            RequestStatus::Pending => "Pending",
            RequestStatus::Accepted => "Accepted",
            RequestStatus::Rejected => "Rejected",
        }
    }
}

/// Descriptive metadata; no workflow decision reads it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnimalDetails {
    pub species: Option<String>,
    pub breed: Option<String>,
    pub age_months: Option<u16>,
    pub genre: Option<String>,
    pub location: Option<String>,
    pub pedigree: Option<bool>,
}

/// Listing data supplied by the owner when registering a publication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicationDraft {
    pub kind: ListingKind,
    pub title: String,
    #[serde(default)]
    pub animal: AnimalDetails,
    #[serde(default)]
    pub price_cents: Option<u64>,
}

/// Listing row handed to the store for insertion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPublication {
    pub kind: ListingKind,
    pub owner: Owner,
    pub title: String,
    pub animal: AnimalDetails,
    pub price_cents: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Publication {
    pub id: PublicationId,
    pub kind: ListingKind,
    pub owner: Owner,
    pub title: String,
    pub animal: AnimalDetails,
    pub price_cents: Option<u64>,
    pub document_status: DocumentStatus,
    /// Unset until a moderator approves the listing.
    pub transaction_status: Option<TransactionStatus>,
    /// Processor reference of the most recent payment intent.
    pub payment_intent: Option<String>,
    /// Set while a charge is being created with the processor.
    pub charge_in_flight: bool,
    pub payout_in_flight: bool,
    pub created_at: DateTime<Utc>,
}

impl Publication {
    pub fn is_open_for_interest(&self) -> bool {
        self.document_status == DocumentStatus::Accepted
            && self.transaction_status == Some(TransactionStatus::InProgress)
    }

    /// Moves the transaction axis, refusing any step that would go backwards.
    pub fn advance(&mut self, next: TransactionStatus) -> Result<(), IllegalTransition> {
        match self.transaction_status {
            Some(current) if current == next => Ok(()),
            Some(current) if current.can_move_to(next) => {
                self.transaction_status = Some(next);
                Ok(())
            }
            None if next == TransactionStatus::InProgress => {
                self.transaction_status = Some(next);
                Ok(())
            }
            current => Err(IllegalTransition {
                publication_id: self.id,
                from: current,
                to: next,
            }),
        }
    }
}

/// Attempted transaction move that would break the forward ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("publication {publication_id} cannot move from {} to {}", .from.map_or("unset", TransactionStatus::label), .to.label())]
pub struct IllegalTransition {
    pub publication_id: PublicationId,
    pub from: Option<TransactionStatus>,
    pub to: TransactionStatus,
}

/// One particular's interest or bookmark on one publication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub publication_id: PublicationId,
    pub particular_id: UserId,
    pub status: RequestStatus,
    pub is_favorite: bool,
    pub created_at: DateTime<Utc>,
}

/// Request row handed to the store for insertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewRequest {
    pub publication_id: PublicationId,
    pub particular_id: UserId,
    pub status: RequestStatus,
    pub is_favorite: bool,
}

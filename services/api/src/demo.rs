use crate::infra::{
    seed_accounts, SandboxProcessor, DEMO_ADOPTER, DEMO_BREEDER, DEMO_MODERATOR, DEMO_RIVAL,
    DEMO_SHELTER,
};
use clap::Args;
use linkedpet::config::{ConfigError, PaymentConfig};
use linkedpet::error::AppError;
use linkedpet::marketplace::{
    AnimalDetails, ListingKind, MarketplaceService, MemoryStore, OfferSearch, PaymentStatus,
    Publication, PublicationDraft, ReviewDecision, TransactionStatus, WorkflowError,
};
use std::sync::Arc;

#[derive(Args, Debug)]
pub(crate) struct DemoArgs {
    /// Card token handed to the sandbox processor (tok_visa, tok_3ds, tok_decline, tok_offline)
    #[arg(long, default_value = "tok_visa")]
    pub(crate) card_token: String,
    /// Asking price of the breeding listing, in cents
    #[arg(long, default_value_t = 40_000)]
    pub(crate) price_cents: u64,
    /// Override the platform fee withheld from the payout, in basis points
    #[arg(long)]
    pub(crate) fee_bps: Option<u32>,
    /// List a free shelter adoption instead of a breeding sale
    #[arg(long)]
    pub(crate) adoption: bool,
}

type DemoService = MarketplaceService<MemoryStore, SandboxProcessor>;

pub(crate) fn run_demo(args: DemoArgs) -> Result<(), AppError> {
    let DemoArgs {
        card_token,
        price_cents,
        fee_bps,
        adoption,
    } = args;

    let mut payments = PaymentConfig::default();
    if let Some(bps) = fee_bps {
        if bps > 10_000 {
            return Err(ConfigError::InvalidPlatformFee.into());
        }
        payments.platform_fee_bps = bps;
    }

    let store = Arc::new(MemoryStore::default());
    seed_accounts(&store).map_err(|err| AppError::Workflow(err.into()))?;
    let service = MarketplaceService::new(store, Arc::new(SandboxProcessor::default()), payments);

    println!("LinkedPet marketplace demo");

    let (owner, draft) = if adoption {
        (
            DEMO_SHELTER,
            PublicationDraft {
                kind: ListingKind::Adoption,
                title: "Senior greyhound looking for a sofa".to_string(),
                animal: AnimalDetails {
                    species: Some("dog".to_string()),
                    breed: Some("greyhound".to_string()),
                    age_months: Some(96),
                    ..AnimalDetails::default()
                },
                price_cents: None,
            },
        )
    } else {
        (
            DEMO_BREEDER,
            PublicationDraft {
                kind: ListingKind::Breeding,
                title: "Border collie puppy".to_string(),
                animal: AnimalDetails {
                    species: Some("dog".to_string()),
                    breed: Some("border collie".to_string()),
                    age_months: Some(3),
                    pedigree: Some(true),
                    ..AnimalDetails::default()
                },
                price_cents: Some(price_cents),
            },
        )
    };

    let listing = service.create_publication(&owner, draft)?;
    print_listing("Registered", &listing, &service);

    let listing =
        service.review_publication(&DEMO_MODERATOR, listing.id, ReviewDecision::Accept)?;
    print_listing("Approved", &listing, &service);
    println!(
        "  Offers visible to the adopter: {}",
        service
            .available_offers(&DEMO_ADOPTER, &OfferSearch::default())?
            .len()
    );

    let chosen = service.express_interest(&DEMO_ADOPTER, listing.id)?;
    let rival = service.express_interest(&DEMO_RIVAL, listing.id)?;
    println!(
        "\nInterest: request #{} (adopter) and #{} (rival) pending",
        chosen.id, rival.id
    );

    let listing = service.start_negotiation(&owner, listing.id)?;
    print_listing("Negotiating", &listing, &service);

    let outcome = service.accept_request(&owner, chosen.id, listing.id)?;
    println!(
        "  Accepted request #{}; rejected {:?}",
        outcome.accepted.id,
        outcome
            .rejected
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
    );
    print_listing("Accepted", &outcome.publication, &service);

    let payment = service.initiate_payment(&DEMO_ADOPTER, listing.id, &card_token);
    let payment = match payment {
        Ok(payment) => payment,
        Err(WorkflowError::UpstreamFailure(reason)) => {
            println!("\nPayment could not reach the processor: {reason}");
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };

    match payment.processor_status() {
        None => println!("\nNothing to charge for this listing"),
        Some(PaymentStatus::Succeeded) => println!("\nCard charged on the first attempt"),
        Some(PaymentStatus::RequiresAction) => {
            let reference = payment
                .intent
                .as_ref()
                .map(|intent| intent.id.clone())
                .unwrap_or_default();
            println!("\nProcessor asked for an interactive step on {reference}; confirming");
            service.confirm_payment(&DEMO_ADOPTER, listing.id, &reference)?;
        }
        Some(other) => {
            println!(
                "\nPayment stopped with status '{}'; the adopter must try another card",
                other.as_str()
            );
            return Ok(());
        }
    }

    let payout = service.release_payout(&owner, listing.id)?;
    println!(
        "Payout released: {} of {}",
        money(payout.amount_cents, &service),
        money(payout.publication.price_cents.unwrap_or(0), &service)
    );
    print_listing("Final", &payout.publication, &service);

    if payout.publication.transaction_status == Some(TransactionStatus::Completed) {
        println!("\nRequests held by the adopter:");
        for request in service.my_requests(&DEMO_ADOPTER)? {
            println!(
                "  - #{} on listing #{}: {}",
                request.id,
                request.publication_id,
                request.status.label()
            );
        }
    }

    Ok(())
}

fn print_listing(step: &str, listing: &Publication, service: &DemoService) {
    println!(
        "\n{step}: listing #{} \"{}\"\n  Documents: {}\n  Transaction: {}\n  Price: {}",
        listing.id,
        listing.title,
        listing.document_status.label(),
        listing
            .transaction_status
            .map_or("not open", TransactionStatus::label),
        listing
            .price_cents
            .map_or_else(|| "free".to_string(), |cents| money(cents, service))
    );
}

fn money(cents: u64, service: &DemoService) -> String {
    format!(
        "{}.{:02} {}",
        cents / 100,
        cents % 100,
        service.payments().currency.to_uppercase()
    )
}

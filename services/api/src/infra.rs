use linkedpet::marketplace::{
    Account, Actor, MemoryStore, PaymentIntent, PaymentProcessor, PaymentStatus, PayoutReceipt,
    ProcessorError, StoreError,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
}

pub(crate) const DEMO_BREEDER: Actor = Actor::particular(1);
pub(crate) const DEMO_ADOPTER: Actor = Actor::particular(2);
pub(crate) const DEMO_RIVAL: Actor = Actor::particular(3);
pub(crate) const DEMO_SHELTER: Actor = Actor::shelter(5);
pub(crate) const DEMO_MODERATOR: Actor = Actor::moderator(9);

/// Directory used by the in-process service until a user service is wired in.
pub(crate) fn seed_accounts(store: &MemoryStore) -> Result<(), StoreError> {
    let directory = [
        (DEMO_BREEDER, "Marta Ruiz", "marta@example.com"),
        (DEMO_ADOPTER, "Jon Etxeberria", "jon@example.com"),
        (DEMO_RIVAL, "Ane Goikoetxea", "ane@example.com"),
        (DEMO_SHELTER, "Refugio Norte", "payouts@refugio-norte.org"),
        (DEMO_MODERATOR, "Moderation desk", "moderation@example.com"),
    ];
    for (actor, display_name, email) in directory {
        store.register_account(Account {
            user_id: actor.user_id,
            role: actor.role,
            display_name: display_name.to_string(),
            email: email.to_string(),
        })?;
    }
    Ok(())
}

/// Offline stand-in for the card processor, keyed on well-known test tokens:
///
/// - `tok_3ds` asks for an interactive step that completes on the next lookup
/// - `tok_decline` needs a different payment method
/// - `tok_offline` fails as if the processor were unreachable
/// - anything else succeeds
///
/// Payouts to `.invalid` addresses are refused.
#[derive(Default)]
pub(crate) struct SandboxProcessor {
    intents: Mutex<HashMap<String, PaymentIntent>>,
    sequence: AtomicU64,
}

impl SandboxProcessor {
    fn intents(&self) -> Result<MutexGuard<'_, HashMap<String, PaymentIntent>>, ProcessorError> {
        self.intents
            .lock()
            .map_err(|_| ProcessorError::Unreachable("sandbox state poisoned".to_string()))
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{prefix}_{:06}", self.sequence.fetch_add(1, Ordering::Relaxed) + 1)
    }
}

impl PaymentProcessor for SandboxProcessor {
    fn create_payment_method(&self, token: &str) -> Result<String, ProcessorError> {
        if token.trim().is_empty() {
            return Err(ProcessorError::Refused("empty card token".to_string()));
        }
        Ok(format!("pm_{}", token.trim()))
    }

    fn create_payment_intent(
        &self,
        amount_cents: u64,
        currency: &str,
        payment_method: &str,
        return_url: &str,
    ) -> Result<PaymentIntent, ProcessorError> {
        let status = match payment_method {
            "pm_tok_offline" => {
                return Err(ProcessorError::Unreachable(
                    "sandbox simulated outage".to_string(),
                ))
            }
            "pm_tok_3ds" => PaymentStatus::RequiresAction,
            "pm_tok_decline" => PaymentStatus::RequiresPaymentMethod,
            _ => PaymentStatus::Succeeded,
        };
        let intent = PaymentIntent {
            id: self.next_id("pi"),
            amount_cents,
            currency: currency.to_string(),
            status,
        };
        debug!(intent = %intent.id, amount_cents, return_url, "sandbox intent created");
        self.intents()?.insert(intent.id.clone(), intent.clone());
        Ok(intent)
    }

    fn retrieve_payment_intent(&self, intent_id: &str) -> Result<PaymentIntent, ProcessorError> {
        let mut intents = self.intents()?;
        let intent = intents
            .get_mut(intent_id)
            .ok_or_else(|| ProcessorError::Refused(format!("no such intent: {intent_id}")))?;
        if intent.status == PaymentStatus::RequiresAction {
            intent.status = PaymentStatus::Succeeded;
        }
        Ok(intent.clone())
    }

    fn payout(
        &self,
        amount_cents: u64,
        currency: &str,
        recipient: &str,
    ) -> Result<PayoutReceipt, ProcessorError> {
        if recipient.ends_with(".invalid") {
            return Err(ProcessorError::Refused(format!(
                "recipient {recipient} cannot receive payouts"
            )));
        }
        debug!(amount_cents, currency, recipient, "sandbox payout sent");
        Ok(PayoutReceipt {
            batch_id: self.next_id("batch"),
            status: PaymentStatus::Succeeded,
        })
    }
}

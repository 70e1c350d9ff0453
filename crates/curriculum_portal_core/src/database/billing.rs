//! Payment audit log and enterprise contact requests.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use super::{decode_listing, to_document, Collections, DatabaseService};
use crate::domain::{EnterpriseContact, Identified, PaymentAction, PaymentLog};
use crate::ports::PortResult;

/// A Stripe event folded into the payment log entry of a Checkout session.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutUpdate {
    pub session_id: String,
    pub livemode: bool,
    pub event_type: String,
    pub status: String,
    pub at: DateTime<Utc>,
    pub payment_intent_id: Option<String>,
    pub purchase_type: Option<String>,
    pub user_id: Option<String>,
    pub module_id: Option<String>,
    /// Cents.
    pub amount: Option<i64>,
    pub currency: Option<String>,
}

impl CheckoutUpdate {
    fn apply(self, entry: &mut PaymentLog) {
        entry.status = self.status;
        entry.checkout_session_id = Some(self.session_id);
        entry.last_event_type = Some(self.event_type.clone());
        entry.payment_intent_id = self.payment_intent_id.or(entry.payment_intent_id.take());
        entry.purchase_type = self.purchase_type.or(entry.purchase_type.take());
        entry.user_id = self.user_id.or(entry.user_id.take());
        entry.module_id = self.module_id.or(entry.module_id.take());
        entry.amount = self.amount.or(entry.amount);
        entry.currency = self.currency.or(entry.currency.take());
        match self.event_type.as_str() {
            "checkout.session.completed" => entry.completed_at = Some(self.at),
            _ => entry.paid_at = Some(self.at),
        }
    }
}

impl DatabaseService {
    /// Writes a payment log entry under a caller-chosen id, replacing any
    /// earlier entry with that id.
    pub async fn put_payment_log(&self, id: &str, entry: &PaymentLog) -> PortResult<()> {
        self.store
            .set(&self.collections.payment_logs(), id, to_document(entry)?)
            .await?;
        debug!(log_id = id, action = ?entry.action, status = %entry.status, "Recorded payment log");
        Ok(())
    }

    /// Merges a webhook event into the entry keyed by its Checkout session id,
    /// creating the entry when the session was started elsewhere. Fields the
    /// event does not carry keep their stored values.
    pub async fn merge_checkout_log(&self, update: CheckoutUpdate) -> PortResult<()> {
        let collection = Collections::payment_logs_for_livemode(update.livemode);
        let session_id = update.session_id.clone();
        let existing = self.store.get(&collection, &session_id).await?;

        let (mut data, mut entry) = match existing {
            Some(doc) => match doc.decode::<PaymentLog>() {
                Ok(entry) => (doc.data, entry),
                Err(e) => {
                    warn!(collection = %collection, session_id = %session_id, error = %e, "Replacing unreadable checkout log");
                    (doc.data, Self::fresh_checkout_log(&update))
                }
            },
            None => (Default::default(), Self::fresh_checkout_log(&update)),
        };
        let event_type = update.event_type.clone();
        update.apply(&mut entry);
        data.extend(to_document(&entry)?);

        self.store.set(&collection, &session_id, data).await?;
        info!(collection = %collection, session_id = %session_id, event_type = %event_type, "Updated checkout payment log");
        Ok(())
    }

    fn fresh_checkout_log(update: &CheckoutUpdate) -> PaymentLog {
        let mut entry = PaymentLog::new(update.user_id.clone(), PaymentAction::CheckoutSessionCompleted, &update.status);
        entry.timestamp = update.at;
        entry
    }

    /// Appends an entry to the payment log and returns its id.
    pub async fn append_payment_log(&self, entry: &PaymentLog) -> PortResult<String> {
        let stored = self
            .store
            .add(&self.collections.payment_logs(), to_document(entry)?)
            .await?;
        debug!(log_id = %stored.id, action = ?entry.action, status = %entry.status, "Recorded payment log");
        Ok(stored.id)
    }

    /// Like `append_payment_log`, but a failure is only logged. Used where the
    /// audit entry must not undo an operation that already succeeded.
    pub async fn record_payment_log(&self, entry: PaymentLog) {
        if let Err(e) = self.append_payment_log(&entry).await {
            error!(error = %e, action = ?entry.action, "Failed to write payment log");
        }
    }

    /// The caller's most recent payment log entries, newest first.
    pub async fn payment_history(&self, uid: &str, limit: usize) -> PortResult<Vec<Identified<PaymentLog>>> {
        let collection = self.collections.payment_logs();
        let docs = self.store.find_by(&collection, "userId", &Value::from(uid)).await?;
        let logs = decode_listing(&collection, docs);
        Ok(newest_first(logs, limit))
    }

    /// The most recent payment log entries across all users.
    pub async fn recent_payment_logs(&self, limit: usize) -> PortResult<Vec<Identified<PaymentLog>>> {
        let collection = self.collections.payment_logs();
        let docs = self.store.list(&collection).await?;
        let logs = decode_listing(&collection, docs);
        Ok(newest_first(logs, limit))
    }

    pub async fn add_enterprise_contact(&self, contact: &EnterpriseContact) -> PortResult<String> {
        let stored = self
            .store
            .add(&self.collections.enterprise_contacts(), to_document(contact)?)
            .await?;
        debug!(contact_id = %stored.id, user_id = %contact.user_id, "Stored enterprise contact request");
        Ok(stored.id)
    }
}

fn newest_first(mut logs: Vec<Identified<PaymentLog>>, limit: usize) -> Vec<Identified<PaymentLog>> {
    logs.sort_by(|a, b| b.doc.timestamp.cmp(&a.doc.timestamp));
    logs.truncate(limit);
    logs
}

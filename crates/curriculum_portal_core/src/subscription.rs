//! crates/curriculum_portal_core/src/subscription.rs
//!
//! Subscription state transitions. Each function validates the caller's current
//! profile and produces the field patch to merge into it; the handlers decide
//! when to write the patch and which audit entry goes with it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::database::timestamp_value;
use crate::domain::{Role, SubscriptionPlan, SubscriptionStatus, UserProfile};
use crate::ports::{DocumentData, PortError, PortResult};

/// What `GET /subscription/status` reports.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionSummary {
    pub subscription_type: SubscriptionPlan,
    pub subscription_status: SubscriptionStatus,
    pub subscription_end_date: Option<DateTime<Utc>>,
    pub can_upgrade: bool,
}

impl SubscriptionSummary {
    pub fn of(profile: &UserProfile) -> Self {
        let plan = profile.plan();
        Self {
            subscription_type: plan,
            subscription_status: profile.status(),
            subscription_end_date: profile.subscription_end_date,
            can_upgrade: plan.can_upgrade(),
        }
    }
}

/// How an upgrade was paid for, recorded on the profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentReference {
    StripeIntent(String),
    Demo(String),
}

/// Parses a plan the caller asked to move to. Only paid plans qualify.
pub fn parse_target_plan(raw: Option<&str>, message: &str) -> PortResult<SubscriptionPlan> {
    raw.and_then(|p| p.parse::<SubscriptionPlan>().ok())
        .filter(|p| p.is_upgrade_target())
        .ok_or_else(|| PortError::InvalidInput(message.to_string()))
}

pub fn upgrade_session_id(uid: &str, at: DateTime<Utc>) -> String {
    format!("upgrade_{}_{}", uid, at.timestamp_millis())
}

/// Moves a profile onto `plan`, granting the plan's role and, for premium
/// plans, a calendar term ending one month or one year from `now`.
pub fn upgrade_patch(
    profile: &UserProfile,
    plan: SubscriptionPlan,
    now: DateTime<Utc>,
    payment: Option<PaymentReference>,
) -> DocumentData {
    let role = plan.granted_role().unwrap_or_else(|| profile.effective_role());

    let mut patch = DocumentData::new();
    patch.insert("subscriptionType".into(), Value::from(plan.as_str()));
    patch.insert("subscriptionStatus".into(), Value::from("active"));
    patch.insert("subscriptionStartDate".into(), timestamp_value(now));
    patch.insert("lastUpdated".into(), timestamp_value(now));
    patch.insert("role".into(), Value::from(role.as_str()));

    if let Some(end) = plan.term_end(now) {
        patch.insert("subscriptionEndDate".into(), timestamp_value(end));
        match payment {
            Some(PaymentReference::StripeIntent(id)) => {
                patch.insert("stripePaymentIntentId".into(), Value::from(id));
            }
            Some(PaymentReference::Demo(reference)) => {
                patch.insert("paymentReference".into(), Value::from(reference));
            }
            None => {}
        }
    }
    patch
}

/// Rejects cancellation of the free plan.
pub fn ensure_cancellable(profile: &UserProfile) -> PortResult<SubscriptionPlan> {
    match profile.plan() {
        SubscriptionPlan::Basic => Err(PortError::InvalidInput(
            "Cannot cancel basic subscription".to_string(),
        )),
        plan => Ok(plan),
    }
}

/// The recurring Stripe subscription to cancel alongside a downgrade, if any.
pub fn stripe_subscription_to_cancel(profile: &UserProfile) -> Option<&str> {
    profile
        .stripe_subscription_id
        .as_deref()
        .filter(|_| profile.plan().is_premium())
}

/// Downgrades to the basic plan immediately.
pub fn cancellation_patch(now: DateTime<Utc>, reason: Option<&str>, feedback: Option<&str>) -> DocumentData {
    let optional = |v: Option<&str>| v.map(Value::from).unwrap_or(Value::Null);

    let mut patch = DocumentData::new();
    patch.insert("subscriptionType".into(), Value::from(SubscriptionPlan::Basic.as_str()));
    patch.insert("subscriptionStatus".into(), Value::from("cancelled"));
    patch.insert("subscriptionEndDate".into(), timestamp_value(now));
    patch.insert("cancelledAt".into(), timestamp_value(now));
    patch.insert("cancellationReason".into(), optional(reason));
    patch.insert("cancellationFeedback".into(), optional(feedback));
    patch.insert("lastUpdated".into(), timestamp_value(now));
    patch.insert("role".into(), Value::from(Role::TeacherDefault.as_str()));
    patch
}

pub fn ensure_reactivatable(profile: &UserProfile) -> PortResult<()> {
    if profile.status() == SubscriptionStatus::Cancelled {
        Ok(())
    } else {
        Err(PortError::InvalidInput("Subscription is not cancelled".to_string()))
    }
}

pub fn reactivation_patch(now: DateTime<Utc>) -> DocumentData {
    let mut patch = DocumentData::new();
    patch.insert("subscriptionStatus".into(), Value::from("active"));
    patch.insert("reactivatedAt".into(), timestamp_value(now));
    patch.insert("lastUpdated".into(), timestamp_value(now));
    patch
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 31, 9, 30, 0).unwrap()
    }

    #[test]
    fn only_paid_plans_are_upgrade_targets() {
        assert_eq!(
            parse_target_plan(Some("premiumYearly"), "Invalid target plan").unwrap(),
            SubscriptionPlan::PremiumYearly
        );
        for bad in [None, Some("basic"), Some("gold")] {
            assert_eq!(
                parse_target_plan(bad, "Invalid target plan").unwrap_err(),
                PortError::InvalidInput("Invalid target plan".into())
            );
        }
    }

    #[test]
    fn premium_upgrade_grants_plus_role_and_a_month() {
        let patch = upgrade_patch(
            &UserProfile::default(),
            SubscriptionPlan::Premium,
            now(),
            Some(PaymentReference::StripeIntent("pi_1".into())),
        );
        assert_eq!(patch["role"], "teacherPlus");
        assert_eq!(patch["subscriptionType"], "premium");
        assert_eq!(patch["subscriptionEndDate"], "2024-04-30T09:30:00.000Z");
        assert_eq!(patch["stripePaymentIntentId"], "pi_1");
    }

    #[test]
    fn enterprise_upgrade_has_no_term() {
        let patch = upgrade_patch(
            &UserProfile::default(),
            SubscriptionPlan::Enterprise,
            now(),
            Some(PaymentReference::Demo("demo".into())),
        );
        assert_eq!(patch["role"], "teacherEnterprise");
        assert!(!patch.contains_key("subscriptionEndDate"));
        assert!(!patch.contains_key("paymentReference"));
    }

    #[test]
    fn cancellation_rules() {
        let basic = UserProfile::default();
        assert!(ensure_cancellable(&basic).is_err());

        let premium = UserProfile {
            subscription_type: Some(SubscriptionPlan::Premium),
            stripe_subscription_id: Some("sub_1".into()),
            ..Default::default()
        };
        assert_eq!(ensure_cancellable(&premium).unwrap(), SubscriptionPlan::Premium);
        assert_eq!(stripe_subscription_to_cancel(&premium), Some("sub_1"));

        let patch = cancellation_patch(now(), Some("too expensive"), None);
        assert_eq!(patch["role"], "teacherDefault");
        assert_eq!(patch["subscriptionStatus"], "cancelled");
        assert_eq!(patch["cancellationFeedback"], Value::Null);
    }

    #[test]
    fn reactivation_requires_cancelled_status() {
        let active = UserProfile::default();
        assert!(ensure_reactivatable(&active).is_err());
        let cancelled = UserProfile {
            subscription_status: Some(SubscriptionStatus::Cancelled),
            ..Default::default()
        };
        assert!(ensure_reactivatable(&cancelled).is_ok());
    }

    #[test]
    fn summary_reports_upgrade_eligibility() {
        let summary = SubscriptionSummary::of(&UserProfile {
            subscription_type: Some(SubscriptionPlan::Enterprise),
            ..Default::default()
        });
        assert!(!summary.can_upgrade);
        assert!(SubscriptionSummary::of(&UserProfile::default()).can_upgrade);
    }
}

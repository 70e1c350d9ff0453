//! crates/curriculum_portal_core/src/domain.rs
//!
//! Defines the core data structures for the portal: content nuggets, lesson
//! plans, modules, user profiles and the billing records written alongside
//! subscription changes.
//!
//! Documents are stored as loose JSON, so every struct keeps unknown fields in
//! an `extra` map and reads the handful of fields the old web client wrote in
//! inconsistent shapes (a string where a list was expected, `"true"` for a
//! boolean) leniently.

use chrono::{DateTime, Months, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

use crate::ports::PortError;

//=========================================================================================
// Roles and Subscription Plans
//=========================================================================================

/// The role label stored on a user profile.
///
/// Labels this build does not know about are preserved verbatim in `Other`
/// so that they survive a read/write cycle; they never satisfy a role gate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Role {
    #[default]
    TeacherDefault,
    TeacherPlus,
    TeacherEnterprise,
    Admin,
    Student,
    Other(String),
}

impl Role {
    pub fn as_str(&self) -> &str {
        match self {
            Role::TeacherDefault => "teacherDefault",
            Role::TeacherPlus => "teacherPlus",
            Role::TeacherEnterprise => "teacherEnterprise",
            Role::Admin => "admin",
            Role::Student => "student",
            Role::Other(label) => label,
        }
    }

    /// Any of the three teacher subscription tiers.
    pub fn is_teacher(&self) -> bool {
        matches!(
            self,
            Role::TeacherDefault | Role::TeacherPlus | Role::TeacherEnterprise
        )
    }

    /// Roles a user may pick for themselves when registering.
    pub fn is_self_assignable(&self) -> bool {
        matches!(self, Role::TeacherDefault | Role::Student)
    }
}

impl From<String> for Role {
    fn from(label: String) -> Self {
        match label.as_str() {
            "teacherDefault" => Role::TeacherDefault,
            "teacherPlus" => Role::TeacherPlus,
            "teacherEnterprise" => Role::TeacherEnterprise,
            "admin" => Role::Admin,
            "student" => Role::Student,
            _ => Role::Other(label),
        }
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        role.as_str().to_string()
    }
}

impl FromStr for Role {
    type Err = PortError;

    /// Strict parse used for input validation: unknown labels are rejected.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match Role::from(s.trim().to_string()) {
            Role::Other(label) => Err(PortError::InvalidInput(format!(
                "Invalid role '{label}'. Valid roles: teacherDefault, teacherPlus, teacherEnterprise, admin, student"
            ))),
            role => Ok(role),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A subscription tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SubscriptionPlan {
    #[default]
    Basic,
    Premium,
    PremiumYearly,
    Enterprise,
}

impl SubscriptionPlan {
    pub const fn as_str(self) -> &'static str {
        match self {
            SubscriptionPlan::Basic => "basic",
            SubscriptionPlan::Premium => "premium",
            SubscriptionPlan::PremiumYearly => "premiumYearly",
            SubscriptionPlan::Enterprise => "enterprise",
        }
    }

    /// Plans a user can move to through the upgrade endpoints.
    pub const fn is_upgrade_target(self) -> bool {
        !matches!(self, SubscriptionPlan::Basic)
    }

    /// Users on a paid plan have nothing left to upgrade to.
    pub const fn can_upgrade(self) -> bool {
        matches!(self, SubscriptionPlan::Basic)
    }

    pub const fn is_premium(self) -> bool {
        matches!(self, SubscriptionPlan::Premium | SubscriptionPlan::PremiumYearly)
    }

    /// The role a user holds while on this plan, if the plan implies one.
    pub fn granted_role(self) -> Option<Role> {
        match self {
            SubscriptionPlan::Premium | SubscriptionPlan::PremiumYearly => Some(Role::TeacherPlus),
            SubscriptionPlan::Enterprise => Some(Role::TeacherEnterprise),
            SubscriptionPlan::Basic => None,
        }
    }

    /// Calendar end of a billing term starting at `start`. Enterprise and basic
    /// plans are open-ended.
    pub fn term_end(self, start: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let months = match self {
            SubscriptionPlan::Premium => 1,
            SubscriptionPlan::PremiumYearly => 12,
            SubscriptionPlan::Basic | SubscriptionPlan::Enterprise => return None,
        };
        start.checked_add_months(Months::new(months))
    }
}

impl FromStr for SubscriptionPlan {
    type Err = PortError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "basic" => Ok(SubscriptionPlan::Basic),
            "premium" => Ok(SubscriptionPlan::Premium),
            "premiumYearly" => Ok(SubscriptionPlan::PremiumYearly),
            "enterprise" => Ok(SubscriptionPlan::Enterprise),
            other => Err(PortError::InvalidInput(format!("Unknown plan '{other}'"))),
        }
    }
}

impl fmt::Display for SubscriptionPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionStatus {
    #[default]
    Active,
    Cancelled,
}

//=========================================================================================
// User Profiles
//=========================================================================================

/// A user profile document from `teachers`, `students` or `users`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub institution: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_type: Option<SubscriptionPlan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_status: Option<SubscriptionStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_start_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_end_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stripe_payment_intent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stripe_customer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stripe_subscription_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    /// Everything else the client stored (names, job title, subjects, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UserProfile {
    /// The effective role; profiles without one are treated as basic teachers.
    pub fn effective_role(&self) -> Role {
        self.role.clone().unwrap_or_default()
    }

    pub fn plan(&self) -> SubscriptionPlan {
        self.subscription_type.unwrap_or_default()
    }

    pub fn status(&self) -> SubscriptionStatus {
        self.subscription_status.unwrap_or_default()
    }
}

//=========================================================================================
// Curriculum Documents
//=========================================================================================

/// A reusable unit of content ("nugget") that lesson sections embed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Nugget {
    #[serde(rename = "Title", default)]
    pub title: String,
    #[serde(rename = "Category", default)]
    pub category: Labels,
    #[serde(rename = "Type", default)]
    pub kind: Labels,
    #[serde(rename = "Level", default)]
    pub level: Labels,
    #[serde(
        rename = "Duration",
        default,
        deserialize_with = "lenient::opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub duration: Option<String>,
    #[serde(rename = "Abstract", default, skip_serializing_if = "Option::is_none")]
    pub abstract_html: Option<String>,
    #[serde(rename = "Instructions", default, skip_serializing_if = "Option::is_none")]
    pub instructions_html: Option<String>,
    #[serde(rename = "Author", default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(rename = "fileUrl", default, skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    #[serde(rename = "isPublic", default, deserialize_with = "lenient::bool")]
    pub is_public: bool,
    #[serde(rename = "UnitID", default, skip_serializing_if = "Option::is_none")]
    pub unit_id: Option<String>,
    #[serde(rename = "createdAt", default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(rename = "LastModified", default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Classification labels (level, category, type).
///
/// Older documents store a single string where newer ones store a list; the
/// shape that was read is the shape written back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Labels {
    One(String),
    Many(Vec<String>),
}

impl Labels {
    pub fn as_slice(&self) -> &[String] {
        match self {
            Labels::One(label) => std::slice::from_ref(label),
            Labels::Many(labels) => labels,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.as_slice().is_empty()
    }

    pub fn contains(&self, label: &str) -> bool {
        self.as_slice().iter().any(|l| l == label)
    }
}

impl Default for Labels {
    fn default() -> Self {
        Labels::Many(Vec::new())
    }
}

impl From<Vec<String>> for Labels {
    fn from(labels: Vec<String>) -> Self {
        Labels::Many(labels)
    }
}

impl From<&str> for Labels {
    fn from(label: &str) -> Self {
        Labels::One(label.to_string())
    }
}

impl<'de> Deserialize<'de> for Labels {
    /// Accepts a list of strings, a single string or number, or null.
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Array(items) => {
                Labels::Many(items.into_iter().filter_map(lenient::scalar_to_string).collect())
            }
            other => match lenient::scalar_to_string(other) {
                Some(label) => Labels::One(label),
                None => Labels::default(),
            },
        })
    }
}

/// One section of a lesson plan: an introduction plus the nuggets it uses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Section {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default)]
    pub intro: String,
    #[serde(default)]
    pub content_ids: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lesson {
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default)]
    pub level: Labels,
    #[serde(default)]
    pub category: Labels,
    #[serde(rename = "type", default)]
    pub kind: Labels,
    #[serde(
        default,
        deserialize_with = "lenient::opt_string",
        skip_serializing_if = "Option::is_none"
    )]
    pub duration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub objectives: Vec<String>,
    #[serde(default)]
    pub sections: Vec<Section>,
    #[serde(default, alias = "author", skip_serializing_if = "Option::is_none")]
    pub author_id: Option<String>,
    #[serde(default, deserialize_with = "lenient::bool")]
    pub is_draft: bool,
    #[serde(default, deserialize_with = "lenient::bool")]
    pub is_public: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Lesson {
    /// Every nugget id referenced by any section, in section order.
    pub fn content_ids(&self) -> impl Iterator<Item = &str> {
        self.sections
            .iter()
            .flat_map(|s| s.content_ids.iter().map(String::as_str))
    }

    pub fn references_content(&self, content_id: &str) -> bool {
        self.content_ids().any(|id| id == content_id)
    }
}

/// A named grouping of lesson plans shown to end users.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Module {
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub lesson_plans: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default)]
    pub category: Labels,
    #[serde(rename = "type", default)]
    pub kind: Labels,
    #[serde(default)]
    pub level: Labels,
    #[serde(default, deserialize_with = "lenient::bool")]
    pub is_draft: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Module {
    /// The purchase price in dollars, read from `price` or the legacy `Price`.
    /// Free modules, and prices that do not parse, yield `None`.
    pub fn price(&self) -> Option<f64> {
        let raw = self.extra.get("price").or_else(|| self.extra.get("Price"))?;
        let price = match raw {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }?;
        (price.is_finite() && price > 0.0).then_some(price)
    }

    /// The display title, falling back to the legacy `Title` field.
    pub fn display_title(&self) -> Option<&str> {
        Some(self.title.trim())
            .filter(|t| !t.is_empty())
            .or_else(|| self.extra.get("Title").and_then(Value::as_str))
    }
}

/// A stored document together with its id, serialized as `{ "id": ..., ...fields }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identified<T> {
    pub id: String,
    #[serde(flatten)]
    pub doc: T,
}

//=========================================================================================
// Billing Records
//=========================================================================================

/// What happened, as recorded in the payment log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentAction {
    UpgradeInitiated,
    UpgradeCompleted,
    EnterpriseContactRequested,
    SubscriptionCancelled,
    SubscriptionReactivated,
    PaymentProcessed,
    PaymentIntentCreated,
    PaymentIntentError,
    PaymentConfirmed,
    PaymentConfirmationError,
    WebhookPaymentSucceeded,
    WebhookPaymentFailed,
    ModuleCheckoutSessionCreated,
    CheckoutSessionCompleted,
}

/// An append-only audit entry for anything touching a user's subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentLog {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub action: PaymentAction,
    pub status: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_plan: Option<SubscriptionPlan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_plan: Option<SubscriptionPlan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_intent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade_session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub currency: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub billing_cycle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payment_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkout_session_id: Option<String>,
    /// `"module"` for one-off module purchases.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purchase_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_title: Option<String>,
    /// The Stripe event (or local step) that last touched this entry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl PaymentLog {
    pub fn new(user_id: Option<String>, action: PaymentAction, status: &str) -> Self {
        Self {
            user_id,
            action,
            status: status.to_string(),
            timestamp: Utc::now(),
            from_plan: None,
            to_plan: None,
            payment_intent_id: None,
            upgrade_session_id: None,
            amount: None,
            currency: None,
            billing_cycle: None,
            payment_method: None,
            reason: None,
            feedback: None,
            error: None,
            user_email: None,
            checkout_session_id: None,
            purchase_type: None,
            module_id: None,
            module_title: None,
            last_event_type: None,
            paid_at: None,
            completed_at: None,
        }
    }

    pub fn plans(mut self, from: SubscriptionPlan, to: SubscriptionPlan) -> Self {
        self.from_plan = Some(from);
        self.to_plan = Some(to);
        self
    }

    pub fn email(mut self, email: Option<String>) -> Self {
        self.user_email = email;
        self
    }
}

/// A request from a user to be contacted about an enterprise plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnterpriseContact {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub institution: Option<String>,
    pub message: String,
    pub contact_preference: String,
    pub timestamp: DateTime<Utc>,
    pub status: String,
}

//=========================================================================================
// Lenient Field Readers
//=========================================================================================

mod lenient {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    /// Accepts a string or a number; empty strings become `None`.
    pub fn opt_string<'de, D: Deserializer<'de>>(d: D) -> Result<Option<String>, D::Error> {
        Ok(scalar_to_string(Value::deserialize(d)?).filter(|s| !s.trim().is_empty()))
    }

    /// Accepts booleans and their `"true"`/`"false"` spellings; anything else is false.
    pub fn bool<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
        Ok(match Value::deserialize(d)? {
            Value::Bool(b) => b,
            Value::String(s) => s.eq_ignore_ascii_case("true"),
            _ => false,
        })
    }

    pub(super) fn scalar_to_string(value: Value) -> Option<String> {
        match value {
            Value::String(s) => Some(s),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }
}

pub mod access;
pub mod auth_flow;
pub mod database;
pub mod domain;
pub mod ports;
pub mod subscription;

pub use access::{authorize, AccessDenied, CallerProfile, RoleRequirement};
pub use database::{Collections, DatabaseInfo, DatabaseService};
pub use domain::{
    EnterpriseContact, Identified, Labels, Lesson, Module, Nugget, PaymentAction, PaymentLog, Role, Section,
    SubscriptionPlan, SubscriptionStatus, UserProfile,
};
pub use ports::{
    AccountDirectory, DocumentData, DocumentStore, PaymentService, PortError, PortResult, PostAuthStore,
    RegistrationClient, StoredDocument, TokenVerifier, VerifiedIdentity,
};

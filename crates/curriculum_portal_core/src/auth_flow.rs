//! crates/curriculum_portal_core/src/auth_flow.rs
//!
//! Continuation of a Google sign-in that left the app through a redirect.
//!
//! Before leaving, the client records where to return to and, optionally, an
//! action to finish once the user is back (registering a new account). On
//! return, `PostAuthFlow::handle_redirect_result` consumes both entries and
//! decides where to navigate.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, warn};

use crate::domain::Role;
use crate::ports::{AccountDirectory, PostAuthStore, RegistrationClient};

pub const RETURN_TO_KEY: &str = "diya_auth:returnTo";
pub const ACTION_KEY: &str = "diya_auth:action";

const SIGN_UP_POPUP_PARAM: &str = "showSignUpPopup";

/// Work to finish after the identity provider sends the user back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum PostAuthAction {
    RegisterUser {
        #[serde(default)]
        payload: Map<String, Value>,
    },
}

/// The user the identity provider signed in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedInUser {
    pub uid: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    pub id_token: String,
}

/// A navigation decided by the continuation. Always a history replace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectOutcome {
    pub navigate_to: String,
    pub replace: bool,
    pub sign_out: bool,
}

impl RedirectOutcome {
    fn to(path: impl Into<String>) -> Self {
        Self {
            navigate_to: path.into(),
            replace: true,
            sign_out: false,
        }
    }

    fn signing_out(mut self) -> Self {
        self.sign_out = true;
        self
    }
}

//=========================================================================================
// Storage
//=========================================================================================

/// Process-local `PostAuthStore`, standing in for a browser tab's session storage.
#[derive(Debug, Default)]
pub struct MemoryPostAuthStore {
    items: Mutex<HashMap<String, String>>,
}

impl MemoryPostAuthStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PostAuthStore for MemoryPostAuthStore {
    fn get_item(&self, key: &str) -> Option<String> {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    fn set_item(&self, key: &str, value: &str) {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.to_string());
    }

    fn remove_item(&self, key: &str) {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

//=========================================================================================
// The Flow
//=========================================================================================

pub struct PostAuthFlow {
    store: Arc<dyn PostAuthStore>,
    directory: Arc<dyn AccountDirectory>,
    registrar: Arc<dyn RegistrationClient>,
}

impl PostAuthFlow {
    pub fn new(
        store: Arc<dyn PostAuthStore>,
        directory: Arc<dyn AccountDirectory>,
        registrar: Arc<dyn RegistrationClient>,
    ) -> Self {
        Self {
            store,
            directory,
            registrar,
        }
    }

    /// Remembers where to go after sign-in. Blank targets are ignored.
    pub fn set_post_auth_return_to(&self, return_to: &str) {
        if !return_to.trim().is_empty() {
            self.store.set_item(RETURN_TO_KEY, return_to);
        }
    }

    pub fn set_post_auth_action(&self, action: &PostAuthAction) {
        match serde_json::to_string(action) {
            Ok(encoded) => self.store.set_item(ACTION_KEY, &encoded),
            Err(e) => error!(error = %e, "Failed to encode post-auth action"),
        }
    }

    fn consume_return_to(&self) -> Option<String> {
        let value = self.store.get_item(RETURN_TO_KEY);
        self.store.remove_item(RETURN_TO_KEY);
        value
    }

    fn consume_action(&self) -> Option<PostAuthAction> {
        let raw = self.store.get_item(ACTION_KEY);
        self.store.remove_item(ACTION_KEY);
        let raw = raw?;
        match serde_json::from_str(&raw) {
            Ok(action) => Some(action),
            Err(e) => {
                error!(error = %e, "Failed to parse post-auth action from storage");
                None
            }
        }
    }

    /// Decides where a returning user goes. `None` means no sign-in happened
    /// and the current page stays put.
    pub async fn handle_redirect_result(&self, user: Option<&SignedInUser>) -> Option<RedirectOutcome> {
        let user = user?;
        let return_to = self
            .consume_return_to()
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| "/".to_string());

        if let Some(PostAuthAction::RegisterUser { payload }) = self.consume_action() {
            return Some(if self.run_register(user, payload).await {
                RedirectOutcome::to(return_to)
            } else {
                RedirectOutcome::to(with_query_param(&return_to, SIGN_UP_POPUP_PARAM, "1"))
            });
        }

        let account = match self.directory.resolve_account(&user.uid).await {
            Ok(account) => account,
            Err(e) => {
                error!(uid = %user.uid, error = %e, "Failed to resolve signed-in account");
                None
            }
        };

        let Some(account) = account else {
            debug!(uid = %user.uid, "No account for signed-in user, prompting sign-up");
            return Some(
                RedirectOutcome::to(with_query_param(&return_to, SIGN_UP_POPUP_PARAM, "1")).signing_out(),
            );
        };

        Some(match account.role {
            Role::TeacherPlus => RedirectOutcome::to("/teacher-plus"),
            Role::Admin => RedirectOutcome::to("/"),
            _ => RedirectOutcome::to(return_to),
        })
    }

    async fn run_register(&self, user: &SignedInUser, mut payload: Map<String, Value>) -> bool {
        let as_value = |v: &Option<String>| v.clone().map(Value::from).unwrap_or(Value::Null);
        payload.insert("email".to_string(), as_value(&user.email));
        payload.insert("fullName".to_string(), as_value(&user.display_name));

        match self.registrar.register(&user.id_token, &Value::Object(payload)).await {
            Ok(status) if (200..300).contains(&status) => true,
            Ok(status) => {
                warn!(uid = %user.uid, status, "Post-auth registration was rejected");
                false
            }
            Err(e) => {
                error!(uid = %user.uid, error = %e, "Post-auth registration failed");
                false
            }
        }
    }
}

/// Sets `key=value` on the query of a relative URL, replacing any existing
/// value and keeping the fragment. Absolute URLs are reduced to their path.
pub fn with_query_param(path_with_search: &str, key: &str, value: &str) -> String {
    let mut target = path_with_search.trim();
    if let Some(scheme_end) = target.find("://") {
        let after_host = &target[scheme_end + 3..];
        target = after_host.find('/').map_or("/", |i| &after_host[i..]);
    }
    if target.is_empty() {
        target = "/";
    }

    let (without_hash, hash) = target.split_at(target.find('#').unwrap_or(target.len()));
    let (path, query) = match without_hash.split_once('?') {
        Some((p, q)) => (p, q),
        None => (without_hash, ""),
    };
    let path = if path.is_empty() { "/" } else { path };

    let encoded = format!("{}={}", urlencoding::encode(key), urlencoding::encode(value));
    let mut replaced = false;
    let mut pairs: Vec<String> = Vec::new();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let name = pair.split('=').next().unwrap_or_default();
        let name = urlencoding::decode(name).map(|n| n.into_owned()).unwrap_or_default();
        if name == key {
            if !replaced {
                pairs.push(encoded.clone());
                replaced = true;
            }
        } else {
            pairs.push(pair.to_string());
        }
    }
    if !replaced {
        pairs.push(encoded);
    }

    format!("{}?{}{}", path, pairs.join("&"), hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{PortError, PortResult, ResolvedAccount};
    use async_trait::async_trait;
    use serde_json::json;

    struct Directory(Option<Role>);

    #[async_trait]
    impl AccountDirectory for Directory {
        async fn resolve_account(&self, _uid: &str) -> PortResult<Option<ResolvedAccount>> {
            Ok(self.0.clone().map(|role| ResolvedAccount {
                role,
                collection: "teachers".into(),
            }))
        }
    }

    #[derive(Default)]
    struct Registrar {
        status: u16,
        calls: Mutex<Vec<(String, Value)>>,
    }

    #[async_trait]
    impl RegistrationClient for Registrar {
        async fn register(&self, id_token: &str, body: &Value) -> PortResult<u16> {
            self.calls.lock().unwrap().push((id_token.to_string(), body.clone()));
            if self.status == 0 {
                Err(PortError::Unavailable("offline".into()))
            } else {
                Ok(self.status)
            }
        }
    }

    fn user() -> SignedInUser {
        SignedInUser {
            uid: "u1".into(),
            email: Some("u1@example.com".into()),
            display_name: Some("Una One".into()),
            id_token: "tok".into(),
        }
    }

    fn flow(role: Option<Role>, status: u16) -> (PostAuthFlow, Arc<MemoryPostAuthStore>, Arc<Registrar>) {
        let store = Arc::new(MemoryPostAuthStore::new());
        let registrar = Arc::new(Registrar {
            status,
            ..Default::default()
        });
        let flow = PostAuthFlow::new(store.clone(), Arc::new(Directory(role)), registrar.clone());
        (flow, store, registrar)
    }

    #[tokio::test]
    async fn no_user_means_no_navigation() {
        let (flow, store, _) = flow(Some(Role::Admin), 201);
        flow.set_post_auth_return_to("/lessons");
        assert_eq!(flow.handle_redirect_result(None).await, None);
        assert_eq!(store.get_item(RETURN_TO_KEY).as_deref(), Some("/lessons"));
    }

    #[tokio::test]
    async fn role_decides_destination() {
        let cases = [
            (Some(Role::TeacherPlus), "/teacher-plus", false),
            (Some(Role::Admin), "/", false),
            (Some(Role::Student), "/lessons", false),
            (None, "/lessons?showSignUpPopup=1", true),
        ];
        for (role, expected, sign_out) in cases {
            let (flow, store, _) = flow(role, 201);
            flow.set_post_auth_return_to("/lessons");
            let outcome = flow.handle_redirect_result(Some(&user())).await.unwrap();
            assert_eq!(outcome.navigate_to, expected);
            assert_eq!(outcome.sign_out, sign_out);
            assert!(outcome.replace);
            assert_eq!(store.get_item(RETURN_TO_KEY), None);
        }
    }

    #[tokio::test]
    async fn missing_return_target_defaults_to_root() {
        let (flow, _, _) = flow(Some(Role::TeacherDefault), 201);
        flow.set_post_auth_return_to("   ");
        let outcome = flow.handle_redirect_result(Some(&user())).await.unwrap();
        assert_eq!(outcome.navigate_to, "/");
    }

    #[tokio::test]
    async fn register_action_merges_identity_into_payload() {
        let (flow, store, registrar) = flow(None, 201);
        flow.set_post_auth_return_to("/units");
        let mut payload = Map::new();
        payload.insert("role".into(), json!("student"));
        payload.insert("email".into(), json!("stale@example.com"));
        flow.set_post_auth_action(&PostAuthAction::RegisterUser { payload });

        let outcome = flow.handle_redirect_result(Some(&user())).await.unwrap();
        assert_eq!(outcome.navigate_to, "/units");
        assert!(!outcome.sign_out);
        assert_eq!(store.get_item(ACTION_KEY), None);

        let calls = registrar.calls.lock().unwrap();
        assert_eq!(calls[0].0, "tok");
        assert_eq!(
            calls[0].1,
            json!({ "role": "student", "email": "u1@example.com", "fullName": "Una One" })
        );
    }

    #[tokio::test]
    async fn failed_registration_reopens_sign_up() {
        for status in [0, 500] {
            let (flow, _, _) = flow(Some(Role::Admin), status);
            flow.set_post_auth_return_to("/units?page=2");
            flow.set_post_auth_action(&PostAuthAction::RegisterUser { payload: Map::new() });
            let outcome = flow.handle_redirect_result(Some(&user())).await.unwrap();
            assert_eq!(outcome.navigate_to, "/units?page=2&showSignUpPopup=1");
        }
    }

    #[tokio::test]
    async fn malformed_action_is_ignored() {
        let (flow, store, registrar) = flow(Some(Role::TeacherPlus), 201);
        store.set_item(ACTION_KEY, "{not json");
        let outcome = flow.handle_redirect_result(Some(&user())).await.unwrap();
        assert_eq!(outcome.navigate_to, "/teacher-plus");
        assert!(registrar.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn action_wire_format() {
        let action: PostAuthAction =
            serde_json::from_str(r#"{"type":"registerUser","payload":{"role":"student"}}"#).unwrap();
        assert!(matches!(action, PostAuthAction::RegisterUser { ref payload } if payload["role"] == "student"));
        let bare: PostAuthAction = serde_json::from_str(r#"{"type":"registerUser"}"#).unwrap();
        assert_eq!(bare, PostAuthAction::RegisterUser { payload: Map::new() });
    }

    #[test]
    fn query_param_is_set_once_and_keeps_hash() {
        assert_eq!(with_query_param("/", "showSignUpPopup", "1"), "/?showSignUpPopup=1");
        assert_eq!(
            with_query_param("/a?showSignUpPopup=0&x=1#top", "showSignUpPopup", "1"),
            "/a?showSignUpPopup=1&x=1#top"
        );
        assert_eq!(
            with_query_param("https://portal.example.com/plans?x=1", "k", "a b"),
            "/plans?x=1&k=a%20b"
        );
        assert_eq!(with_query_param("", "k", "v"), "/?k=v");
    }
}

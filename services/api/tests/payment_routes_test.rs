//! services/api/tests/payment_routes_test.rs
//!
//! Stripe checkout against a fake processor, and signed webhooks.

mod helpers;

use api_lib::adapters::stripe::sign;
use axum::http::StatusCode;
use chrono::Utc;
use helpers::axum_test::TestRequest;
use curriculum_portal_core::{Identified, Module, PaymentLog};
use helpers::{TestApp, APP_DOMAIN, PREMIUM_TOKEN, PUBLISHABLE_KEY, TEACHER_TOKEN, TEACHER_UID, WEBHOOK_SECRET};
use serde_json::{json, Value};

async fn create_intent(app: &TestApp, token: &str) -> String {
    let response = TestRequest::post("/api/payment/create-payment-intent")
        .bearer(token)
        .json(&json!({ "planType": "premium" }))
        .send(app.router())
        .await;
    assert_eq!(response.status(), StatusCode::OK, "{}", response.text());
    let body = response.json();
    let id = body["paymentIntentId"].as_str().unwrap().to_string();
    assert_eq!(body["clientSecret"], format!("{id}_secret"));
    id
}

async fn priced_module(app: &TestApp, title: &str, price: Value) -> String {
    let mut module = Module {
        title: title.to_string(),
        ..Default::default()
    };
    module.extra.insert("price".to_string(), price);
    app.state.db.create_module(module).await.unwrap().id
}

async fn send_signed(app: &TestApp, payload: &Value) -> axum::http::StatusCode {
    let payload = payload.to_string();
    let now = Utc::now().timestamp();
    let signature = format!("t={now},v1={}", sign(&payload, now, WEBHOOK_SECRET).unwrap());
    TestRequest::post("/api/payment/webhook")
        .header("stripe-signature", &signature)
        .raw_json(&payload)
        .send(app.router())
        .await
        .status()
}

async fn log_entry(app: &TestApp, id: &str) -> Identified<PaymentLog> {
    app.state
        .db
        .recent_payment_logs(100)
        .await
        .unwrap()
        .into_iter()
        .find(|entry| entry.id == id)
        .unwrap_or_else(|| panic!("no payment log {id}"))
}

#[tokio::test]
async fn test_route_lists_endpoints() {
    let app = TestApp::new().await;
    let body = TestRequest::get("/api/payment/test").send(app.router()).await.json();
    assert_eq!(body["message"], "Payment routes are working!");
    assert_eq!(body["endpoints"].as_array().unwrap().len(), 7);
}

#[tokio::test]
async fn intents_are_premium_only_and_carry_the_caller() {
    let app = TestApp::new().await;

    let invalid = TestRequest::post("/api/payment/create-payment-intent")
        .bearer(TEACHER_TOKEN)
        .json(&json!({ "planType": "enterprise" }))
        .send(app.router())
        .await;
    assert_eq!(
        invalid.expect_error(StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
        "Invalid plan type"
    );

    let id = create_intent(&app, TEACHER_TOKEN).await;
    let intent = app.payments.intent(&id).unwrap();
    assert_eq!(intent.amount, 999);
    assert_eq!(intent.currency, "usd");
    assert_eq!(intent.metadata_value("userId"), Some(TEACHER_UID));
    assert_eq!(intent.metadata_value("upgradeFrom"), Some("basic"));
    assert_eq!(intent.metadata_value("userEmail"), Some("test@example.com"));
}

#[tokio::test]
async fn confirm_payment_checks_status_and_owner() {
    let app = TestApp::new().await;

    let missing = TestRequest::post("/api/payment/confirm-payment")
        .bearer(TEACHER_TOKEN)
        .json(&json!({}))
        .send(app.router())
        .await;
    assert_eq!(
        missing.expect_error(StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
        "Payment intent ID required"
    );

    let id = create_intent(&app, TEACHER_TOKEN).await;
    let body = json!({ "paymentIntentId": id });

    let unpaid = TestRequest::post("/api/payment/confirm-payment")
        .bearer(TEACHER_TOKEN)
        .json(&body)
        .send(app.router())
        .await;
    assert_eq!(
        unpaid.expect_error(StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
        "Payment not completed"
    );

    app.payments.succeed(&id);

    let stolen = TestRequest::post("/api/payment/confirm-payment")
        .bearer(PREMIUM_TOKEN)
        .json(&body)
        .send(app.router())
        .await;
    assert_eq!(
        stolen.expect_error(StatusCode::FORBIDDEN, "AUTHORIZATION_ERROR"),
        "Payment verification failed"
    );

    let confirmed = TestRequest::post("/api/payment/confirm-payment")
        .bearer(TEACHER_TOKEN)
        .json(&body)
        .send(app.router())
        .await;
    assert_eq!(confirmed.status(), StatusCode::OK, "{}", confirmed.text());
    assert_eq!(confirmed.json()["subscriptionType"], "premium");

    let me = TestRequest::get("/api/user/me")
        .bearer(TEACHER_TOKEN)
        .send(app.router())
        .await
        .json();
    assert_eq!(me["role"], "teacherPlus");
    assert_eq!(me["stripeCustomerId"], "cus_test");
    assert_eq!(me["stripePaymentIntentId"], id);

    let history = TestRequest::get("/api/payment/history")
        .bearer(TEACHER_TOKEN)
        .send(app.router())
        .await
        .json();
    let actions: Vec<&str> = history
        .as_array()
        .unwrap()
        .iter()
        .map(|entry| entry["action"].as_str().unwrap())
        .collect();
    assert!(actions.contains(&"payment_intent_created"));
    assert!(actions.contains(&"payment_confirmed"));
}

#[tokio::test]
async fn unknown_intents_surface_as_payment_errors() {
    let app = TestApp::new().await;
    TestRequest::post("/api/payment/confirm-payment")
        .bearer(TEACHER_TOKEN)
        .json(&json!({ "paymentIntentId": "pi_missing" }))
        .send(app.router())
        .await
        .expect_error(StatusCode::NOT_FOUND, "NOT_FOUND");
}

#[tokio::test]
async fn unconfigured_payments_answer_503() {
    let app = TestApp::without_payments().await;
    TestRequest::post("/api/payment/create-payment-intent")
        .bearer(TEACHER_TOKEN)
        .json(&json!({ "planType": "premium" }))
        .send(app.router())
        .await
        .expect_error(StatusCode::SERVICE_UNAVAILABLE, "PAYMENT_UNAVAILABLE");
}

#[tokio::test]
async fn webhooks_must_be_signed() {
    let app = TestApp::new().await;
    let payload = json!({
        "id": "evt_1",
        "type": "payment_intent.succeeded",
        "data": { "object": {
            "id": "pi_hook", "amount": 999, "currency": "usd",
            "metadata": { "userId": TEACHER_UID }
        }}
    })
    .to_string();

    let unsigned = TestRequest::post("/api/payment/webhook")
        .raw_json(&payload)
        .send(app.router())
        .await;
    assert!(unsigned
        .expect_error(StatusCode::BAD_REQUEST, "VALIDATION_ERROR")
        .starts_with("Webhook Error:"));

    let now = Utc::now().timestamp();
    let forged = format!("t={now},v1={}", sign(&payload, now, "whsec_wrong").unwrap());
    TestRequest::post("/api/payment/webhook")
        .header("stripe-signature", &forged)
        .raw_json(&payload)
        .send(app.router())
        .await
        .expect_error(StatusCode::BAD_REQUEST, "VALIDATION_ERROR");

    let signature = format!("t={now},v1={}", sign(&payload, now, WEBHOOK_SECRET).unwrap());
    let accepted = TestRequest::post("/api/payment/webhook")
        .header("stripe-signature", &signature)
        .raw_json(&payload)
        .send(app.router())
        .await;
    assert_eq!(accepted.status(), StatusCode::OK, "{}", accepted.text());
    assert_eq!(accepted.json(), json!({ "received": true }));

    let history = app.state.db.payment_history(TEACHER_UID, 20).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].doc.payment_intent_id.as_deref(), Some("pi_hook"));
    assert_eq!(history[0].doc.amount, Some(999));
}

#[tokio::test]
async fn module_checkout_prices_from_the_module() {
    let app = TestApp::new().await;
    let module_id = priced_module(&app, "Pond Ecology", json!(4.99)).await;

    let response = TestRequest::post("/api/payment/create-module-checkout-session")
        .bearer(TEACHER_TOKEN)
        .json(&json!({ "moduleId": module_id }))
        .send(app.router())
        .await;
    assert_eq!(response.status(), StatusCode::OK, "{}", response.text());
    let body = response.json();
    assert_eq!(body["sessionId"], "cs_test_1");
    assert_eq!(body["clientSecret"], "cs_test_1_secret");
    assert_eq!(body["livemode"], false);
    assert_eq!(body["stripePublishableKey"], PUBLISHABLE_KEY);
    assert_eq!(body["paymentLogId"], "cs_test_1");
    assert_eq!(body["paymentLogsCollection"], "payment_logs");

    let session = &app.payments.sessions()[0];
    assert_eq!(session.unit_amount, 499);
    assert_eq!(session.product_name, "Pond Ecology");
    assert_eq!(session.metadata["purchaseType"], "module");
    assert_eq!(session.metadata["moduleId"], module_id);
    assert_eq!(session.payment_intent_metadata["userId"], TEACHER_UID);
    assert_eq!(
        session.return_url,
        format!("{APP_DOMAIN}/diya-ed/module/{module_id}?checkout=success&session_id={{CHECKOUT_SESSION_ID}}")
    );
    let linked = app.payments.intent_metadata("pi_cs_test_1").unwrap();
    assert_eq!(linked["checkoutSessionId"], "cs_test_1");

    let entry = log_entry(&app, "cs_test_1").await;
    assert_eq!(entry.doc.status, "created");
    assert_eq!(entry.doc.module_title.as_deref(), Some("Pond Ecology"));
    assert_eq!(entry.doc.amount, Some(499));
    assert_eq!(entry.doc.user_id.as_deref(), Some(TEACHER_UID));
}

#[tokio::test]
async fn module_checkout_rejects_missing_and_free_modules() {
    let app = TestApp::new().await;

    let missing_id = TestRequest::post("/api/payment/create-module-checkout-session")
        .bearer(TEACHER_TOKEN)
        .json(&json!({}))
        .send(app.router())
        .await;
    assert_eq!(
        missing_id.expect_error(StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
        "moduleId is required"
    );

    let unknown = TestRequest::post("/api/payment/create-module-checkout-session")
        .bearer(TEACHER_TOKEN)
        .json(&json!({ "moduleId": "no-such-module" }))
        .send(app.router())
        .await;
    assert_eq!(unknown.expect_error(StatusCode::NOT_FOUND, "NOT_FOUND"), "Module not found");

    let free_id = priced_module(&app, "Free Sampler", json!(0)).await;
    let free = TestRequest::post("/api/payment/create-module-checkout-session")
        .bearer(TEACHER_TOKEN)
        .json(&json!({ "moduleId": free_id }))
        .send(app.router())
        .await;
    assert_eq!(
        free.expect_error(StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
        "This module does not have a valid paid price"
    );
    assert!(app.payments.sessions().is_empty());
}

#[tokio::test]
async fn module_checkout_needs_a_matching_publishable_key() {
    let app = TestApp::with_env(&[("STRIPE_PUBLISHABLE_KEY_TEST", ""), ("STRIPE_PUBLISHABLE_KEY", "pk_live_wrong")]).await;
    let module_id = priced_module(&app, "Pond Ecology", json!("4.99")).await;

    TestRequest::post("/api/payment/create-module-checkout-session")
        .bearer(TEACHER_TOKEN)
        .json(&json!({ "moduleId": module_id }))
        .send(app.router())
        .await
        .expect_error(StatusCode::INTERNAL_SERVER_ERROR, "SERVER_MISCONFIGURED");
}

#[tokio::test]
async fn checkout_return_urls_need_an_app_domain() {
    let app = TestApp::with_env(&[("DOMAIN", "")]).await;
    let module_id = priced_module(&app, "Pond Ecology", json!(4.99)).await;

    TestRequest::post("/api/payment/create-module-checkout-session")
        .bearer(TEACHER_TOKEN)
        .json(&json!({ "moduleId": module_id }))
        .send(app.router())
        .await
        .expect_error(StatusCode::INTERNAL_SERVER_ERROR, "SERVER_MISCONFIGURED");

    let from_origin = TestRequest::post("/api/payment/create-module-checkout-session")
        .bearer(TEACHER_TOKEN)
        .header("origin", "http://localhost:3000")
        .json(&json!({ "moduleId": module_id }))
        .send(app.router())
        .await;
    assert_eq!(from_origin.status(), StatusCode::OK, "{}", from_origin.text());
    assert!(app.payments.sessions()[0]
        .return_url
        .starts_with("http://localhost:3000/diya-ed/module/"));
}

#[tokio::test]
async fn embedded_checkout_sells_premium_plans() {
    let app = TestApp::new().await;

    let invalid = TestRequest::post("/api/payment/create-embedded-checkout-session")
        .bearer(TEACHER_TOKEN)
        .json(&json!({ "planType": "enterprise" }))
        .send(app.router())
        .await;
    assert_eq!(
        invalid.expect_error(StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
        "Invalid plan type"
    );

    let response = TestRequest::post("/api/payment/create-embedded-checkout-session")
        .bearer(TEACHER_TOKEN)
        .json(&json!({ "planType": "premiumYearly" }))
        .send(app.router())
        .await;
    assert_eq!(response.status(), StatusCode::OK, "{}", response.text());
    assert_eq!(
        response.json(),
        json!({ "clientSecret": "cs_test_1_secret", "sessionId": "cs_test_1" })
    );

    let session = &app.payments.sessions()[0];
    assert_eq!(session.unit_amount, 10000);
    assert_eq!(session.product_name, "Premium (Yearly)");
    assert_eq!(session.customer_email.as_deref(), Some("test@example.com"));
    assert_eq!(session.metadata["planType"], "premiumYearly");
    assert_eq!(session.return_url, format!("{APP_DOMAIN}/return?session_id={{CHECKOUT_SESSION_ID}}"));
}

#[tokio::test]
async fn checkout_webhooks_update_the_session_entry() {
    let app = TestApp::new().await;
    let module_id = priced_module(&app, "Pond Ecology", json!(4.99)).await;
    let created = TestRequest::post("/api/payment/create-module-checkout-session")
        .bearer(TEACHER_TOKEN)
        .json(&json!({ "moduleId": module_id }))
        .send(app.router())
        .await;
    assert_eq!(created.status(), StatusCode::OK, "{}", created.text());

    let metadata = json!({ "purchaseType": "module", "moduleId": module_id, "userId": TEACHER_UID });
    let paid = json!({
        "id": "evt_paid",
        "type": "payment_intent.succeeded",
        "livemode": false,
        "data": { "object": {
            "id": "pi_cs_test_1", "amount": 499, "currency": "usd",
            "metadata": { "purchaseType": "module", "moduleId": module_id, "userId": TEACHER_UID, "checkoutSessionId": "cs_test_1" }
        }}
    });
    assert_eq!(send_signed(&app, &paid).await, StatusCode::OK);
    let entry = log_entry(&app, "cs_test_1").await;
    assert_eq!(entry.doc.status, "succeeded");
    assert!(entry.doc.paid_at.is_some());

    let completed = json!({
        "id": "evt_done",
        "type": "checkout.session.completed",
        "livemode": false,
        "data": { "object": {
            "id": "cs_test_1", "payment_intent": "pi_cs_test_1",
            "amount_total": 499, "currency": "usd", "metadata": metadata
        }}
    });
    assert_eq!(send_signed(&app, &completed).await, StatusCode::OK);

    let entry = log_entry(&app, "cs_test_1").await;
    assert_eq!(entry.doc.status, "completed");
    assert_eq!(entry.doc.last_event_type.as_deref(), Some("checkout.session.completed"));
    assert_eq!(entry.doc.module_title.as_deref(), Some("Pond Ecology"));
    assert_eq!(entry.doc.payment_intent_id.as_deref(), Some("pi_cs_test_1"));
    assert!(entry.doc.completed_at.is_some());
}

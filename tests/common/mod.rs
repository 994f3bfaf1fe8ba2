// Shared harness for the integration tests: a fresh in-memory database
// per test, the mock gateway for scripting, and seed data helpers.
#![allow(dead_code)]

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use chrono::Utc;

use gigmarket::config::Config;
use gigmarket::db::Database;
use gigmarket::error::AppResult;
use gigmarket::models::{Booking, CreateBookingRequest, DeliverRequest, DeliverableInput, User};
use gigmarket::routes::payments::{self, SIGNATURE_HEADER};
use gigmarket::services::{BookingService, EscrowService, MockGateway, Notifier, WebChannel};
use gigmarket::AppState;

pub const WEBHOOK_SECRET: &str = "test-webhook-secret";

/// App state over a fresh in-memory database. The mock gateway is
/// returned alongside for scripting failures and inspecting calls.
pub async fn test_state() -> (Arc<AppState>, Arc<MockGateway>) {
    let mut config = Config::default();
    config.database_url = "sqlite::memory:".to_string();
    config.gateway.webhook_secret = WEBHOOK_SECRET.to_string();
    // Keep scripted-failure tests fast
    config.gateway.retry_delay_ms = 1;

    let db = Database::connect(&config.database_url)
        .await
        .expect("connect to in-memory database");
    db.run_migrations().await.expect("run migrations");

    let gateway = Arc::new(MockGateway::new(WEBHOOK_SECRET));
    let state = Arc::new(AppState {
        db,
        gateway: gateway.clone(),
        notifier: Notifier::new(vec![Arc::new(WebChannel)]),
        config,
    });
    (state, gateway)
}

/// Insert a user row directly; most tests have no use for the register flow
pub async fn seed_user(db: &Database, email: &str, role: &str) -> User {
    let id = uuid::Uuid::new_v4().to_string();
    sqlx::query(
        r#"
        INSERT INTO users (id, email, display_name, role, created_at)
        VALUES (?, ?, 'Test User', ?, ?)
        "#,
    )
    .bind(&id)
    .bind(email)
    .bind(role)
    .bind(Utc::now())
    .execute(db.pool())
    .await
    .expect("insert user");

    sqlx::query_as("SELECT * FROM users WHERE id = ?")
        .bind(&id)
        .fetch_one(db.pool())
        .await
        .expect("load user")
}

/// Service with a single bookable "standard" package
pub async fn seed_service(db: &Database, provider_id: &str, price: i64) -> String {
    let id = uuid::Uuid::new_v4().to_string();
    sqlx::query(
        r#"
        INSERT INTO services (id, provider_id, title, description, is_active, created_at)
        VALUES (?, ?, 'Logo design', 'Vector logo with source files', 1, ?)
        "#,
    )
    .bind(&id)
    .bind(provider_id)
    .bind(Utc::now())
    .execute(db.pool())
    .await
    .expect("insert service");

    sqlx::query(
        r#"
        INSERT INTO service_packages (id, service_id, name, price, delivery_days, revisions_allowed)
        VALUES (?, ?, 'standard', ?, 7, 2)
        "#,
    )
    .bind(uuid::Uuid::new_v4().to_string())
    .bind(&id)
    .bind(price)
    .execute(db.pool())
    .await
    .expect("insert package");

    id
}

/// Customer, provider and a 5,000.00 service to book
pub async fn seed_marketplace(state: &AppState) -> (User, User, String) {
    let customer = seed_user(&state.db, "customer@example.com", "customer").await;
    let provider = seed_user(&state.db, "provider@example.com", "provider").await;
    let service_id = seed_service(&state.db, &provider.id, 500_000).await;
    (customer, provider, service_id)
}

/// Standard booking request against the seeded service
pub fn booking_request(service_id: &str) -> CreateBookingRequest {
    CreateBookingRequest {
        service_id: service_id.to_string(),
        package_name: "standard".to_string(),
        title: "Company logo".to_string(),
        requirements: Some("Minimalist, two colors".to_string()),
    }
}

/// Delivery payload with a single file attached
pub fn delivery_request() -> DeliverRequest {
    DeliverRequest {
        message: Some("First draft attached".to_string()),
        deliverables: vec![DeliverableInput {
            filename: "logo-draft.svg".to_string(),
            url: "https://files.example.com/logo-draft.svg".to_string(),
            size_bytes: 18_432,
            note: None,
        }],
    }
}

/// Post a signed webhook through the HTTP handler
pub async fn send_webhook(
    state: &Arc<AppState>,
    gateway: &MockGateway,
    event: &str,
    transaction_id: &str,
    amount: i64,
) -> AppResult<StatusCode> {
    let body = serde_json::json!({
        "event": event,
        "data": { "transaction_id": transaction_id, "amount": amount },
    })
    .to_string();
    let signature = gateway.sign(body.as_bytes()).expect("sign payload");
    let mut headers = HeaderMap::new();
    headers.insert(SIGNATURE_HEADER, signature.parse().expect("header value"));
    payments::webhook(State(state.clone()), headers, Bytes::from(body)).await
}

/// Gateway transaction id of the booking's submitted payment at a stage
pub async fn submitted_txid(state: &AppState, booking_id: &str, stage: &str) -> String {
    EscrowService::payments_for_booking(&state.db, booking_id)
        .await
        .expect("load payments")
        .into_iter()
        .find(|p| p.stage == stage && p.gateway_transaction_id.is_some())
        .and_then(|p| p.gateway_transaction_id)
        .expect("submitted payment for stage")
}

/// Booking created and paid through its deposit, waiting for the provider
pub async fn paid_booking(
    state: &Arc<AppState>,
    gateway: &MockGateway,
    customer: &User,
    service_id: &str,
) -> Booking {
    let (booking, _) = BookingService::create_booking(state, customer, booking_request(service_id))
        .await
        .expect("create booking");
    let txid = submitted_txid(state, &booking.id, "deposit").await;
    let status = send_webhook(state, gateway, "charge.succeeded", &txid, booking.deposit_amount)
        .await
        .expect("deposit webhook");
    assert_eq!(status, StatusCode::OK);
    BookingService::get_booking(&state.db, &booking.id)
        .await
        .expect("reload booking")
}

/// Booking driven through acceptance and work to delivered
pub async fn delivered_booking(
    state: &Arc<AppState>,
    gateway: &MockGateway,
    customer: &User,
    provider: &User,
    service_id: &str,
) -> Booking {
    let booking = paid_booking(state, gateway, customer, service_id).await;
    BookingService::accept(state, provider, &booking.id, None)
        .await
        .expect("accept");
    BookingService::start_work(state, provider, &booking.id)
        .await
        .expect("start work");
    BookingService::deliver(state, provider, &booking.id, &delivery_request())
        .await
        .expect("deliver")
}

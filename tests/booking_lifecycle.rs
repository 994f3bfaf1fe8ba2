mod common;

use axum::http::StatusCode;
use chrono::{Duration, Utc};

use gigmarket::error::AppError;
use gigmarket::models::{BookingStatus, PaymentProgress, ReviewRequest, RevisionRequest};
use gigmarket::services::{BookingService, EscrowService, GatewayCall};

#[tokio::test]
async fn full_lifecycle_reaches_completion_and_pays_out() {
    let (state, gateway) = common::test_state().await;
    let (customer, provider, service_id) = common::seed_marketplace(&state).await;

    // Terms are snapshotted from the package and the deposit charge opened
    let (booking, intent) =
        BookingService::create_booking(&state, &customer, common::booking_request(&service_id))
            .await
            .expect("create booking");
    assert_eq!(booking.status_enum(), BookingStatus::PendingPayment);
    assert_eq!(booking.total_amount, 500_000);
    assert_eq!(booking.deposit_amount, 250_000);
    assert_eq!(booking.remaining_amount, 250_000);
    assert_eq!(booking.commission_amount, 75_000);
    assert_eq!(booking.provider_earnings, 425_000);
    assert!(booking.booking_ref.starts_with("BK-"));
    assert_eq!(intent.amount, 250_000);
    assert!(intent.checkout_url.is_some());

    // Deposit confirmation hands the request to the provider
    let txid = common::submitted_txid(&state, &booking.id, "deposit").await;
    let status = common::send_webhook(&state, &gateway, "charge.succeeded", &txid, 250_000)
        .await
        .expect("deposit webhook");
    assert_eq!(status, StatusCode::OK);
    let booking = BookingService::get_booking(&state.db, &booking.id)
        .await
        .unwrap();
    assert_eq!(booking.status_enum(), BookingStatus::PendingApproval);
    assert_eq!(booking.payment_progress(), PaymentProgress::Remaining);

    let booking = BookingService::accept(&state, &provider, &booking.id, Some("Happy to take this"))
        .await
        .expect("accept");
    assert_eq!(booking.status_enum(), BookingStatus::Accepted);
    assert!(booking.accepted_at.is_some());
    assert!(booking.expected_delivery.is_some());
    assert_eq!(booking.provider_message.as_deref(), Some("Happy to take this"));

    let booking = BookingService::start_work(&state, &provider, &booking.id)
        .await
        .expect("start work");
    assert_eq!(booking.status_enum(), BookingStatus::InProgress);

    let booking = BookingService::deliver(&state, &provider, &booking.id, &common::delivery_request())
        .await
        .expect("deliver");
    assert_eq!(booking.status_enum(), BookingStatus::Delivered);
    let files = BookingService::deliverables(&state.db, &booking.id)
        .await
        .unwrap();
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].filename, "logo-draft.svg");

    // Customer settles the remaining half
    let intent = EscrowService::final_intent(&state, &booking)
        .await
        .expect("final intent");
    assert_eq!(intent.amount, 250_000);
    let txid = common::submitted_txid(&state, &booking.id, "final").await;
    common::send_webhook(&state, &gateway, "charge.succeeded", &txid, 250_000)
        .await
        .expect("final webhook");
    let booking = BookingService::get_booking(&state.db, &booking.id)
        .await
        .unwrap();
    assert_eq!(booking.status_enum(), BookingStatus::Completed);
    assert_eq!(booking.payment_progress(), PaymentProgress::Settled);
    assert!(booking.completed_at.is_some());

    // Payout is queued behind the hold-back and not submitted yet
    let payments = EscrowService::payments_for_booking(&state.db, &booking.id)
        .await
        .unwrap();
    let payout = payments
        .iter()
        .find(|p| p.stage == "payout")
        .expect("payout row");
    assert_eq!(payout.amount, 425_000);
    assert!(payout.not_before.expect("not_before") > Utc::now());
    assert!(payout.gateway_transaction_id.is_none());
    assert_eq!(EscrowService::process_due_payouts(&state).await.unwrap(), 0);

    // Once the hold elapses the sweep sends it to the gateway
    sqlx::query("UPDATE payments SET not_before = ? WHERE id = ?")
        .bind(Utc::now() - Duration::hours(1))
        .bind(&payout.id)
        .execute(state.db.pool())
        .await
        .unwrap();
    assert_eq!(EscrowService::process_due_payouts(&state).await.unwrap(), 1);
    let transfers: Vec<_> = gateway
        .calls()
        .into_iter()
        .filter(|c| matches!(c, GatewayCall::Transfer { .. }))
        .collect();
    assert_eq!(
        transfers,
        vec![GatewayCall::Transfer {
            reference: payout.id.clone(),
            recipient_id: provider.id.clone(),
            amount: 425_000,
        }]
    );

    // Transfer confirmation closes the payout
    let txid = common::submitted_txid(&state, &booking.id, "payout").await;
    common::send_webhook(&state, &gateway, "transfer.succeeded", &txid, 425_000)
        .await
        .expect("transfer webhook");
    let payments = EscrowService::payments_for_booking(&state.db, &booking.id)
        .await
        .unwrap();
    let payout = payments.iter().find(|p| p.stage == "payout").unwrap();
    assert_eq!(payout.status, "completed");

    // The timeline kept the whole story in order
    let timeline = BookingService::timeline(&state.db, &booking.id).await.unwrap();
    let statuses: Vec<&str> = timeline.iter().map(|t| t.status.as_str()).collect();
    assert_eq!(
        statuses,
        vec![
            "pending_payment",
            "pending_approval",
            "accepted",
            "in_progress",
            "delivered",
            "completed",
        ]
    );
}

#[tokio::test]
async fn delivery_is_allowed_without_an_explicit_start() {
    let (state, gateway) = common::test_state().await;
    let (customer, provider, service_id) = common::seed_marketplace(&state).await;
    let booking = common::paid_booking(&state, &gateway, &customer, &service_id).await;

    BookingService::accept(&state, &provider, &booking.id, None)
        .await
        .expect("accept");
    let booking = BookingService::deliver(&state, &provider, &booking.id, &common::delivery_request())
        .await
        .expect("deliver straight from accepted");
    assert_eq!(booking.status_enum(), BookingStatus::Delivered);
}

#[tokio::test]
async fn revision_cap_blocks_the_third_request() {
    let (state, gateway) = common::test_state().await;
    let (customer, provider, service_id) = common::seed_marketplace(&state).await;
    let booking =
        common::delivered_booking(&state, &gateway, &customer, &provider, &service_id).await;
    assert_eq!(booking.revisions_allowed, 2);

    // First revision round
    let booking = BookingService::request_revision(
        &state,
        &customer,
        &booking.id,
        &RevisionRequest {
            note: "Make the mark bolder".to_string(),
        },
    )
    .await
    .expect("first revision");
    assert_eq!(booking.status_enum(), BookingStatus::RevisionRequested);
    assert_eq!(booking.revisions_used, 1);

    let booking = BookingService::deliver(&state, &provider, &booking.id, &common::delivery_request())
        .await
        .expect("redeliver");
    assert_eq!(booking.status_enum(), BookingStatus::Delivered);

    // Second round exhausts the allowance
    let booking = BookingService::request_revision(
        &state,
        &customer,
        &booking.id,
        &RevisionRequest {
            note: "Try a serif wordmark".to_string(),
        },
    )
    .await
    .expect("second revision");
    assert_eq!(booking.revisions_used, 2);
    let booking = BookingService::deliver(&state, &provider, &booking.id, &common::delivery_request())
        .await
        .expect("redeliver again");

    // The third is rejected with the unmet guard spelled out
    let err = BookingService::request_revision(
        &state,
        &customer,
        &booking.id,
        &RevisionRequest {
            note: "One more tweak".to_string(),
        },
    )
    .await
    .unwrap_err();
    match err {
        AppError::InvalidTransition { reason, .. } => {
            assert_eq!(reason, "revision limit reached")
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn review_only_after_completion_and_only_once() {
    let (state, gateway) = common::test_state().await;
    let (customer, provider, service_id) = common::seed_marketplace(&state).await;
    let booking =
        common::delivered_booking(&state, &gateway, &customer, &provider, &service_id).await;

    let review = ReviewRequest {
        rating: 5,
        comment: Some("Exactly what we wanted".to_string()),
    };
    let err = BookingService::leave_review(&state, &customer, &booking.id, &review)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Validation(_)));

    EscrowService::final_intent(&state, &booking)
        .await
        .expect("final intent");
    let txid = common::submitted_txid(&state, &booking.id, "final").await;
    common::send_webhook(&state, &gateway, "charge.succeeded", &txid, booking.remaining_amount)
        .await
        .expect("final webhook");

    let booking = BookingService::leave_review(&state, &customer, &booking.id, &review)
        .await
        .expect("review");
    assert_eq!(booking.customer_rating, Some(5));

    let err = BookingService::leave_review(&state, &customer, &booking.id, &review)
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::Conflict));
}

#[tokio::test]
async fn declined_request_refunds_the_deposit() {
    let (state, gateway) = common::test_state().await;
    let (customer, provider, service_id) = common::seed_marketplace(&state).await;
    let booking = common::paid_booking(&state, &gateway, &customer, &service_id).await;

    let booking = BookingService::decline(
        &state,
        &provider,
        &booking.id,
        &gigmarket::models::DeclineBookingRequest {
            reason: Some("Fully booked this month".to_string()),
        },
    )
    .await
    .expect("decline");
    assert_eq!(booking.status_enum(), BookingStatus::Declined);
    assert_eq!(
        booking.decline_reason.as_deref(),
        Some("Fully booked this month")
    );

    // The full deposit goes back, submitted right away
    let payments = EscrowService::payments_for_booking(&state.db, &booking.id)
        .await
        .unwrap();
    let refund = payments
        .iter()
        .find(|p| p.stage == "refund")
        .expect("refund row");
    assert_eq!(refund.amount, 250_000);
    assert!(refund.gateway_transaction_id.is_some());
    assert!(gateway
        .calls()
        .iter()
        .any(|c| matches!(c, GatewayCall::Refund { amount: 250_000, .. })));

    // Confirmation flips the consumed charge to refunded
    let txid = common::submitted_txid(&state, &booking.id, "refund").await;
    common::send_webhook(&state, &gateway, "refund.succeeded", &txid, 250_000)
        .await
        .expect("refund webhook");
    let payments = EscrowService::payments_for_booking(&state.db, &booking.id)
        .await
        .unwrap();
    assert_eq!(
        payments.iter().find(|p| p.stage == "refund").unwrap().status,
        "completed"
    );
    assert_eq!(
        payments.iter().find(|p| p.stage == "deposit").unwrap().status,
        "refunded"
    );
}

#[tokio::test]
async fn failed_deposit_charge_cancels_the_booking() {
    let (state, gateway) = common::test_state().await;
    let (customer, _, service_id) = common::seed_marketplace(&state).await;

    let (booking, _) =
        BookingService::create_booking(&state, &customer, common::booking_request(&service_id))
            .await
            .expect("create booking");
    let txid = common::submitted_txid(&state, &booking.id, "deposit").await;
    let status = common::send_webhook(&state, &gateway, "charge.failed", &txid, 0)
        .await
        .expect("failure webhook");
    assert_eq!(status, StatusCode::OK);

    let booking = BookingService::get_booking(&state.db, &booking.id)
        .await
        .unwrap();
    assert_eq!(booking.status_enum(), BookingStatus::Cancelled);
    assert_eq!(booking.cancel_reason.as_deref(), Some("Deposit payment failed"));

    let payments = EscrowService::payments_for_booking(&state.db, &booking.id)
        .await
        .unwrap();
    assert_eq!(payments.len(), 1);
    assert_eq!(payments[0].status, "failed");
    assert!(payments[0].failure_reason.is_some());
}

#[tokio::test]
async fn repeated_payment_intent_returns_the_same_checkout_link() {
    let (state, _gateway) = common::test_state().await;
    let (customer, _, service_id) = common::seed_marketplace(&state).await;

    let (booking, first) =
        BookingService::create_booking(&state, &customer, common::booking_request(&service_id))
            .await
            .expect("create booking");
    let second = EscrowService::deposit_intent(&state, &booking)
        .await
        .expect("second intent");

    assert_eq!(first.payment_id, second.payment_id);
    assert_eq!(first.checkout_url, second.checkout_url);

    // Still a single deposit row and a single gateway charge
    let payments = EscrowService::payments_for_booking(&state.db, &booking.id)
        .await
        .unwrap();
    assert_eq!(payments.len(), 1);
}

mod common;

use gigmarket::error::AppError;
use gigmarket::models::{BookingStatus, CancelBookingRequest};
use gigmarket::services::{BookingService, EscrowService};

fn cancel_request(reason: &str) -> CancelBookingRequest {
    CancelBookingRequest {
        reason: Some(reason.to_string()),
    }
}

/// Amount of the booking's queued refund, if any
async fn refund_amount(state: &gigmarket::AppState, booking_id: &str) -> Option<i64> {
    EscrowService::payments_for_booking(&state.db, booking_id)
        .await
        .expect("load payments")
        .into_iter()
        .find(|p| p.stage == "refund")
        .map(|p| p.amount)
}

#[tokio::test]
async fn cancelling_before_acceptance_refunds_everything_paid() {
    let (state, gateway) = common::test_state().await;
    let (customer, _, service_id) = common::seed_marketplace(&state).await;
    let booking = common::paid_booking(&state, &gateway, &customer, &service_id).await;

    let booking = BookingService::cancel(
        &state,
        &customer,
        &booking.id,
        &cancel_request("Changed our plans"),
    )
    .await
    .expect("cancel");
    assert_eq!(booking.status_enum(), BookingStatus::Cancelled);
    assert_eq!(booking.cancel_reason.as_deref(), Some("Changed our plans"));
    assert!(booking.cancelled_at.is_some());

    // 100% of the paid deposit goes back
    assert_eq!(refund_amount(&state, &booking.id).await, Some(250_000));
}

#[tokio::test]
async fn cancelling_mid_work_refunds_half() {
    let (state, gateway) = common::test_state().await;
    let (customer, provider, service_id) = common::seed_marketplace(&state).await;
    let booking = common::paid_booking(&state, &gateway, &customer, &service_id).await;
    BookingService::accept(&state, &provider, &booking.id, None)
        .await
        .expect("accept");
    BookingService::start_work(&state, &provider, &booking.id)
        .await
        .expect("start work");

    let booking = BookingService::cancel(
        &state,
        &customer,
        &booking.id,
        &cancel_request("Project shelved"),
    )
    .await
    .expect("cancel");
    assert_eq!(booking.status_enum(), BookingStatus::Cancelled);

    // Half of the 250,000 paid so far
    assert_eq!(refund_amount(&state, &booking.id).await, Some(125_000));
}

#[tokio::test]
async fn cancelling_after_delivery_refunds_nothing() {
    let (state, gateway) = common::test_state().await;
    let (customer, provider, service_id) = common::seed_marketplace(&state).await;
    let booking =
        common::delivered_booking(&state, &gateway, &customer, &provider, &service_id).await;

    let booking = BookingService::cancel(
        &state,
        &customer,
        &booking.id,
        &cancel_request("Too late, sorry"),
    )
    .await
    .expect("cancel");
    assert_eq!(booking.status_enum(), BookingStatus::Cancelled);
    assert_eq!(refund_amount(&state, &booking.id).await, None);
}

#[tokio::test]
async fn cancelling_an_unpaid_booking_queues_no_refund() {
    let (state, _gateway) = common::test_state().await;
    let (customer, _, service_id) = common::seed_marketplace(&state).await;
    let (booking, _) =
        BookingService::create_booking(&state, &customer, common::booking_request(&service_id))
            .await
            .expect("create booking");

    let booking = BookingService::cancel(&state, &customer, &booking.id, &cancel_request("Typo"))
        .await
        .expect("cancel");
    assert_eq!(booking.status_enum(), BookingStatus::Cancelled);
    assert_eq!(refund_amount(&state, &booking.id).await, None);
}

#[tokio::test]
async fn the_provider_may_cancel_under_the_same_policy() {
    let (state, gateway) = common::test_state().await;
    let (customer, provider, service_id) = common::seed_marketplace(&state).await;
    let booking = common::paid_booking(&state, &gateway, &customer, &service_id).await;
    BookingService::accept(&state, &provider, &booking.id, None)
        .await
        .expect("accept");

    let booking = BookingService::cancel(
        &state,
        &provider,
        &booking.id,
        &cancel_request("Equipment failure"),
    )
    .await
    .expect("provider cancel");
    assert_eq!(booking.status_enum(), BookingStatus::Cancelled);

    // Accepted but not started: the customer is made whole
    assert_eq!(refund_amount(&state, &booking.id).await, Some(250_000));
    let timeline = BookingService::timeline(&state.db, &booking.id).await.unwrap();
    assert_eq!(timeline.last().unwrap().actor, "provider");
}

#[tokio::test]
async fn outsiders_cannot_cancel() {
    let (state, gateway) = common::test_state().await;
    let (customer, _, service_id) = common::seed_marketplace(&state).await;
    let booking = common::paid_booking(&state, &gateway, &customer, &service_id).await;
    let stranger = common::seed_user(&state.db, "stranger@example.com", "customer").await;

    let err = BookingService::cancel(&state, &stranger, &booking.id, &cancel_request("mine now"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::NotAuthorized));
}

#[tokio::test]
async fn terminal_bookings_cannot_be_cancelled_again() {
    let (state, gateway) = common::test_state().await;
    let (customer, _, service_id) = common::seed_marketplace(&state).await;
    let booking = common::paid_booking(&state, &gateway, &customer, &service_id).await;
    BookingService::cancel(&state, &customer, &booking.id, &cancel_request("First"))
        .await
        .expect("cancel");

    let err = BookingService::cancel(&state, &customer, &booking.id, &cancel_request("Second"))
        .await
        .unwrap_err();
    assert!(matches!(err, AppError::InvalidTransition { .. }));
}

#[tokio::test]
async fn refund_submission_survives_a_gateway_outage() {
    let (state, gateway) = common::test_state().await;
    let (customer, _, service_id) = common::seed_marketplace(&state).await;
    let booking = common::paid_booking(&state, &gateway, &customer, &service_id).await;

    // The refund call fails; cancellation itself must still go through
    gateway.fail_next("gateway offline", false);
    let booking = BookingService::cancel(
        &state,
        &customer,
        &booking.id,
        &cancel_request("Changed our plans"),
    )
    .await
    .expect("cancel despite outage");
    assert_eq!(booking.status_enum(), BookingStatus::Cancelled);

    // The queued refund is still waiting for the gateway
    let payments = EscrowService::payments_for_booking(&state.db, &booking.id)
        .await
        .unwrap();
    let refund = payments.iter().find(|p| p.stage == "refund").expect("refund row");
    assert_eq!(refund.status, "pending");
    assert!(refund.gateway_transaction_id.is_none());

    // The sweep picks it up once the gateway is back
    assert_eq!(EscrowService::process_pending_refunds(&state).await.unwrap(), 1);
    let payments = EscrowService::payments_for_booking(&state.db, &booking.id)
        .await
        .unwrap();
    let refund = payments.iter().find(|p| p.stage == "refund").unwrap();
    assert!(refund.gateway_transaction_id.is_some());

    // And nothing is left for the next pass
    assert_eq!(EscrowService::process_pending_refunds(&state).await.unwrap(), 0);
}

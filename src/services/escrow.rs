use chrono::{DateTime, Duration, Utc};
use sqlx::{Sqlite, Transaction};

use crate::db::Database;
use crate::error::{AppError, AppResult};
use crate::models::{
    Actor, Booking, BookingStatus, Dispute, DisputeResolution, Payment, PaymentIntent,
    PaymentStage, PaymentStatus, ResolveDisputeRequest, ResolvePaymentRequest, User,
};
use crate::services::booking::{
    append_timeline, plan_transition, BookingEvent, BookingService, MAX_TRANSITION_ATTEMPTS,
};
use crate::services::gateway::{with_backoff, GatewayCharge, GatewayEvent};
use crate::services::notify::Notice;
use crate::AppState;

/// What applying one gateway webhook event did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The event moved a payment (and possibly its booking) forward
    Applied,
    /// The payment was already terminal; the event was a duplicate
    AlreadyApplied,
    /// No payment matches the gateway transaction id
    Unknown,
    /// The event contradicts our records; the payment is held for review
    Flagged,
}

/// Escrow service: the only writer of payment rows.
///
/// Charges are created as pending rows first and submitted to the gateway
/// second, so a crash between the two leaves a retryable row instead of
/// untracked money. Webhooks complete or fail rows conditionally on their
/// pending status, which together with the unique gateway transaction id
/// makes each application exactly-once.
pub struct EscrowService;

impl EscrowService {
    /// Open (or return the already open) deposit charge for a booking
    pub async fn deposit_intent(state: &AppState, booking: &Booking) -> AppResult<PaymentIntent> {
        if booking.status_enum() != BookingStatus::PendingPayment {
            return Err(AppError::Validation(
                "booking is not awaiting its deposit".to_string(),
            ));
        }
        Self::charge_intent(state, booking, PaymentStage::Deposit, booking.deposit_amount).await
    }

    /// Open (or return the already open) final charge for a delivered booking
    pub async fn final_intent(state: &AppState, booking: &Booking) -> AppResult<PaymentIntent> {
        if booking.status_enum() != BookingStatus::Delivered {
            return Err(AppError::Validation(
                "the final payment is only due after delivery".to_string(),
            ));
        }
        Self::charge_intent(state, booking, PaymentStage::Final, booking.remaining_amount).await
    }

    async fn charge_intent(
        state: &AppState,
        booking: &Booking,
        stage: PaymentStage,
        amount: i64,
    ) -> AppResult<PaymentIntent> {
        let stage_str = String::from(stage);
        let existing: Option<Payment> = sqlx::query_as(
            "SELECT * FROM payments WHERE booking_id = ? AND stage = ? AND status != 'failed'",
        )
        .bind(&booking.id)
        .bind(&stage_str)
        .fetch_optional(state.db.pool())
        .await?;

        let payment = match existing {
            Some(p) if p.is_terminal() => return Err(AppError::PaymentAlreadyCompleted),
            Some(p) if p.is_flagged() => {
                return Err(AppError::PaymentFlagged(
                    p.flag_reason.unwrap_or_else(|| "held for review".to_string()),
                ))
            }
            Some(p) => p,
            None => {
                let id = uuid::Uuid::new_v4().to_string();
                let now = Utc::now();
                sqlx::query(
                    r#"
                    INSERT INTO payments (id, booking_id, stage, amount, status, created_at, updated_at)
                    VALUES (?, ?, ?, ?, 'pending', ?, ?)
                    "#,
                )
                .bind(&id)
                .bind(&booking.id)
                .bind(&stage_str)
                .bind(amount)
                .bind(now)
                .bind(now)
                .execute(state.db.pool())
                .await?;
                Self::get_payment(&state.db, &id).await?
            }
        };

        if payment.gateway_transaction_id.is_some() {
            return Ok(PaymentIntent {
                payment_id: payment.id,
                stage,
                amount: payment.amount,
                checkout_url: payment.checkout_url,
            });
        }

        let description = format!("{} payment for booking {}", stage_str, booking.booking_ref);
        let charge = Self::submit_charge(state, &payment, &description).await?;
        Ok(PaymentIntent {
            payment_id: payment.id,
            stage,
            amount: payment.amount,
            checkout_url: Some(charge.checkout_url),
        })
    }

    /// Send a pending charge to the gateway and record its transaction id.
    /// The payment id is the gateway idempotency key, so a second submission
    /// of the same row yields the same transaction.
    async fn submit_charge(
        state: &AppState,
        payment: &Payment,
        description: &str,
    ) -> AppResult<GatewayCharge> {
        let charge = with_backoff(&state.config.gateway, "create_charge", || {
            let gateway = state.gateway.clone();
            let reference = payment.id.clone();
            let description = description.to_string();
            let amount = payment.amount;
            async move { gateway.create_charge(&reference, amount, &description).await }
        })
        .await?;

        let res = sqlx::query(
            r#"
            UPDATE payments SET gateway_transaction_id = ?, checkout_url = ?, updated_at = ?
            WHERE id = ? AND gateway_transaction_id IS NULL
            "#,
        )
        .bind(&charge.transaction_id)
        .bind(&charge.checkout_url)
        .bind(Utc::now())
        .bind(&payment.id)
        .execute(state.db.pool())
        .await?;
        if res.rows_affected() == 0 {
            tracing::debug!("Charge for payment {} was already submitted", payment.id);
        }
        Ok(charge)
    }

    /// Apply one verified gateway webhook event.
    ///
    /// Duplicates, unknown transactions and contradictory events never
    /// mutate booking state; the outcome tells the caller which case it hit.
    pub async fn apply_gateway_event(
        state: &AppState,
        gateway_transaction_id: &str,
        event: GatewayEvent,
        amount: i64,
    ) -> AppResult<ApplyOutcome> {
        let payment: Option<Payment> =
            sqlx::query_as("SELECT * FROM payments WHERE gateway_transaction_id = ?")
                .bind(gateway_transaction_id)
                .fetch_optional(state.db.pool())
                .await?;
        let Some(payment) = payment else {
            tracing::warn!(
                "Webhook for unknown gateway transaction {}",
                gateway_transaction_id
            );
            return Ok(ApplyOutcome::Unknown);
        };

        if payment.is_terminal() {
            tracing::info!(
                "Ignoring duplicate webhook {} for payment {}",
                event.as_str(),
                payment.id
            );
            return Ok(ApplyOutcome::AlreadyApplied);
        }

        if event.is_success() && amount != payment.amount {
            let reason = format!(
                "gateway reported {} but {} was expected",
                amount, payment.amount
            );
            Self::flag_payment(&state.db, &payment.id, &reason).await?;
            tracing::warn!("Flagged payment {}: {}", payment.id, reason);
            return Ok(ApplyOutcome::Flagged);
        }

        match (payment.stage_enum(), event) {
            (PaymentStage::Deposit, GatewayEvent::ChargeSucceeded) => {
                Self::complete_deposit(state, &payment).await
            }
            (PaymentStage::Deposit, GatewayEvent::ChargeFailed) => {
                Self::fail_deposit(state, &payment, "charge failed at the gateway").await
            }
            (PaymentStage::Final, GatewayEvent::ChargeSucceeded) => {
                Self::complete_final(state, &payment).await
            }
            (PaymentStage::Final, GatewayEvent::ChargeFailed) => {
                Self::fail_payment(state, &payment, "charge failed at the gateway").await
            }
            (PaymentStage::Refund, GatewayEvent::RefundSucceeded) => {
                Self::complete_refund(state, &payment).await
            }
            (PaymentStage::Refund, GatewayEvent::RefundFailed) => {
                Self::fail_and_flag(state, &payment, "refund failed at the gateway").await
            }
            (PaymentStage::Payout, GatewayEvent::TransferSucceeded) => {
                Self::complete_payout(state, &payment).await
            }
            (PaymentStage::Payout, GatewayEvent::TransferFailed) => {
                Self::fail_and_flag(state, &payment, "transfer failed at the gateway").await
            }
            (stage, event) => {
                let reason = format!(
                    "event {} does not apply to a {:?} payment",
                    event.as_str(),
                    stage
                );
                Self::flag_payment(&state.db, &payment.id, &reason).await?;
                tracing::warn!("Flagged payment {}: {}", payment.id, reason);
                Ok(ApplyOutcome::Flagged)
            }
        }
    }

    /// Confirmed deposit: complete the payment and move the booking to
    /// pending_approval in one transaction
    async fn complete_deposit(state: &AppState, payment: &Payment) -> AppResult<ApplyOutcome> {
        for _ in 0..MAX_TRANSITION_ATTEMPTS {
            let now = Utc::now();
            let mut tx = state.db.pool().begin().await?;
            if !Self::claim_completed(&mut tx, &payment.id, now).await? {
                tx.rollback().await?;
                return Ok(ApplyOutcome::AlreadyApplied);
            }
            let booking = Self::booking_in_tx(&mut tx, &payment.booking_id).await?;
            let next = match plan_transition(&booking, BookingEvent::DepositConfirmed, now) {
                Ok(next) => next,
                Err(AppError::InvalidTransition { reason, .. }) => {
                    // Money arrived for a booking that no longer expects it
                    tx.rollback().await?;
                    let reason =
                        format!("charge succeeded but booking is {}: {}", booking.status, reason);
                    Self::flag_payment(&state.db, &payment.id, &reason).await?;
                    tracing::warn!("Flagged payment {}: {}", payment.id, reason);
                    return Ok(ApplyOutcome::Flagged);
                }
                Err(e) => {
                    tx.rollback().await?;
                    return Err(e);
                }
            };

            let res = sqlx::query(
                r#"
                UPDATE bookings
                SET status = ?, payment_stage = 'remaining', version = version + 1, updated_at = ?
                WHERE id = ? AND version = ?
                "#,
            )
            .bind(String::from(next))
            .bind(now)
            .bind(&booking.id)
            .bind(booking.version)
            .execute(&mut *tx)
            .await?;
            if res.rows_affected() == 0 {
                tx.rollback().await?;
                continue;
            }
            append_timeline(
                &mut tx,
                &booking.id,
                next,
                "Deposit payment received",
                Actor::System,
                now,
            )
            .await?;
            tx.commit().await?;

            let booking = BookingService::get_booking(&state.db, &booking.id).await?;
            state
                .notifier
                .dispatch(
                    &state.db,
                    &booking.provider_id,
                    Notice::DepositReceived { booking: &booking },
                )
                .await;
            return Ok(ApplyOutcome::Applied);
        }
        Err(AppError::Conflict)
    }

    /// Confirmed final charge: settle the booking, complete it and queue
    /// the provider payout behind the payout delay
    async fn complete_final(state: &AppState, payment: &Payment) -> AppResult<ApplyOutcome> {
        for _ in 0..MAX_TRANSITION_ATTEMPTS {
            let now = Utc::now();
            let mut tx = state.db.pool().begin().await?;
            if !Self::claim_completed(&mut tx, &payment.id, now).await? {
                tx.rollback().await?;
                return Ok(ApplyOutcome::AlreadyApplied);
            }
            let booking = Self::booking_in_tx(&mut tx, &payment.booking_id).await?;
            let next = match plan_transition(&booking, BookingEvent::FinalConfirmed, now) {
                Ok(next) => next,
                Err(AppError::InvalidTransition { reason, .. }) => {
                    tx.rollback().await?;
                    let reason =
                        format!("charge succeeded but booking is {}: {}", booking.status, reason);
                    Self::flag_payment(&state.db, &payment.id, &reason).await?;
                    tracing::warn!("Flagged payment {}: {}", payment.id, reason);
                    return Ok(ApplyOutcome::Flagged);
                }
                Err(e) => {
                    tx.rollback().await?;
                    return Err(e);
                }
            };

            let res = sqlx::query(
                r#"
                UPDATE bookings
                SET status = ?, payment_stage = 'settled', completed_at = ?,
                    version = version + 1, updated_at = ?
                WHERE id = ? AND version = ?
                "#,
            )
            .bind(String::from(next))
            .bind(now)
            .bind(now)
            .bind(&booking.id)
            .bind(booking.version)
            .execute(&mut *tx)
            .await?;
            if res.rows_affected() == 0 {
                tx.rollback().await?;
                continue;
            }
            if booking.provider_earnings > 0 {
                let not_before = now + Duration::hours(state.config.booking.payout_delay_hours);
                Self::queue_payout(&mut tx, &booking.id, booking.provider_earnings, not_before, now)
                    .await?;
            }
            append_timeline(
                &mut tx,
                &booking.id,
                next,
                "Final payment received, booking completed",
                Actor::System,
                now,
            )
            .await?;
            tx.commit().await?;

            let booking = BookingService::get_booking(&state.db, &booking.id).await?;
            for party in [&booking.customer_id, &booking.provider_id] {
                state
                    .notifier
                    .dispatch(&state.db, party, Notice::BookingCompleted { booking: &booking })
                    .await;
            }
            return Ok(ApplyOutcome::Applied);
        }
        Err(AppError::Conflict)
    }

    /// Failed deposit charge: fail the payment and cancel the booking,
    /// which never got anywhere without its deposit
    async fn fail_deposit(
        state: &AppState,
        payment: &Payment,
        reason: &str,
    ) -> AppResult<ApplyOutcome> {
        for _ in 0..MAX_TRANSITION_ATTEMPTS {
            let now = Utc::now();
            let mut tx = state.db.pool().begin().await?;
            if !Self::claim_failed(&mut tx, &payment.id, reason, now).await? {
                tx.rollback().await?;
                return Ok(ApplyOutcome::AlreadyApplied);
            }
            let booking = Self::booking_in_tx(&mut tx, &payment.booking_id).await?;
            match plan_transition(&booking, BookingEvent::DepositFailed, now) {
                Ok(next) => {
                    let res = sqlx::query(
                        r#"
                        UPDATE bookings
                        SET status = ?, cancel_reason = 'Deposit payment failed', cancelled_at = ?,
                            version = version + 1, updated_at = ?
                        WHERE id = ? AND version = ?
                        "#,
                    )
                    .bind(String::from(next))
                    .bind(now)
                    .bind(now)
                    .bind(&booking.id)
                    .bind(booking.version)
                    .execute(&mut *tx)
                    .await?;
                    if res.rows_affected() == 0 {
                        tx.rollback().await?;
                        continue;
                    }
                    append_timeline(
                        &mut tx,
                        &booking.id,
                        next,
                        "Deposit payment failed, booking cancelled",
                        Actor::System,
                        now,
                    )
                    .await?;
                    tx.commit().await?;

                    let booking = BookingService::get_booking(&state.db, &booking.id).await?;
                    state
                        .notifier
                        .dispatch(
                            &state.db,
                            &booking.customer_id,
                            Notice::BookingCancelled {
                                booking: &booking,
                                refund: 0,
                            },
                        )
                        .await;
                    return Ok(ApplyOutcome::Applied);
                }
                // Booking moved on already; the failed charge stands alone
                Err(AppError::InvalidTransition { .. }) => {
                    tx.commit().await?;
                    return Ok(ApplyOutcome::Applied);
                }
                Err(e) => {
                    tx.rollback().await?;
                    return Err(e);
                }
            }
        }
        Err(AppError::Conflict)
    }

    /// Failed charge that does not move the booking; the customer may retry
    async fn fail_payment(
        state: &AppState,
        payment: &Payment,
        reason: &str,
    ) -> AppResult<ApplyOutcome> {
        let now = Utc::now();
        let mut tx = state.db.pool().begin().await?;
        if !Self::claim_failed(&mut tx, &payment.id, reason, now).await? {
            tx.rollback().await?;
            return Ok(ApplyOutcome::AlreadyApplied);
        }
        tx.commit().await?;
        tracing::info!(
            "Charge for payment {} failed; a new attempt may be opened",
            payment.id
        );
        Ok(ApplyOutcome::Applied)
    }

    /// Completed refund: mark consumed charges as refunded
    async fn complete_refund(state: &AppState, payment: &Payment) -> AppResult<ApplyOutcome> {
        let now = Utc::now();
        let mut tx = state.db.pool().begin().await?;
        if !Self::claim_completed(&mut tx, &payment.id, now).await? {
            tx.rollback().await?;
            return Ok(ApplyOutcome::AlreadyApplied);
        }
        let charges: Vec<Payment> = sqlx::query_as(
            r#"
            SELECT * FROM payments
            WHERE booking_id = ? AND stage IN ('deposit', 'final') AND status = 'completed'
            ORDER BY created_at ASC
            "#,
        )
        .bind(&payment.booking_id)
        .fetch_all(&mut *tx)
        .await?;
        // Partial refunds leave charges completed; only fully covered
        // charges flip to refunded
        let mut remaining = payment.amount;
        for charge in &charges {
            if charge.amount > remaining {
                break;
            }
            sqlx::query("UPDATE payments SET status = 'refunded', updated_at = ? WHERE id = ?")
                .bind(now)
                .bind(&charge.id)
                .execute(&mut *tx)
                .await?;
            remaining -= charge.amount;
        }
        tx.commit().await?;

        let booking = BookingService::get_booking(&state.db, &payment.booking_id).await?;
        state
            .notifier
            .dispatch(
                &state.db,
                &booking.customer_id,
                Notice::RefundCompleted {
                    booking: &booking,
                    amount: payment.amount,
                },
            )
            .await;
        Ok(ApplyOutcome::Applied)
    }

    /// Completed payout: the provider has been paid
    async fn complete_payout(state: &AppState, payment: &Payment) -> AppResult<ApplyOutcome> {
        let now = Utc::now();
        let mut tx = state.db.pool().begin().await?;
        if !Self::claim_completed(&mut tx, &payment.id, now).await? {
            tx.rollback().await?;
            return Ok(ApplyOutcome::AlreadyApplied);
        }
        tx.commit().await?;

        let booking = BookingService::get_booking(&state.db, &payment.booking_id).await?;
        state
            .notifier
            .dispatch(
                &state.db,
                &booking.provider_id,
                Notice::PayoutCompleted {
                    booking: &booking,
                    amount: payment.amount,
                },
            )
            .await;
        Ok(ApplyOutcome::Applied)
    }

    /// Failed outbound transfer: the money is still owed, keep it visible
    async fn fail_and_flag(
        state: &AppState,
        payment: &Payment,
        reason: &str,
    ) -> AppResult<ApplyOutcome> {
        let now = Utc::now();
        let res = sqlx::query(
            r#"
            UPDATE payments SET status = 'failed', failure_reason = ?, flag_reason = ?, updated_at = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(reason)
        .bind(reason)
        .bind(now)
        .bind(&payment.id)
        .execute(state.db.pool())
        .await?;
        if res.rows_affected() == 0 {
            return Ok(ApplyOutcome::AlreadyApplied);
        }
        tracing::error!("{} payment {} failed: {}", payment.stage, payment.id, reason);
        Ok(ApplyOutcome::Applied)
    }

    /// Insert a pending refund row inside a booking transition transaction
    pub(crate) async fn queue_refund(
        tx: &mut Transaction<'_, Sqlite>,
        booking_id: &str,
        amount: i64,
        now: DateTime<Utc>,
    ) -> AppResult<String> {
        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO payments (id, booking_id, stage, amount, status, created_at, updated_at)
            VALUES (?, ?, 'refund', ?, 'pending', ?, ?)
            "#,
        )
        .bind(&id)
        .bind(booking_id)
        .bind(amount)
        .bind(now)
        .bind(now)
        .execute(&mut **tx)
        .await?;
        Ok(id)
    }

    /// Refund everything paid so far, if anything
    pub(crate) async fn queue_full_refund(
        tx: &mut Transaction<'_, Sqlite>,
        booking_id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<Option<String>> {
        let paid = Self::paid_so_far(tx, booking_id).await?;
        if paid > 0 {
            let id = Self::queue_refund(tx, booking_id, paid, now).await?;
            Ok(Some(id))
        } else {
            Ok(None)
        }
    }

    async fn queue_payout(
        tx: &mut Transaction<'_, Sqlite>,
        booking_id: &str,
        amount: i64,
        not_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> AppResult<String> {
        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO payments (id, booking_id, stage, amount, status, not_before, created_at, updated_at)
            VALUES (?, ?, 'payout', ?, 'pending', ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(booking_id)
        .bind(amount)
        .bind(not_before)
        .bind(now)
        .bind(now)
        .execute(&mut **tx)
        .await?;
        Ok(id)
    }

    /// Sum of confirmed charges for a booking
    pub(crate) async fn paid_so_far(
        tx: &mut Transaction<'_, Sqlite>,
        booking_id: &str,
    ) -> AppResult<i64> {
        let (paid,): (i64,) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(amount), 0) FROM payments
            WHERE booking_id = ? AND stage IN ('deposit', 'final') AND status = 'completed'
            "#,
        )
        .bind(booking_id)
        .fetch_one(&mut **tx)
        .await?;
        Ok(paid)
    }

    /// Submit whatever outbound money a booking has queued and due.
    /// Best-effort: anything that fails here is retried by the sweep.
    pub(crate) async fn submit_outbound_for_booking(state: &AppState, booking_id: &str) {
        let pending: Result<Vec<Payment>, sqlx::Error> = sqlx::query_as(
            r#"
            SELECT * FROM payments
            WHERE booking_id = ? AND stage IN ('refund', 'payout') AND status = 'pending'
              AND gateway_transaction_id IS NULL AND flag_reason IS NULL
              AND (not_before IS NULL OR not_before <= ?)
            "#,
        )
        .bind(booking_id)
        .bind(Utc::now())
        .fetch_all(state.db.pool())
        .await;

        match pending {
            Ok(rows) => {
                for payment in rows {
                    let submitted = match payment.stage_enum() {
                        PaymentStage::Refund => Self::submit_refund(state, &payment).await,
                        _ => Self::submit_payout(state, &payment).await,
                    };
                    if let Err(e) = submitted {
                        tracing::warn!(
                            "{} {} not submitted yet, the sweep will retry: {}",
                            payment.stage,
                            payment.id,
                            e
                        );
                    }
                }
            }
            Err(e) => {
                tracing::error!("Failed to load payments for booking {}: {}", booking_id, e);
            }
        }
    }

    /// Send one pending refund to the gateway against the first recorded
    /// charge. Returns false when the row had to be flagged instead.
    async fn submit_refund(state: &AppState, payment: &Payment) -> AppResult<bool> {
        let source: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT gateway_transaction_id FROM payments
            WHERE booking_id = ? AND stage IN ('deposit', 'final')
              AND status IN ('completed', 'refunded') AND gateway_transaction_id IS NOT NULL
            ORDER BY created_at ASC LIMIT 1
            "#,
        )
        .bind(&payment.booking_id)
        .fetch_optional(state.db.pool())
        .await?;
        let Some((charge_transaction_id,)) = source else {
            Self::flag_payment(&state.db, &payment.id, "no completed charge to refund against")
                .await?;
            tracing::error!("Refund {} has no source charge, flagged", payment.id);
            return Ok(false);
        };

        let gateway_id = with_backoff(&state.config.gateway, "create_refund", || {
            let gateway = state.gateway.clone();
            let reference = payment.id.clone();
            let charge_transaction_id = charge_transaction_id.clone();
            let amount = payment.amount;
            async move {
                gateway
                    .create_refund(&reference, &charge_transaction_id, amount)
                    .await
            }
        })
        .await?;

        Self::record_submission(&state.db, &payment.id, &gateway_id).await?;
        Ok(true)
    }

    /// Send one due payout to the gateway
    async fn submit_payout(state: &AppState, payment: &Payment) -> AppResult<bool> {
        let booking = BookingService::get_booking(&state.db, &payment.booking_id).await?;
        let gateway_id = with_backoff(&state.config.gateway, "create_transfer", || {
            let gateway = state.gateway.clone();
            let reference = payment.id.clone();
            let recipient = booking.provider_id.clone();
            let amount = payment.amount;
            async move { gateway.create_transfer(&reference, &recipient, amount).await }
        })
        .await?;

        Self::record_submission(&state.db, &payment.id, &gateway_id).await?;
        Ok(true)
    }

    async fn record_submission(
        db: &Database,
        payment_id: &str,
        gateway_transaction_id: &str,
    ) -> AppResult<()> {
        let res = sqlx::query(
            r#"
            UPDATE payments SET gateway_transaction_id = ?, updated_at = ?
            WHERE id = ? AND gateway_transaction_id IS NULL
            "#,
        )
        .bind(gateway_transaction_id)
        .bind(Utc::now())
        .bind(payment_id)
        .execute(db.pool())
        .await?;
        if res.rows_affected() == 0 {
            tracing::debug!("Payment {} was already submitted", payment_id);
        }
        Ok(())
    }

    /// Sweep pass: submit refunds that never reached the gateway
    pub async fn process_pending_refunds(state: &AppState) -> AppResult<u32> {
        let pending: Vec<Payment> = sqlx::query_as(
            r#"
            SELECT * FROM payments
            WHERE stage = 'refund' AND status = 'pending'
              AND gateway_transaction_id IS NULL AND flag_reason IS NULL
            ORDER BY created_at ASC LIMIT 50
            "#,
        )
        .fetch_all(state.db.pool())
        .await?;

        let mut submitted = 0;
        for payment in pending {
            match Self::submit_refund(state, &payment).await {
                Ok(true) => submitted += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!("Refund {} submission failed: {}", payment.id, e);
                }
            }
        }
        Ok(submitted)
    }

    /// Sweep pass: submit payouts whose hold-back has elapsed
    pub async fn process_due_payouts(state: &AppState) -> AppResult<u32> {
        let due: Vec<Payment> = sqlx::query_as(
            r#"
            SELECT * FROM payments
            WHERE stage = 'payout' AND status = 'pending'
              AND gateway_transaction_id IS NULL AND flag_reason IS NULL
              AND (not_before IS NULL OR not_before <= ?)
            ORDER BY created_at ASC LIMIT 50
            "#,
        )
        .bind(Utc::now())
        .fetch_all(state.db.pool())
        .await?;

        let mut submitted = 0;
        for payment in due {
            match Self::submit_payout(state, &payment).await {
                Ok(true) => submitted += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!("Payout {} submission failed: {}", payment.id, e);
                }
            }
        }
        Ok(submitted)
    }

    /// Payments held for manual review
    pub async fn list_flagged(db: &Database) -> AppResult<Vec<Payment>> {
        let payments = sqlx::query_as(
            "SELECT * FROM payments WHERE flag_reason IS NOT NULL ORDER BY updated_at DESC",
        )
        .fetch_all(db.pool())
        .await?;
        Ok(payments)
    }

    /// Admin decision on a flagged payment.
    ///
    /// Pending rows can be completed (through the same paths a webhook
    /// takes) or failed. Failed refunds and payouts can be retried, which
    /// clones them into a fresh pending row.
    pub async fn resolve_flagged(
        state: &AppState,
        payment_id: &str,
        req: &ResolvePaymentRequest,
    ) -> AppResult<Payment> {
        let payment = Self::get_payment(&state.db, payment_id).await?;
        if !payment.is_flagged() {
            return Err(AppError::Validation("payment is not flagged".to_string()));
        }

        match (payment.status_enum(), req.action.as_str()) {
            (PaymentStatus::Pending, "complete") => {
                let outcome = match payment.stage_enum() {
                    PaymentStage::Deposit => Self::complete_deposit(state, &payment).await?,
                    PaymentStage::Final => Self::complete_final(state, &payment).await?,
                    PaymentStage::Refund => Self::complete_refund(state, &payment).await?,
                    PaymentStage::Payout => Self::complete_payout(state, &payment).await?,
                };
                match outcome {
                    ApplyOutcome::Applied => {}
                    ApplyOutcome::AlreadyApplied => return Err(AppError::PaymentAlreadyCompleted),
                    ApplyOutcome::Flagged | ApplyOutcome::Unknown => {
                        let payment = Self::get_payment(&state.db, payment_id).await?;
                        return Err(AppError::PaymentFlagged(
                            payment
                                .flag_reason
                                .unwrap_or_else(|| "held for review".to_string()),
                        ));
                    }
                }
            }
            (PaymentStatus::Pending, "fail") => {
                let reason = req
                    .note
                    .clone()
                    .unwrap_or_else(|| "rejected by admin".to_string());
                let outcome = match payment.stage_enum() {
                    PaymentStage::Deposit => Self::fail_deposit(state, &payment, &reason).await?,
                    _ => Self::fail_payment(state, &payment, &reason).await?,
                };
                if outcome == ApplyOutcome::AlreadyApplied {
                    return Err(AppError::PaymentAlreadyCompleted);
                }
            }
            (PaymentStatus::Failed, "retry") if !payment.stage_enum().is_charge() => {
                Self::retry_outbound(state, &payment).await?;
            }
            _ => {
                return Err(AppError::Validation(format!(
                    "action '{}' does not apply to this payment",
                    req.action
                )))
            }
        }

        Self::get_payment(&state.db, payment_id).await
    }

    /// Clone a failed refund or payout into a fresh pending row and clear
    /// the flag on the original
    async fn retry_outbound(state: &AppState, payment: &Payment) -> AppResult<()> {
        let now = Utc::now();
        let id = uuid::Uuid::new_v4().to_string();
        let not_before = match payment.stage_enum() {
            PaymentStage::Payout => Some(now),
            _ => None,
        };
        let mut tx = state.db.pool().begin().await?;
        sqlx::query(
            r#"
            INSERT INTO payments (id, booking_id, stage, amount, status, not_before, created_at, updated_at)
            VALUES (?, ?, ?, ?, 'pending', ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&payment.booking_id)
        .bind(&payment.stage)
        .bind(payment.amount)
        .bind(not_before)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        sqlx::query("UPDATE payments SET flag_reason = NULL, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(&payment.id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        Self::submit_outbound_for_booking(state, &payment.booking_id).await;
        Ok(())
    }

    /// Resolve an open dispute by splitting the held funds.
    ///
    /// The booking stays disputed; money moves through ordinary refund and
    /// payout rows so the same webhooks and sweeps carry them to the end.
    pub async fn resolve_dispute(
        state: &AppState,
        admin: &User,
        dispute_id: &str,
        req: &ResolveDisputeRequest,
    ) -> AppResult<Dispute> {
        let dispute = Self::get_dispute(&state.db, dispute_id).await?;
        if !dispute.is_open() {
            return Err(AppError::DisputeAlreadyResolved);
        }
        let resolution =
            DisputeResolution::parse(&req.resolution).ok_or(AppError::InvalidResolution)?;
        let booking = BookingService::get_booking(&state.db, &dispute.booking_id).await?;

        let now = Utc::now();
        let mut tx = state.db.pool().begin().await?;
        let charged = Self::paid_so_far(&mut tx, &booking.id).await?;
        let (refunded,): (i64,) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(amount), 0) FROM payments
            WHERE booking_id = ? AND stage = 'refund' AND status != 'failed'
            "#,
        )
        .bind(&booking.id)
        .fetch_one(&mut *tx)
        .await?;
        let held = (charged - refunded).max(0);
        let (customer_amount, provider_amount) = resolution.calculate_amounts(held);

        let res = sqlx::query(
            r#"
            UPDATE disputes
            SET status = 'resolved', resolution = ?, resolution_notes = ?, resolved_by = ?, resolved_at = ?
            WHERE id = ? AND status = 'open'
            "#,
        )
        .bind(resolution.as_string())
        .bind(&req.notes)
        .bind(&admin.id)
        .bind(now)
        .bind(&dispute.id)
        .execute(&mut *tx)
        .await?;
        if res.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(AppError::DisputeAlreadyResolved);
        }

        if customer_amount > 0 {
            Self::queue_refund(&mut tx, &booking.id, customer_amount, now).await?;
        }
        if provider_amount > 0 {
            Self::queue_payout(&mut tx, &booking.id, provider_amount, now, now).await?;
        }
        let note = format!(
            "Dispute resolved: {} ({} back to customer, {} to provider)",
            resolution.as_string(),
            customer_amount,
            provider_amount
        );
        append_timeline(&mut tx, &booking.id, BookingStatus::Disputed, &note, Actor::Admin, now)
            .await?;
        tx.commit().await?;

        Self::submit_outbound_for_booking(state, &booking.id).await;
        Self::get_dispute(&state.db, dispute_id).await
    }

    /// Get payment by ID
    pub async fn get_payment(db: &Database, payment_id: &str) -> AppResult<Payment> {
        sqlx::query_as::<_, Payment>("SELECT * FROM payments WHERE id = ?")
            .bind(payment_id)
            .fetch_optional(db.pool())
            .await?
            .ok_or(AppError::PaymentNotFound)
    }

    /// All payment rows of a booking, oldest first
    pub async fn payments_for_booking(db: &Database, booking_id: &str) -> AppResult<Vec<Payment>> {
        let payments =
            sqlx::query_as("SELECT * FROM payments WHERE booking_id = ? ORDER BY created_at ASC")
                .bind(booking_id)
                .fetch_all(db.pool())
                .await?;
        Ok(payments)
    }

    /// Get dispute by ID
    pub async fn get_dispute(db: &Database, dispute_id: &str) -> AppResult<Dispute> {
        sqlx::query_as::<_, Dispute>("SELECT * FROM disputes WHERE id = ?")
            .bind(dispute_id)
            .fetch_optional(db.pool())
            .await?
            .ok_or(AppError::DisputeNotFound)
    }

    /// List disputes, optionally filtered by status
    pub async fn list_disputes(db: &Database, status: Option<&str>) -> AppResult<Vec<Dispute>> {
        let disputes = match status {
            Some(status) => {
                sqlx::query_as("SELECT * FROM disputes WHERE status = ? ORDER BY created_at DESC")
                    .bind(status)
                    .fetch_all(db.pool())
                    .await?
            }
            None => {
                sqlx::query_as("SELECT * FROM disputes ORDER BY created_at DESC")
                    .fetch_all(db.pool())
                    .await?
            }
        };
        Ok(disputes)
    }

    async fn booking_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        booking_id: &str,
    ) -> AppResult<Booking> {
        sqlx::query_as::<_, Booking>("SELECT * FROM bookings WHERE id = ?")
            .bind(booking_id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or(AppError::BookingNotFound)
    }

    /// Move a pending payment to completed; false means it was not pending
    async fn claim_completed(
        tx: &mut Transaction<'_, Sqlite>,
        payment_id: &str,
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        let res = sqlx::query(
            r#"
            UPDATE payments
            SET status = 'completed', flag_reason = NULL, completed_at = ?, updated_at = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(payment_id)
        .execute(&mut **tx)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    /// Move a pending payment to failed; false means it was not pending
    async fn claim_failed(
        tx: &mut Transaction<'_, Sqlite>,
        payment_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> AppResult<bool> {
        let res = sqlx::query(
            r#"
            UPDATE payments
            SET status = 'failed', failure_reason = ?, flag_reason = NULL, updated_at = ?
            WHERE id = ? AND status = 'pending'
            "#,
        )
        .bind(reason)
        .bind(now)
        .bind(payment_id)
        .execute(&mut **tx)
        .await?;
        Ok(res.rows_affected() > 0)
    }

    async fn flag_payment(db: &Database, payment_id: &str, reason: &str) -> AppResult<()> {
        sqlx::query(
            "UPDATE payments SET flag_reason = ?, updated_at = ? WHERE id = ? AND status = 'pending'",
        )
        .bind(reason)
        .bind(Utc::now())
        .bind(payment_id)
        .execute(db.pool())
        .await?;
        Ok(())
    }
}

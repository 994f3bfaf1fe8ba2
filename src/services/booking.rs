use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use sqlx::{Sqlite, Transaction};

use crate::db::Database;
use crate::error::{AppError, AppResult};
use crate::models::{
    Actor, Booking, BookingStatus, CancelBookingRequest, CreateBookingRequest,
    DeclineBookingRequest, Deliverable, DeliverRequest, OpenDisputeRequest, PaymentIntent,
    ReviewRequest, RevisionRequest, Service, ServicePackage, TimelineEntry, User,
};
use crate::services::escrow::EscrowService;
use crate::services::ledger;
use crate::services::notify::Notice;
use crate::AppState;

/// Retries for a status write that lost the optimistic version race
pub(crate) const MAX_TRANSITION_ATTEMPTS: u32 = 3;

/// Lifecycle event applied to a booking
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingEvent {
    DepositConfirmed,
    DepositFailed,
    Accept,
    Decline,
    DeadlineExpired,
    StartWork,
    Deliver,
    RequestRevision,
    FinalConfirmed,
    Cancel,
    OpenDispute,
}

impl BookingEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            BookingEvent::DepositConfirmed => "deposit_confirmed",
            BookingEvent::DepositFailed => "deposit_failed",
            BookingEvent::Accept => "accept",
            BookingEvent::Decline => "decline",
            BookingEvent::DeadlineExpired => "deadline_expired",
            BookingEvent::StartWork => "start_work",
            BookingEvent::Deliver => "deliver",
            BookingEvent::RequestRevision => "request_revision",
            BookingEvent::FinalConfirmed => "final_confirmed",
            BookingEvent::Cancel => "cancel",
            BookingEvent::OpenDispute => "open_dispute",
        }
    }
}

/// Plan the next status for an event against the current booking state.
///
/// Pure: evaluates guards against the supplied clock and either names the
/// target status or explains exactly which guard failed. Callers persist
/// the result atomically; a failed plan must leave no trace.
pub fn plan_transition(
    booking: &Booking,
    event: BookingEvent,
    now: DateTime<Utc>,
) -> AppResult<BookingStatus> {
    use BookingEvent as E;
    use BookingStatus as S;

    let from = booking.status_enum();
    let denied = |reason: &str| {
        Err(AppError::InvalidTransition {
            from: booking.status.clone(),
            event: event.as_str().to_string(),
            reason: reason.to_string(),
        })
    };

    match (from, event) {
        (S::PendingPayment, E::DepositConfirmed) => Ok(S::PendingApproval),
        (S::PendingPayment, E::DepositFailed) => Ok(S::Cancelled),

        (S::PendingApproval, E::Accept) => {
            if booking.within_response_window(now) {
                Ok(S::Accepted)
            } else {
                denied("response deadline passed")
            }
        }
        (S::PendingApproval, E::Decline) => Ok(S::Declined),
        (S::PendingApproval, E::DeadlineExpired) => {
            if now > booking.response_deadline {
                Ok(S::Declined)
            } else {
                denied("response deadline not reached")
            }
        }

        (S::Accepted, E::StartWork) => Ok(S::InProgress),
        // Delivery straight from accepted is allowed; an explicit start is not required
        (S::Accepted | S::InProgress | S::RevisionRequested, E::Deliver) => Ok(S::Delivered),

        (S::Delivered, E::RequestRevision) => {
            if booking.has_revisions_left() {
                Ok(S::RevisionRequested)
            } else {
                denied("revision limit reached")
            }
        }
        (S::Delivered, E::FinalConfirmed) => Ok(S::Completed),

        (_, E::Cancel) if !from.is_terminal() => Ok(S::Cancelled),
        (_, E::OpenDispute) if !from.is_terminal() => Ok(S::Disputed),

        _ => denied("event not allowed in this status"),
    }
}

/// Append an audit row; always inside the transaction of the change it records
pub(crate) async fn append_timeline(
    tx: &mut Transaction<'_, Sqlite>,
    booking_id: &str,
    status: BookingStatus,
    note: &str,
    actor: Actor,
    now: DateTime<Utc>,
) -> AppResult<()> {
    sqlx::query(
        r#"
        INSERT INTO booking_timeline (id, booking_id, status, note, actor, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(uuid::Uuid::new_v4().to_string())
    .bind(booking_id)
    .bind(String::from(status))
    .bind(note)
    .bind(actor.as_str())
    .bind(now)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Booking lifecycle service
pub struct BookingService;

impl BookingService {
    /// Create a booking from a service package and open the deposit
    /// payment intent. Terms are snapshotted; the booking starts in
    /// pending_payment and only the confirmed deposit moves it on.
    pub async fn create_booking(
        state: &AppState,
        customer: &User,
        req: CreateBookingRequest,
    ) -> AppResult<(Booking, PaymentIntent)> {
        if req.title.trim().is_empty() {
            return Err(AppError::Validation("title must not be empty".to_string()));
        }

        let service: Service = sqlx::query_as("SELECT * FROM services WHERE id = ?")
            .bind(&req.service_id)
            .fetch_optional(state.db.pool())
            .await?
            .ok_or(AppError::ServiceNotFound)?;
        if !service.is_active {
            return Err(AppError::ServiceNotAvailable);
        }
        if service.provider_id == customer.id {
            return Err(AppError::Validation(
                "cannot book your own service".to_string(),
            ));
        }

        let package: ServicePackage =
            sqlx::query_as("SELECT * FROM service_packages WHERE service_id = ? AND name = ?")
                .bind(&service.id)
                .bind(&req.package_name)
                .fetch_optional(state.db.pool())
                .await?
                .ok_or(AppError::PackageNotFound)?;

        let provider: User = sqlx::query_as("SELECT * FROM users WHERE id = ?")
            .bind(&service.provider_id)
            .fetch_optional(state.db.pool())
            .await?
            .ok_or(AppError::UserNotFound)?;

        let total = package.price;
        let (deposit, remaining) = ledger::deposit_split(total);
        let rate = provider
            .commission_rate
            .unwrap_or(state.config.booking.commission_rate_percent);
        let (commission, earnings) = ledger::commission_split(total, rate);

        let id = uuid::Uuid::new_v4().to_string();
        let booking_ref = Self::allocate_booking_ref(&state.db).await?;
        let now = Utc::now();
        let response_deadline = now + Duration::hours(state.config.booking.response_window_hours);

        let mut tx = state.db.pool().begin().await?;
        sqlx::query(
            r#"
            INSERT INTO bookings (
                id, booking_ref, customer_id, provider_id, service_id,
                package_name, title, requirements,
                total_amount, deposit_amount, remaining_amount,
                commission_rate, commission_amount, provider_earnings,
                delivery_days, revisions_allowed,
                status, payment_stage, response_deadline, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'pending_payment', 'deposit', ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&booking_ref)
        .bind(&customer.id)
        .bind(&service.provider_id)
        .bind(&service.id)
        .bind(&package.name)
        .bind(req.title.trim())
        .bind(&req.requirements)
        .bind(total)
        .bind(deposit)
        .bind(remaining)
        .bind(rate)
        .bind(commission)
        .bind(earnings)
        .bind(package.delivery_days)
        .bind(package.revisions_allowed)
        .bind(response_deadline)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        append_timeline(
            &mut tx,
            &id,
            BookingStatus::PendingPayment,
            "Booking created, awaiting deposit payment",
            Actor::Customer,
            now,
        )
        .await?;
        tx.commit().await?;

        let booking = Self::get_booking(&state.db, &id).await?;
        state
            .notifier
            .dispatch(
                &state.db,
                &booking.customer_id,
                Notice::BookingCreated { booking: &booking },
            )
            .await;

        let intent = EscrowService::deposit_intent(state, &booking).await?;
        Ok((booking, intent))
    }

    /// Provider accepts a paid booking request within the response window
    pub async fn accept(
        state: &AppState,
        provider: &User,
        booking_id: &str,
        message: Option<&str>,
    ) -> AppResult<Booking> {
        for _ in 0..MAX_TRANSITION_ATTEMPTS {
            let booking = Self::get_booking(&state.db, booking_id).await?;
            if booking.provider_id != provider.id {
                return Err(AppError::NotAuthorized);
            }
            let now = Utc::now();
            let next = plan_transition(&booking, BookingEvent::Accept, now)?;
            let expected_delivery = now + Duration::days(booking.delivery_days);

            let mut tx = state.db.pool().begin().await?;
            let res = sqlx::query(
                r#"
                UPDATE bookings
                SET status = ?, accepted_at = ?, expected_delivery = ?, provider_message = ?,
                    version = version + 1, updated_at = ?
                WHERE id = ? AND version = ?
                "#,
            )
            .bind(String::from(next))
            .bind(now)
            .bind(expected_delivery)
            .bind(message)
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
                "Provider accepted the booking",
                Actor::Provider,
                now,
            )
            .await?;
            tx.commit().await?;

            let booking = Self::get_booking(&state.db, booking_id).await?;
            state
                .notifier
                .dispatch(
                    &state.db,
                    &booking.customer_id,
                    Notice::BookingAccepted { booking: &booking },
                )
                .await;
            return Ok(booking);
        }
        Err(AppError::Conflict)
    }

    /// Provider declines a paid booking request; the deposit is refunded in full
    pub async fn decline(
        state: &AppState,
        provider: &User,
        booking_id: &str,
        req: &DeclineBookingRequest,
    ) -> AppResult<Booking> {
        for _ in 0..MAX_TRANSITION_ATTEMPTS {
            let booking = Self::get_booking(&state.db, booking_id).await?;
            if booking.provider_id != provider.id {
                return Err(AppError::NotAuthorized);
            }
            let now = Utc::now();
            let next = plan_transition(&booking, BookingEvent::Decline, now)?;

            let mut tx = state.db.pool().begin().await?;
            let res = sqlx::query(
                r#"
                UPDATE bookings
                SET status = ?, decline_reason = ?, version = version + 1, updated_at = ?
                WHERE id = ? AND version = ?
                "#,
            )
            .bind(String::from(next))
            .bind(&req.reason)
            .bind(now)
            .bind(&booking.id)
            .bind(booking.version)
            .execute(&mut *tx)
            .await?;
            if res.rows_affected() == 0 {
                tx.rollback().await?;
                continue;
            }
            EscrowService::queue_full_refund(&mut tx, &booking.id, now).await?;
            let note = match &req.reason {
                Some(reason) => format!("Provider declined the booking: {}", reason),
                None => "Provider declined the booking".to_string(),
            };
            append_timeline(&mut tx, &booking.id, next, &note, Actor::Provider, now).await?;
            tx.commit().await?;

            EscrowService::submit_outbound_for_booking(state, &booking.id).await;
            let booking = Self::get_booking(&state.db, booking_id).await?;
            state
                .notifier
                .dispatch(
                    &state.db,
                    &booking.customer_id,
                    Notice::BookingDeclined { booking: &booking },
                )
                .await;
            return Ok(booking);
        }
        Err(AppError::Conflict)
    }

    /// Provider marks work as started
    pub async fn start_work(state: &AppState, provider: &User, booking_id: &str) -> AppResult<Booking> {
        for _ in 0..MAX_TRANSITION_ATTEMPTS {
            let booking = Self::get_booking(&state.db, booking_id).await?;
            if booking.provider_id != provider.id {
                return Err(AppError::NotAuthorized);
            }
            let now = Utc::now();
            let next = plan_transition(&booking, BookingEvent::StartWork, now)?;

            let mut tx = state.db.pool().begin().await?;
            let res = sqlx::query(
                "UPDATE bookings SET status = ?, version = version + 1, updated_at = ? WHERE id = ? AND version = ?",
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
            append_timeline(&mut tx, &booking.id, next, "Work started", Actor::Provider, now)
                .await?;
            tx.commit().await?;

            return Self::get_booking(&state.db, booking_id).await;
        }
        Err(AppError::Conflict)
    }

    /// Provider delivers work with at least one deliverable attached
    pub async fn deliver(
        state: &AppState,
        provider: &User,
        booking_id: &str,
        req: &DeliverRequest,
    ) -> AppResult<Booking> {
        if req.deliverables.is_empty() {
            return Err(AppError::Validation(
                "at least one deliverable is required".to_string(),
            ));
        }
        for deliverable in &req.deliverables {
            if deliverable.filename.trim().is_empty() || deliverable.url.trim().is_empty() {
                return Err(AppError::Validation(
                    "deliverables need a filename and a url".to_string(),
                ));
            }
        }

        for _ in 0..MAX_TRANSITION_ATTEMPTS {
            let booking = Self::get_booking(&state.db, booking_id).await?;
            if booking.provider_id != provider.id {
                return Err(AppError::NotAuthorized);
            }
            let now = Utc::now();
            let redelivery = booking.status_enum() == BookingStatus::RevisionRequested;
            let next = plan_transition(&booking, BookingEvent::Deliver, now)?;

            let mut tx = state.db.pool().begin().await?;
            let res = sqlx::query(
                r#"
                UPDATE bookings
                SET status = ?, delivered_at = ?, delivery_message = ?,
                    version = version + 1, updated_at = ?
                WHERE id = ? AND version = ?
                "#,
            )
            .bind(String::from(next))
            .bind(now)
            .bind(&req.message)
            .bind(now)
            .bind(&booking.id)
            .bind(booking.version)
            .execute(&mut *tx)
            .await?;
            if res.rows_affected() == 0 {
                tx.rollback().await?;
                continue;
            }
            for deliverable in &req.deliverables {
                sqlx::query(
                    r#"
                    INSERT INTO deliverables (id, booking_id, filename, url, size_bytes, note, uploaded_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(uuid::Uuid::new_v4().to_string())
                .bind(&booking.id)
                .bind(deliverable.filename.trim())
                .bind(deliverable.url.trim())
                .bind(deliverable.size_bytes)
                .bind(&deliverable.note)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
            let note = if redelivery {
                "Revised work delivered"
            } else {
                "Work delivered"
            };
            append_timeline(&mut tx, &booking.id, next, note, Actor::Provider, now).await?;
            tx.commit().await?;

            let booking = Self::get_booking(&state.db, booking_id).await?;
            state
                .notifier
                .dispatch(
                    &state.db,
                    &booking.customer_id,
                    Notice::WorkDelivered { booking: &booking },
                )
                .await;
            return Ok(booking);
        }
        Err(AppError::Conflict)
    }

    /// Customer requests a revision on delivered work, within the allowance
    pub async fn request_revision(
        state: &AppState,
        customer: &User,
        booking_id: &str,
        req: &RevisionRequest,
    ) -> AppResult<Booking> {
        if req.note.trim().is_empty() {
            return Err(AppError::Validation(
                "a revision note is required".to_string(),
            ));
        }

        for _ in 0..MAX_TRANSITION_ATTEMPTS {
            let booking = Self::get_booking(&state.db, booking_id).await?;
            if booking.customer_id != customer.id {
                return Err(AppError::NotAuthorized);
            }
            let now = Utc::now();
            let next = plan_transition(&booking, BookingEvent::RequestRevision, now)?;

            let mut tx = state.db.pool().begin().await?;
            let res = sqlx::query(
                r#"
                UPDATE bookings
                SET status = ?, revisions_used = revisions_used + 1,
                    version = version + 1, updated_at = ?
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
            let note = format!("Revision requested: {}", req.note.trim());
            append_timeline(&mut tx, &booking.id, next, &note, Actor::Customer, now).await?;
            tx.commit().await?;

            let booking = Self::get_booking(&state.db, booking_id).await?;
            state
                .notifier
                .dispatch(
                    &state.db,
                    &booking.provider_id,
                    Notice::RevisionRequested { booking: &booking },
                )
                .await;
            return Ok(booking);
        }
        Err(AppError::Conflict)
    }

    /// Cancel a booking. Either party or an admin may cancel any
    /// non-terminal booking; the refund follows the configured policy for
    /// the phase the booking was in.
    pub async fn cancel(
        state: &AppState,
        user: &User,
        booking_id: &str,
        req: &CancelBookingRequest,
    ) -> AppResult<Booking> {
        for _ in 0..MAX_TRANSITION_ATTEMPTS {
            let booking = Self::get_booking(&state.db, booking_id).await?;
            if !booking.is_party(&user.id) && !user.is_admin() {
                return Err(AppError::NotAuthorized);
            }
            let now = Utc::now();
            let next = plan_transition(&booking, BookingEvent::Cancel, now)?;
            let actor = if user.is_admin() && !booking.is_party(&user.id) {
                Actor::Admin
            } else if user.id == booking.customer_id {
                Actor::Customer
            } else {
                Actor::Provider
            };

            let mut tx = state.db.pool().begin().await?;
            let res = sqlx::query(
                r#"
                UPDATE bookings
                SET status = ?, cancel_reason = ?, cancelled_at = ?,
                    version = version + 1, updated_at = ?
                WHERE id = ? AND version = ?
                "#,
            )
            .bind(String::from(next))
            .bind(&req.reason)
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

            let paid = EscrowService::paid_so_far(&mut tx, &booking.id).await?;
            let refund = ledger::cancellation_refund(
                paid,
                booking.status_enum(),
                &state.config.refund_policy,
            );
            if refund > 0 {
                EscrowService::queue_refund(&mut tx, &booking.id, refund, now).await?;
            }

            let note = match &req.reason {
                Some(reason) => format!("Booking cancelled: {}", reason),
                None => "Booking cancelled".to_string(),
            };
            append_timeline(&mut tx, &booking.id, next, &note, actor, now).await?;
            tx.commit().await?;

            EscrowService::submit_outbound_for_booking(state, &booking.id).await;
            let booking = Self::get_booking(&state.db, booking_id).await?;
            for party in [&booking.customer_id, &booking.provider_id] {
                state
                    .notifier
                    .dispatch(
                        &state.db,
                        party,
                        Notice::BookingCancelled {
                            booking: &booking,
                            refund,
                        },
                    )
                    .await;
            }
            return Ok(booking);
        }
        Err(AppError::Conflict)
    }

    /// Open a dispute; the booking freezes until an admin resolves it
    pub async fn open_dispute(
        state: &AppState,
        user: &User,
        booking_id: &str,
        req: &OpenDisputeRequest,
    ) -> AppResult<Booking> {
        if req.reason.trim().is_empty() {
            return Err(AppError::Validation(
                "a dispute reason is required".to_string(),
            ));
        }

        for _ in 0..MAX_TRANSITION_ATTEMPTS {
            let booking = Self::get_booking(&state.db, booking_id).await?;
            if !booking.is_party(&user.id) {
                return Err(AppError::NotAuthorized);
            }
            let now = Utc::now();
            let next = plan_transition(&booking, BookingEvent::OpenDispute, now)?;
            let actor = if user.id == booking.customer_id {
                Actor::Customer
            } else {
                Actor::Provider
            };

            let mut tx = state.db.pool().begin().await?;
            let res = sqlx::query(
                "UPDATE bookings SET status = ?, version = version + 1, updated_at = ? WHERE id = ? AND version = ?",
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
            sqlx::query(
                r#"
                INSERT INTO disputes (id, booking_id, opened_by, reason, status, created_at)
                VALUES (?, ?, ?, ?, 'open', ?)
                "#,
            )
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(&booking.id)
            .bind(&user.id)
            .bind(req.reason.trim())
            .bind(now)
            .execute(&mut *tx)
            .await?;
            let note = format!("Dispute opened: {}", req.reason.trim());
            append_timeline(&mut tx, &booking.id, next, &note, actor, now).await?;
            tx.commit().await?;

            let booking = Self::get_booking(&state.db, booking_id).await?;
            for party in [&booking.customer_id, &booking.provider_id] {
                state
                    .notifier
                    .dispatch(
                        &state.db,
                        party,
                        Notice::DisputeOpened {
                            booking: &booking,
                            reason: req.reason.trim(),
                        },
                    )
                    .await;
            }
            return Ok(booking);
        }
        Err(AppError::Conflict)
    }

    /// Customer reviews a completed booking, once
    pub async fn leave_review(
        state: &AppState,
        customer: &User,
        booking_id: &str,
        req: &ReviewRequest,
    ) -> AppResult<Booking> {
        if !(1..=5).contains(&req.rating) {
            return Err(AppError::Validation(
                "rating must be between 1 and 5".to_string(),
            ));
        }

        let booking = Self::get_booking(&state.db, booking_id).await?;
        if booking.customer_id != customer.id {
            return Err(AppError::NotAuthorized);
        }
        if booking.status_enum() != BookingStatus::Completed {
            return Err(AppError::Validation(
                "reviews are only allowed after completion".to_string(),
            ));
        }

        let now = Utc::now();
        let mut tx = state.db.pool().begin().await?;
        let res = sqlx::query(
            r#"
            UPDATE bookings SET customer_rating = ?, customer_review = ?, updated_at = ?
            WHERE id = ? AND customer_rating IS NULL
            "#,
        )
        .bind(req.rating)
        .bind(&req.comment)
        .bind(now)
        .bind(&booking.id)
        .execute(&mut *tx)
        .await?;
        if res.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(AppError::Conflict);
        }
        let note = format!("Customer left a {}/5 review", req.rating);
        append_timeline(
            &mut tx,
            &booking.id,
            BookingStatus::Completed,
            &note,
            Actor::Customer,
            now,
        )
        .await?;
        tx.commit().await?;

        Self::get_booking(&state.db, booking_id).await
    }

    /// Decline bookings whose response deadline has passed, refunding the
    /// deposit in full. Runs from the background sweep; racing sweeps or a
    /// concurrent acceptance are resolved by the version check, so each
    /// booking is declined at most once.
    pub async fn expire_response_deadlines(state: &AppState) -> AppResult<u32> {
        let now = Utc::now();
        let overdue: Vec<Booking> = sqlx::query_as(
            "SELECT * FROM bookings WHERE status = 'pending_approval' AND response_deadline < ?",
        )
        .bind(now)
        .fetch_all(state.db.pool())
        .await?;

        let mut declined = 0;
        for booking in overdue {
            match Self::expire_one(state, &booking).await {
                Ok(true) => declined += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!("Failed to expire booking {}: {}", booking.id, e);
                }
            }
        }
        Ok(declined)
    }

    async fn expire_one(state: &AppState, booking: &Booking) -> AppResult<bool> {
        let now = Utc::now();
        let next = match plan_transition(booking, BookingEvent::DeadlineExpired, now) {
            Ok(next) => next,
            // Accepted or otherwise moved on since the candidate query
            Err(AppError::InvalidTransition { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };

        let mut tx = state.db.pool().begin().await?;
        let res = sqlx::query(
            r#"
            UPDATE bookings
            SET status = ?, decline_reason = 'Provider did not respond in time',
                version = version + 1, updated_at = ?
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
            return Ok(false);
        }
        EscrowService::queue_full_refund(&mut tx, &booking.id, now).await?;
        append_timeline(
            &mut tx,
            &booking.id,
            next,
            "Booking declined automatically, the provider did not respond before the deadline",
            Actor::System,
            now,
        )
        .await?;
        tx.commit().await?;

        EscrowService::submit_outbound_for_booking(state, &booking.id).await;
        let booking = Self::get_booking(&state.db, &booking.id).await?;
        for party in [&booking.customer_id, &booking.provider_id] {
            state
                .notifier
                .dispatch(&state.db, party, Notice::BookingExpired { booking: &booking })
                .await;
        }
        Ok(true)
    }

    /// Get booking by ID
    pub async fn get_booking(db: &Database, booking_id: &str) -> AppResult<Booking> {
        sqlx::query_as("SELECT * FROM bookings WHERE id = ?")
            .bind(booking_id)
            .fetch_optional(db.pool())
            .await?
            .ok_or(AppError::BookingNotFound)
    }

    /// Get a booking the user is allowed to see
    pub async fn get_for_party(db: &Database, booking_id: &str, user: &User) -> AppResult<Booking> {
        let booking = Self::get_booking(db, booking_id).await?;
        if !booking.is_party(&user.id) && !user.is_admin() {
            return Err(AppError::NotAuthorized);
        }
        Ok(booking)
    }

    /// List bookings made by a customer
    pub async fn list_for_customer(db: &Database, user_id: &str) -> AppResult<Vec<Booking>> {
        let bookings =
            sqlx::query_as("SELECT * FROM bookings WHERE customer_id = ? ORDER BY created_at DESC")
                .bind(user_id)
                .fetch_all(db.pool())
                .await?;
        Ok(bookings)
    }

    /// List bookings received by a provider
    pub async fn list_for_provider(db: &Database, user_id: &str) -> AppResult<Vec<Booking>> {
        let bookings =
            sqlx::query_as("SELECT * FROM bookings WHERE provider_id = ? ORDER BY created_at DESC")
                .bind(user_id)
                .fetch_all(db.pool())
                .await?;
        Ok(bookings)
    }

    /// Paid requests waiting on the provider, most urgent first
    pub async fn pending_requests_for_provider(
        db: &Database,
        user_id: &str,
    ) -> AppResult<Vec<Booking>> {
        let bookings = sqlx::query_as(
            r#"
            SELECT * FROM bookings
            WHERE provider_id = ? AND status = 'pending_approval'
            ORDER BY response_deadline ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(db.pool())
        .await?;
        Ok(bookings)
    }

    /// Full audit trail of a booking, oldest first
    pub async fn timeline(db: &Database, booking_id: &str) -> AppResult<Vec<TimelineEntry>> {
        let entries = sqlx::query_as(
            "SELECT * FROM booking_timeline WHERE booking_id = ? ORDER BY created_at ASC, id ASC",
        )
        .bind(booking_id)
        .fetch_all(db.pool())
        .await?;
        Ok(entries)
    }

    /// Deliverables attached to a booking
    pub async fn deliverables(db: &Database, booking_id: &str) -> AppResult<Vec<Deliverable>> {
        let rows = sqlx::query_as(
            "SELECT * FROM deliverables WHERE booking_id = ? ORDER BY uploaded_at ASC",
        )
        .bind(booking_id)
        .fetch_all(db.pool())
        .await?;
        Ok(rows)
    }

    async fn allocate_booking_ref(db: &Database) -> AppResult<String> {
        for _ in 0..3 {
            let candidate = new_booking_ref();
            let existing: Option<(String,)> =
                sqlx::query_as("SELECT id FROM bookings WHERE booking_ref = ?")
                    .bind(&candidate)
                    .fetch_optional(db.pool())
                    .await?;
            if existing.is_none() {
                return Ok(candidate);
            }
        }
        Err(AppError::Internal(
            "could not allocate a booking reference".to_string(),
        ))
    }
}

/// Human-readable reference like BK-7KQ2M9XW; ambiguous characters excluded
fn new_booking_ref() -> String {
    const CHARSET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..8)
        .map(|_| CHARSET[rng.gen_range(0..CHARSET.len())] as char)
        .collect();
    format!("BK-{}", suffix)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booking_with(status: BookingStatus) -> Booking {
        let now = Utc::now();
        Booking {
            id: "b-1".to_string(),
            booking_ref: "BK-TEST0001".to_string(),
            customer_id: "c-1".to_string(),
            provider_id: "p-1".to_string(),
            service_id: "s-1".to_string(),
            package_name: "standard".to_string(),
            title: "Logo design".to_string(),
            requirements: None,
            total_amount: 1_000_000,
            deposit_amount: 500_000,
            remaining_amount: 500_000,
            commission_rate: 15,
            commission_amount: 150_000,
            provider_earnings: 850_000,
            delivery_days: 7,
            revisions_allowed: 2,
            revisions_used: 0,
            status: String::from(status),
            payment_stage: "deposit".to_string(),
            version: 0,
            response_deadline: now + Duration::hours(24),
            expected_delivery: None,
            provider_message: None,
            decline_reason: None,
            cancel_reason: None,
            delivery_message: None,
            customer_rating: None,
            customer_review: None,
            accepted_at: None,
            delivered_at: None,
            completed_at: None,
            cancelled_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn happy_path_states_chain() {
        let now = Utc::now();
        let steps = [
            (BookingStatus::PendingPayment, BookingEvent::DepositConfirmed, BookingStatus::PendingApproval),
            (BookingStatus::PendingApproval, BookingEvent::Accept, BookingStatus::Accepted),
            (BookingStatus::Accepted, BookingEvent::StartWork, BookingStatus::InProgress),
            (BookingStatus::InProgress, BookingEvent::Deliver, BookingStatus::Delivered),
            (BookingStatus::Delivered, BookingEvent::FinalConfirmed, BookingStatus::Completed),
        ];
        for (from, event, expected) in steps {
            let booking = booking_with(from);
            assert_eq!(plan_transition(&booking, event, now).unwrap(), expected);
        }
    }

    #[test]
    fn cannot_skip_to_completed() {
        let booking = booking_with(BookingStatus::PendingPayment);
        let err = plan_transition(&booking, BookingEvent::FinalConfirmed, Utc::now());
        assert!(matches!(err, Err(AppError::InvalidTransition { .. })));
    }

    #[test]
    fn accept_allowed_exactly_at_deadline() {
        let mut booking = booking_with(BookingStatus::PendingApproval);
        let deadline = Utc::now();
        booking.response_deadline = deadline;
        assert!(plan_transition(&booking, BookingEvent::Accept, deadline).is_ok());
    }

    #[test]
    fn accept_denied_after_deadline() {
        let mut booking = booking_with(BookingStatus::PendingApproval);
        let deadline = Utc::now();
        booking.response_deadline = deadline;
        let err = plan_transition(&booking, BookingEvent::Accept, deadline + Duration::seconds(1));
        match err {
            Err(AppError::InvalidTransition { reason, .. }) => {
                assert_eq!(reason, "response deadline passed");
            }
            other => panic!("expected denied transition, got {:?}", other),
        }
    }

    #[test]
    fn deadline_expiry_requires_passed_deadline() {
        let mut booking = booking_with(BookingStatus::PendingApproval);
        let deadline = Utc::now();
        booking.response_deadline = deadline;
        // At the deadline the provider may still accept; expiry is strict
        assert!(plan_transition(&booking, BookingEvent::DeadlineExpired, deadline).is_err());
        assert!(plan_transition(
            &booking,
            BookingEvent::DeadlineExpired,
            deadline + Duration::seconds(1)
        )
        .is_ok());
    }

    #[test]
    fn delivery_allowed_without_explicit_start() {
        let booking = booking_with(BookingStatus::Accepted);
        assert_eq!(
            plan_transition(&booking, BookingEvent::Deliver, Utc::now()).unwrap(),
            BookingStatus::Delivered
        );
    }

    #[test]
    fn revision_cap_is_enforced() {
        let mut booking = booking_with(BookingStatus::Delivered);
        booking.revisions_allowed = 1;
        booking.revisions_used = 0;
        assert!(plan_transition(&booking, BookingEvent::RequestRevision, Utc::now()).is_ok());

        booking.revisions_used = 1;
        let err = plan_transition(&booking, BookingEvent::RequestRevision, Utc::now());
        match err {
            Err(AppError::InvalidTransition { reason, .. }) => {
                assert_eq!(reason, "revision limit reached");
            }
            other => panic!("expected denied transition, got {:?}", other),
        }
    }

    #[test]
    fn redelivery_after_revision() {
        let booking = booking_with(BookingStatus::RevisionRequested);
        assert_eq!(
            plan_transition(&booking, BookingEvent::Deliver, Utc::now()).unwrap(),
            BookingStatus::Delivered
        );
    }

    #[test]
    fn terminal_states_reject_everything() {
        let now = Utc::now();
        for status in [
            BookingStatus::Completed,
            BookingStatus::Declined,
            BookingStatus::Cancelled,
            BookingStatus::Disputed,
        ] {
            let booking = booking_with(status);
            for event in [
                BookingEvent::Accept,
                BookingEvent::Deliver,
                BookingEvent::Cancel,
                BookingEvent::OpenDispute,
                BookingEvent::FinalConfirmed,
            ] {
                assert!(
                    plan_transition(&booking, event, now).is_err(),
                    "{:?} should reject {:?}",
                    status,
                    event
                );
            }
        }
    }

    #[test]
    fn cancel_and_dispute_from_any_active_state() {
        let now = Utc::now();
        for status in [
            BookingStatus::PendingPayment,
            BookingStatus::PendingApproval,
            BookingStatus::Accepted,
            BookingStatus::InProgress,
            BookingStatus::Delivered,
            BookingStatus::RevisionRequested,
        ] {
            let booking = booking_with(status);
            assert_eq!(
                plan_transition(&booking, BookingEvent::Cancel, now).unwrap(),
                BookingStatus::Cancelled
            );
            assert_eq!(
                plan_transition(&booking, BookingEvent::OpenDispute, now).unwrap(),
                BookingStatus::Disputed
            );
        }
    }
}

//! Pure money arithmetic for the split-payment escrow flow.
//!
//! All amounts are integers in the minimum currency unit. Every split
//! returned here sums back to its input exactly; rounding happens once,
//! half-up, and the remainder is assigned deterministically.

use crate::config::RefundPolicyConfig;
use crate::models::BookingStatus;

/// Percentage of an amount, rounded half up
pub fn percent_of(amount: i64, percent: i64) -> i64 {
    (amount * percent + 50) / 100
}

/// Split a total into (commission, provider earnings) for the given
/// commission rate in percent. The commission takes the rounding, so the
/// two parts always sum to the total.
pub fn commission_split(total: i64, rate_percent: i64) -> (i64, i64) {
    let commission = percent_of(total, rate_percent);
    (commission, total - commission)
}

/// Split a total into (deposit, remaining) halves. The odd unit of an
/// odd total lands on the remaining half.
pub fn deposit_split(total: i64) -> (i64, i64) {
    let deposit = total / 2;
    (deposit, total - deposit)
}

/// Refund due on cancellation, as a share of what was actually paid.
/// The percentage comes from the configured policy table and depends on
/// how far the booking had progressed. Never exceeds the paid amount.
pub fn cancellation_refund(paid: i64, status: BookingStatus, policy: &RefundPolicyConfig) -> i64 {
    let percent = match status {
        BookingStatus::PendingPayment | BookingStatus::PendingApproval => {
            policy.before_acceptance
        }
        BookingStatus::Accepted => policy.accepted,
        BookingStatus::InProgress => policy.in_progress,
        BookingStatus::Delivered | BookingStatus::RevisionRequested => policy.after_delivery,
        // Terminal bookings are not cancellable; nothing to refund
        BookingStatus::Completed
        | BookingStatus::Declined
        | BookingStatus::Cancelled
        | BookingStatus::Disputed => 0,
    };
    percent_of(paid, percent).min(paid)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commission_split_is_exact() {
        // 10,000.00 at 15% commission
        let (commission, earnings) = commission_split(1_000_000, 15);
        assert_eq!(commission, 150_000);
        assert_eq!(earnings, 850_000);
        assert_eq!(commission + earnings, 1_000_000);
    }

    #[test]
    fn commission_rounds_half_up() {
        // 1.01 at 50% -> 0.505 rounds to 0.51
        let (commission, earnings) = commission_split(101, 50);
        assert_eq!(commission, 51);
        assert_eq!(earnings, 50);
    }

    #[test]
    fn commission_split_sums_for_all_rates() {
        for total in [1, 99, 100, 101, 12_345, 1_000_000] {
            for rate in 0..=100 {
                let (commission, earnings) = commission_split(total, rate);
                assert_eq!(commission + earnings, total, "total {} rate {}", total, rate);
                assert!(commission >= 0 && earnings >= 0);
            }
        }
    }

    #[test]
    fn deposit_split_halves() {
        assert_eq!(deposit_split(1_000_000), (500_000, 500_000));
    }

    #[test]
    fn deposit_split_odd_unit_goes_to_remaining() {
        let (deposit, remaining) = deposit_split(999);
        assert_eq!(deposit, 499);
        assert_eq!(remaining, 500);
        assert_eq!(deposit + remaining, 999);
    }

    #[test]
    fn refund_half_while_in_progress() {
        let policy = RefundPolicyConfig::default();
        // 5,000.00 paid, cancelled mid-work -> 2,500.00 back
        assert_eq!(
            cancellation_refund(500_000, BookingStatus::InProgress, &policy),
            250_000
        );
    }

    #[test]
    fn refund_full_before_acceptance() {
        let policy = RefundPolicyConfig::default();
        assert_eq!(
            cancellation_refund(500_000, BookingStatus::PendingApproval, &policy),
            500_000
        );
        assert_eq!(
            cancellation_refund(500_000, BookingStatus::Accepted, &policy),
            500_000
        );
    }

    #[test]
    fn refund_nothing_after_delivery() {
        let policy = RefundPolicyConfig::default();
        assert_eq!(
            cancellation_refund(500_000, BookingStatus::Delivered, &policy),
            0
        );
        assert_eq!(
            cancellation_refund(500_000, BookingStatus::Completed, &policy),
            0
        );
    }

    #[test]
    fn refund_never_exceeds_paid() {
        let policy = RefundPolicyConfig::default();
        for paid in [0, 1, 33, 101, 500_000] {
            let refund = cancellation_refund(paid, BookingStatus::InProgress, &policy);
            assert!(refund <= paid);
        }
    }
}

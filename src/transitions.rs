//! Reservation status transitions
//!
//! Every status change goes through one of these functions. They mutate the
//! document in place and leave persistence (and the version bump) to the
//! caller, so a transition and its compare-and-swap write form one step.

use crate::error::{ReservationError, Result};
use crate::reservation::{
    AttendanceStatus, ConfirmationStatus, PaymentStatus, Reservation, ReservationStatus,
};
use serde::Deserialize;

/// Customer answer on the confirmation page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CustomerAction {
    Confirm,
    Cancel,
}

fn invalid(msg: impl Into<String>) -> ReservationError {
    ReservationError::InvalidTransition(msg.into())
}

/// Business confirms a pending reservation.
pub fn confirm_pending(r: &mut Reservation) -> Result<()> {
    if r.confirmation_status != ConfirmationStatus::Pending {
        return Err(invalid("Only pending reservations can be confirmed"));
    }
    r.confirmation_status = ConfirmationStatus::Confirmed;
    r.status = ReservationStatus::Confirmed;
    r.attendance_status = AttendanceStatus::NotArrived;
    Ok(())
}

/// Business cancels a reservation it had already confirmed. The confirmation
/// status is kept so the dashboard can tell it apart from a customer refusal.
pub fn cancel_confirmed(r: &mut Reservation) -> Result<()> {
    if r.confirmation_status != ConfirmationStatus::Confirmed {
        return Err(invalid("Only confirmed reservations can be cancelled"));
    }
    match r.status {
        ReservationStatus::Cancelled => return Err(invalid("Reservation already cancelled")),
        ReservationStatus::Completed => {
            return Err(invalid("Completed reservations cannot be cancelled"))
        }
        _ => {}
    }
    r.status = ReservationStatus::Cancelled;
    r.attendance_status = AttendanceStatus::NotArrived;
    Ok(())
}

/// Record whether the party showed up.
pub fn mark_attendance(r: &mut Reservation, attendance: AttendanceStatus) -> Result<()> {
    if r.status != ReservationStatus::Confirmed {
        return Err(invalid(format!(
            "Attendance can only be recorded for confirmed reservations (status is {})",
            r.status
        )));
    }
    r.attendance_status = attendance;
    match attendance {
        AttendanceStatus::Arrived => r.status = ReservationStatus::Completed,
        AttendanceStatus::NoShow => {
            r.confirmation_status = ConfirmationStatus::Cancelled;
            r.status = ReservationStatus::Cancelled;
        }
        AttendanceStatus::NotArrived => {}
    }
    Ok(())
}

/// Customer confirms or refuses through the confirmation link.
pub fn respond_as_customer(r: &mut Reservation, action: CustomerAction) -> Result<()> {
    ensure_customer_can_respond(r)?;
    match action {
        CustomerAction::Confirm => confirm_pending(r),
        CustomerAction::Cancel => {
            r.confirmation_status = ConfirmationStatus::Cancelled;
            r.status = ReservationStatus::Cancelled;
            Ok(())
        }
    }
}

/// Customers may only answer while the reservation is still pending.
pub fn ensure_customer_can_respond(r: &Reservation) -> Result<()> {
    match r.confirmation_status {
        ConfirmationStatus::Pending => Ok(()),
        ConfirmationStatus::Confirmed => Err(invalid("Reservation already confirmed")),
        ConfirmationStatus::Cancelled => Err(invalid("Reservation cancelled")),
    }
}

/// Payments are taken once per confirmed reservation.
pub fn ensure_payable(r: &Reservation) -> Result<()> {
    if r.confirmation_status != ConfirmationStatus::Confirmed {
        return Err(invalid("Only confirmed reservations can be paid"));
    }
    match r.payment_status {
        PaymentStatus::Completed => Err(invalid("Payment already completed")),
        PaymentStatus::Processing => Err(invalid("Payment already in progress")),
        PaymentStatus::Pending | PaymentStatus::Failed => Ok(()),
    }
}

/// Mark the payment as in flight. Written before the transfer so that a
/// second caller fails here instead of moving money again.
pub fn claim_payment(r: &mut Reservation) -> Result<()> {
    ensure_payable(r)?;
    r.payment_status = PaymentStatus::Processing;
    Ok(())
}

/// Close a claimed payment with the transfer result.
pub fn settle_payment(r: &mut Reservation, succeeded: bool) -> Result<()> {
    if r.payment_status != PaymentStatus::Processing {
        return Err(invalid(format!(
            "No payment in progress (payment status is {})",
            r.payment_status
        )));
    }
    r.payment_status = if succeeded {
        PaymentStatus::Completed
    } else {
        PaymentStatus::Failed
    };
    Ok(())
}

/// Loyalty tokens go out once, after the visit is completed.
pub fn ensure_loyalty_eligible(r: &Reservation) -> Result<()> {
    if r.loyalty_tokens_sent {
        return Err(invalid("Loyalty tokens already sent"));
    }
    if r.status != ReservationStatus::Completed {
        return Err(invalid("Loyalty tokens are issued for completed reservations only"));
    }
    Ok(())
}

pub fn record_loyalty_sent(r: &mut Reservation) -> Result<()> {
    ensure_loyalty_eligible(r)?;
    r.loyalty_tokens_sent = true;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reservation::NewReservation;
    use chrono::NaiveDate;

    fn pending() -> Reservation {
        Reservation::new(NewReservation {
            business_name: Some("Café de Paris".to_string()),
            customer_name: "Mehmet".to_string(),
            customer_phone: "5321234567".to_string(),
            date: NaiveDate::from_ymd_opt(2026, 12, 24).unwrap(),
            time: "20:00".to_string(),
            number_of_people: 2,
            notes: None,
            register_on_chain: false,
            payment_amount: None,
        })
        .unwrap()
    }

    fn confirmed() -> Reservation {
        let mut r = pending();
        confirm_pending(&mut r).unwrap();
        r
    }

    #[test]
    fn test_confirm_pending() {
        let r = confirmed();
        assert_eq!(r.confirmation_status, ConfirmationStatus::Confirmed);
        assert_eq!(r.status, ReservationStatus::Confirmed);
        assert_eq!(r.attendance_status, AttendanceStatus::NotArrived);
    }

    #[test]
    fn test_confirm_twice_fails() {
        let mut r = confirmed();
        assert!(matches!(
            confirm_pending(&mut r),
            Err(ReservationError::InvalidTransition(_))
        ));
    }

    #[test]
    fn test_cancel_confirmed_keeps_confirmation_status() {
        let mut r = confirmed();
        cancel_confirmed(&mut r).unwrap();
        assert_eq!(r.status, ReservationStatus::Cancelled);
        assert_eq!(r.confirmation_status, ConfirmationStatus::Confirmed);
        assert_eq!(r.attendance_status, AttendanceStatus::NotArrived);
        assert!(cancel_confirmed(&mut r).is_err());
    }

    #[test]
    fn test_cancel_pending_via_business_route_fails() {
        let mut r = pending();
        assert!(cancel_confirmed(&mut r).is_err());
    }

    #[test]
    fn test_arrived_completes() {
        let mut r = confirmed();
        mark_attendance(&mut r, AttendanceStatus::Arrived).unwrap();
        assert_eq!(r.status, ReservationStatus::Completed);
        assert_eq!(r.attendance_status, AttendanceStatus::Arrived);
        assert!(cancel_confirmed(&mut r).is_err());
    }

    #[test]
    fn test_no_show_cancels() {
        let mut r = confirmed();
        mark_attendance(&mut r, AttendanceStatus::NoShow).unwrap();
        assert_eq!(r.status, ReservationStatus::Cancelled);
        assert_eq!(r.confirmation_status, ConfirmationStatus::Cancelled);
        assert_eq!(r.attendance_status, AttendanceStatus::NoShow);
    }

    #[test]
    fn test_not_arrived_is_noop() {
        let mut r = confirmed();
        mark_attendance(&mut r, AttendanceStatus::NotArrived).unwrap();
        assert_eq!(r.status, ReservationStatus::Confirmed);
    }

    #[test]
    fn test_attendance_requires_confirmed() {
        let mut r = pending();
        assert!(mark_attendance(&mut r, AttendanceStatus::Arrived).is_err());
        let mut r = confirmed();
        cancel_confirmed(&mut r).unwrap();
        assert!(mark_attendance(&mut r, AttendanceStatus::Arrived).is_err());
    }

    #[test]
    fn test_customer_cancel_and_confirm() {
        let mut r = pending();
        respond_as_customer(&mut r, CustomerAction::Cancel).unwrap();
        assert_eq!(r.confirmation_status, ConfirmationStatus::Cancelled);
        assert_eq!(r.status, ReservationStatus::Cancelled);
        assert_eq!(
            respond_as_customer(&mut r, CustomerAction::Confirm).unwrap_err(),
            ReservationError::InvalidTransition("Reservation cancelled".to_string())
        );

        let mut r = pending();
        respond_as_customer(&mut r, CustomerAction::Confirm).unwrap();
        assert_eq!(
            respond_as_customer(&mut r, CustomerAction::Cancel).unwrap_err(),
            ReservationError::InvalidTransition("Reservation already confirmed".to_string())
        );
    }

    #[test]
    fn test_payment_rules() {
        let mut r = pending();
        assert!(claim_payment(&mut r).is_err());

        let mut r = confirmed();
        assert!(settle_payment(&mut r, true).is_err());
        claim_payment(&mut r).unwrap();
        assert_eq!(r.payment_status, PaymentStatus::Processing);
        assert_eq!(
            claim_payment(&mut r).unwrap_err(),
            ReservationError::InvalidTransition("Payment already in progress".to_string())
        );

        settle_payment(&mut r, false).unwrap();
        assert_eq!(r.payment_status, PaymentStatus::Failed);
        claim_payment(&mut r).unwrap();
        settle_payment(&mut r, true).unwrap();
        assert_eq!(r.payment_status, PaymentStatus::Completed);
        assert!(claim_payment(&mut r).is_err());
        assert!(settle_payment(&mut r, true).is_err());
    }

    #[test]
    fn test_loyalty_once_after_completion() {
        let mut r = confirmed();
        assert!(record_loyalty_sent(&mut r).is_err());
        mark_attendance(&mut r, AttendanceStatus::Arrived).unwrap();
        record_loyalty_sent(&mut r).unwrap();
        assert!(r.loyalty_tokens_sent);
        assert!(record_loyalty_sent(&mut r).is_err());
    }
}

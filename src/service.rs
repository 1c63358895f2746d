//! Reservation service
//!
//! Orchestrates the document store and the optional settlement client. All
//! status changes are read-modify-write cycles through [`ReservationService::modify`],
//! which re-reads and re-validates when a concurrent writer got there first.

use crate::economics::{calculate_loyalty_tokens, to_base_units, TOKEN_DECIMALS};
use crate::error::{ReservationError, Result};
use crate::persistence::{ListFilter, ReservationStore};
use crate::reservation::{
    AttendanceStatus, ConfirmationStatus, NewReservation, Reservation, ReservationStatus,
    ReservationUpdate,
};
use crate::settlement::{ChainReservationRequest, ChainStatus, SettlementClient, TxReceipt};
use crate::transitions::{self, CustomerAction};
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Attempts at a compare-and-swap write before giving up with `Conflict`.
const MAX_WRITE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedReservation {
    #[serde(flatten)]
    pub reservation: Reservation,
    pub confirmation_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settlement_error: Option<String>,
}

/// Result of a transition that may have touched the settlement contract.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub reservation: Reservation,
    pub receipt: Option<TxReceipt>,
    /// Settlement failure after the database write already succeeded.
    pub settlement_error: Option<String>,
}

impl Outcome {
    fn local(reservation: Reservation) -> Self {
        Outcome {
            reservation,
            receipt: None,
            settlement_error: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReservationStats {
    pub total: usize,
    pub pending: usize,
    pub confirmed: usize,
    pub cancelled: usize,
    pub completed: usize,
    pub arrived: usize,
    pub no_show: usize,
    /// Guests across all reservations.
    pub total_guests: u64,
    /// Guests across reservations that are still expected.
    pub expected_guests: u64,
    pub today: usize,
}

impl ReservationStats {
    pub fn from_reservations(reservations: &[Reservation], today: NaiveDate) -> Self {
        let mut stats = ReservationStats {
            total: reservations.len(),
            ..Default::default()
        };
        for r in reservations {
            stats.total_guests += u64::from(r.number_of_people);
            match r.confirmation_status {
                ConfirmationStatus::Pending => stats.pending += 1,
                ConfirmationStatus::Confirmed => stats.confirmed += 1,
                ConfirmationStatus::Cancelled => stats.cancelled += 1,
            }
            match r.attendance_status {
                AttendanceStatus::Arrived => stats.arrived += 1,
                AttendanceStatus::NoShow => stats.no_show += 1,
                AttendanceStatus::NotArrived => {}
            }
            match r.status {
                ReservationStatus::Completed => stats.completed += 1,
                ReservationStatus::Pending | ReservationStatus::Confirmed => {
                    stats.expected_guests += u64::from(r.number_of_people)
                }
                ReservationStatus::Cancelled => {}
            }
            if r.date == today {
                stats.today += 1;
            }
        }
        stats
    }
}

#[derive(Clone)]
pub struct ReservationService {
    store: Arc<dyn ReservationStore>,
    settlement: Option<Arc<dyn SettlementClient>>,
    public_url: String,
}

impl ReservationService {
    pub fn new(
        store: Arc<dyn ReservationStore>,
        settlement: Option<Arc<dyn SettlementClient>>,
        public_url: impl Into<String>,
    ) -> Self {
        Self {
            store,
            settlement,
            public_url: public_url.into(),
        }
    }

    /// Backend name of the settlement client, if one is configured.
    pub fn settlement_backend(&self) -> Option<&'static str> {
        self.settlement.as_ref().map(|s| s.backend())
    }

    fn settlement(&self) -> Result<&Arc<dyn SettlementClient>> {
        self.settlement
            .as_ref()
            .ok_or(ReservationError::SettlementDisabled)
    }

    pub fn confirmation_url(&self, token: &str) -> String {
        format!("{}/confirm/{}", self.public_url.trim_end_matches('/'), token)
    }

    pub async fn create(&self, input: NewReservation) -> Result<CreatedReservation> {
        let register_on_chain = input.register_on_chain;
        let payment_amount = match input.payment_amount.as_deref() {
            Some(amount) => to_base_units(amount)?,
            None => 0,
        };
        if register_on_chain {
            self.settlement()?;
        }

        let reservation = Reservation::new(input)?;
        self.store.insert(&reservation)?;
        info!(
            reservation_id = %reservation.reservation_id,
            business = %reservation.business_name,
            party_size = reservation.number_of_people,
            "reservation.created"
        );

        let confirmation_url = self.confirmation_url(&reservation.confirmation_token);
        if !register_on_chain {
            return Ok(CreatedReservation {
                reservation,
                confirmation_url,
                settlement_error: None,
            });
        }

        match self.register_on_chain(&reservation, payment_amount).await {
            Ok(outcome) => Ok(CreatedReservation {
                reservation: outcome.reservation,
                confirmation_url,
                settlement_error: outcome.settlement_error,
            }),
            Err(e) => {
                warn!(reservation_id = %reservation.reservation_id, error = %e, "settlement.create_failed");
                Ok(CreatedReservation {
                    reservation,
                    confirmation_url,
                    settlement_error: Some(e.to_string()),
                })
            }
        }
    }

    async fn register_on_chain(
        &self,
        reservation: &Reservation,
        payment_amount: i128,
    ) -> Result<Outcome> {
        let settlement = self.settlement()?;
        let request = ChainReservationRequest {
            business: reservation.business_name.clone(),
            reservation_time: reservation.starts_at_unix()?,
            party_size: reservation.number_of_people,
            payment_amount,
            payment_asset: None,
        };
        let created = settlement.create_reservation(&request).await?;
        info!(
            reservation_id = %reservation.reservation_id,
            chain_id = created.chain_id,
            tx = %created.receipt.hash,
            "settlement.created"
        );
        let chain_id = created.chain_id.to_string();
        let hash = created.receipt.hash.clone();
        Ok(self.record_receipt(reservation.clone(), created.receipt, move |r| {
            r.blockchain_reservation_id = Some(chain_id.clone());
            r.transaction_hash = Some(hash.clone());
            Ok(())
        }))
    }

    pub fn get(&self, reservation_id: &str) -> Result<Reservation> {
        self.store
            .get(reservation_id)?
            .ok_or_else(|| ReservationError::NotFound(reservation_id.to_string()))
    }

    pub fn list(&self, filter: &ListFilter) -> Result<Vec<Reservation>> {
        self.store.list(filter)
    }

    pub fn pending_notifications(&self) -> Result<Vec<Reservation>> {
        self.store.list(&ListFilter::pending())
    }

    pub fn stats(&self) -> Result<ReservationStats> {
        let all = self.store.list(&ListFilter::default())?;
        Ok(ReservationStats::from_reservations(
            &all,
            Utc::now().date_naive(),
        ))
    }

    pub fn update(&self, reservation_id: &str, update: ReservationUpdate) -> Result<Reservation> {
        self.modify(reservation_id, move |r| r.apply_update(update.clone()))
    }

    pub fn delete(&self, reservation_id: &str) -> Result<()> {
        if !self.store.delete(reservation_id)? {
            return Err(ReservationError::NotFound(reservation_id.to_string()));
        }
        info!(reservation_id, "reservation.deleted");
        Ok(())
    }

    pub fn confirm_pending(&self, reservation_id: &str) -> Result<Reservation> {
        let r = self.modify(reservation_id, transitions::confirm_pending)?;
        info!(reservation_id, "reservation.confirmed");
        Ok(r)
    }

    pub fn cancel_confirmed(&self, reservation_id: &str) -> Result<Reservation> {
        let r = self.modify(reservation_id, transitions::cancel_confirmed)?;
        info!(reservation_id, "reservation.cancelled");
        Ok(r)
    }

    /// Record attendance and mirror completion / no-show to the contract when
    /// the reservation is registered there.
    pub async fn update_attendance(
        &self,
        reservation_id: &str,
        attendance: AttendanceStatus,
    ) -> Result<Outcome> {
        let reservation =
            self.modify(reservation_id, |r| transitions::mark_attendance(r, attendance))?;
        info!(reservation_id, attendance = %attendance, "reservation.attendance");

        let chain_status = match attendance {
            AttendanceStatus::Arrived => ChainStatus::Completed,
            AttendanceStatus::NoShow => ChainStatus::NoShow,
            AttendanceStatus::NotArrived => return Ok(Outcome::local(reservation)),
        };
        let (Some(settlement), Some(chain_id)) =
            (self.settlement.as_ref(), chain_id_of(&reservation)?)
        else {
            return Ok(Outcome::local(reservation));
        };

        match settlement
            .update_reservation_status(chain_id, chain_status)
            .await
        {
            Ok(receipt) => {
                let hash = receipt.hash.clone();
                Ok(self.record_receipt(reservation, receipt, move |r| {
                    r.transaction_hash = Some(hash.clone());
                    Ok(())
                }))
            }
            Err(e) => {
                warn!(reservation_id, chain_id, error = %e, "settlement.status_update_failed");
                Ok(Outcome {
                    reservation,
                    receipt: None,
                    settlement_error: Some(e.to_string()),
                })
            }
        }
    }

    /// Customer view behind a confirmation link.
    pub fn lookup_by_token(&self, token: &str) -> Result<Reservation> {
        self.store
            .get_by_token(token)?
            .ok_or_else(|| ReservationError::NotFound(format!("confirmation token {}", token)))
    }

    pub fn respond_by_token(&self, token: &str, action: CustomerAction) -> Result<Reservation> {
        let reservation = self.lookup_by_token(token)?;
        let r = self.modify(&reservation.reservation_id, |r| {
            transitions::respond_as_customer(r, action)
        })?;
        info!(reservation_id = %r.reservation_id, action = ?action, "reservation.customer_response");
        Ok(r)
    }

    /// Customer confirms on the contract with their chain address; a pending
    /// database record is confirmed along with it.
    pub async fn confirm_on_chain(
        &self,
        reservation_id: &str,
        customer_address: &str,
    ) -> Result<Outcome> {
        crate::crypto::address_from_hex(customer_address)
            .map_err(|e| ReservationError::InvalidInput(e.to_string()))?;
        let settlement = self.settlement()?;

        let reservation = self.get(reservation_id)?;
        if reservation.confirmation_status == ConfirmationStatus::Cancelled
            || reservation.status == ReservationStatus::Cancelled
        {
            return Err(ReservationError::InvalidTransition(
                "Reservation cancelled".to_string(),
            ));
        }
        let chain_id = chain_id_of(&reservation)?.ok_or_else(|| {
            ReservationError::InvalidTransition(
                "Reservation is not registered on chain".to_string(),
            )
        })?;

        let receipt = settlement
            .confirm_reservation(chain_id, customer_address)
            .await?;
        info!(reservation_id, chain_id, tx = %receipt.hash, "settlement.confirmed");

        let hash = receipt.hash.clone();
        let address = customer_address.to_string();
        Ok(self.record_receipt(reservation, receipt, move |r| {
            if r.confirmation_status == ConfirmationStatus::Pending {
                transitions::confirm_pending(r)?;
            }
            r.customer_address = Some(address.clone());
            r.transaction_hash = Some(hash.clone());
            Ok(())
        }))
    }

    /// Take the stablecoin payment for a confirmed reservation. The payment
    /// is claimed as `processing` before the transfer, so concurrent requests
    /// cannot both pay. A failed transfer is recorded as `paymentStatus =
    /// failed` and returned as error.
    pub async fn confirm_payment(&self, reservation_id: &str, amount: &str) -> Result<Outcome> {
        let settlement = self.settlement()?;
        let units = to_base_units(amount)?;
        let claimed = self.modify(reservation_id, transitions::claim_payment)?;

        match settlement.transfer_stablecoin("", units).await {
            Ok(receipt) => {
                info!(reservation_id, amount, tx = %receipt.hash, "settlement.payment_completed");
                let hash = receipt.hash.clone();
                Ok(self.record_receipt(claimed, receipt, move |r| {
                    transitions::settle_payment(r, true)?;
                    r.transaction_hash = Some(hash.clone());
                    Ok(())
                }))
            }
            Err(e) => {
                warn!(reservation_id, amount, error = %e, "settlement.payment_failed");
                if let Err(release) =
                    self.modify(reservation_id, |r| transitions::settle_payment(r, false))
                {
                    warn!(reservation_id, error = %release, "settlement.payment_release_failed");
                }
                Err(e)
            }
        }
    }

    /// Issue loyalty tokens for a completed visit: one token per 100 units
    /// spent. The reservation is marked first so concurrent requests cannot
    /// both transfer; the mark is rolled back if the transfer fails.
    pub async fn issue_loyalty(
        &self,
        reservation_id: &str,
        customer_address: Option<&str>,
        spent_amount: u64,
    ) -> Result<(Outcome, u64)> {
        let settlement = self.settlement()?;
        let tokens = calculate_loyalty_tokens(spent_amount);
        if tokens == 0 {
            return Err(ReservationError::InvalidInput(format!(
                "Spent amount {} earns no loyalty tokens",
                spent_amount
            )));
        }

        let reservation = self.get(reservation_id)?;
        let destination = customer_address
            .map(str::to_string)
            .or_else(|| reservation.customer_address.clone())
            .ok_or_else(|| {
                ReservationError::InvalidInput("customerAddress is required".to_string())
            })?;
        crate::crypto::address_from_hex(&destination)
            .map_err(|e| ReservationError::InvalidInput(e.to_string()))?;

        let claimed = self.modify(reservation_id, transitions::record_loyalty_sent)?;

        let amount = i128::from(tokens) * 10i128.pow(TOKEN_DECIMALS);
        match settlement.issue_loyalty(&destination, amount).await {
            Ok(receipt) => {
                info!(reservation_id, tokens, tx = %receipt.hash, "settlement.loyalty_issued");
                let hash = receipt.hash.clone();
                let outcome = self.record_receipt(claimed, receipt, move |r| {
                    r.transaction_hash = Some(hash.clone());
                    Ok(())
                });
                Ok((outcome, tokens))
            }
            Err(e) => {
                warn!(reservation_id, error = %e, "settlement.loyalty_failed");
                if let Err(release) = self.modify(reservation_id, |r| {
                    r.loyalty_tokens_sent = false;
                    Ok(())
                }) {
                    warn!(reservation_id, error = %release, "settlement.loyalty_release_failed");
                }
                Err(e)
            }
        }
    }

    /// Write the outcome of a chain call that already went through. A failed
    /// write is logged and reported next to the receipt; `last_known` is the
    /// document as it stood before the call.
    fn record_receipt<F>(&self, last_known: Reservation, receipt: TxReceipt, apply: F) -> Outcome
    where
        F: FnMut(&mut Reservation) -> Result<()>,
    {
        let reservation_id = last_known.reservation_id.clone();
        match self.modify(&reservation_id, apply) {
            Ok(reservation) => Outcome {
                reservation,
                receipt: Some(receipt),
                settlement_error: None,
            },
            Err(e) => {
                warn!(%reservation_id, tx = %receipt.hash, error = %e, "settlement.record_failed");
                let note = format!(
                    "Transaction {} succeeded but could not be recorded: {}",
                    receipt.hash, e
                );
                Outcome {
                    reservation: last_known,
                    receipt: Some(receipt),
                    settlement_error: Some(note),
                }
            }
        }
    }

    /// Load, mutate and compare-and-swap a reservation. On a version clash the
    /// document is re-read and `apply` runs again against the fresh copy.
    fn modify<F>(&self, reservation_id: &str, mut apply: F) -> Result<Reservation>
    where
        F: FnMut(&mut Reservation) -> Result<()>,
    {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let current = self.get(reservation_id)?;
            let mut next = current.clone();
            apply(&mut next)?;
            next.touch();
            match self.store.replace(current.version, &next) {
                Ok(()) => return Ok(next),
                Err(ReservationError::Conflict(msg)) if attempt < MAX_WRITE_ATTEMPTS => {
                    warn!(reservation_id, attempt, "write conflict, retrying: {}", msg);
                }
                Err(e) => return Err(e),
            }
        }
        Err(ReservationError::Conflict(format!(
            "Reservation {} is being modified concurrently",
            reservation_id
        )))
    }
}

fn chain_id_of(reservation: &Reservation) -> Result<Option<u64>> {
    reservation
        .blockchain_reservation_id
        .as_deref()
        .map(|id| {
            id.parse::<u64>().map_err(|_| {
                ReservationError::Database(format!(
                    "Stored blockchain reservation id '{}' is not numeric",
                    id
                ))
            })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KeyPair;
    use crate::persistence::InMemoryStore;
    use crate::reservation::PaymentStatus;
    use crate::settlement::{ChainReservation, InMemorySettlement};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn input(register_on_chain: bool) -> NewReservation {
        NewReservation {
            business_name: Some("Terraza Mediterranea".to_string()),
            customer_name: "Elif".to_string(),
            customer_phone: "+905551112233".to_string(),
            date: NaiveDate::from_ymd_opt(2026, 11, 20).unwrap(),
            time: "21:15".to_string(),
            number_of_people: 5,
            notes: None,
            register_on_chain,
            payment_amount: Some("25".to_string()),
        }
    }

    fn service_with_ledger() -> (ReservationService, InMemorySettlement) {
        let ledger = InMemorySettlement::default();
        let service = ReservationService::new(
            Arc::new(InMemoryStore::new()),
            Some(Arc::new(ledger.clone())),
            "http://localhost:3000/",
        );
        (service, ledger)
    }

    fn plain_service() -> ReservationService {
        ReservationService::new(Arc::new(InMemoryStore::new()), None, "http://localhost:3000")
    }

    /// Local ledger whose transfers yield to the scheduler before running, so
    /// two requests joined on one task interleave at the transfer.
    #[derive(Default)]
    struct SlowLedger {
        ledger: InMemorySettlement,
        fail_transfers: AtomicBool,
    }

    #[async_trait]
    impl SettlementClient for SlowLedger {
        fn backend(&self) -> &'static str {
            "slow"
        }

        async fn create_reservation(
            &self,
            request: &ChainReservationRequest,
        ) -> Result<ChainReservation> {
            self.ledger.create_reservation(request).await
        }

        async fn confirm_reservation(&self, chain_id: u64, customer: &str) -> Result<TxReceipt> {
            self.ledger.confirm_reservation(chain_id, customer).await
        }

        async fn update_reservation_status(
            &self,
            chain_id: u64,
            status: ChainStatus,
        ) -> Result<TxReceipt> {
            self.ledger.update_reservation_status(chain_id, status).await
        }

        async fn transfer_stablecoin(&self, destination: &str, amount: i128) -> Result<TxReceipt> {
            tokio::task::yield_now().await;
            if self.fail_transfers.load(Ordering::SeqCst) {
                return Err(ReservationError::Settlement("gateway timeout".to_string()));
            }
            self.ledger.transfer_stablecoin(destination, amount).await
        }

        async fn issue_loyalty(&self, destination: &str, amount: i128) -> Result<TxReceipt> {
            tokio::task::yield_now().await;
            self.ledger.issue_loyalty(destination, amount).await
        }
    }

    /// Store that can slip a competing write in right before the next
    /// `replace`, or start failing writes once a budget is spent.
    #[derive(Default)]
    struct InterferingStore {
        inner: InMemoryStore,
        competing_write: Mutex<Option<Box<dyn FnOnce(&mut Reservation) + Send>>>,
        writes_left: Mutex<Option<usize>>,
        replace_calls: AtomicUsize,
    }

    impl InterferingStore {
        fn before_next_write(&self, change: impl FnOnce(&mut Reservation) + Send + 'static) {
            *self.competing_write.lock().unwrap() = Some(Box::new(change));
        }

        fn allow_writes(&self, count: usize) {
            *self.writes_left.lock().unwrap() = Some(count);
        }
    }

    impl ReservationStore for InterferingStore {
        fn insert(&self, reservation: &Reservation) -> Result<()> {
            self.inner.insert(reservation)
        }

        fn get(&self, reservation_id: &str) -> Result<Option<Reservation>> {
            self.inner.get(reservation_id)
        }

        fn get_by_token(&self, token: &str) -> Result<Option<Reservation>> {
            self.inner.get_by_token(token)
        }

        fn list(&self, filter: &ListFilter) -> Result<Vec<Reservation>> {
            self.inner.list(filter)
        }

        fn replace(&self, expected_version: u64, reservation: &Reservation) -> Result<()> {
            self.replace_calls.fetch_add(1, Ordering::SeqCst);
            let competing = self.competing_write.lock().unwrap().take();
            if let Some(change) = competing {
                let mut current = self.inner.get(&reservation.reservation_id)?.unwrap();
                let version = current.version;
                change(&mut current);
                current.touch();
                self.inner.replace(version, &current)?;
            }
            if let Some(left) = self.writes_left.lock().unwrap().as_mut() {
                if *left == 0 {
                    return Err(ReservationError::Database("disk I/O error".to_string()));
                }
                *left -= 1;
            }
            self.inner.replace(expected_version, reservation)
        }

        fn delete(&self, reservation_id: &str) -> Result<bool> {
            self.inner.delete(reservation_id)
        }
    }

    fn interfering_service(
        settlement: Option<Arc<dyn SettlementClient>>,
    ) -> (ReservationService, Arc<InterferingStore>) {
        let store = Arc::new(InterferingStore::default());
        let service = ReservationService::new(store.clone(), settlement, "http://localhost:3000");
        (service, store)
    }

    async fn confirmed_reservation(service: &ReservationService) -> String {
        let id = service
            .create(input(false))
            .await
            .unwrap()
            .reservation
            .reservation_id;
        service.confirm_pending(&id).unwrap();
        id
    }

    #[tokio::test]
    async fn test_create_returns_confirmation_url() {
        let service = plain_service();
        let created = service.create(input(false)).await.unwrap();
        assert_eq!(
            created.confirmation_url,
            format!(
                "http://localhost:3000/confirm/{}",
                created.reservation.confirmation_token
            )
        );
        assert!(created.reservation.blockchain_reservation_id.is_none());
        assert!(service.get(&created.reservation.reservation_id).is_ok());
    }

    #[tokio::test]
    async fn test_create_on_chain_requires_settlement() {
        let service = plain_service();
        assert_eq!(
            service.create(input(true)).await.unwrap_err(),
            ReservationError::SettlementDisabled
        );
        assert!(service.list(&ListFilter::default()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_full_on_chain_lifecycle() {
        let (service, ledger) = service_with_ledger();
        let created = service.create(input(true)).await.unwrap();
        let id = created.reservation.reservation_id.clone();
        assert_eq!(
            created.reservation.blockchain_reservation_id.as_deref(),
            Some("0")
        );
        assert_eq!(ledger.entry(0).unwrap().payment_amount, 250_000_000);

        let customer = KeyPair::generate().address_hex();
        let confirmed = service.confirm_on_chain(&id, &customer).await.unwrap();
        assert_eq!(
            confirmed.reservation.confirmation_status,
            ConfirmationStatus::Confirmed
        );
        assert_eq!(
            confirmed.reservation.customer_address.as_deref(),
            Some(customer.as_str())
        );

        let paid = service.confirm_payment(&id, "25").await.unwrap();
        assert_eq!(
            paid.reservation.payment_status,
            crate::reservation::PaymentStatus::Completed
        );

        let arrived = service
            .update_attendance(&id, AttendanceStatus::Arrived)
            .await
            .unwrap();
        assert!(arrived.settlement_error.is_none());
        assert_eq!(arrived.reservation.status, ReservationStatus::Completed);
        assert_eq!(ledger.entry(0).unwrap().status, ChainStatus::Completed);

        let (loyalty, tokens) = service.issue_loyalty(&id, None, 250).await.unwrap();
        assert_eq!(tokens, 2);
        assert!(loyalty.reservation.loyalty_tokens_sent);
        assert!(service.issue_loyalty(&id, None, 250).await.is_err());
    }

    #[tokio::test]
    async fn test_attendance_settlement_failure_is_reported_not_fatal() {
        let (service, _ledger) = service_with_ledger();
        let created = service.create(input(true)).await.unwrap();
        let id = created.reservation.reservation_id;
        // Confirmed in the database only; the contract still sees it pending
        service.confirm_pending(&id).unwrap();

        let outcome = service
            .update_attendance(&id, AttendanceStatus::NoShow)
            .await
            .unwrap();
        assert_eq!(outcome.reservation.status, ReservationStatus::Cancelled);
        assert!(outcome.settlement_error.is_some());
    }

    #[tokio::test]
    async fn test_token_flow() {
        let service = plain_service();
        let created = service.create(input(false)).await.unwrap();
        let token = created.reservation.confirmation_token.clone();

        let found = service.lookup_by_token(&token).unwrap();
        assert_eq!(found.reservation_id, created.reservation.reservation_id);

        let confirmed = service
            .respond_by_token(&token, CustomerAction::Confirm)
            .unwrap();
        assert_eq!(confirmed.status, ReservationStatus::Confirmed);
        assert!(matches!(
            service.respond_by_token(&token, CustomerAction::Cancel),
            Err(ReservationError::InvalidTransition(_))
        ));
        assert!(matches!(
            service.lookup_by_token("CONF-NOPE"),
            Err(ReservationError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_payment_requires_confirmation_and_settlement() {
        let service = plain_service();
        let created = service.create(input(false)).await.unwrap();
        assert_eq!(
            service
                .confirm_payment(&created.reservation.reservation_id, "10")
                .await
                .unwrap_err(),
            ReservationError::SettlementDisabled
        );

        let (service, _) = service_with_ledger();
        let created = service.create(input(false)).await.unwrap();
        assert!(matches!(
            service
                .confirm_payment(&created.reservation.reservation_id, "10")
                .await,
            Err(ReservationError::InvalidTransition(_))
        ));
    }

    #[tokio::test]
    async fn test_confirm_on_chain_requires_registration() {
        let (service, _) = service_with_ledger();
        let created = service.create(input(false)).await.unwrap();
        let err = service
            .confirm_on_chain(
                &created.reservation.reservation_id,
                &KeyPair::generate().address_hex(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ReservationError::InvalidTransition(_)));

        let err = service
            .confirm_on_chain(&created.reservation.reservation_id, "G-not-hex")
            .await
            .unwrap_err();
        assert!(matches!(err, ReservationError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_stats() {
        let service = plain_service();
        let a = service.create(input(false)).await.unwrap().reservation;
        let b = service.create(input(false)).await.unwrap().reservation;
        let _c = service.create(input(false)).await.unwrap().reservation;
        service.confirm_pending(&a.reservation_id).unwrap();
        service
            .update_attendance(&a.reservation_id, AttendanceStatus::Arrived)
            .await
            .unwrap();
        service.confirm_pending(&b.reservation_id).unwrap();
        service
            .update_attendance(&b.reservation_id, AttendanceStatus::NoShow)
            .await
            .unwrap();

        let stats = service.stats().unwrap();
        assert_eq!(stats.total, 3);
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.confirmed, 1);
        assert_eq!(stats.cancelled, 1);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.arrived, 1);
        assert_eq!(stats.no_show, 1);
        assert_eq!(stats.total_guests, 15);
        assert_eq!(stats.expected_guests, 5);
        assert_eq!(service.pending_notifications().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let service = plain_service();
        let r = service.create(input(false)).await.unwrap().reservation;
        let updated = service
            .update(
                &r.reservation_id,
                ReservationUpdate {
                    notes: Some("birthday".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.notes.as_deref(), Some("birthday"));
        assert_eq!(updated.version, r.version + 1);

        service.delete(&r.reservation_id).unwrap();
        assert!(matches!(
            service.delete(&r.reservation_id),
            Err(ReservationError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_payments_transfer_once() {
        let ledger = Arc::new(SlowLedger::default());
        let service = ReservationService::new(
            Arc::new(InMemoryStore::new()),
            Some(ledger.clone()),
            "http://localhost:3000",
        );
        let id = confirmed_reservation(&service).await;

        let (a, b) = tokio::join!(
            service.confirm_payment(&id, "10"),
            service.confirm_payment(&id, "10")
        );
        let (paid, refused) = match (a, b) {
            (Ok(paid), Err(refused)) | (Err(refused), Ok(paid)) => (paid, refused),
            other => panic!("expected exactly one payment to succeed: {:?}", other),
        };
        assert_eq!(
            refused,
            ReservationError::InvalidTransition("Payment already in progress".to_string())
        );
        assert_eq!(paid.reservation.payment_status, PaymentStatus::Completed);
        assert_eq!(
            paid.reservation.transaction_hash.as_deref(),
            paid.receipt.as_ref().map(|r| r.hash.as_str())
        );
        assert_eq!(ledger.ledger.transfers().len(), 1);
        assert!(service.confirm_payment(&id, "10").await.is_err());
        assert_eq!(ledger.ledger.transfers().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_payment_releases_claim() {
        let ledger = Arc::new(SlowLedger::default());
        let service = ReservationService::new(
            Arc::new(InMemoryStore::new()),
            Some(ledger.clone()),
            "http://localhost:3000",
        );
        let id = confirmed_reservation(&service).await;

        ledger.fail_transfers.store(true, Ordering::SeqCst);
        let err = service.confirm_payment(&id, "10").await.unwrap_err();
        assert!(matches!(err, ReservationError::Settlement(_)));
        assert_eq!(service.get(&id).unwrap().payment_status, PaymentStatus::Failed);

        ledger.fail_transfers.store(false, Ordering::SeqCst);
        let paid = service.confirm_payment(&id, "10").await.unwrap();
        assert_eq!(paid.reservation.payment_status, PaymentStatus::Completed);
        assert_eq!(ledger.ledger.transfers().len(), 1);
    }

    #[tokio::test]
    async fn test_write_conflict_reapplies_transition_to_fresh_copy() {
        let (service, store) = interfering_service(None);
        let created = service.create(input(false)).await.unwrap().reservation;
        let id = created.reservation_id.clone();

        store.before_next_write(|r| r.notes = Some("window seat".to_string()));
        let confirmed = service.confirm_pending(&id).unwrap();

        assert_eq!(store.replace_calls.load(Ordering::SeqCst), 2);
        assert_eq!(confirmed.status, ReservationStatus::Confirmed);
        assert_eq!(confirmed.notes.as_deref(), Some("window seat"));
        assert_eq!(confirmed.version, created.version + 2);
        assert_eq!(service.get(&id).unwrap(), confirmed);
    }

    #[tokio::test]
    async fn test_racing_transitions_only_one_wins() {
        let (service, store) = interfering_service(None);
        let created = service.create(input(false)).await.unwrap().reservation;

        // The customer refuses through the link while the business confirms
        store.before_next_write(|r| {
            transitions::respond_as_customer(r, CustomerAction::Cancel).unwrap()
        });
        let err = service.confirm_pending(&created.reservation_id).unwrap_err();
        assert!(matches!(err, ReservationError::InvalidTransition(_)));

        let stored = service.get(&created.reservation_id).unwrap();
        assert_eq!(stored.confirmation_status, ConfirmationStatus::Cancelled);
        assert_eq!(stored.status, ReservationStatus::Cancelled);
        assert_eq!(stored.version, created.version + 1);
    }

    #[tokio::test]
    async fn test_storage_errors_are_not_retried() {
        let (service, store) = interfering_service(None);
        let id = service
            .create(input(false))
            .await
            .unwrap()
            .reservation
            .reservation_id;
        store.allow_writes(0);
        assert!(matches!(
            service.confirm_pending(&id),
            Err(ReservationError::Database(_))
        ));
        assert_eq!(store.replace_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_receipt_kept_when_recording_fails() {
        let ledger = InMemorySettlement::default();
        let (service, store) = interfering_service(Some(Arc::new(ledger.clone())));
        let created = service.create(input(true)).await.unwrap();
        let id = created.reservation.reservation_id;
        service
            .confirm_on_chain(&id, &KeyPair::generate().address_hex())
            .await
            .unwrap();

        // Attendance is written, the contract call succeeds, the hash is not
        store.allow_writes(1);
        let outcome = service
            .update_attendance(&id, AttendanceStatus::Arrived)
            .await
            .unwrap();
        let receipt = outcome.receipt.expect("receipt survives");
        assert!(outcome
            .settlement_error
            .as_deref()
            .unwrap()
            .contains(&receipt.hash));
        assert_eq!(outcome.reservation.status, ReservationStatus::Completed);
        assert_eq!(ledger.entry(0).unwrap().status, ChainStatus::Completed);

        // Payment stays claimed, so the transfer cannot be repeated
        store.allow_writes(1);
        let paid = service.confirm_payment(&id, "25").await.unwrap();
        assert!(paid.receipt.is_some());
        assert!(paid.settlement_error.is_some());
        assert_eq!(paid.reservation.payment_status, PaymentStatus::Processing);
        assert_eq!(ledger.transfers().len(), 1);
        store.allow_writes(usize::MAX);
        assert!(service.confirm_payment(&id, "25").await.is_err());
        assert_eq!(ledger.transfers().len(), 1);
    }
}

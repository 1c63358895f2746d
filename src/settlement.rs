//! Settlement integration
//!
//! Thin pass-through to an externally deployed reservation contract and the
//! asset payments around it. Authorization, token accounting and replay
//! protection belong to the contract; this module only builds, signs and
//! submits calls and reports what the gateway answered. No retries.

use crate::config::{SettlementConfig, SettlementMode};
use crate::crypto::{address_from_hex, KeyPair};
use crate::economics::CONTRACT_LOYALTY_GRANT;
use crate::error::{ReservationError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Reservation states as the contract names them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainStatus {
    Pending,
    Confirmed,
    NoShow,
    Completed,
    Cancelled,
}

/// Arguments of the contract's `create_reservation`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainReservationRequest {
    pub business: String,
    pub reservation_time: u64,
    pub party_size: u32,
    /// Contract base units
    pub payment_amount: i128,
    pub payment_asset: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainReservation {
    pub chain_id: u64,
    pub receipt: TxReceipt,
}

#[async_trait]
pub trait SettlementClient: Send + Sync {
    /// Short backend name reported by the health endpoint.
    fn backend(&self) -> &'static str;

    async fn create_reservation(&self, request: &ChainReservationRequest)
        -> Result<ChainReservation>;

    async fn confirm_reservation(&self, chain_id: u64, customer: &str) -> Result<TxReceipt>;

    async fn update_reservation_status(&self, chain_id: u64, status: ChainStatus)
        -> Result<TxReceipt>;

    /// Stablecoin payment from the configured payer account to `destination`.
    async fn transfer_stablecoin(&self, destination: &str, amount: i128) -> Result<TxReceipt>;

    async fn issue_loyalty(&self, destination: &str, amount: i128) -> Result<TxReceipt>;
}

/// Build the settlement client selected by configuration; `None` when disabled.
pub fn from_config(config: &SettlementConfig) -> Result<Option<Arc<dyn SettlementClient>>> {
    match config.mode {
        SettlementMode::Disabled => Ok(None),
        SettlementMode::Local => Ok(Some(Arc::new(InMemorySettlement::new(
            config.stablecoin_code.clone(),
            config.loyalty_code.clone(),
        )))),
        SettlementMode::Rpc => Ok(Some(Arc::new(RpcSettlement::new(config)?))),
    }
}

fn validate_destination(destination: &str) -> Result<()> {
    address_from_hex(destination).map(|_| ())
}

fn validate_amount(amount: i128) -> Result<()> {
    if amount <= 0 {
        return Err(ReservationError::InvalidInput(
            "Amount must be positive".to_string(),
        ));
    }
    Ok(())
}

// ============================================================================
// JSON-RPC gateway client
// ============================================================================

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<RpcResult>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcResult {
    hash: String,
    #[serde(default)]
    value: Value,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// Signs calls with the configured key and posts them to a JSON-RPC gateway.
pub struct RpcSettlement {
    http: reqwest::Client,
    rpc_url: String,
    contract_id: String,
    network: String,
    business_address: String,
    stablecoin_code: String,
    loyalty_code: String,
    signer: KeyPair,
    next_request_id: AtomicU64,
}

impl RpcSettlement {
    pub fn new(config: &SettlementConfig) -> Result<Self> {
        let signer = KeyPair::from_secret_hex(config.signer_secret_key.as_deref().ok_or_else(
            || ReservationError::Config("settlement.signer_secret_key is required".to_string()),
        )?)?;
        let rpc_url = config.rpc_url.clone().ok_or_else(|| {
            ReservationError::Config("settlement.rpc_url is required".to_string())
        })?;
        let contract_id = config.contract_id.clone().ok_or_else(|| {
            ReservationError::Config("settlement.contract_id is required".to_string())
        })?;
        let business_address = config
            .business_address
            .clone()
            .unwrap_or_else(|| signer.address_hex());

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ReservationError::Config(format!("HTTP client: {}", e)))?;

        Ok(RpcSettlement {
            http,
            rpc_url,
            contract_id,
            network: config.network.clone(),
            business_address,
            stablecoin_code: config.stablecoin_code.clone(),
            loyalty_code: config.loyalty_code.clone(),
            signer,
            next_request_id: AtomicU64::new(1),
        })
    }

    pub fn signer_address(&self) -> String {
        self.signer.address_hex()
    }

    /// Sign `call` and submit it; `call` is canonical because `serde_json`
    /// keeps object keys sorted.
    async fn submit(&self, method: &str, call: Value) -> Result<RpcResult> {
        let signable = serde_json::to_vec(&call)
            .map_err(|e| ReservationError::Settlement(format!("Failed to encode call: {}", e)))?;
        let signature = self.signer.sign(&signable)?;

        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": {
                "call": call,
                "signer": self.signer.public_key_hex(),
                "signature": hex::encode(signature),
            }
        });

        tracing::debug!(method, request_id = id, "settlement.submit");
        let response = self
            .http
            .post(&self.rpc_url)
            .json(&body)
            .send()
            .await?
            .error_for_status()?;
        let parsed: RpcResponse = response.json().await?;

        match (parsed.result, parsed.error) {
            (_, Some(err)) => Err(ReservationError::Settlement(format!(
                "Gateway rejected call ({}): {}",
                err.code, err.message
            ))),
            (Some(result), None) => Ok(result),
            (None, None) => Err(ReservationError::Settlement(
                "Gateway returned neither result nor error".to_string(),
            )),
        }
    }

    async fn invoke(&self, function: &str, args: Value) -> Result<RpcResult> {
        self.submit(
            "invoke",
            json!({
                "contract": self.contract_id,
                "network": self.network,
                "function": function,
                "args": args,
            }),
        )
        .await
    }

    async fn payment(&self, asset: &str, destination: &str, amount: i128) -> Result<TxReceipt> {
        validate_destination(destination)?;
        validate_amount(amount)?;
        let result = self
            .submit(
                "payment",
                json!({
                    "network": self.network,
                    "asset": asset,
                    "source": self.signer.address_hex(),
                    "destination": destination,
                    "amount": amount.to_string(),
                }),
            )
            .await?;
        Ok(TxReceipt { hash: result.hash })
    }
}

#[async_trait]
impl SettlementClient for RpcSettlement {
    fn backend(&self) -> &'static str {
        "rpc"
    }

    async fn create_reservation(
        &self,
        request: &ChainReservationRequest,
    ) -> Result<ChainReservation> {
        let result = self
            .invoke(
                "create_reservation",
                json!({
                    "business_id": request.business,
                    "reservation_time": request.reservation_time,
                    "party_size": request.party_size,
                    "payment_amount": request.payment_amount.to_string(),
                    "payment_asset": request.payment_asset,
                }),
            )
            .await?;
        let chain_id = result.value.as_u64().ok_or_else(|| {
            ReservationError::Settlement(format!(
                "create_reservation returned non-numeric id: {}",
                result.value
            ))
        })?;
        Ok(ChainReservation {
            chain_id,
            receipt: TxReceipt { hash: result.hash },
        })
    }

    async fn confirm_reservation(&self, chain_id: u64, customer: &str) -> Result<TxReceipt> {
        validate_destination(customer)?;
        let result = self
            .invoke(
                "confirm_reservation",
                json!({ "reservation_id": chain_id, "customer_id": customer }),
            )
            .await?;
        Ok(TxReceipt { hash: result.hash })
    }

    async fn update_reservation_status(
        &self,
        chain_id: u64,
        status: ChainStatus,
    ) -> Result<TxReceipt> {
        let result = self
            .invoke(
                "update_reservation_status",
                json!({ "reservation_id": chain_id, "new_status": status }),
            )
            .await?;
        Ok(TxReceipt { hash: result.hash })
    }

    async fn transfer_stablecoin(&self, destination: &str, amount: i128) -> Result<TxReceipt> {
        let destination = if destination.is_empty() {
            self.business_address.as_str()
        } else {
            destination
        };
        self.payment(&self.stablecoin_code, destination, amount).await
    }

    async fn issue_loyalty(&self, destination: &str, amount: i128) -> Result<TxReceipt> {
        self.payment(&self.loyalty_code, destination, amount).await
    }
}

// ============================================================================
// Local ledger
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub business: String,
    pub customer: Option<String>,
    pub reservation_time: u64,
    pub party_size: u32,
    pub payment_amount: i128,
    pub status: ChainStatus,
    pub loyalty_issued: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub asset: String,
    pub destination: String,
    pub amount: i128,
    pub hash: String,
}

#[derive(Debug, Default)]
struct LedgerState {
    next_id: u64,
    tx_count: u64,
    reservations: HashMap<u64, LedgerEntry>,
    transfers: Vec<Transfer>,
}

impl LedgerState {
    fn tx_hash(&mut self, function: &str, detail: &str) -> String {
        self.tx_count += 1;
        let mut hasher = Sha256::new();
        hasher.update(self.tx_count.to_be_bytes());
        hasher.update(function.as_bytes());
        hasher.update(detail.as_bytes());
        hex::encode(hasher.finalize())
    }

    fn entry_mut(&mut self, chain_id: u64) -> Result<&mut LedgerEntry> {
        self.reservations.get_mut(&chain_id).ok_or_else(|| {
            ReservationError::Settlement(format!("Reservation {} not found on ledger", chain_id))
        })
    }
}

/// Deterministic in-process ledger used for local runs and tests. It keeps
/// the contract's guard rails so misuse surfaces the same way it would
/// against the real gateway.
#[derive(Clone)]
pub struct InMemorySettlement {
    business_account: String,
    stablecoin_code: String,
    loyalty_code: String,
    state: Arc<Mutex<LedgerState>>,
}

impl Default for InMemorySettlement {
    fn default() -> Self {
        Self::new("USDC".to_string(), "LOYALTY".to_string())
    }
}

impl InMemorySettlement {
    pub fn new(stablecoin_code: String, loyalty_code: String) -> Self {
        Self {
            business_account: KeyPair::generate().address_hex(),
            stablecoin_code,
            loyalty_code,
            state: Arc::new(Mutex::new(LedgerState::default())),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, LedgerState>> {
        self.state
            .lock()
            .map_err(|_| ReservationError::Settlement("Ledger mutex poisoned".to_string()))
    }

    /// Account that receives stablecoin payments without explicit destination.
    pub fn business_account(&self) -> &str {
        &self.business_account
    }

    pub fn entry(&self, chain_id: u64) -> Option<LedgerEntry> {
        self.lock()
            .ok()
            .and_then(|s| s.reservations.get(&chain_id).cloned())
    }

    pub fn transfers(&self) -> Vec<Transfer> {
        self.lock().map(|s| s.transfers.clone()).unwrap_or_default()
    }

    fn record_transfer(&self, asset: &str, destination: &str, amount: i128) -> Result<TxReceipt> {
        validate_destination(destination)?;
        validate_amount(amount)?;
        let mut state = self.lock()?;
        let hash = state.tx_hash("payment", &format!("{}:{}:{}", asset, destination, amount));
        state.transfers.push(Transfer {
            asset: asset.to_string(),
            destination: destination.to_string(),
            amount,
            hash: hash.clone(),
        });
        Ok(TxReceipt { hash })
    }
}

#[async_trait]
impl SettlementClient for InMemorySettlement {
    fn backend(&self) -> &'static str {
        "local"
    }

    async fn create_reservation(
        &self,
        request: &ChainReservationRequest,
    ) -> Result<ChainReservation> {
        let mut state = self.lock()?;
        let chain_id = state.next_id;
        state.next_id += 1;
        // The contract ignores the requested asset and settles natively
        state.reservations.insert(
            chain_id,
            LedgerEntry {
                business: request.business.clone(),
                customer: None,
                reservation_time: request.reservation_time,
                party_size: request.party_size,
                payment_amount: request.payment_amount,
                status: ChainStatus::Pending,
                loyalty_issued: false,
            },
        );
        let hash = state.tx_hash("create_reservation", &chain_id.to_string());
        Ok(ChainReservation {
            chain_id,
            receipt: TxReceipt { hash },
        })
    }

    async fn confirm_reservation(&self, chain_id: u64, customer: &str) -> Result<TxReceipt> {
        validate_destination(customer)?;
        let mut state = self.lock()?;
        let entry = state.entry_mut(chain_id)?;
        if entry.status != ChainStatus::Pending {
            return Err(ReservationError::Settlement(
                "Reservation is not in pending state".to_string(),
            ));
        }
        match &entry.customer {
            Some(assigned) if assigned != customer => {
                return Err(ReservationError::Settlement(
                    "Unauthorized: not the customer for this reservation".to_string(),
                ))
            }
            Some(_) => {}
            None => entry.customer = Some(customer.to_string()),
        }
        entry.status = ChainStatus::Confirmed;
        Ok(TxReceipt {
            hash: state.tx_hash("confirm_reservation", &format!("{}:{}", chain_id, customer)),
        })
    }

    async fn update_reservation_status(
        &self,
        chain_id: u64,
        status: ChainStatus,
    ) -> Result<TxReceipt> {
        let mut state = self.lock()?;
        let loyalty_code = self.loyalty_code.clone();
        let entry = state.entry_mut(chain_id)?;
        if entry.status != ChainStatus::Confirmed {
            return Err(ReservationError::Settlement(
                "Cannot update status for a non-confirmed reservation".to_string(),
            ));
        }

        let mut grant_to = None;
        match status {
            ChainStatus::Completed => {
                if !entry.loyalty_issued {
                    let customer = entry.customer.clone().ok_or_else(|| {
                        ReservationError::Settlement("Customer not assigned".to_string())
                    })?;
                    entry.loyalty_issued = true;
                    grant_to = Some(customer);
                }
                entry.status = status;
            }
            ChainStatus::NoShow => entry.status = status,
            other => {
                return Err(ReservationError::Settlement(format!(
                    "Invalid status update to {:?}",
                    other
                )))
            }
        }

        let hash = state.tx_hash("update_reservation_status", &format!("{}:{:?}", chain_id, status));
        if let Some(customer) = grant_to {
            state.transfers.push(Transfer {
                asset: loyalty_code,
                destination: customer,
                amount: CONTRACT_LOYALTY_GRANT,
                hash: hash.clone(),
            });
        }
        Ok(TxReceipt { hash })
    }

    async fn transfer_stablecoin(&self, destination: &str, amount: i128) -> Result<TxReceipt> {
        let destination = if destination.is_empty() {
            self.business_account.as_str()
        } else {
            destination
        };
        self.record_transfer(&self.stablecoin_code, destination, amount)
    }

    async fn issue_loyalty(&self, destination: &str, amount: i128) -> Result<TxReceipt> {
        self.record_transfer(&self.loyalty_code, destination, amount)
    }
}

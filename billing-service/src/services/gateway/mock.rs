//! Scripted gateway for tests and dry runs.

use super::{
    ChargeRequest, ChargeResponse, GatewayError, GatewayNotification, InstrumentData,
    InnerException, PaymentGateway, StatusInfo, TokenizedInstrument,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

/// Answer the mock gives to the next charge.
#[derive(Debug, Clone)]
pub enum ScriptedCharge {
    Approve,
    Decline(String),
    /// Gateway accepted the charge but settles later (status 35).
    Pending,
    /// Transport-level failure.
    Error(String),
    /// Sleep before approving, to exercise caller timeouts.
    Delay(Duration),
}

/// Mock payment gateway. Charges follow the script queue, then the default.
pub struct MockPaymentGateway {
    slug: String,
    script: Mutex<VecDeque<ScriptedCharge>>,
    default: ScriptedCharge,
    statuses: Mutex<HashMap<String, GatewayNotification>>,
    charges: Mutex<Vec<ChargeRequest>>,
    charge_count: AtomicU64,
    token_count: AtomicU64,
}

impl MockPaymentGateway {
    pub fn new(slug: &str) -> Self {
        Self::with_default(slug, ScriptedCharge::Approve)
    }

    pub fn with_default(slug: &str, default: ScriptedCharge) -> Self {
        Self {
            slug: slug.to_string(),
            script: Mutex::new(VecDeque::new()),
            default,
            statuses: Mutex::new(HashMap::new()),
            charges: Mutex::new(Vec::new()),
            charge_count: AtomicU64::new(0),
            token_count: AtomicU64::new(0),
        }
    }

    /// Queue answers for the next charges, in order.
    pub fn script(&self, answers: impl IntoIterator<Item = ScriptedCharge>) {
        if let Ok(mut script) = self.script.lock() {
            script.extend(answers);
        }
    }

    /// Answer `query_status` for `order_number` with gateway status `code`.
    pub fn set_status(&self, order_number: &str, code: i64, cause: Option<&str>) {
        if let Ok(mut statuses) = self.statuses.lock() {
            statuses.insert(
                order_number.to_string(),
                GatewayNotification {
                    transaction_id: Some(format!("PW-{}", order_number)),
                    status: StatusInfo {
                        id: code,
                        nombre: None,
                    },
                    order_number: order_number.to_string(),
                    amount: None,
                    inner_exception: cause.map(|c| InnerException {
                        causal: Some(c.to_string()),
                    }),
                },
            );
        }
    }

    pub fn charge_count(&self) -> u64 {
        self.charge_count.load(Ordering::SeqCst)
    }

    pub fn charges(&self) -> Vec<ChargeRequest> {
        self.charges.lock().map(|c| c.clone()).unwrap_or_default()
    }

    fn next_answer(&self) -> ScriptedCharge {
        self.script
            .lock()
            .ok()
            .and_then(|mut script| script.pop_front())
            .unwrap_or_else(|| self.default.clone())
    }
}

#[async_trait]
impl PaymentGateway for MockPaymentGateway {
    fn slug(&self) -> &str {
        &self.slug
    }

    async fn tokenize(
        &self,
        user_id: Uuid,
        _instrument: &InstrumentData,
    ) -> Result<TokenizedInstrument, GatewayError> {
        let n = self.token_count.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(user_id = %user_id, "[MOCK] Card would be tokenized");
        Ok(TokenizedInstrument {
            token: format!("mock-token-{}", n),
            customer_id: Some(format!("mock-person-{}", user_id)),
        })
    }

    async fn charge_with_token(
        &self,
        request: &ChargeRequest,
    ) -> Result<ChargeResponse, GatewayError> {
        let n = self.charge_count.fetch_add(1, Ordering::SeqCst) + 1;
        if let Ok(mut charges) = self.charges.lock() {
            charges.push(request.clone());
        }

        let answer = self.next_answer();
        tracing::info!(
            order_number = %request.order_number,
            amount = %request.amount,
            answer = ?answer,
            "[MOCK] Charge would be sent"
        );

        let (status_code, message) = match answer {
            ScriptedCharge::Approve => ("00", "Aprobada".to_string()),
            ScriptedCharge::Decline(message) => ("36", message),
            ScriptedCharge::Pending => ("35", "Pendiente".to_string()),
            ScriptedCharge::Error(message) => return Err(GatewayError::Transport(message)),
            ScriptedCharge::Delay(delay) => {
                tokio::time::sleep(delay).await;
                ("00", "Aprobada".to_string())
            }
        };

        Ok(ChargeResponse {
            transaction_id: Some(format!("PW-MOCK-{}", n)),
            status_code: status_code.to_string(),
            message: Some(message.clone()),
            raw: serde_json::json!({
                "status_code": status_code,
                "message": message,
                "external_order": request.order_number,
            }),
        })
    }

    async fn query_status(&self, order_number: &str) -> Result<GatewayNotification, GatewayError> {
        self.statuses
            .lock()
            .ok()
            .and_then(|statuses| statuses.get(order_number).cloned())
            .ok_or_else(|| GatewayError::Status {
                status: 404,
                body: format!("order {} not found", order_number),
            })
    }
}

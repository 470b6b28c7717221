//! Payment gateway client
//!
//! Vendor-neutral contract for the money-moving calls the orchestration
//! engine needs: synchronous charges, manual-capture holds, setup intents
//! for deferred payment, off-session charges against saved methods, and
//! refunds. `StripeGateway` is the production implementation.

use std::collections::HashMap;

use async_trait::async_trait;
use stripe::{
    CreateCustomer, CreatePaymentIntent, CreateRefund, CreateSetupIntent, Currency, Customer,
    ListPaymentMethods, PaymentIntent, PaymentIntentCaptureMethod, PaymentIntentOffSession,
    PaymentIntentStatus, PaymentMethod, PaymentMethodTypeFilter, Refund, SetupIntent,
};

use crate::config::GatewayConfig;
use crate::error::{BookingError, BookingResult};

/// An authorization created at the gateway: the opaque reference we
/// persist plus the client-facing secret needed to finish the flow
/// out-of-band.
#[derive(Debug, Clone)]
pub struct PaymentAuthorization {
    pub reference: String,
    pub client_secret: String,
}

/// Outcome of an off-session charge that did not hard-fail.
#[derive(Debug, Clone)]
pub enum OffSessionOutcome {
    /// Funds moved (or are reserved under a hold); safe to confirm.
    Succeeded { reference: String },
    /// The payer must complete a strong-auth challenge out-of-band.
    RequiresAction { reference: String },
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Resolve-or-create the payer's billing identity at the gateway.
    async fn ensure_customer(
        &self,
        full_name: &str,
        email: &str,
        user_id: &str,
    ) -> BookingResult<String>;

    /// Standard synchronous charge (client completes it with the secret).
    async fn create_charge(
        &self,
        amount_cents: i64,
        customer_ref: &str,
        metadata: HashMap<String, String>,
    ) -> BookingResult<PaymentAuthorization>;

    /// Manual-capture authorization: funds reserved, not yet moved.
    async fn create_hold(
        &self,
        amount_cents: i64,
        customer_ref: &str,
        metadata: HashMap<String, String>,
    ) -> BookingResult<PaymentAuthorization>;

    /// Save a reusable payment method without reserving funds.
    async fn create_setup_intent(
        &self,
        customer_ref: &str,
        metadata: HashMap<String, String>,
    ) -> BookingResult<PaymentAuthorization>;

    /// Charge a saved method with the payer absent. Hard declines come
    /// back as `Err(PaymentDeclined)`.
    async fn charge_off_session(
        &self,
        amount_cents: i64,
        customer_ref: &str,
        method_ref: &str,
        metadata: HashMap<String, String>,
    ) -> BookingResult<OffSessionOutcome>;

    /// Full refund of a captured charge. Returns the refund reference.
    async fn refund(&self, payment_ref: &str) -> BookingResult<String>;

    async fn list_saved_methods(&self, customer_ref: &str) -> BookingResult<Vec<String>>;
}

// ---------------------------------------------------------------------------
// Stripe implementation
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct StripeGateway {
    client: stripe::Client,
    currency: Currency,
}

impl StripeGateway {
    pub fn new(config: &GatewayConfig) -> BookingResult<Self> {
        let currency: Currency = config
            .currency
            .parse()
            .map_err(|_| BookingError::Config(format!("invalid currency '{}'", config.currency)))?;
        Ok(Self {
            client: stripe::Client::new(config.secret_key.clone()),
            currency,
        })
    }

    fn payment_intent_params<'a>(
        &self,
        amount_cents: i64,
        customer_ref: &str,
        metadata: &HashMap<String, String>,
    ) -> BookingResult<CreatePaymentIntent<'a>> {
        let mut params = CreatePaymentIntent::new(amount_cents, self.currency);
        params.customer = Some(parse_id(customer_ref, "customer")?);
        params.metadata = Some(metadata.clone());
        Ok(params)
    }
}

fn parse_id<T: std::str::FromStr>(raw: &str, kind: &str) -> BookingResult<T> {
    raw.parse()
        .map_err(|_| BookingError::Validation(format!("invalid {} reference '{}'", kind, raw)))
}

fn secret_of(reference: &str, secret: Option<String>) -> BookingResult<String> {
    secret.ok_or_else(|| {
        BookingError::Gateway(format!("gateway returned no client secret for {}", reference))
    })
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    async fn ensure_customer(
        &self,
        full_name: &str,
        email: &str,
        user_id: &str,
    ) -> BookingResult<String> {
        let mut params = CreateCustomer::new();
        params.name = Some(full_name);
        params.email = Some(email);
        let mut metadata = HashMap::new();
        metadata.insert("user_id".to_string(), user_id.to_string());
        params.metadata = Some(metadata);

        let customer = Customer::create(&self.client, params).await?;
        Ok(customer.id.to_string())
    }

    async fn create_charge(
        &self,
        amount_cents: i64,
        customer_ref: &str,
        metadata: HashMap<String, String>,
    ) -> BookingResult<PaymentAuthorization> {
        let params = self.payment_intent_params(amount_cents, customer_ref, &metadata)?;
        let intent = PaymentIntent::create(&self.client, params).await?;
        let reference = intent.id.to_string();
        let client_secret = secret_of(&reference, intent.client_secret)?;
        Ok(PaymentAuthorization {
            reference,
            client_secret,
        })
    }

    async fn create_hold(
        &self,
        amount_cents: i64,
        customer_ref: &str,
        metadata: HashMap<String, String>,
    ) -> BookingResult<PaymentAuthorization> {
        let mut params = self.payment_intent_params(amount_cents, customer_ref, &metadata)?;
        params.capture_method = Some(PaymentIntentCaptureMethod::Manual);
        let intent = PaymentIntent::create(&self.client, params).await?;
        let reference = intent.id.to_string();
        let client_secret = secret_of(&reference, intent.client_secret)?;
        Ok(PaymentAuthorization {
            reference,
            client_secret,
        })
    }

    async fn create_setup_intent(
        &self,
        customer_ref: &str,
        metadata: HashMap<String, String>,
    ) -> BookingResult<PaymentAuthorization> {
        let mut params = CreateSetupIntent::new();
        params.customer = Some(parse_id(customer_ref, "customer")?);
        params.metadata = Some(metadata);

        let intent = SetupIntent::create(&self.client, params).await?;
        let reference = intent.id.to_string();
        let client_secret = secret_of(&reference, intent.client_secret)?;
        Ok(PaymentAuthorization {
            reference,
            client_secret,
        })
    }

    async fn charge_off_session(
        &self,
        amount_cents: i64,
        customer_ref: &str,
        method_ref: &str,
        metadata: HashMap<String, String>,
    ) -> BookingResult<OffSessionOutcome> {
        let mut params = self.payment_intent_params(amount_cents, customer_ref, &metadata)?;
        params.payment_method = Some(parse_id(method_ref, "payment method")?);
        params.confirm = Some(true);
        params.off_session = Some(PaymentIntentOffSession::Exists(true));

        let intent = match PaymentIntent::create(&self.client, params).await {
            Ok(intent) => intent,
            Err(stripe::StripeError::Stripe(req_err))
                if req_err.error_type == stripe::ErrorType::Card =>
            {
                let message = req_err
                    .message
                    .unwrap_or_else(|| "card declined".to_string());
                return Err(BookingError::PaymentDeclined(message));
            }
            Err(err) => return Err(err.into()),
        };

        let reference = intent.id.to_string();
        match intent.status {
            PaymentIntentStatus::Succeeded | PaymentIntentStatus::RequiresCapture => {
                Ok(OffSessionOutcome::Succeeded { reference })
            }
            PaymentIntentStatus::RequiresAction => {
                Ok(OffSessionOutcome::RequiresAction { reference })
            }
            other => Err(BookingError::PaymentDeclined(format!(
                "off-session charge for {} ended in status {:?}",
                reference, other
            ))),
        }
    }

    async fn refund(&self, payment_ref: &str) -> BookingResult<String> {
        let mut params = CreateRefund::new();
        params.payment_intent = Some(parse_id(payment_ref, "payment intent")?);

        let refund = Refund::create(&self.client, params)
            .await
            .map_err(|e| BookingError::RefundFailed(e.to_string()))?;
        Ok(refund.id.to_string())
    }

    async fn list_saved_methods(&self, customer_ref: &str) -> BookingResult<Vec<String>> {
        let mut params = ListPaymentMethods::new();
        params.customer = Some(parse_id(customer_ref, "customer")?);
        params.type_ = Some(PaymentMethodTypeFilter::Card);

        let methods = PaymentMethod::list(&self.client, &params).await?;
        Ok(methods.data.into_iter().map(|m| m.id.to_string()).collect())
    }
}

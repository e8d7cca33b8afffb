//! Record types owned by the backend record store.
//!
//! The pipeline never replaces a record wholesale. Every mutation is expressed as an [`OrderUpdate`], which renders to
//! a partial field map ([`RecordFields`]) using the record store's field names.
use std::{convert::Infallible, fmt::Display, str::FromStr};

use cb_common::Amount;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;

/// A partial set of record fields, keyed by their wire names.
pub type RecordFields = Map<String, Value>;

pub const CREDIT_DESCRIPTION: &str = "Deposit from payment";

//--------------------------------------       OrderId       ---------------------------------------------------------
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderId(String);

impl OrderId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OrderId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for OrderId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

//--------------------------------------    PaymentMethod    ---------------------------------------------------------
/// The payment channel the customer picked. Unknown values coming from the store are kept verbatim so that the
/// provider can decide whether it supports them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum PaymentMethod {
    /// PromptPay QR code. Also used when the order doesn't specify a method.
    #[default]
    PromptPay,
    /// TrueMoney e-wallet
    TrueMoneyWallet,
    /// TrueMoney voucher code
    TrueMoneyCode,
    /// Razer Gold gift PIN
    RazorGoldPin,
    Other(String),
}

impl PaymentMethod {
    pub fn as_str(&self) -> &str {
        match self {
            PaymentMethod::PromptPay => "promptpay",
            PaymentMethod::TrueMoneyWallet => "truemoneywallet",
            PaymentMethod::TrueMoneyCode => "truemoneycode",
            PaymentMethod::RazorGoldPin => "razorgoldpin",
            PaymentMethod::Other(s) => s.as_str(),
        }
    }
}

impl Display for PaymentMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for PaymentMethod {
    fn from(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "" | "promptpay" => PaymentMethod::PromptPay,
            "truemoneywallet" => PaymentMethod::TrueMoneyWallet,
            "truemoneycode" => PaymentMethod::TrueMoneyCode,
            "razorgoldpin" => PaymentMethod::RazorGoldPin,
            _ => PaymentMethod::Other(s.to_string()),
        }
    }
}

impl FromStr for PaymentMethod {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(PaymentMethod::from(s))
    }
}

impl Serialize for PaymentMethod {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for PaymentMethod {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(PaymentMethod::from(s.as_str()))
    }
}

//--------------------------------------   OrderStatusType   ---------------------------------------------------------
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OrderStatusType {
    /// The order has been created and is waiting for the export pipeline. An empty status is read as pending.
    #[default]
    #[serde(alias = "")]
    Pending,
    /// The export pipeline is driving the checkout flow.
    SystemPreparing,
    /// A payment URL and QR code have been issued. The customer is expected to pay.
    UserPaying,
    /// Payment was verified on the checkout page and the user has been credited.
    Success,
    /// The order failed. This is terminal.
    Reject,
}

impl OrderStatusType {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatusType::Success | OrderStatusType::Reject)
    }

    /// Status only ever moves forward: `pending → system-preparing → user-paying → success`, with `reject` reachable
    /// from any non-terminal state.
    pub fn can_transition_to(&self, next: OrderStatusType) -> bool {
        use OrderStatusType::*;
        matches!(
            (self, next),
            (Pending, SystemPreparing) |
                (SystemPreparing, UserPaying) |
                (UserPaying, Success) |
                (Pending | SystemPreparing | UserPaying, Reject)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatusType::Pending => "pending",
            OrderStatusType::SystemPreparing => "system-preparing",
            OrderStatusType::UserPaying => "user-paying",
            OrderStatusType::Success => "success",
            OrderStatusType::Reject => "reject",
        }
    }
}

impl Display for OrderStatusType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
#[error("Invalid order status: {0}")]
pub struct StatusConversionError(String);

impl FromStr for OrderStatusType {
    type Err = StatusConversionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" | "pending" => Ok(Self::Pending),
            "system-preparing" => Ok(Self::SystemPreparing),
            "user-paying" => Ok(Self::UserPaying),
            "success" => Ok(Self::Success),
            "reject" => Ok(Self::Reject),
            _ => Err(StatusConversionError(s.to_string())),
        }
    }
}

//--------------------------------------       Progress      ---------------------------------------------------------
/// Export progress, as a percentage. Values above 100 are clamped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Progress(u8);

impl Progress {
    pub const COMPLETE: Self = Self(100);
    /// Written when the pipeline picks the order up.
    pub const PREPARING: Self = Self(10);
    /// Written once a checkout session exists. Provider progress is reported on top of this.
    pub const SESSION_READY: Self = Self(40);

    pub fn new(percent: u32) -> Self {
        Self(u8::try_from(percent.min(100)).unwrap_or(100))
    }

    /// Maps a provider progress report onto the order's progress scale.
    pub fn from_provider(percent: u32) -> Self {
        Self::new(u32::from(Self::SESSION_READY.0).saturating_add(percent))
    }

    pub fn value(&self) -> u8 {
        self.0
    }

    pub fn is_complete(&self) -> bool {
        self.0 == 100
    }
}

impl Display for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}%", self.0)
    }
}

//--------------------------------------        Order        ---------------------------------------------------------
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: OrderId,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub payment_type: PaymentMethod,
    #[serde(default)]
    pub amount: Amount,
    #[serde(default)]
    pub phone_number: String,
    #[serde(default)]
    pub status: OrderStatusType,
    #[serde(default)]
    pub progress: Progress,
    #[serde(default)]
    pub payment_url: String,
    #[serde(default)]
    pub qr_code: String,
    #[serde(default)]
    pub message: String,
    /// The order id assigned by the payment provider
    #[serde(default, rename = "orderId")]
    pub external_order_id: String,
}

impl Order {
    pub fn new<S: Into<String>>(id: OrderId, user_id: S, amount: Amount) -> Self {
        Self { id, user_id: user_id.into(), amount, ..Default::default() }
    }

    pub fn with_payment_type(mut self, method: PaymentMethod) -> Self {
        self.payment_type = method;
        self
    }

    pub fn with_phone_number<S: Into<String>>(mut self, phone: S) -> Self {
        self.phone_number = phone.into();
        self
    }

    pub fn with_status(mut self, status: OrderStatusType) -> Self {
        self.status = status;
        self
    }

    pub fn with_payment_url<S: Into<String>>(mut self, url: S) -> Self {
        self.payment_url = url.into();
        self
    }

    /// True if the customer has been handed a checkout page that has not been verified yet.
    pub fn is_awaiting_verification(&self) -> bool {
        self.status == OrderStatusType::UserPaying && !self.payment_url.is_empty()
    }
}

//--------------------------------------     OrderFilter     ---------------------------------------------------------
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OrderFilter {
    /// `user-paying` orders that have a checkout URL to verify against.
    AwaitingVerification,
    WithStatus(OrderStatusType),
}

impl OrderFilter {
    /// Renders the filter in the record store's filter syntax.
    pub fn expression(&self) -> String {
        match self {
            OrderFilter::AwaitingVerification => "status='user-paying' && paymentUrl != ''".to_string(),
            OrderFilter::WithStatus(status) => format!("status='{status}'"),
        }
    }

    pub fn matches(&self, order: &Order) -> bool {
        match self {
            OrderFilter::AwaitingVerification => order.is_awaiting_verification(),
            OrderFilter::WithStatus(status) => order.status == *status,
        }
    }
}

//--------------------------------------     OrderUpdate     ---------------------------------------------------------
/// A partial update to an order record. Only the fields that are set are written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderUpdate {
    pub status: Option<OrderStatusType>,
    pub progress: Option<Progress>,
    pub message: Option<String>,
    pub payment_url: Option<String>,
    pub qr_code: Option<String>,
    pub external_order_id: Option<String>,
}

impl OrderUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// The terminal update written whenever an export run fails.
    pub fn reject<S: Into<String>>(message: S) -> Self {
        Self::new().status(OrderStatusType::Reject).progress(Progress::COMPLETE).message(message)
    }

    pub fn status(mut self, status: OrderStatusType) -> Self {
        self.status = Some(status);
        self
    }

    pub fn progress(mut self, progress: Progress) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn message<S: Into<String>>(mut self, message: S) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn payment_url<S: Into<String>>(mut self, url: S) -> Self {
        self.payment_url = Some(url.into());
        self
    }

    pub fn qr_code<S: Into<String>>(mut self, qr: S) -> Self {
        self.qr_code = Some(qr.into());
        self
    }

    pub fn external_order_id<S: Into<String>>(mut self, id: S) -> Self {
        self.external_order_id = Some(id.into());
        self
    }

    pub fn to_fields(&self) -> RecordFields {
        let mut fields = RecordFields::new();
        if let Some(status) = self.status {
            fields.insert("status".into(), Value::from(status.as_str()));
        }
        if let Some(progress) = self.progress {
            fields.insert("progress".into(), Value::from(progress.value()));
        }
        if let Some(message) = &self.message {
            fields.insert("message".into(), Value::from(message.as_str()));
        }
        if let Some(url) = &self.payment_url {
            fields.insert("paymentUrl".into(), Value::from(url.as_str()));
        }
        if let Some(qr) = &self.qr_code {
            fields.insert("qrCode".into(), Value::from(qr.as_str()));
        }
        if let Some(id) = &self.external_order_id {
            fields.insert("orderId".into(), Value::from(id.as_str()));
        }
        fields
    }
}

//--------------------------------------     RecordEvent     ---------------------------------------------------------
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordAction {
    Create,
    Update,
    Delete,
    #[serde(other)]
    Unknown,
}

/// A change notification from the record store's realtime feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordEvent<T> {
    pub action: RecordAction,
    pub record: T,
}

impl<T> RecordEvent<T> {
    pub fn created(record: T) -> Self {
        Self { action: RecordAction::Create, record }
    }

    pub fn is_create(&self) -> bool {
        self.action == RecordAction::Create
    }
}

//--------------------------------------  CreditTransaction  ---------------------------------------------------------
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CreditType {
    #[default]
    Add,
}

/// A credit ledger entry that is about to be appended. Ledger entries are never modified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewCreditTransaction {
    pub user_id: String,
    pub amount: Amount,
    #[serde(rename = "type")]
    pub credit_type: CreditType,
    pub description: String,
}

impl NewCreditTransaction {
    /// The credit owed to the customer for a verified order.
    pub fn deposit_for(order: &Order) -> Self {
        Self {
            user_id: order.user_id.clone(),
            amount: order.amount,
            credit_type: CreditType::Add,
            description: CREDIT_DESCRIPTION.to_string(),
        }
    }

    pub fn to_fields(&self) -> RecordFields {
        let mut fields = RecordFields::new();
        fields.insert("userId".into(), Value::from(self.user_id.as_str()));
        fields.insert("amount".into(), serde_json::to_value(self.amount).unwrap_or(Value::Null));
        fields.insert("type".into(), Value::from("ADD"));
        fields.insert("description".into(), Value::from(self.description.as_str()));
        fields
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditTransaction {
    pub id: String,
    pub user_id: String,
    pub amount: Amount,
    #[serde(rename = "type", default)]
    pub credit_type: CreditType,
    #[serde(default)]
    pub description: String,
}

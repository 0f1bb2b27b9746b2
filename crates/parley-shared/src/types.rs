use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// Private message key: assigned locally at creation, never reused
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageKey(pub Uuid);

impl MessageKey {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Uuid::parse_str(s).map(Self)
    }
}

impl Default for MessageKey {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Stable identifier of a conversation: the remote user's address or the
/// group id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId(pub String);

impl ThreadId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ThreadId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Recipients
// ---------------------------------------------------------------------------

/// A group of users sharing one conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Group {
    pub id: String,
    pub title: String,
    /// Member wallet addresses, the local user included.
    pub members: Vec<String>,
}

impl Group {
    pub fn new(title: impl Into<String>, members: Vec<String>) -> Self {
        Self {
            id: Uuid::new_v4().simple().to_string(),
            title: title.into(),
            members,
        }
    }
}

/// The other side of a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Recipient {
    User {
        address: String,
        display_name: Option<String>,
    },
    Group(Group),
}

impl Recipient {
    pub fn user(address: impl Into<String>) -> Self {
        Self::User {
            address: address.into(),
            display_name: None,
        }
    }

    pub fn thread_id(&self) -> ThreadId {
        match self {
            Self::User { address, .. } => ThreadId(address.clone()),
            Self::Group(group) => ThreadId(group.id.clone()),
        }
    }

    /// Addresses a message to this recipient must be transmitted to.
    pub fn delivery_addresses(&self, local_address: &str) -> Vec<String> {
        match self {
            Self::User { address, .. } => vec![address.clone()],
            Self::Group(group) => group
                .members
                .iter()
                .filter(|m| m.as_str() != local_address)
                .cloned()
                .collect(),
        }
    }
}

// ---------------------------------------------------------------------------
// Send state
// ---------------------------------------------------------------------------

/// Delivery progress of a message.
///
/// `LocalOnly`, `Sent`, `Failed` and `Received` are terminal: only an
/// explicit update moves a message out of them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum SendState {
    LocalOnly,
    Sending,
    Pending,
    Sent,
    Failed,
    Received,
}

impl SendState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LocalOnly => "local_only",
            Self::Sending => "sending",
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Received => "received",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::LocalOnly | Self::Sent | Self::Failed | Self::Received
        )
    }
}

impl fmt::Display for SendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SendState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local_only" => Ok(Self::LocalOnly),
            "sending" => Ok(Self::Sending),
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            "received" => Ok(Self::Received),
            other => Err(format!("unknown send state: {other}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Ledger confirmation status of a payment, carried inside the payload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PaymentStatus {
    Unconfirmed,
    Confirmed,
    Error,
}

impl PaymentStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Unconfirmed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Payment {
    /// Set once the ledger accepted the signed transaction.
    pub tx_hash: Option<String>,
    pub from_address: String,
    pub to_address: String,
    /// Amount in the ledger's smallest unit, hex encoded ("0x...").
    pub value: String,
    pub status: PaymentStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PaymentRequest {
    pub destination_address: String,
    pub value: String,
    pub body: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum GroupControl {
    /// Sent to every member when a group is created.
    Create(Group),
}

/// Body of a message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum Payload {
    Text { body: String },
    Payment(Payment),
    PaymentRequest(PaymentRequest),
    GroupControl(GroupControl),
    /// Synthetic marker inserted between messages far apart in time.
    Timestamp,
}

impl Payload {
    pub fn text(body: impl Into<String>) -> Self {
        Self::Text { body: body.into() }
    }

    pub fn is_timestamp_marker(&self) -> bool {
        matches!(self, Self::Timestamp)
    }

    pub fn as_payment(&self) -> Option<&Payment> {
        match self {
            Self::Payment(p) => Some(p),
            _ => None,
        }
    }

    /// Short tag stored next to the JSON body for filtering in SQL.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::Payment(_) => "payment",
            Self::PaymentRequest(_) => "payment_request",
            Self::GroupControl(_) => "group_control",
            Self::Timestamp => "timestamp",
        }
    }
}

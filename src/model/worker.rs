use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

/// Unique ID of a worker as assigned by the engine.
///
/// Both GPU primaries and standby resources are workers.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(pub String);

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl From<&str> for WorkerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// GPU type and size, e.g. `"a100-80g"`.
///
/// Warm pool entries and race offers are matched on exact equality.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceClass(pub String);

impl std::fmt::Display for ResourceClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl From<&str> for ResourceClass {
    fn from(class: &str) -> Self {
        Self(class.to_string())
    }
}

/// How to reach a worker over the remote execution transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
    /// Opaque reference to the credential, for SSH a private key
    /// path. Never the secret itself.
    pub credentials_ref: Option<String>,
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Provisioning,
    Ready,
    Degraded,
    Failed,
    Destroyed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    /// Marketplace-side identifier of the instance.
    pub handle: String,
    pub endpoint: Endpoint,
    pub resource_class: ResourceClass,
    pub state: WorkerState,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A rentable instance listed by the marketplace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: String,
    pub resource_class: ResourceClass,
    pub price_per_hour: f64,
    pub spot: bool,
    pub region: Option<String>,
}

impl Offer {
    /// Order offers cheapest first; ties keep listing order.
    pub(crate) fn sort_by_price(offers: &mut [Offer]) {
        offers.sort_by(|a, b| a.price_per_hour.total_cmp(&b.price_per_hour));
    }
}

#[test]
fn offers_sort_cheapest_first() {
    let offer = |id: &str, price| Offer {
        id: id.to_string(),
        resource_class: ResourceClass::from("a100"),
        price_per_hour: price,
        spot: true,
        region: None,
    };
    let mut offers = vec![offer("b", 2.5), offer("a", 1.1), offer("c", 1.9)];
    Offer::sort_by_price(&mut offers);
    let ids: Vec<_> = offers.iter().map(|o| o.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "c", "b"]);
}

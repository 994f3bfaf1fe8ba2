use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Service listing offered by a provider
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Service {
    pub id: String,
    pub provider_id: String,
    pub title: String,
    pub description: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// Priced tier of a service; bookings snapshot its terms at creation
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ServicePackage {
    pub id: String,
    pub service_id: String,
    pub name: String,
    pub price: i64,
    pub delivery_days: i64,
    pub revisions_allowed: i64,
}

/// Create service request
#[derive(Debug, Clone, Deserialize)]
pub struct CreateServiceRequest {
    pub title: String,
    pub description: String,
    pub packages: Vec<PackageInput>,
}

/// Package definition inside a create service request
#[derive(Debug, Clone, Deserialize)]
pub struct PackageInput {
    pub name: String,
    pub price: i64,
    pub delivery_days: i64,
    #[serde(default)]
    pub revisions_allowed: i64,
}

/// Service with its packages, as returned by the catalog
#[derive(Debug, Clone, Serialize)]
pub struct ServiceDetail {
    #[serde(flatten)]
    pub service: Service,
    pub packages: Vec<ServicePackage>,
}

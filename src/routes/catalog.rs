use std::collections::HashSet;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;

use crate::error::{AppError, AppResult};
use crate::middleware::ProviderUser;
use crate::models::{CreateServiceRequest, Service, ServiceDetail, ServicePackage};
use crate::AppState;

/// Create a service listing with its packages
pub async fn create_service(
    State(state): State<Arc<AppState>>,
    ProviderUser(user): ProviderUser,
    Json(req): Json<CreateServiceRequest>,
) -> AppResult<(StatusCode, Json<ServiceDetail>)> {
    if req.title.trim().is_empty() {
        return Err(AppError::Validation("title must not be empty".to_string()));
    }
    if req.packages.is_empty() {
        return Err(AppError::Validation(
            "at least one package is required".to_string(),
        ));
    }
    let mut seen = HashSet::new();
    for package in &req.packages {
        if package.name.trim().is_empty() {
            return Err(AppError::Validation(
                "package names must not be empty".to_string(),
            ));
        }
        if !seen.insert(package.name.trim().to_string()) {
            return Err(AppError::Validation(format!(
                "duplicate package name '{}'",
                package.name.trim()
            )));
        }
        if package.price <= 0 {
            return Err(AppError::Validation(
                "package prices must be positive".to_string(),
            ));
        }
        if package.delivery_days <= 0 {
            return Err(AppError::Validation(
                "delivery_days must be positive".to_string(),
            ));
        }
        if package.revisions_allowed < 0 {
            return Err(AppError::Validation(
                "revisions_allowed must not be negative".to_string(),
            ));
        }
    }

    let service_id = uuid::Uuid::new_v4().to_string();
    let now = Utc::now();
    let mut tx = state.db.pool().begin().await?;
    sqlx::query(
        r#"
        INSERT INTO services (id, provider_id, title, description, is_active, created_at)
        VALUES (?, ?, ?, ?, 1, ?)
        "#,
    )
    .bind(&service_id)
    .bind(&user.id)
    .bind(req.title.trim())
    .bind(&req.description)
    .bind(now)
    .execute(&mut *tx)
    .await?;
    for package in &req.packages {
        sqlx::query(
            r#"
            INSERT INTO service_packages (id, service_id, name, price, delivery_days, revisions_allowed)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(&service_id)
        .bind(package.name.trim())
        .bind(package.price)
        .bind(package.delivery_days)
        .bind(package.revisions_allowed)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;

    let detail = load_service(&state, &service_id).await?;
    Ok((StatusCode::CREATED, Json(detail)))
}

/// List active services
pub async fn list_services(
    State(state): State<Arc<AppState>>,
) -> AppResult<Json<Vec<ServiceDetail>>> {
    let services: Vec<Service> =
        sqlx::query_as("SELECT * FROM services WHERE is_active = 1 ORDER BY created_at DESC")
            .fetch_all(state.db.pool())
            .await?;

    let mut details = Vec::with_capacity(services.len());
    for service in services {
        let packages = load_packages(&state, &service.id).await?;
        details.push(ServiceDetail { service, packages });
    }
    Ok(Json(details))
}

/// Get one service with its packages
pub async fn get_service(
    State(state): State<Arc<AppState>>,
    Path(service_id): Path<String>,
) -> AppResult<Json<ServiceDetail>> {
    let detail = load_service(&state, &service_id).await?;
    Ok(Json(detail))
}

async fn load_service(state: &AppState, service_id: &str) -> AppResult<ServiceDetail> {
    let service: Service = sqlx::query_as("SELECT * FROM services WHERE id = ?")
        .bind(service_id)
        .fetch_optional(state.db.pool())
        .await?
        .ok_or(AppError::ServiceNotFound)?;
    let packages = load_packages(state, service_id).await?;
    Ok(ServiceDetail { service, packages })
}

async fn load_packages(state: &AppState, service_id: &str) -> AppResult<Vec<ServicePackage>> {
    let packages = sqlx::query_as(
        "SELECT * FROM service_packages WHERE service_id = ? ORDER BY price ASC",
    )
    .bind(service_id)
    .fetch_all(state.db.pool())
    .await?;
    Ok(packages)
}

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gigmarket::config::Config;
use gigmarket::db::Database;
use gigmarket::routes;
use gigmarket::services::{
    BookingService, EmailChannel, EscrowService, HttpGateway, MockGateway, Notifier,
    PaymentGateway, SmsChannel, WebChannel,
};
use gigmarket::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gigmarket=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::load()?;
    tracing::info!("Configuration loaded");

    // Initialize database
    let db = Database::connect(&config.database_url).await?;
    db.run_migrations().await?;
    tracing::info!("Database initialized");

    // Initialize payment gateway
    let gateway: Arc<dyn PaymentGateway> = if config.gateway.mock {
        tracing::warn!("Running in MOCK payment mode - set gateway.base_url and gateway.api_key for real payments");
        Arc::new(MockGateway::new(&config.gateway.webhook_secret))
    } else {
        tracing::info!("Payment gateway connected: {}", config.gateway.base_url);
        Arc::new(HttpGateway::new(&config.gateway)?)
    };

    // Initialize notification channels
    let notifier = Notifier::new(vec![
        Arc::new(EmailChannel),
        Arc::new(SmsChannel),
        Arc::new(WebChannel),
    ]);

    // Create shared application state
    let state = Arc::new(AppState {
        db,
        gateway,
        notifier,
        config: config.clone(),
    });

    // Spawn background task for deadline expiry and outbound payment sweeps
    let bg_state = state.clone();
    tokio::spawn(async move {
        booking_sweep_task(bg_state).await;
    });

    // Build router
    let app = routes::router(state);

    // Start server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

/// Background task for time-driven work: expired response deadlines,
/// queued refunds, due payouts, and notification redelivery
async fn booking_sweep_task(state: Arc<AppState>) {
    let mut interval =
        tokio::time::interval(std::time::Duration::from_secs(state.config.sweep_interval_secs));

    loop {
        interval.tick().await;

        match BookingService::expire_response_deadlines(&state).await {
            Ok(count) => {
                if count > 0 {
                    tracing::info!("Expired {} unanswered booking requests", count);
                }
            }
            Err(e) => {
                tracing::error!("Error expiring response deadlines: {}", e);
            }
        }

        match EscrowService::process_pending_refunds(&state).await {
            Ok(count) => {
                if count > 0 {
                    tracing::info!("Submitted {} pending refunds", count);
                }
            }
            Err(e) => {
                tracing::error!("Error processing pending refunds: {}", e);
            }
        }

        match EscrowService::process_due_payouts(&state).await {
            Ok(count) => {
                if count > 0 {
                    tracing::info!("Submitted {} due payouts", count);
                }
            }
            Err(e) => {
                tracing::error!("Error processing due payouts: {}", e);
            }
        }

        match state.notifier.retry_undelivered(&state.db).await {
            Ok(count) => {
                if count > 0 {
                    tracing::info!("Redelivered {} notifications", count);
                }
            }
            Err(e) => {
                tracing::error!("Error retrying notification delivery: {}", e);
            }
        }
    }
}

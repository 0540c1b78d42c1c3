//! Newsroom Board watcher
//!
//! Signs in, opens the lead board and the calendar, and logs every change the hosted service
//! reports until interrupted.

use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use newsroom_board::auth::SessionContext;
use newsroom_board::backend::{Backend, RestBackend};
use newsroom_board::config::Config;
use newsroom_board::errors::SyncError;
use newsroom_board::pages::{Calendar, LeadBoard, PageEvent};

/// Pause before reconnecting a page whose change stream ended.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize logging
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    if config.log_json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    tracing::info!("Starting Newsroom Board watcher");
    tracing::info!("Backend: {}", config.backend_url);
    tracing::info!("Session path: {:?}", config.session_path);

    if config.service_key.is_none() {
        tracing::debug!("No service key configured (NEWSROOM_SERVICE_KEY); user directory unavailable");
    }

    let backend: Arc<dyn Backend> = RestBackend::new(&config)?;
    let session = SessionContext::new(backend, Some(config.session_path.clone()));
    session.watch();

    sign_in(&session, &config).await?;
    match session.current_user() {
        Some(user) => tracing::info!(name = %user.name, role = %user.role, "Signed in"),
        None => tracing::warn!("Signed in without a profile; pages stay read-only"),
    }

    let mut leads = LeadBoard::open(session.clone()).await?;
    let mut calendar = Calendar::open(session.clone()).await?;
    tracing::info!(
        leads = leads.leads().len(),
        events = calendar.events().len(),
        "Pages open"
    );

    loop {
        tokio::select! {
            event = leads.next_event() => {
                if !handle_lead_event(&mut leads, event).await {
                    break;
                }
            }
            event = calendar.next_event() => {
                if !handle_calendar_event(&mut calendar, event).await {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
        }
    }

    leads.teardown();
    calendar.teardown();
    session.shutdown();
    tracing::info!("Watcher stopped");

    Ok(())
}

/// Resume the persisted session, or log in with the configured display name.
async fn sign_in(session: &Arc<SessionContext>, config: &Config) -> Result<(), SyncError> {
    if let Some(identity) = session.restore().await? {
        tracing::info!(user_id = %identity.id, "Resumed persisted session");
        return Ok(());
    }

    let (Some(name), Some(password)) = (&config.login_name, &config.login_password) else {
        return Err(SyncError::Config(
            "No persisted session; set NEWSROOM_LOGIN_NAME and NEWSROOM_LOGIN_PASSWORD".to_string(),
        ));
    };
    session.login(name, password).await?;
    Ok(())
}

/// Log one lead board event. Returns `false` once the page is closed.
async fn handle_lead_event(board: &mut LeadBoard, event: PageEvent) -> bool {
    match event {
        PageEvent::Changed { id } => match board.get(&id) {
            Some(lead) => tracing::info!(
                id = %id,
                title = %lead.title,
                status = lead.status.label(),
                reporter = %lead.reporter,
                "Lead changed"
            ),
            None => tracing::info!(id = %id, "Lead removed"),
        },
        PageEvent::Reverted { id } => tracing::warn!(id = %id, "Lead edit reverted"),
        PageEvent::Reloaded => tracing::info!(leads = board.leads().len(), "Leads reloaded"),
        PageEvent::Error(surface) => {
            tracing::error!(detail = surface.message().unwrap_or_default(), "Lead board error")
        }
        PageEvent::Disconnected => {
            tracing::warn!("Lead change stream ended, reconnecting");
            tokio::time::sleep(RECONNECT_DELAY).await;
            match board.reload().await {
                Ok(()) => board.clear_error(),
                Err(surface) => tracing::error!(?surface, "Lead board reload failed"),
            }
        }
        PageEvent::Closed => return false,
    }
    true
}

/// Log one calendar event. Returns `false` once the page is closed.
async fn handle_calendar_event(calendar: &mut Calendar, event: PageEvent) -> bool {
    match event {
        PageEvent::Changed { id } => match calendar.get(&id) {
            Some(event) => tracing::info!(
                id = %id,
                title = %event.title,
                start = %event.start,
                end = %event.end,
                reporter = %event.reporter,
                "Event changed"
            ),
            None => tracing::info!(id = %id, "Event removed"),
        },
        PageEvent::Reverted { id } => tracing::warn!(id = %id, "Event move reverted"),
        PageEvent::Reloaded => tracing::info!(events = calendar.events().len(), "Events reloaded"),
        PageEvent::Error(surface) => {
            tracing::error!(detail = surface.message().unwrap_or_default(), "Calendar error")
        }
        PageEvent::Disconnected => {
            tracing::warn!("Event change stream ended, reconnecting");
            tokio::time::sleep(RECONNECT_DELAY).await;
            match calendar.reload().await {
                Ok(()) => calendar.clear_error(),
                Err(surface) => tracing::error!(?surface, "Calendar reload failed"),
            }
        }
        PageEvent::Closed => return false,
    }
    true
}

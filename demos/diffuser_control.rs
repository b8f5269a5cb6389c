use aromatech_ble::{Credential, DiffuserSession, Result, SessionConfig, DEVICE_NAME_PATTERNS};
use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let password = std::env::args().nth(1).unwrap_or_else(|| "8888".to_string());
    let credential: Credential = password.parse()?;

    info!("AromaTech diffuser control example");
    info!("Searching for diffusers ({} known models)...", DEVICE_NAME_PATTERNS.len());

    let session = match DiffuserSession::connect_first(credential, SessionConfig::default()).await
    {
        Ok(session) => session,
        Err(e) => {
            error!("Failed to connect: {}", e);
            return Err(e);
        }
    };

    let Some(identity) = session.identity() else {
        warn!("Connected without an identity");
        return Ok(());
    };
    info!("Connected to {} ({})", identity.device_name, identity.product_name);
    info!(
        "  Protocol {} ({:?}), max intensity {}, {} reservoir(s)",
        identity.protocol_version,
        identity.classification,
        identity.max_intensity,
        identity.reservoir_count
    );

    let state = session.state();
    info!(
        "  Power: {}, intensity {}",
        if state.power { "ON" } else { "OFF" },
        state.current_intensity
    );

    info!("Powering on...");
    session.set_power(true).await?;
    sleep(Duration::from_secs(2)).await;

    for level in 1..=identity.max_intensity {
        info!("Setting intensity to {}", level);
        if let Err(e) = session.set_intensity(level).await {
            error!("Failed to set intensity: {}", e);
            break;
        }
        sleep(Duration::from_secs(3)).await;
    }

    session.request_status().await?;
    sleep(Duration::from_secs(1)).await;
    for oil in &session.state().oils {
        match oil.percentage() {
            Some(pct) => info!("  {}: {}%", oil.name, pct),
            None => info!("  {}: {} left", oil.name, oil.remaining),
        }
    }

    info!("Powering off...");
    session.set_power(false).await?;

    session.disconnect().await?;
    info!("Done");
    Ok(())
}

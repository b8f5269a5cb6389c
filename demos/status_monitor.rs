use aromatech_ble::{DeviceConfig, DiffuserSession, Result, SessionConfig, SessionState};
use std::time::Duration;
use tokio::time::interval;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    let Some(address) = std::env::args().nth(1) else {
        error!("usage: status_monitor <address> [password]");
        return Ok(());
    };
    let mut device = DeviceConfig::new(address);
    if let Some(password) = std::env::args().nth(2) {
        device.password = password;
    }

    info!("AromaTech status monitor");
    let session = DiffuserSession::open(&device, SessionConfig::default()).await?;
    info!("Press Ctrl+C to stop monitoring");

    let mut sessions = session.subscribe_session();
    tokio::spawn(async move {
        while sessions.changed().await.is_ok() {
            let state = *sessions.borrow();
            match state {
                SessionState::Disconnected => warn!("Session: {}", state),
                _ => info!("Session: {}", state),
            }
        }
    });

    let mut ticker = interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if session.is_ready() {
                    if let Err(e) = session.request_status().await {
                        warn!("Status request failed: {}", e);
                    }
                }

                println!("\n--- {} ---", device.address);
                for (key, value) in session.snapshot().attributes() {
                    println!("{key:>28}: {value:?}");
                }
                println!("{:>28}: {}", "decode_anomalies", session.decode_anomalies());
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Stopping monitor");
                break;
            }
        }
    }

    session.disconnect().await?;
    Ok(())
}

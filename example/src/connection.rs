use std::env::var;
use pgline::{Config, Connection, Notification, Result, Verbosity};

pub async fn main() -> Result<()> {
    if let Ok(url) = var("DATABASE_URL") {
        let conn = Connection::connect(&url).await?;
        conn.execute("SELECT 1").await?;
        conn.close().await;
    }

    let conn = Connection::connect_env().await?;
    conn.execute("SELECT 1").await?;
    conn.close().await;

    // protocol trace through `log`
    let config = Config::from_env()?.verbosity(Verbosity::Frames);
    let conn = Connection::connect_lazy_with(config);
    let mut notifications = conn.subscribe();

    conn.execute("DO $$ BEGIN RAISE NOTICE 'hello from server'; END $$").await?;
    conn.close().await;

    while let Some(notification) = notifications.recv().await {
        match notification {
            Notification::Connected { backend_key } => tracing::info!("connected: {backend_key:?}"),
            Notification::ParameterStatus { name, value } => tracing::debug!("{name} = {value}"),
            Notification::Notice(notice) => tracing::info!("{notice}"),
            Notification::Error(err) => tracing::error!("{err}"),
            Notification::Closed => break,
        }
    }

    Ok(())
}

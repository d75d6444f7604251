use std::sync::Arc;

use dunner::channels::{ChannelError, HttpDrafting, HttpMail, HttpNotifier};
use dunner::db::InvoiceDb;
use dunner::scheduler::{run_executor, Scheduler};
use dunner::state::EngineState;
use dunner::types::load_config;
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = load_config();
    let channels = config.channels.clone();
    let drafting_url = channels
        .drafting_url
        .ok_or(ChannelError::NotConfigured("drafting"))?;
    let notify_url = channels
        .notify_url
        .ok_or(ChannelError::NotConfigured("notify"))?;
    let mail_url = channels
        .mail_url
        .ok_or(ChannelError::NotConfigured("mail"))?;
    let token = channels.api_token;

    let db = match &config.database_path {
        Some(path) => InvoiceDb::open_at(path.into())?,
        None => InvoiceDb::open()?,
    };
    log::info!("Database ready");

    let state = Arc::new(EngineState::new(
        db,
        config,
        Arc::new(HttpDrafting::new(drafting_url, token.clone())?),
        Arc::new(HttpNotifier::new(notify_url, token.clone())?),
        Arc::new(HttpMail::new(mail_url, token)?),
    ));

    let (sender, receiver) = mpsc::channel(32);
    let scheduler = Scheduler::new(Arc::clone(&state), sender);

    tokio::spawn(async move {
        scheduler.run().await;
    });
    let executor = tokio::spawn(run_executor(Arc::clone(&state), receiver));

    tokio::signal::ctrl_c().await?;
    log::info!("Shutting down");
    executor.abort();
    Ok(())
}

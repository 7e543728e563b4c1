// Entry point for the assurance contract service and its admin commands
use assurance_engine::chain::ElectrumClient;
use assurance_engine::cli::{Command, Opt};
use assurance_engine::config::Settings;
use assurance_engine::core::address::Address;
use assurance_engine::core::monetary::conversions::format_coins;
use assurance_engine::core::script::script_hash;
use assurance_engine::engine::{campaign_status, Engine};
use assurance_engine::network::Server;
use assurance_engine::storage::{Recipient, RecordStore};
use assurance_engine::utils::current_timestamp;
use clap::Parser;
use data_encoding::HEXLOWER;
use log::{error, info};
use std::process;
use std::sync::mpsc;
use std::sync::Arc;

const SECONDS_PER_DAY: i64 = 86_400;

fn main() {
    let opt = Opt::parse();

    // I need the settings before the logger, since they carry the log level
    let settings = match Settings::load(opt.config.as_deref()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("Error: {e}");
            process::exit(1);
        }
    };
    let level = settings.log_level_filter().unwrap_or(log::LevelFilter::Info);
    env_logger::builder()
        .filter_level(level)
        .parse_default_env()
        .init();

    if let Err(e) = run_command(opt.command, &settings) {
        error!("Error: {e}");
        process::exit(1);
    }
}

fn connect_engine(settings: &Settings) -> Result<Arc<Engine>, Box<dyn std::error::Error>> {
    let store = RecordStore::open(&settings.database)?;
    let (sender, receiver) = mpsc::channel();
    let client = ElectrumClient::new(
        settings.electrum_servers.clone(),
        settings.request_timeout(),
        sender,
    )?;
    client.connect()?;

    let engine = Arc::new(Engine::new(store, Arc::new(client), settings.network));
    // Chain notifications are handled in the background for as long as the client lives
    Engine::spawn_notification_dispatcher(Arc::clone(&engine), receiver);
    Ok(engine)
}

fn run_command(command: Command, settings: &Settings) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Command::Serve => {
            let engine = connect_engine(settings)?;
            // I pick up subscriptions and pending fulfillments from the last run first
            engine.resume()?;
            info!(
                "Serving {} campaigns on the {} network",
                engine.store().list_campaigns()?.len(),
                engine.network()
            );
            Server::new(engine).run(&settings.listen_addr)?;
        }
        Command::AddCampaign {
            title,
            recipients,
            starts_at,
            days,
        } => {
            let starts_at = match starts_at {
                Some(starts_at) => starts_at,
                None => current_timestamp()?,
            };
            let expires_at = starts_at + i64::from(days) * SECONDS_PER_DAY;
            let recipients = recipients
                .into_iter()
                .enumerate()
                .map(|(position, recipient)| Recipient {
                    name: format!("Recipient {}", position + 1),
                    address: recipient.address,
                    satoshis: recipient.satoshis,
                })
                .collect();

            let store = RecordStore::open(&settings.database)?;
            let campaign = store.add_campaign(&title, starts_at, expires_at, recipients)?;
            println!(
                "Created campaign #{} requesting {} BCH",
                campaign.id,
                format_coins(campaign.requested_satoshis())
            );
        }
        Command::Campaigns => {
            let store = RecordStore::open(&settings.database)?;
            for campaign in store.list_campaigns()? {
                let state = match store.get_fulfillment(campaign.id)? {
                    Some(_) => "fulfilled",
                    None => "open",
                };
                println!(
                    "#{} {} ({} BCH, {state}, {} to {})",
                    campaign.id,
                    campaign.title,
                    format_coins(campaign.requested_satoshis()),
                    campaign.starts_at,
                    campaign.expires_at
                );
            }
        }
        Command::Status { campaign_id } => {
            let store = RecordStore::open(&settings.database)?;
            let status = campaign_status(&store, campaign_id)?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Contributions { campaign_id } => {
            let store = RecordStore::open(&settings.database)?;
            for contribution in store.list_contributions(campaign_id)? {
                let state = match &contribution.revocation {
                    Some(revocation) => format!(
                        "revoked by {}",
                        revocation.spending_tx_hash.as_deref().unwrap_or("unknown")
                    ),
                    None => "active".to_string(),
                };
                println!(
                    "#{} campaign #{} {} sats from {:?} ({state})",
                    contribution.id,
                    contribution.campaign_id,
                    contribution.satoshis,
                    contribution.alias
                );
            }
        }
        Command::RetryFulfillment { campaign_id } => {
            let engine = connect_engine(settings)?;
            match engine.retry_fulfillment(campaign_id)? {
                Some(fulfillment) => println!("Broadcast {}", fulfillment.transaction_hash),
                None => match engine.store().get_fulfillment(campaign_id)? {
                    Some(fulfillment) => {
                        println!("Already fulfilled by {}", fulfillment.transaction_hash)
                    }
                    None => println!("Campaign #{campaign_id} is not fully funded yet"),
                },
            }
        }
        Command::Address { address } => {
            let address = Address::parse(&address)?;
            let locking_script = address.locking_script();
            println!("CashAddr:       {}", address.to_cashaddr());
            println!("Legacy:         {}", address.to_legacy());
            println!("Locking script: {}", HEXLOWER.encode(&locking_script));
            println!("Script hash:    {}", script_hash(&locking_script));
        }
    }
    Ok(())
}

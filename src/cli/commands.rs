use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::str::FromStr;

/// A campaign recipient given as `address:satoshis`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecipientArg {
    pub address: String,
    pub satoshis: u64,
}

impl FromStr for RecipientArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // cashaddr prefixes contain a colon too, so split on the last one
        let (address, satoshis) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("Invalid recipient: {s}. Use ADDRESS:SATOSHIS"))?;
        let satoshis = satoshis
            .parse::<u64>()
            .map_err(|e| format!("Invalid satoshi amount in {s}: {e}"))?;
        if address.is_empty() {
            return Err(format!("Invalid recipient: {s}. Address is missing"));
        }
        Ok(RecipientArg {
            address: address.to_string(),
            satoshis,
        })
    }
}

#[derive(Debug, Parser)]
#[command(name = "assurance-engine", about = "Assurance contract crowdfunding service")]
pub struct Opt {
    #[arg(long = "config", global = true, help = "TOML settings file")]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    #[command(name = "serve", about = "Run the pledge service")]
    Serve,
    #[command(name = "add-campaign", about = "Create a campaign")]
    AddCampaign {
        #[arg(help = "Campaign title")]
        title: String,
        #[arg(
            long = "recipient",
            required = true,
            help = "Recipient as ADDRESS:SATOSHIS, may be repeated"
        )]
        recipients: Vec<RecipientArg>,
        #[arg(long = "starts-at", help = "Unix time pledges open (default: now)")]
        starts_at: Option<i64>,
        #[arg(
            long = "days",
            default_value_t = 30,
            help = "Days the campaign accepts pledges"
        )]
        days: u32,
    },
    #[command(name = "campaigns", about = "List campaigns")]
    Campaigns,
    #[command(name = "status", about = "Show the funding state of a campaign")]
    Status {
        #[arg(help = "Campaign id")]
        campaign_id: u64,
    },
    #[command(name = "contributions", about = "List contributions")]
    Contributions {
        #[arg(long = "campaign", help = "Only show this campaign")]
        campaign_id: Option<u64>,
    },
    #[command(
        name = "retry-fulfillment",
        about = "Broadcast the contract of a funded campaign again"
    )]
    RetryFulfillment {
        #[arg(help = "Campaign id")]
        campaign_id: u64,
    },
    #[command(
        name = "address",
        about = "Show the locking script and script hash of an address"
    )]
    Address {
        #[arg(help = "CashAddr or legacy address")]
        address: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recipient_with_cashaddr_prefix() {
        let recipient: RecipientArg =
            "bitcoincash:qr6m7j9njldwwzlg9v7v53unlr4jkmx6eylep8ekg2:5000"
                .parse()
                .unwrap();
        assert_eq!(
            recipient.address,
            "bitcoincash:qr6m7j9njldwwzlg9v7v53unlr4jkmx6eylep8ekg2"
        );
        assert_eq!(recipient.satoshis, 5000);

        assert!("qr6m7j9njldwwzlg9v7v53unlr4jkmx6eylep8ekg2".parse::<RecipientArg>().is_err());
        assert!(":100".parse::<RecipientArg>().is_err());
        assert!("addr:-1".parse::<RecipientArg>().is_err());
    }

    #[test]
    fn test_parse_add_campaign() {
        let opt = Opt::try_parse_from([
            "assurance-engine",
            "add-campaign",
            "New node",
            "--recipient",
            "1BpEi6DfDAUFd7GtittLSdBeYJvcoaVggu:1000",
            "--recipient",
            "1A1zP1eP5QGefi2DMPTfTL5SLmv7DivfNa:2000",
        ])
        .unwrap();
        match opt.command {
            Command::AddCampaign {
                recipients, days, ..
            } => {
                assert_eq!(recipients.len(), 2);
                assert_eq!(days, 30);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}

use crate::config::{DesiredStateFile, ToolPaths};
use crate::host::{AdvertisementFetcher, SystemHost};
use crate::luks::{DeviceInspector, MetadataFormat};
use crate::policy::decode_policy;
use crate::reconcile::Reconciler;
use clap::{Parser, Subcommand};
use eyre::{bail, Result};
use std::path::{Path, PathBuf};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    tools: ToolPaths,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Bring devices in line with the bindings in a desired state file
    Apply {
        /// YAML file with a `bindings` list
        #[arg(value_name = "FILE")]
        desired: PathBuf,

        /// Report what would change without changing anything
        #[arg(long)]
        check: bool,

        /// Directory key files are looked up in, overriding the file's
        #[arg(long, value_name = "DIR", env = "CLEVIS_DATA_DIR")]
        data_dir: Option<PathBuf>,
    },
    /// Show the keyslots and clevis bindings of a device
    Status {
        /// LUKS device, e.g. `/dev/sda2`
        #[arg(value_name = "DEVICE")]
        device: String,
    },
    /// Fetch a tang server's advertisement and show its key thumbprints
    Adv {
        /// Server URL, e.g. `http://tang.example`
        #[arg(value_name = "URL")]
        server: String,
    },
}

impl Cli {
    pub fn new() -> Self {
        Cli::parse()
    }

    pub fn run(&self) -> Result<&Self> {
        log::debug!("{:?}", self);
        match &self.command {
            Commands::Apply {
                desired,
                check,
                data_dir,
            } => self.apply(desired, *check, data_dir.as_deref())?,
            Commands::Status { device } => self.status(device)?,
            Commands::Adv { server } => self.adv(server)?,
        };
        Ok(self)
    }

    fn apply(&self, desired: &Path, check: bool, data_dir: Option<&Path>) -> Result<()> {
        let desired = DesiredStateFile::load(desired)?;
        let bindings = desired.bindings(data_dir)?;
        let host = SystemHost::new(&self.tools)?;
        let report = Reconciler::new(&host).dry_run(check).reconcile(&bindings);
        println!(
            "{}",
            serde_json::to_string_pretty(&report.summary(&desired.bindings))?
        );
        if report.failed() {
            bail!(report.message());
        }
        Ok(())
    }

    fn status(&self, device: &str) -> Result<()> {
        let host = SystemHost::new(&self.tools)?;
        let inspector = DeviceInspector::new(&host);
        let metadata = inspector.classify(device, false)?;
        let occupied = inspector.occupied_slots(&metadata)?;
        println!("{}: {}", device, metadata.luks_type());
        println!(
            "occupied keyslots: {}",
            occupied
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(" ")
        );
        for slot in inspector.bound_slots(&metadata)? {
            let policy = decode_policy(&metadata.read_blob(&host, slot)?)?;
            println!(
                "{}: {} {} ({} key(s))",
                slot,
                policy.pin(),
                serde_json::to_string(&policy.config.without_adv())?,
                policy.keys.len()
            );
        }
        Ok(())
    }

    fn adv(&self, server: &str) -> Result<()> {
        let host = SystemHost::new(&self.tools)?;
        for thumbprint in host.fetch(server)?.thumbprints()? {
            println!("{}", thumbprint);
        }
        Ok(())
    }
}

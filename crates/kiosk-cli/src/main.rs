use anyhow::{bail, Context, Result};
use chrono::{DateTime, FixedOffset};
use clap::{ArgGroup, Parser, Subcommand};
use kiosk_backend::{run_guards, AttendanceBackend, ConvexBackend, ManualClockIn};
use kiosk_core::IdentityRef;
use kiosk_hw::{device_fingerprint, encode_jpeg, CameraSource, DeviceTraits};
use std::path::PathBuf;

const PHOTO_JPEG_QUALITY: u8 = 85;

#[derive(Parser)]
#[command(name = "kiosk", about = "Barber kiosk attendance CLI")]
struct Cli {
    /// Convex deployment URL
    #[arg(long, env = "KIOSK_BACKEND_URL", global = true)]
    backend_url: Option<String>,

    /// Branch code of this kiosk
    #[arg(long, env = "KIOSK_BRANCH_CODE", global = true)]
    branch_code: Option<String>,

    /// V4L2 device used by the kiosk (part of the fingerprint)
    #[arg(long, env = "KIOSK_CAMERA_DEVICE", default_value = "/dev/video0", global = true)]
    camera: String,

    /// Use this fingerprint instead of computing one
    #[arg(long, env = "KIOSK_DEVICE_FINGERPRINT", global = true)]
    fingerprint: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show attendance daemon status
    Status {
        /// Query the system bus instead of the session bus
        #[arg(long)]
        system: bool,
    },
    /// List video capture devices
    Devices,
    /// Print this device's registration fingerprint
    Fingerprint,
    /// Run the kiosk activation checks without starting the camera
    Probe,
    /// Clock in without a face match
    #[command(group(ArgGroup::new("who").required(true).args(["barber", "user"])))]
    Manual {
        /// Barber id
        #[arg(long)]
        barber: Option<String>,
        /// Staff user id
        #[arg(long)]
        user: Option<String>,
        /// Branch id; resolved from the branch code when omitted
        #[arg(long, env = "KIOSK_BRANCH_ID")]
        branch_id: Option<String>,
        /// Photo to attach as evidence
        #[arg(long)]
        photo: Option<PathBuf>,
    },
}

// `#[zbus::proxy]` generates both `KioskProxy` (async) and `KioskProxyBlocking`.
#[zbus::proxy(
    interface = "org.barbershop.Kiosk1",
    default_service = "org.barbershop.Kiosk1",
    default_path = "/org/barbershop/Kiosk1"
)]
trait Kiosk {
    async fn status(&self) -> zbus::Result<String>;
    async fn phase(&self) -> zbus::Result<String>;
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Status { system } => {
            let conn = if *system {
                zbus::Connection::system().await?
            } else {
                zbus::Connection::session().await?
            };
            let proxy = KioskProxy::new(&conn).await?;
            let status = proxy.status().await.context("attendanced is not running")?;
            let value: serde_json::Value = serde_json::from_str(&status)?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Commands::Devices => {
            let devices = CameraSource::list_devices();
            if devices.is_empty() {
                println!("No video capture devices found");
            }
            for d in devices {
                println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
            }
        }
        Commands::Fingerprint => {
            println!("{}", fingerprint(&cli));
        }
        Commands::Probe => {
            let backend = backend(&cli)?;
            let device = fingerprint(&cli);
            let session = run_guards(&backend, cli.branch_code.as_deref(), &device).await?;
            let policy = session.config.thresholds();
            println!("Branch:       {} ({})", session.branch_name.as_deref().unwrap_or("-"), session.branch_id);
            println!("Device ID:    {device}");
            println!("Enrollments:  {}", session.enrollments.len());
            println!("Liveness:     {}", if session.config.liveness_required { "required" } else { "off" });
            println!("Thresholds:   review {:.2}, auto-approve {:.2}", policy.admin_review, policy.auto_approve);
        }
        Commands::Manual {
            barber,
            user,
            branch_id,
            photo,
        } => {
            let identity = manual_identity(barber.clone(), user.clone())?;
            let backend = backend(&cli)?;
            let branch_id = match branch_id {
                Some(id) => id.clone(),
                None => resolve_branch(&backend, cli.branch_code.as_deref()).await?,
            };

            let photo = match photo {
                Some(path) => {
                    let image = image::open(path)
                        .with_context(|| format!("cannot read photo {}", path.display()))?
                        .to_rgb8();
                    let jpeg = encode_jpeg(&image, PHOTO_JPEG_QUALITY)?;
                    Some(backend.store_photo(jpeg).await?)
                }
                None => None,
            };

            let receipt = backend
                .clock_in_manual(&ManualClockIn {
                    identity: identity.clone(),
                    branch_id,
                    photo,
                    device_fingerprint: Some(fingerprint(&cli)),
                })
                .await?;
            tracing::info!(%identity, "manual clock-in recorded");
            println!(
                "Clocked in {} at {} ({})",
                identity,
                format_pht(receipt.clock_in_time),
                receipt.status.as_deref().unwrap_or("pending")
            );
        }
    }

    Ok(())
}

fn backend(cli: &Cli) -> Result<ConvexBackend> {
    let Some(url) = cli.backend_url.as_deref() else {
        bail!("Backend URL required. Set KIOSK_BACKEND_URL or pass --backend-url.");
    };
    Ok(ConvexBackend::new(url)?)
}

fn fingerprint(cli: &Cli) -> String {
    cli.fingerprint
        .clone()
        .unwrap_or_else(|| device_fingerprint(&DeviceTraits::collect(&cli.camera)))
}

fn manual_identity(barber: Option<String>, user: Option<String>) -> Result<IdentityRef> {
    match (barber, user) {
        (Some(id), None) => Ok(IdentityRef::Barber(id)),
        (None, Some(id)) => Ok(IdentityRef::StaffUser(id)),
        _ => bail!("pass exactly one of --barber or --user"),
    }
}

async fn resolve_branch(backend: &dyn AttendanceBackend, code: Option<&str>) -> Result<String> {
    let Some(code) = code else {
        bail!("Branch required. Pass --branch-id or set KIOSK_BRANCH_CODE.");
    };
    match backend.branch_by_code(code).await? {
        Some(branch) => Ok(branch.id),
        None => bail!("Branch \"{code}\" not found. Check the branch code."),
    }
}

fn format_pht(epoch_ms: i64) -> String {
    match (DateTime::from_timestamp_millis(epoch_ms), FixedOffset::east_opt(8 * 3600)) {
        (Some(utc), Some(pht)) => utc.with_timezone(&pht).format("%Y-%m-%d %I:%M %p").to_string(),
        _ => epoch_ms.to_string(),
    }
}
